use egobox_kernels::{RbfKernel, EGOBOX_LOG};
use env_logger::{Builder, Env};
use ndarray::{arr2, Array2};

fn main() {
    let env = Env::new().filter_or(EGOBOX_LOG, "info");
    let mut builder = Builder::from_env(env);
    let builder = builder.target(env_logger::Target::Stdout);
    builder.try_init().ok();

    let x = arr2(&[[0.0, 0.0], [1.0, 0.5], [2.0, -1.0], [3.0, 1.0]]);

    let mut kernel = RbfKernel::<f64>::params(2)
        .ard(true)
        .inv_l(true)
        .build()
        .expect("RBF kernel");

    // a few gradient ascent steps on sum(K) in the unconstrained space
    for _ in 0..5 {
        let k = kernel.k(&x.view(), None).expect("covariance");
        let dl_dk = Array2::ones(k.dim());
        kernel.reset_gradients();
        kernel
            .update_gradients_full(&dl_dk.view(), &x.view(), None)
            .expect("gradients");
        let step = kernel.optimizer_array() + kernel.optimizer_gradient() * 0.01;
        kernel.set_optimizer_array(&step).expect("parameters update");
        println!("sum(K) = {:.4}, {}", k.sum(), kernel);
    }

    println!("{:?}", kernel.to_dict());
}

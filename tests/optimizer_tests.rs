use gradix::errors::Error;
use gradix::{Optimizer, Sgd, Tensor, CPU_F32};

fn assert_close(a: f32, b: f32) {
    assert!((a - b).abs() < 1e-5, "{a} != {b}");
}

fn filled(dims: &[usize], value: f32) -> Tensor {
    let t = Tensor::new(dims, CPU_F32).unwrap();
    t.fill(value).unwrap();
    t
}

#[test]
fn sgd_step_applies_scaled_gradient() {
    gradix::init().unwrap();
    let w = filled(&[2, 2], 1.0);
    let x = filled(&[2, 2], 1.0);
    x.set_requires_grad(false).unwrap();
    let loss = w.add(&x).unwrap().reduce_sum(&[true, true]).unwrap();
    loss.backward().unwrap();

    let mut opt = Sgd::new(vec![w.clone()], 0.1, 0.0).unwrap();
    opt.step().unwrap();
    // grad is all ones: w ← 1 − 0.1·1
    assert_close(w.get(&[0, 0]).unwrap(), 0.9);
    assert_close(w.get(&[1, 1]).unwrap(), 0.9);
    opt.free().unwrap();
    gradix::cleanup().unwrap();
}

#[test]
fn sgd_momentum_builds_velocity() {
    gradix::init().unwrap();
    let w = filled(&[2], 0.0);
    let c = filled(&[2], 1.0);
    c.set_requires_grad(false).unwrap();
    let loss = w.add(&c).unwrap().reduce_sum(&[true]).unwrap();
    loss.backward().unwrap();

    let mut opt = Sgd::new(vec![w.clone()], 1.0, 0.5).unwrap();
    // v = 0.5·0 + 1 = 1; w = 0 − 1
    opt.step().unwrap();
    assert_close(w.get(&[0]).unwrap(), -1.0);
    // gradient unchanged (no zero_grad, no second backward):
    // v = 0.5·1 + 1 = 1.5; w = −1 − 1.5
    opt.step().unwrap();
    assert_close(w.get(&[0]).unwrap(), -2.5);
    opt.free().unwrap();
    gradix::cleanup().unwrap();
}

#[test]
fn sgd_zero_grad_clears_parameter_gradients() {
    gradix::init().unwrap();
    let w = filled(&[2], 1.0);
    let c = filled(&[2], 1.0);
    let loss = w.add(&c).unwrap().reduce_sum(&[true]).unwrap();
    loss.backward().unwrap();

    let opt = Sgd::new(vec![w.clone()], 0.1, 0.0).unwrap();
    opt.zero_grad().unwrap();
    assert_close(w.grad().unwrap().get(&[0]).unwrap(), 0.0);
    opt.free().unwrap();
    gradix::cleanup().unwrap();
}

#[test]
fn sgd_rejects_frozen_parameters() {
    gradix::init().unwrap();
    let w = filled(&[2], 1.0);
    w.set_requires_grad(false).unwrap();
    assert!(matches!(
        Sgd::new(vec![w], 0.1, 0.0),
        Err(Error::RequiresGradFalse)
    ));
    gradix::cleanup().unwrap();
}

#[test]
fn sgd_step_without_gradient_fails() {
    gradix::init().unwrap();
    let w = filled(&[2], 1.0);
    let mut opt = Sgd::new(vec![w], 0.1, 0.0).unwrap();
    assert!(matches!(opt.step(), Err(Error::GradientNotAvailable)));
    opt.free().unwrap();
    gradix::cleanup().unwrap();
}

#[test]
fn learning_rate_is_adjustable() {
    gradix::init().unwrap();
    let w = filled(&[2], 1.0);
    let mut opt = Sgd::new(vec![w], 0.1, 0.9).unwrap();
    assert_close(opt.lr(), 0.1);
    assert_close(opt.momentum(), 0.9);
    opt.set_lr(0.01);
    assert_close(opt.lr(), 0.01);
    opt.free().unwrap();
    gradix::cleanup().unwrap();
}

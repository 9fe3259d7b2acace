//! Fits a linear model with SGD + momentum.
//!
//! The squared-error loss is built from the engine's own op set:
//! `loss = eᵀ @ e` where `e = X@w − y`.

use anyhow::Result;
use gradix::{Optimizer, Sgd, Tensor, CPU_F32};

fn main() -> Result<()> {
    gradix::init()?;

    // fixed design matrix and a target produced by the true weights
    let x = Tensor::new(&[8, 2], CPU_F32)?;
    x.set_requires_grad(false)?;
    x.fill_rand()?;
    let w_true = Tensor::new(&[2, 1], CPU_F32)?;
    w_true.set_requires_grad(false)?;
    {
        let mut s = w_true.storage()?.expect("leaf storage");
        s.set(&[0, 0], 2.0)?;
        s.set(&[1, 0], -1.0)?;
    }
    let y = x.gemm(&w_true)?;
    y.execute()?;

    let w = Tensor::new(&[2, 1], CPU_F32)?;
    w.fill(0.0)?;

    let mut opt = Sgd::new(vec![w.clone()], 0.05, 0.9)?;
    for epoch in 0..200 {
        let pred = x.gemm(&w)?;
        let err = pred.sub(&y)?;
        let err_t = err.transpose(&[1, 0])?;
        let loss = err_t.gemm(&err)?;

        opt.zero_grad()?;
        loss.backward()?;
        opt.step()?;

        if epoch % 50 == 0 {
            println!("epoch {epoch:3}  loss {:.6}", loss.get(&[0, 0])?);
        }
        // this iteration's graph is done; release it
        loss.free()?;
        err_t.free()?;
        err.free()?;
        pred.free()?;
    }

    println!("fitted  w = {}", w.dump()?);
    println!("target  w = {}", w_true.dump()?);

    opt.free()?;
    gradix::cleanup()?;
    Ok(())
}

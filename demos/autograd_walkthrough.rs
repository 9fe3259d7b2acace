//! Builds a tiny graph, runs it forward and backward with engine tracing
//! enabled, and prints the DOT rendering.

use anyhow::Result;
use gradix::{Tensor, CPU_F32};
use tracing_subscriber::fmt::format::FmtSpan;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_span_events(FmtSpan::CLOSE)
        .with_max_level(tracing::Level::DEBUG)
        .init();

    gradix::init()?;

    let a = Tensor::new(&[2, 3], CPU_F32)?;
    a.fill(1.0)?;
    let b = Tensor::new(&[3, 2], CPU_F32)?;
    b.fill(2.0)?;
    b.set_requires_grad(false)?;

    let prod = a.gemm(&b)?;
    let loss = prod.reduce_sum(&[true, true])?;
    println!("loss = {}", loss.get(&[0, 0])?);
    println!("product = {}", prod.dump()?);

    loss.backward()?;
    println!("grad a = {}", a.grad()?.dump()?);

    println!("{}", gradix::graph_dot()?);

    gradix::cleanup()?;
    Ok(())
}

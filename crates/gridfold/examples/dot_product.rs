//! Dot product with a simultaneous max-element search.

use std::sync::Arc;

use gridfold::prelude::*;

fn main() -> gridfold::Result<()> {
    tracing_subscriber::fmt::init();

    let n = 10_000usize;
    let a: Arc<Vec<f64>> = Arc::new((0..n).map(|i| (i as f64).sin()).collect());
    let b: Arc<Vec<f64>> = Arc::new((0..n).map(|i| (i as f64).cos()).collect());

    let engine = CpuEngine::new();
    let dot = ReduceSum::new(0.0f64);
    let peak = ReduceMaxLoc::new(f64::NEG_INFINITY, NO_LOC);

    let cfg = LaunchConfig::new(8, 256);
    engine.launch(&cfg, (&dot, &peak), move |ctx, (sum, max)| {
        let mut i = ctx.global_thread_id();
        while i < a.len() {
            let prod = a[i] * b[i];
            *sum += prod;
            max.maxloc(prod, i as i64);
            i += ctx.grid_threads();
        }
    })?;

    println!("dot(a, b)      = {:.6}", dot.get()?);
    println!("largest term   = {:.6} at index {}", peak.get()?, peak.get_loc()?);
    Ok(())
}

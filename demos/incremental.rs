//! Run twice to see the second run replay everything:
//!
//! ```sh
//! RUST_LOG=incmemo=debug cargo run --example incremental
//! ```

use std::thread;
use std::time::Duration;

use incmemo::memoize;
use tracing_subscriber::EnvFilter;

/// An expensive computation that depends on a global setting.
#[memoize]
fn simulate(steps: u32) -> f64 {
    let rate: f64 = incmemo::global("rate").unwrap_or(1.0);
    incmemo::print_stdout(&format!("simulating {steps} steps at rate {rate}\n"));
    thread::sleep(Duration::from_millis(200));
    (0..steps).fold(1.0, |acc, _| acc * (1.0 + rate / 100.0))
}

#[memoize]
fn report(steps: Vec<u32>) -> String {
    steps
        .into_iter()
        .map(|n| format!("{n:>4} steps: {:.3}\n", simulate(n)))
        .collect()
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    if let Err(err) = incmemo::set_global("rate", &2.5f64) {
        eprintln!("cannot set rate: {err}");
        return;
    }

    print!("{}", report(vec![10, 100, 1000]));
    print!("{}", report(vec![10, 100]));

    let stats = incmemo::stats();
    println!("hits: {}, misses: {}, saved: {}ms", stats.hits, stats.misses, stats.saved_ms);

    let flushed = incmemo::flush();
    for err in &flushed.errors {
        eprintln!("{err}");
    }
}

//! Benchmark harness crate for the lease bank.
//!
//! Individual benchmarks live under `benches/`.

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

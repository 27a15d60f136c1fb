//! End-to-end scenarios for the lease bank: timing-sensitive expiration
//! behavior and multi-threaded churn that the per-module unit tests leave
//! out.

#[cfg(test)]
mod tests;

use thiserror::Error;

/// Failures reported by bank operations.
///
/// Every failure is handed back synchronously as an ordinary result value;
/// the bank never reports errors through a side channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BankError {
    /// The free chain is empty and the watermark has reached the top of the
    /// range: every identifier is currently leased.
    #[error("all identifiers in use")]
    AllIdentifiersInUse,
    /// The presented token does not match the one granted with the lease.
    #[error("invalid token")]
    InvalidToken,
    /// The identifier is not currently leased (never allocated, already
    /// released, or outside the bank's range).
    #[error("unallocated id")]
    UnallocatedId,
    /// The bank has been shut down and no longer accepts requests.
    #[error("bank terminated")]
    Terminated,
}

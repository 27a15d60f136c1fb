use crate::expiry::ExpiryTimer;

/// Identifier handed out on lease. The bank serves a half-open range of
/// these; the top of the range is never leased.
pub type LeaseId = u32;

/// Capability value that must accompany any mutation of a lease.
/// Non-negative for as long as the identifier is leased.
pub type Token = i32;

/// Token held by free entries. Granted tokens are non-negative, so the
/// sentinel can never match one.
pub(crate) const FREE_TOKEN: Token = -1;

/// What an entry-store slot is doing right now.
///
/// An entry is created the first time its identifier is allocated and then
/// retained for the life of the bank, flipping between these two states as
/// the identifier is leased and released.
pub(crate) enum EntryState {
    /// Currently leased; owns the live expiration timer for the lease.
    Leased(ExpiryTimer),
    /// Previously released; links to the next node of the free chain.
    Free { next: LeaseId },
}

pub(crate) struct LeaseEntry {
    /// Holder of the current lease (or of the last one, for free entries).
    pub client: String,
    /// Current capability token, `FREE_TOKEN` while free.
    pub token: Token,
    pub state: EntryState,
}

impl LeaseEntry {
    pub fn is_leased(&self) -> bool {
        matches!(self.state, EntryState::Leased(_))
    }
}

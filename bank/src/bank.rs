use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, info};

use crate::entry::{EntryState, LeaseEntry, LeaseId, Token, FREE_TOKEN};
use crate::error::BankError;
use crate::expiry::ExpiryQueue;
use crate::token::TokenSource;

/// A granted lease: the identifier plus the capability token required to
/// release or reset it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub id: LeaseId,
    pub token: Token,
}

/// Control-queue requests. Each carries its own single-slot reply channel
/// and the sender blocks on it until the mediator has fully processed the
/// request, so callers observe operations in mediator order.
pub(crate) enum Request {
    Allocate {
        client: String,
        ttl: Duration,
        reply: Sender<Result<Lease, BankError>>,
    },
    Release {
        id: LeaseId,
        token: Token,
        reply: Sender<Result<(), BankError>>,
    },
    Reset {
        id: LeaseId,
        ttl: Duration,
        token: Token,
        reply: Sender<Result<(), BankError>>,
    },
    Query {
        id: LeaseId,
        reply: Sender<Option<String>>,
    },
    Shutdown {
        reply: Sender<()>,
    },
}

/// Everything the mediator thread owns. Nothing here is shared: requests
/// are the only way in, which is what makes the bank linearizable without
/// a single lock around its state.
struct BankState {
    /// One entry per identifier that has ever been allocated; entries
    /// outlive their leases and double as free-chain nodes.
    entries: HashMap<LeaseId, LeaseEntry>,
    /// Head of the free chain when an entry exists at this value, otherwise
    /// the watermark: the lowest identifier never yet allocated.
    free_head: LeaseId,
    /// One past the highest allocatable identifier.
    max: LeaseId,
    tokens: TokenSource,
    /// Declared after `entries` so live timers drop before the queue they
    /// point into.
    expiry: ExpiryQueue,
}

impl BankState {
    fn allocate(&mut self, client: String, ttl: Duration) -> Result<Lease, BankError> {
        let id = self.free_head;
        match self.entries.get(&id) {
            // An entry at the head means the free chain is non-empty: pop it.
            Some(entry) => match entry.state {
                EntryState::Free { next } => self.free_head = next,
                EntryState::Leased(_) => panic!("free chain head {id} is leased"),
            },
            // No entry: the head is the watermark.
            None => {
                if id == self.max {
                    debug!(client = %client, "allocation failed: all identifiers in use");
                    return Err(BankError::AllIdentifiersInUse);
                }
                self.free_head = id + 1;
            }
        }
        let token = self.tokens.draw();
        let timer = self.expiry.arm(id, token, ttl);
        debug!(id, token, client = %client, ttl_ms = ttl.as_millis() as u64, "lease granted");
        self.entries.insert(
            id,
            LeaseEntry {
                client,
                token,
                state: EntryState::Leased(timer),
            },
        );
        Ok(Lease { id, token })
    }

    fn release(&mut self, id: LeaseId, token: Token) -> Result<(), BankError> {
        let entry = match ensure_leaseholder(&mut self.entries, id, token) {
            Ok(entry) => entry,
            Err(err) => {
                debug!(id, %err, "release rejected");
                return Err(err);
            }
        };
        if let EntryState::Leased(timer) = &entry.state {
            timer.cancel();
        }
        entry.token = FREE_TOKEN;
        entry.state = EntryState::Free {
            next: self.free_head,
        };
        self.free_head = id;
        debug!(id, "lease released");
        Ok(())
    }

    fn reset(&mut self, id: LeaseId, ttl: Duration, token: Token) -> Result<(), BankError> {
        let entry = match ensure_leaseholder(&mut self.entries, id, token) {
            Ok(entry) => entry,
            Err(err) => {
                debug!(id, %err, "reset rejected");
                return Err(err);
            }
        };
        if let EntryState::Leased(timer) = &entry.state {
            timer.reset(ttl);
        }
        debug!(id, ttl_ms = ttl.as_millis() as u64, "lease deadline reset");
        Ok(())
    }

    fn query(&self, id: LeaseId) -> Option<String> {
        let holder = self
            .entries
            .get(&id)
            .filter(|entry| entry.is_leased())
            .map(|entry| entry.client.clone());
        debug!(id, held = holder.is_some(), "lease queried");
        holder
    }
}

/// Looks up a live lease and checks its capability token. Release and reset
/// share this validation, in a fixed order: existence before token.
fn ensure_leaseholder(
    entries: &mut HashMap<LeaseId, LeaseEntry>,
    id: LeaseId,
    token: Token,
) -> Result<&mut LeaseEntry, BankError> {
    let Some(entry) = entries.get_mut(&id) else {
        return Err(BankError::UnallocatedId);
    };
    if !entry.is_leased() {
        return Err(BankError::UnallocatedId);
    }
    if entry.token != token {
        return Err(BankError::InvalidToken);
    }
    Ok(entry)
}

fn run_mediator(mut state: BankState, control: Receiver<Request>) {
    while let Ok(request) = control.recv() {
        match request {
            Request::Allocate { client, ttl, reply } => {
                let _ = reply.send(state.allocate(client, ttl));
            }
            Request::Release { id, token, reply } => {
                let _ = reply.send(state.release(id, token));
            }
            Request::Reset {
                id,
                ttl,
                token,
                reply,
            } => {
                let _ = reply.send(state.reset(id, ttl, token));
            }
            Request::Query { id, reply } => {
                let _ = reply.send(state.query(id));
            }
            Request::Shutdown { reply } => {
                let _ = reply.send(());
                break;
            }
        }
    }
    // Drop queued requests before the expiry queue is joined: a firing
    // blocked on its reply slot must observe the disconnect.
    drop(control);
    drop(state);
    debug!("bank mediator stopped");
}

/// Handle to a running identifier bank.
///
/// The bank leases unique identifiers out of a bounded 32-bit space, each
/// with a time-to-live and a capability token; expired leases are reclaimed
/// as if released. Handles are cheap to clone and every clone talks to the
/// same mediator thread, so the bank may be shared freely across threads.
///
/// A bank that is never [`shutdown`](Bank::shutdown) keeps its mediator and
/// expiry threads alive for the rest of the process.
#[derive(Clone)]
pub struct Bank {
    control: Sender<Request>,
    mediator: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Bank {
    /// Creates a bank serving the half-open identifier range `[min, max)`
    /// and starts its mediator. `min >= max` selects the full 32-bit
    /// domain `[0, u32::MAX)`.
    pub fn new(min: LeaseId, max: LeaseId) -> Bank {
        let (min, max) = if min >= max { (0, LeaseId::MAX) } else { (min, max) };
        let (control, requests) = crossbeam_channel::unbounded();
        let state = BankState {
            entries: HashMap::new(),
            free_head: min,
            max,
            tokens: TokenSource::new(),
            expiry: ExpiryQueue::start(control.clone()),
        };
        let mediator = thread::Builder::new()
            .name("idlease-bank".into())
            .spawn(move || run_mediator(state, requests))
            .expect("failed to spawn bank mediator");
        info!(min, max, "bank started");
        Bank {
            control,
            mediator: Arc::new(Mutex::new(Some(mediator))),
        }
    }

    /// Leases an identifier to `client` for `ttl`. Unless released or reset
    /// first, the lease expires after `ttl` and the identifier becomes
    /// available again.
    pub fn allocate(
        &self,
        client: impl Into<String>,
        ttl: Duration,
    ) -> Result<Lease, BankError> {
        let client = client.into();
        self.call(|reply| Request::Allocate { client, ttl, reply })?
    }

    /// Returns the identifier to the bank. `token` must be the one granted
    /// with the lease.
    pub fn release(&self, id: LeaseId, token: Token) -> Result<(), BankError> {
        self.call(|reply| Request::Release { id, token, reply })?
    }

    /// Restarts the lease clock: the lease now expires `ttl` from now,
    /// replacing the previous deadline.
    pub fn reset(&self, id: LeaseId, ttl: Duration, token: Token) -> Result<(), BankError> {
        self.call(|reply| Request::Reset { id, ttl, token, reply })?
    }

    /// Name of the client currently holding `id`, if any. Never errors; a
    /// terminated bank reports `None`.
    pub fn query(&self, id: LeaseId) -> Option<String> {
        self.call(|reply| Request::Query { id, reply }).unwrap_or(None)
    }

    /// Shuts the bank down: cancels every outstanding expiration, drops all
    /// lease state, and stops the mediator and expiry threads. Idempotent
    /// and safe to race from several threads; operations issued after
    /// shutdown fail with [`BankError::Terminated`].
    pub fn shutdown(&self) {
        let (reply, done) = crossbeam_channel::bounded(1);
        if self.control.send(Request::Shutdown { reply }).is_ok() {
            let _ = done.recv();
        }
        if let Some(mediator) = self.mediator.lock().unwrap().take() {
            let _ = mediator.join();
        }
    }

    /// One blocking round-trip through the mediator.
    fn call<T>(&self, request: impl FnOnce(Sender<T>) -> Request) -> Result<T, BankError> {
        let (reply, response) = crossbeam_channel::bounded(1);
        self.control
            .send(request(reply))
            .map_err(|_| BankError::Terminated)?;
        response.recv().map_err(|_| BankError::Terminated)
    }
}

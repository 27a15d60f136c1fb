use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::debug;

use crate::bank::Request;
use crate::entry::{LeaseId, Token};

/// `Instant` addition is checked arithmetic; absurd ttls are capped at a
/// century instead of being allowed to panic.
const TTL_CEILING: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Per-lease arm sequence. The mediator bumps it to cancel or re-arm; the
/// expiry worker consumes it with a compare-and-swap when a deadline pops,
/// so exactly one side wins any race over a given arm.
struct TimerCell {
    seq: AtomicU64,
}

impl TimerCell {
    fn new() -> Self {
        Self {
            seq: AtomicU64::new(0),
        }
    }

    /// Invalidates the current arm and returns the next sequence value.
    fn advance(&self) -> u64 {
        self.seq.fetch_add(1, SeqCst) + 1
    }

    /// Claims the firing for `seq`. Fails if that arm was cancelled,
    /// superseded by a reset, or already fired.
    fn try_consume(&self, seq: u64) -> bool {
        self.seq.compare_exchange(seq, seq + 1, SeqCst, SeqCst).is_ok()
    }
}

/// A pending one-shot expiration, ordered soonest-first in the worker's
/// heap. Entries whose sequence has moved on are tombstones and get
/// discarded when they pop.
struct Deadline {
    due: Instant,
    seq: u64,
    id: LeaseId,
    token: Token,
    cell: Arc<TimerCell>,
}

impl PartialEq for Deadline {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Deadline {}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so the earliest deadline sits at the top of the heap.
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

enum QueueCmd {
    Arm(Deadline),
    Stop,
}

/// Handle to the live expiration of one lease, owned by its entry.
///
/// Dropping the handle cancels the arm, so replacing an entry's state can
/// never leave a firing behind.
pub(crate) struct ExpiryTimer {
    id: LeaseId,
    token: Token,
    cell: Arc<TimerCell>,
    arms: Sender<QueueCmd>,
}

impl ExpiryTimer {
    /// Replaces the deadline of this timer in place. The arm sequence moves
    /// forward, so the superseded deadline can never fire.
    pub fn reset(&self, ttl: Duration) {
        self.push(ttl);
    }

    /// Deterministically prevents this timer from firing.
    pub fn cancel(&self) {
        self.cell.advance();
    }

    fn push(&self, ttl: Duration) {
        let seq = self.cell.advance();
        let deadline = Deadline {
            due: Instant::now() + ttl.min(TTL_CEILING),
            seq,
            id: self.id,
            token: self.token,
            cell: Arc::clone(&self.cell),
        };
        // The worker only disappears once the bank is shutting down, at
        // which point a lost arm is harmless.
        let _ = self.arms.send(QueueCmd::Arm(deadline));
    }
}

impl Drop for ExpiryTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// The expiration subsystem: one worker thread owning a deadline heap.
///
/// Firings are submitted to the bank's control queue as ordinary release
/// requests carrying the token captured when the arm was scheduled, and the
/// worker blocks until each one has been processed.
pub(crate) struct ExpiryQueue {
    arms: Sender<QueueCmd>,
    worker: Option<JoinHandle<()>>,
}

impl ExpiryQueue {
    pub fn start(releases: Sender<Request>) -> Self {
        let (arms, cmds) = crossbeam_channel::unbounded();
        let worker = thread::Builder::new()
            .name("idlease-expiry".into())
            .spawn(move || run_worker(cmds, releases))
            .expect("failed to spawn expiry worker");
        Self {
            arms,
            worker: Some(worker),
        }
    }

    /// Arms a fresh one-shot expiration for a new lease and returns the
    /// handle its entry will own.
    pub fn arm(&self, id: LeaseId, token: Token, ttl: Duration) -> ExpiryTimer {
        let timer = ExpiryTimer {
            id,
            token,
            cell: Arc::new(TimerCell::new()),
            arms: self.arms.clone(),
        };
        timer.push(ttl);
        timer
    }
}

impl Drop for ExpiryQueue {
    fn drop(&mut self) {
        let _ = self.arms.send(QueueCmd::Stop);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run_worker(cmds: Receiver<QueueCmd>, releases: Sender<Request>) {
    let mut pending: BinaryHeap<Deadline> = BinaryHeap::new();
    loop {
        let cmd = match pending.peek().map(|head| head.due) {
            Some(due) => match cmds.recv_deadline(due) {
                Ok(cmd) => Some(cmd),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match cmds.recv() {
                Ok(cmd) => Some(cmd),
                Err(_) => break,
            },
        };
        match cmd {
            Some(QueueCmd::Arm(deadline)) => pending.push(deadline),
            Some(QueueCmd::Stop) => break,
            None => {
                if !fire_due(&mut pending, &releases) {
                    break;
                }
            }
        }
    }
}

/// Pops every due deadline and submits a release for each arm that is
/// still current. Returns `false` once the bank side has gone away.
fn fire_due(pending: &mut BinaryHeap<Deadline>, releases: &Sender<Request>) -> bool {
    while pending.peek().map_or(false, |head| head.due <= Instant::now()) {
        let Some(deadline) = pending.pop() else {
            break;
        };
        if !deadline.cell.try_consume(deadline.seq) {
            // Cancelled or re-armed since this entry was pushed.
            continue;
        }
        debug!(id = deadline.id, "lease ttl expired");
        let (reply, outcome) = crossbeam_channel::bounded(1);
        let release = Request::Release {
            id: deadline.id,
            token: deadline.token,
            reply,
        };
        if releases.send(release).is_err() {
            return false;
        }
        match outcome.recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(id = deadline.id, %err, "stale expiration discarded"),
            Err(_) => return false,
        }
    }
    true
}

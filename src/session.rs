use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

/// Ownership token for the single physical actuator.
///
/// The gimbal can only honor one position-driving operation at a time, so
/// anything that drives it must go through here: a preset run acquires the
/// session for its whole span, and a direct manual move preempts whatever
/// currently holds it. Acquiring cancels the previous owner's token, which is
/// how a new `execute` cancels an in-flight sequence.
#[derive(Debug, Default)]
pub struct DeviceSession {
    current: Mutex<Option<(u64, CancellationToken)>>,
    next_generation: AtomicU64,
}

impl DeviceSession {
    pub fn new() -> Self {
        DeviceSession::default()
    }

    /// Takes ownership of the device, cancelling the previous owner if any.
    /// Returns the generation to pass back to [`release`](Self::release) and
    /// the token the new owner must watch.
    pub fn acquire(&self) -> (u64, CancellationToken) {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let token = CancellationToken::new();

        let mut current = self.current.lock().unwrap();
        if let Some((old, old_token)) = current.take() {
            debug!("device session {} preempted by {}", old, generation);
            old_token.cancel();
        }
        *current = Some((generation, token.clone()));

        (generation, token)
    }

    /// Cancels the current owner without taking ownership. Used by one-shot
    /// manual moves that finish inside a single router application.
    pub fn preempt(&self) {
        if let Some((generation, token)) = self.current.lock().unwrap().take() {
            debug!("device session {} preempted", generation);
            token.cancel();
        }
    }

    /// Relinquishes ownership, but only if `generation` is still the owner;
    /// a stale release after preemption is a no-op.
    pub fn release(&self, generation: u64) {
        let mut current = self.current.lock().unwrap();
        if matches!(*current, Some((owner, _)) if owner == generation) {
            *current = None;
        }
    }
}

//! Proposal key leasing
//!
//! The admin account's proposal keys live in a fixed arena of slots. A fair
//! counting semaphore holds one permit per free slot, so `lease()` suspends
//! until some key is free and waiting workers are served in arrival order.
//! Within the free slots a round-robin cursor picks the next key.
//!
//! A key's sequence number is only ever changed by its current leaseholder,
//! under the pool lock, when the lease is released (or when a flagged key is
//! resynced right before being handed out).

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use submitter_types::{KeyPoolStats, KeyState};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::chain::SequenceSource;
use crate::error::LeaseError;

/// Leases held longer than this are logged when released
const LEASE_HOLD_WARNING_SECS: u64 = 60;

/// How a leaseholder hands a key back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The transaction landed; store the next sequence number
    Success(u64),
    /// The submission may or may not have reached the chain; re-read the
    /// sequence before the key is used again
    TransientFailure,
    /// The submission never reached the chain; the sequence is still good
    FatalFailure,
}

/// Initial state of one proposal key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProposalKey {
    pub index: u32,
    pub sequence: u64,
    pub needs_resync: bool,
}

impl ProposalKey {
    pub fn new(index: u32, sequence: u64) -> Self {
        Self {
            index,
            sequence,
            needs_resync: false,
        }
    }

    /// A key whose sequence is unknown; it is read from the chain on first lease
    pub fn unsynced(index: u32) -> Self {
        Self {
            index,
            sequence: 0,
            needs_resync: true,
        }
    }
}

#[derive(Debug)]
struct KeySlot {
    index: u32,
    sequence: u64,
    leased: bool,
    needs_resync: bool,
}

struct PoolState {
    slots: Vec<KeySlot>,
    cursor: usize,
    closed: bool,
}

pub struct KeyPool {
    admin_address: String,
    state: Mutex<PoolState>,
    free: Arc<Semaphore>,
    sequences: Arc<dyn SequenceSource>,
    resync_queries: AtomicU64,
}

/// Exclusive use of one proposal key.
///
/// Hand it back with `KeyPool::release`. A lease dropped without release
/// (its worker was aborted) is force-released as a transient failure so the
/// key is resynced before anyone uses it again.
pub struct KeyLease {
    pool: Arc<KeyPool>,
    slot: usize,
    key_index: u32,
    sequence: u64,
    acquired_at: Instant,
    permit: Option<OwnedSemaphorePermit>,
}

impl KeyLease {
    pub fn key_index(&self) -> u32 {
        self.key_index
    }

    /// Sequence number to sign with
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn held_duration(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

impl std::fmt::Debug for KeyLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyLease")
            .field("key_index", &self.key_index)
            .field("sequence", &self.sequence)
            .finish()
    }
}

impl Drop for KeyLease {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            log::warn!(
                "[KEY_POOL] Lease on key {} dropped without release after {}ms; forcing resync",
                self.key_index,
                self.acquired_at.elapsed().as_millis()
            );
            self.pool.settle(self.slot, ReleaseOutcome::TransientFailure);
            drop(permit);
        }
    }
}

impl KeyPool {
    pub fn new(
        admin_address: impl Into<String>,
        keys: Vec<ProposalKey>,
        sequences: Arc<dyn SequenceSource>,
    ) -> Arc<Self> {
        let slots: Vec<KeySlot> = keys
            .into_iter()
            .map(|k| KeySlot {
                index: k.index,
                sequence: k.sequence,
                leased: false,
                needs_resync: k.needs_resync,
            })
            .collect();
        let admin_address = admin_address.into();

        log::info!(
            "[KEY_POOL] {} proposal keys for admin account {}",
            slots.len(),
            admin_address
        );

        Arc::new(Self {
            admin_address,
            free: Arc::new(Semaphore::new(slots.len())),
            state: Mutex::new(PoolState {
                slots,
                cursor: 0,
                closed: false,
            }),
            sequences,
            resync_queries: AtomicU64::new(0),
        })
    }

    /// Keys `0..count`, all unsynced
    pub fn unsynced(
        admin_address: impl Into<String>,
        count: u16,
        sequences: Arc<dyn SequenceSource>,
    ) -> Arc<Self> {
        let keys = (0..count as u32).map(ProposalKey::unsynced).collect();
        Self::new(admin_address, keys, sequences)
    }

    pub fn admin_address(&self) -> &str {
        &self.admin_address
    }

    /// Wait for a free key and lease it.
    ///
    /// A key flagged for resync asks the chain for its sequence exactly once
    /// before being handed out. If that query fails the key goes back to the
    /// pool, still flagged, and the caller gets `ResyncFailed`.
    pub async fn lease(self: &Arc<Self>) -> Result<KeyLease, LeaseError> {
        let permit = self
            .free
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| LeaseError::PoolClosed)?;

        let (slot, key_index, sequence, needs_resync) = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(LeaseError::PoolClosed);
            }

            let count = state.slots.len();
            let start = state.cursor;
            let Some(slot) = (0..count)
                .map(|offset| (start + offset) % count)
                .find(|&i| !state.slots[i].leased)
            else {
                // permits track free slots one-to-one
                log::error!("[KEY_POOL] Got a permit but every key is leased");
                return Err(LeaseError::NoFreeKey);
            };

            state.cursor = (slot + 1) % count;
            let key = &mut state.slots[slot];
            key.leased = true;
            (slot, key.index, key.sequence, key.needs_resync)
        };

        let mut lease = KeyLease {
            pool: Arc::clone(self),
            slot,
            key_index,
            sequence,
            acquired_at: Instant::now(),
            permit: Some(permit),
        };

        if needs_resync {
            self.resync_queries.fetch_add(1, Ordering::Relaxed);
            match self.sequences.current_sequence(key_index).await {
                Ok(current) => {
                    let mut state = self.state.lock();
                    let key = &mut state.slots[slot];
                    if key.sequence != current {
                        log::info!(
                            "[KEY_POOL] Key {} resynced: sequence {} -> {}",
                            key_index,
                            key.sequence,
                            current
                        );
                    }
                    key.sequence = current;
                    key.needs_resync = false;
                    lease.sequence = current;
                }
                Err(e) => {
                    log::warn!("[KEY_POOL] Resync of key {} failed: {}", key_index, e);
                    self.state.lock().slots[slot].leased = false;
                    drop(lease.permit.take());
                    return Err(LeaseError::ResyncFailed {
                        key_index,
                        message: e.to_string(),
                    });
                }
            }
        }

        log::debug!("[KEY_POOL] Leased key {} at sequence {}", key_index, lease.sequence);
        Ok(lease)
    }

    /// Hand a key back. Never blocks on other leaseholders.
    pub fn release(&self, mut lease: KeyLease, outcome: ReleaseOutcome) {
        let held = lease.acquired_at.elapsed();
        if held.as_secs() > LEASE_HOLD_WARNING_SECS {
            log::warn!(
                "[KEY_POOL] Key {} was leased for {}s (unusually long)",
                lease.key_index,
                held.as_secs()
            );
        }

        if let Some(permit) = lease.permit.take() {
            self.settle(lease.slot, outcome);
            drop(permit);
        }
    }

    /// Mark the slot free and apply the outcome. The caller returns the
    /// permit afterwards so a woken waiter always finds a free slot.
    fn settle(&self, slot: usize, outcome: ReleaseOutcome) {
        let mut state = self.state.lock();
        let key = &mut state.slots[slot];
        key.leased = false;
        match outcome {
            ReleaseOutcome::Success(next) => {
                if next <= key.sequence {
                    log::warn!(
                        "[KEY_POOL] Key {} released with sequence {} not above {}",
                        key.index,
                        next,
                        key.sequence
                    );
                }
                key.sequence = next;
                key.needs_resync = false;
            }
            ReleaseOutcome::TransientFailure => {
                key.needs_resync = true;
            }
            ReleaseOutcome::FatalFailure => {}
        }
    }

    /// Refuse further leases. Outstanding leases can still be released.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.free.close();
        log::info!("[KEY_POOL] Closed");
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> KeyPoolStats {
        let state = self.state.lock();
        KeyPoolStats {
            total: state.slots.len(),
            leased: state.slots.iter().filter(|k| k.leased).count(),
            needs_resync: state.slots.iter().filter(|k| k.needs_resync).count(),
            resync_queries: self.resync_queries.load(Ordering::Relaxed),
        }
    }

    pub fn snapshot(&self) -> Vec<KeyState> {
        self.state
            .lock()
            .slots
            .iter()
            .map(|k| KeyState {
                index: k.index,
                sequence: k.sequence,
                leased: k.leased,
                needs_resync: k.needs_resync,
            })
            .collect()
    }
}

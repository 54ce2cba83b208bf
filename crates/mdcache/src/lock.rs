//! Distributed consistency locks.
//!
//! Every cached inode carries one `ConsistencyLock` per attribute group. The
//! authority drives the lock through its states by exchanging messages with
//! the replicas (the transport is external); this type enforces which
//! transitions are legal and tracks which replicas still owe an ack.
//!
//! States:
//! - `Sync`: shared. Every server may read its cached copy, nobody writes.
//! - `Lock`: exclusive. Only the authority reads or writes; replicas are invalid.
//! - `Scatter`: each fragment-owning server may write its local contribution
//!   (scatter-capable groups only).
//! - `Gather`: scatter to sync in progress, waiting for replica contributions.
//! - `Locking`: sync to lock in progress, waiting for replica invalidation acks.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::{CacheError, Result};
use crate::types::ServerId;

/// First inode wait bit used by locks; lower bits belong to the inode.
pub const WAIT_LOCK_BASE: u32 = 6;
/// Wait bits reserved per lock.
pub const LOCK_WAIT_BITS: u32 = 3;

/// The attribute group a lock protects.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LockKind {
    /// Ownership and permissions (uid, gid, mode).
    Auth,
    /// Link count and anchor flag.
    Link,
    /// Directory fragmentation map.
    DirFragTree,
    /// File data attributes (size, mtime, atime).
    File,
    /// Directory aggregate stats (mtime across fragments).
    Dir,
}

impl LockKind {
    /// Every lock in the fixed order used on the wire.
    pub const ALL: [LockKind; 5] = [
        LockKind::Auth,
        LockKind::Link,
        LockKind::DirFragTree,
        LockKind::File,
        LockKind::Dir,
    ];

    /// Position in [`LockKind::ALL`].
    pub fn index(&self) -> usize {
        match self {
            LockKind::Auth => 0,
            LockKind::Link => 1,
            LockKind::DirFragTree => 2,
            LockKind::File => 3,
            LockKind::Dir => 4,
        }
    }

    /// Returns true if this group may be written concurrently by several
    /// servers and gathered by the authority.
    pub fn supports_scatter(&self) -> bool {
        matches!(self, LockKind::File | LockKind::Dir)
    }

    /// Bit offset of this lock's waiters within the inode wait mask.
    pub fn wait_offset(&self) -> u32 {
        WAIT_LOCK_BASE + self.index() as u32 * LOCK_WAIT_BITS
    }

    /// Inode wait bit for `wait` on this lock.
    pub fn wait_bit(&self, wait: LockWait) -> u64 {
        1u64 << (self.wait_offset() + wait as u32)
    }

    /// Every wait bit of this lock.
    pub fn wait_mask(&self) -> u64 {
        ((1u64 << LOCK_WAIT_BITS) - 1) << self.wait_offset()
    }
}

/// Condition a waiter on a lock is interested in.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LockWait {
    /// A read lock may be granted.
    Rd = 0,
    /// A write lock may be granted.
    Wr = 1,
    /// The lock reached a stable state or lost its last holder.
    Stable = 2,
}

/// Lock state as seen by this server.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockState {
    /// Shared: readable everywhere, writable nowhere.
    Sync,
    /// Exclusive to the authority.
    Lock,
    /// Distributed partial writes allowed.
    Scatter,
    /// Scatter to sync: waiting for replica contributions.
    Gather,
    /// Sync to lock: waiting for replicas to invalidate.
    Locking,
}

impl LockState {
    /// Returns true if no transition is in flight.
    pub fn is_stable(&self) -> bool {
        matches!(self, LockState::Sync | LockState::Lock | LockState::Scatter)
    }

    /// Returns true for scatter and gather states.
    pub fn is_scattered(&self) -> bool {
        matches!(self, LockState::Scatter | LockState::Gather)
    }
}

/// Externally visible lock state: what a replica or new authority must adopt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockSnapshot {
    /// Current state.
    pub state: LockState,
    /// Replicas that still owe an ack for the pending transition.
    pub gather_set: BTreeSet<ServerId>,
}

impl LockSnapshot {
    /// Rejects states this kind of lock cannot be in.
    pub fn validate(&self, kind: LockKind) -> Result<()> {
        if self.state.is_scattered() && !kind.supports_scatter() {
            return Err(CacheError::MalformedSnapshot(format!(
                "{:?} lock in scatter state {:?}",
                kind, self.state
            )));
        }
        let pending = matches!(self.state, LockState::Gather | LockState::Locking);
        if pending == self.gather_set.is_empty() {
            return Err(CacheError::MalformedSnapshot(format!(
                "{:?} lock in {:?} with {} pending acks",
                kind,
                self.state,
                self.gather_set.len()
            )));
        }
        Ok(())
    }
}

/// One attribute group's distributed lock.
#[derive(Clone, Debug)]
pub struct ConsistencyLock {
    kind: LockKind,
    state: LockState,
    gather_set: BTreeSet<ServerId>,
    num_rdlock: u32,
    num_wrlock: u32,
}

impl ConsistencyLock {
    /// Creates a lock for `kind`. Authorities start exclusive, replicas shared.
    pub fn new(kind: LockKind, auth: bool) -> Self {
        Self {
            kind,
            state: if auth { LockState::Lock } else { LockState::Sync },
            gather_set: BTreeSet::new(),
            num_rdlock: 0,
            num_wrlock: 0,
        }
    }

    /// Attribute group protected by this lock.
    pub fn kind(&self) -> LockKind {
        self.kind
    }

    /// Current state.
    pub fn state(&self) -> LockState {
        self.state
    }

    /// Replicas that still owe an ack.
    pub fn gather_set(&self) -> &BTreeSet<ServerId> {
        &self.gather_set
    }

    /// Returns true if no transition is in flight.
    pub fn is_stable(&self) -> bool {
        self.state.is_stable()
    }

    /// Returns true while local readers or writers hold the lock.
    pub fn is_used(&self) -> bool {
        self.num_rdlock > 0 || self.num_wrlock > 0
    }

    /// Number of local read holders.
    pub fn num_rdlock(&self) -> u32 {
        self.num_rdlock
    }

    /// Number of local write holders.
    pub fn num_wrlock(&self) -> u32 {
        self.num_wrlock
    }

    fn illegal(&self, to: LockState) -> CacheError {
        CacheError::IllegalLockTransition {
            kind: self.kind,
            from: self.state,
            to,
        }
    }

    fn busy(&self) -> CacheError {
        CacheError::LockBusy {
            kind: self.kind,
            state: self.state,
        }
    }

    // -- local holders --

    /// Returns true if a local reader may proceed.
    pub fn can_rdlock(&self, is_auth: bool) -> bool {
        match self.state {
            LockState::Sync => true,
            LockState::Lock => is_auth,
            _ => false,
        }
    }

    /// Takes a local read lock.
    pub fn get_rdlock(&mut self, is_auth: bool) -> Result<()> {
        if !self.can_rdlock(is_auth) {
            return Err(self.busy());
        }
        self.num_rdlock += 1;
        Ok(())
    }

    /// Drops a local read lock. Returns true if it was the last holder.
    pub fn put_rdlock(&mut self) -> Result<bool> {
        if self.num_rdlock == 0 {
            return Err(CacheError::LockNotHeld {
                kind: self.kind,
                mode: "read",
            });
        }
        self.num_rdlock -= 1;
        Ok(!self.is_used())
    }

    /// Returns true if a local writer may proceed.
    pub fn can_wrlock(&self, is_auth: bool) -> bool {
        match self.state {
            LockState::Lock => is_auth,
            LockState::Scatter => true,
            _ => false,
        }
    }

    /// Takes a local write lock.
    pub fn get_wrlock(&mut self, is_auth: bool) -> Result<()> {
        if !self.can_wrlock(is_auth) {
            return Err(self.busy());
        }
        self.num_wrlock += 1;
        Ok(())
    }

    /// Drops a local write lock. Returns true if it was the last holder.
    pub fn put_wrlock(&mut self) -> Result<bool> {
        if self.num_wrlock == 0 {
            return Err(CacheError::LockNotHeld {
                kind: self.kind,
                mode: "write",
            });
        }
        self.num_wrlock -= 1;
        Ok(!self.is_used())
    }

    // -- authority transitions --

    /// Begins moving to exclusive. With no replicas the lock is exclusive on
    /// return (`Ok(true)`); otherwise it enters `Locking` and every replica
    /// must ack its invalidation through [`handle_ack`](Self::handle_ack).
    pub fn start_exclusive<'a>(
        &mut self,
        replicas: impl IntoIterator<Item = &'a ServerId>,
    ) -> Result<bool> {
        match self.state {
            LockState::Lock => return Ok(true),
            LockState::Sync | LockState::Scatter => {}
            LockState::Gather | LockState::Locking => return Err(self.busy()),
        }
        if self.num_rdlock > 0 || (self.state == LockState::Scatter && self.num_wrlock > 0) {
            return Err(self.busy());
        }
        self.gather_set = replicas.into_iter().copied().collect();
        if self.gather_set.is_empty() {
            self.state = LockState::Lock;
            Ok(true)
        } else {
            tracing::debug!(lock = ?self.kind, waiting_on = ?self.gather_set, "locking");
            self.state = LockState::Locking;
            Ok(false)
        }
    }

    /// Moves straight to exclusive. Only legal when nobody holds a replica.
    pub fn set_exclusive(&mut self, is_replicated: bool) -> Result<()> {
        if self.state == LockState::Lock {
            return Ok(());
        }
        if is_replicated || !self.is_stable() {
            return Err(self.illegal(LockState::Lock));
        }
        if self.num_rdlock > 0 {
            return Err(self.busy());
        }
        self.state = LockState::Lock;
        Ok(())
    }

    /// Opens the lock for distributed writes.
    pub fn start_scatter(&mut self) -> Result<()> {
        if !self.kind.supports_scatter() {
            return Err(CacheError::ScatterUnsupported { kind: self.kind });
        }
        match self.state {
            LockState::Scatter => Ok(()),
            LockState::Sync | LockState::Lock => {
                if self.num_rdlock > 0 {
                    return Err(self.busy());
                }
                self.state = LockState::Scatter;
                Ok(())
            }
            _ => Err(self.busy()),
        }
    }

    /// Begins gathering scattered contributions back into a shared value.
    /// Returns `Ok(true)` if no replica needs to contribute.
    pub fn start_gather<'a>(
        &mut self,
        replicas: impl IntoIterator<Item = &'a ServerId>,
    ) -> Result<bool> {
        if !self.kind.supports_scatter() {
            return Err(CacheError::ScatterUnsupported { kind: self.kind });
        }
        if self.state != LockState::Scatter {
            return Err(self.illegal(LockState::Gather));
        }
        if self.num_wrlock > 0 {
            return Err(self.busy());
        }
        self.gather_set = replicas.into_iter().copied().collect();
        if self.gather_set.is_empty() {
            self.state = LockState::Sync;
            Ok(true)
        } else {
            tracing::debug!(lock = ?self.kind, waiting_on = ?self.gather_set, "gathering");
            self.state = LockState::Gather;
            Ok(false)
        }
    }

    /// Records a replica's ack. Returns `Ok(true)` once the pending
    /// transition completed.
    pub fn handle_ack(&mut self, from: ServerId) -> Result<bool> {
        let pending = matches!(self.state, LockState::Locking | LockState::Gather);
        if !pending || !self.gather_set.remove(&from) {
            return Err(CacheError::UnexpectedLockAck {
                kind: self.kind,
                server: from,
                state: self.state,
            });
        }
        if !self.gather_set.is_empty() {
            return Ok(false);
        }
        self.state = match self.state {
            LockState::Locking => LockState::Lock,
            _ => LockState::Sync,
        };
        tracing::debug!(lock = ?self.kind, state = ?self.state, "transition complete");
        Ok(true)
    }

    /// Drops an exclusive lock back to shared.
    pub fn relax(&mut self) -> Result<()> {
        match self.state {
            LockState::Sync => Ok(()),
            LockState::Lock if self.num_wrlock == 0 => {
                self.state = LockState::Sync;
                Ok(())
            }
            LockState::Lock => Err(self.busy()),
            _ => Err(self.illegal(LockState::Sync)),
        }
    }

    /// Called before the first replica is created: an unused exclusive lock
    /// is loosened to shared so the new replica may read. Returns true if
    /// the state changed.
    pub fn replicate_relax(&mut self) -> bool {
        if self.state == LockState::Lock && !self.is_used() {
            self.state = LockState::Sync;
            return true;
        }
        false
    }

    // -- replica side --

    /// State a freshly created replica should adopt.
    pub fn replica_state(&self) -> LockState {
        match self.state {
            LockState::Sync => LockState::Sync,
            LockState::Scatter => LockState::Scatter,
            LockState::Lock | LockState::Locking | LockState::Gather => LockState::Lock,
        }
    }

    /// Adopts a state dictated by the authority.
    pub fn set_state(&mut self, state: LockState) -> Result<()> {
        if state.is_scattered() && !self.kind.supports_scatter() {
            return Err(CacheError::ScatterUnsupported { kind: self.kind });
        }
        if !state.is_stable() {
            return Err(self.illegal(state));
        }
        self.state = state;
        self.gather_set.clear();
        Ok(())
    }

    // -- serialization --

    /// Externally visible state.
    pub fn snapshot(&self) -> LockSnapshot {
        LockSnapshot {
            state: self.state,
            gather_set: self.gather_set.clone(),
        }
    }

    /// Encodes the externally visible state.
    pub fn encode_replica_state(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&self.snapshot())?)
    }

    /// Decodes one lock's state from the front of `bytes`, advancing it.
    pub fn decode_replica_state(kind: LockKind, bytes: &mut &[u8]) -> Result<LockSnapshot> {
        let snap: LockSnapshot = bincode::deserialize_from(&mut *bytes)?;
        snap.validate(kind)?;
        Ok(snap)
    }

    /// Installs a previously validated snapshot.
    pub fn apply_snapshot(&mut self, snap: LockSnapshot) {
        self.state = snap.state;
        self.gather_set = snap.gather_set;
    }
}

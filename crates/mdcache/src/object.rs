//! Cache-object substrate shared by every cached metadata object.
//!
//! Provides reason-tagged pin counting, the waiter queue used to suspend
//! operations until a condition bit fires, object state flags, and the
//! bookkeeping of which other servers hold a replica.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{CacheError, Result};
use crate::types::{InodeId, ServerId};

/// Why an object is pinned in cache.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PinReason {
    /// Other servers hold replicas.
    Replicated,
    /// Holds changes not yet journaled.
    Dirty,
    /// Referenced by an active request; may be taken any number of times.
    Request,
    /// Has registered waiters.
    Waiter,
    /// Has open directory fragments.
    Dir,
    /// Has client capabilities.
    Caps,
    /// Has auth pins.
    AuthPin,
    /// Being imported from another server.
    Importing,
    /// Anchor table update in flight.
    Anchoring,
    /// Anchor removal in flight.
    Unanchoring,
    /// Directory fragment being fetched.
    OpeningDir,
    /// Remote (hard link) parents are cached.
    RemoteParent,
    /// Queued for a batched open-file journal entry.
    BatchOpenJournal,
    /// Caller-defined pin.
    Custom(u16),
}

impl PinReason {
    /// Returns true for reasons the owning inode takes and drops itself.
    pub fn is_structural(&self) -> bool {
        !matches!(
            self,
            PinReason::Request
                | PinReason::Importing
                | PinReason::OpeningDir
                | PinReason::BatchOpenJournal
                | PinReason::Custom(_)
        )
    }

    /// Short name used in log lines.
    pub fn name(&self) -> &'static str {
        match self {
            PinReason::Replicated => "replicated",
            PinReason::Dirty => "dirty",
            PinReason::Request => "request",
            PinReason::Waiter => "waiter",
            PinReason::Dir => "dir",
            PinReason::Caps => "caps",
            PinReason::AuthPin => "authpin",
            PinReason::Importing => "importing",
            PinReason::Anchoring => "anchoring",
            PinReason::Unanchoring => "unanchoring",
            PinReason::OpeningDir => "openingdir",
            PinReason::RemoteParent => "remoteparent",
            PinReason::BatchOpenJournal => "batchopenjournal",
            PinReason::Custom(_) => "custom",
        }
    }
}

/// Object state bits.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StateFlags(pub u32);

impl StateFlags {
    /// This server is the authority.
    pub const AUTH: StateFlags = StateFlags(1 << 0);
    /// Has unjournaled changes.
    pub const DIRTY: StateFlags = StateFlags(1 << 1);
    /// Root (or orphan container) inode.
    pub const ROOT: StateFlags = StateFlags(1 << 2);
    /// Being exported to another server.
    pub const EXPORTING: StateFlags = StateFlags(1 << 6);
    /// Anchor being added.
    pub const ANCHORING: StateFlags = StateFlags(1 << 7);
    /// Anchor being removed.
    pub const UNANCHORING: StateFlags = StateFlags(1 << 8);
    /// Directory fragment being opened.
    pub const OPENINGDIR: StateFlags = StateFlags(1 << 9);
    /// Freeze requested; waiting for auth pins to drain.
    pub const FREEZING: StateFlags = StateFlags(1 << 10);
    /// Frozen.
    pub const FROZEN: StateFlags = StateFlags(1 << 11);
    /// The containing directory is freezing.
    pub const FREEZING_DIR: StateFlags = StateFlags(1 << 12);
    /// The containing directory is frozen.
    pub const FROZEN_DIR: StateFlags = StateFlags(1 << 13);

    /// Returns true if every bit of `other` is set.
    pub fn contains(&self, other: StateFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true if any bit of `other` is set.
    pub fn intersects(&self, other: StateFlags) -> bool {
        self.0 & other.0 != 0
    }

    /// Sets the bits of `other`.
    pub fn insert(&mut self, other: StateFlags) {
        self.0 |= other.0;
    }

    /// Clears the bits of `other`.
    pub fn remove(&mut self, other: StateFlags) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for StateFlags {
    type Output = StateFlags;

    fn bitor(self, rhs: StateFlags) -> StateFlags {
        StateFlags(self.0 | rhs.0)
    }
}

/// Why a waiter is being invoked.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WakeReason {
    /// The awaited condition fired; retry the operation.
    Ready,
    /// The waiter was dropped by the request-lifecycle manager or the object
    /// is being destroyed.
    Cancelled,
}

/// Continuation of a suspended operation.
pub type Waiter = Box<dyn FnOnce(WakeReason)>;

/// Callbacks keyed by condition bits, fired in registration order.
#[derive(Default)]
pub struct WaitQueue {
    waiters: Vec<(u64, Waiter)>,
}

impl WaitQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `waiter` to run once any bit in `mask` is notified.
    pub fn register(&mut self, mask: u64, waiter: Waiter) {
        self.waiters.push((mask, waiter));
    }

    fn take_matching(&mut self, bits: u64) -> Vec<Waiter> {
        let (hit, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut self.waiters)
            .into_iter()
            .partition(|(mask, _)| mask & bits != 0);
        self.waiters = keep;
        hit.into_iter().map(|(_, w)| w).collect()
    }

    /// Runs and removes every waiter matching `bits`. Returns how many ran.
    pub fn notify(&mut self, bits: u64) -> usize {
        let ready = self.take_matching(bits);
        let n = ready.len();
        for w in ready {
            w(WakeReason::Ready);
        }
        n
    }

    /// Removes every waiter matching `mask`, invoking each with `Cancelled`.
    pub fn cancel(&mut self, mask: u64) -> usize {
        let dropped = self.take_matching(mask);
        let n = dropped.len();
        for w in dropped {
            w(WakeReason::Cancelled);
        }
        n
    }

    /// Returns true if any waiter overlaps `mask`.
    pub fn has_waiters(&self, mask: u64) -> bool {
        self.waiters.iter().any(|(m, _)| m & mask != 0)
    }

    /// Number of registered waiters.
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    /// Returns true if nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

impl fmt::Debug for WaitQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let masks: Vec<String> = self.waiters.iter().map(|(m, _)| format!("{:#x}", m)).collect();
        f.debug_struct("WaitQueue").field("masks", &masks).finish()
    }
}

/// Pin, wait, state and replica bookkeeping for one cached object.
#[derive(Debug)]
pub struct CacheObject {
    ino: InodeId,
    pins: BTreeMap<PinReason, u32>,
    pin_total: u32,
    state: StateFlags,
    waiters: WaitQueue,
    replicas: BTreeMap<ServerId, u32>,
    replica_nonce: u32,
}

impl CacheObject {
    /// Creates the substrate for `ino`; `auth` marks this server as authority.
    pub fn new(ino: InodeId, auth: bool) -> Self {
        let mut state = StateFlags::default();
        if auth {
            state.insert(StateFlags::AUTH);
        }
        Self {
            ino,
            pins: BTreeMap::new(),
            pin_total: 0,
            state,
            waiters: WaitQueue::new(),
            replicas: BTreeMap::new(),
            replica_nonce: 0,
        }
    }

    /// The object this substrate belongs to.
    pub fn ino(&self) -> InodeId {
        self.ino
    }

    // -- pins --

    /// Takes a pin for `reason`.
    pub fn pin(&mut self, reason: PinReason) {
        *self.pins.entry(reason).or_insert(0) += 1;
        self.pin_total += 1;
        tracing::trace!(ino = %self.ino, pin = reason.name(), total = self.pin_total, "pin");
    }

    /// Drops a pin for `reason`.
    pub fn unpin(&mut self, reason: PinReason) -> Result<()> {
        match self.pins.get_mut(&reason) {
            Some(n) if *n > 0 => {
                *n -= 1;
                if *n == 0 {
                    self.pins.remove(&reason);
                }
                self.pin_total -= 1;
                tracing::trace!(ino = %self.ino, pin = reason.name(), total = self.pin_total, "unpin");
                Ok(())
            }
            _ => {
                tracing::error!(ino = %self.ino, pin = reason.name(), pins = ?self.pins, "bad unpin");
                Err(CacheError::PinUnderflow {
                    ino: self.ino,
                    reason,
                })
            }
        }
    }

    /// Total pins across all reasons.
    pub fn pin_count(&self) -> u32 {
        self.pin_total
    }

    /// Pins held for `reason`.
    pub fn pin_count_for(&self, reason: PinReason) -> u32 {
        self.pins.get(&reason).copied().unwrap_or(0)
    }

    /// Returns true if at least one pin for `reason` is held.
    pub fn has_pin(&self, reason: PinReason) -> bool {
        self.pin_count_for(reason) > 0
    }

    /// Returns true if any pin is held.
    pub fn is_pinned(&self) -> bool {
        self.pin_total > 0
    }

    /// Returns true if nothing holds the object in cache.
    pub fn is_evictable(&self) -> bool {
        !self.is_pinned()
    }

    // -- state --

    /// Current state flags.
    pub fn state(&self) -> StateFlags {
        self.state
    }

    /// Returns true if any of `flags` is set.
    pub fn state_test(&self, flags: StateFlags) -> bool {
        self.state.intersects(flags)
    }

    /// Sets `flags`.
    pub fn state_set(&mut self, flags: StateFlags) {
        self.state.insert(flags);
    }

    /// Clears `flags`.
    pub fn state_clear(&mut self, flags: StateFlags) {
        self.state.remove(flags);
    }

    /// Returns true if this server is the authority.
    pub fn is_auth(&self) -> bool {
        self.state_test(StateFlags::AUTH)
    }

    /// Returns true if unjournaled changes are held.
    pub fn is_dirty(&self) -> bool {
        self.state_test(StateFlags::DIRTY)
    }

    /// Marks the object dirty; the first call pins it.
    pub fn mark_dirty(&mut self) {
        if !self.is_dirty() {
            self.state_set(StateFlags::DIRTY);
            self.pin(PinReason::Dirty);
        }
    }

    /// Marks the object clean, releasing the dirty pin.
    pub fn mark_clean(&mut self) -> Result<()> {
        if self.is_dirty() {
            self.state_clear(StateFlags::DIRTY);
            self.unpin(PinReason::Dirty)?;
        }
        Ok(())
    }

    // -- waiters --

    /// Registers `waiter` for any bit in `mask`; the first waiter pins the object.
    pub fn register_waiter(&mut self, mask: u64, waiter: Waiter) {
        if self.waiters.is_empty() {
            self.pin(PinReason::Waiter);
        }
        self.waiters.register(mask, waiter);
    }

    /// Fires every waiter matching `bits`, in registration order.
    pub fn notify(&mut self, bits: u64) -> usize {
        let had_waiters = !self.waiters.is_empty();
        let n = self.waiters.notify(bits);
        self.release_waiter_pin(had_waiters);
        if n > 0 {
            tracing::debug!(ino = %self.ino, bits, woken = n, "notify");
        }
        n
    }

    /// Cancels every waiter matching `mask`.
    pub fn cancel_waiters(&mut self, mask: u64) -> usize {
        let had_waiters = !self.waiters.is_empty();
        let n = self.waiters.cancel(mask);
        self.release_waiter_pin(had_waiters);
        n
    }

    fn release_waiter_pin(&mut self, had_waiters: bool) {
        if had_waiters && self.waiters.is_empty() {
            // Waiter pin was taken by the first register_waiter.
            let _ = self.unpin(PinReason::Waiter);
        }
    }

    /// Returns true if any waiter overlaps `mask`.
    pub fn has_waiters(&self, mask: u64) -> bool {
        self.waiters.has_waiters(mask)
    }

    // -- replicas --

    /// Records a replica on `server` and returns its new nonce.
    pub fn add_replica(&mut self, server: ServerId) -> u32 {
        if self.replicas.is_empty() {
            self.pin(PinReason::Replicated);
        }
        let nonce = self.replicas.get(&server).map_or(1, |n| n + 1);
        self.replicas.insert(server, nonce);
        nonce
    }

    /// Records a replica on `server` with a known nonce.
    pub fn set_replica(&mut self, server: ServerId, nonce: u32) {
        if self.replicas.is_empty() {
            self.pin(PinReason::Replicated);
        }
        self.replicas.insert(server, nonce);
    }

    /// Forgets the replica on `server`.
    pub fn remove_replica(&mut self, server: ServerId) -> Result<()> {
        if self.replicas.remove(&server).is_none() {
            return Err(CacheError::ReplicaMissing {
                ino: self.ino,
                server,
            });
        }
        if self.replicas.is_empty() {
            self.unpin(PinReason::Replicated)?;
        }
        Ok(())
    }

    /// Replaces the whole replica set, keeping the replicated pin in sync.
    pub fn set_replicas(&mut self, replicas: BTreeMap<ServerId, u32>) -> Result<()> {
        let was = !self.replicas.is_empty();
        let now = !replicas.is_empty();
        self.replicas = replicas;
        match (was, now) {
            (false, true) => self.pin(PinReason::Replicated),
            (true, false) => self.unpin(PinReason::Replicated)?,
            _ => {}
        }
        Ok(())
    }

    /// Forgets every replica.
    pub fn clear_replicas(&mut self) -> Result<()> {
        self.set_replicas(BTreeMap::new())
    }

    /// Servers holding replicas, with their nonces.
    pub fn replicas(&self) -> &BTreeMap<ServerId, u32> {
        &self.replicas
    }

    /// Nonce of the replica on `server`.
    pub fn replica_nonce_for(&self, server: ServerId) -> Option<u32> {
        self.replicas.get(&server).copied()
    }

    /// Returns true if any other server holds a replica.
    pub fn is_replicated(&self) -> bool {
        !self.replicas.is_empty()
    }

    /// Nonce the authority assigned to this server's copy.
    pub fn replica_nonce(&self) -> u32 {
        self.replica_nonce
    }

    /// Sets the nonce the authority assigned to this server's copy.
    pub fn set_replica_nonce(&mut self, nonce: u32) {
        self.replica_nonce = nonce;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn make_object() -> CacheObject {
        CacheObject::new(InodeId::new(10), true)
    }

    fn recorder() -> (Rc<RefCell<Vec<(u32, WakeReason)>>>, impl Fn(u32) -> Waiter) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let log2 = log.clone();
        let make = move |tag: u32| -> Waiter {
            let log = log2.clone();
            Box::new(move |why| log.borrow_mut().push((tag, why)))
        };
        (log, make)
    }

    #[test]
    fn test_pin_unpin_counts() {
        let mut obj = make_object();
        obj.pin(PinReason::Request);
        obj.pin(PinReason::Request);
        obj.pin(PinReason::Caps);
        assert_eq!(obj.pin_count(), 3);
        assert_eq!(obj.pin_count_for(PinReason::Request), 2);

        obj.unpin(PinReason::Request).unwrap();
        obj.unpin(PinReason::Request).unwrap();
        assert!(!obj.has_pin(PinReason::Request));
        assert!(obj.is_pinned());
        assert!(!obj.is_evictable());
        obj.unpin(PinReason::Caps).unwrap();
        assert!(!obj.is_pinned());
        assert!(obj.is_evictable());
    }

    #[test]
    fn test_unpin_never_pinned() {
        let mut obj = make_object();
        obj.pin(PinReason::Dir);
        match obj.unpin(PinReason::AuthPin) {
            Err(CacheError::PinUnderflow { reason, .. }) => assert_eq!(reason, PinReason::AuthPin),
            other => panic!("expected PinUnderflow, got {:?}", other),
        }
        assert_eq!(obj.pin_count(), 1);
    }

    #[test]
    fn test_custom_pins_are_distinct() {
        let mut obj = make_object();
        obj.pin(PinReason::Custom(1));
        assert!(obj.unpin(PinReason::Custom(2)).is_err());
        obj.unpin(PinReason::Custom(1)).unwrap();
    }

    #[test]
    fn test_waiters_fire_in_registration_order() {
        let mut obj = make_object();
        let (log, make) = recorder();
        obj.register_waiter(0b01, make(1));
        obj.register_waiter(0b10, make(2));
        obj.register_waiter(0b11, make(3));
        assert!(obj.has_pin(PinReason::Waiter));

        assert_eq!(obj.notify(0b01), 2);
        assert_eq!(
            *log.borrow(),
            vec![(1, WakeReason::Ready), (3, WakeReason::Ready)]
        );
        assert!(obj.has_pin(PinReason::Waiter));

        // Already fired waiters do not run again.
        assert_eq!(obj.notify(0b01), 0);
        assert_eq!(obj.notify(0b10), 1);
        assert_eq!(log.borrow().len(), 3);
        assert!(!obj.has_pin(PinReason::Waiter));
        assert!(!obj.is_pinned());
    }

    #[test]
    fn test_cancel_waiters() {
        let mut obj = make_object();
        let (log, make) = recorder();
        obj.register_waiter(0b100, make(7));
        assert!(obj.has_waiters(0b100));
        assert_eq!(obj.cancel_waiters(u64::MAX), 1);
        assert_eq!(*log.borrow(), vec![(7, WakeReason::Cancelled)]);
        assert!(!obj.is_pinned());
    }

    #[test]
    fn test_replicas_pin_and_nonce() {
        let mut obj = make_object();
        let s1 = ServerId::new(1);
        let s2 = ServerId::new(2);
        assert_eq!(obj.add_replica(s1), 1);
        assert_eq!(obj.add_replica(s1), 2);
        assert_eq!(obj.add_replica(s2), 1);
        assert_eq!(obj.pin_count_for(PinReason::Replicated), 1);

        obj.remove_replica(s1).unwrap();
        assert!(obj.is_replicated());
        obj.remove_replica(s2).unwrap();
        assert!(!obj.is_replicated());
        assert!(!obj.is_pinned());

        match obj.remove_replica(s2) {
            Err(CacheError::ReplicaMissing { server, .. }) => assert_eq!(server, s2),
            other => panic!("expected ReplicaMissing, got {:?}", other),
        }
    }

    #[test]
    fn test_set_replicas_keeps_pin_in_sync() {
        let mut obj = make_object();
        let mut set = BTreeMap::new();
        set.insert(ServerId::new(4), 3);
        obj.set_replicas(set.clone()).unwrap();
        obj.set_replicas(set).unwrap();
        assert_eq!(obj.pin_count_for(PinReason::Replicated), 1);
        obj.clear_replicas().unwrap();
        assert!(!obj.is_pinned());
    }

    #[test]
    fn test_dirty_pin() {
        let mut obj = make_object();
        obj.mark_dirty();
        obj.mark_dirty();
        assert_eq!(obj.pin_count_for(PinReason::Dirty), 1);
        obj.mark_clean().unwrap();
        obj.mark_clean().unwrap();
        assert!(!obj.is_pinned());
    }

    #[test]
    fn test_state_flags() {
        let mut flags = StateFlags::default();
        flags.insert(StateFlags::FREEZING | StateFlags::AUTH);
        assert!(flags.contains(StateFlags::AUTH));
        assert!(flags.intersects(StateFlags::FROZEN | StateFlags::FREEZING));
        flags.remove(StateFlags::FREEZING);
        assert!(!flags.intersects(StateFlags::FREEZING));
    }
}

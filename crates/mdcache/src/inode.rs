//! The cached inode.
//!
//! `InodeObject` composes the cache-object substrate, one consistency lock per
//! attribute group and the client capability ledger with the inode's own
//! state: attributes, directory fragments, parent links, auth pins and
//! popularity. Pins that mirror structural state (capabilities present,
//! fragments open, auth pins held, remote parents, replicas) are taken and
//! dropped here and nowhere else.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::access::{AncestorAuthPins, AuthPinAccess, CapabilityAccess};
use crate::capability::{CapMask, Capability, CapabilityLedger, LedgerTransition};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::frag::{hash_dentry_name, DirFragId, FragId, FragTree};
use crate::fragment::{FragmentHandle, FragmentService};
use crate::lock::{ConsistencyLock, LockKind, LockWait};
use crate::object::{CacheObject, PinReason, StateFlags, Waiter};
use crate::popularity::Popularity;
use crate::snapshot::DiscoverSnapshot;
use crate::types::{ClientId, DentryRef, InodeAttr, InodeId, ServerId, Timestamp};

/// A slave server agreed to a multi-server update.
pub const WAIT_SLAVEAGREE: u64 = 1 << 0;
/// Auth pins may be granted again.
pub const WAIT_AUTHPINNABLE: u64 = 1 << 1;
/// A directory fragment finished opening.
pub const WAIT_DIR: u64 = 1 << 2;
/// The inode became anchored.
pub const WAIT_ANCHORED: u64 = 1 << 3;
/// The inode's anchor was removed.
pub const WAIT_UNANCHORED: u64 = 1 << 4;
/// Client capabilities changed.
pub const WAIT_CAPS: u64 = 1 << 5;
/// Every wait bit, including the per-lock ones.
pub const WAIT_ANY: u64 = u64::MAX;

/// Outcome of a replica asking the authority for capability bits.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CapRequest {
    /// Send a request for these bits to the authority.
    Send(CapMask),
    /// An identical request is still outstanding.
    Pending,
}

/// Freeze state of the directory containing this inode.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DirFreeze {
    /// Not freezing.
    Thawed,
    /// Waiting for auth pins to drain.
    Freezing,
    /// Frozen.
    Frozen,
}

/// One inode as cached by a metadata server.
#[derive(Debug)]
pub struct InodeObject {
    attr: InodeAttr,
    symlink: Option<String>,
    dirfragtree: FragTree,
    dirfrag_size: BTreeMap<FragId, u32>,
    fragments: BTreeMap<FragId, Box<dyn FragmentHandle>>,
    primary_parent: Option<DentryRef>,
    remote_parents: BTreeSet<DentryRef>,
    caps: CapabilityLedger,
    replica_caps_wanted: CapMask,
    replica_caps_wanted_keep_until: Option<Timestamp>,
    auth_pins: u32,
    nested_auth_pins: u32,
    locks: [ConsistencyLock; 5],
    popularity: Popularity,
    object: CacheObject,
}

impl InodeObject {
    fn build(attr: InodeAttr, auth: bool, config: &CacheConfig) -> Self {
        let ino = attr.ino;
        Self {
            attr,
            symlink: None,
            dirfragtree: FragTree::new(),
            dirfrag_size: BTreeMap::new(),
            fragments: BTreeMap::new(),
            primary_parent: None,
            remote_parents: BTreeSet::new(),
            caps: CapabilityLedger::new(ino),
            replica_caps_wanted: CapMask::NONE,
            replica_caps_wanted_keep_until: None,
            auth_pins: 0,
            nested_auth_pins: 0,
            locks: LockKind::ALL.map(|kind| ConsistencyLock::new(kind, auth)),
            popularity: Popularity::new(config.popularity_half_life_secs),
            object: CacheObject::new(ino, auth),
        }
    }

    /// Creates an inode this server is authoritative for.
    pub fn new_auth(attr: InodeAttr, config: &CacheConfig) -> Self {
        let inode = Self::build(attr, true, config);
        tracing::debug!(ino = %inode.ino(), "new auth inode");
        inode
    }

    /// Creates a replica of an inode owned by another server.
    pub fn new_replica(attr: InodeAttr, config: &CacheConfig) -> Self {
        let inode = Self::build(attr, false, config);
        tracing::debug!(ino = %inode.ino(), "new replica inode");
        inode
    }

    /// Creates the authoritative root (or an orphan container), which never
    /// has a primary parent.
    pub fn new_root(attr: InodeAttr, config: &CacheConfig) -> Self {
        let mut inode = Self::build(attr, true, config);
        inode.object.state_set(StateFlags::ROOT);
        inode
    }

    // -- accessors --

    /// Inode number.
    pub fn ino(&self) -> InodeId {
        self.attr.ino
    }

    /// Inode attributes.
    pub fn attr(&self) -> &InodeAttr {
        &self.attr
    }

    /// Mutable inode attributes.
    pub fn attr_mut(&mut self) -> &mut InodeAttr {
        &mut self.attr
    }

    pub(crate) fn set_attr(&mut self, attr: InodeAttr) {
        self.attr = attr;
    }

    /// Symlink target, for symbolic links.
    pub fn symlink(&self) -> Option<&str> {
        self.symlink.as_deref()
    }

    /// Sets the symlink target.
    pub fn set_symlink(&mut self, target: Option<String>) {
        self.symlink = target;
    }

    /// Directory fragmentation map.
    pub fn dirfragtree(&self) -> &FragTree {
        &self.dirfragtree
    }

    /// Replaces the directory fragmentation map.
    pub fn set_dirfragtree(&mut self, tree: FragTree) {
        self.dirfragtree = tree;
    }

    /// Splits a leaf of the fragmentation map.
    pub fn split_dirfrag(&mut self, frag: FragId, bits: u8) -> Result<Vec<FragId>> {
        if !self.attr.is_dir() {
            return Err(CacheError::NotADirectory(self.ino()));
        }
        self.dirfragtree.split(frag, bits)
    }

    /// Cache-object substrate: pins, state flags, waiters and replicas.
    pub fn object(&self) -> &CacheObject {
        &self.object
    }

    /// Returns true if this server is the authority.
    pub fn is_auth(&self) -> bool {
        self.object.is_auth()
    }

    /// Returns true for the root or an orphan container.
    pub fn is_root(&self) -> bool {
        self.object.state_test(StateFlags::ROOT)
    }

    /// Returns true if other servers hold replicas.
    pub fn is_replicated(&self) -> bool {
        self.object.is_replicated()
    }

    /// Returns true if unjournaled changes are held.
    pub fn is_dirty(&self) -> bool {
        self.object.is_dirty()
    }

    /// Popularity counters.
    pub fn popularity(&self) -> &Popularity {
        &self.popularity
    }

    /// Mutable popularity counters.
    pub fn popularity_mut(&mut self) -> &mut Popularity {
        &mut self.popularity
    }

    /// Capability ledger.
    pub fn client_caps(&self) -> &CapabilityLedger {
        &self.caps
    }

    // -- pins and waiters --

    /// Takes a caller-driven pin (request, import, journal and custom pins).
    pub fn pin(&mut self, reason: PinReason) -> Result<()> {
        if reason.is_structural() {
            return Err(CacheError::StructuralPin {
                ino: self.ino(),
                reason,
            });
        }
        self.object.pin(reason);
        Ok(())
    }

    /// Drops a caller-driven pin.
    pub fn unpin(&mut self, reason: PinReason) -> Result<()> {
        if reason.is_structural() {
            return Err(CacheError::StructuralPin {
                ino: self.ino(),
                reason,
            });
        }
        self.object.unpin(reason)
    }

    /// Registers `waiter` for any bit in `mask`.
    pub fn add_waiter(&mut self, mask: u64, waiter: Waiter) {
        self.object.register_waiter(mask, waiter);
    }

    /// Fires waiters matching `bits`.
    pub fn notify(&mut self, bits: u64) -> usize {
        self.object.notify(bits)
    }

    /// Cancels waiters matching `mask`.
    pub fn cancel_waiters(&mut self, mask: u64) -> usize {
        self.object.cancel_waiters(mask)
    }

    // -- fragments --

    /// Open handle for `frag`, if any.
    pub fn fragment(&self, frag: FragId) -> Option<&dyn FragmentHandle> {
        self.fragments.get(&frag).map(|h| &**h)
    }

    /// Ids of every open fragment.
    pub fn fragments(&self) -> impl Iterator<Item = FragId> + '_ {
        self.fragments.keys().copied()
    }

    /// Number of open fragments.
    pub fn num_fragments(&self) -> usize {
        self.fragments.len()
    }

    /// Attaches an already opened fragment.
    pub fn open_fragment(&mut self, handle: Box<dyn FragmentHandle>) -> Result<()> {
        if !self.attr.is_dir() {
            return Err(CacheError::NotADirectory(self.ino()));
        }
        let dirfrag = handle.dirfrag();
        if dirfrag.ino != self.ino() || self.fragments.contains_key(&dirfrag.frag) {
            return Err(CacheError::FragmentOpen(dirfrag));
        }
        self.fragments.insert(dirfrag.frag, handle);
        self.object.pin(PinReason::Dir);
        self.object.notify(WAIT_DIR);
        tracing::debug!(ino = %self.ino(), frag = %dirfrag.frag, "opened dirfrag");
        Ok(())
    }

    /// Returns the open handle for `frag`, opening it through `service` if needed.
    pub fn get_or_create_fragment(
        &mut self,
        frag: FragId,
        service: &mut dyn FragmentService,
    ) -> Result<&dyn FragmentHandle> {
        if !self.attr.is_dir() {
            return Err(CacheError::NotADirectory(self.ino()));
        }
        let dirfrag = DirFragId::new(self.ino(), frag);
        if !self.fragments.contains_key(&frag) {
            let handle = service.get_or_create(dirfrag)?;
            self.open_fragment(handle)?;
        }
        self.fragment(frag)
            .ok_or(CacheError::FragmentMissing(dirfrag))
    }

    /// Closes one fragment.
    pub fn close_fragment(&mut self, frag: FragId) -> Result<()> {
        let handle = self
            .fragments
            .remove(&frag)
            .ok_or(CacheError::FragmentMissing(DirFragId::new(self.ino(), frag)))?;
        handle.close();
        self.object.unpin(PinReason::Dir)
    }

    /// Closes every open fragment.
    pub fn close_all_fragments(&mut self) -> Result<()> {
        let open = std::mem::take(&mut self.fragments);
        let n = open.len();
        for handle in open.into_values() {
            handle.close();
        }
        for _ in 0..n {
            self.object.unpin(PinReason::Dir)?;
        }
        Ok(())
    }

    /// Leaf fragment a dentry name hashes into.
    pub fn pick_dirfrag(&self, name: &str) -> FragId {
        self.dirfragtree.pick(hash_dentry_name(name))
    }

    /// Advisory entry count of `frag`.
    pub fn fragment_size_hint(&self, frag: FragId) -> Option<u32> {
        self.dirfrag_size.get(&frag).copied()
    }

    /// Every advisory fragment size.
    pub fn fragment_size_hints(&self) -> &BTreeMap<FragId, u32> {
        &self.dirfrag_size
    }

    /// Records an advisory entry count for `frag`.
    pub fn set_fragment_size_hint(&mut self, frag: FragId, entries: u32) {
        self.dirfrag_size.insert(frag, entries);
    }

    // -- parents --

    /// Primary parent dentry.
    pub fn primary_parent(&self) -> Option<&DentryRef> {
        self.primary_parent.as_ref()
    }

    /// Sets the primary parent. Fails if one is already set.
    pub fn set_primary_parent(&mut self, dentry: DentryRef) -> Result<()> {
        if let Some(existing) = &self.primary_parent {
            tracing::error!(ino = %self.ino(), %existing, new = %dentry, "second primary parent");
            return Err(CacheError::PrimaryParentExists {
                ino: self.ino(),
                existing: existing.clone(),
            });
        }
        self.primary_parent = Some(dentry);
        Ok(())
    }

    /// Clears the primary parent, which must be `dentry`.
    pub fn remove_primary_parent(&mut self, dentry: &DentryRef) -> Result<()> {
        if self.primary_parent.as_ref() != Some(dentry) {
            return Err(CacheError::PrimaryParentMismatch {
                ino: self.ino(),
                dentry: dentry.clone(),
            });
        }
        self.primary_parent = None;
        Ok(())
    }

    /// Remote (hard link) parents.
    pub fn remote_parents(&self) -> &BTreeSet<DentryRef> {
        &self.remote_parents
    }

    /// Number of remote parents.
    pub fn num_remote_parents(&self) -> usize {
        self.remote_parents.len()
    }

    /// Adds a remote parent.
    pub fn add_remote_parent(&mut self, dentry: DentryRef) -> Result<()> {
        if self.remote_parents.contains(&dentry) {
            return Err(CacheError::RemoteParentExists {
                ino: self.ino(),
                dentry,
            });
        }
        if self.remote_parents.is_empty() {
            self.object.pin(PinReason::RemoteParent);
        }
        self.remote_parents.insert(dentry);
        Ok(())
    }

    /// Removes a remote parent. Fails if `dentry` is not one.
    pub fn remove_remote_parent(&mut self, dentry: &DentryRef) -> Result<()> {
        if !self.remote_parents.remove(dentry) {
            tracing::error!(ino = %self.ino(), %dentry, "remove of unknown remote parent");
            return Err(CacheError::RemoteParentMissing {
                ino: self.ino(),
                dentry: dentry.clone(),
            });
        }
        if self.remote_parents.is_empty() {
            self.object.unpin(PinReason::RemoteParent)?;
        }
        Ok(())
    }

    /// Returns true if any dentry links to this inode.
    pub fn is_linked(&self) -> bool {
        self.primary_parent.is_some() || !self.remote_parents.is_empty()
    }

    // -- freeze --

    /// Returns true if this inode or its directory is frozen.
    pub fn is_frozen(&self) -> bool {
        self.object
            .state_test(StateFlags::FROZEN | StateFlags::FROZEN_DIR)
    }

    /// Returns true if the containing directory is frozen.
    pub fn is_frozen_dir(&self) -> bool {
        self.object.state_test(StateFlags::FROZEN_DIR)
    }

    /// Returns true while a freeze waits for auth pins to drain.
    pub fn is_freezing(&self) -> bool {
        self.object
            .state_test(StateFlags::FREEZING | StateFlags::FREEZING_DIR)
    }

    /// Starts freezing. Returns true if the inode is frozen on return.
    pub fn freeze(&mut self) -> Result<bool> {
        if !self.is_auth() {
            return Err(CacheError::NotAuthority { ino: self.ino() });
        }
        if !self.object.state_test(StateFlags::FROZEN) {
            self.object.state_set(StateFlags::FREEZING);
            self.maybe_finish_freeze();
        }
        Ok(self.object.state_test(StateFlags::FROZEN))
    }

    /// Completes a freeze. Fails while auth pins are held here or below.
    pub fn mark_frozen(&mut self) -> Result<()> {
        let count = self.auth_pins + self.nested_auth_pins;
        if count > 0 {
            return Err(CacheError::Pinned {
                ino: self.ino(),
                count,
            });
        }
        self.object.state_clear(StateFlags::FREEZING);
        self.object.state_set(StateFlags::FROZEN);
        tracing::debug!(ino = %self.ino(), "frozen");
        Ok(())
    }

    fn maybe_finish_freeze(&mut self) {
        if self.object.state_test(StateFlags::FREEZING)
            && self.auth_pins == 0
            && self.nested_auth_pins == 0
        {
            self.object.state_clear(StateFlags::FREEZING);
            self.object.state_set(StateFlags::FROZEN);
            tracing::debug!(ino = %self.ino(), "auth pins drained, frozen");
        }
    }

    /// Lifts a freeze of this inode and wakes auth pin waiters.
    pub fn unfreeze(&mut self) -> usize {
        let flags = StateFlags::FREEZING | StateFlags::FROZEN;
        if !self.object.state_test(flags) {
            return 0;
        }
        self.object.state_clear(flags);
        self.authpinnable_changed()
    }

    /// Mirrors the freeze state of the containing directory.
    pub fn set_dir_freeze(&mut self, freeze: DirFreeze) -> usize {
        let flags = StateFlags::FREEZING_DIR | StateFlags::FROZEN_DIR;
        let was = self.object.state_test(flags);
        self.object.state_clear(flags);
        match freeze {
            DirFreeze::Freezing => self.object.state_set(StateFlags::FREEZING_DIR),
            DirFreeze::Frozen => self.object.state_set(StateFlags::FROZEN_DIR),
            DirFreeze::Thawed if was => return self.authpinnable_changed(),
            DirFreeze::Thawed => {}
        }
        0
    }

    fn authpinnable_changed(&mut self) -> usize {
        if self.can_auth_pin() {
            self.object.notify(WAIT_AUTHPINNABLE)
        } else {
            0
        }
    }

    // -- export --

    /// Marks the inode as being exported; auth pins are refused until
    /// [`finish_export`](Self::finish_export) or
    /// [`cancel_export`](Self::cancel_export).
    pub fn start_export(&mut self) -> Result<()> {
        if !self.is_auth() {
            return Err(CacheError::NotAuthority { ino: self.ino() });
        }
        self.object.state_set(StateFlags::EXPORTING);
        Ok(())
    }

    /// Abandons an export.
    pub fn cancel_export(&mut self) -> usize {
        if !self.object.state_test(StateFlags::EXPORTING) {
            return 0;
        }
        self.object.state_clear(StateFlags::EXPORTING);
        self.authpinnable_changed()
    }

    /// Turns the former authority into a replica once the importer has
    /// taken over: drops the replica set, keeps the export nonce, and moves
    /// each lock to the state a replica holds.
    pub fn finish_export(&mut self, config: &CacheConfig) -> Result<()> {
        if !self.is_auth() {
            return Err(CacheError::NotAuthority { ino: self.ino() });
        }
        for lock in self.locks.iter_mut() {
            let state = lock.replica_state();
            lock.set_state(state)?;
        }
        self.object
            .state_clear(StateFlags::AUTH | StateFlags::EXPORTING);
        self.object.clear_replicas()?;
        self.object.set_replica_nonce(config.export_nonce);
        self.object.mark_clean()?;
        self.popularity = Popularity::new(config.popularity_half_life_secs);
        tracing::info!(ino = %self.ino(), nonce = config.export_nonce, "export finished");
        Ok(())
    }

    /// Makes this server the authority after an import from `from`.
    pub(crate) fn become_auth(&mut self, me: ServerId, from: ServerId, config: &CacheConfig) -> Result<()> {
        self.object.state_set(StateFlags::AUTH);
        self.object.set_replica_nonce(0);
        self.replica_caps_wanted = CapMask::NONE;
        self.replica_caps_wanted_keep_until = None;
        if self.object.replica_nonce_for(me).is_some() {
            self.object.remove_replica(me)?;
        }
        self.object.set_replica(from, config.export_nonce);
        Ok(())
    }

    // -- replicas --

    /// Assigns a replica nonce to a new (or refreshed) replica on `server`
    /// and captures what that server needs to build it. The first replica
    /// relaxes exclusive locks so replicas may read.
    pub fn replicate_to(&mut self, server: ServerId) -> Result<DiscoverSnapshot> {
        if !self.is_auth() {
            return Err(CacheError::NotAuthority { ino: self.ino() });
        }
        if !self.is_replicated() {
            self.replicate_relax_locks()?;
        }
        let nonce = self.object.add_replica(server);
        tracing::debug!(ino = %self.ino(), %server, nonce, "replicating");
        Ok(DiscoverSnapshot::capture(self, nonce))
    }

    /// Forgets the replica on `server` along with its forwarded wanted bits.
    pub fn remove_replica(&mut self, server: ServerId) -> Result<()> {
        self.object.remove_replica(server)?;
        self.caps.clear_replica_wanted(server);
        Ok(())
    }

    pub(crate) fn set_replicas(&mut self, replicas: BTreeMap<ServerId, u32>) -> Result<()> {
        self.object.set_replicas(replicas)
    }

    pub(crate) fn set_replica_nonce(&mut self, nonce: u32) {
        self.object.set_replica_nonce(nonce);
    }

    // -- locks --

    /// Lock for `kind`.
    pub fn lock(&self, kind: LockKind) -> &ConsistencyLock {
        &self.locks[kind.index()]
    }

    /// Mutable lock for `kind`.
    pub fn lock_mut(&mut self, kind: LockKind) -> &mut ConsistencyLock {
        &mut self.locks[kind.index()]
    }

    /// Relaxes unused exclusive locks to shared before the first replica is
    /// created. The file lock stays exclusive while any client holds a
    /// file-write capability.
    pub fn replicate_relax_locks(&mut self) -> Result<()> {
        if !self.is_auth() {
            return Err(CacheError::NotAuthority { ino: self.ino() });
        }
        if self.is_replicated() {
            return Err(CacheError::AlreadyReplicated { ino: self.ino() });
        }
        let writers = self.caps_issued().is_file_write();
        let ino = self.ino();
        for lock in self.locks.iter_mut() {
            if lock.kind() == LockKind::File && writers {
                tracing::debug!(%ino, "file writers present, file lock stays exclusive");
                continue;
            }
            lock.replicate_relax();
        }
        Ok(())
    }

    /// Registers `waiter` for `wait` on the lock for `kind`.
    pub fn add_lock_waiter(&mut self, kind: LockKind, wait: LockWait, waiter: Waiter) {
        self.object.register_waiter(kind.wait_bit(wait), waiter);
    }

    /// Takes a local read lock.
    pub fn rdlock(&mut self, kind: LockKind) -> Result<()> {
        let auth = self.is_auth();
        self.locks[kind.index()].get_rdlock(auth)
    }

    /// Drops a local read lock, waking writers and stability waiters when
    /// it was the last holder.
    pub fn rdunlock(&mut self, kind: LockKind) -> Result<()> {
        if self.locks[kind.index()].put_rdlock()? {
            self.object
                .notify(kind.wait_bit(LockWait::Wr) | kind.wait_bit(LockWait::Stable));
        }
        Ok(())
    }

    /// Takes a local write lock.
    pub fn wrlock(&mut self, kind: LockKind) -> Result<()> {
        let auth = self.is_auth();
        self.locks[kind.index()].get_wrlock(auth)
    }

    /// Drops a local write lock, waking readers and stability waiters when
    /// it was the last holder.
    pub fn wrunlock(&mut self, kind: LockKind) -> Result<()> {
        if self.locks[kind.index()].put_wrlock()? {
            self.object
                .notify(kind.wait_bit(LockWait::Rd) | kind.wait_bit(LockWait::Stable));
        }
        Ok(())
    }

    /// Starts moving `kind` to exclusive, waiting on every replica.
    /// Returns true if the lock is exclusive on return.
    pub fn lock_start_exclusive(&mut self, kind: LockKind) -> Result<bool> {
        if !self.is_auth() {
            return Err(CacheError::NotAuthority { ino: self.ino() });
        }
        let done = self.locks[kind.index()].start_exclusive(self.object.replicas().keys())?;
        if done {
            self.object.notify(kind.wait_mask());
        }
        Ok(done)
    }

    /// Opens `kind` for scattered writes.
    pub fn lock_start_scatter(&mut self, kind: LockKind) -> Result<()> {
        if !self.is_auth() {
            return Err(CacheError::NotAuthority { ino: self.ino() });
        }
        self.locks[kind.index()].start_scatter()?;
        self.object.notify(kind.wait_bit(LockWait::Wr));
        Ok(())
    }

    /// Starts gathering `kind` back to shared from every replica.
    /// Returns true if the lock is shared on return.
    pub fn lock_start_gather(&mut self, kind: LockKind) -> Result<bool> {
        if !self.is_auth() {
            return Err(CacheError::NotAuthority { ino: self.ino() });
        }
        let done = self.locks[kind.index()].start_gather(self.object.replicas().keys())?;
        if done {
            self.object.notify(kind.wait_mask());
        }
        Ok(done)
    }

    /// Records a replica's ack for a pending transition of `kind`.
    pub fn lock_handle_ack(&mut self, kind: LockKind, from: ServerId) -> Result<bool> {
        let done = self.locks[kind.index()].handle_ack(from)?;
        if done {
            self.object.notify(kind.wait_mask());
        }
        Ok(done)
    }

    // -- replica capability requests --

    /// On a replica, records that local clients want `bits` and decides
    /// whether the authority must be asked. A request is re-sent once the
    /// renewal deadline has passed.
    pub fn request_caps(
        &mut self,
        bits: CapMask,
        now: Timestamp,
        config: &CacheConfig,
    ) -> Result<CapRequest> {
        if self.is_auth() {
            return Err(CacheError::IsAuthority { ino: self.ino() });
        }
        let wanted = self.replica_caps_wanted | bits;
        let fresh = self
            .replica_caps_wanted_keep_until
            .map_or(false, |until| now < until);
        if wanted == self.replica_caps_wanted && fresh {
            return Ok(CapRequest::Pending);
        }
        self.replica_caps_wanted = wanted;
        self.replica_caps_wanted_keep_until = Some(now.plus_secs(config.caps_wanted_renew_secs));
        tracing::debug!(ino = %self.ino(), wanted = %wanted, "requesting caps from auth");
        Ok(CapRequest::Send(wanted))
    }

    /// Bits this replica has asked the authority for.
    pub fn replica_caps_wanted(&self) -> CapMask {
        self.replica_caps_wanted
    }

    /// Advisory deadline after which the request may be renewed.
    pub fn wanted_bits_expiry(&self) -> Option<Timestamp> {
        self.replica_caps_wanted_keep_until
    }

    fn apply_ledger_transition(&mut self, t: LedgerTransition) -> Result<()> {
        match t {
            LedgerTransition::BecameNonEmpty => self.object.pin(PinReason::Caps),
            LedgerTransition::BecameEmpty => self.object.unpin(PinReason::Caps)?,
            LedgerTransition::Unchanged => {}
        }
        Ok(())
    }

    // -- anchoring --

    /// Returns true if the inode is in the anchor table.
    pub fn is_anchored(&self) -> bool {
        self.attr.anchored
    }

    /// Returns true while an anchor update is in flight.
    pub fn is_anchoring(&self) -> bool {
        self.object.state_test(StateFlags::ANCHORING)
    }

    /// Starts adding an anchor. Returns false if already anchored or in flight.
    pub fn begin_anchor(&mut self) -> Result<bool> {
        if !self.is_auth() {
            return Err(CacheError::NotAuthority { ino: self.ino() });
        }
        if self.attr.anchored || self.is_anchoring() {
            return Ok(false);
        }
        self.object.state_set(StateFlags::ANCHORING);
        self.object.pin(PinReason::Anchoring);
        Ok(true)
    }

    /// Completes an anchor update.
    pub fn finish_anchor(&mut self) -> Result<usize> {
        self.object.unpin(PinReason::Anchoring)?;
        self.object.state_clear(StateFlags::ANCHORING);
        self.attr.anchored = true;
        Ok(self.object.notify(WAIT_ANCHORED))
    }

    /// Starts removing the anchor. Returns false if not anchored or in flight.
    pub fn begin_unanchor(&mut self) -> Result<bool> {
        if !self.is_auth() {
            return Err(CacheError::NotAuthority { ino: self.ino() });
        }
        if !self.attr.anchored || self.object.state_test(StateFlags::UNANCHORING) {
            return Ok(false);
        }
        self.object.state_set(StateFlags::UNANCHORING);
        self.object.pin(PinReason::Unanchoring);
        Ok(true)
    }

    /// Completes an anchor removal.
    pub fn finish_unanchor(&mut self) -> Result<usize> {
        self.object.unpin(PinReason::Unanchoring)?;
        self.object.state_clear(StateFlags::UNANCHORING);
        self.attr.anchored = false;
        Ok(self.object.notify(WAIT_UNANCHORED))
    }

    // -- dirtiness --

    /// Version the next journaled change will carry.
    pub fn pre_dirty(&self) -> u64 {
        self.attr.version + 1
    }

    /// Marks the inode dirty at `version`.
    pub fn mark_dirty(&mut self, version: u64) {
        self.attr.version = version;
        self.object.mark_dirty();
    }

    /// Marks the inode clean.
    pub fn mark_clean(&mut self) -> Result<()> {
        self.object.mark_clean()
    }
}

impl AuthPinAccess for InodeObject {
    fn can_auth_pin(&self) -> bool {
        self.is_auth()
            && !self.object.state_test(
                StateFlags::FREEZING
                    | StateFlags::FROZEN
                    | StateFlags::FREEZING_DIR
                    | StateFlags::FROZEN_DIR
                    | StateFlags::EXPORTING,
            )
    }

    fn auth_pin(&mut self, ancestors: &mut dyn AncestorAuthPins) -> Result<()> {
        if !self.is_auth() {
            return Err(CacheError::NotAuthority { ino: self.ino() });
        }
        if !self.can_auth_pin() {
            tracing::debug!(ino = %self.ino(), state = self.object.state().0, "auth pin refused");
            return Err(CacheError::AuthPinRefused { ino: self.ino() });
        }
        if self.auth_pins == 0 {
            self.object.pin(PinReason::AuthPin);
        }
        self.auth_pins += 1;
        if let Some(parent) = &self.primary_parent {
            ancestors.adjust_nested_auth_pins(parent, 1);
        }
        tracing::trace!(ino = %self.ino(), auth_pins = self.auth_pins, "auth_pin");
        Ok(())
    }

    fn auth_unpin(&mut self, ancestors: &mut dyn AncestorAuthPins) -> Result<()> {
        if self.auth_pins == 0 {
            tracing::error!(ino = %self.ino(), "auth_unpin with no auth pins");
            return Err(CacheError::AuthPinUnderflow { ino: self.ino() });
        }
        self.auth_pins -= 1;
        if self.auth_pins == 0 {
            self.object.unpin(PinReason::AuthPin)?;
        }
        if let Some(parent) = &self.primary_parent {
            ancestors.adjust_nested_auth_pins(parent, -1);
        }
        tracing::trace!(ino = %self.ino(), auth_pins = self.auth_pins, "auth_unpin");
        self.maybe_finish_freeze();
        Ok(())
    }

    fn adjust_nested_auth_pins(
        &mut self,
        delta: i32,
        ancestors: &mut dyn AncestorAuthPins,
    ) -> Result<()> {
        let nested = i64::from(self.nested_auth_pins) + i64::from(delta);
        self.nested_auth_pins = u32::try_from(nested)
            .map_err(|_| CacheError::NestedAuthPinUnderflow { ino: self.ino() })?;
        if let Some(parent) = &self.primary_parent {
            ancestors.adjust_nested_auth_pins(parent, delta);
        }
        self.maybe_finish_freeze();
        Ok(())
    }

    fn auth_pin_count(&self) -> u32 {
        self.auth_pins
    }

    fn nested_auth_pin_count(&self) -> u32 {
        self.nested_auth_pins
    }
}

impl CapabilityAccess for InodeObject {
    fn add_client_cap(&mut self, client: ClientId, cap: Capability) -> Result<()> {
        let t = self.caps.add(client, cap)?;
        self.apply_ledger_transition(t)
    }

    fn remove_client_cap(&mut self, client: ClientId) -> Result<Capability> {
        let (cap, t) = self.caps.remove(client)?;
        self.apply_ledger_transition(t)?;
        self.object.notify(WAIT_CAPS);
        Ok(cap)
    }

    fn take_client_caps(&mut self) -> Result<BTreeMap<ClientId, Capability>> {
        let (taken, t) = self.caps.take_all();
        self.apply_ledger_transition(t)?;
        Ok(taken)
    }

    fn merge_client_caps(
        &mut self,
        incoming: BTreeMap<ClientId, Capability>,
        new_clients: &mut BTreeSet<ClientId>,
    ) -> Result<()> {
        let t = self.caps.merge(incoming, new_clients);
        self.apply_ledger_transition(t)
    }

    fn revoke_client_caps(&mut self, client: ClientId, bits: CapMask) -> Result<CapMask> {
        let left = self.caps.revoke(client, bits)?;
        self.object.notify(WAIT_CAPS);
        Ok(left)
    }

    fn caps_issued(&self) -> CapMask {
        self.caps.issued_union()
    }

    fn caps_wanted(&self) -> CapMask {
        self.caps.wanted_union(self.is_auth())
    }

    fn set_replica_caps_wanted(&mut self, server: ServerId, bits: CapMask) {
        self.caps.set_replica_wanted(server, bits);
    }
}

impl Drop for InodeObject {
    fn drop(&mut self) {
        if let Err(e) = self.close_all_fragments() {
            tracing::error!(ino = %self.ino(), error = %e, "closing fragments on drop");
        }
        self.object.cancel_waiters(WAIT_ANY);
    }
}

impl fmt::Display for InodeObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[inode {}", self.ino())?;
        if self.is_auth() {
            write!(f, " auth")?;
            if self.is_replicated() {
                write!(f, "{:?}", self.object.replicas())?;
            }
        } else {
            write!(f, " rep@{}", self.object.replica_nonce())?;
        }
        if self.is_dirty() {
            write!(f, " dirty")?;
        }
        if self.auth_pins > 0 || self.nested_auth_pins > 0 {
            write!(f, " ap={}+{}", self.auth_pins, self.nested_auth_pins)?;
        }
        write!(f, " pins={}]", self.object.pin_count())
    }
}

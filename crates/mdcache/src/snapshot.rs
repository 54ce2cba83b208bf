//! Replication snapshots.
//!
//! A [`DiscoverSnapshot`] lets another server build a read-coherent replica:
//! attributes, symlink, fragmentation map, the assigned nonce and the state
//! each lock should hold on the replica. An [`ExportSnapshot`] hands
//! authority over: it additionally carries the replica set, the authority's
//! full lock state, dirtiness, popularity and the whole capability ledger,
//! which is taken (not copied) from the exporting inode.
//!
//! Both are fixed-order bincode encodings with no version field. Decoding
//! validates the whole payload before any inode is touched.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::access::CapabilityAccess;
use crate::capability::Capability;
use crate::codec::{decode_exact, encode};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::frag::FragTree;
use crate::inode::InodeObject;
use crate::lock::{ConsistencyLock, LockKind, LockSnapshot, LockState};
use crate::popularity::{DecayCounter, PopClass};
use crate::types::{ClientId, InodeAttr, InodeId, ServerId, Timestamp};

/// What a new replica needs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DiscoverSnapshot {
    attr: InodeAttr,
    symlink: Option<String>,
    dirfragtree: FragTree,
    replica_nonce: u32,
    lock_states: [LockState; 5],
}

impl DiscoverSnapshot {
    /// Captures `inode` for a replica that was assigned `nonce`.
    pub fn capture(inode: &InodeObject, nonce: u32) -> Self {
        Self {
            attr: inode.attr().clone(),
            symlink: inode.symlink().map(str::to_string),
            dirfragtree: inode.dirfragtree().clone(),
            replica_nonce: nonce,
            lock_states: LockKind::ALL.map(|kind| inode.lock(kind).replica_state()),
        }
    }

    /// Inode the snapshot describes.
    pub fn ino(&self) -> InodeId {
        self.attr.ino
    }

    /// Nonce assigned to the replica.
    pub fn replica_nonce(&self) -> u32 {
        self.replica_nonce
    }

    /// State the replica's lock for `kind` takes.
    pub fn lock_state(&self, kind: LockKind) -> LockState {
        self.lock_states[kind.index()]
    }

    /// Serializes the snapshot.
    pub fn encode(&self) -> Result<Vec<u8>> {
        encode(self)
    }

    /// Deserializes and validates a snapshot.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let snap: DiscoverSnapshot = decode_exact(bytes)?;
        snap.validate()?;
        Ok(snap)
    }

    fn validate(&self) -> Result<()> {
        for kind in LockKind::ALL {
            let state = self.lock_state(kind);
            if !state.is_stable() || (state.is_scattered() && !kind.supports_scatter()) {
                return Err(CacheError::MalformedSnapshot(format!(
                    "replica {:?} lock cannot be {:?}",
                    kind, state
                )));
            }
        }
        check_contents(&self.attr, self.symlink.as_deref(), &self.dirfragtree)
    }

    /// Overwrites an existing replica with the snapshot.
    pub fn update_inode(&self, inode: &mut InodeObject) -> Result<()> {
        check_target(inode, self.ino())?;
        self.validate()?;
        inode.set_attr(self.attr.clone());
        inode.set_symlink(self.symlink.clone());
        inode.set_dirfragtree(self.dirfragtree.clone());
        inode.set_replica_nonce(self.replica_nonce);
        for kind in LockKind::ALL {
            inode.lock_mut(kind).set_state(self.lock_state(kind))?;
        }
        tracing::debug!(ino = %self.ino(), nonce = self.replica_nonce, "replica updated from discover");
        Ok(())
    }

    /// Builds a new replica from the snapshot.
    pub fn into_inode(self, config: &CacheConfig) -> Result<InodeObject> {
        let mut inode = InodeObject::new_replica(self.attr.clone(), config);
        self.update_inode(&mut inode)?;
        Ok(inode)
    }
}

/// Checks the parts both snapshots share: a symlink target exactly when the
/// inode is a symlink, and a well-formed fragment tree.
fn check_contents(attr: &InodeAttr, symlink: Option<&str>, tree: &FragTree) -> Result<()> {
    if symlink.is_some() != attr.is_symlink() {
        return Err(CacheError::MalformedSnapshot(format!(
            "symlink target presence does not match type of {}",
            attr.ino
        )));
    }
    tree.validate()
}

/// Snapshots only ever overwrite a replica of the inode they describe.
fn check_target(inode: &InodeObject, ino: InodeId) -> Result<()> {
    if inode.is_auth() {
        return Err(CacheError::IsAuthority { ino: inode.ino() });
    }
    if inode.ino() != ino {
        return Err(CacheError::InodeMismatch {
            target: inode.ino(),
            snapshot: ino,
        });
    }
    Ok(())
}

/// What a new authority needs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExportSnapshot {
    attr: InodeAttr,
    popularity_justme: DecayCounter,
    popularity_curdom: DecayCounter,
    is_dirty: bool,
    symlink: Option<String>,
    dirfragtree: FragTree,
    replicas: BTreeMap<ServerId, u32>,
    locks: Vec<u8>,
    cap_map: BTreeMap<ClientId, Capability>,
}

impl ExportSnapshot {
    /// Captures `inode` for export. The capability ledger is emptied and the
    /// exported share of popularity is moved out.
    pub fn capture(inode: &mut InodeObject, now: Timestamp) -> Result<Self> {
        if !inode.is_auth() {
            return Err(CacheError::NotAuthority { ino: inode.ino() });
        }
        let mut locks = Vec::new();
        for kind in LockKind::ALL {
            locks.extend(inode.lock(kind).encode_replica_state()?);
        }

        let pop = inode.popularity_mut();
        let popularity_justme = pop.take(PopClass::JustMe, now);
        let popularity_curdom = pop.take(PopClass::CurDom, now);
        pop.sub(PopClass::AnyDom, &popularity_curdom, now);
        pop.sub(PopClass::Nested, &popularity_curdom, now);

        let cap_map = inode.take_client_caps()?;
        tracing::debug!(ino = %inode.ino(), clients = cap_map.len(), "captured export");

        Ok(Self {
            attr: inode.attr().clone(),
            popularity_justme,
            popularity_curdom,
            is_dirty: inode.is_dirty(),
            symlink: inode.symlink().map(str::to_string),
            dirfragtree: inode.dirfragtree().clone(),
            replicas: inode.object().replicas().clone(),
            locks,
            cap_map,
        })
    }

    /// Inode the snapshot describes.
    pub fn ino(&self) -> InodeId {
        self.attr.ino
    }

    /// Attributes carried by the snapshot.
    pub fn attr(&self) -> &InodeAttr {
        &self.attr
    }

    /// Servers holding replicas at export time.
    pub fn replicas(&self) -> &BTreeMap<ServerId, u32> {
        &self.replicas
    }

    /// Exported capabilities.
    pub fn cap_map(&self) -> &BTreeMap<ClientId, Capability> {
        &self.cap_map
    }

    /// Serializes the snapshot.
    pub fn encode(&self) -> Result<Vec<u8>> {
        encode(self)
    }

    /// Deserializes and validates a snapshot, including its lock section.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let snap: ExportSnapshot = decode_exact(bytes)?;
        snap.decode_locks()?;
        check_contents(&snap.attr, snap.symlink.as_deref(), &snap.dirfragtree)?;
        Ok(snap)
    }

    fn decode_locks(&self) -> Result<Vec<LockSnapshot>> {
        let mut cursor = self.locks.as_slice();
        let mut out = Vec::with_capacity(LockKind::ALL.len());
        for kind in LockKind::ALL {
            out.push(ConsistencyLock::decode_replica_state(kind, &mut cursor)?);
        }
        if !cursor.is_empty() {
            return Err(CacheError::TrailingBytes(cursor.len()));
        }
        Ok(out)
    }

    /// Installs the snapshot into `inode` on the importing server and
    /// returns the clients it had not seen before.
    ///
    /// A directory mtime held locally while the dir lock is scattered may be
    /// newer than what the exporter gathered, so the later of the two wins.
    pub fn update_inode(self, inode: &mut InodeObject, now: Timestamp) -> Result<BTreeSet<ClientId>> {
        check_target(inode, self.ino())?;
        let lock_snaps = self.decode_locks()?;
        check_contents(&self.attr, self.symlink.as_deref(), &self.dirfragtree)?;

        let mut attr = self.attr;
        if inode.lock(LockKind::Dir).state().is_scattered() {
            attr.mtime = attr.mtime.max(inode.attr().mtime);
        }
        inode.set_attr(attr);
        inode.set_symlink(self.symlink);
        inode.set_dirfragtree(self.dirfragtree);

        let pop = inode.popularity_mut();
        pop.add(PopClass::JustMe, &self.popularity_justme, now);
        pop.add(PopClass::CurDom, &self.popularity_curdom, now);
        pop.add(PopClass::AnyDom, &self.popularity_curdom, now);
        pop.add(PopClass::Nested, &self.popularity_curdom, now);

        if self.is_dirty {
            let v = inode.attr().version;
            inode.mark_dirty(v);
        }

        inode.set_replicas(self.replicas)?;

        for (kind, snap) in LockKind::ALL.into_iter().zip(lock_snaps) {
            inode.lock_mut(kind).apply_snapshot(snap);
        }

        let mut new_clients = BTreeSet::new();
        inode.merge_client_caps(self.cap_map, &mut new_clients)?;
        tracing::debug!(ino = %inode.ino(), new_clients = new_clients.len(), "imported inode");
        Ok(new_clients)
    }
}

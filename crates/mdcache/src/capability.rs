//! Client capability ledger.
//!
//! Tracks, per connected client, the capability bits issued to it and the
//! bits it wants. On the authority the ledger also folds in the wanted bits
//! forwarded by replicas. The owning inode maps the ledger's empty/non-empty
//! transitions onto its `Caps` pin.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};

use crate::error::{CacheError, Result};
use crate::types::{ClientId, InodeId, ServerId};

/// Capability bits.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CapMask(pub u32);

impl CapMask {
    /// No capabilities.
    pub const NONE: CapMask = CapMask(0);
    /// May cache reads.
    pub const FILE_RDCACHE: CapMask = CapMask(1 << 0);
    /// May read.
    pub const FILE_RD: CapMask = CapMask(1 << 1);
    /// May write.
    pub const FILE_WR: CapMask = CapMask(1 << 2);
    /// May buffer writes.
    pub const FILE_WRBUFFER: CapMask = CapMask(1 << 3);
    /// May do lazy (non-coherent) io.
    pub const FILE_LAZYIO: CapMask = CapMask(1 << 4);

    /// Returns true if no bit is set.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Returns true if every bit of `other` is set.
    pub fn contains(&self, other: CapMask) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true if any bit of `other` is set.
    pub fn intersects(&self, other: CapMask) -> bool {
        self.0 & other.0 != 0
    }

    /// Returns true if any file-write capability is present.
    pub fn is_file_write(&self) -> bool {
        self.intersects(CapMask::FILE_WR | CapMask::FILE_WRBUFFER)
    }
}

impl BitOr for CapMask {
    type Output = CapMask;

    fn bitor(self, rhs: CapMask) -> CapMask {
        CapMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for CapMask {
    fn bitor_assign(&mut self, rhs: CapMask) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for CapMask {
    type Output = CapMask;

    fn bitand(self, rhs: CapMask) -> CapMask {
        CapMask(self.0 & rhs.0)
    }
}

impl Not for CapMask {
    type Output = CapMask;

    fn not(self) -> CapMask {
        CapMask(!self.0)
    }
}

impl fmt::Display for CapMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(CapMask, char); 5] = [
            (CapMask::FILE_RDCACHE, 'c'),
            (CapMask::FILE_RD, 'r'),
            (CapMask::FILE_WR, 'w'),
            (CapMask::FILE_WRBUFFER, 'b'),
            (CapMask::FILE_LAZYIO, 'l'),
        ];
        if self.is_empty() {
            return write!(f, "-");
        }
        for (bit, c) in NAMES {
            if self.contains(bit) {
                write!(f, "{}", c)?;
            }
        }
        Ok(())
    }
}

/// One client's capability record.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    issued: CapMask,
    wanted: CapMask,
    last_seq: u64,
}

impl Capability {
    /// Creates a record with the given bits.
    pub fn new(issued: CapMask, wanted: CapMask) -> Self {
        Self {
            issued,
            wanted,
            last_seq: 0,
        }
    }

    /// Bits currently in effect.
    pub fn issued(&self) -> CapMask {
        self.issued
    }

    /// Bits the client requested.
    pub fn wanted(&self) -> CapMask {
        self.wanted
    }

    /// Sequence number of the last issue.
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// Grants `bits` and returns the new issue sequence.
    pub fn issue(&mut self, bits: CapMask) -> u64 {
        self.issued |= bits;
        self.last_seq += 1;
        self.last_seq
    }

    /// Withdraws `bits`, returning what remains issued.
    pub fn revoke(&mut self, bits: CapMask) -> CapMask {
        self.issued = self.issued & !bits;
        self.issued
    }

    /// Replaces the wanted bits.
    pub fn set_wanted(&mut self, wanted: CapMask) {
        self.wanted = wanted;
    }

    /// Folds `other` into this record: bits are unioned, never overwritten.
    pub fn merge(&mut self, other: &Capability) {
        self.issued |= other.issued;
        self.wanted |= other.wanted;
        self.last_seq = self.last_seq.max(other.last_seq);
    }
}

/// How a ledger mutation changed its emptiness.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LedgerTransition {
    /// Emptiness did not change.
    Unchanged,
    /// The first client was added.
    BecameNonEmpty,
    /// The last client was removed.
    BecameEmpty,
}

impl LedgerTransition {
    fn between(was_empty: bool, is_empty: bool) -> Self {
        match (was_empty, is_empty) {
            (true, false) => LedgerTransition::BecameNonEmpty,
            (false, true) => LedgerTransition::BecameEmpty,
            _ => LedgerTransition::Unchanged,
        }
    }
}

/// Per-client capabilities of one inode.
#[derive(Clone, Debug)]
pub struct CapabilityLedger {
    ino: InodeId,
    caps: BTreeMap<ClientId, Capability>,
    replica_wanted: BTreeMap<ServerId, CapMask>,
}

impl CapabilityLedger {
    /// Creates an empty ledger for `ino`.
    pub fn new(ino: InodeId) -> Self {
        Self {
            ino,
            caps: BTreeMap::new(),
            replica_wanted: BTreeMap::new(),
        }
    }

    /// Returns true if no client holds a capability.
    pub fn is_empty(&self) -> bool {
        self.caps.is_empty()
    }

    /// Number of clients.
    pub fn len(&self) -> usize {
        self.caps.len()
    }

    /// Every client record.
    pub fn clients(&self) -> &BTreeMap<ClientId, Capability> {
        &self.caps
    }

    /// Record for `client`.
    pub fn get(&self, client: ClientId) -> Option<&Capability> {
        self.caps.get(&client)
    }

    /// Mutable record for `client`.
    pub fn get_mut(&mut self, client: ClientId) -> Option<&mut Capability> {
        self.caps.get_mut(&client)
    }

    /// Adds a new client. Fails if the client is already present.
    pub fn add(&mut self, client: ClientId, cap: Capability) -> Result<LedgerTransition> {
        if self.caps.contains_key(&client) {
            tracing::error!(ino = %self.ino, %client, "duplicate capability");
            return Err(CacheError::CapabilityExists {
                ino: self.ino,
                client,
            });
        }
        let was_empty = self.caps.is_empty();
        tracing::debug!(ino = %self.ino, %client, issued = %cap.issued, wanted = %cap.wanted, "add cap");
        self.caps.insert(client, cap);
        Ok(LedgerTransition::between(was_empty, false))
    }

    /// Removes a client. Fails if the client is absent.
    pub fn remove(&mut self, client: ClientId) -> Result<(Capability, LedgerTransition)> {
        match self.caps.remove(&client) {
            Some(cap) => {
                tracing::debug!(ino = %self.ino, %client, "remove cap");
                let t = LedgerTransition::between(false, self.caps.is_empty());
                Ok((cap, t))
            }
            None => {
                tracing::error!(ino = %self.ino, %client, "remove of missing capability");
                Err(CacheError::CapabilityMissing {
                    ino: self.ino,
                    client,
                })
            }
        }
    }

    /// Withdraws `bits` from `client`, returning what remains issued.
    pub fn revoke(&mut self, client: ClientId, bits: CapMask) -> Result<CapMask> {
        let ino = self.ino;
        let cap = self
            .caps
            .get_mut(&client)
            .ok_or(CacheError::CapabilityMissing { ino, client })?;
        let left = cap.revoke(bits);
        tracing::debug!(ino = %ino, %client, revoked = %bits, left = %left, "revoke");
        Ok(left)
    }

    /// OR of every client's issued bits.
    pub fn issued_union(&self) -> CapMask {
        self.caps
            .values()
            .fold(CapMask::NONE, |acc, c| acc | c.issued)
    }

    /// OR of every client's wanted bits, plus replica-forwarded bits when
    /// `is_auth`.
    pub fn wanted_union(&self, is_auth: bool) -> CapMask {
        let mut w = self
            .caps
            .values()
            .fold(CapMask::NONE, |acc, c| acc | c.wanted);
        if is_auth {
            for bits in self.replica_wanted.values() {
                w |= *bits;
            }
        }
        w
    }

    /// Empties the ledger, returning its previous contents.
    pub fn take_all(&mut self) -> (BTreeMap<ClientId, Capability>, LedgerTransition) {
        let was_empty = self.caps.is_empty();
        let taken = std::mem::take(&mut self.caps);
        tracing::debug!(ino = %self.ino, clients = taken.len(), "take all caps");
        (taken, LedgerTransition::between(was_empty, true))
    }

    /// Folds transferred capabilities in. Clients not already present are
    /// inserted and recorded in `new_clients`; present ones are merged.
    pub fn merge(
        &mut self,
        incoming: BTreeMap<ClientId, Capability>,
        new_clients: &mut BTreeSet<ClientId>,
    ) -> LedgerTransition {
        let was_empty = self.caps.is_empty();
        for (client, cap) in incoming {
            match self.caps.get_mut(&client) {
                Some(existing) => existing.merge(&cap),
                None => {
                    self.caps.insert(client, cap);
                    new_clients.insert(client);
                }
            }
        }
        LedgerTransition::between(was_empty, self.caps.is_empty())
    }

    /// Records the bits a replica server wants on behalf of its clients.
    pub fn set_replica_wanted(&mut self, server: ServerId, bits: CapMask) {
        if bits.is_empty() {
            self.replica_wanted.remove(&server);
        } else {
            self.replica_wanted.insert(server, bits);
        }
    }

    /// Forgets a replica's wanted bits.
    pub fn clear_replica_wanted(&mut self, server: ServerId) {
        self.replica_wanted.remove(&server);
    }

    /// Wanted bits forwarded by each replica.
    pub fn replica_wanted(&self) -> &BTreeMap<ServerId, CapMask> {
        &self.replica_wanted
    }
}

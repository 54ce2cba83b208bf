//! Narrow mutation interfaces onto a cached inode.
//!
//! Request handling, the lock manager and the migrator each get the slice of
//! inode mutation they need through one of these traits instead of reaching
//! into the object's fields.

use std::collections::{BTreeMap, BTreeSet};

use crate::capability::{CapMask, Capability};
use crate::error::Result;
use crate::types::{ClientId, DentryRef, ServerId};

/// Ancestor chain notified when an inode's auth pins change.
pub trait AncestorAuthPins {
    /// Adds `delta` to the nested auth pin count of the directory holding
    /// `parent` and of every ancestor above it.
    fn adjust_nested_auth_pins(&mut self, parent: &DentryRef, delta: i32);
}

/// Ancestor chain of an inode with no cached ancestors.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoAncestors;

impl AncestorAuthPins for NoAncestors {
    fn adjust_nested_auth_pins(&mut self, _parent: &DentryRef, _delta: i32) {}
}

/// Authority pinning, as used by request handling and subtree freezing.
pub trait AuthPinAccess {
    /// Returns true if a new auth pin would be granted.
    fn can_auth_pin(&self) -> bool;

    /// Takes an auth pin. Refused with a transient error while freezing,
    /// frozen or exporting.
    fn auth_pin(&mut self, ancestors: &mut dyn AncestorAuthPins) -> Result<()>;

    /// Drops an auth pin.
    fn auth_unpin(&mut self, ancestors: &mut dyn AncestorAuthPins) -> Result<()>;

    /// Applies a nested auth pin delta from a descendant and forwards it up.
    fn adjust_nested_auth_pins(
        &mut self,
        delta: i32,
        ancestors: &mut dyn AncestorAuthPins,
    ) -> Result<()>;

    /// Auth pins held on this inode.
    fn auth_pin_count(&self) -> u32;

    /// Auth pins held below this inode.
    fn nested_auth_pin_count(&self) -> u32;
}

/// Client capability bookkeeping, as used by the lock manager and migrator.
pub trait CapabilityAccess {
    /// Records a capability for a new client.
    fn add_client_cap(&mut self, client: ClientId, cap: Capability) -> Result<()>;

    /// Drops a client's capability.
    fn remove_client_cap(&mut self, client: ClientId) -> Result<Capability>;

    /// Empties the ledger, returning what it held.
    fn take_client_caps(&mut self) -> Result<BTreeMap<ClientId, Capability>>;

    /// Folds transferred capabilities in, recording clients seen for the first time.
    fn merge_client_caps(
        &mut self,
        incoming: BTreeMap<ClientId, Capability>,
        new_clients: &mut BTreeSet<ClientId>,
    ) -> Result<()>;

    /// Withdraws `bits` from a client, returning what remains issued.
    fn revoke_client_caps(&mut self, client: ClientId, bits: CapMask) -> Result<CapMask>;

    /// OR of all issued bits.
    fn caps_issued(&self) -> CapMask;

    /// OR of all wanted bits, including replica requests on the authority.
    fn caps_wanted(&self) -> CapMask;

    /// Records the bits a replica server asked for.
    fn set_replica_caps_wanted(&mut self, server: ServerId, bits: CapMask);
}

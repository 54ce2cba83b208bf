//! Property-based tests for mdcache using proptest.
//!
//! These check the pin, capability and replication invariants over arbitrary
//! operation sequences.

mod common;

use common::{auth_dir, auth_file, make_cache, test_config};
use mdcache::{
    CacheObject, CapMask, Capability, CapabilityAccess, CapabilityLedger, ClientId,
    DiscoverSnapshot, ExportSnapshot, FragId, InodeId, InodeObject, LockKind, LockState,
    PinReason, ServerId, Timestamp,
};
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

const REASONS: [PinReason; 6] = [
    PinReason::Request,
    PinReason::Dirty,
    PinReason::Replicated,
    PinReason::Caps,
    PinReason::Custom(1),
    PinReason::Custom(2),
];

/// Generator for capability bit sets.
fn any_mask() -> impl Strategy<Value = CapMask> {
    (0u32..32).prop_map(CapMask)
}

/// Generator for a client ledger keyed by small client ids.
fn any_cap_map() -> impl Strategy<Value = BTreeMap<u64, (CapMask, CapMask)>> {
    proptest::collection::btree_map(0u64..8, (any_mask(), any_mask()), 0..6)
}

fn ledger_from(map: &BTreeMap<u64, (CapMask, CapMask)>) -> CapabilityLedger {
    let mut ledger = CapabilityLedger::new(InodeId::new(1));
    for (client, (issued, wanted)) in map {
        ledger
            .add(ClientId::new(*client), Capability::new(*issued, *wanted))
            .unwrap();
    }
    ledger
}

#[derive(Debug, Clone)]
enum CapOp {
    Add(u64, CapMask),
    Remove(u64),
    Revoke(u64, CapMask),
    TakeAll,
    Merge(Vec<u64>),
}

fn any_cap_op() -> impl Strategy<Value = CapOp> {
    prop_oneof![
        (0u64..4, any_mask()).prop_map(|(c, m)| CapOp::Add(c, m)),
        (0u64..4).prop_map(CapOp::Remove),
        (0u64..4, any_mask()).prop_map(|(c, m)| CapOp::Revoke(c, m)),
        Just(CapOp::TakeAll),
        proptest::collection::vec(0u64..4, 0..3).prop_map(CapOp::Merge),
    ]
}

proptest! {
    /// Eviction eligibility tracks the net count of every pin reason.
    #[test]
    fn prop_evictable_iff_all_pins_released(
        ops in proptest::collection::vec((0usize..REASONS.len(), any::<bool>()), 0..64),
    ) {
        let mut obj = CacheObject::new(InodeId::new(1), true);
        let mut model = [0u32; REASONS.len()];
        for (idx, pin) in ops {
            let reason = REASONS[idx];
            if pin {
                obj.pin(reason);
                model[idx] += 1;
            } else if model[idx] == 0 {
                prop_assert!(obj.unpin(reason).is_err());
            } else {
                obj.unpin(reason).unwrap();
                model[idx] -= 1;
            }
            prop_assert_eq!(obj.pin_count_for(reason), model[idx]);
            prop_assert_eq!(obj.is_evictable(), model.iter().all(|n| *n == 0));
        }
    }

    /// A non-empty ledger always holds the capability pin, and an empty one
    /// never does.
    #[test]
    fn prop_caps_pin_follows_ledger(ops in proptest::collection::vec(any_cap_op(), 0..40)) {
        let mut inode = auth_file(2);
        for op in ops {
            match op {
                CapOp::Add(c, bits) => {
                    let _ = inode.add_client_cap(ClientId::new(c), Capability::new(bits, CapMask::NONE));
                }
                CapOp::Remove(c) => {
                    let _ = inode.remove_client_cap(ClientId::new(c));
                }
                CapOp::Revoke(c, bits) => {
                    let _ = inode.revoke_client_caps(ClientId::new(c), bits);
                }
                CapOp::TakeAll => {
                    inode.take_client_caps().unwrap();
                }
                CapOp::Merge(clients) => {
                    let incoming = clients
                        .into_iter()
                        .map(|c| (ClientId::new(c), Capability::new(CapMask::FILE_RD, CapMask::NONE)))
                        .collect();
                    let mut new_clients = BTreeSet::new();
                    inode.merge_client_caps(incoming, &mut new_clients).unwrap();
                }
            }
            prop_assert_eq!(
                !inode.client_caps().is_empty(),
                inode.object().has_pin(PinReason::Caps)
            );
            prop_assert!(inode.object().pin_count_for(PinReason::Caps) <= 1);
        }
    }

    /// A replica built from a Discover payload matches the authority.
    #[test]
    fn prop_discover_round_trip(
        uid in any::<u32>(),
        gid in any::<u32>(),
        size in any::<u64>(),
        mtime in 0u64..4_000_000_000,
        split_bits in proptest::option::of(1u8..4),
        scatter_dir in any::<bool>(),
        exclusive_auth in any::<bool>(),
    ) {
        let mut src = auth_dir(3);
        {
            let attr = src.attr_mut();
            attr.uid = uid;
            attr.gid = gid;
            attr.size = size;
            attr.mtime = Timestamp::from_secs(mtime);
        }
        if let Some(bits) = split_bits {
            src.split_dirfrag(FragId::ROOT, bits).unwrap();
        }
        src.replicate_to(ServerId::new(2)).unwrap();
        if scatter_dir {
            src.lock_start_scatter(LockKind::Dir).unwrap();
        }
        if exclusive_auth {
            src.lock_start_exclusive(LockKind::Auth).unwrap();
        }

        let bytes = src.replicate_to(ServerId::new(3)).unwrap().encode().unwrap();
        let snap = DiscoverSnapshot::decode(&bytes).unwrap();
        let replica = snap.into_inode(&test_config()).unwrap();

        prop_assert_eq!(replica.attr(), src.attr());
        prop_assert_eq!(replica.symlink(), src.symlink());
        prop_assert_eq!(replica.dirfragtree(), src.dirfragtree());
        prop_assert_eq!(replica.object().replica_nonce(), 1);
        for kind in LockKind::ALL {
            prop_assert_eq!(replica.lock(kind).state(), src.lock(kind).replica_state());
        }
        prop_assert!(!replica.is_auth());
    }

    /// Merging two ledgers in either order yields the same unions and keeps
    /// every client.
    #[test]
    fn prop_merge_commutes(a in any_cap_map(), b in any_cap_map()) {
        let mut ab = ledger_from(&a);
        let mut ba = ledger_from(&b);
        let mut new_ab = BTreeSet::new();
        let mut new_ba = BTreeSet::new();
        ab.merge(ledger_from(&b).take_all().0, &mut new_ab);
        ba.merge(ledger_from(&a).take_all().0, &mut new_ba);

        prop_assert_eq!(ab.issued_union(), ba.issued_union());
        prop_assert_eq!(ab.wanted_union(false), ba.wanted_union(false));
        let keys_ab: BTreeSet<ClientId> = ab.clients().keys().copied().collect();
        let keys_ba: BTreeSet<ClientId> = ba.clients().keys().copied().collect();
        let expected: BTreeSet<ClientId> =
            a.keys().chain(b.keys()).map(|c| ClientId::new(*c)).collect();
        prop_assert_eq!(&keys_ab, &expected);
        prop_assert_eq!(&keys_ba, &expected);
        for client in &new_ab {
            prop_assert!(!a.contains_key(&client.as_u64()));
        }
    }

    /// On import the later directory mtime wins only while the local dir lock
    /// is scattered.
    #[test]
    fn prop_export_mtime_merge(local in 0u64..1_000_000, remote in 0u64..1_000_000, scattered in any::<bool>()) {
        let now = Timestamp::from_secs(10);
        let mut src = auth_dir(4);
        src.attr_mut().mtime = Timestamp::from_secs(remote);
        let snap = ExportSnapshot::capture(&mut src, now).unwrap();

        let mut dst = InodeObject::new_replica(src.attr().clone(), &test_config());
        dst.attr_mut().mtime = Timestamp::from_secs(local);
        if scattered {
            dst.lock_mut(LockKind::Dir).set_state(LockState::Scatter).unwrap();
        }
        snap.update_inode(&mut dst, now).unwrap();

        let expected = if scattered { local.max(remote) } else { remote };
        prop_assert_eq!(dst.attr().mtime, Timestamp::from_secs(expected));
    }

    /// Trimming never evicts a pinned inode and stops only at pinned ones.
    #[test]
    fn prop_trim_spares_pinned(
        pinned in proptest::collection::vec(any::<bool>(), 1..24),
        max in 0usize..24,
    ) {
        let mut cache = make_cache(1);
        for (i, pin) in pinned.iter().enumerate() {
            let mut inode = auth_file(10 + i as u64);
            if *pin {
                inode.pin(PinReason::Request).unwrap();
            }
            cache.insert(inode).unwrap();
        }
        let evicted = cache.trim(max);
        for ino in &evicted {
            let idx = (ino.as_u64() - 10) as usize;
            prop_assert!(!pinned[idx]);
        }
        let pinned_count = pinned.iter().filter(|p| **p).count();
        prop_assert_eq!(cache.len(), max.max(pinned_count).min(pinned.len()));
    }
}

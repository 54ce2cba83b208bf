//! Directory fragmentation.
//!
//! A directory's hash space (24 bits) is split into fragments. A `FragId`
//! names one node of the binary split tree by its prefix value and prefix
//! length; a `FragTree` records which nodes have been split and by how many
//! bits. Leaves of the tree are the fragments that actually hold entries.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{CacheError, Result};
use crate::types::InodeId;

/// Width of the dentry hash space covered by the fragment tree.
pub const FRAG_HASH_BITS: u8 = 24;

const FRAG_HASH_MASK: u32 = 0x00ff_ffff;

/// Identifies one node of a directory's fragment tree.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawFragId")]
pub struct FragId {
    value: u32,
    bits: u8,
}

/// Wire form of a `FragId`, checked before it becomes one.
#[derive(Deserialize)]
struct RawFragId {
    value: u32,
    bits: u8,
}

impl TryFrom<RawFragId> for FragId {
    type Error = CacheError;

    fn try_from(raw: RawFragId) -> Result<Self> {
        if raw.bits > FRAG_HASH_BITS || raw.value & !Self::mask_for(raw.bits) != 0 {
            return Err(CacheError::MalformedSnapshot(format!(
                "fragment value {:#x} does not fit a {}-bit prefix",
                raw.value, raw.bits
            )));
        }
        Ok(FragId {
            value: raw.value,
            bits: raw.bits,
        })
    }
}

impl FragId {
    /// The whole hash space (an unfragmented directory).
    pub const ROOT: FragId = FragId { value: 0, bits: 0 };

    /// Creates a fragment id; `value` bits outside the prefix are cleared.
    pub fn new(value: u32, bits: u8) -> Self {
        let bits = bits.min(FRAG_HASH_BITS);
        let value = value & Self::mask_for(bits);
        FragId { value, bits }
    }

    fn mask_for(bits: u8) -> u32 {
        (FRAG_HASH_MASK << (FRAG_HASH_BITS - bits)) & FRAG_HASH_MASK
    }

    /// Prefix value.
    pub fn value(&self) -> u32 {
        self.value
    }

    /// Prefix length in bits.
    pub fn bits(&self) -> u8 {
        self.bits
    }

    /// Mask selecting the prefix bits of a hash.
    pub fn mask(&self) -> u32 {
        Self::mask_for(self.bits)
    }

    /// Returns true if this is the root fragment.
    pub fn is_root(&self) -> bool {
        self.bits == 0
    }

    /// Returns true if `hash` falls inside this fragment.
    pub fn contains(&self, hash: u32) -> bool {
        (hash & FRAG_HASH_MASK & self.mask()) == self.value
    }

    /// Returns true if `other` is this fragment or nested inside it.
    pub fn contains_frag(&self, other: FragId) -> bool {
        other.bits >= self.bits && (other.value & self.mask()) == self.value
    }

    /// Splits this fragment into `2^nb` children.
    pub fn children(&self, nb: u8) -> Result<Vec<FragId>> {
        if nb == 0 || self.bits as u16 + nb as u16 > FRAG_HASH_BITS as u16 {
            return Err(CacheError::InvalidFragSplit { frag: *self, bits: nb });
        }
        let shift = FRAG_HASH_BITS - self.bits - nb;
        Ok((0..(1u32 << nb))
            .map(|i| FragId::new(self.value | (i << shift), self.bits + nb))
            .collect())
    }

    /// Returns the child containing `hash` after a split by `nb` bits.
    fn child_for(&self, nb: u8, hash: u32) -> FragId {
        FragId::new(hash, self.bits + nb)
    }
}

impl fmt::Display for FragId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in 0..self.bits {
            let bit = (self.value >> (FRAG_HASH_BITS - 1 - i)) & 1;
            write!(f, "{}", bit)?;
        }
        write!(f, "*")
    }
}

/// Identifies one fragment of one directory.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DirFragId {
    /// Directory inode
    pub ino: InodeId,
    /// Fragment within the directory
    pub frag: FragId,
}

impl DirFragId {
    /// Creates a new dirfrag id
    pub fn new(ino: InodeId, frag: FragId) -> Self {
        Self { ino, frag }
    }
}

impl fmt::Display for DirFragId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.ino, self.frag)
    }
}

/// Records how a directory's hash space is split into fragments.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragTree {
    splits: BTreeMap<FragId, u8>,
}

impl FragTree {
    /// Creates an unsplit tree (a single root leaf).
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the split width at `frag`, if it has been split.
    pub fn get_split(&self, frag: FragId) -> Option<u8> {
        self.splits.get(&frag).copied()
    }

    /// Returns true if `frag` is a leaf of the tree.
    pub fn is_leaf(&self, frag: FragId) -> bool {
        !self.splits.contains_key(&frag) && self.reachable(frag)
    }

    fn reachable(&self, frag: FragId) -> bool {
        let mut cur = FragId::ROOT;
        loop {
            if cur == frag {
                return true;
            }
            match self.splits.get(&cur) {
                Some(&nb) if cur.contains_frag(frag) && frag.bits >= cur.bits + nb => {
                    cur = cur.child_for(nb, frag.value);
                }
                _ => return false,
            }
        }
    }

    /// Checks a tree received from another server: every split must widen
    /// its fragment by 1 to 24 bits in total and hang off the root.
    pub fn validate(&self) -> Result<()> {
        for (&frag, &nb) in &self.splits {
            if nb == 0 || frag.bits as u16 + nb as u16 > FRAG_HASH_BITS as u16 {
                return Err(CacheError::MalformedSnapshot(format!(
                    "fragment {} split by {} bits",
                    frag, nb
                )));
            }
        }
        if let Some(frag) = self.splits.keys().find(|f| !self.reachable(**f)) {
            return Err(CacheError::MalformedSnapshot(format!(
                "split fragment {} is not reachable from the root",
                frag
            )));
        }
        Ok(())
    }

    /// Returns the leaf fragment containing `hash`.
    pub fn pick(&self, hash: u32) -> FragId {
        let mut cur = FragId::ROOT;
        while let Some(&nb) = self.splits.get(&cur) {
            cur = cur.child_for(nb, hash);
        }
        cur
    }

    /// Returns every leaf in hash order.
    pub fn leaves(&self) -> Vec<FragId> {
        let mut out = Vec::new();
        let mut stack = vec![FragId::ROOT];
        while let Some(f) = stack.pop() {
            match self.splits.get(&f) {
                Some(&nb) => {
                    let kids = FragId::children(&f, nb).unwrap_or_default();
                    stack.extend(kids.into_iter().rev());
                }
                None => out.push(f),
            }
        }
        out
    }

    /// Splits leaf `frag` by `nb` bits.
    pub fn split(&mut self, frag: FragId, nb: u8) -> Result<Vec<FragId>> {
        if !self.is_leaf(frag) {
            return Err(CacheError::InvalidFragSplit { frag, bits: nb });
        }
        let kids = frag.children(nb)?;
        self.splits.insert(frag, nb);
        Ok(kids)
    }

    /// Undoes the split at `frag`; all of its children must be leaves.
    pub fn merge(&mut self, frag: FragId) -> Result<()> {
        let nb = self
            .splits
            .get(&frag)
            .copied()
            .ok_or(CacheError::InvalidFragSplit { frag, bits: 0 })?;
        let kids = frag.children(nb)?;
        if kids.iter().any(|k| self.splits.contains_key(k)) {
            return Err(CacheError::InvalidFragSplit { frag, bits: nb });
        }
        self.splits.remove(&frag);
        Ok(())
    }
}

/// Hashes a dentry name into the fragment hash space (FNV-1a folded to 24 bits).
pub fn hash_dentry_name(name: &str) -> u32 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in name.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    ((hash ^ (hash >> 32)) as u32) & FRAG_HASH_MASK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_contains_everything() {
        assert!(FragId::ROOT.contains(0));
        assert!(FragId::ROOT.contains(FRAG_HASH_MASK));
        assert_eq!(format!("{}", FragId::ROOT), "*");
    }

    #[test]
    fn test_children_partition_space() {
        let kids = FragId::ROOT.children(2).unwrap();
        assert_eq!(kids.len(), 4);
        assert_eq!(format!("{}", kids[0]), "00*");
        assert_eq!(format!("{}", kids[3]), "11*");
        let hash = 0x00c0_0001;
        let owners: Vec<_> = kids.iter().filter(|k| k.contains(hash)).collect();
        assert_eq!(owners.len(), 1);
        assert_eq!(*owners[0], kids[3]);
    }

    #[test]
    fn test_children_too_deep() {
        let deep = FragId::new(0, 23);
        match deep.children(2) {
            Err(CacheError::InvalidFragSplit { .. }) => {}
            other => panic!("expected InvalidFragSplit, got {:?}", other),
        }
    }

    #[test]
    fn test_tree_split_and_pick() {
        let mut tree = FragTree::new();
        assert_eq!(tree.leaves(), vec![FragId::ROOT]);

        let kids = tree.split(FragId::ROOT, 1).unwrap();
        tree.split(kids[1], 1).unwrap();

        let leaves = tree.leaves();
        assert_eq!(leaves.len(), 3);
        assert_eq!(format!("{}", leaves[0]), "0*");
        assert_eq!(format!("{}", leaves[1]), "10*");
        assert_eq!(format!("{}", leaves[2]), "11*");

        assert_eq!(tree.pick(0x0000_0001), leaves[0]);
        assert_eq!(tree.pick(0x00ff_ffff), leaves[2]);
        assert!(tree.is_leaf(leaves[1]));
        assert!(!tree.is_leaf(FragId::ROOT));
    }

    #[test]
    fn test_split_non_leaf_rejected() {
        let mut tree = FragTree::new();
        tree.split(FragId::ROOT, 1).unwrap();
        assert!(tree.split(FragId::ROOT, 1).is_err());
    }

    #[test]
    fn test_merge() {
        let mut tree = FragTree::new();
        let kids = tree.split(FragId::ROOT, 1).unwrap();
        tree.split(kids[0], 1).unwrap();
        assert!(tree.merge(FragId::ROOT).is_err());
        tree.merge(kids[0]).unwrap();
        tree.merge(FragId::ROOT).unwrap();
        assert_eq!(tree.leaves(), vec![FragId::ROOT]);
    }

    #[test]
    fn test_validate_rejects_zero_width_split() {
        let bytes = bincode::serialize(&vec![(FragId::ROOT, 0u8)]).unwrap();
        let tree: FragTree = bincode::deserialize(&bytes).unwrap();
        match tree.validate() {
            Err(CacheError::MalformedSnapshot(_)) => {}
            other => panic!("expected MalformedSnapshot, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_too_deep_and_orphan_splits() {
        let deep = bincode::serialize(&vec![(FragId::ROOT, 25u8)]).unwrap();
        let tree: FragTree = bincode::deserialize(&deep).unwrap();
        assert!(tree.validate().is_err());

        let orphan = bincode::serialize(&vec![(FragId::new(0x80_0000, 1), 1u8)]).unwrap();
        let tree: FragTree = bincode::deserialize(&orphan).unwrap();
        assert!(tree.validate().is_err());

        let mut good = FragTree::new();
        let kids = good.split(FragId::ROOT, 1).unwrap();
        good.split(kids[1], 2).unwrap();
        good.validate().unwrap();
    }

    #[test]
    fn test_out_of_range_frag_id_does_not_decode() {
        let too_wide = bincode::serialize(&(0u32, 30u8)).unwrap();
        assert!(bincode::deserialize::<FragId>(&too_wide).is_err());
        let stray_bits = bincode::serialize(&(0x0000_0001u32, 1u8)).unwrap();
        assert!(bincode::deserialize::<FragId>(&stray_bits).is_err());
        let ok = bincode::serialize(&FragId::new(0x80_0000, 1)).unwrap();
        assert_eq!(bincode::deserialize::<FragId>(&ok).unwrap(), FragId::new(0x80_0000, 1));
    }

    #[test]
    fn test_hash_dentry_name_in_range() {
        for name in ["a", "b", "some-longer-name", ""] {
            assert!(hash_dentry_name(name) <= FRAG_HASH_MASK);
        }
        assert_eq!(hash_dentry_name("x"), hash_dentry_name("x"));
    }
}

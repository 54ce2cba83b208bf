//! Attribute payloads carried by lock-state messages.
//!
//! When a lock changes state the authority ships the attribute group the
//! lock protects along with it, so replicas read current values once they
//! may read at all. Scattered directory stats flow the other way during a
//! gather.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::codec::{decode_exact, encode};
use crate::error::Result;
use crate::frag::{FragId, FragTree};
use crate::inode::InodeObject;
use crate::lock::LockKind;
use crate::types::Timestamp;

#[derive(Serialize, Deserialize)]
struct AuthPayload {
    ctime: Timestamp,
    mode: u32,
    uid: u32,
    gid: u32,
}

#[derive(Serialize, Deserialize)]
struct LinkPayload {
    ctime: Timestamp,
    nlink: u32,
    anchored: bool,
}

#[derive(Serialize, Deserialize)]
struct FilePayload {
    size: u64,
    mtime: Timestamp,
    atime: Timestamp,
}

#[derive(Serialize, Deserialize)]
struct DirPayload {
    mtime: Timestamp,
    dirfrag_size: BTreeMap<FragId, u32>,
}

impl InodeObject {
    /// Encodes the attribute group protected by `kind`.
    pub fn encode_lock_state(&self, kind: LockKind) -> Result<Vec<u8>> {
        let attr = self.attr();
        match kind {
            LockKind::Auth => encode(&AuthPayload {
                ctime: attr.ctime,
                mode: attr.mode,
                uid: attr.uid,
                gid: attr.gid,
            }),
            LockKind::Link => encode(&LinkPayload {
                ctime: attr.ctime,
                nlink: attr.nlink,
                anchored: attr.anchored,
            }),
            LockKind::DirFragTree => encode(self.dirfragtree()),
            LockKind::File => encode(&FilePayload {
                size: attr.size,
                mtime: attr.mtime,
                atime: attr.atime,
            }),
            LockKind::Dir => encode(&DirPayload {
                mtime: attr.mtime,
                dirfrag_size: self.fragment_size_hints().clone(),
            }),
        }
    }

    /// Installs an attribute group received with a lock message. The whole
    /// payload is decoded before anything changes.
    ///
    /// Directory stats are merged: the later mtime wins, and on the
    /// authority a newer mtime from a replica dirties the inode.
    pub fn decode_lock_state(&mut self, kind: LockKind, bytes: &[u8]) -> Result<()> {
        match kind {
            LockKind::Auth => {
                let p: AuthPayload = decode_exact(bytes)?;
                let attr = self.attr_mut();
                attr.ctime = p.ctime;
                attr.mode = p.mode;
                attr.uid = p.uid;
                attr.gid = p.gid;
            }
            LockKind::Link => {
                let p: LinkPayload = decode_exact(bytes)?;
                let attr = self.attr_mut();
                attr.ctime = p.ctime;
                attr.nlink = p.nlink;
                attr.anchored = p.anchored;
            }
            LockKind::DirFragTree => {
                let tree: FragTree = decode_exact(bytes)?;
                tree.validate()?;
                self.set_dirfragtree(tree);
            }
            LockKind::File => {
                let p: FilePayload = decode_exact(bytes)?;
                let attr = self.attr_mut();
                attr.size = p.size;
                attr.mtime = p.mtime;
                attr.atime = p.atime;
            }
            LockKind::Dir => {
                let p: DirPayload = decode_exact(bytes)?;
                if p.mtime > self.attr().mtime {
                    tracing::debug!(
                        ino = %self.ino(),
                        old = %self.attr().mtime,
                        new = %p.mtime,
                        "dir mtime advanced"
                    );
                    self.attr_mut().mtime = p.mtime;
                    if self.is_auth() {
                        let v = self.pre_dirty();
                        self.mark_dirty(v);
                    }
                }
                for (frag, entries) in p.dirfrag_size {
                    self.set_fragment_size_hint(frag, entries);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::types::{InodeAttr, InodeId};

    fn dir(auth: bool) -> InodeObject {
        let attr = InodeAttr::new_directory(InodeId::new(100), 0o755);
        if auth {
            InodeObject::new_auth(attr, &CacheConfig::default())
        } else {
            InodeObject::new_replica(attr, &CacheConfig::default())
        }
    }

    #[test]
    fn test_auth_payload_copies_ownership() {
        let mut src = dir(true);
        src.attr_mut().uid = 1000;
        src.attr_mut().mode = 0o700;
        let bytes = src.encode_lock_state(LockKind::Auth).unwrap();

        let mut dst = dir(false);
        dst.decode_lock_state(LockKind::Auth, &bytes).unwrap();
        assert_eq!(dst.attr().uid, 1000);
        assert_eq!(dst.attr().mode, 0o700);
    }

    #[test]
    fn test_dir_payload_keeps_newer_mtime_and_dirties_auth() {
        let mut replica = dir(false);
        replica.attr_mut().mtime = Timestamp::from_secs(500);
        replica.set_fragment_size_hint(FragId::ROOT, 12);
        let bytes = replica.encode_lock_state(LockKind::Dir).unwrap();

        let mut auth = dir(true);
        auth.attr_mut().mtime = Timestamp::from_secs(400);
        auth.decode_lock_state(LockKind::Dir, &bytes).unwrap();
        assert_eq!(auth.attr().mtime, Timestamp::from_secs(500));
        assert!(auth.is_dirty());
        assert_eq!(auth.fragment_size_hint(FragId::ROOT), Some(12));

        let mut newer = dir(true);
        newer.attr_mut().mtime = Timestamp::from_secs(900);
        newer.decode_lock_state(LockKind::Dir, &bytes).unwrap();
        assert_eq!(newer.attr().mtime, Timestamp::from_secs(900));
        assert!(!newer.is_dirty());
    }

    #[test]
    fn test_fragtree_payload() {
        let mut src = dir(true);
        src.split_dirfrag(FragId::ROOT, 3).unwrap();
        let bytes = src.encode_lock_state(LockKind::DirFragTree).unwrap();
        let mut dst = dir(false);
        dst.decode_lock_state(LockKind::DirFragTree, &bytes).unwrap();
        assert_eq!(dst.dirfragtree(), src.dirfragtree());
    }

    #[test]
    fn test_fragtree_payload_with_zero_width_split_rejected() {
        let bytes = bincode::serialize(&vec![(FragId::ROOT, 0u8)]).unwrap();
        let mut dst = dir(false);
        match dst.decode_lock_state(LockKind::DirFragTree, &bytes) {
            Err(e) => assert_eq!(e.kind(), crate::error::ErrorKind::Decode),
            Ok(()) => panic!("zero-width split accepted"),
        }
        assert_eq!(dst.dirfragtree(), &FragTree::new());
        assert_eq!(dst.pick_dirfrag("a"), FragId::ROOT);
    }

    #[test]
    fn test_bad_payload_leaves_inode_untouched() {
        let src = dir(true);
        let mut bytes = src.encode_lock_state(LockKind::File).unwrap();
        bytes.push(0xff);
        let mut dst = dir(false);
        let before = dst.attr().clone();
        match dst.decode_lock_state(LockKind::File, &bytes) {
            Err(e) => assert_eq!(e.kind(), crate::error::ErrorKind::Decode),
            Ok(()) => panic!("trailing byte accepted"),
        }
        assert_eq!(dst.attr(), &before);
    }
}

//! Identifiers, timestamps and the inode attribute record.
//!
//! The id newtypes double as non-owning references between cached objects.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::frag::DirFragId;

/// Represents a unique identifier for an inode in the metadata cache
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InodeId(u64);

impl InodeId {
    /// The root inode ID (always 1)
    pub const ROOT_INODE: InodeId = InodeId(1);

    /// Creates a new InodeId from a raw u64 value
    pub fn new(id: u64) -> Self {
        InodeId(id)
    }

    /// Returns the raw u64 value of this inode ID
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for InodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Represents a metadata server in the cluster
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerId(u64);

impl ServerId {
    /// Creates a new ServerId from a raw u64 value
    pub fn new(id: u64) -> Self {
        ServerId(id)
    }

    /// Returns the raw u64 value of this server ID
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mds.{}", self.0)
    }
}

/// Represents a connected client session
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(u64);

impl ClientId {
    /// Creates a new ClientId from a raw u64 value
    pub fn new(id: u64) -> Self {
        ClientId(id)
    }

    /// Returns the raw u64 value of this client ID
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client.{}", self.0)
    }
}

/// Represents a point in time with second and nanosecond precision
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    /// Seconds since Unix epoch
    pub secs: u64,
    /// Nanoseconds within the second
    pub nanos: u32,
}

impl Timestamp {
    /// The Unix epoch.
    pub const ZERO: Timestamp = Timestamp { secs: 0, nanos: 0 };

    /// Returns the current timestamp
    pub fn now() -> Self {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            secs: now.as_secs(),
            nanos: now.subsec_nanos(),
        }
    }

    /// Creates a timestamp at a whole number of seconds
    pub fn from_secs(secs: u64) -> Self {
        Self { secs, nanos: 0 }
    }

    /// Returns this timestamp shifted forward by `secs` seconds
    pub fn plus_secs(self, secs: u64) -> Self {
        Self {
            secs: self.secs.saturating_add(secs),
            nanos: self.nanos,
        }
    }

    /// Seconds elapsed from `earlier` to `self`, zero if `earlier` is later
    pub fn secs_since(&self, earlier: Timestamp) -> f64 {
        if *self <= earlier {
            return 0.0;
        }
        let secs = (self.secs - earlier.secs) as f64;
        secs + (self.nanos as f64 - earlier.nanos as f64) / 1e9
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.secs
            .cmp(&other.secs)
            .then_with(|| self.nanos.cmp(&other.nanos))
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.secs, self.nanos)
    }
}

/// File type enumeration matching POSIX file types
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    /// Regular file (S_IFREG)
    RegularFile,
    /// Directory (S_IFDIR)
    Directory,
    /// Symbolic link (S_IFLNK)
    Symlink,
    /// Block device (S_IFBLK)
    BlockDevice,
    /// Character device (S_IFCHR)
    CharDevice,
    /// FIFO/named pipe (S_IFIFO)
    Fifo,
    /// Socket (S_IFSOCK)
    Socket,
}

impl FileType {
    /// Returns the POSIX S_IFMT bits for this file type
    pub fn mode_bits(&self) -> u32 {
        match self {
            FileType::RegularFile => 0o100000,
            FileType::Directory => 0o040000,
            FileType::Symlink => 0o120000,
            FileType::BlockDevice => 0o060000,
            FileType::CharDevice => 0o020000,
            FileType::Fifo => 0o010000,
            FileType::Socket => 0o140000,
        }
    }
}

/// The inode record proper, as cached by a metadata server
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeAttr {
    /// Inode number
    pub ino: InodeId,
    /// File type
    pub file_type: FileType,
    /// Permission bits (lower 12 bits)
    pub mode: u32,
    /// Owner user ID
    pub uid: u32,
    /// Owner group ID
    pub gid: u32,
    /// Hard link count
    pub nlink: u32,
    /// File size in bytes
    pub size: u64,
    /// Last access time
    pub atime: Timestamp,
    /// Last modification time (for directories, the aggregate of all fragments)
    pub mtime: Timestamp,
    /// Last status change time
    pub ctime: Timestamp,
    /// Whether the inode is registered in the anchor table
    pub anchored: bool,
    /// Projected version, bumped on every journaled change
    pub version: u64,
}

impl InodeAttr {
    fn with_type(ino: InodeId, file_type: FileType, mode: u32, nlink: u32) -> Self {
        let now = Timestamp::now();
        Self {
            ino,
            file_type,
            mode,
            uid: 0,
            gid: 0,
            nlink,
            size: 0,
            atime: now,
            mtime: now,
            ctime: now,
            anchored: false,
            version: 0,
        }
    }

    /// Creates a new directory inode with sensible defaults
    pub fn new_directory(ino: InodeId, mode: u32) -> Self {
        Self::with_type(ino, FileType::Directory, mode, 2)
    }

    /// Creates a new file inode with sensible defaults
    pub fn new_file(ino: InodeId, mode: u32) -> Self {
        Self::with_type(ino, FileType::RegularFile, mode, 1)
    }

    /// Creates a new symlink inode whose target has `target_len` bytes
    pub fn new_symlink(ino: InodeId, target_len: usize) -> Self {
        let mut attr = Self::with_type(ino, FileType::Symlink, 0o777, 1);
        attr.size = target_len as u64;
        attr
    }

    /// Returns true for directories
    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }

    /// Returns true for regular files
    pub fn is_file(&self) -> bool {
        self.file_type == FileType::RegularFile
    }

    /// Returns true for symbolic links
    pub fn is_symlink(&self) -> bool {
        self.file_type == FileType::Symlink
    }
}

/// Non-owning back-reference to a directory entry, resolved by the owning cache
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DentryRef {
    /// Directory fragment holding the entry
    pub dir: DirFragId,
    /// Entry name
    pub name: String,
}

impl DentryRef {
    /// Creates a new dentry reference
    pub fn new(dir: DirFragId, name: impl Into<String>) -> Self {
        Self {
            dir,
            name: name.into(),
        }
    }
}

impl fmt::Display for DentryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[dentry {}/{}]", self.dir, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frag::FragId;

    #[test]
    fn test_inode_id_new_and_as_u64() {
        let id = InodeId::new(42);
        assert_eq!(id.as_u64(), 42);
        assert_eq!(InodeId::ROOT_INODE.as_u64(), 1);
    }

    #[test]
    fn test_id_display() {
        assert_eq!(format!("{}", InodeId::new(255)), "0xff");
        assert_eq!(format!("{}", ServerId::new(3)), "mds.3");
        assert_eq!(format!("{}", ClientId::new(7)), "client.7");
    }

    #[test]
    fn test_timestamp_ord() {
        let t1 = Timestamp {
            secs: 100,
            nanos: 500,
        };
        let t2 = Timestamp {
            secs: 100,
            nanos: 1000,
        };
        let t3 = Timestamp::from_secs(200);
        assert!(t1 < t2);
        assert!(t2 < t3);
        assert_eq!(t1.max(t3), t3);
    }

    #[test]
    fn test_timestamp_plus_and_since() {
        let t = Timestamp::from_secs(10);
        assert_eq!(t.plus_secs(5), Timestamp::from_secs(15));
        assert_eq!(Timestamp::from_secs(15).secs_since(t), 5.0);
        assert_eq!(t.secs_since(Timestamp::from_secs(15)), 0.0);
    }

    #[test]
    fn test_timestamp_now_reasonable() {
        assert!(Timestamp::now().secs > 1700000000);
    }

    #[test]
    fn test_filetype_mode_bits() {
        assert_eq!(FileType::RegularFile.mode_bits(), 0o100000);
        assert_eq!(FileType::Directory.mode_bits(), 0o040000);
        assert_eq!(FileType::Symlink.mode_bits(), 0o120000);
    }

    #[test]
    fn test_new_directory_defaults() {
        let attr = InodeAttr::new_directory(InodeId::new(42), 0o755);
        assert!(attr.is_dir());
        assert_eq!(attr.nlink, 2);
        assert!(!attr.anchored);
    }

    #[test]
    fn test_new_symlink_size() {
        let attr = InodeAttr::new_symlink(InodeId::new(42), 15);
        assert!(attr.is_symlink());
        assert_eq!(attr.size, 15);
    }

    #[test]
    fn test_inode_attr_serde_roundtrip() {
        let attr = InodeAttr::new_file(InodeId::new(42), 0o644);
        let encoded = bincode::serialize(&attr).unwrap();
        let decoded: InodeAttr = bincode::deserialize(&encoded).unwrap();
        assert_eq!(attr, decoded);
    }

    #[test]
    fn test_dentry_ref_display() {
        let dn = DentryRef::new(DirFragId::new(InodeId::new(1), FragId::ROOT), "etc");
        assert_eq!(format!("{}", dn), "[dentry 0x1.*/etc]");
    }
}

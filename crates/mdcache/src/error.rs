//! Error types for cached-inode operations.
//!
//! Errors fall into three kinds: invariant violations (caller or protocol
//! bugs), transient refusals the caller retries after a wakeup, and decode
//! failures of wire payloads.

use thiserror::Error;

use crate::frag::{DirFragId, FragId};
use crate::lock::{LockKind, LockState};
use crate::object::PinReason;
use crate::types::{ClientId, DentryRef, InodeId, ServerId};

/// Broad classification of a [`CacheError`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// A caller or protocol bug: the object graph would become inconsistent.
    InvariantViolation,
    /// Expected and recoverable; retry after the relevant waiter fires.
    TransientRefusal,
    /// A malformed or truncated snapshot/lock payload.
    Decode,
}

/// Errors returned by cached-inode operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Unpin of a reason whose count is already zero.
    #[error("unpin of {reason:?} on {ino} which holds no such pin")]
    PinUnderflow {
        /// Inode being unpinned
        ino: InodeId,
        /// Reason with no pins left
        reason: PinReason,
    },

    /// Pin reason reserved for the inode's own bookkeeping.
    #[error("{reason:?} pins on {ino} are managed by the inode itself")]
    StructuralPin {
        /// Inode being pinned
        ino: InodeId,
        /// Reserved reason
        reason: PinReason,
    },

    /// The client already holds a capability on the inode.
    #[error("{ino} already has a capability for {client}")]
    CapabilityExists {
        /// Inode holding the ledger
        ino: InodeId,
        /// Client already present
        client: ClientId,
    },

    /// The client holds no capability on the inode.
    #[error("{ino} has no capability for {client}")]
    CapabilityMissing {
        /// Inode holding the ledger
        ino: InodeId,
        /// Client not present
        client: ClientId,
    },

    /// A primary parent is already linked.
    #[error("{ino} already has primary parent {existing}")]
    PrimaryParentExists {
        /// Child inode
        ino: InodeId,
        /// Dentry currently linked
        existing: DentryRef,
    },

    /// The primary parent is a different dentry.
    #[error("{ino} primary parent is not {dentry}")]
    PrimaryParentMismatch {
        /// Child inode
        ino: InodeId,
        /// Dentry the caller named
        dentry: DentryRef,
    },

    /// The remote parent is already recorded.
    #[error("{ino} already has remote parent {dentry}")]
    RemoteParentExists {
        /// Child inode
        ino: InodeId,
        /// Duplicate dentry
        dentry: DentryRef,
    },

    /// The remote parent is not recorded.
    #[error("{ino} has no remote parent {dentry}")]
    RemoteParentMissing {
        /// Child inode
        ino: InodeId,
        /// Unknown dentry
        dentry: DentryRef,
    },

    /// Auth unpin with no auth pins held.
    #[error("auth_unpin on {ino} with zero auth pins")]
    AuthPinUnderflow {
        /// Inode being unpinned
        ino: InodeId,
    },

    /// The nested auth pin count would go negative.
    #[error("nested auth pin count on {ino} would go negative")]
    NestedAuthPinUnderflow {
        /// Ancestor inode
        ino: InodeId,
    },

    /// The operation needs this server to be the authority.
    #[error("{ino}: operation requires authority")]
    NotAuthority {
        /// Replica inode
        ino: InodeId,
    },

    /// The operation needs a replica but this server is the authority.
    #[error("{ino}: operation requires a replica, this server is authority")]
    IsAuthority {
        /// Authoritative inode
        ino: InodeId,
    },

    /// The operation needs an inode with no replicas.
    #[error("{ino}: operation requires a non-replicated object")]
    AlreadyReplicated {
        /// Replicated inode
        ino: InodeId,
    },

    /// The server holds no replica of the inode.
    #[error("{ino} is not replicated on {server}")]
    ReplicaMissing {
        /// Authoritative inode
        ino: InodeId,
        /// Server without a replica
        server: ServerId,
    },

    /// A snapshot was applied to a different inode than it describes.
    #[error("snapshot of {snapshot} applied to {target}")]
    InodeMismatch {
        /// Inode being overwritten
        target: InodeId,
        /// Inode the snapshot describes
        snapshot: InodeId,
    },

    /// The lock cannot move between these states.
    #[error("{kind:?} lock: illegal transition from {from:?} to {to:?}")]
    IllegalLockTransition {
        /// Lock kind
        kind: LockKind,
        /// Current state
        from: LockState,
        /// Requested state
        to: LockState,
    },

    /// Release of a read or write lock that is not held.
    #[error("{kind:?} lock: release of a {mode} lock that is not held")]
    LockNotHeld {
        /// Lock kind
        kind: LockKind,
        /// "read" or "write"
        mode: &'static str,
    },

    /// A replica acked outside a pending transition.
    #[error("{kind:?} lock: unexpected ack from {server} in state {state:?}")]
    UnexpectedLockAck {
        /// Lock kind
        kind: LockKind,
        /// Acking server
        server: ServerId,
        /// State at the time of the ack
        state: LockState,
    },

    /// Scatter or gather on a lock kind that cannot scatter.
    #[error("{kind:?} lock does not support scatter/gather")]
    ScatterUnsupported {
        /// Lock kind
        kind: LockKind,
    },

    /// The inode is not a directory.
    #[error("{0} is not a directory")]
    NotADirectory(InodeId),

    /// The fragment is not open.
    #[error("fragment {0} is not open")]
    FragmentMissing(DirFragId),

    /// The fragment is already open.
    #[error("fragment {0} is already open")]
    FragmentOpen(DirFragId),

    /// Split or merge the fragment tree cannot take.
    #[error("invalid split of fragment {frag} by {bits} bits")]
    InvalidFragSplit {
        /// Fragment being split or merged
        frag: FragId,
        /// Split width
        bits: u8,
    },

    /// The inode is already cached.
    #[error("{0} is already cached")]
    InodeExists(InodeId),

    /// The inode is not cached.
    #[error("{0} is not cached")]
    InodeNotCached(InodeId),

    /// Auth pin refused while the inode is freezing, frozen or exporting.
    #[error("{ino} is freezing, frozen or exporting; auth pin refused")]
    AuthPinRefused {
        /// Inode refusing the pin
        ino: InodeId,
    },

    /// The lock is in a transitional state.
    #[error("{kind:?} lock is busy in state {state:?}")]
    LockBusy {
        /// Lock kind
        kind: LockKind,
        /// Current state
        state: LockState,
    },

    /// The inode is still pinned or linked.
    #[error("{ino} is pinned ({count} pins) or still linked")]
    Pinned {
        /// Inode that cannot be dropped
        ino: InodeId,
        /// Pins held
        count: u32,
    },

    /// Configuration rejected by validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// bincode could not decode the payload.
    #[error("decode error: {0}")]
    Decode(String),

    /// Bytes were left over after a payload.
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),

    /// The payload decoded but its contents are inconsistent.
    #[error("malformed snapshot: {0}")]
    MalformedSnapshot(String),
}

/// Result alias for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

impl CacheError {
    /// Classifies the error for the request pipeline.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CacheError::AuthPinRefused { .. }
            | CacheError::LockBusy { .. }
            | CacheError::Pinned { .. } => ErrorKind::TransientRefusal,
            CacheError::Decode(_)
            | CacheError::TrailingBytes(_)
            | CacheError::MalformedSnapshot(_) => ErrorKind::Decode,
            _ => ErrorKind::InvariantViolation,
        }
    }

    /// Returns true for caller/protocol bugs.
    pub fn is_invariant_violation(&self) -> bool {
        self.kind() == ErrorKind::InvariantViolation
    }

    /// Returns true for refusals the caller should retry after a wakeup.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::TransientRefusal
    }
}

impl From<bincode::Error> for CacheError {
    fn from(e: bincode::Error) -> Self {
        CacheError::Decode(e.to_string())
    }
}

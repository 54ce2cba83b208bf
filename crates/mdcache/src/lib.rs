#![warn(missing_docs)]

//! Metadata cache core: cached inodes with pins, distributed consistency
//! locks, client capabilities, and inode replication between metadata
//! servers.

pub mod access;
pub mod cache;
pub mod capability;
pub mod codec;
pub mod config;
pub mod error;
pub mod frag;
pub mod fragment;
pub mod inode;
pub mod lock;
mod lock_payload;
pub mod object;
pub mod popularity;
pub mod snapshot;
pub mod types;

pub use access::{AncestorAuthPins, AuthPinAccess, CapabilityAccess, NoAncestors};
pub use cache::{CacheStats, InodeCache};
pub use capability::{CapMask, Capability, CapabilityLedger, LedgerTransition};
pub use config::CacheConfig;
pub use error::{CacheError, ErrorKind, Result};
pub use frag::{DirFragId, FragId, FragTree};
pub use fragment::{FragmentHandle, FragmentService};
pub use inode::{CapRequest, DirFreeze, InodeObject};
pub use lock::{ConsistencyLock, LockKind, LockSnapshot, LockState, LockWait};
pub use object::{CacheObject, PinReason, StateFlags, WakeReason, Waiter};
pub use popularity::{DecayCounter, PopClass, Popularity};
pub use snapshot::{DiscoverSnapshot, ExportSnapshot};
pub use types::{ClientId, DentryRef, FileType, InodeAttr, InodeId, ServerId, Timestamp};

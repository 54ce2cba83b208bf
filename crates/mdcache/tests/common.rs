//! Common test utilities and fixtures for integration tests.
#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;

use mdcache::{
    CacheConfig, DirFragId, FragmentHandle, FragmentService, InodeAttr, InodeCache, InodeId,
    InodeObject, Result, ServerId, WakeReason, Waiter,
};

/// Installs a fmt subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Test configuration with short deadlines.
pub fn test_config() -> CacheConfig {
    CacheConfig {
        max_inodes: 64,
        caps_wanted_renew_secs: 2,
        ..Default::default()
    }
}

/// Creates an empty cache for server `id`.
pub fn make_cache(id: u64) -> InodeCache {
    InodeCache::new(ServerId::new(id), test_config()).unwrap()
}

/// Authoritative directory inode.
pub fn auth_dir(ino: u64) -> InodeObject {
    InodeObject::new_auth(InodeAttr::new_directory(InodeId::new(ino), 0o755), &test_config())
}

/// Authoritative regular file inode.
pub fn auth_file(ino: u64) -> InodeObject {
    InodeObject::new_auth(InodeAttr::new_file(InodeId::new(ino), 0o644), &test_config())
}

/// In-memory fragment store that tracks which fragments are open.
#[derive(Clone, Default)]
pub struct MemFragments {
    open: Rc<RefCell<BTreeSet<DirFragId>>>,
}

impl MemFragments {
    pub fn is_open(&self, dirfrag: DirFragId) -> bool {
        self.open.borrow().contains(&dirfrag)
    }

    pub fn open_count(&self) -> usize {
        self.open.borrow().len()
    }
}

#[derive(Debug)]
struct MemHandle {
    dirfrag: DirFragId,
    open: Rc<RefCell<BTreeSet<DirFragId>>>,
}

impl FragmentHandle for MemHandle {
    fn dirfrag(&self) -> DirFragId {
        self.dirfrag
    }

    fn entry_count(&self) -> usize {
        0
    }

    fn close(self: Box<Self>) {
        self.open.borrow_mut().remove(&self.dirfrag);
    }
}

impl FragmentService for MemFragments {
    fn get_or_create(&mut self, dirfrag: DirFragId) -> Result<Box<dyn FragmentHandle>> {
        self.open.borrow_mut().insert(dirfrag);
        Ok(Box::new(MemHandle {
            dirfrag,
            open: self.open.clone(),
        }))
    }
}

/// Records waiter invocations by label.
#[derive(Clone, Default)]
pub struct WakeLog {
    events: Rc<RefCell<Vec<(&'static str, WakeReason)>>>,
}

impl WakeLog {
    pub fn waiter(&self, label: &'static str) -> Waiter {
        let events = self.events.clone();
        Box::new(move |reason| events.borrow_mut().push((label, reason)))
    }

    pub fn events(&self) -> Vec<(&'static str, WakeReason)> {
        self.events.borrow().clone()
    }
}

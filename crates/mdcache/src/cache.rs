//! Inode arena with pin-aware LRU trimming.
//!
//! Inodes refer to one another only by identifier (`InodeId`, `DentryRef`);
//! this cache owns every `InodeObject` and resolves those identifiers. It
//! also applies Discover and Export payloads arriving from other servers.

use lru::LruCache;
use std::collections::BTreeSet;

use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::inode::InodeObject;
use crate::snapshot::{DiscoverSnapshot, ExportSnapshot};
use crate::types::{ClientId, InodeId, ServerId, Timestamp};

/// Counters describing cache activity.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups that found an inode.
    pub hits: u64,
    /// Lookups that found nothing.
    pub misses: u64,
    /// Inodes removed by trimming.
    pub evictions: u64,
    /// Inodes currently cached.
    pub size: usize,
}

/// Every inode cached by one metadata server.
pub struct InodeCache {
    server: ServerId,
    config: CacheConfig,
    inodes: LruCache<InodeId, InodeObject>,
    stats: CacheStats,
}

impl InodeCache {
    /// Creates an empty cache for metadata server `server`.
    pub fn new(server: ServerId, config: CacheConfig) -> Result<Self> {
        config.validate()?;
        tracing::debug!(%server, max_inodes = config.max_inodes, "created inode cache");
        Ok(Self {
            server,
            config,
            inodes: LruCache::unbounded(),
            stats: CacheStats::default(),
        })
    }

    /// Server owning this cache.
    pub fn server(&self) -> ServerId {
        self.server
    }

    /// Cache configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Number of cached inodes.
    pub fn len(&self) -> usize {
        self.inodes.len()
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.inodes.is_empty()
    }

    /// Adds an inode. Fails if one with the same number is cached.
    pub fn insert(&mut self, inode: InodeObject) -> Result<()> {
        let ino = inode.ino();
        if self.inodes.contains(&ino) {
            return Err(CacheError::InodeExists(ino));
        }
        self.inodes.push(ino, inode);
        Ok(())
    }

    /// Looks up an inode and marks it recently used.
    pub fn get(&mut self, ino: InodeId) -> Option<&InodeObject> {
        match self.inodes.get(&ino) {
            Some(inode) => {
                self.stats.hits += 1;
                Some(inode)
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Mutable lookup that marks the inode recently used.
    pub fn get_mut(&mut self, ino: InodeId) -> Option<&mut InodeObject> {
        match self.inodes.get_mut(&ino) {
            Some(inode) => {
                self.stats.hits += 1;
                Some(inode)
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Looks up an inode without touching its recency.
    pub fn peek(&self, ino: InodeId) -> Option<&InodeObject> {
        self.inodes.peek(&ino)
    }

    /// Marks an inode recently used.
    pub fn touch(&mut self, ino: InodeId) {
        self.inodes.promote(&ino);
    }

    /// Returns true if `ino` is cached.
    pub fn contains(&self, ino: InodeId) -> bool {
        self.inodes.contains(&ino)
    }

    /// Removes an inode regardless of pins. The caller takes ownership; its
    /// fragments close and its waiters are cancelled when it is dropped.
    pub fn remove(&mut self, ino: InodeId) -> Result<InodeObject> {
        self.inodes.pop(&ino).ok_or(CacheError::InodeNotCached(ino))
    }

    /// Returns true if `ino` may be destroyed: no pins and no parent links.
    pub fn is_evictable(&self, ino: InodeId) -> bool {
        self.inodes.peek(&ino).map_or(false, Self::evictable)
    }

    fn evictable(inode: &InodeObject) -> bool {
        inode.object().is_evictable() && !inode.is_linked() && !inode.is_root()
    }

    /// Evicts least recently used evictable inodes until at most `max`
    /// remain (or nothing more can go). Returns the evicted inode numbers.
    ///
    /// Open fragments and waiters both pin, so a trimmed inode holds
    /// neither.
    pub fn trim(&mut self, max: usize) -> Vec<InodeId> {
        let excess = self.inodes.len().saturating_sub(max);
        if excess == 0 {
            return Vec::new();
        }
        let victims: Vec<InodeId> = self
            .inodes
            .iter()
            .rev()
            .filter(|(_, inode)| Self::evictable(inode))
            .map(|(ino, _)| *ino)
            .take(excess)
            .collect();
        for ino in &victims {
            if self.inodes.pop(ino).is_some() {
                self.stats.evictions += 1;
                tracing::trace!(%ino, "trimmed");
            }
        }
        if victims.len() < excess {
            tracing::debug!(
                wanted = excess,
                evicted = victims.len(),
                "trim stopped at pinned inodes"
            );
        }
        victims
    }

    /// Trims to the configured `max_inodes`.
    pub fn trim_to_config(&mut self) -> Vec<InodeId> {
        self.trim(self.config.max_inodes)
    }

    /// Builds or refreshes a replica from a Discover payload. Nothing
    /// changes if the payload does not decode.
    pub fn apply_discover(&mut self, bytes: &[u8]) -> Result<InodeId> {
        let snap = DiscoverSnapshot::decode(bytes)?;
        let ino = snap.ino();
        match self.inodes.get_mut(&ino) {
            Some(inode) => snap.update_inode(inode)?,
            None => {
                let inode = snap.into_inode(&self.config)?;
                self.inodes.push(ino, inode);
            }
        }
        Ok(ino)
    }

    /// Takes over authority for an inode exported by `from`. Returns the
    /// clients whose capabilities this server must now announce itself to.
    /// Nothing changes if the payload does not decode.
    pub fn apply_export(
        &mut self,
        bytes: &[u8],
        from: ServerId,
        now: Timestamp,
    ) -> Result<BTreeSet<ClientId>> {
        let snap = ExportSnapshot::decode(bytes)?;
        let ino = snap.ino();
        if self.inodes.peek(&ino).map_or(false, InodeObject::is_auth) {
            return Err(CacheError::IsAuthority { ino });
        }
        let existing = self.inodes.pop(&ino);
        let was_cached = existing.is_some();
        let mut inode = match existing {
            Some(inode) => inode,
            None => InodeObject::new_replica(snap.attr().clone(), &self.config),
        };
        let applied = snap.update_inode(&mut inode, now).and_then(|new_clients| {
            inode.become_auth(self.server, from, &self.config)?;
            Ok(new_clients)
        });
        if applied.is_ok() || was_cached {
            self.inodes.push(ino, inode);
        }
        let new_clients = applied?;
        tracing::info!(%ino, %from, new_clients = new_clients.len(), "imported authority");
        Ok(new_clients)
    }

    /// Activity counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.inodes.len(),
            ..self.stats.clone()
        }
    }
}

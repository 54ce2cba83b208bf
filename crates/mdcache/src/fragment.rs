//! Directory-fragment collaborator.
//!
//! Fragment contents live in an external service; an inode only owns the
//! handles of the fragments it has opened.

use std::fmt;

use crate::error::Result;
use crate::frag::DirFragId;

/// An open directory fragment owned by its inode.
pub trait FragmentHandle: fmt::Debug {
    /// Fragment this handle refers to.
    fn dirfrag(&self) -> DirFragId;

    /// Number of entries currently cached in the fragment.
    fn entry_count(&self) -> usize;

    /// Releases the fragment back to the service.
    fn close(self: Box<Self>);
}

/// Opens directory fragments.
pub trait FragmentService {
    /// Returns a handle to `dirfrag`, creating the fragment if needed.
    fn get_or_create(&mut self, dirfrag: DirFragId) -> Result<Box<dyn FragmentHandle>>;
}

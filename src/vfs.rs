//! Virtual file collaborator used to stage scene bytes before a load-by-path call.

use std::cell::RefCell;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VfsError {
    #[error("path '{0}' is outside the sandbox root")]
    OutsideRoot(String),
    #[error("file '{0}' not found")]
    NotFound(String),
    #[error("file system backend error: {0}")]
    Backend(String),
}

/// Path-based file operations of the engine's sandboxed file system.
///
/// Implementations guarantee that a read after a write returns the written bytes and that
/// deleting a missing file before recreating it is harmless.
pub trait VirtualFileSystem {
    fn root(&self) -> &str;
    fn write(&self, path: &str, bytes: &[u8]) -> Result<(), VfsError>;
    fn read(&self, path: &str) -> Result<Vec<u8>, VfsError>;
    /// Returns whether a file was removed.
    fn delete(&self, path: &str) -> Result<bool, VfsError>;
    fn exists(&self, path: &str) -> bool;
}

/// Joins `name` onto `root`, refusing names that try to leave the sandbox.
pub fn sandboxed_path(root: &str, name: &str) -> Result<String, VfsError> {
    let trimmed = name.trim_start_matches('/');
    if trimmed.is_empty() || trimmed.split('/').any(|part| part == ".." || part.is_empty()) {
        return Err(VfsError::OutsideRoot(name.to_string()));
    }
    Ok(format!("{}/{}", root.trim_end_matches('/'), trimmed))
}

/// In-memory file system rooted at a sandbox directory.
#[derive(Debug)]
pub struct MemoryFileSystem {
    root: String,
    files: RefCell<BTreeMap<String, Vec<u8>>>,
}

impl MemoryFileSystem {
    pub fn new(root: impl Into<String>) -> Self {
        let mut root = root.into();
        if !root.starts_with('/') {
            root.insert(0, '/');
        }
        Self { root, files: RefCell::new(BTreeMap::new()) }
    }

    pub fn len(&self) -> usize {
        self.files.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.borrow().is_empty()
    }

    pub fn paths(&self) -> Vec<String> {
        self.files.borrow().keys().cloned().collect()
    }

    fn check(&self, path: &str) -> Result<(), VfsError> {
        let inside = path
            .strip_prefix(self.root.trim_end_matches('/'))
            .map(|rest| rest.starts_with('/') && !rest.split('/').any(|part| part == ".."))
            .unwrap_or(false);
        if inside {
            Ok(())
        } else {
            Err(VfsError::OutsideRoot(path.to_string()))
        }
    }
}

impl VirtualFileSystem for MemoryFileSystem {
    fn root(&self) -> &str {
        &self.root
    }

    fn write(&self, path: &str, bytes: &[u8]) -> Result<(), VfsError> {
        self.check(path)?;
        self.files.borrow_mut().insert(path.to_string(), bytes.to_vec());
        Ok(())
    }

    fn read(&self, path: &str) -> Result<Vec<u8>, VfsError> {
        self.check(path)?;
        self.files.borrow().get(path).cloned().ok_or_else(|| VfsError::NotFound(path.to_string()))
    }

    fn delete(&self, path: &str) -> Result<bool, VfsError> {
        self.check(path)?;
        Ok(self.files.borrow_mut().remove(path).is_some())
    }

    fn exists(&self, path: &str) -> bool {
        self.check(path).is_ok() && self.files.borrow().contains_key(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_back() {
        let fs = MemoryFileSystem::new("/vfs");
        fs.write("/vfs/scenes/a.vds", b"abc").expect("write");
        assert_eq!(fs.read("/vfs/scenes/a.vds").expect("read"), b"abc");
        assert!(fs.exists("/vfs/scenes/a.vds"));
    }

    #[test]
    fn delete_before_recreate_is_idempotent() {
        let fs = MemoryFileSystem::new("/vfs");
        assert!(!fs.delete("/vfs/a.vds").expect("delete missing"));
        fs.write("/vfs/a.vds", b"one").expect("write");
        assert!(fs.delete("/vfs/a.vds").expect("delete"));
        fs.write("/vfs/a.vds", b"two").expect("rewrite");
        assert_eq!(fs.read("/vfs/a.vds").expect("read"), b"two");
    }

    #[test]
    fn paths_outside_root_are_refused() {
        let fs = MemoryFileSystem::new("vfs");
        assert_eq!(fs.root(), "/vfs");
        assert!(matches!(fs.write("/etc/passwd", b""), Err(VfsError::OutsideRoot(_))));
        assert!(matches!(fs.write("/vfs/../etc", b""), Err(VfsError::OutsideRoot(_))));
        assert!(matches!(fs.write("/vfsx/a", b""), Err(VfsError::OutsideRoot(_))));
        assert!(matches!(sandboxed_path("/vfs", "../a"), Err(VfsError::OutsideRoot(_))));
        assert_eq!(sandboxed_path("/vfs/", "/scenes/a.vds").expect("join"), "/vfs/scenes/a.vds");
    }
}

//! Virtual filesystem node tree
//!
//! An in-memory tree of nodes rooted at a synthetic `"root"` node whose
//! first child is the mounted filesystem root. Parent-to-child edges
//! own (`Arc`); child-to-parent edges are weak. Per-mount behavior
//! hangs off a node's [`FileSystemOperations`] operator.
//!
//! ## Locking
//!
//! One structural lock serializes Create/Delete/Mount/Unmount. Read and
//! Write resolve the handle to its operator under the lock and release
//! it before invoking the operator, so operators may block or recurse
//! into the VFS.

use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use core::sync::atomic::{AtomicU8, Ordering};

use spin::RwLock;

use crate::error::{KernelError, KernelResult};
use crate::fs::path;
use crate::lock::SmartLock;

/// Longest allowed node name
pub const NAME_MAX: usize = 255;

/// Node type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeFlags {
    Directory,
    File,
    Mountpoint,
    CharDevice,
    BlockDevice,
    Pipe,
    Symlink,
}

/// Status carried by a file handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileStatus {
    Ok = 0,
    NotFound = 1,
    InvalidParameter = 2,
    InvalidOperator = 3,
    InvalidNode = 4,
    InvalidHandle = 5,
    UnknownError = 6,
}

impl FileStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Ok,
            1 => Self::NotFound,
            2 => Self::InvalidParameter,
            3 => Self::InvalidOperator,
            4 => Self::InvalidNode,
            5 => Self::InvalidHandle,
            _ => Self::UnknownError,
        }
    }
}

/// Per-mount operations
///
/// A node without an operator answers every read and write with zero
/// bytes and flags the handle `InvalidOperator`.
pub trait FileSystemOperations: Send + Sync {
    /// Filesystem name, for diagnostics
    fn name(&self) -> &str;

    /// Read from `node` at `offset` into `buffer`, returning bytes read
    fn read(&self, node: &Node, offset: u64, buffer: &mut [u8]) -> usize {
        let _ = (node, offset, buffer);
        0
    }

    /// Write to `node` at `offset` from `buffer`, returning bytes written
    fn write(&self, node: &Node, offset: u64, buffer: &[u8]) -> usize {
        let _ = (node, offset, buffer);
        0
    }
}

/// Mutable node state behind the node's RwLock
struct NodeInner {
    parent: Option<Weak<Node>>,
    children: Vec<Arc<Node>>,
    operator: Option<Arc<dyn FileSystemOperations>>,
    /// Backing location, meaning is operator-specific (e.g. offset into
    /// an initrd archive)
    address: u64,
    /// Content length in bytes
    length: u64,
}

/// One node in the tree
pub struct Node {
    /// Name within the parent directory - immutable after creation
    name: String,
    /// Node type - immutable after creation
    flags: NodeFlags,
    inner: RwLock<NodeInner>,
}

impl core::fmt::Debug for Node {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("flags", &self.flags)
            .finish()
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        core::ptr::eq(self, other)
    }
}

impl Node {
    fn new(name: String, flags: NodeFlags) -> Arc<Self> {
        Arc::new(Self {
            name,
            flags,
            inner: RwLock::new(NodeInner {
                parent: None,
                children: Vec::new(),
                operator: None,
                address: 0,
                length: 0,
            }),
        })
    }

    /// Node name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Node type
    pub fn flags(&self) -> NodeFlags {
        self.flags
    }

    /// Parent node, if still alive
    pub fn parent(&self) -> Option<Arc<Node>> {
        self.inner.read().parent.as_ref().and_then(Weak::upgrade)
    }

    fn set_parent(&self, parent: &Arc<Node>) {
        self.inner.write().parent = Some(Arc::downgrade(parent));
    }

    /// Snapshot of the children
    pub fn children(&self) -> Vec<Arc<Node>> {
        self.inner.read().children.clone()
    }

    /// Number of children
    pub fn child_count(&self) -> usize {
        self.inner.read().children.len()
    }

    /// Child by exact name
    pub fn lookup_child(&self, name: &str) -> Option<Arc<Node>> {
        self.inner
            .read()
            .children
            .iter()
            .find(|c| c.name == name)
            .cloned()
    }

    fn add_child(self: &Arc<Self>, child: Arc<Node>) -> KernelResult<()> {
        let mut inner = self.inner.write();
        if inner.children.iter().any(|c| c.name == child.name) {
            return Err(KernelError::AlreadyExists);
        }
        child.set_parent(self);
        inner.children.push(child);
        Ok(())
    }

    fn remove_child(&self, name: &str) -> KernelResult<Arc<Node>> {
        let mut inner = self.inner.write();
        let pos = inner
            .children
            .iter()
            .position(|c| c.name == name)
            .ok_or(KernelError::NotFound)?;
        Ok(inner.children.remove(pos))
    }

    /// The node's operator, if any
    pub fn operator(&self) -> Option<Arc<dyn FileSystemOperations>> {
        self.inner.read().operator.clone()
    }

    /// Install or replace the operator
    pub fn set_operator(&self, operator: Option<Arc<dyn FileSystemOperations>>) {
        self.inner.write().operator = operator;
    }

    /// Operator-specific backing address
    pub fn address(&self) -> u64 {
        self.inner.read().address
    }

    /// Content length in bytes
    pub fn length(&self) -> u64 {
        self.inner.read().length
    }

    /// Set the backing address and length
    pub fn set_backing(&self, address: u64, length: u64) {
        let mut inner = self.inner.write();
        inner.address = address;
        inner.length = length;
    }
}

/// A handle onto a node
///
/// Handles are independent of the node: closing (dropping) a handle
/// does not destroy the node, and a deleted node leaves the handle
/// dangling with `InvalidNode` on the next use.
pub struct FileHandle {
    node: RwLock<Weak<Node>>,
    name: String,
    status: AtomicU8,
}

impl FileHandle {
    fn new(node: Option<&Arc<Node>>, name: &str, status: FileStatus) -> Arc<Self> {
        Arc::new(Self {
            node: RwLock::new(node.map(Arc::downgrade).unwrap_or_default()),
            name: String::from(name),
            status: AtomicU8::new(status as u8),
        })
    }

    /// The handle's node, if still alive
    pub fn node(&self) -> Option<Arc<Node>> {
        self.node.read().upgrade()
    }

    /// Basename the handle was opened with
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Last operation status
    pub fn status(&self) -> FileStatus {
        FileStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, status: FileStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Whether the last operation succeeded
    pub fn is_ok(&self) -> bool {
        self.status() == FileStatus::Ok
    }
}

/// The virtual filesystem
pub struct Virtual {
    /// Synthetic root; its first child is the filesystem root
    root: Arc<Node>,
    /// Structural lock over Create/Delete/Mount/Unmount
    lock: SmartLock<()>,
}

impl Virtual {
    /// Create an empty VFS with only the synthetic root
    pub fn new() -> Self {
        Self {
            root: Node::new(String::from("root"), NodeFlags::Mountpoint),
            lock: SmartLock::new("vfs", ()),
        }
    }

    /// The synthetic root node
    pub fn root_node(&self) -> Arc<Node> {
        self.root.clone()
    }

    /// The mounted filesystem root (first child of the synthetic root)
    pub fn filesystem_root(&self) -> Option<Arc<Node>> {
        self.root.inner.read().children.first().cloned()
    }

    /// Create a top-level filesystem root under the synthetic root
    ///
    /// Used when mounting the initrd: the new node becomes `/`.
    pub fn create_root(
        &self,
        name: &str,
        operator: Arc<dyn FileSystemOperations>,
    ) -> KernelResult<Arc<Node>> {
        let _guard = self.lock.lock();
        let node = Node::new(String::from(name), NodeFlags::Mountpoint);
        node.set_operator(Some(operator));
        self.root.add_child(node.clone())?;
        Ok(node)
    }

    /// Canonical absolute path of `node`
    pub fn get_path_from_node(&self, node: &Arc<Node>) -> String {
        let mut components: Vec<String> = Vec::new();
        let mut current = node.clone();

        loop {
            let Some(parent) = current.parent() else {
                break;
            };
            // Children of the synthetic root are filesystem roots; their
            // names do not appear in paths
            if Arc::ptr_eq(&parent, &self.root) {
                break;
            }
            components.push(String::from(current.name()));
            current = parent;
        }

        if components.is_empty() {
            return String::from("/");
        }

        components.reverse();
        let mut result = String::new();
        for component in components {
            result.push('/');
            result.push_str(&component);
        }
        result
    }

    /// Resolve a path to a node
    ///
    /// Absolute paths start at the filesystem root; relative paths at
    /// `parent` (or the filesystem root when `parent` is `None`).
    pub fn get_node_from_path(&self, path: &str, parent: Option<&Arc<Node>>) -> Option<Arc<Node>> {
        let start = if path::is_absolute(path) || parent.is_none() {
            self.filesystem_root()?
        } else {
            parent.cloned()?
        };

        let mut current = start;
        for segment in path::segments(path) {
            match segment {
                "." => {}
                ".." => {
                    if let Some(p) = current.parent()
                        && !Arc::ptr_eq(&p, &self.root)
                    {
                        current = p;
                    }
                }
                name => current = current.lookup_child(name)?,
            }
        }
        Some(current)
    }

    /// Normalize `path` against `parent`'s location
    pub fn normalize_path(&self, path: &str, parent: Option<&Arc<Node>>) -> String {
        let parent_path = match parent {
            Some(node) => self.get_path_from_node(node),
            None => String::from("/"),
        };
        path::normalize(path, &parent_path)
    }

    /// Whether a path resolves to a node
    pub fn path_exists(&self, path: &str, parent: Option<&Arc<Node>>) -> bool {
        if path.is_empty() {
            return false;
        }
        let clean = self.normalize_path(path, parent);
        self.get_node_from_path(&clean, None).is_some()
    }

    /// Create a node at `path`, installing `flags` on the leaf
    ///
    /// Missing intermediate components are created as directories that
    /// inherit their parent's operator. Fails if the full path already
    /// exists.
    pub fn create(
        &self,
        path: &str,
        flags: NodeFlags,
        parent: Option<&Arc<Node>>,
    ) -> KernelResult<Arc<Node>> {
        let _guard = self.lock.lock();
        self.create_locked(path, flags, parent)
    }

    fn create_locked(
        &self,
        path: &str,
        flags: NodeFlags,
        parent: Option<&Arc<Node>>,
    ) -> KernelResult<Arc<Node>> {
        if path.is_empty() {
            return Err(KernelError::InvalidParameter);
        }

        let clean = self.normalize_path(path, parent);
        if self.get_node_from_path(&clean, None).is_some() {
            return Err(KernelError::AlreadyExists);
        }

        let mut current = self
            .filesystem_root()
            .ok_or(KernelError::InvalidPath)?;

        let segment_count = path::segments(&clean).count();
        for (i, segment) in path::segments(&clean).enumerate() {
            if segment.len() > NAME_MAX {
                return Err(KernelError::InvalidParameter);
            }

            if let Some(child) = current.lookup_child(segment) {
                current = child;
                continue;
            }

            let is_leaf = i == segment_count - 1;
            let node_flags = if is_leaf { flags } else { NodeFlags::Directory };
            let node = Node::new(String::from(segment), node_flags);
            node.set_operator(current.operator());
            current.add_child(node.clone())?;
            current = node;
        }

        Ok(current)
    }

    /// Delete the node at `path`
    ///
    /// Directories require `recursive` unless empty. A recursive delete
    /// attempts each child individually; the parent is removed only if
    /// every child went, otherwise `PartiallyCompleted` is returned
    /// with the rest of the tree intact.
    pub fn delete(
        &self,
        path: &str,
        recursive: bool,
        parent: Option<&Arc<Node>>,
    ) -> KernelResult<()> {
        let _guard = self.lock.lock();
        self.delete_locked(path, recursive, parent)
    }

    fn delete_locked(
        &self,
        path: &str,
        recursive: bool,
        parent: Option<&Arc<Node>>,
    ) -> KernelResult<()> {
        if path.is_empty() {
            return Err(KernelError::InvalidParameter);
        }

        let clean = self.normalize_path(path, parent);
        let node = self
            .get_node_from_path(&clean, None)
            .ok_or(KernelError::InvalidPath)?;

        if node.flags() == NodeFlags::Directory || node.flags() == NodeFlags::Mountpoint {
            let children = node.children();
            if !children.is_empty() {
                if !recursive {
                    return Err(KernelError::DirectoryNotEmpty);
                }
                let mut failed = false;
                for child in children {
                    let child_path = self.get_path_from_node(&child);
                    if self.delete_locked(&child_path, true, None).is_err() {
                        failed = true;
                    }
                }
                if failed {
                    return Err(KernelError::PartiallyCompleted);
                }
            }
        }

        let node_parent = node.parent().ok_or(KernelError::InvalidPath)?;
        node_parent.remove_child(node.name())?;
        Ok(())
    }

    /// Mount `operator` at `path`, creating the mountpoint node
    pub fn mount(
        &self,
        path: &str,
        operator: Arc<dyn FileSystemOperations>,
    ) -> KernelResult<Arc<FileHandle>> {
        let _guard = self.lock.lock();

        if path.is_empty() {
            return Err(KernelError::InvalidParameter);
        }

        let node = self.create_locked(path, NodeFlags::Mountpoint, None)?;
        node.set_operator(Some(operator));
        Ok(FileHandle::new(
            Some(&node),
            path::basename(path),
            FileStatus::Ok,
        ))
    }

    /// Detach a mountpoint: clear its operator and remove the node
    ///
    /// An invalid handle (node already gone) is `InvalidParameter`.
    pub fn unmount(&self, file: &FileHandle) -> KernelResult<()> {
        let _guard = self.lock.lock();

        let node = file.node().ok_or(KernelError::InvalidParameter)?;
        if node.flags() != NodeFlags::Mountpoint {
            return Err(KernelError::InvalidParameter);
        }

        node.set_operator(None);
        let parent = node.parent().ok_or(KernelError::InvalidParameter)?;
        parent.remove_child(node.name())?;
        *file.node.write() = Weak::new();
        Ok(())
    }

    /// Open a path
    ///
    /// `"/"`, `"."` and `".."` are special-cased. The returned handle
    /// always exists; a failed lookup is reported through its status.
    pub fn open(&self, path: &str, parent: Option<&Arc<Node>>) -> Arc<FileHandle> {
        let _guard = self.lock.lock();

        match path {
            "/" => {
                let node = self.filesystem_root();
                return match node {
                    Some(n) => FileHandle::new(Some(&n), "/", FileStatus::Ok),
                    None => FileHandle::new(None, "/", FileStatus::NotFound),
                };
            }
            "." => {
                return match parent {
                    Some(node) => FileHandle::new(Some(node), node.name(), FileStatus::Ok),
                    None => FileHandle::new(None, ".", FileStatus::NotFound),
                };
            }
            ".." => {
                let up = parent.and_then(|p| p.parent());
                return match up {
                    Some(node) => {
                        let name = String::from(node.name());
                        FileHandle::new(Some(&node), &name, FileStatus::Ok)
                    }
                    None => FileHandle::new(None, "..", FileStatus::NotFound),
                };
            }
            _ => {}
        }

        let clean = self.normalize_path(path, parent);
        match self.get_node_from_path(&clean, None) {
            Some(node) => FileHandle::new(Some(&node), path::basename(&clean), FileStatus::Ok),
            None => FileHandle::new(None, path::basename(&clean), FileStatus::NotFound),
        }
    }

    /// Read through a handle's operator
    ///
    /// The operator runs outside the structural lock.
    pub fn read(&self, file: &FileHandle, offset: u64, buffer: &mut [u8]) -> usize {
        let (node, operator) = {
            let _guard = self.lock.lock();
            let Some(node) = file.node() else {
                file.set_status(FileStatus::InvalidNode);
                return 0;
            };
            let Some(operator) = node.operator() else {
                file.set_status(FileStatus::InvalidOperator);
                return 0;
            };
            (node, operator)
        };

        file.set_status(FileStatus::Ok);
        operator.read(&node, offset, buffer)
    }

    /// Write through a handle's operator
    ///
    /// The operator runs outside the structural lock.
    pub fn write(&self, file: &FileHandle, offset: u64, buffer: &[u8]) -> usize {
        let (node, operator) = {
            let _guard = self.lock.lock();
            let Some(node) = file.node() else {
                file.set_status(FileStatus::InvalidNode);
                return 0;
            };
            let Some(operator) = node.operator() else {
                file.set_status(FileStatus::InvalidOperator);
                return 0;
            };
            (node, operator)
        };

        file.set_status(FileStatus::Ok);
        operator.write(&node, offset, buffer)
    }
}

impl Default for Virtual {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullOps;

    impl FileSystemOperations for NullOps {
        fn name(&self) -> &str {
            "null"
        }
    }

    struct EchoOps;

    impl FileSystemOperations for EchoOps {
        fn name(&self) -> &str {
            "echo"
        }

        fn read(&self, node: &Node, offset: u64, buffer: &mut [u8]) -> usize {
            // Report the node length minus offset, capped by the buffer
            let remaining = node.length().saturating_sub(offset) as usize;
            let n = remaining.min(buffer.len());
            buffer[..n].fill(0xAB);
            n
        }
    }

    fn fresh_vfs() -> Virtual {
        let vfs = Virtual::new();
        vfs.create_root("/", Arc::new(NullOps)).unwrap();
        vfs
    }

    #[test]
    fn test_create_builds_intermediates() {
        let vfs = fresh_vfs();
        let node = vfs.create("/a/b/c/d", NodeFlags::File, None).unwrap();
        assert_eq!(node.name(), "d");
        assert_eq!(node.flags(), NodeFlags::File);

        let b = vfs.get_node_from_path("/a/b", None).unwrap();
        assert_eq!(b.flags(), NodeFlags::Directory);
    }

    #[test]
    fn test_create_existing_fails() {
        let vfs = fresh_vfs();
        vfs.create("/a/b", NodeFlags::File, None).unwrap();
        assert_eq!(
            vfs.create("/a/b", NodeFlags::File, None),
            Err(KernelError::AlreadyExists)
        );
    }

    #[test]
    fn test_sibling_names_unique() {
        let vfs = fresh_vfs();
        let dir = vfs.create("/dir", NodeFlags::Directory, None).unwrap();
        let dup = Node::new(String::from("dir"), NodeFlags::Directory);
        assert_eq!(
            vfs.filesystem_root().unwrap().add_child(dup),
            Err(KernelError::AlreadyExists)
        );
        assert_eq!(dir.name(), "dir");
    }

    #[test]
    fn test_path_round_trip() {
        let vfs = fresh_vfs();
        let node = vfs.create("/x/y/z", NodeFlags::File, None).unwrap();
        let path = vfs.get_path_from_node(&node);
        assert_eq!(path, "/x/y/z");
        let found = vfs.get_node_from_path(&path, None).unwrap();
        assert!(Arc::ptr_eq(&node, &found));
    }

    #[test]
    fn test_delete_recursive() {
        let vfs = fresh_vfs();
        vfs.create("/a/b/c/d", NodeFlags::Directory, None).unwrap();
        vfs.delete("/a", true, None).unwrap();
        assert!(!vfs.path_exists("/a", None));
    }

    #[test]
    fn test_delete_non_recursive_rejects_non_empty() {
        let vfs = fresh_vfs();
        vfs.create("/a/b", NodeFlags::File, None).unwrap();
        assert_eq!(
            vfs.delete("/a", false, None),
            Err(KernelError::DirectoryNotEmpty)
        );
        assert!(vfs.path_exists("/a/b", None));

        vfs.delete("/a/b", false, None).unwrap();
        vfs.delete("/a", false, None).unwrap();
        assert!(!vfs.path_exists("/a", None));
    }

    #[test]
    fn test_delete_missing_is_invalid_path() {
        let vfs = fresh_vfs();
        assert_eq!(vfs.delete("/ghost", false, None), Err(KernelError::InvalidPath));
    }

    #[test]
    fn test_open_special_paths() {
        let vfs = fresh_vfs();
        let dir = vfs.create("/home/user", NodeFlags::Directory, None).unwrap();

        let root = vfs.open("/", None);
        assert!(root.is_ok());

        let dot = vfs.open(".", Some(&dir));
        assert!(dot.is_ok());
        assert!(Arc::ptr_eq(&dot.node().unwrap(), &dir));

        let dotdot = vfs.open("..", Some(&dir));
        assert!(dotdot.is_ok());
        assert_eq!(dotdot.node().unwrap().name(), "home");
    }

    #[test]
    fn test_open_missing_sets_not_found() {
        let vfs = fresh_vfs();
        let handle = vfs.open("/nope", None);
        assert_eq!(handle.status(), FileStatus::NotFound);
        assert!(handle.node().is_none());
    }

    #[test]
    fn test_relative_resolution() {
        let vfs = fresh_vfs();
        vfs.create("/a/b/c", NodeFlags::File, None).unwrap();
        let b = vfs.get_node_from_path("/a/b", None).unwrap();

        let c = vfs.get_node_from_path("c", Some(&b)).unwrap();
        assert_eq!(c.name(), "c");

        let handle = vfs.open("../b/c", Some(&b));
        assert!(handle.is_ok());
    }

    #[test]
    fn test_mount_unmount() {
        let vfs = fresh_vfs();
        let handle = vfs.mount("/mnt/disk", Arc::new(NullOps)).unwrap();
        let node = handle.node().unwrap();
        assert_eq!(node.flags(), NodeFlags::Mountpoint);
        assert!(node.operator().is_some());

        vfs.unmount(&handle).unwrap();
        assert!(!vfs.path_exists("/mnt/disk", None));
        // Second unmount sees a dangling handle
        assert_eq!(vfs.unmount(&handle), Err(KernelError::InvalidParameter));
    }

    #[test]
    fn test_read_delegates_to_operator() {
        let vfs = fresh_vfs();
        let node = vfs.create("/data", NodeFlags::File, None).unwrap();
        node.set_operator(Some(Arc::new(EchoOps)));
        node.set_backing(0, 10);

        let handle = vfs.open("/data", None);
        let mut buf = [0u8; 16];
        assert_eq!(vfs.read(&handle, 0, &mut buf), 10);
        assert_eq!(buf[0], 0xAB);
        assert_eq!(vfs.read(&handle, 8, &mut buf), 2);
        assert!(handle.is_ok());
    }

    #[test]
    fn test_read_without_operator_sets_status() {
        let vfs = Virtual::new();
        // Root mount carries no operator here
        let root_op: Arc<dyn FileSystemOperations> = Arc::new(NullOps);
        vfs.create_root("/", root_op).unwrap();
        let node = vfs.create("/bare", NodeFlags::File, None).unwrap();
        node.set_operator(None);

        let handle = vfs.open("/bare", None);
        let mut buf = [0u8; 4];
        assert_eq!(vfs.read(&handle, 0, &mut buf), 0);
        assert_eq!(handle.status(), FileStatus::InvalidOperator);
    }

    #[test]
    fn test_deleted_node_invalidates_handle() {
        let vfs = fresh_vfs();
        vfs.create("/tmp/file", NodeFlags::File, None).unwrap();
        let handle = vfs.open("/tmp/file", None);
        assert!(handle.is_ok());

        vfs.delete("/tmp", true, None).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(vfs.read(&handle, 0, &mut buf), 0);
        assert_eq!(handle.status(), FileStatus::InvalidNode);
    }
}

//! The typed virtual filesystem tree.
//!
//! A tree of named nodes rooted at `/`. Internal nodes are directory-like
//! and own their child lists; leaves borrow exactly one mounted object of
//! an arbitrary `'static` type. Retrieval is type-checked at runtime
//! against the stored `TypeId`, and constness is preserved: an object
//! mounted immutably can never be fetched mutably.
//!
//! The tree never owns mounted objects and never destroys nodes at
//! runtime, so references handed out by `get` stay valid for the kernel's
//! lifetime. Nodes are arena-allocated and linked by index — no owning
//! pointers, no cycles.

extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;
use core::any::TypeId;
use core::fmt;

use keel_lib::{IrqRwLock, klog_info};

use super::dirent::{Dirent, FsError, path_components};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VfsError {
    /// The path does not exist.
    NotFound,
    /// The stored object is of a different type, or constness does not
    /// allow the requested access.
    BadCast,
    /// The node holds no object.
    NotLeaf,
    /// A path component is not a directory-like node.
    NotParent,
    /// Mounting on an occupied or uncreatable mount point.
    MountpointInvalid,
    /// Empty or malformed path.
    InvalidPath,
}

impl fmt::Display for VfsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::NotFound => "no such node",
            Self::BadCast => "mounted object has a different type",
            Self::NotLeaf => "node holds no object",
            Self::NotParent => "not a parent node",
            Self::MountpointInvalid => "invalid or occupied mount point",
            Self::InvalidPath => "invalid path",
        };
        write!(f, "{}", text)
    }
}

struct MountedObject {
    type_id: TypeId,
    is_const: bool,
    ptr: *const (),
}

// SAFETY: the pointer targets a 'static object whose concrete type is
// re-checked on every retrieval; the kernel's single-writer convention
// governs mutable access.
unsafe impl Send for MountedObject {}
unsafe impl Sync for MountedObject {}

struct VfsNode {
    name: String,
    desc: String,
    obj: Option<MountedObject>,
    children: Vec<usize>,
}

impl VfsNode {
    fn directory(name: &str, desc: &str) -> Self {
        Self {
            name: String::from(name),
            desc: String::from(desc),
            obj: None,
            children: Vec::new(),
        }
    }
}

pub struct VfsTree {
    arena: Vec<VfsNode>,
}

impl VfsTree {
    pub fn new() -> Self {
        Self {
            arena: alloc::vec![VfsNode::directory("/", "root")],
        }
    }

    fn child_named(&self, parent: usize, name: &str) -> Option<usize> {
        self.arena[parent]
            .children
            .iter()
            .copied()
            .find(|&idx| self.arena[idx].name == name)
    }

    /// Walk without creating. `None` when any component is missing.
    pub fn walk(&self, path: &str) -> Option<usize> {
        let mut current = 0usize;
        for component in path_components(path) {
            current = self.child_named(current, component)?;
        }
        Some(current)
    }

    /// Walk as far as possible, returning the deepest node en route that
    /// holds a [`Dirent`] — the point where a mounted filesystem takes
    /// over resolution — together with the unresolved remainder of the
    /// path.
    pub fn walk_partial(&self, path: &str) -> Option<(usize, String)> {
        let components: Vec<&str> = path_components(path).collect();
        let mut current = 0usize;
        let mut best: Option<(usize, usize)> = if self.node_holds::<Dirent>(0) {
            Some((0, 0))
        } else {
            None
        };

        for (i, component) in components.iter().enumerate() {
            match self.child_named(current, component) {
                Some(next) => {
                    current = next;
                    if self.node_holds::<Dirent>(current) {
                        best = Some((current, i + 1));
                    }
                }
                None => break,
            }
        }

        best.map(|(idx, consumed)| (idx, components[consumed..].join("/")))
    }

    fn node_holds<T: 'static>(&self, idx: usize) -> bool {
        self.arena[idx]
            .obj
            .as_ref()
            .map(|o| o.type_id == TypeId::of::<T>())
            .unwrap_or(false)
    }

    fn mount_internal(
        &mut self,
        path: &str,
        obj: MountedObject,
        desc: &str,
        create: bool,
    ) -> Result<(), VfsError> {
        let mut components: Vec<&str> = path_components(path).collect();
        let leaf_name = components.pop().ok_or(VfsError::InvalidPath)?;

        let mut parent = 0usize;
        for component in components {
            parent = match self.child_named(parent, component) {
                Some(next) => next,
                None if create => {
                    let idx = self.arena.len();
                    self.arena.push(VfsNode::directory(component, ""));
                    self.arena[parent].children.push(idx);
                    idx
                }
                None => return Err(VfsError::MountpointInvalid),
            };
        }

        if self.child_named(parent, leaf_name).is_some() {
            return Err(VfsError::MountpointInvalid);
        }

        let idx = self.arena.len();
        self.arena.push(VfsNode {
            name: String::from(leaf_name),
            desc: String::from(desc),
            obj: Some(obj),
            children: Vec::new(),
        });
        self.arena[parent].children.push(idx);
        Ok(())
    }

    /// Mount an immutable object at `path`.
    pub fn mount<T: 'static>(
        &mut self,
        path: &str,
        obj: &'static T,
        desc: &str,
        create: bool,
    ) -> Result<(), VfsError> {
        self.mount_internal(
            path,
            MountedObject {
                type_id: TypeId::of::<T>(),
                is_const: true,
                ptr: obj as *const T as *const (),
            },
            desc,
            create,
        )
    }

    /// Mount a mutable object at `path`.
    ///
    /// The tree borrows, never owns: the caller keeps the object alive and
    /// guarantees the single-writer discipline the kernel runs under.
    pub fn mount_mut<T: 'static>(
        &mut self,
        path: &str,
        obj: &'static mut T,
        desc: &str,
        create: bool,
    ) -> Result<(), VfsError> {
        self.mount_internal(
            path,
            MountedObject {
                type_id: TypeId::of::<T>(),
                is_const: false,
                ptr: obj as *mut T as *const (),
            },
            desc,
            create,
        )
    }

    /// Fetch the object mounted at `path` as a shared reference.
    pub fn get<T: 'static>(&self, path: &str) -> Result<&'static T, VfsError> {
        let idx = self.walk(path).ok_or(VfsError::NotFound)?;
        let obj = self.arena[idx].obj.as_ref().ok_or(VfsError::NotLeaf)?;
        if obj.type_id != TypeId::of::<T>() {
            return Err(VfsError::BadCast);
        }
        // SAFETY: type just verified; the pointee is 'static and nodes are
        // never destroyed.
        Ok(unsafe { &*(obj.ptr as *const T) })
    }

    /// Fetch the object mounted at `path` mutably. Fails with `BadCast`
    /// when it was mounted const.
    pub fn get_mut<T: 'static>(&self, path: &str) -> Result<&'static mut T, VfsError> {
        let idx = self.walk(path).ok_or(VfsError::NotFound)?;
        let obj = self.arena[idx].obj.as_ref().ok_or(VfsError::NotLeaf)?;
        if obj.type_id != TypeId::of::<T>() || obj.is_const {
            return Err(VfsError::BadCast);
        }
        // SAFETY: type and mutability verified; exclusivity follows the
        // kernel's single-writer convention for mounted objects.
        Ok(unsafe { &mut *(obj.ptr as *const T as *mut T) })
    }

    /// Children of the node at `path`.
    pub fn child_count(&self, path: &str) -> Result<usize, VfsError> {
        let idx = self.walk(path).ok_or(VfsError::NotFound)?;
        Ok(self.arena[idx].children.len())
    }

    /// Log the tree (diagnostics).
    pub fn print_tree(&self) {
        self.print_node(0, 0);
    }

    fn print_node(&self, idx: usize, depth: usize) {
        let node = &self.arena[idx];
        let tag = if node.obj.is_some() { " (leaf)" } else { "" };
        klog_info!(
            "{:indent$}-- {}{} {}",
            "",
            node.name,
            tag,
            node.desc,
            indent = depth * 3
        );
        for &child in &node.children {
            self.print_node(child, depth + 1);
        }
    }
}

impl Default for VfsTree {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// The kernel-wide tree
// =============================================================================

// Mounting is rare and resolution is constant: a writer-preferring rwlock
// lets concurrent lookups proceed side by side.
static VFS: IrqRwLock<Option<VfsTree>> = IrqRwLock::new(None);

fn with_tree_mut<R>(f: impl FnOnce(&mut VfsTree) -> R) -> R {
    let mut guard = VFS.write();
    if guard.is_none() {
        *guard = Some(VfsTree::new());
    }
    f(guard.as_mut().unwrap())
}

fn with_tree<R>(f: impl FnOnce(&VfsTree) -> Result<R, VfsError>) -> Result<R, VfsError> {
    let guard = VFS.read();
    match guard.as_ref() {
        Some(tree) => f(tree),
        None => Err(VfsError::NotFound),
    }
}

/// Mount an immutable object on the kernel tree, creating intermediate
/// directories.
pub fn mount<T: 'static>(path: &str, obj: &'static T, desc: &str) -> Result<(), VfsError> {
    with_tree_mut(|tree| tree.mount(path, obj, desc, true))
}

/// Mount a mutable object on the kernel tree.
pub fn mount_mut<T: 'static>(path: &str, obj: &'static mut T, desc: &str) -> Result<(), VfsError> {
    with_tree_mut(|tree| tree.mount_mut(path, obj, desc, true))
}

pub fn get<T: 'static>(path: &str) -> Result<&'static T, VfsError> {
    with_tree(|tree| tree.get(path))
}

pub fn get_mut<T: 'static>(path: &str) -> Result<&'static mut T, VfsError> {
    with_tree(|tree| tree.get_mut(path))
}

/// Resolve `path` through the deepest mounted [`Dirent`] on the way — the
/// VFS-level `stat` feeding the POSIX file layer.
pub fn stat_path(path: &str) -> Result<Dirent, FsError> {
    let (anchor, remainder) = {
        let guard = VFS.read();
        let tree = guard.as_ref().ok_or(FsError::NotFound)?;
        tree.walk_partial(path)
            .map(|(idx, rem)| (tree.get_dirent_at(idx), rem))
            .ok_or(FsError::NotFound)?
    };
    let anchor = anchor.ok_or(FsError::NotFound)?;
    if remainder.is_empty() {
        return Ok(anchor);
    }
    anchor.stat(&remainder)
}

/// Read `n` bytes at `pos` from the file at `path`.
pub fn read_path(path: &str, pos: u64, n: u64) -> Result<alloc::vec::Vec<u8>, FsError> {
    let dirent = stat_path(path)?;
    if !dirent.is_file() {
        return Err(FsError::NotFile);
    }
    dirent.read(pos, n)
}

impl VfsTree {
    fn get_dirent_at(&self, idx: usize) -> Option<Dirent> {
        let obj = self.arena[idx].obj.as_ref()?;
        if obj.type_id != TypeId::of::<Dirent>() {
            return None;
        }
        // SAFETY: type verified; Dirent is Clone so hand out a copy.
        let dirent = unsafe { &*(obj.ptr as *const Dirent) };
        Some(dirent.clone())
    }
}

/// Reset the kernel tree (test teardown).
pub fn reset_for_tests() {
    *VFS.write() = Some(VfsTree::new());
}

//! Tree node types.

use crate::devices::DeviceId;

/// Index of an entry within a [`Tree`](crate::Tree) arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId(pub(crate) u32);

impl EntryId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Extended metadata, captured when a scan runs with `extended` enabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ext {
    /// Modification time, unix seconds.
    pub mtime: u64,
    /// Owning user id.
    pub uid: u32,
    /// Owning group id.
    pub gid: u32,
    /// Permission bits.
    pub mode: u16,
}

/// Directory payload: child list, aggregate totals, error state.
#[derive(Debug, Clone)]
pub struct DirNode {
    /// Head of the child list (insertion order, newest first).
    pub first_child: Option<EntryId>,
    /// Back-reference for ancestor walks; `None` only on the root.
    pub parent: Option<EntryId>,
    /// Total apparent size of hard links whose peers live outside this dir.
    pub shared_size: u64,
    /// Total blocks of hard links whose peers live outside this dir.
    pub shared_blocks: u64,
    /// Number of descendants, saturating.
    pub items: u32,
    /// Dense device id of the filesystem this directory lives on.
    pub dev: DeviceId,
    /// Listing this directory failed.
    pub err: bool,
    /// Some descendant has an error.
    pub suberr: bool,
}

/// Hard link payload: a file with `nlink >= 2`.
#[derive(Debug, Clone, Copy)]
pub struct LinkNode {
    /// Inode number on the parent directory's device.
    pub ino: u64,
    /// Reported link count; 0 means unknown and deferred until finalize.
    pub nlink: u32,
}

/// Leaf payload: regular files, special files, and excluded/unreadable
/// entries.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileNode {
    /// stat or opendir failed on this entry.
    pub err: bool,
    /// Matched an exclude pattern or CACHEDIR.TAG.
    pub excluded: bool,
    /// Lives on a different filesystem than its parent.
    pub other_fs: bool,
    /// Lives on a kernel pseudo-filesystem.
    pub kernfs: bool,
    /// Not a regular file (socket, device, fifo, symlink).
    pub notreg: bool,
}

/// Kind tag plus kind-specific fields.
#[derive(Debug, Clone)]
pub enum EntryKind {
    Dir(DirNode),
    Link(LinkNode),
    File(FileNode),
}

/// A single node in the tree.
///
/// Names are raw bytes: the OS may hand us non-UTF-8 names and the dump
/// format round-trips them verbatim, so the model never validates them as
/// text. Lossy repair is a display-layer concern.
#[derive(Debug, Clone)]
pub struct Entry {
    name: Box<[u8]>,
    /// Apparent size in bytes, saturating.
    pub size: u64,
    /// 512-byte block count, saturating at [`MAX_BLOCKS`](crate::util::MAX_BLOCKS).
    pub blocks: u64,
    /// Whether this entry's contribution is reflected in its ancestors.
    pub counted: bool,
    /// Next child of the same parent.
    pub next_sibling: Option<EntryId>,
    /// Extended metadata, if captured.
    pub ext: Option<Ext>,
    pub kind: EntryKind,
}

impl Entry {
    pub(crate) fn new(kind: EntryKind, name: &[u8], ext: Option<Ext>) -> Self {
        Self {
            name: name.into(),
            size: 0,
            blocks: 0,
            counted: false,
            next_sibling: None,
            ext,
            kind,
        }
    }

    /// Raw name bytes, without any terminator.
    pub fn name(&self) -> &[u8] {
        &self.name
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, EntryKind::Dir(_))
    }

    pub fn is_link(&self) -> bool {
        matches!(self.kind, EntryKind::Link(_))
    }

    pub fn as_dir(&self) -> Option<&DirNode> {
        match &self.kind {
            EntryKind::Dir(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_dir_mut(&mut self) -> Option<&mut DirNode> {
        match &mut self.kind {
            EntryKind::Dir(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_link(&self) -> Option<&LinkNode> {
        match &self.kind {
            EntryKind::Link(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_file(&self) -> Option<&FileNode> {
        match &self.kind {
            EntryKind::File(f) => Some(f),
            _ => None,
        }
    }

    /// Whether this entry (or, for dirs, its listing) failed to read.
    pub fn has_err(&self) -> bool {
        match &self.kind {
            EntryKind::Dir(d) => d.err,
            EntryKind::File(f) => f.err,
            EntryKind::Link(_) => false,
        }
    }
}

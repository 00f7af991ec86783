//! Memory sink: builds a [`Tree`] from the sink event stream.

use crate::entry::{DirNode, EntryId, EntryKind, FileNode, LinkNode};
use crate::sink::{Sink, Special, Stat};
use crate::tree::Tree;
use crate::util::MAX_BLOCKS;

/// Builds the in-memory tree from scanner or importer events.
///
/// Hard links arriving with `nlink == 0` are tallied in the tree's link
/// count buffer and accounted when [`TreeBuilder::finish`] runs.
#[derive(Debug, Default)]
pub struct TreeBuilder {
    tree: Tree,
    stack: Vec<EntryId>,
    pending_name: Vec<u8>,
    last_dir: Option<EntryId>,
    extended: bool,
}

impl TreeBuilder {
    pub fn new(extended: bool) -> Self {
        Self {
            extended,
            ..Self::default()
        }
    }

    /// The tree built so far. Consistent at any point between elements.
    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// Finalize deferred link counts and hand over the tree.
    pub fn finish(mut self) -> Tree {
        self.tree.finalize_link_counts();
        self.tree
    }

    fn parent(&self) -> Option<EntryId> {
        self.stack.last().copied()
    }

    fn place(&mut self, id: EntryId) {
        match self.parent() {
            Some(parent) => self.tree.insert(id, parent),
            None => {
                // The root carries no ancestors to account against.
                self.tree.entry_mut(id).counted = true;
                self.tree.set_root(id);
            }
        }
    }
}

impl Sink for TreeBuilder {
    fn push_name(&mut self, name: &[u8]) {
        self.pending_name.clear();
        self.pending_name.extend_from_slice(name);
    }

    fn set_stat(&mut self, stat: &Stat) {
        let kind = if stat.is_dir {
            let dev = self.tree.devices_mut().id(stat.dev);
            EntryKind::Dir(DirNode::new(dev))
        } else if stat.hlinkc {
            EntryKind::Link(LinkNode {
                ino: stat.ino,
                nlink: stat.nlink,
            })
        } else {
            EntryKind::File(FileNode {
                notreg: !stat.is_reg,
                ..FileNode::default()
            })
        };

        let ext = if self.extended { stat.ext } else { None };
        let name = std::mem::take(&mut self.pending_name);
        let id = self.tree.create(kind, &name, ext);
        self.pending_name = name;
        {
            let e = self.tree.entry_mut(id);
            e.size = stat.size;
            e.blocks = stat.blocks.min(MAX_BLOCKS);
        }
        self.place(id);
        if stat.is_dir {
            self.last_dir = Some(id);
        }
    }

    fn set_special(&mut self, special: Special) {
        let flags = match special {
            Special::Err => FileNode {
                err: true,
                ..FileNode::default()
            },
            Special::OtherFs => FileNode {
                other_fs: true,
                ..FileNode::default()
            },
            Special::KernFs => FileNode {
                kernfs: true,
                ..FileNode::default()
            },
            Special::Excluded => FileNode {
                excluded: true,
                ..FileNode::default()
            },
        };
        let name = std::mem::take(&mut self.pending_name);
        let id = self.tree.create(EntryKind::File(flags), &name, None);
        self.pending_name = name;
        self.place(id);
        if special == Special::Err {
            let parent = self.parent();
            self.tree.set_err(id, parent);
        }
    }

    fn enter_dir(&mut self) {
        if let Some(dir) = self.last_dir.take() {
            self.stack.push(dir);
        }
    }

    fn leave_dir(&mut self) {
        self.stack.pop();
    }

    fn listing_error(&mut self) {
        if let Some(dir) = self.parent() {
            let parent = self.tree.entry(dir).as_dir().and_then(|d| d.parent);
            self.tree.set_err(dir, parent);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dir_stat(dev: u64) -> Stat {
        Stat {
            is_dir: true,
            dev,
            ..Stat::default()
        }
    }

    fn file_stat(size: u64, blocks: u64) -> Stat {
        Stat {
            is_reg: true,
            size,
            blocks,
            ..Stat::default()
        }
    }

    #[test]
    fn test_builds_nested_tree() {
        let mut b = TreeBuilder::new(false);
        b.push_name(b"/tmp/x");
        b.set_stat(&dir_stat(1));
        b.enter_dir();
        b.push_name(b"sub");
        b.set_stat(&dir_stat(1));
        b.enter_dir();
        b.push_name(b"f");
        b.set_stat(&file_stat(4096, 8));
        b.leave_dir();
        b.leave_dir();

        let t = b.finish();
        let root = t.root().unwrap();
        assert_eq!(t.entry(root).name(), b"/tmp/x");
        assert_eq!(t.entry(root).size, 4096);
        assert_eq!(t.entry(root).blocks, 8);
        assert_eq!(t.entry(root).as_dir().unwrap().items, 2);

        let sub = t.child_named(root, b"sub").unwrap();
        let f = t.child_named(sub, b"f").unwrap();
        assert_eq!(t.entry(f).size, 4096);
        assert!(t.entry(f).counted);
    }

    #[test]
    fn test_special_err_sets_suberr() {
        let mut b = TreeBuilder::new(false);
        b.push_name(b"/");
        b.set_stat(&dir_stat(1));
        b.enter_dir();
        b.push_name(b"broken");
        b.set_special(Special::Err);
        b.leave_dir();

        let t = b.finish();
        let root = t.root().unwrap();
        assert!(t.entry(root).as_dir().unwrap().suberr);
        let broken = t.child_named(root, b"broken").unwrap();
        assert!(t.entry(broken).has_err());
        assert_eq!(t.entry(root).as_dir().unwrap().items, 1);
    }

    #[test]
    fn test_listing_error_marks_open_dir() {
        let mut b = TreeBuilder::new(false);
        b.push_name(b"/");
        b.set_stat(&dir_stat(1));
        b.enter_dir();
        b.push_name(b"d");
        b.set_stat(&dir_stat(1));
        b.enter_dir();
        b.listing_error();
        b.leave_dir();
        b.leave_dir();

        let t = b.finish();
        let root = t.root().unwrap();
        let d = t.child_named(root, b"d").unwrap();
        assert!(t.entry(d).as_dir().unwrap().err);
        assert!(t.entry(root).as_dir().unwrap().suberr);
        assert!(!t.entry(root).as_dir().unwrap().err);
    }

    #[test]
    fn test_extended_metadata_gated_by_flag() {
        use crate::entry::Ext;

        let ext = Ext {
            mtime: 7,
            uid: 1000,
            gid: 1000,
            mode: 0o644,
        };
        let stat = Stat {
            is_reg: true,
            ext: Some(ext),
            ..Stat::default()
        };

        for (enabled, expect) in [(true, Some(ext)), (false, None)] {
            let mut b = TreeBuilder::new(enabled);
            b.push_name(b"/");
            b.set_stat(&Stat {
                is_dir: true,
                dev: 1,
                ext: Some(ext),
                ..Stat::default()
            });
            b.enter_dir();
            b.push_name(b"f");
            b.set_stat(&stat);
            b.leave_dir();

            let t = b.finish();
            let f = t.child_named(t.root().unwrap(), b"f").unwrap();
            assert_eq!(t.entry(f).ext, expect);
        }
    }

    #[test]
    fn test_hardlink_kind_selection() {
        let mut b = TreeBuilder::new(false);
        b.push_name(b"/");
        b.set_stat(&dir_stat(1));
        b.enter_dir();
        b.push_name(b"hl");
        b.set_stat(&Stat {
            is_reg: true,
            hlinkc: true,
            ino: 9,
            nlink: 2,
            size: 10,
            blocks: 1,
            ..Stat::default()
        });
        b.push_name(b"sock");
        b.set_stat(&Stat {
            is_reg: false,
            ..Stat::default()
        });
        b.leave_dir();

        let t = b.finish();
        let root = t.root().unwrap();
        let hl = t.child_named(root, b"hl").unwrap();
        assert!(t.entry(hl).is_link());
        let sock = t.child_named(root, b"sock").unwrap();
        assert!(t.entry(sock).as_file().unwrap().notreg);
    }
}

//! The in-memory tree: arena storage and aggregate accounting.

use crate::devices::{DeviceId, DeviceTable, LinkCountBuffer};
use crate::entry::{DirNode, Entry, EntryId, EntryKind};
use crate::util::{add_blocks, sub_blocks};

impl DirNode {
    pub fn new(dev: DeviceId) -> Self {
        Self {
            first_child: None,
            parent: None,
            shared_size: 0,
            shared_blocks: 0,
            items: 0,
            dev,
            err: false,
            suberr: false,
        }
    }
}

/// Owns the entry arena, the device table, and the deferred link counts.
///
/// Entries are allocated monotonically; removal unlinks a node and drops
/// its contribution from the aggregates, but the arena slot is never
/// reclaimed until the tree itself is dropped.
#[derive(Debug, Default)]
pub struct Tree {
    entries: Vec<Entry>,
    root: Option<EntryId>,
    devices: DeviceTable,
    link_counts: LinkCountBuffer,
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an entry with zeroed totals and a copy of `name`.
    pub fn create(
        &mut self,
        kind: EntryKind,
        name: &[u8],
        ext: Option<crate::entry::Ext>,
    ) -> EntryId {
        assert!(self.entries.len() < u32::MAX as usize, "entry arena exhausted");
        let id = EntryId(self.entries.len() as u32);
        self.entries.push(Entry::new(kind, name, ext));
        id
    }

    pub fn root(&self) -> Option<EntryId> {
        self.root
    }

    pub fn set_root(&mut self, id: EntryId) {
        self.root = Some(id);
    }

    pub fn entry(&self, id: EntryId) -> &Entry {
        &self.entries[id.index()]
    }

    pub(crate) fn entry_mut(&mut self, id: EntryId) -> &mut Entry {
        &mut self.entries[id.index()]
    }

    /// Number of arena slots in use, including unlinked ones.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn devices(&self) -> &DeviceTable {
        &self.devices
    }

    pub(crate) fn devices_mut(&mut self) -> &mut DeviceTable {
        &mut self.devices
    }

    /// Iterate the children of a directory in list order (reverse of
    /// insertion; the browse layer applies its own sort).
    pub fn children(&self, dir: EntryId) -> Children<'_> {
        Children {
            tree: self,
            next: self.dir(dir).first_child,
        }
    }

    /// Find a direct child by raw name.
    pub fn child_named(&self, dir: EntryId, name: &[u8]) -> Option<EntryId> {
        self.children(dir).find(|&c| self.entry(c).name() == name)
    }

    fn dir(&self, id: EntryId) -> &DirNode {
        match &self.entries[id.index()].kind {
            EntryKind::Dir(d) => d,
            _ => unreachable!("ancestor chain left the directory tree"),
        }
    }

    fn dir_mut(&mut self, id: EntryId) -> &mut DirNode {
        match &mut self.entries[id.index()].kind {
            EntryKind::Dir(d) => d,
            _ => unreachable!("ancestor chain left the directory tree"),
        }
    }

    /// Prepend `entry` to `parent`'s child list and account its totals.
    ///
    /// Hard links whose `nlink` is still unknown (0) are linked into place
    /// but left uncounted; [`Tree::finalize_link_counts`] replays them once
    /// the tallies are complete.
    pub fn insert(&mut self, entry: EntryId, parent: EntryId) {
        debug_assert!(
            self.entries[entry.index()]
                .as_dir()
                .is_none_or(|d| d.first_child.is_none()),
            "inserted dir must be empty"
        );
        let old_first = self.dir(parent).first_child;
        self.entries[entry.index()].next_sibling = old_first;
        self.dir_mut(parent).first_child = Some(entry);
        if let Some(d) = self.entries[entry.index()].as_dir_mut() {
            d.parent = Some(parent);
        }

        if let Some(l) = self.entries[entry.index()].as_link() {
            if l.nlink == 0 {
                let (ino, dev) = (l.ino, self.dir(parent).dev);
                self.link_counts.add(dev, ino);
                return;
            }
        }
        self.add_stats(entry, parent);
    }

    /// Walk the ancestor chain from `parent` to the root, adding `entry`'s
    /// contribution to every level. Idempotent via the `counted` flag.
    pub fn add_stats(&mut self, entry: EntryId, parent: EntryId) {
        if self.entries[entry.index()].counted {
            return;
        }
        self.entries[entry.index()].counted = true;

        let (size, blocks, mtime, link) = {
            let e = &self.entries[entry.index()];
            (
                e.size,
                e.blocks,
                e.ext.map(|x| x.mtime),
                e.as_link().map(|l| (l.ino, l.nlink)),
            )
        };
        let dir_dev = self.dir(parent).dev;

        // Whether the bottom-most same-device dir saw this inode for the
        // first time; ancestors on other devices count the link iff so.
        let mut new_hl = false;

        let mut cursor = Some(parent);
        while let Some(pid) = cursor {
            let p_dev;
            {
                let p = self.dir_mut(pid);
                p.items = p.items.saturating_add(1);
                p_dev = p.dev;
                cursor = p.parent;
            }
            if let (Some(m), Some(pext)) = (mtime, self.entries[pid.index()].ext.as_mut()) {
                if m > pext.mtime {
                    pext.mtime = m;
                }
            }

            let add_total;
            if let Some((ino, nlink)) = link {
                if p_dev != dir_dev {
                    add_total = new_hl;
                } else {
                    let (count, fresh) = self.devices.add_hardlink(dir_dev, ino, pid);
                    let p = self.dir_mut(pid);
                    if fresh {
                        new_hl = true;
                        p.shared_size = p.shared_size.saturating_add(size);
                        p.shared_blocks = add_blocks(p.shared_blocks, blocks);
                        add_total = true;
                    } else {
                        // All links now inside this dir; nothing is shared
                        // out anymore.
                        if nlink > 0 && count == nlink {
                            p.shared_size = p.shared_size.saturating_sub(size);
                            p.shared_blocks = sub_blocks(p.shared_blocks, blocks);
                        }
                        add_total = false;
                    }
                }
            } else {
                add_total = true;
            }

            if add_total {
                let e = &mut self.entries[pid.index()];
                e.size = e.size.saturating_add(size);
                e.blocks = add_blocks(e.blocks, blocks);
            }
        }
    }

    /// Mirror of [`Tree::add_stats`], with two deliberate limitations:
    /// `shared_*` on ancestors is not corrected (restoring it requires a
    /// rescan), and saturation during the original addition may leave
    /// totals too low afterwards. Ancestor mtimes are preserved.
    pub fn del_stats(&mut self, entry: EntryId, parent: EntryId) {
        if !self.entries[entry.index()].counted {
            return;
        }
        self.entries[entry.index()].counted = false;

        let (size, blocks, link) = {
            let e = &self.entries[entry.index()];
            (e.size, e.blocks, e.as_link().map(|l| l.ino))
        };
        let dir_dev = self.dir(parent).dev;
        let mut del_hl = false;

        let mut cursor = Some(parent);
        while let Some(pid) = cursor {
            let p_dev;
            {
                let p = self.dir_mut(pid);
                p.items = p.items.saturating_sub(1);
                p_dev = p.dev;
                cursor = p.parent;
            }

            let del_total;
            if let Some(ino) = link {
                if p_dev != dir_dev {
                    del_total = del_hl;
                } else {
                    let evicted = self.devices.del_hardlink(dir_dev, ino, pid);
                    if evicted {
                        del_hl = true;
                    }
                    del_total = evicted;
                }
            } else {
                del_total = true;
            }

            if del_total {
                let e = &mut self.entries[pid.index()];
                e.size = e.size.saturating_sub(size);
                e.blocks = sub_blocks(e.blocks, blocks);
            }
        }
    }

    /// Post-order [`Tree::del_stats`]: children are un-counted before the
    /// node itself.
    pub fn del_stats_rec(&mut self, entry: EntryId, parent: EntryId) {
        if self.entries[entry.index()].is_dir() {
            let children: Vec<EntryId> = self.children(entry).collect();
            for child in children {
                self.del_stats_rec(child, entry);
            }
        }
        self.del_stats(entry, parent);
    }

    /// Un-count a subtree and unlink it from its parent's child list.
    pub fn remove(&mut self, entry: EntryId, parent: EntryId) {
        self.del_stats_rec(entry, parent);

        let next = self.entries[entry.index()].next_sibling;
        if self.dir(parent).first_child == Some(entry) {
            self.dir_mut(parent).first_child = next;
        } else {
            let mut cursor = self.dir(parent).first_child;
            while let Some(sib) = cursor {
                if self.entries[sib.index()].next_sibling == Some(entry) {
                    self.entries[sib.index()].next_sibling = next;
                    break;
                }
                cursor = self.entries[sib.index()].next_sibling;
            }
        }
        self.entries[entry.index()].next_sibling = None;
    }

    /// Flag `entry` as unreadable and mark `suberr` on its ancestors, up to
    /// but not past the first ancestor already marked.
    pub fn set_err(&mut self, entry: EntryId, parent: Option<EntryId>) {
        match &mut self.entries[entry.index()].kind {
            EntryKind::Dir(d) => d.err = true,
            EntryKind::File(f) => f.err = true,
            EntryKind::Link(_) => {}
        }
        let mut cursor = parent;
        while let Some(pid) = cursor {
            let p = self.dir_mut(pid);
            if p.suberr {
                break;
            }
            p.suberr = true;
            cursor = p.parent;
        }
    }

    /// Resolve hard links whose `nlink` was unknown at insertion: write the
    /// tallied occurrence count into each deferred Link and replay its
    /// stat addition.
    pub fn finalize_link_counts(&mut self) {
        if self.link_counts.is_empty() {
            return;
        }
        let counts = std::mem::take(&mut self.link_counts);
        let Some(root) = self.root else { return };

        let mut stack = vec![root];
        while let Some(dir_id) = stack.pop() {
            let dir_dev = self.dir(dir_id).dev;
            let mut child = self.dir(dir_id).first_child;
            while let Some(cid) = child {
                child = self.entries[cid.index()].next_sibling;
                match &mut self.entries[cid.index()].kind {
                    EntryKind::Dir(_) => stack.push(cid),
                    EntryKind::Link(l) if l.nlink == 0 => {
                        l.nlink = counts.get(dir_dev, l.ino);
                        self.add_stats(cid, dir_id);
                    }
                    _ => {}
                }
            }
        }
    }

}

/// Iterator over a directory's direct children.
pub struct Children<'a> {
    tree: &'a Tree,
    next: Option<EntryId>,
}

impl Iterator for Children<'_> {
    type Item = EntryId;

    fn next(&mut self) -> Option<EntryId> {
        let id = self.next?;
        self.next = self.tree.entry(id).next_sibling;
        Some(id)
    }
}

impl std::ops::Index<EntryId> for Tree {
    type Output = Entry;

    fn index(&self, id: EntryId) -> &Entry {
        self.entry(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{FileNode, LinkNode};

    fn new_tree_with_root() -> (Tree, EntryId) {
        let mut t = Tree::new();
        let dev = t.devices_mut().id(1);
        let root = t.create(EntryKind::Dir(DirNode::new(dev)), b"/", None);
        t.set_root(root);
        (t, root)
    }

    fn add_file(t: &mut Tree, parent: EntryId, name: &[u8], size: u64, blocks: u64) -> EntryId {
        let id = t.create(EntryKind::File(FileNode::default()), name, None);
        t.entry_mut(id).size = size;
        t.entry_mut(id).blocks = blocks;
        t.insert(id, parent);
        id
    }

    fn add_dir(t: &mut Tree, parent: EntryId, name: &[u8]) -> EntryId {
        let dev = t.dir(parent).dev;
        let id = t.create(EntryKind::Dir(DirNode::new(dev)), name, None);
        t.insert(id, parent);
        id
    }

    fn add_link(
        t: &mut Tree,
        parent: EntryId,
        name: &[u8],
        ino: u64,
        nlink: u32,
        size: u64,
        blocks: u64,
    ) -> EntryId {
        let id = t.create(EntryKind::Link(LinkNode { ino, nlink }), name, None);
        t.entry_mut(id).size = size;
        t.entry_mut(id).blocks = blocks;
        t.insert(id, parent);
        id
    }

    #[test]
    fn test_insert_prepends_and_aggregates() {
        let (mut t, root) = new_tree_with_root();
        add_file(&mut t, root, b"a", 100, 1);
        add_file(&mut t, root, b"b", 200, 2);

        let names: Vec<&[u8]> = t.children(root).map(|c| t.entry(c).name()).collect();
        assert_eq!(names, vec![b"b" as &[u8], b"a"]);

        let r = t.entry(root);
        assert_eq!(r.size, 300);
        assert_eq!(r.blocks, 3);
        assert_eq!(r.as_dir().unwrap().items, 2);
    }

    #[test]
    fn test_add_stats_is_idempotent() {
        let (mut t, root) = new_tree_with_root();
        let f = add_file(&mut t, root, b"a", 100, 1);
        t.add_stats(f, root);
        t.add_stats(f, root);
        assert_eq!(t.entry(root).size, 100);
        assert_eq!(t.entry(root).as_dir().unwrap().items, 1);
    }

    #[test]
    fn test_del_stats_restores_totals() {
        let (mut t, root) = new_tree_with_root();
        let d = add_dir(&mut t, root, b"d");
        let f = add_file(&mut t, d, b"f", 4096, 8);
        assert_eq!(t.entry(root).size, 4096);

        t.del_stats(f, d);
        assert_eq!(t.entry(root).size, 0);
        assert_eq!(t.entry(d).size, 0);
        assert_eq!(t.entry(root).as_dir().unwrap().items, 1);
        assert!(!t.entry(f).counted);

        // Deleting twice is a no-op.
        t.del_stats(f, d);
        assert_eq!(t.entry(root).as_dir().unwrap().items, 1);
    }

    #[test]
    fn test_hardlink_counted_once_per_ancestor() {
        let (mut t, root) = new_tree_with_root();
        let d1 = add_dir(&mut t, root, b"d1");
        let d2 = add_dir(&mut t, root, b"d2");
        add_link(&mut t, d1, b"a", 42, 2, 100, 1);
        add_link(&mut t, d2, b"b", 42, 2, 100, 1);

        // Both occurrences inside root: counted once, nothing shared out.
        let r = t.entry(root);
        assert_eq!(r.size, 100);
        assert_eq!(r.blocks, 1);
        assert_eq!(r.as_dir().unwrap().shared_size, 0);
        assert_eq!(r.as_dir().unwrap().shared_blocks, 0);

        // Each subdir holds one of two links: fully shared out.
        for d in [d1, d2] {
            let e = t.entry(d);
            assert_eq!(e.size, 100);
            assert_eq!(e.as_dir().unwrap().shared_size, 100);
            assert_eq!(e.as_dir().unwrap().shared_blocks, 1);
        }
    }

    #[test]
    fn test_hardlink_peer_outside_stays_shared() {
        let (mut t, root) = new_tree_with_root();
        // Only one of nlink=2 occurrences is in the tree.
        add_link(&mut t, root, b"a", 42, 2, 100, 1);

        let r = t.entry(root);
        assert_eq!(r.size, 100);
        assert_eq!(r.as_dir().unwrap().shared_size, 100);
        assert_eq!(r.as_dir().unwrap().shared_blocks, 1);
    }

    #[test]
    fn test_hardlink_same_dir_twice() {
        let (mut t, root) = new_tree_with_root();
        add_link(&mut t, root, b"a", 42, 2, 100, 1);
        add_link(&mut t, root, b"b", 42, 2, 100, 1);

        let r = t.entry(root);
        assert_eq!(r.size, 100);
        assert_eq!(r.blocks, 1);
        assert_eq!(r.as_dir().unwrap().shared_size, 0);
        assert_eq!(r.as_dir().unwrap().items, 2);
    }

    #[test]
    fn test_hardlink_del_stats() {
        let (mut t, root) = new_tree_with_root();
        let a = add_link(&mut t, root, b"a", 42, 2, 100, 1);
        let b = add_link(&mut t, root, b"b", 42, 2, 100, 1);

        t.del_stats(a, root);
        // One occurrence remains; totals keep the single count.
        assert_eq!(t.entry(root).size, 100);
        t.del_stats(b, root);
        assert_eq!(t.entry(root).size, 0);
        assert_eq!(t.entry(root).as_dir().unwrap().items, 0);
    }

    #[test]
    fn test_link_crossing_device() {
        let mut t = Tree::new();
        let dev_a = t.devices_mut().id(1);
        let dev_b = t.devices_mut().id(2);
        let root = t.create(EntryKind::Dir(DirNode::new(dev_a)), b"/", None);
        t.set_root(root);
        let mnt = t.create(EntryKind::Dir(DirNode::new(dev_b)), b"mnt", None);
        t.insert(mnt, root);

        // First sighting below the mount: counted in root too.
        add_link(&mut t, mnt, b"a", 42, 3, 100, 1);
        assert_eq!(t.entry(root).size, 100);

        // Second sighting of the same inode: not recounted anywhere.
        add_link(&mut t, mnt, b"b", 42, 3, 100, 1);
        assert_eq!(t.entry(root).size, 100);
        assert_eq!(t.entry(mnt).size, 100);
        assert_eq!(t.entry(root).as_dir().unwrap().items, 3);
    }

    #[test]
    fn test_mtime_propagates_to_ancestors() {
        use crate::entry::Ext;

        let mut t = Tree::new();
        let dev = t.devices_mut().id(1);
        let root = t.create(
            EntryKind::Dir(DirNode::new(dev)),
            b"/",
            Some(Ext { mtime: 10, ..Ext::default() }),
        );
        t.set_root(root);

        let f = t.create(
            EntryKind::File(FileNode::default()),
            b"f",
            Some(Ext { mtime: 99, ..Ext::default() }),
        );
        t.insert(f, root);
        assert_eq!(t.entry(root).ext.unwrap().mtime, 99);

        // Older child does not regress the ancestor mtime.
        let g = t.create(
            EntryKind::File(FileNode::default()),
            b"g",
            Some(Ext { mtime: 5, ..Ext::default() }),
        );
        t.insert(g, root);
        assert_eq!(t.entry(root).ext.unwrap().mtime, 99);
    }

    #[test]
    fn test_set_err_marks_ancestors() {
        let (mut t, root) = new_tree_with_root();
        let d1 = add_dir(&mut t, root, b"d1");
        let d2 = add_dir(&mut t, d1, b"d2");
        let f = add_file(&mut t, d2, b"f", 0, 0);

        t.set_err(f, Some(d2));
        assert!(t.entry(f).has_err());
        assert!(t.entry(d2).as_dir().unwrap().suberr);
        assert!(t.entry(d1).as_dir().unwrap().suberr);
        assert!(t.entry(root).as_dir().unwrap().suberr);
    }

    #[test]
    fn test_deferred_link_finalize() {
        let (mut t, root) = new_tree_with_root();
        // Two occurrences with unknown nlink: uncounted until finalize.
        add_link(&mut t, root, b"a", 42, 0, 100, 1);
        add_link(&mut t, root, b"b", 42, 0, 100, 1);
        assert_eq!(t.entry(root).size, 0);

        t.finalize_link_counts();
        let r = t.entry(root);
        assert_eq!(r.size, 100);
        assert_eq!(r.blocks, 1);
        assert_eq!(r.as_dir().unwrap().shared_size, 0);
        let a = t.child_named(root, b"a").unwrap();
        assert_eq!(t.entry(a).as_link().unwrap().nlink, 2);
    }

    #[test]
    fn test_remove_unlinks_subtree() {
        let (mut t, root) = new_tree_with_root();
        let d = add_dir(&mut t, root, b"d");
        add_file(&mut t, d, b"f", 100, 1);
        add_file(&mut t, root, b"g", 50, 1);

        t.remove(d, root);
        assert_eq!(t.entry(root).size, 50);
        assert_eq!(t.entry(root).as_dir().unwrap().items, 1);
        assert!(t.child_named(root, b"d").is_none());
        assert!(t.child_named(root, b"g").is_some());
    }

    #[test]
    fn test_saturating_aggregates() {
        let (mut t, root) = new_tree_with_root();
        add_file(&mut t, root, b"a", u64::MAX, crate::util::MAX_BLOCKS);
        add_file(&mut t, root, b"b", 1, 1);

        let r = t.entry(root);
        assert_eq!(r.size, u64::MAX);
        assert_eq!(r.blocks, crate::util::MAX_BLOCKS);
    }
}

//! Block-addressed B-tree directory.
//!
//! Page 0 is the header: `{root_page, start_free_page, num_free_page}` as
//! little-endian u32s, zero-padded to the page size. Every other page is
//! either a tree node (flag 1) or a free-list cell (flag 0). Free cells form
//! a doubly linked list rooted at `start_free_page`.
//!
//! Node mutations happen purely in the cache and reach disk on [`flush`];
//! free-list cells and stream resizes are written eagerly because each is a
//! single self-contained page state.
//!
//! [`flush`]: BtreeDirectory::flush

use std::collections::HashMap;

use tracing::{debug, instrument, trace, warn};

use super::{
    corrupted, DirEntry, DirStats, DirectoryError, FileId, BLOCK_SIZE, BTREE_MAX_DEPTH,
    DEFAULT_MAX_ENTRIES, INVALID_PAGE, MAX_FILENAME_LENGTH,
};
use crate::stream::{BlockPagedStream, ByteStream, StreamError};

const NODE_FLAG_FREE: u32 = 0;
const NODE_FLAG_TREE: u32 = 1;
const NAME_SLOT: usize = MAX_FILENAME_LENGTH + 1;
const ENTRY_SLOT: usize = NAME_SLOT + 32 + 4;

/// Bounds-checked little-endian reader over a page buffer.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], DirectoryError> {
        if self.buf.len() < n {
            return Err(corrupted("node data extends past the page"));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u16(&mut self) -> Result<u16, DirectoryError> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, DirectoryError> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

#[derive(Debug)]
struct BtreeNode {
    page: u32,
    parent: u32,
    children: Vec<u32>,
    entries: Vec<DirEntry>,
    dirty: bool,
}

impl BtreeNode {
    fn new(parent: u32, page: u32) -> Self {
        BtreeNode {
            page,
            parent,
            children: Vec::new(),
            entries: Vec::new(),
            dirty: false,
        }
    }

    fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    fn from_page(parent: u32, page: u32, buf: &[u8]) -> Result<Self, DirectoryError> {
        let mut node = BtreeNode::new(parent, page);
        let mut r = Reader::new(buf);
        let flag = r.u32()?;
        if flag == NODE_FLAG_FREE {
            // Freshly allocated or recycled page: an empty node.
            return Ok(node);
        }
        if flag != NODE_FLAG_TREE {
            return Err(corrupted("unexpected node flag"));
        }
        let child_count = r.u16()? as usize;
        let entry_count = r.u16()? as usize;
        if child_count != 0 && child_count != entry_count + 1 {
            return Err(corrupted("child/entry count mismatch"));
        }
        for _ in 0..child_count {
            node.children.push(r.u32()?);
        }
        for _ in 0..entry_count {
            let name_slot = r.bytes(NAME_SLOT)?;
            let id_bytes = r.bytes(32)?;
            let kind = r.u32()?;

            let name_len = name_slot
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(MAX_FILENAME_LENGTH);
            let name = std::str::from_utf8(&name_slot[..name_len])
                .map_err(|_| corrupted("entry name is not valid UTF-8"))?
                .to_owned();
            let mut id: FileId = [0u8; 32];
            id.copy_from_slice(id_bytes);
            node.entries.push(DirEntry { name, id, kind });
        }
        Ok(node)
    }

    fn to_page(&self, buf: &mut [u8]) -> Result<(), DirectoryError> {
        buf.fill(0);
        let needed = 8 + 4 * self.children.len() + ENTRY_SLOT * self.entries.len();
        if needed > buf.len() {
            return Err(corrupted("node does not fit in a page"));
        }
        buf[0..4].copy_from_slice(&NODE_FLAG_TREE.to_le_bytes());
        buf[4..6].copy_from_slice(&(self.children.len() as u16).to_le_bytes());
        buf[6..8].copy_from_slice(&(self.entries.len() as u16).to_le_bytes());
        let mut at = 8;
        for &child in &self.children {
            buf[at..at + 4].copy_from_slice(&child.to_le_bytes());
            at += 4;
        }
        for entry in &self.entries {
            let name = entry.name.as_bytes();
            if name.len() > MAX_FILENAME_LENGTH {
                return Err(DirectoryError::NameTooLong { length: name.len() });
            }
            buf[at..at + name.len()].copy_from_slice(name);
            at += NAME_SLOT;
            buf[at..at + 32].copy_from_slice(&entry.id);
            at += 32;
            buf[at..at + 4].copy_from_slice(&entry.kind.to_le_bytes());
            at += 4;
        }
        Ok(())
    }
}

struct FreePage {
    next: u32,
    prev: u32,
}

struct FindResult {
    page: u32,
    index: usize,
    exact: bool,
}

/// Persistent sorted `filename -> (id, kind)` map over a paged stream.
///
/// `&mut self` on every operation *is* the per-directory exclusive lock of
/// the concurrency model: Rust's borrow rules make concurrent mutation
/// impossible, and hosts that share a directory across threads wrap it in a
/// mutex.
pub struct BtreeDirectory<S: ByteStream> {
    stream: BlockPagedStream<S>,
    cache: HashMap<u32, BtreeNode>,
    root_page: u32,
    start_free_page: u32,
    num_free_page: u32,
    header_dirty: bool,
    max_entries: usize,
}

impl<S: ByteStream> BtreeDirectory<S> {
    /// Open a directory over `base`, initializing the header page if the
    /// stream is empty.
    pub fn open(base: S) -> Result<Self, DirectoryError> {
        Self::open_with_max_entries(base, DEFAULT_MAX_ENTRIES)
    }

    /// Open with a non-default node fan-out. The fan-out is pinned by the
    /// on-disk format; this constructor exists for small-geometry tests and
    /// format experiments.
    pub fn open_with_max_entries(base: S, max_entries: usize) -> Result<Self, DirectoryError> {
        if !(2..=DEFAULT_MAX_ENTRIES).contains(&max_entries) {
            return Err(DirectoryError::Stream(StreamError::InvalidParams {
                reason: format!("max_entries {max_entries} outside 2..={DEFAULT_MAX_ENTRIES}"),
            }));
        }
        let mut dir = BtreeDirectory {
            stream: BlockPagedStream::new(base, BLOCK_SIZE),
            cache: HashMap::new(),
            root_page: INVALID_PAGE,
            start_free_page: INVALID_PAGE,
            num_free_page: 0,
            header_dirty: false,
            max_entries,
        };
        if dir.stream.page_count()? == 0 {
            debug!("initializing fresh directory header");
            dir.write_header()?;
        } else {
            let mut buf = vec![0u8; BLOCK_SIZE];
            dir.stream.read_page(0, &mut buf)?;
            let mut r = Reader::new(&buf);
            dir.root_page = r.u32()?;
            dir.start_free_page = r.u32()?;
            dir.num_free_page = r.u32()?;
        }
        Ok(dir)
    }

    fn write_header(&mut self) -> Result<(), DirectoryError> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        buf[0..4].copy_from_slice(&self.root_page.to_le_bytes());
        buf[4..8].copy_from_slice(&self.start_free_page.to_le_bytes());
        buf[8..12].copy_from_slice(&self.num_free_page.to_le_bytes());
        self.stream.write_page(0, &buf)?;
        self.header_dirty = false;
        Ok(())
    }

    fn node(&self, page: u32) -> Result<&BtreeNode, DirectoryError> {
        self.cache
            .get(&page)
            .ok_or_else(|| corrupted("node not resident in cache"))
    }

    fn node_mut(&mut self, page: u32) -> Result<&mut BtreeNode, DirectoryError> {
        self.cache
            .get_mut(&page)
            .ok_or_else(|| corrupted("node not resident in cache"))
    }

    /// Bring a node into the cache, verifying the parent back-reference on
    /// a hit when one is expected.
    fn load_node(&mut self, parent: u32, page: u32) -> Result<(), DirectoryError> {
        if page == INVALID_PAGE || page == 0 {
            return Err(corrupted("reference to an invalid page"));
        }
        if let Some(node) = self.cache.get(&page) {
            if parent != INVALID_PAGE && node.parent != parent {
                return Err(corrupted("cached node has a different parent"));
            }
            return Ok(());
        }
        let mut buf = vec![0u8; BLOCK_SIZE];
        self.stream.read_page(page, &mut buf)?;
        let node = BtreeNode::from_page(parent, page, &buf)?;
        self.cache.insert(page, node);
        Ok(())
    }

    fn adjust_children(&mut self, children: &[u32], parent: u32) {
        for &child in children {
            if let Some(node) = self.cache.get_mut(&child) {
                node.parent = parent;
            }
        }
    }

    // ---- free-list / page allocation -----------------------------------

    fn read_free_page(&mut self, page: u32) -> Result<FreePage, DirectoryError> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        self.stream.read_page(page, &mut buf)?;
        let mut r = Reader::new(&buf);
        if r.u32()? != NODE_FLAG_FREE {
            return Err(corrupted("free-list cell has a nonzero flag"));
        }
        Ok(FreePage {
            next: r.u32()?,
            prev: r.u32()?,
        })
    }

    fn write_free_page(&mut self, page: u32, fp: &FreePage) -> Result<(), DirectoryError> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        buf[4..8].copy_from_slice(&fp.next.to_le_bytes());
        buf[8..12].copy_from_slice(&fp.prev.to_le_bytes());
        self.stream.write_page(page, &buf)?;
        Ok(())
    }

    /// Pop the free-list head, or grow the stream by one page.
    fn allocate_page(&mut self) -> Result<u32, DirectoryError> {
        let page = self.start_free_page;
        if page == INVALID_PAGE {
            let page = self.stream.page_count()?;
            self.stream.set_page_count(page + 1)?;
            trace!(page, "allocated page by growing the stream");
            return Ok(page);
        }
        let fp = self.read_free_page(page)?;
        self.num_free_page = self
            .num_free_page
            .checked_sub(1)
            .ok_or_else(|| corrupted("free-list count underflow"))?;
        self.start_free_page = fp.next;
        self.header_dirty = true;
        if fp.next != INVALID_PAGE {
            let mut head = self.read_free_page(fp.next)?;
            head.prev = INVALID_PAGE;
            self.write_free_page(fp.next, &head)?;
        }
        trace!(page, "allocated page from the free list");
        Ok(page)
    }

    /// Return a page: shrink the stream if it is the tail page, otherwise
    /// push it onto the free list.
    fn deallocate_page(&mut self, page: u32) -> Result<(), DirectoryError> {
        let pages = self.stream.page_count()?;
        if page + 1 == pages {
            self.stream.set_page_count(page)?;
            trace!(page, "deallocated tail page by shrinking the stream");
            return Ok(());
        }
        self.write_free_page(
            page,
            &FreePage {
                next: self.start_free_page,
                prev: INVALID_PAGE,
            },
        )?;
        if self.start_free_page != INVALID_PAGE {
            let head_page = self.start_free_page;
            let mut head = self.read_free_page(head_page)?;
            head.prev = page;
            self.write_free_page(head_page, &head)?;
        }
        self.start_free_page = page;
        self.num_free_page += 1;
        self.header_dirty = true;
        trace!(page, "pushed page onto the free list");
        Ok(())
    }

    fn del_node(&mut self, page: u32) -> Result<(), DirectoryError> {
        self.cache.remove(&page);
        self.deallocate_page(page)
    }

    // ---- lookup ---------------------------------------------------------

    fn check_name(name: &str) -> Result<(), DirectoryError> {
        if name.len() > MAX_FILENAME_LENGTH {
            return Err(DirectoryError::NameTooLong { length: name.len() });
        }
        Ok(())
    }

    /// Descend from the root to the node that holds `name`, or to the leaf
    /// where it would be inserted.
    fn find_node(&mut self, name: &str) -> Result<Option<FindResult>, DirectoryError> {
        if self.root_page == INVALID_PAGE {
            return Ok(None);
        }
        let mut parent = INVALID_PAGE;
        let mut page = self.root_page;
        for _ in 0..BTREE_MAX_DEPTH {
            self.load_node(parent, page)?;
            let node = self.node(page)?;
            match node.entries.binary_search_by(|e| e.name.as_str().cmp(name)) {
                Ok(index) => {
                    return Ok(Some(FindResult {
                        page,
                        index,
                        exact: true,
                    }))
                }
                Err(index) => {
                    if node.is_leaf() {
                        return Ok(Some(FindResult {
                            page,
                            index,
                            exact: false,
                        }));
                    }
                    let next = *node
                        .children
                        .get(index)
                        .ok_or_else(|| corrupted("child index out of bounds"))?;
                    parent = page;
                    page = next;
                }
            }
        }
        Err(corrupted("loop detected in tree structure"))
    }

    /// Look up one entry.
    pub fn get(&mut self, name: &str) -> Result<Option<(FileId, u32)>, DirectoryError> {
        Self::check_name(name)?;
        match self.find_node(name)? {
            Some(found) if found.exact => {
                let entry = self
                    .node(found.page)?
                    .entries
                    .get(found.index)
                    .ok_or_else(|| corrupted("entry index out of bounds"))?;
                Ok(Some((entry.id, entry.kind)))
            }
            _ => Ok(None),
        }
    }

    // ---- insertion ------------------------------------------------------

    /// Insert an entry. Returns false if the name is already present.
    #[instrument(level = "trace", skip(self, id))]
    pub fn add(&mut self, name: &str, id: FileId, kind: u32) -> Result<bool, DirectoryError> {
        Self::check_name(name)?;
        let entry = DirEntry {
            name: name.to_owned(),
            id,
            kind,
        };
        match self.find_node(name)? {
            None => {
                let page = self.allocate_page()?;
                let mut node = BtreeNode::new(INVALID_PAGE, page);
                node.entries.push(entry);
                node.dirty = true;
                self.cache.insert(page, node);
                self.root_page = page;
                self.header_dirty = true;
                Ok(true)
            }
            Some(found) if found.exact => Ok(false),
            Some(found) => {
                self.insert_and_balance(found.page, entry, INVALID_PAGE)?;
                Ok(true)
            }
        }
    }

    /// Insert into a node and split upward while any node overflows.
    ///
    /// Every ancestor of the starting node is resident: `find_node` loaded
    /// the whole descent path.
    fn insert_and_balance(
        &mut self,
        mut page: u32,
        mut entry: DirEntry,
        mut extra_child: u32,
    ) -> Result<(), DirectoryError> {
        for _ in 0..BTREE_MAX_DEPTH {
            let max_entries = self.max_entries;
            let node = self.node_mut(page)?;
            let index = match node
                .entries
                .binary_search_by(|e| e.name.cmp(&entry.name))
            {
                Ok(_) => return Err(corrupted("duplicate key during rebalance")),
                Err(index) => index,
            };
            if extra_child != INVALID_PAGE && !node.is_leaf() {
                node.children.insert(index + 1, extra_child);
            }
            node.entries.insert(index, entry);
            node.dirty = true;
            if node.entries.len() <= max_entries {
                return Ok(());
            }

            // Split: promote the middle entry, move the upper half into a
            // fresh sibling page.
            let middle = node.entries.len() / 2;
            let right_entries = node.entries.split_off(middle + 1);
            let mid_entry = node
                .entries
                .pop()
                .ok_or_else(|| corrupted("split of an empty node"))?;
            let right_children = if node.children.is_empty() {
                Vec::new()
            } else {
                node.children.split_off(middle + 1)
            };
            let parent = node.parent;

            let sibling_page = self.allocate_page()?;
            self.adjust_children(&right_children, sibling_page);
            let sibling = BtreeNode {
                page: sibling_page,
                parent,
                children: right_children,
                entries: right_entries,
                dirty: true,
            };
            self.cache.insert(sibling_page, sibling);
            trace!(page, sibling_page, "split overflowing node");

            if parent == INVALID_PAGE {
                let root_page = self.allocate_page()?;
                let root = BtreeNode {
                    page: root_page,
                    parent: INVALID_PAGE,
                    children: vec![page, sibling_page],
                    entries: vec![mid_entry],
                    dirty: true,
                };
                self.cache.insert(root_page, root);
                self.root_page = root_page;
                self.header_dirty = true;
                self.node_mut(page)?.parent = root_page;
                self.node_mut(sibling_page)?.parent = root_page;
                return Ok(());
            }
            entry = mid_entry;
            extra_child = sibling_page;
            page = parent;
        }
        Err(corrupted("rebalance exceeded maximum depth"))
    }

    // ---- removal --------------------------------------------------------

    /// Remove an entry, returning its `(id, kind)` if it existed.
    #[instrument(level = "trace", skip(self))]
    pub fn remove(&mut self, name: &str) -> Result<Option<(FileId, u32)>, DirectoryError> {
        Self::check_name(name)?;
        let found = match self.find_node(name)? {
            Some(found) if found.exact => found,
            _ => return Ok(None),
        };
        let (id, kind) = {
            let entry = self
                .node(found.page)?
                .entries
                .get(found.index)
                .ok_or_else(|| corrupted("entry index out of bounds"))?;
            (entry.id, entry.kind)
        };
        let leaf = self.replace_with_sub_entry(found.page, found.index)?;
        self.balance_up(leaf)?;
        Ok(Some((id, kind)))
    }

    /// Delete the entry at `(page, index)`. An internal-node entry is
    /// swapped with its in-order predecessor so the physical removal always
    /// happens in a leaf; returns the leaf page to rebalance from.
    fn replace_with_sub_entry(&mut self, page: u32, index: usize) -> Result<u32, DirectoryError> {
        if self.node(page)?.is_leaf() {
            let node = self.node_mut(page)?;
            if index >= node.entries.len() {
                return Err(corrupted("entry index out of bounds"));
            }
            node.entries.remove(index);
            node.dirty = true;
            return Ok(page);
        }

        let mut parent = page;
        let mut child = *self
            .node(page)?
            .children
            .get(index)
            .ok_or_else(|| corrupted("child index out of bounds"))?;
        let mut leaf = None;
        for _ in 0..BTREE_MAX_DEPTH {
            self.load_node(parent, child)?;
            let node = self.node(child)?;
            if node.is_leaf() {
                leaf = Some(child);
                break;
            }
            parent = child;
            child = *node
                .children
                .last()
                .ok_or_else(|| corrupted("internal node without children"))?;
        }
        let leaf = leaf.ok_or_else(|| corrupted("predecessor descent exceeded maximum depth"))?;

        let predecessor = {
            let node = self.node_mut(leaf)?;
            node.dirty = true;
            node.entries
                .pop()
                .ok_or_else(|| corrupted("empty leaf during predecessor swap"))?
        };
        let node = self.node_mut(page)?;
        node.entries[index] = predecessor;
        node.dirty = true;
        Ok(leaf)
    }

    /// Re-establish occupancy bounds from a leaf upward after a removal.
    ///
    /// Assumes the path from the root down to `page` is resident, which
    /// `find_node` plus the predecessor descent guarantee.
    fn balance_up(&mut self, mut page: u32) -> Result<(), DirectoryError> {
        for _ in 0..BTREE_MAX_DEPTH {
            let (parent, entry_count, child_count) = {
                let node = self.node(page)?;
                (node.parent, node.entries.len(), node.children.len())
            };

            if parent == INVALID_PAGE {
                if entry_count == 0 {
                    if child_count == 0 {
                        // Last entry removed: the tree becomes absent.
                        self.del_node(page)?;
                        self.root_page = INVALID_PAGE;
                    } else {
                        if child_count != 1 {
                            return Err(corrupted("empty root with multiple children"));
                        }
                        let child = self.node(page)?.children[0];
                        self.adjust_children(&[child], INVALID_PAGE);
                        self.root_page = child;
                        self.del_node(page)?;
                    }
                    self.header_dirty = true;
                }
                return Ok(());
            }
            if entry_count >= self.max_entries / 2 {
                return Ok(());
            }

            if !self.cache.contains_key(&parent) {
                return Err(corrupted("parent not resident during rebalance"));
            }
            let (entry_index, sibling, sibling_is_right) = self.find_sibling(parent, page)?;
            let sibling_entries = self.node(sibling)?.entries.len();
            let (left, right) = if sibling_is_right {
                (page, sibling)
            } else {
                (sibling, page)
            };

            if entry_count + sibling_entries < self.max_entries {
                self.merge(left, right, parent, entry_index)?;
            } else {
                self.rotate(left, right, parent, entry_index)?;
            }
            page = parent;
        }
        Err(corrupted("rebalance exceeded maximum depth"))
    }

    /// Locate an adjacent sibling of `page` under `parent`. Returns the
    /// parent entry index separating the two, the sibling page, and whether
    /// the sibling sits to the right.
    fn find_sibling(
        &mut self,
        parent: u32,
        page: u32,
    ) -> Result<(usize, u32, bool), DirectoryError> {
        let children = self.node(parent)?.children.clone();
        if children.len() < 2 {
            return Err(corrupted("internal node with fewer than two children"));
        }
        let position = children
            .iter()
            .position(|&c| c == page)
            .ok_or_else(|| corrupted("node missing from its parent's children"))?;
        if position + 1 == children.len() {
            let sibling = children[position - 1];
            self.load_node(parent, sibling)?;
            Ok((position - 1, sibling, false))
        } else {
            let sibling = children[position + 1];
            self.load_node(parent, sibling)?;
            Ok((position, sibling, true))
        }
    }

    /// Fold `right` (and the parent separator) into `left`; `right` is
    /// freed.
    fn merge(
        &mut self,
        left: u32,
        right: u32,
        parent: u32,
        entry_index: usize,
    ) -> Result<(), DirectoryError> {
        let separator = {
            let node = self.node_mut(parent)?;
            if entry_index >= node.entries.len() {
                return Err(corrupted("separator index out of bounds"));
            }
            let separator = node.entries.remove(entry_index);
            let position = node
                .children
                .iter()
                .position(|&c| c == right)
                .ok_or_else(|| corrupted("merged child missing from parent"))?;
            node.children.remove(position);
            node.dirty = true;
            separator
        };

        let right_node = self
            .cache
            .remove(&right)
            .ok_or_else(|| corrupted("node not resident in cache"))?;
        let BtreeNode {
            entries: right_entries,
            children: right_children,
            ..
        } = right_node;

        {
            let node = self.node_mut(left)?;
            node.entries.push(separator);
            node.entries.extend(right_entries);
            node.children.extend_from_slice(&right_children);
            node.dirty = true;
        }
        self.adjust_children(&right_children, left);
        trace!(left, right, "merged sibling nodes");
        self.deallocate_page(right)
    }

    /// Even out `left` and `right` around a new median; the parent
    /// separator is replaced in place.
    fn rotate(
        &mut self,
        left: u32,
        right: u32,
        parent: u32,
        entry_index: usize,
    ) -> Result<(), DirectoryError> {
        let separator = self
            .node(parent)?
            .entries
            .get(entry_index)
            .ok_or_else(|| corrupted("separator index out of bounds"))?
            .clone();

        let mut right_node = self
            .cache
            .remove(&right)
            .ok_or_else(|| corrupted("node not resident in cache"))?;
        let left_node = self.node_mut(left)?;

        let mut pool = std::mem::take(&mut left_node.entries);
        pool.push(separator);
        pool.append(&mut right_node.entries);
        let middle = pool.len() / 2;
        right_node.entries = pool.split_off(middle + 1);
        let new_separator = pool
            .pop()
            .ok_or_else(|| corrupted("rotation of empty nodes"))?;
        left_node.entries = pool;

        if !left_node.children.is_empty() && !right_node.children.is_empty() {
            let mut pool = std::mem::take(&mut left_node.children);
            pool.append(&mut right_node.children);
            right_node.children = pool.split_off(middle + 1);
            left_node.children = pool;
        }
        left_node.dirty = true;
        right_node.dirty = true;
        let left_children = left_node.children.clone();
        let right_children = right_node.children.clone();
        self.cache.insert(right, right_node);
        self.adjust_children(&left_children, left);
        self.adjust_children(&right_children, right);

        let node = self.node_mut(parent)?;
        node.entries[entry_index] = new_separator;
        node.dirty = true;
        trace!(left, right, "rotated entries between siblings");
        Ok(())
    }

    // ---- traversal ------------------------------------------------------

    /// In-order traversal: entries are visited in ascending name order.
    pub fn iterate<F>(&mut self, mut callback: F) -> Result<(), DirectoryError>
    where
        F: FnMut(&DirEntry),
    {
        if self.root_page == INVALID_PAGE {
            return Ok(());
        }
        let root = self.root_page;
        self.iterate_node(INVALID_PAGE, root, 0, &mut callback)
    }

    fn iterate_node<F>(
        &mut self,
        parent: u32,
        page: u32,
        depth: usize,
        callback: &mut F,
    ) -> Result<(), DirectoryError>
    where
        F: FnMut(&DirEntry),
    {
        if depth >= BTREE_MAX_DEPTH {
            return Err(corrupted("iteration exceeded maximum depth"));
        }
        self.load_node(parent, page)?;
        let (entries, children) = {
            let node = self.node(page)?;
            (node.entries.clone(), node.children.clone())
        };
        if children.is_empty() {
            for entry in &entries {
                callback(entry);
            }
            return Ok(());
        }
        if children.len() != entries.len() + 1 {
            return Err(corrupted("child/entry count mismatch"));
        }
        for (i, entry) in entries.iter().enumerate() {
            self.iterate_node(page, children[i], depth + 1, callback)?;
            callback(entry);
        }
        self.iterate_node(page, children[entries.len()], depth + 1, callback)
    }

    // ---- persistence ----------------------------------------------------

    /// Write back all dirty nodes and the header if changed.
    pub fn flush(&mut self) -> Result<(), DirectoryError> {
        let mut dirty: Vec<u32> = self
            .cache
            .values()
            .filter(|node| node.dirty)
            .map(|node| node.page)
            .collect();
        dirty.sort_unstable();
        let mut buf = vec![0u8; BLOCK_SIZE];
        for page in dirty {
            self.node(page)?.to_page(&mut buf)?;
            self.stream.write_page(page, &buf)?;
            self.node_mut(page)?.dirty = false;
        }
        if self.header_dirty {
            self.write_header()?;
        }
        self.stream.flush()?;
        Ok(())
    }

    /// Durably persist the directory.
    pub fn fsync(&mut self) -> Result<(), DirectoryError> {
        self.flush()?;
        self.stream.fsync()?;
        Ok(())
    }

    /// Flush and drop all cached nodes.
    pub fn clear_cache(&mut self) -> Result<(), DirectoryError> {
        self.flush()?;
        self.cache.clear();
        Ok(())
    }

    // ---- self-checks ----------------------------------------------------

    /// Walk the free list and confirm its length and back-links.
    pub fn validate_free_list(&mut self) -> Result<bool, DirectoryError> {
        let mut page = self.start_free_page;
        let mut prev = INVALID_PAGE;
        for _ in 0..self.num_free_page {
            if page == INVALID_PAGE {
                return Ok(false);
            }
            let fp = self.read_free_page(page)?;
            if fp.prev != prev {
                return Ok(false);
            }
            prev = page;
            page = fp.next;
        }
        Ok(page == INVALID_PAGE)
    }

    /// Check sortedness, occupancy bounds and separator ordering of the
    /// whole tree.
    pub fn validate_btree_structure(&mut self) -> Result<bool, DirectoryError> {
        if self.root_page == INVALID_PAGE {
            return Ok(true);
        }
        let root = self.root_page;
        self.validate_node(INVALID_PAGE, root, 0)
    }

    fn validate_node(
        &mut self,
        parent: u32,
        page: u32,
        depth: usize,
    ) -> Result<bool, DirectoryError> {
        if depth > BTREE_MAX_DEPTH {
            return Ok(false);
        }
        self.load_node(parent, page)?;
        let (entries, children, is_root) = {
            let node = self.node(page)?;
            (
                node.entries.clone(),
                node.children.clone(),
                node.parent == INVALID_PAGE,
            )
        };
        if !entries.windows(2).all(|w| w[0].name < w[1].name) {
            warn!(page, "node entries are not sorted");
            return Ok(false);
        }
        if is_root {
            if entries.is_empty() {
                warn!(page, "root node has no entries");
                return Ok(false);
            }
        } else if entries.len() < self.max_entries / 2 || entries.len() > self.max_entries {
            warn!(page, count = entries.len(), "node occupancy out of bounds");
            return Ok(false);
        }
        if children.is_empty() {
            return Ok(true);
        }
        if children.len() != entries.len() + 1 {
            warn!(page, "child/entry count mismatch");
            return Ok(false);
        }
        for &child in &children {
            if !self.validate_node(page, child, depth + 1)? {
                return Ok(false);
            }
        }
        for (i, entry) in entries.iter().enumerate() {
            let left_max = self.node(children[i])?.entries.last().cloned();
            let right_min = self.node(children[i + 1])?.entries.first().cloned();
            let ordered = match (left_max, right_min) {
                (Some(l), Some(r)) => l.name < entry.name && entry.name < r.name,
                _ => false,
            };
            if !ordered {
                warn!(page, index = i, "separator out of order");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Page accounting snapshot.
    pub fn stats(&self) -> Result<DirStats, DirectoryError> {
        Ok(DirStats {
            total_pages: self.stream.page_count()?,
            free_pages: self.num_free_page,
            root_present: self.root_page != INVALID_PAGE,
        })
    }
}

impl<S: ByteStream> Drop for BtreeDirectory<S> {
    fn drop(&mut self) {
        if let Err(error) = self.flush() {
            warn!(%error, "failed to flush directory cache on close");
        }
    }
}

//! # Transaction Cache
//!
//! Per-transaction collection of everything a writer stages before
//! commit:
//!
//! - **Shadow pages**: freshly allocated page buffers keyed by page id.
//!   They become real file contents during flush; until then the file
//!   and mmap are untouched.
//! - **Node arena**: every page materialized for mutation lives here as
//!   an owned [`Node`], addressed by index so nodes can link to parents
//!   without self-referential borrows. The arena dies with the
//!   transaction.
//! - **Allocation**: a contiguous run comes from the freelist when one
//!   exists, otherwise from the watermark bump, remapping the read
//!   window when the file must grow.
//!
//! ## Spill
//!
//! Commit time turns dirty nodes back into pages, children before
//! parents:
//!
//! 1. Sort cached nodes by depth descending (leaves first).
//! 2. Split any node that is both oversized and element-rich enough,
//!    cutting pieces at half a page while never leaving a piece under
//!    `MIN_KEYS_PER_PAGE` elements.
//! 3. A split root gets a manufactured empty branch parent, which joins
//!    the work list and is spilled in the same pass.
//! 4. Every resulting node gets a shadow page (with overflow run when it
//!    exceeds one page), is serialized into it, and rewrites its parent
//!    entry: the first piece under the key the parent already used for
//!    the old node, later pieces under their own first keys.
//! 5. Superseded pages are quarantined in the freelist under the
//!    committing txid; bucket roots that moved are repointed in the
//!    bucket index.
//!
//! ## Flush
//!
//! Shadow pages are written through the file descriptor in ascending
//! page order and fsynced. The caller writes the meta page afterwards;
//! nothing here touches pages the previous commit references.

use hashbrown::HashMap;
use log::{debug, trace};
use parking_lot::RwLock;

use crate::bucket::BucketIndex;
use crate::error::Result;
use crate::node::{Node, NodeElement, NodeId};
use crate::storage::{
    DbFile, Freelist, Meta, MmapRegion, PageHeader, Pgid, Txid, ELEMENT_SIZE, MIN_KEYS_PER_PAGE,
    PAGE_HEADER_SIZE, RESERVED_PAGE_COUNT,
};

/// A transaction-local buffer holding a freshly allocated page's future
/// contents (one page plus any overflow run).
#[derive(Debug)]
pub(crate) struct ShadowPage {
    pub buf: Vec<u8>,
}

/// Everything page allocation needs from the database and transaction.
pub(crate) struct AllocContext<'a> {
    pub txid: Txid,
    pub file: &'a DbFile,
    pub mmap: &'a RwLock<MmapRegion>,
    pub freelist: &'a mut Freelist,
    pub meta: &'a mut Meta,
}

#[derive(Debug)]
pub(crate) struct TxCache {
    page_size: u64,
    shadow: HashMap<Pgid, ShadowPage>,
    node_map: HashMap<Pgid, NodeId>,
    arena: Vec<Node>,
    /// Runs drawn from the freelist, so rollback can hand them back.
    freelist_allocs: Vec<(Pgid, u64)>,
}

impl TxCache {
    pub fn new(page_size: u64) -> Self {
        Self {
            page_size,
            shadow: HashMap::new(),
            node_map: HashMap::new(),
            arena: Vec::new(),
            freelist_allocs: Vec::new(),
        }
    }

    /// Shadow page if present, else the committed page from the map.
    pub fn page<'a>(&'a self, mmap: &'a MmapRegion, pgid: Pgid) -> &'a [u8] {
        match self.shadow.get(&pgid) {
            Some(shadow) => &shadow.buf,
            None => mmap.page_with_overflow(pgid),
        }
    }

    pub fn shadow_mut(&mut self, pgid: Pgid) -> &mut [u8] {
        &mut self
            .shadow
            .get_mut(&pgid)
            .expect("shadow page was allocated by this transaction")
            .buf
    }

    pub fn node_for(&self, pgid: Pgid) -> Option<NodeId> {
        self.node_map.get(&pgid).copied()
    }

    pub fn node_ref(&self, id: NodeId) -> &Node {
        &self.arena[id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.arena[id]
    }

    /// Returns the cached node for `pgid`, materializing it from its page
    /// on first access and linking it under `parent`.
    pub fn node(
        &mut self,
        mmap: &MmapRegion,
        pgid: Pgid,
        parent: Option<NodeId>,
        parent_key: Option<Vec<u8>>,
    ) -> NodeId {
        if let Some(&id) = self.node_map.get(&pgid) {
            return id;
        }

        let mut node = Node::read(self.page(mmap, pgid));
        node.parent = parent;
        node.parent_key = parent_key;
        node.depth = match parent {
            Some(p) => self.arena[p].depth + 1,
            None => 0,
        };
        trace!("materialized node for page {} at depth {}", pgid, node.depth);

        let id = self.push_node(node);
        self.node_map.insert(pgid, id);
        id
    }

    /// Registers a node the transaction manufactured itself (a fresh
    /// bucket root) under the page id it was allocated.
    pub fn register(&mut self, pgid: Pgid, node: Node) -> NodeId {
        let id = self.push_node(node);
        self.node_map.insert(pgid, id);
        id
    }

    fn push_node(&mut self, node: Node) -> NodeId {
        let id = self.arena.len();
        self.arena.push(node);
        id
    }

    /// Reserves a run of `count` pages and stages an empty shadow page
    /// for it. The run comes from the freelist when a consecutive one
    /// exists, otherwise from the watermark, growing the map as needed.
    pub fn allocate(&mut self, ctx: &mut AllocContext<'_>, count: u64) -> Result<Pgid> {
        let pgid = match ctx.freelist.allocate(count as usize) {
            Some(id) => {
                self.freelist_allocs.push((id, count));
                id
            }
            None => {
                let id = ctx.meta.watermark();
                ctx.meta.set_watermark(id + count);
                let min_size = (id + count) * self.page_size;
                let mapped = ctx.mmap.read().size();
                if min_size > mapped {
                    ctx.mmap.write().remap(ctx.file.file(), min_size)?;
                }
                id
            }
        };
        debug!("allocated {} page(s) starting at {}", count, pgid);

        let mut buf = vec![0u8; (count * self.page_size) as usize];
        {
            let header = PageHeader::from_bytes_mut(&mut buf);
            header.set_id(pgid);
            header.set_overflow(count - 1);
        }
        self.shadow.insert(pgid, ShadowPage { buf });
        Ok(pgid)
    }

    /// Hands freelist-sourced runs back after a rollback or failed
    /// commit; watermark-sourced runs die with the transaction's meta
    /// copy.
    pub fn return_allocations(&mut self, freelist: &mut Freelist) {
        for (pgid, count) in self.freelist_allocs.drain(..) {
            freelist.reinsert(pgid, count);
        }
    }

    /// Splits an oversized node into pieces, replacing its element list.
    /// Returns `None` when the node fits its page.
    fn split_node(&mut self, nid: NodeId) -> Option<Vec<NodeId>> {
        let node = &self.arena[nid];
        if node.elements.len() <= 2 * MIN_KEYS_PER_PAGE
            || (node.storage_size() as u64) < self.page_size
        {
            return None;
        }

        let is_leaf = node.is_leaf;
        let depth = node.depth;
        let total = node.elements.len();
        let threshold = (self.page_size / 2) as usize;
        debug!(
            "splitting node of {} elements, {} bytes",
            total,
            node.storage_size()
        );

        let elements = std::mem::take(&mut self.arena[nid].elements);
        let mut pieces: Vec<NodeId> = Vec::new();
        let mut current: Vec<NodeElement> = Vec::new();
        let mut current_size = PAGE_HEADER_SIZE;

        for (index, element) in elements.into_iter().enumerate() {
            let element_size = ELEMENT_SIZE + element.key.len() + element.value.len();
            let can_cut = current.len() >= MIN_KEYS_PER_PAGE
                && index <= total - MIN_KEYS_PER_PAGE
                && current_size + element_size >= threshold;
            if can_cut {
                pieces.push(self.push_piece(is_leaf, depth, std::mem::take(&mut current)));
                current_size = PAGE_HEADER_SIZE;
            }
            current_size += element_size;
            current.push(element);
        }
        pieces.push(self.push_piece(is_leaf, depth, current));

        debug!("split produced {} pieces", pieces.len());
        Some(pieces)
    }

    fn push_piece(&mut self, is_leaf: bool, depth: usize, elements: Vec<NodeElement>) -> NodeId {
        let mut node = if is_leaf {
            Node::new_leaf()
        } else {
            Node::new_branch()
        };
        node.depth = depth;
        node.elements = elements;
        self.push_node(node)
    }

    fn root_of(&self, mut nid: NodeId) -> NodeId {
        while let Some(parent) = self.arena[nid].parent {
            nid = parent;
        }
        nid
    }

    /// The commit-time pass: splits oversized nodes, assigns every
    /// resulting node a fresh page, rewrites parent entries, quarantines
    /// superseded pages, and repoints moved bucket roots.
    pub fn spill(&mut self, ctx: &mut AllocContext<'_>, buckets: &mut BucketIndex) -> Result<()> {
        let mut work: Vec<NodeId> = self.node_map.values().copied().collect();
        work.sort_by(|a, b| self.arena[*b].depth.cmp(&self.arena[*a].depth));
        debug!("spilling {} dirty nodes", work.len());

        let mut moved_roots: Vec<NodeId> = Vec::new();

        let mut i = 0;
        while i < work.len() {
            let nid = work[i];
            i += 1;

            // Whatever this pass writes supersedes the node's old page.
            if let Some(old) = self.arena[nid].pgid {
                if old >= RESERVED_PAGE_COUNT {
                    ctx.freelist.free(ctx.txid, old, self.arena[nid].overflow);
                }
            }

            match self.split_node(nid) {
                Some(pieces) => {
                    let parent = match self.arena[nid].parent {
                        Some(p) => p,
                        None => {
                            let root = self.push_node(Node::new_branch());
                            self.arena[nid].parent = Some(root);
                            if self.arena[nid].pgid.is_some() {
                                moved_roots.push(nid);
                            }
                            work.push(root);
                            root
                        }
                    };

                    for (j, &pid) in pieces.iter().enumerate() {
                        let new_pgid = self.write_to_fresh_page(ctx, pid)?;
                        self.arena[pid].parent = Some(parent);

                        let new_key = self.arena[pid]
                            .first_key()
                            .expect("split pieces are never empty")
                            .to_vec();
                        let old_key = if j == 0 {
                            self.arena[nid]
                                .parent_key
                                .clone()
                                .unwrap_or_else(|| new_key.clone())
                        } else {
                            new_key.clone()
                        };
                        self.arena[parent].put_child(&old_key, &new_key, new_pgid);
                    }
                }
                None => {
                    let old_pgid = self.arena[nid].pgid;
                    let new_pgid = self.write_to_fresh_page(ctx, nid)?;

                    if self.arena[nid].parent.is_none() {
                        if let Some(old) = old_pgid {
                            buckets.update_root(old, new_pgid);
                        }
                    } else if let Some(parent) = self.arena[nid].parent {
                        let new_key = match self.arena[nid].first_key() {
                            Some(key) => key.to_vec(),
                            // A fully emptied leaf keeps its slot key.
                            None => self.arena[nid].parent_key.clone().unwrap_or_default(),
                        };
                        let old_key = self.arena[nid]
                            .parent_key
                            .clone()
                            .unwrap_or_else(|| new_key.clone());
                        self.arena[parent].put_child(&old_key, &new_key, new_pgid);
                    }
                }
            }
        }

        // Roots that split kept their old page id; the new root of each
        // is found by walking the parent chain built above.
        for nid in moved_roots {
            let old = self.arena[nid]
                .pgid
                .expect("moved roots were read from a page");
            let root = self.root_of(nid);
            let new = self.arena[root]
                .pgid
                .expect("new root was spilled in this pass");
            buckets.update_root(old, new);
        }

        Ok(())
    }

    /// Allocates a page run sized for the node, serializes the node into
    /// it, and records the new page id on the node.
    fn write_to_fresh_page(&mut self, ctx: &mut AllocContext<'_>, nid: NodeId) -> Result<Pgid> {
        let size = self.arena[nid].storage_size() as u64;
        let count = size / self.page_size + 1;
        let pgid = self.allocate(ctx, count)?;
        {
            let buf = &mut self
                .shadow
                .get_mut(&pgid)
                .expect("shadow page was just allocated")
                .buf;
            self.arena[nid].write(buf);
        }
        self.arena[nid].pgid = Some(pgid);
        self.arena[nid].overflow = count - 1;
        Ok(pgid)
    }

    /// Writes every shadow page to the file in ascending page order and
    /// fsyncs.
    pub fn flush(&self, file: &DbFile) -> Result<()> {
        let mut pgids: Vec<Pgid> = self.shadow.keys().copied().collect();
        pgids.sort_unstable();
        debug!("flushing {} shadow pages", pgids.len());

        for pgid in pgids {
            file.write_page(pgid, &self.shadow[&pgid].buf)?;
        }
        file.sync()
    }
}

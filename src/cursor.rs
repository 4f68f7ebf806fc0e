//! # Cursors
//!
//! A cursor locates a key inside one bucket's B+tree by descending from
//! the bucket root. It records the path it took as a stack of frames,
//! one per level, so the write path can rematerialize exactly the pages
//! it is about to mutate.
//!
//! ## Mixed Frames
//!
//! Inside a writable transaction a page may already have been
//! materialized into a mutable node. Each descent step therefore prefers
//! the transaction cache's node for a page id and falls back to the
//! page bytes (shadow page first, then mmap). Read-only transactions
//! never create nodes, so their descents see pages only.
//!
//! ## Descent Rule
//!
//! At a branch, `first_ge(key)` yields `(i, exact)`; the cursor follows
//! child `i` on an exact hit and `max(i-1, 0)` otherwise, because branch
//! element `i` covers keys from its own key up to (not including) the
//! next element's key. At the leaf the frame index is the `first_ge`
//! insertion point, and the element there, if any, is the result.
//!
//! Cursors copy the found key and value out of the page before
//! returning: page slices must not outlive a single descent, since any
//! allocation can replace the mmap window.

use smallvec::SmallVec;

use crate::error::Result;
use crate::storage::{BranchPage, LeafPage, PageHeader, Pgid};
use crate::tx::Tx;

/// One level of a descent: the page visited and the element index taken.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Frame {
    pub pgid: Pgid,
    pub index: usize,
}

pub(crate) type FrameStack = SmallVec<[Frame; 8]>;

pub struct Cursor<'a, 'db> {
    tx: &'a Tx<'db>,
    root: Pgid,
    stack: FrameStack,
}

impl<'a, 'db> Cursor<'a, 'db> {
    pub(crate) fn new(tx: &'a Tx<'db>, root: Pgid) -> Self {
        Self {
            tx,
            root,
            stack: FrameStack::new(),
        }
    }

    /// Descends from the bucket root to the leaf position for `key`.
    ///
    /// Returns the key/value pair at that position when the leaf has one;
    /// the returned key equals the search key only on an exact match, so
    /// point lookups compare before trusting the value.
    pub fn seek(&mut self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.stack.clear();
        let mmap = self.tx.db().mmap.read();
        let mut pgid = self.root;

        loop {
            // A node materialized by this transaction supersedes its page.
            if let Some(nid) = self.tx.cache().node_for(pgid) {
                let node = self.tx.cache().node_ref(nid);
                let (i, exact) = node.first_ge(key);
                if node.is_leaf {
                    self.stack.push(Frame { pgid, index: i });
                    return Ok(node
                        .elements
                        .get(i)
                        .map(|e| (e.key.clone(), e.value.clone())));
                }
                let index = if exact { i } else { i.saturating_sub(1) };
                self.stack.push(Frame { pgid, index });
                pgid = node.elements[index].pgid;
                continue;
            }

            let page = self.tx.cache().page(&mmap, pgid);
            let header = PageHeader::from_bytes(page);
            if header.is_leaf() {
                let leaf = LeafPage::from_page(page);
                let (i, _) = leaf.find_first_ge(key);
                self.stack.push(Frame { pgid, index: i });
                if i < leaf.count() {
                    return Ok(Some((leaf.key(i).to_vec(), leaf.value(i).to_vec())));
                }
                return Ok(None);
            }

            assert!(
                header.is_branch(),
                "page {} is neither branch nor leaf",
                pgid
            );
            let branch = BranchPage::from_page(page);
            let (i, exact) = branch.find_first_ge(key);
            let index = if exact { i } else { i.saturating_sub(1) };
            self.stack.push(Frame { pgid, index });
            pgid = branch.child(index);
        }
    }

    pub(crate) fn into_stack(self) -> FrameStack {
        self.stack
    }
}

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use super::page_head::PageHeadCollection;
use crate::primitives::page::{sort_updates, Page, PageUpdate};
use crate::types::{PageId, Result, StoreError, Transaction, TxnId, Version};

/// Lifecycle of a transaction head.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TxnState {
    /// Accepting reads, writes, and locks.
    Active,
    /// Updates handed to the commit path.
    Committing,
    /// Published (roots) or merged into the parent (children).
    Committed,
    /// Discarded.
    RolledBack,
}

impl TxnState {
    /// Returns true until the head has finished.
    pub fn is_live(self) -> bool {
        matches!(self, TxnState::Active | TxnState::Committing)
    }
}

struct HeadState {
    state: TxnState,
    updates: Vec<PageUpdate>,
    next_sequence: u32,
    modified: FxHashMap<PageId, Arc<Page>>,
    locked: FxHashSet<PageId>,
    // Root only: lock depth held on each page head.
    lock_counts: FxHashMap<PageId, u32>,
}

/// Private state of one transaction: queued updates, materialized pages,
/// and locked pages.
pub struct TransactionHead {
    txn: Transaction,
    parent: Option<TxnId>,
    root: TxnId,
    state: Mutex<HeadState>,
}

impl TransactionHead {
    /// The transaction this head belongs to.
    pub fn transaction(&self) -> &Transaction {
        &self.txn
    }

    /// Parent transaction, for nested transactions.
    pub fn parent(&self) -> Option<TxnId> {
        self.parent
    }

    /// Top-level ancestor; the head itself for a root.
    pub fn root(&self) -> TxnId {
        self.root
    }

    /// Returns true for a top-level transaction.
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TxnState {
        self.state.lock().state
    }

    /// Number of updates queued so far.
    pub fn pending_updates(&self) -> usize {
        self.state.lock().updates.len()
    }
}

/// Table of transaction heads keyed by id.
///
/// Nesting is expressed through parent ids in the table. Lock order: the
/// table before any head, and a head before its ancestors.
pub struct TransactionHeadCollection {
    pages: Arc<PageHeadCollection>,
    page_size: usize,
    heads: Mutex<FxHashMap<TxnId, Arc<TransactionHead>>>,
}

impl TransactionHeadCollection {
    /// Creates an empty table.
    pub fn new(pages: Arc<PageHeadCollection>, page_size: usize) -> Self {
        Self {
            pages,
            page_size,
            heads: Mutex::new(FxHashMap::default()),
        }
    }

    /// Starts tracking `txn`, nested under `parent` when given.
    ///
    /// The parent must be active.
    pub fn begin(&self, txn: &Transaction, parent: Option<TxnId>) -> Result<Arc<TransactionHead>> {
        let mut heads = self.heads.lock();
        if heads.get(&txn.id).is_some_and(|head| head.state().is_live()) {
            return Err(StoreError::Invalid("transaction already begun"));
        }
        let root = match parent {
            None => txn.id,
            Some(parent_id) => {
                let parent_head = heads
                    .get(&parent_id)
                    .ok_or(StoreError::TxnNotActive(parent_id))?;
                if parent_head.state() != TxnState::Active {
                    return Err(StoreError::TxnNotActive(parent_id));
                }
                parent_head.root
            }
        };
        let head = Arc::new(TransactionHead {
            txn: *txn,
            parent,
            root,
            state: Mutex::new(HeadState {
                state: TxnState::Active,
                updates: Vec::new(),
                next_sequence: 1,
                modified: FxHashMap::default(),
                locked: FxHashSet::default(),
                lock_counts: FxHashMap::default(),
            }),
        });
        heads.insert(txn.id, Arc::clone(&head));
        debug!(txn = txn.id.0, parent = ?parent.map(|p| p.0), root = root.0, "transactions.begin");
        Ok(head)
    }

    /// Head of `id`, whatever its state.
    pub fn get(&self, id: TxnId) -> Result<Arc<TransactionHead>> {
        self.heads
            .lock()
            .get(&id)
            .cloned()
            .ok_or(StoreError::TxnNotActive(id))
    }

    /// Heads from `id` up to its root, `id` first.
    fn chain(&self, id: TxnId) -> Result<Vec<Arc<TransactionHead>>> {
        let heads = self.heads.lock();
        let mut chain = Vec::new();
        let mut next = Some(id);
        while let Some(current) = next {
            let head = heads
                .get(&current)
                .cloned()
                .ok_or(StoreError::TxnNotActive(current))?;
            next = head.parent;
            chain.push(head);
        }
        Ok(chain)
    }

    fn active_chain(&self, id: TxnId) -> Result<Vec<Arc<TransactionHead>>> {
        let chain = self.chain(id)?;
        if chain[0].state() != TxnState::Active {
            return Err(StoreError::TxnNotActive(id));
        }
        Ok(chain)
    }

    /// Every head below `id`, breadth first.
    fn descendants(&self, id: TxnId) -> Vec<Arc<TransactionHead>> {
        let heads = self.heads.lock();
        let mut children: FxHashMap<TxnId, Vec<Arc<TransactionHead>>> = FxHashMap::default();
        for head in heads.values() {
            if let Some(parent) = head.parent {
                children.entry(parent).or_default().push(Arc::clone(head));
            }
        }
        let mut out = Vec::new();
        let mut queue = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            if let Some(kids) = children.remove(&current) {
                for kid in kids {
                    queue.push_back(kid.txn.id);
                    out.push(kid);
                }
            }
        }
        out
    }

    fn same_tree(&self, root: TxnId) -> Vec<Arc<TransactionHead>> {
        let heads = self.heads.lock();
        heads
            .values()
            .filter(|head| head.root == root)
            .cloned()
            .collect()
    }

    /// Returns true for a nested transaction.
    pub fn is_child(&self, id: TxnId) -> Result<bool> {
        Ok(!self.get(id)?.is_root())
    }

    /// Queues `updates` and applies them to private copies of their pages.
    ///
    /// Incoming sequence numbers only order the batch; they are renumbered to
    /// follow everything already queued. A page is copied on first write from
    /// the nearest ancestor that modified it, or from the snapshot at the
    /// transaction's begin version.
    pub fn add_updates(&self, id: TxnId, mut updates: Vec<PageUpdate>) -> Result<()> {
        for update in &updates {
            update.check_bounds(self.page_size)?;
        }
        let chain = self.active_chain(id)?;
        let (head, ancestors) = (&chain[0], &chain[1..]);
        updates.sort_by_key(|update| update.sequence);
        let mut state = head.state.lock();
        if state.state != TxnState::Active {
            return Err(StoreError::TxnNotActive(id));
        }
        for mut update in updates {
            update.sequence = state.next_sequence;
            state.next_sequence += 1;
            if !state.modified.contains_key(&update.page_id) {
                let base = self.materialize(ancestors, head.txn.begin_version, update.page_id)?;
                state.modified.insert(update.page_id, base);
            }
            let page = state
                .modified
                .get_mut(&update.page_id)
                .ok_or(StoreError::Corruption("materialized page vanished"))?;
            Arc::make_mut(page).apply(&update)?;
            state.updates.push(update);
        }
        Ok(())
    }

    fn materialize(
        &self,
        ancestors: &[Arc<TransactionHead>],
        begin_version: Version,
        page: PageId,
    ) -> Result<Arc<Page>> {
        for ancestor in ancestors {
            if let Some(found) = ancestor.state.lock().modified.get(&page) {
                return Ok(Arc::clone(found));
            }
        }
        let head = self.pages.get_page_head(page)?;
        Ok(Arc::clone(&head.get_version(Some(begin_version))?.page))
    }

    /// Private copy of `page` visible to `id`, searching up the parent chain.
    pub fn get_modified_page(&self, id: TxnId, page: PageId) -> Result<Option<Arc<Page>>> {
        let chain = self.active_chain(id)?;
        for head in &chain {
            if let Some(found) = head.state.lock().modified.get(&page) {
                return Ok(Some(Arc::clone(found)));
            }
        }
        Ok(None)
    }

    /// Locks `page` on behalf of the root of `id`, blocking while another
    /// transaction tree holds it.
    ///
    /// Each level that had not locked the page yet rebuilds its private copy:
    /// the root from the latest committed snapshot, a child from its parent's
    /// copy, both replaying their own queued updates. Returns false when the
    /// tree already held the lock.
    pub fn lock(&self, id: TxnId, page: PageId) -> Result<bool> {
        let chain = self.active_chain(id)?;
        let root = &chain[chain.len() - 1];
        let page_head = self.pages.get_page_head(page)?;
        page_head.lock(root.txn.id);
        let newly = {
            let mut state = root.state.lock();
            let depth = state.lock_counts.entry(page).or_insert(0);
            *depth += 1;
            *depth == 1
        };
        let mut overlay: Option<Arc<Page>> = None;
        for head in chain.iter().rev() {
            let mut state = head.state.lock();
            if !state.locked.contains(&page) {
                let mut rebuilt = match overlay.take() {
                    Some(parent_copy) => parent_copy,
                    None => Arc::clone(&page_head.get_version(None)?.page),
                };
                for update in state.updates.iter().filter(|u| u.page_id == page) {
                    Arc::make_mut(&mut rebuilt).apply(update)?;
                }
                state.modified.insert(page, rebuilt);
                state.locked.insert(page);
            }
            overlay = state.modified.get(&page).cloned();
        }
        debug!(txn = id.0, root = root.txn.id.0, page = page.0, newly, "transactions.lock");
        Ok(newly)
    }

    /// Drops one lock level taken through [`lock`](Self::lock).
    pub fn unlock(&self, id: TxnId, page: PageId) -> Result<()> {
        let chain = self.active_chain(id)?;
        let root = &chain[chain.len() - 1];
        {
            let mut state = root.state.lock();
            match state.lock_counts.get_mut(&page) {
                Some(depth) => {
                    *depth -= 1;
                    if *depth == 0 {
                        state.lock_counts.remove(&page);
                    }
                }
                None => return Err(StoreError::Invalid("page is not locked by this transaction")),
            }
        }
        let page_head = self
            .pages
            .peek(page)
            .ok_or(StoreError::Corruption("locked page head was evicted"))?;
        if page_head.unlock(root.txn.id)? {
            for head in self.same_tree(root.txn.id) {
                head.state.lock().locked.remove(&page);
            }
        }
        Ok(())
    }

    /// Moves an active transaction with no active children to `Committing`
    /// and hands out its updates sorted by `(page, sequence)`.
    pub fn take_for_commit(&self, id: TxnId) -> Result<Vec<PageUpdate>> {
        let head = self.get(id)?;
        if self
            .descendants(id)
            .iter()
            .any(|child| child.parent == Some(id) && child.state() == TxnState::Active)
        {
            return Err(StoreError::Invalid("transaction has active child transactions"));
        }
        let mut state = head.state.lock();
        if state.state != TxnState::Active {
            return Err(StoreError::TxnNotActive(id));
        }
        state.state = TxnState::Committing;
        let mut updates = std::mem::take(&mut state.updates);
        sort_updates(&mut updates);
        Ok(updates)
    }

    /// Completes a child by appending its updates to its parent.
    pub fn merge_into_parent(&self, id: TxnId) -> Result<()> {
        let head = self.get(id)?;
        let parent = head
            .parent
            .ok_or(StoreError::Invalid("root transactions cannot merge"))?;
        let mut updates = self.take_for_commit(id)?;
        updates.sort_by_key(|update| update.sequence);
        let count = updates.len();
        match self.add_updates(parent, updates) {
            Ok(()) => {
                self.finish(id, TxnState::Committed);
                debug!(txn = id.0, parent = parent.0, updates = count, "transactions.merge");
                Ok(())
            }
            Err(err) => {
                self.finish(id, TxnState::RolledBack);
                Err(err)
            }
        }
    }

    /// Marks `id` finished; a root releases every page lock it holds.
    pub fn finish(&self, id: TxnId, outcome: TxnState) {
        let Ok(head) = self.get(id) else {
            return;
        };
        let held = {
            let mut state = head.state.lock();
            state.state = outcome;
            state.updates.clear();
            std::mem::take(&mut state.lock_counts)
        };
        if head.is_root() {
            for page in held.keys() {
                if let Some(page_head) = self.pages.peek(*page) {
                    page_head.release(id);
                }
            }
        }
    }

    /// Rolls back `id` and every transaction nested under it.
    ///
    /// Returns true when `id` was a root.
    pub fn rollback(&self, id: TxnId) -> Result<bool> {
        let head = self.get(id)?;
        if !head.state().is_live() {
            return Err(StoreError::TxnNotActive(id));
        }
        for child in self.descendants(id) {
            let mut state = child.state.lock();
            if state.state.is_live() {
                state.state = TxnState::RolledBack;
                state.updates.clear();
            }
        }
        self.finish(id, TxnState::RolledBack);
        debug!(txn = id.0, "transactions.rollback");
        Ok(head.is_root())
    }

    /// Drops finished heads, returning their private pages to the pool.
    pub fn reap(&self) -> usize {
        let mut heads = self.heads.lock();
        let before = heads.len();
        heads.retain(|_, head| match head.state.try_lock() {
            Some(state) => state.state.is_live(),
            None => true,
        });
        before - heads.len()
    }

    /// Number of heads in the table, finished ones included.
    pub fn len(&self) -> usize {
        self.heads.lock().len()
    }

    /// Returns true when the table is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of heads still active or committing.
    pub fn live_count(&self) -> usize {
        let heads: Vec<_> = self.heads.lock().values().cloned().collect();
        heads.iter().filter(|head| head.state().is_live()).count()
    }
}

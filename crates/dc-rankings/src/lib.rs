#![forbid(unsafe_code)]
//! Ranking lists.
//!
//! Every entry owns a 36-byte rankings node in the `data_0` chain. Nodes
//! form doubly linked lists ordered by recency; heads, tails and sizes live
//! in the index header's [`LruData`]. The head's `prev` and the tail's
//! `next` point at the node itself, so an unlinked node is recognised by
//! two null links.
//!
//! Insertions and removals are bracketed by a transaction record in the
//! header. A run that dies between the two halves leaves enough on disk for
//! [`Lists::complete_transaction`] to finish an insert or undo a removal.
//!
//! [`Rankings`] holds only in-memory state (enumeration cursors); the list
//! operations themselves run on a [`Lists`] view that borrows the block
//! files and the index for the duration of one call.

pub mod eviction;

pub use eviction::{
    low_water_mark, ClassicEviction, EntryInfo, EvictionHost, EvictionPolicy, EvictionState,
    PostedTask, TieredEviction, HIGH_USE_THRESHOLD,
};

use dc_alloc::BlockFiles;
use dc_error::{CheckError, DcError, Result};
use dc_index::IndexFile;
use dc_ondisk::{corruption, LruData, Operation, RankingsNode};
use dc_types::{CacheAddr, CacheTime, FileType, List};
use std::collections::HashMap;
use tracing::{debug, error, info, trace, warn};

fn invalid_links() -> DcError {
    DcError::Check(CheckError::InvalidLinks)
}

/// Handle of one enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IterId(u64);

/// Position of an enumeration within one list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    /// Nothing returned from this list yet.
    Start,
    /// Last node returned, with the slot generation observed at that time.
    At { node: CacheAddr, generation: u32 },
    /// The list is exhausted for this enumeration.
    End,
}

#[derive(Debug, Clone)]
struct IterState {
    forward: bool,
    cursors: [Cursor; List::LIVE.len()],
}

/// Enumeration cursors and list bookkeeping options.
#[derive(Debug, Default)]
pub struct Rankings {
    count_lists: bool,
    iterators: HashMap<IterId, IterState>,
    next_iter: u64,
}

impl Rankings {
    /// `count_lists` keeps `LruData::sizes` current (tiered lists only).
    #[must_use]
    pub fn new(count_lists: bool) -> Self {
        Self {
            count_lists,
            iterators: HashMap::new(),
            next_iter: 1,
        }
    }

    pub fn lists<'a>(&'a mut self, files: &'a mut BlockFiles, index: &'a mut IndexFile) -> Lists<'a> {
        Lists {
            rankings: self,
            files,
            index,
        }
    }

    pub fn new_iterator(&mut self, forward: bool) -> IterId {
        let id = IterId(self.next_iter);
        self.next_iter += 1;
        self.iterators.insert(
            id,
            IterState {
                forward,
                cursors: [Cursor::Start; List::LIVE.len()],
            },
        );
        id
    }

    pub fn end_iterator(&mut self, id: IterId) -> bool {
        self.iterators.remove(&id).is_some()
    }

    #[must_use]
    pub fn live_iterators(&self) -> usize {
        self.iterators.len()
    }

    #[must_use]
    pub fn is_forward(&self, id: IterId) -> Option<bool> {
        self.iterators.get(&id).map(|state| state.forward)
    }

    pub fn set_direction(&mut self, id: IterId, forward: bool) {
        if let Some(state) = self.iterators.get_mut(&id) {
            state.forward = forward;
        }
    }

    #[must_use]
    pub fn cursor(&self, id: IterId, list: List) -> Option<Cursor> {
        self.iterators
            .get(&id)
            .and_then(|state| state.cursors.get(list.index()).copied())
    }

    pub fn set_cursor(&mut self, id: IterId, list: List, cursor: Cursor) {
        if let Some(slot) = self
            .iterators
            .get_mut(&id)
            .and_then(|state| state.cursors.get_mut(list.index()))
        {
            *slot = cursor;
        }
    }

    /// End every live enumeration. Used when the files are recreated.
    pub fn end_all_cursors(&mut self) {
        for state in self.iterators.values_mut() {
            state.cursors = [Cursor::End; List::LIVE.len()];
        }
    }
}

/// List operations over borrowed block files and index.
pub struct Lists<'a> {
    rankings: &'a mut Rankings,
    files: &'a mut BlockFiles,
    index: &'a mut IndexFile,
}

impl Lists<'_> {
    fn lru(&self) -> &LruData {
        &self.index.header().lru
    }

    fn lru_mut(&mut self) -> &mut LruData {
        &mut self.index.header_mut().lru
    }

    #[must_use]
    pub fn head(&self, list: List) -> CacheAddr {
        self.lru().head(list)
    }

    #[must_use]
    pub fn tail(&self, list: List) -> CacheAddr {
        self.lru().tail(list)
    }

    #[must_use]
    pub fn size(&self, list: List) -> i32 {
        self.lru().size(list)
    }

    fn set_head(&mut self, list: List, addr: CacheAddr) {
        self.lru_mut().heads[list.index()] = addr;
    }

    fn set_tail(&mut self, list: List, addr: CacheAddr) {
        self.lru_mut().tails[list.index()] = addr;
    }

    fn is_head(&self, addr: CacheAddr) -> Option<List> {
        List::ALL.into_iter().find(|list| self.head(*list) == addr)
    }

    fn is_tail(&self, addr: CacheAddr) -> Option<List> {
        List::ALL.into_iter().find(|list| self.tail(*list) == addr)
    }

    pub fn load(&mut self, addr: CacheAddr) -> Result<RankingsNode> {
        let raw = self.files.read_record(addr)?;
        RankingsNode::parse(&raw).map_err(|err| corruption(addr, &err))
    }

    pub fn store(&mut self, addr: CacheAddr, node: &RankingsNode) -> Result<()> {
        self.files.write(addr, 0, &node.to_bytes())
    }

    /// Point the node back at its entry.
    pub fn set_contents(&mut self, addr: CacheAddr, contents: CacheAddr) -> Result<()> {
        let mut node = self.load(addr)?;
        node.contents = contents;
        self.store(addr, &node)
    }

    /// Link and hash checks on a node read from `addr`. With `from_list`,
    /// an unlinked node is an error.
    #[must_use]
    pub fn sanity_check(&self, addr: CacheAddr, node: &RankingsNode, from_list: bool) -> bool {
        if !node.self_hash_ok() {
            return false;
        }
        let has_next = node.next.value() != 0;
        let has_prev = node.prev.value() != 0;
        if has_next != has_prev {
            return false;
        }
        if !has_next {
            return !from_list;
        }
        if node.prev == addr && self.is_head(addr).is_none() {
            return false;
        }
        if node.next == addr && self.is_tail(addr).is_none() {
            return false;
        }
        node.next.sanity_check_for_rankings() && node.prev.sanity_check_for_rankings()
    }

    /// Checks on the payload of a node: it must name an entry, and a node
    /// found on a list must have been stamped.
    #[must_use]
    pub fn data_sanity_check(node: &RankingsNode, from_list: bool) -> bool {
        if !node.contents.is_initialized() {
            return false;
        }
        !(from_list && (node.last_used.is_null() || node.last_modified.is_null()))
    }

    /// Load a node reached through a list link.
    fn get_ranking(&mut self, addr: CacheAddr) -> Result<RankingsNode> {
        if !addr.is_initialized() {
            return Err(invalid_links());
        }
        let node = self.load(addr)?;
        if !self.sanity_check(addr, &node, true) {
            error!(target: "dc::rankings", node = %addr, "rankings_node_failed_sanity_check");
            return Err(invalid_links());
        }
        Ok(node)
    }

    /// The node at `addr` if it is still on a list.
    pub fn linked_node(&mut self, addr: CacheAddr) -> Result<Option<RankingsNode>> {
        let node = self.load(addr)?;
        if node.next.value() == 0 && node.prev.value() == 0 {
            return Ok(None);
        }
        Ok(Some(node))
    }

    fn increment(&mut self, list: List) {
        if self.rankings.count_lists {
            let size = &mut self.lru_mut().sizes[list.index()];
            *size = size.saturating_add(1);
        }
    }

    fn decrement(&mut self, list: List) {
        if self.rankings.count_lists {
            let size = &mut self.lru_mut().sizes[list.index()];
            if *size > 0 {
                *size -= 1;
            }
        }
    }

    fn begin(&mut self, addr: CacheAddr, operation: Operation, list: List) -> Result<()> {
        let lru = self.lru_mut();
        lru.transaction = addr;
        lru.operation = operation.to_raw();
        lru.operation_list = list.index() as i32;
        self.index.flush_header()
    }

    fn clear_transaction(&mut self) {
        let lru = self.lru_mut();
        lru.transaction = CacheAddr::NULL;
        lru.operation = Operation::None.to_raw();
        lru.operation_list = 0;
    }

    fn commit(&mut self) -> Result<()> {
        self.clear_transaction();
        self.index.flush_header()
    }

    /// Link `addr` at the head of `list` and stamp its times.
    pub fn insert(&mut self, addr: CacheAddr, modified: bool, list: List) -> Result<()> {
        trace!(target: "dc::rankings", node = %addr, %list, "insert");
        let mut node = self.load(addr)?;
        self.begin(addr, Operation::Insert, list)?;

        let head = self.head(list);
        if head.is_initialized() {
            let mut head_node = self.get_ranking(head)?;
            // A head already pointing at us is a replayed insert.
            if head_node.prev != head && head_node.prev != addr {
                error!(target: "dc::rankings", node = %addr, %head, "insert_found_bad_head");
                return Err(invalid_links());
            }
            head_node.prev = addr;
            self.store(head, &head_node)?;
        }

        node.next = head;
        node.prev = addr;
        let tail = self.tail(list);
        if !tail.is_initialized() || tail == addr {
            node.next = addr;
            self.set_tail(list, addr);
            self.index.flush_header()?;
        }

        let now = CacheTime::now();
        node.last_used = now;
        if modified {
            node.last_modified = now;
        }
        self.store(addr, &node)?;

        // The head moves last, onto a node that is already on disk.
        self.set_head(list, addr);
        self.increment(list);
        self.commit()
    }

    /// Unlink `addr` from `list`. Enumeration cursors resting on the node
    /// step back to the node they came from.
    pub fn remove(&mut self, addr: CacheAddr, list: List) -> Result<()> {
        let mut node = self.load(addr)?;
        trace!(
            target: "dc::rankings",
            node = %addr,
            next = %node.next,
            prev = %node.prev,
            %list,
            "remove"
        );
        let (next_addr, prev_addr) = (node.next, node.prev);
        if !next_addr.is_initialized()
            || next_addr.is_separate_file()
            || !prev_addr.is_initialized()
            || prev_addr.is_separate_file()
        {
            if next_addr.is_initialized() || prev_addr.is_initialized() {
                warn!(target: "dc::rankings", node = %addr, "invalid_rankings_links");
            }
            return Ok(());
        }

        let mut next = self.get_ranking(next_addr)?;
        let mut prev = self.get_ranking(prev_addr)?;
        let Some(list) = self.check_links(addr, &mut node, (prev_addr, &prev), (next_addr, &next), list)?
        else {
            return Ok(());
        };

        self.move_cursors_off(addr, &node);
        self.begin(addr, Operation::Remove, list)?;
        prev.next = next_addr;
        next.prev = prev_addr;

        let head = self.head(list);
        let tail = self.tail(list);
        if addr == head || addr == tail {
            if head == tail {
                self.set_head(list, CacheAddr::NULL);
                self.set_tail(list, CacheAddr::NULL);
            } else if addr == head {
                self.set_head(list, next_addr);
                next.prev = next_addr;
            } else {
                self.set_tail(list, prev_addr);
                prev.next = prev_addr;
            }
            self.index.flush_header()?;
        }

        // The node itself goes to disk last; until then the removal can be
        // undone from its links.
        node.next = CacheAddr::NULL;
        node.prev = CacheAddr::NULL;
        if next_addr != addr {
            self.store(next_addr, &next)?;
        }
        if prev_addr != addr {
            self.store(prev_addr, &prev)?;
        }
        self.store(addr, &node)?;
        self.decrement(list);
        self.commit()
    }

    /// Decide whether `addr` can be unlinked given its neighbours. Returns
    /// the list it actually heads or tails when that differs from `list`,
    /// and `None` when the node turned out not to be on the list at all.
    fn check_links(
        &mut self,
        addr: CacheAddr,
        node: &mut RankingsNode,
        (prev_addr, prev): (CacheAddr, &RankingsNode),
        (next_addr, next): (CacheAddr, &RankingsNode),
        list: List,
    ) -> Result<Option<List>> {
        if prev.next == addr && next.prev == addr {
            return Ok(Some(list));
        }
        if addr != prev_addr && addr != next_addr && prev.next == next_addr && next.prev == prev_addr {
            warn!(target: "dc::rankings", node = %addr, %list, "node_out_of_list");
            node.next = CacheAddr::NULL;
            node.prev = CacheAddr::NULL;
            self.store(addr, node)?;
            return Ok(None);
        }
        if prev.next == addr || next.prev == addr {
            if prev.next != addr {
                if let Some(actual) = self.is_head(addr) {
                    return Ok(Some(actual));
                }
            }
            if next.prev != addr {
                if let Some(actual) = self.is_tail(addr) {
                    return Ok(Some(actual));
                }
            }
        }
        error!(target: "dc::rankings", node = %addr, %prev_addr, %next_addr, "inconsistent_lru");
        Err(invalid_links())
    }

    /// Move `addr` to the head of `list`. A node already at the head only
    /// gets new timestamps.
    pub fn update_rank(&mut self, addr: CacheAddr, modified: bool, list: List) -> Result<()> {
        if self.head(list) == addr {
            let mut node = self.load(addr)?;
            let now = CacheTime::now();
            node.last_used = now;
            if modified {
                node.last_modified = now;
            }
            return self.store(addr, &node);
        }
        self.remove(addr, list)?;
        self.insert(addr, modified, list)
    }

    /// The node after `node` (towards the tail), or the head when `node` is
    /// `None`.
    pub fn get_next(
        &mut self,
        node: Option<CacheAddr>,
        list: List,
    ) -> Result<Option<(CacheAddr, RankingsNode)>> {
        let (from, target) = match node {
            None => {
                let head = self.head(list);
                if !head.is_initialized() {
                    return Ok(None);
                }
                (None, head)
            }
            Some(addr) => {
                let tail = self.tail(list);
                if !tail.is_initialized() || tail == addr {
                    return Ok(None);
                }
                let current = self.load(addr)?;
                if current.next == addr || !current.next.is_initialized() {
                    return Ok(None);
                }
                (Some((addr, current)), current.next)
            }
        };
        let found = self.get_ranking(target)?;
        if let Some((addr, current)) = from {
            check_single_link((addr, &current), (target, &found))?;
        }
        Ok(Some((target, found)))
    }

    /// The node before `node` (towards the head), or the tail when `node` is
    /// `None`.
    pub fn get_prev(
        &mut self,
        node: Option<CacheAddr>,
        list: List,
    ) -> Result<Option<(CacheAddr, RankingsNode)>> {
        let (from, target) = match node {
            None => {
                let tail = self.tail(list);
                if !tail.is_initialized() {
                    return Ok(None);
                }
                (None, tail)
            }
            Some(addr) => {
                let head = self.head(list);
                if !head.is_initialized() || head == addr {
                    return Ok(None);
                }
                let current = self.load(addr)?;
                if current.prev == addr || !current.prev.is_initialized() {
                    return Ok(None);
                }
                (Some((addr, current)), current.prev)
            }
        };
        let found = self.get_ranking(target)?;
        if let Some((addr, current)) = from {
            check_single_link((target, &found), (addr, &current))?;
        }
        Ok(Some((target, found)))
    }

    fn move_cursors_off(&mut self, addr: CacheAddr, node: &RankingsNode) {
        if self.rankings.iterators.is_empty() {
            return;
        }
        let towards_head = (node.prev, self.files.generation(node.prev));
        let towards_tail = (node.next, self.files.generation(node.next));
        for state in self.rankings.iterators.values_mut() {
            let (back, generation) = if state.forward { towards_head } else { towards_tail };
            for cursor in &mut state.cursors {
                if matches!(cursor, Cursor::At { node, .. } if *node == addr) {
                    *cursor = if back == addr {
                        Cursor::Start
                    } else {
                        Cursor::At { node: back, generation }
                    };
                    trace!(target: "dc::rankings", node = %addr, to = %back, "cursor_moved");
                }
            }
        }
    }

    /// The node an enumeration would return next from `list`, without
    /// moving the cursor.
    pub fn peek(&mut self, id: IterId, list: List) -> Result<Option<(CacheAddr, RankingsNode)>> {
        let Some(forward) = self.rankings.is_forward(id) else {
            return Ok(None);
        };
        let from = match self.rankings.cursor(id, list) {
            None | Some(Cursor::End) => return Ok(None),
            Some(Cursor::Start) => None,
            Some(Cursor::At { node, generation }) => {
                if self.files.generation(node) != generation {
                    debug!(target: "dc::rankings", node = %node, %list, "stale_cursor_ended");
                    self.rankings.set_cursor(id, list, Cursor::End);
                    return Ok(None);
                }
                Some(node)
            }
        };
        if forward {
            self.get_next(from, list)
        } else {
            self.get_prev(from, list)
        }
    }

    /// Record `node` as returned from `list`.
    pub fn advance(&mut self, id: IterId, list: List, node: CacheAddr) {
        let generation = self.files.generation(node);
        self.rankings.set_cursor(id, list, Cursor::At { node, generation });
    }

    /// Finish or undo the list operation a previous run left half done,
    /// then verify the list it touched. Returns the node of a completed
    /// insert so the caller can make sure its entry is reachable.
    pub fn complete_transaction(&mut self) -> Result<Option<CacheAddr>> {
        let Some((operation, addr, raw_list)) = self.lru().pending_operation() else {
            return Ok(None);
        };
        let list = usize::try_from(raw_list).ok().and_then(List::from_index);
        let Some(list) = list.filter(|_| addr.sanity_check_for_rankings()) else {
            warn!(target: "dc::rankings", %addr, raw_list, "invalid_pending_transaction");
            self.commit()?;
            return Err(invalid_links());
        };
        info!(target: "dc::rankings", %addr, ?operation, %list, "completing_transaction");

        let node = self.load(addr)?;
        self.store(addr, &node)?;
        let recovered = match operation {
            Operation::Insert => {
                self.clear_transaction();
                if self.head(list) == addr {
                    self.index.flush_header()?;
                } else {
                    self.insert(addr, true, list)?;
                }
                Some(addr)
            }
            Operation::Remove => {
                self.revert_remove(addr, node, list)?;
                None
            }
            Operation::None => {
                self.commit()?;
                return Err(invalid_links());
            }
        };

        let bound = self.rankings_block_count()?;
        self.check_list(list, bound).map_err(DcError::Check)?;
        Ok(recovered)
    }

    fn revert_remove(&mut self, addr: CacheAddr, node: RankingsNode, list: List) -> Result<()> {
        let (next_addr, prev_addr) = (node.next, node.prev);
        if !next_addr.is_initialized() || !prev_addr.is_initialized() {
            debug!(target: "dc::rankings", node = %addr, "remove_already_finished");
            return self.commit();
        }
        if next_addr.is_separate_file() || prev_addr.is_separate_file() {
            warn!(target: "dc::rankings", node = %addr, "invalid_rankings_links");
            return self.commit();
        }

        let mut next = self.load(next_addr)?;
        let mut prev = self.load(prev_addr)?;
        if addr != prev_addr {
            prev.next = addr;
        }
        if addr != next_addr {
            next.prev = addr;
        }

        let head = self.head(list);
        let tail = self.tail(list);
        if !head.is_initialized() || !tail.is_initialized() {
            self.set_head(list, addr);
            self.set_tail(list, addr);
        } else if head == next_addr {
            self.set_head(list, addr);
            prev.next = next_addr;
        } else if tail == prev_addr {
            self.set_tail(list, addr);
            next.prev = prev_addr;
        }
        self.store(next_addr, &next)?;
        self.store(prev_addr, &prev)?;
        self.commit()
    }

    fn rankings_block_count(&mut self) -> Result<u64> {
        self.files.allocated_records(FileType::Rankings)
    }

    /// Walk `list` from the head. Returns the number of nodes, or the first
    /// defect found. `bound` caps the walk so a cycle cannot spin forever.
    pub fn check_list(&mut self, list: List, bound: u64) -> std::result::Result<i32, CheckError> {
        let head = self.head(list);
        let tail = self.tail(list);
        if !head.is_initialized() {
            return if tail.is_initialized() {
                Err(CheckError::InvalidTail)
            } else {
                Ok(0)
            };
        }
        if !head.sanity_check_for_rankings() {
            return Err(CheckError::InvalidHead);
        }

        let mut current = head;
        let mut prev_addr = head;
        let mut items = 0_u64;
        loop {
            let node = self.load(current).map_err(|_| CheckError::ReadFailure)?;
            if !self.sanity_check(current, &node, true) {
                return Err(CheckError::InvalidEntry);
            }
            if node.prev != prev_addr {
                return Err(CheckError::InvalidPrev);
            }
            if !node.next.sanity_check_for_rankings() {
                return Err(CheckError::InvalidNext);
            }
            items += 1;
            if items > bound {
                error!(target: "dc::rankings", %list, bound, "list_longer_than_allocated_nodes");
                return Err(CheckError::InvalidLinks);
            }
            if node.next == current {
                if current != tail {
                    return Err(CheckError::InvalidTail);
                }
                return i32::try_from(items).map_err(|_| CheckError::InvalidLinks);
            }
            prev_addr = current;
            current = node.next;
            if current == head {
                return Err(CheckError::InvalidLinks);
            }
        }
    }

    /// Check every list. Returns the total number of nodes.
    pub fn self_check(&mut self) -> std::result::Result<i32, CheckError> {
        let bound = self.rankings_block_count().map_err(|_| CheckError::ReadFailure)?;
        let mut total = 0_i32;
        for list in List::ALL {
            let items = self.check_list(list, bound)?;
            if self.rankings.count_lists && items != self.size(list) {
                error!(
                    target: "dc::rankings",
                    %list,
                    items,
                    recorded = self.size(list),
                    "list_size_mismatch"
                );
                return Err(CheckError::NumEntriesMismatch);
            }
            total = total.saturating_add(items);
        }
        Ok(total)
    }
}

fn check_single_link(
    (prev_addr, prev): (CacheAddr, &RankingsNode),
    (next_addr, next): (CacheAddr, &RankingsNode),
) -> Result<()> {
    if prev.next != next_addr || next.prev != prev_addr {
        error!(target: "dc::rankings", %prev_addr, %next_addr, "inconsistent_lru");
        return Err(invalid_links());
    }
    Ok(())
}

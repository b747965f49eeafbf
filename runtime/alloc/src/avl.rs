//! Address-ordered AVL tree of range-allocation blocks
//!
//! Nodes are owned by an arena and linked by index. Every node carries the
//! largest available (free) block size of its subtree, so the best-fit
//! search can prune whole subtrees that cannot satisfy a request.

use crate::align_up;

pub(crate) type NodeId = u32;
pub(crate) type NodeRef = Option<NodeId>;

/// Payload of one contiguous byte range `[addr, addr + size)`
#[derive(Debug)]
pub(crate) struct BlockData<M> {
    pub addr: u64,
    pub size: u64,
    pub used: bool,
    pub meta: Option<M>,
}

impl<M> BlockData<M> {
    pub fn end(&self) -> u64 {
        self.addr + self.size
    }

    fn avail(&self) -> u64 {
        if self.used {
            0
        } else {
            self.size
        }
    }
}

struct Node<M> {
    data: BlockData<M>,
    max_avail: u64,
    height: u8,
    left: NodeRef,
    right: NodeRef,
}

/// Arena-backed AVL tree ordered by block base address
pub(crate) struct Tree<M> {
    nodes: Vec<Node<M>>,
    /// arena slots available for reuse; stale payloads are never reachable
    free_slots: Vec<NodeId>,
    root: NodeRef,
}

impl<M> Tree<M> {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free_slots: Vec::new(),
            root: None,
        }
    }

    /// Grow the arena ahead of tree mutations so node storage can never be
    /// claimed while a structural operation is underway
    pub fn reserve(&mut self, additional: usize) {
        let spare = self.free_slots.len() + (self.nodes.capacity() - self.nodes.len());
        if spare < additional {
            self.nodes.reserve(additional - spare);
        }
    }

    pub fn data(&self, id: NodeId) -> &BlockData<M> {
        &self.nodes[id as usize].data
    }

    pub fn data_mut(&mut self, id: NodeId) -> &mut BlockData<M> {
        &mut self.nodes[id as usize].data
    }

    fn height(&self, subtree: NodeRef) -> u8 {
        subtree.map_or(0, |id| self.nodes[id as usize].height)
    }

    fn max_avail(&self, subtree: NodeRef) -> u64 {
        subtree.map_or(0, |id| self.nodes[id as usize].max_avail)
    }

    /// Recompute height and subtree max-avail from the children
    fn update(&mut self, id: NodeId) {
        let left = self.nodes[id as usize].left;
        let right = self.nodes[id as usize].right;
        let height = 1 + self.height(left).max(self.height(right));
        let max_avail = self.nodes[id as usize]
            .data
            .avail()
            .max(self.max_avail(left))
            .max(self.max_avail(right));
        let node = &mut self.nodes[id as usize];
        node.height = height;
        node.max_avail = max_avail;
    }

    fn rotate_right(&mut self, id: NodeId) -> NodeId {
        let l = self.nodes[id as usize].left.unwrap_or(id);
        if l == id {
            return id;
        }
        self.nodes[id as usize].left = self.nodes[l as usize].right;
        self.nodes[l as usize].right = Some(id);
        self.update(id);
        self.update(l);
        l
    }

    fn rotate_left(&mut self, id: NodeId) -> NodeId {
        let r = self.nodes[id as usize].right.unwrap_or(id);
        if r == id {
            return id;
        }
        self.nodes[id as usize].right = self.nodes[r as usize].left;
        self.nodes[r as usize].left = Some(id);
        self.update(id);
        self.update(r);
        r
    }

    fn rebalance(&mut self, id: NodeId) -> NodeId {
        self.update(id);
        let left = self.nodes[id as usize].left;
        let right = self.nodes[id as usize].right;
        let balance = self.height(left) as i16 - self.height(right) as i16;

        if balance > 1 {
            if let Some(l) = left {
                if self.height(self.nodes[l as usize].left)
                    < self.height(self.nodes[l as usize].right)
                {
                    let new_left = self.rotate_left(l);
                    self.nodes[id as usize].left = Some(new_left);
                }
            }
            self.rotate_right(id)
        } else if balance < -1 {
            if let Some(r) = right {
                if self.height(self.nodes[r as usize].right)
                    < self.height(self.nodes[r as usize].left)
                {
                    let new_right = self.rotate_right(r);
                    self.nodes[id as usize].right = Some(new_right);
                }
            }
            self.rotate_left(id)
        } else {
            id
        }
    }

    fn new_node(&mut self, data: BlockData<M>) -> NodeId {
        let node = Node {
            max_avail: data.avail(),
            data,
            height: 1,
            left: None,
            right: None,
        };
        match self.free_slots.pop() {
            Some(id) => {
                self.nodes[id as usize] = node;
                id
            }
            None => {
                self.nodes.push(node);
                (self.nodes.len() - 1) as NodeId
            }
        }
    }

    /// Insert a block; base addresses are unique because blocks never overlap
    pub fn insert(&mut self, data: BlockData<M>) -> NodeId {
        let id = self.new_node(data);
        self.root = Some(self.insert_at(self.root, id));
        id
    }

    fn insert_at(&mut self, subtree: NodeRef, id: NodeId) -> NodeId {
        let Some(cur) = subtree else {
            return id;
        };
        if self.nodes[id as usize].data.addr < self.nodes[cur as usize].data.addr {
            let new_left = self.insert_at(self.nodes[cur as usize].left, id);
            self.nodes[cur as usize].left = Some(new_left);
        } else {
            let new_right = self.insert_at(self.nodes[cur as usize].right, id);
            self.nodes[cur as usize].right = Some(new_right);
        }
        self.rebalance(cur)
    }

    /// Remove the block with the given base address and return its payload
    pub fn remove(&mut self, addr: u64) -> Option<BlockData<M>> {
        let mut removed = None;
        self.root = self.remove_at(self.root, addr, &mut removed);
        removed
    }

    fn remove_at(
        &mut self,
        subtree: NodeRef,
        addr: u64,
        removed: &mut Option<BlockData<M>>,
    ) -> NodeRef {
        let cur = subtree?;
        let cur_addr = self.nodes[cur as usize].data.addr;
        if addr < cur_addr {
            let new_left = self.remove_at(self.nodes[cur as usize].left, addr, removed);
            self.nodes[cur as usize].left = new_left;
            Some(self.rebalance(cur))
        } else if addr > cur_addr {
            let new_right = self.remove_at(self.nodes[cur as usize].right, addr, removed);
            self.nodes[cur as usize].right = new_right;
            Some(self.rebalance(cur))
        } else {
            let left = self.nodes[cur as usize].left;
            let right = self.nodes[cur as usize].right;
            match (left, right) {
                (None, None) => {
                    *removed = Some(self.take_payload(cur));
                    self.free_slots.push(cur);
                    None
                }
                (Some(child), None) | (None, Some(child)) => {
                    *removed = Some(self.take_payload(cur));
                    self.free_slots.push(cur);
                    Some(child)
                }
                (Some(_), Some(r)) => {
                    // replace the payload with the in-order successor's
                    let mut successor = None;
                    let new_right = self.remove_min(r, &mut successor);
                    self.nodes[cur as usize].right = new_right;
                    if let Some(successor) = successor {
                        let old =
                            core::mem::replace(&mut self.nodes[cur as usize].data, successor);
                        *removed = Some(old);
                    }
                    Some(self.rebalance(cur))
                }
            }
        }
    }

    fn remove_min(&mut self, subtree: NodeId, out: &mut Option<BlockData<M>>) -> NodeRef {
        match self.nodes[subtree as usize].left {
            Some(left) => {
                let new_left = self.remove_min(left, out);
                self.nodes[subtree as usize].left = new_left;
                Some(self.rebalance(subtree))
            }
            None => {
                let right = self.nodes[subtree as usize].right;
                *out = Some(self.take_payload(subtree));
                self.free_slots.push(subtree);
                right
            }
        }
    }

    fn take_payload(&mut self, id: NodeId) -> BlockData<M> {
        core::mem::replace(
            &mut self.nodes[id as usize].data,
            BlockData {
                addr: 0,
                size: 0,
                used: true,
                meta: None,
            },
        )
    }

    /// Block whose range contains `addr`, if any
    pub fn find_by_address(&self, addr: u64) -> Option<NodeId> {
        let mut cur = self.root;
        while let Some(id) = cur {
            let data = &self.nodes[id as usize].data;
            if addr < data.addr {
                cur = self.nodes[id as usize].left;
            } else if addr >= data.end() {
                cur = self.nodes[id as usize].right;
            } else {
                return Some(id);
            }
        }
        None
    }

    /// Block with the lowest base address `>= addr`, if any
    pub fn ceiling(&self, addr: u64) -> Option<NodeId> {
        let mut cur = self.root;
        let mut best = None;
        while let Some(id) = cur {
            if self.nodes[id as usize].data.addr >= addr {
                best = Some(id);
                cur = self.nodes[id as usize].left;
            } else {
                cur = self.nodes[id as usize].right;
            }
        }
        best
    }

    /// Best-fit search: the smallest free block that can hold `size` bytes
    /// aligned to `1 << align_log2`, ties broken by lowest base address.
    /// Returns the block and the aligned allocation address within it.
    pub fn best_fit(&self, size: u64, align_log2: u8) -> Option<(NodeId, u64)> {
        let mut best: Option<(u64, u64, NodeId, u64)> = None;
        self.best_fit_in(self.root, size, align_log2, &mut best);
        best.map(|(_, _, id, aligned)| (id, aligned))
    }

    fn best_fit_in(
        &self,
        subtree: NodeRef,
        size: u64,
        align_log2: u8,
        best: &mut Option<(u64, u64, NodeId, u64)>,
    ) {
        let Some(cur) = subtree else {
            return;
        };
        if self.nodes[cur as usize].max_avail < size {
            return;
        }
        self.best_fit_in(self.nodes[cur as usize].left, size, align_log2, best);
        let data = &self.nodes[cur as usize].data;
        if !data.used {
            if let Some(aligned) = fits(data, size, align_log2) {
                let candidate = (data.size, data.addr, cur, aligned);
                let better = match best {
                    None => true,
                    Some((best_size, best_addr, _, _)) => {
                        (data.size, data.addr) < (*best_size, *best_addr)
                    }
                };
                if better {
                    *best = Some(candidate);
                }
            }
        }
        self.best_fit_in(self.nodes[cur as usize].right, size, align_log2, best);
    }

    /// In-order traversal over all blocks
    pub fn for_each(&self, f: &mut impl FnMut(&BlockData<M>)) {
        self.for_each_in(self.root, f);
    }

    fn for_each_in(&self, subtree: NodeRef, f: &mut impl FnMut(&BlockData<M>)) {
        let Some(cur) = subtree else {
            return;
        };
        self.for_each_in(self.nodes[cur as usize].left, f);
        f(&self.nodes[cur as usize].data);
        self.for_each_in(self.nodes[cur as usize].right, f);
    }
}

/// Aligned allocation address within a free block, if the request fits
fn fits<M>(data: &BlockData<M>, size: u64, align_log2: u8) -> Option<u64> {
    let aligned = align_up(data.addr, align_log2)?;
    let end = aligned.checked_add(size)?;
    (aligned >= data.addr && end <= data.end()).then_some(aligned)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(addr: u64, size: u64, used: bool) -> BlockData<()> {
        BlockData {
            addr,
            size,
            used,
            meta: None,
        }
    }

    fn addresses(tree: &Tree<()>) -> Vec<u64> {
        let mut out = Vec::new();
        tree.for_each(&mut |data| out.push(data.addr));
        out
    }

    #[test]
    fn test_insert_keeps_address_order() {
        let mut tree = Tree::new();
        for addr in [50u64, 10, 90, 30, 70, 20, 80] {
            tree.insert(block(addr * 0x1000, 0x1000, false));
        }
        let addrs = addresses(&tree);
        let mut sorted = addrs.clone();
        sorted.sort_unstable();
        assert_eq!(addrs, sorted);
        assert_eq!(addrs.len(), 7);
    }

    #[test]
    fn test_remove_interior_node() {
        let mut tree = Tree::new();
        for addr in [4u64, 2, 6, 1, 3, 5, 7] {
            tree.insert(block(addr * 0x1000, 0x1000, false));
        }
        let removed = tree.remove(4 * 0x1000).unwrap();
        assert_eq!(removed.addr, 4 * 0x1000);
        assert_eq!(
            addresses(&tree),
            vec![0x1000, 0x2000, 0x3000, 0x5000, 0x6000, 0x7000]
        );
    }

    #[test]
    fn test_find_by_address_covers_range() {
        let mut tree = Tree::new();
        tree.insert(block(0x1000, 0x2000, false));
        tree.insert(block(0x5000, 0x1000, true));

        assert!(tree.find_by_address(0x0fff).is_none());
        let id = tree.find_by_address(0x2fff).unwrap();
        assert_eq!(tree.data(id).addr, 0x1000);
        assert!(tree.find_by_address(0x3000).is_none());
        assert!(tree.find_by_address(0x5000).is_some());
        assert!(tree.find_by_address(0x6000).is_none());
    }

    #[test]
    fn test_best_fit_prefers_smallest_then_lowest() {
        let mut tree = Tree::new();
        tree.insert(block(0x10_000, 0x4000, false));
        tree.insert(block(0x20_000, 0x2000, false));
        tree.insert(block(0x30_000, 0x2000, false));
        tree.insert(block(0x40_000, 0x8000, true));

        // smallest adequate block wins, lowest address breaks the tie
        let (id, aligned) = tree.best_fit(0x1000, 12).unwrap();
        assert_eq!(tree.data(id).addr, 0x20_000);
        assert_eq!(aligned, 0x20_000);

        // only the big free block can hold this
        let (id, _) = tree.best_fit(0x3000, 12).unwrap();
        assert_eq!(tree.data(id).addr, 0x10_000);

        // used blocks never satisfy a request
        assert!(tree.best_fit(0x5000, 12).is_none());
    }

    #[test]
    fn test_best_fit_respects_alignment() {
        let mut tree = Tree::new();
        tree.insert(block(0x1800, 0x1000, false));

        // an aligned sub-block does not fit
        assert!(tree.best_fit(0x1000, 12).is_none());

        // half of it does, starting at the aligned address
        let (_, aligned) = tree.best_fit(0x800, 12).unwrap();
        assert_eq!(aligned, 0x2000);
    }

    #[test]
    fn test_ceiling() {
        let mut tree = Tree::new();
        tree.insert(block(0x2000, 0x1000, false));
        tree.insert(block(0x5000, 0x1000, false));

        assert_eq!(tree.data(tree.ceiling(0).unwrap()).addr, 0x2000);
        assert_eq!(tree.data(tree.ceiling(0x2000).unwrap()).addr, 0x2000);
        assert_eq!(tree.data(tree.ceiling(0x2001).unwrap()).addr, 0x5000);
        assert!(tree.ceiling(0x5001).is_none());
    }

    #[test]
    fn test_slot_reuse_after_removal() {
        let mut tree: Tree<()> = Tree::new();
        for addr in 0..64u64 {
            tree.insert(block(addr * 0x1000, 0x1000, false));
        }
        for addr in 0..32u64 {
            tree.remove(addr * 0x1000).unwrap();
        }
        let len_before = tree.nodes.len();
        for addr in 100..130u64 {
            tree.insert(block(addr * 0x1000, 0x1000, false));
        }
        // freed arena slots were recycled
        assert_eq!(tree.nodes.len(), len_before);
    }
}

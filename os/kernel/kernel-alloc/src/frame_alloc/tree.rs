//! B-tree of free ranges whose nodes live in the frames it manages.
//!
//! The root is stored inline; every other node occupies one frame reached
//! through the physical window. Insertion splits full nodes on the way down
//! and deletion tops up minimal nodes on the way down, so neither ever has to
//! walk back up. New nodes are paid for by a caller-supplied frame source and
//! nodes emptied by merges are handed back through a callback.

use super::node::{MAX_KEYS, MIN_DEGREE, MIN_KEYS, Node};
use super::range_key::RangeKey;
use crate::error::{AllocatorInvariantViolation as Violation, violation};
use kernel_memory_addresses::{PhysicalPage, Size4K};
use kernel_vmem::PhysMapper;
use log::trace;

/// Deepest tree the allocator supports. With 128-way fan-out six levels
/// index far more ranges than a 52-bit address space can hold.
pub const MAX_DEPTH: u8 = 6;

pub struct RangeTree {
    root: Node,
    /// Levels including the root.
    depth: u8,
    /// Frames holding non-root nodes.
    nodes: u64,
}

/// Borrow the node stored in `frame`.
#[inline]
fn node_at<'a, M: PhysMapper>(mapper: &M, frame: PhysicalPage<Size4K>) -> &'a mut Node {
    debug_assert!(mapper.reaches(frame), "tree node {frame:?} outside the physical window");
    // SAFETY: node frames are taken out of the free pool, so nothing else
    // references them, and they are reset before first use.
    unsafe { mapper.phys_to_mut::<Node>(frame.base()) }
}

#[inline]
fn frame_of(raw: u64) -> PhysicalPage<Size4K> {
    PhysicalPage::from_number(raw >> 12)
}

impl RangeTree {
    pub const fn new() -> Self {
        Self {
            root: Node::empty_leaf(),
            depth: 1,
            nodes: 0,
        }
    }

    #[inline]
    pub const fn depth(&self) -> u8 {
        self.depth
    }

    #[inline]
    pub const fn node_frames(&self) -> u64 {
        self.nodes
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.root.len() == 0
    }

    /// Frames one insertion may consume: one per level below the root plus
    /// two for a root split, with one level of headroom for the new root.
    #[inline]
    pub const fn split_budget(&self) -> u64 {
        self.depth as u64 + 2
    }

    pub fn contains<M: PhysMapper>(&self, mapper: &M, key: RangeKey) -> bool {
        let mut node = &self.root;
        loop {
            match node.search(key) {
                Ok(_) => return true,
                Err(_) if node.is_leaf() => return false,
                Err(i) => node = node_at(mapper, node.child(i)),
            }
        }
    }

    /// Smallest key `>= lower`.
    pub fn ceiling<M: PhysMapper>(&self, mapper: &M, lower: RangeKey) -> Option<RangeKey> {
        let mut node = &self.root;
        let mut best = None;
        loop {
            match node.search(lower) {
                Ok(i) => return Some(node.key(i)),
                Err(i) => {
                    if i < node.len() {
                        best = Some(node.key(i));
                    }
                    if node.is_leaf() {
                        return best;
                    }
                    node = node_at(mapper, node.child(i));
                }
            }
        }
    }

    /// The largest range (highest key).
    pub fn max<M: PhysMapper>(&self, mapper: &M) -> Option<RangeKey> {
        let mut node = &self.root;
        while !node.is_leaf() {
            node = node_at(mapper, node.child(node.len()));
        }
        node.keys().last().copied()
    }

    /// Insert `key`, taking frames for new nodes from `spare`.
    ///
    /// The caller guarantees `spare` can deliver [`split_budget`](Self::split_budget)
    /// frames. An existing equal key means the range is already free.
    pub fn insert<M, S>(&mut self, mapper: &M, key: RangeKey, mut spare: S)
    where
        M: PhysMapper,
        S: FnMut() -> PhysicalPage<Size4K>,
    {
        if self.root.is_full() {
            self.split_root(mapper, &mut spare);
        }

        let mut node = &mut self.root;
        loop {
            let mut i = match node.search(key) {
                Ok(_) => violation(Violation::DoubleFree(key.base())),
                Err(i) => i,
            };
            if node.is_leaf() {
                if node.is_full() {
                    violation(Violation::NodeOverflow);
                }
                node.insert_entry(i, key, 0);
                return;
            }

            if node_at(mapper, node.child(i)).is_full() {
                let frame = spare();
                self.nodes += 1;
                split_child(mapper, node, i, frame);
                match key.cmp(&node.key(i)) {
                    core::cmp::Ordering::Greater => i += 1,
                    core::cmp::Ordering::Equal => violation(Violation::DoubleFree(key.base())),
                    core::cmp::Ordering::Less => {}
                }
            }
            node = node_at(mapper, node.child(i));
        }
    }

    /// Move the full root's halves into two new nodes, leaving the median.
    fn split_root<M, S>(&mut self, mapper: &M, spare: &mut S)
    where
        M: PhysMapper,
        S: FnMut() -> PhysicalPage<Size4K>,
    {
        if self.depth >= MAX_DEPTH {
            violation(Violation::DepthExceeded(MAX_DEPTH));
        }
        let left_frame = spare();
        let right_frame = spare();
        let left = node_at(mapper, left_frame);
        let right = node_at(mapper, right_frame);

        self.root.move_tail(MIN_DEGREE, right);
        let (median, _) = self.root.pop();
        left.copy_from(&self.root);

        self.root.reset(false);
        self.root.set_child(0, left_frame);
        self.root.push(median, right_frame.base().as_u64());

        self.depth += 1;
        self.nodes += 2;
        trace!("free-range tree root split, depth {}", self.depth);
    }

    /// Remove `key`; `false` if it is not in the tree.
    ///
    /// Frames of nodes emptied by merges are passed to `released`.
    pub fn remove<M, R>(&mut self, mapper: &M, key: RangeKey, mut released: R) -> bool
    where
        M: PhysMapper,
        R: FnMut(PhysicalPage<Size4K>),
    {
        let mut key = key;
        let mut at_root = true;
        let mut node = &mut self.root;
        loop {
            match node.search(key) {
                Ok(i) if node.is_leaf() => {
                    node.remove_entry(i);
                    return true;
                }
                Err(_) if node.is_leaf() => return false,
                Ok(i) => {
                    let left = node_at(mapper, node.child(i));
                    let right = node_at(mapper, node.child(i + 1));
                    if left.len() > MIN_KEYS {
                        let pred = subtree_max(mapper, left);
                        node.set_key(i, pred);
                        key = pred;
                        node = left;
                        at_root = false;
                    } else if right.len() > MIN_KEYS {
                        let succ = subtree_min(mapper, right);
                        node.set_key(i, succ);
                        key = succ;
                        node = right;
                        at_root = false;
                    } else {
                        merge_children(mapper, node, i, &mut released);
                        self.nodes -= 1;
                        if at_root && node.len() == 0 {
                            collapse_root(mapper, node, &mut released);
                            self.nodes -= 1;
                            self.depth -= 1;
                        } else {
                            node = left;
                            at_root = false;
                        }
                    }
                }
                Err(mut i) => {
                    if node_at(mapper, node.child(i)).len() <= MIN_KEYS {
                        i = fill_child(mapper, node, i, &mut released, &mut self.nodes);
                        if at_root && node.len() == 0 {
                            collapse_root(mapper, node, &mut released);
                            self.nodes -= 1;
                            self.depth -= 1;
                            continue;
                        }
                    }
                    node = node_at(mapper, node.child(i));
                    at_root = false;
                }
            }
        }
    }

    /// Visit every key in order.
    pub fn for_each<M: PhysMapper>(&self, mapper: &M, f: &mut impl FnMut(RangeKey)) {
        walk(mapper, &self.root, f);
    }

    /// Audit ordering, occupancy and uniform leaf depth. Returns the number
    /// of keys.
    pub fn check<M: PhysMapper>(&self, mapper: &M) -> usize {
        check_node(mapper, &self.root, None, None, 1, self.depth, true)
    }
}

/// Split the full child `i` of `parent` using `frame` for its upper half.
fn split_child<M: PhysMapper>(mapper: &M, parent: &mut Node, i: usize, frame: PhysicalPage<Size4K>) {
    let child = node_at(mapper, parent.child(i));
    let right = node_at(mapper, frame);
    child.move_tail(MIN_DEGREE, right);
    let (median, _) = child.pop();
    parent.insert_entry(i, median, frame.base().as_u64());
    trace!("free-range tree node split into {frame:?}");
}

/// Fold child `i + 1` and separator `i` into child `i` and release the
/// right node's frame.
fn merge_children<M, R>(mapper: &M, parent: &mut Node, i: usize, released: &mut R)
where
    M: PhysMapper,
    R: FnMut(PhysicalPage<Size4K>),
{
    let left = node_at(mapper, parent.child(i));
    let right = node_at(mapper, parent.child(i + 1));
    debug_assert!(left.len() + right.len() < MAX_KEYS);

    let (separator, right_raw) = parent.remove_entry(i);
    left.push(separator, right.raw_child(0));
    for j in 0..right.len() {
        left.push(right.key(j), right.raw_child(j + 1));
    }
    trace!("free-range tree nodes merged, releasing {:#x}", right_raw);
    released(frame_of(right_raw));
}

/// The root lost its last key: pull its only child up into it.
fn collapse_root<M, R>(mapper: &M, root: &mut Node, released: &mut R)
where
    M: PhysMapper,
    R: FnMut(PhysicalPage<Size4K>),
{
    let only = root.child(0);
    root.copy_from(node_at(mapper, only));
    released(only);
    trace!("free-range tree lost a level");
}

/// Give child `i` at least `t` keys by borrowing from a sibling or merging.
/// Returns the index of the child that now covers the searched key range.
fn fill_child<M, R>(mapper: &M, parent: &mut Node, i: usize, released: &mut R, nodes: &mut u64) -> usize
where
    M: PhysMapper,
    R: FnMut(PhysicalPage<Size4K>),
{
    let child = node_at(mapper, parent.child(i));

    if i > 0 {
        let left = node_at(mapper, parent.child(i - 1));
        if left.len() > MIN_KEYS {
            let (key, grandchild) = left.pop();
            child.insert_front(parent.key(i - 1), grandchild);
            parent.set_key(i - 1, key);
            return i;
        }
    }
    if i < parent.len() {
        let right = node_at(mapper, parent.child(i + 1));
        if right.len() > MIN_KEYS {
            let (key, grandchild) = right.remove_front();
            child.push(parent.key(i), grandchild);
            parent.set_key(i, key);
            return i;
        }
        merge_children(mapper, parent, i, released);
        *nodes -= 1;
        return i;
    }
    merge_children(mapper, parent, i - 1, released);
    *nodes -= 1;
    i - 1
}

fn subtree_max<M: PhysMapper>(mapper: &M, mut node: &Node) -> RangeKey {
    while !node.is_leaf() {
        node = node_at(mapper, node.child(node.len()));
    }
    node.key(node.len() - 1)
}

fn subtree_min<M: PhysMapper>(mapper: &M, mut node: &Node) -> RangeKey {
    while !node.is_leaf() {
        node = node_at(mapper, node.child(0));
    }
    node.key(0)
}

fn walk<M: PhysMapper>(mapper: &M, node: &Node, f: &mut impl FnMut(RangeKey)) {
    for i in 0..node.len() {
        if !node.is_leaf() {
            walk(mapper, node_at(mapper, node.child(i)), f);
        }
        f(node.key(i));
    }
    if !node.is_leaf() {
        walk(mapper, node_at(mapper, node.child(node.len())), f);
    }
}

fn check_node<M: PhysMapper>(
    mapper: &M,
    node: &Node,
    low: Option<RangeKey>,
    high: Option<RangeKey>,
    level: u8,
    depth: u8,
    is_root: bool,
) -> usize {
    let keys = node.keys();
    if keys.windows(2).any(|w| w[0] >= w[1]) {
        violation(Violation::CorruptTree("keys out of order"));
    }
    if keys.iter().any(|k| low.is_some_and(|l| *k <= l) || high.is_some_and(|h| *k >= h)) {
        violation(Violation::CorruptTree("key outside its parent's bounds"));
    }
    if !is_root && keys.len() < MIN_KEYS {
        violation(Violation::CorruptTree("underfull node"));
    }
    if node.is_leaf() != (level == depth) {
        violation(Violation::CorruptTree("leaves at different depths"));
    }

    let mut count = keys.len();
    if !node.is_leaf() {
        for i in 0..=keys.len() {
            let lo = if i == 0 { low } else { Some(keys[i - 1]) };
            let hi = if i == keys.len() { high } else { Some(keys[i]) };
            count += check_node(mapper, node_at(mapper, node.child(i)), lo, hi, level + 1, depth, false);
        }
    }
    count
}

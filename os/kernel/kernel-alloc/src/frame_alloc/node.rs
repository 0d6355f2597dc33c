//! One page-sized node of the free-range tree.

use super::range_key::RangeKey;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// Keys per node. Odd, so a full node has a single median.
pub const MAX_KEYS: usize = 255;

/// Minimum degree `t`: non-root nodes keep at least `t - 1` keys.
pub const MIN_DEGREE: usize = MAX_KEYS.div_ceil(2);

pub const MIN_KEYS: usize = MIN_DEGREE - 1;

/// `used` keys in ascending order; inner nodes also hold `used + 1` child
/// frames in `children`. Slots past `used` are stale.
#[repr(C, align(4096))]
pub struct Node {
    used: u16,
    leaf: u8,
    _pad: [u8; 5],
    keys: [RangeKey; MAX_KEYS],
    children: [u64; MAX_KEYS + 1],
}

const _: () = assert!(size_of::<Node>() == 4096);
const _: () = assert!(MAX_KEYS % 2 == 1 && MIN_KEYS * 2 + 1 == MAX_KEYS);

impl Node {
    pub const fn empty_leaf() -> Self {
        Self {
            used: 0,
            leaf: 1,
            _pad: [0; 5],
            keys: [RangeKey::new(); MAX_KEYS],
            children: [0; MAX_KEYS + 1],
        }
    }

    /// Turn whatever the frame held into an empty node.
    pub fn reset(&mut self, leaf: bool) {
        self.used = 0;
        self.leaf = u8::from(leaf);
    }

    #[inline]
    pub const fn len(&self) -> usize {
        self.used as usize
    }

    #[inline]
    pub const fn is_leaf(&self) -> bool {
        self.leaf != 0
    }

    #[inline]
    pub const fn is_full(&self) -> bool {
        self.len() == MAX_KEYS
    }

    #[inline]
    pub fn keys(&self) -> &[RangeKey] {
        &self.keys[..self.len()]
    }

    #[inline]
    pub fn key(&self, i: usize) -> RangeKey {
        self.keys()[i]
    }

    #[inline]
    pub fn set_key(&mut self, i: usize, key: RangeKey) {
        debug_assert!(i < self.len());
        self.keys[i] = key;
    }

    #[inline]
    pub fn child(&self, i: usize) -> PhysicalPage<Size4K> {
        debug_assert!(!self.is_leaf() && i <= self.len());
        PhysicalPage::containing(PhysicalAddress::new(self.children[i]))
    }

    #[inline]
    pub fn set_child(&mut self, i: usize, frame: PhysicalPage<Size4K>) {
        self.children[i] = frame.base().as_u64();
    }

    /// `Ok(i)` if `key` is at `i`, otherwise `Err(i)` with the child to descend into.
    #[inline]
    pub fn search(&self, key: RangeKey) -> Result<usize, usize> {
        self.keys().binary_search(&key)
    }

    /// Insert `key` at `i` and `right` as the child following it.
    pub fn insert_entry(&mut self, i: usize, key: RangeKey, right: u64) {
        let n = self.len();
        debug_assert!(n < MAX_KEYS && i <= n);
        self.keys.copy_within(i..n, i + 1);
        self.children.copy_within(i + 1..=n, i + 2);
        self.keys[i] = key;
        self.children[i + 1] = right;
        self.used += 1;
    }

    /// Insert `key` in front, with `left` as the new first child.
    pub fn insert_front(&mut self, key: RangeKey, left: u64) {
        let n = self.len();
        debug_assert!(n < MAX_KEYS);
        self.keys.copy_within(0..n, 1);
        self.children.copy_within(0..=n, 1);
        self.keys[0] = key;
        self.children[0] = left;
        self.used += 1;
    }

    /// Append `key` with `right` as the new last child.
    pub fn push(&mut self, key: RangeKey, right: u64) {
        let n = self.len();
        debug_assert!(n < MAX_KEYS);
        self.keys[n] = key;
        self.children[n + 1] = right;
        self.used += 1;
    }

    /// Remove key `i` and the child following it.
    pub fn remove_entry(&mut self, i: usize) -> (RangeKey, u64) {
        let n = self.len();
        let removed = (self.keys[i], self.children[i + 1]);
        self.keys.copy_within(i + 1..n, i);
        self.children.copy_within(i + 2..=n, i + 1);
        self.used -= 1;
        removed
    }

    /// Remove the first key and the first child.
    pub fn remove_front(&mut self) -> (RangeKey, u64) {
        let n = self.len();
        let removed = (self.keys[0], self.children[0]);
        self.keys.copy_within(1..n, 0);
        self.children.copy_within(1..=n, 0);
        self.used -= 1;
        removed
    }

    /// Remove the last key and the last child.
    pub fn pop(&mut self) -> (RangeKey, u64) {
        let n = self.len();
        self.used -= 1;
        (self.keys[n - 1], self.children[n])
    }

    #[inline]
    pub const fn raw_child(&self, i: usize) -> u64 {
        self.children[i]
    }

    /// Move keys and children from `first_key` on into the empty node `dst`.
    pub fn move_tail(&mut self, first_key: usize, dst: &mut Self) {
        let n = self.len();
        let count = n - first_key;
        dst.keys[..count].copy_from_slice(&self.keys[first_key..n]);
        dst.children[..=count].copy_from_slice(&self.children[first_key..=n]);
        dst.used = count as u16;
        dst.leaf = self.leaf;
        self.used = first_key as u16;
    }

    /// Replace this node's contents with `src`'s.
    pub fn copy_from(&mut self, src: &Self) {
        let n = src.len();
        self.keys[..n].copy_from_slice(src.keys());
        self.children[..=n].copy_from_slice(&src.children[..=n]);
        self.used = src.used;
        self.leaf = src.leaf;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn k(page: u64) -> RangeKey {
        RangeKey::of(page, 0)
    }

    #[test]
    fn degree_constants() {
        assert_eq!(MIN_DEGREE, 128);
        assert_eq!(MIN_KEYS, 127);
    }

    #[test]
    fn entries_keep_children_aligned() {
        let mut n = Box::new(Node::empty_leaf());
        n.reset(false);
        n.children[0] = 100;
        n.push(k(10), 110);
        n.push(k(30), 130);
        n.insert_entry(1, k(20), 120);
        n.insert_front(k(5), 95);

        assert_eq!(n.keys(), &[k(5), k(10), k(20), k(30)]);
        assert_eq!(&n.children[..5], &[95, 100, 110, 120, 130]);
        assert_eq!(n.search(k(20)), Ok(2));
        assert_eq!(n.search(k(25)), Err(3));

        assert_eq!(n.remove_entry(1), (k(10), 110));
        assert_eq!(n.remove_front(), (k(5), 95));
        assert_eq!(n.pop(), (k(30), 130));
        assert_eq!(n.keys(), &[k(20)]);
        assert_eq!(&n.children[..2], &[100, 120]);
    }

    #[test]
    fn move_tail_splits_at_the_median() {
        let mut a = Box::new(Node::empty_leaf());
        let mut b = Box::new(Node::empty_leaf());
        for p in 0..MAX_KEYS as u64 {
            a.push(k(p), 0);
        }
        assert!(a.is_full());

        a.move_tail(MIN_DEGREE, &mut b);
        let median = a.pop().0;
        assert_eq!(median, k(MIN_KEYS as u64));
        assert_eq!(a.len(), MIN_KEYS);
        assert_eq!(b.len(), MIN_KEYS);
        assert!(b.is_leaf());
        assert_eq!(b.key(0), k(MIN_DEGREE as u64));
    }
}

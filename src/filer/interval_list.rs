//! Sorted, non-overlapping `[start, stop)` intervals with two insert policies.
//!
//! Nodes live in an arena and link to each other by index, bracketed by a head
//! and a tail sentinel. Splitting a node clones its value and trims the clone
//! through [`IntervalValue::set_start_stop`], so no two intervals ever share a
//! value.

use parking_lot::RwLock;

/// Payload stored in an [`IntervalList`]. It is told whenever the range it
/// covers shrinks.
pub trait IntervalValue: Clone {
    fn set_start_stop(&mut self, start: i64, stop: i64);
}

/// Value copy of one interval in the list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interval<T> {
    pub start_offset: i64,
    pub stop_offset: i64,
    pub ts_ns: i64,
    pub value: T,
}

impl<T> Interval<T> {
    pub fn size(&self) -> i64 {
        self.stop_offset - self.start_offset
    }
}

const HEAD: usize = 0;
const TAIL: usize = 1;

#[derive(Debug)]
struct Node<T> {
    start: i64,
    stop: i64,
    ts_ns: i64,
    /// `None` for the sentinels and for freed slots.
    value: Option<T>,
    prev: usize,
    next: usize,
}

#[derive(Debug)]
struct Arena<T> {
    nodes: Vec<Node<T>>,
    free: Vec<usize>,
    len: usize,
}

impl<T: IntervalValue> Arena<T> {
    fn new() -> Self {
        let head = Node {
            start: -1,
            stop: -1,
            ts_ns: 0,
            value: None,
            prev: HEAD,
            next: TAIL,
        };
        let tail = Node {
            start: i64::MAX,
            stop: i64::MAX,
            ts_ns: 0,
            value: None,
            prev: HEAD,
            next: TAIL,
        };
        Self {
            nodes: vec![head, tail],
            free: Vec::new(),
            len: 0,
        }
    }

    fn alloc(&mut self, start: i64, stop: i64, ts_ns: i64, value: T) -> usize {
        let node = Node {
            start,
            stop,
            ts_ns,
            value: Some(value),
            prev: HEAD,
            next: TAIL,
        };
        self.len += 1;
        match self.free.pop() {
            Some(i) => {
                self.nodes[i] = node;
                i
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    fn release(&mut self, i: usize) {
        self.nodes[i].value = None;
        self.free.push(i);
        self.len -= 1;
    }

    fn link_between(&mut self, a: usize, n: usize, b: usize) {
        self.nodes[a].next = n;
        self.nodes[n].prev = a;
        self.nodes[n].next = b;
        self.nodes[b].prev = n;
    }

    /// Unlinks and frees `n`, returning the node that followed it.
    fn remove(&mut self, n: usize) -> usize {
        let (prev, next) = (self.nodes[n].prev, self.nodes[n].next);
        self.nodes[prev].next = next;
        self.nodes[next].prev = prev;
        self.release(n);
        next
    }

    /// Sets a node's range and tells its value.
    fn set_range(&mut self, n: usize, start: i64, stop: i64) {
        let node = &mut self.nodes[n];
        node.start = start;
        node.stop = stop;
        if let Some(v) = node.value.as_mut() {
            v.set_start_stop(start, stop);
        }
    }

    /// Clone of node `n`'s value trimmed to `[start, stop)`, as a new node.
    fn split_off(&mut self, n: usize, start: i64, stop: i64) -> Option<usize> {
        let ts_ns = self.nodes[n].ts_ns;
        let mut value = self.nodes[n].value.clone()?;
        value.set_start_stop(start, stop);
        Some(self.alloc(start, stop, ts_ns, value))
    }

    fn snapshot(&self, n: usize) -> Option<Interval<T>> {
        let node = &self.nodes[n];
        node.value.as_ref().map(|v| Interval {
            start_offset: node.start,
            stop_offset: node.stop,
            ts_ns: node.ts_ns,
            value: v.clone(),
        })
    }

    fn overlay(&mut self, start: i64, stop: i64, ts_ns: i64, value: T) {
        let mut p = HEAD;
        while self.nodes[p].next != TAIL && self.nodes[self.nodes[p].next].stop <= start {
            p = self.nodes[p].next;
        }
        let mut q = TAIL;
        while self.nodes[q].prev != HEAD && self.nodes[self.nodes[q].prev].start >= stop {
            q = self.nodes[q].prev;
        }

        // everything strictly between p and q overlaps [start, stop)
        let first = self.nodes[p].next;
        let last = self.nodes[q].prev;
        let left = if first != q && self.nodes[first].start < start {
            self.split_off(first, self.nodes[first].start, start)
        } else {
            None
        };
        let right = if last != p && stop < self.nodes[last].stop {
            self.split_off(last, stop, self.nodes[last].stop)
        } else {
            None
        };

        let mut cur = first;
        while cur != q {
            let next = self.nodes[cur].next;
            self.release(cur);
            cur = next;
        }

        let new = self.alloc(start, stop, ts_ns, value);
        let mut before = p;
        if let Some(l) = left {
            self.link_between(before, l, q);
            before = l;
        }
        self.link_between(before, new, q);
        if let Some(r) = right {
            self.link_between(new, r, q);
        }
    }

    fn insert(&mut self, start: i64, stop: i64, ts_ns: i64, value: T) {
        let iv = self.alloc(start, stop, ts_ns, value);
        let mut prev = HEAD;
        let mut next = self.nodes[HEAD].next;

        loop {
            if next == TAIL {
                self.link_between(prev, iv, TAIL);
                return;
            }
            let (iv_start, iv_stop) = (self.nodes[iv].start, self.nodes[iv].stop);
            let (next_start, next_stop) = (self.nodes[next].start, self.nodes[next].stop);

            if iv_stop <= next_start {
                self.link_between(prev, iv, next);
                return;
            }
            if next_stop <= iv_start {
                prev = next;
                next = self.nodes[next].next;
                continue;
            }

            if self.nodes[iv].ts_ns >= self.nodes[next].ts_ns {
                // incoming wins the overlap
                if next_start < iv_start
                    && let Some(t) = self.split_off(next, next_start, iv_start)
                {
                    self.link_between(prev, t, next);
                    self.set_range(next, iv_start, next_stop);
                    prev = t;
                }
                if iv_stop < next_stop {
                    self.set_range(next, iv_stop, next_stop);
                    self.link_between(prev, iv, next);
                    return;
                }
                next = self.remove(next);
            } else {
                // existing wins; keep whatever of the incoming range lies outside it
                if iv_start < next_start
                    && let Some(t) = self.split_off(iv, iv_start, next_start)
                {
                    self.link_between(prev, t, next);
                    self.set_range(iv, next_start, iv_stop);
                }
                if next_stop < iv_stop {
                    self.set_range(iv, next_stop, iv_stop);
                    prev = next;
                    next = self.nodes[next].next;
                } else {
                    self.release(iv);
                    return;
                }
            }
        }
    }
}

/// Thread-safe list of non-overlapping intervals sorted by start offset.
#[derive(Debug)]
pub struct IntervalList<T> {
    inner: RwLock<Arena<T>>,
}

impl<T: IntervalValue> Default for IntervalList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: IntervalValue> IntervalList<T> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Arena::new()),
        }
    }

    /// Puts `value` over `[start, stop)` regardless of timestamps. Partially
    /// covered neighbours keep their uncovered remainder.
    pub fn overlay(&self, start: i64, stop: i64, ts_ns: i64, mut value: T) {
        if start >= stop {
            return;
        }
        value.set_start_stop(start, stop);
        self.inner.write().overlay(start, stop, ts_ns, value);
    }

    /// Inserts `value` over `[start, stop)` where it is at least as new as
    /// what is already there. Older parts of the incoming range are dropped.
    pub fn insert_interval(&self, start: i64, stop: i64, ts_ns: i64, mut value: T) {
        if start >= stop {
            return;
        }
        value.set_start_stop(start, stop);
        self.inner.write().insert(start, stop, ts_ns, value);
    }

    /// Appends after the last interval. Falls back to [`Self::overlay`] if the
    /// range would overlap it.
    pub fn append_interval(&self, start: i64, stop: i64, ts_ns: i64, mut value: T) {
        if start >= stop {
            return;
        }
        value.set_start_stop(start, stop);
        let mut arena = self.inner.write();
        let last = arena.nodes[TAIL].prev;
        if last != HEAD && arena.nodes[last].stop > start {
            arena.overlay(start, stop, ts_ns, value);
            return;
        }
        let n = arena.alloc(start, stop, ts_ns, value);
        arena.link_between(last, n, TAIL);
    }

    /// Number of real intervals.
    pub fn len(&self) -> usize {
        self.inner.read().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn front(&self) -> Option<Interval<T>> {
        let arena = self.inner.read();
        arena.snapshot(arena.nodes[HEAD].next)
    }

    /// Copies of all intervals in order.
    pub fn intervals(&self) -> Vec<Interval<T>> {
        let arena = self.inner.read();
        let mut out = Vec::with_capacity(arena.len);
        let mut cur = arena.nodes[HEAD].next;
        while cur != TAIL {
            if let Some(iv) = arena.snapshot(cur) {
                out.push(iv);
            }
            cur = arena.nodes[cur].next;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Remembers which write it came from and the range it was trimmed to.
    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Tag {
        id: u32,
        start: i64,
        stop: i64,
    }

    impl Tag {
        fn new(id: u32) -> Self {
            Self {
                id,
                start: 0,
                stop: 0,
            }
        }
    }

    impl IntervalValue for Tag {
        fn set_start_stop(&mut self, start: i64, stop: i64) {
            self.start = start;
            self.stop = stop;
        }
    }

    fn layout(list: &IntervalList<Tag>) -> Vec<(i64, i64, u32)> {
        list.intervals()
            .into_iter()
            .map(|iv| (iv.start_offset, iv.stop_offset, iv.value.id))
            .collect()
    }

    fn assert_well_formed(list: &IntervalList<Tag>) {
        let intervals = list.intervals();
        assert_eq!(intervals.len(), list.len());
        for iv in &intervals {
            assert!(iv.start_offset < iv.stop_offset);
            assert_eq!((iv.value.start, iv.value.stop), (iv.start_offset, iv.stop_offset));
        }
        for pair in intervals.windows(2) {
            assert!(pair[0].stop_offset <= pair[1].start_offset);
        }
    }

    #[test]
    fn test_insert_newer_wins_overlap() {
        let list = IntervalList::new();
        list.insert_interval(0, 100, 1, Tag::new(1));
        list.insert_interval(50, 150, 2, Tag::new(2));
        assert_eq!(layout(&list), vec![(0, 50, 1), (50, 150, 2)]);
        assert_well_formed(&list);
    }

    #[test]
    fn test_insert_older_keeps_existing() {
        let list = IntervalList::new();
        list.insert_interval(0, 100, 1, Tag::new(1));
        list.insert_interval(50, 150, 0, Tag::new(2));
        assert_eq!(layout(&list), vec![(0, 100, 1), (100, 150, 2)]);
        assert_well_formed(&list);
    }

    #[test]
    fn test_insert_older_fully_covered_is_dropped() {
        let list = IntervalList::new();
        list.insert_interval(0, 100, 5, Tag::new(1));
        list.insert_interval(10, 20, 1, Tag::new(2));
        assert_eq!(layout(&list), vec![(0, 100, 1)]);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_insert_older_splits_around_existing() {
        let list = IntervalList::new();
        list.insert_interval(40, 60, 5, Tag::new(1));
        list.insert_interval(0, 100, 1, Tag::new(2));
        assert_eq!(layout(&list), vec![(0, 40, 2), (40, 60, 1), (60, 100, 2)]);
        assert_well_formed(&list);
    }

    #[test]
    fn test_insert_newer_splits_existing() {
        let list = IntervalList::new();
        list.insert_interval(0, 100, 1, Tag::new(1));
        list.insert_interval(40, 60, 5, Tag::new(2));
        assert_eq!(layout(&list), vec![(0, 40, 1), (40, 60, 2), (60, 100, 1)]);
        assert_well_formed(&list);
    }

    #[test]
    fn test_overlay_ignores_timestamps() {
        let list = IntervalList::new();
        list.overlay(0, 100, 5, Tag::new(1));
        list.overlay(25, 75, 1, Tag::new(2));
        assert_eq!(layout(&list), vec![(0, 25, 1), (25, 75, 2), (75, 100, 1)]);
        assert_well_formed(&list);

        // remainders keep their original timestamp
        let ts: Vec<i64> = list.intervals().iter().map(|iv| iv.ts_ns).collect();
        assert_eq!(ts, vec![5, 1, 5]);
    }

    #[test]
    fn test_overlay_spanning_several() {
        let list = IntervalList::new();
        list.overlay(0, 10, 1, Tag::new(1));
        list.overlay(10, 20, 1, Tag::new(2));
        list.overlay(30, 40, 1, Tag::new(3));
        list.overlay(5, 35, 0, Tag::new(4));
        assert_eq!(layout(&list), vec![(0, 5, 1), (5, 35, 4), (35, 40, 3)]);
        assert_well_formed(&list);
    }

    #[test]
    fn test_degenerate_ranges_ignored() {
        let list: IntervalList<Tag> = IntervalList::new();
        list.overlay(5, 5, 1, Tag::new(1));
        list.insert_interval(9, 3, 1, Tag::new(2));
        list.append_interval(1, 1, 1, Tag::new(3));
        assert!(list.is_empty());
        assert!(list.front().is_none());
    }

    #[test]
    fn test_append_and_front() {
        let list = IntervalList::new();
        list.append_interval(0, 10, 1, Tag::new(1));
        list.append_interval(10, 20, 1, Tag::new(2));
        list.append_interval(15, 30, 1, Tag::new(3));
        assert_eq!(layout(&list), vec![(0, 10, 1), (10, 15, 2), (15, 30, 3)]);
        let front = list.front().unwrap();
        assert_eq!(front.size(), 10);
        assert_eq!(front.value.id, 1);
    }

    /// Per-byte reference model: (ts, write id) of the visible write.
    struct Oracle {
        bytes: Vec<Option<(i64, u32)>>,
    }

    impl Oracle {
        fn new(len: usize) -> Self {
            Self {
                bytes: vec![None; len],
            }
        }

        fn apply(&mut self, start: i64, stop: i64, ts: i64, id: u32, overlay: bool) {
            for b in start.max(0)..stop.max(0) {
                let slot = &mut self.bytes[b as usize];
                let older = matches!(slot, Some((existing, _)) if ts < *existing);
                if overlay || !older {
                    *slot = Some((ts, id));
                }
            }
        }

        fn check(&self, list: &IntervalList<Tag>) {
            let mut seen: Vec<Option<(i64, u32)>> = vec![None; self.bytes.len()];
            for iv in list.intervals() {
                for b in iv.start_offset..iv.stop_offset {
                    assert!(seen[b as usize].is_none(), "byte {b} covered twice");
                    seen[b as usize] = Some((iv.ts_ns, iv.value.id));
                }
            }
            assert_eq!(seen, self.bytes);
        }
    }

    fn random_ops(seed: u64, overlay_ratio: f64) {
        const SPACE: i64 = 200;
        let mut rng = StdRng::seed_from_u64(seed);
        let list = IntervalList::new();
        let mut oracle = Oracle::new(SPACE as usize);
        for id in 0..60u32 {
            let start = rng.random_range(0..SPACE);
            let stop = rng.random_range(start..=SPACE);
            let ts = rng.random_range(0..20i64);
            let overlay = rng.random_bool(overlay_ratio);
            if overlay {
                list.overlay(start, stop, ts, Tag::new(id));
            } else {
                list.insert_interval(start, stop, ts, Tag::new(id));
            }
            oracle.apply(start, stop, ts, id, overlay);
            assert_well_formed(&list);
            oracle.check(&list);
        }
    }

    #[test]
    fn test_random_inserts_match_per_byte_model() {
        for seed in 0..50 {
            random_ops(seed, 0.0);
        }
    }

    #[test]
    fn test_random_overlays_match_per_byte_model() {
        for seed in 0..50 {
            random_ops(seed, 1.0);
        }
    }

    #[test]
    fn test_random_mixed_match_per_byte_model() {
        for seed in 100..150 {
            random_ops(seed, 0.5);
        }
    }

    #[test]
    fn test_concurrent_readers_and_writers() {
        let list = std::sync::Arc::new(IntervalList::new());
        let mut handles = Vec::new();
        for t in 0..4u32 {
            let list = list.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..200i64 {
                    let start = (i * 7 + t as i64 * 13) % 500;
                    list.insert_interval(start, start + 20, i, Tag::new(t));
                    let _ = list.front();
                    let _ = list.len();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_well_formed(&list);
    }
}

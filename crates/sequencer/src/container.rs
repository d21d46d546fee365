use std::collections::VecDeque;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::predictor::TimestampPredictor;
use crate::{INVALID_TIMESTAMP, Timestamp};

/// An enhancement buffer with its presentation timestamp and the wall-clock
/// time it was handed to the container.
#[derive(Debug, Clone)]
pub struct StampedBuffer {
    data: Bytes,
    timestamp: Timestamp,
    input_time: u64,
}

impl StampedBuffer {
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Bytes {
        self.data
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn input_time(&self) -> u64 {
        self.input_time
    }
}

/// Holds enhancement buffers sorted by timestamp and releases them in
/// presentation order, using a [`TimestampPredictor`] to know when the head
/// of the queue is safe to emit.
///
/// Not threadsafe; the calling code provides any locking it needs.
#[derive(Debug)]
pub struct LcevcContainer {
    predictor: TimestampPredictor,
    /// Sorted ascending by timestamp, no duplicates.
    list: VecDeque<StampedBuffer>,
    /// 0 means unbounded.
    capacity: usize,
    processed_first: bool,
}

impl LcevcContainer {
    pub fn new(capacity: usize) -> Self {
        Self {
            predictor: TimestampPredictor::new(),
            list: VecDeque::new(),
            capacity,
            processed_first: false,
        }
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sets the predictor's reorder depth (0 selects the default). The
    /// predictor resets, so the head of the queue, if any, re-hints it.
    pub fn set_max_num_reorder_frames(&mut self, max_num_reorder_frames: u32) {
        self.predictor
            .set_max_num_reorder_frames(max_num_reorder_frames);
        if let Some(head) = self.list.front() {
            self.predictor.hint(head.timestamp);
        }
    }

    /// Inserts a copy of `data` keyed by `timestamp`. Returns false when the
    /// container is full or the timestamp is already present (the existing
    /// buffer is retained).
    pub fn insert(
        &mut self,
        data: &[u8],
        timestamp: Timestamp,
        input_time: u64,
    ) -> bool {
        self.insert_buffer(Bytes::copy_from_slice(data), timestamp, input_time)
    }

    /// Inserts an owned buffer without copying.
    pub fn insert_buffer(
        &mut self,
        data: Bytes,
        timestamp: Timestamp,
        input_time: u64,
    ) -> bool {
        let inserted = self.list_insert(StampedBuffer {
            data,
            timestamp,
            input_time,
        });
        // Hint with the list head, as that is the smallest timestamp, then
        // feed the inserted (decode-order) timestamp.
        if let Some(head) = self.list.front() {
            self.predictor.hint(head.timestamp);
        }
        self.predictor.feed(timestamp);
        inserted
    }

    /// Whether a buffer with `timestamp` is queued; `Some(true)` when it is
    /// at the head.
    pub fn exists(&self, timestamp: Timestamp) -> Option<bool> {
        self.list
            .iter()
            .position(|entry| entry.timestamp == timestamp)
            .map(|index| index == 0)
    }

    /// Drops the buffer with exactly `timestamp`, if present.
    pub fn flush(&mut self, timestamp: Timestamp) {
        if let Some(index) = self
            .list
            .iter()
            .position(|entry| entry.timestamp == timestamp)
        {
            drop(self.list.remove(index));
        }
    }

    /// Empties the container and starts the predictor from scratch.
    pub fn clear(&mut self) {
        self.list.clear();
        self.predictor = TimestampPredictor::new();
        self.processed_first = false;
    }

    /// Extracts the buffer with `timestamp`, releasing everything older: the
    /// caller has advanced past those frames. Returns the buffer (None when
    /// not found; any overshoot entry is put back) and whether the requested
    /// timestamp was already at the head.
    pub fn extract(&mut self, timestamp: Timestamp) -> (Option<StampedBuffer>, bool) {
        let mut discarded = 0u32;
        let mut current = self.extract_next_in_order(true).0;
        while let Some(head) = current.as_ref() {
            if head.timestamp >= timestamp {
                break;
            }
            discarded += 1;
            current = self.extract_next_in_order(true).0;
        }

        if discarded > 1 {
            if self.list.is_empty() {
                warn!(timestamp, "deleted the entire container in search of timestamp");
            } else {
                debug!(
                    timestamp,
                    discarded,
                    remaining = self.list.len(),
                    "found timestamp after discarding items"
                );
            }
        }

        // If the search overshot without finding the requested timestamp, put
        // the overshoot entry back and return nothing.
        if let Some(head) = current.take() {
            if head.timestamp == timestamp {
                current = Some(head);
            } else {
                self.list_insert(head);
            }
        }

        (current, discarded == 0)
    }

    /// Extracts the head of the queue when the predictor agrees it is next in
    /// presentation order (or unconditionally when `force` is set). Returns
    /// the buffer and the queue size before extraction.
    pub fn extract_next_in_order(&mut self, force: bool) -> (Option<StampedBuffer>, usize) {
        let queue_size = self.list.len();
        let Some(head) = self.list.front() else {
            return (None, queue_size);
        };

        // Hinting here lets the head of the list train the predictor even
        // when it is not next.
        let head_timestamp = head.timestamp;
        self.predictor.hint(head_timestamp);
        if !force && !self.predictor.is_next(head_timestamp) {
            return (None, queue_size);
        }

        let result = self.list.pop_front();
        if !self.processed_first {
            debug!(
                timestamp = head_timestamp,
                force,
                queue_size = self.list.len(),
                "processing first lcevc block"
            );
            self.processed_first = true;
        }

        (result, queue_size)
    }

    /// Sorted insert; rejects duplicates and respects capacity.
    fn list_insert(&mut self, entry: StampedBuffer) -> bool {
        if self.capacity != 0 && self.list.len() >= self.capacity {
            return false;
        }

        let index = self
            .list
            .partition_point(|existing| existing.timestamp < entry.timestamp);
        if let Some(existing) = self.list.get(index) {
            if existing.timestamp == entry.timestamp {
                warn!(
                    timestamp = entry.timestamp,
                    "attempting to insert buffer with duplicate timestamp"
                );
                return false;
            }
        }

        self.list.insert(index, entry);
        true
    }
}

#[cfg(test)]
#[cfg_attr(all(test, coverage_nightly), coverage(off))]
mod tests {
    use super::*;

    fn insert(container: &mut LcevcContainer, timestamp: Timestamp) -> bool {
        container.insert(&timestamp.to_le_bytes(), timestamp, 0)
    }

    fn drain_in_order(container: &mut LcevcContainer, force: bool) -> Vec<Timestamp> {
        let mut out = Vec::new();
        while let (Some(buffer), _) = container.extract_next_in_order(force) {
            out.push(buffer.timestamp());
        }
        out
    }

    #[test]
    fn sorted_and_deduplicated() {
        let mut container = LcevcContainer::new(0);
        for timestamp in [30, 10, 20, 10, 0] {
            insert(&mut container, timestamp);
        }
        assert_eq!(container.len(), 4);
        assert_eq!(drain_in_order(&mut container, true), vec![0, 10, 20, 30]);
    }

    #[test]
    fn duplicate_insert_keeps_existing_buffer() {
        let mut container = LcevcContainer::new(0);
        assert!(container.insert(b"original", 42, 1));
        assert!(!container.insert(b"replacement", 42, 2));

        let (buffer, _) = container.extract_next_in_order(true);
        assert_eq!(buffer.expect("head").data(), b"original");
    }

    #[test]
    fn capacity_is_respected() {
        let mut container = LcevcContainer::new(2);
        assert!(insert(&mut container, 0));
        assert!(insert(&mut container, 10));
        assert!(!insert(&mut container, 20));
        assert_eq!(container.len(), 2);
    }

    #[test]
    fn exists_reports_head() {
        let mut container = LcevcContainer::new(0);
        insert(&mut container, 20);
        insert(&mut container, 10);

        assert_eq!(container.exists(10), Some(true));
        assert_eq!(container.exists(20), Some(false));
        assert_eq!(container.exists(30), None);
    }

    #[test]
    fn flush_removes_exact_timestamp() {
        let mut container = LcevcContainer::new(0);
        insert(&mut container, 10);
        insert(&mut container, 20);
        container.flush(10);
        assert_eq!(container.exists(10), None);
        assert_eq!(container.len(), 1);
    }

    #[test]
    fn extract_discards_older_entries() {
        let mut container = LcevcContainer::new(0);
        for timestamp in [0, 10, 20, 30] {
            insert(&mut container, timestamp);
        }

        let (buffer, was_at_head) = container.extract(20);
        assert_eq!(buffer.expect("buffer").timestamp(), 20);
        assert!(!was_at_head);
        // 0 and 10 were discarded; 30 remains.
        assert_eq!(container.len(), 1);
        assert_eq!(container.exists(30), Some(true));
    }

    #[test]
    fn extract_overshoot_is_reinserted() {
        let mut container = LcevcContainer::new(0);
        insert(&mut container, 0);
        insert(&mut container, 30);

        let (buffer, _) = container.extract(15);
        assert!(buffer.is_none());
        // 0 was discarded in the search; the 30 overshoot went back.
        assert_eq!(container.len(), 1);
        assert_eq!(container.exists(30), Some(true));
    }

    #[test]
    fn extract_on_empty_container() {
        let mut container = LcevcContainer::new(0);
        let (buffer, was_at_head) = container.extract(5);
        assert!(buffer.is_none());
        assert!(was_at_head);
    }

    #[test]
    fn reorder_typical_stream() {
        // A codec with reorder depth 3: frames arrive in decode order but
        // must leave in presentation order.
        let mut container = LcevcContainer::new(0);
        container.set_max_num_reorder_frames(4);

        for timestamp in [0, 30, 10, 20] {
            insert(&mut container, timestamp);
        }
        // Predictor has not stabilised yet.
        assert!(container.extract_next_in_order(false).0.is_none());

        insert(&mut container, 60);
        assert!(container.extract_next_in_order(false).0.is_none());

        insert(&mut container, 40);
        insert(&mut container, 50);

        assert_eq!(
            drain_in_order(&mut container, false),
            vec![0, 10, 20, 30, 40, 50, 60]
        );
    }

    #[test]
    fn reorder_big_jump_resets_and_recovers() {
        let mut container = LcevcContainer::new(0);
        for timestamp in [1000, 1033, 1066, 1099] {
            insert(&mut container, timestamp);
        }
        // The discontinuity knocks the predictor out of lock.
        insert(&mut container, 50000);
        assert!(container.extract_next_in_order(false).0.is_none());

        // Everything still comes out in ascending order.
        assert_eq!(
            drain_in_order(&mut container, true),
            vec![1000, 1033, 1066, 1099, 50000]
        );
    }

    #[test]
    fn round_trip_preserves_bytes() {
        let mut container = LcevcContainer::new(0);
        container.insert(b"enhancement bytes", 7, 123);

        let (buffer, _) = container.extract(7);
        let buffer = buffer.expect("buffer");
        assert_eq!(buffer.data(), b"enhancement bytes");
        assert_eq!(buffer.timestamp(), 7);
        assert_eq!(buffer.input_time(), 123);
    }

    #[test]
    fn clear_resets_predictor() {
        let mut container = LcevcContainer::new(0);
        container.set_max_num_reorder_frames(2);
        for timestamp in [0, 30, 60] {
            insert(&mut container, timestamp);
        }
        assert!(container.extract_next_in_order(false).0.is_some());

        container.clear();
        assert!(container.is_empty());

        // The fresh predictor needs to re-stabilise.
        insert(&mut container, 90);
        assert!(container.extract_next_in_order(false).0.is_none());
    }
}

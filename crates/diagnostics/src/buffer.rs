use std::sync::{Condvar, Mutex};

use crate::DiagRecord;

/// Result of draining one record from the buffer.
#[derive(Debug)]
pub struct PoppedRecord {
    pub record: DiagRecord,
    /// Bytes copied into the caller's payload buffer. Zero when the record
    /// had no payload, or when its payload was overwritten before the
    /// consumer reached it.
    pub payload_len: usize,
    /// True when this pop emptied the buffer.
    pub buffer_empty: bool,
}

struct BufferState {
    /// Power-of-two ring of fixed-size records.
    ring: Vec<Option<DiagRecord>>,
    ring_mask: u32,
    /// Next slot to push into / pull from.
    front: u32,
    back: u32,

    /// Contiguous ring of variable-length payloads.
    var_data: Vec<u8>,
    var_mask: u64,
    /// Next offset for variable data. Deliberately NOT wrapped into the ring
    /// on push; the unwrapped offset is what makes overrun detectable on pop.
    var_next: u64,
}

/// Multi-producer single-consumer ring of diagnostic records with a
/// companion byte ring for payloads.
///
/// Producers block while the record ring is full; the consumer blocks while
/// it is empty. Payloads are delivered only if the producers have not lapped
/// the byte ring in the meantime; a lapped payload is dropped and its record
/// delivered with `payload_len == 0`.
pub struct DiagnosticsBuffer {
    state: Mutex<BufferState>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl DiagnosticsBuffer {
    /// `capacity` records and `var_capacity` payload bytes; both must be
    /// powers of two.
    pub fn new(capacity: u32, var_capacity: usize) -> Self {
        assert!(capacity.is_power_of_two());
        assert!(var_capacity.is_power_of_two());

        Self {
            state: Mutex::new(BufferState {
                ring: vec![None; capacity as usize],
                ring_mask: capacity - 1,
                front: 0,
                back: 0,
                var_data: vec![0u8; var_capacity],
                var_mask: var_capacity as u64 - 1,
                var_next: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> u32 {
        let state = self.state.lock().expect("diagnostics mutex poisoned");
        state.ring_mask + 1
    }

    pub fn len(&self) -> u32 {
        let state = self.state.lock().expect("diagnostics mutex poisoned");
        (state.ring_mask + 1 + state.front - state.back) & state.ring_mask
    }

    pub fn is_empty(&self) -> bool {
        let state = self.state.lock().expect("diagnostics mutex poisoned");
        state.front == state.back
    }

    pub fn is_full(&self) -> bool {
        let state = self.state.lock().expect("diagnostics mutex poisoned");
        (state.front + 1) & state.ring_mask == state.back
    }

    /// Pushes a record and its payload, blocking while the record ring is
    /// full.
    pub fn push(&self, record: &DiagRecord, payload: &[u8]) {
        self.push_with(payload.len(), |dest, var| {
            *dest = *record;
            dest.size = payload.len() as u32;
            var[..payload.len()].copy_from_slice(payload);
        });
    }

    /// Zero-copy push: reserves the record slot and `var_size` payload bytes,
    /// then lets `fill` write both in place under the lock.
    pub fn push_with(&self, var_size: usize, fill: impl FnOnce(&mut DiagRecord, &mut [u8])) {
        let mut state = self.state.lock().expect("diagnostics mutex poisoned");
        assert!(var_size <= state.var_data.len());

        // Wait while the record ring is full.
        let mut next = (state.front + 1) & state.ring_mask;
        while next == state.back {
            state = self
                .not_full
                .wait(state)
                .expect("diagnostics mutex poisoned");
            next = (state.front + 1) & state.ring_mask;
        }

        // Signal the consumer if the buffer was empty. One signal is enough:
        // there is a single consumer.
        if state.front == state.back {
            self.not_empty.notify_one();
        }

        let slot = state.front as usize;
        state.front = next;

        let mut placed = DiagRecord {
            site: &PLACEHOLDER_SITE,
            timestamp_ns: 0,
            thread_id: 0,
            size: var_size as u32,
            value: crate::DiagValue::default(),
        };

        let var_range = if var_size > 0 {
            // Payloads must be contiguous: skip to the next ring start when
            // the tail is too small.
            let var_capacity = state.var_data.len() as u64;
            if var_capacity - (state.var_next & state.var_mask) < var_size as u64 {
                state.var_next = (state.var_next + state.var_mask) & !state.var_mask;
            }
            placed.value = crate::DiagValue(state.var_next);
            let start = (state.var_next & state.var_mask) as usize;
            // The unwrapped offset keeps advancing; wrapping happens on pop
            // so overwrites can be spotted.
            state.var_next += var_size as u64;
            Some(start..start + var_size)
        } else {
            None
        };

        let state = &mut *state;
        let record_slot = state.ring[slot].insert(placed);
        match var_range {
            Some(range) => fill(record_slot, &mut state.var_data[range]),
            None => fill(record_slot, &mut []),
        }
    }

    /// Pops the next record, blocking while the buffer is empty. As much of
    /// the payload as fits is copied into `payload_out`.
    pub fn pop(&self, payload_out: &mut [u8]) -> PoppedRecord {
        let mut state = self.state.lock().expect("diagnostics mutex poisoned");

        while state.front == state.back {
            state = self
                .not_empty
                .wait(state)
                .expect("diagnostics mutex poisoned");
        }

        let slot = state.back as usize;
        let record = state.ring[slot].take().expect("occupied ring slot");
        state.back = (state.back + 1) & state.ring_mask;

        let mut payload_len = 0;
        if record.size > 0 && !payload_out.is_empty() {
            // Did later records' payloads lap this one? Signed comparison of
            // unwrapped offsets handles u64 wrap.
            let var_capacity = state.var_data.len() as u64;
            let overrun_offset = record.value.0.wrapping_add(var_capacity);
            if (state.var_next.wrapping_sub(overrun_offset) as i64) <= 0 {
                payload_len = (record.size as usize).min(payload_out.len());
                let start = (record.value.0 & state.var_mask) as usize;
                payload_out[..payload_len]
                    .copy_from_slice(&state.var_data[start..start + payload_len]);
            }
        }

        let buffer_empty = state.front == state.back;
        drop(state);
        self.not_full.notify_one();

        PoppedRecord {
            record,
            payload_len,
            buffer_empty,
        }
    }
}

/// Filler for freshly reserved slots before `fill` runs.
static PLACEHOLDER_SITE: crate::DiagSite = crate::DiagSite {
    diag_type: crate::DiagType::Log,
    file: "",
    line: 0,
    level: crate::LogLevel::None,
    message: "",
    value_kind: crate::DiagArg::None,
};

#[cfg(test)]
#[cfg_attr(all(test, coverage_nightly), coverage(off))]
mod tests {
    use std::sync::Arc;

    use rand::prelude::*;

    use super::*;
    use crate::{DiagArg, DiagRecord, DiagSite, DiagType, DiagValue, LogLevel};

    static TEST_SITE: DiagSite = DiagSite {
        diag_type: DiagType::Log,
        file: file!(),
        line: 0,
        level: LogLevel::Info,
        message: "test",
        value_kind: DiagArg::UInt64,
    };

    fn record(value: u64) -> DiagRecord {
        DiagRecord {
            site: &TEST_SITE,
            timestamp_ns: value,
            thread_id: 1,
            size: 0,
            value: DiagValue(value),
        }
    }

    #[test]
    fn create_and_query() {
        let buffer = DiagnosticsBuffer::new(64, 1024);
        assert_eq!(buffer.capacity(), 64);
        assert_eq!(buffer.len(), 0);
        assert!(buffer.is_empty());
        assert!(!buffer.is_full());
    }

    #[test]
    fn push_pop_in_order() {
        let buffer = DiagnosticsBuffer::new(64, 1024);
        for i in 0..10 {
            buffer.push(&record(i), &[]);
        }
        assert_eq!(buffer.len(), 10);

        for i in 0..10 {
            let popped = buffer.pop(&mut []);
            assert_eq!(popped.record.value.as_u64(), i);
            assert_eq!(popped.buffer_empty, i == 9);
        }
    }

    #[test]
    fn fills_at_capacity_minus_one() {
        let buffer = DiagnosticsBuffer::new(8, 256);
        for i in 0..7 {
            buffer.push(&record(i), &[]);
        }
        assert!(buffer.is_full());
        let popped = buffer.pop(&mut []);
        assert_eq!(popped.record.value.as_u64(), 0);
        assert!(!buffer.is_full());
    }

    #[test]
    fn payload_round_trip() {
        let buffer = DiagnosticsBuffer::new(16, 256);
        buffer.push(&record(1), b"hello diagnostics");

        let mut payload = [0u8; 64];
        let popped = buffer.pop(&mut payload);
        assert_eq!(popped.payload_len, 17);
        assert_eq!(&payload[..17], b"hello diagnostics");
    }

    #[test]
    fn push_with_writes_in_place() {
        let buffer = DiagnosticsBuffer::new(16, 256);
        buffer.push_with(5, |dest, var| {
            *dest = record(9);
            dest.size = 5;
            var.copy_from_slice(b"12345");
        });

        let mut payload = [0u8; 16];
        let popped = buffer.pop(&mut payload);
        assert_eq!(popped.record.value.as_u64(), 9);
        assert_eq!(&payload[..popped.payload_len], b"12345");
    }

    #[test]
    fn overrun_drops_payload_but_keeps_record() {
        // Var ring of 64 bytes; 48-byte payloads lap it every other push.
        let buffer = DiagnosticsBuffer::new(16, 64);
        buffer.push(&record(0), &[0xaa; 48]);
        buffer.push(&record(1), &[0xbb; 48]);
        buffer.push(&record(2), &[0xcc; 48]);

        let mut payload = [0u8; 64];
        // Record 0's payload was overwritten by records 1 and 2.
        let popped = buffer.pop(&mut payload);
        assert_eq!(popped.record.value.as_u64(), 0);
        assert_eq!(popped.payload_len, 0);

        let popped = buffer.pop(&mut payload);
        assert_eq!(popped.record.value.as_u64(), 1);
        assert_eq!(popped.payload_len, 0);

        // The newest payload is intact.
        let popped = buffer.pop(&mut payload);
        assert_eq!(popped.record.value.as_u64(), 2);
        assert_eq!(popped.payload_len, 48);
        assert_eq!(&payload[..48], &[0xcc; 48]);
    }

    #[test]
    fn producers_and_consumer() {
        let buffer = Arc::new(DiagnosticsBuffer::new(64, 4096));
        let producers: Vec<_> = (0..4u64)
            .map(|p| {
                let buffer = Arc::clone(&buffer);
                std::thread::spawn(move || {
                    for i in 0..1000u64 {
                        let value = p << 32 | i;
                        buffer.push(&record(value), &value.to_le_bytes());
                    }
                })
            })
            .collect();

        let mut last_seen = [None::<u64>; 4];
        let mut payload = [0u8; 16];
        for _ in 0..4000 {
            let popped = buffer.pop(&mut payload);
            let value = popped.record.value.as_u64();
            let producer = (value >> 32) as usize;
            let sequence = value & 0xffff_ffff;
            // FIFO per producer.
            if let Some(previous) = last_seen[producer] {
                assert!(sequence > previous);
            }
            last_seen[producer] = Some(sequence);
            // Payload content is atomic with its record when it survives.
            if popped.payload_len != 0 {
                assert_eq!(payload[..8], value.to_le_bytes());
            }
        }

        for producer in producers {
            producer.join().expect("producer panicked");
        }
        assert!(buffer.is_empty());
    }

    #[test]
    fn lagging_consumer_bounded_payload_loss() {
        // 10k records of 500-byte payloads through a 1 MiB var ring, with
        // the consumer lagging 50 pops behind each push batch.
        let buffer = DiagnosticsBuffer::new(128, 1 << 20);
        let mut rng = StdRng::seed_from_u64(500);
        let payload_size = 500usize;
        let total = 10_000u64;

        let mut pushed = 0u64;
        let mut popped_count = 0u64;
        let mut dropped = 0u64;
        let mut payload = vec![0u8; payload_size];
        let mut expected = 0u64;

        while popped_count < total {
            while pushed < total && pushed < popped_count + 100 {
                let mut bytes = vec![0u8; payload_size];
                rng.fill(&mut bytes[..]);
                bytes[..8].copy_from_slice(&pushed.to_le_bytes());
                buffer.push(&record(pushed), &bytes);
                pushed += 1;
            }
            for _ in 0..50 {
                if popped_count >= pushed {
                    break;
                }
                let result = buffer.pop(&mut payload);
                // Records pop in push order, payloads or not.
                assert_eq!(result.record.value.as_u64(), expected);
                expected += 1;
                if result.payload_len == 0 {
                    dropped += 1;
                } else {
                    assert_eq!(payload[..8], result.record.value.as_u64().to_le_bytes());
                }
                popped_count += 1;
            }
        }

        // The ring holds far more than the consumer's lag, so nothing is
        // ever overwritten here.
        assert_eq!(dropped, 0);
    }
}

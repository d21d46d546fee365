use tracing::{debug, warn};

use crate::{INVALID_TIMESTAMP, Timestamp};

/// Multiplier on the delta upper bound beyond which a fed delta is treated as
/// a stream discontinuity. Ideally this would be derived from
/// `max_num_reorder_frames + 1`, but the feed side has no reorder context.
const DELTA_JUMP_COEFFICIENT: u64 = 32;

/// Tolerance around the learned delta. Anything below 50 works, since the
/// delta is halved every time it is updated.
const PERCENT_ERROR: u64 = 25;

const DEFAULT_MAX_NUM_REORDER_FRAMES: u32 = 16;

/// Learns the gap between timestamps on the fly. Fed with timestamps in
/// decode order and hinted with the queue head in presentation order, it
/// answers whether a given timestamp can be the next one presented.
#[derive(Debug)]
pub struct TimestampPredictor {
    /// Last fed timestamp, for the decode-order delta.
    last_fed: Timestamp,
    /// Last hinted timestamp, against which candidates are judged.
    last_hinted: Timestamp,

    /// Bounds on how far a timestamp may be from the last hinted one and
    /// still count as "next". Too far ahead means a frame in between; too
    /// close means a duplicate or an error.
    delta_lower_bound: u64,
    delta_upper_bound: u64,

    /// Counts down as the computed delta repeats. At zero the delta is
    /// considered stable.
    delta_repeat_count: u32,

    max_num_reorder_frames: u32,
}

impl Default for TimestampPredictor {
    fn default() -> Self {
        Self::new()
    }
}

impl TimestampPredictor {
    pub fn new() -> Self {
        let mut predictor = Self {
            last_fed: INVALID_TIMESTAMP,
            last_hinted: INVALID_TIMESTAMP,
            delta_lower_bound: 0,
            delta_upper_bound: 0,
            delta_repeat_count: 0,
            max_num_reorder_frames: DEFAULT_MAX_NUM_REORDER_FRAMES,
        };
        predictor.reset();
        predictor
    }

    fn reset(&mut self) {
        self.last_fed = INVALID_TIMESTAMP;
        self.last_hinted = INVALID_TIMESTAMP;
        self.delta_lower_bound = 0;
        self.delta_upper_bound = 0;
        self.delta_repeat_count = self.max_num_reorder_frames / 2;
    }

    fn update_delta(&mut self, delta: u64) {
        if delta == 0 {
            return;
        }

        if self.delta_lower_bound == 0 || delta < self.delta_lower_bound {
            let error_margin = (delta * PERCENT_ERROR) / 100;
            self.delta_lower_bound = delta - error_margin;
            self.delta_upper_bound = delta + error_margin;
            self.delta_repeat_count = self.max_num_reorder_frames / 2;
            debug!(
                delta,
                lower = self.delta_lower_bound,
                upper = self.delta_upper_bound,
                "delta updated"
            );
        } else if self.delta_repeat_count > 0 {
            // New delta is equal-to-or-greater-than the current one, so high
            // chance that this is it.
            self.delta_repeat_count -= 1;
        }
    }

    /// Feeds a timestamp in decode order.
    pub fn feed(&mut self, timestamp: Timestamp) {
        // These are unsigned, so abs(x - y) cannot be written directly.
        let new_delta = timestamp.abs_diff(self.last_fed);

        if self.last_fed != INVALID_TIMESTAMP {
            if self.delta_upper_bound != 0
                && new_delta > self.delta_upper_bound * DELTA_JUMP_COEFFICIENT
            {
                warn!(
                    lower = self.delta_lower_bound,
                    upper = self.delta_upper_bound,
                    "detected big jump"
                );
                self.reset();
            } else {
                self.update_delta(new_delta);
            }
        }
        self.last_fed = timestamp;

        // First timestamp in the stream seeds the hint side too.
        if self.last_hinted == INVALID_TIMESTAMP {
            self.last_hinted = timestamp;
        }
    }

    /// Hints the timestamp at the head of the presentation queue.
    pub fn hint(&mut self, timestamp: Timestamp) {
        if self.last_hinted == INVALID_TIMESTAMP {
            warn!("hint called when no timestamps have been fed");
            return;
        }

        if timestamp < self.last_hinted {
            // A backward jump that the fed values failed to catch; reset to
            // be safe.
            warn!(
                lower = self.delta_lower_bound,
                upper = self.delta_upper_bound,
                "detected backward jump"
            );
            self.reset();
        } else {
            // Hints arrive in presentation order, so this delta is the more
            // trustworthy one; in practice the delta has usually converged
            // already and this merely speeds it up.
            self.update_delta(timestamp - self.last_hinted);
        }
        self.last_hinted = timestamp;
    }

    /// Whether `timestamp` can be the next one presented.
    pub fn is_next(&self, timestamp: Timestamp) -> bool {
        if self.delta_repeat_count != 0 {
            // Not sure yet, so no conclusions.
            return false;
        }

        if timestamp == self.last_hinted {
            // Typically the first in the stream.
            return true;
        }

        if timestamp < self.last_hinted {
            // A jump backward; no guarantees can be made.
            return false;
        }

        let delta = timestamp - self.last_hinted;
        self.delta_lower_bound <= delta && delta <= self.delta_upper_bound
    }

    /// Sets the number of frames that may arrive out of order before a
    /// contiguous run is guaranteed. Zero selects the default (16). Resets
    /// the predictor.
    pub fn set_max_num_reorder_frames(&mut self, max_num_reorder_frames: u32) {
        self.max_num_reorder_frames = if max_num_reorder_frames == 0 {
            DEFAULT_MAX_NUM_REORDER_FRAMES
        } else {
            max_num_reorder_frames
        };
        self.reset();
    }
}

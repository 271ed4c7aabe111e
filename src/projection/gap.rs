//! Sequence gap detection.
//!
//! A gap in the assigned `no` series means either an earlier transaction has
//! not committed yet, or a rolled back transaction left a permanent hole.
//! Short retries with growing waits catch the first case without stalling
//! forever on the second; the detection window suppresses retries when
//! replaying history, where only permanent holes remain.

use chrono::{DateTime, Duration, Utc};

use crate::event::RecordedEvent;

/// Sleep ladder applied between retries, in milliseconds.
pub const DEFAULT_RETRY_CONFIG: [u64; 4] = [0, 5, 50, 500];

#[derive(Debug, Clone)]
pub struct GapDetection {
    retry_config: Vec<u64>,
    detection_window: Option<Duration>,
    retries: usize,
}

impl GapDetection {
    pub fn new() -> Self {
        Self {
            retry_config: DEFAULT_RETRY_CONFIG.to_vec(),
            detection_window: None,
            retries: 0,
        }
    }

    /// Replaces the sleep ladder; its length bounds the number of retries.
    pub fn with_retry_config(mut self, retry_config: Vec<u64>) -> Self {
        self.retry_config = retry_config;
        self
    }

    /// Events older than the window are never retried.
    pub fn with_detection_window(mut self, window: Duration) -> Self {
        self.detection_window = Some(window);
        self
    }

    pub fn is_gap(&self, previous_position: i64, event_position: i64) -> bool {
        event_position != previous_position + 1
    }

    pub fn should_retry(&self, now: DateTime<Utc>, event: &RecordedEvent) -> bool {
        if let Some(window) = self.detection_window {
            if now - event.created_at > window {
                return false;
            }
        }
        self.retries < self.retry_config.len()
    }

    pub fn sleep_ms(&self) -> u64 {
        self.retry_config.get(self.retries).copied().unwrap_or(0)
    }

    pub fn track_retry(&mut self) {
        self.retries += 1;
    }

    pub fn reset_retries(&mut self) {
        self.retries = 0;
    }
}

impl Default for GapDetection {
    fn default() -> Self {
        Self::new()
    }
}

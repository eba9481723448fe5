//! Rate limiting for relay-originated keyframe requests.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::room::StreamKey;

/// Spaces out the keyframe requests the relay sends to one sender's stream.
///
/// Receiver-originated requests are relayed as-is and never pass through here.
pub struct KeyframeRequestLimiter {
    /// Map of stream to the last request sent for it.
    last_request: Mutex<HashMap<StreamKey, Instant>>,
    /// Minimum time between requests for one stream.
    min_interval: Duration,
}

impl KeyframeRequestLimiter {
    /// Create a new rate limiter.
    pub fn new(min_interval: Duration) -> Self {
        Self {
            last_request: Mutex::new(HashMap::new()),
            min_interval,
        }
    }

    /// Whether a request for `stream` may be sent now. Records it if so.
    pub fn check(&self, stream: StreamKey, now: Instant) -> bool {
        let mut map = self.last_request.lock();

        if let Some(last) = map.get(&stream) {
            if now.saturating_duration_since(*last) < self.min_interval {
                return false;
            }
        }

        map.insert(stream, now);
        true
    }

    /// Forget a stream (sender left or renegotiated).
    pub fn forget(&self, stream: &StreamKey) {
        self.last_request.lock().remove(stream);
    }

    /// Cleanup old entries (call periodically to prevent memory leak).
    pub fn cleanup(&self, now: Instant) {
        let threshold = self.min_interval * 10; // Keep 10x the interval
        self.last_request
            .lock()
            .retain(|_, last| now.saturating_duration_since(*last) < threshold);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.last_request.lock().len()
    }
}

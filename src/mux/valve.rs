//! Token-bucket rate shaping for connection workers
//!
//! Each worker consumes tokens for every byte it moves; a depleted bucket
//! suspends the worker until the refill catches up. Absent limits mean
//! unlimited flow.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

struct TokenBucket {
    state: Mutex<BucketState>,
    /// Tokens (bytes) added per second
    rate: f64,
    /// Bucket capacity; one second worth of tokens
    burst: f64,
}

impl TokenBucket {
    fn new(bytes_per_sec: u64) -> Self {
        let rate = bytes_per_sec as f64;
        Self {
            state: Mutex::new(BucketState {
                tokens: rate,
                last_refill: Instant::now(),
            }),
            rate,
            burst: rate,
        }
    }

    async fn consume(&self, n: usize) {
        // A record larger than the whole bucket pays one full bucket.
        let need = (n as f64).min(self.burst);
        loop {
            let wait = {
                let mut state = self.state.lock();
                let elapsed = state.last_refill.elapsed().as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
                state.last_refill = Instant::now();
                if state.tokens >= need {
                    state.tokens -= need;
                    return;
                }
                Duration::from_secs_f64((need - state.tokens) / self.rate)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

/// Byte-rate limiter applied to sends and receives
///
/// Shared by every connection worker of a session; construct once and hand
/// it to the session configuration.
pub struct Valve {
    send: Option<TokenBucket>,
    recv: Option<TokenBucket>,
}

impl Valve {
    /// Create a valve; `None` on either side means that direction is
    /// unlimited
    pub fn new(max_send_bytes_per_sec: Option<u64>, max_recv_bytes_per_sec: Option<u64>) -> Self {
        Self {
            send: max_send_bytes_per_sec.filter(|&r| r > 0).map(TokenBucket::new),
            recv: max_recv_bytes_per_sec.filter(|&r| r > 0).map(TokenBucket::new),
        }
    }

    pub(crate) async fn consume_send(&self, n: usize) {
        if let Some(bucket) = &self.send {
            bucket.consume(n).await;
        }
    }

    pub(crate) async fn consume_recv(&self, n: usize) {
        if let Some(bucket) = &self.recv {
            bucket.consume(n).await;
        }
    }
}

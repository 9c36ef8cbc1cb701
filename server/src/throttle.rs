//! Outgoing bandwidth throttling.
//!
//! A process-global token bucket shared by all streaming responses.
//! The switch and the scale are plain atomics so the live-config
//! endpoint can flip them without locks; writers read the switch once
//! per buffer.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// The throttle refill window.
const WINDOW: Duration = Duration::from_secs(1);

const MIB: f64 = 1024.0 * 1024.0;

/// Process-global throttle settings and bucket.
pub struct Throttle {
    enabled: AtomicBool,

    /// Scale in MiB/s, stored as f64 bits.
    scale: AtomicU64,

    bucket: Mutex<TokenBucket>,
}

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl Throttle {
    pub fn new(enabled: bool, scale: f64) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            scale: AtomicU64::new(scale.to_bits()),
            bucket: Mutex::new(TokenBucket {
                tokens: scale * MIB,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn scale(&self) -> f64 {
        f64::from_bits(self.scale.load(Ordering::Relaxed))
    }

    /// Reconfigures the throttle. Invoked by the config endpoint.
    pub fn set(&self, enabled: Option<bool>, scale: Option<f64>) {
        if let Some(enabled) = enabled {
            self.enabled.store(enabled, Ordering::Relaxed);
            tracing::info!(enabled, "throttle switch updated");
        }
        if let Some(scale) = scale {
            self.scale.store(scale.to_bits(), Ordering::Relaxed);
            tracing::info!(scale, "throttle scale updated");
        }
    }

    /// Takes `n` bytes out of the bucket, sleeping until the refill
    /// window provides them. A no-op while the switch is off.
    pub async fn acquire(&self, n: usize) {
        if !self.is_enabled() {
            return;
        }

        let mut wanted = n as f64;
        loop {
            let wait = {
                let rate = self.scale() * MIB;
                let mut bucket = self.bucket.lock();

                let elapsed = bucket.last_refill.elapsed().as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * rate).min(rate * WINDOW.as_secs_f64());
                bucket.last_refill = Instant::now();

                if bucket.tokens >= wanted {
                    bucket.tokens -= wanted;
                    return;
                }

                // Drain what's there and wait for the rest
                wanted -= bucket.tokens;
                bucket.tokens = 0.0;

                Duration::from_secs_f64((wanted / rate).min(WINDOW.as_secs_f64()))
            };

            tokio::time::sleep(wait).await;
        }
    }
}

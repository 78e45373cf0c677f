//! Bandwidth shaping and digest verification for outbound blob streams

use crate::oci::Digest;
use crate::{Error, Result};
use async_stream::try_stream;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Byte stream type served by the registry
pub type ByteStream = futures::stream::BoxStream<'static, io::Result<Bytes>>;

const UNITS: [(&str, u64); 5] = [
    ("TBps", 1 << 40),
    ("GBps", 1 << 30),
    ("MBps", 1 << 20),
    ("KBps", 1 << 10),
    ("Bps", 1),
];

/// A transfer rate in bytes per second, written like `10MBps`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "ByteRateRepr", into = "String")]
pub struct ByteRate(u64);

#[derive(Deserialize)]
#[serde(untagged)]
enum ByteRateRepr {
    Bytes(u64),
    Text(String),
}

impl ByteRate {
    pub fn bytes_per_sec(bytes: u64) -> Self {
        Self(bytes)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Zero means unlimited
    pub fn is_unlimited(&self) -> bool {
        self.0 == 0
    }
}

impl FromStr for ByteRate {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (number, multiplier) = UNITS
            .iter()
            .find_map(|(unit, multiplier)| s.strip_suffix(unit).map(|n| (n.trim(), *multiplier)))
            .ok_or_else(|| {
                Error::config(format!(
                    "invalid byte rate {s:?}: expected an integer followed by Bps, KBps, MBps, GBps or TBps"
                ))
            })?;

        let value: u64 = number
            .parse()
            .map_err(|_| Error::config(format!("invalid byte rate {s:?}")))?;
        value
            .checked_mul(multiplier)
            .map(Self)
            .ok_or_else(|| Error::config(format!("byte rate {s:?} overflows")))
    }
}

impl TryFrom<ByteRateRepr> for ByteRate {
    type Error = Error;

    fn try_from(repr: ByteRateRepr) -> Result<Self> {
        match repr {
            ByteRateRepr::Bytes(bytes) => Ok(Self(bytes)),
            ByteRateRepr::Text(text) => text.parse(),
        }
    }
}

impl From<ByteRate> for String {
    fn from(rate: ByteRate) -> Self {
        rate.to_string()
    }
}

impl fmt::Display for ByteRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (unit, multiplier) = UNITS
            .iter()
            .find(|(_, m)| self.0 != 0 && self.0 % m == 0)
            .copied()
            .unwrap_or(("Bps", 1));
        write!(f, "{}{}", self.0 / multiplier, unit)
    }
}

/// Token bucket state for the shared budget.
///
/// Tokens may go negative: a caller reserves its bytes immediately and waits
/// off the deficit, so concurrent callers queue behind each other fairly.
#[derive(Debug)]
struct TokenBucket {
    /// Current number of available tokens (bytes).
    tokens: f64,
    /// Maximum tokens (burst capacity).
    capacity: f64,
    /// Tokens added per second.
    rate_per_sec: f64,
    /// Last time tokens were updated.
    last_update: Instant,
}

impl TokenBucket {
    fn new(rate_per_sec: u64, burst: u64) -> Self {
        let capacity = burst as f64;
        Self {
            tokens: capacity,
            capacity,
            rate_per_sec: rate_per_sec as f64,
            last_update: Instant::now(),
        }
    }

    /// Reserve `bytes` and return how long the caller must wait before sending them.
    fn reserve(&mut self, bytes: u64) -> Duration {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();

        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        self.last_update = now;
        self.tokens -= bytes as f64;

        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.rate_per_sec)
        }
    }
}

/// Process-wide bandwidth limiter shared by every blob response
#[derive(Debug)]
pub struct Limiter {
    rate: ByteRate,
    burst: usize,
    bucket: Mutex<TokenBucket>,
}

impl Limiter {
    /// Create a limiter, or `None` when the rate is unlimited
    pub fn new(rate: ByteRate) -> Option<Arc<Self>> {
        if rate.is_unlimited() {
            return None;
        }
        // One second worth of bytes, capped so a single chunk never monopolizes the budget
        let burst = rate.as_u64().clamp(1, 1 << 20);
        Some(Arc::new(Self {
            rate,
            burst: burst as usize,
            bucket: Mutex::new(TokenBucket::new(rate.as_u64(), burst)),
        }))
    }

    pub fn rate(&self) -> ByteRate {
        self.rate
    }

    /// Largest chunk admitted by a single acquisition
    pub fn burst(&self) -> usize {
        self.burst
    }

    /// Wait until `bytes` may be sent
    pub async fn acquire(&self, bytes: u64) {
        let wait = self.bucket.lock().reserve(bytes);
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

/// Pace a byte stream through the shared limiter.
///
/// Chunks larger than the burst are split so pacing stays smooth.
pub fn throttled<S>(limiter: Arc<Limiter>, stream: S) -> impl Stream<Item = io::Result<Bytes>> + Send
where
    S: Stream<Item = io::Result<Bytes>> + Send + 'static,
{
    try_stream! {
        let mut stream = Box::pin(stream);
        while let Some(chunk) = stream.next().await {
            let mut chunk = chunk?;
            while !chunk.is_empty() {
                let part = chunk.split_to(chunk.len().min(limiter.burst()));
                limiter.acquire(part.len() as u64).await;
                yield part;
            }
        }
    }
}

/// Verify a byte stream against `digest` while forwarding it.
///
/// The most recent chunk is held back until the next one arrives, and the final
/// chunk is released only after the digest matches. A mismatching body therefore
/// ends in an error instead of reaching the reader complete.
pub fn verified<S>(digest: Digest, stream: S) -> impl Stream<Item = io::Result<Bytes>> + Send
where
    S: Stream<Item = io::Result<Bytes>> + Send + 'static,
{
    try_stream! {
        let mut verifier = digest.verifier();
        let mut held: Option<Bytes> = None;
        let mut stream = Box::pin(stream);

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if chunk.is_empty() {
                continue;
            }
            verifier.update(&chunk);
            if let Some(previous) = held.replace(chunk) {
                yield previous;
            }
        }

        verifier
            .finish()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if let Some(last) = held {
            yield last;
        }
    }
}

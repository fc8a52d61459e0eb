//! Store-and-forward buffer (C6): a bounded in-memory FIFO of `{topic,
//! payload}` pairs used while the cloud MQTT link is down, plus a token
//! bucket that caps the replay flush rate.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;

use serde_json::Value;

#[derive(Debug, Clone)]
pub struct BufferedMessage {
    pub topic: String,
    pub payload: Value,
}

struct Inner {
    queue: VecDeque<BufferedMessage>,
}

pub struct ForwardBuffer {
    max_len: usize,
    inner: Mutex<Inner>,
}

impl ForwardBuffer {
    pub fn new(max_len: usize) -> Self {
        Self {
            max_len,
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
            }),
        }
    }

    /// Enqueues a message, discarding the oldest entry on overflow (logged at
    /// WARN by the caller, which owns tracing context).
    pub fn enqueue(&self, topic: impl Into<String>, payload: Value) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let overflowed = if inner.queue.len() >= self.max_len {
            inner.queue.pop_front();
            true
        } else {
            false
        };
        inner.queue.push_back(BufferedMessage {
            topic: topic.into(),
            payload,
        });
        overflowed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pops the oldest message, tagging it with `_flushed: true`, or `None`
    /// if the buffer is empty. The flush loop calls this one message at a
    /// time so a publish failure mid-drain only loses the one in flight
    /// (the caller re-enqueues it) rather than the whole backlog. The
    /// caller is responsible for serializing flushes (only one flush may
    /// run at a time).
    pub fn pop_flushed(&self) -> Option<BufferedMessage> {
        let mut inner = self.inner.lock().unwrap();
        inner.queue.pop_front().map(|mut msg| {
            if let Value::Object(ref mut map) = msg.payload {
                map.insert("_flushed".to_string(), Value::Bool(true));
            }
            msg
        })
    }
}

/// Rate limiter gating the flush loop to roughly `rate_per_sec` messages per
/// second.
pub struct TokenBucket {
    rate_per_sec: f64,
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate_per_sec: u32, capacity: u32) -> Self {
        Self {
            rate_per_sec: rate_per_sec as f64,
            capacity: capacity as f64,
            tokens: capacity as f64,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    pub fn try_take(&mut self, n: f64) -> bool {
        self.refill();
        if self.tokens >= n {
            self.tokens -= n;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn enqueue_overflow_discards_oldest() {
        let buf = ForwardBuffer::new(2);
        assert!(!buf.enqueue("t1", json!({"n": 1})));
        assert!(!buf.enqueue("t2", json!({"n": 2})));
        assert!(buf.enqueue("t3", json!({"n": 3})));
        let first = buf.pop_flushed().unwrap();
        let second = buf.pop_flushed().unwrap();
        assert_eq!(first.topic, "t2");
        assert_eq!(second.topic, "t3");
        assert!(buf.pop_flushed().is_none());
    }

    #[test]
    fn pop_preserves_order_and_tags_flushed() {
        let buf = ForwardBuffer::new(10);
        buf.enqueue("a", json!({"seq": 1}));
        buf.enqueue("b", json!({"seq": 2}));
        buf.enqueue("c", json!({"seq": 3}));
        let mut seqs = Vec::new();
        while let Some(msg) = buf.pop_flushed() {
            assert_eq!(msg.payload["_flushed"], json!(true));
            seqs.push(msg.payload["seq"].clone());
        }
        assert_eq!(seqs, vec![json!(1), json!(2), json!(3)]);
        assert!(buf.is_empty());
    }

    #[test]
    fn token_bucket_limits_burst() {
        let mut bucket = TokenBucket::new(10, 1);
        assert!(bucket.try_take(1.0));
        assert!(!bucket.try_take(1.0));
    }
}

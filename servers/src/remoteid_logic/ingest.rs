//! Stream readers.
//!
//! Two subscriber sockets, one per upstream stream, each with its own
//! connect/retry loop. Decoded updates are handed to the orchestrator
//! through a bounded conflating queue: when the orchestrator falls behind,
//! the oldest queued update is dropped so processing never runs more than
//! one buffer behind real time. Malformed messages are dropped and counted,
//! never fatal.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::{broadcast, Notify};
use tokio::time::{sleep, Duration};
use zeromq::{Socket, SocketRecv, SubSocket, ZmqMessage};

use crate::remoteid_logic::model::Update;
use crate::remoteid_logic::parser;

/// Bounded FIFO handoff that conflates under pressure by dropping the
/// oldest entry. Single consumer; per-stream ordering is preserved.
pub struct ConflatingQueue<T> {
    inner: Mutex<VecDeque<T>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl<T> ConflatingQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push(&self, item: T) {
        {
            let mut queue = self.inner.lock().expect("conflating queue lock poisoned");
            if queue.len() == self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(item);
        }
        self.notify.notify_one();
    }

    pub async fn pop(&self) -> T {
        loop {
            // Arm the notification before checking, so a push between the
            // check and the await cannot be missed.
            let notified = self.notify.notified();
            if let Some(item) = self
                .inner
                .lock()
                .expect("conflating queue lock poisoned")
                .pop_front()
            {
                return item;
            }
            notified.await;
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Detection,
    Status,
}

impl StreamKind {
    fn label(self) -> &'static str {
        match self {
            StreamKind::Detection => "detection",
            StreamKind::Status => "status",
        }
    }
}

fn decode(kind: StreamKind, msg: &ZmqMessage) -> Option<Update> {
    let frame = msg.get(0)?;
    let text = std::str::from_utf8(frame).ok()?;
    let value: Value = serde_json::from_str(text).ok()?;
    match kind {
        StreamKind::Detection => parser::parse_detection(&value).ok().map(Update::Drone),
        StreamKind::Status => parser::parse_status(&value).ok().map(Update::Status),
    }
}

/// Subscriber loop for one stream. Connects, subscribes to everything, and
/// feeds the queue until shutdown; connection errors back off and retry.
pub async fn run_reader(
    kind: StreamKind,
    endpoint: String,
    queue: Arc<ConflatingQueue<Update>>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut malformed: u64 = 0;
    loop {
        if shutdown.try_recv().is_ok() {
            break;
        }

        log::info!("connecting to {} stream at {endpoint}", kind.label());
        let mut socket = SubSocket::new();
        match socket.connect(&endpoint).await {
            Ok(()) => {
                if let Err(e) = socket.subscribe("").await {
                    log::error!("{} stream subscribe failed: {e}", kind.label());
                    sleep(Duration::from_secs(5)).await;
                    continue;
                }
                log::info!("{} stream connected", kind.label());

                loop {
                    tokio::select! {
                        _ = shutdown.recv() => {
                            log::info!("{} reader shutting down", kind.label());
                            return;
                        }
                        msg = socket.recv() => match msg {
                            Ok(m) => match decode(kind, &m) {
                                Some(update) => queue.push(update),
                                None => {
                                    malformed += 1;
                                    log::debug!(
                                        "dropped malformed {} message ({malformed} total)",
                                        kind.label()
                                    );
                                }
                            },
                            Err(e) => {
                                log::error!("{} stream error: {e}; reconnecting", kind.label());
                                break;
                            }
                        }
                    }
                }
            }
            Err(e) => {
                log::error!("failed to connect to {} stream: {e}", kind.label());
            }
        }
        sleep(Duration::from_secs(5)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_is_fifo_under_capacity() {
        let q = ConflatingQueue::new(4);
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.len(), 3);
        assert_eq!(q.dropped(), 0);
    }

    #[test]
    fn queue_drops_oldest_when_full() {
        let q = ConflatingQueue::new(2);
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.len(), 2);
        assert_eq!(q.dropped(), 1);
        // The newest entries survive.
        assert_eq!(q.inner.lock().unwrap().iter().copied().collect::<Vec<_>>(), vec![2, 3]);
    }

    #[tokio::test]
    async fn pop_returns_in_push_order() {
        let q = ConflatingQueue::new(8);
        q.push("a");
        q.push("b");
        assert_eq!(q.pop().await, "a");
        assert_eq!(q.pop().await, "b");
    }

    #[tokio::test]
    async fn pop_wakes_on_push() {
        let q = Arc::new(ConflatingQueue::new(8));
        let q2 = Arc::clone(&q);
        let handle = tokio::spawn(async move { q2.pop().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.push(42);
        assert_eq!(handle.await.unwrap(), 42);
    }

    #[test]
    fn decode_rejects_non_json_frames() {
        let msg = ZmqMessage::from(vec![0xff, 0xfe]);
        assert!(decode(StreamKind::Detection, &msg).is_none());
    }

    #[test]
    fn decode_detection_frame() {
        let raw = serde_json::json!([
            {"Basic ID": {"id_type": "Serial Number (ANSI/CTA-2063-A)", "id": "SN1"}},
            {"Location/Vector Message": {"latitude": 1.0, "longitude": 2.0}}
        ])
        .to_string();
        let msg = ZmqMessage::from(raw);
        match decode(StreamKind::Detection, &msg) {
            Some(Update::Drone(u)) => assert_eq!(u.id.as_deref(), Some("drone-SN1")),
            other => panic!("unexpected decode result: {other:?}"),
        }
    }
}

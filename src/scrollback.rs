use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;

pub const BROADCAST_CAPACITY: usize = 64;

/// Per-session output hub: a bounded byte ring for late joiners plus a
/// broadcast channel for live fan-out.
///
/// The ring and the broadcast sender live behind one mutex so that
/// `attach()` can copy the ring and subscribe atomically. A viewer that
/// attaches while output is flowing either sees a chunk in its snapshot
/// or receives it on its subscription, never neither.
#[derive(Clone)]
pub struct OutputHub {
    inner: Arc<Mutex<HubInner>>,
}

struct HubInner {
    ring: VecDeque<u8>,
    limit: usize,
    tx: broadcast::Sender<Bytes>,
}

impl OutputHub {
    pub fn new(limit: usize) -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(HubInner {
                ring: VecDeque::with_capacity(limit.min(4096)),
                limit,
                tx,
            })),
        }
    }

    /// Append a chunk to the ring and broadcast it to live subscribers.
    pub fn push(&self, data: Bytes) {
        let inner = &mut *self.inner.lock();
        if data.len() >= inner.limit {
            // Chunk alone fills the ring; keep only its tail.
            inner.ring.clear();
            inner.ring.extend(&data[data.len() - inner.limit..]);
        } else {
            let overflow = (inner.ring.len() + data.len()).saturating_sub(inner.limit);
            inner.ring.drain(..overflow);
            inner.ring.extend(&data[..]);
        }
        // Ignore error - means no receivers
        let _ = inner.tx.send(data);
    }

    /// Snapshot the ring and subscribe, atomically under the hub lock.
    pub fn attach(&self) -> (Vec<u8>, broadcast::Receiver<Bytes>) {
        let inner = self.inner.lock();
        let snapshot: Vec<u8> = inner.ring.iter().copied().collect();
        (snapshot, inner.tx.subscribe())
    }

    /// Current ring contents without subscribing.
    pub fn snapshot(&self) -> Vec<u8> {
        self.inner.lock().ring.iter().copied().collect()
    }

    /// Empty the ring. Live subscribers are unaffected.
    pub fn clear(&self) {
        self.inner.lock().ring.clear();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.inner.lock().tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn push_with_no_subscribers_does_not_panic() {
        let hub = OutputHub::new(1024);
        hub.push(Bytes::from("hello"));
    }

    #[tokio::test]
    async fn subscriber_receives_pushed_chunk() {
        let hub = OutputHub::new(1024);
        let mut rx = hub.subscribe();

        hub.push(Bytes::from("hello"));

        let received = rx.recv().await.expect("should receive chunk");
        assert_eq!(received, Bytes::from("hello"));
    }

    #[tokio::test]
    async fn attach_returns_prior_output_as_snapshot() {
        let hub = OutputHub::new(1024);
        hub.push(Bytes::from("one "));
        hub.push(Bytes::from("two "));

        let (snapshot, mut rx) = hub.attach();
        assert_eq!(snapshot, b"one two ");

        hub.push(Bytes::from("three"));
        let live = rx.recv().await.expect("should receive live chunk");
        assert_eq!(live, Bytes::from("three"));
    }

    #[tokio::test]
    async fn snapshot_and_subscription_do_not_overlap() {
        let hub = OutputHub::new(1024);
        hub.push(Bytes::from("before"));

        let (snapshot, mut rx) = hub.attach();
        hub.push(Bytes::from("after"));

        assert_eq!(snapshot, b"before");
        let first_live = rx.recv().await.expect("live chunk");
        assert_eq!(first_live, Bytes::from("after"));
    }

    #[tokio::test]
    async fn ring_evicts_oldest_bytes() {
        let hub = OutputHub::new(8);
        hub.push(Bytes::from("12345678"));
        hub.push(Bytes::from("AB"));

        assert_eq!(hub.snapshot(), b"345678AB");
    }

    #[tokio::test]
    async fn oversized_chunk_keeps_only_tail() {
        let hub = OutputHub::new(4);
        hub.push(Bytes::from("abcdefgh"));
        assert_eq!(hub.snapshot(), b"efgh");
    }

    #[tokio::test]
    async fn clear_empties_ring_but_not_stream() {
        let hub = OutputHub::new(1024);
        let mut rx = hub.subscribe();
        hub.push(Bytes::from("data"));
        hub.clear();

        assert!(hub.snapshot().is_empty());
        // The pre-clear chunk already reached the subscriber.
        assert_eq!(rx.recv().await.unwrap(), Bytes::from("data"));
    }

    #[tokio::test]
    async fn multiple_subscribers_receive() {
        let hub = OutputHub::new(1024);
        let mut rx1 = hub.subscribe();
        let mut rx2 = hub.subscribe();

        hub.push(Bytes::from("broadcast"));

        assert_eq!(rx1.recv().await.unwrap(), Bytes::from("broadcast"));
        assert_eq!(rx2.recv().await.unwrap(), Bytes::from("broadcast"));
    }

    #[tokio::test]
    async fn concurrent_attaches_see_identical_snapshots() {
        let hub = OutputHub::new(1024);
        hub.push(Bytes::from("shared history"));

        let hubs: Vec<_> = (0..8).map(|_| hub.clone()).collect();
        let handles: Vec<_> = hubs
            .into_iter()
            .map(|h| tokio::spawn(async move { h.attach().0 }))
            .collect();
        for handle in handles {
            let snapshot = handle.await.unwrap();
            assert_eq!(snapshot, b"shared history");
        }
    }
}

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, warn};

use crate::config::RpcConfig;
use crate::correlation::ResponseWaiters;
use crate::error::RpcError;
use crate::packet::PacketType;
use crate::transport::DatagramTransport;

/// One outbound RPC whose packets are re-sent until the peer acknowledges it,
///  a full response for it is observed, or the retry budget runs out.
struct PendingRpc {
    peer: SocketAddr,
    packet_type: PacketType,
    encoded_packets: Vec<Bytes>,
    first_sent_at: Instant,
    last_sent_at: Instant,
    attempt_count: u32,
}

/// Tracks unacknowledged outbound RPCs and drives their retransmission from a
///  periodic ticker. The map lock is held only around map mutation, never
///  across a send.
pub struct RetransmitQueue {
    config: Arc<RpcConfig>,
    transport: Arc<dyn DatagramTransport>,
    waiters: Arc<ResponseWaiters>,
    pending: Mutex<FxHashMap<u64, PendingRpc>>,
}

impl RetransmitQueue {
    pub fn new(
        config: Arc<RpcConfig>,
        transport: Arc<dyn DatagramTransport>,
        waiters: Arc<ResponseWaiters>,
    ) -> RetransmitQueue {
        RetransmitQueue {
            config,
            transport,
            waiters,
            pending: Mutex::new(FxHashMap::default()),
        }
    }

    /// Transmit all packets of an RPC once and track it for retransmission.
    pub async fn register(
        &self,
        rpc_id: u64,
        peer: SocketAddr,
        packet_type: PacketType,
        encoded_packets: Vec<Bytes>,
    ) -> Result<(), RpcError> {
        for packet in &encoded_packets {
            self.transport
                .send_to(peer, packet)
                .await
                .map_err(RpcError::Transport)?;
        }

        let now = Instant::now();
        let evicted = {
            let mut pending = self.pending.lock().unwrap();

            let evicted = if pending.len() >= self.config.pending_rpc_capacity {
                let oldest = pending
                    .iter()
                    .min_by_key(|(_, entry)| entry.first_sent_at)
                    .map(|(&id, _)| id);
                oldest.and_then(|id| pending.remove(&id).map(|_| id))
            }
            else {
                None
            };

            pending.insert(rpc_id, PendingRpc {
                peer,
                packet_type,
                encoded_packets,
                first_sent_at: now,
                last_sent_at: now,
                attempt_count: 1,
            });
            evicted
        };

        if let Some(evicted_id) = evicted {
            warn!("pending RPCs at capacity, evicting oldest rpc {}", evicted_id);
            self.waiters.fail(evicted_id, RpcError::Timeout);
        }
        Ok(())
    }

    /// The RPC was acknowledged or answered - stop retransmitting it.
    pub fn complete(&self, rpc_id: u64) {
        self.pending.lock().unwrap().remove(&rpc_id);
    }

    /// Drop an RPC without waking anybody (used on cancellation).
    pub fn abandon(&self, rpc_id: u64) {
        self.pending.lock().unwrap().remove(&rpc_id);
    }

    /// One ticker round: expire entries whose retry budget or deadline is
    ///  gone, re-send everything else.
    async fn tick(&self) {
        let now = Instant::now();

        let mut expired = Vec::new();
        let mut resend = Vec::new();
        {
            let mut pending = self.pending.lock().unwrap();
            pending.retain(|&rpc_id, entry| {
                let out_of_attempts = entry.attempt_count >= self.config.max_attempts;
                let past_deadline = now.duration_since(entry.first_sent_at) > self.config.call_deadline;

                if out_of_attempts || past_deadline {
                    expired.push((rpc_id, entry.packet_type, entry.attempt_count));
                    false
                }
                else {
                    entry.attempt_count += 1;
                    entry.last_sent_at = now;
                    resend.push((rpc_id, entry.peer, entry.encoded_packets.clone()));
                    true
                }
            });
        }

        for (rpc_id, packet_type, attempts) in expired {
            match packet_type {
                PacketType::Request => {
                    debug!("rpc {} unanswered after {} attempts - giving up", rpc_id, attempts);
                    self.waiters.fail(rpc_id, RpcError::Timeout);
                }
                _ => {
                    // response packets have no local waiter; the peer simply
                    //  never confirmed receipt
                    debug!("rpc {} response unconfirmed after {} attempts - dropping", rpc_id, attempts);
                }
            }
        }

        for (rpc_id, peer, packets) in resend {
            debug!("retransmitting {} packets of rpc {} to {:?}", packets.len(), rpc_id, peer);
            for packet in packets {
                if let Err(e) = self.transport.send_to(peer, &packet).await {
                    error!("error retransmitting rpc {} to {:?}: {:#}", rpc_id, peer, e);
                    break;
                }
            }
        }
    }

    pub fn spawn_tick_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(queue.config.retry_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // the first tick fires immediately
            loop {
                ticker.tick().await;
                queue.tick().await;
            }
        })
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockDatagramTransport;
    use mockall::predicate::{always, eq};
    use std::time::Duration;

    fn test_config() -> Arc<RpcConfig> {
        Arc::new(RpcConfig {
            retry_interval: Duration::from_millis(100),
            max_attempts: 3,
            call_deadline: Duration::from_secs(5),
            pending_rpc_capacity: 4,
            ..RpcConfig::default_ipv4()
        })
    }

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 4000))
    }

    #[tokio::test]
    async fn test_register_sends_every_packet_once() {
        let mut transport = MockDatagramTransport::new();
        transport
            .expect_send_to()
            .with(eq(peer()), always())
            .times(3)
            .returning(|_, _| Ok(()));

        let queue = RetransmitQueue::new(
            test_config(),
            Arc::new(transport),
            Arc::new(ResponseWaiters::new()),
        );

        let packets = vec![Bytes::from_static(b"a"), Bytes::from_static(b"b"), Bytes::from_static(b"c")];
        queue.register(1, peer(), PacketType::Request, packets).await.unwrap();
        assert_eq!(queue.pending_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_resends_until_budget_exhausted_then_times_out() {
        let mut transport = MockDatagramTransport::new();
        // initial send + 2 retransmissions = max_attempts of 3
        transport.expect_send_to().times(3).returning(|_, _| Ok(()));

        let waiters = Arc::new(ResponseWaiters::new());
        let queue = RetransmitQueue::new(test_config(), Arc::new(transport), waiters.clone());

        let rx = waiters.register(1);
        queue
            .register(1, peer(), PacketType::Request, vec![Bytes::from_static(b"x")])
            .await
            .unwrap();

        queue.tick().await; // attempt 2
        queue.tick().await; // attempt 3
        queue.tick().await; // budget exhausted - expires
        assert_eq!(queue.pending_count(), 0);

        assert!(matches!(rx.await.unwrap(), Err(RpcError::Timeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_complete_stops_retransmission() {
        let mut transport = MockDatagramTransport::new();
        transport.expect_send_to().times(1).returning(|_, _| Ok(()));

        let queue = Arc::new(RetransmitQueue::new(
            test_config(),
            Arc::new(transport),
            Arc::new(ResponseWaiters::new()),
        ));

        queue
            .register(1, peer(), PacketType::Request, vec![Bytes::from_static(b"x")])
            .await
            .unwrap();
        queue.complete(1);

        queue.tick().await;
        assert_eq!(queue.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_response_entry_wakes_nobody() {
        let mut transport = MockDatagramTransport::new();
        transport.expect_send_to().times(3).returning(|_, _| Ok(()));

        let waiters = Arc::new(ResponseWaiters::new());
        let queue = RetransmitQueue::new(test_config(), Arc::new(transport), waiters.clone());

        queue
            .register(8, peer(), PacketType::Response, vec![Bytes::from_static(b"r")])
            .await
            .unwrap();

        for _ in 0..3 {
            queue.tick().await;
        }
        assert_eq!(queue.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_eviction_fails_oldest_waiter() {
        let mut transport = MockDatagramTransport::new();
        transport.expect_send_to().returning(|_, _| Ok(()));

        let waiters = Arc::new(ResponseWaiters::new());
        let queue = RetransmitQueue::new(test_config(), Arc::new(transport), waiters.clone());

        let oldest_rx = waiters.register(0);
        for rpc_id in 0..5u64 {
            tokio::time::advance(Duration::from_millis(1)).await;
            queue
                .register(rpc_id, peer(), PacketType::Request, vec![Bytes::from_static(b"x")])
                .await
                .unwrap();
        }

        assert_eq!(queue.pending_count(), 4);
        assert!(matches!(oldest_rx.await.unwrap(), Err(RpcError::Timeout)));
    }
}

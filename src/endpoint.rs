use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, span, trace, warn, Instrument, Level};
use uuid::Uuid;

use crate::config::RpcConfig;
use crate::correlation::{ResponseWaiters, RpcIdSequence, SeenIds};
use crate::error::RpcError;
use crate::fragmentation::{fragment_message, ReassemblyBuffers};
use crate::packet::{Packet, PacketHeader, PacketType};
use crate::retransmit::RetransmitQueue;
use crate::transport::DatagramTransport;

/// Hands complete inbound requests upward, decoupling the protocol engine
///  from what a particular endpoint (server or client) does with them.
#[async_trait]
pub trait InboundDispatcher: Send + Sync + 'static {
    /// A fully reassembled, not-seen-before request.
    async fn on_request(&self, peer: SocketAddr, rpc_id: u64, payload: Vec<u8>);

    /// A request that reassembled completely but was already delivered once.
    async fn on_duplicate_request(&self, peer: SocketAddr, rpc_id: u64);
}

/// The place where the protocol layers come together: owns the socket, the
///  retry queue and the correlation state, and runs the receive loop that
///  feeds them. Server and client are both built on top of one of these.
pub struct RpcEndpoint {
    config: Arc<RpcConfig>,
    transport: Arc<dyn DatagramTransport>,
    ids: RpcIdSequence,
    waiters: Arc<ResponseWaiters>,
    retransmit: Arc<RetransmitQueue>,
}

impl RpcEndpoint {
    pub fn new(config: Arc<RpcConfig>, transport: Arc<dyn DatagramTransport>) -> RpcEndpoint {
        let waiters = Arc::new(ResponseWaiters::new());
        let retransmit = Arc::new(RetransmitQueue::new(
            config.clone(),
            transport.clone(),
            waiters.clone(),
        ));

        RpcEndpoint {
            config,
            transport,
            ids: RpcIdSequence::new(),
            waiters,
            retransmit,
        }
    }

    pub fn config(&self) -> &Arc<RpcConfig> {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn DatagramTransport> {
        &self.transport
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn next_rpc_id(&self) -> u64 {
        self.ids.next()
    }

    pub fn waiters(&self) -> &Arc<ResponseWaiters> {
        &self.waiters
    }

    pub fn retransmit(&self) -> &Arc<RetransmitQueue> {
        &self.retransmit
    }

    pub fn spawn_retransmit_loop(&self) -> JoinHandle<()> {
        self.retransmit.spawn_tick_loop()
    }

    /// Fragment a payload and encode each fragment into its final datagram.
    pub fn encode_rpc(
        &self,
        rpc_id: u64,
        packet_type: PacketType,
        payload: &[u8],
    ) -> Result<Vec<Bytes>, RpcError> {
        let packets = fragment_message(rpc_id, packet_type, payload, self.config.max_payload())?;
        Ok(packets.iter().map(Packet::encode).collect())
    }

    /// Transmit pre-encoded datagrams once and track them for retransmission.
    pub async fn send_encoded(
        &self,
        peer: SocketAddr,
        rpc_id: u64,
        packet_type: PacketType,
        encoded_packets: Vec<Bytes>,
    ) -> Result<(), RpcError> {
        debug!(
            "sending rpc {} ({:?}, {} packets) to {:?}",
            rpc_id,
            packet_type,
            encoded_packets.len(),
            peer
        );
        self.retransmit.register(rpc_id, peer, packet_type, encoded_packets).await
    }

    pub async fn send_rpc(
        &self,
        peer: SocketAddr,
        rpc_id: u64,
        packet_type: PacketType,
        payload: &[u8],
    ) -> Result<(), RpcError> {
        let encoded = self.encode_rpc(rpc_id, packet_type, payload)?;
        self.send_encoded(peer, rpc_id, packet_type, encoded).await
    }

    /// Fire a single ACK datagram confirming full receipt of an RPC. ACKs are
    ///  never retransmitted - if one is lost, the peer re-sends and gets
    ///  another.
    async fn send_ack(&self, peer: SocketAddr, rpc_id: u64) {
        let ack = Packet {
            header: PacketHeader {
                rpc_id,
                total_packets: 1,
                seq_number: 0,
                packet_type: PacketType::Ack,
            },
            payload: Bytes::new(),
        };

        if let Err(e) = self.transport.send_to(peer, &ack.encode()).await {
            error!("error sending ACK for rpc {} to {:?}: {:#}", rpc_id, peer, e);
        }
    }

    /// The single receive task: decodes datagrams, feeds reassembly, and
    ///  routes complete payloads. The reassembly buffers and seen-id sets are
    ///  owned here exclusively, so they need no locking; anything slow is the
    ///  dispatcher's responsibility to offload.
    ///
    /// Runs until the process stops. Per-packet errors never terminate it.
    pub async fn recv_loop(self: Arc<Self>, dispatcher: Arc<dyn InboundDispatcher>) {
        let mut reassembly = ReassemblyBuffers::new(
            self.config.reassembly_buffer_capacity,
            self.config.reassembly_timeout,
        );
        let mut seen_requests = SeenIds::new(self.config.seen_id_capacity, self.config.seen_id_max_age);
        let mut seen_responses = SeenIds::new(self.config.seen_id_capacity, self.config.seen_id_max_age);

        let mut buf = vec![0u8; self.config.max_datagram_size];
        loop {
            let (num_read, from) = match self.transport.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {:#}", e);
                    continue;
                }
            };

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "packet_received", ?correlation_id);

            let packet = match span.in_scope(|| Packet::decode(&buf[..num_read])) {
                Ok(packet) => packet,
                Err(_) => {
                    warn!("received packet with unparsable header from {:?}, dropping", from);
                    continue;
                }
            };

            self.handle_packet(
                &dispatcher,
                &mut reassembly,
                &mut seen_requests,
                &mut seen_responses,
                from,
                packet,
            )
            .instrument(span)
            .await;
        }
    }

    async fn handle_packet(
        &self,
        dispatcher: &Arc<dyn InboundDispatcher>,
        reassembly: &mut ReassemblyBuffers,
        seen_requests: &mut SeenIds,
        seen_responses: &mut SeenIds,
        from: SocketAddr,
        packet: Packet,
    ) {
        let rpc_id = packet.header.rpc_id;
        let packet_type = packet.header.packet_type;
        trace!(
            "received fragment {}/{} of rpc {} ({:?}) from {:?}",
            packet.header.seq_number,
            packet.header.total_packets,
            rpc_id,
            packet_type,
            from
        );

        match packet_type {
            PacketType::Ack => {
                self.retransmit.complete(rpc_id);
            }
            PacketType::Request => {
                let now = Instant::now();
                let Some(payload) = reassembly.on_packet(from, packet, now) else {
                    return;
                };

                if seen_requests.insert(rpc_id, now) {
                    dispatcher.on_request(from, rpc_id, payload).await;
                }
                else {
                    debug!("suppressing duplicate delivery of request {} from {:?}", rpc_id, from);
                    dispatcher.on_duplicate_request(from, rpc_id).await;
                }
            }
            PacketType::Response => {
                let now = Instant::now();
                let Some(payload) = reassembly.on_packet(from, packet, now) else {
                    return;
                };

                // whatever happens to the payload, the peer may stop
                //  re-sending the response now
                self.retransmit.complete(rpc_id);
                self.send_ack(from, rpc_id).await;

                if seen_responses.insert(rpc_id, now) {
                    if !self.waiters.fulfill(rpc_id, payload) {
                        debug!("response for rpc {} has no pending call - dropping", rpc_id);
                    }
                }
                else {
                    debug!("suppressing duplicate delivery of response {} from {:?}", rpc_id, from);
                }
            }
        }
    }
}

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::RpcConfig;
use crate::context::CallContext;
use crate::endpoint::{InboundDispatcher, RpcEndpoint};
use crate::frame::Frame;
use crate::interceptor::{Interceptor, InterceptorChain, RpcRequest, RpcResponse};
use crate::metadata::Metadata;
use crate::packet::PacketType;
use crate::resolver::Resolver;
use crate::serializer::Serializer;
use crate::service::ServiceDesc;
use crate::transport::{DatagramTransport, UdpTransport};

/// The RPC server: a service registry on top of an [`RpcEndpoint`]. Services
///  are registered up front; [`Server::start`] freezes the registry and
///  serves until the process stops.
pub struct Server<S: Serializer> {
    endpoint: Arc<RpcEndpoint>,
    serializer: S,
    services: FxHashMap<String, ServiceDesc<S>>,
    chain: InterceptorChain,
}

impl<S: Serializer> Server<S> {
    pub async fn new(
        addr: &str,
        serializer: S,
        interceptors: Vec<Arc<dyn Interceptor>>,
    ) -> anyhow::Result<Server<S>> {
        let bind_addr = Resolver::default().resolve(addr).await?;
        Self::with_config(bind_addr, serializer, RpcConfig::default_ipv4(), interceptors).await
    }

    pub async fn with_config(
        bind_addr: SocketAddr,
        serializer: S,
        config: RpcConfig,
        interceptors: Vec<Arc<dyn Interceptor>>,
    ) -> anyhow::Result<Server<S>> {
        config.validate()?;
        let transport = Arc::new(UdpTransport::bind(bind_addr).await?);
        Ok(Self::with_transport(transport, serializer, config, interceptors))
    }

    /// Build on an externally supplied transport (fault-injecting wrappers,
    ///  pre-bound sockets).
    pub fn with_transport(
        transport: Arc<dyn DatagramTransport>,
        serializer: S,
        config: RpcConfig,
        interceptors: Vec<Arc<dyn Interceptor>>,
    ) -> Server<S> {
        Server {
            endpoint: Arc::new(RpcEndpoint::new(Arc::new(config), transport)),
            serializer,
            services: FxHashMap::default(),
            chain: InterceptorChain::new(interceptors),
        }
    }

    pub fn register_service(&mut self, desc: ServiceDesc<S>) {
        info!("registered service {:?}", desc.name());
        if self.services.insert(desc.name().to_string(), desc).is_some() {
            warn!("a service with that name was already registered - replacing it");
        }
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.endpoint.local_addr()
    }

    /// Serve requests until the surrounding task is dropped. The registry is
    ///  immutable from here on.
    pub async fn start(self) -> anyhow::Result<()> {
        info!("server listening on {:?}", self.endpoint.local_addr()?);

        let retransmit_loop = self.endpoint.spawn_retransmit_loop();

        let config = self.endpoint.config().clone();
        let state = Arc::new(ServerState {
            endpoint: self.endpoint.clone(),
            serializer: self.serializer,
            services: self.services,
            chain: self.chain,
            response_cache: Mutex::new(ResponseCache::new(
                config.seen_id_capacity,
                config.seen_id_max_age,
            )),
        });

        self.endpoint.recv_loop(Arc::new(RequestDispatcher(state))).await;

        retransmit_loop.abort();
        Ok(())
    }
}

struct ServerState<S: Serializer> {
    endpoint: Arc<RpcEndpoint>,
    serializer: S,
    services: FxHashMap<String, ServiceDesc<S>>,
    chain: InterceptorChain,
    response_cache: Mutex<ResponseCache>,
}

impl<S: Serializer> ServerState<S> {
    /// The per-request pipeline. Every failure is contained to this request:
    ///  the caller logs it and the server keeps serving.
    async fn dispatch(&self, peer: SocketAddr, rpc_id: u64, payload: Vec<u8>) -> anyhow::Result<()> {
        let frame = Frame::deser(&mut payload.as_slice()).context("malformed request frame")?;

        let service = self
            .services
            .get(&frame.service)
            .with_context(|| format!("unknown service {:?}", frame.service))?;
        let handler = service
            .method(&frame.method)
            .with_context(|| format!("unknown method {}.{}", frame.service, frame.method))?;

        let incoming = Metadata::decode(&mut frame.headers.clone()).context("malformed request headers")?;
        if !incoming.is_empty() {
            debug!("request {} for {}.{} carries headers {:?}", rpc_id, frame.service, frame.method, incoming);
        }
        let mut ctx = CallContext::new();
        ctx.set_incoming_metadata(incoming);

        let request = RpcRequest {
            id: rpc_id,
            service: frame.service.clone(),
            method: frame.method.clone(),
            payload: frame.payload.clone(),
        };
        let request = self
            .chain
            .process_request(&mut ctx, request)
            .await
            .context("request interceptor")?;

        let (response_payload, mut ctx) = handler
            .invoke(&self.serializer, ctx, &request.payload)
            .await
            .context("handler")?;

        let response = RpcResponse {
            payload: response_payload.into(),
            error: None,
        };
        let response = self
            .chain
            .process_response(&mut ctx, response)
            .await
            .context("response interceptor")?;

        let headers = ctx.outgoing_metadata().encode().context("encoding response headers")?;
        let mut frame_buf = BytesMut::new();
        Frame {
            service: frame.service,
            method: frame.method,
            headers,
            payload: response.payload,
        }
        .ser(&mut frame_buf)
        .context("framing response")?;

        let encoded = self.endpoint.encode_rpc(rpc_id, PacketType::Response, &frame_buf)?;
        self.response_cache
            .lock()
            .unwrap()
            .insert(rpc_id, encoded.clone(), Instant::now());

        self.endpoint
            .send_encoded(peer, rpc_id, PacketType::Response, encoded)
            .await?;
        Ok(())
    }
}

struct RequestDispatcher<S: Serializer>(Arc<ServerState<S>>);

#[async_trait]
impl<S: Serializer> InboundDispatcher for RequestDispatcher<S> {
    async fn on_request(&self, peer: SocketAddr, rpc_id: u64, payload: Vec<u8>) {
        // slow handlers must not stall reassembly, so dispatch runs on its
        //  own task
        let state = self.0.clone();
        tokio::spawn(async move {
            if let Err(e) = state.dispatch(peer, rpc_id, payload).await {
                warn!("dropping request {} from {:?}: {:#}", rpc_id, peer, e);
            }
        });
    }

    async fn on_duplicate_request(&self, peer: SocketAddr, rpc_id: u64) {
        let cached = self.0.response_cache.lock().unwrap().get(rpc_id);
        match cached {
            Some(packets) => {
                debug!("re-sending cached response for rpc {} to {:?}", rpc_id, peer);
                for packet in packets {
                    if let Err(e) = self.0.endpoint.transport().send_to(peer, &packet).await {
                        warn!("error re-sending cached response for rpc {}: {:#}", rpc_id, e);
                        break;
                    }
                }
            }
            None => {
                debug!("duplicate request {} has no cached response - dropping", rpc_id);
            }
        }
    }
}

/// Recently sent responses, kept around so a duplicate request (the peer
///  retransmitting because the response got lost) can be answered without
///  running the handler again. Eviction mirrors the seen-id policy.
struct ResponseCache {
    capacity: usize,
    max_age: Duration,
    entries: FxHashMap<u64, (Instant, Vec<Bytes>)>,
    insertion_order: VecDeque<u64>,
}

impl ResponseCache {
    fn new(capacity: usize, max_age: Duration) -> ResponseCache {
        ResponseCache {
            capacity,
            max_age,
            entries: FxHashMap::default(),
            insertion_order: VecDeque::new(),
        }
    }

    fn insert(&mut self, rpc_id: u64, packets: Vec<Bytes>, now: Instant) {
        self.prune(now);
        while self.entries.len() >= self.capacity {
            match self.insertion_order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }

        if self.entries.insert(rpc_id, (now, packets)).is_none() {
            self.insertion_order.push_back(rpc_id);
        }
    }

    fn get(&mut self, rpc_id: u64) -> Option<Vec<Bytes>> {
        self.entries.get(&rpc_id).map(|(_, packets)| packets.clone())
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.insertion_order.front() {
            match self.entries.get(&oldest) {
                Some(&(inserted_at, _)) if now.duration_since(inserted_at) > self.max_age => {
                    self.insertion_order.pop_front();
                    self.entries.remove(&oldest);
                }
                Some(_) => break,
                None => {
                    self.insertion_order.pop_front();
                }
            }
        }
    }
}

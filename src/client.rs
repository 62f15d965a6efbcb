use std::cmp::min;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::BytesMut;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::RpcConfig;
use crate::context::CallContext;
use crate::endpoint::{InboundDispatcher, RpcEndpoint};
use crate::error::RpcError;
use crate::frame::Frame;
use crate::interceptor::{Interceptor, InterceptorChain, RpcRequest, RpcResponse};
use crate::metadata::Metadata;
use crate::packet::PacketType;
use crate::resolver::Resolver;
use crate::serializer::Serializer;
use crate::transport::{DatagramTransport, UdpTransport};

/// Synchronous request/response against one peer. A client owns its own
///  socket plus the receive and retry tasks driving it; concurrent `call`s
///  multiplex over that socket and are matched back by rpc id.
pub struct Client<S: Serializer> {
    endpoint: Arc<RpcEndpoint>,
    serializer: S,
    peer_addr: SocketAddr,
    chain: InterceptorChain,
    recv_loop: JoinHandle<()>,
    retransmit_loop: JoinHandle<()>,
}

impl<S: Serializer> Client<S> {
    pub async fn new(serializer: S, target: &str) -> anyhow::Result<Client<S>> {
        Self::with_config(serializer, target, RpcConfig::default_ipv4(), Vec::new()).await
    }

    pub async fn with_config(
        serializer: S,
        target: &str,
        config: RpcConfig,
        interceptors: Vec<Arc<dyn Interceptor>>,
    ) -> anyhow::Result<Client<S>> {
        let peer_addr = Resolver::default().resolve(target).await?;
        let bind_addr = if peer_addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let transport = Arc::new(UdpTransport::bind(bind_addr.parse().expect("wildcard address parses")).await?);
        Ok(Self::with_transport(serializer, transport, peer_addr, config, interceptors))
    }

    /// Build on an externally supplied transport (fault-injecting wrappers,
    ///  pre-bound sockets).
    pub fn with_transport(
        serializer: S,
        transport: Arc<dyn DatagramTransport>,
        peer_addr: SocketAddr,
        config: RpcConfig,
        interceptors: Vec<Arc<dyn Interceptor>>,
    ) -> Client<S> {
        let endpoint = Arc::new(RpcEndpoint::new(Arc::new(config), transport));

        let recv_loop = tokio::spawn(endpoint.clone().recv_loop(Arc::new(RejectRequests)));
        let retransmit_loop = endpoint.spawn_retransmit_loop();

        Client {
            endpoint,
            serializer,
            peer_addr,
            chain: InterceptorChain::new(interceptors),
            recv_loop,
            retransmit_loop,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Invoke `service.method` with `request` and wait for the response, a
    ///  timeout (capped by the configured call deadline), or cancellation of
    ///  `ctx`.
    ///
    /// Headers in the context's outgoing metadata travel with the request;
    ///  the response's headers are left in its incoming metadata.
    pub async fn call<Req, Resp>(
        &self,
        service: &str,
        method: &str,
        request: &Req,
        ctx: &mut CallContext,
        timeout: Duration,
    ) -> Result<Resp, RpcError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let rpc_id = self.endpoint.next_rpc_id();
        let waiter = self.endpoint.waiters().register(rpc_id);

        let result = self.do_call(rpc_id, waiter, service, method, request, ctx, timeout).await;

        // success, failure or cancellation - nothing may stay pending
        self.endpoint.waiters().remove(rpc_id);
        self.endpoint.retransmit().abandon(rpc_id);

        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn do_call<Req, Resp>(
        &self,
        rpc_id: u64,
        waiter: oneshot::Receiver<Result<Vec<u8>, RpcError>>,
        service: &str,
        method: &str,
        request: &Req,
        ctx: &mut CallContext,
        timeout: Duration,
    ) -> Result<Resp, RpcError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let payload = self.serializer.marshal(request).map_err(RpcError::Serializer)?;

        let request = RpcRequest {
            id: rpc_id,
            service: service.to_string(),
            method: method.to_string(),
            payload: payload.into(),
        };
        let request = self
            .chain
            .process_request(ctx, request)
            .await
            .map_err(RpcError::Interceptor)?;

        let headers = ctx.outgoing_metadata().encode().map_err(RpcError::Serializer)?;
        let mut frame_buf = BytesMut::new();
        Frame {
            service: request.service,
            method: request.method,
            headers,
            payload: request.payload,
        }
        .ser(&mut frame_buf)
        .map_err(RpcError::Serializer)?;

        self.endpoint
            .send_rpc(self.peer_addr, rpc_id, PacketType::Request, &frame_buf)
            .await?;

        let effective_timeout = min(timeout, self.endpoint.config().call_deadline);
        let response_payload = tokio::select! {
            outcome = waiter => match outcome {
                Ok(Ok(payload)) => payload,
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(RpcError::Timeout),
            },
            _ = sleep(effective_timeout) => {
                debug!("call {} timed out after {:?}", rpc_id, effective_timeout);
                return Err(RpcError::Timeout);
            }
            _ = ctx.cancelled() => {
                debug!("call {} cancelled", rpc_id);
                return Err(RpcError::Cancelled);
            }
        };

        let frame = Frame::deser(&mut response_payload.as_slice())
            .map_err(RpcError::MalformedResponse)?;
        let incoming = Metadata::decode(&mut frame.headers.clone())
            .context("malformed response headers")
            .map_err(RpcError::MalformedResponse)?;
        ctx.set_incoming_metadata(incoming);

        let response = RpcResponse {
            payload: frame.payload,
            error: None,
        };
        let response = self
            .chain
            .process_response(ctx, response)
            .await
            .map_err(RpcError::Interceptor)?;

        self.serializer
            .unmarshal(&response.payload)
            .map_err(RpcError::Serializer)
    }
}

impl<S: Serializer> Drop for Client<S> {
    fn drop(&mut self) {
        self.recv_loop.abort();
        self.retransmit_loop.abort();
    }
}

/// Clients answer nothing: an inbound request means a confused peer.
struct RejectRequests;

#[async_trait]
impl InboundDispatcher for RejectRequests {
    async fn on_request(&self, peer: SocketAddr, rpc_id: u64, _payload: Vec<u8>) {
        warn!("received request {} from {:?} on a client endpoint - dropping", rpc_id, peer);
    }

    async fn on_duplicate_request(&self, _peer: SocketAddr, _rpc_id: u64) {}
}

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::context::CallContext;
use crate::serializer::Serializer;

/// One registered method: decodes the request payload, runs user code,
///  encodes the response payload. Implementations are registered once at
///  server start and invoked concurrently afterwards.
///
/// The returned context replaces the one passed in - its outgoing metadata
///  becomes the response headers.
#[async_trait]
pub trait MethodHandler<S: Serializer>: Send + Sync + 'static {
    async fn invoke(
        &self,
        serializer: &S,
        ctx: CallContext,
        payload: &[u8],
    ) -> anyhow::Result<(Vec<u8>, CallContext)>;
}

/// Describes an RPC service: its name and the handler for each method.
pub struct ServiceDesc<S: Serializer> {
    name: String,
    methods: FxHashMap<String, Arc<dyn MethodHandler<S>>>,
}

impl<S: Serializer> ServiceDesc<S> {
    pub fn new(name: impl Into<String>) -> ServiceDesc<S> {
        ServiceDesc {
            name: name.into(),
            methods: FxHashMap::default(),
        }
    }

    pub fn with_method(
        mut self,
        method_name: impl Into<String>,
        handler: Arc<dyn MethodHandler<S>>,
    ) -> ServiceDesc<S> {
        self.methods.insert(method_name.into(), handler);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn method(&self, method_name: &str) -> Option<&Arc<dyn MethodHandler<S>>> {
        self.methods.get(method_name)
    }
}

/// Adapter turning a typed async function into a [`MethodHandler`]: the
///  serializer decodes the request into `Req` and encodes the `Resp` the
///  function returns.
pub struct TypedHandler<Svc, Req, Resp, F> {
    service_impl: Arc<Svc>,
    handler: F,
    _marker: PhantomData<fn(Req) -> Resp>,
}

/// Wrap `async fn(impl, ctx, request) -> (response, ctx)` for registration in
///  a [`ServiceDesc`].
pub fn typed_handler<Svc, Req, Resp, F, Fut>(
    service_impl: Arc<Svc>,
    handler: F,
) -> Arc<TypedHandler<Svc, Req, Resp, F>>
where
    Svc: Send + Sync + 'static,
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    F: Fn(Arc<Svc>, CallContext, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<(Resp, CallContext)>> + Send + 'static,
{
    Arc::new(TypedHandler {
        service_impl,
        handler,
        _marker: PhantomData,
    })
}

#[async_trait]
impl<S, Svc, Req, Resp, F, Fut> MethodHandler<S> for TypedHandler<Svc, Req, Resp, F>
where
    S: Serializer,
    Svc: Send + Sync + 'static,
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    F: Fn(Arc<Svc>, CallContext, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<(Resp, CallContext)>> + Send + 'static,
{
    async fn invoke(
        &self,
        serializer: &S,
        ctx: CallContext,
        payload: &[u8],
    ) -> anyhow::Result<(Vec<u8>, CallContext)> {
        let request: Req = serializer.unmarshal(payload).context("decoding request payload")?;
        let (response, ctx) = (self.handler)(self.service_impl.clone(), ctx, request).await?;
        let response_payload = serializer.marshal(&response).context("encoding response payload")?;
        Ok((response_payload, ctx))
    }
}

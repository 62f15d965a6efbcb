use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::context::CallContext;

/// The request half of the in-memory envelope flowing through the middleware
///  chain. The payload is the serialized user value.
#[derive(Debug, Clone)]
pub struct RpcRequest {
    pub id: u64,
    pub service: String,
    pub method: String,
    pub payload: Bytes,
}

/// The response half of the envelope. `error` is informational for
///  interceptors; it is not transmitted on the wire.
#[derive(Debug, Clone)]
pub struct RpcResponse {
    pub payload: Bytes,
    pub error: Option<String>,
}

/// A pair of hooks run around every call. Interceptors may rewrite the
///  envelope and the context (e.g. wrap the payload or inject headers), and
///  must be safe under concurrent invocation. Returning an error
///  short-circuits the chain.
#[async_trait]
pub trait Interceptor: Send + Sync + 'static {
    async fn process_request(
        &self,
        ctx: &mut CallContext,
        request: RpcRequest,
    ) -> anyhow::Result<RpcRequest>;

    async fn process_response(
        &self,
        ctx: &mut CallContext,
        response: RpcResponse,
    ) -> anyhow::Result<RpcResponse>;
}

/// An ordered set of interceptors: requests pass through in registration
///  order, responses in reverse registration order.
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorChain {
    pub fn new(interceptors: Vec<Arc<dyn Interceptor>>) -> InterceptorChain {
        InterceptorChain { interceptors }
    }

    pub async fn process_request(
        &self,
        ctx: &mut CallContext,
        mut request: RpcRequest,
    ) -> anyhow::Result<RpcRequest> {
        for interceptor in &self.interceptors {
            request = interceptor.process_request(ctx, request).await?;
        }
        Ok(request)
    }

    pub async fn process_response(
        &self,
        ctx: &mut CallContext,
        mut response: RpcResponse,
    ) -> anyhow::Result<RpcResponse> {
        for interceptor in self.interceptors.iter().rev() {
            response = interceptor.process_response(ctx, response).await?;
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::sync::Mutex;

    struct Recording {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail_request: bool,
    }

    #[async_trait]
    impl Interceptor for Recording {
        async fn process_request(
            &self,
            _ctx: &mut CallContext,
            request: RpcRequest,
        ) -> anyhow::Result<RpcRequest> {
            self.log.lock().unwrap().push(format!("{}.req", self.name));
            if self.fail_request {
                bail!("{} rejects the request", self.name);
            }
            Ok(request)
        }

        async fn process_response(
            &self,
            _ctx: &mut CallContext,
            response: RpcResponse,
        ) -> anyhow::Result<RpcResponse> {
            self.log.lock().unwrap().push(format!("{}.resp", self.name));
            Ok(response)
        }
    }

    fn recording_chain(log: &Arc<Mutex<Vec<String>>>, fail: Option<&'static str>) -> InterceptorChain {
        InterceptorChain::new(
            ["i1", "i2", "i3"]
                .into_iter()
                .map(|name| {
                    Arc::new(Recording {
                        name,
                        log: log.clone(),
                        fail_request: Some(name) == fail,
                    }) as Arc<dyn Interceptor>
                })
                .collect(),
        )
    }

    fn request() -> RpcRequest {
        RpcRequest {
            id: 1,
            service: "Echo".to_string(),
            method: "Say".to_string(),
            payload: Bytes::new(),
        }
    }

    #[tokio::test]
    async fn test_request_forward_response_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = recording_chain(&log, None);
        let mut ctx = CallContext::new();

        chain.process_request(&mut ctx, request()).await.unwrap();
        chain
            .process_response(&mut ctx, RpcResponse { payload: Bytes::new(), error: None })
            .await
            .unwrap();

        assert_eq!(
            log.lock().unwrap().as_slice(),
            &["i1.req", "i2.req", "i3.req", "i3.resp", "i2.resp", "i1.resp"],
        );
    }

    #[tokio::test]
    async fn test_request_short_circuit() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = recording_chain(&log, Some("i2"));
        let mut ctx = CallContext::new();

        assert!(chain.process_request(&mut ctx, request()).await.is_err());
        // i3 never ran
        assert_eq!(log.lock().unwrap().as_slice(), &["i1.req", "i2.req"]);
    }
}

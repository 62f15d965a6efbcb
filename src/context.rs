use std::sync::Arc;

use tokio::sync::watch;

use crate::metadata::Metadata;

/// Per-call state threaded explicitly through every call site: the two
///  metadata scopes and an optional cancellation signal. There is no ambient
///  context - handlers receive one and return one, and the returned context's
///  outgoing metadata becomes the response headers.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    incoming: Metadata,
    outgoing: Metadata,
    cancel_rx: Option<watch::Receiver<bool>>,
}

impl CallContext {
    pub fn new() -> CallContext {
        CallContext::default()
    }

    /// A context wired to a [`CancelHandle`]. Dropping the handle without
    ///  firing it leaves the context un-cancellable.
    pub fn cancellable() -> (CallContext, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        let ctx = CallContext {
            cancel_rx: Some(rx),
            ..CallContext::default()
        };
        (ctx, CancelHandle { tx: Arc::new(tx) })
    }

    pub fn incoming_metadata(&self) -> &Metadata {
        &self.incoming
    }

    pub fn set_incoming_metadata(&mut self, metadata: Metadata) {
        self.incoming = metadata;
    }

    pub fn outgoing_metadata(&self) -> &Metadata {
        &self.outgoing
    }

    pub fn outgoing_metadata_mut(&mut self) -> &mut Metadata {
        &mut self.outgoing
    }

    /// Resolves when the context is cancelled; pends forever if it never is.
    pub async fn cancelled(&self) {
        let Some(rx) = &self.cancel_rx else {
            return std::future::pending().await;
        };

        let mut rx = rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // handle dropped without firing
                return std::future::pending().await;
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_rx.as_ref().is_some_and(|rx| *rx.borrow())
    }
}

#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{Acknowledger, BusMessage, Delivery, Envelope, Inbox};

/// Back-off after a transport error before polling again.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Callback invoked for one delivery. The handler owns the [`Acknowledger`]
/// and must settle it.
pub type Handler = Arc<dyn Fn(Envelope, CancellationToken, Acknowledger) -> BoxFuture<'static, ()> + Send + Sync>;

/// Dispatch table from envelope type tag to handler.
#[derive(Clone, Default)]
pub struct TypeRoutes {
    handlers: HashMap<String, Handler>,
}

impl TypeRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a raw handler for a type tag. A later registration for the same tag wins.
    pub fn on(mut self, type_tag: impl Into<String>, handler: Handler) -> Self {
        self.handlers.insert(type_tag.into(), handler);
        self
    }

    /// Register a typed handler. Payloads that fail to decode are rejected.
    pub fn route<M, F, Fut>(self, handler: F) -> Self
    where
        M: BusMessage,
        F: Fn(M, CancellationToken, Acknowledger) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let raw: Handler = Arc::new(move |envelope: Envelope, cancel: CancellationToken, ack: Acknowledger| {
            let handler = Arc::clone(&handler);
            let fut: BoxFuture<'static, ()> = Box::pin(async move {
                match envelope.open::<M>() {
                    Ok(message) => handler(message, cancel, ack).await,
                    Err(e) => {
                        let _ = ack.rejected(format!("undecodable {}: {e}", M::TYPE_TAG)).await;
                    }
                }
            });
            fut
        });
        self.on(M::TYPE_TAG, raw)
    }

    pub fn handles(&self, type_tag: &str) -> bool {
        self.handlers.contains_key(type_tag)
    }

    async fn dispatch(&self, delivery: Delivery, cancel: CancellationToken) {
        let Delivery { envelope, ack } = delivery;
        match self.handlers.get(&envelope.type_tag) {
            Some(handler) => handler(envelope, cancel, ack).await,
            None => {
                let reason = format!("no handler for type {}", envelope.type_tag);
                let _ = ack.rejected(reason).await;
            }
        }
    }
}

/// Polls one inbox and dispatches deliveries by type tag.
pub struct Listener {
    inbox: Arc<dyn Inbox>,
    poll_timeout: Duration,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Listener {
    pub fn new(inbox: Arc<dyn Inbox>, poll_timeout: Duration) -> Self {
        Self {
            inbox,
            poll_timeout,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    pub fn queue_name(&self) -> &str {
        self.inbox.queue_name()
    }

    pub fn is_listening(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Start the polling loop. A loop already running is stopped first.
    pub async fn listen(&mut self, routes: TypeRoutes) {
        self.stop().await;

        let cancel = CancellationToken::new();
        self.cancel = cancel.clone();
        let inbox = Arc::clone(&self.inbox);
        let poll_timeout = self.poll_timeout;

        self.task = Some(tokio::spawn(async move {
            tracing::debug!(target: "flowhost::messaging", queue = %inbox.queue_name(), "listener started");
            loop {
                let batch = tokio::select! {
                    _ = cancel.cancelled() => break,
                    batch = inbox.wait_for_messages(poll_timeout) => batch,
                };
                match batch {
                    Ok(deliveries) => {
                        for delivery in deliveries {
                            if cancel.is_cancelled() {
                                let _ = delivery.ack.abandoned().await;
                                continue;
                            }
                            routes.dispatch(delivery, cancel.clone()).await;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            target: "flowhost::messaging",
                            queue = %inbox.queue_name(),
                            error = %e,
                            "inbox poll failed"
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                        }
                    }
                }
            }
            tracing::debug!(target: "flowhost::messaging", queue = %inbox.queue_name(), "listener stopped");
        }));
    }

    /// Cancel the loop and wait for it to finish. Idempotent.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if e.is_panic() {
                    tracing::error!(target: "flowhost::messaging", queue = %self.inbox.queue_name(), "listener task panicked");
                }
            }
        }
    }

    pub async fn dispose(mut self) {
        self.stop().await;
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

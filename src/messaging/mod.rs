//! Exchange/queue message bus abstraction.
//!
//! Transports implement [`MessageBus`], [`Exchange`] and [`Inbox`]; routing
//! rules live in [`routing`] and are shared by every transport, and the
//! [`Listener`] polling loop is transport independent.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sync::LockError;

/// Directory/file transport.
pub mod file;
mod listener;
/// In-process transport.
pub mod memory;
/// Memory-mapped pipe transport.
pub mod mmap;
pub mod routing;

pub use file::FileBus;
pub use listener::{Handler, Listener, TypeRoutes};
pub use memory::{BusRegistry, MemoryBus};
pub use mmap::MmapBus;
pub use routing::{bind_message_to_queues, topic_match, TopicMatchMode};

#[derive(Debug, Error)]
pub enum BusError {
    #[error("exchange not found: {0}")]
    ExchangeNotFound(String),
    #[error("queue not found: {exchange}/{queue}")]
    QueueNotFound { exchange: String, queue: String },
    #[error("exchange {name} already declared as {existing:?}, requested {requested:?}")]
    ExchangeTypeMismatch {
        name: String,
        existing: ExchangeType,
        requested: ExchangeType,
    },
    #[error("message codec: {0}")]
    Codec(String),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("message already settled")]
    AlreadySettled,
}

impl BusError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExchangeType {
    Direct,
    Fanout,
    Topic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageQueueDeclaration {
    pub name: String,
    /// Routing keys (direct) or patterns (topic). Empty on a direct exchange means "any key".
    pub bindings: Vec<String>,
}

impl MessageQueueDeclaration {
    pub fn new(name: impl Into<String>, bindings: &[&str]) -> Self {
        Self {
            name: name.into(),
            bindings: bindings.iter().map(|b| b.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageExchangeDeclaration {
    pub name: String,
    pub exchange_type: ExchangeType,
    pub queues: Vec<MessageQueueDeclaration>,
}

/// A payload type that can travel on the bus, identified by its type tag.
pub trait BusMessage: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TYPE_TAG: &'static str;
}

/// Transport-neutral message: payload bytes plus the payload's type tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub type_tag: String,
    pub body: Vec<u8>,
    pub sent_at_ms: u64,
}

impl Envelope {
    pub fn new(type_tag: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            type_tag: type_tag.into(),
            body,
            sent_at_ms: now_ms(),
        }
    }

    pub fn wrap<M: BusMessage>(message: &M) -> Result<Self, BusError> {
        let body = serde_json::to_vec(message).map_err(|e| BusError::Codec(e.to_string()))?;
        Ok(Self::new(M::TYPE_TAG, body))
    }

    pub fn open<M: BusMessage>(&self) -> Result<M, BusError> {
        if self.type_tag != M::TYPE_TAG {
            return Err(BusError::Codec(format!(
                "type tag mismatch: envelope carries {}, expected {}",
                self.type_tag,
                M::TYPE_TAG
            )));
        }
        serde_json::from_slice(&self.body).map_err(|e| BusError::Codec(e.to_string()))
    }

    /// Copy with a fresh id, used when one publish fans out to several queues.
    pub(crate) fn fork(&self) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            ..self.clone()
        }
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Outcome applied to a delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    /// Processed: delete the message and release its reservation.
    Acknowledged,
    /// Not processed: release the reservation, keep the message for redelivery.
    Abandoned,
    /// Poison: delete the message and release its reservation.
    Rejected(String),
}

/// Transport hook applying a settlement to one reserved message.
#[async_trait::async_trait]
pub trait Settle: Send + Sync {
    async fn settle(&mut self, outcome: Settlement) -> Result<(), BusError>;
}

/// Handle through which a listener settles one delivery. Exactly one of
/// [`acknowledged`](Self::acknowledged), [`abandoned`](Self::abandoned) or
/// [`rejected`](Self::rejected) must be called; dropping the handle unsettled
/// logs a warning and lets the transport release what it holds.
pub struct Acknowledger {
    message_id: String,
    queue: String,
    inner: Option<Box<dyn Settle>>,
}

impl Acknowledger {
    pub fn new(message_id: impl Into<String>, queue: impl Into<String>, inner: Box<dyn Settle>) -> Self {
        Self {
            message_id: message_id.into(),
            queue: queue.into(),
            inner: Some(inner),
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub async fn acknowledged(mut self) -> Result<(), BusError> {
        self.settle(Settlement::Acknowledged).await
    }

    pub async fn abandoned(mut self) -> Result<(), BusError> {
        self.settle(Settlement::Abandoned).await
    }

    pub async fn rejected(mut self, reason: impl Into<String>) -> Result<(), BusError> {
        let reason = reason.into();
        tracing::warn!(
            target: "flowhost::messaging",
            queue = %self.queue,
            message_id = %self.message_id,
            reason = %reason,
            "message rejected"
        );
        self.settle(Settlement::Rejected(reason)).await
    }

    async fn settle(&mut self, outcome: Settlement) -> Result<(), BusError> {
        let mut inner = self.inner.take().ok_or(BusError::AlreadySettled)?;
        inner.settle(outcome).await
    }
}

impl Drop for Acknowledger {
    fn drop(&mut self) {
        if self.inner.is_some() {
            tracing::warn!(
                target: "flowhost::messaging",
                queue = %self.queue,
                message_id = %self.message_id,
                "delivery dropped without settlement; releasing reservation"
            );
        }
    }
}

impl fmt::Debug for Acknowledger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acknowledger")
            .field("message_id", &self.message_id)
            .field("queue", &self.queue)
            .field("settled", &self.inner.is_none())
            .finish()
    }
}

/// A reserved message and the handle that settles it.
#[derive(Debug)]
pub struct Delivery {
    pub envelope: Envelope,
    pub ack: Acknowledger,
}

/// Receiving side of one queue.
#[async_trait::async_trait]
pub trait Inbox: Send + Sync {
    fn queue_name(&self) -> &str;

    /// Wait up to `timeout` for messages, reserving and returning what is available.
    async fn wait_for_messages(&self, timeout: Duration) -> Result<Vec<Delivery>, BusError>;
}

/// A named routing entity owning queues.
#[async_trait::async_trait]
pub trait Exchange: Send + Sync {
    fn name(&self) -> &str;

    fn exchange_type(&self) -> ExchangeType;

    /// Declare (or re-bind) a queue.
    async fn declare_queue(&self, name: &str, bindings: &[&str]) -> Result<MessageQueueDeclaration, BusError>;

    async fn delete_queue(&self, name: &str) -> Result<(), BusError>;

    async fn specify_queue(&self, name: &str) -> Result<Option<MessageQueueDeclaration>, BusError>;

    async fn queues(&self) -> Result<Vec<MessageQueueDeclaration>, BusError>;

    /// Publish: route `envelope` by `route_key` to zero or more queues.
    /// Returns the names of the queues that received it.
    async fn send(&self, envelope: Envelope, route_key: &str) -> Result<Vec<String>, BusError>;

    async fn open_inbox(&self, queue: &str) -> Result<Arc<dyn Inbox>, BusError>;

    async fn declaration(&self) -> Result<MessageExchangeDeclaration, BusError> {
        Ok(MessageExchangeDeclaration {
            name: self.name().to_string(),
            exchange_type: self.exchange_type(),
            queues: self.queues().await?,
        })
    }
}

/// Transport entry point.
#[async_trait::async_trait]
pub trait MessageBus: Send + Sync {
    /// Declare an exchange, or attach to an existing one of the same type.
    async fn declare_exchange(&self, name: &str, exchange_type: ExchangeType) -> Result<Arc<dyn Exchange>, BusError>;

    async fn delete_exchange(&self, name: &str) -> Result<(), BusError>;

    async fn specify_exchange(&self, name: &str) -> Result<Option<Arc<dyn Exchange>>, BusError>;

    /// Suggested listener poll timeout for this transport.
    fn poll_timeout(&self) -> Duration {
        Duration::from_secs(10)
    }
}

/// Publish a typed message on an exchange.
pub async fn publish<M: BusMessage>(exchange: &dyn Exchange, message: &M, route_key: &str) -> Result<Vec<String>, BusError> {
    let envelope = Envelope::wrap(message)?;
    exchange.send(envelope, route_key).await
}

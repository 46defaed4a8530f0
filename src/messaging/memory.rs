use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;

use super::routing::{bind_message_to_queues, TopicMatchMode};
use super::{
    Acknowledger, BusError, Delivery, Envelope, Exchange, ExchangeType, Inbox, MessageBus, MessageQueueDeclaration,
    Settle, Settlement,
};

/// Longest single wait an in-memory inbox performs per call.
const MAX_WAIT: Duration = Duration::from_secs(60);

/// Process-wide table of in-memory exchanges. Every [`MemoryBus`] built from
/// clones of one registry sees the same exchanges and queues.
#[derive(Clone, Default)]
pub struct BusRegistry {
    exchanges: Arc<Mutex<HashMap<String, Arc<MemoryExchange>>>>,
}

impl BusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, Arc<MemoryExchange>>> {
        self.exchanges.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// In-process transport over a [`BusRegistry`].
#[derive(Clone)]
pub struct MemoryBus {
    registry: BusRegistry,
    mode: TopicMatchMode,
}

impl MemoryBus {
    pub fn new(registry: BusRegistry) -> Self {
        Self {
            registry,
            mode: TopicMatchMode::default(),
        }
    }

    pub fn with_topic_match(mut self, mode: TopicMatchMode) -> Self {
        self.mode = mode;
        self
    }
}

#[async_trait::async_trait]
impl MessageBus for MemoryBus {
    async fn declare_exchange(&self, name: &str, exchange_type: ExchangeType) -> Result<Arc<dyn Exchange>, BusError> {
        let mut table = self.registry.table();
        if let Some(existing) = table.get(name) {
            if existing.exchange_type != exchange_type {
                return Err(BusError::ExchangeTypeMismatch {
                    name: name.to_string(),
                    existing: existing.exchange_type,
                    requested: exchange_type,
                });
            }
            return Ok(existing.clone() as Arc<dyn Exchange>);
        }
        let exchange = Arc::new(MemoryExchange {
            name: name.to_string(),
            exchange_type,
            mode: self.mode,
            queues: Mutex::new(HashMap::new()),
        });
        table.insert(name.to_string(), Arc::clone(&exchange));
        Ok(exchange as Arc<dyn Exchange>)
    }

    async fn delete_exchange(&self, name: &str) -> Result<(), BusError> {
        self.registry.table().remove(name);
        Ok(())
    }

    async fn specify_exchange(&self, name: &str) -> Result<Option<Arc<dyn Exchange>>, BusError> {
        Ok(self.registry.table().get(name).map(|e| e.clone() as Arc<dyn Exchange>))
    }

    fn poll_timeout(&self) -> Duration {
        Duration::from_secs(30)
    }
}

pub struct MemoryExchange {
    name: String,
    exchange_type: ExchangeType,
    mode: TopicMatchMode,
    queues: Mutex<HashMap<String, Arc<MemoryQueue>>>,
}

impl MemoryExchange {
    fn queues_guard(&self) -> MutexGuard<'_, HashMap<String, Arc<MemoryQueue>>> {
        self.queues.lock().unwrap_or_else(|p| p.into_inner())
    }
}

struct MemoryQueue {
    declaration: Mutex<MessageQueueDeclaration>,
    items: Mutex<VecDeque<Envelope>>,
    signal: Notify,
}

impl MemoryQueue {
    fn push_back(&self, envelope: Envelope) {
        self.items.lock().unwrap_or_else(|p| p.into_inner()).push_back(envelope);
        self.signal.notify_one();
    }

    fn push_front(&self, envelope: Envelope) {
        self.items.lock().unwrap_or_else(|p| p.into_inner()).push_front(envelope);
        self.signal.notify_one();
    }

    fn drain(&self) -> Vec<Envelope> {
        self.items.lock().unwrap_or_else(|p| p.into_inner()).drain(..).collect()
    }

    fn declaration(&self) -> MessageQueueDeclaration {
        self.declaration.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait::async_trait]
impl Exchange for MemoryExchange {
    fn name(&self) -> &str {
        &self.name
    }

    fn exchange_type(&self) -> ExchangeType {
        self.exchange_type
    }

    async fn declare_queue(&self, name: &str, bindings: &[&str]) -> Result<MessageQueueDeclaration, BusError> {
        let declaration = MessageQueueDeclaration::new(name, bindings);
        let mut queues = self.queues_guard();
        match queues.get(name) {
            Some(queue) => {
                *queue.declaration.lock().unwrap_or_else(|p| p.into_inner()) = declaration.clone();
            }
            None => {
                queues.insert(
                    name.to_string(),
                    Arc::new(MemoryQueue {
                        declaration: Mutex::new(declaration.clone()),
                        items: Mutex::new(VecDeque::new()),
                        signal: Notify::new(),
                    }),
                );
            }
        }
        Ok(declaration)
    }

    async fn delete_queue(&self, name: &str) -> Result<(), BusError> {
        self.queues_guard().remove(name);
        Ok(())
    }

    async fn specify_queue(&self, name: &str) -> Result<Option<MessageQueueDeclaration>, BusError> {
        Ok(self.queues_guard().get(name).map(|q| q.declaration()))
    }

    async fn queues(&self) -> Result<Vec<MessageQueueDeclaration>, BusError> {
        let mut out: Vec<_> = self.queues_guard().values().map(|q| q.declaration()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn send(&self, envelope: Envelope, route_key: &str) -> Result<Vec<String>, BusError> {
        let queues = self.queues_guard();
        let declarations: Vec<_> = queues.values().map(|q| q.declaration()).collect();
        let targets = bind_message_to_queues(route_key, self.exchange_type, &declarations, self.mode);
        for (i, target) in targets.iter().enumerate() {
            if let Some(queue) = queues.get(target) {
                queue.push_back(if i == 0 { envelope.clone() } else { envelope.fork() });
            }
        }
        tracing::trace!(
            target: "flowhost::messaging",
            exchange = %self.name,
            route_key,
            type_tag = %envelope.type_tag,
            receivers = targets.len(),
            "message sent"
        );
        Ok(targets)
    }

    async fn open_inbox(&self, queue: &str) -> Result<Arc<dyn Inbox>, BusError> {
        let q = self.queues_guard().get(queue).cloned().ok_or_else(|| BusError::QueueNotFound {
            exchange: self.name.clone(),
            queue: queue.to_string(),
        })?;
        Ok(Arc::new(MemoryInbox {
            name: queue.to_string(),
            queue: q,
        }))
    }
}

struct MemoryInbox {
    name: String,
    queue: Arc<MemoryQueue>,
}

#[async_trait::async_trait]
impl Inbox for MemoryInbox {
    fn queue_name(&self) -> &str {
        &self.name
    }

    async fn wait_for_messages(&self, timeout: Duration) -> Result<Vec<Delivery>, BusError> {
        let mut items = self.queue.drain();
        if items.is_empty() {
            let notified = self.queue.signal.notified();
            let _ = tokio::time::timeout(timeout.min(MAX_WAIT), notified).await;
            items = self.queue.drain();
        }
        Ok(items
            .into_iter()
            .map(|envelope| {
                let settle = MemorySettle {
                    queue: Arc::clone(&self.queue),
                    envelope: Some(envelope.clone()),
                };
                Delivery {
                    ack: Acknowledger::new(envelope.id.clone(), self.name.clone(), Box::new(settle)),
                    envelope,
                }
            })
            .collect())
    }
}

/// In-memory deliveries are removed from the queue at receive time; only an
/// abandon has work to do, putting the message back at the head.
struct MemorySettle {
    queue: Arc<MemoryQueue>,
    envelope: Option<Envelope>,
}

#[async_trait::async_trait]
impl Settle for MemorySettle {
    async fn settle(&mut self, outcome: Settlement) -> Result<(), BusError> {
        if outcome == Settlement::Abandoned {
            if let Some(envelope) = self.envelope.take() {
                self.queue.push_front(envelope);
            }
        }
        self.envelope = None;
        Ok(())
    }
}

impl Drop for MemorySettle {
    fn drop(&mut self) {
        if let Some(envelope) = self.envelope.take() {
            self.queue.push_front(envelope);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(tag: &str) -> Envelope {
        Envelope::new(tag, b"{}".to_vec())
    }

    #[tokio::test]
    async fn registry_is_shared_between_buses() {
        let registry = BusRegistry::new();
        let a = MemoryBus::new(registry.clone());
        let b = MemoryBus::new(registry);
        a.declare_exchange("ex", ExchangeType::Topic).await.unwrap();
        assert!(b.specify_exchange("ex").await.unwrap().is_some());
        assert!(matches!(
            b.declare_exchange("ex", ExchangeType::Direct).await,
            Err(BusError::ExchangeTypeMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn direct_exchange_delivers_to_bound_queue_only() {
        let bus = MemoryBus::new(BusRegistry::new());
        let ex = bus.declare_exchange("d", ExchangeType::Direct).await.unwrap();
        ex.declare_queue("A", &["x"]).await.unwrap();
        ex.declare_queue("B", &["y"]).await.unwrap();

        assert_eq!(ex.send(env("t"), "x").await.unwrap(), vec!["A"]);
        assert!(ex.send(env("t"), "z").await.unwrap().is_empty());

        let a = ex.open_inbox("A").await.unwrap();
        let b = ex.open_inbox("B").await.unwrap();
        let got = a.wait_for_messages(Duration::from_millis(10)).await.unwrap();
        assert_eq!(got.len(), 1);
        for d in got {
            d.ack.acknowledged().await.unwrap();
        }
        assert!(b.wait_for_messages(Duration::from_millis(10)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn abandon_redelivers() {
        let bus = MemoryBus::new(BusRegistry::new());
        let ex = bus.declare_exchange("f", ExchangeType::Fanout).await.unwrap();
        ex.declare_queue("q", &[]).await.unwrap();
        let sent = env("t");
        let id = sent.id.clone();
        ex.send(sent, "").await.unwrap();

        let inbox = ex.open_inbox("q").await.unwrap();
        let mut first = inbox.wait_for_messages(Duration::from_millis(10)).await.unwrap();
        first.pop().unwrap().ack.abandoned().await.unwrap();

        let mut again = inbox.wait_for_messages(Duration::from_millis(10)).await.unwrap();
        let d = again.pop().unwrap();
        assert_eq!(d.envelope.id, id);
        d.ack.acknowledged().await.unwrap();
        assert!(inbox.wait_for_messages(Duration::from_millis(10)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn wait_wakes_on_send() {
        let bus = MemoryBus::new(BusRegistry::new());
        let ex = bus.declare_exchange("f", ExchangeType::Fanout).await.unwrap();
        ex.declare_queue("q", &[]).await.unwrap();
        let inbox = ex.open_inbox("q").await.unwrap();

        let sender = Arc::clone(&ex);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            sender.send(env("t"), "").await.unwrap();
        });
        let started = std::time::Instant::now();
        let got = inbox.wait_for_messages(Duration::from_secs(5)).await.unwrap();
        assert_eq!(got.len(), 1);
        assert!(started.elapsed() < Duration::from_secs(4));
        for d in got {
            d.ack.acknowledged().await.unwrap();
        }
    }
}

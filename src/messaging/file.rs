//! Directory-backed transport.
//!
//! Layout under the bus root:
//!
//! ```text
//! <root>/<exchange>/.exchange          exchange type (JSON)
//! <root>/<exchange>/<queue>/.queue     queue declaration (JSON)
//! <root>/<exchange>/<queue>/<id>.msg   one envelope per file
//! <root>/<exchange>/<queue>/.locks/    per-message reservation leases
//! ```
//!
//! Messages are written to a temporary name and renamed into place, so a
//! reader never observes a partial file. A reservation is an exclusive lease
//! on the message id; ack and reject delete the file, abandon just drops the
//! lease.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::routing::{bind_message_to_queues, TopicMatchMode};
use super::{
    Acknowledger, BusError, Delivery, Envelope, Exchange, ExchangeType, Inbox, MessageBus, MessageQueueDeclaration,
    Settle, Settlement,
};
use crate::sync::{FileLockProvider, Lease, LockProvider};

const EXCHANGE_MARKER: &str = ".exchange";
const QUEUE_MARKER: &str = ".queue";
const LOCK_DIR: &str = ".locks";
const MESSAGE_EXT: &str = "msg";

/// Interval between directory scans while waiting for messages.
pub const FILE_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
pub struct FileBus {
    root: PathBuf,
    mode: TopicMatchMode,
    poll_interval: Duration,
}

impl FileBus {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            mode: TopicMatchMode::default(),
            poll_interval: FILE_POLL_INTERVAL,
        }
    }

    pub fn with_topic_match(mut self, mode: TopicMatchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn exchange_at(&self, name: &str, exchange_type: ExchangeType) -> Arc<FileExchange> {
        Arc::new(FileExchange {
            name: name.to_string(),
            exchange_type,
            dir: self.root.join(name),
            mode: self.mode,
            poll_interval: self.poll_interval,
        })
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, BusError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| BusError::Codec(format!("{}: {e}", path.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(BusError::io(format!("read {}", path.display()), e)),
    }
}

/// Write `bytes` to `path` through a temporary sibling and an atomic rename.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), BusError> {
    let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| BusError::io(format!("write {}", tmp.display()), e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| BusError::io(format!("rename {}", path.display()), e))
}

#[async_trait::async_trait]
impl MessageBus for FileBus {
    async fn declare_exchange(&self, name: &str, exchange_type: ExchangeType) -> Result<Arc<dyn Exchange>, BusError> {
        let dir = self.root.join(name);
        let marker = dir.join(EXCHANGE_MARKER);
        if let Some(existing) = read_json::<ExchangeType>(&marker).await? {
            if existing != exchange_type {
                return Err(BusError::ExchangeTypeMismatch {
                    name: name.to_string(),
                    existing,
                    requested: exchange_type,
                });
            }
        } else {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| BusError::io(format!("create {}", dir.display()), e))?;
            let body = serde_json::to_vec(&exchange_type).map_err(|e| BusError::Codec(e.to_string()))?;
            write_atomic(&marker, &body).await?;
        }
        Ok(self.exchange_at(name, exchange_type) as Arc<dyn Exchange>)
    }

    async fn delete_exchange(&self, name: &str) -> Result<(), BusError> {
        let dir = self.root.join(name);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BusError::io(format!("remove {}", dir.display()), e)),
        }
    }

    async fn specify_exchange(&self, name: &str) -> Result<Option<Arc<dyn Exchange>>, BusError> {
        let marker = self.root.join(name).join(EXCHANGE_MARKER);
        Ok(read_json::<ExchangeType>(&marker)
            .await?
            .map(|t| self.exchange_at(name, t) as Arc<dyn Exchange>))
    }

    fn poll_timeout(&self) -> Duration {
        Duration::from_secs(10)
    }
}

pub struct FileExchange {
    name: String,
    exchange_type: ExchangeType,
    dir: PathBuf,
    mode: TopicMatchMode,
    poll_interval: Duration,
}

impl FileExchange {
    fn queue_dir(&self, queue: &str) -> PathBuf {
        self.dir.join(queue)
    }
}

#[async_trait::async_trait]
impl Exchange for FileExchange {
    fn name(&self) -> &str {
        &self.name
    }

    fn exchange_type(&self) -> ExchangeType {
        self.exchange_type
    }

    async fn declare_queue(&self, name: &str, bindings: &[&str]) -> Result<MessageQueueDeclaration, BusError> {
        let dir = self.queue_dir(name);
        tokio::fs::create_dir_all(dir.join(LOCK_DIR))
            .await
            .map_err(|e| BusError::io(format!("create {}", dir.display()), e))?;
        let declaration = MessageQueueDeclaration::new(name, bindings);
        let body = serde_json::to_vec(&declaration).map_err(|e| BusError::Codec(e.to_string()))?;
        write_atomic(&dir.join(QUEUE_MARKER), &body).await?;
        Ok(declaration)
    }

    async fn delete_queue(&self, name: &str) -> Result<(), BusError> {
        let dir = self.queue_dir(name);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BusError::io(format!("remove {}", dir.display()), e)),
        }
    }

    async fn specify_queue(&self, name: &str) -> Result<Option<MessageQueueDeclaration>, BusError> {
        read_json(&self.queue_dir(name).join(QUEUE_MARKER)).await
    }

    async fn queues(&self) -> Result<Vec<MessageQueueDeclaration>, BusError> {
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(BusError::io(format!("list {}", self.dir.display()), e)),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| BusError::io(format!("list {}", self.dir.display()), e))?
        {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }
            if let Some(decl) = read_json::<MessageQueueDeclaration>(&entry.path().join(QUEUE_MARKER)).await? {
                out.push(decl);
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn send(&self, envelope: Envelope, route_key: &str) -> Result<Vec<String>, BusError> {
        let declarations = self.queues().await?;
        let targets = bind_message_to_queues(route_key, self.exchange_type, &declarations, self.mode);
        for (i, target) in targets.iter().enumerate() {
            let message = if i == 0 { envelope.clone() } else { envelope.fork() };
            let dir = self.queue_dir(target);
            if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
                return Err(BusError::io(
                    format!("queue directory {}", dir.display()),
                    std::io::Error::new(std::io::ErrorKind::NotFound, "queue directory missing"),
                ));
            }
            let body = serde_json::to_vec(&message).map_err(|e| BusError::Codec(e.to_string()))?;
            write_atomic(&dir.join(format!("{}.{MESSAGE_EXT}", message.id)), &body).await?;
        }
        tracing::trace!(
            target: "flowhost::messaging",
            exchange = %self.name,
            route_key,
            type_tag = %envelope.type_tag,
            receivers = targets.len(),
            "message written"
        );
        Ok(targets)
    }

    async fn open_inbox(&self, queue: &str) -> Result<Arc<dyn Inbox>, BusError> {
        let dir = self.queue_dir(queue);
        if self.specify_queue(queue).await?.is_none() {
            return Err(BusError::QueueNotFound {
                exchange: self.name.clone(),
                queue: queue.to_string(),
            });
        }
        Ok(Arc::new(FileInbox {
            name: queue.to_string(),
            locks: FileLockProvider::new(dir.join(LOCK_DIR)),
            dir,
            poll_interval: self.poll_interval,
        }))
    }
}

struct FileInbox {
    name: String,
    dir: PathBuf,
    locks: FileLockProvider,
    poll_interval: Duration,
}

impl FileInbox {
    /// One scan: reserve every unreserved message not already taken by this call.
    async fn scan(&self, claimed: &mut HashSet<String>, out: &mut Vec<Delivery>) -> Result<(), BusError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) => return Err(BusError::io(format!("list {}", self.dir.display()), e)),
        };
        let mut paths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| BusError::io(format!("list {}", self.dir.display()), e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(MESSAGE_EXT) {
                paths.push(path);
            }
        }
        paths.sort();

        for path in paths {
            let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            if claimed.contains(&id) {
                continue;
            }
            let Some(lease) = self.locks.try_acquire(&id).await? else {
                continue;
            };
            // Acked between listing and locking.
            let envelope = match read_json::<Envelope>(&path).await {
                Ok(Some(envelope)) => envelope,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(target: "flowhost::messaging", path = %path.display(), error = %e, "unreadable message file removed");
                    let _ = tokio::fs::remove_file(&path).await;
                    continue;
                }
            };
            claimed.insert(id);
            let settle = FileSettle {
                path,
                lock_path: self.locks.lock_path(lease.name()),
                lease: Some(lease),
            };
            out.push(Delivery {
                ack: Acknowledger::new(envelope.id.clone(), self.name.clone(), Box::new(settle)),
                envelope,
            });
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Inbox for FileInbox {
    fn queue_name(&self) -> &str {
        &self.name
    }

    async fn wait_for_messages(&self, timeout: Duration) -> Result<Vec<Delivery>, BusError> {
        let deadline = Instant::now() + timeout;
        let mut claimed = HashSet::new();
        let mut out = Vec::new();
        loop {
            self.scan(&mut claimed, &mut out).await?;
            if !out.is_empty() {
                // One more pass picks up a burst that landed during the first.
                self.scan(&mut claimed, &mut out).await?;
                return Ok(out);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(out);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }
}

struct FileSettle {
    path: PathBuf,
    lock_path: PathBuf,
    lease: Option<Lease>,
}

#[async_trait::async_trait]
impl Settle for FileSettle {
    async fn settle(&mut self, outcome: Settlement) -> Result<(), BusError> {
        let result = match outcome {
            Settlement::Acknowledged | Settlement::Rejected(_) => match tokio::fs::remove_file(&self.path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(BusError::io(format!("delete {}", self.path.display()), e)),
            },
            Settlement::Abandoned => Ok(()),
        };
        if let Some(lease) = self.lease.take() {
            lease.release();
        }
        if !matches!(outcome, Settlement::Abandoned) {
            let _ = tokio::fs::remove_file(&self.lock_path).await;
        }
        result
    }
}

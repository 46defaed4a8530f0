//! Memory-mapped pipe transport.
//!
//! Every queue is a pipe file mapped into memory by each process that talks
//! to it. Layout of a pipe file:
//!
//! ```text
//! [0..8)   used length of the data region, u64 little endian
//! [8]      writable flag: 1 when frames are pending, 0 after a drain
//! [16..)   frames: u32 little-endian length followed by a bincode envelope
//! ```
//!
//! All access to a pipe happens under an exclusive `fs2` lock on a sidecar
//! `.lock` file. Senders append frames and raise the flag; the inbox takes
//! every frame at once, truncates the region and clears the flag.
//! Exchange and queue declarations live in a JSON manifest per exchange.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fs2::FileExt;
use memmap2::MmapMut;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::routing::{bind_message_to_queues, TopicMatchMode};
use super::{
    Acknowledger, BusError, Delivery, Envelope, Exchange, ExchangeType, Inbox, MessageBus, MessageQueueDeclaration,
    Settle, Settlement,
};

const HEADER_LEN: usize = 16;
const FLAG_OFFSET: usize = 8;
const INITIAL_PIPE_LEN: u64 = 64 * 1024;
const MANIFEST: &str = "manifest.json";
const PIPE_EXT: &str = "pipe";

/// How often an idle inbox checks the pipe flag.
const FLAG_POLL_INTERVAL: Duration = Duration::from_millis(50);

fn blocking_failed(context: &str, e: tokio::task::JoinError) -> BusError {
    BusError::io(context, std::io::Error::other(e.to_string()))
}

/// Exclusive inter-process section on a sidecar lock file; unlocked on drop.
struct LockedSection {
    file: File,
}

impl LockedSection {
    fn enter(path: &Path) -> Result<Self, BusError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| BusError::io(format!("open {}", path.display()), e))?;
        file.lock_exclusive()
            .map_err(|e| BusError::io(format!("lock {}", path.display()), e))?;
        Ok(Self { file })
    }
}

impl Drop for LockedSection {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

/// One named pipe file.
#[derive(Clone, Debug)]
struct Pipe {
    path: PathBuf,
    lock_path: PathBuf,
}

impl Pipe {
    fn new(path: PathBuf) -> Self {
        Self {
            lock_path: lock_path_for(&path),
            path,
        }
    }

    fn open_file(&self) -> Result<File, BusError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| BusError::io(format!("open {}", self.path.display()), e))?;
        let len = file
            .metadata()
            .map_err(|e| BusError::io(format!("stat {}", self.path.display()), e))?
            .len();
        if len < INITIAL_PIPE_LEN {
            file.set_len(INITIAL_PIPE_LEN)
                .map_err(|e| BusError::io(format!("size {}", self.path.display()), e))?;
        }
        Ok(file)
    }

    fn map(&self, file: &File) -> Result<MmapMut, BusError> {
        // SAFETY: the mapping is only read or written while the sidecar lock
        // is held, and the file is never shrunk, so no other process mutates
        // or truncates the region underneath us.
        unsafe { MmapMut::map_mut(file) }.map_err(|e| BusError::io(format!("map {}", self.path.display()), e))
    }

    fn used(map: &MmapMut) -> usize {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&map[0..8]);
        u64::from_le_bytes(raw) as usize
    }

    fn set_header(map: &mut MmapMut, used: usize, writable: bool) {
        map[0..8].copy_from_slice(&(used as u64).to_le_bytes());
        map[FLAG_OFFSET] = u8::from(writable);
    }

    fn create(&self) -> Result<(), BusError> {
        let _section = LockedSection::enter(&self.lock_path)?;
        self.open_file().map(|_| ())
    }

    /// Append envelopes to the pipe and raise the writable flag.
    fn append(&self, envelopes: &[Envelope]) -> Result<(), BusError> {
        let mut frames = Vec::with_capacity(envelopes.len());
        for envelope in envelopes {
            frames.push(bincode::serialize(envelope).map_err(|e| BusError::Codec(e.to_string()))?);
        }
        let added: usize = frames.iter().map(|f| 4 + f.len()).sum();

        let _section = LockedSection::enter(&self.lock_path)?;
        let file = self.open_file()?;
        let mut map = self.map(&file)?;
        let used = Self::used(&map);
        let needed = (HEADER_LEN + used + added) as u64;
        if needed > map.len() as u64 {
            drop(map);
            file.set_len(needed.next_power_of_two())
                .map_err(|e| BusError::io(format!("grow {}", self.path.display()), e))?;
            map = self.map(&file)?;
        }

        let mut offset = HEADER_LEN + used;
        for frame in &frames {
            map[offset..offset + 4].copy_from_slice(&(frame.len() as u32).to_le_bytes());
            offset += 4;
            map[offset..offset + frame.len()].copy_from_slice(frame);
            offset += frame.len();
        }
        Self::set_header(&mut map, used + added, true);
        map.flush()
            .map_err(|e| BusError::io(format!("flush {}", self.path.display()), e))
    }

    /// Take every pending frame and truncate the pipe. Frames that fail to
    /// decode are dropped with a warning.
    fn drain(&self) -> Result<Vec<Envelope>, BusError> {
        if !self.path.exists() {
            return Err(BusError::io(
                format!("pipe {}", self.path.display()),
                std::io::Error::new(std::io::ErrorKind::NotFound, "pipe file missing"),
            ));
        }
        let _section = LockedSection::enter(&self.lock_path)?;
        let file = self.open_file()?;
        let mut map = self.map(&file)?;
        if map[FLAG_OFFSET] == 0 {
            return Ok(Vec::new());
        }
        let used = Self::used(&map).min(map.len() - HEADER_LEN);
        let mut out = Vec::new();
        let mut offset = HEADER_LEN;
        let end = HEADER_LEN + used;
        while offset + 4 <= end {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&map[offset..offset + 4]);
            let len = u32::from_le_bytes(raw) as usize;
            offset += 4;
            if offset + len > end {
                tracing::warn!(target: "flowhost::messaging", pipe = %self.path.display(), "truncated frame discarded");
                break;
            }
            match bincode::deserialize::<Envelope>(&map[offset..offset + len]) {
                Ok(envelope) => out.push(envelope),
                Err(e) => {
                    tracing::warn!(target: "flowhost::messaging", pipe = %self.path.display(), error = %e, "undecodable frame discarded")
                }
            }
            offset += len;
        }
        Self::set_header(&mut map, 0, false);
        map.flush()
            .map_err(|e| BusError::io(format!("flush {}", self.path.display()), e))?;
        Ok(out)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Manifest {
    exchange_type: ExchangeType,
    queues: Vec<MessageQueueDeclaration>,
}

fn read_manifest(path: &Path) -> Result<Option<Manifest>, BusError> {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| BusError::Codec(format!("{}: {e}", path.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(BusError::io(format!("read {}", path.display()), e)),
    }
}

fn write_manifest(path: &Path, manifest: &Manifest) -> Result<(), BusError> {
    let body = serde_json::to_vec_pretty(manifest).map_err(|e| BusError::Codec(e.to_string()))?;
    let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
    std::fs::write(&tmp, body).map_err(|e| BusError::io(format!("write {}", tmp.display()), e))?;
    std::fs::rename(&tmp, path).map_err(|e| BusError::io(format!("rename {}", path.display()), e))
}

#[derive(Clone, Debug)]
pub struct MmapBus {
    root: PathBuf,
    mode: TopicMatchMode,
}

impl MmapBus {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            mode: TopicMatchMode::default(),
        }
    }

    pub fn with_topic_match(mut self, mode: TopicMatchMode) -> Self {
        self.mode = mode;
        self
    }

    fn exchange_at(&self, name: &str, exchange_type: ExchangeType) -> Arc<MmapExchange> {
        let dir = self.root.join(name);
        Arc::new(MmapExchange {
            name: name.to_string(),
            exchange_type,
            manifest: dir.join(MANIFEST),
            dir,
            mode: self.mode,
        })
    }
}

#[async_trait::async_trait]
impl MessageBus for MmapBus {
    async fn declare_exchange(&self, name: &str, exchange_type: ExchangeType) -> Result<Arc<dyn Exchange>, BusError> {
        let dir = self.root.join(name);
        let manifest_path = dir.join(MANIFEST);
        let owned_name = name.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), BusError> {
            std::fs::create_dir_all(&dir).map_err(|e| BusError::io(format!("create {}", dir.display()), e))?;
            let _section = LockedSection::enter(&lock_path_for(&manifest_path))?;
            match read_manifest(&manifest_path)? {
                Some(existing) if existing.exchange_type != exchange_type => Err(BusError::ExchangeTypeMismatch {
                    name: owned_name,
                    existing: existing.exchange_type,
                    requested: exchange_type,
                }),
                Some(_) => Ok(()),
                None => write_manifest(
                    &manifest_path,
                    &Manifest {
                        exchange_type,
                        queues: Vec::new(),
                    },
                ),
            }
        })
        .await
        .map_err(|e| blocking_failed("declare exchange", e))??;
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
        let manifest_path = self.root.join(name).join(MANIFEST);
        let manifest = tokio::task::spawn_blocking(move || read_manifest(&manifest_path))
            .await
            .map_err(|e| blocking_failed("specify exchange", e))??;
        Ok(manifest.map(|m| self.exchange_at(name, m.exchange_type) as Arc<dyn Exchange>))
    }

    fn poll_timeout(&self) -> Duration {
        Duration::from_secs(10)
    }
}

pub struct MmapExchange {
    name: String,
    exchange_type: ExchangeType,
    dir: PathBuf,
    manifest: PathBuf,
    mode: TopicMatchMode,
}

impl MmapExchange {
    fn pipe(&self, queue: &str) -> Pipe {
        Pipe::new(self.dir.join(format!("{queue}.{PIPE_EXT}")))
    }

    /// Read-modify-write the manifest under its lock.
    async fn update_manifest<F>(&self, update: F) -> Result<(), BusError>
    where
        F: FnOnce(&mut Manifest) + Send + 'static,
    {
        let path = self.manifest.clone();
        let exchange = self.name.clone();
        tokio::task::spawn_blocking(move || {
            let _section = LockedSection::enter(&lock_path_for(&path))?;
            let mut manifest = read_manifest(&path)?.ok_or(BusError::ExchangeNotFound(exchange))?;
            update(&mut manifest);
            write_manifest(&path, &manifest)
        })
        .await
        .map_err(|e| blocking_failed("update manifest", e))?
    }
}

#[async_trait::async_trait]
impl Exchange for MmapExchange {
    fn name(&self) -> &str {
        &self.name
    }

    fn exchange_type(&self) -> ExchangeType {
        self.exchange_type
    }

    async fn declare_queue(&self, name: &str, bindings: &[&str]) -> Result<MessageQueueDeclaration, BusError> {
        let declaration = MessageQueueDeclaration::new(name, bindings);
        let pipe = self.pipe(name);
        tokio::task::spawn_blocking(move || pipe.create())
            .await
            .map_err(|e| blocking_failed("create pipe", e))??;
        let entry = declaration.clone();
        self.update_manifest(move |m| {
            m.queues.retain(|q| q.name != entry.name);
            m.queues.push(entry);
        })
        .await?;
        Ok(declaration)
    }

    async fn delete_queue(&self, name: &str) -> Result<(), BusError> {
        let owned = name.to_string();
        self.update_manifest(move |m| m.queues.retain(|q| q.name != owned)).await?;
        let pipe = self.pipe(name);
        for path in [&pipe.path, &pipe.lock_path] {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(BusError::io(format!("remove {}", path.display()), e)),
            }
        }
        Ok(())
    }

    async fn specify_queue(&self, name: &str) -> Result<Option<MessageQueueDeclaration>, BusError> {
        Ok(self.queues().await?.into_iter().find(|q| q.name == name))
    }

    async fn queues(&self) -> Result<Vec<MessageQueueDeclaration>, BusError> {
        let path = self.manifest.clone();
        let manifest = tokio::task::spawn_blocking(move || read_manifest(&path))
            .await
            .map_err(|e| blocking_failed("read manifest", e))??
            .ok_or_else(|| BusError::ExchangeNotFound(self.name.clone()))?;
        Ok(manifest.queues)
    }

    async fn send(&self, envelope: Envelope, route_key: &str) -> Result<Vec<String>, BusError> {
        let declarations = self.queues().await?;
        let targets = bind_message_to_queues(route_key, self.exchange_type, &declarations, self.mode);
        for (i, target) in targets.iter().enumerate() {
            let message = if i == 0 { envelope.clone() } else { envelope.fork() };
            let pipe = self.pipe(target);
            tokio::task::spawn_blocking(move || pipe.append(&[message]))
                .await
                .map_err(|e| blocking_failed("append to pipe", e))??;
        }
        tracing::trace!(
            target: "flowhost::messaging",
            exchange = %self.name,
            route_key,
            type_tag = %envelope.type_tag,
            receivers = targets.len(),
            "message piped"
        );
        Ok(targets)
    }

    async fn open_inbox(&self, queue: &str) -> Result<Arc<dyn Inbox>, BusError> {
        if self.specify_queue(queue).await?.is_none() {
            return Err(BusError::QueueNotFound {
                exchange: self.name.clone(),
                queue: queue.to_string(),
            });
        }
        Ok(Arc::new(MmapInbox {
            name: queue.to_string(),
            pipe: self.pipe(queue),
        }))
    }
}

struct MmapInbox {
    name: String,
    pipe: Pipe,
}

#[async_trait::async_trait]
impl Inbox for MmapInbox {
    fn queue_name(&self) -> &str {
        &self.name
    }

    async fn wait_for_messages(&self, timeout: Duration) -> Result<Vec<Delivery>, BusError> {
        let deadline = Instant::now() + timeout;
        loop {
            let pipe = self.pipe.clone();
            let envelopes = tokio::task::spawn_blocking(move || pipe.drain())
                .await
                .map_err(|e| blocking_failed("drain pipe", e))??;
            if !envelopes.is_empty() {
                return Ok(envelopes
                    .into_iter()
                    .map(|envelope| Delivery {
                        ack: Acknowledger::new(
                            envelope.id.clone(),
                            self.name.clone(),
                            Box::new(PipeSettle {
                                pipe: self.pipe.clone(),
                                envelope: Some(envelope.clone()),
                            }),
                        ),
                        envelope,
                    })
                    .collect());
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(FLAG_POLL_INTERVAL.min(deadline - now)).await;
        }
    }
}

/// Frames leave the pipe when drained; abandon writes the envelope back.
struct PipeSettle {
    pipe: Pipe,
    envelope: Option<Envelope>,
}

#[async_trait::async_trait]
impl Settle for PipeSettle {
    async fn settle(&mut self, outcome: Settlement) -> Result<(), BusError> {
        let envelope = self.envelope.take();
        if let (Settlement::Abandoned, Some(envelope)) = (outcome, envelope) {
            let pipe = self.pipe.clone();
            tokio::task::spawn_blocking(move || pipe.append(&[envelope]))
                .await
                .map_err(|e| blocking_failed("return to pipe", e))??;
        }
        Ok(())
    }
}

impl Drop for PipeSettle {
    fn drop(&mut self) {
        let Some(envelope) = self.envelope.take() else {
            return;
        };
        let pipe = self.pipe.clone();
        let give_back = move || {
            if let Err(e) = pipe.append(&[envelope]) {
                tracing::warn!(target: "flowhost::messaging", pipe = %pipe.path.display(), error = %e, "failed to return unsettled message");
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(give_back);
            }
            Err(_) => give_back(),
        }
    }
}

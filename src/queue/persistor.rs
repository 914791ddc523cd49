//! Durable Message Queue
//!
//! The [`Persistor`] keeps one file per pending message under a directory,
//! named `{pid}-{counter}`. Anything still present in the directory when the
//! process starts is a message that was never confirmed as delivered, and is
//! offered again on [`Persistor::output`].
//!
//! Capacity is bounded by an optional byte limit that can be changed at
//! runtime through [`Persistor::configure`]. The limit is owned by a single
//! background task; writers push new values to it and capacity checks ask it
//! for the current value, so updates and checks never race. Writers hold an
//! admission lock from the capacity check until their file is written, so
//! concurrent handles cannot overrun the limit together.
//!
//! Disk failures never propagate to the pipeline. They are logged and the
//! operation degrades: corrupt files are skipped on load, a failed save
//! leaves the message in memory only, a failed delete leaks disk space.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::fs;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tracing::{debug, error, info, warn};

use super::error::QueueError;
use crate::message::{Message, Topic};

/// Anything that can take custody of a message for later retry
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist `message`, returning it with its storage path set
    async fn store(&self, message: Message) -> Result<Message, QueueError>;
}

/// Capacity-bounded, file-backed message queue
///
/// Cloning a `Persistor` yields another handle to the same queue.
#[derive(Debug, Clone)]
pub struct Persistor {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    dir: PathBuf,
    pid: u32,
    /// Counter used to mint unique file names
    count: AtomicU64,
    new_limit: mpsc::Sender<Option<u64>>,
    current_limit: mpsc::Sender<oneshot::Sender<Option<u64>>>,
    output: Mutex<Option<mpsc::Receiver<Message>>>,
    /// Held from the capacity check until the file is written
    admission: AsyncMutex<()>,
}

impl Persistor {
    /// Open the queue rooted at `dir`
    ///
    /// The directory is created if needed, every file already in it is
    /// loaded and queued on [`Persistor::output`], and the task serving the
    /// byte limit is spawned. Must be called from within a tokio runtime.
    /// The queue starts without a limit.
    pub async fn open<P: AsRef<Path>>(dir: P) -> Self {
        let dir = dir.as_ref().to_path_buf();
        if let Err(e) = fs::create_dir_all(&dir).await {
            error!("Unable to save unsent messages to {:?}: {}", dir, e);
        }

        let pid = std::process::id();
        let paths = filepaths(&dir).await;
        let next = next_counter(&paths, pid);
        let output = load(&paths).await;

        let (new_limit, new_limit_rx) = mpsc::channel(1);
        let (current_limit, current_limit_rx) = mpsc::channel(1);
        tokio::spawn(serve_limit(None, new_limit_rx, current_limit_rx));

        Self {
            inner: Arc::new(Inner {
                dir,
                pid,
                count: AtomicU64::new(next),
                new_limit,
                current_limit,
                output: Mutex::new(Some(output)),
                admission: AsyncMutex::new(()),
            }),
        }
    }

    /// Directory holding the queue files
    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Sink for new byte limits
    ///
    /// Sending `Some(bytes)` replaces the enforced limit, sending `None`
    /// removes it.
    pub fn configure(&self) -> mpsc::Sender<Option<u64>> {
        self.inner.new_limit.clone()
    }

    /// Current byte limit, `None` meaning unlimited
    pub async fn limit(&self) -> Option<u64> {
        let (tx, rx) = oneshot::channel();
        if self.inner.current_limit.send(tx).await.is_err() {
            warn!("Storage limit task is gone, treating queue as unlimited");
            return None;
        }
        rx.await.unwrap_or(None)
    }

    /// Messages recovered from disk when the queue was opened
    ///
    /// The stream closes once every recovered message has been taken. It can
    /// be obtained once; later calls return an already closed stream.
    pub fn output(&self) -> mpsc::Receiver<Message> {
        let taken = match self.inner.output.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        taken.unwrap_or_else(|| mpsc::channel(1).1)
    }

    /// Total size in bytes of the files currently in the queue
    pub async fn disk_usage(&self) -> u64 {
        let mut total = 0;
        for path in filepaths(&self.inner.dir).await {
            match fs::metadata(&path).await {
                Ok(meta) => total += meta.len(),
                Err(e) => {
                    warn!("Failed to calculate storage size of message {:?}: {}", path, e)
                }
            }
        }
        total
    }

    /// Build a message and persist it
    ///
    /// Fails only with [`QueueError::StorageFull`] (or an encoding error).
    /// A failure to write the file is logged and the message is still
    /// returned: the caller may forward it even though it will not survive a
    /// crash. Callers must not treat a returned message as durable without
    /// checking [`Message::is_persisted`].
    pub async fn create_message(
        &self,
        bytes: Vec<u8>,
        topic: Topic,
    ) -> Result<Message, QueueError> {
        self.store(Message::new(topic, bytes)).await
    }

    /// Persist an in-memory message
    ///
    /// Messages that already have a backing file are returned untouched.
    /// Same failure contract as [`Persistor::create_message`].
    pub async fn store(&self, message: Message) -> Result<Message, QueueError> {
        if message.is_persisted() {
            return Ok(message);
        }

        let record = message.encode()?;
        let _admission = self.inner.admission.lock().await;
        if let Some(limit) = self.limit().await {
            let used = self.disk_usage().await;
            if record.len() as u64 + used > limit.saturating_mul(9) / 10 {
                return Err(QueueError::StorageFull {
                    limit,
                    count: self.inner.count.load(Ordering::SeqCst),
                });
            }
        }

        let n = self.inner.count.fetch_add(1, Ordering::SeqCst);
        let path = self.inner.dir.join(format!("{}-{}", self.inner.pid, n));
        match fs::write(&path, &record).await {
            Ok(()) => {
                debug!("Persisted {} message to {:?}", message.topic, path);
                Ok(message.with_path(path))
            }
            Err(e) => {
                error!("Failed to save message {:?}: {}", path, e);
                Ok(message)
            }
        }
    }

    /// Delete a message's backing file
    ///
    /// Messages without a path are ignored. Failures are logged only.
    pub async fn remove(&self, message: &Message) {
        let Some(path) = message.path() else {
            return;
        };
        if let Err(e) = fs::remove_file(path).await {
            warn!("Failed to remove message {:?}: {}", path, e);
        }
    }
}

#[async_trait]
impl MessageStore for Persistor {
    async fn store(&self, message: Message) -> Result<Message, QueueError> {
        Persistor::store(self, message).await
    }
}

/// Owns the limit; applies pending updates before answering reads
async fn serve_limit(
    mut limit: Option<u64>,
    mut updates: mpsc::Receiver<Option<u64>>,
    mut reads: mpsc::Receiver<oneshot::Sender<Option<u64>>>,
) {
    loop {
        tokio::select! {
            biased;

            update = updates.recv() => match update {
                Some(value) => {
                    debug!("Storage limit set to {:?}", value);
                    limit = value;
                }
                None => break,
            },
            read = reads.recv() => match read {
                Some(reply) => {
                    let _ = reply.send(limit);
                }
                None => break,
            },
        }
    }
}

/// Paths of the queue files, in creation order
async fn filepaths(dir: &Path) -> Vec<PathBuf> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            error!("Failed to open message directory {:?}: {}", dir, e);
            return Vec::new();
        }
    };

    let mut paths = Vec::new();
    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => paths.push(entry.path()),
            Ok(None) => break,
            Err(e) => {
                error!("Failed to read directory names in {:?}: {}", dir, e);
                break;
            }
        }
    }
    paths.sort_by(|a, b| file_order(a).cmp(&file_order(b)).then_with(|| a.cmp(b)));
    paths
}

/// `(pid, counter)` parsed from a queue file name
fn file_order(path: &Path) -> Option<(u32, u64)> {
    let name = path.file_name()?.to_str()?;
    let (pid, counter) = name.split_once('-')?;
    Some((pid.parse().ok()?, counter.parse().ok()?))
}

/// First counter value that cannot collide with a file left by a previous
/// process that had the same pid
fn next_counter(paths: &[PathBuf], pid: u32) -> u64 {
    paths
        .iter()
        .filter_map(|p| file_order(p))
        .filter(|(p, _)| *p == pid)
        .map(|(_, n)| n + 1)
        .max()
        .unwrap_or(0)
}

/// Read every queue file into a stream that closes once drained
async fn load(paths: &[PathBuf]) -> mpsc::Receiver<Message> {
    let (tx, rx) = mpsc::channel(paths.len().max(1));
    let mut loaded = 0;
    for path in paths {
        let data = match fs::read(path).await {
            Ok(data) => data,
            Err(e) => {
                warn!("Failed to load message {:?}: {}", path, e);
                continue;
            }
        };
        match serde_json::from_slice::<Message>(&data) {
            Ok(message) => {
                if tx.try_send(message.with_path(path.clone())).is_ok() {
                    loaded += 1;
                }
            }
            Err(e) => warn!("Failed to load message {:?}: {}", path, e),
        }
    }
    if loaded > 0 {
        info!("Recovered {} unsent messages", loaded);
    }
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn drain(mut rx: mpsc::Receiver<Message>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Some(m) = rx.recv().await {
            out.push(m);
        }
        out
    }

    fn record_len(m: &Message) -> u64 {
        m.encode().unwrap().len() as u64
    }

    #[tokio::test]
    async fn test_open_creates_directory() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("nested").join("queue");
        let p = Persistor::open(&dir).await;
        assert!(dir.is_dir());
        assert!(drain(p.output()).await.is_empty());
    }

    #[tokio::test]
    async fn test_create_message_writes_file() {
        let tmp = TempDir::new().unwrap();
        let p = Persistor::open(tmp.path()).await;

        let m = p.create_message(b"payload".to_vec(), Topic::Event).await.unwrap();
        let path = m.path().unwrap().to_path_buf();
        assert!(path.exists());

        let name = path.file_name().unwrap().to_str().unwrap().to_string();
        assert!(name.starts_with(&format!("{}-", std::process::id())));
        assert_eq!(p.disk_usage().await, record_len(&m));
    }

    #[tokio::test]
    async fn test_recovered_after_reopen() {
        let tmp = TempDir::new().unwrap();
        {
            let p = Persistor::open(tmp.path()).await;
            p.create_message(b"one".to_vec(), Topic::Profile).await.unwrap();
            p.create_message(b"two".to_vec(), Topic::Log).await.unwrap();
        }

        let p = Persistor::open(tmp.path()).await;
        let recovered = drain(p.output()).await;
        assert_eq!(recovered.len(), 2);
        assert_eq!(recovered[0].topic, Topic::Profile);
        assert_eq!(recovered[0].bytes, b"one".to_vec());
        assert_eq!(recovered[1].topic, Topic::Log);
        assert_eq!(recovered[1].bytes, b"two".to_vec());
        assert!(recovered.iter().all(|m| m.is_persisted()));
    }

    #[tokio::test]
    async fn test_removed_message_not_recovered() {
        let tmp = TempDir::new().unwrap();
        {
            let p = Persistor::open(tmp.path()).await;
            let keep = p.create_message(b"keep".to_vec(), Topic::Event).await.unwrap();
            let gone = p.create_message(b"gone".to_vec(), Topic::Event).await.unwrap();
            p.remove(&gone).await;
            assert!(keep.is_persisted());
        }

        let p = Persistor::open(tmp.path()).await;
        let recovered = drain(p.output()).await;
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].bytes, b"keep".to_vec());
    }

    #[tokio::test]
    async fn test_corrupt_file_skipped() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("1-0"), b"not json").unwrap();
        let good = Message::new(Topic::Log, b"ok".to_vec());
        std::fs::write(tmp.path().join("1-1"), good.encode().unwrap()).unwrap();

        let p = Persistor::open(tmp.path()).await;
        let recovered = drain(p.output()).await;
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].bytes, b"ok".to_vec());
    }

    #[tokio::test]
    async fn test_output_taken_once() {
        let tmp = TempDir::new().unwrap();
        {
            let p = Persistor::open(tmp.path()).await;
            p.create_message(b"x".to_vec(), Topic::Log).await.unwrap();
        }
        let p = Persistor::open(tmp.path()).await;
        assert_eq!(drain(p.output()).await.len(), 1);
        assert!(drain(p.output()).await.is_empty());
    }

    #[tokio::test]
    async fn test_configure_limit() {
        let tmp = TempDir::new().unwrap();
        let p = Persistor::open(tmp.path()).await;
        assert_eq!(p.limit().await, None);

        p.configure().send(Some(4096)).await.unwrap();
        assert_eq!(p.limit().await, Some(4096));

        p.configure().send(None).await.unwrap();
        assert_eq!(p.limit().await, None);
    }

    #[tokio::test]
    async fn test_storage_full_at_ninety_percent() {
        let tmp = TempDir::new().unwrap();
        let p = Persistor::open(tmp.path()).await;

        let first = p.create_message(vec![7; 40], Topic::Log).await.unwrap();
        let used = record_len(&first);

        let second = Message::new(Topic::Log, vec![7; 40]);
        let size = record_len(&second);

        // Exactly at 90% after the second write.
        let limit = (used + size) * 10 / 9 + 1;
        p.configure().send(Some(limit)).await.unwrap();
        assert!(p.store(second.clone()).await.is_ok());

        // No room left for a third copy.
        let err = p.store(second).await.unwrap_err();
        match err {
            QueueError::StorageFull { limit: l, count } => {
                assert_eq!(l, limit);
                assert_eq!(count, 2);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_storage_full_leaves_no_file() {
        let tmp = TempDir::new().unwrap();
        let p = Persistor::open(tmp.path()).await;
        p.configure().send(Some(10)).await.unwrap();

        let err = p.create_message(vec![0; 100], Topic::Event).await.unwrap_err();
        assert!(err.is_storage_full());
        assert_eq!(p.disk_usage().await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_respect_limit() {
        let tmp = TempDir::new().unwrap();
        let p = Persistor::open(tmp.path()).await;

        let size = record_len(&Message::new(Topic::Event, vec![1; 160]));
        // Room for exactly one record under the 90% mark.
        let limit = (size * 10 + 8) / 9;
        p.configure().send(Some(limit)).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let p = p.clone();
            tasks.push(tokio::spawn(async move {
                p.create_message(vec![1; 160], Topic::Event).await
            }));
        }

        let mut stored = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => stored += 1,
                Err(e) => assert!(e.is_storage_full()),
            }
        }
        assert_eq!(stored, 1);
        assert_eq!(p.disk_usage().await, size);
    }

    #[tokio::test]
    async fn test_store_persisted_message_is_noop() {
        let tmp = TempDir::new().unwrap();
        let p = Persistor::open(tmp.path()).await;
        let m = p.create_message(b"a".to_vec(), Topic::Log).await.unwrap();
        let again = p.store(m.clone()).await.unwrap();
        assert_eq!(again.path(), m.path());
        assert_eq!(p.disk_usage().await, record_len(&m));
    }

    #[tokio::test]
    async fn test_save_failure_still_returns_message() {
        let tmp = TempDir::new().unwrap();
        let p = Persistor::open(tmp.path()).await;
        std::fs::remove_dir_all(tmp.path()).unwrap();

        let m = p.create_message(b"in memory".to_vec(), Topic::Event).await.unwrap();
        assert!(!m.is_persisted());
        assert_eq!(m.bytes, b"in memory".to_vec());
    }

    #[tokio::test]
    async fn test_remove_missing_file_tolerated() {
        let tmp = TempDir::new().unwrap();
        let p = Persistor::open(tmp.path()).await;
        let m = p.create_message(b"a".to_vec(), Topic::Log).await.unwrap();
        p.remove(&m).await;
        p.remove(&m).await;
        p.remove(&Message::new(Topic::Log, vec![])).await;
    }

    #[tokio::test]
    async fn test_counter_skips_same_pid_files() {
        let tmp = TempDir::new().unwrap();
        let pid = std::process::id();
        let old = Message::new(Topic::Log, b"old".to_vec());
        std::fs::write(tmp.path().join(format!("{}-5", pid)), old.encode().unwrap()).unwrap();

        let p = Persistor::open(tmp.path()).await;
        let m = p.create_message(b"new".to_vec(), Topic::Log).await.unwrap();
        assert_eq!(m.path().unwrap(), tmp.path().join(format!("{}-6", pid)));
    }

    #[test]
    fn test_file_order_parsing() {
        assert_eq!(file_order(Path::new("/q/12-3")), Some((12, 3)));
        assert_eq!(file_order(Path::new("/q/junk")), None);
        assert_eq!(file_order(Path::new("/q/1-x")), None);
    }
}

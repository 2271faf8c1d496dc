use super::*;
use crate::config::StateBackendConfig;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Output stream for one piece of checkpoint state.
///
/// Streams are shared with the closeable registry of the task, so every method
/// takes `&self`. [`Closeable::close`] abandons the stream: pending and later
/// writes fail and no handle is ever produced.
pub trait CheckpointStateOutputStream: Closeable {
    fn write(&self, bytes: &[u8]) -> Result<()>;

    /// Bytes written so far.
    fn pos(&self) -> u64;

    /// Finish the stream. `None` when nothing was written.
    fn close_and_get_handle(&self) -> Result<Option<StreamStateHandle>>;
}

pub trait CheckpointStreamFactory: Send + Sync {
    fn create_output_stream(
        &self,
        checkpoint_id: CheckpointId,
        location: &CheckpointStorageLocation,
    ) -> Result<Arc<dyn CheckpointStateOutputStream>>;
}

/// Build the stream factory selected by `config`.
pub fn create_checkpoint_stream_factory(
    config: &StateBackendConfig,
) -> Result<Arc<dyn CheckpointStreamFactory>> {
    Ok(match config {
        StateBackendConfig::Memory(memory) => {
            Arc::new(MemCheckpointStreamFactory::new(memory.max_state_size))
        }
        StateBackendConfig::Filesystem(fs_config) => {
            Arc::new(FsCheckpointStreamFactory::new(&fs_config.checkpoint_dir)?)
        }
    })
}

// ============================================================================
// Memory
// ============================================================================

/// Keeps state bytes inline in the handle; bounded by `max_state_size`.
pub struct MemCheckpointStreamFactory {
    max_state_size: usize,
    next_stream: AtomicU64,
}

impl MemCheckpointStreamFactory {
    pub fn new(max_state_size: usize) -> Self {
        Self {
            max_state_size,
            next_stream: AtomicU64::new(0),
        }
    }
}

impl CheckpointStreamFactory for MemCheckpointStreamFactory {
    fn create_output_stream(
        &self,
        checkpoint_id: CheckpointId,
        _location: &CheckpointStorageLocation,
    ) -> Result<Arc<dyn CheckpointStateOutputStream>> {
        let n = self.next_stream.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(MemoryCheckpointOutputStream::new(
            format!("chk-{checkpoint_id}-{n}"),
            self.max_state_size,
        )))
    }
}

#[derive(Default)]
struct MemStreamInner {
    buf: Vec<u8>,
    closed: bool,
}

pub struct MemoryCheckpointOutputStream {
    name: String,
    max_state_size: usize,
    inner: Mutex<MemStreamInner>,
}

impl MemoryCheckpointOutputStream {
    pub fn new(name: impl Into<String>, max_state_size: usize) -> Self {
        Self {
            name: name.into(),
            max_state_size,
            inner: Mutex::new(MemStreamInner::default()),
        }
    }
}

impl Closeable for MemoryCheckpointOutputStream {
    fn close(&self) -> Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| anyhow!("memory checkpoint stream lock poisoned"))?;
        inner.closed = true;
        inner.buf = Vec::new();
        Ok(())
    }
}

impl CheckpointStateOutputStream for MemoryCheckpointOutputStream {
    fn write(&self, bytes: &[u8]) -> Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| anyhow!("memory checkpoint stream lock poisoned"))?;
        if inner.closed {
            return Err(anyhow!("checkpoint stream {} is closed", self.name));
        }
        let size = inner.buf.len() + bytes.len();
        if size > self.max_state_size {
            return Err(anyhow!(
                "state of {} is larger than the maximum permitted memory-backed state (size={size}, max={})",
                self.name,
                self.max_state_size
            ));
        }
        inner.buf.extend_from_slice(bytes);
        Ok(())
    }

    fn pos(&self) -> u64 {
        self.inner
            .lock()
            .expect("memory checkpoint stream poisoned")
            .buf
            .len() as u64
    }

    fn close_and_get_handle(&self) -> Result<Option<StreamStateHandle>> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| anyhow!("memory checkpoint stream lock poisoned"))?;
        if inner.closed {
            return Err(anyhow!("checkpoint stream {} is already closed", self.name));
        }
        inner.closed = true;
        let data = std::mem::take(&mut inner.buf);
        if data.is_empty() {
            return Ok(None);
        }
        Ok(Some(StreamStateHandle::ByteStream {
            name: self.name.clone(),
            data,
        }))
    }
}

// ============================================================================
// File system
// ============================================================================

/// Writes one file per stream below `<base>/chk-<id>/`, or below the explicit
/// target directory of a savepoint.
pub struct FsCheckpointStreamFactory {
    base_path: PathBuf,
}

impl FsCheckpointStreamFactory {
    pub fn new(base_path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path).with_context(|| {
            format!(
                "failed to create checkpoint storage directory {}",
                base_path.display()
            )
        })?;
        Ok(Self { base_path })
    }

    pub fn checkpoint_dir(&self, checkpoint_id: CheckpointId) -> PathBuf {
        self.base_path.join(format!("chk-{checkpoint_id}"))
    }
}

impl CheckpointStreamFactory for FsCheckpointStreamFactory {
    fn create_output_stream(
        &self,
        checkpoint_id: CheckpointId,
        location: &CheckpointStorageLocation,
    ) -> Result<Arc<dyn CheckpointStateOutputStream>> {
        let dir = match location {
            CheckpointStorageLocation::Default => self.checkpoint_dir(checkpoint_id),
            CheckpointStorageLocation::Path(path) => path.clone(),
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create checkpoint dir {}", dir.display()))?;
        let path = dir.join(Uuid::new_v4().simple().to_string());
        Ok(Arc::new(FsCheckpointOutputStream::create(path)?))
    }
}

struct FsStreamInner {
    writer: Option<BufWriter<File>>,
    pos: u64,
    closed: bool,
}

pub struct FsCheckpointOutputStream {
    path: PathBuf,
    inner: Mutex<FsStreamInner>,
}

impl FsCheckpointOutputStream {
    pub fn create(path: PathBuf) -> Result<Self> {
        let file = File::create(&path)
            .with_context(|| format!("failed to create state file {}", path.display()))?;
        Ok(Self {
            path,
            inner: Mutex::new(FsStreamInner {
                writer: Some(BufWriter::new(file)),
                pos: 0,
                closed: false,
            }),
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn remove_file(&self) {
        if let Err(err) = fs::remove_file(&self.path)
            && err.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(
                "failed to remove partial state file {}: {err}",
                self.path.display()
            );
        }
    }
}

impl Closeable for FsCheckpointOutputStream {
    fn close(&self) -> Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| anyhow!("fs checkpoint stream lock poisoned"))?;
        if inner.closed {
            return Ok(());
        }
        inner.closed = true;
        inner.writer.take();
        self.remove_file();
        Ok(())
    }
}

impl CheckpointStateOutputStream for FsCheckpointOutputStream {
    fn write(&self, bytes: &[u8]) -> Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| anyhow!("fs checkpoint stream lock poisoned"))?;
        if inner.closed {
            return Err(anyhow!("checkpoint stream {} is closed", self.path.display()));
        }
        let writer = inner
            .writer
            .as_mut()
            .ok_or_else(|| anyhow!("checkpoint stream {} has no writer", self.path.display()))?;
        writer
            .write_all(bytes)
            .with_context(|| format!("write to {} failed", self.path.display()))?;
        inner.pos += bytes.len() as u64;
        Ok(())
    }

    fn pos(&self) -> u64 {
        self.inner.lock().expect("fs checkpoint stream poisoned").pos
    }

    fn close_and_get_handle(&self) -> Result<Option<StreamStateHandle>> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| anyhow!("fs checkpoint stream lock poisoned"))?;
        if inner.closed {
            return Err(anyhow!(
                "checkpoint stream {} is already closed",
                self.path.display()
            ));
        }
        inner.closed = true;
        let flushed = match inner.writer.take() {
            Some(mut writer) => writer.flush().and_then(|()| writer.get_ref().sync_all()),
            None => Ok(()),
        };
        if let Err(err) = flushed {
            self.remove_file();
            return Err(err).with_context(|| format!("flush of {} failed", self.path.display()));
        }
        if inner.pos == 0 {
            self.remove_file();
            return Ok(None);
        }
        Ok(Some(StreamStateHandle::File {
            path: self.path.clone(),
            size: inner.pos,
        }))
    }
}

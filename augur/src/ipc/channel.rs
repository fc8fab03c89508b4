//! Channel endpoints for runtime-worker IPC.
//!
//! The runtime binds a Unix socket under a per-process temp directory and
//! hands the path to the child through `AUGUR_IPC_SOCKET`; the child
//! connects back. Each endpoint splits into a single-consumer framed
//! reader and a cloneable writer whose sends are serialized by a mutex.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde::{Serialize, de::DeserializeOwned};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::JsonCodec;
use super::protocol::{WorkerEvent, WorkerRequest};

/// Environment variable naming the socket the child connects to.
pub const IPC_SOCKET_ENV: &str = "AUGUR_IPC_SOCKET";

/// Parent-side listener for the worker channel.
///
/// Socket path format: `{temp_dir}/augur-{pid}/worker.sock`. The directory
/// is removed when the listener is dropped; the connected stream keeps
/// working after the filesystem entry is gone.
pub struct ChannelListener {
    dir: PathBuf,
    path: PathBuf,
    listener: tokio::net::UnixListener,
}

impl ChannelListener {
    pub fn bind() -> io::Result<Self> {
        use std::os::unix::net::UnixListener as StdUnixListener;

        let dir = std::env::temp_dir().join(format!("augur-{}", std::process::id()));
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("worker.sock");

        if path.exists() {
            std::fs::remove_file(&path)?;
        }

        let std_listener = StdUnixListener::bind(&path)?;
        std_listener.set_nonblocking(true)?;
        let listener = tokio::net::UnixListener::from_std(std_listener)?;

        tracing::debug!(path = %path.display(), "Bound worker channel socket");

        Ok(Self { dir, path, listener })
    }

    pub fn socket_path(&self) -> &Path {
        &self.path
    }

    /// Accept the single connection from the child.
    pub async fn accept(&self) -> io::Result<UnixStream> {
        let (stream, _) = self.listener.accept().await?;
        tracing::debug!("Worker connected to channel socket");
        Ok(stream)
    }
}

impl Drop for ChannelListener {
    fn drop(&mut self) {
        if self.dir.exists()
            && let Err(e) = std::fs::remove_dir_all(&self.dir)
        {
            tracing::warn!(error = %e, "Failed to clean up channel socket directory");
        }
    }
}

/// Child-side connect using the path from [`IPC_SOCKET_ENV`].
pub async fn connect(path: &Path) -> io::Result<UnixStream> {
    tracing::debug!(path = %path.display(), "Connecting to worker channel socket");
    UnixStream::connect(path).await
}

/// Cloneable, mutex-serialized write half of a channel endpoint.
///
/// Concurrent senders in the same process (the child's log forwarder and
/// its main loop, for instance) are mutually excluded here.
pub struct SharedWriter<T> {
    inner: Arc<tokio::sync::Mutex<FramedWrite<OwnedWriteHalf, JsonCodec<T>>>>,
}

impl<T> Clone for SharedWriter<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Serialize> SharedWriter<T> {
    fn new(half: OwnedWriteHalf) -> Self {
        Self {
            inner: Arc::new(tokio::sync::Mutex::new(FramedWrite::new(
                half,
                JsonCodec::new(),
            ))),
        }
    }

    pub async fn send(&self, item: T) -> io::Result<()> {
        let mut writer = self.inner.lock().await;
        writer.send(item).await
    }
}

/// Single-consumer read half of a channel endpoint.
pub struct ChannelReader<T> {
    inner: FramedRead<OwnedReadHalf, JsonCodec<T>>,
}

impl<T: DeserializeOwned> ChannelReader<T> {
    fn new(half: OwnedReadHalf) -> Self {
        Self {
            inner: FramedRead::new(half, JsonCodec::new()),
        }
    }

    /// Next message, `None` at end-of-stream (peer closed).
    pub async fn next(&mut self) -> Option<io::Result<T>> {
        self.inner.next().await
    }
}

pub type RequestWriter = SharedWriter<WorkerRequest>;
pub type EventWriter = SharedWriter<WorkerEvent>;
pub type RequestReader = ChannelReader<WorkerRequest>;
pub type EventReader = ChannelReader<WorkerEvent>;

/// Split a connected stream into the runtime-side endpoint.
pub fn parent_endpoint(stream: UnixStream) -> (RequestWriter, EventReader) {
    let (read, write) = stream.into_split();
    (SharedWriter::new(write), ChannelReader::new(read))
}

/// Split a connected stream into the worker-side endpoint.
pub fn child_endpoint(stream: UnixStream) -> (EventWriter, RequestReader) {
    let (read, write) = stream.into_split();
    (SharedWriter::new(write), ChannelReader::new(read))
}

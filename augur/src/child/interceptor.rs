//! Log interception inside the predictor process.
//!
//! Replaces stdout/stderr with capture pipes so every line user code
//! writes becomes a `Log` event on the worker channel, optionally teeing
//! to the original descriptors. Partial lines are carried until a newline
//! arrives or the interceptor is drained.
//!
//! Draining and shutdown are sentinel-based: `drain()` writes a token
//! through both captured streams and waits until the reader threads have
//! observed it, then round-trips a flush through the channel writer so
//! every previously written byte is on the socket before it returns.
//!
//! The capture threads never call `tracing` - their output would feed
//! straight back into the pipes they read.

use std::io::Read;
use std::os::fd::{BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::unistd::{dup, dup2, pipe};
use tokio::sync::{mpsc, oneshot};

use crate::ipc::protocol::{LogSource, WorkerEvent};

/// Message from the interceptor (and the worker loop) to the task that
/// owns the channel writer.
pub enum LogMessage {
    Event(WorkerEvent),
    /// Ack once every message queued before this one has been written.
    Flush(oneshot::Sender<()>),
}

const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

struct DrainWait {
    remaining: u8,
    ack: Option<oneshot::Sender<()>>,
}

struct CapturedStream {
    source: LogSource,
    target_fd: RawFd,
    saved: OwnedFd,
}

pub struct LogInterceptor {
    streams: Vec<CapturedStream>,
    drain_wait: Arc<Mutex<DrainWait>>,
    drain_token: String,
    terminate_token: String,
    log_tx: mpsc::Sender<LogMessage>,
    threads: Vec<std::thread::JoinHandle<()>>,
}

impl LogInterceptor {
    /// Capture the process's stdout and stderr.
    pub fn install(log_tx: mpsc::Sender<LogMessage>, tee: bool) -> std::io::Result<Self> {
        Self::install_on(
            [(LogSource::Stdout, 1), (LogSource::Stderr, 2)],
            log_tx,
            tee,
        )
    }

    /// Capture arbitrary descriptors. The plumbing is fd-number based so
    /// tests can intercept pipes of their own instead of the real 1/2.
    pub fn install_on(
        targets: [(LogSource, RawFd); 2],
        log_tx: mpsc::Sender<LogMessage>,
        tee: bool,
    ) -> std::io::Result<Self> {
        let drain_token = uuid::Uuid::new_v4().to_string();
        let terminate_token = uuid::Uuid::new_v4().to_string();
        let drain_wait = Arc::new(Mutex::new(DrainWait {
            remaining: 0,
            ack: None,
        }));

        let mut streams = Vec::with_capacity(targets.len());
        let mut threads = Vec::with_capacity(targets.len());

        for (source, target_fd) in targets {
            // Save the original destination, then point the target fd at
            // the write end of a capture pipe.
            // Safety: the target fd is open for the lifetime of the
            // interceptor; we only borrow it for dup/dup2 calls.
            let saved = dup(unsafe { BorrowedFd::borrow_raw(target_fd) })
                .map_err(std::io::Error::from)?;
            let (pipe_read, pipe_write) = pipe().map_err(std::io::Error::from)?;

            let mut target = unsafe { OwnedFd::from_raw_fd(target_fd) };
            dup2(&pipe_write, &mut target).map_err(std::io::Error::from)?;
            std::mem::forget(target); // the fd still belongs to the process
            drop(pipe_write);

            let tee_fd = if tee {
                Some(dup(&saved).map_err(std::io::Error::from)?)
            } else {
                None
            };

            let reader = ReaderThread {
                source,
                file: std::fs::File::from(pipe_read),
                tee_fd,
                drain_token: drain_token.clone(),
                terminate_token: terminate_token.clone(),
                drain_wait: Arc::clone(&drain_wait),
                log_tx: log_tx.clone(),
            };
            threads.push(std::thread::spawn(move || reader.run()));

            streams.push(CapturedStream {
                source,
                target_fd,
                saved,
            });
        }

        Ok(Self {
            streams,
            drain_wait,
            drain_token,
            terminate_token,
            log_tx,
            threads,
        })
    }

    /// Flush both streams: every byte written before this call is observable
    /// by the parent when it returns. Partial lines are emitted as-is.
    pub async fn drain(&self) -> std::io::Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        {
            let mut wait = self
                .drain_wait
                .lock()
                .map_err(|_| std::io::Error::other("drain state poisoned"))?;
            wait.remaining = self.streams.len() as u8;
            wait.ack = Some(ack_tx);
        }

        let token_line = format!("{}\n", self.drain_token);
        for stream in &self.streams {
            write_all_fd(stream.target_fd, token_line.as_bytes())?;
        }

        tokio::time::timeout(DRAIN_TIMEOUT, ack_rx)
            .await
            .map_err(|_| std::io::Error::other("output streams failed to drain"))?
            .map_err(|_| std::io::Error::other("drain ack dropped"))?;

        // The tokens are back, so all prior lines are queued on the log
        // channel; now wait for the writer task to put them on the socket.
        let (flush_tx, flush_rx) = oneshot::channel();
        self.log_tx
            .send(LogMessage::Flush(flush_tx))
            .await
            .map_err(|_| std::io::Error::other("log channel closed"))?;
        flush_rx
            .await
            .map_err(|_| std::io::Error::other("log writer dropped flush"))?;

        Ok(())
    }

    /// Stop the reader threads and restore the original descriptors.
    pub fn shutdown(mut self) {
        let token_line = format!("{}\n", self.terminate_token);
        for stream in &self.streams {
            let _ = write_all_fd(stream.target_fd, token_line.as_bytes());
        }
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
        for stream in &self.streams {
            let mut target = unsafe { OwnedFd::from_raw_fd(stream.target_fd) };
            let _ = dup2(&stream.saved, &mut target);
            std::mem::forget(target);
            tracing::trace!(source = ?stream.source, "Restored captured stream");
        }
    }
}

fn write_all_fd(fd: RawFd, mut buf: &[u8]) -> std::io::Result<()> {
    // Safety: callers hold the interceptor, which keeps the fd open.
    let fd = unsafe { BorrowedFd::borrow_raw(fd) };
    while !buf.is_empty() {
        match nix::unistd::write(fd, buf) {
            Ok(0) => return Err(std::io::Error::new(std::io::ErrorKind::WriteZero, "fd closed")),
            Ok(n) => buf = &buf[n..],
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(std::io::Error::from(e)),
        }
    }
    Ok(())
}

struct ReaderThread {
    source: LogSource,
    file: std::fs::File,
    tee_fd: Option<OwnedFd>,
    drain_token: String,
    terminate_token: String,
    drain_wait: Arc<Mutex<DrainWait>>,
    log_tx: mpsc::Sender<LogMessage>,
}

impl ReaderThread {
    fn run(mut self) {
        let mut carry: Vec<u8> = Vec::new();
        let mut buf = [0u8; 4096];

        loop {
            match self.file.read(&mut buf) {
                Ok(0) => {
                    self.flush_carry(&mut carry);
                    return;
                }
                Ok(n) => {
                    carry.extend_from_slice(&buf[..n]);
                    while let Some(pos) = carry.iter().position(|&b| b == b'\n') {
                        let line: Vec<u8> = carry.drain(..=pos).collect();
                        if self.handle_line(&line) {
                            return;
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => {
                    self.flush_carry(&mut carry);
                    return;
                }
            }
        }
    }

    /// Returns true when the terminate sentinel was seen.
    fn handle_line(&mut self, line: &[u8]) -> bool {
        let text = String::from_utf8_lossy(line);
        let trimmed = text.trim_end_matches('\n');

        if let Some(prefix) = trimmed.strip_suffix(&self.terminate_token) {
            // A partial line written right before shutdown still gets out.
            if !prefix.is_empty() {
                self.emit(prefix.to_string());
            }
            return true;
        }

        if let Some(prefix) = trimmed.strip_suffix(&self.drain_token) {
            if !prefix.is_empty() {
                self.emit(prefix.to_string());
            }
            self.note_drain_token();
            return false;
        }

        self.emit(text.into_owned());
        false
    }

    fn flush_carry(&mut self, carry: &mut Vec<u8>) {
        if !carry.is_empty() {
            let text = String::from_utf8_lossy(carry).into_owned();
            carry.clear();
            self.emit(text);
        }
    }

    fn emit(&mut self, message: String) {
        if message.is_empty() {
            return;
        }
        if let Some(ref tee_fd) = self.tee_fd {
            let mut bytes = message.as_bytes();
            while !bytes.is_empty() {
                match nix::unistd::write(tee_fd, bytes) {
                    Ok(0) => break,
                    Ok(n) => bytes = &bytes[n..],
                    Err(nix::errno::Errno::EINTR) => continue,
                    Err(_) => break,
                }
            }
        }
        let _ = self.log_tx.blocking_send(LogMessage::Event(WorkerEvent::Log {
            source: self.source,
            message,
        }));
    }

    fn note_drain_token(&self) {
        if let Ok(mut wait) = self.drain_wait.lock()
            && wait.remaining > 0
        {
            wait.remaining -= 1;
            if wait.remaining == 0
                && let Some(ack) = wait.ack.take()
            {
                let _ = ack.send(());
            }
        }
    }
}

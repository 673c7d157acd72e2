//! Sandboxed engine transport.
//!
//! The engine runs as a task whose only I/O is three descriptors and a
//! read-only file snapshot:
//!
//! - fd 0: reads are served from a FIFO of inbound frames. An empty queue
//!   parks the reader until the host pushes more.
//! - fd 1: every write is forwarded to the host and reassembled into replies.
//! - fd 2: writes are buffered, split into lines and logged.
//!
//! ```text
//! Transport ─► outbound pump ─► stdin queue ─► SandboxIo::read(0)  ┐
//!                                                                  │ engine
//! Transport ◄─ FrameBuffer ◄─── stdout chunks ◄─ SandboxIo::write(1) ┘
//! ```

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

use bytes::Bytes;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::{BoxFuture, Closer, Inbound, Link, Transport, TransportConfig};
use crate::error::{LintwireError, Result};
use crate::protocol::{encode_message, kind, FrameBuffer, LengthPrefixed, Message};

/// Read-only path → contents snapshot visible to the sandboxed engine.
///
/// Paths are normalized: backslashes become `/` and a leading `/` is added.
#[derive(Debug, Clone, Default)]
pub struct VirtualFs {
    files: HashMap<String, Bytes>,
}

impl VirtualFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with_file(mut self, path: &str, contents: impl Into<Bytes>) -> Self {
        self.insert(path, contents);
        self
    }

    /// Add or replace a file.
    pub fn insert(&mut self, path: &str, contents: impl Into<Bytes>) {
        self.files.insert(normalize_path(path), contents.into());
    }

    /// File contents, if present.
    pub fn read(&self, path: &str) -> Option<Bytes> {
        self.files.get(&normalize_path(path)).cloned()
    }

    /// File contents as UTF-8 text.
    pub fn read_to_string(&self, path: &str) -> Result<Option<String>> {
        match self.files.get(&normalize_path(path)) {
            Some(bytes) => Ok(Some(std::str::from_utf8(bytes)?.to_string())),
            None => Ok(None),
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.files.contains_key(&normalize_path(path))
    }

    /// Size of a file in bytes.
    pub fn len(&self, path: &str) -> Option<usize> {
        self.files.get(&normalize_path(path)).map(Bytes::len)
    }

    /// Number of files in the snapshot.
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// All paths, sorted.
    pub fn paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self.files.keys().map(String::as_str).collect();
        paths.sort_unstable();
        paths
    }
}

fn normalize_path(path: &str) -> String {
    let path = path.replace('\\', "/");
    let trimmed = path.trim_start_matches("./");
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

/// State shared between the host pump and the engine's fd 0 reader.
#[derive(Default)]
struct ShimState {
    stdin: VecDeque<Bytes>,
    /// Read position inside the front chunk.
    stdin_pos: usize,
    /// Reader waiting for data.
    parked: Option<Waker>,
    closed: bool,
}

#[derive(Clone, Default)]
struct Shim {
    state: Arc<Mutex<ShimState>>,
}

impl Shim {
    fn lock(&self) -> MutexGuard<'_, ShimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a frame for fd 0 and resume a parked reader.
    fn push(&self, frame: Bytes) -> bool {
        let waker = {
            let mut state = self.lock();
            if state.closed {
                return false;
            }
            state.stdin.push_back(frame);
            state.parked.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        true
    }

    /// End fd 0. Queued frames are still readable, then reads return 0.
    fn close(&self) {
        let waker = {
            let mut state = self.lock();
            state.closed = true;
            state.parked.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    fn poll_read(&self, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<io::Result<usize>> {
        let mut state = self.lock();
        let pos = state.stdin_pos;
        if let Some(front) = state.stdin.front() {
            let count = buf.len().min(front.len() - pos);
            buf[..count].copy_from_slice(&front[pos..pos + count]);
            let exhausted = pos + count == front.len();
            if exhausted {
                state.stdin.pop_front();
                state.stdin_pos = 0;
            } else {
                state.stdin_pos = pos + count;
            }
            return Poll::Ready(Ok(count));
        }
        if state.closed {
            return Poll::Ready(Ok(0));
        }
        state.parked = Some(cx.waker().clone());
        Poll::Pending
    }
}

/// Line-splitting sink for fd 2.
#[derive(Default)]
struct StderrLines {
    partial: Vec<u8>,
}

impl StderrLines {
    fn write(&mut self, buf: &[u8]) {
        self.partial.extend_from_slice(buf);
        while let Some(newline) = self.partial.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=newline).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]);
            info!(target: "lintwire::engine", "{}", text.trim_end_matches('\r'));
        }
    }

    fn flush(&mut self) {
        if !self.partial.is_empty() {
            let text = String::from_utf8_lossy(&self.partial).into_owned();
            info!(target: "lintwire::engine", "{}", text);
            self.partial.clear();
        }
    }
}

impl Drop for StderrLines {
    fn drop(&mut self) {
        self.flush();
    }
}

fn bad_descriptor(fd: u32) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("bad file descriptor {}", fd),
    )
}

fn stdout_closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "host stopped reading fd 1")
}

/// The engine's view of the sandbox.
pub struct SandboxIo {
    shim: Shim,
    stdout: mpsc::UnboundedSender<Bytes>,
    stderr: StderrLines,
    fs: Arc<VirtualFs>,
}

impl SandboxIo {
    /// Write to fd 1 or fd 2. Any other descriptor is an error.
    pub fn write(&mut self, fd: u32, buf: &[u8]) -> io::Result<usize> {
        match fd {
            1 => {
                self.stdout
                    .send(Bytes::copy_from_slice(buf))
                    .map_err(|_| stdout_closed())?;
                Ok(buf.len())
            }
            2 => {
                self.stderr.write(buf);
                Ok(buf.len())
            }
            other => Err(bad_descriptor(other)),
        }
    }

    /// Poll a read from fd 0.
    ///
    /// Copies at most the rest of the oldest queued frame. Parks when the
    /// queue is empty and returns `Ok(0)` after the host has closed.
    pub fn poll_read(
        &self,
        fd: u32,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        if fd != 0 {
            return Poll::Ready(Err(bad_descriptor(fd)));
        }
        self.shim.poll_read(cx, buf)
    }

    /// Read from fd 0.
    pub async fn read(&self, fd: u32, buf: &mut [u8]) -> io::Result<usize> {
        std::future::poll_fn(|cx| self.poll_read(fd, cx, buf)).await
    }

    /// The file snapshot.
    pub fn fs(&self) -> &VirtualFs {
        &self.fs
    }

    /// Split into async fd 0 / fd 1 / fd 2 handles and the file snapshot.
    pub fn into_split(self) -> (SandboxStdin, SandboxStdout, SandboxStderr, Arc<VirtualFs>) {
        let SandboxIo {
            shim,
            stdout,
            stderr,
            fs,
        } = self;
        (
            SandboxStdin { shim },
            SandboxStdout { tx: Some(stdout) },
            SandboxStderr { lines: stderr },
            fs,
        )
    }
}

/// Async reader over fd 0.
pub struct SandboxStdin {
    shim: Shim,
}

impl AsyncRead for SandboxStdin {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let dst = buf.initialize_unfilled();
        match self.shim.poll_read(cx, dst) {
            Poll::Ready(Ok(n)) => {
                buf.advance(n);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Async writer over fd 1.
pub struct SandboxStdout {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
}

impl AsyncWrite for SandboxStdout {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let Some(tx) = self.tx.as_mut() else {
            return Poll::Ready(Err(stdout_closed()));
        };
        match tx.send(Bytes::copy_from_slice(buf)) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(stdout_closed())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.tx = None;
        Poll::Ready(Ok(()))
    }
}

/// Async writer over fd 2. Complete lines are logged as they arrive.
pub struct SandboxStderr {
    lines: StderrLines,
}

impl AsyncWrite for SandboxStderr {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.lines.write(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.lines.flush();
        Poll::Ready(Ok(()))
    }
}

/// Builder for a sandboxed engine transport.
#[derive(Debug, Clone, Default)]
pub struct BridgeBuilder {
    fs: VirtualFs,
    config: TransportConfig,
}

impl BridgeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file to the snapshot.
    pub fn file(mut self, path: &str, contents: impl Into<Bytes>) -> Self {
        self.fs.insert(path, contents);
        self
    }

    /// Replace the whole snapshot.
    pub fn fs(mut self, fs: VirtualFs) -> Self {
        self.fs = fs;
        self
    }

    /// Replace the transport configuration.
    pub fn config(mut self, config: TransportConfig) -> Self {
        self.config = config;
        self
    }

    /// Start `engine` inside the sandbox and open a transport to it.
    ///
    /// An `init` request is answered by the bridge itself with
    /// `{"status": "ok"}` once the engine task is running; every other
    /// request goes to the engine over fd 0.
    pub fn open<E, Fut>(self, engine: E) -> Transport
    where
        E: FnOnce(SandboxIo) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let shim = Shim::default();
        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel();
        let capacity = self.config.channel_capacity.max(1);
        let (outbound, outbound_rx) = mpsc::channel(capacity);
        let (events, inbound) = mpsc::channel(capacity);

        let io = SandboxIo {
            shim: shim.clone(),
            stdout: stdout_tx,
            stderr: StderrLines::default(),
            fs: Arc::new(self.fs),
        };
        let engine_fut = engine(io);
        let engine_task = tokio::spawn(async move {
            match engine_fut.await {
                Ok(()) => debug!("sandboxed engine finished"),
                Err(e) => error!("sandboxed engine failed: {}", e),
            }
        });

        let to_engine = tokio::spawn(pump_to_engine(outbound_rx, shim.clone(), events.clone()));
        let from_engine = tokio::spawn(pump_from_engine(
            stdout_rx,
            FrameBuffer::new(LengthPrefixed::new(self.config.max_frame_size)),
            events,
        ));

        Transport::from_link(Link {
            outbound,
            inbound,
            closer: Box::new(BridgeCloser {
                shim,
                engine: engine_task,
                pumps: [to_engine, from_engine],
            }),
        })
    }
}

/// Host → fd 0: encode requests and queue them for the engine.
async fn pump_to_engine(
    mut requests: mpsc::Receiver<Message>,
    shim: Shim,
    events: mpsc::Sender<Inbound>,
) {
    while let Some(message) = requests.recv().await {
        if message.kind == kind::INIT {
            let reply = Message::response(message.id, json!({ "status": "ok" }));
            if events.send(Inbound::Message(reply)).await.is_err() {
                return;
            }
            continue;
        }

        let frame = match encode_message(&message) {
            Ok(frame) => frame,
            Err(e) => {
                error!("failed to encode request {}: {}", message.id, e);
                let _ = events.send(Inbound::Failed(e)).await;
                return;
            }
        };
        if !shim.push(Bytes::from(frame)) {
            let _ = events
                .send(Inbound::Failed(LintwireError::terminated(
                    "sandbox stdin is closed",
                )))
                .await;
            return;
        }
    }
}

/// fd 1 → host: reassemble replies.
async fn pump_from_engine(
    mut chunks: mpsc::UnboundedReceiver<Bytes>,
    mut frames: FrameBuffer<LengthPrefixed>,
    events: mpsc::Sender<Inbound>,
) {
    while let Some(chunk) = chunks.recv().await {
        match frames.push(&chunk) {
            Ok(messages) => {
                for message in messages {
                    if events.send(Inbound::Message(message)).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                error!("sandboxed engine wrote a malformed frame: {}", e);
                let _ = events.send(Inbound::Failed(e)).await;
                return;
            }
        }
    }

    // Every fd 1 handle is gone: the engine has finished.
    let last = match frames.finish() {
        Ok(()) => Inbound::Closed,
        Err(e) => {
            error!("sandboxed engine stopped mid-frame: {}", e);
            Inbound::Failed(e)
        }
    };
    let _ = events.send(last).await;
}

struct BridgeCloser {
    shim: Shim,
    engine: JoinHandle<()>,
    pumps: [JoinHandle<()>; 2],
}

impl Closer for BridgeCloser {
    fn close(self: Box<Self>) -> BoxFuture<'static, ()> {
        let BridgeCloser {
            shim,
            engine,
            pumps,
        } = *self;
        Box::pin(async move {
            shim.close();
            engine.abort();
            for pump in pumps {
                pump.abort();
            }
        })
    }
}

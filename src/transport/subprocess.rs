//! Engine child process transport.
//!
//! The engine is spawned with piped stdin/stdout and inherited stderr.
//! Requests are written to stdin as format A frames; stdout is reassembled
//! into replies.
//!
//! # Example
//!
//! ```ignore
//! use lintwire::SubprocessBuilder;
//! use serde_json::json;
//!
//! let transport = SubprocessBuilder::new("rslint").api_mode().spawn()?;
//! transport.handshake().await?;
//! let diagnostics = transport.request("lint", json!({ "files": ["a.ts"] })).await?;
//! transport.exit().await?;
//! ```

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::{spawn_reader, spawn_writer, BoxFuture, Closer, Link, Transport, TransportConfig};
use crate::error::{LintwireError, Result};
use crate::protocol::{encode_message, FrameBuffer, LengthPrefixed};

/// Flag that puts the engine into request/response mode.
pub const API_MODE_FLAG: &str = "--api";

/// Builder for spawning an engine process.
#[derive(Debug, Clone)]
pub struct SubprocessBuilder {
    program: OsString,
    args: Vec<OsString>,
    current_dir: Option<PathBuf>,
    envs: Vec<(OsString, OsString)>,
    config: TransportConfig,
}

impl SubprocessBuilder {
    /// Create a builder for the given engine executable.
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            envs: Vec::new(),
            config: TransportConfig::default(),
        }
    }

    /// Append an argument.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Pass `--api` so the engine speaks the request/response protocol.
    pub fn api_mode(self) -> Self {
        self.arg(API_MODE_FLAG)
    }

    /// Working directory of the engine.
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Set an environment variable for the engine.
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Replace the transport configuration.
    pub fn config(mut self, config: TransportConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the largest reply frame accepted from the engine.
    ///
    /// Default: 256 MiB
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Spawn the engine and start the transport session.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(self) -> Result<Transport> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn()?;
        debug!(pid = child.id(), program = ?self.program, "engine spawned");

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| LintwireError::terminated("engine stdin was not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LintwireError::terminated("engine stdout was not captured"))?;

        let capacity = self.config.channel_capacity.max(1);
        let (outbound, outbound_rx) = mpsc::channel(capacity);
        let (events, inbound) = mpsc::channel(capacity);

        let writer = spawn_writer(outbound_rx, stdin, encode_message, events.clone());
        let reader = spawn_reader(
            stdout,
            FrameBuffer::new(LengthPrefixed::new(self.config.max_frame_size)),
            self.config.read_buffer_size,
            events,
        );

        Ok(Transport::from_link(Link {
            outbound,
            inbound,
            closer: Box::new(ProcessCloser {
                child,
                writer,
                reader,
            }),
        }))
    }
}

/// Ends stdin, stops the pumps and kills the engine.
struct ProcessCloser {
    child: Child,
    writer: JoinHandle<Result<()>>,
    reader: JoinHandle<()>,
}

impl Closer for ProcessCloser {
    fn close(self: Box<Self>) -> BoxFuture<'static, ()> {
        let ProcessCloser {
            mut child,
            writer,
            reader,
        } = *self;
        Box::pin(async move {
            // The writer task owns stdin; aborting it closes the pipe.
            writer.abort();
            let _ = writer.await;
            reader.abort();

            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!(%status, "engine had already exited");
                }
                _ => {
                    // Fails only if the process is already gone.
                    let _ = child.start_kill();
                    match child.wait().await {
                        Ok(status) => debug!(%status, "engine stopped"),
                        Err(e) => debug!("waiting for engine failed: {}", e),
                    }
                }
            }
        })
    }
}

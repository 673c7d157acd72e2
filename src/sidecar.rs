//! Transpile sidecar client (format B).
//!
//! The sidecar is a separate process started with `--transpileServer`. It
//! reads tag-length requests from stdin and answers each one, in order, with
//! a response (type 4) or an error (type 5). Replies carry no id, so
//! correlation is first-in first-out.
//!
//! # Example
//!
//! ```ignore
//! use lintwire::sidecar::{SidecarBuilder, TranspileRequest};
//!
//! let sidecar = SidecarBuilder::new("tsgo").cwd("/project").spawn()?;
//! let out = sidecar
//!     .transpile(&TranspileRequest::new("/project/src/index.ts").module("commonjs"))
//!     .await?;
//! println!("{}", out.output_text);
//! sidecar.close().await;
//! ```

use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::codec::JsonCodec;
use crate::error::{LintwireError, Result};
use crate::protocol::{encode_tagged, FrameBuffer, TagLength, TaggedMessage};
use crate::transport::{spawn_reader, spawn_writer, Inbound, TransportConfig};

/// Flag that starts the sidecar's request loop.
pub const TRANSPILE_SERVER_FLAG: &str = "--transpileServer";

/// Method name of the transpile request.
pub const TRANSPILE_METHOD: &str = "transpile";

/// Options for transpiling one file.
///
/// Empty strings and `false` flags are left out of the request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranspileRequest {
    pub file_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub config_file_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub module: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub jsx: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub inline_source_map: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub source_map: bool,
    #[serde(rename = "typecheck", default, skip_serializing_if = "is_false")]
    pub typecheck: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl TranspileRequest {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            ..Self::default()
        }
    }

    pub fn config_file(mut self, path: impl Into<String>) -> Self {
        self.config_file_name = path.into();
        self
    }

    /// Module kind, e.g. `commonjs` or `esnext`.
    pub fn module(mut self, module: impl Into<String>) -> Self {
        self.module = module.into();
        self
    }

    /// Script target, e.g. `es2020`.
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    pub fn jsx(mut self, jsx: impl Into<String>) -> Self {
        self.jsx = jsx.into();
        self
    }

    pub fn inline_source_map(mut self, enabled: bool) -> Self {
        self.inline_source_map = enabled;
        self
    }

    pub fn source_map(mut self, enabled: bool) -> Self {
        self.source_map = enabled;
        self
    }

    /// Report type errors as well as syntax errors.
    pub fn typecheck(mut self, enabled: bool) -> Self {
        self.typecheck = enabled;
        self
    }
}

/// Result of transpiling one file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranspileResponse {
    #[serde(default)]
    pub output_text: String,
    #[serde(default)]
    pub diagnostics_text: String,
    #[serde(default)]
    pub has_error: bool,
}

/// Builder for spawning a transpile sidecar.
#[derive(Debug, Clone)]
pub struct SidecarBuilder {
    program: OsString,
    args: Vec<OsString>,
    cwd: Option<PathBuf>,
    config: TransportConfig,
}

impl SidecarBuilder {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            config: TransportConfig::default(),
        }
    }

    /// Project directory. Passed as `--cwd` and used as the working directory.
    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Append an extra argument.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Replace the transport configuration.
    pub fn config(mut self, config: TransportConfig) -> Self {
        self.config = config;
        self
    }

    /// Spawn the sidecar. Must be called from within a tokio runtime.
    pub fn spawn(self) -> Result<SidecarClient> {
        let mut command = Command::new(&self.program);
        command.arg(TRANSPILE_SERVER_FLAG);
        if let Some(dir) = &self.cwd {
            command.arg("--cwd").arg(dir).current_dir(dir);
        }
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        debug!(pid = child.id(), program = ?self.program, "sidecar spawned");

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| LintwireError::terminated("sidecar stdin was not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LintwireError::terminated("sidecar stdout was not captured"))?;

        let capacity = self.config.channel_capacity.max(1);
        let (outbound, outbound_rx) = mpsc::channel(capacity);
        let (events, inbound) = mpsc::channel(capacity);
        let writer = spawn_writer(outbound_rx, stdin, encode_tagged, events.clone());
        let reader = spawn_reader(
            stdout,
            FrameBuffer::new(TagLength::new(self.config.max_frame_size)),
            self.config.read_buffer_size,
            events,
        );

        let process = SidecarProcess {
            child,
            writer,
            reader,
        };
        Ok(SidecarClient::start(outbound, inbound, Some(process)))
    }
}

type Reply = oneshot::Sender<Result<Bytes>>;

enum SidecarCommand {
    /// Next reply belongs to this caller.
    Enqueue { method: String, tx: Reply },
    Close { done: oneshot::Sender<()> },
}

/// Handle to a running sidecar.
pub struct SidecarClient {
    /// Held while enqueuing and writing so queue order matches write order.
    outbound: Mutex<mpsc::Sender<TaggedMessage>>,
    commands: mpsc::UnboundedSender<SidecarCommand>,
    alive: Arc<AtomicBool>,
}

impl SidecarClient {
    fn start(
        outbound: mpsc::Sender<TaggedMessage>,
        inbound: mpsc::Receiver<Inbound<TaggedMessage>>,
        process: Option<SidecarProcess>,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let alive = Arc::new(AtomicBool::new(true));
        let session = SidecarSession {
            waiting: VecDeque::new(),
            process,
            alive: alive.clone(),
        };
        tokio::spawn(session.run(command_rx, inbound));

        Self {
            outbound: Mutex::new(outbound),
            commands,
            alive,
        }
    }

    /// Send a raw request and wait for its reply payload.
    ///
    /// # Errors
    ///
    /// [`LintwireError::Sidecar`] for an error reply, a transport failure if
    /// the sidecar died or sent a malformed frame.
    pub async fn call(&self, method: &str, payload: impl Into<Bytes>) -> Result<Bytes> {
        if !self.is_alive() {
            return Err(LintwireError::terminated("sidecar is closed"));
        }

        let (tx, rx) = oneshot::channel();
        {
            let outbound = self.outbound.lock().await;
            // Enqueue and write happen together or not at all, even if this
            // future is dropped while waiting for room.
            let permit = outbound
                .reserve()
                .await
                .map_err(|_| LintwireError::terminated("sidecar stdin is closed"))?;
            self.commands
                .send(SidecarCommand::Enqueue {
                    method: method.to_string(),
                    tx,
                })
                .map_err(|_| LintwireError::terminated("sidecar session has ended"))?;
            permit.send(TaggedMessage::request(method, payload));
        }

        rx.await
            .map_err(|_| LintwireError::terminated("sidecar session has ended"))?
    }

    /// Send a JSON request and decode the JSON reply.
    pub async fn call_json<Req, Resp>(&self, method: &str, request: &Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let payload = JsonCodec::encode(request)?;
        let reply = self.call(method, payload).await?;
        JsonCodec::decode(&reply)
    }

    /// Transpile one file.
    pub async fn transpile(&self, request: &TranspileRequest) -> Result<TranspileResponse> {
        self.call_json(TRANSPILE_METHOD, request).await
    }

    /// Stop the sidecar. Waiting calls are rejected.
    pub async fn close(&self) {
        let (done, wait) = oneshot::channel();
        if self.commands.send(SidecarCommand::Close { done }).is_ok() {
            let _ = wait.await;
        }
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

struct SidecarProcess {
    child: Child,
    writer: JoinHandle<Result<()>>,
    reader: JoinHandle<()>,
}

impl SidecarProcess {
    async fn stop(mut self) {
        self.writer.abort();
        let _ = self.writer.await;
        self.reader.abort();
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.start_kill();
        }
        match self.child.wait().await {
            Ok(status) => debug!(%status, "sidecar stopped"),
            Err(e) => debug!("waiting for sidecar failed: {}", e),
        }
    }
}

struct SidecarSession {
    /// Callers in request order.
    waiting: VecDeque<(String, Reply)>,
    process: Option<SidecarProcess>,
    alive: Arc<AtomicBool>,
}

impl SidecarSession {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SidecarCommand>,
        mut inbound: mpsc::Receiver<Inbound<TaggedMessage>>,
    ) {
        let mut inbound_open = true;

        loop {
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(SidecarCommand::Enqueue { method, tx }) => {
                        if self.alive.load(Ordering::Acquire) {
                            self.waiting.push_back((method, tx));
                        } else {
                            let _ = tx.send(Err(LintwireError::terminated("sidecar is closed")));
                        }
                    }
                    Some(SidecarCommand::Close { done }) => {
                        self.shutdown(LintwireError::terminated("sidecar closed")).await;
                        inbound_open = false;
                        let _ = done.send(());
                    }
                    None => {
                        self.shutdown(LintwireError::terminated("sidecar client dropped")).await;
                        return;
                    }
                },

                event = inbound.recv(), if inbound_open => match event {
                    Some(Inbound::Message(reply)) => {
                        if let Err(e) = self.on_reply(reply) {
                            error!("sidecar protocol violation: {}", e);
                            self.shutdown(e).await;
                            inbound_open = false;
                        }
                    }
                    Some(Inbound::Closed) | None => {
                        self.shutdown(LintwireError::terminated("sidecar exited")).await;
                        inbound_open = false;
                    }
                    Some(Inbound::Failed(e)) => {
                        error!("sidecar stream failed: {}", e);
                        self.shutdown(e).await;
                        inbound_open = false;
                    }
                },
            }
        }
    }

    fn on_reply(&mut self, reply: TaggedMessage) -> Result<()> {
        let outcome = if reply.is_response() {
            Ok(reply.payload)
        } else if reply.is_error() {
            Err(LintwireError::Sidecar {
                method: reply.method.clone(),
                message: String::from_utf8_lossy(&reply.payload).into_owned(),
            })
        } else {
            return Err(LintwireError::Protocol(format!(
                "unexpected sidecar message type {}",
                reply.message_type
            )));
        };

        let Some((method, tx)) = self.waiting.pop_front() else {
            warn!(method = %reply.method, "dropping sidecar reply with no waiting request");
            return Ok(());
        };
        if method != reply.method {
            warn!(expected = %method, got = %reply.method, "sidecar reply names another method");
        }
        let _ = tx.send(outcome);
        Ok(())
    }

    async fn shutdown(&mut self, reason: LintwireError) {
        self.alive.store(false, Ordering::Release);
        for (_, tx) in self.waiting.drain(..) {
            let _ = tx.send(Err(reason.replicate()));
        }
        if let Some(process) = self.process.take() {
            process.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message_type;
    use serde_json::{json, Value};
    use std::time::Duration;

    #[test]
    fn test_transpile_request_omits_defaults() {
        let request = TranspileRequest::new("/p/index.ts").module("commonjs");
        let value: Value = JsonCodec::to_value(&request).unwrap();
        assert_eq!(value, json!({ "fileName": "/p/index.ts", "module": "commonjs" }));
    }

    #[test]
    fn test_transpile_request_all_fields() {
        let request = TranspileRequest::new("a.tsx")
            .config_file("tsconfig.json")
            .target("es2020")
            .jsx("react-jsx")
            .inline_source_map(true)
            .source_map(true)
            .typecheck(true);
        let value: Value = JsonCodec::to_value(&request).unwrap();
        assert_eq!(value["configFileName"], "tsconfig.json");
        assert_eq!(value["jsx"], "react-jsx");
        assert_eq!(value["inlineSourceMap"], true);
        assert_eq!(value["sourceMap"], true);
        assert_eq!(value["typecheck"], true);
    }

    #[test]
    fn test_transpile_response_defaults() {
        let response: TranspileResponse = JsonCodec::decode(br#"{"hasError":true}"#).unwrap();
        assert!(response.has_error);
        assert!(response.output_text.is_empty());

        let response: TranspileResponse =
            JsonCodec::decode(br#"{"outputText":"var a = 1;\n","hasError":false}"#).unwrap();
        assert_eq!(response.output_text, "var a = 1;\n");
    }

    fn session() -> (SidecarSession, Arc<AtomicBool>) {
        let alive = Arc::new(AtomicBool::new(true));
        let session = SidecarSession {
            waiting: VecDeque::new(),
            process: None,
            alive: alive.clone(),
        };
        (session, alive)
    }

    #[tokio::test]
    async fn test_replies_resolve_in_fifo_order() {
        let (mut session, _) = session();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        session.waiting.push_back(("transpile".into(), tx1));
        session.waiting.push_back(("transpile".into(), tx2));

        session
            .on_reply(TaggedMessage::new(4, "transpile", &b"first"[..]))
            .unwrap();
        session
            .on_reply(TaggedMessage::new(5, "transpile", &b"fileName is required"[..]))
            .unwrap();

        assert_eq!(&rx1.await.unwrap().unwrap()[..], b"first");
        match rx2.await.unwrap() {
            Err(LintwireError::Sidecar { method, message }) => {
                assert_eq!(method, "transpile");
                assert_eq!(message, "fileName is required");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unexpected_type_is_violation() {
        let (mut session, alive) = session();
        let (tx, rx) = oneshot::channel();
        session.waiting.push_back(("transpile".into(), tx));

        let err = session
            .on_reply(TaggedMessage::new(1, "transpile", Bytes::new()))
            .unwrap_err();
        session.shutdown(err).await;

        assert!(!alive.load(Ordering::Acquire));
        assert!(matches!(rx.await.unwrap(), Err(LintwireError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_abandoned_call_keeps_queue_aligned() {
        let (outbound, mut requests) = mpsc::channel(1);
        let (events, inbound) = mpsc::channel(8);
        let filler = outbound.clone();
        let client = SidecarClient::start(outbound, inbound, None);

        // Fill the link so the next call waits for room.
        filler
            .send(TaggedMessage::request("echo", "filler"))
            .await
            .unwrap();
        let abandoned =
            tokio::time::timeout(Duration::from_millis(20), client.call("echo", "second")).await;
        assert!(abandoned.is_err());
        assert_eq!(&requests.recv().await.unwrap().payload[..], b"filler");

        let engine = async {
            let request = requests.recv().await.unwrap();
            assert_eq!(&request.payload[..], b"third");
            events
                .send(Inbound::Message(TaggedMessage::new(
                    message_type::RESPONSE,
                    "echo",
                    request.payload,
                )))
                .await
                .unwrap();
        };
        let (reply, ()) = tokio::time::timeout(
            Duration::from_secs(1),
            async { tokio::join!(client.call("echo", "third"), engine) },
        )
        .await
        .expect("reply went to the abandoned call");
        assert_eq!(reply.unwrap(), Bytes::from("third"));

        client.close().await;
    }

    #[test]
    fn test_stray_reply_is_dropped() {
        let (mut session, _) = session();
        assert!(session
            .on_reply(TaggedMessage::new(4, "transpile", Bytes::new()))
            .is_ok());
    }
}

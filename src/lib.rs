//! # lintwire
//!
//! Protocol and transport layer between a lint host and an out-of-process
//! lint engine.
//!
//! ## Wire formats
//!
//! - **Format A**: `u32` LE length + JSON `{id, kind, data}`, used by the
//!   subprocess and bridge transports
//! - **Format B**: msgpack tag-length envelope, used by the transpile sidecar
//! - **Compact source buffer**: fixed-layout compiler data, see [`compact`]
//!
//! ## Transports
//!
//! Every [`Transport`] pipelines requests, correlates replies by id and
//! rejects everything still pending when the engine goes away:
//!
//! - [`SubprocessBuilder`] - engine child process over stdin/stdout
//! - [`channel_pair`] - in-process worker, whole messages
//! - [`BridgeBuilder`] - sandboxed engine behind a descriptor shim
//!
//! ## Example
//!
//! ```ignore
//! use lintwire::SubprocessBuilder;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> lintwire::Result<()> {
//!     let engine = SubprocessBuilder::new("rslint").api_mode().spawn()?;
//!     engine.handshake().await?;
//!
//!     let report = engine
//!         .request("lint", json!({ "files": ["src/index.ts"] }))
//!         .await?;
//!     println!("{}", report);
//!
//!     engine.exit().await
//! }
//! ```

pub mod codec;
pub mod compact;
pub mod correlator;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod service;
pub mod sidecar;
pub mod transport;

pub use codec::JsonCodec;
pub use compact::{decode_source_text, encoded_source_files, CompactSourceFile};
pub use error::{LintwireError, Result};
pub use handler::RequestContext;
pub use protocol::{Message, TaggedMessage};
pub use service::{Service, ServiceBuilder};
pub use sidecar::{SidecarBuilder, SidecarClient, TranspileRequest, TranspileResponse};
pub use transport::{
    channel_pair, BridgeBuilder, PendingRequest, SubprocessBuilder, Transport, TransportConfig,
    VirtualFs, WorkerEndpoint,
};

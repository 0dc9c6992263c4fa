//! Runtime control over a Unix socket
//!
//! A client writes one framed [`IpcCommand`] and reads one framed
//! [`IpcResponse`]. A frame is a big-endian `u32` length and then that many
//! bytes of JSON. The server keeps a connection open across commands until
//! the peer hangs up, a `shutdown` command is answered, or a frame exceeds
//! `ipc.max_message_size`.
//!
//! # Example
//!
//! ```no_run
//! use iface_router::ipc::{IpcClient, IpcCommand, IpcResponse};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = IpcClient::new("/var/run/iface-router.sock");
//!
//! let response = client
//!     .send(IpcCommand::TestMatch { ip: Some("10.1.2.3".into()), hostname: None })
//!     .await?;
//! if let IpcResponse::TestMatchResult(result) = response {
//!     println!("interface: {:?}", result.interface);
//! }
//! # Ok(())
//! # }
//! ```

mod handler;
mod protocol;
mod server;

pub use handler::IpcHandler;
pub use protocol::{
    decode_message, encode_message, ErrorCode, ErrorReply, IpcCommand, IpcResponse, RulesLoaded,
    ServerStatus, TestMatchResult, LENGTH_PREFIX_SIZE, MAX_MESSAGE_SIZE,
};
pub use server::{IpcClient, IpcServer};

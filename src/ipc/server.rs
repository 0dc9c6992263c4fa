//! Unix control socket: accept loop, per-connection request loop and client.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::handler::IpcHandler;
use super::protocol::{
    decode_message, read_frame, write_frame, ErrorCode, Frame, IpcCommand, IpcResponse,
    MAX_MESSAGE_SIZE,
};
use crate::config::IpcConfig;
use crate::error::IpcError;

pub struct IpcServer {
    config: IpcConfig,
    handler: Arc<IpcHandler>,
    stop: broadcast::Sender<()>,
}

impl IpcServer {
    pub fn new(config: IpcConfig, handler: Arc<IpcHandler>) -> Self {
        Self {
            config,
            handler,
            stop: broadcast::channel(1).0,
        }
    }

    /// Serves connections until [`shutdown`](Self::shutdown), then removes the
    /// socket file. Returns at once when IPC is disabled.
    ///
    /// # Errors
    ///
    /// `IpcError::BindError` when the socket path cannot be prepared.
    pub async fn run(&self) -> Result<(), IpcError> {
        if !self.config.enabled {
            info!("control socket disabled");
            return Ok(());
        }

        let mut stop = self.stop.subscribe();
        let path = &self.config.socket_path;
        let listener = bind_socket(path, self.config.socket_mode)?;
        info!(path = %path.display(), "control socket listening");

        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = stop.recv() => break,
            };
            match accepted {
                Ok((stream, _)) => {
                    let handler = Arc::clone(&self.handler);
                    let limit = self.config.max_message_size;
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, &handler, limit).await {
                            debug!(error = %e, "control connection ended with error");
                        }
                    });
                }
                Err(e) => error!(error = %e, "control socket accept failed"),
            }
        }

        info!("control socket closed");
        if path.exists() {
            let _ = std::fs::remove_file(path);
        }
        Ok(())
    }

    pub fn shutdown_sender(&self) -> broadcast::Sender<()> {
        self.stop.clone()
    }

    pub fn shutdown(&self) {
        let _ = self.stop.send(());
    }
}

fn bind_socket(path: &Path, mode: u32) -> Result<UnixListener, IpcError> {
    use std::os::unix::fs::PermissionsExt;

    let fail = |what: &str, e: std::io::Error| IpcError::BindError {
        path: path.display().to_string(),
        reason: format!("{what}: {e}"),
    };

    if path.exists() {
        std::fs::remove_file(path).map_err(|e| fail("removing stale socket", e))?;
    }
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|e| fail("creating socket directory", e))?;
    }
    let listener = UnixListener::bind(path).map_err(|e| fail("bind", e))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|e| fail("chmod", e))?;
    Ok(listener)
}

/// Answers requests on one connection until the peer hangs up.
async fn serve_connection(
    mut stream: UnixStream,
    handler: &IpcHandler,
    limit: usize,
) -> Result<(), IpcError> {
    loop {
        let body = match read_frame(&mut stream, limit).await? {
            Frame::Body(body) => body,
            Frame::Closed => return Ok(()),
            Frame::TooLarge(len) => {
                // The unread body leaves the stream out of sync
                warn!(len, limit, "control message over size limit");
                let reply = IpcResponse::error(
                    ErrorCode::InvalidParameters,
                    format!("message of {len} bytes exceeds limit of {limit}"),
                );
                write_frame(&mut stream, &reply).await?;
                return Err(IpcError::protocol(format!("{len}-byte frame refused")));
            }
        };

        let command: IpcCommand = match decode_message(&body) {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, "undecodable control command");
                let reply = IpcResponse::error(ErrorCode::InvalidCommand, e.to_string());
                write_frame(&mut stream, &reply).await?;
                continue;
            }
        };

        let closing = matches!(command, IpcCommand::Shutdown);
        let reply = handler.handle(command).await;
        write_frame(&mut stream, &reply).await?;
        if closing {
            return Ok(());
        }
    }
}

/// One-request-per-connection client for the control socket
pub struct IpcClient {
    socket_path: PathBuf,
}

impl IpcClient {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    /// # Errors
    ///
    /// Connection, framing or decoding failures.
    pub async fn send(&self, command: IpcCommand) -> Result<IpcResponse, IpcError> {
        let mut stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            IpcError::ConnectionError(format!("{}: {e}", self.socket_path.display()))
        })?;
        write_frame(&mut stream, &command).await?;

        match read_frame(&mut stream, MAX_MESSAGE_SIZE).await? {
            Frame::Body(body) => {
                decode_message(&body).map_err(|e| IpcError::protocol(e.to_string()))
            }
            Frame::Closed => Err(IpcError::protocol("server closed without replying")),
            Frame::TooLarge(len) => Err(IpcError::protocol(format!("{len}-byte reply refused"))),
        }
    }

    /// # Errors
    ///
    /// The server cannot be reached.
    pub async fn ping(&self) -> Result<bool, IpcError> {
        Ok(matches!(self.send(IpcCommand::Ping).await?, IpcResponse::Pong))
    }
}

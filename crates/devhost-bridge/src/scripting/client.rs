//! TCP client for the scripting service.
//!
//! Each [`ScriptingClient`] is a clonable handle to one TCP connection. A
//! background task owns the socket: it writes requests handed over the
//! command channel and routes replies back to callers through the
//! [`RequestTracker`]. Dropping every handle closes the channel and ends the
//! task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use devhost_core::prelude::*;
use devhost_core::ScriptSessionId;

use super::protocol::{Handshake, HandshakeResponse, RequestTracker, RpcRequest, RpcResponse};
use super::{RpcConnection, ScriptingConnector};

const CMD_CHANNEL_CAPACITY: usize = 32;

/// How often abandoned requests are swept from the tracker
const ABANDONED_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Longest slice of a malformed reply echoed to the log
const MALFORMED_PREVIEW_BYTES: usize = 120;

/// Default bound for connect plus handshake
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bound for a single RPC round trip
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(60);

enum ClientCommand {
    Call {
        method: String,
        params: Vec<Value>,
        response_tx: oneshot::Sender<Result<Value>>,
    },
    Close,
}

/// Handle to one scripting-service connection
#[derive(Clone)]
pub struct ScriptingClient {
    cmd_tx: mpsc::Sender<ClientCommand>,
    session_id: ScriptSessionId,
    host_port: u16,
    rpc_timeout: Duration,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for ScriptingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptingClient")
            .field("session_id", &self.session_id)
            .field("host_port", &self.host_port)
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl ScriptingClient {
    /// Connect to `127.0.0.1:host_port` and perform `handshake`
    pub async fn connect(
        host_port: u16,
        handshake: Handshake,
        connect_timeout: Duration,
        rpc_timeout: Duration,
    ) -> Result<Self> {
        let (stream, session_id) = timeout(connect_timeout, open(host_port, handshake))
            .await
            .map_err(|_| Error::ConnectTimeout { port: host_port })??;

        debug!(
            "scripting connection on port {} bound to session {}",
            host_port, session_id
        );

        let (cmd_tx, cmd_rx) = mpsc::channel(CMD_CHANNEL_CAPACITY);
        let closed = Arc::new(AtomicBool::new(false));
        tokio::spawn(run_client_task(stream, cmd_rx, Arc::clone(&closed)));

        Ok(Self {
            cmd_tx,
            session_id,
            host_port,
            rpc_timeout,
            closed,
        })
    }

    pub fn host_port(&self) -> u16 {
        self.host_port
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn request(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        let (response_tx, response_rx) = oneshot::channel();
        self.cmd_tx
            .send(ClientCommand::Call {
                method: method.to_string(),
                params,
                response_tx,
            })
            .await
            .map_err(|_| Error::ChannelClosed)?;

        match timeout(self.rpc_timeout, response_rx).await {
            Ok(reply) => reply.map_err(|_| Error::ChannelClosed)?,
            Err(_) => Err(Error::rpc(
                method,
                format!("no reply within {:?}", self.rpc_timeout),
            )),
        }
    }
}

impl RpcConnection for ScriptingClient {
    fn session_id(&self) -> ScriptSessionId {
        self.session_id
    }

    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        self.request(method, params).await
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // The task may already be gone
        let _ = self.cmd_tx.send(ClientCommand::Close).await;
    }
}

/// Connects [`ScriptingClient`]s over real TCP
#[derive(Debug, Clone)]
pub struct TcpConnector {
    pub connect_timeout: Duration,
    pub rpc_timeout: Duration,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
        }
    }
}

impl ScriptingConnector for TcpConnector {
    type Connection = ScriptingClient;

    async fn connect(&self, host_port: u16, handshake: Handshake) -> Result<ScriptingClient> {
        ScriptingClient::connect(host_port, handshake, self.connect_timeout, self.rpc_timeout).await
    }
}

/// Open the socket and run the handshake
async fn open(host_port: u16, handshake: Handshake) -> Result<(TcpStream, ScriptSessionId)> {
    let mut stream = TcpStream::connect(("127.0.0.1", host_port)).await?;

    let mut line = serde_json::to_string(&handshake.to_request())?;
    line.push('\n');
    stream.write_all(line.as_bytes()).await?;

    let mut reader = BufReader::new(&mut stream);
    let mut reply = String::new();
    if reader.read_line(&mut reply).await? == 0 {
        return Err(Error::protocol("connection closed during handshake"));
    }

    let response: HandshakeResponse = serde_json::from_str(reply.trim())
        .map_err(|e| Error::protocol(format!("invalid handshake reply {:?}: {e}", reply.trim())))?;
    let session_id = response.session_id(handshake)?;
    Ok((stream, session_id))
}

/// Background task: owns the socket for the lifetime of the connection
async fn run_client_task(
    stream: TcpStream,
    mut cmd_rx: mpsc::Receiver<ClientCommand>,
    closed: Arc<AtomicBool>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let mut tracker = RequestTracker::new();
    let mut sweep = tokio::time::interval(ABANDONED_SWEEP_INTERVAL);
    sweep.tick().await;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => handle_line(&line, &mut tracker),
                    Ok(None) => {
                        debug!("scripting connection closed by device");
                        break;
                    }
                    Err(e) => {
                        warn!("scripting connection read error: {}", e);
                        break;
                    }
                }
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(ClientCommand::Call { method, params, response_tx }) => {
                        send_request(&method, &params, response_tx, &mut tracker, &mut write_half).await;
                    }
                    Some(ClientCommand::Close) | None => {
                        let _ = write_half.shutdown().await;
                        break;
                    }
                }
            }
            _ = sweep.tick() => {
                let abandoned = tracker.cleanup_abandoned();
                if !abandoned.is_empty() {
                    debug!(
                        "dropped {} abandoned scripting request(s): {:?}",
                        abandoned.len(),
                        abandoned
                    );
                }
            }
        }
    }

    closed.store(true, Ordering::Release);
    tracker.fail_all("connection closed");
    trace!("scripting client task exiting");
}

fn handle_line(line: &str, tracker: &mut RequestTracker) {
    match serde_json::from_str::<RpcResponse>(line) {
        Ok(response) => {
            let id = response.id;
            if !tracker.complete(response) {
                debug!("scripting reply for unknown request id {:?}", id);
            }
        }
        Err(e) => {
            debug!(
                "ignoring malformed scripting reply ({}): {}",
                e,
                preview(line)
            );
        }
    }
}

/// Prefix of `line` no longer than [`MALFORMED_PREVIEW_BYTES`], cut on a
/// char boundary
fn preview(line: &str) -> &str {
    if line.len() <= MALFORMED_PREVIEW_BYTES {
        return line;
    }
    let mut end = MALFORMED_PREVIEW_BYTES;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    &line[..end]
}

async fn send_request(
    method: &str,
    params: &[Value],
    response_tx: oneshot::Sender<Result<Value>>,
    tracker: &mut RequestTracker,
    write_half: &mut OwnedWriteHalf,
) {
    tracker.cleanup_abandoned();
    // Register before writing so a fast reply finds its slot
    let id = tracker.register(method, response_tx);
    let request = RpcRequest { id, method, params };

    let mut json = match serde_json::to_string(&request) {
        Ok(json) => json,
        Err(e) => {
            warn!("failed to serialize {} request: {}", method, e);
            tracker.fail_request(id, "request could not be serialized");
            return;
        }
    };
    json.push('\n');

    if let Err(e) = write_half.write_all(json.as_bytes()).await {
        warn!("failed to send {} request: {}", method, e);
        tracker.fail_request(id, "write failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tracing_subscriber::util::SubscriberInitExt;
    use tokio::net::TcpListener;

    /// Minimal in-process scripting service: answers handshakes with `uid`
    /// and echoes the method name of every request as its result.
    async fn spawn_service(uid: i64) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (read, mut write) = socket.into_split();
                    let mut lines = BufReader::new(read).lines();

                    let Ok(Some(_handshake)) = lines.next_line().await else {
                        return;
                    };
                    let reply = format!("{}\n", json!({"status": true, "uid": uid}));
                    write.write_all(reply.as_bytes()).await.unwrap();

                    while let Ok(Some(line)) = lines.next_line().await {
                        let req: Value = serde_json::from_str(&line).unwrap();
                        if req["method"] == "hang" {
                            continue;
                        }
                        if req["method"] == "garble" {
                            let junk = format!("{}éé\n", "a".repeat(119));
                            write.write_all(junk.as_bytes()).await.unwrap();
                        }
                        let reply = if req["method"] == "fail" {
                            json!({"id": req["id"], "result": null, "error": "boom"})
                        } else {
                            json!({"id": req["id"], "result": req["method"], "error": null})
                        };
                        write
                            .write_all(format!("{reply}\n").as_bytes())
                            .await
                            .unwrap();
                    }
                });
            }
        });

        port
    }

    #[tokio::test]
    async fn test_connect_and_call() {
        let port = spawn_service(5).await;
        let client = TcpConnector::default()
            .connect(port, Handshake::Initiate)
            .await
            .unwrap();

        assert_eq!(client.session_id(), 5);
        assert_eq!(client.call("getBuild", vec![]).await.unwrap(), json!("getBuild"));

        let err = client.call("fail", vec![json!(1)]).await.unwrap_err();
        assert!(matches!(err, Error::Rpc { .. }));

        client.close().await;
        client.close().await;
    }

    #[test]
    fn test_preview_cuts_on_char_boundary() {
        let line = format!("{}éé", "a".repeat(119));
        let cut = preview(&line);
        assert_eq!(cut.len(), 119);
        assert!(cut.chars().all(|c| c == 'a'));
        assert_eq!(preview("short"), "short");
    }

    #[tokio::test]
    async fn test_malformed_multibyte_reply_keeps_connection() {
        let _guard = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .set_default();

        let port = spawn_service(5).await;
        let client = TcpConnector::default()
            .connect(port, Handshake::Initiate)
            .await
            .unwrap();

        assert_eq!(client.call("garble", vec![]).await.unwrap(), json!("garble"));
        assert_eq!(client.call("getBuild", vec![]).await.unwrap(), json!("getBuild"));
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn test_timed_out_call_does_not_block_later_calls() {
        let port = spawn_service(5).await;
        let connector = TcpConnector {
            rpc_timeout: Duration::from_millis(100),
            ..TcpConnector::default()
        };
        let client = connector.connect(port, Handshake::Initiate).await.unwrap();

        let err = client.call("hang", vec![]).await.unwrap_err();
        assert!(matches!(err, Error::Rpc { ref method, .. } if method == "hang"));
        assert_eq!(client.call("getBuild", vec![]).await.unwrap(), json!("getBuild"));
    }

    #[tokio::test]
    async fn test_continue_handshake_must_match_session() {
        let port = spawn_service(5).await;
        let connector = TcpConnector::default();

        assert!(connector.connect(port, Handshake::Continue(5)).await.is_ok());
        let err = connector
            .connect(port, Handshake::Continue(6))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nothing listens on
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let result = TcpConnector::default()
            .connect(port, Handshake::Initiate)
            .await;
        assert!(matches!(result, Err(Error::Io(_))));
    }
}

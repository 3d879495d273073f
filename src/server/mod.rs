//! Fan-out Unix socket server.
//!
//! Clients handshake with a JSON frame naming themselves, picking an
//! event-class subscription and an output format; after that the server
//! pushes formatted metadata frames at them and accepts the single
//! `disconnect` command. A broken client is removed without disturbing
//! the rest.

pub mod client;
pub mod frame;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use once_cell::sync::OnceCell;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::net::{UnixListener, UnixStream, unix::OwnedReadHalf};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::events::EventClass;
use crate::metadata::Metadata;
use crate::mpris::listener::BusListener;
use client::{ClientConn, FormatSpec};
use frame::{recv_frame, send_frame};

pub use frame::TransportError;

const REQUIRED_PARAMS: [&str; 4] = ["name", "interval", "format_type", "format"];
const ALLOWED_PARAMS: [&str; 4] = ["name", "interval", "format_type", "format"];

const SHUTDOWN_WARNING: &str = "Server is shutting down";

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake is not valid JSON: {0}")]
    BadJson(String),
    #[error("{0:?} not found in params")]
    MissingParams(Vec<String>),
    #[error("Invalid Interval: {0}")]
    InvalidInterval(String),
    #[error("{0}")]
    BadFormat(String),
}

struct Handshake {
    name: String,
    interval: EventClass,
    format: FormatSpec,
    ignored: Vec<String>,
}

#[derive(Default)]
struct ServerState {
    clients: HashMap<String, ClientConn>,
    // Registration-ordered subscriber names per event class; broadcast
    // walks these lists.
    intervals: HashMap<EventClass, Vec<String>>,
}

pub struct SocketServer {
    socket_path: PathBuf,
    state: Mutex<ServerState>,
    metadata_source: OnceCell<Weak<BusListener>>,
    accept_task: StdMutex<Option<JoinHandle<()>>>,
}

impl SocketServer {
    /// Prepare the server, removing a stale socket file if one is left
    /// over from a previous run.
    pub fn new(socket_path: &Path) -> std::io::Result<Arc<Self>> {
        if socket_path.exists() {
            std::fs::remove_file(socket_path)?;
        }
        Ok(Arc::new(Self {
            socket_path: socket_path.to_path_buf(),
            state: Mutex::new(ServerState::default()),
            metadata_source: OnceCell::new(),
            accept_task: StdMutex::new(None),
        }))
    }

    /// Wire up the listener used to answer the post-handshake one-shot
    /// frame with the current active-player metadata.
    pub fn attach_metadata_source(&self, listener: &Arc<BusListener>) {
        let _ = self.metadata_source.set(Arc::downgrade(listener));
    }

    /// Bind the socket and start accepting clients.
    pub async fn start(self: &Arc<Self>) -> std::io::Result<()> {
        let unix_listener = UnixListener::bind(&self.socket_path)?;
        info!(path = %self.socket_path.display(), "socket server starting up");
        let server = Arc::clone(self);
        let task = tokio::spawn(async move {
            loop {
                match unix_listener.accept().await {
                    Ok((stream, _)) => {
                        let server = Arc::clone(&server);
                        tokio::spawn(async move {
                            server.setup_client(stream).await;
                        });
                    }
                    Err(err) => {
                        warn!(error = %err, "failed to accept client");
                    }
                }
            }
        });
        *self
            .accept_task
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(task);
        Ok(())
    }

    async fn active_metadata_snapshot(&self) -> Metadata {
        if let Some(weak) = self.metadata_source.get()
            && let Some(listener) = weak.upgrade()
        {
            listener.active_metadata().await
        } else {
            Metadata::new()
        }
    }

    async fn setup_client(self: Arc<Self>, stream: UnixStream) {
        let (mut reader, mut writer) = stream.into_split();
        let first = match recv_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) | Err(_) => {
                warn!("client connected but sent no data, closing connection");
                return;
            }
        };

        let handshake = match parse_handshake(&first) {
            Ok(handshake) => handshake,
            Err(err) => {
                warn!(error = %err, "client connection rejected");
                let reply = json!({ "Error": err.to_string() }).to_string();
                let _ = send_frame(&mut writer, reply.as_bytes()).await;
                return;
            }
        };

        if !handshake.ignored.is_empty() {
            let reply =
                json!({ "Warning": format!("{:?} will be ignored", handshake.ignored) })
                    .to_string();
            if send_frame(&mut writer, reply.as_bytes()).await.is_err() {
                return;
            }
        }

        let Handshake {
            name,
            interval,
            format,
            ..
        } = handshake;

        let metadata = self.active_metadata_snapshot().await;
        let mut state = self.state.lock().await;
        // A reconnect under the same name supersedes the old entry.
        Self::remove_client_locked(&mut state, &name);
        let mut conn = ClientConn {
            interval,
            format,
            writer,
        };
        let first_frame = conn.format.fill(&metadata);
        if let Err(err) = send_frame(&mut conn.writer, first_frame.as_bytes()).await {
            warn!(client = name.as_str(), error = %err, "initial frame failed");
            return;
        }
        state.clients.insert(name.clone(), conn);
        state.intervals.entry(interval).or_default().push(name.clone());
        info!(
            client = name.as_str(),
            interval = interval.as_str(),
            "client connected"
        );
        drop(state);

        let server = Arc::clone(&self);
        tokio::spawn(async move {
            server.listen_for_commands(name, reader).await;
        });
    }

    /// Per-client command loop: reads frames until EOF or `disconnect`.
    async fn listen_for_commands(&self, name: String, mut reader: OwnedReadHalf) {
        loop {
            match recv_frame(&mut reader).await {
                Ok(None) => {
                    info!(client = name.as_str(), "connection closed");
                    self.remove_client(&name).await;
                    break;
                }
                Ok(Some(data)) => {
                    let command = String::from_utf8_lossy(&data).trim().to_string();
                    if command == "disconnect" {
                        info!(client = name.as_str(), "disconnect requested");
                        self.remove_client(&name).await;
                        break;
                    }
                    warn!(
                        client = name.as_str(),
                        command = command.as_str(),
                        "unknown command, ignoring"
                    );
                }
                Err(err) => {
                    warn!(client = name.as_str(), error = %err, "client read failed, removing");
                    self.remove_client(&name).await;
                    break;
                }
            }
        }
    }

    /// Fan a metadata frame out to every subscriber of `interval`.
    ///
    /// The subscriber list is snapshotted first, so clients arriving
    /// mid-broadcast do not receive it. A failed send removes the
    /// offending client and the broadcast continues.
    pub async fn send_metadata(&self, interval: EventClass, metadata: &Metadata) {
        debug!(interval = interval.as_str(), "metadata send requested");
        let mut state = self.state.lock().await;
        let Some(names) = state.intervals.get(&interval).cloned() else {
            return;
        };
        for name in names {
            let Some(conn) = state.clients.get_mut(&name) else {
                continue;
            };
            let payload = conn.format.fill(metadata);
            if let Err(err) = send_frame(&mut conn.writer, payload.as_bytes()).await {
                warn!(client = name.as_str(), error = %err, "client disconnected during send, removing");
                Self::remove_client_locked(&mut state, &name);
            }
        }
    }

    async fn remove_client(&self, name: &str) {
        let mut state = self.state.lock().await;
        Self::remove_client_locked(&mut state, name);
    }

    fn remove_client_locked(state: &mut ServerState, name: &str) {
        if let Some(conn) = state.clients.remove(name) {
            if let Some(list) = state.intervals.get_mut(&conn.interval) {
                list.retain(|n| n != name);
            }
            // Dropping the writer closes the connection; the client's
            // command loop sees EOF and exits.
        }
    }

    /// Warn every client, drop all connections, stop accepting, and
    /// remove the socket file.
    pub async fn stop(&self) {
        info!("socket server shutting down");
        let warning = json!({ "Warning": SHUTDOWN_WARNING }).to_string();
        let mut state = self.state.lock().await;
        for (name, conn) in state.clients.iter_mut() {
            if let Err(err) = send_frame(&mut conn.writer, warning.as_bytes()).await {
                debug!(client = name.as_str(), error = %err, "shutdown warning not delivered");
            }
        }
        state.clients.clear();
        state.intervals.clear();
        drop(state);
        if let Some(task) = self
            .accept_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
    }
}

fn parse_handshake(frame: &[u8]) -> Result<Handshake, HandshakeError> {
    let value: Value =
        serde_json::from_slice(frame).map_err(|err| HandshakeError::BadJson(err.to_string()))?;
    let Value::Object(map) = value else {
        return Err(HandshakeError::BadJson("expected a JSON object".to_string()));
    };

    let missing: Vec<String> = REQUIRED_PARAMS
        .iter()
        .filter(|key| !map.contains_key(**key))
        .map(|key| key.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(HandshakeError::MissingParams(missing));
    }

    let interval_text = map["interval"].as_str().unwrap_or_default();
    let Some(interval) = EventClass::parse(interval_text) else {
        return Err(HandshakeError::InvalidInterval(interval_text.to_string()));
    };

    let Some(name) = map["name"].as_str() else {
        return Err(HandshakeError::BadFormat("'name' must be a string".to_string()));
    };

    let format_type = map["format_type"].as_str().unwrap_or_default();
    let format =
        FormatSpec::compile(format_type, &map["format"]).map_err(HandshakeError::BadFormat)?;

    let ignored = map
        .keys()
        .filter(|key| !ALLOWED_PARAMS.contains(&key.as_str()))
        .cloned()
        .collect();

    Ok(Handshake {
        name: name.to_string(),
        interval,
        format,
        ignored,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MetaValue;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    async fn start_server() -> (Arc<SocketServer>, PathBuf, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.sock");
        let server = SocketServer::new(&path).unwrap();
        server.start().await.unwrap();
        (server, path, dir)
    }

    async fn connect_client(path: &Path, handshake: &Value) -> UnixStream {
        let mut stream = UnixStream::connect(path).await.unwrap();
        let payload = handshake.to_string();
        send_frame(&mut stream, payload.as_bytes()).await.unwrap();
        stream
    }

    async fn read_frame(stream: &mut UnixStream) -> Option<String> {
        let frame = timeout(Duration::from_secs(2), recv_frame(stream))
            .await
            .expect("read timed out")
            .unwrap();
        frame.map(|bytes| String::from_utf8(bytes).unwrap())
    }

    async fn wait_for_client_count(server: &Arc<SocketServer>, expected: usize) {
        for _ in 0..100 {
            if server.state.lock().await.clients.len() == expected {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("client count never reached {expected}");
    }

    fn sample_metadata() -> Metadata {
        let mut md = Metadata::new();
        md.insert("xesam:title".to_string(), MetaValue::from("Song"));
        md
    }

    #[tokio::test]
    async fn missing_required_key_gets_one_error_frame_and_close() {
        let (_server, path, _dir) = start_server().await;
        let mut stream = connect_client(
            &path,
            &json!({"name": "x", "interval": "ON_EVENT", "format_type": "str"}),
        )
        .await;
        let reply = read_frame(&mut stream).await.unwrap();
        let parsed: Value = serde_json::from_str(&reply).unwrap();
        assert!(parsed["Error"].as_str().unwrap().contains("format"));
        assert!(read_frame(&mut stream).await.is_none());
    }

    #[tokio::test]
    async fn invalid_interval_is_rejected() {
        let (_server, path, _dir) = start_server().await;
        let mut stream = connect_client(
            &path,
            &json!({"name": "x", "interval": "BOGUS", "format_type": "str", "format": "{title}"}),
        )
        .await;
        let reply = read_frame(&mut stream).await.unwrap();
        let parsed: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(parsed["Error"], json!("Invalid Interval: BOGUS"));
        assert!(read_frame(&mut stream).await.is_none());
    }

    #[tokio::test]
    async fn malformed_json_handshake_is_rejected() {
        let (_server, path, _dir) = start_server().await;
        let mut stream = UnixStream::connect(&path).await.unwrap();
        send_frame(&mut stream, b"not json").await.unwrap();
        let reply = read_frame(&mut stream).await.unwrap();
        let parsed: Value = serde_json::from_str(&reply).unwrap();
        assert!(parsed.get("Error").is_some());
        assert!(read_frame(&mut stream).await.is_none());
    }

    #[tokio::test]
    async fn extra_key_warns_then_proceeds() {
        let (server, path, _dir) = start_server().await;
        let mut stream = connect_client(
            &path,
            &json!({
                "name": "x", "interval": "ON_EVENT", "format_type": "str",
                "format": "all", "bogus": 1
            }),
        )
        .await;
        let warning = read_frame(&mut stream).await.unwrap();
        let parsed: Value = serde_json::from_str(&warning).unwrap();
        assert!(parsed["Warning"].as_str().unwrap().contains("bogus"));
        // The one-shot frame follows and the client stays registered.
        let snapshot = read_frame(&mut stream).await.unwrap();
        assert_eq!(snapshot, "{}");
        wait_for_client_count(&server, 1).await;
    }

    #[tokio::test]
    async fn on_player_interval_is_accepted() {
        let (server, path, _dir) = start_server().await;
        let mut stream = connect_client(
            &path,
            &json!({"name": "x", "interval": "ON_PLAYER", "format_type": "str", "format": "all"}),
        )
        .await;
        assert_eq!(read_frame(&mut stream).await.unwrap(), "{}");
        wait_for_client_count(&server, 1).await;
    }

    #[tokio::test]
    async fn one_shot_frame_uses_the_client_format() {
        let (_server, path, _dir) = start_server().await;
        let mut stream = connect_client(
            &path,
            &json!({
                "name": "x", "interval": "ON_EVENT", "format_type": "str",
                "format": "{xesam|title}"
            }),
        )
        .await;
        // No bus listener attached, so metadata is empty and the
        // placeholder falls back to the sentinel.
        assert_eq!(
            read_frame(&mut stream).await.unwrap(),
            client::MISSING_VALUE
        );
    }

    #[tokio::test]
    async fn fan_out_reaches_all_subscribers_in_order() {
        let (server, path, _dir) = start_server().await;
        let mut a = connect_client(
            &path,
            &json!({"name": "a", "interval": "ON_EVENT", "format_type": "str", "format": "all"}),
        )
        .await;
        let mut b = connect_client(
            &path,
            &json!({"name": "b", "interval": "ON_SEEK", "format_type": "str", "format": "all"}),
        )
        .await;
        read_frame(&mut a).await.unwrap();
        read_frame(&mut b).await.unwrap();
        wait_for_client_count(&server, 2).await;

        server
            .send_metadata(EventClass::Event, &sample_metadata())
            .await;
        let frame = read_frame(&mut a).await.unwrap();
        let parsed: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(parsed["xesam|title"], json!("Song"));

        // The seek subscriber must not see ON_EVENT traffic.
        server
            .send_metadata(EventClass::Seek, &sample_metadata())
            .await;
        let seek_frame = read_frame(&mut b).await.unwrap();
        assert!(seek_frame.contains("xesam|title"));
    }

    #[tokio::test]
    async fn broken_client_is_removed_and_others_still_receive() {
        let (server, path, _dir) = start_server().await;
        let mut a = connect_client(
            &path,
            &json!({"name": "a", "interval": "ON_EVENT", "format_type": "str", "format": "all"}),
        )
        .await;
        let b = connect_client(
            &path,
            &json!({"name": "b", "interval": "ON_EVENT", "format_type": "str", "format": "all"}),
        )
        .await;
        let mut c = connect_client(
            &path,
            &json!({"name": "c", "interval": "ON_EVENT", "format_type": "str", "format": "all"}),
        )
        .await;
        read_frame(&mut a).await.unwrap();
        read_frame(&mut c).await.unwrap();
        wait_for_client_count(&server, 3).await;

        drop(b);
        server
            .send_metadata(EventClass::Event, &sample_metadata())
            .await;
        server
            .send_metadata(EventClass::Event, &sample_metadata())
            .await;

        assert!(read_frame(&mut a).await.is_some());
        assert!(read_frame(&mut a).await.is_some());
        assert!(read_frame(&mut c).await.is_some());
        assert!(read_frame(&mut c).await.is_some());

        wait_for_client_count(&server, 2).await;
        let state = server.state.lock().await;
        assert!(!state.clients.contains_key("b"));
        for names in state.intervals.values() {
            assert!(!names.contains(&"b".to_string()));
            for name in names {
                assert!(state.clients.contains_key(name));
            }
        }
    }

    #[tokio::test]
    async fn disconnect_command_removes_the_client() {
        let (server, path, _dir) = start_server().await;
        let mut stream = connect_client(
            &path,
            &json!({"name": "x", "interval": "ON_EVENT", "format_type": "str", "format": "all"}),
        )
        .await;
        read_frame(&mut stream).await.unwrap();
        wait_for_client_count(&server, 1).await;

        send_frame(&mut stream, b"disconnect").await.unwrap();
        wait_for_client_count(&server, 0).await;
        let state = server.state.lock().await;
        assert!(state.intervals.values().all(|names| names.is_empty()));
    }

    #[tokio::test]
    async fn unknown_command_is_ignored() {
        let (server, path, _dir) = start_server().await;
        let mut stream = connect_client(
            &path,
            &json!({"name": "x", "interval": "ON_EVENT", "format_type": "str", "format": "all"}),
        )
        .await;
        read_frame(&mut stream).await.unwrap();
        wait_for_client_count(&server, 1).await;

        send_frame(&mut stream, b"frobnicate").await.unwrap();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(server.state.lock().await.clients.len(), 1);
    }

    #[tokio::test]
    async fn shutdown_broadcasts_warning_and_removes_socket() {
        let (server, path, _dir) = start_server().await;
        let mut stream = connect_client(
            &path,
            &json!({"name": "x", "interval": "ON_EVENT", "format_type": "str", "format": "all"}),
        )
        .await;
        read_frame(&mut stream).await.unwrap();
        wait_for_client_count(&server, 1).await;

        server.stop().await;
        let warning = read_frame(&mut stream).await.unwrap();
        let parsed: Value = serde_json::from_str(&warning).unwrap();
        assert_eq!(parsed["Warning"], json!(SHUTDOWN_WARNING));
        assert!(read_frame(&mut stream).await.is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn stale_socket_file_is_removed_on_startup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.sock");
        std::fs::write(&path, b"stale").unwrap();
        let server = SocketServer::new(&path).unwrap();
        server.start().await.unwrap();
        assert!(UnixStream::connect(&path).await.is_ok());
    }
}

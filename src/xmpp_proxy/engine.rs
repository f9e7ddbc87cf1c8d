//! The two pumps of a proxied session.
//!
//! A [`Session`] owns the write side of both legs. Its read sides are moved
//! into two tasks:
//!
//! - client -> server: presence is rewritten, chunks addressed to the
//!   synthetic contact are consumed as commands, everything else is forwarded
//!   byte for byte. After each chunk the synthetic presence and the
//!   introduction are sent once the roster carries the contact.
//! - server -> client: the first roster result gets the contact spliced in,
//!   everything else is forwarded byte for byte.
//!
//! Either pump ending (EOF, I/O error, or the session already being dead)
//! clears the liveness flag and fires the session's single end signal.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::commands;
use super::identity::PRESENCE_HINT;
use super::inject;
use super::rewrite::{rewrite_presence, RewriteOptions};
use crate::control::{ControlHandle, Visibility};

/// Read buffer per pump.
const READ_BUFFER_SIZE: usize = 8192;

/// Gap between introduction lines. Sent back to back, the client merges or
/// drops some of them.
const INTRODUCTION_DELAY: Duration = Duration::from_millis(200);

/// Monotonic session id for correlating logs across reconnects.
static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    ClientClosed,
    ClientReadError,
    ClientWriteError,
    ServerClosed,
    ServerReadError,
    ServerWriteError,
    /// The end signal was dropped without firing (pump tasks aborted).
    Aborted,
}

/// What the proxy remembers across sessions: the client does not resend its
/// presence right after a silent reconnect.
#[derive(Debug, Default)]
pub struct PresenceMemory {
    last_presence: Mutex<Option<String>>,
    client_version: OnceLock<String>,
}

impl PresenceMemory {
    pub async fn remember(&self, raw: &str) {
        *self.last_presence.lock().await = Some(raw.to_string());
    }

    pub async fn last_presence(&self) -> Option<String> {
        self.last_presence.lock().await.clone()
    }

    pub fn client_version(&self) -> Option<&str> {
        self.client_version.get().map(String::as_str)
    }

    /// Stores the detected version unless one is already known.
    fn record_version(&self, version: String) -> bool {
        self.client_version.set(version).is_ok()
    }
}

/// One-shot flags of the synthetic contact, fresh for every session.
#[derive(Debug, Default)]
pub struct InjectionState {
    roster_injected: AtomicBool,
    presence_sent: AtomicBool,
    introduction_sent: AtomicBool,
}

impl InjectionState {
    pub fn roster_injected(&self) -> bool {
        self.roster_injected.load(Ordering::SeqCst)
    }

    pub fn presence_sent(&self) -> bool {
        self.presence_sent.load(Ordering::SeqCst)
    }

    pub fn introduction_sent(&self) -> bool {
        self.introduction_sent.load(Ordering::SeqCst)
    }

    /// Returns true only for the first caller.
    fn claim_roster(&self) -> bool {
        !self.roster_injected.swap(true, Ordering::SeqCst)
    }

    fn claim_introduction(&self) -> bool {
        !self.introduction_sent.swap(true, Ordering::SeqCst)
    }
}

/// Write sides and liveness of one client/server pair.
pub struct Session {
    id: u64,
    to_client: Mutex<BoxedWriter>,
    to_server: Mutex<BoxedWriter>,
    alive: AtomicBool,
    ended: std::sync::Mutex<Option<oneshot::Sender<SessionEnd>>>,
    injection: InjectionState,
}

impl Session {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn injection(&self) -> &InjectionState {
        &self.injection
    }

    /// Clears liveness and fires the end signal. Only the first call fires;
    /// returns whether this call did.
    pub fn end(&self, reason: SessionEnd) -> bool {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return false;
        }
        info!(session_id = self.id, reason = ?reason, "Session ended");
        if let Ok(mut ended) = self.ended.lock() {
            if let Some(tx) = ended.take() {
                let _ = tx.send(reason);
            }
        }
        true
    }

    pub async fn send_to_client(&self, data: &[u8]) -> std::io::Result<()> {
        if !self.is_alive() {
            return Err(std::io::ErrorKind::NotConnected.into());
        }
        let mut writer = self.to_client.lock().await;
        writer.write_all(data).await?;
        writer.flush().await
    }

    pub async fn send_to_server(&self, data: &[u8]) -> std::io::Result<()> {
        if !self.is_alive() {
            return Err(std::io::ErrorKind::NotConnected.into());
        }
        let mut writer = self.to_server.lock().await;
        writer.write_all(data).await?;
        writer.flush().await
    }

    /// Sends one chat line from the synthetic contact to the client.
    pub async fn notify(&self, body: &str) -> std::io::Result<()> {
        let message = inject::chat_message(body);
        debug!(session_id = self.id, data = %message, "Veil->client");
        self.send_to_client(message.as_bytes()).await
    }

    pub async fn send_synthetic_presence(&self, memory: &PresenceMemory) -> std::io::Result<()> {
        self.injection.presence_sent.store(true, Ordering::SeqCst);
        let presence = inject::synthetic_presence(memory.client_version());
        debug!(session_id = self.id, data = %presence, "Veil->client");
        self.send_to_client(presence.as_bytes()).await
    }

    /// Rewrites a raw client presence for `target` and sends it upstream.
    ///
    /// Unparseable chunks go out untouched; chunks that fail mid-rewrite are
    /// dropped.
    pub async fn forward_presence(
        &self,
        memory: &PresenceMemory,
        raw: &str,
        target: Visibility,
        allow_muc: bool,
    ) -> std::io::Result<()> {
        let opts = RewriteOptions {
            target,
            allow_muc,
            mine_version: memory.client_version().is_none(),
        };

        match rewrite_presence(raw, opts) {
            Ok(rewritten) => {
                if let Some(version) = rewritten.detected_version {
                    if memory.record_version(version) {
                        info!(
                            session_id = self.id,
                            version = memory.client_version().unwrap_or_default(),
                            "Detected shooter client version"
                        );
                        if self.injection.roster_injected() {
                            self.send_synthetic_presence(memory).await?;
                        }
                    }
                }
                debug!(session_id = self.id, data = %rewritten.xml, "Veil->server presence");
                self.send_to_server(rewritten.xml.as_bytes()).await
            }
            Err(e) if e.forwards_original() => {
                debug!(session_id = self.id, error = %e, "Presence chunk not parseable, forwarding as-is");
                self.send_to_server(raw.as_bytes()).await
            }
            Err(e) => {
                error!(session_id = self.id, error = %e, "Error rewriting presence, chunk dropped");
                Ok(())
            }
        }
    }

    async fn send_introduction(&self, visibility: Visibility) -> std::io::Result<()> {
        let lines = commands::introduction(visibility);
        let last = lines.len() - 1;
        for (i, line) in lines.iter().enumerate() {
            self.notify(line).await?;
            if i < last {
                tokio::time::sleep(INTRODUCTION_DELAY).await;
            }
        }
        Ok(())
    }

    /// Flushes and closes both write sides.
    pub async fn shutdown(&self) {
        if let Err(e) = self.to_client.lock().await.shutdown().await {
            debug!(session_id = self.id, error = %e, "Client leg shutdown error");
        }
        if let Err(e) = self.to_server.lock().await.shutdown().await {
            debug!(session_id = self.id, error = %e, "Server leg shutdown error");
        }
    }
}

/// A started session: the shared [`Session`] plus its two pump tasks.
pub struct RunningSession {
    session: Arc<Session>,
    ended: oneshot::Receiver<SessionEnd>,
    client_to_server: JoinHandle<()>,
    server_to_client: JoinHandle<()>,
}

impl RunningSession {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Resolves when either pump ends the session.
    pub async fn ended(&mut self) -> SessionEnd {
        (&mut self.ended).await.unwrap_or(SessionEnd::Aborted)
    }

    /// Stops both pumps and closes both legs.
    pub async fn close(self) {
        self.session.end(SessionEnd::Aborted);
        self.client_to_server.abort();
        self.server_to_client.abort();
        self.session.shutdown().await;
    }
}

/// Wires a client-facing and a server-facing stream into a new session,
/// attaches it to the controller and starts both pumps.
pub async fn start<C, S>(
    client: C,
    server: S,
    memory: Arc<PresenceMemory>,
    control: ControlHandle,
) -> RunningSession
where
    C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (server_read, server_write) = tokio::io::split(server);
    let (ended_tx, ended_rx) = oneshot::channel();

    let session = Arc::new(Session {
        id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
        to_client: Mutex::new(Box::new(client_write)),
        to_server: Mutex::new(Box::new(server_write)),
        alive: AtomicBool::new(true),
        ended: std::sync::Mutex::new(Some(ended_tx)),
        injection: InjectionState::default(),
    });
    info!(session_id = session.id, "Session started");

    control.attach(session.clone()).await;

    let client_to_server = tokio::spawn(pump_client_to_server(
        client_read,
        session.clone(),
        memory,
        control,
    ));
    let server_to_client = tokio::spawn(pump_server_to_client(server_read, session.clone()));

    RunningSession {
        session,
        ended: ended_rx,
        client_to_server,
        server_to_client,
    }
}

async fn pump_client_to_server<C>(
    mut reader: ReadHalf<C>,
    session: Arc<Session>,
    memory: Arc<PresenceMemory>,
    control: ControlHandle,
) where
    C: AsyncRead + Send + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let reason = loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                info!(session_id = session.id, "Client closed connection");
                break SessionEnd::ClientClosed;
            }
            Ok(n) => n,
            Err(e) => {
                warn!(session_id = session.id, error = %e, "Client read error");
                break SessionEnd::ClientReadError;
            }
        };
        if !session.is_alive() {
            break SessionEnd::Aborted;
        }
        if let Err(e) = handle_client_chunk(&session, &memory, &control, &buf[..n]).await {
            warn!(session_id = session.id, error = %e, "Client->server forwarding failed");
            break SessionEnd::ServerWriteError;
        }
    };
    session.end(reason);
}

async fn handle_client_chunk(
    session: &Session,
    memory: &PresenceMemory,
    control: &ControlHandle,
    chunk: &[u8],
) -> std::io::Result<()> {
    let state = control.state();

    // A read can end mid-character; a lossy decode still exposes the
    // addressing and the presence tag.
    let text = String::from_utf8_lossy(chunk);

    if commands::is_addressed_to_contact(&text) {
        debug!(session_id = session.id, data = %text, "Client->Veil (consumed)");
        if let Some(command) = commands::parse_command(&text) {
            info!(session_id = session.id, command = ?command, "Chat command received");
            control.chat_command(command).await;
        }
    } else if text.contains(PRESENCE_HINT) {
        memory.remember(&text).await;
        if state.enabled {
            debug!(session_id = session.id, data = %text, "Client->server presence (original)");
            session
                .forward_presence(memory, &text, state.visibility, state.allow_muc)
                .await?;
        } else {
            debug!(session_id = session.id, data = %text, "Client->server presence (disabled)");
            session.send_to_server(chunk).await?;
        }
    } else {
        debug!(session_id = session.id, data = %text, "Client->server");
        session.send_to_server(chunk).await?;
    }

    if session.injection.roster_injected() {
        if !session.injection.presence_sent() {
            session.send_synthetic_presence(memory).await?;
        }
        if session.injection.claim_introduction() {
            session.send_introduction(control.state().visibility).await?;
        }
    }
    Ok(())
}

async fn pump_server_to_client<S>(mut reader: ReadHalf<S>, session: Arc<Session>)
where
    S: AsyncRead + Send + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let reason = loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                info!(session_id = session.id, "Server closed connection");
                break SessionEnd::ServerClosed;
            }
            Ok(n) => n,
            Err(e) => {
                warn!(session_id = session.id, error = %e, "Server read error");
                break SessionEnd::ServerReadError;
            }
        };
        if !session.is_alive() {
            break SessionEnd::Aborted;
        }
        let chunk = &buf[..n];
        debug!(session_id = session.id, data = %String::from_utf8_lossy(chunk), "Server->client");

        let spliced = if session.injection.roster_injected() {
            None
        } else {
            inject::splice_roster(chunk)
        };
        let result = match spliced {
            Some(modified) if session.injection.claim_roster() => {
                info!(session_id = session.id, "Injected synthetic contact into roster");
                session.send_to_client(&modified).await
            }
            _ => session.send_to_client(chunk).await,
        };
        if let Err(e) = result {
            warn!(session_id = session.id, error = %e, "Server->client forwarding failed");
            break SessionEnd::ClientWriteError;
        }
    };
    session.end(reason);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{spawn_controller, ProxyState};
    use crate::xmpp_proxy::identity::{ROSTER_MARKER, SYNTHETIC_FULL_JID, SYNTHETIC_JID};
    use tokio::io::DuplexStream;

    const WAIT: Duration = Duration::from_secs(2);

    struct Harness {
        client: DuplexStream,
        server: DuplexStream,
        running: RunningSession,
        control: ControlHandle,
        memory: Arc<PresenceMemory>,
    }

    async fn harness(state: ProxyState) -> Harness {
        let memory = Arc::new(PresenceMemory::default());
        let (control, _task) = spawn_controller(state, memory.clone());
        let (client, client_end) = tokio::io::duplex(64 * 1024);
        let (server, server_end) = tokio::io::duplex(64 * 1024);
        let running = start(client_end, server_end, memory.clone(), control.clone()).await;
        Harness {
            client,
            server,
            running,
            control,
            memory,
        }
    }

    fn hidden() -> ProxyState {
        ProxyState {
            visibility: Visibility::Offline,
            enabled: true,
            allow_muc: false,
        }
    }

    async fn read_some(stream: &mut DuplexStream) -> String {
        let mut buf = vec![0u8; 64 * 1024];
        let n = tokio::time::timeout(WAIT, stream.read(&mut buf))
            .await
            .expect("timed out waiting for data")
            .expect("read failed");
        String::from_utf8_lossy(&buf[..n]).into_owned()
    }

    /// Reads until `needle` shows up.
    async fn read_until(stream: &mut DuplexStream, needle: &str) -> String {
        let mut seen = String::new();
        while !seen.contains(needle) {
            seen.push_str(&read_some(stream).await);
        }
        seen
    }

    async fn assert_silent(stream: &mut DuplexStream) {
        let mut buf = [0u8; 1024];
        match tokio::time::timeout(Duration::from_millis(150), stream.read(&mut buf)).await {
            Err(_) => {}
            Ok(Ok(0)) => {}
            Ok(Ok(n)) => panic!("unexpected data: {}", String::from_utf8_lossy(&buf[..n])),
            Ok(Err(_)) => {}
        }
    }

    #[tokio::test]
    async fn test_plain_traffic_is_forwarded_both_ways() {
        let mut h = harness(hidden()).await;

        h.client.write_all(b"<iq type='get' id='1'/>").await.unwrap();
        assert_eq!(read_some(&mut h.server).await, "<iq type='get' id='1'/>");

        h.server.write_all(b"<iq type='result' id='1'/>").await.unwrap();
        assert_eq!(read_some(&mut h.client).await, "<iq type='result' id='1'/>");
    }

    #[tokio::test]
    async fn test_presence_is_rewritten_and_remembered() {
        let mut h = harness(hidden()).await;
        let presence = "<presence><show>away</show><status>afk</status><games><bacon><st>chat</st></bacon></games></presence><presence to='lobby@muc.pvp.net'/>";

        h.client.write_all(presence.as_bytes()).await.unwrap();
        assert_eq!(
            read_some(&mut h.server).await,
            "<presence><show>offline</show><games></games></presence>"
        );
        assert_eq!(h.memory.last_presence().await.as_deref(), Some(presence));
    }

    #[tokio::test]
    async fn test_disabled_presence_passes_through() {
        let mut h = harness(ProxyState {
            enabled: false,
            ..hidden()
        })
        .await;
        let presence = "<presence><show>away</show></presence>";

        h.client.write_all(presence.as_bytes()).await.unwrap();
        assert_eq!(read_some(&mut h.server).await, presence);
        assert_eq!(h.memory.last_presence().await.as_deref(), Some(presence));
    }

    #[tokio::test]
    async fn test_roster_is_injected_once() {
        let mut h = harness(hidden()).await;
        let roster = format!("<iq type='result'>{}</query></iq>", ROSTER_MARKER);

        h.server.write_all(roster.as_bytes()).await.unwrap();
        let first = read_some(&mut h.client).await;
        assert_eq!(
            first,
            format!(
                "<iq type='result'>{}{}</query></iq>",
                ROSTER_MARKER,
                inject::roster_item()
            )
        );
        assert!(h.running.session().injection().roster_injected());

        h.server.write_all(roster.as_bytes()).await.unwrap();
        assert_eq!(read_some(&mut h.client).await, roster);
    }

    #[tokio::test]
    async fn test_synthetic_presence_and_introduction_follow_roster() {
        let mut h = harness(hidden()).await;
        let roster = format!("<iq type='result'>{}</query></iq>", ROSTER_MARKER);
        h.server.write_all(roster.as_bytes()).await.unwrap();
        read_until(&mut h.client, "</iq>").await;

        h.client.write_all(b"<iq type='get' id='2'/>").await.unwrap();
        assert_eq!(read_some(&mut h.server).await, "<iq type='get' id='2'/>");

        let seen = read_until(&mut h.client, "Have fun!").await;
        assert!(seen.starts_with(&format!("<presence from='{}'", SYNTHETIC_FULL_JID)));
        assert_eq!(seen.matches("<message ").count(), 4);
        assert!(seen.contains("currently appearing offline"));

        let injection = h.running.session().injection();
        assert!(injection.presence_sent());
        assert!(injection.introduction_sent());

        // Later chunks do not repeat either.
        h.client.write_all(b"<iq type='get' id='3'/>").await.unwrap();
        assert_eq!(read_some(&mut h.server).await, "<iq type='get' id='3'/>");
        assert_silent(&mut h.client).await;
    }

    #[tokio::test]
    async fn test_contact_traffic_never_reaches_server() {
        let mut h = harness(hidden()).await;
        for body in ["offline", "mobile", "online", "enable", "disable", "status", "help", "hello?"] {
            let msg = format!(
                "<message to='{}' type='chat'><body>{}</body></message>",
                SYNTHETIC_JID, body
            );
            h.client.write_all(msg.as_bytes()).await.unwrap();
            // Drain whatever the contact answered before the next command.
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let presence_to_contact = format!("<presence to='{}' type='probe'/>", SYNTHETIC_JID);
        h.client.write_all(presence_to_contact.as_bytes()).await.unwrap();
        assert_silent(&mut h.server).await;
    }

    #[tokio::test]
    async fn test_contact_traffic_split_mid_character_is_consumed() {
        let mut h = harness(hidden()).await;
        let mut msg = format!("<message to='{}' type='chat'><body>status ", SYNTHETIC_JID).into_bytes();
        // First byte of a two-byte character; the rest would arrive in the next read.
        msg.push("é".as_bytes()[0]);
        assert!(std::str::from_utf8(&msg).is_err());

        h.client.write_all(&msg).await.unwrap();
        assert_silent(&mut h.server).await;
    }

    #[tokio::test]
    async fn test_non_utf8_traffic_is_forwarded_untouched() {
        let mut h = harness(hidden()).await;
        let mut chunk = b"<iq type='get' id='9'><query>caf".to_vec();
        chunk.push("é".as_bytes()[0]);
        h.client.write_all(&chunk).await.unwrap();

        let mut buf = vec![0u8; chunk.len()];
        tokio::time::timeout(Duration::from_secs(2), h.server.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(buf, chunk);
    }

    #[tokio::test]
    async fn test_status_command_replies_once_without_forwarding() {
        let mut h = harness(ProxyState {
            visibility: Visibility::Mobile,
            ..hidden()
        })
        .await;
        let msg = format!(
            "<message to='{}' type='chat'><body>status</body></message>",
            SYNTHETIC_JID
        );
        h.client.write_all(msg.as_bytes()).await.unwrap();

        let reply = read_until(&mut h.client, "</message>").await;
        assert!(reply.contains("<body>You are appearing mobile.</body>"));
        assert_eq!(reply.matches("<message ").count(), 1);
        assert_silent(&mut h.client).await;
        assert_silent(&mut h.server).await;
    }

    #[tokio::test]
    async fn test_visibility_command_resends_last_presence() {
        let mut h = harness(hidden()).await;
        let presence = "<presence><show>away</show><status>afk</status></presence>";
        h.client.write_all(presence.as_bytes()).await.unwrap();
        assert_eq!(
            read_some(&mut h.server).await,
            "<presence><show>offline</show></presence>"
        );

        h.control.set_visibility(Visibility::Chat).await;
        assert_eq!(
            read_some(&mut h.server).await,
            "<presence><show>chat</show><status>afk</status></presence>"
        );
        let notice = read_until(&mut h.client, "</message>").await;
        assert!(notice.contains("You are now appearing online."));
    }

    #[tokio::test]
    async fn test_server_eof_ends_session_once() {
        let mut h = harness(hidden()).await;

        h.server.shutdown().await.unwrap();
        let reason = tokio::time::timeout(WAIT, h.running.ended()).await.unwrap();
        assert_eq!(reason, SessionEnd::ServerClosed);

        let session = h.running.session().clone();
        assert!(!session.is_alive());
        assert!(!session.end(SessionEnd::ClientClosed));

        h.client.write_all(b"<iq type='get' id='9'/>").await.unwrap();
        assert_silent(&mut h.server).await;
    }

    #[tokio::test]
    async fn test_client_eof_ends_session() {
        let mut h = harness(hidden()).await;
        h.client.shutdown().await.unwrap();
        let reason = tokio::time::timeout(WAIT, h.running.ended()).await.unwrap();
        assert_eq!(reason, SessionEnd::ClientClosed);
    }

    #[tokio::test]
    async fn test_version_is_mined_once() {
        use base64::Engine;
        let mut h = harness(hidden()).await;
        let payload = |v: &str| {
            base64::engine::general_purpose::STANDARD
                .encode(format!(r#"{{"partyClientVersion":"{}"}}"#, v))
        };

        let first = format!(
            "<presence><games><valorant><p>{}</p></valorant></games></presence>",
            payload("release-1")
        );
        h.client.write_all(first.as_bytes()).await.unwrap();
        assert_eq!(read_some(&mut h.server).await, "<presence><games></games></presence>");
        assert_eq!(h.memory.client_version(), Some("release-1"));

        let second = format!(
            "<presence><games><valorant><p>{}</p></valorant></games></presence>",
            payload("release-2")
        );
        h.client.write_all(second.as_bytes()).await.unwrap();
        assert_eq!(read_some(&mut h.server).await, "<presence><games></games></presence>");
        assert_eq!(h.memory.client_version(), Some("release-1"));
    }
}

//! Proxy settings and the task that owns them.
//!
//! The controller task is the only writer of [`ProxyState`]. Console actions
//! and chat commands reach it as messages through a [`ControlHandle`]; pumps
//! read the current state through a `watch` channel. Every request carries an
//! ack so a caller can wait for its effects (re-sent presence, confirmation
//! messages) to hit the wire before moving on.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::xmpp_proxy::commands::{self, Command, Effect};
use crate::xmpp_proxy::engine::{PresenceMemory, Session};

/// What friends should see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Visibility {
    Chat,
    #[default]
    Offline,
    Mobile,
}

impl Visibility {
    /// Value written into `<show>` and the per-game status.
    pub fn as_str(self) -> &'static str {
        match self {
            Visibility::Chat => "chat",
            Visibility::Offline => "offline",
            Visibility::Mobile => "mobile",
        }
    }

    /// Human wording used in chat messages and on the console.
    pub fn label(self) -> &'static str {
        match self {
            Visibility::Chat => "online",
            other => other.as_str(),
        }
    }

    /// Parses the persisted form. Anything unrecognized appears offline.
    pub fn from_stored(value: &str) -> Self {
        match value.trim() {
            "mobile" => Visibility::Mobile,
            "chat" => Visibility::Chat,
            _ => Visibility::Offline,
        }
    }
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyState {
    pub visibility: Visibility,
    /// Presence rewriting on or off. Off lets the real status through.
    pub enabled: bool,
    /// Whether directed presence (lobby and group chat joins) is forwarded.
    pub allow_muc: bool,
}

impl ProxyState {
    pub fn new(visibility: Visibility) -> Self {
        Self {
            visibility,
            enabled: true,
            allow_muc: true,
        }
    }
}

enum Request {
    SetVisibility(Visibility),
    SetEnabled(bool),
    SetMucRouting(bool),
    Chat(Command),
    Attach(Arc<Session>),
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::SetVisibility(v) => write!(f, "SetVisibility({v})"),
            Request::SetEnabled(b) => write!(f, "SetEnabled({b})"),
            Request::SetMucRouting(b) => write!(f, "SetMucRouting({b})"),
            Request::Chat(c) => write!(f, "Chat({c:?})"),
            Request::Attach(s) => write!(f, "Attach(session {})", s.id()),
        }
    }
}

struct Envelope {
    request: Request,
    done: oneshot::Sender<()>,
}

/// Cloneable entry point to the controller task.
#[derive(Clone)]
pub struct ControlHandle {
    tx: mpsc::Sender<Envelope>,
    state: watch::Receiver<ProxyState>,
}

impl ControlHandle {
    /// Latest published state.
    pub fn state(&self) -> ProxyState {
        *self.state.borrow()
    }

    /// Appear as `visibility`. Turns rewriting back on if it was off.
    pub async fn set_visibility(&self, visibility: Visibility) {
        self.request(Request::SetVisibility(visibility)).await
    }

    pub async fn set_enabled(&self, enabled: bool) {
        self.request(Request::SetEnabled(enabled)).await
    }

    pub async fn set_muc_routing(&self, allow: bool) {
        self.request(Request::SetMucRouting(allow)).await
    }

    /// Runs a command received from the synthetic contact's chat.
    pub async fn chat_command(&self, command: Command) {
        self.request(Request::Chat(command)).await
    }

    /// Points re-sent presence and notices at a new session.
    pub async fn attach(&self, session: Arc<Session>) {
        self.request(Request::Attach(session)).await
    }

    async fn request(&self, request: Request) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(Envelope { request, done }).await.is_err() {
            warn!("Controller task is gone, request dropped");
            return;
        }
        let _ = wait.await;
    }
}

pub fn spawn_controller(
    initial: ProxyState,
    memory: Arc<PresenceMemory>,
) -> (ControlHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(32);
    let (publish, state) = watch::channel(initial);
    let controller = Controller {
        state: initial,
        publish,
        memory,
        session: None,
    };
    let task = tokio::spawn(controller.run(rx));
    (ControlHandle { tx, state }, task)
}

struct Controller {
    state: ProxyState,
    publish: watch::Sender<ProxyState>,
    memory: Arc<PresenceMemory>,
    session: Option<Arc<Session>>,
}

impl Controller {
    async fn run(mut self, mut rx: mpsc::Receiver<Envelope>) {
        while let Some(Envelope { request, done }) = rx.recv().await {
            debug!(request = ?request, "Controller request");
            self.handle(request).await;
            let _ = done.send(());
        }
        debug!("Controller stopped");
    }

    async fn handle(&mut self, request: Request) {
        match request {
            Request::Attach(session) => self.session = Some(session),
            Request::SetVisibility(visibility) => self.apply(Effect::Appear(visibility)).await,
            Request::SetEnabled(enabled) => self.apply(Effect::SetEnabled(enabled)).await,
            Request::SetMucRouting(allow) => {
                self.state.allow_muc = allow;
                self.publish();
                info!(allow_muc = allow, "Lobby chat routing changed");
            }
            Request::Chat(command) => {
                let plan = commands::plan(command, self.state);
                for notice in &plan.notices {
                    self.notify(notice).await;
                }
                if let Some(effect) = plan.effect {
                    self.apply(effect).await;
                }
                if let Some(reply) = &plan.reply {
                    self.notify(reply).await;
                }
            }
        }
    }

    async fn apply(&mut self, effect: Effect) {
        match effect {
            Effect::Appear(visibility) => {
                self.state.visibility = visibility;
                self.state.enabled = true;
                self.publish();
                info!(visibility = %visibility, "Visibility changed");
                self.resend_presence(visibility).await;
                self.notify(&commands::appearance_notice(visibility)).await;
            }
            Effect::SetEnabled(enabled) => {
                self.state.enabled = enabled;
                self.publish();
                info!(enabled, "Rewriting toggled");
                // Disabled means the real status, which the client always sends as chat.
                let target = if enabled {
                    self.state.visibility
                } else {
                    Visibility::Chat
                };
                self.resend_presence(target).await;
                self.notify(&commands::enabled_notice(enabled)).await;
            }
        }
    }

    fn publish(&self) {
        self.publish.send_replace(self.state);
    }

    fn live_session(&self) -> Option<&Arc<Session>> {
        self.session.as_ref().filter(|s| s.is_alive())
    }

    /// Re-derives the outgoing presence from the last one the client sent.
    async fn resend_presence(&self, target: Visibility) {
        let Some(session) = self.live_session() else {
            return;
        };
        let Some(raw) = self.memory.last_presence().await else {
            debug!(session_id = session.id(), "No presence seen yet, nothing to resend");
            return;
        };
        if let Err(e) = session
            .forward_presence(&self.memory, &raw, target, self.state.allow_muc)
            .await
        {
            debug!(session_id = session.id(), error = %e, "Presence resend failed");
        }
    }

    async fn notify(&self, body: &str) {
        let Some(session) = self.live_session() else {
            return;
        };
        if let Err(e) = session.notify(body).await {
            debug!(session_id = session.id(), error = %e, "Notice not delivered");
        }
    }
}

/// One line typed on the console.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleAction {
    Appear(Visibility),
    Enable(bool),
    MucRouting(bool),
    Status,
    Help,
    Quit,
}

pub const CONSOLE_HELP: &str =
    "Commands: online, offline, mobile, enable, disable, muc on, muc off, status, help, quit";

pub fn parse_console(line: &str) -> Option<ConsoleAction> {
    let line = line.trim().to_lowercase();
    let mut words = line.split_whitespace();
    let action = match (words.next()?, words.next()) {
        ("online" | "chat", None) => ConsoleAction::Appear(Visibility::Chat),
        ("offline", None) => ConsoleAction::Appear(Visibility::Offline),
        ("mobile", None) => ConsoleAction::Appear(Visibility::Mobile),
        ("enable", None) => ConsoleAction::Enable(true),
        ("disable", None) => ConsoleAction::Enable(false),
        ("muc", Some("on")) => ConsoleAction::MucRouting(true),
        ("muc", Some("off")) => ConsoleAction::MucRouting(false),
        ("status", None) => ConsoleAction::Status,
        ("help" | "?", None) => ConsoleAction::Help,
        ("quit" | "exit", None) => ConsoleAction::Quit,
        _ => return None,
    };
    Some(action)
}

pub fn describe(state: ProxyState) -> String {
    format!(
        "Appearing {}, rewriting {}, lobby chat {}",
        state.visibility.label(),
        if state.enabled { "enabled" } else { "disabled" },
        if state.allow_muc { "on" } else { "off" },
    )
}

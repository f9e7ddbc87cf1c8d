//! Chat commands sent to the synthetic contact.
//!
//! The user talks to the injected contact like any friend; recognized words
//! in the message body change the proxy's settings. Every chunk addressed to
//! the contact is consumed by the proxy whether or not it carries a command.

use quick_xml::escape::unescape;

use super::identity::SYNTHETIC_JID;
use crate::control::{ProxyState, Visibility};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Offline,
    Mobile,
    Online,
    Enable,
    Disable,
    Status,
    Help,
}

/// Match order matters: the first keyword found in the body wins.
const KEYWORDS: [(&str, Command); 7] = [
    ("offline", Command::Offline),
    ("mobile", Command::Mobile),
    ("online", Command::Online),
    ("enable", Command::Enable),
    ("disable", Command::Disable),
    ("status", Command::Status),
    ("help", Command::Help),
];

pub fn is_addressed_to_contact(chunk: &str) -> bool {
    chunk.contains(SYNTHETIC_JID)
}

/// Finds the first keyword in the chunk's message body, case-insensitively.
pub fn parse_command(chunk: &str) -> Option<Command> {
    let body = message_body(chunk)?.to_lowercase();
    KEYWORDS
        .iter()
        .find(|(keyword, _)| body.contains(keyword))
        .map(|(_, command)| *command)
}

fn message_body(chunk: &str) -> Option<String> {
    let open = chunk.find("<body")?;
    let start = open + chunk[open..].find('>')? + 1;
    // `<body/>` has nothing to read
    if chunk[..start].ends_with("/>") {
        return None;
    }
    let end = start + chunk[start..].find("</body>")?;
    let raw = &chunk[start..end];
    Some(unescape(raw).map(|s| s.into_owned()).unwrap_or_else(|_| raw.to_string()))
}

/// State change a command asks the controller for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    Appear(Visibility),
    SetEnabled(bool),
}

/// What the controller does for one command: notices sent first, then the
/// effect (which sends its own confirmation), then a plain reply.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Plan {
    pub notices: Vec<String>,
    pub effect: Option<Effect>,
    pub reply: Option<String>,
}

pub fn plan(command: Command, state: ProxyState) -> Plan {
    let appear = |visibility| {
        let mut plan = Plan {
            effect: Some(Effect::Appear(visibility)),
            ..Plan::default()
        };
        if !state.enabled {
            plan.notices.push(enabled_notice(true));
        }
        plan
    };
    let reply = |text: String| Plan {
        reply: Some(text),
        ..Plan::default()
    };

    match command {
        Command::Offline => appear(Visibility::Offline),
        Command::Mobile => appear(Visibility::Mobile),
        Command::Online => appear(Visibility::Chat),
        Command::Enable if state.enabled => reply("Veil is already enabled.".to_string()),
        Command::Disable if !state.enabled => reply("Veil is already disabled.".to_string()),
        Command::Enable => Plan {
            effect: Some(Effect::SetEnabled(true)),
            ..Plan::default()
        },
        Command::Disable => Plan {
            effect: Some(Effect::SetEnabled(false)),
            ..Plan::default()
        },
        Command::Status => reply(status_notice(state.visibility)),
        Command::Help => reply(
            "You can send the following messages to quickly change Veil settings: \
             online/offline/mobile/enable/disable/status"
                .to_string(),
        ),
    }
}

pub fn enabled_notice(enabled: bool) -> String {
    if enabled {
        "Veil is now enabled.".to_string()
    } else {
        "Veil is now disabled.".to_string()
    }
}

pub fn appearance_notice(visibility: Visibility) -> String {
    format!("You are now appearing {}.", visibility.label())
}

pub fn status_notice(visibility: Visibility) -> String {
    format!("You are appearing {}.", visibility.label())
}

/// Welcome lines sent once per session after the contact shows up.
pub fn introduction(visibility: Visibility) -> [String; 4] {
    [
        format!(
            "Welcome! Veil is running and you are currently appearing {}. \
             Despite what the game client may show, you will appear that way \
             to your friends unless you manually disable Veil.",
            visibility.label()
        ),
        "If you want to invite others while appearing offline, disable Veil, \
         send the invite, then enable it again once they are in your lobby."
            .to_string(),
        "To enable or disable Veil, or to change other settings, message me \
         \"help\" or use the Veil console."
            .to_string(),
        "Have fun!".to_string(),
    ]
}

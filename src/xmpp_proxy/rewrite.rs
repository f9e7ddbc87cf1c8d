//! Presence rewriting.
//!
//! Takes a client-to-server chunk that looks like it carries presence and
//! forces the user's chosen visibility onto every undirected `<presence>`.
//! Each game publishes its own block under `<games>`:
//!
//! - `league_of_legends`: carries `st` (status), `p` (live game payload) and
//!   `m` (status message). Status follows the target; `p`/`m` survive only
//!   when appearing online, the whole block survives only online or mobile.
//! - `bacon` (card game): no usable status mapping, always stripped.
//! - `valorant`: its base64 JSON `p` payload is mined once for the client
//!   version, then the block is always stripped.
//!
//! Parse failures are fail-open ([`RewriteError::Parse`]: the caller forwards
//! the chunk untouched, it is usually a partial stanza). Failures after a
//! successful parse are fail-closed ([`RewriteError::Transform`]: the caller
//! forwards nothing, a half-rewritten presence could leak the real status).

use base64::Engine;
use thiserror::Error;

use super::tree::{Element, Fragment, TreeError};
use crate::control::Visibility;

const LEAGUE: &str = "league_of_legends";
const CARD_GAME: &str = "bacon";
const SHOOTER: &str = "valorant";
const VERSION_FIELD: &str = "partyClientVersion";

#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("fragment is not parseable XML: {0}")]
    Parse(TreeError),
    #[error("presence rewrite failed: {0}")]
    Transform(String),
}

impl RewriteError {
    /// Whether the caller should forward the original chunk unmodified.
    pub fn forwards_original(&self) -> bool {
        matches!(self, RewriteError::Parse(_))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RewriteOptions {
    pub target: Visibility,
    /// Directed presence (group chat joins) passes through when set, is dropped otherwise.
    pub allow_muc: bool,
    /// Decode the shooter payload looking for the client version.
    pub mine_version: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewritten {
    pub xml: String,
    pub detected_version: Option<String>,
}

pub fn rewrite_presence(fragment: &str, opts: RewriteOptions) -> Result<Rewritten, RewriteError> {
    let mut tree = Fragment::parse(fragment).map_err(RewriteError::Parse)?;

    if !opts.allow_muc {
        tree.retain_elements(|el| !(el.is("presence") && el.has_attr("to")));
    }

    let mut detected_version = None;
    for presence in tree.elements_mut() {
        if !presence.is("presence") || presence.has_attr("to") {
            continue;
        }
        let found = rewrite_one(presence, opts)?;
        if detected_version.is_none() {
            detected_version = found;
        }
    }

    let xml = tree
        .to_xml()
        .map_err(|e| RewriteError::Transform(e.to_string()))?;
    Ok(Rewritten {
        xml,
        detected_version,
    })
}

fn rewrite_one(presence: &mut Element, opts: RewriteOptions) -> Result<Option<String>, RewriteError> {
    let target = opts.target.as_str();

    // Busy (in game) stays visible as such when the user appears online anyway.
    let league_status = presence
        .descendant(&["games", LEAGUE, "st"])
        .and_then(Element::text);
    let keep_busy = opts.target == Visibility::Chat && league_status.as_deref() == Some("dnd");
    if !keep_busy {
        if let Some(show) = presence.child_mut("show") {
            show.set_text(target);
        }
        if let Some(st) = presence.descendant_mut(&["games", LEAGUE, "st"]) {
            st.set_text(target);
        }
    }

    if opts.target != Visibility::Chat {
        presence.remove_child("status");
        if let Some(games) = presence.child_mut("games") {
            if opts.target == Visibility::Mobile {
                if let Some(league) = games.child_mut(LEAGUE) {
                    league.remove_child("p");
                    league.remove_child("m");
                }
            } else {
                games.remove_child(LEAGUE);
            }
        }
    }

    let mut detected_version = None;
    if let Some(games) = presence.child_mut("games") {
        games.remove_child(CARD_GAME);

        if opts.mine_version {
            if let Some(payload) = games.descendant(&[SHOOTER, "p"]).and_then(Element::text) {
                detected_version = shooter_version(&payload)?;
            }
        }
        games.remove_child(SHOOTER);
    }

    Ok(detected_version)
}

/// Pulls the client version out of the shooter's base64 JSON presence payload.
fn shooter_version(payload: &str) -> Result<Option<String>, RewriteError> {
    let raw = base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|e| RewriteError::Transform(format!("shooter payload is not base64: {}", e)))?;
    let json: serde_json::Value = serde_json::from_slice(&raw)
        .map_err(|e| RewriteError::Transform(format!("shooter payload is not JSON: {}", e)))?;
    Ok(json
        .get(VERSION_FIELD)
        .and_then(|v| v.as_str())
        .map(str::to_string))
}

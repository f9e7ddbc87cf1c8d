//! Wire builders for the synthetic contact.
//!
//! Everything here is written to the client-facing leg only. Synthetic
//! stanzas must never reach the chat server.

use base64::Engine;
use chrono::{DateTime, TimeDelta, Utc};
use quick_xml::escape::escape;
use uuid::Uuid;

use super::identity::{
    ROSTER_MARKER, SYNTHETIC_FULL_JID, SYNTHETIC_GROUP, SYNTHETIC_JID, SYNTHETIC_NAME,
    SYNTHETIC_PLATFORM_NAME, SYNTHETIC_PUUID,
};

/// Placeholder stamped into the shooter block before the real version is known.
pub const UNKNOWN_VERSION: &str = "unknown";

/// Roster `<item>` for the synthetic contact. The leading tab in the display
/// name sorts it to the top of the friends list.
pub fn roster_item() -> String {
    format!(
        "<item jid='{jid}' name='&#9;{name}' subscription='both' puuid='{puuid}'>\
         <group priority='9999'>{group}</group>\
         <state>online</state>\
         <id name='{name}' tagline='...'/>\
         <lol name='&#9;{name}'/>\
         <platforms><riot name='{platform_name}' tagline='...'/></platforms>\
         </item>",
        jid = SYNTHETIC_JID,
        name = SYNTHETIC_NAME,
        platform_name = SYNTHETIC_PLATFORM_NAME,
        puuid = SYNTHETIC_PUUID,
        group = SYNTHETIC_GROUP,
    )
}

/// Splices [`roster_item`] right after the roster query marker.
///
/// This is a textual insert on raw bytes, not an XML edit, so the server's
/// bytes around it are preserved exactly (including a multi-byte character
/// cut by the chunk boundary). The marker is expected to appear once per
/// roster result; only the first occurrence is used. Returns `None` when the
/// chunk carries no marker.
pub fn splice_roster(chunk: &[u8]) -> Option<Vec<u8>> {
    let marker = ROSTER_MARKER.as_bytes();
    let at = chunk
        .windows(marker.len())
        .position(|window| window == marker)?
        + marker.len();
    let item = roster_item();
    let mut out = Vec::with_capacity(chunk.len() + item.len());
    out.extend_from_slice(&chunk[..at]);
    out.extend_from_slice(item.as_bytes());
    out.extend_from_slice(&chunk[at..]);
    Some(out)
}

/// Presence for the synthetic contact, online in every game.
pub fn synthetic_presence(version: Option<&str>) -> String {
    synthetic_presence_at(version, Utc::now().timestamp_millis(), Uuid::new_v4())
}

fn synthetic_presence_at(version: Option<&str>, millis: i64, id: Uuid) -> String {
    // The shooter client shows a version mismatch banner unless the party
    // client version matches its own.
    let version_json = serde_json::Value::from(version.unwrap_or(UNKNOWN_VERSION)).to_string();
    let shooter = base64::engine::general_purpose::STANDARD.encode(format!(
        "{{\"isValid\":true,\"partyId\":\"00000000-0000-0000-0000-000000000000\",\"partyClientVersion\":{},\"accountLevel\":1000}}",
        version_json
    ));

    format!(
        "<presence from='{from}' id='b-{id}'>\
         <games>\
         <keystone><st>chat</st><s.t>{t}</s.t><s.p>keystone</s.p></keystone>\
         <league_of_legends><st>chat</st><s.t>{t}</s.t><s.p>league_of_legends</s.p><p>{{&quot;pty&quot;:true}}</p></league_of_legends>\
         <valorant><st>chat</st><s.t>{t}</s.t><s.p>valorant</s.p><p>{shooter}</p></valorant>\
         <bacon><st>chat</st><s.t>{t}</s.t><s.l>bacon_availability_online</s.l><s.p>bacon</s.p></bacon>\
         </games>\
         <show>chat</show>\
         <platform>riot</platform>\
         </presence>",
        from = SYNTHETIC_FULL_JID,
        id = id,
        t = millis,
    )
}

/// One chat message from the synthetic contact.
pub fn chat_message(body: &str) -> String {
    chat_message_at(body, Utc::now(), Uuid::new_v4())
}

fn chat_message_at(body: &str, now: DateTime<Utc>, id: Uuid) -> String {
    // Stamped one second ahead: the client drops messages it considers
    // older than what it has already rendered.
    let stamp = (now + TimeDelta::seconds(1)).format("%Y-%m-%d %H:%M:%S%.3f");
    format!(
        "<message from='{from}' stamp='{stamp}' id='veil-{id}' type='chat'><body>{body}</body></message>",
        from = SYNTHETIC_FULL_JID,
        body = escape(body),
    )
}

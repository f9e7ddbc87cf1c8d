//! Fixed identity of the injected roster contact and the wire markers the
//! proxy keys on.
//!
//! The contact doubles as the in-band command channel: anything the client
//! addresses to [`SYNTHETIC_JID`] is consumed by the proxy and never reaches
//! the chat server.

/// Bare JID of the injected contact.
pub const SYNTHETIC_JID: &str = "41c322a1-b328-495b-a004-5ccd3e45eae8@eu1.pvp.net";

/// PUUID part of [`SYNTHETIC_JID`], repeated on the roster item.
pub const SYNTHETIC_PUUID: &str = "41c322a1-b328-495b-a004-5ccd3e45eae8";

/// Full JID used as the `from` of every synthetic stanza.
pub const SYNTHETIC_FULL_JID: &str = "41c322a1-b328-495b-a004-5ccd3e45eae8@eu1.pvp.net/RC-Veil";

/// Name shown in the friends list.
pub const SYNTHETIC_NAME: &str = "Veil Active!";

/// Name on the roster's platform entry, which carries no exclamation mark.
pub const SYNTHETIC_PLATFORM_NAME: &str = "Veil Active";

/// Roster group the contact is filed under.
pub const SYNTHETIC_GROUP: &str = "Veil";

/// Opening tag of the roster query in a server-to-client roster result. The
/// contact item is spliced in textually right after it.
pub const ROSTER_MARKER: &str = "<query xmlns='jabber:iq:riotgames:roster'>";

/// Cheap pre-check for client-to-server chunks that may carry presence.
pub const PRESENCE_HINT: &str = "<presence";

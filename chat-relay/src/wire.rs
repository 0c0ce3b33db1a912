//! Binary framing constants and message builders for the chat protocol.
//!
//! Every protocol frame opens with a fixed 7-byte preamble (6 magic bytes
//! plus a version byte) that disambiguates protocol traffic from arbitrary
//! data. The three control messages append a one-byte discriminator to the
//! preamble; NEWS instead appends the UTF-8 topic directly, so a subscriber
//! can filter broadcasts with a byte-exact prefix match and never has to
//! decode payloads it is not interested in.
//!
//! Multipart message shapes (one line per frame):
//!
//! ```text
//! HERE  = <empty> | HERE_FRAME
//! TALK  = <empty> | TALK_FRAME | json {"target", "details"}
//! LIST  = <routing prefix> | <empty> | LIST_FRAME | json {"stamp", "handles"}
//! NEWS  = PREAMBLE ++ topic  | json {"stamp", "sender", "details"}
//! ```
//!
//! HERE and TALK carry no identity frame of their own: the requester's
//! identity is supplied by the transport's routing layer on the control
//! channel. The LIST reply starts with that routing prefix, copied verbatim
//! from the request being answered. The byte layout and the JSON field names
//! are the compatibility surface; peers built against other runtimes match
//! them byte for byte.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Protocol version carried in every preamble.
pub const VERSION: u8 = 0x01;

/// Reserved literal naming the whole group; used as the public broadcast
/// topic, as the neutral sender of relay-originated news, and as the TALK
/// target meaning "everyone".
pub const GROUP_SENDER: &str = "$CHATZSRV";

/// 7-byte prefix opening every protocol frame: magic bytes plus [`VERSION`].
pub const PREAMBLE: [u8; 7] = [0x4D, 0x4F, 0x54, 0x41, 0x48, 0x43, VERSION];

/// Control frame announcing liveness.
pub const HERE_FRAME: [u8; 8] = [0x4D, 0x4F, 0x54, 0x41, 0x48, 0x43, VERSION, 0x01];

/// Control frame carrying a roster snapshot reply.
pub const LIST_FRAME: [u8; 8] = [0x4D, 0x4F, 0x54, 0x41, 0x48, 0x43, VERSION, 0x02];

/// Control frame carrying client content to relay.
pub const TALK_FRAME: [u8; 8] = [0x4D, 0x4F, 0x54, 0x41, 0x48, 0x43, VERSION, 0x03];

/// Body of a TALK request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TalkBody {
    pub target: String,
    pub details: String,
}

/// Body of a LIST reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListBody {
    pub stamp: DateTime<Utc>,
    pub handles: Vec<String>,
}

/// Body of a NEWS broadcast. `details` may be absent on the wire and then
/// reads back as the empty string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewsBody {
    pub stamp: DateTime<Utc>,
    pub sender: String,
    #[serde(default)]
    pub details: String,
}

/// Broadcast prefix for a given topic: [`PREAMBLE`] followed by the UTF-8
/// topic bytes. Public broadcasts use [`group_topic`]; private broadcasts
/// use the recipient's handle as the topic.
pub fn news_frame(topic: &str) -> Vec<u8> {
    let mut frame = PREAMBLE.to_vec();
    frame.extend_from_slice(topic.as_bytes());
    frame
}

/// Broadcast prefix for public news.
pub fn group_topic() -> Vec<u8> {
    news_frame(GROUP_SENDER)
}

/// HERE request: delimiter and control frame.
pub fn here_message() -> Vec<Vec<u8>> {
    vec![Vec::new(), HERE_FRAME.to_vec()]
}

/// TALK request: delimiter, control frame, and payload.
pub fn talk_message(target: &str, details: &str) -> serde_json::Result<Vec<Vec<u8>>> {
    let body = serde_json::to_vec(&TalkBody {
        target: target.to_owned(),
        details: details.to_owned(),
    })?;
    Ok(vec![Vec::new(), TALK_FRAME.to_vec(), body])
}

/// LIST reply: routing prefix (copied from the request being answered),
/// delimiter, control frame, and payload.
pub fn list_message(
    reply_to: &[u8],
    stamp: DateTime<Utc>,
    handles: &[String],
) -> serde_json::Result<Vec<Vec<u8>>> {
    let body = serde_json::to_vec(&ListBody {
        stamp,
        handles: handles.to_vec(),
    })?;
    Ok(vec![
        reply_to.to_vec(),
        Vec::new(),
        LIST_FRAME.to_vec(),
        body,
    ])
}

/// NEWS broadcast: topic prefix and payload.
pub fn news_message(
    topic: &str,
    stamp: DateTime<Utc>,
    sender: &str,
    details: &str,
) -> serde_json::Result<Vec<Vec<u8>>> {
    let body = serde_json::to_vec(&NewsBody {
        stamp,
        sender: sender.to_owned(),
        details: details.to_owned(),
    })?;
    Ok(vec![news_frame(topic), body])
}

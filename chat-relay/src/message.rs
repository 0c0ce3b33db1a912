//! Typed views of inbound frame sequences.
//!
//! [`ClientMessage::decode`] classifies what the relay receives on its
//! control endpoint; [`ServerMessage::decode`] classifies what a peer
//! receives on either of its channels. Both decide purely on the frame
//! count and frame contents, and both map anything that fails the
//! structural match to the `None` variant: malformed input is a warning
//! for the caller to log, never an error that crosses the decode boundary.

use chrono::{DateTime, Utc};

use crate::wire::{HERE_FRAME, LIST_FRAME, ListBody, NewsBody, PREAMBLE, TALK_FRAME, TalkBody};

/// A request the relay may receive from a client, as seen behind the
/// transport's routing layer (frame 0 is the routing identity).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ClientMessage {
    /// Malformed or absent message.
    None,
    /// Liveness ping; no payload.
    Here { sender: String },
    /// Content to relay, publicly or to one handle.
    Talk {
        sender: String,
        target: String,
        detail: String,
    },
}

impl ClientMessage {
    /// Classify an inbound control-channel frame sequence. Frame 0 is the
    /// routing identity supplied by the transport; the remaining frames are
    /// the payload as sent by the peer.
    pub fn decode(frames: &[Vec<u8>]) -> Self {
        match frames {
            [identity, delimiter, control]
                if delimiter.is_empty() && control.as_slice() == HERE_FRAME =>
            {
                match std::str::from_utf8(identity) {
                    Ok(sender) if !sender.is_empty() => ClientMessage::Here {
                        sender: sender.to_owned(),
                    },
                    _ => ClientMessage::None,
                }
            }
            [identity, delimiter, control, payload]
                if delimiter.is_empty() && control.as_slice() == TALK_FRAME =>
            {
                let Ok(sender) = std::str::from_utf8(identity) else {
                    return ClientMessage::None;
                };
                match serde_json::from_slice::<TalkBody>(payload) {
                    Ok(body) => ClientMessage::Talk {
                        sender: sender.to_owned(),
                        target: body.target,
                        detail: body.details,
                    },
                    Err(_) => ClientMessage::None,
                }
            }
            _ => ClientMessage::None,
        }
    }
}

/// A reply or broadcast a peer may receive from the relay.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ServerMessage {
    /// Malformed or absent message.
    None,
    /// Roster snapshot sent on the control channel.
    List {
        stamp: DateTime<Utc>,
        users: Vec<String>,
    },
    /// Broadcast received on the subscription channel. The topic is either
    /// the reserved group literal or the recipient handle used for private
    /// framing.
    News {
        topic: String,
        stamp: DateTime<Utc>,
        sender: String,
        detail: String,
    },
}

impl ServerMessage {
    /// Classify an inbound frame sequence on either peer channel.
    pub fn decode(frames: &[Vec<u8>]) -> Self {
        match frames {
            [delimiter, control, payload]
                if delimiter.is_empty() && control.as_slice() == LIST_FRAME =>
            {
                match serde_json::from_slice::<ListBody>(payload) {
                    Ok(body) => ServerMessage::List {
                        stamp: body.stamp,
                        users: body.handles,
                    },
                    Err(_) => ServerMessage::None,
                }
            }
            [prefix, payload] if prefix.starts_with(&PREAMBLE) => {
                let Ok(topic) = std::str::from_utf8(&prefix[PREAMBLE.len()..]) else {
                    return ServerMessage::None;
                };
                match serde_json::from_slice::<NewsBody>(payload) {
                    Ok(body) => ServerMessage::News {
                        topic: topic.to_owned(),
                        stamp: body.stamp,
                        sender: body.sender,
                        detail: body.details,
                    },
                    Err(_) => ServerMessage::None,
                }
            }
            _ => ServerMessage::None,
        }
    }
}

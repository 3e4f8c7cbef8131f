//! Server-pushed event catalog, fanned out by the gateway to every current
//! subscriber of a room. Shapes follow the client wire protocol, so field
//! names are camelCase on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Color, RoomId, SubscriberId, Winner};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockTimers {
    pub white: u64,
    pub black: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScorePair {
    pub white: u32,
    pub black: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomMeta {
    pub room_id: RoomId,
    pub stake: u128,
    pub time_budget_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEntry {
    pub sender: String,
    pub sender_short: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    StartGame {
        player_number: u8,
        color: Color,
        opponent: Option<String>,
        timers: ClockTimers,
        game_id: u64,
        meta: RoomMeta,
        chat_history: Vec<ChatEntry>,
    },
    MoveAccepted {
        #[serde(rename = "move")]
        mv: String,
        fen: String,
        pgn: String,
        turn: Color,
        player_num: u8,
    },
    MoveRejected {
        reason: String,
    },
    TimerUpdate {
        white: u64,
        black: u64,
    },
    DrawOffered,
    DrawDeclined,
    ChatMessage {
        sender: String,
        sender_short: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    OpponentDisconnected {
        message: String,
    },
    OpponentReconnected {
        message: String,
    },
    GameCancelled {
        reason: String,
    },
    GameEnded {
        winner: Winner,
        reason: String,
        pgn: String,
        game_id: u64,
        winner_address: Option<String>,
        scores: ScorePair,
        signature_white: Option<String>,
        signature_black: Option<String>,
    },
    Error {
        message: String,
    },
    Pong,
}

/// One addressed event produced by a room transition.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub to: SubscriberId,
    pub event: ServerEvent,
}

impl Outbound {
    #[must_use]
    pub fn new(to: SubscriberId, event: ServerEvent) -> Self {
        Self { to, event }
    }
}

/// Delivery port implemented by the gateway's subscriber hub. Rooms address
/// events by subscriber handle only; they never touch the transport.
pub trait EventSink: Send + Sync {
    fn deliver(&self, to: &SubscriberId, event: &ServerEvent);
}

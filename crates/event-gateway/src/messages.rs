//! Inbound client message catalog. The transport (a room-multiplexed
//! bidirectional channel) is external; whatever framing carries these,
//! they arrive as tagged JSON objects.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientRequest {
    CreateRoom {
        game_id: u64,
        stake: u128,
        wallet_address: String,
        /// Per-player clock in minutes; server default applies if absent.
        time_limit: Option<u64>,
    },
    JoinRoom {
        room_id: String,
        game_id: Option<u64>,
        wallet_address: String,
    },
    MakeMove {
        #[serde(rename = "move")]
        mv: String,
    },
    OfferDraw,
    AcceptDraw,
    DeclineDraw,
    Resign,
    ChatMessage {
        message: String,
    },
    Reconnect {
        wallet_address: String,
        signature: String,
    },
    ListRooms,
    FindRoomByGameId {
        game_id: u64,
    },
    GetRoomInfo {
        room_id: String,
    },
    CheckUsername {
        wallet_address: String,
    },
    SetUsername {
        wallet_address: String,
        username: String,
    },
    Ping,
}

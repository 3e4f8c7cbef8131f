pub mod events;
mod errors;
mod ids;
mod wallet;

pub use errors::RoomError;
pub use events::{ChatEntry, ClockTimers, EventSink, Outbound, RoomMeta, ScorePair, ServerEvent};
pub use ids::{RoomId, SubscriberId, TraceId};
pub use wallet::{AddressParseError, WalletAddress};

use serde::{Deserialize, Serialize};

/// Board color of a seated player. The room creator is always white.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    White,
    Black,
}

impl Color {
    #[must_use]
    pub fn opposite(self) -> Self {
        match self {
            Self::White => Self::Black,
            Self::Black => Self::White,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::White => "white",
            Self::Black => "black",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Winner {
    White,
    Black,
    Draw,
}

impl From<Color> for Winner {
    fn from(color: Color) -> Self {
        match color {
            Color::White => Self::White,
            Color::Black => Self::Black,
        }
    }
}

/// Why a room reached its terminal state. Rendered into client events and
/// kept stable so clients can switch on the text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    Checkmate,
    Stalemate,
    ThreefoldRepetition,
    InsufficientMaterial,
    FiftyMoveRule,
    Timeout,
    Resignation,
    Disconnect,
    MutualAgreement,
}

impl EndReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Checkmate => "checkmate",
            Self::Stalemate => "stalemate",
            Self::ThreefoldRepetition => "threefold repetition",
            Self::InsufficientMaterial => "insufficient material",
            Self::FiftyMoveRule => "fifty-move rule",
            Self::Timeout => "timeout",
            Self::Resignation => "resignation",
            Self::Disconnect => "disconnect",
            Self::MutualAgreement => "mutual agreement",
        }
    }
}

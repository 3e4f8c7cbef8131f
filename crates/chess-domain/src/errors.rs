use thiserror::Error;

/// Failures a room reports back on the ack of the originating request.
/// Broadcast-level outcomes (cancellation, forfeits) are events, not errors.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RoomError {
    #[error("wallet is not a participant in this room")]
    NotParticipant,
    #[error("not your turn")]
    NotYourTurn,
    #[error("illegal move")]
    IllegalMove,
    #[error("unrecognized move format")]
    InvalidMoveFormat,
    #[error("game is already over")]
    GameOver,
    #[error("game has not started yet")]
    NotStarted,
    #[error("room already has two players")]
    RoomFull,
    #[error("cannot join your own room")]
    SelfPlay,
    #[error("chat message rejected")]
    InvalidChatMessage,
}

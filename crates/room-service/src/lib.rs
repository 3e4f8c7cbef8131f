//! One match, one room. The state machine itself is pure and driven by
//! timestamps passed in from the outside; the actor wrapper owns the
//! mailbox and the 1 Hz tick, so every transition of a room is observed in
//! a total order.

mod actor;
mod state;

pub use actor::{RoomClosed, RoomCommand, RoomHandle, RoomRetired, spawn_room};
pub use state::{
    PlayerSeat, RoomInfo, RoomSettings, RoomSnapshot, RoomState, SeatInfo, Verdict,
};

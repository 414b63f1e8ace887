pub mod policy;
pub mod state_machine;

pub use state_machine::{
    CancelRef, Outcome, OrderAction, PositionCommand, PositionEvent, PositionStateMachine,
};

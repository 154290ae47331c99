//! Wire-level types for the Cable pub/sub channel protocol: frames,
//! subscription identifiers, and the snake_case naming policy used to
//! encode both.

mod frame;
mod identifier;
mod naming;

pub use frame::{FrameDecodeError, IncomingFrame, OutgoingCommand, OutgoingFrame};
pub use identifier::SubscriptionIdentifier;
pub use naming::to_snake_case;

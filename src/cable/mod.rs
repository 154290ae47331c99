//! The pub/sub channel client: a reconnecting, multiplexed WebSocket client
//! exposing one logical [`Subscription`] per server-side channel.

mod client;
mod error;
mod handle;
mod subscription;

pub use client::{CableClient, CableClientConfig};
pub use error::CableError;
pub use handle::{BackoffConfig, ClientState};
pub use subscription::{Acknowledge, AcknowledgeError, Subscription, SubscriptionState, WithMessageId};

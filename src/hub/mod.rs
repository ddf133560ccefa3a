//! Connection registry and broadcast engine for the whiteboard hub.
//!
//! One task per connection runs the receive loop; tasks share state only
//! through the [`ConnectionRegistry`].

mod registry;
mod server;

pub use registry::{ConnectionRegistry, OutboundSender};
pub use server::BroadcastHub;

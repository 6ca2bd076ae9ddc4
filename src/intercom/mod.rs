//! Inter-context messaging between the background service and front-ends.
//!
//! A channel carries newline-delimited JSON in both directions. The server
//! tracks every live channel, answers each request exactly once on the
//! channel it arrived on, and can broadcast to all channels. The client
//! correlates responses to requests by `reqId`.

pub mod channel;
pub mod client;
pub mod codec;
pub mod envelope;
pub mod server;

pub use channel::{ChannelHandle, ChannelId, ChannelRegistry, ChannelState};
pub use client::IntercomClient;
pub use envelope::{BroadcastEvent, RequestEnvelope, ServerMessage};
pub use server::{handler_fn, IntercomServer, RequestHandler};

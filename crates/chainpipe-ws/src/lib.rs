//! chainpipe-ws: resilient streaming subscription client.
//!
//! # Features
//! - Connect through an optional HTTP CONNECT proxy, bounded by a timeout
//! - Heartbeat pings and pong replies to server pings
//! - Auto-reconnect with capped exponential backoff
//! - Subscription registry re-issued after every reconnect
//! - Bounded concurrent dispatch of notifications to handlers
//! - JSON-RPC pubsub (Helius) and bare-JSON (PumpPortal) wire protocols

pub mod client;
pub mod endpoint;
pub mod error;
pub mod handler;
pub mod methods;
pub mod subscriptions;
pub mod transport;

pub use client::{ClientState, StreamClient, StreamConfig};
pub use endpoint::{Endpoint, WireProtocol};
pub use methods::BlockFilter;
pub use error::StreamError;
pub use handler::NotificationHandler;
pub use subscriptions::SubscriptionId;
pub use transport::{Connector, Frame, TungsteniteConnector};

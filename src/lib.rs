//! nul-relay: a readiness-driven text chat relay.
//!
//! A [`Broker`] accepts many endpoint connections and relays every line one
//! endpoint sends to all the others. An [`Endpoint`] is the client side of
//! one such connection. Both run on the caller's thread: the hosting
//! application waits on [`Broker::descriptor`] / [`Endpoint::descriptor`] (or
//! passes a timeout to `update`), then calls `update` to service whatever is
//! ready and drains decoded messages with `pop_next`.
//!
//! Lines travel as NUL-terminated frames; see [`protocol`].

pub mod broker;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod message;
pub mod protocol;
pub mod runtime;

pub use broker::Broker;
pub use config::{BrokerConfig, EndpointConfig, TomlConfig};
pub use endpoint::Endpoint;
pub use error::{ChatError, Result};
pub use message::{Message, MessageQueue};
pub use runtime::{ConnState, UpdateStatus};

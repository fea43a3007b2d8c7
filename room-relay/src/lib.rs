//! Room-scoped chat relay.
//!
//! Clients connect over TCP, authenticate with a bearer token, join one named
//! room at a time and exchange short messages with everyone in it. The
//! modules, from the wire inwards:
//!
//! - [`protocol`] defines the JSON line events and the async read/write helpers.
//! - [`server`] accepts connections and runs one session loop per socket.
//! - [`relay`] implements the protocol operations on top of a [`session::Session`].
//! - [`registry`] tracks room membership and fans events out in order.
//! - [`identity`] verifies bearer tokens; [`store`] persists messages.
//! - [`cli`], [`config`] and [`client`] make up the `room-relay` binary.

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod server;
pub mod session;
pub mod store;

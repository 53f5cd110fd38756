//! A connection-oriented messaging layer over an unreliable transport.
//!
//! `tidewire` picks up where [`tidewire_transport`] leaves off: given something that implements
//! `Transport`, it provides unreliable, notify (fire-and-forget with a delivered/lost callback),
//! and reliable (acked, retried, in-order-delivered-once) message delivery between a [`Client`]
//! and a [`Server`], built on a single-threaded, caller-driven event loop (`Peer::update`).
//!
//! The crate is organized the way the workspace as a whole is: `framing` and `sequencer` are the
//! wire-facing, stateless-ish building blocks; `pending` and `connection` turn those into a
//! per-peer state machine; `peer` drives that state machine off a clock and a transport; `client`
//! and `server` are the two orchestrators applications actually construct.

pub mod client;
pub mod config;
pub mod connection;
pub mod events;
pub mod framing;
pub mod metrics;
pub mod peer;
pub mod pending;
pub mod sequencer;
pub mod server;

pub use client::Client;
pub use config::PeerConfig;
pub use connection::Connection;
pub use events::{EventList, SubscriptionId};
pub use framing::ClassifiedFrame;
pub use metrics::ConnectionMetrics;
pub use peer::Peer;
pub use server::Server;

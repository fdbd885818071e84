//! # strand-transport
//!
//! Strand reliable-datagram endpoint.
//!
//! Layers ack-bitfield reliability signalling, packet fragmentation, and
//! RTT / loss / bandwidth telemetry over an unreliable datagram transport.
//! Delivery is neither ordered nor guaranteed: the endpoint tells the
//! application which packets arrived, and retransmission stays with the
//! application.
//!
//! ## Crate structure
//!
//! - [`wire`] — Header, fragment sub-header, trailer, sequence arithmetic
//! - [`window`] — Fixed-capacity sequence-indexed packet windows
//! - [`fragment`] — Payload splitting and reassembly
//! - [`ack`] — Receive history and ack-bitfield encoding
//! - [`stats`] — Exponentially smoothed RTT / loss / bandwidth estimators
//! - [`endpoint`] — The `ReliableEndpoint` facade and its receive loop
//! - [`transport`] — Transport trait and the blocking UDP implementation
//! - [`error`] — Error taxonomy

pub mod ack;
pub mod endpoint;
pub mod error;
pub mod fragment;
pub mod stats;
pub mod transport;
pub mod window;
pub mod wire;

//! # strand-sim
//!
//! Network-condition simulation for Strand integration testing.
//!
//! Provides [`transport::NetSimTransport`], a drop-in datagram transport
//! that injects packet loss, base latency, and jitter, delivering delayed
//! datagrams through a priority-scheduled sender worker. Impairments are
//! reconfigurable at runtime, so a single test can walk a link through
//! several conditions.
//!
//! ## Crate structure
//!
//! - [`impairment`] — The loss / latency / jitter parameter set
//! - [`transport`] — The impaired transport and its scheduler worker

pub mod impairment;
pub mod transport;

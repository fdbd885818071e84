//! # Reliable Endpoint
//!
//! Top-level facade tying the wire codec, sequence windows, fragmenter, ack
//! history, and telemetry estimators together over an unreliable datagram
//! transport. Peer-to-peer and symmetric: both sides send payloads, and
//! every outbound datagram piggybacks the sender's current ack state.
//!
//! The endpoint signals which packets arrived; it does not retransmit,
//! reorder, or pace. Retransmission policy belongs to the application.
//!
//! ## Lifecycle
//!
//! ```text
//!   Init ──start()──▶ Running ──stop()──▶ Stopped
//! ```
//!
//! `send` and `on_datagram` are rejected outside `Running`. `start` spawns
//! the receive loop; `stop` is idempotent and joins it, bounded by the
//! transport's read timeout. An unrecoverable send failure also moves the
//! endpoint to `Stopped`.
//!
//! ## Locking
//!
//! All protocol state sits behind one coarse mutex. The receive loop blocks
//! on the socket without the lock and acquires it only to process a
//! datagram; the delivery callback runs with the lock released so it may
//! call back into the endpoint.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use quanta::Instant;
use tracing::{debug, trace, warn};

use crate::ack::AckHistory;
use crate::error::{Error, Result};
use crate::fragment::{Fragmenter, ReassemblyTable};
use crate::stats::{NetworkStats, StatsEstimator, TickSample};
use crate::transport::Transport;
use crate::window::{SequenceWindow, Timestamped};
use crate::wire::{self, FragmentHeader, PacketKind, ACK_BITS};

/// Largest datagram the receive loop will accept.
const MAX_DATAGRAM_LEN: usize = 65_535;

// ─── Configuration ───────────────────────────────────────────────────────────

/// Endpoint configuration parameters.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Maximum reconstructed payload size in bytes.
    pub max_packet_size: usize,
    /// Payloads larger than this are fragmented on send.
    pub fragment_above: usize,
    /// Per-fragment payload size on send.
    pub fragment_size: usize,
    /// Hard cap on fragments per outbound payload.
    pub max_fragments: usize,
    /// Depth of the receive history folded into ack bitfields.
    pub ack_buffer_size: usize,
    /// Capacity of the sent-packet window.
    pub sent_buffer_size: usize,
    /// Capacity of the received-packet window.
    pub recv_buffer_size: usize,
    /// Smoothing factor for the RTT estimator.
    pub rtt_smoothing: f64,
    /// Smoothing factor for the loss estimator.
    pub loss_smoothing: f64,
    /// Smoothing factor for the bandwidth estimators.
    pub bandwidth_smoothing: f64,
    /// First sequence number to assign, as agreed during the handshake.
    pub initial_sequence: u16,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        EndpointConfig {
            max_packet_size: 1200,
            fragment_above: 1000,
            fragment_size: 500,
            max_fragments: 16,
            ack_buffer_size: 32,
            sent_buffer_size: 256,
            recv_buffer_size: 256,
            rtt_smoothing: 0.1,
            loss_smoothing: 0.1,
            bandwidth_smoothing: 0.1,
            initial_sequence: 0,
        }
    }
}

// ─── Packet Records ──────────────────────────────────────────────────────────

/// Sent-side record; lives in the sent window until acked or aged out.
struct SentRecord {
    /// Full un-fragmented payload, kept for application-level resends.
    payload: Bytes,
    send_time: Instant,
    size: u32,
    acked: bool,
}

impl Timestamped for SentRecord {
    fn timestamp(&self) -> Instant {
        self.send_time
    }
}

/// Received-side record; feeds the inbound bandwidth estimator.
struct ReceivedRecord {
    receive_time: Instant,
    size: u32,
}

impl Timestamped for ReceivedRecord {
    fn timestamp(&self) -> Instant {
        self.receive_time
    }
}

// ─── Run State ───────────────────────────────────────────────────────────────

const STATE_INIT: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPED: u8 = 2;

// ─── Shared State ────────────────────────────────────────────────────────────

/// The delivery callback: return `true` to accept and acknowledge the
/// payload, `false` to drop it without acking. Runs on the receive thread.
pub type PacketCallback = dyn Fn(&[u8]) -> bool + Send + Sync;

/// Everything mutated by the protocol, guarded by the coarse mutex.
struct EndpointState {
    next_sequence: u16,
    sent: SequenceWindow<SentRecord>,
    received: SequenceWindow<ReceivedRecord>,
    ack_history: AckHistory,
    fragments: ReassemblyTable,
    stats: StatsEstimator,
}

struct Shared {
    config: EndpointConfig,
    peer: SocketAddr,
    transport: Arc<dyn Transport>,
    callback: Box<PacketCallback>,
    fragmenter: Fragmenter,
    state: Mutex<EndpointState>,
    run_state: AtomicU8,
}

// ─── Endpoint ────────────────────────────────────────────────────────────────

/// A reliable-datagram endpoint bound to one remote peer.
pub struct ReliableEndpoint {
    shared: Arc<Shared>,
    recv_thread: Option<JoinHandle<()>>,
}

impl ReliableEndpoint {
    /// Create an endpoint speaking to `peer` over `transport`, delivering
    /// accepted payloads through `callback`.
    pub fn new<F>(
        transport: Arc<dyn Transport>,
        peer: SocketAddr,
        config: EndpointConfig,
        callback: F,
    ) -> Self
    where
        F: Fn(&[u8]) -> bool + Send + Sync + 'static,
    {
        let now = Instant::now();
        let state = EndpointState {
            next_sequence: config.initial_sequence,
            sent: SequenceWindow::new(config.sent_buffer_size),
            received: SequenceWindow::new(config.recv_buffer_size),
            ack_history: AckHistory::new(config.ack_buffer_size),
            fragments: ReassemblyTable::new(config.max_packet_size),
            stats: StatsEstimator::new(
                config.rtt_smoothing,
                config.loss_smoothing,
                config.bandwidth_smoothing,
                now,
            ),
        };
        let fragmenter = Fragmenter::new(config.fragment_size, config.max_fragments);
        ReliableEndpoint {
            shared: Arc::new(Shared {
                config,
                peer,
                transport,
                callback: Box::new(callback),
                fragmenter,
                state: Mutex::new(state),
                run_state: AtomicU8::new(STATE_INIT),
            }),
            recv_thread: None,
        }
    }

    /// Transition `Init → Running` and spawn the receive loop. Idempotent
    /// while running; a stopped endpoint cannot be restarted.
    pub fn start(&mut self) -> Result<()> {
        match self.shared.run_state.compare_exchange(
            STATE_INIT,
            STATE_RUNNING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {}
            Err(STATE_RUNNING) => return Ok(()),
            Err(_) => return Err(Error::NotRunning),
        }

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("strand-recv".into())
            .spawn(move || shared.recv_loop())
            .map_err(Error::Transport)?;
        self.recv_thread = Some(handle);
        debug!(peer = %self.shared.peer, "endpoint started");
        Ok(())
    }

    /// Signal the receive loop to exit, join it, and release the transport.
    /// Idempotent; the join is bounded by the transport's read timeout.
    pub fn stop(&mut self) {
        let prev = self.shared.run_state.swap(STATE_STOPPED, Ordering::SeqCst);
        if let Some(handle) = self.recv_thread.take() {
            if handle.join().is_err() {
                warn!("receive loop panicked during shutdown");
            }
        }
        if prev != STATE_STOPPED {
            self.shared.transport.close();
            debug!(peer = %self.shared.peer, "endpoint stopped");
        }
    }

    /// Send one payload to the peer, fragmenting if it exceeds the
    /// configured threshold. Returns the sequence number assigned.
    pub fn send(&self, payload: &[u8]) -> Result<u16> {
        self.shared.send(payload)
    }

    /// Process one raw inbound datagram.
    ///
    /// Malformed datagrams, mismatched fragments, and oversized
    /// reconstructions are recovered locally (logged and counted); the only
    /// surfaced error is `NotRunning`.
    pub fn on_datagram(&self, datagram: &[u8]) -> Result<()> {
        self.shared.ensure_running()?;
        self.shared.process_datagram(datagram);
        Ok(())
    }

    /// Refresh the loss and bandwidth estimators and garbage-collect stale
    /// fragment assemblies and window records.
    pub fn update(&self) {
        self.shared.update();
    }

    /// Snapshot the endpoint's network statistics.
    pub fn get_stats(&self) -> NetworkStats {
        self.shared.lock_state().stats.snapshot()
    }

    /// The remote peer this endpoint speaks to.
    pub fn peer(&self) -> SocketAddr {
        self.shared.peer
    }

    /// Whether a sent packet still held in the sent window has been
    /// acknowledged by the peer.
    pub fn is_acked(&self, sequence: u16) -> bool {
        self.shared
            .lock_state()
            .sent
            .get(sequence)
            .is_some_and(|record| record.acked)
    }

    /// The payload of a sent packet still held in the sent window.
    /// Retransmission stays with the application; this is what it resends.
    pub fn sent_payload(&self, sequence: u16) -> Option<Bytes> {
        self.shared
            .lock_state()
            .sent
            .get(sequence)
            .map(|record| record.payload.clone())
    }

    /// Whether the endpoint is in the `Running` state.
    pub fn is_running(&self) -> bool {
        self.shared.run_state.load(Ordering::SeqCst) == STATE_RUNNING
    }
}

impl Drop for ReliableEndpoint {
    fn drop(&mut self) {
        self.stop();
    }
}

// ─── Protocol Logic ──────────────────────────────────────────────────────────

impl Shared {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, EndpointState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.run_state.load(Ordering::SeqCst) == STATE_RUNNING {
            Ok(())
        } else {
            Err(Error::NotRunning)
        }
    }

    fn send(&self, payload: &[u8]) -> Result<u16> {
        self.ensure_running()?;
        if payload.is_empty() {
            return Err(Error::EmptyPayload);
        }
        if payload.len() > self.config.max_packet_size {
            return Err(Error::PayloadTooLarge {
                len: payload.len(),
                max: self.config.max_packet_size,
            });
        }

        let payload = Bytes::copy_from_slice(payload);
        let parts = if payload.len() > self.config.fragment_above {
            Some(self.fragmenter.split(&payload)?)
        } else {
            None
        };

        let now = Instant::now();
        let (sequence, ack, ack_bits) = {
            let mut state = self.lock_state();
            let sequence = state.next_sequence;
            state.next_sequence = sequence.wrapping_add(1);
            let (ack, ack_bits) = state.ack_history.encode();
            // One record per payload; fragments share it.
            state.sent.insert(
                sequence,
                SentRecord {
                    payload: payload.clone(),
                    send_time: now,
                    size: payload.len() as u32,
                    acked: false,
                },
            );
            state.stats.on_packet_sent();
            (sequence, ack, ack_bits)
        };

        match &parts {
            None => {
                self.transmit(&wire::encode_single(sequence, ack, ack_bits, &payload))?;
                trace!(sequence, bytes = payload.len(), "sent");
            }
            Some(parts) => {
                let total = parts.len() as u8;
                for (id, part) in parts.iter().enumerate() {
                    self.transmit(&wire::encode_fragment(
                        sequence, ack, ack_bits, id as u8, total, part,
                    ))?;
                }
                trace!(sequence, bytes = payload.len(), fragments = total, "sent");
            }
        }
        Ok(sequence)
    }

    /// Ship one datagram to the peer. A socket failure here is
    /// unrecoverable: the endpoint transitions to `Stopped`.
    fn transmit(&self, datagram: &[u8]) -> Result<()> {
        match self.transport.send_to(datagram, self.peer) {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(error = %e, "transport send failed; stopping endpoint");
                self.run_state.store(STATE_STOPPED, Ordering::SeqCst);
                Err(Error::Transport(e))
            }
        }
    }

    fn process_datagram(&self, datagram: &[u8]) {
        let now = Instant::now();
        let parsed = match wire::decode(datagram) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(error = %e, len = datagram.len(), "discarding malformed datagram");
                self.lock_state().stats.on_malformed();
                return;
            }
        };
        let header = parsed.header;

        match header.kind {
            PacketKind::Single => self.deliver(header.sequence, parsed.body, now),
            PacketKind::Fragment => {
                let mut body = parsed.body;
                let sub = match FragmentHeader::decode(&mut body) {
                    Ok(sub) => sub,
                    Err(e) => {
                        debug!(error = %e, "discarding malformed fragment datagram");
                        self.lock_state().stats.on_malformed();
                        return;
                    }
                };
                let completed = {
                    let mut state = self.lock_state();
                    match state.fragments.insert_fragment(header.sequence, sub, body, now) {
                        Ok(completed) => completed,
                        Err(e) => {
                            debug!(error = %e, "dropping fragment assembly");
                            None
                        }
                    }
                };
                if let Some(payload) = completed {
                    self.deliver(header.sequence, payload, now);
                }
            }
        }

        self.process_acks(header.ack, header.ack_bits, now);
    }

    /// Hand a complete payload to the application; record and ack it only
    /// when accepted. The callback runs without the state lock held.
    fn deliver(&self, sequence: u16, payload: Bytes, now: Instant) {
        if payload.len() > self.config.max_packet_size {
            debug!(
                sequence,
                len = payload.len(),
                "dropping payload beyond maximum packet size"
            );
            return;
        }
        if !(self.callback)(&payload) {
            trace!(sequence, "payload rejected by callback");
            return;
        }
        let mut state = self.lock_state();
        state.received.insert(
            sequence,
            ReceivedRecord {
                receive_time: now,
                size: payload.len() as u32,
            },
        );
        state.ack_history.push(sequence);
        state.stats.on_packet_received();
    }

    /// Walk the remote ack bitfield, marking sent records and feeding the
    /// RTT estimator for every newly confirmed sequence.
    fn process_acks(&self, ack: u16, ack_bits: u32, now: Instant) {
        if ack_bits == 0 {
            return;
        }
        let mut state = self.lock_state();
        let EndpointState { sent, stats, .. } = &mut *state;
        for distance in 0..ACK_BITS {
            if ack_bits & (1 << distance) == 0 {
                continue;
            }
            let sequence = ack.wrapping_sub(distance);
            if let Some(record) = sent.get_mut(sequence) {
                if !record.acked {
                    record.acked = true;
                    let rtt = now.saturating_duration_since(record.send_time);
                    stats.record_rtt(rtt);
                    stats.on_packet_acked();
                    trace!(sequence, ?rtt, "packet acknowledged");
                }
            }
        }
    }

    fn update(&self) {
        let now = Instant::now();
        let mut state = self.lock_state();
        let rtt = state.stats.rtt();
        let dt = state.stats.elapsed_window(now);

        let mut matured = 0u64;
        let mut matured_acked = 0u64;
        let mut sent_bytes = 0u64;
        let mut acked_bytes = 0u64;
        for (_, record) in state.sent.iter_live() {
            let age = now.saturating_duration_since(record.send_time);
            // Only packets old enough to have been acked count for loss.
            if age >= rtt {
                matured += 1;
                if record.acked {
                    matured_acked += 1;
                }
            }
            if age <= dt {
                sent_bytes += u64::from(record.size);
            }
            if record.acked && age <= dt + rtt {
                acked_bytes += u64::from(record.size);
            }
        }
        let mut received_bytes = 0u64;
        for (_, record) in state.received.iter_live() {
            if now.saturating_duration_since(record.receive_time) <= dt {
                received_bytes += u64::from(record.size);
            }
        }
        let loss = if matured == 0 {
            0.0
        } else {
            1.0 - matured_acked as f64 / matured as f64
        };

        state.stats.apply(
            now,
            dt,
            TickSample {
                loss,
                sent_bytes,
                received_bytes,
                acked_bytes,
            },
        );

        let timeout = (rtt * 4).max(Duration::from_secs(1));
        state.fragments.gc(now, timeout);
        state.sent.clear_older_than(now, timeout);
        state.received.clear_older_than(now, timeout);
    }

    fn recv_loop(&self) {
        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
        debug!("receive loop started");
        while self.run_state.load(Ordering::SeqCst) == STATE_RUNNING {
            match self.transport.recv_from(&mut buf) {
                Ok(None) => {} // read timeout; re-check the run state
                Ok(Some((len, from))) => {
                    if from != self.peer {
                        trace!(%from, "ignoring datagram from unexpected source");
                        continue;
                    }
                    self.process_datagram(&buf[..len]);
                }
                Err(e) => warn!(error = %e, "datagram receive failed"),
            }
        }
        debug!("receive loop exited");
    }
}

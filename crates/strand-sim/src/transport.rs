//! # Impaired Transport
//!
//! A datagram transport wrapper that emulates real-world network
//! conditions: probabilistic loss, base latency, and jitter.
//!
//! Delayed datagrams are handed to a dedicated sender worker owning the
//! socket's outbound side. The worker drains a multi-producer inbox into a
//! min-heap keyed by scheduled transmission time and ships entries as they
//! come due, so delivery order follows scheduled time rather than submission
//! order. Datagrams whose total delay falls under [`MIN_LATENCY`] skip the
//! worker and go out inline on the calling thread.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use arc_swap::ArcSwap;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use quanta::Instant;
use rand::RngExt;
use tracing::{debug, trace, warn};

use strand_transport::transport::Transport;

use crate::impairment::Impairment;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Delays below this threshold are transmitted inline on the calling thread
/// rather than scheduled; the scheduler cannot hit sub-millisecond deadlines
/// reliably anyway.
pub const MIN_LATENCY: Duration = Duration::from_micros(1500);

/// The worker polls its cooperative stop flag every this many iterations.
const STOP_CHECK_INTERVAL: u32 = 100;

/// Longest the worker parks waiting for inbox traffic or the next deadline.
const MAX_PARK: Duration = Duration::from_millis(5);

// ─── Scheduled Entry ─────────────────────────────────────────────────────────

struct Scheduled {
    due: Instant,
    /// Submission counter; makes the heap order total.
    order: u64,
    data: Vec<u8>,
    dest: SocketAddr,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.order == other.order
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.due
            .cmp(&other.due)
            .then_with(|| self.order.cmp(&other.order))
    }
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// UDP transport with simulated loss, latency, and jitter.
///
/// Implements [`Transport`], so an endpoint can run over it unchanged.
/// Impairments start out pristine and can be adjusted at any time.
pub struct NetSimTransport {
    socket: Arc<UdpSocket>,
    impairment: ArcSwap<Impairment>,
    inbox: Mutex<Option<Sender<Scheduled>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stop: Arc<AtomicBool>,
    idle: Arc<AtomicBool>,
    submissions: AtomicU64,
}

fn unpoisoned<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl NetSimTransport {
    /// Bind a socket, arm its read timeout, and spawn the sender worker.
    pub fn bind(addr: impl ToSocketAddrs, read_timeout: Duration) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr)?);
        socket.set_read_timeout(Some(read_timeout))?;

        let (tx, rx) = crossbeam_channel::unbounded();
        let stop = Arc::new(AtomicBool::new(false));
        let idle = Arc::new(AtomicBool::new(true));

        let worker = thread::Builder::new().name("strand-netsim".into()).spawn({
            let socket = Arc::clone(&socket);
            let stop = Arc::clone(&stop);
            let idle = Arc::clone(&idle);
            move || scheduler_loop(&socket, &rx, &stop, &idle)
        })?;

        Ok(NetSimTransport {
            socket,
            impairment: ArcSwap::from_pointee(Impairment::pristine()),
            inbox: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            stop,
            idle,
            submissions: AtomicU64::new(0),
        })
    }

    /// Current impairment parameters.
    pub fn impairment(&self) -> Impairment {
        (**self.impairment.load()).clone()
    }

    /// Replace all impairment parameters at once.
    pub fn set_impairment(&self, impairment: Impairment) {
        impairment.validate();
        self.impairment.store(Arc::new(impairment));
    }

    /// Set the drop probability. Panics outside `[0, 1]`.
    pub fn set_loss_rate(&self, loss_rate: f64) {
        let mut imp = self.impairment();
        imp.loss_rate = loss_rate;
        self.set_impairment(imp);
    }

    /// Set the fixed one-way delay.
    pub fn set_base_latency(&self, base_latency: Duration) {
        let mut imp = self.impairment();
        imp.base_latency = base_latency;
        self.set_impairment(imp);
    }

    /// Set the jitter bound.
    pub fn set_jitter(&self, jitter: Duration) {
        let mut imp = self.impairment();
        imp.jitter = jitter;
        self.set_impairment(imp);
    }

    /// Whether the scheduler has flushed everything handed to it. Inline
    /// transmissions never touch the scheduler.
    pub fn scheduler_idle(&self) -> bool {
        self.idle.load(Ordering::Acquire)
    }

    /// Transmit with an extra caller-specified delay on top of the
    /// configured impairments.
    pub fn send_to_after(
        &self,
        data: &[u8],
        dest: SocketAddr,
        extra_delay: Duration,
    ) -> io::Result<usize> {
        self.transmit(data, dest, extra_delay)
    }

    fn transmit(&self, data: &[u8], dest: SocketAddr, extra_delay: Duration) -> io::Result<usize> {
        let imp = self.impairment.load();
        let mut rng = rand::rng();

        // The caller stays blind to simulated loss: report success anyway.
        if rng.random::<f64>() <= imp.loss_rate {
            trace!(bytes = data.len(), "datagram dropped by simulated loss");
            return Ok(data.len());
        }

        let jitter = if imp.jitter.is_zero() {
            Duration::ZERO
        } else {
            imp.jitter.mul_f64(rng.random::<f64>())
        };
        let delay = imp.base_latency + jitter + extra_delay;

        if delay < MIN_LATENCY {
            return self.socket.send_to(data, dest);
        }

        let entry = Scheduled {
            due: Instant::now() + delay,
            order: self.submissions.fetch_add(1, Ordering::Relaxed),
            data: data.to_vec(),
            dest,
        };
        self.idle.store(false, Ordering::Release);
        let queued = match unpoisoned(&self.inbox).as_ref() {
            Some(tx) => tx.send(entry).is_ok(),
            None => false,
        };
        if !queued {
            warn!("scheduler unavailable; delayed datagram discarded");
        }
        Ok(data.len())
    }
}

impl Transport for NetSimTransport {
    fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.transmit(data, addr, Duration::ZERO)
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.socket.recv_from(buf) {
            Ok((len, from)) => Ok(Some((len, from))),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Stop the sender worker and join it; pending scheduled datagrams are
    /// discarded. Idempotent.
    fn close(&self) {
        self.stop.store(true, Ordering::Release);
        *unpoisoned(&self.inbox) = None;
        if let Some(handle) = unpoisoned(&self.worker).take() {
            if handle.join().is_err() {
                warn!("scheduler worker panicked");
            }
        }
    }
}

impl Drop for NetSimTransport {
    fn drop(&mut self) {
        self.close();
    }
}

// ─── Scheduler Worker ────────────────────────────────────────────────────────

fn scheduler_loop(
    socket: &UdpSocket,
    inbox: &Receiver<Scheduled>,
    stop: &AtomicBool,
    idle: &AtomicBool,
) {
    let mut heap: BinaryHeap<Reverse<Scheduled>> = BinaryHeap::new();
    let mut iterations: u32 = 0;
    debug!("scheduler worker started");

    loop {
        iterations = iterations.wrapping_add(1);
        if iterations % STOP_CHECK_INTERVAL == 0 && stop.load(Ordering::Acquire) {
            break;
        }

        // Drain the inbox into the heap.
        let mut pushed = false;
        loop {
            match inbox.try_recv() {
                Ok(entry) => {
                    heap.push(Reverse(entry));
                    pushed = true;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    debug!("inbox closed; scheduler worker exiting");
                    return;
                }
            }
        }

        // Ship everything that has come due.
        let now = Instant::now();
        loop {
            match heap.peek() {
                Some(Reverse(head)) if head.due <= now => {}
                _ => break,
            }
            if let Some(Reverse(entry)) = heap.pop() {
                if let Err(e) = socket.send_to(&entry.data, entry.dest) {
                    warn!(error = %e, dest = %entry.dest, "scheduled send failed");
                }
            }
        }

        if heap.is_empty() && !pushed {
            idle.store(true, Ordering::Release);
        }

        // Park until the next deadline or more inbox traffic.
        let park = match heap.peek() {
            Some(Reverse(head)) => head.due.saturating_duration_since(now).min(MAX_PARK),
            None => MAX_PARK,
        };
        if park.is_zero() {
            continue;
        }
        match inbox.recv_timeout(park) {
            Ok(entry) => heap.push(Reverse(entry)),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                debug!("inbox closed; scheduler worker exiting");
                return;
            }
        }
    }

    debug!(
        pending = heap.len(),
        "scheduler worker stopped; pending datagrams discarded"
    );
}

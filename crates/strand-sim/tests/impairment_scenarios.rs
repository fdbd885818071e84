//! Scenarios exercising the simulator against real loopback sockets, plus a
//! full endpoint exchange running over the impaired transport.

use std::net::UdpSocket;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use quanta::Instant;

use strand_sim::transport::NetSimTransport;
use strand_transport::endpoint::{EndpointConfig, ReliableEndpoint};
use strand_transport::transport::Transport;

// ─── Helpers ────────────────────────────────────────────────────────────────

/// Installs an env-filter tracing subscriber once, so `RUST_LOG` can expose
/// scheduler internals when a scenario misbehaves.
fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_thread_names(true)
            .compact()
            .try_init();
    });
}

fn bind_sim() -> NetSimTransport {
    init_tracing();
    NetSimTransport::bind("127.0.0.1:0", Duration::from_millis(20)).unwrap()
}

/// Plain receiver socket with a draining thread; counts datagrams until the
/// line goes quiet.
fn spawn_counter(socket: UdpSocket) -> thread::JoinHandle<usize> {
    socket
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();
    thread::spawn(move || {
        let mut buf = [0u8; 2048];
        let mut count = 0;
        let mut quiet = 0;
        while quiet < 2 {
            match socket.recv_from(&mut buf) {
                Ok(_) => {
                    count += 1;
                    quiet = 0;
                }
                Err(_) => quiet += 1,
            }
        }
        count
    })
}

fn wait_for<F: Fn() -> bool>(what: &str, deadline: Duration, condition: F) {
    let start = Instant::now();
    while !condition() {
        assert!(start.elapsed() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

// ─── S5: Loss Simulation ────────────────────────────────────────────────────

#[test]
fn total_loss_delivers_nothing() {
    let sim = bind_sim();
    sim.set_loss_rate(1.0);

    let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
    let dest = receiver.local_addr().unwrap();
    let counter = spawn_counter(receiver);

    for _ in 0..10 {
        assert_eq!(sim.send_to(b"doomed", dest).unwrap(), 6);
    }

    assert_eq!(counter.join().unwrap(), 0);
}

#[test]
fn half_loss_delivers_roughly_half() {
    let sim = bind_sim();
    sim.set_loss_rate(0.5);

    let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
    let dest = receiver.local_addr().unwrap();
    let counter = spawn_counter(receiver);

    for i in 0..1000 {
        sim.send_to(b"coin toss", dest).unwrap();
        if i % 50 == 0 {
            // Give the drain thread room; loopback receive buffers are small.
            thread::sleep(Duration::from_millis(1));
        }
    }

    let received = counter.join().unwrap();
    assert!(
        (440..=560).contains(&received),
        "received {received} of 1000 at 50% loss"
    );
}

// ─── Latency & Ordering ─────────────────────────────────────────────────────

#[test]
fn base_latency_delays_delivery() {
    let sim = bind_sim();
    sim.set_base_latency(Duration::from_millis(40));

    let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
    receiver
        .set_read_timeout(Some(Duration::from_millis(500)))
        .unwrap();
    let dest = receiver.local_addr().unwrap();

    let sent_at = Instant::now();
    sim.send_to(b"delayed", dest).unwrap();

    let mut buf = [0u8; 64];
    receiver.recv_from(&mut buf).unwrap();
    let elapsed = sent_at.elapsed();
    assert!(
        elapsed >= Duration::from_millis(35),
        "arrived after only {elapsed:?}"
    );
}

#[test]
fn jitter_stays_within_the_configured_band() {
    let sim = bind_sim();
    sim.set_base_latency(Duration::from_millis(20));
    sim.set_jitter(Duration::from_millis(40));

    let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
    receiver
        .set_read_timeout(Some(Duration::from_millis(500)))
        .unwrap();
    let dest = receiver.local_addr().unwrap();

    let sent_at = Instant::now();
    for _ in 0..20 {
        sim.send_to(b"jittery", dest).unwrap();
    }

    let mut buf = [0u8; 64];
    for _ in 0..20 {
        receiver.recv_from(&mut buf).expect("datagram lost");
    }
    let elapsed = sent_at.elapsed();
    assert!(elapsed >= Duration::from_millis(15), "jitter cannot undercut base latency");
    assert!(elapsed < Duration::from_millis(500), "band is bounded");
}

#[test]
fn delivery_follows_scheduled_time_not_submission_order() {
    let sim = bind_sim();

    let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
    receiver
        .set_read_timeout(Some(Duration::from_millis(500)))
        .unwrap();
    let dest = receiver.local_addr().unwrap();

    sim.send_to_after(b"third", dest, Duration::from_millis(90))
        .unwrap();
    sim.send_to_after(b"first", dest, Duration::from_millis(20))
        .unwrap();
    sim.send_to_after(b"second", dest, Duration::from_millis(55))
        .unwrap();

    let mut arrivals = Vec::new();
    let mut buf = [0u8; 64];
    for _ in 0..3 {
        let (len, _) = receiver.recv_from(&mut buf).unwrap();
        arrivals.push(buf[..len].to_vec());
    }
    assert_eq!(arrivals[0], b"first");
    assert_eq!(arrivals[1], b"second");
    assert_eq!(arrivals[2], b"third");
}

#[test]
fn scheduler_reports_idle_after_flush() {
    let sim = bind_sim();
    sim.set_base_latency(Duration::from_millis(25));

    let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
    let dest = receiver.local_addr().unwrap();
    let counter = spawn_counter(receiver);

    for _ in 0..5 {
        sim.send_to(b"queued", dest).unwrap();
    }
    assert!(!sim.scheduler_idle(), "scheduled work must clear the flag");

    wait_for("scheduler flush", Duration::from_secs(2), || {
        sim.scheduler_idle()
    });
    assert_eq!(counter.join().unwrap(), 5);
}

// ─── Endpoints Over the Simulator ───────────────────────────────────────────

#[test]
fn endpoints_exchange_over_an_impaired_link() {
    let ta = Arc::new(bind_sim());
    let tb = Arc::new(bind_sim());
    ta.set_base_latency(Duration::from_millis(10));
    tb.set_base_latency(Duration::from_millis(10));

    let addr_a = ta.local_addr().unwrap();
    let addr_b = tb.local_addr().unwrap();

    let a_inbox: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let b_inbox: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));

    let mut a = {
        let inbox = Arc::clone(&a_inbox);
        ReliableEndpoint::new(
            Arc::clone(&ta) as Arc<dyn Transport>,
            addr_b,
            EndpointConfig::default(),
            move |payload| {
                inbox.lock().unwrap().push(payload.to_vec());
                true
            },
        )
    };
    let mut b = {
        let inbox = Arc::clone(&b_inbox);
        ReliableEndpoint::new(
            Arc::clone(&tb) as Arc<dyn Transport>,
            addr_a,
            EndpointConfig::default(),
            move |payload| {
                inbox.lock().unwrap().push(payload.to_vec());
                true
            },
        )
    };
    a.start().unwrap();
    b.start().unwrap();

    a.send(b"over the wire").unwrap();
    wait_for("delivery to B", Duration::from_secs(2), || {
        !b_inbox.lock().unwrap().is_empty()
    });
    assert_eq!(b_inbox.lock().unwrap()[0], b"over the wire");

    // B's reply carries the ack that completes A's RTT measurement.
    b.send(b"roger").unwrap();
    wait_for("ack back to A", Duration::from_secs(2), || {
        a.get_stats().packets_acked == 1
    });

    let stats = a.get_stats();
    assert!(stats.rtt > 0.0);
    assert_eq!(a_inbox.lock().unwrap()[0], b"roger");

    a.stop();
    b.stop();
}

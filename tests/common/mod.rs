#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use pinwire::gpio::{StateChangeEvent, StateChangeSink};
use pinwire::packet::{self, Command, FRAME_SIZE, Packet};

type Reply = Arc<dyn Fn(&Packet) -> i32 + Send + Sync>;

/// Loopback stand-in for a pigpio daemon. Every request is answered with the
/// same command and parameters, `p3` taken from the reply closure.
pub struct FakeDaemon {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<Packet>>>,
    notify_streams: Arc<Mutex<Vec<TcpStream>>>,
    live_notify: Arc<AtomicUsize>,
    live_at_close: Arc<Mutex<Vec<usize>>>,
}

impl FakeDaemon {
    pub fn spawn(reply: impl Fn(&Packet) -> i32 + Send + Sync + 'static) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind fake daemon");
        let addr = listener.local_addr().expect("fake daemon address");
        let requests = Arc::new(Mutex::new(Vec::new()));
        let notify_streams = Arc::new(Mutex::new(Vec::new()));
        let live_notify = Arc::new(AtomicUsize::new(0));
        let live_at_close = Arc::new(Mutex::new(Vec::new()));
        let state = Served {
            reply: Arc::new(reply),
            requests: requests.clone(),
            notify: notify_streams.clone(),
            live_notify: live_notify.clone(),
            live_at_close: live_at_close.clone(),
        };

        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let state = state.clone();
                thread::spawn(move || serve(stream, state));
            }
        });

        Self {
            addr,
            requests,
            notify_streams,
            live_notify,
            live_at_close,
        }
    }

    pub fn requests(&self) -> Vec<Packet> {
        self.requests.lock().clone()
    }

    pub fn saw(&self, command: Command) -> Vec<Packet> {
        self.requests()
            .into_iter()
            .filter(|p| p.command == command)
            .collect()
    }

    /// Push one level report to every open notification stream.
    pub fn report(&self, flags: u16, levels: u32) {
        let mut raw = [0u8; 12];
        raw[2..4].copy_from_slice(&flags.to_le_bytes());
        raw[8..12].copy_from_slice(&levels.to_le_bytes());
        for stream in self.notify_streams.lock().iter_mut() {
            let _ = stream.write_all(&raw);
        }
    }

    pub fn notify_stream_count(&self) -> usize {
        self.notify_streams.lock().len()
    }

    /// Notification connections the client has not closed yet.
    pub fn live_notify_streams(&self) -> usize {
        self.live_notify.load(Ordering::SeqCst)
    }

    /// Live notification connections at the time each `NC` arrived.
    pub fn live_at_close(&self) -> Vec<usize> {
        self.live_at_close.lock().clone()
    }
}

#[derive(Clone)]
struct Served {
    reply: Reply,
    requests: Arc<Mutex<Vec<Packet>>>,
    notify: Arc<Mutex<Vec<TcpStream>>>,
    live_notify: Arc<AtomicUsize>,
    live_at_close: Arc<Mutex<Vec<usize>>>,
}

fn serve(mut stream: TcpStream, state: Served) {
    let mut frame = [0u8; FRAME_SIZE];
    while stream.read_exact(&mut frame).is_ok() {
        let Ok(request) = packet::decode(&frame) else { break };
        state.requests.lock().push(request);

        if request.command == Command::NotifyClose {
            let live = state.live_notify.load(Ordering::SeqCst);
            state.live_at_close.lock().push(live);
        }
        let is_notify = request.command == Command::NotifyOpenInBand;
        if is_notify && let Ok(twin) = stream.try_clone() {
            state.notify.lock().push(twin);
            state.live_notify.fetch_add(1, Ordering::SeqCst);
        }

        let response = Packet::new(
            request.command,
            request.p1,
            request.p2,
            (state.reply)(&request),
        );
        if stream.write_all(&response.to_bytes()).is_err() {
            break;
        }

        if is_notify {
            // report-only from here on
            let mut drain = [0u8; 64];
            while matches!(stream.read(&mut drain), Ok(n) if n > 0) {}
            state.live_notify.fetch_sub(1, Ordering::SeqCst);
            break;
        }
    }
}

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<StateChangeEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<StateChangeEvent> {
        self.events.lock().clone()
    }

    /// Poll until at least `count` events arrived or `timeout` passed.
    pub fn wait_for(&self, count: usize, timeout: Duration) -> Vec<StateChangeEvent> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.events.lock().len() >= count {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        self.events()
    }
}

impl StateChangeSink for RecordingSink {
    fn dispatch(&self, event: StateChangeEvent) {
        self.events.lock().push(event);
    }
}

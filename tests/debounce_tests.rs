mod common;

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use pinwire::config::EdgeDetect;
use pinwire::debounce::{DebounceMonitor, DebounceSettings, MonitorState};
use pinwire::edge::{Edge, EdgeEventSource, Level, RawEdgeEvent};
use pinwire::error::AppError;
use pinwire::gpio::StateChangeEvent;

use common::RecordingSink;

const SETTLE: Duration = Duration::from_secs(2);

#[derive(Default)]
struct Tally {
    released: AtomicUsize,
    waits_after_release: AtomicUsize,
}

/// Replays scripted edges on a virtual clock. Idle waits advance the clock
/// by the full timeout, so windows elapse without real sleeping.
struct ScriptedLine {
    now: Duration,
    script: VecDeque<RawEdgeEvent>,
    fail_when_drained: Option<String>,
    block_for: Option<Duration>,
    fail_arm: bool,
    released: AtomicBool,
    tally: Arc<Tally>,
}

impl ScriptedLine {
    fn new(edges: &[(u64, Edge)]) -> (Self, Arc<Tally>) {
        let tally = Arc::new(Tally::default());
        let line = Self {
            now: Duration::ZERO,
            script: edges
                .iter()
                .map(|&(ms, edge)| RawEdgeEvent {
                    edge,
                    timestamp: Duration::from_millis(ms),
                })
                .collect(),
            fail_when_drained: None,
            block_for: None,
            fail_arm: false,
            released: AtomicBool::new(false),
            tally: tally.clone(),
        };
        (line, tally)
    }
}

impl EdgeEventSource for ScriptedLine {
    fn arm(&mut self) -> Result<(), AppError> {
        if self.fail_arm {
            return Err(AppError::Gpio("line busy".into()));
        }
        Ok(())
    }

    fn wait_for_edge(&mut self, timeout: Duration) -> Result<Option<RawEdgeEvent>, AppError> {
        if self.released.load(Ordering::SeqCst) {
            self.tally.waits_after_release.fetch_add(1, Ordering::SeqCst);
        }
        if let Some(block) = self.block_for.take() {
            thread::sleep(block);
        }

        match self.script.front() {
            Some(next) if next.timestamp <= self.now + timeout => {
                self.now = self.now.max(next.timestamp);
                Ok(self.script.pop_front())
            }
            _ => {
                if self.script.is_empty()
                    && let Some(reason) = self.fail_when_drained.take()
                {
                    return Err(AppError::Transport(reason));
                }
                self.now += timeout;
                thread::sleep(Duration::from_millis(1));
                Ok(None)
            }
        }
    }

    fn read_level(&self) -> Result<Level, AppError> {
        Ok(Level::Low)
    }

    fn release(&mut self) -> Result<(), AppError> {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.tally.released.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn now(&self) -> Duration {
        self.now
    }
}

fn start(
    line: ScriptedLine,
    settings: DebounceSettings,
) -> (DebounceMonitor<ScriptedLine>, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    let monitor = DebounceMonitor::start(7, line, settings, sink.clone()).unwrap();
    (monitor, sink)
}

fn event(state: Level, timestamp_ms: u64) -> StateChangeEvent {
    StateChangeEvent {
        pin_id: 7,
        state,
        timestamp_ms,
    }
}

#[test]
fn bounce_inside_window_yields_one_change() {
    let (line, _) = ScriptedLine::new(&[
        (0, Edge::Rising),
        (10, Edge::Falling),
        (30, Edge::Rising),
    ]);
    let (mut monitor, sink) = start(line, DebounceSettings::new(Duration::from_millis(50)));

    sink.wait_for(1, SETTLE);
    thread::sleep(Duration::from_millis(50));
    monitor.shutdown().unwrap();

    // window restarts at the last edge: 30 + 50
    assert_eq!(sink.events(), vec![event(Level::High, 80)]);
}

#[test]
fn separated_edges_each_report() {
    let (line, _) = ScriptedLine::new(&[(0, Edge::Rising), (100, Edge::Falling)]);
    let (mut monitor, sink) = start(line, DebounceSettings::new(Duration::from_millis(50)));

    sink.wait_for(2, SETTLE);
    monitor.shutdown().unwrap();

    assert_eq!(
        sink.events(),
        vec![event(Level::High, 50), event(Level::Low, 150)]
    );
}

#[test]
fn repeated_state_is_suppressed() {
    let (line, _) = ScriptedLine::new(&[
        (0, Edge::Rising),
        (100, Edge::Rising),
        (200, Edge::Rising),
        (300, Edge::Falling),
        (310, Edge::Rising),
    ]);
    let (mut monitor, sink) = start(line, DebounceSettings::new(Duration::from_millis(20)));

    sink.wait_for(1, SETTLE);
    thread::sleep(Duration::from_millis(100));
    monitor.shutdown().unwrap();

    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].state, Level::High);
}

#[test]
fn zero_window_reports_every_change() {
    let (line, _) = ScriptedLine::new(&[
        (0, Edge::Rising),
        (1, Edge::Falling),
        (2, Edge::Falling),
        (3, Edge::Rising),
    ]);
    let (mut monitor, sink) = start(line, DebounceSettings::new(Duration::ZERO));

    sink.wait_for(3, SETTLE);
    thread::sleep(Duration::from_millis(50));
    monitor.shutdown().unwrap();

    assert_eq!(
        sink.events(),
        vec![
            event(Level::High, 0),
            event(Level::Low, 1),
            event(Level::High, 3)
        ]
    );
}

#[test]
fn notify_filter_drops_unwanted_direction() {
    let (line, _) = ScriptedLine::new(&[
        (0, Edge::Rising),
        (100, Edge::Falling),
        (200, Edge::Rising),
        (300, Edge::Falling),
    ]);
    let settings =
        DebounceSettings::new(Duration::from_millis(10)).with_notify(EdgeDetect::Falling);
    let (mut monitor, sink) = start(line, settings);

    sink.wait_for(2, SETTLE);
    thread::sleep(Duration::from_millis(50));
    monitor.shutdown().unwrap();

    assert_eq!(
        sink.events(),
        vec![event(Level::Low, 110), event(Level::Low, 310)]
    );
}

#[test]
fn shutdown_releases_source_once_after_stop() {
    let (line, tally) = ScriptedLine::new(&[]);
    let settings = DebounceSettings::new(Duration::from_millis(10))
        .with_poll_interval(Duration::from_millis(50));
    let (mut monitor, _sink) = start(line, settings);
    assert_eq!(monitor.state(), MonitorState::Running);

    let started = Instant::now();
    monitor.shutdown().unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));

    assert_eq!(monitor.state(), MonitorState::Stopped);
    assert_eq!(tally.released.load(Ordering::SeqCst), 1);
    assert_eq!(tally.waits_after_release.load(Ordering::SeqCst), 0);

    monitor.shutdown().unwrap();
    drop(monitor);
    assert_eq!(tally.released.load(Ordering::SeqCst), 1);
}

#[test]
fn drop_stops_and_releases() {
    let (line, tally) = ScriptedLine::new(&[(0, Edge::Rising)]);
    let (monitor, sink) = start(line, DebounceSettings::new(Duration::from_millis(5)));

    sink.wait_for(1, SETTLE);
    drop(monitor);

    assert_eq!(tally.released.load(Ordering::SeqCst), 1);
}

#[test]
fn wait_error_marks_monitor_failed() {
    let (mut line, tally) = ScriptedLine::new(&[(0, Edge::Rising)]);
    line.fail_when_drained = Some("line lost".into());
    let (mut monitor, sink) = start(line, DebounceSettings::new(Duration::ZERO));

    let deadline = Instant::now() + SETTLE;
    while !monitor.state().is_stopped() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }

    assert!(monitor.failure().is_some_and(|reason| reason.contains("line lost")));
    assert_eq!(sink.events(), vec![event(Level::High, 0)]);

    monitor.shutdown().unwrap();
    assert_eq!(tally.released.load(Ordering::SeqCst), 1);
}

#[test]
fn arm_failure_releases_and_reports() {
    let (mut line, tally) = ScriptedLine::new(&[]);
    line.fail_arm = true;
    let sink = Arc::new(RecordingSink::default());

    let result = DebounceMonitor::start(7, line, DebounceSettings::new(Duration::ZERO), sink);

    assert!(matches!(result, Err(AppError::Gpio(_))));
    assert_eq!(tally.released.load(Ordering::SeqCst), 1);
}

#[test]
fn stuck_source_times_out_without_release() {
    let (mut line, tally) = ScriptedLine::new(&[]);
    line.block_for = Some(Duration::from_millis(400));
    let settings = DebounceSettings::new(Duration::ZERO)
        .with_poll_interval(Duration::from_millis(20))
        .with_shutdown_timeout(Duration::from_millis(100));
    let (mut monitor, _sink) = start(line, settings);
    thread::sleep(Duration::from_millis(20));

    let err = monitor.shutdown().unwrap_err();
    assert!(matches!(err, AppError::ShutdownTimeout(_)), "{err}");
    assert_eq!(monitor.state(), MonitorState::Stopping);
    assert_eq!(tally.released.load(Ordering::SeqCst), 0);

    // once the source unblocks the retry completes
    thread::sleep(Duration::from_millis(500));
    monitor.shutdown().unwrap();
    assert_eq!(tally.released.load(Ordering::SeqCst), 1);
}

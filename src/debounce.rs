//! Per-line debounce task.
//!
//! The task owns its [`EdgeEventSource`] while it runs and hands it back when it
//! stops; the monitor releases the source only after the task is observed
//! stopped. Every wait is bounded by the poll interval, which is also the bound
//! on shutdown latency.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, error, info, trace};
use parking_lot::{Condvar, Mutex};

use crate::config::EdgeDetect;
use crate::edge::{EdgeEventSource, Level, RawEdgeEvent};
use crate::error::AppError;
use crate::gpio::{StateChangeEvent, StateChangeSink};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct DebounceSettings {
    /// Quiet period required after the last edge. Zero disables coalescing.
    pub window: Duration,
    /// Which validated changes reach the sink. Both edges are always tracked.
    pub notify: EdgeDetect,
    pub poll_interval: Duration,
    pub shutdown_timeout: Duration,
}

impl DebounceSettings {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            notify: EdgeDetect::Both,
            poll_interval: DEFAULT_POLL_INTERVAL,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    pub fn with_notify(mut self, notify: EdgeDetect) -> Self {
        self.notify = notify;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorState {
    Starting,
    Running,
    Stopping,
    Stopped,
    /// The task hit an error and exited on its own.
    Failed(String),
}

impl MonitorState {
    pub fn is_stopped(&self) -> bool {
        matches!(self, MonitorState::Stopped | MonitorState::Failed(_))
    }
}

struct Shared {
    stop: AtomicBool,
    state: Mutex<MonitorState>,
    changed: Condvar,
}

impl Shared {
    fn set(&self, next: MonitorState) {
        *self.state.lock() = next;
        self.changed.notify_all();
    }
}

pub struct DebounceMonitor<S: EdgeEventSource> {
    pin_id: u32,
    shared: Arc<Shared>,
    task: Option<JoinHandle<S>>,
    shutdown_timeout: Duration,
}

impl<S: EdgeEventSource> DebounceMonitor<S> {
    /// Arm `source` and start watching it on a dedicated thread.
    pub fn start(
        pin_id: u32,
        mut source: S,
        settings: DebounceSettings,
        sink: Arc<dyn StateChangeSink>,
    ) -> Result<Self, AppError> {
        let shared = Arc::new(Shared {
            stop: AtomicBool::new(false),
            state: Mutex::new(MonitorState::Starting),
            changed: Condvar::new(),
        });

        if let Err(e) = source.arm() {
            let _ = source.release();
            return Err(e);
        }
        shared.set(MonitorState::Running);

        let task_shared = shared.clone();
        let task = std::thread::Builder::new()
            .name(format!("debounce-{pin_id}"))
            .spawn(move || {
                let guard = StoppedGuard(task_shared.clone());
                let mut task = DebounceTask {
                    pin_id,
                    source,
                    settings,
                    sink,
                    shared: task_shared,
                    last_dispatched: None,
                };
                match task.run() {
                    Ok(()) => guard.finish(MonitorState::Stopped),
                    Err(e) => {
                        error!("debounce monitor for pin {pin_id} failed: {e}");
                        guard.finish(MonitorState::Failed(e.to_string()));
                    }
                }
                task.source
            })
            .map_err(|e| AppError::Gpio(format!("spawn debounce task for pin {pin_id}: {e}")))?;

        info!(
            "debounce monitor for pin {pin_id} running, window {:?}",
            settings.window
        );

        Ok(Self {
            pin_id,
            shared,
            task: Some(task),
            shutdown_timeout: settings.shutdown_timeout,
        })
    }

    pub fn pin_id(&self) -> u32 {
        self.pin_id
    }

    pub fn state(&self) -> MonitorState {
        self.shared.state.lock().clone()
    }

    pub fn failure(&self) -> Option<String> {
        match &*self.shared.state.lock() {
            MonitorState::Failed(reason) => Some(reason.clone()),
            _ => None,
        }
    }

    /// Stop the task, then release the source exactly once.
    ///
    /// Fails with [`AppError::ShutdownTimeout`] if the task does not stop in
    /// time; the source is then left unreleased. Calling again after a
    /// successful shutdown is a no-op.
    pub fn shutdown(&mut self) -> Result<(), AppError> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };

        self.shared.stop.store(true, Ordering::Release);
        {
            let mut state = self.shared.state.lock();
            if *state == MonitorState::Running {
                *state = MonitorState::Stopping;
            }

            let deadline = Instant::now() + self.shutdown_timeout;
            while !state.is_stopped() {
                if self
                    .shared
                    .changed
                    .wait_until(&mut state, deadline)
                    .timed_out()
                    && !state.is_stopped()
                {
                    self.task = Some(task);
                    return Err(AppError::ShutdownTimeout(format!(
                        "debounce monitor for pin {} still running after {:?}",
                        self.pin_id, self.shutdown_timeout
                    )));
                }
            }
        }

        let mut source = task.join().map_err(|_| {
            AppError::Gpio(format!("debounce task for pin {} panicked", self.pin_id))
        })?;
        source.release()?;

        info!("debounce monitor for pin {} stopped", self.pin_id);
        Ok(())
    }
}

impl<S: EdgeEventSource> Drop for DebounceMonitor<S> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("{e}");
        }
    }
}

/// Marks the monitor stopped even if the task unwinds.
struct StoppedGuard(Arc<Shared>);

impl StoppedGuard {
    fn finish(self, state: MonitorState) {
        self.0.set(state);
    }
}

impl Drop for StoppedGuard {
    fn drop(&mut self) {
        let mut state = self.0.state.lock();
        if !state.is_stopped() {
            *state = MonitorState::Failed("debounce task panicked".into());
            self.0.changed.notify_all();
        }
    }
}

struct DebounceTask<S> {
    pin_id: u32,
    source: S,
    settings: DebounceSettings,
    sink: Arc<dyn StateChangeSink>,
    shared: Arc<Shared>,
    last_dispatched: Option<Level>,
}

impl<S: EdgeEventSource> DebounceTask<S> {
    fn stop_requested(&self) -> bool {
        self.shared.stop.load(Ordering::Acquire)
    }

    fn run(&mut self) -> Result<(), AppError> {
        while !self.stop_requested() {
            let Some(first) = self.source.wait_for_edge(self.settings.poll_interval)? else {
                continue;
            };
            let Some(settled) = self.settle(first)? else {
                break;
            };
            self.decide(settled.edge.level());
        }

        debug!("debounce task for pin {} observed stop", self.pin_id);
        Ok(())
    }

    /// Wait out the window, restarting it on every newer edge. `None` on stop.
    fn settle(&mut self, mut event: RawEdgeEvent) -> Result<Option<RawEdgeEvent>, AppError> {
        loop {
            let deadline = event.timestamp.saturating_add(self.settings.window);
            let now = self.source.now();
            if now >= deadline {
                return Ok(Some(event));
            }
            if self.stop_requested() {
                return Ok(None);
            }

            let wait = (deadline - now).min(self.settings.poll_interval);
            if let Some(next) = self.source.wait_for_edge(wait)? {
                trace!(
                    "pin {} edge {:?} superseded by {:?} inside window",
                    self.pin_id, event.edge, next.edge
                );
                event = next;
            }
        }
    }

    fn decide(&mut self, candidate: Level) {
        if self.last_dispatched == Some(candidate) {
            trace!("pin {} still {candidate:?}, suppressed", self.pin_id);
            return;
        }
        self.last_dispatched = Some(candidate);

        if !self.settings.notify.admits(candidate) {
            return;
        }

        self.sink.dispatch(StateChangeEvent {
            pin_id: self.pin_id,
            state: candidate,
            timestamp_ms: self.source.now().as_millis() as u64,
        });
    }
}

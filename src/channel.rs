//! Single-flight request/response channel to a controller daemon.
//!
//! Frames carry no request id, so the channel holds its gate for the whole
//! write + read round trip. A transport failure closes the channel for good;
//! reconnecting is the owner's job.

use std::fmt;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, trace, warn};
use parking_lot::FairMutex;

use crate::error::AppError;
use crate::packet::{self, Command, FRAME_SIZE, Packet};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(500);

/// Unblocks a read or write in progress on another thread.
pub type ShutdownHandle = Box<dyn Fn() -> io::Result<()> + Send + Sync>;

/// Byte stream a [`CommandChannel`] can drive.
pub trait ChannelStream: Read + Write + Send {
    fn shutdown_handle(&self) -> io::Result<ShutdownHandle>;

    fn set_response_timeout(&self, _timeout: Option<Duration>) -> io::Result<()> {
        Ok(())
    }
}

impl ChannelStream for TcpStream {
    fn shutdown_handle(&self) -> io::Result<ShutdownHandle> {
        let twin = self.try_clone()?;
        Ok(Box::new(move || twin.shutdown(Shutdown::Both)))
    }

    fn set_response_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.set_read_timeout(timeout)?;
        self.set_write_timeout(timeout)
    }
}

impl ChannelStream for UnixStream {
    fn shutdown_handle(&self) -> io::Result<ShutdownHandle> {
        let twin = self.try_clone()?;
        Ok(Box::new(move || twin.shutdown(Shutdown::Both)))
    }

    fn set_response_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.set_read_timeout(timeout)?;
        self.set_write_timeout(timeout)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ChannelOptions {
    pub connect_timeout: Duration,
    /// Bound on each read/write of a round trip. `None` blocks indefinitely.
    pub response_timeout: Option<Duration>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            response_timeout: Some(DEFAULT_RESPONSE_TIMEOUT),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Open,
    Closed,
}

pub struct CommandChannel<S: ChannelStream = TcpStream> {
    stream: FairMutex<S>,
    shutdown: ShutdownHandle,
    open: AtomicBool,
    peer: String,
}

impl CommandChannel<TcpStream> {
    pub fn connect<A: ToSocketAddrs>(addr: A, options: ChannelOptions) -> Result<Self, AppError> {
        let addrs = addr
            .to_socket_addrs()
            .map_err(|e| AppError::Connect(format!("resolve address: {e}")))?;

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, options.connect_timeout) {
                Ok(stream) => {
                    stream
                        .set_nodelay(true)
                        .map_err(|e| AppError::Connect(format!("set nodelay {addr}: {e}")))?;
                    return Self::with_options(stream, addr.to_string(), options);
                }
                Err(e) => last_err = Some(format!("{addr}: {e}")),
            }
        }

        Err(AppError::Connect(
            last_err.unwrap_or_else(|| "address resolved to nothing".into()),
        ))
    }
}

impl CommandChannel<UnixStream> {
    pub fn connect_unix<P: AsRef<Path>>(
        path: P,
        options: ChannelOptions,
    ) -> Result<Self, AppError> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path)
            .map_err(|e| AppError::Connect(format!("{}: {e}", path.display())))?;
        Self::with_options(stream, path.display().to_string(), options)
    }
}

impl<S: ChannelStream> CommandChannel<S> {
    /// Wrap an already connected stream, keeping its current timeouts.
    pub fn new(stream: S, peer: impl Into<String>) -> Result<Self, AppError> {
        let shutdown = stream
            .shutdown_handle()
            .map_err(|e| AppError::Connect(format!("shutdown handle: {e}")))?;
        let peer = peer.into();
        debug!("command channel open to {peer}");

        Ok(Self {
            stream: FairMutex::new(stream),
            shutdown,
            open: AtomicBool::new(true),
            peer,
        })
    }

    fn with_options(stream: S, peer: String, options: ChannelOptions) -> Result<Self, AppError> {
        stream
            .set_response_timeout(options.response_timeout)
            .map_err(|e| AppError::Connect(format!("response timeout {peer}: {e}")))?;
        Self::new(stream, peer)
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn state(&self) -> ChannelState {
        if self.open.load(Ordering::Acquire) {
            ChannelState::Open
        } else {
            ChannelState::Closed
        }
    }

    /// One full round trip. Concurrent callers queue on the gate in arrival order.
    pub fn send(&self, request: &Packet) -> Result<Packet, AppError> {
        self.ensure_open()?;
        let mut stream = self.stream.lock();
        // close() may have landed while this caller waited for the gate
        self.ensure_open()?;

        trace!("[TX] -> {request}");
        match Self::round_trip(&mut *stream, request) {
            Ok(response) => {
                trace!("[RX] <- {response}");
                Ok(response)
            }
            Err(e) => {
                // close while still holding the gate so a queued caller
                // never reads the tail of this response
                self.fail(&e);
                drop(stream);
                Err(e)
            }
        }
    }

    /// Send and tag a negative `p3` as [`AppError::Backend`].
    pub fn command(&self, command: Command, p1: i32, p2: i32, p3: i32) -> Result<i32, AppError> {
        let response = self.send(&Packet::new(command, p1, p2, p3))?;
        response
            .outcome()
            .map_err(|code| AppError::Backend { command, code })
    }

    /// Terminal and idempotent. A send blocked on the stream fails with `Transport`.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            debug!("closing command channel to {}", self.peer);
            if let Err(e) = (self.shutdown)() {
                debug!("shutdown of {} reported: {e}", self.peer);
            }
        }
    }

    fn ensure_open(&self) -> Result<(), AppError> {
        match self.state() {
            ChannelState::Open => Ok(()),
            ChannelState::Closed => Err(AppError::Transport(format!(
                "channel to {} is closed",
                self.peer
            ))),
        }
    }

    fn fail(&self, err: &AppError) {
        if self.open.load(Ordering::Acquire) {
            warn!("command channel to {} failed: {err}", self.peer);
        }
        self.close();
    }

    fn round_trip(stream: &mut S, request: &Packet) -> Result<Packet, AppError> {
        stream
            .write_all(&request.to_bytes())
            .and_then(|_| stream.flush())
            .map_err(|e| AppError::Transport(format!("write request: {e}")))?;

        let mut frame = [0u8; FRAME_SIZE];
        let mut filled = 0;
        while filled < FRAME_SIZE {
            match stream.read(&mut frame[filled..]) {
                Ok(0) => {
                    return Err(AppError::Transport(format!(
                        "connection closed after {filled} of {FRAME_SIZE} response bytes"
                    )));
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(AppError::Transport(format!(
                        "read response ({filled} of {FRAME_SIZE} bytes): {e}"
                    )));
                }
            }
        }

        packet::decode(&frame)
    }
}

impl<S: ChannelStream> fmt::Debug for CommandChannel<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandChannel")
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl<S: ChannelStream> Drop for CommandChannel<S> {
    fn drop(&mut self) {
        self.close();
    }
}

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::error::ConnectionError;
use super::options::ConnectionOptions;
use crate::constants::WATCHDOG_INTERVAL;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Connection lifecycle states. Transitions are monotonic within a single
/// connection attempt; only a fresh `connect` leaves `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Pending,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// Who initiated the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// How the connection came to exist: a direct TCP connect, or the
/// firewall-piercing rendezvous through the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Path {
    Direct,
    Indirect,
}

/// Lifecycle and progress notifications, delivered per subscriber in
/// occurrence order.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected,
    Disconnected { reason: String },
    DataRead { bytes: usize, total: usize },
    DataWritten { bytes: usize, total: usize },
}

struct Inner {
    id: u64,
    addr: SocketAddr,
    direction: Direction,
    path: Path,
    options: ConnectionOptions,
    state: Mutex<ConnectionState>,
    read_half: tokio::sync::Mutex<Option<OwnedReadHalf>>,
    write_half: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    last_activity: Mutex<Instant>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ConnectionEvent>>>,
    /// Cancelled when teardown begins; wakes blocked reads and writes and
    /// stops the timer task.
    shutdown: Mutex<CancellationToken>,
    /// Cancelled when teardown has finished.
    closed: Mutex<CancellationToken>,
}

/// A single TCP socket with a connect-state machine, an inactivity timer,
/// and a watchdog for unexpected socket loss.
///
/// Cloning yields another handle to the same socket. Reads are exact-`n`:
/// a short read never returns, and the remote closing mid-read is a fatal
/// error, not an EOF. Writes are serialized; concurrent writers are
/// linearized by an internal lock so frames never interleave.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// A connection that will dial `addr` when [`connect`] is called.
    ///
    /// [`connect`]: Connection::connect
    pub fn new(
        addr: SocketAddr,
        direction: Direction,
        path: Path,
        options: ConnectionOptions,
    ) -> Self {
        Self::build(addr, direction, path, options, None)
    }

    /// Wraps an already-open socket: an accepted inbound connection or the
    /// winner of an indirect rendezvous. Timers start immediately and the
    /// state goes straight to `Connected`.
    pub fn from_stream(
        stream: TcpStream,
        direction: Direction,
        path: Path,
        options: ConnectionOptions,
    ) -> Result<Self, ConnectionError> {
        let addr = stream
            .peer_addr()
            .map_err(|e| ConnectionError::Connect(e.to_string()))?;
        let _ = stream.set_nodelay(true);
        let connection = Self::build(addr, direction, path, options, Some(stream.into_split()));
        connection.start_timers();
        connection.emit(ConnectionEvent::Connected);
        Ok(connection)
    }

    fn build(
        addr: SocketAddr,
        direction: Direction,
        path: Path,
        options: ConnectionOptions,
        halves: Option<(OwnedReadHalf, OwnedWriteHalf)>,
    ) -> Self {
        let state = if halves.is_some() {
            ConnectionState::Connected
        } else {
            ConnectionState::Pending
        };
        let (read_half, write_half) = match halves {
            Some((read_half, write_half)) => (Some(read_half), Some(write_half)),
            None => (None, None),
        };
        Self {
            inner: Arc::new(Inner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                addr,
                direction,
                path,
                options,
                state: Mutex::new(state),
                read_half: tokio::sync::Mutex::new(read_half),
                write_half: tokio::sync::Mutex::new(write_half),
                last_activity: Mutex::new(Instant::now()),
                subscribers: Mutex::new(Vec::new()),
                shutdown: Mutex::new(CancellationToken::new()),
                closed: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    fn start_timers(&self) {
        let shutdown = self.inner.shutdown.lock().clone();
        tokio::spawn(Inner::run_timers(Arc::downgrade(&self.inner), shutdown));
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.inner.addr
    }

    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    pub fn path(&self) -> Path {
        self.inner.path
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Registers for lifecycle and progress events.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ConnectionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.lock().push(tx);
        rx
    }

    /// Resolves once the connection has fully torn down.
    pub async fn closed(&self) {
        let token = self.inner.closed.lock().clone();
        token.cancelled().await;
    }

    /// Dials the remote endpoint. Legal only from `Pending` or
    /// `Disconnected`. Races the TCP connect against the configured
    /// connect timeout and the caller's cancel token.
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<(), ConnectionError> {
        {
            let mut state = self.inner.state.lock();
            match *state {
                ConnectionState::Pending | ConnectionState::Disconnected => {
                    *state = ConnectionState::Connecting;
                }
                current => return Err(ConnectionError::InvalidState(current)),
            }
            // A fresh attempt gets fresh teardown tokens.
            *self.inner.shutdown.lock() = CancellationToken::new();
            *self.inner.closed.lock() = CancellationToken::new();
        }

        let attempt = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ConnectionError::Cancelled),
            result = timeout(
                self.inner.options.connect_timeout,
                TcpStream::connect(self.inner.addr),
            ) => match result {
                Err(_) => Err(ConnectionError::Timeout),
                Ok(Err(e)) => Err(ConnectionError::Connect(e.to_string())),
                Ok(Ok(stream)) => Ok(stream),
            },
        };

        match attempt {
            Ok(stream) => {
                self.install(stream).await;
                Ok(())
            }
            Err(e) => {
                *self.inner.state.lock() = ConnectionState::Disconnected;
                self.inner.closed.lock().cancel();
                debug!("connect to {} failed: {}", self.inner.addr, e);
                Err(e)
            }
        }
    }

    async fn install(&self, stream: TcpStream) {
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        *self.inner.read_half.lock().await = Some(read_half);
        *self.inner.write_half.lock().await = Some(write_half);
        *self.inner.last_activity.lock() = Instant::now();
        *self.inner.state.lock() = ConnectionState::Connected;
        self.start_timers();
        self.emit(ConnectionEvent::Connected);
    }

    /// Reads exactly `n` bytes. Legal only from `Connected`. The remote
    /// closing the socket is a fatal error, not an empty read; any fatal
    /// error tears the connection down before returning.
    pub async fn read(
        &self,
        n: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, ConnectionError> {
        self.ensure_connected()?;
        let shutdown = self.inner.shutdown.lock().clone();

        let mut guard = self.inner.read_half.lock().await;
        let Some(half) = guard.as_mut() else {
            return Err(ConnectionError::InvalidState(self.state()));
        };

        let mut out = vec![0u8; n];
        let mut filled = 0usize;
        let mut fatal: Option<String> = None;

        while filled < n {
            let chunk_end = filled + (n - filled).min(self.inner.options.read_buffer_size);
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ConnectionError::Cancelled),
                _ = shutdown.cancelled() => {
                    return Err(ConnectionError::Read("connection closed".into()));
                }
                result = half.read(&mut out[filled..chunk_end]) => result,
            };
            match read {
                Ok(0) => {
                    fatal = Some("Remote connection closed".into());
                    break;
                }
                Ok(count) => {
                    filled += count;
                    *self.inner.last_activity.lock() = Instant::now();
                    self.emit(ConnectionEvent::DataRead {
                        bytes: filled,
                        total: n,
                    });
                }
                Err(e) => {
                    fatal = Some(e.to_string());
                    break;
                }
            }
        }

        drop(guard);
        if let Some(reason) = fatal {
            self.disconnect(&reason).await;
            return Err(ConnectionError::Read(reason));
        }
        Ok(out)
    }

    /// Writes all of `bytes`, chunked to the configured write buffer size.
    /// Legal only from `Connected`. Concurrent writers are serialized.
    pub async fn write(
        &self,
        bytes: &[u8],
        cancel: &CancellationToken,
    ) -> Result<(), ConnectionError> {
        self.ensure_connected()?;
        let shutdown = self.inner.shutdown.lock().clone();

        let mut guard = self.inner.write_half.lock().await;
        let Some(half) = guard.as_mut() else {
            return Err(ConnectionError::InvalidState(self.state()));
        };

        let total = bytes.len();
        let mut written = 0usize;
        let mut fatal: Option<String> = None;

        while written < total {
            let chunk_end = written + (total - written).min(self.inner.options.write_buffer_size);
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ConnectionError::Cancelled),
                _ = shutdown.cancelled() => {
                    return Err(ConnectionError::Write("connection closed".into()));
                }
                result = half.write_all(&bytes[written..chunk_end]) => result,
            };
            match result {
                Ok(()) => {
                    written = chunk_end;
                    *self.inner.last_activity.lock() = Instant::now();
                    self.emit(ConnectionEvent::DataWritten {
                        bytes: written,
                        total,
                    });
                }
                Err(e) => {
                    fatal = Some(e.to_string());
                    break;
                }
            }
        }

        drop(guard);
        if let Some(reason) = fatal {
            self.disconnect(&reason).await;
            return Err(ConnectionError::Write(reason));
        }
        Ok(())
    }

    /// Tears the connection down. Idempotent; stops timers, closes the
    /// socket, and emits `Disconnected` with the given reason.
    pub async fn disconnect(&self, reason: &str) {
        {
            let mut state = self.inner.state.lock();
            match *state {
                ConnectionState::Disconnecting | ConnectionState::Disconnected => return,
                _ => *state = ConnectionState::Disconnecting,
            }
        }
        // Wake any blocked read or write so the half locks free up.
        self.inner.shutdown.lock().cancel();

        if let Some(mut half) = self.inner.write_half.lock().await.take() {
            let _ = half.shutdown().await;
        }
        drop(self.inner.read_half.lock().await.take());

        *self.inner.state.lock() = ConnectionState::Disconnected;
        self.inner.closed.lock().cancel();
        debug!("connection {} to {} disconnected: {}", self.inner.id, self.inner.addr, reason);
        self.emit(ConnectionEvent::Disconnected {
            reason: reason.to_string(),
        });
    }

    /// Detaches and returns the underlying socket for reuse, leaving this
    /// connection inert: timers stop, no events fire, and dropping the
    /// connection no longer closes the socket. Callers must have quiesced
    /// their own reads and writes first.
    pub async fn handoff(&self) -> Result<TcpStream, ConnectionError> {
        self.inner.shutdown.lock().cancel();
        let read_half = self.inner.read_half.lock().await.take();
        let write_half = self.inner.write_half.lock().await.take();
        *self.inner.state.lock() = ConnectionState::Disconnected;
        self.inner.closed.lock().cancel();
        match (read_half, write_half) {
            (Some(read_half), Some(write_half)) => read_half
                .reunite(write_half)
                .map_err(|e| ConnectionError::Protocol(e.to_string())),
            _ => Err(ConnectionError::InvalidState(ConnectionState::Disconnected)),
        }
    }

    fn ensure_connected(&self) -> Result<(), ConnectionError> {
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(ConnectionError::InvalidState(state));
        }
        Ok(())
    }

    fn emit(&self, event: ConnectionEvent) {
        self.inner
            .subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl Inner {
    /// Watchdog and inactivity loop. Each tick probes for unexpected
    /// socket loss and checks the inactivity deadline; either condition
    /// tears the connection down. Holds only a weak handle so an abandoned
    /// connection can actually drop and close its socket.
    async fn run_timers(inner: Weak<Inner>, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(WATCHDOG_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tick.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tick.tick() => {}
            }

            let Some(inner) = inner.upgrade() else { return };
            let connection = Connection { inner };

            if let Some(limit) = connection.inner.options.inactivity_timeout {
                let idle = connection.inner.last_activity.lock().elapsed();
                if idle >= limit {
                    trace!("connection {} idle for {:?}", connection.inner.id, idle);
                    connection.disconnect("inactivity timeout").await;
                    return;
                }
            }

            // Probe for a remote close in the absence of traffic. Skipped
            // while a read holds the half; an active read detects failure
            // itself.
            let read_half = &connection.inner.read_half;
            if let Ok(mut guard) = read_half.try_lock() {
                let Some(half) = guard.as_mut() else { return };
                let mut probe = [0u8; 1];
                if let Ok(Ok(0)) = timeout(Duration::ZERO, half.peek(&mut probe)).await {
                    drop(guard);
                    connection.disconnect("closed unexpectedly").await;
                    return;
                }
            };
        }
    }
}

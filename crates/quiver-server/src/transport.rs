//! Server transport layer.
//!
//! Listens for TCP connections, performs the version handshake, and runs
//! one session loop per connection on a named OS thread. Every live
//! connection registers a handle in a shared map so the kill path and
//! server shutdown can interrupt a session, stop it, and unblock a read
//! parked on its socket.

use std::io::{self, BufReader};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

use quiver_bolt::handshake;

use crate::config::ServerConfig;
use crate::error::Error;
use crate::interrupt::InterruptSignal;
use crate::processor::ProcessorFactory;
use crate::session::Session;

// How long the accept thread sleeps when the listener has nothing for it.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Transport metrics for monitoring.
#[derive(Debug)]
pub struct ServerMetrics {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently holding a session.
    pub connections_active: AtomicU64,
    /// Connections dropped during version negotiation.
    pub handshakes_failed: AtomicU64,
    /// Sessions that ended with a genuine failure.
    pub sessions_failed: AtomicU64,
    /// Server start time.
    pub started_at: Instant,
}

impl ServerMetrics {
    /// Create new metrics.
    fn new() -> Self {
        Self {
            connections_accepted: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            handshakes_failed: AtomicU64::new(0),
            sessions_failed: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    /// Record an accepted connection.
    fn record_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection teardown.
    fn record_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record a failed handshake.
    fn record_handshake_failure(&self) {
        self.handshakes_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a session that ended in a failure.
    fn record_session_failure(&self) {
        self.sessions_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Get the uptime duration.
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Get total accepted connections.
    pub fn total_accepted(&self) -> u64 {
        self.connections_accepted.load(Ordering::Relaxed)
    }

    /// Get the number of live connections.
    pub fn active_connections(&self) -> u64 {
        self.connections_active.load(Ordering::Relaxed)
    }

    /// Get the number of failed handshakes.
    pub fn failed_handshakes(&self) -> u64 {
        self.handshakes_failed.load(Ordering::Relaxed)
    }

    /// Get the number of failed sessions.
    pub fn failed_sessions(&self) -> u64 {
        self.sessions_failed.load(Ordering::Relaxed)
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// A live connection as seen by the kill and shutdown paths.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: u64,
    peer: SocketAddr,
    interrupt: InterruptSignal,
    stream: TcpStream,
}

impl ConnectionHandle {
    /// The connection id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The peer address.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Stop the session and unblock a read parked on its socket.
    ///
    /// Only the read half is shut down; the session still flushes a
    /// closing failure to the client on its way out.
    pub fn kill(&self) {
        tracing::debug!(connection_id = self.id, peer = %self.peer, "killing connection");
        self.interrupt.raise();
        self.interrupt.stop();
        let _ = self.stream.shutdown(Shutdown::Read);
    }
}

// What every session thread needs, shared once per transport.
struct SessionContext {
    factory: Arc<dyn ProcessorFactory>,
    metrics: ServerMetrics,
    server_agent: String,
    max_message_size: usize,
}

/// Server transport that owns the listener and the live connections.
pub struct Transport {
    listener: TcpListener,
    context: Arc<SessionContext>,
    connections: Arc<DashMap<u64, Arc<ConnectionHandle>>>,
    session_threads: Arc<Mutex<Vec<thread::JoinHandle<()>>>>,
}

impl Transport {
    /// Bind the listener for the given configuration.
    pub fn new(config: &ServerConfig, factory: Arc<dyn ProcessorFactory>) -> Result<Self, Error> {
        if config.bind_address.is_empty() {
            return Err(Error::Config("no bind address configured".to_string()));
        }

        let listener = TcpListener::bind(&config.bind_address)?;
        listener.set_nonblocking(true)?;
        tracing::info!(address = %config.bind_address, "listening on TCP");

        Ok(Self {
            listener,
            context: Arc::new(SessionContext {
                factory,
                metrics: ServerMetrics::new(),
                server_agent: config.server_agent.clone(),
                max_message_size: config.max_message_size,
            }),
            connections: Arc::new(DashMap::new()),
            session_threads: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get a reference to the transport metrics.
    pub fn metrics(&self) -> &ServerMetrics {
        &self.context.metrics
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Kill one connection by id.
    ///
    /// Returns `false` when the connection is already gone.
    pub fn kill_connection(&self, id: u64) -> bool {
        match self.connections.get(&id) {
            Some(entry) => {
                entry.kill();
                true
            }
            None => false,
        }
    }

    /// Run the transport until the shutdown channel fires, then kill the
    /// live sessions and join every thread.
    pub async fn run_until_shutdown(
        &self,
        mut shutdown: tokio::sync::broadcast::Receiver<()>,
    ) -> Result<(), Error> {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let accept_handle = self.spawn_accept_thread(stop_flag.clone())?;

        tracing::info!("transport ready, accepting connections");

        let _ = shutdown.recv().await;
        let metrics = self.metrics();
        tracing::info!(
            accepted = metrics.total_accepted(),
            active = metrics.active_connections(),
            handshakes_failed = metrics.failed_handshakes(),
            sessions_failed = metrics.failed_sessions(),
            uptime_secs = metrics.uptime().as_secs(),
            "shutdown signal received, stopping transport"
        );

        stop_flag.store(true, Ordering::SeqCst);
        let connections = self.connections.clone();
        let threads = self.session_threads.clone();
        let _ = tokio::task::spawn_blocking(move || {
            let _ = accept_handle.join();
            for entry in connections.iter() {
                entry.value().kill();
            }
            let handles = std::mem::take(&mut *threads.lock());
            for handle in handles {
                let _ = handle.join();
            }
        })
        .await;

        tracing::info!("transport stopped");
        Ok(())
    }

    fn spawn_accept_thread(
        &self,
        stop_flag: Arc<AtomicBool>,
    ) -> Result<thread::JoinHandle<()>, Error> {
        let listener = self.listener.try_clone()?;
        let context = self.context.clone();
        let connections = self.connections.clone();
        let threads = self.session_threads.clone();

        let handle = thread::Builder::new()
            .name("quiver-accept".to_string())
            .spawn(move || accept_loop(listener, stop_flag, context, connections, threads))?;
        Ok(handle)
    }
}

fn accept_loop(
    listener: TcpListener,
    stop_flag: Arc<AtomicBool>,
    context: Arc<SessionContext>,
    connections: Arc<DashMap<u64, Arc<ConnectionHandle>>>,
    threads: Arc<Mutex<Vec<thread::JoinHandle<()>>>>,
) {
    let mut next_id: u64 = 0;
    loop {
        if stop_flag.load(Ordering::SeqCst) {
            tracing::info!("accept loop stopping");
            return;
        }

        match listener.accept() {
            Ok((stream, peer)) => {
                next_id += 1;
                spawn_session(next_id, stream, peer, &context, &connections, &threads);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                tracing::error!(error = %e, "accept failed");
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }
}

fn spawn_session(
    id: u64,
    stream: TcpStream,
    peer: SocketAddr,
    context: &Arc<SessionContext>,
    connections: &Arc<DashMap<u64, Arc<ConnectionHandle>>>,
    threads: &Mutex<Vec<thread::JoinHandle<()>>>,
) {
    context.metrics.record_opened();

    let handle_stream = match prepare_stream(&stream) {
        Ok(clone) => clone,
        Err(e) => {
            tracing::error!(connection_id = id, peer = %peer, error = %e, "cannot set up connection");
            context.metrics.record_closed();
            return;
        }
    };

    let interrupt = InterruptSignal::new();
    connections.insert(
        id,
        Arc::new(ConnectionHandle {
            id,
            peer,
            interrupt: interrupt.clone(),
            stream: handle_stream,
        }),
    );

    let context = context.clone();
    let connections = connections.clone();
    let spawned = thread::Builder::new()
        .name(format!("quiver-session-{id}"))
        .spawn({
            let context = context.clone();
            let connections = connections.clone();
            move || {
                match run_connection(id, stream, peer, interrupt, &context) {
                    Ok(()) => {}
                    Err(Error::Handshake(e)) => {
                        tracing::debug!(connection_id = id, peer = %peer, error = %e, "handshake failed");
                        context.metrics.record_handshake_failure();
                    }
                    Err(e) => {
                        tracing::warn!(connection_id = id, peer = %peer, error = %e, "session failed");
                        context.metrics.record_session_failure();
                    }
                }
                tracing::debug!(connection_id = id, "connection closed");
                connections.remove(&id);
                context.metrics.record_closed();
            }
        });

    match spawned {
        Ok(handle) => threads.lock().push(handle),
        Err(e) => {
            tracing::error!(connection_id = id, error = %e, "cannot spawn session thread");
            connections.remove(&id);
            context.metrics.record_closed();
        }
    }
}

// Accepted sockets can inherit the listener's nonblocking flag on some
// platforms; the session loop needs blocking reads.
fn prepare_stream(stream: &TcpStream) -> io::Result<TcpStream> {
    stream.set_nonblocking(false)?;
    stream.try_clone()
}

fn run_connection(
    id: u64,
    mut stream: TcpStream,
    peer: SocketAddr,
    interrupt: InterruptSignal,
    context: &SessionContext,
) -> Result<(), Error> {
    tracing::debug!(connection_id = id, peer = %peer, "connection accepted");

    let version = handshake::perform(&mut stream)?;
    tracing::debug!(connection_id = id, version, "handshake complete");

    let writer = stream.try_clone()?;
    let mut session = Session::new(
        BufReader::new(stream),
        writer,
        version,
        id,
        interrupt,
        context.factory.as_ref(),
        context.max_message_size,
    );

    if session.initialize(&context.server_agent)? {
        session.run()
    } else {
        Ok(())
    }
}

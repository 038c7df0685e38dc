//! The server core: the accept loop, per-connection worker threads,
//! broadcast fan-out and the pause/resume/quit lifecycle.

use std::{
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use crate::{
    connection::{read_packet, ConnectionState},
    connections::{ConnectionHandle, ConnectionTable},
    kex::{self, ServerKey},
    packet::Flag,
    Error, Result, CONNECTIONS_INIT, CONNECTIONS_MAX, KEEPALIVE_WINDOW, KEX_SKEW_MAX,
    PAUSE_INTERVAL, SERVER_PORT,
};

/// The capability receiving decrypted application traffic.
///
/// Implemented for any `Fn(u32, &[u8])` closure; the `u32` is the
/// sending connection's instance id. The sink only ever sees plaintexts
/// that authenticated; failures close the connection instead.
pub trait MessageSink: Send + Sync {
    /// Deliver one decrypted message from the connection identified by
    /// `instance`.
    fn on_message(&self, instance: u32, message: &[u8]);
}

impl<F> MessageSink for F
where
    F: Fn(u32, &[u8]) + Send + Sync,
{
    fn on_message(&self, instance: u32, message: &[u8]) {
        self(instance, message)
    }
}

struct Inner {
    key: ServerKey,
    port: u16,

    run: AtomicBool,
    pause: AtomicBool,

    connections: ConnectionTable,
    local_addr: Mutex<Option<SocketAddr>>,
}

/// A listening endpoint serving the simplex handshake and the encrypted
/// channels it establishes.
///
/// Cheap to clone; every clone drives the same server, so lifecycle
/// controls ([`pause`](Self::pause), [`quit`](Self::quit)) and
/// [`broadcast`](Self::broadcast) can be issued from other threads
/// while a start call blocks.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

impl Server {
    /// A server around `key`, listening on the default port.
    pub fn new(key: ServerKey) -> Self {
        Self::with_port(key, SERVER_PORT)
    }

    /// A server around `key` on a chosen port; port `0` asks the system
    /// for one, see [`Self::local_addr`].
    pub fn with_port(key: ServerKey, port: u16) -> Self {
        Self {
            inner: Arc::new(Inner {
                key,
                port,
                run: AtomicBool::new(false),
                pause: AtomicBool::new(false),
                connections: ConnectionTable::new(CONNECTIONS_INIT, CONNECTIONS_MAX),
                local_addr: Mutex::new(None),
            }),
        }
    }

    /// Listen on every IPv4 interface and serve until [`Self::quit`].
    ///
    /// Blocks the calling thread for the server's lifetime; decrypted
    /// messages reach `sink`.
    pub fn start_ipv4(&self, sink: impl MessageSink + 'static) -> Result<()> {
        self.serve((Ipv4Addr::UNSPECIFIED, self.inner.port).into(), Arc::new(sink))
    }

    /// Listen on every IPv6 interface and serve until [`Self::quit`].
    ///
    /// Blocks the calling thread for the server's lifetime; decrypted
    /// messages reach `sink`.
    pub fn start_ipv6(&self, sink: impl MessageSink + 'static) -> Result<()> {
        self.serve((Ipv6Addr::UNSPECIFIED, self.inner.port).into(), Arc::new(sink))
    }

    /// The bound listen address, `None` unless a start call is serving.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self
            .inner
            .local_addr
            .lock()
            .expect("The listener address lock has been poisonned")
    }

    fn serve(&self, address: SocketAddr, sink: Arc<dyn MessageSink>) -> Result<()> {
        let listener = TcpListener::bind(address).map_err(|error| {
            tracing::error!("Failed to bind the listener on {address}: {error}");

            Error::ListenerFail
        })?;

        // A non-blocking listener keeps the loop responsive to `quit`
        // and `pause` between arrivals.
        listener.set_nonblocking(true).map_err(|_| Error::ListenerFail)?;
        let bound = listener.local_addr().map_err(|_| Error::ListenerFail)?;

        self.inner.run.store(true, Ordering::SeqCst);
        self.inner.pause.store(false, Ordering::SeqCst);
        self.inner.connections.initialize();
        self.set_local_addr(Some(bound));

        tracing::info!("Listening on {bound}");

        let result = self.accept_loop(&listener, &sink);
        self.set_local_addr(None);

        result
    }

    fn set_local_addr(&self, address: Option<SocketAddr>) {
        *self
            .inner
            .local_addr
            .lock()
            .expect("The listener address lock has been poisonned") = address;
    }

    fn accept_loop(&self, listener: &TcpListener, sink: &Arc<dyn MessageSink>) -> Result<()> {
        let inner = &self.inner;
        let mut reserved = None;

        while inner.run.load(Ordering::SeqCst) {
            while inner.pause.load(Ordering::SeqCst) && inner.run.load(Ordering::SeqCst) {
                std::thread::sleep(PAUSE_INTERVAL);
            }

            // A reservation outlives empty accept rounds, so a full
            // pool is only ever reported when peers actually queue.
            if reserved.is_none() {
                reserved = inner.connections.next();

                if reserved.is_none() {
                    tracing::warn!("Connection pool exhausted, refusing new peers");

                    std::thread::sleep(PAUSE_INTERVAL);
                    self.poll_sockets();

                    continue;
                }
            }

            match listener.accept() {
                Ok((stream, address)) => {
                    let Some(instance) = reserved.take() else {
                        continue;
                    };

                    tracing::debug!("Accepted a connection from `{address}`");

                    let server = self.clone();
                    let sink = Arc::clone(sink);
                    std::thread::spawn(move || server.receiver(stream, instance, sink));

                    self.poll_sockets();
                }
                Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(PAUSE_INTERVAL);
                }
                Err(error) => {
                    tracing::warn!("The listener failed to accept a connection: {error}");

                    if let Some(instance) = reserved.take() {
                        inner.connections.reset(instance);
                    }
                }
            }
        }

        if let Some(instance) = reserved.take() {
            inner.connections.reset(instance);
        }

        Ok(())
    }

    /// One connection's worker: the server handshake, then the receive
    /// loop pumping decrypted records into the sink.
    fn receiver(self, stream: TcpStream, instance: u32, sink: Arc<dyn MessageSink>) {
        let inner = &self.inner;

        // Accepted sockets inherit the listener's non-blocking flag on
        // some platforms.
        let _ = stream.set_nonblocking(false);

        let mut cns = match ConnectionState::new(stream, instance) {
            Ok(cns) => cns,
            Err(error) => {
                tracing::warn!("Failed to adopt the accepted socket: {error}");
                inner.connections.reset(instance);

                return;
            }
        };
        let address = cns.address();

        let _ = cns.set_read_timeout(Some(Duration::from_secs(KEX_SKEW_MAX)));
        if let Err(error) = kex::server::key_exchange(&mut cns, &inner.key) {
            tracing::warn!("Key exchange with `{address}` failed: {error}");

            cns.close(None, false);
            inner.connections.reset(instance);

            return;
        }
        let _ = cns.set_read_timeout(Some(Duration::from_secs(KEEPALIVE_WINDOW)));

        // Reading happens on a second socket handle so the state lock
        // is only ever held for the time of a transform, never across a
        // blocking read; broadcasts stay unblocked.
        let reader = cns.reader();
        let Some(conn) = inner.connections.bind(instance, cns) else {
            // The server quit while the handshake ran.
            return;
        };
        let Ok(mut reader) = reader else {
            self.teardown(&conn, instance, Some(&Error::ConnectionFailure), false);

            return;
        };

        loop {
            if !inner.run.load(Ordering::SeqCst) {
                self.teardown(&conn, instance, None, false);
                break;
            }
            if lock(&conn).is_expired() {
                tracing::debug!("Session with `{address}` outlived its expiration");
                self.teardown(&conn, instance, None, true);
                break;
            }

            match read_packet(&mut reader) {
                Ok(packet) => match packet.flag {
                    Flag::EncryptedMessage => {
                        // Bind before matching, releasing the state lock.
                        let message = lock(&conn).decrypt_packet(&packet);

                        match message {
                            Ok(message) => sink.on_message(instance, &message),
                            Err(error) => {
                                tracing::warn!(
                                    "Failed to decrypt a record from `{address}`: {error}"
                                );
                                self.teardown(&conn, instance, Some(&error), true);
                                break;
                            }
                        }
                    }
                    Flag::KeepAlive => continue,
                    Flag::ConnectionTerminate => {
                        tracing::debug!("Peer `{address}` terminated the connection");
                        self.teardown(&conn, instance, None, false);
                        break;
                    }
                    _ => {
                        tracing::warn!("Unexpected `{}` record from `{address}`", packet.flag);
                        self.teardown(&conn, instance, Some(&Error::ConnectionFailure), true);
                        break;
                    }
                },
                Err(Error::Io(error))
                    if matches!(
                        error.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) => {}
                Err(Error::Io(error)) => {
                    tracing::debug!("The channel to `{address}` went down: {error}");
                    self.teardown(&conn, instance, Some(&Error::ChannelDown), false);
                    break;
                }
                Err(error) => {
                    tracing::warn!("Malformed record from `{address}`: {error}");
                    self.teardown(&conn, instance, Some(&error), true);
                    break;
                }
            }
        }
    }

    fn teardown(&self, conn: &ConnectionHandle, instance: u32, error: Option<&Error>, notify: bool) {
        lock(conn).close(error, notify);
        self.inner.connections.reset(instance);
    }

    /// Sweep the pool, reclaiming slots whose socket is no longer
    /// connected.
    fn poll_sockets(&self) {
        let connections = &self.inner.connections;

        for index in 0..connections.size() {
            if !connections.active(index) {
                continue;
            }
            let Some(conn) = connections.index(index) else {
                continue;
            };

            let (connected, instance) = {
                let cns = lock(&conn);

                (cns.is_connected(), cns.instance())
            };

            if !connected {
                connections.reset(instance);
            }
        }
    }

    /// Encrypt and send `message` to every established peer.
    ///
    /// The fan-out is not atomic across the pool: peers connecting or
    /// dropping while it runs may miss the message, but each surviving
    /// peer observes it exactly once, in sequence.
    pub fn broadcast(&self, message: &[u8]) {
        for conn in self.inner.connections.handles() {
            let mut cns = lock(&conn);

            if !cns.is_connected() || !cns.is_established() {
                continue;
            }

            let sent = cns
                .encrypt_packet(Flag::EncryptedMessage, message)
                .and_then(|packet| cns.send_packet(&packet));

            if let Err(error) = sent {
                tracing::debug!("Broadcast to `{}` failed: {error}", cns.address());
            }
        }
    }

    /// Stop accepting new peers; established sessions keep running.
    pub fn pause(&self) {
        self.inner.pause.store(true, Ordering::SeqCst);
    }

    /// Resume accepting peers after a [`Self::pause`].
    pub fn resume(&self) {
        self.inner.pause.store(false, Ordering::SeqCst);
    }

    /// Stop the server: close every connection, reclaim every slot and
    /// wind down the accept loop.
    ///
    /// Workers observe their sockets closing and exit on their own.
    pub fn quit(&self) {
        self.inner.run.store(false, Ordering::SeqCst);

        for conn in self.inner.connections.handles() {
            lock(&conn).close(None, false);
        }
        for instance in self.inner.connections.instances() {
            self.inner.connections.reset(instance);
        }

        self.inner.connections.dispose();
    }
}

fn lock(conn: &ConnectionHandle) -> MutexGuard<'_, ConnectionState> {
    conn.lock().expect("The connection lock has been poisonned")
}

//! Poll-based reactor. This is a single-threaded reactor using a `poll`
//! loop, waking at least once per second to drive the watchdog timers.

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::io;
use std::net;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time;
use std::time::SystemTime;

use flume as chan;
use popol::Event;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::net::error::Error;
use crate::net::socket::Socket;
use crate::net::time::TimeoutManager;
use crate::net::{Disconnect, Io, Link, LocalDuration, LocalTime, NetWaker, Service, Source};

/// Maximum time to wait when reading from a socket.
const READ_TIMEOUT: time::Duration = time::Duration::from_secs(6);
/// Maximum time to wait when writing to a socket.
const WRITE_TIMEOUT: time::Duration = time::Duration::from_secs(3);
/// Maximum amount of time to wait for i/o. The watchdog state machine runs
/// on a one-second tick, so the loop never sleeps longer than that.
const WAIT_TIMEOUT: LocalDuration = LocalDuration::from_secs(1);
/// Socket read buffer size.
const READ_BUFFER_SIZE: usize = 1024 * 192;

/// Wakes up the reactor's poll loop.
#[derive(Clone)]
pub struct Waker(Arc<popol::Waker>);

impl Waker {
    fn new(sources: &mut popol::Sources<Source>) -> io::Result<Self> {
        let waker = Arc::new(popol::Waker::new(sources, Source::Waker)?);

        Ok(Self(waker))
    }
}

impl NetWaker for Waker {
    fn wake(&self) -> io::Result<()> {
        self.0.wake()
    }
}

/// A single-threaded non-blocking reactor.
pub struct Reactor {
    peers: HashMap<SocketAddr, Socket<net::TcpStream>>,
    connecting: HashSet<SocketAddr>,
    sources: popol::Sources<Source>,
    waker: Waker,
    timeouts: TimeoutManager<()>,
    listening: chan::Sender<net::SocketAddr>,
}

impl Reactor {
    /// Construct a new reactor, given a channel to announce the bound
    /// listen address on.
    pub fn new(listening: chan::Sender<net::SocketAddr>) -> Result<Self, io::Error> {
        let mut sources = popol::Sources::new();
        let waker = Waker::new(&mut sources)?;
        let timeouts = TimeoutManager::new(LocalDuration::from_millis(250));

        Ok(Self {
            peers: HashMap::new(),
            connecting: HashSet::new(),
            sources,
            waker,
            timeouts,
            listening,
        })
    }

    /// Return a new waker.
    ///
    /// Used to wake up the main event loop after pushing a command.
    pub fn waker(&self) -> Waker {
        self.waker.clone()
    }

    /// Register a peer with the reactor.
    fn register_peer(&mut self, addr: SocketAddr, stream: net::TcpStream, link: Link) {
        self.sources
            .register(Source::Peer(addr), &stream, popol::interest::ALL);
        self.peers.insert(addr, Socket::from(stream, addr, link));
    }

    /// Unregister a peer from the reactor.
    fn unregister_peer<S>(
        &mut self,
        addr: SocketAddr,
        reason: Disconnect<S::DisconnectReason>,
        service: &mut S,
    ) where
        S: Service,
    {
        self.connecting.remove(&addr);
        self.peers.remove(&addr);
        self.sources.unregister(&Source::Peer(addr));

        service.disconnected(&addr, reason);
    }

    /// Run the given service with the reactor.
    pub async fn run<S>(
        &mut self,
        listen_addr: &SocketAddr,
        mut service: S,
        commands: chan::Receiver<S::Command>,
        publisher: chan::Sender<S::Event>,
        cancellation: CancellationToken,
    ) -> Result<(), Error>
    where
        S: Service,
    {
        let listener = listen(listen_addr)?;
        let local_addr = listener.local_addr()?;

        self.sources
            .register(Source::Listener, &listener, popol::interest::READ);
        self.listening.send(local_addr).ok();

        debug!(target: "wd", "Listening for peer connections on {}", local_addr);

        let local_time = SystemTime::now().into();
        service.initialize(local_time);
        self.process(&mut service, &publisher, local_time);

        // I/O readiness events populated by `popol::Sources::wait_timeout`.
        let mut events = Vec::with_capacity(32);
        // Timeouts populated by `TimeoutManager::wake`.
        let mut timeouts: Vec<()> = Vec::with_capacity(32);

        loop {
            select! {
                _ = cancellation.cancelled() => {
                    trace!(target: "wd", "Reactor cancelled");
                    break Ok(());
                }
                result = self.step(&mut events, &mut service, &commands, &publisher, &mut timeouts, &listener) => {
                    if let Err(e) = result {
                        break Err(e);
                    }
                }
            }
        }
    }

    /// A single pass of the event loop.
    async fn step<S>(
        &mut self,
        events: &mut Vec<Event<Source>>,
        service: &mut S,
        commands: &chan::Receiver<S::Command>,
        publisher: &chan::Sender<S::Event>,
        timeouts: &mut Vec<()>,
        listener: &net::TcpListener,
    ) -> Result<(), Error>
    where
        S: Service,
    {
        // Give the executor a chance to run other tasks; the poll below
        // blocks the thread for up to a second.
        tokio::task::yield_now().await;

        trace!(
            target: "wd",
            "Polling {} source(s) and {} timeout(s)",
            self.sources.len(),
            self.timeouts.len(),
        );

        let result = self.sources.wait_timeout(events, WAIT_TIMEOUT.into()); // Blocking.
        let local_time = SystemTime::now().into();

        service.tick(local_time);

        match result {
            Ok(n) => {
                trace!(target: "wd", "Woke up with {n} source(s) ready");

                for event in events.drain(..) {
                    match &event.key {
                        Source::Peer(addr) => {
                            let addr = *addr;

                            if event.is_invalid() {
                                // File descriptor was closed and is invalid.
                                // Nb. This shouldn't happen. It means the
                                // source wasn't properly unregistered, or
                                // there is a duplicate source.
                                error!(target: "wd", "{}: Socket is invalid, removing", addr);

                                self.sources.unregister(&event.key);
                                continue;
                            }
                            if event.is_error() || event.is_hangup() {
                                // Let the subsequent read fail.
                                trace!(target: "wd", "{}: Socket error triggered: {:?}", addr, event);
                            }
                            if event.is_writable() {
                                self.handle_writable(addr, &event.key, service);
                            }
                            if event.is_readable() {
                                self.handle_readable(addr, service);
                            }
                        }
                        Source::Listener => loop {
                            let (conn, socket_addr) = match listener.accept() {
                                Ok((conn, socket_addr)) => (conn, socket_addr),
                                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                                Err(e) => {
                                    error!(target: "wd", "Accept error: {}", e.to_string());
                                    break;
                                }
                            };

                            if let Err(e) = self.accept_peer(service, socket_addr, conn) {
                                error!(target: "wd", "{}: Accept failed: {}", socket_addr, e);
                            }
                        },
                        Source::Waker => {
                            trace!(target: "wd", "Woken up by waker ({} command(s))", commands.len());
                            popol::Waker::reset(event.source).ok();

                            while let Ok(cmd) = commands.try_recv() {
                                service.command_received(cmd);
                            }
                        }
                    }
                }
            }
            Err(err) if err.kind() == io::ErrorKind::TimedOut => {
                // Nb. The way this is currently used basically ignores which
                // keys have timed out. So as long as *something* timed out,
                // we wake the service.
                self.timeouts.wake(local_time, timeouts);

                if !timeouts.is_empty() {
                    timeouts.clear();
                    service.timer_expired();
                }
            }
            Err(err) => return Err(err.into()),
        }
        self.process(service, publisher, local_time);

        Ok(())
    }

    /// Process service state machine outputs.
    fn process<S>(&mut self, service: &mut S, publisher: &chan::Sender<S::Event>, local_time: LocalTime)
    where
        S: Service,
    {
        // Note that there may be messages destined for a peer that has since
        // been disconnected.
        while let Some(out) = service.next() {
            match out {
                Io::Write(addr, bytes) => {
                    if let Some((socket, source)) = self.peers.get_mut(&addr).and_then(|socket| {
                        self.sources
                            .get_mut(&Source::Peer(addr))
                            .map(|source| (socket, source))
                    }) {
                        socket.push(&bytes);
                        source.set(popol::interest::WRITE);
                    }
                }
                Io::Connect(addr) => {
                    match dial(&addr) {
                        Ok(stream) => {
                            trace!(target: "wd", "{}: Dialing", addr);

                            self.register_peer(addr, stream, Link::Outbound);
                            self.connecting.insert(addr);

                            service.attempted(&addr);
                        }
                        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                            // Ignore. We are already establishing a
                            // connection through this socket.
                        }
                        Err(err) => {
                            error!(target: "wd", "{}: Dial error: {}", addr, err.to_string());

                            service.disconnected(&addr, Disconnect::DialError(Arc::new(err)));
                        }
                    }
                }
                Io::Disconnect(addr, reason) => {
                    // Shutdown the connection, ignoring any potential
                    // errors. If the socket was already disconnected, this
                    // will yield an error that is safe to ignore
                    // (`ENOTCONN`).
                    self.peers
                        .get(&addr)
                        .and_then(|peer| peer.disconnect().ok());
                    self.unregister_peer(addr, Disconnect::StateMachine(reason), service);
                }
                Io::SetTimer(timeout) => {
                    self.timeouts.register((), local_time + timeout);
                }
                Io::Event(event) => {
                    trace!(target: "wd", "Event: {:?}", event);

                    publisher.send(event).ok();
                }
            }
        }
    }

    fn accept_peer<S>(
        &mut self,
        service: &mut S,
        socket_addr: SocketAddr,
        conn: net::TcpStream,
    ) -> Result<(), Error>
    where
        S: Service,
    {
        trace!(target: "wd", "{}: Accepting peer connection", socket_addr);

        conn.set_nonblocking(true)?;
        conn.set_nodelay(true)?;
        socket2::SockRef::from(&conn).set_keepalive(true)?;

        let local_addr = conn.local_addr()?;

        self.register_peer(socket_addr, conn, Link::Inbound);
        service.connected(socket_addr, &local_addr, Link::Inbound);

        Ok(())
    }

    fn handle_readable<S>(&mut self, addr: SocketAddr, service: &mut S)
    where
        S: Service,
    {
        // Nb. If the socket was readable and writable at the same time, and
        // it was disconnected during an attempt to write, it will no longer
        // be registered and hence available for reads.
        if let Some(socket) = self.peers.get_mut(&addr) {
            let mut buffer = [0; READ_BUFFER_SIZE];

            trace!(target: "wd", "{}: Socket is readable", addr);

            // Nb. Since `poll`, which this reactor is based on, is
            // *level-triggered*, we will be notified again if there is still
            // data to be read on the socket. Hence, there is no use in
            // putting this socket read in a loop, as the second invocation
            // would likely block.
            match socket.read(&mut buffer) {
                Ok(count) => {
                    if count > 0 {
                        service.message_received(&addr, Cow::Borrowed(&buffer[..count]));
                    } else {
                        // A zero-byte read means the peer performed an
                        // orderly shutdown.
                        socket.disconnect().ok();

                        self.unregister_peer(
                            addr,
                            Disconnect::ConnectionError(Arc::new(io::Error::from(
                                io::ErrorKind::ConnectionReset,
                            ))),
                            service,
                        );
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    // This shouldn't normally happen, since this function is
                    // only called when there's data on the socket.
                    trace!(target: "wd", "{}: Spurious read readiness", addr);
                }
                Err(err) => {
                    trace!(target: "wd", "{}: Read error: {}", addr, err.to_string());

                    socket.disconnect().ok();
                    self.unregister_peer(addr, Disconnect::ConnectionError(Arc::new(err)), service);
                }
            }
        }
    }

    fn handle_writable<S: Service>(&mut self, addr: SocketAddr, source: &Source, service: &mut S) {
        trace!(target: "wd", "{}: Socket is writable", addr);

        let (Some(source), Some(socket)) =
            (self.sources.get_mut(source), self.peers.get_mut(&addr))
        else {
            return;
        };

        // "A file descriptor for a socket that is connecting asynchronously
        // shall indicate that it is ready for writing, once a connection has
        // been established."
        //
        // Since we perform a non-blocking connect, we're only really
        // connected once the socket is writable.
        if self.connecting.remove(&addr) {
            match socket.local_address() {
                Ok(local_addr) => service.connected(addr, &local_addr, socket.link),
                Err(err) => {
                    // The connect actually failed; surface it as a
                    // disconnect so the state machine can schedule a retry.
                    self.unregister_peer(addr, Disconnect::ConnectionError(Arc::new(err)), service);
                    return;
                }
            }
        }

        match socket.flush() {
            // We've written all the data, we are no longer interested in
            // writing to this socket.
            Ok(()) => {
                source.unset(popol::interest::WRITE);
            }
            // The write couldn't complete. Keep the `WRITE` interest to be
            // notified when the socket is ready to write again.
            Err(err)
                if [io::ErrorKind::WouldBlock, io::ErrorKind::WriteZero].contains(&err.kind()) =>
            {
                source.set(popol::interest::WRITE);
            }
            Err(err) => {
                error!(target: "wd", "{}: Write error: {}", addr, err.to_string());

                socket.disconnect().ok();
                self.unregister_peer(addr, Disconnect::ConnectionError(Arc::new(err)), service);
            }
        }
    }
}

/// Connect to a peer given a remote address. The stream is non-blocking
/// with `TCP_NODELAY` and `SO_KEEPALIVE` set.
fn dial(addr: &SocketAddr) -> Result<net::TcpStream, io::Error> {
    use socket2::{Domain, Socket, Type};

    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let sock = Socket::new(domain, Type::STREAM, None)?;

    sock.set_read_timeout(Some(READ_TIMEOUT))?;
    sock.set_write_timeout(Some(WRITE_TIMEOUT))?;
    sock.set_keepalive(true)?;
    sock.set_nodelay(true)?;
    sock.set_nonblocking(true)?;

    match sock.connect(&(*addr).into()) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) if e.raw_os_error() == Some(libc::EALREADY) => {
            return Err(io::Error::from(io::ErrorKind::AlreadyExists))
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }
    Ok(sock.into())
}

/// Listen for connections on the given address.
fn listen<A: net::ToSocketAddrs>(addr: A) -> Result<net::TcpListener, Error> {
    let sock = net::TcpListener::bind(addr)?;

    sock.set_nonblocking(true)?;

    Ok(sock)
}

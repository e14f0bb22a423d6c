//! Loopback stream sockets
//!
//! A socket starts unbound and is promoted exactly once:
//! - `listen` turns it into a listener registered on its port
//! - a connect/accept rendezvous turns the connector, and a fresh socket
//!   created by accept, into a connected pair of peers
//!
//! Peers talk through two pipes, one per direction. Each side's read pipe
//! is the other side's write pipe, so shutting down one direction is just
//! closing one end of one pipe.

use super::condvar::{CondVar, SchedCause, WaitOutcome};
use super::executor::Executor;
use super::pipe::Pipe;
use super::syscall::SyscallResult;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

/// Port number
pub type Port = u16;

/// "No port": the socket can never listen or be connected to
pub const NOPORT: Port = 0;

/// Socket error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketError {
    /// Port outside `NOPORT..=max_port`
    InvalidPort,
    /// Listening requires a concrete port
    NoPort,
    /// Another listener owns the port
    AddressInUse,
    /// Operation not valid in the socket's current role
    InvalidState,
    /// accept on a socket that is not listening
    NotListener,
    /// I/O or shutdown on a socket that is not connected
    NotConnected,
    /// No listener on the port, or it closed before admitting us
    ConnectionRefused,
    /// The listener did not accept within the timeout
    TimedOut,
    /// accept on a listener that has been closed
    ListenerClosed,
    /// That direction was already shut down
    AlreadyShutdown,
}

impl std::fmt::Display for SocketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SocketError::InvalidPort => write!(f, "invalid port"),
            SocketError::NoPort => write!(f, "socket has no port"),
            SocketError::AddressInUse => write!(f, "address already in use"),
            SocketError::InvalidState => write!(f, "invalid operation for socket state"),
            SocketError::NotListener => write!(f, "socket is not listening"),
            SocketError::NotConnected => write!(f, "socket not connected"),
            SocketError::ConnectionRefused => write!(f, "connection refused"),
            SocketError::TimedOut => write!(f, "connection timed out"),
            SocketError::ListenerClosed => write!(f, "listener closed"),
            SocketError::AlreadyShutdown => write!(f, "already shut down"),
        }
    }
}

impl std::error::Error for SocketError {}

pub type SocketResult<T> = Result<T, SocketError>;

/// Which direction(s) `shutdown` closes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    Read,
    Write,
    Both,
}

/// A pending connect, queued on the target listener
#[derive(Debug)]
pub struct ConnectionRequest {
    /// Set by accept; the only word on whether the connect succeeded
    admitted: Cell<bool>,
    requester: Rc<Socket>,
    connected_cv: CondVar,
}

impl ConnectionRequest {
    fn new(requester: Rc<Socket>) -> Self {
        Self {
            admitted: Cell::new(false),
            requester,
            connected_cv: CondVar::new(),
        }
    }

    pub fn admitted(&self) -> bool {
        self.admitted.get()
    }
}

#[derive(Debug, Default)]
pub struct ListenerState {
    queue: VecDeque<Rc<ConnectionRequest>>,
    req_available: CondVar,
}

#[derive(Debug)]
pub struct PeerState {
    peer: Weak<Socket>,
    read_pipe: Rc<Pipe>,
    write_pipe: Rc<Pipe>,
}

/// The role a socket has been promoted to
#[derive(Debug)]
pub enum SocketRole {
    Unbound,
    Listener(ListenerState),
    Peer(PeerState),
}

/// Socket control block
#[derive(Debug)]
pub struct Socket {
    port: Port,
    role: RefCell<SocketRole>,
    closed: Cell<bool>,
}

impl Socket {
    pub fn new(port: Port) -> Rc<Self> {
        Rc::new(Self {
            port,
            role: RefCell::new(SocketRole::Unbound),
            closed: Cell::new(false),
        })
    }

    pub fn port(&self) -> Port {
        self.port
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    pub fn is_unbound(&self) -> bool {
        matches!(&*self.role.borrow(), SocketRole::Unbound)
    }

    pub fn is_listener(&self) -> bool {
        matches!(&*self.role.borrow(), SocketRole::Listener(_))
    }

    pub fn is_peer(&self) -> bool {
        matches!(&*self.role.borrow(), SocketRole::Peer(_))
    }

    /// The connected peer, while it still exists
    pub fn peer(&self) -> Option<Rc<Socket>> {
        match &*self.role.borrow() {
            SocketRole::Peer(p) => p.peer.upgrade(),
            _ => None,
        }
    }

    /// Connection requests waiting for accept
    pub fn pending_requests(&self) -> usize {
        match &*self.role.borrow() {
            SocketRole::Listener(l) => l.queue.len(),
            _ => 0,
        }
    }

    /// Become the listener of this socket's port
    pub fn listen(self: &Rc<Self>, ports: &mut PortMap) -> SocketResult<()> {
        if self.port == NOPORT {
            return Err(SocketError::NoPort);
        }
        if !self.is_unbound() {
            return Err(SocketError::InvalidState);
        }
        if ports.get(self.port).is_some() {
            return Err(SocketError::AddressInUse);
        }

        *self.role.borrow_mut() = SocketRole::Listener(ListenerState::default());
        ports.register(self.port, self.clone());
        Ok(())
    }

    /// Block until a connection request is queued
    pub async fn wait_request(&self, exec: &Executor) -> SocketResult<()> {
        loop {
            let cv = {
                let role = self.role.borrow();
                let SocketRole::Listener(listener) = &*role else {
                    return Err(SocketError::NotListener);
                };
                if self.closed.get() {
                    return Err(SocketError::ListenerClosed);
                }
                if !listener.queue.is_empty() {
                    return Ok(());
                }
                listener.req_available.clone()
            };
            cv.wait(exec, SchedCause::Socket).await;
        }
    }

    /// Admit the oldest queued request that can still be connected.
    ///
    /// Builds the server-side peer and the two pipes, promotes both sides,
    /// and wakes the connector. `None` if no admissible request is queued.
    pub fn admit_next(&self, pipe_capacity: usize) -> Option<Rc<Socket>> {
        loop {
            let request = {
                let mut role = self.role.borrow_mut();
                let SocketRole::Listener(listener) = &mut *role else {
                    return None;
                };
                listener.queue.pop_front()?
            };

            let requester = &request.requester;
            if requester.is_closed() || !requester.is_unbound() {
                // Wake the connector so it sees the refusal now
                request.connected_cv.broadcast();
                continue;
            }

            let server = Socket::new(self.port);
            let client_to_server = Rc::new(Pipe::new(pipe_capacity));
            let server_to_client = Rc::new(Pipe::new(pipe_capacity));

            *server.role.borrow_mut() = SocketRole::Peer(PeerState {
                peer: Rc::downgrade(requester),
                read_pipe: client_to_server.clone(),
                write_pipe: server_to_client.clone(),
            });
            *requester.role.borrow_mut() = SocketRole::Peer(PeerState {
                peer: Rc::downgrade(&server),
                read_pipe: server_to_client,
                write_pipe: client_to_server,
            });

            request.admitted.set(true);
            request.connected_cv.broadcast();
            return Some(server);
        }
    }

    /// Connect to the listener on `port`, waiting at most `timeout_ms`
    pub async fn connect(
        self: &Rc<Self>,
        exec: &Executor,
        ports: &RefCell<PortMap>,
        port: Port,
        timeout_ms: f64,
    ) -> SocketResult<()> {
        let listener = {
            let ports = ports.borrow();
            ports.validate(port)?;
            if port == NOPORT {
                return Err(SocketError::InvalidPort);
            }
            if !self.is_unbound() {
                return Err(SocketError::InvalidState);
            }
            ports.get(port).ok_or(SocketError::ConnectionRefused)?
        };

        let request = Rc::new(ConnectionRequest::new(self.clone()));
        {
            let mut role = listener.role.borrow_mut();
            let SocketRole::Listener(state) = &mut *role else {
                return Err(SocketError::ConnectionRefused);
            };
            state.queue.push_back(request.clone());
            state.req_available.broadcast();
        }

        let outcome = request
            .connected_cv
            .timed_wait(exec, SchedCause::Socket, timeout_ms)
            .await;

        if request.admitted() {
            return Ok(());
        }

        listener.withdraw_request(&request);
        match outcome {
            WaitOutcome::TimedOut => Err(SocketError::TimedOut),
            WaitOutcome::Signaled => Err(SocketError::ConnectionRefused),
        }
    }

    fn withdraw_request(&self, request: &Rc<ConnectionRequest>) {
        if let SocketRole::Listener(listener) = &mut *self.role.borrow_mut() {
            listener.queue.retain(|r| !Rc::ptr_eq(r, request));
        }
    }

    /// Close one or both directions of a connected socket
    pub fn shutdown(&self, mode: ShutdownMode) -> SocketResult<()> {
        let role = self.role.borrow();
        let SocketRole::Peer(peer) = &*role else {
            return Err(SocketError::NotConnected);
        };

        match mode {
            ShutdownMode::Read => peer
                .read_pipe
                .close_reader()
                .map(|_| ())
                .map_err(|_| SocketError::AlreadyShutdown),
            ShutdownMode::Write => peer
                .write_pipe
                .close_writer()
                .map(|_| ())
                .map_err(|_| SocketError::AlreadyShutdown),
            ShutdownMode::Both => {
                if !peer.read_pipe.reader_open() || !peer.write_pipe.writer_open() {
                    return Err(SocketError::AlreadyShutdown);
                }
                let _ = peer.read_pipe.close_reader();
                let _ = peer.write_pipe.close_writer();
                Ok(())
            }
        }
    }

    fn pipes(&self) -> SocketResult<(Rc<Pipe>, Rc<Pipe>)> {
        match &*self.role.borrow() {
            SocketRole::Peer(p) => Ok((p.read_pipe.clone(), p.write_pipe.clone())),
            _ => Err(SocketError::NotConnected),
        }
    }

    pub async fn read(&self, exec: &Executor, buf: &mut [u8]) -> SyscallResult<usize> {
        let (read_pipe, _) = self.pipes()?;
        Ok(read_pipe.read(exec, buf).await?)
    }

    pub async fn write(&self, exec: &Executor, data: &[u8]) -> SyscallResult<usize> {
        let (_, write_pipe) = self.pipes()?;
        Ok(write_pipe.write(exec, data).await?)
    }

    /// Final close: withdraw a listener (failing its waiters), or close
    /// whatever pipe ends a peer still holds
    pub fn close(&self, ports: &mut PortMap) {
        self.closed.set(true);

        let queued = {
            let mut role = self.role.borrow_mut();
            match &mut *role {
                SocketRole::Unbound => VecDeque::new(),
                SocketRole::Listener(listener) => {
                    ports.withdraw(self.port, self);
                    listener.req_available.broadcast();
                    std::mem::take(&mut listener.queue)
                }
                SocketRole::Peer(peer) => {
                    let _ = peer.read_pipe.close_reader();
                    let _ = peer.write_pipe.close_writer();
                    VecDeque::new()
                }
            }
        };

        for request in queued {
            request.connected_cv.broadcast();
        }
    }
}

/// Port registry: at most one listener per port
#[derive(Debug)]
pub struct PortMap {
    slots: Vec<Option<Rc<Socket>>>,
}

impl PortMap {
    pub fn new(max_port: Port) -> Self {
        Self {
            slots: vec![None; max_port as usize + 1],
        }
    }

    pub fn max_port(&self) -> Port {
        (self.slots.len() - 1) as Port
    }

    /// Accepts `NOPORT` and every port up to `max_port`
    pub fn validate(&self, port: Port) -> SocketResult<()> {
        if (port as usize) < self.slots.len() {
            Ok(())
        } else {
            Err(SocketError::InvalidPort)
        }
    }

    pub fn get(&self, port: Port) -> Option<Rc<Socket>> {
        self.slots.get(port as usize)?.clone()
    }

    fn register(&mut self, port: Port, socket: Rc<Socket>) {
        self.slots[port as usize] = Some(socket);
    }

    /// Clear `port` if `socket` is the one registered there
    fn withdraw(&mut self, port: Port, socket: &Socket) {
        if let Some(slot) = self.slots.get_mut(port as usize)
            && slot
                .as_ref()
                .is_some_and(|s| std::ptr::eq(Rc::as_ptr(s), socket))
        {
            *slot = None;
        }
    }

    /// Ports with a listener
    pub fn listening(&self) -> Vec<Port> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(p, _)| p as Port)
            .collect()
    }
}

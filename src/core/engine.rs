//! The socket multiplexing engine.
//!
//! [`Engine`] owns a handle→connection table, a readiness-driven poll
//! cycle, the event queue, and the timer manager used for connect
//! timeouts and pending-close linger deadlines. All state is mutated
//! from the driving thread (`&mut self`); other threads reach the
//! engine only through a cloneable [`Postbox`], which serializes
//! cross-thread posts and can wake an in-progress [`Engine::wait`].
//!
//! Readiness is edge-style: the engine reads until `WouldBlock`,
//! writes until `WouldBlock`, and flushes eagerly at `send` time so a
//! socket that is already writable never waits for a new edge.

use crate::base::context::IoResultExt;
use crate::base::neterror::NetError;
use crate::codec::header::HeaderMode;
use crate::core::conn::{
    Conn, DgramNode, ListenerNode, SockKind, SockState, MASK_READ, MASK_WRITE,
};
use crate::core::event::{close_code, Event, EventInfo, EventKind, EventQueue};
use crate::core::filter::{Filter, FilterFactory, FilterVerdict};
use crate::core::{Hid, HID_INDEX_BITS};
use crate::timer::manager::TimerManager;
use mio::net::{TcpListener, TcpStream, UdpSocket};
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use std::any::Any;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

const NONE: u32 = u32::MAX;
const WAKER_TOKEN: Token = Token(usize::MAX);
/// Wheel granularity in milliseconds.
const TIMER_INTERVAL_MS: u32 = 10;
/// Default pending-close flush deadline.
const DEFAULT_LINGER_MS: u32 = 5_000;
const READ_CHUNK: usize = 64 * 1024;
const LISTEN_BACKLOG: i32 = 1024;

/// Accept-time validator: return `true` to accept the remote peer.
pub type Firewall = Box<dyn Fn(&SocketAddr, Hid) -> bool>;

/// Per-connection option setters.
#[derive(Debug, Clone, Copy)]
pub enum SockOpt {
    NoDelay(bool),
    ReuseAddr(bool),
    ReusePort(bool),
    /// Enable TCP keepalive with the given probe parameters.
    Keepalive { idle_secs: u32, interval_secs: u32, count: u32 },
    KeepaliveOff,
    SysSndBuf(usize),
    SysRcvBuf(usize),
    /// Buffered-bytes ceiling for this connection (0 = unlimited).
    Limited(usize),
    /// Per-message payload ceiling for this connection (0 = unlimited).
    MaxSize(usize),
    /// Emit `Progress` events as the send buffer drains.
    Progress(bool),
    /// Replace the poll-interest mask (bit 1 read, bit 2 write).
    MaskSet(u8),
    MaskAdd(u8),
    MaskDel(u8),
    /// Shut down one or both stream directions.
    Shutdown(std::net::Shutdown),
}

/// Per-connection status queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockStatus {
    /// Life-cycle state as a number (0 closed, 1 connecting, 2 established).
    State,
    /// 1 when the node speaks IPv6.
    Ipv6,
    /// 1 when established.
    Estab,
    /// Current poll-interest mask bits.
    MaskGet,
    /// Framing mode wire id.
    Header,
    /// Installed protocol id (0 = none).
    Protocol,
    /// Raw descriptor (unix).
    Fd,
}

enum Node {
    Conn(Conn),
    Listener(ListenerNode),
    Dgram(DgramNode),
}

struct Slot {
    generation: u32,
    node: Option<Node>,
    /// Insertion-order iteration links.
    prev: u32,
    next: u32,
}

#[derive(Debug, Clone, Copy)]
enum Deadline {
    Connect(Hid),
    Linger(Hid),
}

#[derive(Clone, Copy)]
struct ReadyEntry {
    index: usize,
    readable: bool,
    writable: bool,
}

struct PostShared {
    pending: Mutex<Vec<Event>>,
    waker: Waker,
}

/// Cloneable cross-thread handle to an [`Engine`].
///
/// The only engine surface other threads may touch: queued events are
/// drained into the engine's queue at the end of its next poll cycle,
/// and [`Postbox::notify`] interrupts a wait in progress.
#[derive(Clone)]
pub struct Postbox {
    shared: Arc<PostShared>,
}

impl Postbox {
    /// Queue an application `Post` event and wake the engine.
    pub fn post(&self, wparam: i64, lparam: i64, data: &[u8]) {
        self.push(EventKind::Post, wparam, lparam, data);
    }

    /// Queue an arbitrary event and wake the engine.
    pub fn push(&self, kind: EventKind, wparam: i64, lparam: i64, data: &[u8]) {
        self.shared.pending.lock().push(Event { kind, wparam, lparam, data: data.to_vec() });
        self.notify();
    }

    /// Wake an in-progress wait without queueing anything.
    pub fn notify(&self) {
        if let Err(err) = self.shared.waker.wake() {
            trace!(?err, "waker wake failed");
        }
    }
}

/// The connection multiplexing engine.
pub struct Engine {
    poll: Poll,
    events: Events,
    shared: Arc<PostShared>,
    slots: Vec<Slot>,
    free: Vec<u32>,
    head: u32,
    tail: u32,
    count: usize,
    queue: EventQueue,
    timers: TimerManager<Deadline>,
    started: Instant,
    /// Defaults applied to new connections.
    limited: usize,
    maxsize: usize,
    /// Connect deadline in ms (0 = none).
    timeout_ms: u32,
    linger_ms: u32,
    firewall: Option<Firewall>,
    factory: Option<FilterFactory>,
    parent: Option<Box<dyn Any>>,
    // reusable scratch
    ready: Vec<ReadyEntry>,
    fired: Vec<Deadline>,
    scratch: Box<[u8]>,
}

impl Engine {
    /// Create an engine with its own poller and waker.
    pub fn new() -> Result<Engine, NetError> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let mut timers = TimerManager::new(TIMER_INTERVAL_MS);
        // Latch the timer epoch at construction so deadlines scheduled
        // before the first wait measure from here.
        timers.run(0, &mut Vec::new());
        Ok(Engine {
            poll,
            events: Events::with_capacity(1024),
            shared: Arc::new(PostShared { pending: Mutex::new(Vec::new()), waker }),
            slots: Vec::new(),
            free: Vec::new(),
            head: NONE,
            tail: NONE,
            count: 0,
            queue: EventQueue::default(),
            timers,
            started: Instant::now(),
            limited: 0,
            maxsize: 0,
            timeout_ms: 0,
            linger_ms: DEFAULT_LINGER_MS,
            firewall: None,
            factory: None,
            parent: None,
            ready: Vec::new(),
            fired: Vec::new(),
            scratch: vec![0u8; READ_CHUNK].into_boxed_slice(),
        })
    }

    // ------------------------------------------------------------------
    // Node creation
    // ------------------------------------------------------------------

    /// Start an outbound connection. The handle is live immediately;
    /// `Estab` arrives once the connect completes, or a coded `Close`
    /// if it fails or times out.
    pub fn new_connect(&mut self, addr: SocketAddr, mode: HeaderMode) -> Result<Hid, NetError> {
        let stream = TcpStream::connect(addr).connect_context(addr)?;
        let mut conn = Conn::new(stream, SockKind::Out, SockState::Connecting, mode);
        conn.ipv6 = addr.is_ipv6();
        conn.peer = Some(addr);
        conn.channel.set_limit(self.limited, self.maxsize);
        let hid = self.install_conn(conn)?;
        if self.timeout_ms > 0 {
            let id = self.timers.schedule(self.timeout_ms, Deadline::Connect(hid));
            if let Ok(conn) = self.conn_mut(hid) {
                conn.connect_timer = Some(id);
            }
        }
        debug!(%hid, %addr, "connecting");
        Ok(hid)
    }

    /// Open a listener. Accepted sockets inherit `mode` and surface as
    /// `New` events carrying the peer address.
    pub fn new_listen(&mut self, addr: SocketAddr, mode: HeaderMode) -> Result<Hid, NetError> {
        let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;
        socket.set_nonblocking(true)?;
        let mut listener = TcpListener::from_std(socket.into());

        let index = self.reserve_slot()?;
        if let Err(err) =
            self.poll.registry().register(&mut listener, Token(index), Interest::READABLE)
        {
            self.free.push(index as u32);
            return Err(err.into());
        }
        let node = Node::Listener(ListenerNode {
            sock: listener,
            mode,
            tag: -1,
            ipv6: addr.is_ipv6(),
        });
        let hid = self.occupy_slot(index, node);
        self.push_event(EventKind::New, hid.raw() as i64, -1, Vec::new());
        debug!(%hid, %addr, "listening");
        Ok(hid)
    }

    /// Adopt an already-connected (or connecting) descriptor.
    pub fn new_assign(
        &mut self,
        stream: std::net::TcpStream,
        mode: HeaderMode,
        established: bool,
    ) -> Result<Hid, NetError> {
        stream.set_nonblocking(true)?;
        let stream = TcpStream::from_std(stream);
        let state = if established { SockState::Established } else { SockState::Connecting };
        let mut conn = Conn::new(stream, SockKind::Assign, state, mode);
        conn.peer = conn.stream.peer_addr().ok();
        conn.channel.set_limit(self.limited, self.maxsize);
        let hid = self.install_conn(conn)?;
        if !established && self.timeout_ms > 0 {
            let id = self.timers.schedule(self.timeout_ms, Deadline::Connect(hid));
            if let Ok(conn) = self.conn_mut(hid) {
                conn.connect_timer = Some(id);
            }
        }
        debug!(%hid, established, "assigned");
        Ok(hid)
    }

    /// Bind a raw datagram socket. `mask` subscribes readiness: bit 1
    /// read, bit 2 write, 0 none. The engine never buffers datagram
    /// payloads; `Dgram` events report readiness and the application
    /// works the socket via [`Engine::dgram`].
    pub fn new_dgram(&mut self, addr: SocketAddr, mask: u8) -> Result<Hid, NetError> {
        let mut sock = UdpSocket::bind(addr)?;
        let index = self.reserve_slot()?;
        if let Some(interest) = dgram_interest(mask) {
            if let Err(err) = self.poll.registry().register(&mut sock, Token(index), interest) {
                self.free.push(index as u32);
                return Err(err.into());
            }
        }
        let node = Node::Dgram(DgramNode { sock, tag: -1, ipv6: addr.is_ipv6(), mask });
        let hid = self.occupy_slot(index, node);
        self.push_event(EventKind::New, hid.raw() as i64, -1, Vec::new());
        debug!(%hid, %addr, mask, "dgram bound");
        Ok(hid)
    }

    // ------------------------------------------------------------------
    // Data path
    // ------------------------------------------------------------------

    /// Frame and queue one message for `hid`, flushing eagerly.
    pub fn send(&mut self, hid: Hid, data: &[u8]) -> Result<(), NetError> {
        self.send_parts(hid, &[data], 0)
    }

    /// Frame the concatenation of `parts` as one message. The `mask`
    /// byte rides in a `DwordMask` header.
    pub fn send_vector(&mut self, hid: Hid, parts: &[&[u8]], mask: u8) -> Result<(), NetError> {
        self.send_parts(hid, parts, mask)
    }

    fn send_parts(&mut self, hid: Hid, parts: &[&[u8]], mask: u8) -> Result<(), NetError> {
        let index = hid.index();
        let flush_result = {
            let conn = self.conn_mut(hid)?;
            if conn.closing || conn.state == SockState::Closed {
                return Err(NetError::BadState);
            }
            if let Some(mut filter) = conn.filter.take() {
                let mut buf: Vec<u8> = Vec::with_capacity(parts.iter().map(|p| p.len()).sum());
                for part in parts {
                    buf.extend_from_slice(part);
                }
                let verdict = filter.on_write(hid, &mut buf);
                conn.filter = Some(filter);
                if verdict == FilterVerdict::Veto {
                    return Ok(());
                }
                conn.channel.send(&buf, mask)?;
            } else {
                conn.channel.send_vector(parts, mask)?;
            }
            if conn.state == SockState::Established {
                conn.flush()
            } else {
                Ok(0)
            }
        };
        match flush_result {
            Ok(_) => {
                self.update_interest(index);
                Ok(())
            }
            Err(err) => {
                warn!(%hid, ?err, "flush failed during send");
                self.teardown(index, close_code::RESET);
                Ok(())
            }
        }
    }

    /// Bytes framed for `hid` but not yet written to its socket.
    pub fn remain(&self, hid: Hid) -> Result<usize, NetError> {
        match self.node(hid)? {
            Node::Conn(conn) => Ok(conn.channel.remain()),
            _ => Err(NetError::UnsupportedOption),
        }
    }

    /// Close a handle with an application exit code.
    ///
    /// A connection with unflushed bytes enters pending-close: new
    /// sends are refused, the backlog keeps flushing, and teardown
    /// happens once drained or when the linger deadline fires.
    pub fn close(&mut self, hid: Hid, code: u32) -> Result<(), NetError> {
        let index = hid.index();
        let drained = match self.node_mut(hid)? {
            Node::Conn(conn) => {
                if conn.closing {
                    // Already pending; keep the first deadline.
                    return Ok(());
                }
                if conn.state == SockState::Established {
                    // Best-effort immediate flush; errors fall through
                    // to the teardown below.
                    let _ = conn.flush();
                }
                conn.channel.remain() == 0
            }
            _ => true,
        };
        if drained {
            self.teardown(index, code);
            return Ok(());
        }
        let linger_ms = self.linger_ms;
        let id = self.timers.schedule(linger_ms, Deadline::Linger(hid));
        if let Ok(conn) = self.conn_mut(hid) {
            conn.closing = true;
            conn.exitcode = code;
            conn.linger_timer = Some(id);
        }
        self.update_interest(index);
        trace!(%hid, code, "pending close");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Event queue
    // ------------------------------------------------------------------

    /// Drain one event into `out` (FIFO). `out = None` queries the
    /// front event's payload size without consuming it.
    pub fn read_event(&mut self, out: Option<&mut [u8]>) -> Result<EventInfo, NetError> {
        self.queue.read(out)
    }

    /// Drain one event whole.
    pub fn poll_event(&mut self) -> Option<Event> {
        self.queue.pop()
    }

    /// Events currently queued.
    pub fn pending_events(&self) -> usize {
        self.queue.len()
    }

    /// Queue an application `Post` event from the driving thread.
    pub fn post(&mut self, wparam: i64, lparam: i64, data: &[u8]) {
        self.push_event(EventKind::Post, wparam, lparam, data.to_vec());
    }

    /// Queue an arbitrary event from the driving thread.
    pub fn push(&mut self, kind: EventKind, wparam: i64, lparam: i64, data: &[u8]) {
        self.push_event(kind, wparam, lparam, data.to_vec());
    }

    /// Cross-thread handle for `post`/`push`/`notify`.
    pub fn postbox(&self) -> Postbox {
        Postbox { shared: Arc::clone(&self.shared) }
    }

    /// Wake an in-progress [`Engine::wait`] early.
    pub fn notify(&self) {
        if let Err(err) = self.shared.waker.wake() {
            trace!(?err, "waker wake failed");
        }
    }

    // ------------------------------------------------------------------
    // Poll cycle
    // ------------------------------------------------------------------

    /// One poll cycle: wait for readiness at most `millisec` ms (also
    /// bounded by the next timer expiry), service ready sockets, run
    /// timers, then drain cross-thread posts. Queued events are ready
    /// to read afterwards.
    pub fn wait(&mut self, millisec: u32) -> Result<(), NetError> {
        let budget = match self.timers.next_timeout_ms(millisec) {
            Some(hint) => hint.min(millisec),
            None => millisec,
        };
        match self.poll.poll(&mut self.events, Some(Duration::from_millis(budget as u64))) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }

        let mut ready = std::mem::take(&mut self.ready);
        ready.clear();
        for event in self.events.iter() {
            if event.token() == WAKER_TOKEN {
                continue;
            }
            ready.push(ReadyEntry {
                index: event.token().0,
                readable: event.is_readable() || event.is_read_closed(),
                writable: event.is_writable(),
            });
        }
        for i in 0..ready.len() {
            self.dispatch(ready[i]);
        }
        self.ready = ready;

        let now = self.now_ms();
        let mut fired = std::mem::take(&mut self.fired);
        self.timers.run(now, &mut fired);
        for deadline in fired.drain(..) {
            self.expire(deadline);
        }
        self.fired = fired;

        let posted: Vec<Event> = std::mem::take(&mut *self.shared.pending.lock());
        for event in posted {
            self.queue.push(event);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Options and status
    // ------------------------------------------------------------------

    /// Apply a per-connection socket option.
    pub fn option(&mut self, hid: Hid, opt: SockOpt) -> Result<(), NetError> {
        let index = hid.index();
        let mut reinterest = false;
        {
            let node = self.node_mut(hid)?;
            match (node, opt) {
                (Node::Conn(conn), SockOpt::NoDelay(on)) => conn.stream.set_nodelay(on)?,
                (Node::Conn(conn), SockOpt::ReuseAddr(on)) => {
                    SockRef::from(&conn.stream).set_reuse_address(on)?
                }
                (Node::Listener(l), SockOpt::ReuseAddr(on)) => {
                    SockRef::from(&l.sock).set_reuse_address(on)?
                }
                (Node::Dgram(d), SockOpt::ReuseAddr(on)) => {
                    SockRef::from(&d.sock).set_reuse_address(on)?
                }
                #[cfg(unix)]
                (Node::Conn(conn), SockOpt::ReusePort(on)) => {
                    SockRef::from(&conn.stream).set_reuse_port(on)?
                }
                #[cfg(unix)]
                (Node::Listener(l), SockOpt::ReusePort(on)) => {
                    SockRef::from(&l.sock).set_reuse_port(on)?
                }
                (Node::Conn(conn), SockOpt::Keepalive { idle_secs, interval_secs, count }) => {
                    let params = TcpKeepalive::new()
                        .with_time(Duration::from_secs(idle_secs as u64))
                        .with_interval(Duration::from_secs(interval_secs as u64));
                    #[cfg(not(windows))]
                    let params = params.with_retries(count);
                    #[cfg(windows)]
                    let _ = count;
                    SockRef::from(&conn.stream).set_tcp_keepalive(&params)?
                }
                (Node::Conn(conn), SockOpt::KeepaliveOff) => {
                    SockRef::from(&conn.stream).set_keepalive(false)?
                }
                (Node::Conn(conn), SockOpt::SysSndBuf(size)) => {
                    SockRef::from(&conn.stream).set_send_buffer_size(size)?
                }
                (Node::Conn(conn), SockOpt::SysRcvBuf(size)) => {
                    SockRef::from(&conn.stream).set_recv_buffer_size(size)?
                }
                (Node::Dgram(d), SockOpt::SysSndBuf(size)) => {
                    SockRef::from(&d.sock).set_send_buffer_size(size)?
                }
                (Node::Dgram(d), SockOpt::SysRcvBuf(size)) => {
                    SockRef::from(&d.sock).set_recv_buffer_size(size)?
                }
                (Node::Conn(conn), SockOpt::Limited(limit)) => conn.channel.set_limited(limit),
                (Node::Conn(conn), SockOpt::MaxSize(size)) => conn.channel.set_maxsize(size),
                (Node::Conn(conn), SockOpt::Progress(on)) => conn.progress = on,
                (Node::Conn(conn), SockOpt::MaskSet(bits)) => {
                    conn.mask = bits & (MASK_READ | MASK_WRITE);
                    reinterest = true;
                }
                (Node::Conn(conn), SockOpt::MaskAdd(bits)) => {
                    conn.mask |= bits & (MASK_READ | MASK_WRITE);
                    reinterest = true;
                }
                (Node::Conn(conn), SockOpt::MaskDel(bits)) => {
                    conn.mask &= !bits;
                    reinterest = true;
                }
                (Node::Conn(conn), SockOpt::Shutdown(how)) => conn.stream.shutdown(how)?,
                _ => return Err(NetError::UnsupportedOption),
            }
        }
        if reinterest {
            self.update_interest(index);
        }
        Ok(())
    }

    /// Query connection status.
    pub fn status(&self, hid: Hid, query: SockStatus) -> Result<i64, NetError> {
        let node = self.node(hid)?;
        Ok(match (node, query) {
            (Node::Conn(conn), SockStatus::State) => conn.state as i64,
            (Node::Listener(_), SockStatus::State) => SockState::Established as i64,
            (Node::Dgram(_), SockStatus::State) => SockState::Established as i64,
            (Node::Conn(conn), SockStatus::Ipv6) => conn.ipv6 as i64,
            (Node::Listener(l), SockStatus::Ipv6) => l.ipv6 as i64,
            (Node::Dgram(d), SockStatus::Ipv6) => d.ipv6 as i64,
            (Node::Conn(conn), SockStatus::Estab) => {
                (conn.state == SockState::Established) as i64
            }
            (_, SockStatus::Estab) => 1,
            (Node::Conn(conn), SockStatus::MaskGet) => conn.mask as i64,
            (Node::Dgram(d), SockStatus::MaskGet) => d.mask as i64,
            (Node::Conn(conn), SockStatus::Header) => conn.channel.header_mode().as_u8() as i64,
            (Node::Listener(l), SockStatus::Header) => l.mode.as_u8() as i64,
            (Node::Conn(conn), SockStatus::Protocol) => conn.protocol as i64,
            #[cfg(unix)]
            (node, SockStatus::Fd) => {
                use std::os::unix::io::AsRawFd;
                match node {
                    Node::Conn(conn) => conn.stream.as_raw_fd() as i64,
                    Node::Listener(l) => l.sock.as_raw_fd() as i64,
                    Node::Dgram(d) => d.sock.as_raw_fd() as i64,
                }
            }
            _ => return Err(NetError::UnsupportedOption),
        })
    }

    /// Connection kind for `hid`.
    pub fn kind(&self, hid: Hid) -> Result<SockKind, NetError> {
        Ok(match self.node(hid)? {
            Node::Conn(conn) => conn.kind,
            Node::Listener(_) => SockKind::Listen,
            Node::Dgram(_) => SockKind::Dgram,
        })
    }

    /// Opaque application tag (-1 until set).
    pub fn tag(&self, hid: Hid) -> Result<i64, NetError> {
        Ok(match self.node(hid)? {
            Node::Conn(conn) => conn.tag,
            Node::Listener(l) => l.tag,
            Node::Dgram(d) => d.tag,
        })
    }

    /// Attach an opaque application tag, echoed in events.
    pub fn set_tag(&mut self, hid: Hid, tag: i64) -> Result<(), NetError> {
        match self.node_mut(hid)? {
            Node::Conn(conn) => conn.tag = tag,
            Node::Listener(l) => l.tag = tag,
            Node::Dgram(d) => d.tag = tag,
        }
        Ok(())
    }

    /// Key the outbound cipher for `hid`.
    pub fn set_send_key(&mut self, hid: Hid, key: &[u8]) -> Result<(), NetError> {
        match self.node_mut(hid)? {
            Node::Conn(conn) => {
                conn.channel.set_send_key(key);
                Ok(())
            }
            _ => Err(NetError::UnsupportedOption),
        }
    }

    /// Key the inbound cipher for `hid`.
    pub fn set_recv_key(&mut self, hid: Hid, key: &[u8]) -> Result<(), NetError> {
        match self.node_mut(hid)? {
            Node::Conn(conn) => {
                conn.channel.set_recv_key(key);
                Ok(())
            }
            _ => Err(NetError::UnsupportedOption),
        }
    }

    /// Suspend or resume read-side polling for `hid`.
    pub fn disable(&mut self, hid: Hid, disabled: bool) -> Result<(), NetError> {
        let index = hid.index();
        match self.node_mut(hid)? {
            Node::Conn(conn) => conn.disabled = disabled,
            _ => return Err(NetError::UnsupportedOption),
        }
        self.update_interest(index);
        Ok(())
    }

    /// Local address of the node's socket.
    pub fn sockname(&self, hid: Hid) -> Result<SocketAddr, NetError> {
        Ok(match self.node(hid)? {
            Node::Conn(conn) => conn.stream.local_addr()?,
            Node::Listener(l) => l.sock.local_addr()?,
            Node::Dgram(d) => d.sock.local_addr()?,
        })
    }

    /// Peer address of an established connection.
    pub fn peername(&self, hid: Hid) -> Result<SocketAddr, NetError> {
        match self.node(hid)? {
            Node::Conn(conn) => {
                conn.peer.ok_or(NetError::BadState).or_else(|_| Ok(conn.stream.peer_addr()?))
            }
            _ => Err(NetError::UnsupportedOption),
        }
    }

    /// Borrow a datagram node's socket for `recv_from`/`send_to`.
    pub fn dgram(&self, hid: Hid) -> Result<&UdpSocket, NetError> {
        match self.node(hid)? {
            Node::Dgram(d) => Ok(&d.sock),
            _ => Err(NetError::UnsupportedOption),
        }
    }

    /// Number of live nodes.
    pub fn nfds(&self) -> usize {
        self.count
    }

    /// First live handle in creation order.
    pub fn node_head(&self) -> Option<Hid> {
        (self.head != NONE).then(|| self.hid_at(self.head as usize))
    }

    /// Next live handle after `hid` in creation order.
    pub fn node_next(&self, hid: Hid) -> Option<Hid> {
        let slot = self.live_slot(hid)?;
        (slot.next != NONE).then(|| self.hid_at(slot.next as usize))
    }

    /// Previous live handle before `hid` in creation order.
    pub fn node_prev(&self, hid: Hid) -> Option<Hid> {
        let slot = self.live_slot(hid)?;
        (slot.prev != NONE).then(|| self.hid_at(slot.prev as usize))
    }

    // ------------------------------------------------------------------
    // Engine-wide configuration
    // ------------------------------------------------------------------

    /// Default buffered-bytes and per-message ceilings for new
    /// connections (0 disables either).
    pub fn set_limit(&mut self, limited: usize, maxsize: usize) {
        self.limited = limited;
        self.maxsize = maxsize;
    }

    /// Deadline for `Connecting` handles; 0 disables. Exceeding it
    /// force-closes with [`close_code::TIMEOUT`].
    pub fn set_timeout(&mut self, millisec: u32) {
        self.timeout_ms = millisec;
    }

    /// Pending-close flush deadline (default 5000 ms).
    pub fn set_linger(&mut self, millisec: u32) {
        self.linger_ms = millisec.max(1);
    }

    /// Install (or clear) the accept-time IP validator. Rejected
    /// sockets are closed silently with no event.
    pub fn firewall(&mut self, validator: Option<Firewall>) {
        self.firewall = validator;
    }

    /// Install (or clear) the protocol filter factory.
    pub fn set_factory(&mut self, factory: Option<FilterFactory>) {
        self.factory = factory;
    }

    /// Attach an opaque parent/delegation context for nested protocol
    /// stacks.
    pub fn set_parent(&mut self, parent: Option<Box<dyn Any>>) {
        self.parent = parent;
    }

    /// Borrow the parent context.
    pub fn parent(&self) -> Option<&dyn Any> {
        self.parent.as_deref()
    }

    /// Install a filter built by the registered factory for
    /// `protocol`, replacing any current filter on `hid`.
    pub fn set_protocol(&mut self, hid: Hid, protocol: u32) -> Result<(), NetError> {
        let filter = {
            let factory = self.factory.as_ref().ok_or(NetError::UnsupportedOption)?;
            factory(hid, protocol).ok_or(NetError::UnsupportedOption)?
        };
        self.install_filter(hid, Some(filter), protocol)
    }

    /// Install or remove a filter directly.
    pub fn set_filter(
        &mut self,
        hid: Hid,
        filter: Option<Box<dyn Filter>>,
    ) -> Result<(), NetError> {
        self.install_filter(hid, filter, 0)
    }

    fn install_filter(
        &mut self,
        hid: Hid,
        filter: Option<Box<dyn Filter>>,
        protocol: u32,
    ) -> Result<(), NetError> {
        let conn = self.conn_mut(hid)?;
        if let Some(mut old) = conn.filter.take() {
            old.on_remove(hid);
        }
        conn.protocol = protocol;
        if let Some(mut new) = filter {
            new.on_install(hid);
            conn.filter = Some(new);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn now_ms(&self) -> u32 {
        self.started.elapsed().as_millis() as u32
    }

    fn push_event(&mut self, kind: EventKind, wparam: i64, lparam: i64, data: Vec<u8>) {
        self.queue.push(Event { kind, wparam, lparam, data });
    }

    fn hid_at(&self, index: usize) -> Hid {
        Hid::new(index as u32, self.slots[index].generation)
    }

    fn live_slot(&self, hid: Hid) -> Option<&Slot> {
        let slot = self.slots.get(hid.index())?;
        (slot.generation == hid.generation() && slot.node.is_some()).then_some(slot)
    }

    fn node(&self, hid: Hid) -> Result<&Node, NetError> {
        self.live_slot(hid).and_then(|s| s.node.as_ref()).ok_or(NetError::NotFound)
    }

    fn node_mut(&mut self, hid: Hid) -> Result<&mut Node, NetError> {
        let slot = self.slots.get_mut(hid.index()).ok_or(NetError::NotFound)?;
        if slot.generation != hid.generation() {
            return Err(NetError::NotFound);
        }
        slot.node.as_mut().ok_or(NetError::NotFound)
    }

    fn conn_mut(&mut self, hid: Hid) -> Result<&mut Conn, NetError> {
        match self.node_mut(hid)? {
            Node::Conn(conn) => Ok(conn),
            _ => Err(NetError::BadState),
        }
    }

    fn reserve_slot(&mut self) -> Result<usize, NetError> {
        if let Some(index) = self.free.pop() {
            return Ok(index as usize);
        }
        if self.slots.len() >= 1 << HID_INDEX_BITS {
            return Err(NetError::TableFull);
        }
        self.slots.push(Slot { generation: 0, node: None, prev: NONE, next: NONE });
        Ok(self.slots.len() - 1)
    }

    fn occupy_slot(&mut self, index: usize, node: Node) -> Hid {
        let tail = self.tail;
        let slot = &mut self.slots[index];
        slot.node = Some(node);
        slot.prev = tail;
        slot.next = NONE;
        if tail != NONE {
            self.slots[tail as usize].next = index as u32;
        } else {
            self.head = index as u32;
        }
        self.tail = index as u32;
        self.count += 1;
        self.hid_at(index)
    }

    fn free_slot(&mut self, index: usize) {
        let (prev, next) = {
            let slot = &self.slots[index];
            (slot.prev, slot.next)
        };
        if prev != NONE {
            self.slots[prev as usize].next = next;
        } else {
            self.head = next;
        }
        if next != NONE {
            self.slots[next as usize].prev = prev;
        } else {
            self.tail = prev;
        }
        let slot = &mut self.slots[index];
        slot.prev = NONE;
        slot.next = NONE;
        // Bump the generation so the freed handle value never recurs.
        slot.generation = (slot.generation + 1) & (u32::MAX >> HID_INDEX_BITS);
        self.free.push(index as u32);
        self.count -= 1;
    }

    fn install_conn(&mut self, mut conn: Conn) -> Result<Hid, NetError> {
        let index = self.reserve_slot()?;
        if let Some(interest) = conn_interest(&conn) {
            if let Err(err) =
                self.poll.registry().register(&mut conn.stream, Token(index), interest)
            {
                self.free.push(index as u32);
                return Err(err.into());
            }
            conn.registered = Some(interest);
        }
        let hid = self.occupy_slot(index, Node::Conn(conn));
        self.push_event(EventKind::New, hid.raw() as i64, -1, Vec::new());
        Ok(hid)
    }

    /// Re-register a connection's stream to match its desired
    /// readiness subscription.
    fn update_interest(&mut self, index: usize) {
        let Some(slot) = self.slots.get_mut(index) else { return };
        let Some(Node::Conn(conn)) = slot.node.as_mut() else { return };
        let desired = conn_interest(conn);
        if desired == conn.registered {
            return;
        }
        let registry = self.poll.registry();
        let result = match (conn.registered, desired) {
            (None, Some(interest)) => registry.register(&mut conn.stream, Token(index), interest),
            (Some(_), Some(interest)) => {
                registry.reregister(&mut conn.stream, Token(index), interest)
            }
            (Some(_), None) => registry.deregister(&mut conn.stream),
            (None, None) => Ok(()),
        };
        match result {
            Ok(()) => conn.registered = desired,
            Err(err) => warn!(index, ?err, "interest update failed"),
        }
    }

    fn dispatch(&mut self, entry: ReadyEntry) {
        #[derive(Clone, Copy)]
        enum Tag {
            Listener,
            Dgram,
            Conn,
        }
        let index = entry.index;
        let tag = match self.slots.get(index).and_then(|slot| slot.node.as_ref()) {
            Some(Node::Listener(_)) => Tag::Listener,
            Some(Node::Dgram(_)) => Tag::Dgram,
            Some(Node::Conn(_)) => Tag::Conn,
            None => return,
        };
        match tag {
            Tag::Listener => {
                if entry.readable {
                    self.accept_loop(index);
                }
            }
            Tag::Dgram => self.dgram_ready(index, entry),
            Tag::Conn => {
                if entry.writable {
                    self.handle_writable(index);
                }
                if entry.readable {
                    self.handle_readable(index);
                }
            }
        }
    }

    fn accept_loop(&mut self, index: usize) {
        let listener_hid = self.hid_at(index);
        loop {
            let (accepted, mode) = {
                let Some(Node::Listener(listener)) = self.slots[index].node.as_ref() else {
                    return;
                };
                (listener.sock.accept(), listener.mode)
            };
            match accepted {
                Ok((stream, peer)) => {
                    if let Some(validator) = self.firewall.as_ref() {
                        if !validator(&peer, listener_hid) {
                            trace!(%peer, "firewall rejected");
                            continue;
                        }
                    }
                    let mut conn = Conn::new(stream, SockKind::In, SockState::Established, mode);
                    conn.ipv6 = peer.is_ipv6();
                    conn.peer = Some(peer);
                    conn.channel.set_limit(self.limited, self.maxsize);
                    let interest = conn_interest(&conn);
                    let hid = match self.reserve_slot() {
                        Ok(slot_index) => {
                            if let Some(interest) = interest {
                                if let Err(err) = self.poll.registry().register(
                                    &mut conn.stream,
                                    Token(slot_index),
                                    interest,
                                ) {
                                    warn!(?err, "register accepted socket failed");
                                    self.free.push(slot_index as u32);
                                    continue;
                                }
                                conn.registered = Some(interest);
                            }
                            self.occupy_slot(slot_index, Node::Conn(conn))
                        }
                        Err(_) => {
                            warn!(%peer, "handle table full, dropping accept");
                            continue;
                        }
                    };
                    trace!(%hid, %peer, "accepted");
                    self.push_event(
                        EventKind::New,
                        hid.raw() as i64,
                        listener_hid.raw() as i64,
                        peer.to_string().into_bytes(),
                    );
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(%listener_hid, ?err, "accept failed");
                    break;
                }
            }
        }
    }

    fn dgram_ready(&mut self, index: usize, entry: ReadyEntry) {
        let hid = self.hid_at(index);
        let Some(Node::Dgram(dgram)) = self.slots[index].node.as_ref() else { return };
        let mut bits = 0u8;
        if entry.readable && dgram.mask & MASK_READ != 0 {
            bits |= MASK_READ;
        }
        if entry.writable && dgram.mask & MASK_WRITE != 0 {
            bits |= MASK_WRITE;
        }
        if bits != 0 {
            let tag = dgram.tag;
            self.push_event(EventKind::Dgram, hid.raw() as i64, tag, vec![bits]);
        }
    }

    fn handle_writable(&mut self, index: usize) {
        let hid = self.hid_at(index);
        enum Outcome {
            None,
            Estab,
            Teardown(u32),
        }
        let mut outcome = Outcome::None;
        let mut progress_event = None;
        let mut cancel_timer = None;
        {
            let Some(Node::Conn(conn)) = self.slots[index].node.as_mut() else { return };
            if conn.state == SockState::Connecting {
                match conn.stream.take_error() {
                    Ok(Some(err)) => {
                        debug!(%hid, ?err, "connect failed");
                        outcome = Outcome::Teardown(close_code::RESET);
                    }
                    Err(err) => {
                        debug!(%hid, ?err, "connect status unavailable");
                        outcome = Outcome::Teardown(close_code::RESET);
                    }
                    Ok(None) => match conn.stream.peer_addr() {
                        Ok(peer) => {
                            conn.peer = Some(peer);
                            conn.state = SockState::Established;
                            cancel_timer = conn.connect_timer.take();
                            if !conn.closing {
                                outcome = Outcome::Estab;
                            }
                        }
                        Err(ref e)
                            if e.kind() == io::ErrorKind::NotConnected
                                || e.kind() == io::ErrorKind::WouldBlock =>
                        {
                            // Spurious wakeup; the connect is still in
                            // flight.
                            return;
                        }
                        Err(err) => {
                            debug!(%hid, ?err, "connect failed");
                            outcome = Outcome::Teardown(close_code::RESET);
                        }
                    },
                }
            }
            if matches!(outcome, Outcome::None | Outcome::Estab)
                && conn.state == SockState::Established
            {
                match conn.flush() {
                    Ok(written) => {
                        if conn.progress && written > 0 {
                            progress_event = Some((conn.tag, conn.channel.remain()));
                        }
                        if conn.closing && conn.channel.remain() == 0 {
                            outcome = Outcome::Teardown(conn.exitcode);
                        }
                    }
                    Err(err) => {
                        debug!(%hid, ?err, "write failed");
                        outcome = Outcome::Teardown(close_code::RESET);
                    }
                }
            }
        }
        if let Some(id) = cancel_timer {
            self.timers.cancel(id);
        }
        match outcome {
            Outcome::Teardown(code) => {
                self.teardown(index, code);
                return;
            }
            Outcome::Estab => {
                let tag = self.tag(hid).unwrap_or(-1);
                debug!(%hid, "established");
                self.push_event(EventKind::Estab, hid.raw() as i64, tag, Vec::new());
            }
            Outcome::None => {}
        }
        if let Some((tag, remain)) = progress_event {
            self.push_event(EventKind::Progress, hid.raw() as i64, tag, Vec::new());
            trace!(%hid, remain, "progress");
        }
        self.update_interest(index);
    }

    fn handle_readable(&mut self, index: usize) {
        let hid = self.hid_at(index);
        let mut messages: Vec<Vec<u8>> = Vec::new();
        let mut teardown_code = None;
        let mut eof = false;
        let tag;
        {
            let Some(Node::Conn(conn)) = self.slots[index].node.as_mut() else { return };
            if conn.state != SockState::Established {
                return;
            }
            tag = conn.tag;
            match conn.ingest(&mut self.scratch) {
                Ok((_, at_eof)) => eof = at_eof,
                Err(err) => {
                    debug!(%hid, ?err, "read failed");
                    teardown_code = Some(close_code::RESET);
                }
            }
            if teardown_code.is_none() && conn.channel.over_recv_limit() {
                teardown_code = Some(close_code::OVERFLOW);
            }
            if teardown_code.is_none() {
                let mut filter = conn.filter.take();
                loop {
                    match conn.channel.next_message() {
                        Ok(Some((mut message, _mask))) => {
                            if let Some(f) = filter.as_mut() {
                                if f.on_input(hid, &mut message) == FilterVerdict::Veto {
                                    continue;
                                }
                            }
                            messages.push(message);
                        }
                        Ok(None) => break,
                        Err(NetError::OverLimit) | Err(NetError::BufferFull) => {
                            teardown_code = Some(close_code::OVERFLOW);
                            break;
                        }
                        Err(_) => {
                            teardown_code = Some(close_code::BADFRAME);
                            break;
                        }
                    }
                }
                conn.filter = filter;
            }
        }
        for message in messages {
            self.push_event(EventKind::Data, hid.raw() as i64, tag, message);
        }
        if let Some(code) = teardown_code {
            self.teardown(index, code);
        } else if eof {
            self.teardown(index, close_code::EOF);
        }
    }

    fn expire(&mut self, deadline: Deadline) {
        match deadline {
            Deadline::Connect(hid) => {
                let index = hid.index();
                let still_connecting = matches!(
                    self.live_slot(hid).and_then(|s| s.node.as_ref()),
                    Some(Node::Conn(conn)) if conn.state == SockState::Connecting
                );
                if still_connecting {
                    debug!(%hid, "connect timed out");
                    self.teardown(index, close_code::TIMEOUT);
                }
            }
            Deadline::Linger(hid) => {
                if self.live_slot(hid).is_some() {
                    debug!(%hid, "linger deadline");
                    self.teardown(hid.index(), close_code::LINGER);
                }
            }
        }
    }

    fn teardown(&mut self, index: usize, code: u32) {
        let hid = self.hid_at(index);
        let Some(node) = self.slots[index].node.take() else { return };
        let tag = match node {
            Node::Conn(mut conn) => {
                if let Some(id) = conn.connect_timer.take() {
                    self.timers.cancel(id);
                }
                if let Some(id) = conn.linger_timer.take() {
                    self.timers.cancel(id);
                }
                if conn.registered.is_some() {
                    let _ = self.poll.registry().deregister(&mut conn.stream);
                }
                if let Some(mut filter) = conn.filter.take() {
                    filter.on_remove(hid);
                }
                conn.tag
            }
            Node::Listener(mut listener) => {
                let _ = self.poll.registry().deregister(&mut listener.sock);
                listener.tag
            }
            Node::Dgram(mut dgram) => {
                if dgram.mask != 0 {
                    let _ = self.poll.registry().deregister(&mut dgram.sock);
                }
                dgram.tag
            }
        };
        self.free_slot(index);
        debug!(%hid, code, "closed");
        self.push_event(EventKind::Close, hid.raw() as i64, tag, code.to_le_bytes().to_vec());
    }
}

/// Desired poll interest for a connection, `None` when it should not
/// be registered at all.
fn conn_interest(conn: &Conn) -> Option<Interest> {
    let read = conn.wants_read();
    let write = conn.wants_write();
    match (read, write) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

fn dgram_interest(mask: u8) -> Option<Interest> {
    match (mask & MASK_READ != 0, mask & MASK_WRITE != 0) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

//! UNIX-domain sockets: path namespace, per-endpoint state machine, and
//! the stream/seqpacket/dgram data paths.
//!
//! Blocking operations (`accept`, `connect`, `recvmsg`) follow the same
//! cooperative pattern as [`crate::sched::waitpid`]: a caller that would
//! need to sleep registers itself on the relevant wait queue and gets
//! back `Errno::Again`; it is the caller's job (ultimately the
//! out-of-scope syscall dispatcher) to retry once woken.

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use hashbrown::HashMap;

use crate::errno::Errno;
use crate::process::thread::Tid;
use crate::sync::{SleepQueue, Spinlock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
    Stream,
    Dgram,
    SeqPacket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Init,
    Bound,
    Listen,
    Connected,
    Closed,
}

struct StreamBuffer {
    bytes: VecDeque<u8>,
    stopped: bool,
}

impl StreamBuffer {
    fn new() -> Self {
        StreamBuffer { bytes: VecDeque::new(), stopped: false }
    }
}

struct Datagram {
    data: Vec<u8>,
    source: Option<String>,
}

/// The receive-side storage an endpoint owns, shaped by its socket type:
/// a byte stream for `Stream`, a list of whole packets for `SeqPacket`
/// (so sends never coalesce), and a byte buffer plus a parallel
/// metadata list for `Dgram`.
enum RxStorage {
    Stream(StreamBuffer),
    SeqPacket(VecDeque<Vec<u8>>),
    Dgram(VecDeque<Datagram>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestState {
    Waiting,
    Connected,
    Dead,
}

pub struct ConnectionRequest {
    requester: Arc<Endpoint>,
    requesting_thread: Tid,
    state: Spinlock<RequestState>,
    new_endpoint: Spinlock<Option<Arc<Endpoint>>>,
}

#[derive(Debug)]
pub struct Endpoint {
    pub socket_type: SocketType,
    state: Spinlock<EndpointState>,
    path: Spinlock<Option<String>>,
    peer: Spinlock<Option<Arc<Endpoint>>>,
    pending: Spinlock<VecDeque<Arc<ConnectionRequest>>>,
    accept_queue: SleepQueue,
    rx: Spinlock<RxStorage>,
    rx_queue: SleepQueue,
    /// Mirrors the data model's explicit endpoint refcount. Actual
    /// lifetime is governed by the surrounding `Arc`; this field exists
    /// so `bump`/`drop_ref` read the way the design notes describe them,
    /// not as a second source of truth for when the endpoint is freed.
    refcount: AtomicU32,
}

impl Endpoint {
    fn new(socket_type: SocketType) -> Arc<Endpoint> {
        let rx = match socket_type {
            SocketType::Stream => RxStorage::Stream(StreamBuffer::new()),
            SocketType::SeqPacket => RxStorage::SeqPacket(VecDeque::new()),
            SocketType::Dgram => RxStorage::Dgram(VecDeque::new()),
        };
        Arc::new(Endpoint {
            socket_type,
            state: Spinlock::new(EndpointState::Init),
            path: Spinlock::new(None),
            peer: Spinlock::new(None),
            pending: Spinlock::new(VecDeque::new()),
            accept_queue: SleepQueue::new(),
            rx: Spinlock::new(rx),
            rx_queue: SleepQueue::new(),
            refcount: AtomicU32::new(1),
        })
    }

    pub fn state(&self) -> EndpointState {
        *self.state.lock()
    }

    pub fn path(&self) -> Option<String> {
        self.path.lock().clone()
    }

    pub fn peer(&self) -> Option<Arc<Endpoint>> {
        self.peer.lock().clone()
    }

    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Relaxed)
    }

    fn bump(&self) {
        self.refcount.fetch_add(1, Ordering::Relaxed);
    }

    fn drop_ref(&self) -> u32 {
        self.refcount.fetch_sub(1, Ordering::AcqRel) - 1
    }
}

/// `socket`: allocates a fresh, unbound endpoint.
pub fn socket_create(socket_type: SocketType) -> Arc<Endpoint> {
    Endpoint::new(socket_type)
}

static PATH_MAP: Spinlock<Option<HashMap<String, Arc<Endpoint>>>> = Spinlock::new(None);

fn with_path_map<R>(f: impl FnOnce(&mut HashMap<String, Arc<Endpoint>>) -> R) -> R {
    let mut guard = PATH_MAP.lock();
    let map = guard.get_or_insert_with(HashMap::new);
    f(map)
}

pub fn path_map_len() -> usize {
    with_path_map(|m| m.len())
}

/// Canonicalizes `path` against `cwd`: relative paths are joined to
/// `cwd`, then `.`/`..`/empty segments are collapsed. The socket
/// namespace never touches the real filesystem, so this is pure string
/// manipulation, not a `stat`-backed resolve.
pub fn canonicalize(cwd: &str, path: &str) -> String {
    let joined = if path.starts_with('/') {
        String::from(path)
    } else {
        let mut s = String::from(cwd);
        if !s.ends_with('/') {
            s.push('/');
        }
        s.push_str(path);
        s
    };

    let mut stack: Vec<&str> = Vec::new();
    for seg in joined.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                stack.pop();
            }
            s => stack.push(s),
        }
    }
    let mut out = String::from("/");
    out.push_str(&stack.join("/"));
    out
}

/// `bind`: requires the endpoint be fresh (*init*); fails `EADDRINUSE` if
/// the path is already bound.
pub fn bind(endpoint: &Arc<Endpoint>, cwd: &str, path: &str) -> Result<(), Errno> {
    if endpoint.state() != EndpointState::Init {
        return Err(Errno::Inval);
    }
    let canon = canonicalize(cwd, path);
    with_path_map(|map| {
        if map.contains_key(&canon) {
            return Err(Errno::AddrInUse);
        }
        map.insert(canon.clone(), endpoint.clone());
        Ok(())
    })?;
    *endpoint.path.lock() = Some(canon);
    *endpoint.state.lock() = EndpointState::Bound;
    Ok(())
}

/// `listen`: bound streams/seqpackets only; datagram sockets have no
/// connection setup and reject with `EOPNOTSUPP`.
pub fn listen(endpoint: &Arc<Endpoint>) -> Result<(), Errno> {
    if endpoint.socket_type == SocketType::Dgram {
        return Err(Errno::OpNotSupp);
    }
    let mut state = endpoint.state.lock();
    if *state != EndpointState::Bound {
        return Err(Errno::Inval);
    }
    *state = EndpointState::Listen;
    Ok(())
}

/// Outcome of [`connect`]: datagram sockets connect immediately; stream
/// and seqpacket sockets hand back a request the caller polls with
/// [`poll_connect`] after sleeping (or on the documented 1s x3 retry).
pub enum ConnectOutcome {
    Connected,
    Pending(Arc<ConnectionRequest>),
}

/// `connect`: looks up the bound peer by path. Datagram sockets record
/// the peer directly; stream/seqpacket sockets park a connection
/// request on the peer's pending queue and wake one accepter.
pub fn connect(
    endpoint: &Arc<Endpoint>,
    cwd: &str,
    path: &str,
    requesting_thread: Tid,
) -> Result<ConnectOutcome, Errno> {
    let canon = canonicalize(cwd, path);
    let target = with_path_map(|map| map.get(&canon).cloned()).ok_or(Errno::NoEnt)?;

    if target.socket_type != endpoint.socket_type {
        return Err(Errno::ProtoType);
    }

    if endpoint.socket_type == SocketType::Dgram {
        *endpoint.peer.lock() = Some(target);
        *endpoint.state.lock() = EndpointState::Connected;
        return Ok(ConnectOutcome::Connected);
    }

    if target.state() != EndpointState::Listen {
        return Err(Errno::ConnRefused);
    }

    let request = Arc::new(ConnectionRequest {
        requester: endpoint.clone(),
        requesting_thread,
        state: Spinlock::new(RequestState::Waiting),
        new_endpoint: Spinlock::new(None),
    });
    target.pending.lock().push_back(request.clone());
    for tid in target.accept_queue.wake(1) {
        crate::sched::wake_tid(tid);
    }
    Ok(ConnectOutcome::Pending(request))
}

/// Inspects a pending connection request after the connecting thread
/// wakes: `connected` finishes the handshake on the requester's side;
/// `dead`, or `waiting` past the retry budget, surfaces the matching
/// error.
pub fn poll_connect(
    endpoint: &Arc<Endpoint>,
    request: &Arc<ConnectionRequest>,
    retries_exhausted: bool,
) -> Result<(), Errno> {
    match *request.state.lock() {
        RequestState::Connected => {
            let new_endpoint = request
                .new_endpoint
                .lock()
                .clone()
                .expect("connected request missing its new endpoint");
            *endpoint.peer.lock() = Some(new_endpoint);
            *endpoint.state.lock() = EndpointState::Connected;
            Ok(())
        }
        RequestState::Dead => Err(Errno::ConnRefused),
        RequestState::Waiting if retries_exhausted => Err(Errno::TimedOut),
        RequestState::Waiting => Err(Errno::Again),
    }
}

/// `accept`: from *listen* only. Pops the oldest pending request, builds
/// a fresh connected endpoint for it, links both sides as peers, and
/// wakes the connecting thread.
pub fn accept(listener: &Arc<Endpoint>, nonblocking: bool) -> Result<Arc<Endpoint>, Errno> {
    if listener.state() != EndpointState::Listen {
        return Err(Errno::Inval);
    }

    let request = {
        let mut pending = listener.pending.lock();
        match pending.pop_front() {
            Some(r) => r,
            None if nonblocking => return Err(Errno::WouldBlock),
            None => {
                drop(pending);
                listener.accept_queue.insert(crate::sched::current_tid());
                return Err(Errno::Again);
            }
        }
    };

    let new_endpoint = Endpoint::new(listener.socket_type);
    new_endpoint.bump();
    request.requester.bump();
    *new_endpoint.peer.lock() = Some(request.requester.clone());
    *request.requester.peer.lock() = Some(new_endpoint.clone());
    *new_endpoint.path.lock() = listener.path.lock().clone();
    *new_endpoint.state.lock() = EndpointState::Connected;
    *request.requester.state.lock() = EndpointState::Connected;

    *request.new_endpoint.lock() = Some(new_endpoint.clone());
    *request.state.lock() = RequestState::Connected;
    crate::sched::wake_tid(request.requesting_thread);

    Ok(new_endpoint)
}

bitflags::bitflags! {
    pub struct MsgFlags: u32 {
        const TRUNC = 1 << 0;
    }
}

pub struct RecvResult {
    pub bytes: usize,
    pub flags: MsgFlags,
    pub source: Option<String>,
}

/// `sendmsg`: writes `data` into the peer's receive-side storage per the
/// socket type's delivery rule, then wakes one waiting reader.
pub fn sendmsg(endpoint: &Arc<Endpoint>, data: &[u8]) -> Result<usize, Errno> {
    let peer = endpoint.peer().ok_or(Errno::ConnReset)?;

    {
        let mut rx = peer.rx.lock();
        match &mut *rx {
            RxStorage::SeqPacket(list) => list.push_back(data.to_vec()),
            RxStorage::Stream(buf) => {
                if buf.stopped {
                    return Err(Errno::ConnReset);
                }
                buf.bytes.extend(data.iter().copied());
            }
            RxStorage::Dgram(list) => list.push_back(Datagram {
                data: data.to_vec(),
                source: endpoint.path(),
            }),
        }
    }

    for tid in peer.rx_queue.wake(1) {
        crate::sched::wake_tid(tid);
    }
    Ok(data.len())
}

/// `recvmsg`: reads into `out` per the socket type's delivery rule.
/// Returns `Ok(0 bytes)` when a stream peer has closed with nothing left
/// buffered (EOF), not an error.
pub fn recvmsg(endpoint: &Arc<Endpoint>, out: &mut [u8], nonblocking: bool) -> Result<RecvResult, Errno> {
    let mut rx = endpoint.rx.lock();
    match &mut *rx {
        RxStorage::SeqPacket(list) => match list.pop_front() {
            Some(packet) => {
                let n = packet.len().min(out.len());
                out[..n].copy_from_slice(&packet[..n]);
                let mut flags = MsgFlags::empty();
                if n < packet.len() {
                    flags.insert(MsgFlags::TRUNC);
                }
                Ok(RecvResult { bytes: n, flags, source: None })
            }
            None if nonblocking => Err(Errno::WouldBlock),
            None => {
                drop(rx);
                endpoint.rx_queue.insert(crate::sched::current_tid());
                Err(Errno::Again)
            }
        },
        RxStorage::Stream(buf) => {
            if buf.bytes.is_empty() {
                if buf.stopped {
                    return Ok(RecvResult { bytes: 0, flags: MsgFlags::empty(), source: None });
                }
                if nonblocking {
                    return Err(Errno::WouldBlock);
                }
                drop(rx);
                endpoint.rx_queue.insert(crate::sched::current_tid());
                return Err(Errno::Again);
            }
            let n = out.len().min(buf.bytes.len());
            for slot in out.iter_mut().take(n) {
                *slot = buf.bytes.pop_front().expect("checked len above");
            }
            Ok(RecvResult { bytes: n, flags: MsgFlags::empty(), source: None })
        }
        RxStorage::Dgram(list) => match list.pop_front() {
            Some(dgram) => {
                let n = dgram.data.len().min(out.len());
                out[..n].copy_from_slice(&dgram.data[..n]);
                let mut flags = MsgFlags::empty();
                if n < dgram.data.len() {
                    flags.insert(MsgFlags::TRUNC);
                }
                Ok(RecvResult { bytes: n, flags, source: dgram.source })
            }
            None if nonblocking => Err(Errno::WouldBlock),
            None => {
                drop(rx);
                endpoint.rx_queue.insert(crate::sched::current_tid());
                Err(Errno::Again)
            }
        },
    }
}

/// `close`: nulls the peer's back-pointer before dropping this
/// endpoint's own reference, per the cyclic-ownership discipline in the
/// design notes — that ordering is what keeps the mutual `Arc` pair from
/// ever looking like a live cycle to either side.
pub fn close(endpoint: &Arc<Endpoint>) {
    *endpoint.state.lock() = EndpointState::Closed;

    if let Some(peer) = endpoint.peer.lock().take() {
        if endpoint.socket_type == SocketType::Stream {
            if let RxStorage::Stream(buf) = &mut *peer.rx.lock() {
                buf.stopped = true;
            }
        }
        *peer.peer.lock() = None;
        for tid in peer.rx_queue.wake(usize::MAX) {
            crate::sched::wake_tid(tid);
        }
        peer.drop_ref();
    }

    if let Some(path) = endpoint.path.lock().take() {
        with_path_map(|map| {
            map.remove(&path);
        });
    }

    endpoint.drop_ref();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init() {
        crate::mm::frame::test_init_global();
    }

    #[test]
    fn stream_bind_listen_connect_accept_roundtrip() {
        init();
        let before = path_map_len();

        let server = socket_create(SocketType::Stream);
        bind(&server, "/", "tmp/echo1").unwrap();
        listen(&server).unwrap();

        let client = socket_create(SocketType::Stream);
        let outcome = connect(&client, "/", "/tmp/echo1", Tid::from_raw(7)).unwrap();
        let request = match outcome {
            ConnectOutcome::Pending(r) => r,
            ConnectOutcome::Connected => panic!("stream connect should be pending"),
        };

        let server_side = accept(&server, false).unwrap();
        poll_connect(&client, &request, false).unwrap();

        assert!(Arc::ptr_eq(&client.peer().unwrap(), &server_side));
        assert!(Arc::ptr_eq(&server_side.peer().unwrap(), &client));

        sendmsg(&client, b"hello").unwrap();
        let mut buf = [0u8; 16];
        let result = recvmsg(&server_side, &mut buf, false).unwrap();
        assert_eq!(&buf[..result.bytes], b"hello");

        close(&client);
        close(&server_side);
        close(&server);
        assert_eq!(path_map_len(), before);
    }

    #[test]
    fn seqpacket_messages_never_coalesce() {
        init();
        let server = socket_create(SocketType::SeqPacket);
        bind(&server, "/", "/tmp/seq").unwrap();
        listen(&server).unwrap();

        let client = socket_create(SocketType::SeqPacket);
        let request = match connect(&client, "/", "/tmp/seq", Tid::from_raw(1)).unwrap() {
            ConnectOutcome::Pending(r) => r,
            _ => unreachable!(),
        };
        let server_side = accept(&server, false).unwrap();
        poll_connect(&client, &request, false).unwrap();

        sendmsg(&client, b"A").unwrap();
        sendmsg(&client, b"BC").unwrap();
        sendmsg(&client, b"DEF").unwrap();

        let mut buf = [0u8; 8];
        let a = recvmsg(&server_side, &mut buf, false).unwrap();
        assert_eq!(&buf[..a.bytes], b"A");
        let b = recvmsg(&server_side, &mut buf, false).unwrap();
        assert_eq!(&buf[..b.bytes], b"BC");
        let c = recvmsg(&server_side, &mut buf, false).unwrap();
        assert_eq!(&buf[..c.bytes], b"DEF");
    }

    #[test]
    fn dgram_connect_is_immediate_and_records_source() {
        init();
        let server = socket_create(SocketType::Dgram);
        bind(&server, "/", "/tmp/dg-server").unwrap();
        let client = socket_create(SocketType::Dgram);
        bind(&client, "/", "/tmp/dg-client").unwrap();

        match connect(&client, "/", "/tmp/dg-server", Tid::from_raw(1)).unwrap() {
            ConnectOutcome::Connected => {}
            ConnectOutcome::Pending(_) => panic!("dgram connect should be immediate"),
        }

        sendmsg(&client, b"ping").unwrap();
        let mut buf = [0u8; 8];
        let result = recvmsg(&server, &mut buf, false).unwrap();
        assert_eq!(&buf[..result.bytes], b"ping");
        assert_eq!(result.source.as_deref(), Some("/tmp/dg-client"));
    }

    #[test]
    fn accept_on_nonblocking_empty_queue_returns_ewouldblock() {
        init();
        let server = socket_create(SocketType::Stream);
        bind(&server, "/", "/tmp/empty").unwrap();
        listen(&server).unwrap();
        assert_eq!(accept(&server, true).unwrap_err(), Errno::WouldBlock);
    }

    #[test]
    fn bind_to_existing_path_fails_eaddrinuse() {
        init();
        let a = socket_create(SocketType::Stream);
        bind(&a, "/", "/tmp/dup").unwrap();
        let b = socket_create(SocketType::Stream);
        assert_eq!(bind(&b, "/", "/tmp/dup").unwrap_err(), Errno::AddrInUse);
    }

    #[test]
    fn stream_read_after_peer_close_returns_eof() {
        init();
        let server = socket_create(SocketType::Stream);
        bind(&server, "/", "/tmp/eof").unwrap();
        listen(&server).unwrap();
        let client = socket_create(SocketType::Stream);
        let request = match connect(&client, "/", "/tmp/eof", Tid::from_raw(1)).unwrap() {
            ConnectOutcome::Pending(r) => r,
            _ => unreachable!(),
        };
        let server_side = accept(&server, false).unwrap();
        poll_connect(&client, &request, false).unwrap();

        close(&client);
        let mut buf = [0u8; 4];
        let result = recvmsg(&server_side, &mut buf, false).unwrap();
        assert_eq!(result.bytes, 0);
    }
}

//! Blocking TCP socket surface.
//!
//! Listeners hold a bounded backlog of completed connections; `accept`
//! blocks cooperatively (fiber yield) until one appears, then hands over
//! ownership. `connect` likewise parks the calling fiber until the
//! handshake resolves. The state machine itself never blocks — these
//! wrappers poll it between yields, which are the only suspension points.

extern crate alloc;

use alloc::collections::{BTreeMap, VecDeque};

use keel_lib::{IrqMutex, klog_debug};

use super::tcp::{self, ConnId, TcpState};
use super::types::{DevIndex, NetError, Port, Socket};

/// Default pending-connection capacity when `listen` gets backlog 0.
pub const DEFAULT_BACKLOG: usize = 8;

struct Listener {
    listen_id: ConnId,
    backlog: VecDeque<ConnId>,
    capacity: usize,
}

static LISTENERS: IrqMutex<BTreeMap<u16, Listener>> = IrqMutex::new(BTreeMap::new());

// =============================================================================
// Listen / accept
// =============================================================================

/// Open a listening socket on `local` with a bounded accept backlog.
pub fn listen(dev: DevIndex, local: Socket, backlog: usize) -> Result<ConnId, NetError> {
    let listen_id = tcp::listen(dev, local)?;
    let mut listeners = LISTENERS.lock();
    listeners.insert(
        local.port.as_u16(),
        Listener {
            listen_id,
            backlog: VecDeque::new(),
            capacity: if backlog == 0 { DEFAULT_BACKLOG } else { backlog },
        },
    );
    Ok(listen_id)
}

/// Forget every listener without touching connections (test teardown —
/// the connection table is being reset alongside).
pub fn reset_listeners() {
    LISTENERS.lock().clear();
}

/// Tear down a listener, aborting anything still queued.
pub fn close_listener(port: Port) {
    let listener = LISTENERS.lock().remove(&port.as_u16());
    if let Some(listener) = listener {
        for conn in listener.backlog {
            let _ = tcp::abort(conn);
        }
        let _ = tcp::close(listener.listen_id);
    }
}

/// Handshake completed on a child of the listener at `port`: queue it for
/// `accept`. A full backlog drops the **oldest** pending connection to
/// make room, so a stalled acceptor sheds its stalest work first.
pub(crate) fn notify_accepted(port: Port, conn: ConnId) {
    let evicted = {
        let mut listeners = LISTENERS.lock();
        let Some(listener) = listeners.get_mut(&port.as_u16()) else {
            // Listener vanished — refuse the stray connection.
            let _ = tcp::abort(conn);
            return;
        };
        let evicted = if listener.backlog.len() >= listener.capacity {
            listener.backlog.pop_front()
        } else {
            None
        };
        listener.backlog.push_back(conn);
        evicted
    };
    if let Some(old) = evicted {
        klog_debug!("tcp: backlog full on port {}, dropping oldest", port);
        let _ = tcp::abort(old);
    }
}

/// Connection became established from the active side. The blocked
/// connector polls state, so this is just a scheduling nudge.
pub(crate) fn notify_connected(_id: ConnId) {
    keel_sched::fiber_yield();
}

/// Send window opened. Writers poll, as above.
pub(crate) fn notify_writable(_id: ConnId) {}

/// Take one pending connection, if any.
pub fn try_accept(port: Port) -> Option<ConnId> {
    LISTENERS
        .lock()
        .get_mut(&port.as_u16())?
        .backlog
        .pop_front()
}

/// Block (cooperatively) until a connection is pending, then hand it over.
/// Fails once the listener is closed.
pub fn accept(port: Port) -> Result<ConnId, NetError> {
    loop {
        if let Some(conn) = try_accept(port) {
            return Ok(conn);
        }
        if !LISTENERS.lock().contains_key(&port.as_u16()) {
            return Err(NetError::InvalidArgument);
        }
        keel_sched::fiber_yield();
        core::hint::spin_loop();
    }
}

/// Pending connections currently queued on `port`.
pub fn backlog_len(port: Port) -> usize {
    LISTENERS
        .lock()
        .get(&port.as_u16())
        .map(|l| l.backlog.len())
        .unwrap_or(0)
}

// =============================================================================
// Connect
// =============================================================================

/// Active open, blocking until ESTABLISHED or failure.
pub fn connect(dev: DevIndex, remote: Socket) -> Result<ConnId, NetError> {
    let id = tcp::connect(dev, remote)?;
    loop {
        match tcp::state_of(id) {
            Some(TcpState::Established) => return Ok(id),
            Some(TcpState::Closed) | None => {
                return Err(tcp::take_error(id).unwrap_or(NetError::ConnectionRefused));
            }
            _ => {}
        }
        keel_sched::fiber_yield();
        core::hint::spin_loop();
    }
}

/// Active open returning immediately; completion is observed via
/// [`tcp::state_of`]. The POSIX layer maps this to `EINPROGRESS`.
pub fn connect_nonblocking(dev: DevIndex, remote: Socket) -> Result<ConnId, NetError> {
    tcp::connect(dev, remote)
}

// =============================================================================
// Read / write
// =============================================================================

/// Read at least one byte, blocking while the connection is open but
/// empty. Returns 0 at EOF (peer FIN drained).
pub fn recv(id: ConnId, buf: &mut [u8]) -> Result<usize, NetError> {
    loop {
        match tcp::recv(id, buf) {
            Err(NetError::WouldBlock) => {
                keel_sched::fiber_yield();
                core::hint::spin_loop();
            }
            other => return other,
        }
    }
}

/// Queue bytes for transmission. The window drains asynchronously; this
/// only blocks when the connection is gone.
pub fn send(id: ConnId, data: &[u8]) -> Result<usize, NetError> {
    tcp::send(id, data)
}

/// Graceful shutdown of the send side.
pub fn close(id: ConnId) -> Result<(), NetError> {
    tcp::close(id)
}

//! TCP — RFC 793 state machine with congestion control (RFC 5681), RTT
//! estimation (RFC 6298 shape, classic constants), SACK (RFC 2018) and
//! conntrack integration.
//!
//! The connection table and state machine live here; the blocking socket
//! surface (listeners, accept/connect over fiber yield) is in
//! [`super::tcp_socket`]. Both the read and write paths queue bytes, never
//! packets-by-copy: ingress payload lands in a per-connection queue drained
//! by `recv`/`on_read`, egress bytes are segmented straight into pool
//! buffers at transmit time.

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;

use keel_lib::{IrqMutex, clock, klog_debug};

use super::conntrack::CtId;
use super::icmp4::IcmpError;
use super::ip4::{self, Ipv4Header};
use super::packetbuf::{PacketBuf, transport_checksum, verify_transport_checksum};
use super::sack::{Block, Scoreboard};
use super::timer::{NET_TIMERS, TimerKind, TimerToken};
use super::types::{DevIndex, Ipv4Addr, NetError, Port, Socket};
use super::{IPPROTO_TCP, alloc_ephemeral_port};

// =============================================================================
// Constants
// =============================================================================

pub const TCP_HEADER_LEN: usize = 20;
pub const TCP_HEADER_MAX_LEN: usize = 60;

/// Maximum simultaneous connections (listeners included).
pub const MAX_CONNECTIONS: usize = 128;

/// Default MSS: Ethernet MTU 1500 − IP 20 − TCP 20.
pub const DEFAULT_MSS: u16 = 1460;

/// Default receive window.
pub const DEFAULT_WINDOW_SIZE: u16 = 16384;

/// RTO bounds and initial value (RFC 6298: initial 1 s; upper bound 60 s).
pub const INITIAL_RTO_MS: u32 = 1000;
pub const MIN_RTO_MS: u32 = 1000;
pub const MAX_RTO_MS: u32 = 60_000;

/// SRTT smoothing α = 7/8 and RTO multiplier β = 2.
const SRTT_ALPHA_NUM: u32 = 7;
const SRTT_ALPHA_DEN: u32 = 8;
const RTO_BETA: u32 = 2;

/// Give up after this many back-to-back retransmissions.
pub const MAX_RETRANSMITS: u8 = 8;

/// Duplicate ACKs that trigger fast retransmit.
pub const DUP_ACK_THRESHOLD: u8 = 3;

// TCP flags.
pub const TCP_FLAG_FIN: u8 = 0x01;
pub const TCP_FLAG_SYN: u8 = 0x02;
pub const TCP_FLAG_RST: u8 = 0x04;
pub const TCP_FLAG_PSH: u8 = 0x08;
pub const TCP_FLAG_ACK: u8 = 0x10;
pub const TCP_FLAG_URG: u8 = 0x20;

// Option kinds.
pub const TCP_OPT_END: u8 = 0;
pub const TCP_OPT_NOP: u8 = 1;
pub const TCP_OPT_MSS: u8 = 2;
pub const TCP_OPT_WSCALE: u8 = 3;
pub const TCP_OPT_SACK_PERMITTED: u8 = 4;
pub const TCP_OPT_SACK: u8 = 5;

// =============================================================================
// Sequence arithmetic (RFC 793 §3.3)
// =============================================================================

#[inline]
pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

#[inline]
pub fn seq_le(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) <= 0
}

#[inline]
pub fn seq_gt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

#[inline]
pub fn seq_ge(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) >= 0
}

// =============================================================================
// Header
// =============================================================================

/// Parsed TCP header, fields in host byte order.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_num: u32,
    pub ack_num: u32,
    /// Data offset in 32-bit words (5–15).
    pub data_offset: u8,
    pub flags: u8,
    pub window_size: u16,
    pub checksum: u16,
    pub urgent_ptr: u16,
}

impl TcpHeader {
    #[inline]
    pub const fn header_len(&self) -> usize {
        (self.data_offset as usize) * 4
    }

    #[inline]
    pub const fn is_syn(&self) -> bool {
        (self.flags & TCP_FLAG_SYN) != 0
    }

    #[inline]
    pub const fn is_ack(&self) -> bool {
        (self.flags & TCP_FLAG_ACK) != 0
    }

    #[inline]
    pub const fn is_fin(&self) -> bool {
        (self.flags & TCP_FLAG_FIN) != 0
    }

    #[inline]
    pub const fn is_rst(&self) -> bool {
        (self.flags & TCP_FLAG_RST) != 0
    }

    #[inline]
    pub const fn is_psh(&self) -> bool {
        (self.flags & TCP_FLAG_PSH) != 0
    }
}

/// Parse a TCP header. `None` if short or the data offset is out of range.
pub fn parse_header(data: &[u8]) -> Option<TcpHeader> {
    if data.len() < TCP_HEADER_LEN {
        return None;
    }
    let data_offset = (data[12] >> 4) & 0x0F;
    if !(5..=15).contains(&data_offset) || data.len() < (data_offset as usize) * 4 {
        return None;
    }
    Some(TcpHeader {
        src_port: u16::from_be_bytes([data[0], data[1]]),
        dst_port: u16::from_be_bytes([data[2], data[3]]),
        seq_num: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        ack_num: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        data_offset,
        flags: data[13] & 0x3F,
        window_size: u16::from_be_bytes([data[14], data[15]]),
        checksum: u16::from_be_bytes([data[16], data[17]]),
        urgent_ptr: u16::from_be_bytes([data[18], data[19]]),
    })
}

/// Options recognised on ingress.
#[derive(Clone, Debug, Default)]
pub struct TcpOptions {
    pub mss: Option<u16>,
    pub window_scale: Option<u8>,
    pub sack_permitted: bool,
    pub sack_blocks: Vec<Block>,
}

/// Walk the options region.
pub fn parse_options(options: &[u8]) -> TcpOptions {
    let mut out = TcpOptions::default();
    let mut i = 0usize;
    while i < options.len() {
        match options[i] {
            TCP_OPT_END => break,
            TCP_OPT_NOP => i += 1,
            kind => {
                if i + 1 >= options.len() {
                    break;
                }
                let len = options[i + 1] as usize;
                if len < 2 || i + len > options.len() {
                    break;
                }
                let body = &options[i + 2..i + len];
                match kind {
                    TCP_OPT_MSS if body.len() == 2 => {
                        out.mss = Some(u16::from_be_bytes([body[0], body[1]]));
                    }
                    TCP_OPT_WSCALE if body.len() == 1 => {
                        out.window_scale = Some(body[0].min(14));
                    }
                    TCP_OPT_SACK_PERMITTED => out.sack_permitted = true,
                    TCP_OPT_SACK => {
                        for chunk in body.chunks_exact(8) {
                            out.sack_blocks.push(Block::new(
                                u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
                                u32::from_be_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]),
                            ));
                        }
                    }
                    _ => {}
                }
                i += len;
            }
        }
    }
    out
}

// =============================================================================
// Connection
// =============================================================================

/// TCP connection state per RFC 793 §3.2.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

impl TcpState {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Listen => "LISTEN",
            Self::SynSent => "SYN_SENT",
            Self::SynReceived => "SYN_RCVD",
            Self::Established => "ESTABLISHED",
            Self::FinWait1 => "FIN_WAIT_1",
            Self::FinWait2 => "FIN_WAIT_2",
            Self::CloseWait => "CLOSE_WAIT",
            Self::Closing => "CLOSING",
            Self::LastAck => "LAST_ACK",
            Self::TimeWait => "TIME_WAIT",
        }
    }

    pub const fn is_open(self) -> bool {
        matches!(
            self,
            Self::Established | Self::FinWait1 | Self::FinWait2 | Self::CloseWait
        )
    }

    pub const fn can_receive_data(self) -> bool {
        matches!(self, Self::Established | Self::FinWait1 | Self::FinWait2)
    }
}

/// Four-tuple identifying a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TcpTuple {
    pub local: Socket,
    pub remote: Socket,
}

impl TcpTuple {
    pub const fn new(local: Socket, remote: Socket) -> Self {
        Self { local, remote }
    }
}

/// A sent-but-unacknowledged segment parked for retransmission.
struct TxSegment {
    seq: u32,
    flags: u8,
    data: Vec<u8>,
    /// Monotonic send time; cleared by retransmission (Karn: retransmitted
    /// segments never produce RTT samples).
    sent_ms: u64,
    retransmitted: bool,
    /// Covered by a peer SACK block — skip on timer retransmission.
    sacked: bool,
}

impl TxSegment {
    fn seq_end(&self) -> u32 {
        let mut len = self.data.len() as u32;
        if self.flags & (TCP_FLAG_SYN | TCP_FLAG_FIN) != 0 {
            len += 1;
        }
        self.seq.wrapping_add(len)
    }
}

/// Delivery delegate fired when the in-order byte count reaches the
/// registered threshold.
pub type OnReadFn = fn(ConnId, &[u8]);

/// Stable handle to a connection slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnId(pub usize);

pub struct TcpConnection {
    pub tuple: TcpTuple,
    pub state: TcpState,
    pub dev: DevIndex,

    // --- Send sequence space ---
    pub snd_una: u32,
    pub snd_nxt: u32,
    pub snd_wnd: u32,
    pub iss: u32,

    // --- Receive sequence space ---
    pub rcv_nxt: u32,
    pub rcv_wnd: u16,
    pub irs: u32,

    pub peer_mss: u16,
    /// MSS ceiling imposed by the PMTU cache (0 = none).
    path_mss_limit: u16,
    peer_wscale: u8,
    pub sack_enabled: bool,

    // --- Congestion control ---
    pub cwnd: u32,
    pub ssthresh: u32,
    dup_acks: u8,

    // --- RTT estimation ---
    pub srtt_ms: u32,
    pub rto_ms: u32,
    retransmits: u8,
    time_wait_start_ms: u64,

    // --- Data queues ---
    read_q: VecDeque<u8>,
    /// Out-of-order segments, keyed by sequence number.
    ooo: BTreeMap<u32, Vec<u8>>,
    pub scoreboard: Scoreboard,
    /// Sent, unacked segments (retransmission window).
    inflight: VecDeque<TxSegment>,
    /// Bytes accepted from the application but not yet segmented.
    pending_tx: VecDeque<u8>,
    fin_queued: bool,

    on_read: Option<(usize, OnReadFn)>,
    pub listener_port: Option<Port>,
    pub ct: Option<CtId>,
    retransmit_timer: TimerToken,
    pub pending_error: Option<NetError>,
    /// Peer acknowledged our FIN and the connection fully closed.
    pub closed: bool,
}

impl TcpConnection {
    fn new(dev: DevIndex, tuple: TcpTuple) -> Self {
        Self {
            tuple,
            state: TcpState::Closed,
            dev,
            snd_una: 0,
            snd_nxt: 0,
            snd_wnd: 0,
            iss: 0,
            rcv_nxt: 0,
            rcv_wnd: DEFAULT_WINDOW_SIZE,
            irs: 0,
            peer_mss: DEFAULT_MSS,
            path_mss_limit: 0,
            peer_wscale: 0,
            sack_enabled: false,
            cwnd: DEFAULT_MSS as u32,
            ssthresh: 64 * 1024,
            dup_acks: 0,
            srtt_ms: 0,
            rto_ms: INITIAL_RTO_MS,
            retransmits: 0,
            time_wait_start_ms: 0,
            read_q: VecDeque::new(),
            ooo: BTreeMap::new(),
            scoreboard: Scoreboard::new(),
            inflight: VecDeque::new(),
            pending_tx: VecDeque::new(),
            fin_queued: false,
            on_read: None,
            listener_port: None,
            ct: None,
            retransmit_timer: TimerToken::INVALID,
            pending_error: None,
            closed: false,
        }
    }

    /// Segment size currently usable: the peer's MSS clipped by path MTU
    /// discovery (PMTU − 20 IP − 40 TCP worst case).
    pub fn effective_mss(&self) -> u16 {
        let mut mss = self.peer_mss;
        if self.path_mss_limit != 0 {
            mss = mss.min(self.path_mss_limit);
        }
        mss.max(1)
    }

    fn bytes_in_flight(&self) -> u32 {
        self.snd_nxt.wrapping_sub(self.snd_una)
    }

    fn send_window(&self) -> u32 {
        self.cwnd.min(self.snd_wnd)
    }

    /// RFC 6298-shaped smoothed RTT with the classic α/β constants.
    fn sample_rtt(&mut self, rtt_ms: u32) {
        if self.srtt_ms == 0 {
            self.srtt_ms = rtt_ms;
        } else {
            self.srtt_ms =
                (SRTT_ALPHA_NUM * self.srtt_ms + (SRTT_ALPHA_DEN - SRTT_ALPHA_NUM) * rtt_ms)
                    / SRTT_ALPHA_DEN;
        }
        self.rto_ms = (RTO_BETA * self.srtt_ms).clamp(MIN_RTO_MS, MAX_RTO_MS);
    }

    /// Slow start below ssthresh, additive increase above.
    fn on_ack_advance(&mut self, acked: u32) {
        let mss = self.effective_mss() as u32;
        if self.cwnd < self.ssthresh {
            self.cwnd += acked.min(mss);
        } else {
            self.cwnd += (mss * mss / self.cwnd).max(1);
        }
    }

    /// RTO fired: collapse to one segment, halve the threshold.
    fn on_rto(&mut self) {
        let mss = self.effective_mss() as u32;
        self.ssthresh = (self.cwnd / 2).max(2 * mss);
        self.cwnd = mss;
    }

    /// Three duplicate ACKs: retransmit and continue in congestion
    /// avoidance at the halved window.
    fn on_fast_retransmit(&mut self) {
        let mss = self.effective_mss() as u32;
        self.ssthresh = (self.cwnd / 2).max(2 * mss);
        self.cwnd = self.ssthresh;
    }
}

// =============================================================================
// Outgoing segments
// =============================================================================

/// A segment the state machine wants on the wire.
pub struct TcpOutSegment {
    pub dev: DevIndex,
    pub tuple: TcpTuple,
    pub seq_num: u32,
    pub ack_num: u32,
    pub flags: u8,
    pub window_size: u16,
    /// MSS option value (0 = omit).
    pub mss: u16,
    /// Offer SACK-Permitted (SYN/SYN|ACK only).
    pub offer_sack: bool,
    /// SACK blocks carried on this ACK.
    pub sack: Vec<Block>,
    pub payload: Vec<u8>,
}

impl TcpOutSegment {
    fn bare(dev: DevIndex, tuple: TcpTuple, seq: u32, ack: u32, flags: u8, wnd: u16) -> Self {
        Self {
            dev,
            tuple,
            seq_num: seq,
            ack_num: ack,
            flags,
            window_size: wnd,
            mss: 0,
            offer_sack: false,
            sack: Vec::new(),
            payload: Vec::new(),
        }
    }
}

/// Serialize and transmit one segment.
fn emit(seg: TcpOutSegment) {
    let Some(mut pkt) = PacketBuf::alloc() else {
        return;
    };

    // Options: MSS (4) + SACK-Permitted (2) + padding on SYNs; a SACK
    // block option on ACKs that carry blocks.
    let mut options: Vec<u8> = Vec::new();
    if seg.mss != 0 {
        options.extend_from_slice(&[TCP_OPT_MSS, 4]);
        options.extend_from_slice(&seg.mss.to_be_bytes());
    }
    if seg.offer_sack {
        options.extend_from_slice(&[TCP_OPT_SACK_PERMITTED, 2]);
    }
    if !seg.sack.is_empty() {
        let blocks = &seg.sack[..seg.sack.len().min(3)];
        options.extend_from_slice(&[TCP_OPT_NOP, TCP_OPT_NOP]);
        options.extend_from_slice(&[TCP_OPT_SACK, 2 + 8 * blocks.len() as u8]);
        for block in blocks {
            options.extend_from_slice(&block.start.to_be_bytes());
            options.extend_from_slice(&block.end.to_be_bytes());
        }
    }
    while options.len() % 4 != 0 {
        options.push(TCP_OPT_END);
    }

    let header_len = TCP_HEADER_LEN + options.len();
    let mut header = [0u8; TCP_HEADER_MAX_LEN];
    header[0..2].copy_from_slice(&seg.tuple.local.port.to_network_bytes());
    header[2..4].copy_from_slice(&seg.tuple.remote.port.to_network_bytes());
    header[4..8].copy_from_slice(&seg.seq_num.to_be_bytes());
    header[8..12].copy_from_slice(&seg.ack_num.to_be_bytes());
    header[12] = (((header_len / 4) as u8) << 4) & 0xF0;
    header[13] = seg.flags & 0x3F;
    header[14..16].copy_from_slice(&seg.window_size.to_be_bytes());
    header[18..20].copy_from_slice(&0u16.to_be_bytes());
    header[TCP_HEADER_LEN..header_len].copy_from_slice(&options);

    if pkt.append(&header[..header_len]).is_err() || pkt.append(&seg.payload).is_err() {
        return;
    }

    let src = super::inet::addr_of(seg.dev).unwrap_or(seg.tuple.local.ip);
    let csum = transport_checksum(src, seg.tuple.remote.ip, IPPROTO_TCP, pkt.payload(), 16);
    pkt.payload_mut()[16..18].copy_from_slice(&csum.to_be_bytes());

    ip4::ship(seg.dev, seg.tuple.remote.ip, IPPROTO_TCP, pkt);
}

// =============================================================================
// Connection table
// =============================================================================

struct TcpTable {
    connections: Vec<Option<Box<TcpConnection>>>,
}

impl TcpTable {
    const fn new() -> Self {
        Self {
            connections: Vec::new(),
        }
    }

    fn get(&self, id: ConnId) -> Option<&TcpConnection> {
        self.connections
            .get(id.0)
            .and_then(|slot| slot.as_deref())
    }

    fn get_mut(&mut self, id: ConnId) -> Option<&mut TcpConnection> {
        self.connections
            .get_mut(id.0)
            .and_then(|slot| slot.as_deref_mut())
    }

    fn active_count(&self) -> usize {
        self.connections.iter().flatten().count()
    }

    fn alloc_slot(&mut self, conn: Box<TcpConnection>) -> Option<ConnId> {
        if self.active_count() >= MAX_CONNECTIONS {
            return None;
        }
        for (i, slot) in self.connections.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(conn);
                return Some(ConnId(i));
            }
        }
        self.connections.push(Some(conn));
        Some(ConnId(self.connections.len() - 1))
    }

    fn release(&mut self, id: ConnId) {
        if let Some(slot) = self.connections.get_mut(id.0) {
            if let Some(conn) = slot.take() {
                NET_TIMERS.cancel(conn.retransmit_timer);
            }
        }
    }

    /// Exact tuple match first, then a wildcard listener on the local port.
    fn find(&self, tuple: &TcpTuple) -> Option<ConnId> {
        for (i, conn) in self.connections.iter().enumerate() {
            let Some(conn) = conn else { continue };
            if conn.tuple.local.port == tuple.local.port
                && conn.tuple.remote == tuple.remote
                && (conn.tuple.local.ip == tuple.local.ip
                    || conn.tuple.local.ip.is_unspecified())
            {
                return Some(ConnId(i));
            }
        }
        for (i, conn) in self.connections.iter().enumerate() {
            let Some(conn) = conn else { continue };
            if conn.state == TcpState::Listen
                && conn.tuple.local.port == tuple.local.port
                && (conn.tuple.local.ip.is_unspecified()
                    || conn.tuple.local.ip == tuple.local.ip)
            {
                return Some(ConnId(i));
            }
        }
        None
    }

    fn port_in_use(&self, local: Socket) -> bool {
        self.connections.iter().flatten().any(|c| {
            c.tuple.local.port == local.port
                && (c.tuple.local.ip.is_unspecified()
                    || local.ip.is_unspecified()
                    || c.tuple.local.ip == local.ip)
        })
    }
}

static TCP_TABLE: IrqMutex<TcpTable> = IrqMutex::new(TcpTable::new());

static ISN_COUNTER: core::sync::atomic::AtomicU32 =
    core::sync::atomic::AtomicU32::new(0x6B65_656C);

fn generate_isn() -> u32 {
    // Coarse clock-salted ISN; good enough without an attacker model
    // inside a single-tenant unikernel.
    let salt = 64_000u32.wrapping_add(clock::uptime_ms() as u32);
    ISN_COUNTER.fetch_add(salt, core::sync::atomic::Ordering::Relaxed)
}

/// Live (non-listener) connection count.
pub fn active_connections() -> usize {
    TCP_TABLE
        .lock()
        .connections
        .iter()
        .flatten()
        .filter(|c| c.state != TcpState::Listen)
        .count()
}

pub fn state_of(id: ConnId) -> Option<TcpState> {
    TCP_TABLE.lock().get(id).map(|c| c.state)
}

pub fn tuple_of(id: ConnId) -> Option<TcpTuple> {
    TCP_TABLE.lock().get(id).map(|c| c.tuple)
}

pub fn take_error(id: ConnId) -> Option<NetError> {
    TCP_TABLE.lock().get_mut(id).and_then(|c| c.pending_error.take())
}

/// Snapshot accessor for tests and diagnostics.
pub fn with_connection<R>(id: ConnId, f: impl FnOnce(&mut TcpConnection) -> R) -> Option<R> {
    TCP_TABLE.lock().get_mut(id).map(f)
}

/// Release every connection and listener and restart the ISN/ephemeral
/// state (deterministic tests).
pub fn reset_all() {
    {
        let mut table = TCP_TABLE.lock();
        for slot in table.connections.iter_mut() {
            if let Some(conn) = slot.take() {
                NET_TIMERS.cancel(conn.retransmit_timer);
            }
        }
        table.connections.clear();
    }
    super::tcp_socket::reset_listeners();
    ISN_COUNTER.store(0x6B65_656C, core::sync::atomic::Ordering::Relaxed);
    super::reset_ephemeral_ports();
}

// =============================================================================
// Lifecycle — open/close
// =============================================================================

/// Active open: allocate a connection, send SYN, enter SYN_SENT.
pub fn connect(dev: DevIndex, remote: Socket) -> Result<ConnId, NetError> {
    let local_ip = super::inet::addr_of(dev).ok_or(NetError::NetworkUnreachable)?;
    let local = Socket::new(local_ip, Port(alloc_ephemeral_port()));
    let tuple = TcpTuple::new(local, remote);
    let iss = generate_isn();

    let id = {
        let mut table = TCP_TABLE.lock();
        let mut conn = Box::new(TcpConnection::new(dev, tuple));
        conn.state = TcpState::SynSent;
        conn.iss = iss;
        conn.snd_una = iss;
        conn.snd_nxt = iss.wrapping_add(1);
        table.alloc_slot(conn).ok_or(NetError::NoBufferSpace)?
    };

    klog_debug!("tcp: connect {} -> {} iss={}", local, remote, iss);

    let mut seg = TcpOutSegment::bare(
        dev,
        tuple,
        iss,
        0,
        TCP_FLAG_SYN,
        DEFAULT_WINDOW_SIZE,
    );
    seg.mss = DEFAULT_MSS;
    seg.offer_sack = true;
    track_inflight(id, iss, TCP_FLAG_SYN, Vec::new());
    emit(seg);
    Ok(id)
}

/// Passive open: bind a listening slot.
pub fn listen(dev: DevIndex, local: Socket) -> Result<ConnId, NetError> {
    let mut table = TCP_TABLE.lock();
    if table.port_in_use(local) {
        return Err(NetError::AddressInUse);
    }
    let tuple = TcpTuple::new(local, Socket::new(Ipv4Addr::UNSPECIFIED, Port(0)));
    let mut conn = Box::new(TcpConnection::new(dev, tuple));
    conn.state = TcpState::Listen;
    let id = table.alloc_slot(conn).ok_or(NetError::NoBufferSpace)?;
    klog_debug!("tcp: listen on {}", local);
    Ok(id)
}

/// Graceful close. Queues a FIN behind any pending data.
pub fn close(id: ConnId) -> Result<(), NetError> {
    let action = {
        let mut table = TCP_TABLE.lock();
        let conn = table.get_mut(id).ok_or(NetError::NotConnected)?;
        let dev = conn.dev;
        match conn.state {
            TcpState::Listen | TcpState::SynSent => {
                table.release(id);
                return Ok(());
            }
            TcpState::SynReceived | TcpState::Established => {
                conn.state = TcpState::FinWait1;
                conn.fin_queued = true;
                Some((dev, conn.ct))
            }
            TcpState::CloseWait => {
                conn.state = TcpState::LastAck;
                conn.fin_queued = true;
                Some((dev, conn.ct))
            }
            _ => None,
        }
    };

    if let Some((dev, ct)) = action {
        notify_ct_closing(dev, ct);
        flush_transmit(id);
    }
    Ok(())
}

/// Abort: RST out, slot released.
pub fn abort(id: ConnId) -> Result<(), NetError> {
    let seg = {
        let mut table = TCP_TABLE.lock();
        let conn = table.get_mut(id).ok_or(NetError::NotConnected)?;
        let seg = if conn.state != TcpState::Listen && conn.state != TcpState::Closed {
            Some(TcpOutSegment::bare(
                conn.dev,
                conn.tuple,
                conn.snd_nxt,
                0,
                TCP_FLAG_RST,
                0,
            ))
        } else {
            None
        };
        let closing = (conn.dev, conn.ct);
        table.release(id);
        (seg, closing)
    };
    let (seg, (dev, ct)) = seg;
    notify_ct_closing(dev, ct);
    if let Some(seg) = seg {
        emit(seg);
    }
    Ok(())
}

fn notify_ct_closing(dev: DevIndex, ct: Option<CtId>) {
    let Some(ct_id) = ct else { return };
    let now = clock::wall_s();
    if let Some(handle) = super::inet::with_inet(dev, |inet| inet.conntrack.clone()) {
        handle.lock().tcp_closing(ct_id, now);
    }
}

// =============================================================================
// Send path
// =============================================================================

/// Queue application bytes for transmission.
pub fn send(id: ConnId, data: &[u8]) -> Result<usize, NetError> {
    {
        let mut table = TCP_TABLE.lock();
        let conn = table.get_mut(id).ok_or(NetError::NotConnected)?;
        match conn.state {
            TcpState::Established | TcpState::CloseWait => {}
            TcpState::Closed => return Err(NetError::NotConnected),
            _ if conn.fin_queued => return Err(NetError::Shutdown),
            _ => return Err(NetError::NotConnected),
        }
        conn.pending_tx.extend(data.iter().copied());
    }
    flush_transmit(id);
    Ok(data.len())
}

/// Bytes ready for `recv`.
pub fn readable(id: ConnId) -> usize {
    TCP_TABLE.lock().get(id).map(|c| c.read_q.len()).unwrap_or(0)
}

/// Drain in-order bytes into `buf`.
pub fn recv(id: ConnId, buf: &mut [u8]) -> Result<usize, NetError> {
    let mut table = TCP_TABLE.lock();
    let conn = table.get_mut(id).ok_or(NetError::NotConnected)?;
    if let Some(err) = conn.pending_error.take() {
        return Err(err);
    }
    if conn.read_q.is_empty() {
        return match conn.state {
            TcpState::SynSent
            | TcpState::SynReceived
            | TcpState::Established
            | TcpState::FinWait1
            | TcpState::FinWait2 => Err(NetError::WouldBlock),
            // Peer sent FIN (or the slot is closing): EOF.
            _ => Ok(0),
        };
    }
    let n = conn.read_q.len().min(buf.len());
    for slot in buf[..n].iter_mut() {
        *slot = conn.read_q.pop_front().unwrap();
    }
    Ok(n)
}

/// Register a read delegate: fires once at least `min_size` in-order bytes
/// are queued.
pub fn on_read(id: ConnId, min_size: usize, cb: OnReadFn) -> Result<(), NetError> {
    let mut table = TCP_TABLE.lock();
    let conn = table.get_mut(id).ok_or(NetError::NotConnected)?;
    conn.on_read = Some((min_size, cb));
    Ok(())
}

fn track_inflight(id: ConnId, seq: u32, flags: u8, data: Vec<u8>) {
    let now = clock::uptime_ms();
    let mut table = TCP_TABLE.lock();
    let Some(conn) = table.get_mut(id) else { return };
    conn.inflight.push_back(TxSegment {
        seq,
        flags,
        data,
        sent_ms: now,
        retransmitted: false,
        sacked: false,
    });
    if conn.retransmit_timer == TimerToken::INVALID {
        conn.retransmit_timer =
            NET_TIMERS.schedule(TimerKind::TcpRetransmit, id.0 as u32, conn.rto_ms as u64);
    }
}

/// Segment pending bytes into the open window and transmit them.
fn flush_transmit(id: ConnId) {
    loop {
        let seg = {
            let mut table = TCP_TABLE.lock();
            let Some(conn) = table.get_mut(id) else { return };
            if !matches!(
                conn.state,
                TcpState::Established
                    | TcpState::CloseWait
                    | TcpState::FinWait1
                    | TcpState::LastAck
            ) {
                return;
            }

            let window = conn.send_window();
            let in_flight = conn.bytes_in_flight();
            let mss = conn.effective_mss() as usize;

            if conn.pending_tx.is_empty() {
                // Data drained: emit the queued FIN, once.
                if conn.fin_queued
                    && !conn
                        .inflight
                        .iter()
                        .any(|s| s.flags & TCP_FLAG_FIN != 0)
                {
                    let seq = conn.snd_nxt;
                    conn.snd_nxt = seq.wrapping_add(1);
                    let seg = TcpOutSegment::bare(
                        conn.dev,
                        conn.tuple,
                        seq,
                        conn.rcv_nxt,
                        TCP_FLAG_FIN | TCP_FLAG_ACK,
                        conn.rcv_wnd,
                    );
                    conn.inflight.push_back(TxSegment {
                        seq,
                        flags: TCP_FLAG_FIN | TCP_FLAG_ACK,
                        data: Vec::new(),
                        sent_ms: clock::uptime_ms(),
                        retransmitted: false,
                        sacked: false,
                    });
                    if conn.retransmit_timer == TimerToken::INVALID {
                        conn.retransmit_timer = NET_TIMERS.schedule(
                            TimerKind::TcpRetransmit,
                            id.0 as u32,
                            conn.rto_ms as u64,
                        );
                    }
                    Some(seg)
                } else {
                    None
                }
            } else if in_flight >= window {
                None
            } else {
                let budget = (window - in_flight) as usize;
                let take = conn.pending_tx.len().min(mss).min(budget);
                if take == 0 {
                    None
                } else {
                    let data: Vec<u8> = conn.pending_tx.drain(..take).collect();
                    let seq = conn.snd_nxt;
                    conn.snd_nxt = seq.wrapping_add(take as u32);
                    let mut seg = TcpOutSegment::bare(
                        conn.dev,
                        conn.tuple,
                        seq,
                        conn.rcv_nxt,
                        TCP_FLAG_ACK | TCP_FLAG_PSH,
                        conn.rcv_wnd,
                    );
                    seg.payload = data.clone();
                    conn.inflight.push_back(TxSegment {
                        seq,
                        flags: seg.flags,
                        data,
                        sent_ms: clock::uptime_ms(),
                        retransmitted: false,
                        sacked: false,
                    });
                    if conn.retransmit_timer == TimerToken::INVALID {
                        conn.retransmit_timer = NET_TIMERS.schedule(
                            TimerKind::TcpRetransmit,
                            id.0 as u32,
                            conn.rto_ms as u64,
                        );
                    }
                    Some(seg)
                }
            }
        };

        match seg {
            Some(seg) => emit(seg),
            None => return,
        }
    }
}

// =============================================================================
// Timers
// =============================================================================

/// Retransmission timeout for connection `key`.
pub fn on_retransmit_timer(key: u32, now_ms: u64) {
    let id = ConnId(key as usize);
    let (seg, give_up) = {
        let mut table = TCP_TABLE.lock();
        let Some(conn) = table.get_mut(id) else { return };
        conn.retransmit_timer = TimerToken::INVALID;

        let (seq, flags, data) = {
            let Some(unacked) = conn.inflight.iter_mut().find(|s| !s.sacked) else {
                return;
            };
            unacked.retransmitted = true;
            unacked.sent_ms = now_ms;
            (unacked.seq, unacked.flags, unacked.data.clone())
        };

        conn.retransmits += 1;
        if conn.retransmits > MAX_RETRANSMITS {
            (None, true)
        } else {
            conn.on_rto();
            // Exponential backoff.
            conn.rto_ms = (conn.rto_ms * 2).min(MAX_RTO_MS);

            let mut seg = TcpOutSegment::bare(
                conn.dev,
                conn.tuple,
                seq,
                conn.rcv_nxt,
                flags,
                conn.rcv_wnd,
            );
            seg.payload = data;
            if flags & TCP_FLAG_SYN != 0 {
                seg.mss = DEFAULT_MSS;
                seg.offer_sack = true;
            }
            conn.retransmit_timer =
                NET_TIMERS.schedule(TimerKind::TcpRetransmit, key, conn.rto_ms as u64);
            (Some(seg), false)
        }
    };

    if give_up {
        klog_debug!("tcp: conn {} exceeded {} retransmits", key, MAX_RETRANSMITS);
        set_error_and_release(id, NetError::TimedOut);
        return;
    }
    if let Some(seg) = seg {
        emit(seg);
    }
}

/// 2×MSL expired for connection `key`.
pub fn on_time_wait_timer(key: u32, _now_ms: u64) {
    let id = ConnId(key as usize);
    let mut table = TCP_TABLE.lock();
    if let Some(conn) = table.get(id) {
        if conn.state == TcpState::TimeWait {
            klog_debug!("tcp: TIME_WAIT expired for {}", conn.tuple.local);
            table.release(id);
        }
    }
}

static MSL_MS: IrqMutex<u64> = IrqMutex::new(30_000);

/// TIME_WAIT lasts 2×MSL. RFC 9293 wants an MSL of 30–120 s; tests dial it
/// down.
pub fn set_msl_ms(msl: u64) {
    *MSL_MS.lock() = msl;
}

fn msl_ms() -> u64 {
    *MSL_MS.lock()
}

fn set_error_and_release(id: ConnId, err: NetError) {
    let mut table = TCP_TABLE.lock();
    if let Some(conn) = table.get_mut(id) {
        conn.pending_error = Some(err);
        conn.state = TcpState::Closed;
        conn.closed = true;
    }
}

// =============================================================================
// PMTU + ICMP error integration
// =============================================================================

/// The PMTU cache shrank (or created) an entry toward `dest`: clamp every
/// matching connection's segment size to `pmtu − 60`.
pub fn on_path_mtu(dest: Socket, pmtu: u16) {
    let limit = pmtu.saturating_sub(60).max(1);
    let mut table = TCP_TABLE.lock();
    for conn in table.connections.iter_mut().flatten() {
        if conn.tuple.remote == dest {
            conn.path_mss_limit = limit;
            klog_debug!("tcp: {} mss clamped to {}", dest, limit);
        }
    }
}

/// A PMTU entry aged out: lift the clamp so the path gets re-probed.
pub fn on_path_mtu_expired(dest: Socket) {
    let mut table = TCP_TABLE.lock();
    for conn in table.connections.iter_mut().flatten() {
        if conn.tuple.remote == dest {
            conn.path_mss_limit = 0;
        }
    }
}

/// ICMP error for a segment we sent `original_src → original_dst`.
pub fn error_report(original_src: Socket, original_dst: Socket, err: IcmpError) {
    if !err.is_fatal() {
        return;
    }
    let id = {
        let table = TCP_TABLE.lock();
        table.find(&TcpTuple::new(original_src, original_dst))
    };
    let Some(id) = id else { return };

    let reset = {
        let mut table = TCP_TABLE.lock();
        match table.get_mut(id) {
            Some(conn) if conn.state == TcpState::SynSent => {
                conn.pending_error = Some(NetError::ConnectionRefused);
                conn.state = TcpState::Closed;
                conn.closed = true;
                true
            }
            Some(conn) => {
                conn.pending_error = Some(NetError::HostUnreachable);
                false
            }
            None => false,
        }
    };
    if reset {
        klog_debug!("tcp: {} unreachable, connection refused", original_dst);
    }
}

// =============================================================================
// Ingress
// =============================================================================

/// Process a TCP segment whose head sits at the TCP header. `ct` is the
/// conntrack entry resolved by the IP layer.
pub fn handle_rx(dev: DevIndex, ip: Ipv4Header, mut pkt: PacketBuf, ct: Option<CtId>) {
    let segment = pkt.payload();
    let Some(header) = parse_header(segment) else {
        ip4::drop_packet(dev, ip4::Direction::Ingress, ip4::DropReason::BadLength);
        return;
    };
    if !verify_transport_checksum(ip.src, ip.dst, IPPROTO_TCP, segment) {
        ip4::drop_packet(dev, ip4::Direction::Ingress, ip4::DropReason::WrongChecksum);
        return;
    }

    let options = parse_options(&segment[TCP_HEADER_LEN..header.header_len()]);
    let _ = pkt.pull_header(header.header_len());

    let tuple = TcpTuple::new(
        Socket::new(ip.dst, Port(header.dst_port)),
        Socket::new(ip.src, Port(header.src_port)),
    );

    let id = TCP_TABLE.lock().find(&tuple);
    let Some(id) = id else {
        // No connection: RST unless the segment itself is one.
        if !header.is_rst() {
            emit(build_rst_for(dev, &tuple, &header, pkt.len() as u32));
        }
        return;
    };

    process_segment(dev, id, tuple, header, options, pkt.payload(), ct);
}

/// RST for a segment that hit no connection (RFC 793 §3.4).
fn build_rst_for(dev: DevIndex, tuple: &TcpTuple, hdr: &TcpHeader, payload_len: u32) -> TcpOutSegment {
    if hdr.is_ack() {
        TcpOutSegment::bare(dev, *tuple, hdr.ack_num, 0, TCP_FLAG_RST, 0)
    } else {
        let mut seg_len = payload_len;
        if hdr.is_syn() {
            seg_len += 1;
        }
        TcpOutSegment::bare(
            dev,
            *tuple,
            0,
            hdr.seq_num.wrapping_add(seg_len),
            TCP_FLAG_RST | TCP_FLAG_ACK,
            0,
        )
    }
}

#[allow(clippy::too_many_arguments)]
fn process_segment(
    dev: DevIndex,
    id: ConnId,
    tuple: TcpTuple,
    header: TcpHeader,
    options: TcpOptions,
    payload: &[u8],
    ct: Option<CtId>,
) {
    let now_ms = clock::uptime_ms();
    let state = match TCP_TABLE.lock().get(id) {
        Some(conn) => conn.state,
        None => return,
    };

    match state {
        TcpState::Listen => process_listen(dev, id, tuple, header, options, ct),
        TcpState::SynSent => process_syn_sent(id, header, options, now_ms),
        TcpState::SynReceived => process_syn_received(id, header, now_ms),
        TcpState::TimeWait => process_time_wait(id, header),
        TcpState::Closed => {}
        _ => process_established(id, header, options, payload, now_ms),
    }
}

/// LISTEN: a SYN spawns a child connection in SYN_RCVD.
fn process_listen(
    dev: DevIndex,
    listen_id: ConnId,
    tuple: TcpTuple,
    header: TcpHeader,
    options: TcpOptions,
    ct: Option<CtId>,
) {
    if header.is_rst() {
        return;
    }
    if header.is_ack() {
        emit(TcpOutSegment::bare(
            dev,
            tuple,
            header.ack_num,
            0,
            TCP_FLAG_RST,
            0,
        ));
        return;
    }
    if !header.is_syn() {
        return;
    }

    let iss = generate_isn();
    let listener_port = match TCP_TABLE.lock().get(listen_id) {
        Some(listener) => listener.tuple.local.port,
        None => return,
    };

    let child = {
        let mut table = TCP_TABLE.lock();
        let mut conn = Box::new(TcpConnection::new(dev, tuple));
        conn.state = TcpState::SynReceived;
        conn.iss = iss;
        conn.snd_una = iss;
        conn.snd_nxt = iss.wrapping_add(1);
        conn.irs = header.seq_num;
        conn.rcv_nxt = header.seq_num.wrapping_add(1);
        conn.snd_wnd = header.window_size as u32;
        conn.peer_mss = options.mss.unwrap_or(DEFAULT_MSS);
        conn.peer_wscale = options.window_scale.unwrap_or(0);
        conn.sack_enabled = options.sack_permitted;
        conn.listener_port = Some(listener_port);
        conn.ct = ct;
        match table.alloc_slot(conn) {
            Some(id) => id,
            None => return, // table full: drop the SYN silently
        }
    };

    klog_debug!(
        "tcp: {} syn from {}, child {:?} in SYN_RCVD",
        tuple.local,
        tuple.remote,
        child
    );

    let rcv_nxt = header.seq_num.wrapping_add(1);
    let mut seg = TcpOutSegment::bare(
        dev,
        tuple,
        iss,
        rcv_nxt,
        TCP_FLAG_SYN | TCP_FLAG_ACK,
        DEFAULT_WINDOW_SIZE,
    );
    seg.mss = DEFAULT_MSS;
    seg.offer_sack = true;
    track_inflight(child, iss, TCP_FLAG_SYN | TCP_FLAG_ACK, Vec::new());
    emit(seg);
}

/// SYN_SENT: expecting SYN|ACK (or a simultaneous-open SYN).
fn process_syn_sent(id: ConnId, header: TcpHeader, options: TcpOptions, now_ms: u64) {
    enum Outcome {
        None,
        Send(TcpOutSegment),
        Refused,
        Established(TcpOutSegment),
    }

    let outcome = {
        let mut table = TCP_TABLE.lock();
        let Some(conn) = table.get_mut(id) else { return };

        if header.is_ack()
            && (seq_le(header.ack_num, conn.iss) || seq_gt(header.ack_num, conn.snd_nxt))
        {
            if header.is_rst() {
                Outcome::None
            } else {
                Outcome::Send(TcpOutSegment::bare(
                    conn.dev,
                    conn.tuple,
                    header.ack_num,
                    0,
                    TCP_FLAG_RST,
                    0,
                ))
            }
        } else if header.is_rst() {
            if header.is_ack() {
                Outcome::Refused
            } else {
                Outcome::None
            }
        } else if !header.is_syn() {
            Outcome::None
        } else {
            conn.irs = header.seq_num;
            conn.rcv_nxt = header.seq_num.wrapping_add(1);
            // RFC 7323: the window field of a SYN segment is never scaled.
            conn.snd_wnd = header.window_size as u32;
            conn.peer_mss = options.mss.unwrap_or(DEFAULT_MSS);
            conn.peer_wscale = options.window_scale.unwrap_or(0);
            conn.sack_enabled = options.sack_permitted;

            if header.is_ack() {
                conn.snd_una = header.ack_num;
            }

            if seq_gt(conn.snd_una, conn.iss) {
                conn.state = TcpState::Established;
                conn.retransmits = 0;
                let una = conn.snd_una;
                conn.inflight.retain(|s| seq_gt(s.seq_end(), una));
                if let Some(sent) = rtt_sample_from_handshake(conn, now_ms) {
                    conn.sample_rtt(sent);
                }
                klog_debug!("tcp: {:?} SYN_SENT -> ESTABLISHED", id);
                Outcome::Established(TcpOutSegment::bare(
                    conn.dev,
                    conn.tuple,
                    conn.snd_nxt,
                    conn.rcv_nxt,
                    TCP_FLAG_ACK,
                    conn.rcv_wnd,
                ))
            } else {
                // Simultaneous open.
                conn.state = TcpState::SynReceived;
                let mut seg = TcpOutSegment::bare(
                    conn.dev,
                    conn.tuple,
                    conn.iss,
                    conn.rcv_nxt,
                    TCP_FLAG_SYN | TCP_FLAG_ACK,
                    conn.rcv_wnd,
                );
                seg.mss = DEFAULT_MSS;
                seg.offer_sack = true;
                Outcome::Send(seg)
            }
        }
    };

    match outcome {
        Outcome::None => {}
        Outcome::Send(seg) => emit(seg),
        Outcome::Refused => {
            klog_debug!("tcp: {:?} refused in SYN_SENT", id);
            set_error_and_release(id, NetError::ConnectionRefused);
        }
        Outcome::Established(seg) => {
            mark_established(id);
            emit(seg);
            super::tcp_socket::notify_connected(id);
        }
    }
}

fn rtt_sample_from_handshake(conn: &TcpConnection, now_ms: u64) -> Option<u32> {
    let syn = conn.inflight.front()?;
    if syn.retransmitted {
        return None;
    }
    Some(now_ms.saturating_sub(syn.sent_ms).max(1) as u32)
}

/// SYN_RCVD: the handshake's final ACK.
fn process_syn_received(id: ConnId, header: TcpHeader, now_ms: u64) {
    enum Outcome {
        None,
        Send(TcpOutSegment),
        Reset,
        Accepted(Option<Port>),
    }

    let outcome = {
        let mut table = TCP_TABLE.lock();
        let Some(conn) = table.get_mut(id) else { return };

        if header.is_rst() {
            Outcome::Reset
        } else if !header.is_ack() {
            Outcome::None
        } else if seq_lt(header.ack_num, conn.snd_una) || seq_gt(header.ack_num, conn.snd_nxt) {
            Outcome::Send(TcpOutSegment::bare(
                conn.dev,
                conn.tuple,
                header.ack_num,
                0,
                TCP_FLAG_RST,
                0,
            ))
        } else {
            conn.snd_una = header.ack_num;
            // The handshake ACK is not a SYN segment: its window is scaled
            // by whatever the peer's SYN negotiated.
            conn.snd_wnd = (header.window_size as u32) << conn.peer_wscale;
            conn.state = TcpState::Established;
            conn.retransmits = 0;
            let una = conn.snd_una;
            conn.inflight.retain(|s| seq_gt(s.seq_end(), una));
            if let Some(rtt) = rtt_sample_from_handshake(conn, now_ms) {
                conn.sample_rtt(rtt);
            }
            klog_debug!("tcp: {:?} SYN_RCVD -> ESTABLISHED", id);
            Outcome::Accepted(conn.listener_port)
        }
    };

    match outcome {
        Outcome::None => {}
        Outcome::Send(seg) => emit(seg),
        Outcome::Reset => {
            TCP_TABLE.lock().release(id);
        }
        Outcome::Accepted(listener_port) => {
            mark_established(id);
            if let Some(port) = listener_port {
                super::tcp_socket::notify_accepted(port, id);
            }
        }
    }
}

fn mark_established(id: ConnId) {
    let (dev, ct) = match TCP_TABLE.lock().get(id) {
        Some(conn) => (conn.dev, conn.ct),
        None => return,
    };
    if let Some(ct_id) = ct {
        let now = clock::wall_s();
        if let Some(handle) = super::inet::with_inet(dev, |inet| inet.conntrack.clone()) {
            handle.lock().tcp_established(ct_id, now);
        }
    }
}

/// ESTABLISHED and the closing states: ACK bookkeeping, data, FIN.
fn process_established(
    id: ConnId,
    header: TcpHeader,
    options: TcpOptions,
    payload: &[u8],
    now_ms: u64,
) {
    enum After {
        None,
        Emit(TcpOutSegment),
        Reset,
        SynReset(TcpOutSegment),
    }

    let mut deliver: Option<(OnReadFn, Vec<u8>)> = None;
    let mut retransmit_now = false;
    let mut window_opened = false;

    let after = {
        let mut table = TCP_TABLE.lock();
        let Some(conn) = table.get_mut(id) else { return };
        let state = conn.state;

        if header.is_rst() {
            After::Reset
        } else if header.is_syn() {
            let seg =
                TcpOutSegment::bare(conn.dev, conn.tuple, conn.snd_nxt, 0, TCP_FLAG_RST, 0);
            After::SynReset(seg)
        } else if !header.is_ack() {
            After::None
        } else {
            // --- ACK processing ---
            let ack = header.ack_num;
            if seq_gt(ack, conn.snd_una) && seq_le(ack, conn.snd_nxt) {
                let advanced = ack.wrapping_sub(conn.snd_una);
                conn.snd_una = ack;
                conn.snd_wnd = (header.window_size as u32) << conn.peer_wscale;
                conn.dup_acks = 0;
                conn.retransmits = 0;

                // Karn: only sample fresh transmissions.
                if let Some(seg) = conn
                    .inflight
                    .iter()
                    .find(|s| seq_le(s.seq_end(), ack) && !s.retransmitted)
                {
                    let rtt = now_ms.saturating_sub(seg.sent_ms).max(1) as u32;
                    conn.sample_rtt(rtt);
                }

                conn.inflight.retain(|s| seq_gt(s.seq_end(), ack));
                conn.on_ack_advance(advanced);
                window_opened = true;

                NET_TIMERS.cancel(conn.retransmit_timer);
                conn.retransmit_timer = if conn.inflight.is_empty() {
                    TimerToken::INVALID
                } else {
                    NET_TIMERS.schedule(TimerKind::TcpRetransmit, id.0 as u32, conn.rto_ms as u64)
                };
            } else if ack == conn.snd_una
                && payload.is_empty()
                && !header.is_fin()
                && !conn.inflight.is_empty()
            {
                conn.dup_acks = conn.dup_acks.saturating_add(1);
                if conn.dup_acks == DUP_ACK_THRESHOLD {
                    conn.on_fast_retransmit();
                    retransmit_now = true;
                }
            }

            // Peer-reported SACK blocks mark in-flight segments.
            for block in &options.sack_blocks {
                for seg in conn.inflight.iter_mut() {
                    if seq_ge(seg.seq, block.start) && seq_le(seg.seq_end(), block.end) {
                        seg.sacked = true;
                    }
                }
            }

            // State transitions driven by our FIN being acked.
            let fin_acked = conn.fin_queued && conn.snd_una == conn.snd_nxt;
            match state {
                TcpState::FinWait1 if fin_acked => {
                    if header.is_fin() {
                        conn.state = TcpState::TimeWait;
                        conn.time_wait_start_ms = now_ms;
                    } else {
                        conn.state = TcpState::FinWait2;
                    }
                }
                TcpState::Closing if fin_acked => {
                    conn.state = TcpState::TimeWait;
                    conn.time_wait_start_ms = now_ms;
                }
                TcpState::LastAck if fin_acked => {
                    klog_debug!("tcp: {:?} LAST_ACK -> CLOSED", id);
                    let (dev, ct) = (conn.dev, conn.ct);
                    table.release(id);
                    drop(table);
                    notify_ct_closing(dev, ct);
                    return;
                }
                _ => {}
            }

            let Some(conn) = table.get_mut(id) else { return };

            // --- Segment text ---
            let mut respond_ack = false;
            if !payload.is_empty() && conn.state.can_receive_data() {
                respond_ack = true;
                ingest_payload(conn, header.seq_num, payload);
                if let Some((min_size, cb)) = conn.on_read {
                    if conn.read_q.len() >= min_size {
                        let bytes: Vec<u8> = conn.read_q.drain(..).collect();
                        deliver = Some((cb, bytes));
                    }
                }
            }

            // --- FIN ---
            let mut entered_time_wait = false;
            if header.is_fin() {
                let fin_seq = header.seq_num.wrapping_add(payload.len() as u32);
                if fin_seq == conn.rcv_nxt {
                    conn.rcv_nxt = conn.rcv_nxt.wrapping_add(1);
                    respond_ack = true;
                    match conn.state {
                        TcpState::Established => conn.state = TcpState::CloseWait,
                        TcpState::FinWait1 => {
                            conn.state = TcpState::Closing;
                        }
                        TcpState::FinWait2 => {
                            conn.state = TcpState::TimeWait;
                            conn.time_wait_start_ms = now_ms;
                            entered_time_wait = true;
                        }
                        _ => {}
                    }
                }
            }

            if entered_time_wait || conn.state == TcpState::TimeWait {
                NET_TIMERS.schedule(TimerKind::TcpTimeWait, id.0 as u32, 2 * msl_ms());
            }

            if respond_ack {
                let mut seg = TcpOutSegment::bare(
                    conn.dev,
                    conn.tuple,
                    conn.snd_nxt,
                    conn.rcv_nxt,
                    TCP_FLAG_ACK,
                    conn.rcv_wnd,
                );
                if conn.sack_enabled {
                    seg.sack = conn.scoreboard.report(3).to_vec();
                }
                After::Emit(seg)
            } else {
                After::None
            }
        }
    };

    match after {
        After::None => {}
        After::Emit(seg) => emit(seg),
        After::Reset => {
            klog_debug!("tcp: {:?} reset by peer", id);
            let info = TCP_TABLE.lock().get(id).map(|c| (c.dev, c.ct));
            if let Some((dev, ct)) = info {
                notify_ct_closing(dev, ct);
            }
            set_error_and_release(id, NetError::ConnectionReset);
        }
        After::SynReset(seg) => {
            emit(seg);
            set_error_and_release(id, NetError::ConnectionReset);
        }
    }

    if retransmit_now {
        fast_retransmit(id);
    }
    if window_opened {
        flush_transmit(id);
        super::tcp_socket::notify_writable(id);
    }
    if let Some((cb, bytes)) = deliver {
        cb(id, &bytes);
    }
}

/// Fold segment text into the in-order queue or the out-of-order store.
fn ingest_payload(conn: &mut TcpConnection, seq: u32, payload: &[u8]) {
    if seq == conn.rcv_nxt {
        conn.read_q.extend(payload.iter().copied());
        conn.rcv_nxt = conn.rcv_nxt.wrapping_add(payload.len() as u32);

        // The hole may have closed: pull contiguous out-of-order data in.
        loop {
            let Some((&ooo_seq, _)) = conn.ooo.iter().next() else { break };
            if seq_gt(ooo_seq, conn.rcv_nxt) {
                break;
            }
            let (_, data) = conn.ooo.pop_first().unwrap();
            let skip = conn.rcv_nxt.wrapping_sub(ooo_seq) as usize;
            if skip < data.len() {
                conn.read_q.extend(data[skip..].iter().copied());
                conn.rcv_nxt = ooo_seq.wrapping_add(data.len() as u32);
            }
        }
        conn.scoreboard.new_valid_ack(conn.rcv_nxt);
    } else if seq_gt(seq, conn.rcv_nxt) {
        // A hole: remember the bytes and report the block.
        conn.ooo.entry(seq).or_insert_with(|| payload.to_vec());
        conn.scoreboard.recv_out_of_order(seq, payload.len() as u32);
    } else {
        // Overlapping retransmission: keep only the new tail.
        let skip = conn.rcv_nxt.wrapping_sub(seq) as usize;
        if skip < payload.len() {
            let next = conn.rcv_nxt;
            ingest_payload(conn, next, &payload[skip..]);
        }
    }
}

/// Retransmit the first unacked, un-SACKed segment immediately.
fn fast_retransmit(id: ConnId) {
    let seg = {
        let mut table = TCP_TABLE.lock();
        let Some(conn) = table.get_mut(id) else { return };
        let Some(unacked) = conn.inflight.iter_mut().find(|s| !s.sacked) else {
            return;
        };
        unacked.retransmitted = true;
        let mut seg = TcpOutSegment::bare(
            conn.dev,
            conn.tuple,
            unacked.seq,
            conn.rcv_nxt,
            unacked.flags,
            conn.rcv_wnd,
        );
        seg.payload = unacked.data.clone();
        seg
    };
    klog_debug!("tcp: fast retransmit seq={}", seg.seq_num);
    emit(seg);
}

/// TIME_WAIT: a retransmitted FIN restarts the timer and re-ACKs.
fn process_time_wait(id: ConnId, header: TcpHeader) {
    let seg = {
        let mut table = TCP_TABLE.lock();
        let Some(conn) = table.get_mut(id) else { return };
        if header.is_rst() {
            table.release(id);
            return;
        }
        if !header.is_fin() {
            return;
        }
        conn.time_wait_start_ms = clock::uptime_ms();
        NET_TIMERS.schedule(TimerKind::TcpTimeWait, id.0 as u32, 2 * msl_ms());
        TcpOutSegment::bare(
            conn.dev,
            conn.tuple,
            conn.snd_nxt,
            conn.rcv_nxt,
            TCP_FLAG_ACK,
            conn.rcv_wnd,
        )
    };
    emit(seg);
}

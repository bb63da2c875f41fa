//! The NIC driver contract and the device registry.
//!
//! Drivers live outside this crate; they implement [`NetDevice`] and
//! register themselves. Only [`PacketBuf`] crosses the boundary. Completion
//! notification travels the other way: a driver that previously reported a
//! full TX queue invokes the registered queue-available delegate, which the
//! TCP layer uses to resume sending.

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;

use keel_lib::IrqMutex;

use super::packetbuf::PacketBuf;
use super::types::{DevIndex, MacAddr, NetError};

/// Abstraction for a network device (virtio-net, loopback, test rigs).
///
/// All methods take `&self`; implementations use interior mutability. TX
/// may be called from any fiber; RX polling has a single consumer (the
/// ingress loop on the device's owning CPU).
pub trait NetDevice: Send + Sync {
    /// Transmit one packet, following its chain links for scatter/gather.
    /// The packet chain is consumed.
    fn transmit(&self, pkt: PacketBuf) -> Result<(), NetError>;

    /// Drain up to `budget` received frames.
    fn poll_rx(&self, budget: usize) -> Vec<PacketBuf>;

    /// Link MTU (IP payload bytes, excluding the Ethernet header).
    fn mtu(&self) -> u16;

    /// Hardware address.
    fn mac(&self) -> MacAddr;

    /// Re-home the device's interrupt delivery to the calling CPU.
    fn move_to_this_cpu(&self) {}
}

/// Delegate invoked when a previously full TX queue has room again.
pub type TxQueueAvailableFn = fn(DevIndex);

const MAX_DEVICES: usize = 8;

struct RegistryInner {
    slots: [Option<Box<dyn NetDevice>>; MAX_DEVICES],
    tx_avail: [Option<TxQueueAvailableFn>; MAX_DEVICES],
    count: usize,
}

/// Control-plane storage for registered devices. The lock is taken briefly
/// per operation; devices serialize their own TX internally.
pub struct NetDeviceRegistry {
    inner: IrqMutex<RegistryInner>,
}

pub static DEVICE_REGISTRY: NetDeviceRegistry = NetDeviceRegistry::new();

impl NetDeviceRegistry {
    pub const fn new() -> Self {
        Self {
            inner: IrqMutex::new(RegistryInner {
                slots: [const { None }; MAX_DEVICES],
                tx_avail: [const { None }; MAX_DEVICES],
                count: 0,
            }),
        }
    }

    /// Register a device, assigning the next free index.
    pub fn register(&self, dev: Box<dyn NetDevice>) -> Option<DevIndex> {
        let mut inner = self.inner.lock();
        for (i, slot) in inner.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(dev);
                inner.count += 1;
                return Some(DevIndex(i));
            }
        }
        None
    }

    /// Drop a device. The caller must have quiesced all TX/RX beforehand.
    pub fn unregister(&self, index: DevIndex) -> bool {
        let mut inner = self.inner.lock();
        if index.0 >= MAX_DEVICES {
            return false;
        }
        if inner.slots[index.0].take().is_some() {
            inner.tx_avail[index.0] = None;
            inner.count -= 1;
            true
        } else {
            false
        }
    }

    pub fn device_count(&self) -> usize {
        self.inner.lock().count
    }

    pub fn transmit(&self, index: DevIndex, pkt: PacketBuf) -> Result<(), NetError> {
        let inner = self.inner.lock();
        match inner.slots.get(index.0) {
            Some(Some(dev)) => dev.transmit(pkt),
            _ => Err(NetError::NetworkUnreachable),
        }
    }

    pub fn mac(&self, index: DevIndex) -> Option<MacAddr> {
        let inner = self.inner.lock();
        inner.slots.get(index.0)?.as_ref().map(|d| d.mac())
    }

    pub fn mtu(&self, index: DevIndex) -> Option<u16> {
        let inner = self.inner.lock();
        inner.slots.get(index.0)?.as_ref().map(|d| d.mtu())
    }

    pub fn poll_rx(&self, index: DevIndex, budget: usize) -> Vec<PacketBuf> {
        let inner = self.inner.lock();
        match inner.slots.get(index.0) {
            Some(Some(dev)) => dev.poll_rx(budget),
            _ => Vec::new(),
        }
    }

    /// Install the TX-queue-available delegate for `index`.
    pub fn set_tx_queue_available(&self, index: DevIndex, f: TxQueueAvailableFn) {
        let mut inner = self.inner.lock();
        if index.0 < MAX_DEVICES {
            inner.tx_avail[index.0] = Some(f);
        }
    }

    /// Driver-side notification: the TX queue drained below its high-water
    /// mark.
    pub fn notify_tx_queue_available(&self, index: DevIndex) {
        let callback = {
            let inner = self.inner.lock();
            inner.tx_avail.get(index.0).copied().flatten()
        };
        if let Some(f) = callback {
            f(index);
        }
    }
}

// =============================================================================
// Loopback
// =============================================================================

/// A software device that reflects every transmitted frame back into its
/// own RX queue. Doubles as the rig for single-stack tests.
pub struct LoopbackDevice {
    mac: MacAddr,
    mtu: u16,
    rx_queue: IrqMutex<Vec<PacketBuf>>,
}

impl LoopbackDevice {
    pub fn new(mac: MacAddr, mtu: u16) -> Self {
        Self {
            mac,
            mtu,
            rx_queue: IrqMutex::new(Vec::new()),
        }
    }
}

impl NetDevice for LoopbackDevice {
    fn transmit(&self, mut pkt: PacketBuf) -> Result<(), NetError> {
        let mut queue = self.rx_queue.lock();
        while let Some(next) = pkt.take_chain() {
            queue.push(next);
        }
        queue.push(pkt);
        Ok(())
    }

    fn poll_rx(&self, budget: usize) -> Vec<PacketBuf> {
        let mut queue = self.rx_queue.lock();
        let take = budget.min(queue.len());
        queue.drain(..take).collect()
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }

    fn mac(&self) -> MacAddr {
        self.mac
    }
}

// =============================================================================
// Capture device
// =============================================================================

/// A device that parks every transmitted frame in a numbered mailbox as
/// raw bytes. The stack's test rigs wire two of these back to back to
/// simulate a cable; a packet-capture service can tap one for diagnostics.
pub struct CaptureDevice {
    mac: MacAddr,
    mtu: u16,
    mailbox: usize,
}

const MAX_MAILBOXES: usize = 16;

static MAILBOXES: IrqMutex<[Vec<Vec<u8>>; MAX_MAILBOXES]> =
    IrqMutex::new([const { Vec::new() }; MAX_MAILBOXES]);

impl CaptureDevice {
    pub fn new(mac: MacAddr, mtu: u16, mailbox: usize) -> Self {
        debug_assert!(mailbox < MAX_MAILBOXES);
        Self { mac, mtu, mailbox }
    }

    /// Drain every frame captured in `mailbox`.
    pub fn drain_mailbox(mailbox: usize) -> Vec<Vec<u8>> {
        let mut boxes = MAILBOXES.lock();
        core::mem::take(&mut boxes[mailbox])
    }

    /// Frames waiting in `mailbox`.
    pub fn mailbox_len(mailbox: usize) -> usize {
        MAILBOXES.lock()[mailbox].len()
    }

    /// Empty every mailbox (test teardown).
    pub fn clear_all() {
        let mut boxes = MAILBOXES.lock();
        for slot in boxes.iter_mut() {
            slot.clear();
        }
    }
}

impl NetDevice for CaptureDevice {
    fn transmit(&self, mut pkt: PacketBuf) -> Result<(), NetError> {
        let mut boxes = MAILBOXES.lock();
        loop {
            boxes[self.mailbox].push(pkt.payload().to_vec());
            match pkt.take_chain() {
                Some(next) => pkt = next,
                None => break,
            }
        }
        Ok(())
    }

    fn poll_rx(&self, _budget: usize) -> Vec<PacketBuf> {
        Vec::new()
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }

    fn mac(&self) -> MacAddr {
        self.mac
    }
}

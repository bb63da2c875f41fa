#![no_std]
#![no_main]

//! The keel image: limine protocol requests, boot sequencing, and the
//! service entry point. Everything else lives in the subsystem crates;
//! this binary wires them together in dependency order and then hands the
//! CPU to the cooperative scheduler's idle loop.

extern crate alloc;

use core::panic::PanicInfo;

use limine::BaseRevision;
use limine::request::{ExecutableAddressRequest, HhdmRequest, MemoryMapRequest};

use keel_abi::addr::{PhysAddr, VirtAddr};
use keel_lib::{clock, cpu, klog_error, klog_info, serial};
use keel_mm::HeapAllocator;
use keel_net::inet::InetConfig;
use keel_net::netdev::{DEVICE_REGISTRY, LoopbackDevice};
use keel_net::types::{Ipv4Addr, MacAddr};

#[global_allocator]
static GLOBAL_ALLOCATOR: HeapAllocator = HeapAllocator::new();

// ---------------------------------------------------------------------------
// Limine protocol requests
// ---------------------------------------------------------------------------

#[used]
#[unsafe(link_section = ".limine_requests")]
static BASE_REVISION: BaseRevision = BaseRevision::new();

#[used]
#[unsafe(link_section = ".limine_requests")]
static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();

#[used]
#[unsafe(link_section = ".limine_requests")]
static MEMMAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

#[used]
#[unsafe(link_section = ".limine_requests")]
static KERNEL_ADDRESS_REQUEST: ExecutableAddressRequest = ExecutableAddressRequest::new();

// Text extent, courtesy of the linker.
unsafe extern "C" {
    static __executable_start: u8;
    static etext: u8;
}

// ---------------------------------------------------------------------------
// Boot
// ---------------------------------------------------------------------------

/// Pick the largest usable RAM region for the frame pool.
fn largest_usable_region() -> Option<(u64, u64)> {
    let memmap = MEMMAP_REQUEST.get_response()?;
    memmap
        .entries()
        .iter()
        .filter(|e| e.entry_type == limine::memory_map::EntryType::USABLE)
        .map(|e| (e.base, e.length))
        .max_by_key(|&(_, length)| length)
}

fn init_memory() {
    if let Some((base, length)) = largest_usable_region() {
        // SAFETY: the region comes straight from the boot memory map and
        // is not used for anything else.
        let usable = unsafe { keel_mm::frame::init_frame_pool(PhysAddr::new(base), length) };
        klog_info!("boot: frame pool over {} MiB of RAM", usable / (1024 * 1024));
    } else {
        klog_error!("boot: no usable memory region reported");
    }

    if let Err(e) = keel_mm::paging::init_identity_map() {
        panic!("paging setup failed: {}", e);
    }

    let text_start = VirtAddr::new((&raw const __executable_start) as u64);
    let text_end = VirtAddr::new((&raw const etext) as u64);
    if let Err(e) = keel_mm::paging::protect_text(text_start, text_end) {
        klog_error!("boot: text protection failed: {}", e);
    }

    // Register the heap with the memory map, reporting logical usage.
    let heap_start = GLOBAL_ALLOCATOR.arena_start();
    let heap_end = heap_start + GLOBAL_ALLOCATOR.arena_size() - 1;
    let _ = keel_mm::memmap::with_memmap(|map| {
        let range = keel_mm::memmap::FixedMemoryRange::with_in_use(
            heap_start,
            heap_end,
            "kernel heap",
            heap_bytes_in_use,
        )?;
        map.assign_range(range)
    });

    keel_mm::memmap::dump();
}

fn heap_bytes_in_use() -> usize {
    GLOBAL_ALLOCATOR.bytes_in_use() as usize
}

fn init_network() {
    keel_net::pool::PACKET_POOL.init();

    let lo = LoopbackDevice::new(MacAddr([0x02, 0, 0, 0, 0, 0x01]), 65535);
    if let Some(iface) = DEVICE_REGISTRY.register(alloc::boxed::Box::new(lo)) {
        let mut cfg = InetConfig::unconfigured(65535);
        cfg.addr = Ipv4Addr::LOCALHOST;
        cfg.netmask = Ipv4Addr([255, 0, 0, 0]);
        keel_net::inet::create(iface, cfg);
        klog_info!(
            "net: {} up, mtu {}",
            iface,
            keel_net::inet::mtu_of(iface).unwrap_or(0)
        );
    }
}

/// The application service. A real image links its program here; the stock
/// build brings up an in-memory filesystem and a TCP echo listener as a
/// smoke service.
extern "C" fn service_main(_arg: usize) {
    use keel_fs::memfs::Memfs;

    let memfs: &'static Memfs = alloc::boxed::Box::leak(alloc::boxed::Box::new(Memfs::new(64, 256)));
    let _ = memfs.mkdir("/etc");
    let _ = memfs.create_file("/etc/hostname", b"keel\n");
    let root: &'static keel_fs::Dirent =
        alloc::boxed::Box::leak(alloc::boxed::Box::new(keel_fs::FileSystem::root(memfs)));
    let _ = keel_fs::vfs::mount("/data", root, "boot image");

    if let Some(iface) = keel_net::inet::default_iface() {
        let local = keel_net::types::Socket::new(Ipv4Addr::LOCALHOST, keel_net::types::Port(7));
        if keel_net::tcp_socket::listen(iface, local, 8).is_ok() {
            klog_info!("service: echo listener on {}", local);
            loop {
                let Ok(conn) = keel_net::tcp_socket::accept(keel_net::types::Port(7)) else {
                    break;
                };
                let mut buf = [0u8; 512];
                while let Ok(n) = keel_net::tcp_socket::recv(conn, &mut buf) {
                    if n == 0 {
                        break;
                    }
                    let _ = keel_net::tcp_socket::send(conn, &buf[..n]);
                }
                let _ = keel_net::tcp_socket::close(conn);
            }
        }
    }
}

#[unsafe(no_mangle)]
extern "C" fn kmain() -> ! {
    serial::init();
    keel_lib::klog::klog_init();
    klog_info!("keel starting");

    assert!(BASE_REVISION.is_supported(), "limine base revision");
    if let Some(hhdm) = HHDM_REQUEST.get_response() {
        keel_mm::hhdm::set_phys_offset(hhdm.offset());
        klog_info!("boot: hhdm offset 0x{:x}", hhdm.offset());
    }
    if let Some(ka) = KERNEL_ADDRESS_REQUEST.get_response() {
        klog_info!(
            "boot: kernel at phys 0x{:x} / virt 0x{:x}",
            ka.physical_base(),
            ka.virtual_base()
        );
    }

    init_memory();
    keel_sched::init_main_thread();
    init_network();
    keel_posix::rng::seed(keel_lib::tsc::rdtsc());

    #[cfg(feature = "itests")]
    {
        klog_info!("running in-kernel test suites");
        let summary = keel_lib::testing::run_all_suites();
        klog_info!(
            "test run complete: {}/{} passed",
            summary.passed,
            summary.total_tests
        );
    }

    keel_sched::spawn(service_main, 0);

    // The idle fallback: drain posted work, run fibers, pump the device
    // and the timers. No platform timer or NIC interrupt is wired in this
    // tree (device drivers live outside it), so the loop must keep
    // polling — a halt here would never be woken. An image that links a
    // real timer driver ticks the clock from its ISR and can park the CPU
    // instead.
    loop {
        keel_sched::fiber_yield();
        if let Some(iface) = keel_net::inet::default_iface() {
            keel_net::inet::poll_device(iface, 32);
        }
        clock::tick_ms(1);
        keel_net::inet::net_timer_process(clock::uptime_ms());
        core::hint::spin_loop();
    }
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    klog_error!("kernel panic: {}", info);
    cpu::halt_loop();
}

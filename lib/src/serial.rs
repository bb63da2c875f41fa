//! Serial console driver and klog backend.
//!
//! Two paths write to the UART:
//!
//! - [`early_com1_write`] — raw polled port I/O for the first boot messages,
//!   before anything is initialised. Single-threaded boot makes this safe.
//! - The [`uart_16550`] driver behind an [`IrqMutex`], registered as the
//!   klog backend by [`init`]. All runtime logging goes through it.

use core::fmt::{self, Write};

use uart_16550::SerialPort;
use x86_64::instructions::port::Port;

use crate::klog::klog_register_backend;
use crate::spinlock::IrqMutex;

const COM1_BASE: u16 = 0x3F8;
const UART_REG_LSR: u16 = 5;
const UART_LSR_TX_EMPTY: u8 = 0x20;

/// Polled write of raw bytes to COM1, converting `\n` to `\r\n`.
///
/// Used only by the early-boot klog fallback; once [`init`] has run, all
/// output goes through the locked driver below.
pub fn early_com1_write(bytes: &[u8]) {
    let mut lsr: Port<u8> = Port::new(COM1_BASE + UART_REG_LSR);
    let mut thr: Port<u8> = Port::new(COM1_BASE);
    for &b in bytes {
        unsafe {
            if b == b'\n' {
                while lsr.read() & UART_LSR_TX_EMPTY == 0 {}
                thr.write(b'\r');
            }
            while lsr.read() & UART_LSR_TX_EMPTY == 0 {}
            thr.write(b);
        }
    }
}

static COM1_DRIVER: IrqMutex<Option<SerialPort>> = IrqMutex::new(None);

fn serial_backend(args: fmt::Arguments<'_>) {
    let mut guard = COM1_DRIVER.lock();
    match guard.as_mut() {
        Some(port) => {
            let _ = port.write_fmt(args);
            let _ = port.write_str("\n");
        }
        None => {
            drop(guard);
            struct EarlyWriter;
            impl fmt::Write for EarlyWriter {
                fn write_str(&mut self, s: &str) -> fmt::Result {
                    early_com1_write(s.as_bytes());
                    Ok(())
                }
            }
            let _ = fmt::write(&mut EarlyWriter, args);
            early_com1_write(b"\n");
        }
    }
}

/// Initialise COM1 and take over as the klog backend.
pub fn init() {
    {
        let mut guard = COM1_DRIVER.lock();
        if guard.is_none() {
            // SAFETY: COM1_BASE is the standard COM1 I/O block.
            let mut port = unsafe { SerialPort::new(COM1_BASE) };
            port.init();
            *guard = Some(port);
        }
    }
    klog_register_backend(serial_backend);
}

//! Kernel console sink
//!
//! The console itself (UART, framebuffer text renderer) is an external
//! collaborator. This module only holds the registered sink: a pair of raw
//! output functions installed once by the platform glue. Until a sink is
//! registered, printk keeps everything in its ring buffer.

use core::sync::atomic::{AtomicUsize, Ordering};

/// A registered console sink
#[derive(Clone, Copy)]
pub struct ConsoleSink {
    /// Write bytes to the console (may lock internally)
    pub write: fn(&[u8]),
    /// Best-effort write used from the panic path; must not block
    pub emergency_write: fn(&[u8]),
}

/// Registered sink, stored as a raw fn-pair address (0 = none)
static SINK_WRITE: AtomicUsize = AtomicUsize::new(0);
static SINK_EMERGENCY: AtomicUsize = AtomicUsize::new(0);

/// Install the console sink
///
/// Called once by platform glue when the console device is ready.
pub fn register_sink(sink: ConsoleSink) {
    SINK_EMERGENCY.store(sink.emergency_write as usize, Ordering::Release);
    SINK_WRITE.store(sink.write as usize, Ordering::Release);
}

/// Whether a console sink has been registered
pub fn has_console() -> bool {
    SINK_WRITE.load(Ordering::Acquire) != 0
}

/// Write bytes to the registered sink, if any
pub fn console_write(bytes: &[u8]) {
    let raw = SINK_WRITE.load(Ordering::Acquire);
    if raw != 0 {
        let f: fn(&[u8]) = unsafe { core::mem::transmute(raw) };
        f(bytes);
    }
}

/// Best-effort write for the panic path
pub fn emergency_write(bytes: &[u8]) {
    let raw = SINK_EMERGENCY.load(Ordering::Acquire);
    if raw != 0 {
        let f: fn(&[u8]) = unsafe { core::mem::transmute(raw) };
        f(bytes);
    }
}

//! Kernel log
//!
//! `printk!`/`printkln!` format into a fixed ring that survives from
//! the first instruction of boot; once a console sink is attached and
//! flushed, output also goes to the sink directly. The ring doubles as
//! a post-mortem record.
//!
//! Locking is split in two so a slow console cannot back up the ring:
//! `LOG` guards the ring (short hold), `SINK_LOCK` serializes sink
//! I/O and keeps whole messages contiguous across CPUs. During a panic
//! the writer degrades to `try_lock` plus the emergency sink, since
//! the panicking CPU may already own `SINK_LOCK`.

use ::core::fmt::{self, Write};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch::IrqSpinlock;
use crate::console;

/// Bytes kept in the log ring (power of two)
const LOG_RING_SIZE: usize = 16384;

/// Serializes sink I/O; never held while only buffering
static SINK_LOCK: IrqSpinlock<()> = IrqSpinlock::new(());

/// Set once the panic path begins; writers stop blocking on SINK_LOCK
static PANICKING: AtomicBool = AtomicBool::new(false);

/// Switch printk to its panic-safe mode
///
/// Called at the top of the panic handler; never cleared.
pub fn set_oops_in_progress() {
    PANICKING.store(true, Ordering::Release);
}

/// Boot log ring
///
/// `head` is the absolute write position since boot; the ring holds
/// the last `LOG_RING_SIZE` bytes of it. `drained` tracks how far the
/// flush has read, and lags `head` by at most the ring size.
struct LogRing {
    data: [u8; LOG_RING_SIZE],
    head: u64,
    drained: u64,
    lost: u64,
    /// Whether the attach-time flush already ran
    live: bool,
}

impl LogRing {
    const fn new() -> Self {
        Self {
            data: [0; LOG_RING_SIZE],
            head: 0,
            drained: 0,
            lost: 0,
            live: false,
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.data[(self.head as usize) & (LOG_RING_SIZE - 1)] = b;
            self.head += 1;
        }
        // Writers may lap the drain point; the overwritten tail is lost
        if self.head - self.drained > LOG_RING_SIZE as u64 {
            let floor = self.head - LOG_RING_SIZE as u64;
            self.lost += floor - self.drained;
            self.drained = floor;
        }
    }

    /// Copy undrained bytes into `out`, advancing the drain point
    fn drain(&mut self, out: &mut [u8]) -> usize {
        let mut n = 0;
        while self.drained < self.head && n < out.len() {
            out[n] = self.data[(self.drained as usize) & (LOG_RING_SIZE - 1)];
            self.drained += 1;
            n += 1;
        }
        n
    }

    fn undrained(&self) -> usize {
        (self.head - self.drained) as usize
    }
}

/// The log ring
static LOG: IrqSpinlock<LogRing> = IrqSpinlock::new(LogRing::new());

/// Push the ring's backlog out to the console
///
/// Called by the platform glue right after it registers a sink. Runs
/// before the heap exists, so it drains through a stack chunk. After
/// this, new messages stream to the sink as they are written.
pub fn flush() {
    if !console::has_console() {
        return;
    }

    let _io = SINK_LOCK.lock();
    let mut ring = LOG.lock();
    if ring.live {
        return;
    }

    let mut chunk = [0u8; 128];
    loop {
        let n = ring.drain(&mut chunk);
        if n == 0 {
            break;
        }
        console::console_write(&chunk[..n]);
    }

    ring.live = true;
}

/// Record bytes and, when live, forward them to the sink
///
/// Caller holds SINK_LOCK.
fn emit(bytes: &[u8]) {
    let live = {
        let mut ring = LOG.lock();
        ring.push(bytes);
        ring.live
    };

    if live && console::has_console() {
        console::console_write(bytes);
    }
}

/// fmt::Write adapter behind the printk macros
///
/// Construction takes SINK_LOCK so a whole formatted message stays
/// contiguous; in panic mode a failed try_lock routes the text to the
/// emergency sink instead of deadlocking.
pub struct PrintkWriter {
    io_guard: Option<crate::arch::IrqSpinlockGuard<'static, ()>>,
}

impl PrintkWriter {
    pub fn new() -> Self {
        let io_guard = if PANICKING.load(Ordering::Acquire) {
            SINK_LOCK.try_lock()
        } else {
            Some(SINK_LOCK.lock())
        };
        Self { io_guard }
    }
}

impl Default for PrintkWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl Write for PrintkWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if self.io_guard.is_some() {
            emit(s.as_bytes());
        } else {
            console::emergency_write(s.as_bytes());
        }
        Ok(())
    }
}

/// Print to the kernel log; never blocks on a missing console
#[macro_export]
macro_rules! printk {
    ($($arg:tt)*) => {{
        use ::core::fmt::Write;
        let mut writer = $crate::printk::PrintkWriter::new();
        let _ = write!(writer, $($arg)*);
    }};
}

/// Print to the kernel log with a trailing newline
#[macro_export]
macro_rules! printkln {
    () => {
        $crate::printk!("\n")
    };
    ($($arg:tt)*) => {{
        use ::core::fmt::Write;
        let mut writer = $crate::printk::PrintkWriter::new();
        let _ = write!(writer, $($arg)*);
        let _ = writer.write_str("\n");
    }};
}

/// Log statistics: (undrained bytes, ring capacity, overflowed)
pub fn stats() -> (usize, usize, bool) {
    let ring = LOG.lock();
    (ring.undrained(), LOG_RING_SIZE, ring.lost > 0)
}

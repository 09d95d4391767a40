//! Kernel log ring buffer
//!
//! Captures everything the logger emits into a fixed ring so the boot
//! log can be inspected after the fact (shell `dmesg`, crash triage)
//! without replaying the serial line. Oldest bytes are dropped once
//! the ring fills.
//!
//! Lock-free single-producer design: the logger is the only writer,
//! readers only load the indices, so this stays safe to call from
//! interrupt context.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Size of the log ring buffer (32 KiB).
const LOG_BUFFER_SIZE: usize = 32 * 1024;

static mut LOG_BUFFER: [u8; LOG_BUFFER_SIZE] = [0u8; LOG_BUFFER_SIZE];

/// Read index (oldest byte).
static LOG_HEAD: AtomicUsize = AtomicUsize::new(0);
/// Write index (one past the newest byte).
static LOG_TAIL: AtomicUsize = AtomicUsize::new(0);
static LOG_READY: AtomicBool = AtomicBool::new(false);

/// Start capturing.
pub fn init() {
    LOG_READY.store(true, Ordering::SeqCst);
}

#[inline]
pub fn is_ready() -> bool {
    LOG_READY.load(Ordering::Relaxed)
}

/// Capture one byte. Must not block or allocate.
#[inline]
pub fn capture_byte(byte: u8) {
    if !is_ready() {
        return;
    }

    let tail = LOG_TAIL.load(Ordering::Relaxed);
    let next_tail = (tail + 1) % LOG_BUFFER_SIZE;
    let head = LOG_HEAD.load(Ordering::Acquire);

    if next_tail == head {
        // Full: drop the oldest byte.
        LOG_HEAD.store((head + 1) % LOG_BUFFER_SIZE, Ordering::Release);
    }

    unsafe {
        (*(&raw mut LOG_BUFFER))[tail] = byte;
    }
    LOG_TAIL.store(next_tail, Ordering::Release);
}

/// Capture a string.
pub fn capture_str(s: &str) {
    for &byte in s.as_bytes() {
        capture_byte(byte);
    }
}

/// Bytes currently buffered.
pub fn len() -> usize {
    let head = LOG_HEAD.load(Ordering::Acquire);
    let tail = LOG_TAIL.load(Ordering::Acquire);
    if tail >= head {
        tail - head
    } else {
        LOG_BUFFER_SIZE - head + tail
    }
}

/// Copy the buffered log, oldest first, without consuming it.
///
/// The ring stores raw UTF-8 bytes; a multi-byte sequence clipped by
/// the overflow drop decodes to a replacement character, not garbage.
pub fn read_all() -> alloc::string::String {
    let head = LOG_HEAD.load(Ordering::Acquire);
    let tail = LOG_TAIL.load(Ordering::Acquire);

    let mut bytes = alloc::vec::Vec::with_capacity(len());
    let mut index = head;
    while index != tail {
        bytes.push(unsafe { (*(&raw const LOG_BUFFER))[index] });
        index = (index + 1) % LOG_BUFFER_SIZE;
    }
    alloc::string::String::from_utf8_lossy(&bytes).into_owned()
}

/// A `core::fmt::Write` sink over the ring, for the logger.
pub struct LogBufferWriter;

impl core::fmt::Write for LogBufferWriter {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        capture_str(s);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The ring is global state shared by every test in the process, so
    // one test exercises the whole protocol in order.
    #[test]
    fn capture_and_read_back() {
        init();
        assert!(is_ready());

        capture_str("alpha ");
        capture_str("beta");
        let contents = read_all();
        assert!(contents.ends_with("alpha beta"));
        assert!(len() >= 10);

        // Non-destructive: a second read sees the same tail.
        assert_eq!(read_all(), contents);

        // Multi-byte UTF-8 survives the byte-wise ring.
        capture_str(" héllo °C");
        assert!(read_all().ends_with(" héllo °C"));

        // Overflow drops the oldest bytes but keeps the ring coherent.
        for _ in 0..LOG_BUFFER_SIZE + 100 {
            capture_byte(b'x');
        }
        let flooded = read_all();
        assert!(flooded.len() < LOG_BUFFER_SIZE);
        assert!(flooded.ends_with("xxx"));
    }
}

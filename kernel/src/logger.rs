//! Kernel logger
//!
//! Routes the `log` facade to the serial port. Registered once during
//! early init; everything after that point uses `log::info!` and
//! friends rather than raw serial prints.

use log::{LevelFilter, Log, Metadata, Record};

struct SerialLogger;

static LOGGER: SerialLogger = SerialLogger;

impl Log for SerialLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        crate::serial_println!(
            "[{:5}] {}: {}",
            record.level(),
            record.target(),
            record.args()
        );

        // Mirror into the ring buffer for later inspection.
        if crate::log_buffer::is_ready() {
            use core::fmt::Write;
            let mut sink = crate::log_buffer::LogBufferWriter;
            let _ = writeln!(
                sink,
                "[{:5}] {}: {}",
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

/// Install the serial logger at the given level.
pub fn init(level: LevelFilter) {
    crate::log_buffer::init();
    log::set_logger(&LOGGER).expect("Logger already set");
    log::set_max_level(level);
    log::info!("Logger initialized at {} level", level);
}

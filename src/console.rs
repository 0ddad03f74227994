//! Kernel console for the paging subsystem
//!
//! A bounded in-memory message buffer, the place kernel diagnostics land when
//! there is no UART to write to. The `log` facade is routed here by
//! [`ConsoleLogger`], and `kprint!`/`kprintln!` write to it directly.

use alloc::string::{String as AllocString, ToString};
use alloc::vec::Vec;
use core::fmt::{self, Write};
use heapless::{Deque, String};
use log::{LevelFilter, Log, Metadata, Record};
use spin::{Mutex, Once};

/// Longest line kept in the buffer; longer lines are truncated
pub const LINE_CAPACITY: usize = 160;

/// Lines kept before the oldest is dropped
pub const LOG_LINES: usize = 64;

/// Console message buffer
pub struct Console {
    lines: Deque<String<LINE_CAPACITY>, LOG_LINES>,
    current: String<LINE_CAPACITY>,
    dropped: usize,
}

impl Console {
    /// Create an empty console
    pub const fn new() -> Self {
        Console {
            lines: Deque::new(),
            current: String::new(),
            dropped: 0,
        }
    }

    /// Write a byte to the console
    pub fn write_byte(&mut self, byte: u8) {
        if byte == b'\n' {
            self.flush_line();
            return;
        }
        if byte.is_ascii() {
            // Overlong lines are cut, not wrapped
            let _ = self.current.push(byte as char);
        }
    }

    /// Write a string to the console
    pub fn write_str(&mut self, s: &str) {
        for byte in s.bytes() {
            self.write_byte(byte);
        }
    }

    fn flush_line(&mut self) {
        let line = core::mem::take(&mut self.current);
        if self.lines.is_full() {
            self.lines.pop_front();
            self.dropped += 1;
        }
        let _ = self.lines.push_back(line);
    }

    /// Copy out every complete line
    pub fn snapshot(&self) -> Vec<AllocString> {
        self.lines.iter().map(|l| l.as_str().to_string()).collect()
    }

    /// Take every complete line, leaving the buffer empty
    pub fn drain(&mut self) -> Vec<AllocString> {
        let mut out = Vec::with_capacity(self.lines.len());
        while let Some(line) = self.lines.pop_front() {
            out.push(line.as_str().to_string());
        }
        out
    }

    /// Lines lost to overflow since boot
    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

impl fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        Console::write_str(self, s);
        Ok(())
    }
}

/// Global console instance
static CONSOLE: Mutex<Console> = Mutex::new(Console::new());

/// Print formatted text to console
pub fn print(args: fmt::Arguments) {
    let _ = CONSOLE.lock().write_fmt(args);
}

/// Copy out the console contents
pub fn snapshot() -> Vec<AllocString> {
    CONSOLE.lock().snapshot()
}

/// Take the console contents
pub fn drain() -> Vec<AllocString> {
    CONSOLE.lock().drain()
}

/// Print macro for kernel use
#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => {
        $crate::console::print(format_args!($($arg)*));
    };
}

/// Print with newline macro
#[macro_export]
macro_rules! kprintln {
    () => {
        $crate::kprint!("\n");
    };
    ($($arg:tt)*) => {
        $crate::console::print(format_args!("{}\n", format_args!($($arg)*)))
    };
}

// ============================================================================
// log facade sink
// ============================================================================

/// Routes `log` records to the console buffer
pub struct ConsoleLogger;

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            print(format_args!(
                "[{:<5} {}] {}\n",
                record.level(),
                record.target(),
                record.args()
            ));
        }
    }

    fn flush(&self) {}
}

static LOGGER: ConsoleLogger = ConsoleLogger;
static LOGGER_INSTALLED: Once<bool> = Once::new();

/// Initialize the console and install it as the `log` sink
///
/// Returns false if another logger was installed first; the level is applied
/// either way.
pub fn init(level: LevelFilter) -> bool {
    let installed = *LOGGER_INSTALLED.call_once(|| log::set_logger(&LOGGER).is_ok());
    log::set_max_level(level);
    installed
}

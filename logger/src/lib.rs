//! Simple module to provide logging & printing utils

#![no_std]
// TODO: Remove this once you fix the `as` conversion warnings
#![allow(clippy::cast_possible_truncation)]

use core::fmt::{self, Write};
#[cfg(feature = "serial")]
pub mod serial;

/// Empty struct to implement 'Write' on
pub struct Writer;

/// A macro to print to the serial port with a newline
#[macro_export]
macro_rules! println {
    ($($arg:tt)*) => {{
        let _ = core::fmt::Write::write_fmt(&mut $crate::Writer, format_args!("{}\n", format_args!($($arg)*)));
    }}
}

/// Logs an informational message
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::println!("-> INFO: {}", format_args!($($arg)*));
    }
}

/// Logs an error
#[macro_export]
macro_rules! log_err {
    ($($arg:tt)*) => {
        $crate::println!("-> ERROR: {}", format_args!($($arg)*));
    }
}

/// Logs a warning
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::println!("-> WARNING: {}", format_args!($($arg)*));
    }
}

/// Logs a debug message. Compiled out entirely in release builds
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        #[cfg(debug_assertions)]
        $crate::println!("-> DEBUG: {}", format_args!($($arg)*));
    }
}

impl Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            #[cfg(feature = "serial")]
            #[allow(static_mut_refs)]
            unsafe {
                serial::SERIAL_WRITER.write_byte_all(byte);
            };
        }

        Ok(())
    }
}

//! Internal macros

/// Log one line and terminate the process.
///
/// Reserved for unrecoverable misuse or system exhaustion: a missing
/// thread-local scheduler at a public entry, stack mapping failure, or a
/// broken poller inside the main loop.
macro_rules! fatality {
    ($($arg:tt)*) => {{
        log::error!($($arg)*);
        std::process::abort()
    }};
}

pub(crate) use fatality;

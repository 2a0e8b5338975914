/*
Copyright (c) 2020 Todd Stellanova
LICENSE: BSD3 (see LICENSE file)
*/

//! Logging shims. Lines go to the `log` facade and, with the `rttdebug`
//! feature, are mirrored onto the RTT channel.

macro_rules! log_rtt {
    ($($arg:tt)*) => {
        #[cfg(feature = "rttdebug")]
        {
            ::panic_rtt_core::rprintln!($($arg)*);
        }
    };
}

macro_rules! log_error {
    ($($arg:tt)*) => {{
        ::log::error!($($arg)*);
        log_rtt!($($arg)*);
    }};
}

macro_rules! log_warn {
    ($($arg:tt)*) => {{
        ::log::warn!($($arg)*);
        log_rtt!($($arg)*);
    }};
}

macro_rules! log_info {
    ($($arg:tt)*) => {{
        ::log::info!($($arg)*);
        log_rtt!($($arg)*);
    }};
}

/// Per-write chatter, never mirrored to RTT
macro_rules! log_debug {
    ($($arg:tt)*) => {
        ::log::debug!($($arg)*)
    };
}

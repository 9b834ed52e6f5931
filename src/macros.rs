#[cfg(feature = "log")]
#[macro_use]
mod shim {
    macro_rules! ftl_log {
        (trace, $($arg:expr),*) => { log::trace!($($arg),*); };
        (debug, $($arg:expr),*) => { log::debug!($($arg),*); };
    }
}

#[cfg(not(feature = "log"))]
#[macro_use]
mod shim {
    macro_rules! ftl_log {
        ($level:ident, $($arg:expr),*) => { $( let _ = &$arg; )* }
    }
}

macro_rules! ftl_trace {
    ($($arg:expr),*) => (ftl_log!(trace, $($arg),*));
}

macro_rules! ftl_debug {
    ($($arg:expr),*) => (ftl_log!(debug, $($arg),*));
}

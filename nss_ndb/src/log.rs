use std::fmt;
use std::io::{stderr, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use syslog::{Facility, Formatter3164, Logger, LoggerBackend};

type Syslog = Logger<LoggerBackend, Formatter3164>;

lazy_static! {
    static ref LOGGER: Mutex<Option<Syslog>> = Mutex::new(get_logger());
}

static DEBUG: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Error,
    Warning,
    Notice,
    Debug,
}

fn get_logger() -> Option<Syslog> {
    let formatter = Formatter3164 {
        facility: Facility::LOG_USER,
        hostname: None,
        process: "nss_ndb".into(),
        pid: std::process::id(),
    };
    // A host without a syslog socket just loses the messages.
    syslog::unix(formatter).ok()
}

pub fn set_debug(on: bool) {
    DEBUG.store(on, Ordering::Relaxed);
}

pub fn debug_enabled() -> bool {
    DEBUG.load(Ordering::Relaxed)
}

pub fn emit(level: Level, args: fmt::Arguments<'_>) {
    let debug = debug_enabled();
    if level == Level::Debug && !debug {
        return;
    }
    let message = args.to_string();
    if debug {
        let _ = writeln!(&mut stderr(), "nss_ndb: {}", message);
    }

    let mut guard = match LOGGER.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if let Some(logger) = guard.as_mut() {
        let sent = match level {
            Level::Error => logger.err(message),
            Level::Warning => logger.warning(message),
            Level::Notice => logger.notice(message),
            Level::Debug => logger.debug(message),
        };
        if let Err(e) = sent {
            if debug {
                let _ = writeln!(&mut stderr(), "nss_ndb: error logging: {}", e);
            }
        }
    }
}

macro_rules! error {
    ( $ ( $ arg : tt ) * ) => {
        $crate::log::emit($crate::log::Level::Error, format_args!($($arg)*))
    };
}

macro_rules! warning {
    ( $ ( $ arg : tt ) * ) => {
        $crate::log::emit($crate::log::Level::Warning, format_args!($($arg)*))
    };
}

macro_rules! notice {
    ( $ ( $ arg : tt ) * ) => {
        $crate::log::emit($crate::log::Level::Notice, format_args!($($arg)*))
    };
}

macro_rules! debug {
    ( $ ( $ arg : tt ) * ) => {
        $crate::log::emit($crate::log::Level::Debug, format_args!($($arg)*))
    };
}

//! Host status codes.

use std::ffi::c_int;

use crate::lookup::LookupError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NssStatus {
    TryAgain,
    Unavail,
    NotFound,
    Success,
}

impl NssStatus {
    /// The numeric value the platform's name service switch expects.
    #[cfg(target_os = "linux")]
    pub const fn code(self) -> c_int {
        match self {
            NssStatus::TryAgain => -2,
            NssStatus::Unavail => -1,
            NssStatus::NotFound => 0,
            NssStatus::Success => 1,
        }
    }

    #[cfg(not(target_os = "linux"))]
    pub const fn code(self) -> c_int {
        match self {
            NssStatus::Success => 1,
            NssStatus::Unavail => 2,
            NssStatus::NotFound => 4,
            NssStatus::TryAgain => 8,
        }
    }
}

// glibc only retries with a larger buffer on TRYAGAIN + ERANGE; the BSD
// dispatcher looks at ERANGE alone.
#[cfg(target_os = "linux")]
const BUFFER_TOO_SMALL: NssStatus = NssStatus::TryAgain;
#[cfg(not(target_os = "linux"))]
const BUFFER_TOO_SMALL: NssStatus = NssStatus::NotFound;

impl LookupError {
    pub fn status(&self) -> NssStatus {
        match self {
            LookupError::Unavailable(_) => NssStatus::Unavail,
            LookupError::NotFound => NssStatus::NotFound,
            LookupError::BufferTooSmall(_) => BUFFER_TOO_SMALL,
        }
    }

    pub fn errno(&self) -> c_int {
        match self {
            LookupError::Unavailable(e) => e.raw_os_error().unwrap_or(libc::EIO),
            LookupError::NotFound => libc::ENOENT,
            LookupError::BufferTooSmall(_) => libc::ERANGE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ArenaExhausted;
    use crate::store::StoreError;
    use std::io;
    use std::path::PathBuf;

    #[test]
    fn buffer_too_small_is_erange() {
        let err = LookupError::BufferTooSmall(ArenaExhausted {
            requested: 10,
            available: 4,
        });
        assert_eq!(err.errno(), libc::ERANGE);
        assert_ne!(err.status(), NssStatus::Success);
        assert_ne!(err.status(), NssStatus::Unavail);
    }

    #[test]
    fn unavailable_carries_the_os_error() {
        let err = LookupError::Unavailable(StoreError::Io {
            path: PathBuf::from("/nowhere"),
            source: io::Error::from_raw_os_error(libc::EACCES),
        });
        assert_eq!(err.status(), NssStatus::Unavail);
        assert_eq!(err.errno(), libc::EACCES);
    }

    #[test]
    fn codes_are_distinct() {
        let codes = [
            NssStatus::TryAgain.code(),
            NssStatus::Unavail.code(),
            NssStatus::NotFound.code(),
            NssStatus::Success.code(),
        ];
        for (i, a) in codes.iter().enumerate() {
            assert!(codes[i + 1..].iter().all(|b| a != b));
        }
        assert_eq!(NssStatus::Success.code(), 1);
    }
}

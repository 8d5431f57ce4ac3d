use std::fmt;
use std::io;

/// Portable status codes carried in reply envelopes.
///
/// Handlers translate host `errno` values into these before they cross the
/// request channel; `Status::code` is the on-wire representation (always
/// negative).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Internal,
    NotSupported,
    NoMemory,
    NoResources,
    BadState,
    InvalidArgs,
    BadHandle,
    ShouldWait,
    TimedOut,
    PeerClosed,
    AccessDenied,
    Io,
}

impl Status {
    pub fn code(self) -> i32 {
        match self {
            Status::Internal => -1,
            Status::NotSupported => -2,
            Status::NoMemory => -4,
            Status::NoResources => -5,
            Status::BadState => -20,
            Status::InvalidArgs => -10,
            Status::BadHandle => -11,
            Status::ShouldWait => -22,
            Status::TimedOut => -23,
            Status::PeerClosed => -24,
            Status::AccessDenied => -30,
            Status::Io => -40,
        }
    }

    pub fn from_code(code: i32) -> Option<Status> {
        Some(match code {
            -1 => Status::Internal,
            -2 => Status::NotSupported,
            -4 => Status::NoMemory,
            -5 => Status::NoResources,
            -20 => Status::BadState,
            -10 => Status::InvalidArgs,
            -11 => Status::BadHandle,
            -22 => Status::ShouldWait,
            -23 => Status::TimedOut,
            -24 => Status::PeerClosed,
            -30 => Status::AccessDenied,
            -40 => Status::Io,
            _ => return None,
        })
    }

    /// Host errno to portable status, matching the reply contract: would-block
    /// and in-progress both map to `ShouldWait`.
    pub fn from_errno(errno: i32) -> Status {
        match errno {
            libc::EACCES => Status::AccessDenied,
            libc::EBADF => Status::BadHandle,
            libc::EINPROGRESS => Status::ShouldWait,
            libc::EINVAL => Status::InvalidArgs,
            libc::EIO => Status::Io,
            libc::ENOBUFS => Status::NoResources,
            libc::ENOMEM => Status::NoMemory,
            libc::EWOULDBLOCK => Status::ShouldWait,
            _ => Status::Io,
        }
    }
}

impl From<&io::Error> for Status {
    fn from(err: &io::Error) -> Status {
        Status::from_errno(err.raw_os_error().unwrap_or(libc::EIO))
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?} ({})", self.code())
    }
}

/// Extract the raw errno from an I/O error, for `last_errno` bookkeeping.
pub(crate) fn errno_of(err: &io::Error) -> i32 {
    err.raw_os_error().unwrap_or(libc::EIO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(Status::from_errno(libc::EWOULDBLOCK), Status::ShouldWait);
        assert_eq!(Status::from_errno(libc::EINPROGRESS), Status::ShouldWait);
        assert_eq!(Status::from_errno(libc::ENOMEM), Status::NoMemory);
        assert_eq!(Status::from_errno(libc::ENOBUFS), Status::NoResources);
        assert_eq!(Status::from_errno(libc::ECONNRESET), Status::Io);
    }

    #[test]
    fn code_round_trip() {
        for s in [
            Status::Internal,
            Status::NotSupported,
            Status::NoMemory,
            Status::NoResources,
            Status::BadState,
            Status::InvalidArgs,
            Status::BadHandle,
            Status::ShouldWait,
            Status::TimedOut,
            Status::PeerClosed,
            Status::AccessDenied,
            Status::Io,
        ] {
            assert_eq!(Status::from_code(s.code()), Some(s));
        }
    }
}

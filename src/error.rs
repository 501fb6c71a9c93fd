//! A dedicated error type for everything the core can fail at: I/O,
//! malformed wire data, and the externally observable rc_t taxonomy of
//! the protocol itself.
use std::fmt;
use std::io;
use std::str;

/// A specific custom `Result` for all fallible core functions.
pub type Result<T> = std::result::Result<T, self::Error>;

// helper macro to ease returning the internal protocol errors
#[macro_export]
macro_rules! err_internal {
    ($err:ident) => {
        $crate::error::Error::Protocol($crate::error::ProtocolError::$err)
    };
    ($err:ident($($arg:expr),*)) => {
        $crate::error::Error::Protocol($crate::error::ProtocolError::$err($($arg),*))
    };
}

#[derive(Debug)]
pub enum Error {
    // a network/file I/O error
    Io(io::Error),

    // a conversion to str caused an error
    Utf8(str::Utf8Error),

    // protocol-level error (malformed data, bad rpc, remote error, ...)
    Protocol(ProtocolError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Utf8(e) => write!(f, "UTF8 conversion: {}", e),
            Error::Protocol(e) => write!(f, "protocol error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    pub fn new_internal(e: ProtocolError) -> Self {
        Error::Protocol(e)
    }

    /// Collapse this error down to the classic integer return code from
    /// spec §6, for callers that want an rc_t instead of matching the enum.
    pub fn to_rc(&self) -> i32 {
        match self {
            Error::Io(_) => rc::EIO,
            Error::Utf8(_) => rc::EINVAL,
            Error::Protocol(p) => p.to_rc(),
        }
    }
}

/// The externally observable return-code taxonomy from spec §6.
pub mod rc {
    pub const OK: i32 = 0;
    pub const WAITING: i32 = 1;
    pub const EEXIST: i32 = 2;
    pub const RECHECK: i32 = 3;
    pub const ENOENT: i32 = -2;
    pub const EIO: i32 = -5;
    pub const NXIO: i32 = -6;
    pub const EINVAL: i32 = -22;
    pub const ETIMEDOUT: i32 = -110;
    pub const EOVERFLOW: i32 = -84;
    pub const TODO: i32 = -1000;
    pub const EBADRPC: i32 = -200;
    pub const EREMOTE: i32 = -201;
}

#[derive(Debug)]
pub enum ProtocolError {
    // caller-visible, recoverable, expected (§7)
    NotFound,
    AlreadyExists,
    Waiting,

    // caller-visible, remote (§7): wraps a non-zero remote_rc
    Remote(i32),

    // protocol violations: malformed envelopes, unknown op_id, short body
    BadRpc(&'static str),

    // key string over the 255 byte wire limit
    KeyTooLong,

    // declared meta/data sizes overflow the LDO's user capacity
    SizeOverflow,

    // transport-level failure delivered as a send/get/put/atomic_error transition
    TransportError,

    // timed out waiting for a reply or for local data to arrive
    TimedOut,

    // no IOM registered under the requested name
    NoSuchIom,

    // no function registered under the requested name (Compute)
    NoSuchFunction,

    // allocation of an outgoing envelope or landing buffer failed
    AllocationFailed,

    // resource URL or configuration text could not be parsed
    ParseError(&'static str),

    // bad input to a public API (invalid flags, empty key, etc)
    InvalidArgument(&'static str),
}

impl ProtocolError {
    pub fn to_rc(&self) -> i32 {
        match self {
            ProtocolError::NotFound => rc::ENOENT,
            ProtocolError::AlreadyExists => rc::EEXIST,
            ProtocolError::Waiting => rc::WAITING,
            ProtocolError::Remote(rc) => *rc,
            ProtocolError::BadRpc(_) => rc::EBADRPC,
            ProtocolError::KeyTooLong => rc::EINVAL,
            ProtocolError::SizeOverflow => rc::EOVERFLOW,
            ProtocolError::TransportError => rc::EIO,
            ProtocolError::TimedOut => rc::ETIMEDOUT,
            ProtocolError::NoSuchIom => rc::NXIO,
            ProtocolError::NoSuchFunction => rc::NXIO,
            ProtocolError::AllocationFailed => rc::EIO,
            ProtocolError::ParseError(_) => rc::EINVAL,
            ProtocolError::InvalidArgument(_) => rc::EINVAL,
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::NotFound => f.write_str("key does not exist"),
            ProtocolError::AlreadyExists => {
                f.write_str("key already exists and overwrites are not enabled")
            }
            ProtocolError::Waiting => f.write_str("operation dispatched, not yet resolved"),
            ProtocolError::Remote(rc) => write!(f, "remote returned error code {}", rc),
            ProtocolError::BadRpc(msg) => write!(f, "malformed rpc: {}", msg),
            ProtocolError::KeyTooLong => f.write_str("key component exceeds 255 bytes"),
            ProtocolError::SizeOverflow => f.write_str("meta+data exceeds object capacity"),
            ProtocolError::TransportError => f.write_str("transport reported an error"),
            ProtocolError::TimedOut => f.write_str("operation timed out"),
            ProtocolError::NoSuchIom => f.write_str("no IOM registered under that name"),
            ProtocolError::NoSuchFunction => f.write_str("no compute function registered under that name"),
            ProtocolError::AllocationFailed => f.write_str("failed to allocate outgoing envelope"),
            ProtocolError::ParseError(msg) => write!(f, "parse error: {}", msg),
            ProtocolError::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
        }
    }
}

// All conversions for internal errors into Error
macro_rules! err_from {
    ($err:path, $arm:path) => {
        impl From<$err> for Error {
            fn from(err: $err) -> Self {
                $arm(err)
            }
        }
    };
}

err_from!(io::Error, Error::Io);
err_from!(str::Utf8Error, Error::Utf8);
err_from!(ProtocolError, Error::Protocol);

#![doc = include_str!("../README.md")]
#![warn(missing_debug_implementations)]

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub mod ca;
pub mod connection;
pub mod ns_archive;
pub mod pairing_record;
pub mod relay;
pub mod services;
pub mod usbmuxd;

pub use connection::DeviceConnection;
pub use pairing_record::PairRecord;

use services::afc::errors::AfcError;

/// Identity the crate presents to usbmuxd and lockdownd.
///
/// The values are fixed; lockdownd logs them but applies no policy.
pub const BUNDLE_ID: &str = "anonymous5l.iConsole";
pub const PROG_NAME: &str = "iConsole";
pub const CLIENT_VERSION: &str = "iConsole-Beta";
pub const LIB_USBMUX_VERSION: u64 = 3;
pub const PROTOCOL_VERSION: &str = "2";

/// A trait combining all required characteristics for a device communication
/// socket.
///
/// Any asynchronous duplex byte stream qualifies; tokio's `TcpStream` and
/// `UnixStream` implement this trait, as do the TLS streams the crate wraps
/// them in.
pub trait ReadWrite: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug> ReadWrite for T {}

/// Error type for every failure the protocol stack can surface.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    // Transport
    #[error("socket io failed")]
    Io(#[from] io::Error),
    #[error("mux daemon unavailable")]
    MuxUnavailable,
    #[error("operation timed out")]
    Timeout,
    #[error("no established connection")]
    NotConnected,
    #[error("TLS stack error")]
    OpensslStack(#[from] openssl::error::ErrorStack),
    #[error("TLS handshake failed")]
    Ssl(#[from] openssl::ssl::Error),
    #[error("a TLS session is already active on this stream")]
    TlsAlreadyActive,

    // Serialization
    #[error("io on plist")]
    Plist(#[from] plist::Error),
    #[error("bytes are not valid utf8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("unexpected response from device")]
    UnexpectedResponse,
    #[error("keyed archive class `{0}` is not supported")]
    KeyedArchiveBadClass(String),
    #[error("keyed archive UID {0} is invalid")]
    KeyedArchiveBadUid(u64),

    // Mux protocol results
    #[error("mux rejected the command")]
    MuxBadCommand,
    #[error("mux does not know this device")]
    MuxBadDevice,
    #[error("device refused the connection")]
    MuxConnectionRefused,
    #[error("mux protocol version mismatch")]
    MuxBadVersion,
    #[error("mux error code {0}")]
    MuxError(u64),

    // Lockdown
    #[error("device does not trust this host")]
    InvalidHostId,
    #[error("device is password protected")]
    PasswordProtected,
    #[error("this request was prohibited")]
    GetProhibited,
    #[error("no session is active")]
    SessionInactive,
    #[error("pairing trust dialog pending")]
    PairingDialogResponsePending,
    #[error("user denied pairing trust")]
    UserDeniedPairing,
    #[error("lockdown error `{0}`")]
    Lockdown(String),

    // AFC
    #[error("afc error: {0}")]
    Afc(#[from] AfcError),
    #[error("unknown afc opcode {0:#x}")]
    UnknownAfcOpcode(u64),
    #[error("invalid afc magic")]
    InvalidAfcMagic,
    #[error("missing file attribute `{0}`")]
    AfcMissingAttribute(&'static str),

    // DTX
    #[error("bad dtx magic {0:#x}")]
    DtxBadMagic(u32),
    #[error("dtx fragment out of order")]
    DtxFragmentOutOfOrder,
    #[error("dtx compression type {0} is unsupported")]
    DtxCompressionUnsupported(u32),
    #[error("unknown dtx aux value type {0}")]
    DtxUnknownAuxType(u32),
    #[error("channel `{0}` is not advertised by the device")]
    DtxChannelUnavailable(String),
    #[error("remote NSError {domain} ({code}): {description}")]
    RemoteNsError {
        domain: String,
        code: i64,
        description: String,
    },
}

impl Error {
    /// Converts a lockdown-reported error string to a typed error.
    ///
    /// Unrecognized strings fall through to [`Error::Lockdown`].
    pub(crate) fn from_lockdown_string(e: &str) -> Self {
        match e {
            "InvalidHostID" => Self::InvalidHostId,
            "PasswordProtected" => Self::PasswordProtected,
            "GetProhibited" => Self::GetProhibited,
            "SessionInactive" => Self::SessionInactive,
            "PairingDialogResponsePending" => Self::PairingDialogResponsePending,
            "UserDeniedPairing" => Self::UserDeniedPairing,
            _ => Self::Lockdown(e.to_string()),
        }
    }

    /// Maps a usbmuxd `Number` result to an error. Zero is success.
    pub(crate) fn from_mux_result(number: u64) -> Option<Self> {
        match number {
            0 => None,
            1 => Some(Self::MuxBadCommand),
            2 => Some(Self::MuxBadDevice),
            3 => Some(Self::MuxConnectionRefused),
            6 => Some(Self::MuxBadVersion),
            n => Some(Self::MuxError(n)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mux_result_mapping() {
        assert!(Error::from_mux_result(0).is_none());
        assert!(matches!(Error::from_mux_result(1), Some(Error::MuxBadCommand)));
        assert!(matches!(Error::from_mux_result(2), Some(Error::MuxBadDevice)));
        assert!(matches!(
            Error::from_mux_result(3),
            Some(Error::MuxConnectionRefused)
        ));
        assert!(matches!(Error::from_mux_result(6), Some(Error::MuxBadVersion)));
        assert!(matches!(Error::from_mux_result(42), Some(Error::MuxError(42))));
    }

    #[test]
    fn lockdown_string_mapping() {
        assert!(matches!(
            Error::from_lockdown_string("InvalidHostID"),
            Error::InvalidHostId
        ));
        assert!(matches!(
            Error::from_lockdown_string("PasswordProtected"),
            Error::PasswordProtected
        ));
        match Error::from_lockdown_string("SomethingElse") {
            Error::Lockdown(s) => assert_eq!(s, "SomethingElse"),
            other => panic!("unexpected mapping: {other:?}"),
        }
    }
}

//! Negative errno-style status codes used on the wire for URB replies.
//!
//! The wire carries a signed `i32`; these constants are the handful of
//! values the protocol core itself ever emits. Transports may surface other
//! errno values from the underlying OS call, which are passed through
//! unchanged via [`TransportError`](crate::transport::TransportError)'s raw
//! variant.

/// Invalid argument: a SUBMIT/UNLINK PDU failed validation.
pub const EINVAL: i32 = -22;
/// Resource temporarily unavailable: the URB registry is full.
pub const EAGAIN: i32 = -11;
/// File exists: duplicate SUBMIT `seqnum`.
pub const EEXIST: i32 = -17;
/// No such file or directory: UNLINK target not found (also used, by this
/// implementation's choice, for cancelled URBs; see
/// [`CANCELLED`](self::CANCELLED)).
pub const ENOENT: i32 = -2;
/// Connection timed out.
pub const ETIMEDOUT: i32 = -110;
/// Protocol error, generic transport failure.
pub const EPROTO: i32 = -71;
/// No such device: the claimed device disappeared mid-transfer.
pub const ENODEV: i32 = -19;
/// No buffer space available: a short/overrun packet.
pub const ENOBUFS: i32 = -105;
/// Message too long: the status this implementation's wire protocol uses
/// for a transport-reported buffer error (undersized/oversized transfer
/// buffer), per the error-handling design's buffer-error mapping.
pub const EMSGSIZE: i32 = -90;
/// Value reserved by the protocol for STALL conditions.
pub const ESTALL: i32 = -32;
/// Value the Linux USB core uses for a short read it didn't ask for.
pub const EREMOTEIO: i32 = -121;
/// Alternate cancellation status some implementations use instead of
/// `ENOENT`. This implementation standardizes on `ENOENT` for consistency
/// between the UNLINK reply and the cancelled SUBMIT reply (documented
/// decision, see `DESIGN.md`).
pub const ECANCELED: i32 = -125;

/// The status this implementation uses for a SUBMIT that completed because
/// it was cancelled by a racing UNLINK. Kept as a named alias of `ENOENT` so
/// call sites read as intent rather than a bare magic number.
pub const CANCELLED: i32 = ENOENT;

use crate::transport::TransportError;

/// Maps a transport-layer failure to the wire status the submit processor
/// must reply with (§7 Error Handling Design).
pub fn transport_error_to_status(err: &TransportError) -> i32 {
    match err {
        TransportError::Timeout => ETIMEDOUT,
        TransportError::Stalled => ESTALL,
        TransportError::ShortPacket => EREMOTEIO,
        TransportError::DeviceGone => ENODEV,
        TransportError::BufferError => EMSGSIZE,
        TransportError::Unsupported(_) => EPROTO,
        TransportError::Other(_) => EPROTO,
    }
}

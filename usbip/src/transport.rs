//! The `UsbTransport` collaborator contract: the capability the protocol
//! core needs in order to actually move bytes across a claimed USB device.
//!
//! This module specifies the contract only. A concrete adapter for Linux
//! lives in [`crate::local::usbfs_transport`] behind the `usbfs-transport`
//! feature; tests exercise the submit/unlink processors against an
//! in-memory fake instead.

use std::time::Duration;

use crate::proto::UrbDirection;

/// The four transfer shapes a URB can take, matching §9's tagged-variant
/// design (one transport method instead of eight).
#[derive(Debug, Clone)]
pub enum TransferKind {
    Control { setup: [u8; 8] },
    Bulk,
    Interrupt,
    Iso { start_frame: u32, num_packets: u32 },
}

/// One physical USB transfer to perform against a claimed device.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub kind: TransferKind,
    pub direction: UrbDirection,
    pub endpoint: u8,
    /// Requested length for IN transfers, or the payload for OUT transfers.
    pub buffer_length: u32,
    pub out_data: Option<Vec<u8>>,
    pub timeout: Duration,
}

/// Result of a completed (or failed) transfer, matching the tuple shape from
/// the collaborator contract: `(status, actualLength, data, errorCount,
/// startFrame)`.
#[derive(Debug, Clone, Default)]
pub struct TransferOutcome {
    pub actual_length: u32,
    pub data: Vec<u8>,
    pub error_count: u32,
    pub start_frame: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transfer timed out")]
    Timeout,
    #[error("endpoint stalled")]
    Stalled,
    #[error("short packet")]
    ShortPacket,
    #[error("device is no longer present")]
    DeviceGone,
    #[error("buffer error")]
    BufferError,
    #[error("transport does not support this operation: {0}")]
    Unsupported(&'static str),
    #[error("transport error: {0}")]
    Other(String),
}

/// Exclusive USB I/O access to one claimed device, obtained via
/// [`crate::ClaimHandle::transport`].
///
/// Implementations MAY also provide a best-effort `cancel` hook used by the
/// unlink processor; the default does nothing and lets the in-flight
/// transfer run to completion naturally.
pub trait UsbTransport: Send + Sync {
    /// Performs one USB transfer, blocking the calling worker thread until
    /// it completes, fails, or times out.
    fn transfer(&self, request: TransferRequest) -> Result<TransferOutcome, TransportError>;

    /// Best-effort cancellation of an in-flight transfer previously started
    /// with `transfer`. Returns `true` if cancellation was (or is believed
    /// to have been) delivered, `false` if the transport has no way to
    /// interrupt an in-progress transfer.
    fn cancel(&self, _seqnum: u32) -> bool {
        false
    }
}

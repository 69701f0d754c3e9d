//! A concrete [`UsbTransport`] over Linux's usbfs(5) interface
//! (`/dev/bus/usb`), built on the `usbfs` crate. Gated behind the
//! `usbfs-transport` feature; without it the protocol core still builds and
//! runs against any other `UsbTransport` implementation (tests use an
//! in-memory one).
//!
//! Control transfers go through `usbfs::Device`'s synchronous
//! `control_transfer_in`/`control_transfer_out`, reached through the public
//! `device` field `usbfs::AsyncDevice` exposes. Bulk and interrupt transfers
//! are driven through `usbfs::AsyncDevice::submit`/`reap_nowait`, wrapping
//! each transfer's buffer in a `usbfs::StdBufTransfer`; `reap_nowait` is
//! polled against `request.timeout` rather than using `reap_wait` (which
//! blocks with no timeout of its own), so a stalled bulk/interrupt URB still
//! maps to `TransportError::Timeout`.
//!
//! Isochronous transfers and true mid-flight cancellation aren't
//! implemented: `AsyncDevice::discard` isn't implemented upstream, so
//! `cancel` never has anything it can actually interrupt once a URB has
//! been submitted.

use std::{
    io,
    sync::Mutex,
    thread,
    time::{Duration, Instant},
};

use usbfs::{AsyncDevice, Device as UsbfsDevice, SetupRecipient, SetupType, StdBufTransfer, UrbFlags};

use crate::{
    directory::Device,
    proto::UrbDirection,
    transport::{TransferKind, TransferOutcome, TransferRequest, TransportError, UsbTransport},
};

/// The transfer object handed to `AsyncDevice::submit`/`reap_nowait` for
/// bulk and interrupt URBs. Boxing gives `StdBufTransfer` the stable address
/// `AsyncDevice` requires of its `R: DerefMut` transfer slots.
type AsyncTransfer = Box<StdBufTransfer<Vec<u8>>>;

pub struct UsbfsTransport {
    async_device: Mutex<AsyncDevice<AsyncTransfer>>,
}

impl UsbfsTransport {
    pub fn open(device: &Device) -> Result<Self, TransportError> {
        let handle = UsbfsDevice::from_busdev(device.bus_num, device.dev_num).map_err(|e| {
            TransportError::Other(format!(
                "opening bus {} dev {}: {e}",
                device.bus_num, device.dev_num
            ))
        })?;

        Ok(Self {
            async_device: Mutex::new(AsyncDevice::from(handle)),
        })
    }
}

impl UsbTransport for UsbfsTransport {
    fn transfer(&self, request: TransferRequest) -> Result<TransferOutcome, TransportError> {
        match request.kind {
            TransferKind::Control { setup } => self.control_transfer(&request, setup),
            TransferKind::Bulk => self.async_transfer(&request, StdBufTransfer::bulk),
            TransferKind::Interrupt => self.async_transfer(&request, StdBufTransfer::interrupt),
            TransferKind::Iso { .. } => Err(TransportError::Unsupported(
                "isochronous transfers are not implemented by this adapter",
            )),
        }
    }

    fn cancel(&self, _seqnum: u32) -> bool {
        false
    }
}

impl UsbfsTransport {
    fn control_transfer(
        &self,
        request: &TransferRequest,
        setup: [u8; 8],
    ) -> Result<TransferOutcome, TransportError> {
        let b_request = setup[1];
        let w_value = u16::from_le_bytes([setup[2], setup[3]]);
        let w_index = u16::from_le_bytes([setup[4], setup[5]]);
        let (setup_type, recipient) = decode_setup_type_and_recipient(setup[0]);
        let timeout_ms = request.timeout.as_millis().min(u32::MAX as u128) as u32;

        let guard = self.async_device.lock().unwrap();

        match request.direction {
            UrbDirection::In => {
                let mut buffer = vec![0u8; request.buffer_length as usize];

                let actual = guard
                    .device
                    .control_transfer_in(
                        setup_type,
                        recipient,
                        b_request,
                        w_value,
                        w_index,
                        Some(&mut buffer),
                        timeout_ms,
                    )
                    .map_err(map_io_error)?;

                buffer.truncate(actual as usize);
                Ok(outcome_in(buffer))
            }
            UrbDirection::Out => {
                let payload = request.out_data.clone().unwrap_or_default();

                let actual = guard
                    .device
                    .control_transfer_out(
                        setup_type,
                        recipient,
                        b_request,
                        w_value,
                        w_index,
                        Some(payload.as_slice()),
                        timeout_ms,
                    )
                    .map_err(map_io_error)?;

                Ok(outcome_out(actual as usize))
            }
        }
    }

    fn async_transfer(
        &self,
        request: &TransferRequest,
        make_transfer: fn(u8, UrbFlags, Vec<u8>) -> StdBufTransfer<Vec<u8>>,
    ) -> Result<TransferOutcome, TransportError> {
        let buffer = match request.direction {
            UrbDirection::In => vec![0u8; request.buffer_length as usize],
            UrbDirection::Out => request.out_data.clone().unwrap_or_default(),
        };

        let transfer: AsyncTransfer =
            Box::new(make_transfer(request.endpoint, UrbFlags::empty(), buffer));

        let mut guard = self.async_device.lock().unwrap();

        guard.submit(transfer).map_err(map_io_error)?;

        let mut completed = reap_within(&mut guard, request.timeout)?;

        let actual_length = completed
            .result_length()
            .map_err(|e| TransportError::Other(e.to_string()))?;

        Ok(match request.direction {
            UrbDirection::In => TransferOutcome {
                actual_length: actual_length as u32,
                data: completed.data_mut()[..actual_length].to_vec(),
                error_count: 0,
                start_frame: 0,
            },
            UrbDirection::Out => TransferOutcome {
                actual_length: actual_length as u32,
                data: Vec::new(),
                error_count: 0,
                start_frame: 0,
            },
        })
    }
}

/// Polls `reap_nowait` until a transfer completes or `timeout` elapses.
/// `usbfs::AsyncDevice::reap_wait` blocks with no timeout of its own, so a
/// stalled URB has to be bounded this way instead.
fn reap_within(
    device: &mut AsyncDevice<AsyncTransfer>,
    timeout: Duration,
) -> Result<AsyncTransfer, TransportError> {
    let deadline = Instant::now() + timeout;

    loop {
        match device.reap_nowait() {
            Ok(transfer) => return Ok(transfer),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(TransportError::Timeout);
                }
                thread::sleep(Duration::from_millis(5));
            }
            Err(e) => return Err(map_io_error(e)),
        }
    }
}

/// Decodes the `SetupType`/`SetupRecipient` half of `bmRequestType`. The
/// direction bit is deliberately ignored here: the SUBMIT PDU's explicit
/// `direction` field is authoritative over the wire, so the caller picks
/// `control_transfer_in` vs. `control_transfer_out` from `request.direction`
/// instead of decoding it back out of the setup packet.
fn decode_setup_type_and_recipient(bm_request_type: u8) -> (SetupType, SetupRecipient) {
    let setup_type = match (bm_request_type >> 5) & 0x3 {
        0 => SetupType::Standard,
        1 => SetupType::Class,
        _ => SetupType::Vendor,
    };

    let recipient = match bm_request_type & 0x1F {
        0 => SetupRecipient::Device,
        1 => SetupRecipient::Interface,
        2 => SetupRecipient::Endpoint,
        _ => SetupRecipient::Other,
    };

    (setup_type, recipient)
}

fn outcome_in(data: Vec<u8>) -> TransferOutcome {
    TransferOutcome {
        actual_length: data.len() as u32,
        data,
        error_count: 0,
        start_frame: 0,
    }
}

fn outcome_out(sent: usize) -> TransferOutcome {
    TransferOutcome {
        actual_length: sent as u32,
        data: Vec::new(),
        error_count: 0,
        start_frame: 0,
    }
}

fn map_io_error(err: io::Error) -> TransportError {
    use io::ErrorKind;

    match err.kind() {
        ErrorKind::TimedOut => TransportError::Timeout,
        ErrorKind::NotFound | ErrorKind::BrokenPipe => TransportError::DeviceGone,
        _ => TransportError::Other(err.to_string()),
    }
}

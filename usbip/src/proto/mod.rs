use endian_codec::{DecodeBE, EncodeBE, PackedSize};

use crate::proto::char_buf::CharBuf;

pub mod char_buf;

pub const USBIP_VERSION: u16 = 0x0111;

// implicitly packed due to layout, so we can avoid using `#[repr(packed)]`
#[derive(Debug, Clone, PackedSize, EncodeBE, DecodeBE)]
#[repr(C)]
pub struct OperationHeader {
    pub version: u16,
    pub code: u16,
    pub status: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u16)]
pub enum Direction {
    Request = 0x8000,
    Reply = 0x0000,
}

impl Direction {
    pub fn from_code(code: u16) -> Self {
        match code & 0x8000 {
            0 => Self::Reply,
            _ => Self::Request,
        }
    }
}

/// Core operations provided by the user-space server before the socket switched
/// into kernel space
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u16)]
pub enum OperationKind {
    /// Dummy Code
    Unspecified = 0x00,
    /// Retrieve USB device information. (still not used)
    ///
    /// NOT IMPLEMENTED IN ORIGINAL
    ///
    /// TODO: implement this :)
    DeviceInfo = 0x02,
    /// Import a remote USB device.
    Import = 0x03,
    /// Export a USB device to a remote host.
    ///
    /// NOT IMPLEMENTED IN ORIGINAL
    ///
    /// TODO: implement this :)
    Export = 0x06,
    /// un-Export a USB device from a remote host.
    ///
    /// NOT IMPLEMENTED IN ORIGINAL
    ///
    /// TODO: implement this :)
    UnExport = 0x07,
    /// Negotiate IPSec encryption key. (still not used)
    ///
    /// NOT IMPLEMENTED IN ORIGINAL
    ///
    /// TODO: can this be implemented without modifying the kernel modules?
    EncryptionKey = 0x04,
    /// Retrieve the list of exported USB devices.
    ListDevices = 0x05,
}

impl OperationKind {
    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code & 0x7FFF {
            0x00 => Self::Unspecified,
            0x02 => Self::DeviceInfo,
            0x03 => Self::Import,
            0x06 => Self::Export,
            0x07 => Self::UnExport,
            0x04 => Self::EncryptionKey,
            0x05 => Self::ListDevices,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OperationStatus {
    /// Request completed successfully
    Ok = 0x00,
    /// Request failed
    Failure = 0x01,
    /// Device requested for import is not available (already exported)
    DeviceBusy = 0x02,
    /// Device requested for import is in error state
    DeviceError = 0x03,
    /// Device requested does not exist on the host
    NoSuchDevice = 0x04,
    /// Some other opaque error
    Error = 0x05,
}

impl OperationStatus {
    pub fn from_raw(value: u32) -> Option<Self> {
        Some(match value {
            0x00 => Self::Ok,
            0x01 => Self::Failure,
            0x02 => Self::DeviceBusy,
            0x03 => Self::DeviceError,
            0x04 => Self::NoSuchDevice,
            0x05 => Self::Error,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, thiserror::Error)]
pub enum OperationError {
    #[error("request failed")]
    RequestFailed,
    #[error("device is already exported")]
    DeviceBusy,
    #[error("device is in error state")]
    DeviceError,
    #[error("device does not exist on the server")]
    NoSuchDevice,
    #[error("version in header did not match expected")]
    VersionMismatch,
    #[error("direction in header did not match expected")]
    DirectionMismatch,
    #[error("received PDU with invalid data")]
    InvalidData,
    #[error("some other error ocrrured")]
    Other,
}

#[derive(Debug, Clone, PackedSize, EncodeBE, DecodeBE)]
#[repr(C)]
pub struct ImportRequest {
    pub bus_id: CharBuf<SYSFS_BUS_ID_SIZE>,
}

/// Body of a vhci-side import reply, as consumed by the client-side
/// `usbip attach` path against a real (e.g. Linux kernel) `usbip` server.
/// The protocol-core server implemented in [`crate::dispatch`] does not use
/// this type; it encodes [`ExportedDevice`] directly per the framing table
/// in §4.3, since `OP_REP_IMPORT`'s status and device block are conditional
/// on each other in a way a single packed struct can't express.
#[derive(Debug, Clone, PackedSize, EncodeBE, DecodeBE)]
#[repr(C)]
pub struct ImportReply {
    pub usb_device: RawUsbDeviceInfo,
}

pub const SYSFS_PATH_MAX: usize = 256;
pub const SYSFS_BUS_ID_SIZE: usize = 32;

/// Wire representation of one exported device, exactly 312 bytes. Unlike
/// [`RawUsbDeviceInfo`] (which mirrors the kernel's richer internal
/// descriptor and is used by the vhci import/attach path) this layout omits
/// `bcdDevice` and carries a 2-byte reserved trailer instead, matching what
/// `OP_REP_DEVLIST`/`OP_REP_IMPORT` put on the wire.
#[derive(Debug, Clone, PackedSize, EncodeBE, DecodeBE)]
#[repr(C)]
pub struct ExportedDevice {
    pub path: CharBuf<SYSFS_PATH_MAX>,
    pub bus_id: CharBuf<SYSFS_BUS_ID_SIZE>,

    pub bus_num: u32,
    pub dev_num: u32,
    pub speed: u32,

    pub id_vendor: u16,
    pub id_product: u16,

    pub b_device_class: u8,
    pub b_device_sub_class: u8,
    pub b_device_protocol: u8,
    pub b_num_configurations: u8,
    pub b_configuration_value: u8,
    pub b_num_interfaces: u8,

    _reserved: u16,
}

impl ExportedDevice {
    pub fn new(
        path: &str,
        bus_id: &str,
        bus_num: u32,
        dev_num: u32,
        speed: u32,
        id_vendor: u16,
        id_product: u16,
        b_device_class: u8,
        b_device_sub_class: u8,
        b_device_protocol: u8,
        b_num_configurations: u8,
        b_configuration_value: u8,
        b_num_interfaces: u8,
    ) -> Option<Self> {
        Some(Self {
            path: CharBuf::new(path)?,
            bus_id: CharBuf::new(bus_id)?,
            bus_num,
            dev_num,
            speed,
            id_vendor,
            id_product,
            b_device_class,
            b_device_sub_class,
            b_device_protocol,
            b_num_configurations,
            b_configuration_value,
            b_num_interfaces,
            _reserved: 0,
        })
    }
}

#[derive(Debug, Clone, PackedSize, EncodeBE, DecodeBE)]
#[repr(C)]
pub struct RawUsbDeviceInfo {
    pub path: CharBuf<SYSFS_PATH_MAX>,
    pub bus_id: CharBuf<SYSFS_BUS_ID_SIZE>,

    pub bus_num: u32,
    pub dev_num: u32,
    pub speed: u32,

    pub id_vendor: u16,
    pub id_product: u16,
    pub bcd_device: u16,

    pub b_device_class: u8,
    pub b_device_sub_class: u8,
    pub b_device_protocol: u8,
    pub b_configuration_value: u8,
    pub b_num_configurations: u8,
    pub b_num_interfaces: u8,
}

#[derive(Debug, Clone, PackedSize, EncodeBE, DecodeBE)]
#[repr(C)]
pub struct UsbInterfaceInfo {
    pub b_interface_class: u8,
    pub b_interface_sub_class: u8,
    pub b_interface_protocol: u8,
    _padding: u8,
}

#[derive(Debug, Clone, PackedSize, EncodeBE, DecodeBE)]
#[repr(C)]
pub struct ListDevicesReply {
    pub num_devices: u32,
    _reserved: u32,
}

impl ListDevicesReply {
    pub fn new(num_devices: u32) -> Self {
        Self {
            num_devices,
            _reserved: 0,
        }
    }
}

/// Opcodes used once a connection has moved into the imported-device phase.
/// Distinct numeric space from [`OperationKind`], dispatched only after
/// import succeeds (see the connection state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u16)]
pub enum UrbCommand {
    Submit = 0x0001,
    RetSubmit = 0x0003,
    Unlink = 0x0002,
    RetUnlink = 0x0004,
}

impl UrbCommand {
    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            0x0001 => Self::Submit,
            0x0003 => Self::RetSubmit,
            0x0002 => Self::Unlink,
            0x0004 => Self::RetUnlink,
            _ => return None,
        })
    }
}

/// Direction of a URB transfer as carried explicitly on the wire. Distinct
/// from [`Direction`], which distinguishes request/reply framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum UrbDirection {
    Out = 0,
    In = 1,
}

impl UrbDirection {
    pub fn from_raw(value: u32) -> Option<Self> {
        Some(match value {
            0 => Self::Out,
            1 => Self::In,
            _ => return None,
        })
    }
}

/// Fixed 48-byte command block of a `CMD_SUBMIT` PDU, following the 8-byte
/// header. `setup` is always present and is only meaningful for control
/// endpoints. For OUT transfers, `buffer_length` bytes of payload follow this
/// struct on the wire; the dispatcher reads them separately since their
/// length isn't known until this struct is decoded.
#[derive(Debug, Clone, PackedSize, EncodeBE, DecodeBE)]
#[repr(C)]
pub struct SubmitRequest {
    pub seqnum: u32,
    pub devid: u32,
    pub direction: u32,
    pub ep: u32,
    pub transfer_flags: u32,
    pub buffer_length: u32,
    pub start_frame: u32,
    pub number_of_packets: u32,
    pub interval: u32,
    _reserved: u32,
    pub setup: [u8; 8],
}

impl SubmitRequest {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        seqnum: u32,
        devid: u32,
        direction: u32,
        ep: u32,
        transfer_flags: u32,
        buffer_length: u32,
        start_frame: u32,
        number_of_packets: u32,
        interval: u32,
        setup: [u8; 8],
    ) -> Self {
        Self {
            seqnum,
            devid,
            direction,
            ep,
            transfer_flags,
            buffer_length,
            start_frame,
            number_of_packets,
            interval,
            _reserved: 0,
            setup,
        }
    }
}

/// Fixed 48-byte command block of a `RET_SUBMIT` PDU. For IN transfers,
/// `actual_length` bytes of payload follow this struct on the wire.
#[derive(Debug, Clone, PackedSize, EncodeBE, DecodeBE)]
#[repr(C)]
pub struct SubmitReply {
    pub seqnum: u32,
    pub devid: u32,
    pub direction: u32,
    pub ep: u32,
    pub status: i32,
    pub actual_length: u32,
    pub start_frame: u32,
    pub number_of_packets: u32,
    pub error_count: u32,
    _reserved_a: u32,
    _reserved_b: u64,
}

impl SubmitReply {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        seqnum: u32,
        devid: u32,
        direction: u32,
        ep: u32,
        status: i32,
        actual_length: u32,
        start_frame: u32,
        number_of_packets: u32,
        error_count: u32,
    ) -> Self {
        Self {
            seqnum,
            devid,
            direction,
            ep,
            status,
            actual_length,
            start_frame,
            number_of_packets,
            error_count,
            _reserved_a: 0,
            _reserved_b: 0,
        }
    }
}

/// 28-byte command block of a `CMD_UNLINK` PDU (named fields plus 8 bytes of
/// reserved padding, matching the dispatcher's framing table).
#[derive(Debug, Clone, PackedSize, EncodeBE, DecodeBE)]
#[repr(C)]
pub struct UnlinkRequest {
    pub seqnum: u32,
    pub unlink_seqnum: u32,
    pub devid: u32,
    pub direction: u32,
    pub ep: u32,
    _reserved_a: u32,
    _reserved_b: u32,
}

impl UnlinkRequest {
    pub fn new(seqnum: u32, unlink_seqnum: u32, devid: u32, direction: u32, ep: u32) -> Self {
        Self {
            seqnum,
            unlink_seqnum,
            devid,
            direction,
            ep,
            _reserved_a: 0,
            _reserved_b: 0,
        }
    }
}

/// 28-byte command block of a `RET_UNLINK` PDU.
#[derive(Debug, Clone, PackedSize, EncodeBE, DecodeBE)]
#[repr(C)]
pub struct UnlinkReply {
    pub seqnum: u32,
    pub unlink_seqnum: u32,
    pub devid: u32,
    pub direction: u32,
    pub ep: u32,
    pub status: i32,
    _reserved: u32,
}

impl UnlinkReply {
    pub fn new(seqnum: u32, unlink_seqnum: u32, devid: u32, direction: u32, ep: u32, status: i32) -> Self {
        Self {
            seqnum,
            unlink_seqnum,
            devid,
            direction,
            ep,
            status,
            _reserved: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use endian_codec::{DecodeBE, EncodeBE, PackedSize};

    use super::*;

    #[test]
    fn exported_device_is_312_bytes() {
        assert_eq!(ExportedDevice::PACKED_LEN, 312);
    }

    #[test]
    fn list_devices_reply_round_trips_with_reserved_pad() {
        let reply = ListDevicesReply::new(3);
        let mut buf = vec![0u8; ListDevicesReply::PACKED_LEN];
        reply.encode_as_be_bytes(&mut buf);

        assert_eq!(ListDevicesReply::PACKED_LEN, 8);
        assert_eq!(&buf[0..4], &3u32.to_be_bytes());
        assert_eq!(&buf[4..8], &[0, 0, 0, 0]);

        let decoded = ListDevicesReply::decode_from_be_bytes(&buf);
        assert_eq!(decoded.num_devices, 3);
    }

    #[test]
    fn submit_request_is_48_bytes() {
        assert_eq!(SubmitRequest::PACKED_LEN, 48);
    }

    #[test]
    fn submit_reply_is_48_bytes() {
        assert_eq!(SubmitReply::PACKED_LEN, 48);
    }

    #[test]
    fn unlink_request_is_28_bytes() {
        assert_eq!(UnlinkRequest::PACKED_LEN, 28);
    }

    #[test]
    fn unlink_reply_is_28_bytes() {
        assert_eq!(UnlinkReply::PACKED_LEN, 28);
    }

    #[test]
    fn submit_reply_preserves_negative_status_bit_pattern() {
        let reply = SubmitReply::new(1, 1, 1, 0, -22, 0, 0, 0, 0);
        let mut buf = vec![0u8; SubmitReply::PACKED_LEN];
        reply.encode_as_be_bytes(&mut buf);

        let status_bytes = &buf[12..16];
        assert_eq!(i32::from_be_bytes(status_bytes.try_into().unwrap()), -22);

        let decoded = SubmitReply::decode_from_be_bytes(&buf);
        assert_eq!(decoded.status, -22);
    }

    #[test]
    fn exported_device_encodes_busid_as_nul_terminated_ascii() {
        let device = ExportedDevice::new(
            "/sys/devices/1-1", "1-1", 1, 1, 1, 0x05ac, 0x030d, 0x03, 0x01, 0x02, 1, 1, 1,
        )
        .unwrap();

        let mut buf = vec![0u8; ExportedDevice::PACKED_LEN];
        device.encode_as_be_bytes(&mut buf);

        assert_eq!(&buf[256..260], b"1-1\0");
        assert_eq!(&buf[300..302], &0x05acu16.to_be_bytes());
        assert_eq!(&buf[302..304], &0x030du16.to_be_bytes());
    }
}

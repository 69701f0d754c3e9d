//! The connection state machine (§4.2) and request dispatcher (§4.3): owns
//! one accepted TCP connection from its first PDU through teardown.

use std::{
    io,
    net::{SocketAddr, TcpListener, TcpStream},
    sync::{Arc, mpsc},
    thread,
    time::Duration,
};

use endian_codec::{DecodeBE, EncodeBE, PackedSize};

use crate::{
    config::ServerConfig,
    directory::{ClaimHandle, ClaimRegistry, Device, DeviceDirectory},
    errno,
    net::UsbIpSocket,
    proto::{
        Direction, ExportedDevice, ImportRequest, ListDevicesReply, OperationHeader,
        OperationKind, OperationStatus, SubmitRequest, UnlinkRequest, UrbCommand, USBIP_VERSION,
        char_buf::CharBuf,
    },
    registry::UrbRegistry,
    submit::SubmitProcessor,
    transport::UsbTransport,
    unlink::UnlinkProcessor,
};

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// State held for the lifetime of the `Imported(device)` connection state.
struct ImportedContext {
    device: Device,
    claim: Box<dyn ClaimHandle>,
    transport: Arc<dyn UsbTransport>,
    registry: Arc<UrbRegistry>,
    /// Shared so each SUBMIT can be handed off to its own worker thread
    /// without blocking the connection's reader from servicing a racing
    /// UNLINK (§5 Concurrency & Resource Model).
    submit: Arc<SubmitProcessor>,
    unlink: UnlinkProcessor,
}

enum ConnectionState {
    Ready,
    Imported(ImportedContext),
}

/// Binds `config.port` and spawns a thread per accepted connection. Each
/// connection is independent; there is no shared mutable state beyond the
/// process-wide `directory`/`claims` collaborators, which must themselves be
/// concurrency-safe.
pub fn serve(
    directory: Arc<dyn DeviceDirectory>,
    claims: Arc<dyn ClaimRegistry>,
    config: ServerConfig,
) -> io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)?;

    tracing::info!(%addr, "usbip server listening");

    for incoming in listener.incoming() {
        let stream = match incoming {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(%err, "failed to accept connection");
                continue;
            }
        };

        let peer = stream.peer_addr().ok();
        let directory = directory.clone();
        let claims = claims.clone();
        let config = config.clone();

        thread::spawn(move || {
            tracing::debug!(?peer, "connection accepted");

            if let Err(err) = handle_connection(stream, directory, claims, &config) {
                tracing::warn!(?peer, %err, "connection terminated with an error");
            } else {
                tracing::debug!(?peer, "connection closed");
            }
        });
    }

    Ok(())
}

fn handle_connection(
    stream: TcpStream,
    directory: Arc<dyn DeviceDirectory>,
    claims: Arc<dyn ClaimRegistry>,
    config: &ServerConfig,
) -> Result<(), ConnectionError> {
    let mut socket = UsbIpSocket::from(stream);
    let writer_socket = socket.try_clone()?;
    let (tx, rx) = mpsc::channel::<Vec<u8>>();
    let writer_handle = thread::spawn(move || writer_loop(writer_socket, rx));

    let mut state = ConnectionState::Ready;

    let result = run_connection(&mut socket, directory, claims, config, &mut state, &tx);

    // Terminating (§4.2): cancel all in-flight URBs, release the claim.
    if let ConnectionState::Imported(ctx) = state {
        let drained = ctx.registry.drain_all();
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "cancelling in-flight URBs on teardown");
        }
        for record in drained {
            ctx.transport.cancel(record.seqnum);
        }
        claims.release(ctx.claim);
    }

    drop(tx);
    let _ = writer_handle.join();

    result
}

fn run_connection(
    socket: &mut UsbIpSocket,
    directory: Arc<dyn DeviceDirectory>,
    claims: Arc<dyn ClaimRegistry>,
    config: &ServerConfig,
    state: &mut ConnectionState,
    tx: &mpsc::Sender<Vec<u8>>,
) -> Result<(), ConnectionError> {
    loop {
        let header = match socket.recv_request_header() {
            Ok(header) => header,
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        if header.version != USBIP_VERSION {
            return Err(ConnectionError::Protocol(format!(
                "unsupported protocol version 0x{:04x}",
                header.version
            )));
        }

        match state {
            ConnectionState::Ready => {
                handle_ready_phase(socket, header, &directory, &claims, config, state)?;
            }
            ConnectionState::Imported(ctx) => {
                handle_imported_phase(socket, header, ctx, tx)?;
            }
        }
    }
}

fn handle_ready_phase(
    socket: &mut UsbIpSocket,
    header: OperationHeader,
    directory: &Arc<dyn DeviceDirectory>,
    claims: &Arc<dyn ClaimRegistry>,
    config: &ServerConfig,
    state: &mut ConnectionState,
) -> Result<(), ConnectionError> {
    if Direction::from_code(header.code) != Direction::Request {
        return Err(ConnectionError::Protocol("expected a request PDU in Ready phase".into()));
    }

    if UrbCommand::from_code(header.code).is_some() {
        return Err(ConnectionError::Protocol("URB opcode received before import".into()));
    }

    match OperationKind::from_code(header.code) {
        Some(OperationKind::ListDevices) => handle_devlist(socket, directory, config),
        Some(OperationKind::Import) => handle_import(socket, directory, claims, config, state),
        other => Err(ConnectionError::Protocol(format!(
            "unexpected opcode {other:?} in Ready phase"
        ))),
    }
}

fn handle_devlist(
    socket: &mut UsbIpSocket,
    directory: &Arc<dyn DeviceDirectory>,
    config: &ServerConfig,
) -> Result<(), ConnectionError> {
    let devices = directory
        .list()
        .map_err(|err| ConnectionError::Protocol(format!("enumeration failed: {err}")))?;

    let exported: Vec<ExportedDevice> = devices
        .into_iter()
        .filter(|d| config.is_bus_id_allowed(&d.bus_id))
        .filter_map(|d| d.to_wire())
        .collect();

    socket.send_response_header(OperationKind::ListDevices, OperationStatus::Ok)?;
    socket.send_encoded(ListDevicesReply::new(exported.len() as u32))?;

    for device in exported {
        socket.send_encoded(device)?;
    }

    Ok(())
}

fn handle_import(
    socket: &mut UsbIpSocket,
    directory: &Arc<dyn DeviceDirectory>,
    claims: &Arc<dyn ClaimRegistry>,
    config: &ServerConfig,
    state: &mut ConnectionState,
) -> Result<(), ConnectionError> {
    let request = socket.recv_encoded::<ImportRequest>()?;
    let bus_id = request
        .bus_id
        .as_c_str()
        .and_then(|c| c.to_str().ok())
        .ok_or_else(|| ConnectionError::Protocol("busid is not valid ASCII".into()))?
        .to_string();

    let device = if config.is_bus_id_allowed(&bus_id) {
        directory
            .lookup(&bus_id)
            .map_err(|err| ConnectionError::Protocol(format!("lookup failed: {err}")))?
    } else {
        None
    };

    let claimed = device.and_then(|device| match claims.claim(device.clone()) {
        Ok(handle) => Some((device, handle)),
        Err(err) => {
            tracing::debug!(%bus_id, %err, "claim denied");
            None
        }
    });

    match claimed {
        Some((device, claim)) => {
            let wire = device
                .to_wire()
                .ok_or_else(|| ConnectionError::Protocol("device fields do not fit the wire format".into()))?;

            socket.send_response_header(OperationKind::Import, OperationStatus::Ok)?;
            socket.send_encoded(0u32)?; // dedicated OP_REP_IMPORT status, success
            socket.send_encoded(wire)?;

            tracing::info!(bus_id = %device.bus_id, "device imported");

            let transport = claim.transport();
            let registry = UrbRegistry::new();

            *state = ConnectionState::Imported(ImportedContext {
                submit: Arc::new(SubmitProcessor::new(
                    registry.clone(),
                    transport.clone(),
                    config.max_concurrent_urbs,
                    Duration::from_millis(config.default_urb_timeout_ms),
                )),
                unlink: UnlinkProcessor::new(registry.clone(), transport.clone()),
                device,
                claim,
                transport,
                registry,
            });

            Ok(())
        }
        None => {
            socket.send_response_header(OperationKind::Import, OperationStatus::Ok)?;
            socket.send_encoded(1u32)?; // dedicated OP_REP_IMPORT status, failure
            Ok(())
        }
    }
}

fn handle_imported_phase(
    socket: &mut UsbIpSocket,
    header: OperationHeader,
    ctx: &mut ImportedContext,
    tx: &mpsc::Sender<Vec<u8>>,
) -> Result<(), ConnectionError> {
    match UrbCommand::from_code(header.code) {
        Some(UrbCommand::Submit) => handle_submit(socket, ctx, tx),
        Some(UrbCommand::Unlink) => handle_unlink(socket, ctx, tx),
        _ => Err(ConnectionError::Protocol(format!(
            "unexpected opcode 0x{:04x} in Imported phase",
            header.code
        ))),
    }
}

fn handle_submit(
    socket: &mut UsbIpSocket,
    ctx: &mut ImportedContext,
    tx: &mpsc::Sender<Vec<u8>>,
) -> Result<(), ConnectionError> {
    let request = socket.recv_encoded::<SubmitRequest>()?;

    let out_payload = if request.direction == 0 {
        socket.recv_payload(request.buffer_length as usize)?
    } else {
        Vec::new()
    };

    // Handed off to its own thread so the transport call below can't stall
    // this connection's reader from noticing a racing UNLINK for the same
    // or another seqnum (§5 Concurrency & Resource Model). Admission back-
    // pressure is enforced inside `SubmitProcessor::process` itself, so an
    // unbounded number of these threads can be outstanding without
    // exceeding `max_concurrent_urbs` in-flight URBs.
    let submit = ctx.submit.clone();
    let tx = tx.clone();

    thread::spawn(move || {
        let seqnum = request.seqnum;
        let devid = request.devid;
        let direction = request.direction;
        let ep = request.ep;
        let number_of_packets = request.number_of_packets;

        let reply_bytes = match submit.process(request, out_payload) {
            Ok(outcome) => encode_submit_reply(outcome.reply, outcome.payload),
            Err(err) => {
                let status = match err {
                    crate::submit::SubmitError::InvalidDirection
                    | crate::submit::SubmitError::InvalidEndpoint(_)
                    | crate::submit::SubmitError::PayloadLengthMismatch => errno::EINVAL,
                    crate::submit::SubmitError::Duplicate(_) => errno::EEXIST,
                    crate::submit::SubmitError::Admission => errno::EAGAIN,
                };

                let reply = crate::proto::SubmitReply::new(
                    seqnum, devid, direction, ep, status, 0, 0, number_of_packets, 0,
                );
                encode_submit_reply(reply, Vec::new())
            }
        };

        // Removed only once the reply bytes have been handed to the
        // single-writer queue, matching §4.4's "remove after the reply is
        // fully written" rule closely enough for a connection-scoped
        // registry.
        submit.registry().remove(seqnum);

        let _ = tx.send(reply_bytes);
    });

    Ok(())
}

fn handle_unlink(
    socket: &mut UsbIpSocket,
    ctx: &mut ImportedContext,
    tx: &mpsc::Sender<Vec<u8>>,
) -> Result<(), ConnectionError> {
    let request = socket.recv_encoded::<UnlinkRequest>()?;

    let reply = match ctx.unlink.process(request) {
        Ok(reply) => reply,
        Err(err) => {
            return Err(ConnectionError::Protocol(format!("invalid UNLINK: {err}")));
        }
    };

    let header = OperationHeader {
        version: USBIP_VERSION,
        code: UrbCommand::RetUnlink as u16,
        status: OperationStatus::Ok as u32,
    };

    let mut bytes = vec![0u8; OperationHeader::PACKED_LEN + reply.packed_len()];
    header.encode_as_be_bytes(&mut bytes[..OperationHeader::PACKED_LEN]);
    reply.encode_as_be_bytes(&mut bytes[OperationHeader::PACKED_LEN..]);

    tx.send(bytes).map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;

    Ok(())
}

/// `RET_SUBMIT`'s reply block has a fixed size regardless of direction; only
/// the trailing IN payload varies, hence this free function instead of a
/// `PackedSize` impl that would have to special-case it.
fn encode_submit_reply(reply: crate::proto::SubmitReply, payload: Vec<u8>) -> Vec<u8> {
    let header = OperationHeader {
        version: USBIP_VERSION,
        code: UrbCommand::RetSubmit as u16,
        status: OperationStatus::Ok as u32,
    };

    let reply_len = reply.packed_len();
    let mut bytes = vec![0u8; OperationHeader::PACKED_LEN + reply_len + payload.len()];
    header.encode_as_be_bytes(&mut bytes[..OperationHeader::PACKED_LEN]);
    reply.encode_as_be_bytes(&mut bytes[OperationHeader::PACKED_LEN..OperationHeader::PACKED_LEN + reply_len]);
    bytes[OperationHeader::PACKED_LEN + reply_len..].copy_from_slice(&payload);

    bytes
}

/// Drains pre-encoded reply PDUs and writes them to the socket one at a
/// time, serializing writes from every worker producing a SUBMIT/UNLINK
/// reply concurrently (§5 Concurrency & Resource Model).
fn writer_loop(mut socket: UsbIpSocket, rx: mpsc::Receiver<Vec<u8>>) {
    while let Ok(bytes) = rx.recv() {
        if let Err(err) = socket.send(&bytes) {
            tracing::debug!(%err, "writer thread exiting after a send failure");
            break;
        }
    }
}

trait PackedLenExt {
    fn packed_len(&self) -> usize;
}

impl<T: PackedSize> PackedLenExt for T {
    fn packed_len(&self) -> usize {
        T::PACKED_LEN
    }
}

#[cfg(test)]
mod tests {
    use std::net::{TcpListener, TcpStream};

    use super::*;
    use crate::{
        directory::{ClaimError, DirectoryError},
        proto::{SubmitReply, UnlinkReply, UrbDirection},
        transport::{TransferOutcome, TransferRequest, TransportError},
    };

    fn test_device(bus_id: &str) -> Device {
        Device {
            bus_id: bus_id.to_string(),
            bus_num: 1,
            dev_num: 1,
            vendor_id: 0x05ac,
            product_id: 0x030d,
            b_device_class: 0x03,
            b_device_sub_class: 0x01,
            b_device_protocol: 0x02,
            b_num_configurations: 1,
            b_configuration_value: 1,
            b_num_interfaces: 1,
            speed: crate::UsbSpeed::Low,
            sys_path: format!("/sys/devices/{bus_id}"),
            product: None,
            manufacturer: None,
            serial: None,
        }
    }

    struct FakeDirectory {
        devices: Vec<Device>,
    }

    impl DeviceDirectory for FakeDirectory {
        fn list(&self) -> Result<Vec<Device>, DirectoryError> {
            Ok(self.devices.clone())
        }

        fn lookup(&self, bus_id: &str) -> Result<Option<Device>, DirectoryError> {
            Ok(self.devices.iter().find(|d| d.bus_id == bus_id).cloned())
        }
    }

    /// An `UsbTransport` that always completes a control IN with a canned
    /// 18-byte device descriptor, and stalls forever on anything else so S6
    /// can race an UNLINK against a still-pending bulk transfer.
    struct FakeTransport;

    impl UsbTransport for FakeTransport {
        fn transfer(&self, request: TransferRequest) -> Result<TransferOutcome, TransportError> {
            match request.direction {
                UrbDirection::In if request.endpoint == 0 => Ok(TransferOutcome {
                    actual_length: 18,
                    data: vec![0xAAu8; 18],
                    error_count: 0,
                    start_frame: 0,
                }),
                _ => {
                    std::thread::sleep(Duration::from_millis(200));
                    Ok(TransferOutcome::default())
                }
            }
        }

        fn cancel(&self, _seqnum: u32) -> bool {
            true
        }
    }

    struct FakeClaimHandle {
        device: Device,
    }

    impl ClaimHandle for FakeClaimHandle {
        fn device(&self) -> &Device {
            &self.device
        }

        fn transport(&self) -> Arc<dyn UsbTransport> {
            Arc::new(FakeTransport)
        }
    }

    struct FakeClaims;

    impl ClaimRegistry for FakeClaims {
        fn claim(&self, device: Device) -> Result<Box<dyn ClaimHandle>, ClaimError> {
            Ok(Box::new(FakeClaimHandle { device }))
        }

        fn release(&self, _handle: Box<dyn ClaimHandle>) {}

        fn is_claimed(&self, _device_id: u32) -> bool {
            false
        }
    }

    /// Spawns a `handle_connection` against one end of a loopback TCP pair
    /// and hands back the other end, already wrapped as the client's socket.
    fn spawn_connection(devices: Vec<Device>) -> UsbIpSocket {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let directory: Arc<dyn DeviceDirectory> = Arc::new(FakeDirectory { devices });
        let claims: Arc<dyn ClaimRegistry> = Arc::new(FakeClaims);
        let config = ServerConfig::default();

        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let _ = handle_connection(stream, directory, claims, &config);
        });

        UsbIpSocket::from(TcpStream::connect(addr).unwrap())
    }

    #[test]
    fn s1_devlist_on_empty_server() {
        let mut client = spawn_connection(Vec::new());

        client.send_request_header(OperationKind::ListDevices).unwrap();

        let header = client.recv_request_header().unwrap();
        assert_eq!(header.code, Direction::Reply as u16 | OperationKind::ListDevices as u16);
        assert_eq!(header.status, OperationStatus::Ok as u32);

        let reply = client.recv_encoded::<ListDevicesReply>().unwrap();
        assert_eq!(reply.num_devices, 0);
    }

    #[test]
    fn s2_devlist_with_one_device() {
        let mut client = spawn_connection(vec![test_device("1-1")]);

        client.send_request_header(OperationKind::ListDevices).unwrap();

        client.recv_request_header().unwrap();
        let reply = client.recv_encoded::<ListDevicesReply>().unwrap();
        assert_eq!(reply.num_devices, 1);

        let device = client.recv_encoded::<ExportedDevice>().unwrap();
        assert_eq!(device.bus_id.as_c_str().unwrap().to_str().unwrap(), "1-1");
        assert_eq!(device.id_vendor, 0x05ac);
        assert_eq!(device.id_product, 0x030d);
    }

    fn send_import(client: &mut UsbIpSocket, bus_id: &str) {
        client.send_request_header(OperationKind::Import).unwrap();
        client
            .send_encoded(ImportRequest {
                bus_id: CharBuf::new(bus_id).unwrap(),
            })
            .unwrap();
    }

    #[test]
    fn s3_import_success() {
        let mut client = spawn_connection(vec![test_device("1-1")]);

        send_import(&mut client, "1-1");

        let header = client.recv_request_header().unwrap();
        assert_eq!(header.code, Direction::Reply as u16 | OperationKind::Import as u16);

        let status = client.recv_encoded::<u32>().unwrap();
        assert_eq!(status, 0);

        let device = client.recv_encoded::<ExportedDevice>().unwrap();
        assert_eq!(device.bus_id.as_c_str().unwrap().to_str().unwrap(), "1-1");
    }

    #[test]
    fn s4_import_unknown_busid() {
        let mut client = spawn_connection(vec![test_device("1-1")]);

        send_import(&mut client, "9-9");

        client.recv_request_header().unwrap();
        let status = client.recv_encoded::<u32>().unwrap();
        assert_eq!(status, 1);
    }

    #[test]
    fn s5_submit_control_in_get_descriptor() {
        let mut client = spawn_connection(vec![test_device("1-1")]);

        send_import(&mut client, "1-1");
        client.recv_request_header().unwrap();
        client.recv_encoded::<u32>().unwrap();
        client.recv_encoded::<ExportedDevice>().unwrap();

        let header = OperationHeader {
            version: USBIP_VERSION,
            code: UrbCommand::Submit as u16,
            status: 0,
        };
        let mut bytes = vec![0u8; OperationHeader::PACKED_LEN + SubmitRequest::PACKED_LEN];
        header.encode_as_be_bytes(&mut bytes[..OperationHeader::PACKED_LEN]);
        SubmitRequest::new(
            1,
            0x0001_0001,
            1,
            0,
            0,
            18,
            0,
            0,
            0,
            [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00],
        )
        .encode_as_be_bytes(&mut bytes[OperationHeader::PACKED_LEN..]);
        client.send(&bytes).unwrap();

        let reply_header = client.recv_request_header().unwrap();
        assert_eq!(reply_header.code, UrbCommand::RetSubmit as u16);

        let reply = client.recv_encoded::<SubmitReply>().unwrap();
        assert_eq!(reply.seqnum, 1);
        assert_eq!(reply.status, 0);
        assert_eq!(reply.actual_length, 18);

        let payload = client.recv_payload(18).unwrap();
        assert_eq!(payload.len(), 18);
    }

    #[test]
    fn s6_submit_then_unlink_before_completion() {
        let mut client = spawn_connection(vec![test_device("1-1")]);

        send_import(&mut client, "1-1");
        client.recv_request_header().unwrap();
        client.recv_encoded::<u32>().unwrap();
        client.recv_encoded::<ExportedDevice>().unwrap();

        let header = OperationHeader {
            version: USBIP_VERSION,
            code: UrbCommand::Submit as u16,
            status: 0,
        };
        let mut bytes = vec![0u8; OperationHeader::PACKED_LEN + SubmitRequest::PACKED_LEN];
        header.encode_as_be_bytes(&mut bytes[..OperationHeader::PACKED_LEN]);
        SubmitRequest::new(7, 0x0001_0001, 1, 1, 0, 512, 0, 0, 0, [0; 8])
            .encode_as_be_bytes(&mut bytes[OperationHeader::PACKED_LEN..]);
        client.send(&bytes).unwrap();

        // Give the SUBMIT a moment to be admitted into the registry before
        // racing the UNLINK against it.
        std::thread::sleep(Duration::from_millis(20));

        let unlink_header = OperationHeader {
            version: USBIP_VERSION,
            code: UrbCommand::Unlink as u16,
            status: 0,
        };
        let mut unlink_bytes = vec![0u8; OperationHeader::PACKED_LEN + UnlinkRequest::PACKED_LEN];
        unlink_header.encode_as_be_bytes(&mut unlink_bytes[..OperationHeader::PACKED_LEN]);
        UnlinkRequest::new(8, 7, 0x0001_0001, 1, 1)
            .encode_as_be_bytes(&mut unlink_bytes[OperationHeader::PACKED_LEN..]);
        client.send(&unlink_bytes).unwrap();

        // Two replies arrive, in either order; exactly one RET_UNLINK and
        // exactly one RET_SUBMIT for these seqnums, and nothing else.
        let mut saw_unlink = false;
        let mut saw_submit = false;

        for _ in 0..2 {
            let reply_header = client.recv_request_header().unwrap();
            match UrbCommand::from_code(reply_header.code) {
                Some(UrbCommand::RetUnlink) => {
                    let reply = client.recv_encoded::<UnlinkReply>().unwrap();
                    assert_eq!(reply.seqnum, 8);
                    assert_eq!(reply.unlink_seqnum, 7);
                    assert!(reply.status == 0 || reply.status == errno::ENOENT);
                    saw_unlink = true;
                }
                Some(UrbCommand::RetSubmit) => {
                    let reply = client.recv_encoded::<SubmitReply>().unwrap();
                    assert_eq!(reply.seqnum, 7);
                    if reply.status == 0 {
                        client.recv_payload(reply.actual_length as usize).unwrap();
                    } else {
                        assert_eq!(reply.status, errno::CANCELLED);
                    }
                    saw_submit = true;
                }
                other => panic!("unexpected reply opcode {other:?}"),
            }
        }

        assert!(saw_unlink && saw_submit);
    }
}

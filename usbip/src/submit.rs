//! The URB submit processor (§4.4): validates `CMD_SUBMIT`, drives the
//! transfer through a [`UsbTransport`], and builds the `RET_SUBMIT` reply.

use std::{sync::Arc, time::Duration};

use crate::{
    errno,
    proto::{SubmitReply, SubmitRequest, UrbDirection},
    registry::{UrbRecord, UrbRegistry, UrbStatus},
    transport::{TransferKind, TransferRequest, UsbTransport},
};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("direction must be 0 (out) or 1 (in)")]
    InvalidDirection,
    #[error("endpoint address {0} exceeds 0xFF")]
    InvalidEndpoint(u32),
    #[error("OUT payload length does not match bufferLength")]
    PayloadLengthMismatch,
    #[error("seqnum {0} is already registered")]
    Duplicate(u32),
    #[error("registry is at capacity")]
    Admission,
}

/// A fully processed SUBMIT: the reply PDU plus any IN payload to append
/// after it on the wire.
pub struct SubmitOutcome {
    pub reply: SubmitReply,
    pub payload: Vec<u8>,
}

pub struct SubmitProcessor {
    registry: Arc<UrbRegistry>,
    transport: Arc<dyn UsbTransport>,
    max_concurrent: u32,
    default_timeout: Duration,
}

impl SubmitProcessor {
    pub fn new(
        registry: Arc<UrbRegistry>,
        transport: Arc<dyn UsbTransport>,
        max_concurrent: u32,
        default_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            transport,
            max_concurrent,
            default_timeout,
        }
    }

    fn validate(req: &SubmitRequest, out_payload_len: usize) -> Result<UrbDirection, SubmitError> {
        let direction = UrbDirection::from_raw(req.direction).ok_or(SubmitError::InvalidDirection)?;

        if req.ep > 0xFF {
            return Err(SubmitError::InvalidEndpoint(req.ep));
        }

        if direction == UrbDirection::Out && out_payload_len as u32 != req.buffer_length {
            return Err(SubmitError::PayloadLengthMismatch);
        }

        Ok(direction)
    }

    fn classify(ep: u32, number_of_packets: u32, setup: [u8; 8]) -> TransferKind {
        let ep_num = ep & 0x7F;

        if ep_num == 0 {
            TransferKind::Control { setup }
        } else if number_of_packets > 0 {
            TransferKind::Iso {
                start_frame: 0,
                num_packets: number_of_packets,
            }
        } else {
            // The transport may reclassify this as interrupt if it can
            // consult the endpoint descriptor; the PDU alone can't tell us.
            TransferKind::Bulk
        }
    }

    /// Validates and admits a SUBMIT, executes the transfer, and returns the
    /// reply to send. The caller (the dispatcher) is responsible for writing
    /// the reply to the socket and only then removing the URB from the
    /// registry via `registry()`.
    pub fn process(&self, req: SubmitRequest, out_payload: Vec<u8>) -> Result<SubmitOutcome, SubmitError> {
        let direction = Self::validate(&req, out_payload.len())?;

        if self.registry.contains(req.seqnum) {
            return Err(SubmitError::Duplicate(req.seqnum));
        }

        if self.registry.count() as u32 >= self.max_concurrent {
            return Err(SubmitError::Admission);
        }

        let kind = Self::classify(req.ep, req.number_of_packets, req.setup);
        let endpoint = (req.ep & 0xFF) as u8;

        let record = UrbRecord::new(req.seqnum, req.devid, direction, endpoint, &kind, req.buffer_length);
        self.registry
            .insert(record)
            .map_err(|dup| SubmitError::Duplicate(dup.0))?;
        self.registry.update_status(req.seqnum, UrbStatus::InProgress);

        let transfer_request = TransferRequest {
            kind,
            direction,
            endpoint,
            buffer_length: req.buffer_length,
            out_data: matches!(direction, UrbDirection::Out).then_some(out_payload),
            timeout: self.default_timeout,
        };

        let result = self.transport.transfer(transfer_request);

        // A racing UNLINK may have flipped our status to `cancelled` while
        // the transfer above was in flight. Whichever event actually won
        // determines the reply; see §5 Concurrency & Resource Model.
        let already_cancelled = matches!(
            self.registry.get(req.seqnum).map(|r| r.status),
            Some(UrbStatus::Cancelled)
        );

        let (status, actual_length, data, error_count, start_frame) = if already_cancelled {
            (errno::CANCELLED, 0, Vec::new(), 0, 0)
        } else {
            match result {
                Ok(outcome) => (
                    0,
                    outcome.actual_length,
                    outcome.data,
                    outcome.error_count,
                    outcome.start_frame,
                ),
                Err(err) => (errno::transport_error_to_status(&err), 0, Vec::new(), 0, 0),
            }
        };

        let reply = SubmitReply::new(
            req.seqnum,
            req.devid,
            req.direction,
            req.ep,
            status,
            actual_length,
            start_frame,
            req.number_of_packets,
            error_count,
        );

        Ok(SubmitOutcome { reply, payload: data })
    }

    pub fn registry(&self) -> &Arc<UrbRegistry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{TransferOutcome, TransportError};

    struct FakeTransport {
        response: Result<TransferOutcome, ()>,
    }

    impl UsbTransport for FakeTransport {
        fn transfer(&self, _request: TransferRequest) -> Result<TransferOutcome, TransportError> {
            match &self.response {
                Ok(outcome) => Ok(outcome.clone()),
                Err(()) => Err(TransportError::Stalled),
            }
        }
    }

    fn control_in_request(seqnum: u32) -> SubmitRequest {
        SubmitRequest::new(
            seqnum,
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
    }

    #[test]
    fn control_in_descriptor_read_completes_successfully() {
        let transport = Arc::new(FakeTransport {
            response: Ok(TransferOutcome {
                actual_length: 18,
                data: vec![0u8; 18],
                error_count: 0,
                start_frame: 0,
            }),
        });
        let processor = SubmitProcessor::new(UrbRegistry::new(), transport, 64, Duration::from_secs(5));

        let outcome = processor.process(control_in_request(1), Vec::new()).unwrap();

        assert_eq!(outcome.reply.seqnum, 1);
        assert_eq!(outcome.reply.status, 0);
        assert_eq!(outcome.reply.actual_length, 18);
        assert_eq!(outcome.payload.len(), 18);
    }

    #[test]
    fn duplicate_seqnum_is_rejected_without_touching_the_registry() {
        let transport = Arc::new(FakeTransport {
            response: Ok(TransferOutcome::default()),
        });
        let processor = SubmitProcessor::new(UrbRegistry::new(), transport, 64, Duration::from_secs(5));

        processor.process(control_in_request(1), Vec::new()).unwrap();
        processor.registry().remove(1);
        processor.registry().insert(UrbRecord::new(1, 1, UrbDirection::In, 0, &TransferKind::Bulk, 18)).unwrap();

        let err = processor.process(control_in_request(1), Vec::new()).unwrap_err();
        assert_eq!(err, SubmitError::Duplicate(1));
    }

    #[test]
    fn out_transfer_with_mismatched_payload_length_is_rejected() {
        let transport = Arc::new(FakeTransport {
            response: Ok(TransferOutcome::default()),
        });
        let processor = SubmitProcessor::new(UrbRegistry::new(), transport, 64, Duration::from_secs(5));

        let mut req = control_in_request(2);
        req.direction = 0;
        req.buffer_length = 4;

        let err = processor.process(req, vec![0u8; 3]).unwrap_err();
        assert_eq!(err, SubmitError::PayloadLengthMismatch);
    }

    #[test]
    fn admission_fails_once_at_capacity() {
        let transport = Arc::new(FakeTransport {
            response: Ok(TransferOutcome::default()),
        });
        let registry = UrbRegistry::new();
        registry
            .insert(UrbRecord::new(99, 1, UrbDirection::In, 1, &TransferKind::Bulk, 0))
            .unwrap();

        let processor = SubmitProcessor::new(registry, transport, 1, Duration::from_secs(5));

        let err = processor.process(control_in_request(1), Vec::new()).unwrap_err();
        assert_eq!(err, SubmitError::Admission);
    }

    #[test]
    fn transport_failure_maps_to_the_documented_errno() {
        let transport = Arc::new(FakeTransport { response: Err(()) });
        let processor = SubmitProcessor::new(UrbRegistry::new(), transport, 64, Duration::from_secs(5));

        let outcome = processor.process(control_in_request(1), Vec::new()).unwrap();
        assert_eq!(outcome.reply.status, errno::ESTALL);
    }
}

//! The URB unlink processor (§4.5): attempts to cancel a previously
//! submitted URB and emits exactly one `RET_UNLINK` reply.

use std::sync::Arc;

use crate::{
    errno,
    proto::{UnlinkReply, UnlinkRequest, UrbDirection},
    registry::{UrbRegistry, UrbStatus},
    transport::UsbTransport,
};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum UnlinkError {
    #[error("direction must be 0 (out) or 1 (in)")]
    InvalidDirection,
    #[error("unlinkSeqnum must not equal seqnum")]
    SelfReference,
    #[error("unlinkSeqnum must not be zero")]
    ZeroSeqnum,
    #[error("endpoint address {0} exceeds 0xFF")]
    InvalidEndpoint(u32),
}

pub struct UnlinkProcessor {
    registry: Arc<UrbRegistry>,
    transport: Arc<dyn UsbTransport>,
}

impl UnlinkProcessor {
    pub fn new(registry: Arc<UrbRegistry>, transport: Arc<dyn UsbTransport>) -> Self {
        Self { registry, transport }
    }

    fn validate(req: &UnlinkRequest) -> Result<(), UnlinkError> {
        UrbDirection::from_raw(req.direction).ok_or(UnlinkError::InvalidDirection)?;

        if req.ep > 0xFF {
            return Err(UnlinkError::InvalidEndpoint(req.ep));
        }
        if req.unlink_seqnum == req.seqnum {
            return Err(UnlinkError::SelfReference);
        }
        if req.unlink_seqnum == 0 {
            return Err(UnlinkError::ZeroSeqnum);
        }
        Ok(())
    }

    /// Locates the target URB and either flips it to `cancelled` (reporting
    /// success) or reports `ENOENT` if it's absent or already completed.
    /// Second and later UNLINKs against the same `unlinkSeqnum` always see
    /// the latter, since the first one already removed or cancelled it.
    pub fn process(&self, req: UnlinkRequest) -> Result<UnlinkReply, UnlinkError> {
        Self::validate(&req)?;

        let status = match self.registry.get(req.unlink_seqnum) {
            Some(record) if record.status != UrbStatus::Completed => {
                self.registry.update_status(req.unlink_seqnum, UrbStatus::Cancelled);
                self.transport.cancel(req.unlink_seqnum);
                0
            }
            _ => errno::ENOENT,
        };

        Ok(UnlinkReply::new(
            req.seqnum,
            req.unlink_seqnum,
            req.devid,
            req.direction,
            req.ep,
            status,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        proto::UrbDirection,
        registry::UrbRecord,
        transport::{TransferKind, TransferOutcome, TransferRequest, TransportError},
    };

    struct NoopTransport;

    impl UsbTransport for NoopTransport {
        fn transfer(&self, _request: TransferRequest) -> Result<TransferOutcome, TransportError> {
            unreachable!("unlink never calls transfer")
        }

        fn cancel(&self, _seqnum: u32) -> bool {
            true
        }
    }

    fn processor() -> (UnlinkProcessor, Arc<UrbRegistry>) {
        let registry = UrbRegistry::new();
        let processor = UnlinkProcessor::new(registry.clone(), Arc::new(NoopTransport));
        (processor, registry)
    }

    #[test]
    fn cancelling_a_tracked_urb_succeeds() {
        let (processor, registry) = processor();
        registry
            .insert(UrbRecord::new(7, 1, UrbDirection::In, 1, &TransferKind::Bulk, 512))
            .unwrap();

        let reply = processor
            .process(UnlinkRequest::new(8, 7, 1, 1, 1))
            .unwrap();

        assert_eq!(reply.status, 0);
        assert_eq!(registry.get(7).unwrap().status, UrbStatus::Cancelled);
    }

    #[test]
    fn unlinking_an_unknown_seqnum_reports_enoent() {
        let (processor, _registry) = processor();

        let reply = processor.process(UnlinkRequest::new(8, 7, 1, 1, 1)).unwrap();

        assert_eq!(reply.status, errno::ENOENT);
    }

    #[test]
    fn a_second_unlink_of_the_same_target_reports_enoent() {
        let (processor, registry) = processor();
        registry
            .insert(UrbRecord::new(7, 1, UrbDirection::In, 1, &TransferKind::Bulk, 512))
            .unwrap();

        let first = processor.process(UnlinkRequest::new(8, 7, 1, 1, 1)).unwrap();
        assert_eq!(first.status, 0);

        registry.remove(7);
        let second = processor.process(UnlinkRequest::new(9, 7, 1, 1, 1)).unwrap();
        assert_eq!(second.status, errno::ENOENT);
    }

    #[test]
    fn self_referencing_unlink_is_rejected() {
        let (processor, _registry) = processor();
        let err = processor.process(UnlinkRequest::new(7, 7, 1, 1, 1)).unwrap_err();
        assert_eq!(err, UnlinkError::SelfReference);
    }

    #[test]
    fn invalid_direction_is_rejected() {
        let (processor, _registry) = processor();
        let err = processor.process(UnlinkRequest::new(8, 7, 1, 2, 1)).unwrap_err();
        assert_eq!(err, UnlinkError::InvalidDirection);
    }
}

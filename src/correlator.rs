//! Termination of request/response exchanges addressed to missing forks.
//!
//! When a fork is removed while a remote call to it is in flight, the
//! request still arrives here and nobody will ever answer it. Rather
//! than letting the requester block until its own timeout, the
//! correlator synthesizes a minimal response the requester can identify
//! and filter: same exchange ids, reversed direction, empty payload.

use std::sync::Arc;

use crate::message::{CorrelationHeader, Flags, Message};
use crate::stack::ProtocolLayer;

/// Synthesizes "fork not found" responses for orphaned requests.
///
/// Holds the send path directly below the fork multiplexer, so a
/// synthetic response can never re-enter the multiplexer and loop.
pub struct OrphanResponseCorrelator {
    send_path: Arc<dyn ProtocolLayer>,
}

impl OrphanResponseCorrelator {
    /// Create a correlator sending through the given downward path.
    pub(crate) fn new(send_path: Arc<dyn ProtocolLayer>) -> Self {
        Self { send_path }
    }

    /// Answer an orphaned request.
    ///
    /// The caller has already established that the message targets an
    /// unknown fork and that its correlation header marks a request
    /// expecting a response. Guarantees exactly one response per
    /// orphaned request, identifiable by its empty payload, within
    /// normal message latency. Fire and forget: a send failure is
    /// logged, never propagated, since the requester's own timeout
    /// still bounds the exchange.
    pub fn handle(&self, request: Message) {
        let Some(header) = request.correlation else {
            return;
        };
        let Some(requester) = request.src.clone() else {
            tracing::debug!("orphaned request has no source address, nothing to answer");
            return;
        };

        tracing::debug!(
            fork = request.fork.as_ref().map(|f| f.channel_id.as_str()).unwrap_or(""),
            request_id = header.request_id,
            requester = %requester,
            "responding to request for unknown fork"
        );

        // Carry the original flags but drop the delivery-guarantee bit:
        // the orphaned exchange must not itself become a reliability
        // burden.
        let mut response = Message::new()
            .with_dest(requester)
            .with_flags(request.flags.without(Flags::RSVP))
            .with_correlation(CorrelationHeader::response(
                header.request_id,
                header.correlation_id,
            ));
        // Same fork envelope, so the response routes back through the
        // requester's own multiplexer.
        if let Some(fork) = request.fork {
            response = response.with_fork(fork);
        }
        // The original destination (this node) becomes the source.
        if let Some(dest) = request.dest {
            response = response.with_src(dest);
        }

        if let Err(err) = self.send_path.down(response) {
            tracing::debug!(error = %err, "failed to send orphan response");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::TopologyAddress;
    use crate::error::Result;
    use crate::message::ForkHeader;
    use crate::stack::LayerStatsSnapshot;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct CapturingLayer(Mutex<Vec<Message>>);

    impl ProtocolLayer for CapturingLayer {
        fn name(&self) -> &str {
            "capture"
        }
        fn up(&self, _msg: Message) {}
        fn down(&self, msg: Message) -> Result<()> {
            self.0.lock().push(msg);
            Ok(())
        }
        fn set_up_layer(&self, _layer: Arc<dyn ProtocolLayer>) {}
        fn set_down_layer(&self, _layer: Arc<dyn ProtocolLayer>) {}
        fn stats(&self) -> LayerStatsSnapshot {
            LayerStatsSnapshot::default()
        }
    }

    fn orphaned_request() -> Message {
        Message::new()
            .with_src(TopologyAddress::new("10.0.0.1:7600".parse().unwrap()))
            .with_dest(TopologyAddress::new("10.0.0.2:7600".parse().unwrap()))
            .with_flags(Flags::RSVP.with(Flags::OOB))
            .with_fork(ForkHeader::new("web", "session-registry"))
            .with_correlation(CorrelationHeader::request(99, 4, true))
            .with_payload(bytes::Bytes::from_static(b"call"))
    }

    #[test]
    fn response_reverses_direction_and_keeps_exchange_ids() {
        let capture = Arc::new(CapturingLayer::default());
        let correlator = OrphanResponseCorrelator::new(capture.clone());

        correlator.handle(orphaned_request());

        let sent = capture.0.lock();
        assert_eq!(sent.len(), 1);
        let response = &sent[0];
        assert_eq!(response.dest.as_ref().unwrap().addr(), "10.0.0.1:7600".parse().unwrap());
        assert_eq!(response.src.as_ref().unwrap().addr(), "10.0.0.2:7600".parse().unwrap());
        assert_eq!(response.fork.as_ref().unwrap().channel_id, "session-registry");

        let header = response.correlation.unwrap();
        assert_eq!(header.kind, crate::message::CorrelationType::Response);
        assert_eq!(header.request_id, 99);
        assert_eq!(header.correlation_id, 4);
        assert!(!response.has_payload());
    }

    #[test]
    fn response_clears_rsvp_but_keeps_other_flags() {
        let capture = Arc::new(CapturingLayer::default());
        let correlator = OrphanResponseCorrelator::new(capture.clone());

        correlator.handle(orphaned_request());

        let sent = capture.0.lock();
        assert!(!sent[0].flags.contains(Flags::RSVP));
        assert!(sent[0].flags.contains(Flags::OOB));
    }

    #[test]
    fn request_without_source_is_ignored() {
        let capture = Arc::new(CapturingLayer::default());
        let correlator = OrphanResponseCorrelator::new(capture.clone());

        let mut request = orphaned_request();
        request.src = None;
        correlator.handle(request);
        assert!(capture.0.lock().is_empty());
    }
}

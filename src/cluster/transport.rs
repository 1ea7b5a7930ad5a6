//! Inter-node transport seam.

use super::key::NodeId;
use super::proto::WireEnvelope;

/// Outbound half of the cluster transport.
///
/// `send` is called from shard loops and must not block; implementations
/// queue internally and drop on sustained backpressure. The inbound half is
/// the transport delivering decoded envelopes to the owning channel via
/// `Channel::handle_message`.
pub trait Transport: Send + Sync {
    fn send(&self, to: NodeId, envelope: WireEnvelope);
}

/// Discards all outbound traffic. The default for single-node runs and
/// tests that only exercise the local path.
#[derive(Default)]
pub struct NoopTransport;

impl Transport for NoopTransport {
    fn send(&self, _to: NodeId, _envelope: WireEnvelope) {}
}

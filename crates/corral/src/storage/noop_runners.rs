use async_trait::async_trait;

use crate::envelope::{Envelope, EnvelopeRequest};
use crate::error::ClusterError;
use crate::message::ReplyReceiver;
use crate::runners::Runners;
use crate::types::RunnerAddress;

/// No-op inter-runner communication that always returns unavailable.
/// Used for single-node / test scenarios where no remote runners exist.
pub struct NoopRunners;

#[async_trait]
impl Runners for NoopRunners {
    async fn ping(&self, address: &RunnerAddress) -> Result<(), ClusterError> {
        Err(ClusterError::RunnerUnavailable {
            address: address.clone(),
            source: None,
        })
    }

    async fn send(
        &self,
        address: &RunnerAddress,
        _envelope: EnvelopeRequest,
    ) -> Result<ReplyReceiver, ClusterError> {
        Err(ClusterError::RunnerUnavailable {
            address: address.clone(),
            source: None,
        })
    }

    async fn notify(
        &self,
        address: &RunnerAddress,
        _envelope: Envelope,
    ) -> Result<(), ClusterError> {
        Err(ClusterError::RunnerUnavailable {
            address: address.clone(),
            source: None,
        })
    }
}

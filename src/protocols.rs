//! Trait seams between the node runtime and the code it drives.
//!
//! | Trait | Implemented by | Used by |
//! |-------|----------------|---------|
//! | [`Service`] | applications, discovery | node dispatch worker |
//! | [`LivenessProbe`] | [`Node`](crate::Node) (discovery ping), test doubles | routing table on a full bucket |
//!
//! Keeping them here lets `routing` depend on a probe without depending on
//! the node, and lets tests drive either side with a mock.

use std::future::Future;

use async_trait::async_trait;

use crate::error::DispatchError;
use crate::messages::MessageEnvelope;
use crate::routing::PeerRecord;

/// A handler bound to one service id.
///
/// Returning `Ok(Some(payload))` for an envelope that expects a reply sends
/// `payload` back under the same nonce. For one-way envelopes the returned
/// payload is discarded.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    async fn handle(&self, envelope: MessageEnvelope) -> Result<Option<Vec<u8>>, DispatchError>;
}

#[async_trait]
impl<F, Fut> Service for F
where
    F: Fn(MessageEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Vec<u8>>, DispatchError>> + Send + 'static,
{
    async fn handle(&self, envelope: MessageEnvelope) -> Result<Option<Vec<u8>>, DispatchError> {
        (self)(envelope).await
    }
}

/// Checks whether a peer still answers.
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn probe(&self, peer: &PeerRecord) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PeerId;

    #[tokio::test]
    async fn closures_are_services() {
        let echo = |envelope: MessageEnvelope| async move {
            let mut reply = envelope.payload.clone();
            reply.extend_from_slice(b" reply");
            Ok::<_, DispatchError>(Some(reply))
        };

        let envelope = MessageEnvelope::request(
            PeerId::from_bytes([1; 32]),
            PeerId::from_bytes([2; 32]),
            42,
            1,
            b"hello".to_vec(),
        );
        let service: Box<dyn Service> = Box::new(echo);
        assert_eq!(service.handle(envelope).await.unwrap(), Some(b"hello reply".to_vec()));
    }

    #[tokio::test]
    async fn handler_errors_propagate() {
        let failing = |_envelope: MessageEnvelope| async move {
            Err::<Option<Vec<u8>>, _>(DispatchError::Handler("boom".into()))
        };
        let envelope = MessageEnvelope::one_way(
            PeerId::from_bytes([1; 32]),
            PeerId::from_bytes([2; 32]),
            42,
            vec![],
        );
        assert!(matches!(failing.handle(envelope).await, Err(DispatchError::Handler(_))));
    }
}

use std::fmt::Display;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use libp2p_identity::PeerId;
use tokio::sync::mpsc;

use crate::req_resp::{RequestId, SyncRequest};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundSyncRequest {
    pub peer_id: PeerId,
    pub request_id: RequestId,
    pub request: SyncRequest,
}

impl Display for OutboundSyncRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (id={}, peer={})",
            self.request, self.request_id, self.peer_id
        )
    }
}

/// Hands requests to the transport without waiting for the answer.
///
/// Responses come back to the sync service as events carrying the same request id.
pub trait NetworkRequester: Send + Sync {
    fn send_request(
        &self,
        peer_id: PeerId,
        request_id: RequestId,
        request: SyncRequest,
    ) -> Result<()>;
}

impl NetworkRequester for mpsc::UnboundedSender<OutboundSyncRequest> {
    fn send_request(
        &self,
        peer_id: PeerId,
        request_id: RequestId,
        request: SyncRequest,
    ) -> Result<()> {
        self.send(OutboundSyncRequest {
            peer_id,
            request_id,
            request,
        })
        .map_err(|err| anyhow!("failed to hand sync request to transport: {err}"))
    }
}

/// Transport side of the outbound request channel.
#[async_trait]
pub trait OutboundRequestSource: Send {
    async fn recv(&mut self) -> Option<OutboundSyncRequest>;
}

#[async_trait]
impl OutboundRequestSource for mpsc::UnboundedReceiver<OutboundSyncRequest> {
    async fn recv(&mut self) -> Option<OutboundSyncRequest> {
        mpsc::UnboundedReceiver::recv(self).await
    }
}

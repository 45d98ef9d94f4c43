//! Accepts worker sessions and pumps their calls through the controller.
use std::sync::Arc;

use tracing::{debug, warn};

use super::Controller;
use crate::protocol::{RequestEnvelope, ResponseEnvelope};
use crate::transport::{CommunicationClient, ControllerWorkerComm};

/// Accept worker sessions forever, one serve task per session
pub(super) async fn accept_loop<C>(controller: Controller, comm: C)
where
    C: ControllerWorkerComm + Send + Sync + 'static,
{
    loop {
        let transport = match comm.accept().await {
            Ok(transport) => transport,
            Err(e) => {
                warn!("Stopped accepting worker sessions: {e:?}");
                return;
            }
        };
        let client = Arc::new(CommunicationClient::<ResponseEnvelope, RequestEnvelope>::from_transport(transport));
        tokio::spawn(serve_session(controller.clone(), client));
    }
}

/// Serve one worker session. Requests are dispatched concurrently so a
/// slow full report does not hold up heartbeats multiplexed on the same
/// transport; per-worker ordering is enforced by the session locks.
async fn serve_session(
    controller: Controller,
    client: Arc<CommunicationClient<ResponseEnvelope, RequestEnvelope>>,
) {
    loop {
        let envelope = match client.recv_async().await {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!("Worker session ended: {e}");
                return;
            }
        };
        let controller = controller.clone();
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            let result = controller.handle(envelope.request).await;
            let response = ResponseEnvelope {
                call_id: envelope.call_id,
                result,
            };
            if let Err(e) = client.send(response) {
                debug!("Dropping response for closed session: {e}");
            }
        });
    }
}

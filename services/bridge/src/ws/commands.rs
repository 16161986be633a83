//! Outbound command execution for one session.
//!
//! Commands run one at a time in arrival order, and none before the handshake
//! has finished. The task owns the session's access token, which a media upload
//! replaces with the refreshed one.

use super::session::SessionShared;
use bytes::Bytes;
use chatbridge_core::{
    command::{COMMAND_ACCEPT, COMMAND_AGENT_MESSAGE, OutboundCommand},
    protocol::{METHOD_COMETAN, Named},
    upload::UploadSaga,
};
use secrecy::SecretString;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

pub(crate) async fn command_loop(
    shared: Arc<SessionShared>,
    mut commands: mpsc::Receiver<OutboundCommand>,
    mut access_token: SecretString,
) {
    if !shared.authenticated().await {
        debug!("Session stopped before it was active");
        return;
    }
    loop {
        let command = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            command = commands.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = execute(&shared, &mut access_token, command) => {}
        }
    }
    debug!("Command loop finished");
}

async fn execute(shared: &SessionShared, access_token: &mut SecretString, command: OutboundCommand) {
    let name = command.name();
    let private_id = command.private_id().map(str::to_string);
    let sent = match command {
        OutboundCommand::Accept(params) => {
            shared
                .link
                .request(METHOD_COMETAN, Named::new(COMMAND_ACCEPT, &params))
                .await
        }
        OutboundCommand::AgentTextMessage(params) => {
            shared
                .link
                .request(METHOD_COMETAN, Named::new(COMMAND_AGENT_MESSAGE, &params))
                .await
        }
        OutboundCommand::AgentMediaMessage(params) => {
            let bridge = &shared.bridge;
            let saga = UploadSaga::new(bridge.identity.as_ref(), bridge.media.as_ref());
            let uploaded = match saga.run(access_token, &params.file).await {
                Ok(uploaded) => uploaded,
                Err(e) => {
                    error!(command = name, ?private_id, error = %e, "Media upload failed; message not sent");
                    return;
                }
            };
            let message = params.delivered(&uploaded.location, uploaded.size, uploaded.dimensions);
            let sent = shared
                .link
                .request(METHOD_COMETAN, Named::new(COMMAND_AGENT_MESSAGE, &message))
                .await;
            if let Ok(sent) = &sent {
                if let Err(e) = bridge
                    .publisher
                    .publish(Bytes::from(sent.frame.clone()))
                    .await
                {
                    error!(error = ?e, "Failed to publish media message to the bus");
                }
            }
            sent
        }
    };

    match sent {
        Ok(sent) => info!(command = name, seq = sent.seq, ?private_id, "Command sent"),
        Err(e) => shared.write_failed(e),
    }
}

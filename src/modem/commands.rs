use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::oneshot;
use anyhow::{anyhow, bail, Result};
use tracing::{debug, error};
use crate::modem::types::{InterfaceRequest, InterfaceResponse};

static COMMAND_SEQUENCE: AtomicU32 = AtomicU32::new(1);

pub fn next_command_sequence() -> u32 {
    COMMAND_SEQUENCE.fetch_add(1, Ordering::SeqCst)
}

/// A request queued for an interface worker, answered exactly once.
#[derive(Debug)]
pub struct OutgoingCommand {
    pub sequence: u32,
    pub request: InterfaceRequest,
    response_tx: Option<oneshot::Sender<InterfaceResponse>>
}
impl OutgoingCommand {
    pub fn new(sequence: u32, request: InterfaceRequest, response_tx: oneshot::Sender<InterfaceResponse>) -> Self {
        Self {
            sequence,
            request,
            response_tx: Some(response_tx)
        }
    }

    pub fn respond(&mut self, response: InterfaceResponse) -> Result<()> {
        let Some(tx) = self.response_tx.take() else {
            error!("Attempted to respond to command #{} but response channel was already used", self.sequence);
            bail!("Command #{} was already answered", self.sequence);
        };

        debug!("Responding to command #{} with: {}", self.sequence, response);
        tx.send(response).map_err(|response| {
            error!("Failed to send response for command #{}, receiver likely dropped. Response was: {}", self.sequence, response);
            anyhow!("Failed to respond to command #{}", self.sequence)
        })
    }
}

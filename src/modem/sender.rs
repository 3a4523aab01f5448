use anyhow::{anyhow, bail, Result};
use tracing::{debug, error};
use tokio::sync::{mpsc, oneshot};
use crate::modem::commands::{next_command_sequence, OutgoingCommand};
use crate::modem::types::{InterfaceRequest, InterfaceResponse, InterfaceStatus};
use crate::ussd::UssdMessage;

/// Cloneable handle for queuing requests onto one interface's worker.
#[derive(Clone, Debug)]
pub struct InterfaceSender {
    name: String,
    command_tx: mpsc::Sender<OutgoingCommand>
}
impl InterfaceSender {
    pub fn new(name: impl Into<String>, command_tx: mpsc::Sender<OutgoingCommand>) -> Self {
        Self {
            name: name.into(),
            command_tx
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn dial(&self, number: impl Into<String>) -> Result<()> {
        self.expect_done(InterfaceRequest::Dial { number: number.into() }).await
    }

    pub async fn answer(&self) -> Result<()> {
        self.expect_done(InterfaceRequest::Answer).await
    }

    pub async fn hangup(&self) -> Result<()> {
        self.expect_done(InterfaceRequest::Hangup).await
    }

    pub async fn send_dtmf(&self, digit: char) -> Result<()> {
        self.expect_done(InterfaceRequest::SendDtmf { digit }).await
    }

    /// Returns the message reference of every submitted part.
    pub async fn send_sms(&self, to: impl Into<String>, content: impl Into<String>) -> Result<Vec<u8>> {
        let request = InterfaceRequest::SendSms { to: to.into(), content: content.into() };
        match self.send_command(request).await? {
            InterfaceResponse::SmsSent { references } => Ok(references),
            other => Err(unexpected(other))
        }
    }

    /// The network's reply, if one arrived before the request finished.
    pub async fn send_ussd(&self, code: impl Into<String>) -> Result<Option<UssdMessage>> {
        match self.send_command(InterfaceRequest::SendUssd { code: code.into() }).await? {
            InterfaceResponse::UssdSent { reply } => Ok(reply),
            other => Err(unexpected(other))
        }
    }

    pub async fn status(&self) -> Result<InterfaceStatus> {
        match self.send_command(InterfaceRequest::GetStatus).await? {
            InterfaceResponse::Status(status) => Ok(status),
            other => Err(unexpected(other))
        }
    }

    async fn expect_done(&self, request: InterfaceRequest) -> Result<()> {
        match self.send_command(request).await? {
            InterfaceResponse::Done => Ok(()),
            other => Err(unexpected(other))
        }
    }

    pub async fn send_command(&self, request: InterfaceRequest) -> Result<InterfaceResponse> {
        let sequence = next_command_sequence();
        let timeout = request.get_timeout();
        let (tx, rx) = oneshot::channel();

        let cmd = OutgoingCommand::new(sequence, request, tx);
        debug!("[{}] Queuing command sequence {}: {:?}", self.name, sequence, cmd.request);

        self.command_tx.send(cmd)
            .await
            .map_err(|_| anyhow!("Failed to queue command - interface {} task may be dead", self.name))?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(InterfaceResponse::Error { message })) => {
                debug!("[{}] Command sequence {} failed: {}", self.name, sequence, message);
                bail!(message)
            },
            Ok(Ok(response)) => {
                debug!("[{}] Command sequence {} completed!", self.name, sequence);
                Ok(response)
            },
            Ok(Err(e)) => {
                error!("{:?}", e);
                Err(anyhow!("Command sequence {} response channel closed", sequence))
            },
            Err(_) => Err(anyhow!("Command sequence {} timed out waiting for response", sequence))
        }
    }
}

fn unexpected(response: InterfaceResponse) -> anyhow::Error {
    anyhow!("Unexpected response from interface: {}", response)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn responder(response: InterfaceResponse) -> InterfaceSender {
        let (tx, mut rx) = mpsc::channel::<OutgoingCommand>(1);
        tokio::spawn(async move {
            if let Some(mut command) = rx.recv().await {
                command.respond(response).unwrap();
            }
        });
        InterfaceSender::new("gsm0", tx)
    }

    // Success cases

    #[tokio::test]
    async fn test_send_sms_references() {
        let sender = responder(InterfaceResponse::SmsSent { references: vec![3, 4] });
        assert_eq!(sender.send_sms("+447700900123", "hello").await.unwrap(), vec![3, 4]);
    }

    #[tokio::test]
    async fn test_dial_done() {
        let sender = responder(InterfaceResponse::Done);
        sender.dial("123").await.unwrap();
    }

    // Failure cases

    #[tokio::test]
    async fn test_error_response_becomes_error() {
        let sender = responder(InterfaceResponse::Error { message: "Modem answered ERROR to \"ATA\"".to_string() });
        let err = sender.answer().await.unwrap_err();
        assert!(err.to_string().contains("ATA"));
    }

    #[tokio::test]
    async fn test_mismatched_response() {
        let sender = responder(InterfaceResponse::Done);
        assert!(sender.status().await.is_err());
    }

    #[tokio::test]
    async fn test_dead_worker() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sender = InterfaceSender::new("gsm0", tx);
        assert!(sender.hangup().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let (tx, _rx) = mpsc::channel(1);
        let sender = InterfaceSender::new("gsm0", tx);
        let err = sender.hangup().await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}

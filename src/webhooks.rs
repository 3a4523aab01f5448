use std::sync::Arc;
use std::time::Duration;
use futures::{stream, StreamExt};
use reqwest::Client;
use reqwest::header::HeaderMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use anyhow::{bail, Context, Result};
use crate::config::ConfiguredWebhook;
use crate::events::{Event, EventType};

const CONCURRENCY_LIMIT: usize = 10;
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct WebhookSender {
    event_sender: mpsc::UnboundedSender<Event>
}
impl WebhookSender {
    pub fn new(webhooks: Option<Vec<ConfiguredWebhook>>) -> Option<(Self, JoinHandle<()>)> {
        let webhooks = match webhooks {
            Some(webhooks) if !webhooks.is_empty() => webhooks,
            _ => {
                info!("There are no webhook targets within config!");
                return None;
            }
        };

        // Unbounded so that events are never dropped, sessions must not block on delivery.
        let (event_sender, event_receiver) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move {
            let worker = WebhookWorker::new(webhooks, event_receiver);
            worker.run().await;
        });

        Some((Self { event_sender }, handle))
    }

    pub fn send(&self, event: Event) {
        if let Err(e) = self.event_sender.send(event) {
            error!("Failed to queue webhook job: {}", e);
        }
    }
}

/// Webhook target with its prebuilt headers and subscribed event mask.
struct StoredWebhook {
    webhook: ConfiguredWebhook,
    headers: Option<HeaderMap>,
    mask: u8
}

struct WebhookWorker {
    webhooks: Arc<[StoredWebhook]>,
    event_receiver: mpsc::UnboundedReceiver<Event>,
    client: Client
}
impl WebhookWorker {
    fn new(webhooks: Vec<ConfiguredWebhook>, event_receiver: mpsc::UnboundedReceiver<Event>) -> Self {
        let client = Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                error!("Could not build timeout HTTP client with error: {}", e);
                Client::new()
            });

        Self {
            webhooks: webhooks.into_iter()
                .enumerate()
                .map(|(idx, webhook)| {
                    let headers = webhook.get_header_map()
                        .unwrap_or_else(|e| {
                            error!("Failed to create Webhook #{} HeaderMap with error: {}", idx, e);
                            None
                        });

                    let mask = EventType::events_to_mask(&webhook.events);
                    StoredWebhook { webhook, headers, mask }
                })
                .collect::<Vec<StoredWebhook>>()
                .into(),

            event_receiver,
            client
        }
    }

    async fn run(mut self) {
        info!("Starting webhook worker");
        while let Some(event) = self.event_receiver.recv().await {
            self.process(event).await;
        }
    }

    fn targets(&self, event: &Event) -> Vec<usize> {
        let bit = event.to_event_type().to_bit();
        self.webhooks
            .iter()
            .enumerate()
            .filter(|(_, stored)| stored.mask & bit != 0)
            .map(|(idx, _)| idx)
            .collect()
    }

    async fn process(&self, event: Event) {
        let targets = self.targets(&event);
        if targets.is_empty() {
            return;
        }

        let event = Arc::new(event);
        stream::iter(targets)
            .map(|idx| {
                let stored = &self.webhooks[idx];
                let event = Arc::clone(&event);
                let client = &self.client;

                async move {
                    match Self::execute_webhook(stored, client, &event).await {
                        Ok(()) => debug!("Webhook #{} was sent successfully!", idx),
                        Err(e) => error!("Failed to send Webhook #{} with error: {}", idx, e)
                    }
                }
            })
            .buffer_unordered(CONCURRENCY_LIMIT)
            .for_each(|_| async {})
            .await;
    }

    async fn execute_webhook(stored: &StoredWebhook, client: &Client, event: &Event) -> Result<()> {
        let mut request = client
            .post(&stored.webhook.url)
            .json(event);

        if let Some(headers) = &stored.headers {
            request = request.headers(headers.clone());
        }

        debug!("Sending webhook to: {}", stored.webhook.url);
        let response = request.send().await
            .with_context(|| "Network error")?;

        let status = response.status();
        match stored.webhook.expected_status {
            Some(expected) if status.as_u16() != expected => {
                bail!("Got {} expected {}!", status.as_u16(), expected);
            }
            None if !status.is_success() => {
                bail!("Unsuccessful status {}", status);
            }
            _ => Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modem::types::HangupCause;

    fn webhook(events: Vec<EventType>) -> ConfiguredWebhook {
        ConfiguredWebhook {
            url: "http://127.0.0.1:9/".to_string(),
            events,
            headers: None,
            expected_status: None
        }
    }

    #[tokio::test]
    async fn test_targets_follow_event_mask() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let worker = WebhookWorker::new(
            vec![
                webhook(vec![EventType::IncomingSms]),
                webhook(vec![EventType::CallHungup, EventType::Alarm]),
                webhook(vec![EventType::CallHungup])
            ],
            rx
        );

        let event = Event::CallHungup { interface: "gsm0".to_string(), cause: HangupCause::Normal };
        assert_eq!(worker.targets(&event), vec![1, 2]);

        let event = Event::CallAnswered { interface: "gsm0".to_string() };
        assert!(worker.targets(&event).is_empty());
    }

    #[test]
    fn test_no_webhooks_configured() {
        assert!(WebhookSender::new(None).is_none());
        assert!(WebhookSender::new(Some(Vec::new())).is_none());
    }
}

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use anyhow::{bail, Result};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use crate::config::InterfaceConfig;
use crate::events::Event;
use crate::modem::retry::{retry, RetryPolicy};
use crate::modem::sender::InterfaceSender;
use crate::modem::transport::Transport;
use crate::modem::worker::InterfaceSession;

pub mod correlator;
pub mod parsers;
pub mod sender;
pub mod state_machine;
pub mod transport;
pub mod types;
pub mod urc;
mod buffer;
mod commands;
mod retry;
mod session;
mod worker;

const OPEN_RETRY: RetryPolicy = RetryPolicy::new(3, Duration::from_secs(1));

struct RunningInterface {
    sender: InterfaceSender,
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>
}

/// Owns every interface session by name. Clones share the same table.
#[derive(Clone)]
pub struct InterfaceRegistry {
    interfaces: Arc<RwLock<HashMap<String, RunningInterface>>>,
    events_tx: mpsc::UnboundedSender<Event>,
    global_running: Arc<AtomicBool>
}
impl InterfaceRegistry {
    pub fn new(global_running: Arc<AtomicBool>) -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let registry = Self {
            interfaces: Arc::new(RwLock::new(HashMap::new())),
            events_tx,
            global_running
        };

        (registry, events_rx)
    }

    /// Opens the interface's serial device and starts its session.
    pub async fn create(&self, config: InterfaceConfig) -> Result<InterfaceSender> {
        let stream = retry(OPEN_RETRY, |attempt| {
            let result = transport::open(&config.device, config.baud);
            if let Err(e) = &result {
                warn!("[{}] Attempt {} to open {} failed: {:#}", config.name, attempt, config.device, e);
            }
            async move { result }
        }).await?;

        self.attach(config, stream).await
    }

    /// Starts a session over an already open transport.
    pub async fn attach<T: Transport>(&self, config: InterfaceConfig, stream: T) -> Result<InterfaceSender> {
        let mut interfaces = self.interfaces.write().await;
        if interfaces.contains_key(&config.name) {
            bail!("Interface {} already exists", config.name);
        }

        let name = config.name.clone();
        let (command_tx, command_rx) = mpsc::channel(config.cmd_channel_buffer_size);
        let running = Arc::new(AtomicBool::new(true));

        let session = InterfaceSession::new(
            Arc::new(config),
            stream,
            self.events_tx.clone(),
            Arc::clone(&self.global_running),
            Arc::clone(&running)
        );
        let handle = tokio::spawn(session.initialize_and_run(command_rx));

        let sender = InterfaceSender::new(name.clone(), command_tx);
        info!("[{}] Interface created", name);
        interfaces.insert(name, RunningInterface {
            sender: sender.clone(),
            running,
            handle
        });

        Ok(sender)
    }

    /// Stops a session and waits for its worker to finish the exchange in flight.
    pub async fn remove(&self, name: &str) -> Result<()> {
        let Some(interface) = self.interfaces.write().await.remove(name) else {
            bail!("No interface named {}", name);
        };

        interface.running.store(false, Ordering::Relaxed);
        if let Err(e) = interface.handle.await {
            error!("[{}] Interface task failed: {:?}", name, e);
        }
        info!("[{}] Interface removed", name);
        Ok(())
    }

    pub async fn find_by_name(&self, name: &str) -> Option<InterfaceSender> {
        self.interfaces
            .read()
            .await
            .get(name)
            .map(|interface| interface.sender.clone())
    }

    /// Sorted interface names, including sessions that have since stopped.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.interfaces.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn is_running(&self, name: &str) -> bool {
        self.interfaces
            .read()
            .await
            .get(name)
            .is_some_and(|interface| interface.running.load(Ordering::Relaxed) && !interface.handle.is_finished())
    }

    /// Stops every session.
    pub async fn shutdown(&self) {
        self.global_running.store(false, Ordering::Relaxed);
        for name in self.names().await {
            if let Err(e) = self.remove(&name).await {
                warn!("Failed to remove interface {}: {}", name, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use crate::modem::types::Alarm;

    fn config(name: &str) -> InterfaceConfig {
        InterfaceConfig {
            initial_pause_ms: 0,
            after_preinit_pause_ms: 0,
            ..InterfaceConfig::new(name)
        }
    }

    // Success cases

    #[tokio::test(start_paused = true)]
    async fn test_attach_find_remove() {
        let (registry, _events) = InterfaceRegistry::new(Arc::new(AtomicBool::new(true)));
        let (client, _modem) = duplex(1024);

        registry.attach(config("gsm1"), client).await.unwrap();
        assert!(registry.find_by_name("gsm1").await.is_some());
        assert!(registry.find_by_name("gsm2").await.is_none());
        assert_eq!(registry.names().await, vec!["gsm1"]);

        registry.remove("gsm1").await.unwrap();
        assert!(registry.names().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_modem_raises_alarm() {
        let (registry, mut events) = InterfaceRegistry::new(Arc::new(AtomicBool::new(true)));
        let (client, _modem) = duplex(1024);
        registry.attach(config("gsm0"), client).await.unwrap();

        match events.recv().await {
            Some(Event::Alarm { interface, alarm, .. }) => {
                assert_eq!(interface, "gsm0");
                assert_eq!(alarm, Alarm::FailedInterface);
            },
            other => panic!("unexpected event {:?}", other)
        }
        tokio::task::yield_now().await;
        assert!(!registry.is_running("gsm0").await);
    }

    // Failure cases

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_name() {
        let (registry, _events) = InterfaceRegistry::new(Arc::new(AtomicBool::new(true)));
        let (first, _first_modem) = duplex(1024);
        let (second, _second_modem) = duplex(1024);

        registry.attach(config("gsm0"), first).await.unwrap();
        assert!(registry.attach(config("gsm0"), second).await.is_err());
        assert!(registry.remove("gsm9").await.is_err());
    }
}

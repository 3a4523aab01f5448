use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use anyhow::Result;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use crate::config::AppConfig;
use crate::events::{Event, EventBroadcaster};
use crate::modem::InterfaceRegistry;

#[cfg(feature = "http-server")]
use crate::config::HTTPConfig;

pub struct AppHandles {
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    registry: InterfaceRegistry
}
impl AppHandles {
    pub async fn create(config: AppConfig) -> Result<AppHandles> {
        let mut tasks = Vec::new();

        // Create event broadcaster (and webhook worker handle).
        let (broadcaster, webhooks_handle) = EventBroadcaster::create(config.webhooks);
        if let Some(webhooks_worker) = webhooks_handle {
            tasks.push(("Webhooks Worker", webhooks_worker));
        }

        let (registry, events_rx) = InterfaceRegistry::new(Arc::new(AtomicBool::new(true)));
        tasks.push(("Event Forwarder", Self::start_event_forwarder(events_rx, broadcaster)));

        // An interface that can't be opened is logged, the others still start.
        for interface in config.interfaces {
            let name = interface.name.clone();
            match registry.create(interface).await {
                Ok(_) => info!("Interface {} started", name),
                Err(e) => error!("Failed to start interface {}: {:#}", name, e)
            }
        }
        if registry.names().await.is_empty() {
            warn!("No interface could be started, only the HTTP surface is available");
        }

        #[cfg(feature = "http-server")]
        if let Some(http_handle) = Self::start_http_server(config.http, registry.clone())? {
            tasks.push(("HTTP Server", http_handle));
        }

        tasks.push(("Shutdown Signal", tokio::spawn(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Shutdown signal received");
        })));

        Ok(AppHandles { tasks, registry })
    }

    pub async fn run(self) {
        let futures: Vec<_> = self.tasks
            .into_iter()
            .map(|(name, handle)| {
                info!("Starting task: {}.", name);
                Box::pin(async move {
                    match handle.await {
                        Ok(()) => info!("{} task completed!", name),
                        Err(e) => error!("{} task failed: {:?}!", name, e)
                    }
                })
            })
            .collect();

        // Wait for any task to complete. All handles are boxed, so when dropped they are cancelled.
        let (_, _, remaining) = futures::future::select_all(futures).await;
        drop(remaining);

        self.registry.shutdown().await;
    }

    fn start_event_forwarder(
        mut events_rx: UnboundedReceiver<Event>,
        broadcaster: EventBroadcaster
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                broadcaster.broadcast(event);
            }
        })
    }

    #[cfg(feature = "http-server")]
    fn start_http_server(
        config: HTTPConfig,
        registry: InterfaceRegistry
    ) -> Result<Option<JoinHandle<()>>> {
        if !config.enabled {
            info!("HTTP server disabled in config");
            return Ok(None);
        }

        let address = config.address;
        let app = crate::http::create_app(config, registry)?;
        let handle = tokio::spawn(async move {
            let listener = match tokio::net::TcpListener::bind(address).await {
                Ok(listener) => listener,
                Err(e) => {
                    error!("Failed to bind HTTP server to {}: {}", address, e);
                    return;
                }
            };

            info!("Starting HTTP server on {}.", address);
            if let Err(e) = axum::serve(listener, app).await {
                error!("Server error: {:?}", e);
            }
        });

        Ok(Some(handle))
    }
}

//! Server startup and binding

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;

use crate::config::ClientConfig;
use crate::registry::SubscriptionRegistry;
use crate::routes;

/// Subscriptions service instance
pub struct Server {
    config: Arc<ClientConfig>,
    registry: SubscriptionRegistry,
    router: Router,
}

impl Server {
    pub fn new(config: ClientConfig, registry: SubscriptionRegistry) -> Self {
        let config = Arc::new(config);
        let router = routes::build_router(config.clone(), registry.clone());

        Self {
            config,
            registry,
            router,
        }
    }

    /// Get the socket address the server will bind to
    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.config.socket_addr().parse()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Bind to the configured host/port and serve until Ctrl+C.
    pub async fn run(self) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(self.config.socket_addr()).await?;
        self.run_with_listener(listener).await
    }

    /// Serve on an already bound listener until Ctrl+C, then stop every
    /// subscription.
    pub async fn run_with_listener(self, listener: TcpListener) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!("Subscriptions service listening on {}", addr);

        let registry = self.registry.clone();
        axum::serve(listener, self.router)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("Shutdown requested");
            })
            .await?;

        registry.shutdown().await;
        Ok(())
    }
}

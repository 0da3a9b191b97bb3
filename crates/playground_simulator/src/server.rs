//! Server startup and binding

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;

use crate::config::SimulatorConfig;
use crate::producer::StreamProducer;
use crate::routes;

/// Simulator server instance
pub struct Server {
    config: Arc<SimulatorConfig>,
    router: Router,
}

impl Server {
    /// Create a new server over the given producer
    pub fn new(config: SimulatorConfig, producer: StreamProducer) -> Self {
        let config = Arc::new(config);
        let router = routes::build_router(config.clone(), producer);

        Self { config, router }
    }

    /// Get the socket address the server will bind to
    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.config.socket_addr().parse()
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    /// Bind to the configured host/port and serve until Ctrl+C.
    pub async fn run(self) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(self.config.socket_addr()).await?;
        self.run_with_listener(listener).await
    }

    /// Serve on an already bound listener until Ctrl+C.
    ///
    /// Tests bind port 0 and pass the listener in.
    pub async fn run_with_listener(self, listener: TcpListener) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!("Simulator listening on {}", addr);

        axum::serve(listener, self.router)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("Shutdown requested");
            })
            .await
    }

    /// Bind port 0, serve in the background and return the bound address.
    #[cfg(test)]
    pub async fn spawn_test_server(
        config: SimulatorConfig,
        producer: StreamProducer,
    ) -> (SocketAddr, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = Self::new(config, producer);
        let handle = tokio::spawn(async move {
            server.run_with_listener(listener).await.ok();
        });

        (addr, handle)
    }
}

//! The HTTP server.

use crate::config::ServerConfig;
use crate::error::ServerResult;
use crate::handler::{self, AppState};
use crate::render::{HtmlRowRenderer, RowRenderer};
use crate::stream;
use axum::routing::{get, post, put};
use axum::Router;
use repowatch_core::{Coordinator, OperationRunner};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// Serves the coordinator over HTTP.
///
/// # Example
///
/// ```rust,ignore
/// use repowatch_core::{Coordinator, MockExecutor, OperationRunner};
/// use repowatch_server::{ServerConfig, StateServer};
/// use std::sync::Arc;
///
/// let coordinator = Arc::new(Coordinator::default());
/// let runner = OperationRunner::new(Arc::clone(&coordinator), Arc::new(MockExecutor::new()));
/// let server = StateServer::new(coordinator, runner, ServerConfig::default());
/// server.run().await?;
/// ```
pub struct StateServer {
    state: AppState,
}

impl StateServer {
    /// Creates a server rendering rows with [`HtmlRowRenderer`].
    pub fn new(
        coordinator: Arc<Coordinator>,
        runner: Arc<OperationRunner>,
        config: ServerConfig,
    ) -> Self {
        Self {
            state: AppState {
                coordinator,
                runner,
                renderer: Arc::new(HtmlRowRenderer),
                config: Arc::new(config),
            },
        }
    }

    /// Replaces the row renderer.
    pub fn with_renderer(mut self, renderer: Arc<dyn RowRenderer>) -> Self {
        self.state.renderer = renderer;
        self
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }

    /// Builds the router.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(handler::health))
            .route("/events", get(stream::events))
            .route("/events/log", get(handler::event_log))
            .route("/entities", get(handler::list_entities))
            .route("/entities/:owner/:name", get(handler::get_entity))
            .route("/entities/:owner/:name/transition", post(handler::transition))
            .route("/entities/:owner/:name/install", post(handler::install))
            .route("/entities/:owner/:name/activate", post(handler::activate))
            .route("/entities/:owner/:name/deactivate", post(handler::deactivate))
            .route("/entities/:owner/:name/recheck", post(handler::recheck))
            .route("/entities/:owner/:name/refresh", get(handler::refresh))
            .route(
                "/entities/:owner/:name/metadata/:key",
                put(handler::put_metadata).delete(handler::delete_metadata),
            )
            .with_state(self.state.clone())
    }

    /// Binds the configured address.
    pub async fn bind(&self) -> ServerResult<TcpListener> {
        Ok(TcpListener::bind(self.state.config.bind_addr).await?)
    }

    /// Binds the configured address and serves until the process stops.
    pub async fn run(self) -> ServerResult<()> {
        let listener = self.bind().await?;
        self.serve(listener, std::future::pending()).await
    }

    /// Serves on `listener` until `shutdown` resolves.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> ServerResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr: SocketAddr = listener.local_addr()?;
        info!(
            %addr,
            stream = self.state.config.stream_enabled,
            "repowatch server listening"
        );

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("repowatch server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use repowatch_core::{Executor, MockExecutor};

    #[test]
    fn builds_router() {
        let coordinator = Arc::new(Coordinator::default());
        let runner = OperationRunner::new(
            Arc::clone(&coordinator),
            Arc::new(MockExecutor::new()) as Arc<dyn Executor>,
        );
        let server = StateServer::new(coordinator, runner, ServerConfig::default());
        let _router = server.router();
        assert!(server.config().stream_enabled);
    }
}

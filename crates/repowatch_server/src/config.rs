//! Server configuration.

use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for the HTTP server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Whether `GET /events` serves the change stream.
    pub stream_enabled: bool,
    /// Interval between keep-alive comments on idle streams.
    pub keep_alive: Duration,
    /// Whether a fresh stream connection first replays the event log.
    pub replay_on_connect: bool,
    /// Upper bound for `GET /events/log?limit=`.
    pub max_log_page: usize,
}

impl ServerConfig {
    /// Creates a new server configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            stream_enabled: true,
            keep_alive: Duration::from_secs(15),
            replay_on_connect: true,
            max_log_page: 500,
        }
    }

    /// Enables or disables the change stream.
    pub fn with_stream(mut self, enabled: bool) -> Self {
        self.stream_enabled = enabled;
        self
    }

    /// Sets the keep-alive interval.
    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive = interval;
        self
    }

    /// Enables or disables replay for connections without `Last-Event-ID`.
    pub fn with_replay_on_connect(mut self, replay: bool) -> Self {
        self.replay_on_connect = replay;
        self
    }

    /// Sets the largest event log page.
    pub fn with_max_log_page(mut self, max: usize) -> Self {
        self.max_log_page = max;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], 8080)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.port(), 8080);
        assert!(config.stream_enabled);
        assert!(config.replay_on_connect);
        assert_eq!(config.keep_alive, Duration::from_secs(15));
    }

    #[test]
    fn config_builder() {
        let config = ServerConfig::new("0.0.0.0:9000".parse().unwrap())
            .with_stream(false)
            .with_keep_alive(Duration::from_secs(5))
            .with_max_log_page(50);

        assert!(!config.stream_enabled);
        assert_eq!(config.keep_alive, Duration::from_secs(5));
        assert_eq!(config.max_log_page, 50);
    }
}

//! Serve command implementation.

use crate::executor::{CommandExecutor, CommandTemplates};
use clap::Args;
use repowatch_core::{
    Coordinator, CoordinatorConfig, EntityKey, Executor, OperationRunner, PluginState,
    RetryPolicy, TransitionRequest, TransitionSource,
};
use repowatch_server::{ServerConfig, StateServer};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Options of `repowatch serve`.
#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    pub bind: SocketAddr,

    /// Lease lifetime for entity operations, in seconds
    #[arg(long, default_value = "45")]
    pub lock_ttl_secs: u64,

    /// Automatic retries before an error needs manual action
    #[arg(long, default_value = "3")]
    pub max_retries: u32,

    /// Never retry failed entities automatically
    #[arg(long)]
    pub no_retry: bool,

    /// Disable the change stream endpoint
    #[arg(long)]
    pub no_stream: bool,

    /// Keep-alive interval of the change stream, in seconds
    #[arg(long, default_value = "15")]
    pub keep_alive_secs: u64,

    /// Transition records kept for debugging and stream replay
    #[arg(long, default_value = "300")]
    pub log_capacity: usize,

    /// Entity to scan at startup (owner/name, repeatable)
    #[arg(short, long = "entity")]
    pub entities: Vec<String>,

    /// Entity discovery found installed (owner/name[:active], repeatable)
    #[arg(long = "installed")]
    pub installed: Vec<String>,

    /// Check command template; exit 0 = available, exit 2 = not a plugin
    #[arg(long)]
    pub check_cmd: Option<String>,

    /// Install command template
    #[arg(long)]
    pub install_cmd: Option<String>,

    /// Activate command template
    #[arg(long)]
    pub activate_cmd: Option<String>,

    /// Deactivate command template
    #[arg(long)]
    pub deactivate_cmd: Option<String>,
}

/// A `--installed` hint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledHint {
    /// The entity.
    pub entity: EntityKey,
    /// Whether it is active.
    pub active: bool,
}

impl InstalledHint {
    /// Parses `owner/name` or `owner/name:active`.
    pub fn parse(value: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let (key, active) = match value.split_once(':') {
            Some((key, "active")) => (key, true),
            Some((key, "inactive")) => (key, false),
            Some((_, flag)) => {
                return Err(format!("unknown installed flag {flag:?} in {value:?}").into())
            }
            None => (value, false),
        };
        Ok(Self {
            entity: EntityKey::parse(key)?,
            active,
        })
    }

    fn state(&self) -> PluginState {
        if self.active {
            PluginState::InstalledActive
        } else {
            PluginState::InstalledInactive
        }
    }
}

impl ServeArgs {
    fn coordinator_config(&self) -> CoordinatorConfig {
        let retry = if self.no_retry {
            RetryPolicy::no_retry()
        } else {
            RetryPolicy::new(self.max_retries)
        };
        CoordinatorConfig::new()
            .with_lock_ttl(Duration::from_secs(self.lock_ttl_secs))
            .with_event_log_capacity(self.log_capacity)
            .with_retry(retry)
    }

    fn server_config(&self) -> ServerConfig {
        ServerConfig::new(self.bind)
            .with_stream(!self.no_stream)
            .with_keep_alive(Duration::from_secs(self.keep_alive_secs))
    }

    fn templates(&self) -> CommandTemplates {
        CommandTemplates {
            check: self.check_cmd.clone(),
            install: self.install_cmd.clone(),
            activate: self.activate_cmd.clone(),
            deactivate: self.deactivate_cmd.clone(),
        }
    }
}

/// Runs the serve command until Ctrl-C.
pub async fn run(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let hints = args
        .installed
        .iter()
        .map(|value| InstalledHint::parse(value))
        .collect::<Result<Vec<_>, _>>()?;
    let entities = args
        .entities
        .iter()
        .map(|value| EntityKey::parse(value))
        .collect::<Result<Vec<_>, _>>()?;

    let coordinator = Arc::new(Coordinator::new(args.coordinator_config()));
    let executor = CommandExecutor::new(args.templates());
    if executor.is_dry_run() {
        warn!("no executor commands configured, operations are dry runs");
    }
    let runner = OperationRunner::new(
        Arc::clone(&coordinator),
        Arc::new(executor) as Arc<dyn Executor>,
    );

    seed_installed(&coordinator, &hints);
    tokio::spawn(seed_scans(Arc::clone(&runner), entities, hints));

    let server = StateServer::new(coordinator, runner, args.server_config());
    let listener = server.bind().await?;
    server.serve(listener, shutdown_signal()).await?;
    Ok(())
}

/// Records what discovery already knows as installed.
fn seed_installed(coordinator: &Coordinator, hints: &[InstalledHint]) {
    for hint in hints {
        let request = TransitionRequest::new(hint.entity.clone(), hint.state())
            .with_source(TransitionSource::Discovery)
            .with_context(json!({ "hint": "installed" }));
        match coordinator.submit(request) {
            Ok(outcome) if outcome.is_applied() => {
                info!(entity = %hint.entity, state = %outcome.to, "seeded installed entity");
            }
            Ok(_) => {}
            Err(err) => warn!(entity = %hint.entity, error = %err, "could not seed entity"),
        }
    }
}

/// Scans every seeded entity that discovery did not report as installed.
async fn seed_scans(runner: Arc<OperationRunner>, entities: Vec<EntityKey>, hints: Vec<InstalledHint>) {
    for entity in entities {
        if hints.iter().any(|hint| hint.entity == entity) {
            continue;
        }
        match runner.recheck(&entity, TransitionSource::Discovery).await {
            Ok(report) => info!(entity = %entity, state = %report.state, "initial scan finished"),
            Err(err) => warn!(entity = %entity, error = %err, "initial scan skipped"),
        }
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "could not listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        args: ServeArgs,
    }

    #[test]
    fn installed_hint_parsing() {
        let hint = InstalledHint::parse("acme/widget:active").unwrap();
        assert!(hint.active);
        assert_eq!(hint.state(), PluginState::InstalledActive);

        let hint = InstalledHint::parse("acme/widget").unwrap();
        assert!(!hint.active);

        assert!(InstalledHint::parse("acme/widget:maybe").is_err());
        assert!(InstalledHint::parse("widget:active").is_err());
    }

    #[test]
    fn flags_map_to_config() {
        let harness = Harness::parse_from([
            "serve",
            "--bind",
            "0.0.0.0:9000",
            "--lock-ttl-secs",
            "10",
            "--no-retry",
            "--no-stream",
            "--log-capacity",
            "20",
            "--entity",
            "acme/widget",
            "--entity",
            "acme/gadget",
        ]);
        let args = harness.args;
        assert_eq!(args.entities.len(), 2);

        let core = args.coordinator_config();
        assert_eq!(core.lock_ttl, Duration::from_secs(10));
        assert_eq!(core.event_log_capacity, 20);
        assert!(!core.retry.auto_retry);

        let server = args.server_config();
        assert_eq!(server.bind_addr.port(), 9000);
        assert!(!server.stream_enabled);
        assert!(args.templates().check.is_none());
    }

    #[test]
    fn seeding_installed_entities() {
        let coordinator = Coordinator::default();
        let hints = vec![
            InstalledHint::parse("acme/widget:active").unwrap(),
            InstalledHint::parse("acme/gadget").unwrap(),
        ];
        seed_installed(&coordinator, &hints);

        assert_eq!(
            coordinator.get_state(&hints[0].entity),
            PluginState::InstalledActive
        );
        assert_eq!(
            coordinator.get_state(&hints[1].entity),
            PluginState::InstalledInactive
        );
        let events = coordinator.events_for(&hints[0].entity);
        assert_eq!(events[0].source, TransitionSource::Discovery);
    }
}

//! Executor backed by shell command templates.

use repowatch_core::{CheckOutcome, EntityKey, Executor, ExecutorError};
use std::process::{Command, Output};
use tracing::debug;

/// Exit code a check command uses to say "not a plugin".
pub const NOT_PLUGIN_EXIT_CODE: i32 = 2;

/// Shell templates per operation. `{entity}`, `{owner}` and `{name}` are
/// substituted before the command runs under `sh -c`.
#[derive(Debug, Clone, Default)]
pub struct CommandTemplates {
    /// Scan command: exit 0 is available, exit 2 is not a plugin.
    pub check: Option<String>,
    /// Install command.
    pub install: Option<String>,
    /// Activate command.
    pub activate: Option<String>,
    /// Deactivate command.
    pub deactivate: Option<String>,
}

/// Runs operations as shell commands. An operation without a template
/// succeeds without doing anything, which makes the default a dry run.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    templates: CommandTemplates,
}

impl CommandExecutor {
    /// Creates an executor from templates.
    pub fn new(templates: CommandTemplates) -> Self {
        Self { templates }
    }

    /// Returns true if no operation has a template.
    pub fn is_dry_run(&self) -> bool {
        let t = &self.templates;
        t.check.is_none() && t.install.is_none() && t.activate.is_none() && t.deactivate.is_none()
    }

    fn run(&self, template: &str, entity: &EntityKey) -> Result<Output, ExecutorError> {
        let command = render(template, entity);
        debug!(entity = %entity, command = %command, "running executor command");
        Command::new("sh")
            .arg("-c")
            .arg(&command)
            .output()
            .map_err(|err| ExecutorError::new(format!("failed to run {command:?}: {err}")))
    }

    fn run_unit(&self, template: Option<&str>, entity: &EntityKey) -> Result<(), ExecutorError> {
        let Some(template) = template else {
            return Ok(());
        };
        let output = self.run(template, entity)?;
        if output.status.success() {
            Ok(())
        } else {
            Err(failure(&output))
        }
    }
}

fn render(template: &str, entity: &EntityKey) -> String {
    template
        .replace("{entity}", entity.as_str())
        .replace("{owner}", entity.owner())
        .replace("{name}", entity.name())
}

/// Builds an error from stderr, falling back to the exit status. The
/// message is classified downstream, so the tool's own wording is kept.
fn failure(output: &Output) -> ExecutorError {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    if stderr.is_empty() {
        ExecutorError::new(format!("command failed with {}", output.status))
    } else {
        ExecutorError::new(stderr.to_string())
    }
}

impl Executor for CommandExecutor {
    fn check(&self, entity: &EntityKey) -> Result<CheckOutcome, ExecutorError> {
        let Some(template) = self.templates.check.as_deref() else {
            return Ok(CheckOutcome::Available);
        };
        let output = self.run(template, entity)?;
        match output.status.code() {
            Some(0) => Ok(CheckOutcome::Available),
            Some(NOT_PLUGIN_EXIT_CODE) => Ok(CheckOutcome::NotPlugin),
            _ => Err(failure(&output)),
        }
    }

    fn install(&self, entity: &EntityKey) -> Result<(), ExecutorError> {
        self.run_unit(self.templates.install.as_deref(), entity)
    }

    fn activate(&self, entity: &EntityKey) -> Result<(), ExecutorError> {
        self.run_unit(self.templates.activate.as_deref(), entity)
    }

    fn deactivate(&self, entity: &EntityKey) -> Result<(), ExecutorError> {
        self.run_unit(self.templates.deactivate.as_deref(), entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn widget() -> EntityKey {
        EntityKey::parse("acme/widget").unwrap()
    }

    fn executor(templates: CommandTemplates) -> CommandExecutor {
        CommandExecutor::new(templates)
    }

    #[test]
    fn renders_placeholders() {
        assert_eq!(
            render("fetch {entity} --owner {owner} --name {name}", &widget()),
            "fetch acme/widget --owner acme --name widget"
        );
    }

    #[test]
    fn dry_run_succeeds() {
        let exec = executor(CommandTemplates::default());
        assert!(exec.is_dry_run());
        assert_eq!(exec.check(&widget()), Ok(CheckOutcome::Available));
        assert!(exec.install(&widget()).is_ok());
        assert!(exec.deactivate(&widget()).is_ok());
    }

    #[test]
    fn check_exit_codes() {
        let available = executor(CommandTemplates {
            check: Some("test {owner} = acme".into()),
            ..Default::default()
        });
        assert!(!available.is_dry_run());
        assert_eq!(available.check(&widget()), Ok(CheckOutcome::Available));

        let not_plugin = executor(CommandTemplates {
            check: Some("exit 2".into()),
            ..Default::default()
        });
        assert_eq!(not_plugin.check(&widget()), Ok(CheckOutcome::NotPlugin));

        let broken = executor(CommandTemplates {
            check: Some("echo 'connection timed out' >&2; exit 1".into()),
            ..Default::default()
        });
        assert_eq!(
            broken.check(&widget()).unwrap_err().message,
            "connection timed out"
        );
    }

    #[test]
    fn failure_without_stderr_reports_status() {
        let exec = executor(CommandTemplates {
            install: Some("exit 3".into()),
            ..Default::default()
        });
        let err = exec.install(&widget()).unwrap_err();
        assert!(err.message.starts_with("command failed with"));
        assert!(err.kind.is_none());
    }
}

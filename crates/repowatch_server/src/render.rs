//! Row fragments returned by the refresh endpoint.
//!
//! The engine treats the fragment as opaque; the renderer is the only place
//! metadata such as the protection flag influences what a viewer sees.

use repowatch_core::{EntitySnapshot, PluginState};
use serde_json::Value;

/// Metadata key marking an entity as protected from removal.
pub const PROTECTED_KEY: &str = "protected";

/// Renders one entity as a view fragment.
pub trait RowRenderer: Send + Sync {
    /// Renders the fragment.
    fn render(&self, snapshot: &EntitySnapshot) -> String;
}

/// Default renderer producing a table row.
#[derive(Debug, Default, Clone, Copy)]
pub struct HtmlRowRenderer;

impl HtmlRowRenderer {
    fn label(state: PluginState) -> &'static str {
        match state {
            PluginState::Unknown => "Not scanned",
            PluginState::Checking => "Checking",
            PluginState::Available => "Available",
            PluginState::NotPlugin => "Not a plugin",
            PluginState::Installing => "Installing",
            PluginState::InstalledInactive => "Installed",
            PluginState::InstalledActive => "Active",
            PluginState::Error => "Error",
        }
    }
}

impl RowRenderer for HtmlRowRenderer {
    fn render(&self, snapshot: &EntitySnapshot) -> String {
        let key = escape(snapshot.entity.as_str());
        let state = snapshot.state;
        let mut row = format!(
            r#"<tr data-repository="{key}" data-state="{state}"><td>{key}</td><td class="state state-{state}">{}</td>"#,
            Self::label(state)
        );

        let protected = snapshot
            .metadata
            .get(PROTECTED_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if protected {
            row.push_str(r#"<td class="badge">protected</td>"#);
        } else {
            row.push_str("<td></td>");
        }

        match &snapshot.error {
            Some(error) => {
                row.push_str(&format!(
                    r#"<td class="error severity-{}" title="{}">{}</td>"#,
                    error.severity.as_str(),
                    escape(&error.message),
                    escape(&error.guidance.title)
                ));
            }
            None => row.push_str("<td></td>"),
        }

        row.push_str("</tr>");
        row
    }
}

fn escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

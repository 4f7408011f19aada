//! Transitions command implementation.

use repowatch_core::{transition_table, PluginState};
use serde::Serialize;

/// One edge of the transition graph.
#[derive(Debug, Serialize)]
pub struct Edge {
    /// Source state.
    pub from: PluginState,
    /// Target state.
    pub to: PluginState,
}

/// Runs the transitions command.
pub fn run(format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let edges: Vec<Edge> = transition_table().map(|(from, to)| Edge { from, to }).collect();

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&edges)?),
        "text" => print!("{}", render_text(&edges)),
        other => return Err(format!("unknown format {other:?} (expected text or json)").into()),
    }
    Ok(())
}

fn render_text(edges: &[Edge]) -> String {
    let width = edges
        .iter()
        .map(|edge| edge.from.as_str().len())
        .max()
        .unwrap_or(0);

    let mut out = String::new();
    for edge in edges {
        out.push_str(&format!(
            "{:<width$}  ->  {}\n",
            edge.from.as_str(),
            edge.to.as_str()
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_lists_every_edge() {
        let edges: Vec<Edge> = transition_table().map(|(from, to)| Edge { from, to }).collect();
        let text = render_text(&edges);
        assert_eq!(text.lines().count(), edges.len());
        assert!(text.contains("installing"));
    }

    #[test]
    fn unknown_format_is_an_error() {
        assert!(run("yaml").is_err());
    }
}

//! Lifecycle states and the allowed-transition graph.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The lifecycle state of a tracked entity.
///
/// `Unknown` is the initial state. No state is terminal; `Error` is left
/// through a re-check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    /// Nothing is known yet; awaiting a scan.
    #[default]
    Unknown,
    /// A scan is in progress.
    Checking,
    /// The candidate is a plugin and can be installed.
    Available,
    /// The candidate turned out not to be a plugin.
    NotPlugin,
    /// An install is in progress.
    Installing,
    /// Installed but not active.
    InstalledInactive,
    /// Installed and active.
    InstalledActive,
    /// The last operation failed; see the entity's error context.
    Error,
}

impl PluginState {
    /// Every state, in declaration order.
    pub const ALL: [PluginState; 8] = [
        PluginState::Unknown,
        PluginState::Checking,
        PluginState::Available,
        PluginState::NotPlugin,
        PluginState::Installing,
        PluginState::InstalledInactive,
        PluginState::InstalledActive,
        PluginState::Error,
    ];

    /// Returns the states reachable from this one without forcing.
    pub fn allowed_transitions(self) -> &'static [PluginState] {
        use PluginState::*;
        match self {
            Unknown => &[
                Checking,
                Available,
                NotPlugin,
                Error,
                InstalledInactive,
                InstalledActive,
            ],
            Checking => &[Available, NotPlugin, Error],
            Available => &[Installing, InstalledInactive, Error],
            Installing => &[InstalledInactive, Error],
            InstalledInactive => &[InstalledActive, Error],
            InstalledActive => &[InstalledInactive, Error],
            NotPlugin => &[Checking, Available],
            Error => &[Checking, Available, NotPlugin],
        }
    }

    /// Returns true if `self -> target` is an edge of the transition graph.
    pub fn can_transition_to(self, target: PluginState) -> bool {
        self.allowed_transitions().contains(&target)
    }

    /// Returns true for states an entity can rest in without an operation
    /// in flight and without a failure.
    pub fn is_stable(self) -> bool {
        matches!(
            self,
            PluginState::Available
                | PluginState::NotPlugin
                | PluginState::InstalledInactive
                | PluginState::InstalledActive
        )
    }

    /// Returns true while a scan or install is running.
    pub fn is_in_progress(self) -> bool {
        matches!(self, PluginState::Checking | PluginState::Installing)
    }

    /// Returns the wire name of the state.
    pub fn as_str(self) -> &'static str {
        match self {
            PluginState::Unknown => "unknown",
            PluginState::Checking => "checking",
            PluginState::Available => "available",
            PluginState::NotPlugin => "not_plugin",
            PluginState::Installing => "installing",
            PluginState::InstalledInactive => "installed_inactive",
            PluginState::InstalledActive => "installed_active",
            PluginState::Error => "error",
        }
    }
}

/// Iterates every `(from, to)` edge of the transition graph.
pub fn transition_table() -> impl Iterator<Item = (PluginState, PluginState)> {
    PluginState::ALL.into_iter().flat_map(|from| {
        from.allowed_transitions()
            .iter()
            .map(move |to| (from, *to))
    })
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PluginState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        PluginState::ALL
            .into_iter()
            .find(|state| state.as_str() == normalized)
            .ok_or_else(|| CoreError::UnknownState(s.to_string()))
    }
}

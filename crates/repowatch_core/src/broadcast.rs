//! Fan-out of accepted transitions to live subscribers.
//!
//! The broadcaster is best-effort: a subscriber connected at publish time
//! receives the event, a subscriber that connects later only sees what the
//! event log still retains. Publishing never waits on subscribers; one that
//! falls more than the channel capacity behind skips the overflow.
//!
//! # Usage
//!
//! ```rust,ignore
//! let mut subscription = coordinator.subscribe(None);
//! while let Some(change) = subscription.recv().await {
//!     println!("{} {} -> {}", change.entity, change.from, change.to);
//! }
//! ```

use crate::entity::EntityKey;
use crate::event_log::EventLog;
use crate::state::PluginState;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::warn;

/// An accepted transition as seen by subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    /// Event log sequence of the transition.
    pub sequence: u64,
    /// Entity that changed.
    pub entity: EntityKey,
    /// Previous state.
    pub from: PluginState,
    /// New state.
    pub to: PluginState,
    /// When the state was written (unix millis).
    pub timestamp: u64,
}

/// Pushes every accepted transition to all current subscribers.
pub struct Broadcaster {
    sender: broadcast::Sender<StateChange>,
}

impl Broadcaster {
    /// Creates a broadcaster buffering up to `capacity` events per
    /// subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes a change and returns how many subscribers were reached.
    pub fn publish(&self, change: StateChange) -> usize {
        // No subscribers is not an error for a best-effort feed.
        self.sender.send(change).unwrap_or(0)
    }

    /// Subscribes with a replay of the effective transitions retained in
    /// `log` whose sequence is greater than `after`.
    ///
    /// The live receiver is opened before the log is read, and live events
    /// already covered by the replay are skipped, so the subscriber sees
    /// every event from the replay onward exactly once.
    pub fn subscribe(&self, log: &EventLog, after: Option<u64>) -> Subscription {
        let receiver = self.sender.subscribe();
        let replay: VecDeque<StateChange> = log.changes_since(after).into();
        let high_water = replay
            .back()
            .map(|c| c.sequence)
            .unwrap_or(0)
            .max(after.unwrap_or(0));

        Subscription {
            replay,
            receiver,
            high_water,
        }
    }

    /// Subscribes to live events only.
    pub fn subscribe_live(&self) -> Subscription {
        Subscription {
            replay: VecDeque::new(),
            receiver: self.sender.subscribe(),
            high_water: 0,
        }
    }

    /// Returns the number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// A subscriber's view of the change stream: replay first, then live.
pub struct Subscription {
    replay: VecDeque<StateChange>,
    receiver: broadcast::Receiver<StateChange>,
    high_water: u64,
}

impl Subscription {
    /// Waits for the next change. Returns `None` once the broadcaster is
    /// gone.
    pub async fn recv(&mut self) -> Option<StateChange> {
        if let Some(change) = self.replay.pop_front() {
            return Some(change);
        }

        loop {
            match self.receiver.recv().await {
                Ok(change) if change.sequence <= self.high_water => continue,
                Ok(change) => return Some(change),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "change subscriber lagged, events dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Returns the next change if one is ready.
    pub fn try_recv(&mut self) -> Option<StateChange> {
        if let Some(change) = self.replay.pop_front() {
            return Some(change);
        }

        loop {
            match self.receiver.try_recv() {
                Ok(change) if change.sequence <= self.high_water => continue,
                Ok(change) => return Some(change),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "change subscriber lagged, events dropped");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Returns how many replayed events are still pending.
    pub fn pending_replay(&self) -> usize {
        self.replay.len()
    }

    /// Converts the subscription into a stream of changes.
    pub fn into_stream(self) -> impl Stream<Item = StateChange> + Send + 'static {
        futures::stream::unfold(self, |mut subscription| async move {
            subscription
                .recv()
                .await
                .map(|change| (change, subscription))
        })
    }
}

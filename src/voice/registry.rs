//! Process-wide index of voice sessions by channel

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::session::{SessionDeps, VoiceSession};
use crate::Result;

/// Voice channel membership changes reported by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// A user joined the channel
    UserJoined {
        /// Channel id
        channel_id: String,
    },
    /// A user left; `remaining_users` counts humans still present
    UserLeft {
        /// Channel id
        channel_id: String,
        /// Users left in the channel
        remaining_users: usize,
    },
    /// Nobody is left in the channel
    ChannelEmpty {
        /// Channel id
        channel_id: String,
    },
}

/// One live session per channel
///
/// Sessions are created on join and torn down on leave or idle timeout. The
/// map is the only state shared between sessions.
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<VoiceSession>>,
    deps: SessionDeps,
}

impl SessionRegistry {
    /// Create an empty registry; every session gets a clone of `deps`
    #[must_use]
    pub fn new(deps: SessionDeps) -> Self {
        Self {
            sessions: DashMap::new(),
            deps,
        }
    }

    /// Session for a channel, creating it if needed
    ///
    /// Concurrent calls for the same channel return the same session.
    ///
    /// # Errors
    ///
    /// Returns error if a new session cannot be started
    pub fn get_or_create(&self, channel_id: &str) -> Result<Arc<VoiceSession>> {
        match self.sessions.entry(channel_id.to_string()) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let session = Arc::new(VoiceSession::spawn(channel_id, self.deps.clone())?);
                entry.insert(Arc::clone(&session));
                tracing::info!(channel = channel_id, "voice session registered");
                Ok(session)
            }
        }
    }

    /// Live session for a channel
    #[must_use]
    pub fn get(&self, channel_id: &str) -> Option<Arc<VoiceSession>> {
        self.sessions.get(channel_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Tear down a channel's session
    ///
    /// The entry leaves the map before teardown starts, so lookups never see a
    /// session that is shutting down. Returns whether a session existed.
    pub async fn remove(&self, channel_id: &str) -> bool {
        let Some((_, session)) = self.sessions.remove(channel_id) else {
            return false;
        };
        session.shutdown().await;
        tracing::info!(channel = channel_id, "voice session removed");
        true
    }

    /// Apply a membership change
    ///
    /// Returns the session if one is live after the change.
    ///
    /// # Errors
    ///
    /// Returns error if a session had to be created and could not start
    pub async fn handle(&self, event: LifecycleEvent) -> Result<Option<Arc<VoiceSession>>> {
        match event {
            LifecycleEvent::UserJoined { channel_id } => self.get_or_create(&channel_id).map(Some),
            LifecycleEvent::UserLeft {
                channel_id,
                remaining_users: 0,
            }
            | LifecycleEvent::ChannelEmpty { channel_id } => {
                self.remove(&channel_id).await;
                Ok(None)
            }
            LifecycleEvent::UserLeft { channel_id, .. } => Ok(self.get(&channel_id)),
        }
    }

    /// Remove sessions idle for at least `max_idle`
    ///
    /// Returns the channels that were reaped.
    pub async fn reap_idle(&self, max_idle: Duration) -> Vec<String> {
        let candidates: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().is_idle_for(max_idle))
            .map(|entry| entry.key().clone())
            .collect();

        let mut reaped = Vec::new();
        for channel_id in candidates {
            // Re-check under the shard lock; the session may have woken up
            let removed = self
                .sessions
                .remove_if(&channel_id, |_, session| session.is_idle_for(max_idle));
            if let Some((_, session)) = removed {
                session.shutdown().await;
                tracing::info!(channel = %channel_id, "reaped idle voice session");
                reaped.push(channel_id);
            }
        }
        reaped
    }

    /// Idle time after which the reaper tears a session down
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        self.deps.config.idle_timeout
    }

    /// Every `interval`, reap sessions idle past the configured idle timeout,
    /// until `cancel` fires
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let max_idle = self.idle_timeout();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        registry.reap_idle(max_idle).await;
                    }
                }
            }
            tracing::debug!("session reaper stopped");
        })
    }

    /// Tear down every session
    pub async fn shutdown_all(&self) {
        let channels: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        let sessions: Vec<Arc<VoiceSession>> = channels
            .iter()
            .filter_map(|id| self.sessions.remove(id).map(|(_, s)| s))
            .collect();
        let count = sessions.len();

        futures::future::join_all(sessions.iter().map(|s| s.shutdown())).await;
        tracing::info!(sessions = count, "all voice sessions shut down");
    }

    /// Number of live sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is live
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Channels with a live session
    #[must_use]
    pub fn channels(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }
}

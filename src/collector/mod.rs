// src/collector/mod.rs — Reconciliation loop
//
// Single task that owns every open session. Each poll tick diffs the live
// set against the open set and drives session open/update/close; chat events
// from the protocol reader arrive over the mpsc channel and are appended to
// the matching session. Because this task is the only owner of the session
// map, no lock ever guards a file handle.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::infra::config::Config;
use crate::infra::errors::CollectorError;
use crate::protocol::{ChatEvent, ChatTransport};
use crate::status::{LiveStatusSource, StreamInfo};
use crate::store::{Session, SessionStore, StreamSnapshot};

/// Floor on the gap before re-polling after a status fetch failure. A flapping
/// status API must not turn into a tight retry loop.
const MIN_STATUS_RETRY: Duration = Duration::from_secs(5);

pub struct Collector {
    config: Config,
    status: Arc<dyn LiveStatusSource>,
    chat: Arc<dyn ChatTransport>,
    store: SessionStore,
    sessions: HashMap<String, Session>,
    events: mpsc::Receiver<ChatEvent>,
}

impl Collector {
    pub fn new(
        config: Config,
        status: Arc<dyn LiveStatusSource>,
        chat: Arc<dyn ChatTransport>,
        store: SessionStore,
        events: mpsc::Receiver<ChatEvent>,
    ) -> Self {
        Self {
            config,
            status,
            chat,
            store,
            sessions: HashMap::new(),
            events,
        }
    }

    /// Main loop: poll ticks, inbound chat, and the shutdown signal. Runs
    /// until Ctrl+C, then closes every open session and disconnects.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let poll = Duration::from_secs(self.config.helix.poll_seconds);
        let mut ticker = tokio::time::interval(poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile().await {
                        // Status unknown is not "everyone went offline":
                        // leave all sessions untouched and retry later.
                        tracing::warn!("status poll failed, skipping tick: {e}");
                        ticker.reset_after(poll.max(MIN_STATUS_RETRY));
                    }
                }
                Some(event) = self.events.recv() => {
                    self.record_chat(event);
                }
                _ = &mut shutdown => {
                    tracing::info!("shutdown signal received");
                    break;
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// One poll tick: open sessions for newly-live channels, snapshot the
    /// still-live ones, close sessions for channels that went offline.
    /// Opens run before closes within a tick.
    pub async fn reconcile(&mut self) -> Result<(), CollectorError> {
        let live = self
            .status
            .live_status(&self.config.streams.channels)
            .await?;

        let live_set: BTreeSet<String> = live.keys().cloned().collect();
        let open_set: BTreeSet<String> = self.sessions.keys().cloned().collect();

        for channel in live_set.difference(&open_set) {
            let info = &live[channel];
            self.open_session(channel, info).await;
        }

        for channel in live_set.intersection(&open_set) {
            let info = &live[channel];
            if let Some(session) = self.sessions.get_mut(channel) {
                session.title = info.title.clone();
                session.game_name = info.game_name.clone();
                session.viewer_count = info.viewer_count;
                if let Err(e) = self.store.append_snapshot(session, &snapshot_row(info)) {
                    tracing::warn!(channel = %channel, "snapshot append failed: {e}");
                }
            }
        }

        for channel in open_set.difference(&live_set) {
            self.close_channel(channel).await;
        }

        Ok(())
    }

    async fn open_session(&mut self, channel: &str, info: &StreamInfo) {
        let mut session = match self.store.open_session(info) {
            Ok(s) => s,
            Err(e) => {
                // Retries naturally on the next tick while the channel is live.
                tracing::warn!(channel = %channel, "failed to open session: {e}");
                return;
            }
        };

        if let Err(e) = self.chat.join(channel).await {
            // Skip this channel for the tick; it retries on the next poll
            // while the channel is still live. The session is closed so its
            // metadata never claims a live capture that recorded no chat.
            tracing::warn!(channel = %channel, "join failed, skipping channel this tick: {e}");
            if let Err(e) = self.store.close_session(session, &now_utc()) {
                tracing::warn!(channel = %channel, "failed to close unjoined session: {e}");
            }
            return;
        }
        tokio::time::sleep(self.join_delay()).await;

        if let Err(e) = self.store.append_snapshot(&mut session, &snapshot_row(info)) {
            tracing::warn!(channel = %channel, "initial snapshot failed: {e}");
        }

        tracing::info!(
            channel = %channel,
            started_at = %info.started_at,
            title = %info.title,
            viewers = info.viewer_count,
            "went live, session opened"
        );
        self.sessions.insert(channel.to_string(), session);
    }

    async fn close_channel(&mut self, channel: &str) {
        let Some(session) = self.sessions.remove(channel) else {
            return;
        };

        if let Err(e) = self.chat.part(channel).await {
            tracing::warn!(channel = %channel, "part failed: {e}");
        }

        let ended_at = now_utc();
        if let Err(e) = self.store.close_session(session, &ended_at) {
            tracing::warn!(channel = %channel, "failed to close session: {e}");
        }
        tracing::info!(channel = %channel, ended_at = %ended_at, "went offline, session closed");
    }

    /// Append an inbound chat event to its channel's open session. Events for
    /// channels with no session are dropped: chat can arrive before the poll
    /// observes the live transition. Append failures are logged, never
    /// propagated; one bad write must not take down capture.
    pub fn record_chat(&mut self, event: ChatEvent) {
        match self.sessions.get_mut(&event.channel) {
            Some(session) => {
                if let Err(e) = self.store.append_chat(session, &event) {
                    tracing::warn!(channel = %event.channel, "chat append failed: {e}");
                }
            }
            None => {
                tracing::debug!(channel = %event.channel, "chat for channel with no open session, dropped");
            }
        }
    }

    /// Close every still-open session with a final end time, then disconnect.
    pub async fn shutdown(&mut self) {
        let ended_at = now_utc();
        let channels: Vec<String> = self.sessions.keys().cloned().collect();
        for channel in channels {
            if let Some(session) = self.sessions.remove(&channel) {
                let _ = self.chat.part(&channel).await;
                if let Err(e) = self.store.close_session(session, &ended_at) {
                    tracing::warn!(channel = %channel, "close failed during shutdown: {e}");
                }
            }
        }
        self.chat.close().await;
        tracing::info!("collector stopped");
    }

    /// Channels with an open session, sorted. Test/introspection hook.
    pub fn open_channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.sessions.keys().cloned().collect();
        channels.sort();
        channels
    }

    fn join_delay(&self) -> Duration {
        Duration::from_secs_f64(self.config.irc.join_delay_s.max(0.0))
    }
}

fn snapshot_row(info: &StreamInfo) -> StreamSnapshot {
    StreamSnapshot {
        timestamp_utc: now_utc(),
        title: info.title.clone(),
        game_name: info.game_name.clone(),
        viewer_count: info.viewer_count,
    }
}

fn now_utc() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

//! Heartbeat supervision of a liveness channel.
//!
//! The monitor sends `{"type":"ping"}` every `ping_interval` and declares the
//! channel dead when no `{"type":"pong"}` arrived within `timeout` of the last
//! one (or of channel open). Other traffic never resets the timer.
//!
//! The monitor is transport-agnostic: it drives any `Sink` of frames and any
//! `Stream` of parsed inbound messages.

use std::fmt::Display;
use std::future::Future;

use chrono::{DateTime, Utc};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::HeartbeatConfig;
use crate::slot::SlotId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    Ping,
    Pong,
}

/// Wire frame: `{"type": "ping"|"pong", "timestamp": <RFC 3339>}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatFrame {
    #[serde(rename = "type")]
    pub kind: FrameKind,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl HeartbeatFrame {
    pub fn ping(at: DateTime<Utc>) -> Self {
        Self {
            kind: FrameKind::Ping,
            timestamp: Some(at),
        }
    }

    pub fn pong(at: DateTime<Utc>) -> Self {
        Self {
            kind: FrameKind::Pong,
            timestamp: Some(at),
        }
    }
}

/// An inbound message after parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Frame(HeartbeatFrame),
    /// Anything that is not a heartbeat frame.
    Other,
}

impl Inbound {
    pub fn parse(text: &str) -> Self {
        serde_json::from_str::<HeartbeatFrame>(text)
            .map(Inbound::Frame)
            .unwrap_or(Inbound::Other)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    AwaitingFirstAck,
    Alive,
    TimedOut,
    Closed,
}

impl ChannelState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::TimedOut | Self::Closed)
    }
}

/// How a channel ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOutcome {
    /// No pong within the timeout
    TimedOut,
    /// Peer went away or the transport failed
    Closed,
    /// Superseded by a newer channel or stopped by shutdown
    Cancelled,
}

impl ChannelOutcome {
    /// Loss of liveness reclaims the slot; cancellation does not.
    pub fn requires_reclaim(&self) -> bool {
        matches!(self, Self::TimedOut | Self::Closed)
    }
}

/// Per-channel state machine. Termination is reported at most once.
#[derive(Debug)]
struct ChannelTracker {
    state: ChannelState,
    last_contact: Instant,
    reported: bool,
}

impl ChannelTracker {
    fn new(opened: Instant) -> Self {
        Self {
            state: ChannelState::AwaitingFirstAck,
            last_contact: opened,
            reported: false,
        }
    }

    fn ack(&mut self, at: Instant) {
        if self.state.is_terminal() {
            return;
        }
        self.state = ChannelState::Alive;
        self.last_contact = self.last_contact.max(at);
    }

    fn deadline(&self, timeout: std::time::Duration) -> Instant {
        self.last_contact + timeout
    }

    fn finish(&mut self, outcome: ChannelOutcome) -> Option<ChannelOutcome> {
        if self.reported {
            return None;
        }
        self.reported = true;
        match outcome {
            ChannelOutcome::TimedOut => self.state = ChannelState::TimedOut,
            ChannelOutcome::Closed | ChannelOutcome::Cancelled => {
                self.state = ChannelState::Closed;
            }
        }
        Some(outcome)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
}

impl HeartbeatMonitor {
    pub fn new(config: HeartbeatConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> HeartbeatConfig {
        self.config
    }

    /// Supervise one channel until it times out, closes or is cancelled.
    ///
    /// `on_ack` runs after every pong. A `ping` from the peer is answered with
    /// a `pong` but does not count as an acknowledgement.
    pub async fn run<Tx, Rx, E, F, Fut>(
        &self,
        slot: SlotId,
        tx: Tx,
        rx: Rx,
        cancel: CancellationToken,
        mut on_ack: F,
    ) -> ChannelOutcome
    where
        Tx: Sink<HeartbeatFrame>,
        Rx: Stream<Item = Result<Inbound, E>>,
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = ()>,
    {
        tokio::pin!(tx, rx);

        let opened = Instant::now();
        let mut tracker = ChannelTracker::new(opened);
        let mut pings = tokio::time::interval_at(
            opened + self.config.ping_interval,
            self.config.ping_interval,
        );
        pings.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::debug!(%slot, "Liveness channel opened");

        let outcome = loop {
            let deadline = tracker.deadline(self.config.timeout);
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break ChannelOutcome::Cancelled,

                _ = tokio::time::sleep_until(deadline) => {
                    tracing::info!(%slot, state = ?tracker.state, timeout = ?self.config.timeout, "Heartbeat timed out");
                    break ChannelOutcome::TimedOut;
                }

                msg = rx.next() => match msg {
                    Some(Ok(Inbound::Frame(frame))) => match frame.kind {
                        FrameKind::Pong => {
                            tracker.ack(Instant::now());
                            tracing::trace!(%slot, "Pong received");
                            on_ack().await;
                        }
                        FrameKind::Ping => {
                            if tx.send(HeartbeatFrame::pong(Utc::now())).await.is_err() {
                                break ChannelOutcome::Closed;
                            }
                        }
                    },
                    Some(Ok(Inbound::Other)) => {
                        tracing::trace!(%slot, "Ignoring non-heartbeat message");
                    }
                    Some(Err(e)) => {
                        tracing::debug!(%slot, error = %e, "Liveness channel failed");
                        break ChannelOutcome::Closed;
                    }
                    None => break ChannelOutcome::Closed,
                },

                _ = pings.tick() => {
                    if tx.send(HeartbeatFrame::ping(Utc::now())).await.is_err() {
                        break ChannelOutcome::Closed;
                    }
                }
            }
        };

        let _ = tx.close().await;
        let outcome = tracker.finish(outcome).unwrap_or(outcome);
        tracing::debug!(%slot, ?outcome, "Liveness channel ended");
        outcome
    }
}

//! Self-throttling for the export loop
//!
//! The controller combines two pacing rules (a fixed delay after every
//! message and a longer pause every N messages) with handling of provider
//! flood waits. It is owned by one pipeline run and passed by `&mut`, so
//! several exports can run side by side without sharing counters.
//!
//! Pauses are taken with `tokio::time`, which lets tests drive the controller
//! on a paused clock.

use crate::config::PacingConfig;
use crate::error::{Error, Result};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Where the controller is in its lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThrottlePhase {
    /// Nothing processed yet
    Idle,
    /// Processing messages
    Counting,
    /// Sleeping for pacing or a flood wait
    Paused,
}

/// Counters and the "next allowed time" watermark
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ThrottleState {
    /// Messages processed in this run
    pub processed: u64,
    /// Messages processed since the last pause of any kind
    pub since_pause: u64,
    /// Escalated flood waits seen since the last processed message
    pub consecutive_escalations: u32,
    /// Flood waits of any length seen since the last processed message
    pub consecutive_flood_waits: u32,
    /// Flood waits absorbed in this run
    pub flood_waits: u64,
    /// Earliest instant the next message may be processed
    pub next_allowed: Option<Instant>,
}

/// What the controller did with a provider flood wait
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThrottleDecision {
    /// Wait was below the auto-sleep threshold and has been slept through
    Resumed {
        /// Time slept
        waited: Duration,
    },
    /// Wait was at or above the threshold; the caller decides what to do
    Escalated {
        /// Suggested wait capped at the configured ceiling
        wait: Duration,
        /// Escalations seen in a row, including this one
        escalations: u32,
    },
    /// Too many flood waits in a row without progress; nothing was slept
    Stalled {
        /// Flood waits seen in a row, including this one
        waits: u32,
    },
}

/// Pacing state machine for one export run
#[derive(Debug)]
pub struct ThrottleController {
    config: PacingConfig,
    state: ThrottleState,
    phase: ThrottlePhase,
    cancel: CancellationToken,
}

impl ThrottleController {
    /// Create a controller; pauses end early if `cancel` fires
    pub fn new(config: PacingConfig, cancel: CancellationToken) -> Self {
        Self {
            config,
            state: ThrottleState::default(),
            phase: ThrottlePhase::Idle,
            cancel,
        }
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> ThrottlePhase {
        self.phase
    }

    /// Current counters
    pub fn state(&self) -> &ThrottleState {
        &self.state
    }

    /// Pacing configuration in effect
    pub fn config(&self) -> &PacingConfig {
        &self.config
    }

    /// Time left until the next message may be processed
    pub fn pending_pause(&self) -> Option<Duration> {
        let next = self.state.next_allowed?;
        let remaining = next.saturating_duration_since(Instant::now());
        (!remaining.is_zero()).then_some(remaining)
    }

    /// Wait until the watermark set by the previous message has passed
    ///
    /// Returns the time slept, or [`Error::Cancelled`] if the run was interrupted.
    pub async fn before_item(&mut self) -> Result<Duration> {
        let pause = self.pending_pause().unwrap_or_default();
        self.state.next_allowed = None;
        if !pause.is_zero() {
            self.pause(pause).await?;
        } else if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(pause)
    }

    /// Record one processed message and schedule the pacing delay for the next one
    ///
    /// The fixed per-message delay and the periodic pause are evaluated
    /// independently; when both fire on the same message their delays add up.
    pub fn after_item(&mut self) -> Duration {
        self.phase = ThrottlePhase::Counting;
        self.state.processed += 1;
        self.state.since_pause += 1;
        self.state.consecutive_escalations = 0;
        self.state.consecutive_flood_waits = 0;

        let mut delay = self.config.sleep_per_message;
        if self.config.sleep_every > 0
            && !self.config.sleep_every_duration.is_zero()
            && self.state.processed % self.config.sleep_every == 0
        {
            tracing::debug!(
                processed = self.state.processed,
                pause_secs = self.config.sleep_every_duration.as_secs_f64(),
                "Periodic pause due"
            );
            delay += self.config.sleep_every_duration;
        }

        if !delay.is_zero() {
            self.state.next_allowed = Some(Instant::now() + delay);
        }
        delay
    }

    /// Whether a flood wait of `suggested` would be slept through by
    /// [`on_provider_throttle`](Self::on_provider_throttle)
    pub fn sleeps_through(&self, suggested: Duration) -> bool {
        suggested < self.config.flood_threshold
            && self.state.consecutive_flood_waits < self.config.max_consecutive_flood_waits
    }

    /// Handle a flood wait signalled by the provider
    ///
    /// Waits below `flood_threshold` are slept through here, unless more than
    /// `max_consecutive_flood_waits` arrived without a message getting
    /// through, which is reported as stalled. Longer waits are reported as
    /// escalated, capped at `flood_wait_ceiling`, without sleeping.
    pub async fn on_provider_throttle(&mut self, suggested: Duration) -> Result<ThrottleDecision> {
        let sleeps = self.sleeps_through(suggested);
        self.state.flood_waits += 1;
        self.state.consecutive_flood_waits += 1;

        if suggested < self.config.flood_threshold && !sleeps {
            tracing::warn!(
                wait_secs = suggested.as_secs_f64(),
                waits = self.state.consecutive_flood_waits,
                "Provider keeps asking to wait without progress"
            );
            return Ok(ThrottleDecision::Stalled {
                waits: self.state.consecutive_flood_waits,
            });
        }

        if sleeps {
            tracing::info!(
                wait_secs = suggested.as_secs_f64(),
                "Provider flood wait, sleeping"
            );
            self.pause(suggested).await?;
            return Ok(ThrottleDecision::Resumed { waited: suggested });
        }

        self.state.consecutive_escalations += 1;
        let wait = suggested.min(self.config.flood_wait_ceiling);
        tracing::warn!(
            suggested_secs = suggested.as_secs_f64(),
            wait_secs = wait.as_secs_f64(),
            escalations = self.state.consecutive_escalations,
            "Provider flood wait above auto-sleep threshold"
        );
        Ok(ThrottleDecision::Escalated {
            wait,
            escalations: self.state.consecutive_escalations,
        })
    }

    /// Sleep for `duration`, ending early with [`Error::Cancelled`] on interrupt
    pub async fn pause(&mut self, duration: Duration) -> Result<()> {
        self.phase = ThrottlePhase::Paused;
        let outcome = tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
        };
        self.state.since_pause = 0;
        self.phase = ThrottlePhase::Counting;
        outcome
    }
}

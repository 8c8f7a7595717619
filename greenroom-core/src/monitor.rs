//! Audio level monitoring
//!
//! Samples frequency-domain energy from a local audio track at a fixed
//! cadence to drive a 0–100 level estimate for UI feedback, and raises a
//! talking-while-muted signal when energy crosses a threshold on a
//! disabled track. Purely advisory: nothing here ever unmutes anyone.

use crate::media::AudioTrack;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Monitor configuration
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Sampling cadence
    pub cadence: Duration,
    /// Number of spectrum bins averaged into the estimate
    pub bins: usize,
    /// Level at or above which a muted track is considered "talking"
    pub muted_threshold: u8,
    /// Spectrum-to-level gain
    pub gain: f32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            cadence: Duration::from_millis(100),
            bins: 16,
            muted_threshold: 20,
            gain: 2000.0,
        }
    }
}

/// Advisory monitor events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorEvent {
    /// Energy detected while the track is disabled
    TalkingWhileMuted {
        /// The level estimate that crossed the threshold
        level: u8,
    },
}

/// Estimate a 0–100 level from a sample window
///
/// A coarse DFT: magnitudes at `bins` evenly spaced frequencies, averaged
/// and scaled by `gain`. Coarse is enough — this feeds a meter, not a
/// codec.
#[must_use]
pub fn estimate_level(window: &[f32], bins: usize, gain: f32) -> u8 {
    if window.is_empty() || bins == 0 {
        return 0;
    }
    let n = window.len();
    let mut total = 0.0f32;
    for k in 1..=bins {
        let mut re = 0.0f32;
        let mut im = 0.0f32;
        for (i, sample) in window.iter().enumerate() {
            let angle = -2.0 * std::f32::consts::PI * k as f32 * i as f32 / n as f32;
            re += sample * angle.cos();
            im += sample * angle.sin();
        }
        total += (re * re + im * im).sqrt() / n as f32;
    }
    let level = total / bins as f32 * gain;
    level.clamp(0.0, 100.0) as u8
}

/// Handle on a running monitor
#[derive(Debug)]
pub struct MonitorHandle {
    shutdown: watch::Sender<bool>,
    level_rx: watch::Receiver<u8>,
}

impl MonitorHandle {
    /// Latest level estimate
    #[must_use]
    pub fn level(&self) -> u8 {
        *self.level_rx.borrow()
    }

    /// Subscribe to level updates
    #[must_use]
    pub fn watch_level(&self) -> watch::Receiver<u8> {
        self.level_rx.clone()
    }

    /// Stop the sampling loop
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Per-track level monitor
pub struct AudioLevelMonitor {
    config: MonitorConfig,
}

impl AudioLevelMonitor {
    /// Create a monitor
    #[must_use]
    pub fn new(config: MonitorConfig) -> Self {
        Self { config }
    }

    /// Start sampling `track`
    ///
    /// The talking-while-muted signal fires on the rising edge only, so a
    /// sustained loud passage produces one event, not one per sample.
    #[must_use]
    pub fn start(&self, track: AudioTrack) -> (MonitorHandle, mpsc::UnboundedReceiver<MonitorEvent>) {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let (level_tx, level_rx) = watch::channel(0u8);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let config = self.config.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(config.cadence);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut was_over = false;
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        let window = track.latest_window();
                        let level = estimate_level(&window, config.bins, config.gain);
                        let _ = level_tx.send(level);

                        let over = level >= config.muted_threshold;
                        if over && !was_over && !track.is_enabled() {
                            tracing::debug!(level, "energy on muted microphone");
                            let _ = event_tx.send(MonitorEvent::TalkingWhileMuted { level });
                        }
                        was_over = over;
                    }
                }
            }
        });

        (
            MonitorHandle {
                shutdown: shutdown_tx,
                level_rx,
            },
            event_rx,
        )
    }
}

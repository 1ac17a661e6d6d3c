//! Spectrum Sampler: per-frame reduction of the audio tap into 16 levels.
//!
//! Active only while a source is playing.  Each activation gets a fresh
//! epoch; frame ticks carry the epoch they were armed with and are discarded
//! once the sampler has been stopped or restarted, so a tick already queued
//! when playback stops can never overwrite the zeroed levels.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tuner_proto::protocol::{AudioLevels, LEVEL_BANDS};

/// Read-only frequency-domain view of the audio output.
pub trait SpectrumTap: Send + Sync {
    /// Replace `bins` with the latest magnitude buffer (lowest frequency first).
    fn read(&self, bins: &mut Vec<f32>);

    /// Largest value a bin can hold.
    fn max_value(&self) -> f32;
}

/// Tap for outputs with no analysis path: always empty, levels stay at zero.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentTap;

impl SpectrumTap for SilentTap {
    fn read(&self, bins: &mut Vec<f32>) {
        bins.clear();
    }

    fn max_value(&self) -> f32 {
        1.0
    }
}

/// Pick 16 evenly spaced bins across the lowest three quarters of the range
/// and normalise them against `max_value`.
pub fn reduce_levels(bins: &[f32], max_value: f32) -> AudioLevels {
    let mut levels = [0.0; LEVEL_BANDS];
    if bins.is_empty() || !(max_value > 0.0) {
        return levels;
    }
    let usable = bins.len() * 3 / 4;
    for (i, level) in levels.iter_mut().enumerate() {
        let idx = i * usable / LEVEL_BANDS;
        let raw = bins.get(idx).copied().unwrap_or(0.0);
        *level = (raw / max_value).clamp(0.0, 1.0);
    }
    levels
}

pub struct SpectrumSampler {
    tap: Arc<dyn SpectrumTap>,
    frame_interval: Duration,
    levels: AudioLevels,
    epoch: u64,
    ticker: Option<CancellationToken>,
    scratch: Vec<f32>,
}

impl SpectrumSampler {
    pub fn new(tap: Arc<dyn SpectrumTap>, frame_interval: Duration) -> Self {
        Self {
            tap,
            frame_interval,
            levels: [0.0; LEVEL_BANDS],
            epoch: 0,
            ticker: None,
            scratch: Vec::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.ticker.is_some()
    }

    pub fn levels(&self) -> AudioLevels {
        self.levels
    }

    /// Arm the frame ticker.  `wrap` builds the frame message for `sink`.
    pub fn start<M: Send + 'static>(&mut self, sink: mpsc::Sender<M>, wrap: fn(u64) -> M) {
        if self.ticker.is_some() {
            return;
        }
        self.epoch = self.epoch.wrapping_add(1);
        let token = CancellationToken::new();
        debug!("spectrum: sampling started (epoch {})", self.epoch);
        tokio::spawn(run_ticker(
            sink,
            wrap,
            self.epoch,
            self.frame_interval,
            token.clone(),
        ));
        self.ticker = Some(token);
    }

    /// Halt future frames and reset the levels to silence.
    pub fn stop(&mut self) {
        if let Some(token) = self.ticker.take() {
            token.cancel();
            debug!("spectrum: sampling stopped (epoch {})", self.epoch);
        }
        self.epoch = self.epoch.wrapping_add(1);
        self.levels = [0.0; LEVEL_BANDS];
    }

    /// Handle one frame tick.  Returns the new levels, or `None` for a tick
    /// that belongs to a stopped activation.
    pub fn on_frame(&mut self, epoch: u64) -> Option<AudioLevels> {
        if self.ticker.is_none() || epoch != self.epoch {
            return None;
        }
        self.tap.read(&mut self.scratch);
        self.levels = reduce_levels(&self.scratch, self.tap.max_value());
        Some(self.levels)
    }
}

impl Drop for SpectrumSampler {
    fn drop(&mut self) {
        if let Some(token) = self.ticker.take() {
            token.cancel();
        }
    }
}

async fn run_ticker<M: Send + 'static>(
    sink: mpsc::Sender<M>,
    wrap: fn(u64) -> M,
    epoch: u64,
    frame_interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(frame_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                // Frames are lossy: a busy loop just skips one.
                match sink.try_send(wrap(epoch)) {
                    Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FixedTap;

    #[test]
    fn test_band_indices_cover_lowest_three_quarters() {
        // bin value == its own index, so each level reveals the picked index
        let bins: Vec<f32> = (0..1024).map(|i| i as f32).collect();
        let levels = reduce_levels(&bins, 1024.0);
        for (i, level) in levels.iter().enumerate() {
            let expected = (i * 768 / 16) as f32 / 1024.0;
            assert!((level - expected).abs() < 1e-6, "band {}", i);
        }
        assert_eq!(levels[15] * 1024.0, 720.0);
    }

    #[test]
    fn test_levels_normalised_and_clamped() {
        let bins = vec![255.0; 64];
        assert_eq!(reduce_levels(&bins, 255.0), [1.0; LEVEL_BANDS]);
        let hot = vec![400.0; 64];
        assert_eq!(reduce_levels(&hot, 255.0), [1.0; LEVEL_BANDS]);
    }

    #[test]
    fn test_empty_or_degenerate_tap_is_silent() {
        assert_eq!(reduce_levels(&[], 255.0), [0.0; LEVEL_BANDS]);
        assert_eq!(reduce_levels(&[10.0; 8], 0.0), [0.0; LEVEL_BANDS]);
        // fewer bins than bands: indices repeat, never out of range
        let levels = reduce_levels(&[255.0, 0.0, 0.0, 0.0], 255.0);
        assert_eq!(levels[0], 1.0);
    }

    #[tokio::test]
    async fn test_stop_zeroes_and_rejects_queued_frames() {
        let tap = Arc::new(FixedTap::new(vec![128.0; 256], 255.0));
        let mut sampler = SpectrumSampler::new(tap, Duration::from_millis(5));
        let (tx, mut rx) = mpsc::channel(64);
        sampler.start(tx, |epoch| epoch);

        let epoch = rx.recv().await.unwrap();
        let levels = sampler.on_frame(epoch).expect("live frame publishes");
        assert!(levels.iter().all(|l| *l > 0.0));

        sampler.stop();
        assert_eq!(sampler.levels(), [0.0; LEVEL_BANDS]);
        assert!(!sampler.is_active());
        assert!(sampler.on_frame(epoch).is_none());
        assert_eq!(sampler.levels(), [0.0; LEVEL_BANDS]);
    }

    #[tokio::test]
    async fn test_restart_ignores_previous_epoch() {
        let tap = Arc::new(FixedTap::new(vec![200.0; 64], 255.0));
        let mut sampler = SpectrumSampler::new(tap, Duration::from_millis(5));
        let (tx, mut rx) = mpsc::channel(64);
        sampler.start(tx.clone(), |epoch| epoch);
        let old = rx.recv().await.unwrap();
        sampler.stop();
        sampler.start(tx, |epoch| epoch);
        assert!(sampler.on_frame(old).is_none());
    }
}

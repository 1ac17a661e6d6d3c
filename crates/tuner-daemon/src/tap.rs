//! FFT spectrum tap fed by an ffmpeg PCM capture of the playing stream.
//!
//! ```text
//!   attach(url) ──► capture task: ffmpeg -i url → mono s16le → SampleWindow (last fft_size samples)
//!   read()      ──► Hann window → forward FFT → |X[k]| / N → dB → 0..=255 for k < fft_size/2
//! ```

use std::collections::VecDeque;
use std::f32::consts::PI;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::task::AbortHandle;
use tracing::{debug, info};
use tuner_core::SpectrumTap;

const CAPTURE_SAMPLE_RATE: u32 = 44100;
const READ_CHUNK_BYTES: usize = 4096;
/// dB range mapped onto 0..=255.
const MIN_DB: f32 = -100.0;
const MAX_DB: f32 = -30.0;
const BYTE_MAX: f32 = 255.0;

/// Ring of the most recent mono samples in [-1, 1].
struct SampleWindow {
    samples: VecDeque<f32>,
    capacity: usize,
}

impl SampleWindow {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push_pcm(&mut self, pcm: &[u8]) {
        for pair in pcm.chunks_exact(2) {
            if self.samples.len() == self.capacity {
                self.samples.pop_front();
            }
            let sample = i16::from_le_bytes([pair[0], pair[1]]);
            self.samples.push_back(sample as f32 / 32768.0);
        }
    }

    fn clear(&mut self) {
        self.samples.clear();
    }
}

pub struct FftTap {
    fft_size: usize,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    samples: Arc<Mutex<SampleWindow>>,
    capture: Mutex<Option<AbortHandle>>,
}

impl FftTap {
    pub fn new(fft_size: usize) -> Self {
        let fft_size = fft_size.max(32);
        let fft = FftPlanner::new().plan_fft_forward(fft_size);
        Self {
            fft_size,
            fft,
            window: (0..fft_size).map(|i| hann_window(i, fft_size)).collect(),
            samples: Arc::new(Mutex::new(SampleWindow::new(fft_size))),
            capture: Mutex::new(None),
        }
    }

    /// Start capturing `url`, replacing any previous capture.
    pub fn attach(&self, url: &str) {
        self.detach();
        info!("tap: capturing {}", url);
        let url = url.to_string();
        let samples = Arc::clone(&self.samples);
        let task = tokio::spawn(async move {
            loop {
                if let Err(e) = run_pcm_capture(&url, &samples).await {
                    debug!("tap: ffmpeg exited: {e}");
                }
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        });
        if let Ok(mut capture) = self.capture.lock() {
            *capture = Some(task.abort_handle());
        }
    }

    pub fn detach(&self) {
        if let Some(task) = self.capture.lock().ok().and_then(|mut c| c.take()) {
            task.abort();
            debug!("tap: capture stopped");
        }
        if let Ok(mut samples) = self.samples.lock() {
            samples.clear();
        }
    }

    /// Byte-scale magnitudes for one block of samples (zero padded).
    fn analyse(&self, samples: &[f32], bins: &mut Vec<f32>) {
        let mut buffer: Vec<Complex<f32>> = self
            .window
            .iter()
            .enumerate()
            .map(|(i, w)| Complex::new(samples.get(i).copied().unwrap_or(0.0) * w, 0.0))
            .collect();
        self.fft.process(&mut buffer);

        let scale = 1.0 / self.fft_size as f32;
        bins.extend(buffer[..self.fft_size / 2].iter().map(|c| {
            let db = 20.0 * (c.norm() * scale).max(1e-10).log10();
            ((db - MIN_DB) / (MAX_DB - MIN_DB) * BYTE_MAX).clamp(0.0, BYTE_MAX)
        }));
    }
}

impl SpectrumTap for FftTap {
    fn read(&self, bins: &mut Vec<f32>) {
        bins.clear();
        let block: Vec<f32> = match self.samples.lock() {
            Ok(window) if !window.samples.is_empty() => window.samples.iter().copied().collect(),
            _ => return,
        };
        self.analyse(&block, bins);
    }

    fn max_value(&self) -> f32 {
        BYTE_MAX
    }
}

impl Drop for FftTap {
    fn drop(&mut self) {
        self.detach();
    }
}

pub fn hann_window(index: usize, size: usize) -> f32 {
    0.5 * (1.0 - ((2.0 * PI * index as f32) / (size as f32 - 1.0)).cos())
}

async fn run_pcm_capture(url: &str, samples: &Mutex<SampleWindow>) -> anyhow::Result<()> {
    let rate = CAPTURE_SAMPLE_RATE.to_string();
    let ffmpeg_bin =
        tuner_proto::platform::find_ffmpeg_binary().unwrap_or_else(|| PathBuf::from("ffmpeg"));
    let mut child = Command::new(ffmpeg_bin)
        .args([
            "-hide_banner",
            "-loglevel",
            "error",
            "-nostdin",
            "-fflags",
            "nobuffer",
            "-flags",
            "low_delay",
            "-probesize",
            "64k",
            "-analyzeduration",
            "200000",
            "-i",
            url,
            "-vn",
            "-ac",
            "1",
            "-ar",
            &rate,
            "-f",
            "s16le",
            "pipe:1",
        ])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow::anyhow!("ffmpeg stdout not captured"))?;
    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    let mut carry: Option<u8> = None;

    loop {
        let n = stdout.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        // keep sample alignment when a read splits an i16
        let mut chunk = Vec::with_capacity(n + 1);
        chunk.extend(carry.take());
        chunk.extend_from_slice(&buf[..n]);
        if chunk.len() % 2 == 1 {
            carry = chunk.pop();
        }
        if let Ok(mut window) = samples.lock() {
            window.push_pcm(&chunk);
        }
    }

    let status = child.wait().await?;
    if !status.success() {
        anyhow::bail!("ffmpeg exited: {}", status);
    }
    Ok(())
}

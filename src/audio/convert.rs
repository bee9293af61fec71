//! PCM format conversion between heterogeneous provider formats.
//!
//! Providers disagree on sample rate and channel count. The converter
//! bridges them: resample first, then rechannel. Conversion never pads a
//! mis-aligned payload; odd-length frames are dropped by emitting an empty
//! frame tagged with the target format.

use std::time::Duration;

use tokio::sync::mpsc;

use super::AudioFrame;

// ── Converter ────────────────────────────────────────────────────

/// Stateful PCM converter keyed to one target `(sample_rate, channels)`.
pub struct FormatConverter {
    target_rate: u32,
    target_channels: u16,
    warned_odd: bool,
}

impl FormatConverter {
    /// Create a converter for the given target format.
    pub fn new(target_rate: u32, target_channels: u16) -> Self {
        Self {
            target_rate,
            target_channels,
            warned_odd: false,
        }
    }

    /// Target sample rate in Hz.
    pub fn target_rate(&self) -> u32 {
        self.target_rate
    }

    /// Target channel count.
    pub fn target_channels(&self) -> u16 {
        self.target_channels
    }

    /// Convert one frame to the target format.
    ///
    /// A frame already in the target format is returned as-is without
    /// copying. A frame with an odd byte length is replaced by an empty
    /// frame bearing the target format fields.
    pub fn convert(&mut self, frame: AudioFrame) -> AudioFrame {
        if frame.sample_rate == self.target_rate && frame.channels == self.target_channels {
            return frame;
        }

        if frame.data.len() % 2 != 0 {
            if !self.warned_odd {
                self.warned_odd = true;
                tracing::warn!(
                    len = frame.data.len(),
                    sample_rate = frame.sample_rate,
                    channels = frame.channels,
                    "dropping PCM frame with odd byte length"
                );
            }
            return AudioFrame::empty(self.target_rate, self.target_channels, frame.timestamp);
        }

        let samples = bytes_to_samples(&frame.data);
        let resampled = resample(&samples, frame.channels, frame.sample_rate, self.target_rate);
        let rechanneled = rechannel(&resampled, frame.channels, self.target_channels);

        AudioFrame::new(
            samples_to_bytes(&rechanneled),
            self.target_rate,
            self.target_channels,
            frame.timestamp,
        )
    }
}

// ── Streaming wrapper ────────────────────────────────────────────

/// Convert every frame arriving on `input` to the target format.
///
/// Dropped (empty) frames are omitted from the output. The output channel
/// has the same capacity as the input channel and closes when the input
/// closes.
pub fn convert_stream(
    mut input: mpsc::Receiver<AudioFrame>,
    target_rate: u32,
    target_channels: u16,
) -> mpsc::Receiver<AudioFrame> {
    let (tx, rx) = mpsc::channel(input.max_capacity());
    tokio::spawn(async move {
        let mut converter = FormatConverter::new(target_rate, target_channels);
        while let Some(frame) = input.recv().await {
            let converted = converter.convert(frame);
            if converted.is_empty() {
                continue;
            }
            if tx.send(converted).await.is_err() {
                break;
            }
        }
    });
    rx
}

// ── PCM primitives ───────────────────────────────────────────────

fn bytes_to_samples(data: &[u8]) -> Vec<i16> {
    data.chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// Linear-interpolation resampling over interleaved PCM.
fn resample(samples: &[i16], channels: u16, from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || samples.is_empty() || channels == 0 {
        return samples.to_vec();
    }

    let ch = channels as usize;
    let in_frames = samples.len() / ch;
    if in_frames == 0 {
        return Vec::new();
    }
    let out_frames = (in_frames as u64 * to_rate as u64 / from_rate as u64) as usize;
    let mut out = Vec::with_capacity(out_frames * ch);

    for i in 0..out_frames {
        let pos = i as f64 * from_rate as f64 / to_rate as f64;
        let idx = pos as usize;
        let frac = pos - idx as f64;
        let next = (idx + 1).min(in_frames - 1);
        for c in 0..ch {
            let a = samples[idx * ch + c] as f64;
            let b = samples[next * ch + c] as f64;
            out.push((a + (b - a) * frac).round() as i16);
        }
    }
    out
}

/// Channel-count conversion over interleaved PCM.
///
/// Mono to stereo duplicates each sample into L+R; stereo to mono averages
/// L and R in i32 and clamps to the signed-16 range.
fn rechannel(samples: &[i16], from: u16, to: u16) -> Vec<i16> {
    match (from, to) {
        (f, t) if f == t => samples.to_vec(),
        (1, 2) => {
            let mut out = Vec::with_capacity(samples.len() * 2);
            for &s in samples {
                out.push(s);
                out.push(s);
            }
            out
        }
        (2, 1) => {
            let mut out = Vec::with_capacity(samples.len() / 2);
            for pair in samples.chunks_exact(2) {
                let mixed = (pair[0] as i32 + pair[1] as i32) / 2;
                out.push(mixed.clamp(i16::MIN as i32, i16::MAX as i32) as i16);
            }
            out
        }
        _ => {
            // Unusual layouts: collapse to mono, then fan out.
            let mono = downmix(samples, from);
            if to == 1 {
                mono
            } else {
                let mut out = Vec::with_capacity(mono.len() * to as usize);
                for s in mono {
                    for _ in 0..to {
                        out.push(s);
                    }
                }
                out
            }
        }
    }
}

fn downmix(samples: &[i16], channels: u16) -> Vec<i16> {
    let ch = channels.max(1) as usize;
    samples
        .chunks_exact(ch)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / ch as i32).clamp(i16::MIN as i32, i16::MAX as i32) as i16
        })
        .collect()
}

// ── Tests ────────────────────────────────────────────────────────

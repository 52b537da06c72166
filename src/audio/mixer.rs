//! Mixes one quantum from every active audio stream into one output quantum

use crate::audio::{AudioFormat, AudioRingBuffer};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

/// Sums the current unit of every active audio ring buffer into a
/// single output unit at the configured channel count and bit depth.
///
/// Streams may be mono or stereo; mono inputs are duplicated to both
/// output slots, stereo inputs are pair-averaged down to mono. Sums are
/// accumulated wide and clipped to the signed range of the output bit
/// depth. No state is kept across calls beyond the working buffer.
pub struct AudioMixer {
    sample_rate: u32,
    target_channels: u16,
    bits_per_sample: u16,
    acc: Vec<i64>,
}

impl AudioMixer {
    pub fn new(sample_rate: u32, target_channels: u16, bits_per_sample: u16) -> Self {
        Self {
            sample_rate,
            target_channels,
            bits_per_sample,
            acc: Vec::new(),
        }
    }

    /// The format of the quanta this mixer emits
    pub fn output_format(&self) -> AudioFormat {
        AudioFormat::pcm(self.sample_rate, self.target_channels, self.bits_per_sample)
    }

    /// Pull one ready unit from every buffer and mix them.
    ///
    /// Fails the whole call if any buffer has no ready unit; the
    /// dispatch loop only calls this once every buffer reports ready
    /// for a matching timestamp. Disagreeing timestamps are a
    /// reportable anomaly: logged, then the minimum is used.
    pub fn mix(
        &mut self,
        buffers: &BTreeMap<usize, Arc<AudioRingBuffer>>,
    ) -> Option<(Vec<u8>, u64)> {
        if buffers.is_empty() {
            return None;
        }

        let frames = self.sample_rate as usize;
        let slots = frames * self.target_channels as usize;
        self.acc.clear();
        self.acc.resize(slots, 0);

        let mut out_ts: Option<u64> = None;
        let mut mismatch = false;
        let target_channels = self.target_channels;
        let bits = self.bits_per_sample;
        let acc = &mut self.acc;

        for (index, buffer) in buffers {
            let channels = buffer.format().channels;
            let pulled = buffer
                .read_with(|bytes, ts| {
                    match out_ts {
                        None => out_ts = Some(ts),
                        Some(prev) if prev != ts => {
                            mismatch = true;
                            out_ts = Some(prev.min(ts));
                        }
                        _ => {}
                    }
                    accumulate(acc, bytes, channels, target_channels, bits);
                })
                .is_some();
            if !pulled {
                warn!("Mixer: audio stream {} had no ready unit", index);
                return None;
            }
        }

        if mismatch {
            warn!("Mixer: input quanta disagree on timestamp, using the minimum");
        }

        let clip = (1i64 << (bits - 1)) - 1;
        let bytes_per_sample = (bits / 8) as usize;
        let mut out = Vec::with_capacity(slots * bytes_per_sample);
        for &sum in acc.iter() {
            let clipped = sum.clamp(-clip, clip);
            out.extend_from_slice(&clipped.to_le_bytes()[..bytes_per_sample]);
        }

        Some((out, out_ts.unwrap_or(0)))
    }
}

/// Add one input unit into the accumulator, converting channel count
fn accumulate(acc: &mut [i64], bytes: &[u8], channels: u16, target_channels: u16, bits: u16) {
    let bytes_per_sample = (bits / 8) as usize;
    let frame_bytes = channels as usize * bytes_per_sample;
    if frame_bytes == 0 {
        return;
    }
    let frames = (bytes.len() / frame_bytes).min(acc.len() / target_channels as usize);
    let ct = target_channels as usize;

    for i in 0..frames {
        match (channels, target_channels) {
            (1, 2) => {
                let s = read_sample(bytes, i, bits);
                acc[i * 2] += s;
                acc[i * 2 + 1] += s;
            }
            (2, 1) => {
                let l = read_sample(bytes, i * 2, bits);
                let r = read_sample(bytes, i * 2 + 1, bits);
                acc[i] += (l + r) / 2;
            }
            _ => {
                for c in 0..ct.min(channels as usize) {
                    acc[i * ct + c] += read_sample(bytes, i * channels as usize + c, bits);
                }
            }
        }
    }
}

/// Read the n-th signed little-endian sample from raw bytes
fn read_sample(bytes: &[u8], n: usize, bits: u16) -> i64 {
    match bits {
        8 => bytes[n] as i8 as i64,
        16 => {
            let o = n * 2;
            i16::from_le_bytes([bytes[o], bytes[o + 1]]) as i64
        }
        32 => {
            let o = n * 4;
            i32::from_le_bytes([bytes[o], bytes[o + 1], bytes[o + 2], bytes[o + 3]]) as i64
        }
        _ => 0,
    }
}

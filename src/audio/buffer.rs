//! Quantizing ring buffer for one audio stream

use crate::audio::AudioFormat;
use crate::error::{AvmuxError, Result};
use crate::sync::ResetGate;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Duration of one quantized audio unit in milliseconds
pub const QUANTUM_MS: u64 = 1000;

/// Drift beyond this margin triggers skip/starve handling
const DRIFT_THRESHOLD_MS: u64 = 250;

/// Consecutive ahead-of-clock ticks before writes start being dropped
const SKIP_TRIGGER_TICKS: u32 = 10;

/// Consecutive behind-the-clock ticks before silence is injected
const STARVE_TRIGGER_TICKS: u32 = 5;

/// Fixed-capacity circular store of one-second audio units.
///
/// Producers append raw bytes at any granularity; the buffer quantizes
/// them into `bytes_per_second`-sized units, each stamped with a
/// stream-relative presentation time. Drift against the session clock
/// is corrected by dropping writes (stream running ahead) or injecting
/// silence (stream starving), both surfaced only as counters.
pub struct AudioRingBuffer {
    index: usize,
    format: AudioFormat,
    unit_size: usize,
    capacity_units: usize,
    /// Quarter-second of silence, block-aligned; one injection closes
    /// one detected starvation gap
    silence: Box<[u8]>,
    inner: Mutex<State>,
}

struct State {
    storage: Box<[u8]>,
    pts: Box<[u64]>,
    write_index: usize,
    read_index: usize,
    ready_count: usize,
    /// Unquantized bytes accumulated in the slot at `write_index`
    leftover: usize,
    units_written: u64,
    /// Cumulative bytes accepted (real and filler)
    total_bytes: u64,
    started: bool,
    first_seen: bool,
    time_zero: Option<u64>,
    skip_count: u32,
    suppressed_writes: u32,
    skip_warned: bool,
    starve_ticks: u32,
    filler_ms: u64,
    consecutive_filler_ms: u64,
    overrun: bool,
    overrun_count: u64,
    quantum_gate: Option<Arc<ResetGate>>,
}

/// Diagnostics snapshot for one audio stream
#[derive(Debug, Clone)]
pub struct AudioBufferStats {
    pub index: usize,
    pub ready_units: usize,
    pub filler_ms: u64,
    pub consecutive_filler_ms: u64,
    pub overrun_count: u64,
    pub skipping: bool,
}

impl AudioRingBuffer {
    /// Allocate storage for `capacity_seconds` one-second units of the
    /// given format. Fails if the format has a zero byte rate.
    pub fn allocate(index: usize, format: AudioFormat, capacity_seconds: u32) -> Result<Self> {
        let unit_size = format.bytes_per_second() as usize;
        if unit_size == 0 {
            return Err(AvmuxError::InvalidFormat(format!(
                "audio stream {} has a zero byte rate ({})",
                index, format
            )));
        }
        if capacity_seconds == 0 {
            return Err(AvmuxError::InvalidConfig(
                "audio buffer span must be at least one second".into(),
            ));
        }

        let capacity_units = capacity_seconds as usize;
        let block = format.block_align.max(1) as usize;
        let silence_len = (unit_size / 4) / block * block;

        debug!(
            "Audio buffer {}: {} units of {} bytes ({})",
            index, capacity_units, unit_size, format
        );

        Ok(Self {
            index,
            format,
            unit_size,
            capacity_units,
            silence: vec![0u8; silence_len.max(block)].into_boxed_slice(),
            inner: Mutex::new(State {
                storage: vec![0u8; unit_size * capacity_units].into_boxed_slice(),
                pts: vec![0u64; capacity_units].into_boxed_slice(),
                write_index: 0,
                read_index: 0,
                ready_count: 0,
                leftover: 0,
                units_written: 0,
                total_bytes: 0,
                started: false,
                first_seen: false,
                time_zero: None,
                skip_count: 0,
                suppressed_writes: 0,
                skip_warned: false,
                starve_ticks: 0,
                filler_ms: 0,
                consecutive_filler_ms: 0,
                overrun: false,
                overrun_count: 0,
                quantum_gate: None,
            }),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    /// Bytes per quantized unit (one second of this stream)
    pub fn unit_size(&self) -> usize {
        self.unit_size
    }

    /// Presentation time of the next ready unit, without consuming it.
    /// Lock-and-check only; never blocks beyond the buffer mutex.
    pub fn query(&self) -> Option<u64> {
        let st = self.inner.lock();
        if st.ready_count > 0 {
            Some(st.pts[st.read_index])
        } else {
            None
        }
    }

    /// Pop the oldest ready unit and hand its bytes to `f`.
    ///
    /// The view aliases buffer storage and is only valid inside the
    /// call; the single consumer must finish with it before returning
    /// (the slot is reused once writes wrap around).
    pub fn read_with<R>(&self, f: impl FnOnce(&[u8], u64) -> R) -> Option<R> {
        let mut st = self.inner.lock();
        if st.ready_count == 0 {
            return None;
        }
        let slot = st.read_index;
        let ts = st.pts[slot];
        st.read_index = (slot + 1) % self.capacity_units;
        st.ready_count -= 1;
        let base = slot * self.unit_size;
        let view = &st.storage[base..base + self.unit_size];
        Some(f(view, ts))
    }

    /// Append raw sample bytes from the producer callback.
    ///
    /// Before the buffer is started only the first-sample flag is
    /// recorded. Writes are dropped while the stream is resyncing
    /// (running far ahead of the session clock) or the buffer is full.
    pub fn write(&self, bytes: &[u8], abs_ms: u64) {
        let mut st = self.inner.lock();
        if !st.started {
            st.first_seen = true;
            return;
        }

        if st.skip_count > SKIP_TRIGGER_TICKS {
            st.suppressed_writes += 1;
            if st.suppressed_writes > SKIP_TRIGGER_TICKS && !st.skip_warned {
                warn!(
                    "Audio stream {} far ahead of real time, dropping writes to resync",
                    self.index
                );
                st.skip_warned = true;
            }
            return;
        }
        st.suppressed_writes = 0;
        st.skip_warned = false;

        if st.time_zero.is_none() {
            st.time_zero = Some(abs_ms);
            trace!("Audio stream {} time zero at {} ms", self.index, abs_ms);
        }
        st.consecutive_filler_ms = 0;

        self.push_bytes(&mut st, bytes);
    }

    /// Quantize `bytes` into the ring, stamping completed units
    fn push_bytes(&self, st: &mut State, bytes: &[u8]) {
        let mut src = bytes;
        while !src.is_empty() {
            if st.ready_count == self.capacity_units {
                if !st.overrun {
                    warn!(
                        "Audio stream {} overrun, dropping {} bytes",
                        self.index,
                        src.len()
                    );
                }
                st.overrun = true;
                st.overrun_count += 1;
                return;
            }
            st.overrun = false;

            let base = st.write_index * self.unit_size;
            let room = self.unit_size - st.leftover;
            let n = room.min(src.len());
            st.storage[base + st.leftover..base + st.leftover + n].copy_from_slice(&src[..n]);
            st.leftover += n;
            st.total_bytes += n as u64;
            src = &src[n..];

            if st.leftover == self.unit_size {
                st.pts[st.write_index] = st.units_written * QUANTUM_MS;
                st.units_written += 1;
                st.write_index = (st.write_index + 1) % self.capacity_units;
                st.ready_count += 1;
                st.leftover = 0;
                if let Some(gate) = st.quantum_gate.take() {
                    gate.open();
                }
            }
        }
    }

    /// Compare cumulative buffered audio time against session time and
    /// correct drift. Called from the dispatch loop at >= 40 Hz.
    pub fn adjust_sync(&self, elapsed_ms: u64) {
        let mut st = self.inner.lock();
        if !st.started {
            return;
        }

        let buffered_ms = st.total_bytes * 1000 / self.unit_size as u64;

        // Stream ahead of real time: count ticks toward write skipping.
        if buffered_ms > elapsed_ms + DRIFT_THRESHOLD_MS {
            st.skip_count += 1;
            if st.skip_count == SKIP_TRIGGER_TICKS + 1 {
                debug!(
                    "Audio stream {} ahead by {} ms, skip engaged",
                    self.index,
                    buffered_ms - elapsed_ms
                );
            }
        } else {
            st.skip_count = 0;
        }

        // Stream starving: after a sustained gap, mask with silence.
        if elapsed_ms > buffered_ms + DRIFT_THRESHOLD_MS {
            st.starve_ticks += 1;
            if st.starve_ticks >= STARVE_TRIGGER_TICKS {
                st.starve_ticks = 0;
                let silence_ms = self.silence.len() as u64 * 1000 / self.unit_size as u64;
                st.filler_ms += silence_ms;
                st.consecutive_filler_ms += silence_ms;
                debug!(
                    "Audio stream {} starving ({} ms behind), injecting {} ms of silence",
                    self.index,
                    elapsed_ms - buffered_ms,
                    silence_ms
                );
                let silence = &self.silence;
                self.push_bytes(&mut st, silence);
            }
        } else {
            st.starve_ticks = 0;
        }
    }

    /// Begin buffering real data; before this, writes only record the
    /// first-sample flag
    pub fn start(&self) {
        let mut st = self.inner.lock();
        st.started = true;
    }

    pub fn is_started(&self) -> bool {
        self.inner.lock().started
    }

    /// True once the producer has delivered at least one sample
    pub fn has_first_sample(&self) -> bool {
        self.inner.lock().first_seen
    }

    /// Arm a one-shot gate fired by the next completed quantum
    pub fn set_quantum_gate(&self, gate: Arc<ResetGate>) {
        self.inner.lock().quantum_gate = Some(gate);
    }

    /// Cumulative (units, bytes) counters, for transplanting timing
    /// onto a stream joining live
    pub fn timing_snapshot(&self) -> (u64, u64) {
        let st = self.inner.lock();
        (st.units_written, st.total_bytes)
    }

    /// Adopt timing counters from a model stream so the first quantum
    /// emitted by this buffer lines up with the rest of the set
    pub fn seed_timing(&self, units: u64, total_bytes: u64) {
        let mut st = self.inner.lock();
        st.units_written = units;
        st.total_bytes = total_bytes;
        st.leftover = (total_bytes % self.unit_size as u64) as usize;
        debug!(
            "Audio stream {} seeded at unit {} ({} bytes)",
            self.index, units, total_bytes
        );
    }

    pub fn ready_units(&self) -> usize {
        self.inner.lock().ready_count
    }

    pub fn stats(&self) -> AudioBufferStats {
        let st = self.inner.lock();
        AudioBufferStats {
            index: self.index,
            ready_units: st.ready_count,
            filler_ms: st.filler_ms,
            consecutive_filler_ms: st.consecutive_filler_ms,
            overrun_count: st.overrun_count,
            skipping: st.skip_count > SKIP_TRIGGER_TICKS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm16k() -> AudioFormat {
        // 16000 bytes/second: one write of exactly that is one unit
        AudioFormat::pcm(8000, 1, 16)
    }

    fn started(capacity_seconds: u32) -> AudioRingBuffer {
        let buf = AudioRingBuffer::allocate(0, pcm16k(), capacity_seconds).unwrap();
        buf.write(&[0u8; 4], 0); // first sample, not buffered
        buf.start();
        buf
    }

    #[test]
    fn test_empty_after_allocate() {
        let buf = AudioRingBuffer::allocate(0, pcm16k(), 10).unwrap();
        assert!(buf.query().is_none());
        assert_eq!(buf.ready_units(), 0);
    }

    #[test]
    fn test_zero_rate_rejected() {
        let format = AudioFormat {
            sample_rate: 0,
            channels: 1,
            bits_per_sample: 16,
            block_align: 2,
        };
        assert!(AudioRingBuffer::allocate(0, format, 10).is_err());
    }

    #[test]
    fn test_one_write_one_unit() {
        let buf = started(10);
        buf.write(&vec![0u8; 16000], 0);
        assert_eq!(buf.ready_units(), 1);
        assert_eq!(buf.query(), Some(0));
    }

    #[test]
    fn test_unbuffered_before_start() {
        let buf = AudioRingBuffer::allocate(0, pcm16k(), 10).unwrap();
        assert!(!buf.has_first_sample());
        buf.write(&vec![0u8; 16000], 0);
        assert!(buf.has_first_sample());
        assert_eq!(buf.ready_units(), 0);
    }

    #[test]
    fn test_presentation_times_step_by_quantum() {
        let buf = started(10);
        // three units delivered in irregular chunks
        buf.write(&vec![1u8; 10000], 0);
        buf.write(&vec![2u8; 20000], 0);
        buf.write(&vec![3u8; 18000], 0);
        assert_eq!(buf.ready_units(), 3);
        let mut times = Vec::new();
        while let Some(ts) = buf.read_with(|_, ts| ts) {
            times.push(ts);
        }
        assert_eq!(times, vec![0, 1000, 2000]);
    }

    #[test]
    fn test_round_trip_bytes() {
        let buf = started(10);
        let payload: Vec<u8> = (0..32000u32).map(|i| (i % 251) as u8).collect();
        buf.write(&payload, 0);
        let mut out = Vec::new();
        while buf.read_with(|bytes, _| out.extend_from_slice(bytes)).is_some() {}
        assert_eq!(out, payload);
    }

    #[test]
    fn test_partial_unit_not_ready() {
        let buf = started(10);
        buf.write(&vec![0u8; 8000], 0);
        assert_eq!(buf.ready_units(), 0);
        buf.write(&vec![0u8; 8000], 0);
        assert_eq!(buf.ready_units(), 1);
    }

    #[test]
    fn test_overrun_drops_unit() {
        let buf = started(2);
        buf.write(&vec![0u8; 32000], 0);
        assert_eq!(buf.ready_units(), 2);
        buf.write(&vec![0u8; 16000], 0);
        assert_eq!(buf.ready_units(), 2);
        assert_eq!(buf.stats().overrun_count, 1);
        // draining makes room again
        assert!(buf.read_with(|_, _| ()).is_some());
        buf.write(&vec![0u8; 16000], 0);
        assert_eq!(buf.ready_units(), 2);
    }

    #[test]
    fn test_skip_drops_writes_when_ahead() {
        let buf = started(10);
        buf.write(&vec![0u8; 32000], 0); // 2000 ms buffered
        for _ in 0..=SKIP_TRIGGER_TICKS {
            buf.adjust_sync(0); // far ahead of real time
        }
        assert!(buf.stats().skipping);
        buf.write(&vec![0u8; 16000], 0);
        assert_eq!(buf.ready_units(), 2, "write while skipping must be dropped");
        // once the clock catches up, writes resume
        buf.adjust_sync(2000);
        buf.write(&vec![0u8; 16000], 2100);
        assert_eq!(buf.ready_units(), 3);
    }

    #[test]
    fn test_starvation_injects_silence() {
        let buf = started(10);
        buf.write(&vec![0u8; 1600], 0); // 100 ms of real data
        for _ in 0..STARVE_TRIGGER_TICKS {
            buf.adjust_sync(2000);
        }
        let stats = buf.stats();
        assert_eq!(stats.filler_ms, 250);
        assert_eq!(stats.consecutive_filler_ms, 250);
        // repeating the same reading does not double-insert
        buf.adjust_sync(2000);
        assert_eq!(buf.stats().filler_ms, 250);
    }

    #[test]
    fn test_real_write_resets_consecutive_filler() {
        let buf = started(10);
        buf.write(&vec![0u8; 1600], 0);
        for _ in 0..STARVE_TRIGGER_TICKS {
            buf.adjust_sync(2000);
        }
        assert_eq!(buf.stats().consecutive_filler_ms, 250);
        buf.write(&vec![0u8; 1600], 2000);
        let stats = buf.stats();
        assert_eq!(stats.consecutive_filler_ms, 0);
        assert_eq!(stats.filler_ms, 250);
    }

    #[test]
    fn test_quantum_gate_fires_once() {
        let buf = started(10);
        let gate = Arc::new(ResetGate::new());
        buf.set_quantum_gate(gate.clone());
        buf.write(&vec![0u8; 8000], 0);
        assert!(!gate.is_open());
        buf.write(&vec![0u8; 8000], 0);
        assert!(gate.is_open());
    }

    #[test]
    fn test_seed_timing_aligns_next_unit() {
        let buf = started(10);
        buf.seed_timing(5, 5 * 16000);
        buf.write(&vec![0u8; 16000], 5000);
        assert_eq!(buf.query(), Some(5000));
        assert_eq!(buf.timing_snapshot().0, 6);
    }
}

//! Frame ring buffer for one video stream

use crate::error::{AvmuxError, Result};
use crate::video::VideoFormat;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

/// Real elapsed time observed before the declared frame duration is
/// replaced by the measured mean
const CALIBRATION_WINDOW_MS: u64 = 5000;

/// Capacity degradation step when the buffer exceeds the memory ceiling
const DEGRADE_PERCENT: usize = 30;

/// Fixed-capacity circular store of discrete video frames.
///
/// Frames arrive already framed from the producer; the buffer stores
/// them against stream-relative presentation times. The declared frame
/// rate is unreliable, so the buffer measures the real delivery rate
/// over its first five seconds and recalibrates once. Outages are
/// masked by duplicating the last written frame (freeze frame) until
/// the stream catches up with the session clock.
pub struct VideoRingBuffer {
    format: VideoFormat,
    frame_size: usize,
    capacity: usize,
    inner: Mutex<State>,
}

struct State {
    storage: Box<[u8]>,
    pts: Box<[u64]>,
    write_index: usize,
    read_index: usize,
    ready_count: usize,
    started: bool,
    first_seen: bool,
    time_zero: Option<u64>,
    frame_duration_ms: u64,
    calibrated: bool,
    real_frames: u64,
    /// Presentation time and slot of the most recently written frame,
    /// real or fabricated; the slot is the duplication source
    last_pts: Option<u64>,
    last_slot: Option<usize>,
    last_read_pts: Option<u64>,
    mark_in: Option<u64>,
    mark_out: Option<u64>,
    frames_faked: u64,
    stalled_ms: u64,
    overrun: bool,
    overrun_count: u64,
}

/// Diagnostics snapshot for the video stream
#[derive(Debug, Clone)]
pub struct VideoBufferStats {
    pub ready_frames: usize,
    pub frames_faked: u64,
    pub stalled_ms: u64,
    pub overrun: bool,
    pub overrun_count: u64,
    pub frame_duration_ms: u64,
    pub calibrated: bool,
}

impl VideoRingBuffer {
    /// Size the ring for `capacity_seconds` at the declared rate,
    /// bounded by `memory_ceiling` bytes. Capacity degrades by 30%
    /// steps until it fits; below one second's worth of frames the
    /// allocation fails permanently.
    pub fn allocate(
        format: VideoFormat,
        capacity_seconds: u32,
        memory_ceiling: usize,
    ) -> Result<Self> {
        let frame_size = format.frame_size_bytes();
        let fps = format.nominal_fps();
        if frame_size == 0 || fps == 0 {
            return Err(AvmuxError::InvalidFormat(format!(
                "video format not usable: {}",
                format
            )));
        }
        if capacity_seconds == 0 {
            return Err(AvmuxError::InvalidConfig(
                "video buffer span must be at least one second".into(),
            ));
        }

        let mut capacity = capacity_seconds as usize * fps;
        while capacity * frame_size > memory_ceiling {
            capacity = capacity * (100 - DEGRADE_PERCENT) / 100;
            if capacity < fps {
                return Err(AvmuxError::AllocationFailed(format!(
                    "video buffer cannot hold one second of {} within {} bytes",
                    format, memory_ceiling
                )));
            }
        }
        if capacity < capacity_seconds as usize * fps {
            debug!(
                "Video buffer degraded to {} frames ({} requested) under memory ceiling",
                capacity,
                capacity_seconds as usize * fps
            );
        }

        debug!(
            "Video buffer: {} frames of {} bytes ({})",
            capacity, frame_size, format
        );

        let nominal = format.nominal_frame_duration_ms;
        Ok(Self {
            format,
            frame_size,
            capacity,
            inner: Mutex::new(State {
                storage: vec![0u8; frame_size * capacity].into_boxed_slice(),
                pts: vec![0u64; capacity].into_boxed_slice(),
                write_index: 0,
                read_index: 0,
                ready_count: 0,
                started: false,
                first_seen: false,
                time_zero: None,
                frame_duration_ms: nominal.max(1),
                calibrated: false,
                real_frames: 0,
                last_pts: None,
                last_slot: None,
                last_read_pts: None,
                mark_in: None,
                mark_out: None,
                frames_faked: 0,
                stalled_ms: 0,
                overrun: false,
                overrun_count: 0,
            }),
        })
    }

    pub fn format(&self) -> &VideoFormat {
        &self.format
    }

    pub fn capacity_frames(&self) -> usize {
        self.capacity
    }

    /// Current frame duration: the declared value until calibration,
    /// the measured mean afterwards
    pub fn frame_duration_ms(&self) -> u64 {
        self.inner.lock().frame_duration_ms
    }

    /// Presentation time of the next ready frame, without consuming it
    pub fn query(&self) -> Option<u64> {
        let st = self.inner.lock();
        if st.ready_count > 0 {
            Some(st.pts[st.read_index])
        } else {
            None
        }
    }

    /// Pop the oldest ready frame and hand its bytes to `f`.
    ///
    /// Same aliasing contract as the audio buffer: the view is only
    /// valid inside the call.
    pub fn read_with<R>(&self, f: impl FnOnce(&[u8], u64) -> R) -> Option<R> {
        let mut st = self.inner.lock();
        if st.ready_count == 0 {
            return None;
        }
        let slot = st.read_index;
        let ts = st.pts[slot];
        st.read_index = (slot + 1) % self.capacity;
        st.ready_count -= 1;
        st.last_read_pts = Some(ts);
        let base = slot * self.frame_size;
        let view = &st.storage[base..base + self.frame_size];
        Some(f(view, ts))
    }

    /// Store one frame stamped with an absolute session-clock reading.
    ///
    /// Writes outside the optional mark-in/mark-out bounds are silently
    /// ignored (splice seams). A full buffer rejects the frame without
    /// wrapping; the producer must slow down.
    pub fn write(&self, frame: &[u8], abs_ms: u64) {
        let mut st = self.inner.lock();
        if !st.started {
            st.first_seen = true;
            return;
        }
        if st.mark_in.is_some_and(|m| abs_ms < m) {
            trace!("Video frame at {} ms before mark-in, ignored", abs_ms);
            return;
        }
        if st.mark_out.is_some_and(|m| abs_ms >= m) {
            trace!("Video frame at {} ms past mark-out, ignored", abs_ms);
            return;
        }
        if st.ready_count == self.capacity {
            if !st.overrun {
                warn!("Video buffer overrun, rejecting frames");
            }
            st.overrun = true;
            st.overrun_count += 1;
            return;
        }

        let local = abs_ms.saturating_sub(st.time_zero.unwrap_or(0));
        let slot = st.write_index;
        let base = slot * self.frame_size;
        let n = frame.len().min(self.frame_size);
        st.storage[base..base + n].copy_from_slice(&frame[..n]);
        st.pts[slot] = local;
        st.write_index = (slot + 1) % self.capacity;
        st.ready_count += 1;
        st.real_frames += 1;
        st.last_pts = Some(local);
        st.last_slot = Some(slot);
        st.stalled_ms = 0;
        st.overrun = false;
    }

    /// Calibrate the frame duration once, then close real-time gaps by
    /// duplicating the last written frame. Called from the dispatch
    /// loop with time elapsed since the epoch.
    pub fn adjust_sync(&self, elapsed_ms: u64) {
        let mut st = self.inner.lock();
        if !st.started {
            return;
        }

        // One-shot recalibration: the declared rate is a hint, the
        // observed delivery rate is the truth.
        if !st.calibrated && elapsed_ms >= CALIBRATION_WINDOW_MS && st.real_frames > 0 {
            let measured = (elapsed_ms / st.real_frames).max(1);
            if measured != st.frame_duration_ms {
                debug!(
                    "Video frame duration recalibrated {} ms -> {} ms ({} frames in {} ms)",
                    st.frame_duration_ms, measured, st.real_frames, elapsed_ms
                );
            }
            st.frame_duration_ms = measured;
            st.calibrated = true;
        }

        // An outgoing splice buffer must drain to its seam, not refill.
        if st.mark_out.is_some() {
            return;
        }

        let Some(mut last) = st.last_pts else {
            return;
        };
        let frame_ms = st.frame_duration_ms;
        let stall_threshold = frame_ms * 4 / 10;

        while elapsed_ms.saturating_sub(last) > stall_threshold {
            if st.ready_count == self.capacity {
                break;
            }
            let Some(src_slot) = st.last_slot else {
                break;
            };
            let dst_slot = st.write_index;
            let src = src_slot * self.frame_size;
            let dst = dst_slot * self.frame_size;
            if src != dst {
                st.storage.copy_within(src..src + self.frame_size, dst);
            }
            last += frame_ms;
            st.pts[dst_slot] = last;
            st.write_index = (dst_slot + 1) % self.capacity;
            st.ready_count += 1;
            st.last_pts = Some(last);
            st.last_slot = Some(dst_slot);
            st.frames_faked += 1;
            st.stalled_ms += frame_ms;
            trace!("Fabricated freeze frame at {} ms", last);
        }
    }

    /// Begin buffering; `epoch_ms` becomes the time base all frame
    /// stamps are rebased against
    pub fn start(&self, epoch_ms: u64) {
        let mut st = self.inner.lock();
        st.started = true;
        if st.time_zero.is_none() {
            st.time_zero = Some(epoch_ms);
        }
    }

    pub fn is_started(&self) -> bool {
        self.inner.lock().started
    }

    /// True once the producer has delivered at least one frame
    pub fn has_first_sample(&self) -> bool {
        self.inner.lock().first_seen
    }

    /// Ignore frames stamped before this absolute time (incoming swap)
    pub fn set_mark_in(&self, abs_ms: u64) {
        self.inner.lock().mark_in = Some(abs_ms);
    }

    /// Ignore frames stamped at or after this absolute time (outgoing
    /// swap); also disables freeze-frame fabrication so the buffer can
    /// drain
    pub fn set_mark_out(&self, abs_ms: u64) {
        self.inner.lock().mark_out = Some(abs_ms);
    }

    pub fn clear_mark_in(&self) {
        self.inner.lock().mark_in = None;
    }

    pub fn clear_mark_out(&self) {
        self.inner.lock().mark_out = None;
    }

    /// Presentation time of the last frame handed to the consumer
    pub fn last_read_pts(&self) -> Option<u64> {
        self.inner.lock().last_read_pts
    }

    pub fn ready_frames(&self) -> usize {
        self.inner.lock().ready_count
    }

    pub fn stats(&self) -> VideoBufferStats {
        let st = self.inner.lock();
        VideoBufferStats {
            ready_frames: st.ready_count,
            frames_faked: st.frames_faked,
            stalled_ms: st.stalled_ms,
            overrun: st.overrun,
            overrun_count: st.overrun_count,
            frame_duration_ms: st.frame_duration_ms,
            calibrated: st.calibrated,
        }
    }
}

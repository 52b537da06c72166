//! Sync engine - owns the buffers and runs the dispatch loop

use crate::audio::{AudioBufferStats, AudioFormat, AudioMixer, AudioRingBuffer, QUANTUM_MS};
use crate::error::{AvmuxError, Result};
use crate::sync::signal::ResetGate;
use crate::sync::{OutputSample, SessionClock, StreamHandle, StreamKind};
use crate::video::{VideoBufferStats, VideoFormat, VideoRingBuffer};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Dispatch loop cadence (~100 Hz)
const TICK_INTERVAL: Duration = Duration::from_millis(10);

/// First-sample wait during live add/swap: 400 polls of 50 ms (~20 s)
const FIRST_SAMPLE_RETRIES: u32 = 400;
const FIRST_SAMPLE_POLL: Duration = Duration::from_millis(50);

/// Bounded wait for a model buffer to complete a quantum during live add
const MODEL_QUANTUM_TIMEOUT: Duration = Duration::from_secs(5);

/// How far ahead of now the common seam of a video swap is placed
const SWAP_LEAD_MS: u64 = 500;

/// Hard bound on draining the outgoing buffer past its mark-out
const SWAP_DRAIN_TIMEOUT_MS: u64 = 5000;

/// Engine configuration, fixed at construction
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Ring buffer span in seconds
    pub buffer_seconds: u32,
    /// Maximum number of concurrent audio streams
    pub max_audio_streams: usize,
    /// Output channel count (1 or 2)
    pub target_channels: u16,
    /// Output bit depth (8, 16 or 32)
    pub target_bits: u16,
    /// Memory ceiling for the video buffer in bytes
    pub video_memory_ceiling: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer_seconds: 10,
            max_audio_streams: 8,
            target_channels: 2,
            target_bits: 16,
            video_memory_ceiling: 256 * 1024 * 1024,
        }
    }
}

/// Engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No buffers yet
    Idle,
    /// Buffers created and sized
    Allocated,
    /// Dispatch thread running, waiting for every stream's first sample
    AwaitingEpoch,
    /// Epoch found, samples flowing
    Dispatching,
    /// Session over
    Stopped,
}

/// Events external controllers might care about
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Every registered stream delivered a sample; dispatch began
    EpochEstablished { epoch_ms: u64 },
    /// A live-added audio stream joined the active set
    AudioStreamAdded(usize),
    /// A live audio add was abandoned within its bounded wait
    AudioStreamAddFailed(usize),
    /// An audio stream was removed from the active set
    AudioStreamRemoved(usize),
    /// The active video buffer was swapped to this stream index
    VideoSwapCompleted(usize),
}

/// Polled diagnostics snapshot
#[derive(Debug, Clone)]
pub struct EngineDiagnostics {
    pub state: EngineState,
    pub epoch_ms: Option<u64>,
    pub audio: Vec<AudioBufferStats>,
    pub video: Option<VideoBufferStats>,
}

struct PendingSwap {
    mark_out_ms: u64,
    deadline_ms: u64,
    done: Arc<ResetGate>,
}

/// Orchestrator bookkeeping behind the coarse engine lock.
///
/// Lock order is always engine lock before per-buffer lock.
struct Shared {
    audio: BTreeMap<usize, Arc<AudioRingBuffer>>,
    staged_audio: Option<(usize, Arc<AudioRingBuffer>)>,
    video: Option<(usize, Arc<VideoRingBuffer>)>,
    staged_video: Option<(usize, Arc<VideoRingBuffer>)>,
    pending_swap: Option<PendingSwap>,
    mixer: Option<AudioMixer>,
    sample_rate: Option<u32>,
    epoch_ms: Option<u64>,
    /// End time of the previously emitted audio quantum; video may not
    /// run past it
    audio_end_ms: Option<u64>,
    next_index: usize,
}

/// Interleaves independently-clocked audio and video streams into one
/// time-ordered output stream.
///
/// Producer callbacks push samples in via [`SyncEngine::write`]; the
/// dispatch thread pulls mixed audio quanta and video frames out in
/// presentation order and emits them on the outbound channel passed at
/// construction.
pub struct SyncEngine {
    config: EngineConfig,
    state: Arc<Mutex<EngineState>>,
    shared: Arc<Mutex<Shared>>,
    clock: Arc<SessionClock>,
    stop_flag: Arc<AtomicBool>,
    dispatch_handle: Option<JoinHandle<()>>,
    sample_tx: Sender<OutputSample>,
    event_tx: Arc<Mutex<Option<Sender<EngineEvent>>>>,
}

impl SyncEngine {
    /// Create an engine emitting synchronized samples on `sample_tx`
    pub fn new(config: EngineConfig, sample_tx: Sender<OutputSample>) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(EngineState::Idle)),
            shared: Arc::new(Mutex::new(Shared {
                audio: BTreeMap::new(),
                staged_audio: None,
                video: None,
                staged_video: None,
                pending_swap: None,
                mixer: None,
                sample_rate: None,
                epoch_ms: None,
                audio_end_ms: None,
                next_index: 0,
            })),
            clock: Arc::new(SessionClock::new()),
            stop_flag: Arc::new(AtomicBool::new(false)),
            dispatch_handle: None,
            sample_tx,
            event_tx: Arc::new(Mutex::new(None)),
        }
    }

    /// Set an event notification channel for external listeners
    pub fn set_event_channel(&self, tx: Sender<EngineEvent>) {
        *self.event_tx.lock() = Some(tx);
    }

    /// Current engine state
    pub fn state(&self) -> EngineState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self.state(),
            EngineState::AwaitingEpoch | EngineState::Dispatching
        )
    }

    /// Current session clock reading; producers stamp writes with this
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register an audio stream.
    ///
    /// Before dispatch begins this adds the stream to the set the epoch
    /// waits on. While dispatching, the stream is staged and folded
    /// into the active set once it has aligned with a running buffer
    /// (live add); progress is reported on the event channel.
    pub fn register_audio_stream(&self, format: AudioFormat) -> Result<StreamHandle> {
        if format.bits_per_sample != self.config.target_bits {
            return Err(AvmuxError::InvalidFormat(format!(
                "audio stream must match the {}-bit output depth, got {}",
                self.config.target_bits, format
            )));
        }
        if format.channels != 1 && format.channels != 2 {
            return Err(AvmuxError::InvalidFormat(format!(
                "only mono and stereo streams are mixable, got {}",
                format
            )));
        }

        let dispatching = self.state() == EngineState::Dispatching;
        let mut sh = self.shared.lock();

        if let Some(rate) = sh.sample_rate {
            if rate != format.sample_rate {
                return Err(AvmuxError::InvalidFormat(format!(
                    "audio streams must share the session rate {} Hz, got {}",
                    rate, format
                )));
            }
        }
        let active = sh.audio.len() + usize::from(sh.staged_audio.is_some());
        if active >= self.config.max_audio_streams {
            return Err(AvmuxError::TooManyStreams(self.config.max_audio_streams));
        }
        if dispatching && sh.staged_audio.is_some() {
            return Err(AvmuxError::SpliceInProgress);
        }

        let index = sh.next_index;
        sh.next_index += 1;
        let sample_rate = format.sample_rate;
        let buffer = Arc::new(AudioRingBuffer::allocate(
            index,
            format,
            self.config.buffer_seconds,
        )?);

        // The first stream fixes the session rate and sizes the mixer.
        if sh.sample_rate.is_none() {
            sh.sample_rate = Some(sample_rate);
            sh.mixer = Some(AudioMixer::new(
                sample_rate,
                self.config.target_channels,
                self.config.target_bits,
            ));
        }

        if dispatching {
            sh.staged_audio = Some((index, buffer.clone()));
            drop(sh);
            info!("Audio stream {} staged for live add", index);
            self.spawn_audio_staging(index, buffer);
        } else {
            sh.audio.insert(index, buffer);
            drop(sh);
            self.promote_to_allocated();
            info!("Audio stream {} registered", index);
        }

        Ok(StreamHandle {
            kind: StreamKind::Audio,
            index,
        })
    }

    /// Register the video stream. One per session; live replacement
    /// goes through [`SyncEngine::stage_video_stream`].
    pub fn register_video_stream(&self, format: VideoFormat) -> Result<StreamHandle> {
        if self.state() == EngineState::Dispatching {
            return Err(AvmuxError::InvalidConfig(
                "session is live; use stage_video_stream to replace video".into(),
            ));
        }
        let mut sh = self.shared.lock();
        if sh.video.is_some() {
            return Err(AvmuxError::InvalidConfig(
                "a video stream is already registered".into(),
            ));
        }
        let index = sh.next_index;
        sh.next_index += 1;
        let buffer = Arc::new(VideoRingBuffer::allocate(
            format,
            self.config.buffer_seconds,
            self.config.video_memory_ceiling,
        )?);
        sh.video = Some((index, buffer));
        drop(sh);
        self.promote_to_allocated();
        info!("Video stream {} registered", index);
        Ok(StreamHandle {
            kind: StreamKind::Video,
            index,
        })
    }

    /// Push raw samples for a registered stream.
    ///
    /// `abs_ms` is a reading of this engine's session clock
    /// ([`SyncEngine::now_ms`]). Never blocks beyond the buffer lock;
    /// drift handling may silently drop the data.
    pub fn write(&self, handle: StreamHandle, data: &[u8], abs_ms: u64) -> Result<()> {
        match handle.kind {
            StreamKind::Audio => {
                let buffer = {
                    let sh = self.shared.lock();
                    sh.audio.get(&handle.index).cloned().or_else(|| {
                        sh.staged_audio
                            .as_ref()
                            .filter(|(i, _)| *i == handle.index)
                            .map(|(_, b)| b.clone())
                    })
                };
                let buffer = buffer.ok_or(AvmuxError::StreamNotFound(handle.index))?;
                buffer.write(data, abs_ms);
            }
            StreamKind::Video => {
                let buffer = {
                    let sh = self.shared.lock();
                    sh.video
                        .as_ref()
                        .filter(|(i, _)| *i == handle.index)
                        .map(|(_, b)| b.clone())
                        .or_else(|| {
                            sh.staged_video
                                .as_ref()
                                .filter(|(i, _)| *i == handle.index)
                                .map(|(_, b)| b.clone())
                        })
                };
                let buffer = buffer.ok_or(AvmuxError::StreamNotFound(handle.index))?;
                buffer.write(data, abs_ms);
            }
        }
        Ok(())
    }

    /// Remove a stream. Audio removal is immediate; the mixer simply
    /// omits the stream from its next call. Video can only be removed
    /// before the session starts.
    pub fn unregister_stream(&self, handle: StreamHandle) -> Result<()> {
        match handle.kind {
            StreamKind::Audio => {
                let mut sh = self.shared.lock();
                let removed = sh.audio.remove(&handle.index).is_some()
                    || sh
                        .staged_audio
                        .take_if(|(i, _)| *i == handle.index)
                        .is_some();
                drop(sh);
                if !removed {
                    return Err(AvmuxError::StreamNotFound(handle.index));
                }
                info!("Audio stream {} removed", handle.index);
                send_event(&self.event_tx, EngineEvent::AudioStreamRemoved(handle.index));
                Ok(())
            }
            StreamKind::Video => {
                if !matches!(self.state(), EngineState::Idle | EngineState::Allocated) {
                    return Err(AvmuxError::InvalidConfig(
                        "live video streams are replaced, not removed".into(),
                    ));
                }
                let mut sh = self.shared.lock();
                if sh.video.as_ref().is_some_and(|(i, _)| *i == handle.index) {
                    sh.video = None;
                    Ok(())
                } else {
                    Err(AvmuxError::StreamNotFound(handle.index))
                }
            }
        }
    }

    /// Start the dispatch thread. Samples already routed to buffers
    /// keep accumulating first-sample flags; emission begins at the
    /// epoch, once every registered stream has delivered.
    pub fn start(&mut self) -> Result<()> {
        self.validate_config()?;
        match self.state() {
            EngineState::Allocated => {}
            EngineState::Idle => {
                return Err(AvmuxError::InvalidConfig(
                    "no streams registered".into(),
                ));
            }
            _ => return Err(AvmuxError::AlreadyRunning),
        }

        info!("Starting sync engine");
        self.stop_flag.store(false, Ordering::SeqCst);

        let shared = self.shared.clone();
        let state = self.state.clone();
        let clock = self.clock.clone();
        let stop = self.stop_flag.clone();
        let sample_tx = self.sample_tx.clone();
        let event_tx = self.event_tx.clone();

        self.dispatch_handle = Some(thread::spawn(move || {
            dispatch_thread(shared, state, clock, stop, sample_tx, event_tx);
        }));

        *self.state.lock() = EngineState::AwaitingEpoch;
        Ok(())
    }

    /// Stop the engine. Cooperative: the dispatch thread exits within
    /// one tick interval plus any in-flight emission.
    pub fn stop(&mut self) -> Result<()> {
        let Some(handle) = self.dispatch_handle.take() else {
            return Ok(());
        };
        info!("Stopping sync engine");
        self.stop_flag.store(true, Ordering::SeqCst);
        let _ = handle.join();
        *self.state.lock() = EngineState::Stopped;
        info!("Sync engine stopped");
        Ok(())
    }

    /// Stage a replacement video stream while live. Writes for the
    /// returned handle route to the staged buffer; the seam is
    /// committed by [`SyncEngine::commit_video_swap`].
    pub fn stage_video_stream(&self, format: VideoFormat) -> Result<StreamHandle> {
        if self.state() != EngineState::Dispatching {
            return Err(AvmuxError::NotRunning);
        }
        let mut sh = self.shared.lock();
        if sh.staged_video.is_some() || sh.pending_swap.is_some() {
            return Err(AvmuxError::SpliceInProgress);
        }
        if sh.video.is_none() {
            return Err(AvmuxError::InvalidConfig(
                "no active video stream to replace".into(),
            ));
        }
        let index = sh.next_index;
        sh.next_index += 1;
        let buffer = Arc::new(VideoRingBuffer::allocate(
            format,
            self.config.buffer_seconds,
            self.config.video_memory_ceiling,
        )?);
        sh.staged_video = Some((index, buffer));
        info!("Video stream {} staged for swap", index);
        Ok(StreamHandle {
            kind: StreamKind::Video,
            index,
        })
    }

    /// Execute a staged video swap: wait (bounded) for the incoming
    /// stream's first sample, place a common seam ~500 ms ahead on both
    /// buffers, then block until the dispatch thread performs the swap.
    ///
    /// On any timeout the staged state is rolled back and the active
    /// buffer keeps running untouched.
    pub fn commit_video_swap(&self, handle: StreamHandle) -> Result<()> {
        let staged = {
            let sh = self.shared.lock();
            sh.staged_video
                .as_ref()
                .filter(|(i, _)| *i == handle.index)
                .map(|(_, b)| b.clone())
        }
        .ok_or(AvmuxError::StreamNotFound(handle.index))?;

        // Bounded wait for the new source to prove it is producing.
        let mut seen = false;
        for _ in 0..FIRST_SAMPLE_RETRIES {
            if self.stop_flag.load(Ordering::Relaxed) {
                break;
            }
            if staged.has_first_sample() {
                seen = true;
                break;
            }
            thread::sleep(FIRST_SAMPLE_POLL);
        }
        if !seen {
            let mut sh = self.shared.lock();
            sh.staged_video.take_if(|(i, _)| *i == handle.index);
            return Err(AvmuxError::SpliceTimeout(format!(
                "incoming video stream {} produced no sample within the wait bound",
                handle.index
            )));
        }

        let done = Arc::new(ResetGate::new());
        {
            let mut sh = self.shared.lock();
            let epoch = sh.epoch_ms.ok_or(AvmuxError::NotRunning)?;
            let Some((_, outgoing)) = &sh.video else {
                return Err(AvmuxError::NotRunning);
            };
            let seam = self.clock.now_ms() + SWAP_LEAD_MS;
            outgoing.set_mark_out(seam);
            staged.set_mark_in(seam);
            staged.start(epoch);
            sh.pending_swap = Some(PendingSwap {
                mark_out_ms: seam,
                deadline_ms: seam + SWAP_DRAIN_TIMEOUT_MS,
                done: done.clone(),
            });
            info!("Video swap seam placed at {} ms", seam);
        }

        let bound = Duration::from_millis(SWAP_LEAD_MS + SWAP_DRAIN_TIMEOUT_MS + 1000);
        if done.wait_for(bound) {
            return Ok(());
        }

        // The dispatch thread never reached the seam; undo everything.
        let mut sh = self.shared.lock();
        sh.pending_swap = None;
        sh.staged_video.take_if(|(i, _)| *i == handle.index);
        if let Some((_, outgoing)) = &sh.video {
            outgoing.clear_mark_out();
        }
        Err(AvmuxError::SpliceTimeout(
            "video swap did not complete".into(),
        ))
    }

    /// Snapshot of per-stream diagnostics counters
    pub fn diagnostics(&self) -> EngineDiagnostics {
        let state = self.state();
        let sh = self.shared.lock();
        EngineDiagnostics {
            state,
            epoch_ms: sh.epoch_ms,
            audio: sh.audio.values().map(|b| b.stats()).collect(),
            video: sh.video.as_ref().map(|(_, v)| v.stats()),
        }
    }

    fn validate_config(&self) -> Result<()> {
        let c = &self.config;
        if !matches!(c.target_bits, 8 | 16 | 32) {
            return Err(AvmuxError::InvalidConfig(format!(
                "unsupported output bit depth {}",
                c.target_bits
            )));
        }
        if c.target_channels != 1 && c.target_channels != 2 {
            return Err(AvmuxError::InvalidConfig(format!(
                "unsupported output channel count {}",
                c.target_channels
            )));
        }
        if c.buffer_seconds == 0 || c.max_audio_streams == 0 {
            return Err(AvmuxError::InvalidConfig(
                "buffer span and stream limit must be non-zero".into(),
            ));
        }
        Ok(())
    }

    fn promote_to_allocated(&self) {
        let mut state = self.state.lock();
        if *state == EngineState::Idle {
            *state = EngineState::Allocated;
        }
    }

    /// Short-lived staging thread aligning a live-added audio stream
    fn spawn_audio_staging(&self, index: usize, buffer: Arc<AudioRingBuffer>) {
        let shared = self.shared.clone();
        let clock = self.clock.clone();
        let stop = self.stop_flag.clone();
        let event_tx = self.event_tx.clone();
        thread::spawn(move || {
            audio_staging_thread(shared, clock, stop, event_tx, index, buffer);
        });
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn send_event(event_tx: &Mutex<Option<Sender<EngineEvent>>>, event: EngineEvent) {
    if let Some(tx) = event_tx.lock().as_ref() {
        let _ = tx.try_send(event);
    }
}

/// Dispatch thread: runs the tick loop until the stop flag is set
fn dispatch_thread(
    shared: Arc<Mutex<Shared>>,
    state: Arc<Mutex<EngineState>>,
    clock: Arc<SessionClock>,
    stop_flag: Arc<AtomicBool>,
    sample_tx: Sender<OutputSample>,
    event_tx: Arc<Mutex<Option<Sender<EngineEvent>>>>,
) {
    info!("Dispatch thread started");
    while !stop_flag.load(Ordering::Relaxed) {
        dispatch_tick(&shared, &state, &clock, &sample_tx, &event_tx);
        thread::sleep(TICK_INTERVAL);
    }
    info!("Dispatch thread stopped");
}

/// One dispatch tick. Faults stay inside the tick: emission into a
/// full or disconnected channel is logged and dropped, never thrown.
fn dispatch_tick(
    shared: &Arc<Mutex<Shared>>,
    state: &Arc<Mutex<EngineState>>,
    clock: &Arc<SessionClock>,
    sample_tx: &Sender<OutputSample>,
    event_tx: &Arc<Mutex<Option<Sender<EngineEvent>>>>,
) {
    let now = clock.now_ms();
    let mut sh = shared.lock();

    // Epoch detection: dispatch begins the instant every registered
    // stream has delivered at least one sample.
    let Some(epoch) = sh.epoch_ms else {
        let have_any = !sh.audio.is_empty() || sh.video.is_some();
        let audio_ready = sh.audio.values().all(|b| b.has_first_sample());
        let video_ready = sh.video.as_ref().map_or(true, |(_, v)| v.has_first_sample());
        if have_any && audio_ready && video_ready {
            sh.epoch_ms = Some(now);
            for buffer in sh.audio.values() {
                buffer.start();
            }
            if let Some((_, video)) = &sh.video {
                video.start(now);
            }
            drop(sh);
            *state.lock() = EngineState::Dispatching;
            info!("All streams delivering; epoch at {} ms", now);
            send_event(event_tx, EngineEvent::EpochEstablished { epoch_ms: now });
        }
        return;
    };
    let elapsed = now.saturating_sub(epoch);

    // Readiness: audio needs every active buffer to hold a unit.
    let audio_ts = query_audio_quantum(&sh.audio);
    let video_ts = sh.video.as_ref().and_then(|(_, v)| v.query());

    // Selection: never emit audio and video out of relative order;
    // audio wins ties, and video may not outrun the last audio quantum.
    let emit_audio = match (audio_ts, video_ts) {
        (Some(a), Some(v)) => Some(a <= v),
        (Some(_), None) => Some(true),
        (None, Some(v)) => {
            let video_due = match sh.audio_end_ms {
                Some(end) => v <= end,
                None => sh.audio.is_empty(),
            };
            video_due.then_some(false)
        }
        (None, None) => None,
    };

    match emit_audio {
        Some(true) => {
            let Shared {
                mixer,
                audio,
                audio_end_ms,
                ..
            } = &mut *sh;
            if let Some(mixer) = mixer.as_mut() {
                if let Some((data, ts)) = mixer.mix(audio) {
                    *audio_end_ms = Some(ts + QUANTUM_MS - 1);
                    trace!("Emitting audio quantum at {} ms", ts);
                    if let Err(e) = sample_tx.try_send(OutputSample {
                        kind: StreamKind::Audio,
                        data,
                        pts_ms: ts,
                    }) {
                        warn!("Dropping audio quantum, output channel unavailable: {}", e);
                    }
                }
            }
            // A staged stream that finished aligning joins the set at a
            // quantum boundary, keeping its first unit time-aligned.
            if let Some((index, buffer)) = sh.staged_audio.take_if(|(_, b)| b.is_started()) {
                sh.audio.insert(index, buffer);
                info!("Audio stream {} joined the active set", index);
                send_event(event_tx, EngineEvent::AudioStreamAdded(index));
            }
        }
        Some(false) => {
            if let Some((_, video)) = &sh.video {
                let sample = video.read_with(|bytes, ts| OutputSample {
                    kind: StreamKind::Video,
                    data: bytes.to_vec(),
                    pts_ms: ts,
                });
                if let Some(sample) = sample {
                    trace!("Emitting video frame at {} ms", sample.pts_ms);
                    if let Err(e) = sample_tx.try_send(sample) {
                        warn!("Dropping video frame, output channel unavailable: {}", e);
                    }
                }
            }
        }
        None => {}
    }

    // Drift correction for every active and every started staged buffer.
    for buffer in sh.audio.values() {
        buffer.adjust_sync(elapsed);
    }
    if let Some((_, video)) = &sh.video {
        video.adjust_sync(elapsed);
    }
    if let Some((_, buffer)) = &sh.staged_audio {
        if buffer.is_started() {
            buffer.adjust_sync(elapsed);
        }
    }
    if let Some((_, video)) = &sh.staged_video {
        if video.is_started() {
            video.adjust_sync(elapsed);
        }
    }

    // Pending video swap: once the outgoing buffer has drained to its
    // seam (or the hard timeout passes), swap the active reference and
    // release the committer.
    let seam_state = sh.pending_swap.as_ref().map(|swap| {
        let seam_local = swap.mark_out_ms.saturating_sub(epoch);
        let reached = sh.video.as_ref().map_or(true, |(_, outgoing)| {
            let read_to_seam = outgoing
                .last_read_pts()
                .is_some_and(|p| p + outgoing.frame_duration_ms() >= seam_local);
            read_to_seam || (outgoing.ready_frames() == 0 && now >= swap.mark_out_ms)
        });
        (reached, now >= swap.deadline_ms)
    });
    if let Some((reached, timed_out)) = seam_state {
        if reached || timed_out {
            if timed_out && !reached {
                warn!("Video swap drain timed out, forcing the seam");
            }
            if let Some(swap) = sh.pending_swap.take() {
                if let Some((index, incoming)) = sh.staged_video.take() {
                    incoming.clear_mark_in();
                    sh.video = Some((index, incoming));
                    info!("Video buffer swapped to stream {}", index);
                    send_event(event_tx, EngineEvent::VideoSwapCompleted(index));
                }
                swap.done.open();
            }
        }
    }
}

/// All-ready check across the audio set: Some(ts) only if every buffer
/// holds a unit. Timestamps agree by construction; a mismatch is a
/// timing anomaly the mixer also reports, resolved toward the minimum.
fn query_audio_quantum(audio: &BTreeMap<usize, Arc<AudioRingBuffer>>) -> Option<u64> {
    if audio.is_empty() {
        return None;
    }
    let mut ts: Option<u64> = None;
    for buffer in audio.values() {
        let t = buffer.query()?;
        ts = Some(match ts {
            None => t,
            Some(prev) => prev.min(t),
        });
    }
    ts
}

/// Staging loop for a live audio add: wait for the new stream to
/// produce, borrow timing from a running model buffer, then mark the
/// stream started so the next audio emission folds it in.
fn audio_staging_thread(
    shared: Arc<Mutex<Shared>>,
    clock: Arc<SessionClock>,
    stop_flag: Arc<AtomicBool>,
    event_tx: Arc<Mutex<Option<Sender<EngineEvent>>>>,
    index: usize,
    buffer: Arc<AudioRingBuffer>,
) {
    debug!("Audio staging thread started for stream {}", index);

    let mut seen = false;
    for _ in 0..FIRST_SAMPLE_RETRIES {
        if stop_flag.load(Ordering::Relaxed) {
            break;
        }
        if buffer.has_first_sample() {
            seen = true;
            break;
        }
        thread::sleep(FIRST_SAMPLE_POLL);
    }
    if !seen {
        abandon_staged_audio(&shared, index);
        warn!(
            "Audio stream {} produced no sample within the wait bound, add abandoned",
            index
        );
        send_event(&event_tx, EngineEvent::AudioStreamAddFailed(index));
        return;
    }

    let model = shared.lock().audio.values().next().cloned();
    match model {
        Some(model) => {
            let gate = Arc::new(ResetGate::new());
            model.set_quantum_gate(gate.clone());
            if !gate.wait_for(MODEL_QUANTUM_TIMEOUT) {
                abandon_staged_audio(&shared, index);
                warn!(
                    "Model buffer completed no quantum within the wait bound, add of stream {} abandoned",
                    index
                );
                send_event(&event_tx, EngineEvent::AudioStreamAddFailed(index));
                return;
            }
            let (units, bytes) = model.timing_snapshot();
            // Counter transplant; the byte counter scales across
            // channel-count differences (x2 or half).
            let scaled = bytes * buffer.unit_size() as u64 / model.unit_size() as u64;
            buffer.seed_timing(units, scaled);
        }
        None => {
            // Nothing to model against: align to whole quanta of
            // session time.
            if let Some(epoch) = shared.lock().epoch_ms {
                let units = clock.now_ms().saturating_sub(epoch) / QUANTUM_MS;
                buffer.seed_timing(units, units * buffer.unit_size() as u64);
            }
        }
    }

    buffer.start();
    debug!("Audio stream {} aligned, awaiting fold-in", index);
}

fn abandon_staged_audio(shared: &Arc<Mutex<Shared>>, index: usize) {
    let mut sh = shared.lock();
    sh.staged_audio.take_if(|(i, _)| *i == index);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{bounded, Receiver};
    use std::time::Instant;

    fn test_config() -> EngineConfig {
        EngineConfig {
            buffer_seconds: 3,
            max_audio_streams: 4,
            target_channels: 1,
            target_bits: 16,
            video_memory_ceiling: 64 * 1024 * 1024,
        }
    }

    fn audio_fmt() -> AudioFormat {
        AudioFormat::pcm(1000, 1, 16) // 2000 bytes per quantum
    }

    fn video_fmt() -> VideoFormat {
        VideoFormat {
            width: 4,
            height: 4,
            bytes_per_pixel: 1,
            nominal_frame_duration_ms: 100,
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        cond()
    }

    #[test]
    fn test_rejects_mismatched_formats() {
        let (tx, _rx) = bounded(16);
        let engine = SyncEngine::new(test_config(), tx);
        assert!(matches!(
            engine.register_audio_stream(AudioFormat::pcm(1000, 1, 8)),
            Err(AvmuxError::InvalidFormat(_))
        ));
        engine.register_audio_stream(audio_fmt()).unwrap();
        assert!(matches!(
            engine.register_audio_stream(AudioFormat::pcm(48000, 1, 16)),
            Err(AvmuxError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_stream_limit_enforced() {
        let (tx, _rx) = bounded(16);
        let mut config = test_config();
        config.max_audio_streams = 1;
        let engine = SyncEngine::new(config, tx);
        engine.register_audio_stream(audio_fmt()).unwrap();
        assert!(matches!(
            engine.register_audio_stream(audio_fmt()),
            Err(AvmuxError::TooManyStreams(1))
        ));
    }

    #[test]
    fn test_write_unknown_handle() {
        let (tx, _rx) = bounded(16);
        let engine = SyncEngine::new(test_config(), tx);
        let bogus = StreamHandle {
            kind: StreamKind::Audio,
            index: 42,
        };
        assert!(matches!(
            engine.write(bogus, &[0u8; 4], 0),
            Err(AvmuxError::StreamNotFound(42))
        ));
    }

    #[test]
    fn test_unregister_audio_immediate() {
        let (tx, _rx) = bounded(16);
        let engine = SyncEngine::new(test_config(), tx);
        let a = engine.register_audio_stream(audio_fmt()).unwrap();
        engine.unregister_stream(a).unwrap();
        assert!(matches!(
            engine.unregister_stream(a),
            Err(AvmuxError::StreamNotFound(_))
        ));
    }

    #[test]
    fn test_single_video_stream() {
        let (tx, _rx) = bounded(16);
        let engine = SyncEngine::new(test_config(), tx);
        engine.register_video_stream(video_fmt()).unwrap();
        assert!(engine.register_video_stream(video_fmt()).is_err());
    }

    #[test]
    fn test_start_requires_streams() {
        let (tx, _rx) = bounded(16);
        let mut engine = SyncEngine::new(test_config(), tx);
        assert!(engine.start().is_err());
    }

    #[test]
    fn test_epoch_gating_and_interleaving() {
        let (tx, rx) = bounded(256);
        let mut engine = SyncEngine::new(test_config(), tx);
        let a = engine.register_audio_stream(audio_fmt()).unwrap();
        let v = engine.register_video_stream(video_fmt()).unwrap();
        engine.start().unwrap();
        assert_eq!(engine.state(), EngineState::AwaitingEpoch);

        // One stream delivering is not enough for the epoch.
        engine.write(v, &[1u8; 16], engine.now_ms()).unwrap();
        thread::sleep(Duration::from_millis(150));
        assert_eq!(engine.state(), EngineState::AwaitingEpoch);
        assert!(rx.try_recv().is_err(), "nothing may dispatch before the epoch");

        // The moment audio delivers too, dispatch begins.
        engine.write(a, &[0u8; 4], engine.now_ms()).unwrap();
        assert!(wait_until(
            || engine.state() == EngineState::Dispatching,
            Duration::from_secs(2)
        ));

        // Feed a quantum of audio and a frame of video.
        engine.write(a, &vec![0u8; 2000], engine.now_ms()).unwrap();
        engine.write(v, &[2u8; 16], engine.now_ms()).unwrap();

        let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(first.kind, StreamKind::Audio);
        assert_eq!(first.pts_ms, 0);
        assert_eq!(first.data.len(), 2000);

        let second = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(second.kind, StreamKind::Video);
        assert!(
            second.pts_ms < QUANTUM_MS,
            "video may not outrun the audio quantum, got {}",
            second.pts_ms
        );

        engine.stop().unwrap();
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[test]
    fn test_video_only_session_free_runs() {
        let (tx, rx) = bounded(256);
        let mut engine = SyncEngine::new(test_config(), tx);
        let v = engine.register_video_stream(video_fmt()).unwrap();
        engine.start().unwrap();

        engine.write(v, &[1u8; 16], engine.now_ms()).unwrap();
        assert!(wait_until(
            || engine.state() == EngineState::Dispatching,
            Duration::from_secs(2)
        ));
        engine.write(v, &[2u8; 16], engine.now_ms()).unwrap();

        let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(first.kind, StreamKind::Video);
        engine.stop().unwrap();
    }

    #[test]
    fn test_live_audio_add_folds_in() {
        let (tx, rx) = bounded(4096);
        let (event_tx, event_rx) = bounded(64);
        let mut engine = SyncEngine::new(test_config(), tx);
        engine.set_event_channel(event_tx);
        let a = engine.register_audio_stream(audio_fmt()).unwrap();
        engine.start().unwrap();

        let done = AtomicBool::new(false);
        thread::scope(|scope| {
            // Keep the first stream delivering in real time.
            scope.spawn(|| {
                while !done.load(Ordering::Relaxed) {
                    let _ = engine.write(a, &vec![0u8; 200], engine.now_ms());
                    thread::sleep(Duration::from_millis(100));
                }
            });

            assert!(wait_until(
                || engine.state() == EngineState::Dispatching,
                Duration::from_secs(2)
            ));

            // Join a second stream mid-session.
            let b = engine.register_audio_stream(audio_fmt()).unwrap();
            let engine_ref = &engine;
            let done_ref = &done;
            scope.spawn(move || {
                while !done_ref.load(Ordering::Relaxed) {
                    let _ = engine_ref.write(b, &vec![0u8; 200], engine_ref.now_ms());
                    thread::sleep(Duration::from_millis(100));
                }
            });

            let added = wait_for_event(
                &event_rx,
                Duration::from_secs(10),
                |e| matches!(e, EngineEvent::AudioStreamAdded(i) if *i == b.index()),
            );
            assert!(added, "live add did not complete");
            assert_eq!(engine.diagnostics().audio.len(), 2);

            // Mixed output keeps flowing with both streams active.
            let sample = rx.recv_timeout(Duration::from_secs(3)).unwrap();
            assert_eq!(sample.kind, StreamKind::Audio);

            done.store(true, Ordering::Relaxed);
        });
        engine.stop().unwrap();
    }

    #[test]
    fn test_video_swap_replaces_stream() {
        let (tx, _rx) = bounded(4096);
        let mut engine = SyncEngine::new(test_config(), tx);
        let a = engine.register_audio_stream(audio_fmt()).unwrap();
        let v = engine.register_video_stream(video_fmt()).unwrap();
        engine.start().unwrap();

        let done = AtomicBool::new(false);
        thread::scope(|scope| {
            scope.spawn(|| {
                while !done.load(Ordering::Relaxed) {
                    let _ = engine.write(a, &vec![0u8; 200], engine.now_ms());
                    let _ = engine.write(v, &[3u8; 16], engine.now_ms());
                    thread::sleep(Duration::from_millis(100));
                }
            });

            assert!(wait_until(
                || engine.state() == EngineState::Dispatching,
                Duration::from_secs(2)
            ));
            thread::sleep(Duration::from_millis(300));

            let v2 = engine.stage_video_stream(video_fmt()).unwrap();
            assert!(matches!(
                engine.stage_video_stream(video_fmt()),
                Err(AvmuxError::SpliceInProgress)
            ));

            let engine_ref = &engine;
            let done_ref = &done;
            scope.spawn(move || {
                while !done_ref.load(Ordering::Relaxed) {
                    let _ = engine_ref.write(v2, &[4u8; 16], engine_ref.now_ms());
                    thread::sleep(Duration::from_millis(100));
                }
            });

            engine.commit_video_swap(v2).unwrap();

            // The outgoing stream is gone, the incoming one is active.
            assert!(matches!(
                engine.write(v, &[3u8; 16], engine.now_ms()),
                Err(AvmuxError::StreamNotFound(_))
            ));
            assert!(engine.write(v2, &[4u8; 16], engine.now_ms()).is_ok());

            done.store(true, Ordering::Relaxed);
        });
        engine.stop().unwrap();
    }

    #[test]
    fn test_commit_unknown_swap_handle() {
        let (tx, _rx) = bounded(16);
        let engine = SyncEngine::new(test_config(), tx);
        let bogus = StreamHandle {
            kind: StreamKind::Video,
            index: 7,
        };
        assert!(matches!(
            engine.commit_video_swap(bogus),
            Err(AvmuxError::StreamNotFound(7))
        ));
    }

    fn wait_for_event(
        rx: &Receiver<EngineEvent>,
        timeout: Duration,
        mut pred: impl FnMut(&EngineEvent) -> bool,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        while let Some(left) = deadline.checked_duration_since(Instant::now()) {
            match rx.recv_timeout(left) {
                Ok(event) if pred(&event) => return true,
                Ok(_) => continue,
                Err(_) => return false,
            }
        }
        false
    }
}

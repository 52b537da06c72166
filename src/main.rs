//! avmux - drift-corrected A/V sync engine CLI
//!
//! Drives the engine end-to-end from synthetic tone and test-pattern
//! sources; the real system wires capture callbacks to the same API.

use anyhow::Result;
use clap::Parser;
use crossbeam_channel::bounded;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use avmux::audio::AudioFormat;
use avmux::config::{Args, Command, SessionConfig};
use avmux::sync::{OutputSample, StreamKind, SyncEngine};
use avmux::video::VideoFormat;

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args)?;

    // Execute command
    match args.command.unwrap_or_default() {
        Command::Run {
            audio_streams,
            seconds,
            buffer,
            config,
        } => cmd_run(audio_streams, seconds, buffer, config),
        Command::SampleConfig => cmd_sample_config(),
    }
}

fn init_logging(args: &Args) -> Result<()> {
    let level = args.log_level();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    if let Some(log_file) = &args.log {
        let file = std::fs::File::create(log_file)?;
        subscriber.with_writer(file).init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Print a sample session configuration file
fn cmd_sample_config() -> Result<()> {
    print!("{}", SessionConfig::sample_config());
    Ok(())
}

/// Run the engine against synthetic sources
fn cmd_run(
    audio_streams: usize,
    seconds: u64,
    buffer_seconds: u32,
    config_path: Option<String>,
) -> Result<()> {
    println!("avmux - drift-corrected A/V sync engine\n");

    let mut session = match config_path {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::load_default()?,
    };
    session.buffer_seconds = buffer_seconds;

    let (sample_tx, sample_rx) = bounded::<OutputSample>(256);
    let mut engine = SyncEngine::new(session.to_engine_config(), sample_tx);

    // Synthetic sources: N test tones (alternating mono/stereo) and one
    // moving-bar video pattern.
    let audio_format = |i: usize| AudioFormat::pcm(48000, if i % 2 == 0 { 1 } else { 2 }, 16);
    let video_format = VideoFormat {
        width: 320,
        height: 240,
        bytes_per_pixel: 4,
        nominal_frame_duration_ms: 33,
    };

    let mut audio_handles = Vec::new();
    for i in 0..audio_streams {
        audio_handles.push((i, engine.register_audio_stream(audio_format(i))?));
    }
    let video_handle = engine.register_video_stream(video_format.clone())?;

    match engine.start() {
        Ok(()) => println!(
            "Engine running: {} audio stream(s) + video ({}). Press Ctrl+C to stop.\n",
            audio_streams, video_format
        ),
        Err(e) => {
            error!("Failed to start engine: {}", e);
            return Err(e.into());
        }
    }

    // Setup Ctrl+C handler
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    let _ = ctrlc::set_handler(move || {
        println!("\nReceived Ctrl+C, stopping...");
        r.store(false, Ordering::SeqCst);
    });

    let (audio_count, video_count) = thread::scope(|scope| {
        let engine_ref = &engine;
        let running_ref = &running;

        // One tone producer per audio stream
        for (i, handle) in &audio_handles {
            let format = audio_format(*i);
            let handle = *handle;
            let tone_hz = 220.0 * (*i as f64 + 1.0);
            scope.spawn(move || {
                tone_producer(engine_ref, running_ref, handle, format, tone_hz);
            });
        }

        // Moving-bar video producer
        let vf = video_format.clone();
        scope.spawn(move || {
            pattern_producer(engine_ref, running_ref, video_handle, vf);
        });

        // Consumer standing in for the downstream encoder
        let consumer = scope.spawn(move || {
            let mut audio = 0u64;
            let mut video = 0u64;
            while running_ref.load(Ordering::Relaxed) {
                match sample_rx.recv_timeout(Duration::from_millis(200)) {
                    Ok(sample) => match sample.kind {
                        StreamKind::Audio => {
                            audio += 1;
                            info!("Encoded audio quantum {} (pts {} ms)", audio, sample.pts_ms);
                        }
                        StreamKind::Video => video += 1,
                    },
                    Err(_) => {}
                }
            }
            (audio, video)
        });

        let deadline = Instant::now() + Duration::from_secs(seconds);
        while running.load(Ordering::SeqCst) && (seconds == 0 || Instant::now() < deadline) {
            thread::sleep(Duration::from_millis(100));
        }
        running.store(false, Ordering::SeqCst);

        consumer.join().unwrap_or((0, 0))
    });

    let diagnostics = engine.diagnostics();
    engine.stop()?;

    println!("\nSession summary:\n");
    println!("  Audio quanta emitted:  {}", audio_count);
    println!("  Video frames emitted:  {}", video_count);
    for stats in &diagnostics.audio {
        println!(
            "  Audio stream {}: {} ms silence inserted, {} overruns",
            stats.index, stats.filler_ms, stats.overrun_count
        );
    }
    if let Some(video) = &diagnostics.video {
        println!(
            "  Video: {} frames faked, {} overruns, frame duration {} ms{}",
            video.frames_faked,
            video.overrun_count,
            video.frame_duration_ms,
            if video.calibrated { " (calibrated)" } else { "" }
        );
    }
    println!("\nStopped.");

    Ok(())
}

/// Push a sine tone in 20 ms chunks, stamped off the session clock
fn tone_producer(
    engine: &SyncEngine,
    running: &AtomicBool,
    handle: avmux::sync::StreamHandle,
    format: AudioFormat,
    tone_hz: f64,
) {
    let frames_per_chunk = (format.sample_rate / 50) as usize;
    let mut chunk = Vec::with_capacity(format.frames_to_bytes(frames_per_chunk as u32));
    let mut phase = 0.0f64;
    let step = tone_hz * 2.0 * std::f64::consts::PI / format.sample_rate as f64;

    while running.load(Ordering::Relaxed) {
        chunk.clear();
        for _ in 0..frames_per_chunk {
            let sample = (phase.sin() * 8000.0) as i16;
            phase += step;
            for _ in 0..format.channels {
                chunk.extend_from_slice(&sample.to_le_bytes());
            }
        }
        let _ = engine.write(handle, &chunk, engine.now_ms());
        thread::sleep(Duration::from_millis(20));
    }
}

/// Push a moving-bar test pattern at the declared frame rate
fn pattern_producer(
    engine: &SyncEngine,
    running: &AtomicBool,
    handle: avmux::sync::StreamHandle,
    format: VideoFormat,
) {
    let mut frame = vec![0u8; format.frame_size_bytes()];
    let stride = (format.width * format.bytes_per_pixel) as usize;
    let mut tick = 0u32;

    while running.load(Ordering::Relaxed) {
        frame.fill(0x20);
        let bar = ((tick * 4) % format.width) as usize * format.bytes_per_pixel as usize;
        for row in frame.chunks_exact_mut(stride) {
            for b in &mut row[bar..bar + format.bytes_per_pixel as usize] {
                *b = 0xFF;
            }
        }
        tick = tick.wrapping_add(1);
        let _ = engine.write(handle, &frame, engine.now_ms());
        thread::sleep(Duration::from_millis(format.nominal_frame_duration_ms));
    }
}

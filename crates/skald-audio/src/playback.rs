//! Audio rendering through external ALSA sinks.
//!
//! Playback runs in subprocesses (`aplay`, with a `sox tempo` stage when
//! time-stretching) so a misbehaving sink can never take the capture process
//! down, and so `stop_current` can preempt instantly by killing the child.
//! Each PCM stream gets a bounded chunk queue drained by a dedicated writer
//! thread, which absorbs network jitter without blocking the task scheduler.
//!
//! The player holds a non-owning [`ReferenceSink`] so the echo canceller
//! learns exactly what is being rendered: whole-file playback latches
//! timing the moment bytes are handed to the sink; stream teardown releases
//! it.

use skald_core::protocol::StreamKind;
use std::io::{Cursor, Write};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::aec::ReferenceSink;
use crate::error::{AudioError, Result};

const STREAM_QUEUE_CAPACITY: usize = 128;
const STREAM_WRITE_TIMEOUT: Duration = Duration::from_millis(250);
/// Below this deviation the tempo stage is skipped and the sink is direct.
const TEMPO_EPSILON: f32 = 0.01;
const SINK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Extract int16 PCM and the sample rate from a WAV container, for
/// feeding playback audio into the echo canceller's reference buffer.
/// Non-16-bit content is not registered.
pub fn wav_pcm_samples(data: &[u8]) -> Option<(Vec<i16>, u32)> {
    let mut reader = hound::WavReader::new(Cursor::new(data)).ok()?;
    let spec = reader.spec();
    if spec.bits_per_sample != 16 || spec.sample_format != hound::SampleFormat::Int {
        warn!(
            "Skipping reference registration for {}-bit {:?} WAV",
            spec.bits_per_sample, spec.sample_format
        );
        return None;
    }
    let samples: Vec<i16> = if spec.channels <= 1 {
        reader.samples::<i16>().filter_map(|s| s.ok()).collect()
    } else {
        let channels = spec.channels as usize;
        let interleaved: Vec<i16> = reader.samples::<i16>().filter_map(|s| s.ok()).collect();
        interleaved
            .chunks_exact(channels)
            .map(|frame| (frame.iter().map(|&s| s as i32).sum::<i32>() / channels as i32) as i16)
            .collect()
    };
    Some((samples, spec.sample_rate))
}

/// External programs the player drives. Overridable for headless setups
/// and tests.
#[derive(Debug, Clone)]
pub struct SinkPrograms {
    pub player: String,
    pub tempo: String,
    pub mixer: String,
}

impl Default for SinkPrograms {
    fn default() -> Self {
        Self {
            player: "aplay".to_string(),
            tempo: "sox".to_string(),
            mixer: "amixer".to_string(),
        }
    }
}

enum StreamCmd {
    Data(Vec<u8>),
    End,
}

struct StreamSink {
    kind: StreamKind,
    /// The ALSA sink. Kept after `end_stream` so a draining stream stays
    /// reapable by `stop_current`.
    sink: Child,
    /// sox stage ahead of the sink when time-stretching
    tempo_stage: Option<Child>,
    queue: mpsc::Sender<StreamCmd>,
    writer: std::thread::JoinHandle<()>,
}

struct WavSink {
    child: Arc<Mutex<Option<Child>>>,
}

enum ActiveSink {
    Stream(StreamSink),
    Wav(WavSink),
}

/// Handle to a WAV being played on a background thread.
pub struct PlaybackHandle {
    child: Arc<Mutex<Option<Child>>>,
    task: Option<std::thread::JoinHandle<()>>,
}

impl PlaybackHandle {
    /// Terminate the playback promptly.
    pub fn stop(mut self) {
        {
            let mut slot = self.child.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(mut child) = slot.take() {
                let _ = child.kill();
                let _ = child.wait();
            }
        }
        if let Some(task) = self.task.take() {
            let _ = task.join();
        }
    }

    /// Wait for the playback to finish naturally.
    pub fn wait(mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.join();
        }
    }
}

/// Speaker-side playback with at most one active sink. Starting any
/// primitive preempts whatever is currently rendering.
#[derive(Clone)]
pub struct AudioPlayer {
    programs: Arc<SinkPrograms>,
    reference: Arc<dyn ReferenceSink>,
    current: Arc<Mutex<Option<ActiveSink>>>,
    playback_timeout: Duration,
    ducked: Arc<AtomicBool>,
}

impl AudioPlayer {
    pub fn new(reference: Arc<dyn ReferenceSink>, playback_timeout: Duration) -> Self {
        Self::with_programs(reference, playback_timeout, SinkPrograms::default())
    }

    pub fn with_programs(
        reference: Arc<dyn ReferenceSink>,
        playback_timeout: Duration,
        programs: SinkPrograms,
    ) -> Self {
        Self {
            programs: Arc::new(programs),
            reference,
            current: Arc::new(Mutex::new(None)),
            playback_timeout,
            ducked: Arc::new(AtomicBool::new(false)),
        }
    }

    fn current_lock(&self) -> MutexGuard<'_, Option<ActiveSink>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Launch a long-running raw PCM sink fed through a bounded queue.
    pub fn start_stream(
        &self,
        kind: StreamKind,
        sample_rate: u32,
        channels: u16,
        sample_format: &str,
        tempo: f32,
    ) -> Result<()> {
        if sample_format != "s16le" {
            return Err(AudioError::Playback(format!(
                "unsupported stream sample format: {}",
                sample_format
            )));
        }

        self.stop_current();

        let rate = sample_rate.to_string();
        let ch = channels.to_string();
        let use_tempo = (tempo - 1.0).abs() > TEMPO_EPSILON;

        let (sink, tempo_stage, stdin) = if use_tempo {
            let mut stage = Command::new(&self.programs.tempo)
                .args([
                    "-q", "-t", "raw", "-r", &rate, "-e", "signed", "-b", "16", "-c", &ch, "-",
                    "-t", "raw", "-r", &rate, "-e", "signed", "-b", "16", "-c", &ch, "-",
                    "tempo", &format!("{:.3}", tempo),
                ])
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .spawn()
                .map_err(|e| {
                    AudioError::Playback(format!(
                        "failed to launch {}: {}",
                        self.programs.tempo, e
                    ))
                })?;

            let stage_stdin = stage.stdin.take();
            let stage_stdout = stage.stdout.take().ok_or_else(|| {
                AudioError::Playback("tempo stage stdout unavailable".to_string())
            })?;

            let sink = Command::new(&self.programs.player)
                .args(["-q", "-t", "raw", "-f", "S16_LE", "-r", &rate, "-c", &ch, "-"])
                .stdin(Stdio::from(stage_stdout))
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
                .map_err(|e| {
                    AudioError::Playback(format!(
                        "failed to launch {}: {}",
                        self.programs.player, e
                    ))
                })?;

            (sink, Some(stage), stage_stdin)
        } else {
            let mut sink = Command::new(&self.programs.player)
                .args(["-q", "-t", "raw", "-f", "S16_LE", "-r", &rate, "-c", &ch, "-"])
                .stdin(Stdio::piped())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
                .map_err(|e| {
                    AudioError::Playback(format!(
                        "failed to launch {}: {}",
                        self.programs.player, e
                    ))
                })?;
            let stdin = sink.stdin.take();
            (sink, None, stdin)
        };

        let mut stdin = stdin
            .ok_or_else(|| AudioError::Playback("stream sink stdin unavailable".to_string()))?;

        let (queue_tx, mut queue_rx) = mpsc::channel::<StreamCmd>(STREAM_QUEUE_CAPACITY);
        let reference = Arc::clone(&self.reference);
        let writer = std::thread::Builder::new()
            .name("stream-writer".to_string())
            .spawn(move || {
                while let Some(cmd) = queue_rx.blocking_recv() {
                    match cmd {
                        StreamCmd::Data(bytes) => {
                            if let Err(e) = stdin.write_all(&bytes) {
                                warn!("Stream sink write failed: {}", e);
                                break;
                            }
                        }
                        StreamCmd::End => break,
                    }
                }
                // Closing stdin lets the sink drain and exit on its own
                drop(stdin);
                reference.end_playback();
                debug!("Stream writer finished");
            })
            .map_err(|e| AudioError::Playback(format!("writer thread spawn failed: {}", e)))?;

        info!(
            "Started {} stream: {} Hz, {} ch, tempo {:.2}",
            kind, sample_rate, channels, tempo
        );

        *self.current_lock() = Some(ActiveSink::Stream(StreamSink {
            kind,
            sink,
            tempo_stage,
            queue: queue_tx,
            writer,
        }));
        Ok(())
    }

    /// Enqueue one PCM chunk, waiting at most ~250 ms for queue space.
    /// A full queue drops the chunk — that audio is already beyond
    /// recovery, and the capture task must never block on it.
    pub async fn write_stream(&self, data: Vec<u8>) -> bool {
        let sender = match &*self.current_lock() {
            Some(ActiveSink::Stream(stream)) => stream.queue.clone(),
            _ => {
                warn!("write_stream with no active stream, dropping chunk");
                return false;
            }
        };

        match tokio::time::timeout(STREAM_WRITE_TIMEOUT, sender.send(StreamCmd::Data(data))).await
        {
            Ok(Ok(())) => true,
            Ok(Err(_)) => {
                warn!("Stream queue closed, dropping chunk");
                false
            }
            Err(_) => {
                warn!("Stream queue full for {:?}, dropping chunk", STREAM_WRITE_TIMEOUT);
                false
            }
        }
    }

    /// Submit the end sentinel. The sink keeps draining and stays owned by
    /// the registry so a later `stop_current` can still reap it.
    pub async fn end_stream(&self) {
        let sender = match &*self.current_lock() {
            Some(ActiveSink::Stream(stream)) => stream.queue.clone(),
            _ => return,
        };
        let _ = sender.send(StreamCmd::End).await;
    }

    /// Kind of the currently active stream, if any.
    pub fn active_stream_kind(&self) -> Option<StreamKind> {
        match &*self.current_lock() {
            Some(ActiveSink::Stream(stream)) => Some(stream.kind),
            _ => None,
        }
    }

    /// Play a complete WAV, blocking until the sink exits or the playback
    /// ceiling passes. Call from a blocking context.
    pub fn play_wav(&self, data: &[u8]) -> Result<()> {
        let slot = Arc::new(Mutex::new(None));
        self.play_wav_inner(data, slot)
    }

    /// Play a complete WAV on a background thread.
    pub fn play_wav_async(&self, data: Vec<u8>) -> PlaybackHandle {
        let slot: Arc<Mutex<Option<Child>>> = Arc::new(Mutex::new(None));
        let player = self.clone();
        let thread_slot = Arc::clone(&slot);
        let task = std::thread::spawn(move || {
            if let Err(e) = player.play_wav_inner(&data, thread_slot) {
                warn!("Async WAV playback failed: {}", e);
            }
        });
        PlaybackHandle {
            child: slot,
            task: Some(task),
        }
    }

    fn play_wav_inner(&self, data: &[u8], slot: Arc<Mutex<Option<Child>>>) -> Result<()> {
        self.stop_current();

        if let Ok(reader) = hound::WavReader::new(Cursor::new(data)) {
            let spec = reader.spec();
            info!(
                "Playing WAV: {} Hz, {} ch, {}-bit",
                spec.sample_rate, spec.channels, spec.bits_per_sample
            );
        }

        let mut child = Command::new(&self.programs.player)
            .args(["-q", "-t", "wav", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                AudioError::Playback(format!("failed to launch {}: {}", self.programs.player, e))
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| AudioError::Playback("WAV sink stdin unavailable".to_string()))?;

        {
            let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
            *guard = Some(child);
        }
        *self.current_lock() = Some(ActiveSink::Wav(WavSink {
            child: Arc::clone(&slot),
        }));

        // Timing latches at the moment bytes are handed to the sink
        self.reference.start_playback();

        let write_result = stdin.write_all(data);
        drop(stdin);

        let result = match write_result {
            Ok(()) => self.wait_for_sink(&slot),
            Err(e) => {
                let preempted = {
                    let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
                    match guard.take() {
                        Some(mut child) => {
                            let _ = child.kill();
                            let _ = child.wait();
                            false
                        }
                        None => true,
                    }
                };
                if preempted {
                    Ok(())
                } else {
                    Err(AudioError::Playback(format!("WAV sink write failed: {}", e)))
                }
            }
        };

        self.reference.end_playback();
        result
    }

    fn wait_for_sink(&self, slot: &Arc<Mutex<Option<Child>>>) -> Result<()> {
        let deadline = Instant::now() + self.playback_timeout;
        loop {
            let status = {
                let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
                match guard.as_mut() {
                    // Preempted by stop_current: someone else reaped it
                    None => return Ok(()),
                    Some(child) => child
                        .try_wait()
                        .map_err(|e| AudioError::Playback(format!("sink wait failed: {}", e)))?,
                }
            };

            match status {
                Some(exit) => {
                    let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
                    guard.take();
                    if exit.success() {
                        debug!("WAV playback complete");
                        return Ok(());
                    }
                    return Err(AudioError::Playback(format!("sink exited with {}", exit)));
                }
                None => {
                    if Instant::now() >= deadline {
                        let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
                        if let Some(mut child) = guard.take() {
                            let _ = child.kill();
                            let _ = child.wait();
                        }
                        return Err(AudioError::Playback(format!(
                            "playback timed out after {:?}",
                            self.playback_timeout
                        )));
                    }
                    std::thread::sleep(SINK_POLL_INTERVAL);
                }
            }
        }
    }

    /// Kill and reap whichever sink is active. The echo canceller's timing
    /// is torn down in the same critical section so cancellation never uses
    /// stale reference data.
    pub fn stop_current(&self) {
        let taken = self.current_lock().take();
        match taken {
            Some(ActiveSink::Stream(StreamSink {
                kind,
                mut sink,
                tempo_stage,
                queue,
                writer,
            })) => {
                debug!("Preempting {} stream", kind);
                drop(queue);
                let _ = sink.kill();
                let _ = sink.wait();
                if let Some(mut stage) = tempo_stage {
                    let _ = stage.kill();
                    let _ = stage.wait();
                }
                let _ = writer.join();
                self.reference.end_playback();
            }
            Some(ActiveSink::Wav(wav)) => {
                let mut guard = wav.child.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(mut child) = guard.take() {
                    let _ = child.kill();
                    let _ = child.wait();
                }
                self.reference.end_playback();
            }
            None => {}
        }
    }

    /// Advisory volume duck while the user talks over playback. Idempotent.
    pub fn duck_volume(&self, percent: u8) {
        if self.ducked.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Ducking volume to {}%", percent);
        self.set_master_volume(percent);
    }

    /// Restore full volume after the barge-in ends. Idempotent.
    pub fn restore_volume(&self) {
        if !self.ducked.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Restoring volume");
        self.set_master_volume(100);
    }

    pub fn is_volume_ducked(&self) -> bool {
        self.ducked.load(Ordering::SeqCst)
    }

    fn set_master_volume(&self, percent: u8) {
        let result = Command::new(&self.programs.mixer)
            .args(["-q", "set", "Master", &format!("{}%", percent)])
            .status();
        match result {
            Ok(status) if status.success() => {}
            Ok(status) => warn!("{} exited with {}", self.programs.mixer, status),
            Err(e) => warn!("Failed to run {}: {}", self.programs.mixer, e),
        }
    }
}

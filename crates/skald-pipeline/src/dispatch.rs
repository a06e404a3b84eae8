use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use skald_audio::{wav_pcm_samples, AudioPlayer, EchoCanceller, PlaybackHandle, ReferenceSink};
use skald_core::cache::AudioCache;
use skald_core::protocol::{CacheStatus, ServerMessage, SessionState, StreamKind};
use skald_net::{recv_text, send_cache_status, WsSink, WsSource};
use skald_speech::SpeechDetector;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::gate::PlaybackGate;
use crate::session::SessionError;

/// The receive side of a session: parse server messages and drive playback,
/// the cache, the playback gate and the echo canceller's reference state.
/// Rebuilt per session, so dispatch bookkeeping never leaks across
/// reconnects.
pub struct Dispatcher<'a> {
    player: AudioPlayer,
    cache: &'a mut AudioCache,
    detector: Arc<StdMutex<SpeechDetector>>,
    aec: Arc<EchoCanceller>,
    gate: PlaybackGate,
    sink: Arc<Mutex<WsSink>>,

    pending_response_complete: bool,
    tts_first_chunk: bool,
    /// Sample rate announced by the active stream
    stream_rate: u32,
    stream_chunk_counts: HashMap<StreamKind, u64>,
    /// Async loading/prompt playback stopped on `response_complete`
    loading_handle: Option<PlaybackHandle>,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        player: AudioPlayer,
        cache: &'a mut AudioCache,
        detector: Arc<StdMutex<SpeechDetector>>,
        aec: Arc<EchoCanceller>,
        gate: PlaybackGate,
        sink: Arc<Mutex<WsSink>>,
    ) -> Self {
        Self {
            player,
            cache,
            detector,
            aec,
            gate,
            sink,
            pending_response_complete: false,
            tts_first_chunk: true,
            stream_rate: 16_000,
            stream_chunk_counts: HashMap::new(),
            loading_handle: None,
        }
    }

    /// Iterate server messages until the connection ends.
    pub async fn run(mut self, source: &mut WsSource) -> Result<(), SessionError> {
        loop {
            match recv_text(source).await? {
                Some(text) => {
                    if let Some(msg) = ServerMessage::parse(&text) {
                        self.handle(msg).await;
                    }
                }
                None => return Ok(()),
            }
        }
    }

    pub async fn handle(&mut self, msg: ServerMessage) {
        match msg {
            ServerMessage::AudioStreamStart {
                stream,
                sample_rate,
                channels,
                sample_format,
                tempo,
            } => {
                self.on_stream_start(stream, sample_rate, channels, &sample_format, tempo);
            }
            ServerMessage::AudioStreamChunk { stream, data } => {
                self.on_stream_chunk(stream, &data).await;
            }
            ServerMessage::AudioStreamEnd { stream } => {
                debug!("Stream ended: {}", stream);
                self.player.end_stream().await;
            }
            ServerMessage::AudioSentence {
                data,
                sentence_index,
                total_sentences,
                duration_ms,
                sample_rate,
                tempo_applied,
            } => {
                self.on_sentence(
                    &data,
                    sentence_index,
                    total_sentences,
                    duration_ms,
                    sample_rate,
                    tempo_applied,
                )
                .await;
            }
            ServerMessage::AudioCachePlay { cache_key, looped } => {
                self.on_cache_play(&cache_key, looped).await;
            }
            ServerMessage::AudioCacheStore {
                cache_key,
                data,
                sample_rate,
                channels,
                duration_ms,
            } => {
                self.on_cache_store(&cache_key, &data, sample_rate, channels, duration_ms);
            }
            ServerMessage::AudioLoading { data } => {
                self.on_loading(&data);
            }
            ServerMessage::AudioPlayback {
                data,
                chunk,
                total_chunks,
            } => {
                self.on_legacy_playback(&data, chunk, total_chunks).await;
            }
            ServerMessage::ResponseComplete {} => {
                self.on_response_complete();
            }
            ServerMessage::Status { state } => {
                self.on_status(state);
            }
        }
    }

    fn on_stream_start(
        &mut self,
        stream: StreamKind,
        sample_rate: u32,
        channels: u16,
        sample_format: &str,
        tempo: f32,
    ) {
        self.gate.set();
        self.player.stop_current();

        if stream == StreamKind::Tts {
            self.tts_first_chunk = true;
        }

        match self
            .player
            .start_stream(stream, sample_rate, channels, sample_format, tempo)
        {
            Ok(()) => {
                self.stream_rate = sample_rate;
                self.stream_chunk_counts.insert(stream, 0);
            }
            Err(e) => warn!("Failed to start {} stream: {}", stream, e),
        }
    }

    async fn on_stream_chunk(&mut self, stream: StreamKind, data: &str) {
        let Some(bytes) = self.decode(data) else {
            return;
        };

        if self.tts_first_chunk && stream == StreamKind::Tts {
            self.log_ttfa();
            self.tts_first_chunk = false;
        }

        let count = {
            let entry = self.stream_chunk_counts.entry(stream).or_insert(0);
            *entry += 1;
            *entry
        };
        if count % 25 == 0 {
            debug!("stream={} chunks={}", stream, count);
        }

        // The sink is about to render these bytes; they are the echo
        // reference. Streaming playback latches timing on the first chunk.
        let samples = pcm_from_le_bytes(&bytes);
        self.aec
            .register(&samples, self.stream_rate, count == 1, true);

        self.player.write_stream(bytes).await;
    }

    async fn on_sentence(
        &mut self,
        data: &str,
        sentence_index: u32,
        total_sentences: u32,
        duration_ms: u64,
        sample_rate: u32,
        tempo_applied: f32,
    ) {
        let Some(bytes) = self.decode(data) else {
            return;
        };

        self.gate.set();
        self.player.stop_current();

        if sentence_index == 1 {
            self.log_ttfa();
        }

        info!(
            "Sentence {}/{}: {}ms @ {}Hz (tempo {:.3}, {}B)",
            sentence_index,
            total_sentences,
            duration_ms,
            sample_rate,
            tempo_applied,
            bytes.len()
        );

        // Whole-file playback: register the full reference before any byte
        // reaches the sink; play_wav latches timing at submission.
        if let Some((samples, wav_rate)) = wav_pcm_samples(&bytes) {
            self.aec.begin_registration();
            self.aec.register(&samples, wav_rate, false, false);
        }

        let player = self.player.clone();
        match tokio::task::spawn_blocking(move || player.play_wav(&bytes)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Sentence playback failed: {}", e),
            Err(e) => warn!("Sentence playback task failed: {}", e),
        }

        if sentence_index == total_sentences && self.pending_response_complete {
            info!("Final sentence played - resuming mic capture");
            self.gate.clear();
            self.pending_response_complete = false;
        }
    }

    async fn on_cache_play(&mut self, cache_key: &str, looped: bool) {
        debug!("Cache play request: {} (loop={})", cache_key, looped);

        match self.cache.get(cache_key) {
            Some(data) => {
                self.gate.set();
                if looped {
                    self.loading_handle = Some(self.player.play_wav_async(data));
                } else {
                    let player = self.player.clone();
                    match tokio::task::spawn_blocking(move || player.play_wav(&data)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!("Cached playback failed: {}", e),
                        Err(e) => warn!("Cached playback task failed: {}", e),
                    }
                }
            }
            None => {
                info!("Cache miss: {}", cache_key);
                let mut sink = self.sink.lock().await;
                if let Err(e) = send_cache_status(&mut sink, cache_key, CacheStatus::Need).await {
                    warn!("Failed to report cache miss: {}", e);
                }
            }
        }
    }

    fn on_cache_store(
        &mut self,
        cache_key: &str,
        data: &str,
        sample_rate: u32,
        channels: u16,
        duration_ms: u64,
    ) {
        if self.cache.has(cache_key) {
            debug!("Cache already has {}", cache_key);
            return;
        }
        let Some(bytes) = self.decode(data) else {
            return;
        };

        if let Err(e) = self
            .cache
            .store(cache_key, &bytes, sample_rate, channels, duration_ms)
        {
            warn!("Cache store failed for {}: {}", cache_key, e);
        }

        self.gate.set();
        self.loading_handle = Some(self.player.play_wav_async(bytes));
    }

    fn on_loading(&mut self, data: &str) {
        let Some(bytes) = self.decode(data) else {
            return;
        };
        debug!("Loading audio ({}B)", bytes.len());
        self.gate.set();
        self.loading_handle = Some(self.player.play_wav_async(bytes));
    }

    async fn on_legacy_playback(&mut self, data: &str, chunk: u32, total_chunks: u32) {
        let Some(bytes) = self.decode(data) else {
            return;
        };

        self.player.stop_current();
        if chunk == 1 {
            self.log_ttfa();
        }
        debug!("Audio chunk {}/{} ({}B)", chunk, total_chunks, bytes.len());
        self.gate.set();

        let player = self.player.clone();
        match tokio::task::spawn_blocking(move || player.play_wav(&bytes)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Playback failed: {}", e),
            Err(e) => warn!("Playback task failed: {}", e),
        }
    }

    fn on_response_complete(&mut self) {
        self.pending_response_complete = true;

        if let Some(handle) = self.loading_handle.take() {
            handle.stop();
        }
        self.player.stop_current();

        if self.gate.is_set() {
            info!("Response complete - resuming mic capture");
            self.gate.clear();
        }
    }

    fn on_status(&self, state: SessionState) {
        match state {
            SessionState::Active => info!("Session activated - listening"),
            SessionState::Inactive => info!("Session inactive - waiting for wake word"),
            SessionState::Deactivated => info!("Session deactivated"),
        }
    }

    /// Report time-to-first-audio against the last end of user speech.
    /// The timestamp is cleared so a response logs TTFA exactly once.
    fn log_ttfa(&self) {
        let mut detector = self
            .detector
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(ended) = detector.last_speech_ended_at() {
            info!("Time to first audio: {}ms", ended.elapsed().as_millis());
            detector.clear_speech_end();
        }
    }

    fn decode(&self, data: &str) -> Option<Vec<u8>> {
        match BASE64.decode(data) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!("Invalid base64 payload, skipping message: {}", e);
                None
            }
        }
    }
}

fn pcm_from_le_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcm_from_le_bytes() {
        let bytes = [0x02u8, 0x01, 0xFE, 0xFF, 0x00];
        assert_eq!(pcm_from_le_bytes(&bytes), vec![0x0102, -2]);
    }
}

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use futures_util::StreamExt;
use skald_audio::{AudioPlayer, EchoCanceller, SinkPrograms};
use skald_core::cache::AudioCache;
use skald_core::config::{AecConfig, CacheConfig, ClearMode, ClearPolicy};
use skald_core::protocol::{ServerMessage, StreamKind};
use skald_net::ServerConnection;
use skald_pipeline::{Dispatcher, PlaybackGate};
use skald_speech::{SpeechConfig, SpeechDetector};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::accept_async;

/// Mock server that forwards every client text frame to the test.
async fn start_collecting_server() -> (String, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let ws_stream = accept_async(stream).await.unwrap();
                let (_, mut read) = ws_stream.split();
                while let Some(Ok(msg)) = read.next().await {
                    if msg.is_text() {
                        let _ = tx.send(msg.to_text().unwrap().to_string());
                    }
                }
            });
        }
    });

    (format!("ws://127.0.0.1:{}", port), rx)
}

struct Fixture {
    player: AudioPlayer,
    cache: AudioCache,
    detector: Arc<StdMutex<SpeechDetector>>,
    aec: Arc<EchoCanceller>,
    gate: PlaybackGate,
}

fn fixture(cache_dir: &tempfile::TempDir) -> Fixture {
    let aec = Arc::new(EchoCanceller::new(AecConfig::default(), 16_000));
    // `cat` stands in for the ALSA sinks in headless test environments
    let player = AudioPlayer::with_programs(
        aec.clone(),
        Duration::from_secs(5),
        SinkPrograms {
            player: "cat".to_string(),
            tempo: "cat".to_string(),
            mixer: "true".to_string(),
        },
    );
    let cache = AudioCache::open(&CacheConfig {
        directory: cache_dir.path().to_path_buf(),
        clear_policy: ClearPolicy::Mode(ClearMode::Never),
        max_size_mb: 0,
    })
    .unwrap();
    let detector = Arc::new(StdMutex::new(SpeechDetector::new(SpeechConfig::new(
        30.0, 300.0, 900.0,
    ))));

    Fixture {
        player,
        cache,
        detector,
        aec,
        gate: PlaybackGate::new(),
    }
}

fn test_wav(num_samples: usize) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 16_000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut bytes = Vec::new();
    {
        let mut writer = hound::WavWriter::new(std::io::Cursor::new(&mut bytes), spec).unwrap();
        for i in 0..num_samples {
            writer.write_sample((i as i16).wrapping_mul(7)).unwrap();
        }
        writer.finalize().unwrap();
    }
    bytes
}

#[tokio::test]
async fn test_cache_miss_reports_need_then_store_plays() {
    let (url, mut client_msgs) = start_collecting_server().await;
    let (sink, _source) = ServerConnection::new(url).connect().await.unwrap();
    let sink = Arc::new(Mutex::new(sink));

    let dir = tempfile::TempDir::new().unwrap();
    let mut fx = fixture(&dir);
    let mut dispatcher = Dispatcher::new(
        fx.player.clone(),
        &mut fx.cache,
        fx.detector.clone(),
        fx.aec.clone(),
        fx.gate.clone(),
        sink,
    );

    // Miss: nothing plays, the server hears a "need" report
    dispatcher
        .handle(ServerMessage::AudioCachePlay {
            cache_key: "greeting".to_string(),
            looped: false,
        })
        .await;
    assert!(!fx.gate.is_set());

    let report = tokio::time::timeout(Duration::from_secs(5), client_msgs.recv())
        .await
        .unwrap()
        .unwrap();
    let value: serde_json::Value = serde_json::from_str(&report).unwrap();
    assert_eq!(value["type"], "audio_cache_status");
    assert_eq!(value["cache_key"], "greeting");
    assert_eq!(value["status"], "need");

    // Store: file persisted, metadata updated, audio played async
    let wav = test_wav(1600);
    dispatcher
        .handle(ServerMessage::AudioCacheStore {
            cache_key: "greeting".to_string(),
            data: BASE64.encode(&wav),
            sample_rate: 16_000,
            channels: 1,
            duration_ms: 100,
        })
        .await;
    assert!(fx.gate.is_set());
    assert!(dir.path().join("greeting.wav").exists());

    // Subsequent play hits the cache and plays blocking
    fx.gate.clear();
    dispatcher
        .handle(ServerMessage::AudioCachePlay {
            cache_key: "greeting".to_string(),
            looped: false,
        })
        .await;
    assert!(fx.gate.is_set());
}

#[tokio::test]
async fn test_stream_lifecycle_and_response_complete() {
    let (url, _client_msgs) = start_collecting_server().await;
    let (sink, _source) = ServerConnection::new(url).connect().await.unwrap();
    let sink = Arc::new(Mutex::new(sink));

    let dir = tempfile::TempDir::new().unwrap();
    let mut fx = fixture(&dir);
    let mut dispatcher = Dispatcher::new(
        fx.player.clone(),
        &mut fx.cache,
        fx.detector.clone(),
        fx.aec.clone(),
        fx.gate.clone(),
        sink,
    );

    dispatcher
        .handle(ServerMessage::AudioStreamStart {
            stream: StreamKind::Tts,
            sample_rate: 16_000,
            channels: 1,
            sample_format: "s16le".to_string(),
            tempo: 1.0,
        })
        .await;
    assert!(fx.gate.is_set());
    assert_eq!(fx.player.active_stream_kind(), Some(StreamKind::Tts));

    // First chunk starts AEC playback timing
    let pcm: Vec<u8> = (0..640u32).map(|i| (i % 251) as u8).collect();
    dispatcher
        .handle(ServerMessage::AudioStreamChunk {
            stream: StreamKind::Tts,
            data: BASE64.encode(&pcm),
        })
        .await;
    assert!(fx.aec.is_active());

    dispatcher
        .handle(ServerMessage::AudioStreamEnd {
            stream: StreamKind::Tts,
        })
        .await;

    // Response complete clears the gate and tears playback down
    dispatcher.handle(ServerMessage::ResponseComplete {}).await;
    assert!(!fx.gate.is_set());
    assert!(fx.player.active_stream_kind().is_none());
}

#[tokio::test]
async fn test_sentence_preempts_stream_and_clears_gate_when_pending() {
    let (url, _client_msgs) = start_collecting_server().await;
    let (sink, _source) = ServerConnection::new(url).connect().await.unwrap();
    let sink = Arc::new(Mutex::new(sink));

    let dir = tempfile::TempDir::new().unwrap();
    let mut fx = fixture(&dir);
    let mut dispatcher = Dispatcher::new(
        fx.player.clone(),
        &mut fx.cache,
        fx.detector.clone(),
        fx.aec.clone(),
        fx.gate.clone(),
        sink,
    );

    dispatcher
        .handle(ServerMessage::AudioStreamStart {
            stream: StreamKind::Loading,
            sample_rate: 16_000,
            channels: 1,
            sample_format: "s16le".to_string(),
            tempo: 1.0,
        })
        .await;
    assert_eq!(fx.player.active_stream_kind(), Some(StreamKind::Loading));

    // response_complete before the sentence marks the response as pending
    dispatcher.handle(ServerMessage::ResponseComplete {}).await;

    dispatcher
        .handle(ServerMessage::AudioSentence {
            data: BASE64.encode(test_wav(1600)),
            sentence_index: 1,
            total_sentences: 1,
            duration_ms: 100,
            sample_rate: 16_000,
            tempo_applied: 1.0,
        })
        .await;

    // The loading stream was preempted and the final sentence released the mic
    assert!(fx.player.active_stream_kind().is_none());
    assert!(!fx.gate.is_set());
}

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use futures_util::{SinkExt, StreamExt};
use skald_core::protocol::{CacheStatus, ServerMessage};
use skald_net::{recv_text, send_audio_chunk, send_cache_status, send_end_speech, ServerConnection};
use tokio::net::TcpListener;
use tokio_tungstenite::accept_async;

/// Mock assistant server: asserts the client wire format and answers with
/// canned server messages.
struct MockServer {
    port: u16,
}

impl MockServer {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let ws_stream = accept_async(stream).await.unwrap();
                    let (mut write, mut read) = ws_stream.split();

                    while let Some(Ok(msg)) = read.next().await {
                        if !msg.is_text() {
                            continue;
                        }
                        let value: serde_json::Value =
                            serde_json::from_str(msg.to_text().unwrap()).unwrap();
                        let response = match value["type"].as_str().unwrap() {
                            "audio_chunk" => {
                                assert!(value["data"].is_string());
                                assert!(value["timestamp"].is_string());
                                r#"{"type":"status","state":"active"}"#
                            }
                            "end_speech" => {
                                r#"{"type":"audio_stream_start","stream":"loading","sample_rate":16000,"channels":1,"sample_format":"s16le","tempo":1.0}"#
                            }
                            "audio_cache_status" => {
                                assert_eq!(value["status"].as_str().unwrap(), "need");
                                r#"{"type":"response_complete"}"#
                            }
                            other => panic!("unexpected client message type: {}", other),
                        };
                        let _ = write
                            .send(tokio_tungstenite::tungstenite::Message::Text(
                                response.to_string().into(),
                            ))
                            .await;
                    }
                });
            }
        });

        Self { port }
    }

    fn url(&self) -> String {
        format!("ws://127.0.0.1:{}", self.port)
    }
}

#[tokio::test]
async fn test_client_messages_round_trip() {
    let server = MockServer::start().await;
    let conn = ServerConnection::new(server.url());
    let (mut sink, mut source) = conn.connect().await.unwrap();

    let samples: Vec<i16> = (0..480).map(|i| (i * 13) as i16).collect();
    send_audio_chunk(&mut sink, &samples).await.unwrap();
    let reply = recv_text(&mut source).await.unwrap().unwrap();
    assert!(matches!(
        ServerMessage::parse(&reply),
        Some(ServerMessage::Status { .. })
    ));

    send_end_speech(&mut sink).await.unwrap();
    let reply = recv_text(&mut source).await.unwrap().unwrap();
    match ServerMessage::parse(&reply) {
        Some(ServerMessage::AudioStreamStart { sample_rate, .. }) => {
            assert_eq!(sample_rate, 16000);
        }
        other => panic!("unexpected reply: {:?}", other),
    }

    send_cache_status(&mut sink, "greeting", CacheStatus::Need)
        .await
        .unwrap();
    let reply = recv_text(&mut source).await.unwrap().unwrap();
    assert!(matches!(
        ServerMessage::parse(&reply),
        Some(ServerMessage::ResponseComplete {})
    ));
}

#[tokio::test]
async fn test_audio_chunk_payload_decodes_to_input_pcm() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws_stream = accept_async(stream).await.unwrap();
        let (_, mut read) = ws_stream.split();
        let msg = read.next().await.unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(msg.to_text().unwrap()).unwrap();
        BASE64.decode(value["data"].as_str().unwrap()).unwrap()
    });

    let conn = ServerConnection::new(format!("ws://127.0.0.1:{}", port));
    let (mut sink, _source) = conn.connect().await.unwrap();

    let samples: Vec<i16> = vec![1000, -1000, i16::MAX, i16::MIN];
    send_audio_chunk(&mut sink, &samples).await.unwrap();

    let payload = server.await.unwrap();
    let decoded: Vec<i16> = payload
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    assert_eq!(decoded, samples);
}

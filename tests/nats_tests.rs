use base64::Engine;
use scribe_stream::nats::messages::{AudioFrameMessage, ExtractionReply, ExtractionRequest, TranscriptMessage};

#[test]
fn test_audio_frame_serialization() {
    let msg = AudioFrameMessage {
        session_id: "3f1c-request".to_string(),
        sequence: 0,
        pcm: base64::engine::general_purpose::STANDARD.encode([0u8; 100]),
        sample_rate: 16000,
        channels: 1,
        timestamp: "2026-03-02T09:15:00Z".to_string(),
        final_frame: false,
    };

    let json = serde_json::to_string(&msg).unwrap();
    assert!(json.contains("3f1c-request"));
    assert!(json.contains("\"final\":false"));
    assert!(json.contains("\"sequence\":0"));

    let deserialized: AudioFrameMessage = serde_json::from_str(&json).unwrap();
    assert_eq!(deserialized.session_id, "3f1c-request");
    assert_eq!(deserialized.sample_rate, 16000);
    assert_eq!(deserialized.channels, 1);
    assert!(!deserialized.final_frame);
}

#[test]
fn test_audio_frame_final_marker() {
    let msg = AudioFrameMessage {
        session_id: "3f1c-request".to_string(),
        sequence: 7,
        pcm: String::new(),
        sample_rate: 16000,
        channels: 1,
        timestamp: "2026-03-02T09:15:07Z".to_string(),
        final_frame: true,
    };

    let json = serde_json::to_string(&msg).unwrap();
    assert!(json.contains("\"final\":true"));

    let deserialized: AudioFrameMessage = serde_json::from_str(&json).unwrap();
    assert!(deserialized.final_frame);
    assert_eq!(deserialized.sequence, 7);
}

#[test]
fn test_transcript_deserialization() {
    let json = r#"{
        "session_id": "3f1c-request",
        "text": "Patient reports chest pain",
        "partial": false,
        "timestamp": "2026-03-02T09:15:09Z",
        "confidence": 0.95
    }"#;

    let msg: TranscriptMessage = serde_json::from_str(json).unwrap();
    assert_eq!(msg.session_id, "3f1c-request");
    assert_eq!(msg.text, "Patient reports chest pain");
    assert!(!msg.partial);
    assert_eq!(msg.confidence, Some(0.95));
}

#[test]
fn test_transcript_optional_fields() {
    // Neither timestamp nor confidence are required
    let json = r#"{
        "session_id": "3f1c-request",
        "text": "",
        "partial": false
    }"#;

    let msg: TranscriptMessage = serde_json::from_str(json).unwrap();
    assert!(msg.text.is_empty());
    assert!(msg.timestamp.is_empty());
    assert_eq!(msg.confidence, None);
}

#[test]
fn test_extraction_request_and_reply() {
    let request = ExtractionRequest {
        session_id: "s1".to_string(),
        text: "chest pain since monday".to_string(),
    };
    let json = serde_json::to_value(&request).unwrap();
    assert_eq!(json["session_id"], "s1");
    assert_eq!(json["text"], "chest pain since monday");

    let success: ExtractionReply =
        serde_json::from_str(r#"{"status": "success", "data": {"symptoms": ["chest pain"]}}"#).unwrap();
    assert_eq!(success.status, "success");
    assert_eq!(success.data["symptoms"][0], "chest pain");
    assert!(success.error.is_none());

    let failure: ExtractionReply =
        serde_json::from_str(r#"{"status": "error", "error": "model overloaded"}"#).unwrap();
    assert_eq!(failure.status, "error");
    assert!(failure.data.is_null());
    assert_eq!(failure.error.as_deref(), Some("model overloaded"));
}

#[test]
fn test_pcm_encoding_roundtrip() {
    let original_samples: Vec<i16> = vec![100, -200, 300, -400];

    let pcm_bytes: Vec<u8> = original_samples.iter().flat_map(|&s| s.to_le_bytes()).collect();
    let encoded = base64::engine::general_purpose::STANDARD.encode(&pcm_bytes);

    let decoded_bytes = base64::engine::general_purpose::STANDARD.decode(&encoded).unwrap();
    let decoded_samples: Vec<i16> = decoded_bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect();

    assert_eq!(decoded_samples, original_samples);
}

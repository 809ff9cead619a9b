//! Realtime wire events
//!
//! Client events are serialized to the JSON messages the endpoint expects;
//! server messages are demultiplexed into [`RealtimeSignal`]s.

use base64::Engine;
use serde_json::{Value, json};

/// Message sent to the realtime endpoint
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Configure the session
    SessionUpdate(SessionSettings),
    /// Append PCM16 microphone audio to the input buffer
    AppendAudio(Vec<u8>),
    /// Drop buffered input audio
    ClearAudio,
    /// Ask for a response, optionally with one-off instructions
    CreateResponse { instructions: Option<String> },
    /// Cancel the response in progress
    CancelResponse,
}

/// Session configuration sent on connect
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub instructions: String,
    pub voice: String,
    pub transcription_model: String,
    pub language: Option<String>,
}

impl ClientEvent {
    /// Wire JSON for this event
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::SessionUpdate(settings) => {
                let mut transcription = json!({ "model": settings.transcription_model });
                if let Some(language) = &settings.language {
                    transcription["language"] = json!(language);
                }
                json!({
                    "type": "session.update",
                    "session": {
                        "instructions": settings.instructions,
                        "voice": settings.voice,
                        "input_audio_format": "pcm16",
                        "output_audio_format": "pcm16",
                        "input_audio_transcription": transcription,
                        "turn_detection": {
                            "type": "server_vad",
                            "silence_duration_ms": 700
                        }
                    }
                })
            }
            Self::AppendAudio(pcm) => json!({
                "type": "input_audio_buffer.append",
                "audio": base64::engine::general_purpose::STANDARD.encode(pcm),
            }),
            Self::ClearAudio => json!({ "type": "input_audio_buffer.clear" }),
            Self::CreateResponse { instructions } => match instructions {
                Some(instructions) => json!({
                    "type": "response.create",
                    "response": { "instructions": instructions }
                }),
                None => json!({ "type": "response.create" }),
            },
            Self::CancelResponse => json!({ "type": "response.cancel" }),
        }
    }
}

/// Demultiplexed server event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RealtimeSignal {
    /// Session created or updated
    SessionReady,
    /// Partial transcript of the user's speech
    UserTranscriptDelta(String),
    /// Final transcript of the user's speech
    UserTranscript(String),
    /// Remote VAD detected the user speaking
    UserSpeechStarted,
    /// Remote VAD detected the user stopped
    UserSpeechStopped,
    /// Transcript fragment of the assistant's reply
    AssistantTranscriptDelta(String),
    /// PCM16 audio of the assistant's reply
    AssistantAudio(Vec<u8>),
    /// Assistant audio output began
    AssistantSpeakingStarted,
    /// Assistant audio output stopped
    AssistantSpeakingStopped,
    /// Response finished (or was cancelled)
    ResponseDone,
    /// Endpoint-reported error
    Error(String),
    /// Connection closed
    Closed,
}

/// Parse one server message into signals
///
/// Unknown event types yield nothing; malformed JSON yields an error signal.
#[must_use]
pub fn parse_server_event(json_text: &str) -> Vec<RealtimeSignal> {
    let value: Value = match serde_json::from_str(json_text) {
        Ok(v) => v,
        Err(e) => return vec![RealtimeSignal::Error(format!("malformed server event: {e}"))],
    };

    let text_field = |field: &str| {
        value
            .get(field)
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
    };

    let event_type = value.get("type").and_then(Value::as_str).unwrap_or("");
    let signal = match event_type {
        "session.created" | "session.updated" => Some(RealtimeSignal::SessionReady),
        "conversation.item.input_audio_transcription.delta" => {
            text_field("delta").map(RealtimeSignal::UserTranscriptDelta)
        }
        "conversation.item.input_audio_transcription.completed" => {
            text_field("transcript").map(RealtimeSignal::UserTranscript)
        }
        "input_audio_buffer.speech_started" => Some(RealtimeSignal::UserSpeechStarted),
        "input_audio_buffer.speech_stopped" => Some(RealtimeSignal::UserSpeechStopped),
        "response.audio_transcript.delta" | "response.output_audio_transcript.delta" => {
            text_field("delta").map(RealtimeSignal::AssistantTranscriptDelta)
        }
        "response.audio.delta" | "response.output_audio.delta" => text_field("delta")
            .and_then(|b64| base64::engine::general_purpose::STANDARD.decode(b64).ok())
            .map(RealtimeSignal::AssistantAudio),
        "output_audio_buffer.started" => Some(RealtimeSignal::AssistantSpeakingStarted),
        "output_audio_buffer.stopped" => Some(RealtimeSignal::AssistantSpeakingStopped),
        "response.done" | "response.cancelled" => Some(RealtimeSignal::ResponseDone),
        "error" => {
            let message = value
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("unknown realtime error");
            Some(RealtimeSignal::Error(message.to_string()))
        }
        other => {
            tracing::trace!(event_type = other, "realtime event ignored");
            None
        }
    };

    signal.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_update_configures_pcm16_and_transcription() {
        let event = ClientEvent::SessionUpdate(SessionSettings {
            instructions: "Eres un coach".to_string(),
            voice: "alloy".to_string(),
            transcription_model: "gpt-4o-mini-transcribe".to_string(),
            language: Some("es".to_string()),
        });
        let msg = event.to_json();
        assert_eq!(msg["type"], "session.update");
        assert_eq!(msg["session"]["input_audio_format"], "pcm16");
        assert_eq!(msg["session"]["input_audio_transcription"]["language"], "es");
    }

    #[test]
    fn audio_is_base64_encoded() {
        let msg = ClientEvent::AppendAudio(vec![0, 1, 2, 3]).to_json();
        assert_eq!(msg["type"], "input_audio_buffer.append");
        assert_eq!(msg["audio"], "AAECAw==");
    }

    #[test]
    fn parses_transcripts() {
        assert_eq!(
            parse_server_event(
                r#"{"type":"conversation.item.input_audio_transcription.completed","transcript":"Hola"}"#
            ),
            vec![RealtimeSignal::UserTranscript("Hola".to_string())]
        );
        assert_eq!(
            parse_server_event(r#"{"type":"response.audio_transcript.delta","delta":"Bien"}"#),
            vec![RealtimeSignal::AssistantTranscriptDelta("Bien".to_string())]
        );
    }

    #[test]
    fn empty_transcripts_are_skipped() {
        assert!(
            parse_server_event(
                r#"{"type":"conversation.item.input_audio_transcription.completed","transcript":""}"#
            )
            .is_empty()
        );
    }

    #[test]
    fn decodes_audio_delta() {
        assert_eq!(
            parse_server_event(r#"{"type":"response.audio.delta","delta":"AAECAw=="}"#),
            vec![RealtimeSignal::AssistantAudio(vec![0, 1, 2, 3])]
        );
    }

    #[test]
    fn error_and_garbage() {
        assert_eq!(
            parse_server_event(r#"{"type":"error","error":{"message":"bad key"}}"#),
            vec![RealtimeSignal::Error("bad key".to_string())]
        );
        assert!(matches!(
            parse_server_event("not json").as_slice(),
            [RealtimeSignal::Error(_)]
        ));
        assert!(parse_server_event(r#"{"type":"rate_limits.updated"}"#).is_empty());
    }
}

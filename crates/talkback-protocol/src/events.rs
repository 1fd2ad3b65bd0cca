use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::{MessageRole, TokenUsage};

/// Messages sent from the client to the provider over the data channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Configure the realtime session
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },

    /// Stop the response currently being generated
    #[serde(rename = "response.cancel")]
    ResponseCancel,
}

/// Body of `session.update`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub modalities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    pub voice: String,
    pub input_audio_format: String,
    pub output_audio_format: String,
    pub input_audio_transcription: TranscriptionConfig,
    pub turn_detection: TurnDetection,
    #[serde(default)]
    pub tools: Vec<Value>,
    pub tool_choice: String,
    pub temperature: f32,
    pub max_response_output_tokens: u32,
}

impl SessionConfig {
    /// Session configuration tuned for low-latency spoken turn-taking
    pub fn for_voice(voice: impl Into<String>) -> Self {
        Self {
            modalities: vec!["text".to_string(), "audio".to_string()],
            instructions: None,
            voice: voice.into(),
            input_audio_format: "pcm16".to_string(),
            output_audio_format: "pcm16".to_string(),
            input_audio_transcription: TranscriptionConfig {
                model: "whisper-1".to_string(),
            },
            turn_detection: TurnDetection::default(),
            tools: Vec::new(),
            tool_choice: "auto".to_string(),
            temperature: 0.8,
            max_response_output_tokens: 4096,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    pub model: String,
}

/// Server-side voice activity detection parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: String,
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

impl Default for TurnDetection {
    fn default() -> Self {
        Self {
            kind: "server_vad".to_string(),
            threshold: 0.3,
            prefix_padding_ms: 100,
            silence_duration_ms: 200,
        }
    }
}

/// Messages received from the provider over the data channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// Server VAD heard the user start speaking
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted {
        #[serde(default)]
        item_id: Option<String>,
    },

    /// Server VAD heard the user stop speaking
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped {
        #[serde(default)]
        item_id: Option<String>,
    },

    /// Input audio buffer committed as a user turn
    #[serde(rename = "input_audio_buffer.committed")]
    InputCommitted {
        #[serde(default)]
        item_id: Option<String>,
    },

    /// A response started generating
    #[serde(rename = "response.created")]
    ResponseCreated {
        #[serde(default)]
        response: Option<ResponseData>,
    },

    /// A chunk of assistant audio
    #[serde(rename = "response.audio.delta", alias = "response.output_audio.delta")]
    AudioDelta {
        #[serde(default)]
        response_id: Option<String>,
    },

    /// Assistant audio for the response is complete
    #[serde(rename = "response.audio.done", alias = "response.output_audio.done")]
    AudioDone {
        #[serde(default)]
        response_id: Option<String>,
    },

    /// The response finished, usually with usage statistics
    #[serde(rename = "response.done")]
    ResponseDone {
        #[serde(default)]
        response: Option<ResponseData>,
    },

    /// A conversation item (turn) is complete
    #[serde(rename = "conversation.item.done")]
    ConversationItemDone {
        #[serde(default)]
        item: Option<ConversationItem>,
    },

    /// Application-level error reported by the provider
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        error: Option<ProviderError>,
    },

    #[serde(other)]
    Unrecognized,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseData {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
}

/// A single turn of the conversation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationItem {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub role: Option<ItemRole>,
    #[serde(default)]
    pub content: Vec<ContentPart>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemRole {
    User,
    Assistant,
    System,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub transcript: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderError {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
}

/// Text placed in the transcript when a user turn carried audio but no transcription
pub const VOICE_MESSAGE_PLACEHOLDER: &str = "[voice message]";

impl ConversationItem {
    /// The role and text to persist for this item, if it is a transcribed turn.
    ///
    /// User turns are stored whenever the first content part is input audio
    /// (falling back to a placeholder without a transcript); assistant turns
    /// only when the first part is output audio with a transcript.
    pub fn transcript(&self) -> Option<(MessageRole, String)> {
        let first = self.content.first()?;
        match self.role? {
            ItemRole::User if first.kind == "input_audio" => {
                let text = first
                    .transcript
                    .as_deref()
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .unwrap_or(VOICE_MESSAGE_PLACEHOLDER);
                Some((MessageRole::User, text.to_string()))
            }
            ItemRole::Assistant if first.kind == "output_audio" || first.kind == "audio" => first
                .transcript
                .as_deref()
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(|t| (MessageRole::Assistant, t.to_string())),
            _ => None,
        }
    }
}

/// Why an inbound data-channel message could not be turned into a [`ServerEvent`]
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed event: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("event has no type discriminant")]
    MissingType,

    #[error("unknown event type: {0}")]
    UnknownType(String),
}

impl ServerEvent {
    /// Decode one data-channel text frame.
    ///
    /// Unknown event types are reported as [`DecodeError::UnknownType`] rather
    /// than silently mapped, so callers can log them.
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_str(text)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(DecodeError::MissingType)?
            .to_string();

        match serde_json::from_value(value)? {
            ServerEvent::Unrecognized => Err(DecodeError::UnknownType(kind)),
            event => Ok(event),
        }
    }
}

impl ClientEvent {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

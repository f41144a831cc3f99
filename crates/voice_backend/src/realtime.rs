#[cfg(any(test, feature = "test-support"))]
mod fake_realtime_client;
mod reqwest_realtime_client;

use crate::{
    db::{conversation_message::MessageType, Database, UserId, DEFAULT_VOICE},
    Result,
};
use async_trait::async_trait;
use serde::Serialize;

#[cfg(any(test, feature = "test-support"))]
pub use fake_realtime_client::*;
pub use reqwest_realtime_client::*;

pub const DEFAULT_MODEL: &str = "gpt-realtime";

/// How many past messages are replayed into a new session's instructions.
pub const HISTORY_LENGTH: u64 = 6;

const FEMALE_VOICES: &[&str] = &["marin", "coral", "shimmer"];

const FEMALE_VOICE_NOTE: &str = "\n\nIMPORTANT: You are speaking with a female voice, so always \
refer to yourself using feminine grammatical forms in languages that distinguish them.";

const DEFAULT_FEMALE_PROMPT: &str = "\
You are a friendly and attentive AI assistant. You speak with a female voice and should use \
feminine grammatical forms when referring to yourself.

Guidelines:
- Use feminine forms when referring to yourself
- Speak naturally and warmly
- Be helpful and responsive
- Keep answers short but informative
- Keep the conversation lively
- Always answer in the language the user speaks to you in

Remember: you are an assistant with a female voice, talk accordingly.";

const DEFAULT_PROMPT: &str = "\
You are a friendly and helpful AI assistant. Answer naturally and to the point.

Guidelines:
- Keep answers short but informative
- Be helpful and responsive
- Keep the conversation lively
- Always answer in the language the user speaks to you in";

#[derive(Debug, thiserror::Error)]
pub enum RealtimeError {
    #[error("realtime API did not respond in time")]
    Timeout,
    #[error("realtime API returned status {0}")]
    Status(u16),
    #[error("realtime API request failed: {0}")]
    Transport(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RealtimeSession {
    #[serde(rename = "type")]
    pub kind: String,
    pub model: String,
    pub audio: SessionAudio,
    pub instructions: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SessionAudio {
    pub output: SessionAudioOutput,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SessionAudioOutput {
    pub voice: String,
}

impl RealtimeSession {
    pub fn new(model: String, voice: String, instructions: String) -> Self {
        Self {
            kind: "realtime".into(),
            model,
            audio: SessionAudio {
                output: SessionAudioOutput { voice },
            },
            instructions,
        }
    }
}

/// Issues short-lived client credentials for the upstream realtime voice API.
#[async_trait]
pub trait RealtimeClient: Send + Sync {
    async fn create_client_secret(
        &self,
        session: &RealtimeSession,
    ) -> Result<serde_json::Value, RealtimeError>;
}

/// A past message replayed into the instructions of a new session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HistoryEntry {
    pub message_type: MessageType,
    pub content: String,
}

/// The selected prompt's content and its voice gender, if it declares one.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SelectedPrompt {
    pub content: String,
    pub voice_gender: Option<String>,
}

pub fn is_female_voice(voice: &str) -> bool {
    FEMALE_VOICES.contains(&voice)
}

pub fn build_instructions(
    prompt: Option<&SelectedPrompt>,
    voice: &str,
    history: &[HistoryEntry],
) -> String {
    let mut instructions = match prompt {
        Some(prompt) => {
            let mut content = prompt.content.clone();
            if is_female_voice(voice) || prompt.voice_gender.as_deref() == Some("female") {
                content.push_str(FEMALE_VOICE_NOTE);
            }
            content
        }
        None if is_female_voice(voice) => DEFAULT_FEMALE_PROMPT.to_string(),
        None => DEFAULT_PROMPT.to_string(),
    };

    if !history.is_empty() {
        instructions.push_str("\n\nPREVIOUS CONVERSATION:\n");
        for entry in history {
            let speaker = match entry.message_type {
                MessageType::User => "User",
                MessageType::Assistant => "You",
            };
            instructions.push_str(speaker);
            instructions.push_str(": ");
            instructions.push_str(&entry.content);
            instructions.push('\n');
        }
        instructions.push_str(
            "\nContinue the conversation with this context in mind. If the user asks what you \
             talked about, refer to it.",
        );
    }
    instructions
}

/// Builds the session for `user_id` (or an anonymous default session) and
/// asks the upstream API for a client secret.
pub async fn create_session_token(
    db: &Database,
    client: &dyn RealtimeClient,
    user_id: Option<UserId>,
) -> Result<serde_json::Value> {
    let session = match user_id {
        Some(user_id) => session_for_user(db, user_id).await?,
        None => RealtimeSession::new(
            DEFAULT_MODEL.into(),
            DEFAULT_VOICE.into(),
            build_instructions(None, DEFAULT_VOICE, &[]),
        ),
    };

    tracing::info!(
        ?user_id,
        model = %session.model,
        voice = %session.audio.output.voice,
        "creating realtime session"
    );
    Ok(client.create_client_secret(&session).await?)
}

async fn session_for_user(db: &Database, user_id: UserId) -> Result<RealtimeSession> {
    let user = db.get_user_by_id(user_id).await?.user;
    let model = user
        .selected_model
        .filter(|model| !model.is_empty())
        .unwrap_or_else(|| DEFAULT_MODEL.into());
    let voice = user
        .selected_voice
        .filter(|voice| !voice.is_empty())
        .unwrap_or_else(|| DEFAULT_VOICE.into());

    let prompt = db
        .get_selected_prompt(user_id)
        .await?
        .map(|prompt| SelectedPrompt {
            content: prompt.content,
            voice_gender: prompt.voice_gender,
        });

    let history = match db.get_recent_conversation(user_id, HISTORY_LENGTH).await {
        Ok(messages) => messages
            .into_iter()
            .map(|message| HistoryEntry {
                message_type: message.message_type,
                content: message.content,
            })
            .collect(),
        Err(error) => {
            tracing::warn!(%user_id, ?error, "failed to load conversation history");
            Vec::new()
        }
    };

    let instructions = build_instructions(prompt.as_ref(), &voice, &history);
    Ok(RealtimeSession::new(model, voice, instructions))
}

//! Wire types shared by the client-facing HTTP API and the provider-facing
//! duplex channel: OpenAI-compatible chat-completion shapes plus the framed
//! messages exchanged with provider nodes.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// OpenAI-compatible chat types
// ---------------------------------------------------------------------------

/// OpenAI-compatible chat completion request.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stream: bool,
    /// Per-request deadline override in seconds, clamped to the hard cap.
    #[serde(default)]
    pub timeout: Option<u64>,
}

/// OpenAI-compatible chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: Option<MessageContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<serde_json::Value>),
}

impl MessageContent {
    pub fn as_text(&self) -> &str {
        match self {
            Self::Text(s) => s,
            Self::Parts(_) => "",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// Chat completion response as produced by a provider node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default = "default_completion_object")]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Usage,
}

fn default_completion_object() -> String {
    "chat.completion".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    #[serde(default)]
    pub index: u32,
    pub message: ResponseMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub role: String,
    pub content: Option<String>,
}

/// Token usage reported by the provider.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

// ---------------------------------------------------------------------------
// Enriched client response
// ---------------------------------------------------------------------------

/// Chat completion response returned to API clients: the provider's answer
/// extended with tier, provider handle, and MULE accounting fields.
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionReply {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: ExtendedUsage,
    pub model_tier: String,
    pub provider_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtendedUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub mule_amount: f64,
    pub duration_seconds: f64,
    pub tokens_per_second: f64,
    pub transaction_mule_cost: f64,
}

// ---------------------------------------------------------------------------
// Provider duplex frames
// ---------------------------------------------------------------------------

/// Messages a provider node sends to the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ProviderFrame {
    /// Registration handshake; must be the first message on a session.
    Register {
        #[serde(default)]
        api_key: Option<String>,
        models: Vec<ModelAdvert>,
    },
    /// Keep-alive reply to a broker ping.
    Pong,
    /// Correlated answer to a forwarded completion request.
    CompletionResponse { id: Uuid, response: ChatResponse },
}

/// Messages the broker sends to a provider node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BrokerFrame {
    /// Registration acknowledgment.
    Registered,
    /// Fatal session error; the connection closes after this frame.
    Error { error: String },
    /// Keep-alive probe.
    Ping,
    /// A completion request to execute on a local model.
    CompletionRequest {
        id: Uuid,
        model: String,
        messages: Vec<ChatMessage>,
        #[serde(skip_serializing_if = "Option::is_none")]
        temperature: Option<f32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        max_tokens: Option<u32>,
    },
}

/// An advertised model: either a bare name or an object carrying extra
/// detail. Only the canonical string form feeds the classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModelAdvert {
    Name(String),
    Detailed {
        name: String,
        #[serde(default)]
        #[serde(skip_serializing_if = "Option::is_none")]
        tier: Option<String>,
    },
}

impl ModelAdvert {
    /// Canonical string form of the advertised model.
    pub fn name(&self) -> &str {
        match self {
            Self::Name(name) => name,
            Self::Detailed { name, .. } => name,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_frame_round_trip() {
        let raw = r#"{"op":"register","api_key":"sk-mule-abc","models":["mistral:7b",{"name":"tinyllama","tier":"small"}]}"#;
        let frame: ProviderFrame = serde_json::from_str(raw).unwrap();
        match &frame {
            ProviderFrame::Register { api_key, models } => {
                assert_eq!(api_key.as_deref(), Some("sk-mule-abc"));
                assert_eq!(models.len(), 2);
                assert_eq!(models[0].name(), "mistral:7b");
                assert_eq!(models[1].name(), "tinyllama");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_register_without_key_is_anonymous() {
        let raw = r#"{"op":"register","models":["tinyllama"]}"#;
        let frame: ProviderFrame = serde_json::from_str(raw).unwrap();
        assert!(matches!(
            frame,
            ProviderFrame::Register { api_key: None, .. }
        ));
    }

    #[test]
    fn test_completion_request_serialization() {
        let id = Uuid::new_v4();
        let frame = BrokerFrame::CompletionRequest {
            id,
            model: "mistral:7b".to_string(),
            messages: vec![ChatMessage {
                role: MessageRole::User,
                content: Some(MessageContent::Text("hi".to_string())),
                name: None,
            }],
            temperature: Some(0.7),
            max_tokens: None,
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["op"], "completion_request");
        assert_eq!(json["id"], id.to_string());
        assert_eq!(json["model"], "mistral:7b");
        assert!(json.get("max_tokens").is_none());
    }

    #[test]
    fn test_completion_response_with_missing_usage() {
        let raw = format!(
            r#"{{"op":"completion_response","id":"{}","response":{{"choices":[{{"message":{{"role":"assistant","content":"hello"}}}}]}}}}"#,
            Uuid::new_v4()
        );
        let frame: ProviderFrame = serde_json::from_str(&raw).unwrap();
        match frame {
            ProviderFrame::CompletionResponse { response, .. } => {
                assert_eq!(response.usage.total_tokens, 0);
                assert_eq!(
                    response.choices[0].message.content.as_deref(),
                    Some("hello")
                );
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_pong_frame() {
        let frame: ProviderFrame = serde_json::from_str(r#"{"op":"pong"}"#).unwrap();
        assert!(matches!(frame, ProviderFrame::Pong));
        assert_eq!(
            serde_json::to_value(&BrokerFrame::Ping).unwrap()["op"],
            "ping"
        );
    }
}

use std::env;
use std::fmt;

/// Fallback sent when the assistant reply was pure structured data or too
/// short to be worth showing.
pub const ACK_REPLY: &str = "We received your request. A reply will follow shortly.";

pub const AI_ERROR_REPLY: &str =
    "Sorry, an error occurred while processing your request. Please try again in a moment.";
pub const AI_TIMEOUT_REPLY: &str =
    "Sorry, this request took too long to process. Please try again in a moment.";
pub const AI_NOT_FOUND_REPLY: &str =
    "Sorry, no reply could be found for your request. Please try again in a moment.";

/// Sent to the customer when every orchestration attempt has been exhausted.
pub const ESCALATION_APOLOGY: &str = "I couldn't complete your request automatically. \
     Our support team has been notified and will follow up shortly.";

pub const DEFAULT_CHATWOOT_BASE_URL: &str = "https://app.chatwoot.com";
pub const DEFAULT_MAX_AI_RETRIES: u32 = 2;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required env var {0}")]
    Missing(&'static str),
    #[error("invalid value for env var {0}")]
    Invalid(&'static str),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub openai_api_key: String,
    pub openai_assistant_id: String,
    pub chatwoot_api_key: String,
    pub chatwoot_account_id: String,
    pub chatwoot_base_url: String,
    pub google_chat_webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
    pub max_ai_retries: u32,
    pub port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let max_ai_retries = match env::var("MAX_AI_RETRIES") {
            Err(_) => DEFAULT_MAX_AI_RETRIES,
            Ok(raw) if raw.trim().is_empty() => DEFAULT_MAX_AI_RETRIES,
            Ok(raw) => raw
                .trim()
                .parse::<u32>()
                .map_err(|_| ConfigError::Invalid("MAX_AI_RETRIES"))?,
        };
        let port = env::var("PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(8000);

        Ok(Self {
            openai_api_key: required("OPENAI_API_KEY")?,
            openai_assistant_id: required("OPENAI_ASSISTANT_ID")?,
            chatwoot_api_key: required("CHATWOOT_API_KEY")?,
            chatwoot_account_id: required("CHATWOOT_ACCOUNT_ID")?,
            chatwoot_base_url: optional("CHATWOOT_BASE_URL")
                .unwrap_or_else(|| DEFAULT_CHATWOOT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            google_chat_webhook_url: optional("GOOGLE_CHAT_WEBHOOK_URL"),
            webhook_secret: optional("WEBHOOK_SECRET"),
            max_ai_retries,
            port,
        })
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        _ => Err(ConfigError::Missing(name)),
    }
}

fn optional(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Lifecycle state of one assistant run, as reported by the AI service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    Expired,
    Other(String),
}

impl RunStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "queued" => Self::Queued,
            "in_progress" => Self::InProgress,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            "expired" => Self::Expired,
            other => Self::Other(other.to_string()),
        }
    }

    /// Failure states the run can never leave. Anything else that is not
    /// `completed` keeps being polled until the ceiling.
    pub fn is_terminal_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Cancelled | Self::Expired)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
            Self::Other(raw) => raw.as_str(),
        };
        f.write_str(label)
    }
}

/// Why one orchestration attempt produced no usable reply. Carries enough
/// structure that success detection never inspects message text.
#[derive(Debug, Clone)]
pub enum ReplyFailure {
    RunEnded { status: RunStatus, run_id: String },
    RunTimedOut,
    ReplyNotFound,
    Upstream(String),
}

impl ReplyFailure {
    /// The canned text shown to the customer for this failure.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::RunEnded { .. } | Self::Upstream(_) => AI_ERROR_REPLY,
            Self::RunTimedOut => AI_TIMEOUT_REPLY,
            Self::ReplyNotFound => AI_NOT_FOUND_REPLY,
        }
    }

    /// Short escalation tag for the notification card.
    pub fn reason(&self) -> String {
        match self {
            Self::RunEnded { status, .. } => format!("run {status}"),
            Self::RunTimedOut => "timeout".to_string(),
            Self::ReplyNotFound => "reply not found".to_string(),
            Self::Upstream(_) => "request error".to_string(),
        }
    }

    pub fn detail(&self) -> Option<String> {
        match self {
            Self::RunEnded { run_id, .. } => Some(format!("run id: {run_id}")),
            Self::Upstream(detail) => Some(detail.clone()),
            Self::RunTimedOut | Self::ReplyNotFound => None,
        }
    }
}

/// Everything the escalation channel needs about the inbound event, fixed
/// before orchestration starts. The failure reason is attached later.
#[derive(Debug, Clone)]
pub struct EscalationContext {
    pub conversation_id: i64,
    pub conversation_url: String,
    pub customer: Option<String>,
    pub customer_message: String,
}

impl EscalationContext {
    pub fn with_reason(&self, reason: impl Into<String>, detail: Option<String>) -> Escalation {
        Escalation {
            conversation_id: self.conversation_id,
            conversation_url: self.conversation_url.clone(),
            customer: self.customer.clone(),
            customer_message: self.customer_message.clone(),
            reason: reason.into(),
            detail,
        }
    }

    pub fn with_failure(&self, failure: &ReplyFailure) -> Escalation {
        self.with_reason(failure.reason(), failure.detail())
    }
}

#[derive(Debug, Clone)]
pub struct Escalation {
    pub conversation_id: i64,
    pub conversation_url: String,
    pub customer: Option<String>,
    pub customer_message: String,
    pub reason: String,
    pub detail: Option<String>,
}

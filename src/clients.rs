use serde::Deserialize;
use serde_json::{json, Value};

use crate::types::RunStatus;

const OPENAI_API_BASE: &str = "https://api.openai.com";
const ASSISTANTS_BETA_HEADER: &str = "assistants=v2";

/// How many thread messages to pull when hunting for the latest reply.
const MESSAGE_PAGE_SIZE: u32 = 20;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("{service} request failed: {source}")]
    Request {
        service: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{service} returned {status}: {body}")]
    Status {
        service: &'static str,
        status: u16,
        body: String,
    },
    #[error("unexpected {service} response: {detail}")]
    Shape {
        service: &'static str,
        detail: String,
    },
}

/// Thin wrapper over the support platform's REST API. All durable state this
/// service relies on lives behind these calls, in conversation and contact
/// custom attributes.
#[derive(Debug, Clone)]
pub struct ChatwootClient {
    http: reqwest::Client,
    base_url: String,
    account_id: String,
    api_key: String,
}

impl ChatwootClient {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        account_id: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            account_id: account_id.into(),
            api_key: api_key.into(),
        }
    }

    /// Overrides the base URL (for tests against a mock server).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    fn api_url(&self, tail: &str) -> String {
        format!(
            "{}/api/v1/accounts/{}/{tail}",
            self.base_url, self.account_id
        )
    }

    /// Deep link into the platform's agent UI for one conversation.
    pub fn conversation_url(&self, conversation_id: i64) -> String {
        format!(
            "{}/app/accounts/{}/conversations/{conversation_id}",
            self.base_url, self.account_id
        )
    }

    async fn execute(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<Value, ClientError> {
        let response = request
            .header("api_access_token", self.api_key.as_str())
            .send()
            .await
            .map_err(|source| ClientError::Request {
                service: "chatwoot",
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                service: "chatwoot",
                status: status.as_u16(),
                body,
            });
        }
        response
            .json::<Value>()
            .await
            .map_err(|source| ClientError::Request {
                service: "chatwoot",
                source,
            })
    }

    pub async fn get_conversation(&self, conversation_id: i64) -> Result<Value, ClientError> {
        let url = self.api_url(&format!("conversations/{conversation_id}"));
        self.execute(self.http.get(url)).await
    }

    pub async fn update_conversation_attributes(
        &self,
        conversation_id: i64,
        attributes: Value,
    ) -> Result<(), ClientError> {
        let url = self.api_url(&format!("conversations/{conversation_id}/custom_attributes"));
        self.execute(
            self.http
                .post(url)
                .json(&json!({ "custom_attributes": attributes })),
        )
        .await?;
        Ok(())
    }

    pub async fn get_contact(&self, contact_id: i64) -> Result<Value, ClientError> {
        let url = self.api_url(&format!("contacts/{contact_id}"));
        self.execute(self.http.get(url)).await
    }

    pub async fn update_contact_attributes(
        &self,
        contact_id: i64,
        attributes: Value,
    ) -> Result<(), ClientError> {
        let url = self.api_url(&format!("contacts/{contact_id}"));
        self.execute(
            self.http
                .put(url)
                .json(&json!({ "custom_attributes": attributes })),
        )
        .await?;
        Ok(())
    }

    /// Posts a public outgoing message into the conversation.
    pub async fn send_message(
        &self,
        conversation_id: i64,
        content: &str,
    ) -> Result<(), ClientError> {
        let url = self.api_url(&format!("conversations/{conversation_id}/messages"));
        self.execute(self.http.post(url).json(&json!({
            "content": content,
            "message_type": "outgoing",
            "private": false,
        })))
        .await?;
        Ok(())
    }

    /// Flips the agent typing indicator for the conversation.
    pub async fn toggle_typing(
        &self,
        conversation_id: i64,
        on: bool,
    ) -> Result<(), ClientError> {
        let url = self.api_url(&format!("conversations/{conversation_id}/toggle_typing_status"));
        self.execute(
            self.http
                .post(url)
                .query(&[("typing_status", if on { "on" } else { "off" })]),
        )
        .await?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ThreadCreated {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RunCreated {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RunState {
    status: String,
}

/// Thin wrapper over the AI service's thread/message/run lifecycle.
#[derive(Debug, Clone)]
pub struct AssistantClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    assistant_id: String,
}

impl AssistantClient {
    pub fn new(
        http: reqwest::Client,
        api_key: impl Into<String>,
        assistant_id: impl Into<String>,
    ) -> Self {
        Self {
            http,
            base_url: OPENAI_API_BASE.to_string(),
            api_key: api_key.into(),
            assistant_id: assistant_id.into(),
        }
    }

    /// Overrides the base URL (for tests against a mock server).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    async fn execute(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<Value, ClientError> {
        let response = request
            .bearer_auth(&self.api_key)
            .header("OpenAI-Beta", ASSISTANTS_BETA_HEADER)
            .send()
            .await
            .map_err(|source| ClientError::Request {
                service: "assistant",
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                service: "assistant",
                status: status.as_u16(),
                body,
            });
        }
        response
            .json::<Value>()
            .await
            .map_err(|source| ClientError::Request {
                service: "assistant",
                source,
            })
    }

    fn parse<T: serde::de::DeserializeOwned>(payload: Value) -> Result<T, ClientError> {
        serde_json::from_value(payload).map_err(|err| ClientError::Shape {
            service: "assistant",
            detail: err.to_string(),
        })
    }

    /// Creates a fresh durable conversation context and returns its id.
    pub async fn create_thread(&self) -> Result<String, ClientError> {
        let url = format!("{}/v1/threads", self.base_url);
        let payload = self.execute(self.http.post(url).json(&json!({}))).await?;
        Ok(Self::parse::<ThreadCreated>(payload)?.id)
    }

    /// Appends a user turn to the thread.
    pub async fn create_message(&self, thread_id: &str, text: &str) -> Result<(), ClientError> {
        let url = format!("{}/v1/threads/{thread_id}/messages", self.base_url);
        self.execute(self.http.post(url).json(&json!({
            "role": "user",
            "content": text,
        })))
        .await?;
        Ok(())
    }

    /// Starts one inference run of the configured assistant and returns the
    /// run id to poll.
    pub async fn create_run(&self, thread_id: &str) -> Result<String, ClientError> {
        let url = format!("{}/v1/threads/{thread_id}/runs", self.base_url);
        let payload = self
            .execute(self.http.post(url).json(&json!({
                "assistant_id": self.assistant_id,
            })))
            .await?;
        Ok(Self::parse::<RunCreated>(payload)?.id)
    }

    pub async fn run_status(
        &self,
        thread_id: &str,
        run_id: &str,
    ) -> Result<RunStatus, ClientError> {
        let url = format!("{}/v1/threads/{thread_id}/runs/{run_id}", self.base_url);
        let payload = self.execute(self.http.get(url)).await?;
        let state: RunState = Self::parse(payload)?;
        Ok(RunStatus::parse(&state.status))
    }

    /// Lists the thread's messages, newest first.
    pub async fn list_messages(&self, thread_id: &str) -> Result<Value, ClientError> {
        let url = format!("{}/v1/threads/{thread_id}/messages", self.base_url);
        let limit = MESSAGE_PAGE_SIZE.to_string();
        self.execute(
            self.http
                .get(url)
                .query(&[("order", "desc"), ("limit", limit.as_str())]),
        )
        .await
    }
}

// Telegram Bot API client
//
// Plain HTTPS calls against `https://api.telegram.org/bot<token>/<method>`.
// JSON methods are retried on 429 using `parameters.retry_after`.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::intake::{ChatKind, IncomingMessage, Sender};
use crate::messaging::{ChatTarget, DeliveryError, MessagingService};

const API_BASE: &str = "https://api.telegram.org";
const MAX_RATE_LIMIT_RETRIES: u32 = 3;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Error)]
pub enum TelegramError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Bot API error {code}: {description}")]
    Api { code: i64, description: String },

    #[error("rate limit exceeded after {0} retries")]
    RateLimited(u32),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<i64>,
    parameters: Option<ResponseParameters>,
}

/// Unsuccessful Bot API envelope
#[derive(Debug)]
struct ApiFailure {
    code: i64,
    description: String,
    retry_after: Option<u64>,
}

impl From<ApiFailure> for TelegramError {
    fn from(failure: ApiFailure) -> Self {
        TelegramError::Api {
            code: failure.code,
            description: failure.description,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default)]
    pub first_name: String,
    pub last_name: Option<String>,
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub message_thread_id: Option<i64>,
    pub from: Option<User>,
    pub chat: Chat,
    pub text: Option<String>,
    pub caption: Option<String>,
    #[serde(default)]
    pub new_chat_members: Vec<User>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BotCommand {
    pub command: String,
    pub description: String,
}

impl From<User> for Sender {
    fn from(user: User) -> Self {
        Sender {
            id: user.id,
            is_bot: user.is_bot,
            first_name: user.first_name,
            last_name: user.last_name,
            username: user.username,
        }
    }
}

impl From<Message> for IncomingMessage {
    fn from(msg: Message) -> Self {
        let chat_kind = match msg.chat.kind.as_str() {
            "private" => ChatKind::Private,
            "group" | "supergroup" => ChatKind::Group,
            _ => ChatKind::Other,
        };

        IncomingMessage {
            chat_id: msg.chat.id,
            chat_kind,
            chat_title: msg.chat.title,
            thread_id: msg.message_thread_id,
            message_id: msg.message_id,
            sender: msg.from.map(Sender::from),
            text: msg.text,
            caption: msg.caption,
            new_members: msg.new_chat_members.into_iter().map(Sender::from).collect(),
        }
    }
}

/// Bot API client; also the production `MessagingService`
pub struct TelegramClient {
    client: Client,
    base_url: String,
    max_upload_bytes: u64,
}

impl TelegramClient {
    pub fn new(token: &str, max_upload_bytes: u64) -> Self {
        Self {
            client: Client::new(),
            base_url: format!("{}/bot{}", API_BASE, token),
            max_upload_bytes,
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/{}", self.base_url, method)
    }

    async fn decode<T: DeserializeOwned>(
        request: RequestBuilder,
    ) -> Result<Result<T, ApiFailure>, TelegramError> {
        let response = request.send().await?;
        let status = response.status();
        let body: ApiResponse<T> = response.json().await?;

        match body.result {
            Some(result) if body.ok => Ok(Ok(result)),
            _ => Ok(Err(ApiFailure {
                code: body.error_code.unwrap_or_else(|| i64::from(status.as_u16())),
                description: body.description.unwrap_or_else(|| status.to_string()),
                retry_after: body.parameters.and_then(|p| p.retry_after),
            })),
        }
    }

    /// JSON method call with rate-limit handling
    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        payload: &Value,
        timeout: Duration,
    ) -> Result<T, TelegramError> {
        let url = self.method_url(method);
        let mut attempts = 0;

        loop {
            attempts += 1;
            let request = self.client.post(&url).json(payload).timeout(timeout);

            match Self::decode(request).await? {
                Ok(result) => return Ok(result),
                Err(ApiFailure { code: 429, retry_after, .. }) => {
                    if attempts >= MAX_RATE_LIMIT_RETRIES {
                        warn!(method, "Telegram rate limit: max retries exceeded");
                        return Err(TelegramError::RateLimited(MAX_RATE_LIMIT_RETRIES));
                    }
                    let wait = Duration::from_secs(retry_after.unwrap_or(1));
                    debug!(method, ?wait, attempt = attempts, "rate limited, waiting");
                    tokio::time::sleep(wait).await;
                }
                Err(failure) => return Err(failure.into()),
            }
        }
    }

    pub async fn get_me(&self) -> Result<User, TelegramError> {
        self.call("getMe", &json!({}), REQUEST_TIMEOUT).await
    }

    /// Long poll for message updates after `offset`.
    pub async fn get_updates(
        &self,
        offset: i64,
        poll_timeout_secs: u64,
    ) -> Result<Vec<Update>, TelegramError> {
        let payload = json!({
            "offset": offset,
            "timeout": poll_timeout_secs,
            "allowed_updates": ["message"],
        });
        let timeout = Duration::from_secs(poll_timeout_secs) + REQUEST_TIMEOUT;
        self.call("getUpdates", &payload, timeout).await
    }

    pub async fn send_message(
        &self,
        target: ChatTarget,
        text: &str,
        html: bool,
    ) -> Result<(), TelegramError> {
        let mut payload = json!({
            "chat_id": target.chat_id,
            "text": text,
            "disable_web_page_preview": true,
            "disable_notification": true,
        });
        if html {
            payload["parse_mode"] = json!("HTML");
        }
        if let Some(thread_id) = target.thread_id {
            payload["message_thread_id"] = json!(thread_id);
        }
        self.call::<Value>("sendMessage", &payload, REQUEST_TIMEOUT).await?;
        Ok(())
    }

    /// Multipart video upload with an HTML caption
    pub async fn send_video(
        &self,
        target: ChatTarget,
        path: &Path,
        caption: &str,
    ) -> Result<(), TelegramError> {
        let video = video_part(path).await?;
        let mut form = Form::new()
            .text("chat_id", target.chat_id.to_string())
            .text("caption", caption.to_string())
            .text("parse_mode", "HTML")
            .text("supports_streaming", "true")
            .text("disable_notification", "true")
            .part("video", video);
        if let Some(thread_id) = target.thread_id {
            form = form.text("message_thread_id", thread_id.to_string());
        }

        let request = self
            .client
            .post(self.method_url("sendVideo"))
            .multipart(form)
            .timeout(UPLOAD_TIMEOUT);

        match Self::decode::<Value>(request).await? {
            Ok(_) => Ok(()),
            Err(failure) => Err(failure.into()),
        }
    }

    pub async fn delete(&self, target: ChatTarget, message_id: i64) -> Result<(), TelegramError> {
        let payload = json!({ "chat_id": target.chat_id, "message_id": message_id });
        self.call::<bool>("deleteMessage", &payload, REQUEST_TIMEOUT).await?;
        Ok(())
    }

    pub async fn set_my_commands(&self, commands: &[BotCommand]) -> Result<(), TelegramError> {
        let payload = json!({ "commands": commands });
        self.call::<bool>("setMyCommands", &payload, REQUEST_TIMEOUT).await?;
        Ok(())
    }
}

/// File streamed from disk with a known length
async fn video_part(path: &Path) -> Result<Part, TelegramError> {
    let file = tokio::fs::File::open(path).await?;
    let length = file.metadata().await?.len();
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "video.mp4".to_string());

    let body = Body::wrap_stream(ReaderStream::new(file));
    Ok(Part::stream_with_length(body, length).file_name(file_name))
}

impl From<TelegramError> for DeliveryError {
    fn from(err: TelegramError) -> Self {
        match err {
            TelegramError::Api { .. } => DeliveryError::Rejected(err.to_string()),
            TelegramError::Io(e) => DeliveryError::Io(e),
            other => DeliveryError::Transport(other.to_string()),
        }
    }
}

#[async_trait]
impl MessagingService for TelegramClient {
    async fn send_media(
        &self,
        target: ChatTarget,
        path: &Path,
        caption: &str,
    ) -> Result<(), DeliveryError> {
        let size = tokio::fs::metadata(path).await?.len();
        if size > self.max_upload_bytes {
            return Err(DeliveryError::TooLarge {
                size,
                limit: self.max_upload_bytes,
            });
        }
        Ok(self.send_video(target, path, caption).await?)
    }

    async fn send_text(
        &self,
        target: ChatTarget,
        text: &str,
        html: bool,
    ) -> Result<(), DeliveryError> {
        Ok(self.send_message(target, text, html).await?)
    }

    async fn delete_message(&self, target: ChatTarget, message_id: i64) -> bool {
        match self.delete(target, message_id).await {
            Ok(()) => true,
            Err(e) => {
                debug!(chat_id = target.chat_id, message_id, error = %e, "delete failed");
                false
            }
        }
    }
}

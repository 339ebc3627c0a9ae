//! Telegram adapter (teloxide).
//!
//! This crate implements the `tgs-core` ChatBackend port over the Telegram Bot API and
//! hosts the inbound bot-event listener.

use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt, TryStreamExt};
use teloxide::{
    net::Download,
    prelude::*,
    types::{InputFile, Recipient},
    RequestError,
};
use tokio::io::AsyncRead;

pub mod listener;
#[cfg(test)]
mod test_support;

use tgs_core::{
    backend::{read_capped, BackendError, ChatBackend, FetchedObject, MAX_UPLOAD_BYTES},
    config::{ChannelTarget, ServiceConfig},
    domain::{FileHandle, MessageId},
    errors::Error,
    Result,
};

/// One budget for handle -> file path -> first body chunk.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client timeout. Covers a full 20 MiB upload and the 30 s long poll.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Clone)]
pub struct TelegramBackend {
    bot: Bot,
    target: Recipient,
    fetch_timeout: Duration,
}

impl TelegramBackend {
    /// Bind a backend to one bot token and channel for its whole lifetime.
    pub fn new(cfg: &ServiceConfig) -> Result<Self> {
        let target = match ChannelTarget::parse(&cfg.target)? {
            ChannelTarget::Id(id) => Recipient::Id(teloxide::types::ChatId(id)),
            ChannelTarget::Username(name) => Recipient::ChannelUsername(name),
        };
        Ok(Self {
            bot: build_bot(&cfg.token)?,
            target,
            fetch_timeout: FETCH_TIMEOUT,
        })
    }

    pub fn bot(&self) -> Bot {
        self.bot.clone()
    }

    async fn resolve(&self, id: MessageId) -> std::result::Result<FetchedObject, BackendError> {
        // Bots cannot read a channel message by id; forwarding it into the same channel
        // hands back a full copy, which is removed again right away.
        let copy = self
            .bot
            .forward_message(
                self.target.clone(),
                self.target.clone(),
                teloxide::types::MessageId(id.0),
            )
            .await
            .map_err(map_request_error)?;
        self.discard_copy(&copy);

        let media = StoredMedia::from_message(&copy).ok_or(BackendError::NotFound)?;
        let file = self
            .bot
            .get_file(media.file_id.clone())
            .await
            .map_err(map_request_error)?;

        let mut body = self.bot.download_file_stream(&file.path);
        let first = body
            .next()
            .await
            .transpose()
            .map_err(map_download_error)?;

        let rest = body.map_err(map_download_error);
        let body = stream::iter(first.map(Ok)).chain(rest).boxed();

        Ok(FetchedObject {
            content_type: media.mime_type,
            size: media.size,
            filename: media.file_name,
            body,
        })
    }

    fn discard_copy(&self, copy: &Message) {
        let bot = self.bot.clone();
        let chat_id = copy.chat.id;
        let message_id = copy.id;
        tokio::spawn(async move {
            if let Err(e) = bot.delete_message(chat_id, message_id).await {
                tracing::warn!(error = %e, message_id = message_id.0, "failed to delete forwarded copy");
            }
        });
    }
}

#[async_trait]
impl ChatBackend for TelegramBackend {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn upload(
        &self,
        filename: &str,
        reader: &mut (dyn AsyncRead + Unpin + Send),
        max_bytes: u64,
    ) -> std::result::Result<FileHandle, BackendError> {
        let data = read_capped(reader, max_bytes.min(MAX_UPLOAD_BYTES)).await?;
        let size = data.len();

        let msg = self
            .bot
            .send_document(
                self.target.clone(),
                InputFile::memory(data).file_name(filename.to_string()),
            )
            .await
            .map_err(map_request_error)?;

        tracing::debug!(filename, size, message_id = msg.id.0, "document sent");
        Ok(FileHandle::new(MessageId(msg.id.0), filename))
    }

    async fn fetch(&self, id: MessageId) -> std::result::Result<FetchedObject, BackendError> {
        tokio::time::timeout(self.fetch_timeout, self.resolve(id))
            .await
            .map_err(|_| BackendError::Timeout)?
    }
}

/// Bot with a client timeout long enough for uploads and long polling.
pub fn build_bot(token: &str) -> Result<Bot> {
    let client = teloxide::net::default_reqwest_settings()
        .timeout(CLIENT_TIMEOUT)
        .build()
        .map_err(|e| Error::Config(format!("failed to build telegram http client: {e}")))?;
    Ok(Bot::with_client(token.to_string(), client))
}

/// The downloadable part of a channel message.
#[derive(Clone, Debug, PartialEq, Eq)]
struct StoredMedia {
    file_id: String,
    file_name: Option<String>,
    mime_type: Option<String>,
    size: Option<u64>,
}

impl StoredMedia {
    fn from_message(msg: &Message) -> Option<Self> {
        if let Some(doc) = msg.document() {
            return Some(Self {
                file_id: doc.file.id.clone(),
                file_name: doc.file_name.clone(),
                mime_type: doc.mime_type.as_ref().map(|m| m.to_string()),
                size: Some(u64::from(doc.file.size)),
            });
        }
        if let Some(video) = msg.video() {
            return Some(Self {
                file_id: video.file.id.clone(),
                file_name: video.file_name.clone(),
                mime_type: video.mime_type.as_ref().map(|m| m.to_string()),
                size: Some(u64::from(video.file.size)),
            });
        }
        // Photos come in several sizes; the last one is the original.
        let photo = msg.photo()?.last()?;
        Some(Self {
            file_id: photo.file.id.clone(),
            file_name: None,
            mime_type: Some("image/jpeg".to_string()),
            size: Some(u64::from(photo.file.size)),
        })
    }
}

fn map_request_error(e: RequestError) -> BackendError {
    match e {
        RequestError::Api(api) => classify_api_error(&api.to_string()),
        RequestError::Network(err) if err.is_timeout() => BackendError::Timeout,
        RequestError::Network(err) => BackendError::Unreachable(err.to_string()),
        RequestError::RetryAfter(after) => {
            BackendError::Rejected(format!("flood control, retry after {after:?}"))
        }
        other => BackendError::Rejected(other.to_string()),
    }
}

fn map_download_error(e: reqwest::Error) -> BackendError {
    if e.status() == Some(reqwest::StatusCode::NOT_FOUND) {
        return BackendError::NotFound;
    }
    if e.is_timeout() {
        return BackendError::Timeout;
    }
    BackendError::Unreachable(e.to_string())
}

/// Bot API errors are descriptions like "Bad Request: message to forward not found".
fn classify_api_error(description: &str) -> BackendError {
    let lower = description.to_lowercase();
    if lower.contains("not found")
        || lower.contains("message_id_invalid")
        || lower.contains("message can't be forwarded")
    {
        return BackendError::NotFound;
    }
    if lower.contains("too large") || lower.contains("too big") {
        return BackendError::TooLarge {
            limit: MAX_UPLOAD_BYTES,
        };
    }
    BackendError::Rejected(description.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        api_error, channel_post, document, message, ok, stub_bot, CHANNEL_ID,
    };
    use axum::response::IntoResponse;
    use serde_json::json;
    use teloxide::types::ChatId;

    fn backend(bot: Bot, fetch_timeout: Duration) -> TelegramBackend {
        TelegramBackend {
            bot,
            target: Recipient::Id(ChatId(CHANNEL_ID)),
            fetch_timeout,
        }
    }

    async fn fetch_err(backend: &TelegramBackend) -> BackendError {
        match backend.fetch(MessageId(42)).await {
            Ok(_) => panic!("fetch should fail"),
            Err(e) => e,
        }
    }

    #[tokio::test]
    async fn fetch_resolves_forwarded_document_to_bytes() {
        let bot = stub_bot(|method, _| async move {
            match method.as_str() {
                "forwardmessage" => ok(channel_post(
                    900,
                    document("doc-1", "cat.png", "image/png", 5),
                )),
                "deletemessage" => ok(json!(true)),
                "getfile" => ok(json!({
                    "file_id": "doc-1",
                    "file_unique_id": "doc-1-u",
                    "file_size": 5,
                    "file_path": "documents/file_0.png"
                })),
                "file" => "hello".into_response(),
                other => api_error(&format!("unexpected method {other}")),
            }
        })
        .await;

        let obj = backend(bot, FETCH_TIMEOUT)
            .fetch(MessageId(42))
            .await
            .unwrap();
        assert_eq!(obj.content_type.as_deref(), Some("image/png"));
        assert_eq!(obj.filename.as_deref(), Some("cat.png"));
        assert_eq!(obj.size, Some(5));

        let chunks: Vec<_> = obj.body.try_collect().await.unwrap();
        let data: Vec<u8> = chunks.iter().flat_map(|c| c.to_vec()).collect();
        assert_eq!(data, b"hello");
    }

    #[tokio::test]
    async fn fetch_of_text_message_is_not_found() {
        let bot = stub_bot(|method, _| async move {
            match method.as_str() {
                "forwardmessage" => ok(channel_post(901, json!({ "text": "just words" }))),
                "deletemessage" => ok(json!(true)),
                other => api_error(&format!("unexpected method {other}")),
            }
        })
        .await;
        assert_eq!(
            fetch_err(&backend(bot, FETCH_TIMEOUT)).await,
            BackendError::NotFound
        );
    }

    #[tokio::test]
    async fn fetch_of_unknown_message_is_not_found() {
        let bot = stub_bot(|_, _| async move {
            api_error("Bad Request: message to forward not found")
        })
        .await;
        assert_eq!(
            fetch_err(&backend(bot, FETCH_TIMEOUT)).await,
            BackendError::NotFound
        );
    }

    #[tokio::test]
    async fn stalled_file_lookup_times_out() {
        let bot = stub_bot(|method, _| async move {
            match method.as_str() {
                "forwardmessage" => ok(channel_post(
                    902,
                    document("doc-2", "big.zip", "application/zip", 9),
                )),
                "deletemessage" => ok(json!(true)),
                _ => {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    api_error("too late")
                }
            }
        })
        .await;
        assert_eq!(
            fetch_err(&backend(bot, Duration::from_millis(300))).await,
            BackendError::Timeout
        );
    }

    #[test]
    fn media_prefers_document_then_largest_photo() {
        let doc = message(channel_post(1, document("doc-1", "a.pdf", "application/pdf", 10)));
        let media = StoredMedia::from_message(&doc).unwrap();
        assert_eq!(media.file_id, "doc-1");
        assert_eq!(media.file_name.as_deref(), Some("a.pdf"));
        assert_eq!(media.mime_type.as_deref(), Some("application/pdf"));

        let photo = message(channel_post(
            2,
            json!({
                "photo": [
                    { "file_id": "small", "file_unique_id": "s", "file_size": 100, "width": 90, "height": 90 },
                    { "file_id": "large", "file_unique_id": "l", "file_size": 9000, "width": 1280, "height": 960 }
                ]
            }),
        ));
        let media = StoredMedia::from_message(&photo).unwrap();
        assert_eq!(media.file_id, "large");
        assert_eq!(media.size, Some(9000));
        assert_eq!(media.mime_type.as_deref(), Some("image/jpeg"));

        let text = message(channel_post(3, json!({ "text": "hi" })));
        assert_eq!(StoredMedia::from_message(&text), None);
    }

    #[test]
    fn api_errors_are_classified() {
        assert_eq!(
            classify_api_error("Bad Request: message to forward not found"),
            BackendError::NotFound
        );
        assert_eq!(
            classify_api_error("Bad Request: MESSAGE_ID_INVALID"),
            BackendError::NotFound
        );
        assert_eq!(
            classify_api_error("Request Entity Too Large"),
            BackendError::TooLarge {
                limit: MAX_UPLOAD_BYTES
            }
        );
        assert_eq!(
            classify_api_error("Forbidden: bot is not a member of the channel chat"),
            BackendError::Rejected("Forbidden: bot is not a member of the channel chat".to_string())
        );
    }

    #[test]
    fn backend_requires_a_valid_channel() {
        let cfg = ServiceConfig {
            token: "123:abc".to_string(),
            target: "not a channel".to_string(),
            ..ServiceConfig::default()
        };
        assert!(TelegramBackend::new(&cfg).is_err());

        let cfg = ServiceConfig {
            target: "@my_channel".to_string(),
            ..cfg
        };
        let backend = TelegramBackend::new(&cfg).unwrap();
        assert_eq!(
            backend.target,
            Recipient::ChannelUsername("@my_channel".to_string())
        );
    }
}

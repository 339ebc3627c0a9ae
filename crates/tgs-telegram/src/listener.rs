//! Inbound bot events.
//!
//! Replying `get` to a file in the storage channel answers with its download link.

use std::{
    sync::{
        atomic::{AtomicI32, Ordering},
        Arc,
    },
    time::Duration,
};

use teloxide::{
    prelude::*,
    types::{Chat, UpdateKind},
};
use tokio_util::sync::CancellationToken;

use tgs_core::{
    backoff::{supervise, BackoffPolicy},
    codec,
    config::{ChannelTarget, ServiceConfig},
    domain::MessageId,
    gateway::ROUTE_PREFIX,
    Result,
};

use crate::StoredMedia;

/// Long-poll timeout handed to `getUpdates`, in seconds.
const POLL_TIMEOUT_SECS: u32 = 30;

const LINK_COMMAND: &str = "get";

#[derive(Clone)]
pub struct LinkListener {
    bot: Bot,
    target: ChannelTarget,
    base_url: String,
    /// Next update id to ask for. Outlives a failed poll so a restart does not
    /// replay updates already answered.
    offset: Arc<AtomicI32>,
}

impl LinkListener {
    pub fn new(bot: Bot, cfg: &ServiceConfig) -> Result<Self> {
        Ok(Self {
            bot,
            target: ChannelTarget::parse(&cfg.target)?,
            base_url: cfg.base_url().to_string(),
            offset: Arc::new(AtomicI32::new(0)),
        })
    }

    /// Poll until `cancel` fires, restarting with backoff when polling fails.
    pub async fn run(self, cancel: CancellationToken) {
        let restarts = supervise("bot-listener", cancel, BackoffPolicy::default(), |token| {
            let listener = self.clone();
            async move { listener.poll(token).await }
        })
        .await;
        tracing::info!(restarts, "bot listener stopped");
    }

    async fn poll(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        loop {
            let offset = self.offset.load(Ordering::Relaxed);
            let updates = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                res = self.bot.get_updates().offset(offset).timeout(POLL_TIMEOUT_SECS).send() => res?,
            };

            for update in updates {
                self.offset.store(update.id + 1, Ordering::Relaxed);
                let msg = match update.kind {
                    UpdateKind::Message(m) | UpdateKind::ChannelPost(m) => m,
                    _ => continue,
                };
                if let Err(e) = self.handle_message(&msg).await {
                    tracing::warn!(error = %e, chat_id = msg.chat.id.0, "failed to answer link request");
                }
            }

            // Yield between polls so a burst of empty responses cannot spin.
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn handle_message(&self, msg: &Message) -> std::result::Result<(), teloxide::RequestError> {
        let Some(reply) = self.link_request(msg) else {
            return Ok(());
        };
        let link = self.link_for(MessageId(reply.0));
        self.bot
            .send_message(msg.chat.id, link)
            .reply_to_message_id(msg.id)
            .await?;
        Ok(())
    }

    /// The id of the stored file this message asks a link for, if it is a link request.
    fn link_request(&self, msg: &Message) -> Option<teloxide::types::MessageId> {
        if !self.is_target_chat(&msg.chat) {
            return None;
        }
        if !is_link_command(msg.text()?) {
            return None;
        }
        let original = msg.reply_to_message()?;
        StoredMedia::from_message(original)?;
        Some(original.id)
    }

    fn link_for(&self, id: MessageId) -> String {
        format!("{}{}{}", self.base_url, ROUTE_PREFIX, codec::encode(id))
    }

    fn is_target_chat(&self, chat: &Chat) -> bool {
        match &self.target {
            ChannelTarget::Id(id) => chat.id.0 == *id,
            ChannelTarget::Username(name) => chat
                .username()
                .is_some_and(|u| u.eq_ignore_ascii_case(name.trim_start_matches('@'))),
        }
    }
}

fn is_link_command(text: &str) -> bool {
    text.trim().eq_ignore_ascii_case(LINK_COMMAND)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use serde_json::{json, Value};

    use crate::test_support::{
        api_error, channel_post, document, message, ok, private_text, stub_bot,
    };

    fn listener() -> LinkListener {
        let cfg = ServiceConfig {
            token: "123:abc".to_string(),
            target: "-1001234567890".to_string(),
            url: "https://img.example.com/".to_string(),
            ..ServiceConfig::default()
        };
        LinkListener::new(Bot::new("123:abc"), &cfg).unwrap()
    }

    #[test]
    fn link_command_is_exact_word() {
        assert!(is_link_command("get"));
        assert!(is_link_command("  GET "));
        assert!(!is_link_command("get it"));
        assert!(!is_link_command("forget"));
    }

    #[test]
    fn links_use_trimmed_base_url_and_token() {
        let l = listener();
        assert_eq!(l.link_for(MessageId(1)), "https://img.example.com/d/AAAAAQ");
    }

    fn reply(id: i32, text: &str, to: Value) -> Value {
        channel_post(id, json!({ "text": text, "reply_to_message": to }))
    }

    #[test]
    fn get_reply_to_stored_file_is_a_link_request() {
        let l = listener();
        let stored = channel_post(500, document("doc-1", "cat.png", "image/png", 5));

        let msg = message(reply(501, " GET ", stored.clone()));
        assert_eq!(l.link_request(&msg), Some(teloxide::types::MessageId(500)));

        let msg = message(reply(502, "thanks", stored));
        assert_eq!(l.link_request(&msg), None);

        let not_media = channel_post(503, json!({ "text": "hello" }));
        let msg = message(reply(504, "get", not_media));
        assert_eq!(l.link_request(&msg), None);

        let msg = message(channel_post(505, json!({ "text": "get" })));
        assert_eq!(l.link_request(&msg), None);
    }

    #[test]
    fn requests_outside_the_target_chat_are_ignored() {
        let l = listener();
        let msg = message(private_text(9, "get"));
        assert!(!l.is_target_chat(&msg.chat));
        assert_eq!(l.link_request(&msg), None);

        let post = message(channel_post(1, json!({ "text": "x" })));
        assert!(l.is_target_chat(&post.chat));

        let cfg = ServiceConfig {
            token: "123:abc".to_string(),
            target: "@Files_Channel".to_string(),
            ..ServiceConfig::default()
        };
        let by_name = LinkListener::new(Bot::new("123:abc"), &cfg).unwrap();
        assert!(by_name.is_target_chat(&post.chat));
    }

    #[tokio::test]
    async fn failed_poll_resumes_after_the_last_update() {
        let offsets = Arc::new(Mutex::new(Vec::new()));
        let seen = offsets.clone();
        let bot = stub_bot(move |method, body| {
            let seen = seen.clone();
            async move {
                if method != "getupdates" {
                    return api_error(&format!("unexpected method {method}"));
                }
                let body: Value = serde_json::from_str(&body).unwrap_or_default();
                let mut seen = seen.lock().unwrap();
                seen.push(body["offset"].as_i64().unwrap_or(-1));
                if seen.len() == 1 {
                    ok(json!([{ "update_id": 41, "message": private_text(3, "hello") }]))
                } else {
                    api_error("Bad Request: poll failed")
                }
            }
        })
        .await;

        let cfg = ServiceConfig {
            token: "123:abc".to_string(),
            target: "-1001234567890".to_string(),
            ..ServiceConfig::default()
        };
        let l = LinkListener::new(bot, &cfg).unwrap();
        let cancel = CancellationToken::new();

        // Each failed poll is what the supervising loop restarts.
        assert!(l.poll(cancel.clone()).await.is_err());
        assert!(l.poll(cancel).await.is_err());

        assert_eq!(*offsets.lock().unwrap(), vec![0, 42, 42]);
    }
}

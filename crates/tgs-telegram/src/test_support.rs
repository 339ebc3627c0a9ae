//! Local stand-in for the Bot API, plus message fixtures.

use std::{future::Future, sync::Arc};

use axum::{
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
    Json, Router,
};
use serde_json::{json, Value};
use teloxide::{types::Message, Bot};
use tokio::net::TcpListener;

pub const CHANNEL_ID: i64 = -1001234567890;

/// Serve `handler` as the Bot API and return a bot pointed at it.
///
/// The handler gets the lowercased method name (`file` for downloads) and the raw body.
pub async fn stub_bot<F, Fut>(handler: F) -> Bot
where
    F: Fn(String, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    let handler = Arc::new(handler);
    let app = Router::new().fallback(move |uri: Uri, body: String| {
        let handler = handler.clone();
        async move {
            let path = uri.path();
            let method = if path.contains("/file/bot") {
                "file".to_string()
            } else {
                path.rsplit('/').next().unwrap_or_default().to_lowercase()
            };
            handler(method, body).await
        }
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let url = reqwest::Url::parse(&format!("http://{addr}/")).unwrap();
    Bot::new("123:abc").set_api_url(url)
}

pub fn ok(result: Value) -> Response {
    Json(json!({ "ok": true, "result": result })).into_response()
}

pub fn api_error(description: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "ok": false, "error_code": 400, "description": description })),
    )
        .into_response()
}

pub fn channel() -> Value {
    json!({
        "id": CHANNEL_ID,
        "type": "channel",
        "title": "files",
        "username": "files_channel"
    })
}

/// A post in the storage channel; `fields` adds the content (`text`, `document`, ...).
pub fn channel_post(id: i32, fields: Value) -> Value {
    let mut msg = json!({
        "message_id": id,
        "date": 1_700_000_000,
        "chat": channel(),
        "sender_chat": channel()
    });
    if let (Some(msg), Value::Object(fields)) = (msg.as_object_mut(), fields) {
        msg.extend(fields);
    }
    msg
}

pub fn private_text(id: i32, text: &str) -> Value {
    json!({
        "message_id": id,
        "date": 1_700_000_000,
        "chat": { "id": 7, "type": "private", "first_name": "Ann" },
        "from": { "id": 7, "is_bot": false, "first_name": "Ann" },
        "text": text
    })
}

pub fn document(file_id: &str, name: &str, mime: &str, size: u32) -> Value {
    json!({
        "document": {
            "file_id": file_id,
            "file_unique_id": format!("{file_id}-u"),
            "file_name": name,
            "mime_type": mime,
            "file_size": size
        }
    })
}

pub fn message(value: Value) -> Message {
    serde_json::from_value(value).unwrap()
}

//! Telegram Bot API transport.
//!
//! Prompts go out as messages with kind-appropriate inline keyboards
//! (buttons for yes/no, press-enter, and numbered choices; a forced reply
//! for free-text and password entry; raw-terminal prompts are
//! informational only). Button callback data carries the prompt id, the
//! nonce,
//! and the chosen value. Free-text answers arrive as replies to the prompt
//! message; the transport keeps a message-id map so it can attach the
//! right nonce before handing the message to the router.
//!
//! All HTTP goes through a blocking `ureq` agent with the channel send
//! deadline applied as both connect and read timeout.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::config::TelegramSettings;
use crate::prompt::PromptKind;
use crate::store::PromptRecord;

use super::{Channel, ChannelError, InboundMessage, MessageHandle, SEND_DEADLINE};

const API_BASE: &str = "https://api.telegram.org";

/// Callback data prefix: `r:<prompt_id>:<nonce>:<value>`.
const CALLBACK_PREFIX: &str = "r";

struct PendingPrompt {
    prompt_id: String,
    nonce: String,
    session_id: String,
}

pub struct TelegramChannel {
    agent: ureq::Agent,
    base_url: String,
    token: String,
    chat_id: String,
    /// getUpdates offset (last seen update id + 1).
    offset: AtomicI64,
    /// message_id -> prompt metadata, for free-text replies.
    pending: Mutex<HashMap<i64, PendingPrompt>>,
}

impl TelegramChannel {
    pub fn new(settings: &TelegramSettings) -> Self {
        Self::with_base_url(settings, API_BASE)
    }

    /// Test seam: point the transport at a local stub server.
    pub fn with_base_url(settings: &TelegramSettings, base_url: &str) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(SEND_DEADLINE)
            .timeout_read(SEND_DEADLINE + Duration::from_secs(35)) // long-poll headroom
            .build();
        Self {
            agent,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: settings.bot_token.expose().to_string(),
            chat_id: settings.chat_id.clone(),
            offset: AtomicI64::new(0),
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.base_url, self.token, method)
    }

    fn call(&self, method: &str, payload: Value) -> Result<Value, ChannelError> {
        let response = self
            .agent
            .post(&self.method_url(method))
            .send_json(payload)
            .map_err(classify_ureq_error)?;
        let body: Value = response
            .into_json()
            .map_err(|e| ChannelError::Transport(format!("bad response body: {e}")))?;
        if body["ok"].as_bool() != Some(true) {
            return Err(ChannelError::Transport(format!(
                "telegram API error: {}",
                body["description"].as_str().unwrap_or("unknown")
            )));
        }
        Ok(body["result"].clone())
    }

    fn keyboard_for(prompt: &PromptRecord) -> Option<Value> {
        let button = |label: &str, value: &str| {
            json!({
                "text": label,
                "callback_data": format!("{CALLBACK_PREFIX}:{}:{}:{}", prompt.id, prompt.nonce, value),
            })
        };
        match prompt.kind {
            PromptKind::YesNo | PromptKind::FolderTrust => Some(json!({
                "inline_keyboard": [[button("Yes", "y"), button("No", "n")]]
            })),
            PromptKind::ConfirmEnter => Some(json!({
                "inline_keyboard": [[button("Continue", "")]]
            })),
            PromptKind::NumberedChoice => Some(json!({
                "inline_keyboard": [[
                    button("1", "1"),
                    button("2", "2"),
                    button("3", "3"),
                ]]
            })),
            PromptKind::FreeText | PromptKind::Password => {
                Some(json!({ "force_reply": true, "selective": true }))
            }
            // Raw-terminal interaction can't be answered over the channel;
            // the message is informational and offers no reply field.
            PromptKind::RawTerminal => None,
        }
    }

    fn prompt_text(session_id: &str, prompt: &PromptRecord) -> String {
        format!(
            "\u{2753} [{}] {} prompt ({} confidence)\n\n{}",
            session_id, prompt.kind, prompt.confidence, prompt.excerpt
        )
    }

    fn parse_update(&self, update: &Value) -> Option<InboundMessage> {
        if let Some(callback) = update.get("callback_query") {
            let identity = identity_of(callback.get("from")?)?;
            let data = callback["data"].as_str()?;
            let mut parts = data.splitn(4, ':');
            if parts.next() != Some(CALLBACK_PREFIX) {
                return None;
            }
            let prompt_id = parts.next()?.to_string();
            let nonce = parts.next()?.to_string();
            let value = parts.next().unwrap_or("").to_string();
            let session_binding = callback
                .pointer("/message/message_id")
                .and_then(Value::as_i64)
                .and_then(|id| {
                    self.pending
                        .lock()
                        .unwrap()
                        .get(&id)
                        .map(|p| p.session_id.clone())
                });
            // Acknowledge so the client stops its spinner; best effort.
            if let Some(id) = callback["id"].as_str() {
                let _ = self.call("answerCallbackQuery", json!({ "callback_query_id": id }));
            }
            return Some(InboundMessage {
                identity,
                nonce: Some(nonce),
                prompt_id: Some(prompt_id),
                session_binding,
                body: value,
            });
        }

        let message = update.get("message")?;
        let identity = identity_of(message.get("from")?)?;
        let body = message["text"].as_str()?.to_string();
        let replied_to = message
            .pointer("/reply_to_message/message_id")
            .and_then(Value::as_i64)?;
        let pending = self.pending.lock().unwrap();
        let entry = pending.get(&replied_to)?;
        Some(InboundMessage {
            identity,
            nonce: Some(entry.nonce.clone()),
            prompt_id: Some(entry.prompt_id.clone()),
            session_binding: Some(entry.session_id.clone()),
            body,
        })
    }
}

fn identity_of(from: &Value) -> Option<String> {
    from["username"]
        .as_str()
        .map(str::to_string)
        .or_else(|| from["id"].as_i64().map(|id| id.to_string()))
}

fn classify_ureq_error(e: ureq::Error) -> ChannelError {
    match e {
        ureq::Error::Transport(t) => {
            let text = t.to_string();
            if text.contains("timed out") || text.contains("timeout") {
                ChannelError::Deadline(SEND_DEADLINE)
            } else {
                ChannelError::Unavailable(text)
            }
        }
        ureq::Error::Status(code, _) if code >= 500 => {
            ChannelError::Unavailable(format!("telegram returned {code}"))
        }
        ureq::Error::Status(code, _) => ChannelError::Transport(format!("telegram returned {code}")),
    }
}

impl Channel for TelegramChannel {
    fn name(&self) -> &'static str {
        "telegram"
    }

    fn send_prompt(
        &self,
        session_id: &str,
        prompt: &PromptRecord,
    ) -> Result<MessageHandle, ChannelError> {
        let mut payload = json!({
            "chat_id": self.chat_id,
            "text": Self::prompt_text(session_id, prompt),
        });
        if let Some(markup) = Self::keyboard_for(prompt) {
            payload["reply_markup"] = markup;
        }
        let result = self.call("sendMessage", payload)?;
        let message_id = result["message_id"].as_i64().ok_or_else(|| {
            ChannelError::Transport("sendMessage result missing message_id".to_string())
        })?;
        self.pending.lock().unwrap().insert(
            message_id,
            PendingPrompt {
                prompt_id: prompt.id.clone(),
                nonce: prompt.nonce.clone(),
                session_id: session_id.to_string(),
            },
        );
        debug!(prompt = %prompt.id, message_id, "prompt sent to telegram");
        Ok(MessageHandle(message_id.to_string()))
    }

    fn send_output(&self, session_id: &str, chunk: &str) -> Result<(), ChannelError> {
        self.call(
            "sendMessage",
            json!({
                "chat_id": self.chat_id,
                "text": format!("[{session_id}]\n{chunk}"),
                "disable_notification": true,
            }),
        )
        .map(|_| ())
    }

    fn send_plan(&self, session_id: &str, plan: &str) -> Result<(), ChannelError> {
        self.call(
            "sendMessage",
            json!({
                "chat_id": self.chat_id,
                "text": format!("\u{1f4cb} [{session_id}] plan:\n{plan}"),
            }),
        )
        .map(|_| ())
    }

    fn notify(&self, session_id: &str, event: &str) -> Result<(), ChannelError> {
        self.call(
            "sendMessage",
            json!({
                "chat_id": self.chat_id,
                "text": format!("\u{26a0} [{session_id}] {event}"),
            }),
        )
        .map(|_| ())
    }

    fn poll_inbound(&self, timeout: Duration) -> Result<Vec<InboundMessage>, ChannelError> {
        let result = self.call(
            "getUpdates",
            json!({
                "offset": self.offset.load(Ordering::Relaxed),
                "timeout": timeout.as_secs(),
                "allowed_updates": ["message", "callback_query"],
            }),
        )?;
        let updates = result.as_array().cloned().unwrap_or_default();
        let mut messages = Vec::new();
        for update in &updates {
            if let Some(id) = update["update_id"].as_i64() {
                let next = id + 1;
                self.offset.fetch_max(next, Ordering::Relaxed);
            }
            match self.parse_update(update) {
                Some(message) => messages.push(message),
                None => warn!("ignoring unparseable telegram update"),
            }
        }
        Ok(messages)
    }
}

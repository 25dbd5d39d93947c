//! Telegram Bot API client, delivery transport and inbound bot loop.
//!
//! The transport is the relay's delivery primitive: an HTTP 429 (or an
//! API error envelope carrying `retry_after`) surfaces as
//! [`DeliveryError::RateLimited`] so the workers can pause globally. The
//! bot long-polls `getUpdates` and feeds allowed senders' messages into
//! the submission pipeline.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{info, warn};

use crate::channels::Transport;
use crate::error::{DeliveryError, Error};
use crate::relay::Relay;
use crate::store::Destination;

/// Maximum message length for Telegram's sendMessage API, in characters.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

/// Long-poll timeout passed to getUpdates, seconds.
const POLL_TIMEOUT_SECS: u64 = 30;

// ── API payload types ───────────────────────────────────────────────

/// Telegram's standard response envelope.
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<i64>,
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotInfo {
    pub id: i64,
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMember {
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Sender {
    pub id: i64,
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IncomingMessage {
    pub text: Option<String>,
    pub from: Option<Sender>,
    pub chat: Chat,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<IncomingMessage>,
}

/// Unpack an envelope into a result, mapping the throttle case.
fn envelope_to_result<T>(envelope: ApiResponse<T>) -> Result<T, DeliveryError> {
    if envelope.ok {
        return envelope
            .result
            .ok_or_else(|| DeliveryError::Api("ok response without a result".to_string()));
    }
    if envelope.error_code == Some(429) {
        let retry_after = envelope
            .parameters
            .and_then(|p| p.retry_after)
            .filter(|s| *s > 0)
            .map(|s| Duration::from_secs(s as u64));
        return Err(DeliveryError::RateLimited { retry_after });
    }
    Err(DeliveryError::Api(
        envelope
            .description
            .unwrap_or_else(|| "unknown API error".to_string()),
    ))
}

// ── Client ──────────────────────────────────────────────────────────

/// Thin reqwest client over the Bot API methods the relay needs.
pub struct TelegramApi {
    bot_token: String,
    client: reqwest::Client,
}

impl TelegramApi {
    pub fn new(bot_token: String) -> Self {
        Self {
            bot_token,
            client: reqwest::Client::new(),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!("https://api.telegram.org/bot{}/{method}", self.bot_token)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: &serde_json::Value,
    ) -> Result<T, DeliveryError> {
        let resp = self
            .client
            .post(self.api_url(method))
            .json(body)
            .send()
            .await
            .map_err(|e| DeliveryError::Http(e.to_string()))?;

        let envelope: ApiResponse<T> = resp
            .json()
            .await
            .map_err(|e| DeliveryError::Http(format!("{method} response parse: {e}")))?;
        envelope_to_result(envelope)
    }

    /// Send one message chunk (the caller splits long texts).
    pub async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), DeliveryError> {
        let body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
        });
        self.call::<serde_json::Value>("sendMessage", &body)
            .await
            .map(|_| ())
    }

    pub async fn get_me(&self) -> Result<BotInfo, DeliveryError> {
        self.call("getMe", &serde_json::json!({})).await
    }

    pub async fn get_chat(&self, chat_id: &str) -> Result<Chat, DeliveryError> {
        self.call("getChat", &serde_json::json!({ "chat_id": chat_id }))
            .await
    }

    pub async fn get_chat_member(
        &self,
        chat_id: &str,
        user_id: i64,
    ) -> Result<ChatMember, DeliveryError> {
        let body = serde_json::json!({
            "chat_id": chat_id,
            "user_id": user_id,
        });
        self.call("getChatMember", &body).await
    }

    pub async fn get_updates(&self, offset: i64) -> Result<Vec<Update>, DeliveryError> {
        let body = serde_json::json!({
            "offset": offset,
            "timeout": POLL_TIMEOUT_SECS,
            "allowed_updates": ["message"],
        });
        self.call("getUpdates", &body).await
    }
}

// ── Transport ───────────────────────────────────────────────────────

/// The delivery primitive the workers invoke.
pub struct TelegramTransport {
    api: Arc<TelegramApi>,
}

impl TelegramTransport {
    pub fn new(api: Arc<TelegramApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl Transport for TelegramTransport {
    async fn deliver(&self, chat_id: &str, text: &str) -> Result<(), DeliveryError> {
        for chunk in split_message(text, TELEGRAM_MAX_MESSAGE_LENGTH) {
            self.api.send_message(chat_id, &chunk).await?;
        }
        Ok(())
    }
}

/// Check the configured chat and record it as the active destination
/// with the admin flag observed from getChatMember.
pub async fn verify_destination(
    api: &TelegramApi,
    relay: &Relay,
    chat_id: &str,
) -> Result<Destination, Error> {
    let me = api.get_me().await?;
    let title = match api.get_chat(chat_id).await {
        Ok(chat) => chat.title,
        Err(e) => {
            warn!(chat_id, "Could not fetch chat details: {e}");
            None
        }
    };

    let bot_is_admin = match api.get_chat_member(chat_id, me.id).await {
        Ok(member) => matches!(member.status.as_str(), "administrator" | "creator"),
        Err(e) => {
            warn!(chat_id, "Admin verification failed: {e}");
            false
        }
    };

    if !bot_is_admin {
        warn!(chat_id, "Bot is not an administrator; delivery will be refused");
    }
    let destination = relay
        .set_destination(chat_id, title.as_deref(), bot_is_admin)
        .await?;
    info!(chat_id, bot_is_admin, "Destination verified and recorded");
    Ok(destination)
}

// ── Inbound bot ─────────────────────────────────────────────────────

/// Long-polling bot surface: commands plus message submission.
pub struct TelegramBot {
    api: Arc<TelegramApi>,
    relay: Arc<Relay>,
    allowed_users: Vec<String>,
}

impl TelegramBot {
    pub fn new(api: Arc<TelegramApi>, relay: Arc<Relay>, allowed_users: Vec<String>) -> Self {
        Self {
            api,
            relay,
            allowed_users,
        }
    }

    /// Poll for updates until the task is aborted.
    pub async fn run(&self) {
        let mut offset: i64 = 0;
        info!("Telegram bot listening for messages");

        loop {
            let updates = match self.api.get_updates(offset).await {
                Ok(updates) => updates,
                Err(e) => {
                    warn!("Telegram poll error: {e}");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };

            for update in updates {
                offset = offset.max(update.update_id + 1);
                let Some(message) = update.message else {
                    continue;
                };
                self.handle_message(&message).await;
            }
        }
    }

    async fn handle_message(&self, message: &IncomingMessage) {
        let Some(text) = message.text.as_deref() else {
            return;
        };
        let chat_id = message.chat.id.to_string();

        let sender_id = message.from.as_ref().map(|f| f.id.to_string());
        let username = message.from.as_ref().and_then(|f| f.username.as_deref());

        let mut identities: Vec<&str> = Vec::new();
        if let Some(name) = username {
            identities.push(name);
        }
        if let Some(ref id) = sender_id {
            identities.push(id.as_str());
        }
        if !sender_allowed(&self.allowed_users, identities) {
            warn!(
                username = username.unwrap_or("unknown"),
                sender_id = sender_id.as_deref().unwrap_or("unknown"),
                "Ignoring message from unauthorized sender"
            );
            return;
        }

        let submitter = sender_id.unwrap_or_else(|| "unknown".to_string());
        match text.split_whitespace().next() {
            Some("/start") | Some("/help") => self.reply(&chat_id, USAGE).await,
            Some("/status") => self.handle_status(&chat_id).await,
            Some("/recent") => self.handle_recent(&chat_id).await,
            Some("/refresh") => self.handle_refresh(&chat_id).await,
            Some("/stop") => self.handle_stop(&chat_id).await,
            _ => self.handle_submission(&chat_id, &submitter, text).await,
        }
    }

    async fn handle_status(&self, chat_id: &str) {
        match self.relay.stats().await {
            Ok(stats) => {
                let text = format!(
                    "Queue status:\nwaiting: {}\nactive: {}\ncompleted: {}\nfailed: {}\ndelayed: {}",
                    stats.waiting, stats.active, stats.completed, stats.failed, stats.delayed
                );
                self.reply(chat_id, &text).await;
            }
            Err(e) => {
                warn!("Stats query failed: {e}");
                self.reply(chat_id, "Could not read queue status.").await;
            }
        }
    }

    async fn handle_recent(&self, chat_id: &str) {
        match self.relay.list_recent(5).await {
            Ok(records) if records.is_empty() => {
                self.reply(chat_id, "No messages yet.").await;
            }
            Ok(records) => {
                let lines: Vec<String> = records
                    .iter()
                    .map(|r| format!("[{}] {}", r.status, truncate_preview(&r.processed_text, 60)))
                    .collect();
                self.reply(chat_id, &lines.join("\n")).await;
            }
            Err(e) => {
                warn!("Recent query failed: {e}");
                self.reply(chat_id, "Could not read recent messages.").await;
            }
        }
    }

    async fn handle_refresh(&self, chat_id: &str) {
        match self.relay.reload().await {
            Ok(()) => self.reply(chat_id, "Filters and settings reloaded.").await,
            Err(e) => {
                warn!("Registry reload failed: {e}");
                self.reply(chat_id, "Reload failed.").await;
            }
        }
    }

    async fn handle_stop(&self, chat_id: &str) {
        match self.relay.stop().await {
            Ok(()) => {
                self.reply(chat_id, "Relay stopped: destination cleared, filters unloaded.")
                    .await;
            }
            Err(e) => {
                warn!("Stop failed: {e}");
                self.reply(chat_id, "Stop failed.").await;
            }
        }
    }

    /// Run a plain message through the pipeline. The destination gate is
    /// checked first so a refused submission creates no record.
    async fn handle_submission(&self, chat_id: &str, submitter: &str, text: &str) {
        match self.relay.active_destination().await {
            Ok(Some(destination)) if destination.bot_is_admin => {}
            Ok(Some(_)) => {
                self.reply(chat_id, "Bot is not an administrator of the destination.")
                    .await;
                return;
            }
            Ok(None) => {
                self.reply(chat_id, "No destination configured.").await;
                return;
            }
            Err(e) => {
                warn!("Destination lookup failed: {e}");
                self.reply(chat_id, "Could not check the destination.").await;
                return;
            }
        }

        match self.relay.submit(text, submitter).await {
            Ok(record) => {
                info!(record_id = %record.id, "Message queued from Telegram");
                self.reply(chat_id, "Queued for delivery.").await;
            }
            Err(e) => {
                warn!("Submission failed: {e}");
                self.reply(chat_id, "Could not queue the message.").await;
            }
        }
    }

    /// Best-effort reply; a failed acknowledgement is logged, not fatal.
    async fn reply(&self, chat_id: &str, text: &str) {
        if let Err(e) = self.api.send_message(chat_id, text).await {
            warn!(chat_id, "Could not send reply: {e}");
        }
    }
}

const USAGE: &str = "I relay messages to the configured channel.\n\n\
    Send me any text and I will filter it and queue it for delivery.\n\n\
    Commands:\n\
    /status - queue counters\n\
    /recent - latest messages and their state\n\
    /refresh - reload filters and settings\n\
    /stop - clear the destination and unload filters\n\
    /help - this text";

// ── Helpers ─────────────────────────────────────────────────────────

/// Check if any identity in the iterator matches the allowed users list.
fn sender_allowed<'a>(
    allowed_users: &[String],
    identities: impl IntoIterator<Item = &'a str>,
) -> bool {
    let ids: Vec<&str> = identities.into_iter().collect();
    allowed_users
        .iter()
        .any(|u| u == "*" || ids.contains(&u.as_str()))
}

/// Split a message into chunks that fit Telegram's character limit.
/// Tries to split on newlines, then spaces, then hard-cuts. The limit
/// counts characters (Telegram's unit), and every cut lands on a char
/// boundary, so multi-byte text never splits mid-character.
fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        // Byte index just past the max_chars-th character, if the rest
        // is long enough to need a cut at all.
        let boundary = match remaining.char_indices().nth(max_chars) {
            Some((idx, _)) => idx,
            None => {
                chunks.push(remaining.to_string());
                break;
            }
        };

        let chunk = &remaining[..boundary];
        let split_at = chunk
            .rfind('\n')
            .or_else(|| chunk.rfind(' '))
            .unwrap_or(boundary);

        // Don't split at position 0 (infinite loop guard)
        let split_at = if split_at == 0 { boundary } else { split_at };

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    if chunks.is_empty() {
        chunks.push(String::new());
    }
    chunks
}

fn truncate_preview(text: &str, max_chars: usize) -> String {
    let flat = text.replace('\n', " ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let cut: String = flat.chars().take(max_chars).collect();
    format!("{cut}...")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_envelope(json: &str) -> ApiResponse<serde_json::Value> {
        serde_json::from_str(json).unwrap()
    }

    // ── Envelope mapping ────────────────────────────────────────────

    #[test]
    fn ok_envelope_yields_the_result() {
        let envelope = parse_envelope(r#"{"ok": true, "result": {"message_id": 7}}"#);
        let result = envelope_to_result(envelope).unwrap();
        assert_eq!(result["message_id"], 7);
    }

    #[test]
    fn throttle_envelope_maps_to_rate_limited_with_hint() {
        let envelope = parse_envelope(
            r#"{"ok": false, "error_code": 429,
                "description": "Too Many Requests: retry after 12",
                "parameters": {"retry_after": 12}}"#,
        );
        match envelope_to_result(envelope).unwrap_err() {
            DeliveryError::RateLimited { retry_after } => {
                assert_eq!(retry_after, Some(Duration::from_secs(12)));
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[test]
    fn throttle_without_parameters_has_no_hint() {
        let envelope = parse_envelope(r#"{"ok": false, "error_code": 429}"#);
        match envelope_to_result(envelope).unwrap_err() {
            DeliveryError::RateLimited { retry_after } => assert_eq!(retry_after, None),
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[test]
    fn other_errors_keep_the_api_description() {
        let envelope = parse_envelope(
            r#"{"ok": false, "error_code": 400, "description": "Bad Request: chat not found"}"#,
        );
        match envelope_to_result(envelope).unwrap_err() {
            DeliveryError::Api(desc) => assert!(desc.contains("chat not found")),
            other => panic!("expected Api, got {other:?}"),
        }
    }

    #[test]
    fn api_url_embeds_token_and_method() {
        let api = TelegramApi::new("123:ABC".to_string());
        assert_eq!(
            api.api_url("getMe"),
            "https://api.telegram.org/bot123:ABC/getMe"
        );
    }

    // ── Allowlist ───────────────────────────────────────────────────

    fn allowlist(users: &[&str]) -> Vec<String> {
        users.iter().map(|u| u.to_string()).collect()
    }

    #[test]
    fn wildcard_allows_anyone() {
        assert!(sender_allowed(&allowlist(&["*"]), ["anyone"]));
    }

    #[test]
    fn specific_allowlist_is_exact_match() {
        let allowed = allowlist(&["alice", "42"]);
        assert!(sender_allowed(&allowed, ["alice"]));
        assert!(sender_allowed(&allowed, ["unknown", "42"]));
        assert!(!sender_allowed(&allowed, ["alice_bot"]));
        assert!(!sender_allowed(&allowed, ["eve", "7"]));
    }

    #[test]
    fn empty_allowlist_denies_everyone() {
        assert!(!sender_allowed(&allowlist(&[]), ["anyone"]));
    }

    // ── Message splitting ───────────────────────────────────────────

    #[test]
    fn short_messages_stay_whole() {
        assert_eq!(split_message("hello", 4096), vec!["hello".to_string()]);
    }

    #[test]
    fn long_messages_split_on_line_breaks() {
        let text = format!("{}\n{}", "a".repeat(30), "b".repeat(30));
        let chunks = split_message(&text, 40);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], "a".repeat(30));
        assert_eq!(chunks[1], "b".repeat(30));
    }

    #[test]
    fn unbreakable_text_hard_cuts() {
        let text = "x".repeat(100);
        let chunks = split_message(&text, 40);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len() <= 40));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn multibyte_text_splits_on_char_boundaries() {
        // Each char is 3 bytes; a byte-indexed cut would land inside one.
        let text = "€".repeat(100);
        let chunks = split_message(&text, 40);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= 40));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn limit_counts_characters_not_bytes() {
        // 2000 chars but 6000 bytes: fits the 4096-char limit whole.
        let text = "€".repeat(2000);
        assert_eq!(split_message(&text, 4096), vec![text.clone()]);
    }

    #[test]
    fn preview_truncates_and_flattens() {
        assert_eq!(truncate_preview("one\ntwo", 60), "one two");
        assert_eq!(
            truncate_preview(&"y".repeat(70), 60),
            format!("{}...", "y".repeat(60))
        );
    }
}

//! Chat transport seam.
//!
//! The menu surface manager and the handlers only ever talk to
//! [`ChatTransport`]; production wires in the teloxide implementation and
//! tests use a scripted mock. Not-found outcomes are data, not errors,
//! because the surface state machine branches on them.

use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup, MessageId, ParseMode};
use tracing::warn;

use crate::error::{Result, TelegramError};
use crate::send::escape_markdown_v2;

/// Inline keyboard, transport-neutral.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Keyboard {
    pub rows: Vec<Vec<Button>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Button {
    pub label: String,
    pub data: String,
}

impl Keyboard {
    pub fn single_column(buttons: Vec<Button>) -> Self {
        Self {
            rows: buttons.into_iter().map(|b| vec![b]).collect(),
        }
    }
}

impl Button {
    pub fn new(label: &str, data: &str) -> Self {
        Self {
            label: label.to_string(),
            data: data.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOutcome {
    Edited,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Send a message; returns the new message id.
    async fn send_text(&self, chat_id: i64, text: &str, keyboard: Option<&Keyboard>)
        -> Result<i64>;

    /// Edit an existing message in place.
    async fn edit_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<EditOutcome>;

    /// Delete a message.
    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<DeleteOutcome>;
}

// ---------------------------------------------------------------------------
// Teloxide implementation
// ---------------------------------------------------------------------------

pub struct TeloxideTransport {
    bot: Bot,
}

impl TeloxideTransport {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

fn to_markup(keyboard: &Keyboard) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(keyboard.rows.iter().map(|row| {
        row.iter()
            .map(|b| InlineKeyboardButton::callback(b.label.clone(), b.data.clone()))
            .collect::<Vec<_>>()
    }))
}

fn is_not_found(err: &teloxide::RequestError) -> bool {
    match err {
        teloxide::RequestError::Api(api) => {
            matches!(
                api,
                teloxide::ApiError::MessageToEditNotFound
                    | teloxide::ApiError::MessageToDeleteNotFound
                    | teloxide::ApiError::MessageIdInvalid
            )
        }
        _ => false,
    }
}

#[async_trait]
impl ChatTransport for TeloxideTransport {
    async fn send_text(&self, chat_id: i64, text: &str, keyboard: Option<&Keyboard>) -> Result<i64> {
        // MarkdownV2 first, plain text when Telegram rejects the escaping.
        let escaped = escape_markdown_v2(text);
        let mut request = self
            .bot
            .send_message(ChatId(chat_id), &escaped)
            .parse_mode(ParseMode::MarkdownV2);
        if let Some(kb) = keyboard {
            request = request.reply_markup(to_markup(kb));
        }

        match request.await {
            Ok(message) => return Ok(message.id.0 as i64),
            Err(e) => warn!(error = %e, "MarkdownV2 send rejected, falling back to plain text"),
        }

        let mut request = self.bot.send_message(ChatId(chat_id), text);
        if let Some(kb) = keyboard {
            request = request.reply_markup(to_markup(kb));
        }
        let message = request
            .await
            .map_err(|e| TelegramError::Transport(e.to_string()))?;
        Ok(message.id.0 as i64)
    }

    async fn edit_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<EditOutcome> {
        let mut request =
            self.bot
                .edit_message_text(ChatId(chat_id), MessageId(message_id as i32), text);
        if let Some(kb) = keyboard {
            request = request.reply_markup(to_markup(kb));
        }
        match request.await {
            Ok(_) => Ok(EditOutcome::Edited),
            Err(e) if is_not_found(&e) => Ok(EditOutcome::NotFound),
            Err(e) => Err(TelegramError::Transport(e.to_string())),
        }
    }

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<DeleteOutcome> {
        match self
            .bot
            .delete_message(ChatId(chat_id), MessageId(message_id as i32))
            .await
        {
            Ok(_) => Ok(DeleteOutcome::Deleted),
            Err(e) if is_not_found(&e) => Ok(DeleteOutcome::NotFound),
            Err(e) => Err(TelegramError::Transport(e.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Scripted mock for tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Call {
        Send { chat_id: i64, message_id: i64 },
        Edit { chat_id: i64, message_id: i64 },
        Delete { chat_id: i64, message_id: i64 },
    }

    /// In-memory transport: assigns increasing message ids, remembers which
    /// messages exist, and can be told to fail edits or deletes.
    #[derive(Default)]
    pub struct MockTransport {
        next_id: AtomicI64,
        pub calls: Mutex<Vec<Call>>,
        live: Mutex<HashSet<(i64, i64)>>,
        pub fail_edits: AtomicBool,
        pub fail_deletes: AtomicBool,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self {
                next_id: AtomicI64::new(1),
                ..Default::default()
            }
        }

        pub fn live_messages(&self, chat_id: i64) -> Vec<i64> {
            let mut ids: Vec<i64> = self
                .live
                .lock()
                .unwrap()
                .iter()
                .filter(|(c, _)| *c == chat_id)
                .map(|(_, m)| *m)
                .collect();
            ids.sort();
            ids
        }

        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChatTransport for MockTransport {
        async fn send_text(
            &self,
            chat_id: i64,
            _text: &str,
            _keyboard: Option<&Keyboard>,
        ) -> Result<i64> {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            self.live.lock().unwrap().insert((chat_id, id));
            self.calls.lock().unwrap().push(Call::Send {
                chat_id,
                message_id: id,
            });
            Ok(id)
        }

        async fn edit_text(
            &self,
            chat_id: i64,
            message_id: i64,
            _text: &str,
            _keyboard: Option<&Keyboard>,
        ) -> Result<EditOutcome> {
            self.calls.lock().unwrap().push(Call::Edit {
                chat_id,
                message_id,
            });
            if self.fail_edits.load(Ordering::SeqCst) {
                return Ok(EditOutcome::NotFound);
            }
            if self.live.lock().unwrap().contains(&(chat_id, message_id)) {
                Ok(EditOutcome::Edited)
            } else {
                Ok(EditOutcome::NotFound)
            }
        }

        async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<DeleteOutcome> {
            self.calls.lock().unwrap().push(Call::Delete {
                chat_id,
                message_id,
            });
            if self.fail_deletes.load(Ordering::SeqCst) {
                return Err(TelegramError::Transport("delete refused".into()));
            }
            if self.live.lock().unwrap().remove(&(chat_id, message_id)) {
                Ok(DeleteOutcome::Deleted)
            } else {
                Ok(DeleteOutcome::NotFound)
            }
        }
    }
}

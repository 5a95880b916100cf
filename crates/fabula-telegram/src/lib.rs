//! Telegram-facing layer: the chat transport seam, the chat-cleanliness
//! state machine (one live main menu per chat, TTL-bounded ephemerals), the
//! per-chat rate limiter, and the command/callback/reaction handlers wired
//! into a teloxide dispatcher.

pub mod adapter;
pub mod commands;
pub mod context;
pub mod error;
pub mod limiter;
pub mod send;
pub mod surface;
pub mod tracker;
pub mod transport;

pub use adapter::TelegramAdapter;
pub use context::BotContext;
pub use error::{Result, TelegramError};
pub use surface::MenuSurfaceManager;
pub use tracker::{MessageKind, SurfaceRegistry};
pub use transport::{Button, ChatTransport, DeleteOutcome, EditOutcome, Keyboard, TeloxideTransport};

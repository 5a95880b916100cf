//! Telegram channel adapter.
//!
//! Wraps a teloxide `Bot` + `Dispatcher` and drives the long-polling event
//! loop until the process exits. Three branches: private messages
//! (commands), callback queries (inline keyboards), and channel reactions
//! (normalised and fed to the reaction gate). It also hosts the bus
//! subscriber that sends due scheduled posts to their channel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{MessageReactionUpdated, ReactionType, User};
use tracing::{debug, info, warn};

use fabula_bus::EventHandler;
use fabula_core::config::{TransportConfig, COMMAND_TIMEOUT_MS};
use fabula_core::events::{Event, EventPayload};
use fabula_missions::RawReaction;
use fabula_store::{collections, DocumentStore};
use fabula_users::ExternalUser;

use crate::commands;
use crate::context::BotContext;
use crate::transport::ChatTransport;

pub struct TelegramAdapter {
    ctx: Arc<BotContext>,
    config: TransportConfig,
}

impl TelegramAdapter {
    pub fn new(config: &TransportConfig, ctx: Arc<BotContext>) -> Self {
        Self {
            ctx,
            config: config.clone(),
        }
    }

    /// Connect to Telegram and drive the long-polling loop.
    ///
    /// Never returns; runs for the lifetime of the process. Reaction
    /// updates only arrive when `message_reaction` is in allowed_updates,
    /// which the default dispatcher derives from the registered branches.
    pub async fn run(self) {
        let bot = Bot::new(&self.config.token);

        if self.config.mode == fabula_core::config::TransportMode::Webhook {
            // Webhook ingress needs a public URL and a reverse proxy; until
            // that is wired, webhook-configured deployments poll as well.
            warn!("webhook mode configured, falling back to long polling");
        }
        info!("Telegram: starting long-polling dispatcher");

        let handler = dptree::entry()
            .branch(Update::filter_message().endpoint(on_message))
            .branch(Update::filter_callback_query().endpoint(on_callback))
            .branch(Update::filter_message_reaction_updated().endpoint(on_reaction));

        Dispatcher::builder(bot, handler)
            .dependencies(dptree::deps![self.ctx])
            .default_handler(|_upd| async {})
            .build()
            .dispatch()
            .await;
    }
}

fn external_user(from: &User) -> ExternalUser {
    let display_name = from
        .username
        .clone()
        .unwrap_or_else(|| from.first_name.clone());
    ExternalUser {
        external_id: from.id.0 as i64,
        display_name,
        language: from.language_code.clone().unwrap_or_else(|| "es".to_string()),
    }
}

async fn on_message(msg: Message, ctx: Arc<BotContext>) -> ResponseResult<()> {
    // Only private chats drive the menu surface; channel/group noise is for
    // the reaction branch.
    if !msg.chat.is_private() {
        return Ok(());
    }
    let Some(from) = msg.from.as_ref() else {
        return Ok(());
    };
    if from.is_bot {
        return Ok(());
    }
    let Some(text) = msg.text().map(|t| t.to_string()) else {
        return Ok(());
    };

    let external = external_user(from);
    let chat_id = msg.chat.id.0;

    // Handle off the dispatcher task so a slow store never blocks polling;
    // the whole command gets one end-to-end budget.
    tokio::spawn(async move {
        let outcome = tokio::time::timeout(
            Duration::from_millis(COMMAND_TIMEOUT_MS),
            commands::handle_text(&ctx, chat_id, external, &text),
        )
        .await;
        if outcome.is_err() {
            warn!(chat_id, "command handling timed out");
        }
    });
    Ok(())
}

async fn on_callback(bot: Bot, query: CallbackQuery, ctx: Arc<BotContext>) -> ResponseResult<()> {
    // Ack immediately so the client stops its spinner.
    let _ = bot.answer_callback_query(query.id.clone()).await;

    let Some(data) = query.data.clone() else {
        return Ok(());
    };
    let Some(chat_id) = query.message.as_ref().map(|m| m.chat().id.0) else {
        return Ok(());
    };
    let external = external_user(&query.from);

    tokio::spawn(async move {
        let outcome = tokio::time::timeout(
            Duration::from_millis(COMMAND_TIMEOUT_MS),
            commands::handle_callback(&ctx, chat_id, external, &data),
        )
        .await;
        if outcome.is_err() {
            warn!(chat_id, "callback handling timed out");
        }
    });
    Ok(())
}

async fn on_reaction(update: MessageReactionUpdated, ctx: Arc<BotContext>) -> ResponseResult<()> {
    let Some(user) = update.user.as_ref() else {
        // Anonymous (channel-identity) reactions cannot award missions.
        return Ok(());
    };

    // Reactions only count for known users; reacting is not a registration
    // path.
    let internal_id = match ctx.registry.get_by_external(user.id.0 as i64) {
        Ok(Some(view)) => match view.complete() {
            Some(merged) => merged.profile.internal_id,
            None => return Ok(()),
        },
        Ok(None) => {
            debug!(external_id = user.id.0, "reaction from unregistered user ignored");
            return Ok(());
        }
        Err(e) => {
            warn!(error = %e, "reaction user lookup failed");
            return Ok(());
        }
    };

    // Newly added emoji only: removals and repeats in old_reaction are not
    // observations.
    for reaction in &update.new_reaction {
        if update.old_reaction.contains(reaction) {
            continue;
        }
        let ReactionType::Emoji { emoji } = reaction else {
            continue;
        };
        let raw = RawReaction {
            user_id: internal_id.clone(),
            channel_id: update.chat.id.0,
            emoji: emoji.clone(),
            source_message_id: update.message_id.0 as i64,
        };
        ctx.gate.observe(raw).await;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Scheduled-post delivery (bus subscriber)
// ---------------------------------------------------------------------------

/// Sends due scheduled posts to their channel. Subscribed to
/// `post_published`; failures bubble back to the bus for retry and
/// dead-lettering.
pub struct PostPublisher {
    pub docs: Arc<DocumentStore>,
    pub transport: Arc<dyn ChatTransport>,
}

#[async_trait]
impl EventHandler for PostPublisher {
    fn name(&self) -> &str {
        "post_publisher"
    }

    async fn handle(&self, event: &Event) -> Result<(), String> {
        let Some(EventPayload::PostPublished {
            post_id,
            channel_id,
            ..
        }) = event.decode()
        else {
            return Ok(());
        };

        let doc = self
            .docs
            .get(collections::SCHEDULED_POSTS, &post_id)
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("scheduled post {} missing", post_id))?;
        let body = doc.body["body"].as_str().unwrap_or_default().to_string();

        self.transport
            .send_text(channel_id, &body, None)
            .await
            .map_err(|e| e.to_string())?;
        info!(post_id = %post_id, channel_id, "scheduled post delivered");
        Ok(())
    }
}

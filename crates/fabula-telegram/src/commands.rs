//! The canonical command and callback handlers.
//!
//! Every inbound interaction resolves the user (registering on first
//! contact), sweeps due ephemerals, then runs one handler. Domain errors are
//! mapped to actionable ephemerals; the main menu is always edited in place
//! through the surface manager.

use std::sync::Arc;

use tracing::{debug, error, warn};

use fabula_narrative::{Fragment, NarrativeError};
use fabula_users::{DenyReason, ExternalUser, MergedUser};

use crate::context::BotContext;
use crate::surface::MenuSurfaceManager;
use crate::tracker::MessageKind;
use crate::transport::{Button, Keyboard};

/// Handle a plain text message (commands only; free text gets a nudge).
pub async fn handle_text(ctx: &Arc<BotContext>, chat_id: i64, from: ExternalUser, text: &str) {
    ctx.surface.on_user_command(chat_id).await;

    let trimmed = text.trim();
    if !trimmed.starts_with('/') {
        send_kind(
            &ctx.surface,
            chat_id,
            MessageKind::EphemeralInfo,
            "Usa los botones del menú o escribe /menu.",
            None,
        )
        .await;
        return;
    }
    let command = trimmed.split_whitespace().next().unwrap_or("");

    let (user, created) = match ctx.registry.ensure(from).await {
        Ok(pair) => pair,
        Err(e) => {
            error!(chat_id, error = %e, "user resolution failed");
            send_kind(
                &ctx.surface,
                chat_id,
                MessageKind::Error,
                "Algo salió mal. El equipo ya está avisado.",
                None,
            )
            .await;
            return;
        }
    };
    let user_id = user.profile.internal_id.clone();
    let _ = ctx.registry.touch_last_seen(&user_id);

    match command {
        "/start" => start(ctx, chat_id, &user, created).await,
        "/menu" => show_main_menu(ctx, chat_id, &user_id).await,
        "/historia" => show_story(ctx, chat_id, &user_id).await,
        "/billetera" => show_wallet(ctx, chat_id, &user_id).await,
        "/tienda" => show_shop(ctx, chat_id).await,
        "/misiones" => show_missions(ctx, chat_id, &user_id).await,
        other => {
            debug!(chat_id, command = other, "unknown command");
            send_kind(
                &ctx.surface,
                chat_id,
                MessageKind::EphemeralInfo,
                "Comando no reconocido. Prueba /menu.",
                None,
            )
            .await;
        }
    }
}

/// Handle an inline-keyboard callback. `data` follows the grammar
/// `menu:<section>`, `frag:<id>`, `choice:<fragment>:<choice>`,
/// `pista:<hint>`.
pub async fn handle_callback(ctx: &Arc<BotContext>, chat_id: i64, from: ExternalUser, data: &str) {
    ctx.surface.on_user_command(chat_id).await;

    let (user, _) = match ctx.registry.ensure(from).await {
        Ok(pair) => pair,
        Err(e) => {
            error!(chat_id, error = %e, "user resolution failed");
            return;
        }
    };
    let user_id = user.profile.internal_id.clone();

    let parts: Vec<&str> = data.split(':').collect();
    match parts.as_slice() {
        ["menu", "main"] => show_main_menu(ctx, chat_id, &user_id).await,
        ["menu", "historia"] => show_story(ctx, chat_id, &user_id).await,
        ["menu", "billetera"] => show_wallet(ctx, chat_id, &user_id).await,
        ["menu", "tienda"] => show_shop(ctx, chat_id).await,
        ["menu", "misiones"] => show_missions(ctx, chat_id, &user_id).await,
        ["menu", "vip"] => {
            send_kind(
                &ctx.surface,
                chat_id,
                MessageKind::EphemeralInfo,
                "La suscripción VIP se gestiona con el equipo de Diana. Escribe a soporte para activarla.",
                None,
            )
            .await;
        }
        ["frag", fragment_id] => deliver_fragment(ctx, chat_id, &user_id, fragment_id).await,
        ["choice", fragment_id, choice_id] => {
            make_choice(ctx, chat_id, &user_id, fragment_id, choice_id).await
        }
        ["pista", hint_id] => buy_hint(ctx, chat_id, &user_id, hint_id).await,
        _ => debug!(chat_id, data, "unrecognised callback data"),
    }
}

// ---------------------------------------------------------------------------
// Command bodies
// ---------------------------------------------------------------------------

async fn start(ctx: &Arc<BotContext>, chat_id: i64, user: &MergedUser, created: bool) {
    let user_id = &user.profile.internal_id;
    if created {
        if let Err(e) = ctx
            .missions
            .assign(user_id, &ctx.onboarding_template, None)
            .await
        {
            warn!(user_id = %user_id, error = %e, "onboarding mission could not be assigned");
        }
        // The welcome lists exactly the three things a new user can do.
        let welcome = "¡Bienvenida a Fabula! 💋\n\n\
            Aquí puedes:\n\
            • 📖 Vivir la historia interactiva de Diana\n\
            • 🎯 Completar misiones reaccionando en el canal\n\
            • 💋 Ganar besitos y canjearlos por pistas\n\n\
            Tu primera misión ya está activa.";
        send_kind(&ctx.surface, chat_id, MessageKind::EphemeralInfo, welcome, None).await;
    }
    show_main_menu(ctx, chat_id, user_id).await;
}

async fn show_main_menu(ctx: &Arc<BotContext>, chat_id: i64, user_id: &str) {
    let (level, balance) = match ctx.registry.load_state(user_id) {
        Ok(Some(state)) => (state.narrative_level, state.balance),
        _ => (1, 0),
    };
    let text = format!(
        "✨ Fabula\n\nNivel {} · {} besitos\n\n¿Qué quieres hacer?",
        level, balance
    );
    let keyboard = Keyboard {
        rows: vec![
            vec![
                Button::new("📖 Historia", "menu:historia"),
                Button::new("🎯 Misiones", "menu:misiones"),
            ],
            vec![
                Button::new("💋 Billetera", "menu:billetera"),
                Button::new("🛍 Tienda", "menu:tienda"),
            ],
        ],
    };
    if let Err(e) = ctx.surface.render_menu(chat_id, &text, Some(&keyboard)).await {
        error!(chat_id, error = %e, "main menu render failed");
    }
}

async fn show_story(ctx: &Arc<BotContext>, chat_id: i64, user_id: &str) {
    let fragment_id = match ctx.registry.load_state(user_id) {
        Ok(Some(state)) => ctx.engine.current_fragment_id(&state),
        _ => fabula_narrative::engine::ENTRY_FRAGMENT.to_string(),
    };
    deliver_fragment(ctx, chat_id, user_id, &fragment_id).await;
}

async fn deliver_fragment(ctx: &Arc<BotContext>, chat_id: i64, user_id: &str, fragment_id: &str) {
    match ctx.engine.deliver(user_id, fragment_id, None).await {
        Ok(fragment) => {
            let (text, keyboard) = render_fragment(&fragment);
            if let Err(e) = ctx.surface.render_menu(chat_id, &text, Some(&keyboard)).await {
                error!(chat_id, error = %e, "fragment render failed");
            }
        }
        Err(err) => report_narrative_error(&ctx.surface, chat_id, &err).await,
    }
}

async fn make_choice(
    ctx: &Arc<BotContext>,
    chat_id: i64,
    user_id: &str,
    fragment_id: &str,
    choice_id: &str,
) {
    match ctx
        .engine
        .process_choice(user_id, fragment_id, choice_id, None)
        .await
    {
        Ok(outcome) => {
            if !outcome.rewards.is_empty() {
                let mut notes = Vec::new();
                if let Some(c) = outcome.rewards.currency {
                    notes.push(format!("+{} besitos", c));
                }
                for hint in &outcome.rewards.hints {
                    notes.push(format!("pista «{}»", hint));
                }
                send_kind(
                    &ctx.surface,
                    chat_id,
                    MessageKind::Success,
                    &format!("Has ganado: {}", notes.join(", ")),
                    None,
                )
                .await;
            }
            match outcome.next_fragment_id {
                Some(next) => deliver_fragment(ctx, chat_id, user_id, &next).await,
                None => {
                    send_kind(
                        &ctx.surface,
                        chat_id,
                        MessageKind::EphemeralInfo,
                        "Fin del capítulo, por ahora. Diana volverá a escribirte.",
                        None,
                    )
                    .await;
                    show_main_menu(ctx, chat_id, user_id).await;
                }
            }
        }
        Err(err) => report_narrative_error(&ctx.surface, chat_id, &err).await,
    }
}

async fn buy_hint(ctx: &Arc<BotContext>, chat_id: i64, user_id: &str, hint_id: &str) {
    send_kind(&ctx.surface, chat_id, MessageKind::Loading, "Un momento…", None).await;
    match ctx.shop.purchase(user_id, hint_id, None).await {
        Ok(outcome) => {
            let mut text = if outcome.newly_unlocked {
                format!("Pista desbloqueada. Te quedan {} besitos.", outcome.balance_after)
            } else {
                "Esa pista ya era tuya.".to_string()
            };
            if let Some((_, new_level)) = outcome.level_change {
                text.push_str(&format!(" Has alcanzado el nivel {}. 🔓", new_level));
            }
            send_kind(&ctx.surface, chat_id, MessageKind::Success, &text, None).await;
            show_main_menu(ctx, chat_id, user_id).await;
        }
        Err(err) => report_narrative_error(&ctx.surface, chat_id, &err).await,
    }
}

async fn show_wallet(ctx: &Arc<BotContext>, chat_id: i64, user_id: &str) {
    let balance = ctx.ledger.balance(user_id).unwrap_or(0);
    let history = ctx.ledger.history(user_id).unwrap_or_default();
    let mut text = format!("💋 Tienes {} besitos.", balance);
    if !history.is_empty() {
        text.push_str("\n\nÚltimos movimientos:");
        for entry in history.iter().rev().take(3) {
            let sign = if entry.delta >= 0 { "+" } else { "" };
            text.push_str(&format!("\n{}{} · {}", sign, entry.delta, entry.reason));
        }
    }
    send_kind(&ctx.surface, chat_id, MessageKind::Response, &text, None).await;
}

async fn show_shop(ctx: &Arc<BotContext>, chat_id: i64) {
    let hints = match ctx.shop.catalogue() {
        Ok(hints) if !hints.is_empty() => hints,
        Ok(_) => {
            send_kind(
                &ctx.surface,
                chat_id,
                MessageKind::EphemeralInfo,
                "La tienda está vacía por ahora.",
                None,
            )
            .await;
            return;
        }
        Err(e) => {
            error!(chat_id, error = %e, "shop catalogue unavailable");
            send_kind(
                &ctx.surface,
                chat_id,
                MessageKind::Error,
                "La tienda no responde. Inténtalo en un momento.",
                None,
            )
            .await;
            return;
        }
    };

    let buttons = hints
        .iter()
        .map(|h| {
            Button::new(
                &format!("{} · {} besitos", h.title, h.cost_currency),
                &format!("pista:{}", h.hint_id),
            )
        })
        .collect();
    send_kind(
        &ctx.surface,
        chat_id,
        MessageKind::Response,
        "🛍 Pistas disponibles:",
        Some(&Keyboard::single_column(buttons)),
    )
    .await;
}

async fn show_missions(ctx: &Arc<BotContext>, chat_id: i64, user_id: &str) {
    let missions = ctx.missions.active_missions(user_id).unwrap_or_default();
    let text = if missions.is_empty() {
        "No tienes misiones activas. Pronto llegarán más.".to_string()
    } else {
        let mut lines = vec!["🎯 Tus misiones:".to_string()];
        for m in &missions {
            lines.push(format!(
                "• {} ({}/{}) · recompensa {} besitos",
                m.template_id, m.progress.current, m.progress.target, m.reward
            ));
        }
        lines.join("\n")
    };
    send_kind(&ctx.surface, chat_id, MessageKind::Response, &text, None).await;
}

// ---------------------------------------------------------------------------
// Rendering and error mapping
// ---------------------------------------------------------------------------

fn render_fragment(fragment: &Fragment) -> (String, Keyboard) {
    let text = format!("📖 {}\n\n{}", fragment.title, fragment.body);
    let mut rows: Vec<Vec<Button>> = fragment
        .choices
        .iter()
        .map(|c| {
            vec![Button::new(
                &c.label,
                &format!("choice:{}:{}", fragment.fragment_id, c.choice_id),
            )]
        })
        .collect();
    rows.push(vec![Button::new("⬅ Menú", "menu:main")]);
    (crate::send::clamp_message(&text), Keyboard { rows })
}

/// Map a domain error to a user-facing ephemeral. Actionable denials carry a
/// button; unexpected errors stay generic.
async fn report_narrative_error(surface: &Arc<MenuSurfaceManager>, chat_id: i64, err: &NarrativeError) {
    let (kind, text, keyboard) = match err {
        NarrativeError::AccessDenied { reason } => {
            let keyboard = match reason {
                DenyReason::VipRequired => Some(Keyboard::single_column(vec![Button::new(
                    "💎 Hazte VIP",
                    "menu:vip",
                )])),
                _ => None,
            };
            (MessageKind::Error, reason.guidance(), keyboard)
        }
        NarrativeError::InvalidChoice { .. } => (
            MessageKind::Error,
            "Esa opción ya no está disponible. Vuelve a la historia con /historia.".to_string(),
            None,
        ),
        NarrativeError::Ledger(ledger_err) if ledger_err.code() == "INSUFFICIENT_FUNDS" => (
            MessageKind::Error,
            "No te alcanzan los besitos. Completa misiones para ganar más.".to_string(),
            None,
        ),
        NarrativeError::Ledger(ledger_err) if ledger_err.code() == "CONTENTION_EXCEEDED" => (
            MessageKind::Error,
            "Hay mucho movimiento ahora mismo. Inténtalo de nuevo en unos segundos.".to_string(),
            None,
        ),
        NarrativeError::PartialFailure { .. } => (
            MessageKind::Error,
            "La compra no se completó y hemos devuelto tus besitos.".to_string(),
            None,
        ),
        err if err.code() == "SERVICE_DEGRADED" => (
            MessageKind::Error,
            "Estamos en ello. Vuelve a intentarlo en un momento.".to_string(),
            None,
        ),
        err if err.code() == "NOT_FOUND" => (
            MessageKind::Error,
            "Eso ya no existe o aún no está disponible.".to_string(),
            None,
        ),
        other => {
            error!(chat_id, error = %other, "unexpected narrative error");
            (
                MessageKind::Error,
                "Algo salió mal. El equipo ya está avisado.".to_string(),
                None,
            )
        }
    };
    send_kind(surface, chat_id, kind, &text, keyboard.as_ref()).await;
}

async fn send_kind(
    surface: &Arc<MenuSurfaceManager>,
    chat_id: i64,
    kind: MessageKind,
    text: &str,
    keyboard: Option<&Keyboard>,
) {
    if let Err(e) = surface.send_ephemeral(chat_id, kind, text, keyboard).await {
        warn!(chat_id, error = %e, "ephemeral send failed");
    }
}

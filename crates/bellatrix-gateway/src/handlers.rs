use std::sync::Arc;

use chrono::{SubsecRound, Utc};
use thiserror::Error;
use tracing::{error, info, warn};

use bellatrix_db::Database;
use bellatrix_db::models::MessageRow;
use bellatrix_types::events::{
    GatewayCommand, GatewayEvent, OlderMessagesRequest, SendChatMessage,
};
use bellatrix_types::models::{ChatMessage, profile_pic_or_default};

use crate::dispatcher::{ConnId, Dispatcher, Outbound};

/// Messages replayed when a connection joins a room.
pub const HISTORY_LIMIT: u32 = 30;
/// Page size of `request older messages`.
pub const OLDER_PAGE_SIZE: u32 = 20;
/// Longest accepted chat message, in characters, after trimming.
pub const MAX_MESSAGE_LEN: usize = 2000;

/// Shared state every connection task holds.
#[derive(Clone)]
pub struct GatewayContext {
    pub db: Arc<Database>,
    pub dispatcher: Dispatcher,
}

/// Per-connection state. `room` is set once a join succeeds.
#[derive(Debug)]
pub struct Session {
    pub conn_id: ConnId,
    pub user_id: i64,
    pub username: String,
    pub room: Option<i64>,
}

impl Session {
    pub fn new(conn_id: ConnId, user_id: i64, username: String) -> Self {
        Self {
            conn_id,
            user_id,
            username,
            room: None,
        }
    }
}

#[derive(Debug, Error)]
enum CommandError {
    /// The command was understood but not allowed; the text goes to the client.
    #[error("{0}")]
    Rejected(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

fn rejected(message: impl Into<String>) -> CommandError {
    CommandError::Rejected(message.into())
}

/// Run one client command. Room membership changes and chat broadcasts are
/// applied directly; everything else that has to be sent is returned for the
/// caller to deliver.
pub async fn handle_command(ctx: &GatewayContext, session: &mut Session, cmd: GatewayCommand) -> Vec<Outbound> {
    let command = cmd.name();

    let result = match cmd {
        GatewayCommand::JoinCoupleRoom(couple_id) => join_couple_room(ctx, session, couple_id).await,
        GatewayCommand::ChatMessage(msg) => chat_message(ctx, session, msg).await,
        GatewayCommand::RequestOlderMessages(req) => older_messages(ctx, session, req).await,
        GatewayCommand::Typing(payload) => {
            require_room(session, payload.couple_id).map(|()| {
                vec![Outbound::room_except(
                    payload.couple_id,
                    session.conn_id,
                    GatewayEvent::UserTyping {
                        sender: session.username.clone(),
                    },
                )]
            })
        }
        GatewayCommand::StopTyping(payload) => require_room(session, payload.couple_id).map(|()| {
            vec![Outbound::room_except(
                payload.couple_id,
                session.conn_id,
                GatewayEvent::UserStopTyping,
            )]
        }),
    };

    match result {
        Ok(outbound) => outbound,
        Err(CommandError::Rejected(message)) => {
            warn!("{} ({}) {} rejected: {}", session.username, session.conn_id, command, message);
            vec![error_event(session, command, message)]
        }
        Err(CommandError::Store(e)) => {
            error!("{} ({}) {} failed: {:#}", session.username, session.conn_id, command, e);
            vec![error_event(session, command, "Something went wrong, please try again.".into())]
        }
    }
}

fn error_event(session: &Session, command: &str, message: String) -> Outbound {
    Outbound::connection(
        session.conn_id,
        GatewayEvent::Error {
            command: command.to_string(),
            message,
        },
    )
}

fn require_room(session: &Session, couple_id: i64) -> Result<(), CommandError> {
    match session.room {
        Some(room) if room == couple_id => Ok(()),
        _ => Err(rejected("Join the couple room first.")),
    }
}

async fn join_couple_room(
    ctx: &GatewayContext,
    session: &mut Session,
    couple_id: i64,
) -> Result<Vec<Outbound>, CommandError> {
    let user_id = session.user_id;
    let user = run_db(ctx, move |db| db.get_user_by_id(user_id))
        .await?
        .ok_or_else(|| rejected("Unknown user."))?;

    if user.couple_id != couple_id {
        return Err(rejected("You are not a member of this couple."));
    }

    if !ctx.dispatcher.join(session.conn_id, couple_id).await {
        return Err(rejected("Connection is closing."));
    }
    session.room = Some(couple_id);

    let online: Vec<String> = ctx
        .dispatcher
        .room_users(couple_id)
        .await
        .into_iter()
        .map(|(_, name)| name)
        .collect();
    info!("{} joined room {} (online: {})", session.username, couple_id, online.join(", "));

    let history = run_db(ctx, move |db| db.recent_messages(couple_id, HISTORY_LIMIT)).await?;

    Ok(vec![Outbound::connection(
        session.conn_id,
        GatewayEvent::ChatHistory(into_chat(history)),
    )])
}

async fn chat_message(
    ctx: &GatewayContext,
    session: &Session,
    msg: SendChatMessage,
) -> Result<Vec<Outbound>, CommandError> {
    let couple_id = msg.couple_id;
    require_room(session, couple_id)?;

    if !msg.sender.trim().eq_ignore_ascii_case(&session.username) {
        return Err(rejected("Sender does not match the connected user."));
    }

    let text = msg.text.trim().to_string();
    if text.is_empty() {
        return Err(rejected("Message is empty."));
    }
    if text.chars().count() > MAX_MESSAGE_LEN {
        return Err(rejected(format!(
            "Message is longer than {} characters.",
            MAX_MESSAGE_LEN
        )));
    }

    let sender = msg.sender.trim().to_string();
    let user = run_db(ctx, move |db| db.get_user_by_username(&sender))
        .await?
        .ok_or_else(|| rejected("Sender not found."))?;
    if user.couple_id != couple_id {
        return Err(rejected("You are not a member of this couple."));
    }

    // Stored with millisecond precision; broadcast what history will return
    let created_at = msg.created_at.unwrap_or_else(Utc::now).trunc_subsecs(3);

    // Held until the broadcast is queued so live order is id order
    let _room = ctx.dispatcher.lock_room(couple_id).await;

    let stored_text = text.clone();
    let sender_id = user.id;
    let id = run_db(ctx, move |db| {
        db.insert_message(couple_id, sender_id, &stored_text, &created_at)
    })
    .await?;

    let message = ChatMessage {
        id,
        username: user.username,
        message_text: text,
        profile_pic: profile_pic_or_default(user.profile_pic),
        created_at,
    };

    ctx.dispatcher
        .emit_to_room(couple_id, &GatewayEvent::ChatMessage(message), None)
        .await;
    Ok(Vec::new())
}

async fn older_messages(
    ctx: &GatewayContext,
    session: &Session,
    req: OlderMessagesRequest,
) -> Result<Vec<Outbound>, CommandError> {
    let couple_id = req.couple_id;
    require_room(session, couple_id)?;

    let before = req.oldest_message_id;
    let page = run_db(ctx, move |db| db.messages_before(couple_id, before, OLDER_PAGE_SIZE)).await?;

    Ok(vec![Outbound::connection(
        session.conn_id,
        GatewayEvent::OlderMessagesLoaded(into_chat(page)),
    )])
}

fn into_chat(rows: Vec<MessageRow>) -> Vec<ChatMessage> {
    rows.into_iter().map(ChatMessage::from).collect()
}

async fn run_db<F, T>(ctx: &GatewayContext, f: F) -> anyhow::Result<T>
where
    F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let db = ctx.db.clone();
    tokio::task::spawn_blocking(move || f(&db))
        .await
        .map_err(|e| anyhow::anyhow!("spawn_blocking join error: {}", e))?
}

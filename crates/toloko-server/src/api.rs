use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, put},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use toloko_shared::constants::{DEFAULT_CONVERSATION_PAGE, DEFAULT_MESSAGE_PAGE, MAX_PAGE};
use toloko_shared::{AttachmentId, ConversationId, MessageId, UserId};
use toloko_store::{
    Attachment, Block, BlockStats, Conversation, ConversationStats, Database, Message,
    MessageStats, NewAttachment, Presence,
};

use crate::attachment_store::AttachmentStore;
use crate::auth::{AuthUser, TokenVerifier};
use crate::config::ServerConfig;
use crate::db::Db;
use crate::delivery::MessageDelivery;
use crate::error::{OrNotFound, ServerError};
use crate::hub::Registry;
use crate::presence::PresenceTracker;
use crate::resolver::ConversationResolver;
use crate::ws;

/// Room for multipart framing on top of the file itself.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Default number of search hits.
const DEFAULT_SEARCH_LIMIT: u32 = 20;

/// Blocks listed in `recent_blocks` of the block stats.
const RECENT_BLOCKS: u32 = 5;

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub registry: Registry,
    pub resolver: ConversationResolver,
    pub delivery: MessageDelivery,
    pub presence: PresenceTracker,
    pub attachments: Arc<AttachmentStore>,
    pub verifier: TokenVerifier,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    /// Open the database named in the config and start the registry.
    pub async fn init(config: ServerConfig) -> Result<(Self, JoinHandle<()>), ServerError> {
        let database = Database::open_at(&config.database_path)?;
        Self::with_database(config, database).await
    }

    /// Wire every component around an already opened database.
    ///
    /// The returned handle belongs to the registry loop.
    pub async fn with_database(
        config: ServerConfig,
        database: Database,
    ) -> Result<(Self, JoinHandle<()>), ServerError> {
        let db = Db::new(database);
        let presence = PresenceTracker::new(db.clone());
        let stale = presence.reset_all().await?;
        if stale > 0 {
            info!(users = stale, "cleared presence left online by a previous run");
        }
        let resolver = ConversationResolver::new(db.clone());
        let (registry, registry_task) = Registry::spawn(
            presence.clone(),
            resolver.clone(),
            config.session.mailbox_capacity,
        );
        let delivery = MessageDelivery::new(db.clone(), registry.clone(), resolver.clone());
        let attachments = Arc::new(
            AttachmentStore::new(config.upload_dir.clone(), config.max_upload_size).await?,
        );
        let verifier = TokenVerifier::new(&config.jwt_secret);

        let state = Self {
            db,
            registry,
            resolver,
            delivery,
            presence,
            attachments,
            verifier,
            config: Arc::new(config),
        };
        Ok((state, registry_task))
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    let body_limit = state.attachments.max_size() + MULTIPART_OVERHEAD;

    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws::ws_upgrade))
        .route(
            "/api/conversations",
            get(list_conversations).post(create_conversation),
        )
        .route("/api/conversations/{id}", get(get_conversation))
        .route("/api/conversations/{id}/stats", get(conversation_stats))
        .route("/api/conversations/{id}/read", put(mark_conversation_read))
        .route(
            "/api/conversations/{id}/messages",
            get(list_messages).post(send_message),
        )
        .route("/api/messages/search", get(search_messages))
        .route("/api/messages/unread", get(unread_messages))
        .route("/api/messages/stats", get(message_stats))
        .route("/api/messages/{id}", get(get_message).delete(delete_message))
        .route("/api/messages/{id}/read", put(mark_message_read))
        .route(
            "/api/messages/{id}/attachments",
            get(list_attachments).post(upload_attachment),
        )
        .route(
            "/api/attachments/{id}",
            get(attachment_info).delete(delete_attachment),
        )
        .route("/api/attachments/{id}/file", get(download_attachment))
        .route("/api/blocks", get(list_blocks))
        .route("/api/blocks/stats", get(block_stats))
        .route(
            "/api/blocks/{user_id}",
            get(check_block).post(block_user).delete(unblock_user),
        )
        .route("/api/blocks/{user_id}/info", get(block_info))
        .route("/api/presence/{user_id}", get(get_presence))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request / response bodies
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    live_sessions: usize,
}

#[derive(Deserialize)]
struct PageQuery {
    limit: Option<u32>,
    offset: Option<u32>,
}

#[derive(Deserialize)]
struct HistoryQuery {
    before: Option<i64>,
    limit: Option<u32>,
}

#[derive(Deserialize)]
struct SearchQuery {
    #[serde(default)]
    q: String,
    limit: Option<u32>,
}

#[derive(Deserialize)]
struct CreateConversationRequest {
    user_id: UserId,
}

#[derive(Deserialize)]
struct SendMessageRequest {
    text: String,
    #[serde(default)]
    temp_id: Option<String>,
}

#[derive(Serialize)]
struct ConversationView {
    #[serde(flatten)]
    conversation: Conversation,
    other_user_id: UserId,
    unread_count: u64,
}

#[derive(Serialize)]
struct SearchResponse {
    messages: Vec<Message>,
    query: String,
    limit: u32,
}

#[derive(Serialize)]
struct UnreadResponse {
    messages: Vec<Message>,
}

/// An attachment row plus where to download its file.
#[derive(Serialize)]
struct AttachmentInfo {
    attachment: Attachment,
    file_url: String,
}

impl AttachmentInfo {
    fn new(attachment: Attachment) -> Self {
        let file_url = format!("/api/attachments/{}/file", attachment.id);
        Self {
            attachment,
            file_url,
        }
    }
}

#[derive(Serialize)]
struct BlockInfo {
    block: Block,
}

#[derive(Serialize)]
struct BlockStatus {
    /// The caller has blocked this user.
    blocked: bool,
    /// This user has blocked the caller.
    blocked_by: bool,
}

fn page_limit(requested: Option<u32>, default: u32) -> u32 {
    requested.unwrap_or(default).clamp(1, MAX_PAGE)
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        live_sessions: state.registry.live_sessions().await,
    })
}

// ---------------------------------------------------------------------------
// Conversations
// ---------------------------------------------------------------------------

async fn conversation_views(
    state: &AppState,
    user: UserId,
    conversations: Vec<Conversation>,
) -> Result<Vec<ConversationView>, ServerError> {
    state
        .db
        .run(move |db| {
            let mut views = Vec::with_capacity(conversations.len());
            for conversation in conversations {
                let unread_count = db.count_unread(conversation.id, user)?;
                let other_user_id = conversation
                    .other_participant(user)
                    .ok_or(ServerError::NotFound("Conversation"))?;
                views.push(ConversationView {
                    conversation,
                    other_user_id,
                    unread_count,
                });
            }
            Ok(views)
        })
        .await
}

async fn list_conversations(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Vec<ConversationView>>, ServerError> {
    let limit = page_limit(page.limit, DEFAULT_CONVERSATION_PAGE);
    let conversations = state
        .resolver
        .list_for_user(user, limit, page.offset.unwrap_or(0))
        .await?;
    Ok(Json(conversation_views(&state, user, conversations).await?))
}

async fn create_conversation(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Json(req): Json<CreateConversationRequest>,
) -> Result<Json<ConversationView>, ServerError> {
    let conversation = state.resolver.get_or_create(user, req.user_id).await?;
    let mut views = conversation_views(&state, user, vec![conversation]).await?;
    views
        .pop()
        .map(Json)
        .ok_or_else(|| ServerError::Internal("conversation view missing".to_string()))
}

async fn get_conversation(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ConversationView>, ServerError> {
    let conversation = state
        .resolver
        .get_for_participant(ConversationId(id), user)
        .await?;
    let mut views = conversation_views(&state, user, vec![conversation]).await?;
    views
        .pop()
        .map(Json)
        .ok_or_else(|| ServerError::Internal("conversation view missing".to_string()))
}

async fn conversation_stats(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ConversationStats>, ServerError> {
    let conversation = state
        .resolver
        .get_for_participant(ConversationId(id), user)
        .await?;
    let stats = state
        .db
        .run(move |db| Ok(db.conversation_stats(conversation.id, user)?))
        .await?;
    Ok(Json(stats))
}

async fn mark_conversation_read(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let marked = state
        .delivery
        .mark_conversation_read(ConversationId(id), user)
        .await?;
    Ok(Json(serde_json::json!({ "marked": marked })))
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

async fn list_messages(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<Message>>, ServerError> {
    let conversation = state
        .resolver
        .get_for_participant(ConversationId(id), user)
        .await?;
    let limit = page_limit(query.limit, DEFAULT_MESSAGE_PAGE);
    let before = query.before.map(MessageId);

    let messages = state
        .db
        .run(move |db| Ok(db.list_messages(conversation.id, before, limit)?))
        .await?;
    Ok(Json(messages))
}

async fn send_message(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<Message>), ServerError> {
    let conversation = state
        .resolver
        .get_for_participant(ConversationId(id), user)
        .await?;
    let recipient = conversation
        .other_participant(user)
        .ok_or(ServerError::NotFound("Conversation"))?;

    let message = state
        .delivery
        .send_message(user, recipient, req.text, req.temp_id)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

async fn search_messages(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<SearchResponse>, ServerError> {
    let text = query.q.trim().to_string();
    if text.is_empty() {
        return Err(ServerError::BadRequest(
            "Query parameter 'q' is required".to_string(),
        ));
    }
    let limit = page_limit(query.limit, DEFAULT_SEARCH_LIMIT);

    let needle = text.clone();
    let messages = state
        .db
        .run(move |db| Ok(db.search_messages(user, &needle, limit)?))
        .await?;
    Ok(Json(SearchResponse {
        messages,
        query: text,
        limit,
    }))
}

async fn unread_messages(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
) -> Result<Json<UnreadResponse>, ServerError> {
    let messages = state
        .db
        .run(move |db| Ok(db.list_unread_for_user(user)?))
        .await?;
    Ok(Json(UnreadResponse { messages }))
}

async fn message_stats(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
) -> Result<Json<MessageStats>, ServerError> {
    let since = Utc::now() - chrono::Duration::hours(24);
    let stats = state
        .db
        .run(move |db| Ok(db.message_stats(user, since)?))
        .await?;
    Ok(Json(stats))
}

/// Load a message the caller may see: sender or recipient only.
async fn visible_message(
    state: &AppState,
    id: MessageId,
    user: UserId,
) -> Result<Message, ServerError> {
    let message = state
        .db
        .run(move |db| db.get_message(id).or_not_found("Message"))
        .await?;
    if message.from_user_id == user || message.to_user_id == user {
        Ok(message)
    } else {
        Err(ServerError::NotFound("Message"))
    }
}

async fn get_message(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Message>, ServerError> {
    Ok(Json(visible_message(&state, MessageId(id), user).await?))
}

async fn mark_message_read(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let updated = state.delivery.mark_read(MessageId(id), user).await?;
    Ok(Json(serde_json::json!({ "updated": updated })))
}

async fn delete_message(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let message = visible_message(&state, MessageId(id), user).await?;
    if message.from_user_id != user {
        return Err(ServerError::Forbidden(
            "Only the sender can delete a message".to_string(),
        ));
    }

    let message_id = message.id;
    state
        .db
        .run(move |db| Ok(db.delete_message(message_id)?))
        .await?;

    for attachment in &message.attachments {
        if let Err(e) = state.attachments.remove(&attachment.file_path).await {
            warn!(attachment = %attachment.id, error = %e, "failed to remove attachment file");
        }
    }

    info!(message = %message_id, user = %user, "message deleted");
    Ok(Json(serde_json::json!({ "deleted": true })))
}

// ---------------------------------------------------------------------------
// Attachments
// ---------------------------------------------------------------------------

async fn upload_attachment(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<AttachmentInfo>), ServerError> {
    let message = visible_message(&state, MessageId(id), user).await?;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServerError::BadRequest(format!("Multipart error: {}", e)))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let file_name = field.file_name().unwrap_or("").to_string();
        let content_type = field.content_type().map(str::to_string);
        let data = field
            .bytes()
            .await
            .map_err(|e| ServerError::BadRequest(format!("Failed to read field: {}", e)))?;

        let stored = state
            .attachments
            .store(message.id, &file_name, content_type.as_deref(), &data)
            .await?;

        let new = NewAttachment {
            message_id: message.id,
            file_path: stored.relative_path.clone(),
            mime_type: stored.mime_type.clone(),
            size: stored.size,
            uploaded_by: user,
        };
        let inserted = state
            .db
            .run(move |db| Ok(db.insert_attachment(&new, Utc::now())?))
            .await;

        let attachment = match inserted {
            Ok(attachment) => attachment,
            Err(e) => {
                let _ = state.attachments.remove(&stored.relative_path).await;
                return Err(e);
            }
        };

        info!(
            attachment = %attachment.id,
            message = %message.id,
            size = attachment.size,
            "Attachment uploaded"
        );

        return Ok((StatusCode::CREATED, Json(AttachmentInfo::new(attachment))));
    }

    Err(ServerError::BadRequest(
        "Missing 'file' field in multipart form".to_string(),
    ))
}

async fn list_attachments(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Vec<Attachment>>, ServerError> {
    let message = visible_message(&state, MessageId(id), user).await?;
    Ok(Json(message.attachments))
}

/// Load an attachment whose message the caller may see.
async fn visible_attachment(
    state: &AppState,
    id: AttachmentId,
    user: UserId,
) -> Result<Attachment, ServerError> {
    let attachment = state
        .db
        .run(move |db| db.get_attachment(id).or_not_found("Attachment"))
        .await?;
    visible_message(state, attachment.message_id, user)
        .await
        .map_err(|_| ServerError::NotFound("Attachment"))?;
    Ok(attachment)
}

async fn attachment_info(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<AttachmentInfo>, ServerError> {
    let attachment = visible_attachment(&state, AttachmentId(id), user).await?;
    Ok(Json(AttachmentInfo::new(attachment)))
}

async fn download_attachment(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Response, ServerError> {
    let attachment = visible_attachment(&state, AttachmentId(id), user).await?;
    let data = state.attachments.read(&attachment.file_path).await?;
    Ok(([(header::CONTENT_TYPE, attachment.mime_type)], data).into_response())
}

async fn delete_attachment(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let attachment = visible_attachment(&state, AttachmentId(id), user).await?;
    if attachment.uploaded_by != user {
        return Err(ServerError::Forbidden(
            "Only the uploader can delete an attachment".to_string(),
        ));
    }

    let attachment_id = attachment.id;
    state
        .db
        .run(move |db| Ok(db.delete_attachment(attachment_id)?))
        .await?;
    state.attachments.remove(&attachment.file_path).await?;

    Ok(Json(serde_json::json!({ "deleted": true })))
}

// ---------------------------------------------------------------------------
// Blocks
// ---------------------------------------------------------------------------

async fn list_blocks(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
) -> Result<Json<Vec<Block>>, ServerError> {
    let blocks = state.db.run(move |db| Ok(db.list_blocks_by(user)?)).await?;
    Ok(Json(blocks))
}

async fn check_block(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(other): Path<i64>,
) -> Result<Json<BlockStatus>, ServerError> {
    let other = UserId(other);
    let status = state
        .db
        .run(move |db| {
            Ok(BlockStatus {
                blocked: db.is_blocked(user, other)?,
                blocked_by: db.is_blocked(other, user)?,
            })
        })
        .await?;
    Ok(Json(status))
}

async fn block_info(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(other): Path<i64>,
) -> Result<Json<BlockInfo>, ServerError> {
    let other = UserId(other);
    let block = state
        .db
        .run(move |db| db.get_block(user, other)?.ok_or(ServerError::NotFound("Block")))
        .await?;
    Ok(Json(BlockInfo { block }))
}

async fn block_stats(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
) -> Result<Json<BlockStats>, ServerError> {
    let stats = state
        .db
        .run(move |db| Ok(db.block_stats(user, RECENT_BLOCKS)?))
        .await?;
    Ok(Json(stats))
}

async fn block_user(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(other): Path<i64>,
) -> Result<(StatusCode, Json<Block>), ServerError> {
    let other = UserId(other);
    if other == user {
        return Err(ServerError::BadRequest("Cannot block yourself".to_string()));
    }

    let block = state
        .db
        .run(move |db| {
            db.insert_block(user, other, Utc::now())?
                .ok_or_else(|| ServerError::Conflict("User is already blocked".to_string()))
        })
        .await?;

    info!(blocker = %user, blocked = %other, "user blocked");
    Ok((StatusCode::CREATED, Json(block)))
}

async fn unblock_user(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(other): Path<i64>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let other = UserId(other);
    let removed = state
        .db
        .run(move |db| Ok(db.delete_block(user, other)?))
        .await?;
    if !removed {
        return Err(ServerError::NotFound("Block"));
    }

    info!(blocker = %user, unblocked = %other, "user unblocked");
    Ok(Json(serde_json::json!({ "unblocked": true })))
}

// ---------------------------------------------------------------------------
// Presence
// ---------------------------------------------------------------------------

async fn get_presence(
    AuthUser(_user): AuthUser,
    State(state): State<AppState>,
    Path(other): Path<i64>,
) -> Result<Json<Presence>, ServerError> {
    Ok(Json(state.presence.get(UserId(other)).await?))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

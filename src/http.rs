use std::{sync::Arc, time::Duration};

use argon2::password_hash;
use async_trait::async_trait;
use axum::{
    extract::{
        multipart::{Field, MultipartError},
        ws::{Message, WebSocket, WebSocketUpgrade},
        DefaultBodyLimit, FromRequestParts, Multipart, Path, Query, State,
    },
    http::{
        header::{InvalidHeaderValue, AUTHORIZATION, CONTENT_TYPE},
        request, HeaderValue, Method, StatusCode,
    },
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, RequestPartsExt as _, Router,
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use derive_more::From;
use futures::{SinkExt as _, StreamExt as _};
use jsonwebtoken::{
    decode, encode, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;
use tokio::sync::watch;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::{
    access::{self, Caller},
    api,
    cleanup::{self, Cleaner, Scheduler},
    db::{self, user::Role, SharedStore},
    media,
    notify::Hub,
    service::{self, Edit, Filter, Photo, Service},
    stats, Config,
};

const MIN_PASSWORD_LEN: usize = 6;

const DEFAULT_PAGE_SIZE: usize = 20;

const MAX_PAGE_SIZE: usize = 100;

pub type SharedAppState = Arc<AppState>;

pub struct AppState {
    pub store: SharedStore,

    pub media: Arc<dyn media::Storage>,

    pub hub: Arc<Hub>,

    pub service: Service,

    pub scheduler: Arc<Scheduler>,

    jwt_expiration_time: Duration,

    jwt_decoding_key: DecodingKey,

    jwt_encoding_key: EncodingKey,
}

impl AppState {
    /// Wires the ticket service and the cleanup scheduler over one store,
    /// media directory and notification hub.
    pub fn new(
        store: SharedStore,
        media: Arc<dyn media::Storage>,
        config: &Config,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let hub = Arc::new(Hub::new(&config.notify));
        let service = Service::new(
            Arc::clone(&store),
            Arc::clone(&media),
            Arc::clone(&hub),
        );
        let cleaner = Cleaner::new(
            Arc::clone(&store),
            Arc::clone(&media),
            Arc::clone(service.locks()),
            config.media.orphan_min_age,
        );
        let scheduler = Arc::new(Scheduler::new(
            Arc::new(cleaner),
            config.cleanup.clone(),
            shutdown,
        ));

        Self {
            store,
            media,
            hub,
            service,
            scheduler,
            jwt_expiration_time: config.jwt.expiration_time,
            jwt_decoding_key: DecodingKey::from_secret(
                config.jwt.secret.as_bytes(),
            ),
            jwt_encoding_key: EncodingKey::from_secret(
                config.jwt.secret.as_bytes(),
            ),
        }
    }

    fn issue_token(&self, user_id: api::user::Id) -> Result<String, AuthError> {
        let expires_at = OffsetDateTime::now_utc() + self.jwt_expiration_time;
        encode(
            &Header::default(),
            &AuthClaims {
                user_id,
                exp: expires_at.unix_timestamp(),
            },
            &self.jwt_encoding_key,
        )
        .map_err(|_| AuthError::InvalidToken)
    }

    fn decode_token(&self, token: &str) -> Result<AuthClaims, AuthError> {
        decode::<AuthClaims>(
            token,
            &self.jwt_decoding_key,
            &Validation::default(),
        )
        .map(|data| data.claims)
        .map_err(|_| AuthError::InvalidToken)
    }

    /// The token's user, provided it still exists and is active.
    async fn resolve(&self, claims: AuthClaims) -> Result<db::User, AuthError> {
        let user = self
            .store
            .get_user_by_id(claims.user_id)
            .await?
            .ok_or(AuthError::InvalidToken)?;
        if !user.is_active {
            return Err(AuthError::Inactive);
        }
        Ok(user)
    }
}

pub fn router(
    state: SharedAppState,
    config: &Config,
) -> Result<Router, InvalidHeaderValue> {
    let origins = config
        .http
        .cors
        .allowed_origins
        .iter()
        .map(|origin| origin.parse::<HeaderValue>())
        .collect::<Result<Vec<_>, _>>()?;
    let cors = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
        ])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE])
        .allow_origin(AllowOrigin::list(origins));

    // Two photos plus the text fields of one edit.
    let body_limit = config
        .media
        .max_file_size
        .saturating_mul(2)
        .saturating_add(64 * 1024);

    Ok(Router::new()
        .route("/auth", post(auth))
        .route("/auth/register", post(register))
        .route("/user", get(get_user))
        .route("/user/password", post(change_password))
        .route("/user/permissions", get(get_permissions))
        .route("/user/stats", get(get_user_stats))
        .route("/users", get(list_users).post(add_user))
        .route("/users/:id/toggle", patch(toggle_user))
        .route("/ticket", get(list_tickets).post(add_ticket))
        .route(
            "/ticket/:id",
            get(get_ticket).patch(edit_ticket).delete(delete_ticket),
        )
        .route("/executors", get(list_executors))
        .route("/dashboard", get(get_dashboard))
        .route("/report/digest", get(get_digest))
        .route("/report/ticket/:id", get(get_ticket_report))
        .route("/admin/stats", get(get_analytics))
        .route("/admin/cleanup", post(run_cleanup))
        .route("/admin/scheduler", get(get_scheduler_status))
        .route("/admin/disk-usage", get(get_disk_usage))
        .route("/media/:name", get(get_media))
        .route("/health", get(get_health))
        .route("/ws", get(notifications))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .with_state(state))
}

async fn auth(
    State(state): State<SharedAppState>,
    Json(api::user::Credentials { email, password }): Json<
        api::user::Credentials,
    >,
) -> Result<String, AuthError> {
    use AuthError as E;

    let user = state
        .store
        .get_user_by_email(&db::user::normalize_email(&email))
        .await?
        .filter(|u| u.password_hash.verify(&password))
        .ok_or(E::WrongEmailOrPassword)?;
    if !user.is_active {
        return Err(E::Inactive);
    }

    tracing::info!(user_id = %user.id, "user signed in");
    state.issue_token(user.id)
}

#[derive(Debug, From)]
pub enum AuthError {
    #[from]
    DbError(db::Error),
    InvalidToken,
    WrongEmailOrPassword,
    Inactive,
    NotAdmin,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        match self {
            Self::DbError(e) => {
                tracing::error!("authentication failed: {e}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::InvalidToken | Self::WrongEmailOrPassword => {
                StatusCode::UNAUTHORIZED
            }
            Self::Inactive | Self::NotAdmin => StatusCode::FORBIDDEN,
        }
        .into_response()
    }
}

async fn register(
    State(state): State<SharedAppState>,
    Json(api::user::Registration {
        email,
        name,
        password,
    }): Json<api::user::Registration>,
) -> Result<Json<api::user::Profile>, CreateUserError> {
    let user =
        create_user(&state, &email, &name, &password, Role::Customer).await?;
    Ok(Json(api::user::Profile::from(&user)))
}

async fn add_user(
    State(state): State<SharedAppState>,
    _: Admin,
    Json(api::user::New {
        email,
        name,
        password,
        role,
    }): Json<api::user::New>,
) -> Result<Json<api::user::Profile>, CreateUserError> {
    let user = create_user(&state, &email, &name, &password, role).await?;
    Ok(Json(api::user::Profile::from(&user)))
}

async fn create_user(
    state: &AppState,
    email: &str,
    name: &str,
    password: &str,
    role: Role,
) -> Result<db::User, CreateUserError> {
    use CreateUserError as E;

    if !email.contains('@') {
        return Err(E::Invalid("invalid email"));
    }
    if name.trim().is_empty() {
        return Err(E::Invalid("name required"));
    }
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(E::Invalid("password too short"));
    }

    let user = db::User::new(email, name, password, role)?;
    if state.store.get_user_by_email(&user.email).await?.is_some() {
        return Err(E::EmailTaken);
    }
    state.store.write_user(&user).await?;

    tracing::info!(user_id = %user.id, role = %user.role, "user created");
    Ok(user)
}

#[derive(Debug, From)]
pub enum CreateUserError {
    #[from]
    DbError(db::Error),
    #[from]
    HashError(password_hash::Error),
    EmailTaken,
    Invalid(&'static str),
}

impl IntoResponse for CreateUserError {
    fn into_response(self) -> Response {
        match self {
            Self::EmailTaken => {
                (StatusCode::CONFLICT, "email already registered")
                    .into_response()
            }
            Self::Invalid(reason) => {
                (StatusCode::BAD_REQUEST, reason).into_response()
            }
            Self::DbError(_) | Self::HashError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

async fn get_user(Me(me): Me) -> Json<api::user::Profile> {
    Json(api::user::Profile::from(&me))
}

async fn get_permissions(Me(me): Me) -> Json<access::Permissions> {
    Json(access::permissions(me.role))
}

async fn get_user_stats(
    State(state): State<SharedAppState>,
    Me(me): Me,
) -> Result<Json<stats::UserSummary>, service::Error> {
    Ok(Json(state.service.user_summary(&me).await?))
}

async fn change_password(
    State(state): State<SharedAppState>,
    Me(mut me): Me,
    Json(api::user::PasswordChange {
        current_password,
        new_password,
    }): Json<api::user::PasswordChange>,
) -> Result<StatusCode, ChangePasswordError> {
    use ChangePasswordError as E;

    if !me.password_hash.verify(&current_password) {
        return Err(E::WrongPassword);
    }
    if new_password.chars().count() < MIN_PASSWORD_LEN {
        return Err(E::PasswordTooShort);
    }

    me.password_hash = db::user::PasswordHash::new(&new_password)?;
    state.store.write_user(&me).await?;

    tracing::info!(user_id = %me.id, "password changed");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, From)]
pub enum ChangePasswordError {
    #[from]
    DbError(db::Error),
    #[from]
    HashError(password_hash::Error),
    WrongPassword,
    PasswordTooShort,
}

impl IntoResponse for ChangePasswordError {
    fn into_response(self) -> Response {
        match self {
            Self::WrongPassword | Self::PasswordTooShort => {
                StatusCode::BAD_REQUEST
            }
            Self::DbError(_) | Self::HashError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
        .into_response()
    }
}

#[derive(Deserialize)]
struct ListUsersInput {
    role: Option<Role>,
}

async fn list_users(
    State(state): State<SharedAppState>,
    _: Admin,
    Query(ListUsersInput { role }): Query<ListUsersInput>,
) -> Result<Json<Vec<api::user::Profile>>, ListUsersError> {
    let users = state.store.list_users(role).await?;
    Ok(Json(users.iter().map(api::user::Profile::from).collect()))
}

#[derive(Debug, From)]
pub enum ListUsersError {
    #[from]
    DbError(db::Error),
}

impl IntoResponse for ListUsersError {
    fn into_response(self) -> Response {
        match self {
            Self::DbError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
        .into_response()
    }
}

async fn toggle_user(
    State(state): State<SharedAppState>,
    Admin(admin): Admin,
    Path(id): Path<api::user::Id>,
) -> Result<Json<api::user::Profile>, ToggleUserError> {
    use ToggleUserError as E;

    if id == admin.id {
        return Err(E::OwnAccount);
    }
    let mut user = state
        .store
        .get_user_by_id(id)
        .await?
        .ok_or(E::UserNotFound)?;
    user.is_active = !user.is_active;
    state.store.write_user(&user).await?;

    if !user.is_active {
        state.hub.unregister(user.id).await;
    }
    tracing::info!(
        user_id = %user.id,
        admin_id = %admin.id,
        is_active = user.is_active,
        "user activation toggled",
    );
    Ok(Json(api::user::Profile::from(&user)))
}

#[derive(Debug, From)]
pub enum ToggleUserError {
    #[from]
    DbError(db::Error),
    OwnAccount,
    UserNotFound,
}

impl IntoResponse for ToggleUserError {
    fn into_response(self) -> Response {
        match self {
            Self::OwnAccount => StatusCode::BAD_REQUEST,
            Self::UserNotFound => StatusCode::NOT_FOUND,
            Self::DbError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
        .into_response()
    }
}

#[derive(Deserialize)]
struct ListTicketsInput {
    status: Option<api::ticket::Status>,
    executor_id: Option<api::user::Id>,
    #[serde(default)]
    offset: usize,
    limit: Option<usize>,
}

async fn list_tickets(
    State(state): State<SharedAppState>,
    me: Me,
    Query(ListTicketsInput {
        status,
        executor_id,
        offset,
        limit,
    }): Query<ListTicketsInput>,
) -> Result<Json<api::ticket::List>, service::Error> {
    let filter = Filter {
        status,
        executor: executor_id,
    };
    let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).min(MAX_PAGE_SIZE);
    Ok(Json(
        state
            .service
            .list(&me.caller(), filter, offset, limit)
            .await?,
    ))
}

async fn add_ticket(
    State(state): State<SharedAppState>,
    me: Me,
    Json(new): Json<api::ticket::New>,
) -> Result<Json<api::Ticket>, service::Error> {
    Ok(Json(state.service.create(&me.caller(), new).await?))
}

async fn get_ticket(
    State(state): State<SharedAppState>,
    me: Me,
    Path(id): Path<api::ticket::Id>,
) -> Result<Json<api::Ticket>, service::Error> {
    Ok(Json(state.service.get(&me.caller(), id).await?))
}

/// Accepts `multipart/form-data` so photos travel with the status change
/// they document. Empty text fields and empty file parts are ignored.
async fn edit_ticket(
    State(state): State<SharedAppState>,
    me: Me,
    Path(id): Path<api::ticket::Id>,
    multipart: Multipart,
) -> Result<Json<api::Ticket>, service::Error> {
    let edit = read_edit(multipart).await?;
    Ok(Json(state.service.update(&me.caller(), id, edit).await?))
}

async fn read_edit(mut multipart: Multipart) -> Result<Edit, service::Error> {
    let mut edit = Edit::default();
    while let Some(field) = multipart.next_field().await.map_err(malformed)? {
        let name = field.name().unwrap_or_default().to_owned();
        match name.as_str() {
            "status" => {
                edit.status = read_text(field)
                    .await?
                    .map(|text| parse_field(&name, text))
                    .transpose()?;
            }
            "executor_id" => {
                edit.executor = read_text(field)
                    .await?
                    .map(|text| parse_field(&name, text))
                    .transpose()?;
            }
            "completion_comment" => {
                edit.completion_comment = read_text(field).await?;
            }
            "rejection_reason" => {
                edit.rejection_reason = read_text(field).await?;
            }
            "before_photo" => edit.before_photo = read_photo(field).await?,
            "after_photo" => edit.after_photo = read_photo(field).await?,
            _ => {
                return Err(service::Error::Validation(format!(
                    "unknown field `{name}`"
                )))
            }
        }
    }
    Ok(edit)
}

fn malformed(e: MultipartError) -> service::Error {
    service::Error::Validation(e.body_text())
}

async fn read_text(field: Field<'_>) -> Result<Option<String>, service::Error> {
    let text = field.text().await.map_err(malformed)?;
    Ok(Some(text).filter(|t| !t.trim().is_empty()))
}

/// Parses a form value the way the JSON API would.
fn parse_field<T: DeserializeOwned>(
    name: &str,
    text: String,
) -> Result<T, service::Error> {
    serde_json::from_value(serde_json::Value::String(text)).map_err(|_| {
        service::Error::Validation(format!("invalid value for `{name}`"))
    })
}

async fn read_photo(field: Field<'_>) -> Result<Option<Photo>, service::Error> {
    let file_name = field.file_name().map(String::from);
    let bytes = field.bytes().await.map_err(malformed)?;
    if bytes.is_empty() {
        return Ok(None);
    }

    let extension = file_name
        .as_deref()
        .and_then(media::extension_of)
        .ok_or_else(|| {
            service::Error::Validation(
                "photo must have a file name with an extension".into(),
            )
        })?;
    Ok(Some(Photo {
        bytes: bytes.to_vec(),
        extension,
    }))
}

async fn delete_ticket(
    State(state): State<SharedAppState>,
    me: Me,
    Path(id): Path<api::ticket::Id>,
) -> Result<StatusCode, service::Error> {
    state.service.delete(&me.caller(), id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_executors(
    State(state): State<SharedAppState>,
    _: Me,
) -> Result<Json<Vec<api::User>>, service::Error> {
    Ok(Json(state.service.executors().await?))
}

async fn get_dashboard(
    State(state): State<SharedAppState>,
    me: Me,
) -> Result<Json<api::ticket::Dashboard>, service::Error> {
    Ok(Json(state.service.dashboard(&me.caller()).await?))
}

#[derive(Deserialize)]
struct DigestInput {
    range: Option<stats::DigestRange>,
}

async fn get_digest(
    State(state): State<SharedAppState>,
    _: Admin,
    Query(DigestInput { range }): Query<DigestInput>,
) -> Result<Json<stats::Digest>, service::Error> {
    let range = range.unwrap_or(stats::DigestRange::Daily);
    Ok(Json(state.service.digest(range).await?))
}

async fn get_ticket_report(
    State(state): State<SharedAppState>,
    me: Me,
    Path(id): Path<api::ticket::Id>,
) -> Result<Json<api::ticket::Report>, service::Error> {
    Ok(Json(state.service.report(&me.caller(), id).await?))
}

async fn get_analytics(
    State(state): State<SharedAppState>,
    _: Admin,
) -> Result<Json<stats::Analytics>, service::Error> {
    Ok(Json(state.service.analytics().await?))
}

#[derive(Deserialize)]
struct CleanupInput {
    retention_days: Option<u64>,
}

async fn run_cleanup(
    State(state): State<SharedAppState>,
    Admin(admin): Admin,
    Query(CleanupInput { retention_days }): Query<CleanupInput>,
) -> Json<cleanup::Report> {
    // Retention too long to represent keeps everything.
    let retention = match retention_days {
        Some(days) => days
            .checked_mul(24 * 60 * 60)
            .map_or(Duration::MAX, Duration::from_secs),
        None => state.scheduler.retention(),
    };

    tracing::info!(
        admin_id = %admin.id,
        retention_secs = retention.as_secs(),
        "manual cleanup requested",
    );
    Json(state.scheduler.run_cleanup(retention).await)
}

async fn get_scheduler_status(
    State(state): State<SharedAppState>,
    _: Admin,
) -> Json<cleanup::SchedulerStatus> {
    Json(state.scheduler.status().await)
}

async fn get_disk_usage(
    State(state): State<SharedAppState>,
    _: Admin,
) -> Result<Json<cleanup::StorageAnalysis>, GetDiskUsageError> {
    let retention = state.scheduler.retention();
    Ok(Json(state.scheduler.cleaner().analyze(retention).await?))
}

#[derive(Debug, From)]
pub enum GetDiskUsageError {
    #[from]
    CleanupError(cleanup::Error),
}

impl IntoResponse for GetDiskUsageError {
    fn into_response(self) -> Response {
        match self {
            Self::CleanupError(e) => {
                tracing::error!("disk usage unavailable: {e}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
        .into_response()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "lowercase")]
enum Health {
    Healthy,
    Degraded,
}

#[derive(Serialize)]
struct Services {
    store: &'static str,
    scheduler: &'static str,
    media: &'static str,
}

#[derive(Serialize)]
struct HealthReport {
    status: Health,
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
    services: Services,
    scheduler: cleanup::SchedulerStatus,
}

/// Unauthenticated liveness report. Always answers 200; a failing
/// dependency shows up as `degraded`.
async fn get_health(State(state): State<SharedAppState>) -> Json<HealthReport> {
    let store = match state.store.count_tickets_by_status().await {
        Ok(_) => true,
        Err(e) => {
            tracing::warn!("health check: store unavailable: {e}");
            false
        }
    };
    let media = state.media.is_available().await;
    let scheduler = state.scheduler.status().await;

    let status = if store && media && scheduler.running {
        Health::Healthy
    } else {
        Health::Degraded
    };
    Json(HealthReport {
        status,
        timestamp: OffsetDateTime::now_utc(),
        services: Services {
            store: if store { "connected" } else { "unavailable" },
            scheduler: if scheduler.running { "running" } else { "stopped" },
            media: if media { "available" } else { "missing" },
        },
        scheduler,
    })
}

async fn get_media(
    State(state): State<SharedAppState>,
    Path(name): Path<String>,
) -> Result<Response, GetMediaError> {
    let bytes = state.media.read(&name).await?;
    Ok(([(CONTENT_TYPE, media::content_type(&name))], bytes).into_response())
}

#[derive(Debug, From)]
pub enum GetMediaError {
    #[from]
    MediaError(media::Error),
}

impl IntoResponse for GetMediaError {
    fn into_response(self) -> Response {
        match self {
            Self::MediaError(media::Error::Io(e))
                if e.kind() == std::io::ErrorKind::NotFound =>
            {
                StatusCode::NOT_FOUND
            }
            Self::MediaError(e) if e.is_rejection() => StatusCode::BAD_REQUEST,
            Self::MediaError(e) => {
                tracing::error!("failed to read media: {e}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
        .into_response()
    }
}

impl IntoResponse for service::Error {
    fn into_response(self) -> Response {
        let (status, kind) = match &self {
            Self::NotFound => (StatusCode::NOT_FOUND, "not_found"),
            Self::Forbidden(_) => (StatusCode::FORBIDDEN, "forbidden"),
            Self::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
            Self::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            Self::Storage(_) | Self::Media(_) | Self::UserNotFound(_) => {
                tracing::error!("request failed: {self}");
                let body = json!({
                    "error": "internal",
                    "message": "internal error",
                });
                return (StatusCode::INTERNAL_SERVER_ERROR, Json(body))
                    .into_response();
            }
        };
        let body = json!({ "error": kind, "message": self.to_string() });
        (status, Json(body)).into_response()
    }
}

#[derive(Deserialize)]
struct NotificationsInput {
    token: String,
}

/// Browsers cannot set headers on WebSocket requests, so the token comes in
/// the query string.
async fn notifications(
    State(state): State<SharedAppState>,
    Query(NotificationsInput { token }): Query<NotificationsInput>,
    ws: WebSocketUpgrade,
) -> Result<Response, AuthError> {
    let claims = state.decode_token(&token)?;
    let user = state.resolve(claims).await?;
    Ok(ws.on_upgrade(move |socket| stream_events(socket, state, user)))
}

async fn stream_events(
    socket: WebSocket,
    state: SharedAppState,
    user: db::User,
) {
    let (tx, mut rx) = state.hub.channel();
    let connection = state.hub.register(user.id, user.role, tx).await;
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else {
                    // Replaced by a newer connection or dropped by the hub.
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                };
                let json = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::error!(
                            user_id = %user.id,
                            "failed to serialize notification: {e}",
                        );
                        continue;
                    }
                };
                if sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            message = receiver.next() => match message {
                Some(Ok(Message::Text(text))) if text.trim() == "ping" => {
                    if sender.send(Message::Text("pong".into())).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    state.hub.release(user.id, connection).await;
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct AuthClaims {
    user_id: api::user::Id,
    exp: i64,
}

#[async_trait]
impl FromRequestParts<SharedAppState> for AuthClaims {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut request::Parts,
        state: &SharedAppState,
    ) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) = parts
            .extract::<TypedHeader<Authorization<Bearer>>>()
            .await
            .map_err(|_| AuthError::InvalidToken)?;
        state.decode_token(bearer.token())
    }
}

/// The authenticated, active user making the request.
pub struct Me(db::User);

impl Me {
    fn caller(&self) -> Caller {
        Caller {
            id: self.0.id,
            role: self.0.role,
        }
    }
}

#[async_trait]
impl FromRequestParts<SharedAppState> for Me {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut request::Parts,
        state: &SharedAppState,
    ) -> Result<Self, Self::Rejection> {
        let claims = AuthClaims::from_request_parts(parts, state).await?;
        state.resolve(claims).await.map(Self)
    }
}

/// An authenticated user whose role may manage users, analytics and cleanup.
pub struct Admin(db::User);

#[async_trait]
impl FromRequestParts<SharedAppState> for Admin {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut request::Parts,
        state: &SharedAppState,
    ) -> Result<Self, Self::Rejection> {
        let Me(user) = Me::from_request_parts(parts, state).await?;
        if !user.role.policy().can_manage() {
            return Err(AuthError::NotAdmin);
        }
        Ok(Self(user))
    }
}

use std::io;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, FromRequestParts, Multipart, Path, State},
    http::{header, request::Parts, Method},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::{StreamReader, SyncIoBridge};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use satchel_shared::{GrantKind, HandleCodec, MessageId, UserId};
use satchel_store::{
    BlobFiles, Database, NewMessage, PendingUpload, Revocation, StoreError, VisibleAttachment,
};

use crate::config::ServerConfig;
use crate::error::ServerError;

/// Header carrying the authenticated account id, set by the front proxy.
pub const USER_HEADER: &str = "x-user-id";

/// Room for multipart framing on top of the file itself.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

const DEFAULT_INBOX: &str = "INBOX";

/// Upload chunks buffered between the request body and the spool file.
const UPLOAD_CHANNEL_DEPTH: usize = 8;

#[derive(Clone)]
pub struct AppState {
    pub files: BlobFiles,
    pub codec: HandleCodec,
    pub config: std::sync::Arc<ServerConfig>,
}

impl AppState {
    /// Prepare the storage root and bring the schema up to date.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let files = BlobFiles::new(config.storage_root.clone(), config.max_upload_size)?;
        Database::open_at(&config.database_path)?;
        Ok(Self {
            files,
            codec: HandleCodec::from_secret(&config.handle_secret),
            config: std::sync::Arc::new(config),
        })
    }

    /// Run `f` on a blocking worker with its own connection.
    async fn blocking<T, F>(&self, f: F) -> Result<T, ServerError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Database, &BlobFiles) -> Result<T, ServerError> + Send + 'static,
    {
        let path = self.config.database_path.clone();
        let files = self.files.clone();
        tokio::task::spawn_blocking(move || {
            let mut db = Database::open_at(&path)?;
            f(&mut db, &files)
        })
        .await
        .map_err(|e| ServerError::Internal(format!("worker task failed: {e}")))?
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    let body_limit = usize::try_from(state.config.max_upload_size)
        .unwrap_or(usize::MAX)
        .saturating_add(MULTIPART_OVERHEAD);

    Router::new()
        .route("/health", get(health_check))
        .route("/attachments", post(upload_attachment))
        .route("/attachments/pending", get(list_pending))
        .route("/attachments/pending/{grant_id}", delete(discard_pending))
        .route("/attachments/{handle}", get(download_attachment))
        .route("/messages", post(create_message))
        .route(
            "/messages/{id}/attachments",
            get(list_message_attachments).post(attach_to_message),
        )
        .route("/messages/{id}/deliver", post(deliver_message))
        .route("/messages/{id}/purge", post(purge_message))
        .route("/messages/{id}", delete(trash_message))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// The caller's account, taken from [`USER_HEADER`].
pub struct CurrentUser(pub UserId);

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<UserId>().ok())
            .filter(|user| user.0 > 0)
            .map(CurrentUser)
            .ok_or(ServerError::Unauthorized)
    }
}

// ─── Request / response bodies ───

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct AttachmentView {
    grant_id: i64,
    /// Opaque download token for `GET /attachments/{handle}`.
    handle: String,
    filename: String,
    kind: GrantKind,
    position: i64,
    size: i64,
    mime_type: String,
    extension: Option<String>,
}

impl AttachmentView {
    fn build(codec: &HandleCodec, a: VisibleAttachment) -> Result<Self, ServerError> {
        let handle = codec
            .encode(a.blob_id)
            .map_err(|e| ServerError::Internal(e.to_string()))?;
        Ok(Self {
            grant_id: a.grant_id,
            handle,
            filename: a.display_filename,
            kind: a.kind,
            position: a.position,
            size: a.size,
            mime_type: a.mime_type,
            extension: a.extension,
        })
    }
}

#[derive(Deserialize)]
struct CreateMessageRequest {
    folder: String,
    remote_uid: Option<u32>,
    #[serde(default)]
    subject: String,
}

#[derive(Serialize)]
struct MessageCreated {
    id: MessageId,
}

#[derive(Deserialize)]
struct AttachRequest {
    grant_ids: Vec<i64>,
}

#[derive(Serialize)]
struct AttachResponse {
    promoted: Vec<i64>,
    /// Ids that were not live pending uploads of the caller.
    rejected: Vec<i64>,
}

#[derive(Deserialize)]
struct DeliverRequest {
    recipient: UserId,
    folder: Option<String>,
    remote_uid: Option<u32>,
}

#[derive(Serialize)]
struct DeliverResponse {
    message_id: MessageId,
    attachments: usize,
}

#[derive(Serialize)]
struct TrashResponse {
    revoked: usize,
    queued_blobs: usize,
}

#[derive(Serialize)]
struct DiscardResponse {
    queued_blob: bool,
}

#[derive(Serialize)]
struct PurgeResponse {
    queued: bool,
}

// ─── Handlers ───

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Keep only the final path component of a client-supplied file name.
fn display_name(raw: Option<&str>) -> String {
    let name = raw
        .and_then(|n| n.rsplit(['/', '\\']).next())
        .map(str::trim)
        .unwrap_or_default();
    if name.is_empty() {
        return "attachment".to_string();
    }
    name.chars().take(255).collect()
}

async fn upload_attachment(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    mut multipart: Multipart,
) -> Result<Json<AttachmentView>, ServerError> {
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| ServerError::BadRequest(format!("Multipart error: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = display_name(field.file_name());
        let mime = field.content_type().unwrap_or_default().to_string();

        // Chunks flow to the blocking ingest as they arrive; the spool
        // enforces the size limit.
        let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(UPLOAD_CHANNEL_DEPTH);
        let reader = SyncIoBridge::new(StreamReader::new(ReceiverStream::new(rx)));
        let pump = async move {
            loop {
                match field.chunk().await {
                    Ok(Some(chunk)) => {
                        // A closed channel means ingest already gave up.
                        if tx.send(Ok(chunk)).await.is_err() {
                            return Ok(());
                        }
                    }
                    Ok(None) => return Ok(()),
                    Err(e) => {
                        let _ = tx.send(Err(io::Error::other(e.to_string()))).await;
                        return Err(ServerError::BadRequest(format!("Failed to read field: {e}")));
                    }
                }
            }
        };
        let store = state.blocking(move |db, files| {
            Ok(db.ingest_pending(files, reader, user, &filename, &mime)?)
        });

        let (pumped, stored) = tokio::join!(pump, store);
        pumped?;
        let PendingUpload { grant_id, ingested } = stored.map_err(ServerError::during_upload)?;

        info!(
            user_id = %user,
            grant_id,
            blob_id = %ingested.blob_id,
            size = ingested.size,
            was_new = ingested.was_new,
            "attachment uploaded"
        );

        let attachment = state
            .blocking(move |db, _| {
                db.list_visible(user, None)?
                    .into_iter()
                    .find(|a| a.grant_id == grant_id)
                    .ok_or(ServerError::NotFound)
            })
            .await?;
        return Ok(Json(AttachmentView::build(&state.codec, attachment)?));
    }

    Err(ServerError::BadRequest(
        "Missing 'file' field in multipart form".to_string(),
    ))
}

async fn list_pending(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> Result<Json<Vec<AttachmentView>>, ServerError> {
    let attachments = state.blocking(move |db, _| Ok(db.list_visible(user, None)?)).await?;
    let views = attachments
        .into_iter()
        .map(|a| AttachmentView::build(&state.codec, a))
        .collect::<Result<_, _>>()?;
    Ok(Json(views))
}

/// Remove an upload from the compose form before sending.
async fn discard_pending(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(grant_id): Path<i64>,
) -> Result<Json<DiscardResponse>, ServerError> {
    let revocation = state
        .blocking(move |db, _| Ok(db.revoke_pending(user, grant_id)?))
        .await?;

    match revocation {
        Revocation::Revoked { enqueued, .. } => Ok(Json(DiscardResponse { queued_blob: enqueued })),
        Revocation::NoMatch => Err(ServerError::NotFound),
    }
}

async fn download_attachment(
    State(state): State<AppState>,
    Path(handle): Path<String>,
) -> Result<Response, ServerError> {
    let blob_id = state.codec.decode(&handle).map_err(|e| {
        debug!(error = %e, "rejected download handle");
        ServerError::NotFound
    })?;

    let (mime_type, bytes) = state
        .blocking(move |db, files| {
            let blob = db.get_blob(blob_id)?;
            if blob.reference_count == 0 {
                return Err(ServerError::NotFound);
            }
            let mut file = files.open(&blob.storage_location)?;
            let mut bytes = Vec::with_capacity(usize::try_from(blob.size).unwrap_or(0));
            std::io::Read::read_to_end(&mut file, &mut bytes).map_err(StoreError::from)?;
            db.touch(blob_id)?;
            Ok((blob.mime_type, bytes))
        })
        .await?;

    debug!(blob_id = %blob_id, size = bytes.len(), "attachment downloaded");
    Ok((
        [
            (header::CONTENT_TYPE, mime_type),
            (header::CONTENT_DISPOSITION, "attachment".to_string()),
        ],
        bytes,
    )
        .into_response())
}

async fn create_message(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<CreateMessageRequest>,
) -> Result<Json<MessageCreated>, ServerError> {
    if req.folder.trim().is_empty() {
        return Err(ServerError::BadRequest("Folder must not be empty".to_string()));
    }
    let message = NewMessage {
        user_id: user,
        folder: req.folder,
        remote_uid: req.remote_uid,
        subject: req.subject,
    };
    let id = state.blocking(move |db, _| Ok(db.insert_message(&message)?)).await?;
    Ok(Json(MessageCreated { id }))
}

/// Attach pending uploads to a message the caller is sending.
async fn attach_to_message(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
    Json(req): Json<AttachRequest>,
) -> Result<Json<AttachResponse>, ServerError> {
    let message = MessageId(id);
    let response = state
        .blocking(move |db, _| {
            owned_message(db, user, message)?;
            let mut response = AttachResponse {
                promoted: Vec::new(),
                rejected: Vec::new(),
            };
            for grant_id in req.grant_ids {
                if db.promote_grant(grant_id, user, message, GrantKind::Sender)? {
                    response.promoted.push(grant_id);
                } else {
                    response.rejected.push(grant_id);
                }
            }
            Ok(response)
        })
        .await?;

    info!(
        user_id = %user,
        message_id = %message,
        promoted = response.promoted.len(),
        rejected = response.rejected.len(),
        "attachments promoted"
    );
    Ok(Json(response))
}

/// Record a local recipient's copy of a sent message, sharing its attachments.
async fn deliver_message(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
    Json(req): Json<DeliverRequest>,
) -> Result<Json<DeliverResponse>, ServerError> {
    if req.recipient.0 <= 0 {
        return Err(ServerError::BadRequest("Invalid recipient".to_string()));
    }
    let sent = MessageId(id);
    let recipient = req.recipient;
    let delivery = state
        .blocking(move |db, _| {
            let original = owned_message(db, user, sent)?;
            let copy = NewMessage {
                user_id: recipient,
                folder: req.folder.unwrap_or_else(|| DEFAULT_INBOX.to_string()),
                remote_uid: req.remote_uid,
                subject: original.subject,
            };
            Ok(db.deliver_copy(user, sent, &copy)?)
        })
        .await?;
    let response = DeliverResponse {
        message_id: delivery.message_id,
        attachments: delivery.attachments,
    };

    info!(
        message_id = %sent,
        recipient = %recipient,
        copy = %response.message_id,
        attachments = response.attachments,
        "message delivered"
    );
    Ok(Json(response))
}

async fn list_message_attachments(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> Result<Json<Vec<AttachmentView>>, ServerError> {
    let message = MessageId(id);
    let attachments = state
        .blocking(move |db, _| Ok(db.list_visible(user, Some(message))?))
        .await?;
    let views = attachments
        .into_iter()
        .map(|a| AttachmentView::build(&state.codec, a))
        .collect::<Result<_, _>>()?;
    Ok(Json(views))
}

/// Move a message to the trash, releasing the caller's attachment grants.
async fn trash_message(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> Result<Json<TrashResponse>, ServerError> {
    let message = MessageId(id);
    let revocations = state
        .blocking(move |db, _| Ok(db.soft_delete_message(user, message)?))
        .await?;

    let mut response = TrashResponse {
        revoked: 0,
        queued_blobs: 0,
    };
    for revocation in revocations {
        if let Revocation::Revoked { enqueued, .. } = revocation {
            response.revoked += 1;
            if enqueued {
                response.queued_blobs += 1;
            }
        }
    }
    info!(user_id = %user, message_id = %message, revoked = response.revoked, "message trashed");
    Ok(Json(response))
}

/// Queue a message for permanent deletion by the reaper.
async fn purge_message(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> Result<Json<PurgeResponse>, ServerError> {
    let message = MessageId(id);
    let queued = state
        .blocking(move |db, _| {
            owned_message(db, user, message)?;
            Ok(db.enqueue_message_deletion(message)?)
        })
        .await?;
    info!(user_id = %user, message_id = %message, queued, "message purge requested");
    Ok(Json(PurgeResponse { queued }))
}

/// Someone else's message is reported exactly like a missing one.
fn owned_message(
    db: &Database,
    user: UserId,
    id: MessageId,
) -> Result<satchel_store::Message, ServerError> {
    let message = db.get_message(id)?;
    if message.user_id != user {
        return Err(ServerError::NotFound);
    }
    Ok(message)
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use satchel_shared::{BlobId, QueueStatus};
    use tempfile::TempDir;
    use tower::ServiceExt;

    const ALICE: i64 = 100;
    const BOB: i64 = 200;
    const BOUNDARY: &str = "satchel-test-boundary";

    struct TestApp {
        app: Router,
        state: AppState,
        _dir: TempDir,
    }

    impl TestApp {
        fn new(max_upload_size: u64) -> Self {
            let dir = TempDir::new().unwrap();
            let config = ServerConfig {
                database_path: dir.path().join("satchel.db"),
                storage_root: dir.path().join("attachments"),
                max_upload_size,
                ..ServerConfig::default()
            };
            let state = AppState::new(config).unwrap();
            Self {
                app: build_router(state.clone()),
                state,
                _dir: dir,
            }
        }

        fn db(&self) -> Database {
            Database::open_at(&self.state.config.database_path).unwrap()
        }

        async fn call(&self, req: Request<Body>) -> (StatusCode, Vec<u8>) {
            let response = self.app.clone().oneshot(req).await.unwrap();
            let status = response.status();
            let body = axum::body::to_bytes(response.into_body(), usize::MAX)
                .await
                .unwrap();
            (status, body.to_vec())
        }

        async fn call_json(&self, req: Request<Body>) -> (StatusCode, serde_json::Value) {
            let (status, body) = self.call(req).await;
            (status, serde_json::from_slice(&body).unwrap())
        }

        async fn upload(&self, user: i64, filename: &str, data: &[u8]) -> serde_json::Value {
            let (status, body) = self.call_json(upload_request(Some(user), filename, data)).await;
            assert_eq!(status, StatusCode::OK, "{body}");
            body
        }

        async fn create_message(&self, user: i64, folder: &str) -> i64 {
            let (status, body) = self
                .call_json(json_request(
                    "POST",
                    "/messages",
                    user,
                    serde_json::json!({ "folder": folder, "subject": "Q3 numbers" }),
                ))
                .await;
            assert_eq!(status, StatusCode::OK);
            body["id"].as_i64().unwrap()
        }
    }

    fn multipart_body(filename: &str, data: &[u8]) -> Vec<u8> {
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\nContent-Type: application/pdf\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn upload_request(user: Option<i64>, filename: &str, data: &[u8]) -> Request<Body> {
        let body = multipart_body(filename, data);
        let mut builder = Request::builder()
            .method("POST")
            .uri("/attachments")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            );
        if let Some(user) = user {
            builder = builder.header(USER_HEADER, user.to_string());
        }
        builder.body(Body::from(body)).unwrap()
    }

    fn json_request(method: &str, uri: &str, user: i64, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(USER_HEADER, user.to_string())
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn bare_request(method: &str, uri: &str, user: i64) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(USER_HEADER, user.to_string())
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let t = TestApp::new(1024);
        let (status, body) = t
            .call_json(Request::get("/health").body(Body::empty()).unwrap())
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_upload_then_download() {
        let t = TestApp::new(1024 * 1024);
        let uploaded = t.upload(ALICE, "q3/report.pdf", b"%PDF-1.7 quarterly").await;
        assert_eq!(uploaded["filename"], "report.pdf");
        assert_eq!(uploaded["kind"], "pending");
        assert_eq!(uploaded["extension"], "pdf");

        let handle = uploaded["handle"].as_str().unwrap();
        let (status, bytes) = t
            .call(Request::get(format!("/attachments/{handle}")).body(Body::empty()).unwrap())
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(bytes, b"%PDF-1.7 quarterly");

        let (status, pending) = t.call_json(bare_request("GET", "/attachments/pending", ALICE)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(pending.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_upload_requires_user() {
        let t = TestApp::new(1024);
        let (status, _) = t.call(upload_request(None, "a.txt", b"data")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_oversized_upload_leaves_nothing() {
        let t = TestApp::new(64);
        let (status, _) = t.call(upload_request(Some(ALICE), "big.bin", &[7u8; 1024])).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);

        let spool = t.state.files.root().join("tmp");
        assert_eq!(std::fs::read_dir(spool).unwrap().count(), 0);
        let (_, pending) = t.call_json(bare_request("GET", "/attachments/pending", ALICE)).await;
        assert!(pending.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bad_handles_are_indistinguishable() {
        let t = TestApp::new(1024);
        let uploaded = t.upload(ALICE, "a.txt", b"real").await;
        let real = uploaded["handle"].as_str().unwrap().to_string();

        let mut tampered = real.clone().into_bytes();
        let last = tampered.len() - 1;
        tampered[last] = if tampered[last] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(tampered).unwrap();
        let unknown = t.state.codec.encode(BlobId(999_999)).unwrap();

        let mut bodies = Vec::new();
        for handle in ["not-a-handle", tampered.as_str(), unknown.as_str(), &real[..10]] {
            let (status, body) = t
                .call(Request::get(format!("/attachments/{handle}")).body(Body::empty()).unwrap())
                .await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{handle}");
            bodies.push(body);
        }
        assert!(bodies.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn test_send_deliver_and_trash() {
        let t = TestApp::new(1024 * 1024);
        let report = vec![0x25u8; 4096];

        let uploaded = t.upload(ALICE, "report.pdf", &report).await;
        let grant_id = uploaded["grant_id"].as_i64().unwrap();
        let sent = t.create_message(ALICE, "Sent").await;

        let (status, attached) = t
            .call_json(json_request(
                "POST",
                &format!("/messages/{sent}/attachments"),
                ALICE,
                serde_json::json!({ "grant_ids": [grant_id, 424242] }),
            ))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(attached["promoted"], serde_json::json!([grant_id]));
        assert_eq!(attached["rejected"], serde_json::json!([424242]));

        let (status, delivered) = t
            .call_json(json_request(
                "POST",
                &format!("/messages/{sent}/deliver"),
                ALICE,
                serde_json::json!({ "recipient": BOB }),
            ))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(delivered["attachments"], 1);
        let inbox = delivered["message_id"].as_i64().unwrap();

        let (_, listed) = t
            .call_json(bare_request("GET", &format!("/messages/{inbox}/attachments"), BOB))
            .await;
        let listed = listed.as_array().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0]["filename"], "report.pdf");
        assert_eq!(listed[0]["kind"], "recipient");

        // Alice trashes her copy; Bob's keeps the blob alive.
        let (_, trashed) = t
            .call_json(bare_request("DELETE", &format!("/messages/{sent}"), ALICE))
            .await;
        assert_eq!(trashed["revoked"], 1);
        assert_eq!(trashed["queued_blobs"], 0);

        let handle = listed[0]["handle"].as_str().unwrap();
        let (status, bytes) = t
            .call(Request::get(format!("/attachments/{handle}")).body(Body::empty()).unwrap())
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(bytes, report);

        let (_, trashed) = t
            .call_json(bare_request("DELETE", &format!("/messages/{inbox}"), BOB))
            .await;
        assert_eq!(trashed["queued_blobs"], 1);
        assert_eq!(t.db().count_queue_items(QueueStatus::Pending).unwrap(), 1);

        let (status, _) = t
            .call(Request::get(format!("/attachments/{handle}")).body(Body::empty()).unwrap())
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_foreign_messages_are_not_found() {
        let t = TestApp::new(1024);
        let sent = t.create_message(ALICE, "Sent").await;

        let (status, _) = t
            .call(bare_request("POST", &format!("/messages/{sent}/purge"), BOB))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = t
            .call(bare_request("DELETE", &format!("/messages/{sent}"), BOB))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_purge_is_queued_once() {
        let t = TestApp::new(1024);
        let sent = t.create_message(ALICE, "Sent").await;

        let (_, first) = t
            .call_json(bare_request("POST", &format!("/messages/{sent}/purge"), ALICE))
            .await;
        let (_, second) = t
            .call_json(bare_request("POST", &format!("/messages/{sent}/purge"), ALICE))
            .await;
        assert_eq!(first["queued"], true);
        assert_eq!(second["queued"], false);
    }

    #[tokio::test]
    async fn test_discard_pending_upload() {
        let t = TestApp::new(1024);
        let uploaded = t.upload(ALICE, "draft.txt", b"draft").await;
        let grant_id = uploaded["grant_id"].as_i64().unwrap();

        let (status, _) = t
            .call(bare_request("DELETE", &format!("/attachments/pending/{grant_id}"), BOB))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = t
            .call_json(bare_request("DELETE", &format!("/attachments/pending/{grant_id}"), ALICE))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["queued_blob"], true);

        let (status, _) = t
            .call(bare_request("DELETE", &format!("/attachments/pending/{grant_id}"), ALICE))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_upload_arriving_in_many_chunks() {
        let t = TestApp::new(1024 * 1024);
        let data: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
        let chunks: Vec<Result<Vec<u8>, io::Error>> = multipart_body("scan.tiff", &data)
            .chunks(4096)
            .map(|c| Ok(c.to_vec()))
            .collect();

        let request = Request::builder()
            .method("POST")
            .uri("/attachments")
            .header(USER_HEADER, ALICE.to_string())
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from_stream(tokio_stream::iter(chunks)))
            .unwrap();
        let (status, uploaded) = t.call_json(request).await;
        assert_eq!(status, StatusCode::OK, "{uploaded}");
        assert_eq!(uploaded["size"], 300_000);

        let handle = uploaded["handle"].as_str().unwrap();
        let (status, bytes) = t
            .call(Request::get(format!("/attachments/{handle}")).body(Body::empty()).unwrap())
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(bytes, data);
        assert_eq!(std::fs::read_dir(t.state.files.root().join("tmp")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_discarding_one_of_two_identical_uploads() {
        let t = TestApp::new(1024);
        let first = t.upload(ALICE, "a.pdf", b"same bytes").await;
        let second = t.upload(ALICE, "b.pdf", b"same bytes").await;
        let second_grant = second["grant_id"].as_i64().unwrap();

        let (status, body) = t
            .call_json(bare_request("DELETE", &format!("/attachments/pending/{second_grant}"), ALICE))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["queued_blob"], false);

        let (_, pending) = t.call_json(bare_request("GET", "/attachments/pending", ALICE)).await;
        let names: Vec<&str> = pending
            .as_array()
            .unwrap()
            .iter()
            .map(|a| a["filename"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["a.pdf"]);
        let grant = t.db().get_grant(first["grant_id"].as_i64().unwrap()).unwrap();
        assert!(!grant.revoked);
    }

    #[test]
    fn test_display_name() {
        assert_eq!(display_name(Some("../../etc/passwd")), "passwd");
        assert_eq!(display_name(Some("  notes.txt ")), "notes.txt");
        assert_eq!(display_name(Some("dir/")), "attachment");
        assert_eq!(display_name(None), "attachment");
    }
}

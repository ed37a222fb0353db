//! HTTP surface over the engine and the notification feed.
//!
//! Every response uses the `{success, data | message}` envelope. The calling
//! actor is read from the `x-actor-id` header; issuing that identity is the
//! job of whatever sits in front of this router.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{FromRequest, FromRequestParts, Path, Query, Request, State},
    http::{StatusCode, request::Parts},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, patch, post},
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{ActorId, FeedCursor, Notification, NotificationId, RequestPayload, Subject};
use crate::engine::RequestStateMachine;
use crate::error::TurnstileError;
use crate::notifications::{FeedEvent, FeedQuery, NotificationFeed};
use crate::request::{Action, Decision, NewRequest, RequestId, RequestKind, RequestStatus, RequestView};
use crate::storage::RequestFilter;

pub const ACTOR_HEADER: &str = "x-actor-id";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<RequestStateMachine>,
    pub feed: NotificationFeed,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/requests", post(submit_request).get(list_requests))
        .route("/requests/:id", get(get_request))
        .route("/requests/:id/decide", post(decide_request))
        .route("/notifications", get(list_notifications))
        .route("/notifications/unread-count", get(unread_count))
        .route("/notifications/read-all", patch(mark_all_read))
        .route("/notifications/stream", get(stream_notifications))
        .route("/notifications/:id/read", patch(mark_read))
        .route("/notifications/:id", axum::routing::delete(delete_notification))
        .with_state(state)
}

// ============================================================================
// Envelope and errors
// ============================================================================

#[derive(Debug, Serialize)]
struct Envelope<T> {
    success: bool,
    data: T,
}

fn ok<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        success: true,
        data,
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PagedEnvelope {
    success: bool,
    data: Vec<Notification>,
    current_page: u32,
    total_pages: u32,
    unread_count: u64,
    as_of: Option<FeedCursor>,
    next_cursor: Option<FeedCursor>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }
}

impl From<TurnstileError> for ApiError {
    fn from(error: TurnstileError) -> Self {
        let status = match &error {
            TurnstileError::NotFound(_) => StatusCode::NOT_FOUND,
            TurnstileError::Forbidden(_) => StatusCode::FORBIDDEN,
            TurnstileError::InvalidTransition { .. } => StatusCode::CONFLICT,
            TurnstileError::PreconditionFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
            TurnstileError::Validation(_) => StatusCode::BAD_REQUEST,
            TurnstileError::EffectFailed { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %error, "Request failed");
        }
        Self::new(status, error.to_string())
    }
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            success: false,
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ============================================================================
// Extractors
// ============================================================================

/// The actor named by the `x-actor-id` header.
#[derive(Debug, Clone, Copy)]
pub struct ActingActor(pub ActorId);

#[axum::async_trait]
impl<S> FromRequestParts<S> for ActingActor
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(ACTOR_HEADER)
            .ok_or_else(|| ApiError::unauthorized(format!("missing {ACTOR_HEADER} header")))?
            .to_str()
            .map_err(|_| ApiError::unauthorized(format!("malformed {ACTOR_HEADER} header")))?;
        let actor = raw
            .trim()
            .parse()
            .map_err(|_| ApiError::unauthorized(format!("malformed {ACTOR_HEADER} header")))?;
        Ok(Self(actor))
    }
}

pub struct ApiJson<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    axum::Json<T>: FromRequest<S>,
    <axum::Json<T> as FromRequest<S>>::Rejection: std::fmt::Display,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = axum::Json::<T>::from_request(req, state)
            .await
            .map_err(|e| ApiError::bad_request(e.to_string()))?;
        Ok(Self(value))
    }
}

pub struct ApiQuery<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequestParts<S> for ApiQuery<T>
where
    Query<T>: FromRequestParts<S>,
    <Query<T> as FromRequestParts<S>>::Rejection: std::fmt::Display,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(value) = Query::<T>::from_request_parts(parts, state)
            .await
            .map_err(|e| ApiError::bad_request(e.to_string()))?;
        Ok(Self(value))
    }
}

fn parse_id<T: From<Uuid>>(raw: &str) -> ApiResult<T> {
    Uuid::parse_str(raw)
        .map(T::from)
        .map_err(|_| ApiError::bad_request(format!("invalid id '{raw}'")))
}

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitBody {
    /// Defaults to the subject the payload names
    subject: Option<Subject>,
    payload: RequestPayload,
}

async fn submit_request(
    State(state): State<AppState>,
    ActingActor(actor): ActingActor,
    ApiJson(body): ApiJson<SubmitBody>,
) -> ApiResult<(StatusCode, Json<Envelope<RequestView>>)> {
    let input = NewRequest {
        kind: body.payload.kind(),
        submitted_by: actor,
        subject: body
            .subject
            .unwrap_or_else(|| body.payload.expected_subject()),
        payload: body.payload,
    };
    let request = state.engine.submit(input).await?;
    Ok((StatusCode::CREATED, ok(request.view())))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListRequestsQuery {
    kind: Option<RequestKind>,
    status: Option<RequestStatus>,
    /// Collaboration requests addressed to the caller instead of submitted by them
    #[serde(default)]
    addressed_to_me: bool,
}

async fn list_requests(
    State(state): State<AppState>,
    ActingActor(actor): ActingActor,
    ApiQuery(query): ApiQuery<ListRequestsQuery>,
) -> ApiResult<Json<Envelope<Vec<RequestView>>>> {
    let caller = state
        .engine
        .collaborators()
        .identity
        .get_actor(actor)
        .await
        .map_err(|_| ApiError::unauthorized(format!("unknown actor {actor}")))?;

    let mut filter = RequestFilter {
        kind: query.kind,
        status: query.status,
        ..Default::default()
    };
    if query.addressed_to_me {
        filter.subject = Some(Subject::Instructor(actor));
    } else if !caller.is_admin() {
        filter.submitted_by = Some(actor);
    }

    let requests = state.engine.list(&filter).await?;
    Ok(ok(requests.iter().map(|r| r.view()).collect()))
}

async fn get_request(
    State(state): State<AppState>,
    ActingActor(actor): ActingActor,
    Path(id): Path<String>,
) -> ApiResult<Json<Envelope<RequestView>>> {
    let id: RequestId = parse_id(&id)?;
    let request = state.engine.get_as(id, actor).await?;
    Ok(ok(request.view()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DecideBody {
    action: Action,
    review_note: Option<String>,
}

async fn decide_request(
    State(state): State<AppState>,
    ActingActor(actor): ActingActor,
    Path(id): Path<String>,
    ApiJson(body): ApiJson<DecideBody>,
) -> ApiResult<Json<Envelope<RequestView>>> {
    let id: RequestId = parse_id(&id)?;
    let decision = Decision {
        action: body.action,
        actor,
        review_note: body.review_note,
    };
    let request = state.engine.transition(id, decision).await?;
    Ok(ok(request.view()))
}

// ============================================================================
// Notifications
// ============================================================================

async fn list_notifications(
    State(state): State<AppState>,
    ActingActor(actor): ActingActor,
    ApiQuery(query): ApiQuery<FeedQuery>,
) -> ApiResult<Json<PagedEnvelope>> {
    let page = state.feed.list(actor, query).await?;
    Ok(Json(PagedEnvelope {
        success: true,
        data: page.items,
        current_page: page.current_page,
        total_pages: page.total_pages,
        unread_count: page.unread_count,
        as_of: page.as_of,
        next_cursor: page.next_cursor,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UnreadCount {
    unread_count: u64,
}

async fn unread_count(
    State(state): State<AppState>,
    ActingActor(actor): ActingActor,
) -> ApiResult<Json<Envelope<UnreadCount>>> {
    let unread_count = state.feed.unread_count(actor).await?;
    Ok(ok(UnreadCount { unread_count }))
}

async fn mark_read(
    State(state): State<AppState>,
    ActingActor(actor): ActingActor,
    Path(id): Path<String>,
) -> ApiResult<Json<Envelope<Notification>>> {
    let id: NotificationId = parse_id(&id)?;
    let notification = state.feed.mark_read(actor, id).await?;
    Ok(ok(notification))
}

#[derive(Debug, Serialize)]
struct Updated {
    updated: u64,
}

async fn mark_all_read(
    State(state): State<AppState>,
    ActingActor(actor): ActingActor,
) -> ApiResult<Json<Envelope<Updated>>> {
    let updated = state.feed.mark_all_read(actor).await?;
    Ok(ok(Updated { updated }))
}

#[derive(Debug, Serialize)]
struct Deleted {
    id: NotificationId,
}

async fn delete_notification(
    State(state): State<AppState>,
    ActingActor(actor): ActingActor,
    Path(id): Path<String>,
) -> ApiResult<Json<Envelope<Deleted>>> {
    let id: NotificationId = parse_id(&id)?;
    state.feed.delete(actor, id).await?;
    Ok(ok(Deleted { id }))
}

fn sse_json_event(event: &FeedEvent) -> Event {
    match serde_json::to_string(event) {
        Ok(data) => Event::default().event(event.kind.name()).data(data),
        Err(err) => Event::default().event("error").data(err.to_string()),
    }
}

async fn stream_notifications(
    State(state): State<AppState>,
    ActingActor(actor): ActingActor,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>> + Send>> {
    let unread_count = state.feed.unread_count(actor).await?;
    let hello = Event::default()
        .event("hello")
        .data(format!("{{\"unreadCount\":{unread_count}}}"));

    let events = state
        .feed
        .subscribe(actor)
        .map(|event| Ok::<_, Infallible>(sse_json_event(&event)));
    let stream = futures::stream::once(async move { Ok::<_, Infallible>(hello) }).chain(events);

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    ))
}

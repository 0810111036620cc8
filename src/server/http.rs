use super::http_auth::admin_grant;
use super::http_errors::{map_account_error, map_denial, map_payment_error, map_support_error};
use super::http_parse::{allowed_topics, parse_payment_status, parse_topic};
use super::http_types::*;
use super::state::AppState;
use crate::application::{AdminGrant, ChatOutcome, ReplyOutcome, SubmitOutcome};
use crate::domain::ApproveOutcome;
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header::HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, warn};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;
use validator::Validate;

/// Slack for multipart framing on top of the raw image limit.
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

type JsonResponse = (StatusCode, Json<serde_json::Value>);

pub fn router(state: AppState) -> Router {
    let upload_limit = state.max_upload_bytes.saturating_add(MULTIPART_OVERHEAD_BYTES);

    Router::new()
        .route("/health", get(health_check))
        .route("/api/users/:id", get(get_user_status))
        .route("/api/start-trial", post(start_trial))
        .route("/api/chat", post(chat))
        .route(
            "/api/upload",
            post(upload_image).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/api/submit-payment", post(submit_payment))
        .route("/api/emergency", post(emergency))
        .route("/api/admin/activate", post(activate_account))
        .route("/api/admin/payments", get(list_payments))
        .route("/api/admin/payments/:reference/approve", post(approve_payment))
        .route("/api/admin/users/:id", delete(delete_user))
        .route("/api/admin/users/:id/payments", get(list_user_payments))
        .route("/api/admin/users/:id/tickets", get(list_user_tickets))
        .route("/api/admin/tickets", get(list_open_tickets))
        .route("/api/admin/tickets/:id/reply", post(reply_to_ticket))
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

fn invalid_request(errors: validator::ValidationErrors) -> JsonResponse {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({"error": "Invalid request", "details": errors})),
    )
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<AdminGrant, JsonResponse> {
    admin_grant(headers, &state.admin_token).map_err(|_| {
        warn!("Rejected admin request without valid credentials");
        (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": "Unauthorized"})),
        )
    })
}

fn json_error((status, body): (StatusCode, serde_json::Value)) -> JsonResponse {
    (status, Json(body))
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health_check,
        get_user_status,
        start_trial,
        chat,
        upload_image,
        submit_payment,
        emergency,
        activate_account,
        list_payments,
        approve_payment,
        delete_user,
        list_user_payments,
        list_user_tickets,
        list_open_tickets,
        reply_to_ticket,
    ),
    components(
        schemas(
            HealthResponse,
            UserRequest,
            ChatRequest,
            SubmitPaymentRequest,
            ActivateRequest,
            ApprovePaymentRequest,
            TicketReplyRequest,
            StatusResponse,
            PaymentResponse,
            TicketResponse,
        )
    ),
    tags(
        (name = "Health", description = "Health check endpoints"),
        (name = "Users", description = "Account status and trials"),
        (name = "Support", description = "Gated support requests"),
        (name = "Payments", description = "Payment submission"),
        (name = "Admin", description = "Operator endpoints (bearer admin token)"),
    ),
    info(
        title = "Support Desk API",
        version = "0.1.0",
        description = "Subscription-gated support desk with weekly usage quotas",
        license(name = "MIT OR Apache-2.0")
    )
)]
struct ApiDoc;

/// Health check endpoint
///
/// Verifies database connectivity and returns service health status.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
        (status = 503, description = "Service is unhealthy", body = HealthResponse)
    )
)]
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    match sqlx::query("SELECT 1").fetch_one(&state.pool).await {
        Ok(_) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "healthy".to_string(),
                error: None,
            }),
        ),
        Err(e) => {
            error!(error = %e, "Health check failed: DB connectivity issue");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "unhealthy".to_string(),
                    error: Some("Database connectivity failed".to_string()),
                }),
            )
        }
    }
}

/// Current plan, expiry and weekly usage. Creates a trial account on first contact.
#[utoipa::path(
    get,
    path = "/api/users/{id}",
    tag = "Users",
    params(("id" = String, Path, description = "User ID")),
    responses(
        (status = 200, description = "Account status", body = StatusResponse),
        (status = 500, description = "Failed to load account", body = Object)
    )
)]
async fn get_user_status(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    match state.accounts.status(&user_id, Utc::now()).await {
        Ok(status) => (
            StatusCode::OK,
            Json(serde_json::json!(StatusResponse::from(status))),
        ),
        Err(e) => {
            error!(error = %e, user_id = %user_id, "Failed to load account status");
            json_error(map_account_error(&e))
        }
    }
}

#[utoipa::path(
    post,
    path = "/api/start-trial",
    tag = "Users",
    request_body = UserRequest,
    responses(
        (status = 200, description = "Trial started or existing account returned", body = Object),
        (status = 400, description = "Invalid request", body = Object),
        (status = 500, description = "Failed to start trial", body = Object)
    )
)]
async fn start_trial(
    State(state): State<AppState>,
    Json(req): Json<UserRequest>,
) -> impl IntoResponse {
    if let Err(errors) = req.validate() {
        return invalid_request(errors);
    }

    match state.accounts.start_trial(&req.user_id, Utc::now()).await {
        Ok(status) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "success": true,
                "status": StatusResponse::from(status)
            })),
        ),
        Err(e) => {
            error!(error = %e, user_id = %req.user_id, "Failed to start trial");
            json_error(map_account_error(&e))
        }
    }
}

/// Ask a question on one of the support topics. Consumes one unit of quota.
#[utoipa::path(
    post,
    path = "/api/chat",
    tag = "Support",
    request_body = ChatRequest,
    responses(
        (status = 200, description = "Answered", body = Object),
        (status = 202, description = "Queued for an agent", body = Object),
        (status = 400, description = "Invalid request or unknown topic", body = Object),
        (status = 403, description = "Trial or plan expired", body = Object),
        (status = 429, description = "Weekly limit reached", body = Object),
        (status = 503, description = "Entitlement storage unavailable", body = Object)
    )
)]
async fn chat(State(state): State<AppState>, Json(req): Json<ChatRequest>) -> impl IntoResponse {
    if let Err(errors) = req.validate() {
        return invalid_request(errors);
    }

    // Reject malformed topics before any quota is spent.
    let topic = match parse_topic(&req.topic) {
        Some(t) => t,
        None => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": "Unknown topic",
                    "allowed": allowed_topics()
                })),
            );
        }
    };

    match state
        .support
        .chat(&req.user_id, topic, &req.message, req.image_ref, Utc::now())
        .await
    {
        Ok(ChatOutcome::Replied {
            ticket_id,
            reply,
            limit,
            used,
        }) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "reply": reply,
                "ticketId": ticket_id,
                "limit": limit.bound(),
                "used": used
            })),
        ),
        Ok(ChatOutcome::Queued {
            ticket_id,
            limit,
            used,
        }) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "status": "queued",
                "message": "Your request was received. An agent will reply shortly.",
                "ticketId": ticket_id,
                "limit": limit.bound(),
                "used": used
            })),
        ),
        Ok(ChatOutcome::Denied(denial)) => json_error(map_denial(&denial)),
        Err(e) => {
            error!(error = %e, user_id = %req.user_id, "Chat request failed");
            json_error(map_support_error(&e))
        }
    }
}

/// Upload a chart or screenshot (multipart fields `userId` and `image`).
/// The returned `imageRef` can be attached to a chat request.
#[utoipa::path(
    post,
    path = "/api/upload",
    tag = "Support",
    responses(
        (status = 200, description = "Image stored", body = Object),
        (status = 400, description = "Missing field or empty upload", body = Object),
        (status = 413, description = "Image too large", body = Object)
    )
)]
async fn upload_image(State(state): State<AppState>, mut multipart: Multipart) -> impl IntoResponse {
    let mut user_id: Option<String> = None;
    let mut image: Option<(Vec<u8>, Option<String>)> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Malformed multipart upload");
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({"error": "Malformed multipart body"})),
                );
            }
        };

        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("userId") => match field.text().await {
                Ok(text) => user_id = Some(text.trim().to_string()),
                Err(e) => {
                    warn!(error = %e, "Failed to read userId field");
                    return (
                        StatusCode::BAD_REQUEST,
                        Json(serde_json::json!({"error": "Invalid userId field"})),
                    );
                }
            },
            Some("image") => {
                let file_name = field.file_name().map(str::to_string);
                match field.bytes().await {
                    Ok(bytes) => image = Some((bytes.to_vec(), file_name)),
                    Err(e) => {
                        warn!(error = %e, "Failed to read image field");
                        return (
                            StatusCode::PAYLOAD_TOO_LARGE,
                            Json(serde_json::json!({"error": "Image could not be read"})),
                        );
                    }
                }
            }
            _ => {}
        }
    }

    let user_id = match user_id.filter(|u| !u.is_empty()) {
        Some(u) => u,
        None => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": "userId is required"})),
            );
        }
    };
    let (bytes, file_name) = match image {
        Some(i) => i,
        None => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": "No image uploaded"})),
            );
        }
    };

    match state
        .support
        .upload_image(&user_id, &bytes, file_name.as_deref())
        .await
    {
        Ok(image_ref) => (
            StatusCode::OK,
            Json(serde_json::json!({"success": true, "imageRef": image_ref})),
        ),
        Err(e) => {
            error!(error = %e, user_id = %user_id, "Upload failed");
            json_error(map_support_error(&e))
        }
    }
}

#[utoipa::path(
    post,
    path = "/api/submit-payment",
    tag = "Payments",
    request_body = SubmitPaymentRequest,
    responses(
        (status = 201, description = "Payment recorded for review", body = Object),
        (status = 400, description = "Invalid request or unknown plan", body = Object),
        (status = 404, description = "Unknown account", body = Object),
        (status = 409, description = "Reference already submitted", body = Object)
    )
)]
async fn submit_payment(
    State(state): State<AppState>,
    Json(req): Json<SubmitPaymentRequest>,
) -> impl IntoResponse {
    if let Err(errors) = req.validate() {
        return invalid_request(errors);
    }

    match state
        .payments
        .submit_payment(&req.user_id, &req.package, &req.txid, Utc::now())
        .await
    {
        Ok(SubmitOutcome::Submitted(payment)) => (
            StatusCode::CREATED,
            Json(serde_json::json!({
                "success": true,
                "message": "Payment submitted. Your plan will be activated once it is verified.",
                "payment": PaymentResponse::from(payment)
            })),
        ),
        Ok(SubmitOutcome::DuplicateReference) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({"error": "This transaction was already submitted"})),
        ),
        Ok(SubmitOutcome::UnknownPlan(plan)) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "error": format!("Unknown plan: {}", plan),
                "allowed": state.entitlement.policy().tier_names()
            })),
        ),
        Ok(SubmitOutcome::UnknownAccount) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "Account not found. Start a trial first."})),
        ),
        Err(e) => {
            error!(error = %e, user_id = %req.user_id, "Failed to submit payment");
            json_error(map_payment_error(&e))
        }
    }
}

/// Page the operator for urgent one-to-one help. Does not consume quota.
#[utoipa::path(
    post,
    path = "/api/emergency",
    tag = "Support",
    request_body = UserRequest,
    responses(
        (status = 200, description = "Operator alerted", body = Object),
        (status = 400, description = "Invalid request", body = Object)
    )
)]
async fn emergency(State(state): State<AppState>, Json(req): Json<UserRequest>) -> impl IntoResponse {
    if let Err(errors) = req.validate() {
        return invalid_request(errors);
    }

    state.support.emergency(&req.user_id).await;
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "success": true,
            "message": "An agent has been alerted and will contact you shortly."
        })),
    )
}

#[utoipa::path(
    post,
    path = "/api/admin/activate",
    tag = "Admin",
    request_body = ActivateRequest,
    responses(
        (status = 200, description = "Plan activated", body = Object),
        (status = 400, description = "Unknown plan", body = Object),
        (status = 401, description = "Unauthorized", body = Object)
    )
)]
async fn activate_account(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ActivateRequest>,
) -> impl IntoResponse {
    let grant = match require_admin(&state, &headers) {
        Ok(g) => g,
        Err(resp) => return resp,
    };
    if let Err(errors) = req.validate() {
        return invalid_request(errors);
    }

    match state
        .accounts
        .activate(&grant, &req.user_id, &req.package, Utc::now())
        .await
    {
        Ok(account) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "success": true,
                "userId": account.id,
                "package": account.plan,
                "planStart": account.plan_start
            })),
        ),
        Err(e) => {
            warn!(error = %e, user_id = %req.user_id, "Manual activation failed");
            json_error(map_account_error(&e))
        }
    }
}

#[utoipa::path(
    get,
    path = "/api/admin/payments",
    tag = "Admin",
    params(PaymentListParams),
    responses(
        (status = 200, description = "Payments with the given status", body = [PaymentResponse]),
        (status = 400, description = "Invalid status", body = Object),
        (status = 401, description = "Unauthorized", body = Object)
    )
)]
async fn list_payments(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<PaymentListParams>,
) -> impl IntoResponse {
    let grant = match require_admin(&state, &headers) {
        Ok(g) => g,
        Err(resp) => return resp,
    };
    let status = match parse_payment_status(&params.status) {
        Some(s) => s,
        None => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": "Invalid payment status",
                    "allowed": ["pending", "approved"]
                })),
            );
        }
    };
    let limit = params.limit.clamp(1, MAX_PAGINATION_LIMIT);
    let offset = params.offset.max(0);

    match state.payments.list_payments(&grant, status, limit, offset).await {
        Ok(payments) => {
            let body: Vec<PaymentResponse> = payments.into_iter().map(Into::into).collect();
            (StatusCode::OK, Json(serde_json::json!(body)))
        }
        Err(e) => {
            error!(error = %e, "Failed to list payments");
            json_error(map_payment_error(&e))
        }
    }
}

/// Approve a submitted payment: the plan switches and usage resets atomically.
#[utoipa::path(
    post,
    path = "/api/admin/payments/{reference}/approve",
    tag = "Admin",
    params(("reference" = String, Path, description = "Payment reference (transaction hash)")),
    request_body = ApprovePaymentRequest,
    responses(
        (status = 200, description = "Payment approved and plan applied", body = Object),
        (status = 401, description = "Unauthorized", body = Object),
        (status = 404, description = "Payment not found", body = Object),
        (status = 409, description = "Payment already approved", body = Object)
    )
)]
async fn approve_payment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(reference): Path<String>,
    body: Option<Json<ApprovePaymentRequest>>,
) -> impl IntoResponse {
    let grant = match require_admin(&state, &headers) {
        Ok(g) => g,
        Err(resp) => return resp,
    };
    let req = body.map(|Json(b)| b).unwrap_or_default();
    if let Err(errors) = req.validate() {
        return invalid_request(errors);
    }

    match state
        .payments
        .approve_payment(&grant, &reference, req.notes.as_deref(), Utc::now())
        .await
    {
        Ok(ApproveOutcome::Approved { payment, account }) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "success": true,
                "payment": PaymentResponse::from(payment),
                "package": account.plan,
                "planStart": account.plan_start
            })),
        ),
        Ok(ApproveOutcome::NotFound) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "Payment not found"})),
        ),
        Ok(ApproveOutcome::AlreadyApproved(payment)) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({
                "error": "Payment already approved",
                "payment": PaymentResponse::from(payment)
            })),
        ),
        Err(e) => {
            error!(error = %e, reference = %reference, "Failed to approve payment");
            json_error(map_payment_error(&e))
        }
    }
}

/// Delete an account together with its payments and tickets.
#[utoipa::path(
    delete,
    path = "/api/admin/users/{id}",
    tag = "Admin",
    params(("id" = String, Path, description = "User ID")),
    responses(
        (status = 200, description = "Account deleted", body = Object),
        (status = 401, description = "Unauthorized", body = Object),
        (status = 404, description = "Account not found", body = Object)
    )
)]
async fn delete_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    let grant = match require_admin(&state, &headers) {
        Ok(g) => g,
        Err(resp) => return resp,
    };

    match state.accounts.delete(&grant, &user_id).await {
        Ok(true) => (StatusCode::OK, Json(serde_json::json!({"success": true}))),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "Account not found"})),
        ),
        Err(e) => {
            error!(error = %e, user_id = %user_id, "Failed to delete account");
            json_error(map_account_error(&e))
        }
    }
}

#[utoipa::path(
    get,
    path = "/api/admin/users/{id}/payments",
    tag = "Admin",
    params(("id" = String, Path, description = "User ID")),
    responses(
        (status = 200, description = "Payments submitted by the user", body = [PaymentResponse]),
        (status = 401, description = "Unauthorized", body = Object)
    )
)]
async fn list_user_payments(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    let grant = match require_admin(&state, &headers) {
        Ok(g) => g,
        Err(resp) => return resp,
    };

    match state.payments.list_user_payments(&grant, &user_id).await {
        Ok(payments) => {
            let body: Vec<PaymentResponse> = payments.into_iter().map(Into::into).collect();
            (StatusCode::OK, Json(serde_json::json!(body)))
        }
        Err(e) => {
            error!(error = %e, user_id = %user_id, "Failed to list user payments");
            json_error(map_payment_error(&e))
        }
    }
}

/// Conversation history for one user, newest first.
#[utoipa::path(
    get,
    path = "/api/admin/users/{id}/tickets",
    tag = "Admin",
    params(("id" = String, Path, description = "User ID"), PaginationParams),
    responses(
        (status = 200, description = "Tickets", body = [TicketResponse]),
        (status = 401, description = "Unauthorized", body = Object)
    )
)]
async fn list_user_tickets(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
    Query(params): Query<PaginationParams>,
) -> impl IntoResponse {
    let grant = match require_admin(&state, &headers) {
        Ok(g) => g,
        Err(resp) => return resp,
    };
    let (limit, offset) = params.clamped();

    match state
        .support
        .list_user_tickets(&grant, &user_id, limit, offset)
        .await
    {
        Ok(tickets) => {
            let body: Vec<TicketResponse> = tickets.into_iter().map(Into::into).collect();
            (StatusCode::OK, Json(serde_json::json!(body)))
        }
        Err(e) => {
            error!(error = %e, user_id = %user_id, "Failed to list user tickets");
            json_error(map_support_error(&e))
        }
    }
}

/// Tickets still waiting for an answer, oldest first.
#[utoipa::path(
    get,
    path = "/api/admin/tickets",
    tag = "Admin",
    params(PaginationParams),
    responses(
        (status = 200, description = "Open tickets", body = [TicketResponse]),
        (status = 401, description = "Unauthorized", body = Object)
    )
)]
async fn list_open_tickets(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<PaginationParams>,
) -> impl IntoResponse {
    let grant = match require_admin(&state, &headers) {
        Ok(g) => g,
        Err(resp) => return resp,
    };
    let (limit, offset) = params.clamped();

    match state.support.list_open_tickets(&grant, limit, offset).await {
        Ok(tickets) => {
            let body: Vec<TicketResponse> = tickets.into_iter().map(Into::into).collect();
            (StatusCode::OK, Json(serde_json::json!(body)))
        }
        Err(e) => {
            error!(error = %e, "Failed to list open tickets");
            json_error(map_support_error(&e))
        }
    }
}

#[utoipa::path(
    post,
    path = "/api/admin/tickets/{id}/reply",
    tag = "Admin",
    params(("id" = Uuid, Path, description = "Ticket ID")),
    request_body = TicketReplyRequest,
    responses(
        (status = 200, description = "Reply recorded and sent", body = TicketResponse),
        (status = 401, description = "Unauthorized", body = Object),
        (status = 404, description = "Ticket not found", body = Object),
        (status = 409, description = "Ticket already answered", body = Object)
    )
)]
async fn reply_to_ticket(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(ticket_id): Path<Uuid>,
    Json(req): Json<TicketReplyRequest>,
) -> impl IntoResponse {
    let grant = match require_admin(&state, &headers) {
        Ok(g) => g,
        Err(resp) => return resp,
    };
    if let Err(errors) = req.validate() {
        return invalid_request(errors);
    }

    match state
        .support
        .reply_to_ticket(&grant, ticket_id, &req.reply, Utc::now())
        .await
    {
        Ok(ReplyOutcome::Replied(ticket)) => (
            StatusCode::OK,
            Json(serde_json::json!(TicketResponse::from(ticket))),
        ),
        Ok(ReplyOutcome::NotFound) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "Ticket not found"})),
        ),
        Ok(ReplyOutcome::AlreadyAnswered) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({"error": "Ticket already answered"})),
        ),
        Err(e) => {
            error!(error = %e, ticket_id = %ticket_id, "Failed to reply to ticket");
            json_error(map_support_error(&e))
        }
    }
}

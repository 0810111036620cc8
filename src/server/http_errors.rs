use crate::application::{AccountError, Denial, PaymentError, SupportError};
use crate::infrastructure::{RepositoryError, UploadError};
use axum::http::StatusCode;

pub(super) fn map_denial(denial: &Denial) -> (StatusCode, serde_json::Value) {
    match denial {
        Denial::TrialExpired => (
            StatusCode::FORBIDDEN,
            serde_json::json!({
                "error": "Trial expired. Please subscribe to continue.",
                "reason": denial.code(),
                "needsPayment": true
            }),
        ),
        Denial::PlanExpired => (
            StatusCode::FORBIDDEN,
            serde_json::json!({
                "error": "Your plan has expired. Please renew to continue.",
                "reason": denial.code(),
                "needsPayment": true
            }),
        ),
        Denial::QuotaExceeded { limit } => (
            StatusCode::TOO_MANY_REQUESTS,
            serde_json::json!({
                "error": format!("Weekly limit reached ({} requests).", limit),
                "reason": denial.code(),
                "limit": limit
            }),
        ),
        Denial::StorageError => (
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({
                "error": "Service temporarily unavailable, please retry",
                "reason": denial.code()
            }),
        ),
    }
}

pub(super) fn map_account_error(err: &AccountError) -> (StatusCode, serde_json::Value) {
    match err {
        AccountError::UnknownPlan(plan) => (
            StatusCode::BAD_REQUEST,
            serde_json::json!({ "error": format!("Unknown plan: {}", plan) }),
        ),
        AccountError::Repository(RepositoryError::NotFound(_)) => (
            StatusCode::NOT_FOUND,
            serde_json::json!({ "error": "Account not found" }),
        ),
        AccountError::Repository(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({ "error": "Account operation failed" }),
        ),
    }
}

pub(super) fn map_payment_error(err: &PaymentError) -> (StatusCode, serde_json::Value) {
    match err {
        PaymentError::Repository(RepositoryError::NotFound(_)) => (
            StatusCode::NOT_FOUND,
            serde_json::json!({ "error": "Payment not found" }),
        ),
        PaymentError::Repository(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({ "error": "Payment operation failed" }),
        ),
    }
}

pub(super) fn map_support_error(err: &SupportError) -> (StatusCode, serde_json::Value) {
    match err {
        SupportError::Upload(UploadError::Empty) => (
            StatusCode::BAD_REQUEST,
            serde_json::json!({ "error": "No image uploaded" }),
        ),
        SupportError::Upload(UploadError::TooLarge { max, .. }) => (
            StatusCode::PAYLOAD_TOO_LARGE,
            serde_json::json!({ "error": format!("Image exceeds {} bytes", max) }),
        ),
        SupportError::Upload(UploadError::Io(_)) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({ "error": "Failed to store image" }),
        ),
        SupportError::Repository(RepositoryError::NotFound(_)) => (
            StatusCode::NOT_FOUND,
            serde_json::json!({ "error": "Ticket not found" }),
        ),
        SupportError::Repository(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({ "error": "Support request failed" }),
        ),
    }
}

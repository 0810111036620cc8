//! Support Desk
//!
//! Subscription-gated support desk: trials, paid tiers, weekly usage quotas
//! and manually verified payments.
//!
//! ## Standalone
//!
//! Run the binary:
//! ```bash
//! support-desk-server
//! ```
//!
//! ## Embedded (Axum)
//!
//! When the `server` feature is enabled, this crate can be embedded into a larger Axum app:
//! ```rust,ignore
//! use axum::Router;
//! use support_desk::infrastructure::AppConfig;
//! use support_desk::server::{build_state_with_pool, router};
//! use sqlx::PgPool;
//!
//! let cfg = AppConfig::from_env()?;
//! let pool = PgPool::connect(&cfg.database_url).await?;
//! let state = build_state_with_pool(cfg, pool, true).await?;
//! let app = Router::new().nest("/desk", router(state));
//! ```
//!
//! ## Library only
//!
//! Without the `server` feature the entitlement engine can be driven
//! directly through [`application::EntitlementService`] and any
//! [`infrastructure::AccountRepository`] implementation.

pub mod application;
pub mod domain;
pub mod infrastructure;

// Standalone + embedded HTTP server support (Axum).
// Enabled behind the `server` feature so the core library can be used without Axum.
#[cfg(feature = "server")]
pub mod server;

pub use application::*;
pub use domain::*;
pub use infrastructure::*;

#[cfg(feature = "server")]
pub use server::*;

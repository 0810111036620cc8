pub mod completion;
pub mod config;
pub mod notifier;
pub mod postgres_payment_repo;
pub mod postgres_ticket_repo;
pub mod repository;
pub mod uploads;

pub use completion::*;
pub use self::config::*;
pub use notifier::*;
pub use postgres_payment_repo::*;
pub use postgres_ticket_repo::*;
pub use repository::*;
pub use uploads::*;

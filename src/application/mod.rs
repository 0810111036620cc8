pub mod accounts;
pub mod admin;
pub mod entitlement;
pub mod payments;
pub mod policy;
pub mod support;

pub use accounts::*;
pub use admin::*;
pub use entitlement::*;
pub use payments::*;
pub use policy::*;
pub use support::*;

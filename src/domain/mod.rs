pub mod account;
pub mod payment;
pub mod quota;
pub mod ticket;

pub use account::*;
pub use payment::*;
pub use quota::*;
pub use ticket::*;

//! Authentication and authorization.

pub mod identity;
pub mod rate_limit;

pub use identity::{HmacTokenProvider, IdentityGate};
pub use rate_limit::RateLimiter;

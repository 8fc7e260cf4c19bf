//! Core types for the tollgate API gateway.
//!
//! This crate holds the pieces that do not touch the network: token
//! verification, the route table, the error taxonomy and an injectable clock.

pub mod auth;
pub mod clock;
pub mod error;
pub mod routes;

pub use auth::{Principal, TokenVerifier, VerificationError};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::{ErrorBody, ErrorCategory, ErrorCode, GatewayError};
pub use routes::{Backend, RouteConfig, RouteMatch, RouteTable};

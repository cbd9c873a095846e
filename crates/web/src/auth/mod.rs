//! Request authentication.
//!
//! A single configured strategy decides every request:
//!
//! | strategy          | check                                | fallback            |
//! |-------------------|--------------------------------------|---------------------|
//! | disabled          | always allowed                       | —                   |
//! | platform-session  | platform cookie/token via its API    | mesh-identity, whenever the platform is unreachable or rejects presented credentials |
//! | mesh-identity     | caller address in the live peer list | —                   |
//! | static-credential | session cookie or HTTP Basic match   | —                   |
//!
//! The platform→mesh fallback is policy, not error handling, but it requires
//! credentials to have been presented: a request carrying neither the
//! platform cookie nor a bearer token is denied without any fallback.

pub mod resolver;
pub mod session;

pub use resolver::{AuthResolver, AuthStrategy, RequestMeta};
pub use session::{SessionManager, SessionVerification, SESSION_COOKIE, SESSION_TTL};

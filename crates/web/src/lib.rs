//! FunnelDeck API server
//!
//! Supervises the mesh-networking client and the container runtime through
//! their command-line interfaces and exposes state and mutations over HTTP.

pub mod auth;
pub mod config;
pub mod docker;
pub mod exec;
pub mod mesh;
pub mod server;

pub use auth::{AuthResolver, AuthStrategy, SessionManager};
pub use config::AppConfig;
pub use docker::ContainerInspector;
pub use mesh::MeshClient;
pub use server::serve;

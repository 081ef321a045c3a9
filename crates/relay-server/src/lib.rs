pub mod auth;
pub mod client;
pub mod coordinator;
pub mod limiter;
pub mod server;

pub use auth::{CredentialVerifier, StoreVerifier};
pub use client::{ClientId, ClientRegistry};
pub use coordinator::Coordinator;
pub use limiter::CooldownTracker;
pub use server::{start, ServerConfig, ServerHandle};

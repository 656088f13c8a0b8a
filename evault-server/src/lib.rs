pub mod config;
pub mod metrics;
pub mod replica;
pub mod server;
pub mod transaction;

pub use config::{Config, ReplicaOf, Role};
pub use server::ServerState;

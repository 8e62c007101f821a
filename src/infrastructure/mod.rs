//! Infrastructure layer
//!
//! Concrete collaborators behind the ports: storage backends, the sandbox
//! payment gateway and the shared HTTP client.

pub mod http_client;
pub mod memory_store;
pub mod redis_client;
pub mod sandbox_gateway;

pub use memory_store::MemoryStore;
pub use redis_client::RedisStore;
pub use sandbox_gateway::SandboxGateway;

pub use config::{
    BufferPoolConfig, EngineConfig, NetworkConfig, SessionConfig, WorkerPoolConfig,
};
pub use error::{WireError, WireResult};
pub use shutdown::Shutdown;
pub use tracing_config::{setup_local_tracing, setup_tracing};

mod config;
mod error;
mod shutdown;
mod tracing_config;

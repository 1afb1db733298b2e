pub mod config;
pub mod error;
pub mod event;
pub mod goal;
pub mod security;
pub mod traits;
pub mod types;

pub use config::EngineConfig;
pub use error::{Result, WeaverError};
pub use event::EventBus;
pub use goal::Goal;
pub use types::*;

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod lifecycle;
pub mod machine;
pub mod types;

mod sync;

pub use config::Config;
pub use engine::{Controller, ControllerSettings, StartupOptions};
pub use error::{ControlError, MachineError, RecoveryError};
pub use types::*;

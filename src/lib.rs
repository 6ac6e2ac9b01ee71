// Library exports for the vigil process supervisor

pub mod cli;
pub mod config;
pub mod error;
pub mod logs;
pub mod process;
pub mod supervisor;

pub use config::{ProcessSpec, SupervisorSettings, VigilConfig};
pub use error::{Result, VigilError};
pub use supervisor::{Supervisor, SupervisorEvent, StatusReporter, StatusSnapshot};

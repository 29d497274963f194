pub mod config;
pub mod error;

pub use config::{load_dotenv, Config, ProjectConfig, PublisherConfig, SchedulerConfig};
pub use error::*;

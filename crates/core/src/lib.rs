pub mod build;
pub mod config;
pub mod error;
pub mod jobset;
pub mod step;

pub use build::{Build, BuildId};
pub use config::{load_dotenv, SchedulerConfig};
pub use error::*;
pub use jobset::Jobset;
pub use step::{Step, StepId};

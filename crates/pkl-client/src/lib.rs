//! pkl-client: async client for a Pkl evaluator process (`pkl server`).

mod dispatcher;
mod error;
mod module_source;
mod options;
mod session;

pub mod bridge;
pub mod logging;
pub mod manager;
pub mod project;
pub mod reader;
pub mod transport;
pub mod value;

#[cfg(test)]
mod test_support;

pub use error::EvaluatorError;
pub use manager::{
    CommandSpawner, EvaluatorManager, EvaluatorSpawner, ManagerConfig, SpawnError,
    SpawnedEvaluator,
};
pub use module_source::ModuleSource;
pub use options::{EvaluatorOptions, OutputFormat};
pub use session::Evaluator;

pub use bridge::protocol::{Checksums, PathElement};
pub use logging::{LogLevel, Logger, TracingLogger};
pub use project::{Project, ProjectDependencies, ProjectEvaluatorSettings};
pub use reader::{ModuleReader, Reader, ResourceReader};
pub use value::{DataSize, DataSizeUnit, Duration, DurationUnit, Value};

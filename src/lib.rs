//! A/B testing engine for job-application experiments.
//!
//! Tests are defined through the [`registry`], driven through their lifecycle
//! by [`service::ExperimentService`], and analysed by [`stats`]. Persistence,
//! time and randomness sit behind the [`storage::Storage`],
//! [`clock::Clock`] and [`random::RandomSource`] traits.
//!
//! ```no_run
//! use std::sync::Arc;
//! use abtest_engine::{ExperimentService, InMemoryStorage};
//!
//! let service = ExperimentService::new(Arc::new(InMemoryStorage::new()));
//! for template in service.templates() {
//!     println!("{}", template.id);
//! }
//! ```

pub mod assignment;
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod model;
pub mod random;
pub mod registry;
pub mod service;
pub mod stats;
pub mod storage;

pub use config::EngineConfig;
pub use error::{AbTestError, Result};
pub use model::{
    ConversionType, ParticipantContext, Participation, Test, TestResults, TestStatus, TestType,
    VariantAssignment,
};
pub use registry::{TemplateCustomizations, TestConfig, VariantConfig};
pub use service::ExperimentService;
pub use storage::{InMemoryStorage, SqliteStorage, Storage};

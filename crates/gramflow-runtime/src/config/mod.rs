//! Configuration for the gramflow runtime.
//!
//! Settings are layered with figment (see [`ConfigLoader`]) into a
//! [`GramflowConfig`], validated with [`validate_config`], then turned into a
//! [`DispatcherConfig`](gramflow_framework::DispatcherConfig) and a logging
//! setup.

pub mod error;
pub mod loader;
pub mod schema;
pub mod validation;

pub use error::{ConfigError, ConfigResult};
pub use loader::{ConfigLoader, Profile, load_config, load_config_from_file};
pub use schema::{
    DispatcherSection, GramflowConfig, LimitOverride, LogFormat, LogLevel, LogOutput,
    LogRotation, LoggingConfig, RateLimitSection, SpanEventConfig,
};
pub use validation::validate_config;

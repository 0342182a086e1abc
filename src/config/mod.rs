//! Configuration module

pub mod settings;

pub use settings::{
    positive_count, ConnectionSettings, GenerationDefaults, LogFormat, LoggingConfig,
    ServerConfig, Settings,
};

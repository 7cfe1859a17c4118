pub mod bootstrap;
pub mod cli;
pub mod config;
pub mod keys;
pub mod runtime;
pub mod storage;

pub use config::Config;
pub use runtime::builder::build_runtime;

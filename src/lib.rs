pub mod args;
pub mod config;
pub mod daemon;
pub mod discovery;
pub mod error;
pub mod fs_util;
pub mod health;
pub mod instance;
pub mod keys;
pub mod platform;
pub mod policy;
pub mod reconciler;
pub mod vault;

pub use args::Args;

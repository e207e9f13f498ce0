pub mod config;
pub mod jobs;

pub use config::*;
pub use jobs::*;

//! # Jobs Module
//!
//! The job domain shared by the HTTP gateway and the workers.
//!
//! ## Key Components:
//! - **Model**: job records, status views, error codes, options
//! - **Store**: keyed job state with an enforced lifecycle
//! - **Queue**: bounded at-least-once work channel
//! - **Gateway**: submission and status reads

pub mod gateway;
pub mod model;
pub mod queue;
pub mod store;

pub use gateway::Gateway;
pub use queue::TaskQueue;
pub use store::{InMemoryJobStore, JobStore};

//! Request/response models for exposing an engine over an API surface.

pub mod api;

pub use api::{health, submit_job, HealthResponse, JobStatusResponse, JobSubmission};

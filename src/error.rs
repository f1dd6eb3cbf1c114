//! Error types for the chorus crate
//!
//! Fallible operations return [`anyhow::Result`]; the variants below are the
//! typed failures raised inside the crate and can be recovered with
//! `err.downcast_ref::<chorus::Error>()`.

use thiserror::Error;

/// Failures raised by population construction, sampling, and games
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid configuration: {message}")]
    Configuration { message: String },

    #[error("vision backbone '{name}' is not supported")]
    UnsupportedBackbone { name: String },

    #[error("cannot sample: {pool} is empty")]
    EmptyPool { pool: &'static str },

    #[error("tensor computation failed: {0}")]
    Computation(#[from] tch::TchError),
}

impl Error {
    /// Shorthand for [`Error::Configuration`]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }
}

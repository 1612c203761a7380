use thiserror::Error;

/// Errors raised while building or checking process configuration.
#[derive(Error, Debug)]
pub enum CoperError {
    /// A required key is missing or sections disagree.
    #[error("config error: {0}")]
    Config(String),
}

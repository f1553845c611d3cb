#[derive(Debug, thiserror::Error)]
pub enum CommonError {
    #[error("missing required configuration value: {0}")]
    MissingConfig(&'static str),
}

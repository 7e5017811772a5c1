use chainward_state::StateError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("alert store: {0}")]
    State(#[from] StateError),

    #[error("invalid alert configuration: {0}")]
    Config(String),
}

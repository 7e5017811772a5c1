use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlacementError {
    #[error("no free port set for {blockchain} after {attempts} attempts")]
    PortExhausted { blockchain: String, attempts: u32 },
}

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid share count {shares} for jobset {jobset}")]
    InvalidShares { jobset: String, shares: u32 },

    #[error("{0}")]
    Other(String),
}

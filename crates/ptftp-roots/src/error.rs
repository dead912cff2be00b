use thiserror::Error;

#[derive(Error, Debug)]
pub enum RootsError {
    #[error("No TFTP root configured for {0}")]
    NotFound(String),

    #[error("Invalid client address: {0}")]
    InvalidClient(String),

    #[error("Invalid root path: {0}")]
    InvalidRoot(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RootsError>;

use std::io;

/// Error taxonomy shared by every component. The dispatcher collapses any of
/// these into a single `FAIL<message>` frame; GPT/USB init failures propagate
/// out of `main` instead.
#[derive(Debug, thiserror::Error)]
pub enum KbootError {
    #[error("short transfer: moved {moved} of {requested} bytes")]
    IoShort { moved: usize, requested: usize },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("partition not found: {0}")]
    Lookup(String),

    #[error("resource error: {0}")]
    Resource(String),

    #[error("unsupported {what}: {value}")]
    Protocol { what: &'static str, value: String },

    #[error("{0}")]
    Boundary(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Nix(#[from] nix::Error),
}

pub type Result<T> = std::result::Result<T, KbootError>;

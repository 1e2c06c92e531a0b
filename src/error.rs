use crate::deps::thiserror;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid pool configuration: {reason}")]
    ConfigInvalid { reason: String },

    #[error("no frame obtainable: ram is full and no victim could be evicted")]
    Exhausted,

    #[error("operation attempted on a freed control block")]
    UseAfterFree,

    #[error("open ref count saturated at the maximum of {max}")]
    OpenLimitExceeded { max: u32 },

    #[error("an io error occurred: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("io operation timed out after {0:?}")]
    TimedOut(std::time::Duration),
}

pub type Result<T> = std::result::Result<T, Error>;

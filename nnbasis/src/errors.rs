#[non_exhaustive]
#[derive(Debug)]
pub enum Error {
    /// Got an invalid combination of hyper-parameters, an invalid document or
    /// an invalid species index
    Configuration(String),
    /// An operation was called in the wrong state: after shutdown, or a
    /// backward/force pass without the corresponding forward pass
    State(String),
    /// A caller-provided buffer is smaller than required
    Capacity {
        /// which buffer is too small
        name: &'static str,
        /// minimal required length
        required: usize,
        /// length of the buffer we got
        actual: usize,
    },
    /// Error while serializing/deserializing data
    Json(serde_json::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Configuration(e) => write!(f, "invalid configuration: {}", e),
            Error::State(e) => write!(f, "invalid state: {}", e),
            Error::Capacity { name, required, actual } => write!(
                f, "buffer too small: {} needs at least {} elements, got {}",
                name, required, actual
            ),
            Error::Json(e) => write!(f, "json error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Configuration(_) |
            Error::State(_) |
            Error::Capacity { .. } => None,
            Error::Json(e) => Some(e),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Error {
        Error::Json(error)
    }
}

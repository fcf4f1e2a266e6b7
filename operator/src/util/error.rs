#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes reported error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },

    #[error("Invalid user input: {0}")]
    UserInput(String),

    #[error("Database admin request failed: {0}")]
    Admin(String),

    #[error("Json error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("Parse duration: {source}")]
    ParseDuration {
        #[from]
        source: parse_duration::parse::Error,
    },

    #[error("Context cancelled")]
    Cancelled,
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Admin(e.to_string())
    }
}

impl Error {
    /// A transient error clears itself: the next trigger re-reads the
    /// world and retries. Optimistic-concurrency conflicts and admin API
    /// hiccups fall in this bucket.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 409,
            Error::Admin(_) | Error::Cancelled => true,
            _ => false,
        }
    }
}

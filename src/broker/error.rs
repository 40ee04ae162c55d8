/// Errors raised at the tool broker's boundary. Scoped to this subsystem
/// rather than folded into one crate-wide error type, matching
/// `llm::provider::ProviderError`'s per-component convention.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("no downstream server configured for prefix '{0}'")]
    UnknownServer(String),

    #[error("downstream server '{0}' does not advertise tool '{1}'")]
    ToolNotAdvertised(String, String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("downstream protocol error: {0}")]
    Protocol(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

use ember_reactor::ReactorError;

/// Fatal startup/runtime errors. Everything connection-scoped is recovered
/// by closing the connection and never surfaces here.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("listener bind failed on {url}: {source}")]
    Bind {
        url: String,
        #[source]
        source: std::io::Error,
    },
    #[error("reactor initialisation failed: {0}")]
    Reactor(#[from] ReactorError),
    #[error("cluster IPC setup failed: {0}")]
    Ipc(#[source] std::io::Error),
    #[error("fork failed: {0}")]
    Fork(#[source] std::io::Error),
}

impl ServerError {
    /// Process exit code contract: 1 argument error, 2 bind error, 3 fatal
    /// reactor initialisation.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 1,
            Self::Bind { .. } => 2,
            Self::Reactor(_) | Self::Ipc(_) | Self::Fork(_) => 3,
        }
    }
}

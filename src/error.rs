use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no {0} tethering interface found")]
    InterfaceNotFound(String),

    #[error("interface {0} is not usable")]
    InterfaceInvalid(String),

    #[error("upstream proxy unreachable: {0}")]
    ProxyUnreachable(String),

    #[error("rule apply failed: {0}")]
    RuleApplyFailed(String),

    #[error("rule remove failed: {0}")]
    RuleRemoveFailed(String),

    #[error("health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("already connected -- run `tetherlink disconnect` first")]
    AlreadyConnected,

    #[error("not connected")]
    NotConnected,

    #[error("proxy daemon error: {0}")]
    Daemon(String),

    #[error("{0}")]
    Other(String),
}

impl AppError {
    /// Stable process exit code for the CLI surface.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::InterfaceNotFound(_) => 2,
            AppError::ProxyUnreachable(_) => 3,
            AppError::InterfaceInvalid(_)
            | AppError::RuleApplyFailed(_)
            | AppError::RuleRemoveFailed(_)
            | AppError::Daemon(_) => 4,
            AppError::AlreadyConnected => 5,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

/// Shared error type used across all orchard crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid transition: {event} not allowed while task {task_id} is {status}")]
    InvalidTransition {
        task_id: String,
        status: String,
        event: String,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("subtask depth limit exceeded (max {0})")]
    DepthExceeded(usize),

    #[error("task ancestry cycle detected at {0}")]
    Cycle(String),

    #[error("timeout: {0}")]
    TimedOut(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("config: {0}")]
    Config(String),

    #[error("llm: {0}")]
    Llm(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

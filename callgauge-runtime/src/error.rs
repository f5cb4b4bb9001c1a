/// Failure of a caller-identification mechanism.
///
/// Never reaches instrumented code: the strategy downgrades to the next
/// mechanism and retries.
#[derive(Debug, thiserror::Error)]
pub enum CallerError {
    #[error("stack walk ended {remaining} frame(s) short of the caller")]
    StackTooShallow { remaining: usize },

    #[error("no symbol for instruction pointer {ip:#x}")]
    Unresolved { ip: usize },

    #[error("caller mechanism panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("failed to serialize snapshot: {0}")]
    Serialize(String),

    #[error("{0}")]
    Fmt(#[from] std::fmt::Error),
}

use thiserror::Error;

/// Crate-wide error taxonomy, per the three buckets the runtime actually
/// needs to tell apart: failures that should abort setup, failures that
/// come from what the user typed, and failures during teardown that must
/// not stop the rest of teardown from running.
#[derive(Error, Debug)]
pub enum FdockerError {
    #[error("setup failed: {0}")]
    SetupFatal(String),

    #[error("{0}")]
    UserInput(String),

    #[error("teardown step failed: {0}")]
    TeardownWarning(String),

    #[error("container command failed: {0}")]
    ChildPayload(String),
}

impl FdockerError {
    pub fn setup(msg: impl Into<String>) -> Self {
        FdockerError::SetupFatal(msg.into())
    }

    pub fn user(msg: impl Into<String>) -> Self {
        FdockerError::UserInput(msg.into())
    }
}

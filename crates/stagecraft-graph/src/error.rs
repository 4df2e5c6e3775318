use stagecraft_artifact::{HashError, Stage};

/// Stage graph errors
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// Edges would form a cycle
    #[error("stage graph contains a cycle")]
    CycleDetected,

    /// A stage was declared as its own dependency
    #[error("stage {0} cannot depend on itself")]
    SelfLoop(Stage),

    /// Fingerprint input could not be encoded
    #[error("fingerprint error: {0}")]
    Fingerprint(#[from] HashError),
}

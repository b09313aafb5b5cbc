use thiserror::Error;

/// Transport-level and stage-level failures. These are retried within the
/// stage that produced them; terminal run outcomes are `FailureKind`.
#[derive(Error, Debug)]
pub enum RegisterError {
    #[error("element not found: {0}")]
    ElementNotFound(String),

    #[error("navigation timeout after {0}s")]
    NavigationTimeout(u64),

    #[error("browser error: {0}")]
    Browser(String),

    #[error("captcha unresolved after {0} attempts")]
    CaptchaUnresolved(u32),

    #[error("mailbox error: {0}")]
    Mailbox(String),

    #[error("sink error: {0}")]
    Sink(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl RegisterError {
    /// True for failures worth another attempt within the same stage.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RegisterError::ElementNotFound(_)
                | RegisterError::NavigationTimeout(_)
                | RegisterError::Mailbox(_)
        )
    }
}

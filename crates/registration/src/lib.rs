pub mod browser;
pub mod captcha;
pub mod identity;
pub mod mailbox;
pub mod orchestrator;
pub mod sink;
pub mod types;

pub use browser::{BrowserDriver, HeadlessBrowser};
pub use captcha::{CaptchaResolver, OcrSolverClient};
pub use mailbox::{Mailbox, TempMailClient};
pub use orchestrator::{EngineConfig, RegistrationEngine};
pub use sink::{CredentialSink, CsvSink};
pub use types::*;

/// Why a run ended in `RunState::Failed`. One kind per terminal outcome;
/// a stage whose retry budget is exhausted surfaces exactly one of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// Sign-up form could not be located, filled or submitted.
    FormSubmission,
    /// The browser session became unusable between stages.
    Browser,
    /// Captcha loop ran out of resolution attempts.
    CaptchaExhausted,
    /// No matching verification message before the deadline.
    VerificationTimeout,
    /// The site rejected the verification code/link, including the one
    /// documented re-poll.
    VerificationRejected,
    /// Dashboard never produced an API key within the bounded wait.
    KeyNotFound,
    /// Run-wide wall clock budget exceeded.
    RunTimeout,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::FormSubmission => "form_submission",
            FailureKind::Browser => "browser",
            FailureKind::CaptchaExhausted => "captcha_exhausted",
            FailureKind::VerificationTimeout => "verification_timeout",
            FailureKind::VerificationRejected => "verification_rejected",
            FailureKind::KeyNotFound => "key_not_found",
            FailureKind::RunTimeout => "run_timeout",
        };
        f.write_str(s)
    }
}

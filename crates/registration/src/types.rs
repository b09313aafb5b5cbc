use chrono::{DateTime, Utc};
use std::time::SystemTime;

use crate::FailureKind;

/// One end-to-end run of the sign-up flow. Created at orchestration start
/// and mutated only by the engine; terminal once `state` reaches `Done` or
/// `Failed`.
#[derive(Debug)]
pub struct RegistrationAttempt {
    pub candidate_email: String,
    pub candidate_password: String,
    pub started_at: DateTime<Utc>,
    pub state: RunState,
    pub counters: StageCounters,
    pub api_key: Option<String>,
    pub error: Option<String>,
    pub transitions: Vec<StateTransition>,
}

/// Stage the engine is currently in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    Init,
    FormSubmitted,
    CaptchaPending,
    AwaitingVerification,
    Verifying,
    KeyExtraction,
    Done,
    Failed(FailureKind),
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Failed(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            RunState::Init => "init",
            RunState::FormSubmitted => "form_submitted",
            RunState::CaptchaPending => "captcha_pending",
            RunState::AwaitingVerification => "awaiting_verification",
            RunState::Verifying => "verifying",
            RunState::KeyExtraction => "key_extraction",
            RunState::Done => "done",
            RunState::Failed(_) => "failed",
        }
    }
}

/// Per-stage attempt counters, kept for the run report.
#[derive(Debug, Default, Clone)]
pub struct StageCounters {
    pub form: u32,
    pub captcha: u32,
    pub mailbox_polls: u32,
    pub verify: u32,
    pub key: u32,
}

#[derive(Debug, Clone)]
pub struct StateTransition {
    pub from: &'static str,
    pub to: &'static str,
    pub at: SystemTime,
}

impl RegistrationAttempt {
    pub fn new(email: String, password: String) -> Self {
        Self {
            candidate_email: email,
            candidate_password: password,
            started_at: Utc::now(),
            state: RunState::Init,
            counters: StageCounters::default(),
            api_key: None,
            error: None,
            transitions: Vec::new(),
        }
    }

    /// Move to `next`, recording the edge. The engine logs each transition;
    /// this only keeps the trail for the run report.
    pub fn transition(&mut self, next: RunState) {
        let from = self.state.name();
        let to = next.name();
        self.state = next;
        self.transitions.push(StateTransition {
            from,
            to,
            at: SystemTime::now(),
        });
    }

    pub fn elapsed(&self) -> chrono::Duration {
        Utc::now() - self.started_at
    }
}

/// What a verification message carried: either a numeric code to type into
/// the form, or a link to follow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationToken {
    Code(String),
    Link(String),
}

/// A mailbox message that matched the verification predicate. Read-only
/// once parsed.
#[derive(Debug, Clone)]
pub struct VerificationMessage {
    pub id: String,
    pub received_at: DateTime<Utc>,
    pub token: VerificationToken,
}

/// Predicate and deadline for one verification wait.
#[derive(Debug, Clone)]
pub struct MailboxQuery {
    /// Address the message must be addressed to.
    pub recipient: String,
    /// Sender domain the message must come from (empty matches any).
    pub sender_domain: String,
    /// Messages received at or before this instant are stale leftovers
    /// from an earlier run and never match.
    pub received_after: DateTime<Utc>,
}

/// A challenge captured from the current page. Lives for one form
/// submission; the resolver owns it during resolution.
#[derive(Debug)]
pub struct CaptchaChallenge {
    pub image_png: Vec<u8>,
    pub page_url: String,
    pub resolution_attempts: u32,
}

/// The durable output row. Immutable once handed to the sink.
#[derive(Debug, Clone)]
pub struct Credential {
    pub email: String,
    pub password: String,
    pub api_key: String,
    pub created_at: DateTime<Utc>,
}

/// Final report returned by the engine.
#[derive(Debug)]
pub struct RunReport {
    pub attempt: RegistrationAttempt,
    pub credential: Option<Credential>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.attempt.state == RunState::Done
    }

    pub fn summary(&self) -> String {
        match (&self.attempt.state, &self.credential) {
            (RunState::Done, Some(cred)) => format!(
                "✓ registered {} in {}s (captcha rounds: {})",
                cred.email,
                self.attempt.elapsed().num_seconds(),
                self.attempt.counters.captcha,
            ),
            _ => format!(
                "✗ registration failed in state {}: {}",
                self.attempt.state.name(),
                self.attempt.error.as_deref().unwrap_or("unknown error"),
            ),
        }
    }
}

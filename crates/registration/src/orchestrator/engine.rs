use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::{error, info, warn};

use crate::browser::BrowserDriver;
use crate::captcha::{captcha_rejected, find_captcha_selector, has_password_input, CaptchaResolver};
use crate::identity;
use crate::mailbox::{most_recent, Mailbox};
use crate::sink::CredentialSink;
use crate::types::*;
use crate::FailureKind;
use tavreg_core::config::AppConfig;
use tavreg_core::RegisterError;

// Selector lists for the sign-up flow, most specific first. querySelector
// takes comma-separated groups, so each constant is a single locator.
const EMAIL_INPUT: &str =
    r#"#email, input[inputmode="email"][autocomplete="email"], input[name="email"]"#;
const PASSWORD_INPUT: &str = r#"#password, input[name="password"], input[type="password"]"#;
const CAPTCHA_INPUT: &str = r#"#captcha, input[name="captcha"]"#;
const CODE_INPUT: &str = r#"input[name="code"], #code"#;
const SUBMIT_BUTTON: &str =
    r#"button[type="submit"], button[data-action-button-primary="true"]"#;

// The dashboard exposes issued keys over its own API; reading it beats
// scraping an asynchronously rendered widget.
const API_KEY_JS: &str = r#"
(async () => {
    try {
        const response = await fetch('/api/keys');
        const data = await response.json();
        if (data && data.length > 0 && data[0].key && data[0].key.startsWith('tvly-')) {
            return data[0].key;
        }
    } catch (e) {}
    return null;
})()
"#;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub signup_url: String,
    pub dashboard_url: String,
    pub mail_sender_domain: String,
    /// Domain candidate addresses are generated on.
    pub mail_domain: String,
    pub max_retries: u32,
    pub retry_interval: Duration,
    pub verification_timeout: Duration,
    pub run_timeout: Duration,
    pub page_load_timeout: Duration,
}

impl EngineConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            signup_url: config.registration.signup_url.clone(),
            dashboard_url: config.registration.dashboard_url.clone(),
            mail_sender_domain: config.registration.mail_sender_domain.clone(),
            mail_domain: config.mailbox.domain.clone(),
            max_retries: config.retry.max_retries,
            retry_interval: Duration::from_secs(config.retry.retry_interval_secs),
            verification_timeout: Duration::from_secs(config.retry.verification_timeout_secs),
            run_timeout: Duration::from_secs(config.retry.run_timeout_secs),
            page_load_timeout: Duration::from_secs(config.browser.page_load_timeout_secs),
        }
    }
}

/// Sequences browser actions, captcha resolution and mailbox polling into
/// one registration run. The run is a sequential state machine: each stage
/// depends on the externally observed side effect of the previous one, so
/// nothing here fans out.
pub struct RegistrationEngine<B, M, C, S> {
    browser: B,
    mailbox: M,
    solver: C,
    sink: S,
    config: EngineConfig,
}

impl<B, M, C, S> RegistrationEngine<B, M, C, S>
where
    B: BrowserDriver,
    M: Mailbox,
    C: CaptchaResolver,
    S: CredentialSink,
{
    pub fn new(browser: B, mailbox: M, solver: C, sink: S, config: EngineConfig) -> Self {
        Self {
            browser,
            mailbox,
            solver,
            sink,
            config,
        }
    }

    /// Run one registration attempt end to end. Always terminates within
    /// the run budget; the browser session is released on every exit path.
    pub async fn run(&self) -> Result<RunReport, RegisterError> {
        let identity = identity::generate(&self.config.mail_domain);
        let mut attempt = RegistrationAttempt::new(identity.email, identity.password);

        info!(email = %attempt.candidate_email, "starting registration run");

        let driven = timeout(self.config.run_timeout, self.drive(&mut attempt)).await;

        self.browser.close().await;

        let report = match driven {
            Ok(Ok(credential)) => {
                self.sink.append(&credential)?;
                self.enter(&mut attempt, RunState::Done);
                attempt.api_key = Some(credential.api_key.clone());
                info!(
                    email = %credential.email,
                    elapsed_s = attempt.elapsed().num_seconds(),
                    "registration complete"
                );
                RunReport {
                    attempt,
                    credential: Some(credential),
                }
            }
            Ok(Err(kind)) => {
                if attempt.error.is_none() {
                    attempt.error = Some(kind.to_string());
                }
                error!(kind = %kind, stage = attempt.state.name(), "registration failed");
                self.enter(&mut attempt, RunState::Failed(kind));
                RunReport {
                    attempt,
                    credential: None,
                }
            }
            Err(_) => {
                attempt.error = Some(format!(
                    "run budget of {}s exceeded",
                    self.config.run_timeout.as_secs()
                ));
                error!(
                    budget_s = self.config.run_timeout.as_secs(),
                    stage = attempt.state.name(),
                    "run budget exceeded, aborting"
                );
                self.enter(&mut attempt, RunState::Failed(FailureKind::RunTimeout));
                RunReport {
                    attempt,
                    credential: None,
                }
            }
        };

        Ok(report)
    }

    async fn drive(&self, attempt: &mut RegistrationAttempt) -> Result<Credential, FailureKind> {
        self.submit_form(attempt).await?;
        self.pass_captcha(attempt).await?;
        self.verify_email(attempt).await?;
        let api_key = self.extract_key(attempt).await?;

        Ok(Credential {
            email: attempt.candidate_email.clone(),
            password: attempt.candidate_password.clone(),
            api_key,
            created_at: chrono::Utc::now(),
        })
    }

    fn enter(&self, attempt: &mut RegistrationAttempt, next: RunState) {
        info!(
            from = attempt.state.name(),
            to = next.name(),
            "stage transition"
        );
        attempt.transition(next);
    }

    /// Init → FormSubmitted: navigate to the sign-up page, fill the email
    /// field, submit. Transport failures are retried within this stage.
    async fn submit_form(&self, attempt: &mut RegistrationAttempt) -> Result<(), FailureKind> {
        for n in 1..=self.config.max_retries {
            attempt.counters.form = n;

            match self.try_submit_form(&attempt.candidate_email.clone()).await {
                Ok(()) => {
                    info!(attempt = n, outcome = "ok", "sign-up form submitted");
                    self.enter(attempt, RunState::FormSubmitted);
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt = n, error = %e, "form submission attempt failed");
                    attempt.error = Some(e.to_string());
                    // A dead browser will not recover on a retry
                    if !e.is_transient() {
                        return Err(FailureKind::FormSubmission);
                    }
                }
            }

            if n < self.config.max_retries {
                sleep(self.config.retry_interval).await;
            }
        }

        Err(FailureKind::FormSubmission)
    }

    async fn try_submit_form(&self, email: &str) -> Result<(), RegisterError> {
        self.browser
            .navigate(&self.config.signup_url, self.config.page_load_timeout)
            .await?;
        self.browser
            .wait_for(EMAIL_INPUT, self.config.page_load_timeout)
            .await?;
        self.browser.fill(EMAIL_INPUT, email).await?;
        self.browser.click(SUBMIT_BUTTON).await?;
        Ok(())
    }

    /// FormSubmitted → CaptchaPending, or a direct skip to the
    /// verification wait when no challenge is presented. A resolver
    /// failure counts as one loop iteration: a fresh challenge often
    /// resolves where the prior one did not.
    async fn pass_captcha(&self, attempt: &mut RegistrationAttempt) -> Result<(), FailureKind> {
        let html = match self.browser.page_html().await {
            Ok(html) => html,
            Err(e) => {
                // The form already went through; losing the page here is a
                // session failure, not a form one
                warn!(error = %e, "could not inspect page after submission");
                attempt.error = Some(e.to_string());
                return Err(FailureKind::Browser);
            }
        };

        let Some(selector) = find_captcha_selector(&html) else {
            info!("no captcha presented, skipping challenge stage");
            self.maybe_submit_password(attempt).await;
            return Ok(());
        };

        self.enter(attempt, RunState::CaptchaPending);

        for round in 1..=self.config.max_retries {
            attempt.counters.captcha = round;

            match self.captcha_round(selector, round).await {
                Ok(true) => {
                    info!(attempt = round, outcome = "accepted", "captcha passed");
                    self.maybe_submit_password(attempt).await;
                    return Ok(());
                }
                Ok(false) => {
                    warn!(attempt = round, outcome = "rejected", "captcha round failed")
                }
                Err(e) => warn!(attempt = round, error = %e, "captcha round errored"),
            }

            if round < self.config.max_retries {
                sleep(self.config.retry_interval).await;
            }
        }

        Err(FailureKind::CaptchaExhausted)
    }

    /// One challenge round: capture, resolve, type, submit, inspect.
    async fn captcha_round(&self, selector: &str, round: u32) -> Result<bool, RegisterError> {
        let image_png = self.browser.capture_png(selector).await?;
        let challenge = CaptchaChallenge {
            image_png,
            page_url: self.browser.current_url().await.unwrap_or_default(),
            resolution_attempts: round,
        };

        let token = self.solver.resolve(&challenge).await?;

        self.browser.fill(CAPTCHA_INPUT, &token).await?;
        self.browser.click(SUBMIT_BUTTON).await?;
        sleep(self.config.retry_interval).await;

        let html = self.browser.page_html().await?;
        if captcha_rejected(&html) {
            return Ok(false);
        }
        if has_password_input(&html) {
            return Ok(true);
        }
        // No explicit verdict either way; a still-present challenge image
        // means the page re-issued one
        Ok(find_captcha_selector(&html).is_none())
    }

    /// The password step renders after the challenge is accepted. Filling
    /// it is best effort: some variants of the flow collect the password
    /// on the first page instead.
    async fn maybe_submit_password(&self, attempt: &RegistrationAttempt) {
        let Ok(html) = self.browser.page_html().await else {
            return;
        };
        if !has_password_input(&html) {
            return;
        }

        let filled = self
            .browser
            .fill(PASSWORD_INPUT, &attempt.candidate_password)
            .await;
        match filled {
            Ok(()) => {
                if let Err(e) = self.browser.click(SUBMIT_BUTTON).await {
                    warn!(error = %e, "password submit click failed");
                } else {
                    info!("password step completed");
                }
            }
            Err(e) => warn!(error = %e, "password fill failed"),
        }
    }

    /// AwaitingVerification → Verifying, with the single documented retry
    /// of the pair: a rejected code usually means a resend landed after we
    /// read the mailbox, so one more poll round is worth it.
    async fn verify_email(&self, attempt: &mut RegistrationAttempt) -> Result<(), FailureKind> {
        for round in 1..=2u32 {
            self.enter(attempt, RunState::AwaitingVerification);

            let Some(message) = self.poll_mailbox(attempt).await else {
                return Err(FailureKind::VerificationTimeout);
            };

            self.enter(attempt, RunState::Verifying);
            attempt.counters.verify = round;

            match self.apply_verification(&message).await {
                Ok(true) => {
                    info!(attempt = round, outcome = "ok", "verification accepted");
                    self.mailbox.cleanup(&message.id).await;
                    return Ok(());
                }
                Ok(false) => {
                    warn!(attempt = round, outcome = "rejected", "verification rejected")
                }
                Err(e) => warn!(attempt = round, error = %e, "verification apply failed"),
            }
        }

        Err(FailureKind::VerificationRejected)
    }

    /// Poll the mailbox at the configured cadence until a qualifying
    /// message arrives or the deadline passes. Matching is re-done here on
    /// each poll so a late resend supersedes an earlier match.
    async fn poll_mailbox(&self, attempt: &mut RegistrationAttempt) -> Option<VerificationMessage> {
        let query = MailboxQuery {
            recipient: attempt.candidate_email.clone(),
            sender_domain: self.config.mail_sender_domain.clone(),
            received_after: attempt.started_at,
        };
        let deadline = Instant::now() + self.config.verification_timeout;

        loop {
            attempt.counters.mailbox_polls += 1;

            match self.mailbox.fetch(&query).await {
                Ok(messages) => {
                    if let Some(message) = most_recent(&messages, attempt.started_at) {
                        info!(
                            polls = attempt.counters.mailbox_polls,
                            id = %message.id,
                            "verification message matched"
                        );
                        return Some(message);
                    }
                }
                Err(e) => warn!(error = %e, "mailbox poll failed"),
            }

            if Instant::now() >= deadline {
                warn!(
                    polls = attempt.counters.mailbox_polls,
                    deadline_s = self.config.verification_timeout.as_secs(),
                    "no verification message before deadline"
                );
                return None;
            }

            sleep(self.config.retry_interval).await;
        }
    }

    /// Apply the extracted code or link and confirm by page state.
    async fn apply_verification(
        &self,
        message: &VerificationMessage,
    ) -> Result<bool, RegisterError> {
        match &message.token {
            VerificationToken::Code(code) => {
                self.browser
                    .wait_for(CODE_INPUT, self.config.page_load_timeout)
                    .await?;
                self.browser.fill(CODE_INPUT, code).await?;
                self.browser.click(SUBMIT_BUTTON).await?;
                sleep(self.config.retry_interval).await;
            }
            VerificationToken::Link(link) => {
                self.browser
                    .navigate(link, self.config.page_load_timeout)
                    .await?;
            }
        }

        let url = self.browser.current_url().await.unwrap_or_default();
        if url.contains("home") || url.contains("dashboard") {
            return Ok(true);
        }

        // Still on the code form means the site rejected the token
        let html = self.browser.page_html().await?;
        Ok(!html.contains(r#"name="code""#))
    }

    /// KeyExtraction: the dashboard renders asynchronously, so reading the
    /// key gets a bounded wait of its own.
    async fn extract_key(&self, attempt: &mut RegistrationAttempt) -> Result<String, FailureKind> {
        self.enter(attempt, RunState::KeyExtraction);

        let mut navigated = false;
        for n in 1..=self.config.max_retries {
            attempt.counters.key = n;

            if !navigated {
                match self
                    .browser
                    .navigate(&self.config.dashboard_url, self.config.page_load_timeout)
                    .await
                {
                    Ok(()) => navigated = true,
                    Err(e) => {
                        warn!(attempt = n, error = %e, "dashboard navigation failed");
                        if n < self.config.max_retries {
                            sleep(self.config.retry_interval).await;
                        }
                        continue;
                    }
                }
            }

            match self.browser.evaluate(API_KEY_JS).await {
                Ok(Some(key)) if key.starts_with("tvly-") => {
                    info!(attempt = n, outcome = "ok", "api key extracted");
                    return Ok(key);
                }
                Ok(_) => info!(attempt = n, "api key not ready yet"),
                Err(e) => warn!(attempt = n, error = %e, "api key read failed"),
            }

            if n < self.config.max_retries {
                sleep(self.config.retry_interval).await;
            }
        }

        Err(FailureKind::KeyNotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    const PLAIN_FORM: &str =
        r#"<form><input id="email"><button type="submit">Continue</button></form>"#;
    const CAPTCHA_PAGE: &str =
        r#"<form><img alt="captcha" src="data:image/svg+xml;base64,x"><input id="captcha"></form>"#;
    const REJECTED_PAGE: &str =
        r#"<div role="alert">Wrong code</div><form><img alt="captcha" src="x"></form>"#;
    const PASSWORD_PAGE: &str = r#"<form><input id="password" type="password"></form>"#;
    const CODE_PAGE: &str = r#"<form><input name="code"><button type="submit"></button></form>"#;

    #[derive(Clone, Default)]
    struct StubBrowser {
        state: Arc<BrowserState>,
    }

    #[derive(Default)]
    struct BrowserState {
        htmls: Mutex<VecDeque<String>>,
        current_url: Mutex<String>,
        api_key: Mutex<Option<String>>,
        eval_calls: AtomicU32,
        navigations: Mutex<Vec<String>>,
        fills: Mutex<Vec<(String, String)>>,
        hang_on_navigate: AtomicBool,
        fail_navigate: AtomicBool,
        fail_wait_for: AtomicBool,
        fail_page_html: AtomicBool,
        closed: AtomicBool,
    }

    impl StubBrowser {
        fn with_htmls(htmls: &[&str]) -> Self {
            let stub = Self::default();
            *stub.state.htmls.lock().unwrap() =
                htmls.iter().map(|h| h.to_string()).collect();
            stub
        }

        fn url(self, url: &str) -> Self {
            *self.state.current_url.lock().unwrap() = url.to_string();
            self
        }

        fn key(self, key: &str) -> Self {
            *self.state.api_key.lock().unwrap() = Some(key.to_string());
            self
        }

        fn hanging(self) -> Self {
            self.state.hang_on_navigate.store(true, Ordering::SeqCst);
            self
        }

        fn failing_navigate(self) -> Self {
            self.state.fail_navigate.store(true, Ordering::SeqCst);
            self
        }

        fn failing_wait_for(self) -> Self {
            self.state.fail_wait_for.store(true, Ordering::SeqCst);
            self
        }

        fn failing_page_html(self) -> Self {
            self.state.fail_page_html.store(true, Ordering::SeqCst);
            self
        }

        fn filled(&self, selector: &str) -> Vec<String> {
            self.state
                .fills
                .lock()
                .unwrap()
                .iter()
                .filter(|(sel, _)| sel == selector)
                .map(|(_, v)| v.clone())
                .collect()
        }
    }

    #[async_trait]
    impl BrowserDriver for StubBrowser {
        async fn navigate(&self, url: &str, _timeout: Duration) -> Result<(), RegisterError> {
            self.state.navigations.lock().unwrap().push(url.to_string());
            if self.state.fail_navigate.load(Ordering::SeqCst) {
                return Err(RegisterError::Browser("chrome exited".to_string()));
            }
            if self.state.hang_on_navigate.load(Ordering::SeqCst) {
                sleep(Duration::from_secs(100_000)).await;
            }
            Ok(())
        }

        async fn fill(&self, selector: &str, value: &str) -> Result<(), RegisterError> {
            self.state
                .fills
                .lock()
                .unwrap()
                .push((selector.to_string(), value.to_string()));
            Ok(())
        }

        async fn click(&self, _selector: &str) -> Result<(), RegisterError> {
            Ok(())
        }

        async fn wait_for(
            &self,
            selector: &str,
            _timeout: Duration,
        ) -> Result<(), RegisterError> {
            if self.state.fail_wait_for.load(Ordering::SeqCst) {
                return Err(RegisterError::ElementNotFound(selector.to_string()));
            }
            Ok(())
        }

        async fn page_html(&self) -> Result<String, RegisterError> {
            if self.state.fail_page_html.load(Ordering::SeqCst) {
                return Err(RegisterError::Browser("tab lost".to_string()));
            }
            let mut htmls = self.state.htmls.lock().unwrap();
            if htmls.len() > 1 {
                Ok(htmls.pop_front().unwrap())
            } else {
                Ok(htmls.front().cloned().unwrap_or_default())
            }
        }

        async fn current_url(&self) -> Result<String, RegisterError> {
            Ok(self.state.current_url.lock().unwrap().clone())
        }

        async fn evaluate(&self, _js: &str) -> Result<Option<String>, RegisterError> {
            self.state.eval_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.state.api_key.lock().unwrap().clone())
        }

        async fn capture_png(&self, _selector: &str) -> Result<Vec<u8>, RegisterError> {
            Ok(vec![0u8; 8])
        }

        async fn close(&self) {
            self.state.closed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Clone, Default)]
    struct StubMailbox {
        state: Arc<MailboxState>,
    }

    #[derive(Default)]
    struct MailboxState {
        messages: Mutex<Vec<VerificationMessage>>,
        polls: AtomicU32,
        cleaned: Mutex<Vec<String>>,
    }

    impl StubMailbox {
        fn with_messages(messages: Vec<VerificationMessage>) -> Self {
            let stub = Self::default();
            *stub.state.messages.lock().unwrap() = messages;
            stub
        }
    }

    #[async_trait]
    impl Mailbox for StubMailbox {
        async fn fetch(
            &self,
            _query: &MailboxQuery,
        ) -> Result<Vec<VerificationMessage>, RegisterError> {
            self.state.polls.fetch_add(1, Ordering::SeqCst);
            Ok(self.state.messages.lock().unwrap().clone())
        }

        async fn cleanup(&self, message_id: &str) -> bool {
            self.state
                .cleaned
                .lock()
                .unwrap()
                .push(message_id.to_string());
            true
        }
    }

    #[derive(Clone, Default)]
    struct StubResolver {
        state: Arc<ResolverState>,
    }

    #[derive(Default)]
    struct ResolverState {
        outcomes: Mutex<VecDeque<Option<String>>>,
        calls: AtomicU32,
    }

    impl StubResolver {
        /// `Some(token)` resolves, `None` fails with `CaptchaUnresolved`.
        fn with_outcomes(outcomes: &[Option<&str>]) -> Self {
            let stub = Self::default();
            *stub.state.outcomes.lock().unwrap() = outcomes
                .iter()
                .map(|o| o.map(|s| s.to_string()))
                .collect();
            stub
        }

        fn calls(&self) -> u32 {
            self.state.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CaptchaResolver for StubResolver {
        async fn resolve(
            &self,
            _challenge: &CaptchaChallenge,
        ) -> Result<String, RegisterError> {
            self.state.calls.fetch_add(1, Ordering::SeqCst);
            match self.state.outcomes.lock().unwrap().pop_front().flatten() {
                Some(token) => Ok(token),
                None => Err(RegisterError::CaptchaUnresolved(3)),
            }
        }
    }

    #[derive(Clone, Default)]
    struct MemSink {
        rows: Arc<Mutex<Vec<Credential>>>,
    }

    impl CredentialSink for MemSink {
        fn append(&self, credential: &Credential) -> Result<(), RegisterError> {
            self.rows.lock().unwrap().push(credential.clone());
            Ok(())
        }
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            signup_url: "https://app.tavily.com/sign-up".to_string(),
            dashboard_url: "https://app.tavily.com/home".to_string(),
            mail_sender_domain: "tavily.com".to_string(),
            mail_domain: "mailto.plus".to_string(),
            max_retries: 3,
            retry_interval: Duration::from_secs(1),
            verification_timeout: Duration::from_secs(300),
            run_timeout: Duration::from_secs(600),
            page_load_timeout: Duration::from_secs(5),
        }
    }

    fn code_message(id: &str, code: &str, offset_secs: i64) -> VerificationMessage {
        VerificationMessage {
            id: id.to_string(),
            received_at: Utc::now() + chrono::Duration::seconds(offset_secs),
            token: VerificationToken::Code(code.to_string()),
        }
    }

    fn visited(attempt: &RegistrationAttempt, stage: &str) -> usize {
        attempt.transitions.iter().filter(|t| t.to == stage).count()
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_persists_credential() {
        let browser = StubBrowser::with_htmls(&[PLAIN_FORM])
            .url("https://app.tavily.com/home")
            .key("tvly-abc123");
        let mailbox = StubMailbox::with_messages(vec![code_message("m1", "482913", 5)]);
        let sink = MemSink::default();

        let engine = RegistrationEngine::new(
            browser.clone(),
            mailbox.clone(),
            StubResolver::default(),
            sink.clone(),
            test_config(),
        );
        let report = engine.run().await.unwrap();

        assert!(report.is_success());
        assert_eq!(report.attempt.state, RunState::Done);

        let rows = sink.rows.lock().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].api_key, "tvly-abc123");
        assert_eq!(rows[0].email, report.attempt.candidate_email);

        // no captcha was presented, the stage was skipped entirely
        assert_eq!(visited(&report.attempt, "captcha_pending"), 0);
        assert_eq!(browser.filled(CODE_INPUT), vec!["482913"]);
        assert!(browser.state.closed.load(Ordering::SeqCst));
        assert_eq!(mailbox.state.cleaned.lock().unwrap().as_slice(), ["m1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn captcha_rejections_do_not_abort_the_loop() {
        let browser = StubBrowser::with_htmls(&[
            CAPTCHA_PAGE,
            REJECTED_PAGE,
            REJECTED_PAGE,
            PASSWORD_PAGE,
        ])
        .url("https://app.tavily.com/home")
        .key("tvly-abc123");
        let mailbox = StubMailbox::with_messages(vec![code_message("m1", "482913", 5)]);
        let resolver =
            StubResolver::with_outcomes(&[Some("TOK1A1"), Some("TOK2B2"), Some("TOK3C3")]);
        let sink = MemSink::default();

        let engine = RegistrationEngine::new(
            browser.clone(),
            mailbox,
            resolver.clone(),
            sink.clone(),
            test_config(),
        );
        let report = engine.run().await.unwrap();

        assert!(report.is_success());
        assert_eq!(resolver.calls(), 3);
        assert_eq!(report.attempt.counters.captcha, 3);
        assert_eq!(visited(&report.attempt, "captcha_pending"), 1);
        assert_eq!(visited(&report.attempt, "awaiting_verification"), 1);
        // the password step rendered after acceptance and was filled
        assert_eq!(browser.filled(PASSWORD_INPUT).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn captcha_budget_exhaustion_is_terminal() {
        let browser = StubBrowser::with_htmls(&[CAPTCHA_PAGE]);
        let resolver = StubResolver::default(); // never resolves
        let sink = MemSink::default();

        let engine = RegistrationEngine::new(
            browser,
            StubMailbox::default(),
            resolver.clone(),
            sink.clone(),
            test_config(),
        );
        let started = Instant::now();
        let report = engine.run().await.unwrap();

        assert_eq!(
            report.attempt.state,
            RunState::Failed(FailureKind::CaptchaExhausted)
        );
        assert_eq!(resolver.calls(), 3);
        assert!(sink.rows.lock().unwrap().is_empty());
        // only the two between-round waits elapse, none after the last
        assert!(started.elapsed() <= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn dead_browser_fails_the_form_stage_without_retries() {
        let browser = StubBrowser::with_htmls(&[PLAIN_FORM]).failing_navigate();

        let engine = RegistrationEngine::new(
            browser,
            StubMailbox::default(),
            StubResolver::default(),
            MemSink::default(),
            test_config(),
        );
        let report = engine.run().await.unwrap();

        assert_eq!(
            report.attempt.state,
            RunState::Failed(FailureKind::FormSubmission)
        );
        assert_eq!(report.attempt.counters.form, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_form_field_is_retried_to_the_budget() {
        let browser = StubBrowser::with_htmls(&[PLAIN_FORM]).failing_wait_for();

        let engine = RegistrationEngine::new(
            browser,
            StubMailbox::default(),
            StubResolver::default(),
            MemSink::default(),
            test_config(),
        );
        let started = Instant::now();
        let report = engine.run().await.unwrap();

        assert_eq!(
            report.attempt.state,
            RunState::Failed(FailureKind::FormSubmission)
        );
        assert_eq!(report.attempt.counters.form, 3);
        assert!(started.elapsed() <= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn page_loss_after_submission_is_a_browser_failure() {
        let browser = StubBrowser::with_htmls(&[PLAIN_FORM]).failing_page_html();

        let engine = RegistrationEngine::new(
            browser.clone(),
            StubMailbox::default(),
            StubResolver::default(),
            MemSink::default(),
            test_config(),
        );
        let report = engine.run().await.unwrap();

        // the form went through; the session loss must not blame it
        assert_eq!(
            report.attempt.state,
            RunState::Failed(FailureKind::Browser)
        );
        assert_eq!(visited(&report.attempt, "form_submitted"), 1);
        assert!(browser.state.closed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn mailbox_deadline_produces_verification_timeout() {
        let browser = StubBrowser::with_htmls(&[PLAIN_FORM]);
        let mailbox = StubMailbox::default(); // never matches

        let mut config = test_config();
        config.verification_timeout = Duration::from_secs(2);

        let engine = RegistrationEngine::new(
            browser.clone(),
            mailbox.clone(),
            StubResolver::default(),
            MemSink::default(),
            config,
        );

        let started = Instant::now();
        let report = engine.run().await.unwrap();

        assert_eq!(
            report.attempt.state,
            RunState::Failed(FailureKind::VerificationTimeout)
        );
        // deadline respected: ~2s of virtual time, not the run budget
        assert!(started.elapsed() <= Duration::from_secs(4));
        assert!(mailbox.state.polls.load(Ordering::SeqCst) >= 2);
        assert!(browser.state.closed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn run_budget_bounds_total_elapsed_time() {
        let browser = StubBrowser::with_htmls(&[PLAIN_FORM]).hanging();

        let mut config = test_config();
        config.run_timeout = Duration::from_secs(5);

        let engine = RegistrationEngine::new(
            browser.clone(),
            StubMailbox::default(),
            StubResolver::default(),
            MemSink::default(),
            config,
        );

        let started = Instant::now();
        let report = engine.run().await.unwrap();

        assert_eq!(
            report.attempt.state,
            RunState::Failed(FailureKind::RunTimeout)
        );
        assert!(started.elapsed() <= Duration::from_secs(6));
        assert!(browser.state.closed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn verifying_gets_exactly_one_retry_of_the_pair() {
        // url never reaches the dashboard and the code form persists, so
        // every apply attempt reads as rejected
        let browser = StubBrowser::with_htmls(&[PLAIN_FORM, CODE_PAGE])
            .url("https://app.tavily.com/verify");
        let mailbox = StubMailbox::with_messages(vec![code_message("m1", "482913", 5)]);

        let engine = RegistrationEngine::new(
            browser,
            mailbox,
            StubResolver::default(),
            MemSink::default(),
            test_config(),
        );
        let report = engine.run().await.unwrap();

        assert_eq!(
            report.attempt.state,
            RunState::Failed(FailureKind::VerificationRejected)
        );
        assert_eq!(report.attempt.counters.verify, 2);
        assert_eq!(visited(&report.attempt, "awaiting_verification"), 2);
        assert_eq!(visited(&report.attempt, "verifying"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn resend_supersedes_earlier_match() {
        let browser = StubBrowser::with_htmls(&[PLAIN_FORM])
            .url("https://app.tavily.com/home")
            .key("tvly-abc123");
        let mailbox = StubMailbox::with_messages(vec![
            code_message("t1", "111111", 5),
            code_message("t2", "222222", 10),
        ]);

        let engine = RegistrationEngine::new(
            browser.clone(),
            mailbox.clone(),
            StubResolver::default(),
            MemSink::default(),
            test_config(),
        );
        let report = engine.run().await.unwrap();

        assert!(report.is_success());
        assert_eq!(browser.filled(CODE_INPUT), vec!["222222"]);
        assert_eq!(mailbox.state.cleaned.lock().unwrap().as_slice(), ["t2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn every_run_reaches_exactly_one_terminal_state() {
        let scenarios: Vec<(StubBrowser, StubMailbox, StubResolver)> = vec![
            // success
            (
                StubBrowser::with_htmls(&[PLAIN_FORM])
                    .url("https://app.tavily.com/home")
                    .key("tvly-abc123"),
                StubMailbox::with_messages(vec![code_message("m", "482913", 5)]),
                StubResolver::default(),
            ),
            // captcha exhaustion
            (
                StubBrowser::with_htmls(&[CAPTCHA_PAGE]),
                StubMailbox::default(),
                StubResolver::default(),
            ),
            // verification timeout
            (
                StubBrowser::with_htmls(&[PLAIN_FORM]),
                StubMailbox::default(),
                StubResolver::default(),
            ),
        ];

        for (browser, mailbox, resolver) in scenarios {
            let mut config = test_config();
            config.verification_timeout = Duration::from_secs(2);

            let engine =
                RegistrationEngine::new(browser, mailbox, resolver, MemSink::default(), config);
            let report = engine.run().await.unwrap();

            assert!(report.attempt.state.is_terminal());
            let terminal_entries = report
                .attempt
                .transitions
                .iter()
                .filter(|t| t.to == "done" || t.to == "failed")
                .count();
            assert_eq!(terminal_entries, 1);
        }
    }
}

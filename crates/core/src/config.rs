use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub registration: RegistrationConfig,
    pub mailbox: MailboxConfig,
    pub browser: BrowserConfig,
    pub captcha: CaptchaConfig,
    pub retry: RetryConfig,
    pub sink: SinkConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RegistrationConfig {
    pub signup_url: String,
    pub dashboard_url: String,
    /// Sender domain verification mail is expected from.
    pub mail_sender_domain: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MailboxConfig {
    /// Temp-mail HTTP API base, e.g. "https://tempmail.plus/api".
    pub api_url: String,
    /// Mailbox local part (the alias messages are addressed to).
    pub alias: String,
    /// Mail domain appended to generated local parts.
    pub domain: String,
    /// API access PIN, empty when the service needs none.
    #[serde(default)]
    pub epin: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BrowserConfig {
    #[serde(default = "default_headless")]
    pub headless: bool,
    #[serde(default = "default_window_width")]
    pub window_width: u32,
    #[serde(default = "default_window_height")]
    pub window_height: u32,
    pub user_agent: String,
    #[serde(default = "default_page_load")]
    pub page_load_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CaptchaConfig {
    /// OCR service endpoint the challenge image is posted to.
    pub solver_url: String,
    #[serde(default = "default_solver_attempts")]
    pub solver_attempts: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,
    #[serde(default = "default_verification_timeout")]
    pub verification_timeout_secs: u64,
    #[serde(default = "default_run_timeout")]
    pub run_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SinkConfig {
    pub csv_path: String,
}

fn default_headless() -> bool { true }
fn default_window_width() -> u32 { 1920 }
fn default_window_height() -> u32 { 1080 }
fn default_page_load() -> u64 { 30 }
fn default_solver_attempts() -> u32 { 3 }
fn default_max_retries() -> u32 { 3 }
fn default_retry_interval() -> u64 { 5 }
fn default_verification_timeout() -> u64 { 300 }
fn default_run_timeout() -> u64 { 600 }

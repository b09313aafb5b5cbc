use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::time::Duration;
use tracing::{info, warn};

use crate::types::CaptchaChallenge;
use tavreg_core::RegisterError;

/// Resolves one captured challenge into the token to type into the form.
/// Implementations bound their own internal attempts and fail with
/// `CaptchaUnresolved`; the engine treats that as one captcha-loop
/// iteration, not an abort.
#[async_trait]
pub trait CaptchaResolver: Send + Sync {
    async fn resolve(&self, challenge: &CaptchaChallenge) -> Result<String, RegisterError>;
}

/// Client for a remote OCR service: POST the challenge PNG, read back the
/// recognized text.
pub struct OcrSolverClient {
    client: reqwest::Client,
    solver_url: String,
    max_attempts: u32,
}

impl OcrSolverClient {
    pub fn new(solver_url: String, max_attempts: u32) -> Result<Self, RegisterError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| RegisterError::Other(e.into()))?;
        Ok(Self {
            client,
            solver_url,
            max_attempts,
        })
    }

    async fn recognize(&self, image: &[u8]) -> Result<String, RegisterError> {
        let response = self
            .client
            .post(&self.solver_url)
            .header("content-type", "image/png")
            .body(image.to_vec())
            .send()
            .await
            .map_err(|e| RegisterError::Other(e.into()))?;

        if !response.status().is_success() {
            return Err(RegisterError::Other(anyhow::anyhow!(
                "ocr service returned HTTP {}",
                response.status()
            )));
        }

        let body: OcrResponse = response
            .json()
            .await
            .map_err(|e| RegisterError::Other(e.into()))?;

        Ok(body.text)
    }
}

#[derive(Debug, Deserialize)]
struct OcrResponse {
    text: String,
}

#[async_trait]
impl CaptchaResolver for OcrSolverClient {
    async fn resolve(&self, challenge: &CaptchaChallenge) -> Result<String, RegisterError> {
        for attempt in 1..=self.max_attempts {
            match self.recognize(&challenge.image_png).await {
                Ok(raw) => {
                    let token = filter_token(&raw);
                    info!(attempt, raw = %raw, token = %token, "ocr result");

                    if token.len() == 6 {
                        return Ok(token);
                    }
                    // The site uses 6-char challenges; anything else is a
                    // misread worth one more pass
                    warn!(attempt, len = token.len(), "token has unexpected length");
                }
                Err(e) => warn!(attempt, error = %e, "ocr request failed"),
            }
        }

        Err(RegisterError::CaptchaUnresolved(self.max_attempts))
    }
}

/// Keep only alphanumerics from the raw OCR output.
pub fn filter_token(raw: &str) -> String {
    raw.chars().filter(|c| c.is_alphanumeric()).collect()
}

/// Find the CSS selector of a captcha image on the page, if one is
/// presented. Tavily renders an inline SVG challenge; the generic patterns
/// cover image captchas elsewhere.
pub fn find_captcha_selector(html: &str) -> Option<&'static str> {
    let patterns: [(&str, &str); 3] = [
        (r#"<img[^>]+alt="captcha""#, r#"img[alt="captcha"]"#),
        (r#"<img[^>]+src="[^"]*captcha[^"]*""#, r#"img[src*="captcha"]"#),
        (r#"<img[^>]+src="[^"]*image/svg\+xml[^"]*""#, r#"img[src*="svg"]"#),
    ];

    for (pattern, selector) in patterns {
        if let Ok(re) = Regex::new(pattern) {
            if re.is_match(html) {
                return Some(selector);
            }
        }
    }

    None
}

/// Visible error marker after a token submission means the challenge was
/// rejected.
pub fn captcha_rejected(html: &str) -> bool {
    let html_lower = html.to_lowercase();

    html_lower.contains(r#"role="alert""#)
        || html_lower.contains("error-message")
        || html_lower.contains("text-error")
}

/// The password step rendering is the acceptance signal for the challenge.
pub fn has_password_input(html: &str) -> bool {
    let html_lower = html.to_lowercase();

    html_lower.contains(r##"id="password""##) || html_lower.contains(r#"type="password""#)
}

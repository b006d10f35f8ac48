//! CAPTCHA verification against a Turnstile-compatible `siteverify` endpoint.
//!
//! A CAPTCHA is an anti-abuse gate, so callers treat any error here as a hard
//! failure of the request rather than letting it through.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const TURNSTILE_VERIFY_URL: &str = "https://challenges.cloudflare.com/turnstile/v0/siteverify";

/// Verdict returned by the verification endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CaptchaOutcome {
    pub success: bool,
    #[serde(default, rename = "error-codes")]
    pub error_codes: Vec<String>,
}

#[derive(Debug, Error)]
pub enum CaptchaError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("verifier responded with HTTP {0}")]
    Status(u16),
}

#[async_trait]
pub trait CaptchaVerifier: Send + Sync {
    async fn verify(&self, token: &str, remote_ip: &str) -> Result<CaptchaOutcome, CaptchaError>;
}

#[derive(Serialize)]
struct VerifyRequest<'a> {
    secret: &'a str,
    response: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    remoteip: Option<&'a str>,
}

/// HTTP verifier with a bounded request timeout.
#[derive(Clone)]
pub struct TurnstileVerifier {
    client: reqwest::Client,
    secret: String,
    verify_url: String,
}

impl TurnstileVerifier {
    pub fn new(secret: String, verify_url: String, timeout: Duration) -> Result<Self, CaptchaError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            secret,
            verify_url,
        })
    }
}

#[async_trait]
impl CaptchaVerifier for TurnstileVerifier {
    async fn verify(&self, token: &str, remote_ip: &str) -> Result<CaptchaOutcome, CaptchaError> {
        let resp = self
            .client
            .post(&self.verify_url)
            .json(&VerifyRequest {
                secret: &self.secret,
                response: token,
                remoteip: (!remote_ip.is_empty()).then_some(remote_ip),
            })
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(CaptchaError::Status(status.as_u16()));
        }
        let outcome: CaptchaOutcome = resp.json().await?;
        if !outcome.success {
            debug!(codes = ?outcome.error_codes, "captcha rejected");
        }
        Ok(outcome)
    }
}

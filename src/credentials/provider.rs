use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::institutions::Institution;

/// What the institution's authentication endpoint said about a credential
/// pair. Transport failures are folded into a failed outcome; callers never
/// see a transport error from this boundary.
#[derive(Debug, Clone)]
pub struct ProviderOutcome {
    pub success: bool,
    pub message: String,
}

impl ProviderOutcome {
    fn failure(message: &str) -> Self {
        Self {
            success: false,
            message: message.to_string(),
        }
    }
}

/// External authentication provider consumed by the credential validator.
#[async_trait]
pub trait MoodleAuthProvider: Send + Sync {
    async fn authenticate(
        &self,
        username: &str,
        password: &str,
        institution: &'static Institution,
    ) -> ProviderOutcome;
}

/// Talks to the institution's real Moodle login endpoint.
///
/// The classification here is deliberately shallow: it answers "did these
/// credentials open a session" and nothing more. Full scrape handling lives
/// in the scraping service.
pub struct HttpMoodleProvider {
    http: reqwest::Client,
}

impl HttpMoodleProvider {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .cookie_store(true)
            .build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl MoodleAuthProvider for HttpMoodleProvider {
    async fn authenticate(
        &self,
        username: &str,
        password: &str,
        institution: &'static Institution,
    ) -> ProviderOutcome {
        let login_url = format!("{}/login/index.php", institution.moodle_url);

        let response = self
            .http
            .post(&login_url)
            .form(&[("username", username), ("password", password)])
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                debug!(institution = institution.id, "moodle login timed out");
                return ProviderOutcome::failure("connection timeout");
            }
            Err(e) => {
                debug!(institution = institution.id, error = %e, "moodle login transport error");
                return ProviderOutcome::failure("university system unreachable");
            }
        };

        if !response.status().is_success() {
            return ProviderOutcome::failure("university system unavailable");
        }

        let body = match response.text().await {
            Ok(b) => b,
            Err(_) => return ProviderOutcome::failure("university system returned an unreadable response"),
        };

        if body.contains("loginerrormsg") || body.contains("Invalid login") {
            return ProviderOutcome::failure("invalid credentials");
        }
        if body.contains("logout.php") {
            return ProviderOutcome {
                success: true,
                message: "authenticated".into(),
            };
        }

        ProviderOutcome::failure("could not confirm a Moodle session")
    }
}

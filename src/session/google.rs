use async_trait::async_trait;
use serde::Deserialize;

/// Identity asserted by the external identity provider after verifying the
/// client-supplied ID token.
#[derive(Debug, Clone)]
pub struct VerifiedIdentity {
    pub email: String,
    pub subject: String,
}

/// Boundary for the stage-1 identity provider. The production
/// implementation asks Google's tokeninfo endpoint; tests substitute fakes.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, id_token: &str) -> anyhow::Result<VerifiedIdentity>;
}

pub struct GoogleTokenVerifier {
    http: reqwest::Client,
    tokeninfo_url: String,
}

#[derive(Debug, Deserialize)]
struct TokenInfo {
    email: String,
    sub: String,
    email_verified: Option<String>,
}

impl GoogleTokenVerifier {
    pub fn new(tokeninfo_url: String) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            tokeninfo_url,
        })
    }
}

#[async_trait]
impl IdentityVerifier for GoogleTokenVerifier {
    async fn verify(&self, id_token: &str) -> anyhow::Result<VerifiedIdentity> {
        let response = self
            .http
            .get(&self.tokeninfo_url)
            .query(&[("id_token", id_token)])
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!("identity provider rejected the token");
        }

        let info: TokenInfo = response.json().await?;
        if info.email_verified.as_deref() != Some("true") {
            anyhow::bail!("identity provider email is not verified");
        }

        Ok(VerifiedIdentity {
            email: info.email,
            subject: info.sub,
        })
    }
}

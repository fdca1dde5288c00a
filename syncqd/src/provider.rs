use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use syncq::token::{CredentialError, Credentials, TokenProvider};

/// Obtains access tokens with the OAuth2 client credentials grant.
#[derive(Debug, Clone)]
pub struct HttpTokenProvider {
    client: reqwest::Client,
    token_url: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

impl HttpTokenProvider {
    pub fn new(token_url: impl Into<String>, timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("syncqd/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            token_url: token_url.into(),
        })
    }
}

fn rejected(status: StatusCode) -> bool {
    matches!(status, StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN)
}

#[async_trait]
impl TokenProvider for HttpTokenProvider {
    async fn refresh(&self, credentials: &Credentials) -> Result<String, CredentialError> {
        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", credentials.client_id.as_str()),
                ("client_secret", credentials.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|error| CredentialError::Unavailable(error.to_string()))?;

        let status = response.status();
        if rejected(status) {
            let body = response.text().await.unwrap_or_default();
            return Err(CredentialError::Rejected(format!("{status}: {}", body.trim())));
        }
        if !status.is_success() {
            return Err(CredentialError::Unavailable(status.to_string()));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|error| CredentialError::Unavailable(format!("malformed token response: {error}")))?;
        Ok(token.access_token)
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;
    use crate::test_server::TestServer;

    fn credentials() -> Credentials {
        Credentials {
            client_id: "syncqd".to_owned(),
            client_secret: "s3cret".to_owned(),
        }
    }

    #[tokio::test]
    async fn returns_access_token() {
        let mut server = TestServer::start(
            StatusCode::OK,
            r#"{"access_token":"token-1","token_type":"Bearer","expires_in":3600}"#,
        )
        .await;
        let provider = HttpTokenProvider::new(&server.url, Duration::from_secs(5)).unwrap();

        let token = provider.refresh(&credentials()).await.unwrap();

        assert_eq!(token, "token-1");
        let request = server.request().await;
        assert_eq!(request.method, reqwest::Method::POST);
        assert_eq!(request.path, "/");
        assert_eq!(
            request.header("content-type"),
            Some("application/x-www-form-urlencoded")
        );
        assert!(request.body.contains("grant_type=client_credentials"));
        assert!(request.body.contains("client_secret=s3cret"));
    }

    #[tokio::test]
    async fn invalid_client_is_rejected() {
        let server =
            TestServer::start(StatusCode::UNAUTHORIZED, r#"{"error":"invalid_client"}"#).await;
        let provider = HttpTokenProvider::new(&server.url, Duration::from_secs(5)).unwrap();

        assert_matches!(
            provider.refresh(&credentials()).await,
            Err(CredentialError::Rejected(reason)) if reason.contains("invalid_client")
        );
    }

    #[tokio::test]
    async fn server_error_is_unavailable() {
        let server = TestServer::start(StatusCode::SERVICE_UNAVAILABLE, "").await;
        let provider = HttpTokenProvider::new(&server.url, Duration::from_secs(5)).unwrap();

        assert_matches!(
            provider.refresh(&credentials()).await,
            Err(CredentialError::Unavailable(_))
        );
    }

    #[tokio::test]
    async fn malformed_response_is_unavailable() {
        let server = TestServer::start(StatusCode::OK, "not json").await;
        let provider = HttpTokenProvider::new(&server.url, Duration::from_secs(5)).unwrap();

        assert_matches!(
            provider.refresh(&credentials()).await,
            Err(CredentialError::Unavailable(reason)) if reason.starts_with("malformed")
        );
    }
}

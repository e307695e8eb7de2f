//! reqwest-backed channel transport.

use std::time::Duration;

use async_trait::async_trait;
use innsync_engine::{error::Result, Connection, Error, RateLimitHeaders, TokenScope};
use serde_json::json;

use super::{
    ChannelAuth, ChannelRequest, ChannelResponse, ChannelTransport, TokenGrant,
    HEADER_IDEMPOTENCY_KEY, HEADER_ORGANIZATION, HEADER_TOKEN,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Transport talking HTTPS to the channel REST API.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    auth_path: String,
}

impl HttpTransport {
    pub fn new(
        base_url: impl Into<String>,
        auth_path: impl Into<String>,
    ) -> std::result::Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("innsync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_path: auth_path.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

fn network(error: reqwest::Error) -> Error {
    Error::Network(error.to_string())
}

#[async_trait]
impl ChannelTransport for HttpTransport {
    async fn exchange_token(&self, connection: &Connection, scope: TokenScope) -> Result<TokenGrant> {
        let response = self
            .client
            .post(self.url(&self.auth_path))
            .header(HEADER_ORGANIZATION, &connection.organization)
            .json(&json!({
                "refreshToken": connection.refresh_token,
                "scope": scope.as_str(),
            }))
            .send()
            .await
            .map_err(network)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Credential {
                connection_id: connection.id.clone(),
                reason: format!("token exchange returned {status}: {body}"),
            });
        }

        response.json::<TokenGrant>().await.map_err(|e| Error::Credential {
            connection_id: connection.id.clone(),
            reason: format!("malformed token response: {e}"),
        })
    }

    async fn send(&self, auth: ChannelAuth<'_>, request: &ChannelRequest) -> Result<ChannelResponse> {
        let mut builder = self
            .client
            .request(request.method.clone(), self.url(&request.path))
            .header(HEADER_ORGANIZATION, auth.organization)
            .header(HEADER_TOKEN, auth.token);
        if let Some(key) = &request.idempotency_key {
            builder = builder.header(HEADER_IDEMPOTENCY_KEY, key);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(network)?;

        let status = response.status().as_u16();
        let headers = RateLimitHeaders::parse(|name| {
            response
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
        });
        let body = response.text().await.map_err(network)?;

        Ok(ChannelResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_trailing_slash_is_dropped() {
        let transport = HttpTransport::new("https://channel.example/", "/auth/token").unwrap();
        assert_eq!(
            transport.url("/properties/p1/rates"),
            "https://channel.example/properties/p1/rates"
        );
    }
}

//! Settings and client shared by the HTTP-speaking connectors.

use std::time::Duration;

use gateway_core::connector::Settings;
use gateway_core::ConnectorError;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;

/// `url`, `timeout` and `allow_insecure_tls`.
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub url: String,
    pub timeout: Duration,
    pub allow_insecure_tls: bool,
}

impl HttpSettings {
    pub fn from_settings(settings: &Settings) -> Result<Self, ConnectorError> {
        let url = settings.required_string("url")?;
        let parsed = reqwest::Url::parse(&url).map_err(|e| ConnectorError::invalid_setting("url", e.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ConnectorError::invalid_setting("url", "expected an http or https URL"));
        }
        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            timeout: settings.timeout()?,
            allow_insecure_tls: settings.bool_or("allow_insecure_tls", false)?,
        })
    }

    /// `url` joined with an absolute `path`.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.url, path)
    }

    pub fn client(&self) -> Result<Client, ConnectorError> {
        Client::builder()
            .user_agent(format!("gateway/{}", gateway_core::VERSION))
            .timeout(self.timeout)
            .danger_accept_invalid_certs(self.allow_insecure_tls)
            .build()
            .map_err(|e| ConnectorError::Backend(format!("unable to build HTTP client: {e}")))
    }
}

pub fn request_error(err: reqwest::Error, timeout: Duration) -> ConnectorError {
    if err.is_timeout() {
        ConnectorError::Timeout(timeout)
    } else if err.is_decode() {
        ConnectorError::Decode(err.to_string())
    } else {
        ConnectorError::Backend(err.to_string())
    }
}

/// Fails unless the backend answered 200, then decodes the JSON body.
pub async fn json<T: DeserializeOwned>(response: Response, timeout: Duration) -> Result<T, ConnectorError> {
    let status = response.status();
    if status != StatusCode::OK {
        return Err(ConnectorError::Backend(format!("got HTTP status {status}, expected 200")));
    }
    let body = response.bytes().await.map_err(|e| request_error(e, timeout))?;
    serde_json::from_slice(&body).map_err(|e| ConnectorError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_is_required_and_normalized() {
        assert!(matches!(
            HttpSettings::from_settings(&Settings::new()),
            Err(ConnectorError::MissingSetting(_))
        ));
        assert!(HttpSettings::from_settings(&Settings::new().with("url", "ftp://host")).is_err());

        let http = HttpSettings::from_settings(&Settings::new().with("url", "http://host:8080/").with("timeout", 3))
            .unwrap();
        assert_eq!(http.endpoint("/render"), "http://host:8080/render");
        assert_eq!(http.timeout, Duration::from_secs(3));
        assert!(!http.allow_insecure_tls);
    }
}

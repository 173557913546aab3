use axum::{
  Json,
  http::StatusCode,
  response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
  /// Network failure, timeout or 5xx. Eligible for retry.
  #[error("upstream transient error: {message}")]
  UpstreamTransient { message: String, timeout: bool },

  /// 4xx or malformed payload. Never retried.
  #[error("upstream permanent error: {0}")]
  UpstreamPermanent(String),

  #[error("not found: {0}")]
  NotFound(String),

  #[error("persistence error: {0}")]
  Persistence(String),

  #[error("configuration error: {0}")]
  Configuration(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
  pub fn transient(message: impl Into<String>) -> Self {
    Self::UpstreamTransient { message: message.into(), timeout: false }
  }

  pub fn permanent(message: impl Into<String>) -> Self {
    Self::UpstreamPermanent(message.into())
  }

  pub fn not_found(what: impl Into<String>) -> Self {
    Self::NotFound(what.into())
  }

  /// Classify an HTTP status returned by upstream for `url`.
  pub fn from_status(status: reqwest::StatusCode, url: &str) -> Self {
    let message = format!("HTTP {} for {}", status.as_u16(), redact(url));
    if status.is_server_error()
      || status == reqwest::StatusCode::TOO_MANY_REQUESTS
      || status == reqwest::StatusCode::REQUEST_TIMEOUT
    {
      Self::transient(message)
    } else {
      Self::permanent(message)
    }
  }

  pub fn is_transient(&self) -> bool {
    matches!(self, Self::UpstreamTransient { .. })
  }

  pub fn status_code(&self) -> StatusCode {
    match self {
      Self::UpstreamTransient { timeout: true, .. } => StatusCode::GATEWAY_TIMEOUT,
      Self::UpstreamTransient { .. } | Self::UpstreamPermanent(_) => StatusCode::BAD_GATEWAY,
      Self::NotFound(_) => StatusCode::NOT_FOUND,
      Self::Persistence(_) | Self::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
  }
}

impl From<reqwest::Error> for Error {
  fn from(err: reqwest::Error) -> Self {
    if let Some(status) = err.status() {
      let url = err.url().map(|u| u.as_str().to_string()).unwrap_or_default();
      return Self::from_status(status, &url);
    }
    if err.is_decode() || err.is_builder() {
      return Self::permanent(err.without_url().to_string());
    }
    // Connect, timeout, body and redirect failures are all worth another try.
    Self::UpstreamTransient { timeout: err.is_timeout(), message: err.without_url().to_string() }
  }
}

impl From<serde_json::Error> for Error {
  fn from(err: serde_json::Error) -> Self {
    Self::permanent(format!("malformed JSON: {err}"))
  }
}

impl IntoResponse for Error {
  fn into_response(self) -> Response {
    let status = self.status_code();
    // Upstream detail stays in the logs, clients get the category only.
    let message = match &self {
      Self::UpstreamTransient { .. } | Self::UpstreamPermanent(_) => "upstream unavailable".to_string(),
      Self::Persistence(_) => "failed to persist selection".to_string(),
      other => other.to_string(),
    };
    (status, Json(json!({ "error": message }))).into_response()
  }
}

/// Strip the query string so auth parameters never reach the logs.
pub(crate) fn redact(url: &str) -> &str {
  url.split_once('?').map_or(url, |(head, _)| head)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn status_classification() {
    for code in [500u16, 502, 503, 504, 429, 408] {
      let status = reqwest::StatusCode::from_u16(code).unwrap();
      assert!(Error::from_status(status, "http://x/").is_transient(), "{code}");
    }
    for code in [400u16, 401, 403, 404, 410] {
      let status = reqwest::StatusCode::from_u16(code).unwrap();
      assert!(!Error::from_status(status, "http://x/").is_transient(), "{code}");
    }
  }

  #[test]
  fn http_mapping() {
    assert_eq!(Error::not_found("x").status_code(), StatusCode::NOT_FOUND);
    assert_eq!(Error::transient("x").status_code(), StatusCode::BAD_GATEWAY);
    assert_eq!(Error::permanent("x").status_code(), StatusCode::BAD_GATEWAY);
    let timeout = Error::UpstreamTransient { message: "t".into(), timeout: true };
    assert_eq!(timeout.status_code(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(Error::Persistence("disk".into()).status_code(), StatusCode::INTERNAL_SERVER_ERROR);
  }

  #[test]
  fn redact_drops_query() {
    assert_eq!(redact("https://h/auth.php?sig=secret"), "https://h/auth.php");
    assert_eq!(redact("https://h/a"), "https://h/a");
  }
}

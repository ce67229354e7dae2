//! HTTP transport for calibration probes, registration attempts and the
//! credential check.
//!
//! Endpoints, relative to the configured base URL:
//! - `GET  time`       -> `{receive_ms, transmit_ms}`
//! - `HEAD ping`       -> empty, no server-side work
//! - `POST register`   `{crn, action}` -> `{status, message}`
//! - `GET  token/test` -> `{valid, message}`
//!
//! [`CatalogClient`] reads the public course timetable, which lives on a
//! separate host and needs no credential.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::{LookupConfig, TransportConfig};
use crate::lookup::{parse_courses_html, CourseInfo, Department};
use crate::tracker::{CredentialCheck, Outcome, OutcomeStatus, TrackedItem};
use crate::traits::{AttemptReply, CourseCatalog, RegistrationTransport, ServerProbe, ServerStamp};

const DEPARTMENTS_PATH: &str = "public/DersProgram/SearchBransKoduByProgramSeviye";
const COURSES_PATH: &str = "public/DersProgram/DersProgramSearch";

#[derive(Debug, Deserialize)]
struct TimeReply {
    receive_ms: f64,
    transmit_ms: f64,
}

#[derive(Debug, Serialize)]
struct RegisterRequest<'a> {
    crn: &'a str,
    action: &'static str,
}

#[derive(Debug, Deserialize)]
struct RegisterReply {
    status: String,
    #[serde(default)]
    message: String,
}

#[derive(Clone)]
pub struct HttpClient {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpClient {
    pub fn new(config: &TransportConfig, token: Option<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(HttpClient {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.trim().is_empty()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

/// Map a registration response to an outcome.
///
/// 5xx is a transient failure (`Err`, retried). 429 is the server's debounce.
/// Anything else must carry a known status; an unknown one is a final error.
fn interpret_register(code: StatusCode, body: &str) -> Result<Outcome> {
    if code.is_server_error() {
        bail!("server error {}", code);
    }
    if code == StatusCode::TOO_MANY_REQUESTS {
        return Ok(Outcome::new(OutcomeStatus::Debounce, "rate limited"));
    }

    let reply: RegisterReply = match serde_json::from_str(body) {
        Ok(reply) => reply,
        Err(_) => {
            return Ok(Outcome::new(
                OutcomeStatus::Error,
                format!("unexpected response ({})", code),
            ))
        }
    };

    Ok(match reply.status.parse::<OutcomeStatus>() {
        Ok(status) => Outcome::new(status, reply.message),
        Err(_) => Outcome::new(
            OutcomeStatus::Error,
            format!("unknown status {:?}: {}", reply.status, reply.message),
        ),
    })
}

fn interpret_credential(code: StatusCode, body: &str) -> Result<CredentialCheck> {
    if code.is_server_error() {
        bail!("server error {}", code);
    }
    Ok(serde_json::from_str(body).unwrap_or_else(|_| CredentialCheck {
        valid: code.is_success(),
        message: format!("HTTP {}", code),
    }))
}

#[async_trait]
impl ServerProbe for HttpClient {
    async fn server_time(&self) -> Result<ServerStamp> {
        let reply: TimeReply = self
            .http
            .get(self.url("time"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("Malformed time response")?;

        Ok(ServerStamp {
            receive_ms: reply.receive_ms,
            transmit_ms: reply.transmit_ms,
        })
    }

    async fn ping(&self) -> Result<()> {
        let res = self.http.head(self.url("ping")).send().await?;
        if res.status().is_server_error() {
            bail!("ping failed with status {}", res.status());
        }
        Ok(())
    }
}

#[async_trait]
impl RegistrationTransport for HttpClient {
    async fn attempt(&self, item: &TrackedItem) -> Result<AttemptReply> {
        let payload = RegisterRequest {
            crn: item.code.as_str(),
            action: item.kind.action(),
        };
        let res = self
            .authorized(self.http.post(self.url("register")))
            .json(&payload)
            .send()
            .await?;

        let code = res.status();
        let body = res.text().await?;
        interpret_register(code, &body)
    }

    async fn test_credential(&self) -> Result<CredentialCheck> {
        let res = self
            .authorized(self.http.get(self.url("token/test")))
            .send()
            .await?;

        let code = res.status();
        let body = res.text().await?;
        interpret_credential(code, &body)
    }
}

pub struct CatalogClient {
    http: Client,
    base_url: String,
    level: String,
}

impl CatalogClient {
    pub fn new(config: &LookupConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("tr-TR,tr;q=0.9,en-US;q=0.8,en;q=0.7"));
        headers.insert("X-Requested-With", HeaderValue::from_static("XMLHttpRequest"));

        let http = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .default_headers(headers)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(CatalogClient {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            level: config.program_level.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }
}

#[async_trait]
impl CourseCatalog for CatalogClient {
    async fn departments(&self) -> Result<Vec<Department>> {
        self.http
            .get(self.url(DEPARTMENTS_PATH))
            .query(&[("programSeviyeTipiAnahtari", self.level.as_str())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("Malformed department list")
    }

    async fn courses(&self, department_id: u32) -> Result<Vec<CourseInfo>> {
        let page = self
            .http
            .get(self.url(COURSES_PATH))
            .query(&[
                ("programSeviyeTipiAnahtari", self.level.clone()),
                ("dersBransKoduId", department_id.to_string()),
            ])
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        parse_courses_html(&page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base_url: &str) -> HttpClient {
        HttpClient::new(
            &TransportConfig {
                base_url: base_url.to_string(),
                ..TransportConfig::default()
            },
            Some("secret".to_string()),
        )
        .unwrap()
    }

    #[test]
    fn test_url_joins_base() {
        assert_eq!(client("https://reg.example/api/").url("time"), "https://reg.example/api/time");
        assert_eq!(client("https://reg.example/api").url("token/test"), "https://reg.example/api/token/test");
    }

    #[test]
    fn test_blank_token_is_dropped() {
        let client = HttpClient::new(&TransportConfig::default(), Some("  ".to_string())).unwrap();
        assert!(client.token.is_none());
    }

    #[test]
    fn test_register_known_statuses() {
        let outcome = interpret_register(
            StatusCode::OK,
            r#"{"status": "success", "message": "Kayıt başarılı"}"#,
        )
        .unwrap();
        assert_eq!(outcome, Outcome::new(OutcomeStatus::Success, "Kayıt başarılı"));

        let outcome = interpret_register(StatusCode::CONFLICT, r#"{"status": "conflict", "message": "overlap"}"#).unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Conflict);

        let outcome = interpret_register(StatusCode::OK, r#"{"status": "FULL"}"#).unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Full);
        assert_eq!(outcome.message, "");
    }

    #[test]
    fn test_register_rate_limit_is_debounce() {
        let outcome = interpret_register(StatusCode::TOO_MANY_REQUESTS, "").unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Debounce);
    }

    #[test]
    fn test_register_server_error_is_transient() {
        assert!(interpret_register(StatusCode::BAD_GATEWAY, "").is_err());
        assert!(interpret_register(StatusCode::SERVICE_UNAVAILABLE, r#"{"status": "success"}"#).is_err());
    }

    #[test]
    fn test_register_unknown_status_is_final_error() {
        let outcome = interpret_register(StatusCode::OK, r#"{"status": "queued", "message": "later"}"#).unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Error);
        assert!(outcome.message.contains("queued"));

        let outcome = interpret_register(StatusCode::UNAUTHORIZED, "<html>login</html>").unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Error);
        assert!(outcome.message.contains("401"));
    }

    #[test]
    fn test_credential_interpretation() {
        let check = interpret_credential(StatusCode::OK, r#"{"valid": true, "message": "ok"}"#).unwrap();
        assert!(check.valid);

        let check = interpret_credential(StatusCode::UNAUTHORIZED, "").unwrap();
        assert!(!check.valid);
        assert_eq!(check.message, "HTTP 401 Unauthorized");

        assert!(interpret_credential(StatusCode::INTERNAL_SERVER_ERROR, "").is_err());
    }

    #[test]
    fn test_catalog_urls() {
        let client = CatalogClient::new(&LookupConfig {
            base_url: "https://obs.example/".to_string(),
            ..LookupConfig::default()
        })
        .unwrap();
        assert_eq!(
            client.url(COURSES_PATH),
            "https://obs.example/public/DersProgram/DersProgramSearch"
        );
        assert_eq!(client.level, "LS");
    }

    #[test]
    fn test_department_list_shape() {
        let list: Vec<Department> = serde_json::from_str(
            r#"[{"bransKoduId": 42, "dersBransKodu": "MAT", "dersBransKoduAdi": "Matematik"}]"#,
        )
        .unwrap();
        assert_eq!(
            list,
            vec![Department {
                code: "MAT".to_string(),
                id: 42
            }]
        );
    }
}

//! HTTP clients for the meeting-bot and recorder services.
//!
//! Both speak plain JSON over reqwest. Status classification for the bot:
//! connection errors and 5xx are transient, any other non-success status is
//! a rejection.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{MeetingJoiner, Recorder};
use crate::error::OrchestratorError;
use crate::types::CalendarEvent;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JoinRequest<'a> {
    meeting_link: &'a str,
    user_id: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinResponse {
    #[serde(default = "default_true")]
    success: bool,
    #[serde(default)]
    error: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StartRecordingRequest<'a> {
    event_id: &'a str,
    user_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    project_id: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MeetingEndRequest<'a> {
    event_id: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartRecordingResponse {
    recording_id: String,
}

/// Map a non-success bot status to the orchestrator's error classes.
fn classify_join_status(status: reqwest::StatusCode, body: &str) -> OrchestratorError {
    let message = format!("bot service returned {}: {}", status, body);
    if status.is_server_error()
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
    {
        OrchestratorError::JoinTransientFailure(message)
    } else {
        OrchestratorError::JoinRejected(message)
    }
}

fn base_url(raw: &str) -> Result<String, OrchestratorError> {
    let parsed = url::Url::parse(raw).map_err(|e| {
        OrchestratorError::ConfigurationError(format!("Invalid service URL '{}': {}", raw, e))
    })?;
    Ok(parsed.as_str().trim_end_matches('/').to_string())
}

pub struct HttpMeetingBot {
    client: reqwest::Client,
    base_url: String,
}

impl HttpMeetingBot {
    pub fn new(service_url: &str) -> Result<Self, OrchestratorError> {
        Ok(Self {
            client: reqwest::Client::new(),
            base_url: base_url(service_url)?,
        })
    }
}

#[async_trait]
impl MeetingJoiner for HttpMeetingBot {
    async fn join(
        &self,
        meeting_link: &str,
        user_id: &str,
        timeout: Duration,
    ) -> Result<(), OrchestratorError> {
        let resp = self
            .client
            .post(format!("{}/join", self.base_url))
            .timeout(timeout)
            .json(&JoinRequest {
                meeting_link,
                user_id,
            })
            .send()
            .await
            .map_err(|e| {
                OrchestratorError::JoinTransientFailure(format!("bot request failed: {}", e))
            })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_join_status(status, &text));
        }

        // An empty 2xx body counts as success
        let text = resp.text().await.unwrap_or_default();
        if text.trim().is_empty() {
            return Ok(());
        }
        let body: JoinResponse = serde_json::from_str(&text).map_err(|e| {
            OrchestratorError::JoinTransientFailure(format!("Failed to parse bot response: {}", e))
        })?;
        if body.success {
            Ok(())
        } else {
            Err(OrchestratorError::JoinTransientFailure(
                body.error
                    .unwrap_or_else(|| "bot reported failure".to_string()),
            ))
        }
    }
}

pub struct HttpRecorder {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRecorder {
    pub fn new(service_url: &str) -> Result<Self, OrchestratorError> {
        Ok(Self {
            client: reqwest::Client::new(),
            base_url: base_url(service_url)?,
        })
    }
}

#[async_trait]
impl Recorder for HttpRecorder {
    async fn start_recording(&self, event: &CalendarEvent) -> Result<String, OrchestratorError> {
        let resp = self
            .client
            .post(format!("{}/recordings", self.base_url))
            .json(&StartRecordingRequest {
                event_id: &event.id,
                user_id: &event.user_id,
                project_id: event.project_id.as_deref(),
            })
            .send()
            .await
            .map_err(|e| {
                OrchestratorError::RecordingStartFailure(format!("recorder request failed: {}", e))
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(OrchestratorError::RecordingStartFailure(format!(
                "recorder returned {}: {}",
                status, text
            )));
        }

        let body: StartRecordingResponse = resp.json().await.map_err(|e| {
            OrchestratorError::RecordingStartFailure(format!(
                "Failed to parse recorder response: {}",
                e
            ))
        })?;
        Ok(body.recording_id)
    }

    async fn on_meeting_end(&self, event_id: &str) -> Result<(), OrchestratorError> {
        let resp = self
            .client
            .post(format!("{}/recordings/end", self.base_url))
            .json(&MeetingEndRequest { event_id })
            .send()
            .await
            .map_err(|e| {
                OrchestratorError::RecordingStartFailure(format!("recorder request failed: {}", e))
            })?;

        // 404: nothing was ever recorded for this event
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            log::debug!("HttpRecorder: no recording for {}, nothing to finalize", event_id);
            return Ok(());
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(OrchestratorError::RecordingStartFailure(format!(
                "recorder end returned {}: {}",
                status, text
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_server_errors_are_transient() {
        for status in [
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::TOO_MANY_REQUESTS,
        ] {
            assert!(classify_join_status(status, "busy").is_retryable());
        }
    }

    #[test]
    fn test_client_errors_are_rejections() {
        for status in [StatusCode::BAD_REQUEST, StatusCode::NOT_FOUND, StatusCode::FORBIDDEN] {
            let err = classify_join_status(status, "no such meeting");
            assert!(matches!(err, OrchestratorError::JoinRejected(_)));
        }
    }

    #[test]
    fn test_base_url_trims_trailing_slash() {
        assert_eq!(
            base_url("https://bot.example.com/").unwrap(),
            "https://bot.example.com"
        );
        assert_eq!(
            base_url("https://bot.example.com/api/v1/").unwrap(),
            "https://bot.example.com/api/v1"
        );
        assert!(matches!(
            base_url("bot.example.com"),
            Err(OrchestratorError::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_join_response_defaults_to_success() {
        let body: JoinResponse = serde_json::from_str("{}").unwrap();
        assert!(body.success);
        let body: JoinResponse =
            serde_json::from_str(r#"{ "success": false, "error": "bot busy" }"#).unwrap();
        assert!(!body.success);
        assert_eq!(body.error.as_deref(), Some("bot busy"));
    }
}

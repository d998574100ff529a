//! Poll transport: a ThingSpeak-style HTTP channel.
//!
//! Status goes out as a form POST to `status_url`:
//!
//! ```text
//! api_key=<write_key>&field1=0&field2=0&field3=2&field4=0&status=capture:Idle ok=12 || ...
//! ```
//!
//! `field<N>` carries the status code of job N (capture 1, archive 2,
//! upload 3, control 4); see [`JobState::status_code`](crate::job::JobState::status_code).
//!
//! Commands come back from `command_url`, POSTed with `api_key=<read_key>`.
//! The server consumes the command it returns. The body is either the bare
//! command string or `{"command_string": "..."}`; an empty body means no
//! command is waiting.

use serde::Deserialize;
use std::time::Duration;

use crate::config::PollConfig;
use crate::error::{Error, Result};
use crate::models::StatusSnapshot;

#[derive(Debug, Clone)]
pub struct PollTransport {
    client: reqwest::Client,
    status_url: String,
    command_url: Option<String>,
    write_key: String,
    read_key: String,
}

#[derive(Deserialize)]
struct CommandBody {
    #[serde(default)]
    command_string: Option<String>,
}

impl PollTransport {
    pub fn new(cfg: &PollConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            client,
            status_url: cfg.status_url.clone(),
            command_url: cfg.command_url.clone(),
            write_key: cfg.write_key.clone(),
            read_key: cfg.read_key.clone(),
        })
    }

    /// Form fields for one status update.
    pub fn status_form(snapshot: &StatusSnapshot, write_key: &str) -> Vec<(String, String)> {
        let mut form = vec![("api_key".to_string(), write_key.to_string())];
        for job in &snapshot.jobs {
            form.push((
                format!("field{}", job.job.field_id()),
                job.status_code().to_string(),
            ));
        }
        form.push(("status".to_string(), snapshot.summary_line()));
        form
    }

    pub async fn push_status(&self, snapshot: &StatusSnapshot) -> Result<()> {
        let form = Self::status_form(snapshot, &self.write_key);
        let resp = self
            .client
            .post(&self.status_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| Error::Network(format!("status POST failed: {}", e)))?;
        if !resp.status().is_success() {
            return Err(Error::Network(format!(
                "status POST returned HTTP {}",
                resp.status()
            )));
        }
        tracing::debug!(url = %self.status_url, "Status pushed");
        Ok(())
    }

    /// Fetch and consume the next waiting command, if any.
    pub async fn pull_command(&self) -> Result<Option<String>> {
        let Some(url) = &self.command_url else {
            return Ok(None);
        };
        let resp = self
            .client
            .post(url)
            .form(&[("api_key", self.read_key.as_str())])
            .send()
            .await
            .map_err(|e| Error::Network(format!("command POST failed: {}", e)))?;
        if !resp.status().is_success() {
            return Err(Error::Network(format!(
                "command POST returned HTTP {}",
                resp.status()
            )));
        }
        let body = resp
            .text()
            .await
            .map_err(|e| Error::Network(format!("command body: {}", e)))?;
        Ok(parse_command_body(&body))
    }
}

fn parse_command_body(body: &str) -> Option<String> {
    let body = body.trim();
    if body.is_empty() {
        return None;
    }
    let text = if body.starts_with('{') {
        match serde_json::from_str::<CommandBody>(body) {
            Ok(parsed) => parsed.command_string?,
            Err(e) => {
                tracing::warn!(error = %e, "Unreadable command response");
                return None;
            }
        }
    } else {
        body.to_string()
    };
    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobState, JobStatus};
    use crate::models::JobKind;
    use chrono::Utc;

    fn snapshot() -> StatusSnapshot {
        let mut upload = JobState::new(JobKind::Upload);
        upload.status = JobStatus::Degraded;
        upload.consecutive_errors = 2;
        let mut capture = JobState::new(JobKind::Capture);
        capture.paused = true;
        StatusSnapshot {
            device_id: "CAM1".into(),
            taken_at: Utc::now(),
            jobs: vec![capture, upload],
            dark: None,
            queue: None,
        }
    }

    #[test]
    fn test_status_form_fields() {
        let form = PollTransport::status_form(&snapshot(), "WKEY");
        assert_eq!(form[0], ("api_key".to_string(), "WKEY".to_string()));
        assert!(form.contains(&("field1".to_string(), "16".to_string())));
        assert!(form.contains(&("field3".to_string(), "2".to_string())));
        let status = &form.last().unwrap().1;
        assert!(status.contains(" || "));
        assert!(status.contains("upload:Degraded"));
    }

    #[test]
    fn test_parse_command_body() {
        assert_eq!(parse_command_body(""), None);
        assert_eq!(parse_command_body("  \n"), None);
        assert_eq!(
            parse_command_body("capture/pause\n").as_deref(),
            Some("capture/pause")
        );
        assert_eq!(
            parse_command_body(r#"{"command_string":"all/resume"}"#).as_deref(),
            Some("all/resume")
        );
        assert_eq!(parse_command_body(r#"{"command_string":""}"#), None);
        assert_eq!(parse_command_body(r#"{"other":1}"#), None);
    }
}

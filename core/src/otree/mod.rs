//! oTree platform client
//!
//! REST calls for creating and watching sessions, the admin data export, and a
//! per-participant browser that fetches and submits pages.

pub mod page;

pub use page::{Choice, PageKind, PageSnapshot, Question, QuestionKind};

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header::CONTENT_TYPE, Client as HttpClient, Response};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::config::OtreeSettings;
use crate::error::{LabError, Result};
use crate::util::sanitize_base_url;

const REST_KEY_HEADER: &str = "otree-rest-key";

/// A freshly created platform session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedSession {
    pub code: String,
    /// Participant codes ordered by their position in the session
    pub participant_codes: Vec<String>,
}

/// Progress of one participant as reported by the platform
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantStatus {
    pub code: String,
    #[serde(default)]
    pub id_in_session: Option<u32>,
    #[serde(default)]
    pub finished: bool,
    #[serde(default, rename = "_current_page_name")]
    pub current_page: Option<String>,
    #[serde(default, rename = "_current_app_name")]
    pub current_app: Option<String>,
}

impl ParticipantStatus {
    /// `app.page` for progress logging
    pub fn location(&self) -> String {
        format!(
            "{}.{}",
            self.current_app.as_deref().unwrap_or("unknown"),
            self.current_page.as_deref().unwrap_or("unknown")
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SessionStatus {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub participants: Vec<ParticipantStatus>,
}

impl SessionStatus {
    pub fn finished_count(&self) -> usize {
        self.participants.iter().filter(|p| p.finished).count()
    }

    /// True once there is at least one participant and all of them finished
    pub fn all_finished(&self) -> bool {
        !self.participants.is_empty() && self.participants.iter().all(|p| p.finished)
    }
}

/// Operations the launcher needs from the experiment platform
#[async_trait]
pub trait ExperimentPlatform: Send + Sync {
    async fn create_session(
        &self,
        config_name: &str,
        num_participants: usize,
        fields: Map<String, Value>,
    ) -> Result<CreatedSession>;

    async fn session_status(&self, code: &str) -> Result<SessionStatus>;

    /// Download the wide-format data export to `dest`, returning its size
    async fn export_wide(&self, code: &str, dest: &Path) -> Result<u64>;

    fn participant_url(&self, participant_code: &str) -> String;

    fn monitor_url(&self, session_code: &str) -> String;
}

/// REST and admin client for one oTree server
#[derive(Debug, Clone)]
pub struct OtreeClient {
    base_url: String,
    settings: OtreeSettings,
    http_client: HttpClient,
}

impl OtreeClient {
    pub fn new(settings: OtreeSettings) -> Result<Self> {
        let base_url = sanitize_base_url(&settings.url, "oTree URL")?;
        let http_client = HttpClient::builder()
            .cookie_store(true)
            .timeout(Duration::from_secs(60))
            .user_agent(concat!("llmlab/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| LabError::Http(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url,
            settings,
            http_client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/api/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn with_rest_key(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.settings.rest_key.as_deref().filter(|k| !k.is_empty()) {
            Some(key) => request.header(REST_KEY_HEADER, key),
            None => request,
        }
    }

    /// True if the server answers at all
    pub async fn is_reachable(&self) -> bool {
        self.http_client
            .get(&self.base_url)
            .timeout(Duration::from_secs(2))
            .send()
            .await
            .is_ok()
    }

    /// Log in as the admin user when a password is configured
    async fn admin_login(&self) -> Result<()> {
        let Some(password) = self.settings.admin_password.as_deref() else {
            return Ok(());
        };
        let response = self
            .http_client
            .post(format!("{}/login", self.base_url))
            .form(&[
                ("username", self.settings.admin_username.as_str()),
                ("password", password),
            ])
            .send()
            .await?;
        check_status(response).await?;
        tracing::debug!("Logged in to {} as {}", self.base_url, self.settings.admin_username);
        Ok(())
    }
}

#[async_trait]
impl ExperimentPlatform for OtreeClient {
    async fn create_session(
        &self,
        config_name: &str,
        num_participants: usize,
        fields: Map<String, Value>,
    ) -> Result<CreatedSession> {
        let payload = json!({
            "session_config_name": config_name,
            "num_participants": num_participants,
            "modified_session_config_fields": fields,
        });
        let response = self
            .with_rest_key(self.http_client.post(self.api_url("sessions")))
            .json(&payload)
            .send()
            .await?;
        let created: Value = check_status(response).await?.json().await?;
        let code = created
            .get("code")
            .and_then(Value::as_str)
            .ok_or_else(|| LabError::Platform {
                status: 200,
                message: "session response has no 'code'".to_string(),
            })?
            .to_string();

        let mut participants = self.session_status(&code).await?.participants;
        participants.sort_by_key(|p| p.id_in_session.unwrap_or(u32::MAX));
        if participants.len() != num_participants {
            return Err(LabError::Platform {
                status: 200,
                message: format!(
                    "session {} has {} participants, expected {}",
                    code,
                    participants.len(),
                    num_participants
                ),
            });
        }

        tracing::info!("Created oTree session {} ({} participants)", code, num_participants);
        Ok(CreatedSession {
            code,
            participant_codes: participants.into_iter().map(|p| p.code).collect(),
        })
    }

    async fn session_status(&self, code: &str) -> Result<SessionStatus> {
        let response = self
            .with_rest_key(self.http_client.get(self.api_url(&format!("sessions/{}", code))))
            .send()
            .await?;
        let mut status: SessionStatus = check_status(response).await?.json().await?;
        if status.code.is_empty() {
            status.code = code.to_string();
        }
        Ok(status)
    }

    async fn export_wide(&self, code: &str, dest: &Path) -> Result<u64> {
        self.admin_login().await?;

        let path = self.settings.export_path.replace("{code}", code);
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let response = check_status(self.http_client.get(&url).send().await?).await?;

        let is_html = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("text/html"));
        if is_html {
            return Err(LabError::Platform {
                status: response.status().as_u16(),
                message: format!("{} returned an HTML page instead of CSV; check admin credentials", url),
            });
        }

        let bytes = response.bytes().await?;
        tokio::fs::write(dest, &bytes).await?;
        tracing::info!("Exported wide data for {} to {}", code, dest.display());
        Ok(bytes.len() as u64)
    }

    fn participant_url(&self, participant_code: &str) -> String {
        format!("{}/InitializeParticipant/{}", self.base_url, participant_code)
    }

    fn monitor_url(&self, session_code: &str) -> String {
        format!("{}/SessionMonitor/{}", self.base_url, session_code)
    }
}

/// Page-level access for one participant.
///
/// Each participant gets its own cookie jar.
#[derive(Debug, Clone)]
pub struct ParticipantBrowser {
    http_client: HttpClient,
}

impl ParticipantBrowser {
    pub fn new() -> Result<Self> {
        let http_client = HttpClient::builder()
            .cookie_store(true)
            .timeout(Duration::from_secs(60))
            .user_agent(concat!("llmlab/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| LabError::Http(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { http_client })
    }

    /// Fetch and parse the page at `url`, following redirects
    pub async fn fetch(&self, url: &str) -> Result<PageSnapshot> {
        let response = check_status(self.http_client.get(url).send().await?).await?;
        Self::snapshot(response).await
    }

    /// Post the page's form with its hidden fields plus `answers`, returning
    /// the page the platform redirects to
    pub async fn submit(&self, page: &PageSnapshot, answers: &[(String, String)]) -> Result<PageSnapshot> {
        let action = page.form_action.as_deref().ok_or_else(|| LabError::UnexpectedPage {
            url: page.url.clone(),
            reason: "page has no form to submit".to_string(),
        })?;

        let mut fields = page.hidden_fields.clone();
        fields.extend(answers.iter().cloned());

        let response = self
            .http_client
            .post(action)
            .form(&fields)
            .send()
            .await?;
        Self::snapshot(check_status(response).await?).await
    }

    async fn snapshot(response: Response) -> Result<PageSnapshot> {
        let url = response.url().to_string();
        let html = response.text().await?;
        Ok(PageSnapshot::parse(&url, &html))
    }
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message: String = body.chars().take(300).collect();
    Err(LabError::Platform {
        status: status.as_u16(),
        message: if message.is_empty() {
            status.to_string()
        } else {
            message
        },
    })
}

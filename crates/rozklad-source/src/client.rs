//! HTTP client for the JetIQ curriculum API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::{
    FacultyRecord, GroupRecord, LessonRecord, ScheduleSource, SourceError, TeacherRecord,
};

/// Default endpoint of the public curriculum API.
pub const DEFAULT_BASE_URL: &str = "https://iq.vntu.edu.ua/b04213/curriculum/api.php";

/// Client for the JetIQ curriculum API.
#[derive(Clone)]
pub struct JetIqClient {
    http: Client,
    base_url: String,
}

impl JetIqClient {
    /// Create a new client for the given endpoint.
    pub fn new(base_url: impl Into<String>) -> Result<Self, SourceError> {
        Self::with_timeout(base_url, Duration::from_secs(30))
    }

    /// Create a new client with a custom request timeout.
    pub fn with_timeout(
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, SourceError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()
            .map_err(|e| SourceError::Unavailable(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }

    /// Get the endpoint URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        query: &[(&str, String)],
    ) -> Result<T, SourceError> {
        let response = self.http.get(&self.base_url).query(query).send().await?;

        let status = response.status();
        if !status.is_success() {
            debug!(status = status.as_u16(), ?query, "upstream returned error status");
            return Err(SourceError::UnexpectedStatus(status.as_u16()));
        }

        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

#[derive(serde::Deserialize)]
struct WireGroup {
    #[serde(deserialize_with = "crate::types::int_or_string")]
    id: i64,
    name: String,
}

#[async_trait]
impl ScheduleSource for JetIqClient {
    async fn fetch_faculties(&self) -> Result<Vec<FacultyRecord>, SourceError> {
        let faculties: Vec<FacultyRecord> = self.get_json(&[("view", "f".to_string())]).await?;
        debug!(count = faculties.len(), "fetched faculties");
        Ok(faculties)
    }

    async fn fetch_groups(&self, faculty_id: i64) -> Result<Vec<GroupRecord>, SourceError> {
        let groups: Vec<WireGroup> = self
            .get_json(&[("view", "g".to_string()), ("f_id", faculty_id.to_string())])
            .await?;
        debug!(faculty_id, count = groups.len(), "fetched groups");

        Ok(groups
            .into_iter()
            .map(|g| GroupRecord {
                id: g.id,
                name: g.name,
                faculty_id,
            })
            .collect())
    }

    async fn fetch_teachers(&self) -> Result<Vec<TeacherRecord>, SourceError> {
        let teachers: Vec<TeacherRecord> = self.get_json(&[("view", "t".to_string())]).await?;
        debug!(count = teachers.len(), "fetched teachers");
        Ok(teachers)
    }

    async fn fetch_group_lessons(&self, group_id: i64) -> Result<Vec<LessonRecord>, SourceError> {
        let lessons: Vec<LessonRecord> = self
            .get_json(&[("group_id", group_id.to_string())])
            .await?;
        debug!(group_id, count = lessons.len(), "fetched group lessons");
        Ok(lessons)
    }
}

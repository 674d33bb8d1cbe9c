use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;

use crate::model::{
    ContextMetadata, CustomFieldDefinition, SimpleEntity, Task, TimeEntry, VersionDto,
    WikiPageDto, WikiVersionDto,
};

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("redmine request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("redmine returned HTTP {status}: {body}")]
    Http {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("redmine rejected the request (HTTP {status}): {}", .messages.join("; "))]
    Rejected {
        status: reqwest::StatusCode,
        messages: Vec<String>,
    },
    #[error("failed to decode redmine response: {0}")]
    Decode(String),
    #[error("failed to encode request payload: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("invalid redmine base url '{0}'")]
    InvalidBaseUrl(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("operation was cancelled")]
    Cancelled,
    #[error("client has been shut down")]
    ShutDown,
    #[error("worker failed: {0}")]
    WorkerPanicked(String),
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<TrackerError>,
    },
}

impl TrackerError {
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    pub fn root_cause(&self) -> &TrackerError {
        match self {
            Self::Context { source, .. } => source.root_cause(),
            other => other,
        }
    }

    pub fn status(&self) -> Option<reqwest::StatusCode> {
        match self.root_cause() {
            Self::Http { status, .. } | Self::Rejected { status, .. } => Some(*status),
            Self::Request(err) => err.status(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetadataKind {
    Users,
    Trackers,
    Categories,
    Priorities,
    Statuses,
    Versions,
    Activities,
}

impl MetadataKind {
    pub const ALL: [MetadataKind; 7] = [
        Self::Users,
        Self::Trackers,
        Self::Categories,
        Self::Priorities,
        Self::Statuses,
        Self::Versions,
        Self::Activities,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Users => "users",
            Self::Trackers => "trackers",
            Self::Categories => "categories",
            Self::Priorities => "priorities",
            Self::Statuses => "statuses",
            Self::Versions => "versions",
            Self::Activities => "activities",
        }
    }
}

impl fmt::Display for MetadataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetadataKind {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| format!("unknown metadata type '{raw}'"))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TaskFilter {
    pub assigned_to_me: bool,
    pub include_closed: bool,
}

/// Every remote operation the desktop application needs from the tracker.
///
/// Implemented by the HTTP transport, by the caching decorator around it, and
/// mirrored by the async facade.
pub trait TrackerClient: Send + Sync {
    fn fetch_tasks(
        &self,
        project_id: &str,
        filter: &TaskFilter,
        limit: usize,
    ) -> Result<Vec<Task>, TrackerError>;

    fn fetch_task(&self, task_id: i64) -> Result<Task, TrackerError>;

    fn fetch_tasks_by_ids(&self, ids: &[i64]) -> Result<Vec<Task>, TrackerError>;

    fn fetch_tasks_by_version(&self, version_id: i64) -> Result<Vec<Task>, TrackerError>;

    fn fetch_closed_tasks(&self, project_id: &str, limit: usize)
        -> Result<Vec<Task>, TrackerError>;

    fn create_task(&self, project_id: &str, task: &Task) -> Result<Task, TrackerError>;

    fn update_task(&self, task: &Task) -> Result<(), TrackerError>;

    fn fetch_allowed_statuses(&self, task_id: i64) -> Result<Vec<SimpleEntity>, TrackerError>;

    fn fetch_metadata(
        &self,
        kind: &str,
        project_id: &str,
    ) -> Result<Vec<SimpleEntity>, TrackerError>;

    fn fetch_custom_field_definitions(&self) -> Result<Vec<CustomFieldDefinition>, TrackerError>;

    fn fetch_current_user(&self) -> Result<SimpleEntity, TrackerError>;

    fn fetch_project(&self, project_id: &str) -> Result<SimpleEntity, TrackerError>;

    fn fetch_context(&self, project_id: &str) -> Result<ContextMetadata, TrackerError>;

    fn fetch_versions(&self, project_id: &str) -> Result<Vec<VersionDto>, TrackerError>;

    fn create_version(
        &self,
        project_id: &str,
        version: &VersionDto,
    ) -> Result<VersionDto, TrackerError>;

    fn update_version(&self, version: &VersionDto) -> Result<(), TrackerError>;

    fn delete_version(&self, version_id: i64) -> Result<(), TrackerError>;

    fn fetch_wiki_index(&self, project_id: &str) -> Result<Vec<WikiPageDto>, TrackerError>;

    fn fetch_wiki_page(
        &self,
        project_id: &str,
        title: &str,
        version: Option<i64>,
    ) -> Result<WikiPageDto, TrackerError>;

    fn fetch_wiki_history(
        &self,
        project_id: &str,
        title: &str,
    ) -> Result<Vec<WikiVersionDto>, TrackerError>;

    fn save_wiki_page(&self, project_id: &str, page: &WikiPageDto) -> Result<(), TrackerError>;

    fn delete_wiki_page(&self, project_id: &str, title: &str) -> Result<(), TrackerError>;

    fn upload_wiki_attachment(
        &self,
        project_id: &str,
        title: &str,
        filename: &str,
        content: &[u8],
    ) -> Result<(), TrackerError>;

    fn revert_wiki_page(
        &self,
        project_id: &str,
        title: &str,
        version: i64,
    ) -> Result<(), TrackerError>;

    fn upload_file(&self, filename: &str, content: &[u8]) -> Result<String, TrackerError>;

    fn download_attachment(&self, content_url: &str) -> Result<Vec<u8>, TrackerError>;

    fn download_attachment_by_id(&self, attachment_id: i64) -> Result<Vec<u8>, TrackerError>;

    fn log_time(&self, entry: &TimeEntry) -> Result<TimeEntry, TrackerError>;

    fn fetch_time_entries(
        &self,
        project_id: Option<&str>,
        from: NaiveDate,
        to: NaiveDate,
        limit: usize,
    ) -> Result<Vec<TimeEntry>, TrackerError>;

    fn close(&self) {}
}

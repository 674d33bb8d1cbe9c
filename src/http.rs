use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use chrono::NaiveDate;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, StatusCode, Url};
use tracing::{debug, warn};

use crate::client::{MetadataKind, TaskFilter, TrackerClient, TrackerError};
use crate::codec::{self, Page};
use crate::config::{RedmineConfig, MAX_PAGE_SIZE};
use crate::metrics::Metrics;
use crate::model::{
    ContextMetadata, CustomFieldDefinition, SimpleEntity, Task, TimeEntry, Upload, VersionDto,
    WikiPageDto, WikiVersionDto,
};

const TASK_DETAIL_INCLUDES: &str = "journals,attachments,changesets,allowed_statuses,watchers";
const UNLIMITED: usize = usize::MAX;
const MAX_ERROR_BODY_CHARS: usize = 1000;
const MAX_RETRY_WAIT: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct Limiter {
    max: usize,
    in_flight: Mutex<usize>,
    cv: Condvar,
}

#[derive(Debug)]
struct Permit<'a> {
    limiter: &'a Limiter,
}

impl Limiter {
    fn new(max: usize) -> Self {
        Self {
            max: max.max(1),
            in_flight: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    fn acquire(&self) -> Permit<'_> {
        let mut current = self.in_flight.lock().expect("limiter mutex poisoned");
        while *current >= self.max {
            current = self
                .cv
                .wait(current)
                .expect("limiter condvar wait failed unexpectedly");
        }
        *current += 1;
        Permit { limiter: self }
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        let mut current = self
            .limiter
            .in_flight
            .lock()
            .expect("limiter mutex poisoned");
        *current = current.saturating_sub(1);
        self.limiter.cv.notify_one();
    }
}

#[derive(Debug, Clone)]
pub struct RedmineClient {
    pub base_url: String,
    base: Url,
    api_key: String,
    http: Client,
    page_size: usize,
    max_batch_ids: usize,
    max_retries: usize,
    retry_delay: Duration,
    limiter: Arc<Limiter>,
    metrics: Arc<Metrics>,
}

impl RedmineClient {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, TrackerError> {
        Self::from_config(
            &RedmineConfig::new(base_url, api_key),
            Arc::new(Metrics::new()),
        )
    }

    pub fn from_config(
        config: &RedmineConfig,
        metrics: Arc<Metrics>,
    ) -> Result<Self, TrackerError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()?;
        let base_url = normalize_base_url(&config.base_url)?;
        let base = Url::parse(&base_url)
            .map_err(|_| TrackerError::InvalidBaseUrl(config.base_url.clone()))?;
        Ok(Self {
            base_url,
            base,
            api_key: config.api_key.clone(),
            http,
            page_size: config.page_size.clamp(1, MAX_PAGE_SIZE),
            max_batch_ids: config.max_batch_ids.clamp(1, MAX_PAGE_SIZE),
            max_retries: config.max_retries,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            limiter: Arc::new(Limiter::new(config.max_in_flight)),
            metrics,
        })
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        self
    }

    pub fn with_max_batch_ids(mut self, max_batch_ids: usize) -> Self {
        self.max_batch_ids = max_batch_ids.clamp(1, MAX_PAGE_SIZE);
        self
    }

    pub fn with_retries(mut self, max_retries: usize, delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = delay;
        self
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.query(&[("key", self.api_key.as_str())])
    }

    fn execute<F>(&self, max_retries: usize, mut send: F) -> Result<Response, TrackerError>
    where
        F: FnMut() -> Result<Response, reqwest::Error>,
    {
        let _permit = self.limiter.acquire();
        let mut attempt = 0;
        loop {
            self.metrics.inc_api_request();
            let response = match send() {
                Ok(resp) => resp,
                Err(err) => {
                    warn!(attempt = attempt + 1, error = %err, "redmine transport error");
                    return Err(TrackerError::Request(err));
                }
            };

            if !is_retryable(response.status()) || attempt >= max_retries {
                if !response.status().is_success() {
                    warn!(
                        status = %response.status(),
                        attempts = attempt + 1,
                        "redmine request completed with error status"
                    );
                }
                return Ok(response);
            }

            let wait = retry_after_or_backoff(&response, attempt, self.retry_delay);
            debug!(
                status = %response.status(),
                attempt = attempt + 1,
                ?wait,
                "redmine retryable status"
            );
            self.metrics.inc_retry();
            thread::sleep(wait);
            attempt += 1;
        }
    }

    fn get_text(&self, url: Url, query: &[(&str, String)]) -> Result<String, TrackerError> {
        let response = self.execute(self.max_retries, || {
            self.authorized(self.http.get(url.clone()))
                .query(query)
                .send()
        })?;
        Ok(check_status(response)?.text()?)
    }

    fn send_json(&self, method: Method, url: Url, body: String) -> Result<String, TrackerError> {
        let response = self.execute(0, || {
            self.authorized(self.http.request(method.clone(), url.clone()))
                .header(CONTENT_TYPE, "application/json")
                .body(body.clone())
                .send()
        })?;
        Ok(check_status(response)?.text()?)
    }

    fn delete(&self, url: Url) -> Result<(), TrackerError> {
        let response = self.execute(0, || self.authorized(self.http.delete(url.clone())).send())?;
        check_status(response)?;
        Ok(())
    }

    fn fetch_paged<T>(
        &self,
        url: Url,
        query: &[(&str, String)],
        limit: usize,
        decode: fn(&str) -> Page<T>,
    ) -> Result<Vec<T>, TrackerError> {
        let mut all = Vec::new();
        let mut offset = 0_usize;

        while all.len() < limit {
            let mut page_query = query.to_vec();
            page_query.push(("offset", offset.to_string()));
            page_query.push(("limit", self.page_size.to_string()));

            let body = self.get_text(url.clone(), &page_query)?;
            let page = decode(&body);
            debug!(
                path = url.path(),
                offset,
                received = page.received,
                decoded = page.items.len(),
                total = ?page.total_count,
                "redmine page"
            );

            all.extend(page.items);
            offset += page.received;

            if page.received == 0 || page.received < self.page_size {
                break;
            }
            if page.total_count.is_some_and(|total| offset >= total) {
                break;
            }
        }

        all.truncate(limit);
        Ok(all)
    }

    fn project_endpoint(&self, project_id: &str, resource: &str) -> Url {
        self.endpoint(&["projects", project_id, resource])
    }

    fn wiki_endpoint(&self, project_id: &str, title: &str, version: Option<i64>) -> Url {
        match version {
            Some(version) => self.endpoint(&[
                "projects",
                project_id,
                "wiki",
                title,
                &format!("{version}.json"),
            ]),
            None => self.endpoint(&["projects", project_id, "wiki", &format!("{title}.json")]),
        }
    }

    fn load_task(&self, task_id: i64, include: &str) -> Result<Task, TrackerError> {
        let url = self.endpoint(&["issues", &format!("{task_id}.json")]);
        let body = self.get_text(url, &[("include", include.to_string())])?;
        codec::decode_task(&body).ok_or_else(|| TrackerError::NotFound(format!("task #{task_id}")))
    }

    fn load_entities(&self, segments: &[&str], key: &str) -> Result<Vec<SimpleEntity>, TrackerError> {
        let body = self.get_text(self.endpoint(segments), &[])?;
        Ok(codec::decode_entities(&body, key))
    }

    fn load_metadata(
        &self,
        kind: MetadataKind,
        project_id: &str,
    ) -> Result<Vec<SimpleEntity>, TrackerError> {
        match kind {
            MetadataKind::Users => {
                let users = self.fetch_paged(
                    self.project_endpoint(project_id, "memberships.json"),
                    &[],
                    UNLIMITED,
                    codec::decode_membership_page,
                )?;
                Ok(dedupe_entities(users))
            }
            MetadataKind::Trackers => {
                let url = self.endpoint(&["projects", &format!("{project_id}.json")]);
                let body = self.get_text(url, &[("include", "trackers".to_string())])?;
                let scoped = codec::decode_project_trackers(&body);
                if !scoped.is_empty() {
                    return Ok(scoped);
                }
                debug!(project_id, "no project trackers, falling back to global list");
                self.load_entities(&["trackers.json"], "trackers")
            }
            MetadataKind::Categories => self.load_entities(
                &["projects", project_id, "issue_categories.json"],
                "issue_categories",
            ),
            MetadataKind::Priorities => self.load_entities(
                &["enumerations", "issue_priorities.json"],
                "issue_priorities",
            ),
            MetadataKind::Statuses => self.load_entities(&["issue_statuses.json"], "issue_statuses"),
            MetadataKind::Versions => Ok(self
                .load_versions(project_id)?
                .iter()
                .map(VersionDto::to_entity)
                .collect()),
            MetadataKind::Activities => self.load_entities(
                &["enumerations", "time_entry_activities.json"],
                "time_entry_activities",
            ),
        }
    }

    fn load_versions(&self, project_id: &str) -> Result<Vec<VersionDto>, TrackerError> {
        let body = self.get_text(self.project_endpoint(project_id, "versions.json"), &[])?;
        Ok(codec::decode_versions(&body))
    }

    fn load_wiki_page(
        &self,
        project_id: &str,
        title: &str,
        version: Option<i64>,
    ) -> Result<WikiPageDto, TrackerError> {
        let url = self.wiki_endpoint(project_id, title, version);
        let body = self.get_text(url, &[("include", "attachments".to_string())])?;
        codec::decode_wiki_page(&body).ok_or_else(|| match version {
            Some(v) => TrackerError::NotFound(format!("wiki page '{title}' version {v}")),
            None => TrackerError::NotFound(format!("wiki page '{title}'")),
        })
    }

    fn put_wiki_page(
        &self,
        project_id: &str,
        page: &WikiPageDto,
        uploads: &[Upload],
    ) -> Result<(), TrackerError> {
        if page.title.trim().is_empty() {
            return Err(TrackerError::InvalidRequest(
                "wiki page title must not be empty".into(),
            ));
        }
        let body = codec::encode_wiki_page(page, uploads).map_err(TrackerError::Encode)?;
        self.send_json(
            Method::PUT,
            self.wiki_endpoint(project_id, &page.title, None),
            body,
        )?;
        Ok(())
    }

    fn load_wiki_history(
        &self,
        project_id: &str,
        title: &str,
    ) -> Result<Vec<WikiVersionDto>, TrackerError> {
        let current = self.load_wiki_page(project_id, title, None)?;
        let latest = current.version.unwrap_or(1);
        let mut history = vec![wiki_version(latest, &current)];
        for version in (1..latest).rev() {
            let page = self.load_wiki_page(project_id, title, Some(version))?;
            history.push(wiki_version(version, &page));
        }
        Ok(history)
    }

    fn attach_to_wiki(
        &self,
        project_id: &str,
        title: &str,
        filename: &str,
        content: &[u8],
    ) -> Result<(), TrackerError> {
        let current = self.load_wiki_page(project_id, title, None)?;
        let token = self.upload(filename, content)?;
        let page = WikiPageDto {
            title: current.title.clone(),
            text: current.text.clone(),
            version: current.version,
            comments: Some(format!("Attached {filename}")),
            ..WikiPageDto::default()
        };
        let upload = Upload {
            token,
            filename: filename.to_string(),
            content_type: None,
            description: None,
        };
        self.put_wiki_page(project_id, &page, &[upload])
    }

    fn revert_wiki(&self, project_id: &str, title: &str, version: i64) -> Result<(), TrackerError> {
        let current = self.load_wiki_page(project_id, title, None)?;
        if current.version == Some(version) {
            debug!(project_id, title, version, "wiki page already at requested version");
            return Ok(());
        }
        let old = self.load_wiki_page(project_id, title, Some(version))?;
        let page = WikiPageDto {
            title: current.title.clone(),
            parent_title: current.parent_title.clone(),
            text: old.text,
            version: current.version,
            comments: Some(format!("Reverted to version {version}")),
            ..WikiPageDto::default()
        };
        self.put_wiki_page(project_id, &page, &[])
    }

    fn upload(&self, filename: &str, content: &[u8]) -> Result<String, TrackerError> {
        let url = self.endpoint(&["uploads.json"]);
        let response = self.execute(0, || {
            self.authorized(self.http.post(url.clone()))
                .query(&[("filename", filename)])
                .header(CONTENT_TYPE, "application/octet-stream")
                .body(content.to_vec())
                .send()
        })?;
        let body = check_status(response)?.text()?;
        codec::decode_upload_token(&body)
            .ok_or_else(|| TrackerError::Decode(format!("upload response carried no token: {}", shorten(&body))))
    }

    fn download(&self, content_url: &str) -> Result<Vec<u8>, TrackerError> {
        let url = Url::parse(content_url)
            .or_else(|_| self.base.join(content_url))
            .map_err(|_| TrackerError::InvalidRequest(format!("bad attachment url '{content_url}'")))?;
        let same_host = url.host_str() == self.base.host_str();
        let response = self.execute(self.max_retries, || {
            let request = self.http.get(url.clone());
            if same_host {
                self.authorized(request).send()
            } else {
                request.send()
            }
        })?;
        Ok(check_status(response)?.bytes()?.to_vec())
    }

    fn download_by_id(&self, attachment_id: i64) -> Result<Vec<u8>, TrackerError> {
        let url = self.endpoint(&["attachments", &format!("{attachment_id}.json")]);
        let body = self.get_text(url, &[])?;
        let content_url = codec::decode_attachment(&body)
            .and_then(|a| a.content_url)
            .ok_or_else(|| TrackerError::NotFound(format!("attachment #{attachment_id}")))?;
        self.download(&content_url)
    }
}

impl TrackerClient for RedmineClient {
    fn fetch_tasks(
        &self,
        project_id: &str,
        filter: &TaskFilter,
        limit: usize,
    ) -> Result<Vec<Task>, TrackerError> {
        let status = if filter.include_closed { "*" } else { "open" };
        let mut query = vec![
            ("project_id", project_id.to_string()),
            ("status_id", status.to_string()),
        ];
        if filter.assigned_to_me {
            query.push(("assigned_to_id", "me".to_string()));
        }
        self.fetch_paged(
            self.endpoint(&["issues.json"]),
            &query,
            limit,
            codec::decode_task_page,
        )
        .map_err(|err| err.context(format!("failed to fetch tasks for project {project_id}")))
    }

    fn fetch_task(&self, task_id: i64) -> Result<Task, TrackerError> {
        self.load_task(task_id, TASK_DETAIL_INCLUDES)
            .map_err(|err| err.context(format!("failed to fetch task #{task_id}")))
    }

    fn fetch_tasks_by_ids(&self, ids: &[i64]) -> Result<Vec<Task>, TrackerError> {
        // Repeated ids are looked up and returned once, at their first position.
        let mut seen = HashSet::with_capacity(ids.len());
        let ids: Vec<i64> = ids.iter().copied().filter(|id| seen.insert(*id)).collect();
        let mut all = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(self.max_batch_ids) {
            let joined = chunk
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",");
            let query = [
                ("issue_id", joined),
                ("status_id", "*".to_string()),
                ("limit", chunk.len().to_string()),
            ];
            let body = self
                .get_text(self.endpoint(&["issues.json"]), &query)
                .map_err(|err| err.context(format!("failed to fetch {} tasks by id", ids.len())))?;
            let mut found: HashMap<i64, Task> = codec::decode_tasks(&body)
                .into_iter()
                .map(|task| (task.id, task))
                .collect();
            all.extend(chunk.iter().filter_map(|id| found.remove(id)));
        }
        Ok(all)
    }

    fn fetch_tasks_by_version(&self, version_id: i64) -> Result<Vec<Task>, TrackerError> {
        let query = [
            ("fixed_version_id", version_id.to_string()),
            ("status_id", "*".to_string()),
        ];
        self.fetch_paged(
            self.endpoint(&["issues.json"]),
            &query,
            UNLIMITED,
            codec::decode_task_page,
        )
        .map_err(|err| err.context(format!("failed to fetch tasks for version #{version_id}")))
    }

    fn fetch_closed_tasks(&self, project_id: &str, limit: usize) -> Result<Vec<Task>, TrackerError> {
        let query = [
            ("project_id", project_id.to_string()),
            ("status_id", "closed".to_string()),
            ("sort", "closed_on:desc".to_string()),
        ];
        self.fetch_paged(
            self.endpoint(&["issues.json"]),
            &query,
            limit,
            codec::decode_task_page,
        )
        .map_err(|err| {
            err.context(format!(
                "failed to fetch closed tasks for project {project_id}"
            ))
        })
    }

    fn create_task(&self, project_id: &str, task: &Task) -> Result<Task, TrackerError> {
        let body = codec::encode_task_for_create(project_id, task).map_err(TrackerError::Encode)?;
        self.send_json(Method::POST, self.endpoint(&["issues.json"]), body)
            .and_then(|created| {
                codec::decode_task(&created).ok_or_else(|| {
                    TrackerError::Decode("created task missing from response".into())
                })
            })
            .map_err(|err| err.context(format!("failed to create task in project {project_id}")))
    }

    fn update_task(&self, task: &Task) -> Result<(), TrackerError> {
        if task.id <= 0 {
            return Err(TrackerError::InvalidRequest(
                "cannot update a task that has no id".into(),
            ));
        }
        let body = codec::encode_task_for_update(task).map_err(TrackerError::Encode)?;
        self.send_json(
            Method::PUT,
            self.endpoint(&["issues", &format!("{}.json", task.id)]),
            body,
        )
        .map(drop)
        .map_err(|err| err.context(format!("failed to update task #{}", task.id)))
    }

    fn fetch_allowed_statuses(&self, task_id: i64) -> Result<Vec<SimpleEntity>, TrackerError> {
        self.load_task(task_id, "allowed_statuses")
            .map(|task| task.allowed_statuses)
            .map_err(|err| {
                err.context(format!(
                    "failed to fetch allowed statuses for task #{task_id}"
                ))
            })
    }

    fn fetch_metadata(
        &self,
        kind: &str,
        project_id: &str,
    ) -> Result<Vec<SimpleEntity>, TrackerError> {
        let Ok(kind) = kind.parse::<MetadataKind>() else {
            debug!(kind, "unknown metadata type requested");
            return Ok(Vec::new());
        };
        self.load_metadata(kind, project_id)
            .map_err(|err| err.context(format!("failed to fetch {kind} for project {project_id}")))
    }

    fn fetch_custom_field_definitions(&self) -> Result<Vec<CustomFieldDefinition>, TrackerError> {
        self.get_text(self.endpoint(&["custom_fields.json"]), &[])
            .map(|body| codec::decode_custom_field_definitions(&body))
            .map_err(|err| err.context("failed to fetch custom field definitions"))
    }

    fn fetch_current_user(&self) -> Result<SimpleEntity, TrackerError> {
        self.get_text(self.endpoint(&["users", "current.json"]), &[])
            .and_then(|body| {
                codec::decode_current_user(&body)
                    .ok_or_else(|| TrackerError::NotFound("current user".into()))
            })
            .map_err(|err| err.context("failed to fetch current user"))
    }

    fn fetch_project(&self, project_id: &str) -> Result<SimpleEntity, TrackerError> {
        self.get_text(
            self.endpoint(&["projects", &format!("{project_id}.json")]),
            &[],
        )
        .and_then(|body| {
            codec::decode_project(&body)
                .ok_or_else(|| TrackerError::NotFound(format!("project {project_id}")))
        })
        .map_err(|err| err.context(format!("failed to fetch project {project_id}")))
    }

    fn fetch_context(&self, project_id: &str) -> Result<ContextMetadata, TrackerError> {
        Ok(ContextMetadata {
            server_url: self.base_url.clone(),
            current_user: Some(self.fetch_current_user()?),
            project: Some(self.fetch_project(project_id)?),
        })
    }

    fn fetch_versions(&self, project_id: &str) -> Result<Vec<VersionDto>, TrackerError> {
        self.load_versions(project_id)
            .map_err(|err| err.context(format!("failed to fetch versions for project {project_id}")))
    }

    fn create_version(
        &self,
        project_id: &str,
        version: &VersionDto,
    ) -> Result<VersionDto, TrackerError> {
        let body = codec::encode_version(version).map_err(TrackerError::Encode)?;
        self.send_json(
            Method::POST,
            self.project_endpoint(project_id, "versions.json"),
            body,
        )
        .and_then(|created| {
            codec::decode_version(&created)
                .ok_or_else(|| TrackerError::Decode("created version missing from response".into()))
        })
        .map_err(|err| {
            err.context(format!(
                "failed to create version '{}' in project {project_id}",
                version.name
            ))
        })
    }

    fn update_version(&self, version: &VersionDto) -> Result<(), TrackerError> {
        if version.id <= 0 {
            return Err(TrackerError::InvalidRequest(
                "cannot update a version that has no id".into(),
            ));
        }
        let body = codec::encode_version(version).map_err(TrackerError::Encode)?;
        self.send_json(
            Method::PUT,
            self.endpoint(&["versions", &format!("{}.json", version.id)]),
            body,
        )
        .map(drop)
        .map_err(|err| err.context(format!("failed to update version #{}", version.id)))
    }

    fn delete_version(&self, version_id: i64) -> Result<(), TrackerError> {
        self.delete(self.endpoint(&["versions", &format!("{version_id}.json")]))
            .map_err(|err| err.context(format!("failed to delete version #{version_id}")))
    }

    fn fetch_wiki_index(&self, project_id: &str) -> Result<Vec<WikiPageDto>, TrackerError> {
        self.get_text(
            self.endpoint(&["projects", project_id, "wiki", "index.json"]),
            &[],
        )
        .map(|body| codec::decode_wiki_index(&body))
        .map_err(|err| err.context(format!("failed to fetch wiki index for project {project_id}")))
    }

    fn fetch_wiki_page(
        &self,
        project_id: &str,
        title: &str,
        version: Option<i64>,
    ) -> Result<WikiPageDto, TrackerError> {
        self.load_wiki_page(project_id, title, version)
            .map_err(|err| err.context(format!("failed to fetch wiki page '{title}'")))
    }

    fn fetch_wiki_history(
        &self,
        project_id: &str,
        title: &str,
    ) -> Result<Vec<WikiVersionDto>, TrackerError> {
        self.load_wiki_history(project_id, title)
            .map_err(|err| err.context(format!("failed to fetch history of wiki page '{title}'")))
    }

    fn save_wiki_page(&self, project_id: &str, page: &WikiPageDto) -> Result<(), TrackerError> {
        self.put_wiki_page(project_id, page, &[])
            .map_err(|err| err.context(format!("failed to save wiki page '{}'", page.title)))
    }

    fn delete_wiki_page(&self, project_id: &str, title: &str) -> Result<(), TrackerError> {
        self.delete(self.wiki_endpoint(project_id, title, None))
            .map_err(|err| err.context(format!("failed to delete wiki page '{title}'")))
    }

    fn upload_wiki_attachment(
        &self,
        project_id: &str,
        title: &str,
        filename: &str,
        content: &[u8],
    ) -> Result<(), TrackerError> {
        self.attach_to_wiki(project_id, title, filename, content)
            .map_err(|err| {
                err.context(format!(
                    "failed to attach '{filename}' to wiki page '{title}'"
                ))
            })
    }

    fn revert_wiki_page(
        &self,
        project_id: &str,
        title: &str,
        version: i64,
    ) -> Result<(), TrackerError> {
        self.revert_wiki(project_id, title, version).map_err(|err| {
            err.context(format!(
                "failed to revert wiki page '{title}' to version {version}"
            ))
        })
    }

    fn upload_file(&self, filename: &str, content: &[u8]) -> Result<String, TrackerError> {
        self.upload(filename, content)
            .map_err(|err| err.context(format!("failed to upload '{filename}'")))
    }

    fn download_attachment(&self, content_url: &str) -> Result<Vec<u8>, TrackerError> {
        self.download(content_url)
            .map_err(|err| err.context(format!("failed to download {content_url}")))
    }

    fn download_attachment_by_id(&self, attachment_id: i64) -> Result<Vec<u8>, TrackerError> {
        self.download_by_id(attachment_id)
            .map_err(|err| err.context(format!("failed to download attachment #{attachment_id}")))
    }

    fn log_time(&self, entry: &TimeEntry) -> Result<TimeEntry, TrackerError> {
        let body = codec::encode_time_entry(entry).map_err(TrackerError::Encode)?;
        self.send_json(Method::POST, self.endpoint(&["time_entries.json"]), body)
            .and_then(|created| {
                codec::decode_time_entry(&created).ok_or_else(|| {
                    TrackerError::Decode("created time entry missing from response".into())
                })
            })
            .map_err(|err| err.context("failed to log time"))
    }

    fn fetch_time_entries(
        &self,
        project_id: Option<&str>,
        from: NaiveDate,
        to: NaiveDate,
        limit: usize,
    ) -> Result<Vec<TimeEntry>, TrackerError> {
        if from > to {
            return Err(TrackerError::InvalidRequest(format!(
                "time entry range starts after it ends ({from} > {to})"
            )));
        }
        let mut query = vec![
            ("user_id", "me".to_string()),
            ("from", from.format("%Y-%m-%d").to_string()),
            ("to", to.format("%Y-%m-%d").to_string()),
        ];
        if let Some(project_id) = project_id {
            query.push(("project_id", project_id.to_string()));
        }
        self.fetch_paged(
            self.endpoint(&["time_entries.json"]),
            &query,
            limit,
            codec::decode_time_entry_page,
        )
        .map_err(|err| err.context(format!("failed to fetch time entries {from}..{to}")))
    }
}

fn wiki_version(version: i64, page: &WikiPageDto) -> WikiVersionDto {
    WikiVersionDto {
        version,
        author: page.author.clone(),
        comments: page.comments.clone(),
        updated_on: page.updated_on.clone(),
    }
}

fn dedupe_entities(entities: Vec<SimpleEntity>) -> Vec<SimpleEntity> {
    let mut seen = HashSet::new();
    entities
        .into_iter()
        .filter(|entity| seen.insert(entity.id))
        .collect()
}

fn check_status(response: Response) -> Result<Response, TrackerError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    if status == StatusCode::UNPROCESSABLE_ENTITY {
        let messages = codec::decode_error_messages(&body);
        if !messages.is_empty() {
            return Err(TrackerError::Rejected { status, messages });
        }
    }
    Err(TrackerError::Http {
        status,
        body: shorten(&body),
    })
}

fn shorten(body: &str) -> String {
    if body.chars().count() > MAX_ERROR_BODY_CHARS {
        let head: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
        format!("{head}...")
    } else {
        body.to_string()
    }
}

fn normalize_base_url(raw: &str) -> Result<String, TrackerError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(TrackerError::InvalidBaseUrl(raw.to_string()));
    }

    let mut candidate = trimmed.to_string();

    if candidate.starts_with("https://https//") {
        candidate = candidate.replacen("https://https//", "https://", 1);
    } else if candidate.starts_with("http://http//") {
        candidate = candidate.replacen("http://http//", "http://", 1);
    }

    if candidate.starts_with("https//") {
        candidate = format!("https://{}", candidate.trim_start_matches("https//"));
    } else if candidate.starts_with("http//") {
        candidate = format!("http://{}", candidate.trim_start_matches("http//"));
    } else if !candidate.starts_with("https://") && !candidate.starts_with("http://") {
        candidate = format!("https://{candidate}");
    }

    let parsed = Url::parse(&candidate).map_err(|_| TrackerError::InvalidBaseUrl(raw.to_string()))?;
    if parsed.cannot_be_a_base() || parsed.host_str().is_none() {
        return Err(TrackerError::InvalidBaseUrl(raw.to_string()));
    }
    Ok(parsed.as_str().trim_end_matches('/').to_string())
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn retry_after_or_backoff(response: &Response, attempt: usize, base: Duration) -> Duration {
    if let Some(header) = response.headers().get("Retry-After") {
        if let Ok(value) = header.to_str() {
            if let Ok(seconds) = value.parse::<u64>() {
                return Duration::from_secs(seconds).min(MAX_RETRY_WAIT);
            }
        }
    }

    backoff_delay(attempt, base)
}

fn backoff_delay(attempt: usize, base: Duration) -> Duration {
    base.checked_mul(1_u32 << attempt.min(4))
        .unwrap_or(MAX_RETRY_WAIT)
        .min(MAX_RETRY_WAIT)
}

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::TtlCache;
use crate::client::{MetadataKind, TaskFilter, TrackerClient, TrackerError};
use crate::config::CacheConfig;
use crate::metrics::Metrics;
use crate::model::{
    ContextMetadata, CustomFieldDefinition, SimpleEntity, Task, TimeEntry, VersionDto,
    WikiPageDto, WikiVersionDto,
};

const CUSTOM_FIELDS_KEY: &str = "custom_fields:all";
const CURRENT_USER_KEY: &str = "current_user:self";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum CachedValue {
    Entities(Vec<SimpleEntity>),
    Entity(SimpleEntity),
    Definitions(Vec<CustomFieldDefinition>),
    Versions(Vec<VersionDto>),
    WikiIndex(Vec<WikiPageDto>),
    WikiPage(WikiPageDto),
}

trait CacheSlot: Sized {
    fn into_cached(self) -> CachedValue;
    fn from_cached(value: CachedValue) -> Option<Self>;
}

macro_rules! cache_slot {
    ($ty:ty, $variant:ident) => {
        impl CacheSlot for $ty {
            fn into_cached(self) -> CachedValue {
                CachedValue::$variant(self)
            }

            fn from_cached(value: CachedValue) -> Option<Self> {
                match value {
                    CachedValue::$variant(inner) => Some(inner),
                    _ => None,
                }
            }
        }
    };
}

cache_slot!(Vec<SimpleEntity>, Entities);
cache_slot!(SimpleEntity, Entity);
cache_slot!(Vec<CustomFieldDefinition>, Definitions);
cache_slot!(Vec<VersionDto>, Versions);
cache_slot!(Vec<WikiPageDto>, WikiIndex);
cache_slot!(WikiPageDto, WikiPage);

fn metadata_key(kind: MetadataKind, project_id: &str) -> String {
    match kind {
        MetadataKind::Versions => format!("versions:{project_id}:entities"),
        other => format!("{other}:{project_id}"),
    }
}

fn wiki_index_key(project_id: &str) -> String {
    format!("wiki:index:{project_id}")
}

fn wiki_page_key(project_id: &str, title: &str) -> String {
    format!("wiki:page:{project_id}:{title}")
}

/// Read-through caching decorator around any [`TrackerClient`].
///
/// Reference data, versions and wiki content are cached; tasks and time
/// entries always reach the wrapped client. Metadata additionally keeps a
/// last-known-good copy for `stale_ttl`, served when a refresh fails.
pub struct CachingClient<C> {
    inner: C,
    cache: TtlCache<CachedValue>,
    fallback: TtlCache<CachedValue>,
    stale_ttl: Duration,
    metadata_ttl: Duration,
    versions_ttl: Duration,
    wiki_ttl: Duration,
    metrics: Arc<Metrics>,
}

impl<C: TrackerClient> CachingClient<C> {
    pub fn new(inner: C, config: &CacheConfig, metrics: Arc<Metrics>) -> Self {
        let sweep = Some(config.sweep_interval()).filter(|interval| !interval.is_zero());
        let cache = match &config.snapshot_path {
            Some(path) => TtlCache::with_persistence(sweep, path),
            None => sweep.map(TtlCache::with_sweep).unwrap_or_default(),
        };
        Self {
            inner,
            cache,
            fallback: sweep.map(TtlCache::with_sweep).unwrap_or_default(),
            stale_ttl: config.stale_ttl(),
            metadata_ttl: config.metadata_ttl(),
            versions_ttl: config.versions_ttl(),
            wiki_ttl: config.wiki_ttl(),
            metrics,
        }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    pub fn cache(&self) -> &TtlCache<CachedValue> {
        &self.cache
    }

    fn read_through<T, F>(
        &self,
        key: String,
        ttl: Duration,
        stale_if_error: bool,
        fetch: F,
    ) -> Result<T, TrackerError>
    where
        T: CacheSlot + Clone,
        F: FnOnce() -> Result<T, TrackerError>,
    {
        if let Some(hit) = self.cache.get(&key).and_then(T::from_cached) {
            self.metrics.inc_cache_hit();
            return Ok(hit);
        }

        self.metrics.inc_cache_miss();
        match fetch() {
            Ok(fresh) => {
                if stale_if_error {
                    self.fallback.put(
                        key.clone(),
                        fresh.clone().into_cached(),
                        self.stale_ttl.max(ttl),
                    );
                }
                self.cache.put(key, fresh.clone().into_cached(), ttl);
                Ok(fresh)
            }
            Err(err) => {
                if stale_if_error {
                    if let Some(stale) = self.fallback.get(&key).and_then(T::from_cached) {
                        warn!(
                            key = %key,
                            error = %err,
                            "serving stale cached value after refresh failure"
                        );
                        self.metrics.inc_stale_served();
                        return Ok(stale);
                    }
                }
                Err(err)
            }
        }
    }

    fn forget(&self, key: &str) {
        self.cache.invalidate(key);
        self.fallback.invalidate(key);
    }

    fn forget_pattern(&self, pattern: &str) {
        let removed = self.cache.invalidate_pattern(pattern);
        self.fallback.invalidate_pattern(pattern);
        debug!(pattern, removed, "cache entries invalidated");
    }

    fn forget_wiki_page(&self, project_id: &str, title: &str) {
        self.forget(&wiki_page_key(project_id, title));
        self.forget(&wiki_index_key(project_id));
    }

    fn after_write<T>(
        &self,
        result: Result<T, TrackerError>,
        invalidate: impl FnOnce(),
    ) -> Result<T, TrackerError> {
        if result.is_ok() {
            invalidate();
        }
        result
    }
}

impl<C: TrackerClient> TrackerClient for CachingClient<C> {
    fn fetch_tasks(
        &self,
        project_id: &str,
        filter: &TaskFilter,
        limit: usize,
    ) -> Result<Vec<Task>, TrackerError> {
        self.inner
            .fetch_tasks(project_id, filter, limit)
            .map_err(|err| err.context(format!("uncached fetch of tasks for project {project_id}")))
    }

    fn fetch_task(&self, task_id: i64) -> Result<Task, TrackerError> {
        self.inner
            .fetch_task(task_id)
            .map_err(|err| err.context(format!("uncached fetch of task #{task_id}")))
    }

    fn fetch_tasks_by_ids(&self, ids: &[i64]) -> Result<Vec<Task>, TrackerError> {
        self.inner
            .fetch_tasks_by_ids(ids)
            .map_err(|err| err.context(format!("uncached lookup of {} tasks by id", ids.len())))
    }

    fn fetch_tasks_by_version(&self, version_id: i64) -> Result<Vec<Task>, TrackerError> {
        self.inner
            .fetch_tasks_by_version(version_id)
            .map_err(|err| err.context(format!("uncached fetch of tasks in version #{version_id}")))
    }

    fn fetch_closed_tasks(&self, project_id: &str, limit: usize) -> Result<Vec<Task>, TrackerError> {
        self.inner.fetch_closed_tasks(project_id, limit).map_err(|err| {
            err.context(format!("uncached fetch of closed tasks for project {project_id}"))
        })
    }

    fn create_task(&self, project_id: &str, task: &Task) -> Result<Task, TrackerError> {
        self.inner
            .create_task(project_id, task)
            .map_err(|err| err.context(format!("task creation in project {project_id}")))
    }

    fn update_task(&self, task: &Task) -> Result<(), TrackerError> {
        let result = self
            .inner
            .update_task(task)
            .map_err(|err| err.context(format!("update of task #{}", task.id)));
        self.after_write(result, || self.forget(&format!("allowed_statuses:{}", task.id)))
    }

    fn fetch_allowed_statuses(&self, task_id: i64) -> Result<Vec<SimpleEntity>, TrackerError> {
        self.read_through(
            format!("allowed_statuses:{task_id}"),
            self.metadata_ttl,
            true,
            || self.inner.fetch_allowed_statuses(task_id),
        )
        .map_err(|err| err.context(format!("cached fetch of allowed statuses for task #{task_id}")))
    }

    fn fetch_metadata(
        &self,
        kind: &str,
        project_id: &str,
    ) -> Result<Vec<SimpleEntity>, TrackerError> {
        let result = match kind.parse::<MetadataKind>() {
            Err(_) => self.inner.fetch_metadata(kind, project_id),
            Ok(parsed) => {
                let ttl = match parsed {
                    MetadataKind::Versions => self.versions_ttl,
                    _ => self.metadata_ttl,
                };
                self.read_through(metadata_key(parsed, project_id), ttl, true, || {
                    self.inner.fetch_metadata(parsed.as_str(), project_id)
                })
            }
        };
        result.map_err(|err| err.context(format!("cached fetch of {kind} for project {project_id}")))
    }

    fn fetch_custom_field_definitions(&self) -> Result<Vec<CustomFieldDefinition>, TrackerError> {
        self.read_through(CUSTOM_FIELDS_KEY.to_string(), self.metadata_ttl, true, || {
            self.inner.fetch_custom_field_definitions()
        })
        .map_err(|err| err.context("cached fetch of custom field definitions"))
    }

    fn fetch_current_user(&self) -> Result<SimpleEntity, TrackerError> {
        self.read_through(CURRENT_USER_KEY.to_string(), self.metadata_ttl, true, || {
            self.inner.fetch_current_user()
        })
        .map_err(|err| err.context("cached fetch of the current user"))
    }

    fn fetch_project(&self, project_id: &str) -> Result<SimpleEntity, TrackerError> {
        self.read_through(format!("project:{project_id}"), self.metadata_ttl, true, || {
            self.inner.fetch_project(project_id)
        })
        .map_err(|err| err.context(format!("cached fetch of project {project_id}")))
    }

    fn fetch_context(&self, project_id: &str) -> Result<ContextMetadata, TrackerError> {
        let context = self
            .inner
            .fetch_context(project_id)
            .map_err(|err| err.context(format!("uncached fetch of context for project {project_id}")))?;
        if let Some(user) = &context.current_user {
            self.cache
                .put(CURRENT_USER_KEY, user.clone().into_cached(), self.metadata_ttl);
        }
        if let Some(project) = &context.project {
            self.cache.put(
                format!("project:{project_id}"),
                project.clone().into_cached(),
                self.metadata_ttl,
            );
        }
        Ok(context)
    }

    fn fetch_versions(&self, project_id: &str) -> Result<Vec<VersionDto>, TrackerError> {
        self.read_through(format!("versions:{project_id}"), self.versions_ttl, false, || {
            self.inner.fetch_versions(project_id)
        })
        .map_err(|err| err.context(format!("cached fetch of versions for project {project_id}")))
    }

    fn create_version(
        &self,
        project_id: &str,
        version: &VersionDto,
    ) -> Result<VersionDto, TrackerError> {
        let result = self
            .inner
            .create_version(project_id, version)
            .map_err(|err| err.context(format!("version creation in project {project_id}")));
        self.after_write(result, || self.forget_pattern("versions:*"))
    }

    fn update_version(&self, version: &VersionDto) -> Result<(), TrackerError> {
        let result = self
            .inner
            .update_version(version)
            .map_err(|err| err.context(format!("update of version #{}", version.id)));
        self.after_write(result, || self.forget_pattern("versions:*"))
    }

    fn delete_version(&self, version_id: i64) -> Result<(), TrackerError> {
        let result = self
            .inner
            .delete_version(version_id)
            .map_err(|err| err.context(format!("deletion of version #{version_id}")));
        self.after_write(result, || self.forget_pattern("versions:*"))
    }

    fn fetch_wiki_index(&self, project_id: &str) -> Result<Vec<WikiPageDto>, TrackerError> {
        self.read_through(wiki_index_key(project_id), self.wiki_ttl, false, || {
            self.inner.fetch_wiki_index(project_id)
        })
        .map_err(|err| err.context(format!("cached fetch of wiki index for project {project_id}")))
    }

    fn fetch_wiki_page(
        &self,
        project_id: &str,
        title: &str,
        version: Option<i64>,
    ) -> Result<WikiPageDto, TrackerError> {
        let result = if version.is_some() {
            self.inner.fetch_wiki_page(project_id, title, version)
        } else {
            self.read_through(wiki_page_key(project_id, title), self.wiki_ttl, false, || {
                self.inner.fetch_wiki_page(project_id, title, None)
            })
        };
        result.map_err(|err| {
            err.context(format!("cached fetch of wiki page '{title}' in project {project_id}"))
        })
    }

    fn fetch_wiki_history(
        &self,
        project_id: &str,
        title: &str,
    ) -> Result<Vec<WikiVersionDto>, TrackerError> {
        self.inner.fetch_wiki_history(project_id, title).map_err(|err| {
            err.context(format!("uncached fetch of history for wiki page '{title}'"))
        })
    }

    fn save_wiki_page(&self, project_id: &str, page: &WikiPageDto) -> Result<(), TrackerError> {
        let result = self
            .inner
            .save_wiki_page(project_id, page)
            .map_err(|err| err.context(format!("save of wiki page '{}'", page.title)));
        self.after_write(result, || self.forget_wiki_page(project_id, &page.title))
    }

    fn delete_wiki_page(&self, project_id: &str, title: &str) -> Result<(), TrackerError> {
        let result = self
            .inner
            .delete_wiki_page(project_id, title)
            .map_err(|err| err.context(format!("deletion of wiki page '{title}'")));
        self.after_write(result, || self.forget_wiki_page(project_id, title))
    }

    fn upload_wiki_attachment(
        &self,
        project_id: &str,
        title: &str,
        filename: &str,
        content: &[u8],
    ) -> Result<(), TrackerError> {
        let result = self
            .inner
            .upload_wiki_attachment(project_id, title, filename, content)
            .map_err(|err| err.context(format!("attaching {filename} to wiki page '{title}'")));
        self.after_write(result, || self.forget_wiki_page(project_id, title))
    }

    fn revert_wiki_page(
        &self,
        project_id: &str,
        title: &str,
        version: i64,
    ) -> Result<(), TrackerError> {
        let result = self
            .inner
            .revert_wiki_page(project_id, title, version)
            .map_err(|err| err.context(format!("revert of wiki page '{title}' to version {version}")));
        self.after_write(result, || self.forget_wiki_page(project_id, title))
    }

    fn upload_file(&self, filename: &str, content: &[u8]) -> Result<String, TrackerError> {
        self.inner
            .upload_file(filename, content)
            .map_err(|err| err.context(format!("upload of {filename}")))
    }

    fn download_attachment(&self, content_url: &str) -> Result<Vec<u8>, TrackerError> {
        self.inner
            .download_attachment(content_url)
            .map_err(|err| err.context(format!("download of {content_url}")))
    }

    fn download_attachment_by_id(&self, attachment_id: i64) -> Result<Vec<u8>, TrackerError> {
        self.inner
            .download_attachment_by_id(attachment_id)
            .map_err(|err| err.context(format!("download of attachment #{attachment_id}")))
    }

    fn log_time(&self, entry: &TimeEntry) -> Result<TimeEntry, TrackerError> {
        self.inner
            .log_time(entry)
            .map_err(|err| err.context("time entry creation"))
    }

    fn fetch_time_entries(
        &self,
        project_id: Option<&str>,
        from: NaiveDate,
        to: NaiveDate,
        limit: usize,
    ) -> Result<Vec<TimeEntry>, TrackerError> {
        self.inner
            .fetch_time_entries(project_id, from, to, limit)
            .map_err(|err| err.context(format!("uncached fetch of time entries {from}..{to}")))
    }

    fn close(&self) {
        self.cache.persist();
        self.inner.close();
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use httpmock::Method::{GET, PUT};
    use httpmock::MockServer;
    use serde_json::json;

    use super::*;
    use crate::http::RedmineClient;

    fn caching(server: &MockServer, config: CacheConfig) -> CachingClient<RedmineClient> {
        let inner = RedmineClient::new(&server.base_url(), "secret")
            .expect("client")
            .with_retries(0, Duration::ZERO);
        CachingClient::new(inner, &config, Arc::new(Metrics::new()))
    }

    fn short_ttl() -> CacheConfig {
        CacheConfig {
            metadata_ttl_secs: 1,
            versions_ttl_secs: 1,
            wiki_ttl_secs: 1,
            sweep_interval_secs: 0,
            stale_ttl_secs: 60,
            snapshot_path: None,
        }
    }

    #[test]
    fn tasks_are_never_cached_but_metadata_is() {
        let server = MockServer::start();
        let tasks = server.mock(|when, then| {
            when.method(GET).path("/issues.json");
            then.status(200)
                .json_body(json!({"issues": [{"id": 1}], "total_count": 1}));
        });
        let statuses = server.mock(|when, then| {
            when.method(GET).path("/issue_statuses.json");
            then.status(200)
                .json_body(json!({"issue_statuses": [{"id": 1, "name": "New"}]}));
        });

        let client = caching(&server, CacheConfig::default());
        for _ in 0..3 {
            client
                .fetch_tasks("ops", &TaskFilter::default(), 25)
                .expect("tasks");
        }
        let first = client.fetch_metadata("statuses", "ops").expect("statuses");
        let second = client.fetch_metadata("Statuses", "ops").expect("statuses");

        tasks.assert_hits(3);
        statuses.assert_hits(1);
        assert_eq!(first, second);
        assert!(client.cache().contains("statuses:ops"));
    }

    #[test]
    fn stale_metadata_is_served_when_refresh_fails() {
        let server = MockServer::start();
        let mut healthy = server.mock(|when, then| {
            when.method(GET).path("/issue_statuses.json");
            then.status(200)
                .json_body(json!({"issue_statuses": [{"id": 1, "name": "New"}]}));
        });

        let client = caching(&server, short_ttl());
        let fresh = client.fetch_metadata("statuses", "ops").expect("seed");
        healthy.delete();

        let failing = server.mock(|when, then| {
            when.method(GET);
            then.status(500).body("down");
        });
        thread::sleep(Duration::from_millis(1100));

        let stale = client
            .fetch_metadata("statuses", "ops")
            .expect("stale value instead of error");
        assert_eq!(stale, fresh);
        failing.assert_hits(1);

        let err = client
            .fetch_metadata("priorities", "ops")
            .expect_err("never fetched, so the error propagates");
        assert_eq!(err.status(), Some(reqwest::StatusCode::INTERNAL_SERVER_ERROR));
    }

    #[test]
    fn stale_copies_expire_after_their_own_ttl() {
        let server = MockServer::start();
        let _allowed = server.mock(|when, then| {
            when.method(GET).query_param("include", "allowed_statuses");
            then.status(200).json_body(json!({
                "issue": {"id": 1, "allowed_statuses": [{"id": 2, "name": "In Progress"}]}
            }));
        });

        let config = CacheConfig {
            stale_ttl_secs: 1,
            ..short_ttl()
        };
        let client = caching(&server, config);
        for task_id in 1..=50 {
            client.fetch_allowed_statuses(task_id).expect("statuses");
        }
        assert_eq!(client.fallback.size(), 50);

        thread::sleep(Duration::from_millis(1100));
        assert_eq!(client.cache.sweep_expired(), 50);
        assert_eq!(client.fallback.sweep_expired(), 50);
        assert_eq!(client.fallback.size(), 0);
    }

    #[test]
    fn errors_carry_the_decorator_context_over_the_transport_cause() {
        let server = MockServer::start();
        let _failing = server.mock(|when, then| {
            when.method(GET);
            then.status(404).body("missing");
        });

        let client = caching(&server, short_ttl());

        let err = client
            .fetch_metadata("statuses", "ops")
            .expect_err("nothing cached, so the error propagates");
        assert!(
            err.to_string().starts_with("cached fetch of statuses for project ops: "),
            "unexpected message: {err}"
        );
        assert!(matches!(
            err.root_cause(),
            TrackerError::Http { status, .. } if *status == reqwest::StatusCode::NOT_FOUND
        ));

        let err = client.fetch_task(12).expect_err("pass-through error");
        let TrackerError::Context { context, source } = &err else {
            panic!("expected a context layer, got {err:?}");
        };
        assert_eq!(context, "uncached fetch of task #12");
        assert!(matches!(**source, TrackerError::Context { .. }));
        assert!(matches!(err.root_cause(), TrackerError::NotFound(_) | TrackerError::Http { .. }));
    }

    #[test]
    fn wiki_content_is_not_served_stale() {
        let server = MockServer::start();
        let mut healthy = server.mock(|when, then| {
            when.method(GET).path("/projects/ops/wiki/index.json");
            then.status(200)
                .json_body(json!({"wiki_pages": [{"title": "Home", "version": 1}]}));
        });

        let client = caching(&server, short_ttl());
        client.fetch_wiki_index("ops").expect("seed");
        healthy.delete();
        let _failing = server.mock(|when, then| {
            when.method(GET);
            then.status(503);
        });
        thread::sleep(Duration::from_millis(1100));

        assert!(client.fetch_wiki_index("ops").is_err());
    }

    #[test]
    fn version_mutation_invalidates_every_version_key() {
        let server = MockServer::start();
        let listing = server.mock(|when, then| {
            when.method(GET).path("/projects/ops/versions.json");
            then.status(200)
                .json_body(json!({"versions": [{"id": 4, "name": "1.0"}]}));
        });
        let _update = server.mock(|when, then| {
            when.method(PUT).path("/versions/4.json");
            then.status(204);
        });

        let client = caching(&server, CacheConfig::default());
        client.fetch_versions("ops").expect("versions");
        client.fetch_metadata("versions", "ops").expect("entities");
        client.fetch_versions("ops").expect("cached");
        listing.assert_hits(2);

        let version = VersionDto {
            id: 4,
            name: "1.0".into(),
            ..VersionDto::default()
        };
        client.update_version(&version).expect("update");
        assert!(!client.cache().contains("versions:ops"));
        assert!(!client.cache().contains("versions:ops:entities"));

        client.fetch_versions("ops").expect("refetched");
        listing.assert_hits(3);
    }

    #[test]
    fn saving_a_wiki_page_drops_page_and_index() {
        let server = MockServer::start();
        let page = server.mock(|when, then| {
            when.method(GET).path("/projects/ops/wiki/Home.json");
            then.status(200)
                .json_body(json!({"wiki_page": {"title": "Home", "text": "v1", "version": 1}}));
        });
        let _index = server.mock(|when, then| {
            when.method(GET).path("/projects/ops/wiki/index.json");
            then.status(200).json_body(json!({"wiki_pages": [{"title": "Home"}]}));
        });
        let _save = server.mock(|when, then| {
            when.method(PUT).path("/projects/ops/wiki/Home.json");
            then.status(204);
        });

        let client = caching(&server, CacheConfig::default());
        client.fetch_wiki_page("ops", "Home", None).expect("page");
        client.fetch_wiki_page("ops", "Home", None).expect("cached");
        client.fetch_wiki_index("ops").expect("index");
        page.assert_hits(1);

        let edited = WikiPageDto {
            title: "Home".into(),
            text: Some("v2".into()),
            version: Some(1),
            ..WikiPageDto::default()
        };
        client.save_wiki_page("ops", &edited).expect("save");
        assert!(!client.cache().contains("wiki:page:ops:Home"));
        assert!(!client.cache().contains("wiki:index:ops"));

        client.fetch_wiki_page("ops", "Home", None).expect("page");
        page.assert_hits(2);
    }

    #[test]
    fn task_update_drops_allowed_statuses() {
        let server = MockServer::start();
        let allowed = server.mock(|when, then| {
            when.method(GET)
                .path("/issues/9.json")
                .query_param("include", "allowed_statuses");
            then.status(200).json_body(json!({
                "issue": {"id": 9, "allowed_statuses": [{"id": 2, "name": "In Progress"}]}
            }));
        });
        let _update = server.mock(|when, then| {
            when.method(PUT).path("/issues/9.json");
            then.status(204);
        });

        let client = caching(&server, CacheConfig::default());
        client.fetch_allowed_statuses(9).expect("statuses");
        client.fetch_allowed_statuses(9).expect("cached");
        allowed.assert_hits(1);

        let mut task = Task::new("s");
        task.id = 9;
        client.update_task(&task).expect("update");
        client.fetch_allowed_statuses(9).expect("refetched");
        allowed.assert_hits(2);
    }

    #[test]
    fn close_writes_snapshot_that_next_instance_reloads() {
        let server = MockServer::start();
        let defs = server.mock(|when, then| {
            when.method(GET).path("/custom_fields.json");
            then.status(200).json_body(json!({"custom_fields": [
                {"id": 3, "name": "Severity", "customized_type": "issue", "field_format": "list"}
            ]}));
        });

        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!(
            "redmine-access-cached-{}-{nanos}",
            std::process::id()
        ));
        let config = CacheConfig {
            snapshot_path: Some(dir.join("cache.db")),
            ..CacheConfig::default()
        };

        let first = caching(&server, config.clone());
        first.fetch_custom_field_definitions().expect("defs");
        first.close();
        drop(first);

        let second = caching(&server, config);
        let loaded = second.fetch_custom_field_definitions().expect("from snapshot");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "Severity");
        defs.assert_hits(1);
    }
}

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier, Condvar, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::NaiveDate;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::client::{TaskFilter, TrackerClient, TrackerError};
use crate::config::PoolConfig;
use crate::model::{
    ContextMetadata, CustomFieldDefinition, SimpleEntity, Task, TimeEntry, VersionDto,
    WikiPageDto, WikiVersionDto,
};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct PoolState {
    accepting: bool,
    running: usize,
}

#[derive(Debug)]
struct InFlight {
    state: Mutex<PoolState>,
    idle: Condvar,
}

impl InFlight {
    fn new() -> Self {
        Self {
            state: Mutex::new(PoolState {
                accepting: true,
                running: 0,
            }),
            idle: Condvar::new(),
        }
    }

    fn enter(self: &Arc<Self>) -> Option<InFlightGuard> {
        let mut state = self.state.lock().expect("pool state mutex poisoned");
        if !state.accepting {
            return None;
        }
        state.running += 1;
        Some(InFlightGuard {
            pool: Arc::clone(self),
        })
    }

    fn close(&self) -> bool {
        let mut state = self.state.lock().expect("pool state mutex poisoned");
        std::mem::replace(&mut state.accepting, false)
    }

    fn wait_idle(&self) {
        let mut state = self.state.lock().expect("pool state mutex poisoned");
        while state.running > 0 {
            state = self
                .idle
                .wait(state)
                .expect("pool condvar wait failed unexpectedly");
        }
    }
}

#[derive(Debug)]
struct InFlightGuard {
    pool: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut state = self.pool.state.lock().expect("pool state mutex poisoned");
        state.running = state.running.saturating_sub(1);
        if state.running == 0 {
            self.pool.idle.notify_all();
        }
    }
}

#[derive(Debug)]
enum HandleState<T> {
    Spawned(JoinHandle<Result<T, TrackerError>>),
    Rejected(Option<TrackerError>),
}

/// Pending result of an operation submitted to [`AsyncTrackerClient`].
///
/// Await it, or call [`TaskHandle::wait`] from synchronous code. Cancelling
/// prevents a queued job from starting; a job already talking to the server
/// runs to completion and its result is discarded.
#[derive(Debug)]
pub struct TaskHandle<T> {
    state: HandleState<T>,
    cancelled: Arc<AtomicBool>,
}

impl<T> TaskHandle<T> {
    fn rejected(err: TrackerError) -> Self {
        Self {
            state: HandleState::Rejected(Some(err)),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let HandleState::Spawned(handle) = &self.state {
            handle.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn wait(self) -> Result<T, TrackerError> {
        futures::executor::block_on(self)
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, TrackerError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            HandleState::Rejected(err) => {
                Poll::Ready(Err(err.take().unwrap_or(TrackerError::ShutDown)))
            }
            HandleState::Spawned(handle) => match Pin::new(handle).poll(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(_) if this.cancelled.load(Ordering::SeqCst) => {
                    Poll::Ready(Err(TrackerError::Cancelled))
                }
                Poll::Ready(Ok(result)) => Poll::Ready(result),
                Poll::Ready(Err(join_err)) if join_err.is_cancelled() => {
                    Poll::Ready(Err(TrackerError::Cancelled))
                }
                Poll::Ready(Err(join_err)) => {
                    Poll::Ready(Err(TrackerError::WorkerPanicked(join_err.to_string())))
                }
            },
        }
    }
}

pub struct AsyncTrackerClient<C> {
    client: Arc<C>,
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    in_flight: Arc<InFlight>,
}

impl<C: TrackerClient + 'static> AsyncTrackerClient<C> {
    pub fn new(client: C, pool: &PoolConfig) -> Result<Self, TrackerError> {
        Self::from_arc(Arc::new(client), pool)
    }

    /// Jobs run on the runtime's blocking pool, which grows to
    /// `max_threads` and retires threads idle for `keep_alive`;
    /// `core_threads` of them are started up front. A single async worker
    /// only drives the handles.
    pub fn from_arc(client: Arc<C>, pool: &PoolConfig) -> Result<Self, TrackerError> {
        let max_threads = pool.max_threads.max(1);
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(max_threads)
            .thread_keep_alive(pool.keep_alive())
            .thread_name("redmine-worker")
            .enable_all()
            .build()?;
        prestart_workers(runtime.handle(), pool.core_threads.clamp(1, max_threads));
        debug!(
            core = pool.core_threads,
            max = pool.max_threads,
            keep_alive_secs = pool.keep_alive_secs,
            "worker pool started"
        );
        Ok(Self {
            client,
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
            in_flight: Arc::new(InFlight::new()),
        })
    }

    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    fn submit<T, F>(&self, context: String, job: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(&C) -> Result<T, TrackerError> + Send + 'static,
    {
        let Some(guard) = self.in_flight.enter() else {
            return TaskHandle::rejected(TrackerError::ShutDown.context(context));
        };

        let client = Arc::clone(&self.client);
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        let handle = self.handle.spawn_blocking(move || {
            let _guard = guard;
            if flag.load(Ordering::SeqCst) {
                return Err(TrackerError::Cancelled);
            }
            job(&client).map_err(|err| {
                debug!(operation = %context, error = %err, "async operation failed");
                err.context(context)
            })
        });

        TaskHandle {
            state: HandleState::Spawned(handle),
            cancelled,
        }
    }

    pub fn shutdown(&self) {
        if !self.in_flight.close() {
            return;
        }
        self.in_flight.wait_idle();
        if let Some(runtime) = self.runtime.lock().expect("runtime mutex poisoned").take() {
            runtime.shutdown_timeout(SHUTDOWN_GRACE);
        }
        self.client.close();
        info!("async tracker client shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        !self
            .in_flight
            .state
            .lock()
            .expect("pool state mutex poisoned")
            .accepting
    }

    pub fn fetch_tasks(
        &self,
        project_id: impl Into<String>,
        filter: TaskFilter,
        limit: usize,
    ) -> TaskHandle<Vec<Task>> {
        let project_id = project_id.into();
        self.submit(
            format!("could not fetch tasks for project {project_id}"),
            move |c| c.fetch_tasks(&project_id, &filter, limit),
        )
    }

    pub fn fetch_task(&self, task_id: i64) -> TaskHandle<Task> {
        self.submit(format!("could not fetch task #{task_id}"), move |c| {
            c.fetch_task(task_id)
        })
    }

    pub fn fetch_tasks_by_ids(&self, ids: Vec<i64>) -> TaskHandle<Vec<Task>> {
        self.submit(format!("could not fetch {} tasks by id", ids.len()), move |c| {
            c.fetch_tasks_by_ids(&ids)
        })
    }

    pub fn fetch_tasks_by_version(&self, version_id: i64) -> TaskHandle<Vec<Task>> {
        self.submit(
            format!("could not fetch tasks for version #{version_id}"),
            move |c| c.fetch_tasks_by_version(version_id),
        )
    }

    pub fn fetch_closed_tasks(
        &self,
        project_id: impl Into<String>,
        limit: usize,
    ) -> TaskHandle<Vec<Task>> {
        let project_id = project_id.into();
        self.submit(
            format!("could not fetch closed tasks for project {project_id}"),
            move |c| c.fetch_closed_tasks(&project_id, limit),
        )
    }

    pub fn create_task(&self, project_id: impl Into<String>, task: Task) -> TaskHandle<Task> {
        let project_id = project_id.into();
        self.submit(
            format!("could not create task '{}' in project {project_id}", task.subject),
            move |c| c.create_task(&project_id, &task),
        )
    }

    pub fn update_task(&self, task: Task) -> TaskHandle<()> {
        self.submit(format!("could not update task #{}", task.id), move |c| {
            c.update_task(&task)
        })
    }

    pub fn fetch_allowed_statuses(&self, task_id: i64) -> TaskHandle<Vec<SimpleEntity>> {
        self.submit(
            format!("could not fetch allowed statuses for task #{task_id}"),
            move |c| c.fetch_allowed_statuses(task_id),
        )
    }

    pub fn fetch_metadata(
        &self,
        kind: impl Into<String>,
        project_id: impl Into<String>,
    ) -> TaskHandle<Vec<SimpleEntity>> {
        let kind = kind.into();
        let project_id = project_id.into();
        self.submit(
            format!("could not fetch {kind} for project {project_id}"),
            move |c| c.fetch_metadata(&kind, &project_id),
        )
    }

    pub fn fetch_custom_field_definitions(&self) -> TaskHandle<Vec<CustomFieldDefinition>> {
        self.submit("could not fetch custom field definitions".into(), |c| {
            c.fetch_custom_field_definitions()
        })
    }

    pub fn fetch_current_user(&self) -> TaskHandle<SimpleEntity> {
        self.submit("could not fetch the current user".into(), |c| {
            c.fetch_current_user()
        })
    }

    pub fn fetch_project(&self, project_id: impl Into<String>) -> TaskHandle<SimpleEntity> {
        let project_id = project_id.into();
        self.submit(format!("could not fetch project {project_id}"), move |c| {
            c.fetch_project(&project_id)
        })
    }

    pub fn fetch_context(&self, project_id: impl Into<String>) -> TaskHandle<ContextMetadata> {
        let project_id = project_id.into();
        self.submit(
            format!("could not fetch context for project {project_id}"),
            move |c| c.fetch_context(&project_id),
        )
    }

    pub fn fetch_versions(&self, project_id: impl Into<String>) -> TaskHandle<Vec<VersionDto>> {
        let project_id = project_id.into();
        self.submit(
            format!("could not fetch versions for project {project_id}"),
            move |c| c.fetch_versions(&project_id),
        )
    }

    pub fn create_version(
        &self,
        project_id: impl Into<String>,
        version: VersionDto,
    ) -> TaskHandle<VersionDto> {
        let project_id = project_id.into();
        self.submit(
            format!(
                "could not create version '{}' in project {project_id}",
                version.name
            ),
            move |c| c.create_version(&project_id, &version),
        )
    }

    pub fn update_version(&self, version: VersionDto) -> TaskHandle<()> {
        self.submit(format!("could not update version #{}", version.id), move |c| {
            c.update_version(&version)
        })
    }

    pub fn delete_version(&self, version_id: i64) -> TaskHandle<()> {
        self.submit(format!("could not delete version #{version_id}"), move |c| {
            c.delete_version(version_id)
        })
    }

    pub fn fetch_wiki_index(&self, project_id: impl Into<String>) -> TaskHandle<Vec<WikiPageDto>> {
        let project_id = project_id.into();
        self.submit(
            format!("could not fetch wiki index for project {project_id}"),
            move |c| c.fetch_wiki_index(&project_id),
        )
    }

    pub fn fetch_wiki_page(
        &self,
        project_id: impl Into<String>,
        title: impl Into<String>,
        version: Option<i64>,
    ) -> TaskHandle<WikiPageDto> {
        let project_id = project_id.into();
        let title = title.into();
        let context = match version {
            Some(v) => format!("could not fetch wiki page '{title}' version {v}"),
            None => format!("could not fetch wiki page '{title}'"),
        };
        self.submit(context, move |c| {
            c.fetch_wiki_page(&project_id, &title, version)
        })
    }

    pub fn fetch_wiki_history(
        &self,
        project_id: impl Into<String>,
        title: impl Into<String>,
    ) -> TaskHandle<Vec<WikiVersionDto>> {
        let project_id = project_id.into();
        let title = title.into();
        self.submit(
            format!("could not fetch history of wiki page '{title}'"),
            move |c| c.fetch_wiki_history(&project_id, &title),
        )
    }

    pub fn save_wiki_page(
        &self,
        project_id: impl Into<String>,
        page: WikiPageDto,
    ) -> TaskHandle<()> {
        let project_id = project_id.into();
        self.submit(
            format!("could not save wiki page '{}'", page.title),
            move |c| c.save_wiki_page(&project_id, &page),
        )
    }

    pub fn delete_wiki_page(
        &self,
        project_id: impl Into<String>,
        title: impl Into<String>,
    ) -> TaskHandle<()> {
        let project_id = project_id.into();
        let title = title.into();
        self.submit(format!("could not delete wiki page '{title}'"), move |c| {
            c.delete_wiki_page(&project_id, &title)
        })
    }

    pub fn upload_wiki_attachment(
        &self,
        project_id: impl Into<String>,
        title: impl Into<String>,
        filename: impl Into<String>,
        content: Vec<u8>,
    ) -> TaskHandle<()> {
        let project_id = project_id.into();
        let title = title.into();
        let filename = filename.into();
        self.submit(
            format!("could not attach '{filename}' to wiki page '{title}'"),
            move |c| c.upload_wiki_attachment(&project_id, &title, &filename, &content),
        )
    }

    pub fn revert_wiki_page(
        &self,
        project_id: impl Into<String>,
        title: impl Into<String>,
        version: i64,
    ) -> TaskHandle<()> {
        let project_id = project_id.into();
        let title = title.into();
        self.submit(
            format!("could not revert wiki page '{title}' to version {version}"),
            move |c| c.revert_wiki_page(&project_id, &title, version),
        )
    }

    pub fn upload_file(&self, filename: impl Into<String>, content: Vec<u8>) -> TaskHandle<String> {
        let filename = filename.into();
        self.submit(format!("could not upload '{filename}'"), move |c| {
            c.upload_file(&filename, &content)
        })
    }

    pub fn download_attachment(&self, content_url: impl Into<String>) -> TaskHandle<Vec<u8>> {
        let content_url = content_url.into();
        self.submit(format!("could not download {content_url}"), move |c| {
            c.download_attachment(&content_url)
        })
    }

    pub fn download_attachment_by_id(&self, attachment_id: i64) -> TaskHandle<Vec<u8>> {
        self.submit(
            format!("could not download attachment #{attachment_id}"),
            move |c| c.download_attachment_by_id(attachment_id),
        )
    }

    pub fn log_time(&self, entry: TimeEntry) -> TaskHandle<TimeEntry> {
        let context = match entry.issue_id {
            Some(issue_id) => format!("could not log {}h on task #{issue_id}", entry.hours),
            None => format!("could not log {}h", entry.hours),
        };
        self.submit(context, move |c| c.log_time(&entry))
    }

    pub fn fetch_time_entries(
        &self,
        project_id: Option<String>,
        from: NaiveDate,
        to: NaiveDate,
        limit: usize,
    ) -> TaskHandle<Vec<TimeEntry>> {
        self.submit(
            format!("could not fetch time entries from {from} to {to}"),
            move |c| c.fetch_time_entries(project_id.as_deref(), from, to, limit),
        )
    }
}

impl<C> Drop for AsyncTrackerClient<C> {
    fn drop(&mut self) {
        self.in_flight.close();
        let runtime = match self.runtime.get_mut() {
            Ok(slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
        }
    }
}

fn prestart_workers(handle: &Handle, count: usize) {
    let barrier = Arc::new(Barrier::new(count));
    for _ in 0..count {
        let barrier = Arc::clone(&barrier);
        drop(handle.spawn_blocking(move || {
            barrier.wait();
        }));
    }
}

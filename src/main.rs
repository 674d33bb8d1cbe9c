use std::sync::Arc;
use std::time::Duration;

use redmine_access::async_client::AsyncTrackerClient;
use redmine_access::cached::CachingClient;
use redmine_access::client::{MetadataKind, TaskFilter};
use redmine_access::config::{self, AppConfigOverrides};
use redmine_access::http::RedmineClient;
use redmine_access::learning::{instance_key_for, CustomFieldLearner};
use redmine_access::logging;
use redmine_access::metrics::{spawn_metrics_logger, Metrics};
use tracing::{info, warn};

const TASK_SAMPLE: usize = 100;

fn env_overrides() -> AppConfigOverrides {
    AppConfigOverrides {
        redmine_base_url: std::env::var("REDMINE_BASE_URL").ok(),
        redmine_api_key: std::env::var("REDMINE_API_KEY").ok(),
        logging_debug: logging::debug_from_env().then_some(true),
        ..AppConfigOverrides::default()
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args();
    let _program = args.next();
    let Some(project) = args.next() else {
        return Err("usage: redmine-access <project-identifier>".into());
    };

    let mut cfg = config::load()?;
    cfg.apply_overrides(&env_overrides())?;
    logging::init(cfg.logging.debug);

    let metrics = Arc::new(Metrics::new());
    spawn_metrics_logger(Arc::clone(&metrics), Duration::from_secs(60));

    let transport = RedmineClient::from_config(&cfg.redmine, Arc::clone(&metrics))?;
    let instance_key = instance_key_for(&transport.base_url);
    info!(base_url = %transport.base_url, project = %project, "starting redmine-access");

    let cached = CachingClient::new(transport, &cfg.cache, Arc::clone(&metrics));
    let client = AsyncTrackerClient::new(cached, &cfg.pool)?;
    let learner = CustomFieldLearner::new(cfg.learning_dir()?);

    let context = client.fetch_context(project.as_str()).wait()?;
    println!(
        "server={} user={} project={}",
        context.server_url,
        context.current_user.map(|u| u.name).unwrap_or_default(),
        context.project.map(|p| p.name).unwrap_or_default()
    );

    let pending: Vec<_> = MetadataKind::ALL
        .into_iter()
        .map(|kind| (kind, client.fetch_metadata(kind.as_str(), project.as_str())))
        .collect();
    for (kind, handle) in pending {
        match handle.wait() {
            Ok(items) => println!("{kind}: {}", items.len()),
            Err(err) => warn!(%kind, error = %err, "metadata unavailable"),
        }
    }

    let tasks = client
        .fetch_tasks(project.as_str(), TaskFilter::default(), TASK_SAMPLE)
        .wait()?;
    println!("open tasks (first {TASK_SAMPLE}): {}", tasks.len());

    match client.fetch_custom_field_definitions().wait() {
        Ok(declared) => learner.merge_definitions(&instance_key, &declared),
        Err(err) => warn!(error = %err, "custom field definitions unavailable, learning only"),
    }
    let learned = learner.learn_from_tasks(&instance_key, &tasks);
    learner.save(&instance_key);
    println!(
        "custom fields known: {} ({learned} updated from tasks)",
        learner.definitions(&instance_key).len()
    );

    client.shutdown();
    let snapshot = metrics.snapshot();
    info!(
        api_requests = snapshot.api_requests,
        cache_hits = snapshot.cache_hits,
        cache_misses = snapshot.cache_misses,
        "done"
    );
    Ok(())
}

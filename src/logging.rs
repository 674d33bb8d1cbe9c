use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const LOG_ENV: &str = "REDMINE_ACCESS_LOG";
const DEBUG_ENV: &str = "REDMINE_ACCESS_DEBUG";

fn parse_flag(raw: &str) -> bool {
    let normalized = raw.trim().to_ascii_lowercase();
    normalized == "1" || normalized == "true" || normalized == "yes"
}

pub fn debug_from_env() -> bool {
    std::env::var(DEBUG_ENV)
        .ok()
        .map(|v| parse_flag(&v))
        .unwrap_or(false)
}

fn default_directives(debug: bool) -> &'static str {
    if debug {
        "redmine_access=debug,info"
    } else {
        "redmine_access=info,warn"
    }
}

pub fn init(debug: bool) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(default_directives(debug || debug_from_env())));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact().with_writer(std::io::stderr))
        .try_init();
}

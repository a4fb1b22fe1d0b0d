//! Command-line interface for promhook
//!
//! Provides argument parsing and subcommand handling for the promhook binary.

use clap::{Parser, Subcommand};

/// Prometheus instrumentation hooks and exporter
#[derive(Parser)]
#[command(name = "promhook")]
#[command(version)]
#[command(about = "Prometheus instrumentation hooks and metrics exporter")]
#[command(
    long_about = "promhook records request, cache, database, model and migration metrics \
    and serves them in the Prometheus text format, either from the host router or from a \
    standalone exporter on its own port."
)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml", global = true)]
    pub config: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the standalone exporter until interrupted (default)
    Serve,

    /// Generate a template configuration file
    Config {
        /// Output file path (prints to stdout if not specified)
        #[arg(short, long)]
        output: Option<String>,
    },
}

/// Generate template configuration content
pub fn generate_config_template() -> &'static str {
    r#"# promhook Configuration
# =======================
#
# Every section is optional. An empty file serves /metrics from the host
# router with no authentication and no standalone exporter.

# ─────────────────────────────────────────────────────────────────────────────
# METRICS
# ─────────────────────────────────────────────────────────────────────────────

[metrics]
# Prefix joined to every metric name with "_" (empty for none)
namespace = ""

# Buckets of http_requests_latency_seconds_by_view_method, in seconds.
# Must be finite and strictly increasing; +Inf is implied.
latency_buckets = [0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5, 5.0, 7.5, 10.0, 25.0, 50.0, 75.0]

# Count requests as https when X-Forwarded-Proto says so.
# Only enable behind a proxy that overwrites the header.
trust_forwarded_proto = false

# ─────────────────────────────────────────────────────────────────────────────
# EXPORT
# ─────────────────────────────────────────────────────────────────────────────

[export]
# Path of the metrics endpoint
path = "/metrics"

# Standalone exporter bind address
address = "0.0.0.0"

# Standalone exporter port. Leave both port and port_range unset to serve
# only from the host router.
# port = 8001

# Inclusive range; the first free port is used. Wins over `port`.
# Useful when several workers run on one host.
port_range = [8001, 8050]

# Server-side timeout for metrics requests, in seconds (1-300)
timeout_seconds = 10

# Either a bearer token, or a username and password (basic auth)
# [export.auth]
# bearer_token = "change-me"
# username = "prometheus"
# password = "change-me"

# ─────────────────────────────────────────────────────────────────────────────
# INSTRUMENTED COMPONENTS
# ─────────────────────────────────────────────────────────────────────────────

# Models whose insert/update/delete counters exist from startup
[[models]]
name = "order"

# Database aliases and their vendor label
[[databases]]
alias = "default"
vendor = "postgresql"

# Caches: `backend` is the label value (defaults to the name).
# ignore_exceptions swallows transient failures and returns the default.
[[caches]]
name = "default"
backend = "redis"
ignore_exceptions = false
log_ignored_exceptions = false

[migrations]
# Export migrations_applied_total / migrations_unapplied_total per connection
enabled = true

# ─────────────────────────────────────────────────────────────────────────────
# MULTI-PROCESS (Optional)
# ─────────────────────────────────────────────────────────────────────────────
#
# Each worker writes its metrics to <dir>/worker_<id>.prom; the exporter
# serves the merge of all shards. The id falls back to PROMHOOK_WORKER_ID,
# then to the process id. Shards are rewritten every flush_interval_ms.
#
# [multiprocess]
# dir = "/var/run/promhook"
# worker_id = "web-1"
# flush_interval_ms = 1000

# ─────────────────────────────────────────────────────────────────────────────
# TASKS AND PUSH GATEWAY
# ─────────────────────────────────────────────────────────────────────────────

[tasks]
enabled = false
# Push gateway job name for task metrics
job = "tasks"

[pushgateway]
url = "http://localhost:9091"
# username = "pusher"
# password = "change-me"
timeout_seconds = 10

# ─────────────────────────────────────────────────────────────────────────────
# OBSERVABILITY
# ─────────────────────────────────────────────────────────────────────────────

[observability]
# Log level: "trace", "debug", "info", "warn", "error"
log_level = "info"
"#
}

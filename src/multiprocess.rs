//! Multi-process worker shards
//!
//! Each worker process owns a registry stamped with a constant `worker`
//! label and periodically flushes its exposition text to
//! `<dir>/worker_<id>.prom`. The exporter of any worker serves the merge of
//! every shard in the directory. Samples are not summed across workers; use
//! `sum without (worker) (...)` in PromQL.

use crate::metrics::MetricsRegistry;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Environment variable consulted when no worker id is configured
pub const WORKER_ID_ENV: &str = "PROMHOOK_WORKER_ID";

/// Constant label carrying the worker identity
pub const WORKER_LABEL: &str = "worker";

const SHARD_PREFIX: &str = "worker_";
const SHARD_SUFFIX: &str = ".prom";

/// Identity of one worker process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerIdentity(String);

impl WorkerIdentity {
    /// Pick the identity from configuration, the environment, or the pid
    pub fn resolve(configured: Option<&str>) -> Self {
        Self::resolve_from(configured, std::env::var(WORKER_ID_ENV).ok())
    }

    /// Resolution with the environment value passed in
    pub fn resolve_from(configured: Option<&str>, env: Option<String>) -> Self {
        let raw = configured
            .map(str::to_string)
            .or_else(|| env.filter(|v| !v.trim().is_empty()))
            .unwrap_or_else(|| std::process::id().to_string());
        Self::new(&raw)
    }

    /// Identity from a raw string
    ///
    /// Characters outside `[A-Za-z0-9_-]` are replaced with `_` so the id is
    /// always a safe file name component.
    pub fn new(raw: &str) -> Self {
        Self(
            raw.trim()
                .chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                        c
                    } else {
                        '_'
                    }
                })
                .collect(),
        )
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Constant labels for this worker's registry
    pub fn const_labels(&self) -> HashMap<String, String> {
        HashMap::from([(WORKER_LABEL.to_string(), self.0.clone())])
    }
}

impl std::fmt::Display for WorkerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// This worker's shard file
///
/// The file is removed on [`WorkerShard::cleanup`] or when the shard is
/// dropped.
#[derive(Debug)]
pub struct WorkerShard {
    dir: PathBuf,
    path: PathBuf,
    identity: WorkerIdentity,
    // Scrapes and the background flusher share one temp file
    write_lock: Mutex<()>,
}

impl WorkerShard {
    /// Prepare the shard for `identity`, creating `dir` if needed
    pub fn create(dir: impl Into<PathBuf>, identity: WorkerIdentity) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}{}{}", SHARD_PREFIX, identity.as_str(), SHARD_SUFFIX));
        tracing::info!(
            worker = %identity,
            path = %path.display(),
            "Multi-process shard enabled"
        );
        Ok(Self {
            dir,
            path,
            identity,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    /// Atomically replace the shard with `exposition`
    pub fn flush(&self, exposition: &str) -> io::Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| io::Error::other("shard write lock poisoned"))?;
        let tmp = self
            .dir
            .join(format!(".{}{}.tmp", SHARD_PREFIX, self.identity.as_str()));
        fs::write(&tmp, exposition)?;
        fs::rename(&tmp, &self.path)
    }

    /// Remove the shard file
    ///
    /// A missing file is not an error.
    pub fn cleanup(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for WorkerShard {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "Failed to remove worker shard"
            );
        }
    }
}

/// Background task rewriting one worker's shard on a fixed interval
///
/// Every worker runs one, so the merge served by whichever worker answers a
/// scrape includes the samples of workers that never see scrapes. The first
/// write happens immediately.
pub struct ShardFlusher {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ShardFlusher {
    /// Start flushing `registry` into `shard` every `every`
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(shard: Arc<WorkerShard>, registry: MetricsRegistry, every: Duration) -> Self {
        let every = every.max(Duration::from_millis(1));
        let (stop, mut stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = ticker.tick() => {
                        let shard = Arc::clone(&shard);
                        let registry = registry.clone();
                        let written =
                            tokio::task::spawn_blocking(move || write_shard(&shard, &registry)).await;
                        match written {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                tracing::warn!(error = %e, "Failed to flush worker shard");
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "Shard flush task failed");
                            }
                        }
                    }
                }
            }
            tracing::debug!("Shard flusher stopped");
        });

        tracing::debug!(interval_ms = every.as_millis() as u64, "Shard flusher started");
        Self {
            stop: Some(stop),
            task,
        }
    }

    /// Stop flushing
    ///
    /// Waits for an in-flight write, so the shard is not rewritten after
    /// this returns.
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = (&mut self.task).await {
            tracing::warn!(error = %e, "Shard flusher ended abnormally");
        }
    }
}

impl Drop for ShardFlusher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Encode `registry` and replace the shard with it
pub fn write_shard(shard: &WorkerShard, registry: &MetricsRegistry) -> io::Result<()> {
    let exposition = registry.gather().map_err(|e| io::Error::other(e.to_string()))?;
    shard.flush(&exposition)
}

#[derive(Default)]
struct Family {
    help: Option<String>,
    kind: Option<String>,
    samples: Vec<String>,
}

/// Family a sample line belongs to when no header precedes it
fn sample_name(line: &str) -> &str {
    line.split(['{', ' ']).next().unwrap_or(line)
}

/// Merge every shard in `dir` into one exposition
///
/// Families are emitted sorted by name with a single HELP/TYPE header,
/// followed by the samples of every worker in shard-name order.
pub fn aggregate_shards(dir: &Path) -> io::Result<String> {
    let mut shards: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(SHARD_PREFIX) && n.ends_with(SHARD_SUFFIX))
                .unwrap_or(false)
        })
        .collect();
    shards.sort();

    let mut families: BTreeMap<String, Family> = BTreeMap::new();
    for shard in &shards {
        let content = match fs::read_to_string(shard) {
            Ok(content) => content,
            // Worker exited between listing and reading
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        merge_exposition(&content, &mut families);
    }

    tracing::debug!(
        shard_count = shards.len(),
        family_count = families.len(),
        "Aggregated worker shards"
    );

    let mut out = String::new();
    for (name, family) in families {
        if let Some(help) = family.help {
            out.push_str(&format!("# HELP {} {}\n", name, help));
        }
        if let Some(kind) = family.kind {
            out.push_str(&format!("# TYPE {} {}\n", name, kind));
        }
        for sample in family.samples {
            out.push_str(&sample);
            out.push('\n');
        }
    }
    Ok(out)
}

fn merge_exposition(content: &str, families: &mut BTreeMap<String, Family>) {
    let mut current: Option<String> = None;
    for line in content.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix("# HELP ") {
            let (name, help) = rest.split_once(' ').unwrap_or((rest, ""));
            let family = families.entry(name.to_string()).or_default();
            family.help.get_or_insert_with(|| help.to_string());
            current = Some(name.to_string());
        } else if let Some(rest) = line.strip_prefix("# TYPE ") {
            let (name, kind) = rest.split_once(' ').unwrap_or((rest, "untyped"));
            let family = families.entry(name.to_string()).or_default();
            family.kind.get_or_insert_with(|| kind.to_string());
            current = Some(name.to_string());
        } else if line.starts_with('#') {
            continue;
        } else {
            let name = current
                .clone()
                .unwrap_or_else(|| sample_name(line).to_string());
            families
                .entry(name)
                .or_default()
                .samples
                .push(line.to_string());
        }
    }
}

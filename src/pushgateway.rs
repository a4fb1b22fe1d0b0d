//! Push gateway delivery for batch jobs
//!
//! Short-lived jobs can't be scraped, so they push their registry to a
//! Prometheus push gateway with `PUT {url}/metrics/job/{job}`, replacing
//! every metric previously pushed under that job.

use crate::clock::TimingToken;
use crate::config::PushGatewayConfig;
use crate::error::PushError;
use crate::metrics::MetricsRegistry;
use prometheus::Gauge;
use std::time::Duration;

/// Gateway URL used when none is configured
pub const DEFAULT_GATEWAY_URL: &str = "http://localhost:9091";

/// Client for one push gateway
#[derive(Clone)]
pub struct PushGateway {
    client: reqwest::Client,
    url: String,
    base: reqwest::Url,
    credentials: Option<(String, String)>,
}

impl std::fmt::Debug for PushGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushGateway")
            .field("url", &self.url)
            .field("authenticated", &self.credentials.is_some())
            .finish()
    }
}

impl PushGateway {
    /// Build a client for `url`
    ///
    /// Basic auth is only sent when both `username` and `password` are set.
    pub fn new(
        url: impl Into<String>,
        username: Option<String>,
        password: Option<String>,
        timeout: Duration,
    ) -> Result<Self, PushError> {
        let url = url.into().trim_end_matches('/').to_string();
        let base = reqwest::Url::parse(&url).map_err(|e| PushError::InvalidUrl {
            url: url.clone(),
            reason: e.to_string(),
        })?;
        if base.cannot_be_a_base() {
            return Err(PushError::InvalidUrl {
                url,
                reason: "URL cannot carry a path".to_string(),
            });
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| PushError::Transport {
                url: url.clone(),
                source,
            })?;

        Ok(Self {
            client,
            url,
            base,
            credentials: username.zip(password),
        })
    }

    pub fn from_config(config: &PushGatewayConfig) -> Result<Self, PushError> {
        Self::new(
            config.url.clone(),
            config.username.clone(),
            config.password.clone(),
            Duration::from_secs(config.timeout_seconds),
        )
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Grouping URL for `job`
    ///
    /// The job name is one percent-encoded path segment, so `/` and spaces
    /// never change the grouping path.
    pub fn job_url(&self, job: &str) -> reqwest::Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(["metrics", "job", job]);
        }
        url
    }

    /// Push every metric of `registry` under `job`
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails, the gateway is unreachable or it
    /// answers with a non-2xx status.
    pub async fn push(&self, job: &str, registry: &MetricsRegistry) -> Result<(), PushError> {
        let body = registry.gather().map_err(|e| PushError::Encode {
            job: job.to_string(),
            reason: e.to_string(),
        })?;
        let url = self.job_url(job).to_string();

        let mut request = self
            .client
            .put(&url)
            .header(reqwest::header::CONTENT_TYPE, prometheus::TEXT_FORMAT)
            .body(body);
        if let Some((username, password)) = &self.credentials {
            request = request.basic_auth(username, Some(password));
        }

        let response = request
            .send()
            .await
            .map_err(|source| PushError::Transport {
                url: url.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(
                url = %url,
                job,
                status = status.as_u16(),
                "Push gateway rejected metrics"
            );
            return Err(PushError::Rejected {
                url,
                job: job.to_string(),
                status: status.as_u16(),
            });
        }

        tracing::info!(url = %url, job, "Pushed metrics to gateway");
        Ok(())
    }
}

/// A batch job with its own registry and duration gauge
///
/// The job's start time is taken at construction; [`BatchJob::push`] sets
/// `job_last_duration_seconds` to the time elapsed since then.
pub struct BatchJob {
    job: String,
    registry: MetricsRegistry,
    duration: Gauge,
    started: TimingToken,
}

impl BatchJob {
    pub fn new(job: impl Into<String>) -> Result<Self, prometheus::Error> {
        let registry = MetricsRegistry::new("")?;
        let duration = registry.gauge(
            "job_last_duration_seconds",
            "Last execution duration of a batch job",
        )?;
        Ok(Self {
            job: job.into(),
            registry,
            duration,
            started: TimingToken::now(),
        })
    }

    pub fn job(&self) -> &str {
        &self.job
    }

    /// Registry for the job's own counters and gauges
    pub fn registry(&self) -> &MetricsRegistry {
        &self.registry
    }

    /// Record the job duration and push the registry
    pub async fn push(&self, gateway: &PushGateway) -> Result<(), PushError> {
        self.duration.set(self.started.elapsed_secs());
        gateway.push(&self.job, &self.registry).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_url_strips_trailing_slash() {
        let gateway = PushGateway::new("http://gw:9091/", None, None, Duration::from_secs(5)).unwrap();
        assert_eq!(gateway.url(), "http://gw:9091");
        assert_eq!(gateway.job_url("nightly").as_str(), "http://gw:9091/metrics/job/nightly");
    }

    #[test]
    fn test_job_name_is_one_encoded_segment() {
        let gateway = PushGateway::new("http://gw:9091/push/", None, None, Duration::from_secs(5)).unwrap();
        assert_eq!(
            gateway.job_url("reports/daily run").as_str(),
            "http://gw:9091/push/metrics/job/reports%2Fdaily%20run"
        );
    }

    #[test]
    fn test_rejects_unparsable_url() {
        let result = PushGateway::new("not a url", None, None, Duration::from_secs(5));
        assert!(matches!(result, Err(PushError::InvalidUrl { .. })));
    }

    #[test]
    fn test_credentials_require_both_parts() {
        let gateway =
            PushGateway::new(DEFAULT_GATEWAY_URL, Some("user".into()), None, Duration::from_secs(5))
                .unwrap();
        assert!(format!("{:?}", gateway).contains("authenticated: false"));
    }

    #[test]
    fn test_batch_job_registry_is_dedicated() {
        let job = BatchJob::new("my-cron-job").unwrap();
        job.registry()
            .counter("my_counter", "My counter description")
            .unwrap()
            .inc_by(123);

        let output = job.registry().gather().unwrap();
        assert!(output.contains("my_counter 123"));
        assert!(output.contains("job_last_duration_seconds"));
        assert_eq!(job.job(), "my-cron-job");
    }
}

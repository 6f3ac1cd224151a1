use http::header::HeaderName;
use std::collections::HashSet;
use std::time::Duration;

/// `User-Agent` sent when the caller configures none.
pub const DEFAULT_USER_AGENT: &str = concat!("modkit-pipeline/", env!("CARGO_PKG_VERSION"));

/// Status codes retried by [`RetryConfig::default`].
pub const DEFAULT_RETRY_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Upper bound on bytes read from a retryable response before it is dropped.
pub const DEFAULT_RETRY_RESPONSE_DRAIN_LIMIT: usize = 64 * 1024;

/// Outcome of a single attempt, as seen by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum RetryTrigger {
    /// The transport failed before a response arrived.
    TransportError,
    /// The attempt ran past [`RetryConfig::try_timeout`] or the transport timeout.
    Timeout,
    /// A response arrived with this status.
    Status(u16),
    /// An error no configuration can make retryable, such as cancellation.
    NonRetryable,
}

/// Delay schedule between attempts.
///
/// Attempt `n` (zero-based) waits `initial * multiplier^n`, capped at `max`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub initial: Duration,
    /// Ceiling for both the computed delay and any server retry hint.
    pub max: Duration,
    pub multiplier: f64,
    /// Lengthen each delay by a random 0-25 %, still capped at `max`.
    pub jitter: bool,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::with_growth(Duration::from_millis(800), Duration::from_secs(60), true)
    }
}

impl ExponentialBackoff {
    const fn with_growth(initial: Duration, max: Duration, jitter: bool) -> Self {
        Self {
            initial,
            max,
            multiplier: 2.0,
            jitter,
        }
    }

    /// Doubling backoff with jitter between `initial` and `max`.
    #[must_use]
    pub const fn new(initial: Duration, max: Duration) -> Self {
        Self::with_growth(initial, max, true)
    }

    /// Millisecond delays without jitter; keeps retry tests deterministic.
    #[must_use]
    pub const fn fast() -> Self {
        Self::with_growth(Duration::from_millis(1), Duration::from_millis(100), false)
    }

    #[must_use]
    pub const fn aggressive() -> Self {
        Self::with_growth(Duration::from_millis(50), Duration::from_secs(30), true)
    }
}

/// Settings for [`RetryPolicy`](crate::policies::RetryPolicy).
///
/// Retry decisions depend only on the attempt outcome, never on the HTTP
/// method. A [`RetryClassifier`](crate::RetryClassifier) may still override
/// the decision for individual responses.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Extra attempts after the first one. Zero sends exactly once.
    pub max_retries: usize,
    pub backoff: ExponentialBackoff,
    /// Outcomes that are retried while the budget lasts.
    pub retry_on: HashSet<RetryTrigger>,
    /// Use the backoff schedule even when the server sends a retry hint.
    pub ignore_retry_after: bool,
    /// Deadline for one attempt. Expiry yields `PipelineError::Timeout`.
    pub try_timeout: Option<Duration>,
    /// Bytes of a discarded response read so the connection can be reused.
    pub retry_response_drain_limit: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let mut retry_on: HashSet<RetryTrigger> = DEFAULT_RETRY_STATUSES
            .into_iter()
            .map(RetryTrigger::Status)
            .collect();
        retry_on.insert(RetryTrigger::TransportError);
        retry_on.insert(RetryTrigger::Timeout);

        Self {
            max_retries: 3,
            backoff: ExponentialBackoff::default(),
            retry_on,
            ignore_retry_after: false,
            try_timeout: None,
            retry_response_drain_limit: DEFAULT_RETRY_RESPONSE_DRAIN_LIMIT,
        }
    }
}

impl RetryConfig {
    /// Send once, never retry.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Five retries on a short schedule.
    #[must_use]
    pub fn aggressive() -> Self {
        Self {
            max_retries: 5,
            backoff: ExponentialBackoff::aggressive(),
            ..Self::default()
        }
    }

    /// Default triggers with [`ExponentialBackoff::fast`].
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            backoff: ExponentialBackoff::fast(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn should_retry(&self, trigger: RetryTrigger) -> bool {
        self.retry_on.contains(&trigger)
    }
}

/// Where the default transport loads trusted roots from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum TlsRootConfig {
    /// Bundled Mozilla roots.
    #[default]
    WebPki,
    /// The platform certificate store.
    Native,
}

/// Which URL schemes the default transport accepts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransportSecurity {
    /// `https` only; plain `http` URLs are rejected before connecting.
    #[default]
    TlsOnly,
    /// Also accept `http`. Meant for local mock servers.
    AllowInsecureHttp,
}

/// Settings for [`HyperTransport`](crate::HyperTransport).
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Deadline for a whole request, headers and body.
    pub request_timeout: Duration,
    /// Cap on the decompressed size of a buffered response body.
    pub max_body_size: usize,
    pub security: TransportSecurity,
    pub tls_roots: TlsRootConfig,
    /// `None` keeps hyper-util's own idle timeout.
    pub pool_idle_timeout: Option<Duration>,
    pub pool_max_idle_per_host: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_body_size: crate::response::DEFAULT_MAX_BODY_SIZE,
            security: TransportSecurity::TlsOnly,
            tls_roots: TlsRootConfig::WebPki,
            pool_idle_timeout: Some(Duration::from_secs(90)),
            pool_max_idle_per_host: 32,
        }
    }
}

impl TransportConfig {
    /// Plain-HTTP transport with short timeouts and a small pool, for mock servers.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            max_body_size: 1 << 20,
            security: TransportSecurity::AllowInsecureHttp,
            pool_idle_timeout: Some(Duration::from_secs(10)),
            pool_max_idle_per_host: 4,
            ..Self::default()
        }
    }
}

/// Allow-lists for [`LoggingPolicy`](crate::policies::LoggingPolicy).
///
/// Values of anything not listed are written as `REDACTED`.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub allowed_headers: HashSet<HeaderName>,
    pub allowed_query_params: HashSet<String>,
}

const LOGGED_HEADERS: &[&str] = &[
    "accept",
    "content-type",
    "content-length",
    "retry-after",
    "retry-after-ms",
    "x-ms-retry-after-ms",
    "x-ms-client-request-id",
    "x-ms-request-id",
    "x-ms-error-code",
    "location",
    "operation-location",
    "azure-asyncoperation",
    "user-agent",
];

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            allowed_headers: LOGGED_HEADERS
                .iter()
                .map(|&name| HeaderName::from_static(name))
                .collect(),
            allowed_query_params: HashSet::from(["api-version".to_owned()]),
        }
    }
}

/// Everything [`PipelineBuilder`](crate::PipelineBuilder) needs to assemble
/// the standard policy chain.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub user_agent: String,
    /// Prepended to `user_agent` when set.
    pub application_id: Option<String>,
    /// `None` leaves the retry policy out of the chain.
    pub retry: Option<RetryConfig>,
    /// Stamp `x-ms-client-request-id` on requests that lack one.
    pub request_id: bool,
    /// `None` leaves the logging policy out of the chain.
    pub logging: Option<LoggingConfig>,
    /// Used only when the builder has no injected transport.
    pub transport: TransportConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            application_id: None,
            retry: Some(RetryConfig::default()),
            request_id: true,
            logging: Some(LoggingConfig::default()),
            transport: TransportConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Only the header and user-agent policies; no retry, logging or request id.
    #[must_use]
    pub fn minimal() -> Self {
        Self {
            retry: None,
            request_id: false,
            logging: None,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            retry: Some(RetryConfig::for_testing()),
            transport: TransportConfig::for_testing(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_default_retry_set_covers_throttling_and_gateway_errors() {
        let config = RetryConfig::default();

        for code in DEFAULT_RETRY_STATUSES {
            assert!(config.should_retry(RetryTrigger::Status(code)), "{code}");
        }
        assert!(config.should_retry(RetryTrigger::TransportError));
        assert!(config.should_retry(RetryTrigger::Timeout));
        assert_eq!(config.retry_on.len(), DEFAULT_RETRY_STATUSES.len() + 2);
    }

    #[test]
    fn test_client_errors_and_not_implemented_are_final() {
        let config = RetryConfig::aggressive();

        for code in [400, 401, 404, 409, 501] {
            assert!(!config.should_retry(RetryTrigger::Status(code)), "{code}");
        }
        assert!(!config.should_retry(RetryTrigger::NonRetryable));
    }

    #[test]
    fn test_retry_presets_keep_default_triggers() {
        let disabled = RetryConfig::disabled();
        assert_eq!(disabled.max_retries, 0);
        assert_eq!(disabled.retry_on, RetryConfig::default().retry_on);

        let aggressive = RetryConfig::aggressive();
        assert_eq!(aggressive.max_retries, 5);
        assert!(aggressive.backoff.max < ExponentialBackoff::default().max);
    }

    #[test]
    fn test_custom_backoff_doubles_with_jitter() {
        let backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(8));
        assert!(backoff.jitter);
        assert!((backoff.multiplier - 2.0).abs() < f64::EPSILON);

        assert!(!ExponentialBackoff::fast().jitter);
    }

    #[test]
    fn test_only_testing_transport_accepts_plain_http() {
        assert_eq!(
            TransportConfig::default().security,
            TransportSecurity::TlsOnly
        );

        let testing = TransportConfig::for_testing();
        assert_eq!(testing.security, TransportSecurity::AllowInsecureHttp);
        assert_eq!(testing.tls_roots, TlsRootConfig::WebPki);
        assert!(testing.max_body_size < TransportConfig::default().max_body_size);
    }

    #[test]
    fn test_logging_allow_list_excludes_credentials() {
        let config = LoggingConfig::default();
        let allowed = |name: &'static str| {
            config
                .allowed_headers
                .contains(&HeaderName::from_static(name))
        };

        assert!(allowed("x-ms-client-request-id"));
        assert!(allowed("operation-location"));
        assert!(!allowed("authorization"));
        assert!(!allowed("cookie"));
        assert!(config.allowed_query_params.contains("api-version"));
    }

    #[test]
    fn test_minimal_pipeline_drops_optional_policies() {
        let full = PipelineConfig::default();
        assert!(full.retry.is_some() && full.logging.is_some() && full.request_id);
        assert_eq!(full.user_agent, DEFAULT_USER_AGENT);

        let minimal = PipelineConfig::minimal();
        assert!(minimal.retry.is_none());
        assert!(minimal.logging.is_none());
        assert!(!minimal.request_id);
        assert_eq!(minimal.user_agent, DEFAULT_USER_AGENT);
    }
}

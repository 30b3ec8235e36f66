//! Configuration injected into the orchestrator at construction.
//!
//! Nothing in the engine reads the environment on its own. The binary builds
//! an [`OrchestratorConfig`] from a JSON file or from environment variables
//! and hands it over.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};
use crate::query::QueryAction;

/// Every event data store ARN starts with this.
pub const EVENT_DATA_STORE_ARN_PREFIX: &str = "arn:aws:cloudtrail:";

/// Top-level configuration for one orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub backend: BackendConfig,

    pub notifier: NotifierConfig,

    /// Time between two status checks of the same request
    pub poll_interval_ms: u64,

    /// Upper bound on a whole run, from trigger to report
    pub max_total_wait_ms: u64,

    /// Submission calls per request before a transient failure becomes final
    pub submit_max_attempts: u32,

    /// Base backoff between submission attempts (exponentially increased)
    pub backoff_ms: u64,

    /// Factor by which the backoff is increased with each attempt
    pub backoff_factor: u64,

    /// Maximum backoff between submission attempts
    pub max_backoff_ms: u64,

    /// How often to ask for the id of a freshly created account
    pub account_lookup_attempts: u32,

    /// Time between two account id lookups
    pub account_lookup_interval_ms: u64,

    /// Quotas to request for every account
    pub quotas: Vec<QuotaTarget>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            notifier: NotifierConfig::default(),
            poll_interval_ms: 60_000,            // 1 minute
            max_total_wait_ms: 6 * 60 * 60_000, // 6 hours
            submit_max_attempts: 5,
            backoff_ms: 1000,
            backoff_factor: 2,
            max_backoff_ms: 30_000,
            account_lookup_attempts: 30,
            account_lookup_interval_ms: 10_000,
            quotas: Vec::new(),
        }
    }
}

/// Where and how to reach the quota/query backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// URL the query function is invoked at
    pub endpoint: String,

    /// Sent as a bearer token when non-empty
    pub api_key: String,

    /// Full ARN of the CloudTrail Lake event data store
    pub event_data_store_arn: String,

    /// Timeout for each backend call
    pub timeout_ms: u64,

    /// Page size requested from the backend
    pub max_query_results: u32,

    pub statements: QueryStatements,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: String::new(),
            event_data_store_arn: String::new(),
            timeout_ms: 300_000,
            max_query_results: 100,
            statements: QueryStatements::default(),
        }
    }
}

/// Statement templates sent to the backend, one per action.
///
/// `{m[Name]}` placeholders are filled from the call's payload plus
/// `EventDataStore`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryStatements {
    pub submit_request: String,
    pub check_status: String,
    pub describe_account_creation: String,
}

impl Default for QueryStatements {
    fn default() -> Self {
        Self {
            submit_request: "SELECT responseElements.requestedQuota.id AS requestToken \
                FROM {m[EventDataStore]} \
                WHERE eventName = 'RequestServiceQuotaIncrease' \
                AND recipientAccountId = '{m[accountId]}' \
                AND requestParameters.serviceCode = '{m[serviceIdentifier]}' \
                AND requestParameters.quotaCode = '{m[quotaDimension]}' \
                ORDER BY eventTime DESC LIMIT 1"
                .to_string(),
            check_status: "SELECT responseElements.requestedQuota.status AS status \
                FROM {m[EventDataStore]} \
                WHERE eventName = 'UpdateServiceQuotaIncreaseRequestStatus' \
                AND responseElements.requestedQuota.id = '{m[requestToken]}' \
                ORDER BY eventTime DESC LIMIT 1"
                .to_string(),
            describe_account_creation:
                "SELECT serviceEventDetails.createAccountStatus.state AS state, \
                serviceEventDetails.createAccountStatus.accountId AS accountId \
                FROM {m[EventDataStore]} \
                WHERE eventName = 'CreateAccountResult' \
                AND serviceEventDetails.createAccountStatus.id = '{m[creationRequestId]}'"
                    .to_string(),
        }
    }
}

impl QueryStatements {
    pub fn for_action(&self, action: QueryAction) -> &str {
        match action {
            QueryAction::SubmitRequest => &self.submit_request,
            QueryAction::CheckStatus => &self.check_status,
            QueryAction::DescribeAccountCreation => &self.describe_account_creation,
        }
    }
}

/// Where the report goes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    pub webhook_url: String,

    /// Operator mailbox subscribed to the channel, if any
    pub notify_email: Option<String>,

    pub subject_prefix: String,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            webhook_url: String::new(),
            notify_email: None,
            subject_prefix: "Service quota requests".to_string(),
        }
    }
}

/// One quota to request per account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaTarget {
    pub service_identifier: String,
    pub quota_dimension: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_value: Option<f64>,
}

impl std::str::FromStr for QuotaTarget {
    type Err = OrchestratorError;

    /// Parse `service:quota` or `service:quota=value`.
    fn from_str(s: &str) -> Result<Self> {
        let (target, value) = match s.split_once('=') {
            Some((target, value)) => (target, Some(value)),
            None => (s, None),
        };
        let (service, quota) = target.split_once(':').ok_or_else(|| {
            OrchestratorError::Validation(format!(
                "quota target '{}' must look like service:quota[=value]",
                s
            ))
        })?;
        let (service, quota) = (service.trim(), quota.trim());
        if service.is_empty() || quota.is_empty() {
            return Err(OrchestratorError::Validation(format!(
                "quota target '{}' has an empty service or quota",
                s
            )));
        }
        let desired_value = value
            .map(|v| {
                v.trim().parse::<f64>().map_err(|e| {
                    OrchestratorError::Validation(format!(
                        "quota target '{}' has an invalid value: {}",
                        s, e
                    ))
                })
            })
            .transpose()?;

        Ok(QuotaTarget {
            service_identifier: service.to_string(),
            quota_dimension: quota.to_string(),
            desired_value,
        })
    }
}

/// Derive the short event data store id from its full ARN.
///
/// `arn:aws:cloudtrail:us-east-1:123456789012:eventdatastore/abc-123` gives `abc-123`.
pub fn event_data_store_id(arn: &str) -> Result<String> {
    if !arn.starts_with(EVENT_DATA_STORE_ARN_PREFIX) {
        return Err(OrchestratorError::Validation(format!(
            "event data store ARN must start with '{}': '{}'",
            EVENT_DATA_STORE_ARN_PREFIX, arn
        )));
    }
    match arn.rsplit_once('/') {
        Some((_, id)) if !id.is_empty() => Ok(id.to_string()),
        _ => Err(OrchestratorError::Validation(format!(
            "event data store ARN has no resource id: '{}'",
            arn
        ))),
    }
}

impl OrchestratorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_total_wait(&self) -> Duration {
        Duration::from_millis(self.max_total_wait_ms)
    }

    pub fn account_lookup_interval(&self) -> Duration {
        Duration::from_millis(self.account_lookup_interval_ms)
    }

    /// Load configuration from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Failed to read config file {}: {}", path.display(), e)
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Load configuration from environment variables (a `.env` file is
    /// honoured when present).
    ///
    /// | Env Var                                | Default       |
    /// |----------------------------------------|---------------|
    /// | `QUOTA_BACKEND_ENDPOINT`               | --            |
    /// | `QUOTA_BACKEND_API_KEY`                | empty         |
    /// | `QUOTA_BACKEND_TIMEOUT_MS`             | `300000`      |
    /// | `CLOUDTRAIL_LAKE_EVENT_DATA_STORE_ARN` | --            |
    /// | `NOTIFY_WEBHOOK_URL`                   | --            |
    /// | `NOTIFY_EMAIL_ADDRESS`                 | unset         |
    /// | `POLL_INTERVAL_MS`                     | `60000`       |
    /// | `MAX_TOTAL_WAIT_MS`                    | `21600000`    |
    /// | `QUOTA_TARGETS`                        | none          |
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from any key lookup, e.g. a map in tests.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse_u64(key: &str, raw: Option<String>, default: u64) -> Result<u64> {
            match raw {
                Some(raw) => raw.trim().parse().map_err(|e| {
                    OrchestratorError::Validation(format!("{} must be an integer: {}", key, e))
                }),
                None => Ok(default),
            }
        }

        let defaults = OrchestratorConfig::default();

        let quotas = match lookup("QUOTA_TARGETS") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::parse)
                .collect::<Result<Vec<QuotaTarget>>>()?,
            None => Vec::new(),
        };

        Ok(OrchestratorConfig {
            backend: BackendConfig {
                endpoint: lookup("QUOTA_BACKEND_ENDPOINT").unwrap_or_default(),
                api_key: lookup("QUOTA_BACKEND_API_KEY").unwrap_or_default(),
                event_data_store_arn: lookup("CLOUDTRAIL_LAKE_EVENT_DATA_STORE_ARN")
                    .unwrap_or_default(),
                timeout_ms: parse_u64(
                    "QUOTA_BACKEND_TIMEOUT_MS",
                    lookup("QUOTA_BACKEND_TIMEOUT_MS"),
                    defaults.backend.timeout_ms,
                )?,
                ..defaults.backend
            },
            notifier: NotifierConfig {
                webhook_url: lookup("NOTIFY_WEBHOOK_URL").unwrap_or_default(),
                notify_email: lookup("NOTIFY_EMAIL_ADDRESS").filter(|s| !s.is_empty()),
                ..defaults.notifier
            },
            poll_interval_ms: parse_u64(
                "POLL_INTERVAL_MS",
                lookup("POLL_INTERVAL_MS"),
                defaults.poll_interval_ms,
            )?,
            max_total_wait_ms: parse_u64(
                "MAX_TOTAL_WAIT_MS",
                lookup("MAX_TOTAL_WAIT_MS"),
                defaults.max_total_wait_ms,
            )?,
            quotas,
            ..defaults
        })
    }

    /// Check the configuration before a run starts.
    pub fn validate(&self) -> Result<()> {
        event_data_store_id(&self.backend.event_data_store_arn)?;

        if let Some(email) = &self.notifier.notify_email {
            let valid = email
                .split_once('@')
                .is_some_and(|(local, domain)| !local.is_empty() && !domain.is_empty());
            if !valid {
                return Err(OrchestratorError::Validation(format!(
                    "notification email address '{}' is not valid",
                    email
                )));
            }
        }
        if self.quotas.is_empty() {
            return Err(OrchestratorError::Validation(
                "at least one quota target must be configured".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(OrchestratorError::Validation(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_total_wait_ms < self.poll_interval_ms {
            return Err(OrchestratorError::Validation(format!(
                "max_total_wait_ms ({}) must be at least poll_interval_ms ({})",
                self.max_total_wait_ms, self.poll_interval_ms
            )));
        }
        if self.submit_max_attempts == 0 {
            return Err(OrchestratorError::Validation(
                "submit_max_attempts must be at least 1".to_string(),
            ));
        }
        if self.account_lookup_attempts == 0 {
            return Err(OrchestratorError::Validation(
                "account_lookup_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const ARN: &str =
        "arn:aws:cloudtrail:us-east-1:111122223333:eventdatastore/EXAMPLE-f852-4e8f-8bd1-bcf6cEXAMPLE";

    fn valid_config() -> OrchestratorConfig {
        OrchestratorConfig {
            backend: BackendConfig {
                event_data_store_arn: ARN.to_string(),
                ..Default::default()
            },
            quotas: vec!["ec2:L-1216C47A".parse().unwrap()],
            ..Default::default()
        }
    }

    #[test]
    fn test_event_data_store_id_from_arn() {
        assert_eq!(
            event_data_store_id(ARN).unwrap(),
            "EXAMPLE-f852-4e8f-8bd1-bcf6cEXAMPLE"
        );
        assert!(event_data_store_id("arn:aws:s3:::bucket/key").is_err());
        assert!(event_data_store_id("arn:aws:cloudtrail:us-east-1:111122223333:eventdatastore/").is_err());
        assert!(event_data_store_id("arn:aws:cloudtrail:us-east-1:111122223333").is_err());
    }

    #[test]
    fn test_quota_target_parsing() {
        let target: QuotaTarget = "ec2:L-1216C47A=256".parse().unwrap();
        assert_eq!(target.service_identifier, "ec2");
        assert_eq!(target.quota_dimension, "L-1216C47A");
        assert_eq!(target.desired_value, Some(256.0));

        let target: QuotaTarget = " lambda : L-B99A9384 ".parse().unwrap();
        assert_eq!(target.service_identifier, "lambda");
        assert_eq!(target.desired_value, None);

        assert!("no-colon".parse::<QuotaTarget>().is_err());
        assert!(":L-1".parse::<QuotaTarget>().is_err());
        assert!("ec2:L-1=lots".parse::<QuotaTarget>().is_err());
    }

    #[test]
    fn test_from_lookup() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("QUOTA_BACKEND_ENDPOINT", "https://query.example.com/invoke"),
            ("CLOUDTRAIL_LAKE_EVENT_DATA_STORE_ARN", ARN),
            ("NOTIFY_WEBHOOK_URL", "https://notify.example.com/hook"),
            ("NOTIFY_EMAIL_ADDRESS", "ops@example.com"),
            ("POLL_INTERVAL_MS", "5000"),
            ("QUOTA_TARGETS", "ec2:L-1216C47A=256, lambda:L-B99A9384"),
        ]);
        let config =
            OrchestratorConfig::from_lookup(|key| env.get(key).map(|v| v.to_string())).unwrap();

        assert_eq!(config.backend.endpoint, "https://query.example.com/invoke");
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.max_total_wait_ms, 6 * 60 * 60_000);
        assert_eq!(config.quotas.len(), 2);
        assert_eq!(config.notifier.notify_email.as_deref(), Some("ops@example.com"));
        config.validate().unwrap();
    }

    #[test]
    fn test_from_lookup_rejects_bad_numbers() {
        let result = OrchestratorConfig::from_lookup(|key| {
            (key == "POLL_INTERVAL_MS").then(|| "soon".to_string())
        });
        assert!(matches!(result, Err(OrchestratorError::Validation(_))));
    }

    #[test]
    fn test_validate() {
        valid_config().validate().unwrap();

        let mut config = valid_config();
        config.backend.event_data_store_arn = "eds-123".to_string();
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.notifier.notify_email = Some("@example.com".to_string());
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.quotas.clear();
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.max_total_wait_ms = config.poll_interval_ms - 1;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.submit_max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.account_lookup_attempts = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("account_lookup_attempts"));
    }

    #[test]
    fn test_json_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            format!(
                r#"{{"backend": {{"event_data_store_arn": "{}"}},
                    "quotas": [{{"service_identifier": "ec2", "quota_dimension": "L-1216C47A"}}],
                    "poll_interval_ms": 1000}}"#,
                ARN
            ),
        )
        .unwrap();

        let config = OrchestratorConfig::from_json_file(&path).unwrap();
        assert_eq!(config.poll_interval_ms, 1000);
        assert_eq!(config.backend.max_query_results, 100);
        assert_eq!(config.submit_max_attempts, 5);
        config.validate().unwrap();
    }
}

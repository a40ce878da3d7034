use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;
use rdkafka::ClientConfig;

/// Prefix shared by all northbound topics.
pub const TOPIC_PREFIX: &str = "hono";

/// The northbound API a consumer reads from. Both kinds share the same
/// consumer lifecycle and only differ in the topic they subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiKind {
    Telemetry,
    Event,
}

impl ApiKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiKind::Telemetry => "telemetry",
            ApiKind::Event => "event",
        }
    }

    /// Topic carrying this API's messages for the given tenant.
    pub fn topic_for(&self, tenant_id: &str) -> String {
        format!("{TOPIC_PREFIX}.{}.{tenant_id}", self.as_str())
    }
}

impl fmt::Display for ApiKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown api kind '{0}', expected 'telemetry' or 'event'")]
pub struct ParseApiKindError(String);

impl FromStr for ApiKind {
    type Err = ParseApiKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "telemetry" => Ok(ApiKind::Telemetry),
            "event" => Ok(ApiKind::Event),
            _ => Err(ParseApiKindError(s.to_string())),
        }
    }
}

/// Timing and batching knobs a factory applies to every consumer it creates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSettings {
    /// How long a single poll may wait for new records.
    pub poll_interval: Duration,
    /// Minimum time between two offset commits. Zero commits after every batch.
    pub commit_interval: Duration,
    /// Upper bound of records returned by one poll.
    pub max_batch_size: usize,
    /// How long subscription setup may take before the consumer fails to start.
    pub subscribe_timeout: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            commit_interval: Duration::from_secs(5),
            max_batch_size: 500,
            subscribe_timeout: Duration::from_secs(10),
        }
    }
}

/// Configuration of a single consumer instance. Fixed once the consumer starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    tenant_id: String,
    api_kind: ApiKind,
    topic: String,
    poll_interval: Duration,
    commit_interval: Duration,
    max_batch_size: usize,
    subscribe_timeout: Duration,
}

impl ConsumerConfig {
    pub fn new(tenant_id: impl Into<String>, api_kind: ApiKind) -> Self {
        Self::with_settings(tenant_id, api_kind, &ConsumerSettings::default())
    }

    pub fn with_settings(
        tenant_id: impl Into<String>,
        api_kind: ApiKind,
        settings: &ConsumerSettings,
    ) -> Self {
        let tenant_id = tenant_id.into();
        let topic = api_kind.topic_for(&tenant_id);
        Self {
            tenant_id,
            api_kind,
            topic,
            poll_interval: settings.poll_interval,
            commit_interval: settings.commit_interval,
            max_batch_size: settings.max_batch_size.max(1),
            subscribe_timeout: settings.subscribe_timeout,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_commit_interval(mut self, interval: Duration) -> Self {
        self.commit_interval = interval;
        self
    }

    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size.max(1);
        self
    }

    pub fn with_subscribe_timeout(mut self, timeout: Duration) -> Self {
        self.subscribe_timeout = timeout;
        self
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn api_kind(&self) -> ApiKind {
        self.api_kind
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn commit_interval(&self) -> Duration {
        self.commit_interval
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    pub fn subscribe_timeout(&self) -> Duration {
        self.subscribe_timeout
    }
}

/// Builds the rdkafka client configuration for an application consumer.
///
/// Offsets are never stored or committed by librdkafka on its own: the
/// consumer commits explicitly once records have been handled.
pub struct KafkaClientConfigBuilder {
    config: ClientConfig,
}

impl KafkaClientConfigBuilder {
    pub fn for_application_consumer(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id)
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false")
            .set("socket.timeout.ms", "10000")
            .set("session.timeout.ms", "45000")
            .set("heartbeat.interval.ms", "3000");

        Self { config }
    }

    /// Enable TLS/SSL for Kafka connection
    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    /// Where to start when the group has no committed offset (earliest, latest)
    pub fn with_offset_reset(mut self, policy: &str) -> Self {
        self.config.set("auto.offset.reset", policy);
        self
    }

    /// Add any custom configuration
    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.config.set(key, value);
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

/// Environment configuration of the `application-client` service binary.
#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,

    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "application-client")]
    pub kafka_consumer_group: String,

    // New application groups usually only care about what arrives from now on
    #[envconfig(default = "latest")]
    pub kafka_consumer_offset_reset: String,

    #[envconfig(default = "DEFAULT_TENANT")]
    pub tenant_id: String,

    #[envconfig(default = "telemetry")]
    pub api_kind: ApiKind,

    #[envconfig(default = "100")]
    pub poll_interval_ms: u64,

    #[envconfig(default = "5000")]
    pub commit_interval_ms: u64,

    #[envconfig(default = "500")]
    pub max_batch_size: usize,

    #[envconfig(default = "10000")]
    pub subscribe_timeout_ms: u64,

    // Wait before a consumer that was closed by a poll/commit failure is recreated
    #[envconfig(default = "5000")]
    pub recreate_delay_ms: u64,
}

impl Config {
    pub fn settings(&self) -> ConsumerSettings {
        ConsumerSettings {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            commit_interval: Duration::from_millis(self.commit_interval_ms),
            max_batch_size: self.max_batch_size,
            subscribe_timeout: Duration::from_millis(self.subscribe_timeout_ms),
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        KafkaClientConfigBuilder::for_application_consumer(
            &self.kafka_hosts,
            &self.kafka_consumer_group,
        )
        .with_tls(self.kafka_tls)
        .with_offset_reset(&self.kafka_consumer_offset_reset)
        .build()
    }

    pub fn recreate_delay(&self) -> Duration {
        Duration::from_millis(self.recreate_delay_ms)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_naming_per_api_kind() {
        assert_eq!(ApiKind::Telemetry.topic_for("tenant-a"), "hono.telemetry.tenant-a");
        assert_eq!(ApiKind::Event.topic_for("tenant-a"), "hono.event.tenant-a");
    }

    #[test]
    fn test_api_kind_parsing() {
        assert_eq!("telemetry".parse::<ApiKind>().unwrap(), ApiKind::Telemetry);
        assert_eq!(" EVENT ".parse::<ApiKind>().unwrap(), ApiKind::Event);
        assert!("command".parse::<ApiKind>().is_err());
    }

    #[test]
    fn test_consumer_config_derives_topic_and_applies_settings() {
        let settings = ConsumerSettings {
            poll_interval: Duration::from_millis(20),
            commit_interval: Duration::ZERO,
            max_batch_size: 10,
            subscribe_timeout: Duration::from_secs(1),
        };
        let config = ConsumerConfig::with_settings("tenant-a", ApiKind::Event, &settings);

        assert_eq!(config.tenant_id(), "tenant-a");
        assert_eq!(config.topic(), "hono.event.tenant-a");
        assert_eq!(config.poll_interval(), Duration::from_millis(20));
        assert_eq!(config.commit_interval(), Duration::ZERO);
        assert_eq!(config.max_batch_size(), 10);
    }

    #[test]
    fn test_consumer_config_overrides() {
        let config = ConsumerConfig::new("tenant-a", ApiKind::Telemetry)
            .with_poll_interval(Duration::from_millis(250))
            .with_commit_interval(Duration::from_secs(1))
            .with_subscribe_timeout(Duration::from_secs(3));

        assert_eq!(config.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.commit_interval(), Duration::from_secs(1));
        assert_eq!(config.subscribe_timeout(), Duration::from_secs(3));
        assert_eq!(config.max_batch_size(), ConsumerSettings::default().max_batch_size);
    }

    #[test]
    fn test_env_config_defaults() {
        let config = Config::init_from_hashmap(&std::collections::HashMap::from([(
            "BIND_PORT".to_string(),
            "9100".to_string(),
        )]))
        .unwrap();

        assert_eq!(config.bind_address(), "0.0.0.0:9100");
        assert_eq!(config.api_kind, ApiKind::Telemetry);
        assert_eq!(config.settings(), ConsumerSettings::default());
        assert_eq!(config.recreate_delay(), Duration::from_secs(5));
    }

    #[test]
    fn test_max_batch_size_is_at_least_one() {
        let config = ConsumerConfig::new("tenant-a", ApiKind::Telemetry).with_max_batch_size(0);
        assert_eq!(config.max_batch_size(), 1);
    }

    #[test]
    fn test_client_config_disables_auto_commit() {
        let config = KafkaClientConfigBuilder::for_application_consumer("localhost:9092", "app")
            .with_tls(true)
            .with_offset_reset("earliest")
            .build();

        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("enable.auto.offset.store"), Some("false"));
        assert_eq!(config.get("security.protocol"), Some("ssl"));
        assert_eq!(config.get("auto.offset.reset"), Some("earliest"));
        assert_eq!(config.get("group.id"), Some("app"));
    }
}

//! Flat key/value configuration and its resolution into typed settings.
//!
//! Operators supply a flat map such as:
//!
//! ```toml
//! "kafka.bootstrap.servers" = "broker:9092"
//! "kafka.group.id" = "graph"
//! "streams.sink.topic.cypher.people" = "MERGE (p:Person {id: event.id})"
//! "streams.sink.topic.cypher.people.to.sales" = "MERGE (p:Customer {id: event.id})"
//! ```
//!
//! [`resolve`] turns that map plus a target database into a
//! [`KafkaConfiguration`] and a [`TopicConfiguration`]. Resolution is pure:
//! the same inputs always produce the same outputs.

use crate::{Error, Result};
use rdkafka::ClientConfig;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

pub const DEFAULT_DATABASE: &str = "neo4j";

pub const KAFKA_PREFIX: &str = "kafka.";
pub const SINK_TOPIC_CYPHER_PREFIX: &str = "streams.sink.topic.cypher.";
pub const SINK_DATABASE_MARKER: &str = ".to.";

pub const BYTE_ARRAY_DESERIALIZER: &str =
    "org.apache.kafka.common.serialization.ByteArrayDeserializer";
pub const BYTE_ARRAY_SERIALIZER: &str = "org.apache.kafka.common.serialization.ByteArraySerializer";

const BOOTSTRAP_SERVERS: &str = "bootstrap.servers";
const GROUP_ID: &str = "group.id";
const AUTO_OFFSET_RESET: &str = "auto.offset.reset";
const KEY_DESERIALIZER: &str = "key.deserializer";
const VALUE_DESERIALIZER: &str = "value.deserializer";
const KEY_SERIALIZER: &str = "key.serializer";
const VALUE_SERIALIZER: &str = "value.serializer";
const ENABLE_AUTO_COMMIT: &str = "enable.auto.commit";
const ASYNC_COMMIT: &str = "streams.async.commit";
const ADMIN_API_ENABLED: &str = "streams.admin.client.api.enabled";
const TOPIC_DISCOVERY_INTERVAL: &str = "streams.topic.discovery.polling.interval";
const CHECK_CONNECTION: &str = "streams.check.connection";

const KNOWN_PROPERTIES: &[&str] = &[
    BOOTSTRAP_SERVERS,
    GROUP_ID,
    AUTO_OFFSET_RESET,
    KEY_DESERIALIZER,
    VALUE_DESERIALIZER,
    KEY_SERIALIZER,
    VALUE_SERIALIZER,
    ENABLE_AUTO_COMMIT,
    ASYNC_COMMIT,
    ADMIN_API_ENABLED,
    TOPIC_DISCOVERY_INTERVAL,
    CHECK_CONNECTION,
];

const RECOGNIZED_NAMESPACES: &[&str] = &[KAFKA_PREFIX, "streams."];

/// Operator-supplied settings, keyed by their full dotted name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawConfig {
    entries: BTreeMap<String, String>,
}

impl RawConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a TOML file. Nested tables are flattened with `.` separators
    /// and scalar values are kept as strings.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let table: toml::Table = content
            .parse()
            .map_err(|e: toml::de::Error| Error::Config(format!("Invalid configuration file: {e}")))?;

        let mut entries = BTreeMap::new();
        flatten_table("", &table, &mut entries)?;

        let raw = Self { entries };
        raw.log_unrecognized();
        Ok(raw)
    }

    /// Parses a `key=value` override as given on the command line.
    pub fn parse_override(arg: &str) -> Result<(String, String)> {
        match arg.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                Ok((key.trim().to_string(), value.trim().to_string()))
            }
            _ => Err(Error::Config(format!(
                "Invalid override `{arg}`, expected key=value"
            ))),
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Entries under `prefix`, with the prefix stripped from the key.
    pub fn with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = (&'a str, &'a str)> {
        self.iter()
            .filter_map(move |(k, v)| k.strip_prefix(prefix).map(|rest| (rest, v)))
    }

    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool> {
        match self.get(key) {
            Some(value) => parse_bool(key, value),
            None => Ok(default),
        }
    }

    pub fn get_u64(&self, key: &str, default: u64) -> Result<u64> {
        match self.get(key) {
            Some(value) => parse_u64(key, value),
            None => Ok(default),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn log_unrecognized(&self) {
        for key in self.entries.keys() {
            if !RECOGNIZED_NAMESPACES.iter().any(|ns| key.starts_with(ns)) {
                debug!("Ignoring unrecognized configuration key '{}'", key);
            }
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for RawConfig {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

fn flatten_table(prefix: &str, table: &toml::Table, out: &mut BTreeMap<String, String>) -> Result<()> {
    for (key, value) in table {
        let full_key = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };

        let scalar = match value {
            toml::Value::Table(nested) => {
                flatten_table(&full_key, nested, out)?;
                continue;
            }
            toml::Value::String(s) => s.clone(),
            toml::Value::Integer(i) => i.to_string(),
            toml::Value::Float(f) => f.to_string(),
            toml::Value::Boolean(b) => b.to_string(),
            toml::Value::Datetime(d) => d.to_string(),
            toml::Value::Array(_) => {
                return Err(Error::Config(format!(
                    "Array values are not supported for `{full_key}`"
                )))
            }
        };
        out.insert(full_key, scalar);
    }
    Ok(())
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(Error::Config(format!(
            "The `{key}` property must be true or false, got `{value}`"
        ))),
    }
}

fn parse_u64(key: &str, value: &str) -> Result<u64> {
    value.trim().parse().map_err(|_| {
        Error::Config(format!(
            "The `{key}` property must be a non-negative integer, got `{value}`"
        ))
    })
}

/// Resolves broker client settings and sink topic templates for one database.
pub fn resolve(
    raw: &RawConfig,
    target_db: &str,
    is_default_db: bool,
) -> Result<(KafkaConfiguration, TopicConfiguration)> {
    let kafka = KafkaConfiguration::resolve(raw, target_db, is_default_db)?;
    let topics = TopicConfiguration::resolve(raw, target_db, is_default_db)?;
    Ok((kafka, topics))
}

/// Like [`resolve`], additionally probing broker reachability when
/// `kafka.streams.check.connection` is enabled.
pub async fn resolve_validated(
    raw: &RawConfig,
    target_db: &str,
    is_default_db: bool,
) -> Result<(KafkaConfiguration, TopicConfiguration)> {
    let (kafka, topics) = resolve(raw, target_db, is_default_db)?;
    if kafka.check_connection {
        kafka.validate_connection(Duration::from_secs(5)).await?;
    }
    Ok((kafka, topics))
}

/// Broker client configuration, immutable once resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KafkaConfiguration {
    pub bootstrap_servers: String,
    pub group_id: String,
    pub auto_offset_reset: String,
    pub key_deserializer: String,
    pub value_deserializer: String,
    pub key_serializer: String,
    pub value_serializer: String,
    pub enable_auto_commit: bool,
    pub async_commit: bool,
    pub admin_api_enabled: bool,
    pub topic_discovery_polling_interval_ms: u64,
    pub check_connection: bool,
    pub extra_properties: BTreeMap<String, String>,
    #[serde(skip)]
    configured: BTreeMap<String, String>,
}

impl Default for KafkaConfiguration {
    fn default() -> Self {
        Self {
            bootstrap_servers: default_bootstrap_servers(),
            group_id: DEFAULT_DATABASE.to_string(),
            auto_offset_reset: "earliest".to_string(),
            key_deserializer: BYTE_ARRAY_DESERIALIZER.to_string(),
            value_deserializer: BYTE_ARRAY_DESERIALIZER.to_string(),
            key_serializer: BYTE_ARRAY_SERIALIZER.to_string(),
            value_serializer: BYTE_ARRAY_SERIALIZER.to_string(),
            enable_auto_commit: true,
            async_commit: false,
            admin_api_enabled: true,
            topic_discovery_polling_interval_ms: default_topic_discovery_interval_ms(),
            check_connection: false,
            extra_properties: BTreeMap::new(),
            configured: BTreeMap::new(),
        }
    }
}

impl KafkaConfiguration {
    /// Builds the configuration from every `kafka.`-prefixed key.
    ///
    /// `group.id` is suffixed with `-<target_db>` unless the target is the
    /// default database. Unknown broker keys are kept verbatim in
    /// `extra_properties`.
    pub fn resolve(raw: &RawConfig, target_db: &str, is_default_db: bool) -> Result<Self> {
        let configured: BTreeMap<String, String> = raw
            .with_prefix(KAFKA_PREFIX)
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        let mut config = Self::default();
        let text = |key: &str, current: &mut String| {
            if let Some(value) = configured.get(key) {
                *current = value.clone();
            }
        };
        text(BOOTSTRAP_SERVERS, &mut config.bootstrap_servers);
        text(GROUP_ID, &mut config.group_id);
        text(AUTO_OFFSET_RESET, &mut config.auto_offset_reset);
        text(KEY_DESERIALIZER, &mut config.key_deserializer);
        text(VALUE_DESERIALIZER, &mut config.value_deserializer);
        text(KEY_SERIALIZER, &mut config.key_serializer);
        text(VALUE_SERIALIZER, &mut config.value_serializer);
        // Checked before any typed value is parsed
        config.validate_bootstrap_servers()?;

        if !is_default_db {
            config.group_id = format!("{}-{}", config.group_id, target_db);
        }

        let flag = |key: &str, default: bool| match configured.get(key) {
            Some(value) => parse_bool(&format!("{KAFKA_PREFIX}{key}"), value),
            None => Ok(default),
        };
        config.enable_auto_commit = flag(ENABLE_AUTO_COMMIT, true)?;
        config.async_commit = flag(ASYNC_COMMIT, false)?;
        config.admin_api_enabled = flag(ADMIN_API_ENABLED, true)?;
        config.check_connection = flag(CHECK_CONNECTION, false)?;

        if let Some(value) = configured.get(TOPIC_DISCOVERY_INTERVAL) {
            config.topic_discovery_polling_interval_ms =
                parse_u64(&format!("{KAFKA_PREFIX}{TOPIC_DISCOVERY_INTERVAL}"), value)?;
        }

        config.extra_properties = configured
            .iter()
            .filter(|(k, _)| !KNOWN_PROPERTIES.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        config.configured = configured;

        config.validate()?;
        Ok(config)
    }

    fn validate_bootstrap_servers(&self) -> Result<()> {
        if self.bootstrap_servers.trim().is_empty() {
            return Err(Error::Config(format!(
                "The `{KAFKA_PREFIX}{BOOTSTRAP_SERVERS}` property is empty"
            )));
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.topic_discovery_polling_interval_ms == 0 {
            return Err(Error::Config(format!(
                "The `{KAFKA_PREFIX}{TOPIC_DISCOVERY_INTERVAL}` property must be greater than zero"
            )));
        }
        Ok(())
    }

    pub fn topic_discovery_polling_interval(&self) -> Duration {
        Duration::from_millis(self.topic_discovery_polling_interval_ms)
    }

    pub fn value_is_byte_array(&self) -> bool {
        self.value_deserializer == BYTE_ARRAY_DESERIALIZER
    }

    /// Every broker property as the operator sees it: defaults plus each
    /// configured `kafka.*` key, with the resolved `group.id`.
    pub fn as_properties(&self) -> BTreeMap<String, String> {
        let mut properties = self.configured.clone();
        properties.insert(BOOTSTRAP_SERVERS.to_string(), self.bootstrap_servers.clone());
        properties.insert(GROUP_ID.to_string(), self.group_id.clone());
        properties.insert(AUTO_OFFSET_RESET.to_string(), self.auto_offset_reset.clone());
        properties.insert(ENABLE_AUTO_COMMIT.to_string(), self.enable_auto_commit.to_string());
        properties.insert(KEY_DESERIALIZER.to_string(), self.key_deserializer.clone());
        properties.insert(VALUE_DESERIALIZER.to_string(), self.value_deserializer.clone());
        properties
    }

    /// librdkafka client settings. Codec class references and `streams.*`
    /// keys are not librdkafka properties and are left out.
    pub fn client_config(&self) -> ClientConfig {
        let mut client = ClientConfig::new();
        for (key, value) in self.as_properties() {
            if is_client_property(&key) {
                client.set(key, value);
            }
        }
        client
    }

    /// Probes each bootstrap endpoint with a TCP connect.
    pub async fn validate_connection(&self, timeout: Duration) -> Result<()> {
        let mut unreachable = Vec::new();

        for server in self.bootstrap_servers.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let address = server.rsplit("://").next().unwrap_or(server);
            match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
                Ok(Ok(_)) => debug!("Broker {} is reachable", server),
                Ok(Err(e)) => {
                    warn!("Broker {} is not reachable: {}", server, e);
                    unreachable.push(server.to_string());
                }
                Err(_) => {
                    warn!("Broker {} did not answer within {:?}", server, timeout);
                    unreachable.push(server.to_string());
                }
            }
        }

        if unreachable.is_empty() {
            info!("All bootstrap servers are reachable");
            Ok(())
        } else {
            Err(Error::Validation(format!(
                "The servers defined into the property `{KAFKA_PREFIX}{BOOTSTRAP_SERVERS}` are not reachable: [{}]",
                unreachable.join(", ")
            )))
        }
    }
}

fn is_client_property(key: &str) -> bool {
    !(key.starts_with("streams.") || key.ends_with(".deserializer") || key.ends_with(".serializer"))
}

/// Sink topic name to write template, for one database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TopicConfiguration {
    cypher: BTreeMap<String, String>,
}

impl TopicConfiguration {
    pub fn resolve(raw: &RawConfig, target_db: &str, is_default_db: bool) -> Result<Self> {
        let cypher = resolve_topic_map(
            raw,
            SINK_TOPIC_CYPHER_PREFIX,
            SINK_DATABASE_MARKER,
            target_db,
            is_default_db,
        )?;
        Ok(Self { cypher })
    }

    pub fn template(&self, topic: &str) -> Option<&str> {
        self.cypher.get(topic).map(String::as_str)
    }

    pub fn topics(&self) -> Vec<String> {
        self.cypher.keys().cloned().collect()
    }

    pub fn cypher_topics(&self) -> &BTreeMap<String, String> {
        &self.cypher
    }

    pub fn len(&self) -> usize {
        self.cypher.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cypher.is_empty()
    }
}

/// Per-database topic lookup shared by sink templates and source routes.
///
/// `<prefix><topic><marker><db>` wins for `target_db`; the unsuffixed
/// `<prefix><topic>` applies only to the default database.
pub(crate) fn resolve_topic_map(
    raw: &RawConfig,
    prefix: &str,
    db_marker: &str,
    target_db: &str,
    is_default_db: bool,
) -> Result<BTreeMap<String, String>> {
    let mut plain = BTreeMap::new();
    let mut scoped = BTreeMap::new();

    for (key, value) in raw.with_prefix(prefix) {
        let malformed = || Error::Config(format!("Malformed topic key `{prefix}{key}`"));

        let (topic, db) = match key.rsplit_once(db_marker) {
            Some((topic, db)) => (topic, Some(db)),
            None => (key, None),
        };
        if topic.trim().is_empty() || db.is_some_and(|db| db.trim().is_empty()) {
            return Err(malformed());
        }
        if value.trim().is_empty() {
            return Err(Error::Config(format!(
                "The `{prefix}{key}` property has an empty value"
            )));
        }

        match db {
            Some(db) if db == target_db => {
                scoped.insert(topic.to_string(), value.to_string());
            }
            Some(_) => {}
            None => {
                plain.insert(topic.to_string(), value.to_string());
            }
        }
    }

    if is_default_db {
        for (topic, value) in plain {
            scoped.entry(topic).or_insert(value);
        }
    }
    Ok(scoped)
}

fn default_bootstrap_servers() -> String {
    "localhost:9092".to_string()
}

fn default_topic_discovery_interval_ms() -> u64 {
    300_000 // 5 minutes
}

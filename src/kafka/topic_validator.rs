//! Live view of which sink topics exist on the broker.
//!
//! Two strategies, picked once at construction:
//!
//! * [`TopicValidator::AlwaysValid`] answers `true` for every topic. Used
//!   when admin access is disabled, so the broker is trusted to auto-create.
//! * [`TopicValidator::Polling`] runs one background task that lists the
//!   broker's topics every polling interval and adds them to a cache.
//!
//! The cache has a single writer (the discovery task) and any number of
//! readers. Readers never lock.

use crate::kafka::admin::{KafkaTopicAdmin, TopicAdmin};
use crate::{config::KafkaConfiguration, Error, Result};
use dashmap::DashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub enum TopicValidator {
    AlwaysValid,
    Polling(PollingTopicValidator),
}

impl TopicValidator {
    /// Polling when `kafka.streams.admin.client.api.enabled`, otherwise
    /// always valid.
    pub fn from_config(config: &KafkaConfiguration, sink_topics: Vec<String>) -> Result<Self> {
        if config.admin_api_enabled {
            let admin = KafkaTopicAdmin::new(config)?;
            Ok(Self::polling(
                Arc::new(admin),
                sink_topics,
                config.topic_discovery_polling_interval(),
            ))
        } else {
            Ok(Self::AlwaysValid)
        }
    }

    pub fn polling(admin: Arc<dyn TopicAdmin>, sink_topics: Vec<String>, interval: Duration) -> Self {
        Self::Polling(PollingTopicValidator::new(admin, sink_topics, interval))
    }

    pub async fn start(&self) -> Result<()> {
        match self {
            TopicValidator::AlwaysValid => {
                info!("No need to poll the topic list, topic auto creation is assumed enabled");
                Ok(())
            }
            TopicValidator::Polling(validator) => validator.start().await,
        }
    }

    /// Returns once the discovery task, if any, has exited.
    pub async fn stop(&self) -> Result<()> {
        match self {
            TopicValidator::AlwaysValid => Ok(()),
            TopicValidator::Polling(validator) => validator.stop().await,
        }
    }

    pub fn is_valid_topic(&self, topic: &str) -> bool {
        match self {
            TopicValidator::AlwaysValid => true,
            TopicValidator::Polling(validator) => validator.is_valid_topic(topic),
        }
    }

    /// Configured sink topics not (yet) seen on the broker.
    pub fn invalid_topics(&self) -> Vec<String> {
        match self {
            TopicValidator::AlwaysValid => Vec::new(),
            TopicValidator::Polling(validator) => validator.invalid_topics(),
        }
    }

    /// Waits until `polls` poll attempts have completed. Returns at once
    /// when no discovery task is running.
    pub async fn wait_for_polls(&self, polls: u64) {
        if let TopicValidator::Polling(validator) = self {
            validator.wait_for_polls(polls).await;
        }
    }
}

enum Lifecycle {
    Created {
        polls: watch::Sender<u64>,
    },
    Running {
        discovery: Option<(JoinHandle<()>, CancellationToken)>,
    },
    Stopped,
}

impl Lifecycle {
    fn name(&self) -> &'static str {
        match self {
            Lifecycle::Created { .. } => "created",
            Lifecycle::Running { .. } => "running",
            Lifecycle::Stopped => "stopped",
        }
    }
}

pub struct PollingTopicValidator {
    admin: Arc<dyn TopicAdmin>,
    sink_topics: Vec<String>,
    interval: Duration,
    valid_topics: Arc<DashSet<String>>,
    auto_create: AtomicBool,
    polls: watch::Receiver<u64>,
    lifecycle: Mutex<Lifecycle>,
}

impl PollingTopicValidator {
    pub fn new(admin: Arc<dyn TopicAdmin>, sink_topics: Vec<String>, interval: Duration) -> Self {
        let (sender, receiver) = watch::channel(0);
        Self {
            admin,
            sink_topics,
            interval,
            valid_topics: Arc::new(DashSet::new()),
            auto_create: AtomicBool::new(false),
            polls: receiver,
            lifecycle: Mutex::new(Lifecycle::Created { polls: sender }),
        }
    }

    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        let polls = match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Created { polls } => polls,
            other => {
                let state = other.name();
                *lifecycle = other;
                return Err(Error::IllegalState(format!(
                    "topic validator cannot be started once {state}"
                )));
            }
        };

        let auto_create = match self.admin.auto_create_topics_enabled().await {
            Ok(enabled) => enabled,
            Err(e) => {
                warn!("Cannot tell whether topic auto creation is enabled, polling topics: {}", e);
                false
            }
        };
        self.auto_create.store(auto_create, Ordering::Release);

        if auto_create {
            info!("Topic auto creation is enabled on the broker, topic discovery not started");
            *lifecycle = Lifecycle::Running { discovery: None };
            return Ok(());
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(discover_topics(
            Arc::clone(&self.admin),
            Arc::clone(&self.valid_topics),
            self.interval,
            token.clone(),
            polls,
        ));
        info!(interval_ms = self.interval.as_millis() as u64, "Started topic discovery");
        *lifecycle = Lifecycle::Running {
            discovery: Some((handle, token)),
        };
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Running {
                discovery: Some((handle, token)),
            } => {
                token.cancel();
                if let Err(e) = handle.await {
                    warn!("Topic discovery task ended abnormally: {}", e);
                }
                info!("Stopped topic discovery");
            }
            previous => debug!("No topic discovery to stop in {} state", previous.name()),
        }
        Ok(())
    }

    pub fn is_valid_topic(&self, topic: &str) -> bool {
        self.auto_create.load(Ordering::Acquire) || self.valid_topics.contains(topic)
    }

    pub fn invalid_topics(&self) -> Vec<String> {
        if self.auto_create.load(Ordering::Acquire) {
            return Vec::new();
        }
        self.sink_topics
            .iter()
            .filter(|topic| !self.valid_topics.contains(topic.as_str()))
            .cloned()
            .collect()
    }

    pub async fn wait_for_polls(&self, polls: u64) {
        {
            let lifecycle = self.lifecycle.lock().await;
            if !matches!(*lifecycle, Lifecycle::Running { discovery: Some(_) }) {
                return;
            }
        }
        let mut receiver = self.polls.clone();
        // Err means the task exited; nothing more to wait for
        let _ = receiver.wait_for(|count| *count >= polls).await;
    }
}

async fn discover_topics(
    admin: Arc<dyn TopicAdmin>,
    valid_topics: Arc<DashSet<String>>,
    interval: Duration,
    token: CancellationToken,
    polls: watch::Sender<u64>,
) {
    while !token.is_cancelled() {
        match admin.list_topics().await {
            Ok(topics) => {
                for topic in topics {
                    valid_topics.insert(topic);
                }
                debug!("Topic discovery found {} topics", valid_topics.len());
            }
            Err(e) => {
                warn!(
                    "Cannot retrieve valid topics because of the following error, next attempt is in {} ms: {}",
                    interval.as_millis(),
                    e
                );
            }
        }
        polls.send_modify(|count| *count += 1);

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    debug!("Topic discovery loop exited");
}

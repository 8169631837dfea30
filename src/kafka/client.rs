use crate::config::ClusterConfig;
use crate::error::{ImporterError, Result};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::groups::GroupList;
use rdkafka::{Offset, TopicPartitionList};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerGroupInfo {
    pub group_id: String,
    pub protocol_type: String,
}

impl ConsumerGroupInfo {
    /// Groups that commit offsets: regular consumers, plus simple groups that
    /// only commit and never join (empty protocol type).
    pub fn is_consumer_group(&self) -> bool {
        self.protocol_type.is_empty() || self.protocol_type == "consumer"
    }
}

/// Blocking Kafka reader for one cluster. Call from `spawn_blocking`.
pub struct KafkaClient {
    consumer: BaseConsumer,
    config: ClusterConfig,
    client_id: String,
    timeout: Duration,
    // One consumer per group id; OffsetFetch is scoped by the consumer's group.id
    group_consumers: Mutex<HashMap<String, BaseConsumer>>,
}

impl KafkaClient {
    pub fn new(config: &ClusterConfig, client_id: &str, timeout: Duration) -> Result<Self> {
        let consumer: BaseConsumer = base_client_config(config, client_id)
            .set("group.id", format!("{client_id}-internal-{}", config.name))
            .create()
            .map_err(ImporterError::Kafka)?;

        Ok(Self {
            consumer,
            config: config.clone(),
            client_id: client_id.to_string(),
            timeout,
            group_consumers: Mutex::new(HashMap::new()),
        })
    }

    pub fn cluster_name(&self) -> &str {
        &self.config.name
    }

    #[instrument(skip(self), fields(cluster = %self.config.name))]
    pub fn list_consumer_groups(&self) -> Result<Vec<ConsumerGroupInfo>> {
        let group_list: GroupList = self
            .consumer
            .fetch_group_list(None, self.timeout)
            .map_err(ImporterError::Kafka)?;

        let groups = group_list
            .groups()
            .iter()
            .map(|g| ConsumerGroupInfo {
                group_id: g.name().to_string(),
                protocol_type: g.protocol_type().to_string(),
            })
            .collect();

        debug!(count = group_list.groups().len(), "Listed consumer groups");
        Ok(groups)
    }

    /// All partitions of all topics known to the cluster.
    #[instrument(skip(self), fields(cluster = %self.config.name))]
    pub fn fetch_topic_partitions(&self) -> Result<Vec<TopicPartition>> {
        let metadata = self
            .consumer
            .fetch_metadata(None, self.timeout)
            .map_err(ImporterError::Kafka)?;

        Ok(metadata
            .topics()
            .iter()
            .flat_map(|topic| {
                topic
                    .partitions()
                    .iter()
                    .map(move |p| TopicPartition::new(topic.name(), p.id()))
            })
            .collect())
    }

    /// High watermark (log-end offset) per partition. Partitions whose
    /// watermarks cannot be fetched are logged and left out.
    #[instrument(skip(self, partitions), fields(cluster = %self.config.name, count = partitions.len()))]
    pub fn fetch_watermarks(&self, partitions: &[TopicPartition]) -> HashMap<TopicPartition, i64> {
        let mut watermarks = HashMap::with_capacity(partitions.len());

        for tp in partitions {
            match self
                .consumer
                .fetch_watermarks(&tp.topic, tp.partition, self.timeout)
            {
                Ok((_low, high)) => {
                    watermarks.insert(tp.clone(), high);
                }
                Err(e) => {
                    warn!(
                        topic = %tp.topic,
                        partition = tp.partition,
                        error = %e,
                        "Failed to fetch watermarks"
                    );
                }
            }
        }

        watermarks
    }

    /// Committed offsets of `group_id` for `partitions`. Partitions without a
    /// committed offset are omitted.
    #[instrument(skip(self, partitions), fields(cluster = %self.config.name, group = %group_id))]
    pub fn fetch_committed_offsets(
        &self,
        group_id: &str,
        partitions: &[TopicPartition],
    ) -> Result<HashMap<TopicPartition, i64>> {
        let mut tpl = TopicPartitionList::with_capacity(partitions.len());
        for tp in partitions {
            tpl.add_partition(&tp.topic, tp.partition);
        }

        let mut consumers = self
            .group_consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !consumers.contains_key(group_id) {
            let consumer: BaseConsumer = base_client_config(&self.config, &self.client_id)
                .set("group.id", group_id)
                .create()
                .map_err(ImporterError::Kafka)?;
            consumers.insert(group_id.to_string(), consumer);
        }
        let Some(consumer) = consumers.get(group_id) else {
            return Ok(HashMap::new());
        };

        let committed = consumer
            .committed_offsets(tpl, self.timeout)
            .map_err(ImporterError::Kafka)?;

        let offsets: HashMap<TopicPartition, i64> = committed
            .elements()
            .iter()
            .filter_map(|elem| match elem.offset() {
                Offset::Offset(offset) if offset >= 0 => Some((
                    TopicPartition::new(elem.topic(), elem.partition()),
                    offset,
                )),
                _ => None,
            })
            .collect();

        debug!(partitions = offsets.len(), "Fetched committed offsets");
        Ok(offsets)
    }

    /// Drop cached per-group consumers for groups that no longer exist.
    pub fn retain_group_consumers(&self, live_groups: &[&str]) {
        let mut consumers = self
            .group_consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = consumers.len();
        consumers.retain(|group, _| live_groups.contains(&group.as_str()));
        if consumers.len() != before {
            debug!(
                before,
                after = consumers.len(),
                "Released consumers of vanished groups"
            );
        }
    }
}

fn base_client_config(config: &ClusterConfig, client_id: &str) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.bootstrap_servers)
        .set("client.id", format!("{client_id}-{}", config.name))
        .set("enable.auto.commit", "false");

    for (key, value) in &config.consumer_properties {
        client_config.set(key, value);
    }
    client_config
}

impl std::fmt::Debug for KafkaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaClient")
            .field("cluster", &self.config.name)
            .finish_non_exhaustive()
    }
}

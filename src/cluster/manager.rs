use crate::config::{ClusterConfig, CompiledFilters, ImporterConfig};
use crate::error::{ImporterError, Result};
use crate::kafka::client::{KafkaClient, TopicPartition};
use crate::offsets::model::PartitionOffset;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, instrument, warn};

const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Offsets read from one cluster in one poll.
#[derive(Debug, Default)]
pub struct OffsetsSnapshot {
    pub log_end: HashMap<TopicPartition, i64>,
    pub committed: Vec<(String, HashMap<TopicPartition, i64>)>,
    pub timestamp_ms: i64,
}

impl OffsetsSnapshot {
    /// Log-end events first, so group records already see the fresh log size.
    pub fn into_events(self, cluster: &str) -> Vec<PartitionOffset> {
        let ts = self.timestamp_ms;
        let mut events: Vec<PartitionOffset> = self
            .log_end
            .into_iter()
            .map(|(tp, offset)| PartitionOffset::log_end(cluster, tp.topic, tp.partition, offset, ts))
            .collect();

        for (group, offsets) in self.committed {
            events.extend(offsets.into_iter().map(|(tp, offset)| {
                PartitionOffset::committed(cluster, tp.topic, group.as_str(), tp.partition, offset, ts)
            }));
        }
        events
    }
}

/// Polls one Kafka cluster and feeds partition offsets into the pipeline.
pub struct ClusterManager {
    cluster_name: String,
    client: Arc<KafkaClient>,
    filters: CompiledFilters,
    poll_interval: Duration,
}

impl ClusterManager {
    pub fn new(config: &ClusterConfig, importer_config: &ImporterConfig) -> Result<Self> {
        let filters = config.compile_filters()?;
        let client = Arc::new(KafkaClient::new(
            config,
            env!("CARGO_PKG_NAME"),
            importer_config.kafka_timeout,
        )?);

        info!(
            cluster = %config.name,
            poll_interval = ?importer_config.poll_interval,
            "Created cluster manager"
        );

        Ok(Self {
            cluster_name: config.name.clone(),
            client,
            filters,
            poll_interval: importer_config.poll_interval,
        })
    }

    #[instrument(skip(self, shutdown, events), fields(cluster = %self.cluster_name))]
    pub async fn run(
        self,
        mut shutdown: broadcast::Receiver<()>,
        events: mpsc::Sender<PartitionOffset>,
    ) {
        info!("Starting collection loop");

        let mut interval = tokio::time::interval(self.poll_interval);
        let mut consecutive_errors = 0u32;
        let mut current_backoff = Duration::from_secs(1);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.collect_once(&events).await {
                        Ok(()) => {
                            consecutive_errors = 0;
                            current_backoff = Duration::from_secs(1);
                        }
                        Err(ImporterError::Channel(_)) => {
                            info!("Pipeline closed, stopping collection");
                            break;
                        }
                        Err(e) => {
                            consecutive_errors += 1;
                            error!(
                                error = %e,
                                consecutive_errors,
                                "Collection failed"
                            );

                            if consecutive_errors >= 3 {
                                let backoff = current_backoff.min(MAX_BACKOFF);
                                warn!(
                                    backoff_secs = backoff.as_secs(),
                                    "Applying backoff due to consecutive errors"
                                );
                                tokio::select! {
                                    _ = tokio::time::sleep(backoff) => {}
                                    _ = shutdown.recv() => break,
                                }
                                current_backoff = (current_backoff * 2).min(MAX_BACKOFF);
                            }
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Received shutdown signal");
                    break;
                }
            }
        }

        info!("Collection loop stopped");
    }

    async fn collect_once(&self, events: &mpsc::Sender<PartitionOffset>) -> Result<()> {
        let start = Instant::now();
        let client = Arc::clone(&self.client);
        let filters = self.filters.clone();

        let snapshot = tokio::task::spawn_blocking(move || read_offsets(&client, &filters))
            .await
            .map_err(|e| ImporterError::Io(std::io::Error::other(e)))??;

        let events_batch = snapshot.into_events(&self.cluster_name);
        let count = events_batch.len();
        for event in events_batch {
            events
                .send(event)
                .await
                .map_err(|_| ImporterError::Channel("pipeline closed".to_string()))?;
        }

        debug!(
            events = count,
            elapsed_ms = start.elapsed().as_millis(),
            "Collection cycle completed"
        );
        Ok(())
    }
}

fn read_offsets(client: &KafkaClient, filters: &CompiledFilters) -> Result<OffsetsSnapshot> {
    let partitions: Vec<TopicPartition> = client
        .fetch_topic_partitions()?
        .into_iter()
        .filter(|tp| filters.matches_topic(&tp.topic))
        .collect();
    let log_end = client.fetch_watermarks(&partitions);

    let groups = client.list_consumer_groups()?;
    let group_ids: Vec<&str> = groups
        .iter()
        .filter(|g| g.is_consumer_group() && filters.matches_group(&g.group_id))
        .map(|g| g.group_id.as_str())
        .collect();
    debug!(
        partitions = partitions.len(),
        groups = group_ids.len(),
        "Reading committed offsets"
    );

    let mut committed = Vec::with_capacity(group_ids.len());
    for group_id in &group_ids {
        match client.fetch_committed_offsets(group_id, &partitions) {
            Ok(offsets) if !offsets.is_empty() => committed.push((group_id.to_string(), offsets)),
            Ok(_) => {}
            Err(e) => {
                warn!(
                    cluster = %client.cluster_name(),
                    group = %group_id,
                    error = %e,
                    "Failed to fetch group offsets"
                );
            }
        }
    }
    client.retain_group_consumers(&group_ids);

    Ok(OffsetsSnapshot {
        log_end,
        committed,
        timestamp_ms: now_ms(),
    })
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

use crate::config::{ImporterConfig, InfluxConfig};
use crate::error::{ImporterError, Result};
use crate::export::point::{
    BatchPoints, FieldValue, Point, Precision, FIELD_LAG, FIELD_LOG_SIZE, FIELD_OFFSET,
    TAG_CLUSTER, TAG_CONSUMER_GROUP, TAG_TOPIC,
};
use crate::export::stats::ImporterStats;
use crate::export::store::StoreClient;
use crate::offsets::model::ConsumerFullOffset;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Everything the flush loop needs to turn records into batches.
#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub database: String,
    pub measurement: String,
    pub extra_tags: HashMap<String, String>,
    /// Flush once a batch holds more points than this.
    pub threshold: usize,
    /// Flush once this long has passed since the previous flush.
    pub max_time_gap: Duration,
    pub channel_capacity: usize,
    pub flush_on_close: bool,
}

impl BatchSettings {
    pub fn from_config(importer: &ImporterConfig, influx: &InfluxConfig) -> Self {
        Self {
            database: influx.database.clone(),
            measurement: influx.measurement.clone(),
            extra_tags: influx.extra_tags.clone(),
            threshold: importer.threshold,
            max_time_gap: importer.max_time_gap,
            channel_capacity: importer.channel_capacity,
            flush_on_close: importer.flush_on_close,
        }
    }
}

/// An importer that has not been started yet.
pub struct Importer<S> {
    settings: BatchSettings,
    store: S,
    stats: Arc<ImporterStats>,
}

/// Handle to a started importer. Dropping it without [`RunningImporter::stop`]
/// still closes the channel, but nobody waits for the drain.
pub struct RunningImporter {
    tx: mpsc::Sender<ConsumerFullOffset>,
    task: JoinHandle<()>,
    stats: Arc<ImporterStats>,
}

impl<S: StoreClient> Importer<S> {
    pub fn new(settings: BatchSettings, store: S) -> Self {
        Self {
            settings,
            store,
            stats: Arc::new(ImporterStats::new()),
        }
    }

    #[cfg(test)]
    pub fn stats(&self) -> Arc<ImporterStats> {
        Arc::clone(&self.stats)
    }

    /// Create the target database and spawn the flush loop. A failed
    /// `CREATE DATABASE` is returned to the caller; nothing is spawned.
    pub async fn start(self) -> Result<RunningImporter> {
        let command = format!(
            "CREATE DATABASE \"{}\"",
            self.settings.database.replace('"', "\\\"")
        );
        self.store
            .execute(&command, &self.settings.database)
            .await
            .map_err(|e| {
                error!(database = %self.settings.database, error = %e, "Failed to create database");
                e
            })?;
        self.stats.set_database_ready();
        info!(
            database = %self.settings.database,
            threshold = self.settings.threshold,
            max_time_gap = ?self.settings.max_time_gap,
            channel_capacity = self.settings.channel_capacity,
            "Importer started"
        );

        let (tx, rx) = mpsc::channel(self.settings.channel_capacity);
        let stats = Arc::clone(&self.stats);
        stats.set_running(true);

        let writer = BatchWriter {
            batch: BatchPoints::new(&self.settings.database, Precision::Seconds),
            settings: self.settings,
            store: self.store,
            stats: Arc::clone(&stats),
            last_flush: Instant::now(),
        };
        let task = tokio::spawn(writer.run(rx));

        Ok(RunningImporter { tx, task, stats })
    }
}

impl RunningImporter {
    /// Queue a record for export. Waits while the channel is full.
    pub async fn submit(&self, record: ConsumerFullOffset) -> Result<()> {
        self.tx
            .send(record)
            .await
            .map_err(|_| ImporterError::Channel("importer loop has exited".to_string()))
    }

    pub fn stats(&self) -> Arc<ImporterStats> {
        Arc::clone(&self.stats)
    }

    /// Close the input and wait until every queued record has been processed.
    pub async fn stop(self) {
        let Self { tx, task, .. } = self;
        drop(tx);
        if let Err(e) = task.await {
            error!(error = %e, "Importer loop panicked");
        }
    }
}

struct BatchWriter<S> {
    settings: BatchSettings,
    store: S,
    stats: Arc<ImporterStats>,
    batch: BatchPoints,
    last_flush: Instant,
}

impl<S: StoreClient> BatchWriter<S> {
    async fn run(mut self, mut rx: mpsc::Receiver<ConsumerFullOffset>) {
        let gap = self.settings.max_time_gap;

        loop {
            // Idle deadline follows the most recent flush
            let deadline = self.last_flush + gap;
            tokio::select! {
                biased;
                msg = rx.recv() => match msg {
                    Some(record) => {
                        self.add(&record);
                        if self.should_flush() {
                            self.flush().await;
                        }
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline), if !self.batch.is_empty() => {
                    debug!(points = self.batch.len(), "Flushing idle batch");
                    self.flush().await;
                }
            }
        }

        if self.settings.flush_on_close && !self.batch.is_empty() {
            self.flush().await;
        } else if !self.batch.is_empty() {
            warn!(points = self.batch.len(), "Discarding unflushed points on close");
        }

        self.stats.set_running(false);
        info!("Importer stopped");
    }

    fn add(&mut self, record: &ConsumerFullOffset) {
        self.stats.record_received();
        match build_point(&self.settings, record) {
            Ok(point) => self.batch.add_point(point),
            Err(e) => {
                self.stats.point_invalid();
                error!(
                    cluster = %record.cluster,
                    topic = %record.topic,
                    group = %record.group,
                    error = %e,
                    "Error adding point"
                );
            }
        }
    }

    fn should_flush(&self) -> bool {
        !self.batch.is_empty()
            && (self.batch.len() > self.settings.threshold
                || self.last_flush.elapsed() >= self.settings.max_time_gap)
    }

    /// Write the current batch and start a new one whatever the outcome.
    async fn flush(&mut self) {
        let batch = std::mem::replace(
            &mut self.batch,
            BatchPoints::new(&self.settings.database, Precision::Seconds),
        );
        let points = batch.len();

        match self.store.write(&batch).await {
            Ok(()) => {
                self.stats.flush_succeeded(points);
                debug!(points, "Flushed batch");
            }
            Err(e) => {
                self.stats.flush_failed(points);
                error!(points, error = %e, "Error inserting points, batch discarded");
            }
        }

        self.last_flush = Instant::now();
    }
}

fn build_point(settings: &BatchSettings, record: &ConsumerFullOffset) -> Result<Point> {
    let mut tags = BTreeMap::from([
        (TAG_TOPIC.to_string(), record.topic.clone()),
        (TAG_CONSUMER_GROUP.to_string(), record.group.clone()),
        (TAG_CLUSTER.to_string(), record.cluster.clone()),
    ]);
    for (key, value) in &settings.extra_tags {
        tags.insert(key.clone(), value.clone());
    }

    let fields = BTreeMap::from([
        (FIELD_OFFSET.to_string(), FieldValue::Integer(record.offset)),
        (FIELD_LOG_SIZE.to_string(), FieldValue::Integer(record.max_offset)),
        (
            FIELD_LAG.to_string(),
            FieldValue::Integer(record.max_offset - record.offset),
        ),
    ]);

    Point::new(
        settings.measurement.as_str(),
        tags,
        fields,
        record.timestamp / 1000,
    )
}

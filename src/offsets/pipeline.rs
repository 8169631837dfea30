use crate::export::RunningImporter;
use crate::offsets::aggregator::OffsetAggregator;
use crate::offsets::model::PartitionOffset;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Drive the aggregator from the event channel until every sender is gone,
/// then stop the importer so it drains what is still buffered.
///
/// With no importer (export disabled) records are only logged.
pub async fn run_pipeline(
    mut aggregator: OffsetAggregator,
    mut events: mpsc::Receiver<PartitionOffset>,
    importer: Option<RunningImporter>,
) -> OffsetAggregator {
    info!("Starting aggregation pipeline");

    let mut submitted: u64 = 0;
    while let Some(event) = events.recv().await {
        for record in aggregator.apply(&event) {
            match &importer {
                Some(importer) => {
                    if let Err(e) = importer.submit(record).await {
                        error!(error = %e, "Failed to submit record");
                    } else {
                        submitted += 1;
                    }
                }
                None => debug!(
                    cluster = %record.cluster,
                    topic = %record.topic,
                    group = %record.group,
                    offset = record.offset,
                    max_offset = record.max_offset,
                    lag = record.lag,
                    "Full offset updated"
                ),
            }
        }
    }

    info!(
        submitted,
        topics = aggregator.topic_count(),
        groups = aggregator.group_count(),
        "Event channel closed, stopping importer"
    );
    if let Some(importer) = importer {
        importer.stop().await;
    }

    aggregator
}

use crate::errors::{Error, Result};
use crate::metrics::{BATCH_SIZE, CHANNEL_FULL_TOTAL, INGEST_LATENCY_SECONDS};
use crate::model::SensorReading;
use crate::store::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant};
use tracing::{debug, error, info};

const MAX_RETRIES: u32 = 3;

/// Hands a validated reading to the batcher.
///
/// Falls back to an awaited send when the channel is full, so a slow database
/// pushes back on the HTTP handlers instead of dropping readings.
pub async fn enqueue(tx: &mpsc::Sender<SensorReading>, reading: SensorReading) -> Result<()> {
    match tx.try_send(reading) {
        Ok(()) => Ok(()),
        Err(mpsc::error::TrySendError::Full(reading)) => {
            CHANNEL_FULL_TOTAL.inc();
            debug!("Channel full, using blocking send");
            tx.send(reading).await.map_err(|_| Error::ChannelSend)
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            error!("Channel closed, cannot queue reading");
            Err(Error::ChannelSend)
        }
    }
}

pub async fn run_batcher(
    mut rx: mpsc::Receiver<SensorReading>,
    store: Arc<dyn Store>,
    max_batch: usize,
    max_wait_ms: u64,
) {
    info!(
        "Starting batcher with max_batch={}, max_wait_ms={}",
        max_batch, max_wait_ms
    );

    let mut buffer: Vec<SensorReading> = Vec::with_capacity(max_batch);
    let mut ticker = interval(Duration::from_millis(max_wait_ms));

    loop {
        tokio::select! {
            reading = rx.recv() => {
                match reading {
                    Some(r) => {
                        buffer.push(r);

                        if buffer.len() >= max_batch {
                            flush_batch(store.as_ref(), &mut buffer).await;
                        }
                    }
                    None => {
                        info!("Channel closed, flushing remaining batch");
                        flush_batch(store.as_ref(), &mut buffer).await;
                        break;
                    }
                }
            }

            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    flush_batch(store.as_ref(), &mut buffer).await;
                }
            }
        }
    }

    info!("Batcher stopped");
}

async fn flush_batch(store: &dyn Store, buffer: &mut Vec<SensorReading>) {
    let batch_len = buffer.len();
    if batch_len == 0 {
        return;
    }

    debug!("Flushing batch of {} readings", batch_len);
    BATCH_SIZE.set(batch_len as f64);

    let start = Instant::now();
    let mut attempt = 0;

    loop {
        attempt += 1;

        match store.insert_readings(buffer).await {
            Ok(()) => {
                let elapsed = start.elapsed().as_secs_f64();
                INGEST_LATENCY_SECONDS.observe(elapsed);
                if attempt > 1 {
                    info!("Batch inserted after {} attempts in {:.3}s", attempt, elapsed);
                } else {
                    debug!("Batch inserted in {:.3}s", elapsed);
                }
                buffer.clear();
                BATCH_SIZE.set(0.0);
                return;
            }
            Err(e) => {
                if attempt >= MAX_RETRIES {
                    error!("Failed to insert batch after {} attempts: {}", MAX_RETRIES, e);
                    error!("CRITICAL: {} readings dropped due to persistent DB failure", batch_len);
                    buffer.clear();
                    BATCH_SIZE.set(0.0);
                    return;
                }

                // 100ms, 200ms, 400ms
                let backoff_ms = 100 * 2_u64.pow(attempt - 1);
                error!(
                    "Failed to insert batch (attempt {}/{}): {}. Retrying in {}ms...",
                    attempt, MAX_RETRIES, e, backoff_ms
                );

                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            }
        }
    }
}

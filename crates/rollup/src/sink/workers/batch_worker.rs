use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use async_channel::{Receiver, Sender};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use super::Worker;
use crate::common::{BulkItemFailure, OutputRecord};
use crate::sink::{Ledger, SinkMessage};

/// 📦 Collects submitted records into batches. A batch ships when it reaches
/// `bulk_actions`, when `flush_interval` has passed since the last shipment, on an explicit
/// flush, and once more when the input closes.
#[derive(Debug)]
pub(crate) struct BatchWorker {
    rx: Receiver<SinkMessage>,
    batches_tx: Sender<Vec<OutputRecord>>,
    bulk_actions: usize,
    flush_interval: Duration,
    ledger: Arc<Ledger>,
}

impl BatchWorker {
    pub(crate) fn new(
        rx: Receiver<SinkMessage>,
        batches_tx: Sender<Vec<OutputRecord>>,
        bulk_actions: usize,
        flush_interval: Duration,
        ledger: Arc<Ledger>,
    ) -> Self {
        Self {
            rx,
            batches_tx,
            bulk_actions: bulk_actions.max(1),
            flush_interval,
            ledger,
        }
    }

    async fn dispatch(&self, buffer: &mut Vec<OutputRecord>) -> Result<()> {
        if buffer.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(buffer);
        trace!("📦 dispatching a batch of {}", batch.len());
        if let Err(rejected) = self.batches_tx.send(batch).await {
            // 💀 every writer is gone; account for the batch so nobody waits on it forever
            let batch = rejected.into_inner();
            let failures: Vec<BulkItemFailure> = batch
                .iter()
                .map(|record| BulkItemFailure {
                    collection: record.collection.clone(),
                    id: record.id.clone(),
                    status: 0,
                    error: "no sink worker left to write this batch".to_string(),
                })
                .collect();
            self.ledger.account(None, batch.len(), &failures);
            bail!("💀 Every sink worker has exited. {} records were marked failed on the dock.", batch.len());
        }
        Ok(())
    }
}

impl Worker for BatchWorker {
    fn start(self) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            debug!("📦 BatchWorker started: {} per batch, every {:?}", self.bulk_actions, self.flush_interval);
            let mut buffer = Vec::with_capacity(self.bulk_actions);
            let mut ticker = tokio::time::interval(self.flush_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick fires immediately; nothing to flush yet
            ticker.tick().await;

            let outcome = loop {
                tokio::select! {
                    message = self.rx.recv() => match message {
                        Ok(SinkMessage::Record(record)) => {
                            buffer.push(record);
                            if buffer.len() >= self.bulk_actions {
                                if let Err(err) = self.dispatch(&mut buffer).await {
                                    break Err(err);
                                }
                                // ⏱️ the interval counts from the last shipment, not from start
                                ticker.reset();
                            }
                        }
                        Ok(SinkMessage::Flush) => {
                            if let Err(err) = self.dispatch(&mut buffer).await {
                                break Err(err);
                            }
                            ticker.reset();
                        }
                        Err(_) => {
                            debug!("🏁 BatchWorker: input closed, shipping what's left");
                            break self.dispatch(&mut buffer).await;
                        }
                    },
                    _ = ticker.tick() => {
                        if let Err(err) = self.dispatch(&mut buffer).await {
                            break Err(err);
                        }
                    }
                }
            };

            // 🚪 no more batches; writers finish what they have and exit
            self.batches_tx.close();
            outcome
        })
    }
}

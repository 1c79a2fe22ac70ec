use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::Result;
use async_channel::Receiver;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::Worker;
use crate::backends::DocumentStore;
use crate::common::{BulkItemFailure, OutputRecord};
use crate::sink::Ledger;

/// 🚰 Pulls batches off the shared channel and writes them. Write errors never end the
/// worker: a failed request marks every record in it failed, and the worker moves on.
#[derive(Debug)]
pub(crate) struct SinkWorker<S: ?Sized> {
    id: usize,
    rx: Receiver<Vec<OutputRecord>>,
    store: Arc<S>,
    ledger: Arc<Ledger>,
}

/// 🛡️ A batch this worker holds but hasn't accounted for yet. If the worker unwinds before
/// `account` runs, dropping this settles the batch as failed so the drain still opens.
struct Unsettled<'a> {
    ledger: &'a Ledger,
    worker: usize,
    records: usize,
}

impl Unsettled<'_> {
    fn account(mut self, failures: &[BulkItemFailure]) {
        let records = std::mem::take(&mut self.records);
        self.ledger.account(Some(self.worker), records, failures);
    }
}

impl Drop for Unsettled<'_> {
    fn drop(&mut self) {
        if self.records > 0 {
            error!("💀 SinkWorker {} lost a batch of {} records mid-write", self.worker, self.records);
            self.ledger.abandon(Some(self.worker), self.records);
        }
    }
}

fn whole_batch_failed(batch: &[OutputRecord], error: &str) -> Vec<BulkItemFailure> {
    batch
        .iter()
        .map(|record| BulkItemFailure {
            collection: record.collection.clone(),
            id: record.id.clone(),
            status: 0,
            error: error.to_string(),
        })
        .collect()
}

impl<S: DocumentStore + ?Sized> SinkWorker<S> {
    pub(crate) fn new(id: usize, rx: Receiver<Vec<OutputRecord>>, store: Arc<S>, ledger: Arc<Ledger>) -> Self {
        Self { id, rx, store, ledger }
    }
}

impl<S: DocumentStore + ?Sized + 'static> Worker for SinkWorker<S> {
    fn start(self) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            debug!("📥 SinkWorker {} started draining batches", self.id);
            loop {
                let Ok(batch) = self.rx.recv().await else {
                    debug!("🏁 SinkWorker {}: channel closed. Shutting down.", self.id);
                    return Ok(());
                };
                self.ledger.stats().record_taken(self.id, batch.len() as u64);
                let unsettled = Unsettled {
                    ledger: &self.ledger,
                    worker: self.id,
                    records: batch.len(),
                };

                let written = AssertUnwindSafe(self.store.bulk_upsert(&batch)).catch_unwind().await;
                let failures = match written {
                    Ok(Ok(failures)) => failures,
                    Ok(Err(err)) => {
                        warn!("💀 SinkWorker {}: bulk write of {} records failed outright: {err:#}", self.id, batch.len());
                        whole_batch_failed(&batch, &format!("{err:#}"))
                    }
                    Err(_) => {
                        error!("💀 SinkWorker {}: the store panicked writing {} records", self.id, batch.len());
                        whole_batch_failed(&batch, "the document store panicked during the bulk write")
                    }
                };
                unsettled.account(&failures);
            }
        })
    }
}

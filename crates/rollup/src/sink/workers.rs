//! 🧵 The sink's tasks: one batcher, many bulk writers.
//!
//! ```text
//! submit() ──records──▶ BatchWorker ──batches──▶ SinkWorker × N ──▶ DocumentStore
//!                          │ full or ⏱️                   │
//!                          ▼                              ▼
//!                      Flush / close               Ledger: stats, failure callback, drain
//! ```

use anyhow::Result;
use tokio::task::JoinHandle;

mod batch_worker;
mod sink_worker;

pub(crate) use batch_worker::BatchWorker;
pub(crate) use sink_worker::SinkWorker;

/// 🏭 Anything that runs as its own task until its input channel closes.
pub(crate) trait Worker {
    fn start(self) -> JoinHandle<Result<()>>;
}

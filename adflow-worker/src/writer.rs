use std::sync::Arc;

use adflow_common::publisher::ResultPublisher;
use adflow_common::selection::SelectionResult;
use adflow_common::store::{ResultStore, StoreError, WriteStatus};

use crate::error::WriteError;

/// The result on record for an event after a write.
#[derive(Debug, Clone, PartialEq)]
pub struct Recorded {
    pub status: WriteStatus,
    /// On `AlreadyExists` this is the stored result, not the one just computed.
    pub result: SelectionResult,
}

impl Recorded {
    pub fn is_duplicate(&self) -> bool {
        self.status == WriteStatus::AlreadyExists
    }
}

/// Persists selection results through a conditional write on the event identity, then
/// publishes whatever result is on record.
#[derive(Clone)]
pub struct ResultWriter {
    store: Arc<dyn ResultStore>,
    publisher: Option<Arc<dyn ResultPublisher>>,
}

impl ResultWriter {
    pub fn new(store: Arc<dyn ResultStore>) -> Self {
        Self {
            store,
            publisher: None,
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn ResultPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Write `result` unless a result already exists for its event.
    ///
    /// `AlreadyExists` means a previous delivery of the same event finished; callers
    /// treat it as success and report the stored result.
    pub async fn write(&self, result: SelectionResult) -> Result<Recorded, WriteError> {
        let written = self.store.write_if_absent(&result).await;

        let status = match &written {
            Ok(WriteStatus::Written) => "written",
            Ok(WriteStatus::AlreadyExists) => "already_exists",
            Err(error) if error.is_transient() => "transient_error",
            Err(_) => "permanent_error",
        };
        metrics::counter!("adflow_results_written_total", "status" => status).increment(1);

        let recorded = match written? {
            WriteStatus::Written => {
                let latency = result.end_to_end_latency().num_milliseconds().max(0);
                metrics::histogram!("adflow_end_to_end_latency_seconds")
                    .record(latency as f64 / 1000.0);
                Recorded {
                    status: WriteStatus::Written,
                    result,
                }
            }
            WriteStatus::AlreadyExists => Recorded {
                status: WriteStatus::AlreadyExists,
                result: self.stored(result).await?,
            },
        };

        if let Some(publisher) = &self.publisher {
            publisher.publish(&recorded.result).await?;
            metrics::counter!("adflow_results_published_total").increment(1);
        }

        Ok(recorded)
    }

    async fn stored(&self, computed: SelectionResult) -> Result<SelectionResult, StoreError> {
        let stored = self.store.read(computed.key()).await?;
        Ok(stored.unwrap_or(computed))
    }
}

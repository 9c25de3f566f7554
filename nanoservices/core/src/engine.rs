use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::events::interval::spawn_interval_trigger;
use crate::events::trigger::{Trigger, TriggerEvent};
use crate::pipeline::Pipeline;

/// Top-level runner. Register pipelines with their trigger and call run().
#[derive(Default)]
pub struct TransitFlow {
    pipelines: Vec<(Trigger, Arc<Pipeline>)>,
}

impl TransitFlow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pipeline. A `Manual` trigger runs exactly one cycle.
    pub fn add_pipeline(mut self, trigger: Trigger, pipeline: Arc<Pipeline>) -> Self {
        self.pipelines.push((trigger, pipeline));
        self
    }

    /// Run until Ctrl-C.
    pub async fn run(self) -> transitflow_utils::TransitFlowResult<()> {
        let shutdown = tokio::signal::ctrl_c();
        self.run_with_shutdown(async { let _ = shutdown.await; }).await
    }

    /// Run with a custom shutdown signal (useful for testing).
    ///
    /// On shutdown the running cycle of each pipeline stops dispatching new
    /// fetch tasks, lets in-flight ones finish, and records itself as aborted.
    pub async fn run_with_shutdown<F: std::future::Future>(self, shutdown: F) -> transitflow_utils::TransitFlowResult<()> {
        // Crash recovery
        for (_, pipeline) in &self.pipelines {
            let crashed = pipeline.warehouse().mark_inflight_as_crashed()?;
            if crashed > 0 {
                tracing::warn!(pipeline = %pipeline.name(), count = crashed, "marked in-flight cycles as crashed from previous session");
            }
        }

        let cancel = CancellationToken::new();
        let mut trigger_handles = Vec::new();
        let mut workers = Vec::new();

        for (trigger, pipeline) in self.pipelines {
            // One slot: a tick that fires mid-cycle waits for the cycle to end.
            let (event_tx, event_rx) = mpsc::channel(1);
            match &trigger {
                Trigger::Interval(duration) => {
                    trigger_handles.push(spawn_interval_trigger(pipeline.name().to_string(), *duration, event_tx));
                }
                Trigger::Manual => {
                    let _ = event_tx.try_send(TriggerEvent { pipeline: pipeline.name().to_string(), trigger: Trigger::Manual });
                }
            }
            workers.push(tokio::spawn(cycle_worker(pipeline, event_rx, cancel.clone())));
        }

        // Wait for shutdown signal
        shutdown.await;

        cancel.cancel();
        for handle in trigger_handles {
            handle.abort();
        }
        for worker in workers {
            let _ = worker.await;
        }

        tracing::info!("transitflow shutdown complete");
        Ok(())
    }
}

/// Runs the cycles of one pipeline, one at a time, in trigger order.
async fn cycle_worker(pipeline: Arc<Pipeline>, mut event_rx: mpsc::Receiver<TriggerEvent>, cancel: CancellationToken) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = event_rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let run_id = Uuid::new_v4().to_string();
        match pipeline.run_cycle_with_cancel(&run_id, &event.trigger, cancel.child_token()).await {
            Ok(summary) => {
                tracing::debug!(pipeline = %event.pipeline, run = %run_id, status = %summary.status, "cycle result recorded");
            }
            Err(e) => {
                tracing::error!(pipeline = %event.pipeline, run = %run_id, error = %e, "cycle failed");
            }
        }
    }
}

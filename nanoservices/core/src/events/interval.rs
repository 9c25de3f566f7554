use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use crate::events::trigger::{Trigger, TriggerEvent};

/// Spawns a tokio task that emits TriggerEvents on a fixed interval.
///
/// A tick that fires while the receiver is still busy waits in the channel;
/// missed ticks are delayed rather than burst.
pub fn spawn_interval_trigger(
    pipeline: String,
    interval: Duration,
    sender: mpsc::Sender<TriggerEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip the first immediate tick
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let event = TriggerEvent {
                pipeline: pipeline.clone(),
                trigger: Trigger::Interval(interval),
            };
            if sender.send(event).await.is_err() {
                // Receiver dropped, stop producing
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn interval_trigger_produces_events() {
        let (tx, mut rx) = mpsc::channel(16);

        let handle = spawn_interval_trigger("arrivals".to_string(), Duration::from_millis(50), tx);

        for _ in 0..2 {
            let event = tokio::time::timeout(Duration::from_millis(200), rx.recv())
                .await
                .expect("timeout")
                .expect("channel closed");
            assert_eq!(event.pipeline, "arrivals");
            assert_eq!(event.trigger, Trigger::Interval(Duration::from_millis(50)));
        }

        handle.abort();
    }

    #[tokio::test]
    async fn interval_trigger_stops_when_receiver_drops() {
        let (tx, rx) = mpsc::channel(1);
        let handle = spawn_interval_trigger("test".to_string(), Duration::from_millis(10), tx);
        drop(rx);

        let result = tokio::time::timeout(Duration::from_millis(500), handle).await;
        assert!(result.is_ok());
    }
}

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::rotate::Rotator;
use crate::segment::ActiveSegment;

/// Reason for an explicit rotate-and-wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// External operator request (SIGUSR1).
    Operator,
    /// No new records for a whole monitor interval.
    Inactivity,
}

/// Flush the rotator once per received trigger until the channel closes or
/// `token` is cancelled. Triggers are handled one at a time.
pub async fn run_trigger_loop(mut rx: mpsc::Receiver<Trigger>, rotator: Arc<Rotator>, token: CancellationToken) {
    loop {
        let trigger = tokio::select! {
            _ = token.cancelled() => break,
            trigger = rx.recv() => match trigger {
                Some(t) => t,
                None => break,
            },
        };

        match rotator.flush().await {
            Ok(result) if result.happened => {
                tracing::info!(?trigger, file = %result.path.display(), "flushed active file");
            }
            Ok(_) => tracing::debug!(?trigger, "nothing to flush"),
            Err(e) => tracing::error!(?trigger, error = %e, "flush failed"),
        }
    }
    tracing::debug!("trigger loop stopped");
}

/// Every `interval`, compare the last-seen record timestamp with its value
/// one interval earlier and send [`Trigger::Inactivity`] when it has not
/// advanced while records are pending.
pub fn spawn_inactivity_monitor(
    segment: Arc<ActiveSegment>,
    interval: Duration,
    tx: mpsc::Sender<Trigger>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut previous = segment.last_timestamp();

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let current = segment.last_timestamp();
            if current <= previous && segment.appended() > 0 {
                tracing::info!(idle_secs = interval.as_secs(), "no new records, requesting flush");
                if tx.send(Trigger::Inactivity).await.is_err() {
                    break;
                }
            }
            previous = current;
        }
        tracing::debug!("inactivity monitor stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::Archiver;
    use crate::record::RecordCodec;

    #[tokio::test(start_paused = true)]
    async fn monitor_is_quiet_while_records_advance() {
        let dir = tempfile::tempdir().unwrap();
        let segment = Arc::new(ActiveSegment::open(dir.path().join("kong.log"), 64).unwrap());
        let (tx, mut rx) = mpsc::channel(4);
        let token = CancellationToken::new();
        let handle = spawn_inactivity_monitor(segment.clone(), Duration::from_secs(10), tx, token.clone());

        let codec = RecordCodec::default();
        // Appends land halfway between ticks.
        tokio::time::sleep(Duration::from_secs(5)).await;
        for ts in 1..=3 {
            segment.append(&[codec.decode_line(&format!("{{\"started_at\":{}}}", ts * 1000))]).unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        }
        assert!(rx.try_recv().is_err());

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn trigger_loop_flushes_on_operator_request() {
        let dir = tempfile::tempdir().unwrap();
        let segment = Arc::new(ActiveSegment::open(dir.path().join("kong.log"), 64).unwrap());
        let rotator = Arc::new(Rotator::new(segment.clone(), Arc::new(Archiver::local(1)), 1000, 1, 10));
        segment.append(&[RecordCodec::default().decode_line("{}")]).unwrap();

        let (tx, rx) = mpsc::channel(1);
        let token = CancellationToken::new();
        let handle = tokio::spawn(run_trigger_loop(rx, rotator, token));

        tx.send(Trigger::Operator).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(segment.appended(), 0);
    }
}

//! Jittered tickers for the periodic loops.

use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;

/// Channel that fires once on creation, then repeatedly with each interval
/// drawn uniformly from `(d/2, d + d/2)`. The jitter prevents synchronized
/// stampedes across a fleet of supervisors. SIGUSR1 forces an immediate
/// tick, which makes manual testing bearable:
///
/// ```text
/// pkill -SIGUSR1 dzr-indexserver
/// ```
pub fn jitter_ticker(d: Duration) -> mpsc::Receiver<()> {
    let (tx, rx) = mpsc::channel(1);

    let tick_tx = tx.clone();
    tokio::spawn(async move {
        loop {
            if tick_tx.send(()).await.is_err() {
                return;
            }
            let ns = d.as_nanos().max(1) as u64;
            let sleep_for = {
                let mut rng = rand::thread_rng();
                Duration::from_nanos(ns / 2 + rng.gen_range(0..ns))
            };
            tokio::time::sleep(sleep_for).await;
        }
    });

    tokio::spawn(async move {
        let mut sig = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::user_defined1()) {
            Ok(s) => s,
            Err(err) => {
                tracing::warn!(error = %err, "cannot listen for SIGUSR1 ticks");
                return;
            }
        };
        while sig.recv().await.is_some() {
            if tx.send(()).await.is_err() {
                return;
            }
        }
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn fires_immediately_and_again_within_bounds() {
        let mut rx = jitter_ticker(Duration::from_millis(40));
        let start = Instant::now();
        rx.recv().await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(30), "first tick must be immediate");

        rx.recv().await.unwrap();
        let elapsed = start.elapsed();
        // Second tick lands in (d/2, d + d/2) plus scheduling slack.
        assert!(elapsed >= Duration::from_millis(20), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(500), "{elapsed:?}");
    }
}

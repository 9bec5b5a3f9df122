//! Timed discovery sweep for one advertised peripheral.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::time::sleep;
use tokio_stream::StreamExt;
use tracing::{debug, info, instrument, trace, warn};

use crate::error::ScanError;
use crate::hw::{DeviceIdentity, Transport};

/// Runs discovery sweeps over an injected transport.
///
/// At most one sweep runs at a time per scanner.
#[derive(Debug)]
pub struct Scanner {
    transport: Arc<dyn Transport>,
    in_flight: AtomicBool,
}

impl Scanner {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Sweeps until an advertisement satisfies `predicate` or `timeout` elapses.
    ///
    /// The sweep is stopped exactly once whichever way it ends, including when
    /// the returned future is dropped early.
    ///
    /// # Errors
    ///
    /// Returns [`ScanError::InProgress`] if another sweep is running,
    /// [`ScanError::Unavailable`] if the sweep cannot start, and
    /// [`ScanError::NotFound`] on timeout or when the sweep reports an error.
    #[instrument(skip(self, predicate), level = "info", fields(timeout = ?timeout))]
    pub async fn scan<P>(&self, predicate: P, timeout: Duration) -> Result<DeviceIdentity, ScanError>
    where
        P: Fn(&DeviceIdentity) -> bool + Send + Sync,
    {
        let _in_flight = InFlight::acquire(&self.in_flight).ok_or(ScanError::InProgress)?;

        let mut advertisements = self
            .transport
            .start_scan()
            .await
            .map_err(ScanError::Unavailable)?;
        let stop = ScanStop::new(Arc::clone(&self.transport));

        let deadline = sleep(timeout);
        tokio::pin!(deadline);

        let outcome = loop {
            tokio::select! {
                () = &mut deadline => {
                    debug!("scan timed out");
                    break Err(ScanError::NotFound { timeout });
                }
                event = advertisements.next() => match event {
                    Some(Ok(device)) if predicate(&device) => {
                        info!(device_id = device.device_id(), rssi = ?device.rssi(), "found device");
                        break Ok(device);
                    }
                    Some(Ok(device)) => {
                        trace!(device_id = device.device_id(), name = ?device.local_name(), "ignoring advertisement");
                    }
                    Some(Err(error)) => {
                        warn!(error = %error, "scan reported an error");
                        break Err(ScanError::NotFound { timeout });
                    }
                    None => {
                        warn!("advertisement stream ended before a match");
                        break Err(ScanError::NotFound { timeout });
                    }
                },
            }
        };

        stop.fire().await;
        outcome
    }
}

/// Marks a sweep as running until dropped.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_previous| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Issues `stop_scan` at most once.
struct ScanStop {
    transport: Arc<dyn Transport>,
    fired: AtomicBool,
}

impl ScanStop {
    fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            fired: AtomicBool::new(false),
        }
    }

    async fn fire(&self) {
        if self.fired.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(error) = self.transport.stop_scan().await {
            warn!(error = %error, "failed to stop scan");
        }
    }
}

impl Drop for ScanStop {
    fn drop(&mut self) {
        if self.fired.swap(true, Ordering::AcqRel) {
            return;
        }
        let Ok(handle) = Handle::try_current() else {
            warn!("scan abandoned outside a runtime; sweep left running");
            return;
        };
        let transport = Arc::clone(&self.transport);
        handle.spawn(async move {
            if let Err(error) = transport.stop_scan().await {
                warn!(error = %error, "failed to stop abandoned scan");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::hw::{FakeTransport, FakeTransportConfig};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn fake(fixture: &str) -> FakeTransport {
        let config = FakeTransportConfig::builder()
            .scan_fixture(fixture.parse().expect("fixture should parse"))
            .build();
        FakeTransport::new(config)
    }

    fn named(name: &'static str) -> impl Fn(&DeviceIdentity) -> bool + Send + Sync {
        move |device| device.is_named(name)
    }

    #[tokio::test(start_paused = true)]
    async fn scan_returns_first_match_and_stops_once() {
        let transport = fake("00:11|Speaker|-70;AA:BB|BLEExample|-43");
        let scanner = Scanner::new(Arc::new(transport.clone()));

        let device = scanner
            .scan(named("BLEExample"), TIMEOUT)
            .await
            .expect("scan should match");

        assert_eq!("AA:BB", device.device_id());
        assert_eq!(1, transport.stop_scan_calls());
    }

    #[tokio::test(start_paused = true)]
    async fn scan_times_out_without_match() {
        let transport = fake("00:11|Speaker|-70");
        let scanner = Scanner::new(Arc::new(transport.clone()));

        let result = scanner.scan(named("BLEExample"), TIMEOUT).await;

        assert_matches!(result, Err(ScanError::NotFound { timeout }) if timeout == TIMEOUT);
        assert_eq!(1, transport.stop_scan_calls());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_scan_is_rejected() {
        let transport = fake("00:11|Speaker|-70");
        let scanner = Scanner::new(Arc::new(transport.clone()));

        let (first, second) = tokio::join!(
            scanner.scan(named("BLEExample"), TIMEOUT),
            scanner.scan(named("BLEExample"), TIMEOUT),
        );

        assert_matches!(first, Err(ScanError::NotFound { .. }));
        assert_matches!(second, Err(ScanError::InProgress));
        assert_eq!(1, transport.start_scan_calls());
        assert_eq!(1, transport.stop_scan_calls());
    }

    #[tokio::test(start_paused = true)]
    async fn scanner_is_reusable_after_a_sweep() {
        let transport = fake("AA:BB|BLEExample|-43");
        let scanner = Scanner::new(Arc::new(transport.clone()));

        scanner
            .scan(named("BLEExample"), TIMEOUT)
            .await
            .expect("first scan should match");
        scanner
            .scan(named("BLEExample"), TIMEOUT)
            .await
            .expect("second scan should match");

        assert_eq!(2, transport.stop_scan_calls());
    }

    #[tokio::test(start_paused = true)]
    async fn scan_start_failure_is_unavailable() {
        let config = FakeTransportConfig::builder()
            .scan_fixture("AA:BB|BLEExample|-43".parse().expect("fixture should parse"))
            .fail_scan_start(true)
            .build();
        let transport = FakeTransport::new(config);
        let scanner = Scanner::new(Arc::new(transport.clone()));

        let result = scanner.scan(named("BLEExample"), TIMEOUT).await;

        assert_matches!(result, Err(ScanError::Unavailable(_)));
        assert_eq!(0, transport.stop_scan_calls());
    }

    #[tokio::test(start_paused = true)]
    async fn mid_sweep_error_resolves_not_found() {
        let config = FakeTransportConfig::builder()
            .scan_fixture("AA:BB|BLEExample|-43".parse().expect("fixture should parse"))
            .fail_scan_midway(true)
            .build();
        let transport = FakeTransport::new(config);
        let scanner = Scanner::new(Arc::new(transport.clone()));

        let result = scanner.scan(named("BLEExample"), TIMEOUT).await;

        assert_matches!(result, Err(ScanError::NotFound { .. }));
        assert_eq!(1, transport.stop_scan_calls());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_scan_still_stops_sweep() {
        let transport = fake("00:11|Speaker|-70");
        let scanner = Scanner::new(Arc::new(transport.clone()));

        let abandoned =
            tokio::time::timeout(Duration::from_secs(1), scanner.scan(named("BLEExample"), TIMEOUT))
                .await;
        tokio::task::yield_now().await;

        assert!(abandoned.is_err());
        assert_eq!(1, transport.stop_scan_calls());
    }
}

//! Service driver
//!
//! `AlertService` is the single owner of the engine. Everything reaches it as
//! a `Command` over one mpsc channel and is processed in arrival order. After
//! each tick the emitted alerts go out through the notifier and each outcome
//! is reported back to the engine.
//!
//! The auto-anchor candle fetch runs in its own task under a timeout and
//! posts its result back onto the same channel, so a slow fetch never holds
//! up ticks.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::clock::Clock;
use crate::common::{BreakerConfig, FetchBreaker};
use crate::config::{ConfigError, Settings};
use crate::engine::{AlertEngine, AutoAnchorRequest, EngineStats};
use crate::feed::{CandleFeed, CandleInterval, FeedError, SampleFeed};
use crate::notify::Notifier;
use crate::{Alert, Candle, Millis, Sample};

const DEFAULT_BUFFER: usize = 1_024;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("alert service is not running")]
    Stopped,

    #[error(transparent)]
    Feed(#[from] FeedError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Messages processed by the service loop
#[derive(Debug)]
pub enum Command {
    Sample(Sample),
    /// `None` anchors at the last sample price
    SetAnchor(Option<f64>),
    ClearAnchor,
    Reload(Box<Settings>, oneshot::Sender<Result<(), ConfigError>>),
    /// Feed disconnected or explicit flush of the pending secondary alert
    Flush,
    /// Recompute the auto-anchor now, ignoring the interval
    RefreshAutoAnchor,
    AutoAnchorFetched(Result<(Vec<Candle>, Vec<Candle>), FeedError>),
    Stats(oneshot::Sender<EngineStats>),
    Shutdown,
}

/// Cloneable front door to a running service
#[derive(Debug, Clone)]
pub struct ServiceHandle {
    tx: mpsc::Sender<Command>,
}

impl ServiceHandle {
    async fn send(&self, command: Command) -> Result<(), ServiceError> {
        self.tx.send(command).await.map_err(|_| ServiceError::Stopped)
    }

    pub async fn sample(&self, sample: Sample) -> Result<(), ServiceError> {
        self.send(Command::Sample(sample)).await
    }

    pub async fn set_anchor(&self, price: Option<f64>) -> Result<(), ServiceError> {
        self.send(Command::SetAnchor(price)).await
    }

    pub async fn clear_anchor(&self) -> Result<(), ServiceError> {
        self.send(Command::ClearAnchor).await
    }

    pub async fn flush(&self) -> Result<(), ServiceError> {
        self.send(Command::Flush).await
    }

    pub async fn refresh_auto_anchor(&self) -> Result<(), ServiceError> {
        self.send(Command::RefreshAutoAnchor).await
    }

    pub async fn reload(&self, settings: Settings) -> Result<(), ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Reload(Box::new(settings), reply)).await?;
        rx.await.map_err(|_| ServiceError::Stopped)??;
        Ok(())
    }

    pub async fn stats(&self) -> Result<EngineStats, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stats(reply)).await?;
        rx.await.map_err(|_| ServiceError::Stopped)
    }

    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        self.send(Command::Shutdown).await
    }
}

/// Forward every sample from `feed` until it ends. A feed error flushes the
/// pending alert and is returned. Returns the number of samples forwarded.
pub async fn pump<F: SampleFeed>(feed: &mut F, handle: &ServiceHandle) -> Result<usize, ServiceError> {
    let mut count = 0;
    loop {
        match feed.next_sample().await {
            Ok(Some(sample)) => {
                handle.sample(sample).await?;
                count += 1;
            }
            Ok(None) => return Ok(count),
            Err(e) => {
                warn!(error = %e, "Sample feed failed, flushing pending alert");
                handle.flush().await?;
                return Err(e.into());
            }
        }
    }
}

pub struct AlertService<C: CandleFeed, N: Notifier> {
    engine: AlertEngine,
    candles: Arc<C>,
    notifier: N,
    clock: Arc<dyn Clock>,
    breaker: FetchBreaker,
    rx: mpsc::Receiver<Command>,
    fetch_tx: mpsc::WeakSender<Command>,
    last_sample: Millis,
}

impl<C: CandleFeed, N: Notifier + 'static> AlertService<C, N> {
    pub fn new(engine: AlertEngine, candles: Arc<C>, notifier: N, clock: Arc<dyn Clock>) -> (Self, ServiceHandle) {
        Self::with_buffer(engine, candles, notifier, clock, DEFAULT_BUFFER)
    }

    pub fn with_buffer(
        engine: AlertEngine,
        candles: Arc<C>,
        notifier: N,
        clock: Arc<dyn Clock>,
        buffer: usize,
    ) -> (Self, ServiceHandle) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let breaker = FetchBreaker::new(BreakerConfig::from_auto_anchor(&engine.settings().auto_anchor));
        let service = Self {
            engine,
            candles,
            notifier,
            clock,
            breaker,
            rx,
            fetch_tx: tx.downgrade(),
            last_sample: 0,
        };
        (service, ServiceHandle { tx })
    }

    /// Engine time: the clock, never behind the last sample
    fn now(&self) -> Millis {
        self.clock.now().max(self.last_sample)
    }

    /// Run until `Shutdown` or until every handle is dropped
    pub async fn run(mut self) -> EngineStats {
        info!(instrument = %self.engine.settings().instrument, "🚀 Alert service started");

        while let Some(command) = self.rx.recv().await {
            match command {
                Command::Sample(sample) => {
                    self.last_sample = self.last_sample.max(sample.timestamp);
                    let alerts = self.engine.tick(sample);
                    self.deliver(alerts).await;
                    self.maybe_fetch_auto_anchor(false);
                }
                Command::SetAnchor(price) => {
                    let now = self.now();
                    if self.engine.set_anchor(price, now).is_none() {
                        warn!("No valid price yet, anchor not set");
                    }
                }
                Command::ClearAnchor => self.engine.clear_anchor(),
                Command::Reload(settings, reply) => {
                    let result = self.engine.reload(*settings);
                    if result.is_ok() {
                        self.breaker
                            .set_config(BreakerConfig::from_auto_anchor(&self.engine.settings().auto_anchor));
                    }
                    let _ = reply.send(result);
                }
                Command::Flush => {
                    let alerts = self.engine.flush_pending(self.now());
                    self.deliver(alerts).await;
                }
                Command::RefreshAutoAnchor => self.maybe_fetch_auto_anchor(true),
                Command::AutoAnchorFetched(result) => {
                    let now = self.now();
                    match &result {
                        Ok(_) => self.breaker.record_success(),
                        Err(_) => self.breaker.record_failure(now),
                    }
                    if let Some(outcome) = self.engine.complete_auto_anchor(now, result) {
                        info!(outcome = ?outcome, "Auto-anchor cycle finished");
                    }
                }
                Command::Stats(reply) => {
                    let _ = reply.send(self.engine.stats());
                }
                Command::Shutdown => break,
            }
        }

        let stats = self.engine.stats();
        info!(
            ticks = stats.ticks_processed,
            rejected = stats.ticks_rejected,
            alerts = stats.alerts_emitted,
            failed = stats.deliveries_failed,
            "Alert service stopped"
        );
        stats
    }

    async fn deliver(&mut self, alerts: Vec<Alert>) {
        for alert in alerts {
            let delivered = self
                .notifier
                .send(&alert.title, &alert.message, alert.color)
                .await;
            self.engine.report_delivery(alert.id, delivered);
        }
    }

    fn maybe_fetch_auto_anchor(&mut self, force: bool) {
        let now = self.now();
        if !self.engine.auto_anchor_due(now, force) {
            return;
        }
        if !self.breaker.can_attempt(now) {
            trace!("Auto-anchor fetch skipped, breaker open");
            return;
        }
        let Some(tx) = self.fetch_tx.upgrade() else {
            return;
        };
        let Some(request) = self.engine.begin_auto_anchor(now, force) else {
            return;
        };
        debug!(?request, "Spawning auto-anchor candle fetch");
        tokio::spawn(fetch_candles(Arc::clone(&self.candles), request, tx));
    }
}

async fn fetch_candles<C: CandleFeed>(feed: Arc<C>, request: AutoAnchorRequest, tx: mpsc::Sender<Command>) {
    let fetch = async {
        tokio::try_join!(
            feed.fetch_candles(CandleInterval::FourHours, request.candles_4h),
            feed.fetch_candles(CandleInterval::OneDay, request.candles_1d),
        )
    };
    let result = match tokio::time::timeout(Duration::from_millis(request.timeout_ms), fetch).await {
        Ok(result) => result,
        Err(_) => Err(FeedError::Timeout(request.timeout_ms)),
    };
    if tx.send(Command::AutoAnchorFetched(result)).await.is_err() {
        debug!("Service stopped before auto-anchor fetch finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::feed::{StaticCandleFeed, VecSampleFeed};
    use crate::notify::MemoryNotifier;
    use crate::SECOND_MS;

    fn service(settings: Settings) -> (AlertService<StaticCandleFeed, MemoryNotifier>, ServiceHandle, MemoryNotifier) {
        let notifier = MemoryNotifier::new();
        let (svc, handle) = AlertService::new(
            AlertEngine::new(settings),
            Arc::new(StaticCandleFeed::empty()),
            notifier.clone(),
            Arc::new(ManualClock::starting_at(0)),
        );
        (svc, handle, notifier)
    }

    #[tokio::test]
    async fn test_samples_flow_through_and_stop() {
        let (svc, handle, notifier) = service(Settings::default());
        let task = tokio::spawn(svc.run());

        handle.sample(Sample::new(100.0, 0)).await.unwrap();
        handle.set_anchor(Some(100.0)).await.unwrap();
        handle.sample(Sample::new(94.0, SECOND_MS)).await.unwrap();
        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.ticks_processed, 2);
        assert_eq!(stats.deliveries_ok, 1);

        handle.shutdown().await.unwrap();
        let final_stats = task.await.unwrap();
        assert_eq!(final_stats.alerts_emitted, 1);
        assert_eq!(notifier.sent().await.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_delivery_is_reported() {
        let (svc, handle, notifier) = service(Settings::default());
        notifier.set_failing(true).await;
        let task = tokio::spawn(svc.run());

        handle.sample(Sample::new(100.0, 0)).await.unwrap();
        handle.set_anchor(Some(100.0)).await.unwrap();
        handle.sample(Sample::new(94.0, SECOND_MS)).await.unwrap();
        handle.shutdown().await.unwrap();

        let stats = task.await.unwrap();
        assert_eq!(stats.deliveries_failed, 1);
        assert_eq!(stats.deliveries_ok, 0);
    }

    #[tokio::test]
    async fn test_reload_validates() {
        let (svc, handle, _) = service(Settings::default());
        let task = tokio::spawn(svc.run());

        let mut bad = Settings::default();
        bad.regime.compress_reset_pct = 0.1;
        assert!(matches!(
            handle.reload(bad).await,
            Err(ServiceError::Config(ConfigError::Inconsistent(_)))
        ));
        assert!(handle.reload(Settings::default()).await.is_ok());

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_pump_forwards_feed() {
        let (svc, handle, _) = service(Settings::default());
        let task = tokio::spawn(svc.run());

        let mut feed = VecSampleFeed::new((0..10).map(|i| Sample::new(100.0, i * SECOND_MS)));
        assert_eq!(pump(&mut feed, &handle).await.unwrap(), 10);

        handle.shutdown().await.unwrap();
        assert_eq!(task.await.unwrap().ticks_processed, 10);
    }

    #[tokio::test]
    async fn test_handle_reports_stopped_service() {
        let (svc, handle, _) = service(Settings::default());
        drop(svc);
        assert!(matches!(
            handle.sample(Sample::new(100.0, 0)).await,
            Err(ServiceError::Stopped)
        ));
    }
}

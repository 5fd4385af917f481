//! Feed service: the single writer over books and candles.
//!
//! Transport events are processed strictly one at a time in arrival order.
//! After each event the service publishes read copies of whatever changed
//! into [`AppState`].

use std::sync::atomic::Ordering;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, instrument, warn};

use crate::api::AppState;
use crate::candles::CandleAggregator;
use crate::channel::{
    ChannelEvent, ChannelKey, ChannelSubscriptionRegistry, ChannelUpdate, ControlMessage, Dispatch,
    HandlerId, RegistryConfig,
};
use crate::config::Config;
use crate::error::{ConfigError, FeedError, Result};
use crate::feed::FeedEvent;
use crate::metrics;

/// Owns the registry and the candle aggregator.
pub struct FeedService {
    registry: ChannelSubscriptionRegistry,
    aggregator: CandleAggregator,
    intervals: Vec<i64>,
    updates: UnboundedReceiver<ChannelEvent>,
    handlers: Vec<HandlerId>,
    state: AppState,
}

impl FeedService {
    /// Create a service tracking `channels`.
    ///
    /// Each channel gets one handler owned by the service; subscription
    /// control messages go to `control_tx`.
    pub fn new(
        channels: &[ChannelKey],
        intervals: Vec<i64>,
        registry_config: RegistryConfig,
        control_tx: UnboundedSender<ControlMessage>,
        state: AppState,
    ) -> Result<Self> {
        if intervals.is_empty() {
            return Err(ConfigError::NoIntervals.into());
        }
        if let Some(&bad) = intervals.iter().find(|&&i| i <= 0) {
            return Err(ConfigError::InvalidInterval(bad).into());
        }

        let mut registry = ChannelSubscriptionRegistry::new(registry_config, control_tx);
        let (updates_tx, updates) = mpsc::unbounded_channel();
        let handlers = channels
            .iter()
            .map(|channel| registry.subscribe(channel.clone(), updates_tx.clone()))
            .collect();

        Ok(Self {
            registry,
            aggregator: CandleAggregator::new(),
            intervals,
            updates,
            handlers,
            state,
        })
    }

    /// Create from validated configuration.
    pub fn from_config(
        config: &Config,
        control_tx: UnboundedSender<ControlMessage>,
        state: AppState,
    ) -> Result<Self> {
        config.validate()?;
        Self::new(
            &config.channel_keys()?,
            config.candle_intervals.clone(),
            config.registry_config(),
            control_tx,
            state,
        )
    }

    /// The channel registry.
    pub fn registry(&self) -> &ChannelSubscriptionRegistry {
        &self.registry
    }

    /// The candle aggregator.
    pub fn aggregator(&self) -> &CandleAggregator {
        &self.aggregator
    }

    /// Published state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Process events until the transport stops.
    pub async fn run(mut self, mut events: mpsc::Receiver<FeedEvent>) {
        info!(channels = self.registry.len(), intervals = ?self.intervals, "Feed service started");
        while let Some(event) = events.recv().await {
            self.handle_event(event);
        }
        self.shutdown();
        info!("Feed service stopped");
    }

    /// Apply one transport event.
    pub fn handle_event(&mut self, event: FeedEvent) {
        match event {
            FeedEvent::Connected => {
                info!("Feed connected, resubscribing");
                self.registry.resubscribe_all();
                self.state.books.clear();
                self.state.set_ready(true);
            }
            FeedEvent::Disconnected => {
                warn!("Feed disconnected");
                self.state.set_ready(false);
            }
            FeedEvent::Message(raw) => {
                self.handle_message(&raw);
            }
        }
    }

    /// Route one raw message and publish the results.
    #[instrument(skip_all)]
    pub fn handle_message(&mut self, raw: &str) -> Option<Dispatch> {
        let _timer = metrics::timer_dispatch();
        self.state.stats.messages_processed.fetch_add(1, Ordering::Relaxed);

        let outcome = match self.registry.dispatch(raw) {
            Ok(dispatch) => {
                self.apply(&dispatch);
                Some(dispatch)
            }
            Err(FeedError::Book { channel, source }) => {
                warn!(%channel, error = %source, "Book out of sync, resubscribing channel");
                self.state.stats.book_errors.fetch_add(1, Ordering::Relaxed);
                self.state.books.remove(&channel);
                if self.registry.resync(&channel) {
                    self.state.stats.resyncs.fetch_add(1, Ordering::Relaxed);
                }
                None
            }
            Err(e) => {
                warn!(error = %e, "Message rejected");
                self.state.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                None
            }
        };

        self.publish_updates();
        outcome
    }

    fn apply(&mut self, dispatch: &Dispatch) {
        match dispatch {
            Dispatch::Trade { tick, .. } => {
                if let Err(e) = self.aggregator.on_tick(tick, &self.intervals) {
                    warn!(error = %e, "Tick rejected");
                    return;
                }
                for &interval in &self.intervals {
                    if let Some(candle) = self.aggregator.latest(&tick.market_id, interval) {
                        self.state.candles.insert(candle.key(), candle.clone());
                    }
                }
            }
            Dispatch::Book { channel, report } if report.was_crossed() => {
                debug!(%channel, removed = report.bids_removed + report.asks_removed, "Book uncrossed");
            }
            Dispatch::Book { .. } => {}
            Dispatch::Ignored { .. }
            | Dispatch::Untracked { .. }
            | Dispatch::Dropped { .. }
            | Dispatch::AwaitingSnapshot { .. } => {
                self.state.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn publish_updates(&mut self) {
        while let Ok(event) = self.updates.try_recv() {
            match event.update {
                ChannelUpdate::Book(view) => {
                    self.state.books.insert(event.channel, view);
                }
                ChannelUpdate::Bar(bar) => {
                    self.state.daily_bars.insert(event.channel, bar);
                }
            }
        }
    }

    fn shutdown(&mut self) {
        for handler in self.handlers.drain(..) {
            self.registry.unsubscribe(handler);
        }
        self.state.set_ready(false);
    }
}

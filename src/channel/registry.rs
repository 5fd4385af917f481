//! Per-channel books, daily bars and handler lists.
//!
//! The registry owns one [`OrderBookSynchronizer`] per tracked channel and
//! routes every inbound payload to it. Handlers are plain unbounded senders;
//! a channel exists exactly as long as it has at least one handler.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, instrument, trace, warn};

use super::key::ChannelKey;
use super::messages::{BookContents, BookEnvelope, ControlMessage, InboundMessage, TradeMessage};
use crate::candles::{open_time, Candle, PriceTick, DAY_SECONDS};
use crate::error::{BookError, FeedError, MessageError};
use crate::metrics;
use crate::orderbook::{BookView, OrderBookSynchronizer, ResolutionReport, DEFAULT_DEPTH_CAP};

/// Default number of levels per side published to handlers.
pub const DEFAULT_VIEW_DEPTH: usize = 10;

/// Registry settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Levels retained per side in each book.
    pub depth_cap: usize,
    /// Levels per side in published views.
    pub view_depth: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            depth_cap: DEFAULT_DEPTH_CAP,
            view_depth: DEFAULT_VIEW_DEPTH,
        }
    }
}

/// Opaque handle returned by [`ChannelSubscriptionRegistry::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HandlerId(u64);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler-{}", self.0)
    }
}

/// Derived value pushed to handlers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ChannelUpdate {
    /// Book after the latest applied message.
    Book(BookView),
    /// Current daily bar after the latest trade.
    Bar(Candle),
}

/// Update delivered to one handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelEvent {
    /// Channel the update belongs to.
    pub channel: ChannelKey,
    /// The update.
    pub update: ChannelUpdate,
}

/// What [`ChannelSubscriptionRegistry::dispatch`] did with a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Trade folded into the channel's daily bar.
    Trade {
        /// Channel traded on.
        channel: ChannelKey,
        /// The trade as a candle tick.
        tick: PriceTick,
    },
    /// Book snapshot or diff batch applied.
    Book {
        /// Channel updated.
        channel: ChannelKey,
        /// Crossed-book resolution outcome.
        report: ResolutionReport,
    },
    /// Event type not consumed here.
    Ignored {
        /// The event-type tag.
        event_type: u32,
    },
    /// Diff batch discarded while the channel waits for its resync snapshot.
    AwaitingSnapshot {
        /// Channel being resynced.
        channel: ChannelKey,
    },
    /// Well-formed message for a channel with no handlers.
    Untracked {
        /// Channel named by the message.
        channel: ChannelKey,
    },
    /// Malformed payload, logged and discarded.
    Dropped {
        /// Why decoding failed.
        reason: MessageError,
    },
}

#[derive(Debug)]
struct Handler {
    id: HandlerId,
    sender: UnboundedSender<ChannelEvent>,
}

#[derive(Debug)]
struct ChannelState {
    book: OrderBookSynchronizer,
    last_bar: Option<Candle>,
    last_book: Option<BookView>,
    handlers: Vec<Handler>,
    /// Set by a resync, cleared by the next applied snapshot.
    resync_pending: bool,
}

impl ChannelState {
    fn new(depth_cap: usize) -> Self {
        Self {
            book: OrderBookSynchronizer::new(depth_cap),
            last_bar: None,
            last_book: None,
            handlers: Vec::new(),
            resync_pending: false,
        }
    }

    fn reset_book(&mut self) {
        self.book.reset();
        self.last_book = None;
        self.resync_pending = false;
    }

    /// Fold a validated tick into the daily bar. A newer day starts a new bar.
    fn fold_trade(&mut self, tick: &PriceTick) -> Candle {
        let day = open_time(tick.timestamp_seconds, DAY_SECONDS);
        match self.last_bar.as_mut() {
            Some(bar) if day <= bar.open_time_seconds => {
                bar.update(tick.price);
                bar.clone()
            }
            _ => {
                let bar = Candle::open_with(tick, DAY_SECONDS, day);
                self.last_bar = Some(bar.clone());
                bar
            }
        }
    }
}

/// Maps channel keys to books and interested handlers.
///
/// Subscription changes are reported through `control_tx` as `SubAdd` /
/// `SubRemove` messages for the transport to forward.
#[derive(Debug)]
pub struct ChannelSubscriptionRegistry {
    config: RegistryConfig,
    channels: BTreeMap<ChannelKey, ChannelState>,
    control_tx: UnboundedSender<ControlMessage>,
    next_handler_id: u64,
    next_seq: u64,
}

impl ChannelSubscriptionRegistry {
    /// Create an empty registry.
    pub fn new(config: RegistryConfig, control_tx: UnboundedSender<ControlMessage>) -> Self {
        Self {
            config,
            channels: BTreeMap::new(),
            control_tx,
            next_handler_id: 0,
            next_seq: 0,
        }
    }

    /// Registry settings.
    pub fn config(&self) -> RegistryConfig {
        self.config
    }

    /// Register a handler for `channel`.
    ///
    /// The first handler on a channel creates its book and emits `SubAdd`.
    /// Later handlers immediately receive the cached daily bar and book view,
    /// when there are any.
    pub fn subscribe(&mut self, channel: ChannelKey, sender: UnboundedSender<ChannelEvent>) -> HandlerId {
        self.next_handler_id += 1;
        let id = HandlerId(self.next_handler_id);

        if !self.channels.contains_key(&channel) {
            info!(%channel, "Subscribing to channel");
            self.channels
                .insert(channel.clone(), ChannelState::new(self.config.depth_cap));
            self.send_control(ControlMessage::subscribe([&channel]));
        }

        if let Some(state) = self.channels.get_mut(&channel) {
            let cached = state
                .last_bar
                .clone()
                .map(ChannelUpdate::Bar)
                .into_iter()
                .chain(state.last_book.clone().map(ChannelUpdate::Book));
            let delivered = cached.into_iter().all(|update| {
                sender
                    .send(ChannelEvent {
                        channel: channel.clone(),
                        update,
                    })
                    .is_ok()
            });
            if delivered {
                state.handlers.push(Handler { id, sender });
                debug!(%channel, handler = %id, handlers = state.handlers.len(), "Handler added");
            } else {
                debug!(%channel, handler = %id, "Handler closed before cached state delivery");
            }
        }

        metrics::set_tracked_channels(self.channels.len());
        id
    }

    /// Remove a handler. Returns `false` if it was not registered.
    ///
    /// Removing the last handler of a channel emits `SubRemove` and drops the
    /// channel's book and bar.
    pub fn unsubscribe(&mut self, handler_id: HandlerId) -> bool {
        let found = self.channels.iter_mut().find_map(|(channel, state)| {
            let pos = state.handlers.iter().position(|h| h.id == handler_id)?;
            state.handlers.remove(pos);
            Some((channel.clone(), state.handlers.is_empty()))
        });

        match found {
            Some((channel, now_empty)) => {
                debug!(%channel, handler = %handler_id, "Handler removed");
                if now_empty {
                    self.teardown(&channel);
                }
                true
            }
            None => false,
        }
    }

    /// Route one raw transport payload.
    ///
    /// Malformed payloads never touch channel state and come back as
    /// [`Dispatch::Dropped`]. Book errors are returned as
    /// [`FeedError::Book`]; a stalled crossed-book resolution also discards
    /// the channel's book so it waits for a fresh snapshot. Diffs arriving
    /// while a resync is pending are discarded as
    /// [`Dispatch::AwaitingSnapshot`].
    #[instrument(skip_all)]
    pub fn dispatch(&mut self, raw: &str) -> Result<Dispatch, FeedError> {
        metrics::inc_messages_received();

        let message = match InboundMessage::parse(raw) {
            Ok(message) => message,
            Err(reason) => {
                warn!(error = %reason, "Dropping malformed message");
                metrics::inc_messages_dropped("malformed");
                return Ok(Dispatch::Dropped { reason });
            }
        };

        match message {
            InboundMessage::Ignored { event_type } => {
                trace!(event_type, "Ignoring event type");
                metrics::inc_messages_dropped("ignored");
                Ok(Dispatch::Ignored { event_type })
            }
            InboundMessage::Trade(trade) => self.dispatch_trade(trade),
            InboundMessage::Book(envelope) => self.dispatch_book(envelope),
        }
    }

    fn dispatch_trade(&mut self, trade: TradeMessage) -> Result<Dispatch, FeedError> {
        let channel = trade.channel.clone();
        let Some(state) = self.channels.get_mut(&channel) else {
            return Ok(self.untracked(channel));
        };

        let tick = trade.to_tick();
        tick.validate()?;
        let bar = state.fold_trade(&tick);
        trace!(%channel, price = %tick.price, ts = tick.timestamp_seconds, "Trade applied");

        self.notify(&channel, ChannelUpdate::Bar(bar));
        Ok(Dispatch::Trade { channel, tick })
    }

    fn dispatch_book(&mut self, envelope: BookEnvelope) -> Result<Dispatch, FeedError> {
        let channel = envelope.channel.clone();
        let Some(state) = self.channels.get_mut(&channel) else {
            return Ok(self.untracked(channel));
        };

        if state.resync_pending && matches!(envelope.contents, BookContents::Diffs(_)) {
            trace!(%channel, "Discarding diff while awaiting resync snapshot");
            metrics::inc_messages_dropped("awaiting_snapshot");
            return Ok(Dispatch::AwaitingSnapshot { channel });
        }

        self.next_seq += 1;
        let seq = self.next_seq;
        trace!(%channel, seq, message_id = ?envelope.message_id, "Applying book message");

        let applied = match &envelope.contents {
            BookContents::Snapshot(snapshot) => state.book.apply_snapshot(&snapshot.bids, &snapshot.asks, seq),
            BookContents::Diffs(_) => state.book.apply_batch(&envelope.diff_updates(), seq),
        };

        let report = match applied {
            Ok(report) => report,
            Err(source) => return Err(self.reject_book(channel, seq, source)),
        };

        state.resync_pending = false;
        let view = state.book.top_of_book(self.config.view_depth);
        state.last_book = Some(view.clone());
        metrics::inc_book_updates();

        self.notify(&channel, ChannelUpdate::Book(view));
        Ok(Dispatch::Book { channel, report })
    }

    /// Record a rejected book message.
    ///
    /// A stalled resolution leaves the book unusable, so it is reset.
    fn reject_book(&mut self, channel: ChannelKey, seq: u64, source: BookError) -> FeedError {
        if let Some(state) = self.channels.get_mut(&channel) {
            if matches!(source, BookError::CrossedBookResolutionStalled { .. }) {
                state.reset_book();
            }
        }
        warn!(%channel, seq, error = %source, "Book update rejected");
        metrics::inc_book_errors();
        FeedError::Book { channel, source }
    }

    /// Drop a channel's book and request a fresh snapshot.
    ///
    /// Returns `false` for untracked channels and when a resync is already
    /// waiting for its snapshot.
    pub fn resync(&mut self, channel: &ChannelKey) -> bool {
        let Some(state) = self.channels.get_mut(channel) else {
            return false;
        };
        if state.resync_pending {
            debug!(%channel, "Resync already pending");
            return false;
        }
        state.reset_book();
        state.resync_pending = true;
        info!(%channel, "Resyncing channel");
        metrics::inc_resyncs();

        self.send_control(ControlMessage::unsubscribe([channel]));
        self.send_control(ControlMessage::subscribe([channel]));
        true
    }

    /// Reset every book and resubscribe all tracked channels in one message.
    ///
    /// Used after the transport reconnects; daily bars are kept.
    pub fn resubscribe_all(&mut self) {
        if self.channels.is_empty() {
            return;
        }
        for state in self.channels.values_mut() {
            state.reset_book();
        }
        info!(channels = self.channels.len(), "Resubscribing all channels");
        let message = ControlMessage::subscribe(self.channels.keys());
        self.send_control(message);
    }

    /// Current view of a synced book.
    pub fn book(&self, channel: &ChannelKey) -> Option<BookView> {
        let state = self.channels.get(channel)?;
        state
            .book
            .is_synced()
            .then(|| state.book.top_of_book(self.config.view_depth))
    }

    /// Whether `channel` is waiting for a resync snapshot.
    pub fn is_resyncing(&self, channel: &ChannelKey) -> bool {
        self.channels.get(channel).is_some_and(|s| s.resync_pending)
    }

    /// Underlying synchronizer of a tracked channel.
    pub fn synchronizer(&self, channel: &ChannelKey) -> Option<&OrderBookSynchronizer> {
        self.channels.get(channel).map(|s| &s.book)
    }

    /// Current daily bar of a tracked channel.
    pub fn daily_bar(&self, channel: &ChannelKey) -> Option<&Candle> {
        self.channels.get(channel)?.last_bar.as_ref()
    }

    /// Tracked channels in key order.
    pub fn channels(&self) -> Vec<ChannelKey> {
        self.channels.keys().cloned().collect()
    }

    /// Handlers registered on `channel`.
    pub fn handler_count(&self, channel: &ChannelKey) -> usize {
        self.channels.get(channel).map_or(0, |s| s.handlers.len())
    }

    /// Number of tracked channels.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Whether no channel is tracked.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    fn untracked(&self, channel: ChannelKey) -> Dispatch {
        trace!(%channel, "Message for untracked channel");
        metrics::inc_messages_dropped("untracked");
        Dispatch::Untracked { channel }
    }

    /// Push an update to every handler, pruning closed ones.
    fn notify(&mut self, channel: &ChannelKey, update: ChannelUpdate) {
        let Some(state) = self.channels.get_mut(channel) else {
            return;
        };

        let before = state.handlers.len();
        state.handlers.retain(|handler| {
            handler
                .sender
                .send(ChannelEvent {
                    channel: channel.clone(),
                    update: update.clone(),
                })
                .is_ok()
        });

        let pruned = before - state.handlers.len();
        if pruned > 0 {
            debug!(%channel, pruned, "Pruned closed handlers");
        }
        if state.handlers.is_empty() {
            self.teardown(channel);
        }
    }

    fn teardown(&mut self, channel: &ChannelKey) {
        if self.channels.remove(channel).is_some() {
            info!(%channel, "Unsubscribing from channel");
            self.send_control(ControlMessage::unsubscribe([channel]));
            metrics::set_tracked_channels(self.channels.len());
        }
    }

    fn send_control(&self, message: ControlMessage) {
        if self.control_tx.send(message).is_err() {
            warn!("Control channel closed, subscription change not forwarded");
        }
    }
}

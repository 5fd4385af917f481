//! Channel subscriptions and wire messages.
//!
//! This module handles:
//! - Channel keys (`0~exchange~base~quote`)
//! - Decoding inbound trade and order-book messages, encoding control messages
//! - The registry that routes messages to per-channel books and handlers

pub mod key;
pub mod messages;
pub mod registry;

pub use key::{ChannelKey, TRADE_EVENT_TYPE};
pub use messages::{
    BookContents, BookEnvelope, BookSnapshot, ControlAction, ControlMessage, DiffEntry, InboundMessage,
    TradeMessage,
};
pub use registry::{
    ChannelEvent, ChannelSubscriptionRegistry, ChannelUpdate, Dispatch, HandlerId, RegistryConfig,
    DEFAULT_VIEW_DEPTH,
};

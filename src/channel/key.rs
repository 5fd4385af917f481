//! Channel key: the subscription identifier on the wire and the registry map key.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MessageError;

/// Event-type tag of the trade / order-book message class.
pub const TRADE_EVENT_TYPE: u32 = 0;

/// Stable channel identifier, formatted `{event_type}~{exchange}~{base}~{quote}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelKey {
    /// Message class tag; `0` for trades and order books.
    pub event_type: u32,
    /// Exchange name, e.g. `Coinbase`.
    pub exchange: String,
    /// Base symbol, e.g. `BTC`.
    pub base: String,
    /// Quote symbol, e.g. `USD`.
    pub quote: String,
}

impl ChannelKey {
    /// Create a trade / order-book channel key.
    pub fn new(exchange: impl Into<String>, base: impl Into<String>, quote: impl Into<String>) -> Self {
        Self {
            event_type: TRADE_EVENT_TYPE,
            exchange: exchange.into(),
            base: base.into(),
            quote: quote.into(),
        }
    }

    /// Market id used for candles, e.g. `BTC-USD`.
    pub fn market_id(&self) -> String {
        format!("{}-{}", self.base, self.quote)
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}~{}~{}~{}", self.event_type, self.exchange, self.base, self.quote)
    }
}

impl FromStr for ChannelKey {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('~').collect();
        match parts.as_slice() {
            [event_type, exchange, base, quote]
                if !exchange.is_empty() && !base.is_empty() && !quote.is_empty() =>
            {
                let event_type = event_type
                    .parse()
                    .map_err(|_| MessageError::InvalidChannel(s.to_string()))?;
                Ok(Self {
                    event_type,
                    exchange: exchange.to_string(),
                    base: base.to_string(),
                    quote: quote.to_string(),
                })
            }
            _ => Err(MessageError::InvalidChannel(s.to_string())),
        }
    }
}

impl TryFrom<String> for ChannelKey {
    type Error = MessageError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ChannelKey> for String {
    fn from(key: ChannelKey) -> Self {
        key.to_string()
    }
}

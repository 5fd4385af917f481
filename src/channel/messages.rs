//! Wire messages exchanged with the streaming transport.
//!
//! Inbound payloads come in two shapes: tilde-delimited positional trade
//! strings, and JSON book envelopes whose `contents` is either a snapshot
//! object or an array of diff entries.

use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::key::{ChannelKey, TRADE_EVENT_TYPE};
use crate::candles::PriceTick;
use crate::error::MessageError;
use crate::orderbook::{LevelUpdate, Side};

const TRADE_TIME_FIELD: usize = 6;
const TRADE_PRICE_FIELD: usize = 8;

/// A trade print on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeMessage {
    /// Channel derived from the exchange and symbol fields.
    pub channel: ChannelKey,
    /// Trade time in Unix seconds.
    pub trade_time_seconds: i64,
    /// Trade price.
    pub price: Decimal,
}

impl TradeMessage {
    /// Build from the fields of `0~exchange~from~to~?~?~tradeTime~?~tradePrice`.
    fn from_fields(fields: &[&str]) -> Result<Self, MessageError> {
        if fields.len() <= TRADE_PRICE_FIELD {
            return Err(MessageError::MissingFields {
                found: fields.len(),
                expected: TRADE_PRICE_FIELD + 1,
            });
        }

        let channel = ChannelKey {
            event_type: TRADE_EVENT_TYPE,
            exchange: fields[1].to_string(),
            base: fields[2].to_string(),
            quote: fields[3].to_string(),
        };
        if channel.exchange.is_empty() || channel.base.is_empty() || channel.quote.is_empty() {
            return Err(MessageError::InvalidChannel(fields[..4].join("~")));
        }

        let trade_time_seconds = parse_field(fields, TRADE_TIME_FIELD, "trade_time")?;
        let price = parse_decimal(fields[TRADE_PRICE_FIELD], "trade_price")?;

        Ok(Self {
            channel,
            trade_time_seconds,
            price,
        })
    }

    /// The trade as a candle tick for the channel's market.
    pub fn to_tick(&self) -> PriceTick {
        PriceTick::new(self.channel.market_id(), self.price, self.trade_time_seconds)
    }
}

fn parse_field<T: FromStr>(
    fields: &[&str],
    index: usize,
    field: &'static str,
) -> Result<T, MessageError> {
    let raw = fields.get(index).ok_or(MessageError::MissingFields {
        found: fields.len(),
        expected: index + 1,
    })?;
    raw.trim().parse().map_err(|_| MessageError::InvalidField {
        field,
        value: raw.to_string(),
    })
}

fn parse_decimal(raw: &str, field: &'static str) -> Result<Decimal, MessageError> {
    let raw = raw.trim();
    Decimal::from_str(raw)
        .or_else(|_| Decimal::from_scientific(raw))
        .map_err(|_| MessageError::InvalidField {
            field,
            value: raw.to_string(),
        })
}

/// Full book snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookSnapshot {
    /// Bid levels, any order.
    #[serde(default)]
    pub bids: Vec<LevelUpdate>,
    /// Ask levels, any order.
    #[serde(default)]
    pub asks: Vec<LevelUpdate>,
}

/// `[price, size]` pairs on one side of a diff entry.
///
/// Feeds send either a single flattened pair or a list of pairs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LevelPairs {
    /// One `[price, size]` pair.
    One([Decimal; 2]),
    /// Several `[price, size]` pairs.
    Many(Vec<[Decimal; 2]>),
}

impl LevelPairs {
    fn levels(&self) -> Vec<LevelUpdate> {
        match self {
            LevelPairs::One([price, size]) => vec![LevelUpdate::new(*price, *size)],
            LevelPairs::Many(pairs) => pairs
                .iter()
                .map(|[price, size]| LevelUpdate::new(*price, *size))
                .collect(),
        }
    }
}

/// One entry of a diff batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffEntry {
    /// Bid-side changes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bids: Option<LevelPairs>,
    /// Ask-side changes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asks: Option<LevelPairs>,
}

impl DiffEntry {
    /// Level updates in application order: bids, then asks.
    pub fn updates(&self) -> Vec<(Side, LevelUpdate)> {
        let bids = self.bids.iter().flat_map(|p| p.levels()).map(|l| (Side::Bid, l));
        let asks = self.asks.iter().flat_map(|p| p.levels()).map(|l| (Side::Ask, l));
        bids.chain(asks).collect()
    }
}

/// Book payload: an array is a diff batch, an object is a snapshot.
///
/// `Diffs` is tried first so that an empty array stays an empty batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BookContents {
    /// Incremental changes sharing one message.
    Diffs(Vec<DiffEntry>),
    /// Initial state.
    Snapshot(BookSnapshot),
}

/// JSON book message addressed to a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookEnvelope {
    /// Target channel.
    pub channel: ChannelKey,
    /// Transport message id, informational.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<u64>,
    /// Snapshot or diffs.
    pub contents: BookContents,
}

impl BookEnvelope {
    /// All diff updates flattened in message order; empty for snapshots.
    pub fn diff_updates(&self) -> Vec<(Side, LevelUpdate)> {
        match &self.contents {
            BookContents::Snapshot(_) => Vec::new(),
            BookContents::Diffs(entries) => entries.iter().flat_map(DiffEntry::updates).collect(),
        }
    }
}

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    /// Trade print.
    Trade(TradeMessage),
    /// Book snapshot or diffs.
    Book(BookEnvelope),
    /// Well-formed message of an event type this core does not consume.
    Ignored {
        /// The event-type tag.
        event_type: u32,
    },
}

impl InboundMessage {
    /// Decode a raw transport payload.
    pub fn parse(raw: &str) -> Result<Self, MessageError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(MessageError::Empty);
        }

        if raw.starts_with('{') {
            let envelope: BookEnvelope =
                serde_json::from_str(raw).map_err(|e| MessageError::Json(e.to_string()))?;
            return Ok(InboundMessage::Book(envelope));
        }

        let fields: Vec<&str> = raw.split('~').collect();
        let event_type: u32 = parse_field(&fields, 0, "event_type")?;
        if event_type != TRADE_EVENT_TYPE {
            return Ok(InboundMessage::Ignored { event_type });
        }
        TradeMessage::from_fields(&fields).map(InboundMessage::Trade)
    }

    /// Channel this message is addressed to, if any.
    pub fn channel(&self) -> Option<&ChannelKey> {
        match self {
            InboundMessage::Trade(trade) => Some(&trade.channel),
            InboundMessage::Book(envelope) => Some(&envelope.channel),
            InboundMessage::Ignored { .. } => None,
        }
    }
}

/// Subscription control action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
pub enum ControlAction {
    /// Start streaming the listed channels.
    SubAdd,
    /// Stop streaming the listed channels.
    SubRemove,
}

/// Outbound subscription control message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    /// Subscribe or unsubscribe.
    pub action: ControlAction,
    /// Channel keys.
    pub subs: Vec<String>,
}

impl ControlMessage {
    /// `SubAdd` for the given channels.
    pub fn subscribe<'a>(channels: impl IntoIterator<Item = &'a ChannelKey>) -> Self {
        Self {
            action: ControlAction::SubAdd,
            subs: channels.into_iter().map(ToString::to_string).collect(),
        }
    }

    /// `SubRemove` for the given channels.
    pub fn unsubscribe<'a>(channels: impl IntoIterator<Item = &'a ChannelKey>) -> Self {
        Self {
            action: ControlAction::SubRemove,
            subs: channels.into_iter().map(ToString::to_string).collect(),
        }
    }

    /// JSON text frame.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;

    #[test]
    fn parses_trade_fields_by_position() {
        let raw = "0~Coinbase~BTC~USD~2~123~1700000000~0.5~43210.5~21605.25~1f";
        let msg = InboundMessage::parse(raw).unwrap();

        let InboundMessage::Trade(trade) = msg else {
            panic!("expected trade, got {msg:?}");
        };
        assert_eq!(trade.channel, ChannelKey::new("Coinbase", "BTC", "USD"));
        assert_eq!(trade.trade_time_seconds, 1_700_000_000);
        assert_eq!(trade.price, dec!(43210.5));
        assert_eq!(trade.to_tick(), PriceTick::new("BTC-USD", dec!(43210.5), 1_700_000_000));
    }

    #[test]
    fn non_trade_event_types_are_ignored() {
        assert_eq!(
            InboundMessage::parse("5~CCCAGG~BTC~USD~4").unwrap(),
            InboundMessage::Ignored { event_type: 5 }
        );
    }

    #[test]
    fn malformed_trades_are_typed_errors() {
        assert!(matches!(
            InboundMessage::parse("0~Coinbase~BTC~USD~2"),
            Err(MessageError::MissingFields { found: 5, expected: 9 })
        ));
        assert!(matches!(
            InboundMessage::parse("0~Coinbase~BTC~USD~2~1~soon~0~1"),
            Err(MessageError::InvalidField { field: "trade_time", .. })
        ));
        assert!(matches!(
            InboundMessage::parse("0~Coinbase~BTC~USD~2~1~100~0~NaN"),
            Err(MessageError::InvalidField { field: "trade_price", .. })
        ));
        assert!(matches!(InboundMessage::parse("hello"), Err(MessageError::InvalidField { .. })));
        assert_eq!(InboundMessage::parse("   "), Err(MessageError::Empty));
    }

    #[test]
    fn parses_book_snapshot() {
        let raw = r#"{"channel":"0~Coinbase~BTC~USD","message_id":1,
            "contents":{"bids":[{"price":"100","size":"5"}],"asks":[{"price":101,"size":5}]}}"#;

        let InboundMessage::Book(envelope) = InboundMessage::parse(raw).unwrap() else {
            panic!("expected book message");
        };
        assert_eq!(envelope.message_id, Some(1));
        assert_eq!(
            envelope.contents,
            BookContents::Snapshot(BookSnapshot {
                bids: vec![LevelUpdate::new(dec!(100), dec!(5))],
                asks: vec![LevelUpdate::new(dec!(101), dec!(5))],
            })
        );
        assert!(envelope.diff_updates().is_empty());
    }

    #[test]
    fn parses_diff_batch_in_both_pair_shapes() {
        let raw = r#"{"channel":"0~Coinbase~BTC~USD","contents":[
            {"bids":[["101","3"]]},
            {"asks":["102","0"]},
            {"bids":["99","1"],"asks":[["103","2"],["104","1"]]}
        ]}"#;

        let InboundMessage::Book(envelope) = InboundMessage::parse(raw).unwrap() else {
            panic!("expected book message");
        };
        assert_eq!(
            envelope.diff_updates(),
            vec![
                (Side::Bid, LevelUpdate::new(dec!(101), dec!(3))),
                (Side::Ask, LevelUpdate::new(dec!(102), dec!(0))),
                (Side::Bid, LevelUpdate::new(dec!(99), dec!(1))),
                (Side::Ask, LevelUpdate::new(dec!(103), dec!(2))),
                (Side::Ask, LevelUpdate::new(dec!(104), dec!(1))),
            ]
        );
    }

    #[test]
    fn empty_diff_batch_is_not_a_snapshot() {
        let raw = r#"{"channel":"0~Coinbase~BTC~USD","contents":[]}"#;
        let InboundMessage::Book(envelope) = InboundMessage::parse(raw).unwrap() else {
            panic!("expected book message");
        };
        assert_eq!(envelope.contents, BookContents::Diffs(Vec::new()));
    }

    #[test]
    fn malformed_json_is_a_typed_error() {
        assert!(matches!(
            InboundMessage::parse(r#"{"channel":"0~Coinbase~BTC~USD","contents":[1,2]}"#),
            Err(MessageError::Json(_))
        ));
        assert!(matches!(
            InboundMessage::parse(r#"{"channel":"bogus","contents":{}}"#),
            Err(MessageError::Json(_))
        ));
        assert!(matches!(InboundMessage::parse("{not json"), Err(MessageError::Json(_))));
    }

    #[test]
    fn control_message_wire_format() {
        let key = ChannelKey::new("Coinbase", "BTC", "USD");
        let json = ControlMessage::subscribe([&key]).to_json().unwrap();
        assert_eq!(json, r#"{"action":"SubAdd","subs":["0~Coinbase~BTC~USD"]}"#);

        let json = ControlMessage::unsubscribe([&key]).to_json().unwrap();
        assert_eq!(json, r#"{"action":"SubRemove","subs":["0~Coinbase~BTC~USD"]}"#);
    }
}

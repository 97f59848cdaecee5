//! Event kinds, payload layouts and the binary record codec.
//!
//! On-disk record format (little-endian):
//!
//! ```text
//! [4 bytes: record_length][1 byte: kind][8 bytes: sequence]
//! [4 bytes: instrument_id][8 bytes: timestamp_ns][N bytes: payload]
//! [4 bytes: CRC32]
//! ```
//!
//! - `record_length` counts every byte after itself (kind + header fields
//!   + payload + CRC).
//! - CRC32 covers `kind ‖ sequence ‖ instrument_id ‖ timestamp_ns ‖
//!   payload` (everything between the length field and the CRC).
//!
//! Payloads are fixed binary structures per kind; no floating point is
//! ever written to the log.

use crate::calc::{InstrumentId, OrderId, Price, Quantity, SequenceId, TimestampNs, UserId};
use crate::engine::types::{OrderKind, Side};
use crate::wal::error::WalError;

/// Fixed bytes before the payload: length(4) + kind(1) + sequence(8) +
/// instrument(4) + timestamp(8).
pub const RECORD_HEADER_SIZE: usize = 4 + 1 + 8 + 4 + 8;

/// CRC32 trailer size.
pub const RECORD_CRC_SIZE: usize = 4;

/// Total framing overhead per record.
pub const RECORD_OVERHEAD: usize = RECORD_HEADER_SIZE + RECORD_CRC_SIZE;

/// Discriminants of the event kinds as stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventKind {
    /// An order was admitted (the durability commit point).
    OrderPlaced = 1,
    /// A maker/taker pair executed at a price and quantity.
    OrderMatched = 2,
    /// An order left the book with remainder outstanding.
    OrderCancelled = 3,
    /// An admitted order was refused by the matching engine.
    OrderRejected = 4,
    /// Full trade record for downstream consumers.
    TradeExecuted = 5,
    /// One holder's funding settlement.
    FundingSettled = 6,
    /// A position was forcibly reduced.
    Liquidated = 7,
    /// A balance changed outside margin bookkeeping.
    BalanceUpdated = 8,
}

impl EventKind {
    /// Decode from the on-disk discriminant.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<EventKind> {
        match value {
            1 => Some(EventKind::OrderPlaced),
            2 => Some(EventKind::OrderMatched),
            3 => Some(EventKind::OrderCancelled),
            4 => Some(EventKind::OrderRejected),
            5 => Some(EventKind::TradeExecuted),
            6 => Some(EventKind::FundingSettled),
            7 => Some(EventKind::Liquidated),
            8 => Some(EventKind::BalanceUpdated),
            _ => None,
        }
    }
}

/// Coarse rejection reason carried by `OrderRejected` records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RejectCode {
    /// Structural validation failed (tick, step, range, shape).
    InvalidOrder = 1,
    /// Available balance below the required margin.
    InsufficientMargin = 2,
    /// The would-be net position exceeds the limit.
    PositionLimit = 3,
    /// Post-only order would have crossed.
    PostOnlyWouldCross = 4,
    /// Fill-or-kill could not be fully satisfied.
    FokUnfillable = 5,
}

impl RejectCode {
    /// Decode from the on-disk discriminant.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<RejectCode> {
        match value {
            1 => Some(RejectCode::InvalidOrder),
            2 => Some(RejectCode::InsufficientMargin),
            3 => Some(RejectCode::PositionLimit),
            4 => Some(RejectCode::PostOnlyWouldCross),
            5 => Some(RejectCode::FokUnfillable),
            _ => None,
        }
    }
}

/// Why a balance changed, carried by `BalanceUpdated` records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BalanceReason {
    /// Administrative deposit.
    Deposit = 1,
    /// Administrative withdrawal.
    Withdrawal = 2,
    /// Realized PnL from a reducing fill.
    TradePnl = 3,
}

impl BalanceReason {
    /// Decode from the on-disk discriminant.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<BalanceReason> {
        match value {
            1 => Some(BalanceReason::Deposit),
            2 => Some(BalanceReason::Withdrawal),
            3 => Some(BalanceReason::TradePnl),
            _ => None,
        }
    }
}

/// Typed payload of one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload {
    /// An order was admitted.
    OrderPlaced {
        /// The admitted order.
        order_id: OrderId,
        /// Caller-supplied idempotency id.
        client_order_id: uuid::Uuid,
        /// Its owner.
        user_id: UserId,
        /// Buy or sell.
        side: Side,
        /// Execution policy.
        kind: OrderKind,
        /// Limit price (zero for market orders).
        price: Price,
        /// Total quantity.
        quantity: Quantity,
        /// Price basis used for margin arithmetic; replay recomputes the
        /// freeze from this.
        margin_basis: Price,
        /// Liquidation takers carry no margin freeze.
        is_liquidation: bool,
    },
    /// A maker/taker pair executed.
    OrderMatched {
        /// The aggressing order.
        taker_order_id: OrderId,
        /// The resting order.
        maker_order_id: OrderId,
        /// Execution price (the maker's).
        price: Price,
        /// Executed quantity.
        quantity: Quantity,
        /// Taker remainder after this fill.
        taker_remaining: Quantity,
        /// Maker remainder after this fill.
        maker_remaining: Quantity,
    },
    /// An order was cancelled.
    OrderCancelled {
        /// The cancelled order.
        order_id: OrderId,
        /// Its owner.
        user_id: UserId,
        /// Quantity left unexecuted at cancellation.
        remaining: Quantity,
    },
    /// An admitted order was refused.
    OrderRejected {
        /// The refused order.
        order_id: OrderId,
        /// Its owner.
        user_id: UserId,
        /// Why it was refused.
        reason: RejectCode,
    },
    /// Full trade record.
    TradeExecuted {
        /// Engine-assigned trade sequence.
        trade_sequence: u64,
        /// Buy-side order.
        buy_order_id: OrderId,
        /// Sell-side order.
        sell_order_id: OrderId,
        /// Buy-side owner.
        buy_user_id: UserId,
        /// Sell-side owner.
        sell_user_id: UserId,
        /// Execution price.
        price: Price,
        /// Executed quantity.
        quantity: Quantity,
        /// Whether the aggressing side was the buyer.
        is_taker_buy: bool,
    },
    /// One holder's funding settlement.
    FundingSettled {
        /// The settled holder.
        user_id: UserId,
        /// Signed position size at settlement.
        position: Quantity,
        /// Mark price used.
        mark_price: Price,
        /// Funding rate applied, in basis points.
        rate_bps: i64,
        /// Payment owed by the holder (negative = received).
        payment: i64,
    },
    /// A position was forcibly reduced.
    Liquidated {
        /// The liquidated holder.
        user_id: UserId,
        /// Quantity liquidated.
        quantity: Quantity,
        /// Mark price that triggered the liquidation.
        mark_price: Price,
        /// Amount drawn from the insurance fund.
        insurance_draw: i64,
    },
    /// A balance changed outside margin bookkeeping.
    BalanceUpdated {
        /// The affected user.
        user_id: UserId,
        /// Requested signed delta. Replay re-applies this through the
        /// same insurance-backed settlement rule as the live path.
        delta: i64,
        /// Resulting balance, recorded for audit and verification.
        balance_after: i64,
        /// Why the balance changed.
        reason: BalanceReason,
    },
}

impl EventPayload {
    /// The on-disk kind of this payload.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::OrderPlaced { .. } => EventKind::OrderPlaced,
            EventPayload::OrderMatched { .. } => EventKind::OrderMatched,
            EventPayload::OrderCancelled { .. } => EventKind::OrderCancelled,
            EventPayload::OrderRejected { .. } => EventKind::OrderRejected,
            EventPayload::TradeExecuted { .. } => EventKind::TradeExecuted,
            EventPayload::FundingSettled { .. } => EventKind::FundingSettled,
            EventPayload::Liquidated { .. } => EventKind::Liquidated,
            EventPayload::BalanceUpdated { .. } => EventKind::BalanceUpdated,
        }
    }

    /// The order id this payload refers to, for the order index.
    /// `OrderMatched` indexes under the taker.
    #[must_use]
    pub fn index_order_id(&self) -> Option<OrderId> {
        match self {
            EventPayload::OrderPlaced { order_id, .. }
            | EventPayload::OrderCancelled { order_id, .. }
            | EventPayload::OrderRejected { order_id, .. } => Some(*order_id),
            EventPayload::OrderMatched { taker_order_id, .. } => Some(*taker_order_id),
            _ => None,
        }
    }
}

/// An event not yet sequenced: what producers hand to the log.
#[derive(Debug, Clone)]
pub struct EventBody {
    /// The instrument this event belongs to.
    pub instrument_id: InstrumentId,
    /// The typed payload.
    pub payload: EventPayload,
}

/// A sequenced, timestamped event as stored in and read from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Gap-free monotonic sequence assigned by the log.
    pub sequence: SequenceId,
    /// The instrument this event belongs to.
    pub instrument_id: InstrumentId,
    /// Deterministic timestamp derived from the sequence.
    pub timestamp_ns: TimestampNs,
    /// The typed payload.
    pub payload: EventPayload,
}

impl Event {
    /// The on-disk kind of this event.
    #[inline]
    #[must_use]
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

// ─── Encoding ───────────────────────────────────────────────────────────────

fn put_u8(buf: &mut Vec<u8>, v: u8) {
    buf.push(v);
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_i64(buf: &mut Vec<u8>, v: i64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn encode_payload(payload: &EventPayload, buf: &mut Vec<u8>) {
    match payload {
        EventPayload::OrderPlaced {
            order_id,
            client_order_id,
            user_id,
            side,
            kind,
            price,
            quantity,
            margin_basis,
            is_liquidation,
        } => {
            put_u64(buf, *order_id);
            buf.extend_from_slice(client_order_id.as_bytes());
            put_u64(buf, *user_id);
            put_u8(buf, side.as_u8());
            put_u8(buf, kind.as_u8());
            put_i64(buf, *price);
            put_i64(buf, *quantity);
            put_i64(buf, *margin_basis);
            put_u8(buf, u8::from(*is_liquidation));
        }
        EventPayload::OrderMatched {
            taker_order_id,
            maker_order_id,
            price,
            quantity,
            taker_remaining,
            maker_remaining,
        } => {
            put_u64(buf, *taker_order_id);
            put_u64(buf, *maker_order_id);
            put_i64(buf, *price);
            put_i64(buf, *quantity);
            put_i64(buf, *taker_remaining);
            put_i64(buf, *maker_remaining);
        }
        EventPayload::OrderCancelled {
            order_id,
            user_id,
            remaining,
        } => {
            put_u64(buf, *order_id);
            put_u64(buf, *user_id);
            put_i64(buf, *remaining);
        }
        EventPayload::OrderRejected {
            order_id,
            user_id,
            reason,
        } => {
            put_u64(buf, *order_id);
            put_u64(buf, *user_id);
            put_u8(buf, *reason as u8);
        }
        EventPayload::TradeExecuted {
            trade_sequence,
            buy_order_id,
            sell_order_id,
            buy_user_id,
            sell_user_id,
            price,
            quantity,
            is_taker_buy,
        } => {
            put_u64(buf, *trade_sequence);
            put_u64(buf, *buy_order_id);
            put_u64(buf, *sell_order_id);
            put_u64(buf, *buy_user_id);
            put_u64(buf, *sell_user_id);
            put_i64(buf, *price);
            put_i64(buf, *quantity);
            put_u8(buf, u8::from(*is_taker_buy));
        }
        EventPayload::FundingSettled {
            user_id,
            position,
            mark_price,
            rate_bps,
            payment,
        } => {
            put_u64(buf, *user_id);
            put_i64(buf, *position);
            put_i64(buf, *mark_price);
            put_i64(buf, *rate_bps);
            put_i64(buf, *payment);
        }
        EventPayload::Liquidated {
            user_id,
            quantity,
            mark_price,
            insurance_draw,
        } => {
            put_u64(buf, *user_id);
            put_i64(buf, *quantity);
            put_i64(buf, *mark_price);
            put_i64(buf, *insurance_draw);
        }
        EventPayload::BalanceUpdated {
            user_id,
            delta,
            balance_after,
            reason,
        } => {
            put_u64(buf, *user_id);
            put_i64(buf, *delta);
            put_i64(buf, *balance_after);
            put_u8(buf, *reason as u8);
        }
    }
}

/// Encode a full framed record, including length prefix and CRC trailer.
#[must_use]
pub fn encode_record(event: &Event) -> Vec<u8> {
    let mut buf = Vec::with_capacity(RECORD_OVERHEAD + 64);
    put_u32(&mut buf, 0); // length placeholder
    put_u8(&mut buf, event.kind() as u8);
    put_u64(&mut buf, event.sequence);
    put_u32(&mut buf, event.instrument_id);
    put_i64(&mut buf, event.timestamp_ns);
    encode_payload(&event.payload, &mut buf);

    let crc = crc32fast::hash(&buf[4..]);
    put_u32(&mut buf, crc);

    let record_length = (buf.len() - 4) as u32;
    buf[0..4].copy_from_slice(&record_length.to_le_bytes());
    buf
}

// ─── Decoding ───────────────────────────────────────────────────────────────

struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_u8(&mut self) -> Result<u8, String> {
        let b = *self.data.get(self.pos).ok_or("truncated u8")?;
        self.pos += 1;
        Ok(b)
    }

    fn read_u32(&mut self) -> Result<u32, String> {
        let bytes = self
            .data
            .get(self.pos..self.pos + 4)
            .ok_or("truncated u32")?;
        self.pos += 4;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_u64(&mut self) -> Result<u64, String> {
        let bytes = self
            .data
            .get(self.pos..self.pos + 8)
            .ok_or("truncated u64")?;
        self.pos += 8;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(raw))
    }

    fn read_i64(&mut self) -> Result<i64, String> {
        self.read_u64().map(|v| v as i64)
    }

    fn read_bool(&mut self) -> Result<bool, String> {
        Ok(self.read_u8()? != 0)
    }

    fn read_bytes16(&mut self) -> Result<[u8; 16], String> {
        let bytes = self
            .data
            .get(self.pos..self.pos + 16)
            .ok_or("truncated bytes16")?;
        self.pos += 16;
        let mut raw = [0u8; 16];
        raw.copy_from_slice(bytes);
        Ok(raw)
    }

    fn finished(&self) -> bool {
        self.pos == self.data.len()
    }
}

fn decode_payload(kind: EventKind, data: &[u8]) -> Result<EventPayload, String> {
    let mut r = ByteReader::new(data);
    let payload = match kind {
        EventKind::OrderPlaced => EventPayload::OrderPlaced {
            order_id: r.read_u64()?,
            client_order_id: uuid::Uuid::from_bytes(r.read_bytes16()?),
            user_id: r.read_u64()?,
            side: Side::from_u8(r.read_u8()?).ok_or("bad side")?,
            kind: OrderKind::from_u8(r.read_u8()?).ok_or("bad order kind")?,
            price: r.read_i64()?,
            quantity: r.read_i64()?,
            margin_basis: r.read_i64()?,
            is_liquidation: r.read_bool()?,
        },
        EventKind::OrderMatched => EventPayload::OrderMatched {
            taker_order_id: r.read_u64()?,
            maker_order_id: r.read_u64()?,
            price: r.read_i64()?,
            quantity: r.read_i64()?,
            taker_remaining: r.read_i64()?,
            maker_remaining: r.read_i64()?,
        },
        EventKind::OrderCancelled => EventPayload::OrderCancelled {
            order_id: r.read_u64()?,
            user_id: r.read_u64()?,
            remaining: r.read_i64()?,
        },
        EventKind::OrderRejected => EventPayload::OrderRejected {
            order_id: r.read_u64()?,
            user_id: r.read_u64()?,
            reason: RejectCode::from_u8(r.read_u8()?).ok_or("bad reject code")?,
        },
        EventKind::TradeExecuted => EventPayload::TradeExecuted {
            trade_sequence: r.read_u64()?,
            buy_order_id: r.read_u64()?,
            sell_order_id: r.read_u64()?,
            buy_user_id: r.read_u64()?,
            sell_user_id: r.read_u64()?,
            price: r.read_i64()?,
            quantity: r.read_i64()?,
            is_taker_buy: r.read_bool()?,
        },
        EventKind::FundingSettled => EventPayload::FundingSettled {
            user_id: r.read_u64()?,
            position: r.read_i64()?,
            mark_price: r.read_i64()?,
            rate_bps: r.read_i64()?,
            payment: r.read_i64()?,
        },
        EventKind::Liquidated => EventPayload::Liquidated {
            user_id: r.read_u64()?,
            quantity: r.read_i64()?,
            mark_price: r.read_i64()?,
            insurance_draw: r.read_i64()?,
        },
        EventKind::BalanceUpdated => EventPayload::BalanceUpdated {
            user_id: r.read_u64()?,
            delta: r.read_i64()?,
            balance_after: r.read_i64()?,
            reason: BalanceReason::from_u8(r.read_u8()?).ok_or("bad balance reason")?,
        },
    };
    if !r.finished() {
        return Err("trailing bytes in payload".to_string());
    }
    Ok(payload)
}

/// Decode one framed record at `offset` within a segment.
///
/// `Ok(None)` marks the clean end of written data (zero length field or
/// insufficient room for a header). Corruption — bad CRC, unknown kind,
/// truncated frame — returns an error; recovery treats errors found above
/// the committed high-water mark as a torn tail.
pub fn decode_record(data: &[u8], offset: usize) -> Result<Option<(Event, usize)>, WalError> {
    if offset + RECORD_HEADER_SIZE > data.len() {
        return Ok(None);
    }
    let len_bytes = &data[offset..offset + 4];
    let record_length =
        u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;
    if record_length == 0 {
        return Ok(None);
    }
    if record_length < RECORD_OVERHEAD - 4 {
        return Err(WalError::InvalidRecord {
            offset,
            message: format!("record length {record_length} below minimum"),
        });
    }
    let record_end = offset
        .checked_add(4)
        .and_then(|v| v.checked_add(record_length))
        .filter(|end| *end <= data.len())
        .ok_or(WalError::InvalidRecord {
            offset,
            message: "record extends beyond segment data".to_string(),
        })?;

    let body = &data[offset + 4..record_end - RECORD_CRC_SIZE];
    let crc_bytes = &data[record_end - RECORD_CRC_SIZE..record_end];
    let stored_crc = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
    let computed_crc = crc32fast::hash(body);

    let mut r = ByteReader::new(body);
    let kind_byte = r.read_u8().map_err(|m| WalError::InvalidRecord {
        offset,
        message: m,
    })?;
    let sequence = r.read_u64().map_err(|m| WalError::InvalidRecord {
        offset,
        message: m,
    })?;
    let instrument_id = r.read_u32().map_err(|m| WalError::InvalidRecord {
        offset,
        message: m,
    })?;
    let timestamp_ns = r.read_i64().map_err(|m| WalError::InvalidRecord {
        offset,
        message: m,
    })?;

    if stored_crc != computed_crc {
        return Err(WalError::CorruptRecord {
            sequence,
            expected_crc: stored_crc,
            actual_crc: computed_crc,
        });
    }

    let kind = EventKind::from_u8(kind_byte).ok_or(WalError::MalformedPayload {
        sequence,
        message: format!("unknown event kind {kind_byte}"),
    })?;
    let payload =
        decode_payload(kind, &body[r.pos..]).map_err(|message| WalError::MalformedPayload {
            sequence,
            message,
        })?;

    Ok(Some((
        Event {
            sequence,
            instrument_id,
            timestamp_ns,
            payload,
        },
        record_end,
    )))
}

// ─── Sink ───────────────────────────────────────────────────────────────────

/// Destination for events emitted by the matching engine and the
/// periodic evaluators.
///
/// Implementations must assign the sequence and handle infrastructure
/// failure themselves: a production sink backed by the event log treats
/// append failure as fatal (final diagnostic, then abort), so callers on
/// the matching path never observe a system-failure variant.
pub trait EventSink: Send + Sync {
    /// Record an event and return its assigned sequence.
    fn publish(&self, body: EventBody) -> SequenceId;
}

/// In-memory sink for unit tests: sequences events and retains them.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: std::sync::Mutex<Vec<Event>>,
    next: std::sync::atomic::AtomicU64,
}

impl MemorySink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Events recorded so far, in order.
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Kinds recorded so far, in order.
    #[must_use]
    pub fn kinds(&self) -> Vec<EventKind> {
        self.events().iter().map(Event::kind).collect()
    }
}

impl EventSink for MemorySink {
    fn publish(&self, body: EventBody) -> SequenceId {
        let sequence = self
            .next
            .fetch_add(1, std::sync::atomic::Ordering::AcqRel)
            + 1;
        let event = Event {
            sequence,
            instrument_id: body.instrument_id,
            timestamp_ns: crate::calc::sequence_to_timestamp(sequence, 0),
            payload: body.payload,
        };
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
        sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event(sequence: SequenceId) -> Event {
        Event {
            sequence,
            instrument_id: 1,
            timestamp_ns: crate::calc::sequence_to_timestamp(sequence, 0),
            payload: EventPayload::OrderPlaced {
                order_id: 10,
                client_order_id: uuid::Uuid::from_u128(0xFEED),
                user_id: 7,
                side: Side::Buy,
                kind: OrderKind::Limit,
                price: 50_000,
                quantity: 100,
                margin_basis: 50_000,
                is_liquidation: false,
            },
        }
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let event = sample_event(42);
        let bytes = encode_record(&event);
        let (decoded, next) = decode_record(&bytes, 0).unwrap().unwrap();
        assert_eq!(decoded, event);
        assert_eq!(next, bytes.len());
    }

    #[test]
    fn test_record_length_field() {
        let event = sample_event(1);
        let bytes = encode_record(&event);
        let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        assert_eq!(len + 4, bytes.len());
    }

    #[test]
    fn test_all_kinds_round_trip() {
        let payloads = vec![
            EventPayload::OrderMatched {
                taker_order_id: 1,
                maker_order_id: 2,
                price: 100,
                quantity: 5,
                taker_remaining: 0,
                maker_remaining: 3,
            },
            EventPayload::OrderCancelled {
                order_id: 1,
                user_id: 7,
                remaining: 4,
            },
            EventPayload::OrderRejected {
                order_id: 1,
                user_id: 7,
                reason: RejectCode::FokUnfillable,
            },
            EventPayload::TradeExecuted {
                trade_sequence: 9,
                buy_order_id: 1,
                sell_order_id: 2,
                buy_user_id: 7,
                sell_user_id: 8,
                price: 100,
                quantity: 5,
                is_taker_buy: true,
            },
            EventPayload::FundingSettled {
                user_id: 7,
                position: -5,
                mark_price: 100,
                rate_bps: -3,
                payment: -15,
            },
            EventPayload::Liquidated {
                user_id: 7,
                quantity: 5,
                mark_price: 90,
                insurance_draw: 12,
            },
            EventPayload::BalanceUpdated {
                user_id: 7,
                delta: -100,
                balance_after: 900,
                reason: BalanceReason::TradePnl,
            },
        ];
        for (i, payload) in payloads.into_iter().enumerate() {
            let event = Event {
                sequence: i as u64 + 1,
                instrument_id: 2,
                timestamp_ns: 123,
                payload,
            };
            let bytes = encode_record(&event);
            let (decoded, _) = decode_record(&bytes, 0).unwrap().unwrap();
            assert_eq!(decoded, event);
        }
    }

    #[test]
    fn test_zero_length_is_clean_end() {
        let data = vec![0u8; 64];
        assert!(decode_record(&data, 0).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_crc_detected() {
        let event = sample_event(5);
        let mut bytes = encode_record(&event);
        let flip = bytes.len() / 2;
        bytes[flip] ^= 0xFF;
        let err = decode_record(&bytes, 0).unwrap_err();
        match err {
            WalError::CorruptRecord { sequence, .. } => assert_eq!(sequence, 5),
            other => panic!("expected CorruptRecord, got {other}"),
        }
    }

    #[test]
    fn test_truncated_record_is_error() {
        let event = sample_event(5);
        let bytes = encode_record(&event);
        let truncated = &bytes[..bytes.len() - 3];
        // Header present but frame extends beyond the data.
        let err = decode_record(truncated, 0).unwrap_err();
        assert!(matches!(err, WalError::InvalidRecord { .. }));
    }

    #[test]
    fn test_memory_sink_sequences_from_one() {
        let sink = MemorySink::new();
        let s1 = sink.publish(EventBody {
            instrument_id: 1,
            payload: EventPayload::OrderCancelled {
                order_id: 1,
                user_id: 7,
                remaining: 1,
            },
        });
        let s2 = sink.publish(EventBody {
            instrument_id: 1,
            payload: EventPayload::OrderCancelled {
                order_id: 2,
                user_id: 7,
                remaining: 1,
            },
        });
        assert_eq!((s1, s2), (1, 2));
        assert_eq!(sink.events().len(), 2);
    }
}

//! State snapshots: replay seeds anchored at a sequence boundary.
//!
//! A snapshot file holds `(sequence, ledger dump, position dump, book
//! dumps, funding anchors)` framed like a WAL record (`[u32 len][u8
//! type][payload][u32 crc]`), with a SHA-256 checksum of the payload
//! embedded for integrity and a version for forward compatibility.
//! Section flags let callers write partial snapshots; recovery requires
//! all sections.

use crate::calc::{InstrumentId, OrderId, Price, Quantity, SequenceId, TimestampNs, UserId};
use crate::engine::types::{Order, OrderKind, Side};
use crate::ledger::AccountDump;
use crate::ledger::position::PositionDump;
use crate::risk::FundingDump;
use crate::wal::error::WalError;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Snapshot format version.
pub const SNAPSHOT_FORMAT_VERSION: u16 = 1;

/// Record-type byte distinguishing snapshot frames from event records.
const SNAPSHOT_RECORD_TYPE: u8 = 0x10;

const SNAPSHOT_SUBDIR: &str = "snapshots";

bitflags! {
    /// Which state sections a snapshot carries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct SnapshotSections: u8 {
        /// Account ledger rows.
        const LEDGER = 1 << 0;
        /// Position rows.
        const POSITIONS = 1 << 1;
        /// Resting orders per book.
        const BOOKS = 1 << 2;
        /// Funding anchors and rates.
        const FUNDING = 1 << 3;
    }
}

impl SnapshotSections {
    /// Every section; what recovery requires.
    #[must_use]
    pub fn full() -> Self {
        Self::LEDGER | Self::POSITIONS | Self::BOOKS | Self::FUNDING
    }
}

/// One resting order as persisted in a book dump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestingOrderDump {
    /// Order identity.
    pub order_id: OrderId,
    /// Caller-supplied idempotency id.
    pub client_order_id: Uuid,
    /// Owner.
    pub user_id: UserId,
    /// Buy or sell.
    pub side: Side,
    /// Execution policy.
    pub kind: OrderKind,
    /// Limit price.
    pub price: Price,
    /// Original quantity.
    pub quantity: Quantity,
    /// Quantity executed before the snapshot.
    pub filled: Quantity,
    /// Margin price basis.
    pub margin_basis: Price,
    /// Admission sequence.
    pub sequence: SequenceId,
    /// Deterministic admission timestamp.
    pub timestamp_ns: TimestampNs,
    /// Liquidation-taker flag.
    pub is_liquidation: bool,
}

impl RestingOrderDump {
    /// Capture a live order.
    #[must_use]
    pub fn from_order(order: &Order) -> Self {
        Self {
            order_id: order.order_id,
            client_order_id: order.client_order_id,
            user_id: order.user_id,
            side: order.side,
            kind: order.kind,
            price: order.price,
            quantity: order.quantity,
            filled: order.filled(),
            margin_basis: order.margin_basis,
            sequence: order.sequence(),
            timestamp_ns: order.timestamp_ns(),
            is_liquidation: order.is_liquidation,
        }
    }

    /// Rebuild the live order this row captured.
    #[must_use]
    pub fn to_order(&self, instrument_id: InstrumentId) -> Arc<Order> {
        let mut order = Order::new(
            self.order_id,
            self.client_order_id,
            self.user_id,
            instrument_id,
            self.side,
            self.kind,
            self.price,
            self.quantity,
        );
        order.margin_basis = self.margin_basis;
        order.is_liquidation = self.is_liquidation;
        let order = Arc::new(order);
        order.assign_sequence(self.sequence);
        order.set_timestamp_ns(self.timestamp_ns);
        if self.filled > 0 {
            order.record_fill(self.filled);
        }
        order
    }
}

/// One instrument's book state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookDump {
    /// The instrument.
    pub instrument_id: InstrumentId,
    /// Last trade price (zero when none).
    pub last_trade_price: Price,
    /// The engine's trade-sequence counter.
    pub trade_sequence: u64,
    /// Resting orders in admission-sequence order.
    pub orders: Vec<RestingOrderDump>,
}

/// Complete state at a sequence boundary.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StateDump {
    /// The event-log sequence this state corresponds to.
    pub sequence: SequenceId,
    /// The next order id the controller will assign.
    pub next_order_id: OrderId,
    /// Ledger rows, ascending user id.
    pub accounts: Vec<AccountDump>,
    /// Position rows, ascending (user, instrument).
    pub positions: Vec<PositionDump>,
    /// Book dumps, ascending instrument id.
    pub books: Vec<BookDump>,
    /// Funding anchors, ascending instrument id.
    pub funding: Vec<FundingDump>,
}

impl StateDump {
    /// Canonical binary encoding of the selected sections.
    #[must_use]
    pub fn encode(&self, sections: SnapshotSections) -> Vec<u8> {
        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(&SNAPSHOT_FORMAT_VERSION.to_le_bytes());
        buf.push(sections.bits());
        buf.extend_from_slice(&self.sequence.to_le_bytes());
        buf.extend_from_slice(&self.next_order_id.to_le_bytes());

        if sections.contains(SnapshotSections::LEDGER) {
            buf.extend_from_slice(&(self.accounts.len() as u32).to_le_bytes());
            for row in &self.accounts {
                buf.extend_from_slice(&row.user_id.to_le_bytes());
                buf.extend_from_slice(&row.balance.to_le_bytes());
                buf.extend_from_slice(&row.frozen.to_le_bytes());
                buf.extend_from_slice(&row.used_margin.to_le_bytes());
            }
        }
        if sections.contains(SnapshotSections::POSITIONS) {
            buf.extend_from_slice(&(self.positions.len() as u32).to_le_bytes());
            for row in &self.positions {
                buf.extend_from_slice(&row.user_id.to_le_bytes());
                buf.extend_from_slice(&row.instrument_id.to_le_bytes());
                buf.extend_from_slice(&row.net_size.to_le_bytes());
                buf.extend_from_slice(&row.entry_price.to_le_bytes());
                buf.extend_from_slice(&row.limit.to_le_bytes());
            }
        }
        if sections.contains(SnapshotSections::BOOKS) {
            buf.extend_from_slice(&(self.books.len() as u32).to_le_bytes());
            for book in &self.books {
                buf.extend_from_slice(&book.instrument_id.to_le_bytes());
                buf.extend_from_slice(&book.last_trade_price.to_le_bytes());
                buf.extend_from_slice(&book.trade_sequence.to_le_bytes());
                buf.extend_from_slice(&(book.orders.len() as u32).to_le_bytes());
                for order in &book.orders {
                    buf.extend_from_slice(&order.order_id.to_le_bytes());
                    buf.extend_from_slice(order.client_order_id.as_bytes());
                    buf.extend_from_slice(&order.user_id.to_le_bytes());
                    buf.push(order.side.as_u8());
                    buf.push(order.kind.as_u8());
                    buf.extend_from_slice(&order.price.to_le_bytes());
                    buf.extend_from_slice(&order.quantity.to_le_bytes());
                    buf.extend_from_slice(&order.filled.to_le_bytes());
                    buf.extend_from_slice(&order.margin_basis.to_le_bytes());
                    buf.extend_from_slice(&order.sequence.to_le_bytes());
                    buf.extend_from_slice(&order.timestamp_ns.to_le_bytes());
                    buf.push(u8::from(order.is_liquidation));
                }
            }
        }
        if sections.contains(SnapshotSections::FUNDING) {
            buf.extend_from_slice(&(self.funding.len() as u32).to_le_bytes());
            for row in &self.funding {
                buf.extend_from_slice(&row.instrument_id.to_le_bytes());
                buf.extend_from_slice(&row.premium_index_bps.to_le_bytes());
                buf.extend_from_slice(&row.funding_rate_bps.to_le_bytes());
                buf.extend_from_slice(&row.next_settlement_ns.to_le_bytes());
            }
        }
        buf
    }

    /// Decode the canonical encoding.
    ///
    /// # Errors
    /// [`WalError::SnapshotInvalid`] on version mismatch or truncation.
    pub fn decode(data: &[u8]) -> Result<(Self, SnapshotSections), WalError> {
        let mut r = Reader::new(data);
        let version = r.u16()?;
        if version != SNAPSHOT_FORMAT_VERSION {
            return Err(WalError::SnapshotInvalid {
                message: format!(
                    "unsupported snapshot version {version} (expected {SNAPSHOT_FORMAT_VERSION})"
                ),
            });
        }
        let sections = SnapshotSections::from_bits(r.u8()?).ok_or(WalError::SnapshotInvalid {
            message: "unknown section bits".to_string(),
        })?;
        let sequence = r.u64()?;
        let next_order_id = r.u64()?;
        let mut dump = StateDump {
            sequence,
            next_order_id,
            ..StateDump::default()
        };

        if sections.contains(SnapshotSections::LEDGER) {
            let count = r.u32()? as usize;
            for _ in 0..count {
                dump.accounts.push(AccountDump {
                    user_id: r.u64()?,
                    balance: r.i64()?,
                    frozen: r.i64()?,
                    used_margin: r.i64()?,
                });
            }
        }
        if sections.contains(SnapshotSections::POSITIONS) {
            let count = r.u32()? as usize;
            for _ in 0..count {
                dump.positions.push(PositionDump {
                    user_id: r.u64()?,
                    instrument_id: r.u32()?,
                    net_size: r.i64()?,
                    entry_price: r.i64()?,
                    limit: r.i64()?,
                });
            }
        }
        if sections.contains(SnapshotSections::BOOKS) {
            let count = r.u32()? as usize;
            for _ in 0..count {
                let instrument_id = r.u32()?;
                let last_trade_price = r.i64()?;
                let trade_sequence = r.u64()?;
                let order_count = r.u32()? as usize;
                let mut orders = Vec::with_capacity(order_count);
                for _ in 0..order_count {
                    orders.push(RestingOrderDump {
                        order_id: r.u64()?,
                        client_order_id: Uuid::from_bytes(r.bytes16()?),
                        user_id: r.u64()?,
                        side: Side::from_u8(r.u8()?).ok_or_else(bad_enum)?,
                        kind: OrderKind::from_u8(r.u8()?).ok_or_else(bad_enum)?,
                        price: r.i64()?,
                        quantity: r.i64()?,
                        filled: r.i64()?,
                        margin_basis: r.i64()?,
                        sequence: r.u64()?,
                        timestamp_ns: r.i64()?,
                        is_liquidation: r.u8()? != 0,
                    });
                }
                dump.books.push(BookDump {
                    instrument_id,
                    last_trade_price,
                    trade_sequence,
                    orders,
                });
            }
        }
        if sections.contains(SnapshotSections::FUNDING) {
            let count = r.u32()? as usize;
            for _ in 0..count {
                dump.funding.push(FundingDump {
                    instrument_id: r.u32()?,
                    premium_index_bps: r.i64()?,
                    funding_rate_bps: r.i64()?,
                    next_settlement_ns: r.i64()?,
                });
            }
        }
        Ok((dump, sections))
    }

    /// Hex SHA-256 over the canonical encoding of the selected sections.
    /// Two replays of the same event log must produce identical digests.
    #[must_use]
    pub fn digest(&self, sections: SnapshotSections) -> String {
        let encoded = self.encode(sections);
        let mut hasher = Sha256::new();
        hasher.update(&encoded);
        hex_string(&hasher.finalize())
    }

    /// Digest of the determinism-contract sections: ledger, positions
    /// and books. The sequence and id-counter header fields are zeroed
    /// so the digest depends only on reconstructed state.
    #[must_use]
    pub fn core_digest(&self) -> String {
        let mut core = self.clone();
        core.sequence = 0;
        core.next_order_id = 0;
        core.digest(SnapshotSections::LEDGER | SnapshotSections::POSITIONS | SnapshotSections::BOOKS)
    }
}

fn bad_enum() -> WalError {
    WalError::SnapshotInvalid {
        message: "invalid enum discriminant".to_string(),
    }
}

/// Directory holding snapshot files under `data_dir`.
#[must_use]
pub fn snapshot_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(SNAPSHOT_SUBDIR)
}

/// Path of the snapshot anchored at `sequence`.
#[must_use]
pub fn snapshot_path(data_dir: &Path, sequence: SequenceId) -> PathBuf {
    snapshot_dir(data_dir).join(format!("{sequence:020}.snap"))
}

/// Sequences of all snapshots under `data_dir`, ascending.
///
/// # Errors
/// Propagates directory-listing failures (a missing directory is empty).
pub fn list_snapshots(data_dir: &Path) -> Result<Vec<SequenceId>, WalError> {
    let dir = snapshot_dir(data_dir);
    let mut seqs = Vec::new();
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(seqs),
        Err(e) => {
            return Err(WalError::Io {
                message: e.to_string(),
                path: Some(dir),
            });
        }
    };
    for entry in entries {
        let entry = entry.map_err(|e| WalError::Io {
            message: e.to_string(),
            path: Some(dir.clone()),
        })?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(seq_str) = name.strip_suffix(".snap")
            && let Ok(seq) = seq_str.parse::<u64>()
        {
            seqs.push(seq);
        }
    }
    seqs.sort_unstable();
    Ok(seqs)
}

/// Write a snapshot frame for `dump` under `data_dir`, durably.
///
/// # Errors
/// Propagates I/O failures; the caller treats them as fatal.
pub fn write_snapshot(
    data_dir: &Path,
    dump: &StateDump,
    sections: SnapshotSections,
) -> Result<PathBuf, WalError> {
    let dir = snapshot_dir(data_dir);
    fs::create_dir_all(&dir).map_err(|e| WalError::Io {
        message: e.to_string(),
        path: Some(dir.clone()),
    })?;

    let mut payload = dump.encode(sections);
    let mut hasher = Sha256::new();
    hasher.update(&payload);
    payload.extend_from_slice(&hasher.finalize());

    let mut frame = Vec::with_capacity(payload.len() + 9);
    frame.extend_from_slice(&((payload.len() + 1 + 4) as u32).to_le_bytes());
    frame.push(SNAPSHOT_RECORD_TYPE);
    frame.extend_from_slice(&payload);
    let crc = crc32fast::hash(&frame[4..]);
    frame.extend_from_slice(&crc.to_le_bytes());

    let path = snapshot_path(data_dir, dump.sequence);
    let tmp = path.with_extension("snap.tmp");
    {
        use std::io::Write;
        let mut file = fs::File::create(&tmp).map_err(|e| WalError::Io {
            message: e.to_string(),
            path: Some(tmp.clone()),
        })?;
        file.write_all(&frame).map_err(|e| WalError::Io {
            message: e.to_string(),
            path: Some(tmp.clone()),
        })?;
        file.sync_all().map_err(|e| WalError::Io {
            message: e.to_string(),
            path: Some(tmp.clone()),
        })?;
    }
    fs::rename(&tmp, &path).map_err(|e| WalError::Io {
        message: e.to_string(),
        path: Some(path.clone()),
    })?;
    info!(
        "snapshot: wrote sequence {} to {}",
        dump.sequence,
        path.display()
    );
    Ok(path)
}

/// Load and validate a snapshot frame.
///
/// # Errors
/// [`WalError::SnapshotInvalid`] on framing, CRC, checksum or version
/// failure.
pub fn load_snapshot(path: &Path) -> Result<(StateDump, SnapshotSections), WalError> {
    let frame = fs::read(path).map_err(|e| WalError::Io {
        message: e.to_string(),
        path: Some(path.to_path_buf()),
    })?;
    if frame.len() < 9 {
        return Err(WalError::SnapshotInvalid {
            message: "snapshot frame too short".to_string(),
        });
    }
    let declared = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    if declared + 4 != frame.len() {
        return Err(WalError::SnapshotInvalid {
            message: format!(
                "snapshot length mismatch: declared {declared}, actual {}",
                frame.len() - 4
            ),
        });
    }
    let crc_start = frame.len() - 4;
    let stored_crc = u32::from_le_bytes([
        frame[crc_start],
        frame[crc_start + 1],
        frame[crc_start + 2],
        frame[crc_start + 3],
    ]);
    let computed_crc = crc32fast::hash(&frame[4..crc_start]);
    if stored_crc != computed_crc {
        return Err(WalError::SnapshotInvalid {
            message: format!("snapshot CRC mismatch ({stored_crc:#010x} vs {computed_crc:#010x})"),
        });
    }
    if frame[4] != SNAPSHOT_RECORD_TYPE {
        return Err(WalError::SnapshotInvalid {
            message: format!("unexpected record type {:#04x}", frame[4]),
        });
    }
    let payload = &frame[5..crc_start];
    if payload.len() < 32 {
        return Err(WalError::SnapshotInvalid {
            message: "snapshot payload too short for checksum".to_string(),
        });
    }
    let (body, stored_sha) = payload.split_at(payload.len() - 32);
    let mut hasher = Sha256::new();
    hasher.update(body);
    if hasher.finalize().as_slice() != stored_sha {
        return Err(WalError::SnapshotInvalid {
            message: "snapshot checksum mismatch".to_string(),
        });
    }
    StateDump::decode(body)
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WalError> {
        let slice = self
            .data
            .get(self.pos..self.pos + n)
            .ok_or(WalError::SnapshotInvalid {
                message: "truncated snapshot body".to_string(),
            })?;
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, WalError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, WalError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, WalError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, WalError> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    fn i64(&mut self) -> Result<i64, WalError> {
        self.u64().map(|v| v as i64)
    }

    fn bytes16(&mut self) -> Result<[u8; 16], WalError> {
        let b = self.take(16)?;
        let mut raw = [0u8; 16];
        raw.copy_from_slice(b);
        Ok(raw)
    }
}

fn hex_string(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

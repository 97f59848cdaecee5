//! Matching engine error types.

use crate::calc::{InstrumentId, OrderId, Price, Quantity, UserId};
use crate::engine::types::OrderStatus;
use std::fmt;

/// User-level rejections produced by the order book and matching engine.
///
/// Every variant here is a *user* error: it is reported to the caller and
/// leaves the book, ledger and positions untouched. The matching loop is
/// unable to produce any system-failure variant by construction.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum EngineError {
    /// The order failed structural validation.
    InvalidOrder {
        /// Description of the violated rule.
        message: String,
    },

    /// Order price is not a multiple of the configured tick size.
    InvalidTick {
        /// The order price that failed validation.
        price: Price,
        /// The configured tick size.
        tick_size: Price,
    },

    /// Order quantity is not a multiple of the configured step.
    InvalidStep {
        /// The order quantity that failed validation.
        quantity: Quantity,
        /// The configured quantity step.
        step: Quantity,
    },

    /// Order price is outside the allowed range.
    PriceOutOfRange {
        /// The order price that failed validation.
        price: Price,
        /// Minimum allowed price.
        min: Price,
        /// Maximum allowed price.
        max: Price,
    },

    /// Order quantity is outside the allowed range.
    QuantityOutOfRange {
        /// The order quantity that failed validation.
        quantity: Quantity,
        /// Minimum allowed quantity.
        min: Quantity,
        /// Maximum allowed quantity.
        max: Quantity,
    },

    /// Order not present in the book.
    OrderNotFound(OrderId),

    /// An order with this identifier is already in the book.
    DuplicateOrderId(OrderId),

    /// The order belongs to a different user than the requester.
    WrongUser {
        /// The order in question.
        order_id: OrderId,
        /// The user that owns the order.
        owner: UserId,
        /// The user that issued the request.
        requester: UserId,
    },

    /// The order already reached a terminal status; the request is a
    /// typed no-op.
    AlreadyTerminal {
        /// The order in question.
        order_id: OrderId,
        /// Its terminal status.
        status: OrderStatus,
    },

    /// A post-only order would have crossed the opposite side.
    PostOnlyWouldCross {
        /// The post-only limit price.
        price: Price,
        /// The best opposite price it would have matched.
        opposite_price: Price,
    },

    /// A fill-or-kill order cannot be fully satisfied at matchable
    /// prices.
    FokUnfillable {
        /// Quantity requested.
        requested: Quantity,
        /// Quantity available at matchable prices.
        available: Quantity,
    },

    /// The instrument is not configured on this core instance.
    UnknownInstrument(InstrumentId),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::InvalidOrder { message } => write!(f, "invalid order: {message}"),
            EngineError::InvalidTick { price, tick_size } => {
                write!(
                    f,
                    "price {price} does not align to the {tick_size} tick grid"
                )
            }
            EngineError::InvalidStep { quantity, step } => {
                write!(
                    f,
                    "quantity {quantity} does not align to the {step} step grid"
                )
            }
            EngineError::PriceOutOfRange { price, min, max } => {
                write!(f, "price {price} outside allowed range [{min}, {max}]")
            }
            EngineError::QuantityOutOfRange { quantity, min, max } => {
                write!(f, "quantity {quantity} outside allowed range [{min}, {max}]")
            }
            EngineError::OrderNotFound(id) => write!(f, "no live or terminal order with id {id}"),
            EngineError::DuplicateOrderId(id) => write!(f, "duplicate order id: {id}"),
            EngineError::WrongUser {
                order_id,
                owner,
                requester,
            } => {
                write!(
                    f,
                    "order {order_id} belongs to user {owner}, not requester {requester}"
                )
            }
            EngineError::AlreadyTerminal { order_id, status } => {
                write!(f, "order {order_id} already terminal ({status})")
            }
            EngineError::PostOnlyWouldCross {
                price,
                opposite_price,
            } => {
                write!(
                    f,
                    "post-only at {price} would cross opposite best {opposite_price}"
                )
            }
            EngineError::FokUnfillable {
                requested,
                available,
            } => {
                write!(
                    f,
                    "fill-or-kill unfillable: requested {requested}, available {available}"
                )
            }
            EngineError::UnknownInstrument(id) => write!(f, "unknown instrument: {id}"),
        }
    }
}

impl std::error::Error for EngineError {}

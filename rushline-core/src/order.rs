//! Voucher, order and admission types.

use crate::{OrderId, Timestamp, UserId, VoucherId};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// VOUCHER STOCK
// ============================================================================

/// Durable stock record for a flash-sale voucher.
///
/// `stock` never goes below zero: every durable decrement is guarded on
/// `stock > 0`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoucherStock {
    pub voucher_id: VoucherId,
    pub stock: i64,
    pub begin_at: Timestamp,
    pub end_at: Timestamp,
}

impl VoucherStock {
    pub fn new(voucher_id: VoucherId, stock: i64, begin_at: Timestamp, end_at: Timestamp) -> Self {
        Self {
            voucher_id,
            stock,
            begin_at,
            end_at,
        }
    }

    /// Check the sale window, returning the rejection if `now` is outside it.
    pub fn window_rejection(&self, now: Timestamp) -> Option<RejectReason> {
        if now < self.begin_at {
            Some(RejectReason::NotStarted)
        } else if now > self.end_at {
            Some(RejectReason::Ended)
        } else {
            None
        }
    }

    pub fn has_stock(&self) -> bool {
        self.stock > 0
    }
}

// ============================================================================
// ORDERS
// ============================================================================

/// An admitted order request, as carried through the order queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub voucher_id: VoucherId,
    pub requested_at: Timestamp,
}

/// A persisted order. At most one exists per `(user_id, voucher_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub voucher_id: VoucherId,
    pub created_at: Timestamp,
}

impl From<&OrderRequest> for Order {
    fn from(request: &OrderRequest) -> Self {
        Order {
            order_id: request.order_id,
            user_id: request.user_id,
            voucher_id: request.voucher_id,
            created_at: request.requested_at,
        }
    }
}

/// An order request delivered from the order queue.
///
/// `entry_id` is the queue's identifier for acknowledgement. `redelivered`
/// is set when the task came from the pending set rather than a fresh read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTask {
    pub entry_id: String,
    pub request: OrderRequest,
    pub redelivered: bool,
}

/// Outcome of the durable, transactional order write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    /// Stock decremented and the order row inserted.
    Persisted,
    /// An order for this `(user_id, voucher_id)` already exists; nothing written.
    AlreadyExists,
    /// The `stock > 0` guard failed; nothing written.
    StockExhausted,
}

// ============================================================================
// ADMISSION
// ============================================================================

/// Why an order request was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectReason {
    OutOfStock,
    NotStarted,
    Ended,
    DuplicateOrder,
    VoucherNotFound,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::OutOfStock => "out_of_stock",
            RejectReason::NotStarted => "not_started",
            RejectReason::Ended => "ended",
            RejectReason::DuplicateOrder => "duplicate_order",
            RejectReason::VoucherNotFound => "voucher_not_found",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of the atomic admission script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionVerdict {
    Admitted,
    Rejected(RejectReason),
}

impl AdmissionVerdict {
    /// Decode the integer returned by the store-side admission script.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(AdmissionVerdict::Admitted),
            1 => Some(AdmissionVerdict::Rejected(RejectReason::OutOfStock)),
            2 => Some(AdmissionVerdict::Rejected(RejectReason::DuplicateOrder)),
            3 => Some(AdmissionVerdict::Rejected(RejectReason::NotStarted)),
            4 => Some(AdmissionVerdict::Rejected(RejectReason::Ended)),
            5 => Some(AdmissionVerdict::Rejected(RejectReason::VoucherNotFound)),
            _ => None,
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            AdmissionVerdict::Admitted => 0,
            AdmissionVerdict::Rejected(RejectReason::OutOfStock) => 1,
            AdmissionVerdict::Rejected(RejectReason::DuplicateOrder) => 2,
            AdmissionVerdict::Rejected(RejectReason::NotStarted) => 3,
            AdmissionVerdict::Rejected(RejectReason::Ended) => 4,
            AdmissionVerdict::Rejected(RejectReason::VoucherNotFound) => 5,
        }
    }
}

/// What the caller of `submit` gets back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubmitOutcome {
    Admitted { order_id: OrderId },
    Rejected { reason: RejectReason },
}

impl SubmitOutcome {
    pub fn admitted(&self) -> bool {
        matches!(self, SubmitOutcome::Admitted { .. })
    }

    pub fn order_id(&self) -> Option<OrderId> {
        match self {
            SubmitOutcome::Admitted { order_id } => Some(*order_id),
            SubmitOutcome::Rejected { .. } => None,
        }
    }

    pub fn reason(&self) -> Option<RejectReason> {
        match self {
            SubmitOutcome::Admitted { .. } => None,
            SubmitOutcome::Rejected { reason } => Some(*reason),
        }
    }
}

impl From<RejectReason> for SubmitOutcome {
    fn from(reason: RejectReason) -> Self {
        SubmitOutcome::Rejected { reason }
    }
}

/// Per-request caller identity, passed explicitly through every call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub user_id: UserId,
    pub request_id: Uuid,
}

impl RequestContext {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            request_id: Uuid::now_v7(),
        }
    }
}

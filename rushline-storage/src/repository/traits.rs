//! Durable order store contract.

use async_trait::async_trait;
use rushline_core::{Order, PersistOutcome, RushlineResult, UserId, VoucherId, VoucherStock};

/// Durable relational store for vouchers and orders.
///
/// Orders are unique per `(user_id, voucher_id)`. Voucher stock is only ever
/// decremented under a `stock > 0` guard.
#[async_trait]
pub trait OrderRepository: Send + Sync + 'static {
    async fn voucher(&self, voucher_id: VoucherId) -> RushlineResult<Option<VoucherStock>>;

    async fn upsert_voucher(&self, voucher: &VoucherStock) -> RushlineResult<()>;

    async fn order_exists(&self, user_id: UserId, voucher_id: VoucherId) -> RushlineResult<bool>;

    async fn find_order(
        &self,
        user_id: UserId,
        voucher_id: VoucherId,
    ) -> RushlineResult<Option<Order>>;

    async fn count_orders(&self, voucher_id: VoucherId) -> RushlineResult<u64>;

    /// Users holding a persisted order for `voucher_id`.
    async fn buyers(&self, voucher_id: VoucherId) -> RushlineResult<Vec<UserId>>;

    /// Persist an order in one transaction: existence check, guarded stock
    /// decrement, insert. Nothing is written unless the outcome is
    /// [`PersistOutcome::Persisted`].
    async fn create_order(&self, order: &Order) -> RushlineResult<PersistOutcome>;
}

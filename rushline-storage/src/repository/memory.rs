//! In-memory order repository.

use super::traits::OrderRepository;
use async_trait::async_trait;
use rushline_core::{Order, PersistOutcome, RushlineResult, UserId, VoucherId, VoucherStock};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct Tables {
    vouchers: HashMap<VoucherId, VoucherStock>,
    orders: HashMap<(UserId, VoucherId), Order>,
}

/// [`OrderRepository`] held in process memory. Each call takes the table
/// mutex once, which makes `create_order` a single transaction.
#[derive(Default)]
pub struct InMemoryOrderRepository {
    tables: Mutex<Tables>,
}

impl InMemoryOrderRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every persisted order, in no particular order.
    pub fn orders(&self) -> Vec<Order> {
        self.lock().orders.values().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl OrderRepository for InMemoryOrderRepository {
    async fn voucher(&self, voucher_id: VoucherId) -> RushlineResult<Option<VoucherStock>> {
        Ok(self.lock().vouchers.get(&voucher_id).cloned())
    }

    async fn upsert_voucher(&self, voucher: &VoucherStock) -> RushlineResult<()> {
        self.lock()
            .vouchers
            .insert(voucher.voucher_id, voucher.clone());
        Ok(())
    }

    async fn order_exists(&self, user_id: UserId, voucher_id: VoucherId) -> RushlineResult<bool> {
        Ok(self.lock().orders.contains_key(&(user_id, voucher_id)))
    }

    async fn find_order(
        &self,
        user_id: UserId,
        voucher_id: VoucherId,
    ) -> RushlineResult<Option<Order>> {
        Ok(self.lock().orders.get(&(user_id, voucher_id)).cloned())
    }

    async fn count_orders(&self, voucher_id: VoucherId) -> RushlineResult<u64> {
        Ok(self
            .lock()
            .orders
            .keys()
            .filter(|(_, v)| *v == voucher_id)
            .count() as u64)
    }

    async fn buyers(&self, voucher_id: VoucherId) -> RushlineResult<Vec<UserId>> {
        Ok(self
            .lock()
            .orders
            .keys()
            .filter(|(_, v)| *v == voucher_id)
            .map(|(u, _)| *u)
            .collect())
    }

    async fn create_order(&self, order: &Order) -> RushlineResult<PersistOutcome> {
        let mut tables = self.lock();
        let key = (order.user_id, order.voucher_id);
        if tables.orders.contains_key(&key) {
            return Ok(PersistOutcome::AlreadyExists);
        }
        match tables.vouchers.get_mut(&order.voucher_id) {
            Some(voucher) if voucher.stock > 0 => voucher.stock -= 1,
            _ => return Ok(PersistOutcome::StockExhausted),
        }
        tables.orders.insert(key, order.clone());
        Ok(PersistOutcome::Persisted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use rushline_core::OrderId;

    fn voucher(stock: i64) -> VoucherStock {
        let now = Utc::now();
        VoucherStock::new(
            VoucherId::new(1),
            stock,
            now - Duration::hours(1),
            now + Duration::hours(1),
        )
    }

    fn order(order_id: u64, user_id: u64) -> Order {
        Order {
            order_id: OrderId::new(order_id),
            user_id: UserId::new(user_id),
            voucher_id: VoucherId::new(1),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_create_order_outcomes() {
        let repo = InMemoryOrderRepository::new();
        repo.upsert_voucher(&voucher(1)).await.unwrap();

        assert_eq!(
            repo.create_order(&order(10, 1)).await.unwrap(),
            PersistOutcome::Persisted
        );
        assert_eq!(
            repo.create_order(&order(11, 1)).await.unwrap(),
            PersistOutcome::AlreadyExists
        );
        assert_eq!(
            repo.create_order(&order(12, 2)).await.unwrap(),
            PersistOutcome::StockExhausted
        );

        let stored = repo.voucher(VoucherId::new(1)).await.unwrap().unwrap();
        assert_eq!(stored.stock, 0);
        assert_eq!(repo.count_orders(VoucherId::new(1)).await.unwrap(), 1);
        assert_eq!(
            repo.buyers(VoucherId::new(1)).await.unwrap(),
            vec![UserId::new(1)]
        );
        assert!(repo.buyers(VoucherId::new(2)).await.unwrap().is_empty());
        assert_eq!(
            repo.find_order(UserId::new(1), VoucherId::new(1))
                .await
                .unwrap()
                .map(|o| o.order_id),
            Some(OrderId::new(10))
        );
    }

    #[tokio::test]
    async fn test_unknown_voucher_never_persists() {
        let repo = InMemoryOrderRepository::new();
        assert_eq!(
            repo.create_order(&order(1, 1)).await.unwrap(),
            PersistOutcome::StockExhausted
        );
        assert!(!repo.order_exists(UserId::new(1), VoucherId::new(1)).await.unwrap());
    }
}

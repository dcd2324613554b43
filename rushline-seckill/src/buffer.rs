//! In-process order buffer.
//!
//! A bounded channel between the admission path and a drain task. It is a
//! fallback for deployments without a stream-capable store and is NOT
//! durable: buffered requests are lost if the process stops, and nothing is
//! ever redelivered. Only the durable stream gives the at-most-one-order
//! guarantee under redelivery.

use rushline_core::{OrderError, OrderRequest, RushlineResult};
use std::sync::Mutex;
use tokio::sync::mpsc;

pub struct LocalOrderBuffer {
    tx: mpsc::Sender<OrderRequest>,
    rx: Mutex<Option<mpsc::Receiver<OrderRequest>>>,
    capacity: usize,
}

impl LocalOrderBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Requests buffered and not yet taken by the drain.
    pub fn len(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Push without waiting. A full or closed buffer is reported as
    /// `OrderError::QueueUnavailable`.
    pub fn try_push(&self, request: OrderRequest) -> RushlineResult<()> {
        self.tx.try_send(request).map_err(|e| {
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "local buffer full",
                mpsc::error::TrySendError::Closed(_) => "local buffer closed",
            };
            OrderError::QueueUnavailable {
                reason: reason.to_string(),
            }
            .into()
        })
    }

    /// Hand the receiving end to the drain. Only the first call gets it.
    pub fn take_receiver(&self) -> Option<mpsc::Receiver<OrderRequest>> {
        self.rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rushline_core::{OrderId, RushlineError, UserId, VoucherId};

    fn request(user: u64) -> OrderRequest {
        OrderRequest {
            order_id: OrderId::new(user),
            user_id: UserId::new(user),
            voucher_id: VoucherId::new(1),
            requested_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_push_and_drain_in_order() {
        let buffer = LocalOrderBuffer::new(4);
        buffer.try_push(request(1)).unwrap();
        buffer.try_push(request(2)).unwrap();
        assert_eq!(buffer.len(), 2);

        let mut rx = buffer.take_receiver().unwrap();
        assert_eq!(rx.recv().await.unwrap().user_id, UserId::new(1));
        assert_eq!(rx.recv().await.unwrap().user_id, UserId::new(2));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_full_buffer_rejects() {
        let buffer = LocalOrderBuffer::new(1);
        buffer.try_push(request(1)).unwrap();
        let err = buffer.try_push(request(2)).unwrap_err();
        assert!(matches!(
            err,
            RushlineError::Order(OrderError::QueueUnavailable { .. })
        ));
    }

    #[test]
    fn test_receiver_taken_once() {
        let buffer = LocalOrderBuffer::new(1);
        assert!(buffer.take_receiver().is_some());
        assert!(buffer.take_receiver().is_none());
    }
}

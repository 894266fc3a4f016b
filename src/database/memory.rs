//! In-memory [`ChainStore`] with the same observable semantics as the
//! Postgres store. Used by the test suite and by dry runs without a
//! database.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::chain_id::ChainId;
use crate::event::{Event, EventId, EventStatus};

use super::{ChainStore, InsertOutcome, StoreError};

#[derive(Default)]
struct Inner {
    events: HashMap<String, Event>,
    heights: HashMap<ChainId, u64>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChainStore for MemoryStore {
    async fn insert_event_if_not_exists(&self, event: &Event) -> Result<InsertOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.events.get_mut(event.id.as_str()) {
            None => {
                inner
                    .events
                    .insert(event.id.as_str().to_owned(), event.clone());
                Ok(InsertOutcome::Inserted)
            }
            Some(existing) if existing.status == EventStatus::Reorged => {
                existing.block_height = event.block_height;
                existing.status = EventStatus::PendingConfirmation;
                existing.confirmations = 0;
                existing.updated_at = Utc::now();
                Ok(InsertOutcome::Revived)
            }
            Some(_) => Ok(InsertOutcome::Exists),
        }
    }

    async fn get_event(&self, id: &EventId) -> Result<Option<Event>, StoreError> {
        Ok(self.inner.lock().await.events.get(id.as_str()).cloned())
    }

    async fn list_by_status(
        &self,
        chain: ChainId,
        statuses: &[EventStatus],
    ) -> Result<Vec<Event>, StoreError> {
        let inner = self.inner.lock().await;
        let mut events = inner
            .events
            .values()
            .filter(|e| e.chain == chain && statuses.contains(&e.status))
            .cloned()
            .collect::<Vec<_>>();
        events.sort_by(|a, b| {
            (a.block_height, a.id.as_str()).cmp(&(b.block_height, b.id.as_str()))
        });
        Ok(events)
    }

    async fn list_confirmed(&self, chain: ChainId) -> Result<Vec<Event>, StoreError> {
        self.list_by_status(
            chain,
            &[EventStatus::FastConfirmed, EventStatus::StandardConfirmed],
        )
        .await
    }

    async fn update_event(&self, event: &Event) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.events.get_mut(event.id.as_str()) {
            *existing = event.clone();
        }
        Ok(())
    }

    async fn update_chain_height(&self, chain: ChainId, height: u64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let entry = inner.heights.entry(chain).or_insert(0);
        *entry = (*entry).max(height);
        Ok(())
    }

    async fn get_chain_height(&self, chain: ChainId) -> Result<u64, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .heights
            .get(&chain)
            .copied()
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use ethers::types::H256;

    use crate::event::{ConfirmationClass, EventKind};

    use super::*;

    fn chain() -> ChainId {
        ChainId::new(11_155_111)
    }

    fn event(byte: u8, block: u64) -> Event {
        Event::new(
            EventId::new(H256::repeat_byte(byte), 0),
            chain(),
            block,
            EventKind::Inbound,
            ConfirmationClass::Fast,
            br#"{"k":1}"#.to_vec(),
        )
    }

    #[tokio::test]
    async fn insert_is_idempotent() {
        let store = MemoryStore::new();
        let e = event(1, 100);

        let outcomes = [
            store.insert_event_if_not_exists(&e).await.unwrap(),
            store.insert_event_if_not_exists(&e).await.unwrap(),
            store.insert_event_if_not_exists(&e).await.unwrap(),
        ];
        assert_eq!(
            outcomes,
            [
                InsertOutcome::Inserted,
                InsertOutcome::Exists,
                InsertOutcome::Exists
            ]
        );
        assert_eq!(outcomes.iter().filter(|o| o.stored()).count(), 1);

        let stored = store.get_event(&e.id).await.unwrap().unwrap();
        assert_eq!(stored.block_height, 100);
    }

    #[tokio::test]
    async fn reinsert_revives_reorged_event() {
        let store = MemoryStore::new();
        let mut e = event(1, 1000);
        store.insert_event_if_not_exists(&e).await.unwrap();

        e.transition(EventStatus::Reorged).unwrap();
        e.confirmations = 0;
        store.update_event(&e).await.unwrap();

        // Observed again, two blocks later.
        let mut observed = event(1, 1002);
        observed.confirmations = 0;
        let outcome = store.insert_event_if_not_exists(&observed).await.unwrap();
        assert_eq!(outcome, InsertOutcome::Revived);

        let stored = store.get_event(&e.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::PendingConfirmation);
        assert_eq!(stored.block_height, 1002);
        assert_eq!(stored.confirmations, 0);
    }

    #[tokio::test]
    async fn chain_height_is_monotonic() {
        let store = MemoryStore::new();
        assert_eq!(store.get_chain_height(chain()).await.unwrap(), 0);

        store.update_chain_height(chain(), 50).await.unwrap();
        store.update_chain_height(chain(), 40).await.unwrap();
        assert_eq!(store.get_chain_height(chain()).await.unwrap(), 50);

        store.update_chain_height(chain(), 51).await.unwrap();
        assert_eq!(store.get_chain_height(chain()).await.unwrap(), 51);
    }

    #[tokio::test]
    async fn list_by_status_filters_and_orders() {
        let store = MemoryStore::new();
        let mut a = event(1, 300);
        let mut b = event(2, 100);
        let c = event(3, 200);
        store.insert_event_if_not_exists(&a).await.unwrap();
        store.insert_event_if_not_exists(&b).await.unwrap();
        store.insert_event_if_not_exists(&c).await.unwrap();

        a.transition(EventStatus::FastConfirmed).unwrap();
        store.update_event(&a).await.unwrap();
        b.transition(EventStatus::Failed).unwrap();
        store.update_event(&b).await.unwrap();

        let pending = store
            .list_by_status(chain(), &[EventStatus::PendingConfirmation])
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, c.id);

        let confirmed = store.list_confirmed(chain()).await.unwrap();
        assert_eq!(confirmed.len(), 1);
        assert_eq!(confirmed[0].id, a.id);

        // Another chain sees nothing.
        let other = store
            .list_by_status(ChainId::new(1), &[EventStatus::PendingConfirmation])
            .await
            .unwrap();
        assert!(other.is_empty());
    }
}

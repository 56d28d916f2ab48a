use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::domain::core::{
    BookingId, RescheduleRequest, RescheduleRequestEvent, RescheduleRequestId,
    RescheduleRequestRepository, RescheduleStatus,
};
use crate::domain::{Aggregation, DataAccessError, Entity};

/// インメモリ日時変更リクエストリポジトリ
#[derive(Clone, Default)]
pub struct MemoryRescheduleRequestRepository {
    inner: Arc<Mutex<RequestTable>>,
}

#[derive(Default)]
struct RequestTable {
    rows: HashMap<RescheduleRequestId, RescheduleRequest>,
    log: Vec<RescheduleRequestEvent>,
}

impl MemoryRescheduleRequestRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> Result<MutexGuard<'_, RequestTable>, DataAccessError> {
        self.inner
            .lock()
            .map_err(|e| DataAccessError::ConnectionError(e.to_string().into()))
    }
}

#[async_trait]
impl RescheduleRequestRepository for MemoryRescheduleRequestRepository {
    async fn find_by_id(
        &self,
        id: RescheduleRequestId,
    ) -> Result<Option<RescheduleRequest>, DataAccessError> {
        Ok(self.table()?.rows.get(&id).cloned())
    }

    async fn find_pending_by_booking(
        &self,
        booking_id: BookingId,
    ) -> Result<Option<RescheduleRequest>, DataAccessError> {
        Ok(self
            .table()?
            .rows
            .values()
            .find(|r| r.booking_id() == booking_id && r.status() == RescheduleStatus::Pending)
            .cloned())
    }

    async fn list_by_booking(
        &self,
        booking_id: BookingId,
    ) -> Result<Vec<RescheduleRequest>, DataAccessError> {
        let table = self.table()?;
        let mut requests: Vec<RescheduleRequest> = table
            .rows
            .values()
            .filter(|r| r.booking_id() == booking_id)
            .cloned()
            .collect();
        requests.sort_by_key(|r| r.requested_at());
        Ok(requests)
    }

    async fn save(&self, entity: &mut RescheduleRequest) -> Result<bool, DataAccessError> {
        if entity.peek().is_none() {
            return Ok(false);
        }
        let mut table = self.table()?;
        // 読み取り時点より進んだ行への上書きは拒否する
        if let Some(current) = table.rows.get(&entity.id()) {
            if current.revision() != entity.revision() {
                return Err(DataAccessError::RevisionConflict {
                    expected: entity.revision(),
                    current: current.revision(),
                });
            }
        }
        // 保留中のリクエストは予約ごとに高々一件。判定と挿入は同じ
        // ロックの中で行う。
        if entity.status() == RescheduleStatus::Pending
            && table.rows.values().any(|r| {
                r.booking_id() == entity.booking_id()
                    && r.id() != entity.id()
                    && r.status() == RescheduleStatus::Pending
            })
        {
            return Err(DataAccessError::ConstraintViolation(
                format!(
                    "booking {} already has a pending reschedule request",
                    entity.booking_id()
                )
                .into(),
            ));
        }
        let events = entity.pop_all();
        entity.set_revision(entity.revision() + 1);
        table.log.extend(events);
        table.rows.insert(entity.id(), entity.clone());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use crate::domain::core::{AdminId, SlotId};

    use super::*;

    fn request(id: u64, booking: u64) -> RescheduleRequest {
        RescheduleRequest::create(
            RescheduleRequestId::from(id),
            BookingId::from(booking),
            SlotId::from(10),
            SlotId::from(20),
            "都合変更".to_owned(),
            Utc::now(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_repository_roundtrip() {
        let repo = MemoryRescheduleRequestRepository::new();
        let mut entity = request(1, 100);
        assert!(repo.save(&mut entity).await.unwrap());

        let found = repo
            .find_by_id(RescheduleRequestId::from(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found, entity);
    }

    #[tokio::test]
    async fn test_find_pending_by_booking() {
        let repo = MemoryRescheduleRequestRepository::new();
        let mut first = request(1, 100);
        first.decline(AdminId::from(1), None, Utc::now()).unwrap();
        repo.save(&mut first).await.unwrap();
        repo.save(&mut request(2, 100)).await.unwrap();
        repo.save(&mut request(3, 200)).await.unwrap();

        let pending = repo
            .find_pending_by_booking(BookingId::from(100))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pending.id(), RescheduleRequestId::from(2));

        let history = repo.list_by_booking(BookingId::from(100)).await.unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn test_save_enforces_single_pending_per_booking() {
        let repo = MemoryRescheduleRequestRepository::new();
        repo.save(&mut request(1, 100)).await.unwrap();

        // 同じ予約に二件目の保留中リクエストは挿入できない
        let result = repo.save(&mut request(2, 100)).await;
        assert!(matches!(
            result,
            Err(DataAccessError::ConstraintViolation(_))
        ));
        assert_eq!(repo.list_by_booking(BookingId::from(100)).await.unwrap().len(), 1);

        // 先行リクエストが終端になれば受け付ける
        let mut first = repo
            .find_by_id(RescheduleRequestId::from(1))
            .await
            .unwrap()
            .unwrap();
        first.decline(AdminId::from(1), None, Utc::now()).unwrap();
        repo.save(&mut first).await.unwrap();
        repo.save(&mut request(2, 100)).await.unwrap();
    }
}

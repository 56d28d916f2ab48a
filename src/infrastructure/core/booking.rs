use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::domain::core::{
    Booking, BookingEvent, BookingId, BookingReference, BookingRepository, CustomerId,
};
use crate::domain::{Aggregation, DataAccessError, Entity};

/// インメモリ予約台帳リポジトリ
///
/// 予約は物理削除されないため行の削除経路はない。
#[derive(Clone, Default)]
pub struct MemoryBookingRepository {
    inner: Arc<Mutex<BookingTable>>,
}

#[derive(Default)]
struct BookingTable {
    rows: HashMap<BookingId, Booking>,
    log: Vec<BookingEvent>,
}

impl MemoryBookingRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> Result<MutexGuard<'_, BookingTable>, DataAccessError> {
        self.inner
            .lock()
            .map_err(|e| DataAccessError::ConnectionError(e.to_string().into()))
    }

    /// 確定済みイベント数(テスト用)
    pub fn committed_events(&self) -> usize {
        self.inner.lock().map(|t| t.log.len()).unwrap_or(0)
    }
}

#[async_trait]
impl BookingRepository for MemoryBookingRepository {
    async fn find_by_id(&self, id: BookingId) -> Result<Option<Booking>, DataAccessError> {
        Ok(self.table()?.rows.get(&id).cloned())
    }

    async fn find_by_reference(
        &self,
        reference: &BookingReference,
    ) -> Result<Option<Booking>, DataAccessError> {
        Ok(self
            .table()?
            .rows
            .values()
            .find(|b| b.reference() == reference)
            .cloned())
    }

    async fn list_by_customer(
        &self,
        customer_id: CustomerId,
    ) -> Result<Vec<Booking>, DataAccessError> {
        let table = self.table()?;
        let mut bookings: Vec<Booking> = table
            .rows
            .values()
            .filter(|b| b.customer_id() == customer_id)
            .cloned()
            .collect();
        bookings.sort_by_key(|b| *b.id());
        Ok(bookings)
    }

    async fn save(&self, entity: &mut Booking) -> Result<bool, DataAccessError> {
        if entity.peek().is_none() {
            return Ok(false);
        }
        let mut table = self.table()?;
        // 読み取り時点より進んだ行への上書きは拒否する。終端まで進んだ
        // 予約が古いコピーの保存で巻き戻ることはない。
        if let Some(current) = table.rows.get(&entity.id()) {
            if current.revision() != entity.revision() {
                return Err(DataAccessError::RevisionConflict {
                    expected: entity.revision(),
                    current: current.revision(),
                });
            }
        }
        let events = entity.pop_all();
        entity.set_revision(entity.revision() + 1);
        table.log.extend(events);
        table.rows.insert(entity.id(), entity.clone());
        Ok(true)
    }
}

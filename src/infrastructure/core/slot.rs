use std::collections::HashMap;
use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::domain::core::{
    Slot, SlotEvent, SlotId, SlotRepository, SlotStatus, SlotTransitionError,
};
use crate::domain::{Aggregation, DataAccessError, Entity};

/// インメモリ予約枠リポジトリ
///
/// 一つのロックの下でスナップショットと確定済みイベントログを保持する。
/// `transition` の比較と書き込みは同じロックの中で行われるため、単一の
/// 不可分な条件付き更新になる。
#[derive(Clone, Default)]
pub struct MemorySlotRepository {
    inner: Arc<Mutex<SlotTable>>,
}

#[derive(Default)]
struct SlotTable {
    rows: HashMap<SlotId, Slot>,
    log: Vec<SlotEvent>,
}

impl MemorySlotRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> Result<MutexGuard<'_, SlotTable>, DataAccessError> {
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
impl SlotRepository for MemorySlotRepository {
    async fn find_by_id(&self, id: SlotId) -> Result<Option<Slot>, DataAccessError> {
        Ok(self.table()?.rows.get(&id).cloned())
    }

    async fn list_available(
        &self,
        range: Range<NaiveDate>,
    ) -> Result<Vec<Slot>, DataAccessError> {
        let table = self.table()?;
        let mut slots: Vec<Slot> = table
            .rows
            .values()
            .filter(|s| s.status() == SlotStatus::Available && range.contains(&s.date()))
            .cloned()
            .collect();
        slots.sort_by_key(|s| (s.date(), s.start_time()));
        Ok(slots)
    }

    async fn save(&self, entity: &mut Slot) -> Result<bool, DataAccessError> {
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
        let events = entity.pop_all();
        entity.set_revision(entity.revision() + 1);
        table.log.extend(events);
        table.rows.insert(entity.id(), entity.clone());
        Ok(true)
    }

    async fn transition(
        &self,
        id: SlotId,
        from: SlotStatus,
        to: SlotStatus,
    ) -> Result<(), SlotTransitionError> {
        let mut table = self.table().map_err(SlotTransitionError::from)?;
        let slot = table.rows.get_mut(&id).ok_or(SlotTransitionError::NotFound)?;
        if slot.status() != from {
            return Err(SlotTransitionError::Conflict {
                current: slot.status(),
            });
        }
        slot.change_status(to)?;
        let revision = slot.revision() + 1;
        slot.set_revision(revision);
        let events = slot.pop_all();
        table.log.extend(events);
        Ok(())
    }
}

use std::ops::Range;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use derive_more::{Deref, Display, Error, From, IntoIterator};
use serde::{Deserialize, Serialize};

use crate::domain::{Aggregation, DataAccessError, Entity, Event, EventQueue, Id};

/// 予約枠リポジトリ
///
/// 枠への書き込みは予約・キャンセル・日時変更の各エグゼキューター経由に限る。
#[async_trait]
pub trait SlotRepository {
    /// IDで予約枠を検索する
    async fn find_by_id(&self, id: SlotId) -> Result<Option<Slot>, DataAccessError>;
    /// 期間内の空き枠を日付・開始時刻順で取得する
    async fn list_available(&self, range: Range<NaiveDate>) -> Result<Vec<Slot>, DataAccessError>;
    /// 予約枠を保存する
    async fn save(&self, entity: &mut Slot) -> Result<bool, DataAccessError>;
    /// ステータスの条件付き更新
    ///
    /// 現在のステータスが `from` と一致する場合に限り `to` へ更新する。
    /// 比較と書き込みは単一の不可分な更新であり、同じ枠を奪い合う
    /// 呼び出しのうち成功するのは常に一つだけとなる。
    async fn transition(
        &self,
        id: SlotId,
        from: SlotStatus,
        to: SlotStatus,
    ) -> Result<(), SlotTransitionError>;
}

/// 予約枠ID
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Deref, Default,
)]
pub struct SlotId(u64);

impl Id for SlotId {
    type Inner = u64;
}

/// 予約枠イベント
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotEvent {
    /// 予約枠が作成された
    SlotCreated {
        id: SlotId,
        date: NaiveDate,
        start_time: NaiveTime,
        end_time: NaiveTime,
    },
    /// 予約枠のステータスが変更された
    SlotStatusChanged {
        id: SlotId,
        from: SlotStatus,
        to: SlotStatus,
    },
}

impl Event for SlotEvent {
    type Id = SlotId;
}

/// 予約枠エンティティ
///
/// 洗車スケジュールの一区画。ステータスの唯一の正は `status` フィールドで
/// あり、予約数などの冗長なカウンターは持たない。
#[derive(Debug, Default, Clone, IntoIterator, Serialize, Deserialize)]
pub struct Slot {
    id: SlotId,
    date: NaiveDate,
    start_time: NaiveTime,
    end_time: NaiveTime,
    status: SlotStatus,
    #[serde(default)]
    revision: u64,
    #[serde(skip)]
    #[into_iterator]
    events: EventQueue<SlotEvent>,
}

impl Slot {
    pub fn create(
        id: SlotId,
        date: NaiveDate,
        start_time: NaiveTime,
        end_time: NaiveTime,
    ) -> Result<Self, SlotError> {
        Self::validate_window(&start_time, &end_time)?;
        let mut entity = Slot {
            id,
            date,
            start_time,
            end_time,
            ..Slot::default()
        };
        entity.events.push(SlotEvent::SlotCreated {
            id,
            date,
            start_time,
            end_time,
        });
        Ok(entity)
    }

    pub fn change_status(&mut self, status: SlotStatus) -> Result<(), SlotError> {
        self.validate_status(&status)?;
        let from = self.status;
        self.status = status;
        self.events.push(SlotEvent::SlotStatusChanged {
            id: self.id,
            from,
            to: status,
        });
        Ok(())
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn start_time(&self) -> NaiveTime {
        self.start_time
    }

    pub fn end_time(&self) -> NaiveTime {
        self.end_time
    }

    pub fn status(&self) -> SlotStatus {
        self.status
    }

    /// お客様向け表記
    pub fn window(&self) -> String {
        format!(
            "{} {}-{}",
            self.date,
            self.start_time.format("%H:%M"),
            self.end_time.format("%H:%M")
        )
    }

    fn validate_id(&self, id: &SlotId) -> Result<(), SlotError> {
        match self.id == *id {
            true => Ok(()),
            false => Err(SlotError::MismatchedId),
        }
    }

    fn validate_window(start_time: &NaiveTime, end_time: &NaiveTime) -> Result<(), SlotError> {
        if start_time >= end_time {
            return Err(SlotError::InvalidWindow);
        }
        Ok(())
    }

    pub fn validate_status(&self, status: &SlotStatus) -> Result<(), SlotError> {
        match (&self.status, status) {
            (SlotStatus::Available, SlotStatus::Booked)
            | (SlotStatus::Booked, SlotStatus::Available)
            | (SlotStatus::Available, SlotStatus::Blocked)
            | (SlotStatus::Booked, SlotStatus::Blocked)
            | (SlotStatus::Blocked, SlotStatus::Available) => Ok(()),
            _ => Err(SlotError::InvalidStatusTransition),
        }
    }
}

impl Entity for Slot {
    type Id = SlotId;

    const ENTITY_NAME: &'static str = "slot";

    fn id(&self) -> Self::Id {
        self.id
    }
}

impl Aggregation for Slot {
    type Event = SlotEvent;
    type Error = SlotError;

    fn revision(&self) -> u64 {
        self.revision
    }

    fn set_revision(&mut self, revision: u64) {
        self.revision = revision;
    }

    fn validate(&self, event: &Self::Event) -> Result<(), Self::Error> {
        match event {
            SlotEvent::SlotCreated {
                start_time,
                end_time,
                ..
            } => Self::validate_window(start_time, end_time),
            SlotEvent::SlotStatusChanged { id, to, .. } => {
                self.validate_id(id)?;
                self.validate_status(to)
            }
        }
    }

    fn apply(&mut self, event: Self::Event) {
        match event {
            SlotEvent::SlotCreated {
                id,
                date,
                start_time,
                end_time,
            } => {
                if self.id != id {
                    if let Ok(entity) = Self::create(id, date, start_time, end_time) {
                        *self = entity;
                    }
                }
            }
            SlotEvent::SlotStatusChanged { id, to, .. } => {
                if self.id == id {
                    if let Err(_e) = self.change_status(to) {}
                }
            }
        }
    }

    fn events(&self) -> &EventQueue<Self::Event> {
        &self.events
    }

    fn events_mut(&mut self) -> &mut EventQueue<Self::Event> {
        &mut self.events
    }
}

impl PartialEq for Slot {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.date == other.date
            && self.start_time == other.start_time
            && self.end_time == other.end_time
            && self.status == other.status
    }
}

impl Eq for Slot {}

/// 予約枠エラー
#[derive(Error, Display, Debug)]
pub enum SlotError {
    #[display(fmt = "Mismatched id")]
    MismatchedId,
    #[display(fmt = "Slot window must start before it ends")]
    InvalidWindow,
    #[display(fmt = "Invalid status transition")]
    InvalidStatusTransition,
}

/// 条件付き更新の失敗
///
/// `Conflict` は同じ枠を巡る競争に負けただけであり、呼び出し側にとって
/// 回復可能な通常の結果として扱う。
#[derive(Error, Display, Debug)]
pub enum SlotTransitionError {
    #[display(fmt = "Slot not found")]
    NotFound,
    #[display(fmt = "Slot status conflict (current: {:?})", current)]
    Conflict { current: SlotStatus },
    #[display(fmt = "Slot error: {}", _0)]
    SlotError(#[error(source)] SlotError),
    #[display(fmt = "Data access error: {}", _0)]
    DataAccess(#[error(source)] DataAccessError),
}

impl From<SlotError> for SlotTransitionError {
    fn from(value: SlotError) -> Self {
        Self::SlotError(value)
    }
}

impl From<DataAccessError> for SlotTransitionError {
    fn from(value: DataAccessError) -> Self {
        Self::DataAccess(value)
    }
}

/// 予約枠ステータス
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotStatus {
    /// 空き
    Available,
    /// 予約済み
    Booked,
    /// 受付停止
    Blocked,
}

impl Default for SlotStatus {
    fn default() -> Self {
        SlotStatus::Available
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot() -> Slot {
        Slot::create(
            SlotId::from(1),
            NaiveDate::from_ymd_opt(2023, 4, 1).unwrap(),
            NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(11, 0, 0).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_slot_create() {
        let slot = slot();
        assert_eq!(slot.status(), SlotStatus::Available);
        assert_eq!(slot.window(), "2023-04-01 10:00-11:00");
    }

    #[test]
    fn test_slot_create_invalid_window() {
        let result = Slot::create(
            SlotId::from(1),
            NaiveDate::from_ymd_opt(2023, 4, 1).unwrap(),
            NaiveTime::from_hms_opt(11, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
        );
        assert!(matches!(result, Err(SlotError::InvalidWindow)));
    }

    #[test]
    fn test_slot_status_transitions() {
        let mut slot = slot();
        slot.change_status(SlotStatus::Booked).unwrap();
        assert_eq!(slot.status(), SlotStatus::Booked);
        slot.change_status(SlotStatus::Available).unwrap();
        slot.change_status(SlotStatus::Blocked).unwrap();
        slot.change_status(SlotStatus::Available).unwrap();

        // 停止中の枠は直接予約済みにはできない
        slot.change_status(SlotStatus::Blocked).unwrap();
        assert!(matches!(
            slot.change_status(SlotStatus::Booked),
            Err(SlotError::InvalidStatusTransition)
        ));
    }

    #[test]
    fn test_slot_status_change_records_event() {
        let mut slot = slot();
        slot.clear();
        slot.change_status(SlotStatus::Booked).unwrap();
        assert_eq!(
            slot.pop(),
            Some(SlotEvent::SlotStatusChanged {
                id: SlotId::from(1),
                from: SlotStatus::Available,
                to: SlotStatus::Booked,
            })
        );
    }
}

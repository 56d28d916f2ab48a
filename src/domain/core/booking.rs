use async_trait::async_trait;
use chrono::{DateTime, Utc};
use derive_more::{Deref, Display, Error, From, IntoIterator};
use serde::{Deserialize, Serialize};

use crate::domain::{Aggregation, DataAccessError, Entity, Event, EventQueue, Id};

use super::{Actor, CustomerId, Money, SlotId};

/// 予約台帳リポジトリ
///
/// 予約は監査のため物理削除しない。削除APIは意図的に存在しない。
#[async_trait]
pub trait BookingRepository {
    /// IDで予約を検索する
    async fn find_by_id(&self, id: BookingId) -> Result<Option<Booking>, DataAccessError>;
    /// 予約番号で予約を検索する
    async fn find_by_reference(
        &self,
        reference: &BookingReference,
    ) -> Result<Option<Booking>, DataAccessError>;
    /// お客様の予約をID順で取得する
    async fn list_by_customer(
        &self,
        customer_id: CustomerId,
    ) -> Result<Vec<Booking>, DataAccessError>;
    /// 予約を保存する
    async fn save(&self, entity: &mut Booking) -> Result<bool, DataAccessError>;
}

/// 予約ID
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Deref, Default,
)]
pub struct BookingId(u64);

impl Id for BookingId {
    type Inner = u64;
}

/// 予約番号
///
/// お客様への案内に使う一意な文字列。予約IDから作成時に一度だけ生成される。
#[derive(
    Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Deref, Default,
)]
pub struct BookingReference(String);

impl From<BookingId> for BookingReference {
    fn from(value: BookingId) -> Self {
        Self(format!("MG-{}", to_base36(*value)))
    }
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
    if n == 0 {
        return "0".to_owned();
    }
    let mut buf = Vec::new();
    while n > 0 {
        buf.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    buf.reverse();
    String::from_utf8(buf).unwrap()
}

/// 予約イベント
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingEvent {
    /// 予約が作成された
    BookingCreated {
        id: BookingId,
        reference: BookingReference,
        customer_id: CustomerId,
        slot_id: SlotId,
        price: Money,
        status: BookingStatus,
        notes: Option<String>,
        actor: Actor,
        at: DateTime<Utc>,
    },
    /// 予約のステータスが変更された
    BookingStatusChanged {
        id: BookingId,
        from: BookingStatus,
        to: BookingStatus,
        actor: Actor,
        reason: Option<String>,
        at: DateTime<Utc>,
    },
    /// 予約の枠が変更された
    BookingSlotChanged {
        id: BookingId,
        from_slot: SlotId,
        to_slot: SlotId,
        actor: Actor,
        at: DateTime<Utc>,
    },
}

impl Event for BookingEvent {
    type Id = BookingId;
}

/// 予約履歴エントリ
///
/// 追記のみ。既存のエントリが書き換えられることはない。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingHistoryEntry {
    pub from: Option<BookingStatus>,
    pub to: BookingStatus,
    pub slot_id: SlotId,
    pub at: DateTime<Utc>,
    pub actor: Actor,
    pub reason: Option<String>,
}

/// 予約エンティティ
///
/// 一つの予約は常に一つの枠に紐づく。料金は作成時のスナップショットで
/// あり、外部の料金が変わっても再計算されない。
#[derive(Debug, Default, Clone, IntoIterator, Serialize, Deserialize)]
pub struct Booking {
    id: BookingId,
    reference: BookingReference,
    customer_id: CustomerId,
    slot_id: SlotId,
    price: Money,
    status: BookingStatus,
    notes: Option<String>,
    reschedule_count: u32,
    status_changed_at: DateTime<Utc>,
    status_reason: Option<String>,
    history: Vec<BookingHistoryEntry>,
    #[serde(default)]
    revision: u64,
    #[serde(skip)]
    #[into_iterator]
    events: EventQueue<BookingEvent>,
}

impl Booking {
    /// セルフサービス予約を作成する(確定済みで始まる)
    pub fn create(
        id: BookingId,
        customer_id: CustomerId,
        slot_id: SlotId,
        price: Money,
        notes: Option<String>,
        actor: Actor,
        at: DateTime<Utc>,
    ) -> Self {
        Self::create_with_status(
            id,
            customer_id,
            slot_id,
            price,
            notes,
            BookingStatus::Confirmed,
            actor,
            at,
        )
    }

    /// 外部決済の完了待ち予約を作成する
    pub fn create_pending(
        id: BookingId,
        customer_id: CustomerId,
        slot_id: SlotId,
        price: Money,
        notes: Option<String>,
        actor: Actor,
        at: DateTime<Utc>,
    ) -> Self {
        Self::create_with_status(
            id,
            customer_id,
            slot_id,
            price,
            notes,
            BookingStatus::Pending,
            actor,
            at,
        )
    }

    fn create_with_status(
        id: BookingId,
        customer_id: CustomerId,
        slot_id: SlotId,
        price: Money,
        notes: Option<String>,
        status: BookingStatus,
        actor: Actor,
        at: DateTime<Utc>,
    ) -> Self {
        let reference = BookingReference::from(id);
        let mut entity = Booking {
            id,
            reference: reference.clone(),
            customer_id,
            slot_id,
            price,
            status,
            notes: notes.clone(),
            status_changed_at: at,
            history: vec![BookingHistoryEntry {
                from: None,
                to: status,
                slot_id,
                at,
                actor,
                reason: None,
            }],
            ..Booking::default()
        };
        entity.events.push(BookingEvent::BookingCreated {
            id,
            reference,
            customer_id,
            slot_id,
            price,
            status,
            notes,
            actor,
            at,
        });
        entity
    }

    pub fn confirm(&mut self, actor: Actor, at: DateTime<Utc>) -> Result<(), BookingError> {
        self.change_status(BookingStatus::Confirmed, actor, None, at)
    }

    pub fn start(&mut self, actor: Actor, at: DateTime<Utc>) -> Result<(), BookingError> {
        self.change_status(BookingStatus::InProgress, actor, None, at)
    }

    pub fn complete(&mut self, actor: Actor, at: DateTime<Utc>) -> Result<(), BookingError> {
        self.change_status(BookingStatus::Completed, actor, None, at)
    }

    pub fn cancel(
        &mut self,
        actor: Actor,
        reason: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<(), BookingError> {
        self.change_status(BookingStatus::Cancelled, actor, reason, at)
    }

    pub fn mark_no_show(&mut self, actor: Actor, at: DateTime<Utc>) -> Result<(), BookingError> {
        self.change_status(BookingStatus::NoShow, actor, None, at)
    }

    /// ステータスを変更する
    ///
    /// 遷移グラフ外の変更は何も書き換えずに失敗する。成功時は履歴に
    /// ちょうど一件のエントリが追記される。
    pub fn change_status(
        &mut self,
        status: BookingStatus,
        actor: Actor,
        reason: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<(), BookingError> {
        self.validate_status(&status)?;
        let from = self.status;
        self.history.push(BookingHistoryEntry {
            from: Some(from),
            to: status,
            slot_id: self.slot_id,
            at,
            actor,
            reason: reason.clone(),
        });
        self.status = status;
        self.status_changed_at = at;
        self.status_reason = reason.clone();
        self.events.push(BookingEvent::BookingStatusChanged {
            id: self.id,
            from,
            to: status,
            actor,
            reason,
            at,
        });
        Ok(())
    }

    /// 紐づく枠を付け替える(日時変更の承認時のみ)
    pub fn change_slot(
        &mut self,
        slot_id: SlotId,
        actor: Actor,
        at: DateTime<Utc>,
    ) -> Result<(), BookingError> {
        self.validate_slot_changed(&slot_id)?;
        let from_slot = self.slot_id;
        self.history.push(BookingHistoryEntry {
            from: Some(self.status),
            to: self.status,
            slot_id,
            at,
            actor,
            reason: None,
        });
        self.slot_id = slot_id;
        self.reschedule_count += 1;
        self.status_changed_at = at;
        self.events.push(BookingEvent::BookingSlotChanged {
            id: self.id,
            from_slot,
            to_slot: slot_id,
            actor,
            at,
        });
        Ok(())
    }

    pub fn reference(&self) -> &BookingReference {
        &self.reference
    }

    pub fn customer_id(&self) -> CustomerId {
        self.customer_id
    }

    pub fn slot_id(&self) -> SlotId {
        self.slot_id
    }

    pub fn price(&self) -> &Money {
        &self.price
    }

    pub fn status(&self) -> BookingStatus {
        self.status
    }

    pub fn notes(&self) -> Option<&str> {
        self.notes.as_deref()
    }

    pub fn reschedule_count(&self) -> u32 {
        self.reschedule_count
    }

    pub fn status_changed_at(&self) -> DateTime<Utc> {
        self.status_changed_at
    }

    pub fn status_reason(&self) -> Option<&str> {
        self.status_reason.as_deref()
    }

    pub fn history(&self) -> &[BookingHistoryEntry] {
        &self.history
    }

    fn validate_id(&self, id: &BookingId) -> Result<(), BookingError> {
        match self.id == *id {
            true => Ok(()),
            false => Err(BookingError::MismatchedId),
        }
    }

    fn validate_status(&self, status: &BookingStatus) -> Result<(), BookingError> {
        if self.status.is_terminal() {
            return Err(BookingError::AlreadyTerminal {
                status: self.status,
            });
        }
        match (&self.status, status) {
            (BookingStatus::Pending, BookingStatus::Confirmed)
            | (BookingStatus::Confirmed, BookingStatus::InProgress)
            | (BookingStatus::Confirmed, BookingStatus::Cancelled)
            | (BookingStatus::Confirmed, BookingStatus::NoShow)
            | (BookingStatus::InProgress, BookingStatus::Completed)
            | (BookingStatus::InProgress, BookingStatus::Cancelled) => Ok(()),
            _ => Err(BookingError::InvalidTransition {
                from: self.status,
                to: *status,
            }),
        }
    }

    fn validate_slot_changed(&self, slot_id: &SlotId) -> Result<(), BookingError> {
        if self.status != BookingStatus::Confirmed {
            return Err(BookingError::NotReschedulable {
                status: self.status,
            });
        }
        if self.slot_id == *slot_id {
            return Err(BookingError::SameSlot);
        }
        Ok(())
    }
}

impl Entity for Booking {
    type Id = BookingId;

    const ENTITY_NAME: &'static str = "booking";

    fn id(&self) -> Self::Id {
        self.id
    }
}

impl Aggregation for Booking {
    type Event = BookingEvent;
    type Error = BookingError;

    fn revision(&self) -> u64 {
        self.revision
    }

    fn set_revision(&mut self, revision: u64) {
        self.revision = revision;
    }

    fn validate(&self, event: &Self::Event) -> Result<(), Self::Error> {
        match event {
            BookingEvent::BookingCreated { .. } => Ok(()),
            BookingEvent::BookingStatusChanged { id, to, .. } => {
                self.validate_id(id)?;
                self.validate_status(to)
            }
            BookingEvent::BookingSlotChanged { id, to_slot, .. } => {
                self.validate_id(id)?;
                self.validate_slot_changed(to_slot)
            }
        }
    }

    fn apply(&mut self, event: Self::Event) {
        match event {
            BookingEvent::BookingCreated {
                id,
                customer_id,
                slot_id,
                price,
                status,
                notes,
                actor,
                at,
                ..
            } => {
                if self.id != id {
                    *self = Self::create_with_status(
                        id,
                        customer_id,
                        slot_id,
                        price,
                        notes,
                        status,
                        actor,
                        at,
                    );
                }
            }
            BookingEvent::BookingStatusChanged {
                id,
                to,
                actor,
                reason,
                at,
                ..
            } => {
                if self.id == id {
                    if let Err(_e) = self.change_status(to, actor, reason, at) {}
                }
            }
            BookingEvent::BookingSlotChanged {
                id,
                to_slot,
                actor,
                at,
                ..
            } => {
                if self.id == id {
                    if let Err(_e) = self.change_slot(to_slot, actor, at) {}
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

impl PartialEq for Booking {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.reference == other.reference
            && self.customer_id == other.customer_id
            && self.slot_id == other.slot_id
            && self.price == other.price
            && self.status == other.status
            && self.reschedule_count == other.reschedule_count
            && self.history == other.history
    }
}

impl Eq for Booking {}

/// 予約エラー
#[derive(Error, Display, Debug)]
pub enum BookingError {
    #[display(fmt = "Mismatched id")]
    MismatchedId,
    #[display(fmt = "Invalid status transition: {:?} -> {:?}", from, to)]
    InvalidTransition {
        from: BookingStatus,
        to: BookingStatus,
    },
    #[display(fmt = "Booking is already terminal ({:?})", status)]
    AlreadyTerminal { status: BookingStatus },
    #[display(fmt = "Booking cannot be rescheduled while {:?}", status)]
    NotReschedulable { status: BookingStatus },
    #[display(fmt = "Requested slot is the current slot")]
    SameSlot,
}

/// 予約ステータス
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    /// 決済確認待ち
    Pending,
    /// 確定
    Confirmed,
    /// 作業中
    InProgress,
    /// 完了
    Completed,
    /// キャンセル
    Cancelled,
    /// 来店なし
    NoShow,
}

impl BookingStatus {
    /// 終端ステータスかどうか
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BookingStatus::Completed | BookingStatus::Cancelled | BookingStatus::NoShow
        )
    }
}

impl Default for BookingStatus {
    fn default() -> Self {
        BookingStatus::Pending
    }
}

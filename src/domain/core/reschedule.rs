use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use derive_more::{Deref, Display, Error, From, IntoIterator};
use serde::{Deserialize, Serialize};

use crate::domain::{Aggregation, DataAccessError, Entity, Event, EventQueue, Id};

use super::{AdminId, BookingId, SlotId};

/// リクエストの有効期限(日数)
pub const EXPIRY_DAYS: i64 = 7;

/// 日時変更リクエストリポジトリ
#[async_trait]
pub trait RescheduleRequestRepository {
    /// IDでリクエストを検索する
    async fn find_by_id(
        &self,
        id: RescheduleRequestId,
    ) -> Result<Option<RescheduleRequest>, DataAccessError>;
    /// 予約に紐づく保留中のリクエストを検索する
    ///
    /// 保留中のリクエストは予約ごとに高々一件。
    async fn find_pending_by_booking(
        &self,
        booking_id: BookingId,
    ) -> Result<Option<RescheduleRequest>, DataAccessError>;
    /// 予約に紐づく全リクエストを取得する
    async fn list_by_booking(
        &self,
        booking_id: BookingId,
    ) -> Result<Vec<RescheduleRequest>, DataAccessError>;
    /// リクエストを保存する
    async fn save(&self, entity: &mut RescheduleRequest) -> Result<bool, DataAccessError>;
}

/// 日時変更リクエストID
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Deref, Default,
)]
pub struct RescheduleRequestId(u64);

impl Id for RescheduleRequestId {
    type Inner = u64;
}

/// 日時変更リクエストイベント
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RescheduleRequestEvent {
    /// 日時変更がリクエストされた
    RescheduleRequested {
        id: RescheduleRequestId,
        booking_id: BookingId,
        original_slot_id: SlotId,
        requested_slot_id: SlotId,
        reason: String,
        requested_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    },
    /// リクエストが承認された
    RescheduleApproved {
        id: RescheduleRequestId,
        admin_id: AdminId,
        notes: Option<String>,
        at: DateTime<Utc>,
    },
    /// リクエストが却下された
    RescheduleDeclined {
        id: RescheduleRequestId,
        admin_id: AdminId,
        notes: Option<String>,
        at: DateTime<Utc>,
    },
    /// リクエストがお客様により取り下げられた
    RescheduleCancelled {
        id: RescheduleRequestId,
        at: DateTime<Utc>,
    },
    /// リクエストが期限切れになった
    RescheduleExpired {
        id: RescheduleRequestId,
        at: DateTime<Utc>,
    },
}

impl Event for RescheduleRequestEvent {
    type Id = RescheduleRequestId;
}

/// 管理者の回答
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminResponse {
    pub admin_id: AdminId,
    pub notes: Option<String>,
    pub responded_at: DateTime<Utc>,
}

/// 日時変更リクエストエンティティ
///
/// 確定済み予約の上に重なる二次ステートマシン。リクエストが保留中の間も
/// 希望枠は他のお客様に開放されたままであり、承認時に改めて確保される。
#[derive(Debug, Default, Clone, IntoIterator, Serialize, Deserialize)]
pub struct RescheduleRequest {
    id: RescheduleRequestId,
    booking_id: BookingId,
    original_slot_id: SlotId,
    requested_slot_id: SlotId,
    reason: String,
    status: RescheduleStatus,
    requested_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    response: Option<AdminResponse>,
    #[serde(default)]
    revision: u64,
    #[serde(skip)]
    #[into_iterator]
    events: EventQueue<RescheduleRequestEvent>,
}

impl RescheduleRequest {
    pub fn create(
        id: RescheduleRequestId,
        booking_id: BookingId,
        original_slot_id: SlotId,
        requested_slot_id: SlotId,
        reason: String,
        requested_at: DateTime<Utc>,
    ) -> Result<Self, RescheduleRequestError> {
        Self::validate_created(&original_slot_id, &requested_slot_id)?;
        let expires_at = requested_at + Duration::days(EXPIRY_DAYS);
        let mut entity = RescheduleRequest {
            id,
            booking_id,
            original_slot_id,
            requested_slot_id,
            reason: reason.clone(),
            requested_at,
            expires_at,
            ..RescheduleRequest::default()
        };
        entity
            .events
            .push(RescheduleRequestEvent::RescheduleRequested {
                id,
                booking_id,
                original_slot_id,
                requested_slot_id,
                reason,
                requested_at,
                expires_at,
            });
        Ok(entity)
    }

    pub fn approve(
        &mut self,
        admin_id: AdminId,
        notes: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<(), RescheduleRequestError> {
        self.validate_decidable(at)?;
        self.status = RescheduleStatus::Approved;
        self.response = Some(AdminResponse {
            admin_id,
            notes: notes.clone(),
            responded_at: at,
        });
        self.events
            .push(RescheduleRequestEvent::RescheduleApproved {
                id: self.id,
                admin_id,
                notes,
                at,
            });
        Ok(())
    }

    pub fn decline(
        &mut self,
        admin_id: AdminId,
        notes: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<(), RescheduleRequestError> {
        self.validate_decidable(at)?;
        self.status = RescheduleStatus::Declined;
        self.response = Some(AdminResponse {
            admin_id,
            notes: notes.clone(),
            responded_at: at,
        });
        self.events
            .push(RescheduleRequestEvent::RescheduleDeclined {
                id: self.id,
                admin_id,
                notes,
                at,
            });
        Ok(())
    }

    /// お客様による取り下げ
    pub fn cancel(&mut self, at: DateTime<Utc>) -> Result<(), RescheduleRequestError> {
        self.validate_decidable(at)?;
        self.status = RescheduleStatus::Cancelled;
        self.events
            .push(RescheduleRequestEvent::RescheduleCancelled { id: self.id, at });
        Ok(())
    }

    /// 期限切れを記録する
    ///
    /// 期限は読み取り時に遅延評価されるため、読み取り経路が期限切れに
    /// 気づいた時点でこのメソッドで台帳へ反映する。
    pub fn expire(&mut self, at: DateTime<Utc>) -> Result<(), RescheduleRequestError> {
        if self.status != RescheduleStatus::Pending {
            return Err(RescheduleRequestError::AlreadyTerminal {
                status: self.status,
            });
        }
        if !self.is_expired(at) {
            return Err(RescheduleRequestError::NotExpired);
        }
        self.status = RescheduleStatus::Expired;
        self.events
            .push(RescheduleRequestEvent::RescheduleExpired { id: self.id, at });
        Ok(())
    }

    /// 期限を過ぎた保留中リクエストかどうか
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == RescheduleStatus::Pending && now >= self.expires_at
    }

    /// 遅延評価込みの実効ステータス
    ///
    /// 期限を過ぎた保留中リクエストは、台帳上の表記に関わらず期限切れと
    /// して扱う。ステータスを参照する全ての経路はこちらを使う。
    pub fn effective_status(&self, now: DateTime<Utc>) -> RescheduleStatus {
        if self.is_expired(now) {
            RescheduleStatus::Expired
        } else {
            self.status
        }
    }

    pub fn booking_id(&self) -> BookingId {
        self.booking_id
    }

    pub fn original_slot_id(&self) -> SlotId {
        self.original_slot_id
    }

    pub fn requested_slot_id(&self) -> SlotId {
        self.requested_slot_id
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn status(&self) -> RescheduleStatus {
        self.status
    }

    pub fn requested_at(&self) -> DateTime<Utc> {
        self.requested_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn response(&self) -> Option<&AdminResponse> {
        self.response.as_ref()
    }

    fn validate_id(&self, id: &RescheduleRequestId) -> Result<(), RescheduleRequestError> {
        match self.id == *id {
            true => Ok(()),
            false => Err(RescheduleRequestError::MismatchedId),
        }
    }

    fn validate_created(
        original_slot_id: &SlotId,
        requested_slot_id: &SlotId,
    ) -> Result<(), RescheduleRequestError> {
        if original_slot_id == requested_slot_id {
            return Err(RescheduleRequestError::SameSlot);
        }
        Ok(())
    }

    fn validate_decidable(&self, now: DateTime<Utc>) -> Result<(), RescheduleRequestError> {
        if self.is_expired(now) {
            return Err(RescheduleRequestError::Expired);
        }
        if self.status != RescheduleStatus::Pending {
            return Err(RescheduleRequestError::AlreadyTerminal {
                status: self.status,
            });
        }
        Ok(())
    }
}

impl Entity for RescheduleRequest {
    type Id = RescheduleRequestId;

    const ENTITY_NAME: &'static str = "reschedule_request";

    fn id(&self) -> Self::Id {
        self.id
    }
}

impl Aggregation for RescheduleRequest {
    type Event = RescheduleRequestEvent;
    type Error = RescheduleRequestError;

    fn revision(&self) -> u64 {
        self.revision
    }

    fn set_revision(&mut self, revision: u64) {
        self.revision = revision;
    }

    fn validate(&self, event: &Self::Event) -> Result<(), Self::Error> {
        match event {
            RescheduleRequestEvent::RescheduleRequested {
                original_slot_id,
                requested_slot_id,
                ..
            } => Self::validate_created(original_slot_id, requested_slot_id),
            RescheduleRequestEvent::RescheduleApproved { id, at, .. }
            | RescheduleRequestEvent::RescheduleDeclined { id, at, .. }
            | RescheduleRequestEvent::RescheduleCancelled { id, at } => {
                self.validate_id(id)?;
                self.validate_decidable(*at)
            }
            RescheduleRequestEvent::RescheduleExpired { id, .. } => self.validate_id(id),
        }
    }

    fn apply(&mut self, event: Self::Event) {
        match event {
            RescheduleRequestEvent::RescheduleRequested {
                id,
                booking_id,
                original_slot_id,
                requested_slot_id,
                reason,
                requested_at,
                ..
            } => {
                if self.id != id {
                    if let Ok(entity) = Self::create(
                        id,
                        booking_id,
                        original_slot_id,
                        requested_slot_id,
                        reason,
                        requested_at,
                    ) {
                        *self = entity;
                    }
                }
            }
            RescheduleRequestEvent::RescheduleApproved {
                id,
                admin_id,
                notes,
                at,
            } => {
                if self.id == id {
                    if let Err(_e) = self.approve(admin_id, notes, at) {}
                }
            }
            RescheduleRequestEvent::RescheduleDeclined {
                id,
                admin_id,
                notes,
                at,
            } => {
                if self.id == id {
                    if let Err(_e) = self.decline(admin_id, notes, at) {}
                }
            }
            RescheduleRequestEvent::RescheduleCancelled { id, at } => {
                if self.id == id {
                    if let Err(_e) = self.cancel(at) {}
                }
            }
            RescheduleRequestEvent::RescheduleExpired { id, at } => {
                if self.id == id {
                    if let Err(_e) = self.expire(at) {}
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

impl PartialEq for RescheduleRequest {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.booking_id == other.booking_id
            && self.original_slot_id == other.original_slot_id
            && self.requested_slot_id == other.requested_slot_id
            && self.reason == other.reason
            && self.status == other.status
            && self.requested_at == other.requested_at
            && self.expires_at == other.expires_at
            && self.response == other.response
    }
}

impl Eq for RescheduleRequest {}

/// 日時変更リクエストエラー
#[derive(Error, Display, Debug)]
pub enum RescheduleRequestError {
    #[display(fmt = "Mismatched id")]
    MismatchedId,
    #[display(fmt = "Requested slot must differ from the original slot")]
    SameSlot,
    #[display(fmt = "Request is already terminal ({:?})", status)]
    AlreadyTerminal { status: RescheduleStatus },
    #[display(fmt = "Request has expired")]
    Expired,
    #[display(fmt = "Request has not expired yet")]
    NotExpired,
}

/// 日時変更リクエストステータス
///
/// 保留中だけが非終端で、そこから先は一方通行。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RescheduleStatus {
    /// 保留中
    Pending,
    /// 承認
    Approved,
    /// 却下
    Declined,
    /// 期限切れ
    Expired,
    /// 取り下げ
    Cancelled,
}

impl Default for RescheduleStatus {
    fn default() -> Self {
        RescheduleStatus::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(requested_at: DateTime<Utc>) -> RescheduleRequest {
        RescheduleRequest::create(
            RescheduleRequestId::from(1),
            BookingId::from(100),
            SlotId::from(10),
            SlotId::from(20),
            "仕事の都合".to_owned(),
            requested_at,
        )
        .unwrap()
    }

    #[test]
    fn test_request_create() {
        let now = Utc::now();
        let request = request(now);
        assert_eq!(request.status(), RescheduleStatus::Pending);
        assert_eq!(request.expires_at(), now + Duration::days(EXPIRY_DAYS));
    }

    #[test]
    fn test_request_create_same_slot() {
        let result = RescheduleRequest::create(
            RescheduleRequestId::from(1),
            BookingId::from(100),
            SlotId::from(10),
            SlotId::from(10),
            "".to_owned(),
            Utc::now(),
        );
        assert!(matches!(result, Err(RescheduleRequestError::SameSlot)));
    }

    #[test]
    fn test_request_approve() {
        let now = Utc::now();
        let mut request = request(now);
        request
            .approve(AdminId::from(5), Some("了解しました".to_owned()), now)
            .unwrap();
        assert_eq!(request.status(), RescheduleStatus::Approved);
        let response = request.response().unwrap();
        assert_eq!(response.admin_id, AdminId::from(5));
        assert_eq!(response.responded_at, now);

        // 終端後の再決定はできない
        assert!(matches!(
            request.decline(AdminId::from(5), None, now),
            Err(RescheduleRequestError::AlreadyTerminal { .. })
        ));
    }

    #[test]
    fn test_request_decline_leaves_no_other_state() {
        let now = Utc::now();
        let mut request = request(now);
        request.decline(AdminId::from(5), None, now).unwrap();
        assert_eq!(request.status(), RescheduleStatus::Declined);
    }

    #[test]
    fn test_request_lazy_expiry() {
        let requested_at = Utc::now();
        let mut request = request(requested_at);
        let after_expiry = requested_at + Duration::days(EXPIRY_DAYS) + Duration::hours(1);

        assert!(request.is_expired(after_expiry));
        assert_eq!(
            request.effective_status(after_expiry),
            RescheduleStatus::Expired
        );
        // 台帳上はまだ保留中のまま
        assert_eq!(request.status(), RescheduleStatus::Pending);

        // 期限切れのリクエストは決定できない
        assert!(matches!(
            request.approve(AdminId::from(5), None, after_expiry),
            Err(RescheduleRequestError::Expired)
        ));

        request.expire(after_expiry).unwrap();
        assert_eq!(request.status(), RescheduleStatus::Expired);
    }

    #[test]
    fn test_request_customer_cancel() {
        let now = Utc::now();
        let mut request = request(now);
        request.cancel(now).unwrap();
        assert_eq!(request.status(), RescheduleStatus::Cancelled);
    }
}

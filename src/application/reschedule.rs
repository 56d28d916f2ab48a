use std::sync::Arc;

use chrono::Utc;
use derive_more::{Display, Error};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::domain::core::{
    Actor, AdminId, BookingError, BookingId, BookingRepository, BookingStatus, CustomerId,
    RescheduleRequest, RescheduleRequestError, RescheduleRequestId, RescheduleRequestRepository,
    RescheduleStatus, SlotId, SlotRepository, SlotStatus, SlotTransitionError,
};
use crate::domain::{DataAccessError, IdGeneratorTask};

use super::{notify_best_effort, NotificationEvent, Notifier};

/// 管理者の決定
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    /// 承認
    Approve,
    /// 却下
    Decline,
}

/// 日時変更ワークフロー
///
/// 確定済み予約の上に重なる二次ステートマシン。枠と予約への書き込みは
/// 予約・キャンセルと同じ条件付き更新だけで組み立てられ、エグゼキューターを
/// 迂回することはない。
pub struct RescheduleWorkflow<S, B, R, N> {
    slots: Arc<S>,
    bookings: Arc<B>,
    reschedules: Arc<R>,
    notifier: Arc<N>,
    ids: IdGeneratorTask,
}

impl<S, B, R, N> Clone for RescheduleWorkflow<S, B, R, N> {
    fn clone(&self) -> Self {
        Self {
            slots: self.slots.clone(),
            bookings: self.bookings.clone(),
            reschedules: self.reschedules.clone(),
            notifier: self.notifier.clone(),
            ids: self.ids.clone(),
        }
    }
}

impl<S, B, R, N> RescheduleWorkflow<S, B, R, N>
where
    S: SlotRepository + Send + Sync,
    B: BookingRepository + Send + Sync,
    R: RescheduleRequestRepository + Send + Sync,
    N: Notifier + Send + Sync,
{
    pub fn new(
        slots: Arc<S>,
        bookings: Arc<B>,
        reschedules: Arc<R>,
        notifier: Arc<N>,
        ids: IdGeneratorTask,
    ) -> Self {
        Self {
            slots,
            bookings,
            reschedules,
            notifier,
            ids,
        }
    }

    /// 日時変更をリクエストする
    ///
    /// この時点では枠に触れない。希望枠は管理者の決定まで他のお客様に
    /// 開放されたままであり、先に取られた場合は承認が失敗する。
    pub async fn request_reschedule(
        &self,
        booking_id: BookingId,
        customer_id: CustomerId,
        requested_slot_id: SlotId,
        reason: String,
    ) -> Result<RescheduleRequest, RequestRescheduleError> {
        let now = Utc::now();
        let booking = self
            .bookings
            .find_by_id(booking_id)
            .await?
            .ok_or(RequestRescheduleError::BookingNotFound)?;
        if booking.customer_id() != customer_id {
            return Err(RequestRescheduleError::NotOwner);
        }
        if booking.status() != BookingStatus::Confirmed {
            return Err(RequestRescheduleError::BookingNotConfirmed {
                status: booking.status(),
            });
        }

        if let Some(mut pending) = self.reschedules.find_pending_by_booking(booking_id).await? {
            if pending.is_expired(now) {
                // 期限切れを台帳へ反映してから新しいリクエストを受け付ける
                if pending.expire(now).is_ok() {
                    self.reschedules.save(&mut pending).await?;
                }
            } else {
                return Err(RequestRescheduleError::PendingRequestExists);
            }
        }

        let requested = self
            .slots
            .find_by_id(requested_slot_id)
            .await?
            .ok_or(RequestRescheduleError::SlotNotFound)?;
        if requested.status() != SlotStatus::Available {
            return Err(RequestRescheduleError::SlotUnavailable);
        }

        let id = self.ids.generate::<RescheduleRequestId>().await;
        let mut request = RescheduleRequest::create(
            id,
            booking_id,
            booking.slot_id(),
            requested_slot_id,
            reason,
            now,
        )?;
        // 高々一件の保留中リクエストはリポジトリ側の制約が最終判定する。
        // 同時リクエストは片方だけがここを通る。
        if let Err(e) = self.reschedules.save(&mut request).await {
            return Err(match e {
                DataAccessError::ConstraintViolation(_) => {
                    RequestRescheduleError::PendingRequestExists
                }
                e => e.into(),
            });
        }
        info!(%id, %booking_id, %requested_slot_id, "reschedule requested");
        Ok(request)
    }

    /// 管理者がリクエストを承認または却下する
    ///
    /// 承認は (1) 希望枠の確保 (2) 元の枠の解放 (3) 予約の付け替え
    /// (4) リクエストの確定、の順に進む。途中で失敗した場合は確保済みの
    /// 枠を逆順に戻してから失敗を返すため、一つの予約が二つの枠を同時に
    /// 占有したままになることはない。
    pub async fn decide_reschedule(
        &self,
        request_id: RescheduleRequestId,
        admin_id: AdminId,
        decision: Decision,
        notes: Option<String>,
    ) -> Result<RescheduleRequest, DecideRescheduleError> {
        let now = Utc::now();
        let mut request = self
            .reschedules
            .find_by_id(request_id)
            .await?
            .ok_or(DecideRescheduleError::NotFound)?;

        if request.is_expired(now) {
            // 遅延評価された期限切れを台帳へ反映する
            if request.expire(now).is_ok() {
                self.reschedules.save(&mut request).await?;
            }
            return Err(DecideRescheduleError::RequestExpired);
        }
        if request.status() != RescheduleStatus::Pending {
            return Err(DecideRescheduleError::AlreadyTerminal {
                status: request.status(),
            });
        }

        let mut booking = self
            .bookings
            .find_by_id(request.booking_id())
            .await?
            .ok_or(DecideRescheduleError::BookingNotFound)?;

        match decision {
            Decision::Decline => {
                request.decline(admin_id, notes, now)?;
                self.reschedules.save(&mut request).await?;
                info!(%request_id, booking_id = %request.booking_id(), "reschedule declined");
                notify_best_effort(
                    self.notifier.as_ref(),
                    NotificationEvent::RescheduleDeclined {
                        request_id,
                        booking_id: request.booking_id(),
                        customer_id: booking.customer_id(),
                    },
                )
                .await;
                Ok(request)
            }
            Decision::Approve => {
                if booking.status() != BookingStatus::Confirmed {
                    return Err(DecideRescheduleError::BookingNotConfirmed {
                        status: booking.status(),
                    });
                }
                let requested_slot_id = request.requested_slot_id();
                let original_slot_id = request.original_slot_id();

                // (1) 希望枠の確保。負けた場合リクエストは保留のまま残り、
                // 管理者の再決定かお客様の再リクエストに委ねる。
                match self
                    .slots
                    .transition(requested_slot_id, SlotStatus::Available, SlotStatus::Booked)
                    .await
                {
                    Ok(()) => {}
                    Err(SlotTransitionError::DataAccess(e)) => return Err(e.into()),
                    Err(_) => return Err(DecideRescheduleError::SlotNoLongerAvailable),
                }

                // (2) 元の枠の解放。失敗したら (1) を戻す。
                if let Err(e) = self
                    .slots
                    .transition(original_slot_id, SlotStatus::Booked, SlotStatus::Available)
                    .await
                {
                    self.release_slot(requested_slot_id).await;
                    return Err(match e {
                        SlotTransitionError::DataAccess(e) => e.into(),
                        _ => DecideRescheduleError::OriginalSlotConflict,
                    });
                }

                // (3) 予約の付け替え。失敗したら両方の枠を戻す。
                if let Err(e) = booking.change_slot(requested_slot_id, Actor::Admin(admin_id), now)
                {
                    self.rebook_slot(original_slot_id).await;
                    self.release_slot(requested_slot_id).await;
                    return Err(e.into());
                }
                if let Err(e) = self.bookings.save(&mut booking).await {
                    self.rebook_slot(original_slot_id).await;
                    self.release_slot(requested_slot_id).await;
                    return Err(match e {
                        DataAccessError::RevisionConflict { .. } => {
                            DecideRescheduleError::BookingConflict
                        }
                        e => e.into(),
                    });
                }

                // (4) リクエストを承認で確定する
                request.approve(admin_id, notes, now)?;
                self.reschedules.save(&mut request).await?;
                info!(
                    %request_id,
                    booking_id = %request.booking_id(),
                    from = %original_slot_id,
                    to = %requested_slot_id,
                    "reschedule approved"
                );
                notify_best_effort(
                    self.notifier.as_ref(),
                    NotificationEvent::RescheduleApproved {
                        request_id,
                        booking_id: request.booking_id(),
                        customer_id: booking.customer_id(),
                        new_slot_id: requested_slot_id,
                    },
                )
                .await;
                Ok(request)
            }
        }
    }

    /// お客様がリクエストを取り下げる
    pub async fn cancel_request(
        &self,
        request_id: RescheduleRequestId,
        customer_id: CustomerId,
    ) -> Result<RescheduleRequest, CancelRequestError> {
        let now = Utc::now();
        let mut request = self
            .reschedules
            .find_by_id(request_id)
            .await?
            .ok_or(CancelRequestError::NotFound)?;
        let booking = self
            .bookings
            .find_by_id(request.booking_id())
            .await?
            .ok_or(CancelRequestError::BookingNotFound)?;
        if booking.customer_id() != customer_id {
            return Err(CancelRequestError::NotOwner);
        }
        if request.is_expired(now) {
            if request.expire(now).is_ok() {
                self.reschedules.save(&mut request).await?;
            }
            return Err(CancelRequestError::RequestExpired);
        }
        request.cancel(now)?;
        self.reschedules.save(&mut request).await?;
        info!(%request_id, "reschedule request withdrawn");
        Ok(request)
    }

    async fn release_slot(&self, slot_id: SlotId) {
        if let Err(e) = self
            .slots
            .transition(slot_id, SlotStatus::Booked, SlotStatus::Available)
            .await
        {
            error!(%slot_id, error = %e, "failed to release slot during compensation");
        }
    }

    async fn rebook_slot(&self, slot_id: SlotId) {
        if let Err(e) = self
            .slots
            .transition(slot_id, SlotStatus::Available, SlotStatus::Booked)
            .await
        {
            error!(%slot_id, error = %e, "failed to rebook slot during compensation");
        }
    }
}

/// 日時変更リクエストの失敗
#[derive(Error, Display, Debug)]
pub enum RequestRescheduleError {
    #[display(fmt = "Booking not found")]
    BookingNotFound,
    #[display(fmt = "Booking belongs to another customer")]
    NotOwner,
    #[display(fmt = "Booking is not confirmed ({:?})", status)]
    BookingNotConfirmed { status: BookingStatus },
    #[display(fmt = "A pending reschedule request already exists")]
    PendingRequestExists,
    #[display(fmt = "Requested slot not found")]
    SlotNotFound,
    #[display(fmt = "Requested slot is not available")]
    SlotUnavailable,
    #[display(fmt = "Request error: {}", _0)]
    Request(#[error(source)] RescheduleRequestError),
    #[display(fmt = "Data access error: {}", _0)]
    DataAccess(#[error(source)] DataAccessError),
}

impl From<RescheduleRequestError> for RequestRescheduleError {
    fn from(value: RescheduleRequestError) -> Self {
        Self::Request(value)
    }
}

impl From<DataAccessError> for RequestRescheduleError {
    fn from(value: DataAccessError) -> Self {
        Self::DataAccess(value)
    }
}

/// 決定の失敗
#[derive(Error, Display, Debug)]
pub enum DecideRescheduleError {
    #[display(fmt = "Request not found")]
    NotFound,
    #[display(fmt = "Booking not found")]
    BookingNotFound,
    #[display(fmt = "Request has expired")]
    RequestExpired,
    #[display(fmt = "Request is already terminal ({:?})", status)]
    AlreadyTerminal { status: RescheduleStatus },
    #[display(fmt = "Booking is not confirmed ({:?})", status)]
    BookingNotConfirmed { status: BookingStatus },
    #[display(fmt = "Requested slot is no longer available")]
    SlotNoLongerAvailable,
    #[display(fmt = "Original slot could not be released")]
    OriginalSlotConflict,
    #[display(fmt = "Booking was modified concurrently")]
    BookingConflict,
    #[display(fmt = "Booking error: {}", _0)]
    Booking(#[error(source)] BookingError),
    #[display(fmt = "Request error: {}", _0)]
    Request(#[error(source)] RescheduleRequestError),
    #[display(fmt = "Data access error: {}", _0)]
    DataAccess(#[error(source)] DataAccessError),
}

impl From<BookingError> for DecideRescheduleError {
    fn from(value: BookingError) -> Self {
        Self::Booking(value)
    }
}

impl From<RescheduleRequestError> for DecideRescheduleError {
    fn from(value: RescheduleRequestError) -> Self {
        Self::Request(value)
    }
}

impl From<DataAccessError> for DecideRescheduleError {
    fn from(value: DataAccessError) -> Self {
        Self::DataAccess(value)
    }
}

/// 取り下げの失敗
#[derive(Error, Display, Debug)]
pub enum CancelRequestError {
    #[display(fmt = "Request not found")]
    NotFound,
    #[display(fmt = "Booking not found")]
    BookingNotFound,
    #[display(fmt = "Request belongs to another customer")]
    NotOwner,
    #[display(fmt = "Request has expired")]
    RequestExpired,
    #[display(fmt = "Request error: {}", _0)]
    Request(#[error(source)] RescheduleRequestError),
    #[display(fmt = "Data access error: {}", _0)]
    DataAccess(#[error(source)] DataAccessError),
}

impl From<RescheduleRequestError> for CancelRequestError {
    fn from(value: RescheduleRequestError) -> Self {
        Self::Request(value)
    }
}

impl From<DataAccessError> for CancelRequestError {
    fn from(value: DataAccessError) -> Self {
        Self::DataAccess(value)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, NaiveTime};
    use snowflake::SnowflakeIdGenerator;

    use crate::application::{BookingExecutor, CancellationExecutor};
    use crate::domain::core::{Booking, Money, Slot};
    use crate::domain::Entity;
    use crate::infrastructure::core::{
        LogNotifier, MemoryBookingRepository, MemoryRescheduleRequestRepository,
        MemorySlotRepository,
    };

    use super::*;

    struct Fixture {
        slots: Arc<MemorySlotRepository>,
        bookings: Arc<MemoryBookingRepository>,
        reschedules: Arc<MemoryRescheduleRequestRepository>,
        executor: BookingExecutor<MemorySlotRepository, MemoryBookingRepository>,
        workflow: RescheduleWorkflow<
            MemorySlotRepository,
            MemoryBookingRepository,
            MemoryRescheduleRequestRepository,
            LogNotifier,
        >,
    }

    async fn fixture(slot_ids: &[u64]) -> Fixture {
        let slots = Arc::new(MemorySlotRepository::new());
        let bookings = Arc::new(MemoryBookingRepository::new());
        let reschedules = Arc::new(MemoryRescheduleRequestRepository::new());
        for (i, id) in slot_ids.iter().enumerate() {
            let mut slot = Slot::create(
                SlotId::from(*id),
                NaiveDate::from_ymd_opt(2023, 4, 1).unwrap(),
                NaiveTime::from_hms_opt(9 + i as u32, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(10 + i as u32, 0, 0).unwrap(),
            )
            .unwrap();
            slots.save(&mut slot).await.unwrap();
        }
        let ids = IdGeneratorTask::spawn(SnowflakeIdGenerator::new(1, 1).into());
        let executor = BookingExecutor::new(slots.clone(), bookings.clone(), ids.clone());
        let workflow = RescheduleWorkflow::new(
            slots.clone(),
            bookings.clone(),
            reschedules.clone(),
            Arc::new(LogNotifier),
            ids,
        );
        Fixture {
            slots,
            bookings,
            reschedules,
            executor,
            workflow,
        }
    }

    async fn slot_status(f: &Fixture, id: u64) -> SlotStatus {
        f.slots
            .find_by_id(SlotId::from(id))
            .await
            .unwrap()
            .unwrap()
            .status()
    }

    async fn book(f: &Fixture, customer: u64, slot: u64) -> Booking {
        f.executor
            .create_booking(
                CustomerId::from(customer),
                SlotId::from(slot),
                Money::default(),
                None,
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_request_reschedule() {
        let f = fixture(&[1, 2]).await;
        let booking = book(&f, 7, 1).await;

        let request = f
            .workflow
            .request_reschedule(
                booking.id(),
                CustomerId::from(7),
                SlotId::from(2),
                "仕事の都合".to_owned(),
            )
            .await
            .unwrap();

        assert_eq!(request.status(), RescheduleStatus::Pending);
        assert_eq!(request.original_slot_id(), SlotId::from(1));
        // リクエストだけでは枠は動かない
        assert_eq!(slot_status(&f, 1).await, SlotStatus::Booked);
        assert_eq!(slot_status(&f, 2).await, SlotStatus::Available);
        // 予約も無傷
        let stored = f.bookings.find_by_id(booking.id()).await.unwrap().unwrap();
        assert_eq!(stored.slot_id(), SlotId::from(1));
        assert_eq!(stored.reschedule_count(), 0);
    }

    #[tokio::test]
    async fn test_request_reschedule_rejects_second_pending() {
        let f = fixture(&[1, 2, 3]).await;
        let booking = book(&f, 7, 1).await;
        let customer = CustomerId::from(7);

        f.workflow
            .request_reschedule(booking.id(), customer, SlotId::from(2), "".to_owned())
            .await
            .unwrap();
        let result = f
            .workflow
            .request_reschedule(booking.id(), customer, SlotId::from(3), "".to_owned())
            .await;
        assert!(matches!(
            result,
            Err(RequestRescheduleError::PendingRequestExists)
        ));
    }

    #[tokio::test]
    async fn test_request_reschedule_requires_available_differing_slot() {
        let f = fixture(&[1, 2]).await;
        let booking = book(&f, 7, 1).await;
        let customer = CustomerId::from(7);

        // 自分の現在の枠は指定できない
        let result = f
            .workflow
            .request_reschedule(booking.id(), customer, SlotId::from(1), "".to_owned())
            .await;
        assert!(matches!(result, Err(RequestRescheduleError::SlotUnavailable)));

        // 他人の予約は動かせない
        let result = f
            .workflow
            .request_reschedule(booking.id(), CustomerId::from(8), SlotId::from(2), "".to_owned())
            .await;
        assert!(matches!(result, Err(RequestRescheduleError::NotOwner)));
    }

    #[tokio::test]
    async fn test_racing_requests_leave_single_pending() {
        let f = fixture(&[1, 2, 3]).await;
        let booking = book(&f, 7, 1).await;
        let customer = CustomerId::from(7);

        let w1 = f.workflow.clone();
        let w2 = f.workflow.clone();
        let id = booking.id();
        let (first, second) = tokio::join!(
            w1.request_reschedule(id, customer, SlotId::from(2), "".to_owned()),
            w2.request_reschedule(id, customer, SlotId::from(3), "".to_owned()),
        );

        // 同時に出しても保留中は一件だけ
        let accepted = [first.is_ok(), second.is_ok()]
            .iter()
            .filter(|ok| **ok)
            .count();
        assert_eq!(accepted, 1);
        assert!(matches!(
            [first, second].into_iter().find(|r| r.is_err()).unwrap(),
            Err(RequestRescheduleError::PendingRequestExists)
        ));
        assert!(f
            .reschedules
            .find_pending_by_booking(id)
            .await
            .unwrap()
            .is_some());
        assert_eq!(f.reschedules.list_by_booking(id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_decide_reschedule_approve_swaps_slots() {
        let f = fixture(&[1, 2]).await;
        let booking = book(&f, 7, 1).await;
        let request = f
            .workflow
            .request_reschedule(
                booking.id(),
                CustomerId::from(7),
                SlotId::from(2),
                "".to_owned(),
            )
            .await
            .unwrap();

        let approved = f
            .workflow
            .decide_reschedule(request.id(), AdminId::from(1), Decision::Approve, None)
            .await
            .unwrap();

        assert_eq!(approved.status(), RescheduleStatus::Approved);
        assert_eq!(slot_status(&f, 1).await, SlotStatus::Available);
        assert_eq!(slot_status(&f, 2).await, SlotStatus::Booked);
        let stored = f.bookings.find_by_id(booking.id()).await.unwrap().unwrap();
        assert_eq!(stored.slot_id(), SlotId::from(2));
        assert_eq!(stored.reschedule_count(), 1);
        assert_eq!(stored.status(), BookingStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_decide_reschedule_decline_changes_nothing() {
        let f = fixture(&[1, 2]).await;
        let booking = book(&f, 7, 1).await;
        let request = f
            .workflow
            .request_reschedule(
                booking.id(),
                CustomerId::from(7),
                SlotId::from(2),
                "".to_owned(),
            )
            .await
            .unwrap();

        let declined = f
            .workflow
            .decide_reschedule(
                request.id(),
                AdminId::from(1),
                Decision::Decline,
                Some("満枠のため".to_owned()),
            )
            .await
            .unwrap();

        assert_eq!(declined.status(), RescheduleStatus::Declined);
        assert!(declined.response().is_some());
        assert_eq!(slot_status(&f, 1).await, SlotStatus::Booked);
        assert_eq!(slot_status(&f, 2).await, SlotStatus::Available);
        let stored = f.bookings.find_by_id(booking.id()).await.unwrap().unwrap();
        assert_eq!(stored.slot_id(), SlotId::from(1));
    }

    #[tokio::test]
    async fn test_decide_reschedule_lost_race_leaves_request_pending() {
        let f = fixture(&[1, 2, 3]).await;
        let booking = book(&f, 7, 1).await;
        let request = f
            .workflow
            .request_reschedule(
                booking.id(),
                CustomerId::from(7),
                SlotId::from(3),
                "".to_owned(),
            )
            .await
            .unwrap();

        // 希望枠が先に他のお客様に取られた
        book(&f, 8, 3).await;

        let result = f
            .workflow
            .decide_reschedule(request.id(), AdminId::from(1), Decision::Approve, None)
            .await;
        assert!(matches!(
            result,
            Err(DecideRescheduleError::SlotNoLongerAvailable)
        ));

        // 負けた側の予約と元の枠は無傷、リクエストは保留のまま
        assert_eq!(slot_status(&f, 1).await, SlotStatus::Booked);
        let stored = f.bookings.find_by_id(booking.id()).await.unwrap().unwrap();
        assert_eq!(stored.slot_id(), SlotId::from(1));
        let stored_request = f
            .reschedules
            .find_by_id(request.id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored_request.status(), RescheduleStatus::Pending);
    }

    #[tokio::test]
    async fn test_racing_approvals_for_same_slot_have_one_winner() {
        let f = fixture(&[1, 2, 3]).await;
        let b1 = book(&f, 7, 1).await;
        let b2 = book(&f, 8, 2).await;
        let r1 = f
            .workflow
            .request_reschedule(b1.id(), CustomerId::from(7), SlotId::from(3), "".to_owned())
            .await
            .unwrap();
        let r2 = f
            .workflow
            .request_reschedule(b2.id(), CustomerId::from(8), SlotId::from(3), "".to_owned())
            .await
            .unwrap();

        let w1 = f.workflow.clone();
        let w2 = f.workflow.clone();
        let (first, second) = tokio::join!(
            w1.decide_reschedule(r1.id(), AdminId::from(1), Decision::Approve, None),
            w2.decide_reschedule(r2.id(), AdminId::from(1), Decision::Approve, None),
        );

        let approvals = [first.is_ok(), second.is_ok()]
            .iter()
            .filter(|ok| **ok)
            .count();
        assert_eq!(approvals, 1);
        assert!(matches!(
            [first, second].into_iter().find(|r| r.is_err()).unwrap(),
            Err(DecideRescheduleError::SlotNoLongerAvailable)
        ));
        assert_eq!(slot_status(&f, 3).await, SlotStatus::Booked);
    }

    #[tokio::test]
    async fn test_decide_expired_request() {
        let f = fixture(&[1, 2]).await;
        let booking = book(&f, 7, 1).await;
        let request = f
            .workflow
            .request_reschedule(
                booking.id(),
                CustomerId::from(7),
                SlotId::from(2),
                "".to_owned(),
            )
            .await
            .unwrap();

        // 期限切れの状態を直接作る
        {
            let mut expired = f
                .reschedules
                .find_by_id(request.id())
                .await
                .unwrap()
                .unwrap();
            let past = Utc::now() + chrono::Duration::days(crate::domain::core::EXPIRY_DAYS);
            expired.expire(past).unwrap();
            f.reschedules.save(&mut expired).await.unwrap();
        }

        let result = f
            .workflow
            .decide_reschedule(request.id(), AdminId::from(1), Decision::Approve, None)
            .await;
        assert!(matches!(
            result,
            Err(DecideRescheduleError::AlreadyTerminal {
                status: RescheduleStatus::Expired
            })
        ));
    }

    #[tokio::test]
    async fn test_cancel_request() {
        let f = fixture(&[1, 2]).await;
        let booking = book(&f, 7, 1).await;
        let request = f
            .workflow
            .request_reschedule(
                booking.id(),
                CustomerId::from(7),
                SlotId::from(2),
                "".to_owned(),
            )
            .await
            .unwrap();

        let result = f
            .workflow
            .cancel_request(request.id(), CustomerId::from(8))
            .await;
        assert!(matches!(result, Err(CancelRequestError::NotOwner)));

        let withdrawn = f
            .workflow
            .cancel_request(request.id(), CustomerId::from(7))
            .await
            .unwrap();
        assert_eq!(withdrawn.status(), RescheduleStatus::Cancelled);

        // 取り下げ後は新しいリクエストを受け付ける
        f.workflow
            .request_reschedule(
                booking.id(),
                CustomerId::from(7),
                SlotId::from(2),
                "".to_owned(),
            )
            .await
            .unwrap();
    }

    /// 予約 → 日時変更承認 → キャンセルの一連の流れ
    #[tokio::test]
    async fn test_full_lifecycle_scenario() {
        let f = fixture(&[1, 2]).await;
        let booking = f
            .executor
            .create_booking(
                CustomerId::from(7),
                SlotId::from(1),
                Money::new(7500, crate::domain::core::Currency::JPY),
                None,
            )
            .await
            .unwrap();
        assert_eq!(booking.status(), BookingStatus::Confirmed);
        assert_eq!(slot_status(&f, 1).await, SlotStatus::Booked);

        let request = f
            .workflow
            .request_reschedule(
                booking.id(),
                CustomerId::from(7),
                SlotId::from(2),
                "都合変更".to_owned(),
            )
            .await
            .unwrap();
        let approved = f
            .workflow
            .decide_reschedule(request.id(), AdminId::from(1), Decision::Approve, None)
            .await
            .unwrap();
        assert_eq!(approved.status(), RescheduleStatus::Approved);
        assert_eq!(slot_status(&f, 1).await, SlotStatus::Available);
        assert_eq!(slot_status(&f, 2).await, SlotStatus::Booked);

        let cancel = CancellationExecutor::new(
            f.slots.clone(),
            f.bookings.clone(),
            Arc::new(LogNotifier),
        );
        let cancelled = cancel
            .cancel_booking(
                booking.id(),
                Actor::Customer(CustomerId::from(7)),
                Some("plans changed".to_owned()),
            )
            .await
            .unwrap();
        assert_eq!(cancelled.status(), BookingStatus::Cancelled);
        assert_eq!(slot_status(&f, 2).await, SlotStatus::Available);
    }
}

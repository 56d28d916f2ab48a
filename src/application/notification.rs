use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use derive_more::{Display, Error};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::domain::core::{
    BookingId, BookingReference, BookingRepository, BookingStatus, CustomerId,
    RescheduleRequestId, RescheduleRequestRepository, RescheduleStatus, SlotId, SlotRepository,
};
use crate::domain::{DataAccessError, Entity};

/// 通知コラボレーター
///
/// 配送(メール・プッシュ等)は本コアの範囲外。配送の失敗が状態遷移を
/// 失敗させたり巻き戻したりすることはない。
#[async_trait]
pub trait Notifier {
    async fn notify(&self, event: &NotificationEvent) -> Result<(), NotificationError>;
}

/// 通知イベント
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationEvent {
    /// 予約がキャンセルされた
    BookingCancelled {
        booking_id: BookingId,
        customer_id: CustomerId,
        reference: BookingReference,
        reason: Option<String>,
    },
    /// 日時変更が承認された
    RescheduleApproved {
        request_id: RescheduleRequestId,
        booking_id: BookingId,
        customer_id: CustomerId,
        new_slot_id: SlotId,
    },
    /// 日時変更が却下された
    RescheduleDeclined {
        request_id: RescheduleRequestId,
        booking_id: BookingId,
        customer_id: CustomerId,
    },
}

/// 通知の配送失敗
#[derive(Error, Display, Debug)]
#[display(fmt = "Notification delivery failed: {}", message)]
pub struct NotificationError {
    pub message: String,
}

/// 通知をベストエフォートで送る
///
/// 失敗はログに残して握り潰す。呼び出し元の状態遷移には影響しない。
pub async fn notify_best_effort<N: Notifier>(notifier: &N, event: NotificationEvent) {
    if let Err(e) = notifier.notify(&event).await {
        warn!(error = %e, ?event, "notification delivery failed");
    }
}

/// ステータス照会サーフェス
///
/// 読み取り専用。高頻度のポーリングを想定しており、何度呼んでも状態を
/// 変えない。
pub struct StatusPoller<S, B, R> {
    slots: Arc<S>,
    bookings: Arc<B>,
    reschedules: Arc<R>,
}

impl<S, B, R> Clone for StatusPoller<S, B, R> {
    fn clone(&self) -> Self {
        Self {
            slots: self.slots.clone(),
            bookings: self.bookings.clone(),
            reschedules: self.reschedules.clone(),
        }
    }
}

/// ポーリング結果の一件分
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingUpdate {
    pub booking_id: BookingId,
    pub reference: BookingReference,
    pub status: BookingStatus,
    /// お客様向けの枠表記
    pub slot_window: String,
    pub active_request: Option<ActiveRescheduleRequest>,
    /// `since` 以降にステータスが変わったかどうか
    pub changed: bool,
}

/// 進行中の日時変更リクエスト
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveRescheduleRequest {
    pub request_id: RescheduleRequestId,
    pub status: RescheduleStatus,
}

impl<S, B, R> StatusPoller<S, B, R>
where
    S: SlotRepository + Send + Sync,
    B: BookingRepository + Send + Sync,
    R: RescheduleRequestRepository + Send + Sync,
{
    pub fn new(slots: Arc<S>, bookings: Arc<B>, reschedules: Arc<R>) -> Self {
        Self {
            slots,
            bookings,
            reschedules,
        }
    }

    /// お客様の予約の最新状態を返す
    ///
    /// `booking_ids` を渡すとその予約に絞り込む。結果は予約ID順で、同じ
    /// `since` に対しては書き込みがない限り同じ結果を返す。
    pub async fn poll_updates(
        &self,
        customer_id: CustomerId,
        since: DateTime<Utc>,
        booking_ids: Option<&[BookingId]>,
    ) -> Result<Vec<BookingUpdate>, DataAccessError> {
        let now = Utc::now();
        let mut bookings = self.bookings.list_by_customer(customer_id).await?;
        bookings.sort_by_key(|b| *b.id());
        if let Some(ids) = booking_ids {
            bookings.retain(|b| ids.contains(&b.id()));
        }

        let mut updates = Vec::with_capacity(bookings.len());
        for booking in bookings {
            let slot_window = self
                .slots
                .find_by_id(booking.slot_id())
                .await?
                .map(|s| s.window())
                .ok_or_else(|| {
                    DataAccessError::ReadError(
                        format!("slot {} is missing", booking.slot_id()).into(),
                    )
                })?;
            let active_request = self
                .reschedules
                .find_pending_by_booking(booking.id())
                .await?
                .map(|r| ActiveRescheduleRequest {
                    request_id: r.id(),
                    // 期限は読み取り時に遅延評価する
                    status: r.effective_status(now),
                });
            updates.push(BookingUpdate {
                booking_id: booking.id(),
                reference: booking.reference().clone(),
                status: booking.status(),
                slot_window,
                active_request,
                changed: booking.status_changed_at() > since,
            });
        }
        Ok(updates)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, NaiveDate, NaiveTime};
    use snowflake::SnowflakeIdGenerator;

    use crate::application::BookingExecutor;
    use crate::domain::core::{Money, Slot, SlotStatus};
    use crate::domain::IdGeneratorTask;
    use crate::infrastructure::core::{
        MemoryBookingRepository, MemoryRescheduleRequestRepository, MemorySlotRepository,
    };

    use super::*;

    async fn seed_slot(slots: &MemorySlotRepository, id: u64, hour: u32) {
        let mut slot = Slot::create(
            SlotId::from(id),
            NaiveDate::from_ymd_opt(2023, 4, 1).unwrap(),
            NaiveTime::from_hms_opt(hour, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(hour + 1, 0, 0).unwrap(),
        )
        .unwrap();
        slots.save(&mut slot).await.unwrap();
    }

    #[tokio::test]
    async fn test_poll_updates_is_idempotent() {
        let slots = Arc::new(MemorySlotRepository::new());
        let bookings = Arc::new(MemoryBookingRepository::new());
        let reschedules = Arc::new(MemoryRescheduleRequestRepository::new());
        seed_slot(&slots, 1, 10).await;
        seed_slot(&slots, 2, 13).await;

        let ids = IdGeneratorTask::spawn(SnowflakeIdGenerator::new(1, 1).into());
        let executor = BookingExecutor::new(slots.clone(), bookings.clone(), ids);
        let customer = CustomerId::from(7);
        executor
            .create_booking(customer, SlotId::from(1), Money::default(), None)
            .await
            .unwrap();
        executor
            .create_booking(customer, SlotId::from(2), Money::default(), None)
            .await
            .unwrap();

        let poller = StatusPoller::new(slots, bookings, reschedules);
        let since = Utc::now() - Duration::hours(1);
        let first = poller.poll_updates(customer, since, None).await.unwrap();
        let second = poller.poll_updates(customer, since, None).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|u| u.changed));
        assert!(*first[0].booking_id <= *first[1].booking_id);
        assert_eq!(first[0].slot_window, "2023-04-01 10:00-11:00");
    }

    #[tokio::test]
    async fn test_poll_updates_since_filtering() {
        let slots = Arc::new(MemorySlotRepository::new());
        let bookings = Arc::new(MemoryBookingRepository::new());
        let reschedules = Arc::new(MemoryRescheduleRequestRepository::new());
        seed_slot(&slots, 1, 10).await;

        let ids = IdGeneratorTask::spawn(SnowflakeIdGenerator::new(1, 1).into());
        let executor = BookingExecutor::new(slots.clone(), bookings.clone(), ids);
        let customer = CustomerId::from(7);
        let booking = executor
            .create_booking(customer, SlotId::from(1), Money::default(), None)
            .await
            .unwrap();

        let poller = StatusPoller::new(slots.clone(), bookings, reschedules);
        let updates = poller
            .poll_updates(customer, Utc::now() + Duration::hours(1), None)
            .await
            .unwrap();
        assert_eq!(updates.len(), 1);
        assert!(!updates[0].changed);
        assert_eq!(updates[0].booking_id, booking.id());
        assert_eq!(
            slots
                .find_by_id(SlotId::from(1))
                .await
                .unwrap()
                .unwrap()
                .status(),
            SlotStatus::Booked
        );
    }
}

use std::sync::Arc;

use chrono::Utc;
use derive_more::{Display, Error};
use tracing::{error, info};

use crate::domain::core::{
    Actor, Booking, BookingError, BookingId, BookingRepository, BookingStatus, CustomerId, Money,
    SlotId, SlotRepository, SlotStatus, SlotTransitionError,
};
use crate::domain::{DataAccessError, IdGeneratorTask};

/// 予約トランザクションエグゼキューター
///
/// 予約の作成と枠の消費はこの入口だけを通る。枠の確保は条件付き更新で
/// 行い、同じ枠に殺到した呼び出しのうち成功するのは一つだけとなる。
pub struct BookingExecutor<S, B> {
    slots: Arc<S>,
    bookings: Arc<B>,
    ids: IdGeneratorTask,
}

impl<S, B> Clone for BookingExecutor<S, B> {
    fn clone(&self) -> Self {
        Self {
            slots: self.slots.clone(),
            bookings: self.bookings.clone(),
            ids: self.ids.clone(),
        }
    }
}

impl<S, B> BookingExecutor<S, B>
where
    S: SlotRepository + Send + Sync,
    B: BookingRepository + Send + Sync,
{
    pub fn new(slots: Arc<S>, bookings: Arc<B>, ids: IdGeneratorTask) -> Self {
        Self {
            slots,
            bookings,
            ids,
        }
    }

    /// 予約を作成する
    ///
    /// 枠を `Available → Booked` の条件付き更新で先に確保してから台帳へ
    /// 挿入する。挿入に失敗した場合は枠を空きへ戻してから失敗を返すため、
    /// 予約のない `Booked` 枠が残ることはない。
    pub async fn create_booking(
        &self,
        customer_id: CustomerId,
        slot_id: SlotId,
        price: Money,
        notes: Option<String>,
    ) -> Result<Booking, CreateBookingError> {
        match self
            .slots
            .transition(slot_id, SlotStatus::Available, SlotStatus::Booked)
            .await
        {
            Ok(()) => {}
            Err(SlotTransitionError::NotFound) => return Err(CreateBookingError::SlotNotFound),
            Err(SlotTransitionError::DataAccess(e)) => return Err(e.into()),
            // 競争に負けた。予約レコードは作られない。
            Err(_) => return Err(CreateBookingError::SlotUnavailable),
        }

        let id = self.ids.generate::<BookingId>().await;
        let mut booking = Booking::create(
            id,
            customer_id,
            slot_id,
            price,
            notes,
            Actor::Customer(customer_id),
            Utc::now(),
        );
        if let Err(e) = self.bookings.save(&mut booking).await {
            if let Err(rollback) = self
                .slots
                .transition(slot_id, SlotStatus::Booked, SlotStatus::Available)
                .await
            {
                error!(
                    %slot_id,
                    error = %rollback,
                    "failed to release slot after booking insert failure"
                );
            }
            return Err(e.into());
        }
        info!(%id, %slot_id, reference = %booking.reference(), "booking created");
        Ok(booking)
    }

    /// 管理者によるステータス更新
    ///
    /// 作業開始・完了・来店なしなどの進行は全てここを通る。遷移グラフ外の
    /// 変更は何も書き換えずに失敗する。
    pub async fn update_status(
        &self,
        booking_id: BookingId,
        status: BookingStatus,
        actor: Actor,
        reason: Option<String>,
    ) -> Result<Booking, UpdateBookingError> {
        let mut booking = self
            .bookings
            .find_by_id(booking_id)
            .await?
            .ok_or(UpdateBookingError::NotFound)?;
        booking.change_status(status, actor, reason, Utc::now())?;
        if let Err(e) = self.bookings.save(&mut booking).await {
            // 読み込み後に別の書き込みが先行した。呼び出し側は読み直して
            // やり直せる。
            return Err(match e {
                DataAccessError::RevisionConflict { .. } => UpdateBookingError::Conflict,
                e => e.into(),
            });
        }
        info!(%booking_id, ?status, "booking status updated");
        Ok(booking)
    }
}

/// 予約作成の失敗
#[derive(Error, Display, Debug)]
pub enum CreateBookingError {
    #[display(fmt = "Slot not found")]
    SlotNotFound,
    #[display(fmt = "Slot is no longer available")]
    SlotUnavailable,
    #[display(fmt = "Data access error: {}", _0)]
    DataAccess(#[error(source)] DataAccessError),
}

impl From<DataAccessError> for CreateBookingError {
    fn from(value: DataAccessError) -> Self {
        Self::DataAccess(value)
    }
}

/// ステータス更新の失敗
#[derive(Error, Display, Debug)]
pub enum UpdateBookingError {
    #[display(fmt = "Booking not found")]
    NotFound,
    #[display(fmt = "Booking was modified concurrently")]
    Conflict,
    #[display(fmt = "Booking error: {}", _0)]
    Booking(#[error(source)] BookingError),
    #[display(fmt = "Data access error: {}", _0)]
    DataAccess(#[error(source)] DataAccessError),
}

impl From<BookingError> for UpdateBookingError {
    fn from(value: BookingError) -> Self {
        Self::Booking(value)
    }
}

impl From<DataAccessError> for UpdateBookingError {
    fn from(value: DataAccessError) -> Self {
        Self::DataAccess(value)
    }
}

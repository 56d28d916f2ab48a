use std::sync::Arc;

use chrono::Utc;
use derive_more::{Display, Error};
use tracing::{info, warn};

use crate::domain::core::{
    Actor, Booking, BookingError, BookingId, BookingRepository, BookingStatus, SlotRepository,
    SlotStatus,
};
use crate::domain::DataAccessError;

use super::{notify_best_effort, NotificationEvent, Notifier};

/// キャンセルエグゼキューター
pub struct CancellationExecutor<S, B, N> {
    slots: Arc<S>,
    bookings: Arc<B>,
    notifier: Arc<N>,
}

impl<S, B, N> Clone for CancellationExecutor<S, B, N> {
    fn clone(&self) -> Self {
        Self {
            slots: self.slots.clone(),
            bookings: self.bookings.clone(),
            notifier: self.notifier.clone(),
        }
    }
}

impl<S, B, N> CancellationExecutor<S, B, N>
where
    S: SlotRepository + Send + Sync,
    B: BookingRepository + Send + Sync,
    N: Notifier + Send + Sync,
{
    pub fn new(slots: Arc<S>, bookings: Arc<B>, notifier: Arc<N>) -> Self {
        Self {
            slots,
            bookings,
            notifier,
        }
    }

    /// 予約をキャンセルして枠を解放する
    ///
    /// 枠の解放に失敗しても(並行して管理者が枠を停止した場合など)
    /// キャンセル自体は成立する。その場合はログに残し、枠側の整合は
    /// 管理ツールに委ねる。
    pub async fn cancel_booking(
        &self,
        booking_id: BookingId,
        actor: Actor,
        reason: Option<String>,
    ) -> Result<Booking, CancelBookingError> {
        let mut booking = self
            .bookings
            .find_by_id(booking_id)
            .await?
            .ok_or(CancelBookingError::NotFound)?;
        booking
            .cancel(actor, reason.clone(), Utc::now())
            .map_err(|e| match e {
                BookingError::AlreadyTerminal { status } => {
                    CancelBookingError::AlreadyTerminal { status }
                }
                other => CancelBookingError::Booking(other),
            })?;
        if let Err(e) = self.bookings.save(&mut booking).await {
            // 読み込み後に別の書き込みが先行した。呼び出し側は読み直して
            // やり直せる。
            return Err(match e {
                DataAccessError::RevisionConflict { .. } => CancelBookingError::Conflict,
                e => e.into(),
            });
        }

        if let Err(e) = self
            .slots
            .transition(booking.slot_id(), SlotStatus::Booked, SlotStatus::Available)
            .await
        {
            warn!(
                %booking_id,
                slot_id = %booking.slot_id(),
                error = %e,
                "slot was not released on cancellation"
            );
        }
        info!(%booking_id, reference = %booking.reference(), "booking cancelled");

        notify_best_effort(
            self.notifier.as_ref(),
            NotificationEvent::BookingCancelled {
                booking_id,
                customer_id: booking.customer_id(),
                reference: booking.reference().clone(),
                reason,
            },
        )
        .await;
        Ok(booking)
    }
}

/// キャンセルの失敗
#[derive(Error, Display, Debug)]
pub enum CancelBookingError {
    #[display(fmt = "Booking not found")]
    NotFound,
    #[display(fmt = "Booking was modified concurrently")]
    Conflict,
    #[display(fmt = "Booking is already terminal ({:?})", status)]
    AlreadyTerminal { status: BookingStatus },
    #[display(fmt = "Booking error: {}", _0)]
    Booking(#[error(source)] BookingError),
    #[display(fmt = "Data access error: {}", _0)]
    DataAccess(#[error(source)] DataAccessError),
}

impl From<DataAccessError> for CancelBookingError {
    fn from(value: DataAccessError) -> Self {
        Self::DataAccess(value)
    }
}

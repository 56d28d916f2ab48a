use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use migaki::application::{
    BookingExecutor, BookingUpdate, CancelBookingError, CancelRequestError, CancellationExecutor,
    CreateBookingError, DecideRescheduleError, Decision, RequestRescheduleError,
    RescheduleWorkflow, StatusPoller, UpdateBookingError,
};
use migaki::domain::core::{
    Actor, AdminId, Booking, BookingError, BookingId, BookingStatus, Currency, CustomerId, Money,
    RescheduleRequest, RescheduleRequestId, Slot, SlotId, SlotRepository, SlotStatus,
    SlotTransitionError,
};
use migaki::domain::{DataAccessError, Entity, ID_GENERATOR};
use migaki::infrastructure::core::{
    LogNotifier, MemoryBookingRepository, MemoryRescheduleRequestRepository, MemorySlotRepository,
};
use migaki::MigakiConfig;

#[tokio::main]
async fn main() {
    let config = MigakiConfig::load().unwrap();
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::from(&config.logger.level))
        .init();

    let slots = Arc::new(MemorySlotRepository::new());
    let bookings = Arc::new(MemoryBookingRepository::new());
    let reschedules = Arc::new(MemoryRescheduleRequestRepository::new());
    let notifier = Arc::new(LogNotifier);
    let ids = ID_GENERATOR.clone();

    let state = AppState {
        slots: slots.clone(),
        booking: BookingExecutor::new(slots.clone(), bookings.clone(), ids.clone()),
        cancellation: CancellationExecutor::new(slots.clone(), bookings.clone(), notifier.clone()),
        reschedule: RescheduleWorkflow::new(
            slots.clone(),
            bookings.clone(),
            reschedules.clone(),
            notifier,
            ids.clone(),
        ),
        poller: StatusPoller::new(slots, bookings, reschedules),
        ids,
    };

    let app = Router::new()
        .route("/slots", get(list_slots).post(create_slot))
        .route("/slots/:id/transition", post(transition_slot))
        .route("/bookings", post(create_booking))
        .route("/bookings/:id/status", post(update_booking_status))
        .route("/bookings/:id/cancel", post(cancel_booking))
        .route("/bookings/:id/reschedule", post(request_reschedule))
        .route("/reschedule-requests/:id/decision", post(decide_reschedule))
        .route("/reschedule-requests/:id/cancel", post(cancel_request))
        .route("/updates", get(poll_updates))
        .with_state(state);

    let addr = config.web.addr.parse().unwrap();
    info!(%addr, "migaki web listening");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await
        .unwrap();
}

#[derive(Clone)]
struct AppState {
    slots: Arc<MemorySlotRepository>,
    booking: BookingExecutor<MemorySlotRepository, MemoryBookingRepository>,
    cancellation: CancellationExecutor<MemorySlotRepository, MemoryBookingRepository, LogNotifier>,
    reschedule: RescheduleWorkflow<
        MemorySlotRepository,
        MemoryBookingRepository,
        MemoryRescheduleRequestRepository,
        LogNotifier,
    >,
    poller: StatusPoller<
        MemorySlotRepository,
        MemoryBookingRepository,
        MemoryRescheduleRequestRepository,
    >,
    ids: migaki::domain::IdGeneratorTask,
}

#[derive(Deserialize)]
struct SlotRange {
    from: NaiveDate,
    to: NaiveDate,
}

async fn list_slots(
    State(state): State<AppState>,
    Query(range): Query<SlotRange>,
) -> Result<Json<Vec<SlotView>>, ApiError> {
    let slots = state.slots.list_available(range.from..range.to).await?;
    Ok(Json(slots.iter().map(SlotView::from).collect()))
}

#[derive(Deserialize)]
struct CreateSlot {
    date: NaiveDate,
    start_time: NaiveTime,
    end_time: NaiveTime,
}

async fn create_slot(
    State(state): State<AppState>,
    Json(body): Json<CreateSlot>,
) -> Result<(StatusCode, Json<SlotView>), ApiError> {
    let id = state.ids.generate::<SlotId>().await;
    let mut slot = Slot::create(id, body.date, body.start_time, body.end_time)
        .map_err(|e| ApiError::unprocessable("invalid_window", e.to_string()))?;
    state.slots.save(&mut slot).await?;
    Ok((StatusCode::CREATED, Json(SlotView::from(&slot))))
}

#[derive(Deserialize)]
struct TransitionSlot {
    from: SlotStatus,
    to: SlotStatus,
}

async fn transition_slot(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(body): Json<TransitionSlot>,
) -> Result<StatusCode, ApiError> {
    // この入口で許すのは受付停止と再開だけ。Booked への遷移は予約
    // エグゼキューターの専権で、枠だけが予約済みになる経路は作らない。
    if !admin_transition_allowed(body.from, body.to) {
        return Err(ApiError::unprocessable(
            "unsupported_transition",
            format!("{:?} -> {:?} is not an admin transition", body.from, body.to),
        ));
    }
    state
        .slots
        .transition(SlotId::from(id), body.from, body.to)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

fn admin_transition_allowed(from: SlotStatus, to: SlotStatus) -> bool {
    matches!(
        (from, to),
        (SlotStatus::Available, SlotStatus::Blocked)
            | (SlotStatus::Booked, SlotStatus::Blocked)
            | (SlotStatus::Blocked, SlotStatus::Available)
    )
}

#[derive(Deserialize)]
struct CreateBooking {
    customer_id: u64,
    slot_id: u64,
    price_amount: u64,
    #[serde(default)]
    currency: Currency,
    notes: Option<String>,
}

async fn create_booking(
    State(state): State<AppState>,
    Json(body): Json<CreateBooking>,
) -> Result<(StatusCode, Json<BookingView>), ApiError> {
    let booking = state
        .booking
        .create_booking(
            CustomerId::from(body.customer_id),
            SlotId::from(body.slot_id),
            Money::new(body.price_amount, body.currency),
            body.notes,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(BookingView::from(&booking))))
}

#[derive(Deserialize)]
struct UpdateBookingStatus {
    admin_id: u64,
    status: BookingStatus,
    reason: Option<String>,
}

async fn update_booking_status(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(body): Json<UpdateBookingStatus>,
) -> Result<Json<BookingView>, ApiError> {
    let booking = state
        .booking
        .update_status(
            BookingId::from(id),
            body.status,
            Actor::Admin(AdminId::from(body.admin_id)),
            body.reason,
        )
        .await?;
    Ok(Json(BookingView::from(&booking)))
}

#[derive(Deserialize)]
struct CancelBooking {
    customer_id: u64,
    reason: Option<String>,
}

async fn cancel_booking(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(body): Json<CancelBooking>,
) -> Result<Json<BookingView>, ApiError> {
    let booking = state
        .cancellation
        .cancel_booking(
            BookingId::from(id),
            Actor::Customer(CustomerId::from(body.customer_id)),
            body.reason,
        )
        .await?;
    Ok(Json(BookingView::from(&booking)))
}

#[derive(Deserialize)]
struct RequestReschedule {
    customer_id: u64,
    requested_slot_id: u64,
    reason: String,
}

async fn request_reschedule(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(body): Json<RequestReschedule>,
) -> Result<(StatusCode, Json<RequestView>), ApiError> {
    let request = state
        .reschedule
        .request_reschedule(
            BookingId::from(id),
            CustomerId::from(body.customer_id),
            SlotId::from(body.requested_slot_id),
            body.reason,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(RequestView::from(&request))))
}

#[derive(Deserialize)]
struct DecideReschedule {
    admin_id: u64,
    decision: Decision,
    notes: Option<String>,
}

async fn decide_reschedule(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(body): Json<DecideReschedule>,
) -> Result<Json<RequestView>, ApiError> {
    let request = state
        .reschedule
        .decide_reschedule(
            RescheduleRequestId::from(id),
            AdminId::from(body.admin_id),
            body.decision,
            body.notes,
        )
        .await?;
    Ok(Json(RequestView::from(&request)))
}

#[derive(Deserialize)]
struct CancelRequest {
    customer_id: u64,
}

async fn cancel_request(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(body): Json<CancelRequest>,
) -> Result<Json<RequestView>, ApiError> {
    let request = state
        .reschedule
        .cancel_request(
            RescheduleRequestId::from(id),
            CustomerId::from(body.customer_id),
        )
        .await?;
    Ok(Json(RequestView::from(&request)))
}

#[derive(Deserialize)]
struct PollQuery {
    customer_id: u64,
    since: DateTime<Utc>,
    /// カンマ区切りの予約ID
    booking_ids: Option<String>,
}

async fn poll_updates(
    State(state): State<AppState>,
    Query(query): Query<PollQuery>,
) -> Result<Json<Vec<BookingUpdate>>, ApiError> {
    let booking_ids = match &query.booking_ids {
        Some(raw) => Some(
            raw.split(',')
                .map(|s| s.trim().parse::<u64>().map(BookingId::from))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| ApiError::unprocessable("invalid_booking_ids", raw.clone()))?,
        ),
        None => None,
    };
    let updates = state
        .poller
        .poll_updates(
            CustomerId::from(query.customer_id),
            query.since,
            booking_ids.as_deref(),
        )
        .await?;
    Ok(Json(updates))
}

#[derive(Serialize)]
struct SlotView {
    id: SlotId,
    date: NaiveDate,
    start_time: NaiveTime,
    end_time: NaiveTime,
    status: SlotStatus,
    window: String,
}

impl From<&Slot> for SlotView {
    fn from(slot: &Slot) -> Self {
        Self {
            id: slot.id(),
            date: slot.date(),
            start_time: slot.start_time(),
            end_time: slot.end_time(),
            status: slot.status(),
            window: slot.window(),
        }
    }
}

#[derive(Serialize)]
struct BookingView {
    id: BookingId,
    reference: String,
    customer_id: CustomerId,
    slot_id: SlotId,
    status: BookingStatus,
    price: Money,
    price_display: String,
    notes: Option<String>,
    reschedule_count: u32,
    status_changed_at: DateTime<Utc>,
}

impl From<&Booking> for BookingView {
    fn from(booking: &Booking) -> Self {
        Self {
            id: booking.id(),
            reference: booking.reference().to_string(),
            customer_id: booking.customer_id(),
            slot_id: booking.slot_id(),
            status: booking.status(),
            price: *booking.price(),
            price_display: booking.price().to_string(),
            notes: booking.notes().map(str::to_owned),
            reschedule_count: booking.reschedule_count(),
            status_changed_at: booking.status_changed_at(),
        }
    }
}

#[derive(Serialize)]
struct RequestView {
    id: RescheduleRequestId,
    booking_id: BookingId,
    original_slot_id: SlotId,
    requested_slot_id: SlotId,
    status: migaki::domain::core::RescheduleStatus,
    requested_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    response_notes: Option<String>,
}

impl From<&RescheduleRequest> for RequestView {
    fn from(request: &RescheduleRequest) -> Self {
        Self {
            id: request.id(),
            booking_id: request.booking_id(),
            original_slot_id: request.original_slot_id(),
            requested_slot_id: request.requested_slot_id(),
            status: request.status(),
            requested_at: request.requested_at(),
            expires_at: request.expires_at(),
            response_notes: request.response().and_then(|r| r.notes.clone()),
        }
    }
}

/// 安定したエラーコードと人間向けメッセージの組
struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn unprocessable(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, code, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "code": self.code,
            "message": self.message,
        }));
        (self.status, body).into_response()
    }
}

impl From<DataAccessError> for ApiError {
    fn from(e: DataAccessError) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "data_access", e.to_string())
    }
}

impl From<SlotTransitionError> for ApiError {
    fn from(e: SlotTransitionError) -> Self {
        let message = e.to_string();
        match e {
            SlotTransitionError::NotFound => {
                Self::new(StatusCode::NOT_FOUND, "slot_not_found", message)
            }
            SlotTransitionError::Conflict { .. } => {
                Self::new(StatusCode::CONFLICT, "slot_conflict", message)
            }
            SlotTransitionError::SlotError(_) => {
                Self::new(StatusCode::CONFLICT, "invalid_transition", message)
            }
            SlotTransitionError::DataAccess(e) => e.into(),
        }
    }
}

impl From<CreateBookingError> for ApiError {
    fn from(e: CreateBookingError) -> Self {
        let message = e.to_string();
        match e {
            CreateBookingError::SlotNotFound => {
                Self::new(StatusCode::NOT_FOUND, "slot_not_found", message)
            }
            CreateBookingError::SlotUnavailable => {
                Self::new(StatusCode::CONFLICT, "slot_unavailable", message)
            }
            CreateBookingError::DataAccess(e) => e.into(),
        }
    }
}

impl From<UpdateBookingError> for ApiError {
    fn from(e: UpdateBookingError) -> Self {
        let message = e.to_string();
        match e {
            UpdateBookingError::NotFound => {
                Self::new(StatusCode::NOT_FOUND, "booking_not_found", message)
            }
            UpdateBookingError::Conflict => {
                Self::new(StatusCode::CONFLICT, "booking_conflict", message)
            }
            UpdateBookingError::Booking(e) => booking_error(e),
            UpdateBookingError::DataAccess(e) => e.into(),
        }
    }
}

impl From<CancelBookingError> for ApiError {
    fn from(e: CancelBookingError) -> Self {
        let message = e.to_string();
        match e {
            CancelBookingError::NotFound => {
                Self::new(StatusCode::NOT_FOUND, "booking_not_found", message)
            }
            CancelBookingError::Conflict => {
                Self::new(StatusCode::CONFLICT, "booking_conflict", message)
            }
            CancelBookingError::AlreadyTerminal { .. } => {
                Self::new(StatusCode::CONFLICT, "already_terminal", message)
            }
            CancelBookingError::Booking(e) => booking_error(e),
            CancelBookingError::DataAccess(e) => e.into(),
        }
    }
}

impl From<RequestRescheduleError> for ApiError {
    fn from(e: RequestRescheduleError) -> Self {
        let message = e.to_string();
        match e {
            RequestRescheduleError::BookingNotFound => {
                Self::new(StatusCode::NOT_FOUND, "booking_not_found", message)
            }
            RequestRescheduleError::NotOwner => {
                Self::new(StatusCode::FORBIDDEN, "not_owner", message)
            }
            RequestRescheduleError::BookingNotConfirmed { .. } => {
                Self::new(StatusCode::CONFLICT, "booking_not_confirmed", message)
            }
            RequestRescheduleError::PendingRequestExists => {
                Self::new(StatusCode::CONFLICT, "pending_request_exists", message)
            }
            RequestRescheduleError::SlotNotFound => {
                Self::new(StatusCode::NOT_FOUND, "slot_not_found", message)
            }
            RequestRescheduleError::SlotUnavailable => {
                Self::new(StatusCode::CONFLICT, "slot_unavailable", message)
            }
            RequestRescheduleError::Request(_) => {
                Self::unprocessable("invalid_request", message)
            }
            RequestRescheduleError::DataAccess(e) => e.into(),
        }
    }
}

impl From<DecideRescheduleError> for ApiError {
    fn from(e: DecideRescheduleError) -> Self {
        let message = e.to_string();
        match e {
            DecideRescheduleError::NotFound => {
                Self::new(StatusCode::NOT_FOUND, "request_not_found", message)
            }
            DecideRescheduleError::BookingNotFound => {
                Self::new(StatusCode::NOT_FOUND, "booking_not_found", message)
            }
            DecideRescheduleError::RequestExpired => {
                Self::new(StatusCode::GONE, "request_expired", message)
            }
            DecideRescheduleError::AlreadyTerminal { .. } => {
                Self::new(StatusCode::CONFLICT, "already_terminal", message)
            }
            DecideRescheduleError::BookingNotConfirmed { .. } => {
                Self::new(StatusCode::CONFLICT, "booking_not_confirmed", message)
            }
            DecideRescheduleError::SlotNoLongerAvailable => {
                Self::new(StatusCode::CONFLICT, "slot_no_longer_available", message)
            }
            DecideRescheduleError::OriginalSlotConflict => {
                Self::new(StatusCode::CONFLICT, "original_slot_conflict", message)
            }
            DecideRescheduleError::BookingConflict => {
                Self::new(StatusCode::CONFLICT, "booking_conflict", message)
            }
            DecideRescheduleError::Booking(e) => booking_error(e),
            DecideRescheduleError::Request(_) => Self::unprocessable("invalid_request", message),
            DecideRescheduleError::DataAccess(e) => e.into(),
        }
    }
}

impl From<CancelRequestError> for ApiError {
    fn from(e: CancelRequestError) -> Self {
        let message = e.to_string();
        match e {
            CancelRequestError::NotFound => {
                Self::new(StatusCode::NOT_FOUND, "request_not_found", message)
            }
            CancelRequestError::BookingNotFound => {
                Self::new(StatusCode::NOT_FOUND, "booking_not_found", message)
            }
            CancelRequestError::NotOwner => {
                Self::new(StatusCode::FORBIDDEN, "not_owner", message)
            }
            CancelRequestError::RequestExpired => {
                Self::new(StatusCode::GONE, "request_expired", message)
            }
            CancelRequestError::Request(_) => Self::unprocessable("invalid_request", message),
            CancelRequestError::DataAccess(e) => e.into(),
        }
    }
}

fn booking_error(e: BookingError) -> ApiError {
    let message = e.to_string();
    match e {
        BookingError::AlreadyTerminal { .. } => {
            ApiError::new(StatusCode::CONFLICT, "already_terminal", message)
        }
        BookingError::InvalidTransition { .. } => {
            ApiError::new(StatusCode::CONFLICT, "invalid_transition", message)
        }
        _ => ApiError::unprocessable("invalid_booking", message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admin_transition_limited_to_block_and_unblock() {
        assert!(admin_transition_allowed(
            SlotStatus::Available,
            SlotStatus::Blocked
        ));
        assert!(admin_transition_allowed(
            SlotStatus::Booked,
            SlotStatus::Blocked
        ));
        assert!(admin_transition_allowed(
            SlotStatus::Blocked,
            SlotStatus::Available
        ));
        // 予約エグゼキューターを迂回する遷移は通さない
        assert!(!admin_transition_allowed(
            SlotStatus::Available,
            SlotStatus::Booked
        ));
        assert!(!admin_transition_allowed(
            SlotStatus::Booked,
            SlotStatus::Available
        ));
    }
}

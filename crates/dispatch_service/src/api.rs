//! JSON HTTP surface over [`DispatchEngine`].
//!
//! The engine is synchronous (store CAS, blocking provider calls), so every
//! handler hops onto the blocking pool.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use dispatch_core::geo::GeoPoint;
use dispatch_core::pricing::Money;
use dispatch_core::ride::{RideRequest, TripActuals};
use dispatch_core::stops::StopRequest;
use dispatch_core::types::{
    DriverId, OfferId, PassengerId, PaymentMethod, RequestId, RideId, RideKind, VehicleClass,
    VehicleDescriptor,
};
use dispatch_core::{DispatchEngine, DispatchError, DispatchResult};
use serde::{Deserialize, Serialize};
use tracing::error;

pub type AppState = Arc<DispatchEngine>;

pub fn router(engine: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/telemetry", get(telemetry))
        .route("/drivers/{driver_id}", post(register_driver).get(driver))
        .route("/drivers/{driver_id}/online", post(go_online))
        .route("/drivers/{driver_id}/offline", post(go_offline))
        .route("/drivers/{driver_id}/location", post(report_location))
        .route("/drivers/{driver_id}/debt", get(driver_debt))
        .route("/rides", post(request_ride))
        .route("/rides/{ride_id}", get(ride))
        .route("/rides/{ride_id}/audit", get(audit_log))
        .route("/rides/{ride_id}/approaching", post(mark_approaching))
        .route("/rides/{ride_id}/arrived", post(mark_arrived))
        .route("/rides/{ride_id}/start", post(start_trip))
        .route("/rides/{ride_id}/stops", post(add_stop))
        .route("/rides/{ride_id}/stops/next", post(complete_next_stop))
        .route("/rides/{ride_id}/finish", post(finish_trip))
        .route("/rides/{ride_id}/cancel/passenger", post(cancel_by_passenger))
        .route("/rides/{ride_id}/cancel/driver", post(cancel_by_driver))
        .route("/rides/{ride_id}/settlement", get(settlement).post(settle))
        .route("/offers/{offer_id}", get(offer))
        .route("/offers/{offer_id}/accept", post(accept_offer))
        .route("/offers/{offer_id}/decline", post(decline_offer))
        .route("/routes/estimate", post(estimate_route))
        .route("/payments/confirm", post(confirm_payment))
        .route("/wallets/{passenger_id}", get(wallet_balance))
        .route("/wallets/{passenger_id}/top-up", post(top_up_wallet))
        .with_state(engine)
}

// ============ Errors ============

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

pub enum ApiError {
    Dispatch(DispatchError),
    Internal(String),
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        ApiError::Dispatch(err)
    }
}

/// HTTP status for an engine error code.
pub fn status_for(code: &str) -> StatusCode {
    match code {
        "invalid_transition" | "already_taken" | "offer_expired" | "stale_location"
        | "driver_unavailable" | "conflict" => StatusCode::CONFLICT,
        "not_a_candidate" => StatusCode::FORBIDDEN,
        "not_found" => StatusCode::NOT_FOUND,
        "invalid_request" | "invalid_ride_state" | "payment_mismatch" => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        "implausible_location" => StatusCode::ACCEPTED,
        "settlement_failed" => StatusCode::BAD_GATEWAY,
        "no_drivers_available" | "route_unavailable" | "storage" => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            // Dropped and logged by the engine; the device just moves on.
            ApiError::Dispatch(DispatchError::ImplausibleLocation { .. }) => {
                return StatusCode::ACCEPTED.into_response();
            }
            ApiError::Dispatch(err) => {
                let code = err.code();
                (
                    status_for(code),
                    ErrorBody {
                        error: code,
                        message: err.to_string(),
                    },
                )
            }
            ApiError::Internal(message) => {
                error!(%message, "request handler failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorBody {
                        error: "internal",
                        message,
                    },
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Runs an engine call on the blocking pool.
async fn blocking<T, F>(engine: AppState, call: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce(&DispatchEngine) -> DispatchResult<T> + Send + 'static,
{
    let result = tokio::task::spawn_blocking(move || call(&engine))
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    Ok(Json(result?))
}

// ============ Drivers ============

#[derive(Debug, Deserialize)]
struct LocationBody {
    lat: f64,
    lng: f64,
    heading: Option<f64>,
    /// Device timestamp; server time when absent.
    timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct AmountBody {
    amount: Money,
}

async fn health() -> &'static str {
    "ok"
}

async fn telemetry(State(engine): State<AppState>) -> impl IntoResponse {
    Json(engine.telemetry())
}

async fn register_driver(
    State(engine): State<AppState>,
    Path(driver_id): Path<DriverId>,
    Json(vehicle): Json<VehicleDescriptor>,
) -> impl IntoResponse {
    blocking(engine, move |engine| engine.register_driver(driver_id, vehicle)).await
}

async fn driver(
    State(engine): State<AppState>,
    Path(driver_id): Path<DriverId>,
) -> impl IntoResponse {
    blocking(engine, move |engine| engine.driver(driver_id)).await
}

async fn go_online(
    State(engine): State<AppState>,
    Path(driver_id): Path<DriverId>,
) -> impl IntoResponse {
    blocking(engine, move |engine| engine.go_online(driver_id)).await
}

async fn go_offline(
    State(engine): State<AppState>,
    Path(driver_id): Path<DriverId>,
) -> impl IntoResponse {
    blocking(engine, move |engine| engine.go_offline(driver_id)).await
}

async fn report_location(
    State(engine): State<AppState>,
    Path(driver_id): Path<DriverId>,
    Json(body): Json<LocationBody>,
) -> impl IntoResponse {
    let timestamp = body.timestamp.unwrap_or_else(Utc::now);
    let point = GeoPoint::new(body.lat, body.lng);
    blocking(engine, move |engine| {
        engine.report_location(driver_id, point, body.heading, timestamp)
    })
    .await
}

async fn driver_debt(
    State(engine): State<AppState>,
    Path(driver_id): Path<DriverId>,
) -> impl IntoResponse {
    blocking(engine, move |engine| {
        engine
            .driver_debt(driver_id)
            .map(|amount| AmountBody { amount })
    })
    .await
}

// ============ Rides and offers ============

#[derive(Debug, Deserialize)]
struct RideRequestBody {
    passenger_id: PassengerId,
    #[serde(default = "default_kind")]
    kind: RideKind,
    origin: GeoPoint,
    destination: Option<GeoPoint>,
    vehicle_class: VehicleClass,
    payment_method: PaymentMethod,
}

fn default_kind() -> RideKind {
    RideKind::Now
}

#[derive(Debug, Deserialize)]
struct DriverBody {
    driver_id: DriverId,
}

#[derive(Debug, Deserialize)]
struct StartBody {
    driver_id: DriverId,
    pin: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FinishBody {
    driver_id: DriverId,
    #[serde(flatten)]
    actuals: TripActuals,
}

#[derive(Debug, Deserialize)]
struct PassengerCancelBody {
    passenger_id: PassengerId,
    note: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DriverCancelBody {
    driver_id: DriverId,
    note: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StopBody {
    passenger_id: PassengerId,
    #[serde(flatten)]
    stop: StopRequest,
}

async fn request_ride(
    State(engine): State<AppState>,
    Json(body): Json<RideRequestBody>,
) -> Result<impl IntoResponse, ApiError> {
    let request = RideRequest {
        id: RequestId::new(),
        passenger_id: body.passenger_id,
        kind: body.kind,
        origin: body.origin,
        destination: body.destination,
        vehicle_class: body.vehicle_class,
        payment_method: body.payment_method,
        created_at: Utc::now(),
    };
    let offer = blocking(engine, move |engine| engine.request_ride(request)).await?;
    Ok((StatusCode::CREATED, offer))
}

async fn ride(State(engine): State<AppState>, Path(ride_id): Path<RideId>) -> impl IntoResponse {
    blocking(engine, move |engine| engine.ride(ride_id)).await
}

async fn audit_log(
    State(engine): State<AppState>,
    Path(ride_id): Path<RideId>,
) -> impl IntoResponse {
    blocking(engine, move |engine| engine.audit_log(ride_id)).await
}

async fn offer(State(engine): State<AppState>, Path(offer_id): Path<OfferId>) -> impl IntoResponse {
    blocking(engine, move |engine| engine.offer(offer_id)).await
}

async fn accept_offer(
    State(engine): State<AppState>,
    Path(offer_id): Path<OfferId>,
    Json(body): Json<DriverBody>,
) -> impl IntoResponse {
    blocking(engine, move |engine| engine.accept_offer(offer_id, body.driver_id)).await
}

async fn decline_offer(
    State(engine): State<AppState>,
    Path(offer_id): Path<OfferId>,
    Json(body): Json<DriverBody>,
) -> impl IntoResponse {
    blocking(engine, move |engine| engine.decline_offer(offer_id, body.driver_id)).await
}

async fn mark_approaching(
    State(engine): State<AppState>,
    Path(ride_id): Path<RideId>,
    Json(body): Json<DriverBody>,
) -> impl IntoResponse {
    blocking(engine, move |engine| engine.mark_approaching(ride_id, body.driver_id)).await
}

async fn mark_arrived(
    State(engine): State<AppState>,
    Path(ride_id): Path<RideId>,
    Json(body): Json<DriverBody>,
) -> impl IntoResponse {
    blocking(engine, move |engine| engine.mark_arrived(ride_id, body.driver_id)).await
}

async fn start_trip(
    State(engine): State<AppState>,
    Path(ride_id): Path<RideId>,
    Json(body): Json<StartBody>,
) -> impl IntoResponse {
    blocking(engine, move |engine| {
        engine.start_trip(ride_id, body.driver_id, body.pin.as_deref())
    })
    .await
}

async fn add_stop(
    State(engine): State<AppState>,
    Path(ride_id): Path<RideId>,
    Json(body): Json<StopBody>,
) -> impl IntoResponse {
    blocking(engine, move |engine| {
        engine.add_stop(ride_id, body.passenger_id, body.stop)
    })
    .await
}

async fn complete_next_stop(
    State(engine): State<AppState>,
    Path(ride_id): Path<RideId>,
    Json(body): Json<DriverBody>,
) -> impl IntoResponse {
    blocking(engine, move |engine| engine.complete_next_stop(ride_id, body.driver_id)).await
}

async fn finish_trip(
    State(engine): State<AppState>,
    Path(ride_id): Path<RideId>,
    Json(body): Json<FinishBody>,
) -> impl IntoResponse {
    blocking(engine, move |engine| {
        engine.finish_trip(ride_id, body.driver_id, body.actuals)
    })
    .await
}

async fn cancel_by_passenger(
    State(engine): State<AppState>,
    Path(ride_id): Path<RideId>,
    Json(body): Json<PassengerCancelBody>,
) -> impl IntoResponse {
    blocking(engine, move |engine| {
        engine.cancel_by_passenger(ride_id, body.passenger_id, body.note)
    })
    .await
}

async fn cancel_by_driver(
    State(engine): State<AppState>,
    Path(ride_id): Path<RideId>,
    Json(body): Json<DriverCancelBody>,
) -> impl IntoResponse {
    blocking(engine, move |engine| {
        engine.cancel_by_driver(ride_id, body.driver_id, body.note)
    })
    .await
}

// ============ Routing and money ============

#[derive(Debug, Deserialize)]
struct EstimateBody {
    points: Vec<GeoPoint>,
}

#[derive(Debug, Deserialize)]
struct ConfirmBody {
    reference: String,
    amount: Money,
}

#[derive(Debug, Deserialize)]
struct TopUpBody {
    amount: Money,
}

async fn estimate_route(
    State(engine): State<AppState>,
    Json(body): Json<EstimateBody>,
) -> impl IntoResponse {
    blocking(engine, move |engine| engine.estimate_route(&body.points)).await
}

async fn settle(State(engine): State<AppState>, Path(ride_id): Path<RideId>) -> impl IntoResponse {
    blocking(engine, move |engine| engine.settle(ride_id)).await
}

async fn settlement(
    State(engine): State<AppState>,
    Path(ride_id): Path<RideId>,
) -> impl IntoResponse {
    blocking(engine, move |engine| engine.settlement(ride_id)).await
}

/// Gateway webhook. Safe to deliver more than once.
async fn confirm_payment(
    State(engine): State<AppState>,
    Json(body): Json<ConfirmBody>,
) -> impl IntoResponse {
    blocking(engine, move |engine| {
        engine.confirm_payment(&body.reference, body.amount)
    })
    .await
}

async fn wallet_balance(
    State(engine): State<AppState>,
    Path(passenger_id): Path<PassengerId>,
) -> impl IntoResponse {
    blocking(engine, move |engine| {
        engine
            .wallet_balance(passenger_id)
            .map(|amount| AmountBody { amount })
    })
    .await
}

async fn top_up_wallet(
    State(engine): State<AppState>,
    Path(passenger_id): Path<PassengerId>,
    Json(body): Json<TopUpBody>,
) -> impl IntoResponse {
    blocking(engine, move |engine| {
        engine
            .top_up_wallet(passenger_id, body.amount)
            .map(|amount| AmountBody { amount })
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header;
    use dispatch_core::error::LocationRejection;

    #[test]
    fn races_and_transitions_map_to_conflict() {
        for code in ["invalid_transition", "already_taken", "offer_expired", "conflict"] {
            assert_eq!(status_for(code), StatusCode::CONFLICT, "{code}");
        }
    }

    #[test]
    fn every_engine_code_has_a_specific_status() {
        let ride_id = RideId::new();
        let errors = [
            DispatchError::NoDriversAvailable { ride_id },
            DispatchError::SettlementFailed {
                ride_id,
                reason: "gateway down".into(),
            },
            DispatchError::InvalidRequest("bad".into()),
            DispatchError::RouteUnavailable("osrm".into()),
            DispatchError::Storage(dispatch_core::StoreError::not_found("ride", ride_id)),
        ];
        let statuses: Vec<_> = errors.iter().map(|err| status_for(err.code())).collect();
        assert_eq!(
            statuses,
            vec![
                StatusCode::SERVICE_UNAVAILABLE,
                StatusCode::BAD_GATEWAY,
                StatusCode::UNPROCESSABLE_ENTITY,
                StatusCode::SERVICE_UNAVAILABLE,
                StatusCode::NOT_FOUND,
            ]
        );
    }

    #[test]
    fn implausible_location_is_accepted_without_a_body() {
        let err = DispatchError::ImplausibleLocation {
            driver_id: DriverId::new(),
            reason: LocationRejection::TooFast { speed_kmh: 900.0 },
        };
        let response = ApiError::from(err).into_response();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert!(response.headers().get(header::CONTENT_TYPE).is_none());
    }
}

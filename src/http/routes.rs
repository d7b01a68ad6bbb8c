//! Request handlers
//!
//! Handlers stay thin: parse, call a service, map the result. Every error is
//! a [`LedgerError`] and renders as `{ "error": ... }` with its status code.

use std::collections::HashSet;
use std::future::Future;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::SharedState;
use crate::badges::next_badge;
use crate::donations::{DonationReceipt, NewDonation};
use crate::error::{LedgerError, Result};
use crate::ledger::{ActionOutcome, ActionRequest};
use crate::types::{ActionKind, Badge, Donation, DonationStatus, EarnedBadge, UserStanding};

/// Largest `limit` accepted by the leaderboard endpoint
pub const MAX_LEADERBOARD_LIMIT: usize = 100;

/// Health check endpoint
pub async fn health(State(state): State<SharedState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "subscribers": state.services.bus.subscriber_count(),
    }))
}

// === Ledger ===

/// Body of `POST /api/actions`.
///
/// Either a `kind` from the point table, or an explicit `points` grant (an
/// adjustment). Deltas are signed here so negatives can be rejected cleanly.
#[derive(Debug, Deserialize)]
pub struct RecordActionBody {
    pub user_id: String,
    #[serde(default)]
    pub kind: Option<ActionKind>,
    #[serde(default)]
    pub points: Option<i64>,
    #[serde(default)]
    pub donations: Option<i64>,
    #[serde(default)]
    pub action_id: Option<String>,
}

impl RecordActionBody {
    pub fn into_request(self, state: &SharedState) -> Result<ActionRequest> {
        let request = match self.kind {
            Some(kind) if kind != ActionKind::Adjustment => {
                if self.points.is_some() || self.donations.is_some() {
                    return Err(LedgerError::Validation(
                        "explicit points or donations are only allowed for adjustments".into(),
                    ));
                }
                ActionRequest::for_kind(kind, self.user_id, &state.services.points)?
            }
            _ => {
                let points = self
                    .points
                    .ok_or_else(|| LedgerError::Validation("points is required for adjustments".into()))?;
                let donations = self.donations.unwrap_or(0);
                ActionRequest::new(
                    self.user_id,
                    non_negative("points", points)?,
                    non_negative("donations", donations)?,
                )
            }
        };

        Ok(match self.action_id {
            Some(action_id) => request.with_action_id(action_id),
            None => request,
        })
    }
}

fn non_negative(field: &str, value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| LedgerError::Validation(format!("{} must not be negative", field)))
}

/// Wait on a ledger write for at most the configured timeout.
///
/// Timing out only stops the wait; the write itself runs to completion.
async fn with_timeout<T>(state: &SharedState, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout(state.action_timeout, fut)
        .await
        .map_err(|_| LedgerError::Timeout(state.action_timeout.as_millis() as u64))?
}

/// POST /api/actions
pub async fn record_action(
    State(state): State<SharedState>,
    Json(body): Json<RecordActionBody>,
) -> Result<Json<ActionOutcome>> {
    let request = body.into_request(&state)?;
    let outcome = with_timeout(&state, state.services.ledger.record_action_detailed(request)).await?;
    Ok(Json(outcome))
}

/// GET /api/standings/:user_id
pub async fn get_standing(
    State(state): State<SharedState>,
    Path(user_id): Path<String>,
) -> Result<Json<UserStanding>> {
    Ok(Json(state.services.ledger.get_standing(&user_id).await?))
}

#[derive(Debug, Serialize)]
pub struct NextBadge {
    pub badge: Badge,
    pub remaining: u64,
}

#[derive(Debug, Serialize)]
pub struct UserBadgesResponse {
    pub user_id: String,
    pub points: u64,
    pub earned: Vec<EarnedBadge>,
    pub next: Option<NextBadge>,
}

/// GET /api/users/:user_id/badges
pub async fn user_badges(
    State(state): State<SharedState>,
    Path(user_id): Path<String>,
) -> Result<Json<UserBadgesResponse>> {
    let ledger = &state.services.ledger;
    let standing = ledger.get_standing(&user_id).await?;
    let earned = ledger.earned_badges(&user_id).await?;
    let catalog = ledger.badge_catalog().await?;

    let held: HashSet<String> = earned.iter().map(|e| e.badge_id.clone()).collect();
    let next = next_badge(&standing, &catalog, &held).map(|(badge, remaining)| NextBadge {
        badge: badge.clone(),
        remaining,
    });

    Ok(Json(UserBadgesResponse {
        user_id: standing.user_id,
        points: standing.points,
        earned,
        next,
    }))
}

/// GET /api/badges
pub async fn badge_catalog(State(state): State<SharedState>) -> Result<Json<Vec<Badge>>> {
    Ok(Json(state.services.ledger.badge_catalog().await?))
}

#[derive(Debug, Deserialize)]
pub struct LeaderboardQuery {
    pub limit: Option<usize>,
}

/// GET /api/leaderboard?limit=N
pub async fn leaderboard(
    State(state): State<SharedState>,
    Query(query): Query<LeaderboardQuery>,
) -> Result<Json<Vec<UserStanding>>> {
    let default_limit = state.services.leaderboard.read().await.capacity();
    let limit = query.limit.unwrap_or(default_limit);
    if limit == 0 || limit > MAX_LEADERBOARD_LIMIT {
        return Err(LedgerError::Validation(format!(
            "limit must be between 1 and {}",
            MAX_LEADERBOARD_LIMIT
        )));
    }
    Ok(Json(state.services.top_standings(limit).await?))
}

// === Donations ===

/// POST /api/donations
pub async fn create_donation(
    State(state): State<SharedState>,
    Json(input): Json<NewDonation>,
) -> Result<(StatusCode, Json<DonationReceipt>)> {
    let receipt = with_timeout(&state, state.services.donations.create(input)).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

/// GET /api/donations
pub async fn list_donations(State(state): State<SharedState>) -> Result<Json<Vec<Donation>>> {
    Ok(Json(state.services.donations.list_available().await?))
}

/// GET /api/donations/:id
pub async fn get_donation(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Donation>> {
    Ok(Json(state.services.donations.get(&id).await?))
}

#[derive(Debug, Deserialize)]
pub struct UpdateDonationBody {
    pub status: DonationStatus,
}

/// PATCH /api/donations/:id
pub async fn update_donation(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateDonationBody>,
) -> Result<Json<Donation>> {
    Ok(Json(state.services.donations.update_status(&id, body.status).await?))
}

/// DELETE /api/donations/:id
pub async fn delete_donation(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    state.services.donations.remove(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::AppState;
    use crate::services::Services;
    use std::sync::Arc;
    use std::time::Duration;

    fn state() -> SharedState {
        Arc::new(AppState::new(Arc::new(Services::in_memory()), Duration::from_secs(1)))
    }

    fn body(kind: Option<ActionKind>, points: Option<i64>) -> RecordActionBody {
        RecordActionBody {
            user_id: "ada".into(),
            kind,
            points,
            donations: None,
            action_id: None,
        }
    }

    #[test]
    fn test_negative_points_rejected() {
        let err = body(None, Some(-5)).into_request(&state()).unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }

    #[test]
    fn test_kind_uses_point_table() {
        let request = body(Some(ActionKind::ProfileCompleted), None)
            .into_request(&state())
            .unwrap();
        assert_eq!((request.points_delta, request.donation_increment), (20, 0));
    }

    #[test]
    fn test_kind_with_explicit_points_rejected() {
        let err = body(Some(ActionKind::DonationCreated), Some(100))
            .into_request(&state())
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }

    #[test]
    fn test_adjustment_needs_points() {
        assert!(body(Some(ActionKind::Adjustment), None).into_request(&state()).is_err());
        let request = body(Some(ActionKind::Adjustment), Some(7)).into_request(&state()).unwrap();
        assert_eq!(request.points_delta, 7);
    }
}

//! One user's badge board

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;

use super::{Reconcile, SnapshotSource, View};
use crate::bus::TopicSet;
use crate::error::Result;
use crate::types::{Badge, ChangeEvent, Topic, UserStanding};

/// How a catalog badge is shown to the viewed user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BadgeState {
    Earned,
    /// Points already meet the threshold; the award has not landed yet
    Unlockable,
    Locked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BadgeTile {
    pub badge: Badge,
    pub state: BadgeState,
    /// Points still needed; only set for locked badges
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u64>,
}

#[derive(Debug, Default)]
struct BoardState {
    catalog: Vec<Badge>,
    earned: HashSet<String>,
    standing: Option<UserStanding>,
}

/// Clones share the same board, so keep one to read while
/// [`spawn_view`](super::spawn_view) drives the other.
#[derive(Clone)]
pub struct BadgeBoardView {
    user_id: String,
    state: Arc<RwLock<BoardState>>,
}

impl BadgeBoardView {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            state: Arc::new(RwLock::new(BoardState::default())),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Catalog order, each badge with its display state
    pub async fn tiles(&self) -> Vec<BadgeTile> {
        let state = self.state.read().await;
        let standing = state
            .standing
            .clone()
            .unwrap_or_else(|| UserStanding::zero(&self.user_id));

        state
            .catalog
            .iter()
            .map(|badge| {
                let (badge_state, remaining) = if state.earned.contains(&badge.id) {
                    (BadgeState::Earned, None)
                } else if standing.points >= badge.points_required {
                    (BadgeState::Unlockable, None)
                } else {
                    (BadgeState::Locked, Some(badge.points_required - standing.points))
                };
                BadgeTile {
                    badge: badge.clone(),
                    state: badge_state,
                    remaining,
                }
            })
            .collect()
    }

    pub async fn earned_count(&self) -> usize {
        self.state.read().await.earned.len()
    }
}

#[async_trait::async_trait]
impl View for BadgeBoardView {
    fn name(&self) -> &'static str {
        "badge_board"
    }

    fn topics(&self) -> TopicSet {
        [Topic::Badges, Topic::Stats].into_iter().collect()
    }

    async fn resync(&mut self, source: &dyn SnapshotSource) -> Result<()> {
        let catalog = source.badge_catalog().await?;
        let earned = source.earned_badges(&self.user_id).await?;
        let standing = source.standing(&self.user_id).await?;

        let mut state = self.state.write().await;
        state.catalog = catalog;
        state.earned = earned.into_iter().map(|e| e.badge_id).collect();
        state.standing = Some(standing);
        Ok(())
    }

    async fn apply(&mut self, event: &ChangeEvent, _source: &dyn SnapshotSource) -> Result<Reconcile> {
        match event {
            ChangeEvent::BadgeAwarded { user_id, badge_id } if *user_id == self.user_id => {
                self.state.write().await.earned.insert(badge_id.clone());
                Ok(Reconcile::Applied)
            }
            ChangeEvent::StatsChanged { user_id, points, donation_count } if *user_id == self.user_id => {
                let mut state = self.state.write().await;
                let standing = state
                    .standing
                    .get_or_insert_with(|| UserStanding::zero(user_id.as_str()));
                standing.points = standing.points.max(*points);
                standing.donation_count = standing.donation_count.max(*donation_count);
                Ok(Reconcile::Applied)
            }
            _ => Ok(Reconcile::Ignored),
        }
    }
}

//! Core records shared by the store, the ledger and the views

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A user's current points and donation count.
///
/// Both counters only ever grow. A user with no recorded action has an
/// implicit zero standing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserStanding {
    pub user_id: String,
    pub points: u64,
    pub donation_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl UserStanding {
    pub fn zero(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            points: 0,
            donation_count: 0,
            updated_at: None,
        }
    }

    /// Leaderboard order: points descending, then user id ascending.
    pub fn rank_cmp(&self, other: &Self) -> Ordering {
        other
            .points
            .cmp(&self.points)
            .then_with(|| self.user_id.cmp(&other.user_id))
    }
}

/// Badge catalog entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Badge {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub icon: String,
    pub points_required: u64,
}

impl Badge {
    /// Evaluation order: threshold ascending, then id.
    pub fn threshold_cmp(&self, other: &Self) -> Ordering {
        self.points_required
            .cmp(&other.points_required)
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// A badge held by a user. `(user_id, badge_id)` is unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EarnedBadge {
    pub user_id: String,
    pub badge_id: String,
    pub earned_at: DateTime<Utc>,
}

/// Event bus topics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Stats,
    Badges,
    Donations,
}

impl Topic {
    pub const ALL: [Topic; 3] = [Topic::Stats, Topic::Badges, Topic::Donations];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Stats => "stats",
            Topic::Badges => "badges",
            Topic::Donations => "donations",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stats" => Ok(Topic::Stats),
            "badges" => Ok(Topic::Badges),
            "donations" => Ok(Topic::Donations),
            other => Err(format!("unknown topic: {other}")),
        }
    }
}

/// What happened to a donation listing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DonationOp {
    Created,
    Updated,
    Removed,
}

/// Change notification carried by the event bus.
///
/// Notifications are signals to refresh, not a source of truth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeEvent {
    StatsChanged {
        user_id: String,
        points: u64,
        donation_count: u64,
    },
    BadgeAwarded {
        user_id: String,
        badge_id: String,
    },
    DonationChanged {
        donation_id: String,
        op: DonationOp,
    },
}

impl ChangeEvent {
    pub fn topic(&self) -> Topic {
        match self {
            ChangeEvent::StatsChanged { .. } => Topic::Stats,
            ChangeEvent::BadgeAwarded { .. } => Topic::Badges,
            ChangeEvent::DonationChanged { .. } => Topic::Donations,
        }
    }

    pub fn stats(standing: &UserStanding) -> Self {
        ChangeEvent::StatsChanged {
            user_id: standing.user_id.clone(),
            points: standing.points,
            donation_count: standing.donation_count,
        }
    }
}

/// Qualifying actions that grant points
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    DonationCreated,
    ProfileCompleted,
    RequestFulfilled,
    /// Administrative grant with an explicit delta
    Adjustment,
}

/// Lifecycle of a donation listing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DonationStatus {
    Available,
    Claimed,
    Expired,
}

impl DonationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DonationStatus::Available => "available",
            DonationStatus::Claimed => "claimed",
            DonationStatus::Expired => "expired",
        }
    }
}

impl FromStr for DonationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(DonationStatus::Available),
            "claimed" => Ok(DonationStatus::Claimed),
            "expired" => Ok(DonationStatus::Expired),
            other => Err(format!("unknown donation status: {other}")),
        }
    }
}

/// A food listing, limited to what the map view renders
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Donation {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub food_type: String,
    pub quantity: String,
    pub latitude: f64,
    pub longitude: f64,
    pub status: DonationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn standing(user: &str, points: u64) -> UserStanding {
        UserStanding {
            points,
            ..UserStanding::zero(user)
        }
    }

    #[test]
    fn test_rank_order_breaks_ties_by_user_id() {
        let mut rows = vec![standing("carol", 10), standing("bob", 30), standing("alice", 10)];
        rows.sort_by(UserStanding::rank_cmp);

        let ids: Vec<_> = rows.iter().map(|r| r.user_id.as_str()).collect();
        assert_eq!(ids, vec!["bob", "alice", "carol"]);
    }

    #[test]
    fn test_change_event_wire_format() {
        let event = ChangeEvent::DonationChanged {
            donation_id: "d-1".into(),
            op: DonationOp::Removed,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "donation_changed");
        assert_eq!(json["op"], "removed");
        assert_eq!(event.topic(), Topic::Donations);
    }

    #[test]
    fn test_topic_parse() {
        assert_eq!("Stats".parse::<Topic>().unwrap(), Topic::Stats);
        assert!("leaderboard".parse::<Topic>().is_err());
    }
}

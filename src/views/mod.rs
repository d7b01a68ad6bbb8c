//! Read-side views kept fresh by the event bus
//!
//! A view mounts with a full snapshot, then applies change events one at a
//! time. Events are hints: a view re-reads whatever it cannot derive from the
//! event itself. On `Lagged` or reconnect the driver throws incremental state
//! away and takes a new snapshot.
//!
//! ```text
//! subscribe(topics) ──► resync(snapshot) ──► apply(event) ... ──► Lagged ──► resync
//! ```

pub mod badge_board;
pub mod driver;
pub mod leaderboard;
pub mod map;

pub use badge_board::{BadgeBoardView, BadgeState, BadgeTile};
pub use driver::{spawn_view, ViewHandle};
pub use leaderboard::{CacheUpdate, LeaderboardCache, LeaderboardView, SharedLeaderboard};
pub use map::MapView;

use crate::bus::TopicSet;
use crate::error::Result;
use crate::types::{Badge, ChangeEvent, Donation, EarnedBadge, UserStanding};

/// Point-in-time reads a view can fall back on
#[async_trait::async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn leaderboard(&self, limit: usize) -> Result<Vec<UserStanding>>;

    async fn standing(&self, user_id: &str) -> Result<UserStanding>;

    async fn earned_badges(&self, user_id: &str) -> Result<Vec<EarnedBadge>>;

    async fn badge_catalog(&self) -> Result<Vec<Badge>>;

    async fn donation(&self, id: &str) -> Result<Option<Donation>>;

    async fn available_donations(&self) -> Result<Vec<Donation>>;
}

/// What a view did with one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconcile {
    /// Updated in place from the event alone
    Applied,
    /// Not relevant to this view
    Ignored,
    /// Re-read from the snapshot source
    Refetched,
    /// Entry removed from the view
    Dropped(String),
}

#[async_trait::async_trait]
pub trait View: Send + 'static {
    fn name(&self) -> &'static str;

    fn topics(&self) -> TopicSet;

    /// Discard local state and load a fresh snapshot
    async fn resync(&mut self, source: &dyn SnapshotSource) -> Result<()>;

    async fn apply(&mut self, event: &ChangeEvent, source: &dyn SnapshotSource) -> Result<Reconcile>;
}

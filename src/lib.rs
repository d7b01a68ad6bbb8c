//! Harvest Ledger - points, badges and live feeds for community food sharing
//!
//! Donors list surplus food; every qualifying action earns points, points
//! unlock badges, and everyone watching a leaderboard, a badge board or the
//! donation map sees the change as it happens.
//!
//! ## Architecture
//!
//! ```text
//! HTTP / WebSocket (axum)
//!     ↓
//! DonationService ──► LedgerService ──► LedgerStore (SQLite | memory)
//!                          │
//!                          ▼
//!                      EventBus ──► views (leaderboard, badge board, map)
//!                                └► /ws feed clients
//! ```
//!
//! ## Guarantees
//!
//! - Actions for one user are serialized; different users never wait on each other
//! - A badge is awarded at most once per user, even under concurrent threshold crossings
//! - A `StatsChanged` always precedes the `BadgeAwarded` events of the same action
//! - A failed write publishes nothing
//! - Slow subscribers lose the oldest events and are told to resync

pub mod badges;
pub mod bus;
pub mod config;
pub mod donations;
pub mod error;
pub mod http;
pub mod ledger;
pub mod notify;
pub mod services;
pub mod store;
pub mod types;
pub mod views;

pub use bus::{Envelope, EventBus, Subscription, SubscriptionError, TopicSet};
pub use config::{Args, LedgerConfig, PointsConfig};
pub use donations::{DonationReceipt, DonationService, NewDonation};
pub use error::{ConfigError, LedgerError, StoreError};
pub use ledger::{ActionOutcome, ActionRequest, LedgerService};
pub use services::Services;
pub use store::{LedgerStore, MemoryStore, SqliteStore};
pub use types::{ActionKind, Badge, ChangeEvent, Donation, DonationOp, DonationStatus, EarnedBadge, Topic, UserStanding};

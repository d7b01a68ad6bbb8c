//! Map of available donation listings

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::{Reconcile, SnapshotSource, View};
use crate::bus::TopicSet;
use crate::error::Result;
use crate::types::{ChangeEvent, Donation, DonationOp, DonationStatus, Topic};

/// Clones share the same listings, so keep one to read while
/// [`spawn_view`](super::spawn_view) drives the other.
#[derive(Clone)]
pub struct MapView {
    listings: Arc<RwLock<BTreeMap<String, Donation>>>,
}

impl MapView {
    pub fn new() -> Self {
        Self {
            listings: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// Current pins, newest first
    pub async fn listings(&self) -> Vec<Donation> {
        let mut listings: Vec<Donation> = self.listings.read().await.values().cloned().collect();
        listings.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        listings
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.listings.read().await.contains_key(id)
    }
}

impl Default for MapView {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl View for MapView {
    fn name(&self) -> &'static str {
        "map"
    }

    fn topics(&self) -> TopicSet {
        TopicSet::only(Topic::Donations)
    }

    async fn resync(&mut self, source: &dyn SnapshotSource) -> Result<()> {
        let available = source.available_donations().await?;
        let mut listings = self.listings.write().await;
        listings.clear();
        listings.extend(available.into_iter().map(|d| (d.id.clone(), d)));
        Ok(())
    }

    async fn apply(&mut self, event: &ChangeEvent, source: &dyn SnapshotSource) -> Result<Reconcile> {
        let ChangeEvent::DonationChanged { donation_id, op } = event else {
            return Ok(Reconcile::Ignored);
        };

        let fetched = match op {
            DonationOp::Removed => None,
            DonationOp::Created | DonationOp::Updated => source.donation(donation_id).await?,
        };

        let mut listings = self.listings.write().await;
        match fetched {
            Some(donation) if donation.status == DonationStatus::Available => {
                listings.insert(donation.id.clone(), donation);
                Ok(Reconcile::Refetched)
            }
            _ => {
                listings.remove(donation_id);
                Ok(Reconcile::Dropped(donation_id.clone()))
            }
        }
    }
}

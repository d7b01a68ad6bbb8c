//! Donation service - listing writes that feed the ledger and the map
//!
//! A new listing is stored first, then credited through the ledger, then
//! announced on the `donations` topic. Notifications go out last, on their
//! own task.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::bus::EventBus;
use crate::config::PointsConfig;
use crate::error::{LedgerError, Result};
use crate::ledger::{ActionOutcome, ActionRequest, LedgerService};
use crate::notify::{self, Notification, Notifier};
use crate::store::{run_blocking, LedgerStore};
use crate::types::{ActionKind, ChangeEvent, Donation, DonationOp, DonationStatus};

/// Input for a new listing
#[derive(Debug, Clone, Deserialize)]
pub struct NewDonation {
    pub user_id: String,
    pub title: String,
    #[serde(default)]
    pub food_type: String,
    #[serde(default)]
    pub quantity: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// A stored listing together with the ledger credit it earned
#[derive(Debug, Clone, Serialize)]
pub struct DonationReceipt {
    pub donation: Donation,
    pub outcome: ActionOutcome,
}

pub struct DonationService {
    store: Arc<dyn LedgerStore>,
    ledger: Arc<LedgerService>,
    bus: Arc<EventBus>,
    notifier: Arc<dyn Notifier>,
    points: PointsConfig,
}

impl DonationService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        ledger: Arc<LedgerService>,
        bus: Arc<EventBus>,
        notifier: Arc<dyn Notifier>,
        points: PointsConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            bus,
            notifier,
            points,
        }
    }

    // =========================================================================
    // Read Operations
    // =========================================================================

    pub async fn get(&self, id: &str) -> Result<Donation> {
        let key = id.to_string();
        run_blocking(&self.store, move |store| store.donation(&key))
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("donation {}", id)))
    }

    /// Listings still available, newest first
    pub async fn list_available(&self) -> Result<Vec<Donation>> {
        run_blocking(&self.store, |store| store.available_donations()).await
    }

    // =========================================================================
    // Write Operations
    // =========================================================================

    /// Store a listing and credit the donor.
    ///
    /// The ledger credit is keyed on the donation id, so it applies once. If
    /// the credit fails the listing is removed again and nothing is announced.
    /// The write sequence runs on its own task: a caller that stops waiting
    /// never leaves a listing without its credit or its announcement.
    pub async fn create(&self, input: NewDonation) -> Result<DonationReceipt> {
        validate_new(&input)?;

        let now = Utc::now();
        let donation = Donation {
            id: Uuid::new_v4().to_string(),
            user_id: input.user_id.trim().to_string(),
            title: input.title.trim().to_string(),
            food_type: input.food_type.trim().to_string(),
            quantity: input.quantity.trim().to_string(),
            latitude: input.latitude,
            longitude: input.longitude,
            status: DonationStatus::Available,
            created_at: now,
            updated_at: now,
        };
        let request = ActionRequest::for_kind(ActionKind::DonationCreated, &donation.user_id, &self.points)?
            .with_action_id(format!("donation:{}", donation.id));

        let task = tokio::spawn(commit_donation(
            Arc::clone(&self.store),
            Arc::clone(&self.ledger),
            Arc::clone(&self.bus),
            Arc::clone(&self.notifier),
            donation,
            request,
        ));

        task.await
            .map_err(|e| LedgerError::Internal(format!("donation task failed: {}", e)))?
    }

    /// Change a listing's status; claimed or expired listings leave the map
    pub async fn update_status(&self, id: &str, status: DonationStatus) -> Result<Donation> {
        let store = Arc::clone(&self.store);
        let bus = Arc::clone(&self.bus);
        let key = id.to_string();

        let task = tokio::spawn(async move {
            let lookup = key.clone();
            let updated = run_blocking(&store, move |store| {
                store.update_donation_status(&lookup, status, Utc::now())
            })
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("donation {}", key)))?;

            bus.publish(ChangeEvent::DonationChanged {
                donation_id: updated.id.clone(),
                op: DonationOp::Updated,
            });
            info!(donation_id = %updated.id, status = status.as_str(), "Donation status changed");
            Ok::<_, LedgerError>(updated)
        });

        task.await
            .map_err(|e| LedgerError::Internal(format!("donation task failed: {}", e)))?
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        let store = Arc::clone(&self.store);
        let bus = Arc::clone(&self.bus);
        let key = id.to_string();

        let task = tokio::spawn(async move {
            let lookup = key.clone();
            let deleted = run_blocking(&store, move |store| store.delete_donation(&lookup)).await?;
            if !deleted {
                return Err(LedgerError::NotFound(format!("donation {}", key)));
            }

            bus.publish(ChangeEvent::DonationChanged {
                donation_id: key.clone(),
                op: DonationOp::Removed,
            });
            info!(donation_id = %key, "Donation removed");
            Ok::<_, LedgerError>(())
        });

        task.await
            .map_err(|e| LedgerError::Internal(format!("donation task failed: {}", e)))?
    }
}

/// Insert, credit, then announce or withdraw
async fn commit_donation(
    store: Arc<dyn LedgerStore>,
    ledger: Arc<LedgerService>,
    bus: Arc<EventBus>,
    notifier: Arc<dyn Notifier>,
    donation: Donation,
    request: ActionRequest,
) -> Result<DonationReceipt> {
    let row = donation.clone();
    run_blocking(&store, move |store| store.insert_donation(&row)).await?;

    let outcome = match ledger.record_action_detailed(request).await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(donation_id = %donation.id, error = %e, "Ledger credit failed, withdrawing donation");
            let id = donation.id.clone();
            if let Err(cleanup) = run_blocking(&store, move |store| store.delete_donation(&id)).await {
                warn!(donation_id = %donation.id, error = %cleanup, "Failed to withdraw donation");
            }
            return Err(e);
        }
    };

    bus.publish(ChangeEvent::DonationChanged {
        donation_id: donation.id.clone(),
        op: DonationOp::Created,
    });

    info!(
        donation_id = %donation.id,
        user_id = %donation.user_id,
        points = outcome.standing.points,
        "Donation created"
    );

    send_notifications(&notifier, &donation, &outcome);

    Ok(DonationReceipt { donation, outcome })
}

fn send_notifications(notifier: &Arc<dyn Notifier>, donation: &Donation, outcome: &ActionOutcome) {
    if outcome.replayed {
        return;
    }

    notify::dispatch(
        Arc::clone(notifier),
        Notification::text(
            &donation.user_id,
            "Thanks for sharing food",
            format!(
                "\"{}\" is now listed. You have {} points.",
                donation.title, outcome.standing.points
            ),
        ),
    );

    if outcome.awarded.is_empty() {
        return;
    }
    let names: Vec<&str> = outcome.awarded.iter().map(|e| e.badge_id.as_str()).collect();
    notify::dispatch(
        Arc::clone(notifier),
        Notification::text(
            &donation.user_id,
            "New badge earned",
            format!("You earned: {}", names.join(", ")),
        ),
    );
}

fn validate_new(input: &NewDonation) -> Result<()> {
    if input.title.trim().is_empty() {
        return Err(LedgerError::Validation("title is required".into()));
    }
    if input.user_id.trim().is_empty() {
        return Err(LedgerError::Validation("user_id is required".into()));
    }
    if !(-90.0..=90.0).contains(&input.latitude) {
        return Err(LedgerError::Validation(format!("latitude out of range: {}", input.latitude)));
    }
    if !(-180.0..=180.0).contains(&input.longitude) {
        return Err(LedgerError::Validation(format!("longitude out of range: {}", input.longitude)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::badges::default_catalog;
    use crate::bus::TopicSet;
    use crate::notify::LogNotifier;
    use crate::store::MemoryStore;
    use crate::types::Topic;
    use tokio::time::{timeout, Duration};

    fn service() -> (DonationService, Arc<EventBus>) {
        let store: Arc<dyn LedgerStore> = Arc::new(MemoryStore::with_catalog(default_catalog()));
        let bus = Arc::new(EventBus::new());
        let ledger = Arc::new(LedgerService::new(Arc::clone(&store), Arc::clone(&bus)));
        let service = DonationService::new(
            store,
            ledger,
            Arc::clone(&bus),
            Arc::new(LogNotifier),
            PointsConfig::default(),
        );
        (service, bus)
    }

    fn bread(user: &str) -> NewDonation {
        NewDonation {
            user_id: user.into(),
            title: "Sourdough loaves".into(),
            food_type: "bakery".into(),
            quantity: "6".into(),
            latitude: 52.52,
            longitude: 13.40,
        }
    }

    #[tokio::test]
    async fn test_create_credits_donor_then_announces() {
        let (service, bus) = service();
        let mut sub = bus.subscribe(TopicSet::all());

        let receipt = service.create(bread("ada")).await.unwrap();
        assert_eq!(receipt.outcome.standing.points, 10);
        assert_eq!(receipt.outcome.standing.donation_count, 1);
        assert_eq!(receipt.outcome.awarded.len(), 1);

        let mut topics = Vec::new();
        for _ in 0..3 {
            let envelope = timeout(Duration::from_millis(100), sub.recv())
                .await
                .expect("timeout")
                .expect("recv");
            topics.push(envelope.event.topic());
        }
        assert_eq!(topics, vec![Topic::Stats, Topic::Badges, Topic::Donations]);
    }

    #[tokio::test]
    async fn test_invalid_coordinates_rejected() {
        let (service, _) = service();
        let mut input = bread("ada");
        input.latitude = 91.0;
        assert!(matches!(service.create(input).await, Err(LedgerError::Validation(_))));
        assert!(service.list_available().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claimed_listing_leaves_available_list() {
        let (service, _) = service();
        let receipt = service.create(bread("ada")).await.unwrap();
        let id = receipt.donation.id;

        service.update_status(&id, DonationStatus::Claimed).await.unwrap();
        assert!(service.list_available().await.unwrap().is_empty());
        assert_eq!(service.get(&id).await.unwrap().status, DonationStatus::Claimed);
    }

    #[tokio::test]
    async fn test_missing_donation_is_not_found() {
        let (service, _) = service();
        assert!(matches!(service.get("nope").await, Err(LedgerError::NotFound(_))));
        assert!(matches!(
            service.update_status("nope", DonationStatus::Expired).await,
            Err(LedgerError::NotFound(_))
        ));
        assert!(matches!(service.remove("nope").await, Err(LedgerError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_remove_publishes_removed() {
        let (service, bus) = service();
        let id = service.create(bread("ada")).await.unwrap().donation.id;
        let mut sub = bus.subscribe(TopicSet::only(Topic::Donations));

        service.remove(&id).await.unwrap();
        let envelope = timeout(Duration::from_millis(100), sub.recv())
            .await
            .expect("timeout")
            .expect("recv");
        assert_eq!(
            envelope.event,
            ChangeEvent::DonationChanged {
                donation_id: id,
                op: DonationOp::Removed
            }
        );
    }
}

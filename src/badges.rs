//! Badge eligibility
//!
//! Evaluation always re-scans the whole catalog: a single bulk grant can
//! cross several thresholds at once. Whatever this module selects is still
//! inserted under the `(user_id, badge_id)` uniqueness guard by the store,
//! and both steps run inside the per-user serialization boundary.

use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::types::{Badge, UserStanding};

/// Badges `standing` qualifies for and does not hold yet, lowest threshold first.
pub fn select_awards(
    standing: &UserStanding,
    catalog: &[Badge],
    earned: &HashSet<String>,
) -> Vec<Badge> {
    let mut eligible: Vec<Badge> = catalog
        .iter()
        .filter(|badge| !earned.contains(&badge.id))
        .filter(|badge| standing.points >= badge.points_required)
        .cloned()
        .collect();
    eligible.sort_by(Badge::threshold_cmp);
    eligible
}

/// The next badge still out of reach and how many points remain.
pub fn next_badge<'a>(
    standing: &UserStanding,
    catalog: &'a [Badge],
    earned: &HashSet<String>,
) -> Option<(&'a Badge, u64)> {
    catalog
        .iter()
        .filter(|badge| !earned.contains(&badge.id))
        .filter(|badge| badge.points_required > standing.points)
        .min_by(|a, b| a.threshold_cmp(b))
        .map(|badge| (badge, badge.points_required - standing.points))
}

pub fn sort_catalog(catalog: &mut [Badge]) {
    catalog.sort_by(Badge::threshold_cmp);
}

/// Built-in catalog used when no catalog file is configured.
pub fn default_catalog() -> Vec<Badge> {
    vec![
        badge("food-hero", "Food Hero", "Shared your first donation", "🦸", 10),
        badge("generous-giver", "Generous Giver", "Reached 50 points", "🎁", 50),
        badge("community-champion", "Community Champion", "Reached 100 points", "👑", 100),
        badge("hunger-warrior", "Hunger Warrior", "Reached 250 points", "⚔️", 250),
    ]
}

fn badge(id: &str, name: &str, description: &str, icon: &str, points_required: u64) -> Badge {
    Badge {
        id: id.to_string(),
        name: name.to_string(),
        description: description.to_string(),
        icon: icon.to_string(),
        points_required,
    }
}

/// Reject catalogs with empty or repeated ids.
pub fn validate_catalog(catalog: &[Badge]) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for badge in catalog {
        if badge.id.trim().is_empty() {
            return Err(ConfigError::Invalid("badge id must not be empty".into()));
        }
        if !seen.insert(badge.id.as_str()) {
            return Err(ConfigError::Invalid(format!("duplicate badge id: {}", badge.id)));
        }
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    badges: Vec<Badge>,
}

/// Load a `[[badges]]` TOML catalog, sorted for evaluation.
pub fn load_catalog(path: &Path) -> Result<Vec<Badge>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let file: CatalogFile = toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })?;

    let mut catalog = file.badges;
    validate_catalog(&catalog)?;
    sort_catalog(&mut catalog);
    Ok(catalog)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn standing(points: u64) -> UserStanding {
        UserStanding {
            points,
            ..UserStanding::zero("u1")
        }
    }

    fn thresholds(catalog: &[Badge]) -> Vec<u64> {
        catalog.iter().map(|b| b.points_required).collect()
    }

    #[test]
    fn test_multiple_thresholds_in_one_pass() {
        let catalog = vec![
            badge("b100", "Hundred", "", "", 100),
            badge("b10", "Ten", "", "", 10),
            badge("b50", "Fifty", "", "", 50),
        ];

        let awards = select_awards(&standing(120), &catalog, &HashSet::new());
        assert_eq!(thresholds(&awards), vec![10, 50, 100]);
    }

    #[test]
    fn test_already_earned_is_skipped() {
        let catalog = default_catalog();
        let earned: HashSet<String> = ["food-hero".to_string()].into();

        assert!(select_awards(&standing(15), &catalog, &earned).is_empty());
    }

    #[test]
    fn test_rerun_on_unchanged_standing_is_idempotent() {
        let catalog = default_catalog();
        let first = select_awards(&standing(60), &catalog, &HashSet::new());
        let earned: HashSet<String> = first.iter().map(|b| b.id.clone()).collect();

        assert_eq!(first.len(), 2);
        assert!(select_awards(&standing(60), &catalog, &earned).is_empty());
    }

    #[test]
    fn test_equal_thresholds_order_by_id() {
        let catalog = vec![badge("zeta", "", "", "", 5), badge("alpha", "", "", "", 5)];
        let awards = select_awards(&standing(5), &catalog, &HashSet::new());
        assert_eq!(awards[0].id, "alpha");
    }

    #[test]
    fn test_next_badge_progress() {
        let catalog = default_catalog();
        let earned: HashSet<String> = ["food-hero".to_string()].into();

        let (next, remaining) = next_badge(&standing(35), &catalog, &earned).unwrap();
        assert_eq!(next.id, "generous-giver");
        assert_eq!(remaining, 15);
        assert!(next_badge(&standing(500), &catalog, &earned).is_none());
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let catalog = vec![badge("x", "", "", "", 1), badge("x", "", "", "", 2)];
        assert!(validate_catalog(&catalog).is_err());
    }

    #[test]
    fn test_load_catalog_from_toml() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("badges.toml");
        std::fs::write(
            &path,
            r#"
[[badges]]
id = "big"
name = "Big"
points_required = 500

[[badges]]
id = "small"
name = "Small"
icon = "🌱"
points_required = 5
"#,
        )
        .unwrap();

        let catalog = load_catalog(&path).unwrap();
        assert_eq!(thresholds(&catalog), vec![5, 500]);
        assert_eq!(catalog[0].icon, "🌱");
        assert_eq!(catalog[1].description, "");
    }
}

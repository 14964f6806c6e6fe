//! Core domain model for the BestFoodWhere data pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "bfw-core";

/// A restaurant chain/concept. Brands are soft-deleted via `is_active`,
/// never removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Brand {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub description: Option<String>,
    pub social_links: serde_json::Value,
    pub amenities: Vec<String>,
    pub recommendations: Vec<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One physical outlet of a brand inside a specific mall/site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub id: Uuid,
    pub brand_menu_id: Uuid,
    pub mall_slug: Option<String>,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub hours_text: Option<String>,
    pub price_range: Option<String>,
    pub mall_restaurant_id: Option<Uuid>,
}

/// Summary record a location points at: rating, review count, cuisines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MallRestaurant {
    pub id: Uuid,
    pub mall_slug: String,
    pub name: String,
    pub rating: Option<f64>,
    pub review_count: Option<i32>,
    pub cuisines: Vec<String>,
}

/// A menu item row as it exists in the database. Used as the right-hand
/// side of scrape-vs-db matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbMenuItem {
    pub id: Uuid,
    pub category_id: Uuid,
    pub name: String,
    pub price_text: Option<String>,
    pub sort_order: i32,
    pub image_url: Option<String>,
    pub cdn_image_url: Option<String>,
}

/// A menu item scraped from a third-party source. Ephemeral: consumed by
/// the matcher to decide image updates, or folded into a [`MenuDraft`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapedMenuItem {
    pub name: String,
    pub description: Option<String>,
    pub price_text: Option<String>,
    pub price_value: Option<f64>,
    pub image_url: Option<String>,
    pub category: Option<String>,
}

/// One category of a freshly parsed menu, in display order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MenuCategoryDraft {
    pub name: String,
    pub sort_order: i32,
    pub items: Vec<MenuItemDraft>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MenuItemDraft {
    pub name: String,
    pub description: Option<String>,
    pub price_text: Option<String>,
    pub price_value: Option<f64>,
    pub image_url: Option<String>,
    pub sort_order: i32,
}

/// A full parsed menu for one brand, as handed from an adapter into the
/// sync pipeline. The source is treated as the whole truth for the brand's
/// menu; persistence is full-replace, not a diff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MenuDraft {
    pub brand_slug: String,
    pub source_id: String,
    pub fetched_at: DateTime<Utc>,
    pub extractor_version: String,
    pub categories: Vec<MenuCategoryDraft>,
}

impl MenuDraft {
    pub fn item_count(&self) -> usize {
        self.categories.iter().map(|c| c.items.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.item_count() == 0
    }
}

/// Partial record produced by the label-based extractor. Every field is
/// optional; callers skip records with no `name`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestaurantRecord {
    pub name: Option<String>,
    pub cuisine: Vec<String>,
    pub rating: Option<f64>,
    pub review_count: Option<u32>,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub hours: Option<String>,
    pub price_range: Option<String>,
}

/// Aggregated context handed to the enricher for one brand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrandContext {
    pub slug: String,
    pub name: String,
    pub cuisines: Vec<String>,
    pub location_summaries: Vec<String>,
    pub sample_menu_items: Vec<String>,
}

/// Run-level provenance stamped on everything a single invocation touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunProvenance {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

impl RunProvenance {
    pub fn start_now() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            fetched_at: Utc::now(),
        }
    }
}

/// Stable slug for a brand or mall name: lowercase alphanumerics joined
/// by single hyphens.
pub fn slugify(input: &str) -> String {
    input
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_collapses_punctuation_and_case() {
        assert_eq!(slugify("Old Chang Kee"), "old-chang-kee");
        assert_eq!(slugify("  Ya Kun (Kaya Toast)!! "), "ya-kun-kaya-toast");
        assert_eq!(slugify("---"), "");
    }

    #[test]
    fn empty_draft_has_no_items() {
        let draft = MenuDraft {
            brand_slug: "old-chang-kee".into(),
            source_id: "old-chang-kee-site".into(),
            fetched_at: Utc::now(),
            extractor_version: "test".into(),
            categories: vec![MenuCategoryDraft {
                name: "Snacks".into(),
                sort_order: 0,
                items: vec![],
            }],
        };
        assert!(draft.is_empty());
        assert_eq!(draft.item_count(), 0);
    }
}

//! Source extraction: label-based cell parsing + menu source adapters.

use std::sync::OnceLock;

use async_trait::async_trait;
use bfw_core::{
    MenuCategoryDraft, MenuDraft, MenuItemDraft, RestaurantRecord, RunProvenance,
};
use bfw_storage::{FetchError, HttpFetcher};
use chrono::{DateTime, Utc};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "bfw-extract";
pub const EXTRACTOR_VERSION: &str = "bfw-extract/0.1";

/// Labels recognized by the cell-text extractor. "Opening Hours" and
/// "Weekly Schedule" both map to the hours field; sheets use either.
pub const KNOWN_LABELS: &[&str] = &[
    "Name",
    "Cuisine",
    "Reviews",
    "Address",
    "Phone",
    "Opening Hours",
    "Weekly Schedule",
    "Price Range",
];

/// Value for one label: text after its first case-insensitive occurrence,
/// up to the next occurring label or end of string.
pub fn label_value(text: &str, label: &str, labels: &[&str]) -> Option<String> {
    let lower = text.to_ascii_lowercase();
    let needle = label.to_ascii_lowercase();
    let start = lower.find(&needle)?;
    let mut value_start = start + needle.len();
    let bytes = text.as_bytes();
    while value_start < text.len()
        && (bytes[value_start] == b':' || bytes[value_start].is_ascii_whitespace())
    {
        value_start += 1;
    }

    let mut value_end = text.len();
    for other in labels {
        if other.eq_ignore_ascii_case(label) {
            continue;
        }
        if let Some(pos) = lower[value_start..].find(&other.to_ascii_lowercase()) {
            value_end = value_end.min(value_start + pos);
        }
    }

    let value = text[value_start..value_end].trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn rating_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+(?:\.\d+)?)").expect("rating pattern"))
}

fn review_count_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\((\d+)\)").expect("review count pattern"))
}

/// Parse a compound review cell like `"4.5 (120)"`. The two parts are
/// independent; either may be absent without discarding the other.
pub fn parse_review_summary(text: &str) -> (Option<f64>, Option<u32>) {
    let rating = rating_regex()
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok());
    let count = review_count_regex()
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok());
    (rating, count)
}

/// First decimal number in a price string ("S$4.80" → 4.8). Thousands
/// separators are skipped over.
pub fn parse_price(text: &str) -> Option<f64> {
    let mut current = String::new();
    let mut seen_dot = false;
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            current.push(ch);
            continue;
        }
        if ch == ',' && !current.is_empty() {
            continue;
        }
        if ch == '.' && !seen_dot && !current.is_empty() {
            current.push(ch);
            seen_dot = true;
            continue;
        }
        if !current.is_empty() {
            break;
        }
    }
    current.parse().ok()
}

fn split_list(value: String) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Convert one unstructured sheet cell into a partial restaurant record.
/// Malformed input never errors; missing labels leave fields unset and
/// callers drop records without a name.
pub fn extract_record(text: &str) -> RestaurantRecord {
    let labels = KNOWN_LABELS;
    let reviews = label_value(text, "Reviews", labels);
    let (rating, review_count) = reviews
        .as_deref()
        .map(parse_review_summary)
        .unwrap_or((None, None));

    RestaurantRecord {
        name: label_value(text, "Name", labels),
        cuisine: label_value(text, "Cuisine", labels)
            .map(split_list)
            .unwrap_or_default(),
        rating,
        review_count,
        address: label_value(text, "Address", labels),
        phone: label_value(text, "Phone", labels),
        hours: label_value(text, "Opening Hours", labels)
            .or_else(|| label_value(text, "Weekly Schedule", labels)),
        price_range: label_value(text, "Price Range", labels),
    }
}

/// Parse a mall directory page: each listing cell's flattened text runs
/// through [`extract_record`]. Cells without a parsed name are dropped.
pub fn extract_directory(html: &str) -> Result<Vec<RestaurantRecord>, AdapterError> {
    let document = Html::parse_document(html);
    let cell_sel = selector(".restaurant-card, .listing, li.restaurant, td.cell")?;

    let mut records = Vec::new();
    for cell in document.select(&cell_sel) {
        let text = cell
            .text()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        let record = extract_record(&text);
        if record.name.is_some() {
            records.push(record);
        }
    }
    Ok(records)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub url: String,
    pub content_type: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct ScrapeContext {
    pub run: RunProvenance,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageTarget {
    pub url: String,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// One scrapeable menu source for one brand.
#[async_trait]
pub trait MenuSource: Send + Sync {
    fn source_id(&self) -> &str;
    fn brand_slug(&self) -> &str;

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &ScrapeContext,
        targets: &[PageTarget],
    ) -> Result<Vec<FetchedPage>, AdapterError>;

    fn parse(&self, page: &FetchedPage) -> Result<MenuDraft, AdapterError>;
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(e.to_string()))
}

fn element_first_text(el: ElementRef<'_>, css: &str) -> Result<Option<String>, AdapterError> {
    let sel = selector(css)?;
    Ok(el
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>())))
}

fn element_first_attr(
    el: ElementRef<'_>,
    css: &str,
    attr: &str,
) -> Result<Option<String>, AdapterError> {
    let sel = selector(css)?;
    Ok(el
        .select(&sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string())))
}

/// HTML menu pages on brand sites. Category sections are looked up by the
/// common markup classes; pages without them fall back to JSON-LD, then to
/// a flat item scan under a single category.
#[derive(Debug, Clone)]
pub struct HtmlMenuSource {
    pub source_id: String,
    pub brand_slug: String,
}

impl HtmlMenuSource {
    fn parse_html(&self, page: &FetchedPage) -> Result<Vec<MenuCategoryDraft>, AdapterError> {
        let html = String::from_utf8_lossy(&page.body);
        let document = Html::parse_document(&html);

        let section_sel = selector("section.menu-category, .menu-section")?;
        let item_sel = selector(".menu-item, li.item")?;

        let mut categories = Vec::new();
        for (ci, section) in document.select(&section_sel).enumerate() {
            let name = element_first_text(section, "h2, h3, .category-name")?
                .unwrap_or_else(|| format!("Category {}", ci + 1));
            let mut items = Vec::new();
            for item_el in section.select(&item_sel) {
                if let Some(item) = parse_item_element(item_el, items.len() as i32)? {
                    items.push(item);
                }
            }
            categories.push(MenuCategoryDraft {
                name,
                sort_order: ci as i32,
                items,
            });
        }
        if !categories.is_empty() {
            return Ok(categories);
        }

        if let Some(categories) = parse_json_ld_menu(&document)? {
            return Ok(categories);
        }

        // Flat scan: uncategorized items land in a single bucket.
        let mut items = Vec::new();
        for item_el in document.select(&item_sel) {
            if let Some(item) = parse_item_element(item_el, items.len() as i32)? {
                items.push(item);
            }
        }
        if items.is_empty() {
            Ok(Vec::new())
        } else {
            Ok(vec![MenuCategoryDraft {
                name: "Menu".to_string(),
                sort_order: 0,
                items,
            }])
        }
    }
}

fn parse_item_element(
    el: ElementRef<'_>,
    sort_order: i32,
) -> Result<Option<MenuItemDraft>, AdapterError> {
    let Some(name) = element_first_text(el, ".item-name, .name, h4")? else {
        return Ok(None);
    };
    let price_text = element_first_text(el, ".price")?;
    let description = element_first_text(el, ".description, .desc, p")?;
    let image_url = element_first_attr(el, "img", "src")?
        .or(element_first_attr(el, "img", "data-src")?);
    Ok(Some(MenuItemDraft {
        name,
        description,
        price_value: price_text.as_deref().and_then(parse_price),
        price_text,
        image_url,
        sort_order,
    }))
}

fn parse_json_ld_menu(document: &Html) -> Result<Option<Vec<MenuCategoryDraft>>, AdapterError> {
    let sel = selector(r#"script[type="application/ld+json"]"#)?;
    for script in document.select(&sel) {
        let raw = script.text().collect::<String>();
        let Ok(value) = serde_json::from_str::<JsonValue>(&raw) else {
            continue;
        };
        let sections = value
            .get("hasMenu")
            .and_then(|m| m.get("hasMenuSection"))
            .or_else(|| value.get("hasMenuSection"))
            .and_then(|s| s.as_array());
        let Some(sections) = sections else {
            continue;
        };

        let mut categories = Vec::new();
        for (ci, section) in sections.iter().enumerate() {
            let name = section
                .get("name")
                .and_then(|n| n.as_str())
                .unwrap_or("Menu")
                .to_string();
            let mut items = Vec::new();
            if let Some(menu_items) = section.get("hasMenuItem").and_then(|v| v.as_array()) {
                for item in menu_items {
                    let Some(item_name) = item.get("name").and_then(|n| n.as_str()) else {
                        continue;
                    };
                    let price_text = item
                        .get("offers")
                        .and_then(|o| o.get("price"))
                        .and_then(|p| p.as_str().map(ToString::to_string).or_else(|| {
                            p.as_f64().map(|f| format!("{f:.2}"))
                        }));
                    items.push(MenuItemDraft {
                        name: item_name.to_string(),
                        description: item
                            .get("description")
                            .and_then(|d| d.as_str())
                            .map(ToString::to_string),
                        price_value: price_text.as_deref().and_then(parse_price),
                        price_text,
                        image_url: item
                            .get("image")
                            .and_then(|i| i.as_str())
                            .map(ToString::to_string),
                        sort_order: items.len() as i32,
                    });
                }
            }
            categories.push(MenuCategoryDraft {
                name,
                sort_order: ci as i32,
                items,
            });
        }
        if categories.iter().any(|c| !c.items.is_empty()) {
            return Ok(Some(categories));
        }
    }
    Ok(None)
}

#[async_trait]
impl MenuSource for HtmlMenuSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn brand_slug(&self) -> &str {
        &self.brand_slug
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &ScrapeContext,
        targets: &[PageTarget],
    ) -> Result<Vec<FetchedPage>, AdapterError> {
        let mut pages = Vec::with_capacity(targets.len());
        for target in targets {
            let resp = http
                .fetch_bytes(ctx.run.run_id, &self.source_id, &target.url)
                .await?;
            pages.push(FetchedPage {
                url: resp.final_url,
                content_type: "text/html".to_string(),
                body: resp.body,
                fetched_at: Utc::now(),
            });
        }
        Ok(pages)
    }

    fn parse(&self, page: &FetchedPage) -> Result<MenuDraft, AdapterError> {
        let categories = self.parse_html(page)?;
        Ok(MenuDraft {
            brand_slug: self.brand_slug.clone(),
            source_id: self.source_id.clone(),
            fetched_at: page.fetched_at,
            extractor_version: EXTRACTOR_VERSION.to_string(),
            categories,
        })
    }
}

/// Captured GrabFood merchant API payloads. The browser-side capture is
/// external; this adapter owns the JSON contract of the saved response.
#[derive(Debug, Clone)]
pub struct GrabCaptureSource {
    pub source_id: String,
    pub brand_slug: String,
}

impl GrabCaptureSource {
    fn parse_payload(&self, value: &JsonValue) -> Vec<MenuCategoryDraft> {
        let sections = value
            .get("merchant")
            .and_then(|m| m.get("menu"))
            .and_then(|m| m.get("categories"))
            .or_else(|| value.get("categories"))
            .and_then(|c| c.as_array());
        let Some(sections) = sections else {
            return Vec::new();
        };

        let mut categories = Vec::new();
        for (ci, section) in sections.iter().enumerate() {
            let name = section
                .get("name")
                .and_then(|n| n.as_str())
                .unwrap_or("Menu")
                .to_string();
            let mut items = Vec::new();
            if let Some(raw_items) = section.get("items").and_then(|v| v.as_array()) {
                for item in raw_items {
                    if item.get("available").and_then(|a| a.as_bool()) == Some(false) {
                        continue;
                    }
                    let Some(item_name) = item.get("name").and_then(|n| n.as_str()) else {
                        continue;
                    };
                    let price_value = item
                        .get("priceInMinorUnit")
                        .and_then(|p| p.as_f64())
                        .map(|minor| minor / 100.0);
                    items.push(MenuItemDraft {
                        name: item_name.to_string(),
                        description: item
                            .get("description")
                            .and_then(|d| d.as_str())
                            .and_then(|d| text_or_none(d.to_string())),
                        price_text: price_value.map(|p| format!("${p:.2}")),
                        price_value,
                        image_url: item
                            .get("imgHref")
                            .and_then(|i| i.as_str())
                            .map(ToString::to_string),
                        sort_order: items.len() as i32,
                    });
                }
            }
            categories.push(MenuCategoryDraft {
                name,
                sort_order: ci as i32,
                items,
            });
        }
        categories
    }
}

#[async_trait]
impl MenuSource for GrabCaptureSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn brand_slug(&self) -> &str {
        &self.brand_slug
    }

    async fn fetch(
        &self,
        _http: &HttpFetcher,
        _ctx: &ScrapeContext,
        targets: &[PageTarget],
    ) -> Result<Vec<FetchedPage>, AdapterError> {
        let mut pages = Vec::with_capacity(targets.len());
        for target in targets {
            let body = tokio::fs::read(&target.url).await?;
            pages.push(FetchedPage {
                url: target.url.clone(),
                content_type: "application/json".to_string(),
                body,
                fetched_at: Utc::now(),
            });
        }
        Ok(pages)
    }

    fn parse(&self, page: &FetchedPage) -> Result<MenuDraft, AdapterError> {
        let value: JsonValue = serde_json::from_slice(&page.body)
            .map_err(|e| AdapterError::Message(format!("invalid capture JSON: {e}")))?;
        Ok(MenuDraft {
            brand_slug: self.brand_slug.clone(),
            source_id: self.source_id.clone(),
            fetched_at: page.fetched_at,
            extractor_version: EXTRACTOR_VERSION.to_string(),
            categories: self.parse_payload(&value),
        })
    }
}

/// Adapter lookup by registry `kind`.
pub fn source_for(kind: &str, source_id: &str, brand_slug: &str) -> Option<Box<dyn MenuSource>> {
    match kind {
        "html" => Some(Box::new(HtmlMenuSource {
            source_id: source_id.to_string(),
            brand_slug: brand_slug.to_string(),
        })),
        "grab-json" => Some(Box::new(GrabCaptureSource {
            source_id: source_id.to_string(),
            brand_slug: brand_slug.to_string(),
        })),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_labeled_cell_text() {
        let record = extract_record(
            "Name: Old Chang Kee Cuisine: Local, Snacks Reviews: 2.3 (20) Address: 101 Thomson Road",
        );
        assert_eq!(record.name.as_deref(), Some("Old Chang Kee"));
        assert_eq!(record.cuisine, vec!["Local".to_string(), "Snacks".to_string()]);
        assert_eq!(record.rating, Some(2.3));
        assert_eq!(record.review_count, Some(20));
        assert_eq!(record.address.as_deref(), Some("101 Thomson Road"));
        assert!(record.phone.is_none());
    }

    #[test]
    fn missing_labels_leave_fields_unset() {
        let record = extract_record("Cuisine: Western");
        assert!(record.name.is_none());
        assert_eq!(record.cuisine, vec!["Western".to_string()]);
        assert!(record.rating.is_none());
    }

    #[test]
    fn garbage_input_never_errors() {
        let record = extract_record(":: ((( )) Name:");
        assert!(record.name.is_none());
        assert!(record.cuisine.is_empty());
    }

    #[test]
    fn hours_come_from_either_label() {
        let a = extract_record("Name: X Opening Hours: 9am-9pm");
        assert_eq!(a.hours.as_deref(), Some("9am-9pm"));
        let b = extract_record("Name: X Weekly Schedule: Mon-Fri 10-8");
        assert_eq!(b.hours.as_deref(), Some("Mon-Fri 10-8"));
    }

    #[test]
    fn review_summary_parts_fail_independently() {
        assert_eq!(parse_review_summary("4.5 (120)"), (Some(4.5), Some(120)));
        assert_eq!(parse_review_summary("4.5"), (Some(4.5), None));
        assert_eq!(parse_review_summary("no reviews yet"), (None, None));
    }

    #[test]
    fn price_parsing_handles_currency_prefixes() {
        assert_eq!(parse_price("S$4.80"), Some(4.8));
        assert_eq!(parse_price("$1,200.50"), Some(1200.5));
        assert_eq!(parse_price("market price"), None);
    }

    #[test]
    fn directory_page_yields_named_records_only() {
        let html = r#"
            <div class="restaurant-card">
              <span>Name: Old Chang Kee</span>
              <span>Cuisine: Local, Snacks</span>
              <span>Reviews: 2.3 (20)</span>
            </div>
            <div class="restaurant-card">
              <span>Cuisine: Mystery</span>
            </div>
        "#;
        let records = extract_directory(html).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name.as_deref(), Some("Old Chang Kee"));
        assert_eq!(records[0].rating, Some(2.3));
    }

    fn page(body: &str, content_type: &str) -> FetchedPage {
        FetchedPage {
            url: "https://example.test/menu".into(),
            content_type: content_type.into(),
            body: body.as_bytes().to_vec(),
            fetched_at: Utc::now(),
        }
    }

    #[test]
    fn html_menu_with_category_sections() {
        let source = HtmlMenuSource {
            source_id: "old-chang-kee-site".into(),
            brand_slug: "old-chang-kee".into(),
        };
        let html = r#"
            <section class="menu-category">
              <h2>Puffs</h2>
              <div class="menu-item">
                <span class="name">Curry Puff</span>
                <span class="price">S$2.10</span>
                <img src="https://img.test/curry-puff.jpg">
              </div>
              <div class="menu-item">
                <span class="name">Sardine Puff</span>
                <span class="price">S$2.10</span>
              </div>
            </section>
            <section class="menu-category">
              <h2>Drinks</h2>
              <div class="menu-item"><span class="name">Kopi</span></div>
            </section>
        "#;
        let draft = source.parse(&page(html, "text/html")).unwrap();
        assert_eq!(draft.categories.len(), 2);
        assert_eq!(draft.categories[0].name, "Puffs");
        assert_eq!(draft.categories[0].items.len(), 2);
        let puff = &draft.categories[0].items[0];
        assert_eq!(puff.name, "Curry Puff");
        assert_eq!(puff.price_value, Some(2.1));
        assert_eq!(puff.image_url.as_deref(), Some("https://img.test/curry-puff.jpg"));
        assert_eq!(draft.categories[1].sort_order, 1);
    }

    #[test]
    fn html_menu_falls_back_to_json_ld() {
        let source = HtmlMenuSource {
            source_id: "ya-kun-site".into(),
            brand_slug: "ya-kun-kaya-toast".into(),
        };
        let html = r#"
            <script type="application/ld+json">
            {"@type":"Restaurant","hasMenu":{"hasMenuSection":[
              {"name":"Toast","hasMenuItem":[
                {"name":"Kaya Toast","description":"With butter",
                 "offers":{"price":"2.60","priceCurrency":"SGD"},
                 "image":"https://img.test/kaya.jpg"}
              ]}
            ]}}
            </script>
        "#;
        let draft = source.parse(&page(html, "text/html")).unwrap();
        assert_eq!(draft.categories.len(), 1);
        assert_eq!(draft.categories[0].items[0].name, "Kaya Toast");
        assert_eq!(draft.categories[0].items[0].price_value, Some(2.6));
    }

    #[test]
    fn empty_page_parses_to_empty_draft() {
        let source = HtmlMenuSource {
            source_id: "s".into(),
            brand_slug: "b".into(),
        };
        let draft = source.parse(&page("<html><body></body></html>", "text/html")).unwrap();
        assert!(draft.is_empty());
    }

    #[test]
    fn grab_capture_payload_parses_and_skips_unavailable() {
        let source = GrabCaptureSource {
            source_id: "grab-old-chang-kee".into(),
            brand_slug: "old-chang-kee".into(),
        };
        let json = r#"{"merchant":{"menu":{"categories":[
            {"name":"Signatures","items":[
              {"name":"Curry'O","priceInMinorUnit":210,"imgHref":"https://img.test/curryo.jpg","available":true},
              {"name":"Sold Out Puff","priceInMinorUnit":180,"available":false}
            ]}
        ]}}}"#;
        let draft = source.parse(&page(json, "application/json")).unwrap();
        assert_eq!(draft.item_count(), 1);
        let item = &draft.categories[0].items[0];
        assert_eq!(item.name, "Curry'O");
        assert_eq!(item.price_value, Some(2.1));
        assert_eq!(item.price_text.as_deref(), Some("$2.10"));
    }

    #[test]
    fn adapter_lookup_by_kind() {
        assert!(source_for("html", "s", "b").is_some());
        assert!(source_for("grab-json", "s", "b").is_some());
        assert!(source_for("playwright", "s", "b").is_none());
    }
}

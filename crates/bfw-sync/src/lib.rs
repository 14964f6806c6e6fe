//! Pipeline orchestration: registry-driven menu sync, image reconciliation,
//! AI enrichment, and the full-replace persister.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bfw_core::{slugify, BrandContext, DbMenuItem, MenuCategoryDraft, MenuDraft, RunProvenance, ScrapedMenuItem};
use bfw_enrich::Enricher;
use bfw_extract::{extract_directory, source_for, MenuSource, PageTarget, ScrapeContext};
use bfw_match::{assign_greedy, MatchConfig};
use bfw_storage::{HttpClientConfig, HttpFetcher, ImageCache, ImagePipeline, ImageRules, ObjectStore};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "bfw-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub supabase_url: Option<String>,
    pub supabase_service_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub image_bucket: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub batch_concurrency: usize,
    pub batch_delay_ms: u64,
    pub image_cache_ttl_secs: u64,
    pub workspace_root: PathBuf,
}

impl SyncConfig {
    /// Missing DATABASE_URL is fatal before any work begins; the rest
    /// default or stay optional until the operation that needs them.
    pub fn from_env() -> Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .context("DATABASE_URL is required (service-role connection string)")?;
        Ok(Self {
            database_url,
            supabase_url: std::env::var("SUPABASE_URL").ok(),
            supabase_service_key: std::env::var("SUPABASE_SERVICE_ROLE_KEY").ok(),
            anthropic_api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
            image_bucket: std::env::var("BFW_IMAGE_BUCKET")
                .unwrap_or_else(|_| "menu-images".to_string()),
            user_agent: std::env::var("BFW_USER_AGENT")
                .unwrap_or_else(|_| "bfw-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("BFW_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            batch_concurrency: std::env::var("BFW_BATCH_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(4),
            batch_delay_ms: std::env::var("BFW_BATCH_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(750),
            image_cache_ttl_secs: std::env::var("BFW_IMAGE_CACHE_TTL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(24 * 60 * 60),
            workspace_root: PathBuf::from("."),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub kind: String,
    pub brand_slug: String,
    #[serde(default)]
    pub listing_urls: Vec<String>,
    #[serde(default)]
    pub capture_path: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SourceConfig {
    fn targets(&self, workspace_root: &std::path::Path) -> Vec<PageTarget> {
        if let Some(path) = &self.capture_path {
            vec![PageTarget {
                url: workspace_root.join(path).display().to_string(),
            }]
        } else {
            self.listing_urls
                .iter()
                .map(|url| PageTarget { url: url.clone() })
                .collect()
        }
    }
}

/// Fixed-size concurrent batches with a delay between groups. Static
/// throttling, not feedback-driven backpressure.
#[derive(Debug, Clone, Copy)]
pub struct BatchPolicy {
    pub concurrency: usize,
    pub inter_batch_delay: Duration,
}

impl BatchPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            concurrency: config.batch_concurrency.max(1),
            inter_batch_delay: Duration::from_millis(config.batch_delay_ms),
        }
    }
}

/// Run a closure over every item, `concurrency` at a time. A failing item
/// never cancels its siblings; results come back in input order per group.
pub async fn run_batched<T, R, F, Fut>(items: Vec<T>, policy: BatchPolicy, f: F) -> Vec<R>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = R>,
{
    let mut out = Vec::with_capacity(items.len());
    let mut iter = items.into_iter().peekable();
    while iter.peek().is_some() {
        let chunk: Vec<T> = iter.by_ref().take(policy.concurrency.max(1)).collect();
        let group = chunk.into_iter().map(&f).collect::<Vec<_>>();
        out.extend(join_all(group).await);
        if iter.peek().is_some() && !policy.inter_batch_delay.is_zero() {
            tokio::time::sleep(policy.inter_batch_delay).await;
        }
    }
    out
}

/// Per-item terminal state, folded into the run summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Processed,
    Skipped(String),
    Failed(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub operation: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub processed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub per_source: BTreeMap<String, usize>,
}

impl RunSummary {
    fn start(run: RunProvenance, operation: &str) -> Self {
        Self {
            run_id: run.run_id,
            operation: operation.to_string(),
            started_at: run.fetched_at,
            finished_at: run.fetched_at,
            processed: 0,
            failed: 0,
            skipped: 0,
            per_source: BTreeMap::new(),
        }
    }

    fn absorb(&mut self, source_id: &str, outcome: &ItemOutcome) {
        *self.per_source.entry(source_id.to_string()).or_default() += 1;
        match outcome {
            ItemOutcome::Processed => self.processed += 1,
            ItemOutcome::Skipped(_) => self.skipped += 1,
            ItemOutcome::Failed(_) => self.failed += 1,
        }
    }

    fn finish(&mut self) {
        self.finished_at = Utc::now();
    }
}

/// Replace decision for one brand's menu. `Skip` guards against a
/// transient scrape failure wiping good rows: an empty fresh set never
/// deletes anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplaceDecision {
    Skip,
    Replace { categories: usize, items: usize },
}

pub fn replace_decision(draft: &MenuDraft) -> ReplaceDecision {
    if draft.is_empty() {
        ReplaceDecision::Skip
    } else {
        ReplaceDecision::Replace {
            categories: draft.categories.iter().filter(|c| !c.items.is_empty()).count(),
            items: draft.item_count(),
        }
    }
}

/// Normalize a draft for persistence: drop empty categories and reassign
/// contiguous sort orders so (brand, category, sort_order) uniqueness
/// holds regardless of what the adapter produced.
pub fn normalized_categories(draft: &MenuDraft) -> Vec<MenuCategoryDraft> {
    draft
        .categories
        .iter()
        .filter(|c| !c.items.is_empty())
        .enumerate()
        .map(|(ci, c)| MenuCategoryDraft {
            name: c.name.clone(),
            sort_order: ci as i32,
            items: c
                .items
                .iter()
                .enumerate()
                .map(|(ii, item)| {
                    let mut item = item.clone();
                    item.sort_order = ii as i32;
                    item
                })
                .collect(),
        })
        .collect()
}

/// The (name, price text, sort_order) tuples a sync run will leave behind.
/// Row IDs vary across runs; these tuples must not.
pub fn planned_rows(draft: &MenuDraft) -> Vec<(String, Option<String>, i32)> {
    normalized_categories(draft)
        .iter()
        .flat_map(|c| {
            c.items
                .iter()
                .map(|i| (i.name.clone(), i.price_text.clone(), i.sort_order))
                .collect::<Vec<_>>()
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PersistStats {
    pub categories: usize,
    pub items: usize,
}

/// Full-replace persister for one brand menu. Delete runs in FK order
/// (items, then categories) and the whole pair is transactional, so a
/// crash mid-sync cannot leave the menu half-written.
pub async fn apply_full_replace(
    pool: &PgPool,
    brand_menu_id: Uuid,
    draft: &MenuDraft,
) -> Result<PersistStats> {
    let categories = normalized_categories(draft);
    let mut tx = pool.begin().await.context("opening menu-sync transaction")?;

    sqlx::query(
        r#"
        DELETE FROM menu_items
         WHERE category_id IN (SELECT id FROM menu_categories WHERE brand_menu_id = $1)
        "#,
    )
    .bind(brand_menu_id)
    .execute(&mut *tx)
    .await
    .context("deleting existing menu items")?;

    sqlx::query("DELETE FROM menu_categories WHERE brand_menu_id = $1")
        .bind(brand_menu_id)
        .execute(&mut *tx)
        .await
        .context("deleting existing menu categories")?;

    let mut stats = PersistStats::default();
    for category in &categories {
        let category_id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO menu_categories (brand_menu_id, name, sort_order)
            VALUES ($1, $2, $3)
            RETURNING id
            "#,
        )
        .bind(brand_menu_id)
        .bind(&category.name)
        .bind(category.sort_order)
        .fetch_one(&mut *tx)
        .await
        .with_context(|| format!("inserting category {}", category.name))?;
        stats.categories += 1;

        for item in &category.items {
            sqlx::query(
                r#"
                INSERT INTO menu_items
                    (category_id, name, description, price, price_value, sort_order, image_url)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(category_id)
            .bind(&item.name)
            .bind(&item.description)
            .bind(&item.price_text)
            .bind(item.price_value)
            .bind(item.sort_order)
            .bind(&item.image_url)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("inserting item {}", item.name))?;
            stats.items += 1;
        }
    }

    tx.commit().await.context("committing menu sync")?;
    Ok(stats)
}

fn display_name_for_slug(slug: &str) -> String {
    slug.split('-')
        .filter(|s| !s.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Upsert by slug: brands are created on first discovery and only ever
/// updated afterwards.
pub async fn upsert_brand(pool: &PgPool, slug: &str) -> Result<Uuid> {
    let id: Uuid = sqlx::query_scalar(
        r#"
        INSERT INTO brand_menus (slug, name)
        VALUES ($1, $2)
        ON CONFLICT (slug) DO UPDATE SET updated_at = NOW()
        RETURNING id
        "#,
    )
    .bind(slug)
    .bind(display_name_for_slug(slug))
    .fetch_one(pool)
    .await
    .with_context(|| format!("upserting brand {slug}"))?;
    Ok(id)
}

pub async fn load_db_menu_items(pool: &PgPool, brand_menu_id: Uuid) -> Result<Vec<DbMenuItem>> {
    let rows = sqlx::query(
        r#"
        SELECT mi.id, mi.category_id, mi.name, mi.price, mi.sort_order,
               mi.image_url, mi.cdn_image_url
          FROM menu_items mi
          JOIN menu_categories mc ON mc.id = mi.category_id
         WHERE mc.brand_menu_id = $1
         ORDER BY mc.sort_order, mi.sort_order
        "#,
    )
    .bind(brand_menu_id)
    .fetch_all(pool)
    .await
    .context("loading menu items")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(DbMenuItem {
            id: row.try_get("id")?,
            category_id: row.try_get("category_id")?,
            name: row.try_get("name")?,
            price_text: row.try_get("price")?,
            sort_order: row.try_get("sort_order")?,
            image_url: row.try_get("image_url")?,
            cdn_image_url: row.try_get("cdn_image_url")?,
        });
    }
    Ok(out)
}

async fn log_scrape(
    pool: &PgPool,
    run_id: Uuid,
    source_id: &str,
    brand_slug: Option<&str>,
    status: &str,
    detail: Option<&str>,
) {
    let result = sqlx::query(
        r#"
        INSERT INTO scrape_logs (run_id, source_id, brand_slug, status, detail)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(run_id)
    .bind(source_id)
    .bind(brand_slug)
    .bind(status)
    .bind(detail)
    .execute(pool)
    .await;
    if let Err(err) = result {
        warn!(%err, source_id, "failed to write scrape_logs row");
    }
}

async fn log_enrichment(pool: &PgPool, run_id: Uuid, brand_slug: &str, status: &str, detail: Option<&str>) {
    let result = sqlx::query(
        r#"
        INSERT INTO enrichment_jobs (run_id, brand_slug, status, detail)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(run_id)
    .bind(brand_slug)
    .bind(status)
    .bind(detail)
    .execute(pool)
    .await;
    if let Err(err) = result {
        warn!(%err, brand_slug, "failed to write enrichment_jobs row");
    }
}

/// Merge the drafts of a multi-page source into one, re-numbering
/// category sort orders across pages.
pub fn merge_drafts(mut drafts: Vec<MenuDraft>) -> Option<MenuDraft> {
    let mut merged = drafts.drain(..).next()?;
    for draft in drafts {
        merged.categories.extend(draft.categories);
    }
    for (ci, category) in merged.categories.iter_mut().enumerate() {
        category.sort_order = ci as i32;
    }
    Some(merged)
}

pub struct Pipeline {
    config: SyncConfig,
    pool: PgPool,
    http: HttpFetcher,
    image_cache: ImageCache,
}

impl Pipeline {
    pub async fn connect(config: SyncConfig) -> Result<Self> {
        let pool = PgPool::connect(&config.database_url)
            .await
            .context("connecting to database")?;
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        let image_cache = ImageCache::with_system_clock(Duration::from_secs(
            config.image_cache_ttl_secs,
        ));
        Ok(Self {
            config,
            pool,
            http,
            image_cache,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running migrations")
    }

    /// Ingest one mall directory page: every labeled listing cell becomes
    /// a mall-restaurant summary row, and brands already known by slug get
    /// a location linked to it.
    pub async fn run_directory_sync(&self, mall_slug: &str, url: &str) -> Result<RunSummary> {
        let run = RunProvenance::start_now();
        let mut summary = RunSummary::start(run, "directory-sync");

        let records = match self.load_directory_records(run.run_id, mall_slug, url).await {
            Ok(records) => records,
            Err(err) => {
                // Source unavailable still leaves an audit row and a report.
                let reason = format!("{err:#}");
                log_scrape(&self.pool, run.run_id, mall_slug, None, "failed", Some(&reason)).await;
                summary.absorb(mall_slug, &ItemOutcome::Failed(reason));
                summary.finish();
                self.write_reports(&summary).await?;
                return Ok(summary);
            }
        };

        for record in &records {
            let Some(name) = record.name.as_deref() else {
                continue;
            };
            let outcome = match self.upsert_directory_record(mall_slug, record).await {
                Ok(()) => ItemOutcome::Processed,
                Err(err) => {
                    let reason = format!("{name}: {err:#}");
                    log_scrape(&self.pool, run.run_id, mall_slug, Some(&slugify(name)), "failed", Some(&reason)).await;
                    ItemOutcome::Failed(reason)
                }
            };
            summary.absorb(mall_slug, &outcome);
        }
        if records.is_empty() {
            summary.absorb(
                mall_slug,
                &ItemOutcome::Skipped("no listing cells recognized".to_string()),
            );
        }

        summary.finish();
        self.write_reports(&summary).await?;
        Ok(summary)
    }

    async fn load_directory_records(
        &self,
        run_id: Uuid,
        mall_slug: &str,
        url: &str,
    ) -> Result<Vec<bfw_core::RestaurantRecord>> {
        let resp = self
            .http
            .fetch_bytes(run_id, mall_slug, url)
            .await
            .with_context(|| format!("fetching directory page {url}"))?;
        let html = String::from_utf8_lossy(&resp.body);
        extract_directory(&html).context("parsing directory page")
    }

    async fn upsert_directory_record(
        &self,
        mall_slug: &str,
        record: &bfw_core::RestaurantRecord,
    ) -> Result<()> {
        let name = record.name.as_deref().context("record without name")?;
        let mall_restaurant_id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO mall_restaurants (mall_slug, name, rating, review_count, cuisines)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (mall_slug, name) DO UPDATE
               SET rating = EXCLUDED.rating,
                   review_count = EXCLUDED.review_count,
                   cuisines = EXCLUDED.cuisines
            RETURNING id
            "#,
        )
        .bind(mall_slug)
        .bind(name)
        .bind(record.rating)
        .bind(record.review_count.map(|c| c as i32))
        .bind(&record.cuisine)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("upserting mall restaurant {name}"))?;

        // Brands are created by menu sync, not discovered here; only link
        // a location when the slug already resolves.
        let brand_menu_id: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM brand_menus WHERE slug = $1")
                .bind(slugify(name))
                .fetch_optional(&self.pool)
                .await
                .context("resolving brand slug")?;
        let Some(brand_menu_id) = brand_menu_id else {
            return Ok(());
        };

        let existing: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM brand_locations WHERE brand_menu_id = $1 AND mall_slug = $2",
        )
        .bind(brand_menu_id)
        .bind(mall_slug)
        .fetch_optional(&self.pool)
        .await
        .context("looking up existing location")?;

        match existing {
            Some(location_id) => {
                sqlx::query(
                    r#"
                    UPDATE brand_locations
                       SET address = $2, phone = $3, hours_text = $4,
                           price_range = $5, mall_restaurant_id = $6
                     WHERE id = $1
                    "#,
                )
                .bind(location_id)
                .bind(&record.address)
                .bind(&record.phone)
                .bind(&record.hours)
                .bind(&record.price_range)
                .bind(mall_restaurant_id)
                .execute(&self.pool)
                .await
                .context("updating location")?;
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO brand_locations
                        (brand_menu_id, mall_slug, address, phone, hours_text,
                         price_range, mall_restaurant_id)
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    "#,
                )
                .bind(brand_menu_id)
                .bind(mall_slug)
                .bind(&record.address)
                .bind(&record.phone)
                .bind(&record.hours)
                .bind(&record.price_range)
                .bind(mall_restaurant_id)
                .execute(&self.pool)
                .await
                .context("inserting location")?;
            }
        }
        Ok(())
    }

    async fn load_source_registry(&self) -> Result<SourceRegistry> {
        let path = self.config.workspace_root.join("sources.yaml");
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    async fn enabled_sources(&self, only_brand: Option<&str>) -> Result<Vec<SourceConfig>> {
        let registry = self.load_source_registry().await?;
        Ok(registry
            .sources
            .into_iter()
            .filter(|s| s.enabled)
            .filter(|s| only_brand.map_or(true, |b| s.brand_slug == b))
            .collect())
    }

    async fn fetch_merged_draft(
        &self,
        source: &SourceConfig,
        adapter: &dyn MenuSource,
        ctx: &ScrapeContext,
    ) -> Result<Option<MenuDraft>> {
        let targets = source.targets(&self.config.workspace_root);
        if targets.is_empty() {
            return Ok(None);
        }
        let pages = adapter.fetch(&self.http, ctx, &targets).await?;
        let mut drafts = Vec::with_capacity(pages.len());
        for page in &pages {
            drafts.push(adapter.parse(page)?);
        }
        Ok(merge_drafts(drafts))
    }

    /// Full-replace menu sync for every enabled source (optionally one
    /// brand). One source failing never stops the rest.
    pub async fn run_menu_sync(&self, only_brand: Option<&str>) -> Result<RunSummary> {
        let run = RunProvenance::start_now();
        let ctx = ScrapeContext { run };
        let mut summary = RunSummary::start(run, "menu-sync");
        let sources = self.enabled_sources(only_brand).await?;

        for source in &sources {
            let outcome = self.sync_one_source(source, &ctx).await;
            match &outcome {
                ItemOutcome::Processed => {
                    info!(source = %source.source_id, "menu sync completed");
                }
                ItemOutcome::Skipped(reason) => {
                    info!(source = %source.source_id, reason, "menu sync skipped");
                }
                ItemOutcome::Failed(reason) => {
                    warn!(source = %source.source_id, reason, "menu sync failed");
                }
            }
            summary.absorb(&source.source_id, &outcome);
        }

        summary.finish();
        self.write_reports(&summary).await?;
        Ok(summary)
    }

    async fn sync_one_source(&self, source: &SourceConfig, ctx: &ScrapeContext) -> ItemOutcome {
        let Some(adapter) = source_for(&source.kind, &source.source_id, &source.brand_slug) else {
            let reason = format!("no adapter for kind {}", source.kind);
            log_scrape(&self.pool, ctx.run.run_id, &source.source_id, Some(&source.brand_slug), "failed", Some(&reason)).await;
            return ItemOutcome::Failed(reason);
        };

        let draft = match self.fetch_merged_draft(source, adapter.as_ref(), ctx).await {
            Ok(Some(draft)) => draft,
            Ok(None) => {
                let reason = "no targets configured".to_string();
                log_scrape(&self.pool, ctx.run.run_id, &source.source_id, Some(&source.brand_slug), "skipped", Some(&reason)).await;
                return ItemOutcome::Skipped(reason);
            }
            Err(err) => {
                let reason = format!("fetch/parse failed: {err:#}");
                log_scrape(&self.pool, ctx.run.run_id, &source.source_id, Some(&source.brand_slug), "failed", Some(&reason)).await;
                return ItemOutcome::Failed(reason);
            }
        };

        match replace_decision(&draft) {
            ReplaceDecision::Skip => {
                let reason = "empty scrape result, existing menu left untouched".to_string();
                log_scrape(&self.pool, ctx.run.run_id, &source.source_id, Some(&source.brand_slug), "skipped", Some(&reason)).await;
                ItemOutcome::Skipped(reason)
            }
            ReplaceDecision::Replace { .. } => {
                let persisted = async {
                    let brand_menu_id = upsert_brand(&self.pool, &source.brand_slug).await?;
                    apply_full_replace(&self.pool, brand_menu_id, &draft).await
                }
                .await;
                match persisted {
                    Ok(stats) => {
                        let detail = format!(
                            "categories={} items={}",
                            stats.categories, stats.items
                        );
                        log_scrape(&self.pool, ctx.run.run_id, &source.source_id, Some(&source.brand_slug), "completed", Some(&detail)).await;
                        ItemOutcome::Processed
                    }
                    Err(err) => {
                        let reason = format!("persist failed: {err:#}");
                        log_scrape(&self.pool, ctx.run.run_id, &source.source_id, Some(&source.brand_slug), "failed", Some(&reason)).await;
                        ItemOutcome::Failed(reason)
                    }
                }
            }
        }
    }

    fn image_pipeline(&self) -> Result<ImagePipeline> {
        let (Some(url), Some(key)) = (
            self.config.supabase_url.as_deref(),
            self.config.supabase_service_key.as_deref(),
        ) else {
            bail!("SUPABASE_URL and SUPABASE_SERVICE_ROLE_KEY are required for image sync");
        };
        Ok(ImagePipeline::new(
            ImageRules::default(),
            ObjectStore::new(url, key, self.config.image_bucket.clone()),
        ))
    }

    /// Match scraped items against existing rows and update image fields
    /// on the matches. Never touches names or prices.
    pub async fn run_image_sync(&self, only_brand: Option<&str>) -> Result<RunSummary> {
        let pipeline = self.image_pipeline()?;
        let run = RunProvenance::start_now();
        let ctx = ScrapeContext { run };
        let mut summary = RunSummary::start(run, "image-sync");
        let sources = self.enabled_sources(only_brand).await?;
        let policy = BatchPolicy::from_config(&self.config);

        for source in &sources {
            let Some(adapter) = source_for(&source.kind, &source.source_id, &source.brand_slug)
            else {
                summary.absorb(
                    &source.source_id,
                    &ItemOutcome::Failed(format!("no adapter for kind {}", source.kind)),
                );
                continue;
            };

            let draft = match self.fetch_merged_draft(source, adapter.as_ref(), &ctx).await {
                Ok(Some(draft)) => draft,
                Ok(None) => {
                    summary.absorb(
                        &source.source_id,
                        &ItemOutcome::Skipped("no targets configured".to_string()),
                    );
                    continue;
                }
                Err(err) => {
                    let reason = format!("fetch/parse failed: {err:#}");
                    log_scrape(&self.pool, run.run_id, &source.source_id, Some(&source.brand_slug), "failed", Some(&reason)).await;
                    summary.absorb(&source.source_id, &ItemOutcome::Failed(reason));
                    continue;
                }
            };

            let scraped = flatten_scraped(&draft);
            let brand_menu_id = match upsert_brand(&self.pool, &source.brand_slug).await {
                Ok(id) => id,
                Err(err) => {
                    summary.absorb(&source.source_id, &ItemOutcome::Failed(format!("{err:#}")));
                    continue;
                }
            };
            let db_items = match load_db_menu_items(&self.pool, brand_menu_id).await {
                Ok(items) => items,
                Err(err) => {
                    summary.absorb(&source.source_id, &ItemOutcome::Failed(format!("{err:#}")));
                    continue;
                }
            };

            let report = assign_greedy(&scraped, &db_items, MatchConfig::default());
            for &idx in &report.unmatched_scraped {
                let reason = format!("no db match for scraped item {:?}", scraped[idx].name);
                log_scrape(&self.pool, run.run_id, &source.source_id, Some(&source.brand_slug), "unmatched", Some(&reason)).await;
                summary.absorb(&source.source_id, &ItemOutcome::Skipped(reason));
            }

            let jobs = report
                .pairs
                .iter()
                .filter_map(|pair| {
                    let s = &scraped[pair.scraped_index];
                    let d = &db_items[pair.db_index];
                    s.image_url.as_ref().map(|url| ImageJob {
                        db_item_id: d.id,
                        item_name: s.name.clone(),
                        original_url: url.clone(),
                    })
                })
                .collect::<Vec<_>>();

            let outcomes = run_batched(jobs, policy, |job| {
                self.process_image_job(&pipeline, run.run_id, &source.source_id, &source.brand_slug, job)
            })
            .await;
            for outcome in outcomes {
                summary.absorb(&source.source_id, &outcome);
            }
        }

        summary.finish();
        self.write_reports(&summary).await?;
        Ok(summary)
    }

    async fn process_image_job(
        &self,
        pipeline: &ImagePipeline,
        run_id: Uuid,
        source_id: &str,
        brand_slug: &str,
        job: ImageJob,
    ) -> ItemOutcome {
        let object_path = format!("{}/{}.jpg", brand_slug, slugify(&job.item_name));
        let cdn_url = match pipeline
            .process(&self.http, &self.image_cache, run_id, source_id, &job.original_url, &object_path)
            .await
        {
            Ok(url) => url,
            Err(err) => {
                let reason = format!("image {} failed: {err}", job.original_url);
                log_scrape(&self.pool, run_id, source_id, Some(brand_slug), "image_failed", Some(&reason)).await;
                return ItemOutcome::Failed(reason);
            }
        };

        let updated = sqlx::query(
            "UPDATE menu_items SET image_url = $2, cdn_image_url = $3 WHERE id = $1",
        )
        .bind(job.db_item_id)
        .bind(&job.original_url)
        .bind(&cdn_url)
        .execute(&self.pool)
        .await;
        match updated {
            Ok(_) => ItemOutcome::Processed,
            Err(err) => {
                let reason = format!("image row update failed: {err}");
                log_scrape(&self.pool, run_id, source_id, Some(brand_slug), "image_failed", Some(&reason)).await;
                ItemOutcome::Failed(reason)
            }
        }
    }

    /// Generate descriptions/recommendations for active brands that have
    /// none. Per-brand failures are logged and counted, never fatal.
    pub async fn run_enrichment(&self, enricher: &Enricher, limit: i64) -> Result<RunSummary> {
        let run = RunProvenance::start_now();
        let mut summary = RunSummary::start(run, "enrich");
        let policy = BatchPolicy::from_config(&self.config);

        let brands = sqlx::query(
            r#"
            SELECT id, slug, name
              FROM brand_menus
             WHERE is_active
               AND (description IS NULL OR length(trim(description)) = 0)
             ORDER BY slug
             LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("selecting brands to enrich")?;

        let mut jobs = Vec::with_capacity(brands.len());
        for row in brands {
            let id: Uuid = row.try_get("id")?;
            let slug: String = row.try_get("slug")?;
            let name: String = row.try_get("name")?;
            jobs.push((id, slug, name));
        }

        let outcomes = run_batched(jobs, policy, |(id, slug, name)| async move {
            let outcome = self.enrich_one_brand(enricher, run.run_id, id, &slug, &name).await;
            (slug, outcome)
        })
        .await;
        for (slug, outcome) in outcomes {
            summary.absorb(&slug, &outcome);
        }

        summary.finish();
        self.write_reports(&summary).await?;
        Ok(summary)
    }

    async fn enrich_one_brand(
        &self,
        enricher: &Enricher,
        run_id: Uuid,
        brand_menu_id: Uuid,
        slug: &str,
        name: &str,
    ) -> ItemOutcome {
        let ctx = match self.load_brand_context(brand_menu_id, slug, name).await {
            Ok(ctx) => ctx,
            Err(err) => {
                let reason = format!("context load failed: {err:#}");
                log_enrichment(&self.pool, run_id, slug, "failed", Some(&reason)).await;
                return ItemOutcome::Failed(reason);
            }
        };

        let content = match enricher.generate(&ctx).await {
            Ok(content) => content,
            Err(err) => {
                let reason = format!("generation failed: {err}");
                log_enrichment(&self.pool, run_id, slug, "failed", Some(&reason)).await;
                return ItemOutcome::Failed(reason);
            }
        };

        let updated = sqlx::query(
            r#"
            UPDATE brand_menus
               SET description = $2, recommendations = $3, updated_at = NOW()
             WHERE id = $1
            "#,
        )
        .bind(brand_menu_id)
        .bind(&content.description)
        .bind(&content.recommendations)
        .execute(&self.pool)
        .await;
        match updated {
            Ok(_) => {
                log_enrichment(&self.pool, run_id, slug, "completed", None).await;
                ItemOutcome::Processed
            }
            Err(err) => {
                let reason = format!("brand update failed: {err}");
                log_enrichment(&self.pool, run_id, slug, "failed", Some(&reason)).await;
                ItemOutcome::Failed(reason)
            }
        }
    }

    async fn load_brand_context(
        &self,
        brand_menu_id: Uuid,
        slug: &str,
        name: &str,
    ) -> Result<BrandContext> {
        let location_rows = sqlx::query(
            r#"
            SELECT COALESCE(bl.address, '') AS address, COALESCE(bl.mall_slug, '') AS mall_slug
              FROM brand_locations bl
             WHERE bl.brand_menu_id = $1
             ORDER BY bl.created_at
             LIMIT 8
            "#,
        )
        .bind(brand_menu_id)
        .fetch_all(&self.pool)
        .await
        .context("loading brand locations")?;
        let mut location_summaries = Vec::with_capacity(location_rows.len());
        for row in location_rows {
            let address: String = row.try_get("address")?;
            let mall: String = row.try_get("mall_slug")?;
            let summary = match (address.is_empty(), mall.is_empty()) {
                (false, false) => format!("{address} ({mall})"),
                (false, true) => address,
                (true, false) => mall,
                (true, true) => continue,
            };
            location_summaries.push(summary);
        }

        let cuisines: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT unnest(mr.cuisines)
              FROM brand_locations bl
              JOIN mall_restaurants mr ON mr.id = bl.mall_restaurant_id
             WHERE bl.brand_menu_id = $1
            "#,
        )
        .bind(brand_menu_id)
        .fetch_all(&self.pool)
        .await
        .context("loading brand cuisines")?;

        let sample_menu_items: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT mi.name
              FROM menu_items mi
              JOIN menu_categories mc ON mc.id = mi.category_id
             WHERE mc.brand_menu_id = $1
             ORDER BY mc.sort_order, mi.sort_order
             LIMIT 12
            "#,
        )
        .bind(brand_menu_id)
        .fetch_all(&self.pool)
        .await
        .context("loading sample menu items")?;

        Ok(BrandContext {
            slug: slug.to_string(),
            name: name.to_string(),
            cuisines,
            location_summaries,
            sample_menu_items,
        })
    }

    async fn write_reports(&self, summary: &RunSummary) -> Result<()> {
        let reports_dir = self
            .config
            .workspace_root
            .join("reports")
            .join(summary.run_id.to_string());
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        fs::write(
            reports_dir.join("run_summary.md"),
            render_summary_markdown(summary),
        )
        .await
        .context("writing run_summary.md")?;

        let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
        fs::write(reports_dir.join("run_summary.json"), json)
            .await
            .context("writing run_summary.json")?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct ImageJob {
    db_item_id: Uuid,
    item_name: String,
    original_url: String,
}

/// Flatten a draft into the ephemeral scraped-item form the matcher eats.
pub fn flatten_scraped(draft: &MenuDraft) -> Vec<ScrapedMenuItem> {
    draft
        .categories
        .iter()
        .flat_map(|c| {
            c.items.iter().map(|i| ScrapedMenuItem {
                name: i.name.clone(),
                description: i.description.clone(),
                price_text: i.price_text.clone(),
                price_value: i.price_value,
                image_url: i.image_url.clone(),
                category: Some(c.name.clone()),
            })
        })
        .collect()
}

pub fn render_summary_markdown(summary: &RunSummary) -> String {
    let per_source = summary
        .per_source
        .iter()
        .map(|(k, v)| format!("- {k}: {v}"))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "# Run `{}` ({})\n\n- Started: {}\n- Finished: {}\n- Processed: {}\n- Failed: {}\n- Skipped: {}\n\n## Items Per Source\n{}\n",
        summary.run_id,
        summary.operation,
        summary.started_at,
        summary.finished_at,
        summary.processed,
        summary.failed,
        summary.skipped,
        per_source
    )
}

/// Operator-facing digest of the most recent runs, read back from the
/// report files.
pub fn report_recent_markdown(runs: usize, workspace_root: Option<PathBuf>) -> Result<String> {
    let root = workspace_root.unwrap_or_else(|| PathBuf::from("."));
    let reports_root = root.join("reports");
    let mut dirs = std::fs::read_dir(&reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();
    let dirs = dirs.into_iter().take(runs.max(1)).collect::<Vec<_>>();

    let mut lines = vec!["# Recent Pipeline Runs".to_string(), String::new()];
    for dir in dirs {
        let run_id = dir.file_name().to_string_lossy().to_string();
        let summary_path = dir.path().join("run_summary.json");
        let value: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&summary_path)
                .with_context(|| format!("reading {}", summary_path.display()))?,
        )
        .with_context(|| format!("parsing {}", summary_path.display()))?;

        let field = |name: &str| value.get(name).and_then(|v| v.as_u64()).unwrap_or(0);
        lines.push(format!("## Run `{run_id}`"));
        lines.push(format!(
            "- operation: {}",
            value.get("operation").and_then(|v| v.as_str()).unwrap_or("unknown")
        ));
        lines.push(format!("- processed: {}", field("processed")));
        lines.push(format!("- failed: {}", field("failed")));
        lines.push(format!("- skipped: {}", field("skipped")));
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bfw_core::MenuItemDraft;

    fn item(name: &str, price: Option<&str>) -> MenuItemDraft {
        MenuItemDraft {
            name: name.to_string(),
            description: None,
            price_text: price.map(ToString::to_string),
            price_value: price.and_then(bfw_extract::parse_price),
            image_url: None,
            sort_order: 99,
        }
    }

    fn draft(categories: Vec<MenuCategoryDraft>) -> MenuDraft {
        MenuDraft {
            brand_slug: "old-chang-kee".into(),
            source_id: "old-chang-kee-site".into(),
            fetched_at: Utc::now(),
            extractor_version: "test".into(),
            categories,
        }
    }

    #[test]
    fn empty_draft_skips_instead_of_wiping() {
        let d = draft(vec![MenuCategoryDraft {
            name: "Puffs".into(),
            sort_order: 0,
            items: vec![],
        }]);
        assert_eq!(replace_decision(&d), ReplaceDecision::Skip);
    }

    #[test]
    fn replace_counts_only_nonempty_categories() {
        let d = draft(vec![
            MenuCategoryDraft {
                name: "Puffs".into(),
                sort_order: 0,
                items: vec![item("Curry Puff", Some("S$2.10"))],
            },
            MenuCategoryDraft {
                name: "Empty".into(),
                sort_order: 1,
                items: vec![],
            },
        ]);
        assert_eq!(
            replace_decision(&d),
            ReplaceDecision::Replace {
                categories: 1,
                items: 1
            }
        );
    }

    #[test]
    fn normalization_reassigns_contiguous_sort_orders() {
        let d = draft(vec![
            MenuCategoryDraft {
                name: "Empty".into(),
                sort_order: 5,
                items: vec![],
            },
            MenuCategoryDraft {
                name: "Puffs".into(),
                sort_order: 9,
                items: vec![item("Curry Puff", None), item("Sardine Puff", None)],
            },
        ]);
        let normalized = normalized_categories(&d);
        assert_eq!(normalized.len(), 1);
        assert_eq!(normalized[0].sort_order, 0);
        assert_eq!(normalized[0].items[0].sort_order, 0);
        assert_eq!(normalized[0].items[1].sort_order, 1);
    }

    #[test]
    fn planned_rows_are_stable_across_runs() {
        let d = draft(vec![MenuCategoryDraft {
            name: "Puffs".into(),
            sort_order: 0,
            items: vec![
                item("Curry Puff", Some("S$2.10")),
                item("Sardine Puff", Some("S$2.10")),
            ],
        }]);
        let first = planned_rows(&d);
        let second = planned_rows(&d);
        assert_eq!(first, second);
        assert_eq!(
            first,
            vec![
                ("Curry Puff".to_string(), Some("S$2.10".to_string()), 0),
                ("Sardine Puff".to_string(), Some("S$2.10".to_string()), 1),
            ]
        );
    }

    #[test]
    fn merged_drafts_renumber_categories() {
        let a = draft(vec![MenuCategoryDraft {
            name: "Puffs".into(),
            sort_order: 0,
            items: vec![item("Curry Puff", None)],
        }]);
        let b = draft(vec![MenuCategoryDraft {
            name: "Drinks".into(),
            sort_order: 0,
            items: vec![item("Kopi", None)],
        }]);
        let merged = merge_drafts(vec![a, b]).unwrap();
        assert_eq!(merged.categories.len(), 2);
        assert_eq!(merged.categories[0].sort_order, 0);
        assert_eq!(merged.categories[1].sort_order, 1);
        assert!(merge_drafts(vec![]).is_none());
    }

    #[test]
    fn flattening_keeps_category_names() {
        let d = draft(vec![MenuCategoryDraft {
            name: "Puffs".into(),
            sort_order: 0,
            items: vec![item("Curry Puff", None)],
        }]);
        let scraped = flatten_scraped(&d);
        assert_eq!(scraped.len(), 1);
        assert_eq!(scraped[0].category.as_deref(), Some("Puffs"));
    }

    #[tokio::test]
    async fn batched_runner_preserves_all_results() {
        let policy = BatchPolicy {
            concurrency: 3,
            inter_batch_delay: Duration::from_millis(0),
        };
        let results = run_batched((0..10).collect::<Vec<_>>(), policy, |n| async move { n * 2 }).await;
        let mut sorted = results.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..10).map(|n| n * 2).collect::<Vec<_>>());
        assert_eq!(results.len(), 10);
    }

    #[tokio::test]
    async fn batched_runner_isolates_item_failures() {
        let policy = BatchPolicy {
            concurrency: 2,
            inter_batch_delay: Duration::from_millis(0),
        };
        let outcomes = run_batched(vec![1, 2, 3, 4], policy, |n| async move {
            if n % 2 == 0 {
                ItemOutcome::Failed(format!("item {n}"))
            } else {
                ItemOutcome::Processed
            }
        })
        .await;
        let failed = outcomes
            .iter()
            .filter(|o| matches!(o, ItemOutcome::Failed(_)))
            .count();
        assert_eq!(failed, 2);
        assert_eq!(outcomes.len(), 4);
    }

    #[test]
    fn summary_counters_track_outcomes() {
        let run = RunProvenance::start_now();
        let mut summary = RunSummary::start(run, "menu-sync");
        summary.absorb("a", &ItemOutcome::Processed);
        summary.absorb("a", &ItemOutcome::Failed("x".into()));
        summary.absorb("b", &ItemOutcome::Skipped("y".into()));
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.per_source["a"], 2);
        assert_eq!(summary.per_source["b"], 1);
    }

    #[test]
    fn source_without_urls_or_capture_has_no_targets() {
        let source = SourceConfig {
            source_id: "bare".into(),
            display_name: "Bare".into(),
            enabled: true,
            kind: "html".into(),
            brand_slug: "bare".into(),
            listing_urls: vec![],
            capture_path: None,
            notes: None,
        };
        assert!(source.targets(std::path::Path::new(".")).is_empty());
    }

    #[test]
    fn failed_page_fetch_still_produces_a_summary() {
        let run = RunProvenance::start_now();
        let mut summary = RunSummary::start(run, "directory-sync");
        summary.absorb(
            "nex",
            &ItemOutcome::Failed("fetching directory page https://mall.test/dine".into()),
        );
        summary.finish();
        assert_eq!(summary.failed, 1);
        let md = render_summary_markdown(&summary);
        assert!(md.contains("directory-sync"));
        assert!(md.contains("Failed: 1"));
    }

    #[test]
    fn display_names_title_case_slugs() {
        assert_eq!(display_name_for_slug("old-chang-kee"), "Old Chang Kee");
        assert_eq!(display_name_for_slug("ya-kun"), "Ya Kun");
    }

    #[test]
    fn recent_report_digest_reads_summaries() {
        let dir = tempfile::tempdir().unwrap();
        let run_dir = dir.path().join("reports").join("run-1");
        std::fs::create_dir_all(&run_dir).unwrap();
        std::fs::write(
            run_dir.join("run_summary.json"),
            r#"{"operation":"menu-sync","processed":3,"failed":1,"skipped":0}"#,
        )
        .unwrap();
        let md = report_recent_markdown(1, Some(dir.path().to_path_buf())).unwrap();
        assert!(md.contains("run-1"));
        assert!(md.contains("processed: 3"));
        assert!(md.contains("failed: 1"));
    }
}

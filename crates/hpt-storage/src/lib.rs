//! Persistence for the plan catalog: the injected `CatalogStore` seam, an
//! in-memory implementation for tests, the Postgres implementation, and an
//! immutable archive for raw provider responses.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hpt_core::{
    normalize_name, Community, CommunitySnapshot, Company, CompanySnapshot, Plan, PlanKey,
    PlanType, PriceChange, ProductSegment, SegmentCompany, SegmentKeyType, SegmentRole,
};
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

pub const CRATE_NAME: &str = "hpt-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    /// A unique-index collision. Callers recover by re-fetching the row that
    /// won the race; this is never surfaced as an ingestion error.
    #[error("duplicate key on {constraint}")]
    Duplicate { constraint: String },
    #[error("not found")]
    NotFound,
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, StoreError::Duplicate { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Default)]
pub struct NewCompany {
    pub name: String,
    pub description: Option<String>,
    pub website: Option<String>,
    pub headquarters: Option<String>,
    pub founded_year: Option<i32>,
}

#[derive(Debug, Clone, Default)]
pub struct NewCommunity {
    pub name: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub parent_community_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct NewSegment {
    pub community_id: Uuid,
    pub name: String,
    pub label: String,
    pub active: bool,
    pub display_order: i32,
}

#[derive(Debug, Clone, Default)]
pub struct SegmentUpdate {
    pub name: Option<String>,
    pub label: Option<String>,
    pub active: Option<bool>,
    pub display_order: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct NewSegmentCompany {
    pub segment_id: Uuid,
    pub company_id: Uuid,
    pub role: SegmentRole,
    pub source_community_id: Option<Uuid>,
    pub key_type: SegmentKeyType,
    pub values: Vec<String>,
    pub plan_names: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct SegmentCompanyUpdate {
    pub role: Option<SegmentRole>,
    pub source_community_id: Option<Uuid>,
    pub key_type: Option<SegmentKeyType>,
    pub values: Option<Vec<String>>,
    pub plan_names: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct NewPlan {
    pub plan_name: String,
    pub plan_type: PlanType,
    pub company: CompanySnapshot,
    pub community: CommunitySnapshot,
    pub price: f64,
    pub sqft: Option<f64>,
    pub stories: Option<f64>,
    pub price_per_sqft: Option<f64>,
    pub beds: Option<f64>,
    pub baths: Option<f64>,
    pub address: Option<String>,
    pub design_number: Option<String>,
    pub segment_id: Option<Uuid>,
    pub last_updated: DateTime<Utc>,
}

/// Overwrite-when-present patch: a `Some` field replaces the stored value,
/// `None` leaves it untouched.
#[derive(Debug, Clone, Default)]
pub struct PlanUpdate {
    pub price: Option<f64>,
    pub sqft: Option<f64>,
    pub stories: Option<f64>,
    pub price_per_sqft: Option<f64>,
    pub beds: Option<f64>,
    pub baths: Option<f64>,
    pub address: Option<String>,
    pub design_number: Option<String>,
    pub segment_id: Option<Uuid>,
    pub company: Option<CompanySnapshot>,
    pub community: Option<CommunitySnapshot>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl PlanUpdate {
    fn apply(self, plan: &mut Plan) {
        if let Some(v) = self.price {
            plan.price = v;
        }
        if let Some(v) = self.sqft {
            plan.sqft = Some(v);
        }
        if let Some(v) = self.stories {
            plan.stories = Some(v);
        }
        if let Some(v) = self.price_per_sqft {
            plan.price_per_sqft = Some(v);
        }
        if let Some(v) = self.beds {
            plan.beds = Some(v);
        }
        if let Some(v) = self.baths {
            plan.baths = Some(v);
        }
        if let Some(v) = self.address {
            plan.address = Some(v);
        }
        if let Some(v) = self.design_number {
            plan.design_number = Some(v);
        }
        if let Some(v) = self.segment_id {
            plan.segment_id = Some(v);
        }
        if let Some(v) = self.company {
            plan.company = v;
        }
        if let Some(v) = self.community {
            plan.community = v;
        }
        if let Some(v) = self.last_updated {
            plan.last_updated = v;
        }
    }
}

/// Persistence seam injected into the resolver, reconciler, and web layer.
/// Every unique index from the data model is observable through
/// `StoreError::Duplicate`.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn list_companies(&self) -> StoreResult<Vec<Company>>;
    async fn find_company(&self, id: Uuid) -> StoreResult<Option<Company>>;
    async fn find_company_by_normalized_name(&self, normalized: &str)
        -> StoreResult<Option<Company>>;
    async fn insert_company(&self, new: NewCompany) -> StoreResult<Company>;
    async fn delete_company(&self, id: Uuid) -> StoreResult<()>;

    async fn list_communities(&self) -> StoreResult<Vec<Community>>;
    async fn find_community(&self, id: Uuid) -> StoreResult<Option<Community>>;
    async fn find_community_by_normalized_name(
        &self,
        normalized: &str,
    ) -> StoreResult<Option<Community>>;
    async fn insert_community(&self, new: NewCommunity) -> StoreResult<Community>;
    async fn delete_community(&self, id: Uuid) -> StoreResult<()>;
    async fn community_has_children(&self, id: Uuid) -> StoreResult<bool>;
    async fn link_company_to_community(&self, community_id: Uuid, company_id: Uuid)
        -> StoreResult<()>;
    async fn set_community_counts(
        &self,
        id: Uuid,
        total_plans: i64,
        total_quick_move_ins: i64,
    ) -> StoreResult<()>;

    async fn list_segments(&self, community_id: Option<Uuid>) -> StoreResult<Vec<ProductSegment>>;
    async fn find_segment(&self, id: Uuid) -> StoreResult<Option<ProductSegment>>;
    async fn insert_segment(&self, new: NewSegment) -> StoreResult<ProductSegment>;
    async fn update_segment(&self, id: Uuid, update: SegmentUpdate) -> StoreResult<ProductSegment>;
    /// Deleting a segment cascades to its segment/company associations.
    async fn delete_segment(&self, id: Uuid) -> StoreResult<()>;

    async fn list_segment_companies(
        &self,
        segment_id: Option<Uuid>,
    ) -> StoreResult<Vec<SegmentCompany>>;
    async fn find_segment_company(&self, id: Uuid) -> StoreResult<Option<SegmentCompany>>;
    async fn insert_segment_company(&self, new: NewSegmentCompany) -> StoreResult<SegmentCompany>;
    async fn update_segment_company(
        &self,
        id: Uuid,
        update: SegmentCompanyUpdate,
    ) -> StoreResult<SegmentCompany>;
    async fn delete_segment_company(&self, id: Uuid) -> StoreResult<()>;

    async fn find_plan(&self, id: Uuid) -> StoreResult<Option<Plan>>;
    async fn find_plan_by_key(&self, key: &PlanKey) -> StoreResult<Option<Plan>>;
    async fn insert_plan(&self, new: NewPlan) -> StoreResult<Plan>;
    async fn update_plan(&self, id: Uuid, update: PlanUpdate) -> StoreResult<Plan>;
    async fn list_plans(&self, community_id: Option<Uuid>) -> StoreResult<Vec<Plan>>;
    async fn count_plans(&self, community_id: Uuid, plan_type: PlanType) -> StoreResult<i64>;

    async fn append_price_change(
        &self,
        plan_id: Uuid,
        old_price: f64,
        new_price: f64,
        changed_at: DateTime<Utc>,
    ) -> StoreResult<PriceChange>;
    async fn price_history(&self, plan_id: Uuid) -> StoreResult<Vec<PriceChange>>;
    /// Plan ids with at least one price change at or after `since`; backs the
    /// recomputed `price_changed_recently` flag.
    async fn recently_changed_plan_ids(&self, since: DateTime<Utc>)
        -> StoreResult<HashSet<Uuid>>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemInner {
    companies: HashMap<Uuid, Company>,
    company_names: HashMap<String, Uuid>,
    communities: HashMap<Uuid, Community>,
    community_names: HashMap<String, Uuid>,
    segments: HashMap<Uuid, ProductSegment>,
    segment_names: HashMap<(Uuid, String), Uuid>,
    segment_companies: HashMap<Uuid, SegmentCompany>,
    segment_company_pairs: HashMap<(Uuid, Uuid), Uuid>,
    plans: HashMap<Uuid, Plan>,
    plan_keys: HashMap<PlanKey, Uuid>,
    price_changes: Vec<PriceChange>,
}

/// Hash-map store with the same unique-index semantics as Postgres; the
/// single mutex serializes writers the way the database's indexes do.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn list_companies(&self) -> StoreResult<Vec<Company>> {
        let inner = self.inner.lock().await;
        let mut out: Vec<_> = inner.companies.values().cloned().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn find_company(&self, id: Uuid) -> StoreResult<Option<Company>> {
        Ok(self.inner.lock().await.companies.get(&id).cloned())
    }

    async fn find_company_by_normalized_name(
        &self,
        normalized: &str,
    ) -> StoreResult<Option<Company>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .company_names
            .get(normalized)
            .and_then(|id| inner.companies.get(id))
            .cloned())
    }

    async fn insert_company(&self, new: NewCompany) -> StoreResult<Company> {
        let mut inner = self.inner.lock().await;
        let normalized = normalize_name(&new.name);
        if inner.company_names.contains_key(&normalized) {
            return Err(StoreError::Duplicate {
                constraint: "companies_normalized_name_key".into(),
            });
        }
        let company = Company {
            id: Uuid::new_v4(),
            name: new.name.trim().to_string(),
            normalized_name: normalized.clone(),
            description: new.description,
            website: new.website,
            headquarters: new.headquarters,
            founded_year: new.founded_year,
            created_at: Utc::now(),
        };
        inner.company_names.insert(normalized, company.id);
        inner.companies.insert(company.id, company.clone());
        Ok(company)
    }

    async fn delete_company(&self, id: Uuid) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let company = inner.companies.remove(&id).ok_or(StoreError::NotFound)?;
        inner.company_names.remove(&company.normalized_name);
        Ok(())
    }

    async fn list_communities(&self) -> StoreResult<Vec<Community>> {
        let inner = self.inner.lock().await;
        let mut out: Vec<_> = inner.communities.values().cloned().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn find_community(&self, id: Uuid) -> StoreResult<Option<Community>> {
        Ok(self.inner.lock().await.communities.get(&id).cloned())
    }

    async fn find_community_by_normalized_name(
        &self,
        normalized: &str,
    ) -> StoreResult<Option<Community>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .community_names
            .get(normalized)
            .and_then(|id| inner.communities.get(id))
            .cloned())
    }

    async fn insert_community(&self, new: NewCommunity) -> StoreResult<Community> {
        let mut inner = self.inner.lock().await;
        let normalized = normalize_name(&new.name);
        if inner.community_names.contains_key(&normalized) {
            return Err(StoreError::Duplicate {
                constraint: "communities_normalized_name_key".into(),
            });
        }
        let community = Community {
            id: Uuid::new_v4(),
            name: new.name.trim().to_string(),
            normalized_name: normalized.clone(),
            description: new.description,
            location: new.location,
            total_plans: 0,
            total_quick_move_ins: 0,
            company_ids: Vec::new(),
            parent_community_id: new.parent_community_id,
            created_at: Utc::now(),
        };
        inner.community_names.insert(normalized, community.id);
        inner.communities.insert(community.id, community.clone());
        Ok(community)
    }

    async fn delete_community(&self, id: Uuid) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let community = inner.communities.remove(&id).ok_or(StoreError::NotFound)?;
        inner.community_names.remove(&community.normalized_name);
        Ok(())
    }

    async fn community_has_children(&self, id: Uuid) -> StoreResult<bool> {
        let inner = self.inner.lock().await;
        Ok(inner
            .communities
            .values()
            .any(|c| c.parent_community_id == Some(id)))
    }

    async fn link_company_to_community(
        &self,
        community_id: Uuid,
        company_id: Uuid,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let community = inner
            .communities
            .get_mut(&community_id)
            .ok_or(StoreError::NotFound)?;
        if !community.company_ids.contains(&company_id) {
            community.company_ids.push(company_id);
        }
        Ok(())
    }

    async fn set_community_counts(
        &self,
        id: Uuid,
        total_plans: i64,
        total_quick_move_ins: i64,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let community = inner.communities.get_mut(&id).ok_or(StoreError::NotFound)?;
        community.total_plans = total_plans;
        community.total_quick_move_ins = total_quick_move_ins;
        Ok(())
    }

    async fn list_segments(&self, community_id: Option<Uuid>) -> StoreResult<Vec<ProductSegment>> {
        let inner = self.inner.lock().await;
        let mut out: Vec<_> = inner
            .segments
            .values()
            .filter(|s| community_id.map(|id| s.community_id == id).unwrap_or(true))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.display_order.cmp(&b.display_order).then(a.name.cmp(&b.name)));
        Ok(out)
    }

    async fn find_segment(&self, id: Uuid) -> StoreResult<Option<ProductSegment>> {
        Ok(self.inner.lock().await.segments.get(&id).cloned())
    }

    async fn insert_segment(&self, new: NewSegment) -> StoreResult<ProductSegment> {
        let mut inner = self.inner.lock().await;
        let key = (new.community_id, new.name.clone());
        if inner.segment_names.contains_key(&key) {
            return Err(StoreError::Duplicate {
                constraint: "product_segments_community_name_key".into(),
            });
        }
        let segment = ProductSegment {
            id: Uuid::new_v4(),
            community_id: new.community_id,
            name: new.name,
            label: new.label,
            active: new.active,
            display_order: new.display_order,
        };
        inner.segment_names.insert(key, segment.id);
        inner.segments.insert(segment.id, segment.clone());
        Ok(segment)
    }

    async fn update_segment(&self, id: Uuid, update: SegmentUpdate) -> StoreResult<ProductSegment> {
        let mut inner = self.inner.lock().await;
        let current = inner.segments.get(&id).cloned().ok_or(StoreError::NotFound)?;
        if let Some(name) = &update.name {
            let key = (current.community_id, name.clone());
            if inner.segment_names.get(&key).is_some_and(|existing| *existing != id) {
                return Err(StoreError::Duplicate {
                    constraint: "product_segments_community_name_key".into(),
                });
            }
        }
        let mut updated = current.clone();
        if let Some(name) = update.name {
            inner
                .segment_names
                .remove(&(current.community_id, current.name.clone()));
            inner
                .segment_names
                .insert((current.community_id, name.clone()), id);
            updated.name = name;
        }
        if let Some(label) = update.label {
            updated.label = label;
        }
        if let Some(active) = update.active {
            updated.active = active;
        }
        if let Some(order) = update.display_order {
            updated.display_order = order;
        }
        inner.segments.insert(id, updated.clone());
        Ok(updated)
    }

    async fn delete_segment(&self, id: Uuid) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let segment = inner.segments.remove(&id).ok_or(StoreError::NotFound)?;
        inner
            .segment_names
            .remove(&(segment.community_id, segment.name));
        let doomed: Vec<Uuid> = inner
            .segment_companies
            .values()
            .filter(|sc| sc.segment_id == id)
            .map(|sc| sc.id)
            .collect();
        for sc_id in doomed {
            if let Some(sc) = inner.segment_companies.remove(&sc_id) {
                inner
                    .segment_company_pairs
                    .remove(&(sc.segment_id, sc.company_id));
            }
        }
        Ok(())
    }

    async fn list_segment_companies(
        &self,
        segment_id: Option<Uuid>,
    ) -> StoreResult<Vec<SegmentCompany>> {
        let inner = self.inner.lock().await;
        let mut out: Vec<_> = inner
            .segment_companies
            .values()
            .filter(|sc| segment_id.map(|id| sc.segment_id == id).unwrap_or(true))
            .cloned()
            .collect();
        out.sort_by_key(|sc| sc.id);
        Ok(out)
    }

    async fn find_segment_company(&self, id: Uuid) -> StoreResult<Option<SegmentCompany>> {
        Ok(self.inner.lock().await.segment_companies.get(&id).cloned())
    }

    async fn insert_segment_company(&self, new: NewSegmentCompany) -> StoreResult<SegmentCompany> {
        let mut inner = self.inner.lock().await;
        let pair = (new.segment_id, new.company_id);
        if inner.segment_company_pairs.contains_key(&pair) {
            return Err(StoreError::Duplicate {
                constraint: "segment_companies_segment_company_key".into(),
            });
        }
        let assoc = SegmentCompany {
            id: Uuid::new_v4(),
            segment_id: new.segment_id,
            company_id: new.company_id,
            role: new.role,
            source_community_id: new.source_community_id,
            key_type: new.key_type,
            values: new.values,
            plan_names: new.plan_names,
        };
        inner.segment_company_pairs.insert(pair, assoc.id);
        inner.segment_companies.insert(assoc.id, assoc.clone());
        Ok(assoc)
    }

    async fn update_segment_company(
        &self,
        id: Uuid,
        update: SegmentCompanyUpdate,
    ) -> StoreResult<SegmentCompany> {
        let mut inner = self.inner.lock().await;
        let assoc = inner
            .segment_companies
            .get_mut(&id)
            .ok_or(StoreError::NotFound)?;
        if let Some(role) = update.role {
            assoc.role = role;
        }
        if let Some(source) = update.source_community_id {
            assoc.source_community_id = Some(source);
        }
        if let Some(key_type) = update.key_type {
            assoc.key_type = key_type;
        }
        if let Some(values) = update.values {
            assoc.values = values;
        }
        if let Some(plan_names) = update.plan_names {
            assoc.plan_names = Some(plan_names);
        }
        Ok(assoc.clone())
    }

    async fn delete_segment_company(&self, id: Uuid) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let assoc = inner
            .segment_companies
            .remove(&id)
            .ok_or(StoreError::NotFound)?;
        inner
            .segment_company_pairs
            .remove(&(assoc.segment_id, assoc.company_id));
        Ok(())
    }

    async fn find_plan(&self, id: Uuid) -> StoreResult<Option<Plan>> {
        Ok(self.inner.lock().await.plans.get(&id).cloned())
    }

    async fn find_plan_by_key(&self, key: &PlanKey) -> StoreResult<Option<Plan>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .plan_keys
            .get(key)
            .and_then(|id| inner.plans.get(id))
            .cloned())
    }

    async fn insert_plan(&self, new: NewPlan) -> StoreResult<Plan> {
        let mut inner = self.inner.lock().await;
        let key = PlanKey::new(
            new.plan_name.clone(),
            new.company.name.clone(),
            new.community.name.clone(),
            new.plan_type,
        );
        if inner.plan_keys.contains_key(&key) {
            return Err(StoreError::Duplicate {
                constraint: "plans_natural_key".into(),
            });
        }
        let plan = Plan {
            id: Uuid::new_v4(),
            plan_name: new.plan_name,
            plan_type: new.plan_type,
            company: new.company,
            community: new.community,
            price: new.price,
            sqft: new.sqft,
            stories: new.stories,
            price_per_sqft: new.price_per_sqft,
            beds: new.beds,
            baths: new.baths,
            address: new.address,
            design_number: new.design_number,
            segment_id: new.segment_id,
            price_changed_recently: false,
            last_updated: new.last_updated,
            created_at: Utc::now(),
        };
        inner.plan_keys.insert(key, plan.id);
        inner.plans.insert(plan.id, plan.clone());
        Ok(plan)
    }

    async fn update_plan(&self, id: Uuid, update: PlanUpdate) -> StoreResult<Plan> {
        let mut inner = self.inner.lock().await;
        let mut plan = inner.plans.get(&id).cloned().ok_or(StoreError::NotFound)?;
        let old_key = plan.key();
        update.apply(&mut plan);
        let new_key = plan.key();
        if new_key != old_key {
            inner.plan_keys.remove(&old_key);
            inner.plan_keys.insert(new_key, id);
        }
        inner.plans.insert(id, plan.clone());
        Ok(plan)
    }

    async fn list_plans(&self, community_id: Option<Uuid>) -> StoreResult<Vec<Plan>> {
        let inner = self.inner.lock().await;
        let mut out: Vec<_> = inner
            .plans
            .values()
            .filter(|p| community_id.map(|id| p.community.id == id).unwrap_or(true))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.plan_name.cmp(&b.plan_name));
        Ok(out)
    }

    async fn count_plans(&self, community_id: Uuid, plan_type: PlanType) -> StoreResult<i64> {
        let inner = self.inner.lock().await;
        Ok(inner
            .plans
            .values()
            .filter(|p| p.community.id == community_id && p.plan_type == plan_type)
            .count() as i64)
    }

    async fn append_price_change(
        &self,
        plan_id: Uuid,
        old_price: f64,
        new_price: f64,
        changed_at: DateTime<Utc>,
    ) -> StoreResult<PriceChange> {
        let mut inner = self.inner.lock().await;
        let change = PriceChange {
            id: Uuid::new_v4(),
            plan_id,
            old_price,
            new_price,
            changed_at,
        };
        inner.price_changes.push(change.clone());
        Ok(change)
    }

    async fn price_history(&self, plan_id: Uuid) -> StoreResult<Vec<PriceChange>> {
        let inner = self.inner.lock().await;
        let mut out: Vec<_> = inner
            .price_changes
            .iter()
            .filter(|c| c.plan_id == plan_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.changed_at.cmp(&a.changed_at));
        Ok(out)
    }

    async fn recently_changed_plan_ids(
        &self,
        since: DateTime<Utc>,
    ) -> StoreResult<HashSet<Uuid>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .price_changes
            .iter()
            .filter(|c| c.changed_at >= since)
            .map(|c| c.plan_id)
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Postgres store
// ---------------------------------------------------------------------------

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        sqlx::migrate!()
            .run(&self.pool)
            .await
            .context("running migrations")
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn map_sqlx(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.code().as_deref() == Some("23505") {
            return StoreError::Duplicate {
                constraint: db.constraint().unwrap_or("unknown").to_string(),
            };
        }
    }
    StoreError::Backend(anyhow::Error::new(err))
}

fn company_from_row(row: &sqlx::postgres::PgRow) -> Result<Company, sqlx::Error> {
    Ok(Company {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        normalized_name: row.try_get("normalized_name")?,
        description: row.try_get("description")?,
        website: row.try_get("website")?,
        headquarters: row.try_get("headquarters")?,
        founded_year: row.try_get("founded_year")?,
        created_at: row.try_get("created_at")?,
    })
}

fn community_from_row(row: &sqlx::postgres::PgRow) -> StoreResult<Community> {
    let company_ids_json: serde_json::Value = row.try_get("company_ids").map_err(map_sqlx)?;
    let company_ids: Vec<Uuid> = serde_json::from_value(company_ids_json)
        .context("decoding community company_ids")?;
    Ok(Community {
        id: row.try_get("id").map_err(map_sqlx)?,
        name: row.try_get("name").map_err(map_sqlx)?,
        normalized_name: row.try_get("normalized_name").map_err(map_sqlx)?,
        description: row.try_get("description").map_err(map_sqlx)?,
        location: row.try_get("location").map_err(map_sqlx)?,
        total_plans: row.try_get("total_plans").map_err(map_sqlx)?,
        total_quick_move_ins: row.try_get("total_quick_move_ins").map_err(map_sqlx)?,
        company_ids,
        parent_community_id: row.try_get("parent_community_id").map_err(map_sqlx)?,
        created_at: row.try_get("created_at").map_err(map_sqlx)?,
    })
}

fn segment_from_row(row: &sqlx::postgres::PgRow) -> Result<ProductSegment, sqlx::Error> {
    Ok(ProductSegment {
        id: row.try_get("id")?,
        community_id: row.try_get("community_id")?,
        name: row.try_get("name")?,
        label: row.try_get("label")?,
        active: row.try_get("active")?,
        display_order: row.try_get("display_order")?,
    })
}

fn segment_company_from_row(row: &sqlx::postgres::PgRow) -> StoreResult<SegmentCompany> {
    let role_text: String = row.try_get("role").map_err(map_sqlx)?;
    let role: SegmentRole = serde_json::from_value(serde_json::Value::String(role_text))
        .context("decoding segment company role")?;
    let key_type_text: String = row.try_get("key_type").map_err(map_sqlx)?;
    let key_type: SegmentKeyType = serde_json::from_value(serde_json::Value::String(key_type_text))
        .context("decoding segment company key_type")?;
    let values_json: serde_json::Value = row.try_get("match_values").map_err(map_sqlx)?;
    let values: Vec<String> =
        serde_json::from_value(values_json).context("decoding segment company values")?;
    let plan_names_json: Option<serde_json::Value> =
        row.try_get("plan_names").map_err(map_sqlx)?;
    let plan_names = plan_names_json
        .map(serde_json::from_value)
        .transpose()
        .context("decoding segment company plan_names")?;
    Ok(SegmentCompany {
        id: row.try_get("id").map_err(map_sqlx)?,
        segment_id: row.try_get("segment_id").map_err(map_sqlx)?,
        company_id: row.try_get("company_id").map_err(map_sqlx)?,
        role,
        source_community_id: row.try_get("source_community_id").map_err(map_sqlx)?,
        key_type,
        values,
        plan_names,
    })
}

fn plan_from_row(row: &sqlx::postgres::PgRow) -> StoreResult<Plan> {
    let plan_type_text: String = row.try_get("plan_type").map_err(map_sqlx)?;
    let plan_type = PlanType::from_str_opt(&plan_type_text)
        .ok_or_else(|| anyhow::anyhow!("unknown plan_type {plan_type_text}"))?;
    Ok(Plan {
        id: row.try_get("id").map_err(map_sqlx)?,
        plan_name: row.try_get("plan_name").map_err(map_sqlx)?,
        plan_type,
        company: CompanySnapshot {
            id: row.try_get("company_id").map_err(map_sqlx)?,
            name: row.try_get("company_name").map_err(map_sqlx)?,
        },
        community: CommunitySnapshot {
            id: row.try_get("community_id").map_err(map_sqlx)?,
            name: row.try_get("community_name").map_err(map_sqlx)?,
        },
        price: row.try_get("price").map_err(map_sqlx)?,
        sqft: row.try_get("sqft").map_err(map_sqlx)?,
        stories: row.try_get("stories").map_err(map_sqlx)?,
        price_per_sqft: row.try_get("price_per_sqft").map_err(map_sqlx)?,
        beds: row.try_get("beds").map_err(map_sqlx)?,
        baths: row.try_get("baths").map_err(map_sqlx)?,
        address: row.try_get("address").map_err(map_sqlx)?,
        design_number: row.try_get("design_number").map_err(map_sqlx)?,
        segment_id: row.try_get("segment_id").map_err(map_sqlx)?,
        price_changed_recently: false,
        last_updated: row.try_get("last_updated").map_err(map_sqlx)?,
        created_at: row.try_get("created_at").map_err(map_sqlx)?,
    })
}

fn price_change_from_row(row: &sqlx::postgres::PgRow) -> Result<PriceChange, sqlx::Error> {
    Ok(PriceChange {
        id: row.try_get("id")?,
        plan_id: row.try_get("plan_id")?,
        old_price: row.try_get("old_price")?,
        new_price: row.try_get("new_price")?,
        changed_at: row.try_get("changed_at")?,
    })
}

fn enum_wire_string<T: serde::Serialize>(value: &T) -> StoreResult<String> {
    match serde_json::to_value(value).context("encoding enum")? {
        serde_json::Value::String(s) => Ok(s),
        other => Err(StoreError::Backend(anyhow::anyhow!(
            "expected string encoding, got {other}"
        ))),
    }
}

#[async_trait]
impl CatalogStore for PgStore {
    async fn list_companies(&self) -> StoreResult<Vec<Company>> {
        let rows = sqlx::query("SELECT * FROM companies ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.iter()
            .map(|r| company_from_row(r).map_err(map_sqlx))
            .collect()
    }

    async fn find_company(&self, id: Uuid) -> StoreResult<Option<Company>> {
        let row = sqlx::query("SELECT * FROM companies WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.map(|r| company_from_row(&r).map_err(map_sqlx)).transpose()
    }

    async fn find_company_by_normalized_name(
        &self,
        normalized: &str,
    ) -> StoreResult<Option<Company>> {
        let row = sqlx::query("SELECT * FROM companies WHERE normalized_name = $1")
            .bind(normalized)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.map(|r| company_from_row(&r).map_err(map_sqlx)).transpose()
    }

    async fn insert_company(&self, new: NewCompany) -> StoreResult<Company> {
        let row = sqlx::query(
            r#"
            INSERT INTO companies
                (id, name, normalized_name, description, website, headquarters, founded_year)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new.name.trim())
        .bind(normalize_name(&new.name))
        .bind(&new.description)
        .bind(&new.website)
        .bind(&new.headquarters)
        .bind(new.founded_year)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;
        company_from_row(&row).map_err(map_sqlx)
    }

    async fn delete_company(&self, id: Uuid) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM companies WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn list_communities(&self) -> StoreResult<Vec<Community>> {
        let rows = sqlx::query("SELECT * FROM communities ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.iter().map(community_from_row).collect()
    }

    async fn find_community(&self, id: Uuid) -> StoreResult<Option<Community>> {
        let row = sqlx::query("SELECT * FROM communities WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(community_from_row).transpose()
    }

    async fn find_community_by_normalized_name(
        &self,
        normalized: &str,
    ) -> StoreResult<Option<Community>> {
        let row = sqlx::query("SELECT * FROM communities WHERE normalized_name = $1")
            .bind(normalized)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(community_from_row).transpose()
    }

    async fn insert_community(&self, new: NewCommunity) -> StoreResult<Community> {
        let row = sqlx::query(
            r#"
            INSERT INTO communities
                (id, name, normalized_name, description, location, parent_community_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new.name.trim())
        .bind(normalize_name(&new.name))
        .bind(&new.description)
        .bind(&new.location)
        .bind(new.parent_community_id)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;
        community_from_row(&row)
    }

    async fn delete_community(&self, id: Uuid) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM communities WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn community_has_children(&self, id: Uuid) -> StoreResult<bool> {
        let row = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM communities WHERE parent_community_id = $1) AS present",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;
        row.try_get("present").map_err(map_sqlx)
    }

    async fn link_company_to_community(
        &self,
        community_id: Uuid,
        company_id: Uuid,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE communities
               SET company_ids = CASE
                     WHEN company_ids @> to_jsonb($2::uuid) THEN company_ids
                     ELSE company_ids || to_jsonb($2::uuid)
                   END
             WHERE id = $1
            "#,
        )
        .bind(community_id)
        .bind(company_id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn set_community_counts(
        &self,
        id: Uuid,
        total_plans: i64,
        total_quick_move_ins: i64,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE communities SET total_plans = $2, total_quick_move_ins = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(total_plans)
        .bind(total_quick_move_ins)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn list_segments(&self, community_id: Option<Uuid>) -> StoreResult<Vec<ProductSegment>> {
        let rows = match community_id {
            Some(id) => {
                sqlx::query(
                    "SELECT * FROM product_segments WHERE community_id = $1 \
                     ORDER BY display_order, name",
                )
                .bind(id)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM product_segments ORDER BY display_order, name")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(map_sqlx)?;
        rows.iter()
            .map(|r| segment_from_row(r).map_err(map_sqlx))
            .collect()
    }

    async fn find_segment(&self, id: Uuid) -> StoreResult<Option<ProductSegment>> {
        let row = sqlx::query("SELECT * FROM product_segments WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.map(|r| segment_from_row(&r).map_err(map_sqlx)).transpose()
    }

    async fn insert_segment(&self, new: NewSegment) -> StoreResult<ProductSegment> {
        let row = sqlx::query(
            r#"
            INSERT INTO product_segments (id, community_id, name, label, active, display_order)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new.community_id)
        .bind(&new.name)
        .bind(&new.label)
        .bind(new.active)
        .bind(new.display_order)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;
        segment_from_row(&row).map_err(map_sqlx)
    }

    async fn update_segment(&self, id: Uuid, update: SegmentUpdate) -> StoreResult<ProductSegment> {
        let current = self.find_segment(id).await?.ok_or(StoreError::NotFound)?;
        let row = sqlx::query(
            r#"
            UPDATE product_segments
               SET name = $2, label = $3, active = $4, display_order = $5
             WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(update.name.unwrap_or(current.name))
        .bind(update.label.unwrap_or(current.label))
        .bind(update.active.unwrap_or(current.active))
        .bind(update.display_order.unwrap_or(current.display_order))
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;
        segment_from_row(&row).map_err(map_sqlx)
    }

    async fn delete_segment(&self, id: Uuid) -> StoreResult<()> {
        // segment_companies go with it via ON DELETE CASCADE
        let result = sqlx::query("DELETE FROM product_segments WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn list_segment_companies(
        &self,
        segment_id: Option<Uuid>,
    ) -> StoreResult<Vec<SegmentCompany>> {
        let rows = match segment_id {
            Some(id) => {
                sqlx::query("SELECT * FROM segment_companies WHERE segment_id = $1 ORDER BY id")
                    .bind(id)
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                sqlx::query("SELECT * FROM segment_companies ORDER BY id")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(map_sqlx)?;
        rows.iter().map(segment_company_from_row).collect()
    }

    async fn find_segment_company(&self, id: Uuid) -> StoreResult<Option<SegmentCompany>> {
        let row = sqlx::query("SELECT * FROM segment_companies WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(segment_company_from_row).transpose()
    }

    async fn insert_segment_company(&self, new: NewSegmentCompany) -> StoreResult<SegmentCompany> {
        let row = sqlx::query(
            r#"
            INSERT INTO segment_companies
                (id, segment_id, company_id, role, source_community_id, key_type,
                 match_values, plan_names)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new.segment_id)
        .bind(new.company_id)
        .bind(enum_wire_string(&new.role)?)
        .bind(new.source_community_id)
        .bind(enum_wire_string(&new.key_type)?)
        .bind(serde_json::json!(new.values))
        .bind(new.plan_names.as_ref().map(|v| serde_json::json!(v)))
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;
        segment_company_from_row(&row)
    }

    async fn update_segment_company(
        &self,
        id: Uuid,
        update: SegmentCompanyUpdate,
    ) -> StoreResult<SegmentCompany> {
        let current = self
            .find_segment_company(id)
            .await?
            .ok_or(StoreError::NotFound)?;
        let role = update.role.unwrap_or(current.role);
        let key_type = update.key_type.unwrap_or(current.key_type);
        let source = update.source_community_id.or(current.source_community_id);
        let values = update.values.unwrap_or(current.values);
        let plan_names = update.plan_names.or(current.plan_names);
        let row = sqlx::query(
            r#"
            UPDATE segment_companies
               SET role = $2, source_community_id = $3, key_type = $4,
                   match_values = $5, plan_names = $6
             WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(enum_wire_string(&role)?)
        .bind(source)
        .bind(enum_wire_string(&key_type)?)
        .bind(serde_json::json!(values))
        .bind(plan_names.as_ref().map(|v| serde_json::json!(v)))
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;
        segment_company_from_row(&row)
    }

    async fn delete_segment_company(&self, id: Uuid) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM segment_companies WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn find_plan(&self, id: Uuid) -> StoreResult<Option<Plan>> {
        let row = sqlx::query("SELECT * FROM plans WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(plan_from_row).transpose()
    }

    async fn find_plan_by_key(&self, key: &PlanKey) -> StoreResult<Option<Plan>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM plans
             WHERE plan_name = $1 AND company_name = $2
               AND community_name = $3 AND plan_type = $4
            "#,
        )
        .bind(&key.plan_name)
        .bind(&key.company_name)
        .bind(&key.community_name)
        .bind(key.plan_type.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        row.as_ref().map(plan_from_row).transpose()
    }

    async fn insert_plan(&self, new: NewPlan) -> StoreResult<Plan> {
        let row = sqlx::query(
            r#"
            INSERT INTO plans
                (id, plan_name, plan_type, company_id, company_name,
                 community_id, community_name, price, sqft, stories,
                 price_per_sqft, beds, baths, address, design_number,
                 segment_id, last_updated)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                    $11, $12, $13, $14, $15, $16, $17)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&new.plan_name)
        .bind(new.plan_type.as_str())
        .bind(new.company.id)
        .bind(&new.company.name)
        .bind(new.community.id)
        .bind(&new.community.name)
        .bind(new.price)
        .bind(new.sqft)
        .bind(new.stories)
        .bind(new.price_per_sqft)
        .bind(new.beds)
        .bind(new.baths)
        .bind(&new.address)
        .bind(&new.design_number)
        .bind(new.segment_id)
        .bind(new.last_updated)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;
        plan_from_row(&row)
    }

    async fn update_plan(&self, id: Uuid, update: PlanUpdate) -> StoreResult<Plan> {
        let mut plan = self.find_plan(id).await?.ok_or(StoreError::NotFound)?;
        update.apply(&mut plan);
        let row = sqlx::query(
            r#"
            UPDATE plans
               SET plan_name = $2, company_id = $3, company_name = $4,
                   community_id = $5, community_name = $6, price = $7,
                   sqft = $8, stories = $9, price_per_sqft = $10, beds = $11,
                   baths = $12, address = $13, design_number = $14,
                   segment_id = $15, last_updated = $16
             WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&plan.plan_name)
        .bind(plan.company.id)
        .bind(&plan.company.name)
        .bind(plan.community.id)
        .bind(&plan.community.name)
        .bind(plan.price)
        .bind(plan.sqft)
        .bind(plan.stories)
        .bind(plan.price_per_sqft)
        .bind(plan.beds)
        .bind(plan.baths)
        .bind(&plan.address)
        .bind(&plan.design_number)
        .bind(plan.segment_id)
        .bind(plan.last_updated)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;
        plan_from_row(&row)
    }

    async fn list_plans(&self, community_id: Option<Uuid>) -> StoreResult<Vec<Plan>> {
        let rows = match community_id {
            Some(id) => {
                sqlx::query("SELECT * FROM plans WHERE community_id = $1 ORDER BY plan_name")
                    .bind(id)
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                sqlx::query("SELECT * FROM plans ORDER BY plan_name")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(map_sqlx)?;
        rows.iter().map(plan_from_row).collect()
    }

    async fn count_plans(&self, community_id: Uuid, plan_type: PlanType) -> StoreResult<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total FROM plans WHERE community_id = $1 AND plan_type = $2",
        )
        .bind(community_id)
        .bind(plan_type.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;
        row.try_get("total").map_err(map_sqlx)
    }

    async fn append_price_change(
        &self,
        plan_id: Uuid,
        old_price: f64,
        new_price: f64,
        changed_at: DateTime<Utc>,
    ) -> StoreResult<PriceChange> {
        let row = sqlx::query(
            r#"
            INSERT INTO price_history (id, plan_id, old_price, new_price, changed_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(plan_id)
        .bind(old_price)
        .bind(new_price)
        .bind(changed_at)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;
        price_change_from_row(&row).map_err(map_sqlx)
    }

    async fn price_history(&self, plan_id: Uuid) -> StoreResult<Vec<PriceChange>> {
        let rows = sqlx::query(
            "SELECT * FROM price_history WHERE plan_id = $1 ORDER BY changed_at DESC",
        )
        .bind(plan_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        rows.iter()
            .map(|r| price_change_from_row(r).map_err(map_sqlx))
            .collect()
    }

    async fn recently_changed_plan_ids(
        &self,
        since: DateTime<Utc>,
    ) -> StoreResult<HashSet<Uuid>> {
        let rows = sqlx::query("SELECT DISTINCT plan_id FROM price_history WHERE changed_at >= $1")
            .bind(since)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        let mut out = HashSet::with_capacity(rows.len());
        for row in rows {
            out.insert(row.try_get("plan_id").map_err(map_sqlx)?);
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Raw response archive
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ArchivedResponse {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Immutable, hash-addressed on-disk archive of raw provider responses. Every
/// response is written before parsing, so a parse failure always leaves the
/// offending text on disk for inspection.
#[derive(Debug, Clone)]
pub struct ResponseArchive {
    root: PathBuf,
}

impl ResponseArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    fn relative_path(captured_at: DateTime<Utc>, label: &str, content_hash: &str) -> PathBuf {
        let stamp = captured_at.format("%Y%m%d_%H%M%S").to_string();
        PathBuf::from(stamp)
            .join(slugify(label))
            .join(format!("{content_hash}.txt"))
    }

    /// Store response text immutably; identical bytes at the same path are a
    /// dedup hit, and a concurrent writer losing the rename race is treated
    /// the same way.
    pub async fn store_response(
        &self,
        captured_at: DateTime<Utc>,
        label: &str,
        text: &str,
    ) -> anyhow::Result<ArchivedResponse> {
        let bytes = text.as_bytes();
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = Self::relative_path(captured_at, label, &content_hash);
        let absolute_path = self.root.join(&relative_path);

        let parent = absolute_path
            .parent()
            .context("archive path missing parent")?;
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(ArchivedResponse {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp archive file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp archive file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp archive file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => {
                tracing::debug!(path = %absolute_path.display(), bytes = bytes.len(), "archived response");
                Ok(ArchivedResponse {
                    content_hash,
                    relative_path,
                    absolute_path,
                    byte_size: bytes.len(),
                    deduplicated: false,
                })
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(ArchivedResponse {
                    content_hash,
                    relative_path,
                    absolute_path,
                    byte_size: bytes.len(),
                    deduplicated: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!("renaming temp archive file into {}", absolute_path.display())
                })
            }
        }
    }
}

fn slugify(input: &str) -> String {
    input
        .trim()
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
    use tempfile::tempdir;

    fn snapshot(name: &str) -> CompanySnapshot {
        CompanySnapshot {
            id: Uuid::new_v4(),
            name: name.to_string(),
        }
    }

    fn new_plan(name: &str, company: &str, community: &str, price: f64) -> NewPlan {
        NewPlan {
            plan_name: name.to_string(),
            plan_type: PlanType::Plan,
            company: snapshot(company),
            community: CommunitySnapshot {
                id: Uuid::new_v4(),
                name: community.to_string(),
            },
            price,
            sqft: Some(2000.0),
            stories: None,
            price_per_sqft: None,
            beds: None,
            baths: None,
            address: None,
            design_number: None,
            segment_id: None,
            last_updated: Utc::now(),
        }
    }

    #[tokio::test]
    async fn company_normalized_name_collision_is_a_duplicate() {
        let store = MemoryStore::new();
        store
            .insert_company(NewCompany {
                name: "ABC Homes".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let err = store
            .insert_company(NewCompany {
                name: "  abc   HOMES ".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(err.is_duplicate());

        let found = store
            .find_company_by_normalized_name("abc homes")
            .await
            .unwrap()
            .expect("first insert survives");
        assert_eq!(found.name, "ABC Homes");
    }

    #[tokio::test]
    async fn plan_natural_key_is_unique() {
        let store = MemoryStore::new();
        store
            .insert_plan(new_plan("Caraway", "Highland Homes", "Elevon", 400_000.0))
            .await
            .unwrap();
        let err = store
            .insert_plan(new_plan("Caraway", "Highland Homes", "Elevon", 410_000.0))
            .await
            .unwrap_err();
        assert!(err.is_duplicate());
    }

    #[tokio::test]
    async fn deleting_a_segment_cascades_to_associations() {
        let store = MemoryStore::new();
        let community = store
            .insert_community(NewCommunity {
                name: "Elevon".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let company = store
            .insert_company(NewCompany {
                name: "Highland Homes".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let segment = store
            .insert_segment(NewSegment {
                community_id: community.id,
                name: "40s".into(),
                label: "40 ft lots".into(),
                active: true,
                display_order: 1,
            })
            .await
            .unwrap();
        store
            .insert_segment_company(NewSegmentCompany {
                segment_id: segment.id,
                company_id: company.id,
                role: SegmentRole::Primary,
                source_community_id: None,
                key_type: SegmentKeyType::PlanNames,
                values: vec!["Caraway".into()],
                plan_names: None,
            })
            .await
            .unwrap();

        store.delete_segment(segment.id).await.unwrap();
        let remaining = store.list_segment_companies(None).await.unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn recent_change_window_filters_by_timestamp() {
        let store = MemoryStore::new();
        let plan = store
            .insert_plan(new_plan("Caraway", "Highland Homes", "Elevon", 400_000.0))
            .await
            .unwrap();
        let now = Utc::now();
        store
            .append_price_change(plan.id, 400_000.0, 395_000.0, now - chrono::Duration::hours(48))
            .await
            .unwrap();
        let recent = store
            .recently_changed_plan_ids(now - chrono::Duration::hours(24))
            .await
            .unwrap();
        assert!(recent.is_empty());

        store
            .append_price_change(plan.id, 395_000.0, 390_000.0, now - chrono::Duration::hours(2))
            .await
            .unwrap();
        let recent = store
            .recently_changed_plan_ids(now - chrono::Duration::hours(24))
            .await
            .unwrap();
        assert!(recent.contains(&plan.id));
    }

    #[tokio::test]
    async fn archive_deduplicates_identical_responses() {
        let dir = tempdir().expect("tempdir");
        let archive = ResponseArchive::new(dir.path());
        let captured_at = DateTime::parse_from_rfc3339("2026-08-01T09:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = archive
            .store_response(captured_at, "Highland Homes/Elevon/now", "{\"plans\":[]}")
            .await
            .expect("first store");
        let second = archive
            .store_response(captured_at, "Highland Homes/Elevon/now", "{\"plans\":[]}")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.content_hash, second.content_hash);
        assert!(first.absolute_path.exists());
    }
}

//! Axum JSON API over the catalog store and the ingestion service.
//!
//! Handlers follow a validate, resolve-by-id, mutate, return-updated shape.
//! Malformed ids are rejected with 400 before any lookup; a missing row is
//! 404; a unique-index collision is 409. Mutating verbs pass through the
//! injected [`PermissionGate`].

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use chrono::{Duration as ChronoDuration, Utc};
use hpt_core::{derive_price_per_sqft, Plan, SegmentKeyType, SegmentRole};
use hpt_ingest::{IngestError, IngestService};
use hpt_storage::{
    CatalogStore, NewCompany, NewCommunity, NewSegment, NewSegmentCompany, PlanUpdate,
    SegmentCompanyUpdate, SegmentUpdate, StoreError,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use uuid::Uuid;

pub const CRATE_NAME: &str = "hpt-web";

const RECENT_WINDOW_HOURS: i64 = 24;

// ---------------------------------------------------------------------------
// Errors and permissions
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    Internal(anyhow::Error),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            ApiError::BadRequest(m)
            | ApiError::Forbidden(m)
            | ApiError::NotFound(m)
            | ApiError::Conflict(m) => m,
            ApiError::Internal(err) => {
                tracing::error!(error = %err, "request failed");
                "internal server error".to_string()
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => ApiError::NotFound("not found".to_string()),
            StoreError::Duplicate { constraint } => {
                ApiError::Conflict(format!("duplicate key on {constraint}"))
            }
            StoreError::Backend(inner) => ApiError::Internal(inner),
        }
    }
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::Validation(m) => ApiError::BadRequest(m),
            IngestError::ProviderUnavailable(m) => ApiError::Internal(anyhow::anyhow!(m)),
            IngestError::Store(inner) => ApiError::Internal(anyhow::anyhow!(inner)),
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Collaborator contract for the out-of-scope auth system. The API only ever
/// asks one question: may this request mutate the catalog.
pub trait PermissionGate: Send + Sync {
    fn require_editor(&self, headers: &HeaderMap) -> Result<(), ApiError>;
}

/// Bearer-token gate. With no token configured every request is an editor,
/// which is what tests and local development want.
pub struct TokenGate {
    token: Option<String>,
}

impl TokenGate {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }

    pub fn open() -> Self {
        Self { token: None }
    }

    pub fn from_env() -> Self {
        Self {
            token: std::env::var("HPT_EDITOR_TOKEN").ok(),
        }
    }
}

impl PermissionGate for TokenGate {
    fn require_editor(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        let Some(expected) = &self.token else {
            return Ok(());
        };
        let presented = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if presented == Some(expected.as_str()) {
            Ok(())
        } else {
            Err(ApiError::Forbidden("editor role required".to_string()))
        }
    }
}

// ---------------------------------------------------------------------------
// State and router
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn CatalogStore>,
    pub ingest: Arc<IngestService>,
    pub gate: Arc<dyn PermissionGate>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn CatalogStore>,
        ingest: Arc<IngestService>,
        gate: Arc<dyn PermissionGate>,
    ) -> Self {
        Self {
            store,
            ingest,
            gate,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/scrape", post(scrape_handler))
        .route("/companies", get(list_companies_handler).post(create_company_handler))
        .route("/companies/{id}", axum::routing::delete(delete_company_handler))
        .route(
            "/communities",
            get(list_communities_handler).post(create_community_handler),
        )
        .route("/communities/{id}", axum::routing::delete(delete_community_handler))
        .route(
            "/product-segments",
            get(list_segments_handler).post(create_segment_handler),
        )
        .route(
            "/product-segments/{id}",
            patch(update_segment_handler).delete(delete_segment_handler),
        )
        .route(
            "/segment-companies",
            get(list_segment_companies_handler).post(create_segment_company_handler),
        )
        .route(
            "/segment-companies/{id}",
            patch(update_segment_company_handler).delete(delete_segment_company_handler),
        )
        .route("/plans", get(list_plans_handler))
        .route("/plans/{id}", patch(update_plan_handler))
        .route("/plans/{id}/price-history", get(price_history_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env(state: AppState) -> anyhow::Result<()> {
    let port: u16 = std::env::var("HPT_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8080);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

fn parse_id(raw: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(raw).map_err(|_| ApiError::BadRequest(format!("malformed id: {raw}")))
}

fn required(value: Option<String>, field: &str) -> ApiResult<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::BadRequest(format!("{field} is required")))
}

// ---------------------------------------------------------------------------
// Ingestion
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ScrapeRequest {
    company: Option<String>,
    community: Option<String>,
}

async fn scrape_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ScrapeRequest>,
) -> ApiResult<Response> {
    let company = required(body.company, "company")?;
    let community = required(body.community, "community")?;
    let report = state.ingest.run(&company, &community).await?;
    Ok(Json(report).into_response())
}

// ---------------------------------------------------------------------------
// Companies
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateCompanyRequest {
    name: Option<String>,
    description: Option<String>,
    website: Option<String>,
    headquarters: Option<String>,
    founded_year: Option<i32>,
}

async fn list_companies_handler(State(state): State<Arc<AppState>>) -> ApiResult<Response> {
    let companies = state.store.list_companies().await?;
    Ok(Json(companies).into_response())
}

async fn create_company_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateCompanyRequest>,
) -> ApiResult<Response> {
    state.gate.require_editor(&headers)?;
    let name = required(body.name, "name")?;
    let company = state
        .store
        .insert_company(NewCompany {
            name,
            description: body.description,
            website: body.website,
            headquarters: body.headquarters,
            founded_year: body.founded_year,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(company)).into_response())
}

async fn delete_company_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Response> {
    state.gate.require_editor(&headers)?;
    let id = parse_id(&id)?;
    state.store.delete_company(id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

// ---------------------------------------------------------------------------
// Communities
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateCommunityRequest {
    name: Option<String>,
    description: Option<String>,
    location: Option<String>,
    parent_community_id: Option<Uuid>,
}

async fn list_communities_handler(State(state): State<Arc<AppState>>) -> ApiResult<Response> {
    let communities = state.store.list_communities().await?;
    Ok(Json(communities).into_response())
}

async fn create_community_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateCommunityRequest>,
) -> ApiResult<Response> {
    state.gate.require_editor(&headers)?;
    let name = required(body.name, "name")?;
    if let Some(parent_id) = body.parent_community_id {
        if state.store.find_community(parent_id).await?.is_none() {
            return Err(ApiError::NotFound(format!(
                "parent community {parent_id} not found"
            )));
        }
    }
    let community = state
        .store
        .insert_community(NewCommunity {
            name,
            description: body.description,
            location: body.location,
            parent_community_id: body.parent_community_id,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(community)).into_response())
}

async fn delete_community_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Response> {
    state.gate.require_editor(&headers)?;
    let id = parse_id(&id)?;
    if state.store.find_community(id).await?.is_none() {
        return Err(ApiError::NotFound("community not found".to_string()));
    }
    // a parent with sub-communities must be emptied first
    if state.store.community_has_children(id).await? {
        return Err(ApiError::BadRequest(
            "community has sub-communities; delete those first".to_string(),
        ));
    }
    state.store.delete_community(id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

// ---------------------------------------------------------------------------
// Product segments
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SegmentsQuery {
    community_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSegmentRequest {
    community_id: Option<Uuid>,
    name: Option<String>,
    label: Option<String>,
    active: Option<bool>,
    display_order: Option<i32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateSegmentRequest {
    name: Option<String>,
    label: Option<String>,
    active: Option<bool>,
    display_order: Option<i32>,
}

async fn list_segments_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SegmentsQuery>,
) -> ApiResult<Response> {
    let segments = state.store.list_segments(query.community_id).await?;
    Ok(Json(segments).into_response())
}

async fn create_segment_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateSegmentRequest>,
) -> ApiResult<Response> {
    state.gate.require_editor(&headers)?;
    let community_id = body
        .community_id
        .ok_or_else(|| ApiError::BadRequest("communityId is required".to_string()))?;
    let name = required(body.name, "name")?;
    if state.store.find_community(community_id).await?.is_none() {
        return Err(ApiError::NotFound("community not found".to_string()));
    }
    let segment = state
        .store
        .insert_segment(NewSegment {
            community_id,
            label: body.label.unwrap_or_else(|| name.clone()),
            name,
            active: body.active.unwrap_or(true),
            display_order: body.display_order.unwrap_or(0),
        })
        .await?;
    Ok((StatusCode::CREATED, Json(segment)).into_response())
}

async fn update_segment_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<String>,
    Json(body): Json<UpdateSegmentRequest>,
) -> ApiResult<Response> {
    state.gate.require_editor(&headers)?;
    let id = parse_id(&id)?;
    let segment = state
        .store
        .update_segment(
            id,
            SegmentUpdate {
                name: body.name,
                label: body.label,
                active: body.active,
                display_order: body.display_order,
            },
        )
        .await?;
    Ok(Json(segment).into_response())
}

async fn delete_segment_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Response> {
    state.gate.require_editor(&headers)?;
    let id = parse_id(&id)?;
    state.store.delete_segment(id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

// ---------------------------------------------------------------------------
// Segment/company associations
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SegmentCompaniesQuery {
    segment_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSegmentCompanyRequest {
    segment_id: Option<Uuid>,
    company_id: Option<Uuid>,
    role: Option<SegmentRole>,
    source_community_id: Option<Uuid>,
    key_type: Option<SegmentKeyType>,
    values: Option<Vec<String>>,
    plan_names: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateSegmentCompanyRequest {
    role: Option<SegmentRole>,
    source_community_id: Option<Uuid>,
    key_type: Option<SegmentKeyType>,
    values: Option<Vec<String>>,
    plan_names: Option<Vec<String>>,
}

async fn list_segment_companies_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SegmentCompaniesQuery>,
) -> ApiResult<Response> {
    let rows = state.store.list_segment_companies(query.segment_id).await?;
    Ok(Json(rows).into_response())
}

async fn create_segment_company_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateSegmentCompanyRequest>,
) -> ApiResult<Response> {
    state.gate.require_editor(&headers)?;
    let segment_id = body
        .segment_id
        .ok_or_else(|| ApiError::BadRequest("segmentId is required".to_string()))?;
    let company_id = body
        .company_id
        .ok_or_else(|| ApiError::BadRequest("companyId is required".to_string()))?;
    if state.store.find_segment(segment_id).await?.is_none() {
        return Err(ApiError::NotFound("segment not found".to_string()));
    }
    if state.store.find_company(company_id).await?.is_none() {
        return Err(ApiError::NotFound("company not found".to_string()));
    }
    let row = state
        .store
        .insert_segment_company(NewSegmentCompany {
            segment_id,
            company_id,
            role: body.role.unwrap_or(SegmentRole::Competitor),
            source_community_id: body.source_community_id,
            key_type: body.key_type.unwrap_or(SegmentKeyType::PlanNames),
            values: body.values.unwrap_or_default(),
            plan_names: body.plan_names,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(row)).into_response())
}

async fn update_segment_company_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<String>,
    Json(body): Json<UpdateSegmentCompanyRequest>,
) -> ApiResult<Response> {
    state.gate.require_editor(&headers)?;
    let id = parse_id(&id)?;
    let row = state
        .store
        .update_segment_company(
            id,
            SegmentCompanyUpdate {
                role: body.role,
                source_community_id: body.source_community_id,
                key_type: body.key_type,
                values: body.values,
                plan_names: body.plan_names,
            },
        )
        .await?;
    Ok(Json(row).into_response())
}

async fn delete_segment_company_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Response> {
    state.gate.require_editor(&headers)?;
    let id = parse_id(&id)?;
    state.store.delete_segment_company(id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

// ---------------------------------------------------------------------------
// Plans
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlansQuery {
    community_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdatePlanRequest {
    price: Option<f64>,
    sqft: Option<f64>,
    stories: Option<f64>,
    price_per_sqft: Option<f64>,
    beds: Option<f64>,
    baths: Option<f64>,
    address: Option<String>,
    design_number: Option<String>,
    segment_id: Option<Uuid>,
}

async fn list_plans_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PlansQuery>,
) -> ApiResult<Response> {
    let plans = state.store.list_plans(query.community_id).await?;
    let plans = with_recent_flags(&*state.store, plans).await?;
    Ok(Json(plans).into_response())
}

/// Recomputes `price_changed_recently` from the audit log instead of trusting
/// a stored flag that would otherwise never decay.
async fn with_recent_flags(store: &dyn CatalogStore, mut plans: Vec<Plan>) -> ApiResult<Vec<Plan>> {
    let since = Utc::now() - ChronoDuration::hours(RECENT_WINDOW_HOURS);
    let recent = store.recently_changed_plan_ids(since).await?;
    for plan in &mut plans {
        plan.price_changed_recently = recent.contains(&plan.id);
    }
    Ok(plans)
}

async fn update_plan_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<String>,
    Json(body): Json<UpdatePlanRequest>,
) -> ApiResult<Response> {
    state.gate.require_editor(&headers)?;
    let id = parse_id(&id)?;
    let existing = state
        .store
        .find_plan(id)
        .await?
        .ok_or_else(|| ApiError::NotFound("plan not found".to_string()))?;

    // validate the whole request before touching the append-only audit log
    if let Some(new_price) = body.price {
        if new_price <= 0.0 {
            return Err(ApiError::BadRequest("price must be positive".to_string()));
        }
    }
    if let Some(segment_id) = body.segment_id {
        if state.store.find_segment(segment_id).await?.is_none() {
            return Err(ApiError::NotFound("segment not found".to_string()));
        }
    }

    let now = Utc::now();
    let mut price_changed = false;
    if let Some(new_price) = body.price {
        if (new_price - existing.price).abs() > f64::EPSILON {
            state
                .store
                .append_price_change(id, existing.price, new_price, now)
                .await?;
            price_changed = true;
        }
    }

    // re-derive when the inputs moved but no explicit value was supplied
    let price_per_sqft = body.price_per_sqft.or_else(|| {
        if body.price.is_some() || body.sqft.is_some() {
            let price = body.price.unwrap_or(existing.price);
            let sqft = body.sqft.or(existing.sqft)?;
            derive_price_per_sqft(price, sqft)
        } else {
            None
        }
    });

    let mut updated = state
        .store
        .update_plan(
            id,
            PlanUpdate {
                price: body.price,
                sqft: body.sqft,
                stories: body.stories,
                price_per_sqft,
                beds: body.beds,
                baths: body.baths,
                address: body.address,
                design_number: body.design_number,
                segment_id: body.segment_id,
                company: None,
                community: None,
                last_updated: Some(now),
            },
        )
        .await?;

    let since = now - ChronoDuration::hours(RECENT_WINDOW_HOURS);
    updated.price_changed_recently =
        price_changed || state.store.recently_changed_plan_ids(since).await?.contains(&id);
    Ok(Json(updated).into_response())
}

async fn price_history_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Response> {
    let id = parse_id(&id)?;
    if state.store.find_plan(id).await?.is_none() {
        return Err(ApiError::NotFound("plan not found".to_string()));
    }
    let history = state.store.price_history(id).await?;
    Ok(Json(history).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use hpt_provider::StaticProvider;
    use hpt_storage::MemoryStore;
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn test_state(provider: StaticProvider, gate: TokenGate) -> AppState {
        let store: Arc<dyn CatalogStore> = Arc::new(MemoryStore::new());
        let ingest = Arc::new(IngestService::new(store.clone(), Arc::new(provider)));
        AppState::new(store, ingest, Arc::new(gate))
    }

    fn open_app() -> Router {
        app(test_state(
            StaticProvider::with_responses(r#"{"plans": []}"#, r#"{"plans": []}"#),
            TokenGate::open(),
        ))
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        send_with_auth(app, method, uri, body, None).await
    }

    async fn send_with_auth(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
        bearer: Option<&str>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = bearer {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = match body {
            Some(value) => builder
                .header("content-type", "application/json")
                .body(Body::from(value.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn scrape_requires_company_and_community() {
        let app = open_app();
        let (status, body) =
            send(&app, "POST", "/scrape", Some(json!({"company": "Highland Homes"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("community"));
    }

    #[tokio::test]
    async fn scrape_returns_an_aggregate_report() {
        let now = r#"{"plans": [{"plan_name": "QMI 321", "price": 455000, "address": "321 Ln"}]}"#;
        let plan = r#"{"plans": [{"plan_name": "Caraway", "price": 400000}]}"#;
        let app = app(test_state(
            StaticProvider::with_responses(now, plan),
            TokenGate::open(),
        ));
        let (status, body) = send(
            &app,
            "POST",
            "/scrape",
            Some(json!({"company": "Highland Homes", "community": "Elevon"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], json!(true));
        assert_eq!(body["saved"], json!(2));
        assert_eq!(body["breakdown"]["now"]["saved"], json!(1));
        assert_eq!(body["breakdown"]["plan"]["saved"], json!(1));
    }

    #[tokio::test]
    async fn scrape_total_provider_failure_is_500() {
        let provider = StaticProvider {
            now_response: Some(Err("upstream down".to_string())),
            plan_response: Some(Err("upstream down".to_string())),
        };
        let app = app(test_state(provider, TokenGate::open()));
        let (status, _) = send(
            &app,
            "POST",
            "/scrape",
            Some(json!({"company": "Highland Homes", "community": "Elevon"})),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn company_create_list_and_duplicate() {
        let app = open_app();
        let (status, created) = send(
            &app,
            "POST",
            "/companies",
            Some(json!({"name": "Highland Homes", "website": "https://example.com"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["name"], json!("Highland Homes"));

        let (status, _) = send(
            &app,
            "POST",
            "/companies",
            Some(json!({"name": "  highland   homes "})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, listed) = send(&app, "GET", "/companies", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn malformed_id_is_400_before_lookup() {
        let app = open_app();
        let (status, body) = send(&app, "DELETE", "/companies/not-a-uuid", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("malformed id"));

        let (status, _) = send(
            &app,
            "DELETE",
            &format!("/companies/{}", Uuid::new_v4()),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn editor_gate_blocks_unauthenticated_mutations() {
        let app = app(test_state(
            StaticProvider::default(),
            TokenGate::new(Some("sekrit".to_string())),
        ));
        let (status, _) = send(
            &app,
            "POST",
            "/companies",
            Some(json!({"name": "Highland Homes"})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        // reads stay open
        let (status, _) = send(&app, "GET", "/companies", None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send_with_auth(
            &app,
            "POST",
            "/companies",
            Some(json!({"name": "Highland Homes"})),
            Some("sekrit"),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    #[tokio::test]
    async fn community_with_children_cannot_be_deleted() {
        let app = open_app();
        let (_, parent) = send(
            &app,
            "POST",
            "/communities",
            Some(json!({"name": "Elevon"})),
        )
        .await;
        let parent_id = parent["id"].as_str().unwrap().to_string();
        let (status, _) = send(
            &app,
            "POST",
            "/communities",
            Some(json!({"name": "Elevon North", "parentCommunityId": parent_id})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = send(&app, "DELETE", &format!("/communities/{parent_id}"), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("sub-communities"));
    }

    #[tokio::test]
    async fn segment_create_requires_an_existing_community() {
        let app = open_app();
        let (status, _) = send(
            &app,
            "POST",
            "/product-segments",
            Some(json!({"communityId": Uuid::new_v4(), "name": "45s"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn segment_crud_and_cascade() {
        let app = open_app();
        let (_, community) = send(
            &app,
            "POST",
            "/communities",
            Some(json!({"name": "Elevon"})),
        )
        .await;
        let community_id = community["id"].as_str().unwrap().to_string();
        let (_, company) = send(
            &app,
            "POST",
            "/companies",
            Some(json!({"name": "Highland Homes"})),
        )
        .await;
        let company_id = company["id"].as_str().unwrap().to_string();

        let (status, segment) = send(
            &app,
            "POST",
            "/product-segments",
            Some(json!({"communityId": community_id, "name": "45s", "label": "45' lots"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let segment_id = segment["id"].as_str().unwrap().to_string();

        // same (community, name) pair is rejected
        let (status, _) = send(
            &app,
            "POST",
            "/product-segments",
            Some(json!({"communityId": community_id, "name": "45s"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, updated) = send(
            &app,
            "PATCH",
            &format!("/product-segments/{segment_id}"),
            Some(json!({"active": false})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["active"], json!(false));

        let (status, association) = send(
            &app,
            "POST",
            "/segment-companies",
            Some(json!({
                "segmentId": segment_id,
                "companyId": company_id,
                "role": "primary",
                "keyType": "Plan_Names",
                "values": ["Caraway", "Dakota"]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(association["role"], json!("primary"));

        let (status, patched) = send(
            &app,
            "PATCH",
            &format!("/segment-companies/{}", association["id"].as_str().unwrap()),
            Some(json!({"role": "competitor", "keyType": "Series_Name", "values": ["Classic"]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(patched["role"], json!("competitor"));
        assert_eq!(patched["key_type"], json!("Series_Name"));

        let (status, _) = send(&app, "DELETE", &format!("/product-segments/{segment_id}"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, rows) = send(&app, "GET", "/segment-companies", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(rows.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn plan_patch_reuses_the_price_change_rule() {
        let plan = r#"{"plans": [{"plan_name": "Caraway", "price": 400000, "sqft": 2000}]}"#;
        let state = test_state(
            StaticProvider::with_responses(r#"{"plans": []}"#, plan),
            TokenGate::open(),
        );
        let app = app(state);

        send(
            &app,
            "POST",
            "/scrape",
            Some(json!({"company": "Highland Homes", "community": "Elevon"})),
        )
        .await;

        let (status, plans) = send(&app, "GET", "/plans", None).await;
        assert_eq!(status, StatusCode::OK);
        let plan_id = plans[0]["id"].as_str().unwrap().to_string();
        assert_eq!(plans[0]["price_changed_recently"], json!(false));

        let (status, updated) = send(
            &app,
            "PATCH",
            &format!("/plans/{plan_id}"),
            Some(json!({"price": 395000.0})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["price"], json!(395000.0));
        assert_eq!(updated["price_changed_recently"], json!(true));
        // derived from the new price and stored sqft
        assert_eq!(updated["price_per_sqft"], json!(197.5));

        let (status, history) = send(&app, "GET", &format!("/plans/{plan_id}/price-history"), None).await;
        assert_eq!(status, StatusCode::OK);
        let history = history.as_array().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0]["old_price"], json!(400000.0));
        assert_eq!(history[0]["new_price"], json!(395000.0));

        // unchanged price adds nothing to the log
        let (status, _) = send(
            &app,
            "PATCH",
            &format!("/plans/{plan_id}"),
            Some(json!({"price": 395000.0})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (_, history) = send(&app, "GET", &format!("/plans/{plan_id}/price-history"), None).await;
        assert_eq!(history.as_array().unwrap().len(), 1);

        // the recomputed flag shows up on the list endpoint too
        let (_, plans) = send(&app, "GET", "/plans", None).await;
        assert_eq!(plans[0]["price_changed_recently"], json!(true));
    }

    #[tokio::test]
    async fn rejected_plan_patch_leaves_the_audit_log_untouched() {
        let plan = r#"{"plans": [{"plan_name": "Caraway", "price": 400000}]}"#;
        let app = app(test_state(
            StaticProvider::with_responses(r#"{"plans": []}"#, plan),
            TokenGate::open(),
        ));
        send(
            &app,
            "POST",
            "/scrape",
            Some(json!({"company": "Highland Homes", "community": "Elevon"})),
        )
        .await;
        let (_, plans) = send(&app, "GET", "/plans", None).await;
        let plan_id = plans[0]["id"].as_str().unwrap().to_string();

        // valid price change paired with an unknown segment must fail whole
        let (status, _) = send(
            &app,
            "PATCH",
            &format!("/plans/{plan_id}"),
            Some(json!({"price": 395000.0, "segmentId": Uuid::new_v4()})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, plans) = send(&app, "GET", "/plans", None).await;
        assert_eq!(plans[0]["price"], json!(400000.0));
        let (_, history) = send(&app, "GET", &format!("/plans/{plan_id}/price-history"), None).await;
        assert!(history.as_array().unwrap().is_empty());

        // the retry without the bad segment records exactly one change
        let (status, _) = send(
            &app,
            "PATCH",
            &format!("/plans/{plan_id}"),
            Some(json!({"price": 395000.0})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (_, history) = send(&app, "GET", &format!("/plans/{plan_id}/price-history"), None).await;
        assert_eq!(history.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn plans_filter_by_community() {
        let plan = r#"{"plans": [{"plan_name": "Caraway", "price": 400000}]}"#;
        let app = app(test_state(
            StaticProvider::with_responses(r#"{"plans": []}"#, plan),
            TokenGate::open(),
        ));
        send(
            &app,
            "POST",
            "/scrape",
            Some(json!({"company": "Highland Homes", "community": "Elevon"})),
        )
        .await;

        let (_, communities) = send(&app, "GET", "/communities", None).await;
        let community_id = communities[0]["id"].as_str().unwrap();
        let (status, plans) = send(
            &app,
            "GET",
            &format!("/plans?communityId={community_id}"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(plans.as_array().unwrap().len(), 1);

        let (status, plans) = send(
            &app,
            "GET",
            &format!("/plans?communityId={}", Uuid::new_v4()),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(plans.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn price_history_for_unknown_plan_is_404() {
        let app = open_app();
        let (status, _) = send(
            &app,
            "GET",
            &format!("/plans/{}/price-history", Uuid::new_v4()),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}

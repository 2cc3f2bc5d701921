//! Core domain model for the home-plan catalog.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "hpt-core";

/// Listing flavor an ingested record belongs to: a buildable floor plan or a
/// quick-move-in home available now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanType {
    Plan,
    Now,
}

impl PlanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanType::Plan => "plan",
            PlanType::Now => "now",
        }
    }

    pub fn from_str_opt(value: &str) -> Option<Self> {
        match value {
            "plan" => Some(PlanType::Plan),
            "now" => Some(PlanType::Now),
            _ => None,
        }
    }
}

impl std::fmt::Display for PlanType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to a company or community as it arrives from upstream: either a
/// bare name or a partially populated `{_id, name}` object. Resolved to a
/// canonical snapshot at the resolver boundary; nothing downstream should see
/// this type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CompanyRef {
    Name(String),
    Ref(EntityRef),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRef {
    #[serde(default, alias = "_id")]
    pub id: Option<Uuid>,
    pub name: String,
}

impl CompanyRef {
    pub fn display_name(&self) -> &str {
        match self {
            CompanyRef::Name(name) => name,
            CompanyRef::Ref(entity) => &entity.name,
        }
    }
}

/// Denormalized copy of an entity's display fields, embedded into each plan
/// at write time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanySnapshot {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunitySnapshot {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Company {
    pub id: Uuid,
    pub name: String,
    pub normalized_name: String,
    pub description: Option<String>,
    pub website: Option<String>,
    pub headquarters: Option<String>,
    pub founded_year: Option<i32>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Community {
    pub id: Uuid,
    pub name: String,
    pub normalized_name: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub total_plans: i64,
    pub total_quick_move_ins: i64,
    pub company_ids: Vec<Uuid>,
    pub parent_community_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// A community's product-line subdivision (e.g. differing lot widths), unique
/// by name within its community.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductSegment {
    pub id: Uuid,
    pub community_id: Uuid,
    pub name: String,
    pub label: String,
    pub active: bool,
    pub display_order: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentRole {
    Primary,
    Competitor,
    CrossCommunityComp,
}

/// How a segment/company association names the competing plans it covers:
/// an explicit list of plan names, or series-name prefixes with an optional
/// explicit override list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentKeyType {
    #[serde(rename = "Plan_Names")]
    PlanNames,
    #[serde(rename = "Series_Name")]
    SeriesName,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentCompany {
    pub id: Uuid,
    pub segment_id: Uuid,
    pub company_id: Uuid,
    pub role: SegmentRole,
    pub source_community_id: Option<Uuid>,
    pub key_type: SegmentKeyType,
    pub values: Vec<String>,
    pub plan_names: Option<Vec<String>>,
}

/// Natural key that identifies "the same" plan across repeated ingestions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlanKey {
    pub plan_name: String,
    pub company_name: String,
    pub community_name: String,
    pub plan_type: PlanType,
}

impl PlanKey {
    pub fn new(
        plan_name: impl Into<String>,
        company_name: impl Into<String>,
        community_name: impl Into<String>,
        plan_type: PlanType,
    ) -> Self {
        Self {
            plan_name: plan_name.into(),
            company_name: company_name.into(),
            community_name: community_name.into(),
            plan_type,
        }
    }
}

/// Canonical persisted plan. Company and community are embedded snapshots,
/// refreshed on every upsert; `price_changed_recently` is recomputed at read
/// time by joining against the price-change log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
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
    #[serde(default)]
    pub price_changed_recently: bool,
    pub last_updated: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Plan {
    pub fn key(&self) -> PlanKey {
        PlanKey::new(
            self.plan_name.clone(),
            self.company.name.clone(),
            self.community.name.clone(),
            self.plan_type,
        )
    }
}

/// One row of the append-only price audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceChange {
    pub id: Uuid,
    pub plan_id: Uuid,
    pub old_price: f64,
    pub new_price: f64,
    pub changed_at: DateTime<Utc>,
}

/// Pre-validation candidate record as parsed from the search provider's
/// response. Everything is optional here; the reconciler enforces required
/// fields per item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidatePlan {
    #[serde(default)]
    pub plan_name: Option<String>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub price: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub sqft: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub stories: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub price_per_sqft: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub beds: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub baths: Option<f64>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub design_number: Option<String>,
    #[serde(default)]
    pub company: Option<CompanyRef>,
    #[serde(default)]
    pub community: Option<CompanyRef>,
}

/// Lookup key for company/community uniqueness: trimmed, lowercased, interior
/// whitespace collapsed.
pub fn normalize_name(input: &str) -> String {
    input
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Derived `price_per_sqft` when the provider omits it.
pub fn derive_price_per_sqft(price: f64, sqft: f64) -> Option<f64> {
    if sqft > 0.0 {
        Some(round2(price / sqft))
    } else {
        None
    }
}

/// Accepts a JSON number, a numeric string (commas and currency symbols
/// stripped), or null. AI-sourced payloads are inconsistent about which they
/// send.
fn de_opt_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => {
            let cleaned: String = s
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
                .collect();
            cleaned.parse::<f64>().ok()
        }
        Some(_) => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_name_trims_lowercases_and_collapses() {
        assert_eq!(normalize_name("  ABC   Homes "), "abc homes");
        assert_eq!(normalize_name("Elevon"), "elevon");
        assert_eq!(normalize_name("  Elevon  "), "elevon");
    }

    #[test]
    fn price_per_sqft_rounds_to_two_decimals() {
        assert_eq!(derive_price_per_sqft(300_000.0, 2_000.0), Some(150.0));
        assert_eq!(derive_price_per_sqft(299_999.0, 2_000.0), Some(150.0));
        assert_eq!(derive_price_per_sqft(100_000.0, 3_000.0), Some(33.33));
        assert_eq!(derive_price_per_sqft(400_000.0, 0.0), None);
    }

    #[test]
    fn company_ref_accepts_string_or_object() {
        let named: CompanyRef = serde_json::from_str(r#""Highland Homes""#).unwrap();
        assert_eq!(named.display_name(), "Highland Homes");

        let referenced: CompanyRef = serde_json::from_str(
            r#"{"_id":"7f4df2a9-5be1-4f14-9d29-1f2d58c0a111","name":"Highland Homes"}"#,
        )
        .unwrap();
        assert_eq!(referenced.display_name(), "Highland Homes");
        match referenced {
            CompanyRef::Ref(entity) => assert!(entity.id.is_some()),
            CompanyRef::Name(_) => panic!("expected ref form"),
        }
    }

    #[test]
    fn plan_type_serializes_to_wire_strings() {
        assert_eq!(serde_json::to_string(&PlanType::Now).unwrap(), r#""now""#);
        assert_eq!(serde_json::to_string(&PlanType::Plan).unwrap(), r#""plan""#);
        assert_eq!(PlanType::from_str_opt("now"), Some(PlanType::Now));
        assert_eq!(PlanType::from_str_opt("bogus"), None);
    }

    #[test]
    fn candidate_accepts_numeric_strings_for_price() {
        let candidate: CandidatePlan = serde_json::from_str(
            r#"{"plan_name":"Caraway","price":"$450,990","sqft":2100}"#,
        )
        .unwrap();
        assert_eq!(candidate.price, Some(450_990.0));
        assert_eq!(candidate.sqft, Some(2100.0));
    }

    #[test]
    fn segment_key_type_uses_wire_discriminators() {
        assert_eq!(
            serde_json::to_string(&SegmentKeyType::PlanNames).unwrap(),
            r#""Plan_Names""#
        );
        assert_eq!(
            serde_json::to_string(&SegmentKeyType::SeriesName).unwrap(),
            r#""Series_Name""#
        );
    }
}

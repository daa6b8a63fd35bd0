//! Core domain model for the AnchorSafe <-> SimPro sync pipeline.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "anchorsafe-core";

/// Custom field on a SimPro asset that names the building a location lives in.
pub const BUILDING_FIELD_NAME: &str = "Building Name / Number";

/// Stable remote identity used for de-duplication and local correlation.
pub trait HasIdentity {
    fn identity(&self) -> i64;
}

/// Keeps the first occurrence of every identity, preserving input order.
pub fn dedup_by_identity<T: HasIdentity>(items: Vec<T>) -> Vec<T> {
    let mut seen = HashSet::with_capacity(items.len());
    items
        .into_iter()
        .filter(|item| seen.insert(item.identity()))
        .collect()
}

/// On-disk cache document for a single resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CacheContainer<T> {
    #[serde(with = "timestamp")]
    pub last_updated: DateTime<Utc>,
    #[serde(
        default = "Vec::new",
        deserialize_with = "null_as_default",
        bound(deserialize = "T: Deserialize<'de>")
    )]
    pub items: Vec<T>,
}

impl<T> CacheContainer<T> {
    pub fn new(last_updated: DateTime<Utc>, items: Vec<T>) -> Self {
        Self {
            last_updated,
            items,
        }
    }
}

/// Freshness stamp only; lets callers read `LastUpdated` without typing the items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CacheStamp {
    #[serde(deserialize_with = "timestamp::deserialize")]
    pub last_updated: DateTime<Utc>,
}

/// Timestamps are written as RFC 3339. Older cache files carry offset-less
/// local timestamps, which are read as UTC.
pub mod timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| de::Error::custom(format!("invalid timestamp `{raw}`")))
    }

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        let raw = raw.trim();
        if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
            return Some(parsed.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| naive.and_utc())
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Remote collections fetched from SimPro.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Jobs,
    Customers,
    Employees,
    Sites,
    Assets,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 5] = [
        ResourceKind::Jobs,
        ResourceKind::Customers,
        ResourceKind::Employees,
        ResourceKind::Sites,
        ResourceKind::Assets,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ResourceKind::Jobs => "jobs",
            ResourceKind::Customers => "customers",
            ResourceKind::Employees => "employees",
            ResourceKind::Sites => "sites",
            ResourceKind::Assets => "assets",
        }
    }

    pub fn cache_file_name(self) -> String {
        format!("{}_data.json", self.name())
    }

    /// Resolves a `get` selector (`all`, a resource name, or `clients`).
    pub fn select(get: &str) -> Option<Vec<Self>> {
        match get.trim().to_ascii_lowercase().as_str() {
            "" | "all" => Some(Self::ALL.to_vec()),
            "jobs" => Some(vec![ResourceKind::Jobs]),
            "customers" | "clients" => Some(vec![ResourceKind::Customers]),
            "employees" => Some(vec![ResourceKind::Employees]),
            "sites" => Some(vec![ResourceKind::Sites]),
            "assets" => Some(vec![ResourceKind::Assets]),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Local tables populated by reconciliation, in dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Clients,
    Sites,
    Locations,
    Inspections,
}

impl EntityKind {
    /// Parents before children: sites look up clients, locations look up
    /// sites, inspections look up both.
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Clients,
        EntityKind::Sites,
        EntityKind::Locations,
        EntityKind::Inspections,
    ];

    pub fn name(self) -> &'static str {
        match self {
            EntityKind::Clients => "clients",
            EntityKind::Sites => "sites",
            EntityKind::Locations => "locations",
            EntityKind::Inspections => "inspections",
        }
    }

    pub fn source(self) -> ResourceKind {
        match self {
            EntityKind::Clients => ResourceKind::Customers,
            EntityKind::Sites => ResourceKind::Sites,
            EntityKind::Locations => ResourceKind::Assets,
            EntityKind::Inspections => ResourceKind::Jobs,
        }
    }

    pub fn select(get: &str) -> Option<Vec<Self>> {
        match get.trim().to_ascii_lowercase().as_str() {
            "" | "all" => Some(Self::ALL.to_vec()),
            "clients" => Some(vec![EntityKind::Clients]),
            "sites" => Some(vec![EntityKind::Sites]),
            "locations" => Some(vec![EntityKind::Locations]),
            "inspections" => Some(vec![EntityKind::Inspections]),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// SimPro job stage as reported on job list items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStage {
    Pending,
    Progress,
    Complete,
    Invoiced,
    Archived,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown job stage `{0}`")]
pub struct UnknownJobStage(pub String);

impl JobStage {
    /// Description of the matching row in the local `inspection_status` table.
    pub fn status_description(self) -> &'static str {
        match self {
            JobStage::Pending => "Unassigned",
            JobStage::Progress => "In Progress",
            JobStage::Complete => "Completed",
            JobStage::Invoiced => "Invoiced",
            JobStage::Archived => "Archived",
        }
    }
}

impl FromStr for JobStage {
    type Err = UnknownJobStage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(JobStage::Pending),
            "Progress" => Ok(JobStage::Progress),
            "Complete" => Ok(JobStage::Complete),
            "Invoiced" => Ok(JobStage::Invoiced),
            "Archived" => Ok(JobStage::Archived),
            other => Err(UnknownJobStage(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SimpleRef {
    #[serde(rename = "ID")]
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SimpleCustomer {
    #[serde(rename = "ID")]
    pub id: i64,
    #[serde(default)]
    pub company_name: Option<String>,
}

/// Customers list rows carry the same columns as the embedded customer refs.
pub type CustomerListItem = SimpleCustomer;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Address {
    #[serde(rename = "Address", default)]
    pub street_address: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SiteListItem {
    #[serde(rename = "ID")]
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub address: Option<Address>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub customers: Vec<SimpleCustomer>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub archived: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CustomField {
    #[serde(rename = "ID", default)]
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub r#type: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub list_items: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub is_mandatory: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CustomFieldItem {
    #[serde(default, deserialize_with = "null_as_default")]
    pub custom_field: CustomField,
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AssetListItem {
    #[serde(rename = "ID")]
    pub id: i64,
    #[serde(default)]
    pub asset_type: Option<SimpleRef>,
    #[serde(default)]
    pub site: Option<SimpleRef>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub custom_fields: Vec<CustomFieldItem>,
}

impl AssetListItem {
    /// Value of the first custom field called `name` that carries a non-empty value.
    pub fn custom_field_value(&self, name: &str) -> Option<&str> {
        self.custom_fields
            .iter()
            .filter(|item| item.custom_field.name.as_deref() == Some(name))
            .find_map(|item| item.value.as_deref().filter(|v| !v.is_empty()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JobListItem {
    #[serde(rename = "ID")]
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "Type", default)]
    pub job_type: Option<String>,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub customer: Option<SimpleCustomer>,
    #[serde(default)]
    pub site: Option<SimpleRef>,
    #[serde(default)]
    pub completed_date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EmployeeListItem {
    #[serde(rename = "ID")]
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub position: Option<String>,
}

macro_rules! impl_identity {
    ($($ty:ty),* $(,)?) => {
        $(
            impl HasIdentity for $ty {
                fn identity(&self) -> i64 {
                    self.id
                }
            }
        )*
    };
}

impl_identity!(SimpleCustomer, SiteListItem, AssetListItem, JobListItem, EmployeeListItem);

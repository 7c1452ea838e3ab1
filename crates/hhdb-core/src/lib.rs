//! Core record types and listing API wire model for HHDB.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "hhdb-core";

/// One page of the listing endpoint response.
///
/// A body without an `items` key is treated the same as an empty page.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ListingPage {
    #[serde(default)]
    pub items: Vec<ListingItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingItem {
    #[serde(deserialize_with = "deserialize_source_id")]
    pub id: i64,
    pub employer: ListingEmployer,
    pub name: String,
    #[serde(default)]
    pub salary: Option<SalaryRange>,
    pub alternate_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingEmployer {
    #[serde(deserialize_with = "deserialize_source_id")]
    pub id: i64,
    pub name: String,
}

/// Salary bounds as published by the listing API. Either side may be missing.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SalaryRange {
    #[serde(default)]
    pub from: Option<f64>,
    #[serde(default)]
    pub to: Option<f64>,
}

/// A vacancy shaped for persistence. Created once per listing item, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VacancyRecord {
    pub vacancy_id: i64,
    pub company_id: i64,
    pub title: String,
    pub salary: Option<f64>,
    pub vacancy_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyRecord {
    pub company_id: i64,
    pub title: String,
}

impl VacancyRecord {
    pub fn from_item(item: &ListingItem) -> Self {
        Self {
            vacancy_id: item.id,
            company_id: item.employer.id,
            title: item.name.clone(),
            salary: estimate_salary(item.salary.as_ref()),
            vacancy_url: item.alternate_url.clone(),
        }
    }
}

impl CompanyRecord {
    pub fn from_item(item: &ListingItem) -> Self {
        Self {
            company_id: item.employer.id,
            title: item.employer.name.clone(),
        }
    }
}

/// Collapse a salary range into a single point estimate.
///
/// Both bounds known gives their mean, one bound gives that bound, otherwise
/// `None`. A bound of zero is the API's "not disclosed" marker and counts as unknown.
pub fn estimate_salary(range: Option<&SalaryRange>) -> Option<f64> {
    let range = range?;
    let known = |bound: Option<f64>| bound.filter(|v| *v != 0.0);
    match (known(range.from), known(range.to)) {
        (Some(from), Some(to)) => Some((from + to) / 2.0),
        (Some(bound), None) | (None, Some(bound)) => Some(bound),
        (None, None) => None,
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawSourceId {
    Int(i64),
    Text(String),
}

// Ids arrive as digit strings; plain integers are accepted too.
fn deserialize_source_id<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    match RawSourceId::deserialize(deserializer)? {
        RawSourceId::Int(value) => Ok(value),
        RawSourceId::Text(text) => text
            .trim()
            .parse()
            .map_err(|_| de::Error::custom(format!("invalid source id {text:?}"))),
    }
}

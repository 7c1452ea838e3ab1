//! Listing source contracts and the per-employer vacancy fetch loop.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use hhdb_core::{CompanyRecord, ListingItem, ListingPage, VacancyRecord};
use hhdb_http::{FetchError, HttpClientConfig, HttpFetcher};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "hhdb-fetcher";

pub const DEFAULT_API_URL: &str = "https://api.hh.ru/vacancies";
pub const DEFAULT_USER_AGENT: &str = "HH-User-Agent";
pub const DEFAULT_EMPLOYER_IDS: [i64; 10] =
    [2180, 673, 84585, 3529, 1740, 15478, 588914, 49357, 9352463, 3776];
pub const MAX_PER_PAGE: u32 = 2;

#[derive(Debug, Clone, PartialEq)]
pub struct FetcherConfig {
    pub api_url: String,
    pub user_agent: String,
    pub employer_ids: Vec<i64>,
    pub per_page: u32,
    pub http_timeout_secs: u64,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            employer_ids: DEFAULT_EMPLOYER_IDS.to_vec(),
            per_page: MAX_PER_PAGE,
            http_timeout_secs: 20,
        }
    }
}

impl FetcherConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let employer_ids = match std::env::var("HH_EMPLOYER_IDS") {
            Ok(raw) => parse_employer_ids(&raw).context("parsing HH_EMPLOYER_IDS")?,
            Err(_) => defaults.employer_ids,
        };
        Ok(Self {
            api_url: std::env::var("HH_API_URL").unwrap_or(defaults.api_url),
            user_agent: std::env::var("HH_USER_AGENT").unwrap_or(defaults.user_agent),
            employer_ids,
            per_page: parse_env_or("HH_PER_PAGE", defaults.per_page)?,
            http_timeout_secs: parse_env_or("HH_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs)?,
        })
    }

    /// Page size actually sent to the endpoint.
    pub fn effective_per_page(&self) -> u32 {
        self.per_page.clamp(1, MAX_PER_PAGE)
    }
}

fn parse_env_or<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().with_context(|| format!("parsing {key}={raw:?}")),
        Err(_) => Ok(default),
    }
}

pub fn parse_employer_ids(raw: &str) -> Result<Vec<i64>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<i64>().with_context(|| format!("invalid employer id {s:?}")))
        .collect()
}

#[derive(Debug, Error)]
pub enum FetcherError {
    #[error("listing for employer {employer_id} could not be read")]
    Listing {
        employer_id: i64,
        #[source]
        source: FetchError,
    },
}

#[async_trait]
pub trait ListingSource: Send + Sync {
    async fn fetch_page(&self, employer_id: i64, per_page: u32) -> Result<ListingPage, FetchError>;
}

/// The public HeadHunter vacancies endpoint.
#[derive(Debug, Clone)]
pub struct HeadHunterSource {
    http: HttpFetcher,
    api_url: String,
}

impl HeadHunterSource {
    pub fn new(config: &FetcherConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;
        Ok(Self {
            http,
            api_url: config.api_url.clone(),
        })
    }
}

#[async_trait]
impl ListingSource for HeadHunterSource {
    async fn fetch_page(&self, employer_id: i64, per_page: u32) -> Result<ListingPage, FetchError> {
        let query = [
            ("employer_id", employer_id.to_string()),
            ("per_page", per_page.to_string()),
            ("page", "0".to_string()),
        ];
        self.http.get_json(&self.api_url, &query).await
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchSummary {
    pub employers_requested: usize,
    pub employers_failed: usize,
    /// Employer whose empty page ended the loop, if any.
    pub stopped_early_at: Option<i64>,
}

pub struct ListingFetcher<S> {
    source: S,
    employer_ids: Vec<i64>,
    per_page: u32,
    vacancies: Vec<VacancyRecord>,
    companies: BTreeMap<i64, CompanyRecord>,
}

impl ListingFetcher<HeadHunterSource> {
    pub fn from_config(config: &FetcherConfig) -> Result<Self> {
        Ok(Self::new(
            HeadHunterSource::new(config)?,
            config.employer_ids.clone(),
            config.effective_per_page(),
        ))
    }
}

impl<S: ListingSource> ListingFetcher<S> {
    pub fn new(source: S, employer_ids: Vec<i64>, per_page: u32) -> Self {
        Self {
            source,
            employer_ids,
            per_page: per_page.clamp(1, MAX_PER_PAGE),
            vacancies: Vec::new(),
            companies: BTreeMap::new(),
        }
    }

    /// Query every configured employer in order and accumulate records.
    ///
    /// Transport failures skip the employer. An empty page stops the whole loop,
    /// so employers after it are never requested. A body that cannot be decoded
    /// is returned as an error; records gathered before it are kept.
    pub async fn load(&mut self) -> Result<FetchSummary, FetcherError> {
        let mut summary = FetchSummary::default();
        let employer_ids = self.employer_ids.clone();

        for employer_id in employer_ids {
            summary.employers_requested += 1;
            debug!(employer_id, per_page = self.per_page, "requesting listing page");

            let page = self
                .source
                .fetch_page(employer_id, self.per_page)
                .instrument(info_span!("listing_fetch", employer_id))
                .await;

            let page = match page {
                Ok(page) => page,
                Err(err) if err.is_transport() => {
                    warn!(employer_id, error = %err, "listing request failed; skipping employer");
                    summary.employers_failed += 1;
                    continue;
                }
                Err(source) => return Err(FetcherError::Listing { employer_id, source }),
            };

            if page.items.is_empty() {
                info!(employer_id, "empty listing page; stopping fetch");
                summary.stopped_early_at = Some(employer_id);
                break;
            }

            self.absorb(&page.items);
        }

        info!(
            vacancies = self.vacancies.len(),
            companies = self.companies.len(),
            requested = summary.employers_requested,
            failed = summary.employers_failed,
            "listing fetch finished"
        );
        Ok(summary)
    }

    fn absorb(&mut self, items: &[ListingItem]) {
        self.vacancies.extend(items.iter().map(VacancyRecord::from_item));

        // Only the first item names the company for the whole batch.
        if let Some(first) = items.first() {
            self.companies
                .entry(first.employer.id)
                .or_insert_with(|| CompanyRecord::from_item(first));
        }
    }

    pub fn vacancies(&self) -> &[VacancyRecord] {
        &self.vacancies
    }

    /// Distinct companies in ascending id order.
    pub fn companies(&self) -> Vec<CompanyRecord> {
        self.companies.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hhdb_core::{ListingEmployer, SalaryRange};
    use std::collections::HashMap;
    use std::sync::Mutex;

    enum Scripted {
        Page(ListingPage),
        Unavailable,
        Garbage,
    }

    struct ScriptedSource {
        pages: HashMap<i64, Scripted>,
        calls: Mutex<Vec<(i64, u32)>>,
    }

    impl ScriptedSource {
        fn new(pages: Vec<(i64, Scripted)>) -> Self {
            Self {
                pages: pages.into_iter().collect(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn called_employers(&self) -> Vec<i64> {
            self.calls.lock().unwrap().iter().map(|(id, _)| *id).collect()
        }
    }

    #[async_trait]
    impl ListingSource for ScriptedSource {
        async fn fetch_page(&self, employer_id: i64, per_page: u32) -> Result<ListingPage, FetchError> {
            self.calls.lock().unwrap().push((employer_id, per_page));
            match self.pages.get(&employer_id) {
                Some(Scripted::Page(page)) => Ok(page.clone()),
                Some(Scripted::Unavailable) | None => Err(FetchError::HttpStatus {
                    status: 503,
                    url: format!("test://{employer_id}"),
                }),
                Some(Scripted::Garbage) => Err(FetchError::Decode {
                    url: format!("test://{employer_id}"),
                    source: serde_json::from_str::<ListingPage>("<html>").unwrap_err(),
                }),
            }
        }
    }

    fn item(id: i64, employer_id: i64, employer: &str, title: &str, salary: Option<SalaryRange>) -> ListingItem {
        ListingItem {
            id,
            employer: ListingEmployer {
                id: employer_id,
                name: employer.to_string(),
            },
            name: title.to_string(),
            salary,
            alternate_url: format!("https://hh.ru/vacancy/{id}"),
        }
    }

    fn page(items: Vec<ListingItem>) -> Scripted {
        Scripted::Page(ListingPage { items })
    }

    fn salary(from: Option<f64>, to: Option<f64>) -> Option<SalaryRange> {
        Some(SalaryRange { from, to })
    }

    #[tokio::test]
    async fn empty_page_stops_the_whole_loop() {
        let source = ScriptedSource::new(vec![
            (1, page(vec![item(10, 1, "Alpha", "Rust Developer", None)])),
            (2, page(vec![])),
            (3, page(vec![item(30, 3, "Gamma", "Python Developer", None)])),
        ]);
        let mut fetcher = ListingFetcher::new(source, vec![1, 2, 3], 2);

        let summary = fetcher.load().await.expect("load");

        assert_eq!(summary.stopped_early_at, Some(2));
        assert_eq!(summary.employers_requested, 2);
        assert_eq!(fetcher.source.called_employers(), vec![1, 2]);
        assert_eq!(fetcher.vacancies().len(), 1);
        assert!(fetcher.companies().iter().all(|c| c.company_id != 3));
    }

    #[tokio::test]
    async fn transport_failure_skips_only_that_employer() {
        let source = ScriptedSource::new(vec![
            (1, page(vec![item(10, 1, "Alpha", "Rust Developer", None)])),
            (2, Scripted::Unavailable),
            (3, page(vec![item(30, 3, "Gamma", "Python Developer", None)])),
        ]);
        let mut fetcher = ListingFetcher::new(source, vec![1, 2, 3], 2);

        let summary = fetcher.load().await.expect("load");

        assert_eq!(summary.employers_failed, 1);
        assert_eq!(summary.stopped_early_at, None);
        assert_eq!(fetcher.source.called_employers(), vec![1, 2, 3]);
        let ids: Vec<i64> = fetcher.vacancies().iter().map(|v| v.vacancy_id).collect();
        assert_eq!(ids, vec![10, 30]);
    }

    #[tokio::test]
    async fn undecodable_body_is_fatal_but_keeps_partial_results() {
        let source = ScriptedSource::new(vec![
            (1, page(vec![item(10, 1, "Alpha", "Rust Developer", None)])),
            (2, Scripted::Garbage),
            (3, page(vec![item(30, 3, "Gamma", "Python Developer", None)])),
        ]);
        let mut fetcher = ListingFetcher::new(source, vec![1, 2, 3], 2);

        let err = fetcher.load().await.unwrap_err();

        assert!(matches!(err, FetcherError::Listing { employer_id: 2, .. }));
        assert_eq!(fetcher.vacancies().len(), 1);
        assert_eq!(fetcher.companies().len(), 1);
    }

    #[tokio::test]
    async fn company_comes_from_first_item_and_first_write_wins() {
        let source = ScriptedSource::new(vec![
            (
                1,
                page(vec![
                    item(10, 7, "Seven Labs", "Rust Developer", None),
                    item(11, 8, "Other Name", "QA Engineer", None),
                ]),
            ),
            (2, page(vec![item(20, 7, "Seven Labs Renamed", "Go Developer", None)])),
        ]);
        let mut fetcher = ListingFetcher::new(source, vec![1, 2], 2);

        fetcher.load().await.expect("load");

        assert_eq!(
            fetcher.companies(),
            vec![CompanyRecord {
                company_id: 7,
                title: "Seven Labs".into()
            }]
        );
        assert_eq!(fetcher.vacancies().len(), 3);
    }

    #[tokio::test]
    async fn salaries_follow_the_estimate_rule() {
        let source = ScriptedSource::new(vec![
            (1, page(vec![item(10, 1, "Alpha", "Rust Developer", salary(Some(100.0), Some(200.0)))])),
            (2, page(vec![item(20, 2, "Beta", "Java Engineer", salary(None, None))])),
        ]);
        let mut fetcher = ListingFetcher::new(source, vec![1, 2], 2);

        fetcher.load().await.expect("load");

        let salaries: Vec<Option<f64>> = fetcher.vacancies().iter().map(|v| v.salary).collect();
        assert_eq!(salaries, vec![Some(150.0), None]);
    }

    #[tokio::test]
    async fn page_size_is_capped() {
        let source = ScriptedSource::new(vec![(1, page(vec![item(10, 1, "Alpha", "Rust", None)]))]);
        let mut fetcher = ListingFetcher::new(source, vec![1], 50);

        fetcher.load().await.expect("load");

        assert_eq!(*fetcher.source.calls.lock().unwrap(), vec![(1, MAX_PER_PAGE)]);
    }

    #[test]
    fn employer_id_list_parsing() {
        assert_eq!(parse_employer_ids("2180, 673,,84585").unwrap(), vec![2180, 673, 84585]);
        assert!(parse_employer_ids("2180,abc").is_err());
    }

    #[test]
    fn effective_per_page_never_exceeds_cap() {
        let config = FetcherConfig {
            per_page: 10,
            ..FetcherConfig::default()
        };
        assert_eq!(config.effective_per_page(), 2);
        let config = FetcherConfig {
            per_page: 0,
            ..FetcherConfig::default()
        };
        assert_eq!(config.effective_per_page(), 1);
    }
}

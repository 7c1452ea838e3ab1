//! PostgreSQL report store: schema setup, bulk load and the fixed report queries.

use anyhow::{Context, Result};
use hhdb_core::{CompanyRecord, VacancyRecord};
use serde::Serialize;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{Connection, Executor, PgConnection, PgPool, Postgres};
use thiserror::Error;
use tracing::{info, info_span, Instrument};

pub const CRATE_NAME: &str = "hhdb-store";

pub const DEFAULT_DATABASE_NAME: &str = "hh";

const CREATE_COMPANIES: &str = r#"
CREATE TABLE companies (
    company_id BIGINT PRIMARY KEY,
    title VARCHAR(255) NOT NULL
)
"#;

const CREATE_VACANCIES: &str = r#"
CREATE TABLE vacancies (
    vacancy_id BIGINT PRIMARY KEY,
    company_id BIGINT NOT NULL REFERENCES companies(company_id),
    title VARCHAR(255) NOT NULL,
    salary DOUBLE PRECISION,
    vacancy_url TEXT NOT NULL
)
"#;

const INSERT_COMPANY: &str = r#"
INSERT INTO companies (company_id, title)
VALUES ($1, $2)
ON CONFLICT (company_id) DO NOTHING
"#;

const INSERT_VACANCY: &str = r#"
INSERT INTO vacancies (vacancy_id, company_id, title, salary, vacancy_url)
VALUES ($1, $2, $3, $4, $5)
"#;

const COMPANY_VACANCY_COUNTS: &str = r#"
SELECT c.title AS company,
       COUNT(v.vacancy_id) AS vacancy_count
  FROM companies c
  LEFT JOIN vacancies v ON c.company_id = v.company_id
 GROUP BY c.title
"#;

const ALL_VACANCIES: &str = r#"
SELECT c.title AS company,
       v.title AS vacancy,
       v.salary,
       v.vacancy_url
  FROM vacancies v
  LEFT JOIN companies c ON v.company_id = c.company_id
"#;

const AVERAGE_SALARY: &str = "SELECT AVG(salary) AS average_salary FROM vacancies";

const VACANCIES_ABOVE_AVERAGE: &str = r#"
SELECT c.title AS company,
       v.title AS vacancy,
       v.salary,
       v.vacancy_url
  FROM vacancies v
  LEFT JOIN companies c ON v.company_id = c.company_id
 WHERE v.salary > (SELECT AVG(salary) FROM vacancies)
"#;

const VACANCIES_MATCHING_KEYWORD: &str = r#"
SELECT c.title AS company,
       v.title AS vacancy,
       v.salary,
       v.vacancy_url
  FROM vacancies v
  LEFT JOIN companies c ON v.company_id = c.company_id
 WHERE v.title ILIKE '%' || $1 || '%'
"#;

/// Server address and credentials. The database name is supplied per call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    /// Database used to issue `DROP DATABASE` / `CREATE DATABASE`.
    pub maintenance_db: String,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: None,
            maintenance_db: "postgres".to_string(),
        }
    }
}

impl ConnectionParams {
    pub fn from_env() -> Result<Self> {
        Self::from_env_with_prefix("")
    }

    /// Reads `{prefix}PGHOST`, `{prefix}PGPORT`, `{prefix}PGUSER`,
    /// `{prefix}PGPASSWORD` and `HH_MAINTENANCE_DB`.
    pub fn from_env_with_prefix(prefix: &str) -> Result<Self> {
        let defaults = Self::default();
        let var = |name: &str| std::env::var(format!("{prefix}{name}")).ok();
        let port = match var("PGPORT") {
            Some(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("parsing {prefix}PGPORT={raw:?}"))?,
            None => defaults.port,
        };
        Ok(Self {
            host: var("PGHOST").unwrap_or(defaults.host),
            port,
            user: var("PGUSER").unwrap_or(defaults.user),
            password: var("PGPASSWORD").filter(|p| !p.is_empty()),
            maintenance_db: std::env::var("HH_MAINTENANCE_DB").unwrap_or(defaults.maintenance_db),
        })
    }

    pub fn connect_options(&self, database: &str) -> PgConnectOptions {
        let options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .database(database);
        match &self.password {
            Some(password) => options.password(password),
            None => options,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub database_name: String,
    pub connection: ConnectionParams,
}

impl StoreConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_name: std::env::var("HH_DATABASE_NAME")
                .unwrap_or_else(|_| DEFAULT_DATABASE_NAME.to_string()),
            connection: ConnectionParams::from_env()?,
        })
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connecting to database {database}")]
    Connect {
        database: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("initializing schema of database {database}")]
    Schema {
        database: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("loading {record}")]
    Load {
        record: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("running report query {query}")]
    Query {
        query: &'static str,
        #[source]
        source: sqlx::Error,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub companies_inserted: u64,
    pub vacancies_inserted: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct CompanyVacancyCount {
    pub company: String,
    pub vacancy_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct VacancyListing {
    pub company: String,
    pub vacancy: String,
    pub salary: Option<f64>,
    pub vacancy_url: String,
}

/// Quote `name` as a PostgreSQL identifier.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Escape LIKE metacharacters so `keyword` matches as a literal substring.
pub fn escape_like(keyword: &str) -> String {
    let mut out = String::with_capacity(keyword.len());
    for ch in keyword.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

// template0 lets UTF8 be chosen even when template1 was initialized as SQL_ASCII.
fn create_database_sql(ident: &str) -> String {
    format!("CREATE DATABASE {ident} TEMPLATE template0 ENCODING 'UTF8'")
}

async fn connect(database: &str, params: &ConnectionParams) -> Result<PgConnection, StoreError> {
    PgConnection::connect_with(&params.connect_options(database))
        .await
        .map_err(|source| StoreError::Connect {
            database: database.to_string(),
            source,
        })
}

/// Drop and recreate `database_name`, then create the `companies` and
/// `vacancies` tables. Anything previously stored under that name is lost.
pub async fn initialize_schema(database_name: &str, params: &ConnectionParams) -> Result<(), StoreError> {
    let schema_err = |source| StoreError::Schema {
        database: database_name.to_string(),
        source,
    };

    let mut admin = connect(&params.maintenance_db, params).await?;
    let ident = quote_identifier(database_name);
    admin
        .execute(format!("DROP DATABASE IF EXISTS {ident}").as_str())
        .await
        .map_err(schema_err)?;
    admin
        .execute(create_database_sql(&ident).as_str())
        .await
        .map_err(schema_err)?;
    admin.close().await.map_err(schema_err)?;
    info!(database = database_name, "database recreated");

    let mut conn = connect(database_name, params).await?;
    for statement in [CREATE_COMPANIES, CREATE_VACANCIES] {
        conn.execute(statement).await.map_err(schema_err)?;
    }
    conn.close().await.map_err(schema_err)?;
    Ok(())
}

/// Insert all companies, then all vacancies, in a single transaction.
///
/// Duplicate company ids are ignored. A duplicate vacancy id or a vacancy whose
/// company is missing fails the load and nothing is committed.
pub async fn load(
    vacancies: &[VacancyRecord],
    companies: &[CompanyRecord],
    database_name: &str,
    params: &ConnectionParams,
) -> Result<LoadSummary, StoreError> {
    let mut conn = connect(database_name, params).await?;
    let mut tx = conn.begin().await.map_err(|source| StoreError::Load {
        record: "transaction".to_string(),
        source,
    })?;
    let mut summary = LoadSummary::default();

    for company in companies {
        let done = sqlx::query(INSERT_COMPANY)
            .bind(company.company_id)
            .bind(&company.title)
            .execute(&mut *tx)
            .await
            .map_err(|source| StoreError::Load {
                record: format!("company {}", company.company_id),
                source,
            })?;
        summary.companies_inserted += done.rows_affected();
    }

    for vacancy in vacancies {
        let done = sqlx::query(INSERT_VACANCY)
            .bind(vacancy.vacancy_id)
            .bind(vacancy.company_id)
            .bind(&vacancy.title)
            .bind(vacancy.salary)
            .bind(&vacancy.vacancy_url)
            .execute(&mut *tx)
            .await
            .map_err(|source| StoreError::Load {
                record: format!("vacancy {}", vacancy.vacancy_id),
                source,
            })?;
        summary.vacancies_inserted += done.rows_affected();
    }

    tx.commit().await.map_err(|source| StoreError::Load {
        record: "transaction commit".to_string(),
        source,
    })?;
    conn.close().await.map_err(|source| StoreError::Load {
        record: "connection close".to_string(),
        source,
    })?;

    info!(
        database = database_name,
        companies = summary.companies_inserted,
        vacancies = summary.vacancies_inserted,
        "records loaded"
    );
    Ok(summary)
}

/// Read side of the store.
///
/// Every query checks one connection out of the pool for the duration of a
/// single statement; the `PoolConnection` guard hands it back on every exit path.
#[derive(Debug, Clone)]
pub struct ReportStore {
    pool: PgPool,
}

impl ReportStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_name: &str, params: &ConnectionParams) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect_with(params.connect_options(database_name))
            .await
            .map_err(|source| StoreError::Connect {
                database: database_name.to_string(),
                source,
            })?;
        Ok(Self::new(pool))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn acquire(&self, query: &'static str) -> Result<PoolConnection<Postgres>, StoreError> {
        self.pool
            .acquire()
            .await
            .map_err(|source| StoreError::Query { query, source })
    }

    /// Every company with its vacancy count, grouped by company title. Unordered.
    pub async fn companies_with_vacancy_counts(&self) -> Result<Vec<CompanyVacancyCount>, StoreError> {
        const NAME: &str = "companies_with_vacancy_counts";
        async {
            let mut conn = self.acquire(NAME).await?;
            sqlx::query_as::<_, CompanyVacancyCount>(COMPANY_VACANCY_COUNTS)
                .fetch_all(&mut *conn)
                .await
                .map_err(|source| StoreError::Query { query: NAME, source })
        }
        .instrument(info_span!("report_query", query = NAME))
        .await
    }

    pub async fn all_vacancies(&self) -> Result<Vec<VacancyListing>, StoreError> {
        self.fetch_listings("all_vacancies", ALL_VACANCIES, None).await
    }

    /// Mean of the known salaries, `None` when no vacancy carries one.
    pub async fn average_salary(&self) -> Result<Option<f64>, StoreError> {
        const NAME: &str = "average_salary";
        async {
            let mut conn = self.acquire(NAME).await?;
            sqlx::query_scalar::<_, Option<f64>>(AVERAGE_SALARY)
                .fetch_one(&mut *conn)
                .await
                .map_err(|source| StoreError::Query { query: NAME, source })
        }
        .instrument(info_span!("report_query", query = NAME))
        .await
    }

    pub async fn vacancies_above_average_salary(&self) -> Result<Vec<VacancyListing>, StoreError> {
        self.fetch_listings("vacancies_above_average_salary", VACANCIES_ABOVE_AVERAGE, None)
            .await
    }

    /// Vacancies whose title contains `keyword`, ignoring case. The keyword is
    /// used as given; an empty one matches every vacancy.
    pub async fn vacancies_matching_keyword(&self, keyword: &str) -> Result<Vec<VacancyListing>, StoreError> {
        self.fetch_listings(
            "vacancies_matching_keyword",
            VACANCIES_MATCHING_KEYWORD,
            Some(escape_like(keyword)),
        )
        .await
    }

    async fn fetch_listings(
        &self,
        name: &'static str,
        sql: &'static str,
        pattern: Option<String>,
    ) -> Result<Vec<VacancyListing>, StoreError> {
        async {
            let mut conn = self.acquire(name).await?;
            let mut query = sqlx::query_as::<_, VacancyListing>(sql);
            if let Some(pattern) = pattern {
                query = query.bind(pattern);
            }
            query
                .fetch_all(&mut *conn)
                .await
                .map_err(|source| StoreError::Query { query: name, source })
        }
        .instrument(info_span!("report_query", query = name))
        .await
    }
}

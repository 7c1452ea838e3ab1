use std::fmt::Write as _;

use anyhow::{Context, Result};
use clap::builder::NonEmptyStringValueParser;
use clap::{Args, Parser, Subcommand};
use hhdb_fetcher::{FetcherConfig, ListingFetcher};
use hhdb_store::{initialize_schema, load, CompanyVacancyCount, ReportStore, StoreConfig, VacancyListing};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_KEYWORD: &str = "python";

#[derive(Debug, Parser)]
#[command(name = "hhdb-cli")]
#[command(about = "Fetch HeadHunter vacancies into PostgreSQL and print reports")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch listings, rebuild the database and print the reports
    Run(ReportArgs),
    /// Print the reports from the already loaded database
    Report(ReportArgs),
}

#[derive(Debug, Args)]
struct ReportArgs {
    /// Word searched for in vacancy titles
    #[arg(long, default_value = DEFAULT_KEYWORD, value_parser = NonEmptyStringValueParser::new())]
    keyword: String,
}

impl Default for ReportArgs {
    fn default() -> Self {
        Self {
            keyword: DEFAULT_KEYWORD.to_string(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let store_config = StoreConfig::from_env().context("loading database configuration")?;

    match cli.command.unwrap_or_else(|| Commands::Run(ReportArgs::default())) {
        Commands::Run(args) => {
            let fetcher_config = FetcherConfig::from_env().context("loading listing configuration")?;
            refresh(&fetcher_config, &store_config).await?;
            print_reports(&store_config, &args.keyword).await?;
        }
        Commands::Report(args) => {
            print_reports(&store_config, &args.keyword).await?;
        }
    }

    Ok(())
}

async fn refresh(fetcher_config: &FetcherConfig, store_config: &StoreConfig) -> Result<()> {
    let mut fetcher = ListingFetcher::from_config(fetcher_config)?;
    let summary = fetcher.load().await.context("fetching vacancy listings")?;
    if let Some(employer_id) = summary.stopped_early_at {
        info!(employer_id, "fetch stopped at an empty page");
    }

    let database = &store_config.database_name;
    initialize_schema(database, &store_config.connection)
        .await
        .with_context(|| format!("initializing database {database}"))?;
    load(
        fetcher.vacancies(),
        &fetcher.companies(),
        database,
        &store_config.connection,
    )
    .await
    .with_context(|| format!("loading records into {database}"))?;
    Ok(())
}

async fn print_reports(store_config: &StoreConfig, keyword: &str) -> Result<()> {
    let store = ReportStore::connect(&store_config.database_name, &store_config.connection).await?;

    let counts = store.companies_with_vacancy_counts().await?;
    println!("{}", render_counts("Companies and the number of vacancies at each:", &counts));

    let all = store.all_vacancies().await?;
    println!(
        "{}",
        render_listings(
            "All vacancies with company name, vacancy title, salary and link:",
            &all
        )
    );

    let average = store.average_salary().await?;
    println!("Average salary across vacancies: {}", render_salary(average));

    let above = store.vacancies_above_average_salary().await?;
    println!(
        "{}",
        render_listings("Vacancies with salary above the average:", &above)
    );

    let matching = store.vacancies_matching_keyword(keyword).await?;
    println!(
        "{}",
        render_listings(
            &format!("Vacancies whose title contains \"{keyword}\":"),
            &matching
        )
    );

    store.close().await;
    Ok(())
}

fn render_salary(salary: Option<f64>) -> String {
    match salary {
        Some(value) => format!("{value:.2}"),
        None => "not specified".to_string(),
    }
}

fn render_counts(label: &str, rows: &[CompanyVacancyCount]) -> String {
    let mut out = label.to_string();
    for row in rows {
        let _ = write!(out, "\n  {}: {}", row.company, row.vacancy_count);
    }
    out
}

fn render_listings(label: &str, rows: &[VacancyListing]) -> String {
    let mut out = label.to_string();
    if rows.is_empty() {
        out.push_str("\n  (none)");
    }
    for row in rows {
        let _ = write!(
            out,
            "\n  {} | {} | {} | {}",
            row.company,
            row.vacancy,
            render_salary(row.salary),
            row.vacancy_url
        );
    }
    out
}

//! Market Explorer — scheduled ticker enrichment pipeline.
//!
//! Entry point. Loads configuration and credentials, initialises
//! structured logging, wires one rate-limited client per dependency, and
//! runs a single analyse → persist pass over the configured tickers.
//!
//! Exit codes: 0 when the records were persisted (even if some tickers
//! failed), 1 on persistence failure, 2 on configuration failure.

use chrono::{NaiveDate, Utc};
use clap::Parser;
use secrecy::ExposeSecret;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use market_explorer::config::{self, AppConfig, Credentials, LlmProvider};
use market_explorer::data::fmp::FmpClient;
use market_explorer::data::search::CustomSearchClient;
use market_explorer::engine::{PipelineOrchestrator, RunReport, RunSettings, SynthesisEngine};
use market_explorer::llm::anthropic::AnthropicClient;
use market_explorer::llm::openai::OpenAiClient;
use market_explorer::llm::LanguageModel;
use market_explorer::net::RateLimitedClient;
use market_explorer::storage::sheets::ServiceAccountKey;
use market_explorer::storage::{GoogleSheetsStore, MemorySheetStore, SheetSink, SheetStore};
use market_explorer::types::PipelineError;

#[derive(Debug, Parser)]
#[command(name = "market-explorer", version, about = "Enrich a ticker list with market data, news and an LLM assessment")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "config.toml")]
    config: String,

    /// Date the records are keyed under (YYYY-MM-DD). Defaults to today, UTC.
    #[arg(long)]
    run_date: Option<NaiveDate>,

    /// Write to an in-memory sheet and print the rows instead of updating
    /// Google Sheets.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let args = Args::parse();
    init_logging();

    match run(&args).await {
        Ok(report) => {
            info!(%report, "Market Explorer finished");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, exit_code = e.exit_code(), "Run aborted");
            ExitCode::from(e.exit_code())
        }
    }
}

fn setup_error(e: anyhow::Error) -> PipelineError {
    PipelineError::ConfigurationFailed(format!("{e:#}"))
}

async fn run(args: &Args) -> Result<RunReport, PipelineError> {
    let cfg = AppConfig::load(&args.config).map_err(setup_error)?;
    cfg.validate()?;
    let tickers = cfg.resolve_tickers()?;
    let creds = Credentials::from_env(&cfg, !args.dry_run)?;
    let run_date = args.run_date.unwrap_or_else(|| Utc::now().date_naive());

    info!(
        config = %args.config,
        %run_date,
        tickers = tickers.len(),
        provider = ?cfg.llm.provider,
        dry_run = args.dry_run,
        "Market Explorer starting up"
    );

    // -- Rate-limited clients, one per dependency ---------------------------

    let policy = cfg.retry.policy();
    let fmp_client = Arc::new(RateLimitedClient::new(
        "fmp",
        config::min_interval(cfg.market_data.min_interval_ms),
        policy.clone(),
    ));
    let search_client = Arc::new(RateLimitedClient::new(
        "google-cse",
        config::min_interval(cfg.search.min_interval_ms),
        policy.clone(),
    ));
    let llm_client = Arc::new(RateLimitedClient::new(
        "llm",
        config::min_interval(cfg.llm.min_interval_ms),
        policy.clone(),
    ));
    let sheets_client = Arc::new(RateLimitedClient::new(
        "google-sheets",
        config::min_interval(cfg.sheet.min_interval_ms),
        policy,
    ));
    let clients = [
        fmp_client.clone(),
        search_client.clone(),
        llm_client.clone(),
        sheets_client.clone(),
    ];

    // -- Sources ------------------------------------------------------------

    let market = Arc::new(
        FmpClient::new(
            cfg.market_data.base_url.as_str(),
            creds.fmp_key,
            Duration::from_secs(cfg.market_data.timeout_secs),
            fmp_client,
        )
        .map_err(setup_error)?,
    );

    let search = Arc::new(
        CustomSearchClient::new(
            cfg.search.endpoint.as_str(),
            creds.cse_key,
            creds.cse_id.as_str(),
            cfg.search.top_k,
            Duration::from_secs(cfg.search.timeout_secs),
            search_client,
        )
        .map_err(setup_error)?,
    );

    // -- Language model -----------------------------------------------------

    let llm_timeout = Duration::from_secs(cfg.llm.timeout_secs);
    let model: Arc<dyn LanguageModel> = match cfg.llm.provider {
        LlmProvider::OpenAi => {
            let mut client = OpenAiClient::new(
                creds.llm_key,
                cfg.llm.model.clone(),
                cfg.llm.max_tokens,
                llm_timeout,
                llm_client,
            )
            .map_err(setup_error)?
            .with_temperature(cfg.llm.temperature);
            if let Some(url) = &cfg.llm.url {
                client = client.with_url(url.as_str());
            }
            info!(model = client.model_name(), "Using OpenAI provider");
            Arc::new(client)
        }
        LlmProvider::Anthropic => {
            let mut client = AnthropicClient::new(
                creds.llm_key,
                cfg.llm.model.clone(),
                cfg.llm.max_tokens,
                llm_timeout,
                llm_client,
            )
            .map_err(setup_error)?
            .with_temperature(cfg.llm.temperature);
            if let Some(url) = &cfg.llm.url {
                client = client.with_url(url.as_str());
            }
            info!(model = client.model_name(), "Using Anthropic provider");
            Arc::new(client)
        }
    };

    // -- Sheet --------------------------------------------------------------

    let mut dry_run_store: Option<Arc<MemorySheetStore>> = None;
    let store: Arc<dyn SheetStore> = match &creds.sheet {
        Some(sheet) if !args.dry_run => {
            let key = ServiceAccountKey::from_json(sheet.service_account_json.expose_secret())
                .map_err(setup_error)?;
            Arc::new(
                GoogleSheetsStore::new(
                    sheet.spreadsheet_id.as_str(),
                    key,
                    Duration::from_secs(cfg.sheet.timeout_secs),
                )
                .map_err(setup_error)?
                .with_api_base(cfg.sheet.api_base.as_str()),
            )
        }
        _ => {
            let memory = Arc::new(MemorySheetStore::new());
            dry_run_store = Some(memory.clone());
            memory
        }
    };

    let sink = SheetSink::new(store, cfg.sheet.tab.as_str(), sheets_client)
        .with_run_log(cfg.sheet.run_log_tab.as_str());

    // -- Run ----------------------------------------------------------------

    let orchestrator = PipelineOrchestrator::new(
        market,
        search,
        SynthesisEngine::new(model),
        RunSettings {
            run_date,
            concurrency: cfg.run.concurrency,
            deadline: cfg.run.deadline(),
        },
    );

    let outcome = orchestrator.run(&tickers, &sink).await;
    for client in &clients {
        info!(
            dependency = client.name(),
            calls = client.total_calls(),
            retries = client.total_retries(),
            "Client usage"
        );
    }
    let report = outcome?;

    if let Some(memory) = dry_run_store {
        print_rows(&memory.rows(&cfg.sheet.tab));
    }
    println!("{report}");

    Ok(report)
}

/// Print dry-run rows, one per line, with multi-line cells flattened.
fn print_rows(rows: &[Vec<String>]) {
    for row in rows {
        let cells: Vec<String> = row.iter().map(|c| c.replace('\n', "; ")).collect();
        println!("{}", cells.join(" | "));
    }
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("market_explorer=info"));

    let json_logging = std::env::var("MARKET_EXPLORER_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}

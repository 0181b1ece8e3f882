use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use kite_recorder::config::{Config, LogFormat, LoggingConfig, SinkMode, DEFAULT_CONFIG_PATH};
use kite_recorder::kite::KiteRestClient;
use kite_recorder::model::{parse_interval, Interval, Series};
use kite_recorder::notifier::{Notify, TelegramNotifier};
use kite_recorder::pipeline::{
    open_option_sink, open_sinks, run_option_snapshot, run_series, Extraction,
};
use kite_recorder::source::exchange_now;

#[derive(Parser)]
#[command(
    name = "kite-recorder",
    version,
    about = "Fetch Kite historical bars and option-chain snapshots and persist them"
)]
struct Cli {
    /// Path to the TOML config file. Defaults apply when it does not exist.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch, normalize and persist one or more series.
    Extract {
        /// Trading symbols (e.g. "NIFTY 50" RELIANCE). Defaults to [extract].symbols.
        #[arg(long = "symbol", num_args = 1..)]
        symbols: Vec<String>,

        /// Calendar days to look back.
        #[arg(long)]
        days: Option<u32>,

        /// Bar interval (minute, 3minute, 5minute, ..., 60minute, day).
        #[arg(long, value_parser = parse_interval)]
        interval: Option<Interval>,

        #[arg(long, value_enum)]
        sink: Option<SinkMode>,

        /// Send a Telegram summary per series.
        #[arg(long, default_value_t = false)]
        notify: bool,

        /// Run series on separate threads.
        #[arg(long, default_value_t = false)]
        parallel: bool,
    },
    /// Resolve a symbol to its instrument token.
    Search {
        #[arg(long)]
        symbol: String,
    },
    /// Snapshot the option chain around spot into the database.
    Options {
        /// Strikes on each side of at-the-money. Defaults to [options].strikes_each_side.
        #[arg(long)]
        strikes: Option<u32>,
    },
    /// Show row count and span of what is stored for a series.
    Info {
        #[arg(long)]
        symbol: String,

        #[arg(long, value_parser = parse_interval)]
        interval: Option<Interval>,

        #[arg(long)]
        days: Option<u32>,

        #[arg(long, value_enum)]
        sink: Option<SinkMode>,
    },
}

fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&logging.level))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match &logging.file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            let builder = builder.with_writer(Mutex::new(file)).with_ansi(false);
            match logging.format {
                LogFormat::Json => builder.json().init(),
                LogFormat::Text => builder.init(),
            }
        }
        None => {
            let builder = builder.with_writer(std::io::stderr);
            match logging.format {
                LogFormat::Json => builder.json().init(),
                LogFormat::Text => builder.init(),
            }
        }
    }
    Ok(())
}

fn build_notifier(config: &Config, requested: bool) -> Option<TelegramNotifier> {
    if !requested && !config.telegram.enabled {
        return None;
    }
    match TelegramNotifier::new(&config.telegram) {
        Ok(n) => Some(n),
        Err(e) => {
            tracing::warn!(error = %e, "Telegram notifier disabled");
            None
        }
    }
}

/// Run one series with its own sinks. Returns whether it succeeded.
fn extract_one(
    config: &Config,
    client: &KiteRestClient,
    job: &Extraction,
    mode: SinkMode,
    series: &Series,
    notifier: Option<&TelegramNotifier>,
) -> bool {
    let mut sinks = match open_sinks(config, mode, job.days) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(series = %series, error = %e, "Failed to open sinks");
            return false;
        }
    };
    let notifier = notifier.map(|n| n as &dyn Notify);
    match run_series(client, job, series, &mut sinks, notifier) {
        Ok(outcome) => {
            for w in &outcome.writes {
                tracing::info!(
                    series = %series,
                    target = %w.target,
                    inserted = w.inserted,
                    updated = w.updated,
                    total = w.total_rows,
                    "Series persisted"
                );
            }
            println!(
                "{}: {} bars [{}] -> {}",
                series,
                outcome.fetched,
                outcome.range,
                outcome
                    .writes
                    .iter()
                    .map(|w| w.target.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            true
        }
        Err(e) => {
            tracing::error!(series = %series, error = %e, "Series failed");
            eprintln!("{}: {}", series, e);
            false
        }
    }
}

fn cmd_extract(
    config: &Config,
    symbols: Vec<String>,
    days: Option<u32>,
    interval: Option<Interval>,
    sink: Option<SinkMode>,
    notify: bool,
    parallel: bool,
) -> Result<()> {
    let mut extract = config.extract.clone();
    if !symbols.is_empty() {
        extract.symbols = symbols;
    }
    let interval = interval.unwrap_or(extract.interval);
    let days = days.unwrap_or(extract.days);
    let mode = sink.unwrap_or(extract.sink);

    let series: Vec<Series> = extract
        .tradable_symbols()
        .iter()
        .map(|s| Series::new(s, interval))
        .collect();
    if series.is_empty() {
        bail!("no symbols to extract");
    }

    let client = KiteRestClient::new(&config.kite)?;
    let profile = client
        .profile()
        .context("Kite rejected the access token; refresh it and retry")?;
    tracing::info!(user_id = %profile.user_id, user_name = %profile.user_name, "Kite session verified");

    let notifier = build_notifier(config, notify);
    let job = Extraction {
        days,
        policy: config.retry.policy(),
        chunk_pause: Duration::from_millis(config.kite.chunk_pause_ms),
        now: exchange_now(),
        notifier: config.notifier.clone(),
    };

    let ok_count = if parallel && series.len() > 1 {
        std::thread::scope(|scope| {
            let handles: Vec<_> = series
                .iter()
                .map(|s| {
                    let (client, job, notifier) = (&client, &job, notifier.as_ref());
                    scope.spawn(move || extract_one(config, client, job, mode, s, notifier))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join())
                .filter(|joined| matches!(joined, Ok(true)))
                .count()
        })
    } else {
        series
            .iter()
            .filter(|s| extract_one(config, &client, &job, mode, s, notifier.as_ref()))
            .count()
    };

    if ok_count < series.len() {
        bail!("{} of {} series failed", series.len() - ok_count, series.len());
    }
    Ok(())
}

fn cmd_search(config: &Config, symbol: &str) -> Result<()> {
    let client = KiteRestClient::new(&config.kite)?;
    let instrument = client
        .resolve(symbol)
        .with_context(|| format!("failed to resolve {}", symbol))?;
    println!(
        "{}\ttoken={}\t{}",
        instrument.tradingsymbol, instrument.token, instrument.name
    );
    Ok(())
}

fn cmd_options(config: &Config, strikes: Option<u32>) -> Result<()> {
    let mut options = config.options.clone();
    if let Some(n) = strikes {
        options.strikes_each_side = n;
    }

    let client = KiteRestClient::new(&config.kite)?;
    let mut sink = open_option_sink(config)?;
    let outcome = run_option_snapshot(
        &client,
        &config.retry.policy(),
        &options,
        exchange_now(),
        sink.as_mut(),
    )?;
    tracing::info!(
        target = %outcome.write.target,
        inserted = outcome.write.inserted,
        updated = outcome.write.updated,
        total = outcome.write.total_rows,
        "Option snapshot persisted"
    );
    println!(
        "{} options @ {}: {} rows -> {}",
        options.underlying, outcome.taken_at, outcome.rows, outcome.write.target
    );
    Ok(())
}

fn cmd_info(
    config: &Config,
    symbol: &str,
    interval: Option<Interval>,
    days: Option<u32>,
    sink: Option<SinkMode>,
) -> Result<()> {
    let series = Series::new(symbol, interval.unwrap_or(config.extract.interval));
    let days = days.unwrap_or(config.extract.days);
    let mode = sink.unwrap_or(config.extract.sink);
    let mut sinks = open_sinks(config, mode, days)?;
    for sink in sinks.iter_mut() {
        match sink.describe(&series)? {
            Some(info) => println!(
                "{}\trows={}\tfirst={}\tlast={}",
                info.target,
                info.row_count,
                info.first.map(|t| t.to_string()).unwrap_or_default(),
                info.last.map(|t| t.to_string()).unwrap_or_default()
            ),
            None => println!("{}\tno data", sink.target(&series)),
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {:#}", e);
            eprintln!("Make sure .env exists with KITE_API_KEY and an access token");
            std::process::exit(1);
        }
    };
    init_tracing(&config.logging)?;

    match cli.command {
        Commands::Extract {
            symbols,
            days,
            interval,
            sink,
            notify,
            parallel,
        } => cmd_extract(&config, symbols, days, interval, sink, notify, parallel),
        Commands::Search { symbol } => cmd_search(&config, &symbol),
        Commands::Options { strikes } => cmd_options(&config, strikes),
        Commands::Info {
            symbol,
            interval,
            days,
            sink,
        } => cmd_info(&config, &symbol, interval, days, sink),
    }
}

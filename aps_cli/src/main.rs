#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]

mod cli;
mod commands;
mod error_fmt;
mod files;

use std::path::Path;

use aps_traits::Clock;
use clap::Parser;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::cli::{Cli, Commands, FILE_GUARD, JSON_MODE};
use crate::commands::{Loaded, RecordArgs, SuggestArgs};
use crate::error_fmt::{exit_code_for_error, format_error_json, humanize};

/// Logging goes to stderr so stdout stays a single JSON document.
fn init_tracing(json: bool, level: &str, logging: &aps_config::Logging) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let console = if json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer().pretty().with_writer(std::io::stderr).boxed()
    };
    let file_layer = logging.file.as_deref().and_then(|file| {
        let path = Path::new(file);
        let dir = path
            .parent()
            .filter(|d| !d.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let name = path
            .file_name()
            .map_or_else(|| "aps.log".into(), |n| n.to_string_lossy().into_owned());
        let rotation = match logging.rotation.as_deref().unwrap_or("never") {
            "daily" => Rotation::DAILY,
            "hourly" => Rotation::HOURLY,
            _ => Rotation::NEVER,
        };
        let appender = match RollingFileAppender::builder()
            .rotation(rotation)
            .filename_prefix(name)
            .build(dir)
        {
            Ok(a) => a,
            Err(e) => {
                eprintln!("log file {file} unavailable: {e}");
                return None;
            }
        };
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let _ = FILE_GUARD.set(guard);
        Some(
            fmt::layer()
                .json()
                .with_writer(writer)
                .with_filter(EnvFilter::new(logging.level.as_deref().unwrap_or(level))),
        )
    });
    let _ = tracing_subscriber::registry()
        .with(console.with_filter(filter))
        .with(file_layer)
        .try_init();
}

/// Logging section of the config, read leniently so a broken config can
/// still be reported through the configured sinks.
fn logging_from(path: &Path) -> Option<aps_config::Logging> {
    let text = std::fs::read_to_string(path).ok()?;
    aps_config::load_toml(&text).ok().map(|c| c.logging)
}

fn run(cli: Cli) -> eyre::Result<()> {
    let clock = commands::clock_for(cli.now);
    let now = clock.now();
    let loaded: Loaded = commands::load_config(&cli.config, cli.basal_csv.as_deref())?;
    tracing::info!(command = ?cli.cmd, %now, "aps start");

    match cli.cmd {
        Commands::Suggest {
            data,
            temp_rate,
            temp_minutes,
            reservoir,
            pump_updated_at,
            history_start,
            microbolus,
            profile_override,
            temp_target,
            tdd_middleware,
            out,
        } => commands::run_suggest(
            &loaded,
            SuggestArgs {
                data,
                temp_rate,
                temp_minutes,
                reservoir,
                pump_updated_at,
                history_start,
                microbolus,
                profile_override,
                temp_target,
                tdd_middleware,
                out,
            },
            clock,
        ),
        Commands::Record {
            ledger,
            kind,
            units,
            rate,
            minutes,
            at,
            manual,
        } => commands::run_record(
            &loaded,
            RecordArgs {
                ledger,
                kind,
                units,
                rate,
                minutes,
                at,
                manual,
            },
            now,
        ),
        Commands::Reconcile {
            ledger,
            history,
            drain,
        } => commands::run_reconcile(&loaded, &ledger, &history, drain, now),
        Commands::Resolve {
            ledger,
            uuid,
            outcome,
            units,
        } => commands::run_resolve(&loaded, &ledger, uuid, outcome, units),
        Commands::Autosens { data } => commands::run_autosens(&loaded, &data, now),
        Commands::Tdd {
            data,
            history_start,
        } => commands::run_tdd(&loaded, &data, history_start, now),
        Commands::Autotune { data } => commands::run_autotune(&loaded, &data, now),
        Commands::SelfCheck => commands::run_self_check(&loaded, clock.as_ref()),
    }
}

fn main() {
    let cli = Cli::parse();
    let _ = JSON_MODE.set(cli.json);
    let _ = color_eyre::install();

    let logging = logging_from(&cli.config).unwrap_or_default();
    init_tracing(cli.json, &cli.log_level, &logging);

    if let Err(err) = run(cli) {
        let code = exit_code_for_error(&err);
        tracing::error!(error = %err, code, "aps failed");
        if JSON_MODE.get().copied().unwrap_or(false) {
            eprintln!("{}", format_error_json(&err));
        } else {
            eprintln!("{}", humanize(&err));
        }
        std::process::exit(code);
    }
}

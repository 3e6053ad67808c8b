//! settlement-runner: operator trigger surface for weekly settlement.
//!
//! Usage:
//!   settlement-runner calculate    --period 2025-01-06 [--as-of 2025-01-13T00:00:00Z]
//!   settlement-runner finalize     --period 2025-01-06
//!   settlement-runner safety-valve [--now 2025-01-20T00:00:00Z]
//!   settlement-runner seed-demo    --period 2025-01-06 --seed 42 --participants 500
//!   settlement-runner summary      --period 2025-01-06
//!
//! Common flags: --db settlement.db --data-dir ./data

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use commission_core::{
    config::CommissionConfig, demo::DemoNetwork, period::PeriodKey, store::SettlementStore,
    SettlementEngine,
};
use std::env;

#[derive(serde::Serialize)]
struct SeedReport {
    period_key:     String,
    seed:           u64,
    participants:   usize,
    transactions:   usize,
    sales_volume:   f64,
    ghost_volumes:  usize,
    volume_records: usize,
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let Some(command) = args.get(1).map(String::as_str) else {
        bail!("usage: settlement-runner <calculate|finalize|safety-valve|seed-demo|summary> [flags]");
    };
    let db = flag(&args, "--db").unwrap_or("settlement.db");
    let data_dir = flag(&args, "--data-dir").unwrap_or("./data");

    let config = CommissionConfig::load(data_dir)?;
    let store = SettlementStore::open(db).with_context(|| format!("Cannot open {db}"))?;
    store.migrate()?;
    let engine = SettlementEngine::build(store, config)?;

    match command {
        "calculate" => {
            let period = required(&args, "--period")?;
            let as_of = timestamp_flag(&args, "--as-of")?.unwrap_or_else(Utc::now);
            let summary = engine.calculate_at(period, as_of)?;
            if summary.is_partial() {
                log::warn!("{} participants skipped; see summary", summary.skipped.len());
            }
            print_json(&summary)?;
        }
        "finalize" => {
            let period = required(&args, "--period")?;
            let summary = engine.finalize(period)?;
            print_json(&summary)?;
        }
        "safety-valve" => {
            let now = timestamp_flag(&args, "--now")?.unwrap_or_else(Utc::now);
            let report = engine.run_safety_valve(now)?;
            print_json(&report)?;
            let failed = report.failed_tasks();
            if !failed.is_empty() {
                bail!("maintenance tasks failed: {}", failed.join(", "));
            }
        }
        "seed-demo" => {
            let period = PeriodKey::parse(required(&args, "--period")?)?;
            let seed = parse_arg(&args, "--seed", 42u64);
            let participants = parse_arg(&args, "--participants", 500usize);
            let network = DemoNetwork::generate(seed, participants, period);
            network.write_to(&engine.store)?;
            print_json(&SeedReport {
                period_key:     period.to_string(),
                seed,
                participants:   network.participants.len(),
                transactions:   network.transactions.len(),
                sales_volume:   network.sales_volume(),
                ghost_volumes:  network.ghost_volumes.len(),
                volume_records: network.volume_records.len(),
            })?;
        }
        "summary" => {
            let period = required(&args, "--period")?;
            match engine.calculation_summary(period)? {
                Some(summary) => print_json(&summary)?,
                None => bail!("no completed calculation for period {period}"),
            }
        }
        other => bail!("unknown command '{other}'"),
    }
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn flag<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.windows(2)
        .find(|w| w[0] == name)
        .map(|w| w[1].as_str())
}

fn required<'a>(args: &'a [String], name: &str) -> Result<&'a str> {
    flag(args, name).with_context(|| format!("missing required flag {name}"))
}

fn timestamp_flag(args: &[String], name: &str) -> Result<Option<DateTime<Utc>>> {
    flag(args, name)
        .map(|raw| {
            DateTime::parse_from_rfc3339(raw)
                .map(|t| t.with_timezone(&Utc))
                .with_context(|| format!("{name} must be RFC 3339, got '{raw}'"))
        })
        .transpose()
}

fn parse_arg<T: std::str::FromStr + Copy>(args: &[String], flag: &str, default: T) -> T {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}

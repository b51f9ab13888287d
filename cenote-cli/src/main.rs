// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cenote_core::{AggregateKey, AggregateRecord, CenoteConfig, CodecFormat};
use cenote_ingest::{EventEnvelope, IngestionAdapter};
use cenote_storage::{AggregateStore, AggregateUpdater, MemoryBackend};

#[derive(Parser, Debug)]
#[command(author, version, about = "Incremental event aggregates", long_about = None)]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Snapshot encoding (overrides config file)
    #[arg(long, env = "CENOTE_CODEC", global = true)]
    codec: Option<CodecFormat>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest a JSON-lines event file and print every aggregate
    Ingest {
        /// One event envelope per line
        events: PathBuf,
    },
    /// Ingest a JSON-lines event file and print one aggregate
    Show {
        events: PathBuf,
        #[arg(long)]
        table: String,
        #[arg(long)]
        attribute: String,
        #[arg(long)]
        entity: Option<String>,
    },
}

#[derive(Serialize)]
struct AggregateDump<'a> {
    key: &'a AggregateKey,
    record: &'a AggregateRecord,
}

fn init_tracing(json: bool) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cenote=info".into()),
        )
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();
}

async fn read_events(path: &Path) -> Result<Vec<EventEnvelope>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;

    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            EventEnvelope::from_json(line)
                .with_context(|| format!("{}:{}: malformed event", path.display(), n + 1))
        })
        .collect()
}

/// Feed events in runs of consecutive same-table events.
async fn ingest_all(adapter: &IngestionAdapter, events: &[EventEnvelope]) {
    let mut start = 0;
    while start < events.len() {
        let table = events[start].table().ok();
        let end = events[start..]
            .iter()
            .position(|e| e.table().ok() != table)
            .map_or(events.len(), |offset| start + offset);

        match adapter.ingest_batch(&events[start..end]).await {
            Ok(batch) => {
                for (i, report) in batch.events.iter().enumerate() {
                    match report {
                        Ok(report) if report.is_complete() => {}
                        Ok(report) => tracing::warn!(
                            "Event {} in {}: {} of {} attribute updates failed",
                            start + i + 1,
                            batch.table,
                            report.failures().count(),
                            report.outcomes.len()
                        ),
                        Err(e) => tracing::warn!("Event {} skipped: {}", start + i + 1, e),
                    }
                }
            }
            Err(e) => tracing::warn!("Skipping events {}..={}: {}", start + 1, end, e),
        }
        start = end;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    // Load configuration
    let mut config = CenoteConfig::load(args.config)?;

    // Apply CLI overrides
    if let Some(codec) = args.codec {
        config.codec.format = codec;
    }

    let backend = Arc::new(MemoryBackend::new());
    let updater = AggregateUpdater::new(AggregateStore::new(backend.clone()), &config);
    let adapter = IngestionAdapter::new(updater, &config);

    match args.command {
        Command::Ingest { events } => {
            let events = read_events(&events).await?;
            tracing::info!("Ingesting {} events", events.len());
            ingest_all(&adapter, &events).await;

            let mut dumps = Vec::new();
            for raw in backend.keys() {
                let key = AggregateKey::parse_storage_key(&raw)?;
                if let Some(record) = adapter.updater().read_aggregate(&key).await? {
                    dumps.push((key, record));
                }
            }
            let out: Vec<AggregateDump<'_>> = dumps
                .iter()
                .map(|(key, record)| AggregateDump { key, record })
                .collect();
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Command::Show {
            events,
            table,
            attribute,
            entity,
        } => {
            let key = match entity {
                Some(entity) => AggregateKey::for_entity(table, entity, attribute)?,
                None => AggregateKey::new(table, attribute)?,
            };
            let events = read_events(&events).await?;
            ingest_all(&adapter, &events).await;

            match adapter.updater().read_aggregate(&key).await? {
                Some(record) => println!(
                    "{}",
                    serde_json::to_string_pretty(&AggregateDump { key: &key, record: &record })?
                ),
                None => println!("{key}: absent"),
            }
        }
    }

    tracing::info!("Ingest stats: {:?}", adapter.stats().snapshot());
    Ok(())
}

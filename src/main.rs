//! # Prospector — recurring business-discovery pipelines
//!
//! Fans a discovery request out across sub-regions with bounded
//! concurrency and per-task ephemeral credentials, aggregates the results,
//! and can re-run the whole pipeline on a natural-language schedule.
//!
//! Usage:
//!   prospector run "Austin" --kind "coffee shop"   # One-off discovery
//!   prospector schedule add sweep Austin --every "every Monday at 9am"
//!   prospector schedule list
//!   prospector heartbeat                           # Foreground scheduler

use anyhow::Result;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use prospector_core::capability::{CapabilityInvoker, CapabilityOutcome, InvokeOptions};
use prospector_core::{OrchestratorConfig, TracingSink, audit::AuditSink};
use prospector_scheduler::{
    JsonScheduleStore, REGION_DISCOVERY, ScheduleEngine, ScheduleKind, ScheduleStore, Trigger,
};
use prospector_workflow::{DiscoveryPipeline, DiscoveryRequest, PipelineContext};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "prospector",
    version,
    about = "🔭 Prospector — recurring business-discovery pipelines"
)]
struct Cli {
    /// Config file (default ~/.prospector/config.toml)
    #[arg(long)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one discovery pipeline now and print the report
    Run {
        /// Target region, e.g. "Austin"
        region: String,

        /// What to look for
        #[arg(long, default_value = "coffee shop")]
        kind: String,

        /// Owning tenant
        #[arg(long, default_value = "default")]
        tenant: String,

        /// Explicit sub-regions (skips resolution)
        #[arg(long = "sub-region")]
        sub_regions: Vec<String>,
    },

    /// Manage recurring schedules
    Schedule {
        #[command(subcommand)]
        command: ScheduleCommand,
    },

    /// Run the scheduler heartbeat in the foreground (Ctrl-C to stop)
    Heartbeat,
}

#[derive(Subcommand)]
enum ScheduleCommand {
    /// Add a schedule from natural language or an explicit cron string
    Add {
        /// Schedule name
        name: String,

        /// Target region
        region: String,

        /// What to look for
        #[arg(long, default_value = "coffee shop")]
        kind: String,

        /// Natural-language recurrence, e.g. "every Monday at 9am"
        #[arg(long, conflicts_with = "cron")]
        every: Option<String>,

        /// Explicit 5-field cron expression
        #[arg(long)]
        cron: Option<String>,

        /// Owning tenant
        #[arg(long, default_value = "default")]
        tenant: String,

        /// Fire into a spawned worker process instead of in-process
        #[arg(long)]
        worker: bool,
    },

    /// List schedules
    List {
        #[arg(long)]
        tenant: Option<String>,
    },

    /// Remove a schedule by id
    Remove { id: String },

    /// Enable a schedule
    Enable { id: String },

    /// Disable a schedule
    Disable { id: String },
}

/// Deterministic demo capabilities — stand-ins until real providers are
/// wired in. The same region always yields the same businesses.
struct SampleInvoker;

#[async_trait]
impl CapabilityInvoker for SampleInvoker {
    async fn invoke(
        &self,
        capability_id: &str,
        input: Value,
        _opts: &InvokeOptions,
    ) -> prospector_core::Result<CapabilityOutcome> {
        match capability_id {
            "resolve-subregions" => {
                let region = input["region"].as_str().unwrap_or("region");
                let subs: Vec<String> = ["downtown", "north", "south", "east side"]
                    .iter()
                    .map(|q| format!("{region} {q}"))
                    .collect();
                Ok(CapabilityOutcome::ok(json!({ "sub_regions": subs })))
            }
            "discover-businesses" => {
                let sub = input["sub_region"].as_str().unwrap_or("somewhere");
                let kind = input["kind"].as_str().unwrap_or("business");
                Ok(CapabilityOutcome::ok(json!({"businesses": sample_businesses(sub, kind)}))
                    .with_cost(0.05))
            }
            other => Ok(CapabilityOutcome::err(&format!(
                "no sample capability '{other}'"
            ))),
        }
    }
}

/// Seeded from the sub-region name, so repeat runs agree.
fn sample_businesses(sub_region: &str, kind: &str) -> Vec<Value> {
    let seed = sub_region
        .bytes()
        .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
    let mut rng = StdRng::seed_from_u64(seed);
    let count = rng.gen_range(3..=8);
    (0..count)
        .map(|i| {
            let rating = (rng.gen_range(25..=50) as f64) / 10.0;
            json!({
                "id": format!("biz-{seed:x}-{i}"),
                "name": format!("{} {} #{i}", titlecase(sub_region), titlecase(kind)),
                "region": sub_region,
                "website": rng.gen_bool(0.6).then(|| format!("https://biz-{seed:x}-{i}.example.com")),
                "phone": rng.gen_bool(0.8).then(|| format!("+1 512 555 {:04}", rng.gen_range(0..10000))),
                "rating": rating,
                "review_count": rng.gen_range(0..400),
                "listing_claimed": rng.gen_bool(0.25),
            })
        })
        .collect()
}

fn titlecase(s: &str) -> String {
    s.split_whitespace()
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "prospector=debug"
    } else {
        "prospector=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let config = match &cli.config {
        Some(path) => OrchestratorConfig::load_from(std::path::Path::new(path))?,
        None => OrchestratorConfig::load()?,
    };

    let ctx = PipelineContext::new(
        config,
        Arc::new(SampleInvoker),
        Arc::new(TracingSink) as Arc<dyn AuditSink>,
    );
    ctx.spawn_background();

    let store: Arc<dyn ScheduleStore> =
        Arc::new(JsonScheduleStore::new(&JsonScheduleStore::default_dir())?);
    let engine = ScheduleEngine::new(Arc::clone(&ctx), store);

    match cli.command {
        Command::Run {
            region,
            kind,
            tenant,
            sub_regions,
        } => {
            let mut request = DiscoveryRequest::new(&region, &kind, &tenant);
            if !sub_regions.is_empty() {
                request.sub_regions = Some(sub_regions);
            }
            let pipeline = DiscoveryPipeline::new(Arc::clone(&ctx));
            let report = pipeline.run(&request).await?;
            println!("{}", report.report_text);
            if report.timed_out {
                println!("(partial — some sub-regions did not finish in time)");
            }
        }

        Command::Schedule { command } => match command {
            ScheduleCommand::Add {
                name,
                region,
                kind,
                every,
                cron,
                tenant,
                worker,
            } => {
                let trigger = match (every, cron) {
                    (Some(text), _) => Trigger::from_text(&text)?,
                    (None, Some(expr)) => Trigger::from_cron(&expr)?,
                    (None, None) => anyhow::bail!("need --every or --cron"),
                };
                let schedule_kind = if worker {
                    ScheduleKind::Worker
                } else {
                    ScheduleKind::InProcess
                };
                let schedule = engine
                    .create(
                        &name,
                        REGION_DISCOVERY,
                        json!({"region": region, "kind": kind}),
                        trigger,
                        &tenant,
                        schedule_kind,
                    )
                    .await?;
                println!(
                    "✅ Schedule '{}' created ({})\n   cron: {}\n   next: {}",
                    schedule.name,
                    schedule.id,
                    schedule.trigger.cron,
                    schedule
                        .next_run
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "-".into()),
                );
            }
            ScheduleCommand::List { tenant } => {
                let schedules = engine.list(tenant.as_deref()).await?;
                if schedules.is_empty() {
                    println!("No schedules.");
                }
                for s in schedules {
                    let state = if s.enabled { "on " } else { "off" };
                    let next = s
                        .next_run
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "-".into());
                    let last = match &s.last_result {
                        Some(r) if r.success => format!("ok: {}", r.detail),
                        Some(r) => format!("failed: {}", r.detail),
                        None => "never fired".into(),
                    };
                    println!(
                        "[{state}] {} '{}' cron='{}' next={next} runs={} ({last})",
                        s.id, s.name, s.trigger.cron, s.run_count
                    );
                }
            }
            ScheduleCommand::Remove { id } => {
                if engine.delete(&id).await? {
                    println!("🗑️ Removed {id}");
                } else {
                    println!("No schedule '{id}'");
                }
            }
            ScheduleCommand::Enable { id } => {
                engine.set_enabled(&id, true).await?;
                println!("✅ Enabled {id}");
            }
            ScheduleCommand::Disable { id } => {
                engine.set_enabled(&id, false).await?;
                println!("⏸️ Disabled {id}");
            }
        },

        Command::Heartbeat => {
            engine.start().await;
            println!("💓 Heartbeat running — Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            engine.stop().await;
        }
    }

    Ok(())
}

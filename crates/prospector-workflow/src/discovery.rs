//! The region-wide business-discovery pipeline.
//!
//! Concrete instantiation of the fan-out/fan-in machinery: resolve
//! sub-regions (cached ~24h), enqueue one discovery task per sub-region,
//! fan-in, dedupe, summarize, and derive ranked next actions. Failed
//! sub-targets are reported alongside the successes — the caller always
//! gets a usable partial result.

use crate::context::PipelineContext;
use crate::executor::{TaskTerminal, wait_for_tasks};
use prospector_core::audit::AuditRecord;
use prospector_core::capability::InvokeOptions;
use prospector_core::{ProspectorError, Result, redact_credentials};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_DISCOVERY_ATTEMPTS: u32 = 3;

/// Regions we know sit next to each other; drives expansion suggestions.
const NEARBY_REGIONS: &[(&str, &[&str])] = &[
    ("austin", &["round rock", "san marcos", "georgetown"]),
    ("dallas", &["fort worth", "plano", "arlington"]),
    ("houston", &["sugar land", "the woodlands", "pasadena"]),
    ("miami", &["fort lauderdale", "hialeah", "coral gables"]),
    ("denver", &["aurora", "boulder", "lakewood"]),
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryRequest {
    pub region: String,
    /// What to look for, e.g. "coffee shop".
    pub business_kind: String,
    /// Explicit sub-regions; when absent they are resolved (and cached).
    #[serde(default)]
    pub sub_regions: Option<Vec<String>>,
    pub tenant_id: String,
    #[serde(default = "default_attempts")]
    pub max_attempts: u32,
}

fn default_attempts() -> u32 {
    DEFAULT_DISCOVERY_ATTEMPTS
}

impl DiscoveryRequest {
    pub fn new(region: &str, business_kind: &str, tenant_id: &str) -> Self {
        Self {
            region: region.to_string(),
            business_kind: business_kind.to_string(),
            sub_regions: None,
            tenant_id: tenant_id.to_string(),
            max_attempts: DEFAULT_DISCOVERY_ATTEMPTS,
        }
    }
}

/// One discovered business, as returned across the capability boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusinessRecord {
    /// Stable external identifier — the dedupe key.
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub rating: Option<f64>,
    #[serde(default)]
    pub review_count: u64,
    /// Whether the owner has claimed the listing.
    #[serde(default)]
    pub listing_claimed: bool,
}

/// Terminal outcome of one sub-region's discovery task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTargetOutcome {
    pub sub_region: String,
    pub task_id: String,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    pub record_count: usize,
}

/// Aggregate statistics over the deduplicated record set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySummary {
    pub total_records: usize,
    pub sub_targets: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Share of records with a website (external presence), 0.0–1.0.
    pub website_rate: f64,
    pub phone_rate: f64,
    /// Share of records whose listing is already claimed.
    pub claimed_rate: f64,
    pub avg_rating: Option<f64>,
}

/// A ranked follow-up suggestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NextAction {
    pub rank: usize,
    pub title: String,
    pub detail: String,
}

/// Everything a pipeline run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryReport {
    pub region: String,
    pub business_kind: String,
    pub records: Vec<BusinessRecord>,
    pub sub_targets: Vec<SubTargetOutcome>,
    pub summary: DiscoverySummary,
    pub report_text: String,
    pub next_actions: Vec<NextAction>,
    /// The fan-in ceiling was hit; records cover only the finished tasks.
    pub timed_out: bool,
    pub cost: f64,
}

/// Flatten per-sub-target record lists, keeping the first-seen record per
/// external id.
pub fn aggregate_records(lists: Vec<Vec<BusinessRecord>>) -> Vec<BusinessRecord> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::new();
    for list in lists {
        for record in list {
            if seen.insert(record.id.clone()) {
                out.push(record);
            }
        }
    }
    out
}

pub fn summarize(records: &[BusinessRecord], sub_targets: &[SubTargetOutcome]) -> DiscoverySummary {
    let total = records.len();
    let rate = |count: usize| {
        if total == 0 { 0.0 } else { count as f64 / total as f64 }
    };
    let rated: Vec<f64> = records.iter().filter_map(|r| r.rating).collect();
    DiscoverySummary {
        total_records: total,
        sub_targets: sub_targets.len(),
        succeeded: sub_targets.iter().filter(|s| s.success).count(),
        failed: sub_targets.iter().filter(|s| !s.success).count(),
        website_rate: rate(records.iter().filter(|r| r.website.is_some()).count()),
        phone_rate: rate(records.iter().filter(|r| r.phone.is_some()).count()),
        claimed_rate: rate(records.iter().filter(|r| r.listing_claimed).count()),
        avg_rating: if rated.is_empty() {
            None
        } else {
            Some(rated.iter().sum::<f64>() / rated.len() as f64)
        },
    }
}

/// Threshold-driven suggestions, ranked by list position.
pub fn suggest_next_actions(region: &str, summary: &DiscoverySummary) -> Vec<NextAction> {
    let mut actions: Vec<(String, String)> = Vec::new();

    if summary.total_records > 20 {
        actions.push((
            "Filter by rating band".into(),
            format!(
                "{} results is a lot — narrow to a quality band (e.g. rating ≥ 4.0) before outreach",
                summary.total_records
            ),
        ));
    }
    if summary.website_rate > 0.5 {
        actions.push((
            "Run enrichment".into(),
            format!(
                "{:.0}% have a website — enrich those records with site audits and contact details",
                summary.website_rate * 100.0
            ),
        ));
    }
    if summary.claimed_rate < 0.3 {
        actions.push((
            "Target unclaimed listings".into(),
            format!(
                "only {:.0}% of listings are claimed — the unclaimed segment is the warmest audience",
                summary.claimed_rate * 100.0
            ),
        ));
    }
    actions.push((
        "Draft outreach".into(),
        "draft a personalized outreach message per shortlisted business".into(),
    ));
    actions.push((
        "Schedule a recurring run".into(),
        "re-run this discovery weekly to catch new openings".into(),
    ));
    if let Some(nearby) = nearby_regions(region) {
        actions.push((
            "Expand to nearby regions".into(),
            format!("adjacent markets worth the same sweep: {}", nearby.join(", ")),
        ));
    }

    actions
        .into_iter()
        .enumerate()
        .map(|(i, (title, detail))| NextAction {
            rank: i + 1,
            title,
            detail,
        })
        .collect()
}

fn nearby_regions(region: &str) -> Option<Vec<String>> {
    let needle = region.to_lowercase();
    NEARBY_REGIONS
        .iter()
        .find(|(r, _)| *r == needle)
        .map(|(_, neighbors)| neighbors.iter().map(|n| n.to_string()).collect())
}

pub fn render_report(request: &DiscoveryRequest, summary: &DiscoverySummary, actions: &[NextAction]) -> String {
    let mut out = format!(
        "Discovery report — {} in {}\n\
         Sub-targets: {} ({} succeeded, {} failed)\n\
         Unique businesses: {}\n\
         Website presence: {:.0}% · Phone listed: {:.0}% · Listing claimed: {:.0}%\n",
        request.business_kind,
        request.region,
        summary.sub_targets,
        summary.succeeded,
        summary.failed,
        summary.total_records,
        summary.website_rate * 100.0,
        summary.phone_rate * 100.0,
        summary.claimed_rate * 100.0,
    );
    if let Some(avg) = summary.avg_rating {
        out.push_str(&format!("Average rating: {avg:.1}\n"));
    }
    out.push_str("Next actions:\n");
    for action in actions {
        out.push_str(&format!("  {}. {} — {}\n", action.rank, action.title, action.detail));
    }
    out
}

/// Drives one end-to-end discovery run against the shared context.
pub struct DiscoveryPipeline {
    ctx: Arc<PipelineContext>,
}

impl DiscoveryPipeline {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self { ctx }
    }

    pub async fn run(&self, request: &DiscoveryRequest) -> Result<DiscoveryReport> {
        let sub_regions = self.resolve_sub_regions(request).await?;
        tracing::info!(
            "🔍 Discovery run: {} in {} across {} sub-region(s)",
            request.business_kind,
            request.region,
            sub_regions.len()
        );

        // Fan-out: one queued task per sub-region, each with its own
        // short-lived token and retry budget.
        let mut task_ids = Vec::with_capacity(sub_regions.len());
        for sub_region in &sub_regions {
            let id = self
                .ctx
                .queue
                .enqueue(
                    &format!("discovery-{}", request.region),
                    "discover",
                    "discover-businesses",
                    json!({
                        "region": request.region,
                        "sub_region": sub_region,
                        "kind": request.business_kind,
                    }),
                    &request.tenant_id,
                    self.ctx.config.tokens.default_ttl_secs,
                    request.max_attempts,
                )
                .await;
            task_ids.push(id);
        }

        let timeout = Duration::from_secs(self.ctx.config.scheduler.fan_in_timeout_secs);
        let fan_in = wait_for_tasks(&self.ctx.queue, &task_ids, timeout).await;

        let mut sub_targets = Vec::with_capacity(sub_regions.len());
        let mut record_lists = Vec::new();
        let mut cost = 0.0;
        for (sub_region, task_id) in sub_regions.iter().zip(&task_ids) {
            if let Some(task) = self.ctx.queue.get_task(task_id).await {
                cost += task.cost;
            }
            let outcome = match fan_in.outcomes.get(task_id) {
                Some(TaskTerminal::Completed(output)) => match parse_records(output) {
                    Ok(records) => {
                        let count = records.len();
                        record_lists.push(records);
                        SubTargetOutcome {
                            sub_region: sub_region.clone(),
                            task_id: task_id.clone(),
                            success: true,
                            error: None,
                            record_count: count,
                        }
                    }
                    Err(e) => SubTargetOutcome {
                        sub_region: sub_region.clone(),
                        task_id: task_id.clone(),
                        success: false,
                        error: Some(redact_credentials(&e.to_string())),
                        record_count: 0,
                    },
                },
                Some(TaskTerminal::Failed(error)) => SubTargetOutcome {
                    sub_region: sub_region.clone(),
                    task_id: task_id.clone(),
                    success: false,
                    error: Some(error.clone()),
                    record_count: 0,
                },
                // Still in flight when the ceiling hit.
                None => SubTargetOutcome {
                    sub_region: sub_region.clone(),
                    task_id: task_id.clone(),
                    success: false,
                    error: Some("timed out waiting for result".into()),
                    record_count: 0,
                },
            };
            sub_targets.push(outcome);
        }

        let records = aggregate_records(record_lists);
        let summary = summarize(&records, &sub_targets);
        let next_actions = suggest_next_actions(&request.region, &summary);
        let report_text = render_report(request, &summary, &next_actions);

        self.ctx.audit.emit(AuditRecord::new(
            "discovery",
            &request.region,
            if fan_in.timed_out { "partial" } else { "completed" },
            &format!(
                "{} records, {} succeeded, {} failed",
                summary.total_records, summary.succeeded, summary.failed
            ),
        ));
        tracing::info!(
            "📊 Discovery finished: {} unique businesses ({} succeeded / {} failed sub-targets)",
            summary.total_records,
            summary.succeeded,
            summary.failed
        );

        Ok(DiscoveryReport {
            region: request.region.clone(),
            business_kind: request.business_kind.clone(),
            records,
            sub_targets,
            summary,
            report_text,
            next_actions,
            timed_out: fan_in.timed_out,
            cost,
        })
    }

    /// Provided list, else cache, else the resolve capability (cached after).
    async fn resolve_sub_regions(&self, request: &DiscoveryRequest) -> Result<Vec<String>> {
        if let Some(provided) = &request.sub_regions
            && !provided.is_empty()
        {
            return Ok(provided.clone());
        }

        let cache_key = format!("subregions:{}", request.region.to_lowercase());
        if let Some(cached) = self.ctx.cache.get(&cache_key).await {
            if let Ok(list) = serde_json::from_value::<Vec<String>>(cached) {
                tracing::debug!("♻️ Sub-regions for {} served from cache", request.region);
                return Ok(list);
            }
            // Unparseable entry — drop it and re-resolve.
            self.ctx.cache.delete(&cache_key).await;
        }

        let outcome = self
            .ctx
            .invoker
            .invoke(
                "resolve-subregions",
                json!({"region": request.region, "kind": request.business_kind}),
                &InvokeOptions::new(&request.tenant_id),
            )
            .await?;
        if !outcome.success {
            return Err(ProspectorError::Capability(
                outcome
                    .error
                    .unwrap_or_else(|| "sub-region resolution failed".into()),
            ));
        }
        let list = parse_sub_regions(&outcome.output)?;
        self.ctx
            .cache
            .save(
                &cache_key,
                json!(list),
                Some(chrono::Duration::seconds(
                    self.ctx.config.cache.subregion_ttl_secs as i64,
                )),
            )
            .await;
        Ok(list)
    }
}

fn parse_sub_regions(output: &Value) -> Result<Vec<String>> {
    let raw = output.get("sub_regions").unwrap_or(output);
    serde_json::from_value(raw.clone()).map_err(|_| {
        ProspectorError::Workflow("resolve-subregions output is not a list of names".into())
    })
}

/// Accepts either a bare array or `{"businesses": [...]}`.
fn parse_records(output: &Value) -> Result<Vec<BusinessRecord>> {
    let raw = output.get("businesses").unwrap_or(output);
    serde_json::from_value(raw.clone()).map_err(|_| {
        ProspectorError::Workflow("discovery output is not a list of business records".into())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use prospector_core::capability::{CapabilityInvoker, CapabilityOutcome, FnInvoker};
    use prospector_core::config::OrchestratorConfig;
    use prospector_core::{MemorySink, audit::AuditSink};

    fn record(id: &str, website: bool, rating: f64, claimed: bool) -> BusinessRecord {
        BusinessRecord {
            id: id.to_string(),
            name: format!("Biz {id}"),
            region: "austin".into(),
            website: website.then(|| format!("https://{id}.example.com")),
            phone: Some("+1 512 555 0100".into()),
            rating: Some(rating),
            review_count: 12,
            listing_claimed: claimed,
        }
    }

    #[test]
    fn test_aggregate_keeps_first_seen_per_id() {
        let first = record("b1", true, 4.5, false);
        let dup = BusinessRecord {
            name: "Renamed".into(),
            ..record("b1", false, 2.0, true)
        };
        let lists = vec![vec![first.clone(), record("b2", false, 3.0, true)], vec![dup]];
        let merged = aggregate_records(lists.clone());
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].name, first.name);

        // Aggregating the already-deduped set changes nothing.
        let again = aggregate_records(vec![merged.clone()]);
        assert_eq!(again.len(), merged.len());
    }

    #[test]
    fn test_summary_rates() {
        let records = vec![
            record("a", true, 4.0, true),
            record("b", true, 5.0, false),
            record("c", false, 3.0, false),
            record("d", false, 4.0, false),
        ];
        let subs = vec![
            SubTargetOutcome {
                sub_region: "north".into(),
                task_id: "t1".into(),
                success: true,
                error: None,
                record_count: 4,
            },
            SubTargetOutcome {
                sub_region: "south".into(),
                task_id: "t2".into(),
                success: false,
                error: Some("provider timeout".into()),
                record_count: 0,
            },
        ];
        let summary = summarize(&records, &subs);
        assert_eq!(summary.total_records, 4);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert!((summary.website_rate - 0.5).abs() < 1e-9);
        assert!((summary.claimed_rate - 0.25).abs() < 1e-9);
        assert_eq!(summary.avg_rating, Some(4.0));
    }

    #[test]
    fn test_next_actions_thresholds() {
        let summary = DiscoverySummary {
            total_records: 25,
            sub_targets: 3,
            succeeded: 3,
            failed: 0,
            website_rate: 0.6,
            phone_rate: 0.8,
            claimed_rate: 0.2,
            avg_rating: Some(4.1),
        };
        let actions = suggest_next_actions("Austin", &summary);
        let titles: Vec<&str> = actions.iter().map(|a| a.title.as_str()).collect();
        assert!(titles.contains(&"Filter by rating band"));
        assert!(titles.contains(&"Run enrichment"));
        assert!(titles.contains(&"Target unclaimed listings"));
        assert!(titles.contains(&"Draft outreach"));
        assert!(titles.contains(&"Schedule a recurring run"));
        assert!(titles.contains(&"Expand to nearby regions"));
        // Ranks are 1-based list positions.
        assert_eq!(actions[0].rank, 1);
        assert_eq!(actions.last().unwrap().rank, actions.len());
    }

    #[test]
    fn test_next_actions_below_thresholds() {
        let summary = DiscoverySummary {
            total_records: 5,
            sub_targets: 1,
            succeeded: 1,
            failed: 0,
            website_rate: 0.2,
            phone_rate: 0.4,
            claimed_rate: 0.8,
            avg_rating: None,
        };
        let actions = suggest_next_actions("nowhere", &summary);
        let titles: Vec<&str> = actions.iter().map(|a| a.title.as_str()).collect();
        assert_eq!(titles, vec!["Draft outreach", "Schedule a recurring run"]);
    }

    fn sample_invoker() -> Arc<dyn CapabilityInvoker> {
        Arc::new(FnInvoker(|cap: &str, input: Value| {
            match cap {
                "resolve-subregions" => Ok(CapabilityOutcome::ok(
                    json!({"sub_regions": ["north", "south", "east"]}),
                )),
                "discover-businesses" => {
                    let sub = input["sub_region"].as_str().unwrap_or("");
                    if sub == "south" {
                        // Persistent provider failure for this sub-target.
                        Ok(CapabilityOutcome::err("provider unavailable"))
                    } else {
                        Ok(CapabilityOutcome::ok(json!({"businesses": [
                            {"id": format!("{sub}-1"), "name": format!("{sub} Coffee"), "website": "https://x.example.com", "rating": 4.5, "listing_claimed": false},
                            {"id": "shared", "name": "Chain Coffee", "rating": 4.0},
                        ]}))
                        .with_cost(0.1))
                    }
                }
                other => Ok(CapabilityOutcome::err(&format!("unknown capability {other}"))),
            }
        }))
    }

    fn test_context() -> Arc<PipelineContext> {
        let mut config = OrchestratorConfig::default();
        config.queue.dispatch_idle_ms = 10;
        config.queue.base_delay_ms = 10;
        config.scheduler.fan_in_timeout_secs = 10;
        let ctx = PipelineContext::new(
            config,
            sample_invoker(),
            Arc::new(MemorySink::new()) as Arc<dyn AuditSink>,
        );
        ctx.spawn_background();
        ctx
    }

    #[tokio::test]
    async fn test_partial_failure_yields_partial_report() {
        let ctx = test_context();
        let pipeline = DiscoveryPipeline::new(Arc::clone(&ctx));
        let mut request = DiscoveryRequest::new("Austin", "coffee shop", "t1");
        request.max_attempts = 1;

        let report = pipeline.run(&request).await.unwrap();

        assert_eq!(report.summary.sub_targets, 3);
        assert_eq!(report.summary.succeeded, 2);
        assert_eq!(report.summary.failed, 1);
        // "shared" appears in both successful sub-targets but only once here.
        assert_eq!(report.records.len(), 3);
        assert!(report.records.iter().all(|r| !r.id.starts_with("south")));
        assert!(!report.timed_out);
        assert!(report.report_text.contains("2 succeeded, 1 failed"));
        assert!(report.cost > 0.0);

        // The resolved sub-regions were cached for the next run.
        assert!(ctx.cache.has("subregions:austin").await);
    }

    #[tokio::test]
    async fn test_provided_sub_regions_skip_resolution() {
        let ctx = test_context();
        let pipeline = DiscoveryPipeline::new(Arc::clone(&ctx));
        let mut request = DiscoveryRequest::new("Austin", "coffee shop", "t1");
        request.sub_regions = Some(vec!["west".into()]);
        request.max_attempts = 1;

        let report = pipeline.run(&request).await.unwrap();
        assert_eq!(report.summary.sub_targets, 1);
        assert_eq!(report.summary.succeeded, 1);
        // Resolution never ran, so nothing was cached.
        assert!(!ctx.cache.has("subregions:austin").await);
    }
}

//! `policyline evolve` -- one pipeline run against an in-memory store.
//!
//! Seeds the store, feeds the proposal file to the pipeline through a
//! static source, then walks propose → build → promote → validate and climbs
//! the canary ladder `steps` times on one lane.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;

use policyline_core::{BuildOptions, Lane, Proposal, RolloutEvent, Snapshot, ValidationReport};
use policyline_pipeline::{
    DeploymentLedger, DigestCompiler, Pipeline, PipelineSettings, RunId, Stage,
    StaticProposalSource, ValidationGate,
};
use policyline_storage::MemoryStorage;

use crate::config::Config;
use crate::{diff_json, OutputFormat};

pub(crate) struct EvolveArgs {
    pub(crate) seed: Option<PathBuf>,
    pub(crate) proposal: PathBuf,
    pub(crate) lane: Lane,
    pub(crate) steps: u32,
    pub(crate) strict: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct EvolveSummary {
    run: RunId,
    #[serde(flatten)]
    stage: Stage,
    lane: String,
    snapshot: Option<Snapshot>,
    diff: serde_json::Value,
    report: Option<ValidationReport>,
    events: Vec<RolloutEvent>,
}

pub(crate) async fn run(config: &Config, args: EvolveArgs) -> Result<EvolveSummary, String> {
    let proposal: Proposal = crate::read_json(&args.proposal)?;
    let storage = Arc::new(MemoryStorage::new());
    if let Some(path) = &args.seed {
        let seed = crate::seed::read_seed(path)?;
        crate::seed::apply_seed(storage.as_ref(), seed).await?;
    }

    let bootstrap = proposal.base_snapshot_id < 1;
    let intent = if proposal.reason.is_empty() {
        proposal.new_version.clone()
    } else {
        proposal.reason.clone()
    };
    let settings = PipelineSettings {
        build: BuildOptions {
            env: config.pipeline.env.clone(),
            ..BuildOptions::default()
        },
        activated_by: config.pipeline.activated_by.clone(),
    };
    let pipeline = Pipeline::new(
        storage.clone(),
        Arc::new(StaticProposalSource::single(proposal)),
        Box::new(DigestCompiler),
    )
    .with_gate(if args.strict {
        ValidationGate::strict()
    } else {
        ValidationGate::new()
    })
    .with_ledger(
        DeploymentLedger::new(storage).with_max_lane_retries(config.ledger.max_lane_retries),
    )
    .with_settings(settings);

    let run = if bootstrap {
        pipeline.initialize().await
    } else {
        pipeline.start_evolution(&intent).await
    };

    pipeline.propose("").await.map_err(|e| e.to_string())?;
    pipeline.build().await.map_err(|e| e.to_string())?;
    pipeline.promote().await.map_err(|e| e.to_string())?;
    let report = pipeline.validate().await.map_err(|e| e.to_string())?;
    if !report.success() {
        return Err(format!(
            "validation failed; deploy refused:\n  {}",
            report.conflicts.join("\n  ")
        ));
    }

    for _ in 0..args.steps {
        let outcome = pipeline
            .advance(&args.lane)
            .await
            .map_err(|e| e.to_string())?;
        if outcome.current.noop {
            break;
        }
    }

    let events = pipeline
        .ledger()
        .lane_events(&args.lane)
        .await
        .map_err(|e| e.to_string())?;
    Ok(EvolveSummary {
        run,
        stage: pipeline.stage().await,
        lane: args.lane.to_string(),
        snapshot: pipeline.snapshot().await,
        diff: pipeline.diff().await.map_or(serde_json::Value::Null, |d| diff_json(&d)),
        report: Some(report),
        events,
    })
}

pub(crate) fn print_summary(summary: &EvolveSummary, output: OutputFormat, quiet: bool) {
    match output {
        OutputFormat::Json => match serde_json::to_string_pretty(summary) {
            Ok(s) => println!("{}", s),
            Err(e) => crate::fail(&format!("error serializing summary: {}", e), output, quiet),
        },
        OutputFormat::Text => {
            if let Some(snapshot) = &summary.snapshot {
                println!(
                    "run {}: {} (id {}) on {}",
                    summary.run, snapshot.version, snapshot.id, summary.lane
                );
            }
            for event in &summary.events {
                let from = event
                    .from_percent
                    .map_or_else(|| "none".to_string(), |p| format!("{}%", p));
                println!("  {} -> {}%", from, event.to_percent);
            }
            println!("stage: {}", summary.stage);
        }
    }
}

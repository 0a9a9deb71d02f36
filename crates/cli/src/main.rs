mod config;
mod evolve;
mod seed;
mod serve;

use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand, ValueEnum};
use serde::de::DeserializeOwned;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use policyline_core::{
    build_snapshot, calculate_canary_step, BuildOptions, Lane, MissingRule, Proposal, Rule,
    RuleSetDiff, CANARY_LADDER,
};
use policyline_pipeline::ValidationGate;

use crate::config::Config;

/// Output format for CLI responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

/// Policy snapshot evolution and canary deployment.
#[derive(Parser)]
#[command(
    name = "policyline",
    version,
    about = "Policy snapshot evolution and canary deployment"
)]
struct Cli {
    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text", value_enum)]
    output: OutputFormat,

    /// Suppress non-essential output
    #[arg(long, global = true)]
    quiet: bool,

    /// Path to policyline.toml (defaults to $POLICYLINE_CONFIG, then ./policyline.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API server
    Serve {
        /// Port to listen on (overrides the config file)
        #[arg(long)]
        port: Option<u16>,
        /// Seed file with snapshots to pre-load
        #[arg(long)]
        seed: Option<PathBuf>,
    },

    /// Apply a proposal to a base rule set and print the resulting draft
    Build {
        /// Path to the proposal JSON file
        proposal: PathBuf,
        /// JSON array with the rules of the proposal's base snapshot
        #[arg(long)]
        base: Option<PathBuf>,
        /// Fail when MODIFY or DELETE names a rule the base does not contain
        #[arg(long)]
        reject_missing: bool,
    },

    /// Run the validation gate over a JSON array of rules
    Validate {
        /// Path to the rules JSON file
        rules: PathBuf,
        /// Enable every built-in check, not just negative priority
        #[arg(long)]
        strict: bool,
    },

    /// Show the canary ladder, or the rung after a given percent
    Ladder {
        /// Current traffic percent (0-100)
        percent: Option<u8>,
    },

    /// Run a full evolution against an in-memory store
    Evolve {
        /// Seed file with the starting snapshots
        #[arg(long)]
        seed: Option<PathBuf>,
        /// Proposal JSON the evolution applies
        #[arg(long)]
        proposal: PathBuf,
        /// Lane to deploy to, as target/region
        #[arg(long, default_value = "router/global", value_parser = parse_lane)]
        lane: Lane,
        /// Number of canary rungs to climb after validation
        #[arg(long, default_value = "1")]
        steps: u32,
        /// Enable every built-in validation check
        #[arg(long)]
        strict: bool,
    },

    /// Print the effective configuration
    Config,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.quiet);

    match cli.command {
        Commands::Serve { port, seed } => {
            let mut config = load_config(cli.config.as_deref(), cli.output, cli.quiet);
            if let Some(port) = port {
                config.server.port = port;
            }
            let seed = seed.map(|path| match crate::seed::read_seed(&path) {
                Ok(seed) => seed,
                Err(e) => fail(&e, cli.output, cli.quiet),
            });
            if let Err(e) = runtime(cli.output, cli.quiet).block_on(serve::start_server(config, seed))
            {
                fail(&format!("Server error: {}", e), cli.output, cli.quiet);
            }
        }
        Commands::Build {
            proposal,
            base,
            reject_missing,
        } => {
            let config = load_config(cli.config.as_deref(), cli.output, cli.quiet);
            cmd_build(
                &proposal,
                base.as_deref(),
                reject_missing,
                &config,
                cli.output,
                cli.quiet,
            );
        }
        Commands::Validate { rules, strict } => {
            cmd_validate(&rules, strict, cli.output, cli.quiet);
        }
        Commands::Ladder { percent } => {
            cmd_ladder(percent, cli.output, cli.quiet);
        }
        Commands::Evolve {
            seed,
            proposal,
            lane,
            steps,
            strict,
        } => {
            let config = load_config(cli.config.as_deref(), cli.output, cli.quiet);
            let args = evolve::EvolveArgs {
                seed,
                proposal,
                lane,
                steps,
                strict,
            };
            let result = runtime(cli.output, cli.quiet).block_on(evolve::run(&config, args));
            match result {
                Ok(summary) => evolve::print_summary(&summary, cli.output, cli.quiet),
                Err(e) => fail(&e, cli.output, cli.quiet),
            }
        }
        Commands::Config => {
            let config = load_config(cli.config.as_deref(), cli.output, cli.quiet);
            cmd_config(&config, cli.output);
        }
    }
}

/// Install the stderr log subscriber. `POLICYLINE_LOG` takes an `EnvFilter`
/// directive; the default is `info` (`error` with `--quiet`).
fn init_logging(quiet: bool) {
    let default = if quiet { "error" } else { "info" };
    let filter = EnvFilter::try_from_env("POLICYLINE_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();
}

fn runtime(output: OutputFormat, quiet: bool) -> tokio::runtime::Runtime {
    match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => fail(&format!("could not start the async runtime: {}", e), output, quiet),
    }
}

fn load_config(path: Option<&Path>, output: OutputFormat, quiet: bool) -> Config {
    let config = match config::load(path) {
        Ok(c) => c,
        Err(e) => fail(&e, output, quiet),
    };
    if let Err(errors) = config.validate() {
        fail(
            &format!("invalid configuration:\n  {}", errors.join("\n  ")),
            output,
            quiet,
        );
    }
    config
}

fn parse_lane(raw: &str) -> Result<Lane, String> {
    match raw.split_once('/') {
        Some((target, region)) if !target.is_empty() && !region.is_empty() && !region.contains('/') => {
            Ok(Lane::new(target, region))
        }
        _ => Err(format!("expected target/region, got '{}'", raw)),
    }
}

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("error reading file '{}': {}", path.display(), e))?;
    serde_json::from_str(&content)
        .map_err(|e| format!("error parsing JSON in '{}': {}", path.display(), e))
}

pub(crate) fn report_error(msg: &str, output: OutputFormat, quiet: bool) {
    if quiet {
        return;
    }
    match output {
        OutputFormat::Text => eprintln!("{}", msg),
        OutputFormat::Json => eprintln!("{}", serde_json::json!({ "error": msg })),
    }
}

/// Report `msg` and exit with status 1.
pub(crate) fn fail(msg: &str, output: OutputFormat, quiet: bool) -> ! {
    report_error(msg, output, quiet);
    process::exit(1);
}

pub(crate) fn diff_json(diff: &RuleSetDiff) -> serde_json::Value {
    serde_json::json!({
        "added": diff.added,
        "removed": diff.removed,
        "modified": diff.modified,
        "ignored": diff.ignored,
    })
}

// ── Commands ──────────────────────────────────────────────────────────────────

fn cmd_build(
    proposal_path: &Path,
    base_path: Option<&Path>,
    reject_missing: bool,
    config: &Config,
    output: OutputFormat,
    quiet: bool,
) {
    let proposal: Proposal = match read_json(proposal_path) {
        Ok(p) => p,
        Err(e) => fail(&e, output, quiet),
    };
    let mut base: Vec<Rule> = match base_path {
        Some(path) => match read_json(path) {
            Ok(rules) => rules,
            Err(e) => fail(&e, output, quiet),
        },
        None => Vec::new(),
    };
    // The file holds the base snapshot's rules whatever ids they were saved with.
    for rule in &mut base {
        rule.snapshot_id = proposal.base_snapshot_id;
    }

    let options = BuildOptions {
        env: config.pipeline.env.clone(),
        missing_rule: if reject_missing {
            MissingRule::Reject
        } else {
            MissingRule::Ignore
        },
        ..BuildOptions::default()
    };
    let draft = match build_snapshot(&proposal, &base, &options) {
        Ok(d) => d,
        Err(e) => fail(&format!("build failed: {}", e), output, quiet),
    };

    match output {
        OutputFormat::Json => {
            let doc = serde_json::json!({
                "snapshot": draft.snapshot,
                "rules": draft.rules,
                "diff": diff_json(&draft.diff),
            });
            match serde_json::to_string_pretty(&doc) {
                Ok(s) => println!("{}", s),
                Err(e) => fail(&format!("error serializing draft: {}", e), output, quiet),
            }
        }
        OutputFormat::Text => {
            if !quiet {
                println!(
                    "built {} ({} rules, checksum {})",
                    draft.snapshot.version,
                    draft.rules.len(),
                    draft.snapshot.checksum.as_deref().unwrap_or("-")
                );
            }
            if draft.diff.is_empty() && draft.diff.ignored.is_empty() {
                println!("no changes");
            } else {
                println!("{}", draft.diff.to_text());
            }
        }
    }
}

fn cmd_validate(rules_path: &Path, strict: bool, output: OutputFormat, quiet: bool) {
    let rules: Vec<Rule> = match read_json(rules_path) {
        Ok(r) => r,
        Err(e) => fail(&e, output, quiet),
    };
    let gate = if strict {
        ValidationGate::strict()
    } else {
        ValidationGate::new()
    };
    let report = gate.run(0, &rules);

    match output {
        OutputFormat::Json => println!(
            "{}",
            serde_json::json!({
                "valid": report.success(),
                "passed": report.passed,
                "failed": report.failed,
                "conflicts": report.conflicts,
                "simulationScore": report.simulation_score,
            })
        ),
        OutputFormat::Text => {
            if report.success() {
                if !quiet {
                    println!("valid ({} rules)", report.passed);
                }
            } else {
                println!("{} of {} rules failed:", report.failed, rules.len());
                for conflict in &report.conflicts {
                    println!("  {}", conflict);
                }
            }
        }
    }
    if !report.success() {
        process::exit(1);
    }
}

fn cmd_ladder(percent: Option<u8>, output: OutputFormat, quiet: bool) {
    match percent {
        Some(current) if current > 100 => fail(
            &format!("percent must be between 0 and 100, got {}", current),
            output,
            quiet,
        ),
        Some(current) => {
            let next = calculate_canary_step(current);
            match output {
                OutputFormat::Text => println!("{} -> {}", current, next),
                OutputFormat::Json => {
                    println!("{}", serde_json::json!({ "current": current, "next": next }))
                }
            }
        }
        None => match output {
            OutputFormat::Text => {
                let rungs: Vec<String> = CANARY_LADDER.iter().map(|r| r.to_string()).collect();
                println!("{}", rungs.join(" -> "));
            }
            OutputFormat::Json => println!("{}", serde_json::json!({ "ladder": CANARY_LADDER })),
        },
    }
}

fn cmd_config(config: &Config, output: OutputFormat) {
    match output {
        OutputFormat::Json => println!("{}", serde_json::json!(config)),
        OutputFormat::Text => match toml::to_string(config) {
            Ok(s) => print!("{}", s),
            Err(e) => fail(&format!("error rendering config: {}", e), output, false),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lane_argument_parsing() {
        assert_eq!(parse_lane("router/global"), Ok(Lane::new("router", "global")));
        assert!(parse_lane("router").is_err());
        assert!(parse_lane("/global").is_err());
        assert!(parse_lane("a/b/c").is_err());
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}

use std::fs;
use std::path::Path;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::{error, info, warn};

use icp_query::config::Config;
use icp_query::credentials::{CredentialSource, Negotiator};
use icp_query::dispatcher::{Dispatcher, Pacing};
use icp_query::error::QueryError;
use icp_query::models::{parse_service_types, QueryTarget};
use icp_query::onnx::{OnnxDetectionModel, OnnxSimilarityModel};
use icp_query::proxy::ProxyPool;
use icp_query::sink::{self, ResultSet};
use icp_query::transport::HttpTransport;
use icp_query::vision::Solver;

#[derive(Parser, Debug)]
#[command(name = "icp-query", about = "ICP record lookup with captcha solving and proxy rotation")]
struct Args {
    /// Unit name to query
    unit_name: Option<String>,

    /// Batch file with one unit name per line
    #[arg(short, long)]
    file: Option<String>,

    /// Output xlsx path (default: timestamped name in the working dir)
    #[arg(short, long)]
    output: Option<String>,

    /// Service type: web, app, miniapp, quickapp or all
    #[arg(short = 't', long = "type", default_value = "web")]
    service_type: String,

    /// Rotate to the next proxy every N requests; without this all
    /// traffic is sent direct even if a proxy list exists
    #[arg(short = 'p', long = "proxy-rotate", default_value_t = 0)]
    proxy_rotate: u32,
}

fn load_units(args: &Args) -> anyhow::Result<Vec<String>> {
    if let Some(path) = &args.file {
        let content = fs::read_to_string(path).with_context(|| format!("reading {}", path))?;
        let units: Vec<String> = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        anyhow::ensure!(!units.is_empty(), "batch file {} is empty", path);
        return Ok(units);
    }
    if let Some(name) = &args.unit_name {
        return Ok(vec![name.clone()]);
    }
    anyhow::bail!("provide a unit name or --file");
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<ExitCode> {
    let cfg = Config::load();
    let service_types = parse_service_types(&args.service_type)
        .with_context(|| format!("unknown service type '{}'", args.service_type))?;
    let units = load_units(&args)?;
    let targets: Vec<QueryTarget> = units
        .into_iter()
        .map(|name| QueryTarget { name, service_types: service_types.clone() })
        .collect();

    let mut pool = ProxyPool::load(&cfg.proxy_file, args.proxy_rotate)
        .with_context(|| format!("loading proxies from {}", cfg.proxy_file))?;
    if pool.is_empty() {
        info!("no proxies configured, all traffic goes direct");
    }

    let detector = OnnxDetectionModel::load(&cfg.detect_model_path)
        .with_context(|| format!("loading {}", cfg.detect_model_path))?;
    let matcher = OnnxSimilarityModel::load(&cfg.match_model_path)
        .with_context(|| format!("loading {}", cfg.match_model_path))?;
    let solver = Solver::new(Box::new(detector), Box::new(matcher));

    let timeout = Duration::from_secs(cfg.timeout_secs);
    let mut negotiator = Negotiator::new(HttpTransport::new(timeout)?, solver);
    negotiator
        .refresh()
        .await
        .context("initial credential negotiation failed")?;

    let mut transport = HttpTransport::new(timeout)?;

    // stop issuing requests on Ctrl-C, but still flush what we have
    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, finishing up and saving results");
                cancel.store(true, Ordering::Relaxed);
            }
        });
    }

    let mut results = ResultSet::new();
    let mut exit = ExitCode::SUCCESS;

    'targets: for (idx, target) in targets.iter().enumerate() {
        info!("querying {}/{}: {}", idx + 1, targets.len(), target.name);
        for service_type in &target.service_types {
            if cancel.load(Ordering::Relaxed) {
                break 'targets;
            }
            let mut dispatcher = Dispatcher::new(
                &mut transport,
                &mut negotiator,
                &mut pool,
                Pacing::from_config(&cfg),
                cancel.clone(),
            );
            match dispatcher.query_pair(&target.name, *service_type).await {
                Ok(records) => {
                    info!(
                        "{} {} record(s) for {}",
                        records.len(),
                        service_type.label(),
                        target.name
                    );
                    results.push(*service_type, records);
                }
                Err(QueryError::Cancelled) => break 'targets,
                Err(e) if e.is_fatal() => {
                    error!("fatal: {}", e);
                    exit = ExitCode::FAILURE;
                    break 'targets;
                }
                Err(e) => {
                    warn!("{} query for {} failed: {}", service_type.label(), target.name, e);
                }
            }
        }
    }

    let output = args.output.clone().unwrap_or_else(sink::default_filename);
    sink::write_workbook(&results, Path::new(&output))
        .with_context(|| format!("writing {}", output))?;

    Ok(exit)
}

//! metagate - routing and connection pooling for directory proxies
//!
//! Operator front end: validates a target table, shows how a request would be
//! routed and checks that every target can be reached.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::{error, info, warn};

use metagate::{
    config::{Args, Command, OpArg},
    logging,
    pool::IdentityKey,
    target::{QuarantineStatus, TargetSummary},
    transport::LdapConnector,
    Dn, MetaBackend, MetaConfig, OperationKind, RoutingRequest, Scope, TargetRegistry,
};

#[derive(Serialize)]
struct RouteReport {
    dn: String,
    mode: String,
    candidates: Vec<CandidateReport>,
}

#[derive(Serialize)]
struct CandidateReport {
    index: usize,
    name: String,
    error: Option<String>,
}

#[derive(Serialize)]
struct PingReport {
    index: usize,
    name: String,
    ok: bool,
    error: Option<String>,
    quarantine: QuarantineStatus,
    checked_at: chrono::DateTime<chrono::Utc>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    logging::init(&args.log_level, args.log_json).context("failed to initialize logging")?;

    let config = match MetaConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load {}: {}", args.config.display(), e);
            std::process::exit(1);
        }
    };
    let registry = match TargetRegistry::from_config(&config) {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    info!("======================================");
    info!("  metagate - directory routing engine");
    info!("======================================");
    info!("Config: {}", args.config.display());
    info!("Targets: {}", registry.len());
    info!("On error: {:?}", registry.on_error);
    info!("Proxy authz: {:?}", registry.proxy_authz);
    info!("======================================");

    match args.command.clone().unwrap_or(Command::Check) {
        Command::Check => print_targets(&registry.summaries(), args.json)?,
        Command::Route {
            op,
            dn,
            new_parent,
            scope,
        } => {
            let backend = MetaBackend::new(Arc::clone(&registry), Arc::new(LdapConnector::new()));
            route(&backend, op, &dn, new_parent.as_deref(), &scope, args.json).await?;
        }
        Command::Ping => {
            let backend = MetaBackend::new(Arc::clone(&registry), Arc::new(LdapConnector::new()));
            let healthy = ping(&backend, args.json).await?;
            if !healthy {
                std::process::exit(2);
            }
        }
    }

    Ok(())
}

fn print_targets(summaries: &[TargetSummary], json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summaries)?);
        return Ok(());
    }
    for t in summaries {
        println!(
            "[{}] {:<16} {} (scope {:?}) quarantine={} idassert={}",
            t.index, t.name, t.suffix, t.scope, t.quarantine, t.idassert
        );
        for uri in &t.uris {
            println!("      {}", uri);
        }
    }
    Ok(())
}

async fn route(
    backend: &MetaBackend,
    op: OpArg,
    dn: &str,
    new_parent: Option<&str>,
    scope: &str,
    json: bool,
) -> anyhow::Result<()> {
    let scope: Scope = scope.parse()?;
    let kind = match op {
        OpArg::Add => OperationKind::Add,
        OpArg::Delete => OperationKind::Delete,
        OpArg::Modify => OperationKind::Modify,
        OpArg::Compare => OperationKind::Compare,
        OpArg::Rename => OperationKind::Rename,
        OpArg::Search => OperationKind::Search { scope },
        OpArg::Bind => OperationKind::Bind { as_root: false },
        OpArg::RootBind => OperationKind::Bind { as_root: true },
    };

    let mut req = RoutingRequest::new(kind, Dn::parse(dn)?);
    if let Some(parent) = new_parent {
        req = req.with_new_parent(Dn::parse(parent)?);
    }

    let set = match backend.select_candidates(&req).await {
        Ok(set) => set,
        Err(e) => {
            warn!("Routing failed: {}", e);
            println!("error: {} ({})", e, e.result_code());
            return Ok(());
        }
    };

    let report = RouteReport {
        dn: req.dn.to_string(),
        mode: format!("{:?}", set.mode()),
        candidates: set
            .candidates()
            .into_iter()
            .map(|idx| CandidateReport {
                index: idx,
                name: backend
                    .registry()
                    .get(idx)
                    .map(|t| t.name.clone())
                    .unwrap_or_default(),
                error: set
                    .slot(idx)
                    .and_then(|s| s.error.as_ref())
                    .map(|e| e.to_string()),
            })
            .collect(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{} -> {}", report.dn, report.mode);
        for c in &report.candidates {
            match &c.error {
                Some(e) => println!("  [{}] {} ({})", c.index, c.name, e),
                None => println!("  [{}] {}", c.index, c.name),
            }
        }
    }
    Ok(())
}

/// Bring up a privileged session to every target; true when all succeeded
async fn ping(backend: &MetaBackend, json: bool) -> anyhow::Result<bool> {
    let lease = backend.pool().acquire(IdentityKey::privileged(), false);
    let mut reports = Vec::with_capacity(backend.registry().len());

    for target in backend.registry().iter() {
        let result = backend.ensure_bound(&lease, target.index).await;
        reports.push(PingReport {
            index: target.index,
            name: target.name.clone(),
            ok: result.is_ok(),
            error: result.err().map(|e| e.to_string()),
            quarantine: backend.quarantine().status(target.index),
            checked_at: chrono::Utc::now(),
        });
    }
    backend.release_pool(lease);

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        for r in &reports {
            match &r.error {
                None => println!("[{}] {:<16} ok", r.index, r.name),
                Some(e) => println!("[{}] {:<16} FAILED: {} ({:?})", r.index, r.name, e, r.quarantine),
            }
        }
    }
    Ok(reports.iter().all(|r| r.ok))
}

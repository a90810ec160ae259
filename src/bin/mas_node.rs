// bin/mas_node.rs - MAS Platform Node Binary

use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use mas_platform::acl::now_ms;
use mas_platform::agents::{EchoExpert, Presenter, Specialist};
use mas_platform::bus::{Endpoint, InMemoryBus};
use mas_platform::config::PlatformConfig;
use mas_platform::coordinator::{Coordinator, HttpSelector, NoSelector, Selector};
use mas_platform::kb::{KbAgent, KbStore};
use mas_platform::observability::{
    MetricsConfig, TracingConfig, TracingFormat, init_metrics, init_tracing,
};
use mas_platform::platform::{AgentProfile, DfAgent};

/// MAS Platform Node
#[derive(Parser, Debug)]
#[command(name = "mas-node")]
#[command(author = "SavageS")]
#[command(version)]
#[command(about = "Runs the full multi-agent platform on an in-process bus", long_about = None)]
struct Args {
    /// Config file path (TOML, layered under environment variables)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// KB database path; ":memory:" keeps it in-process
    #[arg(short, long, default_value = "./data/kb.sqlite")]
    db: String,

    /// Number of demo specialists to spawn
    #[arg(long, default_value = "1")]
    specialists: usize,

    /// Selector service URL; deterministic fallback selection when omitted
    #[arg(long)]
    selector_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format (pretty, compact, json)
    #[arg(long, default_value = "pretty")]
    log_format: String,

    /// Enable metrics server
    #[arg(long)]
    metrics: bool,

    /// Metrics listen address
    #[arg(long, default_value = "0.0.0.0:9108")]
    metrics_addr: String,

    /// Read questions from stdin as a presenter session
    #[arg(short, long)]
    interactive: bool,
}

const DF_JID: &str = "df@mas";
const KB_JID: &str = "kb@mas";
const COORDINATOR_JID: &str = "coordinator@mas";

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let tracing_config = TracingConfig {
        filter: format!("{},mas_platform={}", args.log_level, args.log_level),
        format: match args.log_format.as_str() {
            "json" => TracingFormat::Json,
            "compact" => TracingFormat::Compact,
            _ => TracingFormat::Pretty,
        },
        with_span_events: args.log_level == "trace",
        with_target: true,
        with_ansi: args.log_format != "json",
    };
    init_tracing(tracing_config);

    let cfg = PlatformConfig::load(args.config.as_deref())?;
    info!("Starting MAS platform node");

    let _metrics_handle = if args.metrics {
        let metrics_addr: SocketAddr = args.metrics_addr.parse()?;
        match init_metrics(MetricsConfig {
            listen_addr: metrics_addr,
            ..Default::default()
        }) {
            Ok(handle) => {
                info!(addr = %metrics_addr, "Metrics recorder initialized");
                Some(handle)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to initialize metrics");
                None
            }
        }
    } else {
        None
    };

    let store = if args.db == ":memory:" {
        KbStore::open_in_memory()?
    } else {
        let path = PathBuf::from(&args.db);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
                info!(path = ?parent, "Created data directory");
            }
        }
        KbStore::open(&path)?
    };

    let bus = InMemoryBus::new();

    let df = DfAgent::new(Endpoint::attach(bus.clone(), DF_JID), &cfg);
    tokio::spawn(df.run());

    let kb = KbAgent::new(
        Endpoint::attach(bus.clone(), KB_JID),
        store,
        COORDINATOR_JID,
        &cfg,
    )
    .with_df(DF_JID);
    tokio::spawn(kb.run());

    let selector: Arc<dyn Selector> = match &args.selector_url {
        Some(url) => {
            info!(url = %url, "Using external selector");
            Arc::new(HttpSelector::new(url.clone()))
        }
        None => Arc::new(NoSelector),
    };
    let coordinator = Coordinator::new(
        Endpoint::attach(bus.clone(), COORDINATOR_JID),
        cfg.clone(),
        DF_JID,
        KB_JID,
        selector,
    );
    tokio::spawn(coordinator.run());

    for i in 0..args.specialists {
        let jid = format!("expert{i}@mas");
        let profile = AgentProfile::new(jid.as_str())
            .with_capability(cfg.need_cap.as_str())
            .with_description("demo echo specialist");
        let specialist = Specialist::new(
            Endpoint::attach(bus.clone(), jid.as_str()),
            DF_JID,
            profile,
            Arc::new(EchoExpert),
            &cfg,
        );
        tokio::spawn(specialist.run());
        info!(jid = %jid, "Spawned specialist");
    }

    if args.interactive {
        // give registrations a moment to land before the first question
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let session = format!("sess-{}", now_ms());
        let presenter = Presenter::new(
            Endpoint::attach(bus.clone(), "presenter@mas"),
            COORDINATOR_JID,
            session.as_str(),
            &cfg,
        );
        info!(session = %session, "Interactive session ready; type a question, or 'exit'");

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            let question = line.trim();
            if question.is_empty() {
                continue;
            }
            if question == "exit" || question == "quit" {
                break;
            }
            match presenter.ask(question).await {
                Ok(answer) => println!("{answer}"),
                Err(e) => println!("!! {e}"),
            }
        }
        info!("Interactive session closed");
    } else {
        info!("Press Ctrl+C to shutdown");
        tokio::signal::ctrl_c().await?;
        info!("Received shutdown signal");
    }

    info!("Shutting down...");
    Ok(())
}

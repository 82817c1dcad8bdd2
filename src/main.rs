use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use hostwatch_rs::config::ConsoleConfig;
use hostwatch_rs::controller::{ScanEvent, ScanJobController};
use hostwatch_rs::health::HealthPoller;
use hostwatch_rs::history::SecurityDashboard;
use hostwatch_rs::quick::QuickCheckRunner;
use hostwatch_rs::server;
use hostwatch_rs::service::ApiClient;
use hostwatch_rs::types::{HealthResult, NormalizedScan, ScanKind};

/// hostwatch: security scans and health checks against the monitoring API.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "hostwatch",
    version,
    about = "Run security scans and health checks against the infrastructure monitoring API.",
    long_about = None
)]
struct Cli {
    /// Monitoring API base URL (overrides HOSTWATCH_API_URL and the config file).
    #[arg(long = "api-url", global = true)]
    api_url: Option<String>,

    /// Bearer token for the monitoring API.
    #[arg(long, global = true)]
    token: Option<String>,

    /// Print results as pretty JSON instead of tables.
    #[arg(long, global = true, default_value_t = false)]
    json: bool,

    /// More log output (-v debug, -vv trace). RUST_LOG takes precedence.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Submit a full scan and wait for its result.
    Scan { target: String },
    /// Run a quick scan.
    Quick { target: String },
    /// Show scan history and the latest completed result for a target.
    History { target: String },
    /// Check one host's reachability.
    Check { target: String },
    /// Check several hosts with one batch call (all hosts when none given).
    CheckAll { targets: Vec<String> },
    /// Serve the console API.
    Serve {
        /// Listen address (overrides HOSTWATCH_BIND).
        #[arg(long)]
        bind: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = ConsoleConfig::load()?;
    if let Some(url) = cli.api_url.clone() {
        config.client.base_url = url;
    }
    if let Some(token) = cli.token.clone() {
        config.client.token = Some(token);
    }

    let client = Arc::new(ApiClient::new(&config.client)?);

    match cli.command {
        Command::Scan { ref target } => {
            let controller = ScanJobController::new(client, config.poll);
            let mut handle = controller.start(target, ScanKind::Full).await?;
            let cancel = handle.cancel_token();
            info!(scan_id = handle.id(), "waiting for scan (Ctrl+C stops waiting)");
            loop {
                tokio::select! {
                    ev = handle.next_event() => match ev {
                        Some(ScanEvent::Progress { attempts, status }) => {
                            let status = status.map(|s| s.as_str()).unwrap_or("unreachable");
                            eprintln!("  check {attempts}/{}: {status}", config.poll.max_attempts);
                        }
                        Some(_) | None => break,
                    },
                    _ = tokio::signal::ctrl_c() => {
                        cancel.cancel();
                        break;
                    }
                }
            }
            let scan = handle.wait().await?;
            emit(cli.json, &*scan, print_scan)?;
        }
        Command::Quick { ref target } => {
            let scan = QuickCheckRunner::new(client).run(target).await?;
            emit(cli.json, &scan, print_scan)?;
        }
        Command::History { ref target } => {
            let dashboard = SecurityDashboard::load(client.as_ref(), target).await?;
            emit(cli.json, &dashboard, print_dashboard)?;
        }
        Command::Check { ref target } => {
            let result = HealthPoller::new(client).check_one(target).await?;
            emit(cli.json, std::slice::from_ref(&result), print_health_table)?;
        }
        Command::CheckAll { ref targets } => {
            let results = HealthPoller::new(client).check_all(targets).await?;
            emit(cli.json, results.as_slice(), print_health_table)?;
        }
        Command::Serve { bind } => {
            if let Some(bind) = bind {
                config.bind = bind;
            }
            server::spawn_server(&config).await?;
        }
    }

    Ok(())
}

fn init_logging(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| match verbosity {
        0 => EnvFilter::new("hostwatch=info,hostwatch_rs=info"),
        1 => EnvFilter::new("hostwatch=debug,hostwatch_rs=debug,tower_http=debug"),
        _ => EnvFilter::new("trace"),
    });

    // Logs go to stderr so `--json` output stays machine readable.
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

fn emit<T: Serialize + ?Sized>(json: bool, value: &T, table: impl Fn(&T)) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        table(value);
    }
    Ok(())
}

fn snip(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

fn print_scan(scan: &NormalizedScan) {
    if scan.is_fallback() {
        println!("\nNo usable result data was returned for this scan.");
        return;
    }
    println!(
        "\nScan {}  risk: {}  findings: {}",
        scan.scan_id.as_deref().unwrap_or("-"),
        scan.risk_level,
        scan.vulnerabilities.len()
    );
    if let Some(msg) = &scan.error_message {
        println!("Service note: {msg}");
    }

    let sev_w = "severity".len();
    let port_w = 5usize;
    let mut kind_w = "type".len();
    for f in &scan.vulnerabilities {
        kind_w = kind_w.max(f.kind.chars().count().min(24));
    }
    let desc_w = 60usize;

    if !scan.vulnerabilities.is_empty() {
        println!(
            "\n{:<sev_w$}  {:>port_w$}  {:<kind_w$}  {:<desc_w$}",
            "severity", "port", "type", "description"
        );
        println!(
            "{:-<sev_w$}  {:-<port_w$}  {:-<kind_w$}  {:-<desc_w$}",
            "", "", "", ""
        );
        for f in &scan.vulnerabilities {
            let port = f.port.map(|p| p.to_string()).unwrap_or_else(|| "-".into());
            println!(
                "{:<sev_w$}  {:>port_w$}  {:<kind_w$}  {:<desc_w$}",
                f.severity.as_str(),
                port,
                snip(&f.kind, kind_w),
                snip(&f.description, desc_w)
            );
        }
    }

    print_preview("Open ports", &scan.open_ports.items, scan.open_ports.hidden());
    print_preview("Services", &scan.services.items, scan.services.hidden());

    if !scan.checks.is_empty() {
        println!("\nChecks:");
        for c in &scan.checks {
            let mut line = format!("  {:<16} risk {}", c.name, c.risk);
            if let Some(secure) = c.secure {
                line.push_str(if secure { "  secure" } else { "  insecure" });
            }
            if let Some(protocol) = &c.protocol {
                line.push_str(&format!("  {protocol}"));
            }
            if let Some(err) = &c.error {
                line.push_str(&format!("  error: {}", snip(err, 40)));
            }
            println!("{line}");
        }
    }

    let critical = &scan.critical_vulnerabilities;
    if !critical.is_empty() {
        println!("\nCritical vulnerabilities ({}):", critical.total);
        for f in &critical.items {
            println!("  {}", snip(&f.description, 70));
        }
        if critical.hidden() > 0 {
            println!("  ... and {} more", critical.hidden());
        }
    }

    match (scan.scan_duration, &scan.scan_type) {
        (Some(secs), Some(kind)) => println!("\nScan type {kind}, took {secs}s"),
        (Some(secs), None) => println!("\nScan took {secs}s"),
        (None, Some(kind)) => println!("\nScan type {kind}"),
        (None, None) => {}
    }

    if !scan.recommendations.is_empty() {
        println!("\nRecommendations:");
        for r in &scan.recommendations {
            println!("  [{}] {}: {}", r.priority, r.category, r.action);
        }
    }
}

fn print_preview(title: &str, items: &[String], hidden: usize) {
    if items.is_empty() {
        return;
    }
    let more = if hidden > 0 {
        format!(" (+{hidden} more)")
    } else {
        String::new()
    };
    println!("\n{title}: {}{more}", items.join(", "));
}

fn print_dashboard(dashboard: &SecurityDashboard) {
    let c = dashboard.counts;
    println!(
        "Target {}: {} scans  critical {}  high {}  medium {}  low {}",
        dashboard.target_id,
        dashboard.history.len(),
        c.critical,
        c.high,
        c.medium,
        c.low
    );
    if !dashboard.history.is_empty() {
        println!(
            "\n{:<10}  {:<6}  {:<12}  {:<8}  {:>5}  {:<25}",
            "id", "kind", "status", "risk", "vulns", "started"
        );
        println!("{:-<10}  {:-<6}  {:-<12}  {:-<8}  {:-<5}  {:-<25}", "", "", "", "", "", "");
        for e in &dashboard.history {
            let marker = if dashboard.selected_scan_id.as_deref() == Some(e.id.as_str()) {
                "*"
            } else {
                ""
            };
            println!(
                "{:<10}  {:<6}  {:<12}  {:<8}  {:>5}  {:<25}",
                format!("{}{marker}", e.id),
                format!("{:?}", e.kind).to_lowercase(),
                format!("{:?}", e.status).to_lowercase(),
                e.risk_level.map(|r| r.as_str()).unwrap_or("-"),
                e.vulnerability_count,
                e.started_at.as_deref().unwrap_or("-")
            );
        }
    }
    match &dashboard.current {
        Some(scan) => print_scan(scan),
        None => println!("\nNo completed scan to show."),
    }
    if !dashboard.recommendations.is_empty() {
        println!("\nTarget recommendations:");
        for r in &dashboard.recommendations {
            println!("  [{}] {}: {}", r.priority, r.category, r.action);
        }
    }
}

fn print_health_table(results: &[HealthResult]) {
    let mut id_w = "target".len();
    for r in results {
        id_w = id_w.max(r.target_id.len());
    }
    println!("{:<id_w$}  {:<8}  {:>8}  {:<25}", "target", "status", "ms", "checked");
    println!("{:-<id_w$}  {:-<8}  {:-<8}  {:-<25}", "", "", "", "");
    for r in results {
        let ms = r
            .response_time_ms
            .map(|ms| ms.to_string())
            .unwrap_or_else(|| "-".into());
        let status = format!("{:?}", r.status).to_lowercase();
        println!("{:<id_w$}  {:<8}  {:>8}  {:<25}", r.target_id, status, ms, r.checked_at);
    }
}

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use caldera_api::{Dashboard, DashboardConfig, EditEvent, EventOutcome, Representation, View, ViewRequest};
use caldera_core::columns::{self, Column};
use caldera_core::prelude::*;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use regex::Regex;
use serde_json::Value as Json;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "calderactl", version, about = "Browse and edit Volcano jobs, queues, pods and pod groups")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Rows per page
    #[arg(long = "page-size", env = "CALDERA_PAGE_SIZE", global = true)]
    page_size: Option<usize>,

    /// Auto-refresh period while watching (0 disables)
    #[arg(long = "refresh-secs", env = "CALDERA_REFRESH_SECS", global = true)]
    refresh_secs: Option<u64>,

    /// Delay before the confirmatory refetch after a mutation
    #[arg(long = "confirm-delay-ms", env = "CALDERA_CONFIRM_DELAY_MS", global = true)]
    confirm_delay_ms: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// List one kind: job, queue, pod or podgroup
    Ls {
        kind: ResourceKind,
        #[arg(long = "ns")]
        namespace: Option<String>,
        #[arg(long)]
        queue: Option<String>,
        /// Phase filter, e.g. Running
        #[arg(long)]
        status: Option<String>,
        /// Case-insensitive name substring
        #[arg(long)]
        search: Option<String>,
        /// Column to sort by (default: age, newest first)
        #[arg(long)]
        sort: Option<Column>,
        #[arg(long, action = ArgAction::SetTrue)]
        asc: bool,
        #[arg(long, default_value_t = 1)]
        page: usize,
        /// Keep the view live until Ctrl-C
        #[arg(long, action = ArgAction::SetTrue)]
        watch: bool,
    },
    /// Print an object's manifest
    Get {
        kind: ResourceKind,
        name: String,
        #[arg(long = "ns")]
        namespace: Option<String>,
    },
    Delete {
        kind: ResourceKind,
        name: String,
        #[arg(long = "ns")]
        namespace: Option<String>,
    },
    /// Edit fields with --set path=value, or replace the manifest text with --file
    Edit {
        kind: ResourceKind,
        name: String,
        #[arg(long = "ns")]
        namespace: Option<String>,
        #[arg(long = "set", value_name = "PATH=VALUE")]
        set: Vec<String>,
        #[arg(long = "file", conflicts_with = "set")]
        file: Option<PathBuf>,
    },
    /// Create an object from a YAML file
    Create {
        kind: ResourceKind,
        #[arg(long = "file")]
        file: PathBuf,
        #[arg(long = "ns")]
        namespace: Option<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("CALDERA_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("CALDERA_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid CALDERA_METRICS_ADDR; expected host:port");
        }
    }
}

fn config(cli: &Cli) -> DashboardConfig {
    let mut cfg = DashboardConfig::from_env();
    if let Some(n) = cli.page_size {
        cfg.page_size = n.max(1);
    }
    if let Some(secs) = cli.refresh_secs {
        cfg.refresh = (secs > 0).then(|| Duration::from_secs(secs));
    }
    if let Some(ms) = cli.confirm_delay_ms {
        cfg.confirm_delay = Duration::from_millis(ms).min(caldera_ops::MAX_CONFIRM_DELAY);
    }
    cfg
}

fn key_for(kind: ResourceKind, namespace: Option<&str>, name: &str) -> ResourceKey {
    let ns = if kind.namespaced() { namespace.unwrap_or("default") } else { "" };
    ResourceKey::new(kind, ns, name)
}

/// `path=value`; the value is read as JSON when it parses, else as a plain string.
fn parse_assignment(re: &Regex, raw: &str) -> Result<(String, Json)> {
    let caps = re.captures(raw).ok_or_else(|| anyhow!("expected PATH=VALUE, got {:?}", raw))?;
    let path = caps["path"].trim().to_string();
    let value = &caps["value"];
    let json = serde_json::from_str::<Json>(value).unwrap_or_else(|_| Json::String(value.to_string()));
    Ok((path, json))
}

fn read_manifest_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn print_view(view: &View, output: Output) -> Result<()> {
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(view)?),
        Output::Human => {
            let cols = columns::columns_for(view.query.kind);
            let header: Vec<String> = cols.iter().map(|c| format!("{:<w$}", c.label(), w = c.width())).collect();
            println!("{}", header.join(" ").trim_end());
            let now = chrono::Utc::now();
            for r in &view.window.rows {
                let mut cells: Vec<String> = cols.iter().map(|c| format!("{:<w$}", columns::render(r, *c, now), w = c.width())).collect();
                if view.pending.contains(&r.key()) {
                    cells.push("(pending)".into());
                }
                println!("{}", cells.join(" ").trim_end());
            }
            println!(
                "page {}/{} • {} total",
                view.window.page,
                view.window.total_pages.max(1),
                view.window.total_count
            );
        }
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let dash = Dashboard::connect(config(&cli)).await?;

    let res = run(&cli, &dash).await;
    dash.shutdown();
    if let Err(e) = &res {
        warn!(error = %e, "command failed");
    }
    res
}

async fn run(cli: &Cli, dash: &Dashboard) -> Result<()> {
    match &cli.command {
        Commands::Ls { kind, namespace, queue, status, search, sort, asc, page, watch } => {
            let mut filter = FilterState::new();
            if let Some(ns) = namespace {
                filter.set(FilterDimension::Namespace, ns.clone());
            }
            if let Some(q) = queue {
                filter.set(FilterDimension::Queue, q.clone());
            }
            if let Some(s) = status {
                filter.set(FilterDimension::Status, s.clone());
            }
            if let Some(s) = search {
                filter.set_search(s.clone());
            }
            let direction = if *asc { SortDirection::Asc } else { SortDirection::Desc };
            let sort = SortState::by(sort.unwrap_or(Column::Created), direction);
            let req = ViewRequest::new(*kind).filter(filter).sort(sort).page(*page, None);
            info!(kind = %kind, page, watch, "ls invoked");
            print_view(&dash.view(&req).await?, cli.output)?;
            if !*watch {
                return Ok(());
            }

            let sub = dash.watch(Some(*kind)).await?;
            let mut epoch = dash.cache().subscribe();
            loop {
                tokio::select! {
                    changed = epoch.changed() => {
                        if changed.is_err() { break; }
                        let Some(q) = dash.active_query() else { continue };
                        // render only once the active slot has been refetched
                        if dash.cache().get(&q).is_none() { continue; }
                        println!();
                        print_view(&dash.view(&req).await?, cli.output)?;
                    }
                    _ = signal::ctrl_c() => {
                        info!("Ctrl-C received; shutting down watch");
                        break;
                    }
                }
            }
            sub.shutdown().await;
        }
        Commands::Get { kind, name, namespace } => {
            let key = key_for(*kind, namespace.as_deref(), name);
            match cli.output {
                Output::Human => print!("{}", dash.manifest_text(&key).await?),
                Output::Json => println!("{}", serde_json::to_string_pretty(&dash.manifest(&key).await?)?),
            }
        }
        Commands::Delete { kind, name, namespace } => {
            let key = key_for(*kind, namespace.as_deref(), name);
            dash.delete(&key).await?;
            println!("{} deleted", key);
        }
        Commands::Edit { kind, name, namespace, set, file } => {
            let key = key_for(*kind, namespace.as_deref(), name);
            let mut editor = dash.open_editor(&key).await?;
            if let Some(path) = file {
                editor.switch_to(Representation::Text)?;
                if editor.apply(EditEvent::text(read_manifest_file(path)?))? == EventOutcome::Invalid {
                    bail!("{}: {}", path.display(), editor.draft().last_error.clone().unwrap_or_default());
                }
            } else if set.is_empty() {
                bail!("nothing to edit: pass --set PATH=VALUE or --file");
            } else {
                let re = Regex::new(r"^(?P<path>[^=]+)=(?P<value>.*)$")?;
                for raw in set {
                    let (path, value) = parse_assignment(&re, raw)?;
                    editor.apply(EditEvent::form(path, value))?;
                }
            }
            match dash.submit(&editor).await? {
                Some(r) => match cli.output {
                    Output::Human => println!("{} edited", r.key()),
                    Output::Json => println!("{}", serde_json::to_string_pretty(&r)?),
                },
                None => println!("{} unchanged", key),
            }
        }
        Commands::Create { kind, file, namespace } => {
            let mut editor = dash.new_editor(*kind, namespace.as_deref());
            editor.switch_to(Representation::Text)?;
            if editor.apply(EditEvent::text(read_manifest_file(file)?))? == EventOutcome::Invalid {
                bail!("{}: {}", file.display(), editor.draft().last_error.clone().unwrap_or_default());
            }
            let created = dash.submit(&editor).await?.ok_or_else(|| anyhow!("server returned no object"))?;
            match cli.output {
                Output::Human => println!("{} created", created.key()),
                Output::Json => println!("{}", serde_json::to_string_pretty(&created)?),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assignments_parse_json_or_fall_back_to_string() {
        let re = Regex::new(r"^(?P<path>[^=]+)=(?P<value>.*)$").unwrap();
        assert_eq!(parse_assignment(&re, "spec.minAvailable=3").unwrap(), ("spec.minAvailable".to_string(), serde_json::json!(3)));
        assert_eq!(parse_assignment(&re, "metadata.labels.tier=gold").unwrap().1, serde_json::json!("gold"));
        assert_eq!(parse_assignment(&re, "spec.reclaimable=false").unwrap().1, serde_json::json!(false));
        assert!(parse_assignment(&re, "novalue").is_err());
    }

    #[test]
    fn cluster_scoped_keys_drop_namespace() {
        assert_eq!(key_for(ResourceKind::Queue, Some("ml"), "gpu").namespace, "");
        assert_eq!(key_for(ResourceKind::Job, None, "j").namespace, "default");
    }

    #[test]
    fn cli_parses_list_flags() {
        let cli = Cli::try_parse_from(["calderactl", "ls", "jobs", "--queue", "gpu", "--sort", "cpu", "--asc", "-o", "json"]).unwrap();
        assert_eq!(cli.output, Output::Json);
        match cli.command {
            Commands::Ls { kind, queue, sort, asc, page, .. } => {
                assert_eq!(kind, ResourceKind::Job);
                assert_eq!(queue.as_deref(), Some("gpu"));
                assert_eq!(sort, Some(Column::Cpu));
                assert!(asc);
                assert_eq!(page, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}

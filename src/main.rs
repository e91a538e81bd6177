//! modhost - Native Request-Handler Modules
//!
//! CLI entry point for inspecting modules and driving requests through them.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use modhost::abi::ABI_VERSION;
use modhost::config::HostConfig;
use modhost::host::{DynamicModule, HostResult, ModuleInstance, ModuleLoader};
use modhost::http::{Request, Response};
use modhost::logging;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "modhost")]
#[command(version)]
#[command(about = "Load and drive native request-handler modules", long_about = None)]
struct Cli {
    /// Config file (default: modhost.toml in this or a parent directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send requests through a module, then unload it
    Call {
        /// Module name or path (default: module.path from config)
        module: Option<String>,

        /// Request method
        #[arg(short = 'X', long, default_value = "GET")]
        method: String,

        /// Request URI
        #[arg(short, long, default_value = "/")]
        uri: String,

        /// Request header as NAME:VALUE (repeatable)
        #[arg(short = 'H', long = "header", value_name = "NAME:VALUE")]
        headers: Vec<String>,

        /// Request body
        #[arg(short, long)]
        body: Option<String>,

        /// Number of requests to send
        #[arg(short = 'n', long, default_value = "1")]
        repeat: usize,

        /// Worker threads sending requests
        #[arg(short, long, default_value = "1")]
        concurrency: usize,

        /// Route through HandleProxyRequest instead of HandleRequest
        #[arg(long)]
        proxy: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show a module's entry points and ABI version without initializing it
    Inspect {
        /// Module name or path (default: module.path from config)
        module: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => HostConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => HostConfig::load_from_cwd().context("Failed to load modhost.toml")?,
    };
    logging::init(&config.logging);

    match cli.command {
        Commands::Call {
            module,
            method,
            uri,
            headers,
            body,
            repeat,
            concurrency,
            proxy,
            json,
        } => {
            let request = build_request(method, uri, &headers, body)?;
            let options = CallOptions {
                repeat,
                concurrency,
                proxy,
                json,
            };
            cmd_call(&config, module.as_deref(), &request, &options)
        }
        Commands::Inspect { module } => cmd_inspect(&config, module.as_deref()),
    }
}

fn module_arg<'a>(config: &'a HostConfig, module: Option<&'a str>) -> Result<&'a str> {
    match module.or(config.module.path.as_deref()) {
        Some(module) => Ok(module),
        None => bail!("No module given and no module.path in config"),
    }
}

fn loader_for(config: &HostConfig) -> ModuleLoader {
    let mut loader = ModuleLoader::with_options(config.instance_options());
    for dir in &config.module.search_paths {
        loader.add_search_path(dir);
    }
    loader
}

fn build_request(
    method: String,
    uri: String,
    headers: &[String],
    body: Option<String>,
) -> Result<Request> {
    let mut request = Request::new(method, uri);
    for header in headers {
        let Some((name, value)) = header.split_once(':') else {
            bail!("Header must be NAME:VALUE, got '{}'", header);
        };
        request.set_header(name, value.trim());
    }
    if let Some(body) = body {
        request = request.with_body(body);
    }
    Ok(request)
}

// =============================================================================
// inspect
// =============================================================================

fn cmd_inspect(config: &HostConfig, module: Option<&str>) -> Result<()> {
    let name = module_arg(config, module)?;
    let loader = loader_for(config);
    let path = loader
        .find_module(name)
        .with_context(|| format!("Module not found: {}", name))?;

    let module = DynamicModule::load(&path)?;
    let entry = module.entry_points();

    println!("Module: {}", module.path().display());
    match entry.abi_version.map(|probe| probe()) {
        Some(version) if version == ABI_VERSION => println!("ABI version: {}", version),
        Some(version) => println!(
            "ABI version: {} (incompatible, host speaks {})",
            version, ABI_VERSION
        ),
        None => println!("ABI version: not reported"),
    }
    println!("Entry points:");
    for symbol in entry.exported() {
        println!("  {}", symbol);
    }
    Ok(())
}

// =============================================================================
// call
// =============================================================================

struct CallOptions {
    repeat: usize,
    concurrency: usize,
    proxy: bool,
    json: bool,
}

struct CallOutcome {
    response: Response,
    /// URI after any proxy rewrite
    uri: String,
    target: Option<String>,
    elapsed: Duration,
}

fn dispatch(
    module: &ModuleInstance,
    request: &Request,
    proxy: bool,
    default_status: u16,
) -> HostResult<CallOutcome> {
    let started = Instant::now();
    let mut req = request.clone();
    let mut resp = Response::new();
    let target = if proxy {
        module.handle_proxy_request(&mut req, &mut resp)?
    } else {
        module.handle_request(&req, &mut resp)?;
        None
    };
    resp.finalize(default_status);
    Ok(CallOutcome {
        response: resp,
        uri: req.uri,
        target,
        elapsed: started.elapsed(),
    })
}

fn cmd_call(
    config: &HostConfig,
    module: Option<&str>,
    request: &Request,
    options: &CallOptions,
) -> Result<()> {
    let name = module_arg(config, module)?;
    let mut loader = loader_for(config);
    let module: Arc<ModuleInstance> = loader.load(name)?;

    let total = options.repeat.max(1);
    let workers = options.concurrency.clamp(1, total);
    let default_status = config.host.default_status;

    let started = Instant::now();
    let (tx, rx) = crossbeam_channel::unbounded();
    let next = AtomicUsize::new(0);
    crossbeam::scope(|s| {
        for _ in 0..workers {
            let tx = tx.clone();
            let (module, next) = (&module, &next);
            s.spawn(move |_| {
                while next.fetch_add(1, Ordering::Relaxed) < total {
                    if tx
                        .send(dispatch(module, request, options.proxy, default_status))
                        .is_err()
                    {
                        break;
                    }
                }
            });
        }
    })
    .map_err(|_| anyhow::anyhow!("Request worker panicked"))?;
    drop(tx);
    let elapsed = started.elapsed();

    let outcomes = rx.iter().collect::<HostResult<Vec<_>>>()?;
    let stats = module.stats();
    loader.unload_all();

    let Some(first) = outcomes.first() else {
        bail!("No requests were sent");
    };

    if options.json {
        let mut statuses: BTreeMap<u16, usize> = BTreeMap::new();
        for outcome in &outcomes {
            *statuses.entry(outcome.response.status).or_default() += 1;
        }
        let report = serde_json::json!({
            "module": module.name(),
            "requests": outcomes.len(),
            "concurrency": workers,
            "elapsed_us": elapsed.as_micros() as u64,
            "peak_concurrency": stats.peak_concurrency,
            "statuses": statuses,
            "response": response_json(first),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    print_response(first, options.proxy);
    if outcomes.len() > 1 {
        print_summary(&outcomes, workers, elapsed, stats.peak_concurrency);
    }
    Ok(())
}

fn sorted_headers(response: &Response) -> BTreeMap<&str, &str> {
    response.headers().collect()
}

fn response_json(outcome: &CallOutcome) -> serde_json::Value {
    serde_json::json!({
        "status": outcome.response.status,
        "headers": sorted_headers(&outcome.response),
        "body": String::from_utf8_lossy(&outcome.response.body),
        "uri": outcome.uri,
        "upstream": outcome.target,
        "elapsed_us": outcome.elapsed.as_micros() as u64,
    })
}

fn print_response(outcome: &CallOutcome, proxy: bool) {
    if proxy {
        match &outcome.target {
            Some(target) => println!("Upstream: {} {}", target, outcome.uri),
            None => println!("Upstream: not proxied"),
        }
    }
    println!("Status: {}", outcome.response.status);
    for (name, value) in sorted_headers(&outcome.response) {
        println!("{}: {}", name, value);
    }
    println!();
    print!("{}", String::from_utf8_lossy(&outcome.response.body));
}

fn print_summary(outcomes: &[CallOutcome], workers: usize, elapsed: Duration, peak: usize) {
    let mut statuses: BTreeMap<u16, usize> = BTreeMap::new();
    let mut busy = Duration::ZERO;
    for outcome in outcomes {
        *statuses.entry(outcome.response.status).or_default() += 1;
        busy += outcome.elapsed;
    }

    println!();
    println!("Summary");
    println!("=======");
    println!(
        "Requests:    {} over {} worker(s) in {:.2?}",
        outcomes.len(),
        workers,
        elapsed
    );
    println!("Mean call:   {:.2?}", busy / outcomes.len() as u32);
    println!("Peak calls:  {}", peak);
    for (status, count) in statuses {
        println!("Status {}:  {}", status, count);
    }
}

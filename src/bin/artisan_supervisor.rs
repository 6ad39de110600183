use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    process::ExitCode,
    time::UNIX_EPOCH,
};

use artisan_supervisor::{
    config::Settings,
    context::{Context, PidFile},
    error::{Result, SupervisorError},
    lifecycle::{self, Command, ContextController, ContextReport, Outcome, SystemProcessControl},
    log,
    logger::LogLevel,
    master::run_master,
    process_manager::ProcessManager,
    resource_monitor::{format_megabytes, HostSummary},
    timestamp::format_unix_timestamp,
    worker::WorkerRuntime,
};
use clap::{Parser, Subcommand};
use tokio::{io::AsyncWriteExt, net::TcpSocket, task::JoinSet};

/// Masters and workers inherit this so they read the same settings file.
const CONFIG_ENV: &str = "ARTISAN_SUPERVISOR_CONFIG";

#[derive(Debug, Parser)]
#[command(name = "artisan_supervisor", version, about = "master/worker supervisor for artisan contexts")]
struct Args {
    /// Settings file; defaults to ./Settings.toml when present
    #[arg(short, long, global = true, env = CONFIG_ENV)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Start contexts detached, or in the foreground with --debug
    Start {
        contexts: Vec<String>,
        #[arg(long)]
        debug: bool,
    },
    /// Ask context masters to shut down (SIGINT), or kill them with --force
    Stop {
        contexts: Vec<String>,
        #[arg(long)]
        force: bool,
    },
    /// Reboot the workers of running contexts (SIGHUP)
    Reload { contexts: Vec<String> },
    /// Show the processes and memory of running contexts
    Status { contexts: Vec<String> },
    /// List known contexts
    List,
    /// Run a context master (started by `start`)
    #[command(hide = true)]
    Master {
        #[arg(long)]
        context: String,
        #[arg(long)]
        debug: bool,
    },
    /// Run a reference worker (forked by a master)
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        context: String,
        #[arg(long)]
        debug: bool,
    },
}

fn main() -> ExitCode {
    let args = Args::parse();

    if let Some(path) = &args.config {
        // Children resolve the file from their own working directory.
        let path = std::fs::canonicalize(path).unwrap_or_else(|_| path.clone());
        std::env::set_var(CONFIG_ENV, path);
    }

    let settings = match Settings::load(args.config.as_deref()) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("{}", err);
            return ExitCode::FAILURE;
        }
    };

    let outcome = match args.cmd {
        Cmd::Start { contexts, debug } => run_lifecycle(&settings, Command::Start { debug }, &contexts),
        Cmd::Stop { contexts, force } => run_lifecycle(&settings, Command::Stop { force }, &contexts),
        Cmd::Reload { contexts } => run_lifecycle(&settings, Command::Reload, &contexts),
        Cmd::Status { contexts } => status(&settings, &contexts),
        Cmd::List => list(&settings),
        Cmd::Master { context, debug } => {
            block_on(run_master(&settings, &context, debug)).map(|_| true)
        }
        Cmd::Worker { context, debug } => block_on(run_worker(&settings, &context, debug)).map(|_| true),
    };

    match outcome {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("{}", err);
            ExitCode::FAILURE
        }
    }
}

fn block_on<F, T>(future: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(future)
}

fn run_lifecycle(settings: &Settings, command: Command, names: &[String]) -> Result<bool> {
    let targets = lifecycle::resolve_contexts(settings, names)?;
    if targets.is_empty() {
        println!("no contexts configured in {}", settings.contexts_dir.display());
        return Ok(true);
    }

    let reports = ContextController::new(SystemProcessControl).run(command, targets);
    print_reports(&reports, None);
    Ok(lifecycle::all_succeeded(&reports))
}

fn status(settings: &Settings, names: &[String]) -> Result<bool> {
    let targets = lifecycle::resolve_contexts(settings, names)?;
    let host = HostSummary::collect();
    println!(
        "host {}: {} of {} memory in use",
        host.hostname,
        format_megabytes(host.used_memory),
        format_megabytes(host.total_memory)
    );

    let reports = ContextController::new(SystemProcessControl).run(Command::Status, targets);
    print_reports(&reports, Some(&host));
    Ok(lifecycle::all_succeeded(&reports))
}

fn print_reports(reports: &[ContextReport], host: Option<&HostSummary>) {
    for report in reports {
        println!("{}", report);
        if let (Outcome::Status { pid, tree }, Some(host)) = (&report.outcome, host) {
            let state = ProcessManager::get_process_status(*pid).unwrap_or_else(|_| "Unknown".into());
            println!(
                "  master state {}, {:.2}% of host memory",
                state,
                host.share_of(tree.total_rss())
            );
        }
    }
}

fn list(settings: &Settings) -> Result<bool> {
    let contexts = settings.discover_contexts()?;
    if contexts.is_empty() {
        println!("no contexts configured in {}", settings.contexts_dir.display());
    }
    let mut all_loaded = true;
    for (name, context) in &contexts {
        match context {
            Ok(context) => println!("{}", describe(context)),
            Err(err) => {
                all_loaded = false;
                println!("{:<16} failed to load: {}", name, err);
            }
        }
    }
    Ok(all_loaded)
}

fn describe(context: &Context) -> String {
    let running = PidFile::new(&context.pid_file)
        .read()
        .ok()
        .flatten()
        .filter(|pid| ProcessManager::is_process_running(*pid));

    let state = match running {
        Some(pid) => match started_at(&context.pid_file) {
            Some(since) => format!("running (pid {}, since {})", pid, since),
            None => format!("running (pid {})", pid),
        },
        None => "stopped".to_string(),
    };
    format!(
        "{:<16} {} workers  {:<22} {}",
        context.name,
        context.workers,
        context.listen.as_deref().unwrap_or("-"),
        state
    )
}

fn started_at(pid_file: &Path) -> Option<String> {
    let modified = std::fs::metadata(pid_file).ok()?.modified().ok()?;
    let secs = modified.duration_since(UNIX_EPOCH).ok()?.as_secs();
    Some(format_unix_timestamp(secs))
}

/// Reference worker: answers every connection on the context's `listen`
/// address with its pid. Each worker binds the address with SO_REUSEPORT so
/// the kernel spreads connections over the pool.
async fn run_worker(settings: &Settings, context_name: &str, debug: bool) -> Result<()> {
    let runtime = WorkerRuntime::connect(context_name, debug, settings.log_level(debug))?;
    let logger = runtime.logger().clone();
    let pid = runtime.channel().pid();
    let context = settings.context(context_name)?;

    let Some(listen) = context.listen.clone() else {
        log!(logger, LogLevel::Info, "No listen address, idling until shutdown");
        runtime.shutdown_requested().await;
        runtime.close_after(async {}).await;
        std::process::exit(0);
    };

    let addr: SocketAddr = listen
        .parse()
        .map_err(|err| SupervisorError::Config(format!("listen address {:?}: {}", listen, err)))?;
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.set_reuseport(true)?;
    socket.bind(addr)?;
    let listener = socket.listen(1024)?;
    log!(logger, LogLevel::Info, "Listening on {}", addr);

    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = runtime.shutdown_requested() => break,
            accepted = listener.accept() => match accepted {
                Ok((mut stream, peer)) => {
                    log!(logger, LogLevel::Debug, "Connection from {}", peer);
                    if let Err(err) = runtime.increment("requests") {
                        log!(logger, LogLevel::Debug, "Metric dropped: {}", err);
                    }
                    connections.spawn(async move {
                        let reply = format!("served by worker {}\n", pid);
                        let _ = stream.write_all(reply.as_bytes()).await;
                        let _ = stream.shutdown().await;
                    });
                }
                Err(err) => log!(logger, LogLevel::Warn, "Accept failed: {}", err),
            },
        }
    }

    drop(listener);
    log!(logger, LogLevel::Info, "Stopped listening, draining {} connections", connections.len());
    runtime
        .close_after(async move { while connections.join_next().await.is_some() {} })
        .await;
    std::process::exit(0)
}

// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

use blast::{
    daemon, full_domain, get_trust_store, parse_cert_pem, Config, Error, HostsFile, Paths, Result,
    RootAuthority,
};
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "blast")]
#[command(version, about = "Local HTTPS domains for development servers")]
#[command(after_help = "\
EXAMPLES:
    sudo blast init                # Create the root CA and trust it
    sudo blast add api 3000        # https://api.blast -> localhost:3000
    blast list                     # Show configured proxies
    sudo blast remove api          # Drop the mapping")]
struct Cli {
    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Log more (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = ArgAction::Count, conflicts_with = "quiet")]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the root CA (once per machine) and add it to the system trust store
    Init {
        /// Do not touch the system trust store
        #[arg(long)]
        skip_trust_store: bool,
    },

    /// Proxy https://<name>.blast to localhost:<port>
    Add {
        /// Domain prefix, e.g. "api" for api.blast
        name: String,

        /// Local port the backend listens on
        port: String,

        /// Record the mapping without starting or reloading the daemon
        #[arg(long)]
        no_daemon: bool,
    },

    /// Remove a proxy mapping
    #[command(alias = "rm")]
    Remove {
        /// Domain prefix, e.g. "api" for api.blast
        name: String,

        /// Update the config without reloading the daemon
        #[arg(long)]
        no_daemon: bool,
    },

    /// List configured proxies
    #[command(alias = "ls")]
    List,

    /// Start the proxy daemon in the background
    Start,

    /// Stop the proxy daemon
    Stop,

    /// Restart the proxy daemon
    Restart,

    /// Show CA, daemon and proxy status
    Status,

    /// Print the path of the root CA certificate
    CaPath,

    /// Run the proxy in the foreground (used by `start`)
    #[command(hide = true)]
    Daemon,
}

/// Output helper that respects --quiet.
#[derive(Clone, Copy)]
struct Output {
    quiet: bool,
}

impl Output {
    fn new(quiet: bool) -> Self {
        Self { quiet }
    }

    /// Print a standard message (suppressed with --quiet)
    fn print(&self, msg: &str) {
        if !self.quiet {
            println!("{}", msg);
        }
    }
}

fn init_tracing(verbose: u8, default_level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    // A second init (tests, embedding) is harmless.
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}

fn main() {
    // Reset SIGPIPE to default behavior (exit) instead of panic
    // This prevents "broken pipe" panics when output is piped to tools like grep/head
    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }

    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    // The daemon's stderr is its log file: keep lifecycle events by default.
    let default_level = match cli.command {
        Commands::Daemon => "info",
        _ => "warn",
    };
    init_tracing(cli.verbose, default_level);

    let paths = Paths::new()?;
    let out = Output::new(cli.quiet);

    match cli.command {
        Commands::Init { skip_trust_store } => cmd_init(&paths, skip_trust_store, out),
        Commands::Add {
            name,
            port,
            no_daemon,
        } => cmd_add(&paths, &name, &port, no_daemon, out),
        Commands::Remove { name, no_daemon } => cmd_remove(&paths, &name, no_daemon, out),
        Commands::List => cmd_list(&paths),
        Commands::Start => cmd_start(&paths, out),
        Commands::Stop => cmd_stop(&paths, out),
        Commands::Restart => {
            cmd_stop(&paths, out)?;
            cmd_start(&paths, out)
        }
        Commands::Status => cmd_status(&paths),
        Commands::CaPath => cmd_ca_path(&paths),
        Commands::Daemon => cmd_daemon(&paths),
    }
}

/// The hosts file to edit; `BLAST_HOSTS_FILE` redirects it (tests, containers).
fn hosts_file() -> HostsFile {
    match std::env::var_os("BLAST_HOSTS_FILE") {
        Some(path) => HostsFile::new(PathBuf::from(path)),
        None => HostsFile::system(),
    }
}

fn cmd_init(paths: &Paths, skip_trust_store: bool, out: Output) -> Result<()> {
    let existed = paths.ca_cert.exists();
    let root = RootAuthority::ensure(paths)?;

    if existed {
        out.print(&format!(
            "Using existing root CA: {}",
            root.certificate_path().display()
        ));
    } else {
        out.print(&format!(
            "Created root CA: {}",
            root.certificate_path().display()
        ));
    }

    if skip_trust_store {
        out.print("Skipped trust store installation.");
        return Ok(());
    }

    let trust = get_trust_store();
    if !trust.has_elevated_privileges() {
        out.print("Installing into the trust store needs elevated privileges; you may be prompted.");
    }
    trust.install(root.certificate_path())?;
    out.print(&format!("Root CA trusted by: {}", trust.name()));
    Ok(())
}

fn cmd_add(paths: &Paths, name: &str, port: &str, no_daemon: bool, out: Output) -> Result<()> {
    // The CA must exist before the daemon can issue anything
    RootAuthority::ensure(paths)?;

    let mut config = Config::load(&paths.config)?;
    let mapping = config.add_proxy(name, port)?.clone();

    hosts_file().add_entry(&mapping.full_domain)?;
    config.save(&paths.config)?;

    out.print(&format!(
        "https://{} -> http://localhost:{}",
        mapping.full_domain, mapping.local_port
    ));

    if !no_daemon {
        apply_to_daemon(paths, out)?;
    }
    Ok(())
}

fn cmd_remove(paths: &Paths, name: &str, no_daemon: bool, out: Output) -> Result<()> {
    let mut config = Config::load(&paths.config)?;
    let domain = full_domain(name);

    let removed = config.remove_proxy(name);
    hosts_file().remove_entry(&domain)?;

    match removed {
        Some(mapping) => {
            config.save(&paths.config)?;
            out.print(&format!("Removed https://{}", mapping.full_domain));
        }
        None => {
            out.print(&format!("No proxy configured for {}", domain));
            return Ok(());
        }
    }

    if !no_daemon && daemon::is_running(paths) {
        daemon::reload(paths)?;
    }
    Ok(())
}

/// Reload a running daemon, or start one.
fn apply_to_daemon(paths: &Paths, out: Output) -> Result<()> {
    if daemon::is_running(paths) {
        daemon::reload(paths)?;
        out.print("Daemon reloaded.");
    } else if let Some(pid) = daemon::start(paths)? {
        out.print(&format!("Daemon started (PID: {})", pid));
    }
    Ok(())
}

fn cmd_list(paths: &Paths) -> Result<()> {
    let config = Config::load(&paths.config)?;
    let proxies = config.list_proxies();

    if proxies.is_empty() {
        println!("No proxies configured. Add one with: blast add <name> <port>");
        return Ok(());
    }

    for mapping in proxies {
        println!(
            "https://{:<30} -> http://localhost:{}",
            mapping.full_domain, mapping.local_port
        );
    }
    Ok(())
}

fn cmd_start(paths: &Paths, out: Output) -> Result<()> {
    RootAuthority::ensure(paths)?;

    match daemon::start(paths)? {
        Some(pid) => {
            out.print(&format!("Daemon started (PID: {})", pid));
            out.print(&format!("Log file: {}", paths.log_path().display()));
        }
        None => out.print("Daemon is already running."),
    }
    Ok(())
}

fn cmd_stop(paths: &Paths, out: Output) -> Result<()> {
    if daemon::stop(paths)? {
        out.print("Daemon stopped.");
    } else {
        out.print("Daemon is not running.");
    }
    Ok(())
}

fn cmd_status(paths: &Paths) -> Result<()> {
    println!("blast status");
    println!("============");
    println!();

    print!("CA: ");
    match std::fs::read_to_string(&paths.ca_cert) {
        Ok(pem) => {
            println!("{}", paths.ca_cert.display());
            match parse_cert_pem(&pem) {
                Ok(info) => println!(
                    "    Expires: {} ({} days)",
                    info.expiry_string(),
                    info.days_remaining()
                ),
                Err(e) => println!("    Unreadable: {}", e),
            }
        }
        Err(_) => println!("not initialized (run 'blast init')"),
    }

    let status = daemon::status(paths);
    match (status.running, status.pid) {
        (true, Some(pid)) => println!("Daemon: running (PID: {})", pid),
        (true, None) => println!("Daemon: running (PID unknown)"),
        (false, _) => println!("Daemon: not running"),
    }
    println!("    Log file: {}", status.log_path.display());

    let config = Config::load(&paths.config)?;
    println!(
        "Listening on: {}:{}",
        config.listen.bind, config.listen.port
    );
    println!("Proxies: {}", config.proxies.len());
    for mapping in config.list_proxies() {
        println!(
            "    https://{} -> http://localhost:{}",
            mapping.full_domain, mapping.local_port
        );
    }
    Ok(())
}

fn cmd_ca_path(paths: &Paths) -> Result<()> {
    let root = RootAuthority::ensure(paths)?;
    println!("{}", root.certificate_path().display());
    Ok(())
}

fn cmd_daemon(paths: &Paths) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::Daemon(format!("Failed to start async runtime: {}", e)))?;
    runtime.block_on(daemon::run(paths))
}

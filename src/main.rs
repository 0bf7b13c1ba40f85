//! controlrpc - command line client for device control servers.
//!
//! Lists components, reads and writes control values, and deploys script
//! files to the components they are mapped to in the settings file.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::sync::mpsc::{channel, Receiver};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use controlrpc::config::{HostConfig, Settings};
use controlrpc::deploy::{deploy_file, deploy_value};
use controlrpc::protocol::{ClientEvent, ControlClient, DEFAULT_EVENT_BUFFER};

#[derive(Parser, Debug)]
#[command(name = "controlrpc", version, about = "Device control server client")]
struct Cli {
    /// Settings file (defaults to <config dir>/controlrpc/settings.json).
    #[arg(long, value_name = "PATH", env = "CONTROLRPC_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Configured host name, or an ad-hoc address[:port].
    #[arg(long, global = true)]
    host: Option<String>,

    /// Minimum log level (stderr). RUST_LOG takes precedence.
    #[arg(long, value_name = "LEVEL", default_value = "warn", global = true)]
    log_level: String,

    /// Print protocol trace lines and notifications to stderr.
    #[arg(long, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List configured hosts.
    Hosts,
    /// List components on the control server.
    Components,
    /// Read a control value.
    Get { component: String, control: String },
    /// Write a control value. VALUE is parsed as JSON, falling back to a string.
    Set {
        component: String,
        control: String,
        value: String,
    },
    /// Write a value to a script component after checking its type.
    Push {
        component: String,
        /// Control to write.
        #[arg(long, default_value = controlrpc::config::DEFAULT_CONTROL)]
        control: String,
        /// File whose contents are written.
        file: PathBuf,
    },
    /// Deploy a file to every component it is mapped to.
    Deploy { file: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(format!("controlrpc={}", cli.log_level))
            }),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .init();

    let settings_path = cli.config.clone().or_else(Settings::default_path);
    let settings = match &settings_path {
        Some(path) => Settings::load_or_default(path)?,
        None => Settings::default(),
    };

    match &cli.command {
        Command::Hosts => {
            list_hosts(&settings);
            Ok(())
        }
        Command::Deploy { file } => deploy_mapped(&cli, &settings, file).await,
        command => {
            let host = resolve_host(&settings, cli.host.as_deref())?;
            let client = open_session(&cli, &settings, &host).await?;
            let result = run_command(&client, command).await;
            client.disconnect().await;
            result
        }
    }
}

fn list_hosts(settings: &Settings) {
    if settings.hosts.is_empty() {
        println!("No hosts configured.");
        return;
    }
    for host in &settings.hosts {
        let auth = if host.username.is_some() { "auth" } else { "-" };
        println!("{:<20} {}:{:<6} {}", host.name, host.address, host.port, auth);
    }
}

/// Pick the host named on the command line, or the only configured one.
fn resolve_host(settings: &Settings, requested: Option<&str>) -> Result<HostConfig> {
    match requested {
        Some(name) => Ok(settings
            .host(name)
            .cloned()
            .unwrap_or_else(|| HostConfig::from_address(name))),
        None => match settings.hosts.as_slice() {
            [only] => Ok(only.clone()),
            [] => bail!("No hosts configured; pass --host <address>"),
            _ => bail!("Several hosts configured; pick one with --host <name>"),
        },
    }
}

/// Connect (and log on, when credentials are configured).
async fn open_session(cli: &Cli, settings: &Settings, host: &HostConfig) -> Result<ControlClient> {
    let mut client = ControlClient::with_config(settings.client_config());
    if cli.trace {
        let (tx, rx) = channel(DEFAULT_EVENT_BUFFER);
        client = client.with_events(tx);
        tokio::spawn(print_events(rx));
    }

    client
        .connect(&host.address, host.port)
        .await
        .with_context(|| format!("Failed to connect to {}", host.name))?;

    if let Some((user, password)) = host.credentials() {
        if let Err(e) = client.authenticate(user, password).await {
            client.disconnect().await;
            return Err(e).with_context(|| format!("Failed to log on to {}", host.name));
        }
    }

    Ok(client)
}

async fn print_events(mut rx: Receiver<ClientEvent>) {
    while let Some(event) = rx.recv().await {
        let stamp = chrono::Local::now().format("%H:%M:%S%.3f");
        match event {
            ClientEvent::Trace(line) => eprintln!("[{}] {}", stamp, line),
            ClientEvent::Notification { method, params } => {
                eprintln!("[{}] notification {}: {}", stamp, method, params)
            }
            ClientEvent::Disconnected { reason } => {
                eprintln!("[{}] disconnected: {}", stamp, reason)
            }
        }
    }
}

async fn run_command(client: &ControlClient, command: &Command) -> Result<()> {
    match command {
        Command::Components => {
            let components = client.list_components().await?;
            for component in &components {
                let deployable = if component.is_deployable() { "yes" } else { "" };
                println!(
                    "{:<32} {:<28} {}",
                    component.name, component.component_type, deployable
                );
            }
        }
        Command::Get { component, control } => {
            match client.read_control_value(component, control).await? {
                Some(Value::String(text)) => println!("{}", text),
                Some(value) => println!("{}", value),
                None => bail!("Control '{}' not found on '{}'", control, component),
            }
        }
        Command::Set {
            component,
            control,
            value,
        } => {
            let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.clone()));
            client.write_control_value(component, control, value).await?;
        }
        Command::Push {
            component,
            control,
            file,
        } => {
            let text = tokio::fs::read_to_string(file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let report = deploy_value(client, component, control, Value::String(text)).await?;
            println!("Wrote {}.{}", report.component, report.control);
        }
        Command::Hosts | Command::Deploy { .. } => {
            return Err(anyhow!("command does not use a session"));
        }
    }
    Ok(())
}

/// Deploy `file` to every mapping that names it, one session per mapping.
async fn deploy_mapped(cli: &Cli, settings: &Settings, file: &Path) -> Result<()> {
    let file = tokio::fs::canonicalize(file)
        .await
        .unwrap_or_else(|_| file.to_path_buf());
    let mappings = settings.mappings_for(&file);
    if mappings.is_empty() {
        bail!("No mapping found for {}", file.display());
    }

    let mut failures = 0;
    for mapping in mappings {
        let host = settings
            .host(&mapping.host)
            .ok_or_else(|| anyhow!("Unknown host '{}'", mapping.host))?;

        let result = async {
            let client = open_session(cli, settings, host).await?;
            // The mapping may be relative; deploy the path we were given.
            let resolved = controlrpc::config::ScriptMapping {
                file: file.clone(),
                ..mapping.clone()
            };
            let outcome = deploy_file(&client, &resolved, Path::new("")).await;
            client.disconnect().await;
            outcome.map_err(anyhow::Error::from)
        }
        .await;

        match result {
            Ok(report) => println!(
                "Deployed {} bytes to {}.{} on {}",
                report.bytes, report.component, report.control, host.name
            ),
            Err(e) => {
                failures += 1;
                eprintln!("Deploy to {} on {} failed: {:#}", mapping.component, host.name, e);
            }
        }
    }

    if failures > 0 {
        bail!("{} deployment(s) failed", failures);
    }
    Ok(())
}

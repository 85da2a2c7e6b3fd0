//! Binary entrypoint for the friendrelay CLI.
//!
//! Commands:
//! - `init` - write a starter `relay.toml`
//! - `status` - validate the configuration and print a summary
//! - `smoketest` - run an in-process relay with loopback clients and print a JSON report
//!
//! See the library crate docs for module-level details: `friendrelay::`.
use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{error, info};
use std::sync::Arc;

use friendrelay::config::Config;
use friendrelay::relay::permissions::{ElevatedPermissions, PrimaryPermissions};
use friendrelay::relay::protocol::{
    BodySwapPayload, CameraPayload, EmotePayload, PossessionBeginPayload, SwapAttributes,
};
use friendrelay::relay::{
    ActionPayload, InMemoryPermissionStore, LoopbackClient, Method, PermissionEdge, PermissionSet,
    PermissionStore, RelayServer, Request, ResultCode,
};

#[derive(Parser)]
#[command(name = "friendrelay")]
#[command(about = "Permissioned command relay between friends")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "relay.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Validate the configuration and print a summary
    Status,
    /// Exercise emote, body swap and possession against in-process clients
    SmokeTest,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init { force } => {
            init_logging(&None, cli.verbose);
            if !force && tokio::fs::try_exists(&cli.config).await.unwrap_or(false) {
                return Err(anyhow!(
                    "{} already exists (use --force to overwrite)",
                    cli.config
                ));
            }
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
        }
        Commands::Status => {
            let config = Config::load(&cli.config).await?;
            init_logging(&Some(config.clone()), cli.verbose);
            config.validate()?;
            println!("friendrelay v{}", env!("CARGO_PKG_VERSION"));
            println!("config: {}", cli.config);
            println!(
                "targets per request: {} | forward timeout: {}ms | body swap query timeout: {}ms | possession timeout: {}ms",
                config.relay.max_targets,
                config.relay.forward_timeout_ms,
                config.relay.body_swap_query_timeout_ms,
                config.relay.possession_timeout_ms
            );
            println!(
                "general bucket: {} per {}ms | possession bucket: {} per {}ms",
                config.rate_limit.general_capacity,
                config.rate_limit.general_refill_interval_ms,
                config.rate_limit.possession_capacity,
                config.rate_limit.possession_refill_interval_ms
            );
        }
        Commands::SmokeTest => {
            // Fall back to defaults so the smoke test runs without a config file.
            let config = Config::load(&cli.config).await.unwrap_or_default();
            init_logging(&Some(config.clone()), cli.verbose);
            config.validate()?;
            match run_smoketest(config).await {
                Ok(report) => {
                    let ok = report["status"] == "ok";
                    println!("{}", report);
                    std::process::exit(if ok { 0 } else { 1 });
                }
                Err(e) => {
                    error!("smoke test could not run: {}", e);
                    std::process::exit(2);
                }
            }
        }
    }

    Ok(())
}

/// Three clients that have all befriended each other with full permissions.
async fn run_smoketest(config: Config) -> Result<serde_json::Value> {
    let store = Arc::new(InMemoryPermissionStore::new());
    let server = RelayServer::new(config, store.clone());
    let codes = ["SMOKE-A", "SMOKE-B", "SMOKE-C"];

    for issuer in codes {
        for target in codes.iter().filter(|t| **t != issuer) {
            store
                .update_single_permissions(PermissionEdge::allowing(
                    issuer,
                    *target,
                    PermissionSet::all(),
                ))
                .await?;
        }
    }

    let mut clients = Vec::new();
    for code in codes {
        let name = format!("{} Character", code);
        let client = LoopbackClient::spawn(code, &name, "Smoke");
        server
            .connect(code, Arc::new(client.connection()), &name, "Smoke")
            .await?;
        clients.push(client);
    }
    let [a, b, c] = codes;

    let emote = server
        .handle_request(
            a,
            Request::new(
                &[b, c],
                ActionPayload::Emote(EmotePayload {
                    emote: "wave".into(),
                    display_log_message: true,
                }),
            ),
        )
        .await;
    let emote_ok = emote.results.len() == 2 && emote.results.values().all(|r| r.is_success());

    let before: Vec<_> = clients.iter().map(|c| c.identity()).collect();
    let swap = server
        .handle_request(
            a,
            Request::new(
                &[b, c],
                ActionPayload::BodySwap(BodySwapPayload {
                    attributes: SwapAttributes {
                        customization: true,
                        equipment: true,
                        ..SwapAttributes::default()
                    },
                    sender_identity: Some(before[0].clone()),
                    lock_code: None,
                }),
            ),
        )
        .await;
    let swapped = clients[1..]
        .iter()
        .zip(&before[1..])
        .all(|(client, original)| client.identity() != *original);
    let swap_ok = swap.response_code == ResultCode::Success
        && swap.results.values().all(|r| r.is_success())
        && swap.payload.is_some()
        && swapped;

    let begin = server
        .handle_request(
            a,
            Request::new(
                &[b],
                ActionPayload::PossessionBegin(PossessionBeginPayload {
                    character_name: format!("{} Character", a),
                    character_world: "Smoke".into(),
                }),
            ),
        )
        .await;
    let camera = server
        .handle_request(
            a,
            Request::new(
                &[],
                ActionPayload::PossessionCamera(CameraPayload {
                    horizontal: 0.25,
                    vertical: 0.0,
                    zoom: 4.0,
                }),
            ),
        )
        .await;
    let end = server
        .handle_request(a, Request::new(&[], ActionPayload::PossessionEnd))
        .await;
    let possession_ok = begin.result_for(b) == Some(ResultCode::Success)
        && camera.result_for(b) == Some(ResultCode::Success)
        && end.result_for(b) == Some(ResultCode::Success)
        && clients[1].received_count(Method::PossessionEnd) == 1
        && server.possession().active_sessions() == 0;

    let granted = PermissionSet {
        primary: PrimaryPermissions::all(),
        elevated: ElevatedPermissions::all(),
        ..PermissionSet::default()
    };
    server.update_global_permissions(c, granted).await?;

    for code in codes {
        server.disconnect(code).await;
    }

    let ok = emote_ok && swap_ok && possession_ok;
    Ok(serde_json::json!({
        "status": if ok { "ok" } else { "failed" },
        "emote": { "ok": emote_ok, "results": emote.results },
        "body_swap": { "ok": swap_ok, "response_code": swap.response_code, "results": swap.results },
        "possession": {
            "ok": possession_ok,
            "begin": begin.result_for(b),
            "camera": camera.result_for(b),
            "end": end.result_for(b),
        },
        "status_after": server.status(),
    }))
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .and_then(|c| c.logging.level.parse().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let log_file = config
        .as_ref()
        .and_then(|c| c.logging.file.as_ref())
        .and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        })
        .map(|f| std::sync::Arc::new(std::sync::Mutex::new(f)));
    let security_path = config.as_ref().and_then(|c| c.logging.security_file.clone());
    let is_tty = atty::is(atty::Stream::Stdout);

    builder.format(move |fmt, record| {
        let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
        let line = format!("{} [{}] {}", ts, record.level(), record.args());

        if let Some(file) = &log_file {
            if let Ok(mut guard) = file.lock() {
                let _ = writeln!(guard, "{}", line);
            }
        }
        if record.target() == "security" {
            if let Some(ref sec_path) = security_path {
                if let Ok(mut sf) = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(sec_path)
                {
                    let _ = writeln!(sf, "{}", line);
                }
            }
        }
        // With a log file and no terminal, the file is the only sink
        if log_file.is_none() || is_tty {
            writeln!(fmt, "{}", line)
        } else {
            Ok(())
        }
    });
    let _ = builder.try_init();
}

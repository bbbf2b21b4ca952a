//! SCP node binary.
//!
//! `scp serve` runs a server exposing a handful of demo operations and a
//! periodic `tick` broadcast; `scp call` subscribes to a server and performs
//! one REPLY call, printing the JSON result.

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use scp_client::{Client, ClientConfig};
use scp_routing::{Next, RoutingError};
use scp_server::{Server, ServerConfig, ServerHandle};
use scp_session::{IncomingExchange, OutgoingExchange, RemoteError, TlsClientConfig};
use scp_wire::CID;
use serde_json::Value;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::{parse_optional_duration, NodeConfig};
use logging::ScpLogFormatter;

/// SCP node with optional TLS support
#[derive(Parser, Debug)]
#[command(name = "scp", version, about = "SCP server and client node")]
struct Args {
    /// Configuration file path
    #[arg(long, global = true, default_value = "scp.yaml")]
    config: PathBuf,

    /// Identifier announced to peers (overrides the config file)
    #[arg(long, global = true)]
    identifier: Option<String>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG wins when set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Idle heartbeat interval, e.g. 30s, or "off"
    #[arg(long, global = true)]
    heartbeat_interval: Option<String>,

    #[command(flatten)]
    tls: TlsArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(ClapArgs, Debug)]
struct TlsArgs {
    /// Enable TLS
    #[arg(long, global = true)]
    tls: bool,

    /// Path to TLS certificate file (PEM format)
    #[arg(long, global = true)]
    tls_cert: Option<PathBuf>,

    /// Path to TLS private key file (PEM format)
    #[arg(long, global = true)]
    tls_key: Option<PathBuf>,

    /// Path to CA certificate file (PEM format)
    #[arg(long, global = true)]
    tls_ca: Option<PathBuf>,

    /// Server name for TLS SNI on outbound connections
    #[arg(long, global = true)]
    tls_sni: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the demo operations
    Serve {
        /// Listen address, e.g. 0.0.0.0:7700
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// Interval between `tick` broadcasts, e.g. 5s, or "off"
        #[arg(long)]
        tick_interval: Option<String>,
    },
    /// Call one REPLY operation and print its result
    Call {
        /// Server address, e.g. 127.0.0.1:7700
        #[arg(long)]
        server: Option<SocketAddr>,

        /// How long to wait for the answer
        #[arg(long, default_value = "10s")]
        timeout: humantime::Duration,

        /// Operation name, e.g. sum or Billing.charge
        operation: String,

        /// JSON argument array
        #[arg(default_value = "[]")]
        args: String,
    },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new("warn")
            .add_directive(format!("scp={}", args.log_level).parse()?)
            .add_directive(format!("scp_wire={}", args.log_level).parse()?)
            .add_directive(format!("scp_session={}", args.log_level).parse()?)
            .add_directive(format!("scp_routing={}", args.log_level).parse()?)
            .add_directive(format!("scp_server={}", args.log_level).parse()?)
            .add_directive(format!("scp_client={}", args.log_level).parse()?),
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .event_format(ScpLogFormatter::new("scp"))
        .init();

    let mut config = NodeConfig::load_from_file(&args.config)?;
    if let Some(identifier) = &args.identifier {
        config.identifier = Some(identifier.clone());
    }
    if let Some(interval) = &args.heartbeat_interval {
        config.connection.heartbeat_interval = parse_optional_duration(interval)?;
    }
    apply_tls_args(&mut config, &args.tls)?;

    match args.command {
        Command::Serve {
            listen,
            tick_interval,
        } => {
            if let Some(listen) = listen {
                config.listen = listen;
            }
            if let Some(interval) = &tick_interval {
                config.tick_interval = parse_optional_duration(interval)?;
            }
            serve(config).await
        }
        Command::Call {
            server,
            timeout,
            operation,
            args,
        } => {
            if let Some(server) = server {
                config.server = server;
            }
            let args: Value = serde_json::from_str(&args)
                .with_context(|| format!("Arguments are not valid JSON: {}", args))?;
            call(config, &operation, args, timeout.into()).await
        }
    }
}

fn apply_tls_args(config: &mut NodeConfig, tls: &TlsArgs) -> anyhow::Result<()> {
    if tls.tls {
        config.tls.enabled = true;
    }
    if let Some(cert) = &tls.tls_cert {
        config.tls.cert_file = Some(cert.clone());
    }
    if let Some(key) = &tls.tls_key {
        config.tls.key_file = Some(key.clone());
    }
    if let Some(ca) = &tls.tls_ca {
        config.tls.ca_file = Some(ca.clone());
    }
    if let Some(sni) = &tls.tls_sni {
        config.tls.server_name = Some(sni.clone());
    }

    #[cfg(not(feature = "tls"))]
    if config.tls.enabled {
        anyhow::bail!("TLS requested but not compiled with TLS support. Build with --features tls");
    }
    Ok(())
}

/// Register the demo operations
fn demo_server(config: &NodeConfig) -> Server {
    let mut server_config = ServerConfig {
        connection: config.connection_config(),
        ..Default::default()
    };
    if let Some(identifier) = &config.identifier {
        server_config.identifier = identifier.clone();
    }

    let mut server = Server::with_config(server_config);
    server
        .omni("*", trace_call)
        .reply("echo", |(value,): (Value,)| async move {
            Ok::<_, RemoteError>(value)
        })
        .reply("sum", |values: Vec<i64>| async move {
            Ok::<_, RemoteError>(values.iter().sum::<i64>())
        })
        .reply("fail", |(message,): (String,)| async move {
            Err::<(), _>(RemoteError::new(message).with_field("demo", true))
        });
    server
}

async fn trace_call(
    incoming: IncomingExchange,
    outgoing: OutgoingExchange,
    next: Next,
) -> Result<(), RoutingError> {
    component_debug!(
        "server",
        "{} from {}",
        incoming.rfi(),
        incoming.get(CID).unwrap_or("anonymous")
    );
    next.proceed(incoming, outgoing).await?;
    Ok(())
}

async fn serve(config: NodeConfig) -> anyhow::Result<()> {
    info!("Starting SCP node v{}", env!("CARGO_PKG_VERSION"));
    let server = demo_server(&config);

    #[cfg(feature = "tls")]
    let handle = if config.tls.enabled {
        let listener = scp_session::listen_tcp(config.listen).await?;
        let acceptor = tls_server(&config).await?;
        server.serve_tls(listener, acceptor)?
    } else {
        server.bind(config.listen).await?
    };
    #[cfg(not(feature = "tls"))]
    let handle = server.bind(config.listen).await?;

    component_info!(
        "server",
        "Serving {} on {}",
        handle.identifier(),
        handle.local_addr()
    );

    let ticker = config
        .tick_interval
        .map(|period| tokio::spawn(tick_loop(handle.clone(), period)));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Received shutdown signal");

    if let Some(ticker) = ticker {
        ticker.abort();
    }
    handle.shutdown();
    Ok(())
}

async fn tick_loop(handle: ServerHandle, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut count: u64 = 0;

    loop {
        interval.tick().await;
        count += 1;
        let now = chrono::Utc::now().to_rfc3339();
        match handle.broadcast("tick", &(count, now)).await {
            Ok(delivered) if !delivered.is_empty() => {
                component_debug!("broadcast", "tick {} reached {:?}", count, delivered);
            }
            Ok(_) => {}
            Err(e) => component_warn!("broadcast", "tick {} failed: {}", count, e),
        }
    }
}

async fn call(
    config: NodeConfig,
    operation: &str,
    args: Value,
    timeout: Duration,
) -> anyhow::Result<()> {
    let mut client_config = ClientConfig {
        connection: config.connection_config(),
        tls: client_tls(&config).await?,
        ..Default::default()
    };
    if let Some(identifier) = &config.identifier {
        client_config.identifier = identifier.clone();
    }

    let client = Client::with_config(client_config);
    client.on("tick", |args| {
        component_debug!("client", "tick {:?}", args);
    });
    client
        .connect(config.server)
        .await
        .with_context(|| format!("Failed to connect to {}", config.server))?;
    component_info!(
        "client",
        "Subscribed to {} as {}",
        client.server_identifier().unwrap_or_default(),
        client.identifier()
    );

    let answer = tokio::time::timeout(timeout, client.message(operation, &args)).await;
    client.disconnect();

    match answer {
        Ok(Ok(value)) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Ok(Err(e)) => Err(e).with_context(|| format!("{} failed", operation)),
        Err(_) => {
            warn!("No answer to {} within {:?}", operation, timeout);
            anyhow::bail!("{} timed out", operation)
        }
    }
}

#[cfg(feature = "tls")]
async fn read_pem(path: &Option<PathBuf>, what: &str) -> anyhow::Result<String> {
    let path = path
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("TLS enabled but no {} file configured", what))?;
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {} file {:?}", what, path))
}

#[cfg(feature = "tls")]
async fn tls_server(config: &NodeConfig) -> anyhow::Result<scp_session::tls::TlsServer> {
    use scp_session::tls::{make_server_config, tls_acceptor};

    let cert_pem = read_pem(&config.tls.cert_file, "certificate").await?;
    let key_pem = read_pem(&config.tls.key_file, "private key").await?;
    let ca_pem = match &config.tls.ca_file {
        Some(_) => Some(read_pem(&config.tls.ca_file, "CA").await?),
        None => None,
    };

    let server_config = make_server_config(&cert_pem, &key_pem, ca_pem.as_deref())?;
    info!("TLS configuration loaded (mTLS: {})", ca_pem.is_some());
    Ok(tls_acceptor(server_config))
}

#[cfg(feature = "tls")]
async fn client_tls(config: &NodeConfig) -> anyhow::Result<Option<TlsClientConfig>> {
    use scp_session::tls::make_client_config;

    if !config.tls.enabled {
        return Ok(None);
    }

    let ca_pem = read_pem(&config.tls.ca_file, "CA").await?;
    let identity = match (&config.tls.cert_file, &config.tls.key_file) {
        (Some(_), Some(_)) => Some((
            read_pem(&config.tls.cert_file, "certificate").await?,
            read_pem(&config.tls.key_file, "private key").await?,
        )),
        _ => None,
    };
    let client_config = make_client_config(
        &ca_pem,
        identity
            .as_ref()
            .map(|(cert, key)| (cert.as_str(), key.as_str())),
    )?;

    let server_name = config
        .tls
        .server_name
        .clone()
        .unwrap_or_else(|| config.server.ip().to_string());
    Ok(Some(TlsClientConfig {
        client_config,
        server_name,
    }))
}

#[cfg(not(feature = "tls"))]
async fn client_tls(_config: &NodeConfig) -> anyhow::Result<Option<TlsClientConfig>> {
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_call() {
        let args = Args::parse_from([
            "scp",
            "--identifier",
            "cli",
            "call",
            "--server",
            "127.0.0.1:7800",
            "sum",
            "[1,2,3]",
        ]);
        assert_eq!(args.identifier.as_deref(), Some("cli"));
        match args.command {
            Command::Call {
                server,
                operation,
                args,
                ..
            } => {
                assert_eq!(server, Some("127.0.0.1:7800".parse().unwrap()));
                assert_eq!(operation, "sum");
                assert_eq!(args, "[1,2,3]");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_cli_parses_serve_durations() {
        let args = Args::parse_from(["scp", "serve", "--tick-interval", "off"]);
        match args.command {
            Command::Serve { tick_interval, .. } => {
                assert_eq!(
                    parse_optional_duration(tick_interval.as_deref().unwrap()).unwrap(),
                    None
                );
            }
            other => panic!("unexpected {:?}", other),
        }

        let args = Args::parse_from(["scp", "--heartbeat-interval", "2s", "serve"]);
        assert_eq!(args.heartbeat_interval.as_deref(), Some("2s"));
        assert!(matches!(args.command, Command::Serve { .. }));
    }

    #[tokio::test]
    async fn test_demo_operations() {
        let config = NodeConfig {
            identifier: Some("demo".to_string()),
            tick_interval: None,
            ..Default::default()
        };
        let handle = demo_server(&config)
            .bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        let client = Client::new("tester");
        client.connect(handle.local_addr()).await.unwrap();
        assert_eq!(client.server_identifier().as_deref(), Some("demo"));

        let echoed = client.message("echo", &("hello",)).await.unwrap();
        assert_eq!(echoed, Value::from("hello"));
        let total: i64 = client.execute("sum", &[1, 2, 3, 4]).await.unwrap();
        assert_eq!(total, 10);
        match client.message("fail", &("nope",)).await {
            Err(scp_client::ClientError::Remote(error)) => {
                assert_eq!(error.message, "nope");
                assert_eq!(error.field("demo"), Some(&Value::Bool(true)));
            }
            other => panic!("unexpected {:?}", other),
        }

        handle.shutdown();
    }
}

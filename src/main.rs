use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use lankeeper::dhcp::{DhcpServer, FileLeaseStore, LeaseStore};
use lankeeper::dns::DnsServer;
use lankeeper::{Config, Error, Metrics, Result};

#[derive(Parser)]
#[command(name = "lankeeper")]
#[command(author, version, about = "A LAN gateway DHCP and DNS appliance", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    Run,
    ShowConfig,
    ListLeases,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = Config::load_or_create(&cli.config).await?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            info!("starting servers with config: {:?}", cli.config);
            run(config).await
        }
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::ListLeases => {
            let store = FileLeaseStore::new(&config.dhcp.lease_file);
            let leases = store.load()?;

            if leases.is_empty() {
                println!("No active leases.");
            } else {
                println!("{:<20} {:<16} {:<20}", "Client ID", "IP Address", "Hostname");
                println!("{}", "-".repeat(56));

                for lease in leases {
                    println!(
                        "{:<20} {:<16} {:<20}",
                        lease.client_id,
                        lease.ip,
                        lease.hostname.unwrap_or_default()
                    );
                }
            }

            Ok(())
        }
    }
}

async fn run(config: Config) -> Result<()> {
    let metrics = Arc::new(Metrics::new()?);

    let dhcp = Arc::new(DhcpServer::new(config.dhcp.clone(), Arc::clone(&metrics)).await?);
    let dns = Arc::new(DnsServer::new(config.dns.clone(), Arc::clone(&metrics)).await?);

    dns.load_blocklists().await;

    let web_addr: std::net::SocketAddr = config.web.address.parse().map_err(|_| {
        Error::InvalidConfig(format!("invalid web address {}", config.web.address))
    })?;
    let routes = lankeeper::web::routes(dhcp.pool(), dns.resolver(), Arc::clone(&metrics));
    tokio::spawn(warp::serve(routes).run(web_addr));
    info!("admin API listening on {}", web_addr);

    tokio::select! {
        result = dhcp.run() => result,
        result = dns.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal, stopping servers...");
            dns.stop();
            if let Err(save_error) = dhcp.save_leases().await {
                error!("failed to save leases on shutdown: {}", save_error);
                return Err(save_error);
            }
            Ok(())
        }
    }
}

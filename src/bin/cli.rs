//! CLI for cluster administration

use clap::{Parser, Subcommand, ValueEnum};
use vnetdir::client::AdminClient;
use vnetdir::common::{format_load, parse_duration};
use vnetdir::migration::MigrationKind;
use vnetdir::DomainId;

#[derive(Parser)]
#[command(name = "vnetdir")]
#[command(about = "vnetdir directory cluster CLI")]
#[command(version)]
struct Cli {
    /// Admin URL of the node to talk to
    #[arg(long, default_value = "http://localhost:7400")]
    node: String,

    /// Request timeout, e.g. "5s"
    #[arg(long, default_value = "5s")]
    timeout: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show cluster, leader and node status
    Status,

    /// Domain commands
    Domain {
        #[command(subcommand)]
        command: DomainCommands,
    },

    /// Node commands
    Node {
        #[command(subcommand)]
        command: NodeCommands,
    },

    /// Mark the local node active
    Activate,

    /// Mark the local node inactive (frozen, excluded from placement)
    Deactivate,

    /// Set the heavy-load threshold (percent)
    Threshold { value: f64 },

    /// Force a domain mapping exchange
    ExchangeMapping,

    /// Forget every peer and hosting record on the node
    Reset {
        /// Required; the teardown cannot be undone
        #[arg(long)]
        yes: bool,
    },

    /// Enable or disable liveness status changes
    StatusChange {
        #[arg(value_enum)]
        mode: Toggle,
    },

    /// Migration commands
    Migration {
        #[command(subcommand)]
        command: MigrationCommands,
    },

    /// Print Prometheus metrics
    Metrics,
}

#[derive(Subcommand)]
enum DomainCommands {
    /// List domains and their hosts
    List,
    /// Show one domain
    Show { id: u32 },
    /// Host a new domain on the node
    Host {
        id: u32,
        #[arg(long, default_value = "1")]
        replication_factor: u32,
    },
    /// Delete a domain
    Delete { id: u32 },
}

#[derive(Subcommand)]
enum NodeCommands {
    /// Show one node
    Show { address: String },
    /// Add a node to the membership
    Add { address: String },
    /// Remove a node from the membership
    Remove { address: String },
}

#[derive(Subcommand)]
enum MigrationCommands {
    /// List active migrations on the node
    List,
    /// Migrate a locally hosted domain
    Start {
        domain: u32,
        destination: String,
        /// Unhost on the source after commit
        #[arg(long = "move")]
        unhost_source: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Toggle {
    Enable,
    Disable,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let client = AdminClient::new(&cli.node, parse_duration(&cli.timeout)?)?;

    match cli.command {
        Commands::Status => {
            let status = client.status().await?;
            println!("Node: {}", status.node);
            match status.leader {
                Some(leader) if status.is_leader => println!("Leader: {} (this node)", leader),
                Some(leader) => println!("Leader: {}", leader),
                None => println!("Leader: none"),
            }
            println!("  Config version: {}", status.config_version);
            println!("  Local active: {}", status.local_active);
            println!("  Status changes allowed: {}", status.status_change_allow);
            println!("  Heavy-load threshold: {}", format_load(status.heavy_load_threshold));
            println!(
                "  Migrations: {} (weight {}/{})",
                status.migrations, status.active_weight, status.weight_ceiling
            );
            println!("  Domains: {}", status.domains);
            println!("Nodes:");
            for node in status.nodes {
                println!(
                    "  {:<22} {:<10} load {:>6}  domains {}  last contact {:.1}s",
                    node.addr.to_string(),
                    node.liveness.to_string(),
                    format_load(node.load),
                    node.hosted,
                    node.last_contact_secs
                );
            }
        }

        Commands::Domain { command } => match command {
            DomainCommands::List => {
                for domain in client.domains().await? {
                    let hosts: Vec<_> = domain.hosts.iter().map(|h| h.to_string()).collect();
                    println!(
                        "{:>8}  rf {}  live {}/{}  hosts {}{}",
                        domain.domain,
                        domain.replication_factor,
                        domain.live_hosts.len(),
                        domain.hosts.len(),
                        hosts.join(","),
                        if domain.no_live_hosts { "  UNSERVED" } else { "" }
                    );
                }
            }
            DomainCommands::Show { id } => {
                let domain = client.domain(DomainId(id)).await?;
                println!("{}", serde_json::to_string_pretty(&domain)?);
            }
            DomainCommands::Host {
                id,
                replication_factor,
            } => {
                client.host_domain(DomainId(id), replication_factor).await?;
                println!("Domain {} hosted (replication factor {})", id, replication_factor);
            }
            DomainCommands::Delete { id } => {
                client.delete_domain(DomainId(id)).await?;
                println!("Domain {} deleted", id);
            }
        },

        Commands::Node { command } => match command {
            NodeCommands::Show { address } => {
                let node = client.node(&address).await?;
                println!("{}", serde_json::to_string_pretty(&node)?);
            }
            NodeCommands::Add { address } => {
                client.add_node(&address).await?;
                println!("Node {} added", address);
            }
            NodeCommands::Remove { address } => {
                client.remove_node(&address).await?;
                println!("Node {} removed", address);
            }
        },

        Commands::Activate => {
            client.set_local_active(true).await?;
            println!("Node active");
        }

        Commands::Deactivate => {
            client.set_local_active(false).await?;
            println!("Node inactive");
        }

        Commands::Threshold { value } => {
            client.set_heavy_load_threshold(value).await?;
            println!("Heavy-load threshold set to {}", format_load(value));
        }

        Commands::ExchangeMapping => {
            client.exchange_mapping().await?;
            println!("Mapping exchange requested");
        }

        Commands::Reset { yes } => {
            if !yes {
                anyhow::bail!("refusing to reset without --yes");
            }
            client.reset_cluster().await?;
            println!("Cluster view reset");
        }

        Commands::StatusChange { mode } => {
            let allow = matches!(mode, Toggle::Enable);
            client.set_status_change_allow(allow).await?;
            println!("Status changes {}", if allow { "enabled" } else { "disabled" });
        }

        Commands::Migration { command } => match command {
            MigrationCommands::List => {
                for m in client.migrations().await? {
                    println!(
                        "{}  domain {}  {} -> {}  {:?}  stage {}  weight {}  pending {}  unacked {}{}",
                        m.id,
                        m.domain,
                        m.source,
                        m.destination,
                        m.kind,
                        m.stage,
                        m.weight,
                        m.pending,
                        m.unacked,
                        if m.valid { "" } else { "  (invalid)" }
                    );
                }
            }
            MigrationCommands::Start {
                domain,
                destination,
                unhost_source,
            } => {
                let kind = if unhost_source {
                    MigrationKind::Move
                } else {
                    MigrationKind::AddReplica
                };
                let started = client
                    .start_migration(DomainId(domain), &destination, kind)
                    .await?;
                println!("Migration {} started", started.session);
            }
        },

        Commands::Metrics => {
            print!("{}", client.metrics().await?);
        }
    }

    Ok(())
}

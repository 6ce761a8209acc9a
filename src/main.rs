use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use tonic::transport::Channel;
use tonic::Code;
use tracing_subscriber::EnvFilter;

use raft_kv::config::{parse_peers, NodeConfig};
use raft_kv::node::Node;
use raft_kv::proto::kv_service_client::KvServiceClient;
use raft_kv::proto::{DeleteRequest, GetRequest, GetStatusRequest, GetStatusResponse, PutRequest};
use raft_kv::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "raft-kv")]
#[command(version)]
#[command(about = "A replicated key-value store built on Raft consensus")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a replica
    Server(ServerArgs),

    /// Key-value commands
    Kv {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: KvCommands,
    },

    /// Cluster management commands
    Cluster {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: ClusterCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Node ID (unique identifier for this replica)
    #[arg(long, default_value = "1")]
    node_id: u64,

    /// Port to listen on for gRPC
    #[arg(long, default_value = "50051")]
    port: u16,

    /// Peer addresses (comma-separated, format: "id:host:port")
    /// Example: "2:127.0.0.1:50052,3:127.0.0.1:50053"
    #[arg(long, default_value = "")]
    peers: String,

    /// Directory for the persisted term, vote and log. State is kept in
    /// memory only when omitted.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Lower bound of the randomized election timeout
    #[arg(long, default_value = "150")]
    election_timeout_min_ms: u64,

    /// Upper bound of the randomized election timeout
    #[arg(long, default_value = "300")]
    election_timeout_max_ms: u64,

    /// Leader heartbeat period
    #[arg(long, default_value = "50")]
    heartbeat_interval_ms: u64,

    /// How long to wait for every peer to come up before giving up
    #[arg(long, default_value = "30000")]
    startup_timeout_ms: u64,
}

// =============================================================================
// Client Arguments (shared by kv and cluster commands)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Server address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:50051")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// KV Commands
// =============================================================================

#[derive(clap::Subcommand, Debug, Clone)]
enum KvCommands {
    /// Set a key to a value
    Put { key: String, value: String },
    /// Read a key from the leader
    Get { key: String },
    /// Remove a key
    Delete { key: String },
}

// =============================================================================
// Cluster Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum ClusterCommands {
    /// Get replica status and peer reachability
    Status,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct PutOutput {
    key: String,
    index: u64,
    previous: Option<String>,
}

#[derive(Serialize)]
struct GetOutput {
    key: String,
    found: bool,
    value: Option<String>,
}

#[derive(Serialize)]
struct DeleteOutput {
    key: String,
    index: u64,
    existed: bool,
}

#[derive(Serialize)]
struct PeerOutput {
    node_id: u64,
    address: String,
    reachable: bool,
}

#[derive(Serialize)]
struct StatusOutput {
    node_id: u64,
    role: String,
    term: u64,
    leader_id: Option<u64>,
    commit_index: u64,
    last_applied: u64,
    last_log_index: u64,
    peers: Vec<PeerOutput>,
}

// =============================================================================
// Helper Functions
// =============================================================================

async fn connect(addr: &str) -> Result<KvServiceClient<Channel>, Box<dyn std::error::Error>> {
    let channel = Channel::from_shared(addr.to_string())?.connect().await?;
    Ok(KvServiceClient::new(channel))
}

/// Find the leader's address by asking the replica we are connected to.
async fn find_leader_addr(
    client: &mut KvServiceClient<Channel>,
    original_addr: &str,
) -> Result<Option<String>, Box<dyn std::error::Error>> {
    let status = client
        .get_status(GetStatusRequest {})
        .await?
        .into_inner();
    if !status.has_leader {
        return Ok(None);
    }

    let Some(peer) = status.peers.iter().find(|p| p.node_id == status.leader_id) else {
        return Ok(None);
    };

    // Handle 0.0.0.0 addresses - use the original host with the leader's port
    let addr = match peer.addr.strip_prefix("0.0.0.0:") {
        Some(port) => {
            let original_host = original_addr
                .trim_start_matches("http://")
                .split(':')
                .next()
                .unwrap_or("127.0.0.1");
            format!("{}:{}", original_host, port)
        }
        None => peer.addr.clone(),
    };
    Ok(Some(format!("http://{}", addr)))
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;

    let config = NodeConfig {
        node_id: args.node_id,
        listen_addr,
        peers: parse_peers(&args.peers)?,
        election_timeout_min_ms: args.election_timeout_min_ms,
        election_timeout_max_ms: args.election_timeout_max_ms,
        heartbeat_interval_ms: args.heartbeat_interval_ms,
        startup_timeout_ms: args.startup_timeout_ms,
        data_dir: args.data_dir,
        ..NodeConfig::default()
    };
    config.validate()?;

    tracing::info!(
        node_id = config.node_id,
        listen_addr = %config.listen_addr,
        data_dir = ?config.data_dir,
        peers = ?config.peers.iter().map(|p| format!("{}:{}", p.node_id, p.addr)).collect::<Vec<_>>(),
        "Starting raft-kv replica"
    );

    let shutdown = install_shutdown_handler()?;
    let (node, raft_rx) = Node::new(config)?;
    node.run(raft_rx, shutdown).await?;

    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

/// Run one kv command against `client`.
async fn execute_kv(
    client: &mut KvServiceClient<Channel>,
    command: &KvCommands,
    output_format: &OutputFormat,
) -> Result<(), tonic::Status> {
    match command {
        KvCommands::Put { key, value } => {
            let resp = client
                .put(PutRequest {
                    key: key.clone(),
                    value: value.clone(),
                })
                .await?
                .into_inner();
            let previous = (!resp.previous.is_empty()).then_some(resp.previous);
            match output_format {
                OutputFormat::Json => print_json(&PutOutput {
                    key: key.clone(),
                    index: resp.index,
                    previous,
                }),
                OutputFormat::Table => {
                    println!("OK (index {})", resp.index);
                    if let Some(previous) = previous {
                        println!("Previous: {}", previous);
                    }
                }
            }
        }
        KvCommands::Get { key } => {
            let resp = client
                .get(GetRequest { key: key.clone() })
                .await?
                .into_inner();
            match output_format {
                OutputFormat::Json => print_json(&GetOutput {
                    key: key.clone(),
                    found: resp.found,
                    value: resp.found.then_some(resp.value),
                }),
                OutputFormat::Table => {
                    if resp.found {
                        println!("{}", resp.value);
                    } else {
                        println!("(not found)");
                    }
                }
            }
        }
        KvCommands::Delete { key } => {
            let resp = client
                .delete(DeleteRequest { key: key.clone() })
                .await?
                .into_inner();
            match output_format {
                OutputFormat::Json => print_json(&DeleteOutput {
                    key: key.clone(),
                    index: resp.index,
                    existed: resp.existed,
                }),
                OutputFormat::Table => {
                    if resp.existed {
                        println!("Deleted (index {})", resp.index);
                    } else {
                        println!("Key did not exist (index {})", resp.index);
                    }
                }
            }
        }
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Error: failed to encode output: {}", e),
    }
}

async fn handle_kv(
    client: &mut KvServiceClient<Channel>,
    command: KvCommands,
    client_args: &ClientArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let status = match execute_kv(client, &command, &client_args.output).await {
        Ok(()) => return Ok(()),
        Err(status) => status,
    };

    if status.code() != Code::FailedPrecondition || !status.message().contains("Not the leader") {
        eprintln!("Error: {}", status.message());
        std::process::exit(1);
    }

    // Try to find the leader and redirect
    let Ok(Some(leader_url)) = find_leader_addr(client, &client_args.addr).await else {
        eprintln!("Error: {}", status.message());
        eprintln!("Hint: Use -a to specify the leader's address, e.g.:");
        eprintln!("  raft-kv kv -a http://<leader-ip>:<port> put <key> <value>");
        std::process::exit(1);
    };

    eprintln!("Redirecting to leader at {}...", leader_url);
    let mut leader_client = connect(&leader_url).await?;
    if let Err(e) = execute_kv(&mut leader_client, &command, &client_args.output).await {
        eprintln!("Error: request failed after redirect: {}", e.message());
        std::process::exit(1);
    }
    Ok(())
}

async fn handle_cluster_status(
    client: &mut KvServiceClient<Channel>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let response: GetStatusResponse = client
        .get_status(GetStatusRequest {})
        .await?
        .into_inner();
    let leader_id = response.has_leader.then_some(response.leader_id);

    match output_format {
        OutputFormat::Json => {
            let output = StatusOutput {
                node_id: response.node_id,
                role: response.role,
                term: response.term,
                leader_id,
                commit_index: response.commit_index,
                last_applied: response.last_applied,
                last_log_index: response.last_log_index,
                peers: response
                    .peers
                    .into_iter()
                    .map(|p| PeerOutput {
                        node_id: p.node_id,
                        address: p.addr,
                        reachable: p.reachable,
                    })
                    .collect(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Replica Status");
            println!("{}", "=".repeat(40));
            println!("Node:         {}", response.node_id);
            println!("Role:         {}", response.role);
            println!("Term:         {}", response.term);
            match leader_id {
                Some(id) => println!("Leader:       Node {}", id),
                None => println!("Leader:       unknown"),
            }
            println!("Commit index: {}", response.commit_index);
            println!("Last applied: {}", response.last_applied);
            println!("Log length:   {}", response.last_log_index);
            println!();
            println!("Peers:");
            println!("{:<8} {:<25} STATUS", "ID", "ADDRESS");
            println!("{}", "-".repeat(45));
            for peer in response.peers {
                let status = if peer.reachable { "reachable" } else { "unreachable" };
                let status_icon = if peer.reachable { "[+]" } else { "[-]" };
                println!(
                    "{:<8} {:<25} {} {}",
                    peer.node_id, peer.addr, status_icon, status
                );
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Kv { client, command } => {
            let mut grpc_client = connect(&client.addr).await?;
            handle_kv(&mut grpc_client, command, &client).await?;
        }
        Commands::Cluster { client, command } => {
            let mut grpc_client = connect(&client.addr).await?;

            match command {
                ClusterCommands::Status => {
                    handle_cluster_status(&mut grpc_client, &client.output).await?;
                }
            }
        }
    }

    Ok(())
}

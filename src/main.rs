use std::collections::HashMap;
use std::net::SocketAddr;

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use serde_json::json;
use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use dispatch_lite::config::NodeConfig;
use dispatch_lite::matching::score::PriorityConfig;
use dispatch_lite::model::{
    Account, CancelParty, JobRequest, Provider, ServiceKind, SettlementRecord, WalletLedgerEntry,
};
use dispatch_lite::node::Node;
use dispatch_lite::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "dispatch-lite")]
#[command(version)]
#[command(about = "A real-time dispatch core for on-demand ride, delivery, and shopping jobs")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a dispatch-lite server node
    Server(ServerArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Provider management commands
    Provider {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: ProviderCommands,
    },

    /// Wallet commands
    Wallet {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: WalletCommands,
    },

    /// Priority configuration commands
    Config {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Show node status
    Status {
        #[command(flatten)]
        client: ClientArgs,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Host to bind the HTTP API on
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(long, default_value = "8080")]
    port: u16,

    /// Claim timeout in milliseconds (past it, the claim outcome is unknown)
    #[arg(long, default_value = "2000")]
    claim_timeout_ms: u64,

    /// Provider heartbeat timeout in milliseconds
    #[arg(long, default_value = "30000")]
    provider_timeout_ms: u64,

    /// Minutes after completion during which a tip is still accepted
    #[arg(long, default_value = "1440")]
    tip_window_mins: i64,

    /// Refund the booking hold even when cancellation happens after pickup
    #[arg(long)]
    refund_after_pickup: bool,

    /// Commission rate override for ride jobs (fraction, e.g. 0.20)
    #[arg(long)]
    ride_commission: Option<f64>,

    /// Commission rate override for delivery jobs
    #[arg(long)]
    delivery_commission: Option<f64>,

    /// Commission rate override for shopping jobs
    #[arg(long)]
    shopping_commission: Option<f64>,
}

// =============================================================================
// Client Arguments (shared by all client commands)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Server address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:8080")]
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
// Job Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Create a new job with its booking hold
    Create {
        /// Requester ID (UUID)
        #[arg(long)]
        requester: String,

        /// Service category: ride, delivery, or shopping
        #[arg(long)]
        service: String,

        /// Declared price, e.g. "150.00"
        #[arg(long)]
        price: String,

        /// Pickup coordinate as "lat,lng"
        #[arg(long)]
        pickup: Option<String>,

        /// Dropoff coordinate as "lat,lng"
        #[arg(long)]
        dropoff: Option<String>,

        /// Surge multiplier (>= 1.0)
        #[arg(long)]
        surge: Option<f64>,

        /// Requester rating in [1, 5]
        #[arg(long)]
        rating: Option<f64>,
    },
    /// Get a specific job
    Status {
        /// The job ID (UUID)
        job_id: String,
    },
    /// List jobs
    List {
        /// Number of jobs per page
        #[arg(long, default_value = "50")]
        limit: usize,

        /// Page offset
        #[arg(long, default_value = "0")]
        offset: usize,
    },
    /// Claim a pending job for a provider
    Claim {
        /// The job ID (UUID)
        job_id: String,

        /// Provider ID (UUID)
        #[arg(long)]
        provider: String,
    },
    /// Advance a job to the next lifecycle phase
    Advance {
        /// The job ID (UUID)
        job_id: String,

        /// Target status; category synonyms like "delivering" work too
        target: String,

        /// Fare base component, e.g. "90.00" (completion only)
        #[arg(long)]
        base: Option<String>,

        /// Fare distance component
        #[arg(long)]
        distance: Option<String>,

        /// Fare time component
        #[arg(long)]
        time: Option<String>,
    },
    /// Cancel a job
    Cancel {
        /// The job ID (UUID)
        job_id: String,

        /// Who cancels: requester, provider, or system
        #[arg(long, default_value = "requester")]
        party: String,

        /// Reason for the cancellation
        #[arg(long)]
        reason: Option<String>,
    },
    /// Tip the provider of a completed job
    Tip {
        /// The job ID (UUID)
        job_id: String,

        /// Tip amount, e.g. "15.00"
        amount: String,
    },
    /// Show the settlement record of a completed job
    Settlement {
        /// The job ID (UUID)
        job_id: String,
    },
}

// =============================================================================
// Provider Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum ProviderCommands {
    /// Register or update a provider profile
    Register {
        /// Provider ID (UUID); generated when omitted
        #[arg(long)]
        id: Option<String>,

        /// Comma-separated capabilities, e.g. "ride,delivery"
        #[arg(long, default_value = "ride,delivery,shopping")]
        capabilities: String,

        /// Service radius in kilometers
        #[arg(long)]
        radius_km: Option<f64>,

        /// Current location as "lat,lng"
        #[arg(long)]
        location: Option<String>,

        /// Register as online
        #[arg(long)]
        online: bool,
    },
    /// Send a heartbeat (registers unknown providers)
    Heartbeat {
        /// Provider ID (UUID)
        provider_id: String,

        /// Current location as "lat,lng"
        #[arg(long)]
        location: Option<String>,

        /// Mark the provider offline instead of online
        #[arg(long)]
        offline: bool,
    },
    /// List all providers
    List,
    /// Show the ranked claimable jobs for a provider
    Jobs {
        /// Provider ID (UUID)
        provider_id: String,
    },
    /// Stream live pool updates for a provider
    Watch {
        /// Provider ID (UUID)
        provider_id: String,
    },
}

// =============================================================================
// Wallet Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum WalletCommands {
    /// Show a wallet's balance and ledger entries
    Show {
        /// Wallet kind: requester, provider, escrow, or platform
        kind: String,

        /// Owner ID (UUID; ignored for escrow and platform)
        id: String,
    },
    /// Deposit funds into a requester or provider wallet
    Deposit {
        /// Wallet kind: requester or provider
        kind: String,

        /// Owner ID (UUID)
        id: String,

        /// Amount, e.g. "200.00"
        amount: String,
    },
}

// =============================================================================
// Config Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum ConfigCommands {
    /// Show the active priority configuration
    Show,
    /// Activate a new priority weight set
    SetPriority {
        /// Name for the new config
        #[arg(long)]
        name: Option<String>,

        /// Distance weight in [0, 1]
        #[arg(long)]
        distance: f64,

        /// Price weight in [0, 1]
        #[arg(long)]
        price: f64,

        /// Rating weight in [0, 1]
        #[arg(long)]
        rating: f64,

        /// Age weight in [0, 1]
        #[arg(long)]
        age: f64,
    },
}

// =============================================================================
// Response Types
// =============================================================================

#[derive(Deserialize)]
struct ClaimOut {
    outcome: String,
    job: JobRequest,
}

#[derive(Deserialize)]
struct JobPageOut {
    jobs: Vec<JobRequest>,
    total: usize,
    offset: usize,
    limit: usize,
}

#[derive(Deserialize)]
struct OfferOut {
    #[serde(flatten)]
    job: JobRequest,
    distance_km: f64,
}

#[derive(Deserialize)]
struct RankedOut {
    #[serde(flatten)]
    job: JobRequest,
    distance_km: f64,
    score: f64,
}

#[derive(Deserialize)]
struct WalletOut {
    account: Account,
    balance_cents: i64,
    entries: Vec<WalletLedgerEntry>,
}

#[derive(Deserialize)]
struct StatusOut {
    uptime_secs: i64,
    draining: bool,
    sessions: usize,
    jobs: HashMap<String, usize>,
    providers_total: usize,
    providers_online: usize,
    priority: PriorityConfig,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn parse_uuid(s: &str, what: &str) -> Result<Uuid, Box<dyn std::error::Error>> {
    Uuid::parse_str(s).map_err(|_| format!("invalid {} id '{}', expected a UUID", what, s).into())
}

fn parse_coordinate(s: &str) -> Result<serde_json::Value, Box<dyn std::error::Error>> {
    let parts: Vec<&str> = s.split(',').map(str::trim).collect();
    if parts.len() != 2 {
        return Err(format!("invalid coordinate '{}', expected \"lat,lng\"", s).into());
    }
    let lat: f64 = parts[0]
        .parse()
        .map_err(|_| format!("invalid latitude '{}'", parts[0]))?;
    let lng: f64 = parts[1]
        .parse()
        .map_err(|_| format!("invalid longitude '{}'", parts[1]))?;
    Ok(json!({ "lat": lat, "lng": lng }))
}

/// Parse a money amount like "150.00" or "150" into integer cents.
fn parse_money(s: &str) -> Result<i64, Box<dyn std::error::Error>> {
    let s = s.trim();
    let bad = || format!("invalid amount '{}', expected e.g. \"150.00\"", s);

    let (whole, frac) = match s.split_once('.') {
        Some((w, f)) => (w, f),
        None => (s, ""),
    };
    if whole.is_empty() || whole.starts_with('-') || frac.len() > 2 {
        return Err(bad().into());
    }
    let whole: i64 = whole.parse().map_err(|_| bad())?;
    let frac: i64 = if frac.is_empty() {
        0
    } else {
        let padded = format!("{:0<2}", frac);
        padded.parse().map_err(|_| bad())?
    };
    Ok(whole * 100 + frac)
}

fn format_money(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let cents = cents.abs();
    format!("{}{}.{:02}", sign, cents / 100, cents % 100)
}

fn api_url(base: &str, path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path)
}

/// Surface a non-success response the way the server reported it.
async fn fail_on_error(response: reqwest::Response) -> Result<reqwest::Response, Box<dyn std::error::Error>> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body: serde_json::Value = response.json().await.unwrap_or(serde_json::Value::Null);
    let message = body
        .get("error")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown error");
    eprintln!("Error: {} ({})", message, status);
    std::process::exit(1);
}

fn print_job_table(job: &JobRequest) {
    println!("Job ID:     {}", job.id);
    println!("Service:    {}", job.service);
    println!("Status:     {} ({})", job.status, job.phase_label());
    println!("Price:      {}", format_money(job.price_cents));
    if let Some(final_price) = job.final_price_cents {
        println!("Final:      {}", format_money(final_price));
    }
    if let Some(provider_id) = job.provider_id {
        println!("Provider:   {}", provider_id);
    }
    if let Some(by) = job.cancelled_by {
        println!("Cancelled:  by {}", by);
    }
    if let Some(reason) = &job.cancel_reason {
        println!("Reason:     {}", reason);
    }
    if job.manual_review {
        println!("Review:     flagged for manual review");
    }
    println!("Created:    {}", job.created_at.to_rfc3339());
}

fn print_settlement_table(record: &SettlementRecord) {
    println!("Job ID:      {}", record.job_id);
    println!("Gross:       {}", format_money(record.gross_cents));
    println!(
        "Commission:  {} (rate {:.2})",
        format_money(record.commission_cents),
        record.commission_rate
    );
    println!("Worker net:  {}", format_money(record.worker_net_cents));
    if let Some(tip) = record.tip_cents {
        println!("Tip:         {}", format_money(tip));
    }
    println!("Settled:     {}", record.settled_at.to_rfc3339());
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

    let listen_addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;

    let mut config = NodeConfig::new(listen_addr);
    config.claim_timeout_ms = args.claim_timeout_ms;
    config.provider_timeout_ms = args.provider_timeout_ms;
    config.tip_window_mins = args.tip_window_mins;
    config.cancellation.refund_after_pickup = args.refund_after_pickup;
    if let Some(rate) = args.ride_commission {
        config.commissions.ride = rate;
    }
    if let Some(rate) = args.delivery_commission {
        config.commissions.delivery = rate;
    }
    if let Some(rate) = args.shopping_commission {
        config.commissions.shopping = rate;
    }
    config.validate()?;

    tracing::info!(
        listen_addr = %config.listen_addr,
        claim_timeout_ms = config.claim_timeout_ms,
        provider_timeout_ms = config.provider_timeout_ms,
        refund_after_pickup = config.cancellation.refund_after_pickup,
        "Starting dispatch-lite node"
    );

    let shutdown = install_shutdown_handler();
    let node = Node::new(config);
    node.run(shutdown).await?;

    Ok(())
}

// =============================================================================
// Job Command Handlers
// =============================================================================

#[allow(clippy::too_many_arguments)]
async fn handle_job_create(
    http: &reqwest::Client,
    client: &ClientArgs,
    requester: String,
    service: String,
    price: String,
    pickup: Option<String>,
    dropoff: Option<String>,
    surge: Option<f64>,
    rating: Option<f64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let requester_id = parse_uuid(&requester, "requester")?;
    if ServiceKind::parse(&service).is_none() {
        return Err(format!(
            "unknown service '{}', expected ride, delivery, or shopping",
            service
        )
        .into());
    }
    let price_cents = parse_money(&price)?;
    let pickup = pickup.as_deref().map(parse_coordinate).transpose()?;
    let dropoff = dropoff.as_deref().map(parse_coordinate).transpose()?;

    let body = json!({
        "requester_id": requester_id,
        "service": service,
        "price_cents": price_cents,
        "pickup": pickup,
        "dropoff": dropoff,
        "surge_multiplier": surge,
        "requester_rating": rating,
    });

    let response = http
        .post(api_url(&client.addr, "/api/jobs"))
        .json(&body)
        .send()
        .await?;
    let job: JobRequest = fail_on_error(response).await?.json().await?;

    match client.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&job)?),
        OutputFormat::Table => {
            println!("Job created!");
            print_job_table(&job);
        }
    }
    Ok(())
}

async fn handle_job_status(
    http: &reqwest::Client,
    client: &ClientArgs,
    job_id: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let id = parse_uuid(&job_id, "job")?;
    let response = http
        .get(api_url(&client.addr, &format!("/api/jobs/{}", id)))
        .send()
        .await?;
    let job: JobRequest = fail_on_error(response).await?.json().await?;

    match client.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&job)?),
        OutputFormat::Table => print_job_table(&job),
    }
    Ok(())
}

async fn handle_job_list(
    http: &reqwest::Client,
    client: &ClientArgs,
    limit: usize,
    offset: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = http
        .get(api_url(
            &client.addr,
            &format!("/api/jobs?offset={}&limit={}", offset, limit),
        ))
        .send()
        .await?;
    let page: JobPageOut = fail_on_error(response).await?.json().await?;

    match client.output {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "jobs": page.jobs,
                    "total": page.total,
                    "offset": page.offset,
                    "limit": page.limit,
                }))?
            );
        }
        OutputFormat::Table => {
            if page.jobs.is_empty() {
                println!("No jobs found.");
            } else {
                println!(
                    "{:<38} {:<12} {:<10} {:<10} PROVIDER",
                    "JOB ID", "STATUS", "SERVICE", "PRICE"
                );
                println!("{}", "-".repeat(110));
                for job in &page.jobs {
                    let provider = job
                        .provider_id
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "{:<38} {:<12} {:<10} {:<10} {}",
                        job.id,
                        job.status.to_string(),
                        job.service.to_string(),
                        format_money(job.price_cents),
                        provider
                    );
                }
                println!();
                println!(
                    "Showing {} of {} jobs (offset {})",
                    page.jobs.len(),
                    page.total,
                    page.offset
                );
            }
        }
    }
    Ok(())
}

async fn handle_job_claim(
    http: &reqwest::Client,
    client: &ClientArgs,
    job_id: String,
    provider: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let id = parse_uuid(&job_id, "job")?;
    let provider_id = parse_uuid(&provider, "provider")?;

    let response = http
        .post(api_url(&client.addr, &format!("/api/jobs/{}/claim", id)))
        .json(&json!({ "provider_id": provider_id }))
        .send()
        .await?;
    let claim: ClaimOut = fail_on_error(response).await?.json().await?;

    match client.output {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "outcome": claim.outcome,
                    "job": claim.job,
                }))?
            );
        }
        OutputFormat::Table => {
            println!("Claim {}!", claim.outcome);
            print_job_table(&claim.job);
        }
    }
    Ok(())
}

async fn handle_job_advance(
    http: &reqwest::Client,
    client: &ClientArgs,
    job_id: String,
    target: String,
    base: Option<String>,
    distance: Option<String>,
    time: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let id = parse_uuid(&job_id, "job")?;

    let fare = if base.is_none() && distance.is_none() && time.is_none() {
        None
    } else {
        Some(json!({
            "base_cents": base.as_deref().map(parse_money).transpose()?.unwrap_or(0),
            "distance_cents": distance.as_deref().map(parse_money).transpose()?.unwrap_or(0),
            "time_cents": time.as_deref().map(parse_money).transpose()?.unwrap_or(0),
        }))
    };

    let response = http
        .post(api_url(&client.addr, &format!("/api/jobs/{}/advance", id)))
        .json(&json!({ "target": target, "fare": fare }))
        .send()
        .await?;
    let job: JobRequest = fail_on_error(response).await?.json().await?;

    match client.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&job)?),
        OutputFormat::Table => {
            println!("Job advanced to {} ({})", job.status, job.phase_label());
            print_job_table(&job);
        }
    }
    Ok(())
}

async fn handle_job_cancel(
    http: &reqwest::Client,
    client: &ClientArgs,
    job_id: String,
    party: String,
    reason: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let id = parse_uuid(&job_id, "job")?;
    if CancelParty::parse(&party).is_none() {
        return Err(format!(
            "unknown party '{}', expected requester, provider, or system",
            party
        )
        .into());
    }

    let response = http
        .post(api_url(&client.addr, &format!("/api/jobs/{}/cancel", id)))
        .json(&json!({ "party": party, "reason": reason }))
        .send()
        .await?;
    let job: JobRequest = fail_on_error(response).await?.json().await?;

    match client.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&job)?),
        OutputFormat::Table => {
            println!("Job cancelled.");
            print_job_table(&job);
        }
    }
    Ok(())
}

async fn handle_job_tip(
    http: &reqwest::Client,
    client: &ClientArgs,
    job_id: String,
    amount: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let id = parse_uuid(&job_id, "job")?;
    let amount_cents = parse_money(&amount)?;

    let response = http
        .post(api_url(&client.addr, &format!("/api/jobs/{}/tip", id)))
        .json(&json!({ "amount_cents": amount_cents }))
        .send()
        .await?;
    let record: SettlementRecord = fail_on_error(response).await?.json().await?;

    match client.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&record)?),
        OutputFormat::Table => {
            println!("Tip applied!");
            print_settlement_table(&record);
        }
    }
    Ok(())
}

async fn handle_job_settlement(
    http: &reqwest::Client,
    client: &ClientArgs,
    job_id: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let id = parse_uuid(&job_id, "job")?;
    let response = http
        .get(api_url(
            &client.addr,
            &format!("/api/jobs/{}/settlement", id),
        ))
        .send()
        .await?;
    let record: SettlementRecord = fail_on_error(response).await?.json().await?;

    match client.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&record)?),
        OutputFormat::Table => print_settlement_table(&record),
    }
    Ok(())
}

// =============================================================================
// Provider Command Handlers
// =============================================================================

async fn handle_provider_register(
    http: &reqwest::Client,
    client: &ClientArgs,
    id: Option<String>,
    capabilities: String,
    radius_km: Option<f64>,
    location: Option<String>,
    online: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let id = id.as_deref().map(|s| parse_uuid(s, "provider")).transpose()?;
    let capabilities: Vec<&str> = capabilities.split(',').map(str::trim).collect();
    for capability in &capabilities {
        if ServiceKind::parse(capability).is_none() {
            return Err(format!(
                "unknown capability '{}', expected ride, delivery, or shopping",
                capability
            )
            .into());
        }
    }
    let location = location.as_deref().map(parse_coordinate).transpose()?;

    let response = http
        .post(api_url(&client.addr, "/api/providers"))
        .json(&json!({
            "id": id,
            "capabilities": capabilities,
            "service_radius_km": radius_km,
            "location": location,
            "online": online,
        }))
        .send()
        .await?;
    let provider: Provider = fail_on_error(response).await?.json().await?;

    match client.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&provider)?),
        OutputFormat::Table => {
            println!("Provider registered!");
            println!("Provider ID: {}", provider.id);
            println!(
                "Capabilities: {}",
                provider
                    .capabilities
                    .iter()
                    .map(|c| c.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            println!("Radius:      {} km", provider.service_radius_km);
            println!("Online:      {}", provider.online);
        }
    }
    Ok(())
}

async fn handle_provider_heartbeat(
    http: &reqwest::Client,
    client: &ClientArgs,
    provider_id: String,
    location: Option<String>,
    offline: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let id = parse_uuid(&provider_id, "provider")?;
    let location = location.as_deref().map(parse_coordinate).transpose()?;

    let response = http
        .post(api_url(
            &client.addr,
            &format!("/api/providers/{}/heartbeat", id),
        ))
        .json(&json!({ "location": location, "online": !offline }))
        .send()
        .await?;
    let provider: Provider = fail_on_error(response).await?.json().await?;

    match client.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&provider)?),
        OutputFormat::Table => {
            let state = if provider.online { "online" } else { "offline" };
            println!("Heartbeat recorded, provider is {}", state);
        }
    }
    Ok(())
}

async fn handle_provider_list(
    http: &reqwest::Client,
    client: &ClientArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = http
        .get(api_url(&client.addr, "/api/providers"))
        .send()
        .await?;
    let providers: Vec<Provider> = fail_on_error(response).await?.json().await?;

    match client.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&providers)?),
        OutputFormat::Table => {
            if providers.is_empty() {
                println!("No providers registered.");
            } else {
                println!(
                    "{:<38} {:<8} {:<24} {:<10} CURRENT JOB",
                    "PROVIDER ID", "ONLINE", "CAPABILITIES", "RADIUS"
                );
                println!("{}", "-".repeat(110));
                for provider in &providers {
                    let capabilities = provider
                        .capabilities
                        .iter()
                        .map(|c| c.to_string())
                        .collect::<Vec<_>>()
                        .join(",");
                    let current = provider
                        .current_job
                        .map(|j| j.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "{:<38} {:<8} {:<24} {:<10} {}",
                        provider.id,
                        provider.online,
                        capabilities,
                        format!("{} km", provider.service_radius_km),
                        current
                    );
                }
            }
        }
    }
    Ok(())
}

async fn handle_provider_jobs(
    http: &reqwest::Client,
    client: &ClientArgs,
    provider_id: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let id = parse_uuid(&provider_id, "provider")?;
    let response = http
        .get(api_url(&client.addr, &format!("/api/providers/{}/jobs", id)))
        .send()
        .await?;
    let ranked: Vec<RankedOut> = fail_on_error(response).await?.json().await?;

    match client.output {
        OutputFormat::Json => {
            let jobs: Vec<serde_json::Value> = ranked
                .iter()
                .map(|r| {
                    json!({
                        "job": r.job,
                        "distance_km": r.distance_km,
                        "score": r.score,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&jobs)?);
        }
        OutputFormat::Table => {
            if ranked.is_empty() {
                println!("No claimable jobs in range.");
            } else {
                println!(
                    "{:<38} {:<10} {:<10} {:<10} SCORE",
                    "JOB ID", "SERVICE", "PRICE", "DISTANCE"
                );
                println!("{}", "-".repeat(85));
                for entry in &ranked {
                    println!(
                        "{:<38} {:<10} {:<10} {:<10} {:.4}",
                        entry.job.id,
                        entry.job.service.to_string(),
                        format_money(entry.job.price_cents),
                        format!("{:.2} km", entry.distance_km),
                        entry.score
                    );
                }
            }
        }
    }
    Ok(())
}

async fn handle_provider_watch(
    http: &reqwest::Client,
    client: &ClientArgs,
    provider_id: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let id = parse_uuid(&provider_id, "provider")?;
    let response = http
        .get(api_url(
            &client.addr,
            &format!("/api/providers/{}/stream", id),
        ))
        .send()
        .await?;
    let response = fail_on_error(response).await?;

    eprintln!("Watching pool updates for provider {} (Ctrl-C to stop)", id);

    let mut stream = response.bytes_stream();
    let mut buffer = String::new();
    let mut event_name = String::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(pos) = buffer.find('\n') {
            let line = buffer[..pos].trim_end_matches('\r').to_string();
            buffer.drain(..=pos);

            if line.starts_with(':') {
                // Keep-alive comment
                continue;
            }
            if let Some(name) = line.strip_prefix("event:") {
                event_name = name.trim().to_string();
                continue;
            }
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();

            match event_name.as_str() {
                "offered" => {
                    if let Ok(offer) = serde_json::from_str::<OfferOut>(data) {
                        println!(
                            "offered    {} {} {} at {:.2} km",
                            offer.job.id,
                            offer.job.service,
                            format_money(offer.job.price_cents),
                            offer.distance_km
                        );
                    }
                }
                "withdrawn" => {
                    if let Ok(value) = serde_json::from_str::<serde_json::Value>(data) {
                        let job_id = value.get("job_id").and_then(|v| v.as_str()).unwrap_or("?");
                        println!("withdrawn  {}", job_id);
                    }
                }
                "reset" => {
                    eprintln!("Session dropped by the server, resubscribe for a fresh snapshot");
                    return Ok(());
                }
                _ => {}
            }
        }
    }

    Ok(())
}

// =============================================================================
// Wallet, Config & Status Handlers
// =============================================================================

fn print_wallet_table(wallet: &WalletOut) {
    println!("Account: {}", wallet.account);
    println!("Balance: {}", format_money(wallet.balance_cents));
    if wallet.entries.is_empty() {
        println!("No ledger entries.");
    } else {
        println!();
        println!("{:<12} {:<12} {:<38} CREATED", "KIND", "AMOUNT", "JOB");
        println!("{}", "-".repeat(95));
        for entry in &wallet.entries {
            let job = entry
                .job_id
                .map(|j| j.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "{:<12} {:<12} {:<38} {}",
                entry.kind.to_string(),
                format_money(entry.amount_cents),
                job,
                entry.created_at.to_rfc3339()
            );
        }
    }
}

async fn handle_wallet_show(
    http: &reqwest::Client,
    client: &ClientArgs,
    kind: String,
    id: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let id = parse_uuid(&id, "wallet owner")?;
    let response = http
        .get(api_url(&client.addr, &format!("/api/wallets/{}/{}", kind, id)))
        .send()
        .await?;
    let wallet: WalletOut = fail_on_error(response).await?.json().await?;

    match client.output {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "account": wallet.account,
                    "balance_cents": wallet.balance_cents,
                    "entries": wallet.entries,
                }))?
            );
        }
        OutputFormat::Table => print_wallet_table(&wallet),
    }
    Ok(())
}

async fn handle_wallet_deposit(
    http: &reqwest::Client,
    client: &ClientArgs,
    kind: String,
    id: String,
    amount: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let id = parse_uuid(&id, "wallet owner")?;
    let amount_cents = parse_money(&amount)?;

    let response = http
        .post(api_url(
            &client.addr,
            &format!("/api/wallets/{}/{}/deposit", kind, id),
        ))
        .json(&json!({ "amount_cents": amount_cents }))
        .send()
        .await?;
    let wallet: WalletOut = fail_on_error(response).await?.json().await?;

    match client.output {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "account": wallet.account,
                    "balance_cents": wallet.balance_cents,
                }))?
            );
        }
        OutputFormat::Table => {
            println!("Deposit applied!");
            println!("Account: {}", wallet.account);
            println!("Balance: {}", format_money(wallet.balance_cents));
        }
    }
    Ok(())
}

async fn handle_config_show(
    http: &reqwest::Client,
    client: &ClientArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = http
        .get(api_url(&client.addr, "/api/config/priority"))
        .send()
        .await?;
    let config: PriorityConfig = fail_on_error(response).await?.json().await?;

    match client.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&config)?),
        OutputFormat::Table => {
            println!("Priority config: {} (version {})", config.name, config.version);
            println!("  distance: {:.2}", config.distance_weight);
            println!("  price:    {:.2}", config.price_weight);
            println!("  rating:   {:.2}", config.rating_weight);
            println!("  age:      {:.2}", config.age_weight);
        }
    }
    Ok(())
}

async fn handle_config_set_priority(
    http: &reqwest::Client,
    client: &ClientArgs,
    name: Option<String>,
    distance: f64,
    price: f64,
    rating: f64,
    age: f64,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = http
        .put(api_url(&client.addr, "/api/config/priority"))
        .json(&json!({
            "name": name,
            "distance_weight": distance,
            "price_weight": price,
            "rating_weight": rating,
            "age_weight": age,
        }))
        .send()
        .await?;
    let config: PriorityConfig = fail_on_error(response).await?.json().await?;

    match client.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&config)?),
        OutputFormat::Table => {
            println!(
                "Activated priority config {} (version {})",
                config.name, config.version
            );
        }
    }
    Ok(())
}

async fn handle_status(
    http: &reqwest::Client,
    client: &ClientArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = http.get(api_url(&client.addr, "/api/status")).send().await?;
    let status: StatusOut = fail_on_error(response).await?.json().await?;

    match client.output {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "uptime_secs": status.uptime_secs,
                    "draining": status.draining,
                    "sessions": status.sessions,
                    "jobs": status.jobs,
                    "providers_total": status.providers_total,
                    "providers_online": status.providers_online,
                    "priority": status.priority,
                }))?
            );
        }
        OutputFormat::Table => {
            println!("Node Status");
            println!("{}", "=".repeat(40));
            println!("Uptime:    {}s", status.uptime_secs);
            println!("Draining:  {}", status.draining);
            println!("Sessions:  {}", status.sessions);
            println!(
                "Providers: {} total, {} online",
                status.providers_total, status.providers_online
            );
            println!(
                "Priority:  {} (version {})",
                status.priority.name, status.priority.version
            );
            println!();
            if status.jobs.is_empty() {
                println!("No jobs yet.");
            } else {
                println!("Jobs by status:");
                let mut counts: Vec<_> = status.jobs.iter().collect();
                counts.sort();
                for (job_status, count) in counts {
                    println!("  {:<12} {}", job_status, count);
                }
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
        Commands::Job { client, command } => {
            let http = reqwest::Client::new();
            match command {
                JobCommands::Create {
                    requester,
                    service,
                    price,
                    pickup,
                    dropoff,
                    surge,
                    rating,
                } => {
                    handle_job_create(
                        &http, &client, requester, service, price, pickup, dropoff, surge, rating,
                    )
                    .await?;
                }
                JobCommands::Status { job_id } => {
                    handle_job_status(&http, &client, job_id).await?;
                }
                JobCommands::List { limit, offset } => {
                    handle_job_list(&http, &client, limit, offset).await?;
                }
                JobCommands::Claim { job_id, provider } => {
                    handle_job_claim(&http, &client, job_id, provider).await?;
                }
                JobCommands::Advance {
                    job_id,
                    target,
                    base,
                    distance,
                    time,
                } => {
                    handle_job_advance(&http, &client, job_id, target, base, distance, time)
                        .await?;
                }
                JobCommands::Cancel {
                    job_id,
                    party,
                    reason,
                } => {
                    handle_job_cancel(&http, &client, job_id, party, reason).await?;
                }
                JobCommands::Tip { job_id, amount } => {
                    handle_job_tip(&http, &client, job_id, amount).await?;
                }
                JobCommands::Settlement { job_id } => {
                    handle_job_settlement(&http, &client, job_id).await?;
                }
            }
        }
        Commands::Provider { client, command } => {
            let http = reqwest::Client::new();
            match command {
                ProviderCommands::Register {
                    id,
                    capabilities,
                    radius_km,
                    location,
                    online,
                } => {
                    handle_provider_register(
                        &http,
                        &client,
                        id,
                        capabilities,
                        radius_km,
                        location,
                        online,
                    )
                    .await?;
                }
                ProviderCommands::Heartbeat {
                    provider_id,
                    location,
                    offline,
                } => {
                    handle_provider_heartbeat(&http, &client, provider_id, location, offline)
                        .await?;
                }
                ProviderCommands::List => {
                    handle_provider_list(&http, &client).await?;
                }
                ProviderCommands::Jobs { provider_id } => {
                    handle_provider_jobs(&http, &client, provider_id).await?;
                }
                ProviderCommands::Watch { provider_id } => {
                    handle_provider_watch(&http, &client, provider_id).await?;
                }
            }
        }
        Commands::Wallet { client, command } => {
            let http = reqwest::Client::new();
            match command {
                WalletCommands::Show { kind, id } => {
                    handle_wallet_show(&http, &client, kind, id).await?;
                }
                WalletCommands::Deposit { kind, id, amount } => {
                    handle_wallet_deposit(&http, &client, kind, id, amount).await?;
                }
            }
        }
        Commands::Config { client, command } => {
            let http = reqwest::Client::new();
            match command {
                ConfigCommands::Show => {
                    handle_config_show(&http, &client).await?;
                }
                ConfigCommands::SetPriority {
                    name,
                    distance,
                    price,
                    rating,
                    age,
                } => {
                    handle_config_set_priority(&http, &client, name, distance, price, rating, age)
                        .await?;
                }
            }
        }
        Commands::Status { client } => {
            let http = reqwest::Client::new();
            handle_status(&http, &client).await?;
        }
    }

    Ok(())
}

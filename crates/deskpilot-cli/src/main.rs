//! deskpilot - operator CLI for the deskpilot gateway
//!
//! ## Commands
//!
//! - `build`: build the local desktop image and follow its progress
//! - `start` / `stop` / `delete`: manage the desktop container
//! - `status` / `watch`: one-shot or live container status
//! - `exec`: run a shell command inside the container
//! - `model`: model service health, listing and downloads

mod client;
mod follow;
mod retry;
mod sse;
#[cfg(test)]
mod test_support;

use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing::Level;

use crate::client::GatewayClient;
use crate::follow::{follow, is_terminal_status, wait_ready, Flow};
use crate::retry::RetryPolicy;
use crate::sse::SseRecord;

const READY_ATTEMPTS: u32 = 30;
const READY_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "deskpilot")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Drive a sandboxed desktop container through the deskpilot gateway", long_about = None)]
struct Cli {
    /// Gateway base URL
    #[arg(long, global = true, env = "DESKPILOT_SERVER", default_value = "http://127.0.0.1:3000")]
    server: String,

    /// Shared secret configured on the gateway
    #[arg(long, global = true, env = "API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the local desktop image from a recipe
    Build {
        /// Recipe file name inside the gateway's recipe directory
        #[arg(default_value = "Dockerfile")]
        dockerfile: String,

        /// Return once the build is accepted instead of following it
        #[arg(long)]
        detach: bool,
    },

    /// Start (or reuse) the desktop container
    Start {
        /// Image reference, or a recipe name with --local
        #[arg(default_value = "Dockerfile")]
        image: String,

        /// Build the image from a local recipe first
        #[arg(long)]
        local: bool,

        /// Do not wait for the desktop to accept connections
        #[arg(long)]
        no_wait: bool,
    },

    /// Stop the desktop container
    Stop {
        /// Container id
        id: String,
    },

    /// Stop and remove the desktop container
    Delete,

    /// Show container state once
    Status {
        /// Container id
        id: String,
    },

    /// Follow container state, reconnecting when the stream drops
    Watch {
        /// Container id
        id: String,

        /// Seconds between reconnect attempts
        #[arg(long, default_value = "5")]
        retry_secs: u64,
    },

    /// List recipes available to `build` and `start --local`
    Dockerfiles,

    /// Run a shell command inside the container
    Exec {
        /// Command line, passed to `sh -c`
        command: String,
    },

    /// Manage local model artifacts
    Model {
        #[command(subcommand)]
        action: ModelAction,
    },
}

#[derive(Subcommand)]
enum ModelAction {
    /// Check the model service
    Health,
    /// List installed models
    List,
    /// Download a model and follow its progress
    Pull {
        name: String,
    },
    /// Follow the state of a model without downloading it
    Status {
        name: String,
    },
}

/// The gateway rejects every call without a key, so fail before connecting.
fn require_key(key: Option<&str>) -> Result<&str> {
    match key.map(str::trim) {
        Some(key) if !key.is_empty() => Ok(key),
        _ => bail!("An API key is required: pass --api-key or set API_KEY"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };
    deskpilot_core::init_tracing(cli.json, level);

    let client = GatewayClient::new(&cli.server, require_key(cli.api_key.as_deref())?)?;

    match cli.command {
        Commands::Build { dockerfile, detach } => cmd_build(&client, &dockerfile, detach).await,
        Commands::Start {
            image,
            local,
            no_wait,
        } => cmd_start(&client, &image, local, !no_wait).await,
        Commands::Stop { id } => cmd_stop(&client, &id).await,
        Commands::Delete => cmd_delete(&client).await,
        Commands::Status { id } => cmd_status(&client, &id).await,
        Commands::Watch { id, retry_secs } => cmd_watch(&client, &id, retry_secs).await,
        Commands::Dockerfiles => cmd_dockerfiles(&client).await,
        Commands::Exec { command } => cmd_exec(&client, &command).await,
        Commands::Model { action } => match action {
            ModelAction::Health => cmd_model_health(&client).await,
            ModelAction::List => cmd_model_list(&client).await,
            ModelAction::Pull { name } => cmd_model_pull(&client, &name).await,
            ModelAction::Status { name } => cmd_model_status(&client, &name).await,
        },
    }
}

// -- Build --

/// Log lines carried by a build record: the whole log for a snapshot, one
/// line for a relayed event.
fn build_lines(record: &Value) -> Vec<String> {
    if let Some(log) = record.get("log").and_then(Value::as_array) {
        return log
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();
    }
    record
        .get("stream")
        .and_then(Value::as_str)
        .map(|s| vec![s.to_string()])
        .unwrap_or_default()
}

async fn follow_build(client: &GatewayClient, build_id: &str) -> Result<String> {
    let mut outcome = String::new();
    follow(
        client,
        "/api/docker",
        &[("buildId", build_id)],
        RetryPolicy::default(),
        |record: &SseRecord| {
            let Some(value) = record.json() else {
                return Flow::Continue;
            };
            for line in build_lines(&value) {
                print!("{line}");
                if !line.ends_with('\n') {
                    println!();
                }
            }
            let status = value["status"].as_str().unwrap_or_default();
            if is_terminal_status(status) {
                outcome = status.to_string();
                return Flow::Stop;
            }
            Flow::Continue
        },
    )
    .await?;
    Ok(outcome)
}

async fn cmd_build(client: &GatewayClient, dockerfile: &str, detach: bool) -> Result<()> {
    let resp = client
        .docker("buildImage", json!({ "dockerfile": dockerfile }))
        .await?;
    let build_id = resp["buildId"].as_str().unwrap_or_default().to_string();
    if resp["coalesced"].as_bool() == Some(true) {
        println!("Joined running build {build_id}");
    } else {
        println!("Build {build_id} started");
    }
    if detach {
        return Ok(());
    }

    match follow_build(client, &build_id).await?.as_str() {
        "completed" => {
            println!("Build {build_id} completed");
            Ok(())
        }
        _ => bail!("Build {build_id} failed"),
    }
}

// -- Container --

async fn cmd_start(client: &GatewayClient, image: &str, local: bool, wait: bool) -> Result<()> {
    let resp = client
        .docker(
            "startContainer",
            json!({ "imageName": image, "isLocalDockerfile": local }),
        )
        .await?;
    let id = resp["id"].as_str().unwrap_or_default().to_string();
    println!("Container started: {id}");
    if !wait {
        return Ok(());
    }

    if wait_ready(client, &id, READY_ATTEMPTS, READY_INTERVAL).await? {
        println!("Desktop ready");
        Ok(())
    } else {
        bail!("Desktop did not become ready after {READY_ATTEMPTS} checks")
    }
}

async fn cmd_stop(client: &GatewayClient, id: &str) -> Result<()> {
    client
        .docker("stopContainer", json!({ "containerId": id }))
        .await?;
    println!("Container stopped");
    Ok(())
}

async fn cmd_delete(client: &GatewayClient) -> Result<()> {
    let resp = client.docker("deleteContainer", json!({})).await?;
    println!("Deleted container {}", resp["id"].as_str().unwrap_or_default());
    Ok(())
}

fn status_line(value: &Value) -> String {
    let status = value["status"].as_str().unwrap_or("unknown");
    match value["detail"].as_str() {
        Some(detail) if !detail.is_empty() => format!("{status}: {detail}"),
        _ => status.to_string(),
    }
}

async fn cmd_status(client: &GatewayClient, id: &str) -> Result<()> {
    let resp = client
        .docker("getContainerStatus", json!({ "containerId": id }))
        .await?;
    println!("{}", status_line(&resp));
    Ok(())
}

async fn cmd_watch(client: &GatewayClient, id: &str, retry_secs: u64) -> Result<()> {
    let policy = RetryPolicy {
        interval: Duration::from_secs(retry_secs.max(1)),
        ..RetryPolicy::default()
    }
    .unlimited();

    follow(
        client,
        "/api/docker",
        &[("statusId", id), ("containerId", id)],
        policy,
        |record: &SseRecord| {
            if let Some(value) = record.json() {
                println!("{}", status_line(&value));
            }
            Flow::Continue
        },
    )
    .await
}

async fn cmd_dockerfiles(client: &GatewayClient) -> Result<()> {
    let resp = client.docker("listDockerfiles", json!({})).await?;
    for name in resp["dockerfiles"].as_array().into_iter().flatten() {
        if let Some(name) = name.as_str() {
            println!("{name}");
        }
    }
    Ok(())
}

async fn cmd_exec(client: &GatewayClient, command: &str) -> Result<()> {
    let resp = client
        .docker("executeCommand", json!({ "command": command }))
        .await?;
    print!("{}", resp["output"].as_str().unwrap_or_default());
    Ok(())
}

// -- Models --

async fn cmd_model_health(client: &GatewayClient) -> Result<()> {
    let resp = client.get_json("/api/llm/ollama/health").await?;
    if resp["healthy"].as_bool() == Some(true) {
        println!("Model service healthy");
        Ok(())
    } else {
        bail!("Model service is not healthy")
    }
}

async fn cmd_model_list(client: &GatewayClient) -> Result<()> {
    let resp = client.get_json("/api/llm/ollama/list").await?;
    let models = resp["models"].as_array().cloned().unwrap_or_default();
    if models.is_empty() {
        println!("No models installed");
    }
    for model in models {
        println!(
            "{:<40} {:>12}",
            model["name"].as_str().unwrap_or_default(),
            model["size"].as_u64().unwrap_or(0)
        );
    }
    Ok(())
}

fn artifact_line(value: &Value) -> String {
    let status = value["status"].as_str().unwrap_or("unknown");
    match (status, value["error"].as_str()) {
        ("downloading", _) => format!("downloading {}%", value["progress"].as_u64().unwrap_or(0)),
        (_, Some(error)) => format!("{status}: {error}"),
        _ => status.to_string(),
    }
}

async fn cmd_model_pull(client: &GatewayClient, name: &str) -> Result<()> {
    let mut last = Value::Null;
    follow(
        client,
        "/api/llm/ollama/pull",
        &[("modelId", name)],
        RetryPolicy::default(),
        |record: &SseRecord| {
            let Some(value) = record.json() else {
                return Flow::Continue;
            };
            println!("{name}: {}", artifact_line(&value));
            let done = is_terminal_status(value["status"].as_str().unwrap_or_default());
            last = value;
            if done {
                Flow::Stop
            } else {
                Flow::Continue
            }
        },
    )
    .await?;

    match last["status"].as_str() {
        Some("ready") => Ok(()),
        _ => bail!("Download of {name} failed"),
    }
}

async fn cmd_model_status(client: &GatewayClient, name: &str) -> Result<()> {
    follow(
        client,
        "/api/llm/ollama/status",
        &[("modelId", name)],
        RetryPolicy::default().unlimited(),
        |record: &SseRecord| {
            if let Some(value) = record.json() {
                println!("{name}: {}", artifact_line(&value));
            }
            Flow::Continue
        },
    )
    .await
}

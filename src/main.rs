use clap::{Parser, ValueEnum};
use serde_json::json;
use spc_gateway::application::executor::CommandExecutor;
use spc_gateway::application::gateway::{ChatGateway, GatewayOptions};
use spc_gateway::application::registry::ToolRegistry;
use spc_gateway::config::AppConfig;
use spc_gateway::infrastructure::ServerError;
use spc_gateway::infrastructure::bridge::{HttpToolBridge, ToolInvoker};
use spc_gateway::infrastructure::model::build_provider;
use spc_gateway::infrastructure::server::{self, ServerState};
use spc_gateway::infrastructure::tool_server::{self, ToolServerState};
use std::error::Error;
use std::fs;
use std::io::{self, IsTerminal, Read};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser, Debug)]
#[command(
    name = "spc-gateway",
    version,
    about = "LLM gateway for smart-plug control"
)]
struct Cli {
    #[arg(long)]
    config: Option<String>,
    #[arg(long)]
    session: Option<String>,
    #[arg(long)]
    prompt_file: Option<String>,
    #[arg(long, value_enum, default_value_t = RunMode::All)]
    mode: RunMode,
    prompt: Vec<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RunMode {
    /// Both servers in one process, tool server first.
    All,
    /// Conversation gateway only; expects a running tool server.
    Gateway,
    /// Tool server only.
    Tools,
    /// One conversation turn from the console, then exit.
    Chat,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenvy::dotenv().ok();
    init_tracing();
    info!("Starting spc-gateway");
    let cli = Cli::parse();
    debug!(?cli.mode, config = ?cli.config, session = ?cli.session, "CLI arguments parsed");
    let config_path = cli.config.as_deref().map(Path::new);
    let config = AppConfig::load(config_path)?;
    if let Some(path) = config_path {
        info!(path = %path.display(), "Loaded configuration from file");
    } else {
        info!("Loaded configuration using default path or defaults");
    }

    info!(mode = ?cli.mode, "Running in selected mode");
    match cli.mode {
        RunMode::All => run_all(&config).await?,
        RunMode::Gateway => run_gateway(&config).await?,
        RunMode::Tools => run_tools(&config).await?,
        RunMode::Chat => run_chat(&cli, &config).await?,
    }
    info!("Shutdown complete");
    Ok(())
}

async fn run_tools(config: &AppConfig) -> Result<(), Box<dyn Error>> {
    let state = tool_server_state(config)?;
    info!(addr = %config.tool_server.bind, "Starting tool server");
    tool_server::serve(state, config.tool_server.bind).await?;
    Ok(())
}

async fn run_gateway(config: &AppConfig) -> Result<(), Box<dyn Error>> {
    let gateway = build_gateway(config, 0).await?;
    let state = Arc::new(ServerState::new(gateway));
    info!(addr = %config.gateway.bind, "Starting gateway server");
    server::serve(state, config.gateway.bind).await?;
    Ok(())
}

async fn run_all(config: &AppConfig) -> Result<(), Box<dyn Error>> {
    let state = tool_server_state(config)?;
    let tool_addr = config.tool_server.bind;
    info!(addr = %tool_addr, "Starting embedded tool server");
    let mut tool_task = tokio::spawn(async move { tool_server::serve(state, tool_addr).await });

    let gateway_run = async {
        let gateway = build_gateway(config, 20).await?;
        let state = Arc::new(ServerState::new(gateway));
        info!(addr = %config.gateway.bind, "Starting gateway server");
        server::serve(state, config.gateway.bind).await?;
        Ok::<(), Box<dyn Error>>(())
    };

    // Racing against the tool task surfaces its bind error instead of
    // letting the declaration fetch time out against a dead listener.
    tokio::select! {
        result = gateway_run => {
            tool_task.abort();
            result
        }
        joined = &mut tool_task => Err(embedded_tool_server_exit(joined)),
    }
}

async fn run_chat(cli: &Cli, config: &AppConfig) -> Result<(), Box<dyn Error>> {
    let text = load_prompt(cli)?;
    let state = tool_server_state(config)?;
    let tool_addr = config.tool_server.bind;
    info!(addr = %tool_addr, "Starting embedded tool server");
    let mut tool_task = tokio::spawn(async move { tool_server::serve(state, tool_addr).await });

    let chat_run = async {
        let gateway = build_gateway(config, 20).await?;
        info!("Dispatching single prompt from the console");
        let outcome = gateway.converse(cli.session.clone(), text).await?;
        let output = json!({
            "sessionId": outcome.session_id,
            "message": outcome.message,
            "toolCalls": outcome.tool_calls,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        Ok::<(), Box<dyn Error>>(())
    };

    tokio::select! {
        result = chat_run => {
            tool_task.abort();
            result
        }
        joined = &mut tool_task => Err(embedded_tool_server_exit(joined)),
    }
}

fn tool_server_state(config: &AppConfig) -> Result<Arc<ToolServerState>, Box<dyn Error>> {
    let registry = ToolRegistry::from_specs(&config.tools)?;
    let executor = CommandExecutor::new(config.tool_server.command_timeout());
    Ok(Arc::new(ToolServerState::new(Arc::new(registry), executor)))
}

/// The embedded tool server never returns during normal operation, so any
/// completion of its task is a startup or serve failure worth reporting.
fn embedded_tool_server_exit(joined: Result<Result<(), ServerError>, JoinError>) -> Box<dyn Error> {
    match joined {
        Ok(Ok(())) => {
            error!("Embedded tool server exited before shutdown");
            "embedded tool server exited before shutdown".into()
        }
        Ok(Err(server_error)) => {
            error!(error = %server_error, "Embedded tool server failed");
            server_error.into()
        }
        Err(join_error) => {
            error!(error = %join_error, "Embedded tool server task failed");
            join_error.into()
        }
    }
}

/// Builds the provider once, then fetches the tool declarations. The retry
/// loop covers the embedded tool server still binding its listener.
async fn build_gateway(config: &AppConfig, retries: u32) -> Result<Arc<ChatGateway>, Box<dyn Error>> {
    let provider = build_provider(&config.model)?;
    let bridge: Arc<dyn ToolInvoker> =
        Arc::new(HttpToolBridge::new(config.gateway.tool_server_url.clone()));
    let options = GatewayOptions::from_config(config);

    let mut attempt = 0;
    loop {
        attempt += 1;
        match ChatGateway::connect(
            Arc::clone(&provider),
            Arc::clone(&bridge),
            options.clone(),
        )
        .await
        {
            Ok(gateway) => return Ok(Arc::new(gateway)),
            Err(error) if attempt <= retries => {
                warn!(attempt, error = %error, "Tool server not reachable yet; retrying");
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
            Err(error) => return Err(error.into()),
        }
    }
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_level(true)
            .init();
    });
}

fn load_prompt(cli: &Cli) -> Result<String, Box<dyn Error>> {
    if let Some(path) = &cli.prompt_file {
        info!(path = %path, "Loading prompt from file");
        let content = fs::read_to_string(path)?;
        return Ok(normalize_prompt(content));
    }

    if !cli.prompt.is_empty() {
        info!("Using prompt provided through CLI arguments");
        let joined = cli.prompt.join(" ");
        return Ok(normalize_prompt(joined));
    }

    if !io::stdin().is_terminal() {
        info!("Reading prompt from standard input");
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        return Ok(normalize_prompt(buffer));
    }

    warn!("Prompt not provided via arguments, file, or stdin");
    Err("prompt required via arguments, file, or stdin".into())
}

fn normalize_prompt(prompt: String) -> String {
    prompt.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_tool_server_bind_failure_surfaces_in_the_error() {
        let bind = ServerError::Bind {
            addr: "127.0.0.1:3000".parse().expect("addr parses"),
            source: io::Error::from(io::ErrorKind::AddrInUse),
        };
        let reported = embedded_tool_server_exit(Ok(Err(bind))).to_string();
        assert!(reported.contains("127.0.0.1:3000"));

        let reported = embedded_tool_server_exit(Ok(Ok(()))).to_string();
        assert!(reported.contains("exited before shutdown"));
    }
}

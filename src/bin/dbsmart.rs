use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use dbsmart::agent::{AgentDefinition, Runner};
use dbsmart::mcp::{McpServer, McpServerStdio};
use dbsmart::providers::{OpenAICompatible, OpenAICompatibleProvider};
use dbsmart::session::{SessionEnd, SessionOptions, run_session};
use dbsmart::settings::{Settings, SettingsOverrides};
use dbsmart::{DatabaseConfig, ModelProvider, telemetry};

const AGENT_NAME: &str = "DBSmartAgent";
const AGENT_INSTRUCTIONS: &str = "
你是数据库分析专家。用户会用自然语言描述需求，你需要调用数据库MCP工具完成如下任务：
1. 自动分析数据库结构（如列出所有表、字段、主键等）。
2. 根据用户需求自动生成只读SQL，并调用MCP工具执行。
3. 以结构化、易懂的中文解释查询结果。
4. 不允许任何写操作。
";

#[derive(Parser, Debug)]
#[command(name = "dbsmart")]
#[command(about = "Ask database questions in natural language through an MCP tool server")]
#[command(version)]
struct Cli {
    /// Database connection config, printed at startup and passed to the tool server.
    #[arg(long, value_name = "PATH")]
    db_config: Option<PathBuf>,

    /// Program that starts the MCP tool server.
    #[arg(long, value_name = "CMD")]
    mcp_command: Option<String>,

    /// Argument for the tool server command (repeatable).
    #[arg(long = "mcp-arg", value_name = "ARG", allow_hyphen_values = true)]
    mcp_args: Vec<String>,

    /// OpenAI-compatible API base URL.
    #[arg(long)]
    base_url: Option<String>,

    #[arg(long)]
    api_key: Option<String>,

    #[arg(long)]
    model: Option<String>,

    /// Optional TOML settings profile.
    #[arg(long, value_name = "PATH")]
    profile: Option<PathBuf>,

    /// Dotenv file consulted before the process environment.
    #[arg(long, value_name = "PATH", default_value = ".env")]
    dotenv: PathBuf,

    /// Model round trips allowed per question.
    #[arg(long)]
    max_turns: Option<usize>,

    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    fn overrides(&self) -> SettingsOverrides {
        SettingsOverrides {
            db_config: self.db_config.clone(),
            mcp_command: self.mcp_command.clone(),
            mcp_args: self.mcp_args.clone(),
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            model: self.model.clone(),
            max_turns: self.max_turns,
            json_logs: self.json_logs,
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();
    telemetry::init_tracing("info", cli.json_logs)?;

    let settings = match Settings::load(cli.overrides(), cli.profile.as_deref(), &cli.dotenv) {
        Ok(settings) => settings,
        Err(err) => {
            tracing::error!(error = %err, "failed to load settings");
            return Ok(ExitCode::FAILURE);
        }
    };
    tracing::debug!(?settings, "settings resolved");
    if settings.api_key.is_empty() {
        tracing::warn!("no api key configured; requests are sent without authorization");
    }

    let db_config = match DatabaseConfig::load(&settings.db_config) {
        Ok(db_config) => db_config,
        Err(err) => {
            tracing::error!(
                path = %settings.db_config.display(),
                error = %err,
                "failed to load database config"
            );
            return Ok(ExitCode::FAILURE);
        }
    };
    println!("{db_config}");
    let connections = db_config.connection_names();
    if !connections.is_empty() {
        tracing::info!(?connections, "tool calls must name one of the configured connections");
    }

    let mut client = OpenAICompatible::new(settings.api_key.clone())?.with_model(&settings.model);
    if let Some(base_url) = settings.base_url.as_deref() {
        client = client.with_base_url(base_url);
    }
    let provider = OpenAICompatibleProvider::new(client);

    let server: Arc<dyn McpServer> = Arc::new(
        McpServerStdio::new(&settings.mcp.server_name, settings.mcp.params.clone())
            .with_cache_tools_list(settings.mcp.cache_tools_list)
            .with_request_timeout(settings.mcp.request_timeout),
    );

    let model_name = settings.model.clone();
    let model_settings = settings.model_settings.clone();
    let build_agent = move |server: Arc<dyn McpServer>| -> dbsmart::Result<AgentDefinition> {
        Ok(AgentDefinition::new(AGENT_NAME, provider.resolve(&model_name)?)
            .with_instructions(AGENT_INSTRUCTIONS)
            .with_mcp_servers(vec![server])
            .with_model_settings(model_settings))
    };

    let options = SessionOptions {
        max_turns: settings.max_turns,
        ..SessionOptions::default()
    };
    let mut input = tokio::io::BufReader::new(tokio::io::stdin());
    let mut output = tokio::io::stdout();

    let end = run_session(
        server,
        build_agent,
        &Runner,
        &options,
        &mut input,
        &mut output,
    )
    .await;

    Ok(match end {
        Ok(SessionEnd::Exit | SessionEnd::EndOfInput) => ExitCode::SUCCESS,
        Ok(SessionEnd::StartupFailed) => ExitCode::FAILURE,
        Err(err) => {
            tracing::error!(error = %err, "session ended on a terminal i/o error");
            ExitCode::FAILURE
        }
    })
}

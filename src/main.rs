use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use troupe_core::config::{PipelineConfig, RunMode};
use troupe_core::event::EventBus;
use troupe_core::types::{OverallStatus, PipelineEvent};
use troupe_engine::{Executor, PipelineGraph};
use troupe_tools::ToolRegistry;

#[derive(Parser)]
#[command(
    name = "troupe",
    version,
    about = "Multi-agent task pipelines over a dependency graph"
)]
struct Cli {
    /// Path to the pipeline file
    #[arg(short, long, default_value = "troupe.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute the pipeline
    Run {
        /// Topic substituted into {topic} placeholders. Prompted for
        /// interactively when omitted and the pipeline expects one.
        #[arg(short, long)]
        topic: Option<String>,
        /// Override the execution mode (sequential, concurrent)
        #[arg(long)]
        mode: Option<String>,
    },
    /// Validate the pipeline file without calling any backend
    Check,
    /// Show resolved configuration
    Config,
    /// Write a starter pipeline file
    Init {
        /// Template to write (research, newsletter)
        #[arg(long, default_value = "research")]
        template: String,
        /// Overwrite an existing pipeline file
        #[arg(long)]
        force: bool,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("troupe=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Some(Commands::Completions { shell }) = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "troupe", &mut std::io::stdout());
        return Ok(());
    }

    // Handle init before config loading
    if let Some(Commands::Init { template, force }) = &cli.command {
        return write_starter_pipeline(&cli.config, template, *force);
    }

    let config = PipelineConfig::load(&cli.config)?;

    match cli.command {
        Some(Commands::Check) => check_pipeline(config),
        Some(Commands::Config) => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Some(Commands::Run { topic, mode }) => run_pipeline(config, topic, mode).await,
        None => run_pipeline(config, None, None).await,
        Some(Commands::Init { .. }) | Some(Commands::Completions { .. }) => {
            unreachable!("handled before config load")
        }
    }
}

async fn run_pipeline(
    mut config: PipelineConfig,
    topic: Option<String>,
    mode: Option<String>,
) -> anyhow::Result<()> {
    if let Some(mode) = mode {
        config.run.mode = parse_mode(&mode)?;
    }

    // Resolve the topic: flag first, then an interactive prompt when the
    // pipeline still carries {topic} placeholders.
    match topic {
        Some(topic) => config.apply_topic(&topic),
        None if config.needs_topic() => {
            let topic = dialoguer::Input::<String>::new()
                .with_prompt("Enter a topic for this pipeline")
                .interact_text()?;
            config.apply_topic(&topic);
        }
        None => {}
    }

    let registry = Arc::new(ToolRegistry::with_builtins(config.search.as_ref()));

    // Resolve every agent's capabilities up front so a bad pipeline fails
    // before the first backend call.
    let mut tool_defs = HashMap::new();
    for agent in &config.agents {
        tool_defs.insert(
            agent.id.clone(),
            registry.definitions_for(&agent.capabilities)?,
        );
    }

    let backend = troupe_llm::create_backend(&config.backend, registry)?;
    let graph = PipelineGraph::build(config.agents, config.tasks)?;

    let events = Arc::new(EventBus::default());
    let executor =
        Executor::new(graph, backend, config.run, events.clone()).with_tool_definitions(tool_defs);

    // Ctrl-C cancels the run; completed task outputs are still reported.
    let cancel = executor.cancel_token();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Interrupt received, cancelling run");
        cancel.cancel();
    });

    // Render progress events on stderr so stdout stays clean for the
    // final output.
    let mut rx = events.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            match event {
                PipelineEvent::RunStarted { tasks } => {
                    eprintln!("Running {} task(s)...", tasks);
                }
                PipelineEvent::TaskStarted { task, agent } => {
                    eprintln!("[{}] started (agent: {})", task, agent);
                }
                PipelineEvent::TaskCompleted { task, elapsed_ms } => {
                    eprintln!("[{}] done in {} ms", task, elapsed_ms);
                }
                PipelineEvent::TaskFailed { task, reason } => {
                    eprintln!("[{}] FAILED: {}", task, reason);
                }
                PipelineEvent::TaskSkipped {
                    task,
                    failed_upstream,
                } => {
                    eprintln!(
                        "[{}] skipped: upstream task {} failed",
                        task, failed_upstream
                    );
                }
                PipelineEvent::RateLimited { agent, wait_ms } => {
                    eprintln!(
                        "[{}] rate window full, waiting {}s",
                        agent,
                        wait_ms.div_ceil(1000)
                    );
                }
                PipelineEvent::RetryScheduled {
                    agent,
                    attempt,
                    backoff_ms,
                } => {
                    eprintln!(
                        "[{}] transient backend error, retry {} in {} ms",
                        agent, attempt, backoff_ms
                    );
                }
                PipelineEvent::RunComplete { .. } => break,
            }
        }
    });

    let result = executor.run().await;
    printer.await.ok();

    eprintln!();
    eprintln!("Tasks:");
    for outcome in &result.outcomes {
        if let Some(failure) = &outcome.failure {
            eprintln!("  {:<16} failed: {}", outcome.task_id, failure);
        } else {
            eprintln!("  {:<16} ok ({} ms)", outcome.task_id, outcome.elapsed_ms);
        }
    }

    if !result.final_output.is_empty() {
        eprintln!();
        println!("{}", result.final_output);
    }

    match result.overall {
        OverallStatus::Succeeded => Ok(()),
        OverallStatus::PartialFailure => {
            eprintln!("\nPipeline finished with partial failures; output above may be incomplete.");
            Ok(())
        }
        OverallStatus::Failed => anyhow::bail!("pipeline failed: no terminal task produced output"),
    }
}

fn check_pipeline(config: PipelineConfig) -> anyhow::Result<()> {
    let registry = ToolRegistry::with_builtins(config.search.as_ref());
    for agent in &config.agents {
        registry.definitions_for(&agent.capabilities)?;
    }

    let agents = config.agents.len();
    let graph = PipelineGraph::build(config.agents, config.tasks)?;
    let order: Vec<&str> = graph
        .topo_order()
        .iter()
        .map(|&i| graph.task(i).spec.id.as_str())
        .collect();

    println!("Pipeline OK: {} agent(s), {} task(s)", agents, graph.len());
    println!("Execution order: {}", order.join(" -> "));
    Ok(())
}

fn parse_mode(value: &str) -> anyhow::Result<RunMode> {
    match value {
        "sequential" => Ok(RunMode::Sequential),
        "concurrent" => Ok(RunMode::Concurrent),
        other => anyhow::bail!("unknown mode: {} (expected sequential or concurrent)", other),
    }
}

fn write_starter_pipeline(path: &Path, template: &str, force: bool) -> anyhow::Result<()> {
    let content = match template {
        "research" => RESEARCH_TEMPLATE,
        "newsletter" => NEWSLETTER_TEMPLATE,
        other => anyhow::bail!(
            "unknown template: {} (expected research or newsletter)",
            other
        ),
    };

    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }

    std::fs::write(path, content)?;
    println!("Wrote {} pipeline to {}", template, path.display());
    println!("Run it with: troupe run --topic \"your topic\"");
    Ok(())
}

const RESEARCH_TEMPLATE: &str = r#"# Troupe pipeline: research crew.
# A researcher gathers the latest developments on a topic, then a writer
# turns them into a blog post. Run with: troupe run --topic "AI agents"

[backend]
provider = "openai"
model_id = "gpt-4o-mini"
api_key = "${OPENAI_API_KEY}"

[run]
mode = "sequential"

# Uncomment to let the researcher search the web (serper.dev API key):
# [search]
# api_key = "${SERPER_API_KEY}"

[[agents]]
id = "researcher"
role = "Senior Research Analyst"
goal = "Uncover cutting-edge developments in {topic}"
backstory = "You are an experienced research analyst with a keen eye for emerging trends in {topic}. Your expertise lies in identifying groundbreaking innovations and their potential impact on various industries."
# capabilities = ["web_search"]

[[agents]]
id = "writer"
role = "Content Writer"
goal = "Create engaging articles about {topic} developments"
backstory = "You are a skilled writer with a passion for explaining complex {topic} concepts in simple terms. Your articles captivate readers while conveying accurate information."

[[tasks]]
id = "research"
description = "Research the latest advancements in {topic} and summarize the top 3 breakthroughs"
agent = "researcher"
expected_output = "A bullet-point list of the top 3 {topic} breakthroughs with a brief explanation of each"

[[tasks]]
id = "write"
description = "Write a blog post about the top 3 {topic} breakthroughs"
agent = "writer"
depends_on = ["research"]
expected_output = "A 500-word blog post discussing the top 3 {topic} breakthroughs"
"#;

const NEWSLETTER_TEMPLATE: &str = r#"# Troupe pipeline: newsletter crew.
# Researcher -> writer -> editor, each task building on the previous
# task's output. Run with: troupe run --topic "open source robotics"

[backend]
provider = "openai"
model_id = "gpt-4o-mini"
api_key = "${OPENAI_API_KEY}"

[run]
mode = "sequential"

# Uncomment to let the researcher search the web (serper.dev API key):
# [search]
# api_key = "${SERPER_API_KEY}"

[[agents]]
id = "researcher"
role = "Research Analyst"
goal = "Find the latest and most relevant news about {topic}"
backstory = "You have a knack for discovering trending topics in {topic}."
# capabilities = ["web_search"]

[[agents]]
id = "writer"
role = "Content Writer"
goal = "Create engaging newsletter content about {topic} based on research"
backstory = "You have a talent for crafting compelling narratives about {topic}."

[[agents]]
id = "editor"
role = "Copy Editor"
goal = "Ensure the {topic} newsletter is polished and error-free"
backstory = "You have an eye for detail and a mastery of language."

[[tasks]]
id = "research"
description = "Find the top 3 trending topics in {topic} and provide brief summaries"
agent = "researcher"
expected_output = "A list of 3 trending {topic} topics with brief summaries for each"

[[tasks]]
id = "write"
description = "Write a 300-word article on each trending topic"
agent = "writer"
depends_on = ["research"]
expected_output = "Three 300-word articles about the trending {topic} topics"

[[tasks]]
id = "edit"
description = "Proofread and polish the {topic} articles, ensuring they flow well together"
agent = "editor"
depends_on = ["write"]
expected_output = "A final, polished newsletter about {topic} trends, ready for distribution"
"#;

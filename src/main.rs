//! # LarkBot: Feishu/Lark automation daemon
//!
//! Loads `~/.larkbot/config.toml` and the automation file, then runs
//! scheduled tasks, automation rules and their triggers until Ctrl-C.
//!
//! Usage:
//!   larkbot                          # Run the scheduler
//!   larkbot --validate               # Check config + automation file and exit
//!   larkbot --run-task daily-report  # Run one task now and exit
//!   larkbot --run-workflow release   # Run a workflow template and exit
//!   larkbot --event event.json       # Dispatch one event payload and exit

use anyhow::{Context as _, Result};
use clap::Parser;
use larkbot_core::config::LarkBotConfig;
use larkbot_core::traits::Scheduler;
use larkbot_core::types::Context;
use larkbot_scheduler::triggers::callback;
use larkbot_scheduler::workflow::WorkflowOrchestrator;
use larkbot_scheduler::{
    AutomationConfig, AutomationEngine, DependencyResolver, ExecutionHistoryStore, ExecutionServices, HistoryDb,
    ManagerOptions, ReqwestHttpClient, RunOutcome, TaskManager, TokioScheduler, TriggerRegistry, WebhookSender,
    WorkflowTemplateRegistry,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "larkbot", version, about = "🤖 LarkBot — Feishu/Lark task and automation scheduler")]
struct Cli {
    /// Config file
    #[arg(short, long, default_value = "~/.larkbot/config.toml")]
    config: String,

    /// Automation file (overrides `automation_file` from the config)
    #[arg(short, long)]
    automation: Option<String>,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,

    /// Run one task immediately and exit
    #[arg(long, value_name = "TASK")]
    run_task: Option<String>,

    /// Run one workflow template immediately and exit
    #[arg(long, value_name = "WORKFLOW")]
    run_workflow: Option<String>,

    /// Dispatch the JSON event in this file and exit
    #[arg(long, value_name = "FILE")]
    event: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

fn init_logging(config: &LarkBotConfig, verbose: bool) {
    let level = if verbose { "debug" } else { config.log.level.as_str() };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("larkbot={level},larkbot_scheduler={level},larkbot_core={level}")));
    if config.log.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).with_target(false).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
    }
}

fn load_config(path: &Path) -> Result<LarkBotConfig> {
    if path.exists() {
        Ok(LarkBotConfig::load_from(path)?)
    } else {
        Ok(LarkBotConfig::default())
    }
}

fn load_automation(path: &Path) -> Result<AutomationConfig> {
    if path.exists() {
        Ok(AutomationConfig::load_from(path)?)
    } else {
        tracing::warn!("⚠️ Automation file {} not found, starting empty", path.display());
        Ok(AutomationConfig::default())
    }
}

fn open_history(config: &LarkBotConfig) -> Result<ExecutionHistoryStore> {
    let history = ExecutionHistoryStore::new(config.scheduler.max_history);
    let Some(db_path) = &config.scheduler.history_db else {
        return Ok(history);
    };
    let db_path = expand_path(db_path);
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = HistoryDb::open(&db_path)?;
    let removed = db.cleanup_older_than(config.scheduler.history_retention_days)?;
    tracing::info!("💾 History database {} ({removed} old records removed)", db_path.display());
    Ok(history.with_db(Arc::new(db)))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = expand_path(&cli.config);
    let config = load_config(&config_path).with_context(|| format!("loading {}", config_path.display()))?;
    init_logging(&config, cli.verbose);

    let automation_path = expand_path(cli.automation.as_deref().unwrap_or(&config.automation_file));
    let definitions = load_automation(&automation_path)?;

    if cli.validate {
        let order = DependencyResolver::from_edges(
            definitions
                .tasks
                .iter()
                .map(|t| (t.name.clone(), t.upstream().cloned().collect::<Vec<_>>())),
        )
        .get_execution_order()?;
        ManagerOptions::from_config(&config)?;
        println!("✅ Configuration valid");
        println!("   Webhooks:  {}", config.webhooks.len());
        println!("   Tasks:     {} ({} dependency levels)", definitions.tasks.len(), order.len());
        println!("   Rules:     {}", definitions.rules.len());
        println!("   Workflows: {}", definitions.workflows.len());
        println!("   Triggers:  {}", definitions.triggers.len());
        return Ok(());
    }

    // Collaborators
    let sender = Arc::new(WebhookSender::from_config(&config.webhooks)?);
    let services = Arc::new(
        ExecutionServices::new(sender, Arc::new(ReqwestHttpClient::new()))
            .with_templates(Arc::new(definitions.template_store()))
            .with_default_target(&config.default_target),
    );
    let history = Arc::new(open_history(&config)?);
    let scheduler = Arc::new(TokioScheduler::new()?);
    let job_scheduler: Arc<dyn Scheduler> = scheduler.clone();

    // Tasks
    let manager = TaskManager::new(
        job_scheduler.clone(),
        services.clone(),
        history,
        ManagerOptions::from_config(&config)?,
    );
    manager.load_tasks(definitions.tasks.clone())?;

    // Rules and triggers
    let registry = Arc::new(TriggerRegistry::new(Some(job_scheduler.clone())));
    let engine = Arc::new(
        AutomationEngine::new(services.clone(), Some(job_scheduler.clone())).with_trigger_registry(registry.clone()),
    );
    engine.load_rules(definitions.rules.clone())?;
    for binding in &definitions.triggers {
        let weak = Arc::downgrade(&engine);
        let rule = binding.rule.clone();
        let on_fire = callback(move |ctx| {
            let weak = weak.clone();
            let rule = rule.clone();
            async move {
                match weak.upgrade() {
                    Some(engine) => engine.trigger_rule(&rule, Some(ctx.payload)).await.map(|_| ()),
                    None => Ok(()),
                }
            }
        });
        registry.register(&binding.rule, binding.trigger_config()?, on_fire)?;
    }

    // Workflows
    let workflows = WorkflowTemplateRegistry::new();
    for template in definitions.workflows.clone() {
        workflows.register(template);
    }
    let orchestrator = WorkflowOrchestrator::from_services(services.clone())
        .with_max_workers(config.scheduler.parallel_workers)
        .with_max_retained(config.scheduler.max_history);

    if let Some(name) = &cli.run_task {
        let outcome = manager.run_task(name, Context::new()).await?;
        match &outcome {
            RunOutcome::Finished(result) | RunOutcome::Skipped(result) => {
                println!("{}", serde_json::to_string_pretty(result)?);
            }
            RunOutcome::Refused { reason } => println!("⚠️ Refused: {reason}"),
        }
        manager.shutdown();
        std::process::exit(if outcome.succeeded() { 0 } else { 1 });
    }

    if let Some(name) = &cli.run_workflow {
        let template = workflows
            .get(name)
            .with_context(|| format!("workflow template '{name}' not found"))?;
        let steps = workflows.instantiate(name, &Context::new())?;
        let workflow_id = format!("{name}-{}", uuid::Uuid::new_v4());
        let execution = orchestrator
            .execute_workflow(&workflow_id, name, steps, Context::new(), template.parallel)
            .await?;
        println!("{}", serde_json::to_string_pretty(&execution)?);
        return Ok(());
    }

    if let Some(file) = &cli.event {
        let path = expand_path(file);
        let payload: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path)?)
            .with_context(|| format!("parsing {}", path.display()))?;
        let rules = engine.handle_event(&payload).await;
        let triggered = registry.dispatch_event(&payload).await;
        println!("Rules run: {rules:?}");
        println!("Triggers fired: {triggered:?}");
        return Ok(());
    }

    manager.start()?;
    let scheduled = engine.start();
    tracing::info!(
        "🚀 LarkBot running: {} tasks, {} rules ({scheduled} scheduled), {} triggers, {} workflow templates",
        manager.task_names().len(),
        engine.rule_names().len(),
        registry.rule_names().len(),
        workflows.names().len()
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("🛑 Shutting down...");
    engine.stop();
    registry.shutdown();
    manager.shutdown();
    scheduler.shutdown();
    Ok(())
}

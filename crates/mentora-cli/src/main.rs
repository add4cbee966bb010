use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use mentora_core::coaching::{QuotaStatus, WelcomeSource};
use mentora_core::config::{self, MentoraConfig};
use mentora_core::directory::{create_directory, UserDirectory};
use mentora_core::generator::LlmGenerator;
use mentora_core::llm::LlmService;
use mentora_core::model::{Role, Turn, TurnSource};
use mentora_core::storage::{create_backend, Storage};
use mentora_core::{CoachingService, RecommendationOutcome, SendOutcome};
use owo_colors::OwoColorize;
use serde::Serialize;

type Coaching = CoachingService<Storage, LlmGenerator, UserDirectory>;

#[derive(Parser)]
#[command(name = "mentora", about = "Mentora: quota-gated learning coach", version)]
enum Cli {
    /// Write a default .mentora/config.toml in the current directory
    Init {
        /// Overwrite an existing project config
        #[arg(long)]
        force: bool,
    },
    /// Show storage, directory and generator status
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Open the coaching panel for a user: welcome, history and quota
    Session {
        user: String,
        #[arg(long)]
        json: bool,
    },
    /// Send one message to the coach
    Chat {
        user: String,
        /// Message text (words are joined with spaces)
        #[arg(required = true)]
        text: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Ask for a next-step recommendation
    Recommend {
        user: String,
        #[arg(long)]
        json: bool,
    },
    /// Show today's quota for a user
    Quota {
        user: String,
        #[arg(long)]
        json: bool,
    },
    /// Start a fresh session; older sessions are kept
    NewSession { user: String },
    /// List a user's sessions, newest first
    Sessions {
        user: String,
        #[arg(short, long, default_value = "20")]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .compact()
        .init();

    let cli = Cli::parse();
    let config = match MentoraConfig::load(Some(&std::env::current_dir()?)) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("failed to load config, using defaults: {e}");
            MentoraConfig::default_config()
        }
    };

    run(cli, config).await
}

async fn run(cli: Cli, config: MentoraConfig) -> Result<()> {
    match cli {
        Cli::Init { force } => cmd_init(force),
        Cli::Status { json } => {
            let coaching = make_service(&config)?;
            cmd_status(&coaching, &config, json).await
        }
        Cli::Session { user, json } => {
            let coaching = make_service(&config)?;
            cmd_session(&coaching, &user, json).await
        }
        Cli::Chat { user, text, json } => {
            let coaching = make_service(&config)?;
            cmd_chat(&coaching, &user, &text.join(" "), json).await
        }
        Cli::Recommend { user, json } => {
            let coaching = make_service(&config)?;
            cmd_recommend(&coaching, &user, json).await
        }
        Cli::Quota { user, json } => {
            let coaching = make_service(&config)?;
            let status = coaching.quota_status(&user).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_quota(&status);
            }
            Ok(())
        }
        Cli::NewSession { user } => {
            let coaching = make_service(&config)?;
            let session = coaching.start_session(&user).await?;
            println!("{} {}", "Started session".green(), session.id.to_string().cyan());
            Ok(())
        }
        Cli::Sessions { user, limit, json } => {
            let coaching = make_service(&config)?;
            cmd_sessions(&coaching, &user, limit, json).await
        }
    }
}

fn make_service(config: &MentoraConfig) -> Result<Coaching> {
    let storage = create_backend(config).context("failed to create storage backend")?;
    let directory = create_directory(config).context("failed to create user directory")?;
    let llm = if config.llm.enabled {
        Some(LlmService::from_config(&config.llm).context("failed to create LLM service")?)
    } else {
        None
    };
    CoachingService::new(Arc::new(storage), LlmGenerator::new(llm), directory, config)
        .context("failed to create coaching service")
}

// ---------------------------------------------------------------------------
// init
// ---------------------------------------------------------------------------

fn cmd_init(force: bool) -> Result<()> {
    let cwd = std::env::current_dir()?;
    let mentora_dir = cwd.join(".mentora");
    let config_path = mentora_dir.join("config.toml");

    if config_path.exists() && !force {
        println!("Mentora already initialized in this project (use --force to overwrite).");
        return Ok(());
    }

    std::fs::create_dir_all(&mentora_dir)?;
    let config = MentoraConfig::default_config();
    let toml_str = format!(
        "# Mentora project config. Set [llm] enabled = true to use a model.\n{}",
        toml::to_string_pretty(&config)?
    );
    std::fs::write(&config_path, toml_str)?;

    let gitignore_path = cwd.join(".gitignore");
    let entry = ".mentora/config.local.toml";
    if gitignore_path.exists() {
        let contents = std::fs::read_to_string(&gitignore_path)?;
        if !contents.lines().any(|l| l.trim() == entry) {
            let mut appended = contents;
            if !appended.ends_with('\n') {
                appended.push('\n');
            }
            appended.push_str(entry);
            appended.push('\n');
            std::fs::write(&gitignore_path, appended)?;
        }
    } else {
        std::fs::write(&gitignore_path, format!("{entry}\n"))?;
    }

    println!("{}", "Initialized Mentora in .mentora/".green());
    println!("  {}   .mentora/config.toml", "Config:".dimmed());
    if let Some(global) = config::global_config_path() {
        println!("  {}   {}", "Global:".dimmed(), global.display());
    }
    println!(
        "  {}",
        "Edit .mentora/config.local.toml for local overrides (gitignored)".dimmed()
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// status
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct StatusReport {
    version: &'static str,
    storage: String,
    schema_version: Option<i32>,
    storage_ok: bool,
    directory: String,
    generator: String,
    day_boundary: String,
    default_tier: String,
}

async fn cmd_status(coaching: &Coaching, config: &MentoraConfig, json: bool) -> Result<()> {
    let storage_ok = coaching.health().await.is_ok();
    let schema_version = coaching.store().schema_info();
    let report = StatusReport {
        version: env!("CARGO_PKG_VERSION"),
        storage: config.storage.backend.clone(),
        schema_version,
        storage_ok,
        directory: config.directory.mode.clone(),
        generator: coaching.generator().describe(),
        day_boundary: format!("{:?}", coaching.calendar().boundary()),
        default_tier: config.quota.default_tier.clone(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("{}", format!("Mentora Status v{}", report.version).bold());
    let storage_state = if report.storage_ok {
        "connected".green().to_string()
    } else {
        "unavailable".red().to_string()
    };
    let schema = report
        .schema_version
        .map(|v| format!(", schema v{v}"))
        .unwrap_or_default();
    println!("  {}    {} ({}{schema})", "Storage:".dimmed(), storage_state, report.storage);
    println!("  {}  {}", "Directory:".dimmed(), report.directory.cyan());
    println!("  {}  {}", "Generator:".dimmed(), report.generator.cyan());
    println!("  {}    {}", "Quota day:".dimmed(), report.day_boundary);
    println!("  {}  {}", "Default tier:".dimmed(), report.default_tier);
    Ok(())
}

// ---------------------------------------------------------------------------
// session / chat / recommend
// ---------------------------------------------------------------------------

async fn cmd_session(coaching: &Coaching, user: &str, json: bool) -> Result<()> {
    let view = coaching.load_session(user).await;
    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }

    let source = match view.welcome_source {
        WelcomeSource::Remote => "coach",
        WelcomeSource::Rules => "offline",
        WelcomeSource::Generic => "generic",
    };
    println!("{} {}", view.welcome_message.bold(), format!("[{source}]").dimmed());
    println!();
    if view.history.is_empty() {
        println!("{}", "No conversation yet.".dimmed());
    } else {
        for turn in &view.history {
            print_turn(turn);
        }
    }
    println!();
    print_quota(&view.quota);
    Ok(())
}

async fn cmd_chat(coaching: &Coaching, user: &str, text: &str, json: bool) -> Result<()> {
    let outcome = coaching.send_message(user, text).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }
    match outcome {
        SendOutcome::Delivered { reply, quota, .. } => {
            print_turn(&reply);
            print_quota(&quota);
        }
        SendOutcome::QuotaExceeded { quota } => {
            eprintln!("{}", "Daily message limit reached. Come back tomorrow!".yellow());
            print_quota(&quota);
        }
        SendOutcome::GenerationFailed {
            fallback_turn,
            reason,
            ..
        } => {
            print_turn(&fallback_turn);
            eprintln!("  {} {}", "reason:".dimmed(), reason.dimmed());
        }
    }
    Ok(())
}

async fn cmd_recommend(coaching: &Coaching, user: &str, json: bool) -> Result<()> {
    let outcome = coaching.get_recommendation(user).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }
    match outcome {
        RecommendationOutcome::Delivered {
            recommendation,
            quota,
        } => {
            println!("{} {}", "Next step:".bold(), recommendation);
            print_quota(&quota);
        }
        RecommendationOutcome::QuotaExceeded { quota } => {
            eprintln!("{}", "Daily limit reached; no recommendation today.".yellow());
            print_quota(&quota);
        }
        RecommendationOutcome::GenerationFailed { message, reason } => {
            println!("{}", message.yellow());
            eprintln!("  {} {}", "reason:".dimmed(), reason.dimmed());
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// sessions
// ---------------------------------------------------------------------------

async fn cmd_sessions(coaching: &Coaching, user: &str, limit: usize, json: bool) -> Result<()> {
    let sessions = coaching.list_sessions(user, limit).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
        return Ok(());
    }
    if sessions.is_empty() {
        println!("{}", "No sessions yet.".dimmed());
        return Ok(());
    }
    println!(
        "{:<38} {:<18} {:>6}  {}",
        "ID".dimmed(),
        "Created".dimmed(),
        "Turns".dimmed(),
        "Last turn".dimmed()
    );
    for s in &sessions {
        let last = s
            .last_turn_at
            .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<38} {:<18} {:>6}  {}",
            s.id.to_string().cyan(),
            s.created_at
                .with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M"),
            s.turn_count,
            last
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// output helpers
// ---------------------------------------------------------------------------

fn print_turn(turn: &Turn) {
    let time = turn.timestamp.with_timezone(&chrono::Local).format("%H:%M");
    match (turn.role, turn.source) {
        (Role::User, _) => println!("{} {} {}", time.dimmed(), "you:".blue(), turn.content),
        (Role::Assistant, TurnSource::Fallback) => {
            println!("{} {} {}", time.dimmed(), "coach (offline):".yellow(), turn.content)
        }
        (Role::Assistant, _) => println!("{} {} {}", time.dimmed(), "coach:".green(), turn.content),
    }
}

fn print_quota(quota: &QuotaStatus) {
    let limit = quota
        .limit
        .map(|l| l.to_string())
        .unwrap_or_else(|| "unlimited".to_string());
    let remaining = if quota.remaining.allows_consumption() {
        quota.remaining.to_string().green().to_string()
    } else {
        quota.remaining.to_string().red().to_string()
    };
    println!(
        "  {} {} used of {}, {} left ({})",
        "Quota:".dimmed(),
        quota.used,
        limit,
        remaining,
        quota.day
    );
}

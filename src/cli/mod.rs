use std::path::PathBuf;

use anyhow::{Context, Result};
use console::style;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use crate::core::config::EngineConfig;
use crate::core::events::ProgressEvent;
use crate::core::export::ExportFormat;
use crate::core::job::NewJob;
use crate::core::service::StudioService;
use crate::core::terminal::{self, GuideSection, print_error};

fn print_help() {
    terminal::print_banner();

    GuideSection::new("Jobs")
        .command("create", "Create a job from source material")
        .command("list", "List all jobs")
        .command("status", "Show one job in detail")
        .print();

    GuideSection::new("Generation")
        .command("run", "Run a job's full phase plan")
        .command("scripts", "Generate episode scripts only")
        .command("episode", "Generate one episode's storyboard")
        .print();

    GuideSection::new("Output")
        .command("export", "Export the flat shot list (json/csv)")
        .command("plans", "List the available phase plans")
        .command("queue", "Show execution queue limits")
        .print();

    println!(
        "\n {} {} <command> [args] [--config <path>]\n",
        style("Usage:").bold(),
        style("showrunner").green()
    );
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CreateArgs {
    pub title: String,
    pub source_file: Option<String>,
    pub source: Option<String>,
    pub episodes: u32,
    pub minutes: u32,
    pub plan: String,
}

pub(crate) fn parse_create_args(args: &[String], start: usize) -> CreateArgs {
    let mut parsed = CreateArgs {
        title: String::new(),
        source_file: None,
        source: None,
        episodes: 5,
        minutes: 2,
        plan: "simple".to_string(),
    };
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--title" | "-t" => {
                if i + 1 < args.len() {
                    parsed.title = args[i + 1].clone();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--source-file" | "-f" => {
                if i + 1 < args.len() {
                    parsed.source_file = Some(args[i + 1].clone());
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--source" | "-s" => {
                if i + 1 < args.len() {
                    parsed.source = Some(args[i + 1].clone());
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--episodes" | "-e" => {
                if i + 1 < args.len() {
                    parsed.episodes = args[i + 1].parse().unwrap_or(5);
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--minutes" | "-m" => {
                if i + 1 < args.len() {
                    parsed.minutes = args[i + 1].parse().unwrap_or(2);
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--plan" => {
                if i + 1 < args.len() {
                    parsed.plan = args[i + 1].clone();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }
    parsed
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ExportArgs {
    pub job_id: String,
    pub format: String,
    pub out: Option<String>,
}

pub(crate) fn parse_export_args(args: &[String], start: usize) -> ExportArgs {
    let mut parsed = ExportArgs {
        job_id: String::new(),
        format: "json".to_string(),
        out: None,
    };
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--format" => {
                if i + 1 < args.len() {
                    parsed.format = args[i + 1].clone();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--out" | "-o" => {
                if i + 1 < args.len() {
                    parsed.out = Some(args[i + 1].clone());
                    i += 2;
                } else {
                    i += 1;
                }
            }
            other => {
                if parsed.job_id.is_empty() && !other.starts_with('-') {
                    parsed.job_id = other.to_string();
                }
                i += 1;
            }
        }
    }
    parsed
}

/// Pull `--config <path>` out of the argv; everything else passes through.
pub(crate) fn extract_config_flag(args: &[String]) -> (Option<PathBuf>, Vec<String>) {
    let mut config = None;
    let mut rest = Vec::new();
    let mut i = 0;
    while i < args.len() {
        if args[i] == "--config" && i + 1 < args.len() {
            config = Some(PathBuf::from(&args[i + 1]));
            i += 2;
        } else {
            rest.push(args[i].clone());
            i += 1;
        }
    }
    (config, rest)
}

fn init_logging() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
}

/// Print scheduler progress while a generation command runs.
fn spawn_progress_printer(service: &StudioService) {
    let mut events = service.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ProgressEvent::PhaseStarted { phase, index, total, .. } => {
                    terminal::print_status("phase", &format!("{} ({}/{})", phase, index + 1, total));
                }
                ProgressEvent::EpisodeProgress { episode, total, .. } => {
                    terminal::print_status("episode", &format!("{}/{}", episode, total));
                }
                ProgressEvent::BatchProgress { phase, current, total, .. } => {
                    terminal::print_status("batch", &format!("{} {}/{}", phase, current, total));
                }
                ProgressEvent::UnitFailed { phase, episode, message, .. } => {
                    let at = episode.map(|e| format!(" (episode {})", e)).unwrap_or_default();
                    terminal::print_warn(&format!("{}{} failed: {}", phase, at, message));
                }
                _ => {}
            }
        }
    });
}

pub async fn run_main() -> Result<()> {
    init_logging();
    let argv: Vec<String> = std::env::args().skip(1).collect();
    let (config_path, args) = extract_config_flag(&argv);
    let config = EngineConfig::load(config_path.as_deref())?;

    let Some(cmd) = args.first().map(String::as_str) else {
        print_help();
        return Ok(());
    };

    match cmd {
        "create" => {
            let parsed = parse_create_args(&args, 1);
            if parsed.title.is_empty() {
                print_error("--title is required");
                return Ok(());
            }
            let source_text = match (&parsed.source_file, &parsed.source) {
                (Some(path), _) => std::fs::read_to_string(path)
                    .with_context(|| format!("reading source file {}", path))?,
                (None, Some(text)) => text.clone(),
                (None, None) => {
                    print_error("--source or --source-file is required");
                    return Ok(());
                }
            };
            let service = StudioService::start(config).await?;
            let job = service
                .create_job(NewJob {
                    title: parsed.title,
                    source_text,
                    total_episodes: parsed.episodes,
                    minutes_per_episode: parsed.minutes,
                    plan_id: parsed.plan,
                })
                .await?;
            terminal::print_success(&format!("Created job {}", job.id));
            terminal::print_status("title", &job.title);
            terminal::print_status("episodes", &job.total_episodes.to_string());
            terminal::print_status("plan", &job.plan_id);
        }
        "scripts" => {
            let job_id = require_job_id(&args)?;
            let service = StudioService::start(config).await?;
            spawn_progress_printer(&service);
            let job = service.generate_scripts(&job_id).await?;
            terminal::print_success(&format!(
                "{} scripts ready for {:?}",
                job.scripts.len(),
                job.title
            ));
        }
        "episode" => {
            let job_id = require_job_id(&args)?;
            let episode: u32 = args
                .get(2)
                .context("usage: episode <job_id> <episode>")?
                .parse()
                .context("episode must be a number")?;
            let service = StudioService::start(config).await?;
            spawn_progress_printer(&service);
            let job = service.generate_episode(&job_id, episode).await?;
            let shots = job.storyboards.get(&episode).map(Vec::len).unwrap_or(0);
            terminal::print_success(&format!("Episode {} storyboard: {} shots", episode, shots));
        }
        "run" => {
            let job_id = require_job_id(&args)?;
            let service = StudioService::start(config).await?;
            spawn_progress_printer(&service);
            let job = service.run_plan(&job_id).await?;
            let usage = service.token_usage();
            terminal::print_success(&format!(
                "Job {:?} finished with status {}",
                job.title, job.status
            ));
            terminal::print_status("shots", &job.all_shots().len().to_string());
            terminal::print_status(
                "tokens",
                &format!("{} in / {} out", usage.input, usage.output),
            );
        }
        "status" => {
            let job_id = require_job_id(&args)?;
            let service = StudioService::start(config).await?;
            let job = service.get_job(&job_id).await?;
            terminal::print_status("title", &job.title);
            terminal::print_status("status", job.status.as_str());
            terminal::print_status(
                "scripts",
                &format!("{}/{}", job.scripts.len(), job.total_episodes),
            );
            terminal::print_status(
                "episodes with shots",
                &format!(
                    "{}/{}",
                    (1..=job.total_episodes).filter(|e| job.episode_done(*e)).count(),
                    job.total_episodes
                ),
            );
            terminal::print_status("total shots", &job.all_shots().len().to_string());
            for err in &job.errors {
                let at = err.episode.map(|e| format!(" episode {}", e)).unwrap_or_default();
                terminal::print_warn(&format!("{}{}: {}", err.phase, at, err.message));
            }
        }
        "list" => {
            let service = StudioService::start(config).await?;
            let rows = service.list_jobs().await;
            if rows.is_empty() {
                terminal::print_info("No jobs yet. Start with: showrunner create");
            }
            for row in rows {
                println!(
                    "{}  {:<24} {:<22} {} eps, {} shots",
                    style(&row.id).dim(),
                    row.title,
                    row.status.as_str(),
                    row.total_episodes,
                    row.total_shots
                );
            }
        }
        "export" => {
            let parsed = parse_export_args(&args, 1);
            if parsed.job_id.is_empty() {
                print_error("usage: export <job_id> [--format json|csv] [--out <path>]");
                return Ok(());
            }
            let format = ExportFormat::parse(&parsed.format)?;
            let service = StudioService::start(config).await?;
            let rendered = service.export_job(&parsed.job_id, format).await?;
            match parsed.out {
                Some(path) => {
                    std::fs::write(&path, rendered)
                        .with_context(|| format!("writing {}", path))?;
                    terminal::print_success(&format!("Exported to {}", path));
                }
                None => println!("{}", rendered),
            }
        }
        "plans" => {
            let service = StudioService::start(config).await?;
            for plan in service.plans() {
                println!("{}  {}", style(&plan.plan_id).green().bold(), plan.description);
                for phase in &plan.phases {
                    println!(
                        "    {:<12} {:?}{}",
                        phase.output,
                        phase.granularity,
                        if phase.optional { " (optional)" } else { "" }
                    );
                }
            }
        }
        "queue" => {
            let service = StudioService::start(config).await?;
            let status = service.queue_status();
            terminal::print_status("max concurrent", &status.max_concurrent.to_string());
            terminal::print_status("active", &status.active.to_string());
            terminal::print_status("queued", &status.queued.to_string());
            terminal::print_status("backends", &service.backends().join(", "));
        }
        "help" | "--help" | "-h" => print_help(),
        other => {
            print_error(&format!("Unknown command: {}", other));
            print_help();
        }
    }
    Ok(())
}

fn require_job_id(args: &[String]) -> Result<String> {
    args.get(1)
        .filter(|s| !s.starts_with('-'))
        .cloned()
        .context("a job id is required")
}

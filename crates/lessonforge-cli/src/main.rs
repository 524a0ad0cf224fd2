use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use lessonforge_ai::{CompletionOptions, LLMProviderFactory};
use lessonforge_core::prompt::{self, collect_dependency_values};
use lessonforge_core::{
    init_tracing, ConfigManager, FieldId, FileAssetStore, JsonFileResponseStore, LessonDocument,
    LessonForgeConfig, LessonInstance, ResponseStore,
};
use lessonforge_engine::{GenerationOrchestrator, SessionStatus};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(
    name = "lessonforge",
    version,
    about = "LessonForge CLI - AI generation for lesson templates",
    long_about = "Generates the AI-enabled fields of a lesson in dependency order, \
                  reports stale content and manages configuration."
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true, help = "Enable verbose logging")]
    verbose: bool,

    #[arg(long, global = true, help = "Configuration file path")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Generate every AI-enabled field of a lesson, or a single field")]
    Generate {
        #[arg(short, long, help = "Lesson document (JSON)")]
        lesson: PathBuf,

        #[arg(short, long, help = "Only regenerate this field")]
        field: Option<String>,

        #[arg(
            long,
            requires = "field",
            help = "Only regenerate this item (1-based) of an item-set field"
        )]
        item: Option<usize>,

        #[arg(
            long,
            conflicts_with = "field",
            help = "Start from the first field instead of a saved paused session"
        )]
        restart: bool,
    },

    #[command(about = "Show the generation queue and what each field is waiting for")]
    Queue {
        #[arg(short, long, help = "Lesson document (JSON)")]
        lesson: PathBuf,
    },

    #[command(about = "Print the prompt a field would be generated from")]
    Prompt {
        #[arg(short, long, help = "Lesson document (JSON)")]
        lesson: PathBuf,

        #[arg(short, long, help = "Field id")]
        field: String,
    },

    #[command(about = "List generated fields whose context changed since generation")]
    Stale {
        #[arg(short, long, help = "Lesson document (JSON)")]
        lesson: PathBuf,

        #[arg(long, help = "Dismiss the stale notice for this field")]
        dismiss: Option<String>,

        #[arg(long, help = "Output as JSON")]
        json: bool,
    },

    #[command(about = "Manage configuration")]
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    #[command(about = "List AI providers compiled into this build")]
    Providers,
}

#[derive(Subcommand)]
enum ConfigAction {
    #[command(about = "Write a default configuration file")]
    Init {
        #[arg(default_value = ".lessonforge.toml")]
        path: PathBuf,

        #[arg(long, help = "Overwrite an existing file")]
        force: bool,
    },

    #[command(about = "Show the effective configuration")]
    Show {
        #[arg(long, help = "Output as JSON")]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Config {
        action: ConfigAction::Init { path, force },
    } = &cli.command
    {
        return handle_config_init(path, *force);
    }

    let config_mgr = match &cli.config {
        Some(path) => ConfigManager::load_from(path),
        None => ConfigManager::load(),
    }
    .context("Failed to load configuration")?;
    let mut config = config_mgr.config().clone();
    if cli.verbose {
        config.logging.level = "debug".to_string();
    }
    init_tracing(&config.logging);

    match cli.command {
        Commands::Generate {
            lesson,
            field,
            item,
            restart,
        } => handle_generate(&config, &lesson, field, item, restart).await,
        Commands::Queue { lesson } => handle_queue(&lesson),
        Commands::Prompt { lesson, field } => handle_prompt(&lesson, &field),
        Commands::Stale {
            lesson,
            dismiss,
            json,
        } => handle_stale(&lesson, dismiss, json),
        Commands::Config {
            action: ConfigAction::Show { json },
        } => handle_config_show(&config, config_mgr.config_path(), json),
        Commands::Config {
            action: ConfigAction::Init { .. },
        } => Ok(()),
        Commands::Providers => {
            println!("{}", "Available providers:".blue().bold());
            for name in LLMProviderFactory::supported_providers() {
                let marker = if name == config.llm.provider {
                    "(configured)".green().to_string()
                } else {
                    String::new()
                };
                println!("  {} {}", name, marker);
            }
            Ok(())
        }
    }
}

fn read_lesson(path: &Path) -> Result<LessonInstance> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read lesson {}", path.display()))?;
    let doc: LessonDocument = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid lesson document {}", path.display()))?;
    LessonInstance::from_document(doc).context("Invalid lesson template")
}

fn write_lesson(path: &Path, lesson: &LessonInstance) -> Result<()> {
    let body = serde_json::to_string_pretty(&lesson.to_document())?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, body).with_context(|| format!("Failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

/// Take over values the response store holds but the lesson document lacks,
/// e.g. after the document was written before an interrupted run finished.
async fn merge_saved_responses(
    store: &dyn ResponseStore,
    lesson: &mut LessonInstance,
) -> Result<usize> {
    let saved = store
        .load(&lesson.lesson_id)
        .await
        .with_context(|| format!("Failed to load saved responses for {}", lesson.lesson_id))?;
    Ok(saved.map_or(0, |responses| lesson.merge_responses(responses)))
}

fn build_orchestrator(
    config: &LessonForgeConfig,
    responses: Arc<dyn ResponseStore>,
) -> Result<GenerationOrchestrator> {
    let text = LLMProviderFactory::create_from_config(&config.llm)?;
    let structured = LLMProviderFactory::create_structured_from_config(&config.llm)?;
    let data_dir = &config.storage.data_dir;

    let mut orchestrator = GenerationOrchestrator::new(text, responses)
        .with_structured_provider(structured)
        .with_asset_store(Arc::new(FileAssetStore::new(data_dir.join("assets"))))
        .with_options(CompletionOptions {
            temperature: config.llm.temperature,
            max_tokens: Some(config.llm.max_tokens),
            ..Default::default()
        });

    if let Some(pipeline) = LLMProviderFactory::create_image_pipeline(&config.image, &config.llm)?
    {
        orchestrator = orchestrator.with_image_pipeline(pipeline);
    }
    Ok(orchestrator)
}

async fn handle_generate(
    config: &LessonForgeConfig,
    lesson_path: &Path,
    field: Option<String>,
    item: Option<usize>,
    restart: bool,
) -> Result<()> {
    let mut lesson = read_lesson(lesson_path)?;
    let responses = Arc::new(JsonFileResponseStore::new(
        config.storage.data_dir.join("responses"),
    ));
    let merged = merge_saved_responses(responses.as_ref(), &mut lesson).await?;
    if merged > 0 {
        info!("Restored {} saved value(s) into {}", merged, lesson.lesson_id);
    }
    let mut orchestrator = build_orchestrator(config, responses)?;

    if let Some(field) = field {
        let field_id = FieldId::from(field);
        let outcome = match item {
            Some(number) => {
                let index = number
                    .checked_sub(1)
                    .ok_or_else(|| anyhow!("item numbers start at 1"))?;
                orchestrator
                    .regenerate_item(&mut lesson, &field_id, index)
                    .await?
            }
            None => orchestrator.generate_field(&mut lesson, &field_id).await?,
        };
        write_lesson(lesson_path, &lesson)?;
        println!("{} {}", "✓ Generated".green().bold(), field_id);
        println!("{}", outcome.value.render_for_prompt());
        if let Some(message) = outcome.persistence_error {
            println!("{} {}", "⚠ Not saved:".yellow(), message);
        }
        return Ok(());
    }

    // Ctrl-C asks for a pause; the field in flight still completes.
    let handle = orchestrator.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.request_pause();
        }
    });

    let mut updates = orchestrator.handle().subscribe();
    let printer = tokio::spawn(async move {
        let mut last_index = None;
        while updates.changed().await.is_ok() {
            let progress = updates.borrow_and_update().clone();
            if progress.status != SessionStatus::Generating {
                continue;
            }
            if let Some(field) = &progress.current_field {
                if last_index != Some(progress.current_index) {
                    last_index = Some(progress.current_index);
                    println!(
                        "  {} [{}/{}] {}",
                        "→".cyan(),
                        progress.current_index + 1,
                        progress.total,
                        field
                    );
                }
            }
        }
    });

    info!("Generating lesson {}", lesson.lesson_id);
    let status = match lesson.checkpoint.take() {
        Some(checkpoint) if !restart => {
            println!(
                "{} at field {} of {}",
                "↻ Resuming".cyan().bold(),
                checkpoint.resume_index + 1,
                checkpoint.queue.len()
            );
            orchestrator
                .resume_from(&mut lesson, checkpoint)
                .await
                .context("Saved session no longer fits the lesson; run with --restart")?
        }
        _ => orchestrator.start(&mut lesson).await?,
    };
    lesson.checkpoint = orchestrator.checkpoint();
    write_lesson(lesson_path, &lesson)?;

    let session = orchestrator.session().cloned();
    let pause_cause = orchestrator.last_error().map(ToString::to_string);
    drop(orchestrator);
    printer.await.ok();

    let persistence_errors = session
        .as_ref()
        .map(|s| s.persistence_errors.clone())
        .unwrap_or_default();
    for message in &persistence_errors {
        println!("{} {}", "⚠ Not saved:".yellow(), message);
    }

    match status {
        SessionStatus::Completed => {
            let generated = session.map_or(0, |s| s.generated.len());
            println!(
                "{}",
                format!("✓ Generated {generated} field(s)").green().bold()
            );
            Ok(())
        }
        SessionStatus::Paused {
            reason,
            resume_index,
        } => {
            println!(
                "{} {} at field {}",
                "⏸ Paused:".yellow().bold(),
                reason,
                resume_index + 1
            );
            if let Some(cause) = pause_cause {
                println!("  {}", cause);
            }
            if let Some(session) = session {
                for id in &session.missing_fields {
                    let name = lesson.graph.name_of(id).unwrap_or(id.as_str());
                    println!("  {} {} ({})", "•".yellow(), name, id);
                }
            }
            println!(
                "Run generate again to continue from field {}.",
                resume_index + 1
            );
            Ok(())
        }
        SessionStatus::Failed { .. } => bail!("Generation {}", status),
        other => {
            println!("Session ended: {}", other);
            Ok(())
        }
    }
}

fn handle_queue(lesson_path: &Path) -> Result<()> {
    let lesson = read_lesson(lesson_path)?;
    println!(
        "{}",
        format!("Generation queue for {}", lesson.lesson_id)
            .blue()
            .bold()
    );
    for (i, field) in lesson.graph.ordered_generation_queue().iter().enumerate() {
        let state = if lesson.values.is_filled(&field.id) {
            "filled".green()
        } else {
            "empty".dimmed()
        };
        println!(
            "{:>3}. {} [{}] {} ({})",
            i + 1,
            field.name,
            field.section,
            state,
            field.field_type.label()
        );

        let deps = lesson.graph.dependencies_of(&field.id, &lesson.overrides)?;
        for dep in deps {
            let filled = lesson.values.is_filled(&dep);
            let required = lesson
                .graph
                .field(&dep)
                .is_some_and(|f| f.required_for_generation);
            let marker = match (filled, required) {
                (true, _) => "✓".green(),
                (false, true) => "✗".red(),
                (false, false) => "○".yellow(),
            };
            let name = lesson.graph.name_of(&dep).unwrap_or(dep.as_str());
            println!("       {} {}", marker, name);
        }
    }
    Ok(())
}

fn handle_prompt(lesson_path: &Path, field: &str) -> Result<()> {
    let lesson = read_lesson(lesson_path)?;
    let field_id = FieldId::from(field);
    let config = lesson.effective_config(&field_id)?;
    let dep_ids = lesson.graph.dependencies_of(&field_id, &lesson.overrides)?;
    let deps = collect_dependency_values(&lesson.graph, &dep_ids, &lesson.values)?;
    println!("{}", prompt::compile(&config, &deps));
    Ok(())
}

fn handle_stale(lesson_path: &Path, dismiss: Option<String>, json: bool) -> Result<()> {
    let mut lesson = read_lesson(lesson_path)?;

    if let Some(field) = dismiss {
        let field_id = FieldId::from(field);
        if !lesson.dismiss_stale(&field_id) {
            bail!("Field {} has never been generated", field_id);
        }
        write_lesson(lesson_path, &lesson)?;
        println!("{} {}", "✓ Dismissed".green(), field_id);
        return Ok(());
    }

    let reports: Vec<_> = lesson
        .graph
        .fields()
        .iter()
        .filter(|f| lesson.staleness.has_generated(&f.id))
        .map(|f| (f, lesson.stale_report(&f.id)))
        .collect();

    if json {
        let out: Vec<_> = reports
            .iter()
            .map(|(field, report)| {
                serde_json::json!({
                    "field_id": field.id,
                    "name": field.name,
                    "stale": report.stale,
                    "dismissed": report.dismissed,
                    "changed": report.changed,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if reports.iter().all(|(_, r)| !r.stale) {
        println!("{}", "✓ All generated content is up to date".green());
        return Ok(());
    }
    for (field, report) in reports.iter().filter(|(_, r)| r.stale) {
        println!(
            "{} {} ({}): context changed in {}",
            "⚠".yellow(),
            field.name,
            field.id,
            report.changed.join(", ")
        );
    }
    Ok(())
}

fn handle_config_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    ConfigManager::create_default_config(path).context("Failed to write configuration")?;
    println!("✓ Created configuration file: {}", path.display());
    println!();
    println!("Configuration hierarchy (highest to lowest priority):");
    println!("  1. Environment variables (ANTHROPIC_API_KEY, LESSONFORGE_*)");
    println!("  2. Local .env or ~/.lessonforge.env");
    println!("  3. Local .lessonforge.toml");
    println!("  4. Global ~/.lessonforge/config.toml");
    println!("  5. Built-in defaults");
    Ok(())
}

fn redacted(config: &LessonForgeConfig) -> LessonForgeConfig {
    let mut config = config.clone();
    for key in [
        &mut config.llm.anthropic_api_key,
        &mut config.llm.openai_api_key,
    ] {
        if key.is_some() {
            *key = Some("***".to_string());
        }
    }
    config
}

fn handle_config_show(
    config: &LessonForgeConfig,
    path: Option<&Path>,
    json: bool,
) -> Result<()> {
    let config = redacted(config);
    if json {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }
    println!("{}", "Current Configuration:".blue().bold());
    match path {
        Some(path) => println!("  File: {}", path.display()),
        None => println!("  File: {}", "none (defaults)".dimmed()),
    }
    println!();
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

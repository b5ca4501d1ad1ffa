//! ACE-Step 1.5 Studio command line.
//!
//! Installs and launches the bundled application, edits settings and
//! presets, and runs generations through the persisted queue.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ace15_studio::engine::ace_config::{build_config, write_config};
use ace15_studio::engine::executor::AceExecutor;
use ace15_studio::launcher;
use ace15_studio::queue::{build_job, JobQueue, QueueWorker};
use ace15_studio::storage::get_data_dir;
use ace15_studio::storage::layout::{AppLayout, ROOT_ENV_VAR};
use ace15_studio::storage::presets::{
    apply_payload, load_presets, parse_payload, payload_from_settings, save_presets,
};
use ace15_studio::storage::settings::{load_settings, save_settings, Settings};
use ace15_studio::system::gpu::{detect_gpu, recommend_offload};
use ace15_studio::system::models::{discover_lm_models, discover_main_models};
use ace15_studio::system::outputs::{list_audio_files, open_in_explorer};
use ace15_studio::types::job::QueueJob;
use ace15_studio::types::lyrics::placeholder_lyrics;
use ace15_studio::types::request::GenerationRequest;
use ace15_studio::types::task::TaskType;
use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};

/// Top-level CLI options.
#[derive(Parser)]
#[command(name = "ace15")]
#[command(about = "ACE-Step 1.5 studio: presets, queue and launcher", long_about = None)]
struct Cli {
    /// Application root (defaults to detection, then the per-user data dir).
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    /// Log at debug level.
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the installer script with the bundled interpreter.
    Install {
        /// Exit without waiting for Enter.
        #[arg(long)]
        no_pause: bool,
    },
    /// Run the application entry script.
    Launch,
    /// Print the detected layout.
    Paths,
    /// Show or change settings.
    Settings {
        #[command(subcommand)]
        command: SettingsCommands,
    },
    /// Manage genre / subgenre presets.
    Preset {
        #[command(subcommand)]
        command: PresetCommands,
    },
    /// Fill or clear the lyrics of the current draft.
    Lyrics {
        #[command(subcommand)]
        command: LyricsCommands,
    },
    /// List main and LM checkpoints.
    Models,
    /// Queue one generation and run the queue until it is empty.
    Generate(DraftArgs),
    /// Inspect or run the generation queue.
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },
    /// List generated audio, newest first.
    Outputs {
        /// Open the output folder.
        #[arg(long)]
        open: bool,
    },
    /// Write the TOML config for the current settings without running it.
    Config(DraftArgs),
    /// Detect the GPU and suggest offload flags.
    Gpu,
}

#[derive(Subcommand)]
enum SettingsCommands {
    /// Print settings as JSON.
    Show,
    /// Set one field, e.g. `settings set duration 120`.
    Set { key: String, value: String },
    /// Reset paths to the detected layout.
    Detect,
    /// Write the settings file and pointer.
    Save,
}

#[derive(Subcommand)]
enum PresetCommands {
    /// List presets, optionally of one genre.
    List { genre: Option<String> },
    /// Print one preset as JSON.
    Show { genre: String, subgenre: String },
    /// Add or overwrite a preset (from --json, else from current settings).
    Add {
        genre: String,
        subgenre: String,
        #[arg(long)]
        json: Option<String>,
    },
    /// Remove a preset.
    Remove {
        genre: String,
        subgenre: String,
        /// Also drop the genre if it becomes empty.
        #[arg(long)]
        drop_empty_genre: bool,
    },
    /// Rename a preset and/or replace its body.
    Edit {
        genre: String,
        subgenre: String,
        #[arg(long)]
        new_genre: Option<String>,
        #[arg(long)]
        new_subgenre: Option<String>,
        #[arg(long)]
        json: Option<String>,
    },
    /// Apply a preset to the settings and save them.
    Apply { genre: String, subgenre: String },
}

#[derive(Subcommand)]
enum LyricsCommands {
    /// Write placeholder lyrics from the caption and tempo.
    Generate,
    /// Empty the lyrics.
    Clear,
}

#[derive(Subcommand)]
enum QueueCommands {
    /// Show the queued jobs.
    List,
    /// Queue a generation without running it.
    Add(DraftArgs),
    /// Remove a pending job.
    Remove { job_id: u64 },
    /// Remove every pending job.
    Clear,
    /// Run queued jobs until the queue is empty. Ctrl-C cancels.
    Run,
}

/// Per-run text; anything given is stored in the settings draft.
#[derive(Args, Default)]
struct DraftArgs {
    #[arg(long)]
    caption: Option<String>,
    #[arg(long)]
    lyrics: Option<String>,
    #[arg(long)]
    instrumental: Option<bool>,
    #[arg(long)]
    task: Option<TaskType>,
    #[arg(long)]
    src_audio: Option<PathBuf>,
    #[arg(long)]
    duration: Option<f64>,
    #[arg(long)]
    seed: Option<i64>,
    #[arg(long)]
    batch_size: Option<u32>,
}

impl DraftArgs {
    fn apply(&self, settings: &mut Settings) {
        let draft = &mut settings.draft;
        if let Some(caption) = &self.caption {
            draft.caption = caption.clone();
        }
        if let Some(lyrics) = &self.lyrics {
            draft.lyrics = lyrics.clone();
        }
        if let Some(instrumental) = self.instrumental {
            draft.instrumental = instrumental;
        }
        if let Some(src) = &self.src_audio {
            draft.src_audio = Some(src.clone());
        }
        if let Some(task) = self.task {
            settings.task_type = task;
        }
        if let Some(duration) = self.duration {
            settings.duration = duration;
        }
        if let Some(seed) = self.seed {
            settings.seed = seed;
            settings.seed_random = false;
        }
        if let Some(batch) = self.batch_size {
            settings.batch_size = batch;
        }
        settings.validate();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Install { no_pause } => {
            let base = cli.root.unwrap_or_else(launcher::default_base_dir);
            let code = launcher::install(&base).await?;
            if code != 0 {
                eprintln!("Installer exited with code {}", code);
            }
            if !no_pause {
                pause();
            }
            std::process::exit(code);
        }
        Commands::Launch => {
            let base = cli.root.unwrap_or_else(launcher::default_base_dir);
            let code = launcher::launch(&base).await?;
            std::process::exit(code);
        }
        command => {
            let layout = resolve_layout(cli.root)?;
            run_command(command, &layout).await
        }
    }
}

/// `--root`, else a detected root, else the per-user data directory.
fn resolve_layout(root: Option<PathBuf>) -> Result<AppLayout> {
    if let Some(root) = root {
        return Ok(AppLayout::new(root));
    }
    if std::env::var_os(ROOT_ENV_VAR).is_some() {
        return Ok(AppLayout::detect(Path::new(".")));
    }

    let starts = [
        Some(launcher::default_base_dir()),
        std::env::current_dir().ok(),
    ];
    for start in starts.into_iter().flatten() {
        let layout = AppLayout::detect(&start);
        if looks_like_root(layout.root()) {
            return Ok(layout);
        }
    }

    let data_dir = get_data_dir()?;
    tracing::debug!("No application root found, using {}", data_dir.display());
    Ok(AppLayout::new(data_dir))
}

fn looks_like_root(dir: &Path) -> bool {
    dir.join("models").is_dir() || dir.join("presets").join("setsave").is_dir()
}

async fn run_command(command: Commands, layout: &AppLayout) -> Result<()> {
    match command {
        Commands::Paths => print_paths(layout),
        Commands::Settings { command } => settings_command(command, layout)?,
        Commands::Preset { command } => preset_command(command, layout)?,
        Commands::Lyrics { command } => lyrics_command(command, layout)?,
        Commands::Models => {
            let settings = load_settings(layout);
            println!("Main models:");
            for name in discover_main_models(&settings.project_root) {
                println!("  {}", name);
            }
            println!("LM models:");
            for name in discover_lm_models(&settings.project_root) {
                println!("  {}", name);
            }
        }
        Commands::Generate(draft) => {
            let mut queue = JobQueue::load(&layout.queue_path());
            let job_id = queue.enqueue(prepare_job(layout, &draft)?);
            println!("Queued job #{}", job_id);
            run_queue(layout, queue).await?;
        }
        Commands::Queue { command } => queue_command(command, layout).await?,
        Commands::Outputs { open } => {
            let settings = load_settings(layout);
            for path in list_audio_files(&settings.output_dir) {
                println!("{}", path.display());
            }
            if open {
                open_in_explorer(&settings.output_dir)?;
            }
        }
        Commands::Config(draft) => {
            let mut settings = load_settings(layout);
            draft.apply(&mut settings);
            let request = GenerationRequest::new(settings)?;
            let out_dir = request.settings().output_dir.clone();
            let path = write_config(&out_dir, &build_config(&request, &out_dir))?;
            println!("{}", path.display());
        }
        Commands::Gpu => match detect_gpu() {
            Some(gpu) => {
                let advice = recommend_offload(gpu.vram_total_mb);
                println!("{} ({} MB)", gpu.name, gpu.vram_total_mb);
                println!("offload_to_cpu: {}", advice.offload_to_cpu);
                println!("offload_dit_to_cpu: {}", advice.offload_dit_to_cpu);
            }
            None => println!("No GPU detected"),
        },
        Commands::Install { .. } | Commands::Launch => {}
    }
    Ok(())
}

fn print_paths(layout: &AppLayout) {
    let settings = load_settings(layout);
    let rows = [
        ("root", layout.root().to_path_buf()),
        ("settings", layout.settings_path()),
        ("queue", layout.queue_path()),
        ("presets", layout.presets_path()),
        ("installer", layout.installer_script()),
        ("app", layout.app_entry_script()),
        ("env python", settings.env_python.clone()),
        ("project root", settings.project_root.clone()),
        ("cli.py", settings.cli_py.clone()),
        ("output", settings.output_dir.clone()),
    ];
    for (label, path) in rows {
        println!("{:<13} {}", label, path.display());
    }
    let missing = settings.missing_paths();
    if !missing.is_empty() {
        println!("missing: {}", missing.join(", "));
    }
}

fn lyrics_command(command: LyricsCommands, layout: &AppLayout) -> Result<()> {
    let mut settings = load_settings(layout);
    // Instrumental runs ignore the lyrics box, so either action turns it off.
    settings.draft.instrumental = false;
    settings.draft.lyrics = match command {
        LyricsCommands::Generate => {
            placeholder_lyrics(&settings.draft.caption, settings.bpm, settings.timesignature)
        }
        LyricsCommands::Clear => String::new(),
    };
    save_settings(layout, &settings)?;
    print!("{}", settings.draft.lyrics);
    Ok(())
}

fn settings_command(command: SettingsCommands, layout: &AppLayout) -> Result<()> {
    let mut settings = load_settings(layout);
    match command {
        SettingsCommands::Show => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
        SettingsCommands::Set { key, value } => {
            settings.set_field(&key, &value)?;
            save_settings(layout, &settings)?;
        }
        SettingsCommands::Detect => {
            settings.apply_layout(layout);
            settings.validate();
            let path = save_settings(layout, &settings)?;
            println!("Saved {}", path.display());
            let missing = settings.missing_paths();
            if !missing.is_empty() {
                println!("missing: {}", missing.join(", "));
            }
        }
        SettingsCommands::Save => {
            let path = save_settings(layout, &settings)?;
            println!("Saved {}", path.display());
        }
    }
    Ok(())
}

fn preset_command(command: PresetCommands, layout: &AppLayout) -> Result<()> {
    let path = layout.presets_path();
    let mut doc = load_presets(&path);
    match command {
        PresetCommands::List { genre } => {
            for key in doc.list(genre.as_deref()) {
                println!("{}", key);
            }
        }
        PresetCommands::Show { genre, subgenre } => {
            let payload = doc
                .get(&genre, &subgenre)
                .with_context(|| format!("preset '{} / {}' not found", genre, subgenre))?;
            println!("{}", serde_json::to_string_pretty(payload)?);
        }
        PresetCommands::Add {
            genre,
            subgenre,
            json,
        } => {
            let payload = match json {
                Some(text) => parse_payload(&text)?,
                None => payload_from_settings(&load_settings(layout)),
            };
            let key = doc.add(&genre, &subgenre, payload)?;
            save_presets(&path, &doc)?;
            println!("Saved {}", key);
        }
        PresetCommands::Remove {
            genre,
            subgenre,
            drop_empty_genre,
        } => {
            let dropped_genre = doc.remove(&genre, &subgenre, drop_empty_genre)?;
            save_presets(&path, &doc)?;
            if dropped_genre {
                println!("Removed {} / {} and empty genre", genre, subgenre);
            } else {
                println!("Removed {} / {}", genre, subgenre);
            }
        }
        PresetCommands::Edit {
            genre,
            subgenre,
            new_genre,
            new_subgenre,
            json,
        } => {
            let payload = json.as_deref().map(parse_payload).transpose()?;
            let key = doc.edit(
                &genre,
                &subgenre,
                new_genre.as_deref().unwrap_or(&genre),
                new_subgenre.as_deref().unwrap_or(&subgenre),
                payload,
            )?;
            save_presets(&path, &doc)?;
            println!("Saved {}", key);
        }
        PresetCommands::Apply { genre, subgenre } => {
            let payload = doc
                .get(&genre, &subgenre)
                .with_context(|| format!("preset '{} / {}' not found", genre, subgenre))?;
            let mut settings = load_settings(layout);
            apply_payload(&mut settings, &subgenre, payload);
            save_settings(layout, &settings)?;
            println!("Applied {} / {}", genre, subgenre);
        }
    }
    Ok(())
}

async fn queue_command(command: QueueCommands, layout: &AppLayout) -> Result<()> {
    let mut queue = JobQueue::load(&layout.queue_path());
    match command {
        QueueCommands::List => {
            let jobs = queue.list();
            if jobs.is_empty() {
                println!("Queue is empty");
            }
            for job in jobs {
                println!("{}", job.summary());
            }
        }
        QueueCommands::Add(draft) => {
            let job_id = queue.enqueue(prepare_job(layout, &draft)?);
            println!("Queued job #{}", job_id);
        }
        QueueCommands::Remove { job_id } => {
            if !queue.remove(job_id)? {
                bail!("job #{} is not queued", job_id);
            }
            println!("Removed job #{}", job_id);
        }
        QueueCommands::Clear => {
            println!("Removed {} job(s)", queue.clear());
        }
        QueueCommands::Run => run_queue(layout, queue).await?,
    }
    Ok(())
}

/// Apply the draft flags, persist them, and resolve a job.
fn prepare_job(layout: &AppLayout, draft: &DraftArgs) -> Result<QueueJob> {
    let mut settings = load_settings(layout);
    draft.apply(&mut settings);
    save_settings(layout, &settings)?;
    let request = GenerationRequest::new(settings)?;
    Ok(build_job(&request)?)
}

/// Run the queue until it is empty, or until Ctrl-C.
async fn run_queue(layout: &AppLayout, queue: JobQueue) -> Result<()> {
    if queue.is_empty() {
        println!("Queue is empty");
        return Ok(());
    }
    let settings = load_settings(layout);
    let executor = Arc::new(AceExecutor::new(&settings));
    let (handle, task) = QueueWorker::spawn(queue, executor);

    tokio::select! {
        idle = handle.wait_idle() => idle?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, cancelling the running job");
        }
    }
    handle.shutdown().await?;
    task.await.context("queue worker panicked")?;
    Ok(())
}

fn pause() {
    print!("Press Enter to continue...");
    let _ = std::io::stdout().flush();
    let mut line = String::new();
    let _ = std::io::stdin().lock().read_line(&mut line);
}

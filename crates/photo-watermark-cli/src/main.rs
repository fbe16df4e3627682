//! Command-line interface for the photo watermark exporter

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use photo_watermark_core::{
    init, version, AppConfig, ConfigManager, ExportPolicy, ExportRequest, ExportService, JobSnapshot,
    JobStatus, LastSettings, NamingRule, OutputFormat, SourceFile, Template, TextWatermark,
    WatermarkSpec,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

const PROGRESS_POLL: Duration = Duration::from_millis(200);

#[derive(Parser)]
#[command(name = "photo-watermark")]
#[command(about = "Batch watermark and export photos")]
#[command(version = version())]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Application configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Watermark and export a batch of images
    Export {
        /// Source images
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Export request as JSON (watermarkConfig / exportConfig)
        #[arg(long = "config", value_name = "REQUEST_JSON")]
        request: Option<PathBuf>,

        /// Stored template id to start from
        #[arg(long, conflicts_with = "request")]
        template: Option<String>,

        /// Text watermark content
        #[arg(long)]
        text: Option<String>,

        /// Parent directory for the export folder
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// Output format (png or jpeg)
        #[arg(short, long)]
        format: Option<String>,

        /// JPEG quality (0-100)
        #[arg(short, long)]
        quality: Option<i32>,

        /// Output name prefix
        #[arg(long)]
        prefix: Option<String>,

        /// Output name suffix
        #[arg(long)]
        suffix: Option<String>,
    },

    /// List available font families
    Fonts,

    /// Manage stored templates
    Templates {
        #[command(subcommand)]
        action: TemplateAction,
    },

    /// Show version and runtime information
    Info,
}

#[derive(Subcommand)]
enum TemplateAction {
    /// List stored templates, newest first
    List,
    /// Print one template as JSON
    Show { id: String },
    /// Delete a template
    Delete { id: String },
    /// Store the configuration of an export request as a template
    Save {
        #[arg(long)]
        name: String,
        /// Export request as JSON
        #[arg(long = "config", value_name = "REQUEST_JSON")]
        request: PathBuf,
        /// Overwrite the template with this id
        #[arg(long)]
        id: Option<String>,
    },
}

/// Flag overrides applied on top of a request file or template
#[derive(Default)]
struct ExportOverrides {
    text: Option<String>,
    output_dir: Option<PathBuf>,
    format: Option<String>,
    quality: Option<i32>,
    prefix: Option<String>,
    suffix: Option<String>,
}

impl ExportOverrides {
    fn touches_policy(&self) -> bool {
        self.output_dir.is_some()
            || self.format.is_some()
            || self.quality.is_some()
            || self.prefix.is_some()
            || self.suffix.is_some()
    }

    fn apply(self, mut request: ExportRequest, from_file: bool) -> ExportRequest {
        if let Some(text) = self.text.clone() {
            request.watermark_config = Some(WatermarkSpec::text(TextWatermark::new(text)));
        }

        // Without a request file every export gets a default policy.
        if !from_file || self.touches_policy() {
            let policy = request.export_config.get_or_insert_with(ExportPolicy::default);
            if let Some(dir) = self.output_dir {
                policy.output_dir = Some(dir);
            }
            if let Some(format) = self.format {
                policy.format = OutputFormat::parse_lenient(&format);
            }
            if let Some(quality) = self.quality {
                policy.jpeg_quality = Some(quality);
            }
            if self.prefix.is_some() || self.suffix.is_some() {
                let naming = policy.naming.get_or_insert_with(NamingRule::default);
                naming.prefix = self.prefix.or(naming.prefix.take());
                naming.suffix = self.suffix.or(naming.suffix.take());
            }
        }
        request
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref())?;
    if cli.verbose {
        config.logging.level = "debug".to_string();
    }
    let service = init(&config).context("Failed to initialize the export engine")?;

    info!("Photo Watermark CLI v{} starting", version());

    match cli.command {
        Commands::Export {
            files,
            request,
            template,
            text,
            output_dir,
            format,
            quality,
            prefix,
            suffix,
        } => {
            let overrides = ExportOverrides {
                text,
                output_dir,
                format,
                quality,
                prefix,
                suffix,
            };
            let snapshot = run_export(&service, files, request, template, overrides).await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            if snapshot.status == JobStatus::Failed {
                bail!(
                    "Export job failed: {}",
                    snapshot.message.unwrap_or_else(|| "unknown error".to_string())
                );
            }
        }

        Commands::Fonts => {
            for family in service.fonts.families() {
                println!("{}", family);
            }
        }

        Commands::Templates { action } => run_templates(&service, action).await?,

        Commands::Info => {
            let storage = service
                .jobs
                .storage()
                .base_dir()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|e| format!("unavailable ({})", e));

            println!("Photo Watermark v{}", version());
            println!("Batch watermark and export tool");
            println!("\nRuntime Information:");
            println!("  Export workers: {}", service.jobs.worker_count());
            println!("  CPU cores: {}", num_cpus::get());
            println!("  Storage root: {}", storage);
            println!("  Font families: {}", service.fonts.families().len());
            println!("  Platform: {}", std::env::consts::OS);
            println!("  Architecture: {}", std::env::consts::ARCH);
        }
    }

    service.jobs.shutdown().await;
    Ok(())
}

/// An explicit config path must load; the default location falls back to
/// defaults when unavailable.
fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    match path {
        Some(path) => {
            let manager = ConfigManager::with_path(path.to_path_buf())
                .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
            Ok(manager.config().clone())
        }
        None => Ok(ConfigManager::new()
            .map(|manager| manager.config().clone())
            .unwrap_or_default()),
    }
}

async fn read_request(path: &Path) -> Result<ExportRequest> {
    let json = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&json).with_context(|| format!("Invalid export request in {}", path.display()))
}

async fn run_export(
    service: &ExportService,
    paths: Vec<PathBuf>,
    request_path: Option<PathBuf>,
    template_id: Option<String>,
    overrides: ExportOverrides,
) -> Result<JobSnapshot> {
    let (request, from_file) = match (&request_path, &template_id) {
        (Some(path), _) => (read_request(path).await?, true),
        (None, Some(id)) => {
            let template = service
                .templates
                .find(id)
                .await?
                .with_context(|| format!("Template {} not found", id))?;
            let request = ExportRequest {
                watermark_config: template.watermark_config,
                export_config: template.export_config,
            };
            (request, true)
        }
        (None, None) => (ExportRequest::default(), false),
    };
    let request = overrides.apply(request, from_file);

    let mut files = Vec::with_capacity(paths.len());
    for path in &paths {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        files.push(SourceFile::new(name, bytes));
    }

    let remembered = LastSettings {
        watermark_config: request.watermark_config.clone(),
        export_config: request.export_config.clone(),
        updated_at: None,
    };

    let submitted = service.jobs.submit(files, request).await?;
    info!(
        "Exporting {} file(s) into {}",
        submitted.total_files,
        submitted.output_directory.display()
    );
    if let Err(e) = service.settings.save(remembered).await {
        warn!("Could not remember export settings: {}", e);
    }

    let mut last_processed = 0;
    let mut ctrl_c = std::pin::pin!(tokio::signal::ctrl_c());
    let mut interrupted = false;
    loop {
        tokio::select! {
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                warn!("Interrupted, cancelling export job {}", submitted.id);
                service.jobs.cancel(submitted.id).await;
            }
            _ = tokio::time::sleep(PROGRESS_POLL) => {}
        }

        let snapshot = service
            .jobs
            .get_status(submitted.id)
            .await
            .context("Export job disappeared")?;
        if snapshot.processed_files != last_processed {
            last_processed = snapshot.processed_files;
            info!(
                "Progress: {} / {} ({:.0}%)",
                snapshot.processed_files,
                snapshot.total_files,
                snapshot.progress * 100.0
            );
        }
        if snapshot.is_terminal() && (snapshot.status != JobStatus::Cancelled || snapshot.current_file.is_none()) {
            debug!("Export job {} finished as {:?}", snapshot.id, snapshot.status);
            return Ok(snapshot);
        }
    }
}

async fn run_templates(service: &ExportService, action: TemplateAction) -> Result<()> {
    match action {
        TemplateAction::List => {
            let templates = service.templates.list().await?;
            println!("{}", serde_json::to_string_pretty(&templates)?);
        }
        TemplateAction::Show { id } => {
            let template = service
                .templates
                .find(&id)
                .await?
                .with_context(|| format!("Template {} not found", id))?;
            println!("{}", serde_json::to_string_pretty(&template)?);
        }
        TemplateAction::Delete { id } => {
            service.templates.delete(&id).await?;
            println!("Deleted template {}", id);
        }
        TemplateAction::Save { name, request, id } => {
            let request = read_request(&request).await?;
            let template = Template {
                id,
                watermark_config: request.watermark_config,
                export_config: request.export_config,
                ..Template::new(name)
            };
            let saved = service.templates.save(template).await?;
            println!("{}", serde_json::to_string_pretty(&saved)?);
        }
    }
    Ok(())
}

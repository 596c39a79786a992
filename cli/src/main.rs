//! media-export - Command-line interface for the export engine.
//!
//! Exports media (and optionally a project file) to a local folder or an FTP
//! server, and verifies copied files. It plays the host's part for the
//! engine: it answers prompts, pumps operation messages on the main thread
//! and runs the project conversion there.

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand};
use engine::{
    create_export_operation, verify_files, Destination, ExportPrompt, ExportReport, ExportRequest,
    ExportSettings, MediaSource, OperationMessage, OverwritePolicy, RemoteSettings, ResultCode,
    TextPathRewriter, TopLevelRename, TransportBackend, VerifyOption, UNITS_PER_FILE,
};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// media-export - Export media to a folder or an FTP server
#[derive(Parser, Debug)]
#[command(name = "media-export")]
#[command(version = "0.1.0")]
#[command(about = "Export media files and projects with progress tracking")]
struct Cli {
    /// Enable verbose output
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Export media to a destination
    Export(ExportArgs),
    /// Compare a copied file with its source
    Verify(VerifyArgs),
}

#[derive(Args, Debug)]
struct ExportArgs {
    /// Media file or folder to export (repeatable)
    #[arg(long = "media", value_name = "PATH", required = true)]
    media: Vec<PathBuf>,

    /// Common ancestor of the media; defaults to each media's parent folder
    #[arg(long, value_name = "DIR")]
    stem: Option<PathBuf>,

    /// Local destination folder
    #[arg(long, value_name = "DIR", conflicts_with_all = ["ftp_settings", "server"])]
    dst: Option<PathBuf>,

    /// JSON file with export defaults (overwrite policy, remote destination)
    #[arg(long, value_name = "FILE")]
    settings: Option<PathBuf>,

    /// JSON file with FTP settings
    #[arg(long, value_name = "FILE")]
    ftp_settings: Option<PathBuf>,

    /// FTP server host name
    #[arg(long, value_name = "HOST")]
    server: Option<String>,

    /// FTP server port
    #[arg(long, value_name = "PORT")]
    port: Option<u16>,

    /// FTP user name
    #[arg(long, value_name = "USER")]
    user: Option<String>,

    /// FTP password
    #[arg(long, value_name = "PASSWORD")]
    password: Option<String>,

    /// Directory on the FTP server to export into
    #[arg(long, value_name = "DIR")]
    remote_dir: Option<String>,

    /// FTP backend: blocking or event-loop
    #[arg(long, value_name = "BACKEND")]
    backend: Option<String>,

    /// Project file to rewrite and export next to the media
    #[arg(long, value_name = "FILE")]
    project: Option<PathBuf>,

    /// Overwrite policy: ask, overwrite, or skip
    #[arg(long, value_name = "POLICY")]
    overwrite: Option<String>,

    /// Answer yes to every question
    #[arg(long)]
    yes: bool,

    /// Verify each copied file: size, content, or md5 (local destinations)
    #[arg(long, value_name = "METHOD")]
    verify: Option<String>,
}

#[derive(Args, Debug)]
struct VerifyArgs {
    /// Source file
    #[arg(long, value_name = "FILE")]
    src: PathBuf,

    /// Copied file
    #[arg(long, value_name = "FILE")]
    dst: PathBuf,

    /// Comparison method: size, content, or md5
    #[arg(long, value_name = "METHOD", default_value = "md5")]
    method: String,
}

/// Answers the engine's questions on stdin.
struct StdinPrompt {
    assume_yes: bool,
}

impl StdinPrompt {
    fn ask(&self, question: &str) -> bool {
        if self.assume_yes {
            return true;
        }
        eprint!("\n{} [y/N] ", question);
        let _ = io::stderr().flush();
        let mut answer = String::new();
        if io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
    }
}

impl ExportPrompt for StdinPrompt {
    fn confirm_renames(&mut self, renames: &[TopLevelRename]) -> bool {
        eprintln!();
        eprintln!("These names are already used by other media and will be renamed:");
        for rename in renames {
            eprintln!(
                "  {} -> {} (from {})",
                rename.original,
                rename.renamed,
                rename.stem.display()
            );
        }
        self.ask("Continue with the renamed names?")
    }

    fn confirm_overwrite(&mut self, existing: &[PathBuf]) -> bool {
        eprintln!();
        eprintln!("These files already exist at the destination:");
        for path in existing {
            eprintln!("  {}", path.display());
        }
        self.ask("Overwrite them?")
    }
}

/// Renders operation messages as a progress line on stderr
struct CliProgress {
    verbose: bool,
    start_time: Instant,
    last_progress_update: Instant,
    total_units: u64,
    done_units: u64,
}

impl CliProgress {
    fn new(verbose: bool) -> Self {
        let now = Instant::now();
        CliProgress {
            verbose,
            start_time: now,
            last_progress_update: now,
            total_units: 0,
            done_units: 0,
        }
    }

    fn format_bytes(bytes: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = bytes as f64;
        let mut unit_idx = 0;

        while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
            size /= 1024.0;
            unit_idx += 1;
        }

        format!("{:.2} {}", size, UNITS[unit_idx])
    }

    fn format_duration(elapsed: Duration) -> String {
        let secs = elapsed.as_secs();
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        let secs = secs % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, mins, secs)
        } else if mins > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{}s", secs)
        }
    }

    fn print_progress_bar(percent: u32) -> String {
        let filled = (percent.min(100) / 5) as usize;
        let empty = 20 - filled;
        format!("[{}{}] {}%", "=".repeat(filled), " ".repeat(empty), percent)
    }

    fn percent(&self) -> u32 {
        if self.total_units == 0 {
            return 100;
        }
        (self.done_units * 100 / self.total_units) as u32
    }

    fn handle(&mut self, message: &OperationMessage) {
        match message {
            OperationMessage::Started { total_units } => {
                self.total_units = *total_units;
                eprintln!("Exporting {} files", total_units / UNITS_PER_FILE);
            }
            OperationMessage::Progress { delta } => {
                self.done_units += delta;

                // Throttle progress updates to avoid spam (max once per 200ms)
                if self.last_progress_update.elapsed().as_millis() < 200 {
                    return;
                }
                self.last_progress_update = Instant::now();
                eprint!(
                    "\rProgress: {} | {}",
                    Self::print_progress_bar(self.percent()),
                    Self::format_duration(self.start_time.elapsed())
                );
                let _ = io::stderr().flush();
            }
            OperationMessage::Description(text) => {
                if self.verbose {
                    eprintln!("\r{}", text);
                }
            }
            OperationMessage::ConvertProject(request) => {
                eprintln!("\rConverting project {}", request.project.display());
            }
            OperationMessage::Complete(_) => {
                if self.total_units > 0 {
                    eprintln!("\rProgress: {}", Self::print_progress_bar(self.percent()));
                }
            }
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

/// Parse arguments, run the command and exit with its code
fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let exit_code = match run_cli(&cli) {
        Ok(code) => exit_code_for(code),
        Err(msg) => {
            eprintln!("Error: {}", msg);
            2
        }
    };

    std::process::exit(exit_code);
}

/// 0 on success, 1 when canceled, 2 on failure.
fn exit_code_for(code: ResultCode) -> i32 {
    match code {
        ResultCode::Success => 0,
        ResultCode::UserCanceled => 1,
        _ => 2,
    }
}

/// Main CLI logic - separated for testability
fn run_cli(cli: &Cli) -> Result<ResultCode, String> {
    match &cli.command {
        Command::Export(args) => run_export(args, cli.verbose),
        Command::Verify(args) => run_verify(args),
    }
}

fn build_sources(args: &ExportArgs) -> Result<Vec<MediaSource>, String> {
    args.media
        .iter()
        .map(|media| {
            let stem = match &args.stem {
                Some(stem) => stem.clone(),
                None => media
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .map(Path::to_path_buf)
                    .ok_or_else(|| format!("Cannot tell the stem of {}; pass --stem", media.display()))?,
            };
            Ok(MediaSource::new(media.clone(), stem))
        })
        .collect()
}

fn load_defaults(args: &ExportArgs) -> Result<ExportSettings, String> {
    match &args.settings {
        Some(path) => ExportSettings::load(path).map_err(|e| e.to_string()),
        None => Ok(ExportSettings::default()),
    }
}

fn build_destination(args: &ExportArgs, defaults: &ExportSettings) -> Result<Destination, String> {
    if let Some(dst) = &args.dst {
        return Ok(Destination::Local { folder: dst.clone() });
    }

    let mut settings = match (&args.ftp_settings, &defaults.remote) {
        (Some(path), _) => RemoteSettings::load(path).map_err(|e| e.to_string())?,
        (None, Some(remote)) => remote.clone(),
        (None, None) => {
            let mut settings = RemoteSettings::default();
            settings
                .apply_overrides(|key| std::env::var(key).ok())
                .map_err(|e| e.to_string())?;
            settings
        }
    };

    // Flags win over the file and the environment
    if let Some(server) = &args.server {
        settings.server_name = server.clone();
    }
    if let Some(port) = args.port {
        settings.port = port;
    }
    if let Some(user) = &args.user {
        settings.user_name = user.clone();
    }
    if let Some(password) = &args.password {
        settings.password = password.clone();
    }
    if let Some(dir) = &args.remote_dir {
        settings.remote_directory = dir.clone();
    }
    if let Some(backend) = &args.backend {
        settings.backend = TransportBackend::from_str(backend).ok_or_else(|| {
            format!(
                "Invalid backend '{}'. Must be 'blocking' or 'event-loop'",
                backend
            )
        })?;
    }

    if settings.server_name.is_empty() {
        return Err("No destination given: pass --dst, --ftp-settings or --server".to_string());
    }
    Ok(Destination::Remote(settings))
}

fn run_export(args: &ExportArgs, verbose: bool) -> Result<ResultCode, String> {
    let defaults = load_defaults(args)?;
    let policy = match &args.overwrite {
        Some(policy) => OverwritePolicy::from_str(policy).ok_or_else(|| {
            format!(
                "Invalid overwrite policy '{}'. Must be 'ask', 'overwrite', or 'skip'",
                policy
            )
        })?,
        None => defaults.overwrite_policy,
    };
    let verify = match &args.verify {
        Some(method) => Some(VerifyOption::from_str(method).ok_or_else(|| {
            format!(
                "Invalid verification method '{}'. Must be 'size', 'content', or 'md5'",
                method
            )
        })?),
        None => None,
    };
    if let Some(project) = &args.project {
        if !project.is_file() {
            return Err(format!("Project file does not exist: {}", project.display()));
        }
    }

    let mut request = ExportRequest::new(build_sources(args)?, build_destination(args, &defaults)?);
    request.overwrite_policy = policy;
    request.verify = verify;
    request.project_file = args.project.clone();
    if request.verify.is_some() && !request.destination.is_local() {
        eprintln!("Note: verification only applies to local destinations");
    }

    eprintln!("Exporting to {}", request.destination.describe());
    info!(
        sources = request.sources.len(),
        destination = %request.destination.describe(),
        policy = %policy,
        "starting export"
    );

    let mut operation = create_export_operation(request)
        .map_err(|e| format!("Export setup failed: {}", e))?
        .with_prompt(StdinPrompt {
            assume_yes: args.yes,
        })
        .with_converter(TextPathRewriter);
    operation
        .start()
        .map_err(|e| format!("Export failed to start: {}", e))?;

    let mut progress = CliProgress::new(verbose);
    while !operation.pump(Duration::from_millis(100), |message| progress.handle(message)) {}

    let report = operation
        .report()
        .ok_or_else(|| "Export finished without a report".to_string())?;
    print_summary(&report, &operation.warning_message(), progress.start_time.elapsed());
    Ok(report.result)
}

fn print_summary(report: &ExportReport, warnings: &str, elapsed: Duration) {
    use engine::CopyAction;

    eprintln!();
    match report.result {
        ResultCode::Success => eprintln!("Export complete!"),
        ResultCode::UserCanceled => eprintln!("Export canceled."),
        code => eprintln!("Export failed: {}", code),
    }
    eprintln!(
        "Summary: {} copied, {} replaced, {} renamed, {} skipped",
        report.count_actions(CopyAction::Copied),
        report.count_actions(CopyAction::Replaced),
        report.count_actions(CopyAction::Renamed),
        report.count_actions(CopyAction::Ignored)
    );
    eprintln!(
        "Transferred: {} of {} paths",
        report.actions.iter().filter(|(_, action)| action.is_transferred()).count(),
        report.actions.len()
    );
    let duration = report
        .finished_at
        .and_then(|finished| (finished - report.started_at).to_std().ok())
        .unwrap_or(elapsed);
    eprintln!("Elapsed: {}", CliProgress::format_duration(duration));
    if let Some(finished) = report.finished_at {
        eprintln!(
            "Finished: {}",
            finished.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S")
        );
    }
    debug!(media = report.exported_media().count(), "exported media");

    if !report.renames.is_empty() {
        eprintln!();
        eprintln!("Renamed:");
        for rename in &report.renames {
            eprintln!("  {} -> {}", rename.original, rename.renamed);
        }
    }
    if !warnings.is_empty() {
        eprintln!();
        eprintln!("Warnings:");
        for line in warnings.lines() {
            eprintln!("  {}", line);
        }
    }
    if !report.errors.is_empty() {
        eprintln!();
        eprintln!("Errors:");
        for line in report.error_message().lines() {
            eprintln!("  {}", line);
        }
    }
}

fn run_verify(args: &VerifyArgs) -> Result<ResultCode, String> {
    let method = VerifyOption::from_str(&args.method).ok_or_else(|| {
        format!(
            "Invalid verification method '{}'. Must be 'size', 'content', or 'md5'",
            args.method
        )
    })?;

    let (result, detail) = verify_files(method, &args.src, &args.dst);
    println!("{}", detail);
    if let Ok(metadata) = std::fs::metadata(&args.src) {
        println!("Source size: {}", CliProgress::format_bytes(metadata.len()));
    }

    if result.is_equal() {
        Ok(ResultCode::Success)
    } else {
        Err(format!("Verification failed ({}) using {}", result, method))
    }
}

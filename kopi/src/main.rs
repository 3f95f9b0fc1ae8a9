mod output;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kopi_core::config::{LOG_LEVEL_ENV, password_from_env};
use kopi_core::{
    BlockStore, CancellationToken, Catalog, DEFAULT_MAX_BLOCK_SIZE, DiffStage, FileRecord,
    JsonLinesSink, KdfParams, ManifestReadStage, ManifestWriteStage, ProcessOptions, RecordReader,
    RestoreStage, ScanOptions, ScanStage, SecurityContext, Stage, StoreStage, list_manifests,
};
use output::{
    DiffOutput, ManifestListOutput, ManifestReadOutput, ManifestWriteOutput, OutputWriter,
    RestoreOutput, ScanOutput, StoreOutput, human_bytes,
};
use secrecy::SecretString;
use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Kopi - a deduplicating, content-addressed backup tool
///
/// Commands exchange newline-delimited JSON file records on stdin and stdout,
/// e.g. `kopi index --init src | kopi store backup | kopi manifest write backup`.
#[derive(Parser)]
#[command(name = "kopi")]
#[command(about = "Deduplicating, content-addressed backups", long_about = None)]
#[command(version)]
struct Cli {
    /// Print run summaries as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index a directory tree, writing records to stdout
    Index {
        /// Root of the tree to index
        path: PathBuf,

        /// Index subdirectories
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        recursive: bool,

        /// Initial index: mark every file as modified
        #[arg(long)]
        init: bool,

        /// Honor .gitignore, .ignore and hidden-file rules
        #[arg(long)]
        respect_ignore: bool,
    },

    /// Mark changes in CURRENT relative to BASELINE, writing CURRENT to stdout
    Diff {
        /// Previous index
        baseline: PathBuf,

        /// New index
        current: PathBuf,
    },

    /// Store modified files read from stdin, writing updated records to stdout
    Store {
        /// Backup directory
        output_dir: PathBuf,

        /// Split files into blocks of at most this many bytes
        #[arg(long, default_value_t = DEFAULT_MAX_BLOCK_SIZE)]
        max_block_size: u64,

        /// Encrypt blocks with a key derived from KOPI_PASSWORD
        #[arg(long)]
        encrypt: bool,

        /// Seconds between progress reports (0 disables)
        #[arg(long, default_value_t = 10)]
        progress_interval: u64,
    },

    /// Restore records read from stdin
    Restore {
        /// Backup directory
        input_dir: PathBuf,

        /// Destination directory
        output_dir: PathBuf,

        /// Decrypt blocks with a key derived from KOPI_PASSWORD
        #[arg(long)]
        decrypt: bool,

        /// Verify every block without writing anything
        #[arg(long)]
        dry_run: bool,

        /// Seconds between progress reports (0 disables)
        #[arg(long, default_value_t = 10)]
        progress_interval: u64,
    },

    /// Manage manifests
    #[command(subcommand)]
    Manifest(ManifestCommands),
}

#[derive(Subcommand)]
enum ManifestCommands {
    /// Save records read from stdin as a new manifest
    Write {
        /// Backup directory
        backup_dir: PathBuf,

        /// Encrypt the manifest with a key derived from KOPI_PASSWORD
        #[arg(long)]
        encrypt: bool,

        /// Manifest description, e.g. "monthly backup 2019/1"
        #[arg(long, default_value = "")]
        description: String,
    },

    /// Replay a manifest's records to stdout
    Read {
        /// Backup directory
        backup_dir: PathBuf,

        /// Manifest ID, e.g. 2019/01/31/1548892800.manifest
        id: String,

        /// Decrypt the manifest with a key derived from KOPI_PASSWORD
        #[arg(long)]
        decrypt: bool,
    },

    /// List manifest IDs, oldest first
    List {
        /// Backup directory
        backup_dir: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging();

    let output = OutputWriter::new(cli.json);
    match run(cli.command, &output) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            let code = result_code(&error);
            output.write_error(&error, code);
            ExitCode::from(code)
        }
    }
}

fn run(command: Commands, output: &OutputWriter) -> Result<()> {
    match command {
        Commands::Index {
            path,
            recursive,
            init,
            respect_ignore,
        } => {
            let options = ScanOptions {
                recursive,
                initial: init,
                respect_ignore_files: respect_ignore,
            };
            cmd_index(&path, options, output)
        }
        Commands::Diff { baseline, current } => cmd_diff(&baseline, &current, output),
        Commands::Store {
            output_dir,
            max_block_size,
            encrypt,
            progress_interval,
        } => cmd_store(&output_dir, max_block_size, encrypt, progress_interval, output),
        Commands::Restore {
            input_dir,
            output_dir,
            decrypt,
            dry_run,
            progress_interval,
        } => cmd_restore(
            &input_dir,
            &output_dir,
            decrypt,
            dry_run,
            progress_interval,
            output,
        ),
        Commands::Manifest(manifest_cmd) => match manifest_cmd {
            ManifestCommands::Write {
                backup_dir,
                encrypt,
                description,
            } => cmd_manifest_write(&backup_dir, encrypt, &description, output),
            ManifestCommands::Read {
                backup_dir,
                id,
                decrypt,
            } => cmd_manifest_read(&backup_dir, &id, decrypt, output),
            ManifestCommands::List { backup_dir } => cmd_manifest_list(&backup_dir, output),
        },
    }
}

/// Install the stderr subscriber. `KOPI_LOG_LEVEL` takes a level name or any
/// filter directive; the default is `info`.
fn init_logging() {
    let directive = log_directive(std::env::var(LOG_LEVEL_ENV).ok().as_deref());
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn log_directive(value: Option<&str>) -> String {
    match value.map(str::trim) {
        None | Some("") => "info".to_string(),
        Some("FATAL") | Some("PANIC") => "error".to_string(),
        Some(other) => other.to_lowercase(),
    }
}

fn result_code(error: &anyhow::Error) -> u8 {
    match error.downcast_ref::<kopi_core::Error>() {
        Some(kopi_core::Error::Cancelled) => 130,
        Some(kopi_core::Error::Config { .. }) => 2,
        _ => 1,
    }
}

/// Cancellation token tripped by SIGINT or SIGTERM.
fn install_cancel_handler() -> Result<CancellationToken> {
    let cancel = CancellationToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        tracing::warn!("received interrupt, stopping after the current file");
        handler_token.cancel();
    })
    .context("Failed to install signal handler")?;
    Ok(cancel)
}

fn process_options(progress_interval: u64) -> Result<ProcessOptions> {
    Ok(ProcessOptions {
        progress_interval: (progress_interval > 0).then(|| Duration::from_secs(progress_interval)),
        cancel: install_cancel_handler()?,
    })
}

/// Read the whole record stream from stdin, refusing an interactive terminal.
fn read_stdin_records() -> Result<Vec<FileRecord>> {
    if atty::is(atty::Stream::Stdin) {
        anyhow::bail!("expected a record stream on stdin, e.g. `kopi index <path> | kopi ...`");
    }
    RecordReader::new(io::stdin().lock())
        .read_all()
        .context("Failed to read records from stdin")
}

fn stdout_sink() -> JsonLinesSink<BufWriter<io::StdoutLock<'static>>> {
    JsonLinesSink::new(BufWriter::new(io::stdout().lock()))
}

fn password(required: bool) -> Result<Option<SecretString>> {
    Ok(password_from_env(required)?)
}

fn open_security(dir: &Path, decrypt: bool) -> Result<SecurityContext> {
    let password = password(decrypt)?;
    SecurityContext::open(dir, password.as_ref(), &KdfParams::default())
        .with_context(|| format!("Failed to open security context in {}", dir.display()))
}

fn create_security(dir: &Path, encrypt: bool) -> Result<SecurityContext> {
    let password = password(encrypt)?;
    SecurityContext::create_or_open(dir, password.as_ref(), &KdfParams::default())
        .with_context(|| format!("Failed to create security context in {}", dir.display()))
}

fn cmd_index(path: &Path, options: ScanOptions, output: &OutputWriter) -> Result<()> {
    let process = process_options(0)?;
    let mut stage = ScanStage::new(path, options, process, stdout_sink())?;
    stage
        .execute()
        .with_context(|| format!("Failed to index {}", path.display()))?;

    let stats = stage.stats().clone();
    output.summary(
        &ScanOutput {
            success: true,
            result_code: 0,
            stats: stats.clone(),
        },
        || {
            format!(
                "Indexed {} files and {} directories ({})\n",
                stats.files,
                stats.directories,
                human_bytes(stats.bytes)
            )
        },
    )
}

fn load_catalog(path: &Path) -> Result<Catalog> {
    tracing::debug!(path = %path.display(), "loading index");
    let file =
        File::open(path).with_context(|| format!("Failed to open index {}", path.display()))?;
    let catalog = Catalog::read_from(BufReader::new(file))
        .with_context(|| format!("Failed to load index {}", path.display()))?;
    tracing::info!(path = %path.display(), size = catalog.len(), "loaded index");
    Ok(catalog)
}

fn cmd_diff(baseline: &Path, current: &Path, output: &OutputWriter) -> Result<()> {
    tracing::info!(
        index_a = %baseline.display(),
        index_b = %current.display(),
        "diffing indices"
    );
    let baseline = load_catalog(baseline)?;
    let current = load_catalog(current)?;

    let mut stage = DiffStage::new(baseline, current, stdout_sink());
    stage.execute().context("Failed to write diffed index")?;

    let stats = stage.stats().clone();
    output.summary(
        &DiffOutput {
            success: true,
            result_code: 0,
            stats: stats.clone(),
        },
        || format!("{} of {} files modified\n", stats.modified, stats.total),
    )
}

fn cmd_store(
    output_dir: &Path,
    max_block_size: u64,
    encrypt: bool,
    progress_interval: u64,
    output: &OutputWriter,
) -> Result<()> {
    kopi_core::config::require_path("output directory", output_dir)?;
    let records = read_stdin_records()?;
    let security = create_security(output_dir, encrypt)?;
    let store = BlockStore::new(output_dir, security).with_max_block_size(max_block_size)?;

    let process = process_options(progress_interval)?;
    let mut stage = StoreStage::new(store, records, process, stdout_sink())?;
    stage
        .execute()
        .with_context(|| format!("Failed to store files in {}", output_dir.display()))?;

    let stats = stage.stats().clone();
    output.summary(
        &StoreOutput {
            success: true,
            result_code: 0,
            stats: stats.clone(),
        },
        || {
            format!(
                "Stored {} files ({} read, {} written): {} new blocks, {} reused, {} skipped\n",
                stats.files_stored,
                human_bytes(stats.bytes_read),
                human_bytes(stats.bytes_written),
                stats.blocks_written,
                stats.blocks_reused,
                stats.files_skipped
            )
        },
    )
}

fn cmd_restore(
    input_dir: &Path,
    output_dir: &Path,
    decrypt: bool,
    dry_run: bool,
    progress_interval: u64,
    output: &OutputWriter,
) -> Result<()> {
    kopi_core::config::require_path("input directory", input_dir)?;
    let records = read_stdin_records()?;
    let security = open_security(input_dir, decrypt)?;
    let store = BlockStore::new(input_dir, security);

    let process = process_options(progress_interval)?;
    let mut stage = RestoreStage::new(store, output_dir, dry_run, records, process)?;
    stage
        .execute()
        .with_context(|| format!("Failed to restore to {}", output_dir.display()))?;

    let stats = stage.stats().clone();
    output.summary(
        &RestoreOutput {
            success: true,
            result_code: 0,
            stats: stats.clone(),
        },
        || {
            let verb = if stats.dry_run { "Verified" } else { "Restored" };
            format!(
                "{} {} files and {} directories ({} blocks, {})\n",
                verb,
                stats.files,
                stats.directories,
                stats.blocks_verified,
                human_bytes(stats.bytes_restored)
            )
        },
    )
}

fn cmd_manifest_write(
    backup_dir: &Path,
    encrypt: bool,
    description: &str,
    output: &OutputWriter,
) -> Result<()> {
    kopi_core::config::require_path("output directory", backup_dir)?;
    let records = read_stdin_records()?;
    let security = create_security(backup_dir, encrypt)?;

    let process = process_options(0)?;
    let mut stage = ManifestWriteStage::new(backup_dir, security, description, records, process)?;
    stage.execute().context("Failed to write manifest")?;

    let stats = stage
        .stats()
        .cloned()
        .context("Manifest stage finished without writing a manifest")?;
    output.summary(
        &ManifestWriteOutput {
            success: true,
            result_code: 0,
            stats: stats.clone(),
        },
        || {
            format!(
                "Created manifest {} ({} files, {})\n",
                stats.id,
                stats.files,
                human_bytes(stats.bytes)
            )
        },
    )
}

fn cmd_manifest_read(
    backup_dir: &Path,
    id: &str,
    decrypt: bool,
    output: &OutputWriter,
) -> Result<()> {
    let security = open_security(backup_dir, decrypt)?;
    let mut stage = ManifestReadStage::new(backup_dir, security, id, stdout_sink())?;
    stage
        .execute()
        .with_context(|| format!("Failed to read manifest {}", id))?;

    let header = stage
        .header()
        .cloned()
        .context("Manifest stage finished without a header")?;
    let stats = stage.stats().clone();
    output.summary(
        &ManifestReadOutput {
            success: true,
            result_code: 0,
            date: header.date,
            description: header.description.clone(),
            stats: stats.clone(),
        },
        || {
            format!(
                "Manifest {} from {} ({:?}): {} files\n",
                header.id,
                header.date.format("%Y-%m-%d %H:%M:%S UTC"),
                header.description,
                stats.files
            )
        },
    )
}

fn cmd_manifest_list(backup_dir: &Path, output: &OutputWriter) -> Result<()> {
    let manifests = list_manifests(backup_dir)
        .with_context(|| format!("Failed to list manifests in {}", backup_dir.display()))?;

    output.listing(
        &ManifestListOutput {
            success: true,
            result_code: 0,
            manifests: manifests.clone(),
        },
        || {
            manifests
                .iter()
                .map(|id| format!("{}\n", id))
                .collect::<String>()
        },
    )
}

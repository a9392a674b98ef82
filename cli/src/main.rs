use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use dmgtweak_core::{
    Access, AttachRequest, ConversionPipeline, ConversionRequest, CreateMode, CreationRequest, Direction,
    EventStatus, Filesystem, Passphrase, PipelineOutcome, ProgressEvent, Settings,
};
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dmgtweak")]
#[command(about = "Create, convert and mount macOS disk images", long_about = None)]
struct Cli {
    /// Settings file (defaults to the per-user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Show debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum FsArg {
    Apfs,
    #[value(name = "hfs+j")]
    HfsPlus,
}

#[derive(Clone, Copy, ValueEnum)]
enum AccessArg {
    ReadOnly,
    ReadWrite,
}

#[derive(Clone, Copy, ValueEnum)]
enum TargetArg {
    /// Compressed, read-only
    ReadOnly,
    /// Writable, enlarged afterwards
    Writable,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new image from a folder or at a fixed size
    Create {
        /// Output image
        destination: PathBuf,
        /// Folder whose contents become the volume
        #[arg(long, conflicts_with = "size")]
        from_folder: Option<PathBuf>,
        /// Size of an empty image (e.g. 200m, 1g)
        #[arg(long, required_unless_present = "from_folder")]
        size: Option<String>,
        #[arg(long)]
        volume_name: String,
        #[arg(long, value_enum, default_value = "apfs")]
        fs: FsArg,
        #[arg(long, value_enum, default_value = "read-write")]
        access: AccessArg,
        /// Encrypt with a passphrase entered on the terminal
        #[arg(long)]
        encrypt: bool,
    },
    /// Convert between writable and compressed read-only images
    Convert {
        source: PathBuf,
        destination: PathBuf,
        #[arg(long, value_enum)]
        to: TargetArg,
        /// Give the result the icon of the application inside it
        #[arg(long)]
        app_icon: bool,
        /// Source is encrypted; ask for its passphrase
        #[arg(long)]
        encrypted: bool,
    },
    /// Attach an image
    Attach {
        image: PathBuf,
        #[arg(long)]
        read_only: bool,
        /// Reveal the volume in Finder once mounted
        #[arg(long)]
        reveal: bool,
        #[arg(long)]
        encrypted: bool,
    },
    /// Detach every mount of an image
    Detach { image: PathBuf },
    /// List attached images
    List,
    /// Check that the required tools are installed
    Doctor,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_env("DMGTWEAK_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn load_settings(path: Option<&Path>) -> anyhow::Result<Settings> {
    match path {
        Some(path) => Settings::load(path).with_context(|| format!("reading settings from {}", path.display())),
        None => Settings::load_default().context("reading settings"),
    }
}

/// Read a passphrase from the terminal without echoing it.
fn prompt_passphrase(prompt: &str) -> anyhow::Result<String> {
    if !io::stdin().is_terminal() {
        bail!("Invalid request: a passphrase can only be entered on a terminal");
    }
    rpassword::prompt_password(prompt).context("failed to read passphrase")
}

/// Ask for a new passphrase twice; the two entries must match.
fn read_new_passphrase() -> anyhow::Result<Passphrase> {
    let first = prompt_passphrase("Passphrase: ")?;
    if first.is_empty() {
        bail!("Invalid request: passphrase is empty");
    }
    let second = prompt_passphrase("Confirm passphrase: ")?;
    confirm_passphrase(first, &second)
}

fn confirm_passphrase(first: String, second: &str) -> anyhow::Result<Passphrase> {
    if first.is_empty() {
        bail!("Invalid request: passphrase is empty");
    }
    if first != second {
        bail!("Invalid request: passphrases do not match");
    }
    Ok(Passphrase::new(first))
}

fn read_passphrase(wanted: bool) -> anyhow::Result<Passphrase> {
    if wanted {
        Ok(Passphrase::new(prompt_passphrase("Passphrase: ")?))
    } else {
        Ok(Passphrase::default())
    }
}

fn print_event(event: &ProgressEvent) {
    match event.status {
        EventStatus::Warning => eprintln!("warning: {}", event.message),
        EventStatus::Failed => eprintln!("{}", event.message),
        EventStatus::Command | EventStatus::Output => {
            tracing::debug!(stage = ?event.stage, "{}", event.message)
        }
        _ => println!("{}", event.message),
    }
}

async fn follow(
    (mut events, handle): (UnboundedReceiver<ProgressEvent>, JoinHandle<PipelineOutcome>),
) -> anyhow::Result<()> {
    while let Some(event) = events.recv().await {
        print_event(&event);
    }
    let outcome = handle.await.context("pipeline task failed")?;
    match outcome.error {
        Some(error) => Err(anyhow!(error)),
        None => Ok(()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let settings = load_settings(cli.config.as_deref())?;
    let pipeline = Arc::new(ConversionPipeline::system(settings));

    match cli.command {
        Commands::Create {
            destination,
            from_folder,
            size,
            volume_name,
            fs,
            access,
            encrypt,
        } => {
            let passphrase = if encrypt { read_new_passphrase()? } else { Passphrase::default() };
            let request = CreationRequest {
                mode: if from_folder.is_some() { CreateMode::FromFolder } else { CreateMode::Empty },
                source_folder: from_folder,
                size: size.unwrap_or_default(),
                volume_name,
                filesystem: match fs {
                    FsArg::Apfs => Filesystem::Apfs,
                    FsArg::HfsPlus => Filesystem::HfsPlusJournaled,
                },
                access: match access {
                    AccessArg::ReadOnly => Access::ReadOnly,
                    AccessArg::ReadWrite => Access::ReadWrite,
                },
                destination,
                passphrase,
            };
            follow(pipeline.spawn_create(request)).await?;
        }
        Commands::Convert {
            source,
            destination,
            to,
            app_icon,
            encrypted,
        } => {
            let request = ConversionRequest {
                source,
                destination,
                direction: match to {
                    TargetArg::ReadOnly => Direction::WritableToReadOnly,
                    TargetArg::Writable => Direction::ReadOnlyToWritable,
                },
                embed_app_icon: app_icon,
                passphrase: read_passphrase(encrypted)?,
            };
            follow(pipeline.spawn_convert(request)).await?;
        }
        Commands::Attach {
            image,
            read_only,
            reveal,
            encrypted,
        } => {
            let request = AttachRequest {
                image,
                read_only,
                reveal,
                passphrase: read_passphrase(encrypted)?,
            };
            follow(pipeline.spawn_attach(request)).await?;
        }
        Commands::Detach { image } => {
            let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<ProgressEvent>();
            let task = {
                let pipeline = pipeline.clone();
                tokio::spawn(async move { pipeline.detach(&image, &tx).await })
            };
            follow((rx, task)).await?;
        }
        Commands::List => {
            let images = pipeline.list_mounted_images().await?;
            if images.is_empty() {
                println!("No images attached.");
            }
            for image in images {
                println!("{}", image.image_path.display());
                for device in &image.devices {
                    println!("  Device: {}", device);
                }
                for mount in &image.mount_points {
                    println!("  Mounted at: {}", mount.display());
                }
            }
        }
        Commands::Doctor => {
            let tools = &pipeline.settings().tools;
            for (name, path, found) in tools.availability() {
                println!("  {:<12} {:<32} {}", name, path.display(), if found { "ok" } else { "MISSING" });
            }
            let missing = tools.missing();
            if !missing.is_empty() {
                bail!("missing tools: {}", missing.join(", "));
            }
            println!("\nAll tools found.");
        }
    }

    Ok(())
}

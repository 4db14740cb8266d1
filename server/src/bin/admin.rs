use {
    anyhow::{Result, bail},
    clap::{Parser, Subcommand},
    imgvault_protocol::ImageId,
    imgvault_server::{
        Config,
        store::{ImageStore, RecordStore},
        util::default_config_path,
    },
    std::path::PathBuf,
};

/// Maintenance commands. The server must be stopped while they run.
#[derive(Debug, Parser)]
#[clap(version, about)]
pub struct Cli {
    #[clap(long)]
    pub config: Option<PathBuf>,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, PartialEq, Eq)]
pub enum Command {
    /// List stored images, newest first.
    List,
    /// Delete an image by id.
    Delete { id: ImageId },
    /// Cross-check metadata against blob files.
    CheckIntegrity {
        /// Remove unreadable records and orphaned blobs.
        #[clap(long)]
        fix: bool,
    },
    /// Show record count and free space.
    Status,
}

#[expect(clippy::print_stdout, reason = "command line output")]
fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = match cli.config {
        Some(path) => path,
        None => default_config_path()?,
    };
    let config = Config::parse(&config_path)?;
    let store = ImageStore::open(&config.storage_path)?;
    match cli.command {
        Command::List => {
            let images = store.list()?;
            if images.is_empty() {
                println!("No stored images.");
            }
            for image in images {
                println!(
                    "{}  {}  {:>10}  {}  {}",
                    image.id,
                    image.upload_date.format("%Y-%m-%d %H:%M:%S"),
                    image.size,
                    image.mime_type,
                    image.original_name,
                );
            }
        }
        Command::Delete { id } => {
            store.delete(&id)?;
            println!("Deleted {id}.");
        }
        Command::CheckIntegrity { fix } => {
            let report = store.check_integrity(fix)?;
            println!("Records: {}, blobs: {}", report.records, report.blobs);
            for id in &report.missing_blobs {
                println!("missing blob: {id}");
            }
            for id in &report.corrupted {
                println!("corrupted: {id}");
            }
            for id in &report.orphaned_blobs {
                println!("orphaned blob: {id}");
            }
            if report.invalid_keys > 0 {
                println!("invalid metadata keys: {}", report.invalid_keys);
            }
            if fix {
                println!("Removed {} entries.", report.removed);
            } else if !report.is_clean() {
                bail!("integrity check found issues, rerun with --fix to remove them");
            }
            if report.is_clean() {
                println!("No issues found.");
            }
        }
        Command::Status => {
            let status = store.status()?;
            println!("Images: {}", status.image_count);
            println!(
                "Available space: {}",
                byte_unit::Byte::from_u64(status.available_space)
                    .get_appropriate_unit(byte_unit::UnitType::Binary)
            );
        }
    }
    store.flush()?;
    Ok(())
}

//! warp-lun - attach block devices to in-memory images and drive them

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;
use warp_lun::{
    Command, CommandKind, CommandOutcome, Device, DeviceRegistry, ImageTransport, LunConfig,
    MemoryImage, ScatterList, UnmapDescriptor, init_logging,
};

#[derive(Parser)]
#[command(name = "warp-lun")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "warp-lun.toml")]
    config: PathBuf,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Attach every configured device and print what it advertises
    Inspect,
    /// Run a write, read, compare-and-write and unmap against each device
    Exercise {
        /// Only this device
        #[arg(short, long)]
        device: Option<String>,
        /// First LBA to use
        #[arg(long, default_value = "0")]
        lba: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = LunConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.log.level = config.log.level.raised_by(cli.verbose);
    init_logging(&config.log)?;

    let registry = attach_all(&config)?;

    match cli.command {
        Commands::Inspect => inspect(&registry),
        Commands::Exercise { device, lba } => {
            let devices: Vec<_> = match device {
                Some(name) => vec![
                    registry
                        .get_by_name(&name)
                        .with_context(|| format!("no device named {name}"))?,
                ],
                None => registry
                    .list()
                    .iter()
                    .filter_map(|d| registry.get(d.id))
                    .collect(),
            };
            for device in devices {
                exercise(&device, lba).await?;
            }
            Ok(())
        }
    }
}

fn attach_all(config: &LunConfig) -> Result<DeviceRegistry> {
    let registry = DeviceRegistry::new();
    for device in &config.devices {
        let Some(image) = config.image(&device.image) else {
            bail!("device {} references unknown image {}", device.name, device.image);
        };
        let transport: Arc<dyn ImageTransport> = Arc::new(MemoryImage::from_config(image)?);
        registry.attach(device.clone(), transport)?;
    }
    info!("Attached {} device(s)", registry.len());
    Ok(registry)
}

fn inspect(registry: &DeviceRegistry) -> Result<()> {
    for entry in registry.list() {
        let Some(device) = registry.get(entry.id) else {
            continue;
        };
        let caps = device.capabilities();

        println!("{} ({})", entry.name, entry.id);
        println!("{}", "-".repeat(60));
        println!("  Image:              {}", entry.image);
        println!("  Size:               {}", entry.size_human());
        println!("  Read-only:          {}", entry.read_only);
        println!("  Parameters:         {}", device.config().show_params());
        println!("  Logical block:      {}", caps.logical_block_size);
        println!(
            "  Physical block:     {} (lbppbe {})",
            caps.physical_block_size, caps.lbppbe
        );
        println!("  Capacity:           {} blocks", caps.capacity_blocks);
        println!("  Max write same:     {} blocks", caps.max_write_same_len);
        if caps.discard_supported {
            println!(
                "  Unmap:              max {} blocks, granularity {}, alignment {}",
                caps.max_unmap_lba_count, caps.unmap_granularity, caps.unmap_granularity_alignment
            );
        } else {
            println!("  Unmap:              unsupported");
        }
        println!(
            "  I/O hints:          min {} opt {} alignment {} lbas",
            caps.io_min, caps.io_opt, caps.alignment_offset_lbas
        );
        println!("  Queue depth:        {}", caps.queue_depth);
        println!();
    }
    Ok(())
}

async fn exercise(device: &Device, lba: u64) -> Result<()> {
    let block_size = device.geometry().block_size() as usize;
    let pattern: Vec<u8> = (0..block_size).map(|i| (i % 251) as u8).collect();
    let replacement = vec![0xA5u8; block_size];

    println!("{}", device.name());

    let (cmd, rx) = Command::channel(CommandKind::Write, lba, 1);
    let _ = device
        .execute(cmd.with_data(ScatterList::from_slice(&pattern)))
        .await;
    report(rx.await?);

    let (cmd, rx) = Command::channel(CommandKind::Read, lba, 1);
    let _ = device.execute(cmd).await;
    let outcome = rx.await?;
    let matches = outcome
        .data
        .as_ref()
        .is_some_and(|data| data.to_bytes()[..] == pattern[..]);
    report(outcome);
    println!("    data matches: {matches}");

    let (cmd, rx) = Command::channel(CommandKind::CompareAndWrite, lba, 1);
    let cmd = cmd
        .with_compare(ScatterList::from_slice(&pattern))
        .with_data(ScatterList::from_slice(&replacement));
    let _ = device.execute(cmd).await;
    report(rx.await?);

    let (cmd, rx) = Command::channel(CommandKind::CompareAndWrite, lba, 1);
    let cmd = cmd
        .with_compare(ScatterList::from_slice(&pattern))
        .with_data(ScatterList::from_slice(&replacement));
    let _ = device.execute(cmd).await;
    report(rx.await?);

    let (cmd, rx) = Command::channel(CommandKind::Unmap, 0, 0);
    let _ = device
        .execute(cmd.with_descriptors(vec![UnmapDescriptor::new(lba, 1)]))
        .await;
    report(rx.await?);

    let (cmd, rx) = Command::channel(CommandKind::SyncCache, 0, 0);
    let _ = device.execute(cmd).await;
    report(rx.await?);

    let stats = device.stats();
    println!(
        "  stats: {} reads, {} writes, {} compare-and-writes ({} miscompares), {} errors",
        stats.read_ops,
        stats.write_ops,
        stats.compare_and_write_ops,
        stats.miscompares,
        stats.errors
    );
    println!();
    Ok(())
}

fn report(outcome: CommandOutcome) {
    match &outcome.status {
        Ok(()) => println!("  {:<20} GOOD", outcome.kind.to_string()),
        Err(failure) => {
            let sense = outcome
                .sense()
                .map(|s| format!(" [{:?} {:#04x}/{:#04x}]", s.key, s.asc, s.ascq))
                .unwrap_or_default();
            println!(
                "  {:<20} {:?}: {}{}",
                outcome.kind.to_string(),
                outcome.scsi_status(),
                failure,
                sense
            );
        }
    }
}

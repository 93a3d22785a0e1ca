//! mvirt-attach: reconcile VM disk attachments from the command line.
//!
//! Runs against a simulated engine whose contents live in a JSON state
//! file, so passes can be exercised without a hypervisor:
//! - `add-vm`, `add-disk`, `attach` populate the engine (out of band)
//! - `apply` runs a reconciliation pass for a manifest
//! - `read`, `import`, `destroy` refresh, adopt and tear down

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mvirt_attach::{
    AttachmentStore, AttachmentsReconciler, AttachmentsStatus, DiskInterface, DiskParams,
    ImageFormat, Manifest, MemoryEngine, Reconciler, RetryStrategy,
};

/// mvirt disk attachment reconciler
#[derive(Parser, Debug)]
#[command(name = "mvirt-attach", version, about)]
struct Args {
    /// Simulated engine state file
    #[arg(long, env = "MVIRT_ATTACH_STATE", default_value = "mvirt-attach-engine.json")]
    state: PathBuf,

    /// Attempts per engine call
    #[arg(long, default_value = "3")]
    retries: u32,

    /// Delay between attempts in milliseconds
    #[arg(long, default_value = "1000")]
    retry_delay_ms: u64,

    /// Timeout per attempt in seconds
    #[arg(long, default_value = "60")]
    timeout_secs: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register a VM in the simulated engine
    AddVm {
        /// VM ID (generated if omitted)
        #[arg(long)]
        id: Option<String>,
    },

    /// Create a disk in the simulated engine
    AddDisk {
        /// Disk ID (generated if omitted)
        #[arg(long)]
        id: Option<String>,

        /// Disk alias
        #[arg(long)]
        alias: Option<String>,

        /// Image format: raw or cow
        #[arg(long, default_value = "raw")]
        format: ImageFormat,

        /// Size in bytes
        #[arg(long)]
        size: u64,

        /// Allow attaching to more than one VM
        #[arg(long)]
        shared: bool,
    },

    /// Attach a disk directly, bypassing reconciliation
    Attach {
        #[arg(long)]
        vm: String,

        #[arg(long)]
        disk: String,

        /// ide, sata, spapr_vscsi, virtio or virtio_scsi
        #[arg(long)]
        interface: DiskInterface,
    },

    /// List live attachments of a VM
    List {
        /// VM ID
        vm_id: String,
    },

    /// Reconcile a VM's attachments with a manifest
    Apply {
        /// Manifest file
        manifest: PathBuf,

        /// Write the read-back state into the manifest file
        #[arg(long)]
        write: bool,
    },

    /// Refresh a manifest from the engine
    Read {
        /// Manifest file
        manifest: PathBuf,

        /// Write the observed state into the manifest file
        #[arg(long)]
        write: bool,
    },

    /// Produce a manifest from a VM's live attachments
    Import {
        /// VM ID
        vm_id: String,
    },

    /// Detach every attachment recorded in a manifest
    Destroy {
        /// Manifest file
        manifest: PathBuf,

        /// Write the remaining state into the manifest file
        #[arg(long)]
        write: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mvirt_attach=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    let engine = Arc::new(
        MemoryEngine::load(&args.state)
            .await
            .with_context(|| format!("Failed to load engine state {}", args.state.display()))?,
    );

    // Ctrl-C cancels the in-flight engine call
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Received SIGINT, cancelling");
            let _ = cancel_tx.send(true);
        }
    });

    let retry = RetryStrategy::new(args.retries, Duration::from_millis(args.retry_delay_ms))
        .with_timeout(Duration::from_secs(args.timeout_secs))
        .with_cancel(cancel_rx);

    let result = run(args.command, &engine, &retry).await;

    // Committed operations stay committed, even on failure.
    engine
        .save(&args.state)
        .await
        .with_context(|| format!("Failed to save engine state {}", args.state.display()))?;

    result
}

async fn run(command: Commands, engine: &Arc<MemoryEngine>, retry: &RetryStrategy) -> Result<()> {
    let reconciler = AttachmentsReconciler::new(Arc::clone(engine));

    match command {
        Commands::AddVm { id } => {
            let id = engine.add_vm(id).await;
            println!("{}", id);
        }
        Commands::AddDisk {
            id,
            alias,
            format,
            size,
            shared,
        } => {
            let mut params = DiskParams::new(size).format(format).shared(shared);
            if let Some(id) = id {
                params = params.id(id);
            }
            if let Some(alias) = alias {
                params = params.alias(alias);
            }
            let disk = engine.add_disk(params).await;
            println!("{}", disk.id);
        }
        Commands::Attach {
            vm,
            disk,
            interface,
        } => {
            let attachment = engine
                .attach(&vm, &disk, interface)
                .await
                .context("Failed to attach disk")?;
            println!("{}", attachment.id);
        }
        Commands::List { vm_id } => {
            let attachments = engine
                .list(&vm_id, retry)
                .await
                .with_context(|| format!("Failed to list disk attachments of VM {}", vm_id))?;
            println!("{}", serde_json::to_string_pretty(&attachments)?);
        }
        Commands::Apply { manifest, write } => {
            let declared = read_manifest(&manifest).await?;
            let spec = declared.to_spec()?;
            let status = reconciler.reconcile(&spec, retry).await?;
            emit(&declared.with_status(&status), &manifest, write).await?;
            report(&status)?;
        }
        Commands::Read { manifest, write } => {
            let declared = read_manifest(&manifest).await?;
            let status = reconciler.read(&declared.to_status()?, retry).await?;
            for live in declared.drift(&status) {
                warn!(
                    "Disk {} is attached to VM {} via {} ({}), which is not declared",
                    live.disk_id, status.vm_id, live.disk_interface, live.id
                );
            }
            emit(&declared.with_status(&status), &manifest, write).await?;
        }
        Commands::Import { vm_id } => {
            mvirt_attach::manifest::validate_uuid("vm_id", &vm_id)?;
            let status = reconciler.import(&vm_id, retry).await?;
            println!("{}", Manifest::from_status(&status).to_json()?);
        }
        Commands::Destroy { manifest, write } => {
            let declared = read_manifest(&manifest).await?;
            let status = reconciler.finalize(&declared.to_status()?, retry).await?;
            emit(&declared.with_status(&status), &manifest, write).await?;
            report(&status)?;
        }
    }

    Ok(())
}

async fn read_manifest(path: &Path) -> Result<Manifest> {
    let json = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read manifest {}", path.display()))?;
    Ok(Manifest::from_json(&json)?)
}

async fn emit(manifest: &Manifest, path: &Path, write: bool) -> Result<()> {
    let json = manifest.to_json()?;
    if write {
        tokio::fs::write(path, &json)
            .await
            .with_context(|| format!("Failed to write manifest {}", path.display()))?;
        info!("Wrote {}", path.display());
    } else {
        println!("{}", json);
    }
    Ok(())
}

fn report(status: &AttachmentsStatus) -> Result<()> {
    if status.is_complete() {
        return Ok(());
    }
    for failure in &status.failures {
        error!("{}", failure);
    }
    bail!(
        "{} disk attachment operations failed for VM {}",
        status.failures.len(),
        status.vm_id
    );
}

//! imgplane CLI - block image administration
//!
//! Drives the image control plane against a cluster persisted in a local
//! redb file. Images are addressed as `pool/image` or `pool/image@snap`.

use anyhow::{Context as _, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use imgplane_common::{Config, Features, LockMode, MirrorMode, PoolId};
use imgplane_image::{
    CloneOptions, Context, CreateOptions, ImageCtx, LogProgress, RemoveFlags, image, lineage, lock,
    mirror, snapshot,
};
use imgplane_store::Cluster;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "imgplane")]
#[command(about = "Block image control plane CLI")]
#[command(version)]
struct Args {
    /// Cluster state file
    #[arg(short, long, default_value = "imgplane.redb", env = "IMGPLANE_CLUSTER")]
    cluster: PathBuf,

    /// Client configuration file (TOML)
    #[arg(long, env = "IMGPLANE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Pool operations
    Pool {
        #[command(subcommand)]
        action: PoolCommands,
    },
    /// Image operations
    Image {
        #[command(subcommand)]
        action: ImageCommands,
    },
    /// Snapshot operations
    Snap {
        #[command(subcommand)]
        action: SnapCommands,
    },
    /// Exclusive lock operations
    Lock {
        #[command(subcommand)]
        action: LockCommands,
    },
    /// Mirroring operations
    Mirror {
        #[command(subcommand)]
        action: MirrorCommands,
    },
}

#[derive(Subcommand, Debug)]
enum PoolCommands {
    /// List pools
    List,
    /// Create a pool
    Create { name: String },
    /// Create a cache tier in front of a pool
    CreateTier { name: String, base: String },
}

#[derive(Subcommand, Debug)]
enum ImageCommands {
    /// List images in a pool
    List { pool: String },
    /// Create an image
    Create {
        /// pool/image
        spec: String,
        /// Size with optional K/M/G/T suffix
        #[arg(short, long)]
        size: String,
        /// Object size as a power of two
        #[arg(long)]
        order: Option<u8>,
        /// Comma separated feature names
        #[arg(long)]
        features: Option<String>,
        #[arg(long)]
        stripe_unit: Option<u64>,
        #[arg(long)]
        stripe_count: Option<u64>,
    },
    /// Show image details
    Info { spec: String },
    /// Resize an image
    Resize {
        spec: String,
        #[arg(short, long)]
        size: String,
    },
    /// Rename an image within its pool
    Rename { spec: String, name: String },
    /// Remove an image
    Remove {
        spec: String,
        /// Remove even when mirroring teardown is refused
        #[arg(long)]
        force: bool,
    },
    /// Clone a protected snapshot
    Clone {
        /// pool/image@snap
        parent: String,
        /// pool/image
        child: String,
        #[arg(long)]
        features: Option<String>,
        #[arg(long)]
        order: Option<u8>,
    },
    /// Copy the parent's data into a clone and detach it
    Flatten { spec: String },
    /// Copy an image (or snapshot) into a new image
    Copy { src: String, dst: String },
    /// List clones of a snapshot
    Children { spec: String },
    /// Enable or disable features
    Feature {
        spec: String,
        features: String,
        #[arg(long)]
        disable: bool,
    },
}

#[derive(Subcommand, Debug)]
enum SnapCommands {
    /// List snapshots
    List { spec: String },
    /// Create a snapshot
    Create { spec: String },
    /// Remove a snapshot
    Remove {
        spec: String,
        /// Unprotect first when protected
        #[arg(long)]
        unprotect: bool,
        /// Flatten clones first
        #[arg(long)]
        flatten_children: bool,
    },
    /// Protect a snapshot against removal
    Protect { spec: String },
    /// Unprotect a snapshot without clones
    Unprotect { spec: String },
    /// Rename a snapshot
    Rename { spec: String, name: String },
    /// Roll the image back to a snapshot
    Rollback { spec: String },
    /// Show or set the snapshot limit
    Limit {
        spec: String,
        #[arg(long)]
        set: Option<u64>,
        #[arg(long, conflicts_with = "set")]
        clear: bool,
    },
}

#[derive(Subcommand, Debug)]
enum LockCommands {
    /// Show the lock owners
    Status { spec: String },
    /// Break the current exclusive lock
    Break { spec: String },
}

#[derive(Subcommand, Debug)]
enum MirrorCommands {
    /// Show or set the pool mirror mode
    Mode {
        pool: String,
        /// disabled, image or pool
        mode: Option<String>,
    },
    /// Register a remote peer
    PeerAdd {
        pool: String,
        cluster: String,
        #[arg(long, default_value = "client.admin")]
        client: String,
    },
    /// Unregister a remote peer
    PeerRemove { pool: String, uuid: String },
    /// List remote peers
    Peers { pool: String },
    /// Enable mirroring of an image
    Enable { spec: String },
    /// Disable mirroring of an image
    Disable {
        spec: String,
        #[arg(long)]
        force: bool,
    },
    /// Promote an image to primary
    Promote {
        spec: String,
        #[arg(long)]
        force: bool,
    },
    /// Demote an image to non-primary
    Demote { spec: String },
    /// Request a resync of a non-primary image
    Resync { spec: String },
    /// Show mirroring status of an image, or of every image in a pool
    Status { spec: String },
}

/// `pool/image[@snap]`
struct ImageSpec {
    pool: String,
    image: String,
    snap: Option<String>,
}

fn parse_spec(spec: &str) -> Result<ImageSpec> {
    let (pool, rest) = spec
        .split_once('/')
        .ok_or_else(|| anyhow!("Invalid image spec '{spec}', expected pool/image"))?;
    let (image, snap) = match rest.split_once('@') {
        Some((image, snap)) => (image, Some(snap.to_string())),
        None => (rest, None),
    };
    if pool.is_empty() || image.is_empty() {
        bail!("Invalid image spec '{spec}'");
    }
    Ok(ImageSpec {
        pool: pool.to_string(),
        image: image.to_string(),
        snap,
    })
}

/// Parse a size string like "10G" or "512M" into bytes.
fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    let (num, multiplier) = if let Some(n) = s.strip_suffix('T') {
        (n, 1024 * 1024 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('G') {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('M') {
        (n, 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('K') {
        (n, 1024)
    } else {
        (s, 1)
    };
    let value: u64 = num
        .parse()
        .map_err(|_| anyhow!("Invalid size: '{s}'"))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| anyhow!("Size too large: '{s}'"))
}

/// Format bytes as a human-readable size string.
#[allow(clippy::cast_precision_loss)]
fn format_size(bytes: u64) -> String {
    const TIB: u64 = 1024 * 1024 * 1024 * 1024;
    const GIB: u64 = 1024 * 1024 * 1024;
    const MIB: u64 = 1024 * 1024;

    if bytes >= TIB && bytes.is_multiple_of(TIB) {
        format!("{} TiB", bytes / TIB)
    } else if bytes >= GIB && bytes.is_multiple_of(GIB) {
        format!("{} GiB", bytes / GIB)
    } else if bytes >= MIB && bytes.is_multiple_of(MIB) {
        format!("{} MiB", bytes / MIB)
    } else if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else {
        format!("{bytes} B")
    }
}

fn parse_features(list: &str) -> Result<Features> {
    Features::parse(list).map_err(|e| anyhow!(e))
}

fn parse_mode(mode: &str) -> Result<MirrorMode> {
    match mode {
        "disabled" => Ok(MirrorMode::Disabled),
        "image" => Ok(MirrorMode::Image),
        "pool" => Ok(MirrorMode::Pool),
        other => bail!("Unknown mirror mode '{other}'"),
    }
}

async fn pool_id(ctx: &Context, name: &str) -> Result<PoolId> {
    ctx.store()
        .pool_lookup(name)
        .await
        .with_context(|| format!("Pool '{name}'"))
}

async fn open(ctx: &Context, spec: &str) -> Result<Arc<ImageCtx>> {
    let spec = parse_spec(spec)?;
    let pool = pool_id(ctx, &spec.pool).await?;
    let img = match &spec.snap {
        Some(snap) => image::open_snapshot(ctx, pool, &spec.image, snap).await?,
        None => image::open(ctx, pool, &spec.image, false).await?,
    };
    Ok(img)
}

/// Open the head of the image a snapshot spec names
async fn open_for_snap(ctx: &Context, spec: &str) -> Result<(Arc<ImageCtx>, String)> {
    let parsed = parse_spec(spec)?;
    let snap = parsed
        .snap
        .ok_or_else(|| anyhow!("Snapshot spec '{spec}' needs @snap"))?;
    let pool = pool_id(ctx, &parsed.pool).await?;
    let img = image::open(ctx, pool, &parsed.image, false).await?;
    Ok((img, snap))
}

async fn close(img: Arc<ImageCtx>) -> Result<()> {
    image::close(img).await?;
    Ok(())
}

async fn run_pool(cluster: &Arc<Cluster>, ctx: &Context, action: PoolCommands) -> Result<()> {
    match action {
        PoolCommands::List => {
            println!("{:<8} {:<30}", "ID", "NAME");
            println!("{}", "-".repeat(40));
            for (id, name) in ctx.store().pool_list().await? {
                println!("{id:<8} {name:<30}");
            }
        }
        PoolCommands::Create { name } => {
            let id = cluster.create_pool(&name)?;
            println!("Pool '{name}' created with id {id}");
        }
        PoolCommands::CreateTier { name, base } => {
            let base = pool_id(ctx, &base).await?;
            let id = cluster.create_cache_tier(&name, base)?;
            println!("Cache tier '{name}' created with id {id}");
        }
    }
    Ok(())
}

async fn run_image(ctx: &Context, action: ImageCommands) -> Result<()> {
    match action {
        ImageCommands::List { pool } => {
            let pool = pool_id(ctx, &pool).await?;
            let names = image::list(ctx, pool).await?;
            if names.is_empty() {
                println!("No images found");
            }
            for name in names {
                println!("{name}");
            }
        }
        ImageCommands::Create {
            spec,
            size,
            order,
            features,
            stripe_unit,
            stripe_count,
        } => {
            let parsed = parse_spec(&spec)?;
            let pool = pool_id(ctx, &parsed.pool).await?;
            let size = parse_size(&size)?;
            let opts = CreateOptions {
                order,
                features: features.as_deref().map(parse_features).transpose()?,
                stripe_unit,
                stripe_count,
                ..CreateOptions::default()
            };
            image::create(ctx, pool, &parsed.image, size, &opts).await?;
            println!("Image '{spec}' created ({})", format_size(size));
        }
        ImageCommands::Info { spec } => {
            let img = open(ctx, &spec).await?;
            let info = image::info(&img).await?;
            println!("Image: {spec}");
            println!("  size:           {} ({} objects)", format_size(info.size), info.num_objects);
            println!("  order:          {} ({} per object)", info.order, format_size(info.object_size));
            println!("  prefix:         {}", info.block_name_prefix);
            println!("  format:         {}", if info.old_format { 1 } else { 2 });
            println!("  features:       {}", info.features);
            if let Some(parent) = &info.parent {
                println!(
                    "  parent:         {}/{}@{} (overlap {})",
                    parent.pool_name,
                    parent.image_name,
                    parent.snap_name,
                    format_size(parent.overlap)
                );
            }
            close(img).await?;
        }
        ImageCommands::Resize { spec, size } => {
            let img = open(ctx, &spec).await?;
            let size = parse_size(&size)?;
            let result = image::resize(&img, size, &LogProgress::new("resize")).await;
            close(img).await?;
            result?;
            println!("Image '{spec}' resized to {}", format_size(size));
        }
        ImageCommands::Rename { spec, name } => {
            let parsed = parse_spec(&spec)?;
            let pool = pool_id(ctx, &parsed.pool).await?;
            image::rename(ctx, pool, &parsed.image, &name).await?;
            println!("Image '{spec}' renamed to '{name}'");
        }
        ImageCommands::Remove { spec, force } => {
            let parsed = parse_spec(&spec)?;
            let pool = pool_id(ctx, &parsed.pool).await?;
            image::remove(ctx, pool, &parsed.image, force, &LogProgress::new("remove")).await?;
            println!("Image '{spec}' removed");
        }
        ImageCommands::Clone {
            parent,
            child,
            features,
            order,
        } => {
            let p = parse_spec(&parent)?;
            let p_snap = p
                .snap
                .ok_or_else(|| anyhow!("Parent '{parent}' needs @snap"))?;
            let c = parse_spec(&child)?;
            let p_pool = pool_id(ctx, &p.pool).await?;
            let c_pool = pool_id(ctx, &c.pool).await?;
            let opts = CloneOptions {
                features: features.as_deref().map(parse_features).transpose()?,
                order,
                ..CloneOptions::default()
            };
            lineage::clone(ctx, p_pool, &p.image, &p_snap, c_pool, &c.image, &opts).await?;
            println!("Cloned '{parent}' to '{child}'");
        }
        ImageCommands::Flatten { spec } => {
            let img = open(ctx, &spec).await?;
            let result = lineage::flatten(&img, &LogProgress::new("flatten")).await;
            close(img).await?;
            result?;
            println!("Image '{spec}' flattened");
        }
        ImageCommands::Copy { src, dst } => {
            let img = open(ctx, &src).await?;
            let d = parse_spec(&dst)?;
            let pool = pool_id(ctx, &d.pool).await?;
            let result = lineage::copy_to_new(
                &img,
                pool,
                &d.image,
                &CreateOptions::default(),
                &LogProgress::new("copy"),
            )
            .await;
            close(img).await?;
            result?;
            println!("Copied '{src}' to '{dst}'");
        }
        ImageCommands::Children { spec } => {
            let img = open(ctx, &spec).await?;
            let children = lineage::list_children(&img).await;
            close(img).await?;
            for child in children? {
                println!("{}/{}", child.pool_name, child.image_name);
            }
        }
        ImageCommands::Feature {
            spec,
            features,
            disable,
        } => {
            let img = open(ctx, &spec).await?;
            let result = image::update_features(&img, parse_features(&features)?, !disable).await;
            close(img).await?;
            result?;
            println!(
                "Features '{features}' {} on '{spec}'",
                if disable { "disabled" } else { "enabled" }
            );
        }
    }
    Ok(())
}

async fn run_snap(ctx: &Context, action: SnapCommands) -> Result<()> {
    match action {
        SnapCommands::List { spec } => {
            let img = open(ctx, &spec).await?;
            let snaps = snapshot::list(&img).await;
            close(img).await?;
            println!("{:<8} {:<30} {:<12} {:<12}", "ID", "NAME", "SIZE", "PROTECTION");
            println!("{}", "-".repeat(64));
            for snap in snaps? {
                println!(
                    "{:<8} {:<30} {:<12} {:<12}",
                    snap.id,
                    snap.name,
                    format_size(snap.size),
                    snap.protection
                );
            }
        }
        SnapCommands::Create { spec } => {
            let (img, snap) = open_for_snap(ctx, &spec).await?;
            let result = snapshot::create(&img, &snap).await;
            close(img).await?;
            let id = result?;
            println!("Snapshot '{spec}' created with id {id}");
        }
        SnapCommands::Remove {
            spec,
            unprotect,
            flatten_children,
        } => {
            let (img, snap) = open_for_snap(ctx, &spec).await?;
            let flags = RemoveFlags {
                flatten_children,
                unprotect,
            };
            let result = snapshot::remove(&img, &snap, flags).await;
            close(img).await?;
            result?;
            println!("Snapshot '{spec}' removed");
        }
        SnapCommands::Protect { spec } => {
            let (img, snap) = open_for_snap(ctx, &spec).await?;
            let result = snapshot::protect(&img, &snap).await;
            close(img).await?;
            result?;
            println!("Snapshot '{spec}' protected");
        }
        SnapCommands::Unprotect { spec } => {
            let (img, snap) = open_for_snap(ctx, &spec).await?;
            let result = snapshot::unprotect(&img, &snap).await;
            close(img).await?;
            result?;
            println!("Snapshot '{spec}' unprotected");
        }
        SnapCommands::Rename { spec, name } => {
            let (img, snap) = open_for_snap(ctx, &spec).await?;
            let result = snapshot::rename(&img, &snap, &name).await;
            close(img).await?;
            result?;
            println!("Snapshot '{spec}' renamed to '{name}'");
        }
        SnapCommands::Rollback { spec } => {
            let (img, snap) = open_for_snap(ctx, &spec).await?;
            let result = snapshot::rollback(&img, &snap, &LogProgress::new("rollback")).await;
            close(img).await?;
            result?;
            println!("Rolled back to '{spec}'");
        }
        SnapCommands::Limit { spec, set, clear } => {
            let img = open(ctx, &spec).await?;
            let result = match (set, clear) {
                (Some(limit), _) => snapshot::set_limit(&img, limit).await.map(|()| limit),
                (None, true) => snapshot::set_limit(&img, u64::MAX).await.map(|()| u64::MAX),
                (None, false) => snapshot::get_limit(&img).await,
            };
            close(img).await?;
            match result? {
                u64::MAX => println!("Snapshot limit: none"),
                limit => println!("Snapshot limit: {limit}"),
            }
        }
    }
    Ok(())
}

async fn run_lock(ctx: &Context, action: LockCommands) -> Result<()> {
    let spec = match &action {
        LockCommands::Status { spec } | LockCommands::Break { spec } => spec.clone(),
    };
    let img = open(ctx, &spec).await?;
    let result = async {
        let (mode, owners) = lock::lock_get_owners(&img).await?;
        match action {
            LockCommands::Status { .. } => {
                if owners.is_empty() {
                    println!("No lock owners");
                }
                for owner in owners {
                    println!("{mode:?}: {owner}");
                }
            }
            LockCommands::Break { .. } => {
                let owner = owners
                    .into_iter()
                    .next()
                    .ok_or_else(|| anyhow!("'{spec}' is not locked"))?;
                let outcome = lock::lock_break(&img, LockMode::Exclusive, &owner).await?;
                println!("Lock of {owner}: {outcome:?}");
            }
        }
        Ok::<_, anyhow::Error>(())
    }
    .await;
    close(img).await?;
    result
}

async fn run_mirror(ctx: &Context, action: MirrorCommands) -> Result<()> {
    match action {
        MirrorCommands::Mode { pool, mode } => {
            let id = pool_id(ctx, &pool).await?;
            match mode {
                Some(mode) => {
                    mirror::mode_set(ctx, id, parse_mode(&mode)?).await?;
                    println!("Pool '{pool}' mirror mode set to {mode}");
                }
                None => println!("{}", mirror::mode_get(ctx, id).await?),
            }
        }
        MirrorCommands::PeerAdd {
            pool,
            cluster,
            client,
        } => {
            let id = pool_id(ctx, &pool).await?;
            let uuid = mirror::peer_add(ctx, id, &cluster, &client).await?;
            println!("Peer {uuid} added");
        }
        MirrorCommands::PeerRemove { pool, uuid } => {
            let id = pool_id(ctx, &pool).await?;
            mirror::peer_remove(ctx, id, &uuid).await?;
            println!("Peer {uuid} removed");
        }
        MirrorCommands::Peers { pool } => {
            let id = pool_id(ctx, &pool).await?;
            println!("{:<38} {:<20} {:<20}", "UUID", "CLUSTER", "CLIENT");
            println!("{}", "-".repeat(80));
            for peer in mirror::peer_list(ctx, id).await? {
                println!(
                    "{:<38} {:<20} {:<20}",
                    peer.uuid, peer.cluster_name, peer.client_name
                );
            }
        }
        MirrorCommands::Enable { spec } => {
            let img = open(ctx, &spec).await?;
            let result = mirror::image_enable(&img, false).await;
            close(img).await?;
            result?;
            println!("Mirroring enabled for '{spec}'");
        }
        MirrorCommands::Disable { spec, force } => {
            let img = open(ctx, &spec).await?;
            let result = mirror::image_disable(&img, force).await;
            close(img).await?;
            result?;
            println!("Mirroring disabled for '{spec}'");
        }
        MirrorCommands::Promote { spec, force } => {
            let img = open(ctx, &spec).await?;
            let result = mirror::image_promote(&img, force).await;
            close(img).await?;
            result?;
            println!("Image '{spec}' promoted to primary");
        }
        MirrorCommands::Demote { spec } => {
            let img = open(ctx, &spec).await?;
            let result = mirror::image_demote(&img).await;
            close(img).await?;
            result?;
            println!("Image '{spec}' demoted to non-primary");
        }
        MirrorCommands::Resync { spec } => {
            let img = open(ctx, &spec).await?;
            let result = mirror::image_resync(&img).await;
            close(img).await?;
            result?;
            println!("Resync requested for '{spec}'");
        }
        MirrorCommands::Status { spec } => {
            if spec.contains('/') {
                let img = open(ctx, &spec).await?;
                let result = mirror::image_get_status(&img).await;
                close(img).await?;
                let status = result?;
                println!("{}:", status.name);
                println!("  global_id:   {}", status.info.global_id);
                println!("  state:       {:?}, {}", status.state, status.description);
                println!("  primary:     {}", status.info.primary);
                if let Some(last_update) = status.last_update {
                    println!("  last_update: {last_update}");
                }
            } else {
                let id = pool_id(ctx, &spec).await?;
                for (state, count) in mirror::image_status_summary(ctx, id).await? {
                    println!("{state:?}: {count}");
                }
                for status in mirror::image_status_list(ctx, id, "", 1024).await?.into_values() {
                    println!("{:<30} {:?} {}", status.name, status.state, status.description);
                }
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let cluster = Cluster::open(&args.cluster)
        .with_context(|| format!("Failed to open cluster {}", args.cluster.display()))?;
    let ctx = Context::new(Arc::new(cluster.connect()), config);
    info!("Connected to cluster {}", args.cluster.display());

    match args.command {
        Commands::Pool { action } => run_pool(&cluster, &ctx, action).await,
        Commands::Image { action } => run_image(&ctx, action).await,
        Commands::Snap { action } => run_snap(&ctx, action).await,
        Commands::Lock { action } => run_lock(&ctx, action).await,
        Commands::Mirror { action } => run_mirror(&ctx, action).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_spec() {
        let spec = parse_spec("rbd/disk@s1").unwrap();
        assert_eq!(spec.pool, "rbd");
        assert_eq!(spec.image, "disk");
        assert_eq!(spec.snap.as_deref(), Some("s1"));
        assert!(parse_spec("rbd/disk").unwrap().snap.is_none());
        assert!(parse_spec("disk").is_err());
        assert!(parse_spec("/disk").is_err());
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("10G").unwrap(), 10 << 30);
        assert_eq!(parse_size("4K").unwrap(), 4096);
        assert_eq!(parse_size("512").unwrap(), 512);
        assert!(parse_size("lots").is_err());
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(10 << 30), "10 GiB");
        assert_eq!(format_size(4 << 20), "4 MiB");
        assert_eq!(format_size(100), "100 B");
    }

    #[test]
    fn test_default_log_level() {
        let args = Args::try_parse_from(["imgplane", "pool", "list"]).unwrap();
        assert_eq!(args.log_level, "info");
        assert!(matches!(
            args.command,
            Commands::Pool {
                action: PoolCommands::List
            }
        ));

        let args = Args::try_parse_from(["imgplane", "--log-level", "debug", "pool", "list"]).unwrap();
        assert_eq!(args.log_level, "debug");
    }
}

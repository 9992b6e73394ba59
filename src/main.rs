use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::io::AsyncWriteExt;

use tosfs::config;
use tosfs::storage::{DiskUsage, FileSystem, FsBox, FsRegistry, OnError};

#[derive(Parser, Debug)]
#[command(name = "tosfs", about = "Filesystem commands over TOS object storage")]
struct Cli {
    /// Logging level (DEBUG, INFO, WARNING, ERROR, CRITICAL) or a tracing filter
    #[arg(long, global = true, env = "TOSFS_LOGGING_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List a directory, a bucket or the buckets of the account
    Ls {
        #[arg(default_value = "tos://")]
        path: String,
        /// Show type and size
        #[arg(short, long)]
        long: bool,
        /// Bypass the listing cache
        #[arg(long)]
        refresh: bool,
    },
    /// Print the metadata of a path as JSON
    Info { path: String },
    /// Write file contents to stdout
    Cat {
        path: String,
        #[arg(long, allow_hyphen_values = true)]
        start: Option<i64>,
        #[arg(long, allow_hyphen_values = true)]
        end: Option<i64>,
    },
    /// Upload a local file
    Put { local: PathBuf, remote: String },
    /// Download a remote file
    Get { remote: String, local: PathBuf },
    /// Remove files or directories
    Rm {
        #[arg(required = true)]
        paths: Vec<String>,
        #[arg(short, long)]
        recursive: bool,
    },
    /// Move or rename a file or directory
    Mv { src: String, dst: String },
    /// Copy a file or directory
    Cp {
        src: String,
        dst: String,
        #[arg(short, long)]
        recursive: bool,
        /// Skip sources that fail instead of aborting
        #[arg(long)]
        ignore_errors: bool,
    },
    /// Create a directory
    Mkdir {
        path: String,
        /// Create parents (and the bucket) as needed
        #[arg(short, long)]
        parents: bool,
    },
    /// Remove an empty directory
    Rmdir { path: String },
    /// List every file below a path
    Find {
        path: String,
        #[arg(long)]
        maxdepth: Option<usize>,
        #[arg(long)]
        withdirs: bool,
    },
    /// Show space used below a path
    Du {
        path: String,
        /// Print one line per entry instead of the total
        #[arg(short, long)]
        all: bool,
        #[arg(long)]
        maxdepth: Option<usize>,
    },
    /// List registered protocols
    Protocols,
    /// Print version information
    Version,
}

/// Mount the protocol of `url` on first use and resolve it / 按需挂载并解析路径
async fn resolve(registry: &FsRegistry, url: &str) -> Result<(FsBox, String)> {
    let protocol = url.split_once("://").map(|(p, _)| p).unwrap_or("tos");
    let mount = format!("{}://", protocol);
    if registry.get(&mount).await.is_none() {
        registry.create_filesystem(&mount, protocol, Value::Null).await?;
    }
    registry.resolve(url).await
}

async fn run(cli: Cli, registry: FsRegistry) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    match cli.command {
        Commands::Ls { path, long, refresh } => {
            let (fs, path) = resolve(&registry, &path).await?;
            for entry in fs.ls(&path, refresh).await? {
                if long {
                    println!("{:<9} {:>12} {}", format!("{:?}", entry.kind).to_lowercase(), entry.size, entry.name);
                } else {
                    println!("{}", entry.name);
                }
            }
        }
        Commands::Info { path } => {
            let (fs, path) = resolve(&registry, &path).await?;
            let info = fs.info(&path).await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Commands::Cat { path, start, end } => {
            let (fs, path) = resolve(&registry, &path).await?;
            let data = fs.cat_file(&path, start, end).await?;
            stdout.write_all(&data).await?;
            stdout.flush().await?;
        }
        Commands::Put { local, remote } => {
            let (fs, remote) = resolve(&registry, &remote).await?;
            fs.put_file(&local, &remote, None).await?;
            tracing::info!("Uploaded {:?} to {}", local, remote);
        }
        Commands::Get { remote, local } => {
            let (fs, remote) = resolve(&registry, &remote).await?;
            fs.get_file(&remote, &local).await?;
            tracing::info!("Downloaded {} to {:?}", remote, local);
        }
        Commands::Rm { paths, recursive } => {
            let first = paths.first().ok_or_else(|| anyhow!("no path given"))?;
            let (fs, _) = resolve(&registry, first).await?;
            let paths: Vec<String> = paths.iter().map(|p| fs.normalize_path(p)).collect();
            fs.rm(&paths, recursive).await?;
        }
        Commands::Mv { src, dst } => {
            let (fs, src) = resolve(&registry, &src).await?;
            fs.mv(&src, &fs.normalize_path(&dst)).await?;
        }
        Commands::Cp {
            src,
            dst,
            recursive,
            ignore_errors,
        } => {
            let (fs, src_path) = resolve(&registry, &src).await?;
            // keep a trailing slash, it selects "copy contents"
            let src_path = if src.ends_with('/') { format!("{}/", src_path) } else { src_path };
            let on_error = if ignore_errors { OnError::Omit } else { OnError::Raise };
            fs.copy(&src_path, &fs.normalize_path(&dst), recursive, on_error).await?;
        }
        Commands::Mkdir { path, parents } => {
            let (fs, path) = resolve(&registry, &path).await?;
            fs.mkdir(&path, parents).await?;
        }
        Commands::Rmdir { path } => {
            let (fs, path) = resolve(&registry, &path).await?;
            fs.rmdir(&path).await?;
        }
        Commands::Find { path, maxdepth, withdirs } => {
            let (fs, path) = resolve(&registry, &path).await?;
            for entry in fs.find(&path, maxdepth, withdirs).await? {
                println!("{}", entry.name);
            }
        }
        Commands::Du { path, all, maxdepth } => {
            let (fs, path) = resolve(&registry, &path).await?;
            match fs.du(&path, !all, maxdepth, false).await? {
                DiskUsage::Total(total) => println!("{}\t{}", total, path),
                DiskUsage::Entries(entries) => {
                    for (name, size) in entries {
                        println!("{}\t{}", size, name);
                    }
                }
            }
        }
        Commands::Protocols => {
            for protocol in registry.list_protocols().await {
                let description = registry
                    .factory_info(&protocol)
                    .await
                    .map(|info| info.description)
                    .unwrap_or_default();
                println!("{:<8} {}", protocol, description);
            }
        }
        Commands::Version => {
            println!("tosfs {} (built {})", env!("CARGO_PKG_VERSION"), env!("BUILD_TIME"));
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration / 加载配置
    let app_config = config::init_config().map_err(|e| anyhow!(e))?;
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| app_config.read().logging_level.clone());
    tosfs::logging::init(&level);

    let registry = FsRegistry::new();
    tosfs::register_filesystems(&registry).await?;

    run(cli, registry).await
}

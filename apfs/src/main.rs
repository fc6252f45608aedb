use std::path::PathBuf;

use anyhow::{bail, Context as _, Result};
use apfs::{
    Container, FileDevice, Filesystem, FormatParams, Options, MIN_CONTAINER_SIZE, ROOT_DIR_INO,
};
use clap::{Args, Parser, Subcommand};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

const ENV_LOG: &str = "APFS_LOG";

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Print the collected metrics before exiting.
    #[arg(long, global = true)]
    metrics: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create an image file holding an empty container.
    Mkfs(MkfsParams),
    /// Check the consistency of a container and print a summary.
    Check(ImageParams),
    /// List a directory of a container.
    Ls {
        #[command(flatten)]
        image: ImageParams,
        /// Absolute path of the directory, with `/` as separator.
        #[clap(default_value = "/")]
        path: String,
    },
}

#[derive(Args, Debug)]
struct ImageParams {
    /// Path to the image file or block device.
    image: PathBuf,

    /// Block size of the container.
    #[clap(default_value = "4096")]
    #[arg(long, short)]
    block_size: usize,
}

#[derive(Args, Debug)]
struct MkfsParams {
    #[command(flatten)]
    image: ImageParams,

    /// Size of the image in bytes. Rounded down to whole blocks.
    #[clap(default_value_t = MIN_CONTAINER_SIZE)]
    #[arg(long, short)]
    size: u64,

    /// Volume label.
    #[clap(default_value = "untitled")]
    #[arg(long, short)]
    label: String,

    /// Make name lookups ignore case.
    #[arg(long)]
    case_insensitive: bool,
}

fn init_logging() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var(ENV_LOG)
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let mut options = Options::new();
    options.metrics(cli.metrics);

    let fs = match cli.command {
        Commands::Mkfs(params) => mkfs(params, &options)?,
        Commands::Check(image) => {
            let fs = open(&image, &options)?;
            let report = fs.check().context("consistency check failed")?;
            println!("{report}");
            fs
        }
        Commands::Ls { image, path } => {
            let fs = open(&image, &options)?;
            ls(&fs, &path)?;
            fs
        }
    };

    if cli.metrics {
        fs.metrics().print();
    }
    Ok(())
}

fn open(image: &ImageParams, options: &Options) -> Result<Filesystem> {
    let dev = FileDevice::open(&image.image, image.block_size)
        .with_context(|| format!("failed to open {}", image.image.display()))?;
    let fs = Container::open(Box::new(dev), options)
        .with_context(|| format!("failed to mount {}", image.image.display()))?;
    Ok(Filesystem::from(fs))
}

fn mkfs(params: MkfsParams, options: &Options) -> Result<Filesystem> {
    let block_size = params.image.block_size;
    let block_count = params.size / block_size as u64;
    let dev = FileDevice::create(&params.image.image, block_size, block_count)
        .with_context(|| format!("failed to create {}", params.image.image.display()))?;

    let mut format = FormatParams::new();
    format.block_size(block_size);
    format.label(params.label);
    format.case_insensitive(params.case_insensitive);
    let fs = Filesystem::format(Box::new(dev), &format, options).context("mkfs failed")?;
    fs.with_container(|fs| {
        println!(
            "created container {} with {} blocks of {block_size} bytes",
            hex::encode(fs.uuid()),
            fs.block_count()
        )
    });
    Ok(fs)
}

fn ls(fs: &Filesystem, path: &str) -> Result<()> {
    if !path.starts_with('/') {
        bail!("path {path:?} is not absolute");
    }
    let mut dir = ROOT_DIR_INO;
    for name in path.split('/').filter(|name| !name.is_empty()) {
        dir = fs
            .lookup(dir, name)
            .with_context(|| format!("cannot resolve {name:?} in {path:?}"))?;
    }

    let mut entries = Vec::new();
    fs.readdir(dir, 0, &mut |name, cnid, file_type| {
        entries.push((name.to_owned(), cnid, file_type));
        true
    })
    .with_context(|| format!("cannot list {path:?}"))?;
    for (name, cnid, file_type) in entries {
        println!("{cnid:>8} {} {name}", type_char(file_type));
    }
    Ok(())
}

fn type_char(file_type: u8) -> char {
    use apfs_core::records::*;
    match file_type {
        DT_DIR => 'd',
        DT_REG => '-',
        DT_LNK => 'l',
        DT_FIFO => 'p',
        DT_CHR => 'c',
        DT_BLK => 'b',
        DT_SOCK => 's',
        _ => '?',
    }
}

//! docker-squash CLI entry point.

use std::path::PathBuf;

use clap::{ArgAction, Parser};
use tracing_subscriber::EnvFilter;

use docker_squash_core::config::StoreConfig;
use docker_squash_core::error::Result;
use docker_squash_engine::squash::{SquashOptions, Squasher};
use docker_squash_engine::store::LocalStore;

/// Squash the latest layers of an image into a single layer.
#[derive(Parser)]
#[command(name = "docker-squash", version, about)]
struct Cli {
    /// Image to be squashed
    #[arg(long)]
    image: String,

    /// Number of layers to squash or ID of the layer to squash from
    #[arg(long)]
    from_layer: Option<String>,

    /// Tag to be used for the new image
    #[arg(long)]
    tag: Option<String>,

    /// Commit message for the new image
    #[arg(long, default_value = "squash image")]
    message: String,

    /// Remove the temporary directory after squashing
    #[arg(long)]
    cleanup: bool,

    /// Temporary directory to be created and used
    #[arg(long)]
    tmp_dir: Option<PathBuf>,

    /// Path where the squashed image tar should be stored
    #[arg(long)]
    output_path: Option<PathBuf>,

    /// Load the squashed image back into the store
    #[arg(
        long,
        default_value_t = true,
        action = ArgAction::Set,
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    load_image: bool,

    /// Root directory of the local image store
    #[arg(long)]
    store_dir: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .init();

    match run(cli) {
        Ok(image_id) => println!("{image_id}"),
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(e.exit_code());
        }
    }
}

fn run(cli: Cli) -> Result<String> {
    let store_dir = cli.store_dir.unwrap_or_else(default_store_dir);
    let store = LocalStore::open(&store_dir, StoreConfig::from_env()?)?;

    let options = SquashOptions {
        image: cli.image,
        from_layer: cli.from_layer,
        tag: cli.tag,
        message: cli.message,
        tmp_dir: cli.tmp_dir,
        output_path: cli.output_path,
        load_image: cli.load_image,
        cleanup: cli.cleanup,
    };

    Squasher::new(&store, options).run()
}

/// Default image store root (~/.docker-squash/images).
fn default_store_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".docker-squash"))
        .unwrap_or_else(|| PathBuf::from(".docker-squash"))
        .join("images")
}

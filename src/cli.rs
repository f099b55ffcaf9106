//! CLI: `clap`-derived subcommands for one-shot operator actions.
//! `serve` (the default — no subcommand needed) runs the gateway; everything
//! else exits immediately after handling.

use clap::{Parser, Subcommand};

use crate::config::{Config, VERSION};
use crate::db;
use crate::tokens::store::NewToken;
use crate::tokens::TokenStore;

/// sora-broker - multi-tenant gateway for the Sora image/video generation upstream
#[derive(Parser)]
#[command(name = "sora-broker")]
#[command(version = VERSION)]
#[command(about = "Multi-tenant gateway for the Sora image/video generation upstream", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the gateway (default when no subcommand is given)
    Serve,
    /// Configuration file management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Token pool management
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the resolved config file path
    Path,
    /// Write the template config file if none exists yet
    Init,
}

#[derive(Subcommand)]
pub enum TokenAction {
    /// Insert a token row from flags, for bootstrapping a pool without the admin HTTP surface
    Add {
        #[arg(long)]
        email: String,
        #[arg(long)]
        access_token: String,
        #[arg(long)]
        session_token: Option<String>,
        #[arg(long)]
        refresh_token: Option<String>,
        #[arg(long)]
        client_id: Option<String>,
        #[arg(long)]
        proxy_url: Option<String>,
        #[arg(long)]
        remark: Option<String>,
        #[arg(long)]
        image_concurrency: Option<i64>,
        #[arg(long)]
        video_concurrency: Option<i64>,
    },
}

/// Handle CLI commands. Returns true if a command other than `serve` was
/// handled, meaning the process should exit rather than start the server.
pub fn handle_cli() -> bool {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Commands::Serve) => false,
        Some(Commands::Config { action }) => {
            match action {
                ConfigAction::Path => handle_config_path(),
                ConfigAction::Init => handle_config_init(),
            }
            true
        }
        Some(Commands::Token { action }) => {
            match action {
                TokenAction::Add {
                    email,
                    access_token,
                    session_token,
                    refresh_token,
                    client_id,
                    proxy_url,
                    remark,
                    image_concurrency,
                    video_concurrency,
                } => handle_token_add(
                    email,
                    access_token,
                    session_token,
                    refresh_token,
                    client_id,
                    proxy_url,
                    remark,
                    image_concurrency,
                    video_concurrency,
                ),
            }
            true
        }
    }
}

fn handle_config_path() {
    match Config::config_path() {
        Some(path) => println!("{}", path.display()),
        None => {
            eprintln!("Error: could not determine config path");
            std::process::exit(1);
        }
    }
}

fn handle_config_init() {
    let Some(path) = Config::config_path() else {
        eprintln!("Error: could not determine config path");
        std::process::exit(1);
    };
    if path.exists() {
        println!("Config already exists: {}", path.display());
        return;
    }
    Config::ensure_config_exists();
    println!("Created config file: {}", path.display());
}

#[allow(clippy::too_many_arguments)]
fn handle_token_add(
    email: String,
    access_token: String,
    session_token: Option<String>,
    refresh_token: Option<String>,
    client_id: Option<String>,
    proxy_url: Option<String>,
    remark: Option<String>,
    image_concurrency: Option<i64>,
    video_concurrency: Option<i64>,
) {
    let config = Config::from_env();
    let pool = match db::open(&config.db_path) {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("Error opening database at {}: {}", config.db_path.display(), e);
            std::process::exit(1);
        }
    };
    let store = match TokenStore::new(pool) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("Error loading token store: {}", e);
            std::process::exit(1);
        }
    };
    let result = store.insert(&NewToken {
        email,
        access_token,
        session_token,
        refresh_token,
        client_id,
        proxy_url,
        remark,
        image_concurrency,
        video_concurrency,
    });
    match result {
        Ok(id) => println!("Inserted token #{id}"),
        Err(e) => {
            eprintln!("Error inserting token: {e}");
            std::process::exit(1);
        }
    }
}

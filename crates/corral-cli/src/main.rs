mod agent_cmds;
mod config;
mod pool_cmds;
mod serve_cmd;
mod task_cmds;
mod workspace_cmds;
mod ws;

use clap::{Parser, Subcommand};

use corral_db::pool;

use config::CorralConfig;

#[derive(Parser)]
#[command(name = "corral", about = "Coordinator for fleets of remote plan/apply agents")]
struct Cli {
    /// Database URL (overrides CORRAL_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a corral config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/corral")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Create the corral database and apply migrations
    DbInit,
    /// Run the coordinator: HTTP API plus the agent control channel
    Serve {
        /// Address to bind both listeners to
        #[arg(long)]
        bind: Option<String>,
        /// HTTP API port (overrides CORRAL_API_PORT)
        #[arg(long)]
        port: Option<u16>,
        /// Control channel port (defaults to the API port + 10)
        #[arg(long)]
        cc_port: Option<u16>,
    },
    /// Agent pool management
    Pool {
        #[command(subcommand)]
        command: PoolCommands,
    },
    /// Registered agents
    Agent {
        #[command(subcommand)]
        command: AgentCommands,
    },
    /// Workspaces and their drift-check settings
    Workspace {
        #[command(subcommand)]
        command: WorkspaceCommands,
    },
    /// Submit and inspect tasks
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
}

#[derive(Subcommand)]
pub enum PoolCommands {
    /// Create an agent pool
    Create {
        /// Pool ID (also used in pool tokens)
        pool_id: String,
        /// Display name (defaults to the ID)
        #[arg(long)]
        name: Option<String>,
        /// Provisioning type: static or k8s
        #[arg(long = "type", default_value = "static")]
        pool_type: String,
        /// Desired agent count, for external scalers
        #[arg(long, default_value_t = 0)]
        desired: i32,
    },
    /// List pools with their online agent counts
    List,
    /// Issue a bearer token agents of this pool register with
    Token {
        pool_id: String,
    },
    /// Change the desired agent count external scalers read
    Scale {
        pool_id: String,
        desired: i32,
    },
}

#[derive(Subcommand)]
pub enum AgentCommands {
    /// List registered agents
    List,
    /// Delete an agent record
    Remove {
        agent_id: String,
    },
}

#[derive(Subcommand)]
pub enum WorkspaceCommands {
    /// Add a workspace bound to a pool
    Add {
        workspace_id: String,
        /// Pool the workspace's tasks run in
        #[arg(long)]
        pool: String,
        /// Display name (defaults to the ID)
        #[arg(long)]
        name: Option<String>,
    },
    /// List workspaces with their drift status
    List,
    /// Change drift-check settings; unspecified options keep their value
    Drift {
        workspace_id: String,
        /// Enable scheduled drift checks
        #[arg(long, conflicts_with = "disable")]
        enable: bool,
        /// Disable scheduled drift checks
        #[arg(long)]
        disable: bool,
        /// Minutes between checks
        #[arg(long)]
        interval: Option<i32>,
        /// Window start, UTC time of day (HH:MM)
        #[arg(long, requires = "window_end")]
        window_start: Option<String>,
        /// Window end, UTC time of day (HH:MM)
        #[arg(long, requires = "window_start")]
        window_end: Option<String>,
        /// Remove the time window
        #[arg(long, conflicts_with_all = ["window_start", "window_end"])]
        clear_window: bool,
        /// Keep checking after a successful check
        #[arg(long)]
        continue_on_success: Option<bool>,
        /// Keep checking after a failed check
        #[arg(long)]
        continue_on_failure: Option<bool>,
    },
    /// Start a drift check now, ignoring interval and window
    DriftNow {
        workspace_id: String,
    },
}

#[derive(Subcommand)]
pub enum TaskCommands {
    /// Queue a task for a workspace
    Submit {
        workspace_id: String,
        /// plan or plan_and_apply
        #[arg(long = "type", default_value = "plan")]
        task_type: String,
    },
    /// List recent tasks
    List {
        /// Only tasks in this status
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Show one task
    Show {
        task_id: i64,
    },
}

/// Execute the `corral init` command: write config file.
fn cmd_init(db_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let token_secret = config::generate_token_secret();

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_string(),
        },
        auth: config::AuthSection {
            token_secret: token_secret.clone(),
        },
        server: None,
        coordinator: None,
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!("  auth.token_secret = {}...{}", &token_secret[..8], &token_secret[56..]);
    println!();
    println!("Next: run `corral db-init` to create and migrate the database.");

    Ok(())
}

/// Execute the `corral db-init` command: create database and run migrations.
async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = CorralConfig::resolve(cli_db_url)?;

    println!("Initializing corral database...");

    if pool::ensure_database_exists(&resolved.db_config).await? {
        println!("Created database.");
    }
    let db_pool = pool::create_pool(&resolved.db_config).await?;
    pool::run_migrations(&db_pool).await?;

    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;

    println!("corral db-init complete.");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_url, force } => {
            cmd_init(&db_url, force)?;
        }
        Commands::DbInit => {
            cmd_db_init(cli.database_url.as_deref()).await?;
        }
        Commands::Serve {
            bind,
            port,
            cc_port,
        } => {
            let mut resolved = CorralConfig::resolve(cli.database_url.as_deref())?;
            if let Some(bind) = bind {
                resolved.server.bind = bind;
            }
            if let Some(port) = port {
                resolved.server.api_port = port;
                // A CLI api port moves the derived control port with it.
                if cc_port.is_none() {
                    resolved.server.cc_port = config::ServerSettings::default_cc_port(port)?;
                }
            }
            if let Some(cc_port) = cc_port {
                resolved.server.cc_port = cc_port;
            }
            let db_pool = pool::connect_with_retry(&resolved.db_config, 8).await?;
            let result = serve_cmd::run_serve(db_pool.clone(), resolved).await;
            db_pool.close().await;
            result?;
        }
        Commands::Pool { command } => {
            let resolved = CorralConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result =
                pool_cmds::run_pool_command(command, &db_pool, &resolved.token_config).await;
            db_pool.close().await;
            result?;
        }
        Commands::Agent { command } => {
            let resolved = CorralConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = agent_cmds::run_agent_command(command, &db_pool).await;
            db_pool.close().await;
            result?;
        }
        Commands::Workspace { command } => {
            let resolved = CorralConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result =
                workspace_cmds::run_workspace_command(command, &db_pool, &resolved.coordinator)
                    .await;
            db_pool.close().await;
            result?;
        }
        Commands::Task { command } => {
            let resolved = CorralConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result =
                task_cmds::run_task_command(command, &db_pool, &resolved.coordinator).await;
            db_pool.close().await;
            result?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod test_util {
    use std::sync::{Mutex, MutexGuard, PoisonError};

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    /// Serializes tests that touch process environment variables.
    pub fn lock_env() -> MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

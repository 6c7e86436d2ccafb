mod api;
mod auth;
mod config;
mod run_cmd;
mod serve_cmd;
mod status_cmd;

use anyhow::Context;
use clap::{Parser, Subcommand};

use weft_db::pool;

use config::WeftConfig;

#[derive(Parser)]
#[command(name = "weft", about = "Workflow execution engine")]
struct Cli {
    /// Database URL (overrides WEFT_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a weft config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/weft")]
        db_url: String,
        /// Node name recorded on instances this node runs
        #[arg(long, default_value = "localhost")]
        node_name: String,
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Create the weft database and run migrations
    DbInit,
    /// Validate a workflow XML file
    Validate {
        /// Path to the workflow XML file
        file: String,
    },
    /// Execute a workflow file to completion in-process (no daemon)
    Run {
        /// Path to the workflow XML file
        file: String,
        /// Launch parameters as name=value
        #[arg(long = "param", value_name = "NAME=VALUE")]
        params: Vec<String>,
        /// Give up after this many seconds
        #[arg(long, default_value_t = 3600)]
        timeout: u64,
    },
    /// Workflow template management
    Workflow {
        #[command(subcommand)]
        command: WorkflowCommands,
    },
    /// Show instance status (omit the id to list recent instances)
    Status {
        /// Instance id
        instance_id: Option<i64>,
    },
    /// Create or update an API user
    UserAdd {
        /// Login name
        login: String,
        /// Plain password (hashed before storage)
        #[arg(long)]
        password: String,
        /// Profile: ADMIN or USER
        #[arg(long, default_value = "USER")]
        profile: String,
    },
    /// Run the engine node: queues, scheduler, GC and the HTTP API
    Serve,
}

#[derive(Subcommand)]
enum WorkflowCommands {
    /// Store a workflow template from an XML file
    Create {
        /// Unique workflow name
        name: String,
        /// Path to the workflow XML file
        file: String,
        /// Workflow group label
        #[arg(long, default_value = "")]
        group: String,
        /// Free-form comment
        #[arg(long, default_value = "")]
        comment: String,
    },
    /// List stored workflows
    List,
    /// Delete a workflow and its schedules
    Delete {
        /// Workflow id
        id: i64,
    },
}

fn cmd_init(db_url: &str, node_name: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_string(),
        },
        node: config::NodeSection {
            name: node_name.to_string(),
            logs_dir: "/var/log/weft/tasks".to_string(),
            logs_keep: false,
            agent_path: None,
            plugins_dir: None,
        },
        api: config::ApiSection::default(),
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!("  node.name    = {node_name}");
    println!();
    println!("Next: run `weft db-init` to create and migrate the database.");

    Ok(())
}

async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = WeftConfig::resolve(cli_db_url)?;

    println!("Initializing weft database...");
    pool::ensure_database_exists(&resolved.db_config).await?;

    let db_pool = pool::create_pool(&resolved.db_config).await?;
    pool::run_migrations(&db_pool, pool::default_migrations_path()).await?;
    db_pool.close().await;

    println!("weft db-init complete.");
    Ok(())
}

fn cmd_validate(file: &str) -> anyhow::Result<()> {
    let xml = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read workflow file {file}"))?;
    match weft_core::workflow::Workflow::from_xml("validation", &xml) {
        Ok(workflow) => {
            println!(
                "OK: {} parameter(s), document is valid",
                workflow.parameter_names().len()
            );
            Ok(())
        }
        Err(e) => anyhow::bail!("invalid workflow: {e}"),
    }
}

async fn run_workflow_command(
    command: WorkflowCommands,
    db_pool: &sqlx::PgPool,
) -> anyhow::Result<()> {
    match command {
        WorkflowCommands::Create {
            name,
            file,
            group,
            comment,
        } => {
            let xml = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read workflow file {file}"))?;
            let id = weft_core::workflow::create(db_pool, &name, &xml, &group, &comment).await?;
            println!("Workflow {name} created with id {id}.");
        }
        WorkflowCommands::List => {
            let rows = weft_db::queries::workflows::list_workflows(db_pool).await?;
            if rows.is_empty() {
                println!("No workflows.");
            }
            for row in rows {
                println!(
                    "{:<6} {:<30} {}",
                    row.workflow_id, row.workflow_name, row.workflow_group
                );
            }
        }
        WorkflowCommands::Delete { id } => {
            weft_core::workflow::delete(db_pool, id).await?;
            println!("Workflow {id} deleted.");
        }
    }
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
        Commands::Init {
            db_url,
            node_name,
            force,
        } => {
            cmd_init(&db_url, &node_name, force)?;
        }
        Commands::DbInit => {
            cmd_db_init(cli.database_url.as_deref()).await?;
        }
        Commands::Validate { file } => {
            cmd_validate(&file)?;
        }
        Commands::Run {
            file,
            params,
            timeout,
        } => {
            run_cmd::run_workflow(&file, &params, timeout).await?;
        }
        Commands::Workflow { command } => {
            let resolved = WeftConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = run_workflow_command(command, &db_pool).await;
            db_pool.close().await;
            result?;
        }
        Commands::Status { instance_id } => {
            let resolved = WeftConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = status_cmd::run_status(&db_pool, instance_id).await;
            db_pool.close().await;
            result?;
        }
        Commands::UserAdd {
            login,
            password,
            profile,
        } => {
            let profile = profile.to_ascii_uppercase();
            if profile != "ADMIN" && profile != "USER" {
                anyhow::bail!("profile must be ADMIN or USER");
            }
            let resolved = WeftConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let hash = auth::hash_password(&login, &password);
            let result =
                weft_db::queries::users::upsert_user(&db_pool, &login, &hash, &profile).await;
            db_pool.close().await;
            result?;
            println!("User {login} stored.");
        }
        Commands::Serve => {
            let resolved = WeftConfig::resolve(cli.database_url.as_deref())?;
            serve_cmd::run_serve(&resolved).await?;
        }
    }

    Ok(())
}

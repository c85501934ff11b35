use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use servefirst::config::{AppConfig, RepositoryMode};
use servefirst::groups::GroupForm;
use servefirst::importer::DocumentImporter;
use servefirst::offline::PendingOp;
use servefirst::repository::WriteOutcome;
use servefirst::ServeFirst;

#[derive(Parser, Debug)]
#[clap(name = "servefirst", version)]
#[clap(about = "Theater group management from the command line", long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,

    /// Directory of the local store. Defaults to SERVEFIRST_DATA_DIR.
    #[clap(long)]
    data_dir: Option<PathBuf>,

    /// offline-first, cloud-only or local-only
    #[clap(long)]
    mode: Option<RepositoryMode>,

    /// Output debug logs to stderr
    #[clap(long)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the text of a .docx or .txt document
    Import { path: PathBuf },
    /// Manage your theater groups
    Groups {
        #[clap(subcommand)]
        command: GroupCommands,
    },
    /// Push pending offline changes to the cloud
    Sync,
    /// Show connectivity, session and pending changes
    Status,
    /// Sign in with email and password
    Login {
        #[clap(long)]
        email: String,
        /// Falls back to SERVEFIRST_PASSWORD
        #[clap(long)]
        password: Option<String>,
    },
    /// Sign out and forget the stored session
    Logout,
}

#[derive(Subcommand, Debug)]
enum GroupCommands {
    List,
    Create {
        title: String,
        #[clap(long)]
        description: Option<String>,
        #[clap(long)]
        location: Option<String>,
        /// Rehearsal day, repeatable (e.g. --day segunda --day quinta)
        #[clap(long = "day")]
        days: Vec<String>,
        /// YYYY-MM-DD
        #[clap(long)]
        presentation: Option<String>,
    },
    Delete { id: String },
}

fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn describe(outcome: WriteOutcome) -> &'static str {
    match outcome {
        WriteOutcome::Synced => "done",
        WriteOutcome::Queued => "saved locally, will sync when online",
    }
}

async fn connect(cli: &Cli) -> anyhow::Result<ServeFirst> {
    let mut config = AppConfig::from_env().context("missing ServeFirst configuration")?;
    if let Some(dir) = &cli.data_dir {
        config = config.with_data_dir(dir);
    }
    if let Some(mode) = cli.mode {
        config.options.mode = mode;
    }
    let app = ServeFirst::new(config).await?;
    app.monitor().check_now().await;
    app.auth().restore_session().await?;
    Ok(app)
}

async fn run() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.debug);

    // Importing needs neither the cloud nor a session.
    if let Commands::Import { path } = &cli.command {
        let text = DocumentImporter::new()
            .import_path(path)
            .await
            .with_context(|| format!("cannot import {}", path.display()))?;
        println!("{}", text);
        return Ok(());
    }

    let app = connect(&cli).await?;

    match &cli.command {
        Commands::Import { .. } => {}
        Commands::Login { email, password } => {
            let password = match password {
                Some(p) => p.clone(),
                None => std::env::var("SERVEFIRST_PASSWORD")
                    .context("pass --password or set SERVEFIRST_PASSWORD")?,
            };
            let user = app.auth().login(email, &password).await?;
            println!("Signed in as {} ({})", user.name, user.role);
        }
        Commands::Logout => {
            app.auth().logout().await?;
            println!("Signed out.");
        }
        Commands::Status => {
            let online = if app.connectivity().is_online() { "online" } else { "offline" };
            println!("Backend: {} ({})", app.config().base_url(), online);
            match app.auth().current_user() {
                Some(user) => println!("User: {} <{}> [{}]", user.name, user.email, user.role),
                None => println!("User: not signed in"),
            }
            let cache = servefirst::offline::OfflineCache::new(app.local_store().clone());
            for op in [PendingOp::Create, PendingOp::Update, PendingOp::Delete] {
                println!("Pending {}: {}", op, cache.pending(op).await?.len());
            }
        }
        Commands::Sync => {
            let report = app.sync().await?;
            if report.offline {
                println!("Offline; nothing was sent.");
            } else {
                println!(
                    "Created {}, updated {}, deleted {}.",
                    report.created.len(),
                    report.updated.len(),
                    report.deleted.len()
                );
                for mapping in &report.created {
                    println!("  {} -> {}", mapping.local_id, mapping.cloud_id);
                }
                for failure in &report.failures {
                    println!("  failed: {}", failure);
                }
                if !report.deferred.is_empty() {
                    println!("  waiting for creation: {}", report.deferred.join(", "));
                }
            }
        }
        Commands::Groups { command } => {
            let user = app.auth().require_user()?;
            match command {
                GroupCommands::List => {
                    for group in app.groups().my_groups(&user).await? {
                        let days: Vec<String> =
                            group.rehearsal_days.iter().map(|d| d.to_string()).collect();
                        println!("{}\t{}\t{}", group.id, group.title, days.join(", "));
                    }
                }
                GroupCommands::Create {
                    title,
                    description,
                    location,
                    days,
                    presentation,
                } => {
                    let form = GroupForm {
                        description: description.clone().unwrap_or_default(),
                        location: location.clone().unwrap_or_default(),
                        rehearsal_days: days.clone(),
                        presentation_date: presentation.clone().unwrap_or_default(),
                        ..GroupForm::new(title)
                    };
                    let group = app.groups().create(&user, form).await?;
                    println!("Created {} ({})", group.title, group.id);
                }
                GroupCommands::Delete { id } => {
                    let outcome = app.groups().remove(&user, id).await?;
                    println!("Deleted {}: {}", id, describe(outcome));
                }
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use rand::Rng;
use rand::distributions::Alphanumeric;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use lexdesk::config::Config;
use lexdesk::db::{CreateUserParams, Role, connect_from_config};
use lexdesk::email::{Mailer, sender_from_config};
use lexdesk::legal::audit::AuditLog;
use lexdesk::legal::normalize::{normalize_email, required_text};
use lexdesk::legal::reminders;
use lexdesk::settings::Settings;
use lexdesk::web::auth::{check_password_strength, hash_password};
use lexdesk::web::{AppState, start_server};

const GENERATED_PASSWORD_LEN: usize = 20;

#[derive(Parser, Debug)]
#[command(name = "lexdesk", version, about = "Practice management API for law firms")]
struct Cli {
    /// Settings file (TOML). Missing files fall back to defaults.
    #[arg(long, global = true, env = "LEXDESK_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the API server and the reminder worker (default).
    Serve,
    /// Apply database migrations and exit.
    Migrate,
    /// Create the first super admin account.
    BootstrapAdmin {
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
        /// Generated and printed once when omitted.
        #[arg(long, env = "LEXDESK_ADMIN_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    /// Print shell completions to stdout.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("lexdesk=info,tower_http=info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    let settings = Settings::load(path.map(PathBuf::as_path)).context("loading settings")?;
    Config::resolve(&settings).context("resolving configuration")
}

fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_PASSWORD_LEN)
        .map(char::from)
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    if let Some(Command::Completions { shell }) = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "lexdesk", &mut io::stdout());
        return Ok(());
    }

    init_tracing();
    let config = load_config(cli.config.as_ref())?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Migrate => {
            connect_from_config(&config.database)
                .await
                .context("running migrations")?;
            tracing::info!("migrations applied");
            Ok(())
        }
        Command::BootstrapAdmin {
            name,
            email,
            password,
        } => bootstrap_admin(&config, &name, &email, password).await,
        Command::Completions { .. } => Ok(()),
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    tracing::info!("lexdesk v{} starting", env!("CARGO_PKG_VERSION"));
    let db = connect_from_config(&config.database)
        .await
        .context("connecting to the database")?;

    let sender = sender_from_config(&config.email).context("configuring email")?;
    let mailer = Arc::new(
        Mailer::new(config.email.from.clone(), sender).context("loading email templates")?,
    );
    let audit = AuditLog::from_config(&config.audit);

    let state = Arc::new(AppState::new(&config, Arc::clone(&db), Arc::clone(&mailer), audit));
    let addr = config.server.socket_addr()?;
    let bound = start_server(addr, Arc::clone(&state)).await?;
    tracing::info!("serving on http://{}", bound);

    let (stop_tx, stop_rx) = watch::channel(false);
    let worker = config
        .reminders
        .enabled
        .then(|| reminders::spawn(db, mailer, config.reminders.clone(), stop_rx));

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutdown requested");

    let _ = stop_tx.send(true);
    state.shutdown().await;
    if let Some(worker) = worker
        && let Err(e) = worker.await
    {
        tracing::warn!("reminder worker ended abnormally: {}", e);
    }
    Ok(())
}

async fn bootstrap_admin(
    config: &Config,
    name: &str,
    email: &str,
    password: Option<String>,
) -> anyhow::Result<()> {
    let db = connect_from_config(&config.database)
        .await
        .context("connecting to the database")?;
    if db.count_users_with_role(Role::SuperAdmin).await? > 0 {
        bail!("a super admin already exists; sign in and create further accounts through the API");
    }

    let name = required_text("name", name).map_err(anyhow::Error::msg)?;
    let email = normalize_email(email).map_err(anyhow::Error::msg)?;
    let generated = password.is_none();
    let password = password.unwrap_or_else(generate_password);
    check_password_strength(&password)?;

    let user = db
        .create_user(&CreateUserParams {
            name,
            email,
            password_hash: hash_password(password.clone()).await?,
            role: Role::SuperAdmin,
            phone: None,
            title: None,
            is_active: true,
        })
        .await
        .context("creating the super admin")?;
    tracing::info!(user_id = %user.id, "super admin created");

    println!("Created super admin {} <{}>", user.name, user.email);
    if generated {
        println!("Generated password (shown once): {password}");
    }
    Ok(())
}

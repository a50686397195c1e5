//! realty - command line front-end for the realty marketplace API.
//!
//! Signs in, keeps the session between runs in the configured credential
//! store, and makes authenticated requests that renew the access token on
//! their own.
//!
//! ```bash
//! realty login --email buyer@example.com
//! realty whoami
//! realty request GET /favorites
//! realty request POST /properties --data '{"title": "Loft"}'
//! realty logout
//! ```

use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use realty_core::api::Method;
use realty_core::{
    auth, ApiRequest, AuthPhase, Config, CredentialBackend, SessionClient, SessionContext,
};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log file name inside `--log-dir`
const LOG_FILE_NAME: &str = "realty.log";

#[derive(Parser, Debug)]
#[command(name = "realty")]
#[command(about = "Session client for the realty marketplace API")]
#[command(version)]
struct Args {
    /// API base URL (overrides config and REALTY_API_URL)
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Where to keep the session: file, keyring or memory
    #[arg(long, global = true)]
    backend: Option<CredentialBackend>,

    /// Also write logs to a daily file in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sign in and store the session
    Login {
        #[arg(long)]
        email: Option<String>,
    },
    /// End the session and forget stored credentials
    Logout,
    /// Show whether a session is active
    Status,
    /// Fetch the signed-in user's profile
    Whoami,
    /// Force an access token refresh
    Refresh,
    /// Confirm an email address with the emailed code
    VerifyEmail {
        #[arg(long)]
        email: String,
        #[arg(long)]
        token: String,
    },
    /// Request a password reset email
    ForgotPassword {
        #[arg(long)]
        email: String,
    },
    /// Set a new password using the emailed reset code
    ResetPassword {
        #[arg(long)]
        email: String,
        #[arg(long)]
        token: String,
    },
    /// Make an authenticated request and print the response body
    Request {
        /// HTTP method (GET, POST, PUT, PATCH, DELETE)
        method: String,
        /// Path relative to the API base URL
        path: String,
        /// JSON request body
        #[arg(long)]
        data: Option<String>,
    },
}

/// Initialize the tracing subscriber for logging
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_NAME);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let args = Args::parse();
    let _log_guard = init_tracing(args.log_dir.as_deref());

    let mut config = Config::load().context("Failed to load configuration")?;
    if let Some(url) = args.api_url {
        config.api_base_url = url;
    }
    if let Some(backend) = args.backend {
        config.credential_backend = backend;
    }
    info!(api = %config.api_base_url, backend = ?config.credential_backend, "realty starting");

    let store = auth::open_credential_store(&config)?;
    let client = SessionClient::from_config(&config, SessionContext::new(store))
        .context("Failed to build HTTP client")?;

    run(args.command, &client, &config).await
}

async fn run(command: Command, client: &SessionClient, config: &Config) -> Result<()> {
    match command {
        Command::Login { email } => {
            let email = match email.or_else(|| config.last_email.clone()) {
                Some(email) => email,
                None => prompt("Email: ")?,
            };
            let password = rpassword::prompt_password("Password: ")?;

            let user = client.sign_in(&email, &password).await?;
            if let Err(e) = Config::remember_email(&email) {
                warn!(error = %e, "Could not save last email");
            }

            let name = user
                .as_ref()
                .and_then(|u| u.display_name())
                .unwrap_or(email);
            println!("Signed in as {}", name);
        }
        Command::Logout => {
            client.sign_out();
            println!("Signed out");
        }
        Command::Status => {
            let snapshot = client.session().snapshot();
            let phase = match client.phase() {
                AuthPhase::Anonymous => "anonymous",
                AuthPhase::Authenticated => "authenticated",
                AuthPhase::Refreshing => "refreshing",
            };
            println!("Session: {}", phase);
            println!("API: {}", config.api_base_url);
            if snapshot.is_authenticated {
                if let Some(email) = &config.last_email {
                    println!("Last sign-in: {}", email);
                }
            }
        }
        Command::Whoami => {
            let user = client.fetch_current_user().await?;
            println!("{}", serde_json::to_string_pretty(user.as_value())?);
        }
        Command::Refresh => match client.ensure_fresh_credential().await {
            Ok(_) => println!("Access token refreshed"),
            Err(e) => {
                client.force_logout();
                anyhow::bail!("Refresh failed, signed out: {}", e);
            }
        },
        Command::VerifyEmail { email, token } => {
            let result = client.verify_email(&email, &token).await?;
            let message = result.message.unwrap_or_else(|| {
                if result.success {
                    "Email verified".to_string()
                } else {
                    "Email could not be verified".to_string()
                }
            });
            println!("{}", message);
        }
        Command::ForgotPassword { email } => {
            client.forgot_password(&email).await?;
            println!("If {} has an account, a reset code is on its way", email);
        }
        Command::ResetPassword { email, token } => {
            client.verify_reset_token(&email, &token).await?;
            let password = rpassword::prompt_password("New password: ")?;
            let confirm = rpassword::prompt_password("Confirm new password: ")?;
            if password != confirm {
                anyhow::bail!("Passwords do not match");
            }
            client.reset_password(&email, &token, &password).await?;
            println!("Password updated; sign in with the new password");
        }
        Command::Request { method, path, data } => {
            let method = method
                .to_ascii_uppercase()
                .parse::<Method>()
                .with_context(|| format!("Invalid HTTP method: {}", method))?;
            let mut request = ApiRequest::new(method, path);
            if let Some(data) = data {
                let body: serde_json::Value =
                    serde_json::from_str(&data).context("--data is not valid JSON")?;
                request = request.json_value(body);
            }

            let response = client.request(request).await?;
            match response.json::<serde_json::Value>() {
                Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                Err(_) => println!("{}", response.text()),
            }
        }
    }
    Ok(())
}

fn prompt(label: &str) -> Result<String> {
    use std::io::Write;

    eprint!("{}", label);
    io::stderr().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    let value = line.trim().to_string();
    if value.is_empty() {
        anyhow::bail!("{} is required", label.trim_end_matches(": "));
    }
    Ok(value)
}

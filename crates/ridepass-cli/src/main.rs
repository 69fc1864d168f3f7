//! ridepass - drive an authentication session from the terminal.
//!
//! Signs in against the configured provider, persists the session in the
//! configured store, and exposes the session lifecycle (status, refresh,
//! logout) plus a few token diagnostics.

mod config;

use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ridepass_core::provider::{
    HttpCredentialProvider, HttpProviderConfig, MockCredentialProvider,
};
use ridepass_core::session::{SessionSettings, SessionWarning};
use ridepass_core::store::keychain::DEFAULT_SERVICE_NAME;
use ridepass_core::store::{FileTokenStore, KeyringTokenStore, MemoryTokenStore};
use ridepass_core::{
    token, AuthInterceptor, AuthorizedClient, Claims, CredentialProvider, InterceptorSettings,
    Registration, Role, SessionManager, SessionPhase, TokenCodec, TokenStore,
};

use config::{Config, ProviderKind, StoreBackend};

const USAGE: &str = "\
Usage: ridepass <command> [args]

Commands:
  login [email]                        Sign in (prompts for the password)
  register <email> <phone> <role> [name]
                                       Create an account; role is client or driver
  status                               Restore the stored session and show it
  refresh                              Exchange the refresh token for a new pair
  logout                               Sign out and clear stored credentials
  token                                Show the stored token claims
  decode <token>                       Show the claims of any token (no verification)
  get <path>                           GET an API path with the session's token
  config                               Show the active configuration

Logging goes to stderr; set RUST_LOG (e.g. RUST_LOG=ridepass_core=debug).";

/// Rolling log file name inside `log_dir`.
const LOG_FILE_PREFIX: &str = "ridepass.log";

/// Initialize the tracing subscriber for logging.
///
/// The returned guard flushes the file log on drop and must live until exit.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    // RUST_LOG controls the level; default keeps the CLI quiet.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
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

    let mut config = Config::load()?;
    let _log_guard = init_tracing(config.log_dir.as_deref());

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        println!("{}", USAGE);
        return Ok(());
    };
    let rest = &args[1..];

    match command {
        "help" | "-h" | "--help" => {
            println!("{}", USAGE);
            return Ok(());
        }
        "config" => return show_config(&config),
        "decode" => return decode(rest),
        _ => {}
    }

    let session = build_session(&config).await?;
    info!(command, provider = ?config.provider, store = ?config.store, "ridepass starting");

    match command {
        "login" => login(&session, &mut config, rest).await,
        "register" => register(&session, &mut config, rest).await,
        "status" => status(&session).await,
        "refresh" => refresh(&session).await,
        "logout" => {
            session.logout().await;
            println!("Signed out.");
            Ok(())
        }
        "token" => show_tokens(&session, &config).await,
        "get" => get(&session, &config, rest).await,
        other => bail!("Unknown command '{}'\n\n{}", other, USAGE),
    }
}

// ============================================================================
// Wiring
// ============================================================================

async fn build_store(config: &Config) -> Result<Arc<dyn TokenStore>> {
    let store: Arc<dyn TokenStore> = match config.store {
        StoreBackend::Memory => Arc::new(MemoryTokenStore::new()),
        StoreBackend::File => Arc::new(FileTokenStore::new(config.data_dir()?)),
        StoreBackend::Encrypted => {
            let passphrase = Config::passphrase()
                .context("RIDEPASS_PASSPHRASE must be set to use the encrypted store")?;
            let store = FileTokenStore::encrypted(config.data_dir()?, &passphrase)
                .await
                .context("Failed to open encrypted token store")?;
            Arc::new(store)
        }
        StoreBackend::Keyring => Arc::new(KeyringTokenStore::new(DEFAULT_SERVICE_NAME)),
    };
    Ok(store)
}

fn build_provider(config: &Config) -> Result<Arc<dyn CredentialProvider>> {
    let provider: Arc<dyn CredentialProvider> = match config.provider {
        ProviderKind::Mock => Arc::new(
            MockCredentialProvider::new(TokenCodec::new(config.token_secret()))
                .with_demo_accounts(),
        ),
        ProviderKind::Http => {
            let base_url = config
                .base_url
                .as_deref()
                .context("The HTTP provider needs base_url (or RIDEPASS_BASE_URL)")?;
            let http = HttpProviderConfig::new(base_url)
                .with_timeout(Duration::from_secs(config.request_timeout_secs));
            Arc::new(HttpCredentialProvider::new(http).context("Failed to build HTTP client")?)
        }
    };
    Ok(provider)
}

async fn build_session(config: &Config) -> Result<SessionManager> {
    let store = build_store(config).await?;
    let provider = build_provider(config)?;
    let settings = SessionSettings::default()
        .with_request_timeout(Duration::from_secs(config.request_timeout_secs));

    let mut builder = SessionManager::builder(provider, store)
        .policy(config.refresh_policy.into_policy())
        .settings(settings);
    // Without a shared secret, expiry comes from the decoded claims alone.
    if config.provider == ProviderKind::Mock || config.token_secret.is_some() {
        builder = builder.codec(TokenCodec::new(config.token_secret()));
    }
    Ok(builder.build())
}

fn interceptor_settings(config: &Config) -> InterceptorSettings {
    InterceptorSettings::default()
        .with_request_timeout(Duration::from_secs(config.request_timeout_secs))
        .with_expiry_leeway(config.expiry_leeway_secs)
}

// ============================================================================
// Commands
// ============================================================================

async fn login(session: &SessionManager, config: &mut Config, args: &[String]) -> Result<()> {
    let email = match args.first().cloned().or_else(|| config.last_email.clone()) {
        Some(email) => email,
        None => prompt("Email: ")?,
    };
    let password = rpassword::prompt_password(format!("Password for {}: ", email))
        .context("Failed to read password")?;

    let principal = session
        .login(&email, &password)
        .await
        .context("Sign-in failed")?;
    println!("Signed in as {} ({})", principal.display_name(), principal.role);

    config.last_email = Some(email);
    if let Err(e) = config.save() {
        debug!(error = %e, "Could not remember last email");
    }
    Ok(())
}

async fn register(session: &SessionManager, config: &mut Config, args: &[String]) -> Result<()> {
    let [email, phone, role, name @ ..] = args else {
        bail!("register needs <email> <phone> <role> [name]\n\n{}", USAGE);
    };
    let role = parse_role(role)?;
    let name = (!name.is_empty()).then(|| name.join(" "));
    let registration = Registration {
        email: email.clone(),
        phone: phone.clone(),
        role,
        name,
    };
    registration
        .validate()
        .map_err(|msg| anyhow::anyhow!(msg))?;

    let password = rpassword::prompt_password("Choose a password: ")
        .context("Failed to read password")?;
    let confirm =
        rpassword::prompt_password("Repeat password: ").context("Failed to read password")?;
    if password != confirm {
        bail!("Passwords do not match");
    }

    let principal = session
        .register(&registration, &password)
        .await
        .context("Registration failed")?;
    println!(
        "Registered and signed in as {} ({}, id {})",
        principal.display_name(),
        principal.role,
        principal.user_id
    );

    config.last_email = Some(registration.email);
    if let Err(e) = config.save() {
        debug!(error = %e, "Could not remember last email");
    }
    Ok(())
}

async fn status(session: &SessionManager) -> Result<()> {
    let phase = session.initialize().await;
    let state = session.state();

    match (phase, state.principal.as_ref()) {
        (SessionPhase::Authenticated, Some(principal)) => {
            println!("Signed in as {} <{}>", principal.display_name(), principal.email);
            println!("  role:    {}", principal.role);
            println!("  user id: {}", principal.user_id);
            println!("  phone:   {}", principal.phone);
        }
        _ => println!("Not signed in."),
    }

    if let Some(SessionWarning::StaleSession { reason }) = &state.warning {
        println!("  warning: {}", reason);
    }
    if let Some(pair) = session.tokens().await {
        if let Some(claims) = token::decode(&pair.access_token) {
            println!("  access token {}", describe_expiry(&claims));
        }
    }
    Ok(())
}

async fn refresh(session: &SessionManager) -> Result<()> {
    if session.initialize().await != SessionPhase::Authenticated {
        bail!("Not signed in");
    }
    if session.refresh().await {
        println!("Tokens refreshed.");
        Ok(())
    } else if session.is_authenticated() {
        bail!("Refresh failed; the current session was kept")
    } else {
        bail!("Refresh failed and the session has ended; sign in again")
    }
}

async fn show_tokens(session: &SessionManager, config: &Config) -> Result<()> {
    let Some(pair) = session.tokens().await else {
        println!("No stored tokens.");
        return Ok(());
    };
    let codec = (config.provider == ProviderKind::Mock || config.token_secret.is_some())
        .then(|| TokenCodec::new(config.token_secret()));

    for (label, raw) in [("access", &pair.access_token), ("refresh", &pair.refresh_token)] {
        println!("{} token:", label);
        match token::decode(raw) {
            Some(claims) => print_claims(&claims)?,
            None => println!("  (not a decodable token)"),
        }
        if let Some(codec) = &codec {
            match codec.verify(raw) {
                Ok(_) => println!("  signature: valid"),
                Err(e) => println!("  signature: {}", e),
            }
        }
    }
    Ok(())
}

fn decode(args: &[String]) -> Result<()> {
    let raw = args.first().context("decode needs a token")?;
    let claims = token::decode(raw).context("Not a decodable token")?;
    print_claims(&claims)
}

async fn get(session: &SessionManager, config: &Config, args: &[String]) -> Result<()> {
    let path = args.first().context("get needs an API path")?;
    let base_url = config
        .base_url
        .as_deref()
        .context("get needs base_url (or RIDEPASS_BASE_URL)")?;

    session.initialize().await;
    let interceptor = AuthInterceptor::with_settings(session.clone(), interceptor_settings(config));
    let client = AuthorizedClient::new(base_url, interceptor)?;
    let body: serde_json::Value = client
        .get_json(path)
        .await
        .with_context(|| format!("GET {} failed", path))?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

fn show_config(config: &Config) -> Result<()> {
    println!("# {}", Config::config_path()?.display());
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let value = line.trim().to_string();
    if value.is_empty() {
        bail!("No input given");
    }
    Ok(value)
}

fn parse_role(value: &str) -> Result<Role> {
    match value.to_ascii_lowercase().as_str() {
        "client" | "rider" => Ok(Role::Client),
        "driver" => Ok(Role::Driver),
        other => bail!("Unknown role '{}' (expected client or driver)", other),
    }
}

fn print_claims(claims: &Claims) -> Result<()> {
    for line in serde_json::to_string_pretty(claims)?.lines() {
        println!("  {}", line);
    }
    println!("  {}", describe_expiry(claims));
    Ok(())
}

fn describe_expiry(claims: &Claims) -> String {
    let now = token::now_unix();
    let when = DateTime::<Utc>::from_timestamp(claims.expires_at, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| claims.expires_at.to_string());
    let remaining = claims.expires_at - now;
    if claims.is_expired_at(now) {
        format!("expired at {} ({}s ago)", when, -remaining)
    } else {
        format!("expires at {} (in {}s)", when, remaining)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ridepass_core::models::Principal;
    use ridepass_core::TokenKind;

    fn claims(expires_in: i64) -> Claims {
        let principal = Principal {
            user_id: "client-0001".to_string(),
            email: "rider@ridepass.dev".to_string(),
            role: Role::Client,
            phone: "5550100001".to_string(),
            name: None,
        };
        let now = token::now_unix();
        Claims::new(&principal, TokenKind::Access, now, now + expires_in)
    }

    #[test]
    fn test_parse_role() {
        assert_eq!(parse_role("Driver").unwrap(), Role::Driver);
        assert_eq!(parse_role("rider").unwrap(), Role::Client);
        assert!(parse_role("dispatcher").is_err());
    }

    #[test]
    fn test_describe_expiry() {
        assert!(describe_expiry(&claims(600)).starts_with("expires at"));
        assert!(describe_expiry(&claims(-600)).starts_with("expired at"));
    }
}

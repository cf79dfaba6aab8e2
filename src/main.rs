//!
//! galley CLI binary
//! -----------------
//! Signs in to the kitchen labeling platform and runs authenticated requests.
//! The session is kept in `GALLEY_SESSION_FILE` between invocations, so
//! `galley login ...` followed by `galley allergens` reuses (and refreshes)
//! the same token.

use std::collections::HashMap;
use std::env;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use galley::api::ApiClient;
use galley::config::Config;
use galley::error::AppError;
use galley::identity::{HttpIssuer, LoginRequest, SessionManager, SignupRequest};
use galley::storage::FileStore;

const VALUE_FLAGS: [&str; 6] = ["--api", "--tenant", "--first", "--last", "--phone", "--plan"];

fn print_usage(program: &str) {
    eprintln!(
        "Usage:\n  {program} [--api <url>] <command> [args]\n\nCommands:\n  lookup <email>                               find the company an email belongs to\n  login <email> <password> [--tenant <id>]     sign in (looks up the company when --tenant is omitted)\n  signup <email> <password> <company> [--first <name>] [--last <name>] [--phone <p>] [--plan <plan>]\n                                               register a company and its first user\n  whoami                                       fetch the signed-in user from the server\n  status                                       show the local session without network calls\n  get <path>                                   authenticated GET, prints the normalized JSON\n  allergens                                    list allergens with estimated severity\n  check <ingredient>                           list allergens found in an ingredient\n  password <current> <new>                     change the signed-in user's password\n  logout                                       end the session\n  help                                         show this help\n\nFlags:\n  --api <url>      API base (default from GALLEY_API_BASE, else http://localhost:3006/api/v1)\n  -h, --help       Show this help\n\nEnvironment:\n  GALLEY_SESSION_FILE, GALLEY_REFRESH_BUFFER_SECS, GALLEY_MISSING_EXP, GALLEY_HTTP_TIMEOUT_SECS, RUST_LOG"
    );
}

struct Invocation {
    command: String,
    positional: Vec<String>,
    flags: HashMap<String, String>,
}

fn parse_args(program: &str, args: Vec<String>) -> Invocation {
    let mut positional = Vec::new();
    let mut flags = HashMap::new();
    let mut i = 0;
    while i < args.len() {
        let a = args[i].as_str();
        if VALUE_FLAGS.contains(&a) {
            if i + 1 >= args.len() {
                eprintln!("{a} requires a value");
                print_usage(program);
                std::process::exit(2);
            }
            flags.insert(a.trim_start_matches('-').to_string(), args[i + 1].clone());
            i += 2;
            continue;
        }
        if a == "-h" || a == "--help" {
            print_usage(program);
            std::process::exit(0);
        }
        positional.push(args[i].clone());
        i += 1;
    }
    let command = if positional.is_empty() { "help".to_string() } else { positional.remove(0) };
    Invocation { command, positional, flags }
}

fn arg<'a>(inv: &'a Invocation, idx: usize, name: &str) -> Result<&'a str> {
    inv.positional
        .get(idx)
        .map(String::as_str)
        .ok_or_else(|| anyhow!("{} requires <{}>", inv.command, name))
}

fn print_json<T: serde::Serialize>(v: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}

async fn run(inv: &Invocation, session: &SessionManager, api: &ApiClient) -> Result<()> {
    match inv.command.as_str() {
        "lookup" => {
            let tenant = session.lookup_tenant(arg(inv, 0, "email")?).await?;
            println!("{}\t{}", tenant.id, tenant.label());
        }
        "login" => {
            let email = arg(inv, 0, "email")?;
            let mut req = LoginRequest::new(email, arg(inv, 1, "password")?);
            match inv.flags.get("tenant") {
                Some(t) => req = req.with_tenant(t.clone()),
                None => match session.lookup_tenant(email).await {
                    Ok(t) => info!(target: "galley", "signing in to {}", t.label()),
                    Err(AppError::Remote { status: 404, .. }) => {}
                    Err(e) => return Err(e.into()),
                },
            }
            let identity = session.login(&req).await?;
            let tenant = session.tenant().map(|t| t.label().to_string()).unwrap_or_default();
            println!("signed in as {} {}", identity.user_id, tenant);
        }
        "signup" => {
            let password = arg(inv, 1, "password")?.to_string();
            let req = SignupRequest {
                email: arg(inv, 0, "email")?.to_string(),
                confirm_password: password.clone(),
                password,
                company_name: arg(inv, 2, "company")?.to_string(),
                first_name: inv.flags.get("first").cloned().unwrap_or_default(),
                last_name: inv.flags.get("last").cloned().unwrap_or_default(),
                phone: inv.flags.get("phone").cloned().unwrap_or_default(),
                subscription_plan: inv.flags.get("plan").cloned().unwrap_or_default(),
            };
            let identity = session.signup(&req).await?;
            println!("registered and signed in as {}", identity.user_id);
        }
        "whoami" => print_json(&api.current_user().await?)?,
        "status" => {
            println!("state: {}", session.state().name());
            if let Some(id) = session.identity() {
                println!("user: {}", id.user_id);
                println!("role: {}", id.role.as_deref().unwrap_or("-"));
            }
            if let Some(t) = session.tenant() {
                println!("tenant: {} ({})", t.label(), t.id);
            }
        }
        "get" => print_json(&api.get::<serde_json::Value>(arg(inv, 0, "path")?).await?)?,
        "allergens" => {
            for a in api.allergens().await? {
                println!("{:<8} {:<24} {}", a.severity, a.name, a.related_ingredients.join(", "));
            }
        }
        "check" => {
            let check = api.check_ingredient(arg(inv, 0, "ingredient")?).await?;
            if check.allergens.is_empty() {
                println!("{}: no known allergens", check.ingredient);
            } else {
                println!("{}: {}", check.ingredient, check.allergens.join(", "));
            }
        }
        "password" => {
            api.update_password(arg(inv, 0, "current")?, arg(inv, 1, "new")?).await?;
            println!("password updated");
        }
        "logout" => {
            session.logout().await;
            println!("signed out");
        }
        "help" => print_usage("galley"),
        other => return Err(anyhow!("unknown command '{}'; try 'galley help'", other)),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Init logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let mut args: Vec<String> = env::args().collect();
    let program = args.remove(0);
    let inv = parse_args(&program, args);

    let mut cfg = Config::load();
    if let Some(api) = inv.flags.get("api") {
        cfg = cfg.with_api_base(api)?;
    }
    info!(
        target: "galley",
        "galley starting: api_base='{}', session_file='{}', refresh_buffer={}s",
        cfg.api_base, cfg.session_file.display(), cfg.expiry.buffer_secs
    );

    let store = FileStore::open(&cfg.session_file)
        .with_context(|| format!("cannot open session file {}", cfg.session_file.display()))?;
    let http = cfg.http_client()?;
    let issuer = Arc::new(HttpIssuer::new(cfg.api_base.clone(), http.clone()));
    let session = SessionManager::new(Arc::new(store), issuer, cfg.expiry);
    session.restore()?;
    let api = ApiClient::new(session.clone(), http, cfg.api_base.clone());

    if let Err(e) = run(&inv, &session, &api).await {
        match e.downcast_ref::<AppError>() {
            Some(app) => eprintln!("{}", app.user_message()),
            None => eprintln!("{e}"),
        }
        std::process::exit(1);
    }
    Ok(())
}

mod alert;
mod commands;
mod config;
mod daemon;
mod sync;
mod token_provider;

use std::sync::Arc;

use time::OffsetDateTime;

use config::Config;
use daemon::Coordinator;
use sync::timetravel::parse_time_spec;

fn usage() {
    println!("cloudsnap: continuous encrypted backup into a versioned object store");
    println!();
    println!("usage: cloudsnap [--at TIME] COMMAND [GLOB...]");
    println!();
    println!("commands:");
    println!("  watch            run the backup daemon (SIGINT backs up now, SIGQUIT quits)");
    println!("  save PATH...     back up the named paths once and exit");
    println!("  list [GLOB...]   show archived records and their revisions");
    println!("  cat [GLOB...]    print archived content to stdout");
    println!("  diff [GLOB...]   compare archived content against local files");
    println!("  restore GLOB...  overwrite local files with archived content");
    println!("  quota            show store usage");
    println!("  auth             acquire the refresh token interactively");
    println!();
    println!("--at takes a duration ago (45m, 2h45m, 3d) or an absolute time");
    println!("(2024, 2024-03-05, 2024-03-05T12:30) and applies to cat, diff");
    println!("and restore.");
    println!();
    println!("configuration comes from the environment (or a .env file):");
    println!("CLOUDSNAP_DIR, CLOUDSNAP_PARENT, CLOUDSNAP_PROFILE, CLOUDSNAP_IGNORE,");
    println!("CLOUDSNAP_PASSWORD, CLOUDSNAP_SIZE_LIMIT_MB, CLOUDSNAP_CYCLE_SECS,");
    println!("CLOUDSNAP_WARN_CMD, CLOUDSNAP_CLIENT_ID, CLOUDSNAP_CLIENT_SECRET,");
    println!("CLOUDSNAP_REFRESH_TOKEN, CLOUDSNAP_STORE_URL, CLOUDSNAP_AUTH_URL.");
}

#[derive(Debug, PartialEq, Eq)]
struct CliArgs {
    command: String,
    at: Option<String>,
    args: Vec<String>,
}

/// Hand-rolled argument parsing; the surface is one command, one optional
/// flag and a list of globs. Returns `None` when help was asked for.
fn parse_cli<I>(argv: I) -> anyhow::Result<Option<CliArgs>>
where
    I: IntoIterator<Item = String>,
{
    let mut argv = argv.into_iter().skip(1);
    let mut command = None;
    let mut at = None;
    let mut args = Vec::new();
    while let Some(arg) = argv.next() {
        if arg == "-h" || arg == "--help" || arg == "help" {
            return Ok(None);
        }
        if arg == "--at" || arg == "-t" {
            let value = argv
                .next()
                .ok_or_else(|| anyhow::anyhow!("{arg} needs a value"))?;
            at = Some(value);
            continue;
        }
        if let Some(value) = arg.strip_prefix("--at=") {
            at = Some(value.to_string());
            continue;
        }
        if arg.starts_with('-') && command.is_none() {
            anyhow::bail!("unrecognized flag {arg:?}");
        }
        match command {
            None => command = Some(arg),
            Some(_) => args.push(arg),
        }
    }
    let Some(command) = command else {
        return Ok(None);
    };
    Ok(Some(CliArgs { command, at, args }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let Some(cli) = parse_cli(std::env::args())? else {
        usage();
        return Ok(());
    };
    let config = Arc::new(Config::from_env()?);
    let at = match &cli.at {
        Some(spec) => Some(parse_time_spec(spec, OffsetDateTime::now_utc())?),
        None => None,
    };

    match cli.command.as_str() {
        "watch" => {
            anyhow::ensure!(cli.args.is_empty(), "watch takes no arguments");
            Coordinator::bootstrap(config).await?.run().await
        }
        "save" => commands::save(&config, &cli.args).await,
        "list" => commands::list(&config, &cli.args).await,
        "cat" => commands::cat(&config, at.as_deref(), &cli.args).await,
        "diff" => commands::diff(&config, at.as_deref(), &cli.args).await,
        "restore" => commands::restore(&config, at.as_deref(), &cli.args).await,
        "quota" => commands::quota(&config).await,
        "auth" => commands::auth(&config).await,
        other => {
            usage();
            anyhow::bail!("unrecognized command {other:?}")
        }
    }
}

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use pintuxx_launcher::commands;
use pintuxx_launcher::config::LauncherConfig;
use pintuxx_launcher::logging;
use pintuxx_launcher::models::{CatalogSource, DownloadEvent};
use pintuxx_launcher::services::{PendingUpdate, UpdateCheck};
use pintuxx_launcher::utils::paths::resolve_root_dir;
use pintuxx_launcher::AppState;

#[derive(Debug, Parser)]
#[command(name = "pintuxx-launcher", version, about = "Headless Pintuxx game launcher")]
struct Cli {
    /// Launcher root (config, install tree, logs)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Mirror the log to stderr
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Debug, Subcommand)]
enum CliCommand {
    /// List the catalog
    Catalog,
    /// Download and install titles by catalog id or name
    Install { titles: Vec<String> },
    /// Remove an installed version
    Uninstall { title: String, version: String },
    /// List installed titles and versions
    List,
    /// Check the update server for a newer launcher
    CheckUpdate,
    /// Download, verify and apply a launcher update
    Update {
        /// Skip the confirmation prompt
        #[arg(long, short)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("error: {message}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), String> {
    let root = cli.root.unwrap_or_else(resolve_root_dir);
    let config = LauncherConfig::load(&root).map_err(|err| err.to_string())?;
    logging::init(&config.log_dir(&root), cli.verbose).map_err(|err| err.to_string())?;

    let (state, events) = AppState::bootstrap(config, &root).map_err(|err| err.to_string())?;

    match commands::complete_pending_update(&state).await {
        Ok(PendingUpdate::Applied { version }) => println!("Launcher updated to {version}"),
        Ok(PendingUpdate::SwapIncomplete {
            staged_version, ..
        }) => eprintln!("warning: update to {staged_version} was not applied"),
        Ok(PendingUpdate::Nothing) => {}
        Err(err) => tracing::warn!("pending update check failed: {}", err),
    }

    let result = match cli.command {
        CliCommand::Catalog => {
            notify_background_update(&state).await;
            show_catalog(&state).await
        }
        CliCommand::Install { titles } => install(&state, events, &titles).await,
        CliCommand::Uninstall { title, version } => {
            match commands::uninstall(&state, &title, &version).await? {
                true => println!("Removed {title} {version}"),
                false => println!("{title} {version} is not installed"),
            }
            Ok(())
        }
        CliCommand::List => {
            notify_background_update(&state).await;
            show_installed(&state)
        }
        CliCommand::CheckUpdate => match commands::check_for_update(&state, true).await? {
            UpdateCheck::Available(notice) => {
                println!("{}", notice.prompt_text());
                Ok(())
            }
            UpdateCheck::UpToDate { current } => {
                println!("You have the latest version ({current})");
                Ok(())
            }
            UpdateCheck::Skipped => Ok(()),
        },
        CliCommand::Update { yes } => update(&state, yes).await,
    };

    state.scheduler.shutdown().await;
    result
}

async fn show_catalog(state: &AppState) -> Result<(), String> {
    let fetch = commands::fetch_catalog(state).await?;
    if let CatalogSource::Cached { last_update } = fetch.source {
        println!("(offline, showing catalog cached at {last_update})");
    }
    for (id, entry) in &fetch.catalog.games {
        let marker = if state.installed.is_installed(&entry.name, &entry.version) {
            "[installed]"
        } else {
            ""
        };
        println!(
            "{id:<12} {} {} ({} MB) {marker}",
            entry.name, entry.version, entry.file_size
        );
    }
    Ok(())
}

fn show_installed(state: &AppState) -> Result<(), String> {
    let installed = commands::list_installed(state)?;
    if installed.is_empty() {
        println!("No titles installed");
    }
    for (title, versions) in installed {
        let versions: Vec<String> = versions.into_iter().collect();
        println!("{title}: {}", versions.join(", "));
    }
    Ok(())
}

async fn install(
    state: &AppState,
    mut events: mpsc::UnboundedReceiver<DownloadEvent>,
    titles: &[String],
) -> Result<(), String> {
    let fetch = commands::fetch_catalog(state).await?;
    let mut pending = 0;
    for title in titles {
        let entry = fetch
            .catalog
            .get(title)
            .or_else(|| fetch.catalog.find_by_name(title))
            .cloned()
            .ok_or_else(|| format!("{title} is not in the catalog"))?;
        if commands::enqueue_install(state, entry.clone())? {
            pending += 1;
        } else {
            println!("{} {} is already installed or queued", entry.name, entry.version);
        }
    }

    let mut failures = 0;
    while pending > 0 {
        let Some(event) = events.recv().await else {
            break;
        };
        match event {
            DownloadEvent::Queued { title, version } => println!("{title} {version}: queued"),
            DownloadEvent::StateChanged { title, state } => println!("{title}: {state}"),
            DownloadEvent::Progress { title, percent } => {
                print!("\r{title}: {percent:>3}%");
                let _ = io::stdout().flush();
                if percent == 100 {
                    println!();
                }
            }
            DownloadEvent::Finished {
                title,
                version,
                state,
                message,
            } => {
                pending -= 1;
                match message {
                    Some(message) => {
                        failures += 1;
                        println!("{title} {version}: {state}: {message}");
                    }
                    None => println!("{title} {version}: {state}"),
                }
            }
            DownloadEvent::RefreshRequested => {}
        }
    }

    if failures > 0 {
        return Err(format!("{failures} install(s) failed"));
    }
    Ok(())
}

async fn update(state: &AppState, yes: bool) -> Result<(), String> {
    let notice = match commands::check_for_update(state, true).await? {
        UpdateCheck::Available(notice) => notice,
        UpdateCheck::UpToDate { current } => {
            println!("You have the latest version ({current})");
            return Ok(());
        }
        UpdateCheck::Skipped => return Ok(()),
    };

    println!("{}", notice.prompt_text());
    if !yes && !confirm()? {
        return Ok(());
    }

    let exit = state.updater.subscribe_exit();
    commands::perform_update(state, notice.manifest).await?;
    if *exit.borrow() {
        println!("Update downloaded! Launcher will restart to apply update.");
    }
    Ok(())
}

fn confirm() -> Result<bool, String> {
    print!("[y/N] ");
    io::stdout().flush().map_err(|err| err.to_string())?;
    let mut answer = String::new();
    io::stdin()
        .lock()
        .read_line(&mut answer)
        .map_err(|err| err.to_string())?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

async fn notify_background_update(state: &AppState) {
    if let Ok(UpdateCheck::Available(notice)) = commands::check_for_update(state, false).await {
        println!(
            "Launcher {} is available (current {}); run `update` to install it.",
            notice.manifest.version, notice.current
        );
    }
}

mod baseline;
mod cli;
mod config;
mod converter;
mod detector;
mod document;
mod frontmatter;
mod indexer;
mod merge;
mod remote;
mod rest;
mod state;
mod surgical;
mod sync;
mod types;

use clap::Parser;
use cli::Cli;
use config::{Config, Credentials, SpaceConfig, SyncDirs};
use converter::DocConverter;
use detector::ForceMode;
use remote::{BackoffGate, RetryShell};
use rest::RestRemote;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use sync::{SyncEngine, SyncOptions};
use types::SyncError;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_logging(&cli) {
        eprintln!("error: {}", e);
        return ExitCode::from(1);
    }

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("error: {}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

fn init_logging(cli: &Cli) -> Result<(), SyncError> {
    let level = match cli.verbosity {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        _ => tracing::Level::DEBUG,
    };

    match &cli.logdir {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|e| SyncError::fs("create_dir", dir, e))?;
            let name = format!(
                "confluence-sync-{}.log",
                chrono::Local::now().format("%Y%m%d-%H%M%S")
            );
            let path = dir.join(name);
            let file = std::fs::File::create(&path)
                .map_err(|e| SyncError::fs("create", &path, e))?;
            tracing_subscriber::fmt()
                .with_max_level(level)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_max_level(level)
                .with_ansi(!cli.no_color)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<u8, SyncError> {
    let dirs = SyncDirs::new(".");

    if let Some(spec) = &cli.init {
        let local_path = cli.file.clone().ok_or_else(|| SyncError::Config {
            path: PathBuf::from("--init"),
            reason: "usage: confluence-sync --init \"SPACE:Path\" LOCAL_PATH".to_string(),
        })?;
        init_workspace(&dirs, spec, local_path).await?;
        return Ok(0);
    }

    let config = Config::load(&dirs)?;
    let credentials = Credentials::from_env()?;
    let api = Arc::new(RestRemote::new(&credentials)?);
    let shell = RetryShell::new(Arc::new(BackoffGate::new()));
    let engine = SyncEngine::new(api, DocConverter::from_env(), shell, dirs, config);

    let cancel = engine.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("interrupt: finishing in-flight calls, then stopping");
            cancel.store(true, Ordering::SeqCst);
        }
    });

    let opts = SyncOptions {
        dry_run: cli.dry_run,
        force: if cli.force_push {
            ForceMode::Push
        } else if cli.force_pull {
            ForceMode::Pull
        } else {
            ForceMode::None
        },
        single_file: cli.file.clone(),
    };

    let report = engine.run(&opts).await;

    for error in &report.errors {
        eprintln!("warning: {}", error);
    }
    if let Some(fatal) = &report.fatal {
        eprintln!("error: {}", fatal);
    } else if !opts.dry_run {
        println!("{}", report.summary());
    }
    Ok(report.exit_code())
}

async fn init_workspace(
    dirs: &SyncDirs,
    spec: &str,
    local_path: PathBuf,
) -> Result<(), SyncError> {
    let (space_key, title_path) = spec.split_once(':').ok_or_else(|| SyncError::Config {
        path: PathBuf::from("--init"),
        reason: format!("'{}' is not of the form SPACE:Path", spec),
    })?;
    if space_key.trim().is_empty() {
        return Err(SyncError::Config {
            path: PathBuf::from("--init"),
            reason: "the space key before ':' must not be empty".to_string(),
        });
    }

    let credentials = Credentials::from_env()?;
    let api = RestRemote::new(&credentials)?;
    let shell = RetryShell::new(Arc::new(BackoffGate::new()));
    let parent_page_id =
        remote::resolve_title_path(&api, &shell, space_key, title_path).await?;

    let config = Config {
        version: 1,
        spaces: vec![SpaceConfig {
            space_key: space_key.to_string(),
            parent_page_id: parent_page_id.clone(),
            local_path: local_path.clone(),
            exclude_page_ids: Vec::new(),
        }],
        page_limit: 1000,
    };
    config.save(dirs)?;
    std::fs::create_dir_all(&local_path)
        .map_err(|e| SyncError::fs("create_dir", &local_path, e))?;

    match parent_page_id {
        Some(id) => println!(
            "Initialized: space {} under page {} -> {}",
            space_key,
            id,
            local_path.display()
        ),
        None => println!(
            "Initialized: space {} (root) -> {}",
            space_key,
            local_path.display()
        ),
    }
    Ok(())
}

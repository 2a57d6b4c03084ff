use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use glu_automerge::{AutoMergeConfig, MergeRequestInfo, MergeRequestManager};
use glu_gitlab::{GitlabApi, GitlabApiClient, GitlabClientConfig, MergeRequestDiff};
use glu_store::RecordStore;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::cli_args::{AutoMergeArgs, Cli, Command, FilterArgs};
use crate::console::{parse_console_command, ConsoleCommand, CONSOLE_HELP};
use crate::credentials::{api_base_url, default_state_dir, CredentialStore};
use crate::render::{render_diff, status_header, status_line};

const RECORD_STORE_FILE: &str = "records.redb";

struct Session {
    state_dir: PathBuf,
    credentials: CredentialStore,
    gitlab_url: Option<String>,
    gitlab_token: Option<String>,
}

impl Session {
    fn connect(&self) -> Result<Arc<GitlabApiClient>> {
        let url = self.credentials.resolve_url(self.gitlab_url.as_deref())?;
        let token = self
            .credentials
            .resolve_token(&url, self.gitlab_token.as_deref())?;
        let client = GitlabApiClient::new(GitlabClientConfig::new(api_base_url(&url)?, token))
            .context("failed to build gitlab client")?;
        Ok(Arc::new(client))
    }

    fn manager(&self, filter: Option<&FilterArgs>) -> Result<MergeRequestManager> {
        let api = self.connect()?;
        let store = open_store(&self.state_dir)?;
        let config = AutoMergeConfig {
            author: filter.and_then(|filter| filter.author.clone()),
            reviewer: filter.and_then(|filter| filter.reviewer.clone()),
            ..AutoMergeConfig::default()
        };
        Ok(MergeRequestManager::new(Arc::new(store), api, config)?)
    }
}

fn open_store(state_dir: &Path) -> Result<RecordStore> {
    let path = state_dir.join(RECORD_STORE_FILE);
    RecordStore::open(&path).with_context(|| {
        format!(
            "failed to open record store {} (is another gitlab-util process using it?)",
            path.display()
        )
    })
}

pub(crate) async fn run_cli(cli: Cli) -> Result<()> {
    let state_dir = match cli.state_dir {
        Some(state_dir) => state_dir,
        None => default_state_dir()?,
    };
    let session = Session {
        credentials: CredentialStore::new(&state_dir),
        state_dir,
        gitlab_url: cli.gitlab_url,
        gitlab_token: cli.gitlab_token,
    };

    match cli.command {
        Command::Login { token, url } => login(&session.credentials, &token, &url).await,
        Command::AutoMerge(args) => {
            let manager = session.manager(Some(&args.filter))?;
            auto_merge(&manager, &args).await
        }
        Command::List { filter, force } => {
            let manager = session.manager(Some(&filter))?;
            let items = manager.get_or_refresh_items(force).await?;
            print_items(&items);
            Ok(())
        }
        Command::Diff { id } => {
            let manager = session.manager(None)?;
            print!("{}", render_diff(&pull_diff(&manager, id).await?));
            Ok(())
        }
        Command::Track { id, yes } => {
            let manager = session.manager(None)?;
            let diffs = pull_diff(&manager, id).await?;
            print!("{}", render_diff(&diffs));
            if yes {
                track(&manager, id, &diffs)
            } else {
                println!("re-run with --yes to approve and merge this exact diff automatically");
                Ok(())
            }
        }
        Command::Cancel { id } => {
            let manager = session.manager(None)?;
            let target = manager.cancel_tracking(id)?;
            println!("merge request {id}: {}", target.info);
            Ok(())
        }
    }
}

async fn login(credentials: &CredentialStore, token: &str, url: &str) -> Result<()> {
    let client = GitlabApiClient::new(GitlabClientConfig::new(api_base_url(url)?, token))
        .context("failed to build gitlab client")?;
    let user = client
        .current_user()
        .await
        .context("token validation failed")?;
    credentials.save(url, token)?;
    tracing::info!(username = %user.username, "login stored");
    println!("logged in as {}", user.username);
    Ok(())
}

async fn pull_diff(manager: &MergeRequestManager, id: u64) -> Result<Vec<MergeRequestDiff>> {
    if manager.get_item(id)?.is_none() {
        anyhow::bail!("merge request {id} is not cached; run `gitlab-util list` first");
    }
    Ok(manager.pull_diff(id).await?)
}

fn track(manager: &MergeRequestManager, id: u64, diffs: &[MergeRequestDiff]) -> Result<()> {
    let target = manager.authorize_and_track(id, diffs)?;
    println!(
        "merge request {id}: {} ({} file(s) bound to approval)",
        target.info,
        diffs.len()
    );
    Ok(())
}

fn print_items(items: &[MergeRequestInfo]) {
    let now = Utc::now();
    println!("{}", status_header());
    for item in items {
        println!("{}", status_line(item, now));
    }
}

async fn refresh_and_print(manager: &MergeRequestManager, force: bool) {
    match manager.get_or_refresh_items(force).await {
        Ok(items) => print_items(&items),
        Err(error) => {
            tracing::warn!(error = %error, "failed to refresh merge requests");
            eprintln!("refresh failed: {error}");
        }
    }
}

/// Handles one console line. Returns false when the user asked to quit.
async fn handle_console_line(
    manager: &MergeRequestManager,
    reviewed: &mut HashMap<u64, Vec<MergeRequestDiff>>,
    line: &str,
) -> bool {
    let command = match parse_console_command(line) {
        Ok(Some(command)) => command,
        Ok(None) => return true,
        Err(message) => {
            eprintln!("{message}");
            return true;
        }
    };

    let result = match command {
        ConsoleCommand::Quit => return false,
        ConsoleCommand::Help => {
            println!("{CONSOLE_HELP}");
            Ok(())
        }
        ConsoleCommand::Refresh => {
            refresh_and_print(manager, true).await;
            Ok(())
        }
        ConsoleCommand::Diff(id) => pull_diff(manager, id).await.map(|diffs| {
            print!("{}", render_diff(&diffs));
            println!("run `track {id}` to approve and merge this diff automatically");
            reviewed.insert(id, diffs);
        }),
        ConsoleCommand::Track(id) => match reviewed.remove(&id) {
            Some(diffs) => track(manager, id, &diffs),
            None => Err(anyhow::anyhow!("show the diff first with `diff {id}`")),
        },
        ConsoleCommand::Cancel(id) => manager
            .cancel_tracking(id)
            .map_err(anyhow::Error::from)
            .map(|target| println!("merge request {id}: {}", target.info)),
    };
    if let Err(error) = result {
        eprintln!("error: {error:#}");
    }
    true
}

async fn auto_merge(manager: &MergeRequestManager, args: &AutoMergeArgs) -> Result<()> {
    // Surface a missing filter before starting the loops.
    manager.get_or_refresh_items(false).await?;
    manager.start();
    println!("{CONSOLE_HELP}");

    let mut ticker = tokio::time::interval(Duration::from_secs(args.refresh_secs.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut reviewed = HashMap::new();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            signal = &mut ctrl_c => {
                if let Err(error) = signal {
                    tracing::warn!(error = %error, "failed to listen for ctrl-c");
                }
                break;
            }
            _ = ticker.tick() => refresh_and_print(manager, false).await,
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if !handle_console_line(manager, &mut reviewed, &line).await {
                        break;
                    }
                }
                Ok(None) => stdin_open = false,
                Err(error) => {
                    tracing::warn!(error = %error, "failed to read console input");
                    stdin_open = false;
                }
            },
        }
    }

    manager.shutdown().await;
    Ok(())
}

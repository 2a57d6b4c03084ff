use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "gitlab-util",
    about = "Approve and merge authorized GitLab merge requests once they are ready",
    version,
    disable_version_flag = true
)]
pub struct Cli {
    #[arg(
        long = "gitlab-url",
        env = "GITLAB_URL",
        global = true,
        help = "GitLab instance or API url (e.g. https://gitlab.example.com/api/v4). Defaults to the last login url"
    )]
    pub gitlab_url: Option<String>,

    #[arg(
        long = "gitlab-token",
        env = "GITLAB_TOKEN",
        global = true,
        hide_env_values = true,
        help = "Access token overriding the one stored by `login`"
    )]
    pub gitlab_token: Option<String>,

    #[arg(
        long = "state-dir",
        env = "GITLAB_UTIL_STATE_DIR",
        global = true,
        help = "Directory holding credentials and the record store. Defaults to ~/.gitlab-util"
    )]
    pub state_dir: Option<PathBuf>,

    #[arg(
        short = 'V',
        long = "print-version",
        action = clap::ArgAction::Version,
        help = "Print only the version"
    )]
    pub print_version: Option<bool>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Validate a token against GitLab and store it for the instance.
    Login {
        #[arg(long, short = 't', env = "GITLAB_TOKEN", hide_env_values = true)]
        token: String,
        #[arg(long, short = 'u', env = "GITLAB_URL")]
        url: String,
    },

    /// Run the merge scheduler and print merge request status until Ctrl-C.
    AutoMerge(AutoMergeArgs),

    /// Refresh and print open merge requests once.
    List {
        #[command(flatten)]
        filter: FilterArgs,
        /// Refetch the listing even if the cache is fresh.
        #[arg(long)]
        force: bool,
    },

    /// Print the unified diff of a cached merge request.
    Diff {
        /// Instance-wide merge request id.
        id: u64,
    },

    /// Print the diff and, with --yes, authorize automation bound to it.
    Track {
        id: u64,
        /// Confirm that the printed diff was reviewed.
        #[arg(long)]
        yes: bool,
    },

    /// Stop automation for a merge request.
    Cancel { id: u64 },
}

#[derive(Debug, Clone, Args)]
pub struct FilterArgs {
    /// Author of the merge requests (e.g. renovate-bot).
    #[arg(long)]
    pub author: Option<String>,
    /// Reviewer of the merge requests (e.g. your username).
    #[arg(long)]
    pub reviewer: Option<String>,
}

#[derive(Debug, Clone, Args)]
pub struct AutoMergeArgs {
    #[command(flatten)]
    pub filter: FilterArgs,
    /// Write logs to this file instead of stderr.
    #[arg(long = "log-file")]
    pub log_file: Option<PathBuf>,
    /// Seconds between status refreshes.
    #[arg(long = "refresh-secs", default_value_t = 10)]
    pub refresh_secs: u64,
}

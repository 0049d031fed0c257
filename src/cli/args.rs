//! CLI argument definitions using clap

use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand, ValueHint};

/// Inspect and edit mind-map documents
#[derive(Parser, Debug)]
#[command(name = "mindmap")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Debug output (-d info, -dd debug, -ddd trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub debug: u8,

    /// Convert documents of unknown version without asking
    #[arg(long, global = true, conflicts_with = "as_is")]
    pub convert: bool,

    /// Open documents of unknown version unchanged without asking
    #[arg(long, global = true)]
    pub as_is: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the node tree of a map
    Show {
        /// Map file
        #[arg(value_hint = ValueHint::FilePath)]
        file: PathBuf,
    },

    /// Report the document version
    Classify {
        /// Map file
        #[arg(value_hint = ValueHint::FilePath)]
        file: PathBuf,
    },

    /// Convert a document to the current format
    Migrate {
        /// Map file
        #[arg(value_hint = ValueHint::FilePath)]
        file: PathBuf,
        /// Output file (default: stdout)
        #[arg(short, long, value_hint = ValueHint::FilePath)]
        output: Option<PathBuf>,
    },

    /// Add a node and save
    Add {
        /// Map file
        #[arg(value_hint = ValueHint::FilePath)]
        file: PathBuf,
        /// Node text
        text: String,
        /// Parent node ID (default: root)
        #[arg(short, long)]
        parent: Option<String>,
        /// Position among the parent's children (default: last)
        #[arg(short, long)]
        index: Option<usize>,
    },

    /// Delete a node and save
    Delete {
        /// Map file
        #[arg(value_hint = ValueHint::FilePath)]
        file: PathBuf,
        /// Node ID
        id: String,
    },

    /// Inspect or manage lock files
    Lock {
        #[command(subcommand)]
        command: LockCommands,
    },

    /// Manage settings
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Generate shell completions
    Completion {
        /// Shell type
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand, Debug)]
pub enum LockCommands {
    /// Show who holds the lock
    Status {
        #[arg(value_hint = ValueHint::FilePath)]
        file: PathBuf,
    },
    /// Remove a stale or unreadable lock
    Clear {
        #[arg(value_hint = ValueHint::FilePath)]
        file: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Show merged config
    Show {
        /// Directory whose local config is merged (default: cwd)
        #[arg(value_hint = ValueHint::DirPath)]
        dir: Option<PathBuf>,
    },

    /// Print a config template
    Template,

    /// Show config paths
    Path,
}

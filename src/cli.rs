//! Operator-facing CLI (spec §6's HTTP surface is the primary interface;
//! this wraps it with the start/maintenance commands any long-running
//! host needs — mirrors the teacher's root `Cli`/`Commands` shape).

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "fern", version, about = "Long-running multi-channel agent host")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the HTTP server, scheduler, and sub-agent pool.
    Serve,

    /// One-off migration of the legacy JSONL summary log into the SQL store.
    Migrate {
        /// Path to the legacy JSONL file. Defaults to `<storage>/summaries.jsonl`.
        #[arg(long)]
        path: Option<PathBuf>,
    },

    /// Manage persistent memories.
    Memory {
        #[command(subcommand)]
        command: MemoryCommands,
    },

    /// Inspect scheduled jobs.
    Jobs {
        #[command(subcommand)]
        command: JobsCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum MemoryCommands {
    /// Record a new memory.
    Add {
        content: String,
        #[arg(long, value_enum, default_value_t = MemoryTypeArg::Fact)]
        r#type: MemoryTypeArg,
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// List the most recent memories.
    List {
        #[arg(long, value_enum)]
        r#type: Option<MemoryTypeArg>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}

#[derive(Subcommand, Debug)]
pub enum JobsCommands {
    /// List scheduled jobs, optionally filtered by status.
    List {
        #[arg(long)]
        status: Option<String>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum MemoryTypeArg {
    Fact,
    Preference,
    Learning,
}

impl MemoryTypeArg {
    pub fn into_memory_type(self) -> fern_memory::MemoryType {
        match self {
            MemoryTypeArg::Fact => fern_memory::MemoryType::Fact,
            MemoryTypeArg::Preference => fern_memory::MemoryType::Preference,
            MemoryTypeArg::Learning => fern_memory::MemoryType::Learning,
        }
    }
}

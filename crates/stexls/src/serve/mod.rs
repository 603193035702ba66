//! Server commands for stexls.
//!
//! The only protocol surface is LSP over stdio; the batch linter covers
//! everything else.

use clap::{Args, Subcommand};
use std::path::PathBuf;

pub mod lsp;
mod progress;

/// Serve command arguments
#[derive(Args)]
pub struct ServeArgs {
    #[command(subcommand)]
    pub protocol: ServeProtocol,

    /// Root directory (defaults to the client-provided workspace root)
    #[arg(short, long, global = true)]
    pub root: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum ServeProtocol {
    /// Start LSP server for IDE integration
    Lsp {
        /// Listen on a TCP port instead of stdio
        #[arg(long)]
        tcp: Option<u16>,
    },
}

/// Run the serve command
pub fn run(args: ServeArgs) -> i32 {
    match args.protocol {
        ServeProtocol::Lsp { tcp } => {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(lsp::run_lsp_server(args.root.as_deref(), tcp))
        }
    }
}

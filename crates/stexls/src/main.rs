use clap::{Parser, Subcommand};

use stexls::commands::lint::{cmd_lint, LintArgs};
use stexls::serve::{self, ServeArgs};

#[derive(Parser)]
#[command(name = "stexls")]
#[command(about = "Language server and batch linter for sTeX workspaces")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile and link files, printing diagnostics
    Lint(LintArgs),

    /// Start a server (LSP over stdio)
    Serve(ServeArgs),
}

fn main() {
    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Lint(args) => cmd_lint(&args, cli.json),
        Commands::Serve(args) => serve::run(args),
    };
    std::process::exit(code);
}

//! Lint command - compile, link and report diagnostics for a set of
//! files or the whole workspace.

use crate::config::StexlsConfig;
use crate::linter::{Linter, LintingResult};
use crate::mathhub;
use crate::workspace::Workspace;
use clap::Args;
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use nu_ansi_term::Color::{Blue, Red, Yellow};
use nu_ansi_term::Style;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::mpsc::channel;
use std::time::{Duration, Instant};
use stexls_core::DiagnosticSeverity;

#[derive(Args)]
pub struct LintArgs {
    /// Files to lint (defaults to every .tex file in the workspace)
    pub files: Vec<PathBuf>,

    /// Workspace root (defaults to the current directory)
    #[arg(short, long)]
    pub root: Option<PathBuf>,

    /// Message template; variables: {uri} {file} {filename}
    /// {relative_file} {line} {column} {severity} {code} {message}
    #[arg(long)]
    pub format: Option<String>,

    /// Lowest reported severity (error, warning, information, hint)
    #[arg(long, value_name = "LEVEL")]
    pub diagnostic_level: Option<String>,

    /// Only lint files matching ANY of these regexes
    #[arg(long)]
    pub include: Vec<String>,

    /// Skip files matching ANY of these regexes
    #[arg(long)]
    pub ignore: Vec<String>,

    /// Worker threads for compilation (defaults to all cores)
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Additionally dump each file's compiled object
    #[arg(long)]
    pub verbose: bool,

    /// Re-lint whenever a .tex file under the root changes
    #[arg(long)]
    pub watch: bool,
}

/// Run the lint command.
pub fn cmd_lint(args: &LintArgs, json: bool) -> i32 {
    let root = resolve_root(args.root.as_deref());
    let config = StexlsConfig::load(&root);
    let jobs = args.jobs.or(config.lint.jobs);
    let run = || run_lint_once(args, &config, &root, json);
    let code = match jobs {
        Some(jobs) if jobs > 0 => {
            match rayon::ThreadPoolBuilder::new().num_threads(jobs).build() {
                Ok(pool) => pool.install(run),
                Err(e) => {
                    eprintln!("Failed to build worker pool: {e}");
                    return 1;
                }
            }
        }
        _ => run(),
    };
    if !args.watch {
        return code;
    }
    watch_loop(args, &config, &root, json);
    code
}

fn resolve_root(root: Option<&Path>) -> PathBuf {
    let root = root
        .map(Path::to_path_buf)
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));
    root.canonicalize().unwrap_or(root)
}

fn build_linter(args: &LintArgs, config: &StexlsConfig, root: &Path) -> Linter {
    let mut workspace = Workspace::new(root);
    let include = if args.include.is_empty() {
        &config.lint.include
    } else {
        &args.include
    };
    let ignore = if args.ignore.is_empty() {
        &config.lint.ignore
    } else {
        &args.ignore
    };
    workspace.set_include(compile_patterns(include));
    workspace.set_ignore(compile_patterns(ignore));
    let outdir = config.outdir(root);
    let _ = std::fs::create_dir_all(&outdir);
    Linter::new(workspace, outdir)
        .with_size_limits(config.lint.max_file_size_kb(), config.trefier.max_file_size_kb())
}

fn compile_patterns(patterns: &[String]) -> Vec<regex::Regex> {
    patterns
        .iter()
        .filter_map(|pattern| match regex::Regex::new(pattern) {
            Ok(pattern) => Some(pattern),
            Err(e) => {
                eprintln!("Ignoring invalid pattern: {e}");
                None
            }
        })
        .collect()
}

fn run_lint_once(args: &LintArgs, config: &StexlsConfig, root: &Path, json: bool) -> i32 {
    let mut linter = build_linter(args, config, root);
    let files: Vec<PathBuf> = if args.files.is_empty() {
        linter.workspace.files()
    } else {
        args.files
            .iter()
            .map(|file| {
                let file = if file.is_absolute() {
                    file.clone()
                } else {
                    root.join(file)
                };
                mathhub::normalize(&file)
            })
            .collect()
    };
    if files.is_empty() {
        eprintln!("No .tex files found under {}", root.display());
        return 0;
    }
    let results = linter.lint_batch(&files, None);
    let level = args
        .diagnostic_level
        .as_deref()
        .and_then(DiagnosticSeverity::parse)
        .unwrap_or_else(|| config.lint.diagnostic_level());

    if json {
        print_json(&results, level);
    } else {
        let template = args
            .format
            .as_deref()
            .unwrap_or_else(|| config.lint.format());
        let use_colors = std::io::stdout().is_terminal();
        for result in &results {
            if args.verbose {
                println!("{}", result.object.format());
            }
            for message in result.format_messages(template, level) {
                println!("{}", colorize(&message, use_colors));
            }
        }
    }

    let total_errors: usize = results
        .iter()
        .map(|r| r.object.diagnostics.error_count())
        .sum();
    let total_warnings: usize = results
        .iter()
        .map(|r| r.object.diagnostics.warning_count())
        .sum();
    if !json && (total_errors > 0 || total_warnings > 0) {
        eprintln!();
        eprintln!("Found {total_errors} error(s) and {total_warnings} warning(s)");
    }
    if total_errors > 0 { 1 } else { 0 }
}

fn print_json(results: &[LintingResult], level: DiagnosticSeverity) {
    let output = serde_json::json!({
        "files": results.iter().map(|result| {
            serde_json::json!({
                "file": result.file(),
                "diagnostics": result
                    .diagnostics()
                    .filter(|d| d.severity <= level)
                    .collect::<Vec<_>>(),
            })
        }).collect::<Vec<_>>(),
    });
    println!("{}", serde_json::to_string_pretty(&output).unwrap_or_default());
}

/// Colorizes the severity word of a rendered message.
fn colorize(message: &str, use_colors: bool) -> String {
    if !use_colors {
        return message.to_string();
    }
    let mut message = message.to_string();
    for (word, colored) in [
        ("error", Red.bold().paint("error").to_string()),
        ("warning", Yellow.paint("warning").to_string()),
        ("information", Blue.paint("information").to_string()),
        ("hint", Style::new().dimmed().paint("hint").to_string()),
    ] {
        if message.contains(word) {
            message = message.replacen(word, &colored, 1);
            break;
        }
    }
    message
}

/// Watch mode - re-lint on file changes.
fn watch_loop(args: &LintArgs, config: &StexlsConfig, root: &Path, json: bool) {
    eprintln!("Watching for changes... (Ctrl+C to stop)");
    let (tx, rx) = channel();
    let mut watcher = match RecommendedWatcher::new(tx, Config::default()) {
        Ok(watcher) => watcher,
        Err(e) => {
            eprintln!("Failed to create file watcher: {e}");
            return;
        }
    };
    if let Err(e) = watcher.watch(root, RecursiveMode::Recursive) {
        eprintln!("Failed to watch directory: {e}");
        return;
    }
    let mut last_run = Instant::now();
    let debounce = Duration::from_millis(500);
    for event in rx.into_iter().flatten() {
        let relevant = event.paths.iter().any(|path| {
            path.extension().is_some_and(|extension| extension == "tex")
                && !path
                    .components()
                    .any(|c| c.as_os_str().to_string_lossy().starts_with('.'))
        });
        if !relevant {
            continue;
        }
        if last_run.elapsed() >= debounce {
            eprintln!();
            eprintln!("File changed, re-linting...");
            let _ = run_lint_once(args, config, root, json);
            last_run = Instant::now();
        }
    }
}

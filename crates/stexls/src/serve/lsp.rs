//! LSP (Language Server Protocol) server for stexls.
//!
//! Document lifecycle notifications update the workspace and enqueue
//! link requests; a debounced background task drains the queue,
//! compiles and links off the async loop, and publishes diagnostics.
//! Definition, references and completion answer from the linked
//! objects.

use crate::completion::CompletionEngine;
use crate::config::StexlsConfig;
use crate::linter::Linter;
use crate::workspace::Workspace;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tower_lsp::jsonrpc::{Error, Result};
use tower_lsp::lsp_types::*;
use tower_lsp::{Client, LanguageServer, LspService, Server};

use super::progress::ProgressReporter;

/// Quiet period before queued link requests are drained.
const DEBOUNCE: Duration = Duration::from_secs(1);

struct ServerState {
    linter: Linter,
}

pub struct Backend {
    client: Client,
    cli_root: Option<PathBuf>,
    state: Arc<Mutex<Option<ServerState>>>,
    link_requests: Arc<Mutex<HashSet<PathBuf>>>,
    last_request: Arc<Mutex<Instant>>,
    progress_enabled: Arc<AtomicBool>,
    progress_counter: Arc<AtomicU64>,
    cancelled_tokens: Arc<Mutex<HashSet<String>>>,
}

impl Backend {
    fn new(client: Client, cli_root: Option<PathBuf>) -> Self {
        Self {
            client,
            cli_root,
            state: Arc::new(Mutex::new(None)),
            link_requests: Arc::new(Mutex::new(HashSet::new())),
            last_request: Arc::new(Mutex::new(Instant::now())),
            progress_enabled: Arc::new(AtomicBool::new(false)),
            progress_counter: Arc::new(AtomicU64::new(0)),
            cancelled_tokens: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    async fn init_state(&self, root: PathBuf) {
        let config = StexlsConfig::load(&root);
        let mut workspace = Workspace::new(&root);
        workspace.set_include(compile_patterns(&config.lint.include));
        workspace.set_ignore(compile_patterns(&config.lint.ignore));
        let outdir = config.outdir(&root);
        let _ = std::fs::create_dir_all(&outdir);
        let linter = Linter::new(workspace, outdir).with_size_limits(
            config.lint.max_file_size_kb(),
            config.trefier.max_file_size_kb(),
        );
        *self.state.lock().await = Some(ServerState { linter });
    }

    /// Queues `path` for the next background link cycle.
    async fn request_link(&self, path: PathBuf) {
        *self.last_request.lock().await = Instant::now();
        self.link_requests.lock().await.insert(path);
    }

    /// The periodic task draining queued link requests.
    fn spawn_background_linker(&self) {
        let state = self.state.clone();
        let requests = self.link_requests.clone();
        let last_request = self.last_request.clone();
        let client = self.client.clone();
        let progress_enabled = self.progress_enabled.clone();
        let progress_counter = self.progress_counter.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(DEBOUNCE);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let files: Vec<PathBuf> = {
                    let mut queued = requests.lock().await;
                    if queued.is_empty() {
                        continue;
                    }
                    // a fresh request resets the timer and delays the drain
                    if last_request.lock().await.elapsed() < DEBOUNCE {
                        continue;
                    }
                    queued.drain().collect()
                };
                let reporter = ProgressReporter::begin(
                    client.clone(),
                    progress_enabled.load(Ordering::Relaxed),
                    "stexls: linking",
                    progress_counter.fetch_add(1, Ordering::Relaxed),
                )
                .await;
                reporter.report(format!("{} file(s)", files.len())).await;
                let published = lint_files(state.clone(), files).await;
                for (uri, diagnostics) in published {
                    client.publish_diagnostics(uri, diagnostics, None).await;
                }
                reporter.end().await;
            }
        });
    }

    /// Custom handler for `window/workDoneProgress/cancel`: the token
    /// is recorded, in-flight per-file work is bounded and not aborted.
    pub async fn work_done_progress_cancel(&self, params: WorkDoneProgressCancelParams) {
        let token = match params.token {
            NumberOrString::String(token) => token,
            NumberOrString::Number(number) => number.to_string(),
        };
        self.cancelled_tokens.lock().await.insert(token);
        self.client
            .log_message(MessageType::INFO, "progress cancel received")
            .await;
    }
}

/// Compiles and links the requested files on the blocking pool; the
/// async loop only ever sees the finished diagnostics.
async fn lint_files(
    state: Arc<Mutex<Option<ServerState>>>,
    files: Vec<PathBuf>,
) -> Vec<(Url, Vec<Diagnostic>)> {
    tokio::task::spawn_blocking(move || {
        let mut guard = state.blocking_lock();
        let Some(state) = guard.as_mut() else {
            return Vec::new();
        };
        let results = state.linter.lint_batch(&files, None);
        results
            .into_iter()
            .filter_map(|result| {
                let uri = Url::from_file_path(result.file()).ok()?;
                let diagnostics = result.diagnostics().map(to_lsp_diagnostic).collect();
                Some((uri, diagnostics))
            })
            .collect()
    })
    .await
    .unwrap_or_default()
}

#[tower_lsp::async_trait]
impl LanguageServer for Backend {
    async fn initialize(&self, params: InitializeParams) -> Result<InitializeResult> {
        self.progress_enabled.store(
            params
                .capabilities
                .window
                .as_ref()
                .and_then(|window| window.work_done_progress)
                .unwrap_or(false),
            Ordering::Relaxed,
        );
        #[allow(deprecated)]
        let root = params
            .root_uri
            .as_ref()
            .and_then(|uri| uri.to_file_path().ok())
            .or_else(|| {
                params
                    .workspace_folders
                    .as_ref()
                    .and_then(|folders| folders.first())
                    .and_then(|folder| folder.uri.to_file_path().ok())
            })
            .or_else(|| self.cli_root.clone());
        let Some(root) = root else {
            return Err(Error::invalid_params("No workspace root provided"));
        };
        self.init_state(root).await;

        Ok(InitializeResult {
            capabilities: ServerCapabilities {
                text_document_sync: Some(TextDocumentSyncCapability::Options(
                    TextDocumentSyncOptions {
                        open_close: Some(true),
                        change: Some(TextDocumentSyncKind::FULL),
                        save: Some(TextDocumentSyncSaveOptions::Supported(true)),
                        ..Default::default()
                    },
                )),
                completion_provider: Some(CompletionOptions {
                    trigger_characters: Some(
                        ["?", "[", "{", ",", "="]
                            .into_iter()
                            .map(str::to_string)
                            .collect(),
                    ),
                    all_commit_characters: Some(
                        ["]", "}", ","].into_iter().map(str::to_string).collect(),
                    ),
                    ..Default::default()
                }),
                definition_provider: Some(OneOf::Left(true)),
                references_provider: Some(OneOf::Left(true)),
                workspace: Some(WorkspaceServerCapabilities {
                    workspace_folders: Some(WorkspaceFoldersServerCapabilities {
                        supported: Some(true),
                        change_notifications: Some(OneOf::Left(true)),
                    }),
                    file_operations: None,
                }),
                ..Default::default()
            },
            server_info: Some(ServerInfo {
                name: "stexls".to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
        })
    }

    async fn initialized(&self, _: InitializedParams) {
        self.client
            .log_message(MessageType::INFO, "stexls server initialized")
            .await;
        self.spawn_background_linker();
        // Initial pass: compile the whole workspace, then queue every
        // file so the first drain publishes diagnostics for all.
        let state = self.state.clone();
        let requests = self.link_requests.clone();
        let client = self.client.clone();
        let progress_enabled = self.progress_enabled.load(Ordering::Relaxed);
        let counter = self.progress_counter.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            let reporter = ProgressReporter::begin(
                client.clone(),
                progress_enabled,
                "stexls: compiling workspace",
                counter,
            )
            .await;
            let compiled = tokio::task::spawn_blocking({
                let state = state.clone();
                move || {
                    let mut guard = state.blocking_lock();
                    guard
                        .as_mut()
                        .map(|state| state.linter.compile_workspace())
                        .unwrap_or_default()
                }
            })
            .await
            .unwrap_or_default();
            reporter.report(format!("{} file(s) compiled", compiled.len())).await;
            requests.lock().await.extend(compiled);
            reporter.end().await;
        });
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    async fn did_change_workspace_folders(&self, params: DidChangeWorkspaceFoldersParams) {
        if let Some(folder) = params.event.added.first() {
            if let Ok(root) = folder.uri.to_file_path() {
                self.init_state(root).await;
            }
        }
    }

    async fn did_open(&self, params: DidOpenTextDocumentParams) {
        let Ok(path) = params.text_document.uri.to_file_path() else {
            return;
        };
        if let Some(state) = self.state.lock().await.as_mut() {
            state
                .linter
                .workspace
                .open_file(path.clone(), params.text_document.text);
        }
        self.request_link(path).await;
    }

    async fn did_change(&self, params: DidChangeTextDocumentParams) {
        let Ok(path) = params.text_document.uri.to_file_path() else {
            return;
        };
        // full sync: the last change carries the complete content
        let Some(change) = params.content_changes.into_iter().last() else {
            return;
        };
        if let Some(state) = self.state.lock().await.as_mut() {
            state.linter.workspace.update_file(path.clone(), change.text);
        }
        self.request_link(path).await;
    }

    async fn did_save(&self, params: DidSaveTextDocumentParams) {
        let Ok(path) = params.text_document.uri.to_file_path() else {
            return;
        };
        self.request_link(path).await;
    }

    async fn did_close(&self, params: DidCloseTextDocumentParams) {
        let Ok(path) = params.text_document.uri.to_file_path() else {
            return;
        };
        if let Some(state) = self.state.lock().await.as_mut() {
            state.linter.workspace.close_file(&path);
            // the buffer may never have hit the disk; drop the cached
            // object compiled from it
            state.linter.compiler().delete_objectfile(&path);
        }
    }

    async fn completion(&self, params: CompletionParams) -> Result<Option<CompletionResponse>> {
        let uri = params.text_document_position.text_document.uri;
        let position = params.text_document_position.position;
        let Ok(path) = uri.to_file_path() else {
            return Ok(None);
        };
        let guard = self.state.lock().await;
        let Some(state) = guard.as_ref() else {
            return Ok(None);
        };
        let Some(content) = state.linter.workspace.read_file(&path) else {
            return Ok(None);
        };
        let Some(line) = content.split('\n').nth(position.line as usize) else {
            return Ok(None);
        };
        let index = state.linter.module_index();
        let engine = CompletionEngine {
            root: state.linter.workspace.root(),
            index: &index,
        };
        let items = engine.completion(
            &path,
            state.linter.unlinked_object(&path).map(|object| &**object),
            state.linter.linked_object(&path),
            line,
            stexls_core::Position::new(position.line, position.character),
        );
        if items.is_empty() {
            Ok(None)
        } else {
            Ok(Some(CompletionResponse::Array(items)))
        }
    }

    async fn goto_definition(
        &self,
        params: GotoDefinitionParams,
    ) -> Result<Option<GotoDefinitionResponse>> {
        let uri = params.text_document_position_params.text_document.uri;
        let position = params.text_document_position_params.position;
        let Ok(path) = uri.to_file_path() else {
            return Ok(None);
        };
        let guard = self.state.lock().await;
        let Some(state) = guard.as_ref() else {
            return Ok(None);
        };
        let definitions = state.linter.definitions(
            &path,
            stexls_core::Position::new(position.line, position.character),
        );
        let links: Vec<LocationLink> = definitions
            .into_iter()
            .filter_map(|(origin, target)| {
                let target_uri = Url::from_file_path(&target.path).ok()?;
                let target_range = to_lsp_range(target.range);
                Some(LocationLink {
                    origin_selection_range: Some(to_lsp_range(origin)),
                    target_uri,
                    target_range,
                    target_selection_range: target_range,
                })
            })
            .collect();
        if links.is_empty() {
            Ok(None)
        } else {
            Ok(Some(GotoDefinitionResponse::Link(links)))
        }
    }

    async fn references(&self, params: ReferenceParams) -> Result<Option<Vec<Location>>> {
        let uri = params.text_document_position.text_document.uri;
        let position = params.text_document_position.position;
        let Ok(path) = uri.to_file_path() else {
            return Ok(None);
        };
        let guard = self.state.lock().await;
        let Some(state) = guard.as_ref() else {
            return Ok(None);
        };
        let locations: Vec<Location> = state
            .linter
            .references(
                &path,
                stexls_core::Position::new(position.line, position.character),
            )
            .into_iter()
            .filter_map(|location| {
                Some(Location {
                    uri: Url::from_file_path(&location.path).ok()?,
                    range: to_lsp_range(location.range),
                })
            })
            .collect();
        if locations.is_empty() {
            Ok(None)
        } else {
            Ok(Some(locations))
        }
    }
}

fn compile_patterns(patterns: &[String]) -> Vec<regex::Regex> {
    patterns
        .iter()
        .filter_map(|pattern| regex::Regex::new(pattern).ok())
        .collect()
}

fn to_lsp_range(range: stexls_core::Range) -> Range {
    Range {
        start: Position {
            line: range.start.line,
            character: range.start.character,
        },
        end: Position {
            line: range.end.line,
            character: range.end.character,
        },
    }
}

fn to_lsp_diagnostic(diagnostic: &stexls_core::Diagnostic) -> Diagnostic {
    let severity = match diagnostic.severity {
        stexls_core::DiagnosticSeverity::Error => DiagnosticSeverity::ERROR,
        stexls_core::DiagnosticSeverity::Warning => DiagnosticSeverity::WARNING,
        stexls_core::DiagnosticSeverity::Information => DiagnosticSeverity::INFORMATION,
        stexls_core::DiagnosticSeverity::Hint => DiagnosticSeverity::HINT,
    };
    let tags: Vec<DiagnosticTag> = diagnostic
        .tags
        .iter()
        .map(|tag| match tag {
            stexls_core::DiagnosticTag::Unnecessary => DiagnosticTag::UNNECESSARY,
            stexls_core::DiagnosticTag::Deprecated => DiagnosticTag::DEPRECATED,
        })
        .collect();
    let related_information: Vec<DiagnosticRelatedInformation> = diagnostic
        .related_information
        .iter()
        .filter_map(|related| {
            Some(DiagnosticRelatedInformation {
                location: Location {
                    uri: Url::from_file_path(&related.location.path).ok()?,
                    range: to_lsp_range(related.location.range),
                },
                message: related.message.clone(),
            })
        })
        .collect();
    Diagnostic {
        range: to_lsp_range(diagnostic.range),
        severity: Some(severity),
        code: Some(NumberOrString::String(diagnostic.code.clone())),
        source: Some("stexls".to_string()),
        message: diagnostic.message.clone(),
        tags: (!tags.is_empty()).then_some(tags),
        related_information: (!related_information.is_empty()).then_some(related_information),
        ..Default::default()
    }
}

fn build_service(root: Option<&Path>) -> (LspService<Backend>, tower_lsp::ClientSocket) {
    let cli_root = root.map(Path::to_path_buf);
    LspService::build(move |client| Backend::new(client, cli_root.clone()))
        .custom_method(
            "window/workDoneProgress/cancel",
            Backend::work_done_progress_cancel,
        )
        .finish()
}

/// Start the LSP server on stdio, or on a TCP socket when a port is
/// given (one client connection).
pub async fn run_lsp_server(root: Option<&Path>, tcp: Option<u16>) -> i32 {
    match tcp {
        Some(port) => {
            let listener = match tokio::net::TcpListener::bind(("127.0.0.1", port)).await {
                Ok(listener) => listener,
                Err(e) => {
                    eprintln!("Failed to bind 127.0.0.1:{port}: {e}");
                    return 1;
                }
            };
            let (stream, _) = match listener.accept().await {
                Ok(connection) => connection,
                Err(e) => {
                    eprintln!("Failed to accept connection: {e}");
                    return 1;
                }
            };
            let (read, write) = tokio::io::split(stream);
            let (service, socket) = build_service(root);
            Server::new(read, write, socket).serve(service).await;
        }
        None => {
            let stdin = tokio::io::stdin();
            let stdout = tokio::io::stdout();
            let (service, socket) = build_service(root);
            Server::new(stdin, stdout, socket).serve(service).await;
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use stexls_core::{Position as CorePosition, Range as CoreRange};

    #[test]
    fn test_diagnostic_conversion() {
        let mut diagnostics = stexls_core::Diagnostics::new();
        diagnostics.replace_repos_with_mhrepos(CoreRange::new(
            CorePosition::new(2, 4),
            CorePosition::new(2, 9),
        ));
        let diagnostic = diagnostics.iter().next().unwrap();
        let converted = to_lsp_diagnostic(diagnostic);
        assert_eq!(converted.severity, Some(DiagnosticSeverity::WARNING));
        assert_eq!(
            converted.code,
            Some(NumberOrString::String("repos-deprecation-check".to_string()))
        );
        assert_eq!(converted.tags, Some(vec![DiagnosticTag::DEPRECATED]));
        assert_eq!(converted.range.start.line, 2);
        assert_eq!(converted.range.start.character, 4);
    }

    #[test]
    fn test_pattern_compilation_skips_invalid() {
        let patterns = compile_patterns(&["valid.*".to_string(), "[invalid".to_string()]);
        assert_eq!(patterns.len(), 1);
    }
}

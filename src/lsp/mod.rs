//! Language-server multiplexer — one persistent child process per language,
//! speaking length-prefixed JSON-RPC with request/response correlation.
//!
//! Servers are spawned on first use for a file whose extension resolves
//! through the merged configuration, taken through the
//! `initialize`/`initialized` handshake, and then shared by every request
//! for that language. `didOpen` is sent lazily the first time a file's
//! absolute path is used.

pub mod config;
pub mod framing;
pub mod rpc;

pub use config::{LspConfigSet, LspServerConfig};
pub use rpc::RpcPeer;

use crate::process::{self, Signal};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum LspError {
    #[error("invalid language-server configuration: {0}")]
    Config(String),
    #[error("no language server configured for {0}")]
    NoServer(String),
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("language server error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("language server closed the connection")]
    Closed,
}

/// A position-based query against a source file. `line` and `character` are
/// 1-based as supplied by callers; the protocol conversion to 0-based
/// happens here.
#[derive(Debug, Clone)]
pub struct LspRequest {
    pub operation: String,
    pub file_path: PathBuf,
    pub line: u32,
    pub character: u32,
}

#[derive(Debug, Clone)]
pub struct LspOutcome {
    pub success: bool,
    pub content: String,
}

#[derive(Clone)]
struct LspHandle {
    peer: Arc<RpcPeer>,
    opened: Arc<Mutex<HashSet<PathBuf>>>,
    pid: Option<u32>,
}

pub struct LspManager {
    workdir: PathBuf,
    config: LspConfigSet,
    processes: Arc<tokio::sync::Mutex<HashMap<String, LspHandle>>>,
}

impl LspManager {
    pub fn new(workdir: impl Into<PathBuf>, config: LspConfigSet) -> Self {
        Self {
            workdir: workdir.into(),
            config,
            processes: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
        }
    }

    /// Dispatch an operation to the language server responsible for the
    /// file, spawning and initializing it on first use.
    ///
    /// No request timeout is applied; callers that need one can wrap this in
    /// `tokio::time::timeout`.
    pub async fn execute(&self, request: &LspRequest) -> Result<LspOutcome, LspError> {
        let (language, lang_id, server) = self
            .config
            .resolve(&request.file_path)
            .ok_or_else(|| LspError::NoServer(request.file_path.display().to_string()))?;
        let server = server.clone();
        let handle = self.ensure_process(&language, &server).await?;
        let path = if request.file_path.is_absolute() {
            request.file_path.clone()
        } else {
            self.workdir.join(&request.file_path)
        };
        run_operation(
            &handle.peer,
            &handle.opened,
            &lang_id,
            &request.operation,
            &path,
            request.line,
            request.character,
        )
        .await
    }

    /// Kill every language server unconditionally and clear the map.
    pub async fn cleanup(&self) {
        let mut processes = self.processes.lock().await;
        for (language, handle) in processes.drain() {
            debug!(language = %language, "killing language server");
            if let Some(pid) = handle.pid {
                let _ = process::kill_pid(pid, Signal::Kill);
            }
        }
    }

    async fn ensure_process(
        &self,
        language: &str,
        server: &LspServerConfig,
    ) -> Result<LspHandle, LspError> {
        let mut processes = self.processes.lock().await;
        if let Some(handle) = processes.get(language) {
            return Ok(handle.clone());
        }

        debug!(language = %language, command = %server.command, "spawning language server");
        let mut cmd = Command::new(&server.command);
        cmd.args(&server.args)
            .envs(&server.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .current_dir(&self.workdir);
        let mut child = cmd.spawn().map_err(|source| LspError::Spawn {
            command: server.command.clone(),
            source,
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| LspError::Transport("failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LspError::Transport("failed to capture stdout".into()))?;
        let peer = RpcPeer::new(stdout, stdin);

        let root = server.workspace_folder.as_deref().unwrap_or(&self.workdir);
        initialize_peer(&peer, root, server.initialization_options.clone()).await?;

        let handle = LspHandle {
            peer,
            opened: Arc::new(Mutex::new(HashSet::new())),
            pid: child.id(),
        };

        // On child close the process is dropped from the map; requests still
        // in flight error out at the caller when the reader task clears its
        // pending table.
        let map = Arc::clone(&self.processes);
        let lang = language.to_string();
        tokio::spawn(async move {
            let _ = child.wait().await;
            map.lock().await.remove(&lang);
            debug!(language = %lang, "language server exited");
        });

        processes.insert(language.to_string(), handle.clone());
        Ok(handle)
    }
}

/// `initialize` request followed by the `initialized` notification.
async fn initialize_peer(
    peer: &RpcPeer,
    root: &Path,
    initialization_options: Option<Value>,
) -> Result<(), LspError> {
    peer.request(
        "initialize",
        json!({
            "processId": std::process::id(),
            "rootUri": file_uri(root),
            "capabilities": {},
            "initializationOptions": initialization_options,
        }),
    )
    .await?;
    peer.notify("initialized", json!({})).await
}

async fn run_operation(
    peer: &RpcPeer,
    opened: &Mutex<HashSet<PathBuf>>,
    lang_id: &str,
    operation: &str,
    path: &Path,
    line: u32,
    character: u32,
) -> Result<LspOutcome, LspError> {
    let method = match operation {
        "goToDefinition" | "definition" => "textDocument/definition",
        "hover" => "textDocument/hover",
        "references" => "textDocument/references",
        "documentSymbol" => "textDocument/documentSymbol",
        other => {
            return Ok(LspOutcome {
                success: false,
                content: format!("Unsupported LSP operation: {other}"),
            })
        }
    };

    let uri = file_uri(path);
    let newly_opened = opened.lock().unwrap().insert(path.to_path_buf());
    if newly_opened {
        let text = std::fs::read_to_string(path).unwrap_or_default();
        peer.notify(
            "textDocument/didOpen",
            json!({
                "textDocument": {
                    "uri": uri,
                    "languageId": lang_id,
                    "version": 1,
                    "text": text,
                }
            }),
        )
        .await?;
    }

    let text_document = json!({ "uri": uri });
    let mut params = json!({ "textDocument": text_document });
    if method != "textDocument/documentSymbol" {
        params["position"] = json!({
            "line": line.saturating_sub(1),
            "character": character.saturating_sub(1),
        });
    }
    if method == "textDocument/references" {
        params["context"] = json!({ "includeDeclaration": true });
    }

    let result = peer.request(method, params).await?;

    Ok(LspOutcome {
        success: true,
        content: serde_json::to_string(&result)
            .map_err(|e| LspError::Transport(e.to_string()))?,
    })
}

fn file_uri(path: &Path) -> String {
    format!("file://{}", path.display())
}

//! Language-server configuration: a built-in table merged under the
//! project's `.lsp.json`, mapping languages to server commands and file
//! extensions to language ids.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::LspError;

pub const CONFIG_FILE: &str = ".lsp.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LspServerConfig {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub initialization_options: Option<Value>,
    pub workspace_folder: Option<PathBuf>,
    /// Extension (with leading dot) to LSP `languageId`.
    pub extension_to_language: HashMap<String, String>,
}

/// Merged view over built-in servers, programmatic registrations, and the
/// project's `.lsp.json` (highest precedence, replacing per language).
#[derive(Debug, Clone, Default)]
pub struct LspConfigSet {
    servers: HashMap<String, LspServerConfig>,
}

impl LspConfigSet {
    pub fn builtin() -> Self {
        let mut servers = HashMap::new();
        servers.insert(
            "rust".to_string(),
            server("rust-analyzer", &[], &[(".rs", "rust")]),
        );
        servers.insert("go".to_string(), server("gopls", &[], &[(".go", "go")]));
        servers.insert(
            "typescript".to_string(),
            server(
                "typescript-language-server",
                &["--stdio"],
                &[
                    (".ts", "typescript"),
                    (".tsx", "typescriptreact"),
                    (".js", "javascript"),
                    (".jsx", "javascriptreact"),
                ],
            ),
        );
        servers.insert(
            "python".to_string(),
            server("pylsp", &[], &[(".py", "python")]),
        );
        servers.insert(
            "c".to_string(),
            server(
                "clangd",
                &[],
                &[(".c", "c"), (".h", "c"), (".cpp", "cpp"), (".hpp", "cpp")],
            ),
        );
        Self { servers }
    }

    /// Built-ins merged under `<workdir>/.lsp.json`. A malformed file is a
    /// configuration error that aborts loading; a missing file is not.
    pub fn load(workdir: &Path) -> Result<Self, LspError> {
        let mut set = Self::builtin();
        let path = workdir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(set);
        }
        let json = std::fs::read_to_string(&path)
            .map_err(|e| LspError::Config(format!("{}: {e}", path.display())))?;
        let file: HashMap<String, LspServerConfig> = serde_json::from_str(&json)
            .map_err(|e| LspError::Config(format!("{}: {e}", path.display())))?;
        for (language, config) in file {
            set.servers.insert(language, config);
        }
        Ok(set)
    }

    /// Programmatic registration; `.lsp.json` entries still win on conflict
    /// when loaded afterwards.
    pub fn register(&mut self, language: impl Into<String>, config: LspServerConfig) {
        self.servers.insert(language.into(), config);
    }

    pub fn get(&self, language: &str) -> Option<&LspServerConfig> {
        self.servers.get(language)
    }

    /// Resolve a file to `(language, languageId, config)` by extension.
    pub fn resolve(&self, path: &Path) -> Option<(String, String, &LspServerConfig)> {
        let ext = format!(".{}", path.extension()?.to_str()?);
        self.servers.iter().find_map(|(language, config)| {
            config
                .extension_to_language
                .get(&ext)
                .map(|lang_id| (language.clone(), lang_id.clone(), config))
        })
    }
}

fn server(command: &str, args: &[&str], extensions: &[(&str, &str)]) -> LspServerConfig {
    LspServerConfig {
        command: command.to_string(),
        args: args.iter().map(|s| s.to_string()).collect(),
        env: HashMap::new(),
        initialization_options: None,
        workspace_folder: None,
        extension_to_language: extensions
            .iter()
            .map(|(ext, id)| (ext.to_string(), id.to_string()))
            .collect(),
    }
}

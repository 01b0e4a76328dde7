//! Configuration file handling

use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::paths::config_path;
use super::{Error, Result};

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Attach the native backend to the managed debuggee automatically
    #[serde(default = "default_true")]
    pub auto_attach: bool,

    /// Emit verbose timing diagnostics
    #[serde(default)]
    pub diagnostics: bool,

    /// Source classification rules
    #[serde(default)]
    pub sources: SourceConfig,

    /// Timeout settings
    #[serde(default)]
    pub timeouts: Timeouts,

    /// Backend command lines
    #[serde(default)]
    pub backends: Backends,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            auto_attach: true,
            diagnostics: false,
            sources: SourceConfig::default(),
            timeouts: Timeouts::default(),
            backends: Backends::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// File extensions owned by each backend
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    #[serde(default = "default_managed_extensions")]
    pub managed_extensions: Vec<String>,

    #[serde(default = "default_native_extensions")]
    pub native_extensions: Vec<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            managed_extensions: default_managed_extensions(),
            native_extensions: default_native_extensions(),
        }
    }
}

fn default_managed_extensions() -> Vec<String> {
    ["py", "pyw", "pyi"].iter().map(|s| s.to_string()).collect()
}

fn default_native_extensions() -> Vec<String> {
    [
        "c", "cc", "cpp", "cxx", "c++", "h", "hh", "hpp", "hxx", "m", "mm", "rs",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Shutdown timeouts in milliseconds
#[derive(Debug, Deserialize, Clone)]
pub struct Timeouts {
    /// Bound on the native backend acknowledging its detach
    #[serde(default = "default_native_detach")]
    pub native_detach_ms: u64,

    /// Bound on the managed backend acknowledging its disconnect
    #[serde(default = "default_managed_terminate")]
    pub managed_terminate_ms: u64,

    /// How long to wait for the client's own disconnect before closing
    #[serde(default = "default_disconnect_wait")]
    pub disconnect_wait_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            native_detach_ms: default_native_detach(),
            managed_terminate_ms: default_managed_terminate(),
            disconnect_wait_ms: default_disconnect_wait(),
        }
    }
}

fn default_native_detach() -> u64 {
    500
}
fn default_managed_terminate() -> u64 {
    5_000
}
fn default_disconnect_wait() -> u64 {
    1_500
}

impl Timeouts {
    pub fn native_detach(&self) -> Duration {
        Duration::from_millis(self.native_detach_ms)
    }

    pub fn managed_terminate(&self) -> Duration {
        Duration::from_millis(self.managed_terminate_ms)
    }

    pub fn disconnect_wait(&self) -> Duration {
        Duration::from_millis(self.disconnect_wait_ms)
    }
}

/// Command lines for both backends
#[derive(Debug, Deserialize, Clone)]
pub struct Backends {
    #[serde(default = "default_managed_backend")]
    pub managed: BackendCommand,

    /// The native backend is optional; the bridge degrades without it
    #[serde(default)]
    pub native: Option<BackendCommand>,
}

impl Default for Backends {
    fn default() -> Self {
        Self {
            managed: default_managed_backend(),
            native: None,
        }
    }
}

fn default_managed_backend() -> BackendCommand {
    BackendCommand {
        command: "python3".to_string(),
        args: vec!["-m".to_string(), "debugpy.adapter".to_string()],
    }
}

/// Configuration for a backend executable
#[derive(Debug, Deserialize, Clone)]
pub struct BackendCommand {
    /// Executable name or path
    pub command: String,

    /// Additional arguments to pass to the backend
    #[serde(default)]
    pub args: Vec<String>,
}

impl BackendCommand {
    /// Resolve the executable, searching PATH when the command is a bare name
    pub fn resolve(&self) -> Result<PathBuf> {
        let path = Path::new(&self.command);
        if path.components().count() > 1 || path.is_absolute() {
            return if path.exists() {
                Ok(path.to_path_buf())
            } else {
                Err(Error::backend_not_found(&self.command, &[&self.command]))
            };
        }

        which::which(&self.command).map_err(|_| {
            let searched = std::env::var("PATH").unwrap_or_default();
            Error::backend_not_found(&self.command, &[searched])
        })
    }
}

impl Config {
    /// Load configuration from an explicit path or the default config file
    ///
    /// Returns default configuration if no file exists
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(p) => Some(p.to_path_buf()),
            None => config_path().filter(|p| p.exists()),
        };

        match path {
            Some(path) => {
                let content = std::fs::read_to_string(&path).map_err(|e| Error::FileRead {
                    path: path.display().to_string(),
                    error: e.to_string(),
                })?;
                Self::from_toml(&content)
            }
            None => Ok(Self::default()),
        }
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| Error::ConfigParse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// The two extension sets must not overlap
    fn validate(&self) -> Result<()> {
        let managed: HashSet<String> = self
            .sources
            .managed_extensions
            .iter()
            .map(|e| normalize_extension(e))
            .collect();
        let mut overlap: Vec<String> = self
            .sources
            .native_extensions
            .iter()
            .map(|e| normalize_extension(e))
            .filter(|e| managed.contains(e))
            .collect();

        if overlap.is_empty() {
            return Ok(());
        }
        overlap.sort();
        overlap.dedup();
        Err(Error::Config(format!(
            "extensions classified as both managed and native: {}",
            overlap.join(", ")
        )))
    }
}

/// Lowercase an extension and strip any leading dot
pub fn normalize_extension(ext: &str) -> String {
    ext.trim().trim_start_matches('.').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.auto_attach);
        assert!(!config.diagnostics);
        assert_eq!(config.timeouts.native_detach(), Duration::from_millis(500));
        assert_eq!(config.timeouts.managed_terminate(), Duration::from_secs(5));
        assert_eq!(config.timeouts.disconnect_wait(), Duration::from_millis(1500));
        assert!(config.backends.native.is_none());
    }

    #[test]
    fn test_parse_full_file() {
        let config = Config::from_toml(
            r#"
auto_attach = false
diagnostics = true

[sources]
managed_extensions = [".PY"]
native_extensions = ["cpp", ".h"]

[timeouts]
native_detach_ms = 100

[backends.managed]
command = "debugpy-adapter"

[backends.native]
command = "lldb-dap"
args = ["--repl-mode", "command"]
"#,
        )
        .unwrap();

        assert!(!config.auto_attach);
        assert!(config.diagnostics);
        assert_eq!(config.sources.managed_extensions, vec![".PY"]);
        assert_eq!(config.timeouts.native_detach_ms, 100);
        assert_eq!(config.timeouts.managed_terminate_ms, 5_000);
        assert_eq!(config.backends.managed.command, "debugpy-adapter");
        assert!(config.backends.managed.args.is_empty());
        let native = config.backends.native.unwrap();
        assert_eq!(native.args, vec!["--repl-mode", "command"]);
    }

    #[test]
    fn test_overlapping_extensions_rejected() {
        let err = Config::from_toml(
            r#"
[sources]
managed_extensions = ["py", "H"]
native_extensions = [".h", "c"]
"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(ref msg) if msg.contains('h')));
    }

    #[test]
    fn test_invalid_toml() {
        let err = Config::from_toml("auto_attach = \"maybe\"").unwrap_err();
        assert!(matches!(err, Error::ConfigParse(_)));
    }

    #[test]
    fn test_load_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.toml");
        std::fs::write(&path, "diagnostics = true\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert!(config.diagnostics);

        let missing = dir.path().join("missing.toml");
        assert!(matches!(
            Config::load(Some(&missing)),
            Err(Error::FileRead { .. })
        ));
    }

    #[test]
    fn test_load_rejects_overlapping_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.toml");
        std::fs::write(
            &path,
            "[sources]\nmanaged_extensions = [\"py\"]\nnative_extensions = [\"PY\"]\n",
        )
        .unwrap();

        assert!(matches!(Config::load(Some(&path)), Err(Error::Config(_))));
    }

    #[test]
    fn test_resolve_missing_absolute_command() {
        let cmd = BackendCommand {
            command: "/definitely/not/here/lldb-dap".to_string(),
            args: Vec::new(),
        };
        assert!(matches!(cmd.resolve(), Err(Error::BackendNotFound { .. })));
    }
}

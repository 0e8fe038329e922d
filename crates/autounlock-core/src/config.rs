//! Configuration model and helpers used by the autounlock workflow.

use crate::error::{AutounlockError, AutounlockResult};
use log::debug;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/luks-autounlock.toml";

pub(crate) const KNOWN_CRYPTSETUP_PATHS: &[&str] = &[
    "/usr/sbin/cryptsetup",
    "/usr/bin/cryptsetup",
    "/sbin/cryptsetup",
    "/bin/cryptsetup",
    "/usr/local/sbin/cryptsetup",
];
pub(crate) const KNOWN_BLKID_PATHS: &[&str] = &["/usr/sbin/blkid", "/sbin/blkid", "/usr/bin/blkid"];
pub(crate) const KNOWN_DRACUT_PATHS: &[&str] = &["/usr/bin/dracut", "/usr/sbin/dracut"];
pub(crate) const KNOWN_LSINITRD_PATHS: &[&str] = &["/usr/bin/lsinitrd", "/bin/lsinitrd"];
pub(crate) const KNOWN_GRUB_MKCONFIG_PATHS: &[&str] = &[
    "/usr/sbin/grub2-mkconfig",
    "/sbin/grub2-mkconfig",
    "/usr/bin/grub2-mkconfig",
];

/// External utilities the workflow shells out to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    Cryptsetup,
    Blkid,
    Dracut,
    Lsinitrd,
    GrubMkconfig,
}

impl Tool {
    pub fn binary_name(self) -> &'static str {
        match self {
            Tool::Cryptsetup => "cryptsetup",
            Tool::Blkid => "blkid",
            Tool::Dracut => "dracut",
            Tool::Lsinitrd => "lsinitrd",
            Tool::GrubMkconfig => "grub2-mkconfig",
        }
    }

    fn known_paths(self) -> &'static [&'static str] {
        match self {
            Tool::Cryptsetup => KNOWN_CRYPTSETUP_PATHS,
            Tool::Blkid => KNOWN_BLKID_PATHS,
            Tool::Dracut => KNOWN_DRACUT_PATHS,
            Tool::Lsinitrd => KNOWN_LSINITRD_PATHS,
            Tool::GrubMkconfig => KNOWN_GRUB_MKCONFIG_PATHS,
        }
    }
}

/// Locations of the files the workflow reads and rewrites.
#[derive(Debug, Clone, Deserialize)]
pub struct PathsCfg {
    #[serde(default = "default_crypttab")]
    pub crypttab: PathBuf,

    #[serde(default = "default_dracut_conf")]
    pub dracut_conf: PathBuf,

    #[serde(default = "default_key_dir")]
    pub key_dir: PathBuf,

    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    #[serde(default = "default_grub_config")]
    pub grub_config: PathBuf,
}

fn default_crypttab() -> PathBuf {
    PathBuf::from("/etc/crypttab")
}

fn default_dracut_conf() -> PathBuf {
    PathBuf::from("/etc/dracut.conf.d/10-crypt.conf")
}

fn default_key_dir() -> PathBuf {
    PathBuf::from("/boot")
}

fn default_key_prefix() -> String {
    "crypto_keyfile_".to_string()
}

fn default_grub_config() -> PathBuf {
    PathBuf::from("/boot/grub2/grub.cfg")
}

impl Default for PathsCfg {
    fn default() -> Self {
        Self {
            crypttab: default_crypttab(),
            dracut_conf: default_dracut_conf(),
            key_dir: default_key_dir(),
            key_prefix: default_key_prefix(),
            grub_config: default_grub_config(),
        }
    }
}

/// Key material shape and the crypttab options written alongside it.
#[derive(Debug, Clone, Deserialize)]
pub struct KeysCfg {
    #[serde(default = "default_key_size")]
    pub size_bytes: usize,

    #[serde(default = "default_crypttab_options")]
    pub crypttab_options: String,
}

fn default_key_size() -> usize {
    2048
}

fn default_crypttab_options() -> String {
    "luks,discard".to_string()
}

impl Default for KeysCfg {
    fn default() -> Self {
        Self {
            size_bytes: default_key_size(),
            crypttab_options: default_crypttab_options(),
        }
    }
}

/// Optional absolute overrides for the external tools.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolsCfg {
    #[serde(default)]
    pub cryptsetup: Option<String>,

    #[serde(default)]
    pub blkid: Option<String>,

    #[serde(default)]
    pub dracut: Option<String>,

    #[serde(default)]
    pub lsinitrd: Option<String>,

    #[serde(default)]
    pub grub_mkconfig: Option<String>,
}

impl ToolsCfg {
    fn override_for(&self, tool: Tool) -> Option<&str> {
        let value = match tool {
            Tool::Cryptsetup => self.cryptsetup.as_deref(),
            Tool::Blkid => self.blkid.as_deref(),
            Tool::Dracut => self.dracut.as_deref(),
            Tool::Lsinitrd => self.lsinitrd.as_deref(),
            Tool::GrubMkconfig => self.grub_mkconfig.as_deref(),
        };
        value.map(str::trim).filter(|path| !path.is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutCfg {
    #[serde(default = "default_command_secs")]
    pub command_secs: u64,

    /// Applies to `dracut` and `grub2-mkconfig`, which routinely take minutes.
    #[serde(default = "default_initramfs_secs")]
    pub initramfs_secs: u64,
}

fn default_command_secs() -> u64 {
    60
}

fn default_initramfs_secs() -> u64 {
    900
}

impl Default for TimeoutCfg {
    fn default() -> Self {
        Self {
            command_secs: default_command_secs(),
            initramfs_secs: default_initramfs_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingCfg {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingCfg {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Top-level configuration snapshot loaded from disk.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AutounlockConfig {
    #[serde(default)]
    pub paths: PathsCfg,

    #[serde(default)]
    pub keys: KeysCfg,

    #[serde(default)]
    pub tools: ToolsCfg,

    #[serde(default)]
    pub timeouts: TimeoutCfg,

    #[serde(default)]
    pub logging: LoggingCfg,

    #[serde(skip)]
    pub path: Option<PathBuf>,

    #[serde(skip)]
    pub format: ConfigFormat,
}

/// Tracks whether we parsed TOML or YAML.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConfigFormat {
    #[default]
    Toml,
    Yaml,
}

/// Absolute paths of every tool, as resolved by the dependency guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPaths {
    pub cryptsetup: PathBuf,
    pub blkid: PathBuf,
    pub dracut: PathBuf,
    pub lsinitrd: PathBuf,
    pub grub_mkconfig: PathBuf,
}

impl AutounlockConfig {
    /// Return the canonical system-wide configuration path.
    pub fn default_path() -> &'static Path {
        Path::new(DEFAULT_CONFIG_PATH)
    }

    /// Load `path`, falling back to built-in defaults when the default path is absent.
    ///
    /// An explicitly requested path that does not exist is an error.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> AutounlockResult<Self> {
        let target = path.as_ref();
        if target.exists() {
            return Self::load(target);
        }
        if target == Self::default_path() {
            debug!(
                "no configuration at {}; using built-in defaults",
                target.display()
            );
            return Ok(Self::default());
        }
        Err(AutounlockError::InvalidConfig(format!(
            "configuration file {} does not exist",
            target.display()
        )))
    }

    /// Read a config file from disk and detect its format from the extension.
    pub fn load<P: AsRef<Path>>(path: P) -> AutounlockResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let is_yaml = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some(ext) if ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml")
        );
        let mut cfg = if is_yaml {
            serde_yaml::from_str::<Self>(&contents)?
        } else {
            toml::from_str::<Self>(&contents)?
        };

        cfg.path = Some(path.to_path_buf());
        cfg.format = if is_yaml {
            ConfigFormat::Yaml
        } else {
            ConfigFormat::Toml
        };
        Ok(cfg)
    }

    /// Where this snapshot came from, for the startup log line.
    pub fn source_description(&self) -> String {
        match &self.path {
            Some(path) => {
                let format = match self.format {
                    ConfigFormat::Toml => "TOML",
                    ConfigFormat::Yaml => "YAML",
                };
                format!("{format} configuration {}", path.display())
            }
            None => "built-in default configuration".to_string(),
        }
    }

    /// Perform a validation pass and return human-readable issues.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        for (field, value) in [
            ("paths.crypttab", &self.paths.crypttab),
            ("paths.dracut_conf", &self.paths.dracut_conf),
            ("paths.key_dir", &self.paths.key_dir),
            ("paths.grub_config", &self.paths.grub_config),
        ] {
            if !value.is_absolute() {
                issues.push(format!("{field} must be an absolute path (got {})", value.display()));
            }
        }

        if self.paths.key_prefix.contains('/') {
            issues.push("paths.key_prefix must not contain `/`".to_string());
        }

        if self.keys.size_bytes == 0 {
            issues.push("keys.size_bytes must be greater than 0".to_string());
        }

        let options = self.keys.crypttab_options.trim();
        if options.is_empty() {
            issues.push("keys.crypttab_options must not be empty".to_string());
        } else if options.chars().any(char::is_whitespace) {
            issues.push("keys.crypttab_options must not contain whitespace".to_string());
        }

        if self.timeouts.command_secs == 0 {
            issues.push("timeouts.command_secs must be greater than 0".to_string());
        }
        if self.timeouts.initramfs_secs == 0 {
            issues.push("timeouts.initramfs_secs must be greater than 0".to_string());
        }

        issues
    }

    /// Deterministic key file location for a volume name.
    pub fn key_file_path(&self, volume: &str) -> PathBuf {
        self.paths
            .key_dir
            .join(format!("{}{volume}.bin", self.paths.key_prefix))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.command_secs)
    }

    pub fn initramfs_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.initramfs_secs)
    }

    /// Resolve a single tool: configured override, well-known locations, then `PATH`.
    pub fn resolve_tool(&self, tool: Tool) -> AutounlockResult<PathBuf> {
        if let Some(path) = self.tools.override_for(tool) {
            let candidate = Path::new(path);
            if !candidate.exists() {
                return Err(AutounlockError::MissingTool {
                    tool: tool.binary_name().to_string(),
                    tried: candidate.display().to_string(),
                });
            }
            return Ok(candidate.to_path_buf());
        }

        if let Some(found) = detect_binary_path(tool.known_paths()) {
            return Ok(PathBuf::from(found));
        }

        find_in_path(tool.binary_name()).ok_or_else(|| AutounlockError::MissingTool {
            tool: tool.binary_name().to_string(),
            tried: format!("{:?} and PATH", tool.known_paths()),
        })
    }

    /// Resolve every tool, `cryptsetup` first, failing on the first one that is missing.
    pub fn resolve_tools(&self) -> AutounlockResult<ToolPaths> {
        Ok(ToolPaths {
            cryptsetup: self.resolve_tool(Tool::Cryptsetup)?,
            blkid: self.resolve_tool(Tool::Blkid)?,
            dracut: self.resolve_tool(Tool::Dracut)?,
            lsinitrd: self.resolve_tool(Tool::Lsinitrd)?,
            grub_mkconfig: self.resolve_tool(Tool::GrubMkconfig)?,
        })
    }
}

pub(crate) fn detect_binary_path(candidates: &[&str]) -> Option<String> {
    candidates
        .iter()
        .map(Path::new)
        .find(|path| path.exists())
        .map(|path| path.to_string_lossy().into_owned())
}

fn find_in_path(binary: &str) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths).find_map(|dir| {
        let candidate = dir.join(binary);
        if candidate.is_file() {
            Some(candidate)
        } else {
            None
        }
    })
}

//! Named repository definitions for repo-cp
//!
//! The config file is TOML:
//!
//! ```toml
//! [qa-fedora]
//! fedora_root = "https://my.fedora.server.edu:8443/fedora"
//! fedora_user = "syncer"
//! fedora_password = "titanic"
//! allow_overwrite = true
//! strip_digests = ["DC", "RELS-EXT"]
//! ```
//!
//! or the INI form older setups use, with unquoted values and `yes`/`no`
//! flags:
//!
//! ```ini
//! [qa-fedora]
//! fedora_root = https://my.fedora.server.edu:8443/fedora
//! fedora_user = syncer
//! fedora_password = titanic
//! allow_overwrite = yes
//! strip_digests = DC, RELS-EXT
//! ```

use anyhow::{Context, Result, anyhow};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Config file name looked up in the home directory
pub const DEFAULT_CONFIG_NAME: &str = ".repocpcfg";

/// INI section whose values apply to every other section
const INI_DEFAULTS: &str = "DEFAULT";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Repository {name} is not defined in {path} and is not a directory")]
    UnknownRepository { name: String, path: PathBuf },

    #[error("Could not determine the home directory; pass --config")]
    NoHomeDirectory,

    #[error("line {line}: {message}")]
    Ini { line: usize, message: String },
}

/// One `[name]` section
#[derive(Debug, Clone, Deserialize)]
pub struct RepositoryConfig {
    pub fedora_root: String,
    #[serde(default)]
    pub fedora_user: Option<String>,
    #[serde(default)]
    pub fedora_password: Option<String>,
    /// Objects already present here may be replaced
    #[serde(default, deserialize_with = "flag")]
    pub allow_overwrite: bool,
    /// Overrides the datastreams whose digests are dropped on a
    /// checksum-mismatch retry when this repository is the destination
    #[serde(default, deserialize_with = "id_list")]
    pub strip_digests: Option<Vec<String>>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Flag {
    Bool(bool),
    Text(String),
}

/// `true`/`false`, or the INI spellings `yes`/`no`, `on`/`off`, `1`/`0`
fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<bool, D::Error> {
    match Flag::deserialize(deserializer)? {
        Flag::Bool(value) => Ok(value),
        Flag::Text(text) => match text.trim().to_ascii_lowercase().as_str() {
            "yes" | "true" | "on" | "1" => Ok(true),
            "no" | "false" | "off" | "0" => Ok(false),
            other => Err(D::Error::custom(format!("expected yes or no, found {:?}", other))),
        },
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IdList {
    List(Vec<String>),
    Text(String),
}

/// An array of ids, or one comma-separated string
fn id_list<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<Vec<String>>, D::Error> {
    let ids = match IdList::deserialize(deserializer)? {
        IdList::List(ids) => ids,
        IdList::Text(text) => text
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect(),
    };
    Ok(Some(ids))
}

/// Read INI sections into a table of string values
fn parse_ini(contents: &str) -> std::result::Result<toml::Table, ConfigError> {
    let mut sections: Vec<(String, toml::Table)> = Vec::new();
    let mut defaults = toml::Table::new();

    for (n, raw) in contents.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }
        let err = |message: &str| ConfigError::Ini {
            line: n + 1,
            message: message.to_string(),
        };

        if let Some(header) = line.strip_prefix('[') {
            let name = header
                .strip_suffix(']')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .ok_or_else(|| err("malformed section header"))?;
            sections.push((name.to_string(), toml::Table::new()));
            continue;
        }

        let split = line.find(['=', ':']).ok_or_else(|| err("expected key = value"))?;
        let key = line[..split].trim();
        let value = &line[split + 1..];
        if key.is_empty() {
            return Err(err("missing key"));
        }
        let value = unquote(value.trim());
        let table = match sections.last_mut() {
            Some((name, _)) if name.as_str() == INI_DEFAULTS => &mut defaults,
            Some((_, table)) => table,
            None => return Err(err("key outside of a section")),
        };
        table.insert(key.to_string(), toml::Value::String(value.to_string()));
    }

    let mut tables = toml::Table::new();
    for (name, mut table) in sections {
        if name == INI_DEFAULTS {
            continue;
        }
        for (key, value) in &defaults {
            if !table.contains_key(key) {
                table.insert(key.clone(), value.clone());
            }
        }
        tables.insert(name, toml::Value::Table(table));
    }
    Ok(tables)
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = value.strip_prefix(quote).and_then(|v| v.strip_suffix(quote)) {
            return inner;
        }
    }
    value
}

#[derive(Debug, Clone)]
pub struct Config {
    path: PathBuf,
    repositories: BTreeMap<String, RepositoryConfig>,
}

impl Config {
    /// `$HOME/.repocpcfg`
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir().ok_or(ConfigError::NoHomeDirectory)?;
        Ok(home.join(DEFAULT_CONFIG_NAME))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::parse(&contents, path)?;
        debug!(
            "Loaded {} repository definition(s) from {}",
            config.repositories.len(),
            path.display()
        );
        Ok(config)
    }

    /// Like [`from_file`](Self::from_file), but a missing file is an empty
    /// config (directories can still be used as repositories)
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::from_file(path);
        }
        debug!("No config file at {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            repositories: BTreeMap::new(),
        })
    }

    fn parse(contents: &str, path: &Path) -> Result<Self> {
        let table = match toml::from_str::<toml::Table>(contents) {
            Ok(table) => table,
            Err(toml_err) => {
                debug!("{} is not TOML ({}), reading it as INI", path.display(), toml_err.message());
                parse_ini(contents).map_err(|ini_err| {
                    anyhow!(
                        "Invalid config file {}: not TOML ({}) and not INI ({})",
                        path.display(),
                        toml_err.message(),
                        ini_err
                    )
                })?
            }
        };
        let repositories: BTreeMap<String, RepositoryConfig> = toml::Value::Table(table)
            .try_into()
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            repositories,
        })
    }

    pub fn get(&self, name: &str) -> Option<&RepositoryConfig> {
        self.repositories.get(name)
    }

    pub fn unknown(&self, name: &str) -> ConfigError {
        ConfigError::UnknownRepository {
            name: name.to_string(),
            path: self.path.clone(),
        }
    }

    pub fn repository(&self, name: &str) -> Result<&RepositoryConfig> {
        self.get(name).ok_or_else(|| self.unknown(name).into())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.repositories.keys().map(String::as_str)
    }
}

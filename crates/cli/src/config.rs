//! Data directory and `config.toml` resolution.
//!
//! Data dir priority: `--data-dir` > `TASKPILOT_DATA_DIR` env > `~/.taskpilot`.
//! Connection settings come from CLI flags first, then `config.toml`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use serde::Deserialize;
use taskpilot_session::{CredentialSource, HttpCredentialSource, StaticCredentialSource};

const DATA_DIR_ENV: &str = "TASKPILOT_DATA_DIR";
const CONFIG_FILE: &str = "config.toml";

/// Resolve the data directory and create it along with `logs/`.
pub fn init_data_dir(explicit: Option<&Path>) -> anyhow::Result<PathBuf> {
    let dir = pick_data_dir(
        explicit,
        std::env::var_os(DATA_DIR_ENV).map(PathBuf::from),
        dirs::home_dir(),
    )?;
    std::fs::create_dir_all(log_dir(&dir))
        .with_context(|| format!("creating data dir {}", dir.display()))?;
    Ok(dir)
}

fn pick_data_dir(
    explicit: Option<&Path>,
    env: Option<PathBuf>,
    home: Option<PathBuf>,
) -> anyhow::Result<PathBuf> {
    if let Some(p) = explicit {
        return Ok(p.to_path_buf());
    }
    if let Some(p) = env.filter(|p| !p.as_os_str().is_empty()) {
        return Ok(p);
    }
    home.map(|h| h.join(".taskpilot"))
        .ok_or_else(|| anyhow!("HOME directory not found; pass --data-dir"))
}

pub fn log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE)
}

/// Contents of `config.toml`. Every key is optional.
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub server_url: Option<String>,
    pub token_url: Option<String>,
    pub api_key: Option<String>,
    /// Long-lived token, used instead of `token_url` when set.
    pub token: Option<String>,
    pub defaults: RunDefaults,
}

/// Default `run` parameters
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RunDefaults {
    pub mode: Option<String>,
    pub model: Option<String>,
    pub source: Option<String>,
    pub frontend: Option<bool>,
}

impl FileConfig {
    /// Load `config.toml`; a missing file is an empty config.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }
}

/// Connection flags as given on the command line
#[derive(Debug, Default, Clone)]
pub struct ConnectionOverrides {
    pub server_url: Option<String>,
    pub token_url: Option<String>,
    pub api_key: Option<String>,
    pub token: Option<String>,
}

pub struct Connection {
    pub server_url: String,
    pub credentials: Arc<dyn CredentialSource>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("server_url", &self.server_url)
            .finish_non_exhaustive()
    }
}

/// Merge flags over the file. A static token wins over a token endpoint.
pub fn resolve_connection(
    flags: ConnectionOverrides,
    file: &FileConfig,
) -> anyhow::Result<Connection> {
    let server_url = flags
        .server_url
        .or_else(|| file.server_url.clone())
        .ok_or_else(|| anyhow!("no server URL; pass --server-url or set server_url in config.toml"))?;

    let token = flags.token.or_else(|| file.token.clone());
    let token_url = flags.token_url.or_else(|| file.token_url.clone());
    let api_key = flags.api_key.or_else(|| file.api_key.clone());

    let credentials: Arc<dyn CredentialSource> = match (token, token_url) {
        (Some(token), _) => Arc::new(StaticCredentialSource::new(token)),
        (None, Some(url)) => Arc::new(HttpCredentialSource::new(url, api_key)),
        (None, None) => {
            return Err(anyhow!(
                "no credential source; pass --token-url or --token, or set one in config.toml"
            ))
        }
    };

    Ok(Connection {
        server_url,
        credentials,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_data_dir_wins() {
        let dir = pick_data_dir(
            Some(Path::new("/tmp/explicit")),
            Some(PathBuf::from("/tmp/env")),
            Some(PathBuf::from("/home/me")),
        )
        .expect("resolved");
        assert_eq!(dir, PathBuf::from("/tmp/explicit"));
    }

    #[test]
    fn env_then_home_fallback() {
        let dir = pick_data_dir(None, Some(PathBuf::from("/tmp/env")), Some(PathBuf::from("/home/me")))
            .expect("resolved");
        assert_eq!(dir, PathBuf::from("/tmp/env"));

        let dir = pick_data_dir(None, Some(PathBuf::new()), Some(PathBuf::from("/home/me")))
            .expect("resolved");
        assert_eq!(dir, PathBuf::from("/home/me/.taskpilot"));

        assert!(pick_data_dir(None, None, None).is_err());
    }

    #[test]
    fn init_creates_log_dir() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let data = tmp.path().join("data");
        let dir = init_data_dir(Some(&data)).expect("init");
        assert!(log_dir(&dir).is_dir());
    }

    #[test]
    fn missing_config_is_empty() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let config = FileConfig::load(&config_path(tmp.path())).expect("load");
        assert_eq!(config, FileConfig::default());
    }

    #[test]
    fn config_file_parses_defaults_table() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = config_path(tmp.path());
        std::fs::write(
            &path,
            r#"
server_url = "wss://engine.example.com/ws"
token_url = "https://engine.example.com/token"
api_key = "key-123"

[defaults]
mode = "agent"
model = "gpt-4o"
frontend = true
"#,
        )
        .expect("write");

        let config = FileConfig::load(&path).expect("load");
        assert_eq!(config.server_url.as_deref(), Some("wss://engine.example.com/ws"));
        assert_eq!(config.defaults.mode.as_deref(), Some("agent"));
        assert_eq!(config.defaults.frontend, Some(true));
        assert_eq!(config.defaults.source, None);
    }

    #[test]
    fn malformed_config_is_an_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = config_path(tmp.path());
        std::fs::write(&path, "server_url = [").expect("write");
        assert!(FileConfig::load(&path).is_err());
    }

    #[test]
    fn flags_override_file() {
        let file = FileConfig {
            server_url: Some("wss://file/ws".into()),
            token_url: Some("https://file/token".into()),
            ..Default::default()
        };
        let connection = resolve_connection(
            ConnectionOverrides {
                server_url: Some("wss://flag/ws".into()),
                ..Default::default()
            },
            &file,
        )
        .expect("resolved");
        assert_eq!(connection.server_url, "wss://flag/ws");
    }

    #[test]
    fn missing_server_or_credentials_is_an_error() {
        let err = resolve_connection(ConnectionOverrides::default(), &FileConfig::default())
            .expect_err("no server");
        assert!(err.to_string().contains("server URL"));

        let file = FileConfig {
            server_url: Some("wss://file/ws".into()),
            ..Default::default()
        };
        let err = resolve_connection(ConnectionOverrides::default(), &file)
            .expect_err("no credentials");
        assert!(err.to_string().contains("credential source"));
    }
}

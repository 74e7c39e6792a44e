use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::{AnyError, DEFAULT_SERVER, ID_LEN, PSK_LEN};

/// User-specific information for the transfer. In general, it needs to
/// be consistent across all devices of a user.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub id: String,
    pub psk: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(rename = "ipv6", default, skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<u16>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upnp: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Vec<String>>,
}

impl Config {
    pub fn server(&self) -> &str {
        self.server.as_deref().unwrap_or(DEFAULT_SERVER)
    }

    pub fn use_ipv6(&self) -> bool {
        self.ipv6.unwrap_or(false)
    }

    pub fn ports(&self) -> Vec<u16> {
        match &self.ports {
            Some(ports) if !ports.is_empty() => ports.clone(),
            _ => vec![0],
        }
    }

    pub fn upnp(&self) -> bool {
        self.upnp.unwrap_or(false)
    }

    pub fn strategy(&self) -> Vec<String> {
        match &self.strategy {
            Some(strategy) if !strategy.is_empty() => strategy.clone(),
            _ => vec!["tcp_punch".to_string()],
        }
    }
}

pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("acp")
        .join("config.json")
}

/// Initialize the config, or display the current one.
///
/// Without `conf_str` an existing config is kept as is; a missing one is
/// generated with a fresh identity. With `conf_str` (from `--setup-with`
/// on a second device) the given value is strict-parsed and persisted.
pub fn setup(conf_str: Option<&str>, path: &Path) -> Result<(), AnyError> {
    let conf = match conf_str {
        Some(conf_str) => {
            let mut conf: Config = serde_json::from_str(conf_str)?;
            if conf.strategy.is_none() {
                conf.strategy = infer_strategy();
            }
            store(&conf, path)?;
            conf
        }
        None => match load(path) {
            Ok(conf) => conf,
            Err(e) if e.downcast_ref::<MissingConfig>().is_some() => {
                let conf = Config {
                    id: BASE64.encode(rand_bytes(ID_LEN)),
                    psk: BASE64.encode(rand_bytes(PSK_LEN)),
                    server: None,
                    ipv6: None,
                    ports: None,
                    upnp: None,
                    strategy: infer_strategy(),
                };
                store(&conf, path)?;
                conf
            }
            Err(e) => return Err(e),
        },
    };

    let conf_json = serde_json::to_string(&conf)?;
    println!(
        "acp is set up on this machine. To set up another machine, run the following command there
(DO NOT share the command publicly as it contains encryption keys)

    curl -fsS {}/get | sh -s -- --setup-with '{conf_json}'

If you already have the executable, run

    acp --setup-with '{conf_json}'
",
        conf.server()
    );
    Ok(())
}

pub fn load(path: &Path) -> Result<Config, AnyError> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(MissingConfig.into()),
        Err(e) => return Err(format!("error opening config: {e}").into()),
    };
    serde_json::from_slice(&data).map_err(|e| format!("error parsing config: {e}").into())
}

fn store(conf: &Config, path: &Path) -> Result<(), AnyError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .map_err(|e| format!("error writing config to {}: {e}", path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
        }
    }
    fs::write(path, serde_json::to_vec(conf)?)
        .map_err(|e| format!("error writing config to {}: {e}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

// Devices already on a tailnet get the overlay dialer tried first.
fn infer_strategy() -> Option<Vec<String>> {
    let found = std::process::Command::new("tailscale")
        .arg("version")
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false);
    if found {
        Some(vec!["tailscale".to_string(), "tcp_punch".to_string()])
    } else {
        None
    }
}

fn rand_bytes(n: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; n];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

#[derive(Debug)]
pub struct MissingConfig;

impl std::fmt::Display for MissingConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Config not found. If this is your first time using acp, run `acp --setup` to generate a config"
        )
    }
}

impl std::error::Error for MissingConfig {}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_config() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("acp").join("config.json");
        (dir, path)
    }

    #[test]
    fn test_setup_generates_identity() {
        let (_dir, path) = temp_config();
        assert!(load(&path).is_err());

        setup(None, &path).unwrap();
        let conf = load(&path).unwrap();
        assert_eq!(conf.id.len(), 8);
        assert_eq!(BASE64.decode(&conf.psk).unwrap().len(), PSK_LEN);
    }

    #[test]
    fn test_setup_is_idempotent() {
        let (_dir, path) = temp_config();
        setup(None, &path).unwrap();
        let first = load(&path).unwrap();
        setup(None, &path).unwrap();
        let second = load(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_setup_with_persists_fields() {
        let (_dir, path) = temp_config();
        let given = Config {
            id: "AAAAAAAA".into(),
            psk: "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=".into(),
            server: Some("http://localhost:8000".into()),
            ipv6: Some(true),
            ports: Some(vec![0, 9527]),
            upnp: None,
            strategy: Some(vec!["tcp_punch".into()]),
        };
        setup(Some(&serde_json::to_string(&given).unwrap()), &path).unwrap();
        let conf = load(&path).unwrap();
        assert_eq!(conf, given);
    }

    #[test]
    fn test_setup_with_rejects_wrong_type() {
        let (_dir, path) = temp_config();
        assert!(setup(Some(r#"{"ipv6":"true"}"#), &path).is_err());
    }

    #[test]
    fn test_defaults() {
        let conf = Config {
            id: "AAAAAAAA".into(),
            psk: "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=".into(),
            server: None,
            ipv6: None,
            ports: None,
            upnp: None,
            strategy: None,
        };
        assert_eq!(conf.server(), DEFAULT_SERVER);
        assert!(!conf.use_ipv6());
        assert_eq!(conf.ports(), vec![0]);
        assert!(!conf.upnp());
        assert_eq!(conf.strategy(), vec!["tcp_punch".to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn test_config_file_mode() {
        use std::os::unix::fs::PermissionsExt;
        let (_dir, path) = temp_config();
        setup(None, &path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}

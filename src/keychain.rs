// Copyright (c) 2019, 2020 Codethink Ltd.
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

//! Registry credentials read from a Docker-style `config.json`.
//!
//! A keychain is picked once per direction (pull or push): either an explicit
//! configuration directory, or the ambient one from `$DOCKER_CONFIG` or
//! `~/.docker`. Nothing here is fatal. A missing or unreadable file, or a
//! host with no entry, resolves to anonymous access.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use oci_distribution::secrets::RegistryAuth;
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, warn};

/// Key Docker Hub credentials are stored under.
pub const DEFAULT_AUTH_KEY: &str = "https://index.docker.io/v1/";
const CONFIG_FILE: &str = "config.json";

#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub auth: String,
    #[serde(default, rename = "identitytoken")]
    pub identity_token: String,
    #[serde(default, rename = "registrytoken")]
    pub registry_token: String,
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("username", &self.username)
            .field("password", &redacted(&self.password))
            .field("auth", &redacted(&self.auth))
            .field("identity_token", &redacted(&self.identity_token))
            .field("registry_token", &redacted(&self.registry_token))
            .finish()
    }
}

fn redacted(secret: &str) -> &'static str {
    if secret.is_empty() {
        ""
    } else {
        "<redacted>"
    }
}

impl AuthConfig {
    fn is_empty(&self) -> bool {
        *self == AuthConfig::default()
    }

    /// Username and password, taken from the explicit fields or decoded from
    /// the base64 `auth` field.
    pub fn basic(&self) -> Option<(String, String)> {
        if !self.username.is_empty() && !self.password.is_empty() {
            return Some((self.username.clone(), self.password.clone()));
        }
        if self.auth.is_empty() {
            return None;
        }
        let decoded = match STANDARD.decode(self.auth.trim()) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("Ignoring undecodable auth field: {}", e);
                return None;
            }
        };
        let decoded = String::from_utf8_lossy(&decoded);
        decoded
            .split_once(':')
            .map(|(user, pass)| (user.to_string(), pass.to_string()))
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    auths: BTreeMap<String, AuthConfig>,
}

/// What a keychain hands out for one registry host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    Anonymous,
    Authenticated(AuthConfig),
}

impl Credentials {
    pub fn to_registry_auth(&self) -> RegistryAuth {
        match self {
            Credentials::Anonymous => RegistryAuth::Anonymous,
            Credentials::Authenticated(config) => match config.basic() {
                Some((user, pass)) => RegistryAuth::Basic(user, pass),
                None => {
                    warn!("Only username/password credentials are supported, using anonymous access");
                    RegistryAuth::Anonymous
                }
            },
        }
    }
}

/// Credentials from the `config.json` in one directory.
///
/// The file is read on first use. Results are cached per host for the
/// lifetime of the keychain.
pub struct DirKeychain {
    dir: PathBuf,
    file: OnceLock<ConfigFile>,
    resolved: Mutex<HashMap<String, Credentials>>,
}

impl DirKeychain {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        DirKeychain {
            dir: dir.into(),
            file: OnceLock::new(),
            resolved: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn resolve(&self, registry: &str) -> Credentials {
        if let Some(found) = self.resolved.lock().get(registry) {
            return found.clone();
        }

        let key = auth_key(registry);
        let file = self.file.get_or_init(|| self.load());
        let credentials = match lookup(&file.auths, key) {
            Some(config) if !config.is_empty() => Credentials::Authenticated(config.clone()),
            _ => Credentials::Anonymous,
        };
        debug!(
            registry,
            key,
            dir = %self.dir.display(),
            anonymous = credentials == Credentials::Anonymous,
            "Resolved registry credentials"
        );

        self.resolved
            .lock()
            .insert(registry.to_string(), credentials.clone());
        credentials
    }

    fn load(&self) -> ConfigFile {
        let path = self.dir.join(CONFIG_FILE);
        if !path.exists() {
            debug!(path = %path.display(), "No registry config file");
            return ConfigFile::default();
        }
        match read_config_file(&path) {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %path.display(), "Ignoring registry config file: {:#}", e);
                ConfigFile::default()
            }
        }
    }
}

impl fmt::Debug for DirKeychain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirKeychain").field("dir", &self.dir).finish()
    }
}

fn read_config_file(path: &Path) -> Result<ConfigFile> {
    let data = fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
    serde_json::from_slice(&data).with_context(|| format!("Failed to parse {:?}", path))
}

/// Where registry credentials come from for one side of a build.
#[derive(Debug)]
pub enum Keychain {
    /// The `config.json` in an explicitly chosen directory.
    Directory(DirKeychain),
    /// The process default. `None` when no home directory can be found.
    Ambient(Option<DirKeychain>),
}

impl Keychain {
    /// An explicit directory when one is given and non-empty, otherwise the
    /// ambient keychain.
    pub fn select(config_dir: Option<&Path>) -> Self {
        match config_dir {
            Some(dir) if !dir.as_os_str().is_empty() => Keychain::Directory(DirKeychain::new(dir)),
            _ => Keychain::Ambient(ambient_config_dir().map(DirKeychain::new)),
        }
    }

    pub fn resolve(&self, registry: &str) -> Credentials {
        match self {
            Keychain::Directory(keychain) | Keychain::Ambient(Some(keychain)) => {
                keychain.resolve(registry)
            }
            Keychain::Ambient(None) => Credentials::Anonymous,
        }
    }
}

fn ambient_config_dir() -> Option<PathBuf> {
    match std::env::var_os("DOCKER_CONFIG") {
        Some(dir) if !dir.is_empty() => Some(PathBuf::from(dir)),
        _ => dirs::home_dir().map(|home| home.join(".docker")),
    }
}

fn auth_key(registry: &str) -> &str {
    match registry {
        "index.docker.io" | "docker.io" | "registry-1.docker.io" => DEFAULT_AUTH_KEY,
        other => other,
    }
}

/// Exact key first, then any entry whose key reduces to the same host.
fn lookup<'a>(auths: &'a BTreeMap<String, AuthConfig>, key: &str) -> Option<&'a AuthConfig> {
    auths.get(key).or_else(|| {
        auths
            .iter()
            .find(|(entry, _)| convert_to_hostname(entry) == key)
            .map(|(_, config)| config)
    })
}

/// Strip the scheme and any path from a config key.
fn convert_to_hostname(url: &str) -> &str {
    let stripped = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
        .unwrap_or(url);
    stripped.split('/').next().unwrap_or(stripped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn keychain_with(config: &str) -> (TempDir, DirKeychain) {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), config).unwrap();
        let keychain = DirKeychain::new(dir.path());
        (dir, keychain)
    }

    #[test]
    fn username_and_password() {
        let (_dir, keychain) = keychain_with(
            r#"{"auths": {"registry.example.com": {"username": "alice", "password": "s3cret"}}}"#,
        );
        let credentials = keychain.resolve("registry.example.com");
        assert!(matches!(
            credentials.to_registry_auth(),
            RegistryAuth::Basic(ref u, ref p) if u == "alice" && p == "s3cret"
        ));
    }

    #[test]
    fn encoded_auth_field() {
        let encoded = STANDARD.encode("bob:hunter2");
        let (_dir, keychain) = keychain_with(&format!(
            r#"{{"auths": {{"https://index.docker.io/v1/": {{"auth": "{}"}}}}}}"#,
            encoded
        ));
        for host in ["index.docker.io", "docker.io", "registry-1.docker.io"] {
            let auth = keychain.resolve(host).to_registry_auth();
            assert!(
                matches!(auth, RegistryAuth::Basic(ref u, ref p) if u == "bob" && p == "hunter2"),
                "{}",
                host
            );
        }
    }

    #[test]
    fn hostname_normalized_key() {
        let (_dir, keychain) = keychain_with(
            r#"{"auths": {"https://ghcr.io/v2/": {"username": "u", "password": "p"}}}"#,
        );
        assert!(matches!(keychain.resolve("ghcr.io"), Credentials::Authenticated(_)));
        assert_eq!(keychain.resolve("quay.io"), Credentials::Anonymous);
    }

    #[test]
    fn missing_file_is_anonymous() {
        let dir = TempDir::new().unwrap();
        let keychain = Keychain::select(Some(dir.path()));
        assert!(matches!(keychain, Keychain::Directory(_)));
        assert_eq!(keychain.resolve("registry.example.com"), Credentials::Anonymous);
    }

    #[test]
    fn malformed_file_is_anonymous() {
        let (_dir, keychain) = keychain_with("{not json");
        assert_eq!(keychain.resolve("registry.example.com"), Credentials::Anonymous);
    }

    #[test]
    fn empty_entry_is_anonymous() {
        let (_dir, keychain) = keychain_with(r#"{"auths": {"registry.example.com": {}}}"#);
        assert_eq!(keychain.resolve("registry.example.com"), Credentials::Anonymous);
    }

    #[test]
    fn token_only_entry_falls_back_to_anonymous() {
        let (_dir, keychain) = keychain_with(
            r#"{"auths": {"registry.example.com": {"identitytoken": "abc"}}}"#,
        );
        let credentials = keychain.resolve("registry.example.com");
        assert!(matches!(credentials, Credentials::Authenticated(_)));
        assert!(matches!(credentials.to_registry_auth(), RegistryAuth::Anonymous));
    }

    #[test]
    fn results_are_cached() {
        let (dir, keychain) = keychain_with(
            r#"{"auths": {"registry.example.com": {"username": "u", "password": "p"}}}"#,
        );
        assert!(matches!(keychain.resolve("registry.example.com"), Credentials::Authenticated(_)));
        fs::remove_file(dir.path().join(CONFIG_FILE)).unwrap();
        assert!(matches!(keychain.resolve("registry.example.com"), Credentials::Authenticated(_)));
    }

    #[test]
    fn empty_dir_selects_ambient() {
        assert!(matches!(Keychain::select(Some(Path::new(""))), Keychain::Ambient(_)));
        assert!(matches!(Keychain::select(None), Keychain::Ambient(_)));
    }

    #[test]
    fn secrets_stay_out_of_debug_output() {
        let config = AuthConfig {
            username: "alice".to_string(),
            password: "s3cret".to_string(),
            ..Default::default()
        };
        let shown = format!("{:?}", config);
        assert!(shown.contains("alice"));
        assert!(!shown.contains("s3cret"));
    }

    #[test]
    fn hostnames() {
        assert_eq!(convert_to_hostname("https://index.docker.io/v1/"), "index.docker.io");
        assert_eq!(convert_to_hostname("http://localhost:5000"), "localhost:5000");
        assert_eq!(convert_to_hostname("quay.io"), "quay.io");
    }
}

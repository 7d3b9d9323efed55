//! Filesystem reconciler
//!
//! Owns the on-disk contract with nginx: fragment files under
//! sites-available, activation symlinks under sites-enabled, persisted
//! state JSON, certificate material and custom HTML bodies under the data
//! directory. All fragment writes are write-then-rename.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;

use crate::error::AppError;

/// Prior on-disk state of one fragment, captured before a mutation so the
/// orchestrator can restore it bit-identically after a failed `nginx -t`.
#[derive(Debug, Clone)]
pub struct FragmentStash {
    pub name: String,
    pub content: Option<Vec<u8>>,
    pub enabled: bool,
}

pub struct Reconciler {
    sites_available: PathBuf,
    sites_enabled: PathBuf,
    data_dir: PathBuf,
}

impl Reconciler {
    pub fn new(sites_available: &str, sites_enabled: &str, data_dir: &str) -> Self {
        Self {
            sites_available: PathBuf::from(sites_available),
            sites_enabled: PathBuf::from(sites_enabled),
            data_dir: PathBuf::from(data_dir),
        }
    }

    pub fn available_path(&self, name: &str) -> PathBuf {
        self.sites_available.join(name)
    }

    pub fn enabled_path(&self, name: &str) -> PathBuf {
        self.sites_enabled.join(name)
    }

    pub fn html_dir(&self) -> PathBuf {
        self.data_dir.join("html")
    }

    pub fn certs_dir(&self) -> PathBuf {
        self.data_dir.join("certs")
    }

    pub fn account_key_path(&self) -> PathBuf {
        self.data_dir.join("certs").join("letsencrypt").join("user.key")
    }

    /// Write a fragment under sites-available and set the activation
    /// symlink to match `enabled`.
    pub async fn materialize(
        &self,
        name: &str,
        content: &str,
        enabled: bool,
    ) -> Result<(), AppError> {
        ensure_dir(&self.sites_available).await?;
        ensure_dir(&self.sites_enabled).await?;

        let target = self.available_path(name);
        atomic_write(&target, content.as_bytes()).await?;

        self.set_enabled(name, enabled).await
    }

    /// Create or remove the sites-enabled symlink for an existing fragment.
    pub async fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), AppError> {
        let target = self.available_path(name);
        let link = self.enabled_path(name);

        // A stale link must be removed before re-linking either way.
        match fs::symlink_metadata(&link).await {
            Ok(_) => fs::remove_file(&link).await?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if enabled {
            fs::symlink(&target, &link).await?;
        }
        Ok(())
    }

    /// Remove the symlink then the available file. Missing files are not
    /// errors.
    pub async fn withdraw(&self, name: &str) -> Result<(), AppError> {
        let link = self.enabled_path(name);
        match fs::symlink_metadata(&link).await {
            Ok(_) => fs::remove_file(&link).await?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let target = self.available_path(name);
        match fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Capture a fragment's current bytes and activation state.
    pub async fn stash(&self, name: &str) -> FragmentStash {
        let content = fs::read(self.available_path(name)).await.ok();
        let enabled = fs::symlink_metadata(self.enabled_path(name)).await.is_ok();
        FragmentStash {
            name: name.to_string(),
            content,
            enabled,
        }
    }

    /// Restore a fragment to its stashed state.
    pub async fn restore(&self, stash: &FragmentStash) -> Result<(), AppError> {
        match &stash.content {
            Some(bytes) => {
                let target = self.available_path(&stash.name);
                atomic_write(&target, bytes).await?;
                self.set_enabled(&stash.name, stash.enabled).await
            }
            None => self.withdraw(&stash.name).await,
        }
    }

    // ------------------------------------------------------------------
    // Persisted state JSON
    // ------------------------------------------------------------------

    /// Persist one state map as pretty-printed JSON under the data dir.
    pub async fn persist_json<T: Serialize>(&self, file: &str, value: &T) -> Result<(), AppError> {
        ensure_dir(&self.data_dir).await?;
        let json = serde_json::to_vec_pretty(value)?;
        atomic_write(&self.data_dir.join(file), &json).await
    }

    /// Load one state map. A missing or unparsable file yields the default
    /// with a logged warning; a first run has no file, so this is never
    /// fatal.
    pub async fn load_json<T: DeserializeOwned + Default>(&self, file: &str) -> T {
        let path = self.data_dir.join(file);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return T::default(),
            Err(e) => {
                tracing::warn!("Failed to read {} ({}), starting empty", path.display(), e);
                return T::default();
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(
                    "Failed to parse {} ({}), starting empty",
                    path.display(),
                    e
                );
                T::default()
            }
        }
    }

    // ------------------------------------------------------------------
    // Certificate material
    // ------------------------------------------------------------------

    /// Write cert/key (and optional chain) PEM under `certs/`, key mode
    /// 0600. Returns (cert_path, key_path, chain_path).
    pub async fn write_cert_files(
        &self,
        id: &str,
        cert_pem: &str,
        key_pem: &str,
        chain_pem: Option<&str>,
    ) -> Result<(String, String, Option<String>), AppError> {
        let dir = self.certs_dir();
        ensure_dir(&dir).await?;

        let cert_path = dir.join(format!("{}.crt", id));
        let key_path = dir.join(format!("{}.key", id));
        atomic_write(&cert_path, cert_pem.as_bytes()).await?;
        atomic_write(&key_path, key_pem.as_bytes()).await?;
        fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600)).await?;

        let chain_path = match chain_pem {
            Some(chain) => {
                let path = dir.join(format!("{}.chain.crt", id));
                atomic_write(&path, chain.as_bytes()).await?;
                Some(path.to_string_lossy().into_owned())
            }
            None => None,
        };

        Ok((
            cert_path.to_string_lossy().into_owned(),
            key_path.to_string_lossy().into_owned(),
            chain_path,
        ))
    }

    pub async fn remove_cert_files(&self, id: &str) {
        let dir = self.certs_dir();
        for file in [
            format!("{}.crt", id),
            format!("{}.key", id),
            format!("{}.chain.crt", id),
        ] {
            let path = dir.join(file);
            if let Err(e) = fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("Failed to remove {} (non-fatal): {}", path.display(), e);
                }
            }
        }
    }

    /// Write the ACME account credentials, mode 0600.
    pub async fn write_account_key(&self, bytes: &[u8]) -> Result<(), AppError> {
        let path = self.account_key_path();
        if let Some(parent) = path.parent() {
            ensure_dir(parent).await?;
        }
        atomic_write(&path, bytes).await?;
        fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await?;
        Ok(())
    }

    pub async fn read_account_key(&self) -> Option<Vec<u8>> {
        fs::read(self.account_key_path()).await.ok()
    }

    // ------------------------------------------------------------------
    // Custom HTML bodies
    // ------------------------------------------------------------------

    /// Write one HTML body into the html dir (`nubi_default.html`,
    /// `nubi_error_<code>.html`).
    pub async fn write_html_body(&self, file: &str, body: &str) -> Result<(), AppError> {
        let dir = self.html_dir();
        ensure_dir(&dir).await?;
        atomic_write(&dir.join(file), body.as_bytes()).await
    }
}

async fn ensure_dir(dir: &Path) -> Result<(), AppError> {
    if fs::metadata(dir).await.is_ok() {
        return Ok(());
    }
    fs::create_dir_all(dir).await?;
    fs::set_permissions(dir, std::fs::Permissions::from_mode(0o755)).await?;
    Ok(())
}

/// Write to a sibling temp file then rename into place.
async fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), AppError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| AppError::Internal(format!("bad path: {}", path.display())))?;
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));
    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn reconciler(root: &TempDir) -> Reconciler {
        Reconciler::new(
            root.path().join("available").to_str().unwrap(),
            root.path().join("enabled").to_str().unwrap(),
            root.path().join("data").to_str().unwrap(),
        )
    }

    #[tokio::test]
    async fn test_materialize_and_symlink() {
        let root = TempDir::new().unwrap();
        let r = reconciler(&root);

        r.materialize("nubi-host-a_b.conf", "server {}", true)
            .await
            .unwrap();
        let available = r.available_path("nubi-host-a_b.conf");
        let enabled = r.enabled_path("nubi-host-a_b.conf");
        assert_eq!(fs::read_to_string(&available).await.unwrap(), "server {}");
        assert!(fs::symlink_metadata(&enabled).await.is_ok());

        // Disabling keeps the fragment but drops the link.
        r.materialize("nubi-host-a_b.conf", "server {}", false)
            .await
            .unwrap();
        assert!(fs::symlink_metadata(&enabled).await.is_err());
        assert!(fs::metadata(&available).await.is_ok());
    }

    #[tokio::test]
    async fn test_withdraw_is_idempotent() {
        let root = TempDir::new().unwrap();
        let r = reconciler(&root);

        r.materialize("x.conf", "a", true).await.unwrap();
        r.withdraw("x.conf").await.unwrap();
        assert!(fs::metadata(r.available_path("x.conf")).await.is_err());
        // Withdrawing again is a no-op.
        r.withdraw("x.conf").await.unwrap();
    }

    #[tokio::test]
    async fn test_stash_and_restore_round_trip() {
        let root = TempDir::new().unwrap();
        let r = reconciler(&root);

        r.materialize("y.conf", "original", true).await.unwrap();
        let stash = r.stash("y.conf").await;

        r.materialize("y.conf", "broken", true).await.unwrap();
        r.restore(&stash).await.unwrap();
        assert_eq!(
            fs::read_to_string(r.available_path("y.conf")).await.unwrap(),
            "original"
        );
        assert!(fs::symlink_metadata(r.enabled_path("y.conf")).await.is_ok());
    }

    #[tokio::test]
    async fn test_restore_removes_fragment_that_did_not_exist() {
        let root = TempDir::new().unwrap();
        let r = reconciler(&root);

        let stash = r.stash("z.conf").await;
        assert!(stash.content.is_none());

        r.materialize("z.conf", "new", true).await.unwrap();
        r.restore(&stash).await.unwrap();
        assert!(fs::metadata(r.available_path("z.conf")).await.is_err());
        assert!(fs::symlink_metadata(r.enabled_path("z.conf")).await.is_err());
    }

    #[tokio::test]
    async fn test_json_round_trip_and_tolerant_load() {
        let root = TempDir::new().unwrap();
        let r = reconciler(&root);

        let hosts: Vec<String> = vec!["a".into(), "b".into()];
        r.persist_json("proxy_hosts.json", &hosts).await.unwrap();
        let loaded: Vec<String> = r.load_json("proxy_hosts.json").await;
        assert_eq!(loaded, hosts);

        // Corrupt file degrades to empty, not an error.
        fs::create_dir_all(root.path().join("data")).await.unwrap();
        fs::write(root.path().join("data/tags.json"), b"{not json")
            .await
            .unwrap();
        let tags: Vec<String> = r.load_json("tags.json").await;
        assert!(tags.is_empty());

        // Missing file is a first run.
        let certs: Vec<String> = r.load_json("certificates.json").await;
        assert!(certs.is_empty());
    }

    #[tokio::test]
    async fn test_cert_files_and_key_mode() {
        let root = TempDir::new().unwrap();
        let r = reconciler(&root);

        let (cert, key, chain) = r
            .write_cert_files("abc", "CERT", "KEY", Some("CHAIN"))
            .await
            .unwrap();
        assert_eq!(fs::read_to_string(&cert).await.unwrap(), "CERT");
        assert_eq!(fs::read_to_string(&key).await.unwrap(), "KEY");
        assert_eq!(
            fs::read_to_string(chain.as_deref().unwrap()).await.unwrap(),
            "CHAIN"
        );

        let mode = fs::metadata(&key).await.unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        r.remove_cert_files("abc").await;
        assert!(fs::metadata(&cert).await.is_err());
    }
}

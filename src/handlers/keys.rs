//! Host key management

use anyhow::{Context, Result};
use russh::keys::{Algorithm, PrivateKey};
use std::path::Path;
use tracing::info;

/// Load the host key, generating and saving an Ed25519 key on first start.
pub fn load_or_generate_host_key(path: &Path) -> Result<PrivateKey> {
    if path.exists() {
        let key = load_host_key(path)?;
        info!(path = %path.display(), algorithm = %key.algorithm().as_str(), "Loaded host key");
        Ok(key)
    } else {
        let key = PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519)
            .map_err(|e| anyhow::anyhow!("Ed25519 key generation failed: {}", e))?;
        save_host_key(&key, path)?;
        info!(path = %path.display(), "Generated new Ed25519 host key");
        Ok(key)
    }
}

fn load_host_key(path: &Path) -> Result<PrivateKey> {
    let pem = std::fs::read_to_string(path)
        .with_context(|| format!("reading host key: {}", path.display()))?;
    russh::keys::decode_secret_key(&pem, None)
        .map_err(|e| anyhow::anyhow!("decoding host key {}: {}", path.display(), e))
}

fn save_host_key(key: &PrivateKey, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating directory: {}", parent.display()))?;
    }

    let mut pem = Vec::new();
    russh::keys::encode_pkcs8_pem(key, &mut pem)
        .map_err(|e| anyhow::anyhow!("encoding host key: {}", e))?;

    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .with_context(|| format!("creating host key file: {}", path.display()))?;
        file.write_all(&pem)
            .with_context(|| format!("writing host key: {}", path.display()))?;
    }

    #[cfg(not(unix))]
    std::fs::write(path, &pem).with_context(|| format!("writing host key: {}", path.display()))?;

    Ok(())
}

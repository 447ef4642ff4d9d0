//! The daemon's ed25519 identity file.

use std::path::Path;

use anyhow::Context;
use tracing::info;

use snodekit_shared::identity::IdentityExport;
use snodekit_shared::Identity;

/// Load the identity at `path`, generating and saving one when the file does
/// not exist yet.
pub fn load_or_create(path: &Path) -> anyhow::Result<Identity> {
    if path.exists() {
        let raw = std::fs::read(path)
            .with_context(|| format!("reading identity file {}", path.display()))?;
        let export: IdentityExport =
            serde_json::from_slice(&raw).context("identity file is not valid JSON")?;
        let identity = Identity::from_export(&export);
        if identity.public_key_bytes() != export.public_key {
            anyhow::bail!("identity file {} has a mismatched public key", path.display());
        }
        return Ok(identity);
    }

    let identity = Identity::generate();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let raw = serde_json::to_vec_pretty(&identity.to_export())?;
    std::fs::write(path, raw).with_context(|| format!("writing identity file {}", path.display()))?;
    info!(path = %path.display(), "Generated a new identity");
    Ok(identity)
}

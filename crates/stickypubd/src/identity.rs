//! Local node identity: a persisted Ed25519 seed so `stickypubd` recovers
//! the same publisher/subscriber key across restarts instead of minting a
//! fresh one every run.

use std::fs;
use std::path::Path;

use stickypub_core::KeyPair;

/// Load the keypair seed from `path`, generating and persisting a fresh one
/// if the file doesn't exist yet.
pub fn load_or_generate(path: &Path) -> anyhow::Result<KeyPair> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    if let Ok(bytes) = fs::read(path) {
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("identity file {} is not a 32-byte seed", path.display()))?;
        return Ok(KeyPair::from_seed(&seed));
    }

    let keypair = KeyPair::generate();
    fs::write(path, keypair.seed())?;
    Ok(keypair)
}

use std::{
    fs::{self, DirBuilder, OpenOptions},
    io::Write,
    os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use rand::rngs::OsRng;
use rsa::{
    pkcs8::{EncodePrivateKey, LineEnding},
    RsaPrivateKey,
};
use tracing::info;

const KEY_BITS: usize = 2048;

#[derive(Debug, Clone)]
pub struct KeyPair {
    pub private_key: String,
    pub public_key: String,
    pub private_key_path: PathBuf,
}

impl KeyPair {
    /// Paths only, for graphs that are inspected but never run.
    pub fn unloaded(realm: &Path) -> Self {
        Self {
            private_key: String::new(),
            public_key: String::new(),
            private_key_path: realm.join("id_rsa"),
        }
    }
}

/// Returns the realm's RSA keypair, generating and storing it on first use.
/// A realm holding only one half of the pair gets a fresh pair.
pub fn ensure_keypair(realm: &Path) -> Result<KeyPair> {
    let private_path = realm.join("id_rsa");
    let public_path = realm.join("id_rsa.pub");

    if private_path.is_file() && public_path.is_file() {
        info!("reusing keypair in {}", realm.display());
        return Ok(KeyPair {
            private_key: fs::read_to_string(&private_path)
                .with_context(|| format!("could not read {}", private_path.display()))?,
            public_key: fs::read_to_string(&public_path)
                .with_context(|| format!("could not read {}", public_path.display()))?,
            private_key_path: private_path,
        });
    }

    DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(realm)
        .with_context(|| format!("could not create realm {}", realm.display()))?;

    info!("generating {KEY_BITS} bit RSA keypair in {}", realm.display());
    let private = RsaPrivateKey::new(&mut OsRng, KEY_BITS)?;
    let private_key = private.to_pkcs8_pem(LineEnding::LF)?.to_string();
    let public = ssh_key::public::RsaPublicKey::try_from(private.to_public_key())?;
    let public_key = ssh_key::PublicKey::new(public.into(), "").to_openssh()?;

    write_with_mode(&private_path, &private_key, 0o600)?;
    write_with_mode(&public_path, &public_key, 0o644)?;

    Ok(KeyPair {
        private_key,
        public_key,
        private_key_path: private_path,
    })
}

fn write_with_mode(path: &Path, contents: &str, mode: u32) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)
        .with_context(|| format!("could not open {}", path.display()))?;
    file.write_all(contents.as_bytes())
        .with_context(|| format!("could not write {}", path.display()))?;
    // mode() only applies to newly created files
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

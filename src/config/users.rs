//! The users file: `user:base64(aes-256-cbc(password))`, one per line,
//! decrypted with the master key. The master key file holds the base64 of the
//! master secret and must not be readable by anyone else.

use std::os::unix::fs::PermissionsExt;

use base64::{engine::general_purpose::STANDARD as b64, Engine};
use openssl::symm::{decrypt, encrypt, Cipher};
use sha2::{Digest, Sha256};

use crate::errors::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserEntry {
    pub username: String,
    pub password: String,
}

/// Read and decode the master key. Defaults to `~/.pg_warden/master.key`.
pub fn read_master_key(path: Option<&str>) -> Result<Vec<u8>, Error> {
    let path = match path {
        Some(path) => path.to_string(),
        None => {
            let home = std::env::var("HOME")
                .map_err(|_| Error::BadConfig("HOME is not set; cannot find master key".into()))?;
            format!("{home}/.pg_warden/master.key")
        }
    };

    let metadata = std::fs::metadata(&path)
        .map_err(|err| Error::BadConfig(format!("Could not stat master key '{path}': {err}")))?;
    if metadata.permissions().mode() & 0o077 != 0 {
        return Err(Error::BadConfig(format!(
            "master key '{path}' must have mode 0600"
        )));
    }

    let contents = std::fs::read_to_string(&path)
        .map_err(|err| Error::BadConfig(format!("Could not read master key '{path}': {err}")))?;

    b64.decode(contents.trim())
        .map_err(|err| Error::BadConfig(format!("master key '{path}' is not base64: {err}")))
}

/// OpenSSL's EVP_BytesToKey with SHA-256, no salt, one round: the scheme the
/// admin tool uses to derive the cipher key and IV from the master secret.
fn derive_key_iv(master_key: &[u8]) -> ([u8; 32], [u8; 16]) {
    let d1: [u8; 32] = Sha256::digest(master_key).into();

    let mut hasher = Sha256::new();
    hasher.update(d1);
    hasher.update(master_key);
    let d2: [u8; 32] = hasher.finalize().into();

    let mut iv = [0u8; 16];
    iv.copy_from_slice(&d2[..16]);

    (d1, iv)
}

pub fn decrypt_password(encoded: &str, master_key: &[u8]) -> Result<String, Error> {
    let ciphertext = b64
        .decode(encoded)
        .map_err(|err| Error::BadConfig(format!("password is not base64: {err}")))?;

    let (key, iv) = derive_key_iv(master_key);

    let plaintext = decrypt(Cipher::aes_256_cbc(), &key, Some(&iv), &ciphertext)
        .map_err(|err| Error::BadConfig(format!("password decryption failed: {err}")))?;

    String::from_utf8(plaintext)
        .map_err(|_| Error::BadConfig("decrypted password is not UTF-8".into()))
}

/// The inverse, used by tests and the admin tooling.
pub fn encrypt_password(password: &str, master_key: &[u8]) -> Result<String, Error> {
    let (key, iv) = derive_key_iv(master_key);

    let ciphertext = encrypt(Cipher::aes_256_cbc(), &key, Some(&iv), password.as_bytes())
        .map_err(|err| Error::BadConfig(format!("password encryption failed: {err}")))?;

    Ok(b64.encode(ciphertext))
}

pub fn parse_users_file(contents: &str, master_key: &[u8]) -> Result<Vec<UserEntry>, Error> {
    let mut users = Vec::new();

    for (lineno, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (username, encoded) = line.split_once(':').ok_or_else(|| {
            Error::BadConfig(format!(
                "users file line {}: expected 'user:password'",
                lineno + 1
            ))
        })?;

        users.push(UserEntry {
            username: username.to_string(),
            password: decrypt_password(encoded, master_key).map_err(|err| {
                Error::BadConfig(format!("users file line {}: {err}", lineno + 1))
            })?,
        });
    }

    Ok(users)
}

/// Look a user up in the active configuration.
pub fn user_known(username: &str) -> bool {
    crate::config::get_config()
        .users
        .iter()
        .any(|user| user.username == username)
}

/// The stored password for a user, if the pooler knows it.
pub fn user_password(username: &str) -> Option<String> {
    crate::config::get_config()
        .users
        .iter()
        .find(|user| user.username == username)
        .map(|user| user.password.clone())
}

//! SCRAM-SHA-256 (RFC 5802), server side: the pooler impersonating a
//! PostgreSQL server to its clients. The pooler knows the cleartext password
//! from the users file, so keys are derived per handshake with a fresh salt.

use base64::{engine::general_purpose::STANDARD as b64, Engine};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::errors::Error;
use crate::messages::constants::SCRAM_ITERATIONS;

const NONCE_LENGTH: usize = 18;
const SALT_LENGTH: usize = 16;

pub(crate) fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

pub(crate) fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Hi(): PBKDF2 with HMAC-SHA-256, one output block.
pub(crate) fn hi(password: &str, salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut block = Vec::with_capacity(salt.len() + 4);
    block.extend_from_slice(salt);
    block.extend_from_slice(&1u32.to_be_bytes());

    let mut u = hmac_sha256(password.as_bytes(), &block);
    let mut result = u;

    for _ in 1..iterations {
        u = hmac_sha256(password.as_bytes(), &u);
        for (r, b) in result.iter_mut().zip(u.iter()) {
            *r ^= b;
        }
    }

    result
}

/// SASLprep per RFC 4013; a password the algorithm rejects is used verbatim,
/// which is what the server does too.
pub(crate) fn normalize(password: &str) -> String {
    match stringprep::saslprep(password) {
        Ok(normalized) => normalized.to_string(),
        Err(_) => password.to_string(),
    }
}

fn random_nonce() -> String {
    let mut rng = rand::rng();
    let raw: [u8; NONCE_LENGTH] = rng.random();
    b64.encode(raw)
}

/// Pull one `key=value` attribute out of a SCRAM message.
fn attribute<'a>(message: &'a str, key: char) -> Result<&'a str, Error> {
    for part in message.split(',') {
        if let Some(rest) = part.strip_prefix(key) {
            if let Some(value) = rest.strip_prefix('=') {
                return Ok(value);
            }
        }
    }
    Err(Error::ScramClientError(format!(
        "missing attribute '{key}'"
    )))
}

enum ExchangeState {
    Initial,
    SentFirst {
        client_first_bare: String,
        server_first: String,
        combined_nonce: String,
    },
    Done,
}

/// One server-side SCRAM exchange.
pub struct ServerExchange {
    password: String,
    salt: Vec<u8>,
    iterations: u32,
    nonce: String,
    state: ExchangeState,
}

impl ServerExchange {
    pub fn new(password: &str) -> ServerExchange {
        let mut rng = rand::rng();
        let salt: [u8; SALT_LENGTH] = rng.random();

        ServerExchange {
            password: normalize(password),
            salt: salt.to_vec(),
            iterations: SCRAM_ITERATIONS,
            nonce: random_nonce(),
            state: ExchangeState::Initial,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_params(password: &str, salt: Vec<u8>, nonce: &str) -> ServerExchange {
        ServerExchange {
            password: normalize(password),
            salt,
            iterations: SCRAM_ITERATIONS,
            nonce: nonce.to_string(),
            state: ExchangeState::Initial,
        }
    }

    /// Handle client-first-message, producing server-first-message.
    pub fn handle_client_first(&mut self, client_first: &str) -> Result<String, Error> {
        // gs2 header: 'n' (no channel binding) or 'y', then ",,".
        let bare = client_first
            .strip_prefix("n,,")
            .or_else(|| client_first.strip_prefix("y,,"))
            .ok_or_else(|| {
                Error::ScramClientError("channel binding is not supported".into())
            })?;

        let client_nonce = attribute(bare, 'r')?;
        let combined_nonce = format!("{}{}", client_nonce, self.nonce);

        let server_first = format!(
            "r={},s={},i={}",
            combined_nonce,
            b64.encode(&self.salt),
            self.iterations
        );

        self.state = ExchangeState::SentFirst {
            client_first_bare: bare.to_string(),
            server_first: server_first.clone(),
            combined_nonce,
        };

        Ok(server_first)
    }

    /// Handle client-final-message. Verifies the proof and produces
    /// server-final-message. A failed proof is a bad password.
    pub fn handle_client_final(&mut self, client_final: &str) -> Result<String, Error> {
        let (client_first_bare, server_first, combined_nonce) = match &self.state {
            ExchangeState::SentFirst {
                client_first_bare,
                server_first,
                combined_nonce,
            } => (
                client_first_bare.clone(),
                server_first.clone(),
                combined_nonce.clone(),
            ),
            _ => {
                return Err(Error::ScramClientError(
                    "client-final-message out of order".into(),
                ))
            }
        };

        let final_nonce = attribute(client_final, 'r')?;
        if final_nonce != combined_nonce {
            return Err(Error::ScramClientError("nonce does not match".into()));
        }

        let proof_b64 = attribute(client_final, 'p')?;
        let proof = b64
            .decode(proof_b64)
            .map_err(|_| Error::ScramClientError("proof is not base64".into()))?;
        if proof.len() != 32 {
            return Err(Error::ScramClientError("proof has the wrong length".into()));
        }

        let without_proof = match client_final.rfind(",p=") {
            Some(idx) => &client_final[..idx],
            None => return Err(Error::ScramClientError("missing proof".into())),
        };

        let auth_message =
            format!("{client_first_bare},{server_first},{without_proof}");

        let salted_password = hi(&self.password, &self.salt, self.iterations);
        let client_key = hmac_sha256(&salted_password, b"Client Key");
        let stored_key = sha256(&client_key);

        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());
        let mut recovered_key = [0u8; 32];
        for (i, byte) in recovered_key.iter_mut().enumerate() {
            *byte = proof[i] ^ client_signature[i];
        }

        if sha256(&recovered_key) != stored_key {
            return Err(Error::AuthError("SCRAM proof verification failed".into()));
        }

        let server_key = hmac_sha256(&salted_password, b"Server Key");
        let server_signature = hmac_sha256(&server_key, auth_message.as_bytes());

        self.state = ExchangeState::Done;

        Ok(format!("v={}", b64.encode(server_signature)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The RFC 7677 example exchange: user "user", password "pencil".
    const RFC_SALT_B64: &str = "W22ZaJ0SNY7soEsUEjb6gQ==";
    const RFC_CLIENT_NONCE: &str = "rOprNGfwEbeRWgbNEkqO";
    const RFC_SERVER_NONCE_SUFFIX: &str = "%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0";

    fn rfc_exchange() -> ServerExchange {
        ServerExchange::with_params(
            "pencil",
            b64.decode(RFC_SALT_B64).unwrap(),
            RFC_SERVER_NONCE_SUFFIX,
        )
    }

    #[test]
    fn server_first_matches_rfc_vector() {
        let mut exchange = rfc_exchange();
        let server_first = exchange
            .handle_client_first(&format!("n,,n=user,r={RFC_CLIENT_NONCE}"))
            .unwrap();
        assert_eq!(
            server_first,
            format!(
                "r={RFC_CLIENT_NONCE}{RFC_SERVER_NONCE_SUFFIX},s={RFC_SALT_B64},i=4096"
            )
        );
    }

    #[test]
    fn accepts_rfc_proof_and_signs() {
        let mut exchange = rfc_exchange();
        exchange
            .handle_client_first(&format!("n,,n=user,r={RFC_CLIENT_NONCE}"))
            .unwrap();

        let client_final = format!(
            "c=biws,r={RFC_CLIENT_NONCE}{RFC_SERVER_NONCE_SUFFIX},\
             p=dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ="
        );
        let server_final = exchange.handle_client_final(&client_final).unwrap();
        assert_eq!(
            server_final,
            "v=6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4="
        );
    }

    #[test]
    fn rejects_wrong_password() {
        let mut exchange = ServerExchange::with_params(
            "not-pencil",
            b64.decode(RFC_SALT_B64).unwrap(),
            RFC_SERVER_NONCE_SUFFIX,
        );
        exchange
            .handle_client_first(&format!("n,,n=user,r={RFC_CLIENT_NONCE}"))
            .unwrap();

        let client_final = format!(
            "c=biws,r={RFC_CLIENT_NONCE}{RFC_SERVER_NONCE_SUFFIX},\
             p=dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ="
        );
        assert!(exchange.handle_client_final(&client_final).is_err());
    }

    #[test]
    fn rejects_tampered_nonce() {
        let mut exchange = rfc_exchange();
        exchange
            .handle_client_first(&format!("n,,n=user,r={RFC_CLIENT_NONCE}"))
            .unwrap();

        let client_final = format!(
            "c=biws,r={RFC_CLIENT_NONCE}attacker,\
             p=dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ="
        );
        assert!(exchange.handle_client_final(&client_final).is_err());
    }
}

//! SCRAM-SHA-256 client side: the pooler impersonating a PostgreSQL client
//! towards a backend that demands SASL authentication.

use base64::{engine::general_purpose::STANDARD as b64, Engine};
use bytes::BytesMut;
use rand::Rng;

use crate::auth::scram::{hi, hmac_sha256, normalize, sha256};
use crate::errors::Error;

enum ClientState {
    Initial,
    SentFirst {
        client_first_bare: String,
    },
    SentFinal {
        server_signature: [u8; 32],
    },
    Done,
}

pub struct ScramSha256 {
    password: String,
    nonce: String,
    state: ClientState,
}

impl ScramSha256 {
    pub fn new(password: &str) -> ScramSha256 {
        let mut rng = rand::rng();
        let raw: [u8; 18] = rng.random();

        ScramSha256 {
            password: normalize(password),
            nonce: b64.encode(raw),
            state: ClientState::Initial,
        }
    }

    /// The client-first-message. PostgreSQL leaves the username empty; the
    /// startup packet already carried it.
    pub fn message(&mut self) -> BytesMut {
        let client_first_bare = format!("n=,r={}", self.nonce);
        let message = format!("n,,{client_first_bare}");
        self.state = ClientState::SentFirst { client_first_bare };
        BytesMut::from(message.as_bytes())
    }

    /// Handle server-first-message, producing client-final-message.
    pub fn update(&mut self, message: &BytesMut) -> Result<BytesMut, Error> {
        let client_first_bare = match &self.state {
            ClientState::SentFirst { client_first_bare } => client_first_bare.clone(),
            _ => {
                return Err(Error::ScramServerError(
                    "server-first-message out of order".into(),
                ))
            }
        };

        let server_first = String::from_utf8_lossy(&message[..]).to_string();

        let mut combined_nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for part in server_first.split(',') {
            if let Some(value) = part.strip_prefix("r=") {
                combined_nonce = Some(value.to_string());
            } else if let Some(value) = part.strip_prefix("s=") {
                salt = Some(b64.decode(value).map_err(|_| {
                    Error::ScramServerError("salt is not base64".into())
                })?);
            } else if let Some(value) = part.strip_prefix("i=") {
                iterations = Some(value.parse::<u32>().map_err(|_| {
                    Error::ScramServerError("bad iteration count".into())
                })?);
            }
        }

        let (combined_nonce, salt, iterations) = match (combined_nonce, salt, iterations) {
            (Some(n), Some(s), Some(i)) => (n, s, i),
            _ => {
                return Err(Error::ScramServerError(
                    "server-first-message is incomplete".into(),
                ))
            }
        };

        if !combined_nonce.starts_with(&self.nonce) {
            return Err(Error::ScramServerError("server dropped our nonce".into()));
        }

        let without_proof = format!("c=biws,r={combined_nonce}");
        let auth_message = format!("{client_first_bare},{server_first},{without_proof}");

        let salted_password = hi(&self.password, &salt, iterations);
        let client_key = hmac_sha256(&salted_password, b"Client Key");
        let stored_key = sha256(&client_key);
        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());

        let mut proof = [0u8; 32];
        for (i, byte) in proof.iter_mut().enumerate() {
            *byte = client_key[i] ^ client_signature[i];
        }

        let server_key = hmac_sha256(&salted_password, b"Server Key");
        let server_signature = hmac_sha256(&server_key, auth_message.as_bytes());

        self.state = ClientState::SentFinal { server_signature };

        let client_final = format!("{without_proof},p={}", b64.encode(proof));
        Ok(BytesMut::from(client_final.as_bytes()))
    }

    /// Verify server-final-message. A mismatch means we were not talking to a
    /// server that knows the password.
    pub fn finish(&mut self, message: &BytesMut) -> Result<(), Error> {
        let expected = match &self.state {
            ClientState::SentFinal { server_signature } => *server_signature,
            _ => {
                return Err(Error::ScramServerError(
                    "server-final-message out of order".into(),
                ))
            }
        };

        let server_final = String::from_utf8_lossy(&message[..]).to_string();
        let verifier = server_final
            .split(',')
            .find_map(|part| part.strip_prefix("v="))
            .ok_or_else(|| Error::ScramServerError("missing verifier".into()))?;

        let signature = b64
            .decode(verifier)
            .map_err(|_| Error::ScramServerError("verifier is not base64".into()))?;

        if signature != expected {
            return Err(Error::ScramServerError(
                "server signature does not verify".into(),
            ));
        }

        self.state = ClientState::Done;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::scram::ServerExchange;

    // Drive the client exchange against our own server exchange; both sides
    // must agree end to end.
    #[test]
    fn client_and_server_complete_an_exchange() {
        let mut client = ScramSha256::new("hunter2");
        let mut server = ServerExchange::new("hunter2");

        let client_first = client.message();
        let server_first = server
            .handle_client_first(&String::from_utf8_lossy(&client_first))
            .unwrap();

        let client_final = client
            .update(&BytesMut::from(server_first.as_bytes()))
            .unwrap();
        let server_final = server
            .handle_client_final(&String::from_utf8_lossy(&client_final))
            .unwrap();

        client
            .finish(&BytesMut::from(server_final.as_bytes()))
            .unwrap();
    }

    #[test]
    fn mismatched_passwords_fail() {
        let mut client = ScramSha256::new("hunter2");
        let mut server = ServerExchange::new("swordfish");

        let client_first = client.message();
        let server_first = server
            .handle_client_first(&String::from_utf8_lossy(&client_first))
            .unwrap();

        let client_final = client
            .update(&BytesMut::from(server_first.as_bytes()))
            .unwrap();
        assert!(server
            .handle_client_final(&String::from_utf8_lossy(&client_final))
            .is_err());
    }
}

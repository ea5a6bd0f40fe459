//! Password authentication exchanges.
//!
//! Cleartext and MD5 are single responses; SCRAM-SHA-256 (RFC 5802, RFC 7677)
//! is a two-step exchange driven by [`ScramSha256`].

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// The only SASL mechanism offered to the server.
pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

/// Password for `AuthenticationMD5Password`: `"md5" + md5(md5(password + user) + salt)`.
pub fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner = md5::compute(format!("{}{}", password, user));
    let mut outer = format!("{:x}", inner).into_bytes();
    outer.extend_from_slice(salt);
    format!("md5{:x}", md5::compute(outer))
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScramError {
    #[error("server message is not valid UTF-8")]
    InvalidServerMessage,
    #[error("invalid salt encoding")]
    InvalidSalt,
    #[error("invalid iteration count")]
    InvalidIterations,
    #[error("missing {0} in server-first-message")]
    Missing(&'static str),
    #[error("server nonce does not extend the client nonce")]
    NonceMismatch,
    #[error("invalid server signature")]
    InvalidServerSignature,
    #[error("server signature verification failed")]
    SignatureMismatch,
    #[error("SCRAM message received out of order")]
    OutOfOrder,
    #[error("key derivation failed")]
    KeyDerivation,
}

enum State {
    Initial,
    Challenged {
        salted_password: [u8; 32],
        auth_message: String,
    },
}

/// Client side of one SCRAM-SHA-256 exchange, without channel binding.
pub struct ScramSha256 {
    user: String,
    password: String,
    nonce: String,
    state: State,
}

impl ScramSha256 {
    pub fn new(user: &str, password: &str) -> Self {
        let nonce_bytes: [u8; 18] = rand::thread_rng().gen();
        Self::with_nonce(user, password, BASE64.encode(nonce_bytes))
    }

    fn with_nonce(user: &str, password: &str, nonce: String) -> Self {
        Self {
            user: user.to_string(),
            password: password.to_string(),
            nonce,
            state: State::Initial,
        }
    }

    fn client_first_bare(&self) -> String {
        format!("n={},r={}", self.user, self.nonce)
    }

    /// `client-first-message`: GS2 header `n,,` followed by the bare message.
    pub fn client_first_message(&self) -> Vec<u8> {
        format!("n,,{}", self.client_first_bare()).into_bytes()
    }

    /// Consume `server-first-message` and produce `client-final-message`.
    pub fn process_server_first(&mut self, server_msg: &[u8]) -> Result<Vec<u8>, ScramError> {
        if !matches!(self.state, State::Initial) {
            return Err(ScramError::OutOfOrder);
        }
        let server_first =
            std::str::from_utf8(server_msg).map_err(|_| ScramError::InvalidServerMessage)?;

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for part in server_first.split(',') {
            if let Some(value) = part.strip_prefix("r=") {
                nonce = Some(value);
            } else if let Some(value) = part.strip_prefix("s=") {
                salt = Some(BASE64.decode(value).map_err(|_| ScramError::InvalidSalt)?);
            } else if let Some(value) = part.strip_prefix("i=") {
                iterations = Some(
                    value
                        .parse::<u32>()
                        .map_err(|_| ScramError::InvalidIterations)?,
                );
            }
        }
        let nonce = nonce.ok_or(ScramError::Missing("nonce"))?;
        let salt = salt.ok_or(ScramError::Missing("salt"))?;
        let iterations = iterations.ok_or(ScramError::Missing("iteration count"))?;

        if !nonce.starts_with(&self.nonce) || nonce.len() == self.nonce.len() {
            return Err(ScramError::NonceMismatch);
        }

        let mut salted_password = [0u8; 32];
        pbkdf2::pbkdf2::<HmacSha256>(
            self.password.as_bytes(),
            &salt,
            iterations,
            &mut salted_password,
        )
        .map_err(|_| ScramError::KeyDerivation)?;

        let client_key = hmac_sha256(&salted_password, b"Client Key")?;
        let stored_key: [u8; 32] = Sha256::digest(client_key).into();

        let without_proof = format!("c=biws,r={}", nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare(),
            server_first,
            without_proof
        );

        let signature = hmac_sha256(&stored_key, auth_message.as_bytes())?;
        let proof: Vec<u8> = client_key
            .iter()
            .zip(signature.iter())
            .map(|(k, s)| k ^ s)
            .collect();

        self.state = State::Challenged {
            salted_password,
            auth_message,
        };

        Ok(format!("{},p={}", without_proof, BASE64.encode(proof)).into_bytes())
    }

    /// Check `server-final-message` (`v=<signature>`).
    pub fn verify_server_final(&self, server_msg: &[u8]) -> Result<(), ScramError> {
        let State::Challenged {
            salted_password,
            auth_message,
        } = &self.state
        else {
            return Err(ScramError::OutOfOrder);
        };

        let server_final =
            std::str::from_utf8(server_msg).map_err(|_| ScramError::InvalidServerMessage)?;
        let verifier = server_final
            .strip_prefix("v=")
            .ok_or(ScramError::InvalidServerSignature)?;
        let signature = BASE64
            .decode(verifier)
            .map_err(|_| ScramError::InvalidServerSignature)?;

        let server_key = hmac_sha256(salted_password, b"Server Key")?;
        let expected = hmac_sha256(&server_key, auth_message.as_bytes())?;

        if signature != expected {
            return Err(ScramError::SignatureMismatch);
        }
        Ok(())
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32], ScramError> {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| ScramError::KeyDerivation)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_password() {
        let hashed = md5_password("alice", "secret", &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(hashed, "md598a0412b9c31436fc53776e863350083");
        assert_ne!(hashed, md5_password("alice", "secret", &[0, 0, 0, 0]));
    }

    /// RFC 7677 section 3 test vector.
    #[test]
    fn test_rfc7677_exchange() {
        let mut scram = ScramSha256::with_nonce("user", "pencil", "rOprNGfwEbeRWgbNEkqO".into());
        assert_eq!(
            scram.client_first_message(),
            b"n,,n=user,r=rOprNGfwEbeRWgbNEkqO".to_vec()
        );

        let client_final = scram
            .process_server_first(
                b"r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096",
            )
            .unwrap();
        assert_eq!(
            String::from_utf8(client_final).unwrap(),
            "c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,p=dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ="
        );

        scram
            .verify_server_final(b"v=6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4=")
            .unwrap();
        assert_eq!(
            scram.verify_server_final(b"v=AAAA"),
            Err(ScramError::SignatureMismatch)
        );
    }

    #[test]
    fn test_scram_rejects_foreign_nonce() {
        let mut scram = ScramSha256::with_nonce("user", "pencil", "abc".into());
        assert_eq!(
            scram.process_server_first(b"r=xyz123,s=c2FsdA==,i=4096"),
            Err(ScramError::NonceMismatch)
        );
        assert_eq!(
            scram.process_server_first(b"r=abc123,i=4096"),
            Err(ScramError::Missing("salt"))
        );
    }

    #[test]
    fn test_scram_final_before_first() {
        let scram = ScramSha256::new("user", "pencil");
        assert_eq!(
            scram.verify_server_final(b"v=AAAA"),
            Err(ScramError::OutOfOrder)
        );
    }
}

//! SCRAM client (RFC 5802) over SHA-1, SHA-256 and SHA-512.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use cbcore_errors::{CoreError, CoreResult, ErrorKind};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScramHash {
    Sha1,
    Sha256,
    Sha512,
}

impl ScramHash {
    fn output_len(self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha256 => 32,
            Self::Sha512 => 64,
        }
    }

    fn hash(self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha1 => Sha1::digest(data).to_vec(),
            Self::Sha256 => Sha256::digest(data).to_vec(),
            Self::Sha512 => Sha512::digest(data).to_vec(),
        }
    }

    fn hmac(self, key: &[u8], data: &[u8]) -> CoreResult<Vec<u8>> {
        fn run<M: Mac + hmac::digest::KeyInit>(key: &[u8], data: &[u8]) -> CoreResult<Vec<u8>> {
            let mut mac = <M as hmac::digest::KeyInit>::new_from_slice(key)
                .map_err(|e| CoreError::message(ErrorKind::AuthenticationFailure, e.to_string()))?;
            mac.update(data);
            Ok(mac.finalize().into_bytes().to_vec())
        }
        match self {
            Self::Sha1 => run::<Hmac<Sha1>>(key, data),
            Self::Sha256 => run::<Hmac<Sha256>>(key, data),
            Self::Sha512 => run::<Hmac<Sha512>>(key, data),
        }
    }

    fn salted_password(self, password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
        let mut out = vec![0u8; self.output_len()];
        match self {
            Self::Sha1 => pbkdf2::pbkdf2_hmac::<Sha1>(password, salt, iterations, &mut out),
            Self::Sha256 => pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut out),
            Self::Sha512 => pbkdf2::pbkdf2_hmac::<Sha512>(password, salt, iterations, &mut out),
        }
        out
    }
}

fn auth_error(msg: impl Into<String>) -> CoreError {
    CoreError::message(ErrorKind::AuthenticationFailure, msg)
}

fn escape_username(name: &str) -> String {
    name.replace('=', "=3D").replace(',', "=2C")
}

/// Client side of one SCRAM exchange.
pub struct ScramClient {
    hash: ScramHash,
    username: String,
    password: String,
    client_nonce: String,
    client_first_bare: String,
    server_signature: Option<Vec<u8>>,
}

impl ScramClient {
    pub fn new(hash: ScramHash, username: &str, password: &str) -> Self {
        let nonce: [u8; 18] = rand::random();
        Self::with_nonce(hash, username, password, BASE64.encode(nonce))
    }

    pub(crate) fn with_nonce(hash: ScramHash, username: &str, password: &str, nonce: String) -> Self {
        let client_first_bare = format!("n={},r={}", escape_username(username), nonce);
        Self {
            hash,
            username: username.to_string(),
            password: password.to_string(),
            client_nonce: nonce,
            client_first_bare,
            server_signature: None,
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// `client-first-message`, sent with the SASL auth request.
    pub fn client_first(&self) -> String {
        format!("n,,{}", self.client_first_bare)
    }

    /// Consumes `server-first-message` and produces `client-final-message`.
    pub fn client_final(&mut self, server_first: &[u8]) -> CoreResult<String> {
        let server_first =
            std::str::from_utf8(server_first).map_err(|_| auth_error("server-first-message is not utf-8"))?;

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for attr in server_first.split(',') {
            match attr.split_once('=') {
                Some(("r", v)) => nonce = Some(v),
                Some(("s", v)) => salt = Some(v),
                Some(("i", v)) => iterations = v.parse::<u32>().ok(),
                _ => {}
            }
        }
        let (Some(nonce), Some(salt), Some(iterations)) = (nonce, salt, iterations) else {
            return Err(auth_error("malformed server-first-message"));
        };
        if !nonce.starts_with(&self.client_nonce) {
            return Err(auth_error("server nonce does not extend client nonce"));
        }
        let salt = BASE64
            .decode(salt)
            .map_err(|_| auth_error("server salt is not base64"))?;

        let salted = self.hash.salted_password(self.password.as_bytes(), &salt, iterations);
        let client_key = self.hash.hmac(&salted, b"Client Key")?;
        let stored_key = self.hash.hash(&client_key);

        let without_proof = format!("c=biws,r={nonce}");
        let auth_message = format!("{},{},{}", self.client_first_bare, server_first, without_proof);
        let client_signature = self.hash.hmac(&stored_key, auth_message.as_bytes())?;
        let proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(k, s)| k ^ s)
            .collect();

        let server_key = self.hash.hmac(&salted, b"Server Key")?;
        self.server_signature = Some(self.hash.hmac(&server_key, auth_message.as_bytes())?);

        Ok(format!("{without_proof},p={}", BASE64.encode(proof)))
    }

    /// Checks `server-final-message`. An empty message is accepted.
    pub fn verify_server_final(&self, server_final: &[u8]) -> CoreResult<()> {
        if server_final.is_empty() {
            return Ok(());
        }
        let text = std::str::from_utf8(server_final).map_err(|_| auth_error("server-final-message is not utf-8"))?;
        if let Some(err) = text.strip_prefix("e=") {
            return Err(auth_error(format!("server rejected authentication: {err}")));
        }
        let Some(verifier) = text.split(',').find_map(|a| a.strip_prefix("v=")) else {
            return Err(auth_error("malformed server-final-message"));
        };
        let verifier = BASE64.decode(verifier).map_err(|_| auth_error("server signature is not base64"))?;
        match &self.server_signature {
            Some(expected) if *expected == verifier => Ok(()),
            _ => Err(auth_error("server signature mismatch")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc5802_sha1_vector() {
        let mut c = ScramClient::with_nonce(ScramHash::Sha1, "user", "pencil", "fyko+d2lbbFgONRv9qkxdawL".into());
        assert_eq!(c.client_first(), "n,,n=user,r=fyko+d2lbbFgONRv9qkxdawL");
        let fin = c
            .client_final(b"r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,s=QSXCR+Q6sek8bf92,i=4096")
            .unwrap();
        assert_eq!(
            fin,
            "c=biws,r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,p=v0X8v3Bz2T0CJGbJQyF0X+HI4Ts="
        );
        c.verify_server_final(b"v=rmF9pqV8S7suAoZWja4dJRkFsKQ=").unwrap();
    }

    #[test]
    fn test_rfc7677_sha256_vector() {
        let mut c = ScramClient::with_nonce(ScramHash::Sha256, "user", "pencil", "rOprNGfwEbeRWgbNEkqO".into());
        let fin = c
            .client_final(
                b"r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096",
            )
            .unwrap();
        assert_eq!(
            fin,
            "c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,p=dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ="
        );
        c.verify_server_final(b"v=6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4=").unwrap();
        assert!(c.verify_server_final(b"v=AAAA").is_err());
    }

    #[test]
    fn test_foreign_nonce_rejected() {
        let mut c = ScramClient::with_nonce(ScramHash::Sha512, "user", "pencil", "abc".into());
        assert!(c.client_final(b"r=xyz123,s=QSXCR+Q6sek8bf92,i=4096").is_err());
    }

    #[test]
    fn test_username_escaping() {
        let c = ScramClient::with_nonce(ScramHash::Sha256, "a=b,c", "p", "n".into());
        assert_eq!(c.client_first(), "n,,n=a=3Db=2Cc,r=n");
    }
}

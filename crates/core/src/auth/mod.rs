//! SASL mechanisms used during connection bootstrap.

pub mod scram;

use cbcore_config::{AuthMechanism, Credentials};
use cbcore_errors::{CoreError, CoreResult};
use secrecy::ExposeSecret;

pub use scram::{ScramClient, ScramHash};

/// Client state for one SASL exchange.
pub enum SaslClient {
    Plain { username: String, password: String },
    Scram(ScramClient),
}

impl SaslClient {
    pub fn new(mechanism: AuthMechanism, creds: &Credentials) -> Self {
        let password = creds.password.expose_secret();
        match mechanism {
            AuthMechanism::Plain => Self::Plain {
                username: creds.username.clone(),
                password: password.clone(),
            },
            AuthMechanism::ScramSha1 => Self::Scram(ScramClient::new(ScramHash::Sha1, &creds.username, password)),
            AuthMechanism::ScramSha256 => {
                Self::Scram(ScramClient::new(ScramHash::Sha256, &creds.username, password))
            }
            AuthMechanism::ScramSha512 => {
                Self::Scram(ScramClient::new(ScramHash::Sha512, &creds.username, password))
            }
        }
    }

    /// Body of the SASL auth request.
    pub fn initial_response(&self) -> Vec<u8> {
        match self {
            Self::Plain { username, password } => {
                let mut out = Vec::with_capacity(username.len() + password.len() + 2);
                out.push(0);
                out.extend_from_slice(username.as_bytes());
                out.push(0);
                out.extend_from_slice(password.as_bytes());
                out
            }
            Self::Scram(c) => c.client_first().into_bytes(),
        }
    }

    /// True if the mechanism needs a SASL step after the first response.
    pub fn is_multi_step(&self) -> bool {
        matches!(self, Self::Scram(_))
    }

    /// Body of the SASL step request, from the server's challenge.
    pub fn step(&mut self, challenge: &[u8]) -> CoreResult<Vec<u8>> {
        match self {
            Self::Plain { .. } => Err(CoreError::protocol("PLAIN has no second step")),
            Self::Scram(c) => Ok(c.client_final(challenge)?.into_bytes()),
        }
    }

    pub fn finish(&self, server_final: &[u8]) -> CoreResult<()> {
        match self {
            Self::Plain { .. } => Ok(()),
            Self::Scram(c) => c.verify_server_final(server_final),
        }
    }
}

/// Parses a SASL list-mechanisms body (space separated names).
pub fn parse_mechanisms(body: &[u8]) -> Vec<AuthMechanism> {
    String::from_utf8_lossy(body)
        .split_whitespace()
        .filter_map(AuthMechanism::parse)
        .collect()
}

/// Drops mechanisms from the front of `remaining` until one the server lists.
///
/// Returns that mechanism and the list left after it.
pub fn next_mechanism(
    remaining: &[AuthMechanism],
    server: &[AuthMechanism],
) -> Option<(AuthMechanism, Vec<AuthMechanism>)> {
    remaining
        .iter()
        .position(|m| server.contains(m))
        .map(|idx| (remaining[idx], remaining[idx + 1..].to_vec()))
}

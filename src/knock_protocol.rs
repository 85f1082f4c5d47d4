use crate::firewall_driver::{FirewallDriver, FirewallError};
use crate::passphrase_registry::SharedRegistry;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use subtle::ConstantTimeEq;

pub const SYNC_OK: &str = "Handshake sync OK";
pub const AUTHENTICATED: &str = "Authenticated";
pub const AUTH_FAILED: &str = "Authentication failed";
pub const EXPIRED: &str = "Expired Token";
pub const FIREWALL_ERROR: &str = "Firewall error";

pub const STATUS_OK: u16 = 200;
pub const STATUS_AUTH_FAILED: u16 = 401;
pub const STATUS_EXPIRED: u16 = 405;
pub const STATUS_FIREWALL_ERROR: u16 = 500;

/// Redirect target telling the login page to reload itself
pub const RELOAD: &str = "reload";

/// `hex(sha256(phrase || nonce))`
pub fn derive_token(phrase: &str, nonce: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(phrase.as_bytes());
    hasher.update(nonce.as_bytes());
    hex::encode(hasher.finalize())
}

/// Where the nonce of a knock comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolVersion {
    /// Server-issued timestamp from `/sync`, subject to the token TTL
    #[default]
    Timestamp,
    /// Client-chosen `random` value, never expires
    LegacyRandom,
}

/// Query parameters of a knock; everything is optional so malformed requests still get an answer
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KnockParams {
    #[serde(rename = "_key")]
    pub key: Option<String>,
    pub ts: Option<String>,
    pub token: Option<String>,
    pub random: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SyncResponse {
    pub status: &'static str,
    pub status_code: u16,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct KnockResponse {
    pub status: &'static str,
    pub status_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {
    MissingParameter(&'static str),
    MalformedTimestamp,
    UnknownKey,
    TokenMismatch,
    Replayed,
}

impl std::fmt::Display for FailReason {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::MissingParameter(name) => write!(f, "missing parameter '{}'", name),
            Self::MalformedTimestamp => write!(f, "malformed timestamp"),
            Self::UnknownKey => write!(f, "unknown key"),
            Self::TokenMismatch => write!(f, "token mismatch"),
            Self::Replayed => write!(f, "token already used"),
        }
    }
}

#[derive(Debug)]
pub enum KnockOutcome {
    Granted,
    AlreadyGranted,
    Failed(FailReason),
    Expired { age: i64 },
    /// Authentication passed but the grant did not reach the firewall
    FirewallFailure(FirewallError),
}

pub struct KnockSettings {
    pub token_ttl: i64,
    pub redirect_url: Option<String>,
    pub version: ProtocolVersion,
    pub single_use_tokens: bool,
}

/// Handles `/sync` and `/knock`.
///
/// Authentication failures are outcomes, not errors. No state survives between knocks except
/// the optional record of used tokens.
pub struct KnockHandler {
    registry: Arc<SharedRegistry>,
    firewall: Arc<dyn FirewallDriver>,
    settings: KnockSettings,
    /// (key, nonce, token) -> time first accepted
    used_tokens: Mutex<HashMap<(String, String, String), i64>>,
}

impl KnockHandler {
    pub fn new(
        registry: Arc<SharedRegistry>,
        firewall: Arc<dyn FirewallDriver>,
        settings: KnockSettings,
    ) -> Self {
        Self {
            registry,
            firewall,
            settings,
            used_tokens: Mutex::new(HashMap::new()),
        }
    }

    pub fn sync(&self, now: i64) -> SyncResponse {
        SyncResponse {
            status: SYNC_OK,
            status_code: STATUS_OK,
            timestamp: now,
        }
    }

    /// Authenticates a knock and grants `peer` on success.
    ///
    /// `peer` must come from the transport, never from the request.
    pub async fn knock(&self, params: &KnockParams, peer: IpAddr, now: i64) -> KnockOutcome {
        let nonce = match self.nonce(params, now) {
            Ok(nonce) => nonce,
            Err(outcome) => return outcome,
        };

        if let Err(reason) = self.authenticate(params, nonce, now) {
            return KnockOutcome::Failed(reason);
        }

        match self.firewall.grant(&peer.to_canonical().to_string()).await {
            Ok(true) => KnockOutcome::Granted,
            Ok(false) => KnockOutcome::AlreadyGranted,
            Err(e) => KnockOutcome::FirewallFailure(e),
        }
    }

    fn nonce<'a>(&self, params: &'a KnockParams, now: i64) -> Result<&'a str, KnockOutcome> {
        match self.settings.version {
            ProtocolVersion::Timestamp => {
                let ts = params
                    .ts
                    .as_deref()
                    .ok_or(KnockOutcome::Failed(FailReason::MissingParameter("ts")))?;
                let issued = ts
                    .trim()
                    .parse::<i64>()
                    .map_err(|_| KnockOutcome::Failed(FailReason::MalformedTimestamp))?;

                let age = now.saturating_sub(issued);
                if age > self.settings.token_ttl {
                    return Err(KnockOutcome::Expired { age });
                }
                Ok(ts)
            }
            ProtocolVersion::LegacyRandom => params
                .random
                .as_deref()
                .ok_or(KnockOutcome::Failed(FailReason::MissingParameter("random"))),
        }
    }

    fn authenticate(&self, params: &KnockParams, nonce: &str, now: i64) -> Result<(), FailReason> {
        let key = params
            .key
            .as_deref()
            .ok_or(FailReason::MissingParameter("_key"))?;
        let token = params
            .token
            .as_deref()
            .ok_or(FailReason::MissingParameter("token"))?;

        let registry = self.registry.current();
        let phrase = registry.get(key).ok_or(FailReason::UnknownKey)?;

        let expected = derive_token(phrase, nonce);
        if !bool::from(expected.as_bytes().ct_eq(token.as_bytes())) {
            return Err(FailReason::TokenMismatch);
        }

        if self.settings.single_use_tokens {
            self.consume(key, nonce, token, now)?;
        }
        Ok(())
    }

    fn consume(&self, key: &str, nonce: &str, token: &str, now: i64) -> Result<(), FailReason> {
        let mut used_tokens = match self.used_tokens.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let ttl = self.settings.token_ttl;
        used_tokens.retain(|_, seen| now.saturating_sub(*seen) <= ttl);

        let entry = (key.to_string(), nonce.to_string(), token.to_string());
        if used_tokens.contains_key(&entry) {
            return Err(FailReason::Replayed);
        }
        used_tokens.insert(entry, now);
        Ok(())
    }

    pub fn response(&self, outcome: &KnockOutcome) -> KnockResponse {
        match outcome {
            KnockOutcome::Granted | KnockOutcome::AlreadyGranted => KnockResponse {
                status: AUTHENTICATED,
                status_code: STATUS_OK,
                redirect_url: Some(
                    self.settings
                        .redirect_url
                        .clone()
                        .unwrap_or_else(|| RELOAD.to_string()),
                ),
            },
            KnockOutcome::Failed(_) => KnockResponse {
                status: AUTH_FAILED,
                status_code: STATUS_AUTH_FAILED,
                redirect_url: None,
            },
            KnockOutcome::Expired { .. } => KnockResponse {
                status: EXPIRED,
                status_code: STATUS_EXPIRED,
                redirect_url: None,
            },
            KnockOutcome::FirewallFailure(_) => KnockResponse {
                status: FIREWALL_ERROR,
                status_code: STATUS_FIREWALL_ERROR,
                redirect_url: None,
            },
        }
    }
}

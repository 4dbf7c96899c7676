//! Wallet sign-in and session tokens.
//!
//! A client proves control of a wallet by signing an arbitrary message with
//! `personal_sign` (EIP-191). The server recovers the signer, upserts the user,
//! and issues an HS256 JWT carrying the user id and wallet.

use crate::config::Secret;
use crate::error::ApiError;
use crate::store::Store;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use ethers::types::Signature;
use hmac::digest::InvalidLength;
use hmac::{Hmac, Mac};
use odds_types::WalletAddress;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

type HmacSha256 = Hmac<Sha256>;

const JWT_HEADER: &str = r#"{"alg":"HS256","typ":"JWT"}"#;

/// The caller behind a verified bearer token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthUser {
    pub id: i64,
    pub wallet_address: WalletAddress,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claims {
    pub sub: i64,
    pub wallet_address: WalletAddress,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,
    #[error("unsupported token header")]
    Header,
    #[error("bad token signature")]
    Signature,
    #[error("token expired")]
    Expired,
    #[error("failed to encode claims")]
    Encode,
}

/// HS256 signer and verifier.
#[derive(Clone)]
pub struct TokenKeys {
    mac: HmacSha256,
    ttl: Duration,
}

impl TokenKeys {
    pub fn new(secret: &Secret, ttl: Duration) -> Result<Self, InvalidLength> {
        let mac = <HmacSha256 as Mac>::new_from_slice(secret.expose().as_bytes())?;
        Ok(Self { mac, ttl })
    }

    fn mac(&self) -> HmacSha256 {
        self.mac.clone()
    }

    pub fn issue(&self, user: &AuthUser, now: DateTime<Utc>) -> Result<String, TokenError> {
        let iat = now.timestamp();
        let claims = Claims {
            sub: user.id,
            wallet_address: user.wallet_address.clone(),
            iat,
            exp: iat + self.ttl.as_secs() as i64,
        };
        let header = URL_SAFE_NO_PAD.encode(JWT_HEADER);
        let claims = serde_json::to_vec(&claims).map_err(|_| TokenError::Encode)?;
        let payload = URL_SAFE_NO_PAD.encode(claims);
        let signing_input = format!("{header}.{payload}");
        let mut mac = self.mac();
        mac.update(signing_input.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        Ok(format!("{signing_input}.{signature}"))
    }

    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<Claims, TokenError> {
        let mut parts = token.split('.');
        let (Some(header), Some(payload), Some(signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(TokenError::Malformed);
        };

        let header_json: serde_json::Value = URL_SAFE_NO_PAD
            .decode(header)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .ok_or(TokenError::Malformed)?;
        if header_json.get("alg").and_then(|alg| alg.as_str()) != Some("HS256") {
            return Err(TokenError::Header);
        }

        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| TokenError::Malformed)?;
        let mut mac = self.mac();
        mac.update(header.as_bytes());
        mac.update(b".");
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| TokenError::Signature)?;

        let claims: Claims = URL_SAFE_NO_PAD
            .decode(payload)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .ok_or(TokenError::Malformed)?;
        if claims.exp <= now.timestamp() {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }

    pub fn authenticate(&self, token: &str, now: DateTime<Utc>) -> Result<AuthUser, TokenError> {
        self.verify(token, now).map(|claims| AuthUser {
            id: claims.sub,
            wallet_address: claims.wallet_address,
        })
    }
}

/// Whether `signature` is `wallet`'s EIP-191 signature over `message`.
pub fn verify_wallet_signature(wallet: &WalletAddress, message: &str, signature: &str) -> bool {
    let Ok(signature) = Signature::from_str(signature.trim()) else {
        return false;
    };
    match signature.recover(message) {
        Ok(signer) => WalletAddress::from_bytes(signer.0) == *wallet,
        Err(_) => false,
    }
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub user: AuthUser,
}

#[derive(Clone)]
pub struct AuthService {
    store: Store,
    keys: TokenKeys,
}

impl AuthService {
    pub fn new(store: Store, keys: TokenKeys) -> Self {
        Self { store, keys }
    }

    pub fn keys(&self) -> &TokenKeys {
        &self.keys
    }

    pub async fn login(
        &self,
        wallet: &str,
        signature: &str,
        message: &str,
    ) -> Result<LoginResponse, ApiError> {
        let wallet = WalletAddress::parse(wallet)
            .map_err(|_| ApiError::Unauthorized("Invalid signature".to_string()))?;
        if !verify_wallet_signature(&wallet, message, signature) {
            return Err(ApiError::Unauthorized("Invalid signature".to_string()));
        }

        let now = Utc::now();
        let (user, created) = {
            let wallet = wallet.clone();
            self.store
                .run(move |db| db.get_or_create_user(&wallet, now))
                .await?
        };
        if created {
            info!(user_id = user.id, wallet = %user.wallet_address, "registered wallet");
        }

        let user = AuthUser {
            id: user.id,
            wallet_address: user.wallet_address,
        };
        let access_token = self
            .keys
            .issue(&user, now)
            .map_err(|err| ApiError::Unauthorized(err.to_string()))?;
        Ok(LoginResponse { access_token, user })
    }
}

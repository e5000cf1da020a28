//! Passcode lifecycle on top of the sentinel.
//!
//! Every verification goes through [`AccountSentinel`]: an attempt is
//! reserved before the digest is computed, so a locked or destroyed account
//! never reaches Argon2 and concurrent guesses cannot outrun the lockout. A
//! successful check yields a [`VerifiedPasscode`], the only value that can
//! open the account's escrow blob.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use wd_crypto::{
    CryptoError, EscrowBlob, KeyEscrow, KdfParams, Passcode, PasscodeAuthenticator, PrivateKey,
};
use wd_proto::{PasscodeState, UserSecurityProfile};

use crate::clock::Clock;
use crate::error::{Result, TrustError};
use crate::key_vault::KeyVault;
use crate::profiles::Profiles;
use crate::sentinel::{AccountSentinel, FailureOutcome, Gate, Reservation};

/// A passcode proven correct for `user_id` by this process.
pub struct VerifiedPasscode {
    user_id: String,
    passcode: Passcode,
}

impl VerifiedPasscode {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }
}

impl std::fmt::Debug for VerifiedPasscode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerifiedPasscode")
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub enum VerifyOutcome {
    Ok(VerifiedPasscode),
    Wrong { remaining_attempts: u32 },
    LockedOut { until: DateTime<Utc> },
    Destroyed,
}

impl VerifyOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, VerifyOutcome::Ok(_))
    }

    /// Collapse the non-success outcomes into their error variants.
    pub fn into_verified(self) -> Result<VerifiedPasscode> {
        match self {
            VerifyOutcome::Ok(v) => Ok(v),
            VerifyOutcome::Wrong { remaining_attempts } => {
                Err(TrustError::WrongPasscode { remaining_attempts })
            }
            VerifyOutcome::LockedOut { until } => Err(TrustError::LockedOut { until }),
            VerifyOutcome::Destroyed => Err(TrustError::AccountDestroyed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasscodeStatus {
    pub set: bool,
    pub enabled: bool,
    pub version: Option<u32>,
    pub gate: Gate,
    pub failed_attempts: u32,
    pub total_failed_attempts: u32,
}

#[derive(Clone)]
pub struct PasscodeService {
    profiles: Profiles,
    sentinel: AccountSentinel,
    keys: KeyVault,
    clock: Arc<dyn Clock>,
    authenticator: PasscodeAuthenticator,
    escrow: KeyEscrow,
}

fn parse(code: &str) -> Result<Passcode> {
    Passcode::parse(code).map_err(|_| TrustError::InvalidPasscode)
}

impl PasscodeService {
    pub fn new(
        profiles: Profiles,
        sentinel: AccountSentinel,
        keys: KeyVault,
        clock: Arc<dyn Clock>,
        kdf: KdfParams,
    ) -> Self {
        Self {
            profiles,
            sentinel,
            keys,
            clock,
            authenticator: PasscodeAuthenticator::new(kdf),
            escrow: KeyEscrow::new(kdf),
        }
    }

    /// `verifyPasscode(accountId, code)`. Malformed input is rejected
    /// without counting as a failure.
    pub async fn verify(&self, user_id: &str, code: &str) -> Result<VerifyOutcome> {
        let passcode = parse(code)?;
        let (profile, reservation) = self.sentinel.reserve_attempt(user_id).await?;
        match reservation {
            Reservation::Granted => {}
            Reservation::LockedOut { until } => {
                debug!(user_id = %user_id, "verification refused: locked out");
                return Ok(VerifyOutcome::LockedOut { until });
            }
            Reservation::Destroyed => return Ok(VerifyOutcome::Destroyed),
            Reservation::Saturated => return Err(TrustError::AttemptsInFlight),
        }

        let Some(credential) = profile.passcode.credential() else {
            self.sentinel.release_attempt(user_id).await?;
            return Err(TrustError::PasscodeNotSet);
        };
        let matched = match self.authenticator.verify(&passcode, credential) {
            Ok(matched) => matched,
            Err(err) => {
                if let Err(release) = self.sentinel.release_attempt(user_id).await {
                    warn!(user_id = %user_id, error = %release, "attempt reservation not released");
                }
                return Err(err.into());
            }
        };

        if matched {
            match self.sentinel.record_success(user_id).await? {
                Gate::Allow { .. } => {}
                Gate::LockedOut { until } => {
                    warn!(user_id = %user_id, "correct passcode arrived after lockout; refused");
                    return Ok(VerifyOutcome::LockedOut { until });
                }
                Gate::Destroyed => return Ok(VerifyOutcome::Destroyed),
            }
            if self.authenticator.needs_rehash(credential) {
                self.upgrade_credential(user_id, &passcode, credential.clone()).await;
            }
            info!(user_id = %user_id, "passcode verified");
            return Ok(VerifyOutcome::Ok(VerifiedPasscode {
                user_id: user_id.to_owned(),
                passcode,
            }));
        }

        warn!(user_id = %user_id, "wrong passcode");
        Ok(match self.sentinel.record_failure(user_id).await? {
            FailureOutcome::Counted { remaining_attempts } => VerifyOutcome::Wrong { remaining_attempts },
            FailureOutcome::LockedOut { until } => VerifyOutcome::LockedOut { until },
            FailureOutcome::Destroyed { .. } => VerifyOutcome::Destroyed,
        })
    }

    /// Re-hash with current parameters. Best effort: a failed upgrade leaves
    /// the old credential valid.
    async fn upgrade_credential(
        &self,
        user_id: &str,
        passcode: &Passcode,
        old: wd_crypto::PasscodeCredential,
    ) {
        let fresh = match self.authenticator.enroll(passcode) {
            Ok(c) => c,
            Err(err) => {
                warn!(user_id = %user_id, error = %err, "passcode rehash failed");
                return;
            }
        };
        let now = self.clock.now();
        let result = self
            .profiles
            .mutate(user_id, |p| {
                if let PasscodeState::Set { credential, .. } = &mut p.passcode {
                    if *credential == old {
                        *credential = fresh.clone();
                        p.updated_at = now;
                    }
                }
                Ok(())
            })
            .await;
        match result {
            Ok(_) => info!(user_id = %user_id, version = fresh.version.as_u32(), "passcode credential upgraded"),
            Err(err) => warn!(user_id = %user_id, error = %err, "passcode rehash not persisted"),
        }
    }

    /// `setupPasscode(accountId, code)`: enroll the first passcode and escrow
    /// this device's private key under it. The blob is persisted on the
    /// profile and returned.
    pub async fn setup(&self, user_id: &str, code: &str) -> Result<EscrowBlob> {
        let passcode = parse(code)?;
        let profile = self.profiles.get(user_id).await?;
        if profile.is_destroyed() {
            return Err(TrustError::AccountDestroyed);
        }
        if profile.passcode.credential().is_some() {
            return Err(TrustError::PasscodeAlreadySet);
        }
        let private_key = self.keys.get_private_key(user_id)?.ok_or(TrustError::KeyMaterialMissing)?;
        ensure_matches_profile(&profile, &private_key)?;

        let credential = self.authenticator.enroll(&passcode)?;
        let blob = self.escrow.seal(&private_key, &passcode)?;
        let now = self.clock.now();
        self.profiles
            .mutate(user_id, |p| {
                if p.is_destroyed() {
                    return Err(TrustError::AccountDestroyed);
                }
                if p.passcode.credential().is_some() {
                    return Err(TrustError::PasscodeAlreadySet);
                }
                p.passcode = PasscodeState::Set {
                    credential: credential.clone(),
                    enabled: true,
                };
                p.encrypted_private_key_backup = Some(blob.clone());
                p.updated_at = now;
                Ok(())
            })
            .await?;
        info!(user_id = %user_id, "passcode set and private key escrowed");
        Ok(blob)
    }

    /// Authenticate `old`, then re-hash and re-escrow under `new`.
    pub async fn change(&self, user_id: &str, old: &str, new: &str) -> Result<EscrowBlob> {
        let new_passcode = parse(new)?;
        let verified = self.verify(user_id, old).await?.into_verified()?;
        let profile = self.profiles.get(user_id).await?;
        let private_key = match self.keys.get_private_key(user_id)? {
            Some(k) => k,
            None => self.open_escrow(&verified, &profile)?,
        };
        ensure_matches_profile(&profile, &private_key)?;
        let previous = profile.passcode.credential().cloned().ok_or(TrustError::PasscodeNotSet)?;

        let credential = self.authenticator.enroll(&new_passcode)?;
        let blob = self.escrow.seal(&private_key, &new_passcode)?;
        let now = self.clock.now();
        self.profiles
            .mutate(user_id, |p| match &mut p.passcode {
                PasscodeState::Set { credential: current, .. } if *current == previous => {
                    *current = credential.clone();
                    p.encrypted_private_key_backup = Some(blob.clone());
                    p.updated_at = now;
                    Ok(())
                }
                _ => Err(TrustError::Conflict(format!("passcode of {user_id} changed concurrently"))),
            })
            .await?;
        info!(user_id = %user_id, "passcode changed");
        Ok(blob)
    }

    /// Turning the gate off requires the current passcode; the hash and the
    /// escrow blob are kept.
    pub async fn disable(&self, user_id: &str, code: &str) -> Result<()> {
        self.verify(user_id, code).await?.into_verified()?;
        self.set_enabled(user_id, false).await
    }

    pub async fn enable(&self, user_id: &str) -> Result<()> {
        self.set_enabled(user_id, true).await
    }

    async fn set_enabled(&self, user_id: &str, value: bool) -> Result<()> {
        let now = self.clock.now();
        self.profiles
            .mutate(user_id, |p| match &mut p.passcode {
                PasscodeState::NotSet => Err(TrustError::PasscodeNotSet),
                PasscodeState::Set { enabled, .. } => {
                    if *enabled != value {
                        *enabled = value;
                        p.updated_at = now;
                    }
                    Ok(())
                }
            })
            .await?;
        info!(user_id = %user_id, enabled = value, "passcode gate updated");
        Ok(())
    }

    pub async fn status(&self, user_id: &str) -> Result<PasscodeStatus> {
        let profile = self.profiles.get(user_id).await?;
        let now = self.clock.now();
        let ledger = self.sentinel.policy().settle(&profile.attempts, now);
        Ok(PasscodeStatus {
            set: profile.passcode.credential().is_some(),
            enabled: profile.passcode.is_enabled(),
            version: profile.passcode_version(),
            gate: self.sentinel.policy().gate(&profile.attempts, now),
            failed_attempts: ledger.failed_attempt_count(),
            total_failed_attempts: ledger.total_failed_attempts,
        })
    }

    /// Decrypt the profile's escrow blob. Only callable with a verified
    /// passcode, so a wrong guess can never be tested against the blob.
    pub fn open_escrow(&self, verified: &VerifiedPasscode, profile: &UserSecurityProfile) -> Result<PrivateKey> {
        if verified.user_id != profile.user_id {
            return Err(TrustError::NotAuthorized(verified.user_id.clone()));
        }
        let blob = profile
            .encrypted_private_key_backup
            .as_ref()
            .ok_or(TrustError::KeyMaterialMissing)?;
        match self.escrow.open(blob, &verified.passcode) {
            Ok(key) => {
                ensure_matches_profile(profile, &key)?;
                Ok(key)
            }
            Err(CryptoError::WrongPasscode) => {
                warn!(user_id = %profile.user_id, "escrow blob does not open with the verified passcode");
                Err(TrustError::KeyMaterialMissing)
            }
            Err(err) => {
                warn!(user_id = %profile.user_id, error = %err, "escrow blob unusable");
                Err(TrustError::KeyMaterialMissing)
            }
        }
    }

    /// Seal `private_key` under the verified passcode for a legacy account
    /// that has no backup yet. A no-op when a backup already exists.
    pub async fn backfill_escrow(&self, verified: &VerifiedPasscode, private_key: &PrivateKey) -> Result<bool> {
        let blob = self.escrow.seal(private_key, &verified.passcode)?;
        let now = self.clock.now();
        let (_, created) = self
            .profiles
            .mutate(&verified.user_id, |p| {
                if p.encrypted_private_key_backup.is_some() {
                    return Ok(false);
                }
                p.encrypted_private_key_backup = Some(blob.clone());
                p.updated_at = now;
                Ok(true)
            })
            .await?;
        if created {
            info!(user_id = %verified.user_id, "escrow backup created for legacy account");
        }
        Ok(created)
    }

    /// Replace the account key pair with a fresh one. Explicit recovery only:
    /// everything sealed to the old key becomes unreadable.
    pub async fn rotate_keys(&self, verified: &VerifiedPasscode) -> Result<wd_crypto::PublicKey> {
        let pair = KeyVault::generate_key_pair();
        let blob = self.escrow.seal(&pair.private, &verified.passcode)?;
        let public = pair.public;
        let now = self.clock.now();
        self.profiles
            .mutate(&verified.user_id, |p| {
                if p.is_destroyed() {
                    return Err(TrustError::AccountDestroyed);
                }
                p.public_key = Some(public);
                p.encrypted_private_key_backup = Some(blob.clone());
                p.updated_at = now;
                Ok(())
            })
            .await?;
        self.keys.store_private_key(&verified.user_id, &pair.private)?;
        warn!(user_id = %verified.user_id, key_id = %public.key_id(), "account key pair regenerated");
        Ok(public)
    }
}

/// A private key that does not belong to the profile's public key is as
/// good as missing.
fn ensure_matches_profile(profile: &UserSecurityProfile, key: &PrivateKey) -> Result<()> {
    match profile.public_key {
        Some(pk) if pk == key.public_key() => Ok(()),
        Some(_) => {
            warn!(user_id = %profile.user_id, "private key does not match published public key");
            Err(TrustError::KeyMaterialMissing)
        }
        None => Err(TrustError::AccountDestroyed),
    }
}

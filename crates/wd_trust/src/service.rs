//! Facade wiring the trust services over one record store and one local
//! vault. This is the surface the chat client talks to.

use std::sync::Arc;

use chrono::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use wd_crypto::{CryptoError, EscrowBlob, MessageCipher, PrivateKey, PublicKey, SealedMessage};
use wd_proto::{paths, DeviceRequest, EncryptedMessage, IdentityCheck, Role, RoleGrant, UserSecurityProfile};
use wd_store::{KeyringVault, RecordStore, SecureLocalVault};
use zeroize::Zeroizing;

use crate::clock::{Clock, SystemClock};
use crate::config::TrustConfig;
use crate::device_trust::{DeviceAccess, DeviceTrustManager};
use crate::eraser::AccountEraser;
use crate::error::{Result, TrustError};
use crate::key_vault::KeyVault;
use crate::messages::{DecryptedMessage, MessageService};
use crate::notify::AdminNotifier;
use crate::passcode::{PasscodeService, PasscodeStatus, VerifyOutcome};
use crate::profiles::Profiles;
use crate::roles::RoleTable;
use crate::sentinel::{AccountSentinel, SentinelPolicy};
use crate::sweeper::{SweepReport, Sweeper};

/// An unlocked account on this device. The private key is zeroized when
/// the session is dropped.
pub struct Session {
    user_id: String,
    device_id: String,
    private_key: PrivateKey,
    restored_from_escrow: bool,
}

impl Session {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn private_key(&self) -> &PrivateKey {
        &self.private_key
    }

    pub fn public_key(&self) -> PublicKey {
        self.private_key.public_key()
    }

    /// True when the key was recovered from the escrow blob during unlock.
    pub fn restored_from_escrow(&self) -> bool {
        self.restored_from_escrow
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("restored_from_escrow", &self.restored_from_escrow)
            .finish_non_exhaustive()
    }
}

pub struct TrustCore {
    config: TrustConfig,
    clock: Arc<dyn Clock>,
    profiles: Profiles,
    keys: KeyVault,
    passcodes: PasscodeService,
    devices: DeviceTrustManager,
    roles: RoleTable,
    messages: MessageService,
    sweeper: Sweeper,
}

impl TrustCore {
    pub fn new(
        config: TrustConfig,
        store: Arc<dyn RecordStore>,
        vault: Arc<dyn SecureLocalVault>,
        notifier: Arc<dyn AdminNotifier>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let profiles = Profiles::new(store.clone(), config.max_update_retries);
        let keys = KeyVault::new(vault);
        let eraser = AccountEraser::new(store.clone(), keys.clone(), clock.clone());
        let sentinel = AccountSentinel::new(
            profiles.clone(),
            clock.clone(),
            SentinelPolicy::from(&config),
            notifier.clone(),
            eraser,
        );
        let passcodes = PasscodeService::new(
            profiles.clone(),
            sentinel.clone(),
            keys.clone(),
            clock.clone(),
            config.kdf,
        );
        let roles = RoleTable::new(store, profiles.clone(), clock.clone(), config.max_update_retries);
        let devices = DeviceTrustManager::new(
            profiles.clone(),
            roles.clone(),
            notifier,
            clock.clone(),
            config.device_request_ttl(),
            config.max_update_retries,
        );
        let messages = MessageService::new(profiles.clone(), roles.clone(), clock.clone());
        let sweeper = Sweeper::new(profiles.clone(), sentinel, devices.clone(), messages.clone());
        Ok(Self {
            config,
            clock,
            profiles,
            keys,
            passcodes,
            devices,
            roles,
            messages,
            sweeper,
        })
    }

    /// Production wiring: OS keyring under `config.keyring_service` and the
    /// system clock.
    pub fn with_keyring(
        config: TrustConfig,
        store: Arc<dyn RecordStore>,
        notifier: Arc<dyn AdminNotifier>,
    ) -> Result<Self> {
        let vault = Arc::new(KeyringVault::new(config.keyring_service.clone()));
        Self::new(config, store, vault, notifier, Arc::new(SystemClock))
    }

    pub fn config(&self) -> &TrustConfig {
        &self.config
    }

    pub fn key_vault(&self) -> &KeyVault {
        &self.keys
    }

    pub fn passcodes(&self) -> &PasscodeService {
        &self.passcodes
    }

    pub fn devices(&self) -> &DeviceTrustManager {
        &self.devices
    }

    pub fn roles(&self) -> &RoleTable {
        &self.roles
    }

    pub fn messages(&self) -> &MessageService {
        &self.messages
    }

    // ── Accounts ─────────────────────────────────────────────────────────────

    /// Create the profile with a fresh key pair. The private key goes to
    /// this device's vault; no passcode and no device claim yet.
    pub async fn register_account(&self, user_id: &str, username: &str) -> Result<PublicKey> {
        paths::check_id(user_id)?;
        if self.profiles.find(user_id).await?.is_some() {
            return Err(TrustError::AccountExists(user_id.to_owned()));
        }
        let pair = KeyVault::generate_key_pair();
        let profile = UserSecurityProfile::new(user_id, username, pair.public, self.clock.now());
        self.profiles.create(&profile).await?;
        self.keys.store_private_key(user_id, &pair.private)?;
        info!(user_id = %user_id, key_id = %pair.public.key_id(), "account registered");
        Ok(pair.public)
    }

    pub async fn profile(&self, user_id: &str) -> Result<UserSecurityProfile> {
        self.profiles.get(user_id).await
    }

    // ── Device trust ─────────────────────────────────────────────────────────

    pub async fn login(&self, user_id: &str, device_id: &str) -> Result<DeviceAccess> {
        self.devices.check_device(user_id, device_id).await
    }

    pub async fn request_device_access(&self, user_id: &str, new_device_id: &str) -> Result<DeviceRequest> {
        self.devices.request_device_access(user_id, new_device_id).await
    }

    pub async fn approve_device(&self, request_id: &str, admin_id: &str) -> Result<DeviceRequest> {
        self.devices.approve(request_id, admin_id).await
    }

    pub async fn deny_device(
        &self,
        request_id: &str,
        admin_id: &str,
        reason: Option<String>,
    ) -> Result<DeviceRequest> {
        self.devices.deny(request_id, admin_id, reason).await
    }

    pub async fn pending_device_requests(&self) -> Result<Vec<DeviceRequest>> {
        self.devices.pending_requests().await
    }

    pub async fn await_device_decision(&self, request_id: &str) -> Result<DeviceRequest> {
        self.devices.await_decision(request_id).await
    }

    /// Cross-check the blocked device's passcode against the stored hash.
    /// The attempt is counted by the sentinel like any other; only the
    /// verdict is written to the request.
    pub async fn attest_identity(&self, request_id: &str, code: &str) -> Result<IdentityCheck> {
        let request = self.devices.get_request(request_id).await?;
        if !request.is_pending() {
            return Err(TrustError::RequestAlreadyResolved(request.status.label()));
        }
        let verified = match self.passcodes.verify(&request.user_id, code).await? {
            VerifyOutcome::Ok(_) => true,
            VerifyOutcome::Wrong { .. } => false,
            VerifyOutcome::LockedOut { until } => return Err(TrustError::LockedOut { until }),
            VerifyOutcome::Destroyed => return Err(TrustError::AccountDestroyed),
        };
        self.devices.record_identity_check(request_id, verified).await
    }

    // ── Passcode ─────────────────────────────────────────────────────────────

    pub async fn verify_passcode(&self, user_id: &str, code: &str) -> Result<VerifyOutcome> {
        self.passcodes.verify(user_id, code).await
    }

    pub async fn setup_passcode(&self, user_id: &str, code: &str) -> Result<EscrowBlob> {
        self.passcodes.setup(user_id, code).await
    }

    pub async fn change_passcode(&self, user_id: &str, old: &str, new: &str) -> Result<EscrowBlob> {
        self.passcodes.change(user_id, old, new).await
    }

    pub async fn disable_passcode(&self, user_id: &str, code: &str) -> Result<()> {
        self.passcodes.disable(user_id, code).await
    }

    pub async fn enable_passcode(&self, user_id: &str) -> Result<()> {
        self.passcodes.enable(user_id).await
    }

    pub async fn passcode_status(&self, user_id: &str) -> Result<PasscodeStatus> {
        self.passcodes.status(user_id).await
    }

    /// Device check, gated passcode verification and key recovery in one
    /// step. A missing local key is restored from escrow; a legacy account
    /// without escrow gets one.
    pub async fn unlock(&self, user_id: &str, device_id: &str, code: Option<&str>) -> Result<Session> {
        if let DeviceAccess::Blocked { request } = self.devices.check_device(user_id, device_id).await? {
            return Err(TrustError::DeviceUnauthorized {
                request_id: Some(request.request_id),
            });
        }

        let profile = self.profiles.get(user_id).await?;
        let verified = match (profile.passcode.is_enabled(), code) {
            (true, None) => return Err(TrustError::PasscodeRequired),
            (_, Some(code)) if profile.passcode.credential().is_some() => {
                Some(self.passcodes.verify(user_id, code).await?.into_verified()?)
            }
            _ => None,
        };
        // Re-read: verification may have upgraded the credential.
        let profile = self.profiles.get(user_id).await?;

        let local = self
            .keys
            .get_private_key(user_id)?
            .filter(|k| profile.public_key == Some(k.public_key()));
        let (private_key, restored_from_escrow) = match (local, &verified) {
            (Some(key), _) => (key, false),
            (None, Some(v)) => {
                let key = self.passcodes.open_escrow(v, &profile)?;
                self.keys.store_private_key(user_id, &key)?;
                info!(user_id = %user_id, device_id = %device_id, "private key restored from escrow");
                (key, true)
            }
            (None, None) => return Err(TrustError::KeyMaterialMissing),
        };

        if let Some(v) = &verified {
            if profile.encrypted_private_key_backup.is_none() {
                if let Err(err) = self.passcodes.backfill_escrow(v, &private_key).await {
                    warn!(user_id = %user_id, error = %err, "escrow backfill failed");
                }
            }
        }

        Ok(Session {
            user_id: user_id.to_owned(),
            device_id: device_id.to_owned(),
            private_key,
            restored_from_escrow,
        })
    }

    /// Explicit last-resort recovery: new key pair, new escrow. Messages
    /// sealed to the old key become unreadable.
    pub async fn regenerate_keys(&self, user_id: &str, code: &str) -> Result<PublicKey> {
        let verified = self.passcodes.verify(user_id, code).await?.into_verified()?;
        self.passcodes.rotate_keys(&verified).await
    }

    // ── Messages ─────────────────────────────────────────────────────────────

    /// `encryptMessage(plaintext, recipientPublicKey, adminPublicKey?)`.
    pub fn encrypt_message(
        &self,
        plaintext: &str,
        recipient: &PublicKey,
        admin: Option<&PublicKey>,
    ) -> Result<SealedMessage> {
        Ok(wd_crypto::encrypt_message(plaintext, recipient, admin)?)
    }

    /// `decryptMessage(fields, privateKey)`. Every failure is
    /// `DecryptionFailed`; a missing branch says so in the detail.
    pub fn decrypt_message(&self, sealed: &SealedMessage, key: &PrivateKey) -> Result<Zeroizing<String>> {
        MessageCipher.open(sealed, key).map_err(|err| match err {
            CryptoError::NoBranchForKey(id) => {
                TrustError::DecryptionFailed(format!("no branch addressed to {id}"))
            }
            other => TrustError::DecryptionFailed(other.to_string()),
        })
    }

    pub async fn send_direct(
        &self,
        session: &Session,
        receiver_id: &str,
        plaintext: &str,
        ttl: Option<Duration>,
    ) -> Result<EncryptedMessage> {
        self.ensure_live(session).await?;
        self.messages
            .send_direct(&session.user_id, receiver_id, plaintext, ttl)
            .await
    }

    pub async fn send_group(
        &self,
        session: &Session,
        group_id: &str,
        member_ids: &[String],
        plaintext: &str,
        ttl: Option<Duration>,
    ) -> Result<Vec<EncryptedMessage>> {
        self.ensure_live(session).await?;
        self.messages
            .send_group(&session.user_id, group_id, member_ids, plaintext, ttl)
            .await
    }

    pub async fn read_conversation(&self, session: &Session, conversation_id: &str) -> Result<Vec<DecryptedMessage>> {
        self.messages
            .decrypt_conversation(&session.user_id, Some(&session.private_key), conversation_id)
            .await
    }

    /// A session outlives neither destruction nor a move to another device.
    async fn ensure_live(&self, session: &Session) -> Result<()> {
        let profile = self.profiles.get(&session.user_id).await?;
        if profile.is_destroyed() {
            return Err(TrustError::AccountDestroyed);
        }
        if profile.authorized_device() != Some(session.device_id.as_str()) {
            return Err(TrustError::DeviceUnauthorized { request_id: None });
        }
        Ok(())
    }

    // ── Administration ───────────────────────────────────────────────────────

    pub async fn grant_role(&self, user_id: &str, role: Role, granted_by: Option<&str>) -> Result<RoleGrant> {
        self.roles.grant(user_id, role, granted_by).await
    }

    pub async fn sweep(&self) -> Result<SweepReport> {
        self.sweeper.run_once().await
    }

    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        self.sweeper.clone().spawn(self.config.sweep_interval())
    }
}

use crate::clock::{datetime_from_epoch, Clock};
use crate::eligibility;
use crate::error::{BrokerError, Result};
use crate::geo::Location;
use crate::store::{HistoryUpdate, Store};
use crate::types::{reason, AccountRow, BrokerSettings, Purpose, StatsMap};
use chrono::NaiveDateTime;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Candidates rejected by the softban predicate before the request gives up.
const MAX_PICK_ATTEMPTS: usize = 20;

/// The assignment engine. One instance per process; all coordination beyond
/// the per-device reservation locks is delegated to the database.
pub struct Broker {
    store: Store,
    settings: BrokerSettings,
    clock: Clock,
    // one reservation lock per device: two requests from the same device
    // cannot interleave between reset and reservation, while requests from
    // different devices proceed in parallel
    device_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Body of a `get_account` request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PickupRequest {
    pub purpose: Option<Purpose>,
    pub region: Option<String>,
    pub reason: Option<String>,
    pub location: Option<Location>,
    pub logging: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct SoftbanInfo {
    pub time: NaiveDateTime,
    pub location: Option<Location>,
}

/// Account body returned to a device, both on pickup and from the info
/// endpoint.
#[derive(Debug, Serialize)]
pub struct AccountGrant {
    pub username: String,
    pub password: String,
    pub level: i64,
    pub remaining_encounters: i64,
    pub is_burnt: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_returned: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub softban_info: Option<SoftbanInfo>,
}

#[derive(Debug, Serialize)]
pub struct Availability {
    pub available: i64,
    #[serde(rename = "type")]
    pub kind: &'static str,
}

impl Broker {
    pub fn new(store: Store, settings: BrokerSettings, clock: Clock) -> Self {
        Self {
            store,
            settings,
            clock,
            device_locks: Mutex::new(HashMap::new()),
        }
    }

    fn device_lock(&self, device: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.device_locks.lock();
        locks.entry(device.to_string()).or_default().clone()
    }

    /// Dry-run: would `get_account` succeed right now? Never reserves and
    /// never writes.
    pub async fn get_availability(
        &self,
        device: &str,
        purpose: &Purpose,
        region: Option<&str>,
    ) -> Result<Availability> {
        let now = self.clock.now_epoch();

        if self
            .store
            .find_reusable(device, purpose, now, &self.settings)
            .await?
            .is_some()
        {
            return Ok(Availability {
                available: 1,
                kind: "reuse",
            });
        }

        let available = self
            .store
            .find_candidate(region, purpose, now, &[], &self.settings)
            .await?
            .is_some();
        Ok(Availability {
            available: i64::from(available),
            kind: "pool",
        })
    }

    /// Hand an account to `device`: sticky reuse first, otherwise reset the
    /// device and pick from the pool, skipping candidates the softban
    /// predicate rejects.
    pub async fn get_account(&self, device: &str, request: &PickupRequest) -> Result<AccountGrant> {
        let purpose = request
            .purpose
            .clone()
            .ok_or_else(|| BrokerError::BadRequest("purpose is required".to_string()))?;

        if self.settings.disable_iv && purpose == Purpose::Iv {
            return Err(BrokerError::NoCandidate);
        }

        let lock = self.device_lock(device);
        let _guard = lock.lock().await;
        let now = self.clock.now_epoch();

        if let Some(account) = self
            .store
            .find_reusable(device, &purpose, now, &self.settings)
            .await?
        {
            if self.hand_out(device, &account, &purpose, request, now).await? {
                info!(device, username = %account.username, purpose = %purpose, "reusing bound account");
                return self.grant(&account, now).await;
            }
            // binding was released out from under us; pick from the pool
        }

        self.store.reset_device(device, now).await?;
        self.store.close_dangling_history(device, now).await?;

        let device_logins = self.store.device_logins_last_hour(device, now).await?;
        if device_logins > self.settings.device_max_logins_per_hour {
            warn!(device, logins = device_logins, "device over hourly login cap");
            return Err(BrokerError::NoCandidate);
        }

        let mut rejected: Vec<String> = Vec::new();
        for _ in 0..MAX_PICK_ATTEMPTS {
            let Some(candidate) = self
                .store
                .find_candidate(
                    request.region.as_deref(),
                    &purpose,
                    now,
                    &rejected,
                    &self.settings,
                )
                .await?
            else {
                break;
            };

            let cleared = eligibility::softban_cleared(
                candidate.softban_time,
                candidate.softban_location.as_deref(),
                request.location,
                now,
            );
            if cleared && self.hand_out(device, &candidate, &purpose, request, now).await? {
                info!(
                    device,
                    username = %candidate.username,
                    purpose = %purpose,
                    skipped = rejected.len(),
                    "assigned account from pool"
                );
                return self.grant(&candidate, now).await;
            }
            // either spatially unfit or reserved by a concurrent request
            rejected.push(candidate.username.clone());
        }

        warn!(device, purpose = %purpose, rejected = rejected.len(), "no eligible account");
        Err(BrokerError::NoCandidate)
    }

    /// Reserve the account and open its history row. Returns false when a
    /// concurrent request won the reservation race.
    async fn hand_out(
        &self,
        device: &str,
        account: &AccountRow,
        purpose: &Purpose,
        request: &PickupRequest,
        now: i64,
    ) -> Result<bool> {
        if !self
            .store
            .mark_used(&account.username, device, purpose, now)
            .await?
        {
            return Ok(false);
        }
        let history_reason = request
            .reason
            .clone()
            .unwrap_or_else(|| reason::PRELOGIN.to_string());
        self.store
            .history_open_update(
                device,
                &account.username,
                HistoryUpdate {
                    reason: Some(history_reason),
                    purpose: Some(purpose.as_str().to_string()),
                    ..Default::default()
                },
                now,
            )
            .await?;
        Ok(true)
    }

    async fn grant(&self, account: &AccountRow, now: i64) -> Result<AccountGrant> {
        let encounters = self
            .store
            .encounters_in_window(&account.username, now, &self.settings)
            .await?;
        Ok(self.build_grant(account, encounters, now))
    }

    fn build_grant(&self, account: &AccountRow, encounters: i64, now: i64) -> AccountGrant {
        // compares a timestamp against the level column; kept until the
        // intended column is confirmed upstream
        let is_burnt = u8::from(now - self.settings.cooldown_seconds() < account.level);

        AccountGrant {
            username: account.username.clone(),
            password: account.password.clone(),
            level: account.level,
            remaining_encounters: (self.settings.encounter_limit - encounters).max(0),
            is_burnt,
            last_returned: account.last_returned,
            last_reason: account.last_reason.clone(),
            softban_info: account.softban_time.map(|time| SoftbanInfo {
                time,
                location: account
                    .softban_location
                    .as_deref()
                    .and_then(Location::from_json),
            }),
        }
    }

    /// The account currently bound to `device`, with its windowed encounter
    /// sum and the reason from the newest history row.
    pub async fn get_account_info(&self, device: &str) -> Result<Option<AccountGrant>> {
        let now = self.clock.now_epoch();
        let Some(account) = self.store.bound_account(device).await? else {
            return Ok(None);
        };
        let encounters = self
            .store
            .encounters_in_window(&account.username, now, &self.settings)
            .await?;
        let mut grant = self.build_grant(&account, encounters, now);
        if let Some(history_reason) = self
            .store
            .latest_history_reason(device, &account.username)
            .await?
        {
            grant.last_reason = Some(history_reason);
        }
        Ok(Some(grant))
    }

    /// Raise the bound account's level. Equal or lower levels are a no-op.
    pub async fn set_level(&self, device: &str, level: i64) -> Result<()> {
        self.store
            .raise_level(device, level, self.clock.now_epoch())
            .await?;
        Ok(())
    }

    pub async fn set_softban(
        &self,
        device: &str,
        time: NaiveDateTime,
        location: &Location,
    ) -> Result<Option<String>> {
        let username = self
            .store
            .set_softban(device, time, &location.to_json(), self.clock.now_epoch())
            .await?;
        if let Some(ref username) = username {
            info!(device, username = %username, %location, "softban recorded");
        }
        Ok(username)
    }

    /// Record that the device actually logged in on its bound account.
    pub async fn set_login(&self, device: &str) -> Result<Option<String>> {
        let now = self.clock.now_epoch();
        let Some(account) = self.store.bound_account(device).await? else {
            return Ok(None);
        };
        self.store
            .history_open_update(
                device,
                &account.username,
                HistoryUpdate {
                    reason: Some(reason::LOGIN.to_string()),
                    ..Default::default()
                },
                now,
            )
            .await?;
        Ok(Some(account.username))
    }

    /// Plain release: the account goes back to the pool with no cooldown.
    pub async fn set_logout(
        &self,
        device: &str,
        encounters: Option<i64>,
        level: Option<i64>,
    ) -> Result<Option<String>> {
        self.close_binding(device, None, Some(reason::LOGOUT.to_string()), encounters, level)
            .await
    }

    /// Burn: release with a reason, putting the account into cooldown.
    /// "maintenance" additionally stamps `last_burned`.
    pub async fn set_burned(
        &self,
        device: &str,
        burn_reason: Option<String>,
        encounters: Option<i64>,
        level: Option<i64>,
    ) -> Result<Option<String>> {
        self.close_binding(
            device,
            burn_reason.as_deref(),
            burn_reason.clone(),
            encounters,
            level,
        )
        .await
    }

    async fn close_binding(
        &self,
        device: &str,
        release_reason: Option<&str>,
        history_reason: Option<String>,
        encounters: Option<i64>,
        level: Option<i64>,
    ) -> Result<Option<String>> {
        let now = self.clock.now_epoch();
        let mark_burned = release_reason == Some(reason::MAINTENANCE);
        let Some(account) = self
            .store
            .release(device, release_reason, level, mark_burned, now)
            .await?
        else {
            return Ok(None);
        };
        self.store
            .history_open_update(
                device,
                &account.username,
                HistoryUpdate {
                    returned: Some(datetime_from_epoch(now)),
                    reason: history_reason,
                    encounters,
                    ..Default::default()
                },
                now,
            )
            .await?;
        info!(device, username = %account.username, reason = ?release_reason, "released account");
        Ok(Some(account.username))
    }

    pub async fn stats(&self) -> Result<StatsMap> {
        self.store.stats(self.clock.now_epoch(), &self.settings).await
    }

    pub async fn diagnostics(&self) -> Result<serde_json::Value> {
        let accounts = self.store.account_count().await?;
        Ok(serde_json::json!({
            "now": self.clock.now_epoch(),
            "accounts": accounts,
        }))
    }
}

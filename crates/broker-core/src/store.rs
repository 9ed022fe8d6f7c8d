use crate::clock::datetime_from_epoch;
use crate::error::Result;
use crate::types::{
    reason, AccountRow, AvailableStats, BrokerSettings, HistoryRow, Purpose, RegionStats,
    StatsMap, TotalStats, LEVELED_THRESHOLD,
};
use chrono::NaiveDateTime;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, QueryBuilder, Sqlite};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

pub type DbPool = Pool<Sqlite>;

/// Typed access to the `accounts` and `accounts_history` tables. Every
/// timestamp is computed by the caller and bound as a parameter; the store
/// never reads the wall clock itself.
#[derive(Clone)]
pub struct Store {
    pool: DbPool,
}

/// Fields to apply to the open history row of a (device, username) binding.
/// Unset fields are left untouched on update.
#[derive(Debug, Default, Clone)]
pub struct HistoryUpdate {
    pub acquired: Option<NaiveDateTime>,
    pub returned: Option<NaiveDateTime>,
    pub reason: Option<String>,
    pub encounters: Option<i64>,
    pub purpose: Option<String>,
}

impl Store {
    pub async fn connect(path: &str) -> Result<Store> {
        if let Some(parent) = Path::new(path).parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let database_url = format!("sqlite:{}?mode=rwc", path);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&database_url)
            .await?;

        let store = Store { pool };
        store.init_schema().await?;

        info!(database = %path, "Database initialized");

        Ok(store)
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                username TEXT PRIMARY KEY,
                password TEXT NOT NULL,
                level INTEGER NOT NULL DEFAULT 0,
                region TEXT,
                in_use_by TEXT,
                last_use INTEGER,
                last_returned INTEGER,
                last_reason TEXT,
                last_burned DATETIME,
                last_updated INTEGER,
                purpose TEXT,
                softban_time DATETIME,
                softban_location TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_accounts_in_use
            ON accounts(in_use_by)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS accounts_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL,
                device TEXT NOT NULL,
                acquired DATETIME NOT NULL,
                returned DATETIME,
                reason TEXT,
                encounters INTEGER NOT NULL DEFAULT 0,
                purpose TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_history_device_acquired
            ON accounts_history(device, username, acquired)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_history_username_returned
            ON accounts_history(username, returned)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Bulk-upsert bootstrap credentials. Existing rows keep their state;
    /// only the password is refreshed.
    pub async fn upsert_accounts(&self, credentials: &[(String, String)]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        for (username, password) in credentials {
            sqlx::query(
                r#"
                INSERT INTO accounts (username, password) VALUES (?, ?)
                ON CONFLICT(username) DO UPDATE SET password = excluded.password
                "#,
            )
            .bind(username)
            .bind(password)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(credentials.len() as u64)
    }

    /// The account still bound to `device`, if its level matches the purpose
    /// class, its release cooldown has aged out, and it has encounter budget
    /// left for reuse.
    pub async fn find_reusable(
        &self,
        device: &str,
        purpose: &Purpose,
        now: i64,
        settings: &BrokerSettings,
    ) -> Result<Option<AccountRow>> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM accounts WHERE in_use_by = ");
        qb.push_bind(device.to_string());
        push_level_clause(&mut qb, purpose);
        push_release_cooldown_clause(&mut qb, now, settings);
        push_encounter_budget_clause(&mut qb, now, settings, settings.reuse_budget());
        qb.push(" LIMIT 1");

        Ok(qb
            .build_query_as::<AccountRow>()
            .fetch_optional(&self.pool)
            .await?)
    }

    /// The single best free account for the request, or None. The softban
    /// spatial predicate is NOT applied here; the engine checks it on the
    /// returned row and calls again with the username excluded.
    pub async fn find_candidate(
        &self,
        region: Option<&str>,
        purpose: &Purpose,
        now: i64,
        excluded: &[String],
        settings: &BrokerSettings,
    ) -> Result<Option<AccountRow>> {
        let short_cutoff = now - settings.short_cooldown_seconds();
        let hour_ago = datetime_from_epoch(now - 3600);

        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM accounts WHERE in_use_by IS NULL");

        push_level_clause(&mut qb, purpose);

        if let Some(region) = region {
            qb.push(" AND (region IS NULL OR region = '' OR region = ");
            qb.push_bind(region.to_string());
            qb.push(")");
        }

        push_release_cooldown_clause(&mut qb, now, settings);

        // short cooldown between hand-outs, waived below the leveled threshold
        qb.push(" AND (last_use IS NULL OR last_use < ");
        qb.push_bind(short_cutoff);
        qb.push(" OR level < ");
        qb.push_bind(LEVELED_THRESHOLD);
        qb.push(")");

        push_encounter_budget_clause(&mut qb, now, settings, settings.pick_budget());

        // hourly login cap per account
        qb.push(
            " AND (SELECT COUNT(*) FROM accounts_history h \
             WHERE h.username = accounts.username AND h.acquired > ",
        );
        qb.push_bind(hour_ago);
        qb.push(") <= ");
        qb.push_bind(settings.account_max_logins_per_hour);

        if !excluded.is_empty() {
            qb.push(" AND username NOT IN (");
            {
                let mut sep = qb.separated(", ");
                for username in excluded {
                    sep.push_bind(username.to_string());
                }
            }
            qb.push(")");
        }

        match purpose {
            Purpose::Level => qb.push(" ORDER BY level DESC, last_use ASC"),
            _ => qb.push(" ORDER BY last_use ASC"),
        };
        qb.push(" LIMIT 1");

        Ok(qb
            .build_query_as::<AccountRow>()
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Reserve `username` for `device`. The update only fires while the row
    /// is still free (or already held by this device), so two devices racing
    /// for the same candidate cannot both win; the loser sees `false`.
    pub async fn mark_used(
        &self,
        username: &str,
        device: &str,
        purpose: &Purpose,
        now: i64,
    ) -> Result<bool> {
        let done = sqlx::query(
            r#"
            UPDATE accounts
            SET in_use_by = ?, last_use = ?, last_updated = ?, last_reason = NULL, purpose = ?
            WHERE username = ? AND (in_use_by IS NULL OR in_use_by = ?)
            "#,
        )
        .bind(device)
        .bind(now)
        .bind(now)
        .bind(purpose.as_str())
        .bind(username)
        .bind(device)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() > 0)
    }

    /// Release whatever account `device` holds. Returns the row as it was
    /// before the release, or None when the device held nothing. The level
    /// hint only ever raises the stored level.
    pub async fn release(
        &self,
        device: &str,
        release_reason: Option<&str>,
        level: Option<i64>,
        mark_burned: bool,
        now: i64,
    ) -> Result<Option<AccountRow>> {
        let mut tx = self.pool.begin().await?;

        let row: Option<AccountRow> =
            sqlx::query_as("SELECT * FROM accounts WHERE in_use_by = ? LIMIT 1")
                .bind(device)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(account) = row else {
            tx.rollback().await?;
            return Ok(None);
        };

        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("UPDATE accounts SET in_use_by = NULL, last_returned = ");
        qb.push_bind(now);
        qb.push(", last_updated = ");
        qb.push_bind(now);
        qb.push(", last_reason = ");
        qb.push_bind(release_reason.map(str::to_string));
        if mark_burned {
            qb.push(", last_burned = ");
            qb.push_bind(datetime_from_epoch(now));
        }
        if let Some(level) = level {
            if level > account.level {
                qb.push(", level = ");
                qb.push_bind(level);
            }
        }
        qb.push(" WHERE username = ");
        qb.push_bind(account.username.clone());
        qb.build().execute(&mut *tx).await?;

        tx.commit().await?;
        Ok(Some(account))
    }

    /// Clear any lingering binding for `device` before a new reservation.
    pub async fn reset_device(&self, device: &str, now: i64) -> Result<u64> {
        let done = sqlx::query(
            r#"
            UPDATE accounts SET in_use_by = NULL, last_returned = ?, last_updated = ?
            WHERE in_use_by = ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(device)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected())
    }

    pub async fn device_logins_last_hour(&self, device: &str, now: i64) -> Result<i64> {
        let hour_ago = datetime_from_epoch(now - 3600);
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM accounts_history WHERE device = ? AND acquired > ?",
        )
        .bind(device)
        .bind(hour_ago)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.0)
    }

    /// Open-or-update for the history stream. All the subtle rewrite rules
    /// that feed the rate-limit counts live here and nowhere else:
    ///
    /// - a "prelogin" row closed as "logout" with zero encounters becomes
    ///   "nologin" (the binding never logged in);
    /// - an encounter value below the stored one (both positive) is treated
    ///   as an increment, otherwise the maximum wins.
    pub async fn history_open_update(
        &self,
        device: &str,
        username: &str,
        update: HistoryUpdate,
        now: i64,
    ) -> Result<()> {
        let day_ago = datetime_from_epoch(now - 24 * 3600);
        let mut tx = self.pool.begin().await?;

        let open: Option<HistoryRow> = sqlx::query_as(
            r#"
            SELECT * FROM accounts_history
            WHERE device = ? AND username = ? AND returned IS NULL AND acquired > ?
            ORDER BY acquired DESC LIMIT 1
            "#,
        )
        .bind(device)
        .bind(username)
        .bind(day_ago)
        .fetch_optional(&mut *tx)
        .await?;

        match open {
            Some(row) => {
                let mut new_reason = update.reason.clone();
                if row.reason.as_deref() == Some(reason::PRELOGIN)
                    && new_reason.as_deref() == Some(reason::LOGOUT)
                    && update.encounters.unwrap_or(0) == 0
                {
                    new_reason = Some(reason::NOLOGIN.to_string());
                }

                let encounters = match update.encounters {
                    Some(new) if row.encounters > new && row.encounters > 0 && new > 0 => {
                        row.encounters + new
                    }
                    Some(new) => row.encounters.max(new),
                    None => row.encounters,
                };

                let mut qb: QueryBuilder<Sqlite> =
                    QueryBuilder::new("UPDATE accounts_history SET encounters = ");
                qb.push_bind(encounters);
                if let Some(returned) = update.returned {
                    qb.push(", returned = ");
                    qb.push_bind(returned);
                }
                if let Some(reason) = new_reason {
                    qb.push(", reason = ");
                    qb.push_bind(reason);
                }
                if let Some(purpose) = update.purpose {
                    qb.push(", purpose = ");
                    qb.push_bind(purpose);
                }
                if let Some(acquired) = update.acquired {
                    qb.push(", acquired = ");
                    qb.push_bind(acquired);
                }
                qb.push(" WHERE id = ");
                qb.push_bind(row.id);
                qb.build().execute(&mut *tx).await?;
            }
            None => {
                let acquired = update.acquired.unwrap_or_else(|| datetime_from_epoch(now));
                sqlx::query(
                    r#"
                    INSERT INTO accounts_history
                    (username, device, acquired, returned, reason, encounters, purpose)
                    VALUES (?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(username)
                .bind(device)
                .bind(acquired)
                .bind(update.returned)
                .bind(update.reason)
                .bind(update.encounters.unwrap_or(0))
                .bind(update.purpose)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Close the newest open history row a device left behind, within a
    /// five-day horizon, as a "reset".
    pub async fn close_dangling_history(&self, device: &str, now: i64) -> Result<()> {
        let horizon = datetime_from_epoch(now - 5 * 24 * 3600);
        sqlx::query(
            r#"
            UPDATE accounts_history SET returned = ?, reason = ?
            WHERE id IN (
                SELECT id FROM accounts_history
                WHERE device = ? AND returned IS NULL AND acquired > ?
                ORDER BY acquired DESC LIMIT 1
            )
            "#,
        )
        .bind(datetime_from_epoch(now))
        .bind(reason::RESET)
        .bind(device)
        .bind(horizon)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Encounters recorded for `username` across closed history rows in the
    /// trailing cooldown window.
    pub async fn encounters_in_window(
        &self,
        username: &str,
        now: i64,
        settings: &BrokerSettings,
    ) -> Result<i64> {
        let window_start = datetime_from_epoch(now - settings.cooldown_seconds());
        let sum: (Option<i64>,) = sqlx::query_as(
            "SELECT SUM(encounters) FROM accounts_history WHERE username = ? AND returned > ?",
        )
        .bind(username)
        .bind(window_start)
        .fetch_one(&self.pool)
        .await?;
        Ok(sum.0.unwrap_or(0))
    }

    pub async fn bound_account(&self, device: &str) -> Result<Option<AccountRow>> {
        Ok(
            sqlx::query_as("SELECT * FROM accounts WHERE in_use_by = ? LIMIT 1")
                .bind(device)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    /// Raise the bound account's level to `level`; lower hints are ignored.
    pub async fn raise_level(&self, device: &str, level: i64, now: i64) -> Result<u64> {
        let done = sqlx::query(
            "UPDATE accounts SET level = ?, last_updated = ? WHERE in_use_by = ? AND level < ?",
        )
        .bind(level)
        .bind(now)
        .bind(device)
        .bind(level)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected())
    }

    /// Record a softban on the device's account. Returns the username, or
    /// None when the device holds nothing.
    pub async fn set_softban(
        &self,
        device: &str,
        time: NaiveDateTime,
        location_json: &str,
        now: i64,
    ) -> Result<Option<String>> {
        let mut tx = self.pool.begin().await?;
        let row: Option<(String,)> =
            sqlx::query_as("SELECT username FROM accounts WHERE in_use_by = ? LIMIT 1")
                .bind(device)
                .fetch_optional(&mut *tx)
                .await?;
        let Some((username,)) = row else {
            tx.rollback().await?;
            return Ok(None);
        };
        sqlx::query(
            r#"
            UPDATE accounts SET softban_time = ?, softban_location = ?, last_updated = ?
            WHERE username = ?
            "#,
        )
        .bind(time)
        .bind(location_json)
        .bind(now)
        .bind(&username)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(Some(username))
    }

    /// Reason recorded on the newest history row for this binding, open or
    /// closed. Overrides the accounts-table `last_reason` in info responses.
    pub async fn latest_history_reason(
        &self,
        device: &str,
        username: &str,
    ) -> Result<Option<String>> {
        let row: Option<(Option<String>,)> = sqlx::query_as(
            r#"
            SELECT reason FROM accounts_history
            WHERE device = ? AND username = ?
            ORDER BY acquired DESC LIMIT 1
            "#,
        )
        .bind(device)
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(|r| r.0))
    }

    pub async fn account_count(&self) -> Result<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM accounts")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0)
    }

    pub async fn stats(&self, now: i64, settings: &BrokerSettings) -> Result<StatsMap> {
        let mut map = BTreeMap::new();
        for region in ["EU", "US", "shared"] {
            map.insert(region.to_string(), self.region_stats(region, now, settings).await?);
        }
        Ok(map)
    }

    async fn region_stats(
        &self,
        region: &str,
        now: i64,
        settings: &BrokerSettings,
    ) -> Result<RegionStats> {
        let shared = region == "shared";
        let region_clause = if shared {
            "(region IS NULL OR region = '')"
        } else {
            "region = ?"
        };
        let bind_region = (!shared).then_some(region);
        let cooling_since = now - settings.cooldown_seconds();

        let accounts = self
            .count_where(&format!("SELECT COUNT(*) FROM accounts WHERE {region_clause}"), bind_region)
            .await?;
        let in_use = self
            .count_where(
                &format!(
                    "SELECT COUNT(*) FROM accounts WHERE {region_clause} AND in_use_by IS NOT NULL"
                ),
                bind_region,
            )
            .await?;
        let unleveled = self
            .count_where(
                &format!(
                    "SELECT COUNT(*) FROM accounts WHERE {region_clause} AND level < {LEVELED_THRESHOLD}"
                ),
                bind_region,
            )
            .await?;

        let cooldown_sql = format!(
            r#"
            SELECT COALESCE(last_reason, 'unknown') AS why, COUNT(*) AS n
            FROM accounts
            WHERE {region_clause} AND in_use_by IS NULL AND last_returned >= ?
            GROUP BY why
            "#
        );
        let mut cooldown_query = sqlx::query_as::<_, (String, i64)>(&cooldown_sql);
        if let Some(region) = bind_region {
            cooldown_query = cooldown_query.bind(region);
        }
        let cooldown: BTreeMap<String, i64> = cooldown_query
            .bind(cooling_since)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .collect();

        // free-account counts deliberately skip the cooldown-age filter
        let available = self
            .count_where(
                &format!(
                    "SELECT COUNT(*) FROM accounts WHERE {region_clause} AND in_use_by IS NULL"
                ),
                bind_region,
            )
            .await?;
        let available_leveled = self
            .count_where(
                &format!(
                    "SELECT COUNT(*) FROM accounts WHERE {region_clause} AND in_use_by IS NULL AND level >= {LEVELED_THRESHOLD}"
                ),
                bind_region,
            )
            .await?;

        Ok(RegionStats {
            total: TotalStats {
                accounts,
                in_use,
                cooldown,
                unleveled,
            },
            available: AvailableStats {
                total: available,
                leveled: available_leveled,
                unleveled: available - available_leveled,
            },
        })
    }

    async fn count_where(&self, sql: &str, bind_region: Option<&str>) -> Result<i64> {
        let mut query = sqlx::query_as::<_, (i64,)>(sql);
        if let Some(region) = bind_region {
            query = query.bind(region);
        }
        Ok(query.fetch_one(&self.pool).await?.0)
    }
}

fn push_level_clause(qb: &mut QueryBuilder<Sqlite>, purpose: &Purpose) {
    if let Some(min) = purpose.min_level() {
        qb.push(" AND level >= ");
        qb.push_bind(min);
    }
    if let Some(max) = purpose.max_level_exclusive() {
        qb.push(" AND level < ");
        qb.push_bind(max);
    }
}

// An account becomes eligible again once a cooldown-triggering release has
// aged out; a release without a reason never triggers the cooldown.
fn push_release_cooldown_clause(
    qb: &mut QueryBuilder<Sqlite>,
    now: i64,
    settings: &BrokerSettings,
) {
    qb.push(" AND (last_returned IS NULL OR last_returned < ");
    qb.push_bind(now - settings.cooldown_seconds());
    qb.push(" OR last_reason IS NULL)");
}

fn push_encounter_budget_clause(
    qb: &mut QueryBuilder<Sqlite>,
    now: i64,
    settings: &BrokerSettings,
    budget: i64,
) {
    let window_start = datetime_from_epoch(now - settings.cooldown_seconds());
    qb.push(
        " AND COALESCE((SELECT SUM(h.encounters) FROM accounts_history h \
         WHERE h.username = accounts.username AND h.returned > ",
    );
    qb.push_bind(window_start);
    qb.push("), 0) < ");
    qb.push_bind(budget);
}

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Accounts at or above this level count as "leveled".
pub const LEVELED_THRESHOLD: i64 = 30;

/// Release / history reason strings shared between the accounts table and the
/// history stream.
pub mod reason {
    pub const MAINTENANCE: &str = "maintenance";
    pub const LOGIN: &str = "login";
    pub const LOGOUT: &str = "logout";
    pub const PRELOGIN: &str = "prelogin";
    pub const NOLOGIN: &str = "nologin";
    pub const RESET: &str = "reset";
}

/// The workload class a device declares when asking for an account. Each
/// class maps onto a level requirement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Purpose {
    Iv,
    Quest,
    QuestIv,
    MonRaid,
    Level,
    Other(String),
}

impl Purpose {
    pub fn as_str(&self) -> &str {
        match self {
            Purpose::Iv => "iv",
            Purpose::Quest => "quest",
            Purpose::QuestIv => "quest_iv",
            Purpose::MonRaid => "mon_raid",
            Purpose::Level => "level",
            Purpose::Other(raw) => raw,
        }
    }

    pub fn min_level(&self) -> Option<i64> {
        match self {
            Purpose::Iv | Purpose::Quest | Purpose::QuestIv => Some(LEVELED_THRESHOLD),
            Purpose::MonRaid => Some(8),
            _ => None,
        }
    }

    pub fn max_level_exclusive(&self) -> Option<i64> {
        match self {
            Purpose::Level => Some(LEVELED_THRESHOLD),
            _ => None,
        }
    }
}

impl From<&str> for Purpose {
    fn from(raw: &str) -> Self {
        match raw {
            "iv" => Purpose::Iv,
            "quest" => Purpose::Quest,
            "quest_iv" => Purpose::QuestIv,
            "mon_raid" => Purpose::MonRaid,
            "level" => Purpose::Level,
            other => Purpose::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for Purpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Purpose {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Purpose {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Purpose::from(raw.as_str()))
    }
}

/// One row of the `accounts` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AccountRow {
    pub username: String,
    pub password: String,
    pub level: i64,
    pub region: Option<String>,
    pub in_use_by: Option<String>,
    pub last_use: Option<i64>,
    pub last_returned: Option<i64>,
    pub last_reason: Option<String>,
    pub last_burned: Option<NaiveDateTime>,
    pub last_updated: Option<i64>,
    pub purpose: Option<String>,
    pub softban_time: Option<NaiveDateTime>,
    pub softban_location: Option<String>,
}

/// One row of the `accounts_history` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct HistoryRow {
    pub id: i64,
    pub username: String,
    pub device: String,
    pub acquired: NaiveDateTime,
    pub returned: Option<NaiveDateTime>,
    pub reason: Option<String>,
    pub encounters: i64,
    pub purpose: Option<String>,
}

/// Tunables from the `[general]` config section.
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    /// Hours an account stays ineligible after a cooldown-triggering release.
    /// Doubles as the trailing window for encounter accounting.
    pub cooldown_hours: i64,
    /// Minimum hours between successive hand-outs of the same account.
    pub short_cooldown_hours: i64,
    pub encounter_limit: i64,
    pub device_max_logins_per_hour: i64,
    pub account_max_logins_per_hour: i64,
    /// Refuse `iv` pickups outright.
    pub disable_iv: bool,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            cooldown_hours: 24,
            short_cooldown_hours: 3,
            encounter_limit: 6500,
            device_max_logins_per_hour: 4,
            account_max_logins_per_hour: 4,
            disable_iv: false,
        }
    }
}

impl BrokerSettings {
    pub fn cooldown_seconds(&self) -> i64 {
        self.cooldown_hours * 3600
    }

    pub fn short_cooldown_seconds(&self) -> i64 {
        self.short_cooldown_hours * 3600
    }

    /// Encounter budget for a fresh pool pick: 80% of the limit.
    pub fn pick_budget(&self) -> i64 {
        self.encounter_limit * 8 / 10
    }

    /// Encounter budget for sticky reuse: 90% of the limit.
    pub fn reuse_budget(&self) -> i64 {
        self.encounter_limit * 9 / 10
    }
}

#[derive(Debug, Default, Serialize)]
pub struct TotalStats {
    pub accounts: i64,
    pub in_use: i64,
    /// Cooling accounts keyed by their release reason ("unknown" when unset).
    pub cooldown: BTreeMap<String, i64>,
    pub unleveled: i64,
}

#[derive(Debug, Default, Serialize)]
pub struct AvailableStats {
    pub total: i64,
    pub leveled: i64,
    pub unleveled: i64,
}

#[derive(Debug, Default, Serialize)]
pub struct RegionStats {
    pub total: TotalStats,
    pub available: AvailableStats,
}

/// Stats map keyed by region ("EU", "US", "shared").
pub type StatsMap = BTreeMap<String, RegionStats>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_purpose_round_trip() {
        for raw in ["iv", "quest", "quest_iv", "mon_raid", "level", "scan"] {
            let purpose = Purpose::from(raw);
            assert_eq!(purpose.as_str(), raw);
        }
    }

    #[test]
    fn test_purpose_level_bounds() {
        assert_eq!(Purpose::Iv.min_level(), Some(30));
        assert_eq!(Purpose::Quest.min_level(), Some(30));
        assert_eq!(Purpose::QuestIv.min_level(), Some(30));
        assert_eq!(Purpose::MonRaid.min_level(), Some(8));
        assert_eq!(Purpose::Level.min_level(), None);
        assert_eq!(Purpose::Level.max_level_exclusive(), Some(30));
        assert_eq!(Purpose::Other("scan".into()).min_level(), None);
        assert_eq!(Purpose::Other("scan".into()).max_level_exclusive(), None);
    }

    #[test]
    fn test_purpose_deserialize() {
        let purpose: Purpose = serde_json::from_str("\"quest_iv\"").unwrap();
        assert_eq!(purpose, Purpose::QuestIv);

        let purpose: Purpose = serde_json::from_str("\"anything\"").unwrap();
        assert_eq!(purpose, Purpose::Other("anything".to_string()));
    }

    #[test]
    fn test_settings_budgets() {
        let settings = BrokerSettings::default();
        assert_eq!(settings.cooldown_seconds(), 86_400);
        assert_eq!(settings.short_cooldown_seconds(), 10_800);
        assert_eq!(settings.pick_budget(), 5_200);
        assert_eq!(settings.reuse_budget(), 5_850);
    }
}

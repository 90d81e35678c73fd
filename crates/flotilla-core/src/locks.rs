use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::LockId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockStatus {
    Active,
    Expired,
    Released,
}

impl std::fmt::Display for LockStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Expired => write!(f, "expired"),
            Self::Released => write!(f, "released"),
        }
    }
}

impl std::str::FromStr for LockStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "expired" => Ok(Self::Expired),
            "released" => Ok(Self::Released),
            other => Err(format!("unknown lock status: {other}")),
        }
    }
}

/// A time-bounded advisory lease over a named resource.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub id: LockId,
    pub resource_key: String,
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
    pub status: LockStatus,
}

impl Lock {
    /// Active and not past its lease at `now`.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.status == LockStatus::Active && self.expires_at.map_or(true, |exp| exp > now)
    }

    /// Original lease length, if the lock was taken with a TTL.
    pub fn ttl_ms(&self) -> Option<u64> {
        self.expires_at
            .map(|exp| crate::clock::elapsed_ms(self.acquired_at, exp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn lock(expires_in_ms: Option<i64>, status: LockStatus) -> Lock {
        let acquired_at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        Lock {
            id: LockId::new(),
            resource_key: "src/foo.ts".into(),
            holder_id: "agent-a".into(),
            acquired_at,
            expires_at: expires_in_ms.map(|ms| acquired_at + chrono::Duration::milliseconds(ms)),
            released_at: None,
            status,
        }
    }

    #[test]
    fn status_roundtrip() {
        for status in [LockStatus::Active, LockStatus::Expired, LockStatus::Released] {
            assert_eq!(status.to_string().parse::<LockStatus>().unwrap(), status);
        }
        assert!("stolen".parse::<LockStatus>().is_err());
    }

    #[test]
    fn liveness_respects_lease() {
        let l = lock(Some(5_000), LockStatus::Active);
        assert!(l.is_live(l.acquired_at + chrono::Duration::milliseconds(4_999)));
        assert!(!l.is_live(l.acquired_at + chrono::Duration::milliseconds(5_000)));
    }

    #[test]
    fn lock_without_ttl_never_lapses() {
        let l = lock(None, LockStatus::Active);
        assert!(l.is_live(l.acquired_at + chrono::Duration::days(365)));
        assert_eq!(l.ttl_ms(), None);
    }

    #[test]
    fn released_lock_is_not_live() {
        let l = lock(Some(5_000), LockStatus::Released);
        assert!(!l.is_live(l.acquired_at));
        assert_eq!(l.ttl_ms(), Some(5_000));
    }
}

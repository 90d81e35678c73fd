use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(MailboxId, "mbx");
branded_id!(EventId, "evt");
branded_id!(CursorId, "cur");
branded_id!(LockId, "lock");
branded_id!(CheckpointId, "ckpt");
branded_id!(AgentId, "agent");
branded_id!(MissionId, "msn");
branded_id!(SortieId, "sortie");

impl MailboxId {
    /// Well-known mailbox that carries coordinator traffic for a mission.
    pub fn for_mission(mission_id: &MissionId) -> Self {
        Self(format!("mbx_mission_{mission_id}"))
    }

    /// Lease changes made through the coordinator.
    pub fn lock_journal() -> Self {
        Self("mbx_lock_journal".to_string())
    }
}

use std::{
    collections::HashMap,
    path::Path,
    sync::{PoisonError, RwLock},
};

use anyhow::Context;
use botvisor_process::{OwnerId, Plan, PlanTier};
use chrono::{DateTime, Utc};

/// Supplies the current plan of an owner. Billing lives outside the supervisor.
pub trait PlanProvider: Send + Sync {
    fn plan_for(&self, owner_id: &OwnerId) -> Plan;
}

/// Plan in force right now, with expired plans degraded to the free tier.
pub fn effective_plan(provider: &dyn PlanProvider, owner_id: &OwnerId) -> Plan {
    provider.plan_for(owner_id).effective(Utc::now())
}

#[derive(Debug, Clone)]
struct Assignment {
    tier: PlanTier,
    expiry: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, serde::Deserialize)]
struct TierOverride {
    max_bots: Option<u32>,
    max_ram_mb: Option<u64>,
    max_cpu_percent: Option<u32>,
    auto_restart: Option<bool>,
}

#[derive(Debug, serde::Deserialize)]
struct OwnerEntry {
    tier: PlanTier,
    #[serde(default)]
    expiry: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, serde::Deserialize)]
struct PlanFile {
    #[serde(default)]
    tiers: HashMap<String, TierOverride>,
    #[serde(default)]
    owners: HashMap<String, OwnerEntry>,
}

/// Tier catalogue plus owner assignments. Owners without an assignment are on `free`.
#[derive(Debug)]
pub struct PlanBook {
    tiers: HashMap<PlanTier, Plan>,
    owners: RwLock<HashMap<OwnerId, Assignment>>,
}

impl Default for PlanBook {
    fn default() -> Self {
        Self {
            tiers: PlanTier::ALL
                .into_iter()
                .map(|t| (t, t.default_plan()))
                .collect(),
            owners: RwLock::new(HashMap::new()),
        }
    }
}

impl PlanBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::new());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read plans file {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("parse plans file {}", path.display()))
    }

    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        let file: PlanFile = toml::from_str(raw)?;
        let mut book = Self::new();

        for (name, o) in file.tiers {
            let tier = PlanTier::ALL
                .into_iter()
                .find(|t| t.as_str() == name.trim().to_ascii_lowercase())
                .ok_or_else(|| anyhow::anyhow!("unknown tier: {name}"))?;
            let plan = book.tiers.entry(tier).or_insert_with(|| tier.default_plan());
            if let Some(v) = o.max_bots {
                plan.max_bots = v;
            }
            if let Some(v) = o.max_ram_mb {
                plan.max_ram_mb = v;
            }
            if let Some(v) = o.max_cpu_percent {
                if v > 100 {
                    anyhow::bail!("tier {name}: max_cpu_percent must be within 0..=100");
                }
                plan.max_cpu_percent = v;
            }
            if let Some(v) = o.auto_restart {
                plan.auto_restart = v;
            }
        }

        for (owner, entry) in file.owners {
            book.assign(OwnerId(owner), entry.tier, entry.expiry);
        }
        Ok(book)
    }

    pub fn assign(&self, owner_id: OwnerId, tier: PlanTier, expiry: Option<DateTime<Utc>>) {
        self.owners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(owner_id, Assignment { tier, expiry });
    }

    pub fn tier_plan(&self, tier: PlanTier) -> Plan {
        self.tiers
            .get(&tier)
            .cloned()
            .unwrap_or_else(|| tier.default_plan())
    }
}

impl PlanProvider for PlanBook {
    fn plan_for(&self, owner_id: &OwnerId) -> Plan {
        let assignment = self
            .owners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(owner_id)
            .cloned();
        match assignment {
            Some(a) => Plan {
                expiry: a.expiry,
                ..self.tier_plan(a.tier)
            },
            None => self.tier_plan(PlanTier::Free),
        }
    }
}

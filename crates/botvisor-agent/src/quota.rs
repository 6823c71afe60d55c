//! Quota arithmetic. Pure functions over an owner's records and plan; the
//! supervisor decides what to do with the answers.

use botvisor_process::{BotId, OwnerId, Plan, ResourceSample};

use crate::registry::HostedBotRecord;

/// Which ceiling a sample broke.
#[derive(Debug, Clone, PartialEq)]
pub enum LimitViolation {
    Memory { rss_mb: f64, max_ram_mb: u64 },
    Cpu { cpu_percent: f64, max_cpu_percent: u32 },
}

impl LimitViolation {
    pub fn describe(&self) -> String {
        match self {
            LimitViolation::Memory { rss_mb, max_ram_mb } => {
                format!("memory {rss_mb:.1} MB over limit {max_ram_mb} MB")
            }
            LimitViolation::Cpu {
                cpu_percent,
                max_cpu_percent,
            } => format!("cpu {cpu_percent:.1}% over limit {max_cpu_percent}%"),
        }
    }
}

fn owned_by<'a>(
    owner_id: &'a OwnerId,
    records: &'a [HostedBotRecord],
) -> impl Iterator<Item = &'a HostedBotRecord> + 'a {
    records.iter().filter(move |r| &r.owner_id == owner_id)
}

/// True if the owner may install one more bundle.
pub fn can_deploy(owner_id: &OwnerId, plan: &Plan, records: &[HostedBotRecord]) -> bool {
    let live = owned_by(owner_id, records)
        .filter(|r| !r.state().is_terminal())
        .count();
    (live as u64) < u64::from(plan.max_bots)
}

/// True if `candidate` may take an active slot (ready, starting, running, stopping).
/// A candidate that already holds a slot does not count against itself.
pub fn can_start(
    owner_id: &OwnerId,
    plan: &Plan,
    records: &[HostedBotRecord],
    candidate: &BotId,
) -> bool {
    let active = owned_by(owner_id, records)
        .filter(|r| &r.id != candidate && r.state().is_active())
        .count();
    (active as u64) < u64::from(plan.max_bots)
}

pub fn check_limits(sample: &ResourceSample, plan: &Plan) -> Option<LimitViolation> {
    let max_ram_bytes = plan.max_ram_mb.saturating_mul(1024 * 1024);
    if sample.rss_bytes > max_ram_bytes {
        return Some(LimitViolation::Memory {
            rss_mb: sample.rss_mb(),
            max_ram_mb: plan.max_ram_mb,
        });
    }
    if sample.cpu_percent > f64::from(plan.max_cpu_percent) {
        return Some(LimitViolation::Cpu {
            cpu_percent: sample.cpu_percent,
            max_cpu_percent: plan.max_cpu_percent,
        });
    }
    None
}

//! Cleanup Engine
//!
//! Classifies reclaimable Docker resources into four risk tiers and executes
//! tier-bounded pruning via `docker system df`/`docker system prune`, guarded
//! by a dry-run mode. Schedules live in the config store and fire from an
//! in-process scheduler that does not replay missed ticks.

use crate::config::{CleanupSchedule, CleanupTier, Config, ScheduleFrequency};
use crate::docker_context::DockerContext;
use crate::errors::CleanupError;
use chrono::{DateTime, Datelike, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

pub type Result<T> = std::result::Result<T, CleanupError>;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReclaimableTotals {
    pub containers_bytes: u64,
    pub images_bytes: u64,
    pub volumes_bytes: u64,
    pub build_cache_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupAnalysis {
    pub tier: CleanupTier,
    pub totals: ReclaimableTotals,
    pub dry_run: bool,
    pub warnings: Vec<String>,
}

fn parse_size_field(value: &serde_json::Value) -> u64 {
    value
        .get("Reclaimable")
        .and_then(|v| v.as_str())
        .and_then(parse_human_size)
        .unwrap_or(0)
}

/// Parse Docker's `docker system df`-style human sizes ("1.2GB", "512MB
/// (80%)") into bytes. Anything unparseable is treated as zero rather than
/// failing the whole analysis.
fn parse_human_size(raw: &str) -> Option<u64> {
    let raw = raw.split('(').next().unwrap_or(raw).trim();
    let split_at = raw.find(|c: char| !c.is_ascii_digit() && c != '.')?;
    let (number, unit) = raw.split_at(split_at);
    let number: f64 = number.parse().ok()?;
    let multiplier = match unit.trim().to_uppercase().as_str() {
        "B" => 1.0,
        "KB" => 1_000.0,
        "MB" => 1_000_000.0,
        "GB" => 1_000_000_000.0,
        "TB" => 1_000_000_000_000.0,
        _ => return None,
    };
    Some((number * multiplier) as u64)
}

/// Run `docker system df --format json` through the given context and sum
/// reclaimable bytes per resource category.
#[instrument(skip(context), fields(context = %context.name()))]
async fn analyze_totals(context: &DockerContext) -> Result<ReclaimableTotals> {
    let stdout = context
        .run(&["system", "df", "--format", "json"])
        .await
        .map_err(|e| CleanupError::DfParseError {
            message: e.to_string(),
        })?;

    let mut totals = ReclaimableTotals::default();
    for line in stdout.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let entry: serde_json::Value =
            serde_json::from_str(line).map_err(|e| CleanupError::DfParseError {
                message: format!("failed to parse docker system df output: {e}"),
            })?;
        let Some(kind) = entry.get("Type").and_then(|v| v.as_str()) else {
            continue;
        };
        let bytes = parse_size_field(&entry);
        match kind {
            "Containers" => totals.containers_bytes += bytes,
            "Images" => totals.images_bytes += bytes,
            "Local Volumes" => totals.volumes_bytes += bytes,
            "Build Cache" => totals.build_cache_bytes += bytes,
            _ => {}
        }
    }
    Ok(totals)
}

/// One `docker` invocation per element, run in order. "Safe" reclaims
/// stopped containers, dangling images, unused networks, and build cache
/// older than a day — nothing that could still be holding live data.
fn prune_commands(tier: CleanupTier) -> Vec<Vec<&'static str>> {
    match tier {
        CleanupTier::Check => vec![],
        CleanupTier::Safe => vec![
            vec!["container", "prune", "-f"],
            vec!["image", "prune", "-f"],
            vec!["network", "prune", "-f"],
            vec!["builder", "prune", "-f", "--filter", "until=24h"],
        ],
        CleanupTier::Moderate => vec![vec!["system", "prune", "-af"]],
        CleanupTier::Aggressive => vec![vec!["system", "prune", "-af", "--volumes"]],
    }
}

/// Run the analysis (and, unless `dry_run`, the prune) for `tier` against
/// `context`.
#[instrument(skip(context), fields(context = %context.name(), ?tier, dry_run))]
pub async fn run(context: &DockerContext, tier: CleanupTier, dry_run: bool) -> Result<CleanupAnalysis> {
    let totals = analyze_totals(context).await?;

    let mut warnings = Vec::new();
    if tier == CleanupTier::Aggressive {
        warnings.push(
            "aggressive tier removes unused volumes, which may contain persistent data that cannot be recovered"
                .to_string(),
        );
    }

    if dry_run || tier == CleanupTier::Check {
        return Ok(CleanupAnalysis {
            tier,
            totals,
            dry_run: true,
            warnings,
        });
    }

    for args in prune_commands(tier) {
        context
            .run(&args)
            .await
            .map_err(|e| CleanupError::PruneFailed {
                message: e.to_string(),
            })?;
    }

    Ok(CleanupAnalysis {
        tier,
        totals,
        dry_run: false,
        warnings,
    })
}

/// Compute the next UTC fire time for `schedule`, strictly after `now`. Used
/// both to drive the scheduler loop and to seed it on startup — startup never
/// looks backward, so a missed tick is simply skipped rather than replayed.
pub fn next_fire_after(schedule: &CleanupSchedule, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let time = NaiveTime::parse_from_str(&schedule.time, "%H:%M").map_err(|e| {
        CleanupError::InvalidSchedule {
            message: format!("invalid time '{}': {e}", schedule.time),
        }
    })?;

    let mut candidate = now
        .date_naive()
        .and_time(time)
        .and_local_timezone(Utc)
        .single()
        .ok_or_else(|| CleanupError::InvalidSchedule {
            message: "ambiguous local time".to_string(),
        })?;

    if candidate <= now {
        candidate += chrono::Duration::days(1);
    }

    if schedule.frequency == ScheduleFrequency::Weekly {
        while candidate.weekday() != now.weekday() || candidate <= now {
            candidate += chrono::Duration::days(1);
        }
    }

    Ok(candidate)
}

/// In-process scheduler: on each tick, fires any schedule whose computed next
/// fire time has passed, then recomputes. Construction happens at process
/// start from "now" forward only — there is no catch-up for ticks the
/// process missed while it was down.
pub struct CleanupScheduler {
    next_fire: std::collections::HashMap<String, DateTime<Utc>>,
}

impl CleanupScheduler {
    pub fn on_start(config: &Config, now: DateTime<Utc>) -> Self {
        let mut next_fire = std::collections::HashMap::new();
        for (id, schedule) in &config.cleanup_schedules {
            match next_fire_after(schedule, now) {
                Ok(when) => {
                    next_fire.insert(id.clone(), when);
                }
                Err(e) => warn!(schedule = %id, error = %e, "skipping invalid schedule at startup"),
            }
        }
        Self { next_fire }
    }

    /// Returns the schedule IDs that are due at `now`, advancing each one's
    /// next-fire time.
    pub fn due(&mut self, config: &Config, now: DateTime<Utc>) -> Vec<String> {
        let mut fired = Vec::new();
        for (id, &when) in self.next_fire.clone().iter() {
            if when <= now {
                fired.push(id.clone());
                if let Some(schedule) = config.cleanup_schedules.get(id) {
                    if let Ok(next) = next_fire_after(schedule, now) {
                        self.next_fire.insert(id.clone(), next);
                    }
                }
            }
        }
        if !fired.is_empty() {
            info!(count = fired.len(), "cleanup schedules due");
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_human_readable_sizes() {
        assert_eq!(parse_human_size("1.2GB"), Some(1_200_000_000));
        assert_eq!(parse_human_size("512MB (80%)"), Some(512_000_000));
        assert_eq!(parse_human_size("0B"), Some(0));
        assert_eq!(parse_human_size("garbage"), None);
    }

    #[test]
    fn safe_tier_prunes_containers_images_networks_and_build_cache() {
        let commands = prune_commands(CleanupTier::Safe);
        assert_eq!(
            commands,
            vec![
                vec!["container", "prune", "-f"],
                vec!["image", "prune", "-f"],
                vec!["network", "prune", "-f"],
                vec!["builder", "prune", "-f", "--filter", "until=24h"],
            ]
        );
    }

    #[test]
    fn safe_tier_never_touches_volumes() {
        let commands = prune_commands(CleanupTier::Safe);
        assert!(!commands.iter().any(|cmd| cmd.contains(&"volume")));
    }

    #[test]
    fn aggressive_tier_always_warns() {
        let totals = ReclaimableTotals::default();
        let analysis = CleanupAnalysis {
            tier: CleanupTier::Aggressive,
            totals,
            dry_run: true,
            warnings: vec!["persistent data".into()],
        };
        assert!(analysis.warnings[0].contains("persistent data"));
    }

    #[test]
    fn daily_schedule_rolls_to_tomorrow_when_time_has_passed() {
        let schedule = CleanupSchedule {
            host_id: "prod-1".into(),
            frequency: ScheduleFrequency::Daily,
            time: "03:00".into(),
            tier: CleanupTier::Safe,
        };
        let now = Utc.with_ymd_and_hms(2026, 8, 1, 10, 0, 0).unwrap();
        let next = next_fire_after(&schedule, now).unwrap();
        assert_eq!(next.date_naive(), now.date_naive().succ_opt().unwrap());
    }

    #[test]
    fn daily_schedule_today_when_time_has_not_passed() {
        let schedule = CleanupSchedule {
            host_id: "prod-1".into(),
            frequency: ScheduleFrequency::Daily,
            time: "23:00".into(),
            tier: CleanupTier::Safe,
        };
        let now = Utc.with_ymd_and_hms(2026, 8, 1, 10, 0, 0).unwrap();
        let next = next_fire_after(&schedule, now).unwrap();
        assert_eq!(next.date_naive(), now.date_naive());
    }
}

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use rand::Rng;
use tokio::time::Instant;

use tollgate_common::{RelayError, RelayResult};
use tollgate_store::ChannelRow;

/// Read-mostly channel snapshot plus the in-memory cooldown ledger.
///
/// Selection reads only; the snapshot is replaced wholesale on reload or
/// auto-disable, never mutated in place while requests are in flight.
pub struct ChannelDirectory {
    snapshot: ArcSwap<Vec<ChannelRow>>,
    cooldowns: Mutex<HashMap<i64, Instant>>,
}

impl ChannelDirectory {
    pub fn new(channels: Vec<ChannelRow>) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(channels),
            cooldowns: Mutex::new(HashMap::new()),
        }
    }

    pub fn replace_snapshot(&self, channels: Vec<ChannelRow>) {
        self.snapshot.store(Arc::new(channels));
    }

    pub fn get(&self, channel_id: i64) -> Option<ChannelRow> {
        self.snapshot
            .load()
            .iter()
            .find(|row| row.id == channel_id)
            .cloned()
    }

    /// Flip a channel off in the snapshot (the durable flag is updated by the
    /// caller through the store).
    pub fn mark_disabled(&self, channel_id: i64) {
        let mut next = self.snapshot.load().as_ref().clone();
        if let Some(row) = next.iter_mut().find(|row| row.id == channel_id) {
            row.enabled = false;
        }
        self.snapshot.store(Arc::new(next));
    }

    /// Park a channel until `now + duration` without touching the durable
    /// enabled flag (rate-limit style failures).
    pub fn set_cooldown(&self, channel_id: i64, duration: Duration) {
        if let Ok(mut cooldowns) = self.cooldowns.lock() {
            cooldowns.insert(channel_id, Instant::now() + duration);
        }
    }

    fn is_cooled(&self, channel_id: i64) -> bool {
        match self.cooldowns.lock() {
            Ok(cooldowns) => cooldowns
                .get(&channel_id)
                .is_some_and(|until| *until > Instant::now()),
            Err(_) => false,
        }
    }

    /// Model names reachable by `group`, for the listing surface.
    pub fn models_for_group(&self, group: &str) -> Vec<String> {
        let mut models: Vec<String> = self
            .snapshot
            .load()
            .iter()
            .filter(|row| row.enabled && row.serves_group(group))
            .flat_map(|row| {
                row.models
                    .split(',')
                    .map(|entry| entry.trim().to_string())
                    .collect::<Vec<_>>()
            })
            .filter(|model| !model.is_empty())
            .collect();
        models.sort();
        models.dedup();
        models
    }
}

/// Pick the channel serving this request: the pinned channel when the grant
/// carries one, otherwise weighted-random among eligible channels.
pub fn select_channel(
    directory: &ChannelDirectory,
    group: &str,
    model: &str,
    pin: Option<i64>,
) -> RelayResult<ChannelRow> {
    if let Some(channel_id) = pin {
        let channel = directory
            .get(channel_id)
            .ok_or(RelayError::InvalidChannel(channel_id))?;
        if !channel.serves_group(group) {
            return Err(RelayError::ChannelForbidden {
                channel_id,
                group: group.to_string(),
            });
        }
        if !channel.serves_model(model) {
            return Err(RelayError::ModelNotSupported {
                channel_id,
                model: model.to_string(),
            });
        }
        if !channel.enabled {
            return Err(RelayError::ChannelDisabled(channel_id));
        }
        return Ok(channel);
    }

    let snapshot = directory.snapshot.load();
    let eligible: Vec<&ChannelRow> = snapshot
        .iter()
        .filter(|row| {
            row.enabled
                && row.serves_group(group)
                && row.serves_model(model)
                && !directory.is_cooled(row.id)
        })
        .collect();
    if eligible.is_empty() {
        return Err(RelayError::NoAvailableChannel {
            group: group.to_string(),
            model: model.to_string(),
        });
    }

    let chosen_id = pick_weighted(&eligible);
    // Re-resolve by id so a snapshot swap between pick and use surfaces as a
    // data-integrity fault rather than serving a stale record.
    directory.get(chosen_id).ok_or_else(|| {
        RelayError::DataIntegrityFault(format!("selected channel {chosen_id} vanished"))
    })
}

fn pick_weighted(eligible: &[&ChannelRow]) -> i64 {
    let total: i64 = eligible.iter().map(|row| row.weight.max(0)).sum();
    let mut rng = rand::rng();
    if total <= 0 {
        return eligible[rng.random_range(0..eligible.len())].id;
    }
    let mut remaining = rng.random_range(0..total);
    for row in eligible {
        let weight = row.weight.max(0);
        if remaining < weight {
            return row.id;
        }
        remaining -= weight;
    }
    eligible[eligible.len() - 1].id
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(id: i64, enabled: bool, groups: &str, models: &str, weight: i64) -> ChannelRow {
        ChannelRow {
            id,
            name: format!("ch{id}"),
            kind: "openai".into(),
            enabled,
            groups: groups.into(),
            models: models.into(),
            base_url: None,
            api_key: "k".into(),
            weight,
            model_remap: None,
            config: None,
            auto_ban: None,
            used_quota: 0,
        }
    }

    #[test]
    fn random_path_only_selects_eligible() {
        let directory = ChannelDirectory::new(vec![
            channel(1, true, "default", "gpt-4o", 0),
            channel(2, false, "default", "gpt-4o", 0),
            channel(3, true, "vip", "gpt-4o", 0),
            channel(4, true, "default", "gpt-3.5-turbo", 0),
        ]);
        for _ in 0..50 {
            let chosen = select_channel(&directory, "default", "gpt-4o", None).unwrap();
            assert_eq!(chosen.id, 1);
        }
    }

    #[test]
    fn weighted_pick_respects_weights() {
        let directory = ChannelDirectory::new(vec![
            channel(1, true, "default", "gpt-4o", 1),
            channel(2, true, "default", "gpt-4o", 9),
        ]);
        let mut seen_two = 0;
        for _ in 0..200 {
            if select_channel(&directory, "default", "gpt-4o", None).unwrap().id == 2 {
                seen_two += 1;
            }
        }
        // 9:1 weighting makes channel 2 dominate; a run of 200 draws landing
        // below half would be astronomically unlikely.
        assert!(seen_two > 100, "weighted pick chose channel 2 only {seen_two}/200 times");
    }

    #[test]
    fn empty_set_names_group_and_model() {
        let directory = ChannelDirectory::new(vec![channel(1, true, "vip", "gpt-4o", 0)]);
        let err = select_channel(&directory, "default", "gpt-4o", None).unwrap_err();
        match err {
            RelayError::NoAvailableChannel { group, model } => {
                assert_eq!(group, "default");
                assert_eq!(model, "gpt-4o");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn pinned_checks_run_in_order() {
        let directory = ChannelDirectory::new(vec![
            channel(1, false, "default", "gpt-4o", 0),
            channel(2, true, "vip", "gpt-4o", 0),
        ]);
        assert!(matches!(
            select_channel(&directory, "default", "gpt-4o", Some(99)),
            Err(RelayError::InvalidChannel(99))
        ));
        assert!(matches!(
            select_channel(&directory, "default", "gpt-4o", Some(2)),
            Err(RelayError::ChannelForbidden { channel_id: 2, .. })
        ));
        assert!(matches!(
            select_channel(&directory, "default", "gpt-3.5-turbo", Some(1)),
            Err(RelayError::ModelNotSupported { channel_id: 1, .. })
        ));
        // Disabled is checked last: a disabled pinned channel that serves the
        // group and model reports ChannelDisabled.
        assert!(matches!(
            select_channel(&directory, "default", "gpt-4o", Some(1)),
            Err(RelayError::ChannelDisabled(1))
        ));
    }

    #[test]
    fn cooldown_parks_channel_without_disabling() {
        let directory = ChannelDirectory::new(vec![
            channel(1, true, "default", "gpt-4o", 0),
            channel(2, true, "default", "gpt-4o", 0),
        ]);
        directory.set_cooldown(1, Duration::from_secs(60));
        for _ in 0..20 {
            assert_eq!(
                select_channel(&directory, "default", "gpt-4o", None).unwrap().id,
                2
            );
        }
        // Pinned selection ignores cooldown: the operator asked for it.
        assert_eq!(
            select_channel(&directory, "default", "gpt-4o", Some(1)).unwrap().id,
            1
        );
    }

    #[test]
    fn disable_updates_snapshot() {
        let directory = ChannelDirectory::new(vec![channel(1, true, "default", "gpt-4o", 0)]);
        directory.mark_disabled(1);
        assert!(matches!(
            select_channel(&directory, "default", "gpt-4o", None),
            Err(RelayError::NoAvailableChannel { .. })
        ));
    }
}

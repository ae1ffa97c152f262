//! Channel routing: maps a data channel name to a bus target.
//!
//! Rules come from the device itself and from the default device. Both sets
//! are merged with device rules ranked above default rules of the same
//! priority (`priority * 2 + 1` against `priority * 2`); the highest combined
//! priority whose pattern matches wins.

use crate::error::RegistryError;
use crate::registry::DeviceRegistry;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Highest accepted rule priority.
pub const MAX_PRIORITY: u8 = 100;

/// A routing rule: channels matching `pattern` go to `target`.
///
/// The target may reference capture groups of the pattern (`$1`, `${name}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRule {
    pub priority: u8,
    pub pattern: String,
    pub target: String,
}

impl ChannelRule {
    /// Creates a rule, checking the priority range and the pattern.
    pub fn new(
        priority: u8,
        pattern: impl Into<String>,
        target: impl Into<String>,
    ) -> Result<Self, RegistryError> {
        let rule = Self {
            priority,
            pattern: pattern.into(),
            target: target.into(),
        };
        rule.validate()?;
        Ok(rule)
    }

    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.priority > MAX_PRIORITY {
            return Err(RegistryError::InvalidPriority(self.priority));
        }
        Regex::new(&self.pattern).map_err(|e| RegistryError::InvalidPattern {
            pattern: self.pattern.clone(),
            reason: e.to_string(),
        })?;
        Ok(())
    }
}

/// Resolves targets for one device, caching results per channel name.
///
/// The cache is dropped whenever the registry reports a new rule generation.
#[derive(Debug)]
pub struct ChannelRouter {
    device: Uuid,
    generation: u64,
    cache: HashMap<String, Option<String>>,
}

impl ChannelRouter {
    pub fn new(device: Uuid) -> Self {
        Self {
            device,
            generation: 0,
            cache: HashMap::new(),
        }
    }

    pub fn device(&self) -> &Uuid {
        &self.device
    }

    /// Returns the target for `channel`, or `None` when no rule matches.
    pub fn resolve(
        &mut self,
        registry: &dyn DeviceRegistry,
        channel: &str,
    ) -> Result<Option<String>, RegistryError> {
        let generation = registry.rules_generation();
        if generation != self.generation {
            self.cache.clear();
            self.generation = generation;
        }
        if let Some(target) = self.cache.get(channel) {
            return Ok(target.clone());
        }

        let device_rules = registry.channel_rules(Some(&self.device))?;
        let default_rules = registry.channel_rules(None)?;
        let target = compute_target(&device_rules, &default_rules, channel);
        self.cache.insert(channel.to_string(), target.clone());
        Ok(target)
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}

fn compute_target(
    device_rules: &[ChannelRule],
    default_rules: &[ChannelRule],
    channel: &str,
) -> Option<String> {
    let mut ranked: Vec<(u16, &ChannelRule)> = device_rules
        .iter()
        .map(|r| (r.priority as u16 * 2 + 1, r))
        .chain(default_rules.iter().map(|r| (r.priority as u16 * 2, r)))
        .collect();
    ranked.sort_by(|(pa, ra), (pb, rb)| pb.cmp(pa).then_with(|| ra.pattern.cmp(&rb.pattern)));

    for (_, rule) in ranked {
        let regex = match Regex::new(&rule.pattern) {
            Ok(regex) => regex,
            Err(e) => {
                tracing::warn!("Skipping channel rule {:?}: {}", rule.pattern, e);
                continue;
            }
        };
        if let Some(captures) = regex.captures(channel) {
            let mut target = String::new();
            captures.expand(&rule.target, &mut target);
            return Some(target);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryRegistry;

    fn rule(priority: u8, pattern: &str, target: &str) -> ChannelRule {
        ChannelRule::new(priority, pattern, target).unwrap()
    }

    #[test]
    fn test_rule_validation() {
        assert!(matches!(
            ChannelRule::new(101, "x", "t"),
            Err(RegistryError::InvalidPriority(101))
        ));
        assert!(matches!(
            ChannelRule::new(5, "(", "t"),
            Err(RegistryError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_device_rule_beats_default_at_same_priority() {
        let device = vec![rule(10, "^sen", "device-target")];
        let default = vec![rule(10, "^sen", "default-target")];
        assert_eq!(
            compute_target(&device, &default, "sen:temp").as_deref(),
            Some("device-target")
        );
    }

    #[test]
    fn test_higher_default_priority_wins() {
        let device = vec![rule(10, "^sen", "device-target")];
        let default = vec![rule(11, "^sen", "default-target")];
        assert_eq!(
            compute_target(&device, &default, "sen:temp").as_deref(),
            Some("default-target")
        );
        assert_eq!(compute_target(&device, &default, "loc"), None);
    }

    #[test]
    fn test_target_template_expansion() {
        let default = vec![rule(1, "^conv:(\\w+)$", "converter-$1")];
        assert_eq!(
            compute_target(&[], &default, "conv:obd").as_deref(),
            Some("converter-obd")
        );
    }

    #[test]
    fn test_cache_invalidated_on_new_rule() {
        let registry = MemoryRegistry::new();
        let dev = registry.device_by_ident_or_create("imei:1234567").unwrap();
        registry
            .add_channel_rule(None, rule(1, ".*", "converter-m2mp"))
            .unwrap();

        let mut router = ChannelRouter::new(dev.id);
        assert_eq!(
            router.resolve(&registry, "gps").unwrap().as_deref(),
            Some("converter-m2mp")
        );
        assert_eq!(router.cached(), 1);

        registry
            .add_channel_rule(Some(&dev.id), rule(1, "^gps$", "tracker"))
            .unwrap();
        assert_eq!(
            router.resolve(&registry, "gps").unwrap().as_deref(),
            Some("tracker")
        );
    }
}

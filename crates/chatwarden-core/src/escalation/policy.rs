//! The escalation ladder.
//!
//! Zero-tolerance categories ban outright. Otherwise a user with no recent
//! history gets the category's first-offense treatment, and each repeat
//! climbs the ladder by one rung per timeout already issued in the window.
//! A repeat timeout is always strictly longer than the previous one; when
//! the ladder has no longer rung left, the answer is a ban.

use chatwarden_types::Category;
use chatwarden_types::config::{CategoryPolicy, EscalationConfig, FirstOffense};
use chatwarden_types::event::Action;

use super::{Severity, ViolationEvent, ViolationRecord};

#[derive(Debug, Clone)]
pub struct EscalationPolicy {
    config: EscalationConfig,
}

impl EscalationPolicy {
    pub fn new(config: EscalationConfig) -> Self {
        Self { config }
    }

    pub fn window(&self) -> chrono::Duration {
        self.config.window()
    }

    pub fn category(&self, category: Category) -> CategoryPolicy {
        self.config.policy_for(category)
    }

    /// The ladder for one category, with rungs below its base timeout
    /// raised to it.
    pub fn ladder_for(&self, policy: &CategoryPolicy) -> Vec<u64> {
        self.config
            .ladder_secs
            .iter()
            .map(|&secs| secs.max(policy.base_timeout_secs))
            .collect()
    }

    /// Decide the action for `event`. `recent` must hold only the user's
    /// records inside the window, oldest first. `None` means leniency.
    pub fn decide(&self, event: &ViolationEvent, recent: &[ViolationRecord]) -> Option<Action> {
        let policy = self.category(event.category);
        if policy.zero_tolerance {
            return Some(Action::Ban);
        }

        let start = usize::from(policy.severe || event.severity == Severity::Severe);
        let ladder = self.ladder_for(&policy);

        if recent.is_empty() {
            return match policy.first_offense {
                FirstOffense::Ignore => None,
                FirstOffense::Warn => Some(Action::Warn),
                FirstOffense::Timeout => Some(climb(&ladder, start, 0)),
            };
        }

        if recent.iter().any(|r| r.action_taken == Some(Action::Ban)) {
            return Some(Action::Ban);
        }

        let timeouts: Vec<u64> = recent
            .iter()
            .filter_map(|r| match r.action_taken {
                Some(Action::Timeout { seconds }) => Some(seconds),
                _ => None,
            })
            .collect();
        let longest = timeouts.iter().copied().max().unwrap_or(0);
        Some(climb(&ladder, start + timeouts.len(), longest))
    }
}

/// First rung at or past `from` that is longer than `longer_than`; a ban
/// when none is.
fn climb(ladder: &[u64], from: usize, longer_than: u64) -> Action {
    ladder
        .iter()
        .skip(from)
        .find(|&&secs| secs > longer_than)
        .map_or(Action::Ban, |&seconds| Action::Timeout { seconds })
}

/// Chat note explaining an action.
pub fn note_for(action: &Action, category: Category, rationale: &str) -> String {
    let head = match action {
        Action::Warn => format!("warning for {category}"),
        Action::Timeout { seconds } => format!("timed out for {seconds}s ({category})"),
        Action::Ban => format!("banned ({category})"),
    };
    let rationale = rationale.trim();
    if rationale.is_empty() {
        head
    } else {
        format!("{head}: {rationale}")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chatwarden_types::config::CategoryOverride;
    use chrono::{Duration, Utc};

    use super::*;

    fn event(category: Category) -> ViolationEvent {
        ViolationEvent {
            user: "alice".into(),
            category,
            severity: Severity::Normal,
            message_id: "m1".into(),
            rationale: "insult".into(),
            observed_at: Utc::now(),
        }
    }

    fn record(action: Option<Action>) -> ViolationRecord {
        ViolationRecord {
            user: "alice".into(),
            category: Category::Harassment,
            timestamp: Utc::now() - Duration::days(1),
            action_taken: action,
        }
    }

    fn timeout(seconds: u64) -> Option<Action> {
        Some(Action::Timeout { seconds })
    }

    fn policy() -> EscalationPolicy {
        EscalationPolicy::new(EscalationConfig::default())
    }

    #[test]
    fn first_offense_is_shortest_timeout() {
        assert_eq!(policy().decide(&event(Category::Harassment), &[]), timeout(30));
    }

    #[test]
    fn repeats_climb_then_ban() {
        let p = policy();
        let e = event(Category::Harassment);
        assert_eq!(p.decide(&e, &[record(timeout(30))]), timeout(1800));
        assert_eq!(
            p.decide(&e, &[record(timeout(30)), record(timeout(1800))]),
            timeout(3600)
        );
        assert_eq!(
            p.decide(
                &e,
                &[record(timeout(30)), record(timeout(1800)), record(timeout(3600))]
            ),
            Some(Action::Ban)
        );
    }

    #[test]
    fn zero_tolerance_bans_without_history() {
        for cat in [
            Category::ChildSexualization,
            Category::Doxxing,
            Category::Swatting,
            Category::ExtremeHate,
            Category::SexualViolence,
        ] {
            assert_eq!(policy().decide(&event(cat), &[]), Some(Action::Ban), "{cat}");
        }
    }

    #[test]
    fn severe_category_starts_higher() {
        assert_eq!(policy().decide(&event(Category::HateSpeech), &[]), timeout(1800));
        let mut e = event(Category::Spam);
        e.severity = Severity::Severe;
        assert_eq!(policy().decide(&e, &[]), timeout(1800));
    }

    #[test]
    fn base_timeout_is_a_floor_and_repeats_stay_strictly_longer() {
        let mut cfg = EscalationConfig::default();
        cfg.categories = BTreeMap::from([(
            Category::Spam,
            CategoryOverride {
                base_timeout_secs: Some(600),
                ..Default::default()
            },
        )]);
        let p = EscalationPolicy::new(cfg);
        let e = event(Category::Spam);
        assert_eq!(p.decide(&e, &[]), timeout(600));
        assert_eq!(p.decide(&e, &[record(timeout(600))]), timeout(1800));
        // A 3600s timeout from another category leaves no longer rung.
        assert_eq!(
            p.decide(&e, &[record(timeout(3600))]),
            Some(Action::Ban)
        );
    }

    #[test]
    fn leniency_and_warn_first_offense() {
        let mut cfg = EscalationConfig::default();
        cfg.categories.insert(
            Category::Spam,
            CategoryOverride {
                first_offense: Some(FirstOffense::Ignore),
                ..Default::default()
            },
        );
        cfg.categories.insert(
            Category::SexualContent,
            CategoryOverride {
                first_offense: Some(FirstOffense::Warn),
                ..Default::default()
            },
        );
        let p = EscalationPolicy::new(cfg);
        assert_eq!(p.decide(&event(Category::Spam), &[]), None);
        assert_eq!(p.decide(&event(Category::Spam), &[record(None)]), timeout(30));
        assert_eq!(
            p.decide(&event(Category::SexualContent), &[]),
            Some(Action::Warn)
        );
        assert_eq!(
            p.decide(&event(Category::SexualContent), &[record(Some(Action::Warn))]),
            timeout(30)
        );
    }

    #[test]
    fn prior_ban_stays_ban() {
        assert_eq!(
            policy().decide(&event(Category::Spam), &[record(Some(Action::Ban))]),
            Some(Action::Ban)
        );
    }

    #[test]
    fn notes() {
        assert_eq!(
            note_for(&Action::Timeout { seconds: 30 }, Category::Harassment, " insult "),
            "timed out for 30s (HARASSMENT): insult"
        );
        assert_eq!(note_for(&Action::Ban, Category::Doxxing, ""), "banned (DOXXING)");
    }
}

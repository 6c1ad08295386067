//! Inhibition Rules

use crate::alert::{Alert, Fingerprint, LabelSet};
use crate::config::InhibitRuleConfig;
use crate::matcher::{matches_all, Matcher};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone)]
struct InhibitRule {
    source_matchers: Vec<Matcher>,
    target_matchers: Vec<Matcher>,
    equal: Vec<String>,
    /// Firing source alerts, keyed by fingerprint
    sources: HashMap<Fingerprint, Alert>,
}

impl InhibitRule {
    fn equal_labels_match(&self, source: &LabelSet, target: &LabelSet) -> bool {
        self.equal.iter().all(|name| source.get(name) == target.get(name))
    }
}

/// Mutes target alerts while a related source alert is firing
#[derive(Debug, Clone, Default)]
pub struct Inhibitor {
    rules: Vec<InhibitRule>,
}

impl Inhibitor {
    pub fn new(configs: &[InhibitRuleConfig]) -> Self {
        Self {
            rules: configs
                .iter()
                .map(|c| InhibitRule {
                    source_matchers: c.source_matchers.clone(),
                    target_matchers: c.target_matchers.clone(),
                    equal: c.equal.clone(),
                    sources: HashMap::new(),
                })
                .collect(),
        }
    }

    /// Track an alert as a potential inhibition source
    pub fn observe(&mut self, alert: &Alert) {
        let fp = alert.fingerprint();
        for rule in &mut self.rules {
            if matches_all(&rule.source_matchers, &alert.labels) {
                rule.sources.insert(fp, alert.clone());
            }
        }
    }

    /// Whether `labels` is muted by any firing source alert as of `now`
    pub fn is_inhibited(&self, labels: &LabelSet, now: DateTime<Utc>) -> bool {
        let fp = Fingerprint::from_labels(labels);
        for rule in &self.rules {
            if !matches_all(&rule.target_matchers, labels) {
                continue;
            }
            let inhibited = rule.sources.iter().any(|(source_fp, source)| {
                *source_fp != fp
                    && !source.resolved_at(now)
                    && rule.equal_labels_match(&source.labels, labels)
            });
            if inhibited {
                debug!("Alert {} inhibited", fp);
                return true;
            }
        }
        false
    }

    /// Forget resolved source alerts
    pub fn gc(&mut self, now: DateTime<Utc>) {
        for rule in &mut self.rules {
            rule.sources.retain(|_, a| !a.resolved_at(now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn labels(pairs: &[(&str, &str)]) -> LabelSet {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn firing(pairs: &[(&str, &str)], now: DateTime<Utc>) -> Alert {
        Alert {
            labels: labels(pairs),
            annotations: LabelSet::new(),
            starts_at: now - Duration::minutes(1),
            ends_at: now + Duration::minutes(5),
            generator_url: String::new(),
            updated_at: now,
            timeout: true,
        }
    }

    fn inhibitor() -> Inhibitor {
        Inhibitor::new(&[InhibitRuleConfig {
            source_matchers: vec!["severity=critical".parse().unwrap()],
            target_matchers: vec!["severity=warning".parse().unwrap()],
            equal: vec!["cluster".to_string()],
        }])
    }

    #[test]
    fn test_inhibits_on_equal_labels() {
        let now = Utc::now();
        let mut inh = inhibitor();
        let source = [("alertname", "NodeDown"), ("severity", "critical"), ("cluster", "eu")];
        inh.observe(&firing(&source, now));

        let target = |severity: &str, cluster: &str| {
            labels(&[("alertname", "HighLoad"), ("severity", severity), ("cluster", cluster)])
        };
        assert!(inh.is_inhibited(&target("warning", "eu"), now));
        assert!(!inh.is_inhibited(&target("warning", "us"), now));
        assert!(!inh.is_inhibited(&target("info", "eu"), now));
    }

    #[test]
    fn test_resolved_source_does_not_inhibit() {
        let now = Utc::now();
        let mut inh = inhibitor();
        let mut source = firing(&[("severity", "critical"), ("cluster", "eu")], now);
        source.ends_at = now - Duration::seconds(1);
        inh.observe(&source);

        let target = labels(&[("severity", "warning"), ("cluster", "eu")]);
        assert!(!inh.is_inhibited(&target, now));

        inh.gc(now);
        assert!(inh.rules[0].sources.is_empty());
    }

    #[test]
    fn test_alert_never_inhibits_itself() {
        let now = Utc::now();
        let mut inh = Inhibitor::new(&[InhibitRuleConfig {
            source_matchers: vec!["alertname=A".parse().unwrap()],
            target_matchers: vec!["alertname=A".parse().unwrap()],
            equal: vec![],
        }]);
        let a = firing(&[("alertname", "A")], now);
        inh.observe(&a);
        assert!(!inh.is_inhibited(&a.labels, now));
    }
}

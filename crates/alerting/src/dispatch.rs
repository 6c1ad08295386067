//! Dispatcher
//!
//! Background loop of an engine instance: consumes the provider's
//! subscription, routes alerts into aggregation groups and flushes groups to
//! their receivers on the route's timers. On shutdown every pending group is
//! flushed once before the loop exits.

use crate::alert::{Alert, Fingerprint, LabelSet};
use crate::inhibit::Inhibitor;
use crate::nflog::{NotificationEntry, NotificationLog, NFLOG_RETENTION};
use crate::provider::{AlertProvider, MemAlertProvider};
use crate::receiver::Receiver;
use crate::route::Route;
use crate::silence::Silences;
use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Resolution of the group flush timers
pub const FLUSH_TICK: Duration = Duration::from_secs(1);
/// How often resolved alerts are garbage collected
pub const GC_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Alerts sharing a route and group labels
#[derive(Debug)]
struct AggrGroup {
    key: String,
    receiver: String,
    group_interval: Duration,
    repeat_interval: Duration,
    alerts: HashMap<Fingerprint, Alert>,
    next_flush: Instant,
}

fn group_key(route: &Route, labels: &LabelSet) -> String {
    let rendered: Vec<String> = labels.iter().map(|(k, v)| format!("{}={:?}", k, v)).collect();
    format!("{}:{{{}}}", route.id, rendered.join(","))
}

pub struct Dispatcher {
    route: Arc<Route>,
    receivers: Arc<HashMap<String, Receiver>>,
    inhibitor: Inhibitor,
    silences: Arc<RwLock<Silences>>,
    nflog: Arc<Mutex<NotificationLog>>,
    provider: Arc<MemAlertProvider>,
    groups: HashMap<String, AggrGroup>,
    /// How long a notification log entry outlives its last delivery
    nflog_retention: chrono::Duration,
}

/// Keep log entries at least twice the longest repeat interval, so a live
/// group always finds its entry.
fn nflog_retention(route: &Route) -> chrono::Duration {
    let mut longest = Duration::ZERO;
    route.walk(&mut |r| longest = longest.max(r.repeat_interval));
    chrono::Duration::from_std(longest.saturating_mul(2))
        .map(|d| d.max(NFLOG_RETENTION))
        .unwrap_or(chrono::Duration::MAX)
}

impl Dispatcher {
    pub fn new(
        route: Arc<Route>,
        receivers: Arc<HashMap<String, Receiver>>,
        inhibitor: Inhibitor,
        silences: Arc<RwLock<Silences>>,
        nflog: Arc<Mutex<NotificationLog>>,
        provider: Arc<MemAlertProvider>,
    ) -> Self {
        Self {
            nflog_retention: nflog_retention(&route),
            route,
            receivers,
            inhibitor,
            silences,
            nflog,
            provider,
            groups: HashMap::new(),
        }
    }

    /// Run until `shutdown` flips to true or the provider goes away
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut alerts = self.provider.subscribe();
        let mut tick = interval(FLUSH_TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut gc = interval(GC_INTERVAL);
        gc.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Dispatcher started");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                next = alerts.next() => match next {
                    Some(alert) => self.process(alert),
                    None => break,
                },
                _ = tick.tick() => self.flush_due(Instant::now()).await,
                _ = gc.tick() => self.gc(),
            }
        }

        // Drain updates accepted before shutdown, then flush everything.
        while let Some(alert) = alerts.try_next() {
            self.process(alert);
        }
        self.flush_all().await;
        info!("Dispatcher stopped");
    }

    fn process(&mut self, alert: Alert) {
        self.inhibitor.observe(&alert);

        let now = Instant::now();
        let fp = alert.fingerprint();
        for route in self.route.match_labels(&alert.labels) {
            let key = group_key(route, &route.group_labels(&alert.labels));
            let group = self.groups.entry(key.clone()).or_insert_with(|| {
                debug!("New aggregation group {}", key);
                AggrGroup {
                    key,
                    receiver: route.receiver.clone(),
                    group_interval: route.group_interval,
                    repeat_interval: route.repeat_interval,
                    alerts: HashMap::new(),
                    next_flush: now + route.group_wait,
                }
            });
            group.alerts.insert(fp, alert.clone());
        }
    }

    async fn flush_due(&mut self, now: Instant) {
        let due: Vec<String> = self
            .groups
            .values()
            .filter(|g| g.next_flush <= now && !g.alerts.is_empty())
            .map(|g| g.key.clone())
            .collect();

        for key in due {
            self.flush_group(&key).await;
            if let Some(group) = self.groups.get_mut(&key) {
                group.next_flush = now + group.group_interval;
            }
        }
    }

    async fn flush_all(&mut self) {
        let keys: Vec<String> = self
            .groups
            .values()
            .filter(|g| !g.alerts.is_empty())
            .map(|g| g.key.clone())
            .collect();
        for key in keys {
            self.flush_group(&key).await;
        }
    }

    async fn flush_group(&mut self, key: &str) {
        let now = Utc::now();
        let Some(group) = self.groups.get(key) else {
            return;
        };

        let to_send: Vec<Alert> = {
            let silences = match self.silences.read() {
                Ok(s) => s,
                Err(e) => {
                    error!("Silences lock poisoned: {}", e);
                    return;
                }
            };
            group
                .alerts
                .values()
                .filter(|a| !silences.is_silenced(&a.labels, now))
                .filter(|a| !self.inhibitor.is_inhibited(&a.labels, now))
                .cloned()
                .collect()
        };

        let (resolved, firing): (Vec<&Alert>, Vec<&Alert>) =
            to_send.iter().partition(|a| a.resolved_at(now));
        let firing: BTreeSet<Fingerprint> = firing.iter().map(|a| a.fingerprint()).collect();
        let resolved: BTreeSet<Fingerprint> = resolved.iter().map(|a| a.fingerprint()).collect();

        let repeat =
            chrono::Duration::from_std(group.repeat_interval).unwrap_or(chrono::Duration::MAX);
        let needs_update = match self.nflog.lock() {
            Ok(log) => log.needs_update(&group.receiver, key, &firing, &resolved, repeat, now),
            Err(e) => {
                error!("Notification log lock poisoned: {}", e);
                false
            }
        };

        // Resolved alerts stay in the group until a delivery succeeds.
        let mut done = true;
        if needs_update {
            match self.receivers.get(&group.receiver) {
                Some(receiver) => {
                    let failures = receiver.notify(&to_send, now).await;
                    done = failures == 0;
                    if done {
                        if let Ok(mut log) = self.nflog.lock() {
                            log.record(NotificationEntry {
                                receiver: group.receiver.clone(),
                                group_key: key.to_string(),
                                firing,
                                resolved,
                                notified_at: now,
                            });
                        }
                    }
                }
                None => warn!("Group {} routes to unknown receiver {}", key, group.receiver),
            }
        }

        if !done {
            debug!("Group {} keeps its resolved alerts for retry", key);
            return;
        }
        if let Some(group) = self.groups.get_mut(key) {
            group.alerts.retain(|_, a| !a.resolved_at(now));
        }
    }

    fn gc(&mut self) {
        let now = Utc::now();
        let removed = self.provider.gc(now);
        self.inhibitor.gc(now);
        if let Ok(mut silences) = self.silences.write() {
            silences.gc(now);
        }
        if let Ok(mut log) = self.nflog.lock() {
            log.gc(now, self.nflog_retention);
        }
        self.groups.retain(|_, g| !g.alerts.is_empty());
        if removed > 0 {
            debug!("Garbage collected {} resolved alerts", removed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UserConfig;
    use crate::receiver::{Integration, Notifier, NotifyError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct Recording {
        sent: Mutex<Vec<Vec<String>>>,
        failing: AtomicBool,
    }

    #[async_trait]
    impl Notifier for Recording {
        async fn notify(&self, alerts: &[Alert]) -> Result<(), NotifyError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(NotifyError::Delivery("endpoint down".to_string()));
            }
            let mut names: Vec<String> = alerts.iter().map(|a| a.name().to_string()).collect();
            names.sort();
            self.sent.lock().unwrap().push(names);
            Ok(())
        }
    }

    fn alert(name: &str, team: &str) -> Alert {
        let now = Utc::now();
        let mut labels = LabelSet::new();
        labels.insert("alertname".into(), name.into());
        labels.insert("team".into(), team.into());
        Alert {
            labels,
            annotations: LabelSet::new(),
            starts_at: now,
            ends_at: now + chrono::Duration::minutes(5),
            generator_url: String::new(),
            updated_at: now,
            timeout: true,
        }
    }

    struct Harness {
        provider: Arc<MemAlertProvider>,
        silences: Arc<RwLock<Silences>>,
        nflog: Arc<Mutex<NotificationLog>>,
        recording: Arc<Recording>,
        dispatcher: Dispatcher,
    }

    fn harness(raw: &str) -> Harness {
        let config = UserConfig::parse(raw).unwrap();
        let am = &config.alertmanager_config;
        let recording = Arc::new(Recording::default());
        let receivers: HashMap<String, Receiver> = am
            .receivers
            .iter()
            .map(|r| {
                let integration = Integration::new("test", "rec", true, recording.clone());
                let receiver = Receiver {
                    name: r.name.clone(),
                    integrations: vec![integration],
                };
                (r.name.clone(), receiver)
            })
            .collect();

        let provider = Arc::new(MemAlertProvider::new());
        let silences = Arc::new(RwLock::new(Silences::new()));
        let nflog = Arc::new(Mutex::new(NotificationLog::new()));
        let dispatcher = Dispatcher::new(
            Arc::new(Route::compile(&am.route)),
            Arc::new(receivers),
            Inhibitor::new(&am.inhibit_rules),
            silences.clone(),
            nflog.clone(),
            provider.clone(),
        );
        Harness {
            provider,
            silences,
            nflog,
            recording,
            dispatcher,
        }
    }

    fn sent(h: &Harness) -> Vec<Vec<String>> {
        let mut sent = h.recording.sent.lock().unwrap().clone();
        sent.sort();
        sent
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    const GROUPED: &str = r#"{"alertmanager_config": {
        "route": {
            "receiver": "ops",
            "group_by": ["team"],
            "group_wait": "10s",
            "group_interval": "1m"
        },
        "receivers": [{ "name": "ops" }],
        "inhibit_rules": [{
            "source_matchers": ["alertname=Outage"],
            "target_matchers": ["alertname!=Outage"],
            "equal": ["team"]
        }]
    }}"#;

    #[tokio::test(start_paused = true)]
    async fn test_group_wait_then_flush() {
        let mut h = harness(GROUPED);
        h.dispatcher.process(alert("A", "db"));
        h.dispatcher.process(alert("B", "db"));
        h.dispatcher.process(alert("C", "web"));

        h.dispatcher.flush_due(Instant::now()).await;
        assert!(sent(&h).is_empty());

        h.dispatcher.flush_due(Instant::now() + Duration::from_secs(10)).await;
        assert_eq!(sent(&h), vec![names(&["A", "B"]), names(&["C"])]);
        assert_eq!(h.nflog.lock().unwrap().sent(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_group_not_resent() {
        let mut h = harness(GROUPED);
        h.dispatcher.process(alert("A", "db"));
        let later = Instant::now() + Duration::from_secs(10);
        h.dispatcher.flush_due(later).await;
        h.dispatcher.flush_due(later + Duration::from_secs(60)).await;
        assert_eq!(sent(&h).len(), 1);

        h.dispatcher.process(alert("B", "db"));
        h.dispatcher.flush_due(later + Duration::from_secs(120)).await;
        assert_eq!(sent(&h).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silenced_and_inhibited_are_dropped() {
        let mut h = harness(GROUPED);
        let now = Utc::now();
        h.silences
            .write()
            .unwrap()
            .add(
                vec!["alertname=Muted".parse().unwrap()],
                now - chrono::Duration::minutes(1),
                now + chrono::Duration::hours(1),
                "",
                "",
            )
            .unwrap();

        h.dispatcher.process(alert("Outage", "db"));
        h.dispatcher.process(alert("Slow", "db"));
        h.dispatcher.process(alert("Muted", "web"));
        h.dispatcher.process(alert("Fine", "web"));
        h.dispatcher.flush_all().await;

        assert_eq!(sent(&h), vec![names(&["Fine"]), names(&["Outage"])]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolved_alert_kept_until_delivered() {
        let mut h = harness(GROUPED);
        h.dispatcher.process(alert("A", "db"));
        h.dispatcher.flush_all().await;
        assert_eq!(sent(&h).len(), 1);

        let mut resolved = alert("A", "db");
        resolved.ends_at = Utc::now() - chrono::Duration::minutes(1);
        h.dispatcher.process(resolved);

        h.recording.failing.store(true, Ordering::SeqCst);
        h.dispatcher.flush_all().await;
        assert_eq!(sent(&h).len(), 1);
        assert_eq!(h.dispatcher.groups.values().map(|g| g.alerts.len()).sum::<usize>(), 1);

        h.recording.failing.store(false, Ordering::SeqCst);
        h.dispatcher.flush_all().await;
        assert_eq!(sent(&h).len(), 2);
        assert!(h.dispatcher.groups.values().all(|g| g.alerts.is_empty()));
    }

    #[tokio::test]
    async fn test_gc_prunes_stale_notification_log() {
        let mut h = harness(GROUPED);
        let now = Utc::now();
        let entry = |group_key: &str, notified_at| NotificationEntry {
            receiver: "ops".to_string(),
            group_key: group_key.to_string(),
            firing: BTreeSet::new(),
            resolved: BTreeSet::new(),
            notified_at,
        };
        {
            let mut log = h.nflog.lock().unwrap();
            log.record(entry("stale", now - NFLOG_RETENTION - chrono::Duration::hours(1)));
            log.record(entry("fresh", now - chrono::Duration::hours(1)));
        }

        h.dispatcher.gc();

        let log = h.nflog.lock().unwrap();
        assert!(log.get("ops", "stale").is_none());
        assert!(log.get("ops", "fresh").is_some());
    }

    #[tokio::test]
    async fn test_shutdown_flushes_pending_groups() {
        let h = harness(GROUPED);
        let (tx, rx) = watch::channel(false);
        let provider = h.provider.clone();
        let recording = h.recording.clone();
        let handle = tokio::spawn(h.dispatcher.run(rx));

        provider.put(vec![alert("A", "db")]).unwrap();
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(*recording.sent.lock().unwrap(), vec![names(&["A"])]);
    }

    #[tokio::test]
    async fn test_batch_larger_than_subscriber_buffer_is_delivered() {
        let h = harness(GROUPED);
        let (tx, rx) = watch::channel(false);
        let provider = h.provider.clone();
        let recording = h.recording.clone();
        let handle = tokio::spawn(h.dispatcher.run(rx));
        // Let the dispatcher subscribe before the batch arrives.
        tokio::task::yield_now().await;

        let batch: Vec<Alert> = (0..1500).map(|i| alert(&format!("A{}", i), "db")).collect();
        provider.put(batch).unwrap();
        tx.send(true).unwrap();
        handle.await.unwrap();

        let delivered: std::collections::HashSet<String> =
            recording.sent.lock().unwrap().iter().flatten().cloned().collect();
        assert_eq!(delivered.len(), 1500);
    }
}

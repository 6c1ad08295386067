//! Routing Tree

use crate::alert::LabelSet;
use crate::config::{
    RouteConfig, DEFAULT_GROUP_INTERVAL, DEFAULT_GROUP_WAIT, DEFAULT_REPEAT_INTERVAL,
};
use crate::matcher::{matches_all, Matcher};
use std::time::Duration;

/// `group_by` value that groups by every label
pub const GROUP_BY_ALL: &str = "...";

/// Compiled route node with inherited settings resolved
#[derive(Debug, Clone)]
pub struct Route {
    /// Stable path identifier, e.g. `root/0/1`
    pub id: String,
    pub receiver: String,
    pub group_by: Vec<String>,
    pub group_by_all: bool,
    pub matchers: Vec<Matcher>,
    pub continue_matching: bool,
    pub group_wait: Duration,
    pub group_interval: Duration,
    pub repeat_interval: Duration,
    pub routes: Vec<Route>,
}

impl Route {
    /// Compile the root route. Validation guarantees the root receiver is set.
    pub fn compile(config: &RouteConfig) -> Route {
        let defaults = Route {
            id: String::new(),
            receiver: String::new(),
            group_by: Vec::new(),
            group_by_all: false,
            matchers: Vec::new(),
            continue_matching: false,
            group_wait: DEFAULT_GROUP_WAIT,
            group_interval: DEFAULT_GROUP_INTERVAL,
            repeat_interval: DEFAULT_REPEAT_INTERVAL,
            routes: Vec::new(),
        };
        Self::compile_node(config, &defaults, "root".to_string())
    }

    fn compile_node(config: &RouteConfig, parent: &Route, id: String) -> Route {
        let (group_by, group_by_all) = match &config.group_by {
            Some(labels) => {
                let all = labels.iter().any(|l| l == GROUP_BY_ALL);
                (labels.iter().filter(|l| *l != GROUP_BY_ALL).cloned().collect(), all)
            }
            None => (parent.group_by.clone(), parent.group_by_all),
        };

        let mut node = Route {
            receiver: config.receiver.clone().unwrap_or_else(|| parent.receiver.clone()),
            group_by,
            group_by_all,
            matchers: config.matchers.clone(),
            continue_matching: config.continue_matching,
            group_wait: config.group_wait.unwrap_or(parent.group_wait),
            group_interval: config.group_interval.unwrap_or(parent.group_interval),
            repeat_interval: config.repeat_interval.unwrap_or(parent.repeat_interval),
            routes: Vec::new(),
            id,
        };
        node.routes = config
            .routes
            .iter()
            .enumerate()
            .map(|(i, child)| Self::compile_node(child, &node, format!("{}/{}", node.id, i)))
            .collect();
        node
    }

    /// Routes an alert with `labels` is delivered through.
    ///
    /// Depth-first; the first matching child ends the search unless it has
    /// `continue` set. A node none of whose children match handles the alert
    /// itself.
    pub fn match_labels(&self, labels: &LabelSet) -> Vec<&Route> {
        if !matches_all(&self.matchers, labels) {
            return Vec::new();
        }

        let mut all = Vec::new();
        for child in &self.routes {
            let matched = child.match_labels(labels);
            let hit = !matched.is_empty();
            all.extend(matched);
            if hit && !child.continue_matching {
                break;
            }
        }

        if all.is_empty() {
            all.push(self);
        }
        all
    }

    /// Labels that identify the aggregation group of `labels` on this route
    pub fn group_labels(&self, labels: &LabelSet) -> LabelSet {
        if self.group_by_all {
            return labels.clone();
        }
        self.group_by
            .iter()
            .filter_map(|name| labels.get(name).map(|v| (name.clone(), v.clone())))
            .collect()
    }

    /// Visit every node of the tree
    pub fn walk<'a>(&'a self, f: &mut impl FnMut(&'a Route)) {
        f(self);
        for child in &self.routes {
            child.walk(f);
        }
    }
}

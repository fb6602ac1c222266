//! Service-domain partitioner.
//!
//! Services that share a metric, an affinity edge, or an application
//! cannot be planned apart: moving one changes the constraints of the
//! other. Connected components of that relation are service domains,
//! each planned independently. A domain is named after its
//! lexicographically smallest service.

use std::collections::{BTreeMap, BTreeSet};

use keel_core::{ApplicationName, MetricName, ServiceName};
use serde::Serialize;

use crate::cluster::ClusterState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceDomain {
    pub id: String,
    pub services: Vec<ServiceName>,
    pub applications: Vec<ApplicationName>,
    pub metrics: Vec<MetricName>,
}

struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    fn new(size: usize) -> Self {
        Self {
            parent: (0..size).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    /// Keeps the smaller index as root so roots follow name order.
    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            let (root, child) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[child] = root;
        }
    }
}

pub fn partition_domains(state: &ClusterState) -> Vec<ServiceDomain> {
    let names: Vec<&ServiceName> = state.services.keys().collect();
    let index: BTreeMap<&str, usize> = names.iter().enumerate().map(|(i, n)| (n.as_str(), i)).collect();
    let mut sets = DisjointSet::new(names.len());

    let mut metric_owner: BTreeMap<&str, usize> = BTreeMap::new();
    let mut app_owner: BTreeMap<&str, usize> = BTreeMap::new();
    for (i, service) in state.services.values().enumerate() {
        for metric in &service.metrics {
            match metric_owner.get(metric.name.as_str()) {
                Some(&owner) => sets.union(owner, i),
                None => {
                    metric_owner.insert(metric.name.as_str(), i);
                }
            }
        }
        if let Some(app) = service.application.as_deref() {
            match app_owner.get(app) {
                Some(&owner) => sets.union(owner, i),
                None => {
                    app_owner.insert(app, i);
                }
            }
        }
        if let Some(affinity) = &service.affinity
            && let Some(&parent) = index.get(affinity.parent.as_str())
        {
            sets.union(parent, i);
        }
    }

    let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for i in 0..names.len() {
        let root = sets.find(i);
        groups.entry(root).or_default().push(i);
    }

    groups
        .into_values()
        .map(|members| {
            let mut applications = BTreeSet::new();
            let mut metrics = BTreeSet::new();
            for &i in &members {
                let service = &state.services[names[i]];
                metrics.extend(service.metrics.iter().map(|m| m.name.clone()));
                if let Some(app) = &service.application {
                    applications.insert(app.clone());
                }
            }
            for app in &applications {
                if let Some(desc) = state.applications.get(app) {
                    metrics.extend(desc.capacities.iter().map(|c| c.metric.clone()));
                }
            }
            ServiceDomain {
                id: names[members[0]].clone(),
                services: members.iter().map(|&i| names[i].clone()).collect(),
                applications: applications.into_iter().collect(),
                metrics: metrics.into_iter().collect(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use keel_core::{AffinityKind, ServiceDescription, ServiceMetric};

    use super::*;

    fn make_state(services: Vec<ServiceDescription>) -> ClusterState {
        let mut state = ClusterState::default();
        for service in services {
            state.services.insert(service.name.clone(), service);
        }
        state
    }

    #[test]
    fn shared_metric_joins_services() {
        let state = make_state(vec![
            ServiceDescription::stateful("a", "T", 1).with_metric(ServiceMetric::new("Cpu", 1, 1)),
            ServiceDescription::stateful("b", "T", 1).with_metric(ServiceMetric::new("Cpu", 1, 1)),
            ServiceDescription::stateful("c", "T", 1).with_metric(ServiceMetric::new("Disk", 1, 1)),
        ]);
        let domains = partition_domains(&state);
        assert_eq!(domains.len(), 2);
        assert_eq!(domains[0].id, "a");
        assert_eq!(domains[0].services, vec!["a", "b"]);
        assert_eq!(domains[1].metrics, vec!["Disk"]);
    }

    #[test]
    fn affinity_and_application_join_services() {
        let state = make_state(vec![
            ServiceDescription::stateful("child", "T", 1).with_affinity("parent", AffinityKind::Aligned),
            ServiceDescription::stateful("parent", "T", 1),
            ServiceDescription::stateful("x", "T", 1).with_application("app"),
            ServiceDescription::stateful("y", "T", 1).with_application("app"),
            ServiceDescription::stateful("z", "T", 1),
        ]);
        let domains = partition_domains(&state);
        let ids: Vec<&str> = domains.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["child", "x", "z"]);
        assert_eq!(domains[1].applications, vec!["app"]);
    }
}

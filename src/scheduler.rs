//! The pure host-selection function (§4.6).
//!
//! Kept free of any transport or process-spawn concern so it can be
//! unit-tested without starting a single daemon — the same separation the
//! teacher draws between its scheduler and its worker-spawning code.

use std::collections::HashMap;

use crate::descriptor::{Host, ModuleDescriptor};

/// Round-robin cursor over the catalog group, advanced by every scheduling
/// decision (§4.6 side effect).
pub struct Scheduler {
    next_assigned_catalog: i32,
    catalog_group_size: i32,
}

impl Scheduler {
    pub fn new(catalog_group_size: i32) -> Self {
        assert!(catalog_group_size > 0, "catalog group must be non-empty");
        Scheduler {
            next_assigned_catalog: 0,
            catalog_group_size,
        }
    }

    /// Chooses hosts for `descriptor` and assigns it a catalog rank.
    ///
    /// Returns `host name -> instance count`; empty when no host satisfies
    /// `descriptor.demands` (the caller translates that into a process-spawn
    /// error, per §7).
    pub fn choose_hosts(
        &mut self,
        cluster: &[Host],
        descriptor: &mut ModuleDescriptor,
    ) -> HashMap<String, i64> {
        let eligible: Vec<&Host> = cluster
            .iter()
            .filter(|h| descriptor.demands.is_subset(&h.resources))
            .collect();

        let assignment = if eligible.is_empty() {
            HashMap::new()
        } else if descriptor.is_automatic_instances() {
            eligible.iter().map(|h| (h.name.clone(), 1)).collect()
        } else {
            distribute_round_robin(descriptor.instances, &eligible)
        };

        if !assignment.is_empty() {
            descriptor.assigned_catalog_rank = Some(self.next_assigned_catalog);
            self.next_assigned_catalog = (self.next_assigned_catalog + 1) % self.catalog_group_size;
        }
        assignment
    }
}

/// Distributes `count` instances round-robin over `hosts` in enumeration
/// order, returning only hosts that received at least one instance.
fn distribute_round_robin(count: i64, hosts: &[&Host]) -> HashMap<String, i64> {
    let mut result: HashMap<String, i64> = HashMap::new();
    for i in 0..count {
        let host = hosts[(i as usize) % hosts.len()];
        *result.entry(host.name.clone()).or_insert(0) += 1;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(name: &str, resources: &[&str]) -> Host {
        Host {
            name: name.into(),
            is_database_server: false,
            resources: resources.iter().map(|s| s.to_string()).collect(),
            runtime_daemon_rank: 0,
            catalog_daemon_rank: None,
            ssh: None,
        }
    }

    fn descriptor(instances: i64, demands: &[&str]) -> ModuleDescriptor {
        ModuleDescriptor {
            name: "m".into(),
            library_file: "lib".into(),
            arguments: vec![],
            instances,
            inputs: vec![],
            output: None,
            demands: demands.iter().map(|s| s.to_string()).collect(),
            running_directory: "/tmp".into(),
            assigned_catalog_rank: None,
        }
    }

    #[test]
    fn automatic_instances_gets_one_per_eligible_host() {
        let cluster = vec![host("a", &["gpu"]), host("b", &[]), host("c", &["gpu"])];
        let mut d = descriptor(-1, &["gpu"]);
        let mut s = Scheduler::new(2);
        let result = s.choose_hosts(&cluster, &mut d);
        assert_eq!(result.len(), 2);
        assert_eq!(result.get("a"), Some(&1));
        assert_eq!(result.get("c"), Some(&1));
        assert!(!result.contains_key("b"));
    }

    #[test]
    fn explicit_instances_distribute_round_robin() {
        let cluster = vec![host("a", &[]), host("b", &[])];
        let mut d = descriptor(5, &[]);
        let mut s = Scheduler::new(1);
        let result = s.choose_hosts(&cluster, &mut d);
        assert_eq!(result.get("a"), Some(&3));
        assert_eq!(result.get("b"), Some(&2));
    }

    #[test]
    fn empty_eligible_set_yields_empty_assignment() {
        let cluster = vec![host("a", &[])];
        let mut d = descriptor(1, &["gpu"]);
        let mut s = Scheduler::new(1);
        assert!(s.choose_hosts(&cluster, &mut d).is_empty());
        assert!(d.assigned_catalog_rank.is_none());
    }

    #[test]
    fn catalog_rank_round_robins_and_only_advances_on_success() {
        let cluster = vec![host("a", &[])];
        let mut s = Scheduler::new(3);

        let mut d1 = descriptor(1, &[]);
        s.choose_hosts(&cluster, &mut d1);
        assert_eq!(d1.assigned_catalog_rank, Some(0));

        let mut failing = descriptor(1, &["missing"]);
        s.choose_hosts(&cluster, &mut failing);
        assert!(failing.assigned_catalog_rank.is_none());

        let mut d2 = descriptor(1, &[]);
        s.choose_hosts(&cluster, &mut d2);
        assert_eq!(d2.assigned_catalog_rank, Some(1));
    }
}

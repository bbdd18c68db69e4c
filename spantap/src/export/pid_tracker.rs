//! Bidirectional PID ↔ service bookkeeping. All three indices are updated
//! atomically under one guard held by the owner of the tracker.

use std::collections::{HashMap, HashSet};

use crate::span::{ServiceNameNamespace, ServiceUID};

#[derive(Default)]
pub struct PidServiceTracker {
    pid_to_service: HashMap<i32, ServiceUID>,
    service_pids: HashMap<ServiceUID, HashSet<i32>>,
    names: HashMap<ServiceNameNamespace, ServiceUID>,
}

impl PidServiceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a PID to a service. Re-binding to the same identity is a no-op;
    /// re-binding to a different one moves the PID.
    pub fn add_pid(&mut self, pid: i32, uid: ServiceUID) {
        if self.pid_to_service.get(&pid) == Some(&uid) {
            return;
        }
        self.detach(pid);
        self.pid_to_service.insert(pid, uid.clone());
        self.names.insert(uid.name_namespace(), uid.clone());
        self.service_pids.entry(uid).or_default().insert(pid);
    }

    /// Unbind a PID. Returns `(true, uid)` iff this removal emptied the
    /// service, which is the exporter's cue to close the service scope;
    /// otherwise `(false, default)`.
    pub fn remove_pid(&mut self, pid: i32) -> (bool, ServiceUID) {
        match self.detach(pid) {
            Some(uid) if !self.service_live(&uid) => (true, uid),
            _ => (false, ServiceUID::default()),
        }
    }

    pub fn service_live(&self, uid: &ServiceUID) -> bool {
        self.service_pids
            .get(uid)
            .is_some_and(|pids| !pids.is_empty())
    }

    pub fn is_tracking_server_service(&self, name_ns: &ServiceNameNamespace) -> bool {
        self.names.contains_key(name_ns)
    }

    pub fn service_for(&self, pid: i32) -> Option<ServiceUID> {
        self.pid_to_service.get(&pid).cloned()
    }

    /// Remove a PID from the forward and reverse indices. A service left
    /// with no PIDs disappears from `names` too, whether the detach came
    /// from an explicit removal or from a rebind: `names` holds an
    /// identity iff its service is live.
    fn detach(&mut self, pid: i32) -> Option<ServiceUID> {
        let uid = self.pid_to_service.remove(&pid)?;
        if let Some(pids) = self.service_pids.get_mut(&uid) {
            pids.remove(&pid);
            if pids.is_empty() {
                self.service_pids.remove(&uid);
                self.names.remove(&uid.name_namespace());
            }
        }
        Some(uid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uid(name: &str, ns: &str) -> ServiceUID {
        ServiceUID {
            name: name.into(),
            namespace: ns.into(),
            instance: String::new(),
        }
    }

    #[test]
    fn test_add_and_remove_pid() {
        let mut tracker = PidServiceTracker::new();
        let svc = uid("foo", "bar");

        tracker.add_pid(1234, svc.clone());
        assert_eq!(tracker.service_for(1234), Some(svc.clone()));
        assert!(tracker.service_live(&svc));
        assert!(tracker.is_tracking_server_service(&svc.name_namespace()));

        let (last, removed) = tracker.remove_pid(1234);
        assert!(last, "removing the only pid closes the service");
        assert_eq!(removed, svc);
        assert_eq!(tracker.service_for(1234), None);
        assert!(!tracker.service_live(&svc));
        assert!(!tracker.is_tracking_server_service(&svc.name_namespace()));
    }

    #[test]
    fn test_remove_not_last_pid() {
        let mut tracker = PidServiceTracker::new();
        let svc = uid("foo1", "bar1");
        tracker.add_pid(1, svc.clone());
        tracker.add_pid(2, svc.clone());

        let (last, removed) = tracker.remove_pid(1);
        assert!(!last);
        assert_eq!(removed, ServiceUID::default());
        assert_eq!(tracker.service_for(1), None);
        assert!(tracker.service_live(&svc));
        assert!(tracker.is_tracking_server_service(&svc.name_namespace()));
    }

    #[test]
    fn test_remove_last_of_two() {
        let mut tracker = PidServiceTracker::new();
        let svc = uid("foo", "bar");
        tracker.add_pid(1, svc.clone());
        tracker.add_pid(2, svc.clone());

        let (last, _) = tracker.remove_pid(1);
        assert!(!last);
        let (last, removed) = tracker.remove_pid(2);
        assert!(last);
        assert_eq!(removed, svc);
        assert!(!tracker.service_live(&svc));
        assert!(!tracker.is_tracking_server_service(&svc.name_namespace()));
    }

    #[test]
    fn test_duplicate_add_is_idempotent() {
        let mut tracker = PidServiceTracker::new();
        let svc = uid("foo", "bar");
        tracker.add_pid(42, svc.clone());
        tracker.add_pid(42, svc.clone());

        let (last, removed) = tracker.remove_pid(42);
        assert!(last);
        assert_eq!(removed, svc);
    }

    #[test]
    fn test_rebind_moves_pid_between_services() {
        let mut tracker = PidServiceTracker::new();
        let old = uid("old", "ns");
        let new = uid("new", "ns");
        tracker.add_pid(7, old.clone());
        tracker.add_pid(7, new.clone());

        assert!(!tracker.service_live(&old));
        assert!(tracker.service_live(&new));
        assert_eq!(tracker.service_for(7), Some(new.clone()));
        // The emptied identity must not linger in the name index.
        assert!(!tracker.is_tracking_server_service(&old.name_namespace()));
        assert!(tracker.is_tracking_server_service(&new.name_namespace()));
    }

    #[test]
    fn test_rebind_keeps_names_while_service_still_live() {
        let mut tracker = PidServiceTracker::new();
        let shared = uid("shared", "ns");
        let other = uid("other", "ns");
        tracker.add_pid(1, shared.clone());
        tracker.add_pid(2, shared.clone());
        tracker.add_pid(2, other.clone());

        // pid 1 still holds the old service up.
        assert!(tracker.service_live(&shared));
        assert!(tracker.is_tracking_server_service(&shared.name_namespace()));
        assert!(tracker.is_tracking_server_service(&other.name_namespace()));
    }

    #[test]
    fn test_remove_unknown_pid() {
        let mut tracker = PidServiceTracker::new();
        let (last, removed) = tracker.remove_pid(9999);
        assert!(!last);
        assert_eq!(removed, ServiceUID::default());
    }

    #[test]
    fn test_tracking_lookup_by_name_namespace() {
        let mut tracker = PidServiceTracker::new();
        tracker.add_pid(42, uid("foo", "bar"));
        assert!(tracker.is_tracking_server_service(&ServiceNameNamespace {
            name: "foo".into(),
            namespace: "bar".into(),
        }));
        assert!(!tracker.is_tracking_server_service(&ServiceNameNamespace {
            name: "other".into(),
            namespace: "bar".into(),
        }));
    }
}

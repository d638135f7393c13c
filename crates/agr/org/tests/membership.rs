use std::sync::{Arc, Barrier};
use std::thread;

use agr_org::{AccessPolicy, Credential, DenyAll, Organization, Overlooker, RoleObserver};
use agr_types::names::GROUP_MANAGER_ROLE;
use agr_types::{AgentAddress, AgentId, Cgr, KernelId, OrgError};
use parking_lot::Mutex;
use proptest::prelude::*;

fn org() -> Arc<Organization> {
    Arc::new(Organization::new(KernelId::generate()))
}

#[derive(Clone, Default)]
struct Members(Arc<Mutex<Vec<AgentId>>>);

impl RoleObserver for Members {
    fn on_join(&self, member: &AgentAddress) {
        self.0.lock().push(member.agent());
    }
    fn on_leave(&self, member: &AgentAddress) {
        self.0.lock().retain(|a| *a != member.agent());
    }
}

#[test]
fn concurrent_duplicate_requests_grant_the_role_once() {
    let org = org();
    org.create_group(AgentId::new(), "C", "G", false, None).unwrap();
    let agent = AgentId::new();

    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let org = org.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                org.request_role(agent, "C", "G", "worker", None)
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let granted = results.iter().filter(|r| r.is_ok()).count();
    let refused = results
        .iter()
        .filter(|r| matches!(r, Err(OrgError::RoleAlreadyHeld(_))))
        .count();
    assert_eq!(granted, 1);
    assert_eq!(refused, threads - 1);
    assert_eq!(org.agents_with_role("C", "G", "worker").len(), 1);
}

#[test]
fn concurrent_join_and_leave_never_leave_empty_roles() {
    let org = org();
    org.create_group(AgentId::new(), "C", "G", false, None).unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let org = org.clone();
            thread::spawn(move || {
                let agent = AgentId::new();
                for _ in 0..200 {
                    org.request_role(agent, "C", "G", "churn", None).unwrap();
                    org.leave_role(agent, "C", "G", "churn").unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(!org.is_role("C", "G", "churn"));
    assert_eq!(org.role_names("C", "G"), vec![GROUP_MANAGER_ROLE.to_string()]);
}

#[test]
fn last_leave_removes_role_before_returning() {
    let org = org();
    org.create_group(AgentId::new(), "C", "G", false, None).unwrap();
    let (a, b) = (AgentId::new(), AgentId::new());
    org.request_role(a, "C", "G", "r", None).unwrap();
    org.request_role(b, "C", "G", "r", None).unwrap();

    org.leave_role(a, "C", "G", "r").unwrap();
    assert!(org.is_role("C", "G", "r"));
    org.leave_role(b, "C", "G", "r").unwrap();
    assert!(!org.is_role("C", "G", "r"));
    assert_eq!(
        org.leave_role(b, "C", "G", "r"),
        Err(OrgError::RoleNotHeld("r".into()))
    );
}

#[test]
fn overlookers_before_and_after_join_agree() {
    let org = org();
    let cgr = Cgr::new("C", "G", "r");
    org.create_group(AgentId::new(), "C", "G", false, None).unwrap();

    let early_log = Members::default();
    let early = Overlooker::new(cgr.clone(), early_log.clone());
    org.add_overlooker(early.clone());
    assert!(!early.is_attached());

    let a = AgentId::new();
    org.request_role(a, "C", "G", "r", None).unwrap();

    let late_log = Members::default();
    let late = Overlooker::new(cgr, late_log.clone());
    org.add_overlooker(late.clone());

    assert_eq!(*early_log.0.lock(), vec![a]);
    assert_eq!(*late_log.0.lock(), vec![a]);
    assert_eq!(early.current().to_vec(), late.current().to_vec());

    org.leave_role(a, "C", "G", "r").unwrap();
    assert!(early_log.0.lock().is_empty());
    assert!(!late.is_attached());

    // A recreated role is picked up again by registered overlookers.
    let b = AgentId::new();
    org.request_role(b, "C", "G", "r", None).unwrap();
    assert_eq!(*early_log.0.lock(), vec![b]);
    assert_eq!(late.size(), 1);

    assert!(org.remove_overlooker(early.id()));
    assert!(!early.is_attached());
    org.request_role(AgentId::new(), "C", "G", "r", None).unwrap();
    assert_eq!(*early_log.0.lock(), vec![b]);
}

/// Appends `(tag, agent, joined)` for every event to a shared log.
struct Tagged {
    tag: u8,
    log: Arc<Mutex<Vec<(u8, AgentId, bool)>>>,
}

impl RoleObserver for Tagged {
    fn on_join(&self, member: &AgentAddress) {
        self.log.lock().push((self.tag, member.agent(), true));
    }
    fn on_leave(&self, member: &AgentAddress) {
        self.log.lock().push((self.tag, member.agent(), false));
    }
}

struct Exploding;

impl RoleObserver for Exploding {
    fn on_join(&self, _member: &AgentAddress) {
        panic!("observer failure on join");
    }
    fn on_leave(&self, _member: &AgentAddress) {
        panic!("observer failure on leave");
    }
}

#[test]
fn panicking_observer_does_not_starve_later_ones() {
    let org = org();
    org.create_group(AgentId::new(), "C", "G", false, None).unwrap();
    let cgr = Cgr::new("C", "G", "r");
    let log = Arc::new(Mutex::new(Vec::new()));

    org.add_overlooker(Overlooker::new(cgr.clone(), Exploding));
    org.add_overlooker(Overlooker::new(cgr.clone(), Tagged { tag: 1, log: log.clone() }));
    org.add_overlooker(Overlooker::new(cgr.clone(), Tagged { tag: 2, log: log.clone() }));

    let (a1, a2) = (AgentId::new(), AgentId::new());
    org.request_role(a1, "C", "G", "r", None).unwrap();
    org.request_role(a2, "C", "G", "r", None).unwrap();
    org.leave_role(a1, "C", "G", "r").unwrap();

    assert_eq!(
        *log.lock(),
        vec![
            (1, a1, true),
            (2, a1, true),
            (1, a2, true),
            (2, a2, true),
            (1, a1, false),
            (2, a1, false),
        ]
    );
    assert_eq!(org.agents_with_role("C", "G", "r").len(), 1);
}

#[test]
fn shuffled_does_not_disturb_view_order() {
    let org = org();
    org.create_group(AgentId::new(), "C", "G", false, None).unwrap();
    let agents: Vec<AgentId> = (0..16).map(|_| AgentId::new()).collect();
    for agent in &agents {
        org.request_role(*agent, "C", "G", "r", None).unwrap();
    }
    let ov = Overlooker::passive(Cgr::new("C", "G", "r"));
    org.add_overlooker(ov.clone());

    let mut shuffled: Vec<AgentId> = ov.shuffled().iter().map(|a| a.agent()).collect();
    let ordered: Vec<AgentId> = ov.current().iter().map(|a| a.agent()).collect();
    assert_eq!(ordered, agents);
    shuffled.sort_by_key(|a| a.to_string());
    let mut expected = agents.clone();
    expected.sort_by_key(|a| a.to_string());
    assert_eq!(shuffled, expected);
}

#[test]
fn worker_scenario() {
    let org = org();
    let creator = AgentId::new();
    let x = AgentId::new();

    let manager = org.create_group(creator, "C", "G", false, None).unwrap();
    assert_eq!(manager.cgr(), &Cgr::new("C", "G", GROUP_MANAGER_ROLE));
    assert_eq!(org.roles_of(creator), vec![manager.cgr().clone()]);

    assert!(org.request_role(x, "C", "G", "worker", None).is_ok());
    assert_eq!(
        org.request_role(x, "C", "G", "worker", None),
        Err(OrgError::RoleAlreadyHeld("worker".into()))
    );
    org.leave_role(x, "C", "G", "worker").unwrap();

    assert!(!org.is_role("C", "G", "worker"));
    assert!(org.is_role("C", "G", GROUP_MANAGER_ROLE));
    assert_eq!(org.role_names("C", "G"), vec![GROUP_MANAGER_ROLE.to_string()]);
}

#[test]
fn denying_and_panicking_policies() {
    let org = org();
    let creator = AgentId::new();
    let x = AgentId::new();
    org.create_group(creator, "C", "locked", false, Some(Arc::new(DenyAll)))
        .unwrap();
    assert_eq!(
        org.request_role(x, "C", "locked", "worker", None),
        Err(OrgError::AccessDenied {
            role: "worker".into()
        })
    );
    assert!(!org.has_crashed(x));

    let broken: Arc<dyn AccessPolicy> =
        Arc::new(|_: &str, _: Option<&Credential>| -> bool { panic!("cannot evaluate") });
    org.create_group(creator, "C", "broken", false, Some(broken))
        .unwrap();
    assert_eq!(
        org.request_role(x, "C", "broken", "worker", None),
        Err(OrgError::AccessDenied {
            role: "worker".into()
        })
    );
    assert!(org.has_crashed(x));
    assert_eq!(org.role_names("C", "broken"), vec![GROUP_MANAGER_ROLE.to_string()]);
}

#[test]
fn peer_purge_deletes_emptied_roles() {
    let org = org();
    let local = AgentId::new();
    let (peer, other) = (KernelId::generate(), KernelId::generate());
    org.create_group(local, "C", "G", true, None).unwrap();
    org.request_role(local, "C", "G", "shared", None).unwrap();

    for kernel in [peer, peer, other] {
        let cgr = Cgr::new("C", "G", "shared");
        org.add_remote_member(&AgentAddress::new(AgentId::new(), cgr, kernel));
    }
    let remote_only = AgentAddress::new(AgentId::new(), Cgr::new("C", "G", "remote"), peer);
    org.add_remote_member(&remote_only);
    assert_eq!(org.agents_with_role("C", "G", "shared").len(), 4);

    assert_eq!(org.purge_kernel(peer), 3);
    assert_eq!(org.agents_with_role("C", "G", "shared").len(), 2);
    assert!(!org.is_role("C", "G", "remote"));
    assert!(org
        .agents_with_role("C", "G", "shared")
        .iter()
        .all(|a| a.kernel() != peer));
}

#[derive(Debug, Clone)]
enum Op {
    Join(usize, usize),
    Leave(usize, usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..4usize, 0..3usize).prop_map(|(a, r)| Op::Join(a, r)),
        (0..4usize, 0..3usize).prop_map(|(a, r)| Op::Leave(a, r)),
    ]
}

proptest! {
    #[test]
    fn roles_exist_exactly_while_populated(ops in proptest::collection::vec(op(), 1..60)) {
        let org = org();
        org.create_group(AgentId::new(), "C", "G", false, None).unwrap();
        let agents: Vec<AgentId> = (0..4).map(|_| AgentId::new()).collect();
        let roles = ["r0", "r1", "r2"];
        let mut model = vec![vec![false; roles.len()]; agents.len()];

        for op in ops {
            match op {
                Op::Join(a, r) => {
                    let result = org.request_role(agents[a], "C", "G", roles[r], None);
                    prop_assert_eq!(result.is_ok(), !model[a][r]);
                    model[a][r] = true;
                }
                Op::Leave(a, r) => {
                    let result = org.leave_role(agents[a], "C", "G", roles[r]);
                    prop_assert_eq!(result.is_ok(), model[a][r]);
                    model[a][r] = false;
                }
            }
            for (r, name) in roles.iter().enumerate() {
                let expected = model.iter().filter(|held| held[r]).count();
                prop_assert_eq!(org.agents_with_role("C", "G", name).len(), expected);
                prop_assert_eq!(org.is_role("C", "G", name), expected > 0);
            }
        }
    }
}

use std::collections::BTreeSet;
use thiserror::Error;

use crate::fleet::{FleetRegistry, Host};

/// A non-expired lease row as seen by allocation, whatever its lifecycle tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claim {
    pub host_id: i64,
    pub port: u16,
    pub credential_id: i64,
}

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("no host has a free slot and port")]
    CapacityExhausted,

    #[error("no unused active credential left")]
    CredentialExhausted,
}

/// First-fit over hosts in registration order, then lowest free port.
pub fn allocate<'a>(
    registry: &'a FleetRegistry,
    claims: &[Claim],
) -> Result<(&'a Host, u16), AllocationError> {
    for host in registry.hosts() {
        let taken: BTreeSet<u16> = claims
            .iter()
            .filter(|c| c.host_id == host.id)
            .map(|c| c.port)
            .collect();

        // Count claims, not distinct ports: a duplicate row still occupies a slot.
        let in_use = claims.iter().filter(|c| c.host_id == host.id).count();
        if in_use >= host.max_instances as usize {
            continue;
        }

        if let Some(port) = (host.port_start..=host.port_end).find(|p| !taken.contains(p)) {
            return Ok((host, port));
        }
    }
    Err(AllocationError::CapacityExhausted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::tests::{credential, host};
    use crate::fleet::CredentialPool;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn claim(host_id: i64, port: u16) -> Claim {
        Claim {
            host_id,
            port,
            credential_id: port as i64,
        }
    }

    #[test]
    fn picks_lowest_port_on_first_host() {
        let registry = FleetRegistry::new(vec![host(1, 27015, 27020, 4), host(2, 27015, 27020, 4)]);
        let (h, port) = allocate(&registry, &[]).unwrap();
        assert_eq!((h.id, port), (1, 27015));

        let (h, port) = allocate(&registry, &[claim(1, 27015), claim(1, 27017)]).unwrap();
        assert_eq!((h.id, port), (1, 27016));
    }

    #[test]
    fn skips_full_host() {
        let registry = FleetRegistry::new(vec![host(1, 27015, 27020, 1), host(2, 28015, 28020, 1)]);
        let (h, port) = allocate(&registry, &[claim(1, 27015)]).unwrap();
        assert_eq!((h.id, port), (2, 28015));
    }

    #[test]
    fn skips_host_whose_ports_are_all_taken() {
        let registry = FleetRegistry::new(vec![host(1, 27015, 27016, 10), host(2, 28015, 28015, 1)]);
        let (h, port) = allocate(&registry, &[claim(1, 27015), claim(1, 27016)]).unwrap();
        assert_eq!((h.id, port), (2, 28015));
    }

    #[test]
    fn exhausted_fleet_is_reported_fleet_wide() {
        let registry = FleetRegistry::new(vec![host(1, 27015, 27015, 1)]);
        let err = allocate(&registry, &[claim(1, 27015)]).unwrap_err();
        assert!(matches!(err, AllocationError::CapacityExhausted));

        let empty = FleetRegistry::default();
        assert!(matches!(allocate(&empty, &[]), Err(AllocationError::CapacityExhausted)));
    }

    #[test]
    fn zero_capacity_host_is_never_used() {
        let registry = FleetRegistry::new(vec![host(1, 27015, 27020, 0)]);
        assert!(allocate(&registry, &[]).is_err());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Allocate,
        Release(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![3 => Just(Op::Allocate), 1 => any::<usize>().prop_map(Op::Release)]
    }

    proptest! {
        #[test]
        fn allocations_never_break_fleet_invariants(
            shapes in prop::collection::vec((0u16..4, 0u32..4), 1..4),
            credential_count in 0i64..8,
            ops in prop::collection::vec(op(), 1..40),
        ) {
            let hosts = shapes
                .iter()
                .enumerate()
                .map(|(i, (span, cap))| host(i as i64 + 1, 27015, 27015 + span, *cap))
                .collect();
            let registry = FleetRegistry::new(hosts);
            let pool = CredentialPool::new((1..=credential_count).map(|id| credential(id, true)).collect());
            let capacity = registry.total_capacity();

            let mut claims: Vec<Claim> = Vec::new();
            for op in ops {
                match op {
                    Op::Allocate => {
                        let Ok((h, port)) = allocate(&registry, &claims) else { continue };
                        let Ok(cred) = pool.acquire(&claims) else { continue };
                        claims.push(Claim { host_id: h.id, port, credential_id: cred.id });
                    }
                    Op::Release(i) if !claims.is_empty() => {
                        claims.remove(i % claims.len());
                    }
                    Op::Release(_) => {}
                }

                prop_assert!(claims.len() <= capacity);
                let pairs: HashSet<(i64, u16)> = claims.iter().map(|c| (c.host_id, c.port)).collect();
                prop_assert_eq!(pairs.len(), claims.len());
                let creds: HashSet<i64> = claims.iter().map(|c| c.credential_id).collect();
                prop_assert_eq!(creds.len(), claims.len());
                for c in &claims {
                    let h = registry.get(c.host_id).unwrap();
                    prop_assert!(h.contains_port(c.port));
                    let on_host = claims.iter().filter(|o| o.host_id == h.id).count();
                    prop_assert!(on_host <= h.max_instances as usize);
                }
            }
        }
    }
}

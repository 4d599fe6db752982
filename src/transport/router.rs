//! Structural next-hop selection
//!
//! A node knows its parent link (if any) and one link per direct child.
//! Targets are never rewritten; the next hop is chosen purely from the
//! address tuple:
//! - a child link is used when the target may reach that child's subtree
//! - the parent link is used when the target leaves this node's subtree,
//!   unless the envelope came from the parent (no bouncing back up)

use dashmap::DashMap;
use tokio::sync::mpsc;

use super::codec::WireFrame;
use crate::error::{Result, SimulatorError};
use crate::protocol::{SimulatorAddress, Target};

#[derive(Clone)]
struct Link {
    id: u64,
    tx: mpsc::Sender<WireFrame>,
}

/// Where one envelope has to go
pub struct Route {
    pub local: bool,
    pub hops: Vec<(SimulatorAddress, mpsc::Sender<WireFrame>)>,
}

impl Route {
    pub fn is_empty(&self) -> bool {
        !self.local && self.hops.is_empty()
    }
}

pub struct Router {
    local: SimulatorAddress,
    links: DashMap<SimulatorAddress, Link>,
}

impl Router {
    pub fn new(local: SimulatorAddress) -> Self {
        Self {
            local,
            links: DashMap::new(),
        }
    }

    pub fn local(&self) -> SimulatorAddress {
        self.local
    }

    fn is_parent(&self, peer: &SimulatorAddress) -> bool {
        self.local.parent().as_ref() == Some(peer)
    }

    fn is_child(&self, peer: &SimulatorAddress) -> bool {
        peer.parent().as_ref() == Some(&self.local)
    }

    /// Register a link to a direct parent or child; replaces an older link to the same peer
    pub fn add_link(&self, peer: SimulatorAddress, id: u64, tx: mpsc::Sender<WireFrame>) -> Result<()> {
        if !self.is_parent(&peer) && !self.is_child(&peer) {
            return Err(SimulatorError::Protocol(format!(
                "{peer} is neither parent nor child of {}",
                self.local
            )));
        }
        self.links.insert(peer, Link { id, tx });
        Ok(())
    }

    /// Remove the link to `peer` if it is still the one identified by `id`
    pub fn remove_link(&self, peer: &SimulatorAddress, id: u64) -> bool {
        self.links.remove_if(peer, |_, link| link.id == id).is_some()
    }

    pub fn has_link(&self, peer: &SimulatorAddress) -> bool {
        self.links.contains_key(peer)
    }

    pub fn peers(&self) -> Vec<SimulatorAddress> {
        let mut peers: Vec<SimulatorAddress> = self.links.iter().map(|e| *e.key()).collect();
        peers.sort();
        peers
    }

    pub fn clear(&self) {
        self.links.clear();
    }

    /// Plan delivery of an envelope that arrived from `from` (`None` = sent locally)
    pub fn plan(&self, target: &Target, from: Option<SimulatorAddress>) -> Route {
        let from_parent = from.map_or(false, |peer| self.is_parent(&peer));
        let leaves_subtree = !target.is_within(&self.local);

        let mut hops = Vec::new();
        for entry in self.links.iter() {
            let peer = *entry.key();
            if Some(peer) == from {
                continue;
            }
            let wanted = if self.is_parent(&peer) {
                leaves_subtree && !from_parent
            } else {
                target.may_reach(&peer)
            };
            if wanted {
                hops.push((peer, entry.value().tx.clone()));
            }
        }

        Route {
            local: target.accepts(&self.local),
            hops,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link() -> mpsc::Sender<WireFrame> {
        mpsc::channel(1).0
    }

    fn hop_names(route: &Route) -> Vec<String> {
        let mut names: Vec<String> = route.hops.iter().map(|(a, _)| a.to_string()).collect();
        names.sort();
        names
    }

    fn agent_router() -> Router {
        let router = Router::new(SimulatorAddress::agent(2));
        router.add_link(SimulatorAddress::coordinator(), 1, link()).unwrap();
        router.add_link(SimulatorAddress::worker(2, 1), 2, link()).unwrap();
        router.add_link(SimulatorAddress::worker(2, 2), 3, link()).unwrap();
        router
    }

    #[test]
    fn test_rejects_unrelated_peers() {
        let router = Router::new(SimulatorAddress::agent(2));
        assert!(router.add_link(SimulatorAddress::agent(3), 1, link()).is_err());
        assert!(router.add_link(SimulatorAddress::worker(3, 1), 1, link()).is_err());
        assert!(router.add_link(SimulatorAddress::test(2, 1, 1), 1, link()).is_err());
    }

    #[test]
    fn test_exact_child_target() {
        let router = agent_router();
        let route = router.plan(
            &SimulatorAddress::worker(2, 2).into(),
            Some(SimulatorAddress::coordinator()),
        );
        assert!(!route.local);
        assert_eq!(hop_names(&route), vec!["A2.W2"]);
    }

    #[test]
    fn test_unknown_child_has_no_route() {
        let router = agent_router();
        let route = router.plan(&SimulatorAddress::worker(2, 9).into(), None);
        assert!(route.is_empty());
    }

    #[test]
    fn test_upstream_from_child() {
        let router = agent_router();
        let route = router.plan(
            &SimulatorAddress::coordinator().into(),
            Some(SimulatorAddress::worker(2, 1)),
        );
        assert_eq!(hop_names(&route), vec!["C"]);
    }

    #[test]
    fn test_broadcast_from_parent_never_bounces_back() {
        let router = agent_router();
        let route = router.plan(&Target::all_workers(), Some(SimulatorAddress::coordinator()));
        assert_eq!(hop_names(&route), vec!["A2.W1", "A2.W2"]);

        let route = router.plan(&Target::all_agents(), Some(SimulatorAddress::coordinator()));
        assert!(route.local);
        assert!(route.hops.is_empty());
    }

    #[test]
    fn test_broadcast_from_child_skips_origin() {
        let router = agent_router();
        let route = router.plan(&Target::all_workers(), Some(SimulatorAddress::worker(2, 1)));
        assert_eq!(hop_names(&route), vec!["A2.W2", "C"]);
    }

    #[test]
    fn test_stale_link_removal_is_ignored() {
        let router = agent_router();
        assert!(!router.remove_link(&SimulatorAddress::worker(2, 1), 99));
        assert!(router.remove_link(&SimulatorAddress::worker(2, 1), 2));
        assert!(!router.has_link(&SimulatorAddress::worker(2, 1)));
    }
}

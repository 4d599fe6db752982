//! Hierarchical addressing: Coordinator → Agent → Worker → Test
//!
//! A [`SimulatorAddress`] names exactly one component and doubles as its map
//! key. A [`Target`] is what an operation is sent to: either one exact address
//! or a wildcard selector such as `A2.W*` (all workers of agent 2).
//!
//! Canonical strings: `C`, `A2`, `A2.W5`, `A2.W5.T1`. Selectors use `*` in
//! place of an index, e.g. `A*`, `A*.W*`, `A*.W*.T3`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, SimulatorError};

/// Level of a component in the addressing hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressLevel {
    Coordinator,
    Agent,
    Worker,
    Test,
}

impl AddressLevel {
    /// Distance from the coordinator (coordinator = 0)
    pub fn depth(self) -> usize {
        match self {
            AddressLevel::Coordinator => 0,
            AddressLevel::Agent => 1,
            AddressLevel::Worker => 2,
            AddressLevel::Test => 3,
        }
    }

    fn from_depth(depth: usize) -> Option<Self> {
        match depth {
            0 => Some(AddressLevel::Coordinator),
            1 => Some(AddressLevel::Agent),
            2 => Some(AddressLevel::Worker),
            3 => Some(AddressLevel::Test),
            _ => None,
        }
    }

    pub fn parent(self) -> Option<Self> {
        self.depth().checked_sub(1).and_then(Self::from_depth)
    }

    pub fn child(self) -> Option<Self> {
        Self::from_depth(self.depth() + 1)
    }

    fn prefix(depth: usize) -> char {
        match depth {
            1 => 'A',
            2 => 'W',
            _ => 'T',
        }
    }
}

impl fmt::Display for AddressLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressLevel::Coordinator => write!(f, "coordinator"),
            AddressLevel::Agent => write!(f, "agent"),
            AddressLevel::Worker => write!(f, "worker"),
            AddressLevel::Test => write!(f, "test"),
        }
    }
}

/// Address of a single component.
///
/// Indices below the address's own level are zero. Ordering is hierarchical,
/// so sorting a set of addresses yields `C, A1, A1.W1, A1.W1.T1, A1.W2, A2, ...`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SimulatorAddress {
    agent_index: u32,
    worker_index: u32,
    test_index: u32,
    level: AddressLevel,
}

impl SimulatorAddress {
    /// Build an address, validating that every index down to `level` is positive
    /// and every index below it is zero.
    pub fn new(
        level: AddressLevel,
        agent_index: u32,
        worker_index: u32,
        test_index: u32,
    ) -> Result<Self> {
        let indices = [agent_index, worker_index, test_index];
        for (i, index) in indices.iter().enumerate() {
            let depth = i + 1;
            let used = depth <= level.depth();
            if used && *index == 0 {
                return Err(SimulatorError::AddressParsing(format!(
                    "{} index must be positive for a {} address",
                    AddressLevel::prefix(depth),
                    level
                )));
            }
            if !used && *index != 0 {
                return Err(SimulatorError::AddressParsing(format!(
                    "{} index must be zero for a {} address",
                    AddressLevel::prefix(depth),
                    level
                )));
            }
        }
        Ok(Self {
            agent_index,
            worker_index,
            test_index,
            level,
        })
    }

    pub const fn coordinator() -> Self {
        Self {
            agent_index: 0,
            worker_index: 0,
            test_index: 0,
            level: AddressLevel::Coordinator,
        }
    }

    pub fn agent(agent_index: u32) -> Self {
        debug_assert!(agent_index > 0, "agent index must be positive");
        Self {
            agent_index,
            worker_index: 0,
            test_index: 0,
            level: AddressLevel::Agent,
        }
    }

    pub fn worker(agent_index: u32, worker_index: u32) -> Self {
        debug_assert!(agent_index > 0 && worker_index > 0);
        Self {
            agent_index,
            worker_index,
            test_index: 0,
            level: AddressLevel::Worker,
        }
    }

    pub fn test(agent_index: u32, worker_index: u32, test_index: u32) -> Self {
        debug_assert!(agent_index > 0 && worker_index > 0 && test_index > 0);
        Self {
            agent_index,
            worker_index,
            test_index,
            level: AddressLevel::Test,
        }
    }

    pub fn level(&self) -> AddressLevel {
        self.level
    }

    pub fn agent_index(&self) -> u32 {
        self.agent_index
    }

    pub fn worker_index(&self) -> u32 {
        self.worker_index
    }

    pub fn test_index(&self) -> u32 {
        self.test_index
    }

    /// Index at a given depth (1 = agent, 2 = worker, 3 = test)
    pub fn index_at(&self, depth: usize) -> u32 {
        match depth {
            1 => self.agent_index,
            2 => self.worker_index,
            3 => self.test_index,
            _ => 0,
        }
    }

    /// Parent address; `None` for the coordinator
    pub fn parent(&self) -> Option<Self> {
        let level = self.level.parent()?;
        let keep = level.depth();
        Some(Self {
            agent_index: if keep >= 1 { self.agent_index } else { 0 },
            worker_index: if keep >= 2 { self.worker_index } else { 0 },
            test_index: 0,
            level,
        })
    }

    /// Child address with the given index; `None` below the test level or for index 0
    pub fn child(&self, index: u32) -> Option<Self> {
        if index == 0 {
            return None;
        }
        let level = self.level.child()?;
        let mut child = Self { level, ..*self };
        match level {
            AddressLevel::Agent => child.agent_index = index,
            AddressLevel::Worker => child.worker_index = index,
            AddressLevel::Test => child.test_index = index,
            AddressLevel::Coordinator => return None,
        }
        Some(child)
    }

    /// The agent this address lives under (itself for an agent address)
    pub fn agent_address(&self) -> Option<Self> {
        match self.level {
            AddressLevel::Coordinator => None,
            _ => Some(Self::agent(self.agent_index)),
        }
    }

    /// True if `self` is a strict ancestor of `other`
    pub fn is_ancestor_of(&self, other: &SimulatorAddress) -> bool {
        let depth = self.level.depth();
        depth < other.level.depth() && (1..=depth).all(|d| self.index_at(d) == other.index_at(d))
    }
}

impl fmt::Display for SimulatorAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.level == AddressLevel::Coordinator {
            return write!(f, "C");
        }
        for depth in 1..=self.level.depth() {
            if depth > 1 {
                write!(f, ".")?;
            }
            write!(f, "{}{}", AddressLevel::prefix(depth), self.index_at(depth))?;
        }
        Ok(())
    }
}

impl FromStr for SimulatorAddress {
    type Err = SimulatorError;

    fn from_str(s: &str) -> Result<Self> {
        let segments = parse_segments(s)?;
        let mut indices = [0u32; 3];
        for (i, segment) in segments.iter().enumerate() {
            indices[i] = segment.ok_or_else(|| {
                SimulatorError::AddressParsing(format!("wildcard not allowed in address '{s}'"))
            })?;
        }
        let level = AddressLevel::from_depth(segments.len())
            .ok_or_else(|| SimulatorError::AddressParsing(format!("too deep: '{s}'")))?;
        Self::new(level, indices[0], indices[1], indices[2])
    }
}

impl TryFrom<String> for SimulatorAddress {
    type Error = SimulatorError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<SimulatorAddress> for String {
    fn from(address: SimulatorAddress) -> Self {
        address.to_string()
    }
}

/// Parse `C` / `A1.W*.T3` into per-depth segments (`None` = wildcard).
fn parse_segments(s: &str) -> Result<Vec<Option<u32>>> {
    if s == "C" {
        return Ok(Vec::new());
    }
    if s.is_empty() {
        return Err(SimulatorError::AddressParsing("empty address".into()));
    }

    let parts: Vec<&str> = s.split('.').collect();
    if parts.len() > 3 {
        return Err(SimulatorError::AddressParsing(format!("too many segments: '{s}'")));
    }

    let mut segments = Vec::with_capacity(parts.len());
    for (i, part) in parts.iter().enumerate() {
        let expected = AddressLevel::prefix(i + 1);
        let mut chars = part.chars();
        if chars.next() != Some(expected) {
            return Err(SimulatorError::AddressParsing(format!(
                "segment {} of '{s}' must start with '{expected}'",
                i + 1
            )));
        }
        let rest = chars.as_str();
        if rest == "*" {
            segments.push(None);
            continue;
        }
        let index: u32 = rest.parse().map_err(|_| {
            SimulatorError::AddressParsing(format!("invalid index '{rest}' in '{s}'"))
        })?;
        if index == 0 {
            return Err(SimulatorError::AddressParsing(format!("zero index in '{s}'")));
        }
        segments.push(Some(index));
    }
    Ok(segments)
}

/// Destination of an operation: one component or every component matching a selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Target {
    Address(SimulatorAddress),
    Selector {
        level: AddressLevel,
        /// Per-depth index filter; `None` matches any index
        segments: [Option<u32>; 3],
    },
}

impl Target {
    /// `A*`
    pub fn all_agents() -> Self {
        Target::Selector {
            level: AddressLevel::Agent,
            segments: [None, None, None],
        }
    }

    /// `A*.W*`
    pub fn all_workers() -> Self {
        Target::Selector {
            level: AddressLevel::Worker,
            segments: [None, None, None],
        }
    }

    /// `A<n>.W*`
    pub fn workers_of(agent_index: u32) -> Self {
        Target::Selector {
            level: AddressLevel::Worker,
            segments: [Some(agent_index), None, None],
        }
    }

    /// `A*.W*.T<n>`: one test on every worker
    pub fn test_on_all_workers(test_index: u32) -> Self {
        Target::Selector {
            level: AddressLevel::Test,
            segments: [None, None, Some(test_index)],
        }
    }

    pub fn level(&self) -> AddressLevel {
        match self {
            Target::Address(address) => address.level(),
            Target::Selector { level, .. } => *level,
        }
    }

    pub fn as_address(&self) -> Option<SimulatorAddress> {
        match self {
            Target::Address(address) => Some(*address),
            Target::Selector { .. } => None,
        }
    }

    pub fn is_selector(&self) -> bool {
        matches!(self, Target::Selector { .. })
    }

    fn segment(&self, depth: usize) -> Option<u32> {
        match self {
            Target::Address(address) => Some(address.index_at(depth)),
            Target::Selector { segments, .. } => segments.get(depth - 1).copied().flatten(),
        }
    }

    fn segment_matches(&self, depth: usize, index: u32) -> bool {
        self.segment(depth).map_or(true, |s| s == index)
    }

    /// Should a component at `address` receive this operation?
    pub fn accepts(&self, address: &SimulatorAddress) -> bool {
        match self {
            Target::Address(target) => target == address,
            Target::Selector { level, .. } => {
                *level == address.level()
                    && (1..=level.depth()).all(|d| self.segment_matches(d, address.index_at(d)))
            }
        }
    }

    /// Does the target set contain `node` or any descendant of `node`?
    pub fn may_reach(&self, node: &SimulatorAddress) -> bool {
        let depth = node.level().depth();
        depth <= self.level().depth() && (1..=depth).all(|d| self.segment_matches(d, node.index_at(d)))
    }

    /// Is every matching address `node` itself or one of its descendants?
    pub fn is_within(&self, node: &SimulatorAddress) -> bool {
        let depth = node.level().depth();
        depth <= self.level().depth()
            && (1..=depth).all(|d| self.segment(d) == Some(node.index_at(d)))
    }
}

impl From<SimulatorAddress> for Target {
    fn from(address: SimulatorAddress) -> Self {
        Target::Address(address)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Address(address) => write!(f, "{address}"),
            Target::Selector { level, .. } => {
                for depth in 1..=level.depth() {
                    if depth > 1 {
                        write!(f, ".")?;
                    }
                    match self.segment(depth) {
                        Some(index) => write!(f, "{}{}", AddressLevel::prefix(depth), index)?,
                        None => write!(f, "{}*", AddressLevel::prefix(depth))?,
                    }
                }
                Ok(())
            }
        }
    }
}

impl FromStr for Target {
    type Err = SimulatorError;

    fn from_str(s: &str) -> Result<Self> {
        let parsed = parse_segments(s)?;
        if parsed.iter().all(Option::is_some) {
            return s.parse().map(Target::Address);
        }
        let level = AddressLevel::from_depth(parsed.len())
            .ok_or_else(|| SimulatorError::AddressParsing(format!("too deep: '{s}'")))?;
        let mut segments = [None; 3];
        for (i, segment) in parsed.into_iter().enumerate() {
            segments[i] = segment;
        }
        Ok(Target::Selector { level, segments })
    }
}

impl TryFrom<String> for Target {
    type Error = SimulatorError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Target> for String {
    fn from(target: Target) -> Self {
        target.to_string()
    }
}

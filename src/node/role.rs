//! Node roles as RKE records them

use std::fmt;
use std::str::FromStr;

use tracing::warn;

use crate::Error;

/// A role an RKE node can hold
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    /// Runs the Kubernetes control plane
    ControlPlane,
    /// Runs an etcd member
    Etcd,
    /// Runs workloads
    Worker,
}

impl Role {
    /// Every role, in display order
    pub const ALL: [Role; 3] = [Role::ControlPlane, Role::Etcd, Role::Worker];

    /// Tag used in RKE state and cluster.yml
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::ControlPlane => "controlplane",
            Role::Etcd => "etcd",
            Role::Worker => "worker",
        }
    }

    fn bit(self) -> u8 {
        match self {
            Role::ControlPlane => 0b001,
            Role::Etcd => 0b010,
            Role::Worker => 0b100,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "controlplane" => Ok(Role::ControlPlane),
            "etcd" => Ok(Role::Etcd),
            "worker" => Ok(Role::Worker),
            other => Err(Error::validation(format!("unknown node role {:?}", other))),
        }
    }
}

/// Set of roles held by one node
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct RoleSet(u8);

impl RoleSet {
    /// Set with no roles
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Parse RKE role tags. Unknown tags are logged and skipped.
    pub fn from_tags<S: AsRef<str>>(tags: &[S]) -> Self {
        tags.iter()
            .filter_map(|tag| match tag.as_ref().parse::<Role>() {
                Ok(role) => Some(role),
                Err(_) => {
                    warn!(role = tag.as_ref(), "Ignoring unknown node role");
                    None
                }
            })
            .collect()
    }

    /// Add a role
    pub fn insert(&mut self, role: Role) {
        self.0 |= role.bit();
    }

    /// Builder form of [`RoleSet::insert`]
    pub fn with(mut self, role: Role) -> Self {
        self.insert(role);
        self
    }

    /// True if `role` is held
    pub fn contains(&self, role: Role) -> bool {
        self.0 & role.bit() != 0
    }

    /// True if no role is held
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Control plane or etcd, the nodes that become RKE2 servers
    pub fn is_server(&self) -> bool {
        self.contains(Role::ControlPlane) || self.contains(Role::Etcd)
    }

    /// Worker with no server role
    pub fn is_pure_worker(&self) -> bool {
        self.contains(Role::Worker) && !self.is_server()
    }

    /// Held roles in display order
    pub fn iter(&self) -> impl Iterator<Item = Role> + '_ {
        Role::ALL.into_iter().filter(|r| self.contains(*r))
    }
}

impl FromIterator<Role> for RoleSet {
    fn from_iter<I: IntoIterator<Item = Role>>(iter: I) -> Self {
        let mut set = RoleSet::empty();
        for role in iter {
            set.insert(role);
        }
        set
    }
}

impl fmt::Display for RoleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(|r| r.as_str()).collect();
        f.write_str(&names.join(","))
    }
}

//! Local process attribution
//!
//! Maps a flow's local endpoint to the process that owns the socket. The
//! lookup is platform specific and lives outside this crate; callers plug
//! an implementation into the [`FlowManager`](crate::flow::FlowManager).

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::flow::FlowEndpoint;

/// Process owning one end of a flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
}

impl fmt::Display for ProcessInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.pid)
    }
}

pub trait ProcessResolver: Send + Sync {
    /// Owning process of `endpoint`, if known
    fn resolve(&self, endpoint: &FlowEndpoint) -> Option<ProcessInfo>;
}

/// Resolver that never attributes
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProcessResolver;

impl ProcessResolver for NoProcessResolver {
    fn resolve(&self, _endpoint: &FlowEndpoint) -> Option<ProcessInfo> {
        None
    }
}

/// Fixed port-to-process table
#[derive(Debug, Clone, Default)]
pub struct PortTable {
    ports: HashMap<u16, ProcessInfo>,
}

impl PortTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, port: u16, info: ProcessInfo) {
        self.ports.insert(port, info);
    }
}

impl ProcessResolver for PortTable {
    fn resolve(&self, endpoint: &FlowEndpoint) -> Option<ProcessInfo> {
        self.ports.get(&endpoint.port).cloned()
    }
}

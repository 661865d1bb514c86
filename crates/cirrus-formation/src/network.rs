//! Endpoint configuration for compute-stack VMs.
//!
//! Templates name the endpoints a VM exposes and optionally the public port
//! each one should get. Public ports are unique per cloud service, so the
//! builder takes the ports already assigned there and moves every endpoint
//! up to the first free port at or above the requested one.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{FormationError, FormationResult};
use crate::types::RawNetworkConfig;

/// An input endpoint with its public port resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedEndpoint {
    /// Endpoint name.
    pub name: String,
    /// Transport protocol.
    pub protocol: String,
    /// Port inside the VM.
    pub local_port: u16,
    /// Port exposed on the cloud service.
    pub public_port: u16,
}

/// Network configuration handed to the compute-stack adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Subnet names the VM joins.
    pub subnets: Vec<String>,
    /// Endpoints to expose.
    pub endpoints: Vec<ResolvedEndpoint>,
}

/// Build the network configuration for a VM.
///
/// VMs booted from a captured VM image cannot carry endpoints at creation
/// time; for those the configuration is empty unless `for_update` is set,
/// in which case it is pushed once the instance is ready.
pub fn build_network_config(
    raw: &RawNetworkConfig,
    assigned: &[u16],
    is_vm_image: bool,
    for_update: bool,
) -> FormationResult<NetworkConfig> {
    let subnets = raw.subnets.clone();
    if is_vm_image && !for_update {
        return Ok(NetworkConfig {
            subnets,
            endpoints: Vec::new(),
        });
    }

    let mut used: HashSet<u16> = assigned.iter().copied().collect();
    let mut endpoints = Vec::with_capacity(raw.input_endpoints.len());

    for endpoint in &raw.input_endpoints {
        if endpoint.local_port == 0 {
            return Err(FormationError::invalid(format!(
                "endpoint {} has no local port",
                endpoint.name
            )));
        }

        let requested = endpoint.public_port.unwrap_or(endpoint.local_port);
        let public_port = next_free_port(requested, &used).ok_or_else(|| {
            FormationError::invalid(format!(
                "no free public port at or above {requested} for endpoint {}",
                endpoint.name
            ))
        })?;
        used.insert(public_port);

        endpoints.push(ResolvedEndpoint {
            name: endpoint.name.clone(),
            protocol: endpoint.protocol.clone(),
            local_port: endpoint.local_port,
            public_port,
        });
    }

    Ok(NetworkConfig { subnets, endpoints })
}

fn next_free_port(from: u16, used: &HashSet<u16>) -> Option<u16> {
    let mut port = from.max(1);
    while used.contains(&port) {
        port = port.checked_add(1)?;
    }
    Some(port)
}

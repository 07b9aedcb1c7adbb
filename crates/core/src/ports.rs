//! Port Inventory
//!
//! Reconciles every published port across a host's containers, detects
//! conflicts on `(host_ip, host_port, proto)` with `0.0.0.0` wildcard
//! matching, classifies port ranges, and answers reservation queries.
//! Classifies conflicts with a pairwise dedupe-by-key pass over published
//! bindings.

use crate::container::{ContainerInfo, PortMapping};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The three IANA port ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortClass {
    System,
    User,
    Dynamic,
}

pub fn classify_port(port: u16) -> PortClass {
    match port {
        0..=1023 => PortClass::System,
        1024..=49151 => PortClass::User,
        _ => PortClass::Dynamic,
    }
}

/// One published binding, annotated with whether it collides with another.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortInventoryEntry {
    pub container_id: String,
    pub container_name: String,
    pub host_ip: String,
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: String,
    pub class: PortClass,
    pub is_conflict: bool,
}

/// A set of entries that all key to the same `(host_ip, host_port, proto)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortConflict {
    pub host_port: u16,
    pub protocol: String,
    pub container_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortCounts {
    pub tcp: usize,
    pub udp: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortInventory {
    pub entries: Vec<PortInventoryEntry>,
    pub conflicts: Vec<PortConflict>,
    pub counts_by_class: HashMap<String, PortCounts>,
}

/// Two keys collide if they share `host_port`+`protocol` and either shares
/// the same concrete `host_ip` or either side is the `0.0.0.0` wildcard.
fn keys_collide(a: (&str, u16, &str), b: (&str, u16, &str)) -> bool {
    let (a_ip, a_port, a_proto) = a;
    let (b_ip, b_port, b_proto) = b;
    if a_port != b_port || a_proto != b_proto {
        return false;
    }
    a_ip == b_ip || a_ip == "0.0.0.0" || b_ip == "0.0.0.0"
}

/// Build the full inventory for one host's container list (already fetched
/// via `ContainerService::list`/`inspect` with `all_containers=true`, per the
/// published algorithm).
pub fn build_inventory(containers: &[ContainerInfo]) -> PortInventory {
    struct Raw {
        container_id: String,
        container_name: String,
        mapping: PortMapping,
    }

    let mut raw: Vec<Raw> = Vec::new();
    for container in containers {
        let name = container
            .names
            .first()
            .cloned()
            .unwrap_or_else(|| container.id.clone());
        for mapping in &container.port_mappings {
            raw.push(Raw {
                container_id: container.id.clone(),
                container_name: name.clone(),
                mapping: mapping.clone(),
            });
        }
    }

    let mut conflict_flags = vec![false; raw.len()];
    for i in 0..raw.len() {
        for j in (i + 1)..raw.len() {
            let a = (
                raw[i].mapping.host_ip.as_str(),
                raw[i].mapping.host_port,
                raw[i].mapping.protocol.as_str(),
            );
            let b = (
                raw[j].mapping.host_ip.as_str(),
                raw[j].mapping.host_port,
                raw[j].mapping.protocol.as_str(),
            );
            if keys_collide(a, b) {
                conflict_flags[i] = true;
                conflict_flags[j] = true;
            }
        }
    }

    let mut conflicts_by_key: HashMap<(u16, String), Vec<String>> = HashMap::new();
    let mut entries = Vec::with_capacity(raw.len());
    let mut counts_by_class: HashMap<String, PortCounts> = HashMap::new();

    for (idx, item) in raw.iter().enumerate() {
        let class = classify_port(item.mapping.host_port);
        let is_conflict = conflict_flags[idx];

        let class_key = match class {
            PortClass::System => "system",
            PortClass::User => "user",
            PortClass::Dynamic => "dynamic",
        };
        let counts = counts_by_class.entry(class_key.to_string()).or_insert(PortCounts {
            tcp: 0,
            udp: 0,
        });
        match item.mapping.protocol.as_str() {
            "udp" => counts.udp += 1,
            _ => counts.tcp += 1,
        }

        if is_conflict {
            conflicts_by_key
                .entry((item.mapping.host_port, item.mapping.protocol.clone()))
                .or_default()
                .push(item.container_id.clone());
        }

        entries.push(PortInventoryEntry {
            container_id: item.container_id.clone(),
            container_name: item.container_name.clone(),
            host_ip: item.mapping.host_ip.clone(),
            host_port: item.mapping.host_port,
            container_port: item.mapping.container_port,
            protocol: item.mapping.protocol.clone(),
            class,
            is_conflict,
        });
    }

    let conflicts = conflicts_by_key
        .into_iter()
        .map(|((host_port, protocol), container_ids)| PortConflict {
            host_port,
            protocol,
            container_ids,
        })
        .collect();

    PortInventory {
        entries,
        conflicts,
        counts_by_class,
    }
}

/// A caller-held reservation that blocks a port the same way a running
/// container would, without a container actually existing yet (used during
/// migration planning to reserve a target port ahead of deploy).
#[derive(Debug, Clone)]
pub struct PortReservation {
    pub host_port: u16,
    pub protocol: String,
}

impl PortInventory {
    /// A port is available iff no entry and no reservation occupies it.
    pub fn is_available(&self, host_port: u16, protocol: &str, reservations: &[PortReservation]) -> bool {
        let occupied_by_container = self
            .entries
            .iter()
            .any(|e| e.host_port == host_port && e.protocol == protocol);
        let occupied_by_reservation = reservations
            .iter()
            .any(|r| r.host_port == host_port && r.protocol == protocol);
        !occupied_by_container && !occupied_by_reservation
    }

    /// Walk upward from `base` within `base`'s classification range to find
    /// the first available port.
    pub fn suggest_next(&self, base: u16, protocol: &str, reservations: &[PortReservation]) -> Option<u16> {
        let (lo, hi) = match classify_port(base) {
            PortClass::System => (0u16, 1023u16),
            PortClass::User => (1024, 49151),
            PortClass::Dynamic => (49152, 65535),
        };
        (base..=hi)
            .chain(lo..base)
            .find(|&p| self.is_available(p, protocol, reservations))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container(id: &str, name: &str, mappings: Vec<PortMapping>) -> ContainerInfo {
        ContainerInfo {
            id: id.to_string(),
            names: vec![name.to_string()],
            image: "test:latest".into(),
            status: "running".into(),
            state: "running".into(),
            labels: HashMap::new(),
            port_mappings: mappings,
        }
    }

    fn mapping(host_ip: &str, host_port: u16, container_port: u16, protocol: &str) -> PortMapping {
        PortMapping {
            host_ip: host_ip.to_string(),
            host_port,
            container_port,
            protocol: protocol.to_string(),
        }
    }

    #[test]
    fn classifies_ranges_per_spec() {
        assert_eq!(classify_port(80), PortClass::System);
        assert_eq!(classify_port(8080), PortClass::User);
        assert_eq!(classify_port(50000), PortClass::Dynamic);
    }

    #[test]
    fn wildcard_host_ip_conflicts_with_concrete_binding_on_same_port() {
        let containers = vec![
            container("a", "web", vec![mapping("0.0.0.0", 8080, 80, "tcp")]),
            container("b", "api", vec![mapping("127.0.0.1", 8080, 3000, "tcp")]),
        ];
        let inventory = build_inventory(&containers);
        assert_eq!(inventory.conflicts.len(), 1);
        assert!(inventory.entries.iter().all(|e| e.is_conflict));
    }

    #[test]
    fn distinct_concrete_ips_on_same_port_do_not_conflict() {
        let containers = vec![
            container("a", "web", vec![mapping("10.0.0.1", 8080, 80, "tcp")]),
            container("b", "api", vec![mapping("10.0.0.2", 8080, 3000, "tcp")]),
        ];
        let inventory = build_inventory(&containers);
        assert!(inventory.conflicts.is_empty());
        assert!(inventory.entries.iter().all(|e| !e.is_conflict));
    }

    #[test]
    fn suggest_next_skips_occupied_ports_within_the_same_class() {
        let containers = vec![container(
            "a",
            "web",
            vec![mapping("0.0.0.0", 8080, 80, "tcp")],
        )];
        let inventory = build_inventory(&containers);
        let next = inventory.suggest_next(8080, "tcp", &[]);
        assert_eq!(next, Some(8081));
    }

    #[test]
    fn suggest_next_respects_active_reservations() {
        let inventory = build_inventory(&[]);
        let reservations = vec![PortReservation {
            host_port: 9000,
            protocol: "tcp".into(),
        }];
        let next = inventory.suggest_next(9000, "tcp", &reservations);
        assert_eq!(next, Some(9001));
    }
}

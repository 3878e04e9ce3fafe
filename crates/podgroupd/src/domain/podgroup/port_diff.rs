//! Classifies the stream ports of two pod templates.

use std::collections::BTreeMap;

use api_types::PodSpec;
use api_types::StreamPort;
use api_types::StreamProc;

/// Port changes between an installed and a requested template.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortDiff {
    /// Source ports only the new template declares
    pub fresh: Vec<StreamProc>,
    /// Source ports only the old template declares
    pub dated: Vec<StreamProc>,
    /// Source ports both declare with a different target, carrying the new one
    pub updated: Vec<StreamProc>,
}

/// The ports a template declares, bound to the owning group.
pub fn stream_procs(
    pod: &PodSpec,
    namespace: &str,
    name: &str,
) -> Result<Vec<StreamProc>, serde_json::Error> {
    Ok(pod
        .stream_ports()?
        .ports
        .into_iter()
        .map(|port| StreamProc::new(port, namespace.to_string(), name.to_string()))
        .collect())
}

fn by_src_port(pod: &PodSpec) -> Result<BTreeMap<u16, StreamPort>, serde_json::Error> {
    Ok(pod
        .stream_ports()?
        .ports
        .into_iter()
        .map(|port| (port.src_port, port))
        .collect())
}

/// Diffs the ports of `old` and `new`, keyed by source port.
///
/// Every bucket is owned by the group `namespace/name`, whatever identity
/// the templates carry.
pub fn diff_ports(
    old: &PodSpec,
    new: &PodSpec,
    namespace: &str,
    name: &str,
) -> Result<PortDiff, serde_json::Error> {
    let old_ports = by_src_port(old)?;
    let new_ports = by_src_port(new)?;
    let bind = |port: &StreamPort| StreamProc::new(port.clone(), namespace.to_string(), name.to_string());

    let mut diff = PortDiff::default();
    for (src_port, port) in &new_ports {
        match old_ports.get(src_port) {
            None => diff.fresh.push(bind(port)),
            Some(previous) if previous != port => diff.updated.push(bind(port)),
            Some(_) => {}
        }
    }
    diff.dated = old_ports
        .iter()
        .filter(|(src_port, _)| !new_ports.contains_key(src_port))
        .map(|(_, port)| bind(port))
        .collect();

    Ok(diff)
}

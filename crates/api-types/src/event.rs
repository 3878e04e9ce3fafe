use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

/// Kind of placement change a dependency event reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyEventType {
    Add,
    Remove,
    Verify,
}

impl std::fmt::Display for DependencyEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Add => "add",
            Self::Remove => "remove",
            Self::Verify => "verify",
        };
        f.write_str(s)
    }
}

/// Published when an instance's placement changes in a way that affects the
/// dependencies declared by its template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEvent {
    #[serde(rename = "type")]
    pub event_type: DependencyEventType,
    /// Name of the dependency pod
    pub name: String,
    pub node_name: String,
    /// Group namespace, or the node name for node-level dependencies
    pub namespace: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotifyKind {
    PodIpLost,
}

/// An operator notification about one instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifySpec {
    pub kind: NotifyKind,
    pub namespace: String,
    pub name: String,
    pub instance_no: usize,
    pub timestamp: DateTime<Utc>,
}

impl NotifySpec {
    pub fn new(
        kind: NotifyKind,
        namespace: impl Into<String>,
        name: impl Into<String>,
        instance_no: usize,
    ) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
            instance_no,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependency_event_wire_names() {
        let event = DependencyEvent {
            event_type: DependencyEventType::Remove,
            name: "shop.redis".to_string(),
            node_name: "node-a".to_string(),
            namespace: "shop".to_string(),
        };
        let json = serde_json::to_value(&event).expect("serializable");
        assert_eq!(json["type"], "remove");
        assert_eq!(json["node_name"], "node-a");
    }
}

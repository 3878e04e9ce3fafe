use serde::Deserialize;
use serde::Serialize;

/// A stream port declared in a pod annotation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamPort {
    /// Cluster-wide port the proxy listens on
    #[serde(rename = "srcport")]
    pub src_port: u16,
    /// Port inside the instance traffic is forwarded to
    #[serde(rename = "dstport")]
    pub dst_port: u16,
    #[serde(default = "default_proto")]
    pub proto: String,
}

fn default_proto() -> String {
    "tcp".to_string()
}

/// The `ports` section of a pod annotation
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StreamPorts {
    #[serde(default)]
    pub ports: Vec<StreamPort>,
}

/// A stream port bound to the process that declared it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamProc {
    #[serde(flatten)]
    pub port: StreamPort,
    pub namespace: String,
    pub proc_name: String,
}

impl StreamProc {
    pub fn new(port: StreamPort, namespace: impl Into<String>, proc_name: impl Into<String>) -> Self {
        Self {
            port,
            namespace: namespace.into(),
            proc_name: proc_name.into(),
        }
    }

    /// Whether both bindings belong to the same process
    pub fn same_owner(&self, other: &StreamProc) -> bool {
        self.namespace == other.namespace && self.proc_name == other.proc_name
    }
}

impl std::fmt::Display for StreamProc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}->{}/{}",
            self.port.proto, self.port.src_port, self.namespace, self.proc_name
        )
    }
}

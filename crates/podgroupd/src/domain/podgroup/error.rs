use thiserror::Error;

#[derive(Debug, Error)]
pub enum PodGroupError {
    #[error("port conflict: {ports}")]
    PortConflict { ports: String },

    #[error("malformed port annotation of {pod}: {source}")]
    MalformedAnnotation {
        pod: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("operation worker of {namespace}/{name} already activated")]
    AlreadyActivated { namespace: String, name: String },

    #[error("operation queue of {namespace}/{name} is closed")]
    QueueClosed { namespace: String, name: String },
}

pub mod cluster;
pub mod eagle;
pub mod local_cluster;
pub mod notify;
pub mod publisher;
pub mod store;

//! Inventory data returned by the virtualization API.
//!
//! Only the fields the record derivation needs are modelled.  Every
//! response is wrapped in a `{ "data": ... }` envelope, and optional
//! fields the API omits decode to empty values so that a VM without a
//! name or without tags is still a valid entry.

use serde::Deserialize;

/// The `{ "data": ... }` envelope every API response is wrapped in.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope<T> {
    pub data: T,
}

/// A compute node.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Node {
    pub node: String,
}

/// An entry of a node's VM list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VmSummary {
    pub vmid: u32,
    /// Semicolon separated free text.
    #[serde(default)]
    pub tags: String,
}

/// The subset of a VM's configuration used for naming and addressing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct VmConfig {
    /// Address configuration such as `ip=10.0.5.62/24,gw=10.0.5.1`.
    #[serde(default)]
    pub ipconfig0: String,
    #[serde(default)]
    pub name: String,
}

/// One of a node's own network interfaces.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NetworkInterface {
    pub iface: String,
    #[serde(default)]
    pub address: String,
}

// Static description of one worker node as read from the config file.
// Live connection state is owned by the controller, not by this type.
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Accelerator index on the host; also offsets the control port.
    pub device:      u32,
    /// IPv4 address or hostname of the host running the worker launcher.
    pub address:     String,
    /// Port the node's upstream writer listens on for the link to the next stage.
    pub stream_port: u16,
}

impl NodeSpec {
    /// Control-socket port: `base_port + device`, saturating at `u16::MAX`.
    pub fn control_port(&self, base_port: u16) -> u16 {
        u16::try_from(self.device).map_or(u16::MAX, |d| base_port.saturating_add(d))
    }

    pub fn is_local(&self, controller_ip: &str) -> bool {
        self.address == controller_ip
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_port_offsets_by_device() {
        let node = NodeSpec { device: 3, address: "10.0.0.2".into(), stream_port: 6000 };
        assert_eq!(node.control_port(5200), 5203);
        assert!(node.is_local("10.0.0.2"));
        assert!(!node.is_local("10.0.0.1"));
    }

    #[test]
    fn oversized_device_saturates() {
        let node = NodeSpec { device: 70_000, address: "10.0.0.2".into(), stream_port: 6000 };
        assert_eq!(node.control_port(5200), u16::MAX);
    }
}

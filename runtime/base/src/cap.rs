//! Capability representation
//!
//! A capability is an unforgeable reference to a kernel object: an opaque
//! selector into the owning PD's capability space, tagged with the RPC
//! interface the referenced object speaks. A capability is either invalid
//! or refers to exactly one live object; liveness is the kernel's
//! knowledge, the flag here only distinguishes the never-assigned case.

use serde::{Deserialize, Serialize};

/// Slot in a per-PD capability space
pub type Selector = u64;

/// Numeric identity of an RPC interface
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IfaceId(pub u16);

/// The fixed set of session kinds a server can speak, with dynamic RPC
/// services named explicitly
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub enum SessionKind {
    Ram,
    Cpu,
    Pd,
    IoMem,
    IoPort,
    Irq,
    Rom,
    Rpc(String),
}

impl SessionKind {
    pub fn service_name(&self) -> &str {
        match self {
            SessionKind::Ram => "RAM",
            SessionKind::Cpu => "CPU",
            SessionKind::Pd => "PD",
            SessionKind::IoMem => "IO_MEM",
            SessionKind::IoPort => "IO_PORT",
            SessionKind::Irq => "IRQ",
            SessionKind::Rom => "ROM",
            SessionKind::Rpc(name) => name,
        }
    }

    pub fn from_service_name(name: &str) -> Self {
        match name {
            "RAM" => SessionKind::Ram,
            "CPU" => SessionKind::Cpu,
            "PD" => SessionKind::Pd,
            "IO_MEM" => SessionKind::IoMem,
            "IO_PORT" => SessionKind::IoPort,
            "IRQ" => SessionKind::Irq,
            "ROM" => SessionKind::Rom,
            other => SessionKind::Rpc(other.into()),
        }
    }
}

/// Typed reference to a kernel object
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Capability {
    selector: Selector,
    iface: IfaceId,
    valid: bool,
}

impl Capability {
    pub fn new(selector: Selector, iface: IfaceId) -> Self {
        Self {
            selector,
            iface,
            valid: true,
        }
    }

    /// A capability referring to nothing
    pub fn invalid() -> Self {
        Self {
            selector: 0,
            iface: IfaceId(0),
            valid: false,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn selector(&self) -> Selector {
        self.selector
    }

    pub fn iface(&self) -> IfaceId {
        self.iface
    }
}

impl Default for Capability {
    fn default() -> Self {
        Self::invalid()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_capability() {
        let cap = Capability::invalid();
        assert!(!cap.is_valid());
        assert_eq!(Capability::default(), cap);
    }

    #[test]
    fn test_copying_shares_the_reference() {
        let cap = Capability::new(42, IfaceId(3));
        let copy = cap;
        assert_eq!(copy.selector(), 42);
        assert_eq!(copy, cap);
    }

    #[test]
    fn test_session_kind_names() {
        assert_eq!(SessionKind::Pd.service_name(), "PD");
        assert_eq!(SessionKind::from_service_name("IO_MEM"), SessionKind::IoMem);
        assert_eq!(
            SessionKind::from_service_name("Framebuffer"),
            SessionKind::Rpc("Framebuffer".into())
        );
        assert_eq!(
            SessionKind::from_service_name("Framebuffer").service_name(),
            "Framebuffer"
        );
    }
}

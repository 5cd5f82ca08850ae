use std::net::IpAddr;

/// A thin wrapper over `IpAddr` identifying the querier that requested a
/// targeted (unicast-eligible) response, or an interface's own address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Address(pub IpAddr);

impl Address {
    pub fn new(addr: IpAddr) -> Self {
        Self(addr)
    }

    pub fn address_cmp(&self, other: &Address) -> bool {
        self == other
    }
}

impl From<IpAddr> for Address {
    fn from(addr: IpAddr) -> Self {
        Self(addr)
    }
}

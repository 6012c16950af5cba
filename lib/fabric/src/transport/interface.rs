// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Network interface lookup.

use super::TransferError;

use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;
use std::collections::BTreeMap;
use std::net::IpAddr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub name: String,
    pub is_up: bool,
    pub addresses: Vec<IpAddr>,
}

impl InterfaceInfo {
    /// First IPv4 address, else the first IPv6 one
    pub fn preferred_address(&self) -> Option<IpAddr> {
        self.addresses
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| self.addresses.first())
            .copied()
    }
}

/// Every interface the kernel reports, with its addresses
pub fn list_interfaces() -> Result<Vec<InterfaceInfo>, TransferError> {
    let addrs = getifaddrs().map_err(|e| TransferError::Io(e.into()))?;

    let mut interfaces: BTreeMap<String, InterfaceInfo> = BTreeMap::new();
    for ifaddr in addrs {
        let info = interfaces
            .entry(ifaddr.interface_name.clone())
            .or_insert_with(|| InterfaceInfo {
                name: ifaddr.interface_name.clone(),
                is_up: false,
                addresses: Vec::new(),
            });
        info.is_up |= ifaddr.flags.contains(InterfaceFlags::IFF_UP);

        if let Some(addr) = ifaddr.address {
            if let Some(sockaddr) = addr.as_sockaddr_in() {
                info.addresses.push(IpAddr::V4(sockaddr.ip()));
            } else if let Some(sockaddr) = addr.as_sockaddr_in6() {
                info.addresses.push(IpAddr::V6(sockaddr.ip()));
            }
        }
    }
    Ok(interfaces.into_values().collect())
}

/// Look up `name` and require it to be present and up
pub fn validate_interface(name: &str) -> Result<InterfaceInfo, TransferError> {
    let info = list_interfaces()?
        .into_iter()
        .find(|i| i.name == name)
        .ok_or_else(|| TransferError::InterfaceNotFound(name.to_string()))?;
    if !info.is_up {
        return Err(TransferError::InterfaceDown(name.to_string()));
    }
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_interface() {
        assert!(matches!(
            validate_interface("ait-does-not-exist0"),
            Err(TransferError::InterfaceNotFound(_))
        ));
    }

    #[test]
    fn test_listed_interfaces_validate_consistently() {
        for info in list_interfaces().unwrap() {
            match validate_interface(&info.name) {
                Ok(validated) => assert!(validated.is_up),
                Err(TransferError::InterfaceDown(name)) => assert_eq!(name, info.name),
                Err(e) => panic!("unexpected error for {}: {e}", info.name),
            }
        }
    }

    #[test]
    fn test_preferred_address_is_ipv4_first() {
        let info = InterfaceInfo {
            name: "eth0".to_string(),
            is_up: true,
            addresses: vec!["fe80::1".parse().unwrap(), "10.0.0.5".parse().unwrap()],
        };
        assert_eq!(info.preferred_address(), Some("10.0.0.5".parse().unwrap()));
    }
}

//! Generic rtnetlink link/address operations the WireGuard genl family doesn't cover:
//! assigning an address to a freshly created interface and bringing it up. Modeled on
//! the same `netlink_request_rtnl` primitive `wireguard-control`'s kernel backend uses
//! to create the link in the first place.

use std::io;
use std::net::IpAddr;

use ipnet::IpNet;
use netlink_packet_core::{NetlinkMessage, NetlinkPayload, NLM_F_ACK, NLM_F_DUMP, NLM_F_REQUEST};
use netlink_packet_route::{
    address,
    constants::{AF_INET, AF_INET6, IFF_UP},
    link::{self, nlas::Nla as LinkNla},
    AddressMessage, LinkMessage, RtnlMessage,
};
use netlink_request::netlink_request_rtnl;
use wireguard_control::InterfaceName;

fn find_link_index(iface: &InterfaceName) -> io::Result<u32> {
    let responses = netlink_request_rtnl(
        RtnlMessage::GetLink(LinkMessage::default()),
        Some(NLM_F_DUMP | NLM_F_REQUEST),
    )?;
    responses
        .into_iter()
        .filter_map(|response| match response {
            NetlinkMessage { payload: NetlinkPayload::InnerMessage(RtnlMessage::NewLink(link)), .. } => {
                Some(link)
            },
            _ => None,
        })
        .find(|link| {
            link.nlas.iter().any(|nla| matches!(nla, LinkNla::IfName(name) if name == iface.as_str_lossy().as_ref()))
        })
        .map(|link| link.header.index)
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "interface not found"))
}

/// Assigns `addr` (address + prefix length) to `iface`.
pub fn set_address(iface: &InterfaceName, addr: IpNet) -> io::Result<()> {
    let index = find_link_index(iface)?;

    let mut message = AddressMessage::default();
    message.header.index = index;
    message.header.prefix_len = addr.prefix_len();
    message.header.family = match addr.addr() {
        IpAddr::V4(_) => AF_INET as u8,
        IpAddr::V6(_) => AF_INET6 as u8,
    };
    message.nlas.push(address::nlas::Nla::Local(ip_bytes(addr.addr())));
    message.nlas.push(address::nlas::Nla::Address(ip_bytes(addr.addr())));

    netlink_request_rtnl(
        RtnlMessage::NewAddress(message),
        Some(NLM_F_REQUEST | NLM_F_ACK),
    )?;
    Ok(())
}

/// Brings `iface` up (`ip link set <iface> up`).
pub fn set_link_up(iface: &InterfaceName) -> io::Result<()> {
    let index = find_link_index(iface)?;

    let mut message = LinkMessage::default();
    message.header.index = index;
    message.header.flags = IFF_UP;
    message.header.change_mask = IFF_UP;

    netlink_request_rtnl(
        RtnlMessage::SetLink(message),
        Some(NLM_F_REQUEST | NLM_F_ACK),
    )?;
    Ok(())
}

fn ip_bytes(addr: IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

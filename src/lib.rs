
#![no_std]

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod timer;

pub mod radio;

pub mod error;

pub mod mem;

pub mod sched;

pub mod crypto;

pub mod mac;

pub mod neighbor;

pub mod ipv4;

pub mod route;

pub mod timesync;

pub mod netmsg;

pub mod socket;

pub mod stack;

pub mod prelude;

// wire types from smoltcp appear throughout the public API
pub use smoltcp;

use smoltcp::wire::Ipv4Address;

/// Millisecond tick timestamp
pub type Ts = u32;

/// 802.15.4 short broadcast address
pub const BROADCAST_SHORT: u16 = 0xffff;

/// Broadcast PAN identifier
pub const BROADCAST_PAN: u16 = 0xffff;

bitflags::bitflags! {
    /// System warning flags, cleared on reboot
    pub struct Warnings: u16 {
        const MEM_FULL          = 0x0001;
        const NETMSG_FULL       = 0x0002;
        const FLASHFS_FAIL      = 0x0004;
        const FLASHFS_HARD_ERR  = 0x0008;
        const CONFIG_FULL       = 0x0010;
        const CONFIG_WRITE_FAIL = 0x0020;
    }
}

/// Node and stack configuration
#[derive(Clone, Debug, PartialEq)]
pub struct StackConfig {
    pub pan_id: u16,
    pub short_addr: u16,
    pub long_addr: u64,
    pub ip: Ipv4Address,

    /// Pairwise authentication key shared across the mesh
    pub auth_key: [u8; 16],

    /// Node acts as the mesh root / gateway
    pub gateway: bool,
    /// Node forwards traffic for other nodes
    pub enable_routing: bool,
    /// Node participates in time synchronisation
    pub enable_time_sync: bool,
    /// Request link-layer acks for unicast IPv4 fragments
    pub ack_request: bool,

    /// Neighbor table limit (≥ 1)
    pub max_neighbors: u8,
    /// Provisional (joining) neighbor limit (≥ 1)
    pub max_provisional: u8,
    /// Route table limit (≥ 2)
    pub max_routes: u8,
    /// Outstanding route discovery limit (≥ 2)
    pub max_discoveries: u8,

    /// RSSI/LQI smoothing filter, x/128
    pub rssi_filter: u8,
    /// Packet reception ratio filter, x/128
    pub etx_filter: u8,
    /// Traffic average filter, x/128
    pub traffic_filter: u8,

    /// Software (re)transmit attempts for acked frames
    pub tx_sw_tries: u8,
    /// Adapt the CSMA backoff exponent from link feedback
    pub adaptive_cca: bool,
    /// Minimum backoff exponent
    pub min_be: u8,
    /// Maximum backoff exponent
    pub max_be: u8,
    /// Transmit power attenuation, 0 (max) ..= 15 (min)
    pub tx_power: u8,

    /// Initial radio channel, 11 ..= 26
    pub channel: u8,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            pan_id: 0x2620,
            short_addr: 0,
            long_addr: 0,
            ip: Ipv4Address::UNSPECIFIED,

            auth_key: [0u8; 16],

            gateway: false,
            enable_routing: true,
            enable_time_sync: true,
            ack_request: true,

            max_neighbors: 8,
            max_provisional: 4,
            max_routes: 8,
            max_discoveries: 4,

            rssi_filter: 16,
            etx_filter: 16,
            traffic_filter: 16,

            tx_sw_tries: 3,
            adaptive_cca: true,
            min_be: 3,
            max_be: 8,
            tx_power: 0,

            channel: 11,
        }
    }
}

/// Check whether `now` has reached (or passed) `deadline`, wrap safe
pub fn time_reached(now: Ts, deadline: Ts) -> bool {
    (now.wrapping_sub(deadline) as i32) >= 0
}

/// Elapsed milliseconds since `start`, wrap safe
pub fn time_elapsed(now: Ts, start: Ts) -> Ts {
    now.wrapping_sub(start)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn time_compare_wraps() {
        assert!(time_reached(10, 10));
        assert!(time_reached(11, 10));
        assert!(!time_reached(9, 10));

        // across the u32 wrap
        assert!(time_reached(5, 0xffff_fff0));
        assert!(!time_reached(0xffff_fff0, 5));
        assert_eq!(time_elapsed(5, 0xffff_fffb), 10);
    }
}

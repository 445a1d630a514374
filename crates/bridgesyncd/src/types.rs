//! Kernel object snapshots shared between the netlink layer, the object
//! cache, and the bridge translator.

use swbridge_types::MacAddress;

/// Kernel link flag bits we care about (subset of IFF_*).
pub const IFF_UP: u32 = 0x1;
pub const IFF_RUNNING: u32 = 0x40;

const BITMAP_WORDS: usize = 128; // 4096 VLAN ids

/// Per-port VLAN state as reported by the kernel bridge: membership and
/// egress-untagged bitmaps plus the PVID scalar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlanBitmap {
    member: [u32; BITMAP_WORDS],
    untagged: [u32; BITMAP_WORDS],
    pvid: u16,
}

impl Default for VlanBitmap {
    fn default() -> Self {
        Self {
            member: [0; BITMAP_WORDS],
            untagged: [0; BITMAP_WORDS],
            pvid: 0,
        }
    }
}

/// One VLAN whose membership toggled between two bitmap snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VlanDelta {
    pub vid: u16,
    pub added: bool,
    /// Egress-untagged flag, read from the new bitmap for additions and
    /// the old bitmap for removals.
    pub untagged: bool,
}

impl VlanBitmap {
    pub fn set(&mut self, vid: u16, untagged: bool) {
        let (word, bit) = Self::index(vid);
        self.member[word] |= 1 << bit;
        if untagged {
            self.untagged[word] |= 1 << bit;
        } else {
            self.untagged[word] &= !(1 << bit);
        }
    }

    pub fn clear(&mut self, vid: u16) {
        let (word, bit) = Self::index(vid);
        self.member[word] &= !(1 << bit);
        self.untagged[word] &= !(1 << bit);
    }

    pub fn is_member(&self, vid: u16) -> bool {
        let (word, bit) = Self::index(vid);
        self.member[word] & (1 << bit) != 0
    }

    pub fn is_untagged(&self, vid: u16) -> bool {
        let (word, bit) = Self::index(vid);
        self.untagged[word] & (1 << bit) != 0
    }

    pub fn pvid(&self) -> u16 {
        self.pvid
    }

    pub fn set_pvid(&mut self, vid: u16) {
        self.pvid = vid;
    }

    pub fn is_empty(&self) -> bool {
        self.member.iter().all(|&w| w == 0)
    }

    /// All member VLAN ids in ascending order.
    pub fn members(&self) -> Vec<u16> {
        let mut out = Vec::new();
        for (word, &bits) in self.member.iter().enumerate() {
            let mut bits = bits;
            while bits != 0 {
                let bit = bits.trailing_zeros();
                out.push((word * 32) as u16 + bit as u16);
                bits &= bits - 1;
            }
        }
        out
    }

    /// Membership changes from `old` to `new`, scanning word-wise and
    /// only visiting words whose XOR is non-zero. A bit that stays set
    /// while only its untagged sub-bit flips produces no delta; only
    /// structural membership changes are reported.
    pub fn diff(old: &VlanBitmap, new: &VlanBitmap) -> Vec<VlanDelta> {
        let mut deltas = Vec::new();
        for word in 0..BITMAP_WORDS {
            let mut changed = old.member[word] ^ new.member[word];
            if changed == 0 {
                continue;
            }
            while changed != 0 {
                let bit = changed.trailing_zeros();
                changed &= changed - 1;

                let vid = (word * 32) as u16 + bit as u16;
                let added = new.member[word] & (1 << bit) != 0;
                let untagged = if added {
                    new.untagged[word] & (1 << bit) != 0
                } else {
                    old.untagged[word] & (1 << bit) != 0
                };
                deltas.push(VlanDelta {
                    vid,
                    added,
                    untagged,
                });
            }
        }
        deltas
    }

    fn index(vid: u16) -> (usize, u32) {
        let vid = vid & 0x0fff;
        (usize::from(vid) / 32, u32::from(vid) % 32)
    }
}

/// Immutable snapshot of one kernel link. Replaced wholesale on each
/// kernel notification; other components only ever see copies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSnapshot {
    pub ifindex: u32,
    pub name: String,
    pub mac: MacAddress,
    pub flags: u32,
    pub mtu: u32,
    /// Interface index of the enslaving device, 0 if none.
    pub master: u32,
    /// Present only for AF_BRIDGE link notifications of bridge members.
    pub bridge_vlans: Option<VlanBitmap>,
}

impl LinkSnapshot {
    pub fn is_admin_up(&self) -> bool {
        self.flags & IFF_UP != 0
    }

    pub fn has_master(&self) -> bool {
        self.master != 0
    }
}

/// A kernel bridge forwarding-database entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BridgeNeighbor {
    pub ifindex: u32,
    /// Raw VLAN id as reported by the kernel; validated at the
    /// translator boundary.
    pub vlan: u16,
    pub mac: MacAddress,
}

/// Parsed kernel notification, dispatched by the event pump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetlinkEvent {
    LinkNew(LinkSnapshot),
    LinkDel(u32),
    NeighNew(BridgeNeighbor),
    NeighDel(BridgeNeighbor),
    /// NLMSG_DONE terminating a dump we requested.
    DumpComplete,
}

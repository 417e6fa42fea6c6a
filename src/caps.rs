//! Query capability bitmask.
//!
//! Every compiled unit reports the classes of operation it performs; the
//! client declares which classes it permits through the
//! `ALLOW_CAPABILITIES` header. Execution is refused when the unit needs a
//! bit the client did not grant.

use std::{fmt, ops};

/// A `u64` bitmask gating classes of operation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Capability(u64);

impl Capability {
    pub const NONE: Capability = Capability(0);
    /// Query mutates user data.
    pub const MODIFICATIONS: Capability = Capability(1 << 0);
    /// Query changes session configuration.
    pub const SESSION_CONFIG: Capability = Capability(1 << 1);
    /// Query contains transaction control commands.
    pub const TRANSACTION: Capability = Capability(1 << 2);
    /// Query contains DDL.
    pub const DDL: Capability = Capability(1 << 3);
    /// Query changes database or instance configuration.
    pub const PERSISTENT_CONFIG: Capability = Capability(1 << 4);

    pub const ALL: Capability = Capability(u64::MAX);

    const NAMES: [(Capability, &'static str); 5] = [
        (Capability::MODIFICATIONS, "MODIFICATIONS"),
        (Capability::SESSION_CONFIG, "SESSION_CONFIG"),
        (Capability::TRANSACTION, "TRANSACTION"),
        (Capability::DDL, "DDL"),
        (Capability::PERSISTENT_CONFIG, "PERSISTENT_CONFIG"),
    ];

    pub const fn from_bits(bits: u64) -> Capability {
        Capability(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Capability) -> bool {
        self.0 & other.0 == other.0
    }

    /// Bits of `self` not granted by `allowed`.
    pub const fn disallowed_by(self, allowed: Capability) -> Capability {
        Capability(self.0 & !allowed.0)
    }
}

impl ops::BitOr for Capability {
    type Output = Capability;

    fn bitor(self, rhs: Capability) -> Capability {
        Capability(self.0 | rhs.0)
    }
}

impl ops::BitOrAssign for Capability {
    fn bitor_assign(&mut self, rhs: Capability) {
        self.0 |= rhs.0;
    }
}

impl ops::BitAnd for Capability {
    type Output = Capability;

    fn bitand(self, rhs: Capability) -> Capability {
        Capability(self.0 & rhs.0)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (cap, name) in Capability::NAMES {
            if self.contains(cap) {
                if !first {
                    f.write_str(", ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("(none)")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Capability({self})")
    }
}

//! Flag words carried by the opcode bodies

use std::ops::BitOr;

macro_rules! wire_flags {
    ($(#[$meta:meta])* $name:ident { $($(#[$fmeta:meta])* $flag:ident = $bit:expr;)* }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
        pub struct $name(u32);

        impl $name {
            $($(#[$fmeta])* pub const $flag: $name = $name($bit);)*

            pub const fn empty() -> Self {
                $name(0)
            }

            pub const fn from_bits(bits: u32) -> Self {
                $name(bits)
            }

            pub const fn bits(self) -> u32 {
                self.0
            }

            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }

            pub fn remove(&mut self, other: Self) {
                self.0 &= !other.0;
            }
        }

        impl BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                $name(self.0 | rhs.0)
            }
        }
    };
}

wire_flags! {
    /// OP_QUERY flags
    QueryFlags {
        TAILABLE_CURSOR = 1 << 1;
        SLAVE_OK = 1 << 2;
        NO_CURSOR_TIMEOUT = 1 << 4;
        AWAIT_DATA = 1 << 5;
        EXHAUST = 1 << 6;
        PARTIAL = 1 << 7;
    }
}

wire_flags! {
    /// OP_REPLY response flags
    ReplyFlags {
        /// The getMore referenced a cursor the server no longer has
        CURSOR_NOT_FOUND = 1;
        /// The single returned document is an `$err` document
        QUERY_FAILURE = 1 << 1;
        AWAIT_CAPABLE = 1 << 3;
    }
}

wire_flags! {
    /// OP_MSG flag bits
    MsgFlags {
        CHECKSUM_PRESENT = 1;
        MORE_TO_COME = 1 << 1;
        EXHAUST_ALLOWED = 1 << 16;
    }
}

impl MsgFlags {
    // Bits 0-15 must be understood by the receiver
    const REQUIRED_MASK: u32 = 0xFFFF;

    /// Whether a required bit this implementation does not know is set
    pub fn has_unknown_required_bits(self) -> bool {
        self.0 & Self::REQUIRED_MASK & !(Self::CHECKSUM_PRESENT.0 | Self::MORE_TO_COME.0) != 0
    }
}

wire_flags! {
    /// OP_UPDATE flags
    UpdateFlags {
        UPSERT = 1;
        MULTI_UPDATE = 1 << 1;
    }
}

wire_flags! {
    /// OP_INSERT flags
    InsertFlags {
        CONTINUE_ON_ERROR = 1;
    }
}

wire_flags! {
    /// OP_DELETE flags
    DeleteFlags {
        SINGLE_REMOVE = 1;
    }
}

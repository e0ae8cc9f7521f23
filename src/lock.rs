// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

//! Lock strengths and the conversion table used to combine them.
//!
//! ```text
//!   SCH_M
//!     |
//!     X
//!    / \
//!  SIX  U
//!  / \ /
//! IX  S
//!   \ |
//!    IS
//!     |
//!   SCH_S
//!     |
//!   NULL
//! ```
//!
//! The cache only ever moves a handle's lock upwards along this lattice, so
//! the lock it remembers is always the join of everything the server granted
//! during the transaction.

use std::fmt;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Lock {
    #[default]
    Null                  = 0,
    SchemaStability       = 1,
    IntentShared          = 2,
    Shared                = 3,
    IntentExclusive       = 4,
    SharedIntentExclusive = 5,
    Update                = 6,
    Exclusive             = 7,
    SchemaModification    = 8,
}

use Lock::{
    Exclusive as X,
    IntentExclusive as IX,
    IntentShared as IS,
    Null as N,
    SchemaModification as SCHM,
    SchemaStability as SCHS,
    Shared as S,
    SharedIntentExclusive as SIX,
    Update as U,
};

/// `CONVERSION[a][b]` is the weakest lock that satisfies both `a` and `b`.
#[rustfmt::skip]
const CONVERSION: [[Lock; 9]; 9] = [
    //          N     SCHS  IS    S     IX    SIX   U     X     SCHM
    /* N    */ [N,    SCHS, IS,   S,    IX,   SIX,  U,    X,    SCHM],
    /* SCHS */ [SCHS, SCHS, IS,   S,    IX,   SIX,  U,    X,    SCHM],
    /* IS   */ [IS,   IS,   IS,   S,    IX,   SIX,  U,    X,    SCHM],
    /* S    */ [S,    S,    S,    S,    SIX,  SIX,  U,    X,    SCHM],
    /* IX   */ [IX,   IX,   IX,   SIX,  IX,   SIX,  X,    X,    SCHM],
    /* SIX  */ [SIX,  SIX,  SIX,  SIX,  SIX,  SIX,  X,    X,    SCHM],
    /* U    */ [U,    U,    U,    U,    X,    X,    U,    X,    SCHM],
    /* X    */ [X,    X,    X,    X,    X,    X,    X,    X,    SCHM],
    /* SCHM */ [SCHM, SCHM, SCHM, SCHM, SCHM, SCHM, SCHM, SCHM, SCHM],
];

impl Lock {
    pub const ALL: [Lock; 9] = [N, SCHS, IS, S, IX, SIX, U, X, SCHM];

    /// The weakest lock satisfying both `self` and `other`.
    #[inline]
    pub fn join(self, other: Lock) -> Lock {
        CONVERSION[self as usize][other as usize]
    }

    /// Whether holding `self` already satisfies a request for `other`.
    #[inline]
    pub fn covers(self, other: Lock) -> bool {
        self.join(other) == self
    }

    /// The lock a class has to hold while one of its instances holds `self`.
    pub fn intention(self) -> Lock {
        match self {
            | S | U | IS => IS,
            | X | IX | SIX => IX,
            | other => other,
        }
    }

    /// The instance lock implied by holding `self` on the class.
    pub fn implicit_instance_lock(self) -> Lock {
        match self {
            | S | SIX => S,
            | X | SCHM => X,
            | _ => N,
        }
    }

    pub fn from_u8(val: u8) -> Option<Lock> {
        Lock::ALL.get(val as usize).copied()
    }
}

impl fmt::Display for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            | N => "NULL",
            | SCHS => "SCH-S",
            | IS => "IS",
            | S => "S",
            | IX => "IX",
            | SIX => "SIX",
            | U => "U",
            | X => "X",
            | SCHM => "SCH-M",
        };
        write!(f, "{}", name)
    }
}

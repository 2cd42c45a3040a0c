use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrivilegeKind {
    TableDelete,
    ColumnInsert,
    ColumnReferences,
    ColumnSelect,
    ColumnUpdate,
}

impl PrivilegeKind {
    pub const ALL: [PrivilegeKind; 5] = [
        PrivilegeKind::TableDelete,
        PrivilegeKind::ColumnInsert,
        PrivilegeKind::ColumnReferences,
        PrivilegeKind::ColumnSelect,
        PrivilegeKind::ColumnUpdate,
    ];

    fn slot(self) -> usize {
        match self {
            PrivilegeKind::TableDelete => 0,
            PrivilegeKind::ColumnInsert => 1,
            PrivilegeKind::ColumnReferences => 2,
            PrivilegeKind::ColumnSelect => 3,
            PrivilegeKind::ColumnUpdate => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum Grantability {
    #[default]
    Absent,
    Granted,
    WithGrantOption,
}

impl Grantability {
    fn bits(self) -> i64 {
        match self {
            Grantability::Absent => 0,
            Grantability::Granted => 1,
            Grantability::WithGrantOption => 2,
        }
    }

    fn from_bits(bits: i64) -> Option<Self> {
        match bits {
            0 => Some(Grantability::Absent),
            1 => Some(Grantability::Granted),
            2 => Some(Grantability::WithGrantOption),
            _ => None,
        }
    }
}

/// Tri-state privilege vector, one slot per [`PrivilegeKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PrivilegeDescriptor([Grantability; 5]);

impl PrivilegeDescriptor {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn all(grantability: Grantability) -> Self {
        Self([grantability; 5])
    }

    pub fn of(kinds: &[PrivilegeKind], grantability: Grantability) -> Self {
        kinds
            .iter()
            .fold(Self::empty(), |acc, kind| acc.with(*kind, grantability))
    }

    pub fn with(mut self, kind: PrivilegeKind, grantability: Grantability) -> Self {
        self.0[kind.slot()] = grantability;
        self
    }

    pub fn get(&self, kind: PrivilegeKind) -> Grantability {
        self.0[kind.slot()]
    }

    pub fn has(&self, kind: PrivilegeKind) -> bool {
        self.get(kind) != Grantability::Absent
    }

    pub fn has_grant_option(&self, kind: PrivilegeKind) -> bool {
        self.get(kind) == Grantability::WithGrantOption
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|g| *g == Grantability::Absent)
    }

    /// Slot-wise maximum.
    pub fn merge(&mut self, other: &PrivilegeDescriptor) {
        for (mine, theirs) in self.0.iter_mut().zip(other.0.iter()) {
            if *theirs > *mine {
                *mine = *theirs;
            }
        }
    }

    pub fn merged(mut self, other: &PrivilegeDescriptor) -> Self {
        self.merge(other);
        self
    }

    /// Clears every slot present in `revoked`.
    pub fn without(mut self, revoked: &PrivilegeDescriptor) -> Self {
        for (mine, theirs) in self.0.iter_mut().zip(revoked.0.iter()) {
            if *theirs != Grantability::Absent {
                *mine = Grantability::Absent;
            }
        }
        self
    }

    /// A holder may grant `requested` only if every requested slot is held
    /// with grant option.
    pub fn allows_granting(&self, requested: &PrivilegeDescriptor) -> bool {
        PrivilegeKind::ALL.iter().all(|kind| {
            !requested.has(*kind) || self.has_grant_option(*kind)
        })
    }

    pub fn contains(&self, other: &PrivilegeDescriptor) -> bool {
        self.0.iter().zip(other.0.iter()).all(|(mine, theirs)| mine >= theirs)
    }

    /// Two bits per slot, slot 0 in the low bits.
    pub fn to_bits(&self) -> i64 {
        self.0
            .iter()
            .enumerate()
            .fold(0, |acc, (slot, g)| acc | (g.bits() << (slot * 2)))
    }

    pub fn from_bits(bits: i64) -> Option<Self> {
        if !(0..1 << 10).contains(&bits) {
            return None;
        }
        let mut out = Self::empty();
        for (slot, value) in out.0.iter_mut().enumerate() {
            *value = Grantability::from_bits((bits >> (slot * 2)) & 0b11)?;
        }
        Some(out)
    }
}

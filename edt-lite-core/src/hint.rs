use crate::errors::{Result, RuntimeError};
use serde::{Deserialize, Serialize};

/// Which object family a hint record targets. Setting a property of the
/// wrong family is rejected at the API boundary, not silently dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HintKind {
    Edt,
    Db,
    Evt,
    Group,
}

/// Well-known hint properties. The discriminant doubles as the bit index in
/// the hint mask and the slot index in the value array.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum HintProp {
    EdtPriority = 0,
    /// Placement hint: an affinity guid naming a policy domain.
    EdtAffinity = 1,
    EdtSlotMaxAccess = 2,
    EdtDisperse = 3,
    EdtSpace = 4,
    EdtTime = 5,
    EdtStatsHwCycles = 6,
    EdtStatsCacheRefs = 7,
    /// Push the block to its consumers at release time.
    DbEager = 8,
    /// Fetch the block only at first access.
    DbLazy = 9,
    DbAffinity = 10,
    EvtAffinity = 11,
    GroupAffinity = 12,
}

pub const HINT_PROP_COUNT: usize = 13;

impl HintProp {
    pub fn kind(self) -> HintKind {
        use HintProp::*;
        match self {
            EdtPriority | EdtAffinity | EdtSlotMaxAccess | EdtDisperse | EdtSpace | EdtTime
            | EdtStatsHwCycles | EdtStatsCacheRefs => HintKind::Edt,
            DbEager | DbLazy | DbAffinity => HintKind::Db,
            EvtAffinity => HintKind::Evt,
            GroupAffinity => HintKind::Group,
        }
    }
}

/// A masked hint bitmap: one bit per property plus a flat value array.
/// Attached to templates, tasks, events and data-blocks; copied wholesale
/// from template to task at creation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hint {
    pub kind: Option<HintKind>,
    mask: u64,
    values: [u64; HINT_PROP_COUNT],
}

impl Hint {
    pub fn new(kind: HintKind) -> Self {
        Self {
            kind: Some(kind),
            mask: 0,
            values: [0; HINT_PROP_COUNT],
        }
    }

    pub fn set(&mut self, prop: HintProp, value: u64) -> Result<()> {
        if let Some(kind) = self.kind {
            if prop.kind() != kind {
                return Err(RuntimeError::Inval("hint property kind mismatch"));
            }
        }
        self.mask |= 1 << (prop as u8);
        self.values[prop as usize] = value;
        Ok(())
    }

    pub fn get(&self, prop: HintProp) -> Option<u64> {
        if self.mask & (1 << (prop as u8)) != 0 {
            Some(self.values[prop as usize])
        } else {
            None
        }
    }

    pub fn is_set(&self, prop: HintProp) -> bool {
        self.mask & (1 << (prop as u8)) != 0
    }

    /// Merge `other` over `self`: set bits in `other` win.
    pub fn merge_from(&mut self, other: &Hint) {
        for i in 0..HINT_PROP_COUNT {
            if other.mask & (1 << i) != 0 {
                self.mask |= 1 << i;
                self.values[i] = other.values[i];
            }
        }
    }
}

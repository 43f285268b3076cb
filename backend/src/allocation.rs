//! Consumer categories and their inventory allocations.
//!
//! A [`Category`] is a game family, optionally narrowed to one sub-variant.
//! The [`AllocationTable`] maps every configured category to its target
//! inventory size and the count below which a refill is triggered. The
//! table is read-only once the pool starts.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{PoolError, PoolResult};
use crate::record::ProofRecord;

/// Game family as known to the on-chain coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GameFamily {
    Mines,
    Plinko,
    Roulette,
    Wheel,
}

impl GameFamily {
    pub const ALL: [GameFamily; 4] = [Self::Mines, Self::Plinko, Self::Roulette, Self::Wheel];

    /// Category id carried in `request_random_words_batch`.
    pub fn id(self) -> u8 {
        match self {
            Self::Mines => 0,
            Self::Plinko => 1,
            Self::Roulette => 2,
            Self::Wheel => 3,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.id() == id)
    }

    /// Lowercase stem used in request labels.
    pub fn stem(self) -> &'static str {
        match self {
            Self::Mines => "mines",
            Self::Plinko => "plinko",
            Self::Roulette => "roulette",
            Self::Wheel => "wheel",
        }
    }
}

impl fmt::Display for GameFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.stem())
    }
}

impl FromStr for GameFamily {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|f| f.stem().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| PoolError::UnknownCategory(s.to_string()))
    }
}

/// A consumer class with its own inventory.
///
/// Without a variant the category spans every record of the family. Ordering
/// is family first, then variant; the batcher relies on it so that all
/// variants of one family are requested before the next family begins.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Category {
    pub family: GameFamily,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Category {
    pub fn family(family: GameFamily) -> Self {
        Self { family, variant: None }
    }

    pub fn variant(family: GameFamily, variant: impl Into<String>) -> Self {
        Self {
            family,
            variant: Some(variant.into()),
        }
    }

    /// Whether a record belongs to this category's inventory.
    pub fn matches(&self, record: &ProofRecord) -> bool {
        record.family == self.family
            && match &self.variant {
                None => true,
                Some(v) => record.sub_variant.as_deref() == Some(v.as_str()),
            }
    }

    /// Label for the `n`-th proof (1-based) of a request, e.g. `mines_7`
    /// or `wheel_classic_3`.
    pub fn label(&self, n: u32) -> String {
        match &self.variant {
            Some(v) => format!("{}_{}_{}", self.family.stem(), v, n),
            None => format!("{}_{}", self.family.stem(), n),
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.variant {
            Some(v) => write!(f, "{}/{}", self.family, v),
            None => write!(f, "{}", self.family),
        }
    }
}

impl FromStr for Category {
    type Err = PoolError;

    /// Parses `mines` or `mines/classic` (family is case-insensitive).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (family, variant) = match s.split_once('/') {
            Some((f, v)) if !v.trim().is_empty() => (f, Some(v.trim().to_string())),
            Some(_) => return Err(PoolError::UnknownCategory(s.to_string())),
            None => (s, None),
        };
        let family = family
            .parse::<GameFamily>()
            .map_err(|_| PoolError::UnknownCategory(s.to_string()))?;
        Ok(Self { family, variant })
    }
}

/// Inventory target and refill threshold for one category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub target: u32,
    pub refill_threshold: u32,
}

impl Allocation {
    pub const fn new(target: u32, refill_threshold: u32) -> Self {
        Self {
            target,
            refill_threshold,
        }
    }

    fn validate(&self, category: &Category) -> PoolResult<()> {
        let invalid = |reason: &str| PoolError::InvalidAllocation {
            category: category.to_string(),
            reason: reason.to_string(),
        };
        if self.target == 0 || self.refill_threshold == 0 {
            return Err(invalid("target and threshold must be positive"));
        }
        if self.refill_threshold >= self.target {
            return Err(invalid("threshold must be below target"));
        }
        Ok(())
    }
}

/// Default proofs kept per game family.
pub const DEFAULT_TARGET: u32 = 50;
/// Default minimum before a family is refilled.
pub const DEFAULT_REFILL_THRESHOLD: u32 = 25;

#[derive(Debug, Clone)]
pub struct AllocationTable {
    entries: BTreeMap<Category, Allocation>,
}

impl AllocationTable {
    pub fn new(entries: impl IntoIterator<Item = (Category, Allocation)>) -> PoolResult<Self> {
        let mut map = BTreeMap::new();
        for (category, allocation) in entries {
            allocation.validate(&category)?;
            map.insert(category, allocation);
        }

        // A family-wide entry would count the records of its variants too.
        for category in map.keys().filter(|c| c.variant.is_some()) {
            if map.contains_key(&Category::family(category.family)) {
                return Err(PoolError::InvalidAllocation {
                    category: category.to_string(),
                    reason: format!("family {} is also configured as a whole", category.family),
                });
            }
        }

        Ok(Self { entries: map })
    }

    /// Parse `MINES=50:25,WHEEL/classic=20:5`.
    pub fn parse(raw: &str) -> PoolResult<Self> {
        let mut entries = Vec::new();
        for item in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let malformed = || PoolError::InvalidAllocation {
                category: item.to_string(),
                reason: "expected CATEGORY=TARGET:THRESHOLD".into(),
            };
            let (category, numbers) = item.split_once('=').ok_or_else(malformed)?;
            let (target, threshold) = numbers.split_once(':').ok_or_else(malformed)?;
            if threshold.trim().ends_with('%') {
                return Err(PoolError::InvalidAllocation {
                    category: category.to_string(),
                    reason: "percentage thresholds are not supported".into(),
                });
            }
            let target = target.trim().parse().map_err(|_| malformed())?;
            let threshold = threshold.trim().parse().map_err(|_| malformed())?;
            entries.push((category.trim().parse()?, Allocation::new(target, threshold)));
        }
        Self::new(entries)
    }

    pub fn allocation_for(&self, category: &Category) -> PoolResult<Allocation> {
        self.entries
            .get(category)
            .copied()
            .ok_or_else(|| PoolError::UnknownCategory(category.to_string()))
    }

    /// Configured categories in batching order.
    pub fn categories(&self) -> impl Iterator<Item = &Category> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Category, &Allocation)> {
        self.entries.iter()
    }
}

impl Default for AllocationTable {
    fn default() -> Self {
        Self {
            entries: GameFamily::ALL
                .into_iter()
                .map(|f| {
                    (
                        Category::family(f),
                        Allocation::new(DEFAULT_TARGET, DEFAULT_REFILL_THRESHOLD),
                    )
                })
                .collect(),
        }
    }
}

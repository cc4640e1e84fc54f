//! Deterministic color allocation for volcano-plot groups.
//!
//! The allocator walks the palette with a cursor in three phases:
//!
//! 1. [`Phase::Fresh`]: skip colors that are reserved by overrides or
//!    already handed out.
//! 2. [`Phase::Wrapped`]: after the first exhaustion, skip only reserved
//!    colors, so handed-out colors are reused once.
//! 3. [`Phase::ForcedReuse`]: after the second exhaustion every position is
//!    accepted.
//!
//! The worst case is two passes over the palette before a color is returned.

use std::collections::{BTreeMap, HashSet};

use crate::domain::HexColor;

/// Used when there is no palette to draw from.
pub const FALLBACK_COLOR: &str = "#cccccc";

pub const DEFAULT_PALETTE: [&str; 9] = [
    "#fd7f6f", "#7eb0d5", "#b2e061", "#bd7ebe", "#ffb55a", "#ffee65", "#beb9db", "#fdcce5",
    "#8bd3c7",
];

pub fn default_palette() -> Vec<HexColor> {
    DEFAULT_PALETTE
        .iter()
        .map(|color| HexColor::from_trusted(color))
        .collect()
}

pub fn fallback_color() -> HexColor {
    HexColor::from_trusted(FALLBACK_COLOR)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Fresh,
    Wrapped,
    ForcedReuse,
}

/// Colors unavailable to the allocator.
#[derive(Debug, Clone, Default)]
pub struct UsedColors {
    /// Taken by caller-supplied overrides.
    pub reserved: HashSet<HexColor>,
    /// Handed out by the allocator during this pass.
    pub assigned: HashSet<HexColor>,
}

#[derive(Debug, Clone)]
pub struct PaletteAllocator {
    palette: Vec<HexColor>,
    cursor: usize,
    wrapped: bool,
    forced_reuse: bool,
}

impl PaletteAllocator {
    pub fn new(palette: Vec<HexColor>) -> Self {
        Self {
            palette,
            cursor: 0,
            wrapped: false,
            forced_reuse: false,
        }
    }

    pub fn phase(&self) -> Phase {
        match (self.wrapped, self.forced_reuse) {
            (_, true) => Phase::ForcedReuse,
            (true, false) => Phase::Wrapped,
            (false, false) => Phase::Fresh,
        }
    }

    fn accepts(&self, candidate: &HexColor, used: &UsedColors) -> bool {
        match self.phase() {
            Phase::Fresh => !used.reserved.contains(candidate) && !used.assigned.contains(candidate),
            Phase::Wrapped => !used.reserved.contains(candidate),
            Phase::ForcedReuse => true,
        }
    }

    /// Returns the next acceptable color. Never fails.
    pub fn allocate_next(&mut self, used: &UsedColors) -> HexColor {
        if self.palette.is_empty() {
            return fallback_color();
        }
        loop {
            if self.cursor >= self.palette.len() {
                self.cursor = 0;
                if self.wrapped {
                    self.forced_reuse = true;
                } else {
                    self.wrapped = true;
                }
            }
            let candidate = &self.palette[self.cursor];
            self.cursor += 1;
            if self.accepts(candidate, used) {
                return candidate.clone();
            }
        }
    }
}

/// Group name → color for one processing pass. A group keeps its first
/// color for the rest of the pass.
#[derive(Debug, Clone)]
pub struct ColorAssignment {
    colors: BTreeMap<String, HexColor>,
    allocator: PaletteAllocator,
    used: UsedColors,
}

impl ColorAssignment {
    pub fn new(palette: Vec<HexColor>, overrides: &BTreeMap<String, HexColor>) -> Self {
        let used = UsedColors {
            reserved: overrides.values().cloned().collect(),
            assigned: HashSet::new(),
        };
        Self {
            colors: overrides.clone(),
            allocator: PaletteAllocator::new(palette),
            used,
        }
    }

    /// Fixes colors for groups that bypass the allocator. Pinned colors are
    /// reserved like overrides.
    pub fn pin(&mut self, fixed: &BTreeMap<String, HexColor>) {
        for (group, color) in fixed {
            self.used.reserved.insert(color.clone());
            self.colors.insert(group.clone(), color.clone());
        }
    }

    pub fn get(&self, group: &str) -> Option<&HexColor> {
        self.colors.get(group)
    }

    pub fn contains(&self, group: &str) -> bool {
        self.colors.contains_key(group)
    }

    pub fn assign(&mut self, group: &str) -> HexColor {
        if let Some(color) = self.colors.get(group) {
            return color.clone();
        }
        let color = self.allocator.allocate_next(&self.used);
        self.used.assigned.insert(color.clone());
        self.colors.insert(group.to_string(), color.clone());
        color
    }

    /// Assigns every unseen group, in sorted order.
    pub fn assign_all<I, S>(&mut self, groups: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut pending = groups
            .into_iter()
            .map(|group| group.as_ref().to_string())
            .filter(|group| !self.colors.contains_key(group))
            .collect::<Vec<_>>();
        pending.sort();
        pending.dedup();
        for group in pending {
            self.assign(&group);
        }
    }

    pub fn phase(&self) -> Phase {
        self.allocator.phase()
    }

    pub fn into_map(self) -> BTreeMap<String, HexColor> {
        self.colors
    }
}

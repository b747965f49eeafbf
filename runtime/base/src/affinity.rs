//! CPU affinity: a rectangle within the two-dimensional space of CPUs
//!
//! The affinity space is the grid of CPUs a session schedules across; a
//! location is a rectangle inside it. Threads receive single-cell
//! locations derived from their session's rectangle.

use serde::{Deserialize, Serialize};

/// Dimensions of the grid of CPUs
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct AffinitySpace {
    pub width: u32,
    pub height: u32,
}

impl AffinitySpace {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn total(&self) -> u32 {
        self.width * self.height
    }

    pub fn contains(&self, location: &AffinityLocation) -> bool {
        location.xpos + location.width <= self.width
            && location.ypos + location.height <= self.height
            && location.width > 0
            && location.height > 0
    }

    /// The location covering the whole space
    pub fn whole(&self) -> AffinityLocation {
        AffinityLocation {
            xpos: 0,
            ypos: 0,
            width: self.width,
            height: self.height,
        }
    }
}

impl Default for AffinitySpace {
    fn default() -> Self {
        Self {
            width: 1,
            height: 1,
        }
    }
}

/// Rectangle of CPUs within an affinity space
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct AffinityLocation {
    pub xpos: u32,
    pub ypos: u32,
    pub width: u32,
    pub height: u32,
}

impl AffinityLocation {
    pub fn single(xpos: u32, ypos: u32) -> Self {
        Self {
            xpos,
            ypos,
            width: 1,
            height: 1,
        }
    }

    /// Flat index of the rectangle's anchor cell within `space`
    pub fn cpu_index(&self, space: &AffinitySpace) -> usize {
        (self.ypos * space.width + self.xpos) as usize
    }
}

impl Default for AffinityLocation {
    fn default() -> Self {
        Self::single(0, 0)
    }
}

/// Space and location travelling together in session arguments
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Affinity {
    pub space: AffinitySpace,
    pub location: AffinityLocation,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_space_contains_location() {
        let space = AffinitySpace::new(4, 2);
        assert!(space.contains(&space.whole()));
        assert!(space.contains(&AffinityLocation::single(3, 1)));
        assert!(!space.contains(&AffinityLocation::single(4, 0)));
        assert!(!space.contains(&AffinityLocation {
            xpos: 2,
            ypos: 0,
            width: 3,
            height: 1,
        }));
    }

    #[test]
    fn test_cpu_index() {
        let space = AffinitySpace::new(4, 2);
        assert_eq!(AffinityLocation::single(0, 0).cpu_index(&space), 0);
        assert_eq!(AffinityLocation::single(3, 0).cpu_index(&space), 3);
        assert_eq!(AffinityLocation::single(1, 1).cpu_index(&space), 5);
    }
}

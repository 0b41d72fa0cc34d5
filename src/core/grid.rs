//! Grid Geometry
//!
//! Integer cells on a toroidal board. Every step wraps on both axes,
//! so a head leaving one edge re-enters on the opposite edge.

use serde::{Serialize, Deserialize};

/// Default board width in cells.
pub const GRID_WIDTH: i32 = 40;

/// Default board height in cells.
pub const GRID_HEIGHT: i32 = 30;

/// A single board cell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Cell {
    /// Column.
    pub x: i32,
    /// Row (grows downwards).
    pub y: i32,
}

impl Cell {
    /// Create a new cell.
    #[inline]
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Movement direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Towards row 0.
    Up,
    /// Towards the last row.
    Down,
    /// Towards column 0.
    Left,
    /// Towards the last column.
    Right,
}

impl Direction {
    /// The exact reverse of this direction.
    #[inline]
    pub const fn opposite(self) -> Self {
        match self {
            Direction::Up => Direction::Down,
            Direction::Down => Direction::Up,
            Direction::Left => Direction::Right,
            Direction::Right => Direction::Left,
        }
    }

    /// Unit offset for one step.
    #[inline]
    pub const fn delta(self) -> (i32, i32) {
        match self {
            Direction::Up => (0, -1),
            Direction::Down => (0, 1),
            Direction::Left => (-1, 0),
            Direction::Right => (1, 0),
        }
    }
}

/// Board dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridSize {
    /// Columns.
    pub width: i32,
    /// Rows.
    pub height: i32,
}

impl Default for GridSize {
    fn default() -> Self {
        Self {
            width: GRID_WIDTH,
            height: GRID_HEIGHT,
        }
    }
}

impl GridSize {
    /// Create a grid size. Both dimensions are clamped to at least 1.
    pub fn new(width: i32, height: i32) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
        }
    }

    /// Whether the cell lies on the board.
    #[inline]
    pub fn contains(&self, cell: Cell) -> bool {
        cell.x >= 0 && cell.x < self.width && cell.y >= 0 && cell.y < self.height
    }

    /// Step one cell in `dir`, wrapping on both axes.
    #[inline]
    pub fn step(&self, from: Cell, dir: Direction) -> Cell {
        let (dx, dy) = dir.delta();
        Cell {
            x: (from.x + dx).rem_euclid(self.width),
            y: (from.y + dy).rem_euclid(self.height),
        }
    }

    /// Iterate all cells in row-major order.
    pub fn cells(&self) -> impl Iterator<Item = Cell> + '_ {
        (0..self.height).flat_map(move |y| (0..self.width).map(move |x| Cell::new(x, y)))
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_wrap_all_edges() {
        let grid = GridSize::default();

        assert_eq!(grid.step(Cell::new(0, 10), Direction::Left), Cell::new(39, 10));
        assert_eq!(grid.step(Cell::new(39, 10), Direction::Right), Cell::new(0, 10));
        assert_eq!(grid.step(Cell::new(7, 0), Direction::Up), Cell::new(7, 29));
        assert_eq!(grid.step(Cell::new(7, 29), Direction::Down), Cell::new(7, 0));
    }

    #[test]
    fn test_interior_step() {
        let grid = GridSize::default();
        assert_eq!(grid.step(Cell::new(5, 15), Direction::Right), Cell::new(6, 15));
        assert_eq!(grid.step(Cell::new(5, 15), Direction::Up), Cell::new(5, 14));
    }

    #[test]
    fn test_opposite() {
        assert_eq!(Direction::Up.opposite(), Direction::Down);
        assert_eq!(Direction::Left.opposite(), Direction::Right);
        assert_eq!(Direction::Right.opposite().opposite(), Direction::Right);
    }

    #[test]
    fn test_direction_wire_names() {
        assert_eq!(serde_json::to_string(&Direction::Left).unwrap(), "\"left\"");
        assert_eq!(serde_json::from_str::<Direction>("\"down\"").unwrap(), Direction::Down);
        assert!(serde_json::from_str::<Direction>("\"DOWN\"").is_err());
    }

    #[test]
    fn test_cells_cover_board() {
        let grid = GridSize::new(3, 2);
        let cells: Vec<Cell> = grid.cells().collect();
        assert_eq!(cells.len(), 6);
        assert_eq!(cells[0], Cell::new(0, 0));
        assert_eq!(cells[5], Cell::new(2, 1));
    }

    fn any_direction() -> impl Strategy<Value = Direction> {
        prop_oneof![
            Just(Direction::Up),
            Just(Direction::Down),
            Just(Direction::Left),
            Just(Direction::Right),
        ]
    }

    proptest! {
        #[test]
        fn prop_step_stays_on_board(
            w in 1i32..64,
            h in 1i32..64,
            x in 0i32..64,
            y in 0i32..64,
            dir in any_direction(),
        ) {
            let grid = GridSize::new(w, h);
            let from = Cell::new(x % w, y % h);
            prop_assert!(grid.contains(grid.step(from, dir)));
        }

        #[test]
        fn prop_step_then_reverse_returns(
            w in 1i32..64,
            h in 1i32..64,
            x in 0i32..64,
            y in 0i32..64,
            dir in any_direction(),
        ) {
            let grid = GridSize::new(w, h);
            let from = Cell::new(x % w, y % h);
            let there = grid.step(from, dir);
            prop_assert_eq!(grid.step(there, dir.opposite()), from);
        }
    }
}

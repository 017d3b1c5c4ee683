//! Random-walk movement kinematics.
//!
//! Each position tick the taxi advances `cells_per_tick(speed)` cells in a
//! uniformly random valid cardinal direction, clamped to the grid. A taxi
//! that reaches a border after having previously been off all borders parks
//! for good (inclusive-edge convention: row/column 0 or max).

use rand::Rng;

use fleet_core::grid::Grid;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    North,
    South,
    East,
    West,
}

impl Direction {
    pub const ALL: [Direction; 4] = [
        Direction::North,
        Direction::South,
        Direction::East,
        Direction::West,
    ];
}

/// Outcome of one scheduler tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// No movement due this tick (slow taxis skip every other tick).
    Hold,
    Moved { pos_x: i64, pos_y: i64 },
    /// Final position; the publisher must halt.
    Stopped { pos_x: i64, pos_y: i64 },
}

pub fn cells_per_tick(speed: i64, move_counter: u64) -> i64 {
    match speed {
        4 => 2,
        2 => 1,
        1 => {
            if move_counter % 2 == 0 {
                1
            } else {
                0
            }
        }
        _ => 0,
    }
}

#[derive(Clone, Debug)]
pub struct Motion {
    grid: Grid,
    pub pos_x: i64,
    pub pos_y: i64,
    pub speed: i64,
    pub stopped: bool,
    move_counter: u64,
    was_off_border: bool,
}

impl Motion {
    pub fn new(grid: Grid, pos_x: i64, pos_y: i64, speed: i64) -> Self {
        Self {
            grid,
            pos_x,
            pos_y,
            speed,
            stopped: false,
            move_counter: 0,
            was_off_border: !grid.on_border(pos_x, pos_y),
        }
    }

    fn room(&self, direction: Direction) -> i64 {
        match direction {
            Direction::North => self.grid.rows - 1 - self.pos_y,
            Direction::South => self.pos_y,
            Direction::East => self.grid.cols - 1 - self.pos_x,
            Direction::West => self.pos_x,
        }
    }

    fn advance(&mut self, direction: Direction, cells: i64) {
        let cells = cells.min(self.room(direction));
        match direction {
            Direction::North => self.pos_y += cells,
            Direction::South => self.pos_y -= cells,
            Direction::East => self.pos_x += cells,
            Direction::West => self.pos_x -= cells,
        }
    }

    pub fn tick<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Step {
        if self.stopped {
            return Step::Stopped {
                pos_x: self.pos_x,
                pos_y: self.pos_y,
            };
        }

        self.move_counter += 1;
        let cells = cells_per_tick(self.speed, self.move_counter);
        if cells == 0 {
            return Step::Hold;
        }

        let options: Vec<Direction> = Direction::ALL
            .into_iter()
            .filter(|direction| self.room(*direction) > 0)
            .collect();
        let Some(&direction) = options.get(rng.random_range(0..options.len().max(1))) else {
            // Degenerate grid with nowhere to go.
            self.stopped = true;
            return Step::Stopped {
                pos_x: self.pos_x,
                pos_y: self.pos_y,
            };
        };

        self.advance(direction, cells);

        if self.grid.on_border(self.pos_x, self.pos_y) {
            if self.was_off_border {
                self.stopped = true;
                return Step::Stopped {
                    pos_x: self.pos_x,
                    pos_y: self.pos_y,
                };
            }
        } else {
            self.was_off_border = true;
        }

        Step::Moved {
            pos_x: self.pos_x,
            pos_y: self.pos_y,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn cells_per_tick_table() {
        assert_eq!(cells_per_tick(4, 1), 2);
        assert_eq!(cells_per_tick(2, 1), 1);
        assert_eq!(cells_per_tick(1, 1), 0);
        assert_eq!(cells_per_tick(1, 2), 1);
        assert_eq!(cells_per_tick(1, 3), 0);
    }

    #[test]
    fn slow_taxi_moves_every_other_tick() {
        let mut motion = Motion::new(Grid::new(100, 100), 50, 50, 1);
        let mut rng = rng();
        assert_eq!(motion.tick(&mut rng), Step::Hold);
        assert!(matches!(motion.tick(&mut rng), Step::Moved { .. }));
        assert_eq!(motion.tick(&mut rng), Step::Hold);
    }

    #[test]
    fn moves_stay_on_grid() {
        let mut motion = Motion::new(Grid::new(5, 5), 2, 2, 4);
        let grid = Grid::new(5, 5);
        let mut rng = rng();
        for _ in 0..200 {
            motion.tick(&mut rng);
            assert!(grid.contains(motion.pos_x, motion.pos_y));
            if motion.stopped {
                break;
            }
        }
    }

    #[test]
    fn stops_on_border_only_after_leaving_it() {
        // Spawned on the border: movement along or off the edge is fine, and
        // the first return to any border after leaving them all parks it.
        let mut motion = Motion::new(Grid::new(6, 6), 0, 0, 2);
        let mut rng = rng();
        let mut left_border = false;
        for _ in 0..500 {
            match motion.tick(&mut rng) {
                Step::Stopped { pos_x, pos_y } => {
                    assert!(left_border, "must not stop before leaving the border");
                    assert!(Grid::new(6, 6).on_border(pos_x, pos_y));
                    return;
                }
                Step::Moved { pos_x, pos_y } => {
                    if !Grid::new(6, 6).on_border(pos_x, pos_y) {
                        left_border = true;
                    }
                }
                Step::Hold => {}
            }
        }
        // A long random walk on a small grid practically always terminates,
        // but not stopping is not an error.
    }

    #[test]
    fn interior_spawn_counts_as_off_border() {
        let mut motion = Motion::new(Grid::new(4, 4), 2, 2, 4);
        let mut rng = rng();
        // Speed 4 moves 2 cells: from the center of a 4x4 grid every move
        // lands on a border, so the very first move parks the taxi.
        match motion.tick(&mut rng) {
            Step::Stopped { .. } => {}
            other => panic!("expected immediate border stop, got {other:?}"),
        }
        assert!(motion.stopped);
    }
}

//! Cells and tubes: the fine-grained storage inside a chunk.

use std::collections::BTreeMap;

use crate::bounds::Point;

/// One stored point: its native-coordinate position plus its packed row.
#[derive(Clone, Debug)]
pub struct Voxel {
    point: Point,
    data: Vec<u8>,
}

impl Voxel {
    pub fn new(point: Point, data: Vec<u8>) -> Voxel {
        Voxel { point, data }
    }

    pub fn point(&self) -> &Point {
        &self.point
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

/// Outcome of a tube insertion.
pub enum TubeInsert {
    /// The cell was free (or the newcomer won it); nothing left to do.
    Placed,
    /// The loser of the cell fight, to be routed to the overflow.
    Evicted(Voxel),
}

/// The z column of one `(x, y)` grid cell: a sparse map from tick to the
/// single point owning that cell.
#[derive(Default, Debug)]
pub struct Tube {
    cells: BTreeMap<u64, Voxel>,
}

fn lex(p: &Point) -> (f64, f64, f64) {
    (p.x, p.y, p.z)
}

/// True if `a` beats `b` for a cell centered at `center`: strictly closer
/// to the canonical center, with distance ties going to the
/// lexicographically smaller position. Identical positions keep the
/// incumbent.
fn wins(a: &Point, b: &Point, center: &Point) -> bool {
    let da = a.sq_dist(center);
    let db = b.sq_dist(center);
    if da != db {
        return da < db;
    }
    lex(a) < lex(b)
}

impl Tube {
    /// Claim the cell at `tick` for `voxel`, or return the loser.
    pub fn insert(&mut self, tick: u64, voxel: Voxel, center: &Point) -> TubeInsert {
        match self.cells.get_mut(&tick) {
            None => {
                self.cells.insert(tick, voxel);
                TubeInsert::Placed
            }
            Some(occupant) => {
                if wins(voxel.point(), occupant.point(), center) {
                    let evicted = std::mem::replace(occupant, voxel);
                    TubeInsert::Evicted(evicted)
                } else {
                    if voxel.point() == occupant.point() {
                        log::debug!("exact duplicate point at {:?}", voxel.point());
                    }
                    TubeInsert::Evicted(voxel)
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn cells(&self) -> impl Iterator<Item = &Voxel> {
        self.cells.values()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = Voxel> + '_ {
        std::mem::take(&mut self.cells).into_values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(x: f64, y: f64, z: f64) -> Voxel {
        Voxel::new(Point::new(x, y, z), vec![0u8; 4])
    }

    const CENTER: Point = Point {
        x: 0.5,
        y: 0.5,
        z: 0.5,
    };

    #[test]
    fn first_point_is_placed() {
        let mut tube = Tube::default();
        assert!(matches!(
            tube.insert(0, v(0.1, 0.1, 0.1), &CENTER),
            TubeInsert::Placed
        ));
        assert_eq!(tube.len(), 1);
    }

    #[test]
    fn closer_point_evicts_occupant() {
        let mut tube = Tube::default();
        tube.insert(0, v(0.1, 0.1, 0.1), &CENTER);
        match tube.insert(0, v(0.4, 0.5, 0.5), &CENTER) {
            TubeInsert::Evicted(loser) => assert_eq!(loser.point(), &Point::new(0.1, 0.1, 0.1)),
            _ => panic!("expected eviction"),
        }
        // The winner holds the cell now.
        assert_eq!(
            tube.cells().next().unwrap().point(),
            &Point::new(0.4, 0.5, 0.5)
        );
    }

    #[test]
    fn farther_point_is_bounced() {
        let mut tube = Tube::default();
        tube.insert(0, v(0.4, 0.5, 0.5), &CENTER);
        match tube.insert(0, v(0.1, 0.1, 0.1), &CENTER) {
            TubeInsert::Evicted(loser) => assert_eq!(loser.point(), &Point::new(0.1, 0.1, 0.1)),
            _ => panic!("expected eviction"),
        }
    }

    #[test]
    fn equal_distance_breaks_ties_lexicographically() {
        let mut tube = Tube::default();
        tube.insert(0, v(0.6, 0.5, 0.5), &CENTER);
        // Same distance, smaller x: wins.
        match tube.insert(0, v(0.4, 0.5, 0.5), &CENTER) {
            TubeInsert::Evicted(loser) => assert_eq!(loser.point(), &Point::new(0.6, 0.5, 0.5)),
            _ => panic!("expected eviction"),
        }
    }

    #[test]
    fn identical_points_keep_incumbent() {
        let mut tube = Tube::default();
        let mut first = v(0.3, 0.3, 0.3);
        first.data = vec![1, 1, 1, 1];
        tube.insert(0, first, &CENTER);

        let mut second = v(0.3, 0.3, 0.3);
        second.data = vec![2, 2, 2, 2];
        match tube.insert(0, second, &CENTER) {
            TubeInsert::Evicted(loser) => assert_eq!(loser.data(), &[2, 2, 2, 2]),
            _ => panic!("expected eviction"),
        }
        assert_eq!(tube.cells().next().unwrap().data(), &[1, 1, 1, 1]);
    }

    #[test]
    fn distinct_ticks_share_a_tube() {
        let mut tube = Tube::default();
        for tick in 0..4 {
            assert!(matches!(
                tube.insert(tick, v(0.5, 0.5, tick as f64), &CENTER),
                TubeInsert::Placed
            ));
        }
        assert_eq!(tube.len(), 4);
    }
}

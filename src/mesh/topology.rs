use super::{ElementKind, Mesh};
use crate::node_sets::NodeSet;

use smallvec::SmallVec;

/// Node one-ring in compressed row layout
///
/// Nodes are addressed by their position in the [`NodeSet`] the adjacency was built for, so
/// row `i` lists the positions of the neighbors of `subset[i]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Adjacency {
    offsets: Vec<usize>,
    neighbors: Vec<u32>,
}

impl Adjacency {
    /// Edge-connected neighbors through surface elements, restricted to `subset`
    pub fn of_subset(mesh: &Mesh, subset: &NodeSet) -> Self {
        let mut lists: Vec<SmallVec<[u32; 8]>> = vec![SmallVec::new(); subset.len()];

        for e in mesh.elements.iter().filter(|e| e.kind.is_surface()) {
            let n = e.nodes.len();
            for k in 0..n {
                let (a, b) = (e.nodes[k], e.nodes[(k + 1) % n]);
                if let (Some(pa), Some(pb)) = (subset.position(a), subset.position(b)) {
                    if pa != pb {
                        lists[pa].push(pb as u32);
                        lists[pb].push(pa as u32);
                    }
                }
            }
        }

        Self::from_lists(lists)
    }

    /// Pack neighbor lists; duplicates are removed
    pub fn from_lists<L: AsMut<[u32]> + AsRef<[u32]>>(mut lists: Vec<L>) -> Self {
        let mut offsets = Vec::with_capacity(lists.len() + 1);
        let mut neighbors = Vec::new();
        offsets.push(0);
        for list in lists.iter_mut() {
            let l = list.as_mut();
            l.sort_unstable();
            let start = neighbors.len();
            for &n in l.iter() {
                if neighbors.len() == start || neighbors[neighbors.len() - 1] != n {
                    neighbors.push(n);
                }
            }
            offsets.push(neighbors.len());
        }
        Self { offsets, neighbors }
    }

    pub fn len(&self) -> usize {
        self.offsets.len().saturating_sub(1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn neighbors(&self, i: usize) -> &[u32] {
        &self.neighbors[self.offsets[i]..self.offsets[i + 1]]
    }

    /// Grow a flag vector by `rings` topological rings
    pub fn grow(&self, flags: &mut [bool], rings: usize) {
        assert_eq!(flags.len(), self.len(), "flag vector does not match adjacency size");
        for _ in 0..rings {
            let front: Vec<usize> = (0..self.len()).filter(|&i| flags[i]).collect();
            let mut changed = false;
            for i in front {
                for &j in self.neighbors(i) {
                    if !flags[j as usize] {
                        flags[j as usize] = true;
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }
    }
}

/// Union-find over element indices
struct DisjointSets {
    parent: Vec<u32>,
    rank: Vec<u8>,
}

impl DisjointSets {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n as u32).collect(),
            rank: vec![0; n],
        }
    }

    fn find(&mut self, mut x: u32) -> u32 {
        while self.parent[x as usize] != x {
            let grand = self.parent[self.parent[x as usize] as usize];
            self.parent[x as usize] = grand;
            x = grand;
        }
        x
    }

    fn union(&mut self, a: u32, b: u32) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        match self.rank[ra as usize].cmp(&self.rank[rb as usize]) {
            std::cmp::Ordering::Less => self.parent[ra as usize] = rb,
            std::cmp::Ordering::Greater => self.parent[rb as usize] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb as usize] = ra;
                self.rank[ra as usize] += 1;
            }
        }
    }
}

impl Mesh {
    /// Edge one-ring of every node in `subset` (see [`Adjacency::of_subset`])
    pub fn node_adjacency(&self, subset: &NodeSet) -> Adjacency {
        Adjacency::of_subset(self, subset)
    }

    /// Connected components of the element graph, never joining elements of different kinds
    ///
    /// Two elements are connected when they share a node and have the same [`ElementKind`], so
    /// connectors (rigid elements, beams) do not bridge otherwise separate shell parts.
    /// Returns the component id of every element and the number of components.
    pub fn element_components(&self) -> (Vec<u32>, usize) {
        let mut sets = DisjointSets::new(self.elements.len());
        let mut first_seen: Vec<SmallVec<[(ElementKind, u32); 2]>> =
            vec![SmallVec::new(); self.nodes.len()];

        for (id, e) in self.elements.iter().enumerate() {
            for &n in e.nodes.iter() {
                let seen = &mut first_seen[n as usize];
                match seen.iter().find(|(kind, _)| *kind == e.kind) {
                    Some(&(_, other)) => sets.union(other, id as u32),
                    None => seen.push((e.kind, id as u32)),
                }
            }
        }

        let mut label = vec![u32::MAX; self.elements.len()];
        let mut components = Vec::with_capacity(self.elements.len());
        let mut count = 0;
        for id in 0..self.elements.len() as u32 {
            let root = sets.find(id) as usize;
            if label[root] == u32::MAX {
                label[root] = count;
                count += 1;
            }
            components.push(label[root]);
        }

        (components, count as usize)
    }
}

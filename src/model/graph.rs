//! Per-sample candidate graph as flat index arrays.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Neighbour list of one node; most clusters have few candidates.
pub type Neighbors = SmallVec<[usize; 8]>;

/// Undirected graph over `0..num_nodes`.
///
/// Edges are stored once as `(i, j)` with `i < j`, sorted ascending and
/// free of duplicates, so `(i, j) ≡ (j, i)` by construction and iteration
/// order is canonical.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Graph {
    num_nodes: usize,
    edges: Vec<(usize, usize)>,
}

impl Graph {
    pub fn empty(num_nodes: usize) -> Self {
        Self { num_nodes, edges: Vec::new() }
    }

    /// Canonicalize arbitrary pairs: orient `i < j`, drop self loops and
    /// out-of-range indices, sort, dedup.
    pub fn from_edges(num_nodes: usize, edges: impl IntoIterator<Item = (usize, usize)>) -> Self {
        let mut edges: Vec<(usize, usize)> = edges
            .into_iter()
            .filter(|&(i, j)| i != j && i < num_nodes && j < num_nodes)
            .map(|(i, j)| if i < j { (i, j) } else { (j, i) })
            .collect();
        edges.sort_unstable();
        edges.dedup();
        Self { num_nodes, edges }
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    pub fn edges(&self) -> &[(usize, usize)] {
        &self.edges
    }

    pub fn contains(&self, i: usize, j: usize) -> bool {
        let key = if i < j { (i, j) } else { (j, i) };
        self.edges.binary_search(&key).is_ok()
    }

    /// Position of the edge in canonical order.
    pub fn edge_index(&self, i: usize, j: usize) -> Option<usize> {
        let key = if i < j { (i, j) } else { (j, i) };
        self.edges.binary_search(&key).ok()
    }

    /// Neighbour lists, each sorted ascending.
    pub fn adjacency(&self) -> Vec<Neighbors> {
        let mut adj = vec![Neighbors::new(); self.num_nodes];
        for &(i, j) in &self.edges {
            adj[i].push(j);
            adj[j].push(i);
        }
        for list in &mut adj {
            list.sort_unstable();
        }
        adj
    }

    pub fn degree(&self, node: usize) -> usize {
        self.edges.iter().filter(|&&(i, j)| i == node || j == node).count()
    }

    /// Connected components over the edges for which `keep(edge_index)` is
    /// true. Returns one component id per node; ids are numbered in order
    /// of each component's smallest node.
    pub fn components(&self, keep: impl Fn(usize) -> bool) -> Vec<usize> {
        let n = self.num_nodes;
        let mut parent: Vec<usize> = (0..n).collect();
        let mut rank: Vec<usize> = vec![0; n];
        for (e, &(i, j)) in self.edges.iter().enumerate() {
            if keep(e) {
                uf_union(&mut parent, &mut rank, i, j);
            }
        }

        let mut ids = vec![usize::MAX; n];
        let mut root_id = vec![usize::MAX; n];
        let mut next = 0;
        for node in 0..n {
            let root = uf_find(&mut parent, node);
            if root_id[root] == usize::MAX {
                root_id[root] = next;
                next += 1;
            }
            ids[node] = root_id[root];
        }
        ids
    }
}

pub(crate) fn uf_find(parent: &mut [usize], i: usize) -> usize {
    if parent[i] != i {
        parent[i] = uf_find(parent, parent[i]);
    }
    parent[i]
}

/// Union by rank; returns false when `x` and `y` were already joined.
pub(crate) fn uf_union(parent: &mut [usize], rank: &mut [usize], x: usize, y: usize) -> bool {
    let px = uf_find(parent, x);
    let py = uf_find(parent, y);
    if px == py {
        return false;
    }
    match rank[px].cmp(&rank[py]) {
        Ordering::Less => parent[px] = py,
        Ordering::Greater => parent[py] = px,
        Ordering::Equal => {
            parent[py] = px;
            rank[px] += 1;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_edges_canonicalizes() {
        let g = Graph::from_edges(4, [(2, 1), (1, 2), (0, 0), (3, 0), (0, 9)]);
        assert_eq!(g.edges(), &[(0, 3), (1, 2)]);
        assert!(g.contains(3, 0));
        assert_eq!(g.edge_index(2, 1), Some(1));
    }

    #[test]
    fn test_components_respect_mask() {
        let g = Graph::from_edges(5, [(0, 1), (1, 2), (3, 4)]);
        assert_eq!(g.components(|_| true), vec![0, 0, 0, 1, 1]);
        // Drop (1, 2): node 2 becomes its own component.
        assert_eq!(g.components(|e| e != 1), vec![0, 0, 1, 2, 2]);
    }

    #[test]
    fn test_adjacency_lists() {
        let g = Graph::from_edges(3, [(0, 2), (0, 1)]);
        let adj = g.adjacency();
        assert_eq!(adj[0].as_slice(), &[1, 2]);
        assert_eq!(adj[2].as_slice(), &[0]);
        assert_eq!(g.degree(0), 2);
    }
}

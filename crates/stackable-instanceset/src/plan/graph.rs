//! A minimal directed acyclic graph used to order instance updates.
//!
//! Vertex `0` is always the root. Every other vertex holds an item (an instance). Edges point
//! from instances which have to be updated first to instances which may be updated afterwards.

/// What a walk should do after visiting a vertex.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WalkOutcome {
    /// Go on with the walk.
    Continue,

    /// Finish the current level, but do not descend any further.
    Wait,

    /// Finish the current level, but do not descend any further. The visited vertex has been
    /// selected for an update.
    Stop,
}

#[derive(Debug)]
pub struct UpdateGraph<T> {
    items: Vec<Option<T>>,
    edges: Vec<Vec<usize>>,
}

impl<T> Default for UpdateGraph<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> UpdateGraph<T> {
    pub const ROOT: usize = 0;

    pub fn new() -> Self {
        Self {
            items: vec![None],
            edges: vec![Vec::new()],
        }
    }

    pub fn add_vertex(&mut self, item: T) -> usize {
        self.items.push(Some(item));
        self.edges.push(Vec::new());
        self.items.len() - 1
    }

    /// Adds an edge. Edges referring to unknown vertices are ignored.
    pub fn connect(&mut self, from: usize, to: usize) {
        let vertices = self.items.len();
        let Some(edges) = self.edges.get_mut(from) else {
            return;
        };
        if to < vertices && !edges.contains(&to) {
            edges.push(to);
        }
    }

    /// Number of vertices, including the root.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.len() <= 1
    }

    /// Walks the graph breadth-first, one level at a time.
    ///
    /// Every vertex of a level is visited, even if an earlier vertex of the same level returned
    /// [`WalkOutcome::Wait`] or [`WalkOutcome::Stop`]. The walk ends after the first level which
    /// did not [continue](WalkOutcome::Continue) in its entirety. Errors abort the walk
    /// immediately.
    pub fn walk_bfs<E>(
        &self,
        mut visit: impl FnMut(&T) -> Result<WalkOutcome, E>,
    ) -> Result<(), E> {
        let mut visited = vec![false; self.items.len()];
        visited[Self::ROOT] = true;
        let mut level = vec![Self::ROOT];

        while !level.is_empty() {
            let mut halt = false;
            for &vertex in &level {
                let Some(item) = &self.items[vertex] else {
                    continue;
                };
                if visit(item)? != WalkOutcome::Continue {
                    halt = true;
                }
            }

            if halt {
                return Ok(());
            }

            let mut next = Vec::new();
            for &vertex in &level {
                for &child in &self.edges[vertex] {
                    if !visited[child] {
                        visited[child] = true;
                        next.push(child);
                    }
                }
            }
            level = next;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use super::*;

    /// root -> a -> {b, c} -> d
    fn diamond() -> UpdateGraph<&'static str> {
        let mut graph = UpdateGraph::new();
        let a = graph.add_vertex("a");
        let b = graph.add_vertex("b");
        let c = graph.add_vertex("c");
        let d = graph.add_vertex("d");
        graph.connect(UpdateGraph::<&str>::ROOT, a);
        graph.connect(a, b);
        graph.connect(a, c);
        graph.connect(b, d);
        graph.connect(c, d);
        graph
    }

    fn walk(
        graph: &UpdateGraph<&'static str>,
        outcome: impl Fn(&str) -> WalkOutcome,
    ) -> Vec<&'static str> {
        let mut visited = Vec::new();
        graph
            .walk_bfs(|item| {
                visited.push(*item);
                Ok::<_, Infallible>(outcome(item))
            })
            .unwrap();
        visited
    }

    #[test]
    fn visits_every_vertex_once() {
        assert_eq!(walk(&diamond(), |_| WalkOutcome::Continue), vec![
            "a", "b", "c", "d"
        ]);
    }

    #[test]
    fn finishes_level_before_stopping() {
        let visited = walk(&diamond(), |item| match item {
            "b" => WalkOutcome::Stop,
            _ => WalkOutcome::Continue,
        });

        assert_eq!(visited, vec!["a", "b", "c"]);
    }

    #[test]
    fn wait_stops_descending() {
        let visited = walk(&diamond(), |item| match item {
            "a" => WalkOutcome::Wait,
            _ => WalkOutcome::Continue,
        });

        assert_eq!(visited, vec!["a"]);
    }

    #[test]
    fn errors_abort_immediately() {
        let graph = diamond();
        let mut visited = Vec::new();

        let result = graph.walk_bfs(|item| {
            visited.push(*item);
            if *item == "b" {
                Err("boom")
            } else {
                Ok(WalkOutcome::Continue)
            }
        });

        assert_eq!(result, Err("boom"));
        assert_eq!(visited, vec!["a", "b"]);
    }

    #[test]
    fn ignores_unknown_vertices() {
        let mut graph = UpdateGraph::new();
        let a = graph.add_vertex("a");
        graph.connect(UpdateGraph::<&str>::ROOT, a);
        graph.connect(a, 42);
        graph.connect(42, a);

        assert_eq!(graph.len(), 2);
        assert_eq!(walk(&graph, |_| WalkOutcome::Continue), vec!["a"]);
    }
}

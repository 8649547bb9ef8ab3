use crate::back::Backend;
use crate::eval::Graph;
use crate::ten::Component;
use fnv::FnvHashMap;
use petgraph::dot::{Config, Dot};
use petgraph::graph::DiGraph;

impl<B: Backend> Graph<B> {
    /// Graphviz rendering of the components and their dependency edges.
    pub fn to_dot(&self) -> String {
        let mut g = DiGraph::<String, &str>::new();
        let mut index = FnvHashMap::default();
        for c in &self.components {
            let label = match c {
                Component::Node(_) => self.describe(*c).detail,
                Component::Connection(_) => {
                    let d = self.describe(*c);
                    format!("{}: {}", d.name, d.detail)
                }
            };
            index.insert(*c, g.add_node(label));
        }
        for (s, t) in &self.edges {
            g.add_edge(index[s], index[t], "");
        }
        format!("{}", Dot::with_config(&g, &[Config::EdgeNoLabel]))
    }
}

#[cfg(test)]
mod test {
    use crate::back::cpu::CpuBackend;
    use crate::eval::Graph;
    use crate::ten::{NodeSpec, NodeType};

    #[test]
    fn test_dot_lists_components_and_edges() {
        let mut g = Graph::new(CpuBackend::new());
        g.create_node("X", NodeSpec::new(3, 2, NodeType::Input), None)
            .unwrap();
        g.create_node("Y", NodeSpec::new(3, 2, NodeType::Output), None)
            .unwrap();
        g.relu("X", "Y").unwrap();

        let dot = g.to_dot();
        assert!(dot.starts_with("digraph"));
        assert!(dot.contains("X : matrix 2x3"));
        assert!(dot.contains("relu#0: Y = relu(X)"));
        assert_eq!(dot.matches("->").count(), 2);
    }
}

use crate::ten::Component;
use fnv::{FnvHashMap, FnvHashSet};

/// Create a topological sort of the components.
///
/// Components are visited in the given order and each one's sources in edge
/// insertion order, so equal inputs give equal outputs. On a cycle the
/// component that was reached twice on the current path is returned.
pub fn topo(
    components: &[Component],
    edges: &[(Component, Component)],
) -> Result<Vec<Component>, Component> {
    let mut sources: FnvHashMap<Component, Vec<Component>> = FnvHashMap::default();
    for (s, t) in edges {
        sources.entry(*t).or_default().push(*s);
    }

    let mut visiting = FnvHashSet::default();
    let mut visited = FnvHashSet::default();
    let mut l = Vec::with_capacity(components.len());
    // Depth first with an explicit stack of (component, next source index)
    let mut stack: Vec<(Component, usize)> = vec![];
    for c in components {
        if visited.contains(c) {
            continue;
        }
        visiting.insert(*c);
        stack.push((*c, 0));
        while let Some((c, i)) = stack.last_mut() {
            let next = sources.get(&*c).and_then(|s| s.get(*i)).copied();
            *i += 1;
            match next {
                Some(s) if visited.contains(&s) => {}
                Some(s) => {
                    // Back edge
                    if !visiting.insert(s) {
                        return Err(s);
                    }
                    stack.push((s, 0));
                }
                None => {
                    let c = *c;
                    stack.pop();
                    visiting.remove(&c);
                    visited.insert(c);
                    l.push(c);
                }
            }
        }
    }
    Ok(l)
}

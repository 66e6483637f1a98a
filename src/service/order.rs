//! Dependency ordering over the service graph.
//!
//! Both functions are pure: they take a snapshot of `(name, dependencies)`
//! pairs in registration order and never touch manager state, so they can be
//! called repeatedly and tested in isolation.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use crate::errors::ServiceError;

/// One node of the service graph: a name and the names it depends on.
pub type Node = (String, Vec<String>);

fn index_nodes(nodes: &[Node]) -> Result<(HashMap<&str, usize>, Vec<Vec<usize>>), ServiceError> {
    let index: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, (name, _))| (name.as_str(), i))
        .collect();
    let mut deps = Vec::with_capacity(nodes.len());
    for (name, dependencies) in nodes {
        let mut resolved = Vec::with_capacity(dependencies.len());
        for dep in dependencies {
            let &j = index
                .get(dep.as_str())
                .ok_or_else(|| ServiceError::MissingDependency {
                    service: name.clone(),
                    dependency: dep.clone(),
                })?;
            if !resolved.contains(&j) {
                resolved.push(j);
            }
        }
        deps.push(resolved);
    }
    Ok((index, deps))
}

/// Kahn's algorithm with registration order as the tie-break: among services
/// whose dependencies are all placed, the earliest registered goes next.
///
/// Fails with [`ServiceError::Cycle`] naming the members of one cycle, or
/// [`ServiceError::MissingDependency`] for an unregistered dependency.
pub fn startup_order(nodes: &[Node]) -> Result<Vec<String>, ServiceError> {
    let (_, deps) = index_nodes(nodes)?;
    let n = nodes.len();
    let mut pending: Vec<usize> = deps.iter().map(Vec::len).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, ds) in deps.iter().enumerate() {
        for &d in ds {
            dependents[d].push(i);
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = pending
        .iter()
        .enumerate()
        .filter(|&(_, &count)| count == 0)
        .map(|(i, _)| Reverse(i))
        .collect();
    let mut order = Vec::with_capacity(n);
    while let Some(Reverse(i)) = ready.pop() {
        order.push(i);
        for &dependent in &dependents[i] {
            pending[dependent] -= 1;
            if pending[dependent] == 0 {
                ready.push(Reverse(dependent));
            }
        }
    }

    if order.len() < n {
        let blocked: Vec<bool> = pending.iter().map(|&c| c > 0).collect();
        let members = find_cycle(&deps, &blocked)
            .into_iter()
            .map(|i| nodes[i].0.clone())
            .collect();
        return Err(ServiceError::Cycle { members });
    }
    Ok(order.into_iter().map(|i| nodes[i].0.clone()).collect())
}

/// `target` and everything it transitively depends on, dependencies first.
pub fn dependency_closure(nodes: &[Node], target: &str) -> Result<Vec<String>, ServiceError> {
    let (index, deps) = index_nodes(nodes)?;
    let &root = index
        .get(target)
        .ok_or_else(|| ServiceError::Unknown(target.to_string()))?;

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        New,
        Active,
        Done,
    }
    let mut marks = vec![Mark::New; nodes.len()];
    let mut out = Vec::new();
    // Explicit stack of (node, next dependency position) keeps deep graphs off the call stack.
    let mut stack = vec![(root, 0usize)];
    marks[root] = Mark::Active;
    while let Some(top) = stack.last_mut() {
        let node = top.0;
        if let Some(&dep) = deps[node].get(top.1) {
            top.1 += 1;
            match marks[dep] {
                Mark::New => {
                    marks[dep] = Mark::Active;
                    stack.push((dep, 0));
                }
                Mark::Active => {
                    let start = stack.iter().position(|&(n, _)| n == dep).unwrap_or(0);
                    let members = stack[start..]
                        .iter()
                        .map(|&(n, _)| nodes[n].0.clone())
                        .collect();
                    return Err(ServiceError::Cycle { members });
                }
                Mark::Done => {}
            }
        } else {
            marks[node] = Mark::Done;
            out.push(nodes[node].0.clone());
            stack.pop();
        }
    }
    Ok(out)
}

/// Locate one cycle among the `blocked` nodes (those Kahn's algorithm could not place).
fn find_cycle(deps: &[Vec<usize>], blocked: &[bool]) -> Vec<usize> {
    let mut visited = vec![false; deps.len()];
    for start in 0..deps.len() {
        if !blocked[start] || visited[start] {
            continue;
        }
        let mut path: Vec<usize> = Vec::new();
        let mut on_path = vec![false; deps.len()];
        let mut node = start;
        // Every blocked node has at least one blocked dependency, so following
        // the first blocked edge must eventually revisit a node on the path.
        loop {
            if on_path[node] {
                let from = path.iter().position(|&n| n == node).unwrap_or(0);
                return path[from..].to_vec();
            }
            if visited[node] {
                break;
            }
            visited[node] = true;
            on_path[node] = true;
            path.push(node);
            match deps[node].iter().copied().find(|&d| blocked[d]) {
                Some(next) => node = next,
                None => break,
            }
        }
    }
    Vec::new()
}

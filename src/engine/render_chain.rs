//! Execution order for one audio period.
//!
//! The chain is rebuilt whenever the topology changes by walking dependencies
//! backward from the sink. Every machine appears after all machines it consumes
//! from, and machines the sink cannot reach are left out.

use std::collections::HashSet;

use super::arena::MachineId;

/// The ordered list of machines executed each period.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RenderChain {
    order: Vec<MachineId>,
}

impl RenderChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recomputes the order from `sink`.
    ///
    /// `dependencies` returns the machines a machine consumes from. The graph
    /// must be acyclic; a machine already on the walk is not revisited.
    pub fn rebuild<F, I>(&mut self, sink: Option<MachineId>, dependencies: F)
    where
        F: Fn(MachineId) -> I,
        I: IntoIterator<Item = MachineId>,
    {
        self.order.clear();
        let Some(sink) = sink else {
            return;
        };

        let mut seen = HashSet::new();
        // Post-order walk: (machine, its dependencies, next dependency to visit).
        let mut stack: Vec<(MachineId, Vec<MachineId>, usize)> = Vec::new();
        seen.insert(sink);
        stack.push((sink, dependencies(sink).into_iter().collect(), 0));

        while let Some((id, deps, next)) = stack.last_mut() {
            if let Some(&dep) = deps.get(*next) {
                *next += 1;
                if seen.insert(dep) {
                    let dep_deps = dependencies(dep).into_iter().collect();
                    stack.push((dep, dep_deps, 0));
                }
            } else {
                self.order.push(*id);
                stack.pop();
            }
        }
    }

    pub fn clear(&mut self) {
        self.order.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = MachineId> + '_ {
        self.order.iter().copied()
    }

    pub fn as_slice(&self) -> &[MachineId] {
        &self.order
    }

    pub fn contains(&self, id: MachineId) -> bool {
        self.order.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Returns true if `target` is `start` or can be reached from it by following dependencies.
pub fn depends_on<F, I>(start: MachineId, target: MachineId, dependencies: F) -> bool
where
    F: Fn(MachineId) -> I,
    I: IntoIterator<Item = MachineId>,
{
    let mut seen = HashSet::new();
    let mut pending = vec![start];
    while let Some(id) = pending.pop() {
        if id == target {
            return true;
        }
        if seen.insert(id) {
            pending.extend(dependencies(id));
        }
    }
    false
}

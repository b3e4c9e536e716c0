//! Inter-stage dependency resolution.
//!
//! One walk over the stages collects the edges a stage has to earlier
//! stages — `FROM <stage>`, `COPY/ADD --from=<stage>`, and
//! `RUN --mount=from=<stage>` — then a reverse walk from the target marks
//! every stage the target transitively needs. Unneeded stages are
//! short-circuited by the scheduler unless the caller disabled skipping.

use std::collections::{BTreeSet, HashMap};

use kiln_script::{Instruction, Stages, expand};

use crate::options::{AdditionalContext, is_builtin_allowed_arg};
use crate::Result;

/// Dependency facts for one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageDeps {
    /// Stage name (alias or stringified index).
    pub name: String,
    /// 0-based position.
    pub position: usize,
    /// Names of earlier stages this stage consumes.
    pub needs: BTreeSet<String>,
    /// Whether the target stage transitively needs this stage.
    pub needed_by_target: bool,
}

/// The resolved dependency map for a build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyMap {
    /// Per-stage facts, indexed by position.
    pub stages: Vec<StageDeps>,
    /// Warnings for `--build-arg` values nothing consumes.
    pub unused_args: Vec<String>,
}

impl DependencyMap {
    /// Whether the stage at `position` is needed by the target.
    pub fn is_needed(&self, position: usize) -> bool {
        self.stages
            .get(position)
            .is_none_or(|stage| stage.needed_by_target)
    }
}

/// Builds the dependency map for `stages` with `target` as the goal.
///
/// `args` are the caller-supplied build args (already including the
/// TARGET* platform args); FROM targets are expanded with the stage's
/// heading args, built-in defaults, and user args, in that order.
pub fn resolve(
    stages: &Stages,
    target: usize,
    args: &HashMap<String, String>,
    contexts: &HashMap<String, AdditionalContext>,
) -> Result<DependencyMap> {
    let positions: HashMap<&str, usize> = stages
        .stages
        .iter()
        .map(|stage| (stage.name.as_str(), stage.index))
        .collect();

    let lookup = |name: &str| -> Option<String> {
        if let Some(value) = args.get(name) {
            return Some(value.clone());
        }
        stages.global_args.get(name).cloned().flatten()
    };

    let mut deps: Vec<StageDeps> = Vec::with_capacity(stages.stages.len());
    for stage in &stages.stages {
        let mut needs = BTreeSet::new();

        let base = expand(&stage.base, &lookup)?;
        add_edge(&mut needs, &base, stage.index, &positions, contexts, stages);

        for instruction in &stage.instructions {
            match instruction {
                Instruction::Copy(copy) | Instruction::Add(copy) => {
                    if let Some(from) = &copy.from {
                        let from = expand(from, &lookup)?;
                        add_edge(&mut needs, &from, stage.index, &positions, contexts, stages);
                    }
                }
                Instruction::Run(run) => {
                    for mount in &run.mounts {
                        if let Some(from) = &mount.from {
                            let from = expand(from, &lookup)?;
                            add_edge(&mut needs, &from, stage.index, &positions, contexts, stages);
                        }
                    }
                }
                _ => {}
            }
        }

        deps.push(StageDeps {
            name: stage.name.clone(),
            position: stage.index,
            needs,
            needed_by_target: false,
        });
    }

    mark_needed(&mut deps, &positions, target);

    let unused_args = collect_unused_args(stages, args);
    Ok(DependencyMap {
        stages: deps,
        unused_args,
    })
}

/// Records an edge from the current stage to `name`, when `name` resolves
/// to an earlier stage. Additional build contexts shadow stages entirely:
/// an image context replaces the target, any other context suppresses the
/// edge.
fn add_edge(
    needs: &mut BTreeSet<String>,
    name: &str,
    current: usize,
    positions: &HashMap<&str, usize>,
    contexts: &HashMap<String, AdditionalContext>,
    stages: &Stages,
) {
    if contexts.contains_key(name) {
        return;
    }
    if let Ok(index) = name.parse::<usize>() {
        if index < current {
            if let Some(stage) = stages.stages.get(index) {
                needs.insert(stage.name.clone());
            }
        }
        return;
    }
    if let Some(&position) = positions.get(name) {
        if position < current {
            needs.insert(name.to_owned());
        }
    }
}

/// Depth-first propagation of neededness from the target.
fn mark_needed(deps: &mut [StageDeps], positions: &HashMap<&str, usize>, target: usize) {
    let mut pending = vec![target];
    while let Some(position) = pending.pop() {
        let Some(stage) = deps.get_mut(position) else {
            continue;
        };
        if stage.needed_by_target {
            continue;
        }
        stage.needed_by_target = true;
        let needs: Vec<String> = stage.needs.iter().cloned().collect();
        for name in needs {
            if let Some(&needed) = positions.get(name.as_str()) {
                pending.push(needed);
            }
        }
    }
}

/// Supplied args that no ARG anywhere declares, minus the built-in
/// allowlist and globals.
fn collect_unused_args(stages: &Stages, args: &HashMap<String, String>) -> Vec<String> {
    let mut declared: BTreeSet<&str> = BTreeSet::new();
    for stage in &stages.stages {
        for instruction in &stage.instructions {
            if let Instruction::Arg(arg) = instruction {
                for (name, _) in &arg.pairs {
                    declared.insert(name);
                }
            }
        }
    }

    let mut unused: Vec<String> = args
        .keys()
        .filter(|name| {
            !is_builtin_allowed_arg(name)
                && !stages.global_args.contains_key(*name)
                && !declared.contains(name.as_str())
        })
        .cloned()
        .collect();
    unused.sort_unstable();
    unused
}

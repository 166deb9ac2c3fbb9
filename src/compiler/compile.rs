//! Workflow definition to task graph compilation

use super::error::CompileError;
use super::graph::{CompiledTaskGraph, TaskNode};
use crate::config::{EngineConfig, RetryPolicy, TaskDefinition, WorkflowDefinition};
use crate::template::{NAMESPACES, SESSION_FIELDS, TemplateEngine, suggest_correction};
use regex::Regex;
use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;

static TASK_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_-]*$").expect("task name pattern"));

/// Operators the compiler accepts, with the config keys each one requires
#[derive(Debug, Clone, Default)]
pub struct OperatorRegistry {
    operators: BTreeMap<String, Vec<String>>,
}

impl OperatorRegistry {
    /// Operators understood by the local agent
    pub fn builtin() -> Self {
        let mut registry = Self::default();
        registry.register("echo", &[]);
        registry.register("sh", &["command"]);
        registry.register("fail", &[]);
        registry.register("noop", &[]);
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, required: &[&str]) {
        self.operators.insert(
            name.into(),
            required.iter().map(|k| k.to_string()).collect(),
        );
    }

    /// Accept additional operator names with no required keys
    pub fn with_extra<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in names {
            self.operators.entry(name.into()).or_default();
        }
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.operators.contains_key(name)
    }

    pub fn required_keys(&self, name: &str) -> &[String] {
        self.operators.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn names(&self) -> Vec<&str> {
        self.operators.keys().map(String::as_str).collect()
    }
}

/// Turns workflow definitions into immutable task graphs
///
/// Compilation is pure: the same definition always yields the same graph.
pub struct Compiler {
    operators: OperatorRegistry,
    templates: TemplateEngine,
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new(OperatorRegistry::builtin())
    }
}

impl Compiler {
    pub fn new(operators: OperatorRegistry) -> Self {
        Self {
            operators,
            templates: TemplateEngine::new(),
        }
    }

    /// Built-in operators plus `[operators] extra`
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(OperatorRegistry::builtin().with_extra(config.operators.extra.iter().cloned()))
    }

    pub fn operators(&self) -> &OperatorRegistry {
        &self.operators
    }

    pub fn compile(&self, def: &WorkflowDefinition) -> Result<CompiledTaskGraph, CompileError> {
        if !TASK_NAME.is_match(&def.name) {
            return Err(CompileError::InvalidName {
                name: def.name.clone(),
                parent: "workflow".into(),
            });
        }

        if let Some(rule) = &def.schedule {
            rule.validate()
                .map_err(|reason| CompileError::InvalidSchedule {
                    workflow: def.name.clone(),
                    reason,
                })?;
        }

        let root = def.root();
        let inherited = def.retry.clone().unwrap_or_default();
        let mut nodes = Vec::new();
        self.flatten(&root, None, false, &inherited, &def.site, &mut nodes)?;

        link_upstream(&mut nodes);
        link_error_handlers(&mut nodes);

        let graph = CompiledTaskGraph {
            workflow: def.name.clone(),
            revision: def.revision.clone().unwrap_or_else(|| "unversioned".into()),
            site: def.site.clone(),
            variables: def.variables.clone(),
            nodes,
        };

        for node in graph.operator_tasks() {
            self.check_references(&graph, node)?;
        }

        Ok(graph)
    }

    /// Append `def` and its subtree to `nodes` in pre-order, returning its index
    fn flatten(
        &self,
        def: &TaskDefinition,
        parent: Option<usize>,
        is_error_branch: bool,
        inherited_retry: &RetryPolicy,
        inherited_site: &str,
        nodes: &mut Vec<TaskNode>,
    ) -> Result<usize, CompileError> {
        let index = nodes.len();
        let full_name = match parent {
            Some(p) => format!("{}+{}", nodes[p].full_name, def.name),
            None => format!("+{}", def.name),
        };

        if let Some(operator) = &def.operator {
            if !def.tasks.is_empty() || def.on_error.is_some() {
                return Err(CompileError::invalid_task(
                    &full_name,
                    "a task has either an operator or child tasks, not both",
                ));
            }
            if def.parallel {
                return Err(CompileError::invalid_task(
                    &full_name,
                    "parallel applies to groups only",
                ));
            }
            if !self.operators.contains(operator) {
                return Err(CompileError::UnknownOperator {
                    task: full_name,
                    operator: operator.clone(),
                    suggestion: suggest_correction(operator, &self.operators.names()),
                });
            }
            if let Some(key) = self
                .operators
                .required_keys(operator)
                .iter()
                .find(|k| !def.config.contains_key(k))
            {
                return Err(CompileError::MissingConfig {
                    task: full_name,
                    operator: operator.clone(),
                    key: key.clone(),
                });
            }
        } else if !def.config.is_empty() {
            return Err(CompileError::invalid_task(
                &full_name,
                "config requires an operator",
            ));
        }

        let retry = def.retry.clone().unwrap_or_else(|| inherited_retry.clone());
        validate_retry(&full_name, &retry)?;
        let site = def.site.clone().unwrap_or_else(|| inherited_site.to_string());

        let mut seen = HashSet::new();
        for child in def.tasks.iter().chain(def.on_error.as_deref()) {
            if !TASK_NAME.is_match(&child.name) {
                return Err(CompileError::InvalidName {
                    name: child.name.clone(),
                    parent: full_name,
                });
            }
            if !seen.insert(child.name.as_str()) {
                return Err(CompileError::DuplicateTask {
                    name: child.name.clone(),
                    parent: full_name,
                });
            }
        }

        nodes.push(TaskNode {
            index,
            name: def.name.clone(),
            full_name,
            parent,
            children: Vec::new(),
            error_child: None,
            operator: def.operator.clone(),
            config: def.config.clone(),
            retry: retry.clone(),
            parallel: def.parallel,
            is_error_branch,
            site: site.clone(),
            upstream: Vec::new(),
            error_handler: None,
        });

        for child in &def.tasks {
            let c = self.flatten(child, Some(index), is_error_branch, &retry, &site, nodes)?;
            nodes[index].children.push(c);
        }
        if let Some(handler) = &def.on_error {
            let e = self.flatten(handler, Some(index), true, &retry, &site, nodes)?;
            nodes[index].children.push(e);
            nodes[index].error_child = Some(e);
        }

        Ok(index)
    }

    fn check_references(
        &self,
        graph: &CompiledTaskGraph,
        node: &TaskNode,
    ) -> Result<(), CompileError> {
        let upstream: Vec<&str> = node
            .upstream
            .iter()
            .map(|i| graph.nodes[*i].name.as_str())
            .collect();
        let declared: Vec<&str> = graph.variables.keys().map(String::as_str).collect();

        for (key, value) in node.config.iter() {
            let mut strings = Vec::new();
            value.for_each_str(&mut |s| strings.push(s));

            for s in strings {
                let refs = self.templates.references(s).map_err(|source| {
                    CompileError::InvalidTemplate {
                        task: node.full_name.clone(),
                        key: key.clone(),
                        source,
                    }
                })?;

                for r in refs {
                    let name = r.name.as_deref();
                    match (r.namespace.as_str(), name) {
                        ("vars", None) | ("session", None) => {}
                        ("vars", Some(v)) if declared.contains(&v) => {}
                        ("vars", Some(v)) => {
                            return Err(CompileError::UndeclaredVariable {
                                task: node.full_name.clone(),
                                variable: format!("vars.{}", v),
                                suggestion: suggest_correction(v, &declared),
                            });
                        }
                        ("session", Some(f)) if SESSION_FIELDS.contains(&f) => {}
                        ("session", Some(f)) => {
                            return Err(CompileError::UndeclaredVariable {
                                task: node.full_name.clone(),
                                variable: format!("session.{}", f),
                                suggestion: suggest_correction(f, SESSION_FIELDS),
                            });
                        }
                        ("tasks", Some(t)) if upstream.contains(&t) => {}
                        ("tasks", _) => {
                            return Err(CompileError::UnresolvableReference {
                                task: node.full_name.clone(),
                                reference: match name {
                                    Some(t) => format!("tasks.{}", t),
                                    None => "tasks".into(),
                                },
                            });
                        }
                        (other, _) => {
                            return Err(CompileError::UndeclaredVariable {
                                task: node.full_name.clone(),
                                variable: other.to_string(),
                                suggestion: suggest_correction(other, NAMESPACES),
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

fn validate_retry(task: &str, retry: &RetryPolicy) -> Result<(), CompileError> {
    if retry.max_attempts == 0 {
        return Err(CompileError::invalid_retry(task, "max_attempts must be at least 1"));
    }
    if !retry.multiplier.is_finite() || retry.multiplier < 1.0 {
        return Err(CompileError::invalid_retry(task, "multiplier must be >= 1.0"));
    }
    if retry.max_interval_ms < retry.interval_ms {
        return Err(CompileError::invalid_retry(
            task,
            "max_interval_ms must not be below interval_ms",
        ));
    }
    Ok(())
}

/// Operator nodes in the regular subtree of `index`, in pre-order
fn collect_operators(nodes: &[TaskNode], index: usize, out: &mut Vec<usize>) {
    let node = &nodes[index];
    if !node.is_group() {
        out.push(index);
    }
    for child in node.regular_children() {
        collect_operators(nodes, child, out);
    }
}

/// Fill `upstream`: the parent's upstream, then earlier serial siblings
fn link_upstream(nodes: &mut [TaskNode]) {
    for index in 1..nodes.len() {
        let Some(parent) = nodes[index].parent else {
            continue;
        };
        let mut upstream = nodes[parent].upstream.clone();

        let p = &nodes[parent];
        if !p.parallel && p.error_child != Some(index) {
            let earlier: Vec<usize> = p.regular_children().take_while(|c| *c != index).collect();
            for sibling in earlier {
                collect_operators(nodes, sibling, &mut upstream);
            }
        }
        nodes[index].upstream = upstream;
    }
}

/// Fill `error_handler`: the on-error child of the nearest ancestor whose
/// regular subtree contains the node
fn link_error_handlers(nodes: &mut [TaskNode]) {
    for index in 1..nodes.len() {
        let mut child = index;
        let mut current = nodes[index].parent;
        while let Some(ancestor) = current {
            match nodes[ancestor].error_child {
                Some(e) if e != child => {
                    nodes[index].error_handler = Some(e);
                    break;
                }
                _ => {
                    child = ancestor;
                    current = nodes[ancestor].parent;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigMap;
    use crate::trigger::RecurrenceRule;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn echo(name: &str) -> TaskDefinition {
        TaskDefinition::task(name, "echo")
    }

    fn echo_msg(name: &str, message: &str) -> TaskDefinition {
        echo(name).with_config(ConfigMap::new().with("message", message))
    }

    fn compile(def: &WorkflowDefinition) -> Result<CompiledTaskGraph, CompileError> {
        Compiler::default().compile(def)
    }

    #[test]
    fn test_linear_workflow() {
        let def = WorkflowDefinition::new("etl", vec![echo("a"), echo("b"), echo("c")]);
        let graph = compile(&def).unwrap();

        assert_eq!(graph.len(), 4);
        assert!(graph.root().is_group());
        assert_eq!(graph.root().full_name, "+etl");
        assert_eq!(graph.root().children, vec![1, 2, 3]);
        assert_eq!(graph.nodes[2].full_name, "+etl+b");
        assert_eq!(graph.nodes[2].parent, Some(0));
        assert_eq!(graph.nodes[3].upstream, vec![1, 2]);
        assert_eq!(graph.nodes[1].upstream, Vec::<usize>::new());
        assert_eq!(graph.revision, "unversioned");
    }

    #[test]
    fn test_nested_groups_pre_order() {
        let def = WorkflowDefinition::new(
            "wf",
            vec![
                echo("a"),
                TaskDefinition::group("g", vec![echo("x"), echo("y")]).with_on_error(echo("alert")),
                echo("b"),
            ],
        )
        .with_on_error(echo("notify"));
        let graph = compile(&def).unwrap();

        let names: Vec<&str> = graph.nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["wf", "a", "g", "x", "y", "alert", "b", "notify"]);

        let g = graph.find("+wf+g").unwrap();
        assert_eq!(g.children, vec![3, 4, 5]);
        assert_eq!(g.error_child, Some(5));
        assert_eq!(g.regular_children().collect::<Vec<_>>(), vec![3, 4]);
        assert_eq!(graph.root().error_child, Some(7));

        assert!(graph.nodes[5].is_error_branch);
        assert!(graph.nodes[7].is_error_branch);
        assert!(!graph.nodes[4].is_error_branch);

        // Nearest enclosing handler catches the failure
        assert_eq!(graph.nodes[3].error_handler, Some(5));
        assert_eq!(graph.nodes[1].error_handler, Some(7));
        assert_eq!(graph.nodes[2].error_handler, Some(7));
        // A failing handler escalates to the outer handler
        assert_eq!(graph.nodes[5].error_handler, Some(7));
        assert_eq!(graph.nodes[7].error_handler, None);
        assert_eq!(graph.root().error_handler, None);
    }

    #[test]
    fn test_upstream_through_groups() {
        let def = WorkflowDefinition::new(
            "wf",
            vec![
                TaskDefinition::group("g", vec![echo("x"), echo("y")]).with_on_error(echo("alert")),
                TaskDefinition::group("h", vec![echo("z")]),
            ],
        );
        let graph = compile(&def).unwrap();

        let y = graph.find("+wf+g+y").unwrap();
        assert_eq!(y.upstream, vec![2]);
        // Error branch does not see earlier siblings of the group
        let alert = graph.find("+wf+g+alert").unwrap();
        assert!(alert.upstream.is_empty());
        // z sees g's operator descendants but not g's on-error branch
        let z = graph.find("+wf+h+z").unwrap();
        assert_eq!(z.upstream, vec![2, 3]);
    }

    #[test]
    fn test_parallel_children_do_not_see_each_other() {
        let def = WorkflowDefinition::new(
            "wf",
            vec![
                echo("a"),
                TaskDefinition::group("p", vec![echo("x"), echo("y")]).parallel(),
            ],
        );
        let graph = compile(&def).unwrap();
        assert_eq!(graph.find("+wf+p+y").unwrap().upstream, vec![1]);
    }

    #[test]
    fn test_reference_to_earlier_sibling() {
        let def = WorkflowDefinition::new(
            "wf",
            vec![echo("a"), echo_msg("b", "got {{ tasks.a.message }}")],
        );
        assert!(compile(&def).is_ok());
    }

    #[test]
    fn test_reference_to_later_sibling_rejected() {
        let def = WorkflowDefinition::new(
            "wf",
            vec![echo_msg("a", "{{ tasks.b.message }}"), echo("b")],
        );
        let err = compile(&def).unwrap_err();
        assert!(matches!(
            err,
            CompileError::UnresolvableReference { ref reference, .. } if reference == "tasks.b"
        ));
    }

    #[test]
    fn test_reference_to_parallel_sibling_rejected() {
        let def = WorkflowDefinition::new(
            "wf",
            vec![
                TaskDefinition::group("p", vec![echo("x"), echo_msg("y", "{{ tasks.x.message }}")])
                    .parallel(),
            ],
        );
        assert!(matches!(
            compile(&def),
            Err(CompileError::UnresolvableReference { .. })
        ));
    }

    #[test]
    fn test_error_branch_cannot_read_failed_group() {
        let def = WorkflowDefinition::new(
            "wf",
            vec![
                TaskDefinition::group("g", vec![echo("x")])
                    .with_on_error(echo_msg("alert", "{{ tasks.x.message }}")),
            ],
        );
        assert!(matches!(
            compile(&def),
            Err(CompileError::UnresolvableReference { .. })
        ));
    }

    #[test]
    fn test_variables_and_session() {
        let mut def = WorkflowDefinition::new(
            "wf",
            vec![echo_msg("a", "{{ vars.target }} {{ session.date }} {{ session.attempt }}")],
        );
        def.variables.insert("target", "prod");
        assert!(compile(&def).is_ok());

        def.variables = ConfigMap::new().with("targte", "prod");
        let err = compile(&def).unwrap_err();
        match err {
            CompileError::UndeclaredVariable {
                variable,
                suggestion,
                ..
            } => {
                assert_eq!(variable, "vars.target");
                assert_eq!(suggestion.as_deref(), Some("targte"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unknown_session_field_rejected() {
        let def = WorkflowDefinition::new("wf", vec![echo_msg("a", "{{ session.nope }}")]);
        assert!(matches!(
            compile(&def),
            Err(CompileError::UndeclaredVariable { .. })
        ));
    }

    #[test]
    fn test_unknown_namespace_rejected() {
        let def = WorkflowDefinition::new("wf", vec![echo_msg("a", "{{ env.HOME }}")]);
        assert!(matches!(
            compile(&def),
            Err(CompileError::UndeclaredVariable { ref variable, .. }) if variable == "env"
        ));
    }

    #[test]
    fn test_bad_template_rejected() {
        let def = WorkflowDefinition::new("wf", vec![echo_msg("a", "{{ vars.x ")]);
        assert!(matches!(
            compile(&def),
            Err(CompileError::InvalidTemplate { ref key, .. }) if key == "message"
        ));
    }

    #[test]
    fn test_unknown_operator() {
        let def = WorkflowDefinition::new("wf", vec![TaskDefinition::task("a", "ecoh")]);
        match compile(&def).unwrap_err() {
            CompileError::UnknownOperator { suggestion, .. } => {
                assert_eq!(suggestion.as_deref(), Some("echo"))
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_extra_operator_from_config() {
        let mut config = EngineConfig::default();
        config.operators.extra.push("spark".into());
        let def = WorkflowDefinition::new("wf", vec![TaskDefinition::task("a", "spark")]);

        assert!(Compiler::default().compile(&def).is_err());
        assert!(Compiler::from_config(&config).compile(&def).is_ok());
    }

    #[test]
    fn test_missing_required_config() {
        let def = WorkflowDefinition::new("wf", vec![TaskDefinition::task("a", "sh")]);
        assert!(matches!(
            compile(&def),
            Err(CompileError::MissingConfig { ref key, .. }) if key == "command"
        ));
    }

    #[test]
    fn test_duplicate_and_invalid_names() {
        let def = WorkflowDefinition::new("wf", vec![echo("a"), echo("a")]);
        assert!(matches!(
            compile(&def),
            Err(CompileError::DuplicateTask { .. })
        ));

        let def = WorkflowDefinition::new("wf", vec![echo("a")]).with_on_error(echo("a"));
        assert!(matches!(
            compile(&def),
            Err(CompileError::DuplicateTask { .. })
        ));

        let def = WorkflowDefinition::new("wf", vec![echo("has space")]);
        assert!(matches!(compile(&def), Err(CompileError::InvalidName { .. })));

        let def = WorkflowDefinition::new("9wf", vec![]);
        assert!(matches!(compile(&def), Err(CompileError::InvalidName { .. })));
    }

    #[test]
    fn test_operator_with_children_rejected() {
        let mut task = echo("a");
        task.tasks.push(echo("b"));
        let def = WorkflowDefinition::new("wf", vec![task]);
        assert!(matches!(compile(&def), Err(CompileError::InvalidTask { .. })));

        let group =
            TaskDefinition::group("g", vec![]).with_config(ConfigMap::new().with("k", "v"));
        let def = WorkflowDefinition::new("wf", vec![group]);
        assert!(matches!(compile(&def), Err(CompileError::InvalidTask { .. })));
    }

    #[test]
    fn test_retry_inheritance() {
        let mut def = WorkflowDefinition::new(
            "wf",
            vec![
                echo("a"),
                TaskDefinition::group("g", vec![echo("x")]).with_retry(RetryPolicy {
                    max_attempts: 5,
                    ..Default::default()
                }),
            ],
        );
        def.retry = Some(RetryPolicy {
            max_attempts: 2,
            ..Default::default()
        });
        let graph = compile(&def).unwrap();
        assert_eq!(graph.find("+wf+a").unwrap().retry.max_attempts, 2);
        assert_eq!(graph.find("+wf+g+x").unwrap().retry.max_attempts, 5);
    }

    #[test]
    fn test_invalid_retry() {
        let def = WorkflowDefinition::new(
            "wf",
            vec![echo("a").with_retry(RetryPolicy {
                max_attempts: 0,
                ..Default::default()
            })],
        );
        assert!(matches!(compile(&def), Err(CompileError::InvalidRetry { .. })));
    }

    #[test]
    fn test_invalid_schedule() {
        let mut def = WorkflowDefinition::new("wf", vec![echo("a")]);
        def.schedule = Some(RecurrenceRule::Hourly { minute: 75 });
        assert!(matches!(compile(&def), Err(CompileError::InvalidSchedule { .. })));

        def.schedule = Some(RecurrenceRule::Hourly { minute: 5 });
        assert!(compile(&def).is_ok());
    }

    #[test]
    fn test_site_inheritance() {
        let mut group = TaskDefinition::group("g", vec![echo("x")]);
        group.site = Some("gpu".into());
        let mut def = WorkflowDefinition::new("wf", vec![echo("a"), group]);
        def.site = "main".into();
        let graph = compile(&def).unwrap();
        assert_eq!(graph.find("+wf+a").unwrap().site, "main");
        assert_eq!(graph.find("+wf+g+x").unwrap().site, "gpu");
    }

    #[test]
    fn test_deterministic_and_serializable() {
        let def = WorkflowDefinition::new(
            "wf",
            vec![
                echo("a"),
                TaskDefinition::group("g", vec![echo("x")]).with_on_error(echo("e")),
            ],
        );
        let first = compile(&def).unwrap();
        let second = compile(&def).unwrap();
        assert_eq!(first, second);

        let json = serde_json::to_string(&first).unwrap();
        let restored: CompiledTaskGraph = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, first);
    }

    #[test]
    fn test_render_tree() {
        let def = WorkflowDefinition::new(
            "wf",
            vec![TaskDefinition::group("g", vec![echo("x")]).with_on_error(echo("e"))],
        );
        let tree = compile(&def).unwrap().render_tree();
        assert!(tree.contains("wf (group)"));
        assert!(tree.contains("    x (echo)"));
        assert!(tree.contains("on_error e (echo)"));
    }

    fn random_task(rng: &mut StdRng, depth: u32, counter: &mut u32) -> TaskDefinition {
        *counter += 1;
        let name = format!("t{}", counter);
        if depth >= 4 || rng.random_bool(0.5) {
            return echo(&name);
        }
        let children = (0..rng.random_range(0..4))
            .map(|_| random_task(rng, depth + 1, counter))
            .collect();
        let mut group = TaskDefinition::group(name, children);
        group.parallel = rng.random_bool(0.3);
        if rng.random_bool(0.3) {
            group = group.with_on_error(random_task(rng, depth + 1, counter));
        }
        group
    }

    #[test]
    fn test_random_definitions_compile_in_topological_order() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..200 {
            let mut counter = 0;
            let tasks = (0..rng.random_range(0..5))
                .map(|_| random_task(&mut rng, 0, &mut counter))
                .collect();
            let mut def = WorkflowDefinition::new("wf", tasks);
            if rng.random_bool(0.3) {
                def = def.with_on_error(random_task(&mut rng, 1, &mut counter));
            }

            let graph = compile(&def).unwrap();
            assert_eq!(graph.len(), counter as usize + 1);

            let mut reached = vec![0usize; graph.len()];
            reached[0] = 1;
            for (i, node) in graph.nodes.iter().enumerate() {
                assert_eq!(node.index, i);
                if let Some(parent) = node.parent {
                    assert!(parent < node.index);
                    assert!(graph.nodes[parent].children.contains(&node.index));
                } else {
                    assert_eq!(node.index, 0);
                }
                for child in &node.children {
                    assert_eq!(graph.nodes[*child].parent, Some(node.index));
                    reached[*child] += 1;
                }
                for up in &node.upstream {
                    assert!(*up < node.index);
                }
            }
            // Every node hangs off the root exactly once
            assert!(reached.iter().all(|r| *r == 1));
        }
    }
}

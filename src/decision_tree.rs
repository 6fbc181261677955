use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, WargameError};
use crate::scenario::Scenario;

/// Label of the implicit branch carrying the probability mass no listed
/// competitor response claims.
pub const NO_RESPONSE: &str = "no response";

const PROBABILITY_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Decision,
    Chance,
    Outcome,
}

/// Node of the tree arena. Children are referenced by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionNode {
    pub id: String,
    pub kind: NodeKind,
    pub label: String,
    /// Branch probability; set on children of chance nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probability: Option<f64>,
    /// Fixed payoff; set on outcome nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default)]
    pub children: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_value: Option<f64>,
}

impl DecisionNode {
    pub fn decision(id: &str, label: &str, children: &[&str]) -> Self {
        Self::node(id, NodeKind::Decision, label, None, None, children)
    }

    pub fn chance(id: &str, label: &str, children: &[&str]) -> Self {
        Self::node(id, NodeKind::Chance, label, None, None, children)
    }

    pub fn outcome(id: &str, label: &str, probability: f64, value: f64) -> Self {
        Self::node(id, NodeKind::Outcome, label, Some(probability), Some(value), &[])
    }

    fn node(
        id: &str,
        kind: NodeKind,
        label: &str,
        probability: Option<f64>,
        value: Option<f64>,
        children: &[&str],
    ) -> Self {
        DecisionNode {
            id: id.to_string(),
            kind,
            label: label.to_string(),
            probability,
            value,
            children: children.iter().map(|c| c.to_string()).collect(),
            expected_value: None,
        }
    }
}

/// One competitor response to a strategic option.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseBranch {
    pub response: String,
    pub probability: f64,
    pub value: f64,
}

/// One of our strategic options with the responses it may provoke.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategicOption {
    pub action: String,
    pub responses: Vec<ResponseBranch>,
}

impl StrategicOption {
    pub fn new(action: &str) -> Self {
        StrategicOption {
            action: action.to_string(),
            responses: Vec::new(),
        }
    }

    pub fn response(mut self, response: &str, probability: f64, value: f64) -> Self {
        self.responses.push(ResponseBranch {
            response: response.to_string(),
            probability,
            value,
        });
        self
    }
}

/// Decision → chance → outcome tree solved by backward induction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTree {
    pub nodes: BTreeMap<String, DecisionNode>,
    pub root: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimal_path: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_value: Option<f64>,
}

impl DecisionTree {
    /// Root decision with one chance node per option and one outcome per
    /// response.
    pub fn build(options: &[StrategicOption]) -> Result<DecisionTree> {
        if options.is_empty() {
            return Err(WargameError::structure("no strategic options to build from"));
        }

        let mut nodes = Vec::new();
        let mut option_ids = Vec::with_capacity(options.len());

        for (i, option) in options.iter().enumerate() {
            if option.responses.is_empty() {
                return Err(WargameError::structure(format!(
                    "option '{}' has no responses",
                    option.action
                )));
            }
            let chance_id = format!("option_{}", i);
            let mut outcome_ids = Vec::with_capacity(option.responses.len());
            for (j, branch) in option.responses.iter().enumerate() {
                let outcome_id = format!("option_{}_response_{}", i, j);
                nodes.push(DecisionNode::outcome(
                    &outcome_id,
                    &branch.response,
                    branch.probability,
                    branch.value,
                ));
                outcome_ids.push(outcome_id);
            }
            let children: Vec<&str> = outcome_ids.iter().map(String::as_str).collect();
            nodes.push(DecisionNode::chance(&chance_id, &option.action, &children));
            option_ids.push(chance_id);
        }

        let children: Vec<&str> = option_ids.iter().map(String::as_str).collect();
        nodes.push(DecisionNode::decision("root", "strategy", &children));

        Self::from_nodes(nodes)
    }

    /// Validate an arbitrary node arena, then solve it.
    pub fn from_nodes(nodes: Vec<DecisionNode>) -> Result<DecisionTree> {
        let mut arena = BTreeMap::new();
        for node in nodes {
            let id = node.id.clone();
            if arena.insert(id.clone(), node).is_some() {
                return Err(WargameError::structure(format!("duplicate node id '{}'", id)));
            }
        }

        let root = validate_structure(&arena)?;
        let mut tree = DecisionTree {
            nodes: arena,
            root,
            optimal_path: None,
            expected_value: None,
        };
        tree.solve()?;
        Ok(tree)
    }

    pub fn node(&self, id: &str) -> Option<&DecisionNode> {
        self.nodes.get(id)
    }

    fn get(&self, id: &str) -> Result<&DecisionNode> {
        self.nodes
            .get(id)
            .ok_or_else(|| WargameError::structure(format!("missing node '{}'", id)))
    }

    /// Backward induction from the leaves, then path extraction.
    fn solve(&mut self) -> Result<()> {
        let mut values = BTreeMap::new();
        let root_ev = self.expected_value_of(&self.root, &mut values)?;
        for (id, ev) in values {
            if let Some(node) = self.nodes.get_mut(&id) {
                node.expected_value = Some(ev);
            }
        }
        self.expected_value = Some(root_ev);
        self.optimal_path = Some(self.trace_optimal_path()?);
        debug!(root_ev, nodes = self.nodes.len(), "decision tree solved");
        Ok(())
    }

    fn expected_value_of(&self, id: &str, values: &mut BTreeMap<String, f64>) -> Result<f64> {
        if let Some(&v) = values.get(id) {
            return Ok(v);
        }
        let node = self.get(id)?;
        let ev = match node.kind {
            NodeKind::Outcome => node.value.ok_or_else(|| {
                WargameError::structure(format!("outcome '{}' has no value", id))
            })?,
            NodeKind::Chance => {
                let mut total = 0.0;
                for child in &node.children {
                    let p = self.get(child)?.probability.unwrap_or(0.0);
                    total += self.expected_value_of(child, values)? * p;
                }
                total
            }
            NodeKind::Decision => {
                let mut best = f64::NEG_INFINITY;
                for child in &node.children {
                    best = best.max(self.expected_value_of(child, values)?);
                }
                best
            }
        };
        values.insert(id.to_string(), ev);
        Ok(ev)
    }

    /// Highest expected value at decision nodes, highest probability at
    /// chance nodes, until an outcome. Ties keep the first child.
    fn trace_optimal_path(&self) -> Result<Vec<String>> {
        let mut path = Vec::new();
        let mut current = self.get(&self.root)?;
        loop {
            path.push(current.id.clone());
            let key = |n: &DecisionNode| match current.kind {
                NodeKind::Decision => n.expected_value.unwrap_or(f64::NEG_INFINITY),
                _ => n.probability.unwrap_or(0.0),
            };
            if current.kind == NodeKind::Outcome {
                return Ok(path);
            }
            let mut best: Option<&DecisionNode> = None;
            for child in &current.children {
                let node = self.get(child)?;
                if best.map_or(true, |b| key(node) > key(b)) {
                    best = Some(node);
                }
            }
            current = best.ok_or_else(|| {
                WargameError::structure(format!("node '{}' has no children", current.id))
            })?;
        }
    }

    /// Label of the option on the optimal path and its expected value.
    pub fn best_option(&self) -> Option<(&str, f64)> {
        let id = self.optimal_path.as_ref()?.get(1)?;
        let node = self.nodes.get(id)?;
        Some((node.label.as_str(), node.expected_value?))
    }
}

/// Checks shared by every tree; returns the root id.
fn validate_structure(nodes: &BTreeMap<String, DecisionNode>) -> Result<String> {
    let mut parents: BTreeMap<&str, &str> = BTreeMap::new();
    for node in nodes.values() {
        for child in &node.children {
            if !nodes.contains_key(child) {
                return Err(WargameError::structure(format!(
                    "node '{}' references missing child '{}'",
                    node.id, child
                )));
            }
        }
    }

    detect_cycle(nodes)?;

    for node in nodes.values() {
        for child in &node.children {
            if let Some(other) = parents.insert(child.as_str(), node.id.as_str()) {
                return Err(WargameError::structure(format!(
                    "node '{}' has multiple parents ('{}' and '{}')",
                    child, other, node.id
                )));
            }
        }
    }

    let roots: Vec<&str> = nodes
        .keys()
        .map(String::as_str)
        .filter(|id| !parents.contains_key(id))
        .collect();
    let root = match roots.as_slice() {
        [root] => root.to_string(),
        [] => return Err(WargameError::structure("tree has no root")),
        many => {
            return Err(WargameError::structure(format!(
                "tree has multiple roots: {}",
                many.join(", ")
            )))
        }
    };

    let mut reachable = BTreeSet::new();
    let mut stack = vec![root.as_str()];
    while let Some(id) = stack.pop() {
        if reachable.insert(id) {
            stack.extend(nodes[id].children.iter().map(String::as_str));
        }
    }
    if reachable.len() != nodes.len() {
        let orphans: Vec<&str> = nodes
            .keys()
            .map(String::as_str)
            .filter(|id| !reachable.contains(id))
            .collect();
        return Err(WargameError::structure(format!(
            "nodes not reachable from root: {}",
            orphans.join(", ")
        )));
    }

    for node in nodes.values() {
        check_node(node, nodes)?;
    }
    Ok(root)
}

fn check_node(node: &DecisionNode, nodes: &BTreeMap<String, DecisionNode>) -> Result<()> {
    match node.kind {
        NodeKind::Outcome => {
            if !node.children.is_empty() {
                return Err(WargameError::structure(format!(
                    "outcome '{}' must be a leaf",
                    node.id
                )));
            }
            if node.value.is_none() {
                return Err(WargameError::structure(format!(
                    "outcome '{}' has no value",
                    node.id
                )));
            }
        }
        NodeKind::Decision | NodeKind::Chance if node.children.is_empty() => {
            return Err(WargameError::structure(format!(
                "node '{}' has no children",
                node.id
            )));
        }
        NodeKind::Decision => {}
        NodeKind::Chance => {
            let mut total = 0.0;
            for child in &node.children {
                let p = nodes[child.as_str()].probability.ok_or_else(|| {
                    WargameError::structure(format!(
                        "branch '{}' of chance node '{}' has no probability",
                        child, node.id
                    ))
                })?;
                if !(0.0..=1.0).contains(&p) {
                    return Err(WargameError::structure(format!(
                        "branch '{}' probability {} outside [0, 1]",
                        child, p
                    )));
                }
                total += p;
            }
            if (total - 1.0).abs() > PROBABILITY_TOLERANCE {
                warn!(
                    node = %node.id,
                    total,
                    "chance node probabilities do not sum to 1"
                );
            }
        }
    }
    Ok(())
}

/// Depth-first search over every node, white/grey/black colouring.
fn detect_cycle(nodes: &BTreeMap<String, DecisionNode>) -> Result<()> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Grey,
        Black,
    }

    let mut marks: BTreeMap<&str, Mark> = BTreeMap::new();
    for start in nodes.keys() {
        if marks.contains_key(start.as_str()) {
            continue;
        }
        // (node, index of next child to visit)
        let mut stack: Vec<(&str, usize)> = vec![(start.as_str(), 0)];
        marks.insert(start.as_str(), Mark::Grey);
        while let Some((id, next)) = stack.pop() {
            let children = &nodes[id].children;
            if next < children.len() {
                stack.push((id, next + 1));
                let child = children[next].as_str();
                match marks.get(child) {
                    Some(Mark::Grey) => {
                        return Err(WargameError::structure(format!(
                            "cycle detected through '{}' -> '{}'",
                            id, child
                        )))
                    }
                    Some(Mark::Black) => {}
                    None => {
                        marks.insert(child, Mark::Grey);
                        stack.push((child, 0));
                    }
                }
            } else {
                marks.insert(id, Mark::Black);
            }
        }
    }
    Ok(())
}

/// Strategic options for a scenario: each of our actions faces every listed
/// competitor action. Probabilities summing above 1 are normalised; a
/// shortfall goes to a [`NO_RESPONSE`] branch. Values come from
/// `scenario.payoffs`, else `fallback_value`.
pub fn options_from_scenario(scenario: &Scenario, fallback_value: f64) -> Vec<StrategicOption> {
    let total: f64 = scenario
        .competitor_actions
        .iter()
        .map(|ca| ca.probability)
        .sum();
    let scale = if total > 1.0 {
        warn!(
            scenario = %scenario.name,
            total,
            "competitor action probabilities exceed 1; normalising"
        );
        1.0 / total
    } else {
        1.0
    };
    let remainder = (1.0 - total * scale).max(0.0);

    let payoff = |action: &str, response: &str| {
        scenario
            .payoffs
            .as_ref()
            .and_then(|p| p.get(action))
            .and_then(|r| r.get(response))
            .copied()
            .unwrap_or(fallback_value)
    };

    scenario
        .our_actions
        .iter()
        .map(|action| {
            let mut option = StrategicOption::new(action);
            for ca in &scenario.competitor_actions {
                let label = ca.label();
                let value = payoff(action, &label);
                option = option.response(&label, ca.probability * scale, value);
            }
            if remainder > PROBABILITY_TOLERANCE {
                option = option.response(NO_RESPONSE, remainder, payoff(action, NO_RESPONSE));
            }
            option
        })
        .collect()
}

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::distribution::Distribution;
use crate::error::{Result, WargameError};
use crate::formula::Formula;

/// A possible competitor move and how likely it is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompetitorAction {
    pub competitor: String,
    pub action: String,
    pub probability: f64,
}

impl CompetitorAction {
    pub fn new(competitor: &str, action: &str, probability: f64) -> Self {
        CompetitorAction {
            competitor: competitor.to_string(),
            action: action.to_string(),
            probability,
        }
    }

    /// `"competitor: action"`, the key used in response-probability maps and
    /// decision-tree labels.
    pub fn label(&self) -> String {
        format!("{}: {}", self.competitor, self.action)
    }
}

/// One wargame: uncertain variables, the outcome formula and the moves
/// available to us and to competitors. Read-only to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub variables: BTreeMap<String, Distribution>,
    pub formula: String,
    #[serde(default)]
    pub competitor_actions: Vec<CompetitorAction>,
    #[serde(default)]
    pub our_actions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market_conditions: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeframe: Option<String>,
    /// Outcome value per our action and competitor response label. Missing
    /// entries fall back to the simulated mean when a decision tree is built.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payoffs: Option<BTreeMap<String, BTreeMap<String, f64>>>,
}

impl Scenario {
    pub fn new(name: &str, formula: &str) -> Self {
        Scenario {
            id: None,
            name: name.to_string(),
            description: String::new(),
            variables: BTreeMap::new(),
            formula: formula.to_string(),
            competitor_actions: Vec::new(),
            our_actions: Vec::new(),
            market_conditions: None,
            timeframe: None,
            payoffs: None,
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn with_variable(mut self, name: &str, dist: Distribution) -> Self {
        self.variables.insert(name.to_string(), dist);
        self
    }

    pub fn with_competitor_action(mut self, action: CompetitorAction) -> Self {
        self.competitor_actions.push(action);
        self
    }

    pub fn with_our_action(mut self, action: &str) -> Self {
        self.our_actions.push(action.to_string());
        self
    }

    pub fn with_payoff(mut self, our_action: &str, response: &str, value: f64) -> Self {
        self.payoffs
            .get_or_insert_with(BTreeMap::new)
            .entry(our_action.to_string())
            .or_default()
            .insert(response.to_string(), value);
        self
    }

    /// Identifier used in comparisons: the explicit id, else the name.
    pub fn key(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.name)
    }

    /// Parse and validate a scenario document. Distribution parameters are
    /// checked one variable at a time so a bad law surfaces as a
    /// `Validation` error naming the variable.
    pub fn from_json(json: &str) -> Result<Scenario> {
        let mut value: Value = serde_json::from_str(json)?;
        let variables = match value.get_mut("variables") {
            Some(v) => Some(parse_variables(std::mem::replace(v, Value::Object(Map::new())))?),
            None => None,
        };

        let mut scenario: Scenario = serde_json::from_value(value)?;
        if let Some(variables) = variables {
            scenario.variables = variables;
        }
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn load(path: &Path) -> Result<Scenario> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Check the scenario record without compiling the formula.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(WargameError::validation("scenario name is empty"));
        }
        if self.variables.is_empty() {
            return Err(WargameError::validation(format!(
                "scenario '{}' has no variables",
                self.name
            )));
        }
        for (name, dist) in &self.variables {
            if !is_identifier(name) {
                return Err(WargameError::validation(format!(
                    "variable name '{}' is not a valid identifier",
                    name
                )));
            }
            dist.validate().map_err(|e| in_variable(name, e))?;
        }
        if self.formula.trim().is_empty() {
            return Err(WargameError::validation(format!(
                "scenario '{}' has an empty formula",
                self.name
            )));
        }
        for ca in &self.competitor_actions {
            if !(0.0..=1.0).contains(&ca.probability) {
                return Err(WargameError::validation(format!(
                    "probability of '{}' must be in [0, 1], got {}",
                    ca.label(),
                    ca.probability
                )));
            }
        }
        let mut labels = BTreeSet::new();
        for ca in &self.competitor_actions {
            let label = ca.label();
            if !labels.insert(label.clone()) {
                return Err(WargameError::validation(format!(
                    "duplicate competitor action '{}'",
                    label
                )));
            }
        }
        let mut seen = BTreeSet::new();
        for action in &self.our_actions {
            if !seen.insert(action.as_str()) {
                return Err(WargameError::validation(format!(
                    "duplicate strategic option '{}'",
                    action
                )));
            }
        }
        Ok(())
    }

    /// Validate, then compile the formula against the variable names.
    pub fn compile_formula(&self) -> Result<Formula> {
        self.validate()?;
        let names: Vec<&String> = self.variables.keys().collect();
        Formula::compile(&self.formula, &names)
    }

    /// Copy with one variable replaced by its pinned point distribution.
    pub fn with_pinned(&self, variable: &str) -> Result<Scenario> {
        let dist = self.variables.get(variable).ok_or_else(|| {
            WargameError::validation(format!("unknown variable '{}'", variable))
        })?;
        let mut pinned = self.clone();
        pinned.variables.insert(variable.to_string(), dist.pinned());
        Ok(pinned)
    }

    /// `"competitor: action"` → probability.
    pub fn competitor_response_probabilities(&self) -> BTreeMap<String, f64> {
        self.competitor_actions
            .iter()
            .map(|ca| (ca.label(), ca.probability))
            .collect()
    }
}

fn parse_variables(value: Value) -> Result<BTreeMap<String, Distribution>> {
    let Value::Object(entries) = value else {
        return Err(WargameError::Config(
            "'variables' must be an object of distributions".to_string(),
        ));
    };
    entries
        .into_iter()
        .map(|(name, v)| -> Result<(String, Distribution)> {
            let dist = Distribution::from_json_value(v).map_err(|e| in_variable(&name, e))?;
            Ok((name, dist))
        })
        .collect()
}

/// Prefix a distribution error with the variable it belongs to.
fn in_variable(name: &str, err: WargameError) -> WargameError {
    match err {
        WargameError::Validation(msg) => {
            WargameError::validation(format!("variable '{}': {}", name, msg))
        }
        WargameError::Config(msg) => WargameError::Config(format!("variable '{}': {}", name, msg)),
        other => other,
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_')
}

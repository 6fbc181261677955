use approx::assert_relative_eq;
use wargame_sim::decision_tree::{
    options_from_scenario, DecisionNode, DecisionTree, NodeKind, StrategicOption, NO_RESPONSE,
};
use wargame_sim::{CompetitorAction, Distribution, Scenario, WargameError};

fn two_options() -> Vec<StrategicOption> {
    vec![
        StrategicOption::new("cut prices")
            .response("match", 0.6, 100.0)
            .response("ignore", 0.4, -20.0),
        StrategicOption::new("launch product")
            .response("copy", 0.3, 50.0)
            .response("ignore", 0.7, 10.0),
    ]
}

fn is_structure_error(result: Result<DecisionTree, WargameError>) -> bool {
    matches!(result, Err(WargameError::Structure(_)))
}

#[test]
fn test_backward_induction_picks_best_option() {
    let tree = DecisionTree::build(&two_options()).unwrap();

    assert_eq!(tree.root, "root");
    assert_relative_eq!(tree.expected_value.unwrap(), 52.0, epsilon = 1e-9);
    assert_relative_eq!(
        tree.node("option_0").unwrap().expected_value.unwrap(),
        52.0,
        epsilon = 1e-9
    );
    assert_relative_eq!(
        tree.node("option_1").unwrap().expected_value.unwrap(),
        22.0,
        epsilon = 1e-9
    );
    assert_eq!(
        tree.optimal_path.clone().unwrap(),
        vec!["root", "option_0", "option_0_response_0"]
    );

    let (action, ev) = tree.best_option().unwrap();
    assert_eq!(action, "cut prices");
    assert_relative_eq!(ev, 52.0, epsilon = 1e-9);
}

#[test]
fn test_built_tree_layout() {
    let tree = DecisionTree::build(&two_options()).unwrap();
    assert_eq!(tree.nodes.len(), 7);

    let root = tree.node("root").unwrap();
    assert_eq!(root.kind, NodeKind::Decision);
    assert_eq!(root.children, vec!["option_0", "option_1"]);

    let chance = tree.node("option_1").unwrap();
    assert_eq!(chance.kind, NodeKind::Chance);
    assert_eq!(chance.label, "launch product");

    let leaf = tree.node("option_1_response_0").unwrap();
    assert_eq!(leaf.kind, NodeKind::Outcome);
    assert_eq!(leaf.label, "copy");
    assert_eq!(leaf.probability, Some(0.3));
    assert_eq!(leaf.value, Some(50.0));
    assert_eq!(leaf.expected_value, Some(50.0));
}

#[test]
fn test_chance_path_follows_most_likely_branch() {
    // Option 1 wins on expected value; its likeliest branch is the second.
    let options = vec![
        StrategicOption::new("hold").response("none", 1.0, 5.0),
        StrategicOption::new("expand")
            .response("retaliate", 0.2, -10.0)
            .response("accept", 0.8, 30.0),
    ];
    let tree = DecisionTree::build(&options).unwrap();
    assert_eq!(
        tree.optimal_path.unwrap(),
        vec!["root", "option_1", "option_1_response_1"]
    );
}

#[test]
fn test_ties_keep_first_child() {
    let options = vec![
        StrategicOption::new("a")
            .response("x", 0.5, 10.0)
            .response("y", 0.5, 10.0),
        StrategicOption::new("b").response("z", 1.0, 10.0),
    ];
    let tree = DecisionTree::build(&options).unwrap();
    assert_eq!(
        tree.optimal_path.unwrap(),
        vec!["root", "option_0", "option_0_response_0"]
    );
}

#[test]
fn test_probabilities_not_summing_to_one_still_solve() {
    let options = vec![StrategicOption::new("a").response("x", 0.5, 10.0)];
    let tree = DecisionTree::build(&options).unwrap();
    assert_relative_eq!(tree.expected_value.unwrap(), 5.0);
}

#[test]
fn test_tree_json_round_trip() {
    let tree = DecisionTree::build(&two_options()).unwrap();
    let json = serde_json::to_string(&tree).unwrap();
    assert!(json.contains("\"kind\":\"chance\""));
    let back: DecisionTree = serde_json::from_str(&json).unwrap();
    assert_eq!(back.root, tree.root);
    assert_eq!(back.nodes.len(), tree.nodes.len());
    assert_eq!(back.optimal_path, tree.optimal_path);
}

// ═══════════════════════════════════════════════════════════════════════
// Structure errors
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn test_build_rejects_empty_input() {
    assert!(is_structure_error(DecisionTree::build(&[])));
    assert!(is_structure_error(DecisionTree::build(&[StrategicOption::new(
        "idle"
    )])));
}

#[test]
fn test_missing_child() {
    let nodes = vec![DecisionNode::decision("root", "strategy", &["ghost"])];
    assert!(is_structure_error(DecisionTree::from_nodes(nodes)));
}

#[test]
fn test_cycle() {
    let nodes = vec![
        DecisionNode::decision("root", "strategy", &["a"]),
        DecisionNode::chance("a", "a", &["b"]),
        DecisionNode::chance("b", "b", &["a"]),
    ];
    let err = DecisionTree::from_nodes(nodes).unwrap_err();
    assert!(err.to_string().contains("cycle"), "{}", err);
}

#[test]
fn test_multiple_roots() {
    let nodes = vec![
        DecisionNode::decision("r1", "one", &["o1"]),
        DecisionNode::outcome("o1", "x", 1.0, 1.0),
        DecisionNode::decision("r2", "two", &["o2"]),
        DecisionNode::outcome("o2", "y", 1.0, 2.0),
    ];
    let err = DecisionTree::from_nodes(nodes).unwrap_err();
    assert!(err.to_string().contains("multiple roots"), "{}", err);
}

#[test]
fn test_shared_child_has_multiple_parents() {
    let nodes = vec![
        DecisionNode::decision("root", "strategy", &["a", "b"]),
        DecisionNode::chance("a", "a", &["leaf"]),
        DecisionNode::chance("b", "b", &["leaf"]),
        DecisionNode::outcome("leaf", "x", 1.0, 1.0),
    ];
    let err = DecisionTree::from_nodes(nodes).unwrap_err();
    assert!(err.to_string().contains("multiple parents"), "{}", err);
}

#[test]
fn test_duplicate_id() {
    let nodes = vec![
        DecisionNode::decision("root", "strategy", &["leaf"]),
        DecisionNode::outcome("leaf", "x", 1.0, 1.0),
        DecisionNode::outcome("leaf", "y", 1.0, 2.0),
    ];
    let err = DecisionTree::from_nodes(nodes).unwrap_err();
    assert!(err.to_string().contains("duplicate"), "{}", err);
}

#[test]
fn test_outcome_without_value() {
    let mut leaf = DecisionNode::outcome("leaf", "x", 1.0, 0.0);
    leaf.value = None;
    let nodes = vec![DecisionNode::decision("root", "strategy", &["leaf"]), leaf];
    assert!(is_structure_error(DecisionTree::from_nodes(nodes)));
}

#[test]
fn test_decision_without_children() {
    let nodes = vec![DecisionNode::decision("root", "strategy", &[])];
    assert!(is_structure_error(DecisionTree::from_nodes(nodes)));
}

#[test]
fn test_chance_branch_probability_out_of_range() {
    let nodes = vec![
        DecisionNode::chance("root", "market", &["leaf"]),
        DecisionNode::outcome("leaf", "x", 1.5, 1.0),
    ];
    assert!(is_structure_error(DecisionTree::from_nodes(nodes)));
}

// ═══════════════════════════════════════════════════════════════════════
// Options from scenarios
// ═══════════════════════════════════════════════════════════════════════

fn base_scenario() -> Scenario {
    Scenario::new("pricing", "revenue")
        .with_variable("revenue", Distribution::normal(100.0, 10.0).unwrap())
        .with_our_action("cut prices")
        .with_our_action("hold")
}

#[test]
fn test_options_add_no_response_remainder() {
    let scenario = base_scenario()
        .with_competitor_action(CompetitorAction::new("Acme", "match", 0.5))
        .with_competitor_action(CompetitorAction::new("Acme", "exit", 0.2))
        .with_payoff("cut prices", "Acme: match", -30.0)
        .with_payoff("cut prices", NO_RESPONSE, 80.0);
    let options = options_from_scenario(&scenario, 100.0);

    assert_eq!(options.len(), 2);
    let cut = &options[0];
    assert_eq!(cut.action, "cut prices");
    assert_eq!(cut.responses.len(), 3);
    assert_eq!(cut.responses[0].response, "Acme: match");
    assert_eq!(cut.responses[0].value, -30.0);
    // No payoff listed: falls back to the simulated mean.
    assert_eq!(cut.responses[1].value, 100.0);
    assert_eq!(cut.responses[2].response, NO_RESPONSE);
    assert_relative_eq!(cut.responses[2].probability, 0.3, epsilon = 1e-12);
    assert_eq!(cut.responses[2].value, 80.0);

    let tree = DecisionTree::build(&options).unwrap();
    // cut: 0.5*-30 + 0.2*100 + 0.3*80 = 29; hold: 100
    assert_eq!(tree.best_option().map(|(a, _)| a), Some("hold"));
    assert_relative_eq!(tree.expected_value.unwrap(), 100.0, epsilon = 1e-9);
}

#[test]
fn test_options_normalise_excess_probability() {
    let scenario = base_scenario()
        .with_competitor_action(CompetitorAction::new("Acme", "match", 0.8))
        .with_competitor_action(CompetitorAction::new("Globex", "match", 0.8));
    let options = options_from_scenario(&scenario, 1.0);

    for option in &options {
        assert_eq!(option.responses.len(), 2);
        let total: f64 = option.responses.iter().map(|r| r.probability).sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-12);
        assert_relative_eq!(option.responses[0].probability, 0.5, epsilon = 1e-12);
    }
}

#[test]
fn test_options_without_competitors() {
    let options = options_from_scenario(&base_scenario(), 42.0);
    assert_eq!(options[1].responses.len(), 1);
    assert_eq!(options[1].responses[0].response, NO_RESPONSE);
    assert_eq!(options[1].responses[0].probability, 1.0);
    assert_eq!(options[1].responses[0].value, 42.0);
}

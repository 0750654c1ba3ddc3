//! Property-based tests for the state machine
//!
//! These tests verify key invariants hold across all possible inputs.

use super::state::*;
use super::transition::*;
use super::*;
use crate::catalog::ToolDescriptor;
use crate::orchestrator::check_missing_parameters;
use proptest::prelude::*;
use std::collections::BTreeMap;

// ============================================================================
// Arbitrary Generators
// ============================================================================

fn arb_param_name() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("path".to_string()),
        Just("location".to_string()),
        Just("query".to_string()),
        Just("limit".to_string()),
    ]
}

fn arb_tool() -> impl Strategy<Value = ToolDescriptor> {
    (
        "[a-z]{3,8}",
        proptest::collection::vec(arb_param_name(), 0..3),
    )
        .prop_map(|(name, params)| {
            let mut tool = ToolDescriptor::new(name, "generated tool");
            for param in params {
                if !tool.required_parameters.contains(&param) {
                    tool = tool.with_required(param.clone(), format!("the {param}"));
                }
            }
            tool
        })
}

fn arb_tools() -> impl Strategy<Value = Vec<ToolDescriptor>> {
    proptest::collection::vec(arb_tool(), 0..4).prop_map(|tools| {
        let mut seen = Vec::new();
        tools
            .into_iter()
            .filter(|t| {
                if seen.contains(&t.name) {
                    false
                } else {
                    seen.push(t.name.clone());
                    true
                }
            })
            .collect()
    })
}

fn arb_intent() -> impl Strategy<Value = Intent> {
    prop_oneof![
        6 => Just(Intent::ProvideParam),
        1 => Just(Intent::Cancel),
        1 => Just(Intent::NewTopic),
    ]
}

fn arb_tool_result() -> impl Strategy<Value = ToolCallResult> {
    ("[a-z]{3,8}", any::<bool>(), "[a-zA-Z0-9 ]{0,30}").prop_map(|(tool, ok, text)| {
        if ok {
            ToolCallResult::success(tool, text)
        } else {
            ToolCallResult::failure(tool, text)
        }
    })
}

fn arb_event() -> impl Strategy<Value = Event> {
    prop_oneof![
        ("[a-zA-Z ]{1,30}", arb_tools())
            .prop_map(|(utterance, tools)| Event::ToolsDetected { utterance, tools }),
        ("[a-zA-Z/. ]{1,20}", arb_intent())
            .prop_map(|(utterance, intent)| Event::UserReply { utterance, intent }),
        arb_tool_result().prop_map(|result| Event::ToolFinished { result }),
        Just(Event::ChainCompleted),
        Just(Event::Reset),
    ]
}

fn terminal_count(effects: &[Effect]) -> usize {
    effects.iter().filter(|e| e.is_terminal()).count()
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    // Invariant 1: every reachable state satisfies the structural invariants
    #[test]
    fn prop_transitions_preserve_invariants(events in proptest::collection::vec(arb_event(), 0..25)) {
        let mut state = ConversationState::default();

        for event in events {
            if let Ok(result) = transition(&state, event) {
                state = result.new_state;
                prop_assert!(
                    state.check_invariants().is_ok(),
                    "Invariant broken: {:?} in {:?}",
                    state.check_invariants(),
                    state
                );
                prop_assert_eq!(
                    state.phase == Phase::CollectingParams,
                    !state.missing_params.is_empty()
                );
                if state.phase == Phase::Normal {
                    prop_assert!(state.pending_tools.is_empty());
                    prop_assert!(state.missing_params.is_empty());
                }
            }
        }
    }

    // Invariant 2: effects agree with the phase they leave behind
    #[test]
    fn prop_effects_match_new_phase(events in proptest::collection::vec(arb_event(), 0..25)) {
        let mut state = ConversationState::default();

        for event in events {
            if let Ok(result) = transition(&state, event) {
                prop_assert!(terminal_count(&result.effects) <= 1);
                for effect in &result.effects {
                    match effect {
                        Effect::AskClarification { param } => {
                            prop_assert_eq!(result.new_state.phase, Phase::CollectingParams);
                            prop_assert_eq!(Some(param), result.new_state.next_missing());
                        }
                        Effect::ExecuteChain { calls, .. } => {
                            prop_assert_eq!(result.new_state.phase, Phase::ExecutingTools);
                            prop_assert_eq!(calls.len(), result.new_state.pending_tools.len());
                        }
                        Effect::Synthesize { .. }
                        | Effect::PlainAnswer { .. }
                        | Effect::NotifyCancelled
                        | Effect::DetectTools { .. } => {
                            prop_assert_eq!(result.new_state.phase, Phase::Normal);
                        }
                    }
                }
                state = result.new_state;
            }
        }
    }

    // Invariant 3: reset always lands on the initial state, and is a no-op there
    #[test]
    fn prop_reset_restores_initial(events in proptest::collection::vec(arb_event(), 0..15)) {
        let mut state = ConversationState::default();
        for event in events {
            if let Ok(result) = transition(&state, event) {
                state = result.new_state;
            }
        }

        let reset = transition(&state, Event::Reset).unwrap();
        prop_assert!(reset.new_state.is_initial());
        prop_assert!(reset.effects.is_empty());

        let again = transition(&reset.new_state, Event::Reset).unwrap();
        prop_assert_eq!(again.new_state, reset.new_state);
    }

    // Invariant 4: answering every question always ends in execution
    #[test]
    fn prop_clarification_loop_terminates(tools in arb_tools(), values in proptest::collection::vec("[a-z]{1,10}", 12)) {
        prop_assume!(!tools.is_empty());

        let mut result = transition(
            &ConversationState::default(),
            Event::ToolsDetected { utterance: "do it".to_string(), tools: tools.clone() },
        ).unwrap();

        let distinct_missing: std::collections::BTreeSet<_> = check_missing_parameters(&tools, &BTreeMap::new())
            .into_iter()
            .map(|m| m.parameter)
            .collect();

        let mut questions = 0;
        let mut values = values.into_iter();
        while result.new_state.phase == Phase::CollectingParams {
            questions += 1;
            prop_assert!(questions <= distinct_missing.len());
            let utterance = values.next().unwrap();
            result = transition(
                &result.new_state,
                Event::UserReply { utterance, intent: Intent::ProvideParam },
            ).unwrap();
        }

        prop_assert_eq!(questions, distinct_missing.len());
        prop_assert_eq!(result.new_state.phase, Phase::ExecutingTools);
        let is_execute = matches!(result.effects.as_slice(), [Effect::ExecuteChain { .. }]);
        prop_assert!(is_execute);
        for name in &distinct_missing {
            prop_assert!(result.new_state.collected_params.contains_key(name));
        }
    }

    // Invariant 5: missing-parameter order is tool order, then declared order
    #[test]
    fn prop_missing_parameter_order(tools in arb_tools()) {
        let missing = check_missing_parameters(&tools, &BTreeMap::new());
        let expected: Vec<(String, String)> = tools
            .iter()
            .flat_map(|t| {
                t.required_parameters
                    .iter()
                    .map(move |p| (t.name.clone(), p.clone()))
            })
            .collect();
        let actual: Vec<(String, String)> = missing
            .into_iter()
            .map(|m| (m.tool, m.parameter))
            .collect();
        prop_assert_eq!(actual, expected);
    }
}

//! Rule engine: priority-ordered evaluation of nested condition groups
//!
//! Rules load as an owned tree (rule → condition groups → conditions, plus
//! actions) and evaluate against a canonical message. Evaluation is
//! short-circuiting at both the group and rule level, and produces an effect
//! set: a skip decision, a field-modification map, the matched rule names,
//! and any action errors. Condition failures never escape the engine; they
//! degrade to non-matches.

use std::collections::BTreeMap;
use std::time::Instant;

use regex::Regex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::errors::{AppError, AppResult};
use crate::mime::{CanonicalMessage, clean_header_text};
use crate::repo::Repository;

/// Message field a condition reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Sender,
    Subject,
    Body,
    Header,
    Attachment,
}

impl FieldKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sender" => Some(Self::Sender),
            "subject" => Some(Self::Subject),
            "body" => Some(Self::Body),
            "header" => Some(Self::Header),
            "attachment" => Some(Self::Attachment),
            _ => None,
        }
    }
}

/// Comparison a condition applies to the extracted field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Contains,
    NotContains,
    Equals,
    NotEquals,
    Regex,
    NotRegex,
    StartsWith,
    EndsWith,
}

impl Operator {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "contains" => Some(Self::Contains),
            "not_contains" => Some(Self::NotContains),
            "equals" => Some(Self::Equals),
            "not_equals" => Some(Self::NotEquals),
            "regex" => Some(Self::Regex),
            "not_regex" => Some(Self::NotRegex),
            "starts_with" => Some(Self::StartsWith),
            "ends_with" => Some(Self::EndsWith),
            _ => None,
        }
    }
}

/// Combinator for conditions within a group and groups within a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupLogic {
    And,
    Or,
}

impl GroupLogic {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "AND" => Some(Self::And),
            "OR" => Some(Self::Or),
            _ => None,
        }
    }
}

/// Kind of effect a matched rule produces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Skip,
    SetField,
}

impl ActionKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "skip" => Some(Self::Skip),
            "set_field" => Some(Self::SetField),
            _ => None,
        }
    }
}

/// Message fields a `set_field` action may mutate
///
/// The whitelist is deliberately small; extending it means extending both
/// this enum and the repository column mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MutableField {
    DispatcherId,
}

impl MutableField {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "dispatcher_id" => Some(Self::DispatcherId),
            _ => None,
        }
    }

    /// Column name in the `emails` table
    pub fn column(self) -> &'static str {
        match self {
            Self::DispatcherId => "dispatcher_id",
        }
    }
}

/// One leaf condition
#[derive(Debug, Clone)]
pub struct Condition {
    pub id: i64,
    pub field: FieldKind,
    pub operator: Operator,
    pub match_value: String,
    pub case_sensitive: bool,
    pub order: i32,
}

/// Ordered set of conditions combined by one logic operator
#[derive(Debug, Clone)]
pub struct ConditionGroup {
    pub id: i64,
    pub logic: GroupLogic,
    pub order: i32,
    pub conditions: Vec<Condition>,
}

/// One effect to execute when the rule matches
#[derive(Debug, Clone)]
pub struct RuleAction {
    pub id: i64,
    pub kind: ActionKind,
    /// JSON configuration blob (e.g. `{"field_name": ..., "field_value": ...}`)
    pub config: Option<Value>,
    pub order: i32,
}

/// A complete rule with its owned condition tree and actions
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub is_active: bool,
    /// Higher priority evaluates earlier; ties break by ascending id
    pub priority: i32,
    pub stop_on_match: bool,
    pub global_group_logic: GroupLogic,
    pub groups: Vec<ConditionGroup>,
    pub actions: Vec<RuleAction>,
}

/// The rule engine's output for one message
#[derive(Debug, Clone, Default)]
pub struct EffectSet {
    pub should_skip: bool,
    /// Reason attached by the first skip action, for logging
    pub skip_reason: Option<String>,
    /// Final field mutations; a higher-priority rule's write is never
    /// overwritten by a lower-priority one
    pub field_modifications: BTreeMap<MutableField, Value>,
    pub matched_rules: Vec<String>,
    pub errors: Vec<String>,
}

impl EffectSet {
    fn add_matched_rule(&mut self, name: &str) {
        if !self.matched_rules.iter().any(|n| n == name) {
            self.matched_rules.push(name.to_owned());
        }
    }
}

/// Evaluate a list of rules against a message
///
/// Rules are ordered by `priority DESC, id ASC`, matched rules execute their
/// actions in order, and iteration stops at a `stop_on_match` rule or once
/// the cumulative skip flag is set.
pub fn evaluate_rules(mut rules: Vec<Rule>, message: &CanonicalMessage) -> EffectSet {
    rules.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));

    let mut effects = EffectSet::default();
    let mut slowest: Option<(String, f64)> = None;

    for rule in &rules {
        let started = Instant::now();
        let matches = evaluate_rule(rule, message);

        if matches {
            debug!(rule = %rule.name, "rule matched");
            effects.add_matched_rule(&rule.name);
            execute_actions(rule, &mut effects);
        }

        let elapsed = started.elapsed().as_secs_f64();
        if elapsed > 1.0 {
            warn!(rule = %rule.name, seconds = elapsed, "slow rule evaluation");
        }
        if slowest.as_ref().is_none_or(|(_, t)| elapsed > *t) {
            slowest = Some((rule.name.clone(), elapsed));
        }

        if matches && rule.stop_on_match {
            debug!(rule = %rule.name, "stop_on_match set, ending rule evaluation");
            break;
        }
        if effects.should_skip {
            debug!(rule = %rule.name, "skip flag set, ending rule evaluation");
            break;
        }
    }

    if let Some((name, seconds)) = slowest {
        debug!(rule = %name, seconds, "slowest rule this evaluation");
    }
    effects
}

/// Evaluate one rule's condition expression
///
/// A rule with no groups matches; group results combine under the rule's
/// global logic with short-circuiting.
fn evaluate_rule(rule: &Rule, message: &CanonicalMessage) -> bool {
    if rule.groups.is_empty() {
        return true;
    }
    match rule.global_group_logic {
        GroupLogic::And => rule.groups.iter().all(|g| evaluate_group(g, message)),
        GroupLogic::Or => rule.groups.iter().any(|g| evaluate_group(g, message)),
    }
}

/// Evaluate one condition group
///
/// An empty group matches; `all`/`any` give the AND/OR short-circuit.
fn evaluate_group(group: &ConditionGroup, message: &CanonicalMessage) -> bool {
    if group.conditions.is_empty() {
        return true;
    }
    match group.logic {
        GroupLogic::And => group
            .conditions
            .iter()
            .all(|c| evaluate_condition(c, message)),
        GroupLogic::Or => group
            .conditions
            .iter()
            .any(|c| evaluate_condition(c, message)),
    }
}

/// Evaluate one condition against the message
pub fn evaluate_condition(condition: &Condition, message: &CanonicalMessage) -> bool {
    let field_value = extract_field(condition.field, message);
    apply_operator(
        condition.operator,
        &field_value,
        &condition.match_value,
        condition.case_sensitive,
    )
}

/// Extract the value of a condition field from the message
///
/// `sender` and `subject` are fully implemented; the remaining kinds are
/// recognized but yield an empty string rather than failing evaluation.
pub fn extract_field(kind: FieldKind, message: &CanonicalMessage) -> String {
    match kind {
        FieldKind::Sender => extract_sender(message.sender.as_deref().unwrap_or("")),
        FieldKind::Subject => clean_header_text(&message.subject),
        FieldKind::Body | FieldKind::Header | FieldKind::Attachment => String::new(),
    }
}

/// Unwrap a display-name address into its bare form
///
/// `"Name <a@x>"` yields `a@x`; an already-bare address passes through; any
/// other shape is returned trimmed.
pub fn extract_sender(raw: &str) -> String {
    let trimmed = raw.trim();
    if let (Some(open), Some(close)) = (trimmed.find('<'), trimmed.rfind('>'))
        && open < close
    {
        return trimmed[open + 1..close].trim().to_owned();
    }
    trimmed.to_owned()
}

/// Apply one operator to the extracted field value
///
/// Both sides fold to lowercase when `case_sensitive` is false, except for
/// the regex operators where case-insensitivity is a pattern flag. A
/// malformed regex evaluates to false under `regex` and to true under
/// `not_regex`, so broken expressions never spuriously skip messages.
pub fn apply_operator(
    operator: Operator,
    field_value: &str,
    match_value: &str,
    case_sensitive: bool,
) -> bool {
    let (field, needle) = if case_sensitive {
        (field_value.to_owned(), match_value.to_owned())
    } else {
        (field_value.to_lowercase(), match_value.to_lowercase())
    };

    match operator {
        Operator::Contains => field.contains(&needle),
        Operator::NotContains => !field.contains(&needle),
        Operator::Equals => field == needle,
        Operator::NotEquals => field != needle,
        Operator::StartsWith => field.starts_with(&needle),
        Operator::EndsWith => field.ends_with(&needle),
        Operator::Regex => regex_matches(field_value, match_value, case_sensitive).unwrap_or(false),
        Operator::NotRegex => !regex_matches(field_value, match_value, case_sensitive)
            .unwrap_or(false),
    }
}

/// Regex search; `None` for an empty or malformed pattern
fn regex_matches(field_value: &str, pattern: &str, case_sensitive: bool) -> Option<bool> {
    if pattern.is_empty() {
        warn!("empty regex pattern in rule condition");
        return None;
    }
    let full_pattern = if case_sensitive {
        pattern.to_owned()
    } else {
        format!("(?i){pattern}")
    };
    match Regex::new(&full_pattern) {
        Ok(re) => Some(re.is_match(field_value)),
        Err(e) => {
            warn!(pattern = %pattern, error = %e, "malformed regex in rule condition");
            None
        }
    }
}

/// Execute a matched rule's actions in order and merge their effects
///
/// Within the rule, `set_field` writes are last-write-wins; across rules the
/// merge keeps the first writer (the higher-priority rule). A failed action
/// is recorded and does not stop later actions of the same rule, but a skip
/// action does.
fn execute_actions(rule: &Rule, effects: &mut EffectSet) {
    let mut rule_mods: BTreeMap<MutableField, Value> = BTreeMap::new();

    for action in &rule.actions {
        match action.kind {
            ActionKind::Skip => {
                effects.should_skip = true;
                let reason = action
                    .config
                    .as_ref()
                    .and_then(|c| c.get("reason"))
                    .and_then(Value::as_str)
                    .unwrap_or("rule matched, skipping message")
                    .to_owned();
                info!(rule = %rule.name, reason = %reason, "skip action executed");
                if effects.skip_reason.is_none() {
                    effects.skip_reason = Some(reason);
                }
                break;
            }
            ActionKind::SetField => match parse_set_field(action) {
                Ok((field, value)) => {
                    debug!(rule = %rule.name, field = field.column(), "set_field action executed");
                    rule_mods.insert(field, value);
                }
                Err(e) => {
                    warn!(rule = %rule.name, action = action.id, error = %e, "action failed");
                    effects
                        .errors
                        .push(format!("rule '{}' action {}: {e}", rule.name, action.id));
                }
            },
        }
    }

    for (field, value) in rule_mods {
        effects.field_modifications.entry(field).or_insert(value);
    }
}

/// Validate and unpack a `set_field` action config
fn parse_set_field(action: &RuleAction) -> AppResult<(MutableField, Value)> {
    let config = action
        .config
        .as_ref()
        .ok_or_else(|| AppError::validation("set_field action has no config"))?;
    let field_name = config
        .get("field_name")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::validation("set_field config missing field_name"))?;
    let field = MutableField::parse(field_name).ok_or_else(|| {
        AppError::validation(format!("field '{field_name}' is not mutable by rules"))
    })?;
    let value = config.get("field_value").cloned().unwrap_or(Value::Null);
    if field == MutableField::DispatcherId && !(value.is_i64() || value.is_u64() || value.is_null())
    {
        return Err(AppError::validation(format!(
            "dispatcher_id must be an integer or null, got {value}"
        )));
    }
    Ok((field, value))
}

/// Repository-backed engine facade
///
/// Loads the active rule set per message and evaluates it. A rule-load
/// failure degrades to an empty effect set with the error recorded, so the
/// pipeline keeps running.
pub struct RuleEngine {
    repo: Repository,
}

impl RuleEngine {
    pub fn new(repo: Repository) -> Self {
        Self { repo }
    }

    pub async fn apply(&self, message: &CanonicalMessage) -> EffectSet {
        match self.repo.load_active_rules().await {
            Ok(rules) => {
                debug!(count = rules.len(), "loaded active rules");
                evaluate_rules(rules, message)
            }
            Err(e) => {
                warn!(error = %e, "failed to load active rules");
                let mut effects = EffectSet::default();
                effects.errors.push(format!("failed to load rules: {e}"));
                effects
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        ActionKind, Condition, ConditionGroup, FieldKind, GroupLogic, MutableField, Operator, Rule,
        RuleAction, apply_operator, evaluate_rules, extract_sender,
    };
    use crate::mime::CanonicalMessage;

    fn message(sender: &str, subject: &str) -> CanonicalMessage {
        CanonicalMessage {
            message_id: Some("<t@x>".to_owned()),
            sender: Some(sender.to_owned()),
            subject: subject.to_owned(),
            ..CanonicalMessage::default()
        }
    }

    fn condition(field: FieldKind, operator: Operator, value: &str) -> Condition {
        Condition {
            id: 1,
            field,
            operator,
            match_value: value.to_owned(),
            case_sensitive: false,
            order: 1,
        }
    }

    fn rule(id: i64, priority: i32, groups: Vec<ConditionGroup>, actions: Vec<RuleAction>) -> Rule {
        Rule {
            id,
            name: format!("rule-{id}"),
            description: None,
            is_active: true,
            priority,
            stop_on_match: false,
            global_group_logic: GroupLogic::And,
            groups,
            actions,
        }
    }

    fn group(logic: GroupLogic, conditions: Vec<Condition>) -> ConditionGroup {
        ConditionGroup {
            id: 1,
            logic,
            order: 1,
            conditions,
        }
    }

    fn skip_action() -> RuleAction {
        RuleAction {
            id: 1,
            kind: ActionKind::Skip,
            config: None,
            order: 1,
        }
    }

    fn set_dispatcher(id: i64, value: i64) -> RuleAction {
        RuleAction {
            id,
            kind: ActionKind::SetField,
            config: Some(json!({"field_name": "dispatcher_id", "field_value": value})),
            order: id as i32,
        }
    }

    #[test]
    fn empty_rule_set_produces_no_effects() {
        let effects = evaluate_rules(Vec::new(), &message("a@x", "hello"));
        assert!(!effects.should_skip);
        assert!(effects.field_modifications.is_empty());
        assert!(effects.matched_rules.is_empty());
        assert!(effects.errors.is_empty());
    }

    #[test]
    fn rule_without_groups_always_matches() {
        let r = rule(1, 1, Vec::new(), vec![skip_action()]);
        let effects = evaluate_rules(vec![r], &message("a@x", "hello"));
        assert!(effects.should_skip);
        assert_eq!(effects.matched_rules, vec!["rule-1".to_owned()]);
    }

    #[test]
    fn empty_group_counts_as_matching() {
        let r = rule(1, 1, vec![group(GroupLogic::And, Vec::new())], vec![skip_action()]);
        let effects = evaluate_rules(vec![r], &message("a@x", "hello"));
        assert!(effects.should_skip);
    }

    #[test]
    fn and_group_requires_all_conditions() {
        let g = group(
            GroupLogic::And,
            vec![
                condition(FieldKind::Sender, Operator::Contains, "noreply@"),
                condition(FieldKind::Subject, Operator::Contains, "invoice"),
            ],
        );
        let r = rule(1, 1, vec![g], vec![skip_action()]);

        let effects = evaluate_rules(vec![r.clone()], &message("noreply@x.test", "invoice 9"));
        assert!(effects.should_skip);

        let effects = evaluate_rules(vec![r], &message("noreply@x.test", "newsletter"));
        assert!(!effects.should_skip);
        assert!(effects.matched_rules.is_empty());
    }

    #[test]
    fn or_group_matches_on_any_condition() {
        let g = group(
            GroupLogic::Or,
            vec![
                condition(FieldKind::Sender, Operator::Contains, "noreply@"),
                condition(FieldKind::Subject, Operator::Contains, "invoice"),
            ],
        );
        let r = rule(1, 1, vec![g], vec![skip_action()]);
        let effects = evaluate_rules(vec![r], &message("person@x.test", "invoice 9"));
        assert!(effects.should_skip);
    }

    #[test]
    fn or_global_logic_combines_groups() {
        let g1 = group(
            GroupLogic::And,
            vec![condition(FieldKind::Sender, Operator::Equals, "no-match@x")],
        );
        let g2 = group(
            GroupLogic::And,
            vec![condition(FieldKind::Subject, Operator::StartsWith, "urgent")],
        );
        let mut r = rule(1, 1, vec![g1, g2], vec![skip_action()]);
        r.global_group_logic = GroupLogic::Or;
        let effects = evaluate_rules(vec![r], &message("a@x", "Urgent: roof leak"));
        assert!(effects.should_skip);
    }

    #[test]
    fn higher_priority_rule_wins_field_modification() {
        let r1 = rule(5, 20, Vec::new(), vec![set_dispatcher(1, 7)]);
        let r2 = rule(6, 10, Vec::new(), vec![set_dispatcher(2, 9)]);
        let effects = evaluate_rules(vec![r2, r1], &message("a@x", "hello"));
        assert_eq!(
            effects.field_modifications.get(&MutableField::DispatcherId),
            Some(&json!(7))
        );
        assert_eq!(effects.matched_rules, vec!["rule-5".to_owned(), "rule-6".to_owned()]);
    }

    #[test]
    fn priority_ties_break_by_ascending_id() {
        let r1 = rule(2, 10, Vec::new(), vec![set_dispatcher(1, 7)]);
        let r2 = rule(9, 10, Vec::new(), vec![set_dispatcher(2, 9)]);
        let effects = evaluate_rules(vec![r2, r1], &message("a@x", "hello"));
        assert_eq!(
            effects.field_modifications.get(&MutableField::DispatcherId),
            Some(&json!(7))
        );
    }

    #[test]
    fn within_rule_last_set_field_wins() {
        let r = rule(1, 1, Vec::new(), vec![set_dispatcher(1, 7), set_dispatcher(2, 9)]);
        let effects = evaluate_rules(vec![r], &message("a@x", "hello"));
        assert_eq!(
            effects.field_modifications.get(&MutableField::DispatcherId),
            Some(&json!(9))
        );
    }

    #[test]
    fn stop_on_match_blocks_downstream_rules() {
        let mut r1 = rule(1, 20, Vec::new(), Vec::new());
        r1.stop_on_match = true;
        let r2 = rule(2, 10, Vec::new(), vec![set_dispatcher(1, 9)]);
        let effects = evaluate_rules(vec![r1, r2], &message("a@x", "hello"));
        assert!(effects.field_modifications.is_empty());
        assert_eq!(effects.matched_rules, vec!["rule-1".to_owned()]);
    }

    #[test]
    fn skip_blocks_downstream_rules_and_later_actions() {
        let r1 = rule(1, 20, Vec::new(), vec![skip_action(), set_dispatcher(2, 7)]);
        let r2 = rule(2, 10, Vec::new(), vec![set_dispatcher(1, 9)]);
        let effects = evaluate_rules(vec![r1, r2], &message("a@x", "hello"));
        assert!(effects.should_skip);
        assert!(effects.field_modifications.is_empty());
        assert_eq!(effects.matched_rules, vec!["rule-1".to_owned()]);
    }

    #[test]
    fn skip_reason_comes_from_action_config() {
        let r = rule(
            1,
            1,
            Vec::new(),
            vec![RuleAction {
                id: 1,
                kind: ActionKind::Skip,
                config: Some(json!({"reason": "automated sender"})),
                order: 1,
            }],
        );
        let effects = evaluate_rules(vec![r], &message("a@x", "hello"));
        assert_eq!(effects.skip_reason.as_deref(), Some("automated sender"));
    }

    #[test]
    fn invalid_field_name_records_error_but_later_actions_run() {
        let bad = RuleAction {
            id: 1,
            kind: ActionKind::SetField,
            config: Some(json!({"field_name": "subject", "field_value": "x"})),
            order: 1,
        };
        let r = rule(1, 1, Vec::new(), vec![bad, set_dispatcher(2, 4)]);
        let effects = evaluate_rules(vec![r], &message("a@x", "hello"));
        assert_eq!(effects.errors.len(), 1);
        assert!(effects.errors[0].contains("not mutable"));
        assert_eq!(
            effects.field_modifications.get(&MutableField::DispatcherId),
            Some(&json!(4))
        );
    }

    #[test]
    fn malformed_regex_is_false_and_not_regex_is_true() {
        assert!(!apply_operator(Operator::Regex, "anything", "[", false));
        assert!(apply_operator(Operator::NotRegex, "anything", "[", false));
        assert!(!apply_operator(Operator::Regex, "anything", "", false));
        assert!(apply_operator(Operator::NotRegex, "anything", "", false));
    }

    #[test]
    fn regex_case_sensitivity_is_a_pattern_flag() {
        assert!(apply_operator(Operator::Regex, "Quote Request", "^quote", false));
        assert!(!apply_operator(Operator::Regex, "Quote Request", "^quote", true));
        assert!(apply_operator(Operator::Regex, "Quote Request", "^Quote", true));
    }

    #[test]
    fn case_folding_applies_to_plain_operators() {
        assert!(apply_operator(Operator::Contains, "Hello World", "hello", false));
        assert!(!apply_operator(Operator::Contains, "Hello World", "hello", true));
        assert!(apply_operator(Operator::Equals, "ABC", "abc", false));
        assert!(apply_operator(Operator::NotEquals, "ABC", "abc", true));
        assert!(apply_operator(Operator::StartsWith, "Fwd: hi", "fwd:", false));
        assert!(apply_operator(Operator::EndsWith, "report.PDF", ".pdf", false));
        assert!(apply_operator(Operator::NotContains, "plain", "html", false));
    }

    #[test]
    fn extract_sender_unwraps_display_names() {
        assert_eq!(extract_sender("Zhang Wei <wei@x.cn>"), "wei@x.cn");
        assert_eq!(extract_sender("wei@x.cn"), "wei@x.cn");
        assert_eq!(extract_sender("  spaced@x.cn  "), "spaced@x.cn");
        assert_eq!(extract_sender("Just A Name"), "Just A Name");
    }

    #[test]
    fn null_dispatcher_value_is_accepted() {
        let clear = RuleAction {
            id: 1,
            kind: ActionKind::SetField,
            config: Some(json!({"field_name": "dispatcher_id", "field_value": null})),
            order: 1,
        };
        let r = rule(1, 1, Vec::new(), vec![clear]);
        let effects = evaluate_rules(vec![r], &message("a@x", "hello"));
        assert_eq!(
            effects.field_modifications.get(&MutableField::DispatcherId),
            Some(&serde_json::Value::Null)
        );
        assert!(effects.errors.is_empty());
    }

    #[test]
    fn non_integer_dispatcher_value_is_rejected() {
        let bad = RuleAction {
            id: 1,
            kind: ActionKind::SetField,
            config: Some(json!({"field_name": "dispatcher_id", "field_value": "seven"})),
            order: 1,
        };
        let r = rule(1, 1, Vec::new(), vec![bad]);
        let effects = evaluate_rules(vec![r], &message("a@x", "hello"));
        assert!(effects.field_modifications.is_empty());
        assert_eq!(effects.errors.len(), 1);
    }
}

use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use std::collections::HashMap;

use crate::config::{Action, Criteria, FilterRule};
use crate::filter::{Filter, Stage};
use crate::mail::Mail;
use crate::outcome::{Halt, Outcome, OutcomeKind};

/// Configured policy rules for one stage. The first matching rule decides.
pub struct RulesFilter {
    name: String,
    rules: Vec<FilterRule>,
    compiled_patterns: HashMap<String, Regex>,
}

/// Translates a shell glob into an anchored regex.
///
/// Besides `*` and `?`, `[abc]` matches one character of a set and
/// `[[abc]]` one or more; a leading `!` negates either form. Ranges such
/// as `[0-9]` are kept. `\[` and `\]` match literal brackets.
pub fn glob_to_regex(glob: &str) -> String {
    let chars: Vec<char> = glob.chars().collect();
    let mut regex = String::from("^");
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            '\\' if matches!(chars.get(i + 1), Some(&'[') | Some(&']')) => {
                regex.push('\\');
                regex.push(chars[i + 1]);
                i += 1;
            }
            '[' => {
                let repeated = chars.get(i + 1) == Some(&'[');
                let open = if repeated { i + 2 } else { i + 1 };
                match bracket_class(&chars, open, repeated) {
                    Some((class, next)) => {
                        regex.push_str(&class);
                        if repeated {
                            regex.push('+');
                        }
                        i = next;
                        continue;
                    }
                    None => regex.push_str(r"\["),
                }
            }
            other => regex.push_str(&regex::escape(&other.to_string())),
        }
        i += 1;
    }
    regex.push('$');
    regex
}

/// Reads a set starting at `start` up to its closing `]` (or `]]`).
/// Returns the regex class and the index after the closing bracket.
fn bracket_class(chars: &[char], start: usize, repeated: bool) -> Option<(String, usize)> {
    let mut class = String::from("[");
    let mut i = start;
    if chars.get(i) == Some(&'!') {
        class.push('^');
        i += 1;
    }
    let first = i;
    while i < chars.len() {
        match chars[i] {
            ']' if i > first => {
                if !repeated {
                    class.push(']');
                    return Some((class, i + 1));
                }
                if chars.get(i + 1) == Some(&']') {
                    class.push(']');
                    return Some((class, i + 2));
                }
                return None;
            }
            c if c.is_alphanumeric() || c == '-' => class.push(c),
            c => class.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }
    None
}

fn compile(pattern: &str) -> anyhow::Result<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|e| anyhow::anyhow!("Invalid regex pattern '{}': {}", pattern, e))
}

fn glob_key(pattern: &str) -> String {
    format!("glob:{pattern}")
}

impl RulesFilter {
    /// Groups rules by stage, compiling every pattern up front.
    pub fn compile(rules: &[FilterRule]) -> anyhow::Result<Vec<(Stage, RulesFilter)>> {
        let mut grouped: Vec<(Stage, Vec<FilterRule>)> = Vec::new();
        for rule in rules {
            match grouped.iter_mut().find(|(stage, _)| *stage == rule.stage) {
                Some((_, list)) => list.push(rule.clone()),
                None => grouped.push((rule.stage, vec![rule.clone()])),
            }
        }

        grouped
            .into_iter()
            .map(|(stage, rules)| Ok((stage, RulesFilter::new(stage, rules)?)))
            .collect()
    }

    pub fn new(stage: Stage, rules: Vec<FilterRule>) -> anyhow::Result<Self> {
        let mut filter = RulesFilter {
            name: format!("rules:{stage}"),
            rules,
            compiled_patterns: HashMap::new(),
        };
        let rules = filter.rules.clone();
        for rule in &rules {
            filter.compile_criteria_patterns(&rule.criteria)?;
        }
        Ok(filter)
    }

    fn compile_criteria_patterns(&mut self, criteria: &Criteria) -> anyhow::Result<()> {
        match criteria {
            Criteria::SenderPattern { pattern }
            | Criteria::RecipientPattern { pattern }
            | Criteria::HeloPattern { pattern }
            | Criteria::SenderIpPattern { pattern }
            | Criteria::SenderNamePattern { pattern }
            | Criteria::HeaderPattern { pattern, .. } => {
                if !self.compiled_patterns.contains_key(pattern) {
                    self.compiled_patterns
                        .insert(pattern.clone(), compile(pattern)?);
                }
            }
            Criteria::SenderGlob { pattern } | Criteria::RecipientGlob { pattern } => {
                let key = glob_key(pattern);
                if !self.compiled_patterns.contains_key(&key) {
                    self.compiled_patterns
                        .insert(key, compile(&glob_to_regex(pattern))?);
                }
            }
            Criteria::And { criteria } | Criteria::Or { criteria } => {
                for c in criteria {
                    self.compile_criteria_patterns(c)?;
                }
            }
            Criteria::Not { criteria } => self.compile_criteria_patterns(criteria)?,
        }
        Ok(())
    }

    fn is_match(&self, key: &str, value: &str) -> bool {
        self.compiled_patterns
            .get(key)
            .map(|regex| regex.is_match(value))
            .unwrap_or(false)
    }

    fn evaluate_criteria(&self, criteria: &Criteria, mail: &Mail) -> bool {
        match criteria {
            Criteria::SenderPattern { pattern } => self.is_match(pattern, mail.sender()),
            Criteria::RecipientPattern { pattern } => mail
                .recipients()
                .iter()
                .any(|recipient| self.is_match(pattern, recipient)),
            Criteria::HeloPattern { pattern } => self.is_match(pattern, mail.helo()),
            Criteria::SenderIpPattern { pattern } => {
                self.is_match(pattern, &mail.connection.sender_ip)
            }
            Criteria::SenderNamePattern { pattern } => {
                self.is_match(pattern, &mail.connection.sender_name)
            }
            Criteria::HeaderPattern { header, pattern } => mail
                .header(header)
                .map(|values| values.iter().any(|v| self.is_match(pattern, v)))
                .unwrap_or(false),
            Criteria::SenderGlob { pattern } => self.is_match(&glob_key(pattern), mail.sender()),
            Criteria::RecipientGlob { pattern } => {
                let key = glob_key(pattern);
                mail.recipients()
                    .iter()
                    .any(|recipient| self.is_match(&key, recipient))
            }
            Criteria::And { criteria } => criteria.iter().all(|c| self.evaluate_criteria(c, mail)),
            Criteria::Or { criteria } => criteria.iter().any(|c| self.evaluate_criteria(c, mail)),
            Criteria::Not { criteria } => !self.evaluate_criteria(criteria, mail),
        }
    }

    fn apply(&self, action: &Action, mail: &mut Mail) -> Result<(), Halt> {
        let outcome = |kind: OutcomeKind, code: &Option<u16>, message: &Option<String>| {
            Outcome::new(
                kind,
                code.unwrap_or(kind.default_code()),
                message
                    .clone()
                    .unwrap_or_else(|| kind.default_message().to_string()),
            )
        };

        match action {
            Action::Reject { code, message } => {
                Err(outcome(OutcomeKind::Reject, code, message).into())
            }
            Action::Defer { code, message } => Err(outcome(OutcomeKind::Defer, code, message).into()),
            Action::Quarantine { code, message } => {
                Err(outcome(OutcomeKind::Quarantine, code, message).into())
            }
            Action::Drop { code, message } => Err(outcome(OutcomeKind::Drop, code, message).into()),
            Action::Route { destination } => {
                mail.route_to(destination).map_err(anyhow::Error::from)?;
                Ok(())
            }
            Action::AddHeader { name, value } => {
                mail.append_header(name, value.clone());
                Ok(())
            }
            Action::Accept => Ok(()),
        }
    }
}

#[async_trait]
impl Filter for RulesFilter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn filter(&self, mail: &mut Mail) -> Result<(), Halt> {
        for rule in &self.rules {
            if self.evaluate_criteria(&rule.criteria, mail) {
                log::info!(
                    "Rule '{}' matched, applying action: {:?}",
                    rule.name,
                    rule.action
                );
                return self.apply(&rule.action, mail);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::Destination;

    fn rule(name: &str, stage: Stage, criteria: Criteria, action: Action) -> FilterRule {
        FilterRule {
            name: name.to_string(),
            stage,
            criteria,
            action,
        }
    }

    fn mail() -> Mail {
        let mut mail = Mail::new();
        mail.set_helo("client.example.net");
        mail.set_sender("alice@example.com");
        mail.add_recipient("bob@blocked.example");
        mail.connection.sender_ip = "192.0.2.10".to_string();
        mail.append_header("Subject", "Cheap pills");
        mail
    }

    #[test]
    fn test_glob_to_regex() {
        assert_eq!(glob_to_regex("*.example.com"), r"^.*\.example\.com$");
        assert_eq!(glob_to_regex("user?@[!x]*"), "^user.@[^x].*$");
        assert_eq!(glob_to_regex("user[0-9]@example.com"), r"^user[0-9]@example\.com$");
    }

    #[test]
    fn test_glob_sets_ranges_and_literal_brackets() {
        let pattern = r"a[abc][[cde]]f?g*\[\][!g0-9][[!h0-9]]";
        assert_eq!(glob_to_regex(pattern), r"^a[abc][cde]+f.g.*\[\][^g0-9][^h0-9]+$");

        let glob = compile(&glob_to_regex(pattern)).unwrap();
        assert!(glob.is_match("abcccdef1g23[]hklmnop"));
        assert!(!glob.is_match("ade"));

        let range = compile(&glob_to_regex("user[0-9]@example.com")).unwrap();
        assert!(range.is_match("user5@example.com"));
        assert!(!range.is_match("user-@example.com"));
    }

    #[test]
    fn test_unterminated_set_is_literal() {
        let glob = compile(&glob_to_regex("a[bc")).unwrap();
        assert!(glob.is_match("a[bc"));
        assert!(!glob.is_match("ab"));
    }

    #[test]
    fn test_rules_grouped_by_stage() {
        let rules = vec![
            rule("a", Stage::Data, Criteria::SenderPattern { pattern: "x".into() }, Action::Accept),
            rule("b", Stage::RcptTo, Criteria::SenderPattern { pattern: "y".into() }, Action::Accept),
            rule("c", Stage::Data, Criteria::SenderPattern { pattern: "z".into() }, Action::Accept),
        ];
        let grouped = RulesFilter::compile(&rules).unwrap();
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[0].0, Stage::Data);
        assert_eq!(grouped[0].1.rules.len(), 2);
        assert_eq!(grouped[1].1.name(), "rules:rcpt_to");
    }

    #[tokio::test]
    async fn test_reject_rule_with_custom_code() {
        let filter = RulesFilter::new(
            Stage::RcptTo,
            vec![rule(
                "block",
                Stage::RcptTo,
                Criteria::RecipientGlob {
                    pattern: "*@BLOCKED.example".into(),
                },
                Action::Reject {
                    code: Some(552),
                    message: Some("blocked".into()),
                },
            )],
        )
        .unwrap();

        let mut mail = mail();
        match filter.filter(&mut mail).await {
            Err(Halt::Outcome(outcome)) => assert_eq!(outcome.to_string(), "552 blocked"),
            _ => panic!("Expected reject outcome"),
        }
    }

    #[tokio::test]
    async fn test_combination_criteria() {
        let filter = RulesFilter::new(
            Stage::Data,
            vec![rule(
                "pills from outside",
                Stage::Data,
                Criteria::And {
                    criteria: vec![
                        Criteria::HeaderPattern {
                            header: "subject".into(),
                            pattern: "pills".into(),
                        },
                        Criteria::Not {
                            criteria: Box::new(Criteria::SenderIpPattern {
                                pattern: r"^10\.".into(),
                            }),
                        },
                    ],
                },
                Action::Quarantine {
                    code: None,
                    message: None,
                },
            )],
        )
        .unwrap();

        let mut mail = mail();
        match filter.filter(&mut mail).await {
            Err(Halt::Outcome(outcome)) => {
                assert_eq!(outcome.kind(), OutcomeKind::Quarantine);
                assert_eq!(outcome.to_string(), "250 Ok");
            }
            _ => panic!("Expected quarantine outcome"),
        }

        mail.connection.sender_ip = "10.1.1.1".to_string();
        assert!(filter.filter(&mut mail).await.is_ok());
    }

    #[tokio::test]
    async fn test_first_match_wins_and_route() {
        let filter = RulesFilter::new(
            Stage::Data,
            vec![
                rule(
                    "tag",
                    Stage::Data,
                    Criteria::HeloPattern {
                        pattern: r"example\.net$".into(),
                    },
                    Action::AddHeader {
                        name: "X-Tagged".into(),
                        value: "yes".into(),
                    },
                ),
                rule(
                    "route",
                    Stage::Data,
                    Criteria::SenderGlob { pattern: "*".into() },
                    Action::Route {
                        destination: "10.0.0.9:25".into(),
                    },
                ),
            ],
        )
        .unwrap();

        let mut mail = mail();
        assert!(filter.filter(&mut mail).await.is_ok());
        assert_eq!(mail.header("x-tagged").unwrap(), ["yes"]);
        assert_eq!(mail.final_destination(), &Destination::Allow);

        mail.set_helo("other.host");
        assert!(filter.filter(&mut mail).await.is_ok());
        assert_eq!(mail.final_destination().to_string(), "10.0.0.9:25");
    }

    #[tokio::test]
    async fn test_invalid_route_is_a_failure() {
        let filter = RulesFilter::new(
            Stage::Data,
            vec![rule(
                "bad route",
                Stage::Data,
                Criteria::SenderPattern { pattern: ".".into() },
                Action::Route {
                    destination: "nowhere".into(),
                },
            )],
        )
        .unwrap();
        match filter.filter(&mut mail()).await {
            Err(Halt::Failed(_)) => {}
            _ => panic!("Expected failure for invalid destination"),
        }
    }

    #[test]
    fn test_invalid_regex_is_rejected() {
        let result = RulesFilter::new(
            Stage::Data,
            vec![rule(
                "broken",
                Stage::Data,
                Criteria::Or {
                    criteria: vec![Criteria::SenderPattern { pattern: "(".into() }],
                },
                Action::Accept,
            )],
        );
        assert!(result.is_err());
    }
}

//! `{{if <cond> then <expr> [else <expr>]}}` expressions.

use serde_json::Value;

use super::path::{as_number, is_truthy, stringify};

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Literal(Value),
    Token(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Gt,
    Lt,
    Ge,
    Le,
    Eq,
    Ne,
}

impl CompareOp {
    fn parse(word: &str) -> Option<Self> {
        match word {
            ">" => Some(Self::Gt),
            "<" => Some(Self::Lt),
            ">=" => Some(Self::Ge),
            "<=" => Some(Self::Le),
            "==" => Some(Self::Eq),
            "!=" => Some(Self::Ne),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Truthy(Operand),
    Compare {
        lhs: Operand,
        op: CompareOp,
        rhs: Operand,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Conditional {
    pub condition: Condition,
    pub then_branch: Operand,
    pub else_branch: Option<Operand>,
}

#[derive(Debug, Clone, PartialEq)]
enum Word {
    Bare(String),
    Quoted(String),
}

impl Word {
    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self, Word::Bare(w) if w.eq_ignore_ascii_case(keyword))
    }
}

/// True when the inside of a `{{ }}` pair starts with the `if` keyword.
pub fn starts_conditional(inner: &str) -> bool {
    let trimmed = inner.trim_start();
    trimmed
        .get(..2)
        .is_some_and(|keyword| keyword.eq_ignore_ascii_case("if"))
        && trimmed
            .get(2..)
            .is_some_and(|rest| rest.starts_with(char::is_whitespace))
}

impl Conditional {
    pub fn parse(inner: &str) -> Option<Self> {
        let words = split_words(inner)?;
        if !words.first()?.is_keyword("if") {
            return None;
        }
        let then_idx = words.iter().position(|w| w.is_keyword("then"))?;
        let else_idx = words[then_idx + 1..]
            .iter()
            .position(|w| w.is_keyword("else"))
            .map(|i| i + then_idx + 1);

        let condition = parse_condition(&words[1..then_idx])?;
        let then_end = else_idx.unwrap_or(words.len());
        let then_branch = branch_operand(&words[then_idx + 1..then_end])?;
        let else_branch = match else_idx {
            Some(idx) => Some(branch_operand(&words[idx + 1..])?),
            None => None,
        };

        Some(Self {
            condition,
            then_branch,
            else_branch,
        })
    }

    /// Token names referenced by the condition and the branches.
    pub fn token_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        match &self.condition {
            Condition::Truthy(op) => push_token(&mut names, op),
            Condition::Compare { lhs, rhs, .. } => {
                push_token(&mut names, lhs);
                push_token(&mut names, rhs);
            }
        }
        push_token(&mut names, &self.then_branch);
        if let Some(else_branch) = &self.else_branch {
            push_token(&mut names, else_branch);
        }
        names
    }

    pub fn literal_branches(&self) -> impl Iterator<Item = &str> {
        [Some(&self.then_branch), self.else_branch.as_ref()]
            .into_iter()
            .flatten()
            .filter_map(|op| match op {
                Operand::Literal(Value::String(s)) => Some(s.as_str()),
                _ => None,
            })
    }

    /// Picks the branch; `None` means "false with no else clause".
    pub fn select<F>(&self, resolve: F) -> Option<&Operand>
    where
        F: Fn(&str) -> Value,
    {
        let operand_value = |op: &Operand| match op {
            Operand::Literal(v) => v.clone(),
            Operand::Token(name) => resolve(name),
        };
        let holds = match &self.condition {
            Condition::Truthy(op) => is_truthy(&operand_value(op)),
            Condition::Compare { lhs, op, rhs } => {
                compare(&operand_value(lhs), *op, &operand_value(rhs))
            }
        };
        if holds {
            Some(&self.then_branch)
        } else {
            self.else_branch.as_ref()
        }
    }
}

fn push_token(names: &mut Vec<String>, op: &Operand) {
    if let Operand::Token(name) = op {
        names.push(name.clone());
    }
}

fn parse_condition(words: &[Word]) -> Option<Condition> {
    match words {
        [single] => Some(Condition::Truthy(operand(single))),
        [lhs, Word::Bare(op), rhs] => Some(Condition::Compare {
            lhs: operand(lhs),
            op: CompareOp::parse(op)?,
            rhs: operand(rhs),
        }),
        _ => None,
    }
}

fn branch_operand(words: &[Word]) -> Option<Operand> {
    match words {
        [] => None,
        [single] => Some(operand(single)),
        many => {
            let text = many
                .iter()
                .map(|w| match w {
                    Word::Bare(s) | Word::Quoted(s) => s.as_str(),
                })
                .collect::<Vec<_>>()
                .join(" ");
            Some(Operand::Literal(Value::String(text)))
        }
    }
}

fn operand(word: &Word) -> Operand {
    match word {
        Word::Quoted(s) => Operand::Literal(Value::String(s.clone())),
        Word::Bare(s) => {
            if let Ok(i) = s.parse::<i64>() {
                Operand::Literal(Value::from(i))
            } else if let Some(f) = s.parse::<f64>().ok().filter(|f| f.is_finite()) {
                Operand::Literal(Value::from(f))
            } else if s == "true" || s == "false" {
                Operand::Literal(Value::Bool(s == "true"))
            } else {
                Operand::Token(s.clone())
            }
        }
    }
}

fn compare(lhs: &Value, op: CompareOp, rhs: &Value) -> bool {
    if let (Some(a), Some(b)) = (as_number(lhs), as_number(rhs)) {
        return match op {
            CompareOp::Gt => a > b,
            CompareOp::Lt => a < b,
            CompareOp::Ge => a >= b,
            CompareOp::Le => a <= b,
            CompareOp::Eq => a == b,
            CompareOp::Ne => a != b,
        };
    }
    let (a, b) = (stringify(lhs), stringify(rhs));
    match op {
        CompareOp::Gt => a > b,
        CompareOp::Lt => a < b,
        CompareOp::Ge => a >= b,
        CompareOp::Le => a <= b,
        CompareOp::Eq => a == b,
        CompareOp::Ne => a != b,
    }
}

fn split_words(input: &str) -> Option<Vec<Word>> {
    let mut words = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&ch) = chars.peek() {
        if ch.is_whitespace() {
            chars.next();
            continue;
        }
        if ch == '"' || ch == '\'' {
            chars.next();
            let mut text = String::new();
            let mut closed = false;
            while let Some(c) = chars.next() {
                if c == '\\' {
                    if let Some(escaped) = chars.next() {
                        text.push(escaped);
                    }
                } else if c == ch {
                    closed = true;
                    break;
                } else {
                    text.push(c);
                }
            }
            if !closed {
                return None;
            }
            words.push(Word::Quoted(text));
        } else {
            let mut text = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                text.push(c);
                chars.next();
            }
            words.push(Word::Bare(text));
        }
    }
    Some(words)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_comparison_with_else() {
        let cond = Conditional::parse(r#"if count:asset:av > 0 then list:asset:av else "none""#)
            .unwrap();
        assert_eq!(
            cond.condition,
            Condition::Compare {
                lhs: Operand::Token("count:asset:av".into()),
                op: CompareOp::Gt,
                rhs: Operand::Literal(json!(0)),
            }
        );
        assert_eq!(cond.then_branch, Operand::Token("list:asset:av".into()));
        assert_eq!(cond.else_branch, Some(Operand::Literal(json!("none"))));
    }

    #[test]
    fn test_if_keyword_is_case_insensitive() {
        assert!(starts_conditional("IF x then y"));
        assert!(Conditional::parse("If x THEN 'yes'").is_some());
        assert!(!starts_conditional("iffy"));
    }

    #[test]
    fn test_multibyte_token_start_is_not_conditional() {
        assert!(!starts_conditional("né"));
        assert!(!starts_conditional(" 日本"));
        assert!(!starts_conditional("é"));
        assert!(!starts_conditional("if"));
        assert!(starts_conditional("if\u{a0}x then y"));
    }

    #[test]
    fn test_numeric_strings_compare_as_numbers() {
        let cond = Conditional::parse("if total >= 10 then 'big' else 'small'").unwrap();
        let picked = cond.select(|_| json!("9"));
        assert_eq!(picked, Some(&Operand::Literal(json!("small"))));
        let picked = cond.select(|_| json!("12"));
        assert_eq!(picked, Some(&Operand::Literal(json!("big"))));
    }

    #[test]
    fn test_false_without_else_selects_nothing() {
        let cond = Conditional::parse("if flag then 'on'").unwrap();
        assert_eq!(cond.select(|_| json!("")), None);
        assert!(cond.select(|_| json!([1])).is_some());
    }

    #[test]
    fn test_unterminated_quote_is_rejected() {
        assert!(Conditional::parse("if a then \"oops").is_none());
        assert!(Conditional::parse("if a b c d then x").is_none());
    }
}

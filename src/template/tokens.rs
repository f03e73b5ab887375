use super::conditional::{starts_conditional, Conditional};

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Token(String),
    Conditional(Conditional),
    /// Unparseable `{{...}}`; rendered back as its raw text.
    Invalid,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Segment<'a> {
    Text(&'a str),
    Expr { raw: &'a str, expr: Expr },
}

/// Splits `input` into literal text and `{{ }}` expressions.
pub fn scan(input: &str) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    let mut rest_start = 0;
    let mut cursor = 0;

    while let Some(offset) = input[cursor..].find("{{") {
        let open = cursor + offset;
        let inner_start = open + 2;
        let Some(close) = find_close(input, inner_start) else {
            break;
        };
        if open > rest_start {
            segments.push(Segment::Text(&input[rest_start..open]));
        }
        let inner = &input[inner_start..close];
        segments.push(Segment::Expr {
            raw: &input[open..close + 2],
            expr: parse_expr(inner),
        });
        cursor = close + 2;
        rest_start = cursor;
    }

    if rest_start < input.len() {
        segments.push(Segment::Text(&input[rest_start..]));
    }
    segments
}

/// Names of every plain token and conditional operand in `input`.
pub fn referenced_tokens(input: &str) -> Vec<String> {
    let mut names = Vec::new();
    for segment in scan(input) {
        if let Segment::Expr { expr, .. } = segment {
            match expr {
                Expr::Token(name) => names.push(name),
                Expr::Conditional(cond) => {
                    names.extend(cond.token_names());
                    for literal in cond.literal_branches() {
                        names.extend(referenced_tokens(literal));
                    }
                }
                Expr::Invalid => {}
            }
        }
    }
    names
}

/// Single token spanning the whole (trimmed) input, if any.
pub fn whole_token(input: &str) -> Option<String> {
    let trimmed = input.trim();
    match scan(trimmed).as_slice() {
        [Segment::Expr {
            raw,
            expr: Expr::Token(name),
        }] if raw.len() == trimmed.len() => Some(name.clone()),
        _ => None,
    }
}

fn parse_expr(inner: &str) -> Expr {
    if starts_conditional(inner) {
        return Conditional::parse(inner)
            .map(Expr::Conditional)
            .unwrap_or(Expr::Invalid);
    }
    let name = inner.trim();
    if name.is_empty() || name.contains(char::is_whitespace) {
        Expr::Invalid
    } else {
        Expr::Token(name.to_string())
    }
}

fn find_close(input: &str, from: usize) -> Option<usize> {
    let inner = &input[from..];
    if !starts_conditional(inner.split("}}").next().unwrap_or_default()) {
        return inner.find("}}").map(|i| from + i);
    }

    let bytes = input.as_bytes();
    let mut quote: Option<u8> = None;
    let mut i = from;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                if b == b'\\' {
                    i += 1;
                } else if b == q {
                    quote = None;
                }
            }
            None => {
                if b == b'"' || b == b'\'' {
                    quote = Some(b);
                } else if b == b'}' && bytes.get(i + 1) == Some(&b'}') {
                    return Some(i);
                }
            }
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_mixed_text_and_tokens() {
        let segments = scan("Hello {{ user.name }}, ticket {{TICKET_ID}}!");
        assert_eq!(segments.len(), 5);
        assert_eq!(segments[0], Segment::Text("Hello "));
        assert_eq!(
            segments[1],
            Segment::Expr {
                raw: "{{ user.name }}",
                expr: Expr::Token("user.name".into())
            }
        );
        assert_eq!(segments[4], Segment::Text("!"));
    }

    #[test]
    fn test_unclosed_braces_stay_literal() {
        assert_eq!(scan("a {{ b"), vec![Segment::Text("a {{ b")]);
    }

    #[test]
    fn test_braces_inside_quoted_branch() {
        let segments = scan(r#"{{if x then "}}" else "y"}} tail"#);
        assert!(matches!(
            &segments[0],
            Segment::Expr { expr: Expr::Conditional(_), .. }
        ));
        assert_eq!(segments[1], Segment::Text(" tail"));
    }

    #[test]
    fn test_referenced_tokens_include_conditional_operands() {
        let names = referenced_tokens(r#"{{if count:asset:av > 0 then list:asset:av else "{{FALLBACK}}"}} {{ticket.id}}"#);
        assert_eq!(
            names,
            vec!["count:asset:av", "list:asset:av", "FALLBACK", "ticket.id"]
        );
    }

    #[test]
    fn test_whole_token_detection() {
        assert_eq!(whole_token("  {{ ticket.id }} "), Some("ticket.id".into()));
        assert_eq!(whole_token("id={{ticket.id}}"), None);
        assert_eq!(whole_token("{{a}}{{b}}"), None);
    }
}

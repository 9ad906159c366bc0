//! Arithmetic over status counts: `+ - * /` with the usual two precedence
//! levels, evaluated left to right. No parentheses or unary operators.

use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum FormulaError {
    #[error("formula is empty")]
    Empty,
    #[error("unknown variable: {0}")]
    UnknownVariable(String),
    #[error("invalid number: {0}")]
    InvalidNumber(String),
    #[error("unexpected character {0:?} at {1}")]
    UnexpectedChar(char, usize),
    #[error("expected {0}")]
    Expected(&'static str),
}

/// Aggregate counts the formula variables refer to.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Counts {
    pub up: f64,
    pub down: f64,
    pub degraded: f64,
    pub maintenance: f64,
}

impl Counts {
    fn lookup(&self, name: &str) -> Option<f64> {
        match name {
            "up" => Some(self.up),
            "down" => Some(self.down),
            "degraded" => Some(self.degraded),
            "maintenance" => Some(self.maintenance),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token {
    Value(f64),
    Op(char),
}

fn tokenize(formula: &str, counts: &Counts) -> Result<Vec<Token>, FormulaError> {
    let chars: Vec<char> = formula.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if matches!(c, '+' | '-' | '*' | '/') {
            tokens.push(Token::Op(c));
            i += 1;
        } else if c.is_ascii_digit() || c == '.' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let literal: String = chars[start..i].iter().collect();
            let value = literal
                .parse::<f64>()
                .map_err(|_| FormulaError::InvalidNumber(literal.clone()))?;
            tokens.push(Token::Value(value));
        } else if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let name: String = chars[start..i].iter().collect();
            let value = counts
                .lookup(&name.to_ascii_lowercase())
                .ok_or(FormulaError::UnknownVariable(name))?;
            tokens.push(Token::Value(value));
        } else {
            return Err(FormulaError::UnexpectedChar(c, i));
        }
    }

    Ok(tokens)
}

/// Evaluate `formula` over `counts`. Division by zero anywhere yields
/// `Ok(None)`.
pub fn evaluate(formula: &str, counts: &Counts) -> Result<Option<f64>, FormulaError> {
    let tokens = tokenize(formula, counts)?;
    let (first, rest) = match tokens.split_first() {
        None => return Err(FormulaError::Empty),
        Some((Token::Value(v), rest)) => (*v, rest),
        Some((Token::Op(_), _)) => return Err(FormulaError::Expected("a number or variable")),
    };

    let mut sum = 0.0;
    let mut sign = 1.0;
    let mut term = first;
    let mut divided_by_zero = false;

    // Operators and operands alternate after the first operand
    for pair in rest.chunks(2) {
        let (op, value) = match pair {
            [Token::Op(op), Token::Value(v)] => (*op, *v),
            [Token::Op(_)] | [Token::Op(_), Token::Op(_)] => {
                return Err(FormulaError::Expected("a number or variable"))
            }
            _ => return Err(FormulaError::Expected("an operator")),
        };

        match op {
            '*' => term *= value,
            '/' if value == 0.0 => divided_by_zero = true,
            '/' => term /= value,
            _ => {
                sum += sign * term;
                sign = if op == '-' { -1.0 } else { 1.0 };
                term = value;
            }
        }
    }
    sum += sign * term;

    Ok(if divided_by_zero { None } else { Some(sum) })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(up: f64, down: f64, degraded: f64, maintenance: f64) -> Counts {
        Counts { up, down, degraded, maintenance }
    }

    #[test]
    fn test_sum_of_variables() {
        let c = counts(7.0, 0.0, 0.0, 3.0);
        assert_eq!(evaluate("up + maintenance", &c), Ok(Some(10.0)));
    }

    #[test]
    fn test_precedence_and_left_to_right() {
        let c = counts(10.0, 4.0, 2.0, 1.0);
        assert_eq!(evaluate("up - down - degraded", &c), Ok(Some(4.0)));
        assert_eq!(evaluate("up + down * 2", &c), Ok(Some(18.0)));
        assert_eq!(evaluate("up / down * degraded", &c), Ok(Some(5.0)));
        assert_eq!(evaluate("100 * up / 4 - 0.5", &c), Ok(Some(249.5)));
    }

    #[test]
    fn test_division_by_zero_is_no_data() {
        let zero = Counts::default();
        assert_eq!(evaluate("up / down", &zero), Ok(None));
        assert_eq!(evaluate("1 + up / down", &zero), Ok(None));
    }

    #[test]
    fn test_malformed_formulas() {
        let c = Counts::default();
        assert_eq!(evaluate("", &c), Err(FormulaError::Empty));
        assert_eq!(evaluate("up +", &c), Err(FormulaError::Expected("a number or variable")));
        assert_eq!(evaluate("up down", &c), Err(FormulaError::Expected("an operator")));
        assert_eq!(evaluate("- up", &c), Err(FormulaError::Expected("a number or variable")));
        assert_eq!(evaluate("uptime", &c), Err(FormulaError::UnknownVariable("uptime".into())));
        assert_eq!(evaluate("up % 2", &c), Err(FormulaError::UnexpectedChar('%', 3)));
        assert_eq!(evaluate("1.2.3", &c), Err(FormulaError::InvalidNumber("1.2.3".into())));
    }
}

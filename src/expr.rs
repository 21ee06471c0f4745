// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Arithmetic expressions attached to edge rates, timings and parameters.
//!
//! Expressions are compiled once (infix -> RPN) against the parameter list of
//! the graph they belong to, and evaluated many times against per-firing
//! parameter snapshots. An expression that references no dynamic parameter is
//! folded to its value at compile time.

use logos::Logos;

use crate::pisdf::Param;
use crate::Error;

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n]+")]
enum Token {
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token(",")]
    Comma,
    #[regex(r"[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    Number(i64),
    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_ascii_lowercase())]
    Ident(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Neg,
    Min,
    Max,
}

impl Op {
    fn precedence(self) -> u8 {
        match self {
            Op::Min | Op::Max => 0,
            Op::Add | Op::Sub => 2,
            Op::Mul | Op::Div | Op::Mod => 3,
            Op::Neg => 4,
        }
    }

    fn arity(self) -> usize {
        match self {
            Op::Neg => 1,
            _ => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum RpnElt {
    Value(i64),
    Param(usize),
    Operator(Op),
}

/// A compiled rate/timing expression.
///
/// `dynamic()` reports whether any referenced parameter can change at
/// runtime; static expressions carry their folded value and evaluate in O(1).
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    rpn: Vec<RpnElt>,
    dynamic: bool,
    folded: Option<i64>,
}

impl Expression {
    /// Compile `text` against the parameter list of the containing graph.
    pub fn new(text: &str, params: &[Param]) -> Result<Self, Error> {
        let rpn = compile(text, params)?;
        let dynamic = rpn.iter().any(|elt| match elt {
            RpnElt::Param(ix) => params[*ix].dynamic(),
            _ => false,
        });
        let mut expression = Self {
            source: text.to_string(),
            rpn,
            dynamic,
            folded: None,
        };
        if !dynamic {
            expression.folded = Some(expression.run(params)?);
        }
        Ok(expression)
    }

    /// An expression holding a plain integer value.
    pub fn constant(value: i64) -> Self {
        Self {
            source: value.to_string(),
            rpn: vec![RpnElt::Value(value)],
            dynamic: false,
            folded: Some(value),
        }
    }

    pub fn dynamic(&self) -> bool {
        self.dynamic
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against a parameter snapshot. Parameter indices refer to the
    /// parameter list the expression was compiled against, which per-firing
    /// snapshots preserve.
    pub fn evaluate(&self, params: &[Param]) -> Result<i64, Error> {
        if let Some(value) = self.folded {
            return Ok(value);
        }
        self.run(params)
    }

    fn run(&self, params: &[Param]) -> Result<i64, Error> {
        let fault = || Error::EvaluationFault {
            expression: self.source.clone(),
        };
        let mut stack: Vec<i64> = Vec::with_capacity(self.rpn.len());
        for elt in &self.rpn {
            match elt {
                RpnElt::Value(v) => stack.push(*v),
                RpnElt::Param(ix) => {
                    let param = params.get(*ix).ok_or_else(|| Error::InvalidIndex {
                        entity: "parameter",
                        index: *ix,
                    })?;
                    stack.push(param.value());
                }
                RpnElt::Operator(op) => {
                    let result = if op.arity() == 1 {
                        let a = stack.pop().ok_or_else(fault)?;
                        a.checked_neg().ok_or_else(fault)?
                    } else {
                        let b = stack.pop().ok_or_else(fault)?;
                        let a = stack.pop().ok_or_else(fault)?;
                        match op {
                            Op::Add => a.checked_add(b).ok_or_else(fault)?,
                            Op::Sub => a.checked_sub(b).ok_or_else(fault)?,
                            Op::Mul => a.checked_mul(b).ok_or_else(fault)?,
                            Op::Div => a.checked_div(b).ok_or_else(fault)?,
                            Op::Mod => a.checked_rem(b).ok_or_else(fault)?,
                            Op::Min => a.min(b),
                            Op::Max => a.max(b),
                            Op::Neg => unreachable!("unary handled above"),
                        }
                    };
                    stack.push(result);
                }
            }
        }
        if stack.len() != 1 {
            return Err(fault());
        }
        Ok(stack[0])
    }
}

impl From<i64> for Expression {
    fn from(value: i64) -> Self {
        Self::constant(value)
    }
}

impl std::fmt::Display for Expression {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

/// Shunting-yard compilation to RPN. `min`/`max` are the only functions.
fn compile(text: &str, params: &[Param]) -> Result<Vec<RpnElt>, Error> {
    let syntax = |detail: &'static str| Error::ExpressionSyntax {
        expression: text.to_string(),
        detail: detail.to_string(),
    };
    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Pending {
        Operator(Op),
        Function(Op),
        LParen,
    }
    let mut output: Vec<RpnElt> = Vec::new();
    let mut stack: Vec<Pending> = Vec::new();
    // true when the next token sits in operand position (expression start,
    // after an operator, '(' or ',') so that '-' reads as negation.
    let mut expect_operand = true;
    for token in Token::lexer(text) {
        let token = token.map_err(|_| syntax("unrecognized token"))?;
        match token {
            Token::Number(value) => {
                output.push(RpnElt::Value(value));
                expect_operand = false;
            }
            Token::Ident(name) => match name.as_str() {
                "min" => {
                    stack.push(Pending::Function(Op::Min));
                    expect_operand = true;
                }
                "max" => {
                    stack.push(Pending::Function(Op::Max));
                    expect_operand = true;
                }
                _ => {
                    let ix = params
                        .iter()
                        .position(|p| p.name() == name)
                        .ok_or_else(|| Error::UnknownParameter {
                            expression: text.to_string(),
                            name,
                        })?;
                    output.push(RpnElt::Param(ix));
                    expect_operand = false;
                }
            },
            Token::LParen => {
                stack.push(Pending::LParen);
                expect_operand = true;
            }
            Token::RParen => {
                loop {
                    match stack.pop() {
                        Some(Pending::Operator(op)) => output.push(RpnElt::Operator(op)),
                        Some(Pending::LParen) => break,
                        Some(Pending::Function(_)) | None => {
                            return Err(syntax("unbalanced parenthesis"))
                        }
                    }
                }
                // a function call wraps its parenthesis
                if let Some(Pending::Function(op)) = stack.last().copied() {
                    stack.pop();
                    output.push(RpnElt::Operator(op));
                }
                expect_operand = false;
            }
            Token::Comma => {
                loop {
                    match stack.last() {
                        Some(Pending::Operator(op)) => {
                            output.push(RpnElt::Operator(*op));
                            stack.pop();
                        }
                        Some(Pending::LParen) => break,
                        _ => return Err(syntax("misplaced ','")),
                    }
                }
                expect_operand = true;
            }
            Token::Plus | Token::Minus | Token::Star | Token::Slash | Token::Percent => {
                let op = match token {
                    Token::Minus if expect_operand => Op::Neg,
                    Token::Plus => Op::Add,
                    Token::Minus => Op::Sub,
                    Token::Star => Op::Mul,
                    Token::Slash => Op::Div,
                    Token::Percent => Op::Mod,
                    _ => unreachable!(),
                };
                while let Some(Pending::Operator(top)) = stack.last().copied() {
                    // Neg is right-associative, everything else left.
                    let pops = if op == Op::Neg {
                        top.precedence() > op.precedence()
                    } else {
                        top.precedence() >= op.precedence()
                    };
                    if !pops {
                        break;
                    }
                    output.push(RpnElt::Operator(top));
                    stack.pop();
                }
                stack.push(Pending::Operator(op));
                expect_operand = true;
            }
        }
    }
    while let Some(pending) = stack.pop() {
        match pending {
            Pending::Operator(op) => output.push(RpnElt::Operator(op)),
            Pending::LParen | Pending::Function(_) => return Err(syntax("unbalanced parenthesis")),
        }
    }
    if output.is_empty() {
        return Err(syntax("empty expression"));
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pisdf::{Param, ParamKind};

    fn params() -> Vec<Param> {
        vec![
            Param::new_static("width", 8),
            Param::new_static("height", 3),
            Param::new_dynamic("n"),
        ]
    }

    #[test]
    fn test_static_folding() {
        let params = params();
        let e = Expression::new("2 * width + 1", &params).unwrap();
        assert!(!e.dynamic());
        assert_eq!(e.evaluate(&[]).unwrap(), 17);
    }

    #[test]
    fn test_dynamic_evaluation() {
        let mut params = params();
        let e = Expression::new("n * height", &params).unwrap();
        assert!(e.dynamic());
        params[2].set_value(5);
        assert_eq!(e.evaluate(&params).unwrap(), 15);
    }

    #[test]
    fn test_precedence_and_unary() {
        let params = params();
        let e = Expression::new("-width + 2 * (height + 1)", &params).unwrap();
        assert_eq!(e.evaluate(&params).unwrap(), 0);
        let e = Expression::new("height - -1", &params).unwrap();
        assert_eq!(e.evaluate(&params).unwrap(), 4);
    }

    #[test]
    fn test_min_max() {
        let params = params();
        let e = Expression::new("min(width, height) * max(width, 10)", &params).unwrap();
        assert_eq!(e.evaluate(&params).unwrap(), 30);
    }

    #[test]
    fn test_case_folded_names() {
        let params = params();
        let e = Expression::new("WIDTH / Height", &params).unwrap();
        assert_eq!(e.evaluate(&params).unwrap(), 2);
    }

    #[test]
    fn test_unknown_parameter() {
        let params = params();
        assert!(matches!(
            Expression::new("depth + 1", &params),
            Err(Error::UnknownParameter { .. })
        ));
    }

    #[test]
    fn test_division_by_zero_faults() {
        let mut params = params();
        params[2].set_value(0);
        let e = Expression::new("width / n", &params).unwrap();
        assert!(matches!(e.evaluate(&params), Err(Error::EvaluationFault { .. })));
        assert_eq!(params[2].kind(), ParamKind::Dynamic);
    }
}

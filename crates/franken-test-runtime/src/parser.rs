//! Recursive-descent parser for sandboxed module source.
//!
//! Produces the tree in `crate::ast`. Statement termination follows the usual
//! automatic-semicolon rule: a statement may end at `;`, `}`, end of input or
//! a line break before the next token.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::ast::{
    BinaryOp, ClassDef, ClassMember, DeclKind, Expr, ExprKind, FunctionBody, FunctionDef, Literal,
    LogicalOp, Position, Program, Statement, UnaryOp,
};
use crate::lexer::{Token, TokenKind, tokenize};

/// Words that cannot be used as binding names or identifier references.
const RESERVED_WORDS: &[&str] = &[
    "const", "let", "var", "function", "class", "return", "throw", "if", "else", "new", "this",
    "typeof", "true", "false", "null",
];

/// Nesting budget for statements and expressions.
pub const MAX_NESTING_DEPTH: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseErrorCode {
    UnexpectedCharacter,
    UnterminatedString,
    UnterminatedComment,
    InvalidNumber,
    UnexpectedToken,
    UnexpectedEof,
    InvalidAssignmentTarget,
    NestingTooDeep,
}

impl ParseErrorCode {
    pub fn stable_code(self) -> &'static str {
        match self {
            Self::UnexpectedCharacter => "FE-SCRIPT-0001",
            Self::UnterminatedString => "FE-SCRIPT-0002",
            Self::UnterminatedComment => "FE-SCRIPT-0003",
            Self::InvalidNumber => "FE-SCRIPT-0004",
            Self::UnexpectedToken => "FE-SCRIPT-0005",
            Self::UnexpectedEof => "FE-SCRIPT-0006",
            Self::InvalidAssignmentTarget => "FE-SCRIPT-0007",
            Self::NestingTooDeep => "FE-SCRIPT-0008",
        }
    }
}

/// Deterministic parse error envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseError {
    pub code: ParseErrorCode,
    pub message: String,
    pub source_label: String,
    pub position: Option<Position>,
}

impl ParseError {
    pub(crate) fn new(
        code: ParseErrorCode,
        message: impl Into<String>,
        source_label: impl Into<String>,
        position: Option<Position>,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            source_label: source_label.into(),
            position,
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.position {
            Some(pos) => write!(
                f,
                "{}: {} (source={}, line={}, column={})",
                self.code.stable_code(),
                self.message,
                self.source_label,
                pos.line,
                pos.column
            ),
            None => write!(
                f,
                "{}: {} (source={})",
                self.code.stable_code(),
                self.message,
                self.source_label
            ),
        }
    }
}

impl std::error::Error for ParseError {}

pub type ParseResult<T> = Result<T, ParseError>;

pub fn parse_program(text: &str, label: &str) -> ParseResult<Program> {
    let tokens = tokenize(text, label)?;
    let mut parser = Parser {
        tokens,
        index: 0,
        depth: 0,
        label,
    };
    let mut body = Vec::new();
    while !parser.at_eof() {
        parser.parse_statement_into(&mut body)?;
    }
    Ok(Program { body })
}

struct Parser<'a> {
    tokens: Vec<Token>,
    index: usize,
    depth: usize,
    label: &'a str,
}

impl Parser<'_> {
    fn peek(&self) -> &Token {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> &Token {
        let last = self.tokens.len().saturating_sub(1);
        &self.tokens[(self.index + offset).min(last)]
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek().kind, TokenKind::Eof)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if !matches!(token.kind, TokenKind::Eof) {
            self.index += 1;
        }
        token
    }

    fn check(&self, punct: &str) -> bool {
        self.peek().is_punct(punct)
    }

    fn check_keyword(&self, keyword: &str) -> bool {
        self.peek().is_keyword(keyword)
    }

    fn eat(&mut self, punct: &str) -> bool {
        if self.check(punct) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, punct: &str) -> ParseResult<Token> {
        if self.check(punct) {
            Ok(self.advance())
        } else {
            Err(self.unexpected(&format!("expected '{punct}'")))
        }
    }

    fn unexpected(&self, expectation: &str) -> ParseError {
        let token = self.peek();
        match &token.kind {
            TokenKind::Eof => ParseError::new(
                ParseErrorCode::UnexpectedEof,
                format!("unexpected end of input, {expectation}"),
                self.label,
                Some(token.pos),
            ),
            kind => ParseError::new(
                ParseErrorCode::UnexpectedToken,
                format!("unexpected token {}, {expectation}", describe(kind)),
                self.label,
                Some(token.pos),
            ),
        }
    }

    fn deepen(&mut self) -> ParseResult<()> {
        if self.depth >= MAX_NESTING_DEPTH {
            return Err(ParseError::new(
                ParseErrorCode::NestingTooDeep,
                format!("nesting depth exceeded: max={MAX_NESTING_DEPTH}"),
                self.label,
                Some(self.peek().pos),
            ));
        }
        self.depth += 1;
        Ok(())
    }

    /// Run `parse` one nesting level deeper.
    fn nested<T>(&mut self, parse: impl FnOnce(&mut Self) -> ParseResult<T>) -> ParseResult<T> {
        self.deepen()?;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn expect_binding_name(&mut self) -> ParseResult<(String, Position)> {
        let token = self.peek().clone();
        match token.kind {
            TokenKind::Ident(name) if !RESERVED_WORDS.contains(&name.as_str()) => {
                self.advance();
                Ok((name, token.pos))
            }
            _ => Err(self.unexpected("expected identifier")),
        }
    }

    /// Property names accept reserved words and string literals.
    fn expect_property_name(&mut self) -> ParseResult<(String, Position)> {
        let token = self.peek().clone();
        match token.kind {
            TokenKind::Ident(name) | TokenKind::Str(name) => {
                self.advance();
                Ok((name, token.pos))
            }
            TokenKind::Number(n) => {
                self.advance();
                Ok((crate::value::format_number(n), token.pos))
            }
            _ => Err(self.unexpected("expected property name")),
        }
    }

    fn consume_statement_end(&mut self) -> ParseResult<()> {
        if self.eat(";") {
            return Ok(());
        }
        let token = self.peek();
        if token.is_punct("}") || token.newline_before || matches!(token.kind, TokenKind::Eof) {
            return Ok(());
        }
        Err(self.unexpected("expected ';'"))
    }

    fn parse_statement_into(&mut self, out: &mut Vec<Statement>) -> ParseResult<()> {
        self.nested(|parser| parser.parse_statement_nested(out))
    }

    fn parse_statement_nested(&mut self, out: &mut Vec<Statement>) -> ParseResult<()> {
        if self.eat(";") {
            return Ok(());
        }
        let token = self.peek().clone();
        let decl_kind = match &token.kind {
            TokenKind::Ident(word) if word == "const" => Some(DeclKind::Const),
            TokenKind::Ident(word) if word == "let" => Some(DeclKind::Let),
            TokenKind::Ident(word) if word == "var" => Some(DeclKind::Var),
            _ => None,
        };
        if let Some(kind) = decl_kind {
            self.advance();
            return self.parse_var_declarations(kind, out);
        }
        if token.is_keyword("function") && !self.peek_at(1).is_punct("(") {
            self.advance();
            let (name, _) = self.expect_binding_name()?;
            let def = self.parse_function_rest(Some(name), token.pos)?;
            out.push(Statement::FunctionDecl(Arc::new(def)));
            return Ok(());
        }
        if token.is_keyword("class") && !self.peek_at(1).is_punct("{") {
            self.advance();
            let def = self.parse_class_rest(token.pos)?;
            out.push(Statement::ClassDecl(Arc::new(def)));
            return Ok(());
        }
        if token.is_keyword("return") {
            self.advance();
            let next = self.peek();
            let value = if next.is_punct(";")
                || next.is_punct("}")
                || next.newline_before
                || matches!(next.kind, TokenKind::Eof)
            {
                None
            } else {
                Some(self.parse_expression()?)
            };
            self.consume_statement_end()?;
            out.push(Statement::Return {
                value,
                pos: token.pos,
            });
            return Ok(());
        }
        if token.is_keyword("throw") {
            self.advance();
            if self.peek().newline_before {
                return Err(ParseError::new(
                    ParseErrorCode::UnexpectedToken,
                    "illegal newline after throw",
                    self.label,
                    Some(token.pos),
                ));
            }
            let value = self.parse_expression()?;
            self.consume_statement_end()?;
            out.push(Statement::Throw {
                value,
                pos: token.pos,
            });
            return Ok(());
        }
        if token.is_keyword("if") {
            self.advance();
            out.push(self.parse_if_rest(token.pos)?);
            return Ok(());
        }
        if token.is_punct("{") {
            // Bare blocks only group statements; declarations stay function scoped.
            self.advance();
            while !self.check("}") {
                if self.at_eof() {
                    return Err(self.unexpected("expected '}'"));
                }
                self.parse_statement_into(out)?;
            }
            self.advance();
            return Ok(());
        }

        let expr = self.parse_expression()?;
        self.consume_statement_end()?;
        out.push(Statement::Expression(expr));
        Ok(())
    }

    fn parse_var_declarations(
        &mut self,
        kind: DeclKind,
        out: &mut Vec<Statement>,
    ) -> ParseResult<()> {
        loop {
            let (name, pos) = self.expect_binding_name()?;
            let init = if self.eat("=") {
                Some(name_anonymous(self.parse_assignment()?, &name))
            } else {
                None
            };
            out.push(Statement::VarDecl {
                kind,
                name,
                init,
                pos,
            });
            if !self.eat(",") {
                break;
            }
        }
        self.consume_statement_end()
    }

    fn parse_if_rest(&mut self, pos: Position) -> ParseResult<Statement> {
        self.expect("(")?;
        let test = self.parse_expression()?;
        self.expect(")")?;
        let consequent = self.parse_branch()?;
        let alternate = if self.check_keyword("else") {
            self.advance();
            Some(self.parse_branch()?)
        } else {
            None
        };
        Ok(Statement::If {
            test,
            consequent,
            alternate,
            pos,
        })
    }

    fn parse_branch(&mut self) -> ParseResult<Vec<Statement>> {
        let mut body = Vec::new();
        self.parse_statement_into(&mut body)?;
        Ok(body)
    }

    fn parse_block(&mut self) -> ParseResult<Vec<Statement>> {
        self.expect("{")?;
        let mut body = Vec::new();
        while !self.check("}") {
            if self.at_eof() {
                return Err(self.unexpected("expected '}'"));
            }
            self.parse_statement_into(&mut body)?;
        }
        self.advance();
        Ok(body)
    }

    fn parse_params(&mut self) -> ParseResult<Vec<String>> {
        self.expect("(")?;
        let mut params = Vec::new();
        while !self.check(")") {
            let (name, _) = self.expect_binding_name()?;
            params.push(name);
            if !self.eat(",") {
                break;
            }
        }
        self.expect(")")?;
        Ok(params)
    }

    /// Parameters and body after `function name`.
    fn parse_function_rest(
        &mut self,
        name: Option<String>,
        pos: Position,
    ) -> ParseResult<FunctionDef> {
        let params = self.parse_params()?;
        let body = self.parse_block()?;
        Ok(FunctionDef {
            name,
            params,
            body: FunctionBody::Block(body),
            is_arrow: false,
            pos,
        })
    }

    /// Class name (optional) and body after the `class` keyword.
    fn parse_class_rest(&mut self, pos: Position) -> ParseResult<ClassDef> {
        let name = if self.check("{") {
            None
        } else {
            Some(self.expect_binding_name()?.0)
        };
        self.expect("{")?;
        let mut constructor = None;
        let mut members = Vec::new();
        while !self.check("}") {
            if self.at_eof() {
                return Err(self.unexpected("expected '}'"));
            }
            if self.eat(";") {
                continue;
            }
            let is_static = self.check_keyword("static") && !self.peek_at(1).is_punct("(");
            if is_static {
                self.advance();
            }
            let (member_name, member_pos) = self.expect_property_name()?;
            let mut function = self.parse_function_rest(Some(member_name.clone()), member_pos)?;
            if member_name == "constructor" && !is_static {
                function.name = name.clone();
                constructor = Some(Arc::new(function));
            } else {
                members.push(ClassMember {
                    name: member_name,
                    is_static,
                    function: Arc::new(function),
                });
            }
        }
        self.advance();
        let constructor = constructor.unwrap_or_else(|| {
            let mut empty = FunctionDef::empty(pos);
            empty.name = name.clone();
            Arc::new(empty)
        });
        Ok(ClassDef {
            name,
            constructor,
            members,
            pos,
        })
    }

    fn parse_expression(&mut self) -> ParseResult<Expr> {
        self.parse_assignment()
    }

    fn parse_assignment(&mut self) -> ParseResult<Expr> {
        self.nested(Self::parse_assignment_nested)
    }

    fn parse_assignment_nested(&mut self) -> ParseResult<Expr> {
        if self.arrow_ahead() {
            return self.parse_arrow();
        }
        let target = self.parse_logical_or()?;
        if !self.check("=") {
            return Ok(target);
        }
        let eq = self.advance();
        if !target.is_assignable() {
            return Err(ParseError::new(
                ParseErrorCode::InvalidAssignmentTarget,
                "invalid assignment target",
                self.label,
                Some(eq.pos),
            ));
        }
        let value = self.parse_assignment()?;
        let value = match &target.kind {
            ExprKind::Identifier(name) => name_anonymous(value, name),
            ExprKind::Member { property, .. } => name_anonymous(value, property),
            _ => value,
        };
        let pos = target.pos;
        Ok(Expr::new(
            ExprKind::Assign {
                target: Box::new(target),
                value: Box::new(value),
            },
            pos,
        ))
    }

    /// `ident =>` or a parenthesized identifier list followed by `=>`.
    fn arrow_ahead(&self) -> bool {
        let first = self.peek();
        if let TokenKind::Ident(name) = &first.kind {
            return !RESERVED_WORDS.contains(&name.as_str()) && self.peek_at(1).is_punct("=>");
        }
        if !first.is_punct("(") {
            return false;
        }
        let mut offset = 1;
        loop {
            let token = self.peek_at(offset);
            match &token.kind {
                TokenKind::Punct(")") => return self.peek_at(offset + 1).is_punct("=>"),
                TokenKind::Ident(_) | TokenKind::Punct(",") => offset += 1,
                _ => return false,
            }
        }
    }

    fn parse_arrow(&mut self) -> ParseResult<Expr> {
        let pos = self.peek().pos;
        let params = if self.check("(") {
            self.parse_params()?
        } else {
            vec![self.expect_binding_name()?.0]
        };
        self.expect("=>")?;
        let body = if self.check("{") {
            FunctionBody::Block(self.parse_block()?)
        } else {
            FunctionBody::Expression(Box::new(self.parse_assignment()?))
        };
        let def = FunctionDef {
            name: None,
            params,
            body,
            is_arrow: true,
            pos,
        };
        Ok(Expr::new(ExprKind::Function(Arc::new(def)), pos))
    }

    fn parse_logical_or(&mut self) -> ParseResult<Expr> {
        let base = self.depth;
        let mut left = self.parse_logical_and()?;
        while self.check("||") {
            self.advance();
            self.deepen()?;
            let right = self.parse_logical_and()?;
            left = logical(LogicalOp::Or, left, right);
        }
        self.depth = base;
        Ok(left)
    }

    fn parse_logical_and(&mut self) -> ParseResult<Expr> {
        let base = self.depth;
        let mut left = self.parse_equality()?;
        while self.check("&&") {
            self.advance();
            self.deepen()?;
            let right = self.parse_equality()?;
            left = logical(LogicalOp::And, left, right);
        }
        self.depth = base;
        Ok(left)
    }

    fn parse_equality(&mut self) -> ParseResult<Expr> {
        let base = self.depth;
        let mut left = self.parse_relational()?;
        loop {
            let op = match &self.peek().kind {
                TokenKind::Punct("===") => BinaryOp::StrictEq,
                TokenKind::Punct("!==") => BinaryOp::StrictNe,
                TokenKind::Punct("==") => BinaryOp::LooseEq,
                TokenKind::Punct("!=") => BinaryOp::LooseNe,
                _ => break,
            };
            self.advance();
            self.deepen()?;
            let right = self.parse_relational()?;
            left = binary(op, left, right);
        }
        self.depth = base;
        Ok(left)
    }

    fn parse_relational(&mut self) -> ParseResult<Expr> {
        let base = self.depth;
        let mut left = self.parse_additive()?;
        loop {
            let op = match &self.peek().kind {
                TokenKind::Punct("<") => BinaryOp::Lt,
                TokenKind::Punct(">") => BinaryOp::Gt,
                TokenKind::Punct("<=") => BinaryOp::Le,
                TokenKind::Punct(">=") => BinaryOp::Ge,
                _ => break,
            };
            self.advance();
            self.deepen()?;
            let right = self.parse_additive()?;
            left = binary(op, left, right);
        }
        self.depth = base;
        Ok(left)
    }

    fn parse_additive(&mut self) -> ParseResult<Expr> {
        let base = self.depth;
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match &self.peek().kind {
                TokenKind::Punct("+") => BinaryOp::Add,
                TokenKind::Punct("-") => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            self.deepen()?;
            let right = self.parse_multiplicative()?;
            left = binary(op, left, right);
        }
        self.depth = base;
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> ParseResult<Expr> {
        let base = self.depth;
        let mut left = self.parse_unary()?;
        loop {
            let op = match &self.peek().kind {
                TokenKind::Punct("*") => BinaryOp::Mul,
                TokenKind::Punct("/") => BinaryOp::Div,
                _ => break,
            };
            self.advance();
            self.deepen()?;
            let right = self.parse_unary()?;
            left = binary(op, left, right);
        }
        self.depth = base;
        Ok(left)
    }

    fn parse_unary(&mut self) -> ParseResult<Expr> {
        let token = self.peek().clone();
        let op = if token.is_punct("!") {
            UnaryOp::Not
        } else if token.is_punct("-") {
            UnaryOp::Negate
        } else if token.is_keyword("typeof") {
            UnaryOp::TypeOf
        } else {
            return self.parse_postfix();
        };
        self.advance();
        let operand = self.nested(Self::parse_unary)?;
        Ok(Expr::new(
            ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
            token.pos,
        ))
    }

    fn parse_postfix(&mut self) -> ParseResult<Expr> {
        let base = if self.check_keyword("new") {
            self.parse_new()?
        } else {
            self.parse_primary()?
        };
        self.parse_call_tail(base, true)
    }

    /// `new Callee(args)`; the callee excludes call expressions.
    fn parse_new(&mut self) -> ParseResult<Expr> {
        let new_token = self.advance();
        let callee = if self.check_keyword("new") {
            self.nested(Self::parse_new)?
        } else {
            self.parse_primary()?
        };
        let callee = self.parse_call_tail(callee, false)?;
        let args = if self.check("(") {
            self.parse_arguments()?
        } else {
            Vec::new()
        };
        Ok(Expr::new(
            ExprKind::New {
                callee: Box::new(callee),
                args,
            },
            new_token.pos,
        ))
    }

    fn parse_call_tail(&mut self, mut expr: Expr, allow_calls: bool) -> ParseResult<Expr> {
        let base = self.depth;
        loop {
            let continues =
                self.check(".") || self.check("[") || (allow_calls && self.check("("));
            if continues {
                self.deepen()?;
            }
            if self.check(".") {
                self.advance();
                let (property, pos) = self.expect_property_name()?;
                expr = Expr::new(
                    ExprKind::Member {
                        object: Box::new(expr),
                        property,
                    },
                    pos,
                );
            } else if self.check("[") {
                let open = self.advance();
                let index = self.parse_expression()?;
                self.expect("]")?;
                expr = Expr::new(
                    ExprKind::Index {
                        object: Box::new(expr),
                        index: Box::new(index),
                    },
                    open.pos,
                );
            } else if allow_calls && self.check("(") {
                let pos = expr.pos;
                let args = self.parse_arguments()?;
                expr = Expr::new(
                    ExprKind::Call {
                        callee: Box::new(expr),
                        args,
                    },
                    pos,
                );
            } else {
                self.depth = base;
                return Ok(expr);
            }
        }
    }

    fn parse_arguments(&mut self) -> ParseResult<Vec<Expr>> {
        self.expect("(")?;
        let mut args = Vec::new();
        while !self.check(")") {
            args.push(self.parse_assignment()?);
            if !self.eat(",") {
                break;
            }
        }
        self.expect(")")?;
        Ok(args)
    }

    fn parse_primary(&mut self) -> ParseResult<Expr> {
        let token = self.peek().clone();
        let pos = token.pos;
        let kind = match token.kind {
            TokenKind::Number(n) => {
                self.advance();
                ExprKind::Literal(Literal::Number(n))
            }
            TokenKind::Str(s) => {
                self.advance();
                ExprKind::Literal(Literal::Str(s))
            }
            TokenKind::Ident(word) => match word.as_str() {
                "true" | "false" => {
                    self.advance();
                    ExprKind::Literal(Literal::Bool(word == "true"))
                }
                "null" => {
                    self.advance();
                    ExprKind::Literal(Literal::Null)
                }
                "undefined" => {
                    self.advance();
                    ExprKind::Literal(Literal::Undefined)
                }
                "this" => {
                    self.advance();
                    ExprKind::This
                }
                "function" => {
                    self.advance();
                    let name = if self.check("(") {
                        None
                    } else {
                        Some(self.expect_binding_name()?.0)
                    };
                    ExprKind::Function(Arc::new(self.parse_function_rest(name, pos)?))
                }
                "class" => {
                    self.advance();
                    ExprKind::Class(Arc::new(self.parse_class_rest(pos)?))
                }
                _ if RESERVED_WORDS.contains(&word.as_str()) => {
                    return Err(self.unexpected("expected expression"));
                }
                _ => {
                    self.advance();
                    ExprKind::Identifier(word)
                }
            },
            TokenKind::Punct("(") => {
                self.advance();
                let inner = self.parse_expression()?;
                self.expect(")")?;
                return Ok(inner);
            }
            TokenKind::Punct("[") => {
                self.advance();
                let mut items = Vec::new();
                while !self.check("]") {
                    items.push(self.parse_assignment()?);
                    if !self.eat(",") {
                        break;
                    }
                }
                self.expect("]")?;
                ExprKind::Array(items)
            }
            TokenKind::Punct("{") => {
                self.advance();
                ExprKind::Object(self.parse_object_entries()?)
            }
            _ => return Err(self.unexpected("expected expression")),
        };
        Ok(Expr::new(kind, pos))
    }

    fn parse_object_entries(&mut self) -> ParseResult<Vec<(String, Expr)>> {
        let mut entries = Vec::new();
        while !self.check("}") {
            let shorthand_ident = matches!(&self.peek().kind, TokenKind::Ident(_));
            let (key, key_pos) = self.expect_property_name()?;
            let value = if self.eat(":") {
                name_anonymous(self.parse_assignment()?, &key)
            } else if self.check("(") {
                let def = self.parse_function_rest(Some(key.clone()), key_pos)?;
                Expr::new(ExprKind::Function(Arc::new(def)), key_pos)
            } else if shorthand_ident {
                Expr::new(ExprKind::Identifier(key.clone()), key_pos)
            } else {
                return Err(self.unexpected("expected ':'"));
            };
            entries.push((key, value));
            if !self.eat(",") {
                break;
            }
        }
        self.expect("}")?;
        Ok(entries)
    }
}

fn describe(kind: &TokenKind) -> String {
    match kind {
        TokenKind::Ident(name) => format!("'{name}'"),
        TokenKind::Number(n) => format!("'{}'", crate::value::format_number(*n)),
        TokenKind::Str(_) => "string".to_string(),
        TokenKind::Punct(p) => format!("'{p}'"),
        TokenKind::Eof => "end of input".to_string(),
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    let pos = left.pos;
    Expr::new(
        ExprKind::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        },
        pos,
    )
}

fn logical(op: LogicalOp, left: Expr, right: Expr) -> Expr {
    let pos = left.pos;
    Expr::new(
        ExprKind::Logical {
            op,
            left: Box::new(left),
            right: Box::new(right),
        },
        pos,
    )
}

/// Give an anonymous function or class the name of its binding.
fn name_anonymous(expr: Expr, name: &str) -> Expr {
    match &expr.kind {
        ExprKind::Function(def) if def.name.is_none() => {
            let mut named = FunctionDef::clone(def);
            named.name = Some(name.to_string());
            Expr::new(ExprKind::Function(Arc::new(named)), expr.pos)
        }
        ExprKind::Class(def) if def.name.is_none() => {
            let mut named = ClassDef::clone(def);
            named.name = Some(name.to_string());
            let mut ctor = FunctionDef::clone(&named.constructor);
            ctor.name = Some(name.to_string());
            named.constructor = Arc::new(ctor);
            Expr::new(ExprKind::Class(Arc::new(named)), expr.pos)
        }
        _ => expr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Program {
        parse_program(text, "<test>").expect("parse")
    }

    fn single_expr(text: &str) -> Expr {
        let program = parse(text);
        match program.body.into_iter().next() {
            Some(Statement::Expression(expr)) => expr,
            other => panic!("expected expression statement, got {other:?}"),
        }
    }

    #[test]
    fn automatic_semicolons_split_lines() {
        let program = parse("const a = 1\nconst b = a + 2\nmodule.exports = b");
        assert_eq!(program.body.len(), 3);
    }

    #[test]
    fn missing_separator_on_one_line_is_rejected() {
        let err = parse_program("a b", "m.js").expect_err("two expressions");
        assert_eq!(err.code, ParseErrorCode::UnexpectedToken);
        assert_eq!(err.position, Some(Position::new(1, 3)));
    }

    #[test]
    fn member_call_position_is_the_property_name() {
        let expr = single_expr("exports.fn(1)");
        assert!(matches!(expr.kind, ExprKind::Call { .. }));
        assert_eq!(expr.pos, Position::new(1, 9));
    }

    #[test]
    fn new_expression_reports_keyword_position() {
        let expr = single_expr("  throw_it(new Error('x'))");
        let ExprKind::Call { args, .. } = expr.kind else {
            panic!("expected call");
        };
        assert!(matches!(args[0].kind, ExprKind::New { .. }));
        assert_eq!(args[0].pos, Position::new(1, 12));
    }

    #[test]
    fn arrow_functions_take_binding_names() {
        let program = parse("const add = (a, b) => a + b\nconst id = x => { return x }");
        let Statement::VarDecl {
            init: Some(init), ..
        } = &program.body[0]
        else {
            panic!("expected declaration");
        };
        let ExprKind::Function(def) = &init.kind else {
            panic!("expected function");
        };
        assert!(def.is_arrow);
        assert_eq!(def.name.as_deref(), Some("add"));
        assert_eq!(def.params, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn object_literals_support_shorthand_and_methods() {
        let expr = single_expr("({ a, 'b c': 1, run() { return 2 }, f: function () {} })");
        let ExprKind::Object(entries) = expr.kind else {
            panic!("expected object");
        };
        let keys: Vec<&str> = entries.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["a", "b c", "run", "f"]);
        let ExprKind::Function(def) = &entries[3].1.kind else {
            panic!("expected function");
        };
        assert_eq!(def.name.as_deref(), Some("f"));
    }

    #[test]
    fn classes_collect_constructor_and_members() {
        let program = parse(
            "class Counter {\n  constructor(n) { this.n = n }\n  inc() { this.n = this.n + 1 }\n  static make() { return new Counter(0) }\n}",
        );
        let Statement::ClassDecl(def) = &program.body[0] else {
            panic!("expected class");
        };
        assert_eq!(def.name.as_deref(), Some("Counter"));
        assert_eq!(def.constructor.params, vec!["n".to_string()]);
        assert_eq!(def.members.len(), 2);
        assert!(def.members[1].is_static);
    }

    #[test]
    fn assignment_to_call_is_rejected() {
        let err = parse_program("f() = 1", "m.js").expect_err("bad target");
        assert_eq!(err.code, ParseErrorCode::InvalidAssignmentTarget);
    }

    #[test]
    fn if_else_chains_parse() {
        let program = parse("if (a) { b() } else if (c) d()\nelse e()");
        let Statement::If { alternate, .. } = &program.body[0] else {
            panic!("expected if");
        };
        let nested = alternate.as_ref().expect("else branch");
        assert!(matches!(nested[0], Statement::If { .. }));
    }

    #[test]
    fn deeply_nested_source_is_rejected_with_stable_code() {
        let depth = 20_000;
        let text = format!("exports.v = {}1{}", "(".repeat(depth), ")".repeat(depth));
        let err = parse_program(&text, "deep.js").expect_err("too deep");
        assert_eq!(err.code, ParseErrorCode::NestingTooDeep);
        assert!(err.to_string().starts_with("FE-SCRIPT-0008"), "{err}");
        assert_eq!(err.source_label, "deep.js");
    }

    #[test]
    fn long_operator_chains_count_against_nesting() {
        let chain = vec!["1"; 5_000].join(" + ");
        let err = parse_program(&format!("exports.v = {chain}"), "chain.js").expect_err("too long");
        assert_eq!(err.code, ParseErrorCode::NestingTooDeep);

        let calls = "f".to_string() + &"()".repeat(5_000);
        let err = parse_program(&calls, "calls.js").expect_err("too long");
        assert_eq!(err.code, ParseErrorCode::NestingTooDeep);
    }

    #[test]
    fn moderate_nesting_still_parses() {
        let depth = 64;
        let text = format!("exports.v = {}1{}", "(".repeat(depth), ")".repeat(depth));
        parse(&text);
        parse(&vec!["1"; 64].join(" + "));
        parse(&format!("x{}", ".a".repeat(64)));
    }

    #[test]
    fn display_carries_stable_code_and_location() {
        let err = parse_program("const = 1", "mod.js").expect_err("missing name");
        let text = err.to_string();
        assert!(text.starts_with("FE-SCRIPT-0005"), "{text}");
        assert!(text.contains("line=1, column=7"), "{text}");
    }
}

//! Parser: tokens to AST.
//!
//! Recursive descent with precedence climbing for infix operators.
//! Newlines terminate statements; inside delimiters and after infix
//! operators they are skipped.

use crate::ast::{
    BinaryOp, CatchClause, DeclKind, Expr, ExprKind, JumpKind, Literal, MatchCase, Pattern,
    Program, UnaryOp,
};
use crate::bytecode::instruction::TypeTag;
use crate::error::ParseError;
use crate::lexer::token::{Token, TokenKind};
use crate::span::Span;

type PResult<T> = Result<T, ParseError>;

/// Infix precedence levels, loosest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Prec {
    Range,
    Or,
    And,
    Comparison,
    TypeOp,
    BitOr,
    BitXor,
    BitAnd,
    Shift,
    Term,
    Factor,
    Power,
}

impl Prec {
    fn next(self) -> Prec {
        match self {
            Prec::Range => Prec::Or,
            Prec::Or => Prec::And,
            Prec::And => Prec::Comparison,
            Prec::Comparison => Prec::TypeOp,
            Prec::TypeOp => Prec::BitOr,
            Prec::BitOr => Prec::BitXor,
            Prec::BitXor => Prec::BitAnd,
            Prec::BitAnd => Prec::Shift,
            Prec::Shift => Prec::Term,
            Prec::Term => Prec::Factor,
            Prec::Factor => Prec::Power,
            Prec::Power => Prec::Power,
        }
    }
}

/// Infix operator classification: precedence plus right-associativity.
fn infix_prec(kind: &TokenKind) -> Option<(Prec, bool)> {
    let entry = match kind {
        TokenKind::Colon => (Prec::Range, false),
        TokenKind::Or => (Prec::Or, false),
        TokenKind::And => (Prec::And, false),
        TokenKind::EqEq
        | TokenKind::BangEq
        | TokenKind::Lt
        | TokenKind::LtEq
        | TokenKind::Gt
        | TokenKind::GtEq
        | TokenKind::In => (Prec::Comparison, false),
        TokenKind::Is | TokenKind::As => (Prec::TypeOp, false),
        TokenKind::PipeBar => (Prec::BitOr, false),
        TokenKind::Caret => (Prec::BitXor, false),
        TokenKind::Amp => (Prec::BitAnd, false),
        TokenKind::Shl | TokenKind::Shr => (Prec::Shift, false),
        TokenKind::Plus | TokenKind::Minus => (Prec::Term, false),
        TokenKind::Star
        | TokenKind::Slash
        | TokenKind::SlashSlash
        | TokenKind::Percent => (Prec::Factor, false),
        TokenKind::StarStar => (Prec::Power, true),
        _ => return None,
    };
    Some(entry)
}

fn binary_op(kind: &TokenKind) -> BinaryOp {
    match kind {
        TokenKind::Or => BinaryOp::Or,
        TokenKind::And => BinaryOp::And,
        TokenKind::EqEq => BinaryOp::Equal,
        TokenKind::BangEq => BinaryOp::NotEqual,
        TokenKind::Lt => BinaryOp::Less,
        TokenKind::LtEq => BinaryOp::LessEqual,
        TokenKind::Gt => BinaryOp::Greater,
        TokenKind::GtEq => BinaryOp::GreaterEqual,
        TokenKind::In => BinaryOp::In,
        TokenKind::PipeBar => BinaryOp::BitOr,
        TokenKind::Caret => BinaryOp::BitXor,
        TokenKind::Amp => BinaryOp::BitAnd,
        TokenKind::Shl => BinaryOp::Shl,
        TokenKind::Shr => BinaryOp::Shr,
        TokenKind::Plus => BinaryOp::Add,
        TokenKind::Minus => BinaryOp::Sub,
        TokenKind::Star => BinaryOp::Mul,
        TokenKind::Slash => BinaryOp::Div,
        TokenKind::SlashSlash => BinaryOp::DivFloor,
        TokenKind::Percent => BinaryOp::Rem,
        TokenKind::StarStar => BinaryOp::Pow,
        other => unreachable!("not a binary operator: {:?}", other),
    }
}

/// The parser.
pub struct Parser {
    tokens: Vec<Token>,
    current: usize,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, current: 0 }
    }

    pub fn parse(mut self) -> PResult<Program> {
        let mut statements = Vec::new();
        self.skip_separators();
        while !self.at_end() {
            statements.push(self.parse_statement()?);
            self.expect_terminator()?;
            self.skip_separators();
        }
        Ok(Program { statements })
    }

    // ---- statements ----

    fn parse_statement(&mut self) -> PResult<Expr> {
        match self.peek_kind() {
            TokenKind::Let => self.parse_decl(DeclKind::Let),
            TokenKind::Const => self.parse_decl(DeclKind::Const),
            _ => {
                let expr = self.parse_expr()?;
                self.maybe_assignment(expr)
            }
        }
    }

    fn parse_decl(&mut self, kind: DeclKind) -> PResult<Expr> {
        let start = self.advance().span;
        let pattern = self.parse_binding_pattern()?;
        self.expect(&TokenKind::Eq, "'='")?;
        self.skip_newlines();
        let value = self.parse_expr()?;
        Ok(Expr::new(
            ExprKind::Decl {
                kind,
                pattern,
                value: Box::new(value),
            },
            start,
        ))
    }

    /// An irrefutable pattern for `let`/`const`.
    fn parse_binding_pattern(&mut self) -> PResult<Pattern> {
        let token = self.advance();
        match token.kind {
            TokenKind::Ident(name) => Ok(Pattern::Binding(name)),
            TokenKind::Underscore => Ok(Pattern::Wildcard),
            TokenKind::LeftParen => {
                let elements = self.parse_pattern_list(&TokenKind::RightParen, |p| {
                    p.parse_binding_pattern()
                })?;
                Ok(Pattern::Tuple(elements))
            }
            TokenKind::LeftBracket => {
                let elements = self.parse_pattern_list(&TokenKind::RightBracket, |p| {
                    p.parse_binding_pattern()
                })?;
                Ok(Pattern::List(elements))
            }
            kind => Err(ParseError::expected(
                "a binding pattern",
                kind.to_string(),
                token.span,
            )),
        }
    }

    fn parse_pattern_list(
        &mut self,
        close: &TokenKind,
        mut element: impl FnMut(&mut Self) -> PResult<Pattern>,
    ) -> PResult<Vec<Pattern>> {
        let mut elements = Vec::new();
        self.skip_newlines();
        while self.peek_kind() != close {
            elements.push(element(self)?);
            self.skip_newlines();
            if !self.match_kind(&TokenKind::Comma) {
                break;
            }
            self.skip_newlines();
        }
        self.expect(close, close.lexeme())?;
        Ok(elements)
    }

    /// Turn a parsed expression into an assignment if an assignment
    /// operator follows.
    fn maybe_assignment(&mut self, target: Expr) -> PResult<Expr> {
        let op = match self.peek_kind() {
            TokenKind::Eq => None,
            TokenKind::PlusEq => Some(BinaryOp::Add),
            TokenKind::MinusEq => Some(BinaryOp::Sub),
            TokenKind::StarEq => Some(BinaryOp::Mul),
            TokenKind::SlashEq => Some(BinaryOp::Div),
            TokenKind::PercentEq => Some(BinaryOp::Rem),
            _ => return Ok(target),
        };
        let span = self.advance().span;
        if !matches!(
            target.kind,
            ExprKind::Identifier(_)
                | ExprKind::Index {
                    or_null: false,
                    ..
                }
        ) {
            return Err(ParseError::BadAssignTarget(target.span));
        }
        self.skip_newlines();
        let value = self.parse_expr()?;
        Ok(Expr::new(
            ExprKind::Assign {
                target: Box::new(target),
                op,
                value: Box::new(value),
            },
            span,
        ))
    }

    // ---- expressions ----

    fn parse_expr(&mut self) -> PResult<Expr> {
        self.parse_prec(Prec::Range, false)
    }

    /// A condition or `match`/`for` subject: `{` does not start an
    /// operand here, so the following block belongs to the construct.
    fn parse_condition(&mut self) -> PResult<Expr> {
        self.parse_prec(Prec::Range, true)
    }

    fn parse_prec(&mut self, min_prec: Prec, no_brace: bool) -> PResult<Expr> {
        let mut lhs = self.parse_unary(no_brace)?;

        loop {
            let Some((prec, right_assoc)) = infix_prec(self.peek_kind()) else {
                break;
            };
            if prec < min_prec {
                break;
            }
            let token = self.advance();
            let span = token.span;
            self.skip_newlines();

            match token.kind {
                TokenKind::Colon => {
                    let rhs = self.parse_prec(Prec::Range.next(), no_brace)?;
                    lhs = match lhs.kind {
                        ExprKind::Range {
                            start,
                            end,
                            step: None,
                        } => Expr::new(
                            ExprKind::Range {
                                start,
                                end,
                                step: Some(Box::new(rhs)),
                            },
                            lhs.span,
                        ),
                        _ => {
                            let lhs_span = lhs.span;
                            Expr::new(
                                ExprKind::Range {
                                    start: Box::new(lhs),
                                    end: Box::new(rhs),
                                    step: None,
                                },
                                lhs_span,
                            )
                        }
                    };
                }
                TokenKind::Is | TokenKind::As => {
                    let is_cast = token.kind == TokenKind::As;
                    let ty = self.parse_type_name()?;
                    let lhs_span = lhs.span;
                    lhs = Expr::new(
                        ExprKind::TypeInfix {
                            is_cast,
                            operand: Box::new(lhs),
                            ty,
                        },
                        lhs_span,
                    );
                }
                kind => {
                    let next_min = if right_assoc { prec } else { prec.next() };
                    let rhs = self.parse_prec(next_min, no_brace)?;
                    lhs = Expr::new(
                        ExprKind::Infix {
                            op: binary_op(&kind),
                            lhs: Box::new(lhs),
                            rhs: Box::new(rhs),
                        },
                        span,
                    );
                }
            }
        }
        Ok(lhs)
    }

    fn parse_type_name(&mut self) -> PResult<TypeTag> {
        let token = self.advance();
        let name = match &token.kind {
            TokenKind::Ident(name) => name.clone(),
            TokenKind::Error => "error".to_string(),
            TokenKind::Null => "null".to_string(),
            kind => {
                return Err(ParseError::expected(
                    "a type name",
                    kind.to_string(),
                    token.span,
                ))
            }
        };
        TypeTag::from_name(&name).ok_or_else(move || ParseError::UnknownTypeName {
            name,
            span: token.span,
        })
    }

    fn parse_unary(&mut self, no_brace: bool) -> PResult<Expr> {
        let op = match self.peek_kind() {
            TokenKind::Minus => Some(UnaryOp::Negate),
            TokenKind::Bang | TokenKind::Not => Some(UnaryOp::Not),
            TokenKind::Tilde => Some(UnaryOp::BitNot),
            _ => None,
        };
        if let Some(op) = op {
            let span = self.advance().span;
            let operand = self.parse_unary(no_brace)?;
            return Ok(Expr::new(
                ExprKind::Prefix {
                    op,
                    operand: Box::new(operand),
                },
                span,
            ));
        }
        let primary = self.parse_primary(no_brace)?;
        self.parse_postfix(primary)
    }

    fn parse_postfix(&mut self, mut expr: Expr) -> PResult<Expr> {
        loop {
            match self.peek_kind() {
                TokenKind::LeftParen => {
                    self.advance();
                    let args = self.parse_args()?;
                    let callee_span = expr.span;
                    expr = Expr::new(
                        ExprKind::Call {
                            callee: Box::new(expr),
                            args,
                        },
                        callee_span,
                    );
                }
                TokenKind::Dot => {
                    self.advance();
                    let token = self.advance();
                    let name = match token.kind {
                        TokenKind::Ident(name) => name,
                        kind => {
                            return Err(ParseError::expected(
                                "a method name",
                                kind.to_string(),
                                token.span,
                            ))
                        }
                    };
                    self.expect(&TokenKind::LeftParen, "'('")?;
                    let args = self.parse_args()?;
                    let recv_span = expr.span;
                    expr = Expr::new(
                        ExprKind::MethodCall {
                            recv: Box::new(expr),
                            name,
                            args,
                        },
                        recv_span,
                    );
                }
                TokenKind::LeftBracket => {
                    self.advance();
                    self.skip_newlines();
                    let index = self.parse_expr()?;
                    self.skip_newlines();
                    self.expect(&TokenKind::RightBracket, "']'")?;
                    let or_null = self.match_kind(&TokenKind::Question);
                    let recv_span = expr.span;
                    expr = Expr::new(
                        ExprKind::Index {
                            recv: Box::new(expr),
                            index: Box::new(index),
                            or_null,
                        },
                        recv_span,
                    );
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    /// Call arguments; the opening paren is already consumed.
    fn parse_args(&mut self) -> PResult<Vec<Expr>> {
        let mut args = Vec::new();
        self.skip_newlines();
        while self.peek_kind() != &TokenKind::RightParen {
            args.push(self.parse_expr()?);
            self.skip_newlines();
            if !self.match_kind(&TokenKind::Comma) {
                break;
            }
            self.skip_newlines();
        }
        self.expect(&TokenKind::RightParen, "')'")?;
        Ok(args)
    }

    fn parse_primary(&mut self, no_brace: bool) -> PResult<Expr> {
        let token = self.advance();
        let span = token.span;
        match token.kind {
            TokenKind::Int(n) => Ok(Expr::new(ExprKind::Literal(Literal::Int(n)), span)),
            TokenKind::Num(n) => Ok(Expr::new(ExprKind::Literal(Literal::Num(n)), span)),
            TokenKind::Str(s) => Ok(Expr::new(ExprKind::Literal(Literal::Str(s)), span)),
            TokenKind::True => Ok(Expr::new(ExprKind::Literal(Literal::Bool(true)), span)),
            TokenKind::False => Ok(Expr::new(ExprKind::Literal(Literal::Bool(false)), span)),
            TokenKind::Null => Ok(Expr::new(ExprKind::Literal(Literal::Null), span)),
            TokenKind::Ident(name) => Ok(Expr::new(ExprKind::Identifier(name), span)),
            TokenKind::Native(name) => Ok(Expr::new(ExprKind::Native(name), span)),
            TokenKind::This => Ok(Expr::new(ExprKind::This, span)),
            TokenKind::Underscore => Ok(Expr::new(ExprKind::Discard, span)),
            TokenKind::LeftParen => self.parse_paren(span),
            TokenKind::LeftBracket => {
                let mut elements = Vec::new();
                self.skip_newlines();
                while self.peek_kind() != &TokenKind::RightBracket {
                    elements.push(self.parse_expr()?);
                    self.skip_newlines();
                    if !self.match_kind(&TokenKind::Comma) {
                        break;
                    }
                    self.skip_newlines();
                }
                self.expect(&TokenKind::RightBracket, "']'")?;
                Ok(Expr::new(ExprKind::List(elements), span))
            }
            TokenKind::LeftBrace => {
                if no_brace {
                    return Err(ParseError::BraceNotAllowed { span });
                }
                self.parse_brace(span)
            }
            TokenKind::Fn => self.parse_fn(span),
            TokenKind::If => self.parse_if(span),
            TokenKind::While => {
                let cond = self.parse_condition()?;
                let body = self.parse_expr()?;
                Ok(Expr::new(
                    ExprKind::While {
                        cond: Box::new(cond),
                        body: Box::new(body),
                    },
                    span,
                ))
            }
            TokenKind::For => {
                let token = self.advance();
                let binding = match token.kind {
                    TokenKind::Ident(name) => name,
                    kind => {
                        return Err(ParseError::expected(
                            "a loop variable",
                            kind.to_string(),
                            token.span,
                        ))
                    }
                };
                self.expect(&TokenKind::In, "'in'")?;
                let iterable = self.parse_condition()?;
                let body = self.parse_expr()?;
                Ok(Expr::new(
                    ExprKind::For {
                        binding,
                        iterable: Box::new(iterable),
                        body: Box::new(body),
                    },
                    span,
                ))
            }
            TokenKind::Match => self.parse_match(span),
            TokenKind::Try => {
                let expr = self.parse_expr()?;
                let catch = if self.match_newline_then(&TokenKind::Catch) {
                    let binding = if self.match_kind(&TokenKind::PipeBar) {
                        let token = self.advance();
                        let name = match token.kind {
                            TokenKind::Ident(name) => name,
                            kind => {
                                return Err(ParseError::expected(
                                    "a catch binding",
                                    kind.to_string(),
                                    token.span,
                                ))
                            }
                        };
                        self.expect(&TokenKind::PipeBar, "'|'")?;
                        Some(name)
                    } else {
                        None
                    };
                    let handler = self.parse_expr()?;
                    Some(CatchClause {
                        binding,
                        handler: Box::new(handler),
                    })
                } else {
                    None
                };
                Ok(Expr::new(
                    ExprKind::Try {
                        expr: Box::new(expr),
                        catch,
                    },
                    span,
                ))
            }
            TokenKind::Error => {
                if self.match_kind(&TokenKind::LeftParen) {
                    self.skip_newlines();
                    let inner = self.parse_expr()?;
                    self.skip_newlines();
                    self.expect(&TokenKind::RightParen, "')'")?;
                    Ok(Expr::new(ExprKind::ErrorLit(Some(Box::new(inner))), span))
                } else {
                    Ok(Expr::new(ExprKind::ErrorLit(None), span))
                }
            }
            TokenKind::Dot => {
                let token = self.advance();
                let name = match token.kind {
                    TokenKind::Ident(name) => name,
                    kind => {
                        return Err(ParseError::expected(
                            "a tag name",
                            kind.to_string(),
                            token.span,
                        ))
                    }
                };
                let payload = if self.match_kind(&TokenKind::LeftParen) {
                    self.skip_newlines();
                    let inner = self.parse_expr()?;
                    self.skip_newlines();
                    self.expect(&TokenKind::RightParen, "')'")?;
                    Some(Box::new(inner))
                } else {
                    None
                };
                Ok(Expr::new(ExprKind::Tagged { name, payload }, span))
            }
            TokenKind::Import => {
                let token = self.advance();
                match token.kind {
                    TokenKind::Str(path) => Ok(Expr::new(ExprKind::Import(path), span)),
                    kind => Err(ParseError::expected(
                        "a module path string",
                        kind.to_string(),
                        token.span,
                    )),
                }
            }
            TokenKind::Break => Ok(Expr::new(ExprKind::Jump(JumpKind::Break), span)),
            TokenKind::Continue => Ok(Expr::new(ExprKind::Jump(JumpKind::Continue), span)),
            TokenKind::Return => {
                let value = if self.starts_expression() {
                    Some(Box::new(self.parse_expr()?))
                } else {
                    None
                };
                Ok(Expr::new(ExprKind::Jump(JumpKind::Return(value)), span))
            }
            TokenKind::Eof => Err(ParseError::UnexpectedEnd(span)),
            kind => Err(ParseError::expected(
                "an expression",
                kind.to_string(),
                span,
            )),
        }
    }

    /// `(` already consumed: grouping or tuple literal.
    fn parse_paren(&mut self, span: Span) -> PResult<Expr> {
        self.skip_newlines();
        if self.match_kind(&TokenKind::RightParen) {
            return Ok(Expr::new(ExprKind::Tuple(Vec::new()), span));
        }
        let first = self.parse_expr()?;
        self.skip_newlines();
        if self.match_kind(&TokenKind::Comma) {
            let mut elements = vec![first];
            self.skip_newlines();
            while self.peek_kind() != &TokenKind::RightParen {
                elements.push(self.parse_expr()?);
                self.skip_newlines();
                if !self.match_kind(&TokenKind::Comma) {
                    break;
                }
                self.skip_newlines();
            }
            self.expect(&TokenKind::RightParen, "')'")?;
            Ok(Expr::new(ExprKind::Tuple(elements), span))
        } else {
            self.expect(&TokenKind::RightParen, "')'")?;
            Ok(Expr::new(ExprKind::Grouped(Box::new(first)), span))
        }
    }

    /// `{` already consumed: an empty map, a map literal, or a block.
    fn parse_brace(&mut self, span: Span) -> PResult<Expr> {
        self.skip_separators();
        if self.match_kind(&TokenKind::RightBrace) {
            return Ok(Expr::new(ExprKind::Map(Vec::new()), span));
        }
        // Statement-only openers decide immediately.
        if matches!(self.peek_kind(), TokenKind::Let | TokenKind::Const) {
            return self.parse_block_body(span, None);
        }
        // Parse one expression above range precedence: a following `:`
        // means this was a map key.
        let first = self.parse_prec(Prec::Or, false)?;
        if self.match_kind(&TokenKind::Colon) {
            self.skip_newlines();
            let value = self.parse_expr()?;
            let mut pairs = vec![(first, value)];
            self.skip_newlines();
            if self.match_kind(&TokenKind::Comma) {
                self.skip_newlines();
                while self.peek_kind() != &TokenKind::RightBrace {
                    let key = self.parse_prec(Prec::Or, false)?;
                    self.expect(&TokenKind::Colon, "':'")?;
                    self.skip_newlines();
                    let value = self.parse_expr()?;
                    pairs.push((key, value));
                    self.skip_newlines();
                    if !self.match_kind(&TokenKind::Comma) {
                        break;
                    }
                    self.skip_newlines();
                }
            }
            self.skip_newlines();
            self.expect(&TokenKind::RightBrace, "'}'")?;
            Ok(Expr::new(ExprKind::Map(pairs), span))
        } else {
            self.parse_block_body(span, Some(first))
        }
    }

    fn parse_block_body(&mut self, span: Span, first: Option<Expr>) -> PResult<Expr> {
        let mut statements = Vec::new();
        if let Some(first) = first {
            let stmt = self.maybe_assignment(first)?;
            statements.push(stmt);
            if self.peek_kind() != &TokenKind::RightBrace {
                self.expect_terminator()?;
            }
            self.skip_separators();
        }
        while self.peek_kind() != &TokenKind::RightBrace {
            statements.push(self.parse_statement()?);
            if self.peek_kind() != &TokenKind::RightBrace {
                self.expect_terminator()?;
            }
            self.skip_separators();
        }
        self.expect(&TokenKind::RightBrace, "'}'")?;
        Ok(Expr::new(ExprKind::Block(statements), span))
    }

    fn parse_fn(&mut self, span: Span) -> PResult<Expr> {
        self.expect(&TokenKind::LeftParen, "'('")?;
        let mut params = Vec::new();
        self.skip_newlines();
        while self.peek_kind() != &TokenKind::RightParen {
            let token = self.advance();
            match token.kind {
                TokenKind::Ident(name) => params.push(name),
                kind => {
                    return Err(ParseError::expected(
                        "a parameter name",
                        kind.to_string(),
                        token.span,
                    ))
                }
            }
            self.skip_newlines();
            if !self.match_kind(&TokenKind::Comma) {
                break;
            }
            self.skip_newlines();
        }
        self.expect(&TokenKind::RightParen, "')'")?;
        let body = self.parse_expr()?;
        Ok(Expr::new(
            ExprKind::Fn {
                params,
                body: Box::new(body),
            },
            span,
        ))
    }

    fn parse_if(&mut self, span: Span) -> PResult<Expr> {
        let cond = self.parse_condition()?;
        let then = self.parse_expr()?;
        let els = if self.match_newline_then(&TokenKind::Else) {
            self.skip_newlines();
            Some(Box::new(self.parse_expr()?))
        } else {
            None
        };
        Ok(Expr::new(
            ExprKind::If {
                cond: Box::new(cond),
                then: Box::new(then),
                els,
            },
            span,
        ))
    }

    fn parse_match(&mut self, span: Span) -> PResult<Expr> {
        let subject = self.parse_condition()?;
        self.expect(&TokenKind::LeftBrace, "'{'")?;
        let mut cases = Vec::new();
        self.skip_separators();
        while self.peek_kind() != &TokenKind::RightBrace {
            let case_span = self.peek().span;
            let pattern = self.parse_match_pattern()?;
            self.expect(&TokenKind::FatArrow, "'=>'")?;
            self.skip_newlines();
            let body = self.parse_expr()?;
            cases.push(MatchCase {
                pattern,
                body,
                span: case_span,
            });
            self.skip_newlines();
            if !self.match_kind(&TokenKind::Comma) && self.peek_kind() != &TokenKind::RightBrace {
                self.expect_terminator()?;
            }
            self.skip_separators();
        }
        self.expect(&TokenKind::RightBrace, "'}'")?;
        Ok(Expr::new(
            ExprKind::Match {
                subject: Box::new(subject),
                cases,
            },
            span,
        ))
    }

    fn parse_match_pattern(&mut self) -> PResult<Pattern> {
        let token = self.advance();
        match token.kind {
            TokenKind::Underscore => Ok(Pattern::Wildcard),
            TokenKind::Ident(name) => Ok(Pattern::Binding(name)),
            TokenKind::Int(n) => Ok(Pattern::Literal(Literal::Int(n))),
            TokenKind::Num(n) => Ok(Pattern::Literal(Literal::Num(n))),
            TokenKind::Str(s) => Ok(Pattern::Literal(Literal::Str(s))),
            TokenKind::True => Ok(Pattern::Literal(Literal::Bool(true))),
            TokenKind::False => Ok(Pattern::Literal(Literal::Bool(false))),
            TokenKind::Null => Ok(Pattern::Literal(Literal::Null)),
            TokenKind::Minus => {
                let token = self.advance();
                match token.kind {
                    TokenKind::Int(n) => Ok(Pattern::Literal(Literal::Int(-n))),
                    TokenKind::Num(n) => Ok(Pattern::Literal(Literal::Num(-n))),
                    kind => Err(ParseError::expected(
                        "a number",
                        kind.to_string(),
                        token.span,
                    )),
                }
            }
            TokenKind::LeftParen => {
                let elements = self.parse_pattern_list(&TokenKind::RightParen, |p| {
                    p.parse_match_pattern()
                })?;
                Ok(Pattern::Tuple(elements))
            }
            TokenKind::LeftBracket => {
                let elements = self.parse_pattern_list(&TokenKind::RightBracket, |p| {
                    p.parse_match_pattern()
                })?;
                Ok(Pattern::List(elements))
            }
            TokenKind::Dot => {
                let token = self.advance();
                let name = match token.kind {
                    TokenKind::Ident(name) => name,
                    kind => {
                        return Err(ParseError::expected(
                            "a tag name",
                            kind.to_string(),
                            token.span,
                        ))
                    }
                };
                let payload = if self.match_kind(&TokenKind::LeftParen) {
                    let inner = self.parse_match_pattern()?;
                    self.expect(&TokenKind::RightParen, "')'")?;
                    Some(Box::new(inner))
                } else {
                    None
                };
                Ok(Pattern::Tagged { name, payload })
            }
            TokenKind::Error => {
                let payload = if self.match_kind(&TokenKind::LeftParen) {
                    let inner = self.parse_match_pattern()?;
                    self.expect(&TokenKind::RightParen, "')'")?;
                    Some(Box::new(inner))
                } else {
                    None
                };
                Ok(Pattern::Error(payload))
            }
            kind => Err(ParseError::expected(
                "a pattern",
                kind.to_string(),
                token.span,
            )),
        }
    }

    // ---- cursor helpers ----

    fn peek(&self) -> &Token {
        &self.tokens[self.current.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.peek().kind
    }

    fn peek_kind_at(&self, offset: usize) -> &TokenKind {
        let index = (self.current + offset).min(self.tokens.len() - 1);
        &self.tokens[index].kind
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.current < self.tokens.len() - 1 {
            self.current += 1;
        }
        token
    }

    fn at_end(&self) -> bool {
        self.peek_kind() == &TokenKind::Eof
    }

    fn match_kind(&mut self, kind: &TokenKind) -> bool {
        if self.peek_kind() == kind {
            self.advance();
            true
        } else {
            false
        }
    }

    /// Match `kind`, optionally preceded by a single newline (used by
    /// `else` and `catch` so they may start a new line).
    fn match_newline_then(&mut self, kind: &TokenKind) -> bool {
        if self.peek_kind() == kind {
            self.advance();
            return true;
        }
        if self.peek_kind() == &TokenKind::Newline && self.peek_kind_at(1) == kind {
            self.advance();
            self.advance();
            return true;
        }
        false
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> PResult<Token> {
        if self.peek_kind() == kind {
            Ok(self.advance())
        } else {
            let token = self.peek();
            Err(ParseError::expected(
                what,
                token.kind.to_string(),
                token.span,
            ))
        }
    }

    fn expect_terminator(&mut self) -> PResult<()> {
        match self.peek_kind() {
            TokenKind::Newline | TokenKind::Semicolon => {
                self.advance();
                Ok(())
            }
            TokenKind::Eof | TokenKind::RightBrace => Ok(()),
            kind => {
                let span = self.peek().span;
                Err(ParseError::expected(
                    "a newline or ';'",
                    kind.to_string(),
                    span,
                ))
            }
        }
    }

    fn skip_newlines(&mut self) {
        while self.peek_kind() == &TokenKind::Newline {
            self.advance();
        }
    }

    fn skip_separators(&mut self) {
        while matches!(self.peek_kind(), TokenKind::Newline | TokenKind::Semicolon) {
            self.advance();
        }
    }

    /// Whether the current token can begin an expression (used by
    /// `return` to decide if a value follows).
    fn starts_expression(&self) -> bool {
        !matches!(
            self.peek_kind(),
            TokenKind::Newline
                | TokenKind::Semicolon
                | TokenKind::Eof
                | TokenKind::RightBrace
                | TokenKind::RightParen
                | TokenKind::RightBracket
                | TokenKind::Comma
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Scanner;

    fn parse_source(source: &str) -> Program {
        let tokens = Scanner::new(source).scan_tokens().expect("scan failed");
        Parser::new(tokens).parse().expect("parse failed")
    }

    #[test]
    fn test_precedence() {
        let program = parse_source("1 + 2 * 3");
        let ExprKind::Infix { op, rhs, .. } = &program.statements[0].kind else {
            panic!("expected infix");
        };
        assert_eq!(*op, BinaryOp::Add);
        assert!(matches!(
            rhs.kind,
            ExprKind::Infix {
                op: BinaryOp::Mul,
                ..
            }
        ));
    }

    #[test]
    fn test_comparison_looser_than_bitand() {
        let program = parse_source("x & 1 == 0");
        let ExprKind::Infix { op, .. } = &program.statements[0].kind else {
            panic!("expected infix");
        };
        assert_eq!(*op, BinaryOp::Equal);
    }

    #[test]
    fn test_range_with_step() {
        let program = parse_source("1:10:2");
        assert!(matches!(
            &program.statements[0].kind,
            ExprKind::Range { step: Some(_), .. }
        ));
    }

    #[test]
    fn test_fn_literal_and_call() {
        let program = parse_source("let f = fn(a, b) a + b\nf(40, 2)");
        assert_eq!(program.statements.len(), 2);
        let ExprKind::Decl { pattern, value, .. } = &program.statements[0].kind else {
            panic!("expected decl");
        };
        assert_eq!(*pattern, Pattern::Binding("f".to_string()));
        assert!(matches!(value.kind, ExprKind::Fn { .. }));
        let ExprKind::Call { args, .. } = &program.statements[1].kind else {
            panic!("expected call");
        };
        assert_eq!(args.len(), 2);
    }

    #[test]
    fn test_destructuring_let() {
        let program = parse_source("let (a, _, b) = (1, 2, 3)");
        let ExprKind::Decl { pattern, .. } = &program.statements[0].kind else {
            panic!("expected decl");
        };
        assert_eq!(
            *pattern,
            Pattern::Tuple(vec![
                Pattern::Binding("a".to_string()),
                Pattern::Wildcard,
                Pattern::Binding("b".to_string()),
            ])
        );
    }

    #[test]
    fn test_try_catch_with_binding() {
        let program = parse_source("try 10 / 0 catch |e| e");
        let ExprKind::Try { catch, .. } = &program.statements[0].kind else {
            panic!("expected try");
        };
        let clause = catch.as_ref().expect("catch clause");
        assert_eq!(clause.binding.as_deref(), Some("e"));
    }

    #[test]
    fn test_map_vs_block() {
        let program = parse_source("{\"a\": 1, \"b\": 2}");
        assert!(matches!(&program.statements[0].kind, ExprKind::Map(pairs) if pairs.len() == 2));

        let program = parse_source("{ let x = 1\n x + 1 }");
        assert!(
            matches!(&program.statements[0].kind, ExprKind::Block(stmts) if stmts.len() == 2)
        );

        let program = parse_source("{}");
        assert!(matches!(&program.statements[0].kind, ExprKind::Map(pairs) if pairs.is_empty()));
    }

    #[test]
    fn test_if_with_block_braces() {
        let program = parse_source("if x == 1 { \"one\" } else { \"other\" }");
        let ExprKind::If { cond, els, .. } = &program.statements[0].kind else {
            panic!("expected if");
        };
        assert!(matches!(
            cond.kind,
            ExprKind::Infix {
                op: BinaryOp::Equal,
                ..
            }
        ));
        assert!(els.is_some());
    }

    #[test]
    fn test_match_arms() {
        let program = parse_source("match x { 1 => \"one\", (a, b) => a, .some(v) => v, _ => null }");
        let ExprKind::Match { cases, .. } = &program.statements[0].kind else {
            panic!("expected match");
        };
        assert_eq!(cases.len(), 4);
        assert!(matches!(cases[2].pattern, Pattern::Tagged { .. }));
        assert_eq!(cases[3].pattern, Pattern::Wildcard);
    }

    #[test]
    fn test_method_call_and_index() {
        let program = parse_source("acc.append(x)\nm[\"k\"]?\nl[0] = 5");
        assert!(matches!(
            &program.statements[0].kind,
            ExprKind::MethodCall { name, .. } if name == "append"
        ));
        assert!(matches!(
            &program.statements[1].kind,
            ExprKind::Index { or_null: true, .. }
        ));
        assert!(matches!(&program.statements[2].kind, ExprKind::Assign { .. }));
    }

    #[test]
    fn test_tagged_values() {
        let program = parse_source(".red\n.some(5)");
        assert!(matches!(
            &program.statements[0].kind,
            ExprKind::Tagged { payload: None, .. }
        ));
        assert!(matches!(
            &program.statements[1].kind,
            ExprKind::Tagged { payload: Some(_), .. }
        ));
    }

    #[test]
    fn test_type_infix() {
        let program = parse_source("r is error\nx as int");
        assert!(matches!(
            &program.statements[0].kind,
            ExprKind::TypeInfix {
                is_cast: false,
                ty: TypeTag::Error,
                ..
            }
        ));
        assert!(matches!(
            &program.statements[1].kind,
            ExprKind::TypeInfix {
                is_cast: true,
                ty: TypeTag::Int,
                ..
            }
        ));
    }

    #[test]
    fn test_import_and_native() {
        let program = parse_source("let util = import \"util.ox\"\n@print(\"hi\")");
        assert!(matches!(
            &program.statements[0].kind,
            ExprKind::Decl { value, .. } if matches!(value.kind, ExprKind::Import(_))
        ));
        assert!(matches!(
            &program.statements[1].kind,
            ExprKind::Call { callee, .. } if matches!(callee.kind, ExprKind::Native(_))
        ));
    }

    #[test]
    fn test_missing_paren_errors() {
        let tokens = Scanner::new("f(1, 2").scan_tokens().expect("scan failed");
        assert!(Parser::new(tokens).parse().is_err());
    }
}

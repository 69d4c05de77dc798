use std::collections::BTreeMap;

use thiserror::Error;

use crate::ast::{Expression, Statement};
use crate::lexer::{LexError, Tokenizer};
use crate::token::{Keyword, OpKind, Symbol, Token};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error(transparent)]
    Lex(#[from] LexError),
    #[error("Expected {expected}, got {token:?} at line {line}")]
    Unexpected {
        expected: &'static str,
        token: Token,
        line: usize,
    },
}

pub type ParseResult<T> = Result<T, ParseError>;

/// Recursive-descent parser over a pulled token stream.
///
/// The parser only records interning-table indices; callers resolve names
/// through the tokenizer that fed it.
pub struct Parser<'a> {
    tok: &'a mut Tokenizer,
}

impl<'a> Parser<'a> {
    pub fn new(tok: &'a mut Tokenizer) -> Self {
        Self { tok }
    }

    /// Parses one statement, folding `;`-separated statements into a
    /// sequence. End of stream and `}` terminate a sequence, so a trailing
    /// `;` is permitted.
    pub fn next_stmt(&mut self) -> ParseResult<Statement> {
        let first = self.next_basic_stmt()?;

        if self.tok.peek()?.is_symbol(Symbol::Semicolon) {
            self.tok.next()?;
            let lookahead = self.tok.peek()?;
            let terminated = lookahead.is_eof()
                || lookahead.is_symbol(Symbol::CloseBrace)
                || lookahead.is_symbol(Symbol::Semicolon);
            let second = if terminated {
                None
            } else {
                Some(Box::new(self.next_stmt()?))
            };
            return Ok(Statement::Seq {
                first: Box::new(first),
                second,
            });
        }

        Ok(first)
    }

    fn next_basic_stmt(&mut self) -> ParseResult<Statement> {
        let token = self.tok.peek()?;

        if token.is_symbol(Symbol::OpenBrace) {
            self.tok.next()?;
            if self.tok.peek()?.is_symbol(Symbol::CloseBrace) {
                self.tok.next()?;
                return Ok(Statement::Block(None));
            }
            let body = self.next_stmt()?;
            self.expect_symbol(Symbol::CloseBrace, "closing brace")?;
            return Ok(Statement::Block(Some(Box::new(body))));
        }

        if let Token::Keyword(keyword) = token {
            return self.next_keyword_stmt(keyword, token);
        }

        Ok(Statement::Expr(self.next_expr()?))
    }

    fn next_keyword_stmt(&mut self, keyword: Keyword, token: Token) -> ParseResult<Statement> {
        match keyword {
            Keyword::If => {
                self.tok.next()?;
                let condition = self.next_expr()?;
                // Branches are basic statements so `else` binds to the
                // nearest `if`.
                let if_true = Box::new(self.next_basic_stmt()?);
                let mut if_false = None;
                if self.tok.peek()?.is_keyword(Keyword::Else) {
                    self.tok.next()?;
                    if_false = Some(Box::new(self.next_basic_stmt()?));
                }
                Ok(Statement::If {
                    condition,
                    if_true,
                    if_false,
                })
            }
            Keyword::Loop => {
                self.tok.next()?;
                let mut label = None;
                if let Token::Identifier(id) = self.tok.peek()? {
                    self.tok.next()?;
                    label = Some(id);
                }
                let body = Box::new(self.next_stmt()?);
                Ok(Statement::Loop { label, body })
            }
            Keyword::Break => {
                self.tok.next()?;
                let mut label = None;
                if let Token::Identifier(id) = self.tok.peek()? {
                    self.tok.next()?;
                    label = Some(id);
                }
                Ok(Statement::Break(label))
            }
            Keyword::Continue => {
                self.tok.next()?;
                let mut label = None;
                if let Token::Identifier(id) = self.tok.peek()? {
                    self.tok.next()?;
                    label = Some(id);
                }
                Ok(Statement::Continue(label))
            }
            Keyword::Return => {
                self.tok.next()?;
                let lookahead = self.tok.peek()?;
                if lookahead.is_eof()
                    || lookahead.is_symbol(Symbol::Semicolon)
                    || lookahead.is_symbol(Symbol::CloseBrace)
                {
                    return Ok(Statement::Return(None));
                }
                Ok(Statement::Return(Some(self.next_expr()?)))
            }
            Keyword::Let => {
                self.tok.next()?;
                let name = self.expect_identifier("name")?;
                let token = self.tok.next()?;
                if !token.is_op(OpKind::Assign) {
                    return Err(self.unexpected("= in let statement", token));
                }
                Ok(Statement::Let {
                    name,
                    value: self.next_expr()?,
                })
            }
            Keyword::Fn => {
                // `fn id(params) body` desugars to `let id = fn(params) body`.
                self.tok.next()?;
                let name = self.expect_identifier("function name")?;
                let params = self.parse_fn_params()?;
                let body = Box::new(self.next_basic_stmt()?);
                Ok(Statement::Let {
                    name,
                    value: Expression::Function { params, body },
                })
            }
            Keyword::Mod => {
                self.tok.next()?;
                let name = self.expect_identifier("module name")?;
                if self.tok.peek()?.is_symbol(Symbol::OpenBrace) {
                    self.tok.next()?;
                    let body = self.next_stmt()?;
                    self.expect_symbol(Symbol::CloseBrace, "closing brace")?;
                    return Ok(Statement::Module {
                        name,
                        body: Some(Box::new(body)),
                        inner_import: false,
                    });
                }
                Ok(Statement::Module {
                    name,
                    body: None,
                    inner_import: false,
                })
            }
            Keyword::True | Keyword::False => Ok(Statement::Expr(self.next_expr()?)),
            Keyword::Else | Keyword::Macro => Err(self.unexpected("statement", token)),
        }
    }

    /// Parses one expression: a primary followed by any number of postfix
    /// calls and index operations, or a binary-operator tail. The tail
    /// parses its right side greedily and relies on `Expression::binary`
    /// to rebalance by precedence.
    pub fn next_expr(&mut self) -> ParseResult<Expression> {
        let mut x = self.next_basic_expr()?;

        loop {
            let token = self.tok.peek()?;
            if let Token::Op(op) = token {
                self.tok.next()?;
                let right = self.next_expr()?;
                x = Expression::binary(op, x, right);
            } else if token.is_symbol(Symbol::OpenParen) {
                self.tok.next()?;
                let args = self.parse_call_args()?;
                x = Expression::Call {
                    callee: Box::new(x),
                    args,
                };
            } else if token.is_symbol(Symbol::OpenSquare) {
                self.tok.next()?;
                let index = self.next_expr()?;
                self.expect_symbol(Symbol::CloseSquare, "closing bracket")?;
                x = Expression::Index {
                    collection: Box::new(x),
                    index: Box::new(index),
                };
            } else {
                return Ok(x);
            }
        }
    }

    fn next_basic_expr(&mut self) -> ParseResult<Expression> {
        let token = self.tok.next()?;
        match token {
            Token::Symbol(Symbol::OpenParen) => {
                let inside = self.next_expr()?;
                self.expect_symbol(Symbol::CloseParen, "closing paren")?;
                Ok(inside)
            }
            Token::Symbol(Symbol::OpenSquare) => self.parse_list_literal(),
            Token::Symbol(Symbol::OpenBrace) => self.parse_map_literal(),
            Token::Identifier(id) => {
                if self.tok.peek()?.is_symbol(Symbol::DoubleColon) {
                    let mut path = vec![id];
                    while self.tok.peek()?.is_symbol(Symbol::DoubleColon) {
                        self.tok.next()?;
                        path.push(self.expect_identifier("name after '::'")?);
                    }
                    return Ok(Expression::Qualified(path));
                }
                Ok(Expression::Named(id))
            }
            Token::Number(value) => Ok(Expression::Integer(value)),
            Token::Str(id) => Ok(Expression::Str(self.tok.string_literal(id).to_string())),
            Token::Keyword(Keyword::True) => Ok(Expression::Boolean(true)),
            Token::Keyword(Keyword::False) => Ok(Expression::Boolean(false)),
            Token::Keyword(Keyword::Fn) => {
                let params = self.parse_fn_params()?;
                let body = Box::new(self.next_basic_stmt()?);
                Ok(Expression::Function { params, body })
            }
            Token::Op(OpKind::NotL) => {
                Ok(Expression::Negation(Box::new(self.next_basic_expr()?)))
            }
            _ => Err(self.unexpected("start of expression", token)),
        }
    }

    fn parse_fn_params(&mut self) -> ParseResult<Vec<usize>> {
        let token = self.tok.next()?;
        if !token.is_symbol(Symbol::OpenParen) {
            return Err(self.unexpected("open paren for function", token));
        }
        let mut params = Vec::new();
        loop {
            let mut token = self.tok.next()?;
            if let Token::Identifier(id) = token {
                params.push(id);
                token = self.tok.next()?;
            }
            if token.is_symbol(Symbol::Comma) {
                continue;
            }
            if token.is_symbol(Symbol::CloseParen) {
                break;
            }
            return Err(self.unexpected("comma or closing paren in parameter list", token));
        }
        Ok(params)
    }

    fn parse_call_args(&mut self) -> ParseResult<Vec<Expression>> {
        if self.tok.peek()?.is_symbol(Symbol::CloseParen) {
            self.tok.next()?;
            return Ok(Vec::new());
        }
        let mut args = Vec::new();
        loop {
            args.push(self.next_expr()?);
            let token = self.tok.next()?;
            if token.is_symbol(Symbol::Comma) {
                continue;
            }
            if token.is_symbol(Symbol::CloseParen) {
                break;
            }
            return Err(self.unexpected("comma or closing paren in call", token));
        }
        Ok(args)
    }

    fn parse_list_literal(&mut self) -> ParseResult<Expression> {
        if self.tok.peek()?.is_symbol(Symbol::CloseSquare) {
            self.tok.next()?;
            return Ok(Expression::List(Vec::new()));
        }
        let mut elements = Vec::new();
        loop {
            elements.push(self.next_expr()?);
            let token = self.tok.next()?;
            if token.is_symbol(Symbol::Comma) {
                continue;
            }
            if token.is_symbol(Symbol::CloseSquare) {
                break;
            }
            return Err(self.unexpected("comma or closing bracket in list", token));
        }
        Ok(Expression::List(elements))
    }

    fn parse_map_literal(&mut self) -> ParseResult<Expression> {
        if self.tok.peek()?.is_symbol(Symbol::CloseBrace) {
            self.tok.next()?;
            return Ok(Expression::Map(BTreeMap::new()));
        }
        let mut entries = BTreeMap::new();
        loop {
            let key = self.expect_identifier("map key")?;
            self.expect_symbol(Symbol::Colon, "colon after map key")?;
            entries.insert(key, self.next_expr()?);
            let token = self.tok.next()?;
            if token.is_symbol(Symbol::Comma) {
                continue;
            }
            if token.is_symbol(Symbol::CloseBrace) {
                break;
            }
            return Err(self.unexpected("comma or closing brace in map", token));
        }
        Ok(Expression::Map(entries))
    }

    fn expect_identifier(&mut self, expected: &'static str) -> ParseResult<usize> {
        let token = self.tok.next()?;
        if let Token::Identifier(id) = token {
            return Ok(id);
        }
        Err(self.unexpected(expected, token))
    }

    fn expect_symbol(&mut self, symbol: Symbol, expected: &'static str) -> ParseResult<()> {
        let token = self.tok.next()?;
        if token.is_symbol(symbol) {
            return Ok(());
        }
        Err(self.unexpected(expected, token))
    }

    fn unexpected(&self, expected: &'static str, token: Token) -> ParseError {
        ParseError::Unexpected {
            expected,
            token,
            line: self.tok.line_number,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{print_statement, Expression, Statement};
    use indoc::indoc;

    fn parse(source: &str) -> (Statement, Vec<String>) {
        let mut tok = Tokenizer::new(source);
        let statement = Parser::new(&mut tok)
            .next_stmt()
            .expect("parse should succeed");
        (statement, tok.identifiers)
    }

    fn parse_err(source: &str) -> ParseError {
        let mut tok = Tokenizer::new(source);
        Parser::new(&mut tok)
            .next_stmt()
            .expect_err("expected parse failure")
    }

    #[test]
    fn parses_let_with_precedence() {
        let (statement, _) = parse("let x = 1 + 2 * 3");
        assert_eq!(
            statement,
            Statement::Let {
                name: 0,
                value: Expression::BinaryOp {
                    op: OpKind::Add,
                    left: Box::new(Expression::Integer(1)),
                    right: Box::new(Expression::BinaryOp {
                        op: OpKind::Mul,
                        left: Box::new(Expression::Integer(2)),
                        right: Box::new(Expression::Integer(3)),
                    }),
                },
            }
        );
    }

    #[test]
    fn desugars_named_fn_to_let() {
        let (statement, ids) = parse("fn add(a, b) { return a + b }");
        assert_eq!(ids, vec!["add", "a", "b"]);
        let Statement::Let { name, value } = statement else {
            panic!("expected let, got {statement:?}");
        };
        assert_eq!(name, 0);
        let Expression::Function { params, body } = value else {
            panic!("expected function value");
        };
        assert_eq!(params, vec![1, 2]);
        assert_eq!(
            *body,
            Statement::Block(Some(Box::new(Statement::Return(Some(
                Expression::BinaryOp {
                    op: OpKind::Add,
                    left: Box::new(Expression::Named(1)),
                    right: Box::new(Expression::Named(2)),
                }
            ))))),
        );
    }

    #[test]
    fn else_binds_to_nearest_if() {
        let (statement, _) = parse("if a if b x() else y()");
        let Statement::If {
            if_true, if_false, ..
        } = statement
        else {
            panic!("expected if");
        };
        assert!(if_false.is_none());
        assert!(matches!(*if_true, Statement::If { if_false: Some(_), .. }));
    }

    #[test]
    fn parses_qualified_reference() {
        let (statement, ids) = parse("a::b::c");
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(
            statement,
            Statement::Expr(Expression::Qualified(vec![0, 1, 2]))
        );
    }

    #[test]
    fn parses_empty_and_zero_argument_calls() {
        let (statement, _) = parse("make()()");
        assert_eq!(
            statement,
            Statement::Expr(Expression::Call {
                callee: Box::new(Expression::Call {
                    callee: Box::new(Expression::Named(0)),
                    args: vec![],
                }),
                args: vec![],
            })
        );
    }

    #[test]
    fn indexes_reassociate_left_to_right() {
        let (statement, _) = parse("xs[0][1]");
        assert_eq!(
            statement,
            Statement::Expr(Expression::Index {
                collection: Box::new(Expression::Index {
                    collection: Box::new(Expression::Named(0)),
                    index: Box::new(Expression::Integer(0)),
                }),
                index: Box::new(Expression::Integer(1)),
            })
        );
    }

    #[test]
    fn parses_list_and_map_literals() {
        let (statement, ids) = parse("let m = { a: 1, b: [10, 20] }");
        assert_eq!(ids, vec!["m", "a", "b"]);
        let Statement::Let { value: Expression::Map(entries), .. } = statement else {
            panic!("expected map literal");
        };
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[&1], Expression::Integer(1));
        assert_eq!(
            entries[&2],
            Expression::List(vec![Expression::Integer(10), Expression::Integer(20)])
        );
    }

    #[test]
    fn trailing_semicolon_ends_sequence() {
        let (statement, _) = parse("x(); y();");
        let Statement::Seq { second, .. } = statement else {
            panic!("expected sequence");
        };
        let second = second.expect("second statement");
        assert!(matches!(
            *second,
            Statement::Seq { second: None, .. }
        ));
    }

    #[test]
    fn parses_module_with_and_without_body() {
        let (statement, _) = parse("mod math { fn double(x) { return x * 2 } }");
        assert!(matches!(
            statement,
            Statement::Module {
                body: Some(_),
                inner_import: false,
                ..
            }
        ));

        let (statement, _) = parse("mod math");
        assert!(matches!(
            statement,
            Statement::Module {
                body: None,
                inner_import: false,
                ..
            }
        ));
    }

    #[test]
    fn parses_labeled_loop_with_break_and_continue() {
        let (statement, ids) = parse("loop outer { break outer; continue }");
        assert_eq!(ids, vec!["outer"]);
        let Statement::Loop { label, body } = statement else {
            panic!("expected loop");
        };
        assert_eq!(label, Some(0));
        let Statement::Block(Some(body)) = *body else {
            panic!("expected block body");
        };
        let Statement::Seq { first, second } = *body else {
            panic!("expected sequence");
        };
        assert_eq!(*first, Statement::Break(Some(0)));
        assert_eq!(
            second.expect("second statement").as_ref(),
            &Statement::Continue(None)
        );
    }

    #[test]
    fn parses_bare_return() {
        let (statement, _) = parse("return; x()");
        let Statement::Seq { first, .. } = statement else {
            panic!("expected sequence");
        };
        assert_eq!(*first, Statement::Return(None));
    }

    #[test]
    fn parses_negation() {
        let (statement, _) = parse("!done");
        assert_eq!(
            statement,
            Statement::Expr(Expression::Negation(Box::new(Expression::Named(0))))
        );
    }

    #[test]
    fn error_carries_offending_token_and_line() {
        let err = parse_err("let x\n: 1");
        assert_eq!(
            err,
            ParseError::Unexpected {
                expected: "= in let statement",
                token: Token::Symbol(Symbol::Colon),
                line: 1,
            }
        );
    }

    #[test]
    fn error_on_unclosed_brace() {
        let err = parse_err("{ x()");
        assert!(matches!(
            err,
            ParseError::Unexpected {
                expected: "closing brace",
                token: Token::Eof,
                ..
            }
        ));
    }

    #[test]
    fn printed_form_reparses_to_the_same_tree() {
        let source = indoc! {"
            fn fib(n) {
                if n < 2 { return n };
                return fib(n - 1) + fib(n - 2)
            };
            let xs = [1, 2, 3];
            let m = { a: xs[0], b: str::length(\"hi\") };
            loop outer {
                if m.a == 3 { break outer };
                m.a = m.a + 1
            }
        "};
        let mut tok = Tokenizer::new(source);
        let parsed = Parser::new(&mut tok).next_stmt().expect("parse");
        let printed = print_statement(&parsed, &tok.identifiers);

        let mut second_tok = Tokenizer::new(printed.clone());
        let reparsed = Parser::new(&mut second_tok).next_stmt().expect("reparse");
        let reprinted = print_statement(&reparsed, &second_tok.identifiers);
        assert_eq!(printed, reprinted);
    }
}

//! Recursive-descent parser producing the AST.
//!
//! The parser accumulates diagnostics and recovers at statement boundaries
//! (`;` / `}`) so one malformed declaration does not hide the rest of the
//! program.

use crate::ast::*;
use crate::diagnostics::{Diagnostic, Diagnostics, Span};
use crate::lexer::{parse_char, parse_int, Token, TokenKind};

/// Parse a token stream into a program plus collected diagnostics.
pub fn parse(source: &str, tokens: &[Token]) -> (Program, Diagnostics) {
    let mut parser = Parser {
        source,
        tokens,
        pos: 0,
        diagnostics: Diagnostics::new(),
    };
    let program = parser.parse_program();
    (program, parser.diagnostics)
}

struct Parser<'s, 't> {
    source: &'s str,
    tokens: &'t [Token],
    pos: usize,
    diagnostics: Diagnostics,
}

impl Parser<'_, '_> {
    // --- cursor -----------------------------------------------------------

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_kind(&self) -> Option<TokenKind> {
        self.peek().map(|t| t.kind)
    }

    fn at(&self, kind: TokenKind) -> bool {
        self.peek_kind() == Some(kind)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.at(kind) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn here(&self) -> Span {
        self.peek()
            .map(|t| t.span.clone())
            .unwrap_or(self.source.len()..self.source.len())
    }

    fn prev_end(&self) -> usize {
        self.pos
            .checked_sub(1)
            .and_then(|i| self.tokens.get(i))
            .map(|t| t.span.end)
            .unwrap_or(0)
    }

    fn error(&mut self, code: &'static str, span: Span, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic::error(code, span, message));
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Option<Token> {
        if self.at(kind) {
            return self.bump();
        }
        let span = self.here();
        self.error("P0001", span, format!("expected {what}"));
        None
    }

    fn expect_ident(&mut self, what: &str) -> Option<String> {
        let token = self.expect(TokenKind::Ident, what)?;
        Some(token.text(self.source).to_owned())
    }

    /// Skip to the next statement boundary after an error.
    fn recover(&mut self) {
        while let Some(kind) = self.peek_kind() {
            self.pos += 1;
            if kind == TokenKind::Semi || kind == TokenKind::RBrace {
                break;
            }
        }
    }

    // --- top level --------------------------------------------------------

    fn parse_program(&mut self) -> Program {
        let mut statements = Vec::new();
        while let Some(kind) = self.peek_kind() {
            match kind {
                TokenKind::KwStruct | TokenKind::KwUnion => {
                    if let Some(decl) = self.parse_struct_decl() {
                        statements.push(Stmt::TypeDecl(decl));
                    } else {
                        self.recover();
                    }
                }
                TokenKind::KwEnum => {
                    if let Some(decl) = self.parse_enum_decl() {
                        statements.push(Stmt::TypeDecl(decl));
                    } else {
                        self.recover();
                    }
                }
                TokenKind::KwBitfield => {
                    if let Some(decl) = self.parse_bitfield_decl() {
                        statements.push(Stmt::TypeDecl(decl));
                    } else {
                        self.recover();
                    }
                }
                TokenKind::Ident => {
                    if let Some(decl) = self.parse_var_decl() {
                        statements.push(Stmt::VarDecl(decl));
                    } else {
                        self.recover();
                    }
                }
                TokenKind::Garbage => {
                    let span = self.here();
                    self.error("L0001", span, "unrecognized characters");
                    self.pos += 1;
                }
                _ => {
                    let span = self.here();
                    self.error("P0002", span, "expected a declaration");
                    self.recover();
                }
            }
        }
        Program { statements }
    }

    fn parse_struct_decl(&mut self) -> Option<TypeDecl> {
        let start = self.here().start;
        let is_union = self.at(TokenKind::KwUnion);
        self.bump(); // struct / union

        let name = self.expect_ident("a type name")?;

        let mut inherits = Vec::new();
        if self.eat(TokenKind::Colon) {
            loop {
                inherits.push(self.expect_ident("a base type name")?);
                if !self.eat(TokenKind::Comma) {
                    break;
                }
            }
        }

        self.expect(TokenKind::LBrace, "`{`")?;
        let members = self.parse_member_list();
        self.expect(TokenKind::RBrace, "`}`")?;
        self.eat(TokenKind::Semi);

        let def = StructDef { inherits, members };
        Some(TypeDecl {
            name,
            kind: if is_union {
                TypeDef::Union(def)
            } else {
                TypeDef::Struct(def)
            },
            span: start..self.prev_end(),
        })
    }

    fn parse_enum_decl(&mut self) -> Option<TypeDecl> {
        let start = self.here().start;
        self.bump(); // enum

        let name = self.expect_ident("an enum name")?;
        self.expect(TokenKind::Colon, "`:` and an underlying type")?;
        let underlying = self.expect_ident("the underlying type")?;
        self.expect(TokenKind::LBrace, "`{`")?;

        let mut constants = Vec::new();
        while self.at(TokenKind::Ident) {
            let const_start = self.here().start;
            let const_name = self.expect_ident("a constant name")?;
            let value = if self.eat(TokenKind::Assign) {
                Some(self.parse_expr()?)
            } else {
                None
            };
            constants.push(EnumConstant {
                name: const_name,
                value,
                span: const_start..self.prev_end(),
            });
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }

        self.expect(TokenKind::RBrace, "`}`")?;
        self.eat(TokenKind::Semi);

        Some(TypeDecl {
            name,
            kind: TypeDef::Enum(EnumDef {
                underlying,
                constants,
            }),
            span: start..self.prev_end(),
        })
    }

    fn parse_bitfield_decl(&mut self) -> Option<TypeDecl> {
        let start = self.here().start;
        self.bump(); // bitfield

        let name = self.expect_ident("a bitfield name")?;
        self.expect(TokenKind::LBrace, "`{`")?;

        let mut fields = Vec::new();
        while self.at(TokenKind::Ident) {
            let field_start = self.here().start;
            let field_name = self.expect_ident("a field name")?;
            self.expect(TokenKind::Colon, "`:` and a bit width")?;
            let bits = self.parse_expr()?;
            self.expect(TokenKind::Semi, "`;`")?;
            fields.push(BitfieldField {
                name: field_name,
                bits,
                span: field_start..self.prev_end(),
            });
        }

        self.expect(TokenKind::RBrace, "`}`")?;
        self.eat(TokenKind::Semi);

        Some(TypeDecl {
            name,
            kind: TypeDef::Bitfield(BitfieldDef { fields }),
            span: start..self.prev_end(),
        })
    }

    // --- struct members ---------------------------------------------------

    fn parse_member_list(&mut self) -> Vec<Member> {
        let mut members = Vec::new();
        while let Some(kind) = self.peek_kind() {
            if kind == TokenKind::RBrace {
                break;
            }
            match self.parse_member() {
                Some(member) => members.push(member),
                None => self.recover(),
            }
        }
        members
    }

    fn parse_member(&mut self) -> Option<Member> {
        match self.peek_kind()? {
            TokenKind::KwIf => self.parse_if_member(),
            TokenKind::KwMatch => self.parse_match_member(),
            TokenKind::Ident => self.parse_var_decl().map(Member::Decl),
            _ => {
                let span = self.here();
                self.error("P0003", span, "expected a member declaration");
                None
            }
        }
    }

    /// A member body: `{ ... }` or a single member.
    fn parse_member_body(&mut self) -> Vec<Member> {
        if self.eat(TokenKind::LBrace) {
            let members = self.parse_member_list();
            self.expect(TokenKind::RBrace, "`}`");
            members
        } else {
            self.parse_member().into_iter().collect()
        }
    }

    fn parse_if_member(&mut self) -> Option<Member> {
        let start = self.here().start;
        self.bump(); // if

        self.expect(TokenKind::LParen, "`(`")?;
        let condition = self.parse_expr()?;
        self.expect(TokenKind::RParen, "`)`")?;

        let then_body = self.parse_member_body();
        let else_body = if self.eat(TokenKind::KwElse) {
            self.parse_member_body()
        } else {
            Vec::new()
        };

        Some(Member::If {
            condition,
            then_body,
            else_body,
            span: start..self.prev_end(),
        })
    }

    fn parse_match_member(&mut self) -> Option<Member> {
        let start = self.here().start;
        self.bump(); // match

        self.expect(TokenKind::LParen, "`(`")?;
        let scrutinee = self.parse_expr()?;
        self.expect(TokenKind::RParen, "`)`")?;
        self.expect(TokenKind::LBrace, "`{`")?;

        let mut arms = Vec::new();
        while !self.at(TokenKind::RBrace) && self.peek().is_some() {
            let arm_start = self.here().start;
            let pattern = if self.at(TokenKind::Ident) && self.peek().unwrap().text(self.source) == "_"
            {
                self.bump();
                None
            } else {
                // no ternary here: `:` separates the pattern from the body
                Some(self.parse_or()?)
            };
            self.expect(TokenKind::Colon, "`:`")?;
            let body = self.parse_member_body();
            arms.push(MatchArm {
                pattern,
                body,
                span: arm_start..self.prev_end(),
            });
        }

        self.expect(TokenKind::RBrace, "`}`")?;

        Some(Member::Match {
            scrutinee,
            arms,
            span: start..self.prev_end(),
        })
    }

    fn parse_var_decl(&mut self) -> Option<VarDecl> {
        let start = self.here().start;
        let type_name = self.expect_ident("a type name")?;
        let name = self.expect_ident("a variable name")?;

        let count = if self.eat(TokenKind::LBracket) {
            let count = if self.eat(TokenKind::KwWhile) {
                self.expect(TokenKind::LParen, "`(`")?;
                let condition = self.parse_expr()?;
                self.expect(TokenKind::RParen, "`)`")?;
                ArrayCount::While(condition)
            } else {
                ArrayCount::Fixed(self.parse_expr()?)
            };
            self.expect(TokenKind::RBracket, "`]`")?;
            Some(count)
        } else {
            None
        };

        let placement = if self.eat(TokenKind::At) {
            Some(self.parse_expr()?)
        } else {
            None
        };

        self.expect(TokenKind::Semi, "`;`")?;

        Some(VarDecl {
            name,
            type_name,
            count,
            placement,
            span: start..self.prev_end(),
        })
    }

    // --- expressions ------------------------------------------------------

    fn parse_expr(&mut self) -> Option<Expr> {
        let start = self.here().start;
        let condition = self.parse_or()?;
        if self.eat(TokenKind::Question) {
            let then_expr = self.parse_expr()?;
            self.expect(TokenKind::Colon, "`:`")?;
            let else_expr = self.parse_expr()?;
            return Some(Expr::Ternary {
                condition: Box::new(condition),
                then_expr: Box::new(then_expr),
                else_expr: Box::new(else_expr),
                span: start..self.prev_end(),
            });
        }
        Some(condition)
    }

    fn binary_level(
        &mut self,
        next: fn(&mut Self) -> Option<Expr>,
        table: &[(TokenKind, BinaryOp)],
    ) -> Option<Expr> {
        let start = self.here().start;
        let mut lhs = next(self)?;
        'outer: loop {
            for &(kind, op) in table {
                if self.at(kind) {
                    self.bump();
                    let rhs = next(self)?;
                    lhs = Expr::Binary {
                        op,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                        span: start..self.prev_end(),
                    };
                    continue 'outer;
                }
            }
            break;
        }
        Some(lhs)
    }

    fn parse_or(&mut self) -> Option<Expr> {
        self.binary_level(Self::parse_and, &[(TokenKind::OrOr, BinaryOp::Or)])
    }

    fn parse_and(&mut self) -> Option<Expr> {
        self.binary_level(Self::parse_bitor, &[(TokenKind::AndAnd, BinaryOp::And)])
    }

    fn parse_bitor(&mut self) -> Option<Expr> {
        self.binary_level(Self::parse_bitxor, &[(TokenKind::Pipe, BinaryOp::BitOr)])
    }

    fn parse_bitxor(&mut self) -> Option<Expr> {
        self.binary_level(Self::parse_bitand, &[(TokenKind::Caret, BinaryOp::BitXor)])
    }

    fn parse_bitand(&mut self) -> Option<Expr> {
        self.binary_level(Self::parse_equality, &[(TokenKind::Amp, BinaryOp::BitAnd)])
    }

    fn parse_equality(&mut self) -> Option<Expr> {
        self.binary_level(
            Self::parse_relational,
            &[(TokenKind::EqEq, BinaryOp::Eq), (TokenKind::NotEq, BinaryOp::Neq)],
        )
    }

    fn parse_relational(&mut self) -> Option<Expr> {
        self.binary_level(
            Self::parse_shift,
            &[
                (TokenKind::LtEq, BinaryOp::Lte),
                (TokenKind::GtEq, BinaryOp::Gte),
                (TokenKind::Lt, BinaryOp::Lt),
                (TokenKind::Gt, BinaryOp::Gt),
            ],
        )
    }

    fn parse_shift(&mut self) -> Option<Expr> {
        self.binary_level(
            Self::parse_additive,
            &[(TokenKind::Shl, BinaryOp::Shl), (TokenKind::Shr, BinaryOp::Shr)],
        )
    }

    fn parse_additive(&mut self) -> Option<Expr> {
        self.binary_level(
            Self::parse_multiplicative,
            &[(TokenKind::Plus, BinaryOp::Add), (TokenKind::Minus, BinaryOp::Sub)],
        )
    }

    fn parse_multiplicative(&mut self) -> Option<Expr> {
        self.binary_level(
            Self::parse_unary,
            &[
                (TokenKind::Star, BinaryOp::Mul),
                (TokenKind::Slash, BinaryOp::Div),
                (TokenKind::Percent, BinaryOp::Rem),
            ],
        )
    }

    fn parse_unary(&mut self) -> Option<Expr> {
        let start = self.here().start;
        if self.eat(TokenKind::Bang) {
            let operand = self.parse_unary()?;
            return Some(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
                span: start..self.prev_end(),
            });
        }
        if self.eat(TokenKind::Minus) {
            let operand = self.parse_unary()?;
            return Some(Expr::Unary {
                op: UnaryOp::Neg,
                operand: Box::new(operand),
                span: start..self.prev_end(),
            });
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Option<Expr> {
        let token = match self.peek() {
            Some(token) => token.clone(),
            None => {
                let span = self.here();
                self.error("P0004", span, "expected an expression");
                return None;
            }
        };

        match token.kind {
            TokenKind::DecInt | TokenKind::HexInt | TokenKind::BinInt | TokenKind::OctInt => {
                self.bump();
                match parse_int(token.text(self.source)) {
                    Some(value) => Some(Expr::Unsigned(value)),
                    None => {
                        self.error("P0005", token.span, "integer literal out of range");
                        None
                    }
                }
            }
            TokenKind::KwTrue => {
                self.bump();
                Some(Expr::Bool(true))
            }
            TokenKind::KwFalse => {
                self.bump();
                Some(Expr::Bool(false))
            }
            TokenKind::CharLit => {
                self.bump();
                match parse_char(token.text(self.source)) {
                    Some(value) => Some(Expr::Char(value)),
                    None => {
                        self.error("P0006", token.span, "malformed character literal");
                        None
                    }
                }
            }
            TokenKind::Ident => {
                self.bump();
                let name = token.text(self.source).to_owned();
                if self.eat(TokenKind::PathSep) {
                    let member = self.expect_ident("a constant name")?;
                    return Some(Expr::ScopeResolution {
                        scope: name,
                        name: member,
                        span: token.span.start..self.prev_end(),
                    });
                }
                Some(Expr::Name(name, token.span))
            }
            TokenKind::LParen => {
                self.bump();
                let inner = self.parse_expr()?;
                self.expect(TokenKind::RParen, "`)`")?;
                Some(inner)
            }
            _ => {
                self.error("P0004", token.span, "expected an expression");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::lex;
    use indoc::indoc;

    fn parse_ok(source: &str) -> Program {
        let tokens = lex(source);
        let (program, diagnostics) = parse(source, &tokens);
        assert!(!diagnostics.has_errors(), "diagnostics: {diagnostics:?}");
        program
    }

    #[test]
    fn placed_scalar_declaration() {
        let program = parse_ok("u32 x @ 0x00;");

        let Stmt::VarDecl(decl) = &program.statements[0] else {
            panic!("expected a variable declaration");
        };
        assert_eq!(decl.name, "x");
        assert_eq!(decl.type_name, "u32");
        assert_eq!(decl.placement, Some(Expr::Unsigned(0)));
        assert!(decl.count.is_none());
    }

    #[test]
    fn struct_with_members_and_inheritance() {
        let program = parse_ok(indoc! {"
            struct Base { u32 magic; };
            struct Derived : Base { u16 version; };
            Derived d @ 0x00;
        "});

        assert_eq!(program.statements.len(), 3);
        let Stmt::TypeDecl(decl) = &program.statements[1] else {
            panic!("expected a type declaration");
        };
        let TypeDef::Struct(def) = &decl.kind else {
            panic!("expected a struct");
        };
        assert_eq!(def.inherits, vec!["Base"]);
        assert_eq!(def.members.len(), 1);
    }

    #[test]
    fn conditional_member() {
        let program = parse_ok(indoc! {"
            struct M {
                u8 tag;
                if (tag == 1)
                    u16 a;
                else
                    u8 a;
            };
        "});

        let Stmt::TypeDecl(decl) = &program.statements[0] else {
            panic!("expected a type declaration");
        };
        let TypeDef::Struct(def) = &decl.kind else {
            panic!("expected a struct");
        };
        let Member::If {
            then_body,
            else_body,
            ..
        } = &def.members[1]
        else {
            panic!("expected an if member");
        };
        assert_eq!(then_body.len(), 1);
        assert_eq!(else_body.len(), 1);
    }

    #[test]
    fn array_declarations() {
        let program = parse_ok(indoc! {"
            struct S {
                u8 fixed[4];
                u8 streamed[while (fixed < 10)];
            };
        "});

        let Stmt::TypeDecl(decl) = &program.statements[0] else {
            panic!("expected a type declaration");
        };
        let TypeDef::Struct(def) = &decl.kind else {
            panic!("expected a struct");
        };
        let Member::Decl(fixed) = &def.members[0] else {
            panic!()
        };
        assert!(matches!(fixed.count, Some(ArrayCount::Fixed(_))));
        let Member::Decl(streamed) = &def.members[1] else {
            panic!()
        };
        assert!(matches!(streamed.count, Some(ArrayCount::While(_))));
    }

    #[test]
    fn enum_with_auto_increment() {
        let program = parse_ok("enum Color : u8 { Red = 1, Green, Blue = 7 };");

        let Stmt::TypeDecl(decl) = &program.statements[0] else {
            panic!("expected a type declaration");
        };
        let TypeDef::Enum(def) = &decl.kind else {
            panic!("expected an enum");
        };
        assert_eq!(def.underlying, "u8");
        assert_eq!(def.constants.len(), 3);
        assert!(def.constants[1].value.is_none());
    }

    #[test]
    fn match_member_with_wildcard() {
        let program = parse_ok(indoc! {"
            struct P {
                u8 kind;
                match (kind) {
                    1: u16 payload;
                    _: u8 payload;
                }
            };
        "});

        let Stmt::TypeDecl(decl) = &program.statements[0] else {
            panic!("expected a type declaration");
        };
        let TypeDef::Struct(def) = &decl.kind else {
            panic!("expected a struct");
        };
        let Member::Match { arms, .. } = &def.members[1] else {
            panic!("expected a match member");
        };
        assert_eq!(arms.len(), 2);
        assert!(arms[0].pattern.is_some());
        assert!(arms[1].pattern.is_none());
    }

    #[test]
    fn expression_precedence() {
        let program = parse_ok("u8 x @ 1 + 2 * 3;");

        let Stmt::VarDecl(decl) = &program.statements[0] else {
            panic!()
        };
        let Some(Expr::Binary { op, rhs, .. }) = &decl.placement else {
            panic!("expected a binary expression");
        };
        assert_eq!(*op, BinaryOp::Add);
        assert!(matches!(**rhs, Expr::Binary { op: BinaryOp::Mul, .. }));
    }

    #[test]
    fn scope_resolution_expression() {
        let program = parse_ok(indoc! {"
            struct S {
                u8 tag;
                if (tag == Color::Red) u8 r;
            };
        "});
        assert_eq!(program.statements.len(), 1);
    }

    #[test]
    fn recovery_after_malformed_declaration() {
        let source = "u32 @ ;\nu8 ok @ 0;";
        let tokens = lex(source);
        let (program, diagnostics) = parse(source, &tokens);

        assert!(diagnostics.has_errors());
        assert_eq!(program.statements.len(), 1);
        let Stmt::VarDecl(decl) = &program.statements[0] else {
            panic!()
        };
        assert_eq!(decl.name, "ok");
    }
}

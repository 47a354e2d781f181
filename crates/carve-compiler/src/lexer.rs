//! Lexer for the pattern language.
//!
//! Produces span-based tokens; text is sliced from the source only when
//! needed. Consecutive unrecognized characters coalesce into single
//! `Garbage` tokens so malformed input stays manageable downstream.

use logos::Logos;

use crate::diagnostics::Span;

/// Token kinds produced by the logos-derived lexer.
#[derive(Logos, Debug, Clone, Copy, PartialEq, Eq)]
#[logos(skip r"[ \t\r\n\f]+")]
#[logos(skip r"//[^\n]*")]
#[logos(skip r"/\*[^*]*\*+(?:[^/*][^*]*\*+)*/")]
pub enum TokenKind {
    #[token("struct")]
    KwStruct,
    #[token("union")]
    KwUnion,
    #[token("enum")]
    KwEnum,
    #[token("bitfield")]
    KwBitfield,
    #[token("if")]
    KwIf,
    #[token("else")]
    KwElse,
    #[token("match")]
    KwMatch,
    #[token("while")]
    KwWhile,
    #[token("true")]
    KwTrue,
    #[token("false")]
    KwFalse,

    #[regex(r"[A-Za-z_][A-Za-z0-9_]*")]
    Ident,
    #[regex(r"0[xX][0-9a-fA-F]+")]
    HexInt,
    #[regex(r"0[bB][01]+")]
    BinInt,
    #[regex(r"0[oO][0-7]+")]
    OctInt,
    #[regex(r"[0-9]+")]
    DecInt,
    #[regex(r"'(?:[^'\\\n]|\\.)'")]
    CharLit,
    #[regex(r#""(?:[^"\\\n]|\\.)*""#)]
    StringLit,

    #[token("@")]
    At,
    #[token(";")]
    Semi,
    #[token("::")]
    PathSep,
    #[token(":")]
    Colon,
    #[token(",")]
    Comma,
    #[token("=")]
    Assign,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("?")]
    Question,

    #[token("==")]
    EqEq,
    #[token("!=")]
    NotEq,
    #[token("<=")]
    LtEq,
    #[token(">=")]
    GtEq,
    #[token("<<")]
    Shl,
    #[token(">>")]
    Shr,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,
    #[token("&&")]
    AndAnd,
    #[token("||")]
    OrOr,
    #[token("!")]
    Bang,
    #[token("&")]
    Amp,
    #[token("|")]
    Pipe,
    #[token("^")]
    Caret,
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

    /// Coalesced run of unrecognized characters.
    Garbage,
}

/// A token: kind plus byte span into the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

impl Token {
    pub fn new(kind: TokenKind, span: Span) -> Self {
        Self { kind, span }
    }

    /// Slice the token's text out of the source.
    #[inline]
    pub fn text<'s>(&self, source: &'s str) -> &'s str {
        &source[self.span.clone()]
    }
}

/// Tokenize source, coalescing lexer errors into `Garbage` tokens.
pub fn lex(source: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut lexer = TokenKind::lexer(source);
    let mut error_start: Option<usize> = None;

    loop {
        match lexer.next() {
            Some(Ok(kind)) => {
                if let Some(start) = error_start.take() {
                    tokens.push(Token::new(TokenKind::Garbage, start..lexer.span().start));
                }
                tokens.push(Token::new(kind, lexer.span()));
            }
            Some(Err(())) => {
                if error_start.is_none() {
                    error_start = Some(lexer.span().start);
                }
            }
            None => {
                if let Some(start) = error_start.take() {
                    tokens.push(Token::new(TokenKind::Garbage, start..source.len()));
                }
                break;
            }
        }
    }

    tokens
}

/// Decode an integer literal token. Assumes the token matched one of the
/// integer regexes.
pub fn parse_int(text: &str) -> Option<u128> {
    let (digits, radix) = match text.as_bytes() {
        [b'0', b'x' | b'X', ..] => (&text[2..], 16),
        [b'0', b'b' | b'B', ..] => (&text[2..], 2),
        [b'0', b'o' | b'O', ..] => (&text[2..], 8),
        _ => (text, 10),
    };
    u128::from_str_radix(digits, radix).ok()
}

/// Decode a char literal token (including simple escapes).
pub fn parse_char(text: &str) -> Option<char> {
    let inner = text.strip_prefix('\'')?.strip_suffix('\'')?;
    let mut chars = inner.chars();
    let first = chars.next()?;
    let decoded = if first == '\\' {
        match chars.next()? {
            'n' => '\n',
            't' => '\t',
            'r' => '\r',
            '0' => '\0',
            '\\' => '\\',
            '\'' => '\'',
            other => other,
        }
    } else {
        first
    };
    chars.next().is_none().then_some(decoded)
}

//! The token definition for the rule language.

/// A token is a single unit of the language, with a specific kind and location.
#[derive(Debug, Clone, PartialEq)]
pub struct Token<'a> {
    pub kind: TokenKind<'a>,
    pub span: Span,
}

/// The kind of a token.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind<'a> {
    // Keywords
    Between,  // "between"
    And,      // "and"
    Or,       // "or"
    In,       // "in"
    Required, // "required"
    Unless,   // "unless"
    If,       // "if"
    Then,     // "then"
    Else,     // "else"
    EndIf,    // "endif"
    Within,   // "within"
    Days,     // "days"
    Of,       // "of"

    // Literals
    Identifier(&'a str),
    String(&'a str), // Content between the quotes
    Integer(i64),
    Decimal(f64),
    Date(&'a str), // YYYY-MM-DD, validated by the parser

    // Punctuation
    LParen, // (
    RParen, // )
    Comma,  // ,
    Plus,   // +
    Minus,  // -

    // Operators
    Eq,    // == (or =)
    NotEq, // !=
    Gt,    // >
    Lt,    // <
    Gte,   // >=
    Lte,   // <=

    // Special
    Illegal,      // An illegal/unknown character
    Unterminated, // A string literal without its closing quote
}

impl TokenKind<'_> {
    /// Human readable rendering used in parse errors.
    pub fn describe(&self) -> String {
        match self {
            TokenKind::Between => "'between'".to_string(),
            TokenKind::And => "'and'".to_string(),
            TokenKind::Or => "'or'".to_string(),
            TokenKind::In => "'in'".to_string(),
            TokenKind::Required => "'required'".to_string(),
            TokenKind::Unless => "'unless'".to_string(),
            TokenKind::If => "'if'".to_string(),
            TokenKind::Then => "'then'".to_string(),
            TokenKind::Else => "'else'".to_string(),
            TokenKind::EndIf => "'endif'".to_string(),
            TokenKind::Within => "'within'".to_string(),
            TokenKind::Days => "'days'".to_string(),
            TokenKind::Of => "'of'".to_string(),
            TokenKind::Identifier(name) => format!("identifier '{}'", name),
            TokenKind::String(s) => format!("string '{}'", s),
            TokenKind::Integer(n) => format!("integer {}", n),
            TokenKind::Decimal(n) => format!("number {}", n),
            TokenKind::Date(d) => format!("date {}", d),
            TokenKind::LParen => "'('".to_string(),
            TokenKind::RParen => "')'".to_string(),
            TokenKind::Comma => "','".to_string(),
            TokenKind::Plus => "'+'".to_string(),
            TokenKind::Minus => "'-'".to_string(),
            TokenKind::Eq => "'=='".to_string(),
            TokenKind::NotEq => "'!='".to_string(),
            TokenKind::Gt => "'>'".to_string(),
            TokenKind::Lt => "'<'".to_string(),
            TokenKind::Gte => "'>='".to_string(),
            TokenKind::Lte => "'<='".to_string(),
            TokenKind::Illegal => "illegal character".to_string(),
            TokenKind::Unterminated => "unterminated string".to_string(),
        }
    }
}

/// Represents a span in the source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    /// The starting byte offset.
    pub start: usize,
    /// The ending byte offset.
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }
}

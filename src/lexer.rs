//! 规则语言的词法分析器

use crate::token::{Span, Token, TokenKind};
use thiserror::Error;

/// 词法错误：非法字符或未闭合的字符串
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} at position {position}")]
pub struct LexError {
    pub position: usize,
    pub message: String,
}

pub struct Lexer<'a> {
    input: &'a str,
    /// 输入字符串中的当前位置（字节索引）
    position: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Lexer { input, position: 0 }
    }

    /// 返回当前位置的字符，不推进位置
    fn peek(&self) -> Option<char> {
        self.input[self.position..].chars().next()
    }

    /// 返回下一个位置的字符，不推进位置
    fn peek_next(&self) -> Option<char> {
        self.input[self.position..].chars().nth(1)
    }

    /// 推进位置一个字符并返回该字符
    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if let Some(c) = c {
            self.position += c.len_utf8();
        }
        c
    }

    /// 跳过空白字符
    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.bump();
            } else {
                break;
            }
        }
    }

    fn token(&self, kind: TokenKind<'a>, start: usize) -> Token<'a> {
        Token {
            kind,
            span: Span::new(start, self.position),
        }
    }

    /// 读取数字字面量：整数、小数或 YYYY-MM-DD 日期
    fn read_number(&mut self, start: usize) -> Token<'a> {
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                self.bump();
            } else {
                break;
            }
        }

        // 四位数字后紧跟 "-数字" 视为日期
        let is_date = self.position - start == 4
            && self.peek() == Some('-')
            && self.peek_next().is_some_and(|c| c.is_ascii_digit());
        if is_date {
            while let Some(c) = self.peek() {
                if c.is_ascii_digit() || c == '-' {
                    self.bump();
                } else {
                    break;
                }
            }
            return self.token(TokenKind::Date(&self.input[start..self.position]), start);
        }

        let is_decimal =
            self.peek() == Some('.') && self.peek_next().is_some_and(|c| c.is_ascii_digit());
        if is_decimal {
            self.bump(); // 消费 '.'
            while let Some(c) = self.peek() {
                if c.is_ascii_digit() {
                    self.bump();
                } else {
                    break;
                }
            }
            let kind = match self.input[start..self.position].parse::<f64>() {
                Ok(value) => TokenKind::Decimal(value),
                Err(_) => TokenKind::Illegal,
            };
            return self.token(kind, start);
        }

        let kind = match self.input[start..self.position].parse::<i64>() {
            Ok(value) => TokenKind::Integer(value),
            Err(_) => TokenKind::Illegal, // 溢出
        };
        self.token(kind, start)
    }

    /// 读取引号包围的字符串字面量（单引号或双引号）
    /// 注意：开始的引号已经被调用者消费
    fn read_string(&mut self, start: usize, quote: char) -> Token<'a> {
        let content_start = self.position;
        while let Some(c) = self.peek() {
            if c == quote {
                let content = &self.input[content_start..self.position];
                self.bump(); // 消费结束引号
                return self.token(TokenKind::String(content), start);
            }
            self.bump();
        }
        self.token(TokenKind::Unterminated, start)
    }

    /// 读取标识符或关键字
    /// 标识符可以包含字母、数字和下划线；访视限定名形如 `previous.weight`
    fn read_identifier(&mut self, start: usize) -> Token<'a> {
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                self.bump();
            } else if c == '.' && self.peek_next().is_some_and(char::is_alphabetic) {
                self.bump();
            } else {
                break;
            }
        }
        let literal = &self.input[start..self.position];
        self.token(match_keyword(literal), start)
    }
}

fn match_keyword(s: &str) -> TokenKind {
    match s.to_ascii_lowercase().as_str() {
        "between" => TokenKind::Between,
        "and" => TokenKind::And,
        "or" => TokenKind::Or,
        "in" => TokenKind::In,
        "required" => TokenKind::Required,
        "unless" => TokenKind::Unless,
        "if" => TokenKind::If,
        "then" => TokenKind::Then,
        "else" => TokenKind::Else,
        "endif" => TokenKind::EndIf,
        "within" => TokenKind::Within,
        "days" => TokenKind::Days,
        "of" => TokenKind::Of,
        _ => TokenKind::Identifier(s),
    }
}

impl<'a> Iterator for Lexer<'a> {
    type Item = Token<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        self.skip_whitespace();
        let start = self.position;

        // 到达输入末尾
        let c = self.bump()?;

        let token = match c {
            '(' => self.token(TokenKind::LParen, start),
            ')' => self.token(TokenKind::RParen, start),
            ',' => self.token(TokenKind::Comma, start),
            '+' => self.token(TokenKind::Plus, start),
            '-' => self.token(TokenKind::Minus, start),
            '=' => {
                if self.peek() == Some('=') {
                    self.bump();
                }
                self.token(TokenKind::Eq, start)
            }
            '<' => {
                if self.peek() == Some('=') {
                    self.bump();
                    self.token(TokenKind::Lte, start)
                } else {
                    self.token(TokenKind::Lt, start)
                }
            }
            '>' => {
                if self.peek() == Some('=') {
                    self.bump();
                    self.token(TokenKind::Gte, start)
                } else {
                    self.token(TokenKind::Gt, start)
                }
            }
            '!' => {
                if self.peek() == Some('=') {
                    self.bump();
                    self.token(TokenKind::NotEq, start)
                } else {
                    self.token(TokenKind::Illegal, start)
                }
            }
            '"' | '\'' => self.read_string(start, c),
            c if c.is_ascii_digit() => self.read_number(start),
            c if c.is_alphabetic() || c == '_' => self.read_identifier(start),
            _ => self.token(TokenKind::Illegal, start),
        };
        Some(token)
    }
}

/// 对整条规则分词，遇到非法字符或未闭合字符串时返回 `LexError`
pub fn tokenize(input: &str) -> Result<Vec<Token<'_>>, LexError> {
    let mut tokens = Vec::new();
    for token in Lexer::new(input) {
        match token.kind {
            TokenKind::Illegal => {
                let fragment = &input[token.span.start..token.span.end];
                return Err(LexError {
                    position: token.span.start,
                    message: format!("unexpected input '{}'", fragment),
                });
            }
            TokenKind::Unterminated => {
                return Err(LexError {
                    position: token.span.start,
                    message: "unterminated string literal".to_string(),
                });
            }
            _ => tokens.push(token),
        }
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<TokenKind<'_>> {
        Lexer::new(input).map(|t| t.kind).collect()
    }

    #[test]
    fn test_range_rule() {
        let mut lexer = Lexer::new("age between 18 and 65");

        assert_eq!(lexer.next().unwrap().kind, TokenKind::Identifier("age"));
        assert_eq!(lexer.next().unwrap().kind, TokenKind::Between);
        assert_eq!(lexer.next().unwrap().kind, TokenKind::Integer(18));
        assert_eq!(lexer.next().unwrap().kind, TokenKind::And);
        assert_eq!(lexer.next().unwrap().kind, TokenKind::Integer(65));
        assert_eq!(lexer.next(), None);
    }

    #[test]
    fn test_all_operators_and_punctuation() {
        assert_eq!(
            kinds("== != > < >= <= = ( ) , + -"),
            vec![
                TokenKind::Eq,
                TokenKind::NotEq,
                TokenKind::Gt,
                TokenKind::Lt,
                TokenKind::Gte,
                TokenKind::Lte,
                TokenKind::Eq,
                TokenKind::LParen,
                TokenKind::RParen,
                TokenKind::Comma,
                TokenKind::Plus,
                TokenKind::Minus,
            ]
        );
    }

    #[test]
    fn test_keywords_are_case_insensitive() {
        assert_eq!(
            kinds("BETWEEN And in REQUIRED Unless IF then ELSE EndIf WITHIN days OF or"),
            vec![
                TokenKind::Between,
                TokenKind::And,
                TokenKind::In,
                TokenKind::Required,
                TokenKind::Unless,
                TokenKind::If,
                TokenKind::Then,
                TokenKind::Else,
                TokenKind::EndIf,
                TokenKind::Within,
                TokenKind::Days,
                TokenKind::Of,
                TokenKind::Or,
            ]
        );
    }

    #[test]
    fn test_literals() {
        assert_eq!(
            kinds(r#"12345 72.5 2024-01-01 'Withdrawn' "two words""#),
            vec![
                TokenKind::Integer(12345),
                TokenKind::Decimal(72.5),
                TokenKind::Date("2024-01-01"),
                TokenKind::String("Withdrawn"),
                TokenKind::String("two words"),
            ]
        );
    }

    #[test]
    fn test_subtraction_is_not_a_date() {
        assert_eq!(
            kinds("weight - 10"),
            vec![
                TokenKind::Identifier("weight"),
                TokenKind::Minus,
                TokenKind::Integer(10),
            ]
        );
        assert_eq!(
            kinds("5-1"),
            vec![TokenKind::Integer(5), TokenKind::Minus, TokenKind::Integer(1)]
        );
    }

    #[test]
    fn test_within_rule() {
        assert_eq!(
            kinds("visit_date within 60 days of baseline_date + 365"),
            vec![
                TokenKind::Identifier("visit_date"),
                TokenKind::Within,
                TokenKind::Integer(60),
                TokenKind::Days,
                TokenKind::Of,
                TokenKind::Identifier("baseline_date"),
                TokenKind::Plus,
                TokenKind::Integer(365),
            ]
        );
    }

    #[test]
    fn test_visit_qualified_identifier() {
        assert_eq!(
            kinds("weight > previous.weight"),
            vec![
                TokenKind::Identifier("weight"),
                TokenKind::Gt,
                TokenKind::Identifier("previous.weight"),
            ]
        );
    }

    #[test]
    fn test_spans_track_byte_offsets() {
        let tokens: Vec<_> = Lexer::new("  gender in (Male)").collect();
        assert_eq!(tokens[0].span, Span::new(2, 8));
        assert_eq!(tokens[1].span, Span::new(9, 11));
        assert_eq!(tokens[3].span, Span::new(13, 17));
    }

    #[test]
    fn test_tokenize_reports_illegal_character() {
        let err = tokenize("age > 18 # comment").unwrap_err();
        assert_eq!(err.position, 9);
        assert!(err.message.contains('#'));
    }

    #[test]
    fn test_tokenize_reports_unterminated_string() {
        let err = tokenize("status == 'Withdrawn").unwrap_err();
        assert_eq!(err.position, 10);
        assert_eq!(err.message, "unterminated string literal");
    }

    #[test]
    fn test_lone_bang_is_illegal() {
        assert_eq!(kinds("!"), vec![TokenKind::Illegal]);
    }
}

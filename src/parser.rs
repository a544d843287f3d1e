//! 规则语言的语法分析器
//!
//! ## 解析流程图
//!
//! ```text
//! parse()
//!   └─ parse_or_expression()
//!        └─ parse_and_expression()
//!             └─ parse_unary_expression()
//!                  ├─ "required" → parse_required()      (unless 后递归 parse_or_expression)
//!                  ├─ "if"       → parse_conditional()   (if/then/else/endif)
//!                  └─ 其他       → parse_predicate()
//!                                   ├─ parse_additive_expression()
//!                                   │    └─ parse_primary_expression()
//!                                   │         ├─ "(" → 分组表达式 (递归调用 parse_or_expression)
//!                                   │         ├─ 标识符 "(" → 函数调用（查询函数注册表）
//!                                   │         ├─ 标识符 → 字段引用
//!                                   │         └─ 字面量 / 负数
//!                                   └─ 之后可跟：比较运算符 | between | in | within
//! ```
//!
//! ## 语法优先级（从高到低）
//!
//! 1. **括号分组** `(expression)`
//! 2. **加减** `baseline_date + 365`
//! 3. **比较 / between / in / within**
//! 4. **AND**
//! 5. **OR**
//!
//! ## 支持的语法结构
//!
//! ```text
//! comparison  := operand OP operand
//! range       := field "between" literal "and" literal
//! membership  := field "in" "(" literal {"," literal} ")"
//! required    := "required" ["unless" rule]
//! conditional := "if" rule "then" rule ["else" rule] "endif"
//! within      := field "within" integer "days" "of" operand
//! funccall    := identifier "(" [arg {"," arg}] ")"
//! ```
//!
//! ## 解析示例
//!
//! ```text
//! age between 18 and 65
//! gender in (Male, Female, Other)
//! required unless status == 'Withdrawn'
//! visit_date within 60 days of baseline_date + 365
//! if pregnant == 'Yes' then sex == 'F' endif
//! ```

use crate::ast::{BinOp, FieldPath, Literal, Node, VisitRef};
use crate::functions;
use crate::lexer::{tokenize, LexError};
use crate::token::{Token, TokenKind};
use crate::value::{ValueKind, DATE_FORMAT};
use chrono::NaiveDate;
use thiserror::Error;

pub struct Parser<'a> {
    tokens: &'a [Token<'a>],
    position: usize,
    /// 输入结束位置，用于"意外结束"错误
    end: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("expected {expected}, found {found} at position {position}")]
pub struct ParseError {
    pub position: usize,
    pub expected: String,
    pub found: String,
}

impl ParseError {
    fn new(position: usize, expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self {
            position,
            expected: expected.into(),
            found: found.into(),
        }
    }
}

impl From<LexError> for ParseError {
    fn from(err: LexError) -> Self {
        Self::new(err.position, "a valid token", err.message)
    }
}

/// 对一条规则文本做词法与语法分析
pub fn parse_rule(text: &str) -> Result<Node, ParseError> {
    let tokens = tokenize(text)?;
    Parser::new(&tokens).with_end(text.len()).parse()
}

impl<'a> Parser<'a> {
    pub fn new(tokens: &'a [Token<'a>]) -> Self {
        let end = tokens.last().map(|t| t.span.end).unwrap_or(0);
        Self {
            tokens,
            position: 0,
            end,
        }
    }

    pub fn with_end(mut self, end: usize) -> Self {
        self.end = end;
        self
    }

    /// 返回当前 token，不推进位置
    fn peek(&self) -> Option<&'a Token<'a>> {
        self.tokens.get(self.position)
    }

    /// 返回下一个 token，不推进位置
    fn peek_next(&self) -> Option<&'a Token<'a>> {
        self.tokens.get(self.position + 1)
    }

    /// 返回当前 token 并推进位置
    fn advance(&mut self) -> Option<&'a Token<'a>> {
        let token = self.tokens.get(self.position)?;
        self.position += 1;
        Some(token)
    }

    /// 当前 token 的起始位置，输入结束时为输入长度
    fn current_position(&self) -> usize {
        self.peek().map(|t| t.span.start).unwrap_or(self.end)
    }

    fn error_here(&self, expected: impl Into<String>) -> ParseError {
        let found = match self.peek() {
            Some(token) => token.kind.describe(),
            None => "end of input".to_string(),
        };
        ParseError::new(self.current_position(), expected, found)
    }

    /// 检查当前 token 是否匹配给定类型
    fn match_token(&self, kind: &TokenKind) -> bool {
        self.peek().is_some_and(|token| {
            std::mem::discriminant(&token.kind) == std::mem::discriminant(kind)
        })
    }

    /// 期望特定类型的 token 并推进，否则返回错误
    fn expect(&mut self, expected: TokenKind) -> Result<&'a Token<'a>, ParseError> {
        if self.match_token(&expected) {
            if let Some(token) = self.advance() {
                return Ok(token);
            }
        }
        Err(self.error_here(expected.describe()))
    }

    /// 要求节点为布尔条件
    fn require_condition(node: Node, position: usize) -> Result<Node, ParseError> {
        if node.is_condition() {
            Ok(node)
        } else {
            Err(ParseError::new(
                position,
                "a condition",
                format!("value expression '{}'", node),
            ))
        }
    }

    /// 要求节点为值表达式
    fn require_value(node: Node, position: usize) -> Result<Node, ParseError> {
        if node.is_condition() {
            Err(ParseError::new(
                position,
                "a value",
                format!("condition '{}'", node),
            ))
        } else {
            Ok(node)
        }
    }

    pub fn parse(&mut self) -> Result<Node, ParseError> {
        let start = self.current_position();
        let node = self.parse_or_expression()?;
        if self.peek().is_some() {
            return Err(self.error_here("end of rule"));
        }
        Self::require_condition(node, start)
    }

    /// 解析OR表达式 (最低优先级)
    ///
    /// 语法: `and_expr (or and_expr)*`
    fn parse_or_expression(&mut self) -> Result<Node, ParseError> {
        let start = self.current_position();
        let mut left = self.parse_and_expression()?;

        while self.match_token(&TokenKind::Or) {
            left = Self::require_condition(left, start)?;
            self.advance(); // 消费 or
            let right_start = self.current_position();
            let right = Self::require_condition(self.parse_and_expression()?, right_start)?;
            left = Node::BinaryOp {
                op: BinOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    /// 解析AND表达式
    ///
    /// 语法: `unary (and unary)*`
    /// 注意 `between` 自己消费其中的 `and`
    fn parse_and_expression(&mut self) -> Result<Node, ParseError> {
        let start = self.current_position();
        let mut left = self.parse_unary_expression()?;

        while self.match_token(&TokenKind::And) {
            left = Self::require_condition(left, start)?;
            self.advance(); // 消费 and
            let right_start = self.current_position();
            let right = Self::require_condition(self.parse_unary_expression()?, right_start)?;
            left = Node::BinaryOp {
                op: BinOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    fn parse_unary_expression(&mut self) -> Result<Node, ParseError> {
        match self.peek().map(|t| &t.kind) {
            Some(TokenKind::Required) => self.parse_required(),
            Some(TokenKind::If) => self.parse_conditional(),
            _ => self.parse_predicate(),
        }
    }

    /// 语法: `required [unless rule]`
    fn parse_required(&mut self) -> Result<Node, ParseError> {
        self.expect(TokenKind::Required)?;
        if !self.match_token(&TokenKind::Unless) {
            return Ok(Node::Required { unless: None });
        }
        self.advance(); // 消费 unless
        let start = self.current_position();
        let unless = Self::require_condition(self.parse_or_expression()?, start)?;
        Ok(Node::Required {
            unless: Some(Box::new(unless)),
        })
    }

    /// 语法: `if rule then rule [else rule] endif`
    fn parse_conditional(&mut self) -> Result<Node, ParseError> {
        self.expect(TokenKind::If)?;

        let start = self.current_position();
        let condition = Self::require_condition(self.parse_or_expression()?, start)?;
        self.expect(TokenKind::Then)?;

        let start = self.current_position();
        let then = Self::require_condition(self.parse_or_expression()?, start)?;

        let otherwise = if self.match_token(&TokenKind::Else) {
            self.advance(); // 消费 else
            let start = self.current_position();
            Some(Box::new(Self::require_condition(
                self.parse_or_expression()?,
                start,
            )?))
        } else {
            None
        };
        self.expect(TokenKind::EndIf)?;

        Ok(Node::Conditional {
            condition: Box::new(condition),
            then: Box::new(then),
            otherwise,
        })
    }

    /// 解析操作数及其后的比较、between、in 或 within
    fn parse_predicate(&mut self) -> Result<Node, ParseError> {
        let start = self.current_position();
        let left = self.parse_additive_expression()?;

        let Some(token) = self.peek() else {
            return Ok(left);
        };

        match &token.kind {
            TokenKind::Eq
            | TokenKind::NotEq
            | TokenKind::Gt
            | TokenKind::Lt
            | TokenKind::Gte
            | TokenKind::Lte => {
                let op = self.parse_comparison_operator()?;
                let left = Self::require_value(left, start)?;
                let right_start = self.current_position();
                let right = Self::require_value(self.parse_additive_expression()?, right_start)?;
                Ok(Node::BinaryOp {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                })
            }
            TokenKind::Between => {
                let field = Self::require_field(left, start, "between")?;
                self.advance(); // 消费 between
                let low = self.parse_literal()?;
                self.expect(TokenKind::And)?;
                let high = self.parse_literal()?;
                Ok(Node::Between { field, low, high })
            }
            TokenKind::In => {
                let field = Self::require_field(left, start, "in")?;
                self.advance(); // 消费 in
                self.expect(TokenKind::LParen)?;

                // 逗号分隔的值列表，至少一个值
                let mut values = vec![self.parse_list_literal()?];
                while self.match_token(&TokenKind::Comma) {
                    self.advance();
                    values.push(self.parse_list_literal()?);
                }
                self.expect(TokenKind::RParen)?;
                Ok(Node::InList { field, values })
            }
            TokenKind::Within => {
                let field = Self::require_field(left, start, "within")?;
                self.advance(); // 消费 within
                let days = self.parse_day_count()?;
                self.expect(TokenKind::Days)?;
                self.expect(TokenKind::Of)?;
                let of_start = self.current_position();
                let of = Self::require_value(self.parse_additive_expression()?, of_start)?;
                Ok(Node::WithinDays {
                    field,
                    days,
                    of: Box::new(of),
                })
            }
            _ => Ok(left),
        }
    }

    fn require_field(node: Node, position: usize, keyword: &str) -> Result<FieldPath, ParseError> {
        match node {
            Node::FieldRef(path) => Ok(path),
            other => Err(ParseError::new(
                position,
                format!("a field name before '{}'", keyword),
                format!("'{}'", other),
            )),
        }
    }

    /// 解析加减表达式
    ///
    /// 语法: `primary (("+" | "-") primary)*`
    fn parse_additive_expression(&mut self) -> Result<Node, ParseError> {
        let start = self.current_position();
        let mut left = self.parse_primary_expression()?;

        loop {
            let op = match self.peek().map(|t| &t.kind) {
                Some(TokenKind::Plus) => BinOp::Add,
                Some(TokenKind::Minus) => BinOp::Sub,
                _ => break,
            };
            left = Self::require_value(left, start)?;
            self.advance(); // 消费 + 或 -
            let right_start = self.current_position();
            let right = Self::require_value(self.parse_primary_expression()?, right_start)?;
            left = Node::BinaryOp {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    /// 解析基础表达式 (最高优先级)
    fn parse_primary_expression(&mut self) -> Result<Node, ParseError> {
        let Some(token) = self.peek() else {
            return Err(self.error_here("a field, literal or function call"));
        };

        match &token.kind {
            TokenKind::LParen => {
                self.advance(); // 消费 (
                let expr = self.parse_or_expression()?;
                self.expect(TokenKind::RParen)?;
                Ok(expr)
            }
            TokenKind::Identifier(name) => {
                if self
                    .peek_next()
                    .is_some_and(|next| next.kind == TokenKind::LParen)
                {
                    self.parse_function_call(name, token.span.start)
                } else {
                    self.advance();
                    Ok(Node::FieldRef(Self::field_path(name, token.span.start)?))
                }
            }
            TokenKind::Minus
            | TokenKind::Integer(_)
            | TokenKind::Decimal(_)
            | TokenKind::String(_)
            | TokenKind::Date(_) => Ok(Node::Literal(self.parse_literal()?)),
            _ => Err(self.error_here("a field, literal or function call")),
        }
    }

    /// 字段名，可带 `previous.` 或 `first.` 访视限定
    fn field_path(name: &str, position: usize) -> Result<FieldPath, ParseError> {
        match name.split_once('.') {
            None => Ok(FieldPath::current(name)),
            Some((qualifier, field)) => {
                let visit = VisitRef::from_qualifier(qualifier).ok_or_else(|| {
                    ParseError::new(
                        position,
                        "visit qualifier 'previous' or 'first'",
                        format!("'{}'", qualifier),
                    )
                })?;
                if field.contains('.') {
                    return Err(ParseError::new(
                        position,
                        "a single visit qualifier",
                        format!("'{}'", name),
                    ));
                }
                Ok(FieldPath {
                    visit,
                    name: field.to_string(),
                })
            }
        }
    }

    /// 解析函数调用，函数名必须在注册表中
    fn parse_function_call(&mut self, name: &str, position: usize) -> Result<Node, ParseError> {
        let signature = functions::lookup(name).ok_or_else(|| {
            ParseError::new(
                position,
                "a registered function",
                format!("unknown function '{}'", name),
            )
        })?;
        self.advance(); // 消费函数名
        self.expect(TokenKind::LParen)?;

        let mut args = Vec::new();
        if !self.match_token(&TokenKind::RParen) {
            loop {
                let arg_start = self.current_position();
                args.push(Self::require_value(
                    self.parse_additive_expression()?,
                    arg_start,
                )?);
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
                self.advance(); // 消费 ,
            }
        }
        self.expect(TokenKind::RParen)?;

        if args.len() != signature.params.len() {
            return Err(ParseError::new(
                position,
                format!(
                    "{} argument(s) for {}()",
                    signature.params.len(),
                    signature.name
                ),
                format!("{} argument(s)", args.len()),
            ));
        }
        for (param, arg) in signature.params.iter().zip(&args) {
            if let Node::Literal(literal) = arg {
                if *param != ValueKind::Any && literal.kind() != *param {
                    return Err(ParseError::new(
                        position,
                        format!("{} argument for {}()", param, signature.name),
                        format!("{} literal {}", literal.kind(), literal),
                    ));
                }
            }
        }

        Ok(Node::FunctionCall {
            function: signature.function,
            args,
        })
    }

    fn parse_comparison_operator(&mut self) -> Result<BinOp, ParseError> {
        let op = match self.peek().map(|t| &t.kind) {
            Some(TokenKind::Eq) => BinOp::Eq,
            Some(TokenKind::NotEq) => BinOp::NotEq,
            Some(TokenKind::Gt) => BinOp::Gt,
            Some(TokenKind::Lt) => BinOp::Lt,
            Some(TokenKind::Gte) => BinOp::Gte,
            Some(TokenKind::Lte) => BinOp::Lte,
            _ => return Err(self.error_here("comparison operator")),
        };
        self.advance();
        Ok(op)
    }

    /// `within` 后的天数：非负整数
    fn parse_day_count(&mut self) -> Result<i64, ParseError> {
        match self.peek().map(|t| &t.kind) {
            Some(TokenKind::Integer(n)) => {
                let n = *n;
                self.advance();
                Ok(n)
            }
            _ => Err(self.error_here("a whole number of days")),
        }
    }

    fn parse_literal(&mut self) -> Result<Literal, ParseError> {
        let negative = self.match_token(&TokenKind::Minus);
        if negative {
            self.advance(); // 消费 -
        }

        let Some(token) = self.peek() else {
            return Err(self.error_here("literal value"));
        };
        let literal = match (&token.kind, negative) {
            (TokenKind::Integer(n), _) => Literal::Integer(if negative { -n } else { *n }),
            (TokenKind::Decimal(n), _) => Literal::Decimal(if negative { -n } else { *n }),
            (TokenKind::String(s), false) => Literal::String(s.to_string()),
            (TokenKind::Date(d), false) => {
                let date = NaiveDate::parse_from_str(d, DATE_FORMAT).map_err(|_| {
                    ParseError::new(
                        token.span.start,
                        "a valid YYYY-MM-DD date",
                        format!("'{}'", d),
                    )
                })?;
                Literal::Date(date)
            }
            (_, true) => return Err(self.error_here("number after '-'")),
            _ => return Err(self.error_here("literal value")),
        };
        self.advance();
        Ok(literal)
    }

    /// 成员列表中的值：字面量或不带引号的标识符（视为字符串）
    fn parse_list_literal(&mut self) -> Result<Literal, ParseError> {
        if let Some(Token {
            kind: TokenKind::Identifier(name),
            ..
        }) = self.peek()
        {
            self.advance();
            return Ok(Literal::String(name.to_string()));
        }
        self.parse_literal()
    }
}

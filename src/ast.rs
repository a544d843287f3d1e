//! 规则语言的抽象语法树
//!
//! 节点类型是封闭的枚举，构造之后不可变。闭包生成器和 SQL 生成器都对
//! [`Node`] 做穷尽匹配，新增变体时两个后端必须同时更新才能编译通过。

use crate::functions::ClinicalFunction;
use crate::value::{FieldValue, ValueKind, DATE_FORMAT};
use chrono::NaiveDate;
use std::fmt;

/// AST 节点, 代表一条规则或其中的子表达式
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// 字面量
    Literal(Literal),
    /// 字段引用，可带访视限定
    FieldRef(FieldPath),
    /// 比较、逻辑或算术二元运算
    BinaryOp {
        op: BinOp,
        left: Box<Node>,
        right: Box<Node>,
    },
    /// `field between low and high`，闭区间
    Between {
        field: FieldPath,
        low: Literal,
        high: Literal,
    },
    /// `field in (v1, v2, ...)`
    InList { field: FieldPath, values: Vec<Literal> },
    /// `required [unless rule]`，作用于规则所属字段
    Required { unless: Option<Box<Node>> },
    /// `if cond then rule [else rule] endif`
    Conditional {
        condition: Box<Node>,
        then: Box<Node>,
        otherwise: Option<Box<Node>>,
    },
    /// 注册表中的函数调用，名称在解析时已解析
    FunctionCall {
        function: ClinicalFunction,
        args: Vec<Node>,
    },
    /// `field within n days of target`
    WithinDays {
        field: FieldPath,
        days: i64,
        of: Box<Node>,
    },
}

/// 二元运算符
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Eq,    // ==
    NotEq, // !=
    Gt,    // >
    Lt,    // <
    Gte,   // >=
    Lte,   // <=
    And,   // and
    Or,    // or
    Add,   // +
    Sub,   // -
}

impl BinOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::NotEq | BinOp::Gt | BinOp::Lt | BinOp::Gte | BinOp::Lte
        )
    }

    pub fn is_logical(self) -> bool {
        matches!(self, BinOp::And | BinOp::Or)
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Eq => "==",
            BinOp::NotEq => "!=",
            BinOp::Gt => ">",
            BinOp::Lt => "<",
            BinOp::Gte => ">=",
            BinOp::Lte => "<=",
            BinOp::And => "and",
            BinOp::Or => "or",
            BinOp::Add => "+",
            BinOp::Sub => "-",
        }
    }

    /// 比较运算符的逻辑否定，例如 `<` 的否定是 `>=`
    pub fn negated(self) -> Option<BinOp> {
        match self {
            BinOp::Eq => Some(BinOp::NotEq),
            BinOp::NotEq => Some(BinOp::Eq),
            BinOp::Gt => Some(BinOp::Lte),
            BinOp::Lt => Some(BinOp::Gte),
            BinOp::Gte => Some(BinOp::Lt),
            BinOp::Lte => Some(BinOp::Gt),
            BinOp::And | BinOp::Or | BinOp::Add | BinOp::Sub => None,
        }
    }

    /// 打印时使用的优先级，数值越大结合越紧
    fn precedence(self) -> u8 {
        match self {
            BinOp::Or => 1,
            BinOp::And => 2,
            BinOp::Eq | BinOp::NotEq | BinOp::Gt | BinOp::Lt | BinOp::Gte | BinOp::Lte => 3,
            BinOp::Add | BinOp::Sub => 4,
        }
    }
}

/// 字面量值
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Integer(i64),
    Decimal(f64),
    String(String),
    Date(NaiveDate),
}

impl Literal {
    pub fn to_value(&self) -> FieldValue {
        match self {
            Literal::Integer(n) => FieldValue::Number(*n as f64),
            Literal::Decimal(n) => FieldValue::Number(*n),
            Literal::String(s) => FieldValue::Text(s.clone()),
            Literal::Date(d) => FieldValue::Date(*d),
        }
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Literal::Integer(_) | Literal::Decimal(_) => ValueKind::Number,
            Literal::String(_) => ValueKind::Text,
            Literal::Date(_) => ValueKind::Date,
        }
    }
}

/// 字段所在的访视
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum VisitRef {
    /// 当前记录
    Current,
    /// 同一受试者的上一次访视
    Previous,
    /// 同一受试者的首次访视
    First,
}

impl VisitRef {
    pub fn from_qualifier(qualifier: &str) -> Option<Self> {
        match qualifier.to_ascii_lowercase().as_str() {
            "previous" => Some(VisitRef::Previous),
            "first" => Some(VisitRef::First),
            _ => None,
        }
    }

    pub fn qualifier(self) -> Option<&'static str> {
        match self {
            VisitRef::Current => None,
            VisitRef::Previous => Some("previous"),
            VisitRef::First => Some("first"),
        }
    }
}

/// 字段路径, 例如 `weight` 或 `previous.weight`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath {
    pub visit: VisitRef,
    pub name: String,
}

impl FieldPath {
    pub fn current(name: impl Into<String>) -> Self {
        Self {
            visit: VisitRef::Current,
            name: name.into(),
        }
    }

    /// 实时校验时在记录上下文中查找所用的键
    pub fn context_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.visit.qualifier() {
            Some(qualifier) => write!(f, "{}.{}", qualifier, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

impl Node {
    /// 是否为布尔条件（可以作为规则根节点或 and/or 的操作数）
    pub fn is_condition(&self) -> bool {
        match self {
            Node::BinaryOp { op, .. } => op.is_comparison() || op.is_logical(),
            Node::Between { .. }
            | Node::InList { .. }
            | Node::Required { .. }
            | Node::Conditional { .. }
            | Node::WithinDays { .. } => true,
            Node::Literal(_) | Node::FieldRef(_) | Node::FunctionCall { .. } => false,
        }
    }

    /// 值表达式的静态类型，字段引用为 `Any`
    pub fn static_kind(&self) -> ValueKind {
        match self {
            Node::Literal(literal) => literal.kind(),
            Node::FieldRef(_) => ValueKind::Any,
            Node::FunctionCall { function, .. } => function.returns(),
            Node::BinaryOp { op, left, right } => match op {
                BinOp::Add => match (left.static_kind(), right.static_kind()) {
                    (ValueKind::Date, _) | (_, ValueKind::Date) => ValueKind::Date,
                    (ValueKind::Number, ValueKind::Number) => ValueKind::Number,
                    _ => ValueKind::Any,
                },
                BinOp::Sub => match (left.static_kind(), right.static_kind()) {
                    (ValueKind::Date, ValueKind::Date) => ValueKind::Number,
                    (ValueKind::Date, _) => ValueKind::Date,
                    (ValueKind::Number, ValueKind::Number) => ValueKind::Number,
                    _ => ValueKind::Any,
                },
                _ => ValueKind::Any,
            },
            Node::Between { .. }
            | Node::InList { .. }
            | Node::Required { .. }
            | Node::Conditional { .. }
            | Node::WithinDays { .. } => ValueKind::Any,
        }
    }

    /// 收集节点中引用的所有字段（按出现顺序，可能重复）
    pub fn field_refs(&self) -> Vec<&FieldPath> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a FieldPath>) {
        match self {
            Node::Literal(_) => {}
            Node::FieldRef(path) => out.push(path),
            Node::BinaryOp { left, right, .. } => {
                left.collect_fields(out);
                right.collect_fields(out);
            }
            Node::Between { field, .. } | Node::InList { field, .. } => out.push(field),
            Node::Required { unless } => {
                if let Some(unless) = unless {
                    unless.collect_fields(out);
                }
            }
            Node::Conditional {
                condition,
                then,
                otherwise,
            } => {
                condition.collect_fields(out);
                then.collect_fields(out);
                if let Some(otherwise) = otherwise {
                    otherwise.collect_fields(out);
                }
            }
            Node::FunctionCall { args, .. } => {
                for arg in args {
                    arg.collect_fields(out);
                }
            }
            Node::WithinDays { field, of, .. } => {
                out.push(field);
                of.collect_fields(out);
            }
        }
    }

    /// 面向用户的违规说明，`subject` 为规则所属字段
    pub fn describe(&self, subject: &str) -> String {
        match self {
            Node::Between { field, low, high } => {
                format!("{} must be between {} and {}", field, low, high)
            }
            Node::InList { field, values } => {
                let values: Vec<String> = values.iter().map(ToString::to_string).collect();
                format!("{} must be one of {}", field, values.join(", "))
            }
            Node::Required { unless: None } => format!("{} is required", subject),
            Node::Required {
                unless: Some(unless),
            } => format!("{} is required unless {}", subject, unless),
            Node::WithinDays { field, days, of } => {
                format!("{} must be within {} days of {}", field, days, of)
            }
            other => format!("{} must satisfy: {}", subject, other),
        }
    }

    fn precedence(&self) -> u8 {
        match self {
            Node::BinaryOp { op, .. } => op.precedence(),
            Node::Between { .. } | Node::InList { .. } | Node::WithinDays { .. } => 3,
            // 带 unless 的 required 会吞掉后续的 and/or
            Node::Required { unless: Some(_) } => 0,
            Node::Literal(_)
            | Node::FieldRef(_)
            | Node::Required { unless: None }
            | Node::Conditional { .. }
            | Node::FunctionCall { .. } => 5,
        }
    }

    fn fmt_operand(&self, f: &mut fmt::Formatter<'_>, min_precedence: u8) -> fmt::Result {
        if self.precedence() < min_precedence {
            write!(f, "({})", self)
        } else {
            write!(f, "{}", self)
        }
    }
}

/// 以规范的规则文本形式输出，可被重新解析为相同的 AST
impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Literal(literal) => write!(f, "{}", literal),
            Node::FieldRef(path) => write!(f, "{}", path),
            Node::BinaryOp { op, left, right } => {
                let precedence = op.precedence();
                left.fmt_operand(f, precedence)?;
                write!(f, " {} ", op.symbol())?;
                // 右操作数同级时加括号，保持左结合
                right.fmt_operand(f, precedence + 1)
            }
            Node::Between { field, low, high } => {
                write!(f, "{} between {} and {}", field, low, high)
            }
            Node::InList { field, values } => {
                let values: Vec<String> = values.iter().map(ToString::to_string).collect();
                write!(f, "{} in ({})", field, values.join(", "))
            }
            Node::Required { unless: None } => write!(f, "required"),
            Node::Required {
                unless: Some(unless),
            } => write!(f, "required unless {}", unless),
            Node::Conditional {
                condition,
                then,
                otherwise,
            } => {
                write!(f, "if {} then {}", condition, then)?;
                if let Some(otherwise) = otherwise {
                    write!(f, " else {}", otherwise)?;
                }
                write!(f, " endif")
            }
            Node::FunctionCall { function, args } => {
                let args: Vec<String> = args.iter().map(ToString::to_string).collect();
                write!(f, "{}({})", function, args.join(", "))
            }
            Node::WithinDays { field, days, of } => {
                write!(f, "{} within {} days of {}", field, days, of)
            }
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Integer(n) => write!(f, "{}", n),
            // `{:?}` 保留小数点，避免重新解析为整数
            Literal::Decimal(n) => write!(f, "{:?}", n),
            Literal::String(s) if s.contains('\'') => write!(f, "\"{}\"", s),
            Literal::String(s) => write!(f, "'{}'", s),
            Literal::Date(d) => write!(f, "{}", d.format(DATE_FORMAT)),
        }
    }
}

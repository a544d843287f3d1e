//! Clinical function registry.
//!
//! The closed set of functions a rule may call. The parser resolves every
//! call against this table, so an unknown name or a wrong argument count is
//! a parse error and never reaches code generation. Adding a function means
//! adding a [`ClinicalFunction`] variant and a [`FunctionSignature`] row; the
//! closure and SQL generators match on the variant exhaustively and will not
//! build until they handle it.
//!
//! Comparison, range (`between`), membership (`in`) and date window
//! (`within`) primitives are not listed here: they have dedicated AST
//! variants.

use crate::value::ValueKind;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClinicalFunction {
    /// `length(field)`: number of characters in the textual value.
    Length,
    /// `today()`: the current date.
    Today,
    /// `add_days(date, n)`: date shifted by `n` days.
    AddDays,
}

#[derive(Debug)]
pub struct FunctionSignature {
    pub function: ClinicalFunction,
    pub name: &'static str,
    pub params: &'static [ValueKind],
    pub returns: ValueKind,
    pub summary: &'static str,
}

static REGISTRY: &[FunctionSignature] = &[
    FunctionSignature {
        function: ClinicalFunction::Length,
        name: "length",
        params: &[ValueKind::Any],
        returns: ValueKind::Number,
        summary: "number of characters in a value",
    },
    FunctionSignature {
        function: ClinicalFunction::Today,
        name: "today",
        params: &[],
        returns: ValueKind::Date,
        summary: "current date",
    },
    FunctionSignature {
        function: ClinicalFunction::AddDays,
        name: "add_days",
        params: &[ValueKind::Date, ValueKind::Number],
        returns: ValueKind::Date,
        summary: "date shifted by a number of days",
    },
];

/// Resolve a function name (case-insensitive).
pub fn lookup(name: &str) -> Option<&'static FunctionSignature> {
    REGISTRY
        .iter()
        .find(|signature| signature.name.eq_ignore_ascii_case(name))
}

/// Every registered function, in declaration order.
pub fn signatures() -> &'static [FunctionSignature] {
    REGISTRY
}

impl ClinicalFunction {
    pub fn signature(self) -> &'static FunctionSignature {
        // Each variant has exactly one row; the tests below pin this.
        REGISTRY
            .iter()
            .find(|signature| signature.function == self)
            .unwrap_or(&REGISTRY[0])
    }

    pub fn name(self) -> &'static str {
        self.signature().name
    }

    pub fn arity(self) -> usize {
        self.signature().params.len()
    }

    pub fn returns(self) -> ValueKind {
        self.signature().returns
    }
}

impl fmt::Display for ClinicalFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_is_case_insensitive() {
        assert_eq!(lookup("LENGTH").unwrap().function, ClinicalFunction::Length);
        assert_eq!(lookup("Add_Days").unwrap().function, ClinicalFunction::AddDays);
        assert!(lookup("eval").is_none());
        assert!(lookup("system").is_none());
    }

    #[test]
    fn test_every_variant_has_its_own_row() {
        for function in [
            ClinicalFunction::Length,
            ClinicalFunction::Today,
            ClinicalFunction::AddDays,
        ] {
            assert_eq!(function.signature().function, function);
        }
        assert_eq!(signatures().len(), 3);
    }

    #[test]
    fn test_arity() {
        assert_eq!(ClinicalFunction::Length.arity(), 1);
        assert_eq!(ClinicalFunction::Today.arity(), 0);
        assert_eq!(ClinicalFunction::AddDays.arity(), 2);
        assert_eq!(ClinicalFunction::AddDays.returns(), ValueKind::Date);
    }
}

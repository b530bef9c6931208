use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// `namespace::name` plus an optional overload, e.g. `aten::add.Tensor`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperatorName {
    pub name: String,
    pub overload_name: String,
}

impl OperatorName {
    pub fn new(
        name: impl Into<String>,
        overload_name: impl Into<String>,
    ) -> Result<Self, SchemaError> {
        let name = name.into();
        let overload_name = overload_name.into();
        validate_qualified_name(&name)?;
        if !overload_name.is_empty() && !is_identifier(&overload_name) {
            return Err(SchemaError::InvalidName {
                input: format!("{name}.{overload_name}"),
                reason: "overload name must be an identifier",
            });
        }
        Ok(Self {
            name,
            overload_name,
        })
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        self.name
            .split_once("::")
            .map_or("", |(namespace, _)| namespace)
    }

    #[must_use]
    pub fn base_name(&self) -> &str {
        self.name
            .split_once("::")
            .map_or(self.name.as_str(), |(_, base)| base)
    }
}

impl fmt::Display for OperatorName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.overload_name.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}.{}", self.name, self.overload_name)
        }
    }
}

impl FromStr for OperatorName {
    type Err = SchemaError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(SchemaError::EmptyName);
        }
        match trimmed.split_once('.') {
            Some((name, overload)) => Self::new(name, overload),
            None => Self::new(trimmed, ""),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Argument {
    pub name: String,
    pub type_name: String,
    pub default_value: Option<String>,
    pub kwarg_only: bool,
}

impl fmt::Display for Argument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.type_name)?;
        if !self.name.is_empty() {
            write!(f, " {}", self.name)?;
        }
        if let Some(default_value) = &self.default_value {
            write!(f, "={default_value}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionSchema {
    pub name: OperatorName,
    pub arguments: Vec<Argument>,
    pub returns: Vec<Argument>,
}

impl FunctionSchema {
    #[must_use]
    pub fn operator_name(&self) -> &OperatorName {
        &self.name
    }

    /// Number of leading arguments that may be passed positionally.
    #[must_use]
    pub fn positional_arity(&self) -> usize {
        self.arguments
            .iter()
            .take_while(|argument| !argument.kwarg_only)
            .count()
    }
}

impl fmt::Display for FunctionSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        let mut saw_kwarg_marker = false;
        for (idx, argument) in self.arguments.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            if argument.kwarg_only && !saw_kwarg_marker {
                f.write_str("*, ")?;
                saw_kwarg_marker = true;
            }
            write!(f, "{argument}")?;
        }
        f.write_str(") -> ")?;
        match self.returns.as_slice() {
            [single] if single.name.is_empty() => write!(f, "{single}"),
            returns => {
                f.write_str("(")?;
                for (idx, ret) in returns.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{ret}")?;
                }
                f.write_str(")")
            }
        }
    }
}

impl FromStr for FunctionSchema {
    type Err = SchemaError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        parse_function_schema(raw)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedSchemaInput {
    Name(OperatorName),
    Schema(FunctionSchema),
}

impl ParsedSchemaInput {
    #[must_use]
    pub fn operator_name(&self) -> &OperatorName {
        match self {
            Self::Name(name) => name,
            Self::Schema(schema) => &schema.name,
        }
    }
}

/// Accepts a bare `ns::op.overload` or a full schema string.
pub fn parse_schema_or_name(raw: &str) -> Result<ParsedSchemaInput, SchemaError> {
    if raw.contains('(') {
        parse_function_schema(raw).map(ParsedSchemaInput::Schema)
    } else {
        raw.parse().map(ParsedSchemaInput::Name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    EmptyName,
    InvalidName {
        input: String,
        reason: &'static str,
    },
    UnbalancedDelimiters {
        input: String,
    },
    MissingReturnArrow {
        input: String,
    },
    InvalidArgument {
        input: String,
        reason: &'static str,
    },
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyName => write!(f, "operator name is empty"),
            Self::InvalidName { input, reason } => {
                write!(f, "invalid operator name '{input}': {reason}")
            }
            Self::UnbalancedDelimiters { input } => {
                write!(f, "unbalanced delimiters in schema '{input}'")
            }
            Self::MissingReturnArrow { input } => {
                write!(f, "schema '{input}' has no '->' return clause")
            }
            Self::InvalidArgument { input, reason } => {
                write!(f, "invalid schema argument '{input}': {reason}")
            }
        }
    }
}

impl std::error::Error for SchemaError {}

fn is_identifier(raw: &str) -> bool {
    let mut chars = raw.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

fn validate_qualified_name(name: &str) -> Result<(), SchemaError> {
    if name.is_empty() {
        return Err(SchemaError::EmptyName);
    }
    let Some((namespace, base)) = name.split_once("::") else {
        return Err(SchemaError::InvalidName {
            input: name.to_string(),
            reason: "expected 'namespace::name'",
        });
    };
    if !is_identifier(namespace) || !is_identifier(base) {
        return Err(SchemaError::InvalidName {
            input: name.to_string(),
            reason: "namespace and name must be identifiers",
        });
    }
    Ok(())
}

/// Byte index of the `)` matching the `(` at `open`.
fn matching_paren(raw: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (idx, c) in raw.char_indices().skip_while(|(idx, _)| *idx < open) {
        match c {
            '(' => depth += 1,
            ')' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(idx);
                }
            }
            _ => {}
        }
    }
    None
}

/// Splits on `sep` outside of any `()` or `[]` nesting.
fn split_top_level(raw: &str, sep: char) -> Result<Vec<&str>, SchemaError> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (idx, c) in raw.char_indices() {
        match c {
            '(' | '[' => depth += 1,
            ')' | ']' => {
                depth -= 1;
                if depth < 0 {
                    return Err(SchemaError::UnbalancedDelimiters {
                        input: raw.to_string(),
                    });
                }
            }
            c if c == sep && depth == 0 => {
                parts.push(&raw[start..idx]);
                start = idx + c.len_utf8();
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(SchemaError::UnbalancedDelimiters {
            input: raw.to_string(),
        });
    }
    parts.push(&raw[start..]);
    Ok(parts)
}

/// Position of the last whitespace outside any nesting, separating a type
/// from an argument name.
fn last_top_level_space(raw: &str) -> Option<usize> {
    let mut depth = 0i32;
    let mut found = None;
    for (idx, c) in raw.char_indices() {
        match c {
            '(' | '[' => depth += 1,
            ')' | ']' => depth -= 1,
            c if c.is_whitespace() && depth == 0 => found = Some(idx),
            _ => {}
        }
    }
    found
}

fn parse_argument(raw: &str, kwarg_only: bool) -> Result<Argument, SchemaError> {
    let trimmed = raw.trim();
    let (decl, default_value) = match split_top_level(trimmed, '=')?.as_slice() {
        [decl] => (*decl, None),
        [decl, default] => (*decl, Some(default.trim().to_string())),
        _ => {
            return Err(SchemaError::InvalidArgument {
                input: trimmed.to_string(),
                reason: "more than one default value",
            });
        }
    };
    let decl = decl.trim();
    let Some(split) = last_top_level_space(decl) else {
        return Err(SchemaError::InvalidArgument {
            input: trimmed.to_string(),
            reason: "expected 'Type name'",
        });
    };
    let type_name = decl[..split].trim();
    let name = decl[split..].trim();
    if type_name.is_empty() || !is_identifier(name) {
        return Err(SchemaError::InvalidArgument {
            input: trimmed.to_string(),
            reason: "expected 'Type name'",
        });
    }
    if default_value.as_deref() == Some("") {
        return Err(SchemaError::InvalidArgument {
            input: trimmed.to_string(),
            reason: "empty default value",
        });
    }
    Ok(Argument {
        name: name.to_string(),
        type_name: type_name.to_string(),
        default_value,
        kwarg_only,
    })
}

fn parse_return(raw: &str) -> Result<Argument, SchemaError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(SchemaError::InvalidArgument {
            input: raw.to_string(),
            reason: "empty return type",
        });
    }
    let (type_name, name) = match last_top_level_space(trimmed) {
        Some(split) => (trimmed[..split].trim(), trimmed[split..].trim()),
        None => (trimmed, ""),
    };
    if !name.is_empty() && !is_identifier(name) {
        return Err(SchemaError::InvalidArgument {
            input: trimmed.to_string(),
            reason: "return name must be an identifier",
        });
    }
    Ok(Argument {
        name: name.to_string(),
        type_name: type_name.to_string(),
        default_value: None,
        kwarg_only: false,
    })
}

fn parse_function_schema(raw: &str) -> Result<FunctionSchema, SchemaError> {
    let trimmed = raw.trim();
    let Some(open) = trimmed.find('(') else {
        return Err(SchemaError::InvalidArgument {
            input: trimmed.to_string(),
            reason: "schema has no argument list",
        });
    };
    let name: OperatorName = trimmed[..open].parse()?;
    let close = matching_paren(trimmed, open).ok_or_else(|| SchemaError::UnbalancedDelimiters {
        input: trimmed.to_string(),
    })?;

    let mut arguments = Vec::new();
    let body = trimmed[open + 1..close].trim();
    if !body.is_empty() {
        let mut kwarg_only = false;
        for part in split_top_level(body, ',')? {
            if part.trim() == "*" {
                kwarg_only = true;
                continue;
            }
            arguments.push(parse_argument(part, kwarg_only)?);
        }
    }

    let Some(tail) = trimmed[close + 1..].trim().strip_prefix("->") else {
        return Err(SchemaError::MissingReturnArrow {
            input: trimmed.to_string(),
        });
    };
    let tail = tail.trim();
    let returns = if tail.starts_with('(') {
        let end = matching_paren(tail, 0).ok_or_else(|| SchemaError::UnbalancedDelimiters {
            input: trimmed.to_string(),
        })?;
        if end + 1 != tail.len() {
            return Err(SchemaError::InvalidArgument {
                input: tail.to_string(),
                reason: "trailing text after return list",
            });
        }
        let inner = tail[1..end].trim();
        if inner.is_empty() {
            Vec::new()
        } else {
            split_top_level(inner, ',')?
                .into_iter()
                .map(parse_return)
                .collect::<Result<Vec<_>, _>>()?
        }
    } else {
        vec![parse_return(tail)?]
    };

    Ok(FunctionSchema {
        name,
        arguments,
        returns,
    })
}

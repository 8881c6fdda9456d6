//! Parameter template grammar.
//!
//! A template is a line-oriented text file describing one simulator
//! parameter per line.  Two shapes are accepted:
//!
//! ```text
//! PLUME_HEIGHT 15000.0
//! ERUPTION_MASS {mastin_mass} [|PLUME_HEIGHT|, 2700, 1000, -5, 5, 0, 1.5, 10]
//! ```
//!
//! The first fixes a value; the second draws it from a named sampling
//! function.  Bracketed arguments are numeric literals or `|NAME|`
//! back-references to another parameter's realized value in the same run.
//! Lines starting with `#` and blank lines are ignored.
//!
//! Parsing is purely syntactic; function names are resolved against the
//! registry and values are realized later, in [`crate::sample`].
use crate::errors::BatchError;
use std::path::Path;

/// One argument to a sampling function.
#[derive(Debug, Clone, PartialEq)]
pub enum Argument {
    /// A numeric literal.
    Literal(f64),
    /// A `|NAME|` back-reference to an earlier parameter's realized value.
    Reference(String),
}

/// Parsed right-hand side of a template line.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterSpec {
    /// `NAME value` — the parameter is constant across runs.
    Fixed(f64),
    /// `NAME {function} [args]` — the parameter is drawn per run.
    Sampled {
        /// Registry name of the sampling function.
        function: String,
        /// Positional arguments, literals or back-references.
        args: Vec<Argument>,
    },
}

/// An ordered, immutable table of parameter specs for one phase type.
///
/// Declaration order is preserved: it defines the run-table column order and
/// the evaluation order for back-references.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterTable {
    params: Vec<(String, ParameterSpec)>,
}

impl ParameterTable {
    /// Read and parse a template file.
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self, BatchError> {
        let text = std::fs::read_to_string(path)?;
        ParameterTable::parse(&text)
    }

    /// Parse template text into a table.
    ///
    /// Fails on the first malformed line, on duplicate parameter names, and
    /// on back-references that do not name an earlier declaration (forward
    /// and self references are configuration errors, not deferred lookups).
    pub fn parse(text: &str) -> Result<Self, BatchError> {
        let mut params: Vec<(String, ParameterSpec)> = Vec::new();
        for (i, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (name, spec) = parse_line(line).ok_or_else(|| BatchError::Grammar {
                line: i + 1,
                text: line.to_string(),
            })?;
            if params.iter().any(|(n, _)| n == &name) {
                return Err(BatchError::DuplicateParameter(name));
            }
            if let ParameterSpec::Sampled { ref args, .. } = spec {
                for arg in args {
                    if let Argument::Reference(dep) = arg {
                        if !params.iter().any(|(n, _)| n == dep) {
                            return Err(BatchError::BadReference {
                                parameter: name,
                                reference: dep.clone(),
                            });
                        }
                    }
                }
            }
            params.push((name, spec));
        }
        log::debug!("Parsed parameter table with {} entries.", params.len());
        Ok(ParameterTable { params })
    }

    /// Parameter names in declaration order.
    pub fn names(&self) -> Vec<String> {
        self.params.iter().map(|(n, _)| n.clone()).collect()
    }

    /// Look up a spec by name.
    pub fn get(&self, name: &str) -> Option<&ParameterSpec> {
        self.params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, spec)| spec)
    }

    /// Iterate over `(name, spec)` pairs in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &(String, ParameterSpec)> {
        self.params.iter()
    }

    /// Number of parameters in the table.
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// True when the table holds no parameters.
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

/// Parse one non-blank, non-comment line.  Returns `None` when the line
/// matches neither grammar shape.
fn parse_line(line: &str) -> Option<(String, ParameterSpec)> {
    let mut rest = line;
    let name = take_name(&mut rest)?;
    let rest = rest.trim_start();
    if rest.is_empty() {
        return None;
    }
    if rest.starts_with('{') {
        let (function, after) = take_function(rest)?;
        let args = take_args(after.trim_start())?;
        Some((name, ParameterSpec::Sampled { function, args }))
    } else {
        let value = parse_float(rest)?;
        Some((name, ParameterSpec::Fixed(value)))
    }
}

/// Consume a leading `[A-Z_]+` token, leaving the remainder in `rest`.
fn take_name(rest: &mut &str) -> Option<String> {
    let end = rest
        .find(|c: char| !(c.is_ascii_uppercase() || c == '_'))
        .unwrap_or_else(|| rest.len());
    if end == 0 {
        return None;
    }
    let name = rest[..end].to_string();
    // The name must be followed by whitespace, not an arbitrary character.
    if !rest[end..].starts_with(char::is_whitespace) {
        return None;
    }
    *rest = &rest[end..];
    Some(name)
}

/// Consume `{ident}` and return the identifier plus the remainder.
fn take_function(rest: &str) -> Option<(String, &str)> {
    let inner = rest.strip_prefix('{')?;
    let close = inner.find('}')?;
    let ident = &inner[..close];
    if ident.is_empty()
        || !ident
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return None;
    }
    Some((ident.to_string(), &inner[close + 1..]))
}

/// Consume `[arg, arg, ...]`, which must end the line.
fn take_args(rest: &str) -> Option<Vec<Argument>> {
    let inner = rest.strip_prefix('[')?;
    let close = inner.find(']')?;
    if !inner[close + 1..].trim().is_empty() {
        return None;
    }
    let body = inner[..close].trim();
    let mut args = Vec::new();
    if body.is_empty() {
        return Some(args);
    }
    for piece in body.split(',') {
        let piece = piece.trim();
        if let Some(name) = reference_name(piece) {
            args.push(Argument::Reference(name));
        } else {
            args.push(Argument::Literal(parse_float(piece)?));
        }
    }
    Some(args)
}

/// Parse a `|NAME|` back-reference token.
fn reference_name(token: &str) -> Option<String> {
    let inner = token.strip_prefix('|')?.strip_suffix('|')?;
    if inner.is_empty()
        || !inner
            .chars()
            .all(|c| c.is_ascii_uppercase() || c == '_')
    {
        return None;
    }
    Some(inner.to_string())
}

/// Parse a signed float with optional fraction and exponent; the token must
/// cover the whole input.
fn parse_float(token: &str) -> Option<f64> {
    let token = token.trim();
    // f64::from_str accepts "inf", "NaN" and hex-ish forms the grammar does
    // not; restrict to digits, sign, decimal point and exponent.
    if token.is_empty()
        || !token
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | 'e' | 'E'))
    {
        return None;
    }
    token.parse::<f64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_values_parse() {
        let table = ParameterTable::parse(
            "PLUME_HEIGHT 15000.0\nALPHA 2.4\nBETA -1.2e-3\nGAMMA 5\n",
        )
        .unwrap();
        assert_eq!(table.len(), 4);
        assert_eq!(
            table.get("PLUME_HEIGHT"),
            Some(&ParameterSpec::Fixed(15000.0))
        );
        assert_eq!(table.get("BETA"), Some(&ParameterSpec::Fixed(-1.2e-3)));
    }

    #[test]
    fn sampled_values_parse() {
        let table =
            ParameterTable::parse("PLUME_HEIGHT {unif} [10000, 25000]\n").unwrap();
        assert_eq!(
            table.get("PLUME_HEIGHT"),
            Some(&ParameterSpec::Sampled {
                function: "unif".to_string(),
                args: vec![Argument::Literal(10000.0), Argument::Literal(25000.0)],
            })
        );
    }

    #[test]
    fn references_parse() {
        let table = ParameterTable::parse(
            "PLUME_HEIGHT {unif} [10000, 25000]\n\
             ERUPTION_MASS {mastin_mass} [|PLUME_HEIGHT|, 2700, 1000, -5, 5, 0, 1.5, 10]\n",
        )
        .unwrap();
        match table.get("ERUPTION_MASS").unwrap() {
            ParameterSpec::Sampled { function, args } => {
                assert_eq!(function, "mastin_mass");
                assert_eq!(args[0], Argument::Reference("PLUME_HEIGHT".to_string()));
                assert_eq!(args[1], Argument::Literal(2700.0));
            }
            other => panic!("expected sampled spec, got {:?}", other),
        }
    }

    #[test]
    fn comments_and_blanks_skip() {
        let table =
            ParameterTable::parse("# plume geometry\n\nPLUME_HEIGHT 100.0\n").unwrap();
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn malformed_line_is_fatal() {
        let err = ParameterTable::parse("PLUME_HEIGHT\n").unwrap_err();
        match err {
            BatchError::Grammar { line, .. } => assert_eq!(line, 1),
            other => panic!("expected grammar error, got {:?}", other),
        }
        assert!(ParameterTable::parse("plume_height 100.0\n").is_err());
        assert!(ParameterTable::parse("PLUME_HEIGHT {unif} [1, 2] junk\n").is_err());
        assert!(ParameterTable::parse("PLUME_HEIGHT one_hundred\n").is_err());
    }

    #[test]
    fn forward_reference_is_fatal() {
        let err = ParameterTable::parse(
            "ERUPTION_MASS {mastin_mass} [|PLUME_HEIGHT|, 2700, 1000, -5, 5, 0, 1.5, 10]\n\
             PLUME_HEIGHT {unif} [10000, 25000]\n",
        )
        .unwrap_err();
        match err {
            BatchError::BadReference { parameter, reference } => {
                assert_eq!(parameter, "ERUPTION_MASS");
                assert_eq!(reference, "PLUME_HEIGHT");
            }
            other => panic!("expected reference error, got {:?}", other),
        }
    }

    #[test]
    fn self_reference_is_fatal() {
        assert!(ParameterTable::parse("ALPHA {unif} [|ALPHA|, 2]\n").is_err());
    }

    #[test]
    fn duplicate_name_is_fatal() {
        let err = ParameterTable::parse("ALPHA 1.0\nALPHA 2.0\n").unwrap_err();
        match err {
            BatchError::DuplicateParameter(name) => assert_eq!(name, "ALPHA"),
            other => panic!("expected duplicate error, got {:?}", other),
        }
    }
}

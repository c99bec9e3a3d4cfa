//! Device hint parsing.
//!
//! A hint is the free-form string an operator (or a remote client, as the
//! `DEVICE` payload) uses to pick a backend and parameterize it:
//!
//! ```text
//! rtl 0 gain=20 serial="00000001" A
//! addr=192.168.10.2,B
//! -
//! ```
//!
//! [`HintParser`] turns a hint into a [`DeviceSpec`]: an upper-case module id,
//! a normalized argument list, and an optional sub-device selector. Which
//! module a hint maps to is decided by a pluggable [`HintMapper`].
//!
//! Arguments are normalized into `key=value` or bare values where every value
//! is either a number, a `0x`-prefixed hex integer, or a double-quoted string
//! with embedded quotes escaped. Arguments whose parentheses do not balance
//! outside quoted sections are dropped.

use std::fmt;
use std::sync::Arc;

/// Module used for an empty or `-` hint by [`DefaultHintMapper`].
pub const AUTO_MODULE: &str = "USRP_UHD";

/// Module used for a hint whose first token is an integer index.
pub const LEGACY_MODULE: &str = "USRP_LEGACY";

/// What a [`HintMapper`] resolved a hint to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleMapping {
    /// A module id; the hint's tokens become its arguments.
    Module(String),
    /// A module id with arguments already built by the mapper.
    Explicit {
        module_id: String,
        args: Vec<String>,
        subdevice: Option<String>,
    },
}

/// Resolves a hint to a module.
///
/// Deployments with their own backend sets install a custom mapper on the
/// device registry.
pub trait HintMapper: Send + Sync {
    fn map(&self, hint: &str) -> ModuleMapping;
}

/// The stock mapping.
///
/// - empty or `-` → [`AUTO_MODULE`]
/// - first token is an integer → [`LEGACY_MODULE`]
/// - first token contains `=` → [`AUTO_MODULE`] with the comma-separated
///   parts packaged as `addr="..."`, plus `subdev="..."` when a sub-device
///   selector is present (also kept in [`DeviceSpec::subdevice`])
/// - anything else → the first token, upper-cased
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHintMapper;

impl HintMapper for DefaultHintMapper {
    fn map(&self, hint: &str) -> ModuleMapping {
        let hint = hint.trim();
        if hint.is_empty() || hint == "-" {
            return ModuleMapping::Module(AUTO_MODULE.to_string());
        }
        let first = hint.split_whitespace().next().unwrap_or_default();
        if first.parse::<i64>().is_ok() {
            return ModuleMapping::Module(LEGACY_MODULE.to_string());
        }
        if first.contains('=') {
            let mut addr = Vec::new();
            let mut subdevice = None;
            for part in hint.split(',') {
                let part = part.trim();
                match subdevice_selector(part) {
                    Some(sel) => subdevice = Some(sel),
                    None => addr.push(part),
                }
            }
            let mut args = vec![format!("addr={}", quote(&addr.join(",")))];
            if let Some(sel) = &subdevice {
                args.push(format!("subdev={}", quote(sel)));
            }
            return ModuleMapping::Explicit {
                module_id: AUTO_MODULE.to_string(),
                args,
                subdevice,
            };
        }
        ModuleMapping::Module(first.to_ascii_uppercase())
    }
}

/// A parsed hint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSpec {
    /// Upper-case module id used for registry lookup.
    pub module_id: String,
    /// Normalized arguments, in hint order.
    pub args: Vec<String>,
    /// Sub-device selector such as `A:0`.
    pub subdevice: Option<String>,
}

impl DeviceSpec {
    pub fn new(module_id: impl Into<String>) -> Self {
        Self {
            module_id: module_id.into().to_ascii_uppercase(),
            args: Vec::new(),
            subdevice: None,
        }
    }

    /// The unquoted value of the first `key=value` argument named `key`
    /// (case-insensitive).
    pub fn value(&self, key: &str) -> Option<String> {
        self.args.iter().find_map(|arg| {
            let (k, v) = split_key(arg)?;
            k.eq_ignore_ascii_case(key).then(|| unquote(v))
        })
    }

    /// Unquoted arguments that are not `key=value` pairs.
    pub fn positional(&self) -> Vec<String> {
        self.args
            .iter()
            .filter(|arg| split_key(arg).is_none())
            .map(|arg| unquote(arg))
            .collect()
    }

    /// Re-serialize as a hint: `MODULE arg... [subdevice]`.
    pub fn to_hint(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 2);
        parts.push(self.module_id.as_str());
        parts.extend(self.args.iter().map(String::as_str));
        if let Some(sub) = &self.subdevice {
            parts.push(sub.as_str());
        }
        parts.join(" ")
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hint())
    }
}

/// Hint parser with a configurable default module and mapper.
#[derive(Clone)]
pub struct HintParser {
    default_module: Option<String>,
    mapper: Arc<dyn HintMapper>,
}

impl Default for HintParser {
    fn default() -> Self {
        Self {
            default_module: None,
            mapper: Arc::new(DefaultHintMapper),
        }
    }
}

impl fmt::Debug for HintParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HintParser")
            .field("default_module", &self.default_module)
            .finish_non_exhaustive()
    }
}

impl HintParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Module used for an empty or `-` hint instead of asking the mapper.
    pub fn with_default_module(mut self, module: impl Into<String>) -> Self {
        self.set_default_module(Some(module.into()));
        self
    }

    pub fn with_mapper(mut self, mapper: Arc<dyn HintMapper>) -> Self {
        self.mapper = mapper;
        self
    }

    pub fn set_default_module(&mut self, module: Option<String>) {
        self.default_module = module.filter(|m| !m.trim().is_empty());
    }

    pub fn set_mapper(&mut self, mapper: Arc<dyn HintMapper>) {
        self.mapper = mapper;
    }

    pub fn default_module(&self) -> Option<&str> {
        self.default_module.as_deref()
    }

    /// Parse a hint into a [`DeviceSpec`].
    pub fn parse(&self, hint: &str) -> DeviceSpec {
        let hint = hint.trim();
        let is_default = hint.is_empty() || hint == "-";

        let mapping = match (&self.default_module, is_default) {
            (Some(module), true) => ModuleMapping::Module(module.clone()),
            _ => self.mapper.map(hint),
        };

        let spec = match mapping {
            ModuleMapping::Explicit {
                module_id,
                args,
                subdevice,
            } => DeviceSpec {
                module_id: module_id.to_ascii_uppercase(),
                args: args.into_iter().filter(|a| parens_balanced(a)).collect(),
                subdevice,
            },
            ModuleMapping::Module(module_id) => {
                let module_id = module_id.to_ascii_uppercase();
                let mut tokens = tokenize(if is_default { "" } else { hint });
                if tokens
                    .first()
                    .is_some_and(|t| t.eq_ignore_ascii_case(&module_id))
                {
                    tokens.remove(0);
                }
                let mut args = Vec::with_capacity(tokens.len());
                let mut subdevice = None;
                for token in tokens {
                    if let Some(sel) = subdevice_selector(&token) {
                        subdevice = Some(sel);
                        continue;
                    }
                    let arg = normalize_arg(&token);
                    if parens_balanced(&arg) {
                        args.push(arg);
                    } else {
                        tracing::warn!(arg = %arg, "Dropping hint argument with unbalanced parentheses");
                    }
                }
                DeviceSpec {
                    module_id,
                    args,
                    subdevice,
                }
            }
        };

        tracing::debug!(hint = %hint, module = %spec.module_id, args = ?spec.args, "Parsed device hint");
        spec
    }
}

// ---------------------------------------------------------------------------
// Tokenizing and normalization
// ---------------------------------------------------------------------------

/// Byte positions of unescaped `"` characters.
fn find_quotes(s: &str) -> Vec<usize> {
    let mut quotes = Vec::new();
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '"' {
            quotes.push(i);
        }
    }
    quotes
}

/// `s` with every quoted section (quotes included) removed. An unterminated
/// quote removes the rest of the string.
fn remove_quoted(s: &str) -> String {
    let quotes = find_quotes(s);
    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for pair in quotes.chunks(2) {
        out.push_str(&s[last..pair[0]]);
        match pair.get(1) {
            Some(&close) => last = close + 1,
            None => return out,
        }
    }
    out.push_str(&s[last..]);
    out
}

fn parens_balanced(arg: &str) -> bool {
    let check = remove_quoted(arg);
    check.matches('(').count() == check.matches(')').count()
}

/// Split on whitespace, re-joining tokens while a quoted section is open.
fn tokenize(hint: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut open: Option<String> = None;
    for part in hint.split_whitespace() {
        match open.take() {
            Some(mut accum) => {
                accum.push(' ');
                accum.push_str(part);
                if find_quotes(&accum).len() % 2 == 0 {
                    tokens.push(accum);
                } else {
                    open = Some(accum);
                }
            }
            None if find_quotes(part).len() % 2 != 0 => open = Some(part.to_string()),
            None => tokens.push(part.to_string()),
        }
    }
    if let Some(accum) = open {
        tokens.push(accum);
    }
    tokens
}

/// `A` → `A:0`, `B:1` → `B:1`; anything else is not a sub-device selector.
fn subdevice_selector(token: &str) -> Option<String> {
    let mut chars = token.chars();
    let first = chars.next()?;
    if !first.is_ascii_alphabetic() {
        return None;
    }
    match chars.next() {
        None => Some(format!("{}:0", first)),
        Some(':') => Some(token.to_string()),
        Some(_) => None,
    }
}

/// Split at the first `=` that is not inside quotes.
fn split_key(arg: &str) -> Option<(&str, &str)> {
    let idx = arg.find('=')?;
    if find_quotes(arg).first().is_some_and(|&q| q < idx) {
        return None;
    }
    Some((&arg[..idx], &arg[idx + 1..]))
}

fn is_fully_quoted(value: &str) -> bool {
    let quotes = find_quotes(value);
    quotes.len() >= 2 && quotes[0] == 0 && quotes[quotes.len() - 1] == value.len() - 1
}

fn is_hex_integer(value: &str) -> bool {
    let digits = value.strip_prefix(['+', '-']).unwrap_or(value);
    let digits = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
        .unwrap_or(digits);
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_hexdigit())
}

fn has_hex_prefix(value: &str) -> bool {
    let lower = value.to_ascii_lowercase();
    lower.starts_with("0x") || lower.starts_with("-0x") || lower.starts_with("+0x")
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\\\""))
}

fn unquote(value: &str) -> String {
    if is_fully_quoted(value) {
        value[1..value.len() - 1].replace("\\\"", "\"")
    } else {
        value.to_string()
    }
}

/// Normalize one hint token into an argument.
fn normalize_arg(token: &str) -> String {
    let (key, value) = match split_key(token) {
        Some((k, v)) => (Some(k), v),
        None => (None, token),
    };

    let value = if is_fully_quoted(value) || value.parse::<f64>().is_ok() {
        value.to_string()
    } else if is_hex_integer(value) {
        if has_hex_prefix(value) {
            value.to_string()
        } else {
            format!("0x{}", value)
        }
    } else {
        quote(value)
    };

    match key {
        Some(k) => format!("{}={}", k, value),
        None => value,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(hint: &str) -> DeviceSpec {
        HintParser::new().parse(hint)
    }

    #[test]
    fn empty_and_dash_map_to_auto_module() {
        for hint in ["", "-", "  -  "] {
            let spec = parse(hint);
            assert_eq!(spec.module_id, AUTO_MODULE);
            assert!(spec.args.is_empty());
            assert_eq!(spec.subdevice, None);
        }
    }

    #[test]
    fn default_module_overrides_empty_hint_only() {
        let parser = HintParser::new().with_default_module("rtl");
        assert_eq!(parser.parse("-").module_id, "RTL");
        assert_eq!(parser.parse("").module_id, "RTL");
        assert_eq!(parser.parse("fcd").module_id, "FCD");
    }

    #[test]
    fn integer_first_token_maps_to_legacy() {
        let spec = parse("0 A");
        assert_eq!(spec.module_id, LEGACY_MODULE);
        assert_eq!(spec.args, vec!["0"]);
        assert_eq!(spec.subdevice.as_deref(), Some("A:0"));
    }

    #[test]
    fn named_module_drops_its_own_token() {
        let spec = parse("rtl 0 gain=20");
        assert_eq!(spec.module_id, "RTL");
        assert_eq!(spec.args, vec!["0", "gain=20"]);
    }

    #[test]
    fn address_hint_is_packaged() {
        let spec = parse("addr=192.168.10.2,B");
        assert_eq!(spec.module_id, AUTO_MODULE);
        assert_eq!(
            spec.args,
            vec![r#"addr="addr=192.168.10.2""#, r#"subdev="B:0""#]
        );
        assert_eq!(spec.subdevice.as_deref(), Some("B:0"));
        assert_eq!(spec.value("addr").as_deref(), Some("addr=192.168.10.2"));
        assert_eq!(spec.value("subdev").as_deref(), Some("B:0"));

        let spec = parse("serial=1234, type=b200, A:1");
        assert_eq!(
            spec.args,
            vec![r#"addr="serial=1234,type=b200""#, r#"subdev="A:1""#]
        );
        assert_eq!(spec.subdevice.as_deref(), Some("A:1"));

        let spec = parse("addr=10.0.0.9");
        assert_eq!(spec.args, vec![r#"addr="addr=10.0.0.9""#]);
        assert_eq!(spec.value("subdev"), None);
    }

    #[test]
    fn values_are_quoted_unless_numeric() {
        let spec = parse("rtl name=hello freq=1e6 level=-3.5");
        assert_eq!(
            spec.args,
            vec![r#"name="hello""#, "freq=1e6", "level=-3.5"]
        );
    }

    #[test]
    fn hex_values_gain_prefix() {
        let spec = parse("rtl serial=beef id=0x1F");
        assert_eq!(spec.args, vec!["serial=0xbeef", "id=0x1F"]);
    }

    #[test]
    fn embedded_quotes_are_escaped() {
        let spec = parse(r#"rtl label=a"b"#);
        // An odd quote count swallows the rest of the hint.
        assert_eq!(spec.args.len(), 1);

        let spec = parse(r#"rtl label=x"y"z"#);
        assert_eq!(spec.args, vec![r#"label="x\"y\"z""#]);
    }

    #[test]
    fn quoted_values_span_spaces() {
        let spec = parse(r#"rtl name="two words" 5"#);
        assert_eq!(spec.args, vec![r#"name="two words""#, "5"]);
        assert_eq!(spec.value("name").as_deref(), Some("two words"));
        assert_eq!(spec.positional(), vec!["5"]);
    }

    #[test]
    fn unbalanced_parentheses_are_dropped() {
        let spec = parse(r#"rtl ok="(fine" f(x=1 "a"("b" y=2"#);
        assert_eq!(spec.args, vec![r#"ok="(fine""#, "y=2"]);

        // Quoting an unbalanced value neutralizes it.
        let spec = parse("rtl x=evil(1");
        assert_eq!(spec.args, vec![r#"x="evil(1""#]);
    }

    #[test]
    fn equals_inside_quotes_is_not_a_key() {
        let spec = parse(r#"rtl "a=b""#);
        assert_eq!(spec.args, vec![r#""a=b""#]);
        assert_eq!(spec.value("a"), None);
    }

    #[test]
    fn custom_mapper_is_used() {
        struct Everything;
        impl HintMapper for Everything {
            fn map(&self, _hint: &str) -> ModuleMapping {
                ModuleMapping::Module("sim".into())
            }
        }
        let parser = HintParser::new().with_mapper(Arc::new(Everything));
        let spec = parser.parse("whatever 3");
        assert_eq!(spec.module_id, "SIM");
        assert_eq!(spec.args, vec![r#""whatever""#, "3"]);
    }

    #[test]
    fn remove_quoted_sections() {
        assert_eq!(remove_quoted(r#"a"(b"c"#), "ac");
        assert_eq!(remove_quoted(r#"a"open"#), "a");
        assert_eq!(remove_quoted(r#"a\"b"#), r#"a\"b"#);
    }

    #[test]
    fn reparse_is_idempotent() {
        let hints = [
            "",
            "-",
            "rtl",
            "RTL 0 gain=20",
            r#"rtl name="two words" serial=beef A"#,
            r#"fcd label=x"y"z 1e3 B:1"#,
            "addr=192.168.10.2,B",
            "sim rate=2.4e6 \"already quoted\" 0x20",
            r#"sim weird=a(b) ok=1"#,
        ];
        let parser = HintParser::new();
        for hint in hints {
            let first = parser.parse(hint);
            let second = parser.parse(&first.to_hint());
            assert_eq!(first, second, "hint {:?} -> {:?}", hint, first.to_hint());
        }
    }
}

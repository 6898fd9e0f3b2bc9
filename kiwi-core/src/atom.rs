//! Dynamic values for object arguments and messages, with the text
//! parser/printer used by object boxes.
//!
//! ```text
//! "foo $1, 42 -3.5"  ──parse(COMMA | DOLLAR)──►  [foo, $1, ',', 42, -3.5]
//!                    ◄──────to_string─────────
//! ```

use std::fmt;
use std::ops::BitOr;

use serde::{Deserialize, Serialize};

/// Tagged dynamic value.
///
/// `Comma` and `Dollar` are structural markers for message templates.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Atom {
    #[default]
    Null,
    Int(i64),
    Float(f64),
    String(String),
    Comma,
    /// Argument reference, index in `1..=9`
    Dollar(u8),
}

impl Atom {
    /// `$index`, or `Null` when the index is outside `1..=9`.
    pub fn dollar(index: i64) -> Self {
        if (1..=9).contains(&index) {
            Atom::Dollar(index as u8)
        } else {
            Atom::Null
        }
    }

    pub fn string(value: impl Into<String>) -> Self {
        Atom::String(value.into())
    }

    pub fn bang() -> Self {
        Atom::String("bang".to_string())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Atom::Null)
    }

    pub fn is_int(&self) -> bool {
        matches!(self, Atom::Int(_))
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Atom::Float(_))
    }

    pub fn is_number(&self) -> bool {
        self.is_int() || self.is_float()
    }

    pub fn is_string(&self) -> bool {
        matches!(self, Atom::String(_))
    }

    pub fn is_bang(&self) -> bool {
        matches!(self, Atom::String(s) if s == "bang")
    }

    pub fn is_comma(&self) -> bool {
        matches!(self, Atom::Comma)
    }

    pub fn is_dollar(&self) -> bool {
        matches!(self, Atom::Dollar(_))
    }

    /// Integer value; floats are truncated, other kinds give 0.
    pub fn as_int(&self) -> i64 {
        match self {
            Atom::Int(value) => *value,
            Atom::Float(value) => *value as i64,
            _ => 0,
        }
    }

    /// Float value; ints are widened, other kinds give 0.
    pub fn as_float(&self) -> f64 {
        match self {
            Atom::Int(value) => *value as f64,
            Atom::Float(value) => *value,
            _ => 0.0,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Atom::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn dollar_index(&self) -> Option<u8> {
        match self {
            Atom::Dollar(index) => Some(*index),
            _ => None,
        }
    }
}

impl From<i64> for Atom {
    fn from(value: i64) -> Self {
        Atom::Int(value)
    }
}

impl From<i32> for Atom {
    fn from(value: i32) -> Self {
        Atom::Int(value as i64)
    }
}

impl From<f64> for Atom {
    fn from(value: f64) -> Self {
        Atom::Float(value)
    }
}

impl From<&str> for Atom {
    fn from(value: &str) -> Self {
        Atom::String(value.to_string())
    }
}

impl From<String> for Atom {
    fn from(value: String) -> Self {
        Atom::String(value)
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Atom::Null => Ok(()),
            Atom::Int(value) => write!(f, "{value}"),
            Atom::Float(value) => f.write_str(&format_float(*value)),
            Atom::String(value) => f.write_str(value),
            Atom::Comma => f.write_str(","),
            Atom::Dollar(index) => write!(f, "${index}"),
        }
    }
}

/// Parser options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ParsingFlags(u8);

impl ParsingFlags {
    pub const NONE: ParsingFlags = ParsingFlags(0);
    /// Unquoted `,` ends a token and yields [`Atom::Comma`].
    pub const COMMA: ParsingFlags = ParsingFlags(1);
    /// `$1`..`$9` yield [`Atom::Dollar`].
    pub const DOLLAR: ParsingFlags = ParsingFlags(1 << 1);
    pub const ALL: ParsingFlags = ParsingFlags(0b11);

    pub fn contains(self, other: ParsingFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ParsingFlags {
    type Output = ParsingFlags;

    fn bitor(self, rhs: ParsingFlags) -> ParsingFlags {
        ParsingFlags(self.0 | rhs.0)
    }
}

fn is_whitespace(c: char) -> bool {
    c == ' ' || ('\u{9}'..='\u{d}').contains(&c)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum NumberState {
    Start,
    Minus,
    Digit,
    DotWithoutDigit,
    DotAfterDigit,
    DigitAfterDot,
    Expon,
    PlusMinusAfterExpon,
    DigitAfterExpon,
    NotANumber,
}

fn classify_number(token: &str) -> NumberState {
    use NumberState::*;

    let mut state = Start;
    for c in token.chars() {
        state = match (state, c) {
            (Start, '-') => Minus,
            (Start | Minus | Digit, '0'..='9') => Digit,
            (Start | Minus, '.') => DotWithoutDigit,
            (Digit, '.') => DotAfterDigit,
            (DotWithoutDigit | DotAfterDigit | DigitAfterDot, '0'..='9') => DigitAfterDot,
            (Digit | DotAfterDigit | DigitAfterDot, 'e' | 'E') => Expon,
            (Expon, '+' | '-') => PlusMinusAfterExpon,
            (Expon | PlusMinusAfterExpon | DigitAfterExpon, '0'..='9') => DigitAfterExpon,
            _ => NotANumber,
        };
        if state == NotANumber {
            break;
        }
    }
    state
}

fn classify_dollar(token: &str) -> Option<u8> {
    let bytes = token.as_bytes();
    match bytes {
        [b'$', digit @ b'1'..=b'9'] => Some(digit - b'0'),
        _ => None,
    }
}

fn token_to_atom(token: &str, flags: ParsingFlags) -> Atom {
    if flags.contains(ParsingFlags::DOLLAR) {
        if let Some(index) = classify_dollar(token) {
            return Atom::Dollar(index);
        }
    }

    match classify_number(token) {
        NumberState::Digit => match token.parse::<i64>() {
            Ok(value) => Atom::Int(value),
            Err(_) => token
                .parse::<f64>()
                .map(Atom::Float)
                .unwrap_or_else(|_| Atom::String(token.to_string())),
        },
        NumberState::DotAfterDigit | NumberState::DigitAfterDot | NumberState::DigitAfterExpon => {
            token
                .parse::<f64>()
                .map(Atom::Float)
                .unwrap_or_else(|_| Atom::String(token.to_string()))
        }
        _ => Atom::String(token.to_string()),
    }
}

struct Tokenizer {
    atoms: Vec<Atom>,
    token: String,
    started: bool,
    quoted: bool,
    escaped: bool,
    flags: ParsingFlags,
}

impl Tokenizer {
    fn flush(&mut self) {
        if self.started {
            let token = std::mem::take(&mut self.token);
            let atom = if self.quoted || self.escaped {
                Atom::String(token)
            } else {
                token_to_atom(&token, self.flags)
            };
            self.atoms.push(atom);
        }
        self.started = false;
        self.quoted = false;
        self.escaped = false;
    }
}

/// Parse object or message text into atoms.
pub fn parse(text: &str, flags: ParsingFlags) -> Vec<Atom> {
    let mut tokenizer = Tokenizer {
        atoms: Vec::new(),
        token: String::new(),
        started: false,
        quoted: false,
        escaped: false,
        flags,
    };
    let mut in_quotes = false;
    let mut chars = text.chars();

    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                tokenizer.token.push(next);
                tokenizer.started = true;
                tokenizer.escaped = true;
            }
            continue;
        }

        if in_quotes {
            if c == '"' {
                in_quotes = false;
                tokenizer.flush();
            } else {
                tokenizer.token.push(c);
            }
            continue;
        }

        if c == '"' && !tokenizer.started {
            in_quotes = true;
            tokenizer.started = true;
            tokenizer.quoted = true;
        } else if is_whitespace(c) {
            tokenizer.flush();
        } else if c == ',' && flags.contains(ParsingFlags::COMMA) {
            tokenizer.flush();
            tokenizer.atoms.push(Atom::Comma);
        } else {
            tokenizer.token.push(c);
            tokenizer.started = true;
        }
    }

    tokenizer.flush();
    tokenizer.atoms
}

/// Shortest round-trip text of a float with trailing zeros trimmed.
fn format_float(value: f64) -> String {
    let text = format!("{value:?}");
    if text.contains(['e', 'E']) || !text.contains('.') {
        return text;
    }
    text.trim_end_matches('0').to_string()
}

fn needs_quotes(value: &str) -> bool {
    value.is_empty() || value.chars().any(is_whitespace)
}

fn write_string(output: &mut String, value: &str, add_quotes: bool) {
    if !add_quotes {
        output.push_str(value);
        return;
    }

    let quoted = needs_quotes(value);
    if quoted {
        output.push('"');
    }
    for (index, c) in value.chars().enumerate() {
        match c {
            '\\' => output.push_str("\\\\"),
            '"' if quoted || index == 0 => output.push_str("\\\""),
            _ => output.push(c),
        }
    }
    if quoted {
        output.push('"');
    }
}

/// Render atoms back to text.
///
/// Commas stick to the previous token and are followed by a space.
pub fn to_string(atoms: &[Atom], add_quotes: bool) -> String {
    let mut output = String::new();

    for (index, atom) in atoms.iter().enumerate() {
        if index > 0 && !atom.is_comma() {
            output.push(' ');
        }
        match atom {
            Atom::String(value) => write_string(&mut output, value, add_quotes),
            other => output.push_str(&other.to_string()),
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(value: &str) -> Atom {
        Atom::string(value)
    }

    #[test]
    fn test_constructors_and_accessors() {
        assert!(Atom::default().is_null());
        assert_eq!(Atom::from(42).as_int(), 42);
        assert_eq!(Atom::from(42).as_float(), 42.0);
        assert_eq!(Atom::from(3.9).as_int(), 3);
        assert!(Atom::from(3.9).is_number());
        assert!(Atom::bang().is_bang());
        assert_eq!(s("foo").as_str(), Some("foo"));
        assert_eq!(s("foo").as_int(), 0);
    }

    #[test]
    fn test_dollar_range() {
        assert_eq!(Atom::dollar(1), Atom::Dollar(1));
        assert_eq!(Atom::dollar(9).dollar_index(), Some(9));
        assert!(Atom::dollar(0).is_null());
        assert!(Atom::dollar(10).is_null());
        assert!(Atom::dollar(-1).is_null());
    }

    #[test]
    fn test_parse_mixed_line() {
        let atoms = parse("foo \"bar 42\" 1 -2 3.14 -3.14", ParsingFlags::NONE);
        assert_eq!(
            atoms,
            vec![
                s("foo"),
                s("bar 42"),
                Atom::Int(1),
                Atom::Int(-2),
                Atom::Float(3.14),
                Atom::Float(-3.14),
            ]
        );
    }

    #[test]
    fn test_parse_numbers() {
        let parse_one = |text: &str| parse(text, ParsingFlags::NONE).remove(0);

        assert_eq!(parse_one("000101"), Atom::Int(101));
        assert_eq!(parse_one("000.101"), Atom::Float(0.101));
        assert_eq!(parse_one(".001"), Atom::Float(0.001));
        assert_eq!(parse_one("-.001"), Atom::Float(-0.001));
        assert_eq!(parse_one("1."), Atom::Float(1.0));
        assert_eq!(parse_one("6.02e23"), Atom::Float(6.02e23));
        assert_eq!(parse_one("1e-3"), Atom::Float(0.001));
        assert_eq!(parse_one("-"), s("-"));
        assert_eq!(parse_one("."), s("."));
        assert_eq!(parse_one("0.001."), s("0.001."));
        assert_eq!(parse_one("1e"), s("1e"));
        assert_eq!(parse_one("12abc"), s("12abc"));
    }

    #[test]
    fn test_int_overflow_becomes_float() {
        let atoms = parse("99999999999999999999", ParsingFlags::NONE);
        assert!(atoms[0].is_float());
    }

    #[test]
    fn test_whitespace_only() {
        assert!(parse("", ParsingFlags::NONE).is_empty());
        assert!(parse(" \t\n\r  ", ParsingFlags::ALL).is_empty());
    }

    #[test]
    fn test_quoted_special_whitespace_roundtrip() {
        let atoms = vec![s("a\tb\nc")];
        let text = to_string(&atoms, true);
        assert_eq!(text, "\"a\tb\nc\"");
        assert_eq!(parse(&text, ParsingFlags::NONE), atoms);
    }

    #[test]
    fn test_backslashes_are_stripped() {
        let atoms = parse("\\0\\a\\b\\c\\z", ParsingFlags::NONE);
        assert_eq!(atoms, vec![s("0abcz")]);
    }

    #[test]
    fn test_escaped_quotes_inside_string() {
        let text = r#""name: \"toto\"""#;
        let atoms = parse(text, ParsingFlags::NONE);
        assert_eq!(atoms, vec![s("name: \"toto\"")]);
        assert_eq!(atoms[0].to_string(), "name: \"toto\"");
        assert_eq!(to_string(&atoms, true), text);
    }

    #[test]
    fn test_comma_without_flag() {
        let atoms = parse("0, 10", ParsingFlags::NONE);
        assert_eq!(atoms, vec![s("0,"), Atom::Int(10)]);
        assert_eq!(to_string(&atoms, true), "0, 10");
    }

    #[test]
    fn test_comma_with_flag() {
        let atoms = parse("0, 10", ParsingFlags::COMMA);
        assert_eq!(atoms, vec![Atom::Int(0), Atom::Comma, Atom::Int(10)]);

        let glued = parse("0,10", ParsingFlags::COMMA);
        assert_eq!(glued, atoms);
        assert_eq!(to_string(&glued, true), "0, 10");

        let commas = parse(",,,", ParsingFlags::COMMA);
        assert_eq!(commas, vec![Atom::Comma, Atom::Comma, Atom::Comma]);
        assert_eq!(to_string(&commas, true), ",,,");
    }

    #[test]
    fn test_quoted_comma_is_text() {
        let atoms = parse("\"a, b\"", ParsingFlags::COMMA);
        assert_eq!(atoms, vec![s("a, b")]);
    }

    #[test]
    fn test_dollar_without_flag() {
        let atoms = parse("$1 $9", ParsingFlags::NONE);
        assert_eq!(atoms, vec![s("$1"), s("$9")]);
    }

    #[test]
    fn test_invalid_dollars() {
        let atoms = parse("$0 a$1 $10 $-1 $ $$", ParsingFlags::DOLLAR);
        assert_eq!(atoms.len(), 6);
        assert!(atoms.iter().all(Atom::is_string));
    }

    #[test]
    fn test_valid_dollars() {
        let atoms = parse("$1 $2 $3 $4 $5 $6 $7 $8 $9", ParsingFlags::DOLLAR);
        let expected: Vec<Atom> = (1..=9).map(Atom::dollar).collect();
        assert_eq!(atoms, expected);
        assert_eq!(to_string(&atoms, true), "$1 $2 $3 $4 $5 $6 $7 $8 $9");
    }

    #[test]
    fn test_dollar_and_comma() {
        let both = parse("$1, $2", ParsingFlags::DOLLAR | ParsingFlags::COMMA);
        assert_eq!(both, vec![Atom::Dollar(1), Atom::Comma, Atom::Dollar(2)]);

        let dollar_only = parse("$1, $2", ParsingFlags::DOLLAR);
        assert_eq!(dollar_only, vec![s("$1,"), Atom::Dollar(2)]);
    }

    #[test]
    fn test_float_printing() {
        assert_eq!(Atom::Float(1.0).to_string(), "1.");
        assert_eq!(Atom::Float(1.5).to_string(), "1.5");
        assert_eq!(Atom::Float(-0.25).to_string(), "-0.25");

        let atoms = parse(".001000", ParsingFlags::NONE);
        assert_eq!(to_string(&atoms, true), "0.001");
    }

    #[test]
    fn test_empty_string_is_quoted() {
        let atoms = vec![s(""), Atom::Int(1)];
        let text = to_string(&atoms, true);
        assert_eq!(text, "\"\" 1");
        assert_eq!(parse(&text, ParsingFlags::NONE), atoms);
    }

    #[test]
    fn test_normalization_is_stable() {
        let samples = [
            "foo $1, bang",
            "+ 42",
            "dac~ 1 2 3:4",
            "\"hello world\" 0.5 -7 ,,x",
            "a\\\\b \"c\\\"d\"",
            "6.02e23 -1e-7 1.",
        ];

        for text in samples {
            let first = parse(text, ParsingFlags::ALL);
            let printed = to_string(&first, true);
            assert_eq!(parse(&printed, ParsingFlags::ALL), first, "text: {text}");
        }
    }
}

//! Declarative test-line parser
//!
//! Turns lines of the form
//!
//! ```text
//! <target> must run <protocol> [with <name> <value>]...
//! ```
//!
//! into [`Test`] values. Values may be bare words or quoted with `'` or `"`.
//! Blank lines and `#` comments are skipped. The protocol must be registered,
//! and every argument must be declared by that probe and match its pattern.

use log::debug;
use regex::Regex;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::sync::{Arc, Mutex};

use crate::core::{self, Test};
use crate::error::ParseError;

/// Path that selects standard input
pub const STDIN_PATH: &str = "-";

/// Compiled argument patterns of one protocol, keyed by argument name
type Schema = HashMap<String, (String, Regex)>;

/// Parser for declarative test lines
///
/// Argument schemas are compiled the first time a protocol is seen and reused
/// for the life of the parser.
pub struct TestParser {
    line: Regex,
    argument: Regex,
    schemas: Mutex<HashMap<String, Arc<Schema>>>,
}

impl Default for TestParser {
    fn default() -> Self {
        Self::new()
    }
}

impl TestParser {
    pub fn new() -> Self {
        Self {
            line: Regex::new(r"^(?P<target>\S+)\s+must\s+run\s+(?P<protocol>\S+)(?P<rest>.*)$")
                .expect("line pattern is valid"),
            argument: Regex::new(
                r#"^\s+with\s+(?P<name>[A-Za-z0-9_-]+)\s+(?:'(?P<single>[^']*)'|"(?P<double>[^"]*)"|(?P<bare>[^\s'"]\S*))"#,
            )
            .expect("argument pattern is valid"),
            schemas: Mutex::new(HashMap::new()),
        }
    }

    /// Compiled schema for `protocol`, building it from the registry on first use
    fn schema(&self, protocol: &str, number: usize) -> Result<Arc<Schema>, ParseError> {
        let mut schemas = self.schemas.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(schema) = schemas.get(protocol) {
            return Ok(Arc::clone(schema));
        }

        let probe = core::lookup(protocol).ok_or_else(|| ParseError::UnknownProtocol {
            line: number,
            protocol: protocol.to_string(),
            known: core::list_probes().join(", "),
        })?;

        let mut schema = Schema::new();
        for (name, pattern) in probe.arguments() {
            let compiled = Regex::new(pattern).map_err(|e| ParseError::Syntax {
                line: number,
                message: format!("protocol '{}' declares a bad pattern for '{}': {}", protocol, name, e),
            })?;
            schema.insert(name.to_string(), (pattern.to_string(), compiled));
        }

        let schema = Arc::new(schema);
        schemas.insert(protocol.to_string(), Arc::clone(&schema));
        debug!("Compiled {} argument pattern(s) for {}", schema.len(), protocol);
        Ok(schema)
    }

    /// Parse one line; `Ok(None)` for blank lines and comments
    pub fn parse_line(&self, line: &str, number: usize) -> Result<Option<Test>, ParseError> {
        let input = line.trim();
        if input.is_empty() || input.starts_with('#') {
            return Ok(None);
        }

        let caps = self.line.captures(input).ok_or_else(|| ParseError::Syntax {
            line: number,
            message: format!("expected '<target> must run <protocol>', found '{}'", input),
        })?;

        let protocol = &caps["protocol"];
        let schema = self.schema(protocol, number)?;

        let mut test = Test::new(&caps["target"], protocol, input);
        let mut rest = caps.name("rest").map_or("", |m| m.as_str());

        while !rest.trim().is_empty() {
            let arg = self.argument.captures(rest).ok_or_else(|| ParseError::Syntax {
                line: number,
                message: format!("cannot parse arguments near '{}'", rest.trim()),
            })?;

            let name = &arg["name"];
            let value = ["single", "double", "bare"]
                .iter()
                .find_map(|group| arg.name(group))
                .map_or("", |m| m.as_str());

            let (pattern, validator) = schema.get(name).ok_or_else(|| ParseError::UnknownArgument {
                line: number,
                protocol: protocol.to_string(),
                argument: name.to_string(),
            })?;
            if !validator.is_match(value) {
                return Err(ParseError::InvalidValue {
                    line: number,
                    argument: name.to_string(),
                    value: value.to_string(),
                    pattern: pattern.to_string(),
                });
            }

            if test.arguments.contains_key(name) {
                return Err(ParseError::Syntax {
                    line: number,
                    message: format!("argument '{}' given more than once", name),
                });
            }
            test.arguments.insert(name.to_string(), value.to_string());

            rest = &rest[arg.get(0).map_or(rest.len(), |m| m.end())..];
        }

        debug!("Parsed {} test for {} with {} argument(s)", test.protocol, test.target, test.arguments.len());
        Ok(Some(test))
    }

    /// Iterate over the tests of a reader, in order
    pub fn tests<R: BufRead>(&self, reader: R, source_name: &str) -> Tests<'_, R> {
        Tests {
            parser: self,
            lines: reader.lines(),
            number: 0,
            source_name: source_name.to_string(),
        }
    }

    /// Read every test from a file, or from standard input for `-`
    pub fn parse_path(&self, path: &str) -> Result<Vec<Test>, ParseError> {
        let reader = open_source(path)?;
        self.tests(reader, path).collect()
    }
}

/// Open a test-definition source for reading
pub fn open_source(path: &str) -> Result<Box<dyn BufRead + Send>, ParseError> {
    if path == STDIN_PATH {
        return Ok(Box::new(BufReader::new(std::io::stdin())));
    }
    let file = File::open(path).map_err(|error| ParseError::Read {
        source_name: path.to_string(),
        error,
    })?;
    Ok(Box::new(BufReader::new(file)))
}

/// Streaming iterator over parsed tests
///
/// Yields each test as soon as its line is parsed, so callers can act on the
/// lines before a later syntax error.
pub struct Tests<'a, R: BufRead> {
    parser: &'a TestParser,
    lines: Lines<R>,
    number: usize,
    source_name: String,
}

impl<'a, R: BufRead> Iterator for Tests<'a, R> {
    type Item = Result<Test, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(error) => {
                    return Some(Err(ParseError::Read {
                        source_name: self.source_name.clone(),
                        error,
                    }))
                }
            };
            self.number += 1;

            match self.parser.parse_line(&line, self.number) {
                Ok(Some(test)) => return Some(Ok(test)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_parse_dns_line() {
        let parser = TestParser::new();
        let line = "ns.example.com must run dns with lookup test.example.com with type A with result '1.2.3.4'";
        let test = parser.parse_line(line, 1).unwrap().unwrap();

        assert_eq!(test.target, "ns.example.com");
        assert_eq!(test.protocol, "dns");
        assert_eq!(test.input, line);
        assert_eq!(test.argument("lookup"), "test.example.com");
        assert_eq!(test.argument("type"), "A");
        assert_eq!(test.argument("result"), "1.2.3.4");
    }

    #[test]
    fn test_empty_quoted_value() {
        let parser = TestParser::new();
        let line = "ns.example.com must run dns with lookup www.example.com with type AAAA with result ''";
        let test = parser.parse_line(line, 1).unwrap().unwrap();
        assert_eq!(test.arguments.get("result"), Some(&String::new()));
    }

    #[test]
    fn test_double_quoted_value_with_spaces() {
        let parser = TestParser::new();
        let line = r#"mail.example.com must run imaps with username "steve" with password "two words""#;
        let test = parser.parse_line(line, 1).unwrap().unwrap();
        assert_eq!(test.argument("password"), "two words");
    }

    #[test]
    fn test_skips_comments_and_blanks() {
        let parser = TestParser::new();
        assert!(parser.parse_line("", 1).unwrap().is_none());
        assert!(parser.parse_line("   ", 2).unwrap().is_none());
        assert!(parser.parse_line("# a comment", 3).unwrap().is_none());
    }

    #[test]
    fn test_reparse_input_is_stable() {
        let parser = TestParser::new();
        let line = "  mail.example.com must run imaps with port 993 with tls insecure  ";
        let first = parser.parse_line(line, 1).unwrap().unwrap();
        let second = parser.parse_line(&first.input, 1).unwrap().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_unknown_protocol() {
        let parser = TestParser::new();
        let err = parser.parse_line("host must run gopher", 7).unwrap_err();
        assert!(matches!(err, ParseError::UnknownProtocol { line: 7, .. }));
        assert!(err.to_string().contains("dns"));
    }

    #[test]
    fn test_unknown_argument() {
        let parser = TestParser::new();
        let err = parser.parse_line("host must run imaps with colour blue", 1).unwrap_err();
        assert!(matches!(err, ParseError::UnknownArgument { .. }));
    }

    #[test]
    fn test_value_must_match_pattern() {
        let parser = TestParser::new();
        let err = parser.parse_line("host must run imaps with port abc", 1).unwrap_err();
        assert!(matches!(err, ParseError::InvalidValue { .. }));

        let err = parser
            .parse_line("ns.example.com must run dns with lookup x with type SRV", 1)
            .unwrap_err();
        assert!(matches!(err, ParseError::InvalidValue { .. }));
    }

    #[test]
    fn test_syntax_errors() {
        let parser = TestParser::new();
        assert!(matches!(
            parser.parse_line("just some words", 4),
            Err(ParseError::Syntax { line: 4, .. })
        ));
        assert!(matches!(
            parser.parse_line("host must run imaps with port", 1),
            Err(ParseError::Syntax { .. })
        ));
        assert!(matches!(
            parser.parse_line("host must run imaps with port 1 with port 2", 1),
            Err(ParseError::Syntax { .. })
        ));
    }

    #[test]
    fn test_schema_compiled_once_per_protocol() {
        let parser = TestParser::new();
        for line in [
            "a.example.com must run imaps with port 993",
            "b.example.com must run imaps with tls insecure",
            "ns.example.com must run dns with lookup example.com with type A",
        ] {
            parser.parse_line(line, 1).unwrap();
        }

        let schemas = parser.schemas.lock().unwrap();
        assert_eq!(schemas.len(), 2);
        assert!(schemas["imaps"].contains_key("port"));
        assert!(!schemas.contains_key("gopher"));
    }

    #[test]
    fn test_iterator_keeps_file_order_and_line_numbers() {
        let parser = TestParser::new();
        let source = "# header\n\
                      a.example.com must run imaps\n\
                      \n\
                      b.example.com must run imaps with tls insecure\n\
                      broken line\n\
                      c.example.com must run imaps\n";
        let results: Vec<_> = parser.tests(Cursor::new(source), "inline").collect();

        assert_eq!(results.len(), 4);
        assert_eq!(results[0].as_ref().unwrap().target, "a.example.com");
        assert_eq!(results[1].as_ref().unwrap().target, "b.example.com");
        assert!(matches!(results[2], Err(ParseError::Syntax { line: 5, .. })));
        assert_eq!(results[3].as_ref().unwrap().target, "c.example.com");
    }
}
